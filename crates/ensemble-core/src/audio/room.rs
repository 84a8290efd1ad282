//! A single rehearsal room: participant directory, RT mix loop, fast path
//!
//! Each room owns one [`Mixer`] and one real-time mix thread. Audio
//! arriving from a participant either takes the two-party fast path
//! (direct forward, no rings touched) or lands in the mixer's ingress
//! rings for the next cycle. The mix thread is event-driven: every ingress
//! push bumps a counter and, once all current participants have delivered,
//! posts a wake; a timeout slightly above one frame period catches
//! stragglers so at least one cycle runs per period regardless.
//!
//! # Real-Time Safety
//!
//! The mix thread promotes itself to `SCHED_FIFO` and pins to a core on
//! Linux (degraded jitter elsewhere, logged once). On the loop itself:
//!
//! - No allocation: scratch buffers and the pending-send list are sized
//!   before the loop starts
//! - Short locks only: the participant map is held long enough to pop
//!   egress frames and stamp sequences, never across network I/O
//! - No error propagation: a failed send or a missing frame is this
//!   cycle's loss, nothing else

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, Sender};

use crate::audio::mixer::Mixer;
use crate::error::{Error, Result};
use crate::protocol::{ParticipantEntry, ServerMessage};
use crate::transport::TransportSession;
use crate::types::{AudioFrame, AUDIO_PACKET_SIZE};

/// Wake timeout for the mix loop: slightly above one 2.667ms frame period
/// so a cycle still runs when a participant's frame goes missing.
const MIX_WAKE_TIMEOUT: Duration = Duration::from_millis(3);

/// How long an HTTP-joined participant may stay without a bound transport
/// session before the reaper evicts them. Must comfortably exceed the
/// expected bind latency.
const UNBOUND_TIMEOUT: Duration = Duration::from_secs(120);

/// How long a bound participant may stay with no audio in either direction
/// before the reaper evicts them. Solo participants are exempt.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

/// Room state as seen by the lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
    /// No password, anyone can join
    Open,
    /// Has a password
    Claimed,
    /// At max capacity
    Full,
}

/// Participant info for room-state messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub id: String,
    pub alias: String,
}

struct Participant {
    alias: String,
    /// Absent between the HTTP join and the transport bind.
    session: Option<Arc<dyn TransportSession>>,
    /// Monotonic per-listener counter stamped onto outgoing packets.
    output_sequence: u32,
    join_time: Instant,
    last_audio_received: Option<Instant>,
    last_audio_sent: Option<Instant>,
}

/// Pre-sized send slot so `send_outputs` serializes under the lock and
/// sends outside it without allocating.
struct PendingSend {
    session: Arc<dyn TransportSession>,
    buf: [u8; AUDIO_PACKET_SIZE],
}

/// A single rehearsal room with its own mixer and RT thread.
pub struct Room {
    name: String,
    max_participants: usize,
    mixer: Mixer,
    participants: Mutex<HashMap<String, Participant>>,
    /// Empty string means the room is open.
    password: Mutex<String>,
    running: AtomicBool,
    mix_thread: Mutex<Option<JoinHandle<()>>>,
    /// Wake primitive for the event-driven mix loop.
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    /// Ingress pushes this cycle; a wake fires when it reaches the
    /// participant count.
    frames_received: AtomicU32,
}

impl Room {
    pub fn new(name: &str, max_participants: usize) -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            name: name.to_string(),
            max_participants,
            mixer: Mixer::new(max_participants),
            participants: Mutex::new(HashMap::new()),
            password: Mutex::new(String::new()),
            running: AtomicBool::new(false),
            mix_thread: Mutex::new(None),
            wake_tx,
            wake_rx,
            frames_received: AtomicU32::new(0),
        }
    }

    /// Start the mix thread. Idempotent.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let room = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("mix-{}", self.name))
            .spawn(move || room.mix_loop())
            .map_err(|source| {
                self.running.store(false, Ordering::Release);
                Error::ThreadSpawn {
                    name: format!("mix-{}", self.name),
                    source,
                }
            })?;
        *self.mix_thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop the mix thread and join it. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let handle = self.mix_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_participants(&self) -> usize {
        self.max_participants
    }

    pub fn participant_count(&self) -> usize {
        self.participants.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.participant_count() == 0
    }

    pub fn is_full(&self) -> bool {
        self.participant_count() >= self.max_participants
    }

    /// Admit a participant. Fails when the room is full or the id is
    /// already present. Existing occupants get a `participant_joined`
    /// broadcast; the newcomer (if already bound) gets `room_state`.
    pub fn add_participant(
        &self,
        id: &str,
        alias: &str,
        session: Option<Arc<dyn TransportSession>>,
    ) -> bool {
        let mut participants = self.participants.lock().unwrap();
        if participants.len() >= self.max_participants || participants.contains_key(id) {
            return false;
        }

        self.mixer.add_participant(id);
        participants.insert(
            id.to_string(),
            Participant {
                alias: alias.to_string(),
                session,
                output_sequence: 0,
                join_time: Instant::now(),
                last_audio_received: None,
                last_audio_sent: None,
            },
        );

        let joined = ServerMessage::ParticipantJoined {
            id: id.to_string(),
            name: alias.to_string(),
        }
        .to_json();
        for (pid, participant) in participants.iter() {
            if pid != id {
                if let Some(session) = &participant.session {
                    session.send_reliable(&joined);
                }
            }
        }

        if let Some(session) = participants.get(id).and_then(|p| p.session.as_ref()) {
            session.send_reliable(&room_state_message(&participants).to_json());
        }

        log::info!("[{}] participant joined: {} ({})", self.name, alias, id);
        true
    }

    /// Bind a transport session to an already-admitted participant and
    /// (re)send them the room state. Fails for unknown ids.
    pub fn attach_session(&self, id: &str, session: Arc<dyn TransportSession>) -> bool {
        let mut participants = self.participants.lock().unwrap();
        let Some(participant) = participants.get_mut(id) else {
            return false;
        };
        participant.session = Some(session);

        if let Some(session) = participants.get(id).and_then(|p| p.session.as_ref()) {
            session.send_reliable(&room_state_message(&participants).to_json());
        }
        true
    }

    /// Remove a participant; a no-op for unknown ids. The remaining
    /// occupants get a `participant_left` broadcast, and the password is
    /// cleared when the room empties.
    pub fn remove_participant(&self, id: &str) {
        let mut participants = self.participants.lock().unwrap();
        if participants.remove(id).is_none() {
            return;
        }
        self.mixer.remove_participant(id);

        let left = ServerMessage::ParticipantLeft { id: id.to_string() }.to_json();
        for participant in participants.values() {
            if let Some(session) = &participant.session {
                session.send_reliable(&left);
            }
        }

        log::info!("[{}] participant left: {}", self.name, id);
        let now_empty = participants.is_empty();
        drop(participants);
        if now_empty {
            self.clear_password();
        }
    }

    /// Handle one incoming audio datagram from a participant.
    ///
    /// Short packets are rejected. With exactly two participants the frame
    /// is forwarded directly to the peer (fast path); otherwise it is
    /// decoded into the mixer's ingress ring and counted toward the
    /// event-driven wake.
    pub fn on_audio_received(&self, participant_id: &str, data: &[u8]) {
        if data.len() < AUDIO_PACKET_SIZE {
            log::debug!(
                "[{}] rejecting short audio packet ({} bytes) from {}",
                self.name,
                data.len(),
                participant_id
            );
            return;
        }

        // Capture everything the fast path needs under one short lock:
        // the peer's session, their next output sequence, and the
        // activity stamps the reaper reads.
        let mut fast: Option<(Option<Arc<dyn TransportSession>>, String, u32)> = None;
        let count;
        {
            let mut participants = self.participants.lock().unwrap();
            count = participants.len();
            if let Some(participant) = participants.get_mut(participant_id) {
                participant.last_audio_received = Some(Instant::now());
            }
            if count == 2 {
                for (pid, participant) in participants.iter_mut() {
                    if pid != participant_id {
                        let sequence = participant.output_sequence;
                        participant.output_sequence = participant.output_sequence.wrapping_add(1);
                        participant.last_audio_sent = Some(Instant::now());
                        fast = Some((participant.session.clone(), pid.clone(), sequence));
                        break;
                    }
                }
            }
        }

        if let Some((session, peer_id, sequence)) = fast {
            let Some(session) = session else {
                return; // peer not bound yet; nothing to forward to
            };
            let entry = self.mixer.get_gain_entry(&peer_id, participant_id);
            if entry.muted || entry.gain <= 0.0 {
                return;
            }

            let mut buf = [0u8; AUDIO_PACKET_SIZE];
            if entry.gain == 1.0 {
                // Unity gain: forward the datagram bytes verbatim, only
                // overwriting the sequence header.
                buf.copy_from_slice(&data[..AUDIO_PACKET_SIZE]);
                buf[..4].copy_from_slice(&sequence.to_le_bytes());
            } else {
                let mut frame = AudioFrame::deserialize(data);
                for sample in frame.samples.iter_mut() {
                    *sample = scale_sample(*sample, entry.gain);
                }
                frame.sequence = sequence;
                frame.serialize(&mut buf);
            }
            session.send_datagram(&buf);
            return;
        }

        let frame = AudioFrame::deserialize(data);
        self.mixer.push_input(participant_id, &frame);

        // Wake the mix thread once every current participant has delivered
        // a frame for this cycle.
        let received = self.frames_received.fetch_add(1, Ordering::AcqRel) + 1;
        if received as usize >= count {
            let _ = self.wake_tx.try_send(());
        }
    }

    pub fn set_gain(&self, listener_id: &str, source_id: &str, gain: f32) {
        self.mixer.set_gain(listener_id, source_id, gain);
    }

    pub fn set_mute(&self, listener_id: &str, source_id: &str, muted: bool) {
        self.mixer.set_mute(listener_id, source_id, muted);
    }

    #[cfg(test)]
    pub(crate) fn gain_entry(
        &self,
        listener_id: &str,
        source_id: &str,
    ) -> crate::audio::mixer::GainEntry {
        self.mixer.get_gain_entry(listener_id, source_id)
    }

    /// Attach a password to the room.
    pub fn claim(&self, password: &str) {
        *self.password.lock().unwrap() = password.to_string();
    }

    /// Check a join password. An unclaimed room accepts anything.
    pub fn check_password(&self, password: &str) -> bool {
        let current = self.password.lock().unwrap();
        current.is_empty() || *current == password
    }

    pub fn clear_password(&self) {
        self.password.lock().unwrap().clear();
    }

    pub fn status(&self) -> RoomStatus {
        if self.is_full() {
            return RoomStatus::Full;
        }
        if self.password.lock().unwrap().is_empty() {
            RoomStatus::Open
        } else {
            RoomStatus::Claimed
        }
    }

    /// Participant list for lobby/state messages.
    pub fn participants(&self) -> Vec<ParticipantInfo> {
        self.participants
            .lock()
            .unwrap()
            .iter()
            .map(|(id, p)| ParticipantInfo {
                id: id.clone(),
                alias: p.alias.clone(),
            })
            .collect()
    }

    /// Send a control message to every bound occupant.
    pub fn broadcast(&self, message: &ServerMessage) {
        let sessions: Vec<Arc<dyn TransportSession>> = {
            let participants = self.participants.lock().unwrap();
            participants
                .values()
                .filter_map(|p| p.session.clone())
                .collect()
        };
        let text = message.to_json();
        for session in sessions {
            session.send_reliable(&text);
        }
    }

    /// Evict participants that never bound a session in time, or that have
    /// been bound but audio-silent in both directions too long. A solo
    /// participant is exempt from the inactivity rule. Returns how many
    /// were removed.
    pub fn reap_stale_participants(&self) -> usize {
        self.reap_with(UNBOUND_TIMEOUT, INACTIVITY_TIMEOUT)
    }

    pub(crate) fn reap_with(&self, unbound: Duration, inactivity: Duration) -> usize {
        let now = Instant::now();
        let mut to_reap = Vec::new();
        {
            let participants = self.participants.lock().unwrap();
            let count = participants.len();
            for (id, participant) in participants.iter() {
                if participant.session.is_none() {
                    if now.duration_since(participant.join_time) >= unbound {
                        to_reap.push(id.clone());
                    }
                    continue;
                }

                if count <= 1 {
                    continue;
                }

                let last_activity = match (
                    participant.last_audio_received,
                    participant.last_audio_sent,
                ) {
                    (Some(recv), Some(sent)) => Some(recv.max(sent)),
                    (Some(recv), None) => Some(recv),
                    (None, Some(sent)) => Some(sent),
                    // Never had audio; fall back to the join time.
                    (None, None) => None,
                };
                let reference = last_activity.unwrap_or(participant.join_time);
                if now.duration_since(reference) >= inactivity {
                    to_reap.push(id.clone());
                }
            }
        }

        for id in &to_reap {
            log::info!("[{}] reaping stale participant: {}", self.name, id);
            self.remove_participant(id);
        }
        to_reap.len()
    }

    /// RT mix loop: wait for a full set of frames (or the deadline), then
    /// run one cycle and ship the outputs.
    fn mix_loop(&self) {
        promote_mix_thread(&self.name);

        let mut scratch = self.mixer.make_scratch();
        let mut pending: Vec<PendingSend> = Vec::with_capacity(self.max_participants);

        while self.running.load(Ordering::Acquire) {
            let _ = self.wake_rx.recv_timeout(MIX_WAKE_TIMEOUT);
            self.frames_received.store(0, Ordering::Release);
            self.mixer.mix_cycle(&mut scratch);
            self.send_outputs(&mut pending);
        }
    }

    /// Pop one egress frame per participant, stamp sequence and activity
    /// under the lock, then send the datagrams outside it so network I/O
    /// never contends with the receive path.
    fn send_outputs(&self, pending: &mut Vec<PendingSend>) {
        pending.clear();
        let mut frame = AudioFrame::silence();
        {
            let mut participants = self.participants.lock().unwrap();
            for (id, participant) in participants.iter_mut() {
                if !self.mixer.pop_output(id, &mut frame) {
                    continue;
                }
                frame.sequence = participant.output_sequence;
                participant.output_sequence = participant.output_sequence.wrapping_add(1);
                participant.last_audio_sent = Some(Instant::now());

                if let Some(session) = &participant.session {
                    let mut slot = PendingSend {
                        session: Arc::clone(session),
                        buf: [0; AUDIO_PACKET_SIZE],
                    };
                    frame.serialize(&mut slot.buf);
                    pending.push(slot);
                }
            }
        }

        for slot in pending.iter() {
            slot.session.send_datagram(&slot.buf);
        }
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Apply a gain factor with the same rounding and saturation as the mixer.
#[inline]
fn scale_sample(sample: i16, gain: f32) -> i16 {
    ((f32::from(sample) * gain).round() as i32)
        .clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
}

fn room_state_message(participants: &HashMap<String, Participant>) -> ServerMessage {
    ServerMessage::RoomState {
        participants: participants
            .iter()
            .map(|(id, p)| ParticipantEntry {
                id: id.clone(),
                name: p.alias.clone(),
            })
            .collect(),
    }
}

/// Promote the current thread to RT priority and pin it to a core.
/// Best-effort: a refusal (missing privileges, exotic platform) degrades
/// jitter but changes nothing functionally.
#[cfg(target_os = "linux")]
fn promote_mix_thread(room: &str) {
    unsafe {
        let param = libc::sched_param {
            sched_priority: libc::sched_get_priority_max(libc::SCHED_FIFO),
        };
        if libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) != 0 {
            log::warn!("[{}] could not set RT priority for mix thread", room);
        }

        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(1, &mut cpuset);
        if libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &cpuset,
        ) != 0
        {
            log::debug!("[{}] could not pin mix thread to a core", room);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn promote_mix_thread(room: &str) {
    log::debug!(
        "[{}] no RT scheduling on this platform; mix timing relies on the wake timeout",
        room
    );
}
