//! Per-room audio mixer
//!
//! Produces a personalized mix for every participant: the sum of all other
//! participants' current frames, scaled by the listener's per-source gain
//! settings, saturated to the i16 sample range.
//!
//! # Thread architecture
//!
//! ```text
//! ┌──────────────────┐  try_push   ┌─────────────┐  try_pop   ┌────────────┐
//! │ receive thread(s)│────────────►│ ingress ring│───────────►│            │
//! └──────────────────┘             └─────────────┘            │ mix thread │
//! ┌──────────────────┐  try_pop    ┌─────────────┐  try_push  │ (RT prio)  │
//! │   send path      │◄────────────│ egress ring │◄───────────│            │
//! └──────────────────┘             └─────────────┘            └────────────┘
//! ```
//!
//! Participant add/remove and gain changes go through short mutexes that
//! the mix cycle only holds long enough to snapshot; all per-sample work
//! happens on data the cycle owns. The cycle itself performs no heap
//! allocation: every buffer it touches is sized at construction in
//! [`MixScratch`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::audio::ring::{SpscRing, DEFAULT_RING_CAPACITY};
use crate::types::{AudioFrame, SAMPLES_PER_FRAME};

/// Per-listener gain setting: how loud `source` sounds in `listener`'s mix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainEntry {
    /// Linear gain in `[0.0, 1.0]`
    pub gain: f32,
    pub muted: bool,
}

impl Default for GainEntry {
    fn default() -> Self {
        Self {
            gain: 1.0,
            muted: false,
        }
    }
}

/// Two-level gain mapping: `listener_id -> source_id -> GainEntry`.
/// Absent entries mean the default (unity gain, unmuted).
type GainMap = HashMap<String, HashMap<String, GainEntry>>;

/// Per-participant mix state.
///
/// Shared as `Arc` between the participant map and whichever thread is
/// mid-push when the participant is removed: the rings stay valid until
/// the last handle drops, so a late in-flight push lands in a ring nobody
/// will drain again, which is harmless.
struct ParticipantMixState {
    id: String,
    /// Network -> mixer
    ingress: SpscRing<AudioFrame>,
    /// Mixer -> network
    egress: SpscRing<AudioFrame>,
}

impl ParticipantMixState {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ingress: SpscRing::new(DEFAULT_RING_CAPACITY),
            egress: SpscRing::new(DEFAULT_RING_CAPACITY),
        }
    }
}

/// Pre-allocated working memory for [`Mixer::mix_cycle`].
///
/// Owned by the mix thread and handed in by reference each cycle so the
/// RT path never allocates. Construct with [`Mixer::make_scratch`] to get
/// the right capacity.
pub struct MixScratch {
    active: Vec<Arc<ParticipantMixState>>,
    inputs: Vec<[i16; SAMPLES_PER_FRAME]>,
    has_input: Vec<bool>,
    accum: [i32; SAMPLES_PER_FRAME],
    gain_snapshot: GainMap,
}

impl MixScratch {
    fn new(capacity: usize) -> Self {
        Self {
            active: Vec::with_capacity(capacity),
            inputs: vec![[0; SAMPLES_PER_FRAME]; capacity],
            has_input: vec![false; capacity],
            accum: [0; SAMPLES_PER_FRAME],
            gain_snapshot: GainMap::new(),
        }
    }
}

/// Audio mixer for a single room.
///
/// One [`mix_cycle`](Mixer::mix_cycle) pops at most one frame per
/// participant from the ingress rings and pushes at most one mixed frame
/// per listener to the egress rings. Sequence and timestamp of the egress
/// frames are left zero; the room stamps them at send time.
pub struct Mixer {
    max_participants: usize,
    /// Protected by mutex for add/remove; the mix cycle snapshots handles
    /// under the lock and works lock-free from then on.
    participants: Mutex<HashMap<String, Arc<ParticipantMixState>>>,
    gains: Mutex<GainMap>,
}

impl Mixer {
    pub fn new(max_participants: usize) -> Self {
        Self {
            max_participants,
            participants: Mutex::new(HashMap::new()),
            gains: Mutex::new(GainMap::new()),
        }
    }

    /// Scratch buffers sized for this mixer's capacity.
    pub fn make_scratch(&self) -> MixScratch {
        MixScratch::new(self.max_participants)
    }

    /// Add a participant. Ignored at capacity; duplicate adds are
    /// idempotent. Not called from the mix thread.
    pub fn add_participant(&self, id: &str) {
        let mut participants = self.participants.lock().unwrap();
        if participants.len() >= self.max_participants || participants.contains_key(id) {
            return;
        }
        participants.insert(id.to_string(), Arc::new(ParticipantMixState::new(id)));
    }

    /// Remove a participant and purge every gain entry referencing them,
    /// as listener or as source. A no-op for unknown ids.
    pub fn remove_participant(&self, id: &str) {
        self.participants.lock().unwrap().remove(id);

        let mut gains = self.gains.lock().unwrap();
        gains.remove(id);
        for sources in gains.values_mut() {
            sources.remove(id);
        }
    }

    /// Set how loud `source_id` sounds in `listener_id`'s mix. The gain is
    /// clamped to `[0.0, 1.0]`.
    pub fn set_gain(&self, listener_id: &str, source_id: &str, gain: f32) {
        let mut gains = self.gains.lock().unwrap();
        gains
            .entry(listener_id.to_string())
            .or_default()
            .entry(source_id.to_string())
            .or_default()
            .gain = gain.clamp(0.0, 1.0);
    }

    /// Mute or unmute `source_id` in `listener_id`'s mix.
    pub fn set_mute(&self, listener_id: &str, source_id: &str, muted: bool) {
        let mut gains = self.gains.lock().unwrap();
        gains
            .entry(listener_id.to_string())
            .or_default()
            .entry(source_id.to_string())
            .or_default()
            .muted = muted;
    }

    /// Snapshot read of a gain entry; the default when nothing is stored.
    pub fn get_gain_entry(&self, listener_id: &str, source_id: &str) -> GainEntry {
        self.gains
            .lock()
            .unwrap()
            .get(listener_id)
            .and_then(|sources| sources.get(source_id))
            .copied()
            .unwrap_or_default()
    }

    /// Push an incoming frame from a participant. Called from the
    /// transport receive thread; returns `false` for unknown ids or a
    /// full ring.
    pub fn push_input(&self, participant_id: &str, frame: &AudioFrame) -> bool {
        let state = {
            let participants = self.participants.lock().unwrap();
            participants.get(participant_id).cloned()
        };
        match state {
            Some(state) => state.ingress.try_push(frame),
            None => false,
        }
    }

    /// Pop an outgoing mixed frame for a participant. Returns `false` for
    /// unknown ids or an empty ring.
    pub fn pop_output(&self, participant_id: &str, frame: &mut AudioFrame) -> bool {
        let state = {
            let participants = self.participants.lock().unwrap();
            participants.get(participant_id).cloned()
        };
        match state {
            Some(state) => state.egress.try_pop(frame),
            None => false,
        }
    }

    pub fn participant_count(&self) -> usize {
        self.participants.lock().unwrap().len()
    }

    pub fn participant_ids(&self) -> Vec<String> {
        self.participants.lock().unwrap().keys().cloned().collect()
    }

    /// Run one mix cycle.
    ///
    /// 1. Snapshot the participant handles (short lock, handle copies only).
    /// 2. Pop at most one ingress frame per participant.
    /// 3. Snapshot the gain matrix (short lock, `clone_from` reuses the
    ///    scratch map's allocations).
    /// 4. For each listener, accumulate every other contributing source in
    ///    i32, saturate to i16, and push to the listener's egress ring.
    ///
    /// Listeners with no contributing source produce no egress frame this
    /// cycle. A full egress ring silently drops that listener's frame.
    pub fn mix_cycle(&self, scratch: &mut MixScratch) {
        scratch.active.clear();
        {
            let participants = self.participants.lock().unwrap();
            for state in participants.values() {
                scratch.active.push(Arc::clone(state));
            }
        }

        let n = scratch.active.len();
        debug_assert!(n <= scratch.inputs.len(), "scratch sized for another mixer");
        if n == 0 || n > scratch.inputs.len() {
            scratch.active.clear();
            return;
        }

        // One frame per participant per cycle; the rings are wait-free.
        let mut frame = AudioFrame::silence();
        for i in 0..n {
            scratch.has_input[i] = scratch.active[i].ingress.try_pop(&mut frame);
            if scratch.has_input[i] {
                scratch.inputs[i] = frame.samples;
            }
        }

        {
            let gains = self.gains.lock().unwrap();
            scratch.gain_snapshot.clone_from(&gains);
        }

        for listener_idx in 0..n {
            let listener = &scratch.active[listener_idx];
            let listener_gains = scratch.gain_snapshot.get(&listener.id);

            scratch.accum.fill(0);
            let mut any_input = false;

            for source_idx in 0..n {
                if source_idx == listener_idx || !scratch.has_input[source_idx] {
                    continue;
                }
                let source = &scratch.active[source_idx];
                let entry = listener_gains
                    .and_then(|sources| sources.get(&source.id))
                    .copied()
                    .unwrap_or_default();
                if entry.muted || entry.gain <= 0.0 {
                    continue;
                }

                any_input = true;
                let row = &scratch.inputs[source_idx];
                for (acc, &sample) in scratch.accum.iter_mut().zip(row.iter()) {
                    *acc += (f32::from(sample) * entry.gain).round() as i32;
                }
            }

            if !any_input {
                continue;
            }

            let mut out = AudioFrame::silence();
            for (dst, &acc) in out.samples.iter_mut().zip(scratch.accum.iter()) {
                *dst = acc.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
            }
            listener.egress.try_push(&out);
        }

        // Drop the snapshot handles so removed participants free promptly.
        scratch.active.clear();
    }
}
