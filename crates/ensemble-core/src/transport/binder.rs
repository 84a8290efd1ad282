//! Transport-agnostic session binding
//!
//! A freshly opened transport session belongs to nobody. The binder parks
//! it as *pending* until the client's first reliable message, a `bind`
//! naming the room and the participant id it got from the join API, and
//! from then on routes that session's datagrams and control messages to
//! the right room. Session close tears the binding down through the normal
//! leave path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::rooms::RoomManager;
use crate::transport::{TransportCallbacks, TransportSession};

struct Binding {
    room_name: String,
    participant_id: String,
    /// Owned here so a late transport callback never sees a dropped
    /// session.
    session: Arc<dyn TransportSession>,
}

/// Routes generic transport events into room operations.
///
/// Pending and bound sessions live behind separate short-lived locks;
/// neither lock is held across a room operation or a send.
pub struct SessionBinder {
    room_manager: Arc<RoomManager>,
    /// Sessions awaiting a bind message, keyed by session id.
    pending: Mutex<HashMap<String, Arc<dyn TransportSession>>>,
    bindings: Mutex<HashMap<String, Binding>>,
}

impl SessionBinder {
    pub fn new(room_manager: Arc<RoomManager>) -> Self {
        Self {
            room_manager,
            pending: Mutex::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Handle a message on a session that is already bound: ping echo and
    /// the per-listener mix controls. Anything else is logged and dropped.
    fn handle_bound_message(
        &self,
        room_name: &str,
        participant_id: &str,
        session: &Arc<dyn TransportSession>,
        message: &str,
    ) {
        let parsed: ClientMessage = match serde_json::from_str(message) {
            Ok(parsed) => parsed,
            Err(err) => {
                log::warn!(
                    "[binder] dropping malformed message from {}: {}",
                    session.id(),
                    err
                );
                return;
            }
        };

        match parsed {
            ClientMessage::Ping { extra } => {
                session.send_reliable(&ServerMessage::Pong { extra }.to_json());
            }
            ClientMessage::SetGain { source, gain } => {
                if let Some(room) = self.room_manager.get_room(room_name) {
                    room.set_gain(participant_id, &source, gain);
                }
            }
            ClientMessage::SetMute { source, muted } => {
                if let Some(room) = self.room_manager.get_room(room_name) {
                    room.set_mute(participant_id, &source, muted);
                }
            }
            ClientMessage::Bind { .. } => {
                log::debug!(
                    "[binder] ignoring bind on already-bound session {}",
                    session.id()
                );
            }
        }
    }

    /// Handle the first message on a pending session, which must be a
    /// bind. The session stays pending after every failure so the client
    /// can retry.
    fn handle_bind(&self, session: &dyn TransportSession, message: &str) {
        let session_id = session.id().to_string();

        let (participant_id, room_name) = match serde_json::from_str(message) {
            Ok(ClientMessage::Bind {
                participant_id,
                room,
            }) => (participant_id, room),
            Ok(other) => {
                log::warn!(
                    "[binder] expected bind from {}, got {:?}",
                    session_id,
                    other
                );
                return;
            }
            Err(err) => {
                log::warn!(
                    "[binder] invalid JSON from pending session {}: {}",
                    session_id,
                    err
                );
                return;
            }
        };

        let Some(room) = self.room_manager.get_room(&room_name) else {
            log::warn!("[binder] bind to unknown room: {}", room_name);
            session.send_reliable(
                &ServerMessage::Error {
                    error: ErrorCode::RoomNotFound,
                }
                .to_json(),
            );
            return;
        };

        let owned = self.pending.lock().unwrap().remove(&session_id);
        let Some(owned) = owned else {
            log::warn!("[binder] session not found in pending: {}", session_id);
            return;
        };

        if !room.attach_session(&participant_id, Arc::clone(&owned)) {
            log::warn!(
                "[binder] no participant {} in room {}",
                participant_id,
                room_name
            );
            owned.send_reliable(
                &ServerMessage::Error {
                    error: ErrorCode::ParticipantNotFound,
                }
                .to_json(),
            );
            // Keep the session alive for a retry.
            self.pending.lock().unwrap().insert(session_id, owned);
            return;
        }

        log::info!(
            "[binder] bound session {} -> room={} participant={}",
            session_id,
            room_name,
            participant_id
        );
        self.bindings.lock().unwrap().insert(
            session_id,
            Binding {
                room_name,
                participant_id,
                session: owned,
            },
        );
    }
}

impl TransportCallbacks for SessionBinder {
    fn on_session_open(&self, session: Arc<dyn TransportSession>) {
        log::info!("[binder] new session awaiting bind: {}", session.id());
        self.pending
            .lock()
            .unwrap()
            .insert(session.id().to_string(), session);
    }

    fn on_message(&self, session: &dyn TransportSession, message: &str) {
        let bound = {
            let bindings = self.bindings.lock().unwrap();
            bindings.get(session.id()).map(|binding| {
                (
                    binding.room_name.clone(),
                    binding.participant_id.clone(),
                    Arc::clone(&binding.session),
                )
            })
        };

        match bound {
            Some((room_name, participant_id, session)) => {
                self.handle_bound_message(&room_name, &participant_id, &session, message);
            }
            None => self.handle_bind(session, message),
        }
    }

    fn on_datagram(&self, session: &dyn TransportSession, data: &[u8]) {
        let bound = {
            let bindings = self.bindings.lock().unwrap();
            bindings
                .get(session.id())
                .map(|binding| (binding.room_name.clone(), binding.participant_id.clone()))
        };
        // Datagrams before the bind completes are dropped.
        let Some((room_name, participant_id)) = bound else {
            return;
        };
        if let Some(room) = self.room_manager.get_room(&room_name) {
            room.on_audio_received(&participant_id, data);
        }
    }

    fn on_session_close(&self, session: &dyn TransportSession) {
        let session_id = session.id();
        self.pending.lock().unwrap().remove(session_id);

        let bound = {
            let mut bindings = self.bindings.lock().unwrap();
            bindings
                .remove(session_id)
                .map(|binding| (binding.room_name, binding.participant_id))
        };
        if let Some((room_name, participant_id)) = bound {
            log::info!(
                "[binder] session closed: {} (room={} participant={})",
                session_id,
                room_name,
                participant_id
            );
            self.room_manager.leave_room(&room_name, &participant_id);
        }
    }
}
