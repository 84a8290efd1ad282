//! Room registry: join/leave policy, claiming, vacate requests, reaping
//!
//! A fixed directory of rooms created at startup. Rooms are never created
//! or destroyed at runtime; participants come and go, and a background
//! reaper sweeps out the ones that went silent or never bound a transport.

pub mod names;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::audio::Room;
use crate::error::{Error, Result};
use crate::protocol::ServerMessage;
use crate::rooms::names::DEFAULT_ROOMS;
use crate::transport::TransportSession;

/// Minimum wait between vacate requests for the same (ip, room) pair.
const VACATE_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

/// Seconds between reaper sweeps, slept in 100ms chunks so shutdown stays
/// prompt.
const REAPER_SWEEP: Duration = Duration::from_secs(5);
const REAPER_CHUNK: Duration = Duration::from_millis(100);

/// Why a join was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("room not found")]
    RoomNotFound,
    #[error("room is full")]
    RoomFull,
    #[error("room is claimed; password required")]
    PasswordRequired,
    #[error("incorrect password")]
    PasswordIncorrect,
}

/// Outcome of a vacate request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VacateOutcome {
    Sent,
    RoomNotFound,
    RoomEmpty,
    CooldownActive,
}

/// One row of the lobby listing.
#[derive(Debug, Clone, Serialize)]
pub struct RoomInfo {
    pub name: String,
    pub participant_count: usize,
    pub max_participants: usize,
    pub claimed: bool,
}

/// Manages all rooms and handles join/leave/claim/vacate operations.
pub struct RoomManager {
    max_participants_per_room: usize,
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    /// (source ip, room name) -> last vacate request
    vacate_cooldowns: Mutex<HashMap<(String, String), Instant>>,
    reaper_running: AtomicBool,
    reaper_thread: Mutex<Option<JoinHandle<()>>>,
}

impl RoomManager {
    pub fn new(max_participants_per_room: usize) -> Self {
        Self {
            max_participants_per_room,
            rooms: Mutex::new(HashMap::new()),
            vacate_cooldowns: Mutex::new(HashMap::new()),
            reaper_running: AtomicBool::new(false),
            reaper_thread: Mutex::new(None),
        }
    }

    /// Create the built-in rooms and start their mix threads.
    pub fn initialize_default_rooms(&self) -> Result<()> {
        for def in DEFAULT_ROOMS {
            self.add_room(def.name)?;
        }
        log::info!("initialized {} default rooms", DEFAULT_ROOMS.len());
        Ok(())
    }

    /// Create and start a single room. Used by the default seeding and by
    /// tests that want a smaller registry.
    pub fn add_room(&self, name: &str) -> Result<Arc<Room>> {
        let room = Arc::new(Room::new(name, self.max_participants_per_room));
        room.start()?;
        self.rooms
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&room));
        Ok(room)
    }

    pub fn get_room(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.lock().unwrap().get(name).cloned()
    }

    /// Lobby listing, sorted by room name.
    pub fn list_rooms(&self) -> Vec<RoomInfo> {
        let rooms: Vec<Arc<Room>> = self.rooms.lock().unwrap().values().cloned().collect();
        let mut infos: Vec<RoomInfo> = rooms
            .iter()
            .map(|room| RoomInfo {
                name: room.name().to_string(),
                participant_count: room.participant_count(),
                max_participants: room.max_participants(),
                claimed: room.status() == crate::audio::RoomStatus::Claimed,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Join a participant to a room, returning their fresh opaque id.
    ///
    /// The session may be absent (HTTP-only join); the participant is then
    /// created unbound and must bind a transport later.
    pub fn join_room(
        &self,
        room_name: &str,
        alias: &str,
        password: &str,
        session: Option<Arc<dyn TransportSession>>,
    ) -> std::result::Result<String, JoinError> {
        let room = self.get_room(room_name).ok_or(JoinError::RoomNotFound)?;
        if room.is_full() {
            return Err(JoinError::RoomFull);
        }
        if room.status() == crate::audio::RoomStatus::Claimed {
            if password.is_empty() {
                return Err(JoinError::PasswordRequired);
            }
            if !room.check_password(password) {
                return Err(JoinError::PasswordIncorrect);
            }
        }

        let participant_id = generate_id();
        if !room.add_participant(&participant_id, alias, session) {
            // Lost a race for the last slot.
            return Err(JoinError::RoomFull);
        }
        Ok(participant_id)
    }

    pub fn leave_room(&self, room_name: &str, participant_id: &str) {
        if let Some(room) = self.get_room(room_name) {
            room.remove_participant(participant_id);
        }
    }

    /// Attach a password to a room. Returns `false` for unknown rooms.
    pub fn claim_room(&self, room_name: &str, password: &str) -> bool {
        match self.get_room(room_name) {
            Some(room) => {
                room.claim(password);
                true
            }
            None => false,
        }
    }

    /// Ask the current occupants of a room to make way. Rate-limited per
    /// (source ip, room) pair.
    pub fn vacate_request(&self, room_name: &str, source_ip: &str) -> VacateOutcome {
        let Some(room) = self.get_room(room_name) else {
            return VacateOutcome::RoomNotFound;
        };
        if room.is_empty() {
            return VacateOutcome::RoomEmpty;
        }

        {
            let mut cooldowns = self.vacate_cooldowns.lock().unwrap();
            let key = (source_ip.to_string(), room_name.to_string());
            if let Some(last) = cooldowns.get(&key) {
                if last.elapsed() < VACATE_COOLDOWN {
                    return VacateOutcome::CooldownActive;
                }
            }
            cooldowns.insert(key, Instant::now());
        }

        room.broadcast(&ServerMessage::VacateRequest);
        log::info!("[{}] vacate request sent (from {})", room_name, source_ip);
        VacateOutcome::Sent
    }

    /// Start the background reaper. Idempotent.
    pub fn start_reaper(self: &Arc<Self>) -> Result<()> {
        if self.reaper_running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let manager = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("reaper".to_string())
            .spawn(move || manager.reaper_loop())
            .map_err(|source| {
                self.reaper_running.store(false, Ordering::Release);
                Error::ThreadSpawn {
                    name: "reaper".to_string(),
                    source,
                }
            })?;
        *self.reaper_thread.lock().unwrap() = Some(handle);
        log::info!("participant reaper started");
        Ok(())
    }

    pub fn stop_reaper(&self) {
        if !self.reaper_running.swap(false, Ordering::AcqRel) {
            return;
        }
        let handle = self.reaper_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Stop the reaper and every room's mix thread. Called on orderly
    /// shutdown; also runs on drop.
    pub fn shutdown(&self) {
        self.stop_reaper();
        let rooms: Vec<Arc<Room>> = self.rooms.lock().unwrap().values().cloned().collect();
        for room in rooms {
            room.stop();
        }
    }

    fn reaper_loop(&self) {
        let chunks_per_sweep = (REAPER_SWEEP.as_millis() / REAPER_CHUNK.as_millis()) as u32;
        let mut chunks = 0;
        while self.reaper_running.load(Ordering::Acquire) {
            std::thread::sleep(REAPER_CHUNK);
            chunks += 1;
            if chunks < chunks_per_sweep {
                continue;
            }
            chunks = 0;

            let rooms: Vec<Arc<Room>> = self.rooms.lock().unwrap().values().cloned().collect();
            for room in rooms {
                room.reap_stale_participants();
            }
        }
    }
}

impl Drop for RoomManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Generate an opaque participant id: 128 random bits as hex.
fn generate_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}
