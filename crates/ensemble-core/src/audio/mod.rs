//! The per-room audio path: SPSC rings, mixer, room lifecycle and RT loop

pub mod mixer;
pub mod ring;
pub mod room;

pub use mixer::{GainEntry, MixScratch, Mixer};
pub use ring::{SpscRing, DEFAULT_RING_CAPACITY};
pub use room::{ParticipantInfo, Room, RoomStatus};
