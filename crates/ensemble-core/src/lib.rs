//! Ensemble Core - per-room real-time mixing pipeline
//!
//! Everything between network ingress and egress for one rehearsal room:
//! the audio frame codec, the wait-free SPSC rings, the mixer and its RT
//! cycle, the room lifecycle, the session binder that attaches transport
//! sessions to rooms, and the room registry. Concrete transports and the
//! HTTP surface live in the server crate and talk to this one only through
//! the [`transport`] capability traits.

pub mod audio;
pub mod error;
pub mod protocol;
pub mod rooms;
pub mod transport;
pub mod types;

pub use types::*;
