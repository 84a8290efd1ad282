//! Transport capability traits
//!
//! The mixing core is transport-agnostic: any transport that can deliver
//! unreliable datagrams plus a reliable text channel plugs in through the
//! two traits below. Concrete implementations (the plain-socket transport
//! in the server crate, mock sessions in tests) live at the system
//! boundary; nothing in the core depends on their specifics.

pub mod binder;

use std::sync::Arc;

pub use binder::SessionBinder;

/// A single connected participant's transport session.
///
/// Sessions are held as `Arc<dyn TransportSession>` so a callback that
/// races a close still holds a valid handle; sends on a closed session
/// simply return `false`.
pub trait TransportSession: Send + Sync {
    /// Send an unreliable audio datagram. May buffer internally; returns
    /// `false` when the session can no longer deliver.
    fn send_datagram(&self, data: &[u8]) -> bool;

    /// Send a reliable control message (a JSON object; the transport adds
    /// its own framing, e.g. newlines on stream transports).
    fn send_reliable(&self, message: &str) -> bool;

    /// Close this session.
    fn close(&self);

    /// Stable session identifier.
    fn id(&self) -> &str;

    /// Remote address, for rate limiting and logging.
    fn remote_address(&self) -> String;

    fn is_connected(&self) -> bool;
}

/// Callbacks a transport fires into the core.
///
/// All methods may be called from any transport thread; implementors
/// synchronize internally.
pub trait TransportCallbacks: Send + Sync {
    /// A new session is established (no room association yet).
    fn on_session_open(&self, session: Arc<dyn TransportSession>);

    /// A reliable message arrived.
    fn on_message(&self, session: &dyn TransportSession, message: &str);

    /// An unreliable datagram arrived.
    fn on_datagram(&self, session: &dyn TransportSession, data: &[u8]);

    /// The session closed or was lost.
    fn on_session_close(&self, session: &dyn TransportSession);
}
