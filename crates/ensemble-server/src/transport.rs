//! Plain-socket transport: TCP reliable channel + UDP datagrams
//!
//! The concrete [`TransportSession`] implementor this server ships with.
//! Each session is one TCP connection carrying newline-framed JSON (the
//! reliable channel) plus a share of one UDP socket for audio datagrams.
//!
//! Datagram association is the only wrinkle UDP adds: on accept the
//! transport issues the session a 16-hex-char token and tells the client
//! about it (and the UDP port) in a `transport_hello` line. The client
//! prefixes every datagram with the token; the server learns the client's
//! UDP address from the first one, strips the prefix, and hands the
//! payload to the core. The core never sees any of this framing.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use ensemble_core::transport::{TransportCallbacks, TransportSession};
use ensemble_core::AUDIO_PACKET_SIZE;

/// Datagram token length: 16 hex chars prefixing every client datagram.
pub const DATAGRAM_TOKEN_LEN: usize = 16;

/// Largest datagram we accept: token + one audio packet.
const MAX_DATAGRAM: usize = DATAGRAM_TOKEN_LEN + AUDIO_PACKET_SIZE;

/// How often the accept and receive loops check the running flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One connected client: a TCP write half plus a learned UDP return
/// address on the shared socket.
pub struct SocketSession {
    /// Session id; doubles as the datagram token.
    id: String,
    remote_addr: SocketAddr,
    writer: Mutex<TcpStream>,
    udp: Arc<UdpSocket>,
    /// Learned from the first token-prefixed datagram.
    peer_udp: Mutex<Option<SocketAddr>>,
    connected: AtomicBool,
}

impl TransportSession for SocketSession {
    fn send_datagram(&self, data: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        let peer = *self.peer_udp.lock().unwrap();
        match peer {
            Some(addr) => self.udp.send_to(data, addr).is_ok(),
            // No datagram seen from the client yet; nowhere to send.
            None => false,
        }
    }

    fn send_reliable(&self, message: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mut writer = self.writer.lock().unwrap();
        let result = writer
            .write_all(message.as_bytes())
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush());
        if result.is_err() {
            self.connected.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.writer.lock().unwrap().shutdown(Shutdown::Both);
        }
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn remote_address(&self) -> String {
        self.remote_addr.to_string()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Listening plain-socket transport. One accept thread, one UDP receive
/// thread, one reader thread per connection.
pub struct SocketTransport {
    running: Arc<AtomicBool>,
    sessions: Arc<Mutex<HashMap<String, Arc<SocketSession>>>>,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    threads: Vec<JoinHandle<()>>,
}

impl SocketTransport {
    /// Bind and start serving. Events are delivered through `callbacks`
    /// from the transport's own threads.
    pub fn listen(
        bind: &str,
        tcp_port: u16,
        udp_port: u16,
        callbacks: Arc<dyn TransportCallbacks>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind((bind, tcp_port))
            .with_context(|| format!("binding control listener on {}:{}", bind, tcp_port))?;
        listener
            .set_nonblocking(true)
            .context("setting control listener non-blocking")?;
        let udp = Arc::new(
            UdpSocket::bind((bind, udp_port))
                .with_context(|| format!("binding audio socket on {}:{}", bind, udp_port))?,
        );
        udp.set_read_timeout(Some(POLL_INTERVAL))
            .context("setting audio socket read timeout")?;

        let tcp_addr = listener.local_addr().context("control listener address")?;
        let udp_addr = udp.local_addr().context("audio socket address")?;

        let running = Arc::new(AtomicBool::new(true));
        let sessions: Arc<Mutex<HashMap<String, Arc<SocketSession>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let accept_thread = {
            let running = Arc::clone(&running);
            let sessions = Arc::clone(&sessions);
            let callbacks = Arc::clone(&callbacks);
            let udp = Arc::clone(&udp);
            let udp_port = udp_addr.port();
            std::thread::Builder::new()
                .name("transport-accept".to_string())
                .spawn(move || {
                    accept_loop(listener, running, sessions, callbacks, udp, udp_port)
                })
                .context("spawning accept thread")?
        };

        let udp_thread = {
            let running = Arc::clone(&running);
            let sessions = Arc::clone(&sessions);
            let callbacks = Arc::clone(&callbacks);
            let udp = Arc::clone(&udp);
            std::thread::Builder::new()
                .name("transport-udp".to_string())
                .spawn(move || udp_loop(udp, running, sessions, callbacks))
                .context("spawning udp thread")?
        };

        log::info!(
            "plain-socket transport listening (control tcp {}, audio udp {})",
            tcp_addr,
            udp_addr
        );
        Ok(Self {
            running,
            sessions,
            tcp_addr,
            udp_addr,
            threads: vec![accept_thread, udp_thread],
        })
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    /// Stop serving: close every session and join the transport threads.
    /// Per-connection reader threads exit as their streams shut down.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let sessions: Vec<Arc<SocketSession>> =
            self.sessions.lock().unwrap().values().cloned().collect();
        for session in sessions {
            session.close();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    running: Arc<AtomicBool>,
    sessions: Arc<Mutex<HashMap<String, Arc<SocketSession>>>>,
    callbacks: Arc<dyn TransportCallbacks>,
    udp: Arc<UdpSocket>,
    udp_port: u16,
) {
    while running.load(Ordering::SeqCst) {
        let (stream, remote_addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
            Err(err) => {
                log::error!("[transport] accept failed: {}", err);
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
        };
        if stream.set_nonblocking(false).is_err() {
            continue;
        }

        let writer = match stream.try_clone() {
            Ok(writer) => writer,
            Err(err) => {
                log::error!("[transport] could not clone stream: {}", err);
                continue;
            }
        };

        let id = generate_token();
        let session = Arc::new(SocketSession {
            id: id.clone(),
            remote_addr,
            writer: Mutex::new(writer),
            udp: Arc::clone(&udp),
            peer_udp: Mutex::new(None),
            connected: AtomicBool::new(true),
        });
        sessions.lock().unwrap().insert(id.clone(), Arc::clone(&session));

        // Transport-level framing detail, not a core protocol message:
        // tells the client its datagram token and where to send audio.
        session.send_reliable(&format!(
            r#"{{"type":"transport_hello","token":"{}","udp_port":{}}}"#,
            id, udp_port
        ));

        log::info!("[transport] session {} connected from {}", id, remote_addr);
        callbacks.on_session_open(Arc::clone(&session) as Arc<dyn TransportSession>);

        let reader_sessions = Arc::clone(&sessions);
        let reader_callbacks = Arc::clone(&callbacks);
        let spawn_result = std::thread::Builder::new()
            .name(format!("transport-read-{}", id))
            .spawn(move || {
                read_loop(stream, &session, &reader_callbacks);
                reader_sessions.lock().unwrap().remove(session.id());
            });
        if let Err(err) = spawn_result {
            log::error!("[transport] could not spawn reader for {}: {}", id, err);
            sessions.lock().unwrap().remove(&id);
        }
    }
}

fn read_loop(
    stream: TcpStream,
    session: &Arc<SocketSession>,
    callbacks: &Arc<dyn TransportCallbacks>,
) {
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        callbacks.on_message(&**session, trimmed);
    }

    session.connected.store(false, Ordering::SeqCst);
    log::info!("[transport] session {} disconnected", session.id());
    callbacks.on_session_close(&**session);
}

fn udp_loop(
    udp: Arc<UdpSocket>,
    running: Arc<AtomicBool>,
    sessions: Arc<Mutex<HashMap<String, Arc<SocketSession>>>>,
    callbacks: Arc<dyn TransportCallbacks>,
) {
    let mut buf = [0u8; MAX_DATAGRAM];
    while running.load(Ordering::SeqCst) {
        let (len, addr) = match udp.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => {
                log::error!("[transport] udp receive failed: {}", err);
                continue;
            }
        };
        if len < DATAGRAM_TOKEN_LEN {
            continue;
        }

        let Ok(token) = std::str::from_utf8(&buf[..DATAGRAM_TOKEN_LEN]) else {
            continue;
        };
        let session = sessions.lock().unwrap().get(token).cloned();
        let Some(session) = session else {
            log::debug!("[transport] datagram with unknown token from {}", addr);
            continue;
        };

        {
            let mut peer = session.peer_udp.lock().unwrap();
            if peer.is_none() {
                log::info!(
                    "[transport] session {} audio return address is {}",
                    session.id(),
                    addr
                );
                *peer = Some(addr);
            }
        }

        let payload = &buf[DATAGRAM_TOKEN_LEN..len];
        if payload.is_empty() {
            continue; // address-learning hello
        }
        callbacks.on_datagram(&*session, payload);
    }
}

/// 16 hex chars, random; session id and datagram token in one.
fn generate_token() -> String {
    format!("{:016x}", rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[derive(Default)]
    struct CollectingCallbacks {
        opened: Mutex<Vec<Arc<dyn TransportSession>>>,
        messages: Mutex<Vec<(String, String)>>,
        datagrams: Mutex<Vec<(String, Vec<u8>)>>,
        closed: Mutex<Vec<String>>,
    }

    impl TransportCallbacks for CollectingCallbacks {
        fn on_session_open(&self, session: Arc<dyn TransportSession>) {
            self.opened.lock().unwrap().push(session);
        }

        fn on_message(&self, session: &dyn TransportSession, message: &str) {
            self.messages
                .lock()
                .unwrap()
                .push((session.id().to_string(), message.to_string()));
        }

        fn on_datagram(&self, session: &dyn TransportSession, data: &[u8]) {
            self.datagrams
                .lock()
                .unwrap()
                .push((session.id().to_string(), data.to_vec()));
        }

        fn on_session_close(&self, session: &dyn TransportSession) {
            self.closed.lock().unwrap().push(session.id().to_string());
        }
    }

    fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn session_round_trip_over_loopback() {
        let callbacks = Arc::new(CollectingCallbacks::default());
        let mut transport = SocketTransport::listen(
            "127.0.0.1",
            0,
            0,
            Arc::clone(&callbacks) as Arc<dyn TransportCallbacks>,
        )
        .unwrap();

        // Connect and read the transport hello to learn our token.
        let stream = TcpStream::connect(transport.tcp_addr()).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut hello = String::new();
        reader.read_line(&mut hello).unwrap();
        let hello: serde_json::Value = serde_json::from_str(hello.trim()).unwrap();
        assert_eq!(hello["type"], "transport_hello");
        let token = hello["token"].as_str().unwrap().to_string();
        assert_eq!(token.len(), DATAGRAM_TOKEN_LEN);

        wait_for("session open", || !callbacks.opened.lock().unwrap().is_empty());

        // Reliable channel: one JSON line in, delivered verbatim.
        let mut writer = stream.try_clone().unwrap();
        writer.write_all(b"{\"type\":\"ping\"}\n").unwrap();
        wait_for("message delivery", || {
            !callbacks.messages.lock().unwrap().is_empty()
        });
        {
            let messages = callbacks.messages.lock().unwrap();
            assert_eq!(messages[0].0, token);
            assert_eq!(messages[0].1, r#"{"type":"ping"}"#);
        }

        // Datagram path: token-prefixed payload arrives stripped; the
        // empty-payload hello only teaches the server our address.
        let client_udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        client_udp
            .send_to(token.as_bytes(), transport.udp_addr())
            .unwrap();
        let mut datagram = token.as_bytes().to_vec();
        datagram.extend_from_slice(&[7u8; 32]);
        client_udp.send_to(&datagram, transport.udp_addr()).unwrap();
        wait_for("datagram delivery", || {
            !callbacks.datagrams.lock().unwrap().is_empty()
        });
        {
            let datagrams = callbacks.datagrams.lock().unwrap();
            assert_eq!(datagrams[0].1, vec![7u8; 32]);
        }

        // Server -> client, both channels.
        let session = callbacks.opened.lock().unwrap()[0].clone();
        assert!(session.send_reliable("{\"type\":\"pong\"}"));
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line.trim(), r#"{"type":"pong"}"#);

        client_udp
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        assert!(session.send_datagram(&[9u8; 16]));
        let mut buf = [0u8; 64];
        let (len, _) = client_udp.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[9u8; 16]);

        // Disconnect tears the session down.
        drop(writer);
        drop(reader);
        drop(stream);
        wait_for("session close", || !callbacks.closed.lock().unwrap().is_empty());
        assert_eq!(callbacks.closed.lock().unwrap()[0], token);

        transport.stop();
    }

    #[test]
    fn datagrams_with_unknown_tokens_are_dropped() {
        let callbacks = Arc::new(CollectingCallbacks::default());
        let mut transport = SocketTransport::listen(
            "127.0.0.1",
            0,
            0,
            Arc::clone(&callbacks) as Arc<dyn TransportCallbacks>,
        )
        .unwrap();

        let client_udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut datagram = b"deadbeefdeadbeef".to_vec();
        datagram.extend_from_slice(&[1u8; 8]);
        client_udp.send_to(&datagram, transport.udp_addr()).unwrap();
        // Short datagrams are ignored too.
        client_udp.send_to(b"xy", transport.udp_addr()).unwrap();

        std::thread::sleep(Duration::from_millis(200));
        assert!(callbacks.datagrams.lock().unwrap().is_empty());

        transport.stop();
    }
}
