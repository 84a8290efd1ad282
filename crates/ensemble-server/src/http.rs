//! HTTP REST API for room discovery and membership
//!
//! Routes:
//!   GET  /api/health                     - health check
//!   GET  /api/rooms                      - lobby listing
//!   POST /api/rooms/:name/join           - join a room
//!   POST /api/rooms/:name/leave          - leave a room
//!   POST /api/rooms/:name/claim          - claim a room (set password)
//!   POST /api/rooms/:name/vacate-request - ask occupants to make way
//!
//! Status mapping: 400 invalid JSON, 401 password required/incorrect,
//! 404 room not found, 409 room full, 429 vacate cooldown.

use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use ensemble_core::rooms::{JoinError, RoomManager, VacateOutcome};
use serde::Deserialize;
use serde_json::json;
use tiny_http::{Header, Method, Request, Response, Server};

const RECV_POLL: Duration = Duration::from_millis(250);

/// Largest request body we bother reading.
const MAX_BODY: usize = 16 * 1024;

#[derive(Deserialize)]
struct JoinBody {
    #[serde(default = "default_alias")]
    alias: String,
    #[serde(default)]
    password: String,
}

fn default_alias() -> String {
    "Anonymous".to_string()
}

#[derive(Deserialize)]
struct LeaveBody {
    #[serde(default)]
    participant_id: String,
}

#[derive(Deserialize)]
struct ClaimBody {
    #[serde(default)]
    password: String,
}

/// The running HTTP API server.
pub struct HttpApi {
    running: Arc<AtomicBool>,
    addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl HttpApi {
    /// Bind and start serving on a dedicated thread.
    ///
    /// `tcp_port`/`udp_port` are advertised to joining clients so they
    /// know where the plain-socket transport lives.
    pub fn start(
        bind: &str,
        port: u16,
        manager: Arc<RoomManager>,
        tcp_port: u16,
        udp_port: u16,
    ) -> anyhow::Result<Self> {
        let server = Server::http(format!("{}:{}", bind, port))
            .map_err(|err| anyhow::anyhow!("binding http server on {}:{}: {}", bind, port, err))?;
        let addr = server
            .server_addr()
            .to_ip()
            .context("http server has no ip address")?;

        let running = Arc::new(AtomicBool::new(true));
        let thread = {
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name("http-api".to_string())
                .spawn(move || {
                    while running.load(Ordering::SeqCst) {
                        match server.recv_timeout(RECV_POLL) {
                            Ok(Some(request)) => {
                                handle_request(request, &manager, tcp_port, udp_port)
                            }
                            Ok(None) => {}
                            Err(err) => {
                                log::error!("[http] receive failed: {}", err);
                            }
                        }
                    }
                })
                .context("spawning http thread")?
        };

        log::info!("http api listening on {}", addr);
        Ok(Self {
            running,
            addr,
            thread: Some(thread),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for HttpApi {
    fn drop(&mut self) {
        self.stop();
    }
}

fn handle_request(mut request: Request, manager: &Arc<RoomManager>, tcp_port: u16, udp_port: u16) {
    let method = request.method().clone();
    let path = request.url().split('?').next().unwrap_or("").to_string();
    let remote_ip = request
        .remote_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let mut body = String::new();
    let _ = request
        .as_reader()
        .take(MAX_BODY as u64)
        .read_to_string(&mut body);

    let (status, payload) = route(&method, &path, &body, &remote_ip, manager, tcp_port, udp_port);
    log::debug!("[http] {} {} -> {}", method, path, status);

    let response = Response::from_string(payload)
        .with_status_code(status)
        .with_header(
            "Content-Type: application/json"
                .parse::<Header>()
                .unwrap(),
        )
        .with_header("Access-Control-Allow-Origin: *".parse::<Header>().unwrap());
    if let Err(err) = request.respond(response) {
        log::debug!("[http] client went away mid-response: {}", err);
    }
}

fn route(
    method: &Method,
    path: &str,
    body: &str,
    remote_ip: &str,
    manager: &Arc<RoomManager>,
    tcp_port: u16,
    udp_port: u16,
) -> (u16, String) {
    // CORS preflight
    if *method == Method::Options {
        return (204, String::new());
    }

    if *method == Method::Get && path == "/api/health" {
        return (200, json!({"status": "ok"}).to_string());
    }

    if *method == Method::Get && path == "/api/rooms" {
        return (200, json!({"rooms": manager.list_rooms()}).to_string());
    }

    if let Some(rest) = path.strip_prefix("/api/rooms/") {
        let mut parts = rest.splitn(2, '/');
        let room_name = parts.next().unwrap_or("");
        let action = parts.next().unwrap_or("");

        if *method == Method::Post {
            return match action {
                "join" => handle_join(room_name, body, manager, tcp_port, udp_port),
                "leave" => handle_leave(room_name, body, manager),
                "claim" => handle_claim(room_name, body, manager),
                "vacate-request" => handle_vacate(room_name, remote_ip, manager),
                _ => not_found(),
            };
        }
    }

    not_found()
}

fn not_found() -> (u16, String) {
    (404, json!({"error": "not_found"}).to_string())
}

fn handle_join(
    room_name: &str,
    body: &str,
    manager: &Arc<RoomManager>,
    tcp_port: u16,
    udp_port: u16,
) -> (u16, String) {
    let Ok(join) = serde_json::from_str::<JoinBody>(body) else {
        return (400, json!({"error": "invalid_json"}).to_string());
    };

    match manager.join_room(room_name, &join.alias, &join.password, None) {
        Ok(participant_id) => (
            200,
            json!({
                "participant_id": participant_id,
                "tcp_port": tcp_port,
                "udp_port": udp_port,
            })
            .to_string(),
        ),
        Err(JoinError::RoomNotFound) => (404, json!({"error": "room_not_found"}).to_string()),
        Err(JoinError::RoomFull) => (409, json!({"error": "room_full"}).to_string()),
        Err(JoinError::PasswordRequired) => {
            (401, json!({"error": "password_required"}).to_string())
        }
        Err(JoinError::PasswordIncorrect) => {
            (401, json!({"error": "password_incorrect"}).to_string())
        }
    }
}

fn handle_leave(room_name: &str, body: &str, manager: &Arc<RoomManager>) -> (u16, String) {
    let Ok(leave) = serde_json::from_str::<LeaveBody>(body) else {
        return (400, json!({"error": "invalid_json"}).to_string());
    };
    if leave.participant_id.is_empty() {
        return (400, json!({"error": "missing_participant_id"}).to_string());
    }
    manager.leave_room(room_name, &leave.participant_id);
    (200, json!({"ok": true}).to_string())
}

fn handle_claim(room_name: &str, body: &str, manager: &Arc<RoomManager>) -> (u16, String) {
    let Ok(claim) = serde_json::from_str::<ClaimBody>(body) else {
        return (400, json!({"error": "invalid_json"}).to_string());
    };
    if claim.password.is_empty() {
        return (400, json!({"error": "missing_password"}).to_string());
    }
    if manager.claim_room(room_name, &claim.password) {
        (200, json!({"ok": true}).to_string())
    } else {
        (404, json!({"error": "room_not_found"}).to_string())
    }
}

fn handle_vacate(room_name: &str, remote_ip: &str, manager: &Arc<RoomManager>) -> (u16, String) {
    match manager.vacate_request(room_name, remote_ip) {
        VacateOutcome::Sent => (200, json!({"ok": true}).to_string()),
        VacateOutcome::RoomNotFound => (404, json!({"error": "room_not_found"}).to_string()),
        VacateOutcome::RoomEmpty => (400, json!({"error": "room_empty"}).to_string()),
        VacateOutcome::CooldownActive => (429, json!({"error": "cooldown_active"}).to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream;

    fn start_api() -> (Arc<RoomManager>, HttpApi) {
        let manager = Arc::new(RoomManager::new(2));
        manager.initialize_default_rooms().unwrap();
        let api = HttpApi::start("127.0.0.1", 0, Arc::clone(&manager), 9001, 9002).unwrap();
        (manager, api)
    }

    /// Minimal HTTP client: one request, connection closed, full response
    /// returned as a string.
    fn http(addr: SocketAddr, method: &str, path: &str, body: &str) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        let request = format!(
            "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
            method,
            path,
            body.len(),
            body
        );
        stream.write_all(request.as_bytes()).unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    fn body_of(response: &str) -> serde_json::Value {
        let body = response.split("\r\n\r\n").nth(1).unwrap_or("");
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn lobby_listing_and_health() {
        let (_manager, mut api) = start_api();

        let response = http(api.addr(), "GET", "/api/health", "");
        assert!(response.starts_with("HTTP/1.1 200"));

        let response = http(api.addr(), "GET", "/api/rooms", "");
        let rooms = body_of(&response);
        let rooms = rooms["rooms"].as_array().unwrap();
        assert_eq!(rooms.len(), 16);
        assert_eq!(rooms[0]["name"], "Allegro");
        assert_eq!(rooms[0]["participant_count"], 0);

        api.stop();
    }

    #[test]
    fn join_flow_and_error_codes() {
        let (manager, mut api) = start_api();

        let response = http(
            api.addr(),
            "POST",
            "/api/rooms/Allegro/join",
            r#"{"alias":"alice"}"#,
        );
        assert!(response.starts_with("HTTP/1.1 200"));
        let joined = body_of(&response);
        assert_eq!(joined["participant_id"].as_str().unwrap().len(), 32);
        assert_eq!(joined["tcp_port"], 9001);

        assert_eq!(
            manager.get_room("Allegro").unwrap().participant_count(),
            1
        );

        // Invalid JSON, unknown room, and a full room.
        let response = http(api.addr(), "POST", "/api/rooms/Allegro/join", "not json");
        assert!(response.starts_with("HTTP/1.1 400"));
        let response = http(api.addr(), "POST", "/api/rooms/Nowhere/join", "{}");
        assert!(response.starts_with("HTTP/1.1 404"));

        http(api.addr(), "POST", "/api/rooms/Allegro/join", r#"{"alias":"bob"}"#);
        let response = http(api.addr(), "POST", "/api/rooms/Allegro/join", "{}");
        assert!(response.starts_with("HTTP/1.1 409"));

        api.stop();
    }

    #[test]
    fn claim_and_password_errors() {
        let (_manager, mut api) = start_api();

        let response = http(
            api.addr(),
            "POST",
            "/api/rooms/Ballata/claim",
            r#"{"password":"s3cret"}"#,
        );
        assert!(response.starts_with("HTTP/1.1 200"));

        let response = http(api.addr(), "POST", "/api/rooms/Ballata/join", "{}");
        assert!(response.starts_with("HTTP/1.1 401"));
        assert_eq!(body_of(&response)["error"], "password_required");

        let response = http(
            api.addr(),
            "POST",
            "/api/rooms/Ballata/join",
            r#"{"password":"wrong"}"#,
        );
        assert!(response.starts_with("HTTP/1.1 401"));
        assert_eq!(body_of(&response)["error"], "password_incorrect");

        let response = http(
            api.addr(),
            "POST",
            "/api/rooms/Ballata/join",
            r#"{"password":"s3cret"}"#,
        );
        assert!(response.starts_with("HTTP/1.1 200"));

        api.stop();
    }

    #[test]
    fn leave_and_vacate() {
        let (manager, mut api) = start_api();

        let response = http(
            api.addr(),
            "POST",
            "/api/rooms/Dolce/join",
            r#"{"alias":"alice"}"#,
        );
        let id = body_of(&response)["participant_id"]
            .as_str()
            .unwrap()
            .to_string();

        let response = http(api.addr(), "POST", "/api/rooms/Dolce/leave", "{}");
        assert!(response.starts_with("HTTP/1.1 400"));

        let response = http(
            api.addr(),
            "POST",
            "/api/rooms/Dolce/leave",
            &format!(r#"{{"participant_id":"{}"}}"#, id),
        );
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(manager.get_room("Dolce").unwrap().is_empty());

        // Vacating an empty room is refused; occupied works once, then
        // the requester is cooling down.
        let response = http(api.addr(), "POST", "/api/rooms/Dolce/vacate-request", "");
        assert!(response.starts_with("HTTP/1.1 400"));

        http(api.addr(), "POST", "/api/rooms/Dolce/join", r#"{"alias":"bob"}"#);
        let response = http(api.addr(), "POST", "/api/rooms/Dolce/vacate-request", "");
        assert!(response.starts_with("HTTP/1.1 200"));
        let response = http(api.addr(), "POST", "/api/rooms/Dolce/vacate-request", "");
        assert!(response.starts_with("HTTP/1.1 429"));

        api.stop();
    }
}
