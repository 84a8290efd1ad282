//! Ensemble server - low-latency rehearsal rooms
//!
//! Process entry point: wires the room registry, the session binder, the
//! plain-socket transport, and the HTTP API together, then waits for a
//! shutdown signal.
//!
//! ## Command line flags
//!
//! - `--bind <addr>` listen address (default 0.0.0.0)
//! - `--http-port <port>` REST API (default 8080)
//! - `--tcp-port <port>` reliable control channel (default 8081)
//! - `--udp-port <port>` audio datagrams (default 4433)
//! - `--max-participants <n>` per-room cap (default 4)

mod http;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ensemble_core::rooms::RoomManager;
use ensemble_core::transport::SessionBinder;

use http::HttpApi;
use transport::SocketTransport;

struct ServerOptions {
    bind: String,
    http_port: u16,
    tcp_port: u16,
    udp_port: u16,
    max_participants: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            http_port: 8080,
            tcp_port: 8081,
            udp_port: 4433,
            max_participants: 4,
        }
    }
}

fn print_usage() {
    println!(
        "Ensemble Server - Low-Latency Music Rehearsal\n\n\
         Usage: ensemble-server [options]\n\n\
         Options:\n\
         \x20 --bind <addr>            Bind address (default: 0.0.0.0)\n\
         \x20 --http-port <port>       HTTP API port (default: 8080)\n\
         \x20 --tcp-port <port>        Control channel port (default: 8081)\n\
         \x20 --udp-port <port>        Audio datagram port (default: 4433)\n\
         \x20 --max-participants <n>   Max participants per room (default: 4)\n\
         \x20 --help                   Show this help"
    );
}

/// Manual flag parsing; returns `None` when `--help` was requested or an
/// argument failed to parse.
fn parse_args(args: &[String]) -> Option<ServerOptions> {
    let mut opts = ServerOptions::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--bind" => opts.bind = iter.next()?.clone(),
            "--http-port" => opts.http_port = iter.next()?.parse().ok()?,
            "--tcp-port" => opts.tcp_port = iter.next()?.parse().ok()?,
            "--udp-port" => opts.udp_port = iter.next()?.parse().ok()?,
            "--max-participants" => opts.max_participants = iter.next()?.parse().ok()?,
            "--help" => return None,
            other => {
                eprintln!("Unknown option: {}", other);
                return None;
            }
        }
    }
    Some(opts)
}

#[cfg(unix)]
mod signals {
    use std::sync::atomic::{AtomicU32, Ordering};

    static SIGNAL_COUNT: AtomicU32 = AtomicU32::new(0);

    extern "C" fn handle(_signal: libc::c_int) {
        let count = SIGNAL_COUNT.fetch_add(1, Ordering::SeqCst) + 1;
        // Second signal: the orderly shutdown is stuck, bail out hard.
        if count >= 2 {
            unsafe { libc::_exit(1) }
        }
    }

    pub fn install() {
        unsafe {
            libc::signal(libc::SIGINT, handle as *const () as libc::sighandler_t);
            libc::signal(libc::SIGTERM, handle as *const () as libc::sighandler_t);
        }
    }

    pub fn requested() -> bool {
        SIGNAL_COUNT.load(Ordering::SeqCst) > 0
    }
}

#[cfg(not(unix))]
mod signals {
    pub fn install() {}

    pub fn requested() -> bool {
        false
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(opts) = parse_args(&args) else {
        print_usage();
        return Ok(());
    };

    println!("╔══════════════════════════════════════╗");
    println!("║      Ensemble - Play Together        ║");
    println!("║   Low-Latency Music Rehearsal        ║");
    println!("╚══════════════════════════════════════╝");
    println!();

    signals::install();

    let manager = Arc::new(RoomManager::new(opts.max_participants));
    manager
        .initialize_default_rooms()
        .context("seeding default rooms")?;
    manager.start_reaper().context("starting reaper")?;

    let binder = Arc::new(SessionBinder::new(Arc::clone(&manager)));

    let mut transport =
        SocketTransport::listen(&opts.bind, opts.tcp_port, opts.udp_port, binder)
            .context("starting plain-socket transport")?;
    let mut api = HttpApi::start(
        &opts.bind,
        opts.http_port,
        Arc::clone(&manager),
        transport.tcp_addr().port(),
        transport.udp_addr().port(),
    )
    .context("starting http api")?;

    log::info!("server running; press Ctrl+C to stop");
    println!("  HTTP API:  http://{}:{}/api/rooms", opts.bind, opts.http_port);
    println!("  Control:   tcp://{}", transport.tcp_addr());
    println!("  Audio:     udp://{}", transport.udp_addr());
    println!();

    while !signals::requested() {
        std::thread::sleep(Duration::from_millis(200));
    }

    log::info!("shutting down");
    api.stop();
    transport.stop();
    manager.shutdown();
    log::info!("goodbye");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_args_defaults_and_overrides() {
        let opts = parse_args(&[]).unwrap();
        assert_eq!(opts.bind, "0.0.0.0");
        assert_eq!(opts.http_port, 8080);
        assert_eq!(opts.max_participants, 4);

        let args: Vec<String> = ["--bind", "127.0.0.1", "--udp-port", "9999"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let opts = parse_args(&args).unwrap();
        assert_eq!(opts.bind, "127.0.0.1");
        assert_eq!(opts.udp_port, 9999);
    }

    #[test]
    fn parse_args_rejects_garbage() {
        let args: Vec<String> = ["--udp-port", "not-a-port"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(parse_args(&args).is_none());

        let args: Vec<String> = ["--frobnicate"].iter().map(|s| s.to_string()).collect();
        assert!(parse_args(&args).is_none());
    }
}
