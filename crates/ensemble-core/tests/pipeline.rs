//! End-to-end pipeline tests: join -> bind -> audio in -> personalized mix
//! out, across RoomManager, SessionBinder, Room, and the RT mix thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ensemble_core::protocol::ServerMessage;
use ensemble_core::rooms::RoomManager;
use ensemble_core::transport::{SessionBinder, TransportCallbacks, TransportSession};
use ensemble_core::{AudioFrame, AUDIO_PACKET_SIZE};
use serde_json::Value;

/// In-memory transport session that records everything the server sends.
struct LoopbackSession {
    id: String,
    datagrams: Mutex<Vec<Vec<u8>>>,
    messages: Mutex<Vec<String>>,
    connected: AtomicBool,
}

impl LoopbackSession {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            datagrams: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        })
    }

    fn received_datagrams(&self) -> Vec<Vec<u8>> {
        self.datagrams.lock().unwrap().clone()
    }

    fn received_messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl TransportSession for LoopbackSession {
    fn send_datagram(&self, data: &[u8]) -> bool {
        self.datagrams.lock().unwrap().push(data.to_vec());
        true
    }

    fn send_reliable(&self, message: &str) -> bool {
        self.messages.lock().unwrap().push(message.to_string());
        true
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn remote_address(&self) -> String {
        "127.0.0.1:0".to_string()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn audio_packet(value: i16, seq: u32) -> [u8; AUDIO_PACKET_SIZE] {
    let mut frame = AudioFrame::silence();
    frame.sequence = seq;
    frame.samples.fill(value);
    let mut buf = [0u8; AUDIO_PACKET_SIZE];
    frame.serialize(&mut buf);
    buf
}

/// Join a participant over the control plane and bind a fresh session for
/// them, the way the HTTP API plus a transport would.
fn join_and_bind(
    manager: &Arc<RoomManager>,
    binder: &SessionBinder,
    room: &str,
    alias: &str,
) -> (String, Arc<LoopbackSession>) {
    let participant_id = manager.join_room(room, alias, "", None).unwrap();
    let session = LoopbackSession::new(&format!("session-{}", alias));
    binder.on_session_open(session.clone());
    binder.on_message(
        &*session,
        &format!(
            r#"{{"type":"bind","participant_id":"{}","room":"{}"}}"#,
            participant_id, room
        ),
    );
    (participant_id, session)
}

fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_millis(500);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn two_party_session_exchanges_audio_end_to_end() {
    let manager = Arc::new(RoomManager::new(4));
    manager.initialize_default_rooms().unwrap();
    let binder = SessionBinder::new(Arc::clone(&manager));

    let (_alice_id, alice) = join_and_bind(&manager, &binder, "Allegro", "alice");
    let (_bob_id, bob) = join_and_bind(&manager, &binder, "Allegro", "bob");

    // Bob's bind delivered the room state listing both participants.
    let state: Value = serde_json::from_str(bob.received_messages().last().unwrap()).unwrap();
    assert_eq!(state["type"], "room_state");
    assert_eq!(state["participants"].as_array().unwrap().len(), 2);

    // Alice's datagram reaches bob directly (fast path) with the room's
    // own sequence numbering.
    binder.on_datagram(&*alice, &audio_packet(5000, 41));
    binder.on_datagram(&*alice, &audio_packet(5000, 42));

    let received = bob.received_datagrams();
    assert_eq!(received.len(), 2);
    for (i, datagram) in received.iter().enumerate() {
        assert_eq!(datagram.len(), AUDIO_PACKET_SIZE);
        let frame = AudioFrame::deserialize(datagram);
        assert_eq!(frame.sequence, i as u32);
        assert!(frame.samples.iter().all(|&s| s == 5000));
    }
    assert!(alice.received_datagrams().is_empty());

    manager.shutdown();
}

#[test]
fn three_party_session_mixes_through_the_rt_thread() {
    let manager = Arc::new(RoomManager::new(4));
    manager.initialize_default_rooms().unwrap();
    let binder = SessionBinder::new(Arc::clone(&manager));

    let (_a, alice) = join_and_bind(&manager, &binder, "Legato", "alice");
    let (_b, bob) = join_and_bind(&manager, &binder, "Legato", "bob");
    let (_c, carol) = join_and_bind(&manager, &binder, "Legato", "carol");

    // A mix tick can land between pushes and split one round across two
    // cycles, so send a short burst: after the first cycle every ingress
    // ring stays non-empty and full three-way mixes must appear.
    for seq in 0..5 {
        binder.on_datagram(&*alice, &audio_packet(1000, seq));
        binder.on_datagram(&*bob, &audio_packet(2000, seq));
        binder.on_datagram(&*carol, &audio_packet(3000, seq));
    }

    let expected = [
        (&alice, 5000i16), // bob + carol
        (&bob, 4000),      // alice + carol
        (&carol, 3000),    // alice + bob
    ];
    for (session, want) in expected {
        wait_for("a full three-way mix", || {
            session.received_datagrams().iter().any(|datagram| {
                AudioFrame::deserialize(datagram)
                    .samples
                    .iter()
                    .all(|&s| s == want)
            })
        });
    }

    manager.shutdown();
}

#[test]
fn gain_controls_apply_to_the_senders_own_mix() {
    let manager = Arc::new(RoomManager::new(4));
    manager.initialize_default_rooms().unwrap();
    let binder = SessionBinder::new(Arc::clone(&manager));

    let (_a, alice) = join_and_bind(&manager, &binder, "Dolce", "alice");
    let (bob_id, bob) = join_and_bind(&manager, &binder, "Dolce", "bob");

    // Alice halves bob in her mix; bob's hearing of alice is untouched.
    binder.on_message(
        &*alice,
        &format!(r#"{{"type":"set_gain","source":"{}","gain":0.5}}"#, bob_id),
    );

    binder.on_datagram(&*bob, &audio_packet(10_000, 0));
    let frame = AudioFrame::deserialize(&alice.received_datagrams()[0]);
    assert!(frame.samples.iter().all(|&s| s == 5000));

    manager.shutdown();
}

#[test]
fn session_close_leaves_the_room_and_notifies_peers() {
    let manager = Arc::new(RoomManager::new(4));
    manager.initialize_default_rooms().unwrap();
    let binder = SessionBinder::new(Arc::clone(&manager));

    let (_a, alice) = join_and_bind(&manager, &binder, "Ostinato", "alice");
    let (_b, bob) = join_and_bind(&manager, &binder, "Ostinato", "bob");

    binder.on_session_close(&*bob);

    let room = manager.get_room("Ostinato").unwrap();
    assert_eq!(room.participant_count(), 1);

    let left: Value = serde_json::from_str(alice.received_messages().last().unwrap()).unwrap();
    assert_eq!(left["type"], "participant_left");

    manager.shutdown();
}

#[test]
fn vacate_request_reaches_every_occupant() {
    let manager = Arc::new(RoomManager::new(4));
    manager.initialize_default_rooms().unwrap();
    let binder = SessionBinder::new(Arc::clone(&manager));

    let (_a, alice) = join_and_bind(&manager, &binder, "Maestoso", "alice");
    let (_b, bob) = join_and_bind(&manager, &binder, "Maestoso", "bob");

    assert_eq!(
        manager.vacate_request("Maestoso", "10.0.0.1"),
        ensemble_core::rooms::VacateOutcome::Sent
    );

    let expected = ServerMessage::VacateRequest.to_json();
    for session in [&alice, &bob] {
        assert_eq!(session.received_messages().last().unwrap(), &expected);
    }

    manager.shutdown();
}
