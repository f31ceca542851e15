//! Integration tests for the session state machine.
//!
//! A scripted SUPL server runs on a background thread with blocking std
//! sockets; the session runs on the test thread's scheduler.

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use event_scheduler::Scheduler;
use lpp_session::delivery::PeriodicDelivery;
use lpp_session::message::{
    EnvelopeCodec, Initiator, LppCodec, LppMessage, MessageBody, TransactionId,
};
use lpp_session::session::{Session, SessionConfig, SessionError};
use lpp_session::state::SessionState;
use lpp_session::supl::{Cell as RadioCell, End, Identity, Payload, Pos, Response};
use lpp_session::transaction::TransactionHandle;
use lpp_session::ulp::{Frame, SlpSessionId, UlpBody, UlpCodec, UlpEnvelope, UlpMessage};

fn run_until<F: FnMut() -> bool>(scheduler: &Scheduler, limit: Duration, mut done: F) -> bool {
    let deadline = Instant::now() + limit;
    while !done() {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        scheduler
            .execute_timeout((deadline - now).min(Duration::from_millis(5)))
            .unwrap();
    }
    true
}

fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn new_session() -> Session {
    Session::new(
        SessionConfig::new(Identity::Msisdn(46_700_000_001), RadioCell::lte(240, 1, 7, 42)),
        EnvelopeCodec,
    )
}

// ---------------------------------------------------------------------------
// Scripted server helpers
// ---------------------------------------------------------------------------

struct FakeServer {
    stream: TcpStream,
    template: Option<UlpMessage>,
}

impl FakeServer {
    fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self {
            stream,
            template: None,
        }
    }

    fn read(&mut self) -> UlpMessage {
        let mut len = [0u8; 2];
        self.stream.read_exact(&mut len).unwrap();
        let total = u16::from_be_bytes(len) as usize;
        let mut pdu = len.to_vec();
        pdu.resize(total, 0);
        self.stream.read_exact(&mut pdu[2..]).unwrap();
        match UlpEnvelope.decode(&pdu) {
            Frame::Complete(message, consumed) => {
                assert_eq!(consumed, total);
                message
            }
            other => panic!("server could not decode PDU: {other:?}"),
        }
    }

    fn send(&mut self, body: UlpBody) {
        let mut message = self.template.clone().expect("START not received yet");
        message.body = body;
        let bytes = UlpEnvelope.encode(&message).unwrap();
        self.stream.write_all(&bytes).unwrap();
    }

    /// START → RESPONSE → POSINIT.
    fn handshake(&mut self) {
        let start = self.read();
        assert!(matches!(start.body, UlpBody::Start(_)), "expected START");
        assert_eq!(start.slp_session, None);
        let mut template = start;
        template.slp_session = Some(SlpSessionId([1, 2, 3, 4]));
        self.template = Some(template);
        self.send(UlpBody::Response(Response { pos_method: 1 }));

        let posinit = self.read();
        assert!(matches!(posinit.body, UlpBody::PosInit(_)), "expected POSINIT");
        assert_eq!(posinit.slp_session, Some(SlpSessionId([1, 2, 3, 4])));
    }

    fn read_lpp(&mut self) -> Vec<LppMessage> {
        match self.read().body {
            UlpBody::Pos(pos) => pos
                .payloads
                .iter()
                .map(|p| EnvelopeCodec.decode(&p.data).unwrap())
                .collect(),
            other => panic!("expected POS, got {}", other.name()),
        }
    }

    fn send_lpp(&mut self, message: &LppMessage) {
        let bytes = EnvelopeCodec.encode(message).unwrap();
        self.send(UlpBody::Pos(Pos {
            payloads: vec![Payload::lpp(bytes)],
        }));
    }

    fn wait_for_close(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }
}

fn server_message(
    initiator: Initiator,
    number: u8,
    end: bool,
    body: &[u8],
) -> LppMessage {
    LppMessage {
        transaction_id: Some(TransactionId { initiator, number }),
        end_transaction: end,
        sequence_number: Some(0),
        body: Some(MessageBody::Payload(body.to_vec())),
    }
}

fn spawn_server<F>(script: F) -> (u16, JoinHandle<Vec<LppMessage>>)
where
    F: FnOnce(&mut FakeServer) -> Vec<LppMessage> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let mut server = FakeServer::accept(&listener);
        script(&mut server)
    });
    (port, handle)
}

#[derive(Default)]
struct Observed {
    connected: Cell<u32>,
    established: Cell<u32>,
    disconnected: Cell<u32>,
    begun: RefCell<Vec<TransactionHandle>>,
    server_ended: RefCell<Vec<TransactionHandle>>,
    ended: RefCell<Vec<TransactionHandle>>,
    messages: RefCell<Vec<(TransactionHandle, LppMessage)>>,
}

fn observe(session: &Session) -> Rc<Observed> {
    let observed = Rc::new(Observed::default());
    let o = observed.clone();
    session.on_connected(move |_| o.connected.set(o.connected.get() + 1));
    let o = observed.clone();
    session.on_disconnected(move |_| o.disconnected.set(o.disconnected.get() + 1));
    let o = observed.clone();
    session.on_begin_transaction(move |_, h| o.begun.borrow_mut().push(*h));
    let o = observed.clone();
    session.on_end_transaction(move |_, h| o.ended.borrow_mut().push(*h));
    let o = observed.clone();
    session.on_message(move |_, h, m| o.messages.borrow_mut().push((*h, m)));
    let o = observed.clone();
    session.on_server_end_transaction(move |session, h| {
        o.server_ended.borrow_mut().push(*h);
        session.delete_transaction(h).unwrap();
    });
    observed
}

// ---------------------------------------------------------------------------
// Test 1: full exchange ending with SUPL END
// ---------------------------------------------------------------------------

#[test]
fn test_session_handshake_messages_and_end() {
    let (port, server) = spawn_server(|server| {
        server.handshake();
        let from_client = server.read_lpp();
        let client_tid = from_client[0].transaction_id.unwrap();

        server.send_lpp(&server_message(Initiator::LocationServer, 7, false, b"hello"));
        server.send_lpp(&server_message(
            Initiator::TargetDevice,
            client_tid.number,
            true,
            b"pong",
        ));
        server.send(UlpBody::End(End { status: None }));
        server.wait_for_close();
        from_client
    });

    let scheduler = Scheduler::new().unwrap();
    let session = new_session();
    let observed = observe(&session);
    let client_handle = Rc::new(Cell::new(None));
    {
        let client_handle = client_handle.clone();
        let o = observed.clone();
        session.on_established(move |session| {
            o.established.set(o.established.get() + 1);
            let handle = session.create_transaction(false).unwrap();
            session.send(&handle, LppMessage::payload(&b"ping"[..])).unwrap();
            client_handle.set(Some(handle));
        });
    }

    session.connect("127.0.0.1", port).unwrap();
    session.schedule(&scheduler).unwrap();
    assert!(run_until(&scheduler, Duration::from_secs(5), || {
        session.state() == SessionState::Exit
    }));

    let from_client = server.join().unwrap();
    let client_handle = client_handle.get().unwrap();
    assert_eq!(from_client.len(), 1);
    assert_eq!(
        from_client[0].transaction_id,
        Some(TransactionId {
            initiator: Initiator::TargetDevice,
            number: client_handle.id() as u8,
        })
    );
    assert_eq!(from_client[0].sequence_number, Some(0));
    assert!(!from_client[0].end_transaction);
    assert_eq!(from_client[0].body, Some(MessageBody::Payload(b"ping".to_vec())));

    assert_eq!(observed.connected.get(), 1);
    assert_eq!(observed.established.get(), 1);
    assert_eq!(observed.disconnected.get(), 1);

    let messages = observed.messages.borrow();
    assert_eq!(messages.len(), 2);
    let (server_handle, hello) = &messages[0];
    assert_eq!(server_handle.initiator(), Initiator::LocationServer);
    assert_eq!(server_handle.id(), 7);
    assert_eq!(hello.body, Some(MessageBody::Payload(b"hello".to_vec())));
    assert_eq!(messages[1].0, client_handle);

    // Client transaction first, then the one the server opened.
    assert_eq!(*observed.begun.borrow(), vec![client_handle, *server_handle]);
    assert_eq!(*observed.server_ended.borrow(), vec![client_handle]);
    assert_eq!(*observed.ended.borrow(), vec![client_handle]);
    assert!(session.has_transaction(server_handle));
    assert!(!session.has_transaction(&client_handle));
}

// ---------------------------------------------------------------------------
// Test 2: nothing listening
// ---------------------------------------------------------------------------

#[test]
fn test_connection_refused_exits() {
    let scheduler = Scheduler::new().unwrap();
    let session = new_session();
    let observed = observe(&session);

    session.connect("127.0.0.1", unused_port()).unwrap();
    session.schedule(&scheduler).unwrap();
    assert!(run_until(&scheduler, Duration::from_secs(5), || {
        session.state() == SessionState::Exit
    }));
    assert_eq!(observed.connected.get(), 0);
    assert_eq!(observed.disconnected.get(), 1);
    assert_eq!(scheduler.registered_count(), 0);
}

// ---------------------------------------------------------------------------
// Test 3: server answers START with END
// ---------------------------------------------------------------------------

#[test]
fn test_handshake_rejected() {
    let (port, server) = spawn_server(|server| {
        let start = server.read();
        server.template = Some(start);
        server.send(UlpBody::End(End { status: Some(3) }));
        server.wait_for_close();
        Vec::new()
    });

    let scheduler = Scheduler::new().unwrap();
    let session = new_session();
    let observed = observe(&session);
    let established = Rc::new(Cell::new(false));
    {
        let established = established.clone();
        session.on_established(move |_| established.set(true));
    }

    session.connect("127.0.0.1", port).unwrap();
    session.schedule(&scheduler).unwrap();
    assert!(run_until(&scheduler, Duration::from_secs(5), || {
        session.state() == SessionState::Exit
    }));
    server.join().unwrap();

    assert_eq!(observed.connected.get(), 1);
    assert!(!established.get());
    assert_eq!(observed.disconnected.get(), 1);
}

// ---------------------------------------------------------------------------
// Test 4: periodic delivery until the server hangs up
// ---------------------------------------------------------------------------

#[test]
fn test_periodic_delivery_sends_on_interval() {
    let (port, server) = spawn_server(|server| {
        server.handshake();
        let mut received = Vec::new();
        for _ in 0..3 {
            received.extend(server.read_lpp());
        }
        server.send(UlpBody::End(End { status: None }));
        server.wait_for_close();
        received
    });

    let scheduler = Scheduler::new().unwrap();
    let session = new_session();
    let delivery: Rc<RefCell<Option<PeriodicDelivery>>> = Rc::new(RefCell::new(None));
    {
        let delivery = delivery.clone();
        let scheduler = scheduler.clone();
        session.on_established(move |session| {
            let handle = session.create_transaction(false).unwrap();
            let mut n = 0u8;
            let periodic =
                PeriodicDelivery::new(session, handle, Duration::from_millis(20), move || {
                    n += 1;
                    Some(MessageBody::Payload(vec![n]))
                });
            assert!(periodic.schedule(&scheduler));
            *delivery.borrow_mut() = Some(periodic);
        });
    }

    session.connect("127.0.0.1", port).unwrap();
    session.schedule(&scheduler).unwrap();
    assert!(run_until(&scheduler, Duration::from_secs(5), || {
        session.state() == SessionState::Exit
    }));

    let received = server.join().unwrap();
    let bodies: Vec<_> = received.iter().map(|m| m.body.clone()).collect();
    assert_eq!(
        bodies,
        vec![
            Some(MessageBody::Payload(vec![1])),
            Some(MessageBody::Payload(vec![2])),
            Some(MessageBody::Payload(vec![3])),
        ]
    );
    let sequence: Vec<_> = received.iter().map(|m| m.sequence_number).collect();
    assert_eq!(sequence, vec![Some(0), Some(1), Some(2)]);

    let delivery = delivery.borrow();
    assert!(delivery.as_ref().unwrap().deliveries() >= 3);
}

// ---------------------------------------------------------------------------
// Test 5: cancel from a callback
// ---------------------------------------------------------------------------

#[test]
fn test_cancel_inside_established_callback() {
    let (port, server) = spawn_server(|server| {
        server.handshake();
        server.wait_for_close();
        Vec::new()
    });

    let scheduler = Scheduler::new().unwrap();
    let session = new_session();
    let observed = observe(&session);
    session.on_established(|session| session.cancel());

    session.connect("127.0.0.1", port).unwrap();
    session.schedule(&scheduler).unwrap();
    assert!(run_until(&scheduler, Duration::from_secs(5), || {
        session.state() == SessionState::Exit
    }));
    server.join().unwrap();

    assert_eq!(observed.disconnected.get(), 0);
    assert_eq!(scheduler.registered_count(), 0);
    session.cancel();
    assert_eq!(session.state(), SessionState::Exit);
}

// ---------------------------------------------------------------------------
// Test 6: API misuse without a connection
// ---------------------------------------------------------------------------

#[test]
fn test_connect_only_from_unknown() {
    let session = new_session();
    session.connect("127.0.0.1", 1).unwrap();
    assert_eq!(session.state(), SessionState::Connect);
    assert!(matches!(
        session.connect("127.0.0.1", 1),
        Err(SessionError::InvalidState(SessionState::Connect))
    ));
}

#[test]
fn test_send_rejects_stamped_and_unconnected() {
    let session = new_session();
    let observed = observe(&session);
    let handle = session.create_transaction(true).unwrap();
    assert_eq!(*observed.begun.borrow(), vec![handle]);

    let stamped = LppMessage {
        sequence_number: Some(4),
        ..LppMessage::payload(&b"x"[..])
    };
    assert!(matches!(
        session.send(&handle, stamped),
        Err(SessionError::AlreadyStamped("sequenceNumber"))
    ));
    assert!(matches!(
        session.send(&handle, LppMessage::payload(&b"x"[..])),
        Err(SessionError::NoTransport)
    ));

    // A failed send with end leaves the transaction open.
    assert!(session.abort(&handle).is_err());
    assert!(session.has_transaction(&handle));

    session.delete_transaction(&handle).unwrap();
    assert_eq!(*observed.ended.borrow(), vec![handle]);
    assert!(matches!(
        session.send(&handle, LppMessage::payload(&b"x"[..])),
        Err(SessionError::Transaction(_))
    ));
}

// ---------------------------------------------------------------------------
// Test 7: inbound payload dispatch rules
// ---------------------------------------------------------------------------

#[test]
fn test_inbound_payload_rules() {
    let session = new_session();
    let observed = observe(&session);
    let encode = |m: &LppMessage| EnvelopeCodec.encode(m).unwrap();

    // Unknown client-initiated transaction: dropped.
    session.process_lpp_payload(&encode(&server_message(Initiator::TargetDevice, 9, false, b"x")));
    assert!(observed.messages.borrow().is_empty());
    assert!(observed.begun.borrow().is_empty());

    // Unknown server-initiated transaction ending at once: created,
    // delivered, then closed after the callback.
    session.process_lpp_payload(&encode(&server_message(Initiator::LocationServer, 3, true, b"y")));
    assert_eq!(observed.begun.borrow().len(), 1);
    assert_eq!(observed.messages.borrow().len(), 1);
    assert_eq!(observed.ended.borrow().len(), 1);
    assert!(observed.server_ended.borrow().is_empty());
    assert_eq!(session.transaction_count(), 0);

    // Garbage and messages without a transaction id are ignored.
    session.process_lpp_payload(&[0xff, 0, 0, 0, 0]);
    session.process_lpp_payload(&encode(&LppMessage::payload(&b"z"[..])));
    assert_eq!(observed.messages.borrow().len(), 1);
}

#[test]
fn test_client_transaction_ended_inside_message_callback() {
    let session = new_session();
    let ended = Rc::new(RefCell::new(Vec::new()));
    {
        let ended = ended.clone();
        session.on_end_transaction(move |_, h| ended.borrow_mut().push(*h));
    }
    session.on_message(|session, h, _| {
        // The server end is applied after this returns and closes it.
        session.delete_transaction(h).unwrap();
    });

    let handle = session.create_transaction(false).unwrap();
    let message = server_message(Initiator::TargetDevice, handle.id() as u8, true, b"done");
    session.process_lpp_payload(&EnvelopeCodec.encode(&message).unwrap());

    assert_eq!(*ended.borrow(), vec![handle]);
    assert!(!session.has_transaction(&handle));
}

// ---------------------------------------------------------------------------
// Test 8: delivery stops once its transaction is gone
// ---------------------------------------------------------------------------

#[test]
fn test_delivery_stops_without_transaction() {
    let scheduler = Scheduler::new().unwrap();
    let session = new_session();
    let handle = session.create_transaction(true).unwrap();
    let calls = Rc::new(Cell::new(0u32));
    let delivery = {
        let calls = calls.clone();
        PeriodicDelivery::new(&session, handle, Duration::from_millis(5), move || {
            calls.set(calls.get() + 1);
            None
        })
    };
    assert!(delivery.schedule(&scheduler));

    assert!(run_until(&scheduler, Duration::from_secs(2), || calls.get() >= 2));
    session.delete_transaction(&handle).unwrap();
    assert!(run_until(&scheduler, Duration::from_secs(2), || {
        !delivery.is_scheduled()
    }));
    assert_eq!(delivery.deliveries(), 0);
}
