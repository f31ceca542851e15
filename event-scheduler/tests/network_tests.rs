//! Integration tests for the socket backends: TCP server and client streams,
//! UDP streams, and the listener/connect tasks underneath them.
//!
//! Peers are plain blocking std sockets on loopback; the scheduler runs on
//! the test thread between peer operations.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

use event_scheduler::connect::{ConnectConfig, ConnectTask};
use event_scheduler::listener::{TcpListenerTask, UdpListenerTask};
use event_scheduler::stream::{
    ReadConfig, Stream, StreamError, TcpClientConfig, TcpServerConfig, UdpClientConfig,
    UdpServerConfig,
};
use event_scheduler::{Scheduler, StreamState};

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

/// A loopback port nothing is listening on (right now).
fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn collect_bytes(stream: &Stream) -> Rc<RefCell<Vec<u8>>> {
    let bytes = Rc::new(RefCell::new(Vec::new()));
    let sink = bytes.clone();
    stream.on_read(move |_, data| sink.borrow_mut().extend_from_slice(data));
    bytes
}

// ---------------------------------------------------------------------------
// Test 1: TCP server with three clients, then a broadcast
// ---------------------------------------------------------------------------

#[test]
fn test_tcp_server_three_clients_and_broadcast() {
    let scheduler = Scheduler::new().unwrap();
    let server = Stream::tcp_server(
        "server",
        TcpServerConfig::inet("127.0.0.1", 0),
        ReadConfig::default(),
    );
    server.schedule(&scheduler).unwrap();
    let port = server.actual_port().expect("bound port");
    assert_ne!(port, 0);
    let received = collect_bytes(&server);

    let messages = [
        b"<client-1:alpha>".to_vec(),
        b"<client-2:bravo-bravo>".to_vec(),
        b"<client-3:charlie-charlie-charlie>".to_vec(),
    ];
    let mut clients: Vec<TcpStream> = messages
        .iter()
        .map(|msg| {
            let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
            client.write_all(msg).unwrap();
            client
        })
        .collect();

    let total: usize = messages.iter().map(Vec::len).sum();
    assert!(run_until(&scheduler, Duration::from_secs(5), || {
        received.borrow().len() >= total && server.client_count() == 3
    }));

    let received = received.borrow().clone();
    assert_eq!(received.len(), total);
    for msg in &messages {
        assert!(
            received.windows(msg.len()).any(|w| w == msg.as_slice()),
            "{} arrived split or corrupted",
            String::from_utf8_lossy(msg)
        );
    }

    server.write(b"broadcast: all hands").unwrap();
    scheduler.execute_timeout(Duration::from_millis(20)).unwrap();
    for client in &mut clients {
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 20];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"broadcast: all hands");
    }
}

#[test]
fn test_tcp_server_drops_closed_clients() {
    let scheduler = Scheduler::new().unwrap();
    let server = Stream::tcp_server(
        "server",
        TcpServerConfig::inet("127.0.0.1", 0),
        ReadConfig::default(),
    );
    server.schedule(&scheduler).unwrap();
    let port = server.actual_port().unwrap();

    let a = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let b = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(run_until(&scheduler, Duration::from_secs(2), || server.client_count() == 2));

    drop(a);
    assert!(run_until(&scheduler, Duration::from_secs(2), || server.client_count() == 1));
    assert_eq!(server.state(), StreamState::Connected);

    drop(b);
    assert!(run_until(&scheduler, Duration::from_secs(2), || server.client_count() == 0));

    server.cancel();
    assert_eq!(scheduler.registered_count(), 0);
}

// ---------------------------------------------------------------------------
// Test 2: TCP client stream
// ---------------------------------------------------------------------------

#[test]
fn test_tcp_client_round_trip_and_queue_while_connecting() {
    let scheduler = Scheduler::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = Stream::tcp_client(
        "client",
        TcpClientConfig::inet("127.0.0.1", port),
        ReadConfig::default(),
    );
    client.schedule(&scheduler).unwrap();
    // Accepted into the queue whether or not the handshake already finished.
    client.write(b"early").unwrap();

    let received = collect_bytes(&client);
    assert!(run_until(&scheduler, Duration::from_secs(2), || client.is_connected()));
    scheduler.execute_timeout(Duration::from_millis(20)).unwrap();
    assert_eq!(client.pending_writes(), 0);

    let (mut peer, _) = listener.accept().unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 5];
    peer.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"early");

    peer.write_all(b"pong").unwrap();
    assert!(run_until(&scheduler, Duration::from_secs(2), || received.borrow().len() == 4));
    assert_eq!(received.borrow().as_slice(), b"pong");

    let completed = Rc::new(RefCell::new(false));
    {
        let completed = completed.clone();
        client.on_complete(move |_| *completed.borrow_mut() = true);
    }
    drop(peer);
    assert!(run_until(&scheduler, Duration::from_secs(2), || *completed.borrow()));
    assert_eq!(client.state(), StreamState::Disconnected);
}

#[test]
fn test_tcp_client_refused_without_reconnect() {
    let scheduler = Scheduler::new().unwrap();
    let client = Stream::tcp_client(
        "client",
        TcpClientConfig::inet("127.0.0.1", unused_port()),
        ReadConfig::default(),
    );
    let errors = Rc::new(RefCell::new(Vec::new()));
    {
        let errors = errors.clone();
        client.on_error(move |_, err| errors.borrow_mut().push(err.to_string()));
    }

    match client.schedule(&scheduler) {
        // Refused synchronously.
        Err(_) => assert_eq!(client.state(), StreamState::Error),
        Ok(()) => {
            assert!(run_until(&scheduler, Duration::from_secs(2), || client.state()
                == StreamState::Error));
            assert_eq!(errors.borrow().len(), 1);
        }
    }
    assert_eq!(scheduler.registered_count(), 0);
}

#[test]
fn test_tcp_client_reconnects_after_refusal() {
    let scheduler = Scheduler::new().unwrap();
    let port = unused_port();
    let client = Stream::tcp_client(
        "client",
        TcpClientConfig::inet("127.0.0.1", port).with_reconnect(Duration::from_millis(30)),
        ReadConfig::default(),
    );
    let errors = Rc::new(RefCell::new(0));
    {
        let errors = errors.clone();
        client.on_error(move |_, _| *errors.borrow_mut() += 1);
    }
    client.schedule(&scheduler).unwrap();

    assert!(run_until(&scheduler, Duration::from_secs(3), || *errors.borrow() >= 2));
    assert!(!client.is_connected());

    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    assert!(run_until(&scheduler, Duration::from_secs(3), || client.is_connected()));
    let _peer = listener.accept().unwrap();

    client.cancel();
    assert_eq!(scheduler.registered_count(), 0);
}

// ---------------------------------------------------------------------------
// Test 3: UDP client and server streams
// ---------------------------------------------------------------------------

#[test]
fn test_udp_server_replies_to_last_sender() {
    let scheduler = Scheduler::new().unwrap();
    let server = Stream::udp_server(
        "udp-server",
        UdpServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
        ReadConfig::default(),
    );
    server.schedule(&scheduler).unwrap();
    assert!(matches!(server.write(b"nobody"), Err(StreamError::NoPeer)));
    let port = server.actual_port().unwrap();

    let client = Stream::udp_client(
        "udp-client",
        UdpClientConfig {
            host: "127.0.0.1".into(),
            port,
        },
        ReadConfig::default(),
    );
    client.schedule(&scheduler).unwrap();

    let at_server = collect_bytes(&server);
    let at_client = collect_bytes(&client);

    client.write(b"hello").unwrap();
    assert!(run_until(&scheduler, Duration::from_secs(2), || at_server.borrow().len() == 5));
    assert_eq!(at_server.borrow().as_slice(), b"hello");

    server.write(b"world").unwrap();
    assert!(run_until(&scheduler, Duration::from_secs(2), || at_client.borrow().len() == 5));
    assert_eq!(at_client.borrow().as_slice(), b"world");
}

// ---------------------------------------------------------------------------
// Test 4: listener and connect tasks on their own
// ---------------------------------------------------------------------------

#[test]
fn test_listener_reports_ephemeral_port_and_accepts() {
    let scheduler = Scheduler::new().unwrap();
    let listener = TcpListenerTask::inet("127.0.0.1", 0);
    assert_eq!(listener.actual_port(), None);

    let accepted = Rc::new(RefCell::new(Vec::new()));
    {
        let accepted = accepted.clone();
        listener.on_accept(move |_, conn| accepted.borrow_mut().push(conn));
    }
    listener.schedule(&scheduler).unwrap();
    let port = listener.actual_port().unwrap();

    let _a = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let _b = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(run_until(&scheduler, Duration::from_secs(2), || listener.accepted() == 2));
    assert!(accepted.borrow().iter().all(|c| c.peer.is_some()));

    listener.cancel();
    assert!(!listener.is_scheduled());
}

#[test]
fn test_unix_listener_removes_socket_path_on_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ctl.sock");
    let scheduler = Scheduler::new().unwrap();

    let listener = TcpListenerTask::unix(&path);
    listener.on_accept(|_, conn| assert!(conn.peer.is_none()));
    listener.schedule(&scheduler).unwrap();
    assert!(path.exists());

    let _client = UnixStream::connect(&path).unwrap();
    assert!(run_until(&scheduler, Duration::from_secs(2), || listener.accepted() == 1));

    listener.cancel();
    assert!(!path.exists());
}

#[test]
fn test_udp_listener_sees_sender() {
    let scheduler = Scheduler::new().unwrap();
    let listener = UdpListenerTask::new("127.0.0.1", 0);
    let seen = Rc::new(RefCell::new(None));
    {
        let seen = seen.clone();
        listener.on_read(move |task, data, from| {
            *seen.borrow_mut() = Some((data.to_vec(), from));
            task.send_to(b"ack", from).unwrap();
        });
    }
    listener.schedule(&scheduler).unwrap();
    let port = listener.actual_port().unwrap();

    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    socket.send_to(b"fix", ("127.0.0.1", port)).unwrap();
    assert!(run_until(&scheduler, Duration::from_secs(2), || seen.borrow().is_some()));

    let (data, from) = seen.borrow().clone().unwrap();
    assert_eq!(data, b"fix");
    assert_eq!(from, socket.local_addr().unwrap());

    let mut buf = [0u8; 8];
    let n = socket.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ack");
}

#[test]
fn test_connect_task_reports_connected_once() {
    let scheduler = Scheduler::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let task = ConnectTask::inet("127.0.0.1", port);
    let connected = Rc::new(RefCell::new(0));
    {
        let connected = connected.clone();
        task.on_connected(move |_| *connected.borrow_mut() += 1);
    }
    task.schedule(&scheduler).unwrap();
    assert!(run_until(&scheduler, Duration::from_secs(2), || task.is_connected()));
    scheduler.execute_timeout(Duration::from_millis(20)).unwrap();

    assert_eq!(*connected.borrow(), 1);
    assert_eq!(task.attempts(), 1);
    assert!(task.peer_addr().is_some());

    task.cancel();
    assert_eq!(task.state(), StreamState::Disconnected);
    assert_eq!(scheduler.registered_count(), 0);
}

#[test]
fn test_connect_task_reconnect_delay_is_adjustable() {
    let scheduler = Scheduler::new().unwrap();
    let task = ConnectTask::new(
        event_scheduler::socket::Endpoint::inet("127.0.0.1", unused_port()),
        ConnectConfig {
            reconnect: true,
            reconnect_delay: Duration::from_secs(60),
        },
    );
    let failures = Rc::new(RefCell::new(0));
    {
        let failures = failures.clone();
        task.on_error(move |_, _| *failures.borrow_mut() += 1);
    }
    task.schedule(&scheduler).unwrap();
    assert!(run_until(&scheduler, Duration::from_secs(2), || *failures.borrow() == 1));
    assert!(task.is_reconnect_pending());

    // The pending retry keeps its 60 s delay; later ones use the new value.
    task.set_reconnect_delay(Duration::from_millis(10));
    assert_eq!(task.reconnect_delay(), Duration::from_millis(10));
    scheduler.execute_timeout(Duration::from_millis(100)).unwrap();
    assert_eq!(*failures.borrow(), 1);

    task.cancel();
    assert!(!task.is_reconnect_pending());
}
