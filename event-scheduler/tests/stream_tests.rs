//! Integration tests for read buffering, fan-out and write backpressure.
//!
//! Each test wraps one end of a `UnixStream` pair in an fd-backed [`Stream`]
//! and drives the other end with ordinary blocking or non-blocking std I/O
//! while the scheduler runs on the test thread.

use std::cell::RefCell;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

use event_scheduler::stream::{FdConfig, ReadConfig, Stream, StreamError, WriteConfig};
use event_scheduler::{Scheduler, StreamState};
use rand::Rng;

/// Run the scheduler until `done` holds or `limit` elapses.
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

/// A scheduled stream over one end of a socket pair, plus the other end.
fn stream_pair(scheduler: &Scheduler, read: ReadConfig) -> (Stream, UnixStream) {
    let (ours, theirs) = UnixStream::pair().unwrap();
    let stream = Stream::fd("pair", FdConfig::owned(ours), read);
    stream.schedule(scheduler).unwrap();
    (stream, theirs)
}

fn collect(stream: &Stream) -> Rc<RefCell<Vec<Vec<u8>>>> {
    let deliveries = Rc::new(RefCell::new(Vec::new()));
    let sink = deliveries.clone();
    stream.on_read(move |_, data| sink.borrow_mut().push(data.to_vec()));
    deliveries
}

// ---------------------------------------------------------------------------
// Test 1: every observer sees every delivery, in registration order
// ---------------------------------------------------------------------------

#[test]
fn test_fan_out_reaches_all_observers_in_order() {
    let scheduler = Scheduler::new().unwrap();
    let (stream, mut peer) = stream_pair(&scheduler, ReadConfig::default());

    let log: Rc<RefCell<Vec<(char, Vec<u8>)>>> = Rc::new(RefCell::new(Vec::new()));
    for tag in ['a', 'b', 'c'] {
        let log = log.clone();
        stream.on_read(move |_, data| log.borrow_mut().push((tag, data.to_vec())));
    }

    peer.write_all(b"1234567").unwrap();
    assert!(run_until(&scheduler, Duration::from_secs(2), || log.borrow().len() >= 3));

    let log = log.borrow();
    assert_eq!(log.len(), 3);
    assert_eq!(log.iter().map(|(t, _)| *t).collect::<String>(), "abc");
    assert!(log.iter().all(|(_, d)| d == b"1234567"));
    assert_eq!(stream.bytes_read(), 7);
}

// ---------------------------------------------------------------------------
// Test 2: removing an observer mid-delivery only affects later deliveries
// ---------------------------------------------------------------------------

#[test]
fn test_observer_removal_takes_effect_next_delivery() {
    let scheduler = Scheduler::new().unwrap();
    let (stream, mut peer) = stream_pair(&scheduler, ReadConfig::default());

    let second_seen = Rc::new(RefCell::new(0usize));
    let first_seen = Rc::new(RefCell::new(0usize));

    let victim = Rc::new(RefCell::new(None));
    {
        let victim = victim.clone();
        let first_seen = first_seen.clone();
        stream.on_read(move |stream, _| {
            *first_seen.borrow_mut() += 1;
            if let Some(handle) = victim.borrow_mut().take() {
                assert!(stream.remove_on_read(handle));
            }
        });
    }
    {
        let second_seen = second_seen.clone();
        let handle = stream.on_read(move |_, _| *second_seen.borrow_mut() += 1);
        *victim.borrow_mut() = Some(handle);
    }

    peer.write_all(b"one").unwrap();
    assert!(run_until(&scheduler, Duration::from_secs(2), || *first_seen.borrow() == 1));
    assert_eq!(*second_seen.borrow(), 1);

    peer.write_all(b"two").unwrap();
    assert!(run_until(&scheduler, Duration::from_secs(2), || *first_seen.borrow() == 2));
    assert_eq!(*second_seen.borrow(), 1);
}

// ---------------------------------------------------------------------------
// Test 3: min_bytes holds data back until the threshold is crossed
// ---------------------------------------------------------------------------

#[test]
fn test_min_bytes_without_timeout() {
    let scheduler = Scheduler::new().unwrap();
    let (stream, mut peer) = stream_pair(&scheduler, ReadConfig::buffered(8, None));
    let deliveries = collect(&stream);

    peer.write_all(b"abc").unwrap();
    scheduler.execute_timeout(Duration::from_millis(50)).unwrap();
    assert!(deliveries.borrow().is_empty());

    peer.write_all(b"defgh").unwrap();
    assert!(run_until(&scheduler, Duration::from_secs(2), || !deliveries.borrow().is_empty()));
    assert_eq!(deliveries.borrow().as_slice(), &[b"abcdefgh".to_vec()]);
}

// ---------------------------------------------------------------------------
// Test 4: min_bytes = 10 with a 100 ms flush timeout
// ---------------------------------------------------------------------------

#[test]
fn test_min_bytes_ten_with_flush_timeout() {
    let scheduler = Scheduler::new().unwrap();
    let timeout = Duration::from_millis(100);
    let (stream, mut peer) = stream_pair(&scheduler, ReadConfig::buffered(10, Some(timeout)));
    let deliveries = collect(&stream);

    // Two halves inside the window coalesce into one delivery.
    peer.write_all(b"01234").unwrap();
    scheduler.execute_timeout(Duration::from_millis(20)).unwrap();
    peer.write_all(b"56789").unwrap();
    assert!(run_until(&scheduler, Duration::from_secs(2), || !deliveries.borrow().is_empty()));
    assert_eq!(deliveries.borrow().as_slice(), &[b"0123456789".to_vec()]);

    // A lone partial write is flushed by the timer.
    deliveries.borrow_mut().clear();
    let started = Instant::now();
    peer.write_all(b"abcde").unwrap();
    assert!(run_until(&scheduler, Duration::from_secs(2), || !deliveries.borrow().is_empty()));
    assert!(started.elapsed() >= timeout);
    assert_eq!(deliveries.borrow().as_slice(), &[b"abcde".to_vec()]);

    // And nothing else shows up afterwards.
    scheduler.execute_timeout(Duration::from_millis(150)).unwrap();
    assert_eq!(deliveries.borrow().len(), 1);
}

// ---------------------------------------------------------------------------
// Test 5: backpressure: queue builds up, drains in order, byte for byte
// ---------------------------------------------------------------------------

#[test]
fn test_write_backpressure_drains_in_order() {
    let scheduler = Scheduler::new().unwrap();
    let (stream, mut peer) = stream_pair(&scheduler, ReadConfig::default());
    peer.set_nonblocking(true).unwrap();

    let mut payload = vec![0u8; 1024 * 1024];
    rand::rng().fill(payload.as_mut_slice());

    stream.write(&payload).unwrap();
    assert!(stream.pending_writes() > 0, "a 1 MiB write should not fit in the socket buffer");

    let mut received = Vec::with_capacity(payload.len());
    let mut buf = [0u8; 64 * 1024];
    let deadline = Instant::now() + Duration::from_secs(10);
    while received.len() < payload.len() && Instant::now() < deadline {
        match peer.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => panic!("peer read failed: {e}"),
        }
        scheduler.execute_timeout(Duration::from_millis(1)).unwrap();
    }

    assert_eq!(received.len(), payload.len());
    assert!(received == payload);
    assert_eq!(stream.pending_writes(), 0);
    assert_eq!(stream.bytes_written(), payload.len() as u64);
}

#[test]
fn test_write_queue_overflow_is_reported() {
    let scheduler = Scheduler::new().unwrap();
    let (ours, _peer) = UnixStream::pair().unwrap();
    let capacity = 64 * 1024;
    let stream = Stream::fd("bounded", FdConfig::owned(ours), ReadConfig::default())
        .with_write_config(WriteConfig { capacity });
    stream.schedule(&scheduler).unwrap();

    // Nobody reads the peer, so the kernel buffer fills and then the queue.
    let chunk = vec![0x55u8; 16 * 1024];
    let mut overflowed = false;
    for _ in 0..1024 {
        match stream.write(&chunk) {
            Ok(()) => {}
            Err(StreamError::WriteQueueFull { pending, capacity: cap, .. }) => {
                assert_eq!(cap, capacity);
                assert!(pending + chunk.len() > capacity);
                overflowed = true;
                break;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(overflowed);
    assert!(stream.pending_writes() <= capacity);
}

// ---------------------------------------------------------------------------
// Test 6: EOF flushes buffered bytes, then completes
// ---------------------------------------------------------------------------

#[test]
fn test_peer_close_flushes_then_completes() {
    let scheduler = Scheduler::new().unwrap();
    let (stream, mut peer) = stream_pair(&scheduler, ReadConfig::buffered(100, None));

    let events = Rc::new(RefCell::new(Vec::new()));
    {
        let events = events.clone();
        stream.on_read(move |_, data| events.borrow_mut().push(format!("read:{}", data.len())));
    }
    {
        let events = events.clone();
        stream.on_complete(move |_| events.borrow_mut().push("complete".to_string()));
    }

    peer.write_all(&[7u8; 10]).unwrap();
    drop(peer);

    assert!(run_until(&scheduler, Duration::from_secs(2), || stream.state()
        == StreamState::Disconnected));
    assert_eq!(events.borrow().as_slice(), &["read:10".to_string(), "complete".to_string()]);
    assert_eq!(scheduler.registered_count(), 0);
}

// ---------------------------------------------------------------------------
// Test 7: cancel is idempotent and leaves borrowed fds open
// ---------------------------------------------------------------------------

#[test]
fn test_cancel_is_idempotent_and_respects_borrowed_fd() {
    let scheduler = Scheduler::new().unwrap();
    let (mut ours, mut theirs) = UnixStream::pair().unwrap();
    let stream = Stream::fd("borrowed", FdConfig::borrowed(ours.as_raw_fd()), ReadConfig::default());
    stream.schedule(&scheduler).unwrap();
    assert!(matches!(stream.schedule(&scheduler), Err(StreamError::AlreadyScheduled)));
    assert_eq!(scheduler.registered_count(), 1);

    stream.cancel();
    stream.cancel();
    assert_eq!(stream.state(), StreamState::Disconnected);
    assert_eq!(scheduler.registered_count(), 0);
    assert!(matches!(stream.write(b"x"), Err(StreamError::NotConnected)));
    drop(stream);

    // The descriptor still works after the stream is gone.
    ours.set_nonblocking(false).unwrap();
    ours.write_all(b"still open").unwrap();
    let mut buf = [0u8; 10];
    theirs.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"still open");
}

#[test]
fn test_cancel_from_read_callback() {
    let scheduler = Scheduler::new().unwrap();
    let (stream, mut peer) = stream_pair(&scheduler, ReadConfig::default());
    let reads = Rc::new(RefCell::new(0));
    {
        let reads = reads.clone();
        stream.on_read(move |stream, _| {
            *reads.borrow_mut() += 1;
            stream.cancel();
        });
    }

    peer.write_all(b"first").unwrap();
    assert!(run_until(&scheduler, Duration::from_secs(2), || *reads.borrow() == 1));
    let _ = peer.write_all(b"second");
    scheduler.execute_timeout(Duration::from_millis(50)).unwrap();
    assert_eq!(*reads.borrow(), 1);
    assert_eq!(stream.state(), StreamState::Disconnected);
}

// ---------------------------------------------------------------------------
// Test 8: echo through the stream from inside a read callback
// ---------------------------------------------------------------------------

#[test]
fn test_write_from_read_callback() {
    let scheduler = Scheduler::new().unwrap();
    let (stream, mut peer) = stream_pair(&scheduler, ReadConfig::default());
    stream.on_read(|stream, data| {
        let mut reply = b"echo:".to_vec();
        reply.extend_from_slice(data);
        stream.write(&reply).unwrap();
    });

    peer.write_all(b"hi").unwrap();
    scheduler.execute_timeout(Duration::from_millis(50)).unwrap();

    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 7];
    peer.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"echo:hi");
}
