//! End-to-end tests against a live server on a loopback port.

use discard_server::protocols::discard::GREETING;
use discard_server::runtime::StatsSnapshot;
use discard_server::{Config, Mode, Server};
use rand::RngCore;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

fn test_config(mode: Mode) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        workers: 2,
        mode,
        ..Config::default()
    }
}

fn wait_for(server: &Server, what: &str, pred: impl Fn(&StatsSnapshot) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stats = server.stats();
        if pred(&stats) {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}: {stats:?}");
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

/// Nothing arrives within a short window and the socket is still open.
fn assert_silent(stream: &mut TcpStream) {
    stream
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut buf = [0u8; 64];
    match stream.read(&mut buf) {
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
        Ok(0) => panic!("connection closed unexpectedly"),
        Ok(n) => panic!("unexpected {n} bytes: {:?}", &buf[..n]),
        Err(e) => panic!("unexpected error: {e}"),
    }
}

fn assert_eof(stream: &mut TcpStream) {
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut rest = Vec::new();
    match stream.read_to_end(&mut rest) {
        Ok(_) => assert!(rest.is_empty(), "unexpected bytes: {rest:?}"),
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
        Err(e) => panic!("expected EOF, got {e}"),
    }
}

#[test]
fn discard_never_writes_and_stays_open() {
    let server = Server::start(&test_config(Mode::Discard)).unwrap();
    let mut client = TcpStream::connect(server.local_addr()).unwrap();

    client.write_all(&random_bytes(4096)).unwrap();
    client.write_all(b"PING\r\n").unwrap();
    assert_silent(&mut client);

    wait_for(&server, "bytes discarded", |s| s.bytes_discarded == 4102);
    assert_eq!(server.stats().active(), 1);

    client.shutdown(Shutdown::Write).unwrap();
    assert_eof(&mut client);
    wait_for(&server, "close", |s| s.closed == 1);

    let stats = server.stop();
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.active(), 0);
}

#[test]
fn greeting_sent_once_before_anything_else() {
    let server = Server::start(&test_config(Mode::Greeting)).unwrap();
    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let mut greeting = vec![0u8; GREETING.len()];
    client.read_exact(&mut greeting).unwrap();
    assert_eq!(greeting, GREETING);

    client.write_all("hello, 세계".as_bytes()).unwrap();
    assert_silent(&mut client);

    client.shutdown(Shutdown::Write).unwrap();
    assert_eof(&mut client);

    let stats = server.stop();
    assert_eq!(stats.closed, 1);
    assert_eq!(stats.errors, 0);
}

#[test]
fn second_bind_on_same_port_fails() {
    let first = Server::start(&test_config(Mode::Discard)).unwrap();

    let config = Config {
        port: first.local_addr().port(),
        ..test_config(Mode::Discard)
    };
    let err = Server::start(&config).err().expect("second bind succeeded");
    assert!(err.is_bind(), "unexpected error: {err}");

    first.stop();
}

#[test]
fn invalid_text_closes_only_that_connection() {
    let server = Server::start(&test_config(Mode::Greeting)).unwrap();
    let addr = server.local_addr();

    let mut good = TcpStream::connect(addr).unwrap();
    let mut bad = TcpStream::connect(addr).unwrap();
    for client in [&mut good, &mut bad] {
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut greeting = vec![0u8; GREETING.len()];
        client.read_exact(&mut greeting).unwrap();
    }

    bad.write_all(&[b'o', b'k', 0xFF, 0xFE]).unwrap();
    assert_eof(&mut bad);
    wait_for(&server, "error close", |s| s.errors == 1 && s.closed == 1);

    good.write_all(b"still here").unwrap();
    assert_silent(&mut good);
    assert_eq!(server.stats().active(), 1);

    server.stop();
}

#[test]
fn connections_over_cap_are_rejected() {
    let config = Config {
        workers: 1,
        max_connections: 1,
        ..test_config(Mode::Discard)
    };
    let server = Server::start(&config).unwrap();
    let addr = server.local_addr();

    let mut first = TcpStream::connect(addr).unwrap();
    wait_for(&server, "first accept", |s| s.accepted == 1);

    let mut second = TcpStream::connect(addr).unwrap();
    assert_eof(&mut second);
    wait_for(&server, "rejection", |s| s.rejected == 1);

    first.write_all(b"still open").unwrap();
    assert_silent(&mut first);

    let stats = server.stats();
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.closed, 0);
    assert_eq!(stats.active(), 1);

    server.stop();
}

#[test]
fn greeting_reaches_client_that_closes_at_once() {
    let server = Server::start(&test_config(Mode::Greeting)).unwrap();
    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client.write_all(b"bye").unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut received = Vec::new();
    client.read_to_end(&mut received).unwrap();
    assert_eq!(received, GREETING);

    wait_for(&server, "close", |s| s.closed == 1);
    let stats = server.stop();
    assert_eq!(stats.errors, 0);
}

#[test]
fn stop_closes_listener_and_connections() {
    let server = Server::start(&test_config(Mode::Discard)).unwrap();
    let addr = server.local_addr();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"some bytes").unwrap();
    wait_for(&server, "accept", |s| s.accepted == 1 && s.bytes_discarded == 10);

    let stats = server.stop();
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.closed, 1);
    assert_eq!(stats.active(), 0);

    assert_eof(&mut client);
    assert!(TcpStream::connect(addr).is_err());
}

#[test]
fn stop_handle_is_idempotent() {
    let server = Server::start(&test_config(Mode::Discard)).unwrap();
    let handle = server.stop_handle();

    let waiter = thread::spawn(move || server.wait());
    handle.stop();
    handle.stop();

    let stats = waiter.join().unwrap();
    assert_eq!(stats.accepted, 0);
}

#[test]
fn shutdown_grace_lets_connections_finish() {
    let config = Config {
        shutdown_grace: Duration::from_secs(10),
        ..test_config(Mode::Discard)
    };
    let server = Server::start(&config).unwrap();
    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    wait_for(&server, "accept", |s| s.accepted == 1);

    let started = Instant::now();
    let stopper = thread::spawn(move || server.stop());

    // Still open and still being read during the grace period.
    thread::sleep(Duration::from_millis(100));
    client.write_all(b"late data").unwrap();
    client.shutdown(Shutdown::Write).unwrap();
    assert_eof(&mut client);

    let stats = stopper.join().unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(stats.bytes_discarded, 9);
    assert_eq!(stats.closed, 1);
    assert_eq!(stats.errors, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clients_are_isolated() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const CLIENTS: usize = 100;
    const PAYLOAD: usize = 1024;

    let config = Config {
        workers: 4,
        ..test_config(Mode::Discard)
    };
    let server = Server::start(&config).unwrap();
    let addr = server.local_addr();

    let mut tasks = Vec::with_capacity(CLIENTS);
    for _ in 0..CLIENTS {
        let payload = random_bytes(PAYLOAD);
        tasks.push(tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await?;
            stream.write_all(&payload).await?;
            stream.shutdown().await?;

            let mut echoed = Vec::new();
            stream.read_to_end(&mut echoed).await?;
            Ok::<_, io::Error>(echoed.len())
        }));
    }

    for task in tasks {
        let received = task.await.unwrap().unwrap();
        assert_eq!(received, 0);
    }

    let expected = (CLIENTS * PAYLOAD) as u64;
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.stats().closed < CLIENTS as u64 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stats = server.stop();
    assert_eq!(stats.accepted, CLIENTS as u64);
    assert_eq!(stats.closed, CLIENTS as u64);
    assert_eq!(stats.bytes_discarded, expected);
    assert_eq!(stats.errors, 0);
}
