use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::Duration;

use rdma_stream::{Config, Loopback, RdmaListener, RdmaStream};

fn config() -> Config {
    Config::default()
        .with_send_queue_depth(8)
        .with_timeout(Some(Duration::from_secs(20)))
}

fn pair(addr: &str) -> (RdmaStream<Loopback>, RdmaStream<Loopback>) {
    let fabric = Loopback::new();
    let listener = RdmaListener::bind_with_config(fabric.clone(), addr, config()).unwrap();
    thread::scope(|s| {
        let accepted = s.spawn(|| listener.accept().unwrap());
        let client = RdmaStream::connect_with_config(fabric, addr, config()).unwrap();
        let (server, peer) = accepted.join().unwrap();
        assert_eq!(client.local_addr(), peer);
        (client, server)
    })
}

#[test]
fn echo_through_io_traits() {
    let (mut client, server) = pair("127.0.0.1:7100");
    thread::scope(|s| {
        s.spawn(|| {
            let mut server = &server;
            let mut buf = [0u8; 64];
            loop {
                let n = server.read(&mut buf).unwrap();
                if n == 0 {
                    return;
                }
                server.write_all(&buf[..n]).unwrap();
            }
        });

        for line in ["first", "second line", "third and last line"] {
            client.write_all(line.as_bytes()).unwrap();
            let mut echoed = vec![0u8; line.len()];
            client.read_exact(&mut echoed).unwrap();
            assert_eq!(line.as_bytes(), &echoed[..]);
        }
        client.shutdown();
    });
}

#[test]
fn eof_after_peer_shutdown() {
    let (client, mut server) = pair("127.0.0.1:7101");
    (&client).write_all(b"bye").unwrap();
    client.shutdown();

    let mut received = Vec::new();
    server.read_to_end(&mut received).unwrap();
    assert_eq!(b"bye", &received[..]);

    let err = (&client).write(b"again").unwrap_err();
    assert_eq!(ErrorKind::NotConnected, err.kind());
}

#[test]
fn try_read_does_not_block() {
    let (mut client, server) = pair("127.0.0.1:7102");
    let mut buf = [0u8; 8];
    assert_eq!(
        ErrorKind::WouldBlock,
        server.try_read(&mut buf).unwrap_err().kind()
    );

    client.write_all(b"ready").unwrap();
    client.flush().unwrap();
    let n = loop {
        match server.try_read(&mut buf) {
            Ok(n) => break n,
            Err(err) if err.kind() == ErrorKind::WouldBlock => thread::yield_now(),
            Err(err) => panic!("{err}"),
        }
    };
    assert_eq!(b"ready", &buf[..n]);
}

#[test]
fn incoming_yields_each_peer() {
    let fabric = Loopback::new();
    let listener =
        RdmaListener::bind_with_config(fabric.clone(), "127.0.0.1:7103", config()).unwrap();
    thread::scope(|s| {
        s.spawn(|| {
            for stream in listener.incoming().take(2) {
                let mut stream = stream.unwrap();
                stream.write_all(b"hi").unwrap();
            }
        });
        for _ in 0..2 {
            let mut client =
                RdmaStream::connect_with_config(fabric.clone(), "127.0.0.1:7103", config())
                    .unwrap();
            let mut buf = [0u8; 2];
            client.read_exact(&mut buf).unwrap();
            assert_eq!(b"hi", &buf);
        }
    });
}
