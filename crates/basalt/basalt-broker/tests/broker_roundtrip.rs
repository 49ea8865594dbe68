//! Broker and client talking over a real Unix socket.

use basalt_broker::{Broker, request_fds, send_quit, socket_path};
use basalt_pool::{Notifier, Pool};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

fn temp_socket(tag: &str) -> PathBuf {
    socket_path(std::env::temp_dir(), &format!("basalt_broker_{tag}_{}", std::process::id()))
}

#[test]
fn peers_receive_the_same_counters() {
    let originals: Vec<Notifier> = (0..3).map(|_| Notifier::new().unwrap()).collect();
    let fds = originals.iter().map(|n| n.try_clone_fd().unwrap()).collect();
    let path = temp_socket("fds");
    let broker = Broker::bind(&path, fds).unwrap();

    thread::scope(|s| {
        let server = s.spawn(|| broker.serve());

        for _ in 0..2 {
            let received: Vec<Notifier> = request_fds(&path)
                .unwrap()
                .into_iter()
                .map(Notifier::from_fd)
                .collect();
            assert_eq!(received.len(), 3);

            // Each received descriptor is the counter at the same index.
            for (i, n) in received.iter().enumerate() {
                n.notify().unwrap();
                for (j, o) in originals.iter().enumerate() {
                    let got = o.wait_timeout(Duration::from_millis(5)).unwrap();
                    assert_eq!(got.is_some(), i == j, "fd {i} signalled counter {j}");
                }
            }
        }

        send_quit(&path).unwrap();
        server.join().unwrap().unwrap();
    });

    assert!(broker.shutdown_handle().is_requested());
    drop(broker);
    assert!(!path.exists());
}

#[test]
fn unknown_opcode_closes_only_that_connection() {
    let path = temp_socket("unknown");
    let broker = Broker::bind(&path, vec![Notifier::new().unwrap().try_clone_fd().unwrap()]).unwrap();

    thread::scope(|s| {
        let server = s.spawn(|| broker.serve());

        let mut bogus = UnixStream::connect(&path).unwrap();
        bogus.write_all(&42u32.to_ne_bytes()).unwrap();
        let mut rest = Vec::new();
        assert_eq!(bogus.read_to_end(&mut rest).unwrap(), 0);

        assert_eq!(request_fds(&path).unwrap().len(), 1);
        broker.shutdown_handle().request();
        server.join().unwrap().unwrap();
    });
}

#[test]
fn broker_for_pool_serves_its_notifiers() {
    let name = format!("basalt_broker_pool_{}", std::process::id());
    let pool = Pool::create(&name, 16, 2, 2).unwrap();
    let mut peer = Pool::register(&name).unwrap();
    let broker = Broker::for_pool(std::env::temp_dir(), &pool).unwrap();
    let handle = broker.shutdown_handle();

    thread::scope(|s| {
        let server = s.spawn(|| broker.serve());
        peer.adopt_notifiers(request_fds(broker.path()).unwrap());
        handle.request();
        server.join().unwrap().unwrap();
    });

    assert_eq!(peer.notifiers().len(), 2);
    peer.notifier(0).unwrap().notify().unwrap();
    let got = pool.notifier(0).unwrap().wait_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(got, Some(1));
}
