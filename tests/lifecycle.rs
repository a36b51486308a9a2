use std::io::Read;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use batchio::{Completions, Handle, Token, Watcher};

mod util;
use util::{gather, init, pair};

/// The peer of a released fd observes a clean EOF.
fn expect_peer_eof(peer: &mut std::net::TcpStream) {
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0; 8];
    match peer.read(&mut buf) {
        Ok(0) => {}
        other => panic!("peer expected eof, got {:?}", other),
    }
}

#[test]
fn free_drops_requests_in_flight() {
    init();

    let (ours1, mut peer1) = pair();
    let (ours2, mut peer2) = pair();
    let watcher = Watcher::new().unwrap();
    let h1 = Handle::new(ours1);
    let h2 = Handle::new(ours2);

    // A read with no data yet, then the free right behind it.
    watcher.read(Token(1), &h1).unwrap();
    watcher.free(&h1).unwrap();

    watcher.read(Token(2), &h2).unwrap();
    peer2.write_all(b"other").unwrap();

    // Only the second handle ever completes.
    let completions = gather(&watcher, 1);
    assert_eq!(completions[0].token, Token(2));
    assert_eq!(completions[0].bytes, b"other");

    expect_peer_eof(&mut peer1);
}

#[test]
fn free_before_any_io_still_closes_the_fd() {
    init();

    let (ours, mut peer) = pair();
    let watcher = Watcher::new().unwrap();
    let handle = Handle::new(ours);

    watcher.free(&handle).unwrap();
    expect_peer_eof(&mut peer);
}

#[test]
fn submitting_after_free_fails_the_request() {
    init();

    let (ours, mut peer) = pair();
    let watcher = Watcher::new().unwrap();
    let handle = Handle::new(ours);

    watcher.read(Token(0), &handle).unwrap();
    peer.write_all(b"x").unwrap();
    assert_eq!(gather(&watcher, 1)[0].bytes, b"x");

    watcher.free(&handle).unwrap();
    thread::sleep(Duration::from_millis(50));

    // The fd is gone; the request comes back as an error completion.
    watcher.read(Token(1), &handle).unwrap();
    let completions = gather(&watcher, 1);
    assert_eq!(completions[0].token, Token(1));
    assert_eq!(completions[0].size, 0);
    assert!(completions[0].error_kind.is_some());
}

#[test]
fn dropping_every_handle_clone_releases_the_fd() {
    init();

    let (ours1, mut peer1) = pair();
    let (ours2, mut peer2) = pair();
    let watcher = Watcher::new().unwrap();
    let h1 = Handle::new(ours1);
    let h2 = Handle::new(ours2);

    watcher.read(Token(1), &h1).unwrap();
    thread::sleep(Duration::from_millis(50));

    // No explicit free: the clones just go away.
    let clone = h1.clone();
    drop(h1);
    drop(clone);

    expect_peer_eof(&mut peer1);

    // The abandoned read never completes; other handles are unaffected.
    watcher.read(Token(2), &h2).unwrap();
    peer2.write_all(b"still here").unwrap();
    let completions = gather(&watcher, 1);
    assert_eq!(completions[0].token, Token(2));
    assert_eq!(completions[0].bytes, b"still here");
}

#[test]
fn close_fails_submissions_and_waits() {
    init();

    let (ours, _peer) = pair();
    let watcher = Watcher::new().unwrap();
    let handle = Handle::new(ours);

    watcher.close();
    // Idempotent.
    watcher.close();

    let err = watcher.read(Token(0), &handle).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);

    let mut batch = Completions::with_capacity(4);
    let err = watcher.wait(&mut batch).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
}

#[test]
fn close_unblocks_a_parked_waiter() {
    init();

    let watcher = Arc::new(Watcher::new().unwrap());

    let waiter = {
        let watcher = watcher.clone();
        thread::spawn(move || {
            let mut batch = Completions::with_capacity(4);
            watcher.wait(&mut batch)
        })
    };

    thread::sleep(Duration::from_millis(100));
    watcher.close();

    let err = waiter.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
}

#[test]
fn dropping_the_watcher_releases_registered_fds() {
    init();

    let (ours, mut peer) = pair();
    {
        let watcher = Watcher::new().unwrap();
        let handle = Handle::new(ours);
        watcher.read(Token(0), &handle).unwrap();
        thread::sleep(Duration::from_millis(50));
        // Drop closes the watcher and joins the loop thread.
    }
    expect_peer_eof(&mut peer);
}

#[test]
fn empty_buffers_are_rejected_where_required() {
    init();

    let (ours, _peer) = pair();
    let watcher = Watcher::new().unwrap();
    let handle = Handle::new(ours);

    let err = watcher.write(Token(0), &handle, Vec::new()).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);

    let err = watcher.read_full(Token(0), &handle, Vec::new()).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);

    // An empty read_into is not an error: it means "use the internal
    // buffer".
    watcher.read_into(Token(0), &handle, Vec::new()).unwrap();
}
