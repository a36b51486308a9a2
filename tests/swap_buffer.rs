use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use batchio::{Completions, Handle, Token, Watcher};

mod util;
use util::{init, pair};

const CHUNKS: [&[u8]; 8] = [
    b"aaaa", b"bbbb", b"cccc", b"dddd", b"eeee", b"ffff", b"gggg", b"hhhh",
];

/// Sends one chunk, submits one internal-buffer read, returns the batch.
fn one_read(watcher: &Watcher, handle: &Handle, peer: &mut std::net::TcpStream, i: usize) -> Completions {
    peer.write_all(CHUNKS[i]).unwrap();
    thread::sleep(Duration::from_millis(30));
    watcher.read(Token(i), handle).unwrap();

    let mut batch = Completions::with_capacity(4);
    watcher.wait(&mut batch).unwrap();
    assert_eq!(batch.len(), 1);
    {
        let completion = batch.iter().next().unwrap();
        assert_eq!(completion.token(), Token(i));
        assert!(completion.used_internal_buffer());
        assert_eq!(completion.buffer(), CHUNKS[i]);
    }
    batch
}

#[test]
fn fifth_read_rotates_and_carries_the_release_flag() {
    init();

    let (ours, mut peer) = pair();
    // Two 16 byte slabs: four 4 byte reads fill the first.
    let watcher = Watcher::with_capacity(16).unwrap();
    let handle = Handle::new(ours);

    let mut held = Vec::new();
    for i in 0..4 {
        let batch = one_read(&watcher, &handle, &mut peer, i);
        assert!(!batch.iter().next().unwrap().releases_internal_buffer());
        // Holding the batches keeps the first slab's bytes pinned.
        held.push(batch);
    }

    let batch = one_read(&watcher, &handle, &mut peer, 4);
    assert!(batch.iter().next().unwrap().releases_internal_buffer());

    // The pinned views are still intact after the rotation.
    for (i, batch) in held.iter().enumerate() {
        assert_eq!(batch.iter().next().unwrap().buffer(), CHUNKS[i]);
    }
}

#[test]
fn pinned_slab_back_pressures_the_loop() {
    init();

    let (ours, mut peer) = pair();
    let watcher = Watcher::with_capacity(16).unwrap();
    let handle = Handle::new(ours);

    // Fill the first slab and keep its batches alive.
    let mut held = Vec::new();
    for i in 0..4 {
        held.push(one_read(&watcher, &handle, &mut peer, i));
    }
    // Rotate into the second slab and exhaust it too.
    for i in 4..8 {
        drop(one_read(&watcher, &handle, &mut peer, i));
    }

    // The ninth read needs the first slab back, but `held` pins it. The
    // loop must stall until the batches are dropped.
    peer.write_all(b"iiii").unwrap();
    thread::sleep(Duration::from_millis(30));
    watcher.read(Token(8), &handle).unwrap();

    let dropper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        drop(held);
    });

    let started = Instant::now();
    let mut batch = Completions::with_capacity(4);
    watcher.wait(&mut batch).unwrap();
    let elapsed = started.elapsed();

    let completion = batch.iter().next().unwrap();
    assert_eq!(completion.buffer(), b"iiii");
    assert!(completion.releases_internal_buffer());
    assert!(
        elapsed >= Duration::from_millis(100),
        "the loop reused a pinned slab after {:?}",
        elapsed
    );

    dropper.join().unwrap();
}

#[test]
fn reads_are_capped_at_the_slab_remainder() {
    init();

    let (ours, mut peer) = pair();
    let watcher = Watcher::with_capacity(16).unwrap();
    let handle = Handle::new(ours);

    peer.write_all(b"abcdefghijklmnopqrst").unwrap();
    thread::sleep(Duration::from_millis(50));

    // 20 bytes are buffered but a slab holds 16.
    watcher.read(Token(0), &handle).unwrap();
    let mut batch = Completions::with_capacity(4);
    watcher.wait(&mut batch).unwrap();
    {
        let completion = batch.iter().next().unwrap();
        assert_eq!(completion.bytes_transferred(), 16);
        assert_eq!(completion.buffer(), b"abcdefghijklmnop");
        assert!(!completion.releases_internal_buffer());
    }

    // The leftover lands in the other slab; reusing the batch releases the
    // first one before the loop needs it.
    watcher.read(Token(1), &handle).unwrap();
    watcher.wait(&mut batch).unwrap();
    let completion = batch.iter().next().unwrap();
    assert_eq!(completion.bytes_transferred(), 4);
    assert_eq!(completion.buffer(), b"qrst");
    assert!(completion.releases_internal_buffer());
}
