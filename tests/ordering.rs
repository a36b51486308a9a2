use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use batchio::{Handle, Op, Token, Watcher};
use rand::{Rng, RngCore};

mod util;
use util::{gather, init, pair};

#[test]
fn queued_reads_complete_in_submission_order() {
    init();

    let (ours, mut peer) = pair();
    let watcher = Watcher::new().unwrap();
    let handle = Handle::new(ours);

    // Fixed-size full reads carve the stream deterministically no matter
    // how the kernel coalesces the peer's writes.
    let chunks: [&[u8]; 3] = [b"first", b"second!", b"3rd"];
    for (i, chunk) in chunks.iter().enumerate() {
        watcher
            .read_full(Token(i), &handle, vec![0; chunk.len()])
            .unwrap();
    }

    for chunk in &chunks {
        peer.write_all(chunk).unwrap();
        thread::sleep(Duration::from_millis(20));
    }

    let completions = gather(&watcher, chunks.len());
    for (i, completion) in completions.iter().enumerate() {
        assert_eq!(completion.token, Token(i), "reads completed out of order");
        assert_eq!(completion.error_kind, None);
        assert_eq!(completion.bytes, chunks[i]);
    }
}

#[test]
fn queued_writes_complete_in_submission_order() {
    init();

    let (ours, mut peer) = pair();
    let watcher = Watcher::new().unwrap();
    let handle = Handle::new(ours);

    // Large enough to overrun the socket buffer, so later writes queue
    // behind partial earlier ones.
    let mut rng = rand::rng();
    let payloads: Vec<Vec<u8>> = (0..4)
        .map(|_| {
            let mut payload = vec![0; rng.random_range(128 * 1024..256 * 1024)];
            rng.fill_bytes(&mut payload);
            payload
        })
        .collect();
    let total: usize = payloads.iter().map(Vec::len).sum();
    let expected: Vec<u8> = payloads.concat();

    for (i, payload) in payloads.iter().enumerate() {
        watcher.write(Token(i), &handle, payload.clone()).unwrap();
    }

    // Drain the peer side on its own thread while the loop pushes.
    let reader = thread::spawn(move || {
        let mut received = Vec::with_capacity(total);
        let mut buf = [0; 64 * 1024];
        while received.len() < total {
            let n = peer.read(&mut buf).unwrap();
            assert!(n > 0, "peer saw eof before all bytes arrived");
            received.extend_from_slice(&buf[..n]);
        }
        received
    });

    let completions = gather(&watcher, payloads.len());
    for (i, completion) in completions.iter().enumerate() {
        assert_eq!(completion.op, Op::Write);
        assert_eq!(completion.token, Token(i), "writes completed out of order");
        assert_eq!(completion.error_kind, None);
        assert_eq!(completion.size, payloads[i].len());
    }

    let received = reader.join().unwrap();
    assert_eq!(received.len(), total);
    // The byte stream is the payloads in submission order.
    assert_eq!(received, expected);
}

#[test]
fn interleaved_directions_do_not_block_each_other() {
    init();

    let (ours, mut peer) = pair();
    let watcher = Watcher::new().unwrap();
    let handle = Handle::new(ours);

    watcher.read_full(Token(0), &handle, vec![0; 4]).unwrap();
    watcher.write(Token(1), &handle, b"pong".to_vec()).unwrap();

    let mut got = [0; 4];
    peer.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"pong");
    peer.write_all(b"ping").unwrap();

    let completions = gather(&watcher, 2);
    let read = completions.iter().find(|c| c.op == Op::Read).unwrap();
    let write = completions.iter().find(|c| c.op == Op::Write).unwrap();
    assert_eq!(read.bytes, b"ping");
    assert_eq!(write.size, 4);
}
