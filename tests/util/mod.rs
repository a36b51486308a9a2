// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::net::{TcpListener, TcpStream};
use std::sync::Once;
use std::time::Duration;

use batchio::{Completion, Completions, Watcher};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    })
}

/// A connected pair of streams over loopback. The first is the "library"
/// side, the second the bare peer the test drives directly.
pub fn pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("unable to bind listener");
    let addr = listener.local_addr().unwrap();
    let peer = TcpStream::connect(addr).expect("unable to connect");
    let (ours, _) = listener.accept().expect("unable to accept");
    (ours, peer)
}

/// Waits until `total` completions have been gathered, combining batches if
/// the loop delivers them piecemeal.
pub fn gather(watcher: &Watcher, total: usize) -> Vec<GatheredCompletion> {
    let mut gathered = Vec::with_capacity(total);
    let mut batch = Completions::with_capacity(total);
    while gathered.len() < total {
        watcher.wait(&mut batch).expect("watcher closed while gathering");
        for completion in batch.iter() {
            gathered.push(GatheredCompletion::from(completion));
        }
    }
    assert_eq!(gathered.len(), total, "more completions than expected");
    gathered
}

/// An owned snapshot of a completion, so tests can gather across batches
/// without holding the batch buffers themselves.
#[derive(Debug)]
pub struct GatheredCompletion {
    pub op: batchio::Op,
    pub token: batchio::Token,
    pub size: usize,
    pub error_kind: Option<std::io::ErrorKind>,
    pub bytes: Vec<u8>,
    pub used_internal_buffer: bool,
    pub releases_internal_buffer: bool,
}

impl From<&Completion> for GatheredCompletion {
    fn from(completion: &Completion) -> GatheredCompletion {
        GatheredCompletion {
            op: completion.op(),
            token: completion.token(),
            size: completion.bytes_transferred(),
            error_kind: completion.error().map(|err| err.kind()),
            bytes: completion.buffer().to_vec(),
            used_internal_buffer: completion.used_internal_buffer(),
            releases_internal_buffer: completion.releases_internal_buffer(),
        }
    }
}

/// Long enough for the loop and the kernel to settle, short enough to keep
/// the suite quick.
pub const SETTLE: Duration = Duration::from_millis(100);

pub fn assert_send<T: Send>() {}
pub fn assert_sync<T: Sync>() {}
