//! Batched completion I/O for nonblocking stream sockets.
//!
//! batchio is a proactor core: callers submit reads and writes against
//! already-connected byte streams, a dedicated event-loop thread performs
//! the nonblocking syscalls on top of an edge-triggered readiness notifier
//! (epoll or kqueue), and finished operations come back as batches of
//! [`Completion`] records.
//!
//! There are no futures and no callbacks. One thread (or several) submits,
//! one thread waits:
//!
//! ```
//! use std::io::Write;
//! use std::net::{TcpListener, TcpStream};
//!
//! use batchio::{Completions, Handle, Op, Token, Watcher};
//!
//! # fn main() -> std::io::Result<()> {
//! let listener = TcpListener::bind("127.0.0.1:0")?;
//! let mut peer = TcpStream::connect(listener.local_addr()?)?;
//! let (server, _) = listener.accept()?;
//!
//! let watcher = Watcher::new()?;
//! let handle = Handle::new(server);
//!
//! // Read whatever arrives next into the watcher's internal buffer.
//! watcher.read(Token(0), &handle)?;
//! peer.write_all(b"ping")?;
//!
//! let mut batch = Completions::with_capacity(8);
//! watcher.wait(&mut batch)?;
//!
//! let first = batch.iter().next().unwrap();
//! assert_eq!(first.op(), Op::Read);
//! assert_eq!(first.token(), Token(0));
//! assert_eq!(first.buffer(), b"ping");
//! # Ok(())
//! # }
//! ```
//!
//! # Ordering
//!
//! Per handle and direction, completions arrive in submission order; across
//! handles there is no ordering. Batches returned by [`Watcher::wait`] that
//! contain internal-buffer reads borrow from the watcher's slabs and stay
//! readable until the batch is cleared, reused by the next wait, or
//! dropped.
//!
//! # Lifecycle
//!
//! A [`Handle`] consumes the caller's stream. Its fd is duplicated on first
//! submission, so the fd number the loop uses is private to the watcher.
//! Releasing is either explicit ([`Watcher::free`]) or automatic when the
//! last clone of the handle is dropped; either way, requests still queued
//! against the handle are forfeited without a completion.

#![cfg(unix)]

#[macro_use]
mod macros;

mod completion;
mod handle;
mod pool;
mod reactor;
mod request;
mod swap;
mod sys;
mod timeout;
mod token;
mod watcher;

pub use completion::{Completion, Completions, Iter, IterMut, Op};
pub use handle::Handle;
pub use token::Token;
pub use watcher::{Watcher, DEFAULT_SWAP_CAPACITY};
