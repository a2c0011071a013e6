//! Stream demultiplexing — matches stream bodies to their consumers.
//!
//! The connection task is the only reader of its socket. When it meets a
//! stream frame it opens the slot for the frame's id and forwards the body
//! in chunks. Whoever is waiting for that body (the dispatch loop after a
//! `StoreFile`, or `get` after a `GetFile`) claims the same slot. Either
//! side may arrive first; the slot keeps the other end until it does.
//!
//! Dropping a claim before its body arrives frees the slot and remembers
//! the id, so the body is drained when it shows up instead of parking the
//! connection task on a reader that will never come.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

/// Chunks buffered per stream before the connection task waits on the consumer.
const STREAM_BUFFER_CHUNKS: usize = 16;

/// Abandoned ids remembered per connection; the oldest is forgotten first.
const ABANDONED_LIMIT: usize = 256;

pub(crate) type Chunk = io::Result<Bytes>;

struct Slot {
    tx: Option<mpsc::Sender<Chunk>>,
    rx: Option<mpsc::Receiver<Chunk>>,
}

impl Slot {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER_CHUNKS);
        Self {
            tx: Some(tx),
            rx: Some(rx),
        }
    }
}

#[derive(Default)]
struct Inner {
    slots: HashMap<u64, Slot>,
    abandoned: VecDeque<u64>,
    closed: bool,
}

/// Per-connection table of pending streams, keyed by stream id.
#[derive(Clone, Default)]
pub struct StreamTable {
    inner: Arc<Mutex<Inner>>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Producer side: the sender for stream `id`.
    ///
    /// None when the table is closed or the id has already been opened.
    pub(crate) fn open(&self, id: u64) -> Option<mpsc::Sender<Chunk>> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.closed {
            return None;
        }
        if let Some(pos) = inner.abandoned.iter().position(|&a| a == id) {
            inner.abandoned.remove(pos);
            let (tx, _) = mpsc::channel(1);
            return Some(tx);
        }
        let slot = inner.slots.entry(id).or_insert_with(Slot::new);
        let tx = slot.tx.take();
        let claimed = slot.rx.is_none();
        if claimed {
            inner.slots.remove(&id);
        }
        tx
    }

    /// Consumer side: the body of stream `id`, whether or not it has
    /// started arriving.
    ///
    /// Once the connection is gone, a stream that never arrived reads as
    /// immediately empty. Dropping the result abandons the stream.
    pub fn claim(&self, id: u64) -> IncomingStream {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let rx = if let Some(slot) = inner.slots.get_mut(&id) {
            let rx = slot.rx.take();
            if slot.tx.is_none() {
                inner.slots.remove(&id);
            }
            rx
        } else if inner.closed {
            None
        } else {
            let mut slot = Slot::new();
            let rx = slot.rx.take();
            inner.slots.insert(id, slot);
            rx
        };
        match rx {
            Some(rx) => IncomingStream::new(id, rx, Some(self.clone())),
            None => IncomingStream::new(id, closed_receiver(), None),
        }
    }

    /// A claimed stream's reader went away. If the body has not started,
    /// free the slot and drain the body when it comes.
    fn abandon(&self, id: u64) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let unopened = matches!(inner.slots.get(&id), Some(slot) if slot.rx.is_none());
        if !unopened {
            return;
        }
        inner.slots.remove(&id);
        if inner.abandoned.len() == ABANDONED_LIMIT {
            inner.abandoned.pop_front();
        }
        inner.abandoned.push_back(id);
    }

    /// Drop every sender that has not been handed out and refuse new ones.
    /// Bodies already buffered stay claimable.
    pub fn close(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.closed = true;
        inner.abandoned.clear();
        inner.slots.retain(|_, slot| {
            slot.tx = None;
            slot.rx.is_some()
        });
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Streams opened or claimed by one side only.
    pub fn pending(&self) -> usize {
        self.lock().slots.len()
    }
}

fn closed_receiver() -> mpsc::Receiver<Chunk> {
    let (_, rx) = mpsc::channel(1);
    rx
}

// ── Incoming stream ───────────────────────────────────────────────────────────

/// The body of one stream frame, readable as it arrives.
///
/// Ends at exactly the frame's length. A connection that dies mid-body
/// surfaces as an `UnexpectedEof` error, not a short read.
pub struct IncomingStream {
    id: u64,
    rx: mpsc::Receiver<Chunk>,
    chunk: Bytes,
    table: Option<StreamTable>,
}

impl IncomingStream {
    fn new(id: u64, rx: mpsc::Receiver<Chunk>, table: Option<StreamTable>) -> Self {
        Self {
            id,
            rx,
            chunk: Bytes::new(),
            table,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for IncomingStream {
    fn drop(&mut self) {
        if let Some(table) = self.table.take() {
            table.abandon(self.id);
        }
    }
}

impl AsyncRead for IncomingStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.chunk.is_empty() {
                let n = self.chunk.len().min(buf.remaining());
                buf.put_slice(&self.chunk[..n]);
                self.chunk.advance(n);
                return Poll::Ready(Ok(()));
            }
            match ready!(self.rx.poll_recv(cx)) {
                Some(Ok(chunk)) => self.chunk = chunk,
                Some(Err(e)) => return Poll::Ready(Err(e)),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}
