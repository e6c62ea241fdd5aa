use std::ops::Deref;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

/// Per-lane pool of payload buffers, recycled to avoid per-packet allocation on
/// the receive path.
///
/// Each worker lane owns one arena. Buffers handed out as [`Payload`] may end
/// up dropped on a different thread (the application is free to move delivered
/// payloads around), so releases do not go back into the free list directly:
/// they are pushed into a lock-guarded inbox that the owning lane drains once
/// per send tick. This keeps the free list itself single-threaded.
pub struct PayloadPool {
    free: Vec<Vec<u8>>,
    inbox: Arc<Mutex<Vec<Vec<u8>>>>,
    buf_capacity: usize,
    outstanding: usize,
    max_outstanding: usize,
}

impl PayloadPool {
    pub fn new(buf_capacity: usize, max_outstanding: usize) -> PayloadPool {
        PayloadPool {
            free: Vec::new(),
            inbox: Arc::new(Mutex::new(Vec::new())),
            buf_capacity,
            outstanding: 0,
            max_outstanding,
        }
    }

    /// Hands out an empty buffer, or `None` if too many payloads are already in
    /// flight. Callers must treat `None` as a dropped packet, never as a fault.
    pub fn acquire(&mut self) -> Option<Payload> {
        if self.outstanding >= self.max_outstanding {
            debug!(
                "payload pool exhausted ({} outstanding) - dropping",
                self.outstanding
            );
            return None;
        }

        let buf = match self.free.pop() {
            Some(buf) => buf,
            None => Vec::with_capacity(self.buf_capacity),
        };
        self.outstanding += 1;
        Some(Payload {
            buf,
            inbox: self.inbox.clone(),
        })
    }

    /// Moves buffers released on other threads back into the free list. Called
    /// once per tick by the owning lane.
    pub fn drain_foreign(&mut self) {
        let mut returned = std::mem::take(&mut *self.inbox.lock().unwrap());
        if returned.is_empty() {
            return;
        }
        trace!("reclaiming {} foreign-released payload buffers", returned.len());
        self.outstanding = self.outstanding.saturating_sub(returned.len());
        for mut buf in returned.drain(..) {
            buf.clear();
            self.free.push(buf);
        }
    }

    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

/// A pooled byte buffer. Dropping it returns the buffer to its arena's inbox,
/// wherever the drop happens.
pub struct Payload {
    buf: Vec<u8>,
    inbox: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Payload {
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn resize_zeroed(&mut self, len: usize) {
        self.buf.clear();
        self.buf.resize(len, 0);
    }

    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) {
        self.buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.inbox.lock().unwrap().push(buf);
    }
}
