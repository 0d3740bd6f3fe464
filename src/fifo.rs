//! Non-blocking FIFO delivery for PES and ES payloads.
//!
//! The writer side is the parser thread; reader processes attach and detach
//! at any time. Appends never block: while no reader is attached the writer
//! end stays closed and data is dropped. The writer end is opened lazily on
//! the first append after a reader appears and closed again on detach.

use std::collections::VecDeque;

use parking_lot::Mutex;

pub struct Fifo {
    inner: Mutex<FifoInner>,
}

struct FifoInner {
    reader_attached: bool,
    writer_open: bool,
    flushed: bool,
    buf: VecDeque<u8>,
    append_count: u64,
}

impl Fifo {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FifoInner {
                reader_attached: false,
                writer_open: false,
                flushed: true,
                buf: VecDeque::new(),
                append_count: 0,
            }),
        }
    }

    /// Called by the filesystem binding when a reader process opens the node.
    pub fn attach_reader(&self) {
        self.inner.lock().reader_attached = true;
    }

    /// Called on release of the last reader. Pending data is discarded and
    /// the writer end closes.
    pub fn detach_reader(&self) {
        let mut inner = self.inner.lock();
        inner.reader_attached = false;
        inner.writer_open = false;
        inner.flushed = true;
        inner.buf.clear();
    }

    /// Lazily opens the writer end. Returns false while no reader is
    /// attached, in which case appends are dropped.
    pub fn is_open(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.reader_attached {
            inner.writer_open = false;
            return false;
        }
        if !inner.writer_open {
            inner.writer_open = true;
            inner.flushed = true;
        }
        true
    }

    /// Appends one buffered write. Returns the number of bytes accepted,
    /// which is zero whenever the writer end is closed.
    pub fn append(&self, data: &[u8]) -> usize {
        if data.is_empty() || !self.is_open() {
            return 0;
        }
        let mut inner = self.inner.lock();
        inner.buf.extend(data.iter().copied());
        inner.flushed = false;
        inner.append_count += 1;
        data.len()
    }

    /// Drains up to `buf.len()` bytes into `buf`, returning the amount read.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut inner = self.inner.lock();
        let mut n = 0;
        while n < buf.len() {
            match inner.buf.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        if inner.buf.is_empty() {
            inner.flushed = true;
        }
        n
    }

    /// Takes everything buffered so far.
    pub fn drain(&self) -> Vec<u8> {
        let mut inner = self.inner.lock();
        inner.flushed = true;
        inner.buf.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_flushed(&self) -> bool {
        self.inner.lock().flushed
    }

    /// Number of successful buffered writes since creation.
    pub fn write_count(&self) -> u64 {
        self.inner.lock().append_count
    }
}

impl Default for Fifo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_are_dropped_without_a_reader() {
        let fifo = Fifo::new();
        assert_eq!(fifo.append(b"lost"), 0);
        assert_eq!(fifo.len(), 0);
        assert_eq!(fifo.write_count(), 0);
    }

    #[test]
    fn writer_opens_lazily_and_closes_on_detach() {
        let fifo = Fifo::new();
        assert!(!fifo.is_open());

        fifo.attach_reader();
        assert_eq!(fifo.append(b"abc"), 3);
        assert_eq!(fifo.append(b"de"), 2);
        assert_eq!(fifo.write_count(), 2);

        let mut buf = [0u8; 8];
        let n = fifo.read(&mut buf);
        assert_eq!(&buf[..n], b"abcde");

        fifo.detach_reader();
        assert!(!fifo.is_open());
        assert_eq!(fifo.append(b"dropped"), 0);
    }
}
