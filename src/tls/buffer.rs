use crate::error::TransportError;
use std::io;

/// Growable byte window over an owned allocation.
///
/// Bytes live in `buf[start..end]`. Reads append into the free tail,
/// consumers advance `start`. Capacity only ever doubles and never
/// passes `ceiling`.
#[derive(Debug)]
pub struct RecordBuffer {
    buf: Vec<u8>,
    start: usize,
    end: usize,
    initial: usize,
    ceiling: usize,
}

impl RecordBuffer {
    pub fn new(initial: usize, ceiling: usize) -> Self {
        let initial = initial.max(1).min(ceiling.max(1));
        RecordBuffer {
            buf: Vec::new(),
            start: 0,
            end: 0,
            initial,
            ceiling: ceiling.max(initial),
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// True when the data fills the whole allocation from offset zero.
    pub fn is_full(&self) -> bool {
        !self.buf.is_empty() && self.start == 0 && self.end == self.buf.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// Free space after the buffered bytes, allocating on first use.
    pub fn tail_mut(&mut self) -> &mut [u8] {
        if self.buf.is_empty() {
            self.buf = vec![0; self.initial];
        }
        &mut self.buf[self.end..]
    }

    pub fn tail_len(&self) -> usize {
        self.buf.len() - self.end
    }

    /// Marks `n` bytes of the tail as filled.
    pub fn commit(&mut self, n: usize) {
        self.end = (self.end + n).min(self.buf.len());
    }

    pub fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Moves buffered bytes to offset zero.
    pub fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.buf.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }

    /// Doubles the allocation, keeping buffered bytes.
    pub fn grow(&mut self) -> Result<(), TransportError> {
        let current = self.buf.len().max(self.initial);
        if self.buf.is_empty() {
            self.buf = vec![0; current];
            return Ok(());
        }
        let next = current * 2;
        if next > self.ceiling {
            return Err(TransportError::BufferCeiling {
                ceiling: self.ceiling,
            });
        }
        self.buf.resize(next, 0);
        Ok(())
    }

    /// Reads once from `src` into the tail. Zero-length tails are not read.
    pub fn fill_from<R: io::Read + ?Sized>(&mut self, src: &mut R) -> io::Result<usize> {
        let tail = self.tail_mut();
        if tail.is_empty() {
            return Ok(0);
        }
        let n = src.read(tail)?;
        self.commit(n);
        Ok(n)
    }

    /// Drops the allocation once nothing is buffered.
    pub fn release(&mut self) {
        self.buf = Vec::new();
        self.start = 0;
        self.end = 0;
    }
}

/// `io::Write` adapter appending into a buffer's free tail.
pub struct TailWriter<'a>(pub &'a mut RecordBuffer);

impl io::Write for TailWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let tail = self.0.tail_mut();
        let n = tail.len().min(data.len());
        tail[..n].copy_from_slice(&data[..n]);
        self.0.commit(n);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
