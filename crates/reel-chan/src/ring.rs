use std::io::{self, Read, Write};

/// Fixed-capacity byte ring with free-running producer/consumer counters.
///
/// `beg` and `end` grow without bound and are reduced modulo the (power of
/// two) capacity on access, so producer and consumer each see a contiguous
/// slice without the buffer ever being compacted.
pub struct Ring {
    buf: Box<[u8]>,
    beg: u64,
    end: u64,
}

impl Ring {
    /// Capacity must be a power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "ring capacity must be a power of two, got {capacity}"
        );
        Self { buf: vec![0u8; capacity].into_boxed_slice(), beg: 0, end: 0 }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes buffered and readable.
    #[inline]
    pub fn n_ready(&self) -> usize {
        (self.end - self.beg) as usize
    }

    /// Free space writable.
    #[inline]
    pub fn n_avail(&self) -> usize {
        self.capacity() - self.n_ready()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.beg == self.end
    }

    #[inline]
    fn mask(&self, ix: u64) -> usize {
        (ix as usize) & (self.capacity() - 1)
    }

    /// Contiguous readable slice (may be shorter than `n_ready` at the wrap
    /// point).
    pub fn ready_slice(&self) -> &[u8] {
        let beg = self.mask(self.beg);
        let n = self.n_ready().min(self.capacity() - beg);
        &self.buf[beg..beg + n]
    }

    /// Contiguous writable slice (may be shorter than `n_avail` at the wrap
    /// point).
    pub fn avail_slice_mut(&mut self) -> &mut [u8] {
        let end = self.mask(self.end);
        let n = self.n_avail().min(self.capacity() - end);
        &mut self.buf[end..end + n]
    }

    /// Releases `n` readable bytes.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.n_ready());
        self.beg += n as u64;
    }

    /// Publishes `n` bytes previously written into `avail_slice_mut`.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.n_avail());
        self.end += n as u64;
    }

    pub fn clear(&mut self) {
        self.beg = self.end;
    }

    /// Copies readable bytes into `out` without consuming them. Returns the
    /// number of bytes copied.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.n_ready());
        let beg = self.mask(self.beg);
        let first = n.min(self.capacity() - beg);
        out[..first].copy_from_slice(&self.buf[beg..beg + first]);
        if first < n {
            out[first..n].copy_from_slice(&self.buf[..n - first]);
        }
        n
    }

    /// Copies and consumes readable bytes into `out`.
    pub fn copy_out(&mut self, out: &mut [u8]) -> usize {
        let n = self.peek(out);
        self.consume(n);
        n
    }

    /// Copies bytes from `src` into free space. Returns the number accepted.
    pub fn copy_in(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.n_avail());
        let end = self.mask(self.end);
        let first = n.min(self.capacity() - end);
        self.buf[end..end + first].copy_from_slice(&src[..first]);
        if first < n {
            self.buf[..n - first].copy_from_slice(&src[first..n]);
        }
        self.commit(n);
        n
    }

    /// Appends `n` zero bytes (EOF record padding).
    pub fn pad_zero(&mut self, n: usize) {
        debug_assert!(n <= self.n_avail());
        let mut left = n;
        while left > 0 {
            let slice = self.avail_slice_mut();
            let step = slice.len().min(left);
            slice[..step].fill(0);
            self.commit(step);
            left -= step;
        }
    }

    /// Drains buffered bytes into `writer` until it blocks or the ring is
    /// empty. Returns bytes written; a zero-length write is surfaced as
    /// `WriteZero`.
    pub fn egress<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0;
        while !self.is_empty() {
            match writer.write(self.ready_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.consume(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    if total > 0 && e.kind() == io::ErrorKind::WouldBlock {
                        break;
                    }
                    return Err(e);
                }
            }
        }
        Ok(total)
    }

    /// Fills free space from `reader` until it blocks, EOF, or the ring is
    /// full. Returns `(bytes_read, saw_eof)`.
    pub fn ingress<R: Read>(&mut self, reader: &mut R) -> io::Result<(usize, bool)> {
        let mut total = 0;
        while self.n_avail() > 0 {
            match reader.read(self.avail_slice_mut()) {
                Ok(0) => return Ok((total, true)),
                Ok(n) => {
                    self.commit(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    if e.kind() == io::ErrorKind::WouldBlock {
                        break;
                    }
                    return Err(e);
                }
            }
        }
        Ok((total, false))
    }
}
