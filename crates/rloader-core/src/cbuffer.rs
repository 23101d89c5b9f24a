//! Circular byte buffer
//!
//! Shared between an interrupt handler and the main loop: exactly one
//! producer and one consumer per direction. The `full` flag disambiguates
//! `head == tail`, so the whole capacity is usable.

/// Fixed-capacity circular buffer over a caller-provided backing slice.
pub struct CBuffer<'a> {
    data: &'a mut [u8],
    head: usize,
    tail: usize,
    full: bool,
}

impl<'a> CBuffer<'a> {
    /// Wrap a backing slice; the buffer starts empty.
    pub fn new(data: &'a mut [u8]) -> Self {
        Self {
            data,
            head: 0,
            tail: 0,
            full: false,
        }
    }

    /// Number of bytes currently stored.
    pub fn len(&self) -> usize {
        if self.tail == self.head {
            if self.full {
                self.data.len()
            } else {
                0
            }
        } else {
            (self.tail + self.data.len() - self.head) % self.data.len()
        }
    }

    /// True when no bytes are stored.
    pub fn is_empty(&self) -> bool {
        self.head == self.tail && !self.full
    }

    /// Append up to `src.len()` bytes, returning how many fit.
    pub fn write(&mut self, src: &[u8]) -> usize {
        if src.is_empty() || self.full {
            return 0;
        }

        let cap = self.data.len();
        let mut bytes;

        if self.head > self.tail {
            bytes = src.len().min(self.head - self.tail);
            self.data[self.tail..self.tail + bytes].copy_from_slice(&src[..bytes]);
        } else {
            bytes = src.len().min(cap - self.tail);
            self.data[self.tail..self.tail + bytes].copy_from_slice(&src[..bytes]);

            if bytes < src.len() && self.head > 0 {
                let wrap = (src.len() - bytes).min(self.head);
                self.data[..wrap].copy_from_slice(&src[bytes..bytes + wrap]);
                bytes += wrap;
            }
        }

        self.tail = (self.tail + bytes) % cap;
        self.full = self.tail == self.head;

        bytes
    }

    /// Remove up to `dst.len()` bytes, returning how many were copied out.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        if dst.is_empty() || self.is_empty() {
            return 0;
        }

        let cap = self.data.len();
        let mut bytes;

        if self.tail > self.head {
            bytes = dst.len().min(self.tail - self.head);
            dst[..bytes].copy_from_slice(&self.data[self.head..self.head + bytes]);
        } else {
            bytes = dst.len().min(cap - self.head);
            dst[..bytes].copy_from_slice(&self.data[self.head..self.head + bytes]);

            if bytes < dst.len() {
                let wrap = (dst.len() - bytes).min(self.tail);
                dst[bytes..bytes + wrap].copy_from_slice(&self.data[..wrap]);
                bytes += wrap;
            }
        }

        self.head = (self.head + bytes) % cap;
        self.full = false;

        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_and_drain() {
        let mut backing = [0u8; 8];
        let mut buf = CBuffer::new(&mut backing);

        assert!(buf.is_empty());
        assert_eq!(buf.write(&[1, 2, 3, 4, 5, 6, 7, 8]), 8);
        assert_eq!(buf.len(), 8);
        // Full buffer accepts nothing more
        assert_eq!(buf.write(&[9]), 0);

        let mut out = [0u8; 8];
        assert_eq!(buf.read(&mut out), 8);
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_wrap_around() {
        let mut backing = [0u8; 4];
        let mut buf = CBuffer::new(&mut backing);

        assert_eq!(buf.write(&[1, 2, 3]), 3);
        let mut out = [0u8; 2];
        assert_eq!(buf.read(&mut out), 2);
        assert_eq!(out, [1, 2]);

        // Write wraps past the end of the backing slice
        assert_eq!(buf.write(&[4, 5, 6]), 3);
        assert_eq!(buf.len(), 4);

        let mut out = [0u8; 4];
        assert_eq!(buf.read(&mut out), 4);
        assert_eq!(out, [3, 4, 5, 6]);
    }

    #[test]
    fn test_full_flag_disambiguates() {
        let mut backing = [0u8; 4];
        let mut buf = CBuffer::new(&mut backing);

        assert_eq!(buf.write(&[1, 2, 3, 4]), 4);
        assert!(!buf.is_empty());
        assert_eq!(buf.len(), 4);

        let mut out = [0u8; 4];
        assert_eq!(buf.read(&mut out), 4);
        assert!(buf.is_empty());
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_partial_read() {
        let mut backing = [0u8; 8];
        let mut buf = CBuffer::new(&mut backing);

        buf.write(&[10, 20, 30]);
        let mut out = [0u8; 8];
        assert_eq!(buf.read(&mut out), 3);
        assert_eq!(&out[..3], &[10, 20, 30]);
    }
}
