//! Fixed-capacity ring buffer for recent latency samples.

use parking_lot::Mutex;

struct Inner<T> {
    data: Vec<Option<T>>,
    off: usize,
    count: usize,
}

/// Append-only bounded buffer; on overflow the oldest value is overwritten.
pub struct RingBuffer<T> {
    size: usize,
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(size: usize) -> Self {
        assert!(size >= 1, "ring buffer size must be >= 1");
        Self {
            size,
            inner: Mutex::new(Inner {
                data: vec![None; size],
                off: 0,
                count: 0,
            }),
        }
    }

    pub fn append(&self, value: T) {
        let mut inner = self.inner.lock();
        let off = inner.off;
        inner.data[off] = Some(value);
        inner.off = (off + 1) % self.size;
        if inner.count < self.size {
            inner.count += 1;
        }
    }

    /// Appends the stored values to `dst`, most recent first.
    pub fn get_all(&self, dst: &mut Vec<T>) {
        let inner = self.inner.lock();
        let mut remaining = inner.count;
        let mut off = inner.off;
        while remaining > 0 {
            remaining -= 1;
            off = (off + self.size - 1) % self.size;
            if let Some(v) = &inner.data[off] {
                dst.push(v.clone());
            }
        }
    }

    /// Number of values stored; saturates at the capacity.
    pub fn count(&self) -> usize {
        self.inner.lock().count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_fill_reverse_order() {
        let rb = RingBuffer::new(5);
        rb.append(1);
        rb.append(2);
        rb.append(3);

        let mut out = Vec::new();
        rb.get_all(&mut out);
        assert_eq!(out, vec![3, 2, 1]);
        assert_eq!(rb.count(), 3);
    }

    #[test]
    fn test_overflow_keeps_last_n() {
        let rb = RingBuffer::new(3);
        for i in 1..=7 {
            rb.append(i);
        }

        let mut out = Vec::new();
        rb.get_all(&mut out);
        assert_eq!(out, vec![7, 6, 5]);
        assert_eq!(rb.count(), 3);
    }

    #[test]
    fn test_count_saturates() {
        let rb = RingBuffer::new(2);
        assert_eq!(rb.count(), 0);
        rb.append(10);
        assert_eq!(rb.count(), 1);
        rb.append(20);
        rb.append(30);
        assert_eq!(rb.count(), 2);
    }

    #[test]
    fn test_empty_get_all() {
        let rb: RingBuffer<u64> = RingBuffer::new(4);
        let mut out = Vec::new();
        rb.get_all(&mut out);
        assert!(out.is_empty());
    }
}
