//! Segmented ring buffer for I/O staging
//!
//! Fixed-capacity circular buffer of fixed-size segments, used to decouple
//! byte production and consumption on a connection without per-call heap
//! allocation. One segment at a time accepts writes (the head), one at a
//! time supplies reads (the tail); segments are reused in ring order. When
//! every byte of capacity holds unread data, writes fail with [`BufferFull`]
//! rather than overwriting, and the caller is expected to drain first.

use thiserror::Error;

/// Size of one ring segment in bytes
pub const SEGMENT_SIZE: usize = 16 * 1024;

/// Write rejected because unread data occupies all remaining capacity
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Ring buffer full")]
pub struct BufferFull;

struct Segment {
    data: Box<[u8]>,
    /// Write cursor
    head: usize,
    /// Read cursor
    tail: usize,
}

impl Segment {
    fn new() -> Self {
        Segment {
            data: vec![0u8; SEGMENT_SIZE].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    fn used_space(&self) -> usize {
        self.head - self.tail
    }

    fn remaining(&self) -> usize {
        SEGMENT_SIZE - self.head
    }

    fn is_clean(&self) -> bool {
        self.head == 0 && self.tail == 0
    }

    fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}

/// Fixed-capacity staging buffer of `slice_count` segments
pub struct RingBuffer {
    segments: Vec<Segment>,
    /// Index of the segment currently accepting writes
    head: usize,
    /// Index of the segment currently supplying reads
    tail: usize,
    /// Total unread bytes across all segments
    used: usize,
}

impl RingBuffer {
    /// Allocates all segments up front; the buffer never resizes
    pub fn new(slice_count: usize) -> Self {
        assert!(slice_count > 0, "ring buffer needs at least one segment");
        RingBuffer {
            segments: (0..slice_count).map(|_| Segment::new()).collect(),
            head: 0,
            tail: 0,
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.segments.len() * SEGMENT_SIZE
    }

    /// Total unread bytes, O(1)
    pub fn used_space(&self) -> usize {
        self.used
    }

    /// Bytes that can still be written before backpressure kicks in
    pub fn writable_space(&self) -> usize {
        self.capacity() - self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// O(1); full means the next write of even one byte would fail
    pub fn is_full(&self) -> bool {
        self.used == self.capacity()
    }

    /// Reset all cursors without deallocating
    pub fn clear(&mut self) {
        for segment in &mut self.segments {
            segment.clear();
        }
        self.head = 0;
        self.tail = 0;
        self.used = 0;
    }

    /// Copy `data` into the buffer, splitting across segments as needed.
    /// Fails without writing anything if the bytes do not fit.
    pub fn write(&mut self, data: &[u8]) -> Result<(), BufferFull> {
        if data.len() > self.writable_space() {
            return Err(BufferFull);
        }
        let mut data = data;
        while !data.is_empty() {
            let slot = self
                .write_slot()
                .expect("writable space was checked up front");
            let count = data.len().min(slot.len());
            slot[..count].copy_from_slice(&data[..count]);
            self.commit(count);
            data = &data[count..];
        }
        Ok(())
    }

    /// Contiguous writable span of the head segment, advancing to the next
    /// clean segment when the current one is exhausted. `None` when full.
    /// Pair every use with [`RingBuffer::commit`].
    pub fn write_slot(&mut self) -> Option<&mut [u8]> {
        if self.segments[self.head].remaining() == 0 {
            let next = (self.head + 1) % self.segments.len();
            if !self.segments[next].is_clean() {
                return None;
            }
            self.head = next;
        }
        let segment = &mut self.segments[self.head];
        if segment.remaining() == 0 {
            return None;
        }
        Some(&mut segment.data[segment.head..])
    }

    /// Mark `count` bytes of the current write slot as filled
    pub fn commit(&mut self, count: usize) {
        let segment = &mut self.segments[self.head];
        debug_assert!(count <= segment.remaining());
        segment.head += count;
        self.used += count;
    }

    /// Unread bytes of the tail segment, consumed in one step. Empty slice
    /// when nothing is staged. The returned view stays valid until the next
    /// write.
    pub fn read_data(&mut self) -> &[u8] {
        let index = self.tail;
        let (start, end) = {
            let segment = &self.segments[index];
            (segment.tail, segment.head)
        };
        if start == end {
            // Tail segment drained; if the writer has moved on, follow it
            if index != self.head {
                self.tail = (index + 1) % self.segments.len();
                return self.read_data_current();
            }
            return &[];
        }
        self.used -= end - start;
        self.segments[index].clear();
        if index != self.head {
            self.tail = (index + 1) % self.segments.len();
        }
        &self.segments[index].data[start..end]
    }

    fn read_data_current(&mut self) -> &[u8] {
        let index = self.tail;
        let (start, end) = {
            let segment = &self.segments[index];
            (segment.tail, segment.head)
        };
        if start == end {
            return &[];
        }
        self.used -= end - start;
        self.segments[index].clear();
        if index != self.head {
            self.tail = (index + 1) % self.segments.len();
        }
        &self.segments[index].data[start..end]
    }
}
