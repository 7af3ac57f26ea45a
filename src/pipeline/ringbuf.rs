//! Read-once circular buffer for the frame pipeline

use crate::capture::Frame;
use crate::error::BufferError;

/// Fixed-capacity ring where every appended frame can be read at most once.
///
/// Indices are global: the n-th frame ever appended has index `n - 1`,
/// regardless of which slot it lives in. Reading index `i` consumes it and
/// discards every unread frame before it.
pub struct FrameBuffer {
    /// Grows lazily up to `capacity`, then slots are reused cyclically
    slots: Vec<Option<Frame>>,
    capacity: usize,

    /// Total frames ever appended
    appended: usize,

    /// Highest index ever read
    max_read: Option<usize>,

    /// Slot holding the oldest unread frame; `None` while nothing is unread
    start: Option<usize>,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "frame buffer capacity must be non-zero");
        Self {
            slots: Vec::new(),
            capacity,
            appended: 0,
            max_read: None,
            start: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.start == Some(self.appended % self.capacity)
    }

    /// Producer: append a frame, failing if every slot holds an unread frame.
    pub fn append(&mut self, frame: Frame) -> Result<(), BufferError> {
        if self.is_full() {
            return Err(BufferError::Full);
        }

        let slot = self.appended % self.capacity;
        if self.slots.len() < self.capacity {
            self.slots.push(Some(frame));
        } else {
            self.slots[slot] = Some(frame);
        }

        if self.start.is_none() {
            self.start = Some(slot);
        }
        self.appended += 1;
        Ok(())
    }

    /// Consumer: take the frame at `index`.
    pub fn read(&mut self, index: usize) -> Result<Frame, BufferError> {
        if index >= self.appended {
            return Err(BufferError::NotYetAppended {
                index,
                len: self.appended,
            });
        }
        if let Some(max_read) = self.max_read {
            if index <= max_read {
                return Err(BufferError::AlreadyRead { index, max_read });
            }
        }
        // Anything more than `capacity` behind the head was overwritten
        // before it could be read; callers reading forward never hit this.
        if self.appended - index > self.capacity {
            return Err(BufferError::NotYetAppended {
                index,
                len: self.appended,
            });
        }

        let slot = index % self.capacity;
        let frame = self.slots[slot]
            .take()
            .ok_or(BufferError::NotYetAppended {
                index,
                len: self.appended,
            })?;

        self.start = Some((index + 1) % self.capacity);
        if self.is_full() {
            // Wrapped onto the append position: the buffer is empty, not full
            self.start = None;
        }
        self.max_read = Some(index);
        Ok(frame)
    }

    /// Total frames appended over the buffer's lifetime.
    pub fn len(&self) -> usize {
        self.appended
    }

    pub fn is_empty(&self) -> bool {
        self.appended == 0
    }

    /// Frames appended but not yet read (or skipped), in `0..=capacity`.
    pub fn unread_len(&self) -> usize {
        match self.start {
            None => 0,
            Some(start) => {
                let next = self.appended % self.capacity;
                if next > start {
                    next - start
                } else {
                    self.capacity - start + next
                }
            }
        }
    }

    pub fn max_read(&self) -> Option<usize> {
        self.max_read
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.appended)
            .field("unread", &self.unread_len())
            .field("max_read", &self.max_read)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;

    fn frame(i: usize) -> Frame {
        Frame::new(Bytes::from(i.to_le_bytes().to_vec()), i)
    }

    fn value(f: &Frame) -> usize {
        let mut raw = [0u8; std::mem::size_of::<usize>()];
        raw.copy_from_slice(&f.data);
        usize::from_le_bytes(raw)
    }

    #[test]
    fn empty_buffer() {
        let buf = FrameBuffer::new(4);
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.unread_len(), 0);
        assert!(!buf.is_full());
    }

    #[test]
    fn fills_to_capacity_then_rejects() {
        let mut buf = FrameBuffer::new(3);
        for i in 0..3 {
            buf.append(frame(i)).unwrap();
        }
        assert!(buf.is_full());
        assert_eq!(buf.unread_len(), 3);
        assert_eq!(buf.append(frame(3)), Err(BufferError::Full));
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn read_is_destructive() {
        let mut buf = FrameBuffer::new(4);
        buf.append(frame(0)).unwrap();
        buf.append(frame(1)).unwrap();

        assert_eq!(value(&buf.read(0).unwrap()), 0);
        assert_eq!(
            buf.read(0).unwrap_err(),
            BufferError::AlreadyRead {
                index: 0,
                max_read: 0
            }
        );
        assert_eq!(
            buf.read(2).unwrap_err(),
            BufferError::NotYetAppended { index: 2, len: 2 }
        );
    }

    #[test]
    fn skipping_ahead_discards_older_frames() {
        let mut buf = FrameBuffer::new(4);
        for i in 0..4 {
            buf.append(frame(i)).unwrap();
        }
        assert_eq!(value(&buf.read(2).unwrap()), 2);
        assert_eq!(buf.unread_len(), 1);
        assert!(matches!(buf.read(1), Err(BufferError::AlreadyRead { .. })));
        // two slots freed by the skip plus the one read
        for i in 4..7 {
            buf.append(frame(i)).unwrap();
        }
        assert!(buf.is_full());
    }

    #[test]
    fn reading_last_frame_empties_rather_than_fills() {
        let mut buf = FrameBuffer::new(2);
        buf.append(frame(0)).unwrap();
        buf.append(frame(1)).unwrap();
        assert!(buf.is_full());

        buf.read(1).unwrap();
        assert!(!buf.is_full());
        assert_eq!(buf.unread_len(), 0);
        buf.append(frame(2)).unwrap();
        assert_eq!(buf.unread_len(), 1);
    }

    #[test]
    fn wraparound_preserves_insertion_order() {
        let cap = 4;
        let mut buf = FrameBuffer::new(cap);
        let mut out = Vec::new();
        let mut next_read = 0;
        for i in 0..cap + 3 {
            if buf.is_full() {
                out.push(value(&buf.read(next_read).unwrap()));
                next_read += 1;
            }
            buf.append(frame(i)).unwrap();
        }
        while next_read < buf.len() {
            out.push(value(&buf.read(next_read).unwrap()));
            next_read += 1;
        }
        assert_eq!(out, (0..cap + 3).collect::<Vec<_>>());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Append,
        ReadAhead(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Append), (0usize..4).prop_map(Op::ReadAhead)]
    }

    proptest! {
        #[test]
        fn invariants_hold_under_random_ops(cap in 1usize..8, ops in prop::collection::vec(op(), 0..200)) {
            let mut buf = FrameBuffer::new(cap);
            let mut returned = std::collections::HashSet::new();
            let mut next_unread = 0usize;

            for op in ops {
                match op {
                    Op::Append => {
                        let was_full = buf.unread_len() == cap;
                        let res = buf.append(frame(buf.len()));
                        prop_assert_eq!(res.is_err(), was_full);
                    }
                    Op::ReadAhead(skip) => {
                        let index = next_unread + skip;
                        if index < buf.len() {
                            let f = buf.read(index).unwrap();
                            prop_assert_eq!(value(&f), index);
                            prop_assert!(returned.insert(index));
                            next_unread = index + 1;
                            for consumed in 0..next_unread {
                                let is_already_read = matches!(
                                    buf.read(consumed),
                                    Err(BufferError::AlreadyRead { .. })
                                );
                                prop_assert!(is_already_read);
                            }
                        } else {
                            prop_assert!(buf.read(index).is_err());
                        }
                    }
                }
                prop_assert!(buf.unread_len() <= cap);
                prop_assert_eq!(buf.is_full(), buf.unread_len() == cap);
                prop_assert_eq!(buf.unread_len(), buf.len() - next_unread);
            }
        }
    }
}
