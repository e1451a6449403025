use thiserror::Error;

/// Cursors of a [`RingPtr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Producer position: bytes written into the ring.
    Head,
    /// Bytes handed to the network but not yet completed.
    Middle,
    /// Consumer position: bytes released back to the producer.
    Tail,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RingError {
    #[error("advancing {cursor:?} by {by} overruns the ring ({size} bytes, {used} used)")]
    Overrun {
        cursor: Cursor,
        by: u64,
        size: u64,
        used: u64,
    },
    #[error("advancing {cursor:?} by {by} passes its leading cursor ({ahead} ahead)")]
    Underrun { cursor: Cursor, by: u64, ahead: u64 },
}

/// Head/middle/tail cursors over a circular buffer of known size.
///
/// The counters grow monotonically and are reduced modulo the size only when
/// turned into an offset, so `TAIL <= MIDDLE <= HEAD <= TAIL + size` always
/// holds and every advance is checked against it.
///
/// A tracker made with [`RingPtr::new`] keeps MIDDLE glued to HEAD and is
/// used for the sink buffer and the local view of the remote sink. One made
/// with [`RingPtr::staged`] moves MIDDLE on its own and is used for the
/// source buffer, where MIDDLE marks what has been posted.
///
/// # Examples
///
/// ```
/// # use rdma_stream_core::ring_ptr::{Cursor, RingPtr};
/// let mut ptr = RingPtr::staged(8);
/// ptr.incr_head(6).unwrap();
/// ptr.incr(Cursor::Middle, 4).unwrap();
/// assert_eq!(2, ptr.available_between(Cursor::Head, Cursor::Middle));
/// ptr.incr_tail(4).unwrap();
/// assert_eq!(6, ptr.neg_available());
/// assert_eq!(4, ptr.ptr(Cursor::Tail));
/// ```
#[derive(Debug, Clone, Default)]
pub struct RingPtr {
    size: u64,
    head: u64,
    middle: u64,
    tail: u64,
    staged: bool,
}

impl RingPtr {
    pub fn new(size: usize) -> Self {
        Self {
            size: size as u64,
            ..Default::default()
        }
    }

    pub fn staged(size: usize) -> Self {
        Self {
            staged: true,
            ..Self::new(size)
        }
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Offset of `cursor` inside the buffer.
    pub fn ptr(&self, cursor: Cursor) -> usize {
        if self.size == 0 {
            return 0;
        }
        (self.get(cursor) % self.size) as usize
    }

    pub fn head(&self) -> usize {
        self.ptr(Cursor::Head)
    }

    pub fn tail(&self) -> usize {
        self.ptr(Cursor::Tail)
    }

    /// Bytes between `lead` and `lag`.
    pub fn available_between(&self, lead: Cursor, lag: Cursor) -> usize {
        self.get(lead).saturating_sub(self.get(lag)) as usize
    }

    /// Bytes between HEAD and TAIL.
    pub fn available(&self) -> usize {
        self.available_between(Cursor::Head, Cursor::Tail)
    }

    /// Free space the producer may still fill.
    pub fn neg_available(&self) -> usize {
        (self.size - (self.head - self.tail)) as usize
    }

    /// Contiguous bytes from HEAD to the end of the buffer.
    pub fn contiguous_free(&self) -> usize {
        self.neg_available().min(self.size() - self.head())
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        self.head - self.tail == self.size
    }

    pub fn incr_head(&mut self, by: usize) -> Result<(), RingError> {
        self.incr(Cursor::Head, by)
    }

    pub fn incr_tail(&mut self, by: usize) -> Result<(), RingError> {
        self.incr(Cursor::Tail, by)
    }

    pub fn incr(&mut self, cursor: Cursor, by: usize) -> Result<(), RingError> {
        let by = by as u64;
        match cursor {
            Cursor::Head => {
                let used = self.head - self.tail;
                if used + by > self.size {
                    return Err(RingError::Overrun {
                        cursor,
                        by,
                        size: self.size,
                        used,
                    });
                }
                self.head += by;
                if !self.staged {
                    self.middle = self.head;
                }
            }
            Cursor::Middle => {
                let ahead = self.head - self.middle;
                if by > ahead {
                    return Err(RingError::Underrun { cursor, by, ahead });
                }
                self.middle += by;
            }
            Cursor::Tail => {
                let ahead = self.middle - self.tail;
                if by > ahead {
                    return Err(RingError::Underrun { cursor, by, ahead });
                }
                self.tail += by;
            }
        }
        Ok(())
    }

    fn get(&self, cursor: Cursor) -> u64 {
        match cursor {
            Cursor::Head => self.head,
            Cursor::Middle => self.middle,
            Cursor::Tail => self.tail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_offsets_but_not_counters() {
        let mut ptr = RingPtr::new(10);
        for _ in 0..7 {
            ptr.incr_head(7).unwrap();
            ptr.incr_tail(7).unwrap();
        }
        assert_eq!(49 % 10, ptr.head());
        assert_eq!(ptr.head(), ptr.tail());
        assert!(ptr.is_empty());
        assert_eq!(10, ptr.neg_available());
    }

    #[test]
    fn head_cannot_overrun_tail() {
        let mut ptr = RingPtr::new(16);
        ptr.incr_head(16).unwrap();
        assert!(ptr.is_full());
        assert_eq!(0, ptr.neg_available());
        assert!(matches!(
            ptr.incr_head(1),
            Err(RingError::Overrun { used: 16, .. })
        ));
    }

    #[test]
    fn tail_cannot_pass_middle() {
        let mut ptr = RingPtr::staged(16);
        ptr.incr_head(8).unwrap();
        assert_eq!(
            Err(RingError::Underrun {
                cursor: Cursor::Tail,
                by: 1,
                ahead: 0
            }),
            ptr.incr_tail(1)
        );
        ptr.incr(Cursor::Middle, 5).unwrap();
        assert!(ptr.incr(Cursor::Middle, 4).is_err());
        ptr.incr_tail(5).unwrap();
        assert_eq!(3, ptr.available());
    }

    #[test]
    fn linked_middle_follows_head() {
        let mut ptr = RingPtr::new(32);
        ptr.incr_head(20).unwrap();
        assert_eq!(20, ptr.available_between(Cursor::Middle, Cursor::Tail));
        ptr.incr_tail(20).unwrap();
        assert!(ptr.is_empty());
    }

    #[test]
    fn contiguous_free_stops_at_buffer_end() {
        let mut ptr = RingPtr::new(16);
        ptr.incr_head(12).unwrap();
        ptr.incr_tail(10).unwrap();
        assert_eq!(14, ptr.neg_available());
        assert_eq!(4, ptr.contiguous_free());
        ptr.incr_head(4).unwrap();
        assert_eq!(0, ptr.head());
        assert_eq!(10, ptr.contiguous_free());
    }
}
