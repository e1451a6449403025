//! Credit accounting shared by the read and write paths.
//!
//! Two credit families bound the work a side may have outstanding at its peer:
//! write credits (one per RDMA write, returned by FC messages) and FC credits
//! (one per control send, returned in the immediate data of the peer's
//! writes). Both stay within `[0, depth]`.
//!
//! This scheme is not proven free of deadlock or receiver-not-ready stalls
//! for high latency links or shallow queue depths.

use thiserror::Error;

use crate::messages::{FcPayload, Imm, MAX_BYTES_PER_WRITE, MAX_FCS_PER_WRITE};

/// Depth accepted from a peer is clamped to at least this.
pub const MIN_DEPTH: u32 = 2;
/// Deepest queue a connection will create, locally configured or proposed.
pub const MAX_DEPTH: u32 = 1 << 14;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CreditError {
    #[error("no {0} credit available")]
    Exhausted(&'static str),
    #[error("returning {returned} {what} credits exceeds depth {depth} (holding {held})")]
    Overflow {
        what: &'static str,
        returned: u32,
        held: u32,
        depth: u32,
    },
}

/// A counter bounded by `[0, max]`.
#[derive(Debug, Clone)]
pub struct Credits {
    what: &'static str,
    value: u32,
    max: u32,
}

impl Credits {
    pub fn new(what: &'static str, value: u32, max: u32) -> Self {
        debug_assert!(value <= max);
        Self {
            what,
            value: value.min(max),
            max,
        }
    }

    pub fn get(&self) -> u32 {
        self.value
    }

    pub fn is_empty(&self) -> bool {
        self.value == 0
    }

    pub fn take(&mut self) -> Result<(), CreditError> {
        if self.value == 0 {
            return Err(CreditError::Exhausted(self.what));
        }
        self.value -= 1;
        Ok(())
    }

    pub fn give(&mut self, n: u32) -> Result<(), CreditError> {
        match self.value.checked_add(n) {
            Some(value) if value <= self.max => {
                self.value = value;
                Ok(())
            }
            _ => Err(CreditError::Overflow {
                what: self.what,
                returned: n,
                held: self.value,
                depth: self.max,
            }),
        }
    }
}

/// Per-connection credit state.
#[derive(Debug, Clone)]
pub struct FlowControl {
    depth: u32,
    write_credits: Credits,
    fc_credits: Credits,
    /// RDMA writes received and not yet reported in an FC message.
    pending_writes: u32,
    /// FC messages received and not yet reported in immediate data.
    pending_fcs: u32,
    /// Bytes drained but not yet reported in an FC message.
    pending_bytes: u32,
    /// Drained bytes that warrant an FC message without any received write.
    fc_threshold: u32,
}

impl FlowControl {
    pub fn new(depth: u32) -> Self {
        let depth = depth.max(MIN_DEPTH);
        let writes = (depth / 2).saturating_sub(2).max(1);
        let fcs = (depth / 2 + 2).min(depth);
        Self {
            depth,
            write_credits: Credits::new("write", writes, depth),
            fc_credits: Credits::new("flow control", fcs, depth),
            pending_writes: 0,
            pending_fcs: 0,
            pending_bytes: 0,
            fc_threshold: 1,
        }
    }

    pub fn set_fc_threshold(&mut self, bytes: u32) {
        self.fc_threshold = bytes.max(1);
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn write_credits(&self) -> u32 {
        self.write_credits.get()
    }

    pub fn fc_credits(&self) -> u32 {
        self.fc_credits.get()
    }

    pub fn pending_writes(&self) -> u32 {
        self.pending_writes
    }

    pub fn pending_fcs(&self) -> u32 {
        self.pending_fcs
    }

    pub fn can_write(&self) -> bool {
        !self.write_credits.is_empty()
    }

    /// Consumes a write credit and builds the immediate data for a write of
    /// `bytes`, acknowledging up to 15 received FC messages.
    pub fn start_write(&mut self, bytes: u32) -> Result<Imm, CreditError> {
        debug_assert!(bytes <= MAX_BYTES_PER_WRITE);
        self.write_credits.take()?;
        let fcs_received = self.pending_fcs.min(MAX_FCS_PER_WRITE);
        self.pending_fcs -= fcs_received;
        Ok(Imm {
            bytes_sent: bytes.min(MAX_BYTES_PER_WRITE),
            fcs_received,
        })
    }

    /// Accounts for a control send (SETUP or FC).
    pub fn start_message(&mut self) -> Result<(), CreditError> {
        self.fc_credits.take()
    }

    /// Accounts for an incoming RDMA write.
    pub fn on_write_received(&mut self, imm: Imm) -> Result<(), CreditError> {
        self.fc_credits.give(imm.fcs_received)?;
        self.pending_writes = self.pending_writes.saturating_add(1);
        Ok(())
    }

    /// Accounts for an incoming FC message.
    pub fn on_fc_received(&mut self, fc: &FcPayload) -> Result<(), CreditError> {
        self.write_credits.give(fc.writes_received)?;
        self.pending_fcs = self.pending_fcs.saturating_add(1);
        Ok(())
    }

    /// Records bytes the reader drained from the sink.
    pub fn on_drained(&mut self, bytes: u32) {
        self.pending_bytes = self.pending_bytes.saturating_add(bytes);
    }

    /// Whether the peer is owed an FC message: a received write is
    /// unreported or enough drained bytes piled up.
    pub fn needs_fc(&self) -> bool {
        self.pending_writes > 0 || self.pending_bytes >= self.fc_threshold
    }

    /// Takes the owed progress as an FC payload, consuming an FC credit.
    ///
    /// Returns `None` when nothing is owed or no FC credit is left; the
    /// progress then carries over to the next attempt.
    pub fn take_fc(&mut self) -> Option<FcPayload> {
        if !self.needs_fc() || self.fc_credits.take().is_err() {
            return None;
        }
        let fc = FcPayload {
            bytes_received: self.pending_bytes,
            writes_received: self.pending_writes,
        };
        self.pending_bytes = 0;
        self.pending_writes = 0;
        Some(fc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_credits_split_depth() {
        let fc = FlowControl::new(16);
        assert_eq!(6, fc.write_credits());
        assert_eq!(10, fc.fc_credits());
        let shallow = FlowControl::new(2);
        assert_eq!(1, shallow.write_credits());
        assert_eq!(2, shallow.fc_credits());
        assert_eq!(MIN_DEPTH, FlowControl::new(0).depth());
    }

    #[test]
    fn write_credits_run_out_and_return() {
        let mut fc = FlowControl::new(16);
        for _ in 0..6 {
            fc.start_write(100).unwrap();
        }
        assert!(!fc.can_write());
        assert_eq!(
            Err(CreditError::Exhausted("write")),
            fc.start_write(1).map(|_| ())
        );
        fc.on_fc_received(&FcPayload {
            bytes_received: 600,
            writes_received: 6,
        })
        .unwrap();
        assert_eq!(6, fc.write_credits());
        assert_eq!(1, fc.pending_fcs());
    }

    #[test]
    fn credits_never_exceed_depth() {
        let mut fc = FlowControl::new(8);
        let err = fc
            .on_fc_received(&FcPayload {
                bytes_received: 0,
                writes_received: 7,
            })
            .unwrap_err();
        assert!(matches!(err, CreditError::Overflow { depth: 8, .. }));
        assert_eq!(2, fc.write_credits());
        assert!(fc
            .on_write_received(Imm {
                bytes_sent: 1,
                fcs_received: 15
            })
            .is_err());
        assert!(fc.fc_credits() <= fc.depth());
    }

    #[test]
    fn fc_acks_split_across_writes() {
        let mut fc = FlowControl::new(64);
        for _ in 0..20 {
            fc.on_fc_received(&FcPayload::default()).unwrap();
        }
        let first = fc.start_write(10).unwrap();
        let second = fc.start_write(10).unwrap();
        let third = fc.start_write(10).unwrap();
        assert_eq!(15, first.fcs_received);
        assert_eq!(5, second.fcs_received);
        assert_eq!(0, third.fcs_received);
        assert_eq!(0, fc.pending_fcs());
    }

    #[test]
    fn fc_is_deferred_without_credit() {
        let mut fc = FlowControl::new(8);
        assert_eq!(None, fc.take_fc());
        for _ in 0..6 {
            fc.on_drained(1);
            assert!(fc.take_fc().is_some());
        }
        assert_eq!(0, fc.fc_credits());
        fc.on_write_received(Imm {
            bytes_sent: 10,
            fcs_received: 0,
        })
        .unwrap();
        fc.on_drained(7);
        assert_eq!(None, fc.take_fc());
        fc.on_drained(3);
        fc.on_write_received(Imm {
            bytes_sent: 5,
            fcs_received: 2,
        })
        .unwrap();
        assert_eq!(
            Some(FcPayload {
                bytes_received: 10,
                writes_received: 2
            }),
            fc.take_fc()
        );
        assert_eq!(1, fc.fc_credits());
        assert!(!fc.needs_fc());
    }

    #[test]
    fn small_drains_wait_for_threshold() {
        let mut fc = FlowControl::new(16);
        fc.set_fc_threshold(100);
        fc.on_drained(60);
        assert!(!fc.needs_fc());
        fc.on_drained(40);
        assert_eq!(
            Some(FcPayload {
                bytes_received: 100,
                writes_received: 0
            }),
            fc.take_fc()
        );
        fc.on_drained(1);
        fc.on_write_received(Imm::default()).unwrap();
        assert!(fc.needs_fc());
    }
}
