use core::fmt::Display;

/// Counters kept per connection and logged when it closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Successful reads.
    pub reads: u64,
    /// Read iterations that found the sink empty.
    pub buffer_empty: u64,
    /// FC messages deferred for lack of FC credit.
    pub no_credits_fc: u64,
    /// Successful writes.
    pub writes: u64,
    /// Write iterations that found the source or the remote sink full.
    pub buffer_full: u64,
    /// Write iterations without a write credit.
    pub no_credits_rdma: u64,
}

impl Display for Stats {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(
            f,
            "reads {} (empty {}, fc deferred {}), writes {} (full {}, no credit {})",
            self.reads,
            self.buffer_empty,
            self.no_credits_fc,
            self.writes,
            self.buffer_full,
            self.no_credits_rdma
        )
    }
}
