//! Traffic counters for the gateway loop.

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GatewayStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub frames_dropped: u64,
    pub chunks_sent: u64,
    pub chunks_received: u64,
    pub chunks_rejected: u64,
    pub reassembled: u64,
    pub reassembly_discarded: u64,
}

impl GatewayStats {
    /// Counts accumulated since `earlier`.
    pub fn since(&self, earlier: &Self) -> Self {
        Self {
            frames_in: self.frames_in.saturating_sub(earlier.frames_in),
            frames_out: self.frames_out.saturating_sub(earlier.frames_out),
            frames_dropped: self.frames_dropped.saturating_sub(earlier.frames_dropped),
            chunks_sent: self.chunks_sent.saturating_sub(earlier.chunks_sent),
            chunks_received: self.chunks_received.saturating_sub(earlier.chunks_received),
            chunks_rejected: self.chunks_rejected.saturating_sub(earlier.chunks_rejected),
            reassembled: self.reassembled.saturating_sub(earlier.reassembled),
            reassembly_discarded: self
                .reassembly_discarded
                .saturating_sub(earlier.reassembly_discarded),
        }
    }

    /// Log what happened since `last`, then move `last` up to now. Quiet
    /// intervals log nothing. Returns whether a line was written.
    pub fn report(&self, last: &mut Self, pending: usize) -> bool {
        let delta = self.since(last);
        if delta == Self::default() {
            return false;
        }
        tracing::info!(
            frames_in = delta.frames_in,
            frames_out = delta.frames_out,
            frames_dropped = delta.frames_dropped,
            chunks_sent = delta.chunks_sent,
            chunks_received = delta.chunks_received,
            chunks_rejected = delta.chunks_rejected,
            reassembled = delta.reassembled,
            reassembly_discarded = delta.reassembly_discarded,
            pending,
            "gateway stats"
        );
        *last = self.clone();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_interval_is_not_reported() {
        let mut stats = GatewayStats::default();
        let mut last = GatewayStats::default();
        assert!(!stats.report(&mut last, 0));

        stats.frames_in = 3;
        stats.chunks_sent = 9;
        assert!(stats.report(&mut last, 1));
        assert_eq!(last, stats);

        // Totals are unchanged, so nothing new to say.
        assert!(!stats.report(&mut last, 1));

        stats.frames_in += 1;
        assert_eq!(
            stats.since(&last),
            GatewayStats {
                frames_in: 1,
                ..GatewayStats::default()
            }
        );
        assert!(stats.report(&mut last, 0));
    }
}
