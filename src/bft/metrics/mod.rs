//! Event counters for the protocol core.
//!
//! An instance of `Metrics` is created per replica and injected into
//! each component; an external exporter may scrape the counters at
//! any time.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($( $(#[$doc:meta])* $name:ident, $inc:ident, $get:ident; )*) => {
        /// Counters tracking the externally observable behavior of
        /// a replica.
        #[derive(Debug, Default)]
        pub struct Metrics {
            $( $(#[$doc])* $name: AtomicU64, )*
        }

        impl Metrics {
            /// Creates a fresh set of counters, all zeroed.
            pub fn new() -> Self {
                Self::default()
            }

            $(
                pub fn $inc(&self) {
                    self.$name.fetch_add(1, Ordering::Relaxed);
                }

                pub fn $get(&self) -> u64 {
                    self.$name.load(Ordering::Relaxed)
                }
            )*
        }
    };
}

counters! {
    /// Wire frames accepted by the message gate.
    frames_received, inc_frames_received, frames_received;
    /// Frames dropped because their envelope failed to parse.
    bad_framing, inc_bad_framing, bad_framing;
    /// Frames or votes dropped on signature verification failure.
    bad_signatures, inc_bad_signatures, bad_signatures;
    /// Frames dropped as duplicates of an already seen message.
    duplicates_dropped, inc_duplicates_dropped, duplicates_dropped;
    /// Messages dropped below the stable checkpoint.
    stale_dropped, inc_stale_dropped, stale_dropped;
    /// Prepare and commit votes counted towards a quorum.
    votes_counted, inc_votes_counted, votes_counted;
    /// Proposals accepted into a collector's main slot.
    proposals_accepted, inc_proposals_accepted, proposals_accepted;
    /// Batches handed to the executor.
    batches_executed, inc_batches_executed, batches_executed;
    /// Stable checkpoints promoted.
    checkpoints_promoted, inc_checkpoints_promoted, checkpoints_promoted;
    /// View changes started by the local timer.
    view_changes_started, inc_view_changes_started, view_changes_started;
    /// Client replies delivered after f+1 matching responses.
    responses_matched, inc_responses_matched, responses_matched;
    /// Records appended to the write-ahead log.
    wal_appends, inc_wal_appends, wal_appends;
    /// Sends which failed with an unreachable peer.
    peers_unreachable, inc_peers_unreachable, peers_unreachable;
}

#[cfg(test)]
mod tests {
    use super::Metrics;

    #[test]
    fn test_counters_start_at_zero_and_increment() {
        let m = Metrics::new();
        assert_eq!(m.frames_received(), 0);
        m.inc_frames_received();
        m.inc_frames_received();
        assert_eq!(m.frames_received(), 2);
    }
}
