//! Sequence number and view number bookkeeping, shared by every
//! sub-protocol of the system.

use std::cmp::{Ordering, PartialEq, PartialOrd};

use either::{Either, Left, Right};

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

/// Represents a sequence number attributed to a batch of client
/// requests during a consensus instance, or a view number during
/// an epoch of the protocol.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Copy, Clone, Ord, Eq, PartialEq, Hash)]
pub struct SeqNo(u64);

pub(crate) enum InvalidSeqNo {
    Small,
    Big,
}

impl From<u64> for SeqNo {
    #[inline]
    fn from(sequence_number: u64) -> SeqNo {
        SeqNo(sequence_number)
    }
}

impl From<SeqNo> for u64 {
    #[inline]
    fn from(sequence_number: SeqNo) -> u64 {
        sequence_number.0
    }
}

impl PartialOrd for SeqNo {
    fn partial_cmp(&self, other: &SeqNo) -> Option<Ordering> {
        Some(self.0.cmp(&other.0))
    }
}

impl SeqNo {
    /// The first sequence number handed to a batch of requests.
    pub const ZERO: Self = SeqNo(0);

    /// The first sequence number handed to a batch of requests.
    pub const ONE: Self = SeqNo(1);

    /// Returns the following sequence number.
    #[inline]
    pub fn next(self) -> SeqNo {
        SeqNo(self.0.wrapping_add(1))
    }

    /// Return an appropriate value to index a window of in-flight
    /// sequence numbers starting at `other`.
    ///
    /// Sequence numbers below the window are reported as `Small`,
    /// and sequence numbers too far ahead of it as `Big`, which may
    /// be caused by a DoS attack of a malicious node.
    #[inline]
    pub(crate) fn index(self, other: SeqNo) -> Either<InvalidSeqNo, usize> {
        // the log window of in-flight sequence numbers is twice
        // the checkpoint water mark
        const WINDOW: u64 = 2 * crate::bft::checkpoint::DEFAULT_WATER_MARK;

        if self.0 < other.0 {
            return Left(InvalidSeqNo::Small);
        }
        let index = self.0 - other.0;
        if index > WINDOW {
            Left(InvalidSeqNo::Big)
        } else {
            Right(index as usize)
        }
    }
}

/// Types that carry a sequence number.
pub trait Orderable {
    /// Returns the sequence number of this value.
    fn sequence_number(&self) -> SeqNo;
}

#[cfg(test)]
mod tests {
    use super::*;
    use either::{Left, Right};

    #[test]
    fn test_next_increments() {
        let seq = SeqNo::from(41);
        assert_eq!(u64::from(seq.next()), 42);
    }

    #[test]
    fn test_index_window() {
        let base = SeqNo::from(100);
        assert!(matches!(SeqNo::from(99).index(base), Left(InvalidSeqNo::Small)));
        assert!(matches!(SeqNo::from(100).index(base), Right(0)));
        assert!(matches!(SeqNo::from(105).index(base), Right(5)));
        assert!(matches!(
            SeqNo::from(1_000_000).index(base),
            Left(InvalidSeqNo::Big)
        ));
    }
}
