//! Sequence numbers.

use std::{fmt, num::NonZeroU64};
use thiserror::Error;

/// A one-based, monotonically increasing sequence number for a persistent event.
///
/// The "no events yet" state is represented as `Option<SeqNo>` being `None` rather than by a
/// sentinel zero value, following the teacher crate's use of `Option<NonZeroU64>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeqNo(NonZeroU64);

impl SeqNo {
    /// The smallest possible sequence number.
    pub const MIN: SeqNo = SeqNo(NonZeroU64::MIN);

    /// Builds a [SeqNo] from a raw `u64`, rejecting zero.
    pub fn new(n: u64) -> Result<Self, ZeroSeqNoError> {
        NonZeroU64::new(n).map(SeqNo).ok_or(ZeroSeqNoError)
    }

    /// The underlying `u64` value.
    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }

    /// The next sequence number after this one.
    pub fn succ(&self) -> SeqNo {
        SeqNo(self.0.saturating_add(1))
    }

    /// Returns the sequence number succeeding `last`, or [SeqNo::MIN] if `last` is `None`.
    pub fn succ_of(last: Option<SeqNo>) -> SeqNo {
        last.map(|n| n.succ()).unwrap_or(SeqNo::MIN)
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl TryFrom<u64> for SeqNo {
    type Error = ZeroSeqNoError;

    fn try_from(n: u64) -> Result<Self, Self::Error> {
        SeqNo::new(n)
    }
}

impl From<SeqNo> for u64 {
    fn from(seq_no: SeqNo) -> Self {
        seq_no.as_u64()
    }
}

/// A sequence number of zero was supplied where a positive one is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("sequence numbers must be positive, zero denotes the absence of any event")]
pub struct ZeroSeqNoError;
