//! Token ring ranges for partition-range scans.

use crate::cluster::{Token, MIN_TOKEN};

use get_size::GetSize;

use serde::{Deserialize, Serialize};

/// Half-open ring interval `(left, right]`. A range whose `right` equals
/// the minimum token extends to the end of the ring; a range with
/// `left >= right` wraps around.
#[derive(
    Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize, GetSize,
)]
pub struct TokenRange {
    pub left: Token,
    pub right: Token,
}

impl TokenRange {
    pub fn new(left: Token, right: Token) -> Self {
        TokenRange { left, right }
    }

    /// Whole-ring range.
    pub fn full() -> Self {
        TokenRange {
            left: MIN_TOKEN,
            right: MIN_TOKEN,
        }
    }

    /// Whether the range's right bound is the ring minimum, i.e. the
    /// range runs to the end of the ring.
    #[inline]
    pub fn right_is_minimum(&self) -> bool {
        self.right == MIN_TOKEN
    }

    /// Whether the range wraps past the ring end (a `left == right` range
    /// covers the whole ring and counts as wrapping).
    #[inline]
    pub fn wraps(&self) -> bool {
        self.left >= self.right
    }

    /// Whether `token` falls within `(left, right]`.
    pub fn contains(&self, token: Token) -> bool {
        if self.left == self.right {
            // full ring (or single wrap point): everything matches except
            // that a degenerate non-minimum bounds range matches only its
            // own point; the scan driver never builds the latter
            return true;
        }
        if self.left < self.right {
            token > self.left && token <= self.right
        } else {
            token > self.left || token <= self.right
        }
    }

    /// Splits at `at`, yielding `(left, at]` and `(at, right]`, or `None`
    /// when `at` is not strictly inside the range.
    pub fn split(&self, at: Token) -> Option<(TokenRange, TokenRange)> {
        if at == self.right || !self.contains(at) {
            return None;
        }
        Some((
            TokenRange::new(self.left, at),
            TokenRange::new(at, self.right),
        ))
    }

    /// This range extended rightwards to `right` (used when merging two
    /// adjacent pieces).
    pub fn with_new_right(&self, right: Token) -> Self {
        TokenRange::new(self.left, right)
    }
}

#[cfg(test)]
mod ring_tests {
    use super::*;

    #[test]
    fn contains_plain_range() {
        let r = TokenRange::new(10, 20);
        assert!(!r.contains(10));
        assert!(r.contains(11));
        assert!(r.contains(20));
        assert!(!r.contains(21));
    }

    #[test]
    fn contains_wrapping_range() {
        let r = TokenRange::new(100, 5);
        assert!(r.contains(101));
        assert!(r.contains(3));
        assert!(r.contains(5));
        assert!(!r.contains(50));
    }

    #[test]
    fn split_inside_and_outside() {
        let r = TokenRange::new(10, 20);
        let (a, b) = r.split(15).unwrap();
        assert_eq!(a, TokenRange::new(10, 15));
        assert_eq!(b, TokenRange::new(15, 20));
        assert!(r.split(20).is_none());
        assert!(r.split(25).is_none());
    }

    #[test]
    fn full_range_contains_everything() {
        let r = TokenRange::full();
        assert!(r.contains(0));
        assert!(r.contains(u64::MAX));
    }
}
