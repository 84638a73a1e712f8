use std::fmt::{Display, Formatter};

/// Sequence number of a data frame, per peer and per direction (reliable vs.
///  unreliable traffic count independently).
///
/// Sequence numbers are 16 bits and wrap around, so 'newer' is decided within
///  the forward half-circle: a number is ahead of another if it is at most
///  [SeqNo::HALF_RANGE] increments in front of it, modulo 2^16.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SeqNo(u16);

impl Display for SeqNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNo {
    pub const ZERO: SeqNo = SeqNo(0);

    /// circular distance threshold: anything further ahead than this is 'old'
    pub const HALF_RANGE: u16 = 0x7fff;

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(self) -> u16 {
        self.0
    }

    pub fn next(self) -> SeqNo {
        SeqNo(self.0.wrapping_add(1))
    }

    /// true iff `self` is strictly ahead of `last` within the forward
    ///  half-circle
    pub fn is_newer_than(self, last: SeqNo) -> bool {
        (self.0 > last.0 && self.0 - last.0 <= Self::HALF_RANGE)
            || (self.0 < last.0 && last.0 - self.0 > Self::HALF_RANGE)
    }

    /// true iff `self == last + 1 (mod 2^16)`
    pub fn is_next_after(self, last: SeqNo) -> bool {
        self == last.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::ahead_by_one(1, 0, true)]
    #[case::ahead_by_two(2, 0, true)]
    #[case::equal(7, 7, false)]
    #[case::behind(6, 7, false)]
    #[case::half_range_ahead(0x7fff, 0, true)]
    #[case::just_past_half_range(0x8000, 0, false)]
    #[case::wrap_ahead(2, 0xfffe, true)]
    #[case::wrap_behind(0xfffe, 2, false)]
    #[case::max_vs_zero(0xffff, 0, false)]
    #[case::zero_vs_max(0, 0xffff, true)]
    fn test_is_newer_than(#[case] new: u16, #[case] last: u16, #[case] expected: bool) {
        assert_eq!(SeqNo::from_raw(new).is_newer_than(SeqNo::from_raw(last)), expected);
    }

    /// exhaustive over all forward distances from a couple of anchor points
    #[rstest]
    #[case::from_zero(0)]
    #[case::from_mid(12345)]
    #[case::from_near_wrap(0xfffd)]
    fn test_is_newer_than_all_distances(#[case] last: u16) {
        let last = SeqNo::from_raw(last);
        for k in 1u32..=0xffff {
            let new = SeqNo::from_raw(last.to_raw().wrapping_add(k as u16));
            let expected = k <= SeqNo::HALF_RANGE as u32;
            assert_eq!(new.is_newer_than(last), expected, "k={}", k);
            assert_eq!(new.is_next_after(last), k == 1, "k={}", k);
        }
        assert!(!last.is_newer_than(last));
        assert!(!last.is_next_after(last));
    }

    #[rstest]
    #[case::simple(4, 5)]
    #[case::wrap(0xffff, 0)]
    fn test_next(#[case] from: u16, #[case] expected: u16) {
        assert_eq!(SeqNo::from_raw(from).next(), SeqNo::from_raw(expected));
    }
}
