use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

/// Sequence id of a data packet inside a session.
///
/// Sequence ids form a ring over `1 ..= u32::MAX` - the raw value 0 is reserved on the wire for
///  packets that carry no sequenced payload (acks, window updates, handshake, close). Stepping
///  past `u32::MAX` wraps around to 1.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Seq(u32);

impl Display for Seq {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Seq {
    pub const MIN: Seq = Seq(1);

    /// number of distinct sequence ids on the ring
    const RING_SIZE: i64 = u32::MAX as i64;

    /// The raw value 0 is not a valid sequence id.
    pub fn from_raw(raw: u32) -> Option<Seq> {
        if raw == 0 {
            None
        }
        else {
            Some(Seq(raw))
        }
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    /// Steps `step` positions along the ring (negative steps go backwards), wrapping around and
    ///  skipping the reserved value 0.
    pub fn advanced_by(self, step: i64) -> Seq {
        let mut offset = (self.0 as i64 - 1 + step) % Self::RING_SIZE;
        if offset < 0 {
            offset += Self::RING_SIZE;
        }
        Seq(offset as u32 + 1)
    }

    pub fn next(self) -> Seq {
        self.advanced_by(1)
    }

    /// Circular comparison with half-range tie-break: a sequence id is 'less' than another if the
    ///  forward distance to it is shorter than half the ring. Used to reject stale incoming
    ///  sequence ids.
    pub fn circular_cmp(self, other: Seq) -> Ordering {
        if self.0 == other.0 {
            Ordering::Equal
        }
        else if self.0 < other.0 {
            if other.0 - self.0 < u32::MAX / 2 {
                Ordering::Less
            }
            else {
                Ordering::Greater
            }
        }
        else if self.0 - other.0 < u32::MAX / 2 {
            Ordering::Greater
        }
        else {
            Ordering::Less
        }
    }

    /// Circular half-open interval containment: is `target` in `[start, end)`? When `start > end`
    ///  (raw comparison) the interval continues through the wrap.
    pub fn is_between(start: Seq, end: Seq, target: Seq) -> bool {
        if start.0 <= end.0 {
            target.0 >= start.0 && target.0 < end.0
        }
        else {
            target.0 >= start.0 || target.0 < end.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case::min(1)]
    #[case::mid(12345)]
    #[case::near_wrap(u32::MAX - 1)]
    #[case::at_wrap(u32::MAX)]
    fn test_step_bijection(#[case] raw: u32) {
        let seq = Seq::from_raw(raw).unwrap();
        assert_eq!(seq.next().advanced_by(-1), seq);
        assert_eq!(seq.advanced_by(-1).next(), seq);
    }

    #[rstest]
    #[case::simple(1, 1, 2)]
    #[case::wrap_forward(u32::MAX, 1, 1)]
    #[case::wrap_backward(1, -1, u32::MAX)]
    #[case::big_step(1, 10, 11)]
    #[case::full_circle(17, Seq::RING_SIZE, 17)]
    fn test_advanced_by(#[case] raw: u32, #[case] step: i64, #[case] expected: u32) {
        assert_eq!(Seq::from_raw(raw).unwrap().advanced_by(step), Seq::from_raw(expected).unwrap());
    }

    #[rstest]
    #[case::equal(5, 5, Ordering::Equal)]
    #[case::less(5, 6, Ordering::Less)]
    #[case::greater(6, 5, Ordering::Greater)]
    #[case::wrapped_less(u32::MAX, 1, Ordering::Less)]
    #[case::wrapped_greater(1, u32::MAX, Ordering::Greater)]
    fn test_circular_cmp(#[case] a: u32, #[case] b: u32, #[case] expected: Ordering) {
        let a = Seq::from_raw(a).unwrap();
        let b = Seq::from_raw(b).unwrap();
        assert_eq!(a.circular_cmp(b), expected);
    }

    #[rstest]
    #[case::at_start(1, 3, 1, true)]
    #[case::at_end(1, 2, 2, false)]
    #[case::past_end(2, 3, 3, false)]
    #[case::inside(2, 5, 4, true)]
    #[case::wrap_high_side(u32::MAX - 1, 3, u32::MAX, true)]
    #[case::wrap_low_side(u32::MAX - 1, 3, 2, true)]
    #[case::wrap_outside(u32::MAX - 1, 3, 4, false)]
    fn test_is_between(#[case] start: u32, #[case] end: u32, #[case] target: u32, #[case] expected: bool) {
        let start = Seq::from_raw(start).unwrap();
        let end = Seq::from_raw(end).unwrap();
        let target = Seq::from_raw(target).unwrap();
        assert_eq!(Seq::is_between(start, end, target), expected);
    }

    #[rstest]
    fn test_from_raw_zero() {
        assert_eq!(Seq::from_raw(0), None);
    }
}
