
/// Widening casts between the offset (u64), length (usize) and wire field (u32) types
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

impl SafeCast<u64> for u32 {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}

#[cfg(target_pointer_width = "64")]
impl SafeCast<u64> for usize {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}


/// For narrowing casts where transfer logic ensures that the value is in the narrower type's
///  range, e.g. a byte count that was bounded by a buffer length before.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<usize> for u64 {
    fn prechecked_cast(self) -> usize {
        self.try_into().expect("this is a bug: transfer logic should have ensured the value range")
    }
}

/// Narrowing to a 32 bit wire field, clamping values that do not fit
pub trait SaturatingCast<T> {
    fn saturating_cast(self) -> T;
}
impl SaturatingCast<u32> for u64 {
    fn saturating_cast(self) -> u32 {
        u32::try_from(self).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0)]
    #[case(17, 17)]
    #[case(u32::MAX as u64, u32::MAX)]
    #[case(u32::MAX as u64 + 1, u32::MAX)]
    #[case(u64::MAX, u32::MAX)]
    fn test_saturating_cast(#[case] value: u64, #[case] expected: u32) {
        assert_eq!(value.saturating_cast(), expected);
    }
}
