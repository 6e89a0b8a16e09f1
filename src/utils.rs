/// Rounds `value` up to the next multiple of `align`.
///
/// `align` must be a power of two; zero is treated as one.
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    let align = if align == 0 { 1 } else { align };
    (value + align - 1) & !(align - 1)
}

#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    let align = if align == 0 { 1 } else { align };
    value & !(align - 1)
}

#[must_use]
pub const fn is_pow2(value: u64) -> bool {
    value != 0 && (value & (value - 1)) == 0
}
