//! Arithmetic status flag computation.
//!
//! AF is computed for ADD/SUB/INC/DEC/NEG and cleared for logical operations,
//! where it is architecturally undefined.

use crate::state::{width_mask, FLAG_AF, FLAG_CF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF, FLAGS_STATUS_MASK};

/// Status flags written by one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlagsUpdate {
    /// Flags the instruction writes.
    pub mask: u64,
    /// New values of the written flags.
    pub status: u64,
}

impl FlagsUpdate {
    /// Leaves all flags unchanged.
    pub const NONE: Self = Self { mask: 0, status: 0 };

    /// Writes the flags in `mask` from `status`.
    #[must_use]
    pub const fn new(mask: u64, status: u64) -> Self {
        Self {
            mask,
            status: status & mask,
        }
    }

    /// Sets or clears one flag and adds it to the written set.
    #[must_use]
    pub const fn with(self, flag: u64, value: bool) -> Self {
        let status = if value {
            self.status | flag
        } else {
            self.status & !flag
        };
        Self {
            mask: self.mask | flag,
            status,
        }
    }

    /// Drops `flag` from the written set.
    #[must_use]
    pub const fn without(self, flag: u64) -> Self {
        Self {
            mask: self.mask & !flag,
            status: self.status & !flag,
        }
    }
}

/// Most significant bit of a `bits`-wide value.
#[must_use]
pub const fn sign_bit(bits: u8) -> u64 {
    1 << (bits - 1)
}

/// ZF, SF and PF of `result`.
#[must_use]
pub const fn result_flags(result: u64, bits: u8) -> u64 {
    let result = result & width_mask(bits);
    let mut flags = 0;
    if result == 0 {
        flags |= FLAG_ZF;
    }
    if result & sign_bit(bits) != 0 {
        flags |= FLAG_SF;
    }
    // PF covers the low byte only.
    if (result as u8).count_ones() % 2 == 0 {
        flags |= FLAG_PF;
    }
    flags
}

/// `lhs + rhs + carry` truncated to `bits`.
#[must_use]
pub fn add(lhs: u64, rhs: u64, carry: bool, bits: u8) -> (u64, FlagsUpdate) {
    let mask = width_mask(bits);
    let (lhs, rhs) = (lhs & mask, rhs & mask);
    let wide = u128::from(lhs) + u128::from(rhs) + u128::from(carry);
    let result = (wide as u64) & mask;
    let update = FlagsUpdate::new(FLAGS_STATUS_MASK, result_flags(result, bits))
        .with(FLAG_CF, wide > u128::from(mask))
        .with(FLAG_AF, (lhs ^ rhs ^ result) & 0x10 != 0)
        .with(FLAG_OF, (lhs ^ result) & (rhs ^ result) & sign_bit(bits) != 0);
    (result, update)
}

/// `lhs - rhs - borrow` truncated to `bits`.
#[must_use]
pub fn sub(lhs: u64, rhs: u64, borrow: bool, bits: u8) -> (u64, FlagsUpdate) {
    let mask = width_mask(bits);
    let (lhs, rhs) = (lhs & mask, rhs & mask);
    let result = lhs.wrapping_sub(rhs).wrapping_sub(u64::from(borrow)) & mask;
    let update = FlagsUpdate::new(FLAGS_STATUS_MASK, result_flags(result, bits))
        .with(FLAG_CF, u128::from(lhs) < u128::from(rhs) + u128::from(borrow))
        .with(FLAG_AF, (lhs ^ rhs ^ result) & 0x10 != 0)
        .with(FLAG_OF, (lhs ^ rhs) & (lhs ^ result) & sign_bit(bits) != 0);
    (result, update)
}

/// Flags of AND/OR/XOR/TEST: CF and OF cleared.
#[must_use]
pub const fn logic(result: u64, bits: u8) -> FlagsUpdate {
    FlagsUpdate::new(FLAGS_STATUS_MASK, result_flags(result, bits))
}

/// `value + 1`; CF is preserved.
#[must_use]
pub fn inc(value: u64, bits: u8) -> (u64, FlagsUpdate) {
    let (result, update) = add(value, 1, false, bits);
    (result, update.without(FLAG_CF))
}

/// `value - 1`; CF is preserved.
#[must_use]
pub fn dec(value: u64, bits: u8) -> (u64, FlagsUpdate) {
    let (result, update) = sub(value, 1, false, bits);
    (result, update.without(FLAG_CF))
}

/// Two's complement negation; CF is set unless `value` is zero.
#[must_use]
pub fn neg(value: u64, bits: u8) -> (u64, FlagsUpdate) {
    sub(0, value, false, bits)
}

#[cfg(test)]
mod tests {
    use super::{add, dec, inc, logic, neg, result_flags, sub, FlagsUpdate};
    use crate::state::{FLAG_AF, FLAG_CF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF};
    use proptest::prelude::*;
    use rstest::rstest;

    fn has(update: FlagsUpdate, flag: u64) -> bool {
        update.status & flag != 0
    }

    #[rstest]
    #[case(0x7F, 1, 8, 0x80, false, true)]
    #[case(0xFF, 1, 8, 0x00, true, false)]
    #[case(0x7FFF_FFFF, 1, 32, 0x8000_0000, false, true)]
    #[case(u64::MAX, 1, 64, 0, true, false)]
    #[case(0x1234, 0x1111, 16, 0x2345, false, false)]
    fn add_sets_carry_and_overflow(
        #[case] lhs: u64,
        #[case] rhs: u64,
        #[case] bits: u8,
        #[case] expected: u64,
        #[case] cf: bool,
        #[case] of: bool,
    ) {
        let (result, update) = add(lhs, rhs, false, bits);
        assert_eq!(result, expected);
        assert_eq!(has(update, FLAG_CF), cf);
        assert_eq!(has(update, FLAG_OF), of);
    }

    #[rstest]
    #[case(0, 1, 8, 0xFF, true, false)]
    #[case(0x80, 1, 8, 0x7F, false, true)]
    #[case(5, 5, 32, 0, false, false)]
    fn sub_sets_borrow_and_overflow(
        #[case] lhs: u64,
        #[case] rhs: u64,
        #[case] bits: u8,
        #[case] expected: u64,
        #[case] cf: bool,
        #[case] of: bool,
    ) {
        let (result, update) = sub(lhs, rhs, false, bits);
        assert_eq!(result, expected);
        assert_eq!(has(update, FLAG_CF), cf);
        assert_eq!(has(update, FLAG_OF), of);
    }

    #[test]
    fn inc_and_dec_leave_carry_untouched() {
        let (result, update) = inc(0x1234, 32);
        assert_eq!(result, 0x1235);
        assert_eq!(update.mask & FLAG_CF, 0);
        let (result, update) = dec(0x7890, 32);
        assert_eq!(result, 0x788F);
        assert_eq!(update.mask & FLAG_CF, 0);
        assert_eq!(has(update, FLAG_PF), 0x8Fu8.count_ones() % 2 == 0);
    }

    #[test]
    fn nibble_carry_sets_af() {
        let (_, update) = add(0x0F, 1, false, 8);
        assert!(has(update, FLAG_AF));
        let (_, update) = sub(0x10, 1, false, 8);
        assert!(has(update, FLAG_AF));
    }

    #[test]
    fn neg_sets_carry_for_nonzero() {
        let (result, update) = neg(1, 16);
        assert_eq!(result, 0xFFFF);
        assert!(has(update, FLAG_CF));
        assert!(has(update, FLAG_SF));
        let (_, update) = neg(0, 16);
        assert!(!has(update, FLAG_CF));
        assert!(has(update, FLAG_ZF));
    }

    #[test]
    fn logic_clears_carry_and_overflow() {
        let update = logic(0, 32);
        assert!(has(update, FLAG_ZF));
        assert!(!has(update, FLAG_CF));
        assert!(!has(update, FLAG_OF));
        assert_ne!(update.mask & FLAG_CF, 0);
    }

    proptest! {
        #[test]
        fn add_matches_wide_arithmetic(lhs in any::<u32>(), rhs in any::<u32>()) {
            let (result, update) = add(u64::from(lhs), u64::from(rhs), false, 32);
            let wide = u64::from(lhs) + u64::from(rhs);
            prop_assert_eq!(result, wide & 0xFFFF_FFFF);
            prop_assert_eq!(has(update, FLAG_CF), wide > 0xFFFF_FFFF);
            prop_assert_eq!(
                has(update, FLAG_OF),
                i64::from(lhs as i32) + i64::from(rhs as i32) != i64::from(result as u32 as i32)
            );
        }

        #[test]
        fn sub_then_add_restores_value(lhs in any::<u16>(), rhs in any::<u16>()) {
            let (diff, _) = sub(u64::from(lhs), u64::from(rhs), false, 16);
            let (sum, _) = add(diff, u64::from(rhs), false, 16);
            prop_assert_eq!(sum, u64::from(lhs));
        }

        #[test]
        fn zero_flag_tracks_result(value in any::<u64>(), bits in prop::sample::select(vec![8u8, 16, 32, 64])) {
            let flags = result_flags(value, bits);
            let masked = value & crate::state::width_mask(bits);
            prop_assert_eq!(flags & FLAG_ZF != 0, masked == 0);
        }
    }
}
