//! Shift, rotate, multiply and divide semantics.

use super::flags::{result_flags, sign_bit, FlagsUpdate};
use crate::state::{width_mask, FLAG_AF, FLAG_CF, FLAG_OF, FLAGS_STATUS_MASK};

/// Shift and rotate operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    /// `SHL`/`SAL`.
    Shl,
    /// `SHR`.
    Shr,
    /// `SAR`.
    Sar,
    /// `ROL`.
    Rol,
    /// `ROR`.
    Ror,
}

/// Sign-extends the low `bits` of `value` to 64 bits.
#[must_use]
pub const fn sign_extend(value: u64, bits: u8) -> i64 {
    let shift = 64 - bits as u32;
    ((value << shift) as i64) >> shift
}

/// Applies a shift or rotate. A masked count of zero changes nothing.
///
/// OF is computed for every non-zero count using the single-bit rule.
#[must_use]
pub fn shift(op: ShiftOp, value: u64, count: u64, bits: u8) -> (u64, FlagsUpdate) {
    let mask = width_mask(bits);
    let value = value & mask;
    let count = (count & if bits == 64 { 0x3F } else { 0x1F }) as u32;
    if count == 0 {
        return (value, FlagsUpdate::NONE);
    }
    let width = u32::from(bits);
    let msb = |v: u64| v & sign_bit(bits) != 0;

    match op {
        ShiftOp::Shl => {
            let wide = u128::from(value) << count;
            let result = (wide as u64) & mask;
            let cf = (wide >> width) & 1 != 0;
            let update = FlagsUpdate::new(FLAGS_STATUS_MASK, result_flags(result, bits))
                .with(FLAG_CF, cf)
                .with(FLAG_OF, msb(result) ^ cf)
                .with(FLAG_AF, false);
            (result, update)
        }
        ShiftOp::Shr => {
            let result = if count >= width { 0 } else { value >> count };
            let cf = count <= width && (value >> (count - 1)) & 1 != 0;
            let update = FlagsUpdate::new(FLAGS_STATUS_MASK, result_flags(result, bits))
                .with(FLAG_CF, cf)
                .with(FLAG_OF, msb(value))
                .with(FLAG_AF, false);
            (result, update)
        }
        ShiftOp::Sar => {
            let signed = sign_extend(value, bits);
            let result = (signed >> count.min(63)) as u64 & mask;
            let cf = (signed >> (count - 1).min(63)) & 1 != 0;
            let update = FlagsUpdate::new(FLAGS_STATUS_MASK, result_flags(result, bits))
                .with(FLAG_CF, cf)
                .with(FLAG_OF, false)
                .with(FLAG_AF, false);
            (result, update)
        }
        ShiftOp::Rol => {
            let rot = count % width;
            let result = if rot == 0 {
                value
            } else {
                ((value << rot) | (value >> (width - rot))) & mask
            };
            let cf = result & 1 != 0;
            let update = FlagsUpdate::NONE
                .with(FLAG_CF, cf)
                .with(FLAG_OF, msb(result) ^ cf);
            (result, update)
        }
        ShiftOp::Ror => {
            let rot = count % width;
            let result = if rot == 0 {
                value
            } else {
                ((value >> rot) | (value << (width - rot))) & mask
            };
            let cf = msb(result);
            let next = result & (sign_bit(bits) >> 1) != 0;
            let update = FlagsUpdate::NONE.with(FLAG_CF, cf).with(FLAG_OF, cf ^ next);
            (result, update)
        }
    }
}

/// Double-width product split into `(low, high)` halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Product {
    /// Low half.
    pub low: u64,
    /// High half.
    pub high: u64,
    /// CF/OF: set when the high half carries significant bits.
    pub flags: FlagsUpdate,
}

/// Unsigned `lhs * rhs` at `bits` width.
#[must_use]
pub fn mul(lhs: u64, rhs: u64, bits: u8) -> Product {
    let mask = width_mask(bits);
    let wide = u128::from(lhs & mask) * u128::from(rhs & mask);
    let low = (wide as u64) & mask;
    let high = ((wide >> bits) as u64) & mask;
    let overflow = high != 0;
    Product {
        low,
        high,
        flags: FlagsUpdate::NONE
            .with(FLAG_CF, overflow)
            .with(FLAG_OF, overflow),
    }
}

/// Signed `lhs * rhs` at `bits` width.
#[must_use]
pub fn imul(lhs: u64, rhs: u64, bits: u8) -> Product {
    let mask = width_mask(bits);
    let wide = i128::from(sign_extend(lhs, bits)) * i128::from(sign_extend(rhs, bits));
    let low = (wide as u64) & mask;
    let high = ((wide >> bits) as u64) & mask;
    let overflow = i128::from(sign_extend(low, bits)) != wide;
    Product {
        low,
        high,
        flags: FlagsUpdate::NONE
            .with(FLAG_CF, overflow)
            .with(FLAG_OF, overflow),
    }
}

/// Quotient and remainder of a division, or `None` on a divide error.
#[must_use]
pub fn div(high: u64, low: u64, divisor: u64, bits: u8) -> Option<(u64, u64)> {
    let mask = width_mask(bits);
    let divisor = u128::from(divisor & mask);
    if divisor == 0 {
        return None;
    }
    let dividend = (u128::from(high & mask) << bits) | u128::from(low & mask);
    let quotient = dividend / divisor;
    if quotient > u128::from(mask) {
        return None;
    }
    Some((quotient as u64, (dividend % divisor) as u64))
}

/// Signed division; `None` on a zero divisor or quotient overflow.
#[must_use]
pub fn idiv(high: u64, low: u64, divisor: u64, bits: u8) -> Option<(u64, u64)> {
    let mask = width_mask(bits);
    let divisor = i128::from(sign_extend(divisor, bits));
    if divisor == 0 {
        return None;
    }
    let raw = (u128::from(high & mask) << bits) | u128::from(low & mask);
    let shift = 128 - 2 * u32::from(bits);
    let dividend = ((raw << shift) as i128) >> shift;
    let quotient = dividend.checked_div(divisor)?;
    let remainder = dividend.checked_rem(divisor)?;
    let min = -(1i128 << (bits - 1));
    let max = (1i128 << (bits - 1)) - 1;
    if quotient < min || quotient > max {
        return None;
    }
    Some(((quotient as u64) & mask, (remainder as u64) & mask))
}
