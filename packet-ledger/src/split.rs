//! Share sizing
//!
//! Two policies:
//!
//! - **Equal**: `floor(remain / count)`, the last share takes everything left
//! - **Double-average**: uniform in `[1, min(remain - (count - 1), floor(2 * remain / count) - 1)]`,
//!   upper bound floored at 1, the last share takes everything left
//!
//! Both keep `remain >= count` after every draw, so each unclaimed share can
//! still receive at least one unit.

use crate::{random::RandomSource, types::Money, Error, Result};

/// Equal split share
pub fn equal_share(remain_amount: Money, remain_count: u32) -> Result<Money> {
    match remain_count {
        0 => Err(Error::ArithmeticOverflow),
        1 => Ok(remain_amount),
        n => remain_amount
            .checked_div_count(n)
            .ok_or(Error::ArithmeticOverflow),
    }
}

/// Inclusive bounds of a double-average draw for `remain_count >= 2`
pub fn random_bounds(remain_amount: Money, remain_count: u32) -> Result<(Money, Money)> {
    if remain_count < 2 {
        return Err(Error::ArithmeticOverflow);
    }

    let remain = remain_amount.units();
    let count = u128::from(remain_count);

    // Units that must stay behind for the other shares
    let reserve_cap = remain
        .checked_sub(count - 1)
        .ok_or(Error::ArithmeticOverflow)?;

    // floor(2 * remain / count) without overflowing 2 * remain
    let double_average = (remain / count) * 2 + (remain % count) * 2 / count;
    let average_cap = double_average.saturating_sub(1);

    let upper = reserve_cap.min(average_cap).max(1);
    Ok((Money::ONE, Money::new(upper)))
}

/// Size the next share of a packet
pub fn next_share(
    remain_amount: Money,
    remain_count: u32,
    is_random: bool,
    random: &dyn RandomSource,
    seed: &[u8; 32],
) -> Result<Money> {
    if !is_random || remain_count <= 1 {
        return equal_share(remain_amount, remain_count);
    }

    let (low, high) = random_bounds(remain_amount, remain_count)?;
    let drawn = random.draw(seed, low.units(), high.units());

    // Reject a misbehaving source rather than break the reserve
    if drawn < low.units() || drawn > high.units() {
        return Err(Error::InvariantViolation(format!(
            "random source returned {} outside [{}, {}]",
            drawn, low, high
        )));
    }

    Ok(Money::new(drawn))
}
