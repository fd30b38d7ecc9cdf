//! Standard mixing denominations and their bitmask encoding.
//!
//! Bit `i` of a mask stands for `STANDARD_DENOMINATIONS[i]`, largest first,
//! so `1000.01` is bit 0 and `0.100001` is bit 4. Two output sets can be
//! mixed together only if their masks are equal.
//!
//! ```
//! use mixnode::mix::denom::{denominations_to_string, mask_of_amounts, STANDARD_DENOMINATIONS};
//!
//! let mask = mask_of_amounts(&[STANDARD_DENOMINATIONS[0], STANDARD_DENOMINATIONS[2]]);
//! assert_eq!(mask, 0b00101);
//! assert_eq!(denominations_to_string(mask), "1000.01+10.0001");
//! ```

use rand::Rng;

use crate::core::types::{format_money, Amount, TxOut, COIN};

/// The five mixable amounts, largest first.
pub const STANDARD_DENOMINATIONS: [Amount; 5] = [
    1000 * COIN + 1_000_000,
    100 * COIN + 100_000,
    10 * COIN + 10_000,
    COIN + 1_000,
    COIN / 10 + 100,
];

/// Default fee a collateral transaction must pay; kept below the smallest
/// denomination.
pub const COLLATERAL_AMOUNT: Amount = COIN / 100;

/// Per-denomination cap when splitting an amount.
pub const MAX_OUTPUTS_PER_DENOMINATION: usize = 10;

/// Every bit that maps to a standard denomination.
pub const ALL_DENOMINATIONS_MASK: u32 = (1 << STANDARD_DENOMINATIONS.len()) - 1;

pub fn is_denominated_amount(amount: Amount) -> bool {
    STANDARD_DENOMINATIONS.contains(&amount)
}

/// Bit index of a standard denomination.
pub fn denomination_bit(amount: Amount) -> Option<usize> {
    STANDARD_DENOMINATIONS.iter().position(|d| *d == amount)
}

/// Encode a set of amounts. Returns 0 if the set is empty or any amount is
/// not a standard denomination.
pub fn mask_of_amounts(amounts: &[Amount]) -> u32 {
    let mut mask = 0u32;
    for amount in amounts {
        match denomination_bit(*amount) {
            Some(bit) => mask |= 1 << bit,
            None => return 0,
        }
    }
    mask
}

/// Encode the values of an output set.
pub fn denominations_mask(outputs: &[TxOut]) -> u32 {
    let amounts: Vec<Amount> = outputs.iter().map(|o| o.value).collect();
    mask_of_amounts(&amounts)
}

/// Pick one denomination out of those present in `amounts`.
///
/// Each present denomination is kept with probability one half, walking
/// from largest to smallest; the first kept one wins. May return 0, in
/// which case callers simply roll again.
pub fn single_random_denomination<R: Rng + ?Sized>(amounts: &[Amount], rng: &mut R) -> u32 {
    let present = mask_of_amounts(amounts);
    for bit in 0..STANDARD_DENOMINATIONS.len() {
        if present & (1 << bit) != 0 && rng.gen_bool(0.5) {
            return 1 << bit;
        }
    }
    0
}

/// Denominations named by `mask`, largest first.
pub fn decode_mask(mask: u32) -> Vec<Amount> {
    STANDARD_DENOMINATIONS
        .iter()
        .enumerate()
        .filter(|(bit, _)| mask & (1 << bit) != 0)
        .map(|(_, d)| *d)
        .collect()
}

/// Human-readable form of a mask, e.g. `"100.001+1.00001"`.
pub fn denominations_to_string(mask: u32) -> String {
    if mask > ALL_DENOMINATIONS_MASK {
        return "out-of-bounds".into();
    }
    let parts: Vec<String> = decode_mask(mask).into_iter().map(format_money).collect();
    if parts.is_empty() {
        "non-denom".into()
    } else {
        parts.join("+")
    }
}

/// Split `amount` into standard denominations, largest first, using at most
/// [`MAX_OUTPUTS_PER_DENOMINATION`] of each. A non-zero `target_mask`
/// restricts which denominations may be used. Whatever remains below the
/// smallest usable denomination is left over.
pub fn split_amount(amount: Amount, target_mask: u32) -> Vec<Amount> {
    let allowed: Vec<Amount> = STANDARD_DENOMINATIONS
        .iter()
        .enumerate()
        .filter(|(bit, _)| target_mask == 0 || target_mask & (1 << bit) != 0)
        .map(|(_, d)| *d)
        .collect();
    let Some(smallest) = allowed.last().copied() else {
        return Vec::new();
    };

    let mut remaining = amount;
    let mut outputs = Vec::new();
    for denom in allowed {
        if remaining < smallest {
            break;
        }
        let mut count = 0;
        while remaining >= denom && count < MAX_OUTPUTS_PER_DENOMINATION {
            outputs.push(denom);
            remaining -= denom;
            count += 1;
        }
    }
    outputs
}

/// Mask of the outputs [`split_amount`] would create.
pub fn denominations_by_amount(amount: Amount, target_mask: u32) -> u32 {
    mask_of_amounts(&split_amount(amount, target_mask))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::script::Script;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn out(value: Amount) -> TxOut {
        TxOut::new(value, Script::p2pkh(&[0u8; 20]))
    }

    const D1000: Amount = STANDARD_DENOMINATIONS[0];
    const D100: Amount = STANDARD_DENOMINATIONS[1];
    const D10: Amount = STANDARD_DENOMINATIONS[2];
    const D1: Amount = STANDARD_DENOMINATIONS[3];
    const D01: Amount = STANDARD_DENOMINATIONS[4];

    // ── Encode ──────────────────────────────────────────────────────────

    #[test]
    fn encodes_example_set() {
        assert_eq!(denominations_mask(&[out(D1000), out(D10)]), 0b00101);
    }

    #[test]
    fn repeated_denominations_set_one_bit() {
        assert_eq!(denominations_mask(&[out(D1), out(D1), out(D1)]), 0b01000);
    }

    #[test]
    fn non_standard_amount_encodes_to_zero() {
        assert_eq!(denominations_mask(&[out(500)]), 0);
        assert_eq!(denominations_mask(&[out(D1000), out(500)]), 0);
        assert_eq!(denominations_mask(&[out(1000 * COIN)]), 0);
    }

    #[test]
    fn empty_set_encodes_to_zero() {
        assert_eq!(denominations_mask(&[]), 0);
    }

    // ── Decode ──────────────────────────────────────────────────────────

    #[test]
    fn decode_enumerates_exactly_present_denominations() {
        let sets: [&[Amount]; 4] = [&[D1000, D10], &[D01], &[D100, D1, D1, D01], &STANDARD_DENOMINATIONS];
        for set in sets {
            let mut expected: Vec<Amount> = set.to_vec();
            expected.sort_unstable_by(|a, b| b.cmp(a));
            expected.dedup();
            assert_eq!(decode_mask(mask_of_amounts(set)), expected);
        }
    }

    #[test]
    fn display_strings() {
        assert_eq!(denominations_to_string(0b00101), "1000.01+10.0001");
        assert_eq!(denominations_to_string(0b10000), "0.100001");
        assert_eq!(denominations_to_string(0), "non-denom");
        assert_eq!(denominations_to_string(1 << 5), "out-of-bounds");
    }

    // ── Split ───────────────────────────────────────────────────────────

    #[test]
    fn split_largest_first() {
        let outs = split_amount(D100 + 2 * D1 + D01 + 5, 0);
        assert_eq!(outs, vec![D100, D1, D1, D01]);
    }

    #[test]
    fn split_caps_each_denomination_at_ten() {
        let outs = split_amount(15 * D10, 0b00100);
        assert_eq!(outs.len(), 10);
        assert!(outs.iter().all(|v| *v == D10));
    }

    #[test]
    fn split_honours_mask() {
        let outs = split_amount(D100 + D10, 0b01000);
        assert_eq!(outs, vec![D1; 10]);
        assert_eq!(denominations_by_amount(D100 + D10, 0b01000), 0b01000);
    }

    #[test]
    fn split_below_smallest_is_empty() {
        assert!(split_amount(D01 - 1, 0).is_empty());
    }

    // ── Random single denomination ──────────────────────────────────────

    #[test]
    fn single_random_picks_a_present_bit() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let amounts = [D100, D1, D01];
        let present = mask_of_amounts(&amounts);
        for _ in 0..50 {
            let m = single_random_denomination(&amounts, &mut rng);
            assert!(m == 0 || (m.count_ones() == 1 && m & present == m));
        }
    }
}
