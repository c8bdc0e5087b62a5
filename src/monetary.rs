//! Shared pricing/tax helpers used by both the suggestion engine and the
//! profit-tracking ledger. See design notes on why two tax functions coexist.

use std::collections::HashSet;
use std::sync::LazyLock;

/// Items exempt from GE sale tax, mirroring the client plugin's own table.
pub static GE_TAX_EXEMPT_ITEMS: LazyLock<HashSet<i64>> = LazyLock::new(|| {
    [
        8011, 365, 2309, 882, 806, 1891, 8010, 1755, 28824, 2140, 2142, 8009, 5325, 1785, 2347,
        347, 884, 807, 28790, 379, 8008, 355, 2327, 558, 1733, 13190, 233, 351, 5341, 2552, 329,
        8794, 5329, 5343, 1735, 315, 952, 886, 808, 8013, 361, 8007, 5331,
    ]
    .into_iter()
    .collect()
});

pub const MAX_PRICE_FOR_GE_TAX: i64 = 250_000_000;
pub const GE_TAX_CAP: i64 = 5_000_000;

/// Tax used for engine-side scoring and profit displays. Rate/cap are
/// configurable; the 5M-gp cap here is a *default*, not the hard GE cap.
pub fn seller_tax(price: i64, rate: f64, cap: i64) -> i64 {
    if price <= 0 {
        return 0;
    }
    let tax = (price as f64 * rate).floor() as i64;
    tax.min(cap).max(0)
}

/// Tax used for settled proceeds in the profit-tracking ledger. Exempt items
/// and the hard 250M-gp / 5M-gp GE cap are non-configurable game rules.
pub fn ge_post_tax_price(item_id: i64, price: i64, rate: f64) -> i64 {
    if price <= 0 || GE_TAX_EXEMPT_ITEMS.contains(&item_id) {
        return price;
    }
    if price >= MAX_PRICE_FOR_GE_TAX {
        return (price - GE_TAX_CAP).max(0);
    }
    let tax = (price as f64 * rate).floor() as i64;
    (price - tax).max(0)
}

pub fn ge_tax_per_unit(item_id: i64, price: i64, rate: f64) -> i64 {
    price - ge_post_tax_price(item_id, price, rate)
}

/// Smallest integer `p >= ceil((avg_buy+1)/0.98)` such that
/// `p - avg_buy - seller_tax(p) >= 1`.
pub fn min_profitable_sell_price(avg_buy: i64, rate: f64, cap: i64) -> i64 {
    let guess = (((avg_buy + 1) as f64) / 0.98).ceil() as i64;
    let lo = (guess - 30).max(1);
    let hi = guess + 500;
    for p in lo..=hi {
        if p - avg_buy - seller_tax(p, rate, cap) >= 1 {
            return p;
        }
    }
    hi
}

const ESTIMATE_MINUTES_SENTINEL: f64 = 1_000_000.0;

pub fn estimate_minutes_from_daily(qty: i64, daily_vol: Option<i64>) -> f64 {
    match daily_vol {
        Some(v) if v > 0 => qty as f64 / (v as f64 / 1440.0).max(1e-6),
        _ => ESTIMATE_MINUTES_SENTINEL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seller_tax_boundaries() {
        assert_eq!(seller_tax(0, 0.02, 5_000_000), 0);
        assert_eq!(seller_tax(-5, 0.02, 5_000_000), 0);
        assert_eq!(seller_tax(110, 0.02, 5_000_000), 2);
        // monotone non-decreasing
        let mut prev = 0;
        for p in (0..10_000).step_by(37) {
            let t = seller_tax(p, 0.02, 5_000_000);
            assert!(t >= prev);
            prev = t;
        }
        // capped
        assert_eq!(seller_tax(10_000_000_000, 0.02, 5_000_000), 5_000_000);
    }

    #[test]
    fn ge_post_tax_price_boundaries() {
        assert_eq!(ge_post_tax_price(1, 250_000_000, 0.02), 245_000_000);
        assert_eq!(ge_post_tax_price(1, 300_000_000, 0.02), 295_000_000);
        // exempt item
        assert_eq!(ge_post_tax_price(8011, 300_000_000, 0.02), 300_000_000);
        assert_eq!(ge_post_tax_price(1, 0, 0.02), 0);
    }

    #[test]
    fn min_profitable_sell_price_example() {
        assert_eq!(min_profitable_sell_price(100, 0.02, 5_000_000), 104);
    }

    #[test]
    fn estimate_minutes_sentinel_on_missing_volume() {
        assert_eq!(estimate_minutes_from_daily(10, None), ESTIMATE_MINUTES_SENTINEL);
        assert_eq!(estimate_minutes_from_daily(10, Some(0)), ESTIMATE_MINUTES_SENTINEL);
    }

    #[test]
    fn estimate_minutes_example() {
        let mins = estimate_minutes_from_daily(60, Some(500_000));
        assert!((mins - 0.1728).abs() < 1e-3);
    }
}
