use std::env;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

fn get_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn get_env_bool(key: &str, default: bool) -> bool {
    match get_env(key) {
        None => default,
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"),
    }
}

fn get_env_f64(key: &str, default: f64) -> Result<f64> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => Ok(v
            .parse::<f64>()
            .map_err(|e| anyhow!("{key} invalid float: {e}"))?),
    }
}

fn get_env_i64(key: &str, default: i64) -> Result<i64> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => Ok(v
            .parse::<i64>()
            .map_err(|e| anyhow!("{key} invalid int: {e}"))?),
    }
}

fn get_env_u64(key: &str, default: u64) -> Result<u64> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => Ok(v
            .parse::<u64>()
            .map_err(|e| anyhow!("{key} invalid int: {e}"))?),
    }
}

fn get_env_usize(key: &str, default: usize) -> Result<usize> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => Ok(v
            .parse::<usize>()
            .map_err(|e| anyhow!("{key} invalid int: {e}"))?),
    }
}

fn get_env_string(key: &str, default: &str) -> String {
    get_env(key).unwrap_or_else(|| default.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Network / storage
    pub bind_addr: String,
    pub db_path: String,
    pub buy_queue_path: String,
    pub price_feed_base_url: String,
    pub price_feed_wiki_base_url: String,
    pub price_feed_timeout_seconds: u64,

    // PriceCache / TrendCache (§4.1, §4.2)
    pub refresh_seconds: u64,
    pub trend_cache_ttl_seconds: u64,
    pub enable_trends: bool,
    pub trend_recheck_top_n: usize,

    // Suggestion engine tiers & thresholds (§4.6)
    pub target_fill_minutes: i64,
    pub stale_offer_seconds: i64,
    pub stuck_buy_abort_seconds: i64,
    pub fast_sell_target_minutes: f64,
    pub min_roi: f64,
    pub max_roi: f64,
    pub min_margin_gp: i64,
    pub min_buy_price: i64,
    pub min_daily_volume: i64,
    pub max_daily_volume: i64,
    pub max_cash_fraction: f64,
    pub buy_budget_cap: i64,
    pub auto_sell_unknown_basis: bool,

    // Recommendation tracker (§4.5)
    pub buy_rec_timeout_seconds: i64,
    pub abort_cooldown_seconds: i64,

    // Monetary (§4.8)
    pub seller_tax_rate: f64,
    pub seller_tax_cap: i64,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let s = Self {
            bind_addr: get_env_string("BIND_ADDR", "127.0.0.1:5000"),
            db_path: get_env_string("DB_PATH", "./data/copilot.sqlite"),
            buy_queue_path: get_env_string("BUY_QUEUE_PATH", "./data/buy_queue.json"),
            price_feed_base_url: get_env_string(
                "PRICE_FEED_BASE_URL",
                "https://prices.runescape.wiki/api/v1/osrs",
            ),
            price_feed_wiki_base_url: get_env_string(
                "PRICE_FEED_WIKI_BASE_URL",
                "https://prices.runescape.wiki/api/v1/osrs/mapping",
            ),
            price_feed_timeout_seconds: get_env_u64("PRICE_FEED_TIMEOUT_SECONDS", 12)?,
            refresh_seconds: get_env_u64("REFRESH_SECONDS", 60)?,
            trend_cache_ttl_seconds: get_env_u64("TREND_CACHE_TTL_SECONDS", 180)?,
            enable_trends: get_env_bool("ENABLE_TRENDS", true),
            trend_recheck_top_n: get_env_usize("TREND_RECHECK_TOP_N", 20)?,
            target_fill_minutes: get_env_i64("TARGET_FILL_MINUTES", 15)?,
            stale_offer_seconds: get_env_i64("STALE_OFFER_SECONDS", 600)?,
            stuck_buy_abort_seconds: get_env_i64("STUCK_BUY_ABORT_SECONDS", 1200)?,
            fast_sell_target_minutes: get_env_f64("FAST_SELL_TARGET_MINUTES", 2.0)?,
            min_roi: get_env_f64("MIN_ROI", 0.0005)?,
            max_roi: get_env_f64("MAX_ROI", 0.40)?,
            min_margin_gp: get_env_i64("MIN_MARGIN_GP", 1)?,
            min_buy_price: get_env_i64("MIN_BUY_PRICE", 1)?,
            min_daily_volume: get_env_i64("MIN_DAILY_VOLUME", 100_000)?,
            max_daily_volume: get_env_i64("MAX_DAILY_VOLUME", 1_000_000_000)?,
            max_cash_fraction: get_env_f64("MAX_CASH_FRACTION", 0.90)?,
            buy_budget_cap: get_env_i64("BUY_BUDGET_CAP", 10_000_000)?,
            auto_sell_unknown_basis: get_env_bool("AUTO_SELL_UNKNOWN_BASIS", true),
            buy_rec_timeout_seconds: get_env_i64("BUY_REC_TIMEOUT_SECONDS", 1200)?,
            abort_cooldown_seconds: get_env_i64("ABORT_COOLDOWN_SECONDS", 120)?,
            seller_tax_rate: get_env_f64("SELLER_TAX_RATE", 0.02)?,
            seller_tax_cap: get_env_i64("SELLER_TAX_CAP", 5_000_000)?,
        };
        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_roi > self.max_roi {
            return Err(anyhow!(
                "MIN_ROI must be <= MAX_ROI (min_roi={} max_roi={})",
                self.min_roi,
                self.max_roi
            ));
        }
        if self.min_daily_volume > self.max_daily_volume {
            return Err(anyhow!(
                "MIN_DAILY_VOLUME must be <= MAX_DAILY_VOLUME (min={} max={})",
                self.min_daily_volume,
                self.max_daily_volume
            ));
        }
        if self.refresh_seconds < 1 {
            return Err(anyhow!("REFRESH_SECONDS must be >= 1"));
        }
        if self.trend_cache_ttl_seconds < 1 {
            return Err(anyhow!("TREND_CACHE_TTL_SECONDS must be >= 1"));
        }
        if !(0.0..1.0).contains(&self.seller_tax_rate) {
            return Err(anyhow!(
                "SELLER_TAX_RATE must be in [0,1) (got {})",
                self.seller_tax_rate
            ));
        }
        if self.seller_tax_cap < 0 {
            return Err(anyhow!("SELLER_TAX_CAP must be >= 0"));
        }
        if !(0.0..=1.0).contains(&self.max_cash_fraction) {
            return Err(anyhow!(
                "MAX_CASH_FRACTION must be in [0,1] (got {})",
                self.max_cash_fraction
            ));
        }
        if self.buy_budget_cap < 0 {
            return Err(anyhow!("BUY_BUDGET_CAP must be >= 0"));
        }
        if self.target_fill_minutes < 1 || self.target_fill_minutes > 24 * 60 {
            return Err(anyhow!("TARGET_FILL_MINUTES must be in [1, 1440]"));
        }
        Ok(())
    }

    /// Fixed, locally-consistent settings for use by other modules' inline
    /// tests. Not reachable from non-test builds.
    #[cfg(test)]
    pub fn load_for_test() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".into(),
            db_path: ":memory:".into(),
            buy_queue_path: "./buy_queue.json".into(),
            price_feed_base_url: "http://localhost".into(),
            price_feed_wiki_base_url: "http://localhost".into(),
            price_feed_timeout_seconds: 12,
            refresh_seconds: 60,
            trend_cache_ttl_seconds: 180,
            enable_trends: true,
            trend_recheck_top_n: 20,
            target_fill_minutes: 15,
            stale_offer_seconds: 600,
            stuck_buy_abort_seconds: 1200,
            fast_sell_target_minutes: 2.0,
            min_roi: 0.0005,
            max_roi: 0.40,
            min_margin_gp: 1,
            min_buy_price: 1,
            min_daily_volume: 100_000,
            max_daily_volume: 1_000_000_000,
            max_cash_fraction: 0.9,
            buy_budget_cap: 10_000_000,
            auto_sell_unknown_basis: true,
            buy_rec_timeout_seconds: 1200,
            abort_cooldown_seconds: 120,
            seller_tax_rate: 0.02,
            seller_tax_cap: 5_000_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inverted_roi_bounds() {
        let mut s = Settings::load_for_test();
        s.min_roi = 0.5;
        s.max_roi = 0.1;
        assert!(s.validate().is_err());
    }

    #[test]
    fn accepts_defaults() {
        assert!(Settings::load_for_test().validate().is_ok());
    }
}
