//! TTL-bounded trend cache (§4.2): `trend(item_id, horizon_minutes)` computed
//! on demand from a 5-minute timeseries feed, clamped to ±0.25.

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::utils::{clamp, now_ts};

#[derive(Deserialize)]
struct TimeseriesPoint {
    #[serde(rename = "avgHighPrice")]
    avg_high_price: Option<f64>,
    #[serde(rename = "avgLowPrice")]
    avg_low_price: Option<f64>,
}

#[derive(Deserialize)]
struct TimeseriesResponse {
    data: Vec<TimeseriesPoint>,
}

#[derive(Clone, Copy)]
struct Entry {
    value: f64,
    fetched_ts: i64,
}

pub struct TrendCache {
    base_url: String,
    ttl_seconds: i64,
    entries: Arc<Mutex<HashMap<(i64, i64), Entry>>>,
    client: reqwest::Client,
}

fn midpoint(p: &TimeseriesPoint) -> Option<f64> {
    match (p.avg_high_price, p.avg_low_price) {
        (Some(h), Some(l)) if h > 0.0 && l > 0.0 => Some((h + l) / 2.0),
        (Some(h), _) if h > 0.0 => Some(h),
        (_, Some(l)) if l > 0.0 => Some(l),
        _ => None,
    }
}

impl TrendCache {
    pub fn new(base_url: String, ttl_seconds: i64, timeout_seconds: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_seconds))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url,
            ttl_seconds,
            entries: Arc::new(Mutex::new(HashMap::new())),
            client,
        }
    }

    pub async fn trend(&self, item_id: i64, horizon_minutes: i64) -> f64 {
        let now = now_ts();
        {
            let g = self.entries.lock();
            if let Some(e) = g.get(&(item_id, horizon_minutes)) {
                if now - e.fetched_ts <= self.ttl_seconds {
                    return e.value;
                }
            }
        }

        let value = match self.fetch_trend(item_id, horizon_minutes).await {
            Ok(v) => v,
            Err(e) => {
                warn!("trend_cache: fetch failed for item {item_id}: {e}");
                return 0.0;
            }
        };

        self.entries
            .lock()
            .insert((item_id, horizon_minutes), Entry { value, fetched_ts: now });
        value
    }

    async fn fetch_trend(&self, item_id: i64, horizon_minutes: i64) -> anyhow::Result<f64> {
        let url = format!("{}/timeseries?id={}&timestep=5m", self.base_url, item_id);
        let resp: TimeseriesResponse = self.client.get(url).send().await?.error_for_status()?.json().await?;

        let n_points = ((horizon_minutes / 5) + 1).max(2) as usize;
        let points = &resp.data;
        if points.is_empty() {
            return Ok(0.0);
        }
        let take_n = n_points.min(points.len());
        let window = &points[points.len() - take_n..];

        let first = window.first().and_then(midpoint);
        let last = window.last().and_then(midpoint);

        let (first, last) = match (first, last) {
            (Some(f), Some(l)) if f != 0.0 => (f, l),
            _ => return Ok(0.0),
        };

        let trend = (last - first) / first;
        Ok(clamp(trend, -0.25, 0.25))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midpoint_one_sided_fallback() {
        let p = TimeseriesPoint {
            avg_high_price: Some(100.0),
            avg_low_price: None,
        };
        assert_eq!(midpoint(&p), Some(100.0));
        let p = TimeseriesPoint {
            avg_high_price: None,
            avg_low_price: Some(80.0),
        };
        assert_eq!(midpoint(&p), Some(80.0));
        let p = TimeseriesPoint {
            avg_high_price: None,
            avg_low_price: None,
        };
        assert_eq!(midpoint(&p), None);
    }

    #[test]
    fn midpoint_both_sides() {
        let p = TimeseriesPoint {
            avg_high_price: Some(120.0),
            avg_low_price: Some(100.0),
        };
        assert_eq!(midpoint(&p), Some(110.0));
    }
}
