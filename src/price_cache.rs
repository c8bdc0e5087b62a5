//! Process-wide item metadata / quote / volume cache (§4.1).
//!
//! Mirrors the donor's `FeedState` shape: an `Arc<RwLock<..>>` snapshot
//! mutated only by a background refresher, read by request handlers via a
//! cheap clone.

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use parking_lot::RwLock;
use serde::Deserialize;

use crate::{config::Settings, utils::now_ts};

#[derive(Debug, Clone, Default)]
pub struct ItemMeta {
    pub name: String,
    pub buy_limit: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LatestQuote {
    pub low: Option<i64>,
    pub high: Option<i64>,
    pub low_ts: Option<i64>,
    pub high_ts: Option<i64>,
}

#[derive(Debug, Clone, Default)]
struct Inner {
    metadata: HashMap<i64, ItemMeta>,
    latest: HashMap<i64, LatestQuote>,
    volumes: HashMap<i64, i64>,
    last_refresh_ts: i64,
}

#[derive(Clone)]
pub struct PriceCache {
    inner: Arc<RwLock<Inner>>,
}

/// Consistent point-in-time copy of the three cached tables.
#[derive(Clone)]
pub struct PriceSnapshot {
    pub metadata: HashMap<i64, ItemMeta>,
    pub latest: HashMap<i64, LatestQuote>,
    pub volumes: HashMap<i64, i64>,
    pub last_refresh_ts: i64,
}

impl PriceSnapshot {
    pub fn quote(&self, item_id: i64) -> Option<LatestQuote> {
        self.latest.get(&item_id).copied()
    }

    pub fn volume(&self, item_id: i64) -> Option<i64> {
        self.volumes.get(&item_id).copied()
    }

    pub fn meta(&self, item_id: i64) -> Option<&ItemMeta> {
        self.metadata.get(&item_id)
    }
}

#[derive(Deserialize)]
struct MappingEntry {
    id: i64,
    name: String,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct LatestEntry {
    high: Option<i64>,
    #[serde(rename = "highTime")]
    high_time: Option<i64>,
    low: Option<i64>,
    #[serde(rename = "lowTime")]
    low_time: Option<i64>,
}

#[derive(Deserialize)]
struct LatestResponse {
    data: HashMap<String, LatestEntry>,
}

#[derive(Deserialize)]
struct VolumeResponse {
    data: HashMap<String, i64>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    pub fn snapshot(&self) -> PriceSnapshot {
        let g = self.inner.read();
        PriceSnapshot {
            metadata: g.metadata.clone(),
            latest: g.latest.clone(),
            volumes: g.volumes.clone(),
            last_refresh_ts: g.last_refresh_ts,
        }
    }

    /// Spawns the background refresher on the given period. Non-blocking.
    pub fn start_refresh(&self, settings: Settings) {
        let cache = self.clone();
        tokio::spawn(async move {
            let client = match reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(settings.price_feed_timeout_seconds))
                .build()
            {
                Ok(c) => c,
                Err(e) => {
                    warn!("price_cache: failed to build http client: {e}");
                    return;
                }
            };
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(settings.refresh_seconds));
            loop {
                tick.tick().await;
                cache.refresh_once(&client, &settings).await;
            }
        });
    }

    async fn refresh_once(&self, client: &reqwest::Client, settings: &Settings) {
        let metadata_empty = self.inner.read().metadata.is_empty();

        let metadata = if metadata_empty {
            match fetch_metadata(client, &settings.price_feed_base_url).await {
                Ok(m) => Some(m),
                Err(primary_err) => {
                    match fetch_metadata(client, &settings.price_feed_wiki_base_url).await {
                        Ok(m) => Some(m),
                        Err(fallback_err) => {
                            warn!(
                                "price_cache: metadata fetch failed (primary: {primary_err}, fallback: {fallback_err})"
                            );
                            None
                        }
                    }
                }
            }
        } else {
            None
        };

        let latest = match fetch_latest(client, &settings.price_feed_base_url).await {
            Ok(l) => Some(l),
            Err(e) => {
                warn!("price_cache: latest fetch failed: {e}");
                None
            }
        };

        let volumes = match fetch_volumes(client, &settings.price_feed_base_url).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("price_cache: volume fetch failed: {e}");
                None
            }
        };

        if metadata.is_none() && latest.is_none() && volumes.is_none() {
            return;
        }

        let mut g = self.inner.write();
        if let Some(m) = metadata {
            g.metadata = m;
        }
        if let Some(l) = latest {
            g.latest = l;
        }
        if let Some(v) = volumes {
            g.volumes = v;
        }
        g.last_refresh_ts = now_ts();
    }
}

impl Default for PriceCache {
    fn default() -> Self {
        Self::new()
    }
}

async fn fetch_metadata(client: &reqwest::Client, base_url: &str) -> anyhow::Result<HashMap<i64, ItemMeta>> {
    let url = format!("{base_url}/mapping");
    let entries: Vec<MappingEntry> = client.get(url).send().await?.error_for_status()?.json().await?;
    Ok(entries
        .into_iter()
        .map(|e| {
            (
                e.id,
                ItemMeta {
                    name: e.name,
                    buy_limit: e.limit,
                },
            )
        })
        .collect())
}

async fn fetch_latest(client: &reqwest::Client, base_url: &str) -> anyhow::Result<HashMap<i64, LatestQuote>> {
    let url = format!("{base_url}/latest");
    let resp: LatestResponse = client.get(url).send().await?.error_for_status()?.json().await?;
    Ok(resp
        .data
        .into_iter()
        .filter_map(|(k, v)| {
            k.parse::<i64>().ok().map(|id| {
                (
                    id,
                    LatestQuote {
                        low: v.low,
                        high: v.high,
                        low_ts: v.low_time,
                        high_ts: v.high_time,
                    },
                )
            })
        })
        .collect())
}

async fn fetch_volumes(client: &reqwest::Client, base_url: &str) -> anyhow::Result<HashMap<i64, i64>> {
    let url = format!("{base_url}/volumes");
    let resp: VolumeResponse = client.get(url).send().await?.error_for_status()?.json().await?;
    Ok(resp
        .data
        .into_iter()
        .filter_map(|(k, v)| k.parse::<i64>().ok().map(|id| (id, v)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_has_no_entries() {
        let cache = PriceCache::new();
        let snap = cache.snapshot();
        assert!(snap.metadata.is_empty());
        assert!(snap.latest.is_empty());
        assert!(snap.volumes.is_empty());
        assert_eq!(snap.quote(1234), None);
    }
}
