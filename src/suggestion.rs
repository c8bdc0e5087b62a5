//! Priority-based suggestion engine (§4.6): turns a client status snapshot
//! into the next `Action`, after running the reconciler and outcome tracker.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use log::warn;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::{
    config::Settings,
    monetary::{estimate_minutes_from_daily, min_profitable_sell_price, seller_tax},
    price_cache::PriceSnapshot,
    rec_tracker, reconciler,
    store::Ledger,
    trend_cache::TrendCache,
    types::{Action, ActionType, StatusRequest, COINS_ITEM_ID},
    utils::clamp,
};

struct Tier {
    min_roi_eff: f64,
    min_margin_eff: f64,
    max_buy_mins: f64,
}

fn tier_for(tf_minutes: i64, settings: &Settings) -> Tier {
    if tf_minutes <= 5 {
        Tier {
            min_roi_eff: settings.min_roi,
            min_margin_eff: (settings.min_margin_gp as f64).max(1.0),
            max_buy_mins: (3 * settings.target_fill_minutes) as f64,
        }
    } else if tf_minutes <= 30 {
        Tier {
            min_roi_eff: settings.min_roi.max(0.003),
            min_margin_eff: (settings.min_margin_gp as f64).max(25.0),
            max_buy_mins: 60.0,
        }
    } else if tf_minutes <= 120 {
        Tier {
            min_roi_eff: settings.min_roi.max(0.006),
            min_margin_eff: (settings.min_margin_gp as f64).max(50.0),
            max_buy_mins: 240.0,
        }
    } else {
        Tier {
            min_roi_eff: settings.min_roi.max(0.010),
            min_margin_eff: (settings.min_margin_gp as f64).max(100.0),
            max_buy_mins: 720.0,
        }
    }
}

fn parse_timeframe(tf: &Option<serde_json::Value>, default_minutes: i64) -> i64 {
    let minutes = match tf {
        None => default_minutes,
        Some(serde_json::Value::Number(n)) => n.as_i64().unwrap_or(default_minutes),
        Some(serde_json::Value::String(s)) => {
            let s = s.trim().to_lowercase();
            if let Some(v) = s.strip_suffix('m') {
                v.parse::<i64>().unwrap_or(default_minutes)
            } else if let Some(v) = s.strip_suffix('h') {
                v.parse::<i64>().map(|h| h * 60).unwrap_or(default_minutes)
            } else {
                s.parse::<i64>().unwrap_or(default_minutes)
            }
        }
        _ => default_minutes,
    };
    minutes.clamp(1, 24 * 60)
}

struct Normalized {
    coins: i64,
    inv: Vec<(i64, i64)>,
    inv_full: bool,
    tf_minutes: i64,
    stale_seconds: i64,
    tier: Tier,
}

fn normalize(req: &StatusRequest, settings: &Settings) -> Normalized {
    let coins: i64 = req
        .items
        .iter()
        .filter(|i| i.item_id == COINS_ITEM_ID)
        .map(|i| i.amount)
        .sum();
    let inv: Vec<(i64, i64)> = req
        .items
        .iter()
        .filter(|i| i.item_id != COINS_ITEM_ID)
        .map(|i| (i.item_id, i.amount))
        .collect();
    let inv_full = inv.len() + if coins > 0 { 1 } else { 0 } >= 28;
    let tf_minutes = parse_timeframe(&req.timeframe, settings.target_fill_minutes);
    let stale_seconds = settings.stale_offer_seconds.max(tf_minutes * 60);
    let tier = tier_for(tf_minutes, settings);
    Normalized {
        coins,
        inv,
        inv_full,
        tf_minutes,
        stale_seconds,
        tier,
    }
}

fn accepts(req: &StatusRequest, action_type: &str) -> bool {
    req.requested_suggestion_types.is_empty()
        || req.requested_suggestion_types.iter().any(|t| t == action_type)
}

struct InstanceRow {
    last_trade_ts: Option<i64>,
    start_ts: i64,
    amount_traded_last_seen: i64,
}

struct LotAgg {
    avg_buy: f64,
    qty: i64,
}

struct DbContext {
    instances: HashMap<i64, InstanceRow>,
    lots: HashMap<i64, LotAgg>,
    recent_buy_fill: HashMap<i64, i64>,
    bought_4h: HashMap<i64, i64>,
}

fn gather_context(ledger: &Ledger, now: i64) -> Result<DbContext> {
    ledger.with_tx(|tx| {
        let mut instances = HashMap::new();
        {
            let mut stmt = tx.prepare(
                "SELECT box_id, last_trade_ts, start_ts, amount_traded_last_seen
                 FROM offer_instances WHERE done_ts IS NULL",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    InstanceRow {
                        last_trade_ts: r.get(1)?,
                        start_ts: r.get(2)?,
                        amount_traded_last_seen: r.get(3)?,
                    },
                ))
            })?;
            for row in rows {
                let (box_id, inst) = row?;
                instances.insert(box_id, inst);
            }
        }

        let mut lots: HashMap<i64, (f64, i64)> = HashMap::new();
        {
            let mut stmt = tx.prepare("SELECT item_id, buy_price, qty_remaining FROM lots WHERE qty_remaining > 0")?;
            let rows = stmt.query_map([], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?))
            })?;
            for row in rows {
                let (item_id, buy_price, qty) = row?;
                let entry = lots.entry(item_id).or_insert((0.0, 0));
                entry.0 += (buy_price * qty) as f64;
                entry.1 += qty;
            }
        }
        let lots: HashMap<i64, LotAgg> = lots
            .into_iter()
            .map(|(k, (total, qty))| {
                (
                    k,
                    LotAgg {
                        avg_buy: if qty > 0 { total / qty as f64 } else { 0.0 },
                        qty,
                    },
                )
            })
            .collect();

        let mut recent_buy_fill = HashMap::new();
        {
            let mut stmt = tx.prepare(
                "SELECT item_id, buy_price FROM buy_fills bf
                 WHERE fill_ts = (SELECT MAX(fill_ts) FROM buy_fills WHERE item_id = bf.item_id)
                 GROUP BY item_id",
            )?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)))?;
            for row in rows {
                let (item_id, price) = row?;
                recent_buy_fill.insert(item_id, price);
            }
        }

        let mut bought_4h = HashMap::new();
        {
            let mut stmt =
                tx.prepare("SELECT item_id, SUM(qty) FROM buy_fills WHERE fill_ts >= ?1 GROUP BY item_id")?;
            let rows = stmt.query_map(params![now - 4 * 3600], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)))?;
            for row in rows {
                let (item_id, qty) = row?;
                bought_4h.insert(item_id, qty);
            }
        }

        Ok(DbContext {
            instances,
            lots,
            recent_buy_fill,
            bought_4h,
        })
    })
}

#[derive(Serialize, Deserialize, Clone)]
pub struct QueuedBuy {
    pub box_id: i64,
    pub item_id: i64,
    pub price: i64,
    pub quantity: i64,
    pub name: String,
    pub expected_profit: f64,
    pub expected_duration: f64,
    pub note: String,
}

#[derive(Serialize, Deserialize, Default)]
struct BuyQueueFile {
    buy_queue: Vec<QueuedBuy>,
}

fn load_buy_queue(path: &str) -> Vec<QueuedBuy> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str::<BuyQueueFile>(&s).ok())
        .map(|f| f.buy_queue)
        .unwrap_or_default()
}

fn save_buy_queue(path: &str, queue: &[QueuedBuy]) -> Result<()> {
    let body = serde_json::to_string(&BuyQueueFile {
        buy_queue: queue.to_vec(),
    })?;
    let tmp_path = format!("{path}.tmp");
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(&tmp_path, body)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn new_rec_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn make_action(
    action_type: ActionType,
    now: i64,
    box_id: i64,
    item_id: i64,
    price: i64,
    quantity: i64,
    name: impl Into<String>,
    message: impl Into<String>,
    expected_profit: f64,
    expected_duration: f64,
    note: impl Into<String>,
) -> Action {
    Action {
        action_type,
        rec_id: new_rec_id(),
        issued_unix: now,
        box_id,
        item_id,
        price,
        quantity,
        name: name.into(),
        message: message.into(),
        expected_profit,
        expected_duration,
        note: note.into(),
    }
}

pub async fn suggest(
    ledger: &Ledger,
    settings: &Settings,
    snapshot: &PriceSnapshot,
    trend_cache: &TrendCache,
    req: &StatusRequest,
    now: i64,
) -> Result<Action> {
    reconciler::reconcile_offers(ledger, settings, &req.offers, now)?;
    rec_tracker::update_outcomes(ledger, settings, now)?;

    let norm = normalize(req, settings);
    let ctx = gather_context(ledger, now)?;

    let blocked: HashSet<i64> = req.blocked_items.iter().copied().collect();
    let active_item_ids: HashSet<i64> = req
        .offers
        .iter()
        .filter(|o| o.status == "buy" || o.status == "sell")
        .map(|o| o.item_id)
        .collect();
    let slots_open = req.offers.iter().filter(|o| o.status == "empty").count() as i64;

    if let Some(a) = p1_stale_offers(settings, snapshot, req, &norm, &ctx, ledger, now)? {
        rec_tracker::record(ledger, &a)?;
        return Ok(a);
    }
    if let Some(a) = p2_crash_guard(settings, snapshot, req, &norm, &ctx, ledger, now)? {
        rec_tracker::record(ledger, &a)?;
        return Ok(a);
    }
    if slots_open == 0 {
        if let Some(a) = p3_clear_ge(settings, req, &norm, &ctx, ledger, now)? {
            rec_tracker::record(ledger, &a)?;
            return Ok(a);
        }
        let a = Action::wait(now, new_rec_id(), "no empty slots and nothing to clear");
        rec_tracker::record(ledger, &a)?;
        return Ok(a);
    }
    if slots_open >= 1 {
        let empty_box = req.offers.iter().find(|o| o.status == "empty").map(|o| o.box_id).unwrap_or(-1);
        if let Some(a) = p4_sell_inventory(settings, snapshot, req, &norm, &ctx, &blocked, &active_item_ids, empty_box, now)? {
            rec_tracker::record(ledger, &a)?;
            return Ok(a);
        }
    }

    let mut queue = load_buy_queue(&settings.buy_queue_path);
    if let Some(skip_id) = req.skip_suggestion {
        queue.retain(|q| q.item_id != skip_id);
        save_buy_queue(&settings.buy_queue_path, &queue)?;
    }
    if !queue.is_empty() {
        let first_empty_box = req.offers.iter().find(|o| o.status == "empty").map(|o| o.box_id);
        if let Some(box_id) = first_empty_box {
            let q = queue.remove(0);
            save_buy_queue(&settings.buy_queue_path, &queue)?;
            let a = make_action(
                ActionType::Buy,
                now,
                box_id,
                q.item_id,
                q.price,
                q.quantity,
                q.name,
                "queued buy",
                q.expected_profit,
                q.expected_duration,
                q.note,
            );
            rec_tracker::record(ledger, &a)?;
            return Ok(a);
        }
    }

    if !req.sell_only {
        if let Some(a) = p6_new_buys(
            settings,
            snapshot,
            trend_cache,
            req,
            &norm,
            &ctx,
            &blocked,
            &active_item_ids,
            slots_open,
            now,
        )
        .await?
        {
            rec_tracker::record(ledger, &a)?;
            return Ok(a);
        }
    }

    let a = Action::wait(now, new_rec_id(), "no actionable move");
    rec_tracker::record(ledger, &a)?;
    Ok(a)
}

fn inv_contains(inv: &[(i64, i64)], item_id: i64) -> bool {
    inv.iter().any(|(i, amt)| *i == item_id && *amt > 0)
}

#[allow(clippy::too_many_arguments)]
fn p1_stale_offers(
    settings: &Settings,
    snapshot: &PriceSnapshot,
    req: &StatusRequest,
    norm: &Normalized,
    ctx: &DbContext,
    ledger: &Ledger,
    now: i64,
) -> Result<Option<Action>> {
    for offer in &req.offers {
        if offer.status != "buy" && offer.status != "sell" {
            continue;
        }
        let Some(inst) = ctx.instances.get(&offer.box_id) else {
            continue;
        };
        let age = now - inst.last_trade_ts.unwrap_or(inst.start_ts);
        if age <= norm.stale_seconds {
            continue;
        }

        if offer.status == "sell" {
            let mut handled = false;
            if let Some(lot) = ctx.lots.get(&offer.item_id) {
                if lot.qty > 0 && lot.avg_buy > 0.0 {
                    let quote = snapshot.quote(offer.item_id).unwrap_or_default();
                    let low = quote.low.unwrap_or(0);
                    let desired = low.max(min_profitable_sell_price(
                        lot.avg_buy as i64,
                        settings.seller_tax_rate,
                        settings.seller_tax_cap,
                    ));
                    if desired < offer.price {
                        let remaining = offer.amount_total - offer.amount_traded;
                        let name = snapshot.meta(offer.item_id).map(|m| m.name.clone()).unwrap_or_default();
                        return Ok(Some(make_action(
                            ActionType::Sell,
                            now,
                            offer.box_id,
                            offer.item_id,
                            desired,
                            remaining,
                            name,
                            "stale sell reprice",
                            0.0,
                            0.0,
                            "",
                        )));
                    }
                    handled = true;
                }
            }
            if !handled && accepts(req, "abort") {
                let inv_safe = !norm.inv_full || norm.coins > 0;
                if inv_safe && !rec_tracker::should_throttle_abort(ledger, offer.box_id, now, settings.abort_cooldown_seconds)? {
                    return Ok(Some(make_action(
                        ActionType::Abort,
                        now,
                        offer.box_id,
                        offer.item_id,
                        offer.price,
                        0,
                        "",
                        "stale sell, no tracked basis",
                        0.0,
                        0.0,
                        "",
                    )));
                }
            }
        } else if accepts(req, "abort") {
            let inv_safe = !norm.inv_full || norm.coins > 0;
            if inv_safe && !rec_tracker::should_throttle_abort(ledger, offer.box_id, now, settings.abort_cooldown_seconds)? {
                return Ok(Some(make_action(
                    ActionType::Abort,
                    now,
                    offer.box_id,
                    offer.item_id,
                    offer.price,
                    0,
                    "",
                    "stale buy",
                    0.0,
                    0.0,
                    "",
                )));
            }
        }
    }
    Ok(None)
}

fn p2_crash_guard(
    settings: &Settings,
    snapshot: &PriceSnapshot,
    req: &StatusRequest,
    norm: &Normalized,
    ctx: &DbContext,
    ledger: &Ledger,
    now: i64,
) -> Result<Option<Action>> {
    for offer in &req.offers {
        if offer.status != "sell" {
            continue;
        }
        let Some(inst) = ctx.instances.get(&offer.box_id) else {
            continue;
        };
        let age = now - inst.last_trade_ts.unwrap_or(inst.start_ts);
        if age < norm.stale_seconds {
            continue;
        }
        let quote = snapshot.quote(offer.item_id).unwrap_or_default();
        let Some(high) = quote.high else { continue };
        if offer.price <= (high - 1) + 2 {
            continue;
        }
        let target_market = high - 1;
        let desired = target_market.max((offer.price as f64 * 0.99).floor() as i64).min(offer.price - 1);
        let avg_buy = ctx.lots.get(&offer.item_id).map(|l| l.avg_buy as i64).unwrap_or(0);
        let tax = seller_tax(desired, settings.seller_tax_rate, settings.seller_tax_cap);
        if desired - avg_buy - tax <= 0 {
            continue;
        }
        if rec_tracker::should_throttle_abort(ledger, offer.box_id, now, settings.abort_cooldown_seconds)? {
            continue;
        }
        return Ok(Some(make_action(
            ActionType::Abort,
            now,
            offer.box_id,
            offer.item_id,
            offer.price,
            0,
            "",
            format!("reprice sell → {desired} gp (crash-guard)"),
            0.0,
            0.0,
            "",
        )));
    }
    Ok(None)
}

fn p3_clear_ge(
    settings: &Settings,
    req: &StatusRequest,
    norm: &Normalized,
    ctx: &DbContext,
    ledger: &Ledger,
    now: i64,
) -> Result<Option<Action>> {
    for offer in &req.offers {
        if offer.status != "buy" && offer.status != "sell" {
            continue;
        }
        if offer.active {
            continue;
        }
        let inv_safe = if offer.status == "sell" {
            !norm.inv_full || norm.coins > 0
        } else {
            !norm.inv_full || inv_contains(&norm.inv, offer.item_id)
        };
        if !inv_safe || rec_tracker::should_throttle_abort(ledger, offer.box_id, now, settings.abort_cooldown_seconds)? {
            continue;
        }
        return Ok(Some(make_action(
            ActionType::Abort,
            now,
            offer.box_id,
            offer.item_id,
            offer.price,
            0,
            "",
            "clear done offer",
            0.0,
            0.0,
            "",
        )));
    }

    let mut stuck: Option<(&crate::types::OfferIn, &InstanceRow)> = None;
    for offer in &req.offers {
        if offer.status != "buy" {
            continue;
        }
        let Some(inst) = ctx.instances.get(&offer.box_id) else {
            continue;
        };
        if inst.amount_traded_last_seen != 0 {
            continue;
        }
        if now - inst.start_ts < settings.stuck_buy_abort_seconds {
            continue;
        }
        stuck = match stuck {
            None => Some((offer, inst)),
            Some((_, best)) if inst.start_ts < best.start_ts => Some((offer, inst)),
            other => other,
        };
    }
    if let Some((offer, _)) = stuck {
        let inv_safe = !norm.inv_full || inv_contains(&norm.inv, offer.item_id);
        if inv_safe && !rec_tracker::should_throttle_abort(ledger, offer.box_id, now, settings.abort_cooldown_seconds)? {
            return Ok(Some(make_action(
                ActionType::Abort,
                now,
                offer.box_id,
                offer.item_id,
                offer.price,
                0,
                "",
                "stuck buy with zero fills",
                0.0,
                0.0,
                "",
            )));
        }
    }

    Ok(None)
}

#[allow(clippy::too_many_arguments)]
fn p4_sell_inventory(
    settings: &Settings,
    snapshot: &PriceSnapshot,
    req: &StatusRequest,
    norm: &Normalized,
    ctx: &DbContext,
    blocked: &HashSet<i64>,
    active_item_ids: &HashSet<i64>,
    empty_box: i64,
    now: i64,
) -> Result<Option<Action>> {
    let _ = req;
    for &(item_id, amt) in &norm.inv {
        if amt <= 0 || blocked.contains(&item_id) || active_item_ids.contains(&item_id) {
            continue;
        }
        let Some(quote) = snapshot.quote(item_id) else {
            continue;
        };
        let name = snapshot.meta(item_id).map(|m| m.name.clone()).unwrap_or_default();

        if let Some(lot) = ctx.lots.get(&item_id) {
            if lot.qty > 0 && lot.avg_buy > 0.0 {
                let Some(high) = quote.high else { continue };
                let sell_price = (high - 1).max(1);
                let tax = seller_tax(sell_price, settings.seller_tax_rate, settings.seller_tax_cap);
                let profit_per = sell_price - lot.avg_buy as i64 - tax;
                if profit_per <= 0 {
                    continue;
                }
                return Ok(Some(make_action(
                    ActionType::Sell,
                    now,
                    empty_box,
                    item_id,
                    sell_price,
                    amt,
                    name,
                    "sell tracked inventory",
                    (profit_per * amt) as f64,
                    0.0,
                    "",
                )));
            }
        }

        if !settings.auto_sell_unknown_basis {
            continue;
        }
        let daily_vol = snapshot.volume(item_id);
        let mins = estimate_minutes_from_daily(amt, daily_vol);
        if mins <= settings.fast_sell_target_minutes {
            let Some(low) = quote.low else { continue };
            let sell_price = low.max(1);
            let basis = ctx.recent_buy_fill.get(&item_id).copied().unwrap_or(sell_price);
            let tax = seller_tax(sell_price, settings.seller_tax_rate, settings.seller_tax_cap);
            let profit_per = sell_price - basis - tax;
            return Ok(Some(make_action(
                ActionType::Sell,
                now,
                empty_box,
                item_id,
                sell_price,
                amt,
                name,
                "fast-sell by volume",
                (profit_per * amt) as f64,
                mins,
                "",
            )));
        }
    }
    Ok(None)
}

struct Candidate {
    item_id: i64,
    name: String,
    price: i64,
    qty: i64,
    expected_profit: f64,
    mins: f64,
    score: f64,
}

#[allow(clippy::too_many_arguments)]
async fn p6_new_buys(
    settings: &Settings,
    snapshot: &PriceSnapshot,
    trend_cache: &TrendCache,
    req: &StatusRequest,
    norm: &Normalized,
    ctx: &DbContext,
    blocked: &HashSet<i64>,
    active_item_ids: &HashSet<i64>,
    slots_open: i64,
    now: i64,
) -> Result<Option<Action>> {
    let budget_total = ((norm.coins as f64 * settings.max_cash_fraction).floor() as i64).min(settings.buy_budget_cap);
    if budget_total <= 0 {
        return Ok(None);
    }
    let per_slot_budget = (budget_total / slots_open).max(1);

    let mut candidates = Vec::new();
    for (&item_id, quote) in &snapshot.latest {
        if blocked.contains(&item_id) || active_item_ids.contains(&item_id) {
            continue;
        }
        let Some(meta) = snapshot.meta(item_id) else {
            continue;
        };
        let daily_vol = match snapshot.volume(item_id) {
            Some(v) => v,
            None => continue,
        };
        if daily_vol < settings.min_daily_volume || daily_vol > settings.max_daily_volume {
            continue;
        }
        let (Some(low), Some(high)) = (quote.low, quote.high) else {
            continue;
        };
        if low <= 0 || high <= 0 || low < settings.min_buy_price {
            continue;
        }
        let margin = (high - 1) - low;
        if margin < settings.min_margin_gp {
            continue;
        }
        let tax = seller_tax(high - 1, settings.seller_tax_rate, settings.seller_tax_cap);
        let profit_per = (high - 1) - low - tax;
        if profit_per < (1i64).max(norm.tier.min_margin_eff as i64) {
            continue;
        }
        let roi = profit_per as f64 / low as f64;
        if roi < norm.tier.min_roi_eff || roi > settings.max_roi {
            continue;
        }
        let mut qty = per_slot_budget / low;
        if qty <= 0 {
            continue;
        }
        if let Some(limit) = meta.buy_limit {
            let bought = ctx.bought_4h.get(&item_id).copied().unwrap_or(0);
            qty = qty.min((limit - bought).max(0));
            if qty <= 0 {
                continue;
            }
        }
        let mins = estimate_minutes_from_daily(qty, Some(daily_vol));
        if mins > norm.tier.max_buy_mins {
            continue;
        }
        let expected_profit = (profit_per * qty) as f64;
        let score = (expected_profit / mins.max(0.25)) * 1.7 / mins.max(0.25).sqrt();
        candidates.push(Candidate {
            item_id,
            name: meta.name.clone(),
            price: low,
            qty,
            expected_profit,
            mins,
            score,
        });
    }

    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    if settings.enable_trends && norm.tf_minutes > 5 {
        let influence = if norm.tf_minutes <= 30 {
            2.0
        } else if norm.tf_minutes <= 120 {
            3.5
        } else {
            5.0
        };
        let top_n = settings.trend_recheck_top_n.min(candidates.len());
        for c in candidates.iter_mut().take(top_n) {
            let trend = trend_cache.trend(c.item_id, norm.tf_minutes).await;
            c.score *= 1.0 + clamp(trend, -0.05, 0.05) * influence;
            if norm.tf_minutes >= 120 && trend < -0.03 {
                c.score *= 0.5;
            }
        }
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    }

    if candidates.is_empty() {
        return Ok(None);
    }

    let take_n = (slots_open as usize).min(candidates.len());
    let mut empty_boxes: Vec<i64> = req.offers.iter().filter(|o| o.status == "empty").map(|o| o.box_id).collect();
    empty_boxes.sort_unstable();

    let mut to_queue = Vec::new();
    let mut first_action = None;
    for (idx, c) in candidates.into_iter().take(take_n).enumerate() {
        if idx == 0 {
            let box_id = empty_boxes.first().copied().unwrap_or(-1);
            first_action = Some(make_action(
                ActionType::Buy,
                now,
                box_id,
                c.item_id,
                c.price,
                c.qty,
                c.name,
                "new buy candidate",
                c.expected_profit,
                c.mins,
                "",
            ));
        } else {
            to_queue.push(QueuedBuy {
                box_id: -1,
                item_id: c.item_id,
                price: c.price,
                quantity: c.qty,
                name: c.name,
                expected_profit: c.expected_profit,
                expected_duration: c.mins,
                note: String::new(),
            });
        }
    }

    if !to_queue.is_empty() {
        let mut queue = load_buy_queue(&settings.buy_queue_path);
        queue.extend(to_queue);
        if let Err(e) = save_buy_queue(&settings.buy_queue_path, &queue) {
            warn!("suggestion: failed to persist buy_queue: {e}");
        }
    }

    Ok(first_action)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_parsing() {
        assert_eq!(parse_timeframe(&Some(serde_json::json!("5m")), 15), 5);
        assert_eq!(parse_timeframe(&Some(serde_json::json!("2h")), 15), 120);
        assert_eq!(parse_timeframe(&Some(serde_json::json!(45)), 15), 45);
        assert_eq!(parse_timeframe(&None, 15), 15);
        assert_eq!(parse_timeframe(&Some(serde_json::json!("8h")), 15), 480);
        assert_eq!(parse_timeframe(&Some(serde_json::json!(100_000)), 15), 1440);
    }

    #[test]
    fn tier_thresholds_match_table() {
        let settings = Settings::load_for_test();
        let t = tier_for(5, &settings);
        assert_eq!(t.min_margin_eff, 1.0);
        let t = tier_for(30, &settings);
        assert!((t.min_roi_eff - 0.003).abs() < 1e-9);
        assert_eq!(t.min_margin_eff, 25.0);
        let t = tier_for(120, &settings);
        assert_eq!(t.max_buy_mins, 240.0);
        let t = tier_for(999, &settings);
        assert_eq!(t.max_buy_mins, 720.0);
    }

    #[test]
    fn auto_sell_unknown_basis_false_disables_fast_sell_fallback() {
        let mut settings = Settings::load_for_test();
        settings.auto_sell_unknown_basis = false;

        let norm = Normalized {
            coins: 0,
            inv: vec![(7, 10)],
            inv_full: false,
            tf_minutes: 15,
            stale_seconds: 600,
            tier: tier_for(15, &settings),
        };
        let ctx = DbContext {
            instances: HashMap::new(),
            lots: HashMap::new(),
            recent_buy_fill: HashMap::new(),
            bought_4h: HashMap::new(),
        };
        let mut latest = HashMap::new();
        latest.insert(
            7,
            crate::price_cache::LatestQuote {
                low: Some(100),
                high: Some(110),
                low_ts: Some(0),
                high_ts: Some(0),
            },
        );
        let mut volumes = HashMap::new();
        volumes.insert(7, 10_000_000);
        let snapshot = PriceSnapshot {
            metadata: HashMap::new(),
            latest,
            volumes,
            last_refresh_ts: 0,
        };
        let req = StatusRequest {
            offers: vec![],
            items: vec![],
            timeframe: None,
            blocked_items: vec![],
            skip_suggestion: None,
            sell_only: false,
            requested_suggestion_types: vec![],
        };

        let action = p4_sell_inventory(
            &settings,
            &snapshot,
            &req,
            &norm,
            &ctx,
            &HashSet::new(),
            &HashSet::new(),
            0,
            1000,
        )
        .unwrap();
        assert!(action.is_none());
    }

    fn test_ledger(tag: &str) -> Ledger {
        let dir = std::env::temp_dir().join(format!("ge_copilot_suggestion_{tag}_{}_{}", std::process::id(), line!()));
        std::fs::create_dir_all(&dir).unwrap();
        let ledger = Ledger::new(dir.join("l.sqlite").to_str().unwrap()).unwrap();
        ledger.init_db().unwrap();
        ledger
    }

    fn empty_req(offers: Vec<crate::types::OfferIn>) -> StatusRequest {
        StatusRequest {
            offers,
            items: vec![],
            timeframe: None,
            blocked_items: vec![],
            skip_suggestion: None,
            sell_only: false,
            requested_suggestion_types: vec![],
        }
    }

    /// A stale sell with a tracked cost basis reprices down to the max of
    /// market low and the minimum profitable sell price.
    #[test]
    fn stale_sell_reprices_to_worked_example_price() {
        let settings = Settings::load_for_test();
        let ledger = test_ledger("p1");
        let now = 100_000;

        let norm = Normalized {
            coins: 0,
            inv: vec![],
            inv_full: false,
            tf_minutes: 15,
            stale_seconds: 300,
            tier: tier_for(15, &settings),
        };
        let mut instances = HashMap::new();
        instances.insert(
            0,
            InstanceRow {
                last_trade_ts: Some(now - 1_000),
                start_ts: now - 2_000,
                amount_traded_last_seen: 0,
            },
        );
        let mut lots = HashMap::new();
        lots.insert(1234, LotAgg { avg_buy: 100.0, qty: 10 });
        let ctx = DbContext {
            instances,
            lots,
            recent_buy_fill: HashMap::new(),
            bought_4h: HashMap::new(),
        };

        let mut latest = HashMap::new();
        latest.insert(
            1234,
            crate::price_cache::LatestQuote {
                low: Some(120),
                high: Some(145),
                low_ts: Some(0),
                high_ts: Some(0),
            },
        );
        let snapshot = PriceSnapshot {
            metadata: HashMap::new(),
            latest,
            volumes: HashMap::new(),
            last_refresh_ts: 0,
        };

        let req = empty_req(vec![crate::types::OfferIn {
            box_id: 0,
            status: "sell".into(),
            active: true,
            item_id: 1234,
            price: 150,
            amount_total: 10,
            amount_traded: 0,
            gp_to_collect: 0,
        }]);

        let action = p1_stale_offers(&settings, &snapshot, &req, &norm, &ctx, &ledger, now)
            .unwrap()
            .unwrap();
        assert_eq!(action.action_type, ActionType::Sell);
        assert_eq!(action.price, 120);
        assert_eq!(action.quantity, 10);
    }

    /// An active sell priced far above the current market triggers a
    /// crash-guard abort carrying the reprice note.
    #[test]
    fn crash_guard_reprices_sell_far_above_market() {
        let settings = Settings::load_for_test();
        let ledger = test_ledger("p2");
        let now = 100_000;

        let norm = Normalized {
            coins: 0,
            inv: vec![],
            inv_full: false,
            tf_minutes: 15,
            stale_seconds: 300,
            tier: tier_for(15, &settings),
        };
        let mut instances = HashMap::new();
        instances.insert(
            0,
            InstanceRow {
                last_trade_ts: Some(now - 1_000),
                start_ts: now - 2_000,
                amount_traded_last_seen: 0,
            },
        );
        let mut lots = HashMap::new();
        lots.insert(1234, LotAgg { avg_buy: 100.0, qty: 10 });
        let ctx = DbContext {
            instances,
            lots,
            recent_buy_fill: HashMap::new(),
            bought_4h: HashMap::new(),
        };

        let mut latest = HashMap::new();
        latest.insert(
            1234,
            crate::price_cache::LatestQuote {
                low: Some(140),
                high: Some(150),
                low_ts: Some(0),
                high_ts: Some(0),
            },
        );
        let snapshot = PriceSnapshot {
            metadata: HashMap::new(),
            latest,
            volumes: HashMap::new(),
            last_refresh_ts: 0,
        };

        let req = empty_req(vec![crate::types::OfferIn {
            box_id: 0,
            status: "sell".into(),
            active: true,
            item_id: 1234,
            price: 200,
            amount_total: 10,
            amount_traded: 0,
            gp_to_collect: 0,
        }]);

        let action = p2_crash_guard(&settings, &snapshot, &req, &norm, &ctx, &ledger, now)
            .unwrap()
            .unwrap();
        assert_eq!(action.action_type, ActionType::Abort);
        assert!(action.note.contains("198 gp"), "note was: {}", action.note);
    }

    /// A candidate within ROI/margin/fill-time bounds is selected with the
    /// exact budgeted quantity and expected profit.
    #[tokio::test]
    async fn new_buy_candidate_matches_worked_example() {
        let settings = Settings::load_for_test();
        let norm = Normalized {
            coins: 10_000_000,
            inv: vec![],
            inv_full: false,
            tf_minutes: 5,
            stale_seconds: 300,
            tier: tier_for(5, &settings),
        };
        let ctx = DbContext {
            instances: HashMap::new(),
            lots: HashMap::new(),
            recent_buy_fill: HashMap::new(),
            bought_4h: HashMap::new(),
        };

        let mut metadata = HashMap::new();
        metadata.insert(
            1234,
            crate::price_cache::ItemMeta {
                name: "Thing".into(),
                buy_limit: Some(60),
            },
        );
        let mut latest = HashMap::new();
        latest.insert(
            1234,
            crate::price_cache::LatestQuote {
                low: Some(500),
                high: Some(520),
                low_ts: Some(0),
                high_ts: Some(0),
            },
        );
        let mut volumes = HashMap::new();
        volumes.insert(1234, 500_000);
        let snapshot = PriceSnapshot {
            metadata,
            latest,
            volumes,
            last_refresh_ts: 0,
        };

        let offers: Vec<crate::types::OfferIn> = (0..4)
            .map(|box_id| crate::types::OfferIn {
                box_id,
                status: "empty".into(),
                active: false,
                item_id: 0,
                price: 0,
                amount_total: 0,
                amount_traded: 0,
                gp_to_collect: 0,
            })
            .collect();
        let req = empty_req(offers);

        let trend_cache = TrendCache::new("http://127.0.0.1:1".into(), 60, 1);

        let action = p6_new_buys(
            &settings,
            &snapshot,
            &trend_cache,
            &req,
            &norm,
            &ctx,
            &HashSet::new(),
            &HashSet::new(),
            4,
            100_000,
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(action.item_id, 1234);
        assert_eq!(action.price, 500);
        assert_eq!(action.quantity, 60);
        assert!((action.expected_profit - 540.0).abs() < 1e-6);
    }

    #[test]
    fn buy_queue_round_trips_through_temp_rename() {
        let dir = std::env::temp_dir().join(format!("ge_copilot_buyqueue_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("buy_queue.json");
        let path = path.to_str().unwrap();

        let queue = vec![QueuedBuy {
            box_id: -1,
            item_id: 1234,
            price: 100,
            quantity: 10,
            name: "thing".into(),
            expected_profit: 50.0,
            expected_duration: 5.0,
            note: String::new(),
        }];
        save_buy_queue(path, &queue).unwrap();
        let loaded = load_buy_queue(path);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].item_id, 1234);
    }
}
