//! Offer reconciliation (§4.4): converts successive client snapshots into
//! durable buy-fill / FIFO lot-consumption events.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use crate::{
    config::Settings,
    monetary::seller_tax,
    store::Ledger,
    types::OfferIn,
};

const REC_LINK_WINDOW_SECONDS: i64 = 15 * 60;

struct OpenInstance {
    offer_id: i64,
    status: String,
    item_id: i64,
    amount_total: i64,
    amount_traded_last_seen: i64,
    first_fill_ts: Option<i64>,
    linked_rec_id: Option<String>,
}

pub fn reconcile_offers(ledger: &Ledger, settings: &Settings, offers: &[OfferIn], now: i64) -> Result<()> {
    ledger.with_tx(|tx| {
        for offer in offers {
            reconcile_one(tx, settings, offer, now)?;
        }
        Ok(())
    })
}

fn find_open_instance(tx: &rusqlite::Transaction, box_id: i64) -> Result<Option<OpenInstance>> {
    Ok(tx
        .query_row(
            "SELECT offer_id, status, item_id, amount_total, amount_traded_last_seen, first_fill_ts, linked_rec_id
             FROM offer_instances WHERE box_id = ?1 AND done_ts IS NULL",
            params![box_id],
            |r| {
                Ok(OpenInstance {
                    offer_id: r.get(0)?,
                    status: r.get(1)?,
                    item_id: r.get(2)?,
                    amount_total: r.get(3)?,
                    amount_traded_last_seen: r.get(4)?,
                    first_fill_ts: r.get(5)?,
                    linked_rec_id: r.get(6)?,
                })
            },
        )
        .optional()?)
}

fn close_instance(tx: &rusqlite::Transaction, offer_id: i64, now: i64) -> Result<()> {
    tx.execute(
        "UPDATE offer_instances SET active = 0, done_ts = COALESCE(done_ts, ?1) WHERE offer_id = ?2",
        params![now, offer_id],
    )?;
    Ok(())
}

fn mark_rec_failed_cancelled(tx: &rusqlite::Transaction, rec_id: &str) -> Result<()> {
    tx.execute(
        "UPDATE recommendations SET outcome_status = 'failed_cancelled', closed_ts = COALESCE(closed_ts, strftime('%s','now'))
         WHERE rec_id = ?1 AND outcome_status NOT IN ('completed','failed_no_fill','failed_cancelled')",
        params![rec_id],
    )?;
    Ok(())
}

fn reconcile_one(tx: &rusqlite::Transaction, settings: &Settings, offer: &OfferIn, now: i64) -> Result<()> {
    let existing = find_open_instance(tx, offer.box_id)?;

    if offer.status == "empty" {
        if let Some(inst) = existing {
            close_instance(tx, inst.offer_id, now)?;
            if inst.status == "buy" && inst.amount_traded_last_seen == 0 {
                if let Some(rec_id) = inst.linked_rec_id {
                    mark_rec_failed_cancelled(tx, &rec_id)?;
                }
            }
        }
        return Ok(());
    }

    if !matches!(offer.status.as_str(), "buy" | "sell")
        || offer.amount_total < 0
        || offer.price <= 0
        || offer.item_id <= 0
    {
        return Ok(());
    }

    let instance_changed = match &existing {
        None => true,
        Some(inst) => {
            inst.status != offer.status || inst.item_id != offer.item_id || inst.amount_total != offer.amount_total
        }
    };

    let (offer_id, last_traded, mut linked_rec_id, first_fill_ts_existing) = if instance_changed {
        if let Some(inst) = &existing {
            close_instance(tx, inst.offer_id, now)?;
        }
        let first_fill_ts = if offer.amount_traded > 0 { Some(now) } else { None };
        tx.execute(
            "INSERT INTO offer_instances
               (box_id, status, item_id, price, amount_total, amount_traded_last_seen,
                start_ts, first_fill_ts, last_seen_ts, last_trade_ts, active, linked_rec_id)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?6, NULL, 1, NULL)",
            params![
                offer.box_id,
                offer.status,
                offer.item_id,
                offer.price,
                offer.amount_total,
                now,
                first_fill_ts,
            ],
        )?;
        (tx.last_insert_rowid(), 0i64, None, first_fill_ts)
    } else {
        let inst = existing.unwrap();
        (
            inst.offer_id,
            inst.amount_traded_last_seen,
            inst.linked_rec_id,
            inst.first_fill_ts,
        )
    };

    if linked_rec_id.is_none() {
        let found: Option<String> = tx
            .query_row(
                "SELECT rec_id FROM recommendations
                 WHERE rec_type = ?1 AND box_id = ?2 AND item_id = ?3 AND outcome_status = 'issued'
                   AND linked_offer_id IS NULL AND issued_ts >= ?4
                 ORDER BY issued_ts DESC LIMIT 1",
                params![offer.status, offer.box_id, offer.item_id, now - REC_LINK_WINDOW_SECONDS],
                |r| r.get::<_, String>(0),
            )
            .optional()?;
        if let Some(rec_id) = found {
            tx.execute(
                "UPDATE recommendations SET linked_offer_id = ?1, outcome_status = 'linked' WHERE rec_id = ?2",
                params![offer_id, rec_id],
            )?;
            tx.execute(
                "UPDATE offer_instances SET linked_rec_id = ?1 WHERE offer_id = ?2",
                params![rec_id, offer_id],
            )?;
            linked_rec_id = Some(rec_id);
        }
    }

    let delta = offer.amount_traded - last_traded;
    if delta > 0 {
        if offer.status == "buy" {
            tx.execute(
                "INSERT INTO lots (item_id, buy_price, qty_remaining, buy_ts, buy_offer_id, buy_rec_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![offer.item_id, offer.price, delta, now, offer_id, linked_rec_id],
            )?;
            tx.execute(
                "INSERT INTO buy_fills (item_id, qty, buy_price, fill_ts, offer_id, rec_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![offer.item_id, delta, offer.price, now, offer_id, linked_rec_id],
            )?;
        } else {
            consume_fifo(tx, settings, offer.item_id, offer.price, delta, now, offer_id, &linked_rec_id)?;
        }
    }

    let first_fill_ts = first_fill_ts_existing.or(if offer.amount_traded > 0 { Some(now) } else { None });
    let new_active = offer.active && offer.amount_traded < offer.amount_total;
    tx.execute(
        "UPDATE offer_instances SET
            price = ?1, amount_total = ?2, first_fill_ts = ?3,
            last_seen_ts = ?4, amount_traded_last_seen = ?5,
            last_trade_ts = CASE WHEN ?6 > 0 THEN ?4 ELSE last_trade_ts END,
            active = ?7,
            done_ts = CASE WHEN ?7 = 0 THEN COALESCE(done_ts, ?4) ELSE done_ts END
         WHERE offer_id = ?8",
        params![
            offer.price,
            offer.amount_total,
            first_fill_ts,
            now,
            offer.amount_traded,
            delta,
            if new_active { 1 } else { 0 },
            offer_id,
        ],
    )?;

    Ok(())
}

/// Consumes open lots for `item_id` oldest-`buy_ts`-first, inserting one
/// `RealizedTrade` per lot touched and deleting lots whose remaining
/// quantity reaches zero, all within the caller's transaction.
fn consume_fifo(
    tx: &rusqlite::Transaction,
    settings: &Settings,
    item_id: i64,
    sell_price: i64,
    mut remaining: i64,
    now: i64,
    sell_offer_id: i64,
    sell_rec_id: &Option<String>,
) -> Result<()> {
    let mut stmt = tx.prepare(
        "SELECT tx_id, buy_price, qty_remaining, buy_ts, buy_rec_id
         FROM lots WHERE item_id = ?1 AND qty_remaining > 0 ORDER BY buy_ts ASC",
    )?;
    let lots: Vec<(i64, i64, i64, i64, Option<String>)> = stmt
        .query_map(params![item_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })?
        .collect::<rusqlite::Result<_>>()?;
    drop(stmt);

    for (lot_id, buy_price, qty_remaining, buy_ts, buy_rec_id) in lots {
        if remaining <= 0 {
            break;
        }
        let take = remaining.min(qty_remaining);
        let tax = seller_tax(sell_price, settings.seller_tax_rate, settings.seller_tax_cap);
        let profit = take * (sell_price - buy_price - tax);

        tx.execute(
            "INSERT INTO realized_trades
               (item_id, qty, buy_price, sell_price, buy_ts, sell_ts, profit, sell_offer_id, sell_rec_id, buy_rec_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                item_id, take, buy_price, sell_price, buy_ts, now, profit, sell_offer_id, sell_rec_id, buy_rec_id
            ],
        )?;

        let new_remaining = qty_remaining - take;
        if new_remaining <= 0 {
            tx.execute("DELETE FROM lots WHERE tx_id = ?1", params![lot_id])?;
        } else {
            tx.execute(
                "UPDATE lots SET qty_remaining = ?1 WHERE tx_id = ?2",
                params![new_remaining, lot_id],
            )?;
        }
        remaining -= take;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Ledger;

    fn test_ledger() -> Ledger {
        let dir = std::env::temp_dir().join(format!("ge_copilot_reconciler_{}_{}", std::process::id(), line!()));
        std::fs::create_dir_all(&dir).unwrap();
        let ledger = Ledger::new(dir.join("l.sqlite").to_str().unwrap()).unwrap();
        ledger.init_db().unwrap();
        ledger
    }

    fn settings() -> Settings {
        Settings::load_for_test()
    }

    #[test]
    fn buy_then_sell_at_profit() {
        let ledger = test_ledger();
        let s = settings();

        // snapshot A: open buy
        reconcile_offers(
            &ledger,
            &s,
            &[OfferIn {
                box_id: 0,
                status: "buy".into(),
                active: true,
                item_id: 1234,
                price: 100,
                amount_total: 10,
                amount_traded: 0,
                gp_to_collect: 0,
            }],
            1_000,
        )
        .unwrap();

        // snapshot B: fully traded, inactive
        reconcile_offers(
            &ledger,
            &s,
            &[OfferIn {
                box_id: 0,
                status: "buy".into(),
                active: false,
                item_id: 1234,
                price: 100,
                amount_total: 10,
                amount_traded: 10,
                gp_to_collect: 0,
            }],
            1_100,
        )
        .unwrap();

        let (lot_qty, fills, closed): (i64, i64, i64) = ledger
            .with_tx(|tx| {
                let lot_qty: i64 = tx.query_row(
                    "SELECT COALESCE(SUM(qty_remaining),0) FROM lots WHERE item_id=1234",
                    [],
                    |r| r.get(0),
                )?;
                let fills: i64 = tx.query_row("SELECT COUNT(*) FROM buy_fills WHERE item_id=1234", [], |r| r.get(0))?;
                let closed: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM offer_instances WHERE box_id=0 AND done_ts IS NOT NULL",
                    [],
                    |r| r.get(0),
                )?;
                Ok((lot_qty, fills, closed))
            })
            .unwrap();
        assert_eq!(lot_qty, 10);
        assert_eq!(fills, 1);
        assert_eq!(closed, 1);

        // snapshot C: sell opens
        reconcile_offers(
            &ledger,
            &s,
            &[OfferIn {
                box_id: 0,
                status: "sell".into(),
                active: true,
                item_id: 1234,
                price: 110,
                amount_total: 10,
                amount_traded: 0,
                gp_to_collect: 0,
            }],
            1_200,
        )
        .unwrap();
        // snapshot D: sell fully traded
        reconcile_offers(
            &ledger,
            &s,
            &[OfferIn {
                box_id: 0,
                status: "sell".into(),
                active: false,
                item_id: 1234,
                price: 110,
                amount_total: 10,
                amount_traded: 10,
                gp_to_collect: 0,
            }],
            1_300,
        )
        .unwrap();

        let (profit, remaining_lots): (i64, i64) = ledger
            .with_tx(|tx| {
                let profit: i64 = tx.query_row(
                    "SELECT COALESCE(SUM(profit),0) FROM realized_trades WHERE item_id=1234",
                    [],
                    |r| r.get(0),
                )?;
                let remaining: i64 = tx.query_row(
                    "SELECT COALESCE(SUM(qty_remaining),0) FROM lots WHERE item_id=1234",
                    [],
                    |r| r.get(0),
                )?;
                Ok((profit, remaining))
            })
            .unwrap();
        assert_eq!(profit, 80);
        assert_eq!(remaining_lots, 0);
    }

    #[test]
    fn fifo_across_two_lots() {
        let ledger = test_ledger();
        let s = settings();

        reconcile_offers(
            &ledger,
            &s,
            &[OfferIn {
                box_id: 0,
                status: "buy".into(),
                active: true,
                item_id: 55,
                price: 100,
                amount_total: 5,
                amount_traded: 5,
                gp_to_collect: 0,
            }],
            1_000,
        )
        .unwrap();

        reconcile_offers(
            &ledger,
            &s,
            &[OfferIn {
                box_id: 1,
                status: "buy".into(),
                active: true,
                item_id: 55,
                price: 120,
                amount_total: 5,
                amount_traded: 5,
                gp_to_collect: 0,
            }],
            1_010,
        )
        .unwrap();

        reconcile_offers(
            &ledger,
            &s,
            &[OfferIn {
                box_id: 2,
                status: "sell".into(),
                active: false,
                item_id: 55,
                price: 130,
                amount_total: 8,
                amount_traded: 8,
                gp_to_collect: 0,
            }],
            1_020,
        )
        .unwrap();

        let rows: Vec<(i64, i64, i64)> = ledger
            .with_tx(|tx| {
                let mut stmt = tx.prepare(
                    "SELECT qty, buy_price, profit FROM realized_trades WHERE item_id=55 ORDER BY trade_id ASC",
                )?;
                let out = stmt
                    .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(out)
            })
            .unwrap();

        assert_eq!(rows, vec![(5, 100, 140), (3, 120, 24)]);
    }
}
