//! Profit-tracking ledger (§4.7): ingests client-reported Grand Exchange
//! transactions into per-item flips, independent of the suggestion engine's
//! own lot accounting.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use crate::{
    config::Settings,
    monetary::ge_post_tax_price,
    price_cache::PriceSnapshot,
    store::Ledger,
};

const STATUS_BUYING: i64 = 0;
const STATUS_SELLING: i64 = 1;
const STATUS_FINISHED: i64 = 2;

/// SQLite silently promotes `INTEGER` arithmetic to floating point on i64
/// overflow rather than erroring, so accumulated sums (`spent`, `profit`,
/// `received_post_tax`, `tax_paid`) are computed here in a wider integer and
/// saturated before ever reaching a bound parameter.
fn sat_add(a: i64, b: i64) -> i64 {
    (a as i128 + b as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

fn sat_sub(a: i64, b: i64) -> i64 {
    (a as i128 - b as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

fn sat_mul(a: i64, b: i64) -> i64 {
    (a as i128 * b as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

#[derive(Debug, Clone)]
pub struct ClientTransaction {
    pub tx_id: String,
    pub time: i64,
    pub item_id: i64,
    pub quantity: i64, // signed: + buy, - sell
    pub price: i64,
    pub box_id: i64,
    pub amount_spent: i64,
    pub was_copilot_suggestion: bool,
    pub copilot_price_used: Option<i64>,
    pub login: Option<String>,
    pub raw_json: String,
}

/// CRC32 of the lowercased name, masked to 31 bits so it always fits a
/// positive signed 32-bit wire field; 0 is re-mapped to 1.
pub fn account_id_for(display_name: &str) -> i64 {
    let lower = display_name.to_lowercase();
    let crc = (crc32fast::hash(lower.as_bytes()) & 0x7FFF_FFFF) as i64;
    if crc == 0 {
        1
    } else {
        crc
    }
}

fn ensure_account(tx: &rusqlite::Transaction, display_name: &str, now: i64) -> Result<i64> {
    let account_id = account_id_for(display_name);
    tx.execute(
        "INSERT OR IGNORE INTO pt_accounts (display_name, account_id, created_ts) VALUES (?1, ?2, ?3)",
        params![display_name, account_id, now],
    )?;
    Ok(account_id)
}

struct OpenFlip {
    flip_uuid: String,
    opened_qty: i64,
    spent: i64,
    closed_qty: i64,
    received_post_tax: i64,
    tax_paid: i64,
}

fn find_open_flip(tx: &rusqlite::Transaction, display_name: &str, item_id: i64) -> Result<Option<OpenFlip>> {
    Ok(tx
        .query_row(
            "SELECT flip_uuid, opened_qty, spent, closed_qty, received_post_tax, tax_paid
             FROM pt_flips
             WHERE display_name = ?1 AND item_id = ?2 AND deleted = 0 AND status != ?3
             ORDER BY opened_time DESC LIMIT 1",
            params![display_name, item_id, STATUS_FINISHED],
            |r| {
                Ok(OpenFlip {
                    flip_uuid: r.get(0)?,
                    opened_qty: r.get(1)?,
                    spent: r.get(2)?,
                    closed_qty: r.get(3)?,
                    received_post_tax: r.get(4)?,
                    tax_paid: r.get(5)?,
                })
            },
        )
        .optional()?)
}

fn cost_basis(tx: &rusqlite::Transaction, item_id: i64, snapshot: Option<&PriceSnapshot>, sell_price: i64) -> Result<i64> {
    let from_lots: Option<f64> = {
        let rows: Vec<(i64, i64)> = {
            let mut stmt = tx.prepare("SELECT buy_price, qty_remaining FROM lots WHERE item_id = ?1 AND qty_remaining > 0")?;
            stmt.query_map(params![item_id], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?
        };
        let total_qty: i64 = rows.iter().map(|(_, q)| q).sum();
        if total_qty > 0 {
            let weighted: f64 = rows.iter().map(|(p, q)| (*p * *q) as f64).sum();
            Some(weighted / total_qty as f64)
        } else {
            None
        }
    };
    if let Some(basis) = from_lots {
        return Ok(basis as i64);
    }

    let from_fill: Option<i64> = tx
        .query_row(
            "SELECT buy_price FROM buy_fills WHERE item_id = ?1 ORDER BY fill_ts DESC LIMIT 1",
            params![item_id],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(basis) = from_fill {
        return Ok(basis);
    }

    if let Some(snap) = snapshot {
        if let Some(q) = snap.quote(item_id) {
            if let Some(low) = q.low {
                if low > 0 {
                    return Ok(low);
                }
            }
            if let Some(high) = q.high {
                if high > 0 {
                    return Ok(high);
                }
            }
        }
    }

    Ok(sell_price)
}

pub fn ingest(
    ledger: &Ledger,
    settings: &Settings,
    snapshot: &PriceSnapshot,
    display_name: &str,
    mut txs: Vec<ClientTransaction>,
    now: i64,
) -> Result<()> {
    txs.sort_by_key(|t| t.time);

    ledger.with_tx(|tx| {
        let account_id = ensure_account(tx, display_name, now)?;

        for t in txs {
            let exists: bool = tx
                .query_row("SELECT 1 FROM pt_transactions WHERE tx_id = ?1", params![t.tx_id], |_| Ok(()))
                .optional()?
                .is_some();
            if exists {
                continue;
            }

            let flip = find_open_flip(tx, display_name, t.item_id)?;
            let flip_uuid = match &flip {
                Some(f) => f.flip_uuid.clone(),
                None => uuid::Uuid::new_v4().to_string(),
            };

            if flip.is_none() {
                tx.execute(
                    "INSERT INTO pt_flips
                       (flip_uuid, display_name, account_id, item_id, opened_time, opened_qty, spent,
                        closed_qty, received_post_tax, profit, tax_paid, status, updated_time, deleted)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, 0, 0, 0, 0, ?6, ?5, 0)",
                    params![flip_uuid, display_name, account_id, t.item_id, t.time, STATUS_BUYING],
                )?;
            }

            if t.quantity > 0 {
                apply_buy(tx, &flip_uuid, t.quantity, t.price, t.time)?;
            } else if t.quantity < 0 {
                let sell_qty = -t.quantity;
                apply_sell(tx, settings, snapshot, &flip_uuid, t.item_id, sell_qty, t.price, t.time)?;
            }

            tx.execute(
                "INSERT INTO pt_transactions
                   (tx_id, display_name, account_id, flip_uuid, time, item_id, quantity, price, box_id,
                    amount_spent, was_copilot_suggestion, copilot_price_used, login, raw_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    t.tx_id,
                    display_name,
                    account_id,
                    flip_uuid,
                    t.time,
                    t.item_id,
                    t.quantity,
                    t.price,
                    t.box_id,
                    t.amount_spent,
                    t.was_copilot_suggestion,
                    t.copilot_price_used,
                    t.login,
                    t.raw_json,
                ],
            )?;
        }

        Ok(())
    })
}

fn apply_buy(tx: &rusqlite::Transaction, flip_uuid: &str, qty: i64, price: i64, now: i64) -> Result<()> {
    let (opened_qty, spent, closed_qty, status): (i64, i64, i64, i64) = tx.query_row(
        "SELECT opened_qty, spent, closed_qty, status FROM pt_flips WHERE flip_uuid = ?1",
        params![flip_uuid],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
    )?;

    let new_opened_qty = sat_add(opened_qty, qty);
    let new_spent = sat_add(spent, sat_mul(qty, price));
    let new_status = if status == STATUS_FINISHED {
        STATUS_FINISHED
    } else if closed_qty == 0 {
        STATUS_BUYING
    } else {
        STATUS_SELLING
    };

    tx.execute(
        "UPDATE pt_flips SET opened_qty = ?1, spent = ?2, status = ?3, updated_time = ?4 WHERE flip_uuid = ?5",
        params![new_opened_qty, new_spent, new_status, now, flip_uuid],
    )?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn apply_sell(
    tx: &rusqlite::Transaction,
    settings: &Settings,
    snapshot: &PriceSnapshot,
    flip_uuid: &str,
    item_id: i64,
    sell_qty: i64,
    price: i64,
    now: i64,
) -> Result<()> {
    let (mut opened_qty, mut spent, closed_qty): (i64, i64, i64) = tx.query_row(
        "SELECT opened_qty, spent, closed_qty FROM pt_flips WHERE flip_uuid = ?1",
        params![flip_uuid],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )?;

    let available = opened_qty - closed_qty;
    if sell_qty > available {
        let shortfall = sell_qty - available;
        let basis = cost_basis(tx, item_id, Some(snapshot), price)?;
        opened_qty = sat_add(opened_qty, shortfall);
        spent = sat_add(spent, sat_mul(shortfall, basis));
        tx.execute(
            "UPDATE pt_flips SET opened_qty = ?1, spent = ?2 WHERE flip_uuid = ?3",
            params![opened_qty, spent, flip_uuid],
        )?;
    }

    let (received_post_tax, tax_paid): (i64, i64) = tx.query_row(
        "SELECT received_post_tax, tax_paid FROM pt_flips WHERE flip_uuid = ?1",
        params![flip_uuid],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;

    let post_tax_price = ge_post_tax_price(item_id, price, settings.seller_tax_rate);
    let per_tax = price - post_tax_price;
    let received_delta = sat_mul(sell_qty, post_tax_price);
    let tax_paid_delta = sat_mul(sell_qty, per_tax);

    let new_received_post_tax = sat_add(received_post_tax, received_delta);
    let new_tax_paid = sat_add(tax_paid, tax_paid_delta);
    let new_closed_qty = sat_add(closed_qty, sell_qty);
    let new_profit = sat_sub(new_received_post_tax, spent);
    let status = if new_closed_qty >= opened_qty { STATUS_FINISHED } else { STATUS_SELLING };

    tx.execute(
        "UPDATE pt_flips SET
            received_post_tax = ?1,
            tax_paid = ?2,
            closed_qty = ?3,
            closed_time = ?4,
            profit = ?5,
            status = ?6,
            updated_time = ?4
         WHERE flip_uuid = ?7",
        params![new_received_post_tax, new_tax_paid, new_closed_qty, now, new_profit, status, flip_uuid],
    )?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct FlipRow {
    pub flip_uuid: String,
    pub display_name: String,
    pub account_id: i64,
    pub item_id: i64,
    pub opened_time: i64,
    pub opened_qty: i64,
    pub spent: i64,
    pub closed_time: Option<i64>,
    pub closed_qty: i64,
    pub received_post_tax: i64,
    pub profit: i64,
    pub tax_paid: i64,
    pub status: i64,
    pub updated_time: i64,
    pub deleted: bool,
}

fn row_to_flip(r: &rusqlite::Row) -> rusqlite::Result<FlipRow> {
    Ok(FlipRow {
        flip_uuid: r.get(0)?,
        display_name: r.get(1)?,
        account_id: r.get(2)?,
        item_id: r.get(3)?,
        opened_time: r.get(4)?,
        opened_qty: r.get(5)?,
        spent: r.get(6)?,
        closed_time: r.get(7)?,
        closed_qty: r.get(8)?,
        received_post_tax: r.get(9)?,
        profit: r.get(10)?,
        tax_paid: r.get(11)?,
        status: r.get(12)?,
        updated_time: r.get(13)?,
        deleted: r.get::<_, i64>(14)? != 0,
    })
}

const FLIP_COLUMNS: &str = "flip_uuid, display_name, account_id, item_id, opened_time, opened_qty, spent, \
     closed_time, closed_qty, received_post_tax, profit, tax_paid, status, updated_time, deleted";

/// Returns `(new_time, flips)`: flips updated after `last_time` for any
/// account present in `account_id_time`, alongside the caller-supplied
/// current time the client should remember as its new watermark.
pub fn flips_delta(ledger: &Ledger, account_id_time: &[(i64, i64)], now: i64) -> Result<(i64, Vec<FlipRow>)> {
    let flips = ledger.with_tx(|tx| {
        let mut out = Vec::new();
        for &(account_id, last_time) in account_id_time {
            let mut stmt = tx.prepare(&format!(
                "SELECT {FLIP_COLUMNS} FROM pt_flips WHERE account_id = ?1 AND updated_time > ?2"
            ))?;
            let rows = stmt.query_map(params![account_id, last_time], row_to_flip)?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    })?;
    Ok((now, flips))
}

pub fn orphan_transaction(ledger: &Ledger, settings: &Settings, tx_id: &str, now: i64) -> Result<Option<FlipRow>> {
    ledger.with_tx(|tx| {
        let row: Option<(String, i64, i64, i64, i64, i64)> = tx
            .query_row(
                "SELECT display_name, account_id, item_id, time, quantity, price FROM pt_transactions WHERE tx_id = ?1",
                params![tx_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
            )
            .optional()?;
        let Some((display_name, account_id, item_id, time, quantity, price)) = row else {
            return Ok(None);
        };

        let new_flip_uuid = uuid::Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO pt_flips
               (flip_uuid, display_name, account_id, item_id, opened_time, opened_qty, spent,
                closed_qty, received_post_tax, profit, tax_paid, status, updated_time, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, 0, 0, 0, 0, ?6, ?5, 0)",
            params![new_flip_uuid, display_name, account_id, item_id, time, STATUS_BUYING],
        )?;
        tx.execute(
            "UPDATE pt_transactions SET flip_uuid = ?1 WHERE tx_id = ?2",
            params![new_flip_uuid, tx_id],
        )?;

        if quantity > 0 {
            apply_buy(tx, &new_flip_uuid, quantity, price, now)?;
        } else if quantity < 0 {
            let basis = cost_basis(tx, item_id, None, price)?;
            let sell_qty = -quantity;
            let spent = sat_mul(sell_qty, basis);
            tx.execute(
                "UPDATE pt_flips SET opened_qty = ?1, spent = ?2 WHERE flip_uuid = ?3",
                params![sell_qty, spent, new_flip_uuid],
            )?;
            let post_tax_price = ge_post_tax_price(item_id, price, settings.seller_tax_rate);
            let per_tax = price - post_tax_price;
            let received_post_tax = sat_mul(sell_qty, post_tax_price);
            let tax_paid = sat_mul(sell_qty, per_tax);
            let profit = sat_sub(received_post_tax, spent);
            tx.execute(
                "UPDATE pt_flips SET
                    received_post_tax = ?1, tax_paid = ?2, closed_qty = ?3, closed_time = ?4,
                    profit = ?5, status = ?6, updated_time = ?4
                 WHERE flip_uuid = ?7",
                params![received_post_tax, tax_paid, sell_qty, now, profit, STATUS_FINISHED, new_flip_uuid],
            )?;
        }

        let flip = tx.query_row(
            &format!("SELECT {FLIP_COLUMNS} FROM pt_flips WHERE flip_uuid = ?1"),
            params![new_flip_uuid],
            row_to_flip,
        )?;
        Ok(Some(flip))
    })
}

pub fn delete_transaction(ledger: &Ledger, tx_id: &str) -> Result<()> {
    ledger.with_tx(|tx| {
        tx.execute("DELETE FROM pt_transactions WHERE tx_id = ?1", params![tx_id])?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_ledger() -> Ledger {
        let dir = std::env::temp_dir().join(format!("ge_copilot_pt_{}_{}", std::process::id(), line!()));
        std::fs::create_dir_all(&dir).unwrap();
        let ledger = Ledger::new(dir.join("l.sqlite").to_str().unwrap()).unwrap();
        ledger.init_db().unwrap();
        ledger
    }

    fn empty_snapshot() -> PriceSnapshot {
        PriceSnapshot {
            metadata: HashMap::new(),
            latest: HashMap::new(),
            volumes: HashMap::new(),
            last_refresh_ts: 0,
        }
    }

    #[test]
    fn ingest_buy_then_sell_finishes_flip() {
        let ledger = test_ledger();
        let settings = Settings::load_for_test();
        let snap = empty_snapshot();

        let txs = vec![
            ClientTransaction {
                tx_id: "A".into(),
                time: 1000,
                item_id: 7,
                quantity: 5,
                price: 100,
                box_id: 1,
                amount_spent: 500,
                was_copilot_suggestion: false,
                copilot_price_used: None,
                login: None,
                raw_json: "{}".into(),
            },
            ClientTransaction {
                tx_id: "B".into(),
                time: 1010,
                item_id: 7,
                quantity: -5,
                price: 110,
                box_id: 1,
                amount_spent: 550,
                was_copilot_suggestion: false,
                copilot_price_used: None,
                login: None,
                raw_json: "{}".into(),
            },
        ];
        ingest(&ledger, &settings, &snap, "alice", txs, 2000).unwrap();

        let (opened_qty, spent, closed_qty, received, tax_paid, profit, status): (i64, i64, i64, i64, i64, i64, i64) = ledger
            .with_tx(|tx| {
                Ok(tx.query_row(
                    "SELECT opened_qty, spent, closed_qty, received_post_tax, tax_paid, profit, status FROM pt_flips WHERE display_name='alice' AND item_id=7",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?, r.get(6)?)),
                )?)
            })
            .unwrap();

        assert_eq!(opened_qty, 5);
        assert_eq!(spent, 500);
        assert_eq!(closed_qty, 5);
        assert_eq!(received, 540);
        assert_eq!(tax_paid, 10);
        assert_eq!(profit, 40);
        assert_eq!(status, STATUS_FINISHED);
    }

    #[test]
    fn duplicate_tx_id_is_ignored() {
        let ledger = test_ledger();
        let settings = Settings::load_for_test();
        let snap = empty_snapshot();
        let tx = ClientTransaction {
            tx_id: "A".into(),
            time: 1000,
            item_id: 7,
            quantity: 5,
            price: 100,
            box_id: 1,
            amount_spent: 500,
            was_copilot_suggestion: false,
            copilot_price_used: None,
            login: None,
            raw_json: "{}".into(),
        };
        ingest(&ledger, &settings, &snap, "alice", vec![tx.clone()], 2000).unwrap();
        ingest(&ledger, &settings, &snap, "alice", vec![tx], 2000).unwrap();

        let count: i64 = ledger
            .with_tx(|tx| Ok(tx.query_row("SELECT COUNT(*) FROM pt_transactions", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn account_id_never_zero() {
        assert_ne!(account_id_for(""), 0);
    }
}
