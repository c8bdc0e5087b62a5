//! Recommendation lifecycle tracker (§4.5): records issued actions and rolls
//! up fills/lots/realized trades into each recommendation's outcome.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use crate::{
    config::Settings,
    store::Ledger,
    types::{Action, ActionType},
};

/// Inserts a row for a just-issued action. Idempotent on `rec_id`.
pub fn record(ledger: &Ledger, action: &Action) -> Result<()> {
    ledger.with_tx(|tx| {
        tx.execute(
            "INSERT OR IGNORE INTO recommendations
               (rec_id, issued_ts, rec_type, box_id, item_id, price, qty, expected_profit, expected_duration, note)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                action.rec_id,
                action.issued_unix,
                action.action_type.as_str(),
                action.box_id,
                action.item_id,
                action.price,
                action.quantity,
                action.expected_profit,
                action.expected_duration,
                action.note,
            ],
        )?;
        Ok(())
    })
}

pub fn should_throttle_abort(ledger: &Ledger, box_id: i64, now: i64, cooldown_seconds: i64) -> Result<bool> {
    ledger.with_tx(|tx| {
        let last: Option<i64> = tx
            .query_row(
                "SELECT issued_ts FROM recommendations WHERE rec_type = 'abort' AND box_id = ?1
                 ORDER BY issued_ts DESC LIMIT 1",
                params![box_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(match last {
            Some(ts) => now - ts < cooldown_seconds,
            None => false,
        })
    })
}

pub fn update_outcomes(ledger: &Ledger, settings: &Settings, now: i64) -> Result<()> {
    ledger.with_tx(|tx| {
        tx.execute(
            "UPDATE recommendations SET outcome_status = 'failed_no_fill', closed_ts = ?1
             WHERE rec_type = 'buy' AND outcome_status IN ('issued', 'linked')
               AND buy_first_fill_ts IS NULL AND (?1 - issued_ts) >= ?2",
            params![now, settings.buy_rec_timeout_seconds],
        )?;

        let rec_ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT rec_id FROM recommendations
                 WHERE rec_type = 'buy' AND outcome_status NOT IN ('completed', 'failed_no_fill', 'failed_cancelled')",
            )?;
            stmt.query_map([], |r| r.get::<_, String>(0))?
                .collect::<rusqlite::Result<_>>()?
        };

        for rec_id in rec_ids {
            update_one_outcome(tx, &rec_id)?;
        }

        let linked_ids: Vec<(String, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT rec_id, linked_offer_id FROM recommendations
                 WHERE rec_type = 'buy' AND linked_offer_id IS NOT NULL AND buy_phase_seconds IS NULL",
            )?;
            stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?
        };

        for (rec_id, offer_id) in linked_ids {
            backfill_buy_phase(tx, &rec_id, offer_id)?;
        }

        Ok(())
    })
}

fn update_one_outcome(tx: &rusqlite::Transaction, rec_id: &str) -> Result<()> {
    let expected_profit: f64 = tx.query_row(
        "SELECT expected_profit FROM recommendations WHERE rec_id = ?1",
        params![rec_id],
        |r| r.get(0),
    )?;

    let bought_qty: i64 = tx
        .query_row(
            "SELECT COALESCE(SUM(qty), 0) FROM buy_fills WHERE rec_id = ?1",
            params![rec_id],
            |r| r.get(0),
        )
        .unwrap_or(0);

    let remaining: i64 = tx
        .query_row(
            "SELECT COALESCE(SUM(qty_remaining), 0) FROM lots WHERE buy_rec_id = ?1",
            params![rec_id],
            |r| r.get(0),
        )
        .unwrap_or(0);

    let (realized_profit, realized_cost, first_sell_ts, last_sell_ts): (i64, i64, Option<i64>, Option<i64>) = tx
        .query_row(
            "SELECT COALESCE(SUM(profit), 0), COALESCE(SUM(qty * buy_price), 0), MIN(sell_ts), MAX(sell_ts)
             FROM realized_trades WHERE buy_rec_id = ?1",
            params![rec_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .unwrap_or((0, 0, None, None));

    if bought_qty == 0 {
        return Ok(());
    }

    let realized_roi = if realized_cost > 0 {
        Some(realized_profit as f64 / realized_cost as f64)
    } else {
        None
    };
    let realized_vs_expected = if expected_profit > 0.0 {
        Some(realized_profit as f64 / expected_profit)
    } else {
        None
    };
    let sell_phase_seconds = match (first_sell_ts, last_sell_ts) {
        (Some(f), Some(l)) => Some((l - f) as f64),
        _ => None,
    };

    tx.execute(
        "UPDATE recommendations SET
            realized_profit = ?1, realized_cost = ?2, realized_roi = ?3,
            realized_vs_expected = ?4, sell_phase_seconds = ?5
         WHERE rec_id = ?6",
        params![
            realized_profit,
            realized_cost,
            realized_roi,
            realized_vs_expected,
            sell_phase_seconds,
            rec_id,
        ],
    )?;

    if remaining <= 0 && last_sell_ts.is_some() {
        tx.execute(
            "UPDATE recommendations SET outcome_status = 'completed', closed_ts = ?1 WHERE rec_id = ?2",
            params![last_sell_ts, rec_id],
        )?;
    }

    Ok(())
}

fn backfill_buy_phase(tx: &rusqlite::Transaction, rec_id: &str, offer_id: i64) -> Result<()> {
    let row: Option<(Option<i64>, Option<i64>)> = tx
        .query_row(
            "SELECT first_fill_ts, done_ts FROM offer_instances WHERE offer_id = ?1",
            params![offer_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;

    let Some((first_fill_ts, done_ts)) = row else {
        return Ok(());
    };

    let Some(first_fill_ts) = first_fill_ts else {
        return Ok(());
    };

    let buy_phase_seconds = done_ts.map(|d| (d - first_fill_ts) as f64);
    let next_status = if done_ts.is_some() { "buy_done" } else { "buy_started" };

    tx.execute(
        "UPDATE recommendations SET
            buy_first_fill_ts = ?1, buy_done_ts = ?2, buy_phase_seconds = ?3,
            outcome_status = CASE WHEN outcome_status IN ('issued', 'linked') THEN ?4 ELSE outcome_status END
         WHERE rec_id = ?5",
        params![first_fill_ts, done_ts, buy_phase_seconds, next_status, rec_id],
    )?;

    Ok(())
}
