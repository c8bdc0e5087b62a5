//! Durable ledger store and schema migration (§4.3).
//!
//! `rusqlite::Connection` is not `Send`/`Sync`; like the donor's
//! `SqliteStore`, `Ledger` keeps only a path and opens a short-lived
//! connection per operation. Unlike the donor, every mutating (and,
//! per §5, every reading) operation also acquires a process-wide write
//! lock and runs inside one transaction, since multi-row effects here
//! must be atomic.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::Connection;

#[derive(Clone)]
pub struct Ledger {
    path: String,
    write_lock: Arc<Mutex<()>>,
}

impl Ledger {
    pub fn new(path: &str) -> Result<Self> {
        if path.trim().is_empty() {
            anyhow::bail!("DB_PATH is empty");
        }
        if path != ":memory:" && !path.starts_with("file:") {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("create sqlite parent dir for {path}"))?;
                }
            }
        }
        Ok(Self {
            path: path.to_string(),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn open_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).with_context(|| format!("open sqlite {}", self.path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
        Ok(conn)
    }

    /// Runs `f` inside a single transaction, guarded by the process-wide
    /// write lock. Reads go through this too (§4.3, §5): simplicity over
    /// throughput, given the localhost / modest-concurrency usage profile.
    pub fn with_tx<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&rusqlite::Transaction) -> Result<R>,
    {
        let _guard = self.write_lock.lock();
        let mut conn = self.open_conn()?;
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn init_db(&self) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS offer_instances (
  offer_id INTEGER PRIMARY KEY AUTOINCREMENT,
  box_id INTEGER NOT NULL,
  status TEXT NOT NULL,
  item_id INTEGER NOT NULL,
  price INTEGER NOT NULL,
  amount_total INTEGER NOT NULL,
  amount_traded_last_seen INTEGER NOT NULL DEFAULT 0,
  start_ts INTEGER NOT NULL,
  first_fill_ts INTEGER,
  done_ts INTEGER,
  last_seen_ts INTEGER NOT NULL,
  last_trade_ts INTEGER,
  active INTEGER NOT NULL DEFAULT 1,
  linked_rec_id TEXT
);

CREATE TABLE IF NOT EXISTS buy_fills (
  fill_id INTEGER PRIMARY KEY AUTOINCREMENT,
  item_id INTEGER NOT NULL,
  qty INTEGER NOT NULL,
  buy_price INTEGER NOT NULL,
  fill_ts INTEGER NOT NULL,
  offer_id INTEGER NOT NULL,
  rec_id TEXT
);

CREATE TABLE IF NOT EXISTS lots (
  tx_id INTEGER PRIMARY KEY AUTOINCREMENT,
  item_id INTEGER NOT NULL,
  buy_price INTEGER NOT NULL,
  qty_remaining INTEGER NOT NULL,
  buy_ts INTEGER NOT NULL,
  buy_offer_id INTEGER NOT NULL,
  buy_rec_id TEXT
);

CREATE TABLE IF NOT EXISTS realized_trades (
  trade_id INTEGER PRIMARY KEY AUTOINCREMENT,
  item_id INTEGER NOT NULL,
  qty INTEGER NOT NULL,
  buy_price INTEGER NOT NULL,
  sell_price INTEGER NOT NULL,
  buy_ts INTEGER NOT NULL,
  sell_ts INTEGER NOT NULL,
  profit INTEGER NOT NULL,
  sell_offer_id INTEGER NOT NULL,
  sell_rec_id TEXT,
  buy_rec_id TEXT
);

CREATE TABLE IF NOT EXISTS recommendations (
  rec_id TEXT PRIMARY KEY,
  issued_ts INTEGER NOT NULL,
  rec_type TEXT NOT NULL,
  box_id INTEGER NOT NULL,
  item_id INTEGER NOT NULL,
  price INTEGER NOT NULL,
  qty INTEGER NOT NULL,
  expected_profit INTEGER NOT NULL DEFAULT 0,
  expected_duration REAL NOT NULL DEFAULT 0,
  note TEXT NOT NULL DEFAULT '',
  linked_offer_id INTEGER,
  outcome_status TEXT NOT NULL DEFAULT 'issued',
  buy_first_fill_ts INTEGER,
  buy_done_ts INTEGER,
  buy_phase_seconds REAL,
  realized_profit INTEGER,
  realized_cost INTEGER,
  realized_roi REAL,
  realized_vs_expected REAL,
  sell_phase_seconds REAL,
  closed_ts INTEGER
);

CREATE TABLE IF NOT EXISTS pt_accounts (
  display_name TEXT PRIMARY KEY,
  account_id INTEGER NOT NULL UNIQUE,
  created_ts INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS pt_flips (
  flip_uuid TEXT PRIMARY KEY,
  display_name TEXT NOT NULL,
  account_id INTEGER NOT NULL,
  item_id INTEGER NOT NULL,
  opened_time INTEGER NOT NULL,
  opened_qty INTEGER NOT NULL DEFAULT 0,
  spent INTEGER NOT NULL DEFAULT 0,
  closed_time INTEGER,
  closed_qty INTEGER NOT NULL DEFAULT 0,
  received_post_tax INTEGER NOT NULL DEFAULT 0,
  profit INTEGER NOT NULL DEFAULT 0,
  tax_paid INTEGER NOT NULL DEFAULT 0,
  status INTEGER NOT NULL DEFAULT 0,
  updated_time INTEGER NOT NULL,
  deleted INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS pt_transactions (
  tx_id TEXT PRIMARY KEY,
  display_name TEXT NOT NULL,
  account_id INTEGER NOT NULL,
  flip_uuid TEXT NOT NULL,
  time INTEGER NOT NULL,
  item_id INTEGER NOT NULL,
  quantity INTEGER NOT NULL,
  price INTEGER NOT NULL,
  box_id INTEGER NOT NULL DEFAULT 0,
  amount_spent INTEGER NOT NULL DEFAULT 0,
  was_copilot_suggestion INTEGER NOT NULL DEFAULT 0,
  copilot_price_used INTEGER,
  login TEXT,
  raw_json TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_offer_box_done ON offer_instances(box_id, done_ts);
CREATE INDEX IF NOT EXISTS idx_offer_item_done ON offer_instances(item_id, done_ts);
CREATE INDEX IF NOT EXISTS idx_lots_item_qty_ts ON lots(item_id, qty_remaining, buy_ts);
CREATE INDEX IF NOT EXISTS idx_fills_item_ts ON buy_fills(item_id, fill_ts);
CREATE INDEX IF NOT EXISTS idx_realized_sell_ts ON realized_trades(sell_ts);
CREATE INDEX IF NOT EXISTS idx_realized_item_ts ON realized_trades(item_id, sell_ts);
CREATE INDEX IF NOT EXISTS idx_rec_item_issued ON recommendations(item_id, issued_ts);
CREATE INDEX IF NOT EXISTS idx_rec_type_box_issued ON recommendations(rec_type, box_id, issued_ts);
CREATE INDEX IF NOT EXISTS idx_pt_flips_account_updated ON pt_flips(account_id, updated_time);
CREATE INDEX IF NOT EXISTS idx_pt_tx_display_time ON pt_transactions(display_name, time);
"#,
        )?;

        // Idempotent column backfill: a column present in CREATE TABLE above
        // is a no-op here; this only matters against a database created by
        // an older schema revision, and must never destroy history.
        for (table, column, decl) in [
            ("offer_instances", "linked_rec_id", "TEXT"),
            ("recommendations", "closed_ts", "INTEGER"),
            ("pt_flips", "deleted", "INTEGER NOT NULL DEFAULT 0"),
        ] {
            ensure_column(&conn, table, column, decl)?;
        }

        Ok(())
    }
}

fn ensure_column(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(|r| r.ok())
        .any(|name| name == column);
    if !exists {
        conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"), [])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_db_is_idempotent() {
        let dir = std::env::temp_dir().join(format!("ge_copilot_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ledger.sqlite");
        let ledger = Ledger::new(path.to_str().unwrap()).unwrap();
        ledger.init_db().unwrap();
        ledger.init_db().unwrap();

        ledger
            .with_tx(|tx| {
                tx.execute(
                    "INSERT INTO recommendations(rec_id, issued_ts, rec_type, box_id, item_id, price, qty) VALUES (?,?,?,?,?,?,?)",
                    rusqlite::params!["r1", 100, "buy", 0, 1234, 100, 10],
                )?;
                Ok(())
            })
            .unwrap();

        let count: i64 = ledger
            .with_tx(|tx| Ok(tx.query_row("SELECT COUNT(*) FROM recommendations", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 1);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
