//! HTTP transport (§6): axum router and handlers for every endpoint except
//! the dashboard HTML/log-tail surface, which lives with a separate
//! collaborator and is out of scope here.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use log::{error, warn};
use rusqlite::OptionalExtension;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tower_http::cors::CorsLayer;

use crate::{
    config::Settings,
    price_cache::PriceCache,
    profit_tracking::{self, ClientTransaction},
    store::Ledger,
    suggestion,
    trend_cache::TrendCache,
    types::{Action, ItemPriceWire, StatusRequest},
    utils::now_ts,
    wire::{self, AckedTransaction},
};

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub ledger: Ledger,
    pub price_cache: PriceCache,
    pub trend_cache: std::sync::Arc<TrendCache>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/suggestion", post(post_suggestion))
        .route("/prices", get(get_prices).post(post_prices))
        .route("/profit-tracking/rs-account-names", get(rs_account_names))
        .route(
            "/profit-tracking/account-client-transactions",
            post(account_client_transactions),
        )
        .route(
            "/profit-tracking/client-transactions",
            post(post_client_transactions).get(get_client_transactions),
        )
        .route("/profit-tracking/client-flips-delta", post(client_flips_delta))
        .route("/profit-tracking/orphan-transaction", post(orphan_transaction))
        .route("/profit-tracking/delete-transaction", post(delete_transaction))
        .route("/profit-tracking/visualize-flip", post(visualize_flip))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn wants_msgpack(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("msgpack"))
        .unwrap_or(false)
}

async fn post_suggestion(State(st): State<AppState>, headers: HeaderMap, Json(req): Json<StatusRequest>) -> Response {
    let now = now_ts();
    let snapshot = st.price_cache.snapshot();

    let action = match suggestion::suggest(&st.ledger, &st.settings, &snapshot, &st.trend_cache, &req, now).await {
        Ok(a) => a,
        Err(e) => {
            error!("suggestion: internal error request_id={now}: {e:#}");
            Action::wait(now, uuid::Uuid::new_v4().to_string(), "server issue — check log")
        }
    };

    if wants_msgpack(&headers) {
        match wire::encode_action_msgpack(&action) {
            Ok(body) => {
                let len = body.len();
                let mut resp = (StatusCode::OK, body).into_response();
                resp.headers_mut().insert(
                    "X-SUGGESTION-CONTENT-LENGTH",
                    HeaderValue::from_str(&len.to_string()).unwrap(),
                );
                resp.headers_mut()
                    .insert("X-GRAPH-DATA-CONTENT-LENGTH", HeaderValue::from_static("0"));
                resp
            }
            Err(e) => {
                error!("suggestion: msgpack encode failed: {e:#}");
                Json(action.to_json()).into_response()
            }
        }
    } else {
        Json(action.to_json()).into_response()
    }
}

#[derive(Deserialize, Default)]
struct PricesQuery {
    item_id: Option<i64>,
}

#[derive(Deserialize, Default)]
struct PricesBody {
    item_id: Option<i64>,
}

fn item_price_response(state: &AppState, item_id: Option<i64>) -> Response {
    let Some(item_id) = item_id else {
        return (StatusCode::BAD_REQUEST, "item_id is required").into_response();
    };
    let snapshot = state.price_cache.snapshot();
    let wire = match snapshot.quote(item_id) {
        Some(q) if q.low.is_some() || q.high.is_some() => ItemPriceWire {
            bp: q.low.unwrap_or(0),
            sp: q.high.unwrap_or(0),
            m: String::new(),
        },
        _ => ItemPriceWire {
            bp: 0,
            sp: 0,
            m: "No price data".into(),
        },
    };
    match wire::encode_item_price_msgpack(&wire) {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => {
            error!("prices: msgpack encode failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "encode failed").into_response()
        }
    }
}

async fn get_prices(State(st): State<AppState>, Query(q): Query<PricesQuery>) -> Response {
    item_price_response(&st, q.item_id)
}

async fn post_prices(State(st): State<AppState>, Json(body): Json<PricesBody>) -> Response {
    item_price_response(&st, body.item_id)
}

async fn rs_account_names(State(st): State<AppState>) -> Response {
    let result = st.ledger.with_tx(|tx| {
        let mut stmt = tx.prepare("SELECT display_name, account_id FROM pt_accounts")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        let mut out = serde_json::Map::new();
        for row in rows {
            let (name, id) = row?;
            out.insert(name, json!(id));
        }
        Ok(out)
    });
    match result {
        Ok(map) => Json(JsonValue::Object(map)).into_response(),
        Err(e) => {
            error!("rs_account_names: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "db error").into_response()
        }
    }
}

#[derive(Deserialize)]
struct DisplayNameQuery {
    display_name: String,
}

#[derive(Deserialize, Default)]
struct AccountTxQuery {
    limit: Option<i64>,
    end: Option<i64>,
}

async fn account_client_transactions(
    State(st): State<AppState>,
    Query(dn): Query<DisplayNameQuery>,
    body: Bytes,
) -> Response {
    let opts: AccountTxQuery = serde_json::from_slice(&body).unwrap_or_default();
    let limit = opts.limit.unwrap_or(200).clamp(0, 5000);
    let end = opts.end.unwrap_or(i64::MAX);

    let result = st.ledger.with_tx(|tx| {
        let mut stmt = tx.prepare(
            "SELECT tx_id, flip_uuid, account_id, time, item_id, quantity, price, amount_spent
             FROM pt_transactions WHERE display_name = ?1 AND time <= ?2 ORDER BY time DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(rusqlite::params![dn.display_name, end, limit], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, i64>(4)?,
                r.get::<_, i64>(5)?,
                r.get::<_, i64>(6)?,
                r.get::<_, i64>(7)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    });

    match result {
        Ok(rows) => {
            let records: Vec<Vec<u8>> = rows
                .into_iter()
                .filter_map(|(tx_id, flip_uuid, account_id, time, item_id, quantity, price, amount_spent)| {
                    let tx_uuid = uuid::Uuid::parse_str(&tx_id).ok()?;
                    let flip_uuid = uuid::Uuid::parse_str(&flip_uuid).ok()?;
                    Some(wire::pack_acked_transaction(&AckedTransaction {
                        tx_uuid,
                        flip_uuid,
                        account_id,
                        time,
                        item_id,
                        quantity,
                        price,
                        amount_spent,
                    }))
                })
                .map(|b| b.to_vec())
                .collect();
            (StatusCode::OK, wire::pack_record_list(&records)).into_response()
        }
        Err(e) => {
            error!("account_client_transactions: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "db error").into_response()
        }
    }
}

fn parse_raw_transactions(body: &JsonValue) -> Vec<ClientTransaction> {
    let Some(arr) = body.as_array() else {
        return Vec::new();
    };
    arr.iter()
        .filter_map(|v| {
            let tx_id = v.get("id").and_then(|x| x.as_str())?.to_string();
            let time = v.get("time").and_then(|x| x.as_i64())?;
            let item_id = v.get("item_id").and_then(|x| x.as_i64())?;
            let quantity = v.get("quantity").and_then(|x| x.as_i64())?;
            let price = v.get("price").and_then(|x| x.as_i64())?;
            let box_id = v.get("box_id").and_then(|x| x.as_i64()).unwrap_or(0);
            let amount_spent = v.get("amount_spent").and_then(|x| x.as_i64()).unwrap_or(0);
            let was_copilot_suggestion = v.get("was_copilot_suggestion").and_then(|x| x.as_bool()).unwrap_or(false);
            let copilot_price_used = v.get("copilot_price_used").and_then(|x| x.as_i64());
            let login = v.get("login").and_then(|x| x.as_str()).map(str::to_string);
            Some(ClientTransaction {
                tx_id,
                time,
                item_id,
                quantity,
                price,
                box_id,
                amount_spent,
                was_copilot_suggestion,
                copilot_price_used,
                login,
                raw_json: v.to_string(),
            })
        })
        .collect()
}

async fn post_client_transactions(
    State(st): State<AppState>,
    Query(dn): Query<DisplayNameQuery>,
    Json(body): Json<JsonValue>,
) -> Response {
    let txs = parse_raw_transactions(&body);
    let now = now_ts();
    let snapshot = st.price_cache.snapshot();

    if let Err(e) = profit_tracking::ingest(&st.ledger, &st.settings, &snapshot, &dn.display_name, txs.clone(), now) {
        error!("client_transactions ingest: {e:#}");
        return (StatusCode::INTERNAL_SERVER_ERROR, "ingest failed").into_response();
    }

    let changed_ids: Vec<String> = txs.iter().map(|t| t.tx_id.clone()).collect();
    let result = st.ledger.with_tx(|tx| {
        let mut out = Vec::new();
        for tx_id in &changed_ids {
            let flip_uuid: Option<String> = tx
                .query_row(
                    "SELECT flip_uuid FROM pt_transactions WHERE tx_id = ?1",
                    rusqlite::params![tx_id],
                    |r| r.get(0),
                )
                .ok();
            if let Some(flip_uuid) = flip_uuid {
                out.push(flip_uuid);
            }
        }
        Ok(out)
    });

    let flip_uuids: Vec<String> = match result {
        Ok(v) => {
            let mut v = v;
            v.sort();
            v.dedup();
            v
        }
        Err(e) => {
            error!("client_transactions flip lookup: {e:#}");
            Vec::new()
        }
    };

    let flips = fetch_flips_by_uuid(&st.ledger, &flip_uuids);
    let records: Vec<Vec<u8>> = flips
        .iter()
        .filter_map(|f| wire::pack_flip_v2(f).ok())
        .map(|b| b.to_vec())
        .collect();

    let mut resp = (StatusCode::OK, wire::pack_record_list(&records)).into_response();
    resp.headers_mut().insert("X-USER-ID", HeaderValue::from_static("0"));
    resp
}

fn fetch_flips_by_uuid(ledger: &Ledger, uuids: &[String]) -> Vec<profit_tracking::FlipRow> {
    ledger
        .with_tx(|tx| {
            let mut out = Vec::new();
            for flip_uuid in uuids {
                let row = tx
                    .query_row(
                        "SELECT flip_uuid, display_name, account_id, item_id, opened_time, opened_qty, spent,
                                closed_time, closed_qty, received_post_tax, profit, tax_paid, status, updated_time, deleted
                         FROM pt_flips WHERE flip_uuid = ?1",
                        rusqlite::params![flip_uuid],
                        |r| {
                            Ok(profit_tracking::FlipRow {
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
                        },
                    )
                    .optional()?;
                if let Some(row) = row {
                    out.push(row);
                }
            }
            Ok(out)
        })
        .unwrap_or_default()
}

async fn get_client_transactions(State(st): State<AppState>) -> Response {
    let result = st.ledger.with_tx(|tx| {
        let mut stmt = tx.prepare(
            "SELECT tx_id, flip_uuid, account_id, time, item_id, quantity, price, amount_spent FROM pt_transactions",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, i64>(4)?,
                r.get::<_, i64>(5)?,
                r.get::<_, i64>(6)?,
                r.get::<_, i64>(7)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    });

    match result {
        Ok(rows) => {
            let records: Vec<Vec<u8>> = rows
                .into_iter()
                .filter_map(|(tx_id, flip_uuid, account_id, time, item_id, quantity, price, amount_spent)| {
                    let tx_uuid = uuid::Uuid::parse_str(&tx_id).ok()?;
                    let flip_uuid = uuid::Uuid::parse_str(&flip_uuid).ok()?;
                    Some(
                        wire::pack_acked_transaction(&AckedTransaction {
                            tx_uuid,
                            flip_uuid,
                            account_id,
                            time,
                            item_id,
                            quantity,
                            price,
                            amount_spent,
                        })
                        .to_vec(),
                    )
                })
                .collect();
            let mut body = wire::pack_record_list(&records);
            body.extend_from_slice(&(records.len() as i32).to_be_bytes());
            (StatusCode::OK, body).into_response()
        }
        Err(e) => {
            error!("get_client_transactions: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "db error").into_response()
        }
    }
}

#[derive(Deserialize)]
struct FlipsDeltaBody {
    account_id_time: std::collections::HashMap<String, i64>,
}

async fn client_flips_delta(State(st): State<AppState>, Json(body): Json<FlipsDeltaBody>) -> Response {
    let pairs: Vec<(i64, i64)> = body
        .account_id_time
        .into_iter()
        .filter_map(|(k, v)| k.parse::<i64>().ok().map(|aid| (aid, v)))
        .collect();
    let now = now_ts();
    match profit_tracking::flips_delta(&st.ledger, &pairs, now) {
        Ok((new_time, flips)) => {
            let records: Vec<Vec<u8>> = flips.iter().filter_map(|f| wire::pack_flip_v2(f).ok()).map(|b| b.to_vec()).collect();
            let mut body = Vec::with_capacity(8 + records.iter().map(|r| r.len()).sum::<usize>());
            body.extend_from_slice(&(new_time as i32).to_be_bytes());
            body.extend_from_slice(&wire::pack_record_list(&records));
            (StatusCode::OK, body).into_response()
        }
        Err(e) => {
            error!("client_flips_delta: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "db error").into_response()
        }
    }
}

#[derive(Deserialize)]
struct TransactionIdBody {
    transaction_id: String,
}

async fn orphan_transaction(State(st): State<AppState>, Json(body): Json<TransactionIdBody>) -> Response {
    let now = now_ts();
    match profit_tracking::orphan_transaction(&st.ledger, &st.settings, &body.transaction_id, now) {
        Ok(Some(flip)) => match wire::pack_flip_v2(&flip) {
            Ok(packed) => (StatusCode::OK, wire::pack_record_list(&[packed.to_vec()])).into_response(),
            Err(e) => {
                error!("orphan_transaction pack: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "pack failed").into_response()
            }
        },
        Ok(None) => (StatusCode::NOT_FOUND, "unknown transaction_id").into_response(),
        Err(e) => {
            error!("orphan_transaction: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "db error").into_response()
        }
    }
}

async fn delete_transaction(State(st): State<AppState>, Json(body): Json<TransactionIdBody>) -> Response {
    match profit_tracking::delete_transaction(&st.ledger, &body.transaction_id) {
        Ok(()) => {
            let mut out = Vec::with_capacity(4);
            out.extend_from_slice(&0i32.to_be_bytes());
            (StatusCode::OK, out).into_response()
        }
        Err(e) => {
            error!("delete_transaction: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "db error").into_response()
        }
    }
}

async fn visualize_flip(State(_st): State<AppState>) -> Response {
    // The client-side chart is a stub surface; no historical price graph
    // backend exists yet for this field (bt/bv/bp/st/sv/sp all empty).
    let payload = json!({"bt": [], "bv": [], "bp": [], "st": [], "sv": [], "sp": []});
    match rmp_serde::to_vec_named(&payload) {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => {
            warn!("visualize_flip: msgpack encode failed: {e:#}");
            Json(payload).into_response()
        }
    }
}

async fn health(State(st): State<AppState>) -> impl IntoResponse {
    let snapshot = st.price_cache.snapshot();
    Json(json!({
        "ok": true,
        "last_price_refresh_unix": snapshot.last_refresh_ts,
        "db": st.ledger.path(),
        "log": "stderr",
    }))
}
