//! Wire-shape input/output records shared between the transport layer and
//! the suggestion engine (§6).

use serde::{Deserialize, Serialize};

pub const COINS_ITEM_ID: i64 = 995;

#[derive(Debug, Clone, Deserialize)]
pub struct OfferIn {
    pub box_id: i64,
    pub status: String, // empty | buy | sell
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub item_id: i64,
    #[serde(default)]
    pub price: i64,
    #[serde(default)]
    pub amount_total: i64,
    #[serde(default)]
    pub amount_traded: i64,
    #[serde(default)]
    pub gp_to_collect: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemAmount {
    pub item_id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusRequest {
    #[serde(default)]
    pub offers: Vec<OfferIn>,
    #[serde(default)]
    pub items: Vec<ItemAmount>,
    #[serde(default)]
    pub timeframe: Option<serde_json::Value>,
    #[serde(default)]
    pub blocked_items: Vec<i64>,
    #[serde(default)]
    pub skip_suggestion: Option<i64>,
    #[serde(default)]
    pub sell_only: bool,
    #[serde(default)]
    pub requested_suggestion_types: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    Wait,
    Buy,
    Sell,
    Abort,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Wait => "wait",
            ActionType::Buy => "buy",
            ActionType::Sell => "sell",
            ActionType::Abort => "abort",
        }
    }

    pub fn command_id(self) -> i64 {
        match self {
            ActionType::Wait => 0,
            ActionType::Buy => 1,
            ActionType::Sell => 2,
            ActionType::Abort => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Action {
    pub action_type: ActionType,
    pub rec_id: String,
    pub issued_unix: i64,
    pub box_id: i64,
    pub item_id: i64,
    pub price: i64,
    pub quantity: i64,
    pub name: String,
    pub message: String,
    pub expected_profit: f64,
    pub expected_duration: f64,
    pub note: String,
}

impl Action {
    pub fn wait(issued_unix: i64, rec_id: String, message: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::Wait,
            rec_id,
            issued_unix,
            box_id: -1,
            item_id: 0,
            price: 0,
            quantity: 0,
            name: String::new(),
            message: message.into(),
            expected_profit: 0.0,
            expected_duration: 0.0,
            note: String::new(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.action_type.as_str(),
            "rec_id": self.rec_id,
            "issued_unix": self.issued_unix,
            "box_id": self.box_id,
            "item_id": self.item_id,
            "price": self.price,
            "quantity": self.quantity,
            "name": self.name,
            "command_id": self.action_type.command_id(),
            "message": self.message,
            "expectedProfit": self.expected_profit,
            "expectedDuration": self.expected_duration,
            "note": self.note,
        })
    }
}

/// Short-key mirror of [`Action`] for msgpack encoding (§6).
#[derive(Debug, Clone, Serialize)]
pub struct ActionWire {
    pub t: String,
    pub b: i64,
    pub i: i64,
    pub p: i64,
    pub q: i64,
    pub n: String,
    pub id: i64,
    pub m: String,
    pub ed: f64,
    pub ep: f64,
}

impl From<&Action> for ActionWire {
    fn from(a: &Action) -> Self {
        Self {
            t: a.action_type.as_str().to_string(),
            b: a.box_id,
            i: a.item_id,
            p: a.price,
            q: a.quantity,
            n: a.name.clone(),
            id: a.action_type.command_id(),
            m: a.message.clone(),
            ed: a.expected_duration,
            ep: a.expected_profit,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemPriceWire {
    pub bp: i64,
    pub sp: i64,
    pub m: String,
}
