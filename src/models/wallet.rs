use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{decimal, id_string, optional_decimal, optional_id};
use crate::sync::Keyed;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(deserialize_with = "id_string")]
    pub user_id: String,
    pub address: String,
    #[serde(default, deserialize_with = "decimal")]
    pub balance: f64,
    pub currency: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionDirection {
    Sent,
    Received,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(deserialize_with = "id_string")]
    pub wallet_id: String,
    #[serde(default, deserialize_with = "optional_id")]
    pub recipient_wallet_id: Option<String>,
    #[serde(default, deserialize_with = "decimal")]
    pub amount: f64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Direction relative to `wallet_id`.
    pub fn direction(&self, wallet_id: &str) -> TransactionDirection {
        if self.wallet_id == wallet_id {
            TransactionDirection::Sent
        } else {
            TransactionDirection::Received
        }
    }
}

impl Keyed for Transaction {
    fn key(&self) -> &str {
        &self.id
    }

    fn sort_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Snapshot of one held asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioItem {
    #[serde(default, deserialize_with = "optional_id")]
    pub id: Option<String>,
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "decimal")]
    pub balance: f64,
    #[serde(default, deserialize_with = "optional_decimal")]
    pub price: Option<f64>,
}
