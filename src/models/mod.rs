//! Row shapes of the backend tables the client reads.

use serde::{Deserialize, Deserializer};

pub mod chat;
pub mod notification;
pub mod post;
pub mod profile;
pub mod wallet;

pub use chat::{ChatParticipant, ChatRoom, Message};
pub use notification::{Notification, NotificationKind};
pub use post::{Like, Post};
pub use profile::{Profile, ProfileSummary};
pub use wallet::{PortfolioItem, Transaction, TransactionDirection, Wallet};

#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Text(String),
    Int(i64),
}

impl From<IdRepr> for String {
    fn from(value: IdRepr) -> Self {
        match value {
            IdRepr::Text(text) => text,
            IdRepr::Int(number) => number.to_string(),
        }
    }
}

/// Keys arrive as uuid strings or bigint numbers depending on the table.
pub(crate) fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    IdRepr::deserialize(deserializer).map(String::from)
}

pub(crate) fn optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<IdRepr>::deserialize(deserializer)?.map(String::from))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DecimalRepr {
    Number(f64),
    Text(String),
}

/// `numeric` columns arrive as JSON numbers or as strings.
pub(crate) fn decimal<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<DecimalRepr>::deserialize(deserializer)? {
        None => Ok(0.0),
        Some(DecimalRepr::Number(value)) => Ok(value),
        Some(DecimalRepr::Text(text)) => text
            .trim()
            .parse::<f64>()
            .map_err(|err| serde::de::Error::custom(format!("invalid decimal {text:?}: {err}"))),
    }
}

pub(crate) fn optional_decimal<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<DecimalRepr>::deserialize(deserializer)? {
        None => Ok(None),
        Some(DecimalRepr::Number(value)) => Ok(Some(value)),
        Some(DecimalRepr::Text(text)) => text
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|err| serde::de::Error::custom(format!("invalid decimal {text:?}: {err}"))),
    }
}

/// Counters that may be `null` in older rows.
pub(crate) fn count<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<i64>::deserialize(deserializer)?.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Probe {
        #[serde(deserialize_with = "id_string")]
        id: String,
        #[serde(default, deserialize_with = "decimal")]
        amount: f64,
        #[serde(default, deserialize_with = "count")]
        hits: i64,
    }

    #[test]
    fn accepts_numeric_ids_and_string_decimals() {
        let probe: Probe =
            serde_json::from_value(json!({ "id": 42, "amount": "12.50", "hits": null })).unwrap();
        assert_eq!(probe.id, "42");
        assert_eq!(probe.amount, 12.5);
        assert_eq!(probe.hits, 0);

        let probe: Probe = serde_json::from_value(json!({ "id": "abc", "amount": 3 })).unwrap();
        assert_eq!(probe.id, "abc");
        assert_eq!(probe.amount, 3.0);
    }

    #[test]
    fn rejects_garbage_decimals() {
        let result = serde_json::from_value::<Probe>(json!({ "id": "a", "amount": "lots" }));
        assert!(result.is_err());
    }
}
