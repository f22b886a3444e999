//! Transaction receipts
//!
//! Decoded payload of the `receipt` event and the notifications derived
//! from it for each party.

use crate::domain::ports::PushMessage;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;

/// Receipt of a settled transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub tx_id: String,
    /// Upstream sends either epoch seconds or an ISO string
    pub timestamp: serde_json::Value,
    pub success: bool,
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(deserialize_with = "string_or_number")]
    pub transaction_fee: String,
    #[serde(default)]
    pub additional_info: Option<serde_json::Value>,
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Fee {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Fee::deserialize(deserializer)? {
        Fee::Text(s) => s,
        Fee::Number(n) => n.to_string(),
    })
}

/// Which side of the transaction a notification is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Sender,
    Recipient,
}

impl Party {
    pub fn as_str(&self) -> &'static str {
        match self {
            Party::Sender => "sender",
            Party::Recipient => "recipient",
        }
    }
}

impl TransactionReceipt {
    /// Recipient address when it differs from the sender
    pub fn counterparty(&self) -> Option<&str> {
        self.to
            .as_deref()
            .filter(|to| !to.eq_ignore_ascii_case(&self.from))
    }

    /// Parties to notify, with their addresses
    ///
    /// The sender is always notified; the recipient only for a successful
    /// transfer to a different address.
    pub fn parties(&self) -> Vec<(Party, &str)> {
        let mut parties = vec![(Party::Sender, self.from.as_str())];
        if self.success {
            if let Some(to) = self.counterparty() {
                parties.push((Party::Recipient, to));
            }
        }
        parties
    }

    /// Notification for one party
    pub fn message_for(&self, party: Party) -> PushMessage {
        let label = humanize(&self.kind);
        let (title, body) = match (party, self.success) {
            (Party::Sender, true) => (
                format!("{} sent", label),
                match self.counterparty() {
                    Some(to) => format!(
                        "Your transaction to {} was confirmed. Fee: {}",
                        short_address(to),
                        self.transaction_fee
                    ),
                    None => format!(
                        "Your transaction was confirmed. Fee: {}",
                        self.transaction_fee
                    ),
                },
            ),
            (Party::Sender, false) => (
                format!("{} failed", label),
                format!(
                    "Transaction {} did not go through.",
                    short_address(&self.tx_id)
                ),
            ),
            (Party::Recipient, _) => (
                format!("{} received", label),
                format!("You received a transaction from {}.", short_address(&self.from)),
            ),
        };

        let mut data = json!({
            "type": "receipt",
            "party": party.as_str(),
            "txId": self.tx_id,
            "success": self.success,
            "kind": self.kind,
            "timestamp": self.timestamp,
        });
        if let Some(info) = &self.additional_info {
            data["additionalInfo"] = info.clone();
        }

        PushMessage::new(title, body).with_data(data)
    }
}

/// `token_transfer` -> `Token transfer`
fn humanize(kind: &str) -> String {
    let spaced = kind.replace(['_', '-'], " ");
    let mut chars = spaced.trim().chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => "Transaction".to_string(),
    }
}

fn short_address(value: &str) -> String {
    if value.len() <= 14 || !value.is_ascii() {
        return value.to_string();
    }
    format!("{}...{}", &value[..8], &value[value.len() - 4..])
}
