//! Receipt ingest, balance credits, and request pricing.
//!
//! A receipt event carries the paid invoice in a `bolt11` tag and a JSON
//! copy of the embedded payment request in a `description` tag. The
//! sender and amount come from the embedded request, falling back to the
//! receipt itself. Amounts arrive in millisats and are truncated to sats.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::BotError;
use crate::event::{kind, Event};
use crate::processor::Outbox;
use crate::store::Store;

/// Price of a private message reply, in sats.
pub const DM_COST: u64 = 1;

/// Price of a public mention reply, in sats.
pub const PUBLIC_COST: u64 = 2;

/// Reply price by channel kind.
pub fn price_for(event_kind: u32) -> u64 {
    if event_kind == kind::PRIVATE_MESSAGE {
        DM_COST
    } else {
        PUBLIC_COST
    }
}

/// A parsed payment receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub sender: String,
    pub amount_sats: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub receipt_event_id: String,
    pub invoice: String,
    pub description: String,
}

/// Parse a receipt event into its payment facts.
pub fn parse_receipt(ev: &Event) -> Result<Receipt, BotError> {
    let invoice = ev
        .tag_value("bolt11")
        .ok_or_else(|| BotError::Malformed("receipt has no bolt11 tag".into()))?
        .to_string();
    let description = ev
        .tag_value("description")
        .ok_or_else(|| BotError::Malformed("receipt has no description tag".into()))?
        .to_string();
    let request: Value = serde_json::from_str(&description)
        .map_err(|e| BotError::Malformed(format!("receipt description is not json: {e}")))?;

    let sender = request["pubkey"]
        .as_str()
        .unwrap_or(&ev.pubkey)
        .to_string();
    let millisats = request_amount_tag(&request)
        .or_else(|| ev.tag_value("amount").and_then(|v| v.parse().ok()))
        .unwrap_or(0);
    Ok(Receipt {
        sender,
        amount_sats: millisats / 1000,
        request_id: request["id"].as_str().map(String::from),
        receipt_event_id: ev.id.clone(),
        invoice,
        description,
    })
}

/// The `amount` tag (millisats) of the embedded request, if present.
fn request_amount_tag(request: &Value) -> Option<u64> {
    request["tags"].as_array()?.iter().find_map(|tag| {
        let fields = tag.as_array()?;
        if fields.first()?.as_str()? == "amount" {
            fields.get(1)?.as_str()?.parse().ok()
        } else {
            None
        }
    })
}

/// Receipt ingest and balance query handling.
pub struct Accounting {
    store: Store,
    outbox: Arc<Outbox>,
}

impl Accounting {
    pub fn new(store: Store, outbox: Arc<Outbox>) -> Self {
        Self { store, outbox }
    }

    /// Credit the sender of a receipt and announce the new balance.
    pub async fn handle_receipt(&self, ev: &Event) {
        let receipt = match parse_receipt(ev) {
            Ok(receipt) => receipt,
            Err(err) => {
                warn!(event = %ev.id, %err, "dropping unparseable receipt");
                return;
            }
        };
        if receipt.amount_sats == 0 {
            warn!(event = %ev.id, "dropping receipt with zero amount");
            return;
        }
        if let Err(err) = self.store.record_receipt(&receipt.sender, &receipt) {
            warn!(%err, "failed to persist receipt");
            return;
        }
        let new_balance = match self.store.credit(&receipt.sender, receipt.amount_sats) {
            Ok(balance) => balance,
            Err(err) => {
                warn!(%err, "failed to credit balance");
                return;
            }
        };
        info!(
            sender = %receipt.sender,
            sats = receipt.amount_sats,
            balance = new_balance,
            "credited receipt"
        );
        if let Err(err) = self.outbox.announce_balance(&receipt.sender, new_balance).await {
            warn!(%err, "balance announcement failed");
        }
        let thanks = format!("Thanks for the {} sats! ⚡", receipt.amount_sats);
        if let Err(err) = self
            .outbox
            .send_public_note(&thanks, Some(&receipt.sender))
            .await
        {
            warn!(%err, "thank-you post failed");
        }
    }

    /// Answer a balance query in-channel and broadcast an announcement.
    pub async fn handle_balance_query(&self, ev: &Event) {
        let balance = match self.store.balance(&ev.pubkey) {
            Ok(balance) => balance,
            Err(err) => {
                warn!(%err, "failed to read balance");
                return;
            }
        };
        let text = format!("Your current balance is {balance} sats.");
        if let Err(err) = self.outbox.send_dm(&ev.pubkey, &text, None).await {
            warn!(%err, "balance reply failed");
        }
        if let Err(err) = self.outbox.announce_balance(&ev.pubkey, balance).await {
            warn!(%err, "balance announcement failed");
        }
    }
}
