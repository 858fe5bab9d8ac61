//! Reply publishing and the per-task processing pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::accounting::price_for;
use crate::ai::{AiClient, AiRequest};
use crate::dispatcher::{Counters, FingerprintCache};
use crate::error::BotError;
use crate::event::{kind, unix_now_ms, Event, Tag};
use crate::intent::is_balance_intent;
use crate::queue::{QueueTask, TaskHandler};
use crate::relay::RelaySupervisor;
use crate::signer::Signer;
use crate::store::{
    message_id, synthesized_session_id, AppendOutcome, Classification, DebitOutcome, Direction,
    MessageRecord, Store,
};

/// Longest client-supplied session id accepted from a tag.
const SESSION_ID_MAX_LEN: usize = 120;

/// Most history messages handed to the AI client.
const HISTORY_LIMIT: usize = 100;

/// Signs and fans replies out to the relays.
pub struct Outbox {
    signer: Arc<Signer>,
    relays: Arc<RelaySupervisor>,
    counters: Arc<Counters>,
}

impl Outbox {
    pub fn new(signer: Arc<Signer>, relays: Arc<RelaySupervisor>, counters: Arc<Counters>) -> Self {
        Self {
            signer,
            relays,
            counters,
        }
    }

    /// Encrypt and send a direct message, carrying the session tag when
    /// the conversation has one.
    pub async fn send_dm(
        &self,
        to: &str,
        text: &str,
        session: Option<&str>,
    ) -> Result<(), BotError> {
        let ciphertext = self
            .signer
            .encrypt(to, text)
            .map_err(BotError::internal)?;
        let mut tags = vec![Tag::new(["p", to])];
        if let Some(session) = session {
            tags.push(Tag::new(["session", session]));
        }
        let ev = self
            .signer
            .sign(kind::PRIVATE_MESSAGE, tags, ciphertext)
            .map_err(BotError::internal)?;
        self.publish(&ev).await
    }

    /// Reply publicly to a post, tagging the source event and its author.
    pub async fn send_public_reply(&self, source: &Event, text: &str) -> Result<(), BotError> {
        let tags = vec![
            Tag::new(["e", source.id.as_str(), "", "reply"]),
            Tag::new(["p", source.pubkey.as_str()]),
        ];
        let ev = self
            .signer
            .sign(kind::PUBLIC_POST, tags, text.to_string())
            .map_err(BotError::internal)?;
        self.publish(&ev).await
    }

    /// Publish a standalone public note, optionally mentioning a principal.
    pub async fn send_public_note(&self, text: &str, mention: Option<&str>) -> Result<(), BotError> {
        let tags = match mention {
            Some(p) => vec![Tag::new(["p", p])],
            None => vec![],
        };
        let ev = self
            .signer
            .sign(kind::PUBLIC_POST, tags, text.to_string())
            .map_err(BotError::internal)?;
        self.publish(&ev).await
    }

    /// Broadcast a balance announcement for a principal.
    pub async fn announce_balance(&self, owner: &str, balance: u64) -> Result<(), BotError> {
        let content = json!({
            "balance": balance,
            "currency": "sats",
            "timestamp": unix_now_ms(),
        })
        .to_string();
        let balance_str = balance.to_string();
        let tags = vec![
            Tag::new(["p", owner]),
            Tag::new(["balance", balance_str.as_str()]),
        ];
        let ev = self
            .signer
            .sign(kind::BALANCE_ANNOUNCEMENT, tags, content)
            .map_err(BotError::internal)?;
        self.publish(&ev).await
    }

    /// Delivered when at least one relay accepted the event.
    async fn publish(&self, ev: &Event) -> Result<(), BotError> {
        let results = self.relays.publish(ev).await;
        if results.iter().any(|r| r.ok) {
            self.counters.bump_sent();
            Ok(())
        } else {
            Err(BotError::Transient("no relay accepted the event".into()))
        }
    }
}

/// Dequeued-task body: decrypt, bind the session, settle accounting, call
/// the AI, publish, and log both sides of the exchange.
pub struct Processor {
    pub signer: Arc<Signer>,
    pub store: Store,
    pub ai: Arc<AiClient>,
    pub profiles: crate::profiles::ProfileCache,
    pub fingerprints: Arc<FingerprintCache>,
    pub outbox: Arc<Outbox>,
    pub counters: Arc<Counters>,
    pub response_delay: Duration,
}

impl Processor {
    async fn process(&self, task: &QueueTask) -> Result<(), BotError> {
        let ev = &task.event;
        let is_dm = ev.kind == kind::PRIVATE_MESSAGE;
        let origin = if is_dm { "dm" } else { "public" };

        // 1. Extract content. Undecryptable or empty events are dropped
        // without a reply.
        let text = if is_dm {
            match self.signer.decrypt(&ev.pubkey, &ev.content) {
                Ok(text) => text,
                Err(err) => {
                    debug!(event = %ev.id, %err, "dropping undecryptable message");
                    return Ok(());
                }
            }
        } else {
            ev.content.clone()
        };
        let text = text.trim().to_string();
        if text.is_empty() {
            debug!(event = %ev.id, "dropping empty message");
            return Ok(());
        }

        // 2. Session binding. A client-supplied tag scopes history to that
        // session; otherwise a stable id is synthesized for the principal.
        let client_session: Option<String> = if is_dm {
            ev.tag_value("session")
                .filter(|s| !s.is_empty() && s.len() <= SESSION_ID_MAX_LEN)
                .map(String::from)
        } else {
            None
        };
        let session_id = client_session
            .clone()
            .unwrap_or_else(|| synthesized_session_id(origin, &ev.pubkey));

        // 3. Profile fast path; a miss is warmed in the background.
        let profile = self.profiles.lookup(&ev.pubkey).await;

        // 4. Cross-relay echoes of the same plaintext are dropped here.
        if !self.fingerprints.check_and_insert(&ev.pubkey, &text) {
            debug!(event = %ev.id, "dropping duplicate content fingerprint");
            return Ok(());
        }

        // 5. Claim the event id and append the user message.
        let user_record = MessageRecord {
            id: message_id(),
            direction: Direction::User,
            text: text.clone(),
            timestamp: unix_now_ms(),
            classification: Classification::Question,
            reply_to: None,
            event_id: Some(ev.id.clone()),
            event_kind: Some(ev.kind),
            profile: profile.clone(),
        };
        let user_record_id = user_record.id.clone();
        match self
            .store
            .append_with_marker(&ev.pubkey, &session_id, origin, user_record, &ev.id)
            .map_err(BotError::internal)?
        {
            AppendOutcome::Appended => {}
            AppendOutcome::DuplicateEvent => {
                debug!(event = %ev.id, "another worker already processed this event");
                return Ok(());
            }
        }

        // 6. Balance questions never reach the AI or the meter.
        if is_balance_intent(&text) {
            let balance = self.store.balance(&ev.pubkey).map_err(BotError::internal)?;
            let reply = format!("Your current balance is {balance} sats.");
            self.reply_in_channel(ev, &reply, client_session.as_deref())
                .await?;
            if let Err(err) = self.outbox.announce_balance(&ev.pubkey, balance).await {
                debug!(%err, "balance announcement failed");
            }
            self.append_bot_record(
                &ev.pubkey,
                &session_id,
                origin,
                reply,
                Classification::BalanceInfo,
                Some(user_record_id),
            )?;
            return Ok(());
        }

        // 7. Debit before the AI call. No refund on later failure.
        let cost = price_for(ev.kind);
        let new_balance = match self
            .store
            .debit(&ev.pubkey, cost)
            .map_err(BotError::internal)?
        {
            DebitOutcome::Debited(balance) => balance,
            DebitOutcome::Insufficient(balance) => {
                let notice = format!(
                    "Insufficient balance. Required: {cost} sats. Current balance: \
                     {balance} sats. Send a zap to top up."
                );
                self.reply_in_channel(ev, &notice, client_session.as_deref())
                    .await?;
                if let Err(err) = self.outbox.announce_balance(&ev.pubkey, balance).await {
                    debug!(%err, "balance announcement failed");
                }
                self.append_bot_record(
                    &ev.pubkey,
                    &session_id,
                    origin,
                    notice,
                    Classification::System,
                    Some(user_record_id),
                )?;
                return Ok(());
            }
        };

        // 8. History: session-scoped when the client named one, otherwise
        // everything known about the principal.
        let history = if client_session.is_some() {
            self.store
                .messages(&ev.pubkey, &session_id, HISTORY_LIMIT)
                .map_err(BotError::internal)?
        } else {
            self.store
                .messages_for_principal(&ev.pubkey, HISTORY_LIMIT)
                .map_err(BotError::internal)?
        };
        // the current question is already in the log; the AI gets it as
        // the live turn instead
        let history: Vec<MessageRecord> = history
            .into_iter()
            .filter(|m| m.event_id.as_deref() != Some(ev.id.as_str()))
            .collect();

        // 9. The AI call; falls back to an apology string internally.
        let reply = self
            .ai
            .respond(AiRequest {
                text: &text,
                history: &history,
                user_context: profile.as_ref(),
                conversation_key: Some(format!("{}:{}", ev.pubkey, session_id)),
            })
            .await;
        if !self.response_delay.is_zero() {
            tokio::time::sleep(self.response_delay).await;
        }

        // 10. Publish the reply.
        self.reply_in_channel(ev, &reply, client_session.as_deref())
            .await?;

        // 11. Announce the post-debit balance.
        if let Err(err) = self.outbox.announce_balance(&ev.pubkey, new_balance).await {
            debug!(%err, "balance announcement failed");
        }

        // 12. Log the bot's side.
        self.append_bot_record(
            &ev.pubkey,
            &session_id,
            origin,
            reply,
            Classification::Response,
            Some(user_record_id),
        )?;
        Ok(())
    }

    async fn reply_in_channel(
        &self,
        source: &Event,
        text: &str,
        session: Option<&str>,
    ) -> Result<(), BotError> {
        if source.kind == kind::PRIVATE_MESSAGE {
            self.outbox.send_dm(&source.pubkey, text, session).await
        } else {
            self.outbox.send_public_reply(source, text).await
        }
    }

    fn append_bot_record(
        &self,
        pubkey: &str,
        session_id: &str,
        origin: &str,
        text: String,
        classification: Classification,
        reply_to: Option<String>,
    ) -> Result<(), BotError> {
        self.store
            .append_message(
                pubkey,
                session_id,
                origin,
                MessageRecord {
                    id: message_id(),
                    direction: Direction::Bot,
                    text,
                    timestamp: unix_now_ms(),
                    classification,
                    reply_to,
                    event_id: None,
                    event_kind: None,
                    profile: None,
                },
            )
            .map_err(BotError::internal)
    }
}

#[async_trait]
impl TaskHandler for Processor {
    async fn handle(&self, task: &QueueTask) -> Result<(), BotError> {
        match self.process(task).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.counters.bump_errors();
                warn!(event = %task.event.id, %err, "processing failed");
                if task.final_attempt() && task.event.kind == kind::PRIVATE_MESSAGE {
                    let notice = "Sorry, something went wrong while processing your \
                                  message. Please try again later.";
                    if let Err(dm_err) = self
                        .outbox
                        .send_dm(&task.event.pubkey, notice, None)
                        .await
                    {
                        debug!(%dm_err, "error notice could not be delivered");
                    }
                }
                Err(err)
            }
        }
    }
}
