//! Per-agent inbox: serializes inbound chat into the LLM conversation
//!
//! The host runtime is not safe to interrupt mid-turn, so inbound
//! conversational records queue here and enter the conversation one at a
//! time: never during an active turn, and only after a short settle delay
//! that a starting turn cancels. A correlated DM remembers where its reply
//! must go and binds the next turn's final text to it.

use crate::protocol::BrokerRecord;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Quiet period between a turn ending and the next message entering the
/// conversation. Tuning, not semantics.
pub const SETTLE_DELAY: Duration = Duration::from_millis(300);

/// Reply sent when the turn produced no usable text.
pub const NO_TEXT_FALLBACK: &str = "(agent processing — no text response produced)";

/// Reply sent when both injection attempts failed.
pub const DELIVERY_FAILED_FALLBACK: &str = "(failed to deliver message to agent)";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("injection failed: {0}")]
pub struct InjectError(pub String);

/// Injects synthetic user turns into the host conversation.
#[async_trait]
pub trait TurnInjector: Send + Sync + 'static {
    /// The runtime's normal injection primitive.
    async fn inject(&self, text: &str) -> Result<(), InjectError>;

    /// The runtime's follow-up injection primitive, tried once when
    /// [`inject`](Self::inject) fails.
    async fn inject_followup(&self, text: &str) -> Result<(), InjectError>;
}

/// Where bound `dm_response` records go.
#[async_trait]
pub trait ReplySink: Send + Sync + 'static {
    async fn send_reply(&self, to: &str, correlation_id: &str, content: &str);
}

#[async_trait]
impl ReplySink for crate::client::Session {
    async fn send_reply(&self, to: &str, correlation_id: &str, content: &str) {
        self.send_dm_response(to, correlation_id, content);
    }
}

#[async_trait]
impl<T: TurnInjector + ?Sized> TurnInjector for Arc<T> {
    async fn inject(&self, text: &str) -> Result<(), InjectError> {
        (**self).inject(text).await
    }

    async fn inject_followup(&self, text: &str) -> Result<(), InjectError> {
        (**self).inject_followup(text).await
    }
}

#[async_trait]
impl<T: ReplySink + ?Sized> ReplySink for Arc<T> {
    async fn send_reply(&self, to: &str, correlation_id: &str, content: &str) {
        (**self).send_reply(to, correlation_id, content).await;
    }
}

/// A conversational record awaiting injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Dm {
        from_name: String,
        content: String,
        correlation_id: Option<String>,
    },
    Broadcast {
        from_name: String,
        content: String,
    },
    ChannelMessage {
        channel: String,
        from_name: String,
        content: String,
    },
}

impl InboundMessage {
    /// Extract the conversational payload of a broker record, if any. All
    /// other records bypass the inbox.
    pub fn from_record(record: &BrokerRecord) -> Option<Self> {
        match record {
            BrokerRecord::Dm {
                from_name,
                content,
                correlation_id,
                ..
            } => Some(Self::Dm {
                from_name: from_name.clone(),
                content: content.clone(),
                correlation_id: correlation_id.clone(),
            }),
            BrokerRecord::Broadcast {
                from_name, content, ..
            } => Some(Self::Broadcast {
                from_name: from_name.clone(),
                content: content.clone(),
            }),
            BrokerRecord::ChannelMessage {
                channel,
                from_name,
                content,
                ..
            } => Some(Self::ChannelMessage {
                channel: channel.clone(),
                from_name: from_name.clone(),
                content: content.clone(),
            }),
            _ => None,
        }
    }

    fn label(&self) -> String {
        match self {
            Self::Dm { from_name, .. } => format!("From {from_name}"),
            Self::Broadcast { from_name, .. } => format!("Broadcast from {from_name}"),
            Self::ChannelMessage {
                channel, from_name, ..
            } => format!("#{channel} from {from_name}"),
        }
    }

    fn content(&self) -> &str {
        match self {
            Self::Dm { content, .. }
            | Self::Broadcast { content, .. }
            | Self::ChannelMessage { content, .. } => content,
        }
    }

    fn pending_reply(&self) -> Option<PendingReply> {
        match self {
            Self::Dm {
                from_name,
                correlation_id: Some(correlation_id),
                ..
            } => Some(PendingReply {
                to: from_name.clone(),
                correlation_id: correlation_id.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnBlock {
    Text(String),
    /// Tool use, tool results, and anything else without reply text.
    Other,
}

/// One entry of the conversation log handed to `agent_end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnMessage {
    pub role: TurnRole,
    pub blocks: Vec<TurnBlock>,
}

#[derive(Debug, Clone)]
struct PendingReply {
    to: String,
    correlation_id: String,
}

#[derive(Default)]
struct InboxState {
    queue: VecDeque<InboundMessage>,
    turn_active: bool,
    /// A message has been injected and its turn has not ended yet.
    in_flight: bool,
    /// A settle-delay dispatch is pending.
    scheduled: bool,
    /// Bumped to invalidate a scheduled dispatch.
    generation: u64,
    pending_reply: Option<PendingReply>,
}

/// Single-track serializer between the client and the LLM conversation.
pub struct Inbox<I, R> {
    injector: I,
    reply_sink: R,
    state: Mutex<InboxState>,
}

impl<I: TurnInjector, R: ReplySink> Inbox<I, R> {
    pub fn new(injector: I, reply_sink: R) -> Arc<Self> {
        Arc::new(Self {
            injector,
            reply_sink,
            state: Mutex::new(InboxState::default()),
        })
    }

    /// Enqueue a conversational record. Dispatch happens after the settle
    /// delay if the runtime is idle.
    pub fn push(self: &Arc<Self>, message: InboundMessage) {
        let mut state = self.state.lock().unwrap();
        state.queue.push_back(message);
        if !state.turn_active && !state.in_flight && !state.scheduled {
            self.schedule_locked(&mut state);
        }
    }

    /// The LLM began a turn; cancels any scheduled dispatch.
    pub fn agent_start(&self) {
        let mut state = self.state.lock().unwrap();
        state.turn_active = true;
        state.scheduled = false;
        state.generation += 1;
    }

    /// The LLM turn finished. Emits the bound `dm_response` if one is due,
    /// then schedules the next dispatch.
    pub async fn agent_end(self: &Arc<Self>, messages: &[TurnMessage]) {
        let reply = {
            let mut state = self.state.lock().unwrap();
            state.turn_active = false;
            state.in_flight = false;
            state.pending_reply.take()
        };

        if let Some(reply) = reply {
            let content =
                last_assistant_text(messages).unwrap_or_else(|| NO_TEXT_FALLBACK.to_string());
            self.reply_sink
                .send_reply(&reply.to, &reply.correlation_id, &content)
                .await;
        }

        let mut state = self.state.lock().unwrap();
        if !state.queue.is_empty() && !state.scheduled {
            self.schedule_locked(&mut state);
        }
    }

    fn schedule_locked(self: &Arc<Self>, state: &mut InboxState) {
        state.generation += 1;
        state.scheduled = true;
        let generation = state.generation;
        let inbox = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SETTLE_DELAY).await;
            inbox.try_dispatch(generation).await;
        });
    }

    async fn try_dispatch(self: Arc<Self>, generation: u64) {
        let message = {
            let mut state = self.state.lock().unwrap();
            if state.generation != generation {
                return;
            }
            state.scheduled = false;
            if state.turn_active || state.in_flight {
                return;
            }
            let Some(message) = state.queue.pop_front() else {
                return;
            };
            state.in_flight = true;
            state.pending_reply = message.pending_reply();
            message
        };

        let text = format!("[{}]: {}", message.label(), message.content());
        if self.injector.inject(&text).await.is_ok() {
            return;
        }
        tracing::warn!("Conversation injection failed; retrying via follow-up primitive");
        if self.injector.inject_followup(&text).await.is_ok() {
            return;
        }

        // Undeliverable: fail the bound reply and keep draining.
        let reply = {
            let mut state = self.state.lock().unwrap();
            state.in_flight = false;
            state.pending_reply.take()
        };
        if let Some(reply) = reply {
            self.reply_sink
                .send_reply(&reply.to, &reply.correlation_id, DELIVERY_FAILED_FALLBACK)
                .await;
        }
        let mut state = self.state.lock().unwrap();
        if !state.queue.is_empty() && !state.turn_active && !state.scheduled {
            self.schedule_locked(&mut state);
        }
    }
}

/// Last non-empty text block of the last assistant message, if any.
fn last_assistant_text(messages: &[TurnMessage]) -> Option<String> {
    let last_assistant = messages
        .iter()
        .rev()
        .find(|message| message.role == TurnRole::Assistant)?;
    last_assistant
        .blocks
        .iter()
        .rev()
        .find_map(|block| match block {
            TurnBlock::Text(text) if !text.trim().is_empty() => Some(text.clone()),
            _ => None,
        })
}
