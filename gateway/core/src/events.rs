//! Gateway Events
//!
//! Notifications the gateway pushes to subscribers. Subscribers never read
//! message state from anywhere else while a dispatch runs: every status
//! change and every content delta arrives here as a full message snapshot.
//!
//! # Design Philosophy
//!
//! Subscribers are renderers. A `MessageStateChanged` carries the whole
//! message, so a subscriber that joins late or drops an event simply
//! renders the next snapshot; no client-side reconstruction is needed.

use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, ProviderId};
use crate::message::{Message, MessageStatus};

/// Counts reported when a fan-out finishes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutSummary {
    /// Dispatches started
    pub dispatched: usize,
    /// Dispatches that ended `sent`
    pub succeeded: usize,
    /// Dispatches that ended `failed`
    pub failed: usize,
}

impl FanOutSummary {
    /// Count one finished message
    pub fn record(&mut self, message: &Message) {
        match message.status() {
            MessageStatus::Sent => self.succeeded += 1,
            _ => self.failed += 1,
        }
    }

    /// Whether every dispatch succeeded
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.succeeded == self.dispatched
    }
}

/// A terminal message labelled with the provider that produced it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaggedMessage {
    /// Producing provider
    pub provider: ProviderId,
    /// The message, in `sent` or `failed`
    pub message: Message,
}

/// Events broadcast to [`GatewayService`](crate::GatewayService) subscribers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum GatewayEvent {
    /// A message was created, changed status or received content
    MessageStateChanged {
        /// Conversation the message belongs to
        conversation_id: ConversationId,
        /// Snapshot after the change
        message: Message,
    },

    /// One provider's dispatch reached a terminal state
    ///
    /// Sent once per provider, ahead of `AllComplete`. Subscribers that
    /// lagged can rebuild what they missed from the history store.
    Tagged {
        /// Conversation the message belongs to
        conversation_id: ConversationId,
        /// Producing provider
        provider: ProviderId,
        /// The terminal message
        message: Message,
    },

    /// Every dispatch of one `send_message` call has finished
    AllComplete {
        /// Conversation
        conversation_id: ConversationId,
        /// Outcome counts
        summary: FanOutSummary,
    },
}

impl GatewayEvent {
    /// Conversation the event belongs to
    #[must_use]
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::MessageStateChanged {
                conversation_id, ..
            }
            | Self::Tagged {
                conversation_id, ..
            }
            | Self::AllComplete {
                conversation_id, ..
            } => conversation_id,
        }
    }
}
