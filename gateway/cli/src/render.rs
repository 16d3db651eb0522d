//! Terminal rendering of gateway events

use std::collections::{HashMap, HashSet};

use gateway_core::{
    FanOutSummary, Message, MessageId, MessageRole, MessageStatus, Provider, ProviderId,
};

/// Tracks how much of each message has been printed
///
/// Events carry full snapshots, so the live view prints only the suffix
/// that is new since the previous snapshot of the same message.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    printed: HashMap<MessageId, usize>,
}

impl DeltaTracker {
    /// Text of `message` not printed yet; marks it printed
    pub fn unseen<'a>(&mut self, message: &'a Message) -> &'a str {
        let content = message.content();
        let printed = self.printed.entry(message.id().clone()).or_insert(0);
        let start = if content.is_char_boundary(*printed) {
            *printed
        } else {
            content.len()
        };
        *printed = content.len();
        content.get(start..).unwrap_or_default()
    }
}

/// Decides what to print for each assistant snapshot of one `send`
///
/// With a single provider the reply streams as it grows; with several,
/// each reply is printed whole once terminal. Every reply is finished at
/// most once, so replaying snapshots (a `Tagged` event after the terminal
/// state change, or a catch-up from history after a lag) prints nothing new.
#[derive(Debug)]
pub struct ReplyPrinter {
    live: bool,
    tracker: DeltaTracker,
    finished: HashSet<MessageId>,
}

impl ReplyPrinter {
    /// Printer for a send to `providers` targets
    #[must_use]
    pub fn new(providers: usize) -> Self {
        Self {
            live: providers == 1,
            tracker: DeltaTracker::default(),
            finished: HashSet::new(),
        }
    }

    /// Text to print for this snapshot, if any
    pub fn render(&mut self, message: &Message) -> Option<String> {
        if message.role() != MessageRole::Assistant || self.finished.contains(message.id()) {
            return None;
        }

        let terminal = message.is_terminal();
        if terminal {
            self.finished.insert(message.id().clone());
        }

        if self.live {
            let mut out = self.tracker.unseen(message).to_string();
            if terminal {
                out.push('\n');
            }
            return (!out.is_empty()).then_some(out);
        }

        if !terminal {
            return None;
        }
        let mut block = String::new();
        if let Some(provider) = message.provider_source() {
            block.push_str(&provider_header(provider));
            block.push('\n');
        }
        block.push_str(message.content());
        block.push_str("\n\n");
        Some(block)
    }
}

/// Header printed above a provider's reply in multi-provider mode
#[must_use]
pub fn provider_header(provider: &ProviderId) -> String {
    format!("── {provider} ──")
}

/// One stored message as a transcript block
#[must_use]
pub fn transcript_entry(message: &Message) -> String {
    let who = match (message.role(), message.provider_source()) {
        (MessageRole::User, _) => "you".to_string(),
        (MessageRole::Assistant, Some(provider)) => provider.to_string(),
        (MessageRole::Assistant, None) => "assistant".to_string(),
    };
    let marker = match message.status() {
        MessageStatus::Sent => "",
        MessageStatus::Failed => " [failed]",
        MessageStatus::Queued | MessageStatus::Sending | MessageStatus::Streaming => {
            " [incomplete]"
        }
    };
    format!("{who}{marker}:\n{}\n", message.content())
}

/// Closing line of a `send`
#[must_use]
pub fn summary_line(summary: &FanOutSummary) -> String {
    format!(
        "{} dispatched, {} succeeded, {} failed",
        summary.dispatched, summary.succeeded, summary.failed
    )
}

/// Registry listing row
#[must_use]
pub fn provider_row(provider: &Provider) -> String {
    let capabilities: Vec<String> = provider
        .capabilities
        .iter()
        .map(|c| format!("{c:?}").to_lowercase())
        .collect();
    format!(
        "{:<12} {:<24} {:<30} {}",
        provider.id.as_str(),
        provider.display_name,
        provider.model,
        capabilities.join(",")
    )
}
