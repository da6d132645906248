use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single SMS message moving through the daemon.
///
/// `from` and `to` are E.164 phone numbers. `timestamp` is optional on the
/// way in; transports stamp it at enqueue time if the sender left it empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub body: MessageBody,
}

impl Message {
    /// Construct a plain text message with no timestamp.
    pub fn text(from: impl Into<String>, to: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            timestamp: None,
            body: MessageBody::text(text),
        }
    }
}

/// The message payload. Exactly one variant is set per message; decoding a
/// frame with an unknown variant fails at the transport edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageBody {
    Text { text: String },
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        MessageBody::Text { text: text.into() }
    }

    /// The text content, if this is a text body.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageBody::Text { text } => Some(text),
        }
    }
}

/// A single match predicate on a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageFilter {
    MatchFrom(String),
    MatchTo(String),
}

/// A set of filters, combined with AND. The empty set accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageFilters {
    #[serde(default)]
    pub filters: Vec<MessageFilter>,
}

impl MessageFilters {
    /// A filter set matching messages sent from `number`.
    pub fn match_from(number: impl Into<String>) -> Self {
        Self {
            filters: vec![MessageFilter::MatchFrom(number.into())],
        }
    }

    /// A filter set matching messages addressed to `number`.
    pub fn match_to(number: impl Into<String>) -> Self {
        Self {
            filters: vec![MessageFilter::MatchTo(number.into())],
        }
    }

    /// Returns true iff every filter in the set matches `msg`.
    pub fn matches(&self, msg: &Message) -> bool {
        self.filters.iter().all(|filter| match filter {
            MessageFilter::MatchFrom(from) => &msg.from == from,
            MessageFilter::MatchTo(to) => &msg.to == to,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg() -> Message {
        Message::text("+15550100", "+15550199", "hi")
    }

    #[test]
    fn empty_filter_set_accepts() {
        assert!(MessageFilters::default().matches(&msg()));
    }

    #[test]
    fn single_filters() {
        assert!(MessageFilters::match_from("+15550100").matches(&msg()));
        assert!(!MessageFilters::match_from("+15550199").matches(&msg()));
        assert!(MessageFilters::match_to("+15550199").matches(&msg()));
        assert!(!MessageFilters::match_to("+15550100").matches(&msg()));
    }

    #[test]
    fn filters_are_anded() {
        let both = MessageFilters {
            filters: vec![
                MessageFilter::MatchFrom("+15550100".to_string()),
                MessageFilter::MatchTo("+15550199".to_string()),
            ],
        };
        assert!(both.matches(&msg()));

        let conflicting = MessageFilters {
            filters: vec![
                MessageFilter::MatchFrom("+15550100".to_string()),
                MessageFilter::MatchTo("+15550100".to_string()),
            ],
        };
        assert!(!conflicting.matches(&msg()));
    }
}
