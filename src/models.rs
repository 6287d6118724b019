use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A live webhook as returned by a token lookup.
#[derive(Debug, Clone)]
pub struct Webhook {
    pub conversation_id: String,
    pub name: String,
    pub template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookSummary {
    pub name: String,
    pub has_template: bool,
    pub created_at: DateTime<Utc>,
}

/// A chat message seen by the bot.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InboundMessage {
    pub conversation_id: String,
    pub sender: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandAdvert {
    pub name: &'static str,
    pub usage: &'static str,
    pub description: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extended: Option<ExtendedDescription>,
}

/// Longer help shown when a user looks a command up.
#[derive(Debug, Clone, Serialize)]
pub struct ExtendedDescription {
    pub title: &'static str,
    pub body: &'static str,
}

/// The command list published to the chat service at startup.
#[derive(Debug, Clone, Serialize)]
pub struct Advertisement {
    pub alias: &'static str,
    pub commands: Vec<CommandAdvert>,
}
