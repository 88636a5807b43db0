//! Conversation model shared by the retrieval loop and the generator
//!
//! A [`Message`] keeps the visible reply text apart from any reasoning the
//! model emitted inside `<think>...</think>` tags, so prompts can replay
//! reasoning deliberately instead of by accident.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Role of a conversation participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// User message
    User,
    /// Assistant message
    Assistant,
    /// System message
    System,
}

impl Role {
    /// Convert role to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// A single message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the speaker
    pub role: Role,
    /// Visible text of the message
    pub content: String,
    /// Reasoning that preceded the visible text, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// When the message was recorded
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a new message with the current timestamp
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            reasoning: None,
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Attach reasoning to the message
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    /// Build an assistant message from raw model output.
    ///
    /// `primed` is the reasoning the reply was seeded with, if the request
    /// started the assistant turn inside an open `<think>` block. In that case
    /// the model output continues the reasoning and may only contain the
    /// closing tag.
    pub fn from_model_output(raw: &str, primed: Option<&str>) -> Self {
        let (reasoning, text) = split_reasoning(raw);
        let reasoning = match (primed, reasoning) {
            (Some(p), Some(r)) => Some(format!("{p}{r}")),
            (Some(p), None) => Some(p.to_string()),
            (None, r) => r,
        };
        Self {
            role: Role::Assistant,
            content: text,
            reasoning: reasoning.map(|r| r.trim().to_string()).filter(|r| !r.is_empty()),
            timestamp: Utc::now(),
        }
    }

    /// Reasoning part of the message, empty when there is none
    pub fn reasoning_text(&self) -> &str {
        self.reasoning.as_deref().unwrap_or("")
    }

    /// Visible part of the message
    pub fn message_text(&self) -> &str {
        &self.content
    }

    /// Render the message as it should be sent to a chat model, with any
    /// reasoning wrapped back into `<think>` tags.
    pub fn to_prompt_content(&self) -> String {
        match &self.reasoning {
            Some(r) if !r.is_empty() => format!("{THINK_OPEN}{r}{THINK_CLOSE}{}", self.content),
            _ => self.content.clone(),
        }
    }

    /// Estimate token count using chars/4 heuristic
    pub fn estimate_tokens(&self) -> usize {
        (self.content.len() + self.reasoning_text().len()) / 4
    }
}

/// Split raw output into reasoning and visible text. A lone closing tag means
/// the output started inside a reasoning block.
fn split_reasoning(raw: &str) -> (Option<String>, String) {
    if let Some(start) = raw.find(THINK_OPEN) {
        let after_open = &raw[start + THINK_OPEN.len()..];
        return match after_open.find(THINK_CLOSE) {
            Some(end) => {
                let reasoning = after_open[..end].to_string();
                let mut text = raw[..start].to_string();
                text.push_str(&after_open[end + THINK_CLOSE.len()..]);
                (Some(reasoning), text.trim().to_string())
            }
            // unterminated block: everything is reasoning
            None => (Some(after_open.to_string()), String::new()),
        };
    }

    if let Some(end) = raw.find(THINK_CLOSE) {
        let reasoning = raw[..end].to_string();
        let text = raw[end + THINK_CLOSE.len()..].trim().to_string();
        return (Some(reasoning), text);
    }

    (None, raw.trim().to_string())
}

/// Ordered list of messages exchanged with the assistant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    /// Append a message
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// The final message, provided it was written by the user
    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.last().filter(|m| m.role == Role::User)
    }

    /// The last `n` messages, skipping system messages
    pub fn recent(&self, n: usize) -> Vec<&Message> {
        let start = self.messages.len().saturating_sub(n);
        self.messages[start..]
            .iter()
            .filter(|m| m.role != Role::System)
            .collect()
    }

    /// Append retrieved context as the start of an assistant reasoning turn.
    ///
    /// A generator handed this conversation continues the reasoning rather
    /// than starting a fresh reply.
    pub fn add_context_as_reasoning(&mut self, context: &str) {
        self.messages
            .push(Message::assistant(String::new()).with_reasoning(context));
    }

    /// True when the final message is an assistant turn that still has no
    /// visible text, i.e. a reasoning primer to be continued.
    pub fn ends_with_reasoning(&self) -> bool {
        self.messages
            .last()
            .is_some_and(|m| m.role == Role::Assistant && m.content.is_empty() && m.reasoning.is_some())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_as_str() {
        assert_eq!(Role::User.as_str(), "user");
        assert_eq!(Role::Assistant.as_str(), "assistant");
        assert_eq!(Role::System.as_str(), "system");
    }

    #[test]
    fn test_split_think_block() {
        let msg = Message::from_model_output("<think>plan it</think>\n{\"a\": 1}", None);
        assert_eq!(msg.reasoning_text(), "plan it");
        assert_eq!(msg.message_text(), "{\"a\": 1}");
    }

    #[test]
    fn test_primed_output_with_only_closing_tag() {
        let msg = Message::from_model_output(" and then more.</think>answer", Some("Okay, first"));
        assert_eq!(msg.reasoning_text(), "Okay, first and then more.");
        assert_eq!(msg.message_text(), "answer");
    }

    #[test]
    fn test_plain_output_has_no_reasoning() {
        let msg = Message::from_model_output("  just text ", None);
        assert!(msg.reasoning.is_none());
        assert_eq!(msg.message_text(), "just text");
    }

    #[test]
    fn test_unterminated_think_is_reasoning() {
        let msg = Message::from_model_output("<think>still going", None);
        assert_eq!(msg.reasoning_text(), "still going");
        assert_eq!(msg.message_text(), "");
    }

    #[test]
    fn test_prompt_content_wraps_reasoning() {
        let msg = Message::assistant("reply").with_reasoning("why");
        assert_eq!(msg.to_prompt_content(), "<think>why</think>reply");
    }

    #[test]
    fn test_last_user_message() {
        let mut conv = Conversation::new();
        assert!(conv.last_user_message().is_none());
        conv.push(Message::user("hi"));
        assert!(conv.last_user_message().is_some());
        conv.push(Message::assistant("hello"));
        assert!(conv.last_user_message().is_none());
    }

    #[test]
    fn test_recent_skips_system() {
        let conv = Conversation::from_messages(vec![
            Message::system("rules"),
            Message::user("a"),
            Message::assistant("b"),
            Message::user("c"),
        ]);
        let recent = conv.recent(10);
        assert_eq!(recent.len(), 3);
        assert!(recent.iter().all(|m| m.role != Role::System));
        assert_eq!(conv.recent(2).len(), 2);
    }

    #[test]
    fn test_add_context_as_reasoning() {
        let mut conv = Conversation::from_messages(vec![Message::user("q")]);
        conv.add_context_as_reasoning("known facts");
        assert!(conv.ends_with_reasoning());
        assert_eq!(conv.last().map(|m| m.reasoning_text()), Some("known facts"));
    }
}
