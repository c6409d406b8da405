use serde::{Deserialize, Serialize};

use crate::inference::RawCompletion;

const USER_SPEAKER: &str = "User";
const ASSISTANT_SPEAKER: &str = "Assistant";

/// Speaker of a chat turn. Anything that is not `user` (ignoring case) is
/// treated as the assistant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn from_label(label: &str) -> Self {
        if label.eq_ignore_ascii_case("user") {
            Role::User
        } else {
            Role::Assistant
        }
    }

    #[inline]
    pub fn is_user(&self) -> bool {
        matches!(self, Role::User)
    }

    pub fn speaker(&self) -> &'static str {
        if self.is_user() {
            USER_SPEAKER
        } else {
            ASSISTANT_SPEAKER
        }
    }
}

impl From<String> for Role {
    fn from(label: String) -> Self {
        Role::from_label(&label)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Renders the conversation as `Speaker: content` lines and cues the model
/// with a trailing `Assistant:` line.
pub fn format_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::with_capacity(
        messages
            .iter()
            .map(|m| m.content.len() + ASSISTANT_SPEAKER.len() + 3)
            .sum::<usize>()
            + ASSISTANT_SPEAKER.len()
            + 1,
    );

    for msg in messages {
        prompt.push_str(msg.role.speaker());
        prompt.push_str(": ");
        prompt.push_str(&msg.content);
        prompt.push('\n');
    }

    prompt.push_str(ASSISTANT_SPEAKER);
    prompt.push(':');
    prompt
}

/// Turns raw generator output into the chat reply.
///
/// The prompt is only stripped when the output really starts with it, so a
/// generator that does not echo its input keeps its leading text.
pub fn extract_reply(raw: RawCompletion, prompt: &str) -> String {
    let text = raw.into_text();
    let reply = text.strip_prefix(prompt).unwrap_or(&text);
    reply.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, content: &str) -> ChatMessage {
        ChatMessage::new(Role::from_label(role), content)
    }

    #[test]
    fn single_user_turn() {
        let prompt = format_prompt(&[msg("user", "Hi")]);
        assert_eq!(prompt, "User: Hi\nAssistant:");
    }

    #[test]
    fn empty_conversation_still_cues_assistant() {
        assert_eq!(format_prompt(&[]), "Assistant:");
    }

    #[test]
    fn one_line_per_message_in_order() {
        let messages = vec![
            msg("user", "first"),
            msg("assistant", "second"),
            msg("user", "third"),
        ];
        let prompt = format_prompt(&messages);
        let lines: Vec<&str> = prompt.lines().collect();
        assert_eq!(
            lines,
            vec![
                "User: first",
                "Assistant: second",
                "User: third",
                "Assistant:"
            ]
        );
    }

    #[test]
    fn role_matching_ignores_case() {
        for label in ["USER", "user", "User", "uSeR"] {
            assert_eq!(Role::from_label(label), Role::User, "{label}");
        }
        for label in ["assistant", "system", "", "users", "bot"] {
            assert_eq!(Role::from_label(label), Role::Assistant, "{label}");
        }
    }

    #[test]
    fn speaker_follows_role() {
        assert!(Role::User.is_user());
        assert!(!Role::Assistant.is_user());
        assert_eq!(Role::User.speaker(), "User");
        assert_eq!(Role::Assistant.speaker(), "Assistant");
    }

    #[test]
    fn role_deserializes_from_any_string() {
        let m: ChatMessage =
            serde_json::from_str(r#"{"role":"SYSTEM","content":"be nice"}"#).unwrap();
        assert_eq!(m.role, Role::Assistant);

        let m: ChatMessage = serde_json::from_str(r#"{"role":"User","content":"x"}"#).unwrap();
        assert!(m.role.is_user());
        assert_eq!(
            serde_json::to_value(&m).unwrap(),
            serde_json::json!({"role": "user", "content": "x"})
        );
    }

    #[test]
    fn strips_echoed_prompt() {
        let prompt = format_prompt(&[msg("user", "Hi")]);
        let raw = RawCompletion::Text(format!("{prompt} Hello!  \n"));
        assert_eq!(extract_reply(raw, &prompt), "Hello!");
    }

    #[test]
    fn keeps_output_without_echo() {
        let prompt = "User: Hi\nAssistant:";
        let raw = RawCompletion::Text("  Hello there\n".into());
        assert_eq!(extract_reply(raw, prompt), "Hello there");
    }

    #[test]
    fn joins_chunks_before_stripping() {
        let prompt = "User: Hi\nAssistant:";
        let raw = RawCompletion::Chunks(vec![
            "User: Hi\n".into(),
            "Assistant:".into(),
            " Hel".into(),
            "lo!".into(),
        ]);
        assert_eq!(extract_reply(raw, prompt), "Hello!");
    }
}
