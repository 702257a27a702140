//! Prompt assembly shared by the LLM clients

use super::ChatTurn;
use crate::session::{Message, Role};

const CONVERSATION_NOTE: &str =
    "You are now in a conversation with a user. Respond to their messages with empathy and support.";

const CONTEXT_USAGE_NOTE: &str = "\
IMPORTANT CONTEXT USAGE INSTRUCTIONS: You may receive additional knowledge context for some \
queries. Only reference or use this context when it is directly relevant to answering complex \
or specific questions. For simple greetings, conversational exchanges or general knowledge \
questions, rely on your own knowledge without mentioning the provided context or the retrieval \
process.";

/// Build the system instruction from the persona prompt
#[must_use]
pub fn system_instruction(persona: &str) -> String {
    let persona = persona.trim();
    if persona.is_empty() {
        format!("{CONVERSATION_NOTE}\n\n{CONTEXT_USAGE_NOTE}")
    } else {
        format!("{persona}\n\n{CONVERSATION_NOTE}\n\n{CONTEXT_USAGE_NOTE}")
    }
}

/// Wrap retrieved context as a preliminary user turn
#[must_use]
pub fn context_preamble(context: &str) -> String {
    format!(
        "Here is some additional information that may be relevant to the user's query. \
         Only use this if needed for complex or specific questions:\n\n{context}"
    )
}

/// Convert the most recent `max` history messages to chat turns, oldest first
#[must_use]
pub fn recent_turns(history: &[Message], max: usize) -> Vec<ChatTurn> {
    let start = history.len().saturating_sub(max);
    history[start..]
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| ChatTurn {
            role: m.role,
            content: m.content.clone(),
        })
        .collect()
}

/// Role name used by the Gemini API
#[must_use]
pub const fn gemini_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "model",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persona_comes_first() {
        let prompt = system_instruction("You are kind.");
        assert!(prompt.starts_with("You are kind."));
        assert!(prompt.contains("CONTEXT USAGE"));
    }

    #[test]
    fn empty_persona_still_has_instructions() {
        let prompt = system_instruction("  ");
        assert!(prompt.starts_with("You are now in a conversation"));
    }

    #[test]
    fn context_is_embedded() {
        let text = context_preamble("Water boils at 100C.");
        assert!(text.ends_with("Water boils at 100C."));
    }

    #[test]
    fn recent_turns_keeps_tail() {
        let history: Vec<Message> = (0..5)
            .map(|i| {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                Message::new(role, format!("m{i}"), None)
            })
            .collect();

        let turns = recent_turns(&history, 2);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "m3");
        assert_eq!(turns[1].role, Role::User);
    }

    #[test]
    fn gemini_roles() {
        assert_eq!(gemini_role(Role::User), "user");
        assert_eq!(gemini_role(Role::Assistant), "model");
    }
}
