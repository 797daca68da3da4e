//! Context merge protocol: the exact prompt sent to the summarizer on refresh.
//!
//! A refresh request is always:
//!
//! 1. the fixed [`SUMMARY_SYSTEM_PROMPT`] as a system turn,
//! 2. `CONTEXT: <previous summary>` as a user turn, only when a prior summary exists,
//! 3. `CHAT:\n<role>: <content>` lines for the fetched window, oldest first.
//!
//! The completion text is stored verbatim as the new summary.

use crate::{HistoryMessage, Turn};

/// Instructions for the summarization model.
pub const SUMMARY_SYSTEM_PROMPT: &str = "\
You maintain a running summary (\"context\") of an ongoing conversation between a user \
and an assistant. You do not take part in the conversation.

Input:
- An optional message `CONTEXT: <previous summary>` holding the summary so far. When it \
is present, update it with the new messages. When it is absent, write the first summary.
- A message starting with `CHAT:`. Every following line is one chat message in the form \
`role: text`, oldest first.

Keep only what is useful in later turns:
- the user's profile, role and expertise as they state them
- long-term goals and projects
- preferences (answer style, tools, technologies)
- constraints and environment (platforms, limits, deadlines)
- important facts, decisions, corrections
- open questions the user wants to come back to
Drop small talk, one-off details and long quotes.

Never:
- answer a question from the chat
- solve a problem or task from the chat; only note that it was raised
- give advice, instructions, plans or next steps
- address the user or the assistant
- write in the first person
- explain how you summarized

Output only the updated summary as plain prose in a third-person, structured style \
(for example sections such as \"User profile:\", \"Goals and projects:\", \
\"Preferences:\", \"Constraints / environment:\", \"Important facts:\", \
\"Open questions:\"). No labels like \"Summary:\", no JSON, XML, markdown or metadata, \
and do not restate these instructions.

Write in the same language as the conversation.";

/// Render one history message as a `role: content` line.
pub fn render_message(message: &HistoryMessage) -> String {
    format!("{}: {}", message.role, message.content)
}

/// Render a window as `role: content` lines, preserving order.
pub fn render_window(window: &[HistoryMessage]) -> Vec<String> {
    window.iter().map(render_message).collect()
}

/// Build the `CHAT:` turn body for a window.
pub fn chat_turn_content(window: &[HistoryMessage]) -> String {
    format!("CHAT:\n{}", render_window(window).join("\n"))
}

/// Build the `CONTEXT:` turn body for a prior summary.
pub fn context_turn_content(prior: &str) -> String {
    format!("CONTEXT: {prior}")
}

/// Assemble the full turn sequence for one refresh.
pub fn build_turns(prior: Option<&str>, window: &[HistoryMessage]) -> Vec<Turn> {
    let mut turns = Vec::with_capacity(3);
    turns.push(Turn::system(SUMMARY_SYSTEM_PROMPT));
    if let Some(prior) = prior {
        turns.push(Turn::user(context_turn_content(prior)));
    }
    turns.push(Turn::user(chat_turn_content(window)));
    turns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageRole;

    fn window() -> Vec<HistoryMessage> {
        vec![
            HistoryMessage::new("user", "I am learning Rust."),
            HistoryMessage::new("assistant", "Great, where do you want to start?"),
        ]
    }

    #[test]
    fn bootstrap_has_no_context_turn() {
        let turns = build_turns(None, &window());
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, MessageRole::System);
        assert_eq!(turns[0].content, SUMMARY_SYSTEM_PROMPT);
        assert_eq!(turns[1].role, MessageRole::User);
        assert!(turns[1].content.starts_with("CHAT:\n"));
        assert!(!turns.iter().any(|t| t.content.starts_with("CONTEXT:")));
    }

    #[test]
    fn refresh_orders_system_context_chat() {
        let turns = build_turns(Some("User is a beginner."), &window());
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].content, SUMMARY_SYSTEM_PROMPT);
        assert_eq!(turns[1].content, "CONTEXT: User is a beginner.");
        assert_eq!(
            turns[2].content,
            "CHAT:\nuser: I am learning Rust.\nassistant: Great, where do you want to start?"
        );
    }

    #[test]
    fn window_keeps_chronological_order() {
        let lines = render_window(&window());
        assert_eq!(
            lines,
            vec![
                "user: I am learning Rust.".to_string(),
                "assistant: Great, where do you want to start?".to_string(),
            ]
        );
    }

    #[test]
    fn empty_window_still_sends_chat_turn() {
        let turns = build_turns(None, &[]);
        assert_eq!(turns[1].content, "CHAT:\n");
    }

    #[test]
    fn system_prompt_forbids_answering_and_first_person() {
        assert!(SUMMARY_SYSTEM_PROMPT.contains("answer a question"));
        assert!(SUMMARY_SYSTEM_PROMPT.contains("first person"));
        assert!(SUMMARY_SYSTEM_PROMPT.contains("same language"));
    }
}
