use std::sync::{Mutex, PoisonError};

use common::utils::llm::ChatMessage;

/// Completed question/answer exchanges kept as context for the next turn.
pub const MAX_HISTORY_TURNS: usize = 3;

pub const KB_SYSTEM_PROMPT: &str = "You are a careful assistant answering questions about the user's documents. \
Base your answer on the context excerpts below. When the context does not \
contain the answer, say so instead of guessing.\n\nContext:\n{context}";

pub const GENERAL_SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer the user's question directly and \
concisely. If you are unsure, say so.";

/// Bounded conversation history.
///
/// The history never holds more than `2 * MAX_HISTORY_TURNS` messages; it
/// is trimmed both when a turn is recorded and when messages are assembled,
/// so a freshly loaded oversized history cannot leak past the bound either.
#[derive(Default)]
pub struct ConversationManager {
    history: Mutex<Vec<ChatMessage>>,
}

impl ConversationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn turn_count(&self) -> usize {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
            / 2
    }

    pub fn clear(&self) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Appends a completed turn. Called only after the answer finished
    /// streaming, so an aborted answer leaves no half-recorded turn.
    pub fn record_turn(&self, question: &str, answer: &str) {
        let mut guard = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        guard.push(ChatMessage::human(question));
        guard.push(ChatMessage::assistant(answer));
        trim(&mut guard);
    }

    /// Builds the message list for one turn: system prompt, trimmed
    /// history, then the current question.
    pub fn build_messages(&self, system_prompt: &str, question: &str) -> Vec<ChatMessage> {
        let mut guard = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        trim(&mut guard);

        let mut messages = Vec::with_capacity(guard.len() + 2);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend(guard.iter().cloned());
        messages.push(ChatMessage::human(question));
        messages
    }
}

fn trim(history: &mut Vec<ChatMessage>) {
    let max_messages = 2 * MAX_HISTORY_TURNS;
    if history.len() > max_messages {
        let excess = history.len() - max_messages;
        history.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::utils::llm::ChatRole;

    #[test]
    fn test_history_is_bounded() {
        let conversation = ConversationManager::new();
        for i in 0..10 {
            conversation.record_turn(&format!("question {i}"), &format!("answer {i}"));
        }

        let history = conversation.history();
        assert_eq!(history.len(), 2 * MAX_HISTORY_TURNS);
        // Oldest turns were dropped
        assert_eq!(history[0].content, "question 7");
        assert_eq!(conversation.turn_count(), MAX_HISTORY_TURNS);
    }

    #[test]
    fn test_build_messages_shape() {
        let conversation = ConversationManager::new();
        conversation.record_turn("earlier question", "earlier answer");

        let messages = conversation.build_messages(GENERAL_SYSTEM_PROMPT, "current question");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, ChatRole::System);
        assert_eq!(messages[1].content, "earlier question");
        assert_eq!(messages[2].content, "earlier answer");
        assert_eq!(
            messages.last().expect("question message").content,
            "current question"
        );
    }

    #[test]
    fn test_clear_resets_turn_count() {
        let conversation = ConversationManager::new();
        conversation.record_turn("q", "a");
        assert_eq!(conversation.turn_count(), 1);
        conversation.clear();
        assert_eq!(conversation.turn_count(), 0);
        assert!(conversation.history().is_empty());
    }
}
