//! Token-budgeted view over the interaction history.

use crate::core::types::HistoryEntry;

/// Fixed per-message overhead added to every estimate.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Approximate token count of one message: `ceil(chars / 4)` plus overhead.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4) + MESSAGE_OVERHEAD_TOKENS
}

/// Anything that occupies prompt space as one atomic unit.
pub trait TokenCost {
    fn token_cost(&self) -> usize;
}

impl TokenCost for HistoryEntry {
    fn token_cost(&self) -> usize {
        self.rejection_message()
            .map_or(0, |message| estimate_tokens(&message.content))
            + estimate_tokens(&self.assistant_message().content)
            + estimate_tokens(&self.result_message().content)
    }
}

/// Entries selected for the next prompt, oldest first.
#[derive(Debug)]
pub struct ContextWindow<'a, T> {
    pub entries: Vec<&'a T>,
    /// Number of older entries left out.
    pub trimmed: usize,
    /// The newest entry alone exceeds the budget.
    pub over_budget: bool,
    pub tokens: usize,
}

/// Select the newest entries that fit in `budget` tokens.
///
/// The newest entry is always included, even when it alone is over budget.
pub fn build<T: TokenCost>(history: &[T], budget: usize) -> ContextWindow<'_, T> {
    let mut entries = Vec::new();
    let mut tokens = 0usize;
    let mut over_budget = false;

    for (taken, entry) in history.iter().rev().enumerate() {
        let cost = entry.token_cost();
        let next = tokens.saturating_add(cost);
        if next > budget {
            if taken == 0 {
                entries.push(entry);
                tokens = next;
                over_budget = true;
            }
            break;
        }
        entries.push(entry);
        tokens = next;
    }

    entries.reverse();
    ContextWindow {
        trimmed: history.len() - entries.len(),
        entries,
        over_budget,
        tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Cost(usize);

    impl TokenCost for Cost {
        fn token_cost(&self) -> usize {
            self.0
        }
    }

    fn positions<T>(window: &ContextWindow<'_, T>, history: &[T]) -> Vec<usize> {
        window
            .entries
            .iter()
            .map(|e| {
                history
                    .iter()
                    .position(|h| std::ptr::eq(h, *e))
                    .expect("entry from history")
            })
            .collect()
    }

    #[test]
    fn estimate_rounds_up_and_adds_overhead() {
        assert_eq!(estimate_tokens(""), 4);
        assert_eq!(estimate_tokens("abcd"), 5);
        assert_eq!(estimate_tokens("abcde"), 6);
    }

    #[test]
    fn unbounded_budget_is_identity() {
        let history: Vec<Cost> = (1..=5).map(Cost).collect();
        let window = build(&history, usize::MAX);
        assert_eq!(positions(&window, &history), vec![0, 1, 2, 3, 4]);
        assert_eq!(window.trimmed, 0);
        assert!(!window.over_budget);
    }

    #[test]
    fn trims_oldest_first_and_keeps_order() {
        let history = vec![Cost(10), Cost(10), Cost(10), Cost(10)];
        let window = build(&history, 25);
        assert_eq!(positions(&window, &history), vec![2, 3]);
        assert_eq!(window.trimmed, 2);
        assert_eq!(window.tokens, 20);
    }

    #[test]
    fn stops_at_first_entry_that_does_not_fit() {
        // Entry 0 would fit on its own, but entry 1 already broke the walk.
        let history = vec![Cost(1), Cost(50), Cost(10)];
        let window = build(&history, 30);
        assert_eq!(positions(&window, &history), vec![2]);
        assert_eq!(window.trimmed, 2);
    }

    #[test]
    fn newest_entry_always_present_when_over_budget() {
        let history = vec![Cost(5), Cost(500)];
        let window = build(&history, 100);
        assert_eq!(positions(&window, &history), vec![1]);
        assert!(window.over_budget);
        assert_eq!(window.tokens, 500);
    }

    #[test]
    fn empty_history_is_empty_window() {
        let history: Vec<Cost> = Vec::new();
        let window = build(&history, 0);
        assert!(window.entries.is_empty());
        assert!(!window.over_budget);
    }
}
