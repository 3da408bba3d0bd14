//! Request chunking across data-parallel shards
//!
//! A batch is split into exactly `n` contiguous chunks whose sizes
//! differ by at most one, so partitioning is deterministic for a fixed
//! input length regardless of content. Shards that would receive an
//! empty chunk get a placeholder item instead: every shard must execute
//! the call to keep tensor-parallel collectives inside the engine in
//! lock-step.

use swapserve_proto::ChatMessage;

/// Substituted for an empty chunk so the shard still executes the call.
pub const PLACEHOLDER_PROMPT: &str = "<placeholder>";

/// Split `items` into `n` contiguous chunks; the first `len % n`
/// chunks carry one extra item. Concatenating the chunks yields the
/// input in its original order.
pub fn chunk_evenly<T: Clone>(items: &[T], n: usize) -> Vec<Vec<T>> {
    let size = items.len() / n;
    let remainder = items.len() % n;

    (0..n)
        .map(|i| {
            let start = i * size + i.min(remainder);
            let end = start + size + usize::from(i < remainder);
            items[start..end].to_vec()
        })
        .collect()
}

/// Placeholder conversation for an empty chat chunk.
pub fn placeholder_conversation() -> Vec<ChatMessage> {
    vec![ChatMessage::new("user", PLACEHOLDER_PROMPT)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_prompts_over_two_shards_split_three_two() {
        let items: Vec<usize> = (0..5).collect();
        let chunks = chunk_evenly(&items, 2);
        assert_eq!(chunks, vec![vec![0, 1, 2], vec![3, 4]]);
    }

    #[test]
    fn chunk_sizes_differ_by_at_most_one_and_concatenation_preserves_order() {
        for len in 0..24usize {
            let items: Vec<usize> = (0..len).collect();
            for n in 1..7usize {
                let chunks = chunk_evenly(&items, n);
                assert_eq!(chunks.len(), n, "len={} n={}", len, n);

                let min = chunks.iter().map(Vec::len).min().unwrap();
                let max = chunks.iter().map(Vec::len).max().unwrap();
                assert!(max - min <= 1, "len={} n={}", len, n);

                let rejoined: Vec<usize> = chunks.into_iter().flatten().collect();
                assert_eq!(rejoined, items, "len={} n={}", len, n);
            }
        }
    }

    #[test]
    fn more_shards_than_items_yields_empty_tail_chunks() {
        let items = vec!["a", "b"];
        let chunks = chunk_evenly(&items, 4);
        assert_eq!(chunks[0], vec!["a"]);
        assert_eq!(chunks[1], vec!["b"]);
        assert!(chunks[2].is_empty());
        assert!(chunks[3].is_empty());
    }

    #[test]
    fn placeholder_conversation_is_a_single_user_turn() {
        let conversation = placeholder_conversation();
        assert_eq!(conversation.len(), 1);
        assert_eq!(conversation[0].role, "user");
        assert_eq!(conversation[0].content, PLACEHOLDER_PROMPT);
    }
}
