// Property-based tests for chunk reassembly

use mesh_core::ChunkManager;
use proptest::prelude::*;
use shared::ChunkConfig;

fn manager(max_text_length: usize) -> ChunkManager {
    ChunkManager::new(ChunkConfig {
        max_text_length,
        ..ChunkConfig::default()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Any arrival order, with duplicates, rebuilds the text exactly once
    #[test]
    fn prop_any_order_reassembles(
        text in "\\PC{201,1200}",
        order in any::<u64>(),
        duplicates in prop::collection::vec(any::<prop::sample::Index>(), 0..6),
    ) {
        let manager = manager(200);
        let mut chunks = manager.chunk_message(&text, 42).unwrap();
        prop_assert_eq!(chunks.len(), (text.chars().count() + 199) / 200);

        // Shuffle deterministically from the drawn seed
        let mut seed = order;
        for i in (1..chunks.len()).rev() {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            chunks.swap(i, (seed >> 33) as usize % (i + 1));
        }
        let last = chunks.pop().unwrap();
        for index in &duplicates {
            if !chunks.is_empty() {
                let dup = chunks[index.index(chunks.len())].clone();
                chunks.push(dup);
            }
        }

        for chunk in chunks {
            let result = manager.handle_incoming_chunk(chunk);
            prop_assert!(!result.complete);
            prop_assert!(result.error.is_none());
        }

        let result = manager.handle_incoming_chunk(last);
        prop_assert!(result.complete);
        prop_assert_eq!(result.message, Some(text));
        prop_assert_eq!(manager.pending_count(), 0);
    }

    /// Every chunk fits the per-packet limit
    #[test]
    fn prop_chunks_fit_limit(text in "\\PC{0,2000}", limit in 8usize..300) {
        let manager = manager(limit);
        let chunks = manager.chunk_message(&text, 1).unwrap();
        prop_assert!(chunks.iter().all(|c| c.text.chars().count() <= limit));
        prop_assert_eq!(chunks.iter().map(|c| c.text.as_str()).collect::<String>(), text);
    }
}
