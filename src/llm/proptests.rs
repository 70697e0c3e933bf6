//! Property-based tests for the block assembler
//!
//! These tests verify that reassembly from a stream preserves key invariants:
//! - Each index reassembles to the concatenation of its deltas
//! - Arrival interleaving across indices does not change the result
//! - Finalization is idempotent
//! - Malformed tool JSON never panics and yields an absent input

use super::assembler::BlockAssembler;
use super::stream::StreamEvent;
use super::types::ContentBlock;
use proptest::prelude::*;
use serde_json::Value;

// ============================================================================
// Strategies
// ============================================================================

/// A block as the server would describe it, before chunking
#[derive(Debug, Clone)]
enum PlannedBlock {
    Text(Vec<String>),
    Tool { name: String, input: Value },
}

fn arb_text_chunks() -> impl Strategy<Value = Vec<String>> {
    proptest::collection::vec("[a-zA-Z0-9 _.!?,]{1,12}", 1..6)
}

fn arb_json_input() -> impl Strategy<Value = Value> {
    proptest::collection::hash_map("[a-z_]{1,8}", "[a-zA-Z0-9 ]{0,12}", 0..4).prop_map(|m| {
        Value::Object(
            m.into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect(),
        )
    })
}

fn arb_block() -> impl Strategy<Value = PlannedBlock> {
    prop_oneof![
        arb_text_chunks().prop_map(PlannedBlock::Text),
        ("[a-z_]{3,12}", arb_json_input())
            .prop_map(|(name, input)| PlannedBlock::Tool { name, input }),
    ]
}

/// Split a string into chunks at char boundaries
fn chunk(s: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = s.chars().collect();
    chars
        .chunks(size.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

/// Per-block delta queues, plus the expected finalized block
fn plan_events(blocks: &[PlannedBlock], json_chunk: usize) -> (Vec<Vec<StreamEvent>>, Vec<ContentBlock>) {
    let mut queues = Vec::new();
    let mut expected = Vec::new();
    for (index, block) in blocks.iter().enumerate() {
        let mut q = Vec::new();
        match block {
            PlannedBlock::Text(chunks) => {
                q.push(StreamEvent::text_start(index));
                for c in chunks {
                    q.push(StreamEvent::text_delta(index, c.clone()));
                }
                expected.push(ContentBlock::text(chunks.concat()));
            }
            PlannedBlock::Tool { name, input } => {
                let id = format!("toolu_{index}");
                q.push(StreamEvent::tool_start(index, &id, name));
                let json = input.to_string();
                for c in chunk(&json, json_chunk) {
                    q.push(StreamEvent::json_delta(index, c));
                }
                expected.push(ContentBlock::tool_use(id, name, Some(input.clone())));
            }
        }
        queues.push(q);
    }
    (queues, expected)
}

/// Interleave queues using `picks` to choose the next non-empty queue,
/// preserving per-queue order (start always precedes that block's deltas)
fn interleave(mut queues: Vec<Vec<StreamEvent>>, picks: &[usize]) -> Vec<StreamEvent> {
    for q in &mut queues {
        q.reverse();
    }
    let mut out = Vec::new();
    let mut pick = picks.iter().copied().cycle();
    loop {
        let live: Vec<usize> = (0..queues.len()).filter(|i| !queues[*i].is_empty()).collect();
        if live.is_empty() {
            break;
        }
        let choice = live[pick.next().unwrap_or(0) % live.len()];
        if let Some(event) = queues[choice].pop() {
            out.push(event);
        }
    }
    out
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn reassembles_each_index(
        blocks in proptest::collection::vec(arb_block(), 1..5),
        json_chunk in 1usize..8,
        picks in proptest::collection::vec(0usize..5, 1..16),
    ) {
        let (queues, expected) = plan_events(&blocks, json_chunk);
        let mut events = interleave(queues, &picks);
        events.push(StreamEvent::stop_reason("end_turn"));
        events.push(StreamEvent::MessageStop);

        let mut asm = BlockAssembler::new();
        for event in events {
            asm.on_event(event).unwrap();
        }
        prop_assert_eq!(asm.finalize().content, expected);
    }

    #[test]
    fn finalize_is_idempotent(
        blocks in proptest::collection::vec(arb_block(), 0..4),
        json_chunk in 1usize..8,
    ) {
        let (queues, _) = plan_events(&blocks, json_chunk);
        let mut asm = BlockAssembler::new();
        for event in queues.into_iter().flatten() {
            asm.on_event(event).unwrap();
        }
        let first = asm.finalize();
        let second = asm.finalize();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn malformed_tool_json_never_panics(garbage in "[{}\\[\\]\":,a-z0-9 ]{1,30}") {
        prop_assume!(!garbage.trim().is_empty());
        prop_assume!(serde_json::from_str::<Value>(&garbage).is_err());

        let mut asm = BlockAssembler::new();
        asm.on_event(StreamEvent::tool_start(0, "t", "create_room")).unwrap();
        asm.on_event(StreamEvent::json_delta(0, garbage)).unwrap();
        asm.on_event(StreamEvent::MessageStop).unwrap();

        let content = asm.finalize().content;
        prop_assert_eq!(content, vec![ContentBlock::tool_use("t", "create_room", None)]);
    }
}
