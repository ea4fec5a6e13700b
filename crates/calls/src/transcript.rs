//! Transcript turns and their canonical ordering.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// A turn as it arrived in a provider payload (payload order).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnInput {
    pub speaker: String,
    pub text: String,
    pub time_offset_seconds: Option<f64>,
}

impl TurnInput {
    pub fn new(speaker: impl Into<String>, text: impl Into<String>, time_offset_seconds: Option<f64>) -> Self {
        Self {
            speaker: speaker.into(),
            text: text.into(),
            time_offset_seconds,
        }
    }
}

/// A stored transcript turn. `position` is the 0-based stored order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub position: u32,
    pub speaker: String,
    pub text: String,
    pub time_offset_seconds: Option<f64>,
}

/// Turn payload turns into the exact sequence that gets stored.
///
/// - turns with blank text are dropped
/// - repeated text is dropped (first occurrence wins); storage is unique on
///   (call, text)
/// - turns are stably ordered by time offset; a turn without an offset sorts
///   as if it had the offset of the turn before it, so it keeps its payload
///   position relative to that turn
pub fn order_turns(turns: Vec<TurnInput>) -> Vec<TranscriptTurn> {
    let mut seen = HashSet::new();
    let mut keyed: Vec<(f64, TurnInput)> = Vec::with_capacity(turns.len());
    let mut carried = f64::NEG_INFINITY;

    for turn in turns {
        if turn.text.trim().is_empty() || !seen.insert(turn.text.clone()) {
            continue;
        }
        let offset = turn.time_offset_seconds.filter(|o| o.is_finite());
        if let Some(offset) = offset {
            carried = offset;
        }
        keyed.push((
            carried,
            TurnInput {
                time_offset_seconds: offset,
                ..turn
            },
        ));
    }

    keyed.sort_by(|a, b| a.0.total_cmp(&b.0));

    keyed
        .into_iter()
        .enumerate()
        .map(|(position, (_, turn))| TranscriptTurn {
            position: position as u32,
            speaker: turn.speaker,
            text: turn.text,
            time_offset_seconds: turn.time_offset_seconds,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn offsets(turns: &[TranscriptTurn]) -> Vec<Option<f64>> {
        turns.iter().map(|t| t.time_offset_seconds).collect()
    }

    #[test]
    fn sorts_by_offset() {
        let ordered = order_turns(vec![
            TurnInput::new("agent", "third", Some(12.0)),
            TurnInput::new("user", "first", Some(1.0)),
            TurnInput::new("agent", "second", Some(5.0)),
        ]);

        assert_eq!(offsets(&ordered), vec![Some(1.0), Some(5.0), Some(12.0)]);
        assert_eq!(ordered[0].text, "first");
        assert_eq!(
            ordered.iter().map(|t| t.position).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn turns_without_offsets_keep_payload_order() {
        let ordered = order_turns(vec![
            TurnInput::new("agent", "hello", None),
            TurnInput::new("user", "hi", None),
            TurnInput::new("agent", "how are you", None),
        ]);

        let texts: Vec<_> = ordered.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["hello", "hi", "how are you"]);
    }

    #[test]
    fn untimed_turn_follows_its_predecessor() {
        let ordered = order_turns(vec![
            TurnInput::new("agent", "b", Some(10.0)),
            TurnInput::new("user", "b-followup", None),
            TurnInput::new("agent", "a", Some(2.0)),
        ]);

        let texts: Vec<_> = ordered.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "b-followup"]);
    }

    #[test]
    fn blank_and_duplicate_text_is_skipped() {
        let ordered = order_turns(vec![
            TurnInput::new("agent", "hello", Some(0.0)),
            TurnInput::new("user", "   ", Some(1.0)),
            TurnInput::new("agent", "hello", Some(2.0)),
            TurnInput::new("user", "bye", Some(3.0)),
        ]);

        let texts: Vec<_> = ordered.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["hello", "bye"]);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: ordering is idempotent (re-ordering stored turns is a no-op).
        #[test]
        fn ordering_is_idempotent(raw in prop::collection::vec((0u32..500, prop::option::of(0u16..600)), 0..30)) {
            let input: Vec<TurnInput> = raw
                .iter()
                .map(|(n, offset)| TurnInput::new("s", format!("turn {n}"), offset.map(f64::from)))
                .collect();

            let once = order_turns(input);
            let again = order_turns(
                once.iter()
                    .map(|t| TurnInput::new(t.speaker.clone(), t.text.clone(), t.time_offset_seconds))
                    .collect(),
            );
            prop_assert_eq!(once, again);
        }
    }
}
