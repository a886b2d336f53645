//! Session snapshot types.
//!
//! Hot facts serialize with full type information (`{predicate,
//! args: [{type, value}]}`), never as formatted strings, so restore is a
//! faithful round trip. Structural validation happens before any
//! re-assertion: a malformed snapshot is an error, never a panic.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::{CompressedTurn, RollingSummary};
use crate::datalog::{Fact, Origin};
use crate::error::{Error, Result};

/// One persisted hot fact with its origin and activation score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotFact {
    /// The fact, typed
    pub fact: Fact,
    /// Origin preserved across restore
    pub origin: Origin,
    /// Activation score at snapshot time
    pub score: f64,
}

/// Everything needed to rehydrate a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Session identity
    pub session_id: String,
    /// Turn counter at snapshot time
    pub turn_number: u64,
    /// Rolling summary
    pub rolling_summary: RollingSummary,
    /// The verbatim recent-turn window
    pub recent_turns: Vec<CompressedTurn>,
    /// Top-N facts by activation score
    pub hot_facts: Vec<HotFact>,
}

impl SessionSnapshot {
    /// Structural validation before re-assertion.
    pub fn validate(&self) -> Result<()> {
        Uuid::parse_str(&self.session_id)
            .map_err(|e| Error::SessionStorage(format!("bad session id: {}", e)))?;
        for turn in &self.recent_turns {
            if turn.turn > self.turn_number {
                return Err(Error::SessionStorage(format!(
                    "recent turn {} exceeds turn counter {}",
                    turn.turn, self.turn_number
                )));
            }
        }
        for hot in &self.hot_facts {
            if hot.fact.predicate.is_empty() {
                return Err(Error::SessionStorage(
                    "hot fact with empty predicate".to_string(),
                ));
            }
            if hot.fact.args.iter().any(|c| c.is_nan()) {
                return Err(Error::SessionStorage(
                    "hot fact with NaN argument".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalog::Const;

    fn snapshot() -> SessionSnapshot {
        SessionSnapshot {
            session_id: Uuid::new_v4().to_string(),
            turn_number: 3,
            rolling_summary: RollingSummary {
                text: "did things".into(),
                through_turn: 1,
            },
            recent_turns: vec![CompressedTurn::new(2), CompressedTurn::new(3)],
            hot_facts: vec![HotFact {
                fact: Fact::new("edge", vec![Const::name("a"), Const::name("b")]),
                origin: Origin::User { turn: 2 },
                score: 88.5,
            }],
        }
    }

    #[test]
    fn test_round_trip_preserves_types() {
        let snap = snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        let back: SessionSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snap, back);
        assert_eq!(back.hot_facts[0].fact.args[0], Const::name("a"));
    }

    #[test]
    fn test_validation_rejects_bad_shapes() {
        let mut bad_id = snapshot();
        bad_id.session_id = "not-a-uuid".into();
        assert!(bad_id.validate().is_err());

        let mut bad_turn = snapshot();
        bad_turn.recent_turns.push(CompressedTurn::new(99));
        assert!(bad_turn.validate().is_err());

        let mut bad_fact = snapshot();
        bad_fact.hot_facts[0].fact.predicate = String::new();
        assert!(bad_fact.validate().is_err());

        assert!(snapshot().validate().is_ok());
    }
}
