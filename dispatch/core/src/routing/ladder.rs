//! Escalation Ladders
//!
//! Ordered backend sequences keyed by (task kind, complexity). The router
//! walks a ladder front to back, cheapest first, until one entry serves the
//! call.
//!
//! ```text
//! (code_generation, medium)
//!         |
//!         v
//!   haiku ──capacity──> sonnet ──failure──> opus ──> NoCapacityAvailable
//! ```
//!
//! Ladders are validated when the table is built: no empty ladders, no
//! repeated entries, every entry names a configured backend. The table is
//! read-only afterwards.

use std::collections::{HashMap, HashSet};

use crate::job::{Complexity, TaskKind};

// ============================================================================
// Escalation Ladder
// ============================================================================

/// Ordered, immutable backend sequence for one (task kind, complexity) pair
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EscalationLadder {
    pub task_kind: TaskKind,
    pub complexity: Complexity,
    backends: Vec<String>,
}

impl EscalationLadder {
    pub fn new(task_kind: TaskKind, complexity: Complexity, backends: Vec<String>) -> Self {
        Self {
            task_kind,
            complexity,
            backends,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.backends.iter().map(String::as_str)
    }

    #[must_use]
    pub fn backends(&self) -> &[String] {
        &self.backends
    }

    /// Entry tried after `current`, if any
    #[must_use]
    pub fn next_after(&self, current: &str) -> Option<&str> {
        let pos = self.position(current)?;
        self.backends.get(pos + 1).map(String::as_str)
    }

    #[must_use]
    pub fn position(&self, backend_id: &str) -> Option<usize> {
        self.backends.iter().position(|b| b == backend_id)
    }

    #[must_use]
    pub fn contains(&self, backend_id: &str) -> bool {
        self.position(backend_id).is_some()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.backends.len()
    }
}

// ============================================================================
// Ladder Table
// ============================================================================

/// Static lookup table of escalation ladders
#[derive(Clone, Debug, Default)]
pub struct LadderTable {
    ladders: HashMap<(TaskKind, Complexity), EscalationLadder>,
}

impl LadderTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table, validating every ladder against the known backends
    pub fn build<'a>(
        ladders: impl IntoIterator<Item = EscalationLadder>,
        known_backends: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, LadderError> {
        let known: HashSet<&str> = known_backends.into_iter().collect();
        let mut table = Self::new();

        for ladder in ladders {
            Self::validate(&ladder, &known)?;
            let key = (ladder.task_kind, ladder.complexity);
            if table.ladders.contains_key(&key) {
                return Err(LadderError::DuplicateLadder {
                    task_kind: ladder.task_kind,
                    complexity: ladder.complexity,
                });
            }
            table.ladders.insert(key, ladder);
        }

        Ok(table)
    }

    fn validate(ladder: &EscalationLadder, known: &HashSet<&str>) -> Result<(), LadderError> {
        if ladder.backends.is_empty() {
            return Err(LadderError::EmptyLadder {
                task_kind: ladder.task_kind,
                complexity: ladder.complexity,
            });
        }

        let mut seen = HashSet::new();
        for backend in &ladder.backends {
            if !known.contains(backend.as_str()) {
                return Err(LadderError::UnknownBackend {
                    backend: backend.clone(),
                });
            }
            // A repeated entry would retry a backend that already declined
            if !seen.insert(backend.as_str()) {
                return Err(LadderError::RepeatedBackend {
                    backend: backend.clone(),
                });
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn get(&self, task_kind: TaskKind, complexity: Complexity) -> Option<&EscalationLadder> {
        self.ladders.get(&(task_kind, complexity))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ladders.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ladders.is_empty()
    }

    /// All ladders in (task kind, complexity) order
    #[must_use]
    pub fn sorted(&self) -> Vec<&EscalationLadder> {
        let mut all: Vec<_> = self.ladders.values().collect();
        all.sort_by_key(|l| (l.task_kind, l.complexity));
        all
    }

    /// Deepest ladder length, 0 for an empty table
    #[must_use]
    pub fn max_depth(&self) -> usize {
        self.ladders
            .values()
            .map(EscalationLadder::depth)
            .max()
            .unwrap_or(0)
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LadderError {
    EmptyLadder {
        task_kind: TaskKind,
        complexity: Complexity,
    },
    UnknownBackend {
        backend: String,
    },
    RepeatedBackend {
        backend: String,
    },
    DuplicateLadder {
        task_kind: TaskKind,
        complexity: Complexity,
    },
}

impl std::fmt::Display for LadderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyLadder {
                task_kind,
                complexity,
            } => write!(f, "Ladder for {task_kind}/{complexity} is empty"),
            Self::UnknownBackend { backend } => {
                write!(f, "Ladder references unknown backend: {backend}")
            }
            Self::RepeatedBackend { backend } => {
                write!(f, "Backend {backend} appears twice in one ladder")
            }
            Self::DuplicateLadder {
                task_kind,
                complexity,
            } => write!(f, "Ladder for {task_kind}/{complexity} is defined twice"),
        }
    }
}

impl std::error::Error for LadderError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ladder(ids: &[&str]) -> EscalationLadder {
        EscalationLadder::new(
            TaskKind::CodeGeneration,
            Complexity::Simple,
            ids.iter().map(|s| (*s).to_string()).collect(),
        )
    }

    #[test]
    fn test_ladder_order() {
        let l = ladder(&["b1", "b2", "b3"]);
        assert_eq!(l.iter().collect::<Vec<_>>(), vec!["b1", "b2", "b3"]);
        assert_eq!(l.next_after("b1"), Some("b2"));
        assert_eq!(l.next_after("b3"), None);
        assert_eq!(l.next_after("zz"), None);
        assert!(l.contains("b2"));
        assert_eq!(l.depth(), 3);
    }

    #[test]
    fn test_build_and_lookup() {
        let table = LadderTable::build([ladder(&["b1", "b2"])], ["b1", "b2"]).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table
            .get(TaskKind::CodeGeneration, Complexity::Simple)
            .is_some());
        assert!(table
            .get(TaskKind::CodeGeneration, Complexity::Complex)
            .is_none());
        assert_eq!(table.max_depth(), 2);
    }

    #[test]
    fn test_rejects_unknown_backend() {
        let err = LadderTable::build([ladder(&["b1", "ghost"])], ["b1"]).unwrap_err();
        assert_eq!(
            err,
            LadderError::UnknownBackend {
                backend: "ghost".to_string()
            }
        );
    }

    #[test]
    fn test_rejects_repeated_entry() {
        let err = LadderTable::build([ladder(&["b1", "b2", "b1"])], ["b1", "b2"]).unwrap_err();
        assert!(matches!(err, LadderError::RepeatedBackend { .. }));
    }

    #[test]
    fn test_rejects_empty_and_duplicate_ladders() {
        let err = LadderTable::build([ladder(&[])], ["b1"]).unwrap_err();
        assert!(matches!(err, LadderError::EmptyLadder { .. }));

        let err = LadderTable::build([ladder(&["b1"]), ladder(&["b1"])], ["b1"]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Ladder for code_generation/simple is defined twice"
        );
    }
}
