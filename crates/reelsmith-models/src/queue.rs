//! Queue entry outcomes and trigger summaries.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// What happened to one claimed queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EntryOutcome {
    /// Handler succeeded; entry removed
    Completed {
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// Handler failed; entry re-inserted with a later due time
    Requeued {
        retry_count: u32,
        due_at: DateTime<Utc>,
        error: String,
    },
    /// Entry too old; dropped without running the handler
    Expired,
    /// Retries exhausted or permanent failure; entry moved to the dead-letter set
    DeadLettered { retry_count: u32, error: String },
    /// Entry restored untouched: the budget ran out before it was reached, or
    /// its outcome could not be recorded
    Deferred { reason: String },
}

impl EntryOutcome {
    pub fn completed(detail: Option<String>) -> Self {
        Self::Completed { detail }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryOutcome::Completed { .. } => "completed",
            EntryOutcome::Requeued { .. } => "requeued",
            EntryOutcome::Expired => "expired",
            EntryOutcome::DeadLettered { .. } => "dead_lettered",
            EntryOutcome::Deferred { .. } => "deferred",
        }
    }

    /// Whether the handler ran for this entry.
    pub fn was_processed(&self) -> bool {
        matches!(
            self,
            EntryOutcome::Completed { .. }
                | EntryOutcome::Requeued { .. }
                | EntryOutcome::DeadLettered { .. }
        )
    }
}

/// Per-entry line of a trigger summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EntryReport {
    pub member: String,
    #[serde(flatten)]
    pub outcome: EntryOutcome,
}

impl EntryReport {
    pub fn new(member: impl Into<String>, outcome: EntryOutcome) -> Self {
        Self {
            member: member.into(),
            outcome,
        }
    }
}

/// Result of one trigger invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TriggerSummary {
    /// Queue the trigger drained
    pub queue: String,
    /// Entries the handler ran for
    pub processed_count: usize,
    /// Entries left in the queue afterwards (due or not)
    pub remaining_count: u64,
    /// Whether the wall-clock budget cut the batch short
    pub budget_exhausted: bool,
    pub outcomes: Vec<EntryReport>,
}

impl TriggerSummary {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Default::default()
        }
    }

    pub fn push(&mut self, report: EntryReport) {
        if report.outcome.was_processed() {
            self.processed_count += 1;
        }
        self.outcomes.push(report);
    }

    /// Number of entries with the given outcome name.
    pub fn count(&self, outcome: &str) -> usize {
        self.outcomes
            .iter()
            .filter(|r| r.outcome.as_str() == outcome)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processed_count_ignores_expired_and_deferred() {
        let mut summary = TriggerSummary::new("recovery");
        summary.push(EntryReport::new("a", EntryOutcome::completed(None)));
        summary.push(EntryReport::new("b", EntryOutcome::Expired));
        summary.push(EntryReport::new(
            "c",
            EntryOutcome::Deferred {
                reason: "Budget exhausted: 50s spent".into(),
            },
        ));
        summary.push(EntryReport::new(
            "d",
            EntryOutcome::DeadLettered {
                retry_count: 5,
                error: "quota".into(),
            },
        ));

        assert_eq!(summary.processed_count, 2);
        assert_eq!(summary.count("expired"), 1);
        assert_eq!(summary.outcomes.len(), 4);
    }

    #[test]
    fn test_report_serializes_flat() {
        let report = EntryReport::new("job-1", EntryOutcome::Expired);
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["member"], "job-1");
        assert_eq!(value["outcome"], "expired");
    }

    #[test]
    fn test_deferred_report_carries_reason() {
        let report = EntryReport::new(
            "job-2",
            EntryOutcome::Deferred {
                reason: "Budget exhausted: 50s spent".into(),
            },
        );
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["outcome"], "deferred");
        assert_eq!(value["reason"], "Budget exhausted: 50s spent");
    }
}
