//! Outcome types: what the orchestrator hands back to the caller.
//!
//! A [`BatchReport`] is the orchestrator's only return value. It holds one
//! [`RecordOutcome`] per input record, in input order, plus aggregate
//! [`BatchStats`]. Everything here is `Serialize` so the HTTP endpoint and the
//! CLI `--json` flag can emit it unchanged.

use crate::error::{BatchError, RecordError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The last pipeline stage a record reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// The record was never started (batch cancelled first).
    NotStarted,
    Render,
    Convert,
    Deliver,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::NotStarted => "not_started",
            Stage::Render => "render",
            Stage::Convert => "convert",
            Stage::Deliver => "deliver",
        })
    }
}

/// Result of driving one record through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutcome {
    /// 0-based position of the record in the input.
    pub index: usize,
    /// Value of the identifying field, or `row N` when it is missing.
    pub record_id: String,
    pub stage_reached: Stage,
    pub success: bool,
    /// `true` when batch cancellation prevented the record from starting.
    /// A cancelled record is neither a success nor a failure.
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl RecordOutcome {
    pub fn delivered(index: usize, record_id: impl Into<String>) -> Self {
        Self {
            index,
            record_id: record_id.into(),
            stage_reached: Stage::Deliver,
            success: true,
            cancelled: false,
            error_detail: None,
        }
    }

    pub fn failed(index: usize, record_id: impl Into<String>, error: &RecordError) -> Self {
        Self {
            index,
            record_id: record_id.into(),
            stage_reached: error.stage(),
            success: false,
            cancelled: false,
            error_detail: Some(error.to_string()),
        }
    }

    pub fn cancelled(index: usize, record_id: impl Into<String>) -> Self {
        Self {
            index,
            record_id: record_id.into(),
            stage_reached: Stage::NotStarted,
            success: false,
            cancelled: true,
            error_detail: None,
        }
    }

    /// `true` for records that were attempted and failed.
    pub fn is_failure(&self) -> bool {
        !self.success && !self.cancelled
    }
}

/// Aggregate counters over a batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub total_records: usize,
    pub delivered: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub render_failures: usize,
    pub convert_failures: usize,
    pub deliver_failures: usize,
    pub total_duration_ms: u64,
}

impl BatchStats {
    fn tally(outcomes: &[RecordOutcome], total_duration_ms: u64) -> Self {
        let mut stats = BatchStats {
            total_records: outcomes.len(),
            total_duration_ms,
            ..Default::default()
        };
        for outcome in outcomes {
            if outcome.success {
                stats.delivered += 1;
            } else if outcome.cancelled {
                stats.cancelled += 1;
            } else {
                stats.failed += 1;
                match outcome.stage_reached {
                    Stage::Render | Stage::NotStarted => stats.render_failures += 1,
                    Stage::Convert => stats.convert_failures += 1,
                    Stage::Deliver => stats.deliver_failures += 1,
                }
            }
        }
        stats
    }
}

/// The ordered per-record report for one batch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub outcomes: Vec<RecordOutcome>,
    pub stats: BatchStats,
}

impl BatchReport {
    /// Build a report from outcomes collected in any order.
    ///
    /// Outcomes are sorted by `index` so the report always matches input
    /// order, whatever order the workers finished in.
    pub fn new(mut outcomes: Vec<RecordOutcome>, total_duration_ms: u64) -> Self {
        outcomes.sort_by_key(|o| o.index);
        let stats = BatchStats::tally(&outcomes, total_duration_ms);
        Self { outcomes, stats }
    }

    /// Outcomes for records that were attempted and failed.
    pub fn failures(&self) -> impl Iterator<Item = &RecordOutcome> {
        self.outcomes.iter().filter(|o| o.is_failure())
    }

    /// `true` when every record was delivered.
    pub fn all_delivered(&self) -> bool {
        self.stats.delivered == self.stats.total_records
    }

    /// Turn any failed or cancelled record into [`BatchError::PartialFailure`].
    pub fn into_result(self) -> Result<Self, BatchError> {
        if self.all_delivered() {
            Ok(self)
        } else {
            Err(BatchError::PartialFailure {
                delivered: self.stats.delivered,
                failed: self.stats.failed,
                cancelled: self.stats.cancelled,
                total: self.stats.total_records,
            })
        }
    }
}
