//! Shared deterministic types for coordinator core logic.
//!
//! Statuses and modes are closed enums: unknown values coming from storage
//! or configuration are rejected at the boundary instead of flowing through
//! business logic as strings.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a feature in the task store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureStatus {
    Pending,
    InProgress,
    Passing,
    Blocked,
}

impl FeatureStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Passing => "PASSING",
            Self::Blocked => "BLOCKED",
        }
    }

    /// Parse a stored status. Returns `None` for unknown values so callers
    /// can reject them at the row boundary.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "PASSING" => Some(Self::Passing),
            "BLOCKED" => Some(Self::Blocked),
            _ => None,
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        self == Self::Passing
    }
}

/// Reserved category for synthetic regression issues.
pub const REGRESSION_CATEGORY: &str = "REGRESSION";

/// Runtime status of one worker session (agent row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRunStatus {
    Running,
    Paused,
    Crashed,
    Stopped,
    Completed,
}

impl AgentRunStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Crashed => "crashed",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "crashed" => Some(Self::Crashed),
            "stopped" => Some(Self::Stopped),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Sessions in these states refuse a new start and make scheduled
    /// fires a no-op.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

/// Worker-declared terminal status for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Done,
    Failed,
}

/// A regression observed by a verification sweep, reported back to the
/// task store as a REGRESSION feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegressionReport {
    pub regression_of_id: i64,
    pub summary: String,
    pub details: String,
    #[serde(default)]
    pub artifact_path: Option<String>,
}

/// Structured output produced by a worker session (`result.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerOutcome {
    pub status: WorkerStatus,
    pub summary: String,
    #[serde(default)]
    pub patch: Option<String>,
    #[serde(default)]
    pub regressions: Vec<RegressionReport>,
}

/// Structured failure tag written by `block_feature` at block time.
///
/// Replaces substring sniffing over `last_error` for new rows; rows written
/// by older databases without the tag are still classified from text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PatchApply,
    Timeout,
    TestFailure,
    WorkerError,
    Dependency,
    Unknown,
}

impl FailureKind {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::PatchApply => "patch_apply",
            Self::Timeout => "timeout",
            Self::TestFailure => "test_failure",
            Self::WorkerError => "worker_error",
            Self::Dependency => "dependency",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "patch_apply" => Some(Self::PatchApply),
            "timeout" => Some(Self::Timeout),
            "test_failure" => Some(Self::TestFailure),
            "worker_error" => Some(Self::WorkerError),
            "dependency" => Some(Self::Dependency),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Group signature used by the blockers summary.
    pub fn signature(self) -> &'static str {
        match self {
            Self::PatchApply => "patch-apply",
            Self::Timeout => "timeout",
            Self::TestFailure => "test-failure",
            Self::WorkerError => "worker-error",
            Self::Dependency => "dependency",
            Self::Unknown => "unknown",
        }
    }

    /// Transient worker-side failures are worth re-queueing; dependency
    /// chains and unclassified blocks need a human or graph-level fix.
    pub fn retry_recommended(self) -> bool {
        matches!(
            self,
            Self::PatchApply | Self::Timeout | Self::TestFailure | Self::WorkerError
        )
    }
}

/// Selection mode for [`get_blocked_feature_ids`](crate::store::Database::get_blocked_feature_ids).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedIdsMode {
    All,
    Recommended,
}

/// Plan-injection policy for the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlannerMode {
    /// Every dispatch gets a plan artifact, synthesizing a fallback when no
    /// planner is available (fail-open).
    RequiredAlways,
    /// Skip plan generation for low-risk features; a prior failed attempt
    /// always escalates to planning.
    RequiredSmart,
}

/// Worker provider backend, selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Claude,
    Codex,
    Gemini,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "claude" => Some(Self::Claude),
            "codex" => Some(Self::Codex),
            "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_status_round_trips_through_db_strings() {
        for status in [
            FeatureStatus::Pending,
            FeatureStatus::InProgress,
            FeatureStatus::Passing,
            FeatureStatus::Blocked,
        ] {
            assert_eq!(FeatureStatus::parse(status.as_db_str()), Some(status));
        }
        assert_eq!(FeatureStatus::parse("DELETED"), None);
    }

    #[test]
    fn only_passing_is_terminal() {
        assert!(FeatureStatus::Passing.is_terminal());
        assert!(!FeatureStatus::Blocked.is_terminal());
    }

    #[test]
    fn dependency_blocks_are_not_retry_recommended() {
        assert!(FailureKind::PatchApply.retry_recommended());
        assert!(FailureKind::Timeout.retry_recommended());
        assert!(!FailureKind::Dependency.retry_recommended());
        assert!(!FailureKind::Unknown.retry_recommended());
    }
}
