//! Error-signature classification for blocked features.
//!
//! `block_feature` runs this once at block time and stores the resulting
//! [`FailureKind`]; the blockers summary only re-runs it for legacy rows
//! that predate the stored tag.

use std::sync::OnceLock;

use regex::Regex;

use crate::core::types::FailureKind;

fn timeout_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\btime[d]?[ -]?out\b|\btimeout\b").expect("timeout regex"))
}

fn test_failure_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)tests? (failed|failing)|guard (failed|fail)").expect("test-failure regex")
    })
}

/// Classify a block reason into a structured failure kind.
///
/// Dependency wording wins over everything else: a reason written by the
/// dependency analyzer always starts with `Blocked:`.
pub fn classify_error(reason: &str) -> FailureKind {
    let trimmed = reason.trim_start();
    let lower = reason.to_lowercase();

    if trimmed.starts_with("Blocked:") || lower.contains("dependency") {
        return FailureKind::Dependency;
    }
    if lower.contains("patch") {
        // Covers "failed to produce/apply a patch", "did not look like a
        // unified diff", and rejected apply_patch blobs.
        return FailureKind::PatchApply;
    }
    if timeout_re().is_match(reason) {
        return FailureKind::Timeout;
    }
    if test_failure_re().is_match(reason) {
        return FailureKind::TestFailure;
    }
    if lower.contains("crash") || lower.contains("worker") || lower.contains("heartbeat") {
        return FailureKind::WorkerError;
    }
    FailureKind::Unknown
}
