//! Normalization and strict validation of worker-produced patches.
//!
//! Workers return raw text that often wraps a unified diff in markdown
//! fences and prose. This module trims that down to a bare diff and rejects
//! alternate patch syntaxes outright; application happens in `io::patch`.

/// Remove markdown code-fence lines (``` and ```diff) from raw output.
pub fn strip_fences(raw: &str) -> String {
    raw.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Trim any prose preamble, returning the text from the first recognizable
/// diff marker onward.
///
/// Prefers a `diff --git` line; falls back to a bare `--- a/` / `+++ b/`
/// unified-diff header pair. Returns `None` when no marker is present.
pub fn trim_to_diff_start(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();

    if let Some(idx) = lines.iter().position(|l| l.starts_with("diff --git ")) {
        return Some(join_from(&lines, idx));
    }

    for (idx, line) in lines.iter().enumerate() {
        if line.starts_with("--- ")
            && lines
                .get(idx + 1)
                .is_some_and(|next| next.starts_with("+++ "))
        {
            return Some(join_from(&lines, idx));
        }
    }

    None
}

fn join_from(lines: &[&str], idx: usize) -> String {
    let mut out = lines[idx..].join("\n");
    out.push('\n');
    out
}

/// Normalize raw worker output into an applicable unified diff.
///
/// Rejects the proprietary `*** Begin Patch` block syntax with an error
/// naming the format; nothing in the coordinator ever coerces it.
pub fn normalize_patch(raw: &str) -> Result<String, String> {
    if raw.contains("*** Begin Patch") {
        return Err(
            "patch uses the unsupported apply_patch format (*** Begin Patch); \
             only unified diffs are accepted"
                .to_string(),
        );
    }

    let stripped = strip_fences(raw);
    trim_to_diff_start(&stripped)
        .ok_or_else(|| "patch did not look like a unified diff (no diff --git or ---/+++ header)".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_prefers_diff_git_marker() {
        let raw = "some preamble\n\n```diff\ndiff --git a/a.txt b/a.txt\n--- a/a.txt\n+++ b/a.txt\n@@\n-one\n+two\n```\n";
        let trimmed = trim_to_diff_start(&strip_fences(raw)).expect("diff start");
        assert!(trimmed.starts_with("diff --git "));
    }

    #[test]
    fn trim_falls_back_to_unified_header() {
        let raw = "Here is the change:\n--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-one\n+two\n";
        let trimmed = trim_to_diff_start(raw).expect("diff start");
        assert!(trimmed.starts_with("--- a/a.txt"));
    }

    #[test]
    fn a_lone_triple_dash_line_is_not_a_header() {
        // Markdown horizontal rules followed by prose must not be mistaken
        // for a diff header.
        let raw = "--- \nnot a diff\n";
        assert_eq!(trim_to_diff_start(raw), None);
    }

    #[test]
    fn normalize_rejects_apply_patch_format_by_name() {
        let raw = "*** Begin Patch\n*** Update File: a.txt\n-one\n+two\n*** End Patch\n";
        let err = normalize_patch(raw).unwrap_err();
        assert!(err.contains("apply_patch format"));
    }

    #[test]
    fn normalize_errors_when_no_diff_marker_present() {
        let err = normalize_patch("I could not produce a patch, sorry.").unwrap_err();
        assert!(err.contains("unified diff"));
    }

    #[test]
    fn normalize_strips_fences_and_preamble() {
        let raw = "Sure! Applying now.\n```diff\ndiff --git a/x b/x\n--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n```\ntrailing prose is kept only after the marker\n";
        let patch = normalize_patch(raw).expect("normalize");
        assert!(patch.starts_with("diff --git a/x b/x\n"));
        assert!(!patch.contains("```"));
    }
}
