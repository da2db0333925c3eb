//! Feature rows: the status state machine and its transition operations.
//!
//! Every selection-and-transition runs inside an immediate (write-locked)
//! transaction so concurrent claimers in separate processes serialize on the
//! database write lock and can never hand out the same row twice.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result, anyhow};
use rusqlite::{Row, Transaction, TransactionBehavior, params};
use serde::Serialize;
use tracing::{debug, info, instrument};

use super::{Database, now_rfc3339};
use crate::core::classify::classify_error;
use crate::core::types::{BlockedIdsMode, FailureKind, FeatureStatus, REGRESSION_CATEGORY};

/// One unit of work tracked by the task store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feature {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub category: String,
    pub priority: i64,
    pub status: FeatureStatus,
    pub assigned_agent_id: Option<String>,
    pub depends_on: Vec<i64>,
    pub steps: Vec<String>,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub last_artifact_path: Option<String>,
    pub regression_of_id: Option<i64>,
    pub preserve_branch: bool,
    pub created_at: String,
}

/// Inputs for [`Database::create_feature`]. Only name/description/category
/// are required; the rest default.
#[derive(Debug, Clone, Default)]
pub struct NewFeature {
    pub name: String,
    pub description: String,
    pub category: String,
    pub priority: i64,
    pub depends_on: Vec<i64>,
    pub steps: Vec<String>,
}

/// One signature group in the blockers summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockerGroup {
    pub signature: String,
    pub count: usize,
    pub feature_ids: Vec<i64>,
    pub sample_error: Option<String>,
    pub retry_recommended: bool,
}

/// Aggregate view over currently-BLOCKED features.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockersSummary {
    pub groups: Vec<BlockerGroup>,
    pub blocked_total: usize,
    pub recommended_total: usize,
}

/// Result of [`Database::create_regression_issue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegressionIssueOutcome {
    pub feature_id: i64,
    pub created: bool,
}

const FEATURE_COLUMNS: &str = "id, name, description, category, priority, status, \
     assigned_agent_id, depends_on, steps, attempts, last_error, failure_kind, \
     last_artifact_path, regression_of_id, preserve_branch, created_at";

fn invalid_column(what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("unknown {what}: '{value}'").into(),
    )
}

fn feature_from_row(row: &Row<'_>) -> rusqlite::Result<Feature> {
    let status_raw: String = row.get("status")?;
    let status = FeatureStatus::parse(&status_raw)
        .ok_or_else(|| invalid_column("feature status", &status_raw))?;

    let depends_raw: String = row.get("depends_on")?;
    let depends_on: Vec<i64> = serde_json::from_str(&depends_raw)
        .map_err(|_| invalid_column("depends_on payload", &depends_raw))?;

    let steps_raw: String = row.get("steps")?;
    let steps: Vec<String> = serde_json::from_str(&steps_raw)
        .map_err(|_| invalid_column("steps payload", &steps_raw))?;

    let failure_kind = match row.get::<_, Option<String>>("failure_kind")? {
        Some(raw) => Some(
            FailureKind::parse(&raw).ok_or_else(|| invalid_column("failure kind", &raw))?,
        ),
        None => None,
    };

    Ok(Feature {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        category: row.get("category")?,
        priority: row.get("priority")?,
        status,
        assigned_agent_id: row.get("assigned_agent_id")?,
        depends_on,
        steps,
        attempts: row.get("attempts")?,
        last_error: row.get("last_error")?,
        failure_kind,
        last_artifact_path: row.get("last_artifact_path")?,
        regression_of_id: row.get("regression_of_id")?,
        preserve_branch: row.get::<_, i64>("preserve_branch")? != 0,
        created_at: row.get("created_at")?,
    })
}

fn stmt_all<'c>(conn: &'c rusqlite::Connection) -> Result<rusqlite::Statement<'c>> {
    conn.prepare(&format!("SELECT {FEATURE_COLUMNS} FROM features ORDER BY id"))
        .context("prepare feature list")
}

fn get_feature_tx(tx: &Transaction<'_>, id: i64) -> Result<Option<Feature>> {
    let mut stmt = tx
        .prepare(&format!("SELECT {FEATURE_COLUMNS} FROM features WHERE id = ?1"))
        .context("prepare feature select")?;
    let mut rows = stmt
        .query_map(params![id], feature_from_row)
        .context("query feature")?;
    match rows.next() {
        Some(row) => Ok(Some(row.context("read feature row")?)),
        None => Ok(None),
    }
}

impl Database {
    /// Create a new feature, initially PENDING. Names are not unique.
    #[instrument(skip_all, fields(name = %new.name, category = %new.category))]
    pub fn create_feature(&self, new: &NewFeature) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO features
                 (name, description, category, priority, depends_on, steps, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                new.name,
                new.description,
                new.category,
                new.priority,
                serde_json::to_string(&new.depends_on)?,
                serde_json::to_string(&new.steps)?,
                now_rfc3339(),
            ],
        )
        .context("insert feature")?;
        let id = conn.last_insert_rowid();
        debug!(feature_id = id, "feature created");
        Ok(id)
    }

    pub fn get_feature(&self, id: i64) -> Result<Option<Feature>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {FEATURE_COLUMNS} FROM features WHERE id = ?1"))
            .context("prepare feature select")?;
        let mut rows = stmt
            .query_map(params![id], feature_from_row)
            .context("query feature")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("read feature row")?)),
            None => Ok(None),
        }
    }

    pub fn list_features(&self, status: Option<FeatureStatus>) -> Result<Vec<Feature>> {
        let conn = self.conn()?;
        let mut out = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {FEATURE_COLUMNS} FROM features WHERE status = ?1 ORDER BY id"
                    ))
                    .context("prepare feature list")?;
                let rows = stmt
                    .query_map(params![status.as_db_str()], feature_from_row)
                    .context("query features")?;
                for row in rows {
                    out.push(row.context("read feature row")?);
                }
            }
            None => {
                let mut stmt = stmt_all(&conn)?;
                let rows = stmt.query_map([], feature_from_row).context("query features")?;
                for row in rows {
                    out.push(row.context("read feature row")?);
                }
            }
        }
        Ok(out)
    }

    /// Atomically claim the highest-priority eligible PENDING feature.
    ///
    /// Eligible: every dependency is PASSING (or there are none). Ordering:
    /// priority descending, then creation order. Returns `Ok(None)` when no
    /// row is eligible; contention is a normal empty result, not an error.
    ///
    /// A re-claim after a recorded failure (the row carries a failure kind
    /// written by a prior block) counts an attempt; a first claim does not.
    #[instrument(skip_all, fields(agent_id))]
    pub fn claim_next_pending_feature(&self, agent_id: &str) -> Result<Option<Feature>> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin immediate claim transaction")?;

        let passing: HashSet<i64> = {
            let mut stmt = tx
                .prepare("SELECT id FROM features WHERE status = 'PASSING'")
                .context("prepare passing select")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, i64>(0))
                .context("query passing ids")?;
            let mut out = HashSet::new();
            for row in rows {
                out.insert(row.context("read passing id")?);
            }
            out
        };

        let candidates: Vec<(i64, Vec<i64>)> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id, depends_on FROM features
                     WHERE status = 'PENDING'
                     ORDER BY priority DESC, id ASC",
                )
                .context("prepare claim candidates")?;
            let rows = stmt
                .query_map([], |row| {
                    let id: i64 = row.get(0)?;
                    let deps_raw: String = row.get(1)?;
                    let deps: Vec<i64> = serde_json::from_str(&deps_raw)
                        .map_err(|_| invalid_column("depends_on payload", &deps_raw))?;
                    Ok((id, deps))
                })
                .context("query claim candidates")?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.context("read claim candidate")?);
            }
            out
        };

        for (id, deps) in candidates {
            if !deps.iter().all(|dep| passing.contains(dep)) {
                continue;
            }
            // The status re-check inside the UPDATE is what upholds the
            // no-duplicate-claims invariant even if the row changed between
            // transactions. failure_kind is only ever written by
            // block_feature, so its presence marks a re-claim after failure
            // (a regression issue's seeded last_error does not).
            let updated = tx
                .execute(
                    "UPDATE features
                     SET status = 'IN_PROGRESS',
                         assigned_agent_id = ?1,
                         attempts = attempts
                             + (CASE WHEN failure_kind IS NOT NULL THEN 1 ELSE 0 END),
                         updated_at = ?2
                     WHERE id = ?3 AND status = 'PENDING'",
                    params![agent_id, now_rfc3339(), id],
                )
                .context("transition claimed feature")?;
            if updated == 1 {
                let feature =
                    get_feature_tx(&tx, id)?.ok_or_else(|| anyhow!("claimed feature #{id} vanished"))?;
                tx.commit().context("commit claim")?;
                info!(feature_id = id, agent_id, "feature claimed");
                return Ok(Some(feature));
            }
        }

        tx.commit().context("commit empty claim")?;
        debug!(agent_id, "no eligible pending feature");
        Ok(None)
    }

    /// Transition a feature to PASSING.
    ///
    /// Idempotent: returns `true` on the first successful transition and
    /// `false` when the feature is already PASSING. Unknown ids are a hard
    /// error (malformed caller input).
    #[instrument(skip_all, fields(feature_id = id))]
    pub fn mark_feature_passing(&self, id: i64) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin immediate passing transaction")?;

        let current = get_feature_tx(&tx, id)?.ok_or_else(|| anyhow!("unknown feature #{id}"))?;
        if current.status == FeatureStatus::Passing {
            return Ok(false);
        }

        tx.execute(
            "UPDATE features
             SET status = 'PASSING', assigned_agent_id = NULL, updated_at = ?1
             WHERE id = ?2",
            params![now_rfc3339(), id],
        )
        .context("transition feature to passing")?;
        tx.commit().context("commit passing")?;
        info!(feature_id = id, "feature passing");
        Ok(true)
    }

    /// Block a non-terminal feature, recording the reason and its structured
    /// failure kind. Returns `false` (not an error) for already-PASSING
    /// features.
    #[instrument(skip_all, fields(feature_id = id, preserve_branch))]
    pub fn block_feature(&self, id: i64, reason: &str, preserve_branch: bool) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin immediate block transaction")?;

        let current = get_feature_tx(&tx, id)?.ok_or_else(|| anyhow!("unknown feature #{id}"))?;
        if current.status.is_terminal() {
            return Ok(false);
        }

        let kind = classify_error(reason);
        tx.execute(
            "UPDATE features
             SET status = 'BLOCKED',
                 last_error = ?1,
                 failure_kind = ?2,
                 assigned_agent_id = NULL,
                 preserve_branch = (CASE WHEN ?3 THEN 1 ELSE preserve_branch END),
                 updated_at = ?4
             WHERE id = ?5",
            params![reason, kind.as_db_str(), preserve_branch, now_rfc3339(), id],
        )
        .context("transition feature to blocked")?;
        tx.commit().context("commit block")?;
        info!(feature_id = id, kind = kind.signature(), "feature blocked");
        Ok(true)
    }

    /// Re-queue BLOCKED features for another attempt. `last_error` is kept so
    /// the next claim counts the attempt.
    pub fn retry_blocked_features(&self, ids: &[i64]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin immediate retry transaction")?;
        let mut retried = 0usize;
        for &id in ids {
            retried += tx
                .execute(
                    "UPDATE features SET status = 'PENDING', updated_at = ?1
                     WHERE id = ?2 AND status = 'BLOCKED'",
                    params![now_rfc3339(), id],
                )
                .context("re-queue blocked feature")?;
        }
        tx.commit().context("commit retry")?;
        info!(retried, "blocked features re-queued");
        Ok(retried)
    }

    /// Block features whose dependency chain can never resolve: members of
    /// dependency cycles, features depending (transitively) on a cycle
    /// member, and features with dangling dependency ids.
    ///
    /// A dependency that is merely BLOCKED-but-retryable does NOT cascade;
    /// it may still resolve after a retry.
    #[instrument(skip_all)]
    pub fn block_unresolvable_dependencies(&self) -> Result<usize> {
        let graph: Vec<(i64, FeatureStatus, Vec<i64>)> = {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare("SELECT id, status, depends_on FROM features")
                .context("prepare dependency graph select")?;
            let rows = stmt
                .query_map([], |row| {
                    let id: i64 = row.get(0)?;
                    let status_raw: String = row.get(1)?;
                    let status = FeatureStatus::parse(&status_raw)
                        .ok_or_else(|| invalid_column("feature status", &status_raw))?;
                    let deps_raw: String = row.get(2)?;
                    let deps: Vec<i64> = serde_json::from_str(&deps_raw)
                        .map_err(|_| invalid_column("depends_on payload", &deps_raw))?;
                    Ok((id, status, deps))
                })
                .context("query dependency graph")?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.context("read dependency row")?);
            }
            out
        };

        let unresolvable = find_unresolvable(&graph);

        let mut blocked = 0usize;
        for (id, detail) in unresolvable {
            let current = self
                .get_feature(id)?
                .ok_or_else(|| anyhow!("feature #{id} vanished during dependency scan"))?;
            if current.status == FeatureStatus::Blocked || current.status.is_terminal() {
                continue;
            }
            if self.block_feature(id, &format!("Blocked: {detail}"), false)? {
                blocked += 1;
            }
        }
        if blocked > 0 {
            info!(blocked, "unresolvable dependency chains blocked");
        }
        Ok(blocked)
    }

    /// Group currently-BLOCKED features by failure signature.
    ///
    /// Rows carrying a stored failure kind use it directly; legacy rows are
    /// classified from their error text.
    pub fn get_blockers_summary(&self) -> Result<BlockersSummary> {
        let rows = self.blocked_rows()?;

        let mut order: Vec<&'static str> = Vec::new();
        let mut grouped: HashMap<&'static str, BlockerGroup> = HashMap::new();
        for (id, last_error, kind) in &rows {
            let signature = kind.signature();
            let group = grouped.entry(signature).or_insert_with(|| {
                order.push(signature);
                BlockerGroup {
                    signature: signature.to_string(),
                    count: 0,
                    feature_ids: Vec::new(),
                    sample_error: None,
                    retry_recommended: kind.retry_recommended(),
                }
            });
            group.count += 1;
            group.feature_ids.push(*id);
            if group.sample_error.is_none() {
                group.sample_error = last_error.clone();
            }
        }

        let mut groups: Vec<BlockerGroup> = order
            .into_iter()
            .filter_map(|sig| grouped.remove(sig))
            .collect();
        groups.sort_by(|a, b| b.count.cmp(&a.count).then(a.signature.cmp(&b.signature)));

        let blocked_total = rows.len();
        let recommended_total = groups
            .iter()
            .filter(|g| g.retry_recommended)
            .map(|g| g.count)
            .sum();
        Ok(BlockersSummary {
            groups,
            blocked_total,
            recommended_total,
        })
    }

    /// Ids of BLOCKED features, either all of them or only those in
    /// retry-recommended groups.
    pub fn get_blocked_feature_ids(&self, mode: BlockedIdsMode) -> Result<Vec<i64>> {
        let rows = self.blocked_rows()?;
        Ok(rows
            .into_iter()
            .filter(|(_, _, kind)| match mode {
                BlockedIdsMode::All => true,
                BlockedIdsMode::Recommended => kind.retry_recommended(),
            })
            .map(|(id, _, _)| id)
            .collect())
    }

    fn blocked_rows(&self) -> Result<Vec<(i64, Option<String>, FailureKind)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, last_error, failure_kind FROM features
                 WHERE status = 'BLOCKED' ORDER BY id",
            )
            .context("prepare blocked select")?;
        let rows = stmt
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                let last_error: Option<String> = row.get(1)?;
                let kind_raw: Option<String> = row.get(2)?;
                Ok((id, last_error, kind_raw))
            })
            .context("query blocked features")?;

        let mut out = Vec::new();
        for row in rows {
            let (id, last_error, kind_raw) = row.context("read blocked row")?;
            let kind = match kind_raw.as_deref().and_then(FailureKind::parse) {
                Some(kind) => kind,
                None => last_error
                    .as_deref()
                    .map(classify_error)
                    .unwrap_or(FailureKind::Unknown),
            };
            out.push((id, last_error, kind));
        }
        Ok(out)
    }

    /// Create or refresh the open REGRESSION issue for a previously-passing
    /// feature.
    ///
    /// At most one open regression issue exists per `regression_of_id`: a
    /// second report updates the stored error/artifact in place and returns
    /// `created = false` with the same feature id.
    #[instrument(skip_all, fields(regression_of_id))]
    pub fn create_regression_issue(
        &self,
        regression_of_id: i64,
        summary: &str,
        details: &str,
        artifact_path: Option<&str>,
    ) -> Result<RegressionIssueOutcome> {
        if summary.trim().is_empty() {
            return Err(anyhow!("regression summary must not be empty"));
        }

        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin immediate regression transaction")?;

        let original = get_feature_tx(&tx, regression_of_id)?
            .ok_or_else(|| anyhow!("unknown feature #{regression_of_id} for regression report"))?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM features
                 WHERE category = ?1 AND regression_of_id = ?2 AND status != 'PASSING'
                 ORDER BY id LIMIT 1",
                params![REGRESSION_CATEGORY, regression_of_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("query open regression issue")?;

        if let Some(issue_id) = existing {
            tx.execute(
                "UPDATE features
                 SET last_error = ?1,
                     last_artifact_path = COALESCE(?2, last_artifact_path),
                     updated_at = ?3
                 WHERE id = ?4",
                params![summary, artifact_path, now_rfc3339(), issue_id],
            )
            .context("refresh open regression issue")?;
            tx.commit().context("commit regression refresh")?;
            info!(issue_id, "open regression issue refreshed");
            return Ok(RegressionIssueOutcome {
                feature_id: issue_id,
                created: false,
            });
        }

        tx.execute(
            "INSERT INTO features
                 (name, description, category, priority, last_error,
                  last_artifact_path, regression_of_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                format!("Regression: {}", original.name),
                details,
                REGRESSION_CATEGORY,
                // Regressions outrank the ordinary backlog at claim time.
                original.priority + 1,
                summary,
                artifact_path,
                regression_of_id,
                now_rfc3339(),
            ],
        )
        .context("insert regression issue")?;
        let issue_id = tx.last_insert_rowid();
        tx.commit().context("commit regression insert")?;
        info!(issue_id, "regression issue created");
        Ok(RegressionIssueOutcome {
            feature_id: issue_id,
            created: true,
        })
    }
}

/// Walk the dependency graph and collect features whose chain cannot
/// resolve, with a human-readable detail per feature.
///
/// Pure over the loaded rows so the traversal is easy to test.
fn find_unresolvable(graph: &[(i64, FeatureStatus, Vec<i64>)]) -> Vec<(i64, String)> {
    let by_id: HashMap<i64, (&FeatureStatus, &Vec<i64>)> = graph
        .iter()
        .map(|(id, status, deps)| (*id, (status, deps)))
        .collect();

    // Cycle detection over non-PASSING nodes (a PASSING dependency is
    // resolved and breaks any chain through it).
    #[derive(Clone, Copy, PartialEq)]
    enum Visit {
        InStack,
        Done,
    }
    let mut visit: HashMap<i64, Visit> = HashMap::new();
    let mut in_cycle: HashSet<i64> = HashSet::new();

    fn dfs(
        id: i64,
        by_id: &HashMap<i64, (&FeatureStatus, &Vec<i64>)>,
        visit: &mut HashMap<i64, Visit>,
        in_cycle: &mut HashSet<i64>,
        stack: &mut Vec<i64>,
    ) {
        match visit.get(&id) {
            Some(Visit::Done) => return,
            Some(Visit::InStack) => {
                // Everything from the first occurrence of `id` on the stack
                // is part of the cycle.
                if let Some(pos) = stack.iter().position(|&s| s == id) {
                    in_cycle.extend(stack[pos..].iter().copied());
                }
                return;
            }
            None => {}
        }
        let Some((status, deps)) = by_id.get(&id) else {
            return;
        };
        if **status == FeatureStatus::Passing {
            visit.insert(id, Visit::Done);
            return;
        }
        visit.insert(id, Visit::InStack);
        stack.push(id);
        for dep in deps.iter() {
            dfs(*dep, by_id, visit, in_cycle, stack);
        }
        stack.pop();
        visit.insert(id, Visit::Done);
    }

    for (id, _, _) in graph {
        let mut stack = Vec::new();
        dfs(*id, &by_id, &mut visit, &mut in_cycle, &mut stack);
    }

    // A feature is unresolvable when it is in a cycle, depends on a missing
    // id, or transitively depends on either.
    let mut unresolvable: HashMap<i64, String> = HashMap::new();
    for &id in &in_cycle {
        unresolvable.insert(id, "unresolvable dependency cycle".to_string());
    }
    loop {
        let mut changed = false;
        for (id, status, deps) in graph {
            if *status == FeatureStatus::Passing || unresolvable.contains_key(id) {
                continue;
            }
            for dep in deps {
                if !by_id.contains_key(dep) {
                    unresolvable.insert(*id, format!("dependency #{dep} does not exist"));
                    changed = true;
                    break;
                }
                if unresolvable.contains_key(dep) {
                    unresolvable
                        .insert(*id, format!("dependency #{dep} can never resolve"));
                    changed = true;
                    break;
                }
            }
        }
        if !changed {
            break;
        }
    }

    let mut out: Vec<(i64, String)> = unresolvable.into_iter().collect();
    out.sort_by_key(|(id, _)| *id);
    out
}
