//! Persisted, restart-safe delayed-start registry.
//!
//! One timer thread per daemon context sleeps until the nearest `run_at` and
//! is woken through a condvar whenever the schedule map changes. Schedules
//! are persisted in the settings store so a daemon restart does not lose
//! them; a `run_at` already in the past fires immediately on restore.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::store::Database;

/// Settings key holding the persisted schedule map.
pub const SCHEDULE_KEY: &str = "scheduled_runs_v1";

/// Collaborator that launches a scheduled workload.
///
/// `is_active` gates firing: a target that is already running or paused turns
/// the fire into a logged no-op.
pub trait RunStarter: Send + Sync {
    fn is_active(&self, project: &str) -> bool;
    fn start_run(&self, project: &str, request: &Value) -> Result<()>;
}

/// One pending scheduled run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRun {
    pub project: String,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub request: Value,
}

struct SchedulerState {
    runs: HashMap<String, ScheduledRun>,
    shutdown: bool,
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    cv: Condvar,
    db: Database,
    starter: Arc<dyn RunStarter>,
}

/// Owner of the timer thread and the schedule map.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(db: Database, starter: Arc<dyn RunStarter>) -> Result<Self> {
        let inner = Arc::new(SchedulerInner {
            state: Mutex::new(SchedulerState {
                runs: HashMap::new(),
                shutdown: false,
            }),
            cv: Condvar::new(),
            db,
            starter,
        });
        let thread_inner = inner.clone();
        let thread = thread::Builder::new()
            .name("scheduler-timer".to_string())
            .spawn(move || run_loop(&thread_inner))
            .context("spawn scheduler thread")?;
        Ok(Self {
            inner,
            thread: Some(thread),
        })
    }

    /// Schedule a run, superseding any prior schedule for the project.
    #[instrument(skip_all, fields(project, run_at = %run_at))]
    pub fn schedule(
        &self,
        project: &str,
        run_at: DateTime<Utc>,
        request: Value,
    ) -> Result<ScheduledRun> {
        let run = ScheduledRun {
            project: project.to_string(),
            run_at,
            created_at: Utc::now(),
            request,
        };
        let payload = {
            let mut state = self.inner.state.lock();
            state.runs.insert(project.to_string(), run.clone());
            persist_payload(&state)
        };
        self.persist(&payload)?;
        self.inner.cv.notify_all();
        info!("run scheduled");
        Ok(run)
    }

    /// Cancel the project's schedule. Idempotent and safe concurrently with
    /// a fire: whichever side removes the entry first wins, the other is a
    /// no-op.
    #[instrument(skip_all, fields(project))]
    pub fn cancel(&self, project: &str) -> Result<bool> {
        let removed_payload = {
            let mut state = self.inner.state.lock();
            match state.runs.remove(project) {
                Some(_) => Some(persist_payload(&state)),
                None => None,
            }
        };
        match removed_payload {
            Some(payload) => {
                self.persist(&payload)?;
                self.inner.cv.notify_all();
                info!("schedule cancelled");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn get(&self, project: &str) -> Option<ScheduledRun> {
        self.inner.state.lock().runs.get(project).cloned()
    }

    /// Reload persisted schedules after a restart. Past-due entries fire
    /// immediately once the timer thread wakes.
    #[instrument(skip_all)]
    pub fn restore(&self) -> Result<usize> {
        let Some(Value::Object(persisted)) = self.inner.db.get_setting_json(SCHEDULE_KEY)? else {
            return Ok(0);
        };

        let mut restored = 0usize;
        {
            let mut state = self.inner.state.lock();
            for (project, payload) in &persisted {
                let Some(run) = parse_persisted(project, payload) else {
                    warn!(project, "skipping unparsable persisted schedule");
                    continue;
                };
                state.runs.insert(project.clone(), run);
                restored += 1;
            }
        }
        self.inner.cv.notify_all();
        info!(restored, "schedules restored");
        Ok(restored)
    }

    fn persist(&self, payload: &Value) -> Result<()> {
        self.inner
            .db
            .set_setting_json(SCHEDULE_KEY, payload)
            .context("persist schedules")
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.inner.state.lock().shutdown = true;
        self.inner.cv.notify_all();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("scheduler thread panicked");
        }
    }
}

fn run_loop(inner: &SchedulerInner) {
    loop {
        let (due, payload) = {
            let mut state = inner.state.lock();
            if state.shutdown {
                return;
            }

            let now = Utc::now();
            let due_projects: Vec<String> = state
                .runs
                .iter()
                .filter(|(_, run)| run.run_at <= now)
                .map(|(project, _)| project.clone())
                .collect();

            if due_projects.is_empty() {
                match state.runs.values().map(|run| run.run_at).min() {
                    Some(next_at) => {
                        let wait = (next_at - now)
                            .to_std()
                            .unwrap_or(Duration::ZERO)
                            .max(Duration::from_millis(10));
                        inner.cv.wait_for(&mut state, wait);
                    }
                    None => {
                        inner.cv.wait(&mut state);
                    }
                }
                continue;
            }

            let due: Vec<ScheduledRun> = due_projects
                .iter()
                .filter_map(|project| state.runs.remove(project))
                .collect();
            (due, persist_payload(&state))
        };

        // Persist and fire outside the lock; neither may block other
        // schedule/cancel callers.
        if let Err(err) = inner.db.set_setting_json(SCHEDULE_KEY, &payload) {
            warn!(err = %err, "failed to persist schedules after fire");
        }
        for run in due {
            fire(inner, &run);
        }
    }
}

fn fire(inner: &SchedulerInner, run: &ScheduledRun) {
    if inner.starter.is_active(&run.project) {
        info!(project = %run.project, "scheduled run skipped; target already active");
        return;
    }
    debug!(project = %run.project, "firing scheduled run");
    if let Err(err) = inner.starter.start_run(&run.project, &run.request) {
        warn!(project = %run.project, err = %err, "scheduled run failed to start");
    }
}

/// Persist a schedule entry without a running scheduler (CLI path). The
/// daemon picks it up on its next restore.
pub fn persist_schedule_entry(
    db: &Database,
    project: &str,
    run_at: DateTime<Utc>,
    request: Value,
) -> Result<()> {
    let mut map = match db.get_setting_json(SCHEDULE_KEY)? {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    map.insert(
        project.to_string(),
        json!({
            "run_at": run_at.to_rfc3339(),
            "created_at": Utc::now().to_rfc3339(),
            "request": request,
        }),
    );
    db.set_setting_json(SCHEDULE_KEY, &Value::Object(map))
        .context("persist schedule entry")
}

/// Remove a persisted schedule entry (CLI path). Returns whether one existed.
pub fn remove_persisted_schedule(db: &Database, project: &str) -> Result<bool> {
    let mut map = match db.get_setting_json(SCHEDULE_KEY)? {
        Some(Value::Object(map)) => map,
        _ => return Ok(false),
    };
    let removed = map.remove(project).is_some();
    if removed {
        db.set_setting_json(SCHEDULE_KEY, &Value::Object(map))
            .context("persist schedule removal")?;
    }
    Ok(removed)
}

fn persist_payload(state: &SchedulerState) -> Value {
    let mut map = Map::new();
    for (project, run) in &state.runs {
        map.insert(
            project.clone(),
            json!({
                "run_at": run.run_at.to_rfc3339(),
                "created_at": run.created_at.to_rfc3339(),
                "request": run.request,
            }),
        );
    }
    Value::Object(map)
}

fn parse_persisted(project: &str, payload: &Value) -> Option<ScheduledRun> {
    let run_at = DateTime::parse_from_rfc3339(payload.get("run_at")?.as_str()?)
        .ok()?
        .with_timezone(&Utc);
    let created_at = payload
        .get("created_at")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map_or_else(Utc::now, |dt| dt.with_timezone(&Utc));
    let request = payload.get("request").cloned().unwrap_or(Value::Null);
    Some(ScheduledRun {
        project: project.to_string(),
        run_at,
        created_at,
        request,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_test_db;
    use chrono::TimeDelta;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    #[derive(Default)]
    struct RecordingStarter {
        active: AtomicBool,
        started: Mutex<Vec<(String, Value)>>,
    }

    impl RunStarter for RecordingStarter {
        fn is_active(&self, _project: &str) -> bool {
            self.active.load(Ordering::SeqCst)
        }

        fn start_run(&self, project: &str, request: &Value) -> Result<()> {
            self.started.lock().push((project.to_string(), request.clone()));
            Ok(())
        }
    }

    fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        predicate()
    }

    #[test]
    fn past_due_schedule_fires_immediately() {
        let (_temp, db) = open_test_db();
        let starter = Arc::new(RecordingStarter::default());
        let scheduler = Scheduler::new(db, starter.clone()).expect("scheduler");

        scheduler
            .schedule("proj", Utc::now() - TimeDelta::seconds(1), json!({"yolo": true}))
            .expect("schedule");

        assert!(wait_until(Duration::from_secs(2), || {
            !starter.started.lock().is_empty()
        }));
        let started = starter.started.lock();
        assert_eq!(started[0].0, "proj");
        assert_eq!(started[0].1, json!({"yolo": true}));
        drop(started);

        // The fired entry is gone from the map and from persistence.
        assert!(scheduler.get("proj").is_none());
    }

    #[test]
    fn new_schedule_supersedes_prior_one_for_project() {
        let (_temp, db) = open_test_db();
        let starter = Arc::new(RecordingStarter::default());
        let scheduler = Scheduler::new(db.clone(), starter).expect("scheduler");

        let later = Utc::now() + TimeDelta::seconds(60);
        let sooner = Utc::now() + TimeDelta::seconds(30);
        scheduler.schedule("proj", later, json!({"v": 1})).expect("first");
        scheduler.schedule("proj", sooner, json!({"v": 2})).expect("second");

        let current = scheduler.get("proj").expect("schedule");
        assert_eq!(current.request, json!({"v": 2}));
        assert_eq!(current.run_at, sooner);

        let persisted = db.get_setting_json(SCHEDULE_KEY).expect("get").expect("value");
        assert_eq!(persisted.as_object().expect("object").len(), 1);
    }

    #[test]
    fn cancel_is_idempotent_and_clears_persistence() {
        let (_temp, db) = open_test_db();
        let starter = Arc::new(RecordingStarter::default());
        let scheduler = Scheduler::new(db.clone(), starter).expect("scheduler");

        scheduler
            .schedule("proj", Utc::now() + TimeDelta::seconds(60), Value::Null)
            .expect("schedule");

        assert!(scheduler.cancel("proj").expect("cancel"));
        assert!(!scheduler.cancel("proj").expect("cancel again"));

        let persisted = db.get_setting_json(SCHEDULE_KEY).expect("get").expect("value");
        assert!(persisted.as_object().expect("object").is_empty());
    }

    #[test]
    fn fire_is_a_noop_when_target_is_active() {
        let (_temp, db) = open_test_db();
        let starter = Arc::new(RecordingStarter {
            active: AtomicBool::new(true),
            ..RecordingStarter::default()
        });
        let scheduler = Scheduler::new(db, starter.clone()).expect("scheduler");

        scheduler
            .schedule("proj", Utc::now() - TimeDelta::seconds(1), Value::Null)
            .expect("schedule");

        // The entry is consumed without starting anything.
        assert!(wait_until(Duration::from_secs(2), || {
            scheduler.get("proj").is_none()
        }));
        assert!(starter.started.lock().is_empty());
    }

    #[test]
    fn restore_fires_past_due_persisted_schedules() {
        let (_temp, db) = open_test_db();

        // Persisted by a previous daemon instance.
        db.set_setting_json(
            SCHEDULE_KEY,
            &json!({
                "proj": {
                    "run_at": (Utc::now() - TimeDelta::seconds(5)).to_rfc3339(),
                    "created_at": (Utc::now() - TimeDelta::seconds(600)).to_rfc3339(),
                    "request": {"parallel_count": 3},
                }
            }),
        )
        .expect("seed persisted");

        let starter = Arc::new(RecordingStarter::default());
        let scheduler = Scheduler::new(db, starter.clone()).expect("scheduler");
        assert_eq!(scheduler.restore().expect("restore"), 1);

        assert!(wait_until(Duration::from_secs(2), || {
            !starter.started.lock().is_empty()
        }));
        assert_eq!(starter.started.lock()[0].1, json!({"parallel_count": 3}));
    }

    #[test]
    fn restore_skips_unparsable_entries() {
        let (_temp, db) = open_test_db();
        db.set_setting_json(
            SCHEDULE_KEY,
            &json!({"broken": {"run_at": "not-a-timestamp"}}),
        )
        .expect("seed persisted");

        let starter = Arc::new(RecordingStarter::default());
        let scheduler = Scheduler::new(db, starter).expect("scheduler");
        assert_eq!(scheduler.restore().expect("restore"), 0);
    }
}
