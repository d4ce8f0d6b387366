//! Job handles, the polling state machine and backoff scheduling

use crate::file::FileRef;
use crate::session::{JobApi, SessionError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Errors from job operations
#[derive(thiserror::Error, Debug)]
pub enum JobError {
    #[error("Job is not associated with an authenticated session")]
    NotAuthenticated,

    #[error("Could not load job info: {0}")]
    Fetch(#[source] SessionError),

    #[error("No job info has been loaded yet")]
    NoInfo,
}

/// Derived status of a remote job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl JobStatus {
    /// Derive the status from a job info payload.
    ///
    /// Evaluated fresh on every poll, in priority order: an error flag wins
    /// over any other simultaneously-true flag, then completion, then
    /// pending; anything else is running.
    pub fn from_payload(info: &Value) -> JobStatus {
        let flag = |key: &str| {
            info.get("status")
                .and_then(|s| s.get(key))
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };
        if flag("hasError") {
            JobStatus::Error
        } else if flag("completedInGp") {
            JobStatus::Completed
        } else if flag("isPending") {
            JobStatus::Pending
        } else {
            JobStatus::Running
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            JobStatus::Pending => "Pending",
            JobStatus::Running => "Running",
            JobStatus::Completed => "Completed",
            JobStatus::Error => "Error",
        };
        f.write_str(text)
    }
}

/// Sharing permissions of a job
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobPermissions {
    #[serde(default)]
    pub groups: Vec<GroupPermission>,
}

/// Read/write access for one group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupPermission {
    pub id: String,
    pub read: bool,
    pub write: bool,
}

/// Doubling backoff schedule in abstract units: 1, 2, 4, ... capped.
#[derive(Debug)]
pub(crate) struct Backoff {
    wait: u32,
    cap: u32,
}

impl Backoff {
    pub(crate) fn new(cap: u32) -> Self {
        Self { wait: 1, cap }
    }

    /// The wait for the next round; doubles after each call up to the cap
    pub(crate) fn next_wait(&mut self) -> u32 {
        let wait = self.wait;
        self.wait = (self.wait.saturating_mul(2)).min(self.cap);
        wait
    }
}

/// Everything derived from the most recent successful poll.
///
/// Replaced wholesale on each poll so readers never observe a status that
/// does not correspond to the stored info payload.
#[derive(Debug, Clone, Default)]
struct JobState {
    status: Option<JobStatus>,
    info: Option<Value>,
    task_name: String,
    task_lsid: String,
    user_id: String,
    date_submitted: String,
    output_files: Vec<FileRef>,
    log_files: Vec<FileRef>,
    num_output_files: u64,
    last_error: Option<String>,
}

impl JobState {
    fn from_payload(payload: Value) -> Self {
        let get_str = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            status: Some(JobStatus::from_payload(&payload)),
            task_name: get_str("taskName"),
            task_lsid: get_str("taskLsid"),
            user_id: get_str("userId"),
            date_submitted: get_str("dateSubmitted"),
            output_files: file_refs(payload.get("outputFiles")),
            log_files: file_refs(payload.get("logFiles")),
            num_output_files: payload
                .get("numOutputFiles")
                .and_then(json_u64)
                .unwrap_or(0),
            last_error: None,
            info: Some(payload),
        }
    }
}

fn file_refs(value: Option<&Value>) -> Vec<FileRef> {
    value
        .and_then(Value::as_array)
        .map(|files| {
            files
                .iter()
                .filter_map(|f| f.get("link")?.get("href")?.as_str())
                .map(FileRef::new)
                .collect()
        })
        .unwrap_or_default()
}

/// Interpret a JSON value as a job/file count; the server is inconsistent
/// about numbers versus numeric strings.
pub(crate) fn json_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// A submitted or in-progress job on a GenePattern server.
///
/// The job number is immutable; everything else is overwritten by each
/// successful poll. Safe to share between a manual caller and a
/// [`JobPoller`]: polls publish their complete derived state under one
/// write lock.
pub struct JobHandle {
    session: RwLock<Option<Arc<dyn JobApi>>>,
    job_number: u64,
    backoff_cap: u32,
    state: RwLock<JobState>,
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("job_number", &self.job_number)
            .field("status", &self.state.read().status)
            .finish()
    }
}

impl JobHandle {
    pub fn new(session: Arc<dyn JobApi>, job_number: u64, backoff_cap: u32) -> Self {
        Self {
            session: RwLock::new(Some(session)),
            job_number,
            backoff_cap,
            state: RwLock::new(JobState::default()),
        }
    }

    /// A handle with no session yet; polls fail with
    /// [`JobError::NotAuthenticated`] until a session is attached.
    pub fn detached(job_number: u64, backoff_cap: u32) -> Self {
        Self {
            session: RwLock::new(None),
            job_number,
            backoff_cap,
            state: RwLock::new(JobState::default()),
        }
    }

    /// Attach a session after the fact (login completed later)
    pub fn attach_session(&self, session: Arc<dyn JobApi>) {
        *self.session.write() = Some(session);
        self.state.write().last_error = None;
    }

    pub fn session(&self) -> Option<Arc<dyn JobApi>> {
        self.session.read().clone()
    }

    pub fn job_number(&self) -> u64 {
        self.job_number
    }

    /// Status derived from the most recent successful poll; `None` before
    /// the first one.
    pub fn status(&self) -> Option<JobStatus> {
        self.state.read().status
    }

    /// Raw payload of the most recent successful poll
    pub fn info(&self) -> Option<Value> {
        self.state.read().info.clone()
    }

    pub fn task_name(&self) -> String {
        self.state.read().task_name.clone()
    }

    pub fn task_lsid(&self) -> String {
        self.state.read().task_lsid.clone()
    }

    pub fn user_id(&self) -> String {
        self.state.read().user_id.clone()
    }

    pub fn date_submitted(&self) -> String {
        self.state.read().date_submitted.clone()
    }

    pub fn num_output_files(&self) -> u64 {
        self.state.read().num_output_files
    }

    pub fn get_output_files(&self) -> Vec<FileRef> {
        self.state.read().output_files.clone()
    }

    pub fn get_log_files(&self) -> Vec<FileRef> {
        self.state.read().log_files.clone()
    }

    /// Human-readable description of the most recent poll failure, if any
    pub fn last_error(&self) -> Option<String> {
        self.state.read().last_error.clone()
    }

    /// Poll the server and overwrite the handle's state.
    ///
    /// A transport failure records an error description and leaves the
    /// previous state (including status) untouched, so a transient blip
    /// cannot flip a completed job back to some other state.
    pub async fn get_info(&self) -> Result<(), JobError> {
        let session = self.session().ok_or(JobError::NotAuthenticated)?;
        match session.job_info(self.job_number).await {
            Ok(payload) => {
                self.apply_payload(payload);
                Ok(())
            }
            Err(e) => {
                warn!(job_number = self.job_number, error = %e, "Failed to load job info");
                self.state.write().last_error =
                    Some(format!("Error loading job #{}: {e}", self.job_number));
                Err(JobError::Fetch(e))
            }
        }
    }

    /// Whether the last loaded info reports the job finished; fetches info
    /// first only if none has ever been loaded.
    pub async fn is_finished(&self) -> Result<bool, JobError> {
        if self.state.read().info.is_none() {
            self.get_info().await?;
        }
        Ok(self.finished_flag())
    }

    /// Block until the job is finished.
    ///
    /// Classic exponential backoff without jitter: the first sleep of one
    /// unit happens before the first poll, then the wait doubles after each
    /// unfinished check, capped. Transport errors are absorbed into
    /// [`last_error`](Self::last_error) and the loop keeps going.
    pub async fn wait_until_done(&self) {
        self.wait_until_done_with_unit(Duration::from_secs(1)).await;
    }

    /// [`wait_until_done`](Self::wait_until_done) with an explicit backoff
    /// unit, so callers (and tests) can compress the schedule.
    ///
    /// Returns immediately when no session is attached: without one, no
    /// number of retries can observe completion.
    pub async fn wait_until_done_with_unit(&self, unit: Duration) {
        let mut backoff = Backoff::new(self.backoff_cap);
        loop {
            if self.session.read().is_none() {
                warn!(job_number = self.job_number, "No session attached; not waiting");
                return;
            }
            tokio::time::sleep(unit * backoff.next_wait()).await;
            if self.poll_finished().await {
                break;
            }
        }
        debug!(job_number = self.job_number, status = ?self.status(), "Job finished");
    }

    /// Request termination on the server. Returns whether the server
    /// acknowledged; local state is untouched either way, the next poll
    /// reflects the authoritative outcome.
    pub async fn terminate(&self) -> Result<bool, JobError> {
        let session = self.session().ok_or(JobError::NotAuthenticated)?;
        session
            .terminate_job(self.job_number)
            .await
            .map_err(JobError::Fetch)
    }

    /// Child jobs (pipeline steps) embedded in the job info; loads info
    /// first if necessary.
    pub async fn get_child_jobs(&self) -> Result<Vec<JobHandle>, JobError> {
        if self.state.read().info.is_none() {
            self.get_info().await?;
        }
        let info = self.state.read().info.clone().ok_or(JobError::NoInfo)?;
        let items = info
            .get("children")
            .and_then(|c| c.get("items"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let session = self.session();
        let children = items
            .into_iter()
            .filter_map(|item| {
                let number = item.get("jobId").and_then(json_u64)?;
                let child = match &session {
                    Some(s) => JobHandle::new(Arc::clone(s), number, self.backoff_cap),
                    None => JobHandle::detached(number, self.backoff_cap),
                };
                child.apply_payload(item);
                Some(child)
            })
            .collect();
        Ok(children)
    }

    pub async fn get_permissions(&self) -> Result<JobPermissions, JobError> {
        let session = self.session().ok_or(JobError::NotAuthenticated)?;
        session
            .job_permissions(self.job_number)
            .await
            .map_err(JobError::Fetch)
    }

    pub async fn set_permissions(&self, permissions: &JobPermissions) -> Result<(), JobError> {
        let session = self.session().ok_or(JobError::NotAuthenticated)?;
        session
            .set_job_permissions(self.job_number, permissions)
            .await
            .map_err(JobError::Fetch)
    }

    /// Refresh from the server and report the finished flag, absorbing
    /// transport errors; used by the polling loops.
    pub(crate) async fn poll_finished(&self) -> bool {
        let _ = self.get_info().await;
        self.finished_flag()
    }

    fn finished_flag(&self) -> bool {
        self.state
            .read()
            .info
            .as_ref()
            .and_then(|info| info.get("status")?.get("isFinished")?.as_bool())
            .unwrap_or(false)
    }

    /// Compute the complete derived state from a fresh payload, then
    /// publish it in one write.
    pub(crate) fn apply_payload(&self, payload: Value) {
        let fresh = JobState::from_payload(payload);
        *self.state.write() = fresh;
    }
}

/// Cancellable self-rescheduling poll task for one job.
///
/// Re-polls the job on a fixed delay until it reaches a terminal state.
/// There is at most one outstanding timer per poller; dropping or
/// cancelling the poller aborts any pending poll, so an owning surface can
/// tear it down cleanly.
pub struct JobPoller {
    task: JoinHandle<()>,
}

impl JobPoller {
    /// Spawn the poll loop; `interval` is typically
    /// [`ServerSession::poll_interval`](crate::ServerSession::poll_interval).
    pub fn spawn(job: Arc<JobHandle>, interval: Duration) -> Self {
        let task = tokio::spawn(async move {
            loop {
                if job.status().is_some_and(JobStatus::is_terminal) {
                    debug!(job_number = job.job_number(), "Job terminal; poller stopping");
                    break;
                }
                tokio::time::sleep(interval).await;
                // Errors are recorded on the handle; keep polling
                let _ = job.get_info().await;
            }
        });
        Self { task }
    }

    /// Abort any pending poll and stop the loop
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// Whether the loop has exited (job terminal or cancelled)
    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for JobPoller {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(has_error: bool, completed: bool, pending: bool) -> Value {
        json!({
            "jobId": "42",
            "status": {
                "hasError": has_error,
                "completedInGp": completed,
                "isPending": pending,
                "isFinished": has_error || completed,
            }
        })
    }

    #[test]
    fn test_error_wins_over_completed() {
        assert_eq!(
            JobStatus::from_payload(&payload(true, true, false)),
            JobStatus::Error
        );
    }

    #[test]
    fn test_completed_wins_over_pending() {
        assert_eq!(
            JobStatus::from_payload(&payload(false, true, true)),
            JobStatus::Completed
        );
    }

    #[test]
    fn test_pending_when_only_pending_flag() {
        assert_eq!(
            JobStatus::from_payload(&payload(false, false, true)),
            JobStatus::Pending
        );
    }

    #[test]
    fn test_running_when_no_flags() {
        assert_eq!(
            JobStatus::from_payload(&payload(false, false, false)),
            JobStatus::Running
        );
        // A payload with no status object at all is also running
        assert_eq!(JobStatus::from_payload(&json!({})), JobStatus::Running);
    }

    #[test]
    fn test_backoff_schedule_doubles_to_cap() {
        let mut backoff = Backoff::new(60);
        let schedule: Vec<u32> = (0..8).map(|_| backoff.next_wait()).collect();
        assert_eq!(schedule, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_backoff_respects_small_cap() {
        let mut backoff = Backoff::new(10);
        let schedule: Vec<u32> = (0..5).map(|_| backoff.next_wait()).collect();
        assert_eq!(schedule, vec![1, 2, 4, 8, 10]);
    }

    #[test]
    fn test_state_replacement_derives_all_fields() {
        let job = JobHandle::detached(42, 60);
        assert_eq!(job.status(), None);

        job.apply_payload(json!({
            "jobId": "42",
            "taskName": "ConvertLineEndings",
            "taskLsid": "urn:lsid:example:00002:1",
            "userId": "jdoe",
            "dateSubmitted": "2017-03-01 10:12",
            "numOutputFiles": "2",
            "outputFiles": [
                {"link": {"href": "https://example.org/gp/jobResults/42/out.cvt.txt"}},
                {"link": {"href": "https://example.org/gp/jobResults/42/other.txt"}}
            ],
            "logFiles": [
                {"link": {"href": "https://example.org/gp/jobResults/42/gp_execution_log.txt"}}
            ],
            "status": {"completedInGp": true, "isFinished": true}
        }));

        assert_eq!(job.status(), Some(JobStatus::Completed));
        assert_eq!(job.task_name(), "ConvertLineEndings");
        assert_eq!(job.user_id(), "jdoe");
        assert_eq!(job.num_output_files(), 2);
        assert_eq!(job.get_output_files().len(), 2);
        assert_eq!(job.get_log_files().len(), 1);
        assert_eq!(job.last_error(), None);
    }

    #[test]
    fn test_repeated_identical_payloads_do_not_corrupt_state() {
        let job = JobHandle::detached(7, 60);
        for _ in 0..3 {
            job.apply_payload(payload(false, true, false));
            assert_eq!(job.status(), Some(JobStatus::Completed));
        }
    }

    #[tokio::test]
    async fn test_detached_handle_reports_not_authenticated() {
        let job = JobHandle::detached(7, 60);
        assert!(matches!(job.get_info().await, Err(JobError::NotAuthenticated)));
        assert!(matches!(job.terminate().await, Err(JobError::NotAuthenticated)));
    }

    #[tokio::test]
    async fn test_wait_on_detached_handle_returns() {
        let job = JobHandle::detached(7, 60);
        tokio::time::timeout(
            Duration::from_secs(1),
            job.wait_until_done_with_unit(Duration::from_millis(1)),
        )
        .await
        .expect("wait must return for a handle without a session");
        assert_eq!(job.status(), None);
    }

    #[test]
    fn test_json_u64_accepts_numbers_and_strings() {
        assert_eq!(json_u64(&json!(12345)), Some(12345));
        assert_eq!(json_u64(&json!("12345")), Some(12345));
        assert_eq!(json_u64(&json!(null)), None);
        assert_eq!(json_u64(&json!("not a number")), None);
    }
}
