//! Server sessions and the remote job API surface

use crate::file::FileRef;
use crate::job::{json_u64, Backoff, JobHandle, JobPermissions};
use crate::submit::JobSpec;
use crate::task::TaskDescriptor;
use crate::ClientConfig;
use async_trait::async_trait;
use base64::Engine as _;
use parking_lot::RwLock;
use regex::Regex;
use reqwest::header::{AUTHORIZATION, LOCATION};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// User-Agent sent with every request
const USER_AGENT: &str = "GenePatternRest";

/// Errors from authentication
#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("Connection timed out attempting to contact the GenePattern server: {0}")]
    Unreachable(String),

    #[error("Invalid username or password")]
    InvalidCredentials,
}

/// Errors from session-level server calls
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Server rejected {context} with HTTP {status}")]
    Rejected { status: u16, context: &'static str },

    #[error("File upload rejected with HTTP {status}")]
    UploadRejected { status: u16 },

    #[error("Malformed server response: {0}")]
    MalformedResponse(&'static str),
}

/// Capability interface for job-scoped and task-scoped server calls.
///
/// Everything a [`JobHandle`] or [`TaskDescriptor`] needs from the server
/// goes through this trait, so handles stay decoupled from the concrete
/// session type.
#[async_trait]
pub trait JobApi: Send + Sync {
    /// Normalized base URL of the server
    fn base_url(&self) -> &str;

    /// `Authorization` header value, or `None` for anonymous sessions
    fn auth_header(&self) -> Option<String>;

    /// Backoff unit and cap for polling loops driven through this API
    fn poll_backoff(&self) -> (Duration, u32);

    /// Fetch the raw job info payload
    async fn job_info(&self, job_number: u64) -> Result<Value, SessionError>;

    /// Request job termination; `true` iff the server acknowledged
    async fn terminate_job(&self, job_number: u64) -> Result<bool, SessionError>;

    /// Fetch the sharing permissions of a job
    async fn job_permissions(&self, job_number: u64) -> Result<JobPermissions, SessionError>;

    /// Overwrite the sharing permissions of a job
    async fn set_job_permissions(
        &self,
        job_number: u64,
        permissions: &JobPermissions,
    ) -> Result<(), SessionError>;

    /// Fetch the raw task definition DTO by LSID or name
    async fn task_json(&self, lsid_or_name: &str) -> Result<Value, SessionError>;

    /// Authenticated GET of an absolute href returning JSON (choice-list reloads)
    async fn fetch_json(&self, href: &str) -> Result<Value, SessionError>;

    /// POST a job submission; returns the assigned job number
    async fn submit_job(&self, spec: &JobSpec) -> Result<u64, SessionError>;
}

/// One entry in the server's task list
#[derive(Debug, Clone, Deserialize)]
pub struct TaskListEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub lsid: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub documentation: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TaskListResponse {
    #[serde(default)]
    all_modules: Vec<TaskListEntry>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// A connection to one GenePattern server: base URL, credentials and a
/// lazily obtained bearer token.
///
/// A session with an empty username is anonymous; it can issue
/// unauthenticated calls but is never stored in a
/// [`SessionRegistry`](crate::SessionRegistry).
pub struct ServerSession {
    url: String,
    username: String,
    password: String,
    token: RwLock<Option<String>>,
    client: Client,
    config: ClientConfig,
}

impl fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSession")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("token", &self.token.read().as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ServerSession {
    /// Create a session with default configuration
    pub fn new(
        url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::with_config(url, username, password, ClientConfig::default())
    }

    /// Create a session with explicit configuration
    pub fn with_config(
        url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        config: ClientConfig,
    ) -> Self {
        Self {
            url: normalize_url(&url.into()),
            username: username.into(),
            password: password.into(),
            token: RwLock::new(None),
            client: Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .user_agent(USER_AGENT)
                .build()
                .expect("Failed to create HTTP client"),
            config,
        }
    }

    /// Normalized server URL (always ends with the application path)
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// The registered password. Treated as a secret: never logged and
    /// redacted from `Debug` output.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Whether this session carries no credentials
    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Delay between automatic re-polls of a non-terminal job
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.poll_interval_secs)
    }

    /// Authenticate with the password grant and cache the bearer token.
    ///
    /// Timeouts and redirect loops map to [`AuthError::Unreachable`]; every
    /// other failure is reported as invalid credentials, matching what the
    /// server returns for a bad password.
    pub async fn login(&self) -> Result<String, AuthError> {
        let url = format!(
            "{}/rest/v1/oauth2/token?grant_type=password&username={}&password={}&client_id=GenePatternNotebook-{}",
            self.url,
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            urlencoding::encode(&self.username),
        );

        let response = self.client.post(&url).send().await.map_err(|e| {
            if e.is_timeout() || e.is_redirect() {
                AuthError::Unreachable(e.to_string())
            } else {
                AuthError::InvalidCredentials
            }
        })?;

        if !response.status().is_success() {
            return Err(AuthError::InvalidCredentials);
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|_| AuthError::InvalidCredentials)?;

        *self.token.write() = Some(body.access_token.clone());
        info!(url = %self.url, username = %self.username, "Authenticated with GenePattern server");
        Ok(body.access_token)
    }

    /// Return the cached bearer token, logging in first if necessary
    pub async fn token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.token.read().clone() {
            return Ok(token);
        }
        self.login().await
    }

    /// `Authorization` header value for the current credentials.
    ///
    /// `None` for anonymous sessions; `Bearer` once a token has been
    /// obtained; HTTP Basic before the first login.
    pub fn authorization_header(&self) -> Option<String> {
        if let Some(token) = self.token.read().as_ref() {
            return Some(format!("Bearer {token}"));
        }
        if self.username.is_empty() {
            return None;
        }
        let credentials = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.username, self.password));
        Some(format!("Basic {credentials}"))
    }

    /// Upload a local file to the job-input upload endpoint.
    ///
    /// A non-201 response is reported as a [`SessionError`] value rather
    /// than a panic so UI callers can render the failure inline.
    pub async fn upload_file(
        &self,
        name: &str,
        path: impl AsRef<Path>,
    ) -> Result<FileRef, SessionError> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        let url = format!(
            "{}/rest/v1/data/upload/job_input?name={}",
            self.url,
            urlencoding::encode(name)
        );
        debug!(name, size = bytes.len(), "Uploading job input file");

        let response = self.request(Method::POST, &url).body(bytes).send().await?;
        let status = response.status();
        if status != StatusCode::CREATED {
            warn!(name, status = status.as_u16(), "File upload rejected");
            return Err(SessionError::UploadRejected {
                status: status.as_u16(),
            });
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(SessionError::MalformedResponse(
                "upload response is missing a Location header",
            ))?;
        Ok(FileRef::new(location))
    }

    /// Submit a job and return a handle to it.
    ///
    /// With `wait_until_done` the call polls with exponential backoff until
    /// the job reaches a terminal state before returning.
    pub async fn run_job(
        self: &Arc<Self>,
        spec: &JobSpec,
        wait_until_done: bool,
    ) -> Result<JobHandle, SessionError> {
        let job_number = self.submit_job(spec).await?;
        let job = JobHandle::new(self.as_api(), job_number, self.config.backoff_cap);
        if wait_until_done {
            job.wait_until_done_with_unit(self.backoff_unit()).await;
        }
        Ok(job)
    }

    /// Fetch the summary metadata of every installed task in one call
    pub async fn get_task_list(&self) -> Result<Vec<TaskListEntry>, SessionError> {
        let url = format!("{}/rest/v1/tasks/all.json", self.url);
        let response = self.request(Method::GET, &url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SessionError::Rejected {
                status: status.as_u16(),
                context: "task list request",
            });
        }
        let body: TaskListResponse = response.json().await?;
        debug!(tasks = body.all_modules.len(), "Fetched task list");
        Ok(body.all_modules)
    }

    /// Construct an unloaded descriptor for a task; no server call is made
    /// until the descriptor is first used.
    pub fn get_task(self: &Arc<Self>, lsid_or_name: impl Into<String>) -> TaskDescriptor {
        TaskDescriptor::new(self.as_api(), lsid_or_name)
    }

    /// Construct a handle to an existing job from its bare number; info is
    /// fetched on the first poll.
    pub fn get_job(self: &Arc<Self>, job_number: u64) -> JobHandle {
        JobHandle::new(self.as_api(), job_number, self.config.backoff_cap)
    }

    /// Fetch the server's system message with HTML tags stripped
    pub async fn system_message(&self) -> Result<String, SessionError> {
        let url = format!("{}/rest/v1/config/system-message", self.url);
        let response = self.request(Method::GET, &url).send().await?;
        let text = response.text().await?;
        Ok(strip_html(&text))
    }

    /// Block until every job in the list is finished.
    ///
    /// One doubling-backoff schedule is shared across the whole batch.
    /// Rounds walk the list in order and stop at the first unfinished job,
    /// bounding the number of server calls per round; the next round resumes
    /// from the top.
    pub async fn poll_multiple_jobs(&self, jobs: &[Arc<JobHandle>]) {
        let mut complete = vec![false; jobs.len()];
        let mut backoff = Backoff::new(self.config.backoff_cap);
        let unit = self.backoff_unit();

        while complete.iter().any(|done| !done) {
            tokio::time::sleep(unit * backoff.next_wait()).await;
            for (done, job) in complete.iter_mut().zip(jobs) {
                if *done {
                    continue;
                }
                *done = job.poll_finished().await;
                if !*done {
                    break;
                }
            }
        }
        debug!(jobs = jobs.len(), "All polled jobs finished");
    }

    /// This session viewed through the capability interface
    pub fn as_api(self: &Arc<Self>) -> Arc<dyn JobApi> {
        Arc::clone(self) as Arc<dyn JobApi>
    }

    fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.config.backoff_unit_ms)
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(auth) = self.authorization_header() {
            builder = builder.header(AUTHORIZATION, auth);
        }
        builder
    }

    pub(crate) async fn authed_get(&self, url: &str) -> Result<reqwest::Response, SessionError> {
        Ok(self.request(Method::GET, url).send().await?)
    }

    pub(crate) async fn put_with_basic_auth(
        &self,
        url: &str,
        body: String,
    ) -> Result<(), SessionError> {
        self.client
            .put(url)
            .basic_auth(&self.username, Some(&self.password))
            .body(body)
            .send()
            .await?;
        Ok(())
    }

    async fn get_json(&self, url: &str) -> Result<Value, SessionError> {
        let response = self.request(Method::GET, url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SessionError::Rejected {
                status: status.as_u16(),
                context: "resource fetch",
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl JobApi for ServerSession {
    fn base_url(&self) -> &str {
        &self.url
    }

    fn auth_header(&self) -> Option<String> {
        self.authorization_header()
    }

    fn poll_backoff(&self) -> (Duration, u32) {
        (self.backoff_unit(), self.config.backoff_cap)
    }

    async fn job_info(&self, job_number: u64) -> Result<Value, SessionError> {
        let url = format!(
            "{}/rest/v1/jobs/{}?includeInputParams=true",
            self.url, job_number
        );
        self.get_json(&url).await
    }

    async fn terminate_job(&self, job_number: u64) -> Result<bool, SessionError> {
        let url = format!("{}/rest/v1/jobs/{}/terminate", self.url, job_number);
        let response = self.request(Method::DELETE, &url).send().await?;
        let acknowledged = response.status() == StatusCode::OK;
        info!(job_number, acknowledged, "Requested job termination");
        Ok(acknowledged)
    }

    async fn job_permissions(&self, job_number: u64) -> Result<JobPermissions, SessionError> {
        let url = format!("{}/rest/v1/jobs/{}/permissions", self.url, job_number);
        let value = self.get_json(&url).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn set_job_permissions(
        &self,
        job_number: u64,
        permissions: &JobPermissions,
    ) -> Result<(), SessionError> {
        let url = format!("{}/rest/v1/jobs/{}/permissions", self.url, job_number);
        let response = self
            .request(Method::PUT, &url)
            .json(permissions)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SessionError::Rejected {
                status: status.as_u16(),
                context: "permissions update",
            });
        }
        Ok(())
    }

    async fn task_json(&self, lsid_or_name: &str) -> Result<Value, SessionError> {
        // Any string is passed through URL-escaped; the server decides
        // whether it is an LSID or a display name.
        let url = format!(
            "{}/rest/v1/tasks/{}/",
            self.url,
            urlencoding::encode(lsid_or_name)
        );
        self.get_json(&url).await
    }

    async fn fetch_json(&self, href: &str) -> Result<Value, SessionError> {
        self.get_json(href).await
    }

    async fn submit_job(&self, spec: &JobSpec) -> Result<u64, SessionError> {
        let url = format!("{}/rest/v1/jobs", self.url);
        debug!(lsid = %spec.lsid(), params = spec.params().len(), "Submitting job");

        let response = self.request(Method::POST, &url).json(spec).send().await?;
        let status = response.status();
        if status != StatusCode::CREATED {
            return Err(SessionError::Rejected {
                status: status.as_u16(),
                context: "job submission",
            });
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body: Value = response.json().await.unwrap_or(Value::Null);

        let job_number = body
            .get("jobId")
            .and_then(json_u64)
            .or_else(|| {
                location
                    .as_deref()?
                    .trim_end_matches('/')
                    .rsplit('/')
                    .next()?
                    .parse()
                    .ok()
            })
            .ok_or(SessionError::MalformedResponse(
                "submission response carries no job id",
            ))?;

        info!(job_number, lsid = %spec.lsid(), "Job submitted");
        Ok(job_number)
    }
}

/// Normalize a server URL: strip a trailing slash and ensure it ends with
/// the fixed application path segment.
pub(crate) fn normalize_url(url: &str) -> String {
    let trimmed = url.strip_suffix('/').unwrap_or(url);
    if trimmed.ends_with("/gp") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/gp")
    }
}

/// Strip HTML tags from a server-provided message string
fn strip_html(html: &str) -> String {
    static TAGS: OnceLock<Regex> = OnceLock::new();
    TAGS.get_or_init(|| Regex::new(r"<[^>]*>").expect("static regex"))
        .replace_all(html, "")
        .to_string()
}
