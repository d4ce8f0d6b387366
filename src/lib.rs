//! GenePattern REST client
//!
//! This crate provides:
//! - Authenticated sessions against a GenePattern server (password-grant
//!   login, lazy bearer tokens, file upload, job submission)
//! - A registry of sessions keyed by server URL, shared across a notebook
//!   or application runtime
//! - Task introspection (parameter schemas, choice lists, EULAs)
//! - Job handles with a polling state machine and exponential backoff

pub mod file;
pub mod job;
pub mod registry;
pub mod session;
pub mod submit;
pub mod task;

pub use file::FileRef;
pub use job::{GroupPermission, JobError, JobHandle, JobPermissions, JobPoller, JobStatus};
pub use registry::{RegistryError, SessionQuery, SessionRegistry};
pub use session::{AuthError, JobApi, ServerSession, SessionError, TaskListEntry};
pub use submit::{JobSpec, JobSubmissionBuilder, ParamValues};
pub use task::{TaskDescriptor, TaskError, TaskParameter};

/// Client-wide tuning knobs
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ClientConfig {
    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Delay between automatic re-polls of a pending/running job, in seconds
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Upper bound on the doubling backoff wait, in backoff units
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap: u32,

    /// Length of one backoff unit in milliseconds
    #[serde(default = "default_backoff_unit_ms")]
    pub backoff_unit_ms: u64,
}

fn default_timeout_secs() -> u64 { 60 }
fn default_poll_interval_secs() -> u64 { 15 }
fn default_backoff_cap() -> u32 { 60 }
fn default_backoff_unit_ms() -> u64 { 1000 }

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            backoff_cap: default_backoff_cap(),
            backoff_unit_ms: default_backoff_unit_ms(),
        }
    }
}

impl ClientConfig {
    /// Parse a configuration from a TOML document
    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout_secs, 60);
        assert_eq!(config.poll_interval_secs, 15);
        assert_eq!(config.backoff_cap, 60);
        assert_eq!(config.backoff_unit_ms, 1000);
    }

    #[test]
    fn test_config_from_toml() {
        let config = ClientConfig::from_toml("poll_interval_secs = 5\nbackoff_cap = 10\n").unwrap();
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.backoff_cap, 10);
        // Unspecified fields fall back to defaults
        assert_eq!(config.timeout_secs, 60);
    }
}
