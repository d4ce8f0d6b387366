//! Job submission requests and the parameter-translation builder

use crate::job::JobHandle;
use crate::session::SessionError;
use crate::task::{TaskDescriptor, TaskError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One parameter of a submission request; `values` is always a list, even
/// for a single scalar.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobParam {
    pub name: String,
    pub values: Vec<String>,
    #[serde(rename = "groupId", skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

/// Value(s) for one parameter. Scalars convert to one-element lists;
/// `None` converts to a single empty string, since the server expects an
/// explicit blank for declared-but-empty optional parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamValues(Vec<String>);

impl ParamValues {
    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

impl From<&str> for ParamValues {
    fn from(value: &str) -> Self {
        ParamValues(vec![value.to_string()])
    }
}

impl From<String> for ParamValues {
    fn from(value: String) -> Self {
        ParamValues(vec![value])
    }
}

impl From<Vec<String>> for ParamValues {
    fn from(values: Vec<String>) -> Self {
        ParamValues(values)
    }
}

impl From<Vec<&str>> for ParamValues {
    fn from(values: Vec<&str>) -> Self {
        ParamValues(values.into_iter().map(str::to_string).collect())
    }
}

impl<T: Into<ParamValues>> From<Option<T>> for ParamValues {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => ParamValues(vec![String::new()]),
        }
    }
}

/// The data defining a request to run a job: the target task's LSID and an
/// ordered parameter list. Serializes directly into the job-creation wire
/// format `{lsid, params}`.
#[derive(Debug, Clone, Serialize)]
pub struct JobSpec {
    lsid: String,
    params: Vec<JobParam>,
}

impl JobSpec {
    pub fn new(lsid: impl Into<String>) -> Self {
        Self {
            lsid: lsid.into(),
            params: Vec::new(),
        }
    }

    pub fn lsid(&self) -> &str {
        &self.lsid
    }

    pub fn params(&self) -> &[JobParam] {
        &self.params
    }

    /// Append a parameter; single values are wrapped into a list
    pub fn set_parameter(&mut self, name: impl Into<String>, values: impl Into<ParamValues>) {
        self.push_param(name, values, None);
    }

    /// Append a parameter bound to a parameter group
    pub fn set_parameter_with_group(
        &mut self,
        name: impl Into<String>,
        values: impl Into<ParamValues>,
        group_id: impl Into<String>,
    ) {
        self.push_param(name, values, Some(group_id.into()));
    }

    fn push_param(
        &mut self,
        name: impl Into<String>,
        values: impl Into<ParamValues>,
        group_id: Option<String>,
    ) {
        self.params.push(JobParam {
            name: name.into(),
            values: values.into().into_vec(),
            group_id,
        });
    }
}

/// Rewrite a server parameter name into a form usable as a host-language
/// identifier: every non-alphanumeric byte becomes an underscore.
pub fn safe_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Translates collected name/value pairs into a [`JobSpec`] for one task
/// and submits it.
///
/// The builder carries a bidirectional mapping between identifier-safe
/// parameter names and the server's original names, built from the task's
/// parameter list at construction time. Either form is accepted when
/// setting a value.
pub struct JobSubmissionBuilder {
    session: Arc<dyn crate::session::JobApi>,
    name_map: HashMap<String, String>,
    spec: JobSpec,
    backoff_unit: Duration,
    backoff_cap: u32,
}

impl JobSubmissionBuilder {
    /// Build for a task, loading its definition if necessary
    pub async fn for_task(task: &TaskDescriptor) -> Result<Self, TaskError> {
        let lsid = task.lsid().await?;
        let params = task.params().await?;
        let name_map = params
            .iter()
            .map(|p| (safe_name(p.name()), p.name().to_string()))
            .collect();
        let session = task.api();
        let (backoff_unit, backoff_cap) = session.poll_backoff();
        Ok(Self {
            session,
            name_map,
            spec: JobSpec::new(lsid),
            backoff_unit,
            backoff_cap,
        })
    }

    /// Set one parameter. `name` may be the identifier-safe form or the
    /// server's original name; a `None` value becomes an explicit empty
    /// string.
    pub fn param(mut self, name: &str, values: impl Into<ParamValues>) -> Self {
        let server_name = self
            .name_map
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string());
        self.spec.set_parameter(server_name, values);
        self
    }

    /// The server-side name behind an identifier-safe name
    pub fn server_name(&self, safe: &str) -> Option<&str> {
        self.name_map.get(safe).map(String::as_str)
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    /// Submit the assembled spec; optionally poll until terminal
    pub async fn submit(self, wait_until_done: bool) -> Result<JobHandle, SessionError> {
        debug!(lsid = %self.spec.lsid(), params = self.spec.params().len(), "Submitting built job spec");
        let job_number = self.session.submit_job(&self.spec).await?;
        let job = JobHandle::new(self.session, job_number, self.backoff_cap);
        if wait_until_done {
            job.wait_until_done_with_unit(self.backoff_unit).await;
        }
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_value_is_wrapped_in_list() {
        let mut spec = JobSpec::new("urn:lsid:example:00001:1");
        spec.set_parameter("input.file", "singlevalue");
        assert_eq!(spec.params()[0].values, vec!["singlevalue"]);
    }

    #[test]
    fn test_value_list_is_stored_unchanged() {
        let mut spec = JobSpec::new("urn:lsid:example:00001:1");
        spec.set_parameter("input.file", vec!["a", "b"]);
        assert_eq!(spec.params()[0].values, vec!["a", "b"]);
    }

    #[test]
    fn test_none_becomes_explicit_empty_string() {
        let mut spec = JobSpec::new("urn:lsid:example:00001:1");
        spec.set_parameter("comment", None::<&str>);
        assert_eq!(spec.params()[0].values, vec![""]);
    }

    #[test]
    fn test_wire_format_serialization() {
        let mut spec = JobSpec::new(
            "urn:lsid:broad.mit.edu:cancer.software.genepattern.module.analysis:00001:1",
        );
        spec.set_parameter("input.file", "http://example/data.gct");
        let serialized = serde_json::to_value(&spec).unwrap();
        assert_eq!(
            serialized,
            json!({
                "lsid": "urn:lsid:broad.mit.edu:cancer.software.genepattern.module.analysis:00001:1",
                "params": [
                    {"name": "input.file", "values": ["http://example/data.gct"]}
                ]
            })
        );
    }

    #[test]
    fn test_group_id_serialized_only_when_present() {
        let mut spec = JobSpec::new("urn:lsid:example:00001:1");
        spec.set_parameter_with_group("input.file", "a", "advanced");
        let serialized = serde_json::to_value(&spec).unwrap();
        assert_eq!(serialized["params"][0]["groupId"], json!("advanced"));
    }

    #[test]
    fn test_safe_name_rewrites_non_alphanumerics() {
        assert_eq!(safe_name("input.file"), "input_file");
        assert_eq!(safe_name("cls file"), "cls_file");
        assert_eq!(safe_name("threshold"), "threshold");
    }
}
