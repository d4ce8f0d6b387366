//! Task descriptors and parameter schemas

use crate::job::json_u64;
use crate::session::{JobApi, ServerSession, SessionError};
use parking_lot::RwLock as SyncRwLock;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const NOT_INITIALIZED: &str = "NOT_INITIALIZED";

/// Errors from task operations
#[derive(thiserror::Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("JSON serialization/deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("'{0}' is not a choice parameter")]
    NotAChoiceParameter(String),

    #[error("Choice list for '{0}' declares no href to load from")]
    MissingChoiceHref(String),

    #[error("Module '{0}' has no EULA")]
    NoEula(String),

    #[error("Malformed task response: {0}")]
    Malformed(&'static str),
}

/// Declared constraints of one parameter.
///
/// Known server attribute keys get named optional fields; everything else
/// lands in the residual bag so unmodeled attributes survive a round trip.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParamAttributes {
    /// Type tag, e.g. `java.io.File` or `PASSWORD`
    #[serde(rename = "type", default)]
    pub type_tag: Option<String>,

    /// Legacy type marker (`FILE`)
    #[serde(rename = "TYPE", default)]
    pub legacy_type: Option<String>,

    /// Legacy mode marker (`IN`)
    #[serde(rename = "MODE", default)]
    pub mode: Option<String>,

    /// Non-empty when the parameter is declared optional
    #[serde(default)]
    pub optional: Option<String>,

    /// Minimum number of values; number or numeric string on the wire
    #[serde(rename = "minValue", default)]
    pub min_values: Option<Value>,

    /// Maximum number of values; absent means unbounded
    #[serde(rename = "maxValue", default)]
    pub max_values: Option<Value>,

    #[serde(rename = "default_value", default)]
    pub default_value: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// Semicolon-separated accepted file kinds
    #[serde(rename = "fileFormat", default)]
    pub file_format: Option<String>,

    #[serde(rename = "altName", default)]
    pub alt_name: Option<String>,

    #[serde(rename = "altDescription", default)]
    pub alt_description: Option<String>,

    #[serde(rename = "choiceInfo", default)]
    pub(crate) choice_info: Option<ChoiceInfo>,

    /// Server-declared attributes not yet modeled
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// One selectable choice
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Choice {
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChoiceStatus {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub flag: String,
}

/// Choice-list metadata as declared by the server
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChoiceInfo {
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub status: ChoiceStatus,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(rename = "choiceAllowCustom", default)]
    pub allow_custom: Option<Value>,
    #[serde(rename = "selectedValue", default)]
    pub selected_value: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ParamEntry {
    #[serde(default)]
    attributes: ParamAttributes,
    #[serde(default)]
    description: Option<String>,
}

/// One parameter of a task.
///
/// Cheap to clone; choice metadata is shared so a follow-up fetch performed
/// through one clone is visible to the rest.
#[derive(Debug, Clone)]
pub struct TaskParameter {
    name: String,
    description: String,
    attributes: ParamAttributes,
    choice: Option<Arc<SyncRwLock<ChoiceInfo>>>,
}

impl TaskParameter {
    /// Parse one entry of the task DTO's `params` array, which is a
    /// single-key object `{"<name>": {"attributes": {...}}}`.
    fn from_entry(entry: Value) -> Option<TaskParameter> {
        let object = entry.as_object()?;
        let (name, body) = object.iter().next()?;
        let parsed: ParamEntry = match serde_json::from_value(body.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(param = %name, error = %e, "Skipping unparseable task parameter");
                return None;
            }
        };
        let mut attributes = parsed.attributes;
        let choice = attributes
            .choice_info
            .take()
            .map(|info| Arc::new(SyncRwLock::new(info)));
        let description = attributes
            .description
            .clone()
            .or(parsed.description)
            .unwrap_or_default();
        Some(TaskParameter {
            name: name.clone(),
            description,
            attributes,
            choice,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn attributes(&self) -> &ParamAttributes {
        &self.attributes
    }

    pub fn default_value(&self) -> Option<&str> {
        self.attributes
            .default_value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Optional only when the explicit flag is set and the declared minimum
    /// occurrence is zero
    pub fn is_optional(&self) -> bool {
        let flagged = self
            .attributes
            .optional
            .as_deref()
            .is_some_and(|v| !v.trim().is_empty());
        let min_zero = self
            .attributes
            .min_values
            .as_ref()
            .and_then(json_u64)
            .is_some_and(|min| min == 0);
        flagged && min_zero
    }

    /// File-input parameter per the legacy type markers; the modern type
    /// tag is inconsistent across tasks and is not consulted here.
    pub fn is_file_type(&self) -> bool {
        self.attributes.legacy_type.as_deref() == Some("FILE")
            && self.attributes.mode.as_deref() == Some("IN")
    }

    pub fn is_password(&self) -> bool {
        self.attributes.type_tag.as_deref() == Some("PASSWORD")
    }

    /// Multiple values are allowed unless an explicit maximum of 1 is declared
    pub fn allow_multiple(&self) -> bool {
        match self.attributes.max_values.as_ref().and_then(json_u64) {
            Some(max) => max > 1,
            None => true,
        }
    }

    /// Accepted file kinds, split from the declared format list; empty when
    /// every kind is accepted
    pub fn kinds(&self) -> Vec<String> {
        match self.attributes.file_format.as_deref() {
            None | Some("") | Some("*") => Vec::new(),
            Some(formats) => formats.split(';').map(str::to_string).collect(),
        }
    }

    pub fn alt_name(&self) -> Option<&str> {
        self.attributes
            .alt_name
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn alt_description(&self) -> Option<&str> {
        self.attributes
            .alt_description
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn is_choice_param(&self) -> bool {
        self.choice.is_some()
    }

    /// Status message and flag of the choice list
    pub fn choice_status(&self) -> Result<(String, String), TaskError> {
        let info = self.choice_info()?;
        let guard = info.read();
        Ok((guard.status.message.clone(), guard.status.flag.clone()))
    }

    pub fn choice_href(&self) -> Result<Option<String>, TaskError> {
        Ok(self.choice_info()?.read().href.clone())
    }

    /// Default selection of the choice menu, if the server declares one
    pub fn choice_selected_value(&self) -> Result<Option<String>, TaskError> {
        Ok(self.choice_info()?.read().selected_value.clone())
    }

    /// Whether a custom value outside the choice list is accepted
    pub fn allow_choice_custom_value(&self) -> Result<bool, TaskError> {
        let info = self.choice_info()?;
        let allow = info.read().allow_custom.clone();
        Ok(match allow {
            Some(Value::Bool(b)) => b,
            Some(Value::String(s)) => {
                matches!(s.to_lowercase().as_str(), "on" | "yes" | "true")
            }
            _ => false,
        })
    }

    /// The choice list, issuing the follow-up fetch when the server has not
    /// finished assembling it.
    ///
    /// The not-initialized flag is re-checked on every call, so a stale
    /// in-memory list is replaced as soon as the server is ready.
    pub async fn choices(&self, api: &dyn JobApi) -> Result<Vec<Choice>, TaskError> {
        let info = self.choice_info()?;

        let pending_href = {
            let guard = info.read();
            if guard.status.flag == NOT_INITIALIZED {
                Some(guard.href.clone())
            } else {
                None
            }
        };

        if let Some(href) = pending_href {
            let href = href.ok_or_else(|| TaskError::MissingChoiceHref(self.name.clone()))?;
            debug!(param = %self.name, "Choice list not initialized; fetching from href");
            let value = api.fetch_json(&href).await?;
            let fresh: ChoiceInfo = serde_json::from_value(value)?;
            *info.write() = fresh;
        }

        Ok(info.read().choices.clone())
    }

    fn choice_info(&self) -> Result<&Arc<SyncRwLock<ChoiceInfo>>, TaskError> {
        self.choice
            .as_ref()
            .ok_or_else(|| TaskError::NotAChoiceParameter(self.name.clone()))
    }
}

/// Parsed task definition
#[derive(Debug, Clone)]
struct TaskInfo {
    name: String,
    lsid: String,
    description: String,
    documentation: String,
    version: String,
    params: Vec<TaskParameter>,
    dto: Value,
}

impl TaskInfo {
    fn parse(value: Value) -> Result<TaskInfo, TaskError> {
        if !value.is_object() {
            return Err(TaskError::Malformed("task response is not an object"));
        }
        let get_str = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let params = value
            .get("params")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(TaskParameter::from_entry)
            .collect();
        Ok(TaskInfo {
            name: get_str("name"),
            lsid: get_str("lsid"),
            description: get_str("description"),
            documentation: get_str("documentation"),
            version: get_str("version"),
            params,
            dto: value,
        })
    }
}

/// One remote analysis definition, loaded lazily.
///
/// Constructing a descriptor performs no server call; the first accessor
/// that needs the definition triggers [`load`](Self::load). The identifier
/// is immutable and may be a versioned LSID or a display name; any string
/// is passed through to the server unvalidated.
pub struct TaskDescriptor {
    lsid_or_name: String,
    session: Arc<dyn JobApi>,
    info: RwLock<Option<TaskInfo>>,
}

impl TaskDescriptor {
    pub fn new(session: Arc<dyn JobApi>, lsid_or_name: impl Into<String>) -> Self {
        Self {
            lsid_or_name: lsid_or_name.into(),
            session,
            info: RwLock::new(None),
        }
    }

    /// The identifier this descriptor was constructed with
    pub fn lsid_or_name(&self) -> &str {
        &self.lsid_or_name
    }

    pub fn is_loaded(&self) -> bool {
        self.info.try_read().map(|i| i.is_some()).unwrap_or(false)
    }

    /// Fetch the task definition and (re)populate every derived field
    pub async fn load(&self) -> Result<(), TaskError> {
        let value = self.session.task_json(&self.lsid_or_name).await?;
        let info = TaskInfo::parse(value)?;
        debug!(task = %info.name, lsid = %info.lsid, params = info.params.len(), "Loaded task definition");
        *self.info.write().await = Some(info);
        Ok(())
    }

    pub async fn name(&self) -> Result<String, TaskError> {
        self.field(|info| info.name.clone()).await
    }

    pub async fn lsid(&self) -> Result<String, TaskError> {
        self.field(|info| info.lsid.clone()).await
    }

    pub async fn description(&self) -> Result<String, TaskError> {
        self.field(|info| info.description.clone()).await
    }

    /// Documentation link, absolute or server-relative
    pub async fn documentation(&self) -> Result<String, TaskError> {
        self.field(|info| info.documentation.clone()).await
    }

    pub async fn version(&self) -> Result<String, TaskError> {
        self.field(|info| info.version.clone()).await
    }

    /// The ordered parameter list
    pub async fn params(&self) -> Result<Vec<TaskParameter>, TaskError> {
        self.field(|info| info.params.clone()).await
    }

    /// Raw parameter grouping metadata
    pub async fn param_groups(&self) -> Result<Vec<Value>, TaskError> {
        self.field(|info| {
            info.dto
                .get("paramGroups")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        })
        .await
    }

    /// The raw task DTO
    pub async fn dto(&self) -> Result<Value, TaskError> {
        self.field(|info| info.dto.clone()).await
    }

    /// The module's EULA information; an absent EULA is a distinguished
    /// error rather than a silent default.
    pub async fn eula(&self) -> Result<Value, TaskError> {
        let dto = self.dto().await?;
        dto.get("eulaInfo")
            .cloned()
            .ok_or_else(|| TaskError::NoEula(self.lsid_or_name.clone()))
    }

    /// Accept the module's EULA and reload the definition
    pub async fn accept_eula(&self, session: &ServerSession) -> Result<(), TaskError> {
        let eula = self.eula().await?;
        let url = eula
            .get("acceptUrl")
            .and_then(Value::as_str)
            .ok_or(TaskError::Malformed("EULA info carries no acceptUrl"))?;
        let data = match eula.get("acceptData") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        session.put_with_basic_auth(url, data).await?;
        self.load().await
    }

    pub(crate) fn api(&self) -> Arc<dyn JobApi> {
        Arc::clone(&self.session)
    }

    async fn field<T>(&self, extract: impl Fn(&TaskInfo) -> T) -> Result<T, TaskError> {
        if self.info.read().await.is_none() {
            self.load().await?;
        }
        let guard = self.info.read().await;
        let info = guard
            .as_ref()
            .ok_or(TaskError::Malformed("task definition failed to load"))?;
        Ok(extract(info))
    }
}
