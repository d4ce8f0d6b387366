//! References to files living on a GenePattern server

use crate::session::{ServerSession, SessionError};
use serde::{Deserialize, Serialize};

/// An opaque reference to a server-side file (an uploaded input, a job
/// output or a log file), identified by its URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRef {
    uri: String,
}

impl FileRef {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The file's name: the last path segment of its URL
    pub fn name(&self) -> &str {
        self.uri
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.uri)
    }

    /// Authenticated GET of the file; the caller streams the response
    pub async fn open(&self, session: &ServerSession) -> Result<reqwest::Response, SessionError> {
        session.authed_get(&self.uri).await
    }

    /// Download the whole file; an empty body is reported as `None`
    pub async fn download(&self, session: &ServerSession) -> Result<Option<Vec<u8>>, SessionError> {
        let response = self.open(session).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SessionError::Rejected {
                status: status.as_u16(),
                context: "file download",
            });
        }
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            Ok(None)
        } else {
            Ok(Some(bytes.to_vec()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_is_last_path_segment() {
        let file = FileRef::new("https://example.org/gp/jobResults/42/all_aml_test.cvt.gct");
        assert_eq!(file.name(), "all_aml_test.cvt.gct");
    }

    #[test]
    fn test_name_tolerates_trailing_slash() {
        let file = FileRef::new("https://example.org/gp/jobResults/42/");
        assert_eq!(file.name(), "42");
    }
}
