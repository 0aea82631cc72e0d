//! Instance identity and where it comes from.
//!
//! An identity is resolved once at startup and kept for the life of the
//! process. The source may not be ready yet when we first look (container
//! metadata files are written shortly after the container starts), so
//! resolution polls with a bounded number of attempts.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ElectionError;

/// Opaque, totally ordered identifier of one instance.
///
/// Ordering is plain lexicographic byte order on the string, which is what
/// every instance must agree on for the leader rule to be deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Something that can tell an instance who it is.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// Reads the identity, returning `Ok(None)` if it is not available yet.
    async fn read_identity(&self) -> Result<Option<Identity>, ElectionError>;
}

/// Metadata status value that marks a container metadata file as complete.
const METADATA_READY: &str = "READY";

/// Reads the identity from a local file.
///
/// With no `field` set, the trimmed file contents are the identity. With a
/// `field`, the file is parsed as a JSON object and that string field is
/// used; if the document has a `MetadataFileStatus` key, the identity is
/// only accepted once its value is `READY`.
#[derive(Debug, Clone)]
pub struct FileIdentitySource {
    path: PathBuf,
    field: Option<String>,
}

impl FileIdentitySource {
    /// Reads the whole file as the identity.
    pub fn plain(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            field: None,
        }
    }

    /// Reads one string field of a JSON metadata document.
    pub fn json_field(path: impl Into<PathBuf>, field: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            field: Some(field.into()),
        }
    }

    fn parse(&self, contents: &str) -> Result<Option<Identity>, ElectionError> {
        let Some(ref field) = self.field else {
            let trimmed = contents.trim();
            return Ok((!trimmed.is_empty()).then(|| Identity::new(trimmed)));
        };

        // a partially written file fails to parse; treat it as not ready
        let doc: serde_json::Value = match serde_json::from_str(contents) {
            Ok(v) => v,
            Err(e) => {
                debug!(path = %self.path.display(), "identity file not parseable yet: {e}");
                return Ok(None);
            }
        };

        let Some(obj) = doc.as_object() else {
            return Err(ElectionError::InvalidIdentity(format!(
                "{} is not a JSON object",
                self.path.display()
            )));
        };

        if let Some(status) = obj.get("MetadataFileStatus").and_then(|s| s.as_str()) {
            if status != METADATA_READY {
                debug!(status, "metadata file not ready");
                return Ok(None);
            }
        }

        match obj.get(field) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(s)) if s.is_empty() => Ok(None),
            Some(serde_json::Value::String(s)) => Ok(Some(Identity::new(s.clone()))),
            Some(other) => Err(ElectionError::InvalidIdentity(format!(
                "field '{field}' is not a string: {other}"
            ))),
        }
    }
}

#[async_trait]
impl IdentitySource for FileIdentitySource {
    async fn read_identity(&self) -> Result<Option<Identity>, ElectionError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => self.parse(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// A fixed identity, for callers that already know who they are.
#[async_trait]
impl IdentitySource for Identity {
    async fn read_identity(&self) -> Result<Option<Identity>, ElectionError> {
        Ok(Some(self.clone()))
    }
}

/// Polls `source` up to `attempts` times, `delay` apart.
///
/// Read errors other than "not there yet" count as a failed attempt too,
/// except for [`ElectionError::InvalidIdentity`], which will not fix
/// itself and is returned immediately.
pub async fn resolve_identity<S>(
    source: &S,
    attempts: u32,
    delay: Duration,
) -> Result<Identity, ElectionError>
where
    S: IdentitySource + ?Sized,
{
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match source.read_identity().await {
            Ok(Some(id)) => return Ok(id),
            Ok(None) => debug!(attempt, "identity not available yet"),
            Err(e @ ElectionError::InvalidIdentity(_)) => return Err(e),
            Err(e) => warn!(attempt, "failed to read identity: {e}"),
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    Err(ElectionError::IdentityUnavailable { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    struct Eventually {
        ready_after: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl IdentitySource for Eventually {
        async fn read_identity(&self) -> Result<Option<Identity>, ElectionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok((n >= self.ready_after).then(|| Identity::new("task-7")))
        }
    }

    #[test]
    fn identities_order_lexicographically() {
        let mut ids = vec![
            Identity::new("task-3"),
            Identity::new("task-1"),
            Identity::new("task-2"),
        ];
        ids.sort();
        assert_eq!(ids[0].as_str(), "task-1");
        // byte order, not numeric order
        assert!(Identity::new("task-10") < Identity::new("task-9"));
    }

    #[test]
    fn plain_file_is_trimmed() {
        let src = FileIdentitySource::plain("/unused");
        assert_eq!(
            src.parse("  arn:task/abc \n").unwrap(),
            Some(Identity::new("arn:task/abc"))
        );
        assert_eq!(src.parse("   \n").unwrap(), None);
    }

    #[test]
    fn json_field_waits_for_ready_status() {
        let src = FileIdentitySource::json_field("/unused", "TaskARN");
        let pending = r#"{"MetadataFileStatus":"PENDING","TaskARN":"arn:1"}"#;
        let ready = r#"{"MetadataFileStatus":"READY","TaskARN":"arn:1"}"#;
        assert_eq!(src.parse(pending).unwrap(), None);
        assert_eq!(src.parse(ready).unwrap(), Some(Identity::new("arn:1")));
    }

    #[test]
    fn json_field_without_status_key() {
        let src = FileIdentitySource::json_field("/unused", "TaskARN");
        assert_eq!(
            src.parse(r#"{"TaskARN":"arn:2"}"#).unwrap(),
            Some(Identity::new("arn:2"))
        );
        assert_eq!(src.parse(r#"{"Other":1}"#).unwrap(), None);
        // truncated write
        assert_eq!(src.parse(r#"{"TaskARN":"ar"#).unwrap(), None);
    }

    #[test]
    fn json_field_of_wrong_type_is_invalid() {
        let src = FileIdentitySource::json_field("/unused", "TaskARN");
        assert!(matches!(
            src.parse(r#"{"TaskARN":42}"#),
            Err(ElectionError::InvalidIdentity(_))
        ));
        assert!(matches!(
            src.parse("[1, 2]"),
            Err(ElectionError::InvalidIdentity(_))
        ));
    }

    #[tokio::test]
    async fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let src = FileIdentitySource::plain(dir.path().join("identity"));
        assert_eq!(src.read_identity().await.unwrap(), None);
    }

    #[tokio::test]
    async fn reads_identity_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity");
        std::fs::write(&path, "task-42\n").unwrap();
        let src = FileIdentitySource::plain(&path);
        assert_eq!(
            src.read_identity().await.unwrap(),
            Some(Identity::new("task-42"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_retries_until_available() {
        let src = Eventually {
            ready_after: 3,
            calls: AtomicU32::new(0),
        };
        let id = resolve_identity(&src, 5, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(id, Identity::new("task-7"));
        assert_eq!(src.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_gives_up_after_bounded_attempts() {
        let src = Eventually {
            ready_after: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let err = resolve_identity(&src, 4, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ElectionError::IdentityUnavailable { attempts: 4 }));
        assert!(err.is_fatal());
        assert_eq!(src.calls.load(Ordering::SeqCst), 4);
    }
}
