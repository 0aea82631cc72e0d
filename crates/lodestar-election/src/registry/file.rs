//! A registry backed by a plain text file.
//!
//! Each non-empty line is `<group> <identity>`; `#` starts a comment.
//! Instances register by appending a line and deregister by removing it.
//! Useful on a single host or a shared volume, and in tests.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{MemberFilter, MembershipSource};
use crate::{ElectionError, Identity};

/// Polling settings for [`FileRegistry::wait_for_change`].
#[derive(Debug, Clone, Copy)]
pub struct FileRegistryConfig {
    /// How often the file is re-read while waiting.
    pub poll_interval: Duration,
    /// How long to wait before giving up with `WaitTimedOut`.
    pub wait_timeout: Duration,
}

impl Default for FileRegistryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(6),
            wait_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileRegistry {
    path: PathBuf,
    config: FileRegistryConfig,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>, config: FileRegistryConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every `(group, identity)` entry currently in the file. A missing
    /// file is an empty registry.
    async fn entries(&self) -> Result<Vec<(String, Identity)>, ElectionError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ElectionError::Membership(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                )))
            }
        };
        Ok(parse_entries(&contents))
    }
}

fn parse_entries(contents: &str) -> Vec<(String, Identity)> {
    contents
        .lines()
        .filter_map(|line| {
            let line = line.split('#').next().unwrap_or("").trim();
            let mut parts = line.split_whitespace();
            let group = parts.next()?;
            let id = parts.next()?;
            Some((group.to_owned(), Identity::new(id)))
        })
        .collect()
}

#[async_trait]
impl MembershipSource for FileRegistry {
    async fn list_members(&self, filter: &MemberFilter) -> Result<Vec<Identity>, ElectionError> {
        let ids: Vec<Identity> = self
            .entries()
            .await?
            .into_iter()
            .filter(|(group, _)| filter.group.as_deref().map_or(true, |g| g == group.as_str()))
            .map(|(_, id)| id)
            .take(filter.max_results)
            .collect();
        trace!(count = ids.len(), "listed registry members");
        Ok(ids)
    }

    async fn wait_for_change(&self, watched: &[Identity]) -> Result<(), ElectionError> {
        let deadline = Instant::now() + self.config.wait_timeout;
        loop {
            let present: HashSet<Identity> =
                self.entries().await?.into_iter().map(|(_, id)| id).collect();
            if let Some(gone) = watched.iter().find(|id| !present.contains(*id)) {
                debug!(identity = %gone, "member left the registry");
                return Ok(());
            }
            if Instant::now() + self.config.poll_interval > deadline {
                return Err(ElectionError::WaitTimedOut);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}
