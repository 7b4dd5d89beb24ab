//! Authoritative developer files and aggregated user submissions.
//!
//! Both sections are written only by the processing loop. Readers (the
//! handshake, observability) take a short read lock to copy what they need.

use indexmap::IndexMap;
use tokio::sync::{RwLock, RwLockReadGuard};

use crate::protocol::{ConnectionId, Packet, Submissions};

#[derive(Debug, Default)]
pub struct SharedCodeStore {
    /// Developer files, `path → text`, in first-publication order.
    developer_files: RwLock<IndexMap<String, String>>,
    /// User code, `path → connection → lines`.
    user_submissions: RwLock<Submissions>,
}

impl SharedCodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last write wins; a path keeps its original position.
    pub(crate) async fn set_developer_file(&self, path: &str, text: &str) {
        let mut files = self.developer_files.write().await;
        match files.get_mut(path) {
            Some(existing) => text.clone_into(existing),
            None => {
                files.insert(path.to_owned(), text.to_owned());
            }
        }
    }

    /// Replace one connection's submission for `path`.
    pub(crate) async fn set_user_submission(
        &self,
        path: &str,
        connection: ConnectionId,
        lines: Vec<String>,
    ) {
        let mut submissions = self.user_submissions.write().await;
        submissions
            .entry(path.to_owned())
            .or_default()
            .insert(connection, lines);
    }

    /// Hold the developer files while a new user is admitted.
    pub(crate) async fn read_developer_files(&self) -> RwLockReadGuard<'_, IndexMap<String, String>> {
        self.developer_files.read().await
    }

    /// Hold the submissions while a new developer is admitted.
    pub(crate) async fn read_user_submissions(&self) -> RwLockReadGuard<'_, Submissions> {
        self.user_submissions.read().await
    }

    pub async fn developer_file(&self, path: &str) -> Option<String> {
        self.developer_files.read().await.get(path).cloned()
    }

    pub async fn developer_files(&self) -> Vec<(String, String)> {
        self.developer_files
            .read()
            .await
            .iter()
            .map(|(path, text)| (path.clone(), text.clone()))
            .collect()
    }

    pub async fn user_submissions(&self) -> Submissions {
        self.user_submissions.read().await.clone()
    }

    /// Full snapshot packet of the current submissions.
    pub async fn complete_snapshot(&self) -> Packet {
        Packet::complete_snapshot(self.user_submissions().await)
    }

    pub async fn file_count(&self) -> usize {
        self.developer_files.read().await.len()
    }
}

/// One `DeveloperUpdate` per file, in store order.
pub(crate) fn developer_file_packets(files: &IndexMap<String, String>) -> Vec<Packet> {
    files
        .iter()
        .map(|(path, text)| Packet::developer_update(path.as_str(), text.as_str()))
        .collect()
}
