//! Reply tracker
//!
//! Remembers, for the agent that received a message, who is owed a reply.
//! The in-memory list is mirrored to `<replies_dir>/<agent_id>.json` on every
//! change, under the same lock, so a restarted process (or a helper process
//! that shares the agent id) still finds the pending sender.

use crate::error::{ParleyError, Result};
use crate::storage::{read_json, write_json_atomic};
use crate::types::{now_millis, SenderInfo};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable carrying the receiving agent's id into the wrapped process
pub const AGENT_ID_ENV: &str = "PARLEY_AGENT_ID";

/// Somebody waiting on an answer from this agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTarget {
    pub sender: SenderInfo,
    /// Placeholder task on the sender's store
    #[serde(default)]
    pub sender_task_id: Option<String>,
    /// Our own task for the inbound message
    pub task_id: String,
    pub recorded_at: i64,
}

impl ReplyTarget {
    pub fn new(sender: SenderInfo, sender_task_id: Option<String>, task_id: String) -> Self {
        Self {
            sender,
            sender_task_id,
            task_id,
            recorded_at: now_millis(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Mirror {
    agent_id: String,
    targets: Vec<ReplyTarget>,
}

/// Pending reply targets for one receiving agent
pub struct ReplyTracker {
    agent_id: String,
    path: PathBuf,
    retention: Duration,
    targets: Mutex<Vec<ReplyTarget>>,
}

impl ReplyTracker {
    /// Open the tracker for `agent_id`, recovering anything the mirror holds
    pub fn open(replies_dir: &Path, agent_id: &str, retention: Duration) -> Result<Self> {
        let path = replies_dir.join(format!("{}.json", agent_id));
        let tracker = Self {
            agent_id: agent_id.to_string(),
            path,
            retention,
            targets: Mutex::new(Vec::new()),
        };
        {
            let mut targets = tracker.targets.lock();
            *targets = tracker.load_mirror()?;
            if tracker.prune(&mut targets) {
                tracker.save(&targets)?;
            }
            if !targets.is_empty() {
                tracing::info!(
                    agent_id = %agent_id,
                    pending = targets.len(),
                    "recovered pending reply targets"
                );
            }
        }
        Ok(tracker)
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Remember that `target.sender` is owed a reply
    pub fn record(&self, target: ReplyTarget) -> Result<()> {
        let mut targets = self.targets.lock();
        targets.retain(|t| {
            !(t.sender.id == target.sender.id && t.sender_task_id == target.sender_task_id)
        });
        tracing::debug!(
            sender = %target.sender.id,
            sender_task_id = ?target.sender_task_id,
            "reply target recorded"
        );
        targets.push(target);
        self.prune(&mut targets);
        self.save(&targets)
    }

    /// Pending targets, newest first
    pub fn pending(&self) -> Result<Vec<ReplyTarget>> {
        let mut targets = self.targets.lock();
        if self.prune(&mut targets) {
            self.save(&targets)?;
        }
        let mut pending = targets.clone();
        pending.reverse();
        Ok(pending)
    }

    /// Remove and return the target a reply should go to
    ///
    /// `sender` picks a specific pending sender by id, type-port alias or
    /// type; otherwise the most recent target wins.
    pub fn take(&self, sender: Option<&str>) -> Result<ReplyTarget> {
        let mut targets = self.targets.lock();
        self.prune(&mut targets);

        let mut index = find(&targets, sender);
        if index.is_none() {
            // another process sharing our id may have written the mirror
            let on_disk = self.load_mirror()?;
            for target in on_disk {
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
            targets.sort_by_key(|t| t.recorded_at);
            self.prune(&mut targets);
            index = find(&targets, sender);
        }

        let Some(index) = index else {
            let reason = match sender {
                Some(name) => format!("{} has no pending reply for '{}'", self.agent_id, name),
                None => format!("{} has no pending reply targets", self.agent_id),
            };
            return Err(ParleyError::NoReplyTarget(reason));
        };

        let target = targets.remove(index);
        self.save(&targets)?;
        Ok(target)
    }

    fn load_mirror(&self) -> Result<Vec<ReplyTarget>> {
        Ok(read_json::<Mirror>(&self.path)?
            .map(|m| m.targets)
            .unwrap_or_default())
    }

    fn save(&self, targets: &[ReplyTarget]) -> Result<()> {
        write_json_atomic(
            &self.path,
            &Mirror {
                agent_id: self.agent_id.clone(),
                targets: targets.to_vec(),
            },
        )
    }

    /// Drop expired entries; true if anything was removed
    fn prune(&self, targets: &mut Vec<ReplyTarget>) -> bool {
        let cutoff = now_millis() - self.retention.as_millis() as i64;
        let before = targets.len();
        targets.retain(|t| t.recorded_at >= cutoff);
        targets.len() != before
    }
}

/// Newest matching target
fn find(targets: &[ReplyTarget], sender: Option<&str>) -> Option<usize> {
    targets.iter().rposition(|t| match sender {
        None => true,
        Some(name) => {
            t.sender.id == name
                || t.sender.agent_type == name
                || t.sender
                    .endpoint
                    .as_deref()
                    .and_then(|e| e.rsplit(':').next())
                    .map(|port| format!("{}-{}", t.sender.agent_type, port) == name)
                    .unwrap_or(false)
        }
    })
}

/// The id of the agent this process acts for, from the environment
///
/// A missing id means a reply cannot be correlated; this is logged loudly
/// rather than guessed.
pub fn identity_from_env() -> Result<String> {
    match std::env::var(AGENT_ID_ENV) {
        Ok(id) if !id.trim().is_empty() => Ok(id),
        _ => {
            tracing::warn!(
                var = AGENT_ID_ENV,
                "agent identity unavailable, cannot correlate reply"
            );
            Err(ParleyError::NoReplyTarget(format!(
                "{} is not set; run the reply from inside a parley session",
                AGENT_ID_ENV
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sender(id: &str, agent_type: &str, port: u16) -> SenderInfo {
        SenderInfo {
            id: id.to_string(),
            agent_type: agent_type.to_string(),
            endpoint: Some(format!("http://127.0.0.1:{}", port)),
            socket_path: None,
        }
    }

    fn tracker(dir: &TempDir) -> ReplyTracker {
        ReplyTracker::open(dir.path(), "codex-1a2b3c4d", Duration::from_secs(3600)).unwrap()
    }

    #[test]
    fn test_most_recent_wins() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        tracker
            .record(ReplyTarget::new(sender("claude-aaaa0000", "claude", 8120), Some("ta".into()), "t1".into()))
            .unwrap();
        tracker
            .record(ReplyTarget::new(sender("gemini-bbbb0000", "gemini", 8130), Some("tb".into()), "t2".into()))
            .unwrap();

        let target = tracker.take(None).unwrap();
        assert_eq!(target.sender.id, "gemini-bbbb0000");
        assert_eq!(tracker.pending().unwrap().len(), 1);
    }

    #[test]
    fn test_explicit_sender_override() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        tracker
            .record(ReplyTarget::new(sender("claude-aaaa0000", "claude", 8120), Some("ta".into()), "t1".into()))
            .unwrap();
        tracker
            .record(ReplyTarget::new(sender("gemini-bbbb0000", "gemini", 8130), Some("tb".into()), "t2".into()))
            .unwrap();

        let target = tracker.take(Some("claude-8120")).unwrap();
        assert_eq!(target.sender_task_id.as_deref(), Some("ta"));
        assert!(tracker.take(Some("claude")).is_err());
    }

    #[test]
    fn test_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let tracker = tracker(&dir);
            tracker
                .record(ReplyTarget::new(sender("claude-aaaa0000", "claude", 8120), Some("ta".into()), "t1".into()))
                .unwrap();
        }
        let reopened = tracker(&dir);
        let target = reopened.take(None).unwrap();
        assert_eq!(target.sender.id, "claude-aaaa0000");
        assert_eq!(target.sender_task_id.as_deref(), Some("ta"));
    }

    #[test]
    fn test_expired_targets_dropped() {
        let dir = TempDir::new().unwrap();
        let tracker = ReplyTracker::open(dir.path(), "x-1", Duration::from_secs(60)).unwrap();
        let mut old = ReplyTarget::new(sender("claude-aaaa0000", "claude", 8120), None, "t1".into());
        old.recorded_at -= 120_000;
        tracker.record(old).unwrap();
        assert!(tracker.pending().unwrap().is_empty());
        assert!(matches!(tracker.take(None), Err(ParleyError::NoReplyTarget(_))));
    }

    #[test]
    fn test_take_sees_entries_written_by_another_handle() {
        let dir = TempDir::new().unwrap();
        let first = tracker(&dir);
        let second = tracker(&dir);
        first
            .record(ReplyTarget::new(sender("claude-aaaa0000", "claude", 8120), Some("ta".into()), "t1".into()))
            .unwrap();
        let target = second.take(None).unwrap();
        assert_eq!(target.task_id, "t1");
    }
}
