//! File-backed agent directory
//!
//! One JSON file per agent under the directory root, named `<agent_id>.json`.
//! Each process writes only its own file; readers prune files whose pid is
//! gone.

use crate::error::{ParleyError, Result};
use crate::storage::{ensure_dir, read_json, remove_file, write_json_atomic};
use crate::types::{now_millis, ActiveTransport, AgentRecord, AgentStatus};
use parking_lot::{const_mutex, Mutex};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Whether a process with `pid` exists
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Serializes record writes within this process
///
/// Only the owning process writes a record, so read-modify-write cycles on it
/// cannot interleave once they share this lock.
static RECORD_WRITES: Mutex<()> = const_mutex(());

/// Registry of running agents
#[derive(Debug, Clone)]
pub struct AgentDirectory {
    dir: PathBuf,
}

impl AgentDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, agent_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", agent_id))
    }

    /// Write (or overwrite) a record
    pub fn register(&self, record: &AgentRecord) -> Result<()> {
        ensure_dir(&self.dir)?;
        let _guard = RECORD_WRITES.lock();
        write_json_atomic(&self.record_path(&record.agent_id), record)?;
        tracing::debug!(agent_id = %record.agent_id, status = ?record.status, "agent registered");
        Ok(())
    }

    /// Remove a record
    pub fn unregister(&self, agent_id: &str) -> Result<()> {
        remove_file(&self.record_path(agent_id))?;
        tracing::info!(agent_id = %agent_id, "agent unregistered");
        Ok(())
    }

    /// A live record by id
    pub fn get(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        let path = self.record_path(agent_id);
        match read_json::<AgentRecord>(&path)? {
            Some(record) if pid_alive(record.pid) => Ok(Some(record)),
            Some(record) => {
                self.prune(&path, &record);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// All live records, sorted by id
    ///
    /// Records with a dead pid are deleted as a side effect.
    pub fn list(&self) -> Result<Vec<AgentRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut live: HashMap<String, AgentRecord> = HashMap::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            // skips in-flight `.tmp` writes too
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let record = match read_json::<AgentRecord>(&path) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable agent record");
                    continue;
                }
            };

            if !pid_alive(record.pid) {
                self.prune(&path, &record);
                continue;
            }

            match live.get(&record.agent_id) {
                Some(existing) if existing.updated_at >= record.updated_at => {}
                _ => {
                    live.insert(record.agent_id.clone(), record);
                }
            }
        }

        let mut records: Vec<AgentRecord> = live.into_values().collect();
        records.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(records)
    }

    /// Live records of one agent type
    pub fn live_of_type(&self, agent_type: &str) -> Result<Vec<AgentRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.agent_type == agent_type)
            .collect())
    }

    pub fn update_status(&self, agent_id: &str, status: AgentStatus) -> Result<AgentRecord> {
        self.modify(agent_id, |record| record.status = status)
    }

    pub fn set_active_transport(
        &self,
        agent_id: &str,
        transport: Option<ActiveTransport>,
    ) -> Result<AgentRecord> {
        self.modify(agent_id, |record| record.active_transport = transport)
    }

    pub fn set_display_name(&self, agent_id: &str, name: Option<String>) -> Result<AgentRecord> {
        self.modify(agent_id, |record| record.display_name = name)
    }

    fn modify(&self, agent_id: &str, apply: impl FnOnce(&mut AgentRecord)) -> Result<AgentRecord> {
        let path = self.record_path(agent_id);
        let _guard = RECORD_WRITES.lock();
        let mut record = read_json::<AgentRecord>(&path)?.ok_or_else(|| ParleyError::TargetNotFound {
            target: agent_id.to_string(),
            candidates: Vec::new(),
        })?;
        apply(&mut record);
        record.updated_at = now_millis();
        write_json_atomic(&path, &record)?;
        Ok(record)
    }

    fn prune(&self, path: &Path, record: &AgentRecord) {
        tracing::warn!(agent_id = %record.agent_id, pid = record.pid, "pruning stale agent record");
        if let Err(e) = remove_file(path) {
            tracing::debug!(error = %e, "failed to prune stale record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    /// A pid that is very unlikely to exist
    const DEAD_PID: u32 = 99_999_999;

    fn live_record(agent_type: &str, port: u16) -> AgentRecord {
        let mut record = AgentRecord::new(agent_type, port, std::process::id(), PathBuf::from("/tmp"));
        record.agent_id = format!("{}-{}", agent_type, port);
        record
    }

    #[test]
    fn test_pid_alive() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(0));
        assert!(!pid_alive(DEAD_PID));
    }

    #[test]
    fn test_register_get_unregister() {
        let dir = TempDir::new().unwrap();
        let directory = AgentDirectory::new(dir.path().join("agents"));
        let record = live_record("claude", 8120);

        directory.register(&record).unwrap();
        assert_eq!(directory.get(&record.agent_id).unwrap(), Some(record.clone()));

        directory.unregister(&record.agent_id).unwrap();
        assert!(directory.get(&record.agent_id).unwrap().is_none());
        // second unregister is harmless
        directory.unregister(&record.agent_id).unwrap();
    }

    #[test]
    fn test_stale_records_pruned() {
        let dir = TempDir::new().unwrap();
        let directory = AgentDirectory::new(dir.path());
        let live = live_record("codex", 8120);
        let mut dead = live_record("codex", 8121);
        dead.pid = DEAD_PID;

        directory.register(&live).unwrap();
        directory.register(&dead).unwrap();

        let listed = directory.list().unwrap();
        assert_eq!(listed, vec![live]);
        assert!(!dir.path().join("codex-8121.json").exists());
    }

    #[test]
    fn test_list_ignores_temp_and_garbage() {
        let dir = TempDir::new().unwrap();
        let directory = AgentDirectory::new(dir.path());
        fs::write(dir.path().join("half.json.123.tmp"), "{").unwrap();
        fs::write(dir.path().join("broken.json"), "not json").unwrap();
        assert!(directory.list().unwrap().is_empty());
    }

    #[test]
    fn test_missing_dir_lists_empty() {
        let dir = TempDir::new().unwrap();
        let directory = AgentDirectory::new(dir.path().join("never-created"));
        assert!(directory.list().unwrap().is_empty());
    }

    #[test]
    fn test_updates() {
        let dir = TempDir::new().unwrap();
        let directory = AgentDirectory::new(dir.path());
        let record = live_record("gemini", 9000);
        directory.register(&record).unwrap();

        directory.update_status(&record.agent_id, AgentStatus::Ready).unwrap();
        directory
            .set_display_name(&record.agent_id, Some("researcher".into()))
            .unwrap();
        let updated = directory.get(&record.agent_id).unwrap().unwrap();
        assert_eq!(updated.status, AgentStatus::Ready);
        assert_eq!(updated.display_name.as_deref(), Some("researcher"));

        assert_eq!(directory.live_of_type("gemini").unwrap().len(), 1);
        assert!(directory.live_of_type("claude").unwrap().is_empty());
        assert!(directory.update_status("missing-1", AgentStatus::Done).is_err());
    }

    #[test]
    fn test_concurrent_status_and_transport_updates() {
        use crate::types::TransferDirection;
        use std::sync::Arc;

        let dir = TempDir::new().unwrap();
        let directory = Arc::new(AgentDirectory::new(dir.path()));
        let record = live_record("claude", 8110);
        directory.register(&record).unwrap();

        let status_writer = {
            let directory = directory.clone();
            let id = record.agent_id.clone();
            std::thread::spawn(move || {
                (0..150)
                    .filter(|_| directory.update_status(&id, AgentStatus::Waiting).is_err())
                    .count()
            })
        };
        let transport_writer = {
            let directory = directory.clone();
            let id = record.agent_id.clone();
            std::thread::spawn(move || {
                (0..150)
                    .filter(|_| {
                        let transport = ActiveTransport {
                            direction: TransferDirection::Sending,
                            peer: "codex-8120".into(),
                            transport: "socket".into(),
                            started_at: now_millis(),
                        };
                        directory.set_active_transport(&id, Some(transport)).is_err()
                    })
                    .count()
            })
        };

        assert_eq!(status_writer.join().unwrap(), 0);
        assert_eq!(transport_writer.join().unwrap(), 0);

        // neither writer's last update was overwritten by the other
        let settled = directory.get(&record.agent_id).unwrap().unwrap();
        assert_eq!(settled.status, AgentStatus::Waiting);
        assert_eq!(settled.active_transport.unwrap().peer, "codex-8120");
    }
}
