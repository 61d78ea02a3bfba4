//! Target resolution against the live agent directory

use crate::error::{ParleyError, Result};
use crate::types::AgentRecord;

/// Pick the one live record `target` names
///
/// Order: exact agent id, then `type-port`, then display name, then bare
/// type when exactly one live agent has it.
pub fn resolve_target(target: &str, live: &[AgentRecord]) -> Result<AgentRecord> {
    let target = target.trim().trim_start_matches('@');

    if let Some(record) = live.iter().find(|r| r.agent_id == target) {
        return Ok(record.clone());
    }
    if let Some(record) = live.iter().find(|r| r.port_alias() == target) {
        return Ok(record.clone());
    }
    if let Some(record) = live
        .iter()
        .find(|r| r.display_name.as_deref() == Some(target))
    {
        return Ok(record.clone());
    }

    let of_type: Vec<&AgentRecord> = live.iter().filter(|r| r.agent_type == target).collect();
    match of_type.as_slice() {
        [only] => Ok((*only).clone()),
        [] => Err(ParleyError::TargetNotFound {
            target: target.to_string(),
            candidates: candidates(live.iter()),
        }),
        many => Err(ParleyError::AmbiguousTarget {
            target: target.to_string(),
            candidates: candidates(many.iter().copied()),
        }),
    }
}

/// `type-port` aliases, which are what a human types
fn candidates<'a>(records: impl Iterator<Item = &'a AgentRecord>) -> Vec<String> {
    let mut names: Vec<String> = records.map(|r| r.port_alias()).collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn record(agent_type: &str, port: u16) -> AgentRecord {
        AgentRecord::new(agent_type, port, 100 + port as u32, PathBuf::from("/work"))
    }

    #[test]
    fn test_exact_id_and_port_alias() {
        let live = vec![record("codex", 8120), record("codex", 8121)];
        let by_id = resolve_target(&live[1].agent_id, &live).unwrap();
        assert_eq!(by_id.port, 8121);
        let by_alias = resolve_target("codex-8120", &live).unwrap();
        assert_eq!(by_alias.port, 8120);
    }

    #[test]
    fn test_bare_type_ambiguous() {
        let live = vec![record("codex", 8120), record("codex", 8121), record("claude", 8130)];
        match resolve_target("codex", &live) {
            Err(ParleyError::AmbiguousTarget { candidates, .. }) => {
                assert_eq!(candidates, vec!["codex-8120".to_string(), "codex-8121".to_string()]);
            }
            other => panic!("expected ambiguity, got {:?}", other),
        }
    }

    #[test]
    fn test_bare_type_unique() {
        let live = vec![record("codex", 8120), record("claude", 8130)];
        assert_eq!(resolve_target("@claude", &live).unwrap().port, 8130);
    }

    #[test]
    fn test_not_found_lists_live_agents() {
        let live = vec![record("claude", 8130)];
        match resolve_target("gemini", &live) {
            Err(ParleyError::TargetNotFound { candidates, .. }) => {
                assert_eq!(candidates, vec!["claude-8130".to_string()]);
            }
            other => panic!("expected not found, got {:?}", other),
        }
    }

    #[test]
    fn test_display_name() {
        let mut reviewer = record("claude", 8130);
        reviewer.display_name = Some("reviewer".into());
        let live = vec![reviewer, record("claude", 8131)];
        assert_eq!(resolve_target("reviewer", &live).unwrap().port, 8130);
    }
}
