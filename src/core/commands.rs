// src/core/commands.rs

//! CRM command queue (spec §4.7): an append-only list of admin commands
//! stored in cluster KV, parsed and attached to the named service's `sd.cmd`
//! (or applied directly to node maintenance requests).

use crate::core::config_model::ServiceId;
use crate::core::manager_status::PendingCommand;
use tracing::warn;

/// One parsed line from the `crm_commands` queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrmCommand {
    Migrate { sid: ServiceId, target: String },
    Relocate { sid: ServiceId, target: String },
    Stop { sid: ServiceId, timeout_secs: u64 },
    EnableNodeMaintenance { node: String },
    DisableNodeMaintenance { node: String },
}

/// Parses the newline-separated `crm_commands` document, dropping and
/// logging unknown or malformed lines rather than failing the whole batch.
pub fn parse_commands(text: &str) -> Vec<CrmCommand> {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_line(line) {
            Some(cmd) => out.push(cmd),
            None => warn!(line, "dropping unknown or malformed CRM command"),
        }
    }
    out
}

fn parse_line(line: &str) -> Option<CrmCommand> {
    let mut parts = line.split_whitespace();
    let verb = parts.next()?;
    match verb {
        "migrate" => {
            let sid = ServiceId::parse(parts.next()?).ok()?;
            let target = parts.next()?.to_string();
            Some(CrmCommand::Migrate { sid, target })
        }
        "relocate" => {
            let sid = ServiceId::parse(parts.next()?).ok()?;
            let target = parts.next()?.to_string();
            Some(CrmCommand::Relocate { sid, target })
        }
        "stop" => {
            let sid = ServiceId::parse(parts.next()?).ok()?;
            let timeout_secs = parts.next()?.parse().ok()?;
            Some(CrmCommand::Stop { sid, timeout_secs })
        }
        "enable-node-maintenance" => Some(CrmCommand::EnableNodeMaintenance {
            node: parts.next()?.to_string(),
        }),
        "disable-node-maintenance" => Some(CrmCommand::DisableNodeMaintenance {
            node: parts.next()?.to_string(),
        }),
        _ => None,
    }
}

impl CrmCommand {
    /// The service this command targets, if any (node-maintenance commands
    /// apply elsewhere, directly to `ManagerStatus::node_request`).
    pub fn service_id(&self) -> Option<&ServiceId> {
        match self {
            CrmCommand::Migrate { sid, .. }
            | CrmCommand::Relocate { sid, .. }
            | CrmCommand::Stop { sid, .. } => Some(sid),
            CrmCommand::EnableNodeMaintenance { .. }
            | CrmCommand::DisableNodeMaintenance { .. } => None,
        }
    }

    pub fn into_pending(self) -> Option<PendingCommand> {
        match self {
            CrmCommand::Migrate { target, .. } => Some(PendingCommand::Migrate { target }),
            CrmCommand::Relocate { target, .. } => Some(PendingCommand::Relocate { target }),
            CrmCommand::Stop { timeout_secs, .. } => Some(PendingCommand::Stop { timeout_secs }),
            CrmCommand::EnableNodeMaintenance { .. }
            | CrmCommand::DisableNodeMaintenance { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_known_verbs() {
        let text = "migrate vm:100 n2\nrelocate ct:200 n3\nstop vm:100 30\nenable-node-maintenance n1\ndisable-node-maintenance n1\n";
        let cmds = parse_commands(text);
        assert_eq!(cmds.len(), 5);
        assert_eq!(
            cmds[0],
            CrmCommand::Migrate {
                sid: ServiceId::new("vm", "100"),
                target: "n2".to_string()
            }
        );
        assert_eq!(
            cmds[2],
            CrmCommand::Stop {
                sid: ServiceId::new("vm", "100"),
                timeout_secs: 30
            }
        );
    }

    #[test]
    fn drops_malformed_and_unknown_lines() {
        let text = "migrate badformat\nbogus-verb n1\nmigrate vm:100\n";
        assert!(parse_commands(text).is_empty());
    }

    #[test]
    fn idempotent_migrate_is_just_a_parse_not_a_dedup() {
        // Command idempotence (spec §8 property 8) is enforced by the state
        // machine comparing target == sd.node, not by the parser.
        let text = "migrate vm:100 n1\nmigrate vm:100 n1\n";
        assert_eq!(parse_commands(text).len(), 2);
    }
}
