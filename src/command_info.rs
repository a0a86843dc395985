//! C3: the command-info registry.
//!
//! Built once from externally supplied metadata records (spec §4.3); this
//! crate never ships its own table of Redis command semantics, since that
//! registry's *contents* are explicitly out of scope (spec §1).

use std::collections::HashMap;

use crate::resp::Request;

/// Routing metadata for one command.
#[derive(Debug, Clone)]
pub struct CommandInfo {
    /// Zero-based argument positions that hold routing keys.
    pub key_positions: Vec<usize>,
    pub read_only: bool,
}

/// Looked up by lowercased command name. Implementations must be read-only
/// from this crate's perspective — it only ever calls `lookup`.
pub trait CommandInfoProvider: Send + Sync {
    fn lookup(&self, name_lowercase: &str) -> Option<CommandInfo>;
}

/// A simple in-memory table, built once at startup from the caller's
/// metadata source.
#[derive(Debug, Default)]
pub struct CommandInfoTable {
    entries: HashMap<String, CommandInfo>,
}

impl CommandInfoTable {
    pub fn new(records: impl IntoIterator<Item = (String, CommandInfo)>) -> Self {
        CommandInfoTable {
            entries: records.into_iter().collect(),
        }
    }
}

impl CommandInfoProvider for CommandInfoTable {
    fn lookup(&self, name_lowercase: &str) -> Option<CommandInfo> {
        self.entries.get(name_lowercase).cloned()
    }
}

/// `None` means "cannot route" (unknown command); callers treat that as
/// `UnsupportedCommand` (spec §4.3).
pub fn keys_for_request(provider: &dyn CommandInfoProvider, request: &Request) -> Option<Vec<Vec<u8>>> {
    let name = request.name_lowercase()?;
    let info = provider.lookup(&name)?;
    Some(
        info.key_positions
            .iter()
            .filter_map(|&pos| request.arg(pos).map(|bytes| bytes.to_vec()))
            .collect(),
    )
}

/// Defaults to `false` for unknown commands (spec §4.3).
pub fn is_read_only(provider: &dyn CommandInfoProvider, request: &Request) -> bool {
    request
        .name_lowercase()
        .and_then(|name| provider.lookup(&name))
        .map(|info| info.read_only)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CommandInfoTable {
        CommandInfoTable::new([
            (
                "get".to_string(),
                CommandInfo {
                    key_positions: vec![1],
                    read_only: true,
                },
            ),
            (
                "mset".to_string(),
                CommandInfo {
                    key_positions: vec![1, 3],
                    read_only: false,
                },
            ),
        ])
    }

    #[test]
    fn unknown_command_has_no_keys() {
        let info = table();
        let request = Request::from_strs(["FLUSHALL"]);
        assert_eq!(keys_for_request(&info, &request), None);
    }

    #[test]
    fn known_command_extracts_key_positions() {
        let info = table();
        let request = Request::from_strs(["MSET", "a", "1", "b", "2"]);
        assert_eq!(keys_for_request(&info, &request), Some(vec![b"a".to_vec(), b"b".to_vec()]));
    }

    #[test]
    fn read_only_defaults_false_for_unknown_command() {
        let info = table();
        let request = Request::from_strs(["FLUSHALL"]);
        assert!(!is_read_only(&info, &request));
    }
}
