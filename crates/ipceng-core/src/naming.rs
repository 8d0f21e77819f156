//! System object names derived from logical names.
//!
//! Two engines running in different processes never exchange queue names.
//! Each derives them from its own logical name and the peer's, and the
//! derivation is arranged so that one side's outbound queue is the other
//! side's inbound queue:
//!
//! ```text
//! engine "A", peer "B":  outbound /A2B.mq   inbound /B2A.mq
//! engine "B", peer "A":  outbound /B2A.mq   inbound /A2B.mq
//! ```
//!
//! The separator is a bare `2` so that peers written against the same
//! naming convention interoperate. For a fixed local name the mapping from
//! peer to queue is one-to-one, but across local names it is not: engine
//! `"a2"` talking to `"b"` and engine `"a"` talking to `"2b"` both write
//! `/a22b.mq`. Only names containing `2` can clash this way, and nothing
//! here detects it.
//!
//! Region names are global (`/<name>.shm`) so engines cooperate simply by
//! agreeing on the logical name.

use crate::error::{IpcError, Result};

const PREFIX: &str = "/";
const QUEUE_SEPARATOR: &str = "2";
const QUEUE_SUFFIX: &str = ".mq";
const REGION_SUFFIX: &str = ".shm";

/// Longest object name the host accepts, not counting the leading slash.
pub const MAX_OBJECT_NAME_LEN: usize = 255;

/// Check that `name` can be embedded in a system object name.
pub fn validate_logical_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("name is empty")
    } else if name.contains('/') {
        Some("name contains '/'")
    } else if name.contains('\0') {
        Some("name contains NUL")
    } else if name.chars().any(char::is_control) {
        Some("name contains control characters")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(IpcError::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Queue written by `local` and read by `peer`.
pub fn outbound_queue_name(local: &str, peer: &str) -> Result<String> {
    validate_logical_name(local)?;
    validate_logical_name(peer)?;
    checked_length(format!(
        "{}{}{}{}{}",
        PREFIX, local, QUEUE_SEPARATOR, peer, QUEUE_SUFFIX
    ))
}

/// Queue written by `peer` and read by `local`.
pub fn inbound_queue_name(local: &str, peer: &str) -> Result<String> {
    outbound_queue_name(peer, local)
}

/// Shared memory object backing the region `name`.
pub fn region_name(name: &str) -> Result<String> {
    validate_logical_name(name)?;
    checked_length(format!("{}{}{}", PREFIX, name, REGION_SUFFIX))
}

fn checked_length(object_name: String) -> Result<String> {
    let len = object_name.len() - PREFIX.len();
    if len > MAX_OBJECT_NAME_LEN {
        return Err(IpcError::NameTooLong {
            name: object_name,
            len,
            max: MAX_OBJECT_NAME_LEN,
        });
    }
    Ok(object_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_names_match_convention() {
        assert_eq!(outbound_queue_name("eng1", "eng2").unwrap(), "/eng12eng2.mq");
        assert_eq!(inbound_queue_name("eng1", "eng2").unwrap(), "/eng22eng1.mq");
    }

    #[test]
    fn test_naming_symmetry() {
        let pairs = [("A", "B"), ("eng1", "eng2"), ("client", "server-01"), ("x", "x.y")];
        for (a, b) in pairs {
            assert_eq!(
                outbound_queue_name(a, b).unwrap(),
                inbound_queue_name(b, a).unwrap()
            );
            assert_eq!(
                inbound_queue_name(a, b).unwrap(),
                outbound_queue_name(b, a).unwrap()
            );
        }
    }

    #[test]
    fn test_peer_names_distinct_for_fixed_local() {
        let peers = ["B", "C", "BC", "B.mq", "2B"];
        let names: std::collections::HashSet<_> = peers
            .iter()
            .map(|peer| outbound_queue_name("A", peer).unwrap())
            .collect();
        assert_eq!(names.len(), peers.len());
    }

    #[test]
    fn test_separator_in_names_can_clash_across_locals() {
        assert_eq!(
            outbound_queue_name("a2", "b").unwrap(),
            outbound_queue_name("a", "2b").unwrap()
        );
    }

    #[test]
    fn test_region_name_is_global() {
        assert_eq!(region_name("shared").unwrap(), "/shared.shm");
    }

    #[test]
    fn test_invalid_names_rejected() {
        assert!(matches!(
            outbound_queue_name("", "B"),
            Err(IpcError::InvalidName { .. })
        ));
        assert!(matches!(
            outbound_queue_name("A", "a/b"),
            Err(IpcError::InvalidName { .. })
        ));
        assert!(matches!(
            region_name("nul\0"),
            Err(IpcError::InvalidName { .. })
        ));
        assert!(region_name("line\nbreak").is_err());
    }

    #[test]
    fn test_long_names_rejected_not_truncated() {
        let long = "n".repeat(MAX_OBJECT_NAME_LEN);
        match region_name(&long) {
            Err(IpcError::NameTooLong { len, max, .. }) => {
                assert_eq!(len, MAX_OBJECT_NAME_LEN + REGION_SUFFIX.len());
                assert_eq!(max, MAX_OBJECT_NAME_LEN);
            }
            other => panic!("expected NameTooLong, got {:?}", other),
        }

        let fits = "n".repeat(MAX_OBJECT_NAME_LEN - REGION_SUFFIX.len());
        assert!(region_name(&fits).is_ok());
    }
}
