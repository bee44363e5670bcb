//! Membership log records.

use covalent_types::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A record on the cluster-wide membership log.
///
/// `Join` is announced when a backend node comes up; `Leave` when it shuts
/// down gracefully or when the failure detector declares it dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MembershipEvent {
    Join { node_id: NodeId },
    Leave { node_id: NodeId },
}

impl MembershipEvent {
    /// Serializes the event for submission to the membership log.
    pub fn to_payload(self) -> Value {
        serde_json::to_value(self).expect("membership events are always serializable")
    }

    /// Decodes a membership log payload; `None` for unrecognized records.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trip() {
        let node = NodeId::random();
        for event in [
            MembershipEvent::Join { node_id: node },
            MembershipEvent::Leave { node_id: node },
        ] {
            let payload = event.to_payload();
            assert_eq!(MembershipEvent::from_payload(&payload), Some(event));
        }
    }

    #[test]
    fn tag_is_screaming_snake_case() {
        let payload = MembershipEvent::Leave {
            node_id: NodeId::random(),
        }
        .to_payload();
        assert_eq!(payload["type"], "LEAVE");
    }

    #[test]
    fn unknown_payload_is_ignored() {
        let payload = serde_json::json!({"type": "GOSSIP"});
        assert_eq!(MembershipEvent::from_payload(&payload), None);
    }
}
