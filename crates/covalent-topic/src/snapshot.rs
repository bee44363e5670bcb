//! Snapshot capture, restore and wire codec.
//!
//! A snapshot freezes a topic's complete state together with the ID of the
//! last change folded into it. The leader submits one every
//! [`crate::topic::SNAPSHOT_EVERY`] accepted mutations and truncates the
//! log behind it; a late node restores the blob and resubscribes from
//! `latest`.
//!
//! Wire layout (JSON): `{latest, maps, lists, map_timeouts, list_timeouts,
//! active_nodes, backend_nodes}` with lists flattened head-to-tail (the
//! order encodes the links) and durations as ISO-8601 strings.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use covalent_types::duration::{format_iso8601, parse_iso8601};
use covalent_types::{EventId, ListKey, NodeId};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::state::{ListData, MapEntry, TopicData};

/// Error decoding or re-materializing a snapshot blob.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot blob is not a valid document: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("snapshot carries an invalid timeout for {name:?}: {reason}")]
    InvalidTimeout { name: String, reason: String },
}

/// One list entry in flattened snapshot form; position encodes the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotListEntry {
    pub key: ListKey,
    pub revision: EventId,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_owner: Option<NodeId>,
}

/// Serialized form of a topic's complete state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicSnapshot {
    /// ID of the last change folded into this snapshot; the resubscription
    /// point for restorers.
    pub latest: Option<EventId>,
    pub maps: IndexMap<String, IndexMap<String, MapEntry>>,
    pub lists: IndexMap<String, Vec<SnapshotListEntry>>,
    /// ISO-8601 duration strings per collection name.
    pub map_timeouts: IndexMap<String, String>,
    pub list_timeouts: IndexMap<String, String>,
    pub active_nodes: Vec<NodeId>,
    pub backend_nodes: Vec<NodeId>,
}

impl TopicSnapshot {
    /// Freezes the given state.
    pub fn capture(data: &TopicData, latest: Option<EventId>) -> Self {
        let lists = data
            .lists
            .iter()
            .map(|(name, list)| {
                let flattened = list
                    .iter()
                    .map(|(key, entry)| SnapshotListEntry {
                        key,
                        revision: entry.revision,
                        value: entry.value.clone(),
                        scope_owner: entry.scope_owner,
                    })
                    .collect();
                (name.clone(), flattened)
            })
            .collect();

        Self {
            latest,
            maps: data.maps.clone(),
            lists,
            map_timeouts: encode_timeouts(&data.map_timeouts),
            list_timeouts: encode_timeouts(&data.list_timeouts),
            active_nodes: data.active_nodes.iter().copied().collect(),
            backend_nodes: data.backend_nodes.clone(),
        }
    }

    /// Re-materializes topic state from this snapshot.
    pub fn restore(&self) -> Result<TopicData, SnapshotError> {
        let lists = self
            .lists
            .iter()
            .map(|(name, flattened)| {
                let list = ListData::from_ordered(flattened.iter().map(|entry| {
                    (entry.key, entry.revision, entry.value.clone(), entry.scope_owner)
                }));
                (name.clone(), list)
            })
            .collect();

        Ok(TopicData {
            maps: self.maps.clone(),
            lists,
            map_timeouts: decode_timeouts(&self.map_timeouts)?,
            list_timeouts: decode_timeouts(&self.list_timeouts)?,
            active_nodes: self.active_nodes.iter().copied().collect::<IndexSet<_>>(),
            backend_nodes: self.backend_nodes.clone(),
            change_count: 0,
        })
    }

    /// Encodes the snapshot for the backend's snapshot store.
    pub fn encode(&self) -> Result<Bytes, SnapshotError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decodes a blob previously produced by [`TopicSnapshot::encode`].
    pub fn decode(blob: &[u8]) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_slice(blob)?)
    }
}

fn encode_timeouts(timeouts: &HashMap<String, Duration>) -> IndexMap<String, String> {
    let mut encoded: IndexMap<String, String> = timeouts
        .iter()
        .map(|(name, timeout)| (name.clone(), format_iso8601(*timeout)))
        .collect();
    // HashMap iteration order is unstable; sort for a canonical blob.
    encoded.sort_keys();
    encoded
}

fn decode_timeouts(
    encoded: &IndexMap<String, String>,
) -> Result<HashMap<String, Duration>, SnapshotError> {
    encoded
        .iter()
        .map(|(name, raw)| {
            parse_iso8601(raw)
                .map(|timeout| (name.clone(), timeout))
                .map_err(|e| SnapshotError::InvalidTimeout {
                    name: name.clone(),
                    reason: e.to_string(),
                })
        })
        .collect()
}
