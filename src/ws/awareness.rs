//! Ephemeral presence state for a room.
//!
//! Each client publishes a JSON presence payload under its client id,
//! versioned by a logical clock. Higher clocks supersede lower ones; a null
//! payload is a tombstone that drops the client's entry. The wire layout is
//! a varint entry count followed by (client id, clock, JSON string) triples,
//! with the string `"null"` marking a removal.

use std::collections::HashMap;

use crate::ws::protocol::{
    read_var_string, read_var_u64, write_var_bytes, write_var_u64, ProtocolError,
};

/// One client's entry in an awareness update. `state == None` is a tombstone.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub clock: u64,
    pub state: Option<String>,
}

/// The effect of applying an awareness update to the table.
///
/// `changed` holds the entries that actually took effect, in wire form,
/// ready to be re-encoded and fanned out. `added` and `removed` list the
/// client ids a session gained or lost control of.
#[derive(Debug, Default)]
pub struct AwarenessChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
    pub changed: Vec<AwarenessEntry>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }
}

#[derive(Debug, Clone)]
struct PeerState {
    clock: u64,
    state: String,
}

/// Room-owned mapping from client id to last-known presence.
#[derive(Debug, Default)]
pub struct AwarenessTable {
    peers: HashMap<u64, PeerState>,
}

impl AwarenessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Merge a decoded update into the table.
    ///
    /// An entry is accepted when its clock is newer than what we hold, or
    /// equal-clock with a tombstone for a client we do hold (the peer is
    /// confirming its own removal). Everything else is stale and dropped.
    pub fn apply(&mut self, entries: Vec<AwarenessEntry>) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        for entry in entries {
            let prev = self.peers.get(&entry.client_id);
            let accept = match prev {
                Some(peer) => {
                    entry.clock > peer.clock || (entry.clock == peer.clock && entry.state.is_none())
                }
                None => entry.state.is_some(),
            };
            if !accept {
                continue;
            }
            match &entry.state {
                Some(state) => {
                    let existed = self
                        .peers
                        .insert(
                            entry.client_id,
                            PeerState {
                                clock: entry.clock,
                                state: state.clone(),
                            },
                        )
                        .is_some();
                    if existed {
                        change.updated.push(entry.client_id);
                    } else {
                        change.added.push(entry.client_id);
                    }
                }
                None => {
                    self.peers.remove(&entry.client_id);
                    change.removed.push(entry.client_id);
                }
            }
            change.changed.push(entry);
        }
        change
    }

    /// Drop the given clients, returning the tombstones to broadcast.
    ///
    /// Used when a session disconnects and its presence must be cleared.
    /// Clocks are bumped past the last published value so every receiver
    /// accepts the removal.
    pub fn remove_clients(&mut self, client_ids: &[u64]) -> Vec<AwarenessEntry> {
        let mut tombstones = Vec::new();
        for &client_id in client_ids {
            if let Some(peer) = self.peers.remove(&client_id) {
                tombstones.push(AwarenessEntry {
                    client_id,
                    clock: peer.clock + 1,
                    state: None,
                });
            }
        }
        tombstones
    }

    /// Snapshot of every live entry, for a late joiner's initial sync.
    pub fn full_state(&self) -> Vec<AwarenessEntry> {
        let mut entries: Vec<AwarenessEntry> = self
            .peers
            .iter()
            .map(|(&client_id, peer)| AwarenessEntry {
                client_id,
                clock: peer.clock,
                state: Some(peer.state.clone()),
            })
            .collect();
        entries.sort_by_key(|e| e.client_id);
        entries
    }
}

/// Decode an awareness payload into per-client entries.
pub fn decode_awareness(payload: &[u8]) -> Result<Vec<AwarenessEntry>, ProtocolError> {
    let (count, mut rest) = read_var_u64(payload)?;
    let mut entries = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        let (client_id, r) = read_var_u64(rest)?;
        let (clock, r) = read_var_u64(r)?;
        let (state, r) = read_var_string(r)?;
        entries.push(AwarenessEntry {
            client_id,
            clock,
            state: if state == "null" {
                None
            } else {
                Some(state.to_string())
            },
        });
        rest = r;
    }
    Ok(entries)
}

/// Encode entries back into an awareness payload.
pub fn encode_awareness(entries: &[AwarenessEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    write_var_u64(&mut out, entries.len() as u64);
    for entry in entries {
        write_var_u64(&mut out, entry.client_id);
        write_var_u64(&mut out, entry.clock);
        match &entry.state {
            Some(state) => write_var_bytes(&mut out, state.as_bytes()),
            None => write_var_bytes(&mut out, b"null"),
        }
    }
    out
}
