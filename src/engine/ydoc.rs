//! `yrs`-backed document engine.
//!
//! Sync payloads follow the y-sync step layout: a varint step tag, then a
//! length-prefixed blob. Step 0 is a state request carrying a state vector,
//! step 1 is a state response carrying the missing deltas, step 2 is an
//! incremental update. Attachment references live in the root `"files"`
//! array; entries are maps with a `"key"` field (plain string entries are
//! accepted too).

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Array, ArrayRef, Doc, Out, ReadTxn, StateVector, Transact, Update};

use crate::ws::protocol::{read_var_bytes, read_var_u64, write_var_bytes, write_var_u64};

use super::{DocEngine, EngineError, SyncOutcome};

const STEP_REQUEST: u64 = 0;
const STEP_RESPONSE: u64 = 1;
const STEP_UPDATE: u64 = 2;

/// Name of the root array holding uploaded-attachment references.
const FILES_ROOT: &str = "files";

pub struct YDocEngine {
    doc: Doc,
    files: ArrayRef,
}

impl YDocEngine {
    pub fn new() -> Self {
        let doc = Doc::new();
        let files = doc.get_or_insert_array(FILES_ROOT);
        Self { doc, files }
    }

    fn apply_update(&mut self, bytes: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let update =
            Update::decode_v1(bytes).map_err(|e| EngineError::Codec(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        let before = txn.state_vector();
        txn.apply_update(update)
            .map_err(|e| EngineError::Apply(e.to_string()))?;
        // A replayed update (e.g. a state response echoing known content)
        // changes nothing and must not be fanned out again.
        if txn.state_vector() == before {
            return Ok(None);
        }
        drop(txn);
        Ok(Some(encode_step(STEP_UPDATE, bytes)))
    }
}

impl Default for YDocEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DocEngine for YDocEngine {
    fn handle_sync(&mut self, payload: &[u8]) -> Result<SyncOutcome, EngineError> {
        let (step, rest) =
            read_var_u64(payload).map_err(|e| EngineError::Codec(e.to_string()))?;
        let (blob, _) = read_var_bytes(rest).map_err(|e| EngineError::Codec(e.to_string()))?;
        match step {
            STEP_REQUEST => {
                let sv = StateVector::decode_v1(blob)
                    .map_err(|e| EngineError::Codec(e.to_string()))?;
                let txn = self.doc.transact();
                let missing = txn.encode_state_as_update_v1(&sv);
                Ok(SyncOutcome {
                    reply: Some(encode_step(STEP_RESPONSE, &missing)),
                    update: None,
                })
            }
            STEP_RESPONSE | STEP_UPDATE => Ok(SyncOutcome {
                reply: None,
                update: self.apply_update(blob)?,
            }),
            other => Err(EngineError::Codec(format!("unknown sync step {}", other))),
        }
    }

    fn sync_request(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        encode_step(STEP_REQUEST, &txn.state_vector().encode_v1())
    }

    fn apply_snapshot(&mut self, blob: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        self.apply_update(blob)
    }

    fn snapshot(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn resource_keys(&self) -> Vec<String> {
        let txn = self.doc.transact();
        let mut keys = Vec::new();
        for value in self.files.iter(&txn) {
            match value {
                Out::Any(Any::Map(entry)) => {
                    if let Some(Any::String(key)) = entry.get("key") {
                        keys.push(key.to_string());
                    }
                }
                Out::Any(Any::String(key)) => keys.push(key.to_string()),
                _ => {}
            }
        }
        keys
    }

    fn clear_resources(&mut self) {
        let mut txn = self.doc.transact_mut();
        let len = self.files.len(&txn);
        if len > 0 {
            self.files.remove_range(&mut txn, 0, len);
        }
    }
}

fn encode_step(step: u64, blob: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(blob.len() + 4);
    write_var_u64(&mut out, step);
    write_var_bytes(&mut out, blob);
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    /// A client-side document that produces updates the engine consumes.
    fn client_update(build: impl FnOnce(&Doc)) -> Vec<u8> {
        let doc = Doc::new();
        build(&doc);
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn push_file(doc: &Doc, key: &str) {
        let files = doc.get_or_insert_array(FILES_ROOT);
        let mut txn = doc.transact_mut();
        let mut entry = HashMap::new();
        entry.insert("key".to_string(), Any::from(key));
        entry.insert("name".to_string(), Any::from("upload.bin"));
        files.push_back(&mut txn, Any::from(entry));
    }

    #[test]
    fn update_is_applied_and_emitted_once() {
        let mut engine = YDocEngine::new();
        let update = client_update(|doc| push_file(doc, "file-a"));

        let outcome = engine.handle_sync(&encode_step(STEP_UPDATE, &update)).unwrap();
        assert!(outcome.reply.is_none());
        assert!(outcome.update.is_some());

        // Replaying the same update changes nothing and emits nothing.
        let replay = engine.handle_sync(&encode_step(STEP_UPDATE, &update)).unwrap();
        assert!(replay.update.is_none());
    }

    #[test]
    fn state_request_yields_missing_deltas() {
        let mut engine = YDocEngine::new();
        let update = client_update(|doc| push_file(doc, "file-a"));
        engine
            .handle_sync(&encode_step(STEP_UPDATE, &update))
            .unwrap();

        // A fresh peer asks for everything since its empty state.
        let empty_sv = StateVector::default().encode_v1();
        let outcome = engine
            .handle_sync(&encode_step(STEP_REQUEST, &empty_sv))
            .unwrap();
        let reply = outcome.reply.expect("state request produces a response");

        // Feeding the response to a second engine converges it.
        let mut peer = YDocEngine::new();
        peer.handle_sync(&reply).unwrap();
        assert_eq!(peer.resource_keys(), vec!["file-a".to_string()]);
    }

    #[test]
    fn resource_keys_survive_clear() {
        let mut engine = YDocEngine::new();
        let update = client_update(|doc| {
            push_file(doc, "k1");
            push_file(doc, "k2");
        });
        engine
            .handle_sync(&encode_step(STEP_UPDATE, &update))
            .unwrap();
        assert_eq!(engine.resource_keys(), vec!["k1".to_string(), "k2".to_string()]);

        engine.clear_resources();
        assert!(engine.resource_keys().is_empty());

        // The cleared state is what gets persisted.
        let mut restored = YDocEngine::new();
        restored.apply_snapshot(&engine.snapshot()).unwrap();
        assert!(restored.resource_keys().is_empty());
    }

    #[test]
    fn undecodable_payload_is_a_codec_error() {
        let mut engine = YDocEngine::new();
        assert!(matches!(
            engine.handle_sync(&[0x42]),
            Err(EngineError::Codec(_))
        ));
        assert!(matches!(
            engine.handle_sync(&encode_step(9, b"")),
            Err(EngineError::Codec(_))
        ));
    }

    #[test]
    fn snapshot_roundtrips_through_a_fresh_engine() {
        let mut engine = YDocEngine::new();
        let update = client_update(|doc| push_file(doc, "file-z"));
        engine
            .handle_sync(&encode_step(STEP_UPDATE, &update))
            .unwrap();

        let mut restored = YDocEngine::new();
        let emitted = restored.apply_snapshot(&engine.snapshot()).unwrap();
        assert!(emitted.is_some());
        assert_eq!(restored.resource_keys(), vec!["file-z".to_string()]);
    }
}
