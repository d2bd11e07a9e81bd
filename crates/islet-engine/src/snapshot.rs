//! Snapshot blobs: the serialized global state of a context.
//!
//! A snapshot captures the clonable global bindings of a context so a fresh
//! isolate can start pre-initialized. Functions and other non-clonable
//! values are skipped; scripts that need them belong in startup code, not
//! snapshots.

use crate::error::Completion;
use crate::isolate::{Context, Isolate};
use crate::structured_clone::{deserialize, serialize, DenyDelegate};
use crate::value::{Property, Value};

const MAGIC: &[u8; 4] = b"islt";

/// Serialize the context's global plain-data bindings into a blob.
pub fn create_snapshot(iso: &Isolate, context: &Context) -> Completion<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    let mut entries: Vec<(String, Vec<u8>)> = Vec::new();
    for key in context.global().own_keys() {
        let value = match context.global().get_own(&key) {
            Some(Property::Data { value, .. }) => value,
            _ => continue,
        };
        if value.is_function() {
            continue;
        }
        match serialize(iso, &mut DenyDelegate, &value) {
            Ok(bytes) => entries.push((key, bytes)),
            // Non-clonable bindings are simply not part of the snapshot.
            Err(_) => continue,
        }
    }
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (key, bytes) in entries {
        out.extend_from_slice(&(key.len() as u32).to_le_bytes());
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&bytes);
    }
    Ok(out)
}

/// Restore a snapshot blob into a context's global.
pub fn apply_snapshot(iso: &Isolate, context: &Context, blob: &[u8]) -> Completion<()> {
    let corrupt = || iso.throw_type_error("malformed snapshot blob");
    if blob.len() < 8 || &blob[0..4] != MAGIC {
        return Err(corrupt());
    }
    let mut pos = 4usize;
    let mut take = |n: usize, pos: &mut usize| -> Option<&[u8]> {
        if *pos + n > blob.len() {
            return None;
        }
        let slice = &blob[*pos..*pos + n];
        *pos += n;
        Some(slice)
    };
    let count = {
        let b = take(4, &mut pos).ok_or_else(|| corrupt())?;
        u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize
    };
    for _ in 0..count {
        let key_len = {
            let b = take(4, &mut pos).ok_or_else(|| corrupt())?;
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize
        };
        let key = String::from_utf8(take(key_len, &mut pos).ok_or_else(|| corrupt())?.to_vec())
            .map_err(|_| corrupt())?;
        let value_len = {
            let b = take(4, &mut pos).ok_or_else(|| corrupt())?;
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize
        };
        let bytes = take(value_len, &mut pos).ok_or_else(|| corrupt())?;
        let value: Value = deserialize(iso, &mut DenyDelegate, bytes)?;
        context.global().set_data(&key, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolate::{CreateParams, Isolate};

    #[test]
    fn snapshot_round_trip() {
        let iso = Isolate::new(CreateParams::default()).unwrap();
        let ctx = iso.default_context().clone();
        iso.eval(
            "globalThis.config = { retries: 3, tags: ['a', 'b'] }; globalThis.greeting = 'hi';",
            "init.js",
            &ctx,
        )
        .unwrap();
        let blob = create_snapshot(&iso, &ctx).unwrap();

        let restored = Isolate::new(CreateParams {
            snapshot: Some(blob),
            ..Default::default()
        })
        .unwrap();
        let ctx = restored.default_context().clone();
        let value = restored
            .eval("config.retries + greeting.length", "t.js", &ctx)
            .unwrap();
        assert_eq!(value.as_number(), Some(5.0));
    }

    #[test]
    fn bad_blob_rejected() {
        let result = Isolate::new(CreateParams {
            snapshot: Some(vec![1, 2, 3]),
            ..Default::default()
        });
        assert!(result.is_err());
    }
}
