//! Snapshot building: run startup scripts in a throwaway isolate and
//! serialize the resulting context state into a blob, returned as an
//! external-copy array buffer ready to hand to `IsolateOptions::snapshot`.

use islet_engine as engine;

use crate::error::{RuntimeError, RuntimeResult};
use crate::external_copy::ExternalCopy;

/// One startup script for a snapshot build.
pub struct SnapshotScript {
    pub code: String,
    pub filename: String,
}

impl SnapshotScript {
    pub fn new(code: impl Into<String>, filename: impl Into<String>) -> SnapshotScript {
        SnapshotScript {
            code: code.into(),
            filename: filename.into(),
        }
    }
}

/// Build a snapshot blob by running `scripts` (and an optional warmup
/// script) in a fresh isolate, then serializing its context.
///
/// The throwaway isolate is driven directly on the calling thread with its
/// own microtask pumping, independent of any scheduler.
pub fn create_snapshot(
    scripts: &[SnapshotScript],
    warmup: Option<&str>,
) -> RuntimeResult<ExternalCopy> {
    let iso = engine::Isolate::new(engine::CreateParams::default())
        .map_err(|e| RuntimeError::generic(format!("failed to create snapshot isolate: {}", e)))?;
    let context = iso.default_context().clone();

    for script in scripts {
        run_snapshot_script(&iso, &context, &script.code, &script.filename)?;
    }
    if let Some(warmup) = warmup {
        // Warmup runs in the same dirty context; failures are fatal to the
        // build just like setup scripts.
        run_snapshot_script(&iso, &context, warmup, "<warmup>")?;
    }

    let blob = engine::create_snapshot(&iso, &context)
        .map_err(|e| snapshot_failure(&iso, e))?;
    Ok(ExternalCopy::array_buffer(blob))
}

fn run_snapshot_script(
    iso: &engine::Isolate,
    context: &engine::Context,
    code: &str,
    filename: &str,
) -> RuntimeResult<()> {
    iso.eval(code, filename, context)
        .map_err(|e| snapshot_failure(iso, e))?;
    // The engine may have queued work during setup; drain it before the
    // next script sees the context.
    iso.run_microtasks().map_err(|e| snapshot_failure(iso, e))?;
    Ok(())
}

fn snapshot_failure(iso: &engine::Isolate, error: engine::EngineError) -> RuntimeError {
    match error {
        engine::EngineError::Thrown(value) => {
            let _ = iso;
            RuntimeError::generic(format!(
                "Snapshot failure: {}",
                engine::value_to_display(&value)
            ))
        }
        other => RuntimeError::generic(format!("Snapshot failure: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_and_boots() {
        let blob = create_snapshot(
            &[SnapshotScript::new(
                "globalThis.answer = 42; globalThis.config = { deep: [1, 2, 3] };",
                "setup.js",
            )],
            Some("globalThis.warmed = answer + 1;"),
        )
        .unwrap();
        assert!(blob.byte_length().unwrap() > 0);
        let bytes = blob.bytes().unwrap();

        let iso = engine::Isolate::new(engine::CreateParams {
            snapshot: Some(bytes),
            ..Default::default()
        })
        .unwrap();
        let ctx = iso.default_context().clone();
        let value = iso.eval("answer + warmed", "t.js", &ctx).unwrap();
        assert_eq!(value.as_number(), Some(85.0));
    }

    #[test]
    fn setup_error_fails_build() {
        let result = create_snapshot(
            &[SnapshotScript::new("throw new Error('bad setup')", "s.js")],
            None,
        );
        match result {
            Err(e) => assert!(e.message().contains("Snapshot failure")),
            Ok(_) => panic!("expected failure"),
        }
    }
}
