//! Boundary and invariant tests: creation limits, release semantics,
//! disposal rules, handle bookkeeping, modules, snapshots, and inspector
//! session lifecycle.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use islet_runtime::{
    create_snapshot, AccessOptions, ExternalCopy, IsolateOptions, RunOptions, Runtime,
    RuntimeError, SessionCallbacks, SnapshotScript, TransferOptions,
};

#[test]
fn memory_limit_below_minimum_is_rejected() {
    let runtime = Runtime::new().unwrap();
    let err = runtime
        .create_isolate(IsolateOptions {
            memory_limit_mb: 4,
            ..Default::default()
        })
        .unwrap_err();
    assert_eq!(err.message(), "memoryLimit must be at least 8");
    runtime.dispose();
}

#[test]
fn releasing_a_reference_twice_fails() {
    let runtime = Runtime::new().unwrap();
    let isolate = runtime.create_isolate(IsolateOptions::default()).unwrap();
    let context = isolate.create_context().unwrap();
    let reference = isolate
        .compile_script("({ a: 1 })", "obj.js")
        .unwrap()
        .run_sync(
            &context,
            RunOptions {
                result: TransferOptions::reference(),
                ..Default::default()
            },
        )
        .unwrap()
        .into_reference()
        .unwrap();

    reference.release().unwrap();
    let err = reference.release().unwrap_err();
    assert_eq!(err.message(), "Reference has been released");
    runtime.dispose();
}

#[test]
fn disposed_isolate_rejects_operations() {
    let runtime = Runtime::new().unwrap();
    let isolate = runtime.create_isolate(IsolateOptions::default()).unwrap();
    let context = isolate.create_context().unwrap();
    isolate.dispose().unwrap();
    assert!(isolate.is_disposed());

    let err = isolate.compile_script("1", "x.js").unwrap_err();
    assert_eq!(err.message(), "Isolate is disposed");
    let err = context
        .global()
        .get_sync("missing", AccessOptions::default())
        .unwrap_err();
    assert_eq!(err.message(), "Isolate is disposed");
    // Disposal is idempotent once started.
    isolate.dispose().unwrap();
    runtime.dispose();
}

#[test]
fn remote_handles_drain_after_release() {
    let runtime = Runtime::new().unwrap();
    let isolate = runtime.create_isolate(IsolateOptions::default()).unwrap();
    let context = isolate.create_context().unwrap();

    let reference = isolate
        .compile_script("({ big: 'object' })", "obj.js")
        .unwrap()
        .run_sync(
            &context,
            RunOptions {
                result: TransferOptions::reference(),
                ..Default::default()
            },
        )
        .unwrap()
        .into_reference()
        .unwrap();
    assert!(isolate.remotes_count().unwrap() > 0);

    let baseline = isolate.remotes_count().unwrap();
    reference.release().unwrap();
    // The reset runs as a handle task inside the isolate; wait for it.
    let deadline = Instant::now() + Duration::from_secs(5);
    while isolate.remotes_count().unwrap() >= baseline && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(isolate.remotes_count().unwrap() < baseline);
    runtime.dispose();
}

#[test]
fn structured_clone_preserves_graphs() {
    let runtime = Runtime::new().unwrap();
    let isolate = runtime.create_isolate(IsolateOptions::default()).unwrap();
    let context = isolate.create_context().unwrap();
    // Round-trip an object graph out of the isolate and back in.
    let copied = isolate
        .compile_script("let o = { a: 1, list: [1, 2, 3] }; o.self = o; o", "graph.js")
        .unwrap()
        .run_sync(
            &context,
            RunOptions {
                result: TransferOptions::copy(),
                ..Default::default()
            },
        )
        .unwrap();
    context
        .global()
        .set_sync("back", copied, AccessOptions::default())
        .unwrap();
    let verdict = isolate
        .compile_script(
            "back.a === 1 && back.list.length === 3 && back.self === back",
            "verify.js",
        )
        .unwrap()
        .run_sync(&context, RunOptions::default())
        .unwrap();
    assert_eq!(verdict.as_copy().and_then(ExternalCopy::as_bool), Some(true));
    runtime.dispose();
}

#[test]
fn unhandled_rejection_surfaces_in_epilogue() {
    let runtime = Runtime::new().unwrap();
    let isolate = runtime.create_isolate(IsolateOptions::default()).unwrap();
    let context = isolate.create_context().unwrap();
    let err = isolate
        .compile_script("Promise.reject(new Error('lost track')); undefined", "rej.js")
        .unwrap()
        .run_sync(&context, RunOptions::default())
        .unwrap_err();
    match err {
        RuntimeError::Js(copy) => assert_eq!(copy.message, "lost track"),
        other => panic!("expected JS error, got {}", other),
    }
    runtime.dispose();
}

#[test]
fn module_graph_links_and_evaluates() {
    let runtime = Runtime::new().unwrap();
    let isolate = runtime.create_isolate(IsolateOptions::default()).unwrap();
    let context = isolate.create_context().unwrap();

    let main = isolate
        .compile_module(
            "import { a } from 'dep'; export const answer = a + 22;",
            "main.js",
        )
        .unwrap();
    assert_eq!(main.dependency_specifiers().unwrap(), vec!["dep".to_string()]);

    main.instantiate(&context, &mut |specifier, _referrer| {
        assert_eq!(specifier, "dep");
        isolate.compile_module("export const a = 20;", "dep.js")
    })
    .unwrap();

    main.evaluate(&context, 1000).unwrap();
    let namespace = main.namespace().unwrap();
    let answer = namespace
        .get_sync("answer", AccessOptions::default())
        .unwrap();
    assert_eq!(
        answer.as_copy().and_then(ExternalCopy::as_number),
        Some(42.0)
    );
    runtime.dispose();
}

#[test]
fn snapshot_boots_preinitialized_isolates() {
    let runtime = Runtime::new().unwrap();
    let blob = create_snapshot(
        &[SnapshotScript::new("globalThis.answer = 42;", "init.js")],
        None,
    )
    .unwrap();
    let isolate = runtime
        .create_isolate(IsolateOptions {
            snapshot: Some(blob.bytes().unwrap()),
            ..Default::default()
        })
        .unwrap();
    let context = isolate.create_context().unwrap();
    let result = isolate
        .compile_script("globalThis.answer", "read.js")
        .unwrap()
        .run_sync(&context, RunOptions::default())
        .unwrap();
    assert_eq!(result.as_copy().and_then(ExternalCopy::as_number), Some(42.0));
    runtime.dispose();
}

#[test]
fn inspector_session_round_trips_messages() {
    let runtime = Runtime::new().unwrap();
    let isolate = runtime
        .create_isolate(IsolateOptions {
            inspector: true,
            ..Default::default()
        })
        .unwrap();
    let responses: Arc<Mutex<Vec<(u64, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&responses);
    let session = isolate
        .create_inspector_session(SessionCallbacks {
            on_response: Box::new(move |id, body| {
                sink.lock().unwrap().push((id, body));
            }),
            on_notification: Box::new(|_| {}),
        })
        .unwrap();

    session
        .dispatch_protocol_message(r#"{"id":7,"method":"Runtime.enable"}"#)
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        {
            let responses = responses.lock().unwrap();
            if let Some((id, body)) = responses.first() {
                assert_eq!(*id, 7);
                assert!(body.contains("\"id\":7"));
                break;
            }
        }
        assert!(Instant::now() < deadline, "no inspector response arrived");
        std::thread::sleep(Duration::from_millis(10));
    }

    session.dispose();
    let err = session
        .dispatch_protocol_message(r#"{"id":8,"method":"Runtime.disable"}"#)
        .unwrap_err();
    assert_eq!(err.message(), "Session has been released");
    runtime.dispose();
}

#[test]
fn inspector_requires_flag() {
    let runtime = Runtime::new().unwrap();
    let isolate = runtime.create_isolate(IsolateOptions::default()).unwrap();
    let err = isolate
        .create_inspector_session(SessionCallbacks {
            on_response: Box::new(|_, _| {}),
            on_notification: Box::new(|_| {}),
        })
        .unwrap_err();
    assert!(err.message().contains("inspector"));
    runtime.dispose();
}

#[test]
fn total_external_size_tracks_copies() {
    const BIG: usize = 16 * 1024 * 1024;
    let before = islet_runtime::total_external_size();
    let copy = ExternalCopy::array_buffer(vec![0u8; BIG]);
    let peak = islet_runtime::total_external_size();
    assert!(peak >= before + BIG);
    drop(copy);
    // Other tests allocate concurrently; allow generous slack either way.
    let after = islet_runtime::total_external_size();
    assert!(peak.saturating_sub(after) >= BIG - 1024 * 1024);
}

#[test]
fn deref_into_is_single_use() {
    let runtime = Runtime::new().unwrap();
    let isolate = runtime.create_isolate(IsolateOptions::default()).unwrap();
    let context = isolate.create_context().unwrap();
    let reference = isolate
        .compile_script("({ tag: 'inner' })", "obj.js")
        .unwrap()
        .run_sync(
            &context,
            RunOptions {
                result: TransferOptions::reference(),
                ..Default::default()
            },
        )
        .unwrap()
        .into_reference()
        .unwrap();

    // First use: passes back into its own isolate and dereferences.
    let derefed = reference.deref_into().unwrap();
    context
        .global()
        .set_sync("unwrapped", derefed.clone(), AccessOptions::default())
        .unwrap();
    let tag = isolate
        .compile_script("unwrapped.tag", "tag.js")
        .unwrap()
        .run_sync(&context, RunOptions::default())
        .unwrap();
    assert_eq!(
        tag.as_copy().and_then(ExternalCopy::as_string).as_deref(),
        Some("inner")
    );

    // Second use of the same dereference fails.
    let err = context
        .global()
        .set_sync("again", derefed, AccessOptions::default())
        .unwrap_err();
    assert!(err.message().contains("derefInto"));
    runtime.dispose();
}

#[test]
fn get_with_inherit_walks_prototypes_without_accessors() {
    let runtime = Runtime::new().unwrap();
    let isolate = runtime.create_isolate(IsolateOptions::default()).unwrap();
    let context = isolate.create_context().unwrap();
    isolate
        .compile_script(
            "function Base() {} Base.prototype.inherited = 'yes'; globalThis.child = new Base();",
            "proto.js",
        )
        .unwrap()
        .run_sync(&context, RunOptions::default())
        .unwrap();
    let child = context
        .global()
        .get_sync("child", AccessOptions::default())
        .unwrap()
        .into_reference()
        .unwrap();

    // Without inherit the own slots miss; with inherit the chain answers.
    let own = child.get_sync("inherited", AccessOptions::default()).unwrap();
    assert!(own.as_copy().map(ExternalCopy::is_undefined).unwrap_or(false));
    let inherited = child
        .get_sync(
            "inherited",
            AccessOptions {
                inherit: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(
        inherited
            .as_copy()
            .and_then(ExternalCopy::as_string)
            .as_deref(),
        Some("yes")
    );
    runtime.dispose();
}

#[test]
fn proxies_cannot_be_traversed_remotely() {
    let runtime = Runtime::new().unwrap();
    let isolate = runtime.create_isolate(IsolateOptions::default()).unwrap();
    let context = isolate.create_context().unwrap();
    isolate
        .compile_script(
            "globalThis.p = new Proxy({ secret: 1 }, {}); undefined",
            "proxy.js",
        )
        .unwrap()
        .run_sync(&context, RunOptions::default())
        .unwrap();
    let proxied = context
        .global()
        .get_sync("p", AccessOptions::default())
        .unwrap()
        .into_reference()
        .unwrap();
    let err = proxied.get_sync("secret", AccessOptions::default()).unwrap_err();
    assert!(err.message().contains("Proxy"));
    runtime.dispose();
}
