//! End-to-end scenarios across the full runtime: script execution, cross
//! isolate apply, timeouts, memory limits, promise bridging, and buffer
//! transfer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use islet_runtime::{
    AccessOptions, ApplyOptions, ExternalCopy, IsolateOptions, RunOptions, Runtime, RuntimeError,
    TransferOptions, Transferable,
};

fn runtime() -> Runtime {
    Runtime::new().expect("runtime starts")
}

#[test]
fn cross_isolate_return_value() {
    let runtime = runtime();
    let isolate = runtime.create_isolate(IsolateOptions::default()).unwrap();
    let context = isolate.create_context().unwrap();
    let script = isolate.compile_script("40 + 2", "answer.js").unwrap();
    let result = script
        .run_sync(
            &context,
            RunOptions {
                timeout: 1000,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(result.as_copy().and_then(ExternalCopy::as_number), Some(42.0));
    runtime.dispose();
}

#[test]
fn reference_apply_with_copy_back() {
    let runtime = runtime();
    let isolate = runtime.create_isolate(IsolateOptions::default()).unwrap();
    let context = isolate.create_context().unwrap();
    let script = isolate
        .compile_script("(x) => x.toUpperCase()", "upper.js")
        .unwrap();
    let function = script
        .run_sync(
            &context,
            RunOptions {
                timeout: 1000,
                result: TransferOptions::reference(),
            },
        )
        .unwrap()
        .into_reference()
        .expect("function reference");

    let result = function
        .apply_sync(
            None,
            vec![Transferable::copy(ExternalCopy::string("hello"))],
            ApplyOptions {
                timeout: 1000,
                result: TransferOptions::copy(),
            },
        )
        .unwrap();
    assert_eq!(
        result.as_copy().and_then(ExternalCopy::as_string).as_deref(),
        Some("HELLO")
    );
    runtime.dispose();
}

#[test]
fn timeout_terminates_and_isolate_survives() {
    let runtime = runtime();
    let isolate = runtime.create_isolate(IsolateOptions::default()).unwrap();
    let context = isolate.create_context().unwrap();

    let spin = isolate.compile_script("while (true) {}", "spin.js").unwrap();
    let err = spin
        .run_sync(
            &context,
            RunOptions {
                timeout: 50,
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(
        err.message().starts_with("Script execution timed out."),
        "unexpected error: {}",
        err
    );

    // The isolate remains usable.
    let add = isolate.compile_script("1 + 1", "add.js").unwrap();
    let result = add
        .run_sync(
            &context,
            RunOptions {
                timeout: 1000,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(result.as_copy().and_then(ExternalCopy::as_number), Some(2.0));
    runtime.dispose();
}

#[test]
fn memory_limit_disposes_isolate() {
    let runtime = runtime();
    let isolate = runtime
        .create_isolate(IsolateOptions {
            memory_limit_mb: 8,
            ..Default::default()
        })
        .unwrap();
    let context = isolate.create_context().unwrap();
    let script = isolate
        .compile_script("let s = 'a'; while (true) s += s;", "hog.js")
        .unwrap();
    let err = script
        .run_sync(&context, RunOptions::default())
        .unwrap_err();
    assert!(err.is_fatal(), "expected fatal error, got: {}", err);

    // Disposal is queued on the host thread; wait for it to land.
    let deadline = Instant::now() + Duration::from_secs(5);
    while !isolate.is_disposed() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(isolate.is_disposed());

    let err = isolate.compile_script("1", "x.js").unwrap_err();
    assert_eq!(err.message(), "Isolate is disposed");
    runtime.dispose();
}

#[test]
fn apply_sync_promise_bridges_async_function() {
    let runtime = runtime();
    let isolate = runtime.create_isolate(IsolateOptions::default()).unwrap();
    let context = isolate.create_context().unwrap();
    let script = isolate
        .compile_script("async () => 7", "seven.js")
        .unwrap();
    let function = script
        .run_sync(
            &context,
            RunOptions {
                timeout: 1000,
                result: TransferOptions::reference(),
            },
        )
        .unwrap()
        .into_reference()
        .expect("function reference");

    let result = function
        .apply_sync_promise(None, Vec::new(), ApplyOptions::default())
        .unwrap();
    assert_eq!(result.as_copy().and_then(ExternalCopy::as_number), Some(7.0));
    runtime.dispose();
}

#[test]
fn apply_sync_promise_waits_for_later_resolution() {
    let runtime = runtime();
    let isolate = runtime.create_isolate(IsolateOptions::default()).unwrap();
    let context = isolate.create_context().unwrap();
    isolate
        .compile_script(
            "let resolve; globalThis.pending = new Promise((res) => { resolve = res; }); \
             globalThis.finish = (v) => resolve(v);",
            "setup.js",
        )
        .unwrap()
        .run_sync(&context, RunOptions::default())
        .unwrap();

    let getter = isolate
        .compile_script("() => globalThis.pending", "get.js")
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
    let finish = isolate
        .compile_script("(v) => globalThis.finish(v)", "finish.js")
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

    // Settle the promise from another host thread after a delay.
    let resolver_thread = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        finish
            .apply_sync(
                None,
                vec![Transferable::copy(ExternalCopy::number(11.0))],
                ApplyOptions::default(),
            )
            .unwrap();
    });

    let result = getter
        .apply_sync_promise(None, Vec::new(), ApplyOptions::default())
        .unwrap();
    assert_eq!(result.as_copy().and_then(ExternalCopy::as_number), Some(11.0));
    resolver_thread.join().unwrap();
    runtime.dispose();
}

#[test]
fn external_copy_transferred_buffer() {
    let runtime = runtime();
    let isolate = runtime.create_isolate(IsolateOptions::default()).unwrap();
    let context = isolate.create_context().unwrap();

    let copy = Arc::new(ExternalCopy::array_buffer(vec![1, 2, 3, 4, 5, 6, 7, 8]));
    assert_eq!(copy.byte_length(), Some(8));

    context
        .global()
        .set_sync("buf", Transferable::Copy(Arc::clone(&copy)), AccessOptions::default())
        .unwrap();

    let reader = isolate
        .compile_script(
            "let v = new Uint8Array(buf); v[0] + v[7] * 10",
            "read.js",
        )
        .unwrap();
    let result = reader
        .run_sync(
            &context,
            RunOptions {
                timeout: 1000,
                ..Default::default()
            },
        )
        .unwrap();
    // 1 + 8 * 10
    assert_eq!(result.as_copy().and_then(ExternalCopy::as_number), Some(81.0));

    // The source handle still reports its original length and bytes.
    assert_eq!(copy.byte_length(), Some(8));
    assert_eq!(copy.bytes().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    runtime.dispose();
}

#[test]
fn buffer_transfer_detaches_source() {
    let runtime = runtime();
    let isolate = runtime.create_isolate(IsolateOptions::default()).unwrap();
    let context = isolate.create_context().unwrap();
    isolate
        .compile_script(
            "globalThis.b = new ArrayBuffer(8); new Uint8Array(b)[0] = 42;",
            "mk.js",
        )
        .unwrap()
        .run_sync(&context, RunOptions::default())
        .unwrap();

    let buffer_ref = context
        .global()
        .get_sync("b", AccessOptions::default())
        .unwrap()
        .into_reference()
        .unwrap();

    // Copy without transfer: source intact, contents equal.
    let plain = buffer_ref.copy_sync(false).unwrap();
    assert_eq!(plain.bytes().unwrap()[0], 42);
    let len = isolate
        .compile_script("b.byteLength", "len.js")
        .unwrap()
        .run_sync(&context, RunOptions::default())
        .unwrap();
    assert_eq!(len.as_copy().and_then(ExternalCopy::as_number), Some(8.0));

    // Transfer out: source detaches to byteLength 0.
    let moved = buffer_ref.copy_sync(true).unwrap();
    assert_eq!(moved.bytes().unwrap()[0], 42);
    let len = isolate
        .compile_script("b.byteLength", "len2.js")
        .unwrap()
        .run_sync(&context, RunOptions::default())
        .unwrap();
    assert_eq!(len.as_copy().and_then(ExternalCopy::as_number), Some(0.0));
    runtime.dispose();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_run_completes_through_the_pool() {
    let runtime = runtime();
    let isolate = runtime.create_isolate(IsolateOptions::default()).unwrap();
    let context = isolate.create_context().unwrap();
    let script = isolate.compile_script("6 * 7", "mul.js").unwrap();
    let result = script
        .run(
            &context,
            RunOptions {
                timeout: 1000,
                ..Default::default()
            },
        )
        .wait()
        .await
        .unwrap();
    assert_eq!(result.as_copy().and_then(ExternalCopy::as_number), Some(42.0));
    runtime.dispose();
}

#[test]
fn callback_round_trips_between_isolates() {
    let runtime = runtime();
    let producer = runtime.create_isolate(IsolateOptions::default()).unwrap();
    let producer_ctx = producer.create_context().unwrap();
    let consumer = runtime.create_isolate(IsolateOptions::default()).unwrap();
    let consumer_ctx = consumer.create_context().unwrap();

    // A bare function result transfers as a callback.
    let double = producer
        .compile_script("(x) => x * 2", "double.js")
        .unwrap()
        .run_sync(
            &producer_ctx,
            RunOptions {
                timeout: 1000,
                ..Default::default()
            },
        )
        .unwrap();
    assert!(matches!(double, Transferable::Callback(_)));

    // The consumer invokes it; the invocation yields a promise settled from
    // the producer isolate, bridged back synchronously.
    let caller = consumer
        .compile_script("(f) => f(21)", "call.js")
        .unwrap()
        .run_sync(
            &consumer_ctx,
            RunOptions {
                result: TransferOptions::reference(),
                ..Default::default()
            },
        )
        .unwrap()
        .into_reference()
        .unwrap();
    let result = caller
        .apply_sync_promise(None, vec![double], ApplyOptions::default())
        .unwrap();
    assert_eq!(result.as_copy().and_then(ExternalCopy::as_number), Some(42.0));
    runtime.dispose();
}

#[test]
fn thrown_errors_cross_with_class_and_message() {
    let runtime = runtime();
    let isolate = runtime.create_isolate(IsolateOptions::default()).unwrap();
    let context = isolate.create_context().unwrap();
    let script = isolate
        .compile_script("throw new TypeError('not like this')", "bad.js")
        .unwrap();
    let err = script
        .run_sync(&context, RunOptions::default())
        .unwrap_err();
    match err {
        RuntimeError::Js(copy) => {
            assert_eq!(copy.name, "TypeError");
            assert_eq!(copy.message, "not like this");
            assert!(copy.stack.is_some());
        }
        other => panic!("expected a JS error, got: {}", other),
    }
    runtime.dispose();
}
