//! End-to-end propagation tests
//!
//! These tests exercise the full path: ambient state set on one thread,
//! captured by a service, carried through wrappers, executors, and stage
//! chains, and observed on whichever worker thread runs the body.

use std::sync::Arc;
use strand_core::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn identity_service(provider: &Arc<ThreadStateProvider<String>>) -> ContextService {
    ContextService::builder()
        .name("propagation-tests")
        .provider(provider.clone())
        .policy("identity", ContextPolicy::Propagated)
        .build()
        .expect("service builds")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wrapped_supplier_across_threads() {
    init_tracing();
    let identity = Arc::new(ThreadStateProvider::new("identity"));
    let service = identity_service(&identity);

    // Thread A: ambient identity is "alice" when the supplier is wrapped.
    identity.set("alice".to_string());
    let inner = identity.clone();
    let supplier = service.contextual(move || inner.get());

    // Thread B: its own ambient context before the call...
    let probe = identity.clone();
    let handle = std::thread::spawn(move || {
        probe.set("worker-own".to_string());
        let before = probe.get();
        let seen = supplier.call();
        let after = probe.get();
        (before, seen, after)
    });
    let (before, seen, after) = handle.join().unwrap();

    // ...the captured context inside the body, and the same ambient context
    // after the call.
    assert_eq!(before, Some("worker-own".to_string()));
    assert_eq!(seen, Some("alice".to_string()));
    assert_eq!(after, Some("worker-own".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stage_chain_each_link_keeps_its_context() {
    init_tracing();
    let identity = Arc::new(ThreadStateProvider::new("identity"));
    let service = identity_service(&identity);
    let executor = service.ambient_executor().unwrap();

    // Register links under three different ambient identities; each link
    // must observe the identity current at its own registration.
    identity.set("first".to_string());
    let source: ManagedFuture<Vec<String>> = ManagedFuture::pending(executor.clone());
    let p = identity.clone();
    let link1 = source.then_apply(move |mut acc: Vec<String>| {
        acc.push(format!("link1={}", p.get().unwrap_or_default()));
        acc
    });

    identity.set("second".to_string());
    let p = identity.clone();
    let link2 = link1.then_apply(move |mut acc| {
        acc.push(format!("link2={}", p.get().unwrap_or_default()));
        acc
    });

    identity.set("third".to_string());
    let p = identity.clone();
    let link3 = link2.then_apply(move |mut acc| {
        acc.push(format!("link3={}", p.get().unwrap_or_default()));
        acc
    });

    // Completion arrives from a thread with unrelated context.
    let completer = source.clone();
    std::thread::spawn(move || {
        completer.complete(Vec::new());
    })
    .join()
    .unwrap();

    assert_eq!(
        link3.outcome().await.unwrap(),
        vec![
            "link1=first".to_string(),
            "link2=second".to_string(),
            "link3=third".to_string(),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failure_passes_through_chain_unchanged() {
    init_tracing();
    let identity = Arc::new(ThreadStateProvider::<String>::new("identity"));
    let service = identity_service(&identity);
    let executor = service.ambient_executor().unwrap();

    let source: ManagedFuture<i32> = ManagedFuture::pending(executor);
    let mapped = source.then_apply(|v| v + 1).then_apply(|v| v * 2);

    source.fail(anyhow::anyhow!("original failure text"));
    let failure = mapped.outcome().await.unwrap_err();
    assert!(failure.to_string().contains("original failure text"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_with_context_capture_end_to_end() {
    init_tracing();
    let identity = Arc::new(ThreadStateProvider::new("identity"));
    let service = identity_service(&identity);

    // An externally-driven result the framework does not control.
    let external: ManagedFuture<String> =
        ManagedFuture::pending(service.ambient_executor().unwrap());

    identity.set("alice".to_string());
    let bridged = service.with_context_capture(&external).unwrap();
    identity.remove();

    let p = identity.clone();
    let seen = bridged.then_apply(move |value: String| (value, p.get()));

    // Completion driven by a foreign thread with its own identity.
    let completer = external.clone();
    std::thread::spawn(move || {
        completer.complete("payload".to_string());
    })
    .join()
    .unwrap();

    let (value, observed) = seen.outcome().await.unwrap();
    assert_eq!(value, "payload");
    assert_eq!(observed, Some("alice".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_per_call_override_clears_a_propagated_type() {
    init_tracing();
    let identity = Arc::new(ThreadStateProvider::new("identity"));
    let service = identity_service(&identity);

    identity.set("alice".to_string());
    let mut overrides = std::collections::BTreeMap::new();
    overrides.insert("identity".to_string(), ContextPolicy::Cleared);
    let descriptor = service.capture_with(&overrides);

    let probe = identity.clone();
    let handle = std::thread::spawn(move || {
        probe.set("worker-own".to_string());
        let seen = {
            let _ctx = descriptor.establish();
            probe.get()
        };
        (seen, probe.get())
    });
    let (seen, after) = handle.join().unwrap();
    assert_eq!(seen, None);
    assert_eq!(after, Some("worker-own".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_workers_do_not_share_pushed_context() {
    init_tracing();
    let identity = Arc::new(ThreadStateProvider::new("identity"));
    let service = identity_service(&identity);
    let executor = service.ambient_executor().unwrap();

    let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();

    // First task holds "alice" established while it waits on the gate.
    identity.set("alice".to_string());
    let p = identity.clone();
    let first = executor
        .submit(move || {
            let held = p.get();
            let _ = gate_rx.recv();
            held
        })
        .unwrap();

    // Second task, submitted under "bob", runs concurrently on another
    // worker and must see only its own context.
    identity.set("bob".to_string());
    let p = identity.clone();
    let second = executor.submit(move || p.get()).unwrap();

    assert_eq!(second.outcome().await.unwrap(), Some("bob".to_string()));
    gate_tx.send(()).unwrap();
    assert_eq!(first.outcome().await.unwrap(), Some("alice".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_service_from_config_file() {
    init_tracing();
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
name = "configured-service"
default_policy = "cleared"
shutdown_grace = "2s"

[policies]
identity = "propagated"
"#
    )
    .unwrap();

    let config = ContextServiceConfig::from_file(file.path()).unwrap();
    let identity = Arc::new(ThreadStateProvider::new("identity"));
    let service = ContextService::builder()
        .config(config)
        .provider(identity.clone())
        .build()
        .unwrap();
    assert_eq!(service.name(), "configured-service");

    identity.set("alice".to_string());
    let executor = service.ambient_executor().unwrap();
    let p = identity.clone();
    let stage = executor.submit(move || p.get()).unwrap();
    assert_eq!(stage.outcome().await.unwrap(), Some("alice".to_string()));

    assert!(service.shutdown_graceful().await);
}
