//! Identity propagation example demonstrating basic usage
//!
//! Sets an ambient identity on the main thread, then shows the three ways
//! captured context travels with work: wrapped callables, the ambient
//! managed executor, and a stage chain.

use std::sync::Arc;
use strand_core::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("Strand Propagation Example");
    println!("==========================\n");

    let identity = Arc::new(ThreadStateProvider::new("identity"));
    let service = ContextService::builder()
        .name("example-service")
        .provider(identity.clone())
        .policy("identity", ContextPolicy::Propagated)
        .build()?;

    identity.set("alice".to_string());
    println!("Ambient identity on main thread: {:?}\n", identity.get());

    // 1. A wrapped callable carries its capture to any thread.
    let inner = identity.clone();
    let supplier = service.contextual(move || inner.get());
    let seen = std::thread::spawn(move || supplier.call())
        .join()
        .expect("worker thread");
    println!("Wrapped supplier on a fresh thread saw: {:?}", seen);

    // 2. The ambient executor captures at each submission.
    let executor = service.ambient_executor()?;
    let inner = identity.clone();
    let stage = executor.submit(move || inner.get())?;
    println!("Executor task saw: {:?}", stage.outcome().await.unwrap());

    // 3. Each chain link runs under its registration-time context.
    let source: ManagedFuture<String> = ManagedFuture::pending(executor.clone());
    let inner = identity.clone();
    let chained = source.then_apply(move |greeting: String| {
        format!("{greeting}, {}", inner.get().unwrap_or_default())
    });
    identity.set("mallory".to_string());
    source.complete("hello".to_string());
    println!("Chained stage produced: {:?}", chained.outcome().await.unwrap());

    let _ = service.shutdown_graceful().await;
    println!("\nDone.");
    Ok(())
}
