//! Shared bus - invoker and callee in one process.
//!
//! Both sit on the same [`MemoryChannel`], so each sees the other's
//! messages and its own. The `origin` tag keeps them apart.
//!
//! ```text
//! RUST_LOG=event_invoke=debug cargo run --example bus
//! ```

use std::convert::Infallible;
use std::time::Duration;

use event_invoke::{Callee, Channel, Function, InvokeOptions, Invoker, MemoryChannel, RpcError};
use tracing_subscriber::EnvFilter;

fn max(args: Vec<i64>) -> Result<Option<i64>, Infallible> {
    Ok(args.into_iter().max())
}

async fn sleep((ms,): (u64,)) -> Result<u64, Infallible> {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(ms)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let bus = MemoryChannel::new();
    bus.connect();

    let callee = Callee::new(bus.clone());
    callee.register(vec![Function::sync(max), Function::new(sleep)])?;
    callee.listen()?;

    let invoker = Invoker::with_options(bus.clone(), InvokeOptions::from_millis(500));

    let (a, b) = tokio::join!(
        invoker.invoke::<_, i64>("max", [1, 2, 3]),
        invoker.invoke::<_, i64>("max", [5, 6]),
    );
    println!("max(1, 2, 3) = {}, max(5, 6) = {}", a?, b?);

    match invoker.invoke::<_, u64>("sleep", [1000]).await {
        Err(RpcError::Timeout { name, timeout }) => {
            println!("{} timed out after {:?}", name, timeout)
        }
        other => println!("unexpected: {:?}", other),
    }

    invoker.destroy();
    callee.destroy();
    Ok(())
}
