//! Parent process - forks the `child` example and calls into it.
//!
//! ```text
//! cargo build --example child
//! cargo run --example parent
//! ```

use event_invoke::{Invoker, RpcError};
use serde_json::{json, Value};
use tokio::process::Command;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let child_path = std::env::current_exe()?.with_file_name("child");
    let (invoker, mut child) = Invoker::fork(&mut Command::new(child_path))?;

    let reply: Value = invoker.invoke("greet", [json!({"name": "parent"})]).await?;
    println!("greet -> {}", reply);

    let quotient: f64 = invoker.invoke("divide", (10.0, 4.0)).await?;
    println!("divide(10, 4) -> {}", quotient);

    match invoker.invoke::<_, f64>("divide", (1.0, 0.0)).await {
        Err(RpcError::RemoteInvocationFailure(message)) => println!("divide(1, 0) -> {}", message),
        other => println!("unexpected: {:?}", other),
    }

    // Closing the child's stdin lets it exit on its own.
    invoker.destroy();
    let status = child.wait().await?;
    println!("child exited with {}", status);
    Ok(())
}
