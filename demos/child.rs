//! Child worker - serves functions over its own stdin/stdout.
//!
//! Spawned by the `parent` example. Logs go to stderr since stdout
//! carries the channel.

use std::convert::Infallible;

use event_invoke::{Callee, Function, StreamChannel};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Deserialize, Debug)]
struct Greeting {
    name: String,
}

#[derive(Serialize, Debug)]
struct Reply {
    message: String,
    pid: u32,
}

fn greet((greeting,): (Greeting,)) -> Result<Reply, Infallible> {
    Ok(Reply {
        message: format!("hello, {}", greeting.name),
        pid: std::process::id(),
    })
}

fn divide((a, b): (f64, f64)) -> Result<f64, String> {
    if b == 0.0 {
        return Err("division by zero".to_string());
    }
    Ok(a / b)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let callee = Callee::new(StreamChannel::stdio());
    callee.register(vec![Function::sync(greet), Function::sync(divide)])?;
    callee.listen()?;

    // Returns once the parent closes our stdin.
    callee.wait_for_shutdown().await?;
    Ok(())
}
