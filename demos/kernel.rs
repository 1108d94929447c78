//! Kernel Worker - serves the full command set from an in-memory kernel.
//!
//! This example demonstrates:
//! - Connecting to the host endpoint given on the command line
//! - Starting the dispatcher with a bounded handler pool
//! - Running until the host sends `shutdown` or closes the connection
//!
//! # Running
//!
//! ```text
//! RUST_LOG=kernel_link=debug cargo run --example kernel -- tcp://127.0.0.1:9000
//! ```
//!
//! A bare port number connects to that port on localhost.

use std::sync::Arc;

use kernel_link::transport::{self, Endpoint};
use kernel_link::{Dispatcher, MemoryKernel};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout belongs to whatever the kernel prints
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let endpoint: Endpoint = std::env::args()
        .nth(1)
        .ok_or("usage: kernel <tcp://host:port | unix:/path | port>")?
        .parse()?;

    tracing::info!(%endpoint, pid = std::process::id(), "connecting to host");
    let (reader, writer) = transport::connect(&endpoint).await?;

    let dispatcher = Dispatcher::builder()
        .max_concurrent_handlers(4)
        .start(reader, writer, Arc::new(MemoryKernel::new()));

    dispatcher.run().await?;
    tracing::info!("kernel stopped");

    Ok(())
}
