//! Lifecycle trait shared by the producer and consumer orchestrators.

use anyhow::Result;
use async_trait::async_trait;

/// A long-running pipeline component.
///
/// Workers are driven one at a time by the runner, so only `Send` is
/// required.
#[async_trait]
pub trait Worker: Send {
    /// Human-readable worker name.
    fn name(&self) -> &str;
    /// Spawn the worker's tasks and return once they are running.
    async fn start(&mut self) -> Result<()>;
    /// Signal every loop to stop and wait for the tasks to wind down.
    async fn stop(&mut self) -> Result<()>;
}
