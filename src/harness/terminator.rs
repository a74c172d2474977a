use crate::domain::ProcessTerminator;
use async_trait::async_trait;
use heim::process::{self, os::unix::ProcessExt, os::unix::Signal};
use tracing::error;

/// Sends SIGTERM to the current process, relying on a supervisor to restart it
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalTerminator;

#[async_trait]
impl ProcessTerminator for SignalTerminator {
    async fn terminate(&self, reason: &str) {
        let pid = std::process::id();
        error!(pid, reason, "Sending SIGTERM to own process");

        match process::get(pid as i32).await {
            Ok(process) => {
                if let Err(e) = process.signal(Signal::Term).await {
                    error!("Failed to send SIGTERM to own process: {}", e);
                }
            }
            Err(e) => error!("Failed to look up own process: {}", e),
        }
    }
}
