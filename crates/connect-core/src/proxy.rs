// # Reverse Proxy Implementations
//
// - `CommandReverseProxy`: runs a reload command (e.g. `nginx -s reload`)
// - `NoopReverseProxy`: logs and does nothing, for hosts without a proxy

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::traits::ReverseProxy;

/// Reloads the reverse proxy by running a command
#[derive(Debug, Clone)]
pub struct CommandReverseProxy {
    program: String,
    args: Vec<String>,
}

impl CommandReverseProxy {
    /// Create from a program and its arguments
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Parse a whitespace-separated command line
    pub fn from_command_line(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| Error::config("Proxy reload command cannot be empty"))?;
        Ok(Self::new(program, parts.collect()))
    }
}

#[async_trait]
impl ReverseProxy for CommandReverseProxy {
    async fn reload(&self) -> Result<()> {
        tracing::debug!(program = %self.program, "Reloading reverse proxy");

        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .await
            .map_err(|e| Error::proxy(format!("Failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::proxy(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        tracing::info!("Reverse proxy reloaded");
        Ok(())
    }
}

/// Reverse proxy that only logs reload requests
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReverseProxy;

#[async_trait]
impl ReverseProxy for NoopReverseProxy {
    async fn reload(&self) -> Result<()> {
        tracing::info!("Reverse proxy reload requested (no reload command configured)");
        Ok(())
    }
}
