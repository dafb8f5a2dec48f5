use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::device::DeviceConnector;
use crate::error::{ProcessError, Result};
use crate::handle::ProcessHandle;
use crate::properties::is_placeholder_name;

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Bound on one [`ProcessNameResolver::retrieve`] call.
    pub timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

/// Resolves a readable name for a process that may still be starting.
///
/// The name collected over DDMS wins when present. Otherwise the OS view is
/// polled until the same value is read twice in a row.
pub struct ProcessNameResolver {
    handle: ProcessHandle,
    connector: Arc<dyn DeviceConnector>,
    config: ResolverConfig,
}

impl ProcessNameResolver {
    pub fn new(handle: ProcessHandle, connector: Arc<dyn DeviceConnector>) -> Self {
        Self {
            handle,
            connector,
            config: ResolverConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ResolverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Resolve the name, allowing `max_retries` stable-but-unusable reads or
    /// read errors. Reads that differ from the previous one are free.
    pub async fn retrieve(&self, max_retries: u32, retry_delay: Duration) -> Result<String> {
        let timeout = self.config.timeout;
        tokio::select! {
            biased;
            _ = self.handle.scope().cancelled() => Err(ProcessError::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(ProcessError::Timeout(timeout)),
            name = self.poll(max_retries, retry_delay) => name,
        }
    }

    async fn poll(&self, max_retries: u32, retry_delay: Duration) -> Result<String> {
        let pid = self.handle.pid();
        let mut properties = self.handle.subscribe_properties();
        let mut previous: Option<String> = None;
        let mut retries = 0u32;
        loop {
            let collected = properties
                .borrow_and_update()
                .process_name
                .clone()
                .filter(|name| !is_placeholder_name(name));
            if let Some(name) = collected {
                debug!(pid, %name, "process name from ddms");
                return Ok(name);
            }

            let failure = match self.connector.read_process_name(pid).await {
                Ok(read) => {
                    let name = read.unwrap_or_default();
                    if previous.as_deref() != Some(name.as_str()) {
                        trace!(pid, %name, "process name still changing");
                        previous = Some(name);
                        None
                    } else if is_placeholder_name(&name) {
                        Some(format!("process name is still '{name}'"))
                    } else {
                        debug!(pid, %name, "process name from os");
                        return Ok(name);
                    }
                }
                Err(err) => {
                    previous = None;
                    Some(err.to_string())
                }
            };

            if let Some(last) = failure {
                retries += 1;
                if retries > max_retries {
                    return Err(ProcessError::RetriesExhausted {
                        pid,
                        attempts: retries,
                        last,
                    });
                }
                trace!(pid, retries, %last, "process name not available yet");
            }

            tokio::select! {
                _ = tokio::time::sleep(retry_delay) => {}
                _ = properties.changed() => {}
            }
        }
    }
}
