//! Per-helper collection of running servers.

use std::time::Duration;

use crate::config::ValidationError;
use crate::server::{ServerError, ServerInfo, Title};

/// Servers of one helper, in registration order.
#[derive(Debug, Default)]
pub struct ServerRegistry {
    servers: Vec<ServerInfo>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a server. Titles are unique.
    pub fn register(&mut self, info: ServerInfo) -> Result<(), ValidationError> {
        if self.contains(&info.title) {
            return Err(ValidationError::DuplicateTitle(info.title.to_string()));
        }
        self.servers.push(info);
        Ok(())
    }

    pub fn contains(&self, title: &Title) -> bool {
        self.servers.iter().any(|s| &s.title == title)
    }

    pub fn get(&self, title: &str) -> Option<&ServerInfo> {
        self.servers.iter().find(|s| s.title.as_str() == title)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerInfo> {
        self.servers.iter()
    }

    pub fn each(&self, mut f: impl FnMut(&ServerInfo)) {
        for server in &self.servers {
            f(server);
        }
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn remove(&mut self, title: &str) -> Option<ServerInfo> {
        let index = self.servers.iter().position(|s| s.title.as_str() == title)?;
        Some(self.servers.remove(index))
    }

    /// Close every server in registration order. A failure is logged and
    /// the rest are still closed; the failures are returned.
    pub async fn shutdown_all(self, drain: Duration) -> Vec<ServerError> {
        let mut failures = Vec::new();
        for server in self.servers {
            if let Err(e) = server.handle.close(drain).await {
                tracing::error!(title = %server.title, error = %e, "Failed to close server");
                failures.push(e);
            }
        }
        failures
    }
}
