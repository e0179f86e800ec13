//! Server configuration.

/// Configuration for the in-memory record store.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Container identifier reported in notifications.
    pub container_id: String,
    /// Maximum number of changes per change-feed page.
    pub page_size: usize,
    /// Capacity of the notification channel.
    pub notification_capacity: usize,
}

impl ServerConfig {
    /// Creates a configuration for a container.
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            page_size: 200,
            notification_capacity: 64,
        }
    }

    /// Sets the change-feed page size (at least 1).
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Sets the notification channel capacity.
    pub fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity.max(1);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("iCloud.com.example.cloudstore")
    }
}
