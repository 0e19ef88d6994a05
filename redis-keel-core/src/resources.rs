//! Shared client-wide resources

use std::sync::Arc;

/// Client-wide resources threaded into every connection.
///
/// A single `ClientResources` value can back any number of clients and
/// endpoints; it replaces process-global state with an explicit handle.
#[derive(Debug, Clone)]
pub struct ClientResources {
    inner: Arc<ResourcesInner>,
}

#[derive(Debug)]
struct ResourcesInner {
    event_bus_capacity: usize,
}

impl Default for ClientResources {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ClientResources {
    /// Start building a resources value.
    pub fn builder() -> ClientResourcesBuilder {
        ClientResourcesBuilder {
            event_bus_capacity: 128,
        }
    }

    /// Capacity of each endpoint's connection-event channel.
    pub fn event_bus_capacity(&self) -> usize {
        self.inner.event_bus_capacity
    }
}

/// Builder for [`ClientResources`].
#[derive(Debug)]
pub struct ClientResourcesBuilder {
    event_bus_capacity: usize,
}

impl ClientResourcesBuilder {
    /// Set the capacity of each endpoint's connection-event channel.
    /// Slow event consumers observe lag once the channel wraps.
    pub fn event_bus_capacity(mut self, capacity: usize) -> Self {
        self.event_bus_capacity = capacity.max(1);
        self
    }

    /// Finish the builder.
    pub fn build(self) -> ClientResources {
        ClientResources {
            inner: Arc::new(ResourcesInner {
                event_bus_capacity: self.event_bus_capacity,
            }),
        }
    }
}
