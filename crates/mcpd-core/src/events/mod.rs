//! Canonical event union for the registry subsystem.
//!
//! Events are serialized with a `type` tag so host adapters (IPC, SSE,
//! logging sinks) can forward them verbatim.

use serde::{Deserialize, Serialize};

use crate::domain::{CollectionId, ConnectionState, McpCacheState};

/// Events emitted across the registry subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    /// A collection became visible.
    CollectionRegistered {
        #[serde(rename = "collectionId")]
        collection_id: CollectionId,
        label: String,
    },

    /// A collection was removed.
    CollectionRemoved {
        #[serde(rename = "collectionId")]
        collection_id: CollectionId,
    },

    /// A server connection changed state.
    ConnectionStateChanged {
        #[serde(rename = "definitionId")]
        definition_id: String,
        state: ConnectionState,
    },

    /// A server's cache freshness changed.
    CacheStateChanged {
        #[serde(rename = "definitionId")]
        definition_id: String,
        state: McpCacheState,
    },

    /// A server's published tool set changed.
    ToolsChanged {
        #[serde(rename = "definitionId")]
        definition_id: String,
        count: usize,
    },

    /// A server failed in a way worth surfacing.
    ServerError {
        #[serde(rename = "definitionId")]
        definition_id: String,
        label: String,
        error: String,
    },
}

/// Sink for registry events.
pub trait RegistryEventEmitter: Send + Sync {
    fn emit(&self, event: RegistryEvent);
}

/// Emitter that drops all events; for tests and CLI contexts.
#[derive(Debug, Default)]
pub struct NoopEmitter;

impl NoopEmitter {
    pub const fn new() -> Self {
        Self
    }
}

impl RegistryEventEmitter for NoopEmitter {
    fn emit(&self, _event: RegistryEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = RegistryEvent::ConnectionStateChanged {
            definition_id: "time".to_string(),
            state: ConnectionState::Running,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"connection_state_changed\""));
        assert!(json.contains("\"definitionId\":\"time\""));
    }

    #[test]
    fn test_noop_emitter_is_object_safe() {
        let emitter: Box<dyn RegistryEventEmitter> = Box::new(NoopEmitter::new());
        emitter.emit(RegistryEvent::CollectionRemoved {
            collection_id: CollectionId::new("x"),
        });
    }
}
