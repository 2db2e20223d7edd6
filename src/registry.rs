//! # Handler Registry
//!
//! Maps each event type to an ordered group of named handlers. Registration
//! is explicit; there is no reflection or discovery.
//!
//! Two absence cases are deliberately distinct:
//!
//! - **No group at all** for an event's type is a caller error. The
//!   processor poisons such events (jumps their error count straight to the
//!   retry ceiling) so they surface in the terminal-failure path instead of
//!   burning retries.
//! - **An empty group** (declared type, zero handlers) is valid: the event
//!   completes immediately with no side effects.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::handler::EventHandler;

/// A handler registered under a stable name within a group.
#[derive(Clone)]
pub struct RegisteredHandler {
    pub name: String,
    pub handler: Arc<dyn EventHandler>,
}

/// Ordered collection of named handlers for one event type.
#[derive(Clone, Default)]
pub struct HandlerGroup {
    handlers: Vec<RegisteredHandler>,
}

impl HandlerGroup {
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredHandler> {
        self.handlers.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.iter().map(|h| h.name.as_str())
    }
}

/// Registry of handler groups keyed by event type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    groups: HashMap<String, HandlerGroup>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an event type with no handlers. Events of this type complete
    /// immediately. Registering a handler later upgrades the group in place.
    pub fn declare_type(mut self, event_type: impl Into<String>) -> Self {
        self.groups.entry(event_type.into()).or_default();
        self
    }

    /// Register a handler under `name` for `event_type`. Re-registering the
    /// same name replaces the previous handler and keeps its position.
    pub fn register(
        mut self,
        event_type: impl Into<String>,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        let event_type = event_type.into();
        let name = name.into();
        let group = self.groups.entry(event_type.clone()).or_default();

        if let Some(existing) = group.handlers.iter_mut().find(|h| h.name == name) {
            warn!(
                event_type = %event_type,
                handler = %name,
                "replacing previously registered handler"
            );
            existing.handler = handler;
        } else {
            group.handlers.push(RegisteredHandler { name, handler });
        }
        self
    }

    /// The handler group for an event type; `None` means the type is
    /// unrecognized (not merely empty).
    pub fn group(&self, event_type: &str) -> Option<&HandlerGroup> {
        self.groups.get(event_type)
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(|k| k.as_str())
    }
}
