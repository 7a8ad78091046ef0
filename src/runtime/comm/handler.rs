//! Remote handler registry.
//!
//! Closures cannot cross a domain boundary. Work started on another domain
//! names a handler registered here before launch, and passes its arguments
//! as opaque bytes.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::runtime::domain::ExecutionDomain;
use crate::runtime::errors::TaskResult;
use crate::runtime::scheduler::TaskContext;

/// A remotely invocable function.
pub type Handler = Arc<dyn Fn(&ExecutionDomain, &TaskContext, &[u8]) -> TaskResult + Send + Sync>;

/// Index of a handler in the registry. Identical on every domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u32);

/// Name → handler table shared by every domain of a cluster.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: IndexMap<String, Handler>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_list().entries(self.handlers.keys()).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing a previous registration
    /// with the same name (its id stays the same).
    pub fn register<F>(
        &mut self,
        name: impl Into<String>,
        handler: F,
    ) -> HandlerId
    where
        F: Fn(&ExecutionDomain, &TaskContext, &[u8]) -> TaskResult + Send + Sync + 'static,
    {
        let (index, _) = self.handlers.insert_full(name.into(), Arc::new(handler));
        HandlerId(index as u32)
    }

    /// Look up a handler id by name.
    pub fn id(
        &self,
        name: &str,
    ) -> Option<HandlerId> {
        self.handlers.get_index_of(name).map(|index| HandlerId(index as u32))
    }

    pub fn get(
        &self,
        id: HandlerId,
    ) -> Option<&Handler> {
        self.handlers.get_index(id.0 as usize).map(|(_, handler)| handler)
    }

    pub fn name(
        &self,
        id: HandlerId,
    ) -> Option<&str> {
        self.handlers.get_index(id.0 as usize).map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
