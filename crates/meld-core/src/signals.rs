//! Catalog signal bus.
//!
//! Backends announce schema/table lifecycle changes as typed events. A
//! [`SignalBus`] lives inside each warehouse session: built-in catalog
//! handlers are registered when the session is constructed and go away when
//! it is dropped, so nested sessions never double-fire a handler.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::warn;

use crate::error::CoreError;
use crate::handle::TableHandle;

/// The kinds of catalog events a backend can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    SchemaCreate,
    SchemaDrop,
    TableCreate,
    TableDrop,
    TableRename,
    /// Advisory: fired after a load or refresh completes. No built-in
    /// subscriber.
    TableLoaded,
}

/// A catalog event with its full argument set.
///
/// The argument schema of each signal is fixed by its variant shape, so a
/// signal can never be fired with missing or extra arguments.
#[derive(Debug, Clone)]
pub enum SignalEvent {
    SchemaCreate { schema: String },
    SchemaDrop { schema: String },
    TableCreate { table: TableHandle },
    TableDrop { table: TableHandle },
    TableRename { old: TableHandle, new: TableHandle },
    TableLoaded { table: TableHandle },
}

impl SignalEvent {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalEvent::SchemaCreate { .. } => SignalKind::SchemaCreate,
            SignalEvent::SchemaDrop { .. } => SignalKind::SchemaDrop,
            SignalEvent::TableCreate { .. } => SignalKind::TableCreate,
            SignalEvent::TableDrop { .. } => SignalKind::TableDrop,
            SignalEvent::TableRename { .. } => SignalKind::TableRename,
            SignalEvent::TableLoaded { .. } => SignalKind::TableLoaded,
        }
    }
}

/// A subscriber to catalog events.
#[async_trait]
pub trait SignalHandler: Send + Sync {
    async fn handle(&self, event: &SignalEvent) -> Result<(), CoreError>;
}

/// Dispatches events to registered handlers.
///
/// Emission is best-effort: a failing handler logs a warning and never
/// propagates, because catalog bookkeeping must not roll back the primary
/// data operation that triggered the event.
#[derive(Default)]
pub struct SignalBus {
    handlers: RwLock<Vec<(SignalKind, Arc<dyn SignalHandler>)>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind.
    pub fn on(&self, kind: SignalKind, handler: Arc<dyn SignalHandler>) {
        self.handlers.write().unwrap().push((kind, handler));
    }

    /// Register a handler for every lifecycle event kind (not TableLoaded).
    pub fn on_lifecycle(&self, handler: Arc<dyn SignalHandler>) {
        for kind in [
            SignalKind::SchemaCreate,
            SignalKind::SchemaDrop,
            SignalKind::TableCreate,
            SignalKind::TableDrop,
            SignalKind::TableRename,
        ] {
            self.on(kind, handler.clone());
        }
    }

    pub async fn emit(&self, event: SignalEvent) {
        let matching: Vec<Arc<dyn SignalHandler>> = {
            let handlers = self.handlers.read().unwrap();
            handlers
                .iter()
                .filter(|(kind, _)| *kind == event.kind())
                .map(|(_, h)| h.clone())
                .collect()
        };
        for handler in matching {
            if let Err(e) = handler.handle(&event).await {
                warn!("signal handler failed for {:?}: {}", event.kind(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    #[async_trait]
    impl SignalHandler for Counter {
        async fn handle(&self, _event: &SignalEvent) -> Result<(), CoreError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl SignalHandler for Failing {
        async fn handle(&self, _event: &SignalEvent) -> Result<(), CoreError> {
            Err(CoreError::Backend("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn test_emit_reaches_matching_handlers_only() {
        let bus = SignalBus::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        bus.on(SignalKind::TableCreate, counter.clone());

        let table = TableHandle::parse("sales.orders").unwrap();
        bus.emit(SignalEvent::TableCreate { table: table.clone() }).await;
        bus.emit(SignalEvent::TableDrop { table }).await;

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_others() {
        let bus = SignalBus::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        bus.on(SignalKind::SchemaCreate, Arc::new(Failing));
        bus.on(SignalKind::SchemaCreate, counter.clone());

        bus.emit(SignalEvent::SchemaCreate {
            schema: "sales".to_string(),
        })
        .await;

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
