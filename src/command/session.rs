use super::transaction::TransactionContext;
use crate::core::errors::Result;
use crate::engine::EngineServices;
use async_trait::async_trait;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// Per-command resource opened lazily on first use.
///
/// Sessions are flushed in the order they were opened, after the command body
/// returned successfully, and closed whether or not the command failed.
#[async_trait]
pub trait Session: Any + Send {
    /// Push buffered work into the transaction
    async fn flush(&mut self, tx: &mut dyn TransactionContext) -> Result<()>;

    /// Release resources. Called exactly once per context.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Produces sessions of one concrete type
pub trait SessionFactory: Send + Sync {
    fn session_type(&self) -> TypeId;
    fn session_name(&self) -> &'static str;
    fn open(&self, services: &EngineServices) -> Box<dyn Session>;
}

struct FnSessionFactory<S, F> {
    open: F,
    _session: PhantomData<fn() -> S>,
}

impl<S, F> SessionFactory for FnSessionFactory<S, F>
where
    S: Session,
    F: Fn(&EngineServices) -> S + Send + Sync,
{
    fn session_type(&self) -> TypeId {
        TypeId::of::<S>()
    }

    fn session_name(&self) -> &'static str {
        std::any::type_name::<S>()
    }

    fn open(&self, services: &EngineServices) -> Box<dyn Session> {
        Box::new((self.open)(services))
    }
}

/// Build a factory from a constructor closure
pub fn session_factory<S, F>(open: F) -> Arc<dyn SessionFactory>
where
    S: Session,
    F: Fn(&EngineServices) -> S + Send + Sync + 'static,
{
    Arc::new(FnSessionFactory {
        open,
        _session: PhantomData,
    })
}

/// Session factories keyed by the session type they produce
#[derive(Default, Clone)]
pub struct SessionFactories {
    factories: HashMap<TypeId, Arc<dyn SessionFactory>>,
}

impl SessionFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. A later registration for the same type replaces the earlier one.
    pub fn register(&mut self, factory: Arc<dyn SessionFactory>) {
        self.factories.insert(factory.session_type(), factory);
    }

    pub fn get(&self, session_type: TypeId) -> Option<Arc<dyn SessionFactory>> {
        self.factories.get(&session_type).cloned()
    }

    pub fn contains<S: Session>(&self) -> bool {
        self.factories.contains_key(&TypeId::of::<S>())
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}
