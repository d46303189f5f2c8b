//! Method and publication registry.
//!
//! The registry is filled while the server is assembled and frozen behind an
//! `Arc` once it starts serving. Names are write-once: registering a name a
//! second time is an error and leaves the first handler in place.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use ddp_core::{Cursors, MethodError, Value};
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::errors::RegistryError;

/// Eventual result of an asynchronous method.
pub type PendingResult = BoxFuture<'static, Result<Value, MethodError>>;

/// What a method handler produced when called.
pub enum MethodOutcome {
    /// Finished during the call.
    Ready(Result<Value, MethodError>),
    /// Still running; resolves later.
    Pending(PendingResult),
}

impl MethodOutcome {
    /// Immediate success.
    pub fn ok(value: impl Into<Value>) -> Self {
        Self::Ready(Ok(value.into()))
    }

    /// Immediate failure.
    pub fn err(error: impl Into<MethodError>) -> Self {
        Self::Ready(Err(error.into()))
    }

    /// Result delivered when `future` completes.
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, MethodError>> + Send + 'static,
    {
        Self::Pending(future.boxed())
    }
}

impl fmt::Debug for MethodOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(result) => f.debug_tuple("Ready").field(result).finish(),
            Self::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

impl From<Result<Value, MethodError>> for MethodOutcome {
    fn from(result: Result<Value, MethodError>) -> Self {
        Self::Ready(result)
    }
}

/// A remote procedure.
pub trait Method: Send + Sync {
    /// Run with positional arguments.
    fn invoke(&self, params: Vec<Value>) -> MethodOutcome;
}

impl<F> Method for F
where
    F: Fn(Vec<Value>) -> MethodOutcome + Send + Sync,
{
    fn invoke(&self, params: Vec<Value>) -> MethodOutcome {
        self(params)
    }
}

/// A named data set clients subscribe to.
pub trait Publication: Send + Sync {
    /// Open the cursors for a subscription.
    fn publish(&self, params: Vec<Value>) -> Result<Cursors, MethodError>;
}

impl<F> Publication for F
where
    F: Fn(Vec<Value>) -> Result<Cursors, MethodError> + Send + Sync,
{
    fn publish(&self, params: Vec<Value>) -> Result<Cursors, MethodError> {
        self(params)
    }
}

/// Wrap a synchronous function as a [`Method`].
pub fn sync_method<F>(f: F) -> impl Method
where
    F: Fn(Vec<Value>) -> Result<Value, MethodError> + Send + Sync,
{
    move |params: Vec<Value>| MethodOutcome::Ready(f(params))
}

/// Wrap an async function as a [`Method`].
pub fn async_method<F, Fut>(f: F) -> impl Method
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, MethodError>> + Send + 'static,
{
    move |params: Vec<Value>| MethodOutcome::pending(f(params))
}

/// Wrap a function as a [`Publication`].
pub fn publication<F>(f: F) -> impl Publication
where
    F: Fn(Vec<Value>) -> Result<Cursors, MethodError> + Send + Sync,
{
    f
}

/// Registry mapping names to methods and publications.
#[derive(Default)]
pub struct Registry {
    methods: HashMap<String, Arc<dyn Method>>,
    publications: HashMap<String, Arc<dyn Publication>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method under a fresh name.
    pub fn register_method(
        &mut self,
        name: &str,
        method: impl Method + 'static,
    ) -> Result<(), RegistryError> {
        self.insert_method(name.to_owned(), Arc::new(method))
    }

    /// Register several methods in order, stopping at the first duplicate.
    ///
    /// Entries before the duplicate stay registered.
    pub fn register_methods<N: Into<String>>(
        &mut self,
        methods: impl IntoIterator<Item = (N, Arc<dyn Method>)>,
    ) -> Result<(), RegistryError> {
        for (name, method) in methods {
            self.insert_method(name.into(), method)?;
        }
        Ok(())
    }

    fn insert_method(&mut self, name: String, method: Arc<dyn Method>) -> Result<(), RegistryError> {
        if self.methods.contains_key(&name) {
            return Err(RegistryError::DuplicateMethod(name));
        }
        let _ = self.methods.insert(name, method);
        Ok(())
    }

    /// Register a publication under a fresh name.
    pub fn register_publication(
        &mut self,
        name: &str,
        publication: impl Publication + 'static,
    ) -> Result<(), RegistryError> {
        self.insert_publication(name.to_owned(), Arc::new(publication))
    }

    /// Register several publications in order, stopping at the first
    /// duplicate.
    pub fn register_publications<N: Into<String>>(
        &mut self,
        publications: impl IntoIterator<Item = (N, Arc<dyn Publication>)>,
    ) -> Result<(), RegistryError> {
        for (name, publication) in publications {
            self.insert_publication(name.into(), publication)?;
        }
        Ok(())
    }

    fn insert_publication(
        &mut self,
        name: String,
        publication: Arc<dyn Publication>,
    ) -> Result<(), RegistryError> {
        if self.publications.contains_key(&name) {
            return Err(RegistryError::DuplicatePublication(name));
        }
        let _ = self.publications.insert(name, publication);
        Ok(())
    }

    /// Look up a method.
    pub fn method(&self, name: &str) -> Option<Arc<dyn Method>> {
        self.methods.get(name).cloned()
    }

    /// Look up a publication.
    pub fn publication(&self, name: &str) -> Option<Arc<dyn Publication>> {
        self.publications.get(name).cloned()
    }

    /// List all registered method names (sorted).
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    /// List all registered publication names (sorted).
    pub fn publication_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.publications.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered methods.
    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    /// Number of registered publications.
    pub fn publication_count(&self) -> usize {
        self.publications.len()
    }

    /// Check whether a method is registered.
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Check whether a publication is registered.
    pub fn has_publication(&self, name: &str) -> bool {
        self.publications.contains_key(name)
    }
}
