//! Type-tag to loader mapping.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::loader::composite::CompositeLoader;
use crate::loader::module::ModuleLoader;
use crate::loader::openapi::OpenApiLoader;
use crate::loader::remote::RemoteLoader;
use crate::loader::subprocess::SubprocessLoader;
use crate::loader::Loader;

type Constructor = Box<dyn Fn() -> Arc<dyn Loader> + Send + Sync>;

enum Binding {
    Ready(Arc<dyn Loader>),
    Lazy {
        construct: Constructor,
        instance: OnceLock<Arc<dyn Loader>>,
    },
}

impl Binding {
    fn resolve(&self) -> Arc<dyn Loader> {
        match self {
            Binding::Ready(loader) => loader.clone(),
            Binding::Lazy {
                construct,
                instance,
            } => instance.get_or_init(|| construct()).clone(),
        }
    }
}

/// Maps loader type tags to loaders. Registration is allowed at runtime.
#[derive(Default)]
pub struct LoaderFactory {
    bindings: RwLock<HashMap<String, Arc<Binding>>>,
}

impl LoaderFactory {
    /// Empty factory with no loaders.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with every built-in loader. The composite loader is registered
    /// lazily and holds a weak reference back to this factory.
    pub fn with_defaults() -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let factory = Self::new();
            factory.register("openapi", Arc::new(OpenApiLoader::new()));
            factory.register("subprocess", Arc::new(SubprocessLoader::new()));
            factory.register("remote", Arc::new(RemoteLoader::new()));
            factory.register("module", Arc::new(ModuleLoader::with_builtins()));
            let weak = weak.clone();
            factory.register_lazy("composite", move || -> Arc<dyn Loader> {
                Arc::new(CompositeLoader::new(weak.clone()))
            });
            factory
        })
    }

    /// Loader for `tag`, constructing a lazily registered one on first use.
    pub fn get_loader(&self, tag: &str) -> Option<Arc<dyn Loader>> {
        let binding = self
            .bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tag)
            .cloned()?;
        Some(binding.resolve())
    }

    /// Register `loader` under `tag`, replacing any previous binding.
    pub fn register(&self, tag: &str, loader: Arc<dyn Loader>) {
        tracing::debug!(kind = %tag, "registering loader");
        self.bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tag.to_string(), Arc::new(Binding::Ready(loader)));
    }

    /// Register a constructor that runs once, on the first `get_loader(tag)`.
    pub fn register_lazy<F>(&self, tag: &str, construct: F)
    where
        F: Fn() -> Arc<dyn Loader> + Send + Sync + 'static,
    {
        tracing::debug!(kind = %tag, "registering lazy loader");
        self.bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                tag.to_string(),
                Arc::new(Binding::Lazy {
                    construct: Box::new(construct),
                    instance: OnceLock::new(),
                }),
            );
    }

    /// Registered tags, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }
}
