//! Loader for in-process modules.
//!
//! Modules are registered ahead of time under `module:factory`. A server
//! config names the module, optionally the factory (default `create_app`)
//! and passes `options` to it.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::config::ServerConfig;
use crate::loader::{parse_settings, LoadError, LoadResult, Loader, StaticBackend};

const DEFAULT_FACTORY: &str = "create_app";

/// What a module factory hands back.
pub struct ModuleApp {
    pub name: String,
    /// Operations the module exposes, for capability reporting.
    pub operations: Vec<String>,
    pub router: Router,
}

/// Builds a module app from its options.
pub trait ModuleFactory: Send + Sync {
    fn create(&self, options: &serde_json::Value) -> Result<ModuleApp, String>;
}

impl<F> ModuleFactory for F
where
    F: Fn(&serde_json::Value) -> Result<ModuleApp, String> + Send + Sync,
{
    fn create(&self, options: &serde_json::Value) -> Result<ModuleApp, String> {
        self(options)
    }
}

#[derive(Debug, Deserialize)]
struct ModuleSettings {
    module: String,
    #[serde(default = "default_factory")]
    factory: String,
    #[serde(default)]
    options: serde_json::Value,
}

fn default_factory() -> String {
    DEFAULT_FACTORY.to_string()
}

fn factory_key(module: &str, factory: &str) -> String {
    format!("{}:{}", module, factory)
}

/// Loads `module` servers from registered factories.
#[derive(Default)]
pub struct ModuleLoader {
    factories: RwLock<HashMap<String, Arc<dyn ModuleFactory>>>,
}

impl ModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader with the built-in `echo` module registered.
    pub fn with_builtins() -> Self {
        let loader = Self::new();
        loader.register("echo", DEFAULT_FACTORY, echo_module);
        loader
    }

    /// Register `factory` under `module:name`, replacing any previous one.
    pub fn register(&self, module: &str, name: &str, factory: impl ModuleFactory + 'static) {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(factory_key(module, name), Arc::new(factory));
    }

    fn lookup(&self, module: &str, name: &str) -> Option<Arc<dyn ModuleFactory>> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&factory_key(module, name))
            .cloned()
    }
}

fn validate_module(app: &ModuleApp) -> Result<(), LoadError> {
    if app.name.trim().is_empty() {
        return Err(LoadError::configuration("module app has an empty name"));
    }
    if app.operations.is_empty() {
        return Err(LoadError::configuration(format!(
            "module app '{}' declares no operations",
            app.name
        )));
    }
    Ok(())
}

#[async_trait]
impl Loader for ModuleLoader {
    fn kind(&self) -> &str {
        "module"
    }

    async fn load(&self, config: &ServerConfig) -> LoadResult {
        let settings: ModuleSettings = match parse_settings(config) {
            Ok(s) => s,
            Err(e) => return LoadResult::failure(e),
        };
        let Some(factory) = self.lookup(&settings.module, &settings.factory) else {
            return LoadResult::failure(LoadError::configuration(format!(
                "no factory '{}' in module '{}'",
                settings.factory, settings.module
            )));
        };

        let app = match factory.create(&settings.options) {
            Ok(app) => app,
            Err(e) => {
                return LoadResult::failure(LoadError::configuration(format!(
                    "module '{}' factory '{}' failed: {}",
                    settings.module, settings.factory, e
                )));
            }
        };
        if let Err(e) = validate_module(&app) {
            return LoadResult::failure(e);
        }

        tracing::info!(
            server = %config.id,
            module = %settings.module,
            operations = app.operations.len(),
            "module app created"
        );

        let backend = StaticBackend::new(config.id.clone(), "module")
            .with_capability("operations", app.operations.len() as u64);
        LoadResult::success(Arc::new(backend), app.router)
            .with_info("module", settings.module)
            .with_info("factory", settings.factory)
            .with_info("name", app.name)
    }
}

/// Built-in module answering `GET /` and echoing `POST /echo` bodies.
fn echo_module(options: &serde_json::Value) -> Result<ModuleApp, String> {
    let greeting = match options.get("greeting") {
        None => "hello".to_string(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => return Err(format!("'greeting' must be a string, got {}", other)),
    };
    let router = Router::new()
        .route(
            "/",
            get(move || {
                let greeting = greeting.clone();
                async move { Json(serde_json::json!({ "module": "echo", "greeting": greeting })) }
            }),
        )
        .route(
            "/echo",
            post(|Json(body): Json<serde_json::Value>| async move { Json(body) }),
        );
    Ok(ModuleApp {
        name: "echo".to_string(),
        operations: vec!["greet".to_string(), "echo".to_string()],
        router,
    })
}
