//! Resolution of core module names to compiled modules.

use crate::error::LinkError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use wasmtime::{Engine, Module};

/// Maps the name of one of a component's core modules to a compiled module.
///
/// Unknown names fail with [`LinkError::UnknownModule`]. Closures of type
/// `Fn(&Engine, &str) -> Result<Module>` are resolvers too.
#[async_trait]
pub trait ModuleResolver: Send + Sync {
    async fn resolve(&self, engine: &Engine, name: &str) -> Result<Module>;
}

#[async_trait]
impl<F> ModuleResolver for F
where
    F: Fn(&Engine, &str) -> Result<Module> + Send + Sync,
{
    async fn resolve(&self, engine: &Engine, name: &str) -> Result<Module> {
        self(engine, name)
    }
}

/// Resolves modules from binaries (or text) held in memory.
#[derive(Default, Clone)]
pub struct BytesResolver {
    modules: HashMap<String, Vec<u8>>,
}

impl BytesResolver {
    pub fn new() -> BytesResolver {
        BytesResolver::default()
    }

    pub fn insert(&mut self, name: &str, bytes: impl Into<Vec<u8>>) -> &mut Self {
        self.modules.insert(name.to_string(), bytes.into());
        self
    }

    pub fn with(mut self, name: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(name, bytes);
        self
    }
}

#[async_trait]
impl ModuleResolver for BytesResolver {
    async fn resolve(&self, engine: &Engine, name: &str) -> Result<Module> {
        let bytes = self
            .modules
            .get(name)
            .ok_or_else(|| LinkError::UnknownModule(name.to_string()))?;
        Module::new(engine, bytes).with_context(|| format!("failed to compile module `{name}`"))
    }
}

/// Resolves a module name to the file of the same name in a directory.
#[derive(Debug, Clone)]
pub struct DirectoryResolver {
    dir: PathBuf,
}

impl DirectoryResolver {
    pub fn new(dir: impl Into<PathBuf>) -> DirectoryResolver {
        DirectoryResolver { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> Option<PathBuf> {
        // Only plain file names are valid module names.
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(std::path::Component::Normal(file)), None) => Some(self.dir.join(file)),
            _ => None,
        }
    }
}

#[async_trait]
impl ModuleResolver for DirectoryResolver {
    async fn resolve(&self, engine: &Engine, name: &str) -> Result<Module> {
        let path = self
            .path(name)
            .ok_or_else(|| LinkError::UnknownModule(name.to_string()))?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LinkError::UnknownModule(name.to_string()).into());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read `{}`", path.display()));
            }
        };
        tracing::debug!(module = name, path = %path.display(), "loaded module");
        Module::new(engine, &bytes).with_context(|| format!("failed to compile module `{name}`"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bytes_resolver() {
        let engine = Engine::default();
        let resolver = BytesResolver::new().with("a.wasm", "(module)");
        resolver.resolve(&engine, "a.wasm").await.unwrap();
        let err = resolver.resolve(&engine, "b.wasm").await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<LinkError>(),
            Some(&LinkError::UnknownModule("b.wasm".to_string()))
        );
    }

    #[tokio::test]
    async fn directory_resolver() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("core.wasm"), wat::parse_str("(module)").unwrap()).unwrap();
        let engine = Engine::default();
        let resolver = DirectoryResolver::new(dir.path());
        resolver.resolve(&engine, "core.wasm").await.unwrap();
        for name in ["missing.wasm", "../core.wasm", "sub/core.wasm", ""] {
            let err = resolver.resolve(&engine, name).await.unwrap_err();
            assert!(err.downcast_ref::<LinkError>().is_some(), "{name}");
        }
    }

    #[tokio::test]
    async fn closure_resolver() {
        let engine = Engine::default();
        let resolver = |engine: &Engine, name: &str| match name {
            "only" => Module::new(engine, "(module)"),
            _ => Err(LinkError::UnknownModule(name.to_string()).into()),
        };
        resolver.resolve(&engine, "only").await.unwrap();
        assert!(resolver.resolve(&engine, "other").await.is_err());
    }
}
