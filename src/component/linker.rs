//! Linking a component's core modules into a running instance.
//!
//! Instantiation happens in three stages:
//!
//! 1. The implementation module, whose imports may only name host imports
//!    (`interface::name`), each satisfied by a trampoline.
//! 2. The main module. An import that names a host import is wired to the
//!    implementation module's shim export when the import has one, and to
//!    the trampoline otherwise. Any other import is looked up by name among
//!    the implementation module's exports. Once instantiated, its memory and
//!    realloc exports are recorded for lifting and lowering.
//! 3. The fixups module. Imports named after an import's index are
//!    trampolines; everything else is looked up by name among the exports of
//!    the implementation module and then the main module.
//!
//! No instance is returned unless all three stages succeed.

use super::descriptor::ComponentDescriptor;
use super::func::{Exports, Func, Instance, InstanceInner};
use super::host::HostImports;
use super::store::HostState;
use super::trampoline::Trampoline;
use crate::concurrent::Concurrent;
use crate::config::RuntimeConfig;
use crate::error::LinkError;
use crate::loader::ModuleResolver;
use anyhow::{Context as _, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use wasmtime::{Engine, Extern, Module, Store};

/// Compiles, caches and instantiates components.
///
/// All instances created by one runtime share its [`Concurrent`] state.
pub struct Runtime {
    engine: Engine,
    config: RuntimeConfig,
    concurrent: Concurrent,
    modules: Mutex<HashMap<String, Module>>,
}

impl Runtime {
    pub fn new(config: &RuntimeConfig) -> Result<Runtime> {
        let engine = Engine::new(&config.engine_config())?;
        Ok(Runtime {
            engine,
            config: config.clone(),
            concurrent: Concurrent::new(),
            modules: Mutex::new(HashMap::new()),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn concurrent(&self) -> &Concurrent {
        &self.concurrent
    }

    /// Resolves `name`, reusing a module compiled earlier under that name.
    async fn module(&self, resolver: &dyn ModuleResolver, name: &str) -> Result<Module> {
        if let Some(module) = self.cached(name)? {
            return Ok(module);
        }
        let module = resolver.resolve(&self.engine, name).await?;
        let mut modules = self
            .modules
            .lock()
            .map_err(|_| anyhow::anyhow!("module cache poisoned"))?;
        Ok(modules.entry(name.to_string()).or_insert(module).clone())
    }

    fn cached(&self, name: &str) -> Result<Option<Module>> {
        let modules = self
            .modules
            .lock()
            .map_err(|_| anyhow::anyhow!("module cache poisoned"))?;
        Ok(modules.get(name).cloned())
    }

    /// Instantiates the component described by `descriptor`.
    pub async fn instantiate(
        &self,
        descriptor: &ComponentDescriptor,
        resolver: &dyn ModuleResolver,
        imports: &HostImports,
    ) -> Result<Instance> {
        descriptor.validate()?;
        let mut hosts = Vec::with_capacity(descriptor.imports.len());
        for import in descriptor.imports.iter() {
            let host = imports.get(&import.interface, &import.name).ok_or_else(|| {
                LinkError::MissingHostImport {
                    interface: import.interface.clone(),
                    name: import.name.clone(),
                }
            })?;
            hosts.push(host.clone());
        }
        for (interface, name) in imports.names() {
            if descriptor.find_import(interface, name).is_none() {
                tracing::warn!(interface, name, "host import is not used by the component");
            }
        }

        let modules = &descriptor.modules;
        let implementation = self.module(resolver, &modules.implementation).await?;
        let main = self.module(resolver, &modules.main).await?;
        let fixups = self.module(resolver, &modules.fixups).await?;

        let index = self.concurrent.with(|s| s.add_component_instance())?;
        let mut store = Store::new(
            &self.engine,
            HostState::new(self.concurrent.clone(), index, self.config.store_limits()),
        );
        store.limiter(|state| &mut state.limits);
        if let Some(fuel) = self.config.fuel {
            store.set_fuel(fuel)?;
        }

        let trampolines = descriptor
            .imports
            .iter()
            .zip(hosts)
            .map(|(import, host)| {
                Trampoline::new(
                    import.qualified_name(),
                    import.signature.clone(),
                    host,
                    import.is_async,
                )
                .into_func(&mut store)
            })
            .collect::<Vec<_>>();

        tracing::debug!(module = %modules.implementation, "instantiating implementation module");
        let externs = resolve_imports("implementation", &implementation, |module, name| {
            let i = descriptor.find_import(module, name)?;
            Some(trampolines[i].into())
        })?;
        let implementation_instance = wasmtime::Instance::new(&mut store, &implementation, &externs)
            .with_context(|| format!("failed to instantiate `{}`", modules.implementation))?;

        tracing::debug!(module = %modules.main, "instantiating main module");
        let externs = resolve_imports("main", &main, |module, name| {
            match descriptor.find_import(module, name) {
                Some(i) => match &descriptor.imports[i].shim_export {
                    Some(shim) => implementation_instance.get_export(&mut store, shim),
                    None => Some(trampolines[i].into()),
                },
                None => implementation_instance.get_export(&mut store, name),
            }
        })?;
        let main_instance = wasmtime::Instance::new(&mut store, &main, &externs)
            .with_context(|| format!("failed to instantiate `{}`", modules.main))?;

        let memory = main_instance.get_memory(&mut store, &descriptor.memory);
        let realloc = match main_instance.get_func(&mut store, &descriptor.realloc) {
            Some(func) => Some(
                func.typed::<(u32, u32, u32, u32), u32>(&store)
                    .with_context(|| format!("`{}` has the wrong type", descriptor.realloc))?,
            ),
            None => None,
        };
        tracing::trace!(
            memory = memory.is_some(),
            realloc = realloc.is_some(),
            "recorded main module exports"
        );
        store.data_mut().memory = memory;
        store.data_mut().realloc = realloc;

        tracing::debug!(module = %modules.fixups, "instantiating fixups module");
        let externs = resolve_imports("fixups", &fixups, |_, name| {
            if let Some(trampoline) = name.parse::<usize>().ok().and_then(|i| trampolines.get(i)) {
                return Some((*trampoline).into());
            }
            implementation_instance
                .get_export(&mut store, name)
                .or_else(|| main_instance.get_export(&mut store, name))
        })?;
        wasmtime::Instance::new(&mut store, &fixups, &externs)
            .with_context(|| format!("failed to instantiate `{}`", modules.fixups))?;

        let mut core_exports = Vec::with_capacity(descriptor.exports.len());
        for export in descriptor.exports.iter() {
            let func = main_instance
                .get_func(&mut store, &export.core_export)
                .ok_or_else(|| LinkError::MissingExport(export.core_export.clone()))?;
            let post_return = match &export.post_return {
                Some(name) => Some(
                    main_instance
                        .get_func(&mut store, name)
                        .ok_or_else(|| LinkError::MissingExport(name.clone()))?,
                ),
                None => None,
            };
            core_exports.push((export, func, post_return));
        }

        let inner = Arc::new(InstanceInner {
            store: Mutex::new(store),
            concurrent: self.concurrent.clone(),
            index,
        });
        let mut exports = Exports::default();
        for (export, func, post_return) in core_exports {
            exports.insert(
                export.name.clone(),
                Func::new(
                    inner.clone(),
                    export.name.clone(),
                    export.signature.clone(),
                    func,
                    post_return,
                ),
            );
        }
        tracing::debug!(%index, exports = exports.len(), "component instantiated");
        Ok(Instance::new(inner, exports))
    }
}

/// Instantiates a component in a fresh [`Runtime`] with the default
/// configuration and returns its exports.
pub async fn instantiate(
    descriptor: &ComponentDescriptor,
    resolver: &dyn ModuleResolver,
    imports: &HostImports,
) -> Result<Exports> {
    let runtime = Runtime::new(&RuntimeConfig::default())?;
    let instance = runtime.instantiate(descriptor, resolver, imports).await?;
    Ok(instance.into_exports())
}

fn resolve_imports(
    stage: &'static str,
    module: &Module,
    mut lookup: impl FnMut(&str, &str) -> Option<Extern>,
) -> Result<Vec<Extern>> {
    module
        .imports()
        .map(|import| {
            lookup(import.module(), import.name()).ok_or_else(|| {
                anyhow::Error::from(LinkError::UnresolvedImport {
                    stage,
                    module: import.module().to_string(),
                    name: import.name().to_string(),
                })
            })
        })
        .collect()
}
