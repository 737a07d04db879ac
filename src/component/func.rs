//! Exported component functions and the instances that own them.

use super::store::{HostState, StoreMemory};
use crate::abi::{
    self, Context, CoreSignature, FlatType, FuncSignature, InterfaceType, LowerContext, Val,
};
use crate::concurrent::{ComponentInstanceIndex, Concurrent};
use crate::error::{GuestError, LinkError, ProtocolError};
use anyhow::{Context as _, Result, anyhow};
use indexmap::IndexMap;
use std::sync::{Arc, Mutex};
use wasmtime::{AsContextMut, Store};

pub(crate) struct InstanceInner {
    pub store: Mutex<Store<HostState>>,
    pub concurrent: Concurrent,
    pub index: ComponentInstanceIndex,
}

/// An instantiated component.
pub struct Instance {
    inner: Arc<InstanceInner>,
    exports: Exports,
}

impl Instance {
    pub(crate) fn new(inner: Arc<InstanceInner>, exports: Exports) -> Instance {
        Instance { inner, exports }
    }

    pub fn exports(&self) -> &Exports {
        &self.exports
    }

    pub fn into_exports(self) -> Exports {
        self.exports
    }

    /// This instance's index in its runtime's concurrent state.
    pub fn index(&self) -> ComponentInstanceIndex {
        self.inner.index
    }

    pub fn concurrent(&self) -> &Concurrent {
        &self.inner.concurrent
    }
}

/// The functions exported by an instance, keyed by name.
#[derive(Clone, Default)]
pub struct Exports {
    funcs: IndexMap<String, Func>,
}

impl Exports {
    pub(crate) fn insert(&mut self, name: String, func: Func) {
        self.funcs.insert(name, func);
    }

    pub fn get(&self, name: &str) -> Option<&Func> {
        self.funcs.get(name)
    }

    /// Like [`Exports::get`], failing for unknown names.
    pub fn func(&self, name: &str) -> Result<&Func> {
        self.get(name)
            .ok_or_else(|| anyhow!("component has no export named `{name}`"))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.funcs.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }
}

/// A lifted guest export.
#[derive(Clone)]
pub struct Func {
    inner: Arc<FuncInner>,
}

struct FuncInner {
    instance: Arc<InstanceInner>,
    name: String,
    signature: FuncSignature,
    param_types: Vec<InterfaceType>,
    core: CoreSignature,
    func: wasmtime::Func,
    post_return: Option<wasmtime::Func>,
}

impl Func {
    pub(crate) fn new(
        instance: Arc<InstanceInner>,
        name: String,
        signature: FuncSignature,
        func: wasmtime::Func,
        post_return: Option<wasmtime::Func>,
    ) -> Func {
        let core = signature.core(Context::Lift);
        let param_types = signature.params.iter().map(|(_, ty)| ty.clone()).collect();
        Func {
            inner: Arc::new(FuncInner {
                instance,
                name,
                signature,
                param_types,
                core,
                func,
                post_return,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn signature(&self) -> &FuncSignature {
        &self.inner.signature
    }

    /// Calls the export with `args`.
    ///
    /// Calls into one instance are serialized by its exclusive lock and
    /// served in arrival order. If the export returns a `result`, its `ok`
    /// payload is returned and its `err` case becomes a [`GuestError`].
    ///
    /// An error other than a [`GuestError`] leaves the instance unable to
    /// be entered again.
    pub async fn call(&self, args: &[Val]) -> Result<Option<Val>> {
        let instance = &self.inner.instance;
        instance.concurrent.exclusive_lock(instance.index).await?;
        let result = self.call_locked(args);
        instance.concurrent.exclusive_release(instance.index)?;
        let result = result.with_context(|| format!("failed to call `{}`", self.inner.name))?;

        match result {
            Some(Val::Result(Ok(ok))) => Ok(ok.map(|v| *v)),
            Some(Val::Result(Err(payload))) => Err(GuestError {
                payload: payload.map(|v| *v),
            }
            .into()),
            other => Ok(other),
        }
    }

    fn call_locked(&self, args: &[Val]) -> Result<Option<Val>> {
        let inner = &*self.inner;
        let instance = &inner.instance;
        let index = instance.index;
        let concurrent = &instance.concurrent;
        if args.len() != inner.param_types.len() {
            return Err(LinkError::ArgumentCount {
                name: inner.name.clone(),
                expected: inner.param_types.len(),
                got: args.len(),
            }
            .into());
        }
        let mut store = instance.store.lock().map_err(|_| ProtocolError::Poisoned)?;

        let task = concurrent.with(|s| {
            if !s.instance(index)?.flags().may_enter {
                return Err(ProtocolError::CannotEnter(index).into());
            }
            s.set_may_enter(index, false)?;
            s.start_task(index, false, &inner.name)
        })?;

        concurrent.with(|s| s.set_may_leave(index, false))?;
        let params = {
            let mut memory = StoreMemory::new(store.as_context_mut());
            let mut cx = LowerContext::new(&mut memory);
            if inner.core.params_indirect {
                let tuple = Val::Tuple(args.to_vec());
                let ptr = abi::store_new(&mut cx, &inner.signature.params_tuple(), &tuple)?;
                vec![wasmtime::Val::I32(ptr as i32)]
            } else {
                abi::lower_flat(&mut cx, &inner.param_types, args)?
            }
        };
        concurrent.with(|s| s.set_may_leave(index, true))?;

        let mut results = inner
            .core
            .results
            .iter()
            .map(|ty| match ty {
                FlatType::I32 => wasmtime::Val::I32(0),
                FlatType::I64 => wasmtime::Val::I64(0),
                FlatType::F32 => wasmtime::Val::F32(0),
                FlatType::F64 => wasmtime::Val::F64(0),
            })
            .collect::<Vec<_>>();
        tracing::trace!(export = %inner.name, task = %task, "calling guest");
        inner.func.call(&mut *store, &params, &mut results)?;

        concurrent.with(|s| s.set_may_leave(index, false))?;
        let ret = match &inner.signature.result {
            None => None,
            Some(ty) => {
                let memory = StoreMemory::new(store.as_context_mut());
                let cx = memory.lift_context();
                Some(if inner.core.results_indirect {
                    let ptr = results
                        .first()
                        .and_then(|v| v.i32())
                        .ok_or_else(|| anyhow!("expected a return pointer"))?;
                    abi::load(&cx, ty, ptr as u32)?
                } else {
                    abi::lift_flat(&cx, std::slice::from_ref(ty), &results)?.remove(0)
                })
            }
        };
        if let Some(post_return) = &inner.post_return {
            concurrent.with(|s| s.set_needs_post_return(index, true))?;
            post_return.call(&mut *store, &results, &mut [])?;
            concurrent.with(|s| s.set_needs_post_return(index, false))?;
        }

        concurrent.with(|s| {
            s.set_may_leave(index, true)?;
            s.resolve_task(task, ret.iter().cloned().collect())?;
            s.exit_task(task)?;
            s.end_task(index, Some(task))?;
            s.set_may_enter(index, true)
        })?;
        Ok(ret)
    }
}
