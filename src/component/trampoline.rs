//! Core functions that adapt guest calls to host imports.

use super::host::HostFunc;
use super::store::{HostState, StoreMemory};
use crate::abi::{self, Context, CoreSignature, FuncSignature, InterfaceType, LowerContext, Val};
use crate::error::{AbiError, ProtocolError, Unsupported};
use anyhow::{Context as _, Result, anyhow};
use std::sync::Arc;
use wasmtime::{AsContextMut, Caller, Func, Store};

/// A lowered host import.
///
/// Each call runs as a synchronous subtask of whatever task is current in
/// the calling instance.
pub(crate) struct Trampoline {
    qualified_name: String,
    signature: FuncSignature,
    param_types: Vec<InterfaceType>,
    core: CoreSignature,
    host: HostFunc,
    is_async: bool,
}

impl Trampoline {
    pub fn new(
        qualified_name: String,
        signature: FuncSignature,
        host: HostFunc,
        is_async: bool,
    ) -> Trampoline {
        let core = signature.core(Context::Lower);
        let param_types = signature.params.iter().map(|(_, ty)| ty.clone()).collect();
        Trampoline {
            qualified_name,
            signature,
            param_types,
            core,
            host,
            is_async,
        }
    }

    pub fn into_func(self, store: &mut Store<HostState>) -> Func {
        let ty = self.core.func_type(store.engine());
        let this = Arc::new(self);
        Func::new(store, ty, move |caller, params, results| {
            this.call(caller, params, results)
        })
    }

    fn call(
        &self,
        mut caller: Caller<'_, HostState>,
        params: &[wasmtime::Val],
        results: &mut [wasmtime::Val],
    ) -> Result<()> {
        if self.is_async {
            return Err(Unsupported("calling an async-lowered import")).with_context(|| {
                format!("failed to call `{}`", self.qualified_name)
            });
        }
        let concurrent = caller.data().concurrent.clone();
        let instance = caller.data().instance;
        let (parent, task) = concurrent.with(|s| {
            if !s.instance(instance)?.flags().may_leave {
                return Err(ProtocolError::CannotLeave(instance).into());
            }
            let parent = s.current_task(instance)?;
            let task = s.start_task(instance, false, &self.qualified_name)?;
            if let Some(parent) = parent {
                s.push_subtask(parent, task)?;
            }
            Ok((parent, task))
        })?;

        let result = self.invoke(&mut caller, params, results);
        let finished = concurrent.with(|s| {
            if let Ok(ret) = &result {
                s.resolve_task(task, ret.iter().cloned().collect())?;
                s.exit_task(task)?;
            }
            if let Some(parent) = parent {
                s.pop_subtask(parent, task)?;
            }
            s.end_task(instance, Some(task))?;
            Ok(())
        });
        result.with_context(|| format!("host import `{}` failed", self.qualified_name))?;
        finished
    }

    fn invoke(
        &self,
        caller: &mut Caller<'_, HostState>,
        params: &[wasmtime::Val],
        results: &mut [wasmtime::Val],
    ) -> Result<Option<Val>> {
        let mut memory = StoreMemory::new(caller.as_context_mut());
        let args = {
            let cx = memory.lift_context();
            if self.core.params_indirect {
                let ptr = pointer(params, 0)?;
                match abi::load(&cx, &self.signature.params_tuple(), ptr)? {
                    Val::Tuple(args) => args,
                    other => unreachable!("tuple loaded as {}", other.desc()),
                }
            } else {
                let flat = if self.core.results_indirect {
                    &params[..params.len() - 1]
                } else {
                    params
                };
                abi::lift_flat(&cx, &self.param_types, flat)?
            }
        };
        tracing::trace!(import = %self.qualified_name, args = args.len(), "calling host");

        let ret = (self.host)(&args[..])?;
        let (ty, val) = match (&self.signature.result, &ret) {
            (None, None) => return Ok(None),
            (Some(ty), Some(val)) => (ty, val),
            (Some(ty), None) => {
                return Err(AbiError::TypeMismatch {
                    expected: ty.to_string(),
                    found: "nothing",
                }
                .into());
            }
            (None, Some(val)) => {
                return Err(AbiError::TypeMismatch {
                    expected: "no result".to_string(),
                    found: val.desc(),
                }
                .into());
            }
        };

        let mut cx = LowerContext::new(&mut memory);
        if self.core.results_indirect {
            let retptr = pointer(params, params.len() - 1)?;
            abi::store(&mut cx, ty, val, retptr)?;
        } else {
            let flat = abi::lower_flat(&mut cx, std::slice::from_ref(ty), std::slice::from_ref(val))?;
            for (dst, src) in results.iter_mut().zip(flat) {
                *dst = src;
            }
        }
        Ok(ret)
    }
}

fn pointer(params: &[wasmtime::Val], index: usize) -> Result<u32> {
    params
        .get(index)
        .and_then(|v| v.i32())
        .map(|p| p as u32)
        .ok_or_else(|| anyhow!("expected an i32 pointer at parameter {index}"))
}

