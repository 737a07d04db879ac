//! A host runtime for WebAssembly components that are shipped as a set of
//! linked core modules.
//!
//! A [`ComponentDescriptor`] names the core modules of a component and the
//! host imports and guest exports it uses. [`Runtime::instantiate`] links the
//! modules together with the functions in a [`HostImports`], and the returned
//! [`Instance`] exposes each export as a [`Func`] taking and returning
//! dynamically typed [`Val`]s marshalled through the canonical ABI.
//!
//! Every call across the boundary runs as a task tracked in the runtime's
//! [`Concurrent`] state, which also provides the waitables, waitable sets and
//! per-instance exclusive lock used to serialize calls.

pub mod abi;
pub mod component;
pub mod concurrent;
pub mod config;
pub mod error;
pub mod loader;
pub mod table;

pub use crate::abi::{FuncSignature, InterfaceType, Val};
pub use crate::component::{
    ComponentDescriptor, CoreModules, ExportDescriptor, Exports, Func, HostFunc, HostImports,
    ImportDescriptor, Instance, Runtime, instantiate,
};
pub use crate::concurrent::{ComponentInstanceIndex, Concurrent, ConcurrentState, TaskId};
pub use crate::config::{OptLevel, RuntimeConfig};
pub use crate::error::{AbiError, GuestError, LinkError, ProtocolError, Unsupported};
pub use crate::loader::{BytesResolver, DirectoryResolver, ModuleResolver};
pub use crate::table::TableError;
