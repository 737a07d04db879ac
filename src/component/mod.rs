//! Components assembled from core modules, and calls across their boundary.

mod descriptor;
mod func;
mod host;
mod linker;
mod store;
mod trampoline;

pub use self::descriptor::{ComponentDescriptor, CoreModules, ExportDescriptor, ImportDescriptor};
pub use self::func::{Exports, Func, Instance};
pub use self::host::{HostFunc, HostImports};
pub use self::linker::{Runtime, instantiate};
