use crate::abi::Val;
use anyhow::Result;
use indexmap::IndexMap;
use std::sync::Arc;

/// A host function callable from the guest.
///
/// It receives the lifted arguments and returns the result value, if the
/// signature has one. Returning an error traps the calling guest.
pub type HostFunc = Arc<dyn Fn(&[Val]) -> Result<Option<Val>> + Send + Sync>;

/// Host functions grouped by interface.
#[derive(Clone, Default)]
pub struct HostImports {
    interfaces: IndexMap<String, IndexMap<String, HostFunc>>,
}

impl HostImports {
    pub fn new() -> HostImports {
        HostImports::default()
    }

    /// Defines `interface#name`, replacing any earlier definition.
    pub fn func(
        &mut self,
        interface: &str,
        name: &str,
        func: impl Fn(&[Val]) -> Result<Option<Val>> + Send + Sync + 'static,
    ) -> &mut Self {
        self.interfaces
            .entry(interface.to_string())
            .or_default()
            .insert(name.to_string(), Arc::new(func));
        self
    }

    pub fn get(&self, interface: &str, name: &str) -> Option<&HostFunc> {
        self.interfaces.get(interface)?.get(name)
    }

    /// All defined functions as `(interface, name)` pairs, in definition
    /// order.
    pub fn names(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.interfaces.iter().flat_map(|(interface, funcs)| {
            funcs.keys().map(move |name| (interface.as_str(), name.as_str()))
        })
    }
}
