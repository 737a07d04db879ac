//! Static description of how a component's core modules fit together.

use crate::abi::FuncSignature;
use anyhow::{Context as _, Result};

/// Names of the three core modules making up a component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreModules {
    /// Instantiated first. Its imports may only name host imports.
    pub implementation: String,
    /// The module whose exports become the component's exports.
    pub main: String,
    /// Instantiated last to patch up tables left behind by the others.
    pub fixups: String,
}

/// Describes a component: its core modules, the imports it needs from the
/// host, and the exports it offers.
///
/// Host import `i` (counting from zero in `imports`) is also offered to the
/// fixups module as the import named `"<i>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentDescriptor {
    pub modules: CoreModules,
    /// Name of the main module's memory export.
    pub memory: String,
    /// Name of the main module's realloc export.
    pub realloc: String,
    pub imports: Vec<ImportDescriptor>,
    pub exports: Vec<ExportDescriptor>,
}

impl ComponentDescriptor {
    pub fn new(implementation: &str, main: &str, fixups: &str) -> ComponentDescriptor {
        ComponentDescriptor {
            modules: CoreModules {
                implementation: implementation.to_string(),
                main: main.to_string(),
                fixups: fixups.to_string(),
            },
            memory: "memory".to_string(),
            realloc: "cabi_realloc".to_string(),
            imports: Vec::new(),
            exports: Vec::new(),
        }
    }

    pub fn import(mut self, import: ImportDescriptor) -> Self {
        self.imports.push(import);
        self
    }

    pub fn export(mut self, export: ExportDescriptor) -> Self {
        self.exports.push(export);
        self
    }

    pub fn memory(mut self, name: &str) -> Self {
        self.memory = name.to_string();
        self
    }

    pub fn realloc(mut self, name: &str) -> Self {
        self.realloc = name.to_string();
        self
    }

    /// Checks that every import and export signature has a canonical
    /// layout.
    pub fn validate(&self) -> Result<()> {
        for import in self.imports.iter() {
            import.signature.validate().with_context(|| {
                format!("invalid signature for import `{}`", import.qualified_name())
            })?;
        }
        for export in self.exports.iter() {
            export
                .signature
                .validate()
                .with_context(|| format!("invalid signature for export `{}`", export.name))?;
        }
        Ok(())
    }

    /// Finds the import the core import `module::name` refers to.
    pub(crate) fn find_import(&self, module: &str, name: &str) -> Option<usize> {
        self.imports
            .iter()
            .position(|i| i.interface == module && i.name == name)
    }
}

/// A function imported from the host, named `interface#name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDescriptor {
    pub interface: String,
    pub name: String,
    pub signature: FuncSignature,
    /// When set, the main module's import is satisfied by this export of
    /// the implementation module (an indirection shim) instead of by the
    /// host trampoline directly.
    pub shim_export: Option<String>,
    pub is_async: bool,
}

impl ImportDescriptor {
    pub fn new(interface: &str, name: &str, signature: FuncSignature) -> ImportDescriptor {
        ImportDescriptor {
            interface: interface.to_string(),
            name: name.to_string(),
            signature,
            shim_export: None,
            is_async: false,
        }
    }

    pub fn via_shim(mut self, export: &str) -> Self {
        self.shim_export = Some(export.to_string());
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    pub fn qualified_name(&self) -> String {
        format!("{}#{}", self.interface, self.name)
    }
}

/// A function exported by the main module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportDescriptor {
    pub name: String,
    /// Name of the core function export, by default the same as `name`.
    pub core_export: String,
    pub signature: FuncSignature,
    pub post_return: Option<String>,
}

impl ExportDescriptor {
    pub fn new(name: &str, signature: FuncSignature) -> ExportDescriptor {
        ExportDescriptor {
            name: name.to_string(),
            core_export: name.to_string(),
            signature,
            post_return: None,
        }
    }

    pub fn core_export(mut self, name: &str) -> Self {
        self.core_export = name.to_string();
        self
    }

    pub fn post_return(mut self, name: &str) -> Self {
        self.post_return = Some(name.to_string());
        self
    }
}
