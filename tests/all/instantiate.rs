use super::{descriptor, host_imports, resolver};
use component_host::{
    AbiError, BytesResolver, ComponentDescriptor, DirectoryResolver, ExportDescriptor,
    FuncSignature, HostImports, InterfaceType, LinkError, Runtime, RuntimeConfig, Val,
    instantiate,
};
use std::sync::{Arc, Mutex};

fn link_error(err: &anyhow::Error) -> Option<&LinkError> {
    err.downcast_ref::<LinkError>()
}

#[test_log::test(tokio::test)]
async fn exports_in_descriptor_order() {
    let exports = instantiate(&descriptor(), &resolver(), &host_imports(Default::default()))
        .await
        .unwrap();
    assert_eq!(
        exports.names().collect::<Vec<_>>(),
        ["echo", "add", "greet-host", "fail", "bad-enum", "tick", "sum", "trap"]
    );
    assert!(exports.get("missing").is_none());
    assert!(exports.func("missing").is_err());
    assert_eq!(
        exports.func("add").unwrap().call(&[Val::U32(2), Val::U32(3)]).await.unwrap(),
        Some(Val::U32(5))
    );
}

#[test_log::test(tokio::test)]
async fn missing_host_import() {
    let mut imports = HostImports::new();
    imports.func("host:log", "log", |_| Ok(None));
    let err = instantiate(&descriptor(), &resolver(), &imports)
        .await
        .err()
        .unwrap();
    assert_eq!(
        link_error(&err),
        Some(&LinkError::MissingHostImport {
            interface: "host:util".to_string(),
            name: "add".to_string(),
        })
    );
}

#[test_log::test(tokio::test)]
async fn unknown_module() {
    let resolver = BytesResolver::new()
        .with("shim.wasm", "(module)")
        .with("main.wasm", "(module)");
    let err = instantiate(&descriptor(), &resolver, &host_imports(Default::default()))
        .await
        .err()
        .unwrap();
    assert_eq!(
        link_error(&err),
        Some(&LinkError::UnknownModule("fixups.wasm".to_string()))
    );
}

#[test_log::test(tokio::test)]
async fn unresolved_core_import() {
    let resolver = BytesResolver::new()
        .with("a", r#"(module (import "nowhere" "f" (func)))"#)
        .with("b", "(module)")
        .with("c", "(module)");
    let err = instantiate(
        &ComponentDescriptor::new("a", "b", "c"),
        &resolver,
        &HostImports::new(),
    )
    .await
    .err()
    .unwrap();
    assert_eq!(
        link_error(&err),
        Some(&LinkError::UnresolvedImport {
            stage: "implementation",
            module: "nowhere".to_string(),
            name: "f".to_string(),
        })
    );
}

#[test_log::test(tokio::test)]
async fn missing_core_export() {
    let resolver = BytesResolver::new()
        .with("a", "(module)")
        .with("b", "(module)")
        .with("c", "(module)");
    let descriptor = ComponentDescriptor::new("a", "b", "c")
        .export(ExportDescriptor::new("run", FuncSignature::new([], None)));
    let err = instantiate(&descriptor, &resolver, &HostImports::new())
        .await
        .err()
        .unwrap();
    assert_eq!(
        link_error(&err),
        Some(&LinkError::MissingExport("run".to_string()))
    );
}

#[test_log::test(tokio::test)]
async fn main_imports_implementation_exports() {
    let resolver = BytesResolver::new()
        .with(
            "impl",
            r#"(module (func (export "seven") (result i32) i32.const 7))"#,
        )
        .with(
            "main",
            r#"(module
                (import "impl" "seven" (func $seven (result i32)))
                (func (export "run") (result i32) call $seven))"#,
        )
        .with("fixups", "(module)");
    let descriptor = ComponentDescriptor::new("impl", "main", "fixups").export(
        ExportDescriptor::new("run", FuncSignature::new([], Some(InterfaceType::U8))),
    );
    let exports = instantiate(&descriptor, &resolver, &HostImports::new())
        .await
        .unwrap();
    assert_eq!(
        exports.func("run").unwrap().call(&[]).await.unwrap(),
        Some(Val::U8(7))
    );
}

#[test_log::test(tokio::test)]
async fn modules_are_loaded_once_per_runtime() {
    let loads = Arc::new(Mutex::new(Vec::new()));
    let inner = resolver();
    let counting = {
        let loads = loads.clone();
        move |engine: &wasmtime::Engine, name: &str| {
            loads.lock().unwrap().push(name.to_string());
            futures::executor::block_on(component_host::ModuleResolver::resolve(
                &inner, engine, name,
            ))
        }
    };
    let runtime = Runtime::new(&RuntimeConfig::default()).unwrap();
    let imports = host_imports(Default::default());
    let first = runtime
        .instantiate(&descriptor(), &counting, &imports)
        .await
        .unwrap();
    let second = runtime
        .instantiate(&descriptor(), &counting, &imports)
        .await
        .unwrap();
    assert_eq!(
        *loads.lock().unwrap(),
        ["shim.wasm", "main.wasm", "fixups.wasm"]
    );
    assert_ne!(first.index(), second.index());

    // Instances have separate memories and state.
    let tick = |i: &component_host::Instance| i.exports().func("tick").unwrap().clone();
    assert_eq!(tick(&first).call(&[]).await.unwrap(), Some(Val::U32(0)));
    assert_eq!(tick(&first).call(&[]).await.unwrap(), Some(Val::U32(1)));
    assert_eq!(tick(&second).call(&[]).await.unwrap(), Some(Val::U32(0)));
}

#[test_log::test(tokio::test)]
async fn configured_runtime() {
    let dir = tempfile::tempdir().unwrap();
    for (name, text) in [
        ("shim.wasm", super::SHIM),
        ("main.wasm", super::MAIN),
        ("fixups.wasm", super::FIXUPS),
    ] {
        std::fs::write(dir.path().join(name), wat::parse_str(text).unwrap()).unwrap();
    }
    let config = RuntimeConfig::from_toml(&format!(
        "opt-level = \"none\"\nfuel = 1000000\nmax-memory-size = 1048576\nmodule-dir = {:?}",
        dir.path().display().to_string(),
    ))
    .unwrap();
    let runtime = Runtime::new(&config).unwrap();
    let resolver: DirectoryResolver = config.directory_resolver().unwrap();
    let instance = runtime
        .instantiate(&descriptor(), &resolver, &host_imports(Default::default()))
        .await
        .unwrap();
    let greet = instance.exports().func("greet-host").unwrap();
    assert_eq!(greet.call(&[]).await.unwrap(), Some(Val::string("host")));
}

#[test_log::test(tokio::test)]
async fn fuel_exhaustion_traps() {
    let resolver = BytesResolver::new()
        .with("a", "(module)")
        .with(
            "b",
            r#"(module (func (export "spin") (loop $l br $l)))"#,
        )
        .with("c", "(module)");
    let descriptor = ComponentDescriptor::new("a", "b", "c")
        .export(ExportDescriptor::new("spin", FuncSignature::new([], None)));
    let config = RuntimeConfig {
        fuel: Some(10_000),
        ..RuntimeConfig::default()
    };
    let runtime = Runtime::new(&config).unwrap();
    let instance = runtime
        .instantiate(&descriptor, &resolver, &HostImports::new())
        .await
        .unwrap();
    let err = instance.exports().func("spin").unwrap().call(&[]).await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<wasmtime::Trap>(),
        Some(&wasmtime::Trap::OutOfFuel)
    );
}

#[test_log::test(tokio::test)]
async fn oversized_flags_are_rejected() {
    let names = (0..32 * 256).map(|i| format!("f{i}")).collect::<Vec<_>>();
    let flags = InterfaceType::flags(names.iter().map(|s| s.as_str()));
    let resolver = BytesResolver::new()
        .with("a", "(module)")
        .with("b", r#"(module (func (export "set") (param i32)))"#)
        .with("c", "(module)");
    let descriptor = ComponentDescriptor::new("a", "b", "c")
        .export(ExportDescriptor::new("set", FuncSignature::new([("f", flags)], None)));
    let err = instantiate(&descriptor, &resolver, &HostImports::new())
        .await
        .err()
        .unwrap();
    assert_eq!(
        err.downcast_ref::<AbiError>(),
        Some(&AbiError::TooManyFlags(32 * 256)),
        "{err:?}"
    );
}
