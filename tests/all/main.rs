mod calls;
mod instantiate;

use component_host::{
    BytesResolver, ComponentDescriptor, ExportDescriptor, FuncSignature, HostImports,
    ImportDescriptor, InterfaceType, Val,
};
use std::sync::{Arc, Mutex};

/// Forwards import 0 through a table that the fixups module fills in.
const SHIM: &str = r#"
(module
  (type $log (func (param i32 i32)))
  (table (export "$imports") 1 1 funcref)
  (func (export "0") (param i32 i32)
    local.get 0
    local.get 1
    i32.const 0
    call_indirect (type $log))
)
"#;

const MAIN: &str = r#"
(module
  (import "host:log" "log" (func $log (param i32 i32)))
  (import "host:util" "add" (func $add (param i32 i32) (result i32)))
  (import "host:util" "name" (func $name (param i32)))

  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 1024))
  (global $ticks (mut i32) (i32.const 0))
  (data (i32.const 256) "boom")

  (func (export "cabi_realloc") (param $old i32) (param $old_size i32) (param $align i32) (param $size i32) (result i32)
    (local $ptr i32)
    global.get $heap
    local.get $align
    i32.const 1
    i32.sub
    i32.add
    local.get $align
    i32.const 1
    i32.sub
    i32.const -1
    i32.xor
    i32.and
    local.set $ptr
    local.get $ptr
    local.get $size
    i32.add
    global.set $heap
    local.get $ptr)

  (func (export "echo") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    call $log
    i32.const 16
    local.get 0
    i32.store
    i32.const 20
    local.get 1
    i32.store
    i32.const 16)

  (func (export "add") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    call $add)

  (func (export "greet-host") (result i32)
    i32.const 64
    call $name
    i32.const 64)

  (func (export "fail") (param $code i32) (result i32)
    local.get $code
    if
      i32.const 32
      i32.const 1
      i32.store8
      i32.const 36
      i32.const 256
      i32.store
      i32.const 40
      i32.const 4
      i32.store
    else
      i32.const 32
      i32.const 0
      i32.store8
      i32.const 36
      i32.const 42
      i32.store
    end
    i32.const 32)

  (func (export "bad-enum") (result i32)
    i32.const 7)

  (func (export "tick") (result i32)
    global.get $ticks)
  (func (export "cabi_post_tick") (param i32)
    global.get $ticks
    i32.const 1
    i32.add
    global.set $ticks)

  (func (export "sum") (param $p i32) (result i32)
    (local $i i32)
    (local $acc i32)
    block $done
      loop $top
        local.get $i
        i32.const 17
        i32.ge_u
        br_if $done
        local.get $acc
        local.get $p
        local.get $i
        i32.const 4
        i32.mul
        i32.add
        i32.load
        i32.add
        local.set $acc
        local.get $i
        i32.const 1
        i32.add
        local.set $i
        br $top
      end
    end
    local.get $acc)

  (func (export "trap")
    unreachable)
)
"#;

const FIXUPS: &str = r#"
(module
  (import "" "$imports" (table 1 1 funcref))
  (import "" "0" (func $log (param i32 i32)))
  (elem (i32.const 0) func $log)
)
"#;

pub fn resolver() -> BytesResolver {
    BytesResolver::new()
        .with("shim.wasm", SHIM)
        .with("main.wasm", MAIN)
        .with("fixups.wasm", FIXUPS)
}

pub fn descriptor() -> ComponentDescriptor {
    let string = || InterfaceType::String;
    ComponentDescriptor::new("shim.wasm", "main.wasm", "fixups.wasm")
        .import(
            ImportDescriptor::new("host:log", "log", FuncSignature::new([("msg", string())], None))
                .via_shim("0"),
        )
        .import(ImportDescriptor::new(
            "host:util",
            "add",
            FuncSignature::new(
                [("a", InterfaceType::U32), ("b", InterfaceType::U32)],
                Some(InterfaceType::U32),
            ),
        ))
        .import(ImportDescriptor::new(
            "host:util",
            "name",
            FuncSignature::new([], Some(string())),
        ))
        .export(ExportDescriptor::new(
            "echo",
            FuncSignature::new([("msg", string())], Some(string())),
        ))
        .export(ExportDescriptor::new(
            "add",
            FuncSignature::new(
                [("a", InterfaceType::U32), ("b", InterfaceType::U32)],
                Some(InterfaceType::U32),
            ),
        ))
        .export(ExportDescriptor::new("greet-host", FuncSignature::new([], Some(string()))))
        .export(ExportDescriptor::new(
            "fail",
            FuncSignature::new(
                [("code", InterfaceType::U32)],
                Some(InterfaceType::result(Some(InterfaceType::U32), Some(string()))),
            ),
        ))
        .export(ExportDescriptor::new(
            "bad-enum",
            FuncSignature::new([], Some(InterfaceType::enum_(["a", "b", "c"]))),
        ))
        .export(
            ExportDescriptor::new("tick", FuncSignature::new([], Some(InterfaceType::U32)))
                .post_return("cabi_post_tick"),
        )
        .export(ExportDescriptor::new(
            "sum",
            FuncSignature::new(
                (0..17).map(|i| (PARAM_NAMES[i], InterfaceType::U32)),
                Some(InterfaceType::U32),
            ),
        ))
        .export(ExportDescriptor::new("trap", FuncSignature::new([], None)))
}

const PARAM_NAMES: [&str; 17] = [
    "p0", "p1", "p2", "p3", "p4", "p5", "p6", "p7", "p8", "p9", "p10", "p11", "p12", "p13", "p14",
    "p15", "p16",
];

/// Host imports for [`descriptor`], recording every logged message.
pub fn host_imports(log: Arc<Mutex<Vec<String>>>) -> HostImports {
    let mut imports = HostImports::new();
    imports
        .func("host:log", "log", move |args| {
            match args {
                [Val::String(msg)] => log.lock().unwrap().push(msg.clone()),
                other => anyhow::bail!("unexpected arguments {other:?}"),
            }
            Ok(None)
        })
        .func("host:util", "add", |args| match args {
            [Val::U32(a), Val::U32(b)] => a
                .checked_add(*b)
                .map(|sum| Some(Val::U32(sum)))
                .ok_or_else(|| anyhow::anyhow!("overflow")),
            other => anyhow::bail!("unexpected arguments {other:?}"),
        })
        .func("host:util", "name", |_| Ok(Some(Val::string("host"))));
    imports
}
