use super::{descriptor, host_imports, resolver};
use component_host::{
    AbiError, BytesResolver, ComponentDescriptor, ExportDescriptor, FuncSignature, GuestError,
    HostImports, ImportDescriptor, Instance, InterfaceType, LinkError, ProtocolError, Runtime,
    RuntimeConfig, Unsupported, Val,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

async fn setup() -> (Runtime, Instance, Arc<Mutex<Vec<String>>>) {
    let runtime = Runtime::new(&RuntimeConfig::default()).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let instance = runtime
        .instantiate(&descriptor(), &resolver(), &host_imports(log.clone()))
        .await
        .unwrap();
    (runtime, instance, log)
}

fn assert_idle(runtime: &Runtime, instance: &Instance) {
    runtime
        .concurrent()
        .with(|s| {
            let state = s.instance(instance.index())?;
            assert!(state.task_stack().is_empty());
            assert!(!state.is_locked());
            assert!(!state.in_sync_call());
            assert!(state.flags().may_enter);
            assert!(state.flags().may_leave);
            Ok(())
        })
        .unwrap();
}

#[test_log::test(tokio::test)]
async fn echo_through_shim() {
    let (runtime, instance, log) = setup().await;
    let echo = instance.exports().func("echo").unwrap();
    let ret = echo.call(&[Val::string("hello, world")]).await.unwrap();
    assert_eq!(ret, Some(Val::string("hello, world")));
    assert_eq!(*log.lock().unwrap(), ["hello, world"]);

    let ret = echo.call(&[Val::string("")]).await.unwrap();
    assert_eq!(ret, Some(Val::string("")));
    assert_eq!(log.lock().unwrap().len(), 2);
    assert_idle(&runtime, &instance);
}

#[test_log::test(tokio::test)]
async fn direct_host_import() {
    let (runtime, instance, _) = setup().await;
    let add = instance.exports().func("add").unwrap();
    let ret = add.call(&[Val::U32(40), Val::U32(2)]).await.unwrap();
    assert_eq!(ret, Some(Val::U32(42)));
    assert_idle(&runtime, &instance);
}

#[test_log::test(tokio::test)]
async fn host_result_through_return_pointer() {
    let (runtime, instance, _) = setup().await;
    let greet = instance.exports().func("greet-host").unwrap();
    assert_eq!(greet.call(&[]).await.unwrap(), Some(Val::string("host")));
    assert_idle(&runtime, &instance);
}

#[test_log::test(tokio::test)]
async fn result_error_becomes_guest_error() {
    let (runtime, instance, _) = setup().await;
    let fail = instance.exports().func("fail").unwrap();

    assert_eq!(fail.call(&[Val::U32(0)]).await.unwrap(), Some(Val::U32(42)));

    let err = fail.call(&[Val::U32(1)]).await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<GuestError>(),
        Some(&GuestError {
            payload: Some(Val::string("boom")),
        })
    );
    // A guest error is an ordinary return; the instance stays usable.
    assert_eq!(fail.call(&[Val::U32(0)]).await.unwrap(), Some(Val::U32(42)));
    assert_idle(&runtime, &instance);
}

#[test_log::test(tokio::test)]
async fn invalid_discriminant_is_rejected() {
    let (_runtime, instance, _) = setup().await;
    let err = instance
        .exports()
        .func("bad-enum")
        .unwrap()
        .call(&[])
        .await
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<AbiError>(),
        Some(&AbiError::InvalidDiscriminant {
            ty: "enum",
            value: 7,
            cases: 3,
        })
    );
}

#[test_log::test(tokio::test)]
async fn post_return_runs_after_each_call() {
    let (runtime, instance, _) = setup().await;
    let tick = instance.exports().func("tick").unwrap();
    assert_eq!(tick.call(&[]).await.unwrap(), Some(Val::U32(0)));
    assert_eq!(tick.call(&[]).await.unwrap(), Some(Val::U32(1)));
    assert_eq!(tick.call(&[]).await.unwrap(), Some(Val::U32(2)));
    assert_idle(&runtime, &instance);
}

#[test_log::test(tokio::test)]
async fn many_params_pass_indirectly() {
    let (_runtime, instance, _) = setup().await;
    let sum = instance.exports().func("sum").unwrap();
    let args = (1..=17).map(Val::U32).collect::<Vec<_>>();
    assert_eq!(sum.call(&args).await.unwrap(), Some(Val::U32(153)));
}

#[test_log::test(tokio::test)]
async fn argument_count_is_checked() {
    let (runtime, instance, _) = setup().await;
    let add = instance.exports().func("add").unwrap();
    let err = add.call(&[Val::U32(1)]).await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<LinkError>(),
        Some(&LinkError::ArgumentCount {
            name: "add".to_string(),
            expected: 2,
            got: 1,
        })
    );
    // Nothing was entered, so the instance is still usable.
    assert_idle(&runtime, &instance);
    assert_eq!(
        add.call(&[Val::U32(1), Val::U32(2)]).await.unwrap(),
        Some(Val::U32(3))
    );
}

#[test_log::test(tokio::test)]
async fn trap_poisons_instance() {
    let (runtime, instance, _) = setup().await;
    assert!(instance.exports().func("trap").unwrap().call(&[]).await.is_err());

    let err = instance
        .exports()
        .func("add")
        .unwrap()
        .call(&[Val::U32(1), Val::U32(2)])
        .await
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<ProtocolError>(),
        Some(&ProtocolError::CannotEnter(instance.index()))
    );
    // The exclusive lock was still released.
    runtime
        .concurrent()
        .with(|s| {
            assert!(!s.instance(instance.index())?.is_locked());
            Ok(())
        })
        .unwrap();
}

#[test_log::test(tokio::test)]
async fn host_error_traps_guest() {
    let (runtime, instance, _) = setup().await;
    let add = instance.exports().func("add").unwrap();
    let err = add.call(&[Val::U32(u32::MAX), Val::U32(1)]).await.unwrap_err();
    assert!(format!("{err:?}").contains("overflow"), "{err:?}");

    // The import's subtask was ended even though the host failed; only the
    // export's own task is left behind by the trap.
    runtime
        .concurrent()
        .with(|s| {
            let state = s.instance(instance.index())?;
            assert_eq!(state.task_stack().len(), 1);
            let export = s.task(state.task_stack()[0])?;
            assert_eq!(export.entry(), "add");
            assert!(export.subtasks().is_empty());
            Ok(())
        })
        .unwrap();
}

#[test_log::test(tokio::test)]
async fn concurrent_calls_are_serialized() {
    let (runtime, instance, log) = setup().await;
    let echo = instance.exports().func("echo").unwrap().clone();
    let add = instance.exports().func("add").unwrap().clone();
    let one = [Val::string("one")];
    let two = [Val::string("two")];
    let sum = [Val::U32(1), Val::U32(1)];
    let (a, b, c) = futures::join!(echo.call(&one), add.call(&sum), echo.call(&two));
    assert_eq!(a.unwrap(), Some(Val::string("one")));
    assert_eq!(b.unwrap(), Some(Val::U32(2)));
    assert_eq!(c.unwrap(), Some(Val::string("two")));
    assert_eq!(*log.lock().unwrap(), ["one", "two"]);
    assert_idle(&runtime, &instance);
}

#[test_log::test(tokio::test)]
async fn calls_from_spawned_tasks() {
    let (runtime, instance, _) = setup().await;
    let add = instance.exports().func("add").unwrap().clone();
    let handles = (0..8u32)
        .map(|i| {
            let add = add.clone();
            tokio::spawn(async move { add.call(&[Val::U32(i), Val::U32(i)]).await })
        })
        .collect::<Vec<_>>();
    for (i, handle) in handles.into_iter().enumerate() {
        let ret = handle.await.unwrap().unwrap();
        assert_eq!(ret, Some(Val::U32(2 * i as u32)));
    }
    assert_idle(&runtime, &instance);
}

/// A component whose main module calls the host import `host:util#ping`
/// from `run` and from the post-return of `get`.
async fn ping_component(ping: ImportDescriptor) -> (Instance, Arc<AtomicUsize>) {
    let resolver = BytesResolver::new()
        .with("impl", "(module)")
        .with(
            "main",
            r#"(module
                (import "host:util" "ping" (func $ping (result i32)))
                (func (export "run") (result i32) call $ping)
                (func (export "get") (result i32) i32.const 1)
                (func (export "cabi_post_get") (param i32)
                  call $ping
                  drop))"#,
        )
        .with("fixups", "(module)");
    let u32_result = || FuncSignature::new([], Some(InterfaceType::U32));
    let descriptor = ComponentDescriptor::new("impl", "main", "fixups")
        .import(ping)
        .export(ExportDescriptor::new("run", u32_result()))
        .export(ExportDescriptor::new("get", u32_result()).post_return("cabi_post_get"));

    let pings = Arc::new(AtomicUsize::new(0));
    let mut imports = HostImports::new();
    let counter = pings.clone();
    imports.func("host:util", "ping", move |_| {
        Ok(Some(Val::U32(counter.fetch_add(1, Ordering::SeqCst) as u32)))
    });
    let runtime = Runtime::new(&RuntimeConfig::default()).unwrap();
    let instance = runtime
        .instantiate(&descriptor, &resolver, &imports)
        .await
        .unwrap();
    (instance, pings)
}

fn ping() -> ImportDescriptor {
    ImportDescriptor::new(
        "host:util",
        "ping",
        FuncSignature::new([], Some(InterfaceType::U32)),
    )
}

#[test_log::test(tokio::test)]
async fn post_return_cannot_call_imports() {
    let (instance, pings) = ping_component(ping()).await;
    assert_eq!(
        instance.exports().func("run").unwrap().call(&[]).await.unwrap(),
        Some(Val::U32(0))
    );

    let err = instance.exports().func("get").unwrap().call(&[]).await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<ProtocolError>(),
        Some(&ProtocolError::CannotLeave(instance.index())),
        "{err:?}"
    );
    assert_eq!(pings.load(Ordering::SeqCst), 1);
}

#[test_log::test(tokio::test)]
async fn async_lowered_imports_are_unsupported() {
    let (instance, pings) = ping_component(ping().asynchronous()).await;
    let err = instance.exports().func("run").unwrap().call(&[]).await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<Unsupported>(),
        Some(&Unsupported("calling an async-lowered import")),
        "{err:?}"
    );
    assert_eq!(pings.load(Ordering::SeqCst), 0);
}
