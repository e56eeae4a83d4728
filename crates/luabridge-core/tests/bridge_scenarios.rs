use luabridge_core::{
    BridgeError, Engine, EngineErrorKind, EngineOptions, ErrorKind, HostFunction, HostValue,
    InterfaceCatalog, InterfaceContract, ModuleRoot, ResultCount, ReturnShape, ScriptProxy,
    ValueKind,
};
use std::io;

fn engine() -> Engine {
    let engine = Engine::new().expect("create engine");
    engine.open_standard_libraries().expect("open libraries");
    engine
}

fn add() -> HostFunction {
    HostFunction::new("add", |_, args| {
        let a = args.first().and_then(HostValue::as_number).unwrap_or(0.0);
        let b = args.get(1).and_then(HostValue::as_number).unwrap_or(0.0);
        Ok(vec![HostValue::Number(a + b)])
    })
}

#[test]
fn evaluate_returns_numbers() {
    let engine = engine();
    let results = engine.evaluate("return 1+1").expect("evaluate");
    assert_eq!(results, vec![HostValue::Number(2.0)]);
}

#[test]
fn scripts_call_registered_host_functions() {
    let engine = engine();
    engine.register_global("add", add()).expect("register");
    let results = engine.evaluate("return add(2, 3)").expect("evaluate");
    assert_eq!(results, vec![HostValue::Number(5.0)]);

    let results = engine
        .call_global("add", &[HostValue::from(2), HostValue::from(3)])
        .expect("call_global");
    assert_eq!(results, vec![HostValue::Number(5.0)]);
}

#[test]
fn require_goes_through_module_loaders() {
    let engine = engine();
    engine
        .add_module_source(|name: &str| -> io::Result<Vec<u8>> {
            if name == "answer" {
                Ok(b"return { value = 42 }".to_vec())
            } else {
                Err(io::Error::new(io::ErrorKind::NotFound, "no such asset"))
            }
        })
        .expect("install source");

    let results = engine
        .evaluate("return require('answer').value")
        .expect("require answer");
    assert_eq!(results, vec![HostValue::Number(42.0)]);

    let err = engine.evaluate("return require('missing')").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeError);
    let message = err.engine_message().expect("engine message");
    assert!(message.contains("Cannot load module missing"), "{message}");
    assert!(message.contains("no such asset"), "{message}");
}

#[test]
fn host_loaders_return_chunks_or_reasons() {
    let engine = engine();
    let loader = HostFunction::new("loader", |ctx, args| {
        let name = args.first().and_then(HostValue::as_str).unwrap_or_default();
        if name == "greeting" {
            let chunk = ctx.load_chunk(b"return 'hello'", "=greeting")?;
            Ok(vec![chunk.into()])
        } else {
            Ok(vec![HostValue::from(format!("\n\tno greeting named {name}"))])
        }
    });
    engine.add_module_loader(loader).expect("add loader");
    let results = engine.evaluate("return require('greeting')").expect("require");
    assert_eq!(results[0], HostValue::from("hello"));
}

#[test]
fn proxies_forward_to_script_tables() {
    let engine = engine();
    let mut catalog = InterfaceCatalog::new();
    catalog
        .register(InterfaceContract::new("Point").method("getX", 0, ReturnShape::Single))
        .expect("register contract");

    let table = engine
        .evaluate("return { x = 42, getX = function(self) return self.x end }")
        .expect("evaluate")
        .remove(0)
        .into_reference()
        .expect("table reference");
    let proxy = ScriptProxy::new(table, &catalog, &["Point"]).expect("proxy");
    let x: f64 = proxy.invoke_typed("Point", "getX", &[]).expect("getX");
    assert_eq!(x, 42.0);
}

#[test]
fn blank_search_paths_leave_the_path_alone() {
    let engine = engine();
    let before = engine.global("package").unwrap().field("path").unwrap().as_text().unwrap();

    let err = engine.add_search_path("   ").unwrap_err();
    assert!(matches!(err, BridgeError::IllegalArgument(_)));

    let after = engine.global("package").unwrap().field("path").unwrap().as_text().unwrap();
    assert_eq!(before, after);
}

#[test]
fn calling_a_missing_global_is_a_runtime_error() {
    let engine = engine();
    let err = engine.call_global("does_not_exist", &[]).unwrap_err();
    match err {
        BridgeError::Engine { kind, message } => {
            assert_eq!(kind, EngineErrorKind::Runtime);
            assert!(message.contains("nil"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn syntax_errors_are_classified() {
    let engine = engine();
    let err = engine.evaluate("return +").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SyntaxError);
}

#[test]
fn failed_calls_restore_the_stack() {
    let engine = engine();
    let failing = engine
        .evaluate("return function() error('boom') end")
        .unwrap()
        .remove(0)
        .into_reference()
        .unwrap();

    let guard = engine.lock();
    let stack = guard.stack().unwrap();
    stack.push_text("sentinel");
    stack.push_number(7.0);
    let depth = stack.depth();

    let err = failing.call(&[HostValue::from(1)], ResultCount::All).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeError);
    assert!(err.engine_message().unwrap().contains("boom"));
    assert_eq!(stack.depth(), depth);
    assert_eq!(stack.peek_number(-1), Some(7.0));
    stack.truncate(0);
}

#[test]
fn references_pin_release_and_refetch() {
    let engine = engine();
    engine.evaluate("config = { name = 'demo' }").unwrap();
    let baseline = engine.live_references().unwrap();

    let config = engine.global("config").unwrap();
    assert_eq!(config.kind().unwrap(), ValueKind::Table);
    engine.evaluate("collectgarbage('collect')").unwrap();
    assert_eq!(
        config.field("name").unwrap().as_text().unwrap().as_deref(),
        Some("demo")
    );

    config.release().unwrap();
    assert_eq!(engine.live_references().unwrap(), baseline);
    assert_eq!(config.field("name").unwrap_err().kind(), ErrorKind::UseAfterRelease);
    assert_eq!(config.release().unwrap_err().kind(), ErrorKind::UseAfterRelease);

    let again = engine.global("config").unwrap();
    assert_eq!(again.field("name").unwrap().to_string(), "demo");
}

#[test]
fn references_cannot_cross_engines() {
    let a = engine();
    let b = engine();
    a.evaluate("t = {}").unwrap();
    b.evaluate("function id(x) return x end").unwrap();
    let foreign = a.global("t").unwrap();

    let err = b
        .call_global("id", &[HostValue::Reference(foreign.try_clone().unwrap())])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CrossHandleMismatch);

    let local = b.global("id").unwrap();
    let err = local
        .call(&[HostValue::Reference(foreign)], ResultCount::Exactly(1))
        .unwrap_err();
    assert!(matches!(err, BridgeError::CrossHandleMismatch { .. }));
}

#[test]
fn closing_invalidates_everything() {
    let engine = engine();
    let table = engine.evaluate("return {}").unwrap().remove(0);
    let clone = engine.clone();

    engine.close().expect("close");
    assert!(clone.is_closed());
    assert_eq!(engine.close().unwrap_err().kind(), ErrorKind::EngineClosed);
    assert_eq!(clone.evaluate("return 1").unwrap_err().kind(), ErrorKind::EngineClosed);

    let table = table.into_reference().unwrap();
    assert_eq!(table.kind().unwrap_err().kind(), ErrorKind::EngineClosed);
    // dropping a reference to a closed engine only logs
    drop(table);
}

#[test]
fn closing_from_inside_a_call_is_rejected() {
    let engine = engine();
    engine
        .register_global(
            "close_me",
            HostFunction::new("close_me", |ctx, _| {
                let err = ctx.engine().close().unwrap_err();
                Ok(vec![HostValue::from(err.to_string())])
            }),
        )
        .unwrap();
    let results = engine.evaluate("return close_me()").unwrap();
    assert!(results[0].as_str().unwrap().contains("cannot close"));
    assert!(!engine.is_closed());
}

#[test]
fn search_paths_and_module_roots_serve_files() {
    let scripts = tempfile::tempdir().unwrap();
    std::fs::write(scripts.path().join("util.lua"), "return { twice = function(n) return n * 2 end }")
        .unwrap();
    let assets = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(assets.path().join("lua").join("game")).unwrap();
    std::fs::write(
        assets.path().join("lua").join("game").join("rules.lua"),
        "return { lives = 3 }",
    )
    .unwrap();

    let options = EngineOptions {
        print_hook: false,
        search_paths: vec![scripts.path().to_path_buf()],
        module_roots: vec![ModuleRoot {
            path: assets.path().to_path_buf(),
            subdirectory: Some("lua".into()),
        }],
        ..EngineOptions::default()
    };
    let engine = Engine::with_options(&options).expect("configured engine");

    let results = engine
        .evaluate("return require('util').twice(21), require('game.rules').lives")
        .unwrap();
    assert_eq!(results, vec![HostValue::Number(42.0), HostValue::Number(3.0)]);
}

#[test]
fn execute_file_runs_scripts_with_shebangs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.lua");
    std::fs::write(&path, "#!/usr/bin/env luab\nreturn 'ran', 2").unwrap();
    let engine = engine();
    let results = engine.execute_file(&path).unwrap();
    assert_eq!(results, vec![HostValue::from("ran"), HostValue::Number(2.0)]);

    let broken = dir.path().join("broken.lua");
    std::fs::write(&broken, "\nerror('bad line')").unwrap();
    let err = engine.execute_file(&broken).unwrap_err();
    assert!(err.engine_message().unwrap().contains("broken.lua:2"));

    let missing = engine.execute_file(dir.path().join("absent.lua")).unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::Io);
}

#[test]
fn module_functions_receive_their_module() {
    let engine = engine();
    engine
        .evaluate("obj = { n = 7 }\nfunction obj.get(self, k) return self.n + k end")
        .unwrap();
    let results = engine
        .call_module_function("obj", "get", &[HostValue::from(1)])
        .unwrap();
    assert_eq!(results, vec![HostValue::Number(8.0)]);

    let err = engine.call_module_function("obj", " ", &[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalArgument);
    let err = engine.call_module_function("no_such_module", "get", &[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalArgument);
}

#[test]
fn module_fields_take_positional_arguments() {
    let engine = engine();
    let results = engine
        .call_module_field("string", "rep", &[HostValue::from("ab"), HostValue::from(3)])
        .unwrap();
    assert_eq!(results, vec![HostValue::from("ababab")]);

    let err = engine.call_module_field("string", " ", &[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalArgument);
}

#[test]
fn module_source_misses_read_as_one_block() {
    let engine = engine();
    engine
        .add_module_source(|_: &str| -> io::Result<Vec<u8>> {
            Err(io::Error::new(io::ErrorKind::NotFound, "nothing here"))
        })
        .expect("install source");

    let err = engine.evaluate("return require('zz')").unwrap_err();
    let message = err.engine_message().expect("engine message");
    assert!(message.contains("\n\tCannot load module zz:\n\tnothing here"), "{message}");
    assert!(!message.contains("\n\t\n"), "{message}");
}
