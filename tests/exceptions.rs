use tusk::{Engine, Instance, Linker, Module, Store, Trap};

fn instantiate(wat: &str) -> (Store, Instance) {
    let engine = Engine::default();
    let module = Module::new(&engine, wat).unwrap();
    let linker = Linker::new(&engine);
    let mut store = Store::new(&engine);
    let instance = linker.instantiate(&mut store, &module).unwrap();
    (store, instance)
}

#[test]
fn throw_and_catch_binds_the_payload() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module
            (tag $t (param i32))
            (func (export "f") (result i32)
              (try (result i32)
                (do (throw $t (i32.const 9)))
                (catch $t))))"#,
    );
    let got: (i32,) = instance.call(&mut store, "f", ())?;
    assert_eq!(got, (9,));
    Ok(())
}

#[test]
fn untaken_throw_falls_through() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module
            (tag $t (param i32))
            (func (export "f") (param i32) (result i32)
              (try (result i32)
                (do
                  (if (local.get 0) (then (throw $t (i32.const 1))))
                  (i32.const 10))
                (catch $t (i32.const 100) (i32.add)))))"#,
    );
    let got: (i32,) = instance.call(&mut store, "f", (0,))?;
    assert_eq!(got, (10,));
    let got: (i32,) = instance.call(&mut store, "f", (1,))?;
    assert_eq!(got, (101,));
    Ok(())
}

#[test]
fn uncaught_exception_escapes_as_a_trap() {
    let (mut store, instance) = instantiate(
        r#"(module
            (tag $t (param i32))
            (func (export "f") (throw $t (i32.const 1))))"#,
    );
    let err = instance.call_dynamic(&mut store, "f", &[]).unwrap_err();
    let trap = err.downcast_ref::<Trap>().expect("a trap");
    assert!(matches!(trap, Trap::Exception(_)), "{trap:?}");
}

#[test]
fn exceptions_unwind_through_callees() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module
            (tag $t (param i32))
            (func $deep (param i32)
              (if (local.get 0)
                (then (call $deep (i32.sub (local.get 0) (i32.const 1))))
                (else (throw $t (i32.const 77)))))
            (func (export "f") (result i32)
              (try (result i32)
                (do (call $deep (i32.const 5)) (i32.const 0))
                (catch $t))))"#,
    );
    let got: (i32,) = instance.call(&mut store, "f", ())?;
    assert_eq!(got, (77,));
    Ok(())
}

#[test]
fn tags_match_by_identity() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module
            (tag $a (param i32))
            (tag $b (param i32))
            (func (export "f") (result i32)
              (try (result i32)
                (do
                  (try (result i32)
                    (do (throw $b (i32.const 5)))
                    (catch $a (i32.const -1) (i32.add)))) ;; wrong tag, skipped
                (catch $b (i32.const 100) (i32.add)))))"#,
    );
    let got: (i32,) = instance.call(&mut store, "f", ())?;
    assert_eq!(got, (105,));
    Ok(())
}

#[test]
fn catch_all_matches_any_tag() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module
            (tag $a (param i32))
            (tag $b)
            (func (export "f") (param i32) (result i32)
              (try (result i32)
                (do
                  (if (local.get 0)
                    (then (throw $a (i32.const 1)))
                    (else (throw $b)))
                  (i32.const 0))
                (catch_all (i32.const 42)))))"#,
    );
    let got: (i32,) = instance.call(&mut store, "f", (1,))?;
    assert_eq!(got, (42,));
    let got: (i32,) = instance.call(&mut store, "f", (0,))?;
    assert_eq!(got, (42,));
    Ok(())
}

#[test]
fn multiple_catch_clauses_pick_the_matching_tag() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module
            (tag $a (param i32))
            (tag $b (param i32))
            (func (export "f") (param i32) (result i32)
              (try (result i32)
                (do
                  (if (local.get 0)
                    (then (throw $a (i32.const 10)))
                    (else (throw $b (i32.const 20))))
                  (i32.const 0))
                (catch $a (i32.const 1) (i32.add))
                (catch $b (i32.const 2) (i32.add)))))"#,
    );
    let got: (i32,) = instance.call(&mut store, "f", (1,))?;
    assert_eq!(got, (11,));
    let got: (i32,) = instance.call(&mut store, "f", (0,))?;
    assert_eq!(got, (22,));
    Ok(())
}

#[test]
fn throw_inside_a_catch_propagates_outward() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module
            (tag $t (param i32))
            (func (export "f") (result i32)
              (try (result i32)
                (do
                  (try (result i32)
                    (do (throw $t (i32.const 1)))
                    (catch $t
                      ;; re-raise with a bumped payload
                      (i32.const 1)
                      (i32.add)
                      (throw $t))))
                (catch $t (i32.const 100) (i32.add)))))"#,
    );
    let got: (i32,) = instance.call(&mut store, "f", ())?;
    assert_eq!(got, (102,));
    Ok(())
}

#[test]
fn multi_value_payload() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module
            (tag $t (param i32 i64))
            (func (export "f") (result i64) (local $hi i64)
              (try (result i64)
                (do (throw $t (i32.const 3) (i64.const 40)))
                (catch $t
                  ;; stack: i32 i64, top first
                  (local.set $hi)
                  (i64.extend_i32_u)
                  (i64.add (local.get $hi))))))"#,
    );
    let got: (i64,) = instance.call(&mut store, "f", ())?;
    assert_eq!(got, (43,));
    Ok(())
}

#[test]
fn imported_tags_share_identity() -> Result<(), anyhow::Error> {
    let engine = Engine::default();
    let mut store = Store::new(&engine);
    let mut linker = Linker::new(&engine);

    let provider = Module::new(
        &engine,
        r#"(module
            (tag (export "t") (param i32))
            (func (export "boom") (param i32)
              (throw 0 (local.get 0))))"#,
    )?;
    let provider_inst = linker.instantiate(&mut store, &provider)?;
    linker.define_instance("provider", &provider_inst);

    let consumer = Module::new(
        &engine,
        r#"(module
            (import "provider" "t" (tag $t (param i32)))
            (import "provider" "boom" (func $boom (param i32)))
            (func (export "f") (result i32)
              (try (result i32)
                (do (call $boom (i32.const 8)) (i32.const 0))
                (catch $t))))"#,
    )?;
    let consumer_inst = linker.instantiate(&mut store, &consumer)?;
    let got: (i32,) = consumer_inst.call(&mut store, "f", ())?;
    assert_eq!(got, (8,));
    Ok(())
}
