use tusk::{Engine, Instance, Linker, Module, Store, Val};

fn instantiate(wat: &str) -> (Store, Instance) {
    let engine = Engine::default();
    let module = Module::new(&engine, wat).unwrap();
    let linker = Linker::new(&engine);
    let mut store = Store::new(&engine);
    let instance = linker.instantiate(&mut store, &module).unwrap();
    (store, instance)
}

#[test]
fn add_two_params() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module (func (export "add") (param i32 i32) (result i32)
            local.get 0 local.get 1 i32.add))"#,
    );
    let result: (i32,) = instance.call(&mut store, "add", (3, 4))?;
    assert_eq!(result, (7,));
    let result: (i32,) = instance.call(&mut store, "add", (i32::MAX, 1))?;
    assert_eq!(result, (i32::MIN,));
    Ok(())
}

#[test]
fn division_traps() {
    let (mut store, instance) = instantiate(
        r#"(module
            (func (export "by_zero") (result i32)
              i32.const 7 i32.const 0 i32.div_s)
            (func (export "overflow") (result i32)
              i32.const 0x80000000 i32.const -1 i32.div_s)
            (func (export "rem_min") (result i32)
              i32.const 0x80000000 i32.const -1 i32.rem_s))"#,
    );
    let err = instance.call_dynamic(&mut store, "by_zero", &[]).unwrap_err();
    assert!(err.to_string().contains("integer divide by zero"), "{err}");
    let err = instance.call_dynamic(&mut store, "overflow", &[]).unwrap_err();
    assert!(err.to_string().contains("integer overflow"), "{err}");
    // i32.min % -1 is 0, not a trap
    let got = instance.call_dynamic(&mut store, "rem_min", &[]).unwrap();
    assert_eq!(got, vec![Val::I32(0)]);
}

#[test]
fn memory_store_load_at_page_boundary() {
    let (mut store, instance) = instantiate(
        r#"(module (memory 1)
            (func (export "rw") (param i32) (result i32)
              local.get 0 i32.const 42 i32.store
              local.get 0 i32.load))"#,
    );
    let got: (i32,) = instance.call(&mut store, "rw", (65532,)).unwrap();
    assert_eq!(got, (42,));
    let err = instance.call_dynamic(&mut store, "rw", &[Val::I32(65533)]).unwrap_err();
    assert!(err.to_string().contains("out of bounds memory access"), "{err}");
}

#[test]
fn effective_address_does_not_wrap() {
    let (mut store, instance) = instantiate(
        r#"(module (memory 1)
            (func (export "far") (result i32)
              i32.const -1 i32.load offset=0xffffffff))"#,
    );
    let err = instance.call_dynamic(&mut store, "far", &[]).unwrap_err();
    assert!(err.to_string().contains("out of bounds memory access"), "{err}");
}

#[test]
fn br_with_value_overrides_fallthrough() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module (func (export "f") (result i32)
            (block (result i32) i32.const 1 i32.const 2 br 0)))"#,
    );
    let got: (i32,) = instance.call(&mut store, "f", ())?;
    assert_eq!(got, (2,));
    Ok(())
}

#[test]
fn conditional_branch_merges_both_paths() -> Result<(), anyhow::Error> {
    // One path reaches the block end by br_if carrying a value, the
    // other by fallthrough from a local; both must agree on the slot.
    let (mut store, instance) = instantiate(
        r#"(module (func (export "pick") (param i32) (result i32)
            (block (result i32)
              i32.const 7
              local.get 0
              br_if 0
              drop
              local.get 0)))"#,
    );
    let taken: (i32,) = instance.call(&mut store, "pick", (1,))?;
    assert_eq!(taken, (7,));
    let fallthrough: (i32,) = instance.call(&mut store, "pick", (0,))?;
    assert_eq!(fallthrough, (0,));
    Ok(())
}

#[test]
fn loop_runs_once_without_branch() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module (func (export "f") (result i32)
            (loop (result i32) i32.const 0)))"#,
    );
    let got: (i32,) = instance.call(&mut store, "f", ())?;
    assert_eq!(got, (0,));
    Ok(())
}

#[test]
fn loop_countdown_terminates() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module (func (export "count") (param i32) (result i32)
            (local i32)
            (loop $l (result i32)
              local.get 1
              i32.const 1
              i32.add
              local.set 1
              local.get 1
              local.get 0
              i32.lt_u
              br_if $l
              local.get 1)))"#,
    );
    let got: (i32,) = instance.call(&mut store, "count", (10,))?;
    assert_eq!(got, (10,));
    Ok(())
}

#[test]
fn loop_parameters_carry_across_backedge() -> Result<(), anyhow::Error> {
    // Triangular numbers via a loop parameter: exercises the
    // value-shuffling branch path back to the loop head.
    let (mut store, instance) = instantiate(
        r#"(module (func (export "tri") (param i32) (result i32)
            i32.const 0
            (loop $l (param i32) (result i32)
              local.get 0
              i32.add
              local.get 0
              i32.const 1
              i32.sub
              local.tee 0
              i32.const 0
              i32.gt_s
              br_if $l)))"#,
    );
    let got: (i32,) = instance.call(&mut store, "tri", (4,))?;
    assert_eq!(got, (10,));
    Ok(())
}

#[test]
fn br_table_selects_and_defaults() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module (func (export "switch") (param i32) (result i32)
            (block (result i32)
              (block (result i32)
                (block (result i32)
                  i32.const 10
                  local.get 0
                  br_table 0 1 2)
                i32.const 1 i32.add)
              i32.const 2 i32.add)))"#,
    );
    // case 0 lands innermost: 10 + 1 + 2; case 1: 10 + 2; case 2 and
    // out-of-range take the outermost.
    let cases = [(0, 13), (1, 12), (2, 10), (7, 10)];
    for (arg, want) in cases {
        let got: (i32,) = instance.call(&mut store, "switch", (arg,))?;
        assert_eq!(got, (want,), "case {arg}");
    }
    Ok(())
}

#[test]
fn if_else_blocks() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module
            (func (export "abs") (param i32) (result i32)
              (if (result i32) (i32.lt_s (local.get 0) (i32.const 0))
                (then (i32.sub (i32.const 0) (local.get 0)))
                (else (local.get 0))))
            (func (export "no_else") (param i32) (result i32)
              (local i32)
              (if (local.get 0)
                (then (local.set 1 (i32.const 5))))
              local.get 1))"#,
    );
    let got: (i32,) = instance.call(&mut store, "abs", (-3,))?;
    assert_eq!(got, (3,));
    let got: (i32,) = instance.call(&mut store, "abs", (9,))?;
    assert_eq!(got, (9,));
    let got: (i32,) = instance.call(&mut store, "no_else", (1,))?;
    assert_eq!(got, (5,));
    let got: (i32,) = instance.call(&mut store, "no_else", (0,))?;
    assert_eq!(got, (0,));
    Ok(())
}

#[test]
fn select_copies_the_right_operand() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module
            (func (export "sel32") (param i32) (result i32)
              i32.const 11 i32.const 22 local.get 0 select)
            (func (export "sel64") (param i32) (result i64)
              i64.const 111 i64.const 222 local.get 0 select))"#,
    );
    let got: (i32,) = instance.call(&mut store, "sel32", (1,))?;
    assert_eq!(got, (11,));
    let got: (i32,) = instance.call(&mut store, "sel32", (0,))?;
    assert_eq!(got, (22,));
    let got: (i64,) = instance.call(&mut store, "sel64", (0,))?;
    assert_eq!(got, (222,));
    Ok(())
}

#[test]
fn multi_value_results_and_block_params() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module
            (func (export "pair") (result i32 i64)
              i32.const 4 i64.const 5)
            (func (export "through") (param i32) (result i32)
              local.get 0
              (block (param i32) (result i32)
                i32.const 1
                i32.add)))"#,
    );
    let got: (i32, i64) = instance.call(&mut store, "pair", ())?;
    assert_eq!(got, (4, 5));
    let got: (i32,) = instance.call(&mut store, "through", (41,))?;
    assert_eq!(got, (42,));
    Ok(())
}

#[test]
fn calls_pass_arguments_and_results() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module
            (func $fac (param i64) (result i64)
              (if (result i64) (i64.le_s (local.get 0) (i64.const 1))
                (then (i64.const 1))
                (else
                  (i64.mul
                    (local.get 0)
                    (call $fac (i64.sub (local.get 0) (i64.const 1)))))))
            (func (export "fac") (param i64) (result i64)
              local.get 0 call $fac))"#,
    );
    let got: (i64,) = instance.call(&mut store, "fac", (5i64,))?;
    assert_eq!(got, (120,));
    let got: (i64,) = instance.call(&mut store, "fac", (20i64,))?;
    assert_eq!(got, (2_432_902_008_176_640_000,));
    Ok(())
}

#[test]
fn unbounded_recursion_exhausts_the_stack() {
    let (mut store, instance) = instantiate(
        r#"(module (func $f (export "f") (call $f)))"#,
    );
    let err = instance.call_dynamic(&mut store, "f", &[]).unwrap_err();
    assert!(err.to_string().contains("call stack exhausted"), "{err}");
}

#[test]
fn unreachable_traps() {
    let (mut store, instance) = instantiate(
        r#"(module (func (export "f") unreachable))"#,
    );
    let err = instance.call_dynamic(&mut store, "f", &[]).unwrap_err();
    assert!(err.to_string().contains("unreachable executed"), "{err}");
}

#[test]
fn float_semantics() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module
            (func (export "min") (param f64 f64) (result f64)
              local.get 0 local.get 1 f64.min)
            (func (export "div") (param f32 f32) (result f32)
              local.get 0 local.get 1 f32.div)
            (func (export "nearest") (param f64) (result f64)
              local.get 0 f64.nearest)
            (func (export "sqrt") (param f64) (result f64)
              local.get 0 f64.sqrt))"#,
    );
    // min(-0, +0) keeps the sign bit
    let got: (f64,) = instance.call(&mut store, "min", (-0.0f64, 0.0f64))?;
    assert!(got.0 == 0.0 && got.0.is_sign_negative());
    let got: (f64,) = instance.call(&mut store, "min", (f64::NAN, 1.0f64))?;
    assert!(got.0.is_nan());
    // float division by zero is infinity, not a trap
    let got: (f32,) = instance.call(&mut store, "div", (1.0f32, 0.0f32))?;
    assert_eq!(got.0, f32::INFINITY);
    // ties round to even
    let got: (f64,) = instance.call(&mut store, "nearest", (2.5f64,))?;
    assert_eq!(got.0, 2.0);
    let got: (f64,) = instance.call(&mut store, "nearest", (3.5f64,))?;
    assert_eq!(got.0, 4.0);
    let got: (f64,) = instance.call(&mut store, "sqrt", (9.0f64,))?;
    assert_eq!(got.0, 3.0);
    Ok(())
}

#[test]
fn trapping_and_saturating_truncation() {
    let (mut store, instance) = instantiate(
        r#"(module
            (func (export "trunc") (param f64) (result i32)
              local.get 0 i32.trunc_f64_s)
            (func (export "sat") (param f64) (result i32)
              local.get 0 i32.trunc_sat_f64_s))"#,
    );
    let got: (i32,) = instance.call(&mut store, "trunc", (-3.7f64,)).unwrap();
    assert_eq!(got, (-3,));
    let err = instance.call_dynamic(&mut store, "trunc", &[Val::F64(f64::NAN)]).unwrap_err();
    assert!(err.to_string().contains("invalid conversion to integer"), "{err}");
    let err = instance.call_dynamic(&mut store, "trunc", &[Val::F64(3e10)]).unwrap_err();
    assert!(err.to_string().contains("integer overflow"), "{err}");
    let got: (i32,) = instance.call(&mut store, "sat", (3e10f64,)).unwrap();
    assert_eq!(got, (i32::MAX,));
    let got: (i32,) = instance.call(&mut store, "sat", (f64::NAN,)).unwrap();
    assert_eq!(got, (0,));
}

#[test]
fn bit_counting_is_implemented() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module
            (func (export "pop32") (param i32) (result i32)
              local.get 0 i32.popcnt)
            (func (export "pop64") (param i64) (result i64)
              local.get 0 i64.popcnt)
            (func (export "clz") (param i32) (result i32)
              local.get 0 i32.clz)
            (func (export "ctz") (param i32) (result i32)
              local.get 0 i32.ctz))"#,
    );
    let got: (i32,) = instance.call(&mut store, "pop32", (0x0F0Fi32,))?;
    assert_eq!(got, (8,));
    let got: (i64,) = instance.call(&mut store, "pop64", (-1i64,))?;
    assert_eq!(got, (64,));
    let got: (i32,) = instance.call(&mut store, "clz", (1i32,))?;
    assert_eq!(got, (31,));
    let got: (i32,) = instance.call(&mut store, "ctz", (8i32,))?;
    assert_eq!(got, (3,));
    Ok(())
}

#[test]
fn sign_extension_and_reinterpret() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module
            (func (export "ext8") (param i32) (result i32)
              local.get 0 i32.extend8_s)
            (func (export "bits") (param f32) (result i32)
              local.get 0 i32.reinterpret_f32))"#,
    );
    let got: (i32,) = instance.call(&mut store, "ext8", (0x80i32,))?;
    assert_eq!(got, (-128,));
    let got: (i32,) = instance.call(&mut store, "bits", (1.0f32,))?;
    assert_eq!(got, (0x3f80_0000,));
    Ok(())
}

#[test]
fn narrow_loads_and_stores() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module (memory 1)
            (func (export "mixed") (result i64)
              i32.const 8 i64.const -2 i64.store8
              i32.const 8 i64.load8_s))"#,
    );
    let got: (i64,) = instance.call(&mut store, "mixed", ())?;
    assert_eq!(got, (-2,));
    Ok(())
}

#[test]
fn memory_grow_and_size() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module (memory 1 3)
            (func (export "grow") (param i32) (result i32)
              local.get 0 memory.grow)
            (func (export "size") (result i32) memory.size))"#,
    );
    let got: (i32,) = instance.call(&mut store, "size", ())?;
    assert_eq!(got, (1,));
    let got: (i32,) = instance.call(&mut store, "grow", (2,))?;
    assert_eq!(got, (1,));
    let got: (i32,) = instance.call(&mut store, "grow", (1,))?;
    assert_eq!(got, (-1,));
    let got: (i32,) = instance.call(&mut store, "size", ())?;
    assert_eq!(got, (3,));
    Ok(())
}

#[test]
fn same_inputs_same_outputs() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module (memory 1)
            (func (export "mix") (param i32) (result i32)
              i32.const 0 local.get 0 i32.store
              (i32.mul (i32.load (i32.const 0)) (i32.const 31))))"#,
    );
    let first: (i32,) = instance.call(&mut store, "mix", (12345,))?;
    let second: (i32,) = instance.call(&mut store, "mix", (12345,))?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn direct_local_access_is_unobservable() -> Result<(), anyhow::Error> {
    // Property check: results with and without the direct-reference
    // optimisation agree bitwise.
    let wat = r#"(module
        (func (export "f") (param i32 i32) (result i32)
          (local i32 i32)
          local.get 0
          local.get 1
          i32.add
          local.set 2
          local.get 2
          local.get 0
          i32.sub
          local.tee 3
          (block (result i32)
            local.get 3
            local.get 1
            br_if 0
            drop
            local.get 2)
          i32.xor))"#;
    let mut plain_engine = Engine::default();
    plain_engine.set_direct_local_access(false);
    let engine = Engine::default();

    let module = Module::new(&engine, wat)?;
    let plain_module = Module::new(&plain_engine, wat)?;
    let linker = Linker::new(&engine);
    let plain_linker = Linker::new(&plain_engine);
    let mut store = Store::new(&engine);
    let mut plain_store = Store::new(&plain_engine);
    let instance = linker.instantiate(&mut store, &module)?;
    let plain = plain_linker.instantiate(&mut plain_store, &plain_module)?;

    for args in [(3, 4), (0, 0), (-5, 7), (i32::MAX, 1), (9, 0)] {
        let a: (i32,) = instance.call(&mut store, "f", args)?;
        let b: (i32,) = plain.call(&mut plain_store, "f", args)?;
        assert_eq!(a, b, "args {args:?}");
    }
    Ok(())
}

#[test]
fn dead_code_after_branches_is_suppressed() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module
            (func (export "ret") (result i32)
              (block (result i32)
                i32.const 3
                br 0
                i32.const 4
                i32.add))
            (func (export "after_return") (result i32)
              i32.const 1
              return
              i32.const 2
              i32.add))"#,
    );
    let got: (i32,) = instance.call(&mut store, "ret", ())?;
    assert_eq!(got, (3,));
    let got: (i32,) = instance.call(&mut store, "after_return", ())?;
    assert_eq!(got, (1,));
    Ok(())
}

#[test]
fn conditional_return_keeps_the_fallthrough_alive() -> Result<(), anyhow::Error> {
    let (mut store, instance) = instantiate(
        r#"(module (func (export "f") (param i32) (result i32)
            i32.const 5
            local.get 0
            br_if 0
            i32.const 2
            i32.add))"#,
    );
    let got: (i32,) = instance.call(&mut store, "f", (1,))?;
    assert_eq!(got, (5,));
    let got: (i32,) = instance.call(&mut store, "f", (0,))?;
    assert_eq!(got, (7,));
    Ok(())
}
