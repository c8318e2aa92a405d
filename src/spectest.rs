//! The `spectest` host module the conformance harness links against.
//!
//! Mirrors the reference interpreter's host module: constant globals, a
//! small funcref table and memory, and print functions whose side effect
//! is a line on stdout.

use wasmparser::ValType;

use crate::trap::Trap;
use crate::value::Val;
use crate::{Linker, Store};

fn print_vals(vals: &[Val]) {
    for v in vals {
        match v {
            Val::I32(v) => println!("{v} : i32"),
            Val::I64(v) => println!("{v} : i64"),
            Val::F32(v) => println!("{v} : f32"),
            Val::F64(v) => println!("{v} : f64"),
            other => println!("{other:?}"),
        }
    }
}

fn print_fn(vals: &[Val]) -> Result<Vec<Val>, Trap> {
    print_vals(vals);
    Ok(Vec::new())
}

/// Install the spectest module into a linker.
pub fn link(linker: &mut Linker, _store: &mut Store) {
    linker.global("spectest", "global_i32", Val::I32(666), false);
    linker.global("spectest", "global_i64", Val::I64(666), false);
    linker.global("spectest", "global_f32", Val::F32(f32::from_bits(0x4426_8000)), false);
    linker.global("spectest", "global_f64", Val::F64(f64::from_bits(0x4084_D000_0000_0000)), false);
    linker.table("spectest", "table", 10, Some(20));
    linker.memory("spectest", "memory", 1, Some(2));

    linker.func("spectest", "print", vec![], vec![], print_fn);
    linker.func("spectest", "print_i32", vec![ValType::I32], vec![], print_fn);
    linker.func("spectest", "print_i64", vec![ValType::I64], vec![], print_fn);
    linker.func("spectest", "print_f32", vec![ValType::F32], vec![], print_fn);
    linker.func("spectest", "print_f64", vec![ValType::F64], vec![], print_fn);
    linker.func(
        "spectest",
        "print_i32_f32",
        vec![ValType::I32, ValType::F32],
        vec![],
        print_fn,
    );
    linker.func(
        "spectest",
        "print_f64_f64",
        vec![ValType::F64, ValType::F64],
        vec![],
        print_fn,
    );
}
