//! The bytecode interpreter.
//!
//! One `invoke` per activation: a tight match-dispatch loop over the
//! record stream, reading and writing the activation frame through
//! 16-bit byte offsets. Calls recurse; frames come from the store's
//! execution-stack arena. Exceptions unwind as `Err(Trap::Exception)`
//! and each activation consults its function's catch table on the way
//! up.

use std::rc::Rc;

use wasmparser::ValType;

use crate::bytecode::*;
use crate::instance::InstanceData;
use crate::module::ModuleFunction;
use crate::stack::{ExecStack, Frame};
use crate::store::{FuncKind, Function, Store};
use crate::trap::{Exception, Trap};
use crate::value::{value_size_in_stack, Val};

/// Native-stack budget for the recursive interpreter; checked on every
/// call so deep recursion surfaces as a trap rather than a fault.
const NATIVE_STACK_BUDGET: usize = 1 << 20;

#[inline(never)]
fn approximate_stack_pointer() -> usize {
    let marker = 0u8;
    &marker as *const u8 as usize
}

pub(crate) struct ExecContext<'a> {
    pub(crate) store: &'a Store,
    base: *mut u8,
    capacity: u32,
    sp: u32,
    native_entry: usize,
}

impl<'a> ExecContext<'a> {
    fn alloc(&mut self, size: u32) -> Result<u32, Trap> {
        let new_sp = self.sp.checked_add(size).ok_or(Trap::CallStackExhausted)?;
        if new_sp > self.capacity {
            return Err(Trap::CallStackExhausted);
        }
        let off = self.sp;
        self.sp = new_sp;
        Ok(off)
    }

    fn dealloc(&mut self, to: u32) {
        self.sp = to;
    }

    fn frame(&self, bp: u32) -> Frame {
        Frame::new(unsafe { self.base.add(bp as usize) })
    }

    fn check_native_depth(&self) -> Result<(), Trap> {
        let here = approximate_stack_pointer();
        if self.native_entry.saturating_sub(here) > NATIVE_STACK_BUDGET {
            return Err(Trap::CallStackExhausted);
        }
        Ok(())
    }
}

// --- value <-> frame conversion at call boundaries ---

pub(crate) fn read_val(frame: Frame, off: u16, ty: ValType) -> Val {
    match ty {
        ValType::I32 => Val::I32(frame.read_i32(off)),
        ValType::I64 => Val::I64(frame.read_i64(off)),
        ValType::F32 => Val::F32(frame.read_f32(off)),
        ValType::F64 => Val::F64(frame.read_f64(off)),
        ValType::Ref(_) => Val::from_bits(frame.read_ref(off), ty),
        ValType::V128 => unreachable!("v128 values never reach the interpreter"),
    }
}

pub(crate) fn write_val(frame: Frame, off: u16, val: &Val) {
    match *val {
        Val::I32(v) => frame.write_i32(off, v),
        Val::I64(v) => frame.write_i64(off, v),
        Val::F32(v) => frame.write_f32(off, v),
        Val::F64(v) => frame.write_f64(off, v),
        Val::FuncRef(_) | Val::ExternRef(_) => frame.write_ref(off, val.to_bits()),
        Val::V128(_) => unreachable!("v128 values never reach the interpreter"),
    }
}

// --- public call entry points ---

/// Call any function handle with host values.
pub(crate) fn call_function(
    store: &Store,
    target: &Rc<Function>,
    args: &[Val],
) -> Result<Vec<Val>, Trap> {
    match &target.kind {
        FuncKind::Host { callback } => callback(args),
        FuncKind::Defined { instance, index } => {
            let inst = instance
                .upgrade()
                .ok_or_else(|| Trap::HostError("instance has been dropped".into()))?;
            let mf = inst.module.defined_func(*index).expect("defined function body");
            call_module_function(store, &inst, mf, args)
        }
    }
}

/// Run a compiled function against a fresh frame chain.
pub(crate) fn call_module_function(
    store: &Store,
    instance: &Rc<InstanceData>,
    mf: &ModuleFunction,
    args: &[Val],
) -> Result<Vec<Val>, Trap> {
    debug_assert_eq!(args.len(), mf.ty.params().len());
    // The store's arena is free unless a host callback re-entered the
    // interpreter; then this chain runs on its own scratch arena.
    let mut guard = store.stack.try_borrow_mut().ok();
    let mut scratch = None;
    let stack: &mut ExecStack = match guard.as_deref_mut() {
        Some(s) => s,
        None => scratch.get_or_insert_with(ExecStack::new),
    };
    let mut ctx = ExecContext {
        store,
        base: stack.base_ptr(),
        capacity: stack.capacity(),
        sp: 0,
        native_entry: approximate_stack_pointer(),
    };

    let bp = ctx.alloc(mf.required_stack_size)?;
    let frame = ctx.frame(bp);
    let mut off = 0u32;
    for (v, &p) in args.iter().zip(mf.ty.params()) {
        write_val(frame, off as u16, v);
        off += value_size_in_stack(p);
    }
    frame.zero(off, mf.local_stack_size - off);

    let end_pos = invoke(&mut ctx, instance, mf, bp)?;

    let mut results = Vec::with_capacity(mf.ty.results().len());
    for (i, &rt) in mf.ty.results().iter().enumerate() {
        let src = read_u16(&mf.code, end_pos + 4 + 2 * i);
        results.push(read_val(frame, src, rt));
    }
    Ok(results)
}

// --- calls from inside the loop ---

/// Execute a `Call`/`CallIndirect` transfer: args are read from the
/// caller frame at the record's offsets, results written back behind
/// them.
fn perform_call(
    ctx: &mut ExecContext,
    caller: Frame,
    target: &Rc<Function>,
    code: &[u8],
    offsets_at: usize,
) -> Result<(), Trap> {
    ctx.check_native_depth()?;
    let params = target.ty.params().len();
    match &target.kind {
        FuncKind::Host { callback } => {
            let ty = target.ty.clone();
            let mut args = Vec::with_capacity(params);
            for (i, &p) in ty.params().iter().enumerate() {
                let off = read_u16(code, offsets_at + 2 * i);
                args.push(read_val(caller, off, p));
            }
            let results = callback(&args)?;
            if results.len() != ty.results().len() {
                return Err(Trap::HostError("host function result arity mismatch".into()));
            }
            for (i, r) in results.iter().enumerate() {
                let off = read_u16(code, offsets_at + 2 * (params + i));
                write_val(caller, off, r);
            }
            Ok(())
        }
        FuncKind::Defined { instance, index } => {
            let callee_inst = instance
                .upgrade()
                .ok_or_else(|| Trap::HostError("instance has been dropped".into()))?;
            let mf = callee_inst.module.defined_func(*index).expect("defined function body");

            let saved_sp = ctx.sp;
            let callee_bp = ctx.alloc(mf.required_stack_size)?;
            let callee = ctx.frame(callee_bp);
            let mut dst = 0u32;
            for (i, &p) in mf.ty.params().iter().enumerate() {
                let size = value_size_in_stack(p);
                let src = read_u16(code, offsets_at + 2 * i);
                caller.copy_to(callee, src, dst, size);
                dst += size;
            }
            callee.zero(dst, mf.local_stack_size - dst);

            let outcome = invoke(ctx, &callee_inst, mf, callee_bp);
            let end_pos = match outcome {
                Ok(p) => p,
                Err(trap) => {
                    ctx.dealloc(saved_sp);
                    return Err(trap);
                }
            };
            for (i, &rt) in mf.ty.results().iter().enumerate() {
                let size = value_size_in_stack(rt);
                let src = read_u16(&mf.code, end_pos + 4 + 2 * i);
                let dst = read_u16(code, offsets_at + 2 * (params + i));
                callee.copy_to(caller, src, dst as u32, size);
            }
            ctx.dealloc(saved_sp);
            Ok(())
        }
    }
}

/// Resume at a matching handler, or keep unwinding.
fn catch_or_propagate(
    instance: &InstanceData,
    func: &ModuleFunction,
    frame: Frame,
    pos: usize,
    trap: Trap,
) -> Result<usize, Trap> {
    let exc = match trap {
        Trap::Exception(e) => e,
        other => return Err(other),
    };
    for c in &func.catches {
        if (c.try_start as usize) <= pos && pos < (c.try_end as usize) {
            let matched = match c.tag_index {
                None => true,
                Some(t) => Rc::ptr_eq(&instance.tags[t as usize], &exc.tag),
            };
            if matched {
                frame.write_bytes(c.stack_size_to_be, &exc.payload);
                return Ok(c.catch_start as usize);
            }
        }
    }
    Err(Trap::Exception(exc))
}

// --- numeric helpers ---

fn fmin32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::from_bits(0x7fc0_0000)
    } else if a == b {
        // min(-0, +0) is -0: merge sign bits
        f32::from_bits(a.to_bits() | b.to_bits())
    } else if a < b {
        a
    } else {
        b
    }
}

fn fmax32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::from_bits(0x7fc0_0000)
    } else if a == b {
        f32::from_bits(a.to_bits() & b.to_bits())
    } else if a > b {
        a
    } else {
        b
    }
}

fn fmin64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::from_bits(0x7ff8_0000_0000_0000)
    } else if a == b {
        f64::from_bits(a.to_bits() | b.to_bits())
    } else if a < b {
        a
    } else {
        b
    }
}

fn fmax64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::from_bits(0x7ff8_0000_0000_0000)
    } else if a == b {
        f64::from_bits(a.to_bits() & b.to_bits())
    } else if a > b {
        a
    } else {
        b
    }
}

macro_rules! trunc_checked {
    ($name:ident, $from:ty, $to:ty, $lo:expr, $hi:expr) => {
        fn $name(v: $from) -> Result<$to, Trap> {
            if v.is_nan() {
                return Err(Trap::InvalidConversion);
            }
            let t = v.trunc();
            if t >= $hi || t < $lo {
                return Err(Trap::IntegerOverflow);
            }
            Ok(t as $to)
        }
    };
}

trunc_checked!(trunc_i32_f32, f32, i32, -2147483648.0, 2147483648.0);
trunc_checked!(trunc_u32_f32, f32, u32, 0.0, 4294967296.0);
trunc_checked!(trunc_i32_f64, f64, i32, -2147483648.0, 2147483648.0);
trunc_checked!(trunc_u32_f64, f64, u32, 0.0, 4294967296.0);
trunc_checked!(trunc_i64_f32, f32, i64, -9223372036854775808.0, 9223372036854775808.0);
trunc_checked!(trunc_u64_f32, f32, u64, 0.0, 18446744073709551616.0);
trunc_checked!(trunc_i64_f64, f64, i64, -9223372036854775808.0, 9223372036854775808.0);
trunc_checked!(trunc_u64_f64, f64, u64, 0.0, 18446744073709551616.0);

/// Execute one function activation. Returns the byte position of the
/// `End` record that finished it, whose offsets name the result slots.
pub(crate) fn invoke(
    ctx: &mut ExecContext,
    instance: &Rc<InstanceData>,
    func: &ModuleFunction,
    bp: u32,
) -> Result<usize, Trap> {
    let code: &[u8] = &func.code;
    let frame = ctx.frame(bp);
    let memory = instance.memories.first().cloned();
    let mut pc: usize = 0;

    macro_rules! mem {
        () => {
            memory.as_deref().expect("memory instruction without a memory")
        };
    }

    macro_rules! binop {
        ($read:ident, $write:ident, |$a:ident, $b:ident| $body:expr) => {{
            let $a = frame.$read(read_u16(code, pc + 2));
            let $b = frame.$read(read_u16(code, pc + 4));
            frame.$write(read_u16(code, pc + 6), $body);
            pc += 8;
        }};
    }

    macro_rules! binop_try {
        ($read:ident, $write:ident, |$a:ident, $b:ident| $body:expr) => {{
            let $a = frame.$read(read_u16(code, pc + 2));
            let $b = frame.$read(read_u16(code, pc + 4));
            frame.$write(read_u16(code, pc + 6), $body?);
            pc += 8;
        }};
    }

    macro_rules! cmp {
        ($read:ident, |$a:ident, $b:ident| $body:expr) => {{
            let $a = frame.$read(read_u16(code, pc + 2));
            let $b = frame.$read(read_u16(code, pc + 4));
            frame.write_u32(read_u16(code, pc + 6), $body as u32);
            pc += 8;
        }};
    }

    macro_rules! unop {
        ($read:ident, $write:ident, |$a:ident| $body:expr) => {{
            let $a = frame.$read(read_u16(code, pc + 2));
            frame.$write(read_u16(code, pc + 4), $body);
            pc += 6;
        }};
    }

    macro_rules! unop_try {
        ($read:ident, $write:ident, |$a:ident| $body:expr) => {{
            let $a = frame.$read(read_u16(code, pc + 2));
            frame.$write(read_u16(code, pc + 4), $body?);
            pc += 6;
        }};
    }

    macro_rules! mload {
        ($n:literal, |$b:ident| $conv:expr, $write:ident) => {{
            let offset = read_u32(code, pc + 2) as u64;
            let addr = frame.read_u32(read_u16(code, pc + 6)) as u64 + offset;
            let $b: [u8; $n] = mem!().load(addr)?;
            frame.$write(read_u16(code, pc + 8), $conv);
            pc += 10;
        }};
    }

    macro_rules! mstore {
        ($read:ident, |$v:ident| $bytes:expr) => {{
            let offset = read_u32(code, pc + 2) as u64;
            let addr = frame.read_u32(read_u16(code, pc + 6)) as u64 + offset;
            let $v = frame.$read(read_u16(code, pc + 8));
            mem!().store(addr, &$bytes)?;
            pc += 10;
        }};
    }

    loop {
        let op = read_u16(code, pc);
        match op {
            OP_UNREACHABLE => return Err(Trap::Unreachable),
            OP_END => return Ok(pc),

            OP_JUMP => {
                pc = (pc as i64 + read_i32(code, pc + 2) as i64) as usize;
            }
            OP_JUMP_IF_TRUE => {
                if frame.read_u32(read_u16(code, pc + 2)) != 0 {
                    pc = (pc as i64 + read_i32(code, pc + 4) as i64) as usize;
                } else {
                    pc += JUMP_IF_STRIDE;
                }
            }
            OP_JUMP_IF_FALSE => {
                if frame.read_u32(read_u16(code, pc + 2)) == 0 {
                    pc = (pc as i64 + read_i32(code, pc + 4) as i64) as usize;
                } else {
                    pc += JUMP_IF_STRIDE;
                }
            }
            OP_BR_TABLE => {
                let n = read_u32(code, pc + 4) as usize;
                let idx = (frame.read_u32(read_u16(code, pc + 2)) as usize).min(n);
                let rel = read_i32(code, pc + BR_TABLE_HEAD + 4 * idx);
                pc = (pc as i64 + rel as i64) as usize;
            }

            OP_CALL => {
                let func_idx = read_u32(code, pc + 2) as usize;
                let count = read_u16(code, pc + 6) as usize;
                let target = instance.functions[func_idx].clone();
                match perform_call(ctx, frame, &target, code, pc + 8) {
                    Ok(()) => pc += 8 + 2 * count,
                    Err(trap) => pc = catch_or_propagate(instance, func, frame, pc, trap)?,
                }
            }
            OP_CALL_INDIRECT => {
                let table_idx = read_u32(code, pc + 4) as usize;
                let type_idx = read_u32(code, pc + 8) as usize;
                let params = read_u16(code, pc + 12) as usize;
                let results = read_u16(code, pc + 14) as usize;
                let elem = frame.read_u32(read_u16(code, pc + 2));
                let table = &instance.tables[table_idx];
                if elem >= table.size() {
                    return Err(Trap::UndefinedElement);
                }
                let bits = table.get(elem)?;
                if bits == 0 {
                    return Err(Trap::UninitializedElement);
                }
                let target = ctx
                    .store
                    .func_by_bits(bits)
                    .ok_or_else(|| Trap::HostError("stale function reference".into()))?;
                let expected = &instance.module.data.types[type_idx];
                if *target.ty != **expected {
                    return Err(Trap::IndirectCallTypeMismatch);
                }
                match perform_call(ctx, frame, &target, code, pc + 16) {
                    Ok(()) => pc += 16 + 2 * (params + results),
                    Err(trap) => pc = catch_or_propagate(instance, func, frame, pc, trap)?,
                }
            }

            OP_SELECT => {
                let cond = frame.read_u32(read_u16(code, pc + 2));
                let size = read_u16(code, pc + 4) as u32;
                let src0 = read_u16(code, pc + 6);
                let src1 = read_u16(code, pc + 8);
                let dst = read_u16(code, pc + 10);
                frame.copy(if cond != 0 { src0 } else { src1 }, dst, size);
                pc += 12;
            }

            OP_THROW => {
                let tag_idx = read_u32(code, pc + 2) as usize;
                let tag = instance.tags[tag_idx].clone();
                let params: Vec<ValType> = tag.ty().params().to_vec();
                let mut payload = Vec::new();
                for (i, &p) in params.iter().enumerate() {
                    let off = read_u16(code, pc + 8 + 2 * i);
                    frame.read_bytes(off, value_size_in_stack(p), &mut payload);
                }
                let exc = Trap::Exception(Exception { tag, payload });
                pc = catch_or_propagate(instance, func, frame, pc, exc)?;
            }

            OP_CONST32 => {
                frame.write_u32(read_u16(code, pc + 2), read_u32(code, pc + 4));
                pc += 8;
            }
            OP_CONST64 => {
                frame.write_u64(read_u16(code, pc + 2), read_u64(code, pc + 4));
                pc += 12;
            }
            OP_MOVE32 => {
                frame.copy(read_u16(code, pc + 2), read_u16(code, pc + 4), 4);
                pc += 6;
            }
            OP_MOVE64 => {
                frame.copy(read_u16(code, pc + 2), read_u16(code, pc + 4), 8);
                pc += 6;
            }

            OP_LOAD32 => {
                let addr = frame.read_u32(read_u16(code, pc + 2)) as u64;
                let b: [u8; 4] = mem!().load(addr)?;
                frame.write_u32(read_u16(code, pc + 4), u32::from_le_bytes(b));
                pc += 6;
            }
            OP_LOAD64 => {
                let addr = frame.read_u32(read_u16(code, pc + 2)) as u64;
                let b: [u8; 8] = mem!().load(addr)?;
                frame.write_u64(read_u16(code, pc + 4), u64::from_le_bytes(b));
                pc += 6;
            }
            OP_STORE32 => {
                let addr = frame.read_u32(read_u16(code, pc + 2)) as u64;
                let v = frame.read_u32(read_u16(code, pc + 4));
                mem!().store(addr, &v.to_le_bytes())?;
                pc += 6;
            }
            OP_STORE64 => {
                let addr = frame.read_u32(read_u16(code, pc + 2)) as u64;
                let v = frame.read_u64(read_u16(code, pc + 4));
                mem!().store(addr, &v.to_le_bytes())?;
                pc += 6;
            }

            OP_GLOBAL_GET32 => {
                let g = read_u32(code, pc + 4) as usize;
                frame.write_u32(read_u16(code, pc + 2), instance.globals[g].bits() as u32);
                pc += 8;
            }
            OP_GLOBAL_GET64 => {
                let g = read_u32(code, pc + 4) as usize;
                frame.write_u64(read_u16(code, pc + 2), instance.globals[g].bits());
                pc += 8;
            }
            OP_GLOBAL_SET32 => {
                let g = read_u32(code, pc + 4) as usize;
                instance.globals[g].set_bits(frame.read_u32(read_u16(code, pc + 2)) as u64);
                pc += 8;
            }
            OP_GLOBAL_SET64 => {
                let g = read_u32(code, pc + 4) as usize;
                instance.globals[g].set_bits(frame.read_u64(read_u16(code, pc + 2)));
                pc += 8;
            }

            OP_MEMORY_SIZE => {
                frame.write_u32(read_u16(code, pc + 2), mem!().size_pages());
                pc += 4;
            }
            OP_MEMORY_GROW => {
                let delta = frame.read_u32(read_u16(code, pc + 2));
                frame.write_i32(read_u16(code, pc + 4), mem!().grow(delta));
                pc += 6;
            }
            OP_MEMORY_INIT => {
                let seg = read_u32(code, pc + 2) as usize;
                let d = frame.read_u32(read_u16(code, pc + 6));
                let s = frame.read_u32(read_u16(code, pc + 8));
                let n = frame.read_u32(read_u16(code, pc + 10));
                let dropped = instance.data_dropped.borrow()[seg];
                let bytes: &[u8] =
                    if dropped { &[] } else { &instance.module.data.datas[seg].bytes };
                mem!().init(d, s, n, bytes)?;
                pc += 12;
            }
            OP_MEMORY_COPY => {
                let d = frame.read_u32(read_u16(code, pc + 2));
                let s = frame.read_u32(read_u16(code, pc + 4));
                let n = frame.read_u32(read_u16(code, pc + 6));
                mem!().copy_within(d, s, n)?;
                pc += 8;
            }
            OP_MEMORY_FILL => {
                let d = frame.read_u32(read_u16(code, pc + 2));
                let v = frame.read_u32(read_u16(code, pc + 4));
                let n = frame.read_u32(read_u16(code, pc + 6));
                mem!().fill(d, v as u8, n)?;
                pc += 8;
            }
            OP_DATA_DROP => {
                let seg = read_u32(code, pc + 2) as usize;
                instance.data_dropped.borrow_mut()[seg] = true;
                pc += 6;
            }

            OP_TABLE_GET => {
                let table = &instance.tables[read_u32(code, pc + 2) as usize];
                let idx = frame.read_u32(read_u16(code, pc + 6));
                frame.write_ref(read_u16(code, pc + 8), table.get(idx)?);
                pc += 10;
            }
            OP_TABLE_SET => {
                let table = &instance.tables[read_u32(code, pc + 2) as usize];
                let idx = frame.read_u32(read_u16(code, pc + 6));
                let bits = frame.read_ref(read_u16(code, pc + 8));
                table.set(idx, bits)?;
                pc += 10;
            }
            OP_TABLE_GROW => {
                let table = &instance.tables[read_u32(code, pc + 2) as usize];
                let bits = frame.read_ref(read_u16(code, pc + 6));
                let delta = frame.read_u32(read_u16(code, pc + 8));
                frame.write_i32(read_u16(code, pc + 10), table.grow(bits, delta));
                pc += 12;
            }
            OP_TABLE_SIZE => {
                let table = &instance.tables[read_u32(code, pc + 2) as usize];
                frame.write_u32(read_u16(code, pc + 6), table.size());
                pc += 8;
            }
            OP_TABLE_COPY => {
                let dst_t = instance.tables[read_u32(code, pc + 2) as usize].clone();
                let src_t = instance.tables[read_u32(code, pc + 6) as usize].clone();
                let d = frame.read_u32(read_u16(code, pc + 10));
                let s = frame.read_u32(read_u16(code, pc + 12));
                let n = frame.read_u32(read_u16(code, pc + 14));
                crate::table::Table::copy(&dst_t, &src_t, d, s, n)?;
                pc += 16;
            }
            OP_TABLE_FILL => {
                let table = &instance.tables[read_u32(code, pc + 2) as usize];
                let idx = frame.read_u32(read_u16(code, pc + 6));
                let bits = frame.read_ref(read_u16(code, pc + 8));
                let n = frame.read_u32(read_u16(code, pc + 10));
                table.fill(idx, bits, n)?;
                pc += 12;
            }
            OP_TABLE_INIT => {
                let table = &instance.tables[read_u32(code, pc + 2) as usize];
                let seg = read_u32(code, pc + 6) as usize;
                let d = frame.read_u32(read_u16(code, pc + 10));
                let s = frame.read_u32(read_u16(code, pc + 12));
                let n = frame.read_u32(read_u16(code, pc + 14));
                let segments = instance.elem_segments.borrow();
                let empty: &[u64] = &[];
                let items = segments[seg].as_deref().unwrap_or(empty);
                table.init(d, s, n, items)?;
                pc += 16;
            }
            OP_ELEM_DROP => {
                let seg = read_u32(code, pc + 2) as usize;
                instance.elem_segments.borrow_mut()[seg] = None;
                pc += 6;
            }
            OP_REF_FUNC => {
                let f = read_u32(code, pc + 2) as usize;
                frame.write_ref(read_u16(code, pc + 6), instance.func_ref_ids[f] as u64);
                pc += 8;
            }

            // i32 arithmetic
            OP_I32_ADD => binop!(read_i32, write_i32, |a, b| a.wrapping_add(b)),
            OP_I32_SUB => binop!(read_i32, write_i32, |a, b| a.wrapping_sub(b)),
            OP_I32_MUL => binop!(read_i32, write_i32, |a, b| a.wrapping_mul(b)),
            OP_I32_DIV_S => binop_try!(read_i32, write_i32, |a, b| {
                if b == 0 {
                    Err(Trap::DivideByZero)
                } else if a == i32::MIN && b == -1 {
                    Err(Trap::IntegerOverflow)
                } else {
                    Ok(a.wrapping_div(b))
                }
            }),
            OP_I32_DIV_U => binop_try!(read_u32, write_u32, |a, b| {
                if b == 0 { Err(Trap::DivideByZero) } else { Ok(a / b) }
            }),
            OP_I32_REM_S => binop_try!(read_i32, write_i32, |a, b| {
                if b == 0 { Err(Trap::DivideByZero) } else { Ok(a.wrapping_rem(b)) }
            }),
            OP_I32_REM_U => binop_try!(read_u32, write_u32, |a, b| {
                if b == 0 { Err(Trap::DivideByZero) } else { Ok(a % b) }
            }),
            OP_I32_AND => binop!(read_u32, write_u32, |a, b| a & b),
            OP_I32_OR => binop!(read_u32, write_u32, |a, b| a | b),
            OP_I32_XOR => binop!(read_u32, write_u32, |a, b| a ^ b),
            OP_I32_SHL => binop!(read_u32, write_u32, |a, b| a.wrapping_shl(b)),
            OP_I32_SHR_S => binop!(read_i32, write_i32, |a, b| a.wrapping_shr(b as u32)),
            OP_I32_SHR_U => binop!(read_u32, write_u32, |a, b| a.wrapping_shr(b)),
            OP_I32_ROTL => binop!(read_u32, write_u32, |a, b| a.rotate_left(b)),
            OP_I32_ROTR => binop!(read_u32, write_u32, |a, b| a.rotate_right(b)),
            OP_I32_EQ => cmp!(read_u32, |a, b| a == b),
            OP_I32_NE => cmp!(read_u32, |a, b| a != b),
            OP_I32_LT_S => cmp!(read_i32, |a, b| a < b),
            OP_I32_LT_U => cmp!(read_u32, |a, b| a < b),
            OP_I32_GT_S => cmp!(read_i32, |a, b| a > b),
            OP_I32_GT_U => cmp!(read_u32, |a, b| a > b),
            OP_I32_LE_S => cmp!(read_i32, |a, b| a <= b),
            OP_I32_LE_U => cmp!(read_u32, |a, b| a <= b),
            OP_I32_GE_S => cmp!(read_i32, |a, b| a >= b),
            OP_I32_GE_U => cmp!(read_u32, |a, b| a >= b),

            // i64 arithmetic
            OP_I64_ADD => binop!(read_i64, write_i64, |a, b| a.wrapping_add(b)),
            OP_I64_SUB => binop!(read_i64, write_i64, |a, b| a.wrapping_sub(b)),
            OP_I64_MUL => binop!(read_i64, write_i64, |a, b| a.wrapping_mul(b)),
            OP_I64_DIV_S => binop_try!(read_i64, write_i64, |a, b| {
                if b == 0 {
                    Err(Trap::DivideByZero)
                } else if a == i64::MIN && b == -1 {
                    Err(Trap::IntegerOverflow)
                } else {
                    Ok(a.wrapping_div(b))
                }
            }),
            OP_I64_DIV_U => binop_try!(read_u64, write_u64, |a, b| {
                if b == 0 { Err(Trap::DivideByZero) } else { Ok(a / b) }
            }),
            OP_I64_REM_S => binop_try!(read_i64, write_i64, |a, b| {
                if b == 0 { Err(Trap::DivideByZero) } else { Ok(a.wrapping_rem(b)) }
            }),
            OP_I64_REM_U => binop_try!(read_u64, write_u64, |a, b| {
                if b == 0 { Err(Trap::DivideByZero) } else { Ok(a % b) }
            }),
            OP_I64_AND => binop!(read_u64, write_u64, |a, b| a & b),
            OP_I64_OR => binop!(read_u64, write_u64, |a, b| a | b),
            OP_I64_XOR => binop!(read_u64, write_u64, |a, b| a ^ b),
            OP_I64_SHL => binop!(read_u64, write_u64, |a, b| a.wrapping_shl(b as u32)),
            OP_I64_SHR_S => binop!(read_i64, write_i64, |a, b| a.wrapping_shr(b as u32)),
            OP_I64_SHR_U => binop!(read_u64, write_u64, |a, b| a.wrapping_shr(b as u32)),
            OP_I64_ROTL => binop!(read_u64, write_u64, |a, b| a.rotate_left(b as u32)),
            OP_I64_ROTR => binop!(read_u64, write_u64, |a, b| a.rotate_right(b as u32)),
            OP_I64_EQ => cmp!(read_u64, |a, b| a == b),
            OP_I64_NE => cmp!(read_u64, |a, b| a != b),
            OP_I64_LT_S => cmp!(read_i64, |a, b| a < b),
            OP_I64_LT_U => cmp!(read_u64, |a, b| a < b),
            OP_I64_GT_S => cmp!(read_i64, |a, b| a > b),
            OP_I64_GT_U => cmp!(read_u64, |a, b| a > b),
            OP_I64_LE_S => cmp!(read_i64, |a, b| a <= b),
            OP_I64_LE_U => cmp!(read_u64, |a, b| a <= b),
            OP_I64_GE_S => cmp!(read_i64, |a, b| a >= b),
            OP_I64_GE_U => cmp!(read_u64, |a, b| a >= b),

            // f32 arithmetic
            OP_F32_ADD => binop!(read_f32, write_f32, |a, b| a + b),
            OP_F32_SUB => binop!(read_f32, write_f32, |a, b| a - b),
            OP_F32_MUL => binop!(read_f32, write_f32, |a, b| a * b),
            OP_F32_DIV => binop!(read_f32, write_f32, |a, b| a / b),
            OP_F32_MIN => binop!(read_f32, write_f32, |a, b| fmin32(a, b)),
            OP_F32_MAX => binop!(read_f32, write_f32, |a, b| fmax32(a, b)),
            OP_F32_COPYSIGN => binop!(read_f32, write_f32, |a, b| a.copysign(b)),
            OP_F32_EQ => cmp!(read_f32, |a, b| a == b),
            OP_F32_NE => cmp!(read_f32, |a, b| a != b),
            OP_F32_LT => cmp!(read_f32, |a, b| a < b),
            OP_F32_GT => cmp!(read_f32, |a, b| a > b),
            OP_F32_LE => cmp!(read_f32, |a, b| a <= b),
            OP_F32_GE => cmp!(read_f32, |a, b| a >= b),

            // f64 arithmetic
            OP_F64_ADD => binop!(read_f64, write_f64, |a, b| a + b),
            OP_F64_SUB => binop!(read_f64, write_f64, |a, b| a - b),
            OP_F64_MUL => binop!(read_f64, write_f64, |a, b| a * b),
            OP_F64_DIV => binop!(read_f64, write_f64, |a, b| a / b),
            OP_F64_MIN => binop!(read_f64, write_f64, |a, b| fmin64(a, b)),
            OP_F64_MAX => binop!(read_f64, write_f64, |a, b| fmax64(a, b)),
            OP_F64_COPYSIGN => binop!(read_f64, write_f64, |a, b| a.copysign(b)),
            OP_F64_EQ => cmp!(read_f64, |a, b| a == b),
            OP_F64_NE => cmp!(read_f64, |a, b| a != b),
            OP_F64_LT => cmp!(read_f64, |a, b| a < b),
            OP_F64_GT => cmp!(read_f64, |a, b| a > b),
            OP_F64_LE => cmp!(read_f64, |a, b| a <= b),
            OP_F64_GE => cmp!(read_f64, |a, b| a >= b),

            // unary
            OP_I32_CLZ => unop!(read_u32, write_u32, |a| a.leading_zeros()),
            OP_I32_CTZ => unop!(read_u32, write_u32, |a| a.trailing_zeros()),
            OP_I32_POPCNT => unop!(read_u32, write_u32, |a| a.count_ones()),
            OP_I32_EQZ => unop!(read_u32, write_u32, |a| (a == 0) as u32),
            OP_I32_EXTEND8_S => unop!(read_i32, write_i32, |a| a as i8 as i32),
            OP_I32_EXTEND16_S => unop!(read_i32, write_i32, |a| a as i16 as i32),
            OP_I64_CLZ => unop!(read_u64, write_u64, |a| a.leading_zeros() as u64),
            OP_I64_CTZ => unop!(read_u64, write_u64, |a| a.trailing_zeros() as u64),
            OP_I64_POPCNT => unop!(read_u64, write_u64, |a| a.count_ones() as u64),
            OP_I64_EQZ => unop!(read_u64, write_u32, |a| (a == 0) as u32),
            OP_I64_EXTEND8_S => unop!(read_i64, write_i64, |a| a as i8 as i64),
            OP_I64_EXTEND16_S => unop!(read_i64, write_i64, |a| a as i16 as i64),
            OP_I64_EXTEND32_S => unop!(read_i64, write_i64, |a| a as i32 as i64),
            OP_F32_ABS => unop!(read_f32, write_f32, |a| a.abs()),
            OP_F32_NEG => unop!(read_f32, write_f32, |a| -a),
            OP_F32_CEIL => unop!(read_f32, write_f32, |a| a.ceil()),
            OP_F32_FLOOR => unop!(read_f32, write_f32, |a| a.floor()),
            OP_F32_TRUNC => unop!(read_f32, write_f32, |a| a.trunc()),
            OP_F32_NEAREST => unop!(read_f32, write_f32, |a| a.round_ties_even()),
            OP_F32_SQRT => unop!(read_f32, write_f32, |a| a.sqrt()),
            OP_F64_ABS => unop!(read_f64, write_f64, |a| a.abs()),
            OP_F64_NEG => unop!(read_f64, write_f64, |a| -a),
            OP_F64_CEIL => unop!(read_f64, write_f64, |a| a.ceil()),
            OP_F64_FLOOR => unop!(read_f64, write_f64, |a| a.floor()),
            OP_F64_TRUNC => unop!(read_f64, write_f64, |a| a.trunc()),
            OP_F64_NEAREST => unop!(read_f64, write_f64, |a| a.round_ties_even()),
            OP_F64_SQRT => unop!(read_f64, write_f64, |a| a.sqrt()),

            // conversions
            OP_I32_WRAP_I64 => unop!(read_i64, write_i32, |a| a as i32),
            OP_I64_EXTEND_I32_S => unop!(read_i32, write_i64, |a| a as i64),
            OP_I64_EXTEND_I32_U => unop!(read_u32, write_u64, |a| a as u64),
            OP_I32_TRUNC_F32_S => unop_try!(read_f32, write_i32, |a| trunc_i32_f32(a)),
            OP_I32_TRUNC_F32_U => unop_try!(read_f32, write_u32, |a| trunc_u32_f32(a)),
            OP_I32_TRUNC_F64_S => unop_try!(read_f64, write_i32, |a| trunc_i32_f64(a)),
            OP_I32_TRUNC_F64_U => unop_try!(read_f64, write_u32, |a| trunc_u32_f64(a)),
            OP_I64_TRUNC_F32_S => unop_try!(read_f32, write_i64, |a| trunc_i64_f32(a)),
            OP_I64_TRUNC_F32_U => unop_try!(read_f32, write_u64, |a| trunc_u64_f32(a)),
            OP_I64_TRUNC_F64_S => unop_try!(read_f64, write_i64, |a| trunc_i64_f64(a)),
            OP_I64_TRUNC_F64_U => unop_try!(read_f64, write_u64, |a| trunc_u64_f64(a)),
            OP_I32_TRUNC_SAT_F32_S => unop!(read_f32, write_i32, |a| a as i32),
            OP_I32_TRUNC_SAT_F32_U => unop!(read_f32, write_u32, |a| a as u32),
            OP_I32_TRUNC_SAT_F64_S => unop!(read_f64, write_i32, |a| a as i32),
            OP_I32_TRUNC_SAT_F64_U => unop!(read_f64, write_u32, |a| a as u32),
            OP_I64_TRUNC_SAT_F32_S => unop!(read_f32, write_i64, |a| a as i64),
            OP_I64_TRUNC_SAT_F32_U => unop!(read_f32, write_u64, |a| a as u64),
            OP_I64_TRUNC_SAT_F64_S => unop!(read_f64, write_i64, |a| a as i64),
            OP_I64_TRUNC_SAT_F64_U => unop!(read_f64, write_u64, |a| a as u64),
            OP_F32_CONVERT_I32_S => unop!(read_i32, write_f32, |a| a as f32),
            OP_F32_CONVERT_I32_U => unop!(read_u32, write_f32, |a| a as f32),
            OP_F32_CONVERT_I64_S => unop!(read_i64, write_f32, |a| a as f32),
            OP_F32_CONVERT_I64_U => unop!(read_u64, write_f32, |a| a as f32),
            OP_F64_CONVERT_I32_S => unop!(read_i32, write_f64, |a| a as f64),
            OP_F64_CONVERT_I32_U => unop!(read_u32, write_f64, |a| a as f64),
            OP_F64_CONVERT_I64_S => unop!(read_i64, write_f64, |a| a as f64),
            OP_F64_CONVERT_I64_U => unop!(read_u64, write_f64, |a| a as f64),
            OP_F32_DEMOTE_F64 => unop!(read_f64, write_f32, |a| a as f32),
            OP_F64_PROMOTE_F32 => unop!(read_f32, write_f64, |a| a as f64),

            // memory loads
            OP_I32_LOAD => mload!(4, |b| u32::from_le_bytes(b), write_u32),
            OP_I64_LOAD => mload!(8, |b| u64::from_le_bytes(b), write_u64),
            OP_F32_LOAD => mload!(4, |b| u32::from_le_bytes(b), write_u32),
            OP_F64_LOAD => mload!(8, |b| u64::from_le_bytes(b), write_u64),
            OP_I32_LOAD8_S => mload!(1, |b| i8::from_le_bytes(b) as i32, write_i32),
            OP_I32_LOAD8_U => mload!(1, |b| u8::from_le_bytes(b) as u32, write_u32),
            OP_I32_LOAD16_S => mload!(2, |b| i16::from_le_bytes(b) as i32, write_i32),
            OP_I32_LOAD16_U => mload!(2, |b| u16::from_le_bytes(b) as u32, write_u32),
            OP_I64_LOAD8_S => mload!(1, |b| i8::from_le_bytes(b) as i64, write_i64),
            OP_I64_LOAD8_U => mload!(1, |b| u8::from_le_bytes(b) as u64, write_u64),
            OP_I64_LOAD16_S => mload!(2, |b| i16::from_le_bytes(b) as i64, write_i64),
            OP_I64_LOAD16_U => mload!(2, |b| u16::from_le_bytes(b) as u64, write_u64),
            OP_I64_LOAD32_S => mload!(4, |b| i32::from_le_bytes(b) as i64, write_i64),
            OP_I64_LOAD32_U => mload!(4, |b| u32::from_le_bytes(b) as u64, write_u64),

            // memory stores
            OP_I32_STORE => mstore!(read_u32, |v| v.to_le_bytes()),
            OP_I64_STORE => mstore!(read_u64, |v| v.to_le_bytes()),
            OP_F32_STORE => mstore!(read_u32, |v| v.to_le_bytes()),
            OP_F64_STORE => mstore!(read_u64, |v| v.to_le_bytes()),
            OP_I32_STORE8 => mstore!(read_u32, |v| (v as u8).to_le_bytes()),
            OP_I32_STORE16 => mstore!(read_u32, |v| (v as u16).to_le_bytes()),
            OP_I64_STORE8 => mstore!(read_u64, |v| (v as u8).to_le_bytes()),
            OP_I64_STORE16 => mstore!(read_u64, |v| (v as u16).to_le_bytes()),
            OP_I64_STORE32 => mstore!(read_u64, |v| (v as u32).to_le_bytes()),

            other => unreachable!("corrupt bytecode: opcode {other} at {pc}"),
        }
    }
}
