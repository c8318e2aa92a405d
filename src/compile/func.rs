//! The function-body compiler.
//!
//! Translates a validated operator stream into the stack-offset bytecode
//! of `crate::bytecode`. The compiler models Wasm's implicit operand
//! stack as a vector of entries carrying frame offsets (`vm`), so most
//! opcodes compile to records that read and write frame slots directly.
//!
//! Two offsets per entry: `pos` is where the value actually lives, which
//! for a `local.get` under the direct-access optimisation is the local's
//! own slot; `raw_pos` is where it would live had we reserved fresh
//! space. Branches that carry values shuffle them to their raw positions
//! so every path into a merge point agrees on the layout.
//!
//! When a `local.set`/`local.tee` would overwrite a local that live
//! stack entries alias directly, the whole body is recompiled from the
//! start with that local's direct access disabled. One flag is cleared
//! per restart, so restarts are bounded by the local count.

use std::rc::Rc;

use wasmparser::{BlockType, Operator, ValType};

use crate::bytecode::*;
use crate::module::{CatchInfo, FunctionType, GlobalType, ModuleFunction};
use crate::value::{value_size_in_stack, REF_SIZE};

/// Error string for a frame deeper than the 16-bit offsets can address.
const STACK_OVERFLOW: &str = "too many stack usage";

/// Module-level context the body compiler consults.
pub(crate) struct ModuleTypes<'a> {
    pub types: &'a [Rc<FunctionType>],
    /// Type index per function in the index space (imports first).
    pub func_types: &'a [u32],
    pub global_types: &'a [GlobalType],
    /// Signature type index per tag.
    pub tags: &'a [u32],
}

impl ModuleTypes<'_> {
    fn func_type(&self, func_idx: u32) -> &Rc<FunctionType> {
        &self.types[self.func_types[func_idx as usize] as usize]
    }

    fn tag_type(&self, tag_idx: u32) -> &Rc<FunctionType> {
        &self.types[self.tags[tag_idx as usize] as usize]
    }
}

/// One value on the compile-time model of the operand stack.
#[derive(Debug, Clone, Copy)]
struct StackEntry {
    size: u32,
    /// Frame offset this value reads from.
    pos: u32,
    /// Frame offset it would occupy without direct local access.
    raw_pos: u32,
    /// The local this entry aliases, if any.
    local: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Block,
    Loop,
    If,
    Try,
}

#[derive(Debug, Clone, Copy)]
enum JumpKind {
    /// Position of a `Jump` record.
    Jump,
    /// Position of a `JumpIfTrue`/`JumpIfFalse` record.
    JumpIf,
    /// Absolute position of one `i32` cell inside a `BrTable` record.
    BrTable,
}

#[derive(Debug, Clone, Copy)]
struct PendingJump {
    kind: JumpKind,
    pos: usize,
}

/// Compile-time record for an open structured block.
struct Block {
    kind: BlockKind,
    ty: BlockType,
    /// Bytecode position of the block start (branch target for loops).
    pos: usize,
    /// Operand-stack snapshot at entry.
    stack: Vec<StackEntry>,
    /// Watermark at entry.
    height: u32,
    /// Raw positions the block's parameters were pinned to at entry.
    param_positions: Vec<u32>,
    /// Forward jumps to patch to the block end.
    jumps: Vec<PendingJump>,
    restore_at_end: bool,
    gen_stopped: bool,
}

/// Not-yet-committed exception handler range.
struct PendingCatch {
    /// Block-stack depth of the owning try (with the try still pushed).
    depth: usize,
    try_start: usize,
    try_end: usize,
    catch_start: usize,
    tag: Option<u32>,
}

/// What the previous operator emitted, for the writeback-folding
/// peephole. Cleared at the start of every operator so it only ever
/// describes the record the *immediately preceding* event pushed.
#[derive(Debug, Clone, Copy)]
enum LastEmitted {
    None,
    Const { pos: usize },
    Binary { pos: usize },
}

pub(crate) struct FuncCompiler<'m> {
    ctx: &'m ModuleTypes<'m>,
    ty: Rc<FunctionType>,
    locals: Vec<ValType>,
    /// Precomputed (offset, size) per local index, params first.
    local_slots: Vec<(u32, u32)>,
    /// Params + locals frame bytes; the watermark floor.
    initial_height: u32,
    height: u32,
    required: u32,
    buf: CodeBuf,
    vm: Vec<StackEntry>,
    blocks: Vec<Block>,
    catches: Vec<PendingCatch>,
    committed: Vec<CatchInfo>,
    /// Per-local direct-access flag; survives restarts.
    direct_ok: Vec<bool>,
    last: LastEmitted,
    generating: bool,
    /// Nested block ends to consume before generation resumes.
    skip_depth: u32,
    restart: bool,
    direct_enabled: bool,
}

impl<'m> FuncCompiler<'m> {
    pub(crate) fn new(
        ctx: &'m ModuleTypes<'m>,
        ty: Rc<FunctionType>,
        locals: Vec<ValType>,
        direct_enabled: bool,
    ) -> Result<Self, String> {
        let mut local_slots = Vec::with_capacity(ty.params().len() + locals.len());
        let mut offset = 0u32;
        for &p in ty.params().iter().chain(locals.iter()) {
            let size = value_size_in_stack(p);
            local_slots.push((offset, size));
            offset += size;
        }
        if offset > u16::MAX as u32 {
            return Err(STACK_OVERFLOW.into());
        }
        let count = local_slots.len();
        Ok(FuncCompiler {
            ctx,
            ty,
            locals,
            local_slots,
            initial_height: offset,
            height: offset,
            required: offset,
            buf: CodeBuf::new(),
            vm: Vec::new(),
            blocks: Vec::new(),
            catches: Vec::new(),
            committed: Vec::new(),
            direct_ok: vec![true; count],
            last: LastEmitted::None,
            generating: true,
            skip_depth: 0,
            restart: false,
            direct_enabled,
        })
    }

    /// Compile the operator stream (which includes the terminating `end`).
    pub(crate) fn compile(mut self, ops: &[Operator]) -> Result<ModuleFunction, String> {
        'restart: loop {
            self.reset();
            for op in ops {
                self.step(op)?;
                if self.restart {
                    continue 'restart;
                }
            }
            break;
        }
        Ok(ModuleFunction {
            ty: self.ty,
            locals: self.locals,
            local_stack_size: self.initial_height,
            required_stack_size: self.required,
            code: self.buf.into_bytes(),
            catches: self.committed,
        })
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.vm.clear();
        self.blocks.clear();
        self.catches.clear();
        self.committed.clear();
        self.height = self.initial_height;
        self.last = LastEmitted::None;
        self.generating = true;
        self.skip_depth = 0;
        self.restart = false;
    }

    // --- operand stack model ---

    fn push_at(&mut self, size: u32, pos: u32, local: Option<u32>) -> Result<(), String> {
        self.vm.push(StackEntry { size, pos, raw_pos: self.height, local });
        self.height += size;
        if self.height > u16::MAX as u32 {
            return Err(STACK_OVERFLOW.into());
        }
        self.required = self.required.max(self.height);
        Ok(())
    }

    fn push_stack(&mut self, size: u32) -> Result<u32, String> {
        let pos = self.height;
        self.push_at(size, pos, None)?;
        Ok(pos)
    }

    fn pop_info(&mut self) -> StackEntry {
        let e = self.vm.pop().expect("operand stack underflow after validation");
        self.height -= e.size;
        e
    }

    fn pop_pos(&mut self) -> u32 {
        self.pop_info().pos
    }

    fn peek(&self) -> &StackEntry {
        self.vm.last().expect("operand stack underflow after validation")
    }

    fn restore_stack(&mut self, stack: &[StackEntry], height: u32) {
        self.vm.clear();
        self.vm.extend_from_slice(stack);
        self.height = height;
    }

    // --- direct local access ---

    fn local_is_aliased(&self, local: u32) -> bool {
        self.vm.iter().any(|e| e.local == Some(local))
    }

    fn can_use_direct(&self, local: u32, pos: u32) -> bool {
        if !self.direct_enabled || !self.direct_ok[local as usize] {
            return false;
        }
        // A slot a block pinned its parameters to must not be aliased.
        !self.blocks.iter().any(|b| b.param_positions.contains(&pos))
    }

    /// Disable direct access for `local` and recompile the body.
    fn rewind(&mut self, local: u32) {
        self.direct_ok[local as usize] = false;
        self.restart = true;
    }

    // --- emission ---

    fn emit_move_if_needed(&mut self, src: u32, dst: u32, size: u32) {
        if src != dst {
            self.buf.push_move(src as u16, dst as u16, size);
        }
    }

    fn emit_const32(&mut self, dst: u32, value: u32) {
        let pos = self.buf.len();
        self.buf.push_const32(dst as u16, value);
        self.last = LastEmitted::Const { pos };
    }

    fn emit_const64(&mut self, dst: u32, value: u64) {
        let pos = self.buf.len();
        self.buf.push_const64(dst as u16, value);
        self.last = LastEmitted::Const { pos };
    }

    fn emit_binary(&mut self, op: u16, src0: u32, src1: u32, dst: u32) {
        let pos = self.buf.len();
        self.buf.push_binary(op, src0 as u16, src1 as u16, dst as u16);
        self.last = LastEmitted::Binary { pos };
    }

    // --- generation stop/resume ---

    fn stop_generation(&mut self) {
        if !self.generating {
            return;
        }
        self.generating = false;
        if let Some(top) = self.blocks.last_mut() {
            self.skip_depth = 1;
            top.restore_at_end = true;
            top.gen_stopped = true;
        } else {
            // Function-level: dead until the body's final end.
            self.skip_depth = 0;
        }
    }

    /// Handle an operator while generation is stopped. Returns `true`
    /// when the operator was consumed (skipped); `false` when it resumes
    /// generation and must be processed normally.
    fn skip(&mut self, op: &Operator) -> bool {
        match op {
            Operator::Block { .. }
            | Operator::Loop { .. }
            | Operator::If { .. }
            | Operator::Try { .. }
            | Operator::TryTable { .. } => {
                if self.skip_depth > 0 {
                    self.skip_depth += 1;
                }
                true
            }
            // A dead `delegate` closes its try like an `end`; one that
            // would resume generation is reported as unsupported.
            Operator::Delegate { .. } if self.skip_depth > 1 => {
                self.skip_depth -= 1;
                true
            }
            Operator::Else | Operator::Catch { .. } | Operator::CatchAll if self.skip_depth == 1 => {
                self.skip_depth = 0;
                self.generating = true;
                false
            }
            Operator::End => {
                match self.skip_depth {
                    0 => true, // dead until the function's final end
                    1 => {
                        self.skip_depth = 0;
                        self.generating = true;
                        false
                    }
                    _ => {
                        self.skip_depth -= 1;
                        true
                    }
                }
            }
            _ => true,
        }
    }

    // --- blocks ---

    fn block_param_count(&self, ty: BlockType) -> usize {
        match ty {
            BlockType::FuncType(i) => self.ctx.types[i as usize].params().len(),
            _ => 0,
        }
    }

    fn begin_block(&mut self, kind: BlockKind, ty: BlockType) -> Result<(), String> {
        let mut param_positions = Vec::new();
        let n = self.block_param_count(ty);
        if n > 0 {
            // Pin the block parameters to their raw positions so every
            // branch back into the block finds them in one layout.
            let len = self.vm.len();
            for i in len - n..len {
                let e = self.vm[i];
                param_positions.push(e.raw_pos);
                if e.pos != e.raw_pos {
                    self.emit_move_if_needed(e.pos, e.raw_pos, e.size);
                    self.vm[i].pos = e.raw_pos;
                }
            }
        }
        self.blocks.push(Block {
            kind,
            ty,
            pos: self.buf.len(),
            stack: self.vm.clone(),
            height: self.height,
            param_positions,
            jumps: Vec::new(),
            restore_at_end: false,
            gen_stopped: false,
        });
        Ok(())
    }

    /// Bytes to drop above the target block's entry stack and the bytes
    /// of values that must be carried across the branch.
    fn drop_for_depth(&self, depth: usize) -> (u32, u32) {
        let mut drop = 0u32;
        let mut param = 0u32;
        if depth < self.blocks.len() {
            let block = &self.blocks[self.blocks.len() - 1 - depth];
            if block.stack.len() < self.vm.len() {
                for e in &self.vm[block.stack.len()..] {
                    drop += e.size;
                }
                if block.kind == BlockKind::Loop {
                    if let BlockType::FuncType(i) = block.ty {
                        let sz = self.ctx.types[i as usize].param_stack_size();
                        drop += sz;
                        param += sz;
                    }
                } else {
                    match block.ty {
                        BlockType::FuncType(i) => {
                            param += self.ctx.types[i as usize].result_stack_size();
                        }
                        BlockType::Type(t) => param += value_size_in_stack(t),
                        BlockType::Empty => {}
                    }
                }
            }
        } else if let Some(block) = self.blocks.first() {
            for e in &self.vm[block.stack.len()..] {
                drop += e.size;
            }
        }
        (drop, param)
    }

    /// Shuffle the top `param` bytes of values into the raw slots at the
    /// bottom of the to-be-dropped region, deepest first so newer values
    /// are not clobbered before they are read.
    fn emit_branch_moves(&mut self, drop: u32, param: u32) {
        let locate = |vm: &[StackEntry], mut bytes: i64| -> Option<usize> {
            let mut i = vm.len();
            while bytes > 0 {
                if i == 0 {
                    return None;
                }
                i -= 1;
                bytes -= vm[i].size as i64;
            }
            if bytes < 0 {
                None // stack mismatch in dead code
            } else {
                Some(i)
            }
        };
        let (Some(mut src), Some(mut dst)) =
            (locate(&self.vm, param as i64), locate(&self.vm, drop as i64))
        else {
            return;
        };
        let mut remain = param;
        while remain > 0 {
            let (spos, ssize) = (self.vm[src].pos, self.vm[src].size);
            let draw = self.vm[dst].raw_pos;
            self.emit_move_if_needed(spos, draw, ssize);
            remain -= ssize;
            src += 1;
            dst += 1;
        }
    }

    /// On else/catch of a block that produces values, pin the current
    /// sub-result to its raw position and restore the entry stack at the
    /// block's end.
    fn keep_sub_results(&mut self) {
        let ty = self.blocks.last().expect("open block").ty;
        if !matches!(ty, BlockType::Empty) {
            self.blocks.last_mut().expect("open block").restore_at_end = true;
            let (drop, param) = self.drop_for_depth(0);
            if param > 0 {
                self.emit_branch_moves(drop, param);
            }
        }
    }

    /// Rebalance the operand stack when leaving a branch arm (else or
    /// catch): either restore the entry snapshot or pop the arm's
    /// results.
    fn restore_at_branch_point(&mut self) {
        let (restore, ty, stack, height) = {
            let b = self.blocks.last().expect("open block");
            (b.restore_at_end, b.ty, b.stack.clone(), b.height)
        };
        if restore {
            self.restore_stack(&stack, height);
            return;
        }
        match ty {
            BlockType::FuncType(i) => {
                let ft = self.ctx.types[i as usize].clone();
                if !ft.params().is_empty() {
                    self.restore_stack(&stack, height);
                } else {
                    for _ in 0..ft.results().len() {
                        self.pop_info();
                    }
                }
            }
            BlockType::Type(_) => {
                self.pop_info();
            }
            BlockType::Empty => {}
        }
    }

    fn on_else(&mut self) {
        self.keep_sub_results();
        let jump_pos = self.buf.len();
        let block = self.blocks.last_mut().expect("else outside if");
        // The first pending jump is the if's JumpIfFalse; it now targets
        // the start of the else arm instead of the block end.
        let jif = block.jumps.remove(0);
        block.jumps.push(PendingJump { kind: JumpKind::Jump, pos: jump_pos });
        self.buf.push_jump(0);
        self.restore_at_branch_point();
        let here = self.buf.len();
        self.buf.set_cond_jump_rel(jif.pos, (here - jif.pos) as i32);
    }

    fn on_catch(&mut self, tag: Option<u32>) -> Result<(), String> {
        debug_assert_eq!(self.blocks.last().map(|b| b.kind), Some(BlockKind::Try));
        self.keep_sub_results();
        self.restore_at_branch_point();

        // All catches of one try share the try range recorded by the
        // first; later catch clauses start after the previous handler.
        let mut try_end = self.buf.len();
        if let Some(last) = self.catches.last() {
            if last.depth == self.blocks.len() {
                try_end = last.try_end;
            }
        }
        let jump_pos = self.buf.len();
        let block = self.blocks.last_mut().expect("open try");
        let try_start = block.pos;
        block.jumps.push(PendingJump { kind: JumpKind::Jump, pos: jump_pos });
        self.buf.push_jump(0);

        self.catches.push(PendingCatch {
            depth: self.blocks.len(),
            try_start,
            try_end,
            catch_start: self.buf.len(),
            tag,
        });

        if let Some(tag) = tag {
            let params: Vec<ValType> = self.ctx.tag_type(tag).params().to_vec();
            for p in params {
                self.push_stack(value_size_in_stack(p))?;
            }
        }
        Ok(())
    }

    fn on_end(&mut self) -> Result<(), String> {
        if self.blocks.is_empty() {
            self.generate_end();
            return Ok(());
        }
        let drop_size = self.drop_for_depth(0);
        let block = self.blocks.pop().expect("open block");
        match block.kind {
            BlockKind::Try => {
                // Commit this try's handlers, annotated with the frame
                // watermark to restore on handler entry.
                let stack_size_to_be =
                    self.initial_height + block.stack.iter().map(|e| e.size).sum::<u32>();
                let depth = self.blocks.len() + 1;
                let mut i = 0;
                while i < self.catches.len() {
                    if self.catches[i].depth == depth {
                        let c = self.catches.remove(i);
                        self.committed.push(CatchInfo {
                            try_start: c.try_start as u32,
                            try_end: c.try_end as u32,
                            catch_start: c.catch_start as u32,
                            stack_size_to_be,
                            tag_index: c.tag,
                        });
                    } else {
                        i += 1;
                    }
                }
            }
            BlockKind::Loop | BlockKind::Block => {
                if block.gen_stopped && block.jumps.is_empty() {
                    self.stop_generation();
                    return Ok(());
                }
            }
            BlockKind::If => {}
        }

        if block.restore_at_end {
            if drop_size.1 > 0 {
                self.emit_branch_moves(drop_size.0, drop_size.1);
            }
            self.restore_stack(&block.stack, block.height);
            match block.ty {
                BlockType::FuncType(i) => {
                    let ft = self.ctx.types[i as usize].clone();
                    for _ in 0..ft.params().len() {
                        self.pop_info();
                    }
                    let results: Vec<ValType> = ft.results().to_vec();
                    for r in results {
                        self.push_stack(value_size_in_stack(r))?;
                    }
                }
                BlockType::Type(t) => {
                    self.push_stack(value_size_in_stack(t))?;
                }
                BlockType::Empty => {}
            }
        }

        let here = self.buf.len();
        for j in &block.jumps {
            match j.kind {
                JumpKind::Jump => self.buf.set_jump_rel(j.pos, (here - j.pos) as i32),
                JumpKind::JumpIf => self.buf.set_cond_jump_rel(j.pos, (here - j.pos) as i32),
                JumpKind::BrTable => {
                    // The cell holds its own offset within the record;
                    // rewrite it to point at the block end.
                    let within = self.buf.read_i32_at(j.pos);
                    self.buf.write_i32_at(j.pos, here as i32 + within - j.pos as i32);
                }
            }
        }
        Ok(())
    }

    // --- returns and branches ---

    /// Emit the `End` record naming the current result slots.
    fn generate_end(&mut self) {
        let results: Vec<ValType> = self.ty.results().to_vec();
        if results.len() > self.vm.len() {
            return; // malformed constant expression; reader reports it
        }
        let n = results.len();
        self.buf.push_u16(OP_END);
        self.buf.push_u16(n as u16);
        for i in 0..n {
            let pos = self.vm[self.vm.len() - n + i].pos;
            self.buf.push_u16(pos as u16);
        }
    }

    fn generate_return(&mut self, clear_stack: bool) {
        self.generate_end();
        if clear_stack {
            let mut drop = self.drop_for_depth(self.blocks.len()).0;
            while drop > 0 {
                drop -= self.pop_info().size;
            }
        } else {
            for _ in 0..self.ty.results().len() {
                self.pop_info();
            }
        }
        self.stop_generation();
    }

    fn on_br(&mut self, depth: u32) {
        if depth as usize == self.blocks.len() {
            self.generate_return(true);
            return;
        }
        let (drop, param) = self.drop_for_depth(depth as usize);
        if param > 0 {
            self.emit_branch_moves(drop, param);
        }
        let bidx = self.blocks.len() - 1 - depth as usize;
        let here = self.buf.len();
        if self.blocks[bidx].kind == BlockKind::Loop {
            let rel = self.blocks[bidx].pos as i64 - here as i64;
            self.buf.push_jump(rel as i32);
        } else {
            self.blocks[bidx].jumps.push(PendingJump { kind: JumpKind::Jump, pos: here });
            if param > 0 {
                self.blocks[bidx].restore_at_end = true;
            }
            self.buf.push_jump(0);
        }
        self.stop_generation();
    }

    fn on_br_if(&mut self, depth: u32) {
        if depth as usize == self.blocks.len() {
            // Conditional return: skip over an inline End on false.
            let cond = self.pop_pos();
            let skip = (JUMP_IF_STRIDE + end_stride(self.ty.results().len())) as i32;
            self.buf.push_jump_if(OP_JUMP_IF_FALSE, cond as u16, skip);
            self.generate_end();
            return;
        }
        let cond = self.pop_pos();
        let (drop, param) = self.drop_for_depth(depth as usize);
        let bidx = self.blocks.len() - 1 - depth as usize;
        if param > 0 {
            let jif = self.buf.len();
            self.buf.push_jump_if(OP_JUMP_IF_FALSE, cond as u16, 0);
            self.emit_branch_moves(drop, param);
            let here = self.buf.len();
            if self.blocks[bidx].kind == BlockKind::Loop {
                let rel = self.blocks[bidx].pos as i64 - here as i64;
                self.buf.push_jump(rel as i32);
            } else {
                self.blocks[bidx].jumps.push(PendingJump { kind: JumpKind::Jump, pos: here });
                self.blocks[bidx].restore_at_end = true;
                self.buf.push_jump(0);
            }
            let after = self.buf.len();
            self.buf.set_cond_jump_rel(jif, (after - jif) as i32);
        } else {
            let here = self.buf.len();
            if self.blocks[bidx].kind == BlockKind::Loop {
                let rel = self.blocks[bidx].pos as i64 - here as i64;
                self.buf.push_jump_if(OP_JUMP_IF_TRUE, cond as u16, rel as i32);
            } else {
                self.blocks[bidx].jumps.push(PendingJump { kind: JumpKind::JumpIf, pos: here });
                self.buf.push_jump_if(OP_JUMP_IF_TRUE, cond as u16, 0);
            }
        }
    }

    fn emit_br_table_case(&mut self, table_pos: usize, depth: u32, cell_off: usize) {
        let cell = table_pos + cell_off;
        if depth as usize == self.blocks.len() {
            // Acts like return: the case jumps to an End appended here.
            self.buf.write_i32_at(cell, (self.buf.len() - table_pos) as i32);
            self.generate_end();
            return;
        }
        let (_, param) = self.drop_for_depth(depth as usize);
        if param > 0 {
            // Value-carrying case: route through a branch trampoline
            // appended after the table.
            self.buf.write_i32_at(cell, (self.buf.len() - table_pos) as i32);
            self.on_br(depth);
            return;
        }
        let bidx = self.blocks.len() - 1 - depth as usize;
        if self.blocks[bidx].kind == BlockKind::Loop {
            let rel = self.blocks[bidx].pos as i64 - table_pos as i64;
            self.buf.write_i32_at(cell, rel as i32);
        } else {
            // Store the cell's own record offset; the block end rewrites
            // it into the final record-relative target.
            self.buf.write_i32_at(cell, cell_off as i32);
            self.blocks[bidx].jumps.push(PendingJump { kind: JumpKind::BrTable, pos: cell });
        }
    }

    fn on_br_table(&mut self, targets: &[u32], default: u32) {
        let cond = self.pop_pos();
        let table_pos = self.buf.len();
        self.buf.push_u16(OP_BR_TABLE);
        self.buf.push_u16(cond as u16);
        self.buf.push_u32(targets.len() as u32);
        for _ in 0..=targets.len() {
            self.buf.push_i32(0);
        }
        for (i, &depth) in targets.iter().enumerate() {
            self.emit_br_table_case(table_pos, depth, BR_TABLE_HEAD + 4 * i);
        }
        self.emit_br_table_case(table_pos, default, BR_TABLE_HEAD + 4 * targets.len());
        self.stop_generation();
    }

    // --- locals and globals ---

    fn on_local_get(&mut self, idx: u32) -> Result<(), String> {
        let (off, size) = self.local_slots[idx as usize];
        if self.can_use_direct(idx, self.height) {
            self.push_at(size, off, Some(idx))
        } else {
            let pos = self.height;
            self.push_at(size, pos, Some(idx))?;
            self.emit_move_if_needed(off, pos, size);
            Ok(())
        }
    }

    /// Retarget the record that produced the top value to write straight
    /// into the local's slot, when the previous operator pushed it.
    fn fold_writeback(&mut self, idx: u32, off: u32, prev: LastEmitted, src: &StackEntry) -> bool {
        if !self.can_use_direct(idx, src.pos) || src.pos == off || src.local.is_some() {
            return false;
        }
        match prev {
            LastEmitted::Binary { pos } => {
                self.buf.set_binary_dst(pos, off as u16);
                true
            }
            LastEmitted::Const { pos } => {
                self.buf.set_const_dst(pos, off as u16);
                true
            }
            LastEmitted::None => false,
        }
    }

    fn on_local_set(&mut self, idx: u32, prev: LastEmitted) {
        let (off, size) = self.local_slots[idx as usize];
        if self.direct_enabled && self.direct_ok[idx as usize] && self.local_is_aliased(idx) {
            // Overwriting a directly-aliased local invalidates every
            // live alias, unless the value being stored is that alias.
            if self.peek().pos != off {
                self.rewind(idx);
                return;
            }
        }
        let src = self.pop_info();
        if !self.fold_writeback(idx, off, prev, &src) {
            self.emit_move_if_needed(src.pos, off, size);
        }
    }

    fn on_local_tee(&mut self, idx: u32, prev: LastEmitted) -> Result<(), String> {
        if self.direct_enabled && self.direct_ok[idx as usize] && self.local_is_aliased(idx) {
            self.rewind(idx);
            return Ok(());
        }
        let (off, size) = self.local_slots[idx as usize];
        let top = *self.peek();
        if self.fold_writeback(idx, off, prev, &top) {
            let old = self.pop_info();
            self.push_at(old.size, off, Some(idx))?;
        } else {
            self.emit_move_if_needed(top.pos, off, size);
        }
        Ok(())
    }

    fn on_global_get(&mut self, idx: u32) -> Result<(), String> {
        let size = value_size_in_stack(self.ctx.global_types[idx as usize].content);
        let dst = self.push_stack(size)?;
        self.buf.push_u16(if size == 4 { OP_GLOBAL_GET32 } else { OP_GLOBAL_GET64 });
        self.buf.push_u16(dst as u16);
        self.buf.push_u32(idx);
        Ok(())
    }

    fn on_global_set(&mut self, idx: u32) {
        let size = value_size_in_stack(self.ctx.global_types[idx as usize].content);
        let src = self.pop_pos();
        self.buf.push_u16(if size == 4 { OP_GLOBAL_SET32 } else { OP_GLOBAL_SET64 });
        self.buf.push_u16(src as u16);
        self.buf.push_u32(idx);
    }

    // --- straight-line operator groups ---

    fn binary(&mut self, op: u16, result_size: u32) -> Result<(), String> {
        let src1 = self.pop_pos();
        let src0 = self.pop_pos();
        let dst = self.push_stack(result_size)?;
        self.emit_binary(op, src0, src1, dst);
        Ok(())
    }

    fn unary(&mut self, op: u16, result_size: u32) -> Result<(), String> {
        let src = self.pop_pos();
        let dst = self.push_stack(result_size)?;
        self.buf.push_unary(op, src as u16, dst as u16);
        Ok(())
    }

    /// Reinterpret casts just relabel bits; a move suffices.
    fn reinterpret(&mut self, size: u32) -> Result<(), String> {
        let src = self.pop_pos();
        let dst = self.push_stack(size)?;
        self.emit_move_if_needed(src, dst, size);
        Ok(())
    }

    fn load(&mut self, op: u16, offset: u64, result_size: u32) -> Result<(), String> {
        let src = self.pop_pos();
        let dst = self.push_stack(result_size)?;
        if offset == 0 && matches!(op, OP_I32_LOAD | OP_F32_LOAD) {
            self.buf.push_u16(OP_LOAD32);
            self.buf.push_u16(src as u16);
            self.buf.push_u16(dst as u16);
        } else if offset == 0 && matches!(op, OP_I64_LOAD | OP_F64_LOAD) {
            self.buf.push_u16(OP_LOAD64);
            self.buf.push_u16(src as u16);
            self.buf.push_u16(dst as u16);
        } else {
            self.buf.push_u16(op);
            self.buf.push_u32(offset as u32);
            self.buf.push_u16(src as u16);
            self.buf.push_u16(dst as u16);
        }
        Ok(())
    }

    fn store(&mut self, op: u16, offset: u64) {
        let value = self.pop_pos();
        let addr = self.pop_pos();
        if offset == 0 && matches!(op, OP_I32_STORE | OP_F32_STORE) {
            self.buf.push_u16(OP_STORE32);
            self.buf.push_u16(addr as u16);
            self.buf.push_u16(value as u16);
        } else if offset == 0 && matches!(op, OP_I64_STORE | OP_F64_STORE) {
            self.buf.push_u16(OP_STORE64);
            self.buf.push_u16(addr as u16);
            self.buf.push_u16(value as u16);
        } else {
            self.buf.push_u16(op);
            self.buf.push_u32(offset as u32);
            self.buf.push_u16(addr as u16);
            self.buf.push_u16(value as u16);
        }
    }

    fn on_call(&mut self, func_idx: u32) -> Result<(), String> {
        let ft = self.ctx.func_type(func_idx).clone();
        let params = ft.params().len();
        let results: Vec<ValType> = ft.results().to_vec();
        let mut offs = vec![0u16; params];
        for i in (0..params).rev() {
            offs[i] = self.pop_pos() as u16;
        }
        for r in &results {
            offs.push(self.push_stack(value_size_in_stack(*r))? as u16);
        }
        self.buf.push_u16(OP_CALL);
        self.buf.push_u32(func_idx);
        self.buf.push_u16(offs.len() as u16);
        for o in offs {
            self.buf.push_u16(o);
        }
        Ok(())
    }

    fn on_call_indirect(&mut self, type_idx: u32, table_idx: u32) -> Result<(), String> {
        let addr = self.pop_pos();
        let ft = self.ctx.types[type_idx as usize].clone();
        let params = ft.params().len();
        let results: Vec<ValType> = ft.results().to_vec();
        let mut offs = vec![0u16; params];
        for i in (0..params).rev() {
            offs[i] = self.pop_pos() as u16;
        }
        for r in &results {
            offs.push(self.push_stack(value_size_in_stack(*r))? as u16);
        }
        self.buf.push_u16(OP_CALL_INDIRECT);
        self.buf.push_u16(addr as u16);
        self.buf.push_u32(table_idx);
        self.buf.push_u32(type_idx);
        self.buf.push_u16(params as u16);
        self.buf.push_u16(results.len() as u16);
        for o in offs {
            self.buf.push_u16(o);
        }
        Ok(())
    }

    fn on_select(&mut self) -> Result<(), String> {
        let cond = self.pop_pos();
        let size = self.peek().size;
        let src1 = self.pop_pos();
        let src0 = self.pop_pos();
        let dst = self.push_stack(size)?;
        self.buf.push_u16(OP_SELECT);
        self.buf.push_u16(cond as u16);
        self.buf.push_u16(size as u16);
        self.buf.push_u16(src0 as u16);
        self.buf.push_u16(src1 as u16);
        self.buf.push_u16(dst as u16);
        Ok(())
    }

    fn on_throw(&mut self, tag: u32) {
        let n = self.ctx.tag_type(tag).params().len();
        self.buf.push_u16(OP_THROW);
        self.buf.push_u32(tag);
        self.buf.push_u16(n as u16);
        for i in 0..n {
            let pos = self.vm[self.vm.len() - n + i].pos;
            self.buf.push_u16(pos as u16);
        }
        for _ in 0..n {
            self.pop_info();
        }
        self.stop_generation();
    }

    fn on_ref_func(&mut self, func_idx: u32) -> Result<(), String> {
        let dst = self.push_stack(REF_SIZE)?;
        self.buf.push_u16(OP_REF_FUNC);
        self.buf.push_u32(func_idx);
        self.buf.push_u16(dst as u16);
        Ok(())
    }

    fn on_ref_null(&mut self) -> Result<(), String> {
        let dst = self.push_stack(REF_SIZE)?;
        if REF_SIZE == 4 {
            self.emit_const32(dst, 0);
        } else {
            self.emit_const64(dst, 0);
        }
        Ok(())
    }

    fn on_ref_is_null(&mut self) -> Result<(), String> {
        self.unary(if REF_SIZE == 4 { OP_I32_EQZ } else { OP_I64_EQZ }, 4)
    }

    fn table_op(&mut self, op: u16, imms: &[u32], pops: usize, push_size: Option<u32>) -> Result<(), String> {
        let mut srcs = vec![0u16; pops];
        for i in (0..pops).rev() {
            srcs[i] = self.pop_pos() as u16;
        }
        let dst = match push_size {
            Some(size) => Some(self.push_stack(size)? as u16),
            None => None,
        };
        self.buf.push_u16(op);
        for &imm in imms {
            self.buf.push_u32(imm);
        }
        for s in srcs {
            self.buf.push_u16(s);
        }
        if let Some(d) = dst {
            self.buf.push_u16(d);
        }
        Ok(())
    }

    // --- the operator dispatcher ---

    fn step(&mut self, op: &Operator) -> Result<(), String> {
        if !self.generating && self.skip(op) {
            return Ok(());
        }
        let prev = std::mem::replace(&mut self.last, LastEmitted::None);
        use Operator as O;
        match *op {
            O::Unreachable => {
                self.buf.push_u16(OP_UNREACHABLE);
                self.stop_generation();
            }
            O::Nop => {}
            O::Block { blockty } => self.begin_block(BlockKind::Block, blockty)?,
            O::Loop { blockty } => self.begin_block(BlockKind::Loop, blockty)?,
            O::If { blockty } => {
                let cond = self.pop_pos();
                self.begin_block(BlockKind::If, blockty)?;
                let pos = self.buf.len();
                self.blocks
                    .last_mut()
                    .expect("open if")
                    .jumps
                    .push(PendingJump { kind: JumpKind::JumpIf, pos });
                self.buf.push_jump_if(OP_JUMP_IF_FALSE, cond as u16, 0);
            }
            O::Else => self.on_else(),
            O::Try { blockty } => self.begin_block(BlockKind::Try, blockty)?,
            O::Catch { tag_index } => self.on_catch(Some(tag_index))?,
            O::CatchAll => self.on_catch(None)?,
            O::Throw { tag_index } => self.on_throw(tag_index),
            O::Rethrow { .. } | O::Delegate { .. } => {
                return Err("rethrow/delegate are not supported".into());
            }
            O::End => self.on_end()?,
            O::Br { relative_depth } => self.on_br(relative_depth),
            O::BrIf { relative_depth } => self.on_br_if(relative_depth),
            O::BrTable { ref targets } => {
                let depths: Vec<u32> = targets
                    .targets()
                    .collect::<Result<_, _>>()
                    .map_err(|e| format!("br_table targets: {e}"))?;
                self.on_br_table(&depths, targets.default());
            }
            O::Return => self.generate_return(false),
            O::Call { function_index } => self.on_call(function_index)?,
            O::CallIndirect { type_index, table_index } => {
                self.on_call_indirect(type_index, table_index)?
            }
            O::Drop => {
                self.pop_info();
            }
            O::Select | O::TypedSelect { .. } => self.on_select()?,

            O::LocalGet { local_index } => self.on_local_get(local_index)?,
            O::LocalSet { local_index } => self.on_local_set(local_index, prev),
            O::LocalTee { local_index } => self.on_local_tee(local_index, prev)?,
            O::GlobalGet { global_index } => self.on_global_get(global_index)?,
            O::GlobalSet { global_index } => self.on_global_set(global_index),

            O::I32Const { value } => {
                let dst = self.push_stack(4)?;
                self.emit_const32(dst, value as u32);
            }
            O::I64Const { value } => {
                let dst = self.push_stack(8)?;
                self.emit_const64(dst, value as u64);
            }
            O::F32Const { value } => {
                let dst = self.push_stack(4)?;
                self.emit_const32(dst, value.bits());
            }
            O::F64Const { value } => {
                let dst = self.push_stack(8)?;
                self.emit_const64(dst, value.bits());
            }

            O::RefNull { .. } => self.on_ref_null()?,
            O::RefIsNull => self.on_ref_is_null()?,
            O::RefFunc { function_index } => self.on_ref_func(function_index)?,

            // i32 binary
            O::I32Add => self.binary(OP_I32_ADD, 4)?,
            O::I32Sub => self.binary(OP_I32_SUB, 4)?,
            O::I32Mul => self.binary(OP_I32_MUL, 4)?,
            O::I32DivS => self.binary(OP_I32_DIV_S, 4)?,
            O::I32DivU => self.binary(OP_I32_DIV_U, 4)?,
            O::I32RemS => self.binary(OP_I32_REM_S, 4)?,
            O::I32RemU => self.binary(OP_I32_REM_U, 4)?,
            O::I32And => self.binary(OP_I32_AND, 4)?,
            O::I32Or => self.binary(OP_I32_OR, 4)?,
            O::I32Xor => self.binary(OP_I32_XOR, 4)?,
            O::I32Shl => self.binary(OP_I32_SHL, 4)?,
            O::I32ShrS => self.binary(OP_I32_SHR_S, 4)?,
            O::I32ShrU => self.binary(OP_I32_SHR_U, 4)?,
            O::I32Rotl => self.binary(OP_I32_ROTL, 4)?,
            O::I32Rotr => self.binary(OP_I32_ROTR, 4)?,
            O::I32Eq => self.binary(OP_I32_EQ, 4)?,
            O::I32Ne => self.binary(OP_I32_NE, 4)?,
            O::I32LtS => self.binary(OP_I32_LT_S, 4)?,
            O::I32LtU => self.binary(OP_I32_LT_U, 4)?,
            O::I32GtS => self.binary(OP_I32_GT_S, 4)?,
            O::I32GtU => self.binary(OP_I32_GT_U, 4)?,
            O::I32LeS => self.binary(OP_I32_LE_S, 4)?,
            O::I32LeU => self.binary(OP_I32_LE_U, 4)?,
            O::I32GeS => self.binary(OP_I32_GE_S, 4)?,
            O::I32GeU => self.binary(OP_I32_GE_U, 4)?,

            // i64 binary
            O::I64Add => self.binary(OP_I64_ADD, 8)?,
            O::I64Sub => self.binary(OP_I64_SUB, 8)?,
            O::I64Mul => self.binary(OP_I64_MUL, 8)?,
            O::I64DivS => self.binary(OP_I64_DIV_S, 8)?,
            O::I64DivU => self.binary(OP_I64_DIV_U, 8)?,
            O::I64RemS => self.binary(OP_I64_REM_S, 8)?,
            O::I64RemU => self.binary(OP_I64_REM_U, 8)?,
            O::I64And => self.binary(OP_I64_AND, 8)?,
            O::I64Or => self.binary(OP_I64_OR, 8)?,
            O::I64Xor => self.binary(OP_I64_XOR, 8)?,
            O::I64Shl => self.binary(OP_I64_SHL, 8)?,
            O::I64ShrS => self.binary(OP_I64_SHR_S, 8)?,
            O::I64ShrU => self.binary(OP_I64_SHR_U, 8)?,
            O::I64Rotl => self.binary(OP_I64_ROTL, 8)?,
            O::I64Rotr => self.binary(OP_I64_ROTR, 8)?,
            O::I64Eq => self.binary(OP_I64_EQ, 4)?,
            O::I64Ne => self.binary(OP_I64_NE, 4)?,
            O::I64LtS => self.binary(OP_I64_LT_S, 4)?,
            O::I64LtU => self.binary(OP_I64_LT_U, 4)?,
            O::I64GtS => self.binary(OP_I64_GT_S, 4)?,
            O::I64GtU => self.binary(OP_I64_GT_U, 4)?,
            O::I64LeS => self.binary(OP_I64_LE_S, 4)?,
            O::I64LeU => self.binary(OP_I64_LE_U, 4)?,
            O::I64GeS => self.binary(OP_I64_GE_S, 4)?,
            O::I64GeU => self.binary(OP_I64_GE_U, 4)?,

            // f32 binary
            O::F32Add => self.binary(OP_F32_ADD, 4)?,
            O::F32Sub => self.binary(OP_F32_SUB, 4)?,
            O::F32Mul => self.binary(OP_F32_MUL, 4)?,
            O::F32Div => self.binary(OP_F32_DIV, 4)?,
            O::F32Min => self.binary(OP_F32_MIN, 4)?,
            O::F32Max => self.binary(OP_F32_MAX, 4)?,
            O::F32Copysign => self.binary(OP_F32_COPYSIGN, 4)?,
            O::F32Eq => self.binary(OP_F32_EQ, 4)?,
            O::F32Ne => self.binary(OP_F32_NE, 4)?,
            O::F32Lt => self.binary(OP_F32_LT, 4)?,
            O::F32Gt => self.binary(OP_F32_GT, 4)?,
            O::F32Le => self.binary(OP_F32_LE, 4)?,
            O::F32Ge => self.binary(OP_F32_GE, 4)?,

            // f64 binary
            O::F64Add => self.binary(OP_F64_ADD, 8)?,
            O::F64Sub => self.binary(OP_F64_SUB, 8)?,
            O::F64Mul => self.binary(OP_F64_MUL, 8)?,
            O::F64Div => self.binary(OP_F64_DIV, 8)?,
            O::F64Min => self.binary(OP_F64_MIN, 8)?,
            O::F64Max => self.binary(OP_F64_MAX, 8)?,
            O::F64Copysign => self.binary(OP_F64_COPYSIGN, 8)?,
            O::F64Eq => self.binary(OP_F64_EQ, 4)?,
            O::F64Ne => self.binary(OP_F64_NE, 4)?,
            O::F64Lt => self.binary(OP_F64_LT, 4)?,
            O::F64Gt => self.binary(OP_F64_GT, 4)?,
            O::F64Le => self.binary(OP_F64_LE, 4)?,
            O::F64Ge => self.binary(OP_F64_GE, 4)?,

            // unary
            O::I32Clz => self.unary(OP_I32_CLZ, 4)?,
            O::I32Ctz => self.unary(OP_I32_CTZ, 4)?,
            O::I32Popcnt => self.unary(OP_I32_POPCNT, 4)?,
            O::I32Eqz => self.unary(OP_I32_EQZ, 4)?,
            O::I32Extend8S => self.unary(OP_I32_EXTEND8_S, 4)?,
            O::I32Extend16S => self.unary(OP_I32_EXTEND16_S, 4)?,
            O::I64Clz => self.unary(OP_I64_CLZ, 8)?,
            O::I64Ctz => self.unary(OP_I64_CTZ, 8)?,
            O::I64Popcnt => self.unary(OP_I64_POPCNT, 8)?,
            O::I64Eqz => self.unary(OP_I64_EQZ, 4)?,
            O::I64Extend8S => self.unary(OP_I64_EXTEND8_S, 8)?,
            O::I64Extend16S => self.unary(OP_I64_EXTEND16_S, 8)?,
            O::I64Extend32S => self.unary(OP_I64_EXTEND32_S, 8)?,
            O::F32Abs => self.unary(OP_F32_ABS, 4)?,
            O::F32Neg => self.unary(OP_F32_NEG, 4)?,
            O::F32Ceil => self.unary(OP_F32_CEIL, 4)?,
            O::F32Floor => self.unary(OP_F32_FLOOR, 4)?,
            O::F32Trunc => self.unary(OP_F32_TRUNC, 4)?,
            O::F32Nearest => self.unary(OP_F32_NEAREST, 4)?,
            O::F32Sqrt => self.unary(OP_F32_SQRT, 4)?,
            O::F64Abs => self.unary(OP_F64_ABS, 8)?,
            O::F64Neg => self.unary(OP_F64_NEG, 8)?,
            O::F64Ceil => self.unary(OP_F64_CEIL, 8)?,
            O::F64Floor => self.unary(OP_F64_FLOOR, 8)?,
            O::F64Trunc => self.unary(OP_F64_TRUNC, 8)?,
            O::F64Nearest => self.unary(OP_F64_NEAREST, 8)?,
            O::F64Sqrt => self.unary(OP_F64_SQRT, 8)?,

            // conversions
            O::I32WrapI64 => self.unary(OP_I32_WRAP_I64, 4)?,
            O::I64ExtendI32S => self.unary(OP_I64_EXTEND_I32_S, 8)?,
            O::I64ExtendI32U => self.unary(OP_I64_EXTEND_I32_U, 8)?,
            O::I32TruncF32S => self.unary(OP_I32_TRUNC_F32_S, 4)?,
            O::I32TruncF32U => self.unary(OP_I32_TRUNC_F32_U, 4)?,
            O::I32TruncF64S => self.unary(OP_I32_TRUNC_F64_S, 4)?,
            O::I32TruncF64U => self.unary(OP_I32_TRUNC_F64_U, 4)?,
            O::I64TruncF32S => self.unary(OP_I64_TRUNC_F32_S, 8)?,
            O::I64TruncF32U => self.unary(OP_I64_TRUNC_F32_U, 8)?,
            O::I64TruncF64S => self.unary(OP_I64_TRUNC_F64_S, 8)?,
            O::I64TruncF64U => self.unary(OP_I64_TRUNC_F64_U, 8)?,
            O::I32TruncSatF32S => self.unary(OP_I32_TRUNC_SAT_F32_S, 4)?,
            O::I32TruncSatF32U => self.unary(OP_I32_TRUNC_SAT_F32_U, 4)?,
            O::I32TruncSatF64S => self.unary(OP_I32_TRUNC_SAT_F64_S, 4)?,
            O::I32TruncSatF64U => self.unary(OP_I32_TRUNC_SAT_F64_U, 4)?,
            O::I64TruncSatF32S => self.unary(OP_I64_TRUNC_SAT_F32_S, 8)?,
            O::I64TruncSatF32U => self.unary(OP_I64_TRUNC_SAT_F32_U, 8)?,
            O::I64TruncSatF64S => self.unary(OP_I64_TRUNC_SAT_F64_S, 8)?,
            O::I64TruncSatF64U => self.unary(OP_I64_TRUNC_SAT_F64_U, 8)?,
            O::F32ConvertI32S => self.unary(OP_F32_CONVERT_I32_S, 4)?,
            O::F32ConvertI32U => self.unary(OP_F32_CONVERT_I32_U, 4)?,
            O::F32ConvertI64S => self.unary(OP_F32_CONVERT_I64_S, 4)?,
            O::F32ConvertI64U => self.unary(OP_F32_CONVERT_I64_U, 4)?,
            O::F64ConvertI32S => self.unary(OP_F64_CONVERT_I32_S, 8)?,
            O::F64ConvertI32U => self.unary(OP_F64_CONVERT_I32_U, 8)?,
            O::F64ConvertI64S => self.unary(OP_F64_CONVERT_I64_S, 8)?,
            O::F64ConvertI64U => self.unary(OP_F64_CONVERT_I64_U, 8)?,
            O::F32DemoteF64 => self.unary(OP_F32_DEMOTE_F64, 4)?,
            O::F64PromoteF32 => self.unary(OP_F64_PROMOTE_F32, 8)?,
            O::I32ReinterpretF32 | O::F32ReinterpretI32 => self.reinterpret(4)?,
            O::I64ReinterpretF64 | O::F64ReinterpretI64 => self.reinterpret(8)?,

            // loads/stores
            O::I32Load { memarg } => self.load(OP_I32_LOAD, memarg.offset, 4)?,
            O::I64Load { memarg } => self.load(OP_I64_LOAD, memarg.offset, 8)?,
            O::F32Load { memarg } => self.load(OP_F32_LOAD, memarg.offset, 4)?,
            O::F64Load { memarg } => self.load(OP_F64_LOAD, memarg.offset, 8)?,
            O::I32Load8S { memarg } => self.load(OP_I32_LOAD8_S, memarg.offset, 4)?,
            O::I32Load8U { memarg } => self.load(OP_I32_LOAD8_U, memarg.offset, 4)?,
            O::I32Load16S { memarg } => self.load(OP_I32_LOAD16_S, memarg.offset, 4)?,
            O::I32Load16U { memarg } => self.load(OP_I32_LOAD16_U, memarg.offset, 4)?,
            O::I64Load8S { memarg } => self.load(OP_I64_LOAD8_S, memarg.offset, 8)?,
            O::I64Load8U { memarg } => self.load(OP_I64_LOAD8_U, memarg.offset, 8)?,
            O::I64Load16S { memarg } => self.load(OP_I64_LOAD16_S, memarg.offset, 8)?,
            O::I64Load16U { memarg } => self.load(OP_I64_LOAD16_U, memarg.offset, 8)?,
            O::I64Load32S { memarg } => self.load(OP_I64_LOAD32_S, memarg.offset, 8)?,
            O::I64Load32U { memarg } => self.load(OP_I64_LOAD32_U, memarg.offset, 8)?,
            O::I32Store { memarg } => self.store(OP_I32_STORE, memarg.offset),
            O::I64Store { memarg } => self.store(OP_I64_STORE, memarg.offset),
            O::F32Store { memarg } => self.store(OP_F32_STORE, memarg.offset),
            O::F64Store { memarg } => self.store(OP_F64_STORE, memarg.offset),
            O::I32Store8 { memarg } => self.store(OP_I32_STORE8, memarg.offset),
            O::I32Store16 { memarg } => self.store(OP_I32_STORE16, memarg.offset),
            O::I64Store8 { memarg } => self.store(OP_I64_STORE8, memarg.offset),
            O::I64Store16 { memarg } => self.store(OP_I64_STORE16, memarg.offset),
            O::I64Store32 { memarg } => self.store(OP_I64_STORE32, memarg.offset),

            O::MemorySize { .. } => {
                let dst = self.push_stack(4)?;
                self.buf.push_u16(OP_MEMORY_SIZE);
                self.buf.push_u16(dst as u16);
            }
            O::MemoryGrow { .. } => {
                let src = self.pop_pos();
                let dst = self.push_stack(4)?;
                self.buf.push_u16(OP_MEMORY_GROW);
                self.buf.push_u16(src as u16);
                self.buf.push_u16(dst as u16);
            }
            O::MemoryInit { data_index, .. } => {
                self.table_op(OP_MEMORY_INIT, &[data_index], 3, None)?
            }
            O::MemoryCopy { .. } => self.table_op(OP_MEMORY_COPY, &[], 3, None)?,
            O::MemoryFill { .. } => self.table_op(OP_MEMORY_FILL, &[], 3, None)?,
            O::DataDrop { data_index } => {
                self.buf.push_u16(OP_DATA_DROP);
                self.buf.push_u32(data_index);
            }

            O::TableGet { table } => self.table_op(OP_TABLE_GET, &[table], 1, Some(REF_SIZE))?,
            O::TableSet { table } => self.table_op(OP_TABLE_SET, &[table], 2, None)?,
            O::TableGrow { table } => self.table_op(OP_TABLE_GROW, &[table], 2, Some(4))?,
            O::TableSize { table } => self.table_op(OP_TABLE_SIZE, &[table], 0, Some(4))?,
            O::TableCopy { dst_table, src_table } => {
                self.table_op(OP_TABLE_COPY, &[dst_table, src_table], 3, None)?
            }
            O::TableFill { table } => self.table_op(OP_TABLE_FILL, &[table], 3, None)?,
            O::TableInit { elem_index, table } => {
                self.table_op(OP_TABLE_INIT, &[table, elem_index], 3, None)?
            }
            O::ElemDrop { elem_index } => {
                self.buf.push_u16(OP_ELEM_DROP);
                self.buf.push_u32(elem_index);
            }

            ref other => return Err(format!("unsupported operator: {other:?}")),
        }
        Ok(())
    }
}
