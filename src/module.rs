use std::collections::HashMap;
use std::rc::Rc;

use wasmparser::ValType;

use crate::bytecode;
use crate::value::value_size_in_stack;
use crate::Engine;

/// A function signature. Interned per module: every reference to the same
/// type index shares one `Rc`. Cross-module signature checks
/// (`call_indirect` through imported tables) compare structurally.
#[derive(Debug, PartialEq, Eq)]
pub struct FunctionType {
    params: Vec<ValType>,
    results: Vec<ValType>,
}

impl FunctionType {
    pub(crate) fn new(params: Vec<ValType>, results: Vec<ValType>) -> Self {
        FunctionType { params, results }
    }

    pub fn params(&self) -> &[ValType] {
        &self.params
    }

    pub fn results(&self) -> &[ValType] {
        &self.results
    }

    /// Total frame bytes the parameters occupy at the base of a call's
    /// activation frame.
    pub(crate) fn param_stack_size(&self) -> u32 {
        self.params.iter().map(|&t| value_size_in_stack(t)).sum()
    }

    pub(crate) fn result_stack_size(&self) -> u32 {
        self.results.iter().map(|&t| value_size_in_stack(t)).sum()
    }
}

/// Exception-handler descriptor attached to a compiled function.
///
/// A record position `p` is covered when `try_start <= p < try_end`.
/// On entry the frame watermark is `stack_size_to_be` and the payload is
/// copied to consecutive slots starting there.
#[derive(Debug, Clone)]
pub(crate) struct CatchInfo {
    pub try_start: u32,
    pub try_end: u32,
    pub catch_start: u32,
    pub stack_size_to_be: u32,
    /// `None` for `catch_all`.
    pub tag_index: Option<u32>,
}

/// A compiled function body: immutable after compilation, shared by every
/// instance of the module.
pub struct ModuleFunction {
    pub(crate) ty: Rc<FunctionType>,
    /// Non-parameter locals, in declaration order.
    pub(crate) locals: Vec<ValType>,
    /// Frame bytes for params + locals (the compiler's initial watermark).
    pub(crate) local_stack_size: u32,
    /// Max frame depth observed while compiling; the frame allocation unit.
    pub(crate) required_stack_size: u32,
    pub(crate) code: Box<[u8]>,
    pub(crate) catches: Vec<CatchInfo>,
}

impl ModuleFunction {
    pub fn ty(&self) -> &Rc<FunctionType> {
        &self.ty
    }

    /// Disassemble the compiled bytecode, one record per line.
    pub fn dump(&self) -> String {
        bytecode::dump(&self.code)
    }
}

impl std::fmt::Debug for ModuleFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleFunction")
            .field("ty", &self.ty)
            .field("locals", &self.locals)
            .field("required_stack_size", &self.required_stack_size)
            .field("code_len", &self.code.len())
            .field("catches", &self.catches.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternKind {
    Func,
    Table,
    Memory,
    Global,
    Tag,
}

#[derive(Debug, Clone)]
pub(crate) struct Import {
    pub module: String,
    pub field: String,
    pub kind: ImportKind,
}

#[derive(Debug, Clone)]
pub(crate) enum ImportKind {
    /// Type index of the imported function.
    Func(u32),
    Table(TableType),
    Memory(MemoryType),
    Global(GlobalType),
    /// Type index of the imported tag's signature.
    Tag(u32),
}

#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    pub kind: ExternKind,
    pub index: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryType {
    /// Limits in 64KiB pages.
    pub min: u64,
    pub max: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct TableType {
    pub element: ValType,
    pub min: u64,
    pub max: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct GlobalType {
    pub content: ValType,
    pub mutable: bool,
}

/// A module-defined global: its type plus the compiled initialiser
/// (a synthetic `() -> content` function run at instantiation).
pub(crate) struct GlobalDef {
    pub ty: GlobalType,
    pub init: ModuleFunction,
}

/// Logical element/data segment mode after flag decoding (the bit-level
/// decode happens in the binary reader).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentMode {
    Active,
    Passive,
    Declared,
}

/// An element segment. `offset` is a compiled `() -> i32` function for
/// active segments. Items are function indices (`None` = null ref).
pub(crate) struct Element {
    pub mode: SegmentMode,
    pub table_index: u32,
    pub offset: Option<ModuleFunction>,
    pub items: Vec<Option<u32>>,
}

/// A data segment: a compiled offset expression for active segments plus
/// the raw payload.
pub(crate) struct Data {
    pub mode: SegmentMode,
    pub offset: Option<ModuleFunction>,
    pub bytes: Vec<u8>,
}

/// A table definition with an optional non-null initialiser expression.
pub(crate) struct TableDef {
    pub ty: TableType,
    pub init: Option<ModuleFunction>,
}

/// A parsed and compiled WASM module — the immutable "code" side.
/// Instance state (memories, tables, globals, …) lives in runtime objects
/// bound at instantiation.
pub(crate) struct ModuleData {
    pub types: Vec<Rc<FunctionType>>,
    /// Type index for every function in the index space (imports first).
    pub func_types: Vec<u32>,
    /// Compiled bodies for defined functions only.
    pub funcs: Vec<ModuleFunction>,
    pub num_func_imports: u32,
    /// Table/memory/global/tag index spaces (imports occupy the front).
    pub tables: Vec<TableDef>,
    pub num_table_imports: u32,
    pub memories: Vec<MemoryType>,
    pub num_memory_imports: u32,
    pub global_types: Vec<GlobalType>,
    pub globals: Vec<GlobalDef>,
    /// Signature type index per tag (imports first).
    pub tags: Vec<u32>,
    pub num_tag_imports: u32,
    pub imports: Vec<Import>,
    pub exports: Vec<Export>,
    pub export_map: HashMap<String, (ExternKind, u32)>,
    pub elements: Vec<Element>,
    pub datas: Vec<Data>,
    pub start: Option<u32>,
}

/// A compiled module. Cheap to clone; a module outlives every instance
/// created from it (instances hold their own shared reference).
#[derive(Clone)]
pub struct Module {
    pub(crate) data: Rc<ModuleData>,
}

impl Module {
    /// Parse a WAT string into a module.
    pub fn new(engine: &Engine, wat: &str) -> Result<Self, anyhow::Error> {
        let bytes = wat::parse_str(wat)?;
        Self::from_bytes(engine, &bytes)
    }

    /// Validate and compile a module from raw WASM bytes.
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, anyhow::Error> {
        let data = crate::compile::parse(engine, bytes).map_err(|e| anyhow::anyhow!(e))?;
        Ok(Module { data: Rc::new(data) })
    }

    pub fn exports(&self) -> impl Iterator<Item = &Export> {
        self.data.exports.iter()
    }

    pub(crate) fn func_type(&self, func_idx: u32) -> &Rc<FunctionType> {
        &self.data.types[self.data.func_types[func_idx as usize] as usize]
    }

    /// Compiled body of a defined function (imports have none).
    pub(crate) fn defined_func(&self, func_idx: u32) -> Option<&ModuleFunction> {
        func_idx
            .checked_sub(self.data.num_func_imports)
            .and_then(|i| self.data.funcs.get(i as usize))
    }

    /// Borrow a defined function's compiled body for inspection.
    pub fn get_function(&self, defined_index: usize) -> Option<&ModuleFunction> {
        self.data.funcs.get(defined_index)
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("types", &self.data.types.len())
            .field("funcs", &self.data.func_types.len())
            .field("exports", &self.data.exports.len())
            .finish()
    }
}
