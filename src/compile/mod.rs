//! Module parsing and compilation.
//!
//! The binary is validated up front, then every payload of the section
//! stream is folded into a `ModuleBuilder`. Constant expressions
//! (global initialisers, segment offsets, table initialisers) compile
//! into small synthetic functions of type `() -> kind` and run through
//! the ordinary interpreter at instantiation time.

mod func;

pub(crate) use func::{FuncCompiler, ModuleTypes};

use std::collections::HashMap;
use std::rc::Rc;

use wasmparser::{ConstExpr, FunctionBody, Operator, Parser, Payload, ValType};

use crate::module::{
    Data, Element, Export, ExternKind, FunctionType, GlobalDef, GlobalType, Import, ImportKind,
    MemoryType, ModuleData, ModuleFunction, SegmentMode, TableDef, TableType,
};
use crate::Engine;

pub(crate) fn parse(engine: &Engine, bytes: &[u8]) -> Result<ModuleData, String> {
    engine
        .new_validator()
        .validate_all(bytes)
        .map_err(|e| format!("validation error: {e}"))?;

    let mut builder = ModuleBuilder::new(engine.direct_local_access());
    for payload in Parser::new(0).parse_all(bytes) {
        let payload = payload.map_err(|e| format!("parse error: {e}"))?;
        dispatch_payload(&mut builder, payload)?;
    }
    builder.finish()
}

struct RawElement<'a> {
    mode: SegmentMode,
    table_index: u32,
    offset: Option<ConstExpr<'a>>,
    items: Vec<Option<u32>>,
}

struct RawData<'a> {
    mode: SegmentMode,
    offset: Option<ConstExpr<'a>>,
    bytes: Vec<u8>,
}

/// Accumulates parsed sections while walking through WASM payloads;
/// code generation happens in `finish` once every index space is known.
struct ModuleBuilder<'a> {
    direct_locals: bool,
    types: Vec<Rc<FunctionType>>,
    func_types: Vec<u32>,
    num_func_imports: u32,
    raw_tables: Vec<(TableType, Option<ConstExpr<'a>>)>,
    num_table_imports: u32,
    memories: Vec<MemoryType>,
    num_memory_imports: u32,
    global_types: Vec<GlobalType>,
    raw_globals: Vec<ConstExpr<'a>>,
    num_global_imports: u32,
    tags: Vec<u32>,
    num_tag_imports: u32,
    imports: Vec<Import>,
    exports: Vec<Export>,
    raw_elements: Vec<RawElement<'a>>,
    raw_datas: Vec<RawData<'a>>,
    func_bodies: Vec<FunctionBody<'a>>,
    start: Option<u32>,
}

impl<'a> ModuleBuilder<'a> {
    fn new(direct_locals: bool) -> Self {
        ModuleBuilder {
            direct_locals,
            types: Vec::new(),
            func_types: Vec::new(),
            num_func_imports: 0,
            raw_tables: Vec::new(),
            num_table_imports: 0,
            memories: Vec::new(),
            num_memory_imports: 0,
            global_types: Vec::new(),
            raw_globals: Vec::new(),
            num_global_imports: 0,
            tags: Vec::new(),
            num_tag_imports: 0,
            imports: Vec::new(),
            exports: Vec::new(),
            raw_elements: Vec::new(),
            raw_datas: Vec::new(),
            func_bodies: Vec::new(),
            start: None,
        }
    }

    fn parse_single_import(&mut self, import: wasmparser::Import<'a>) -> Result<(), String> {
        let kind = match import.ty {
            wasmparser::TypeRef::Func(type_idx) => {
                self.func_types.push(type_idx);
                self.num_func_imports += 1;
                ImportKind::Func(type_idx)
            }
            wasmparser::TypeRef::Table(ty) => {
                let ty = convert_table_type(&ty);
                self.raw_tables.push((ty, None));
                self.num_table_imports += 1;
                ImportKind::Table(ty)
            }
            wasmparser::TypeRef::Memory(ty) => {
                let ty = MemoryType { min: ty.initial, max: ty.maximum };
                self.memories.push(ty);
                self.num_memory_imports += 1;
                ImportKind::Memory(ty)
            }
            wasmparser::TypeRef::Global(ty) => {
                let ty = GlobalType { content: ty.content_type, mutable: ty.mutable };
                self.global_types.push(ty);
                self.num_global_imports += 1;
                ImportKind::Global(ty)
            }
            wasmparser::TypeRef::Tag(ty) => {
                self.tags.push(ty.func_type_idx);
                self.num_tag_imports += 1;
                ImportKind::Tag(ty.func_type_idx)
            }
        };
        self.imports.push(Import {
            module: import.module.to_string(),
            field: import.name.to_string(),
            kind,
        });
        Ok(())
    }

    fn parse_element(&mut self, elem: wasmparser::Element<'a>) -> Result<(), String> {
        let items = parse_elem_items(&elem.items)?;
        match elem.kind {
            wasmparser::ElementKind::Active { table_index, offset_expr } => {
                self.raw_elements.push(RawElement {
                    mode: SegmentMode::Active,
                    table_index: table_index.unwrap_or(0),
                    offset: Some(offset_expr),
                    items,
                });
            }
            wasmparser::ElementKind::Passive => {
                self.raw_elements.push(RawElement {
                    mode: SegmentMode::Passive,
                    table_index: 0,
                    offset: None,
                    items,
                });
            }
            wasmparser::ElementKind::Declared => {
                self.raw_elements.push(RawElement {
                    mode: SegmentMode::Declared,
                    table_index: 0,
                    offset: None,
                    items,
                });
            }
        }
        Ok(())
    }

    fn parse_data_segment(&mut self, data: wasmparser::Data<'a>) -> Result<(), String> {
        match data.kind {
            wasmparser::DataKind::Active { memory_index: 0, offset_expr } => {
                self.raw_datas.push(RawData {
                    mode: SegmentMode::Active,
                    offset: Some(offset_expr),
                    bytes: data.data.to_vec(),
                });
            }
            wasmparser::DataKind::Active { .. } => {
                return Err("multiple memories are not supported".into());
            }
            wasmparser::DataKind::Passive => {
                self.raw_datas.push(RawData {
                    mode: SegmentMode::Passive,
                    offset: None,
                    bytes: data.data.to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Compile everything that needed the full index spaces.
    fn finish(self) -> Result<ModuleData, String> {
        let ModuleBuilder {
            direct_locals,
            types,
            func_types,
            num_func_imports,
            raw_tables,
            num_table_imports,
            memories,
            num_memory_imports,
            global_types,
            raw_globals,
            num_global_imports,
            tags,
            num_tag_imports,
            imports,
            exports,
            raw_elements,
            raw_datas,
            func_bodies,
            start,
        } = self;

        let ctx = ModuleTypes {
            types: &types,
            func_types: &func_types,
            global_types: &global_types,
            tags: &tags,
        };

        let mut globals = Vec::with_capacity(raw_globals.len());
        for (i, expr) in raw_globals.iter().enumerate() {
            let ty = global_types[num_global_imports as usize + i];
            let init = compile_const_expr(&ctx, ty.content, expr, direct_locals)?;
            globals.push(GlobalDef { ty, init });
        }

        let mut tables = Vec::with_capacity(raw_tables.len());
        for (ty, expr) in &raw_tables {
            let init = match expr {
                Some(e) => Some(compile_const_expr(&ctx, ty.element, e, direct_locals)?),
                None => None,
            };
            tables.push(TableDef { ty: *ty, init });
        }

        let mut elements = Vec::with_capacity(raw_elements.len());
        for raw in &raw_elements {
            let offset = match &raw.offset {
                Some(e) => Some(compile_const_expr(&ctx, ValType::I32, e, direct_locals)?),
                None => None,
            };
            elements.push(Element {
                mode: raw.mode,
                table_index: raw.table_index,
                offset,
                items: raw.items.clone(),
            });
        }

        let mut datas = Vec::with_capacity(raw_datas.len());
        for raw in raw_datas {
            let offset = match &raw.offset {
                Some(e) => Some(compile_const_expr(&ctx, ValType::I32, e, direct_locals)?),
                None => None,
            };
            datas.push(Data { mode: raw.mode, offset, bytes: raw.bytes });
        }

        let mut funcs = Vec::with_capacity(func_bodies.len());
        for (i, body) in func_bodies.iter().enumerate() {
            let type_idx = func_types[num_func_imports as usize + i];
            let ty = types[type_idx as usize].clone();
            funcs.push(compile_function(&ctx, ty, body, direct_locals)?);
        }

        let mut export_map = HashMap::new();
        for e in &exports {
            export_map.insert(e.name.clone(), (e.kind, e.index));
        }

        Ok(ModuleData {
            types,
            func_types,
            funcs,
            num_func_imports,
            tables,
            num_table_imports,
            memories,
            num_memory_imports,
            global_types,
            globals,
            tags,
            num_tag_imports,
            imports,
            exports,
            export_map,
            elements,
            datas,
            start,
        })
    }
}

fn convert_table_type(ty: &wasmparser::TableType) -> TableType {
    TableType {
        element: ValType::Ref(ty.element_type),
        min: ty.initial,
        max: ty.maximum,
    }
}

/// Route a single parsed payload to the appropriate builder method.
fn dispatch_payload<'a>(
    builder: &mut ModuleBuilder<'a>,
    payload: Payload<'a>,
) -> Result<(), String> {
    match payload {
        Payload::TypeSection(reader) => {
            for ty in reader.into_iter_err_on_gc_types() {
                let ty = ty.map_err(|e| format!("type error: {e}"))?;
                builder.types.push(Rc::new(FunctionType::new(
                    ty.params().to_vec(),
                    ty.results().to_vec(),
                )));
            }
        }
        Payload::ImportSection(reader) => {
            for import in reader {
                let import = import.map_err(|e| format!("import error: {e}"))?;
                builder.parse_single_import(import)?;
            }
        }
        Payload::FunctionSection(reader) => {
            for type_idx in reader {
                let type_idx = type_idx.map_err(|e| format!("func error: {e}"))?;
                builder.func_types.push(type_idx);
            }
        }
        Payload::TableSection(reader) => {
            for table in reader {
                let table = table.map_err(|e| format!("table error: {e}"))?;
                let init = match table.init {
                    wasmparser::TableInit::RefNull => None,
                    wasmparser::TableInit::Expr(expr) => Some(expr),
                };
                builder.raw_tables.push((convert_table_type(&table.ty), init));
            }
        }
        Payload::MemorySection(reader) => {
            for mem in reader {
                let mem = mem.map_err(|e| format!("memory error: {e}"))?;
                builder.memories.push(MemoryType { min: mem.initial, max: mem.maximum });
            }
        }
        Payload::GlobalSection(reader) => {
            for global in reader {
                let global = global.map_err(|e| format!("global error: {e}"))?;
                builder.global_types.push(GlobalType {
                    content: global.ty.content_type,
                    mutable: global.ty.mutable,
                });
                builder.raw_globals.push(global.init_expr);
            }
        }
        Payload::TagSection(reader) => {
            for tag in reader {
                let tag = tag.map_err(|e| format!("tag error: {e}"))?;
                builder.tags.push(tag.func_type_idx);
            }
        }
        Payload::ExportSection(reader) => {
            for export in reader {
                let export = export.map_err(|e| format!("export error: {e}"))?;
                let kind = match export.kind {
                    wasmparser::ExternalKind::Func => ExternKind::Func,
                    wasmparser::ExternalKind::Table => ExternKind::Table,
                    wasmparser::ExternalKind::Memory => ExternKind::Memory,
                    wasmparser::ExternalKind::Global => ExternKind::Global,
                    wasmparser::ExternalKind::Tag => ExternKind::Tag,
                };
                builder.exports.push(Export {
                    name: export.name.to_string(),
                    kind,
                    index: export.index,
                });
            }
        }
        Payload::StartSection { func, .. } => {
            builder.start = Some(func);
        }
        Payload::ElementSection(reader) => {
            for elem in reader {
                let elem = elem.map_err(|e| format!("element error: {e}"))?;
                builder.parse_element(elem)?;
            }
        }
        Payload::DataSection(reader) => {
            for data in reader {
                let data = data.map_err(|e| format!("data error: {e}"))?;
                builder.parse_data_segment(data)?;
            }
        }
        Payload::CodeSectionEntry(body) => {
            builder.func_bodies.push(body);
        }
        _ => {}
    }
    Ok(())
}

/// Parse element items into function indices (`None` = null ref).
///
/// Expression items support only the forms the binary reader hands the
/// compiler: `ref.null` and `ref.func`.
fn parse_elem_items(items: &wasmparser::ElementItems) -> Result<Vec<Option<u32>>, String> {
    let mut result = Vec::new();
    match items {
        wasmparser::ElementItems::Functions(reader) => {
            for idx in reader.clone() {
                let idx = idx.map_err(|e| format!("elem func error: {e}"))?;
                result.push(Some(idx));
            }
        }
        wasmparser::ElementItems::Expressions(_, reader) => {
            for expr in reader.clone() {
                let expr = expr.map_err(|e| format!("elem expr error: {e}"))?;
                let mut item = None;
                for op in expr.get_operators_reader() {
                    let op = op.map_err(|e| format!("elem expr error: {e}"))?;
                    match op {
                        Operator::RefNull { .. } => item = None,
                        Operator::RefFunc { function_index } => item = Some(function_index),
                        Operator::End => break,
                        other => {
                            return Err(format!("unsupported element expression: {other:?}"));
                        }
                    }
                }
                result.push(item);
            }
        }
    }
    Ok(result)
}

/// Compile a constant expression into a synthetic `() -> kind` function.
fn compile_const_expr(
    ctx: &ModuleTypes,
    result: ValType,
    expr: &ConstExpr,
    direct_locals: bool,
) -> Result<ModuleFunction, String> {
    let mut ops = Vec::new();
    for op in expr.get_operators_reader() {
        ops.push(op.map_err(|e| format!("const expr error: {e}"))?);
    }
    let ty = Rc::new(FunctionType::new(Vec::new(), vec![result]));
    FuncCompiler::new(ctx, ty, Vec::new(), direct_locals)?.compile(&ops)
}

/// Compile one function body.
fn compile_function(
    ctx: &ModuleTypes,
    ty: Rc<FunctionType>,
    body: &FunctionBody,
    direct_locals: bool,
) -> Result<ModuleFunction, String> {
    let mut locals = Vec::new();
    let locals_reader = body.get_locals_reader().map_err(|e| format!("locals error: {e}"))?;
    for local in locals_reader {
        let (count, lty) = local.map_err(|e| format!("local error: {e}"))?;
        for _ in 0..count {
            locals.push(lty);
        }
    }
    let ops_reader = body.get_operators_reader().map_err(|e| format!("ops error: {e}"))?;
    let mut ops = Vec::new();
    for op in ops_reader {
        ops.push(op.map_err(|e| format!("op error: {e}"))?);
    }
    FuncCompiler::new(ctx, ty, locals, direct_locals)?.compile(&ops)
}

#[cfg(test)]
mod tests {
    use crate::bytecode;
    use crate::{Engine, Module};

    fn compile(wat: &str) -> Module {
        Module::new(&Engine::default(), wat).unwrap()
    }

    /// Collect every record start of a compiled body.
    fn record_starts(code: &[u8]) -> Vec<usize> {
        let mut starts = Vec::new();
        let mut pos = 0;
        while pos < code.len() {
            starts.push(pos);
            pos += bytecode::record_stride(code, pos);
        }
        assert_eq!(pos, code.len(), "record walk must land exactly on the end");
        starts
    }

    #[test]
    fn direct_local_access_elides_moves() {
        // local.get feeding an add reads the param slots in place: the
        // body is one add plus the end record.
        let module = compile(
            r#"(module (func (param i32 i32) (result i32)
                local.get 0 local.get 1 i32.add))"#,
        );
        let func = module.get_function(0).unwrap();
        let dump = func.dump();
        assert!(!dump.contains("move32"), "unexpected moves:\n{dump}");
        assert_eq!(record_starts(&func.code).len(), 2);
        // add reads offsets 0 and 4 (the params) directly
        assert!(dump.contains("i32.add 0 4"), "{dump}");
    }

    #[test]
    fn writeback_folds_into_local_slot() {
        // (i32.add) (local.set 2): the add writes local 2's slot, no move.
        let module = compile(
            r#"(module (func (param i32 i32) (local i32)
                local.get 0 local.get 1 i32.add local.set 2))"#,
        );
        let dump = module.get_function(0).unwrap().dump();
        assert!(!dump.contains("move32"), "{dump}");
        assert!(dump.contains("-> 8"), "add must target local 2's slot:\n{dump}");
    }

    #[test]
    fn overwriting_an_aliased_local_recompiles_with_moves() {
        // local.get 0 is live on the stack when local.set 0 runs; the
        // rewind must materialise the old value before the store.
        let module = compile(
            r#"(module (func (param i32) (result i32)
                local.get 0
                i32.const 7
                local.set 0
                ))"#,
        );
        let dump = module.get_function(0).unwrap().dump();
        assert!(dump.contains("move32"), "old value must be copied out:\n{dump}");
    }

    #[test]
    fn branch_offsets_land_on_record_starts() {
        let module = compile(
            r#"(module
                (func (param i32) (result i32)
                  (block (result i32)
                    (block (result i32)
                      i32.const 10
                      local.get 0
                      br_table 0 1 1)
                    i32.const 1
                    i32.add))
                (func (param i32) (result i32)
                  (if (result i32) (local.get 0)
                    (then (i32.const 1))
                    (else (i32.const 2))))
                (func (param i32) (result i32)
                  (local i32)
                  (loop (result i32)
                    local.get 1
                    i32.const 1
                    i32.add
                    local.tee 1
                    local.get 0
                    i32.lt_u
                    br_if 0
                    local.get 1)))"#,
        );
        for idx in 0..3 {
            let func = module.get_function(idx).unwrap();
            let starts = record_starts(&func.code);
            for &pos in &starts {
                for target in bytecode::branch_targets(&func.code, pos) {
                    assert!(
                        starts.contains(&target),
                        "function {idx}: branch at {pos} targets {target}, not a record:\n{}",
                        func.dump()
                    );
                }
            }
        }
    }

    #[test]
    fn frame_offsets_stay_within_required_stack_size() {
        let module = compile(
            r#"(module (func (param i64 f64) (result f64)
                (local i32)
                local.get 1
                local.get 1
                f64.add
                local.get 0
                f64.convert_i64_s
                f64.mul))"#,
        );
        let func = module.get_function(0).unwrap();
        let code = &func.code;
        let required = func.required_stack_size;
        for &pos in &record_starts(code) {
            let op = bytecode::read_u16(code, pos);
            if bytecode::is_binary_op(op) {
                for field in 0..3 {
                    let off = bytecode::read_u16(code, pos + 2 + 2 * field) as u32;
                    assert!(off < required, "offset {off} outside frame of {required}");
                }
            }
        }
    }

    #[test]
    fn catch_ranges_are_ordered() {
        let module = compile(
            r#"(module
                (tag $t (param i32))
                (func (result i32)
                  (try (result i32)
                    (do (throw $t (i32.const 9)))
                    (catch $t))))"#,
        );
        let func = module.get_function(0).unwrap();
        assert_eq!(func.catches.len(), 1);
        let c = &func.catches[0];
        assert!(c.try_start < c.try_end && c.try_end <= c.catch_start);
    }

    #[test]
    fn too_deep_frames_are_rejected() {
        // 16k i64 locals push the frame past the 16-bit offset space.
        let mut wat = String::from("(module (func ");
        wat.push_str("(local");
        for _ in 0..9000 {
            wat.push_str(" i64");
        }
        wat.push_str(")))");
        let err = Module::new(&Engine::default(), &wat).unwrap_err();
        assert!(err.to_string().contains("too many stack usage"), "{err}");
    }
}
