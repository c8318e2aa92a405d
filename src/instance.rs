use std::cell::RefCell;
use std::rc::Rc;

use crate::global::{Global, Tag};
use crate::interp;
use crate::memory::Memory;
use crate::module::{ExternKind, ImportKind, SegmentMode};
use crate::store::{ExternVal, FuncKind, Function, Store};
use crate::table::Table;
use crate::trap::Trap;
use crate::value::{Val, WasmArgs, WasmResults};
use crate::Module;

/// The runtime state behind an `Instance`: the module bound to concrete
/// functions, memories, tables, globals and tags. Imported objects are
/// shared references; defined objects are owned here.
pub(crate) struct InstanceData {
    pub module: Module,
    /// Full function index space (imports first).
    pub functions: Vec<Rc<Function>>,
    /// Funcref registry id per function index.
    pub func_ref_ids: Vec<u32>,
    pub memories: Vec<Rc<Memory>>,
    pub tables: Vec<Rc<Table>>,
    pub globals: Vec<Rc<Global>>,
    pub tags: Vec<Rc<Tag>>,
    /// Resolved passive element segments (`None` = dropped).
    pub elem_segments: RefCell<Vec<Option<Vec<u64>>>>,
    pub data_dropped: RefCell<Vec<bool>>,
}

/// An instantiated module.
#[derive(Clone)]
pub struct Instance {
    pub(crate) data: Rc<InstanceData>,
}

fn trap_err(trap: Trap) -> anyhow::Error {
    anyhow::Error::new(trap)
}

/// Bind a module to resolved imports and run its initialisation:
/// globals, table initialisers, element and data segments, then the
/// start function.
pub(crate) fn instantiate(
    store: &Store,
    module: &Module,
    imports: Vec<ExternVal>,
) -> Result<Instance, anyhow::Error> {
    let data = &module.data;
    anyhow::ensure!(
        imports.len() == data.imports.len(),
        "expected {} imports, got {}",
        data.imports.len(),
        imports.len()
    );

    let mut imp_funcs = Vec::new();
    let mut memories = Vec::new();
    let mut tables = Vec::new();
    let mut globals = Vec::new();
    let mut tags = Vec::new();

    for (decl, provided) in data.imports.iter().zip(imports) {
        let name = format!("{}.{}", decl.module, decl.field);
        match (&decl.kind, provided) {
            (ImportKind::Func(type_idx), ExternVal::Func(f)) => {
                let expected = &data.types[*type_idx as usize];
                anyhow::ensure!(
                    **f.ty() == **expected,
                    "import {name}: incompatible function type"
                );
                imp_funcs.push(f);
            }
            (ImportKind::Table(ty), ExternVal::Table(t)) => {
                let actual = t.ty();
                anyhow::ensure!(
                    actual.element == ty.element
                        && actual.min >= ty.min
                        && ty.max.map_or(true, |dm| actual.max.is_some_and(|am| am <= dm)),
                    "import {name}: incompatible table type"
                );
                tables.push(t);
            }
            (ImportKind::Memory(ty), ExternVal::Memory(m)) => {
                let actual = m.ty();
                anyhow::ensure!(
                    actual.min >= ty.min
                        && ty.max.map_or(true, |dm| actual.max.is_some_and(|am| am <= dm)),
                    "import {name}: incompatible memory type"
                );
                memories.push(m);
            }
            (ImportKind::Global(ty), ExternVal::Global(g)) => {
                anyhow::ensure!(
                    g.ty().content == ty.content && g.ty().mutable == ty.mutable,
                    "import {name}: incompatible global type"
                );
                globals.push(g);
            }
            (ImportKind::Tag(type_idx), ExternVal::Tag(t)) => {
                let expected = &data.types[*type_idx as usize];
                anyhow::ensure!(**t.ty() == **expected, "import {name}: incompatible tag type");
                tags.push(t);
            }
            (_, provided) => {
                anyhow::bail!("import {name}: expected a different kind, got {}", provided.kind_name());
            }
        }
    }

    for ty in data.memories.iter().skip(data.num_memory_imports as usize) {
        memories.push(Rc::new(Memory::new(*ty)));
    }
    for def in data.tables.iter().skip(data.num_table_imports as usize) {
        tables.push(Rc::new(Table::new(def.ty)));
    }
    for def in &data.globals {
        globals.push(Rc::new(Global::zeroed(def.ty)));
    }
    for &sig in data.tags.iter().skip(data.num_tag_imports as usize) {
        tags.push(Rc::new(Tag::new(data.types[sig as usize].clone())));
    }

    let inst = Rc::new_cyclic(|weak| {
        let mut functions = Vec::with_capacity(data.func_types.len());
        functions.extend(imp_funcs.iter().cloned());
        for index in data.num_func_imports..data.func_types.len() as u32 {
            functions.push(Rc::new(Function {
                ty: module.func_type(index).clone(),
                kind: FuncKind::Defined { instance: weak.clone(), index },
            }));
        }
        let func_ref_ids = functions.iter().map(|f| store.intern_func(f)).collect();
        InstanceData {
            module: module.clone(),
            functions,
            func_ref_ids,
            memories,
            tables,
            globals,
            tags,
            elem_segments: RefCell::new(Vec::new()),
            data_dropped: RefCell::new(vec![false; data.datas.len()]),
        }
    });

    // Global initialisers, in index order so later ones can read earlier.
    for (i, def) in data.globals.iter().enumerate() {
        let vals = interp::call_module_function(store, &inst, &def.init, &[]).map_err(trap_err)?;
        inst.globals[inst.globals.len() - data.globals.len() + i].set_bits(vals[0].to_bits());
    }

    // Non-null table initialiser expressions.
    for (i, def) in data.tables.iter().enumerate().skip(data.num_table_imports as usize) {
        if let Some(init) = &def.init {
            let vals = interp::call_module_function(store, &inst, init, &[]).map_err(trap_err)?;
            let bits = vals[0].to_bits();
            let table = &inst.tables[i];
            table.fill(0, bits, table.size()).map_err(trap_err)?;
        }
    }

    // Element segments: resolve items to reference bits, apply actives.
    let mut segments = Vec::with_capacity(data.elements.len());
    for elem in &data.elements {
        let bits: Vec<u64> = elem
            .items
            .iter()
            .map(|item| match item {
                Some(f) => inst.func_ref_ids[*f as usize] as u64,
                None => 0,
            })
            .collect();
        match elem.mode {
            SegmentMode::Active => {
                let offset_fn = elem.offset.as_ref().expect("active segment offset");
                let vals =
                    interp::call_module_function(store, &inst, offset_fn, &[]).map_err(trap_err)?;
                let Val::I32(offset) = vals[0] else {
                    anyhow::bail!("element offset must be i32");
                };
                let table = &inst.tables[elem.table_index as usize];
                table
                    .init(offset as u32, 0, bits.len() as u32, &bits)
                    .map_err(trap_err)?;
                segments.push(None);
            }
            SegmentMode::Declared => segments.push(None),
            SegmentMode::Passive => segments.push(Some(bits)),
        }
    }
    *inst.elem_segments.borrow_mut() = segments;

    // Data segments.
    for (i, seg) in data.datas.iter().enumerate() {
        if seg.mode == SegmentMode::Active {
            let offset_fn = seg.offset.as_ref().expect("active segment offset");
            let vals =
                interp::call_module_function(store, &inst, offset_fn, &[]).map_err(trap_err)?;
            let Val::I32(offset) = vals[0] else {
                anyhow::bail!("data offset must be i32");
            };
            let memory = inst
                .memories
                .first()
                .ok_or_else(|| anyhow::anyhow!("active data segment without memory"))?;
            memory
                .init(offset as u32, 0, seg.bytes.len() as u32, &seg.bytes)
                .map_err(trap_err)?;
            inst.data_dropped.borrow_mut()[i] = true;
        }
    }

    let instance = Instance { data: inst };
    store.keep_alive(&instance);

    if let Some(start) = data.start {
        let target = instance.data.functions[start as usize].clone();
        interp::call_function(store, &target, &[]).map_err(trap_err)?;
    }

    Ok(instance)
}

impl Instance {
    /// Call an exported function by name (typed API).
    pub fn call<A: WasmArgs, R: WasmResults>(
        &self,
        store: &mut Store,
        name: &str,
        args: A,
    ) -> Result<R, anyhow::Error> {
        let vals = self.call_dynamic(store, name, &args.to_vals())?;
        R::from_vals(&vals)
    }

    /// Call an exported function by name (dynamic API).
    pub fn call_dynamic(
        &self,
        store: &mut Store,
        name: &str,
        args: &[Val],
    ) -> Result<Vec<Val>, anyhow::Error> {
        let Some(ExternVal::Func(func)) = self.get_export(name) else {
            anyhow::bail!("export {name} is not a function");
        };
        let params = func.ty().params();
        anyhow::ensure!(
            args.len() == params.len(),
            "{name}: expected {} arguments, got {}",
            params.len(),
            args.len()
        );
        for (arg, &p) in args.iter().zip(params) {
            anyhow::ensure!(arg.ty_matches(p), "{name}: argument type mismatch for {arg:?}");
        }
        interp::call_function(&*store, &func, args).map_err(trap_err)
    }

    /// Read an exported global's current value.
    pub fn get_global(&self, _store: &Store, name: &str) -> Option<Val> {
        match self.get_export(name)? {
            ExternVal::Global(g) => Some(g.get()),
            _ => None,
        }
    }

    /// Look up any export as a runtime handle.
    pub fn get_export(&self, name: &str) -> Option<ExternVal> {
        let data = &self.data;
        let &(kind, index) = data.module.data.export_map.get(name)?;
        Some(self.export_val(kind, index))
    }

    /// Iterate `(name, handle)` over all exports.
    pub fn exports(&self) -> Vec<(String, ExternVal)> {
        self.data
            .module
            .data
            .exports
            .iter()
            .map(|e| (e.name.clone(), self.export_val(e.kind, e.index)))
            .collect()
    }

    fn export_val(&self, kind: ExternKind, index: u32) -> ExternVal {
        let data = &self.data;
        match kind {
            ExternKind::Func => ExternVal::Func(data.functions[index as usize].clone()),
            ExternKind::Table => ExternVal::Table(data.tables[index as usize].clone()),
            ExternKind::Memory => ExternVal::Memory(data.memories[index as usize].clone()),
            ExternKind::Global => ExternVal::Global(data.globals[index as usize].clone()),
            ExternKind::Tag => ExternVal::Tag(data.tags[index as usize].clone()),
        }
    }

    pub fn module(&self) -> &Module {
        &self.data.module
    }
}
