//! Named import registry.
//!
//! Collects `(module, field) -> extern` bindings and resolves a module's
//! declared imports against them during instantiation. Whole instances
//! can be registered under a module name, which is how cross-module
//! linking (and the spectest host module) works.

use std::collections::HashMap;
use std::rc::Rc;

use wasmparser::ValType;

use crate::global::{Global, Tag};
use crate::instance;
use crate::memory::Memory;
use crate::module::{FunctionType, GlobalType, MemoryType, TableType};
use crate::store::{ExternVal, Function, Store};
use crate::table::Table;
use crate::trap::Trap;
use crate::value::Val;
use crate::{Engine, Instance, Module};

pub struct Linker {
    defs: HashMap<(String, String), ExternVal>,
}

impl Linker {
    pub fn new(_engine: &Engine) -> Self {
        Linker { defs: HashMap::new() }
    }

    /// Register a single extern under `module.name`.
    pub fn define(&mut self, module: &str, name: &str, val: ExternVal) {
        self.defs.insert((module.to_string(), name.to_string()), val);
    }

    /// Register a host function.
    pub fn func(
        &mut self,
        module: &str,
        name: &str,
        params: Vec<ValType>,
        results: Vec<ValType>,
        callback: impl Fn(&[Val]) -> Result<Vec<Val>, Trap> + 'static,
    ) {
        self.define(module, name, ExternVal::Func(Function::host(params, results, callback)));
    }

    /// Register a host global with the value's type.
    pub fn global(&mut self, module: &str, name: &str, value: Val, mutable: bool) {
        let content = match value {
            Val::I32(_) => ValType::I32,
            Val::I64(_) => ValType::I64,
            Val::F32(_) => ValType::F32,
            Val::F64(_) => ValType::F64,
            Val::V128(_) => ValType::V128,
            Val::FuncRef(_) => ValType::FUNCREF,
            Val::ExternRef(_) => ValType::EXTERNREF,
        };
        let global = Global::new(GlobalType { content, mutable }, value);
        self.define(module, name, ExternVal::Global(Rc::new(global)));
    }

    pub fn memory(&mut self, module: &str, name: &str, min: u64, max: Option<u64>) -> Rc<Memory> {
        let memory = Rc::new(Memory::new(MemoryType { min, max }));
        self.define(module, name, ExternVal::Memory(memory.clone()));
        memory
    }

    pub fn table(&mut self, module: &str, name: &str, min: u64, max: Option<u64>) -> Rc<Table> {
        let table = Rc::new(Table::new(TableType {
            element: ValType::FUNCREF,
            min,
            max,
        }));
        self.define(module, name, ExternVal::Table(table.clone()));
        table
    }

    pub fn tag(&mut self, module: &str, name: &str, params: Vec<ValType>) -> Rc<Tag> {
        let tag = Rc::new(Tag::new(Rc::new(FunctionType::new(params, Vec::new()))));
        self.define(module, name, ExternVal::Tag(tag.clone()));
        tag
    }

    /// Re-export every export of an instance under `module`, so later
    /// modules can import from it by name.
    pub fn define_instance(&mut self, module: &str, instance: &Instance) {
        for (name, val) in instance.exports() {
            self.define(module, &name, val);
        }
    }

    /// Resolve the module's imports against the registry and
    /// instantiate it in `store`.
    pub fn instantiate(&self, store: &mut Store, module: &Module) -> Result<Instance, anyhow::Error> {
        let mut resolved = Vec::with_capacity(module.data.imports.len());
        for import in &module.data.imports {
            let key = (import.module.clone(), import.field.clone());
            let val = self
                .defs
                .get(&key)
                .ok_or_else(|| {
                    anyhow::anyhow!("unknown import: {}.{}", import.module, import.field)
                })?
                .clone();
            resolved.push(val);
        }
        instance::instantiate(store, module, resolved)
    }
}
