use std::cell::RefCell;
use std::rc::{Rc, Weak};

use wasmparser::ValType;

use crate::global::{Global, Tag};
use crate::instance::InstanceData;
use crate::memory::Memory;
use crate::module::FunctionType;
use crate::stack::ExecStack;
use crate::table::Table;
use crate::trap::Trap;
use crate::value::Val;
use crate::{Engine, Instance};

/// A host-provided function callable from WASM.
pub type HostFunc = Rc<dyn Fn(&[Val]) -> Result<Vec<Val>, Trap>>;

pub(crate) enum FuncKind {
    /// A module-defined function. The instance back-reference is weak
    /// (the store owns the instance); it is validated at call time.
    Defined { instance: Weak<InstanceData>, index: u32 },
    Host { callback: HostFunc },
}

/// A function instance: a signature plus either compiled code bound to
/// an instance, or a host callback.
pub struct Function {
    pub(crate) ty: Rc<FunctionType>,
    pub(crate) kind: FuncKind,
}

impl Function {
    pub fn ty(&self) -> &Rc<FunctionType> {
        &self.ty
    }

    /// Wrap a host callback as a callable function.
    pub fn host(
        params: Vec<ValType>,
        results: Vec<ValType>,
        callback: impl Fn(&[Val]) -> Result<Vec<Val>, Trap> + 'static,
    ) -> Rc<Function> {
        Rc::new(Function {
            ty: Rc::new(FunctionType::new(params, results)),
            kind: FuncKind::Host { callback: Rc::new(callback) },
        })
    }
}

/// A handle to any importable/exportable runtime object.
#[derive(Clone)]
pub enum ExternVal {
    Func(Rc<Function>),
    Table(Rc<Table>),
    Memory(Rc<Memory>),
    Global(Rc<Global>),
    Tag(Rc<Tag>),
}

impl ExternVal {
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            ExternVal::Func(_) => "function",
            ExternVal::Table(_) => "table",
            ExternVal::Memory(_) => "memory",
            ExternVal::Global(_) => "global",
            ExternVal::Tag(_) => "tag",
        }
    }
}

/// Owns everything a set of instances shares: the funcref registry that
/// backs reference values, the execution stack, and the instances
/// themselves. Single-threaded; one store per thread of execution.
pub struct Store {
    /// Funcref registry: a reference value `id` denotes `refs[id - 1]`,
    /// and 0 is null.
    pub(crate) refs: RefCell<Vec<Rc<Function>>>,
    pub(crate) stack: RefCell<ExecStack>,
    pub(crate) instances: RefCell<Vec<Rc<InstanceData>>>,
}

impl Store {
    pub fn new(_engine: &Engine) -> Self {
        Store {
            refs: RefCell::new(Vec::new()),
            stack: RefCell::new(ExecStack::new()),
            instances: RefCell::new(Vec::new()),
        }
    }

    /// Register a function in the funcref registry, returning its
    /// 1-based id. Re-registering the same function returns the same id.
    pub(crate) fn intern_func(&self, func: &Rc<Function>) -> u32 {
        let mut refs = self.refs.borrow_mut();
        for (i, f) in refs.iter().enumerate() {
            if Rc::ptr_eq(f, func) {
                return i as u32 + 1;
            }
        }
        refs.push(func.clone());
        refs.len() as u32
    }

    pub(crate) fn func_by_bits(&self, bits: u64) -> Option<Rc<Function>> {
        let idx = (bits as usize).checked_sub(1)?;
        self.refs.borrow().get(idx).cloned()
    }

    pub(crate) fn keep_alive(&self, instance: &Instance) {
        self.instances.borrow_mut().push(instance.data.clone());
    }
}
