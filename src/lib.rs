mod bytecode;
mod compile;
mod engine;
mod global;
mod instance;
mod interp;
mod linker;
mod memory;
mod module;
pub mod spectest;
mod stack;
mod store;
mod table;
mod trap;
mod value;

pub use engine::Engine;
pub use global::{Global, Tag};
pub use instance::Instance;
pub use linker::Linker;
pub use memory::Memory;
pub use module::{Export, ExternKind, FunctionType, Module, ModuleFunction};
pub use store::{ExternVal, Function, HostFunc, Store};
pub use table::Table;
pub use trap::{Exception, Trap};
pub use value::{Val, WasmArgs, WasmResults, WasmVal};
