use std::path::{Path, PathBuf};

use clap::Parser;
use tusk::{Engine, ExternVal, Instance, Linker, Module, Store, Val};

#[derive(Parser)]
#[command(name = "tusk", about = "A compact WebAssembly interpreter")]
struct Cli {
    /// Module or script files: .wasm (binary), .wat (text), .wast (script).
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Run every exported zero-argument function of each module.
    #[arg(long)]
    run_all_exports: bool,

    /// Run the exported function with this name.
    #[arg(long, value_name = "NAME")]
    entry: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let engine = Engine::default();
    let mut store = Store::new(&engine);
    let mut linker = Linker::new(&engine);
    tusk::spectest::link(&mut linker, &mut store);

    for path in &cli.files {
        match path.extension().and_then(|e| e.to_str()) {
            Some("wasm") => {
                let bytes = std::fs::read(path)?;
                run_module(&engine, &mut store, &mut linker, &bytes, &cli)?;
            }
            Some("wat") => {
                let bytes = wat::parse_file(path)?;
                run_module(&engine, &mut store, &mut linker, &bytes, &cli)?;
            }
            Some("wast") => {
                run_script(&engine, &mut store, &mut linker, path)?;
            }
            _ => anyhow::bail!("unsupported file type: {}", path.display()),
        }
    }
    Ok(())
}

fn run_module(
    engine: &Engine,
    store: &mut Store,
    linker: &mut Linker,
    bytes: &[u8],
    cli: &Cli,
) -> anyhow::Result<()> {
    let module = Module::from_bytes(engine, bytes)?;
    let instance = linker.instantiate(store, &module)?;

    if let Some(entry) = &cli.entry {
        let results = instance.call_dynamic(store, entry, &[])?;
        print_results(entry, &results);
    }
    if cli.run_all_exports {
        for (name, val) in instance.exports() {
            let ExternVal::Func(func) = val else { continue };
            if !func.ty().params().is_empty() {
                continue;
            }
            let results = instance.call_dynamic(store, &name, &[])?;
            print_results(&name, &results);
        }
    }
    Ok(())
}

fn print_results(name: &str, results: &[Val]) {
    if !results.is_empty() {
        println!("{name}: {results:?}");
    }
}

// --- .wast script execution ---

/// Expected value for assertions: a plain value, a NaN pattern, or a
/// reference pattern.
enum Expected {
    Val(Val),
    F32Nan,
    F64Nan,
    RefNull,
    RefFunc,
    RefExtern,
}

struct ScriptRunner<'e> {
    engine: &'e Engine,
    store: Store,
    linker: Linker,
    current: Option<Instance>,
}

fn run_script(
    engine: &Engine,
    _store: &mut Store,
    _linker: &mut Linker,
    path: &Path,
) -> anyhow::Result<()> {
    // Scripts get their own store/linker so registered names don't leak
    // between files.
    let mut store = Store::new(engine);
    let mut linker = Linker::new(engine);
    tusk::spectest::link(&mut linker, &mut store);
    let mut runner = ScriptRunner { engine, store, linker, current: None };

    let source = std::fs::read_to_string(path)?;
    let buf = wast::parser::ParseBuffer::new(&source)
        .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?;
    let script = wast::parser::parse::<wast::Wast>(&buf)
        .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?;

    let mut passed = 0usize;
    let mut failed = 0usize;
    for (i, directive) in script.directives.into_iter().enumerate() {
        match runner.run_directive(directive) {
            Ok(()) => passed += 1,
            Err(e) => {
                failed += 1;
                eprintln!("{}: directive #{}: {e}", path.display(), i + 1);
            }
        }
    }
    println!("{}: {passed} passed, {failed} failed", path.display());
    anyhow::ensure!(failed == 0, "{failed} directives failed");
    Ok(())
}

impl ScriptRunner<'_> {
    fn instantiate(&mut self, mut wat: wast::QuoteWat) -> anyhow::Result<()> {
        let bytes = wat.encode().map_err(|e| anyhow::anyhow!("{e}"))?;
        let module = Module::from_bytes(self.engine, &bytes)?;
        self.current = Some(self.linker.instantiate(&mut self.store, &module)?);
        Ok(())
    }

    fn invoke(&mut self, invoke: &wast::WastInvoke) -> anyhow::Result<Vec<Val>> {
        let args = parse_args(invoke)?;
        let instance = self
            .current
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no active module"))?
            .clone();
        instance.call_dynamic(&mut self.store, invoke.name, &args)
    }

    fn execute(&mut self, exec: wast::WastExecute) -> anyhow::Result<Vec<Val>> {
        match exec {
            wast::WastExecute::Invoke(invoke) => self.invoke(&invoke),
            wast::WastExecute::Get { module, global, .. } => {
                anyhow::ensure!(module.is_none(), "named module gets are not supported");
                let instance = self
                    .current
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("no active module"))?;
                instance
                    .get_global(&self.store, global)
                    .map(|v| vec![v])
                    .ok_or_else(|| anyhow::anyhow!("global {global} not found"))
            }
            wast::WastExecute::Wat(wat) => {
                self.instantiate(wast::QuoteWat::Wat(wat))?;
                Ok(vec![])
            }
        }
    }

    fn expect_module_fails(&mut self, wat: wast::QuoteWat, message: &str) -> anyhow::Result<()> {
        match self.instantiate(wat) {
            Err(_) => Ok(()),
            Ok(()) => anyhow::bail!("module should have been rejected ({message})"),
        }
    }

    fn run_directive(&mut self, directive: wast::WastDirective) -> anyhow::Result<()> {
        match directive {
            wast::WastDirective::Module(wat) => self.instantiate(wat),
            wast::WastDirective::Register { name, .. } => {
                let instance = self
                    .current
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("register without a module"))?
                    .clone();
                self.linker.define_instance(name, &instance);
                Ok(())
            }
            wast::WastDirective::AssertReturn { exec, results, .. } => {
                let got = self.execute(exec)?;
                let expected = parse_expected(&results)?;
                anyhow::ensure!(
                    vals_match(&got, &expected),
                    "got {got:?}, expected {}",
                    describe(&expected)
                );
                Ok(())
            }
            wast::WastDirective::AssertTrap { exec, message, .. } => match self.execute(exec) {
                Err(_) => Ok(()),
                Ok(got) => anyhow::bail!("should trap ({message}), got {got:?}"),
            },
            wast::WastDirective::AssertExhaustion { call, message, .. } => {
                match self.invoke(&call) {
                    Err(_) => Ok(()),
                    Ok(got) => anyhow::bail!("should exhaust ({message}), got {got:?}"),
                }
            }
            wast::WastDirective::AssertException { exec, .. } => match self.execute(exec) {
                Err(_) => Ok(()),
                Ok(got) => anyhow::bail!("should throw, got {got:?}"),
            },
            wast::WastDirective::AssertInvalid { module, message, .. } => {
                self.expect_module_fails(module, message)
            }
            wast::WastDirective::AssertMalformed { module, message, .. } => {
                self.expect_module_fails(module, message)
            }
            wast::WastDirective::AssertUnlinkable { module, message, .. } => {
                self.expect_module_fails(wast::QuoteWat::Wat(module), message)
            }
            wast::WastDirective::Invoke(invoke) => self.invoke(&invoke).map(|_| ()),
            other => anyhow::bail!("unsupported directive: {other:?}"),
        }
    }
}

fn parse_args(invoke: &wast::WastInvoke) -> anyhow::Result<Vec<Val>> {
    invoke
        .args
        .iter()
        .map(|a| match a {
            wast::WastArg::Core(c) => val_from_arg(c),
            other => anyhow::bail!("unsupported argument: {other:?}"),
        })
        .collect()
}

fn val_from_arg(arg: &wast::core::WastArgCore) -> anyhow::Result<Val> {
    use wast::core::WastArgCore as A;
    Ok(match arg {
        A::I32(v) => Val::I32(*v),
        A::I64(v) => Val::I64(*v),
        A::F32(v) => Val::F32(f32::from_bits(v.bits)),
        A::F64(v) => Val::F64(f64::from_bits(v.bits)),
        A::RefNull(_) => Val::FuncRef(None),
        A::RefExtern(v) => Val::ExternRef(Some(*v as u64)),
        other => anyhow::bail!("unsupported argument: {other:?}"),
    })
}

fn parse_expected(results: &[wast::WastRet]) -> anyhow::Result<Vec<Expected>> {
    results
        .iter()
        .map(|r| match r {
            wast::WastRet::Core(c) => expected_from_ret(c),
            other => anyhow::bail!("unsupported result: {other:?}"),
        })
        .collect()
}

fn expected_from_ret(ret: &wast::core::WastRetCore) -> anyhow::Result<Expected> {
    use wast::core::{NanPattern, WastRetCore as R};
    Ok(match ret {
        R::I32(v) => Expected::Val(Val::I32(*v)),
        R::I64(v) => Expected::Val(Val::I64(*v)),
        R::F32(NanPattern::Value(f)) => Expected::Val(Val::F32(f32::from_bits(f.bits))),
        R::F32(_) => Expected::F32Nan,
        R::F64(NanPattern::Value(f)) => Expected::Val(Val::F64(f64::from_bits(f.bits))),
        R::F64(_) => Expected::F64Nan,
        R::RefNull(_) => Expected::RefNull,
        R::RefFunc(_) => Expected::RefFunc,
        R::RefExtern(_) => Expected::RefExtern,
        other => anyhow::bail!("unsupported result: {other:?}"),
    })
}

fn vals_match(got: &[Val], expected: &[Expected]) -> bool {
    got.len() == expected.len() && got.iter().zip(expected).all(|(g, e)| val_matches(g, e))
}

fn val_matches(got: &Val, expected: &Expected) -> bool {
    match (got, expected) {
        (Val::I32(a), Expected::Val(Val::I32(b))) => a == b,
        (Val::I64(a), Expected::Val(Val::I64(b))) => a == b,
        (Val::F32(a), Expected::Val(Val::F32(b))) => a.to_bits() == b.to_bits(),
        (Val::F64(a), Expected::Val(Val::F64(b))) => a.to_bits() == b.to_bits(),
        (Val::F32(a), Expected::F32Nan) => a.is_nan(),
        (Val::F64(a), Expected::F64Nan) => a.is_nan(),
        (Val::FuncRef(r), Expected::RefNull) => r.is_none(),
        (Val::ExternRef(r), Expected::RefNull) => r.is_none(),
        (Val::FuncRef(r), Expected::RefFunc) => r.is_some(),
        (Val::ExternRef(r), Expected::RefExtern) => r.is_some(),
        _ => false,
    }
}

fn describe(expected: &[Expected]) -> String {
    let parts: Vec<String> = expected
        .iter()
        .map(|e| match e {
            Expected::Val(v) => format!("{v:?}"),
            Expected::F32Nan => "f32 nan".into(),
            Expected::F64Nan => "f64 nan".into(),
            Expected::RefNull => "ref.null".into(),
            Expected::RefFunc => "ref.func".into(),
            Expected::RefExtern => "ref.extern".into(),
        })
        .collect();
    format!("[{}]", parts.join(", "))
}
