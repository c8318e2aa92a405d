use wasmparser::ValType;

/// Byte width of a reference slot on the frame (pointer-sized).
pub(crate) const REF_SIZE: u32 = std::mem::size_of::<usize>() as u32;

/// Byte width a value of the given type occupies in an activation frame.
///
/// This is the unit of frame addressing: every stack offset the compiler
/// emits is a multiple-free byte offset computed from these sizes.
pub(crate) fn value_size_in_stack(ty: ValType) -> u32 {
    match ty {
        ValType::I32 | ValType::F32 => 4,
        ValType::I64 | ValType::F64 => 8,
        ValType::V128 => 16,
        ValType::Ref(_) => REF_SIZE,
    }
}

/// Dynamic WASM value for untyped function calls.
///
/// `FuncRef` holds an opaque function id from the store's funcref
/// registry (`None` = null). `ExternRef` holds an opaque host handle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Val {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    V128(u128),
    FuncRef(Option<u32>),
    ExternRef(Option<u64>),
}

impl Val {
    pub fn zero_for(ty: ValType) -> Val {
        match ty {
            ValType::I32 => Val::I32(0),
            ValType::I64 => Val::I64(0),
            ValType::F32 => Val::F32(0.0),
            ValType::F64 => Val::F64(0.0),
            ValType::V128 => Val::V128(0),
            ValType::Ref(r) if r == wasmparser::RefType::EXTERNREF => Val::ExternRef(None),
            ValType::Ref(_) => Val::FuncRef(None),
        }
    }

    pub fn ty_matches(&self, ty: ValType) -> bool {
        matches!(
            (self, ty),
            (Val::I32(_), ValType::I32)
                | (Val::I64(_), ValType::I64)
                | (Val::F32(_), ValType::F32)
                | (Val::F64(_), ValType::F64)
                | (Val::V128(_), ValType::V128)
                | (Val::FuncRef(_), ValType::Ref(_))
                | (Val::ExternRef(_), ValType::Ref(_))
        )
    }

    /// Pack into the raw bit pattern frame slots use.
    ///
    /// Null references are 0; funcrefs are 1-based registry ids;
    /// externrefs are host handle + 1 (the +1 only exists at this
    /// boundary so handle 0 stays distinguishable from null).
    pub(crate) fn to_bits(&self) -> u64 {
        match *self {
            Val::I32(v) => v as u32 as u64,
            Val::I64(v) => v as u64,
            Val::F32(v) => v.to_bits() as u64,
            Val::F64(v) => v.to_bits(),
            Val::FuncRef(Some(id)) => id as u64,
            Val::FuncRef(None) => 0,
            Val::ExternRef(Some(h)) => h.wrapping_add(1),
            Val::ExternRef(None) => 0,
            Val::V128(_) => panic!("v128 values cannot be packed into a u64 slot"),
        }
    }

    pub(crate) fn from_bits(bits: u64, ty: ValType) -> Val {
        match ty {
            ValType::I32 => Val::I32(bits as u32 as i32),
            ValType::I64 => Val::I64(bits as i64),
            ValType::F32 => Val::F32(f32::from_bits(bits as u32)),
            ValType::F64 => Val::F64(f64::from_bits(bits)),
            ValType::V128 => Val::V128(bits as u128),
            ValType::Ref(r) if r == wasmparser::RefType::EXTERNREF => {
                if bits == 0 {
                    Val::ExternRef(None)
                } else {
                    Val::ExternRef(Some(bits - 1))
                }
            }
            ValType::Ref(_) => {
                if bits == 0 {
                    Val::FuncRef(None)
                } else {
                    Val::FuncRef(Some(bits as u32))
                }
            }
        }
    }
}

/// Convert a single Rust value to/from a `Val`.
pub trait WasmVal: Sized {
    fn to_val(&self) -> Val;
    fn from_val(val: &Val) -> Result<Self, anyhow::Error>;
}

macro_rules! impl_wasm_val {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl WasmVal for $ty {
                fn to_val(&self) -> Val {
                    Val::$variant(*self)
                }
                fn from_val(val: &Val) -> Result<Self, anyhow::Error> {
                    match val {
                        Val::$variant(v) => Ok(*v),
                        _ => anyhow::bail!(concat!("expected ", stringify!($ty), ", got {:?}"), val),
                    }
                }
            }
        )*
    };
}

impl_wasm_val!(i32 => I32, i64 => I64, f32 => F32, f64 => F64);

/// Convert Rust types into WASM call arguments.
pub trait WasmArgs {
    fn to_vals(&self) -> Vec<Val>;
}

/// Convert WASM results back into Rust types.
pub trait WasmResults: Sized {
    fn from_vals(vals: &[Val]) -> Result<Self, anyhow::Error>;
}

impl WasmArgs for () {
    fn to_vals(&self) -> Vec<Val> {
        vec![]
    }
}

impl WasmResults for () {
    fn from_vals(vals: &[Val]) -> Result<Self, anyhow::Error> {
        anyhow::ensure!(vals.is_empty(), "expected no results, got {}", vals.len());
        Ok(())
    }
}

macro_rules! impl_wasm_tuples {
    ($(($($t:ident),+)),* $(,)?) => {
        $(
            impl<$($t: WasmVal),+> WasmArgs for ($($t,)+) {
                #[allow(non_snake_case)]
                fn to_vals(&self) -> Vec<Val> {
                    let ($($t,)+) = self;
                    vec![$($t.to_val()),+]
                }
            }

            impl<$($t: WasmVal),+> WasmResults for ($($t,)+) {
                #[allow(non_snake_case)]
                fn from_vals(vals: &[Val]) -> Result<Self, anyhow::Error> {
                    let expected = [$(stringify!($t)),+].len();
                    anyhow::ensure!(
                        vals.len() == expected,
                        "expected {} results, got {}",
                        expected,
                        vals.len()
                    );
                    let mut _i = 0;
                    Ok(($({
                        let v = $t::from_val(&vals[_i])?;
                        _i += 1;
                        v
                    },)+))
                }
            }
        )*
    };
}

impl_wasm_tuples!(
    (A),
    (A, B),
    (A, B, C),
    (A, B, C, D),
    (A, B, C, D, E),
    (A, B, C, D, E, F),
    (A, B, C, D, E, F, G),
    (A, B, C, D, E, F, G, H),
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_round_trip_scalars() {
        for v in [Val::I32(-5), Val::I64(1 << 40), Val::F32(1.5), Val::F64(-0.0)] {
            let ty = match v {
                Val::I32(_) => ValType::I32,
                Val::I64(_) => ValType::I64,
                Val::F32(_) => ValType::F32,
                Val::F64(_) => ValType::F64,
                _ => unreachable!(),
            };
            assert_eq!(Val::from_bits(v.to_bits(), ty), v);
        }
    }

    #[test]
    fn null_refs_are_zero_bits() {
        assert_eq!(Val::FuncRef(None).to_bits(), 0);
        assert_eq!(Val::ExternRef(None).to_bits(), 0);
        // funcref id 1 is the first registry entry, distinct from null
        assert_eq!(Val::FuncRef(Some(1)).to_bits(), 1);
        // externref handle 0 is shifted so it stays distinct from null
        assert_eq!(Val::ExternRef(Some(0)).to_bits(), 1);
    }

    #[test]
    fn tuple_results_check_arity() {
        let vals = vec![Val::I32(1), Val::I32(2)];
        let got: (i32, i32) = WasmResults::from_vals(&vals).unwrap();
        assert_eq!(got, (1, 2));
        assert!(<(i32,) as WasmResults>::from_vals(&vals).is_err());
    }
}
