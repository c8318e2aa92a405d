use wasmparser::{Validator, WasmFeatures};

/// Shared compilation configuration.
pub struct Engine {
    features: WasmFeatures,
    direct_local_access: bool,
}

impl Engine {
    /// Create a new validator with the engine's features.
    pub fn new_validator(&self) -> Validator {
        Validator::new_with_features(self.features)
    }

    /// Toggle the direct-local-access optimisation. Execution results
    /// are identical either way; turning it off exists for differential
    /// testing and debugging of compiled code.
    pub fn set_direct_local_access(&mut self, enabled: bool) {
        self.direct_local_access = enabled;
    }

    pub(crate) fn direct_local_access(&self) -> bool {
        self.direct_local_access
    }
}

impl Default for Engine {
    fn default() -> Self {
        // Core spec plus exceptions, reference types, bulk memory and
        // multi-value. SIMD/threads/GC modules are rejected at load.
        let mut features = WasmFeatures::default();
        features.set(WasmFeatures::SIMD, false);
        features.set(WasmFeatures::RELAXED_SIMD, false);
        features.set(WasmFeatures::THREADS, false);
        features.set(WasmFeatures::SHARED_EVERYTHING_THREADS, false);
        features.set(WasmFeatures::GC, false);
        features.set(WasmFeatures::FUNCTION_REFERENCES, false);
        features.set(WasmFeatures::TAIL_CALL, false);
        features.set(WasmFeatures::MEMORY64, false);
        features.set(WasmFeatures::MULTI_MEMORY, false);
        features.set(WasmFeatures::COMPONENT_MODEL, false);
        features.set(WasmFeatures::EXCEPTIONS, true);
        features.set(WasmFeatures::LEGACY_EXCEPTIONS, true);
        Self { features, direct_local_access: true }
    }
}
