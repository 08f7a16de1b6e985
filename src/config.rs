//! Code generation options.

use crate::diagnostics::CodegenError;

/// Options recognized by the generator. Mirrors the knobs the downstream
/// toolchain exposes; everything defaults to the plain single-threaded,
/// non-relocatable configuration.
#[derive(Debug, Clone)]
pub struct AsmJsConfig {
    /// Wrap float values in `Math_fround` to get precise 32-bit float
    /// semantics, and use the `f` signature letter for float parameters.
    pub precise_f32: bool,
    /// Lower volatile accesses and fences with the Atomics API.
    pub enable_pthreads: bool,
    /// Diagnose loads and stores whose alignment is below their width.
    pub warn_on_unaligned: bool,
    /// Diagnose NaN literals whose bit pattern JS engines will not preserve.
    pub warn_on_noncanonical_nans: bool,
    /// Reserve `2 * (N + 1)` slots at the start of every function table for
    /// functions registered at runtime.
    pub reserved_function_pointers: u32,
    /// Route indirect calls through `ftCall_<sig>` emulation instead of
    /// asm.js function tables.
    pub emulated_function_pointers: bool,
    /// Insert runtime checks (stack overflow on every bump) when nonzero.
    pub assertions: u32,
    /// Give every addressed function a globally unique slot across all
    /// signature tables.
    pub no_aliasing_function_pointers: bool,
    /// First byte of the global memory blob.
    pub global_base: u32,
    /// Emit relocation-compatible code. Requires `global_base == 0` and
    /// emulated function pointers.
    pub relocatable: bool,
    /// The optimization level the IR was produced at. At 0 the generator
    /// runs its own alloca nativization; above that the regular optimizer
    /// (mem2reg, SROA, GVN) has already taken those opportunities.
    pub optimization_level: u32,
}

impl Default for AsmJsConfig {
    fn default() -> AsmJsConfig {
        AsmJsConfig {
            precise_f32: false,
            enable_pthreads: false,
            warn_on_unaligned: false,
            warn_on_noncanonical_nans: true,
            reserved_function_pointers: 0,
            emulated_function_pointers: false,
            assertions: 0,
            no_aliasing_function_pointers: false,
            global_base: 8,
            relocatable: false,
            optimization_level: 2,
        }
    }
}

impl AsmJsConfig {
    pub fn validate(&self) -> Result<(), CodegenError> {
        if self.relocatable && self.global_base != 0 {
            return Err(CodegenError::invalid_config(format!(
                "relocatable output requires global_base == 0 (got {})",
                self.global_base
            )));
        }
        if self.relocatable && !self.emulated_function_pointers {
            return Err(CodegenError::invalid_config(
                "relocatable output requires emulated function pointers",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(AsmJsConfig::default().validate().is_ok());
    }

    #[test]
    fn relocatable_requires_zero_global_base() {
        let config = AsmJsConfig {
            relocatable: true,
            emulated_function_pointers: true,
            ..AsmJsConfig::default()
        };
        assert!(config.validate().is_err());

        let config = AsmJsConfig {
            global_base: 0,
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn relocatable_requires_emulated_function_pointers() {
        let config = AsmJsConfig {
            relocatable: true,
            global_base: 0,
            ..AsmJsConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
