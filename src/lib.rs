//! trellis: a code generator that translates a pre-lowered, SSA-form IR
//! into a statically-typeable subset of JavaScript (asm.js style), suitable
//! for a downstream JS toolchain to turn into a runnable artifact.
//!
//! The input IR is assumed legalized upstream: 64-bit integers split into
//! 32-bit pairs, aggregates flattened, complex constructs decomposed. What
//! remains here is the translation core: expression lowering with exact
//! bit-for-bit coercion semantics, structured control-flow reconstruction
//! through a pluggable recovery service, a two-phase layout of global
//! initializers into a single byte image, per-signature function tables for
//! indirect calls, and the metadata manifest the consumer reads.
//!
//! ```no_run
//! use trellis::{generate_module, AsmJsConfig};
//! use trellis::ir::Module;
//!
//! let module = Module::new(); // normally built by the front end
//! let output = generate_module(&module, AsmJsConfig::default()).unwrap();
//! println!("{}", output.source);
//! ```

pub mod codegen;
pub mod config;
pub mod diagnostics;
pub mod ir;
pub mod relooper;

pub use codegen::calls::{CallHandler, CallHandlerTable};
pub use codegen::{generate_module, generate_module_with, AsmJsOutput};
pub use config::AsmJsConfig;
pub use diagnostics::{CodegenError, CodegenWarning, ErrorKind, WarningKind};
