//! Error and warning types for code generation.
//!
//! The generator performs no local recovery: any fatal condition surfaces as
//! a [`CodegenError`] propagated to the host, which decides whether to abort.
//! Warnings are collected in a [`Diagnostics`] sink and returned alongside
//! the output so hosts can print or suppress them.

use colour::yellow_ln_bold;
use std::fmt;

/// Fatal error categories. These all mean the input is outside what the
/// generator supports (or the configuration is inconsistent), never that the
/// user program is wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UnsupportedConstant,
    UnsupportedInstruction,
    UnsupportedVectorType,
    IntegerTooWide,
    MissingGlobalAddress,
    InvalidConfig,
    UnsupportedBranch,
}

#[derive(Debug, Clone)]
pub struct CodegenError {
    pub kind: ErrorKind,
    pub msg: String,
}

impl CodegenError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> CodegenError {
        CodegenError {
            kind,
            msg: msg.into(),
        }
    }

    pub fn unsupported_constant(msg: impl Into<String>) -> CodegenError {
        CodegenError::new(ErrorKind::UnsupportedConstant, msg)
    }

    pub fn unsupported_instruction(msg: impl Into<String>) -> CodegenError {
        CodegenError::new(ErrorKind::UnsupportedInstruction, msg)
    }

    pub fn unsupported_vector_type(msg: impl Into<String>) -> CodegenError {
        CodegenError::new(ErrorKind::UnsupportedVectorType, msg)
    }

    pub fn integer_too_wide(msg: impl Into<String>) -> CodegenError {
        CodegenError::new(ErrorKind::IntegerTooWide, msg)
    }

    pub fn missing_global_address(name: &str) -> CodegenError {
        CodegenError::new(
            ErrorKind::MissingGlobalAddress,
            format!("cannot find global address of '{}'", name),
        )
    }

    pub fn invalid_config(msg: impl Into<String>) -> CodegenError {
        CodegenError::new(ErrorKind::InvalidConfig, msg)
    }

    pub fn unsupported_branch(msg: impl Into<String>) -> CodegenError {
        CodegenError::new(ErrorKind::UnsupportedBranch, msg)
    }
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.msg)
    }
}

impl std::error::Error for CodegenError {}

/// Non-fatal conditions. Emission proceeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    UnalignedAccess,
    UnalignedVolatileAccess,
    NoncanonicalNan,
    MismatchedTargetTriple,
    TooManyLocals,
}

#[derive(Debug, Clone)]
pub struct CodegenWarning {
    pub kind: WarningKind,
    pub msg: String,
    /// The function being lowered when the warning fired, if any.
    pub function: Option<String>,
}

impl CodegenWarning {
    pub fn new(kind: WarningKind, msg: impl Into<String>) -> CodegenWarning {
        CodegenWarning {
            kind,
            msg: msg.into(),
            function: None,
        }
    }

    pub fn in_function(mut self, name: &str) -> CodegenWarning {
        self.function = Some(name.to_owned());
        self
    }
}

pub fn print_formatted_warning(warning: &CodegenWarning) {
    yellow_ln_bold!("WARNING: ");
    match &warning.function {
        Some(function) => println!("{} (in '{}')", warning.msg, function),
        None => println!("{}", warning.msg),
    }
}

/// Warning sink for one module emission.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub warnings: Vec<CodegenWarning>,
    warned_too_many_locals: bool,
}

impl Diagnostics {
    pub fn new() -> Diagnostics {
        Diagnostics::default()
    }

    pub fn warn(&mut self, warning: CodegenWarning) {
        self.warnings.push(warning);
    }

    /// The locals-count warning fires at most once per module.
    pub fn warn_too_many_locals(&mut self, function: &str, count: usize) {
        if self.warned_too_many_locals {
            return;
        }
        self.warned_too_many_locals = true;
        self.warn(
            CodegenWarning::new(
                WarningKind::TooManyLocals,
                format!(
                    "emitted code declares {} local variables, which is bad for performance",
                    count
                ),
            )
            .in_function(function),
        );
    }
}

// Developer trace logging, compiled out unless the `codegen_log` feature is
// enabled.
#[macro_export]
#[cfg(feature = "codegen_log")]
macro_rules! codegen_log {
    ($($arg:tt)*) => {
        colour::grey_ln!($($arg)*);
    };
}

#[macro_export]
#[cfg(not(feature = "codegen_log"))]
macro_rules! codegen_log {
    ($($arg:tt)*) => {
        // Nothing
    };
}
