use crate::compiler::{compile, CompileErrors};
use crate::vm::{RuntimeFailure, VM};
use log::{debug, trace};
use std::io::Write;
use thiserror::Error;

pub mod chunk;
pub mod compiler;
pub mod natives;
pub mod object;
pub mod scanner;
pub mod value;
pub mod vm;

/// Compiles and runs `source` on a fresh VM, printing to `write`.
pub fn interpret<W: Write>(source: &str, write: &mut W) -> Result<(), InterpretError> {
    let mut vm = VM::new(write);
    run(&mut vm, source)
}

/// Compiles and runs `source` on an existing VM, keeping its globals.
pub fn run<W: Write>(vm: &mut VM<'_, W>, source: &str) -> Result<(), InterpretError> {
    trace!("Got input string: {source}");
    let function = compile(source)?;
    debug!("Compiled script, running");
    vm.interpret(function)?;
    Ok(())
}

#[derive(Error, Debug, Clone)]
pub enum InterpretError {
    #[error(transparent)]
    CompileErrors(#[from] CompileErrors),
    #[error(transparent)]
    Runtime(#[from] RuntimeFailure),
}

impl InterpretError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            InterpretError::CompileErrors(_) => 65,
            InterpretError::Runtime(_) => 70,
        }
    }
}
