//! Core library for the blikk programming language
//!
//! blikk is a small statically-typed embeddable scripting language. This
//! crate holds the whole core: the lexer, the single-pass compiler that
//! emits a linear stack-machine IR, and the virtual machine that executes
//! it. A thin CLI and REPL live in the `blikk` binary crate.
//!
//! # Embedding
//!
//! ```no_run
//! use blikk_lang::{builtins, Compiler, Program, RunFlags, VirtualMachine};
//!
//! let mut program = Program::new();
//! let mut compiler = Compiler::new(&mut program);
//! builtins::import_all(&mut compiler, &mut program);
//!
//! compiler.compile(&mut program, "printLn(1 + 2)", "<demo>").unwrap();
//!
//! let mut vm = VirtualMachine::new();
//! vm.run(&program, RunFlags::default()).unwrap();
//! ```
//!
//! The program image persists across compiles, so a REPL can keep calling
//! `compile` and `run` against the same [`Program`]; failed compiles roll
//! every table back.

pub mod builtins;
pub mod compiler;
pub mod error;
pub mod lexer;
pub mod program;
pub mod vm;

pub use compiler::{CompileReport, Compiler, FunctionFlags};
pub use error::{
    Diagnostic, DiagnosticKind, DiagnosticSink, InvalidSource, RunError, render_diagnostic,
};
pub use lexer::{Token, TokenKind, TokenizedFile, tokenize};
pub use program::{
    BOOL_TYPE, CallFrame, FLOAT_TYPE, FuncId, Function, FunctionMode, INT_TYPE, Instr, NULL_TYPE,
    Opcode, PrimitiveKind, Program, STRING_TYPE, Sym, TYPE_TYPE, TypeId, TypeInfo, TypeKind, Value,
    VarId, Variable, VariableScope,
};
pub use vm::{NativeCall, NativeFunction, RunFlags, VirtualMachine};
