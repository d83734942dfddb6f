//! Compiler for blikk source code
//!
//! A single forward pass turns a [`TokenizedFile`] into typed stack-machine
//! IR appended to a [`Program`]. The same pass does lexical scoping, type
//! checking, overload resolution and record/array member resolution.
//!
//! Top-level `func`/`record`/`enum` declarations are order independent: a
//! preparse walks the prototype offsets recorded by the lexer and registers
//! every symbol before any body is parsed.
//!
//! Constant folding reuses the virtual machine: after emitting a pure
//! operator or call whose operands are all `Push`, the just-emitted tail is
//! executed by a [`Folder`] and replaced with a single `Push` on success.
//!
//! On any failure the whole compile is rolled back: a snapshot of every
//! program table is taken on entry and restored, so a failed compile leaves
//! the program image byte-identical.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::mem;

use tracing::debug;

use crate::error::{Diagnostic, DiagnosticSink};
use crate::lexer::{TokenKind, TokenValue, TokenizedFile, tokenize};
use crate::program::{
    ArrayType, BOOL_TYPE, EnumLabel, EnumType, FLOAT_TYPE, FuncId, Function, FunctionMode,
    FunctionType, INT_TYPE, Instr, MAX_AGGREGATE_SIZE, MAX_PARAMETERS, NULL_TYPE, Opcode,
    Parameter, PrimitiveKind, Program, RecordMember, RecordType, STRING_TYPE, SourceLine,
    SourceMap, Sym, TYPE_TYPE, TypeId, TypeInfo, TypeKind, Value, VarId, Variable, VariableScope,
};
use crate::vm::{Folder, NativeFunction};

/// Pending operators are bounded; deeper expressions are rejected.
const MAX_OPERATORS: usize = 128;

/// Parse recursion is bounded to guarantee termination on hostile input.
const MAX_RECURSION: i32 = 64;

/// Value-stack complexity bound while shunting one expression.
const MAX_EXPRESSION_SLOTS: usize = 64;

/// Outcome information for a failed (or incomplete) compile.
///
/// `unexpected_eof` distinguishes "this statement is not finished" from a
/// plain parse failure so a REPL host can offer a continuation line;
/// `depth` is the block depth at the failure point, letting the host indent
/// the continuation prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileReport {
    pub unexpected_eof: bool,
    pub depth: i32,
}

/// Registration flags for native functions. `pure` implies the call can be
/// folded at compile time; `no_side_effect` only allows dead-result
/// elimination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionFlags {
    pub pure: bool,
    pub no_side_effect: bool,
}

impl FunctionFlags {
    pub const PURE: FunctionFlags = FunctionFlags {
        pure: true,
        no_side_effect: true,
    };

    pub const NO_SIDE_EFFECT: FunctionFlags = FunctionFlags {
        pure: false,
        no_side_effect: true,
    };
}

/// Compiles source against a [`Program`], which is passed explicitly to
/// every operation so hosts can alternate compiling and running without
/// aliasing. The compiler itself only keeps the persistent global stack
/// offset, which must survive across REPL statements.
pub struct Compiler {
    var_offset: i64,
}

impl Compiler {
    /// Registers the base types as module constants, the special values
    /// `Version`/`NaN`/`Inf` and the intrinsic functions. The program must
    /// be freshly created.
    pub fn new(program: &mut Program) -> Compiler {
        assert!(
            program.ir.is_empty() && program.functions.is_empty(),
            "program already contains code"
        );

        let mut compiler = Compiler { var_offset: 0 };

        for id in [
            NULL_TYPE,
            BOOL_TYPE,
            INT_TYPE,
            FLOAT_TYPE,
            STRING_TYPE,
            TYPE_TYPE,
        ] {
            let name = program.signature(id).to_string();
            add_global(
                program,
                &mut compiler.var_offset,
                &name,
                TYPE_TYPE,
                &[Value::ty(id)],
                false,
                VariableScope::Module,
            );
        }

        let version = program.intern(env!("CARGO_PKG_VERSION"));
        add_global(
            program,
            &mut compiler.var_offset,
            "Version",
            STRING_TYPE,
            &[Value::sym(version)],
            false,
            VariableScope::Global,
        );
        add_global(
            program,
            &mut compiler.var_offset,
            "NaN",
            FLOAT_TYPE,
            &[Value::float(f64::NAN)],
            false,
            VariableScope::Global,
        );
        add_global(
            program,
            &mut compiler.var_offset,
            "Inf",
            FLOAT_TYPE,
            &[Value::float(f64::INFINITY)],
            false,
            VariableScope::Global,
        );

        compiler.register_function(program, "toFloat(Int): Float", FunctionFlags::PURE, None);
        compiler.register_function(program, "toFloat(Float): Float", FunctionFlags::PURE, None);
        compiler.register_function(program, "toInt(Int): Int", FunctionFlags::PURE, None);
        compiler.register_function(program, "toInt(Float): Int", FunctionFlags::PURE, None);
        compiler.register_function(program, "typeOf(...): Type", FunctionFlags::PURE, None);

        compiler
    }

    pub fn add_function(
        &mut self,
        program: &mut Program,
        prototype: &str,
        flags: FunctionFlags,
        native: NativeFunction,
    ) {
        self.register_function(program, prototype, flags, Some(native));
    }

    /// Install a module-scope constant or mutable global. `values` holds
    /// one [`Value`] per stack slot of `ty`.
    pub fn add_global(
        &mut self,
        program: &mut Program,
        name: &str,
        ty: TypeId,
        values: &[Value],
        mutable: bool,
    ) -> VarId {
        add_global(
            program,
            &mut self.var_offset,
            name,
            ty,
            values,
            mutable,
            VariableScope::Global,
        )
    }

    /// Register a host-defined opaque pointer type.
    pub fn add_opaque(&mut self, program: &mut Program, name: &str) -> TypeId {
        let signature = program.intern(name);
        let ty = program.insert_type(TypeInfo {
            signature,
            primitive: PrimitiveKind::Opaque,
            init0: true,
            size: 1,
            kind: TypeKind::Bare,
        });

        let var_id = add_global(
            program,
            &mut self.var_offset,
            name,
            TYPE_TYPE,
            &[Value::ty(ty)],
            false,
            VariableScope::Module,
        );
        debug_assert!(program.variable(var_id).shadow.is_none());

        ty
    }

    pub fn compile(
        &mut self,
        program: &mut Program,
        code: &str,
        filename: &str,
    ) -> Result<(), CompileReport> {
        let mut sink = DiagnosticSink::Default;
        let file = tokenize(code, filename, &mut sink).map_err(|_| CompileReport::default())?;

        self.compile_with(program, &file, &mut sink)
    }

    /// Compile pre-tokenized source, routing diagnostics through `sink`.
    /// On failure every append into the program image is undone.
    pub fn compile_with(
        &mut self,
        program: &mut Program,
        file: &TokenizedFile,
        sink: &mut DiagnosticSink<'_>,
    ) -> Result<(), CompileReport> {
        let snapshot = ProgramSnapshot::capture(program);
        let prev_var_offset = self.var_offset;

        let mut parser = Parser {
            program,
            file,
            sink,
            report: CompileReport::default(),
            preparse: false,
            pos: 0,
            prev_ir_len: 0,
            valid: true,
            show_errors: true,
            show_hints: false,
            cur_src: SrcTarget::Main(0),
            prototypes_map: HashMap::new(),
            definitions_map: HashMap::new(),
            poisoned_set: HashSet::new(),
            current_func: None,
            depth: 0,
            recursion: 0,
            var_offset: self.var_offset,
            loop_offset: -1,
            loop_break_addr: -1,
            loop_continue_addr: -1,
            stack: Vec::new(),
            folder: Folder::new(),
        };

        let ok = parser.parse();
        let report = parser.report;
        let var_offset = parser.var_offset;

        debug!(filename = %file.filename, ok, "compile finished");

        if ok {
            self.var_offset = var_offset;
            Ok(())
        } else {
            snapshot.restore(program);
            self.var_offset = prev_var_offset;
            Err(report)
        }
    }

    /// Undo the globals a failed REPL statement defined: drops variables
    /// past `variables_len` and rewinds the global stack offset to
    /// `stack_len` (the VM stack depth before the statement ran).
    pub fn rollback_globals(
        &mut self,
        program: &mut Program,
        variables_len: usize,
        stack_len: usize,
    ) {
        program.drop_variables(variables_len);
        self.var_offset = stack_len as i64;
    }

    // The validation of native prototypes is deliberately light: they come
    // from host code, not scripts. Don't pass in garbage!
    fn register_function(
        &mut self,
        program: &mut Program,
        prototype: &str,
        flags: FunctionFlags,
        native: Option<NativeFunction>,
    ) {
        let paren = prototype.find('(').expect("prototype must have a parameter list");
        let name_str = &prototype[..paren];
        let signature_str = format!("func {}", &prototype[paren..]);

        let func_id = FuncId(program.functions.len() as u32);
        let name = program.intern(name_str);
        let proto_sym = program.intern(prototype);
        let sig_sym = program.intern(&signature_str);

        // Reuse or create the function type
        let ty = match program.types_map.get(&sig_sym).copied() {
            Some(ty) => ty,
            None => {
                let close = prototype.rfind(')').expect("prototype must have a parameter list");
                let params_str = &prototype[paren + 1..close];

                let mut params = Vec::new();
                let mut params_size = 0;
                let mut variadic = false;
                if !params_str.trim().is_empty() {
                    for part in params_str.split(',') {
                        let part = part.trim();
                        if part == "..." {
                            variadic = true;
                        } else {
                            let ty = program
                                .find_type(part)
                                .expect("unknown type in native prototype");
                            params.push(ty);
                            params_size += program.ty(ty).size;
                        }
                    }
                }

                let ret = match prototype[close + 1..].strip_prefix(':') {
                    Some(r) => program
                        .find_type(r.trim())
                        .expect("unknown return type in native prototype"),
                    None => NULL_TYPE,
                };

                program.insert_type(TypeInfo {
                    signature: sig_sym,
                    primitive: PrimitiveKind::Function,
                    init0: false,
                    size: 1,
                    kind: TypeKind::Function(FunctionType {
                        params,
                        params_size,
                        variadic,
                        ret,
                    }),
                })
            }
        };

        let params: Vec<Parameter> = program
            .ty(ty)
            .as_function()
            .params
            .iter()
            .map(|&ty| Parameter {
                name: Sym(0),
                ty,
                mutable: false,
            })
            .collect();

        let mode = if native.is_some() {
            FunctionMode::Native
        } else {
            FunctionMode::Intrinsic
        };

        program.functions.push(Function {
            name,
            prototype: proto_sym,
            ty,
            params,
            mode,
            native,
            ir: Vec::new(),
            src: SourceMap::default(),
            tre: false,
            valid: true,
            impure: !flags.pure,
            side_effects: !(flags.pure || flags.no_side_effect),
            overload_prev: func_id,
            overload_next: func_id,
        });

        // Publish it
        match program.functions_map.get(&name).copied() {
            Some(head) => {
                let head_prev = program.func(head).overload_prev;
                program.func_mut(head_prev).overload_next = func_id;
                program.func_mut(func_id).overload_next = head;
                program.func_mut(func_id).overload_prev = head_prev;
                program.func_mut(head).overload_prev = func_id;

                #[cfg(debug_assertions)]
                {
                    let params: Vec<TypeId> = program.ty(ty).as_function().params.clone();
                    let mut it = head;
                    while it != func_id {
                        let other = program.ty(program.func(it).ty).as_function();
                        assert!(
                            other.variadic
                                || program.ty(ty).as_function().variadic
                                || other.params != params,
                            "duplicate overload in native registration"
                        );
                        it = program.func(it).overload_next;
                    }
                }
            }
            None => {
                program.functions_map.insert(name, func_id);
                add_global(
                    program,
                    &mut self.var_offset,
                    name_str,
                    ty,
                    &[Value::func(func_id)],
                    false,
                    VariableScope::Module,
                );
            }
        }
    }
}

/// Append a variable with preset values at module or global scope; the
/// values are pushed as IR so that running the program materializes them.
fn add_global(
    program: &mut Program,
    var_offset: &mut i64,
    name: &str,
    ty: TypeId,
    values: &[Value],
    mutable: bool,
    scope: VariableScope,
) -> VarId {
    let name_sym = program.intern(name);
    let var_id = VarId(program.variables.len() as u32);
    let primitive = program.ty(ty).primitive;

    let offset = *var_offset;
    *var_offset += values.len() as i64;

    for &value in values {
        program.ir.push(Instr::push(primitive, value));
    }
    let ready_addr = program.ir.len();

    let shadow = match program.variables_map.get(&name_sym).copied() {
        Some(prev) => Some(prev),
        None => {
            program.variables_map.insert(name_sym, var_id);
            None
        }
    };

    program.variables.push(Variable {
        name: name_sym,
        ty: Some(ty),
        mutable,
        constant: !mutable,
        scope,
        offset,
        ready_addr,
        shadow,
    });

    var_id
}

/// Lengths of every append-only container, captured at compile entry and
/// restored on failure. This is the sole rollback mechanism.
struct ProgramSnapshot {
    ir: usize,
    ro: usize,
    sources: usize,
    types: usize,
    functions: usize,
    variables: usize,
    strings: usize,
}

impl ProgramSnapshot {
    fn capture(program: &Program) -> ProgramSnapshot {
        ProgramSnapshot {
            ir: program.ir.len(),
            ro: program.ro.len(),
            sources: program.sources.len(),
            types: program.types.len(),
            functions: program.functions.len(),
            variables: program.variables.len(),
            strings: program.interner.len(),
        }
    }

    fn restore(&self, program: &mut Program) {
        program.ir.truncate(self.ir);
        program.ro.truncate(self.ro);
        program.sources.truncate(self.sources);

        program.drop_variables(self.variables);

        // Unlink rolled-back functions from their overload rings
        for i in (self.functions..program.functions.len()).rev() {
            let id = FuncId(i as u32);
            let name = program.functions[i].name;

            if let Some(&head) = program.functions_map.get(&name) {
                let next = program.functions[i].overload_next;
                let prev = program.functions[i].overload_prev;

                if head == id && next == id {
                    program.functions_map.remove(&name);
                } else {
                    if head == id {
                        program.functions_map.insert(name, next);
                    }
                    program.functions[next.index()].overload_prev = prev;
                    program.functions[prev.index()].overload_next = next;
                }
            }
        }
        program.functions.truncate(self.functions);

        for i in (self.types..program.types.len()).rev() {
            let signature = program.types[i].signature;
            if program.types_map.get(&signature) == Some(&TypeId(i as u32)) {
                program.types_map.remove(&signature);
            }
        }
        program.types.truncate(self.types);

        program.interner.truncate(self.strings);
    }
}

#[derive(Debug, Clone, Copy)]
struct PrototypeInfo {
    skip_pos: usize,
    func: Option<FuncId>,
}

#[derive(Debug, Clone, Copy)]
struct PendingOperator {
    kind: TokenKind,
    prec: i32,
    unary: bool,

    pos: usize,
    /// Skip instruction to patch, for short-circuit operators.
    branch_addr: usize,
}

#[derive(Debug, Clone, Copy)]
struct StackSlot {
    ty: TypeId,
    var: Option<VarId>,
    /// IR address of the `LoadIndirect` that produced this value, when the
    /// value was read through an address left on the machine stack.
    indirect_addr: Option<usize>,
    indirect_imbalance: usize,
}

impl StackSlot {
    fn of(ty: TypeId) -> StackSlot {
        StackSlot {
            ty,
            var: None,
            indirect_addr: None,
            indirect_imbalance: 0,
        }
    }
}

/// Keys for the definition-site map used by hints, and for poisoning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DefnKey {
    Var(VarId),
    Func(FuncId),
    Param(FuncId, u32),
    Member(TypeId, u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SrcTarget {
    Main(usize),
    Func(FuncId),
}

fn operator_precedence(kind: TokenKind, expect_unary: bool) -> i32 {
    if expect_unary {
        match kind {
            TokenKind::XorOrComplement | TokenKind::Plus | TokenKind::Minus => 13,
            TokenKind::Not => 4,
            _ => -1,
        }
    } else {
        match kind {
            TokenKind::Reassign
            | TokenKind::PlusAssign
            | TokenKind::MinusAssign
            | TokenKind::MultiplyAssign
            | TokenKind::DivideAssign
            | TokenKind::ModuloAssign
            | TokenKind::LeftShiftAssign
            | TokenKind::RightShiftAssign
            | TokenKind::LeftRotateAssign
            | TokenKind::RightRotateAssign
            | TokenKind::AndAssign
            | TokenKind::OrAssign
            | TokenKind::XorAssign => 0,

            TokenKind::OrOr => 2,
            TokenKind::AndAnd => 3,
            TokenKind::Equal | TokenKind::NotEqual => 5,
            TokenKind::Greater
            | TokenKind::GreaterOrEqual
            | TokenKind::Less
            | TokenKind::LessOrEqual => 6,
            TokenKind::Or => 7,
            TokenKind::XorOrComplement => 8,
            TokenKind::And => 9,
            TokenKind::LeftShift
            | TokenKind::RightShift
            | TokenKind::LeftRotate
            | TokenKind::RightRotate => 10,
            TokenKind::Plus | TokenKind::Minus => 11,
            TokenKind::Multiply | TokenKind::Divide | TokenKind::Modulo => 12,

            _ => -1,
        }
    }
}

// Case insensitive within ASCII, which is what the suggestion machinery
// wants for its "did you mean" hints.
fn levenshtein_distance(str1: &str, str2: &str) -> usize {
    let a: Vec<u8> = str1.bytes().map(|c| c.to_ascii_lowercase()).collect();
    let b: Vec<u8> = str2.bytes().map(|c| c.to_ascii_lowercase()).collect();
    let (a, b) = match a.len().cmp(&b.len()) {
        Ordering::Greater => (b, a),
        _ => (a, b),
    };

    let mut distances: Vec<usize> = (0..=a.len()).collect();

    for j in 1..=b.len() {
        let mut prev_diagonal = distances[0];
        distances[0] += 1;

        for i in 1..=a.len() {
            let prev_diagonal_save = distances[i];

            if a[i - 1] == b[j - 1] {
                distances[i] = prev_diagonal;
            } else {
                distances[i] = distances[i - 1].min(distances[i]).min(prev_diagonal) + 1;
            }

            prev_diagonal = prev_diagonal_save;
        }
    }

    distances[a.len()]
}

struct Parser<'a, 'b> {
    program: &'a mut Program,
    file: &'a TokenizedFile,
    sink: &'a mut DiagnosticSink<'b>,

    report: CompileReport,
    preparse: bool,
    pos: usize,
    prev_ir_len: usize,
    valid: bool,
    show_errors: bool,
    show_hints: bool,
    cur_src: SrcTarget,

    prototypes_map: HashMap<usize, PrototypeInfo>,
    definitions_map: HashMap<DefnKey, usize>,
    poisoned_set: HashSet<DefnKey>,

    current_func: Option<FuncId>,
    depth: i32,
    recursion: i32,

    var_offset: i64,
    loop_offset: i64,
    loop_break_addr: i64,
    loop_continue_addr: i64,

    // Only used (and valid) while parsing an expression
    stack: Vec<StackSlot>,
    folder: Folder,
}

impl Parser<'_, '_> {
    fn parse(&mut self) -> bool {
        self.valid = true;
        self.show_errors = true;
        self.show_hints = false;
        self.prev_ir_len = self.program.ir.len();

        let src_idx = self.program.sources.len();
        self.program.sources.push(SourceMap {
            filename: self.file.filename.clone(),
            lines: Vec::new(),
        });
        self.cur_src = SrcTarget::Main(src_idx);

        // Protect IR from before this parse step
        self.program.ir.push(Instr::op(Opcode::Nop));

        // Preparse the recorded prototype offsets so that top-level
        // functions, records and enums resolve regardless of textual order.
        self.preparse = true;
        let prototypes = self.file.prototypes.clone();
        for &proto_pos in &prototypes {
            self.pos = proto_pos + 1;
            self.show_errors = true;

            if !self.peek(TokenKind::Identifier) {
                continue;
            }

            match self.file.tokens[proto_pos].kind {
                TokenKind::Func => self.preparse_function(proto_pos, false),
                TokenKind::Record => self.preparse_function(proto_pos, true),
                TokenKind::Enum => self.preparse_enum(proto_pos),
                _ => unreachable!("prototype offset points at a non-prototype token"),
            }
        }
        self.pos = 0;
        self.preparse = false;

        let addr = self.program.ir.len();
        self.src_lines_push(SourceLine { addr, line: 0 });
        while self.pos < self.file.tokens.len() {
            self.parse_statement();
        }

        debug_assert_eq!(self.depth, 0);
        debug_assert_eq!(self.loop_offset, -1);
        debug_assert!(self.current_func.is_none());

        if self.valid {
            self.program.ir.push(Instr::imm(Opcode::End, self.var_offset));
        }

        self.valid
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    fn flag_error(&mut self) {
        self.valid = false;
        self.show_hints = self.show_errors;
        self.show_errors = false;

        if let Some(func) = self.current_func {
            self.program.func_mut(func).valid = false;
        }

        self.report.depth = self.depth;
    }

    fn mark_error(&mut self, pos: usize, message: String) {
        if self.show_errors {
            let tokens = &self.file.tokens;
            let offset = if pos < tokens.len() {
                tokens[pos].offset
            } else {
                self.file.code.len()
            };
            let line = tokens[pos.min(tokens.len() - 1)].line;

            self.sink.report(
                Some(&self.file.code),
                Diagnostic::error(&self.file.filename, line, offset, message),
            );
        }

        self.flag_error();
    }

    fn hint(&mut self, pos: Option<usize>, message: String) {
        if !self.show_hints {
            return;
        }

        match pos {
            Some(pos) => {
                let tokens = &self.file.tokens;
                let offset = if pos < tokens.len() {
                    tokens[pos].offset
                } else {
                    self.file.code.len()
                };
                let line = tokens[pos.min(tokens.len() - 1)].line;

                self.sink.report(
                    Some(&self.file.code),
                    Diagnostic::hint(&self.file.filename, line, offset, message),
                );
            }
            None => {
                self.sink.report(
                    Some(&self.file.code),
                    Diagnostic::bare(crate::error::DiagnosticKind::Hint, message),
                );
            }
        }
    }

    fn hint_definition(&mut self, key: DefnKey, message: String) {
        if let Some(&pos) = self.definitions_map.get(&key) {
            self.hint(Some(pos), message);
        }
    }

    fn hint_suggestions(&mut self, name: &str, candidates: Vec<(String, Option<usize>)>) {
        let threshold = name.len() / 2;
        let mut warn_case = false;

        for (candidate, pos) in candidates {
            let dist = levenshtein_distance(name, &candidate);

            if dist <= threshold {
                self.hint(pos, format!("Suggestion: {}", candidate));
                warn_case |= dist == 0;
            }
        }

        if warn_case {
            self.hint(
                None,
                "Identifiers are case-sensitive (e.g. foo and FOO are different)".to_string(),
            );
        }
    }

    fn variable_candidates(&self) -> Vec<(String, Option<usize>)> {
        self.program
            .variables
            .iter()
            .enumerate()
            .map(|(i, var)| {
                let pos = self.definitions_map.get(&DefnKey::Var(VarId(i as u32))).copied();
                (self.program.str_of(var.name).to_string(), pos)
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Preparse
    // ------------------------------------------------------------------

    fn preparse_function(&mut self, proto_pos: usize, record: bool) {
        let prev_ir_len = self.program.ir.len();
        let prev_lines_len = self.src_lines_len();

        let func_id = FuncId(self.program.functions.len() as u32);
        self.definitions_map.insert(DefnKey::Func(func_id), self.pos);

        let name = self.consume_identifier();
        let name_str = self.program.str_of(name).to_string();

        self.program.functions.push(Function {
            name,
            prototype: Sym(0),
            ty: NULL_TYPE,
            params: Vec::new(),
            mode: if record {
                FunctionMode::Record
            } else {
                FunctionMode::Script
            },
            native: None,
            ir: Vec::new(),
            src: SourceMap::default(),
            tre: false,
            valid: false,
            impure: true,
            side_effects: true,
            overload_prev: func_id,
            overload_next: func_id,
        });

        let mut signature = String::from("func (");
        let mut prototype = format!("{}(", name_str);
        let mut type_params: Vec<TypeId> = Vec::new();
        let mut params_size = 0usize;

        // Parameters
        self.consume_token(TokenKind::LeftParenthesis);
        if !self.match_token(TokenKind::RightParenthesis) {
            let variables_len = self.program.variables.len();

            loop {
                self.skip_new_lines();

                let param_pos = self.pos;
                let mutable = !record && self.match_token(TokenKind::Mut);
                let var_name = self.consume_identifier();

                let var_id = VarId(self.program.variables.len() as u32);
                let shadow = match self.program.variables_map.get(&var_name).copied() {
                    Some(prev) => Some(prev),
                    None => {
                        self.program.variables_map.insert(var_name, var_id);
                        None
                    }
                };
                self.program.variables.push(Variable {
                    name: var_name,
                    ty: None,
                    mutable,
                    constant: false,
                    scope: VariableScope::Local,
                    offset: 0,
                    ready_addr: 0,
                    shadow,
                });

                // Errors about hidden globals are issued in
                // parse_function(), because globals from this same compile
                // may not exist yet at this point.
                if let Some(prev) = shadow {
                    if self.program.variable(prev).scope == VariableScope::Local {
                        self.mark_error(
                            param_pos,
                            format!(
                                "Parameter named '{}' already exists",
                                self.program.str_of(var_name)
                            ),
                        );
                    }
                }

                self.consume_token(TokenKind::Colon);
                let ty = self.parse_type();
                self.program.variable_mut(var_id).ty = Some(ty);

                let params_len = self.program.func(func_id).params.len();
                if params_len < MAX_PARAMETERS {
                    self.program.func_mut(func_id).params.push(Parameter {
                        name: var_name,
                        ty,
                        mutable,
                    });
                    self.definitions_map
                        .insert(DefnKey::Param(func_id, params_len as u32), param_pos);

                    type_params.push(ty);
                    params_size += self.program.ty(ty).size;
                } else {
                    self.mark_error(
                        self.pos - 1,
                        format!("Functions cannot have more than {} parameters", MAX_PARAMETERS),
                    );
                }

                signature.push_str(self.program.signature(ty));
                prototype.push_str(&format!(
                    "{}: {}",
                    self.program.str_of(var_name),
                    self.program.signature(ty)
                ));

                if self.match_token(TokenKind::Comma) {
                    signature.push_str(", ");
                    prototype.push_str(", ");
                } else {
                    break;
                }
            }

            self.skip_new_lines();
            self.consume_token(TokenKind::RightParenthesis);
            self.destroy_variables(variables_len);
        }
        signature.push(')');
        prototype.push(')');

        // Return type
        let ret: TypeId;
        if record {
            let mut members: Vec<RecordMember> = Vec::new();
            let mut init0 = true;
            let mut size = 0usize;

            let params = self.program.func(func_id).params.clone();
            for param in &params {
                let (member_size, member_init0) = {
                    let info = self.program.ty(param.ty);
                    (info.size, info.init0)
                };

                members.push(RecordMember {
                    name: param.name,
                    ty: param.ty,
                    offset: size,
                });
                init0 &= member_init0;
                size += member_size;

                // Evaluate each time, so that overflow is not a problem
                if size as i64 > MAX_AGGREGATE_SIZE {
                    self.mark_error(proto_pos, "Record size is too big".to_string());
                }
            }

            let record_id = TypeId(self.program.types.len() as u32);
            for i in 0..params.len() {
                if let Some(&pos) = self.definitions_map.get(&DefnKey::Param(func_id, i as u32)) {
                    self.definitions_map.insert(DefnKey::Member(record_id, i as u32), pos);
                }
            }

            self.program.types.push(TypeInfo {
                signature: name,
                primitive: PrimitiveKind::Record,
                init0,
                size,
                kind: TypeKind::Record(RecordType {
                    members,
                    ctor: func_id,
                }),
            });
            self.program.types_map.entry(name).or_insert(record_id);

            ret = record_id;
            signature.push_str(&format!(": {}", name_str));
            prototype.push_str(&format!(": {}", name_str));
        } else if self.match_token(TokenKind::Colon) {
            ret = self.parse_type();

            if ret != NULL_TYPE {
                signature.push_str(&format!(": {}", self.program.signature(ret)));
                prototype.push_str(&format!(": {}", self.program.signature(ret)));
            }
        } else {
            ret = NULL_TYPE;
        }

        self.prototypes_map.insert(
            proto_pos,
            PrototypeInfo {
                skip_pos: self.pos,
                func: Some(func_id),
            },
        );

        // Reuse or add the function type
        let sig_sym = self.program.intern(&signature);
        let fty = self.program.insert_type(TypeInfo {
            signature: sig_sym,
            primitive: PrimitiveKind::Function,
            init0: false,
            size: 1,
            kind: TypeKind::Function(FunctionType {
                params: type_params,
                params_size,
                variadic: false,
                ret,
            }),
        });
        let proto_sym = self.program.intern(&prototype);
        {
            let func = self.program.func_mut(func_id);
            func.ty = fty;
            func.prototype = proto_sym;
        }

        // Publish the function
        match self.program.functions_map.get(&name).copied() {
            None => {
                self.program.functions_map.insert(name, func_id);
            }
            Some(head) if !record => {
                let head_prev = self.program.func(head).overload_prev;
                self.program.func_mut(head_prev).overload_next = func_id;
                self.program.func_mut(func_id).overload_next = head;
                self.program.func_mut(func_id).overload_prev = head_prev;
                self.program.func_mut(head).overload_prev = func_id;
            }
            Some(_) => {
                self.mark_error(proto_pos + 1, format!("Duplicate type '{}'", name_str));
            }
        }

        // This is a preparse step, clean up accidental side effects
        self.program.ir.truncate(prev_ir_len);
        self.src_lines_truncate(prev_lines_len);

        // Publish the symbol
        let var_id = if record {
            self.add_global_symbol(&name_str, TYPE_TYPE, &[Value::ty(ret)])
        } else {
            self.add_global_symbol(&name_str, fty, &[Value::func(func_id)])
        };
        self.definitions_map.insert(DefnKey::Var(var_id), proto_pos);

        // Expressions involving this prototype won't issue visible errors
        if !self.show_errors {
            self.poisoned_set.insert(DefnKey::Var(var_id));
        }
    }

    fn preparse_enum(&mut self, proto_pos: usize) {
        let prev_ir_len = self.program.ir.len();
        let prev_lines_len = self.src_lines_len();

        let name = self.consume_identifier();
        let name_str = self.program.str_of(name).to_string();

        let mut labels: Vec<EnumLabel> = Vec::new();
        let mut labels_map: HashMap<Sym, i64> = HashMap::new();

        self.consume_token(TokenKind::LeftParenthesis);
        if !self.match_token(TokenKind::RightParenthesis) {
            loop {
                self.skip_new_lines();

                let label = self.consume_identifier();
                let value = labels.len() as i64;
                labels.push(EnumLabel { name: label, value });

                if labels_map.insert(label, value).is_some() {
                    self.mark_error(
                        self.pos - 1,
                        format!("Label '{}' is already used", self.program.str_of(label)),
                    );
                }

                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }

            self.skip_new_lines();
            self.consume_token(TokenKind::RightParenthesis);
        } else {
            self.mark_error(self.pos - 1, "Empty enums are not allowed".to_string());
        }

        self.prototypes_map.insert(
            proto_pos,
            PrototypeInfo {
                skip_pos: self.pos,
                func: None,
            },
        );

        // This is a preparse step, clean up accidental side effects
        self.program.ir.truncate(prev_ir_len);
        self.src_lines_truncate(prev_lines_len);

        // Publish the enum
        let enum_id = TypeId(self.program.types.len() as u32);
        self.program.types.push(TypeInfo {
            signature: name,
            primitive: PrimitiveKind::Enum,
            init0: true,
            size: 1,
            kind: TypeKind::Enum(EnumType { labels, labels_map }),
        });
        if self.program.types_map.contains_key(&name) {
            self.mark_error(proto_pos + 1, format!("Duplicate type '{}'", name_str));
        } else {
            self.program.types_map.insert(name, enum_id);
        }

        let var_id = self.add_global_symbol(&name_str, TYPE_TYPE, &[Value::ty(enum_id)]);
        self.definitions_map.insert(DefnKey::Var(var_id), proto_pos);

        if !self.show_errors {
            self.poisoned_set.insert(DefnKey::Var(var_id));
        }
    }

    fn add_global_symbol(&mut self, name: &str, ty: TypeId, values: &[Value]) -> VarId {
        add_global(
            self.program,
            &mut self.var_offset,
            name,
            ty,
            values,
            false,
            VariableScope::Module,
        )
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    // These functions return true if (and only if) all code paths have a
    // return statement. Return statements inside loops don't count.
    fn parse_block(&mut self, end_with_else: bool) -> bool {
        self.show_errors = true;
        self.depth += 1;

        let recurse = self.recurse_inc();
        let prev_offset = self.var_offset;
        let variables_len = self.program.variables.len();

        let mut has_return = false;
        let mut issued_unreachable = false;

        while self.pos < self.file.tokens.len() {
            let kind = self.file.tokens[self.pos].kind;

            if kind == TokenKind::End {
                break;
            }
            if end_with_else && kind == TokenKind::Else {
                break;
            }

            if has_return && !issued_unreachable {
                self.mark_error(self.pos, "Unreachable statement".to_string());
                self.hint(None, "Code after return statement can never run".to_string());

                issued_unreachable = true;
            }

            if recurse {
                has_return |= self.parse_statement();
            } else {
                if !has_return {
                    self.mark_error(self.pos, "Excessive parsing depth (compiler limit)".to_string());
                    self.hint(None, "Simplify surrounding code".to_string());
                }

                self.pos += 1;
                has_return = true;
            }
        }

        self.recurse_dec();
        self.depth -= 1;

        self.emit_pop(self.var_offset - prev_offset);
        self.destroy_variables(variables_len);
        self.var_offset = prev_offset;

        has_return
    }

    fn parse_statement(&mut self) -> bool {
        let mut has_return = false;

        let addr = self.program.ir.len();
        let line = self.file.tokens[self.pos].line;
        self.src_lines_push(SourceLine { addr, line });
        self.show_errors = true;

        match self.file.tokens[self.pos].kind {
            TokenKind::EndOfLine => {
                self.pos += 1;
                self.src_lines_pop();
            }
            TokenKind::Semicolon => {
                self.pos += 1;
            }

            TokenKind::Begin => {
                self.pos += 1;

                if self.end_statement() {
                    has_return = self.parse_block(false);
                    self.consume_token(TokenKind::End);

                    self.end_statement();
                }
            }
            TokenKind::Func => {
                match self.prototypes_map.get(&self.pos).copied() {
                    Some(proto) => self.parse_function(proto),
                    None => {
                        let slot = self.parse_expression(false, true);
                        let size = self.program.ty(slot.ty).size;
                        self.discard_result(size);
                    }
                }

                self.end_statement();
            }
            TokenKind::Record => {
                if let Some(func) = self.current_func {
                    self.mark_error(self.pos, "Record types cannot be defined inside functions".to_string());
                    self.hint_definition(
                        DefnKey::Func(func),
                        "Function was started here and is still open".to_string(),
                    );
                } else if self.depth > 0 {
                    self.mark_error(self.pos, "Records must be defined in top-level scope".to_string());
                }

                match self.prototypes_map.get(&self.pos).copied() {
                    Some(proto) => self.pos = proto.skip_pos,
                    None => {
                        self.pos += 1;
                        self.consume_token(TokenKind::Identifier);
                        debug_assert!(!self.valid);
                    }
                }

                self.end_statement();
            }
            TokenKind::Enum => {
                if let Some(func) = self.current_func {
                    self.mark_error(self.pos, "Enum types cannot be defined inside functions".to_string());
                    self.hint_definition(
                        DefnKey::Func(func),
                        "Function was started here and is still open".to_string(),
                    );
                } else if self.depth > 0 {
                    self.mark_error(self.pos, "Enums must be defined in top-level scope".to_string());
                }

                match self.prototypes_map.get(&self.pos).copied() {
                    Some(proto) => self.pos = proto.skip_pos,
                    None => {
                        self.pos += 1;
                        self.consume_token(TokenKind::Identifier);
                        debug_assert!(!self.valid);
                    }
                }

                self.end_statement();
            }
            TokenKind::Return => {
                self.parse_return();
                has_return = true;
                self.end_statement();
            }
            TokenKind::Let => {
                self.parse_let();
                self.end_statement();
            }
            TokenKind::If => {
                has_return = self.parse_if();
                self.end_statement();
            }
            TokenKind::While => {
                self.parse_while();
                self.end_statement();
            }
            TokenKind::For => {
                self.parse_for();
                self.end_statement();
            }
            TokenKind::Break => {
                self.parse_break();
                self.end_statement();
            }
            TokenKind::Continue => {
                self.parse_continue();
                self.end_statement();
            }
            TokenKind::Pass => {
                self.pos += 1;
                self.end_statement();
            }

            _ => {
                let slot = self.parse_expression(false, true);
                let size = self.program.ty(slot.ty).size;
                self.discard_result(size);

                self.end_statement();
            }
        }

        has_return
    }

    fn parse_do(&mut self) -> bool {
        self.pos += 1;
        self.parse_do_arm()
    }

    fn parse_do_arm(&mut self) -> bool {
        if self.peek(TokenKind::Return) {
            self.parse_return();
            true
        } else if self.peek(TokenKind::Break) {
            self.parse_break();
            false
        } else if self.peek(TokenKind::Continue) {
            self.parse_continue();
            false
        } else if self.peek(TokenKind::Pass) {
            self.pos += 1;
            false
        } else {
            let slot = self.parse_expression(false, true);
            let size = self.program.ty(slot.ty).size;
            self.discard_result(size);

            false
        }
    }

    fn parse_function(&mut self, proto: PrototypeInfo) {
        self.pos += 1;
        let func_pos = self.pos;

        let func_id = proto.func.expect("function prototype without function");

        let prev_func = self.current_func;
        let prev_offset = self.var_offset;

        // Safety checks that could not be done in the preparse
        if let Some(func) = self.current_func {
            self.mark_error(func_pos, "Nested functions are not supported".to_string());
            self.hint_definition(
                DefnKey::Func(func),
                "Previous function was started here and is still open".to_string(),
            );
        } else if self.depth > 0 {
            self.mark_error(func_pos, "Functions must be defined in top-level scope".to_string());
        }
        self.current_func = Some(func_id);

        // Skip the prototype
        self.var_offset = 0;
        self.pos = proto.skip_pos;

        // Create parameter variables
        let params = self.program.func(func_id).params.clone();
        for (i, param) in params.iter().enumerate() {
            let param_pos = self
                .definitions_map
                .get(&DefnKey::Param(func_id, i as u32))
                .copied();

            let var_id = VarId(self.program.variables.len() as u32);
            if let Some(pos) = param_pos {
                self.definitions_map.insert(DefnKey::Var(var_id), pos);
            }

            let offset = self.var_offset;
            self.var_offset += self.program.ty(param.ty).size as i64;

            let shadow = match self.program.variables_map.get(&param.name).copied() {
                Some(prev) => Some(prev),
                None => {
                    self.program.variables_map.insert(param.name, var_id);
                    None
                }
            };
            self.program.variables.push(Variable {
                name: param.name,
                ty: Some(param.ty),
                mutable: param.mutable,
                constant: false,
                scope: VariableScope::Local,
                offset,
                ready_addr: 0,
                shadow,
            });

            if let Some(prev_id) = shadow {
                let prev = *self.program.variable(prev_id);
                let prev_primitive = prev.ty.map(|t| self.program.ty(t).primitive);
                let name_str = self.program.str_of(param.name).to_string();
                let pos = param_pos.unwrap_or(func_pos);

                // Duplicate parameter names were already reported during
                // the preparse.
                if prev.scope == VariableScope::Module
                    && prev_primitive == Some(PrimitiveKind::Function)
                {
                    self.mark_error(
                        pos,
                        format!("Parameter '{}' is not allowed to hide function", name_str),
                    );
                    self.hint_definition(
                        DefnKey::Var(prev_id),
                        format!("Function '{}' is defined here", name_str),
                    );
                } else if prev.scope == VariableScope::Global {
                    self.mark_error(
                        pos,
                        format!("Parameter '{}' is not allowed to hide global variable", name_str),
                    );
                    self.hint_definition(
                        DefnKey::Var(prev_id),
                        format!("Global variable '{}' is defined here", name_str),
                    );
                } else {
                    self.flag_error();
                }
            }

            if self.poisoned_set.contains(&DefnKey::Param(func_id, i as u32)) {
                self.poisoned_set.insert(DefnKey::Var(var_id));
            }
        }

        // Check for incompatible function overloads
        {
            let name = self.program.func(func_id).name;
            let param_types: Vec<TypeId> = params.iter().map(|p| p.ty).collect();
            let func_ret = self.program.ty(self.program.func(func_id).ty).as_function().ret;

            let mut overload = self.program.functions_map.get(&name).copied().unwrap_or(func_id);
            while overload != func_id {
                if self.test_overload(self.program.func(overload).ty, &param_types) {
                    let other_ret =
                        self.program.ty(self.program.func(overload).ty).as_function().ret;
                    let prototype =
                        self.program.str_of(self.program.func(func_id).prototype).to_string();

                    if other_ret == func_ret {
                        self.mark_error(
                            func_pos,
                            format!("Function '{}' is already defined", prototype),
                        );
                    } else {
                        let other =
                            self.program.str_of(self.program.func(overload).prototype).to_string();
                        self.mark_error(
                            func_pos,
                            format!(
                                "Function '{}' only differs from previously defined '{}' by return type",
                                prototype, other
                            ),
                        );
                    }
                    self.hint_definition(
                        DefnKey::Func(overload),
                        "Previous definition is here".to_string(),
                    );
                }

                overload = self.program.func(overload).overload_next;
            }
        }

        {
            let func = self.program.func_mut(func_id);
            func.valid = true;
            func.impure = false;
            func.side_effects = false;

            func.ir.push(Instr::op(Opcode::Nop));
        }

        // Emit into the function's own IR buffer and source map
        self.swap_function_ir(func_id);
        {
            let filename = self.src_filename().to_string();
            let line = if self.pos < self.file.tokens.len() {
                self.file.tokens[self.pos].line
            } else {
                0
            };

            let func = self.program.func_mut(func_id);
            func.src.filename = filename;
            func.src.lines.push(SourceLine { addr: 0, line });
        }
        let prev_src = self.cur_src;
        self.cur_src = SrcTarget::Func(func_id);

        // Function body
        let mut has_return = false;
        if self.peek(TokenKind::Do) {
            has_return = self.parse_do();
        } else if self.peek(TokenKind::EndOfLine) || self.peek(TokenKind::Semicolon) {
            if self.end_statement() {
                has_return = self.parse_block(false);
                self.consume_token(TokenKind::End);
            }
        } else {
            // Inline body on the prototype line
            has_return = self.parse_block(false);
            self.consume_token(TokenKind::End);
        }

        if !has_return {
            let ret = self.program.ty(self.program.func(func_id).ty).as_function().ret;

            if ret == NULL_TYPE {
                self.emit_return(0);
            } else {
                let name = self.program.str_of(self.program.func(func_id).name).to_string();
                self.mark_error(
                    func_pos,
                    format!("Some code paths do not return a value in function '{}'", name),
                );
            }
        }

        self.swap_function_ir(func_id);
        self.cur_src = prev_src;

        // Destroying the trailing variables destroys the parameters; body
        // variables are already gone with their block.
        let first = self.program.variables.len() - params.len();
        self.destroy_variables(first);
        self.var_offset = prev_offset;
        self.current_func = prev_func;
    }

    fn swap_function_ir(&mut self, func_id: FuncId) {
        let program = &mut *self.program;
        let (ir, functions) = (&mut program.ir, &mut program.functions);
        mem::swap(ir, &mut functions[func_id.index()].ir);
    }

    fn parse_return(&mut self) {
        self.pos += 1;
        let return_pos = self.pos;

        let Some(func_id) = self.current_func else {
            self.mark_error(self.pos - 1, "Return statement cannot be used outside function".to_string());
            return;
        };

        let slot = if self.peek(TokenKind::EndOfLine) || self.peek(TokenKind::Semicolon) {
            StackSlot::of(NULL_TYPE)
        } else {
            self.parse_expression(false, true)
        };

        let ret = self.program.ty(self.program.func(func_id).ty).as_function().ret;
        if slot.ty != ret {
            self.mark_error(
                return_pos,
                format!(
                    "Cannot return '{}' value in function defined to return '{}'",
                    self.program.signature(slot.ty),
                    self.program.signature(ret)
                ),
            );
            return;
        }

        let size = self.program.ty(slot.ty).size;
        self.emit_return(size);
    }

    fn parse_let(&mut self) {
        self.pos += 1;
        let mut var_pos = self.pos;

        let mutable = self.match_token(TokenKind::Mut);
        var_pos += mutable as usize;

        let var_id = VarId(self.program.variables.len() as u32);
        self.definitions_map.insert(DefnKey::Var(var_id), self.pos);
        let name = self.consume_identifier();

        let shadow = match self.program.variables_map.get(&name).copied() {
            Some(prev) => Some(prev),
            None => {
                self.program.variables_map.insert(name, var_id);
                None
            }
        };
        self.program.variables.push(Variable {
            name,
            ty: None,
            mutable,
            constant: false,
            scope: VariableScope::Local,
            offset: 0,
            ready_addr: 0,
            shadow,
        });

        if let Some(prev_id) = shadow {
            let prev = *self.program.variable(prev_id);
            let prev_primitive = prev.ty.map(|t| self.program.ty(t).primitive);
            let name_str = self.program.str_of(name).to_string();

            if prev.scope == VariableScope::Module
                && prev_primitive == Some(PrimitiveKind::Function)
            {
                self.mark_error(
                    var_pos,
                    format!("Declaration '{}' is not allowed to hide function", name_str),
                );
                self.hint_definition(
                    DefnKey::Var(prev_id),
                    format!("Function '{}' is defined here", name_str),
                );
            } else if self.current_func.is_some() && prev.scope == VariableScope::Global {
                self.mark_error(
                    var_pos,
                    format!("Declaration '{}' is not allowed to hide global variable", name_str),
                );
                self.hint_definition(
                    DefnKey::Var(prev_id),
                    format!("Global variable '{}' is defined here", name_str),
                );
            } else {
                self.mark_error(var_pos, format!("Variable '{}' already exists", name_str));
                self.hint_definition(
                    DefnKey::Var(prev_id),
                    format!("Previous variable '{}' is defined here", name_str),
                );
            }
        }

        let slot;
        if self.match_token(TokenKind::Assign) {
            self.skip_new_lines();
            slot = self.parse_expression(false, true);
        } else {
            self.consume_token(TokenKind::Colon);

            // The variable's type is not assigned yet, so the expression
            // cannot use it before it is defined.
            let ty = self.parse_type();

            if self.match_token(TokenKind::Assign) {
                self.skip_new_lines();

                let expr_pos = self.pos;
                slot = self.parse_expression(false, true);

                if slot.ty != ty {
                    self.mark_error(
                        expr_pos - 1,
                        format!(
                            "Cannot assign '{}' value to variable '{}' (defined as '{}')",
                            self.program.signature(slot.ty),
                            self.program.str_of(name),
                            self.program.signature(ty)
                        ),
                    );
                }
            } else {
                if !self.program.ty(ty).init0 {
                    self.mark_error(
                        var_pos,
                        format!(
                            "Variable '{}' (defined as '{}') must be explicitly initialized",
                            self.program.str_of(name),
                            self.program.signature(ty)
                        ),
                    );
                }

                let size = self.program.ty(ty).size;
                self.program.ir.push(Instr::imm(Opcode::PushZero, size as i64));
                slot = StackSlot::of(ty);

                self.program.variable_mut(var_id).constant = true;
            }
        }

        let slot_size = self.program.ty(slot.ty).size;
        if !self.program.variable(var_id).constant {
            let constant = if slot_size == 1 {
                self.last_is_push()
            } else if slot_size > 0 {
                self.copy_big_constant(slot_size)
            } else {
                true
            };
            self.program.variable_mut(var_id).constant = constant;
        }

        self.program.variable_mut(var_id).ty = Some(slot.ty);

        let alias = slot.var.filter(|&src_id| {
            let src = self.program.variable(src_id);
            !src.mutable && slot.indirect_addr.is_none() && !mutable
        });

        if let Some(src_id) = alias {
            // The new variable aliases slot.var, so drop the load
            // instructions entirely.
            let trim = slot_size.min(2);
            self.trim_instructions(trim);

            let src = *self.program.variable(src_id);
            let var = self.program.variable_mut(var_id);
            var.scope = src.scope;
            var.ready_addr = src.ready_addr;
            var.offset = src.offset;
        } else {
            let scope = if self.current_func.is_some() {
                VariableScope::Local
            } else {
                VariableScope::Global
            };
            let ready_addr = self.program.ir.len();
            let offset = self.var_offset;
            self.var_offset += slot_size as i64;

            let var = self.program.variable_mut(var_id);
            var.scope = scope;
            var.ready_addr = ready_addr;
            var.offset = offset;
        }

        // Expressions involving this variable won't issue visible errors
        // and will be marked as invalid too.
        if !self.show_errors {
            self.poisoned_set.insert(DefnKey::Var(var_id));
        }
    }

    // ------------------------------------------------------------------
    // Control flow
    // ------------------------------------------------------------------

    fn parse_if(&mut self) -> bool {
        self.pos += 1;

        self.parse_expression_of_type(BOOL_TYPE);

        // When the condition folds to a constant only the chosen branch is
        // kept; inactive arms are still parsed but their IR is trimmed.
        let mut fold = self.last_is_push();
        let mut fold_test = fold && self.program.ir.last().unwrap().u.as_bool();
        let mut fold_skip = fold && fold_test;
        if fold {
            self.trim_instructions(1);
        }

        let mut branch_addr = self.program.ir.len();
        if !fold {
            self.program.ir.push(Instr::imm(Opcode::BranchIfFalse, 0));
        }

        let mut has_return = true;
        let mut is_exhaustive = false;

        let do_form = self.peek(TokenKind::Do);
        let mut arm_parsed = true;
        if do_form {
            has_return &= self.parse_do();
        } else if self.end_statement() {
            has_return &= self.parse_block(true);
        } else {
            arm_parsed = false;
        }

        if arm_parsed {
            if self.match_token(TokenKind::Else) {
                let mut jump_addr: i64;
                if fold && !fold_test {
                    let trim = self.program.ir.len() - branch_addr;
                    self.trim_instructions(trim);
                    jump_addr = -1;
                } else if !fold {
                    jump_addr = self.program.ir.len() as i64;
                    self.program.ir.push(Instr::imm(Opcode::Jump, -1));
                } else {
                    jump_addr = -1;
                }

                loop {
                    if !fold {
                        let len = self.program.ir.len() as i64;
                        self.program.ir[branch_addr].u = Value::int(len - branch_addr as i64);
                    }

                    if self.match_token(TokenKind::If) {
                        let test_addr = self.program.ir.len();
                        self.parse_expression_of_type(BOOL_TYPE);

                        fold = fold_skip || self.last_is_push();
                        fold_test =
                            fold && !fold_skip && self.program.ir.last().unwrap().u.as_bool();
                        if fold {
                            let trim = self.program.ir.len() - test_addr;
                            self.trim_instructions(trim);
                        }

                        let arm_do = self.peek(TokenKind::Do);
                        if arm_do || self.end_statement() {
                            branch_addr = self.program.ir.len();
                            if !fold {
                                self.program.ir.push(Instr::imm(Opcode::BranchIfFalse, 0));
                            }

                            let block_return = if arm_do {
                                self.parse_do()
                            } else {
                                self.parse_block(true)
                            };

                            if fold {
                                if fold_test {
                                    has_return = block_return;
                                    is_exhaustive = true;
                                } else {
                                    let trim = self.program.ir.len() - branch_addr;
                                    self.trim_instructions(trim);
                                }
                            } else {
                                has_return &= block_return;

                                self.program.ir.push(Instr::imm(Opcode::Jump, jump_addr));
                                jump_addr = self.program.ir.len() as i64 - 1;
                            }
                            fold_skip |= fold && fold_test;
                        }
                    } else {
                        let else_addr = self.program.ir.len();

                        let block_return = if self.peek(TokenKind::Do) {
                            self.parse_do()
                        } else if self.peek(TokenKind::EndOfLine) || self.peek(TokenKind::Semicolon)
                        {
                            if self.end_statement() {
                                self.parse_block(false)
                            } else {
                                false
                            }
                        } else {
                            self.parse_do_arm()
                        };

                        if fold && !fold_skip {
                            has_return = block_return;
                        } else if !fold {
                            has_return &= block_return;
                        }
                        is_exhaustive = true;

                        if fold_skip {
                            let trim = self.program.ir.len() - else_addr;
                            self.trim_instructions(trim);
                        }

                        break;
                    }

                    if !self.match_token(TokenKind::Else) {
                        break;
                    }
                }

                let target = self.program.ir.len();
                self.fix_jumps(jump_addr, target);
                self.consume_token(TokenKind::End);
            } else {
                if fold {
                    if fold_test {
                        is_exhaustive = true;
                    } else {
                        let trim = self.program.ir.len() - branch_addr;
                        self.trim_instructions(trim);
                    }
                } else {
                    let len = self.program.ir.len() as i64;
                    self.program.ir[branch_addr].u = Value::int(len - branch_addr as i64);
                }

                if !do_form {
                    self.consume_token(TokenKind::End);
                }
            }
        }

        has_return && is_exhaustive
    }

    fn parse_while(&mut self) {
        self.pos += 1;

        // The condition is copied after the loop body so that the IR looks
        // roughly like if (cond) { do { ... } while (cond) }.
        let condition_addr = self.program.ir.len();
        let condition_line_idx = self.src_lines_len();
        self.parse_expression_of_type(BOOL_TYPE);

        let fold = self.last_is_push();
        let fold_test = fold && self.program.ir.last().unwrap().u.as_bool();
        if fold {
            self.trim_instructions(1);
        }

        let branch_addr = self.program.ir.len();
        if !fold {
            self.program.ir.push(Instr::imm(Opcode::BranchIfFalse, 0));
        }

        // Break and continue apply to this loop from here on
        let prev_loop = (self.loop_offset, self.loop_break_addr, self.loop_continue_addr);
        self.loop_offset = self.var_offset;
        self.loop_break_addr = -1;
        self.loop_continue_addr = -1;

        if self.peek(TokenKind::Do) {
            self.parse_do();
            self.match_token(TokenKind::End);
        } else if self.end_statement() {
            self.parse_block(false);
            self.consume_token(TokenKind::End);
        }

        if fold {
            if fold_test {
                let cont = self.loop_continue_addr;
                self.fix_jumps(cont, branch_addr);

                let len = self.program.ir.len() as i64;
                self.program.ir.push(Instr::imm(Opcode::Jump, branch_addr as i64 - len));

                let brk = self.loop_break_addr;
                let target = self.program.ir.len();
                self.fix_jumps(brk, target);
            } else {
                let trim = self.program.ir.len() - branch_addr;
                self.trim_instructions(trim);
            }
        } else {
            let cont = self.loop_continue_addr;
            let target = self.program.ir.len();
            self.fix_jumps(cont, target);

            // Copy the condition expression along with its line map
            let base = self.program.ir.len();
            let copies: Vec<SourceLine> = {
                let lines = self.src_lines();
                let start = condition_line_idx.min(lines.len());
                lines[start..]
                    .iter()
                    .take_while(|l| l.addr < branch_addr)
                    .map(|l| SourceLine {
                        addr: base + (l.addr - condition_addr),
                        line: l.line,
                    })
                    .collect()
            };
            for line in copies {
                self.src_lines_push(line);
            }

            let cond_ir: Vec<Instr> = self.program.ir[condition_addr..branch_addr].to_vec();
            self.program.ir.extend(cond_ir);

            let len = self.program.ir.len() as i64;
            self.program.ir.push(Instr::imm(Opcode::BranchIfTrue, branch_addr as i64 - len + 1));
            let len = self.program.ir.len() as i64;
            self.program.ir[branch_addr].u = Value::int(len - branch_addr as i64);

            let brk = self.loop_break_addr;
            let target = self.program.ir.len();
            self.fix_jumps(brk, target);
        }

        (self.loop_offset, self.loop_break_addr, self.loop_continue_addr) = prev_loop;
    }

    fn parse_for(&mut self) {
        self.pos += 1;
        let mut for_pos = self.pos;

        let mutable = self.match_token(TokenKind::Mut);
        for_pos += mutable as usize;

        let it_id = VarId(self.program.variables.len() as u32);
        self.definitions_map.insert(DefnKey::Var(it_id), self.pos);
        let name = self.consume_identifier();

        let shadow = match self.program.variables_map.get(&name).copied() {
            Some(prev) => Some(prev),
            None => {
                self.program.variables_map.insert(name, it_id);
                None
            }
        };
        self.program.variables.push(Variable {
            name,
            ty: None,
            mutable,
            constant: false,
            scope: VariableScope::Local,
            offset: 0,
            ready_addr: 0,
            shadow,
        });

        if let Some(prev_id) = shadow {
            let prev = *self.program.variable(prev_id);
            let prev_primitive = prev.ty.map(|t| self.program.ty(t).primitive);
            let name_str = self.program.str_of(name).to_string();

            if prev.scope == VariableScope::Module
                && prev_primitive == Some(PrimitiveKind::Function)
            {
                self.mark_error(
                    for_pos,
                    format!("Iterator '{}' is not allowed to hide function", name_str),
                );
                self.hint_definition(
                    DefnKey::Var(prev_id),
                    format!("Function '{}' is defined here", name_str),
                );
            } else if self.current_func.is_some() && prev.scope == VariableScope::Global {
                self.mark_error(
                    for_pos,
                    format!("Iterator '{}' is not allowed to hide global variable", name_str),
                );
                self.hint_definition(
                    DefnKey::Var(prev_id),
                    format!("Global variable '{}' is defined here", name_str),
                );
            } else {
                self.mark_error(for_pos, format!("Variable '{}' already exists", name_str));
                self.hint_definition(
                    DefnKey::Var(prev_id),
                    format!("Previous variable '{}' is defined here", name_str),
                );
            }

            return;
        }

        self.consume_token(TokenKind::In);
        self.parse_expression_of_type(INT_TYPE);
        self.consume_token(TokenKind::Colon);
        self.parse_expression_of_type(INT_TYPE);

        // The range (half-open) stays on the stack in two hidden slots,
        // with the iterator value in a third
        let offset = self.var_offset + 2;
        self.program.variable_mut(it_id).offset = offset;
        self.var_offset += 3;

        self.program.ir.push(Instr::imm(Opcode::LoadLocal, offset - 2));
        self.program.variable_mut(it_id).ty = Some(INT_TYPE);

        let body_addr = self.program.ir.len();

        self.program.ir.push(Instr::imm(Opcode::LoadLocal, offset));
        self.program.ir.push(Instr::imm(Opcode::LoadLocal, offset - 1));
        self.program.ir.push(Instr::op(Opcode::LessThanInt));
        self.program.ir.push(Instr::imm(Opcode::BranchIfFalse, 0));

        let prev_loop = (self.loop_offset, self.loop_break_addr, self.loop_continue_addr);
        self.loop_offset = self.var_offset;
        self.loop_break_addr = -1;
        self.loop_continue_addr = -1;

        if self.peek(TokenKind::Do) {
            self.parse_do();
            self.match_token(TokenKind::End);
        } else if self.end_statement() {
            self.parse_block(false);
            self.consume_token(TokenKind::End);
        }

        if self.program.ir.len() > body_addr + 4 {
            let cont = self.loop_continue_addr;
            let target = self.program.ir.len();
            self.fix_jumps(cont, target);

            self.program.ir.push(Instr::push(PrimitiveKind::Int, Value::int(1)));
            self.program.ir.push(Instr::op(Opcode::AddInt));
            let len = self.program.ir.len() as i64;
            self.program.ir.push(Instr::imm(Opcode::Jump, body_addr as i64 - len));
            let len = self.program.ir.len() as i64;
            self.program.ir[body_addr + 3].u = Value::int(len - (body_addr as i64 + 3));

            let brk = self.loop_break_addr;
            let target = self.program.ir.len();
            self.fix_jumps(brk, target);
            self.emit_pop(3);
        } else {
            let trim = self.program.ir.len() - body_addr + 1;
            self.trim_instructions(trim);
            self.discard_result(2);
        }

        (self.loop_offset, self.loop_break_addr, self.loop_continue_addr) = prev_loop;

        // Destroy the iterator and range values
        let first = self.program.variables.len() - 1;
        self.destroy_variables(first);
        self.var_offset -= 3;
    }

    fn parse_break(&mut self) {
        let break_pos = self.pos;
        self.pos += 1;

        if self.loop_offset < 0 {
            self.mark_error(break_pos, "Break statement outside of loop".to_string());
            return;
        }

        self.emit_pop(self.var_offset - self.loop_offset);

        // Pending break jumps form a linked list through their operands
        let next = self.loop_break_addr;
        self.program.ir.push(Instr::imm(Opcode::Jump, next));
        self.loop_break_addr = self.program.ir.len() as i64 - 1;
    }

    fn parse_continue(&mut self) {
        let continue_pos = self.pos;
        self.pos += 1;

        if self.loop_offset < 0 {
            self.mark_error(continue_pos, "Continue statement outside of loop".to_string());
            return;
        }

        self.emit_pop(self.var_offset - self.loop_offset);

        let next = self.loop_continue_addr;
        self.program.ir.push(Instr::imm(Opcode::Jump, next));
        self.loop_continue_addr = self.program.ir.len() as i64 - 1;
    }

    fn fix_jumps(&mut self, jump_addr: i64, target_addr: usize) {
        let mut addr = jump_addr;
        while addr >= 0 {
            let next = self.program.ir[addr as usize].u.as_int();
            self.program.ir[addr as usize].u = Value::int(target_addr as i64 - addr);
            addr = next;
        }
    }

    fn emit_pop(&mut self, count: i64) {
        debug_assert!(count >= 0 || !self.valid);

        if count > 0 {
            self.program.ir.push(Instr::imm(Opcode::Pop, count));
        }
    }

    fn emit_return(&mut self, size: usize) {
        let func_id = self.current_func.expect("return outside function");

        // Tail recursion elimination: a direct self-call right before the
        // return becomes an argument copy and a jump back to the start.
        let last = self.program.ir.last().copied();
        let self_call = last
            .is_some_and(|i| i.code == Opcode::Call && i.u.as_func() == func_id);

        if self_call {
            self.program.ir.pop();

            let params_size = self.program.ty(self.program.func(func_id).ty).as_function().params_size;
            match params_size {
                0 => {}
                1 => {
                    self.program.ir.push(Instr::imm(Opcode::StoreLocal, 0));
                }
                _ => {
                    self.program.ir.push(Instr::imm(Opcode::LeaLocal, 0));
                    self.program.ir.push(Instr::imm(Opcode::StoreRev, params_size as i64));
                }
            }
            self.emit_pop(self.var_offset - params_size as i64);
            let len = self.program.ir.len() as i64;
            self.program.ir.push(Instr::imm(Opcode::Jump, -len));

            self.program.func_mut(func_id).tre = true;
        } else {
            self.program.ir.push(Instr::imm(Opcode::Return, size as i64));
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_expression_of_type(&mut self, expected: TypeId) -> bool {
        let expr_pos = self.pos;

        let ty = self.parse_expression(false, true).ty;
        if ty != expected {
            self.mark_error(
                expr_pos,
                format!(
                    "Expected expression result type to be '{}', not '{}'",
                    self.program.signature(expected),
                    self.program.signature(ty)
                ),
            );
            return false;
        }

        true
    }

    fn parse_expression(&mut self, stop_at_operator: bool, tolerate_assign: bool) -> StackSlot {
        let start_len = self.stack.len();

        let result = if self.recurse_inc() {
            self.parse_expression_inner(stop_at_operator, tolerate_assign)
        } else {
            self.mark_error(self.pos, "Excessive parsing depth (compiler limit)".to_string());
            self.hint(None, "Simplify surrounding code".to_string());
            Err(0)
        };
        self.recurse_dec();

        let slot = match result {
            Ok(slot) => slot,
            Err(parentheses) => {
                self.skip_expression(parentheses);
                StackSlot::of(NULL_TYPE)
            }
        };
        self.stack.truncate(start_len);

        slot
    }

    // Skip ahead to the next do, end of line, semicolon or unbalanced ')'
    // so the statement parser can re-synchronize after an error.
    fn skip_expression(&mut self, mut parentheses: i64) {
        while self.pos < self.file.tokens.len() {
            match self.file.tokens[self.pos].kind {
                TokenKind::Do | TokenKind::EndOfLine | TokenKind::Semicolon => break,
                TokenKind::LeftParenthesis => parentheses += 1,
                TokenKind::RightParenthesis => {
                    parentheses -= 1;
                    if parentheses < 0 {
                        break;
                    }
                }
                _ => {}
            }

            self.pos += 1;
        }
    }

    fn unexpected(&mut self, expect_value: bool, parentheses: i64) -> Result<StackSlot, i64> {
        self.pos -= 1;

        let expected = if expect_value {
            "value or '('"
        } else if parentheses > 0 {
            "operator or ')'"
        } else {
            "operator or end of expression"
        };

        self.mark_error(
            self.pos,
            format!(
                "Unexpected token '{}', expected {}",
                self.file.tokens[self.pos].kind.name(),
                expected
            ),
        );

        Err(parentheses)
    }

    fn parse_expression_inner(
        &mut self,
        stop_at_operator: bool,
        tolerate_assign: bool,
    ) -> Result<StackSlot, i64> {
        let start_len = self.stack.len();

        // Safety dummy
        self.stack.push(StackSlot::of(NULL_TYPE));

        let mut operators: Vec<PendingOperator> = Vec::new();
        let mut expect_value = true;
        let mut parentheses: i64 = 0;

        // Used to detect empty expressions
        let prev_offset = self.pos;

        'tokens: while self.pos < self.file.tokens.len() {
            let tok = self.file.tokens[self.pos].clone();
            self.pos += 1;

            match tok.kind {
                TokenKind::LeftParenthesis => {
                    if !expect_value {
                        let top_ty = self.stack.last().unwrap().ty;

                        if self.program.ty(top_ty).primitive == PrimitiveKind::Function {
                            if !self.parse_call(top_ty, None, false) {
                                return Err(parentheses);
                            }
                        } else {
                            return self.unexpected(expect_value, parentheses);
                        }
                    } else {
                        if operators.len() >= MAX_OPERATORS {
                            self.mark_error(
                                self.pos - 1,
                                "Too many operators on the stack (compiler limitation)".to_string(),
                            );
                            return Err(parentheses);
                        }

                        operators.push(PendingOperator {
                            kind: tok.kind,
                            prec: 0,
                            unary: false,
                            pos: self.pos - 1,
                            branch_addr: 0,
                        });
                        parentheses += 1;
                    }
                }
                TokenKind::RightParenthesis => {
                    if expect_value {
                        return self.unexpected(expect_value, parentheses);
                    }
                    expect_value = false;

                    if parentheses == 0 {
                        if self.pos == prev_offset + 1 {
                            self.mark_error(
                                self.pos - 1,
                                "Unexpected token ')', expected value or expression".to_string(),
                            );
                            return Err(parentheses);
                        }

                        self.pos -= 1;
                        break 'tokens;
                    }

                    loop {
                        let op = *operators.last().unwrap();
                        if op.kind == TokenKind::LeftParenthesis {
                            operators.pop();
                            parentheses -= 1;
                            break;
                        }

                        self.produce_operator(op);
                        operators.pop();
                    }
                }

                TokenKind::Null => {
                    if !expect_value {
                        return self.unexpected(expect_value, parentheses);
                    }
                    expect_value = false;

                    self.stack.push(StackSlot::of(NULL_TYPE));
                }
                TokenKind::Bool => {
                    if !expect_value {
                        return self.unexpected(expect_value, parentheses);
                    }
                    expect_value = false;

                    let TokenValue::Bool(b) = tok.value else { unreachable!() };
                    self.program.ir.push(Instr::push(PrimitiveKind::Bool, Value::bool(b)));
                    self.stack.push(StackSlot::of(BOOL_TYPE));
                }
                TokenKind::Integer => {
                    if !expect_value {
                        return self.unexpected(expect_value, parentheses);
                    }
                    expect_value = false;

                    let TokenValue::Int(i) = tok.value else { unreachable!() };
                    self.program.ir.push(Instr::push(PrimitiveKind::Int, Value::int(i)));
                    self.stack.push(StackSlot::of(INT_TYPE));
                }
                TokenKind::Float => {
                    if !expect_value {
                        return self.unexpected(expect_value, parentheses);
                    }
                    expect_value = false;

                    let TokenValue::Float(d) = tok.value else { unreachable!() };
                    self.program.ir.push(Instr::push(PrimitiveKind::Float, Value::float(d)));
                    self.stack.push(StackSlot::of(FLOAT_TYPE));
                }
                TokenKind::String => {
                    if !expect_value {
                        return self.unexpected(expect_value, parentheses);
                    }
                    expect_value = false;

                    let sym = self.program.intern(tok.str_value());
                    self.program.ir.push(Instr::push(PrimitiveKind::String, Value::sym(sym)));
                    self.stack.push(StackSlot::of(STRING_TYPE));
                }

                TokenKind::Func => {
                    if !expect_value {
                        return self.unexpected(expect_value, parentheses);
                    }
                    expect_value = false;

                    let ty = self.parse_function_type();

                    self.program.ir.push(Instr::push(PrimitiveKind::Type, Value::ty(ty)));
                    self.stack.push(StackSlot::of(TYPE_TYPE));
                }

                TokenKind::LeftBracket => {
                    if expect_value {
                        expect_value = false;

                        self.parse_bracket_value();
                    } else if self.program.ty(self.stack.last().unwrap().ty).primitive
                        == PrimitiveKind::Array
                    {
                        self.parse_array_subscript();
                    } else {
                        self.mark_error(self.pos - 1, "Cannot subset non-array expression".to_string());
                        return Err(parentheses);
                    }
                }

                TokenKind::Dot => {
                    if expect_value {
                        return self.unexpected(expect_value, parentheses);
                    }

                    let top_ty = self.stack.last().unwrap().ty;
                    let primitive = self.program.ty(top_ty).primitive;

                    if primitive == PrimitiveKind::Record {
                        self.parse_record_dot();
                    } else if primitive == PrimitiveKind::Type
                        && self.last_is_push()
                        && self
                            .program
                            .ty(self.program.ir.last().unwrap().u.as_type())
                            .primitive
                            == PrimitiveKind::Enum
                    {
                        self.parse_enum_dot();
                    } else {
                        self.mark_error(
                            self.pos - 1,
                            format!(
                                "Cannot use dot operator on value of type '{}'",
                                self.program.signature(top_ty)
                            ),
                        );
                        return Err(parentheses);
                    }
                }

                TokenKind::Identifier => {
                    if !expect_value {
                        return self.unexpected(expect_value, parentheses);
                    }
                    expect_value = false;

                    if !self.parse_identifier(&tok) {
                        return Err(parentheses);
                    }
                }

                _ => {
                    let mut op = PendingOperator {
                        kind: tok.kind,
                        prec: operator_precedence(tok.kind, expect_value),
                        unary: expect_value,
                        pos: self.pos - 1,
                        branch_addr: 0,
                    };

                    // Not an operator? There are a few cases to deal with,
                    // including a perfectly valid one: end of expression!
                    if op.prec < 0 {
                        if self.pos == prev_offset + 1 {
                            self.mark_error(
                                self.pos - 1,
                                format!(
                                    "Unexpected token '{}', expected value or expression",
                                    tok.kind.name()
                                ),
                            );
                            return Err(parentheses);
                        } else if expect_value || parentheses > 0 {
                            self.pos -= 1;
                            if self.skip_new_lines() {
                                continue 'tokens;
                            } else {
                                self.pos += 1;
                                return self.unexpected(expect_value, parentheses);
                            }
                        } else if tolerate_assign && tok.kind == TokenKind::Assign {
                            self.mark_error(
                                self.pos - 1,
                                "Unexpected token '=', did you mean '==' or ':='?".to_string(),
                            );

                            // Pretend the user meant '==' to recover
                            op.kind = TokenKind::Equal;
                            op.prec = operator_precedence(TokenKind::Equal, expect_value);
                        } else {
                            self.pos -= 1;
                            break 'tokens;
                        }
                    }

                    if stop_at_operator {
                        self.pos -= 1;
                        break 'tokens;
                    }

                    if expect_value != op.unary {
                        return self.unexpected(expect_value, parentheses);
                    }
                    expect_value = true;

                    while let Some(&op2) = operators.last() {
                        let right_associative = op2.unary || op2.kind == TokenKind::Reassign;

                        if op2.kind == TokenKind::LeftParenthesis {
                            break;
                        }
                        if op2.prec - (right_associative as i32) < op.prec {
                            break;
                        }

                        self.produce_operator(op2);
                        operators.pop();
                    }

                    if tok.kind == TokenKind::Reassign {
                        // Remove the useless load instructions. The variable
                        // stays in the stack slots; the store emission needs
                        // it and removes it then.
                        let size = self.program.ty(self.stack.last().unwrap().ty).size;
                        self.trim_instructions(size.min(2));
                    } else if tok.kind == TokenKind::AndAnd {
                        op.branch_addr = self.program.ir.len();
                        self.program.ir.push(Instr::imm(Opcode::SkipIfFalse, 0));
                    } else if tok.kind == TokenKind::OrOr {
                        op.branch_addr = self.program.ir.len();
                        self.program.ir.push(Instr::imm(Opcode::SkipIfTrue, 0));
                    }

                    if operators.len() >= MAX_OPERATORS {
                        self.mark_error(
                            self.pos - 1,
                            "Too many operators on the stack (compiler limitation)".to_string(),
                        );
                        return Err(parentheses);
                    }
                    operators.push(op);
                }
            }

            if self.stack.len() >= MAX_EXPRESSION_SLOTS {
                self.mark_error(
                    self.pos,
                    "Excessive complexity while parsing expression (compiler limit)".to_string(),
                );
                self.hint(None, "Simplify expression".to_string());
                return Err(parentheses);
            }
        }

        if expect_value || parentheses != 0 {
            if self.valid {
                self.report.unexpected_eof = true;
                self.mark_error(
                    self.pos - 1,
                    "Unexpected end of file, expected value or '('".to_string(),
                );
            }

            return Err(parentheses);
        }

        // Discharge the remaining operators
        for i in (0..operators.len()).rev() {
            self.produce_operator(operators[i]);
        }

        debug_assert!(self.stack.len() == start_len + 2 || !self.show_errors);
        Ok(*self.stack.last().unwrap())
    }

    // Returns false to abort the whole expression.
    fn parse_identifier(&mut self, tok: &crate::lexer::Token) -> bool {
        let name = tok.str_value();
        let var_id = self
            .program
            .interner
            .lookup(name)
            .and_then(|sym| self.program.variables_map.get(&sym).copied());
        let var_pos = self.pos - 1;
        let call = self.match_token(TokenKind::LeftParenthesis);

        let Some(var_id) = var_id else {
            self.mark_error(var_pos, format!("Reference to unknown identifier '{}'", name));
            if self.preparse {
                self.hint(
                    None,
                    "Top-level declarations (prototypes) cannot reference variables".to_string(),
                );
            }
            let candidates = self.variable_candidates();
            self.hint_suggestions(name, candidates);

            return false;
        };

        if self.poisoned_set.contains(&DefnKey::Var(var_id)) {
            self.show_errors = false;
        }

        let var = *self.program.variable(var_id);
        let Some(var_ty) = var.ty else {
            self.mark_error(
                var_pos,
                format!("Cannot use variable '{}' before it is defined", name),
            );
            return false;
        };

        self.emit_load(var_id);

        if var.scope == VariableScope::Module {
            if self.program.ty(var_ty).primitive == PrimitiveKind::Function {
                debug_assert!(self.last_is_push());
                let func_id = self.program.ir.last().unwrap().u.as_func();

                if !call {
                    let func = self.program.func(func_id);

                    if func.overload_next != func_id {
                        self.mark_error(
                            var_pos,
                            format!("Ambiguous reference to overloaded function '{}'", name),
                        );

                        // Show all candidate functions with the same name
                        let mut candidates = Vec::new();
                        let mut it = func_id;
                        loop {
                            let proto = self.program.str_of(self.program.func(it).prototype);
                            candidates.push((it, proto.to_string()));
                            it = self.program.func(it).overload_next;
                            if it == func_id {
                                break;
                            }
                        }
                        for (id, proto) in candidates {
                            self.hint_definition(
                                DefnKey::Func(id),
                                format!("Candidate '{}'", proto),
                            );
                        }

                        return false;
                    } else if func.mode == FunctionMode::Intrinsic {
                        self.mark_error(
                            var_pos,
                            "Intrinsic functions can only be called directly".to_string(),
                        );
                        return false;
                    }
                }
            }
        } else if self.preparse {
            self.mark_error(
                var_pos,
                format!("Top-level declaration (prototype) cannot reference variable '{}'", name),
            );
            return false;
        }

        if call {
            match self.program.ty(var_ty).primitive {
                PrimitiveKind::Function => {
                    if self.last_is_push() {
                        let func_id = self.program.ir.last().unwrap().u.as_func();
                        let overload = var.scope == VariableScope::Module;

                        self.trim_instructions(1);
                        self.stack.pop();

                        if !self.parse_call(var_ty, Some(func_id), overload) {
                            return false;
                        }
                    } else if !self.parse_call(var_ty, None, false) {
                        return false;
                    }
                }
                PrimitiveKind::Type => {
                    if self.last_is_push() {
                        let ty = self.program.ir.last().unwrap().u.as_type();

                        if self.program.ty(ty).primitive == PrimitiveKind::Record {
                            let ctor = self.program.ty(ty).as_record().ctor;
                            let ctor_ty = self.program.func(ctor).ty;

                            self.trim_instructions(1);
                            self.stack.pop();

                            if !self.parse_call(ctor_ty, Some(ctor), false) {
                                return false;
                            }
                        } else {
                            self.mark_error(
                                var_pos,
                                format!("Variable '{}' is not a function and cannot be called", name),
                            );
                            return false;
                        }
                    } else {
                        self.mark_error(
                            var_pos,
                            "Record constructors can only be called directly".to_string(),
                        );
                        return false;
                    }
                }
                _ => {
                    self.mark_error(
                        var_pos,
                        format!("Variable '{}' is not a function and cannot be called", name),
                    );
                    return false;
                }
            }
        }

        true
    }

    // ------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------

    fn produce_operator(&mut self, op: PendingOperator) {
        let mut success = false;

        if op.prec == 0 {
            // Assignment operators
            debug_assert!(!op.unary);

            let dest = self.stack[self.stack.len() - 2];
            let expr = self.stack[self.stack.len() - 1];

            let Some(dest_var_id) = dest.var else {
                self.mark_error(
                    op.pos,
                    "Cannot assign result to temporary value; left operand should be a variable"
                        .to_string(),
                );
                return;
            };
            let dest_var = *self.program.variable(dest_var_id);
            let dest_name = self.program.str_of(dest_var.name).to_string();

            if !dest_var.mutable {
                self.mark_error(
                    op.pos,
                    format!("Cannot assign result to non-mutable variable '{}'", dest_name),
                );
                self.hint_definition(
                    DefnKey::Var(dest_var_id),
                    format!("Variable '{}' is defined without 'mut' qualifier", dest_name),
                );

                return;
            }
            if dest.ty != expr.ty {
                if dest.indirect_addr.is_none() {
                    self.mark_error(
                        op.pos,
                        format!(
                            "Cannot assign '{}' value to variable '{}'",
                            self.program.signature(expr.ty),
                            dest_name
                        ),
                    );
                } else {
                    self.mark_error(
                        op.pos,
                        format!(
                            "Cannot assign '{}' value here, expected '{}'",
                            self.program.signature(expr.ty),
                            self.program.signature(dest.ty)
                        ),
                    );
                }
                let defined_as = dest_var
                    .ty
                    .map(|t| self.program.signature(t).to_string())
                    .unwrap_or_default();
                self.hint_definition(
                    DefnKey::Var(dest_var_id),
                    format!("Variable '{}' is defined as '{}'", dest_name, defined_as),
                );
                return;
            }

            match op.kind {
                TokenKind::Reassign => {
                    self.stack.pop();
                    self.stack.last_mut().unwrap().var = None;
                    success = true;
                }

                TokenKind::PlusAssign => {
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::AddInt, dest.ty)
                        || self.emit_operator2(PrimitiveKind::Float, Opcode::AddFloat, dest.ty);
                }
                TokenKind::MinusAssign => {
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::SubstractInt, dest.ty)
                        || self.emit_operator2(PrimitiveKind::Float, Opcode::SubstractFloat, dest.ty);
                }
                TokenKind::MultiplyAssign => {
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::MultiplyInt, dest.ty)
                        || self.emit_operator2(PrimitiveKind::Float, Opcode::MultiplyFloat, dest.ty);
                }
                TokenKind::DivideAssign => {
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::DivideInt, dest.ty)
                        || self.emit_operator2(PrimitiveKind::Float, Opcode::DivideFloat, dest.ty);
                }
                TokenKind::ModuloAssign => {
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::ModuloInt, dest.ty);
                }
                TokenKind::AndAssign => {
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::AndInt, dest.ty)
                        || self.emit_operator2(PrimitiveKind::Bool, Opcode::AndBool, dest.ty);
                }
                TokenKind::OrAssign => {
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::OrInt, dest.ty)
                        || self.emit_operator2(PrimitiveKind::Bool, Opcode::OrBool, dest.ty);
                }
                TokenKind::XorAssign => {
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::XorInt, dest.ty)
                        || self.emit_operator2(PrimitiveKind::Bool, Opcode::NotEqualBool, dest.ty);
                }
                TokenKind::LeftShiftAssign => {
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::LeftShiftInt, dest.ty);
                }
                TokenKind::RightShiftAssign => {
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::RightShiftInt, dest.ty);
                }
                TokenKind::LeftRotateAssign => {
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::LeftRotateInt, dest.ty);
                }
                TokenKind::RightRotateAssign => {
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::RightRotateInt, dest.ty);
                }

                _ => unreachable!("non-assignment operator with precedence 0"),
            }

            if let Some(func) = self.current_func {
                if dest_var.scope != VariableScope::Local {
                    self.program.func_mut(func).side_effects = true;
                }
            }
            self.program.variable_mut(dest_var_id).constant = false;

            let dest_size = self.program.ty(dest.ty).size;
            if let Some(indirect_addr) = dest.indirect_addr {
                // For StoreIndirectK to work the address must stay on the
                // stack, so the load becomes its K variant.
                if op.kind != TokenKind::Reassign {
                    debug_assert_eq!(self.program.ir[indirect_addr].code, Opcode::LoadIndirect);
                    self.program.ir[indirect_addr].code = Opcode::LoadIndirectK;
                }

                self.program.ir.push(Instr::imm(Opcode::StoreIndirectK, dest_size as i64));
            } else if dest_size == 1 {
                let code = if dest_var.scope != VariableScope::Local {
                    Opcode::StoreK
                } else {
                    Opcode::StoreLocalK
                };
                self.program.ir.push(Instr::imm(code, dest_var.offset));
            } else if dest_size > 0 {
                let code = if dest_var.scope != VariableScope::Local {
                    Opcode::Lea
                } else {
                    Opcode::LeaLocal
                };
                self.program.ir.push(Instr::imm(code, dest_var.offset));
                self.program.ir.push(Instr::imm(Opcode::StoreRevK, dest_size as i64));
            }
        } else {
            match op.kind {
                TokenKind::Plus => {
                    if op.unary {
                        let primitive =
                            self.program.ty(self.stack.last().unwrap().ty).primitive;
                        success = primitive == PrimitiveKind::Int
                            || primitive == PrimitiveKind::Float;
                    } else {
                        let out = self.stack[self.stack.len() - 2].ty;
                        success = self.emit_operator2(PrimitiveKind::Int, Opcode::AddInt, out)
                            || self.emit_operator2(PrimitiveKind::Float, Opcode::AddFloat, out);
                    }
                }
                TokenKind::Minus => {
                    if op.unary {
                        let last = self.program.ir.last().map(|i| i.code);

                        if last == Some(Opcode::NegateInt) || last == Some(Opcode::NegateFloat) {
                            self.trim_instructions(1);
                            success = true;
                        } else {
                            let out = self.stack[self.stack.len() - 1].ty;
                            success = self
                                .emit_operator1(PrimitiveKind::Int, Opcode::NegateInt, out)
                                || self.emit_operator1(PrimitiveKind::Float, Opcode::NegateFloat, out);
                        }
                    } else {
                        let out = self.stack[self.stack.len() - 2].ty;
                        success = self.emit_operator2(PrimitiveKind::Int, Opcode::SubstractInt, out)
                            || self.emit_operator2(PrimitiveKind::Float, Opcode::SubstractFloat, out);
                    }
                }
                TokenKind::Multiply => {
                    let out = self.stack[self.stack.len() - 2].ty;
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::MultiplyInt, out)
                        || self.emit_operator2(PrimitiveKind::Float, Opcode::MultiplyFloat, out);
                }
                TokenKind::Divide => {
                    let out = self.stack[self.stack.len() - 2].ty;
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::DivideInt, out)
                        || self.emit_operator2(PrimitiveKind::Float, Opcode::DivideFloat, out);
                }
                TokenKind::Modulo => {
                    let out = self.stack[self.stack.len() - 2].ty;
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::ModuloInt, out);
                }

                TokenKind::Equal => {
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::EqualInt, BOOL_TYPE)
                        || self.emit_operator2(PrimitiveKind::Float, Opcode::EqualFloat, BOOL_TYPE)
                        || self.emit_operator2(PrimitiveKind::Bool, Opcode::EqualBool, BOOL_TYPE)
                        || self.emit_operator2(PrimitiveKind::String, Opcode::EqualString, BOOL_TYPE)
                        || self.emit_operator2(PrimitiveKind::Type, Opcode::EqualType, BOOL_TYPE)
                        || self.emit_operator2(PrimitiveKind::Function, Opcode::EqualFunc, BOOL_TYPE)
                        || self.emit_operator2(PrimitiveKind::Enum, Opcode::EqualEnum, BOOL_TYPE);
                }
                TokenKind::NotEqual => {
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::NotEqualInt, BOOL_TYPE)
                        || self.emit_operator2(PrimitiveKind::Float, Opcode::NotEqualFloat, BOOL_TYPE)
                        || self.emit_operator2(PrimitiveKind::Bool, Opcode::NotEqualBool, BOOL_TYPE)
                        || self.emit_operator2(PrimitiveKind::String, Opcode::NotEqualString, BOOL_TYPE)
                        || self.emit_operator2(PrimitiveKind::Type, Opcode::NotEqualType, BOOL_TYPE)
                        || self.emit_operator2(PrimitiveKind::Function, Opcode::NotEqualFunc, BOOL_TYPE)
                        || self.emit_operator2(PrimitiveKind::Enum, Opcode::NotEqualEnum, BOOL_TYPE);
                }
                TokenKind::Greater => {
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::GreaterThanInt, BOOL_TYPE)
                        || self.emit_operator2(PrimitiveKind::Float, Opcode::GreaterThanFloat, BOOL_TYPE);
                }
                TokenKind::GreaterOrEqual => {
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::GreaterOrEqualInt, BOOL_TYPE)
                        || self.emit_operator2(PrimitiveKind::Float, Opcode::GreaterOrEqualFloat, BOOL_TYPE);
                }
                TokenKind::Less => {
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::LessThanInt, BOOL_TYPE)
                        || self.emit_operator2(PrimitiveKind::Float, Opcode::LessThanFloat, BOOL_TYPE);
                }
                TokenKind::LessOrEqual => {
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::LessOrEqualInt, BOOL_TYPE)
                        || self.emit_operator2(PrimitiveKind::Float, Opcode::LessOrEqualFloat, BOOL_TYPE);
                }

                TokenKind::And => {
                    let out = self.stack[self.stack.len() - 2].ty;
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::AndInt, out)
                        || self.emit_operator2(PrimitiveKind::Bool, Opcode::AndBool, out);
                }
                TokenKind::Or => {
                    let out = self.stack[self.stack.len() - 2].ty;
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::OrInt, out)
                        || self.emit_operator2(PrimitiveKind::Bool, Opcode::OrBool, out);
                }
                TokenKind::XorOrComplement => {
                    if op.unary {
                        let out = self.stack[self.stack.len() - 1].ty;
                        success = self.emit_operator1(PrimitiveKind::Int, Opcode::ComplementInt, out)
                            || self.emit_operator1(PrimitiveKind::Bool, Opcode::NotBool, out);
                    } else {
                        let out = self.stack[self.stack.len() - 1].ty;
                        success = self.emit_operator2(PrimitiveKind::Int, Opcode::XorInt, out)
                            || self.emit_operator2(PrimitiveKind::Bool, Opcode::NotEqualBool, out);
                    }
                }
                TokenKind::LeftShift => {
                    let out = self.stack[self.stack.len() - 2].ty;
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::LeftShiftInt, out);
                }
                TokenKind::RightShift => {
                    let out = self.stack[self.stack.len() - 2].ty;
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::RightShiftInt, out);
                }
                TokenKind::LeftRotate => {
                    let out = self.stack[self.stack.len() - 2].ty;
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::LeftRotateInt, out);
                }
                TokenKind::RightRotate => {
                    let out = self.stack[self.stack.len() - 2].ty;
                    success = self.emit_operator2(PrimitiveKind::Int, Opcode::RightRotateInt, out);
                }

                TokenKind::Not => {
                    let out = self.stack[self.stack.len() - 1].ty;
                    success = self.emit_operator1(PrimitiveKind::Bool, Opcode::NotBool, out);
                }
                TokenKind::AndAnd => {
                    let out = self.stack[self.stack.len() - 2].ty;
                    success = self.emit_operator2(PrimitiveKind::Bool, Opcode::AndBool, out);

                    debug_assert!(op.branch_addr > 0);
                    debug_assert_eq!(self.program.ir[op.branch_addr].code, Opcode::SkipIfFalse);
                    let len = self.program.ir.len() as i64;
                    self.program.ir[op.branch_addr].u = Value::int(len - op.branch_addr as i64);
                }
                TokenKind::OrOr => {
                    let out = self.stack[self.stack.len() - 2].ty;
                    success = self.emit_operator2(PrimitiveKind::Bool, Opcode::OrBool, out);

                    debug_assert!(op.branch_addr > 0);
                    debug_assert_eq!(self.program.ir[op.branch_addr].code, Opcode::SkipIfTrue);
                    let len = self.program.ir.len() as i64;
                    self.program.ir[op.branch_addr].u = Value::int(len - op.branch_addr as i64);
                }

                _ => unreachable!("unknown operator"),
            }
        }

        if !success {
            let name = op.kind.name();

            if op.unary {
                self.mark_error(
                    op.pos,
                    format!(
                        "Cannot use '{}' operator on '{}' value",
                        name,
                        self.program.signature(self.stack[self.stack.len() - 1].ty)
                    ),
                );
            } else if self.stack[self.stack.len() - 2].ty == self.stack[self.stack.len() - 1].ty {
                self.mark_error(
                    op.pos,
                    format!(
                        "Cannot use '{}' operator on '{}' values",
                        name,
                        self.program.signature(self.stack[self.stack.len() - 2].ty)
                    ),
                );
            } else {
                self.mark_error(
                    op.pos,
                    format!(
                        "Cannot use '{}' operator on '{}' and '{}' values",
                        name,
                        self.program.signature(self.stack[self.stack.len() - 2].ty),
                        self.program.signature(self.stack[self.stack.len() - 1].ty)
                    ),
                );
            }
        }
    }

    fn emit_operator1(&mut self, in_primitive: PrimitiveKind, code: Opcode, out_type: TypeId) -> bool {
        let ty = self.stack[self.stack.len() - 1].ty;

        if self.program.ty(ty).primitive == in_primitive {
            self.program.ir.push(Instr::op(code));
            self.fold_instruction(1, out_type);

            *self.stack.last_mut().unwrap() = StackSlot::of(out_type);

            true
        } else {
            false
        }
    }

    fn emit_operator2(&mut self, in_primitive: PrimitiveKind, code: Opcode, out_type: TypeId) -> bool {
        let ty1 = self.stack[self.stack.len() - 2].ty;
        let ty2 = self.stack[self.stack.len() - 1].ty;

        if self.program.ty(ty1).primitive == in_primitive && ty1 == ty2 {
            self.program.ir.push(Instr::op(code));
            self.fold_instruction(2, out_type);

            self.stack.pop();
            *self.stack.last_mut().unwrap() = StackSlot::of(out_type);

            true
        } else {
            false
        }
    }

    /// Try to fold the just-emitted operator (or call) whose `count`
    /// operand slots were all produced by `Push`, by executing the IR tail
    /// with the folder and replacing it with a single `Push`.
    fn fold_instruction(&mut self, count: usize, out_type: TypeId) {
        let (size, primitive) = {
            let info = self.program.ty(out_type);
            (info.size, info.primitive)
        };

        if size > 1 {
            return;
        }
        let ir_len = self.program.ir.len();
        if ir_len < count + 1 {
            return;
        }
        for i in 0..count {
            if self.program.ir[ir_len - 2 - i].code != Opcode::Push {
                return;
            }
        }

        self.program.ir.push(Instr::imm(Opcode::End, size as i64));
        let tail = self.program.ir.len() - 2 - count;

        match self.folder.try_eval_tail(self.program, tail, size) {
            Some(value) => {
                self.trim_instructions(2 + count);
                if size == 1 {
                    self.program.ir.push(Instr::push(primitive, value));
                }
            }
            None => {
                // Runtime errors during folding are swallowed; keep the
                // normal IR.
                self.program.ir.pop();
            }
        }
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    // Only valid from inside parse_expression_inner()
    fn parse_call(&mut self, func_type_id: TypeId, func: Option<FuncId>, overload: bool) -> bool {
        let call_pos = self.pos - 1;
        let call_addr = self.program.ir.len();

        let (variadic, fixed_params) = {
            let func_type = self.program.ty(func_type_id).as_function();
            (func_type.variadic, func_type.params.len())
        };

        // Parse arguments. Variadic trailing arguments are reified as
        // (Type, value…) pairs with a trailing slot count.
        let mut args: Vec<TypeId> = Vec::new();
        let mut args_size: i64 = 0;
        if !self.match_token(TokenKind::RightParenthesis) {
            loop {
                self.skip_new_lines();

                if args.len() >= MAX_PARAMETERS {
                    self.mark_error(
                        self.pos,
                        format!("Functions cannot take more than {} arguments", MAX_PARAMETERS),
                    );
                    return false;
                }

                if variadic && args.len() >= fixed_params {
                    let type_addr = self.program.ir.len();
                    self.program.ir.push(Instr::push(PrimitiveKind::Type, Value::NULL));

                    let ty = self.parse_expression(false, true).ty;
                    args.push(ty);
                    args_size += 1 + self.program.ty(ty).size as i64;

                    self.program.ir[type_addr].u = Value::ty(ty);
                } else {
                    let ty = self.parse_expression(false, true).ty;
                    args.push(ty);
                    args_size += self.program.ty(ty).size as i64;
                }

                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }

            self.skip_new_lines();
            self.consume_token(TokenKind::RightParenthesis);
        }
        if variadic {
            let extra = args_size - fixed_params as i64;
            self.program.ir.push(Instr::push(PrimitiveKind::Int, Value::int(extra)));
            args_size += 1;
        }

        // Find the appropriate overload. Variadic functions cannot be
        // overloaded but the same test checks their argument types.
        let mut func = func;
        if let (Some(func0), true) = (func, overload) {
            let mut candidate = func0;

            while !self.test_overload(self.program.func(candidate).ty, &args) {
                candidate = self.program.func(candidate).overload_next;

                if candidate == func0 {
                    let list = args
                        .iter()
                        .map(|&a| self.program.signature(a).to_string())
                        .collect::<Vec<_>>()
                        .join(", ");
                    let name = self.program.str_of(self.program.func(func0).name).to_string();
                    self.mark_error(
                        call_pos,
                        format!("Cannot call '{}' with ({}) arguments", name, list),
                    );

                    // Show all candidate functions with the same name
                    let mut candidates = Vec::new();
                    let mut it = func0;
                    loop {
                        let proto = self.program.str_of(self.program.func(it).prototype);
                        candidates.push((it, proto.to_string()));
                        it = self.program.func(it).overload_next;
                        if it == func0 {
                            break;
                        }
                    }
                    for (id, proto) in candidates {
                        self.hint_definition(DefnKey::Func(id), format!("Candidate '{}'", proto));
                    }

                    return false;
                }
            }

            func = Some(candidate);
        } else if !self.test_overload(func_type_id, &args) {
            let list = args
                .iter()
                .map(|&a| self.program.signature(a).to_string())
                .collect::<Vec<_>>()
                .join(", ");
            self.mark_error(
                call_pos,
                format!(
                    "Cannot call function typed '{}' with ({}) arguments",
                    self.program.signature(func_type_id),
                    list
                ),
            );
            return false;
        }

        let resolved_type = func.map(|f| self.program.func(f).ty).unwrap_or(func_type_id);
        let ret_type = self.program.ty(resolved_type).as_function().ret;

        if let Some(current) = self.current_func {
            let (impure, side_effects) = match func {
                Some(f) => (self.program.func(f).impure, self.program.func(f).side_effects),
                None => (true, true),
            };
            let current = self.program.func_mut(current);
            current.impure |= impure;
            current.side_effects |= side_effects;
        }

        // Emit intrinsic or call
        match func {
            None => {
                self.program.ir.push(Instr::imm(Opcode::CallIndirect, -(1 + args_size)));
                self.stack.pop();
            }
            Some(f) if self.program.func(f).mode == FunctionMode::Intrinsic => {
                let name = self.program.func(f).name;
                self.emit_intrinsic(name, call_pos, call_addr, &args);
            }
            Some(f) if self.program.func(f).mode == FunctionMode::Record => {
                // Nothing to do, the arguments build the object
                let _ = f;
            }
            Some(f) => {
                self.program.ir.push(Instr {
                    code: Opcode::Call,
                    primitive: PrimitiveKind::Null,
                    u: Value::func(f),
                });

                let (impure, valid) = {
                    let func = self.program.func(f);
                    (func.impure, func.valid)
                };
                if !impure && Some(f) != self.current_func {
                    self.show_errors &= valid;
                    self.fold_instruction(args_size as usize, ret_type);
                }
            }
        }
        self.stack.push(StackSlot::of(ret_type));

        true
    }

    fn emit_intrinsic(&mut self, name: Sym, call_pos: usize, call_addr: usize, args: &[TypeId]) {
        let name = self.program.str_of(name).to_string();

        match name.as_str() {
            "toFloat" => {
                if args[0] == INT_TYPE {
                    self.program.ir.push(Instr::op(Opcode::IntToFloat));
                    self.fold_instruction(1, FLOAT_TYPE);
                }
            }
            "toInt" => {
                if args[0] == FLOAT_TYPE {
                    self.program.ir.push(Instr::op(Opcode::FloatToInt));
                    self.fold_instruction(1, INT_TYPE);
                }
            }
            "typeOf" => {
                if args.len() != 1 {
                    self.mark_error(call_pos, "Intrinsic function typeOf() takes one argument".to_string());
                    return;
                }

                // typeOf() observes the argument type, it does not execute
                // anything
                let trim = self.program.ir.len() - call_addr;
                self.trim_instructions(trim);

                self.program.ir.push(Instr::push(PrimitiveKind::Type, Value::ty(args[0])));
            }
            _ => unreachable!("unknown intrinsic"),
        }
    }

    fn emit_load(&mut self, var_id: VarId) {
        let var = *self.program.variable(var_id);
        let ty = var.ty.expect("loading variable without a type");
        let size = self.program.ty(ty).size;

        if size == 1 {
            // Mutable globals can change at any time, unlike locals which
            // only change linearly; their constant status is only known
            // once all the code has been parsed.
            let stable = var.constant && (!var.mutable || var.scope == VariableScope::Local);

            if stable {
                // The IR buffers get swapped while a function body is
                // parsed, so non-local values live in the stashed buffer.
                let inst = if self.current_func.is_some() && var.scope != VariableScope::Local {
                    let func = self.current_func.unwrap();
                    self.program.func(func).ir[var.ready_addr - 1]
                } else {
                    self.program.ir[var.ready_addr - 1]
                };

                self.program.ir.push(inst);
            } else {
                let code = if var.scope != VariableScope::Local {
                    Opcode::Load
                } else {
                    Opcode::LoadLocal
                };
                self.program.ir.push(Instr::imm(code, var.offset));
            }
        } else if size > 0 {
            let code = if var.scope != VariableScope::Local {
                Opcode::Lea
            } else {
                Opcode::LeaLocal
            };
            self.program.ir.push(Instr::imm(code, var.offset));
            self.program.ir.push(Instr::imm(Opcode::LoadIndirect, size as i64));
        }

        if let Some(func) = self.current_func {
            if var.mutable && var.scope != VariableScope::Local {
                self.program.func_mut(func).impure = true;
            }
        }

        self.stack.push(StackSlot {
            ty,
            var: Some(var_id),
            indirect_addr: None,
            indirect_imbalance: 0,
        });
    }

    fn test_overload(&self, func_type_id: TypeId, params: &[TypeId]) -> bool {
        let func_type = self.program.ty(func_type_id).as_function();

        if func_type.variadic {
            if func_type.params.len() > params.len() {
                return false;
            }
        } else if func_type.params.len() != params.len() {
            return false;
        }

        func_type
            .params
            .iter()
            .zip(params)
            .all(|(a, b)| a == b)
    }

    // ------------------------------------------------------------------
    // Types and postfix operations
    // ------------------------------------------------------------------

    fn parse_type(&mut self) -> TypeId {
        let type_pos = self.pos;

        {
            let ty = self.parse_expression(true, false).ty;

            if ty != TYPE_TYPE {
                self.mark_error(
                    type_pos,
                    format!("Expected a 'Type' expression, not '{}'", self.program.signature(ty)),
                );
                return NULL_TYPE;
            }
        }

        if !self.last_is_push() {
            self.mark_error(
                type_pos,
                "Complex 'Type' expression cannot be resolved statically".to_string(),
            );
            return NULL_TYPE;
        }

        let ty = self.program.ir.last().unwrap().u.as_type();
        self.trim_instructions(1);

        ty
    }

    fn parse_function_type(&mut self) -> TypeId {
        let mut params: Vec<TypeId> = Vec::new();
        let mut params_size = 0usize;
        let mut signature = String::from("func (");

        self.consume_token(TokenKind::LeftParenthesis);
        if !self.match_token(TokenKind::RightParenthesis) {
            loop {
                self.skip_new_lines();

                let ty = self.parse_type();

                if params.len() < MAX_PARAMETERS {
                    params.push(ty);
                    params_size += self.program.ty(ty).size;
                } else {
                    self.mark_error(
                        self.pos - 1,
                        format!("Functions cannot have more than {} parameters", MAX_PARAMETERS),
                    );
                }
                signature.push_str(self.program.signature(ty));

                if self.match_token(TokenKind::Comma) {
                    signature.push_str(", ");
                } else {
                    break;
                }
            }

            self.skip_new_lines();
            self.consume_token(TokenKind::RightParenthesis);
        }
        signature.push(')');

        // Return type; Null is omitted from the signature
        let ret = if self.match_token(TokenKind::Colon) {
            self.parse_type()
        } else {
            NULL_TYPE
        };
        if ret != NULL_TYPE {
            signature.push_str(&format!(": {}", self.program.signature(ret)));
        }

        let sig = self.program.intern(&signature);
        self.program.insert_type(TypeInfo {
            signature: sig,
            primitive: PrimitiveKind::Function,
            init0: false,
            size: 1,
            kind: TypeKind::Function(FunctionType {
                params,
                params_size,
                variadic: false,
                ret,
            }),
        })
    }

    // A '[' in value position either opens a fixed array type such as
    // [4] Int (nested for multiple dimensions) or an array value literal
    // such as [1, 2, 3]; only a type can follow the closing bracket of the
    // former.
    fn parse_bracket_value(&mut self) {
        let def_pos = self.pos - 1;

        let mut elems: Vec<TypeId> = Vec::new();
        loop {
            self.skip_new_lines();

            let slot = self.parse_expression(false, false);
            elems.push(slot.ty);

            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        self.skip_new_lines();
        self.consume_token(TokenKind::RightBracket);

        if self.peek_type_start() {
            self.finish_array_type(def_pos, &elems);
        } else {
            self.finish_array_literal(def_pos, &elems);
        }
    }

    fn peek_type_start(&self) -> bool {
        let Some(tok) = self.file.tokens.get(self.pos) else {
            return false;
        };

        match tok.kind {
            TokenKind::Func | TokenKind::LeftBracket => true,
            TokenKind::Identifier => {
                let Some(sym) = self.program.interner.lookup(tok.str_value()) else {
                    return false;
                };
                let Some(&var_id) = self.program.variables_map.get(&sym) else {
                    return false;
                };
                self.program.variable(var_id).ty == Some(TYPE_TYPE)
            }
            _ => false,
        }
    }

    fn finish_array_type(&mut self, def_pos: usize, elems: &[TypeId]) {
        let count = elems.len();

        let mut static_ok = true;
        for &ty in elems {
            if ty != INT_TYPE {
                self.mark_error(
                    def_pos,
                    format!("Expected an 'Int' expression, not '{}'", self.program.signature(ty)),
                );
                static_ok = false;
            }
        }

        let mut lengths: Vec<i64> = Vec::with_capacity(count);
        let ir_len = self.program.ir.len();
        if static_ok && ir_len >= count {
            for i in 0..count {
                let inst = self.program.ir[ir_len - count + i];

                if inst.code == Opcode::Push {
                    lengths.push(inst.u.as_int());
                } else {
                    self.mark_error(
                        def_pos,
                        "Complex 'Int' expression cannot be resolved statically".to_string(),
                    );
                    static_ok = false;
                    break;
                }
            }
        }

        if static_ok {
            self.trim_instructions(count);
        } else {
            lengths = vec![0; count];
        }

        let unit = self.parse_type();

        let mut ty = unit;
        for &len in lengths.iter().rev() {
            if len < 0 {
                self.mark_error(def_pos, "Negative array size is not valid".to_string());
            }

            let unit_size = self.program.ty(ty).size as i64;
            let size = len.max(0) * unit_size;
            if len > MAX_AGGREGATE_SIZE || unit_size > MAX_AGGREGATE_SIZE || size > MAX_AGGREGATE_SIZE {
                self.mark_error(def_pos, "Fixed array size is too big".to_string());
            }

            let init0 = self.program.ty(ty).init0;
            let signature = format!("[{}] {}", len, self.program.signature(ty));
            let sig = self.program.intern(&signature);

            ty = self.program.insert_type(TypeInfo {
                signature: sig,
                primitive: PrimitiveKind::Array,
                init0,
                size: size.max(0) as usize,
                kind: TypeKind::Array(ArrayType { unit: ty, len }),
            });
        }

        self.program.ir.push(Instr::push(PrimitiveKind::Type, Value::ty(ty)));
        self.stack.push(StackSlot::of(TYPE_TYPE));
    }

    fn finish_array_literal(&mut self, def_pos: usize, elems: &[TypeId]) {
        let unit = elems[0];
        for &ty in &elems[1..] {
            if ty != unit {
                self.mark_error(
                    def_pos,
                    format!(
                        "Cannot mix '{}' and '{}' values in array literal",
                        self.program.signature(unit),
                        self.program.signature(ty)
                    ),
                );
            }
        }

        let len = elems.len() as i64;
        let unit_size = self.program.ty(unit).size as i64;
        let size = len * unit_size;
        if len > MAX_AGGREGATE_SIZE || unit_size > MAX_AGGREGATE_SIZE || size > MAX_AGGREGATE_SIZE {
            self.mark_error(def_pos, "Fixed array size is too big".to_string());
        }

        let init0 = self.program.ty(unit).init0;
        let signature = format!("[{}] {}", len, self.program.signature(unit));
        let sig = self.program.intern(&signature);

        let ty = self.program.insert_type(TypeInfo {
            signature: sig,
            primitive: PrimitiveKind::Array,
            init0,
            size: size as usize,
            kind: TypeKind::Array(ArrayType { unit, len }),
        });

        // The element slots are already on the stack, in order
        self.stack.push(StackSlot::of(ty));
    }

    fn parse_array_subscript(&mut self) {
        // If the array was loaded from a variable its address is already on
        // the stack because of emit_load; a temporary needs it now.
        if self.stack.last().unwrap().indirect_addr.is_none() {
            if self.stack.last().unwrap().var.is_none() {
                let size = self.program.ty(self.stack.last().unwrap().ty).size as i64;
                self.program.ir.push(Instr::imm(Opcode::LeaRel, -size));
                let addr = self.program.ir.len();
                self.stack.last_mut().unwrap().indirect_addr = Some(addr);
            } else {
                let addr = self.program.ir.len() - 1;
                self.stack.last_mut().unwrap().indirect_addr = Some(addr);
            }
        }

        loop {
            let top = *self.stack.last().unwrap();
            let (unit, array_len, array_size) = {
                let info = self.program.ty(top.ty);
                let array = info.as_array();
                (array.unit, array.len, info.size)
            };
            let unit_size = self.program.ty(unit).size;

            // Kill the load instructions, the index merges into the address
            let trim = self.program.ir.len() - top.indirect_addr.unwrap();
            self.trim_instructions(trim);

            let idx_pos = self.pos;
            {
                let ty = self.parse_expression(false, false).ty;

                if ty != INT_TYPE {
                    self.mark_error(
                        idx_pos,
                        format!("Expected an 'Int' expression, not '{}'", self.program.signature(ty)),
                    );
                }
            }

            // Compute the element address
            if self.last_is_push() {
                let idx = self.program.ir.last().unwrap().u.as_int();
                let offset = idx * unit_size as i64;

                if self.show_errors && (idx < 0 || idx >= array_len) {
                    self.mark_error(
                        idx_pos,
                        format!("Index is out of range: {} (array length {})", idx, array_len),
                    );
                }

                let prev = if self.program.ir.len() >= 2 {
                    Some(self.program.ir[self.program.ir.len() - 2].code)
                } else {
                    None
                };
                if prev == Some(Opcode::Lea) || prev == Some(Opcode::LeaRel) {
                    self.trim_instructions(1);
                    let inst = self.program.ir.last_mut().unwrap();
                    inst.u = Value::int(inst.u.as_int() + offset);
                } else if offset != 0 {
                    let inst = self.program.ir.last_mut().unwrap();
                    inst.u = Value::int(offset);
                    self.program.ir.push(Instr::op(Opcode::AddInt));
                } else {
                    self.trim_instructions(1);
                }
            } else {
                self.program.ir.push(Instr::imm(Opcode::CheckIndex, array_len));
                if unit_size != 1 {
                    self.program.ir.push(Instr::push(PrimitiveKind::Int, Value::int(unit_size as i64)));
                    self.program.ir.push(Instr::op(Opcode::MultiplyInt));
                }
                self.program.ir.push(Instr::op(Opcode::AddInt));
            }

            // Load the element
            let addr = self.program.ir.len();
            self.stack.last_mut().unwrap().indirect_addr = Some(addr);
            self.program.ir.push(Instr::imm(Opcode::LoadIndirect, unit_size as i64));

            // Clean up the temporary value (if any)
            if top.var.is_none() {
                self.program.ir.push(Instr::imm(
                    Opcode::LeaRel,
                    -(unit_size as i64) - array_size as i64,
                ));
                self.program.ir.push(Instr::imm(Opcode::StoreRev, unit_size as i64));

                let imbalance = self.stack.last().unwrap().indirect_imbalance
                    + array_size.saturating_sub(unit_size);
                self.stack.last_mut().unwrap().indirect_imbalance = imbalance;
                self.emit_pop(imbalance as i64);
            }

            self.stack.last_mut().unwrap().ty = unit;

            if self.program.ty(unit).primitive == PrimitiveKind::Array
                && self.match_token(TokenKind::Comma)
            {
                continue;
            }
            break;
        }

        self.consume_token(TokenKind::RightBracket);
    }

    fn parse_record_dot(&mut self) {
        let member_pos = self.pos;

        let record_ty = self.stack.last().unwrap().ty;
        let (members, record_size) = {
            let info = self.program.ty(record_ty);
            (info.as_record().members.clone(), info.size)
        };

        if self.stack.last().unwrap().indirect_addr.is_none() {
            if self.stack.last().unwrap().var.is_none() {
                self.program.ir.push(Instr::imm(Opcode::LeaRel, -(record_size as i64)));
                let addr = self.program.ir.len();
                self.stack.last_mut().unwrap().indirect_addr = Some(addr);
            } else {
                let addr = self.program.ir.len() - 1;
                self.stack.last_mut().unwrap().indirect_addr = Some(addr);
            }
        }
        let top = *self.stack.last().unwrap();

        // Kill the load instructions, the offset merges into the address
        let trim = self.program.ir.len() - top.indirect_addr.unwrap();
        self.trim_instructions(trim);

        let name = self.consume_identifier();
        let member = members.iter().copied().find(|m| m.name == name);

        let Some(member) = member else {
            let name_str = self.program.str_of(name).to_string();
            self.mark_error(
                member_pos,
                format!(
                    "Record '{}' does not contain member called '{}'",
                    self.program.signature(record_ty),
                    name_str
                ),
            );
            let candidates = members
                .iter()
                .enumerate()
                .map(|(i, m)| {
                    let pos = self
                        .definitions_map
                        .get(&DefnKey::Member(record_ty, i as u32))
                        .copied();
                    (self.program.str_of(m.name).to_string(), pos)
                })
                .collect();
            self.hint_suggestions(&name_str, candidates);

            return;
        };
        let member_size = self.program.ty(member.ty).size;

        // Resolve the member
        if member.offset != 0 {
            let last = self.program.ir.last().map(|i| i.code);

            if last == Some(Opcode::Lea) || last == Some(Opcode::LeaRel) {
                let inst = self.program.ir.last_mut().unwrap();
                inst.u = Value::int(inst.u.as_int() + member.offset as i64);
            } else {
                self.program.ir.push(Instr::push(PrimitiveKind::Int, Value::int(member.offset as i64)));
                self.program.ir.push(Instr::op(Opcode::AddInt));
            }
        }

        // Load the member
        let addr = self.program.ir.len();
        self.stack.last_mut().unwrap().indirect_addr = Some(addr);
        self.program.ir.push(Instr::imm(Opcode::LoadIndirect, member_size as i64));

        // Clean up the temporary value (if any)
        if top.var.is_none() {
            self.program.ir.push(Instr::imm(
                Opcode::LeaRel,
                -(member_size as i64) - record_size as i64,
            ));
            self.program.ir.push(Instr::imm(Opcode::StoreRev, member_size as i64));

            let imbalance =
                self.stack.last().unwrap().indirect_imbalance + (record_size - member_size);
            self.stack.last_mut().unwrap().indirect_imbalance = imbalance;
            self.emit_pop(imbalance as i64);
        }

        self.stack.last_mut().unwrap().ty = member.ty;
    }

    fn parse_enum_dot(&mut self) {
        let label_pos = self.pos;

        let last = self.program.ir.pop().expect("missing enum type push");
        debug_assert!(last.code == Opcode::Push && last.primitive == PrimitiveKind::Type);
        let enum_ty = last.u.as_type();

        let name = self.consume_identifier();
        let value = self.program.ty(enum_ty).as_enum().labels_map.get(&name).copied();

        let Some(value) = value else {
            let name_str = self.program.str_of(name).to_string();
            self.mark_error(
                label_pos,
                format!(
                    "Enum '{}' does not contain label called '{}'",
                    self.program.signature(enum_ty),
                    name_str
                ),
            );
            let candidates = self
                .program
                .ty(enum_ty)
                .as_enum()
                .labels
                .iter()
                .map(|l| (self.program.str_of(l.name).to_string(), None))
                .collect();
            self.hint_suggestions(&name_str, candidates);

            return;
        };

        self.program.ir.push(Instr::push(PrimitiveKind::Enum, Value::int(value)));

        *self.stack.last_mut().unwrap() = StackSlot::of(enum_ty);
    }

    // ------------------------------------------------------------------
    // Support
    // ------------------------------------------------------------------

    // Dead results are trimmed instead of popped where possible: loads and
    // pushes disappear, stores lose their K variant, calls to functions
    // without side effects go away entirely.
    fn discard_result(&mut self, mut size: usize) {
        while size > 0 {
            let Some(&inst) = self.program.ir.last() else {
                self.emit_pop(size as i64);
                return;
            };

            match inst.code {
                Opcode::Push
                | Opcode::Lea
                | Opcode::LeaLocal
                | Opcode::LeaRel
                | Opcode::Load
                | Opcode::LoadLocal => {
                    self.trim_instructions(1);
                    size -= 1;
                }

                Opcode::StoreK => {
                    self.program.ir.last_mut().unwrap().code = Opcode::Store;
                    size -= 1;
                }
                Opcode::StoreLocalK => {
                    self.program.ir.last_mut().unwrap().code = Opcode::StoreLocal;
                    size -= 1;
                }

                Opcode::StoreIndirectK | Opcode::StoreRevK => {
                    let count = inst.u.as_int() as usize;

                    if size >= count {
                        let last = self.program.ir.last_mut().unwrap();
                        last.code = match inst.code {
                            Opcode::StoreIndirectK => Opcode::StoreIndirect,
                            _ => Opcode::StoreRev,
                        };
                        size -= count;
                    } else {
                        self.emit_pop(size as i64);
                        return;
                    }
                }

                Opcode::Call => {
                    let func_id = inst.u.as_func();
                    let (side_effects, variadic, params_size, ret_size) = {
                        let func = self.program.func(func_id);
                        let func_type = self.program.ty(func.ty).as_function();
                        (
                            func.side_effects,
                            func_type.variadic,
                            func_type.params_size,
                            self.program.ty(func_type.ret).size,
                        )
                    };

                    if !side_effects && !variadic && size >= ret_size {
                        self.trim_instructions(1);
                        size = size - ret_size + params_size;
                    } else {
                        self.emit_pop(size as i64);
                        return;
                    }
                }

                _ => {
                    self.emit_pop(size as i64);
                    return;
                }
            }
        }
    }

    /// Move an aggregate whose slots were all pushed as constants into the
    /// read-only pool, replacing the pushes with a `PushBig`.
    fn copy_big_constant(&mut self, size: usize) -> bool {
        debug_assert!(size > 1);

        let ir_len = self.program.ir.len();
        if ir_len < size {
            return false;
        }

        let mut values = vec![Value::NULL; size];
        for i in 0..size {
            let inst = self.program.ir[ir_len - 1 - i];

            match inst.code {
                Opcode::Push => values[size - 1 - i] = inst.u,
                _ => return false,
            }
        }

        self.trim_instructions(size);

        let ro_len = self.program.ro.len();
        self.program.ir.push(Instr::push(PrimitiveKind::Int, Value::int(ro_len as i64)));
        self.program.ir.push(Instr::imm(Opcode::PushBig, size as i64));
        self.program.ro.extend(values);

        true
    }

    fn destroy_variables(&mut self, first: usize) {
        for i in (first..self.program.variables.len()).rev() {
            self.poisoned_set.remove(&DefnKey::Var(VarId(i as u32)));
        }

        self.program.drop_variables(first);
    }

    fn trim_instructions(&mut self, count: usize) {
        // Don't trim previously compiled code
        let min_ir_len = if self.current_func.is_some() {
            0
        } else {
            self.prev_ir_len
        };

        let ir_len = self.program.ir.len();
        if ir_len < count || ir_len - count < min_ir_len {
            debug_assert!(!self.valid);
            return;
        }

        let trim_addr = ir_len - count;

        // Remove potential jump sources
        while self.loop_break_addr >= trim_addr as i64 {
            self.loop_break_addr = self.program.ir[self.loop_break_addr as usize].u.as_int();
        }
        while self.loop_continue_addr >= trim_addr as i64 {
            self.loop_continue_addr = self.program.ir[self.loop_continue_addr as usize].u.as_int();
        }

        // Adjust the IR-line map
        {
            let lines = self.src_lines_mut();

            if lines.last().is_some_and(|l| l.addr > trim_addr) {
                let mut line = *lines.last().unwrap();
                line.addr = trim_addr;

                while lines.last().is_some_and(|l| l.addr >= trim_addr) {
                    lines.pop();
                }

                lines.push(line);
            }
        }

        self.program.ir.truncate(trim_addr);
    }

    // ------------------------------------------------------------------
    // Source maps
    // ------------------------------------------------------------------

    fn src_lines(&self) -> &Vec<SourceLine> {
        match self.cur_src {
            SrcTarget::Main(idx) => &self.program.sources[idx].lines,
            SrcTarget::Func(func) => &self.program.func(func).src.lines,
        }
    }

    fn src_lines_mut(&mut self) -> &mut Vec<SourceLine> {
        match self.cur_src {
            SrcTarget::Main(idx) => &mut self.program.sources[idx].lines,
            SrcTarget::Func(func) => &mut self.program.func_mut(func).src.lines,
        }
    }

    fn src_filename(&self) -> &str {
        match self.cur_src {
            SrcTarget::Main(idx) => &self.program.sources[idx].filename,
            SrcTarget::Func(func) => &self.program.func(func).src.filename,
        }
    }

    fn src_lines_len(&self) -> usize {
        self.src_lines().len()
    }

    fn src_lines_push(&mut self, line: SourceLine) {
        self.src_lines_mut().push(line);
    }

    fn src_lines_pop(&mut self) {
        self.src_lines_mut().pop();
    }

    fn src_lines_truncate(&mut self, len: usize) {
        self.src_lines_mut().truncate(len);
    }

    // ------------------------------------------------------------------
    // Tokens
    // ------------------------------------------------------------------

    fn peek(&self, kind: TokenKind) -> bool {
        self.pos < self.file.tokens.len() && self.file.tokens[self.pos].kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        let matched = self.peek(kind);
        self.pos += matched as usize;

        matched
    }

    fn consume_token(&mut self, kind: TokenKind) -> bool {
        if self.pos >= self.file.tokens.len() {
            if self.valid {
                self.report.unexpected_eof = true;
                self.mark_error(
                    self.pos,
                    format!("Unexpected end of file, expected '{}'", kind.name()),
                );
            }

            return false;
        }

        if self.file.tokens[self.pos].kind != kind {
            self.mark_error(
                self.pos,
                format!(
                    "Unexpected token '{}', expected '{}'",
                    self.file.tokens[self.pos].kind.name(),
                    kind.name()
                ),
            );
            return false;
        }

        self.pos += 1;
        true
    }

    fn consume_identifier(&mut self) -> Sym {
        if self.consume_token(TokenKind::Identifier) {
            self.program.intern(self.file.tokens[self.pos - 1].str_value())
        } else {
            Sym(0)
        }
    }

    fn end_statement(&mut self) -> bool {
        if self.pos >= self.file.tokens.len() {
            if self.valid {
                self.report.unexpected_eof = true;
                self.mark_error(self.pos, "Unexpected end of file, expected end of statement".to_string());
            }

            return false;
        }

        match self.file.tokens[self.pos].kind {
            TokenKind::EndOfLine | TokenKind::Semicolon => {
                self.pos += 1;
                true
            }
            // Block terminators end a statement without being consumed, so
            // one-line forms like `if c do a else b end` compose.
            TokenKind::End | TokenKind::Else => true,
            _ => {
                self.mark_error(
                    self.pos,
                    format!(
                        "Unexpected token '{}', expected end of statement",
                        self.file.tokens[self.pos].kind.name()
                    ),
                );

                // Skip to the next statement to recover
                loop {
                    self.pos += 1;
                    if self.pos >= self.file.tokens.len()
                        || self.file.tokens[self.pos].kind == TokenKind::EndOfLine
                        || self.file.tokens[self.pos].kind == TokenKind::Semicolon
                    {
                        break;
                    }
                }

                false
            }
        }
    }

    fn skip_new_lines(&mut self) -> bool {
        if self.match_token(TokenKind::EndOfLine) {
            while self.match_token(TokenKind::EndOfLine) {}

            if self.pos < self.file.tokens.len() {
                let addr = self.program.ir.len();
                let line = self.file.tokens[self.pos].line;
                self.src_lines_push(SourceLine { addr, line });
            }

            true
        } else {
            false
        }
    }

    fn last_is_push(&self) -> bool {
        self.program.ir.last().is_some_and(|i| i.code == Opcode::Push)
    }

    fn recurse_inc(&mut self) -> bool {
        self.recursion += 1;
        self.recursion < MAX_RECURSION
    }

    fn recurse_dec(&mut self) {
        self.recursion -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Program, Compiler) {
        let mut program = Program::new();
        let compiler = Compiler::new(&mut program);
        (program, compiler)
    }

    fn try_compile_in(
        program: &mut Program,
        compiler: &mut Compiler,
        code: &str,
    ) -> (Result<(), CompileReport>, Vec<Diagnostic>) {
        let mut diags = Vec::new();
        let mut sink = DiagnosticSink::Collect(&mut diags);

        let result = match tokenize(code, "<test>", &mut sink) {
            Ok(file) => compiler.compile_with(program, &file, &mut sink),
            Err(_) => Err(CompileReport::default()),
        };

        (result, diags)
    }

    fn try_compile(code: &str) -> (Program, Result<(), CompileReport>, Vec<Diagnostic>) {
        let (mut program, mut compiler) = setup();
        let (result, diags) = try_compile_in(&mut program, &mut compiler, code);
        (program, result, diags)
    }

    fn compile_ok(code: &str) -> Program {
        let (program, result, diags) = try_compile(code);
        assert!(result.is_ok(), "compile failed: {:?}", diags);
        program
    }

    fn messages(diags: &[Diagnostic]) -> String {
        diags.iter().map(|d| d.message.as_str()).collect::<Vec<_>>().join("\n")
    }

    #[test]
    fn test_constant_folding_single_push() {
        let program = compile_ok("let x = 1 + 2 * 3");

        // The initializer must have been folded to a single Push
        let len = program.ir.len();
        assert_eq!(program.ir[len - 1].code, Opcode::End);
        assert_eq!(program.ir[len - 2].code, Opcode::Push);
        assert_eq!(program.ir[len - 2].u.as_int(), 7);
    }

    #[test]
    fn test_folding_unary_and_intrinsics() {
        let program = compile_ok("let x = -(5 - 2)\nlet f = toFloat(2)\nlet t = typeOf(42)");

        let pushes: Vec<Instr> = program
            .ir
            .iter()
            .rev()
            .filter(|i| i.code == Opcode::Push)
            .take(3)
            .copied()
            .collect();

        assert_eq!(pushes[0].u.as_type(), INT_TYPE);
        assert_eq!(pushes[1].u.as_float(), 2.0);
        assert_eq!(pushes[2].u.as_int(), -3);
    }

    #[test]
    fn test_failed_compile_rolls_back() {
        let (mut program, mut compiler) = setup();

        let (first, _) = try_compile_in(&mut program, &mut compiler, "let x = 1");
        first.unwrap();

        let ir = program.ir.clone();
        let types = program.types.len();
        let functions = program.functions.len();
        let variables = program.variables.len();
        let ro = program.ro.len();
        let sources = program.sources.len();

        let (second, _) = try_compile_in(&mut program, &mut compiler, "let y = unknown_name");
        assert!(second.is_err());

        assert_eq!(program.ir, ir);
        assert_eq!(program.types.len(), types);
        assert_eq!(program.functions.len(), functions);
        assert_eq!(program.variables.len(), variables);
        assert_eq!(program.ro.len(), ro);
        assert_eq!(program.sources.len(), sources);

        // The image still works for the next statement
        let (third, _) = try_compile_in(&mut program, &mut compiler, "let y = x + 1");
        third.unwrap();
    }

    #[test]
    fn test_failed_function_rolls_back_overload_ring() {
        let (mut program, mut compiler) = setup();

        let (first, _) = try_compile_in(&mut program, &mut compiler, "func f(x: Int): Int\nreturn x\nend");
        first.unwrap();

        let (second, _) =
            try_compile_in(&mut program, &mut compiler, "func f(x: Float): Float\nreturn nope\nend");
        assert!(second.is_err());

        // The surviving ring must be intact and self-linked again
        let head = *program.functions_map.get(&program.interner.lookup("f").unwrap()).unwrap();
        assert_eq!(program.func(head).overload_next, head);
        assert_eq!(program.func(head).overload_prev, head);

        let (third, _) = try_compile_in(&mut program, &mut compiler, "let a = f(1)");
        third.unwrap();
    }

    #[test]
    fn test_function_ir_starts_with_nop() {
        let program = compile_ok("func f(): Int\nreturn 42\nend");

        let f = program
            .functions
            .iter()
            .find(|f| program.str_of(f.name) == "f")
            .unwrap();
        assert_eq!(f.ir[0].code, Opcode::Nop);
        assert!(f.valid);
        assert!(!f.impure);
    }

    #[test]
    fn test_tail_recursion_elimination() {
        let program = compile_ok(
            "func count(n: Int, acc: Int): Int\nif n <= 0 do return acc else return count(n - 1, acc + 1) end\nend",
        );

        let f = program
            .functions
            .iter()
            .find(|f| program.str_of(f.name) == "count")
            .unwrap();

        assert!(f.tre);
        assert!(!f.ir.iter().any(|i| i.code == Opcode::Call));
        assert!(f.ir.iter().any(|i| i.code == Opcode::StoreRev || i.code == Opcode::StoreLocal));
    }

    #[test]
    fn test_unknown_identifier_suggestion() {
        let (_, result, diags) = try_compile("let answer = 1\nlet x = answre");

        assert!(result.is_err());
        let all = messages(&diags);
        assert!(all.contains("Reference to unknown identifier 'answre'"));
        assert!(all.contains("Suggestion: answer"));
    }

    #[test]
    fn test_seventeen_parameters_error() {
        let params: Vec<String> = (0..17).map(|i| format!("p{}: Int", i)).collect();
        let code = format!("func f({})\npass\nend", params.join(", "));

        let (_, result, diags) = try_compile(&code);
        assert!(result.is_err());
        assert!(messages(&diags).contains("cannot have more than 16 parameters"));
    }

    #[test]
    fn test_nested_function_error() {
        let (_, result, diags) = try_compile("func outer()\nfunc inner()\npass\nend\nend");
        assert!(result.is_err());
        assert!(messages(&diags).contains("Nested functions are not supported"));
    }

    #[test]
    fn test_non_top_level_record_error() {
        let (_, result, diags) = try_compile("begin\nrecord R (x: Int)\nend");
        assert!(result.is_err());
        assert!(messages(&diags).contains("Records must be defined in top-level scope"));
    }

    #[test]
    fn test_duplicate_function_error() {
        let (_, result, diags) =
            try_compile("func f(x: Int): Int\nreturn x\nend\nfunc f(y: Int): Int\nreturn y\nend");
        assert!(result.is_err());
        assert!(messages(&diags).contains("is already defined"));
    }

    #[test]
    fn test_overload_differing_only_by_return_type() {
        let (_, result, diags) =
            try_compile("func f(x: Int): Int\nreturn x\nend\nfunc f(y: Int): Float\nreturn 1.0\nend");
        assert!(result.is_err());
        assert!(messages(&diags).contains("by return type"));
    }

    #[test]
    fn test_overloads_resolve_by_arguments() {
        let program = compile_ok(
            "func f(x: Int): Int\nreturn 1\nend\nfunc f(x: Float): Int\nreturn 2\nend\nlet a = f(0)\nlet b = f(0.5)",
        );

        // Both overloads share the ring
        let head = *program.functions_map.get(&program.interner.lookup("f").unwrap()).unwrap();
        let next = program.func(head).overload_next;
        assert_ne!(head, next);
        assert_eq!(program.func(next).overload_next, head);
    }

    #[test]
    fn test_ambiguous_overload_reference() {
        let (_, result, diags) = try_compile(
            "func f(x: Int): Int\nreturn 1\nend\nfunc f(x: Float): Int\nreturn 2\nend\nlet g = f",
        );
        assert!(result.is_err());
        assert!(messages(&diags).contains("Ambiguous reference to overloaded function 'f'"));
    }

    #[test]
    fn test_assign_to_immutable() {
        let (_, result, diags) = try_compile("let x = 1\nx := 2");
        assert!(result.is_err());
        assert!(messages(&diags).contains("non-mutable variable 'x'"));
    }

    #[test]
    fn test_shadowing_function_error() {
        let (_, result, diags) = try_compile("func f()\npass\nend\nlet f = 1");
        assert!(result.is_err());
        assert!(messages(&diags).contains("not allowed to hide function"));
    }

    #[test]
    fn test_operator_stack_limit() {
        let code = format!("let x = {}1{}", "(".repeat(140), ")".repeat(140));
        let (_, result, diags) = try_compile(&code);
        assert!(result.is_err());
        assert!(messages(&diags).contains("Too many operators"));
    }

    #[test]
    fn test_block_depth_limit() {
        let code = "begin\n".repeat(70) + &"end\n".repeat(70);
        let (_, result, diags) = try_compile(&code);
        assert!(result.is_err());
        assert!(messages(&diags).contains("Excessive parsing depth"));
    }

    #[test]
    fn test_enum_label_errors() {
        let (_, result, diags) = try_compile("enum Color (Red, Green, Blue)\nlet c = Color.Geen");
        assert!(result.is_err());
        let all = messages(&diags);
        assert!(all.contains("does not contain label called 'Geen'"));
        assert!(all.contains("Suggestion: Green"));
    }

    #[test]
    fn test_duplicate_enum_label() {
        let (_, result, diags) = try_compile("enum E (A, B, A)");
        assert!(result.is_err());
        assert!(messages(&diags).contains("Label 'A' is already used"));
    }

    #[test]
    fn test_record_member_not_found() {
        let (_, result, diags) =
            try_compile("record Point (x: Int, y: Int)\nlet p = Point(1, 2)\nlet z = p.z");
        assert!(result.is_err());
        assert!(messages(&diags).contains("does not contain member called 'z'"));
    }

    #[test]
    fn test_array_static_bounds() {
        let (_, result, diags) = try_compile("let a = [1, 2]\nlet x = a[5]");
        assert!(result.is_err());
        assert!(messages(&diags).contains("Index is out of range: 5 (array length 2)"));
    }

    #[test]
    fn test_array_size_limits() {
        let (_, result, diags) = try_compile("let a: [100000] Int");
        assert!(result.is_err());
        assert!(messages(&diags).contains("Fixed array size is too big"));

        let (_, result, diags) = try_compile("let a: [-1] Int");
        assert!(result.is_err());
        assert!(messages(&diags).contains("Negative array size is not valid"));
    }

    #[test]
    fn test_zero_length_array_is_representable() {
        compile_ok("let a: [0] Int");
    }

    #[test]
    fn test_uninitialized_needs_init0() {
        // Function types have no zero value
        let (_, result, diags) = try_compile("let f: func (Int): Int");
        assert!(result.is_err());
        assert!(messages(&diags).contains("must be explicitly initialized"));
    }

    #[test]
    fn test_repl_report_depth() {
        let (_, result, _) = try_compile("begin\nbegin\nlet x = 1");

        let report = result.unwrap_err();
        assert!(report.unexpected_eof);
        assert_eq!(report.depth, 1);
    }

    #[test]
    fn test_unexpected_eof_in_expression() {
        let (_, result, _) = try_compile("let x = 1 +");
        let report = result.unwrap_err();
        assert!(report.unexpected_eof);
    }

    #[test]
    fn test_plain_error_is_not_eof() {
        let (_, result, _) = try_compile("let x = )");
        let report = result.unwrap_err();
        assert!(!report.unexpected_eof);
    }

    #[test]
    fn test_incremental_compiles_share_image() {
        let (mut program, mut compiler) = setup();

        try_compile_in(&mut program, &mut compiler, "let a = 1").0.unwrap();
        try_compile_in(&mut program, &mut compiler, "let b = a + 1").0.unwrap();

        // Every compiled chunk ends with End carrying the live global count
        let last = *program.ir.last().unwrap();
        assert_eq!(last.code, Opcode::End);

        // b folded from the constant a
        let push = program.ir[program.ir.len() - 2];
        assert_eq!(push.code, Opcode::Push);
        assert_eq!(push.u.as_int(), 2);
    }

    #[test]
    fn test_add_global_and_fold() {
        let mut program = Program::new();
        let mut compiler = Compiler::new(&mut program);
        compiler.add_global(&mut program, "answer", INT_TYPE, &[Value::int(42)], false);

        let mut sink = DiagnosticSink::Silent;
        let file = tokenize("let x = answer + 1", "<test>", &mut sink).unwrap();
        compiler.compile_with(&mut program, &file, &mut sink).unwrap();

        let push = program.ir[program.ir.len() - 2];
        assert_eq!(push.code, Opcode::Push);
        assert_eq!(push.u.as_int(), 43);
    }

    #[test]
    fn test_add_opaque() {
        let mut program = Program::new();
        let mut compiler = Compiler::new(&mut program);
        let ty = compiler.add_opaque(&mut program, "Handle");

        assert_eq!(program.ty(ty).primitive, PrimitiveKind::Opaque);
        assert_eq!(program.ty(ty).size, 1);

        let mut sink = DiagnosticSink::Silent;
        let file = tokenize("let h: Handle", "<test>", &mut sink).unwrap();
        compiler.compile_with(&mut program, &file, &mut sink).unwrap();
    }

    #[test]
    fn test_string_equality_folds() {
        let program = compile_ok("let eq = \"same\" == \"same\"");

        let push = program.ir[program.ir.len() - 2];
        assert_eq!(push.code, Opcode::Push);
        assert!(push.u.as_bool());
    }

    #[test]
    fn test_if_condition_folds_away_dead_branch() {
        let (mut program, mut compiler) = setup();
        let (result, _) = try_compile_in(
            &mut program,
            &mut compiler,
            "let mut x = 0\nif false do x := 1 else x := 2 end",
        );
        result.unwrap();

        // Only the else arm survives; there is no branch left
        assert!(!program.ir.iter().any(|i| {
            i.code == Opcode::BranchIfFalse || i.code == Opcode::BranchIfTrue
        }));
        assert!(program.ir.iter().any(|i| i.code == Opcode::Push && i.u.as_int() == 2));
        assert!(!program.ir.iter().any(|i| i.code == Opcode::Push && i.u.as_int() == 1));
    }

    #[test]
    fn test_assign_in_let_requires_reassign_token() {
        let (_, result, diags) = try_compile("let mut x = 1\nx = 2");
        assert!(result.is_err());
        assert!(messages(&diags).contains("did you mean '==' or ':='"));
    }

    #[test]
    fn test_missing_return_path() {
        let (_, result, diags) = try_compile("func f(x: Int): Int\nif x > 0 do return 1\nend");
        assert!(result.is_err());
        assert!(messages(&diags).contains("Some code paths do not return a value"));
    }

    #[test]
    fn test_return_type_mismatch() {
        let (_, result, diags) = try_compile("func f(): Int\nreturn 1.5\nend");
        assert!(result.is_err());
        assert!(messages(&diags).contains("Cannot return 'Float' value"));
    }

    #[test]
    fn test_break_outside_loop() {
        let (_, result, diags) = try_compile("break");
        assert!(result.is_err());
        assert!(messages(&diags).contains("Break statement outside of loop"));
    }

    #[test]
    fn test_forward_reference_to_function() {
        compile_ok("let x = f(2)\nfunc f(n: Int): Int\nreturn n * n\nend");
    }
}
