//! Program image for blikk
//!
//! A [`Program`] owns everything a compiled unit is made of: the interned
//! string arena, the type table, the function and variable tables, the main
//! IR vector, the read-only constant pool and the source maps. All tables
//! are append-only while a compile is in flight; the compiler rolls failed
//! compiles back by truncating to snapshot lengths.
//!
//! Identity is by index. Two interned strings are equal iff their [`Sym`]s
//! are equal, two types are the same iff their [`TypeId`]s are equal, and
//! the overload ring is a doubly-linked list of [`FuncId`]s.

use std::collections::HashMap;
use std::rc::Rc;

use crate::vm::NativeFunction;

/// Interned string handle. `Sym(0)` is always the empty string, so a
/// zero-initialized string slot reads as `""`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sym(pub(crate) u32);

/// Handle into [`Program::types`]. Ids 0-5 are the base types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub(crate) u32);

/// Handle into [`Program::functions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId(pub(crate) u32);

/// Handle into [`Program::variables`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(pub(crate) u32);

impl TypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl FuncId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl VarId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

pub const NULL_TYPE: TypeId = TypeId(0);
pub const BOOL_TYPE: TypeId = TypeId(1);
pub const INT_TYPE: TypeId = TypeId(2);
pub const FLOAT_TYPE: TypeId = TypeId(3);
pub const STRING_TYPE: TypeId = TypeId(4);
pub const TYPE_TYPE: TypeId = TypeId(5);

/// Function types cannot take more than this many parameters, records
/// cannot have more members than this.
pub const MAX_PARAMETERS: usize = 16;

/// Fixed arrays and records must fit their length and total slot size in
/// 16 bits.
pub const MAX_AGGREGATE_SIZE: i64 = u16::MAX as i64;

// ---------------------------------------------------------------------------
// Interner
// ---------------------------------------------------------------------------

/// Per-program deduplicating string arena.
///
/// Unlike a global leaking interner, this one supports truncation so a
/// failed compile can drop the strings it interned.
#[derive(Debug, Default)]
pub struct Interner {
    strings: Vec<Rc<str>>,
    map: HashMap<Rc<str>, u32>,
}

impl Interner {
    fn new() -> Self {
        let mut interner = Interner::default();
        interner.intern("");
        interner
    }

    pub fn intern(&mut self, s: &str) -> Sym {
        if let Some(&idx) = self.map.get(s) {
            return Sym(idx);
        }

        let idx = self.strings.len() as u32;
        let rc: Rc<str> = Rc::from(s);
        self.strings.push(Rc::clone(&rc));
        self.map.insert(rc, idx);

        Sym(idx)
    }

    pub fn lookup(&self, s: &str) -> Option<Sym> {
        self.map.get(s).map(|&idx| Sym(idx))
    }

    pub fn get(&self, sym: Sym) -> &str {
        &self.strings[sym.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn truncate(&mut self, len: usize) {
        for s in self.strings.drain(len..) {
            self.map.remove(&s);
        }
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// One stack slot: an untyped 8-byte cell.
///
/// The compiler guarantees that every read uses the accessor matching the
/// slot's static type, so the cell itself carries no tag. Zero bits are the
/// zero value of every `init0` type: integer 0, float +0.0, `false`, the
/// empty string (`Sym(0)`) and the `Null` type (`TypeId(0)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Value(u64);

impl Value {
    pub const NULL: Value = Value(0);

    pub fn int(v: i64) -> Value {
        Value(v as u64)
    }

    pub fn float(v: f64) -> Value {
        Value(v.to_bits())
    }

    pub fn bool(v: bool) -> Value {
        Value(v as u64)
    }

    pub fn sym(s: Sym) -> Value {
        Value(s.0 as u64)
    }

    pub fn ty(t: TypeId) -> Value {
        Value(t.0 as u64)
    }

    pub fn func(f: FuncId) -> Value {
        Value(f.0 as u64)
    }

    pub fn opaque(p: usize) -> Value {
        Value(p as u64)
    }

    pub fn as_int(self) -> i64 {
        self.0 as i64
    }

    pub fn as_float(self) -> f64 {
        f64::from_bits(self.0)
    }

    pub fn as_bool(self) -> bool {
        self.0 != 0
    }

    pub fn as_sym(self) -> Sym {
        Sym(self.0 as u32)
    }

    pub fn as_type(self) -> TypeId {
        TypeId(self.0 as u32)
    }

    pub fn as_func(self) -> FuncId {
        FuncId(self.0 as u32)
    }

    pub fn as_opaque(self) -> usize {
        self.0 as usize
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    Null,
    Bool,
    Int,
    Float,
    String,
    Type,
    Function,
    Array,
    Record,
    Enum,
    Opaque,
}

impl PrimitiveKind {
    pub fn name(self) -> &'static str {
        match self {
            PrimitiveKind::Null => "Null",
            PrimitiveKind::Bool => "Bool",
            PrimitiveKind::Int => "Int",
            PrimitiveKind::Float => "Float",
            PrimitiveKind::String => "String",
            PrimitiveKind::Type => "Type",
            PrimitiveKind::Function => "Function",
            PrimitiveKind::Array => "Array",
            PrimitiveKind::Record => "Record",
            PrimitiveKind::Enum => "Enum",
            PrimitiveKind::Opaque => "Opaque",
        }
    }
}

/// Shared type header plus per-kind payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeInfo {
    /// Canonical signature; two types with the same signature are the same
    /// [`TypeId`].
    pub signature: Sym,
    pub primitive: PrimitiveKind,
    /// Whether default zero-initialization produces a valid value.
    pub init0: bool,
    /// Slot count of one value of this type.
    pub size: usize,
    pub kind: TypeKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    Bare,
    Function(FunctionType),
    Array(ArrayType),
    Record(RecordType),
    Enum(EnumType),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FunctionType {
    pub params: Vec<TypeId>,
    pub params_size: usize,
    pub variadic: bool,
    pub ret: TypeId,
}

impl Default for TypeId {
    fn default() -> Self {
        NULL_TYPE
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArrayType {
    pub unit: TypeId,
    pub len: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordType {
    pub members: Vec<RecordMember>,
    /// The record constructor, a function of mode [`FunctionMode::Record`].
    pub ctor: FuncId,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordMember {
    pub name: Sym,
    pub ty: TypeId,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnumType {
    pub labels: Vec<EnumLabel>,
    pub labels_map: HashMap<Sym, i64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnumLabel {
    pub name: Sym,
    pub value: i64,
}

impl TypeInfo {
    /// Only valid on `Function` types.
    pub fn as_function(&self) -> &FunctionType {
        match &self.kind {
            TypeKind::Function(func) => func,
            _ => unreachable!("type is not a function type"),
        }
    }

    /// Only valid on `Array` types.
    pub fn as_array(&self) -> &ArrayType {
        match &self.kind {
            TypeKind::Array(array) => array,
            _ => unreachable!("type is not an array type"),
        }
    }

    /// Only valid on `Record` types.
    pub fn as_record(&self) -> &RecordType {
        match &self.kind {
            TypeKind::Record(record) => record,
            _ => unreachable!("type is not a record type"),
        }
    }

    /// Only valid on `Enum` types.
    pub fn as_enum(&self) -> &EnumType {
        match &self.kind {
            TypeKind::Enum(en) => en,
            _ => unreachable!("type is not an enum type"),
        }
    }
}

// ---------------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Nop,

    Push,
    PushZero,
    PushBig,
    Pop,

    Lea,
    LeaLocal,
    LeaRel,
    Load,
    LoadLocal,
    LoadIndirect,
    LoadIndirectK,
    Store,
    StoreK,
    StoreLocal,
    StoreLocalK,
    StoreIndirect,
    StoreIndirectK,
    StoreRev,
    StoreRevK,
    CheckIndex,

    NegateInt,
    AddInt,
    SubstractInt,
    MultiplyInt,
    DivideInt,
    ModuloInt,
    EqualInt,
    NotEqualInt,
    GreaterThanInt,
    GreaterOrEqualInt,
    LessThanInt,
    LessOrEqualInt,
    AndInt,
    OrInt,
    XorInt,
    ComplementInt,
    LeftShiftInt,
    RightShiftInt,
    LeftRotateInt,
    RightRotateInt,

    NegateFloat,
    AddFloat,
    SubstractFloat,
    MultiplyFloat,
    DivideFloat,
    EqualFloat,
    NotEqualFloat,
    GreaterThanFloat,
    GreaterOrEqualFloat,
    LessThanFloat,
    LessOrEqualFloat,

    EqualBool,
    NotEqualBool,
    NotBool,
    AndBool,
    OrBool,

    EqualString,
    NotEqualString,
    EqualType,
    NotEqualType,
    EqualFunc,
    NotEqualFunc,
    EqualEnum,
    NotEqualEnum,

    Jump,
    BranchIfTrue,
    BranchIfFalse,
    SkipIfTrue,
    SkipIfFalse,

    Call,
    CallIndirect,
    Return,

    IntToFloat,
    FloatToInt,
    InlineIf,

    End,
}

/// One IR instruction: opcode, primitive hint (only meaningful for `Push`)
/// and an 8-byte operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instr {
    pub code: Opcode,
    pub primitive: PrimitiveKind,
    pub u: Value,
}

impl Instr {
    pub fn op(code: Opcode) -> Instr {
        Instr {
            code,
            primitive: PrimitiveKind::Null,
            u: Value::NULL,
        }
    }

    pub fn imm(code: Opcode, value: i64) -> Instr {
        Instr {
            code,
            primitive: PrimitiveKind::Null,
            u: Value::int(value),
        }
    }

    pub fn push(primitive: PrimitiveKind, value: Value) -> Instr {
        Instr {
            code: Opcode::Push,
            primitive,
            u: value,
        }
    }
}

// ---------------------------------------------------------------------------
// Source maps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLine {
    pub addr: usize,
    pub line: i32,
}

/// Parallel `(address, line)` breakpoints mapping a PC back to a file:line.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceMap {
    pub filename: String,
    pub lines: Vec<SourceLine>,
}

// ---------------------------------------------------------------------------
// Functions and variables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionMode {
    Intrinsic,
    Native,
    Script,
    Record,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameter {
    pub name: Sym,
    pub ty: TypeId,
    pub mutable: bool,
}

pub struct Function {
    pub name: Sym,
    pub prototype: Sym,
    pub ty: TypeId,
    pub params: Vec<Parameter>,

    pub mode: FunctionMode,
    pub native: Option<NativeFunction>,

    pub ir: Vec<Instr>,
    pub src: SourceMap,
    pub tre: bool,

    pub valid: bool,
    pub impure: bool,
    pub side_effects: bool,

    pub overload_prev: FuncId,
    pub overload_next: FuncId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableScope {
    Module,
    Global,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Variable {
    pub name: Sym,
    /// `None` while the declaration's initializer is still being parsed.
    pub ty: Option<TypeId>,
    pub mutable: bool,
    /// The value is a compile-time-knowable single-slot constant.
    pub constant: bool,

    pub scope: VariableScope,
    pub offset: i64,

    /// IR address from which the variable may be loaded.
    pub ready_addr: usize,

    pub shadow: Option<VarId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFrame {
    pub func: Option<FuncId>,
    pub pc: usize,
    pub bp: usize,
    pub direct: bool,
}

impl Default for CallFrame {
    fn default() -> Self {
        CallFrame {
            func: None,
            pc: 0,
            bp: 0,
            direct: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

/// The complete in-memory image of a compiled unit.
#[derive(Default)]
pub struct Program {
    /// Module (top-level) IR.
    pub ir: Vec<Instr>,
    /// Read-only constant pool for aggregate literals.
    pub ro: Vec<Value>,
    /// One source map per compiled chunk of module code.
    pub sources: Vec<SourceMap>,

    pub types: Vec<TypeInfo>,
    pub functions: Vec<Function>,
    pub variables: Vec<Variable>,

    pub(crate) types_map: HashMap<Sym, TypeId>,
    pub(crate) functions_map: HashMap<Sym, FuncId>,
    pub(crate) variables_map: HashMap<Sym, VarId>,

    pub(crate) interner: Interner,
}

impl Program {
    pub fn new() -> Program {
        let mut program = Program {
            interner: Interner::new(),
            ..Program::default()
        };

        for (name, primitive, size) in [
            ("Null", PrimitiveKind::Null, 0),
            ("Bool", PrimitiveKind::Bool, 1),
            ("Int", PrimitiveKind::Int, 1),
            ("Float", PrimitiveKind::Float, 1),
            ("String", PrimitiveKind::String, 1),
            ("Type", PrimitiveKind::Type, 1),
        ] {
            let signature = program.interner.intern(name);
            let id = TypeId(program.types.len() as u32);

            program.types.push(TypeInfo {
                signature,
                primitive,
                init0: true,
                size,
                kind: TypeKind::Bare,
            });
            program.types_map.insert(signature, id);
        }

        program
    }

    pub fn intern(&mut self, s: &str) -> Sym {
        self.interner.intern(s)
    }

    pub fn str_of(&self, sym: Sym) -> &str {
        self.interner.get(sym)
    }

    pub fn ty(&self, id: TypeId) -> &TypeInfo {
        &self.types[id.0 as usize]
    }

    pub fn signature(&self, id: TypeId) -> &str {
        self.str_of(self.ty(id).signature)
    }

    pub fn func(&self, id: FuncId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn func_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.0 as usize]
    }

    pub fn variable(&self, id: VarId) -> &Variable {
        &self.variables[id.0 as usize]
    }

    pub fn variable_mut(&mut self, id: VarId) -> &mut Variable {
        &mut self.variables[id.0 as usize]
    }

    pub fn find_type(&self, name: &str) -> Option<TypeId> {
        let sym = self.interner.lookup(name)?;
        self.types_map.get(&sym).copied()
    }

    /// Drop the variables registered past `len`, unwinding shadow links in
    /// the name map. Used by the compiler's rollback and by REPL hosts to
    /// undo a statement whose execution failed.
    pub fn drop_variables(&mut self, len: usize) {
        for i in (len..self.variables.len()).rev() {
            let var = self.variables[i];

            match var.shadow {
                Some(shadow) => {
                    self.variables_map.insert(var.name, shadow);
                }
                None => {
                    self.variables_map.remove(&var.name);
                }
            }
        }

        self.variables.truncate(len);
    }

    /// Intern a type by signature. This is the only way types are created
    /// after the base types: if a type with the same signature already
    /// exists, the existing id is returned and `type_buf` is dropped.
    pub fn insert_type(&mut self, type_buf: TypeInfo) -> TypeId {
        if let Some(&id) = self.types_map.get(&type_buf.signature) {
            return id;
        }

        let id = TypeId(self.types.len() as u32);
        self.types_map.insert(type_buf.signature, id);
        self.types.push(type_buf);

        id
    }

    /// Map a PC to a file and line, searching the function's source map (or
    /// the module source maps for main code) by binary search.
    pub fn locate(&self, func: Option<FuncId>, pc: usize) -> Option<(&str, i32)> {
        let (filename, lines) = match func {
            Some(id) => {
                let func = self.func(id);
                (func.src.filename.as_str(), &func.src.lines)
            }
            None => {
                let idx = self
                    .sources
                    .partition_point(|src| src.lines.first().is_some_and(|l| l.addr <= pc));
                if idx == 0 {
                    return None;
                }

                let src = &self.sources[idx - 1];
                (src.filename.as_str(), &src.lines)
            }
        };

        let idx = lines.partition_point(|l| l.addr <= pc);
        if idx == 0 {
            return None;
        }

        Some((filename, lines[idx - 1].line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interner_dedup() {
        let mut interner = Interner::new();

        let a = interner.intern("hello");
        let b = interner.intern("hello");
        let c = interner.intern("world");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(interner.get(a), "hello");
        assert_eq!(interner.get(c), "world");
    }

    #[test]
    fn test_interner_empty_string_is_zero() {
        let mut interner = Interner::new();
        assert_eq!(interner.intern(""), Sym(0));
    }

    #[test]
    fn test_interner_truncate() {
        let mut interner = Interner::new();

        let a = interner.intern("keep");
        let len = interner.len();
        interner.intern("drop1");
        interner.intern("drop2");

        interner.truncate(len);

        assert_eq!(interner.len(), len);
        assert_eq!(interner.lookup("drop1"), None);
        assert_eq!(interner.intern("keep"), a);
    }

    #[test]
    fn test_value_roundtrips() {
        assert_eq!(Value::int(-42).as_int(), -42);
        assert_eq!(Value::int(i64::MAX).as_int(), i64::MAX);
        assert_eq!(Value::float(3.5).as_float(), 3.5);
        assert!(Value::float(f64::NAN).as_float().is_nan());
        assert!(Value::bool(true).as_bool());
        assert!(!Value::bool(false).as_bool());
        assert_eq!(Value::ty(INT_TYPE).as_type(), INT_TYPE);
        assert_eq!(Value::func(FuncId(7)).as_func(), FuncId(7));
    }

    #[test]
    fn test_zero_value_is_every_zero() {
        let zero = Value::default();
        assert_eq!(zero.as_int(), 0);
        assert_eq!(zero.as_float(), 0.0);
        assert!(!zero.as_bool());
        assert_eq!(zero.as_sym(), Sym(0));
        assert_eq!(zero.as_type(), NULL_TYPE);
    }

    #[test]
    fn test_base_types() {
        let program = Program::new();

        assert_eq!(program.find_type("Int"), Some(INT_TYPE));
        assert_eq!(program.find_type("Float"), Some(FLOAT_TYPE));
        assert_eq!(program.signature(BOOL_TYPE), "Bool");
        assert_eq!(program.ty(NULL_TYPE).size, 0);
        assert_eq!(program.ty(INT_TYPE).size, 1);
        assert!(program.ty(INT_TYPE).init0);
    }

    #[test]
    fn test_insert_type_interns_by_signature() {
        let mut program = Program::new();

        let signature = program.intern("[3] Int");
        let buf = TypeInfo {
            signature,
            primitive: PrimitiveKind::Array,
            init0: true,
            size: 3,
            kind: TypeKind::Array(ArrayType {
                unit: INT_TYPE,
                len: 3,
            }),
        };

        let a = program.insert_type(buf.clone());
        let b = program.insert_type(buf);

        assert_eq!(a, b);
        assert_eq!(program.signature(a), "[3] Int");
    }

    #[test]
    fn test_locate_main() {
        let mut program = Program::new();

        program.sources.push(SourceMap {
            filename: "first.bk".to_string(),
            lines: vec![
                SourceLine { addr: 0, line: 0 },
                SourceLine { addr: 2, line: 1 },
                SourceLine { addr: 5, line: 2 },
            ],
        });
        program.sources.push(SourceMap {
            filename: "second.bk".to_string(),
            lines: vec![SourceLine { addr: 9, line: 1 }],
        });

        assert_eq!(program.locate(None, 3), Some(("first.bk", 1)));
        assert_eq!(program.locate(None, 5), Some(("first.bk", 2)));
        assert_eq!(program.locate(None, 12), Some(("second.bk", 1)));
    }
}
