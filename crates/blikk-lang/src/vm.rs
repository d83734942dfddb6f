//! Virtual machine for blikk IR
//!
//! A single value stack of untyped 8-byte slots and a call-frame stack.
//! Main code runs in frame 0 (`func = None`, `bp = 0`); script calls push a
//! frame and enter the callee at pc 1 (every function's IR starts with a
//! `Nop`).
//!
//! The machine is also the compiler's constant-folding engine: [`Folder`]
//! runs the just-emitted tail of the IR with errors hidden and hands the
//! result back.

use std::rc::Rc;

use crate::error::{self, RunError};
use crate::program::{
    CallFrame, FuncId, FunctionMode, Instr, Opcode, PrimitiveKind, Program, Value,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunFlags {
    /// Do not render runtime errors; used during constant folding.
    pub hide_errors: bool,
    /// Dump every executed instruction to stderr.
    pub debug: bool,
}

/// Context handed to native functions.
///
/// `args` is a contiguous view of the argument slots; for variadic natives
/// it holds the interleaved `(Type, value…)` layout, without the trailing
/// count. `ret` is a writable view of the return slots, zeroed on entry.
pub struct NativeCall<'a> {
    pub program: &'a Program,
    args: &'a [Value],
    ret: &'a mut [Value],
    run: &'a mut bool,
}

impl NativeCall<'_> {
    pub fn args(&self) -> &[Value] {
        self.args
    }

    pub fn ret_mut(&mut self) -> &mut [Value] {
        self.ret
    }

    /// Stop the current `run` as if a clean `End` had been reached.
    pub fn interrupt(&mut self) {
        *self.run = false;
    }
}

pub type NativeFunction = Rc<dyn Fn(&mut NativeCall<'_>) -> Result<(), String>>;

pub struct VirtualMachine {
    pub frames: Vec<CallFrame>,
    pub stack: Vec<Value>,

    run: bool,
    error: bool,
    report: bool,
}

impl Default for VirtualMachine {
    fn default() -> Self {
        VirtualMachine::new()
    }
}

impl VirtualMachine {
    pub fn new() -> VirtualMachine {
        VirtualMachine {
            frames: vec![CallFrame::default()],
            stack: Vec::new(),
            run: false,
            error: false,
            report: false,
        }
    }

    /// Request an interrupt; the dispatch loop polls the flag and exits as
    /// if a clean `End` was reached.
    pub fn set_interrupt(&mut self) {
        self.run = false;
    }

    pub fn run(&mut self, program: &Program, flags: RunFlags) -> Result<(), RunError> {
        self.report = !flags.hide_errors;
        self.run = true;
        self.error = false;

        let mut frame_idx = self.frames.len() - 1;
        let mut pc = self.frames[frame_idx].pc;
        let mut bp = self.frames[frame_idx].bp;
        let mut cur_func = self.frames[frame_idx].func;

        macro_rules! fatal {
            ($($arg:tt)*) => {{
                self.frames[frame_idx].pc = pc;
                return Err(self.fatal(program, format!($($arg)*)));
            }};
        }

        macro_rules! load {
            ($idx:expr) => {{
                let idx = $idx;
                match self.stack.get(idx) {
                    Some(&v) => v,
                    None => fatal!("Out-of-bounds stack access"),
                }
            }};
        }

        macro_rules! store {
            ($idx:expr, $value:expr) => {{
                let idx = $idx;
                let value = $value;
                match self.stack.get_mut(idx) {
                    Some(slot) => *slot = value,
                    None => fatal!("Out-of-bounds stack access"),
                }
            }};
        }

        macro_rules! binary_int {
            ($op:expr) => {{
                let i2 = self.stack.pop().unwrap().as_int();
                let top = self.stack.last_mut().unwrap();
                let i1 = top.as_int();
                *top = Value::int($op(i1, i2));
                pc += 1;
            }};
        }

        macro_rules! compare_int {
            ($op:expr) => {{
                let i2 = self.stack.pop().unwrap().as_int();
                let top = self.stack.last_mut().unwrap();
                let i1 = top.as_int();
                *top = Value::bool($op(&i1, &i2));
                pc += 1;
            }};
        }

        macro_rules! binary_float {
            ($op:expr) => {{
                let d2 = self.stack.pop().unwrap().as_float();
                let top = self.stack.last_mut().unwrap();
                let d1 = top.as_float();
                *top = Value::float($op(d1, d2));
                pc += 1;
            }};
        }

        macro_rules! compare_float {
            ($op:expr) => {{
                let d2 = self.stack.pop().unwrap().as_float();
                let top = self.stack.last_mut().unwrap();
                let d1 = top.as_float();
                *top = Value::bool($op(&d1, &d2));
                pc += 1;
            }};
        }

        macro_rules! compare_bits {
            ($eq:expr) => {{
                let v2 = self.stack.pop().unwrap();
                let top = self.stack.last_mut().unwrap();
                let v1 = *top;
                *top = Value::bool((v1 == v2) == $eq);
                pc += 1;
            }};
        }

        'dispatch: loop {
            let ir: &[Instr] = match cur_func {
                Some(id) => &program.func(id).ir,
                None => &program.ir,
            };
            debug_assert!(pc < ir.len());

            loop {
                let inst = ir[pc];

                if flags.debug {
                    self.dump_instruction(program, &inst, pc, bp);
                }

                match inst.code {
                    Opcode::Nop => {
                        pc += 1;
                    }

                    Opcode::Push => {
                        self.stack.push(inst.u);
                        pc += 1;
                    }
                    Opcode::PushZero => {
                        let count = inst.u.as_int() as usize;
                        self.stack.resize(self.stack.len() + count, Value::NULL);
                        pc += 1;
                    }
                    Opcode::PushBig => {
                        let count = inst.u.as_int() as usize;
                        let ptr = self.stack.pop().unwrap().as_int() as usize;
                        self.stack.extend_from_slice(&program.ro[ptr..ptr + count]);
                        pc += 1;
                    }
                    Opcode::Pop => {
                        let count = inst.u.as_int() as usize;
                        self.stack.truncate(self.stack.len() - count);
                        pc += 1;
                    }

                    Opcode::Lea => {
                        self.stack.push(inst.u);
                        pc += 1;
                    }
                    Opcode::LeaLocal => {
                        self.stack.push(Value::int(bp as i64 + inst.u.as_int()));
                        pc += 1;
                    }
                    Opcode::LeaRel => {
                        self.stack
                            .push(Value::int(self.stack.len() as i64 + inst.u.as_int()));
                        pc += 1;
                    }
                    Opcode::Load => {
                        let v = load!(inst.u.as_int() as usize);
                        self.stack.push(v);
                        pc += 1;
                    }
                    Opcode::LoadLocal => {
                        let v = load!((bp as i64 + inst.u.as_int()) as usize);
                        self.stack.push(v);
                        pc += 1;
                    }
                    Opcode::LoadIndirect => {
                        let count = inst.u.as_int() as usize;
                        let ptr = self.stack.pop().unwrap().as_int() as usize;
                        for i in 0..count {
                            let v = load!(ptr + i);
                            self.stack.push(v);
                        }
                        pc += 1;
                    }
                    Opcode::LoadIndirectK => {
                        let count = inst.u.as_int() as usize;
                        let ptr = self.stack.last().unwrap().as_int() as usize;
                        for i in 0..count {
                            let v = load!(ptr + i);
                            self.stack.push(v);
                        }
                        pc += 1;
                    }
                    Opcode::Store => {
                        let v = self.stack.pop().unwrap();
                        store!(inst.u.as_int() as usize, v);
                        pc += 1;
                    }
                    Opcode::StoreK => {
                        let v = *self.stack.last().unwrap();
                        store!(inst.u.as_int() as usize, v);
                        pc += 1;
                    }
                    Opcode::StoreLocal => {
                        let v = self.stack.pop().unwrap();
                        store!((bp as i64 + inst.u.as_int()) as usize, v);
                        pc += 1;
                    }
                    Opcode::StoreLocalK => {
                        let v = *self.stack.last().unwrap();
                        store!((bp as i64 + inst.u.as_int()) as usize, v);
                        pc += 1;
                    }
                    Opcode::StoreIndirect => {
                        let count = inst.u.as_int() as usize;
                        let len = self.stack.len();
                        let ptr = load!(len - count - 1).as_int() as usize;
                        let src = len - count;
                        for i in (0..count).rev() {
                            let v = self.stack[src + i];
                            store!(ptr + i, v);
                        }
                        self.stack.truncate(len - count - 1);
                        pc += 1;
                    }
                    Opcode::StoreIndirectK => {
                        // Same as StoreIndirect, but the stored values stay
                        // on the stack (shifted down over the address slot).
                        let count = inst.u.as_int() as usize;
                        let len = self.stack.len();
                        let ptr = load!(len - count - 1).as_int() as usize;
                        let src = len - count;
                        for i in (0..count).rev() {
                            let v = self.stack[src + i];
                            store!(ptr + i, v);
                            self.stack[src + i - 1] = v;
                        }
                        self.stack.truncate(len - 1);
                        pc += 1;
                    }
                    Opcode::StoreRev => {
                        let count = inst.u.as_int() as usize;
                        let ptr = self.stack.pop().unwrap().as_int() as usize;
                        let src = self.stack.len() - count;
                        for i in (0..count).rev() {
                            let v = self.stack[src + i];
                            store!(ptr + i, v);
                        }
                        self.stack.truncate(src);
                        pc += 1;
                    }
                    Opcode::StoreRevK => {
                        let count = inst.u.as_int() as usize;
                        let ptr = self.stack.pop().unwrap().as_int() as usize;
                        let src = self.stack.len() - count;
                        for i in (0..count).rev() {
                            let v = self.stack[src + i];
                            store!(ptr + i, v);
                        }
                        pc += 1;
                    }
                    Opcode::CheckIndex => {
                        let len = inst.u.as_int();
                        let idx = self.stack.last().unwrap().as_int();
                        if idx < 0 || idx >= len {
                            fatal!("Index is out of range: {} (array length {})", idx, len);
                        }
                        pc += 1;
                    }

                    Opcode::NegateInt => {
                        let top = self.stack.last_mut().unwrap();
                        *top = Value::int(top.as_int().wrapping_neg());
                        pc += 1;
                    }
                    Opcode::AddInt => binary_int!(i64::wrapping_add),
                    Opcode::SubstractInt => binary_int!(i64::wrapping_sub),
                    Opcode::MultiplyInt => binary_int!(i64::wrapping_mul),
                    Opcode::DivideInt => {
                        let i2 = self.stack.pop().unwrap().as_int();
                        if i2 == 0 {
                            fatal!("Integer division by 0 is illegal");
                        }
                        let top = self.stack.last_mut().unwrap();
                        *top = Value::int(top.as_int().wrapping_div(i2));
                        pc += 1;
                    }
                    Opcode::ModuloInt => {
                        let i2 = self.stack.pop().unwrap().as_int();
                        if i2 == 0 {
                            fatal!("Integer division by 0 is illegal");
                        }
                        let top = self.stack.last_mut().unwrap();
                        *top = Value::int(top.as_int().wrapping_rem(i2));
                        pc += 1;
                    }
                    Opcode::EqualInt => compare_int!(i64::eq),
                    Opcode::NotEqualInt => compare_int!(i64::ne),
                    Opcode::GreaterThanInt => compare_int!(i64::gt),
                    Opcode::GreaterOrEqualInt => compare_int!(i64::ge),
                    Opcode::LessThanInt => compare_int!(i64::lt),
                    Opcode::LessOrEqualInt => compare_int!(i64::le),
                    Opcode::AndInt => binary_int!(|a, b| a & b),
                    Opcode::OrInt => binary_int!(|a, b| a | b),
                    Opcode::XorInt => binary_int!(|a, b| a ^ b),
                    Opcode::ComplementInt => {
                        let top = self.stack.last_mut().unwrap();
                        *top = Value::int(!top.as_int());
                        pc += 1;
                    }
                    Opcode::LeftShiftInt => {
                        let i2 = self.stack.pop().unwrap().as_int();
                        let top = self.stack.last_mut().unwrap();
                        if i2 >= 64 {
                            *top = Value::int(0);
                        } else if i2 >= 0 {
                            *top = Value::int(((top.as_int() as u64) << i2) as i64);
                        } else {
                            fatal!("Left-shift by negative value is illegal");
                        }
                        pc += 1;
                    }
                    Opcode::RightShiftInt => {
                        let i2 = self.stack.pop().unwrap().as_int();
                        let top = self.stack.last_mut().unwrap();
                        if i2 >= 64 {
                            *top = Value::int(0);
                        } else if i2 >= 0 {
                            *top = Value::int(((top.as_int() as u64) >> i2) as i64);
                        } else {
                            fatal!("Right-shift by negative value is illegal");
                        }
                        pc += 1;
                    }
                    Opcode::LeftRotateInt => {
                        let i2 = self.stack.pop().unwrap().as_int() % 64;
                        if i2 < 0 {
                            fatal!("Left-rotate by negative value is illegal");
                        }
                        let top = self.stack.last_mut().unwrap();
                        *top = Value::int((top.as_int() as u64).rotate_left(i2 as u32) as i64);
                        pc += 1;
                    }
                    Opcode::RightRotateInt => {
                        let i2 = self.stack.pop().unwrap().as_int() % 64;
                        if i2 < 0 {
                            fatal!("Right-rotate by negative value is illegal");
                        }
                        let top = self.stack.last_mut().unwrap();
                        *top = Value::int((top.as_int() as u64).rotate_right(i2 as u32) as i64);
                        pc += 1;
                    }

                    Opcode::NegateFloat => {
                        let top = self.stack.last_mut().unwrap();
                        *top = Value::float(-top.as_float());
                        pc += 1;
                    }
                    Opcode::AddFloat => binary_float!(|a, b| a + b),
                    Opcode::SubstractFloat => binary_float!(|a, b| a - b),
                    Opcode::MultiplyFloat => binary_float!(|a, b| a * b),
                    Opcode::DivideFloat => binary_float!(|a, b| a / b),
                    Opcode::EqualFloat => compare_float!(f64::eq),
                    Opcode::NotEqualFloat => compare_float!(f64::ne),
                    Opcode::GreaterThanFloat => compare_float!(f64::gt),
                    Opcode::GreaterOrEqualFloat => compare_float!(f64::ge),
                    Opcode::LessThanFloat => compare_float!(f64::lt),
                    Opcode::LessOrEqualFloat => compare_float!(f64::le),

                    Opcode::EqualBool => compare_bits!(true),
                    Opcode::NotEqualBool => compare_bits!(false),
                    Opcode::NotBool => {
                        let top = self.stack.last_mut().unwrap();
                        *top = Value::bool(!top.as_bool());
                        pc += 1;
                    }
                    Opcode::AndBool => {
                        let b2 = self.stack.pop().unwrap().as_bool();
                        let top = self.stack.last_mut().unwrap();
                        *top = Value::bool(top.as_bool() && b2);
                        pc += 1;
                    }
                    Opcode::OrBool => {
                        let b2 = self.stack.pop().unwrap().as_bool();
                        let top = self.stack.last_mut().unwrap();
                        *top = Value::bool(top.as_bool() || b2);
                        pc += 1;
                    }

                    // Strings are interned, types and functions are ids;
                    // bit equality is semantic equality for all of them.
                    Opcode::EqualString
                    | Opcode::EqualType
                    | Opcode::EqualFunc
                    | Opcode::EqualEnum => compare_bits!(true),
                    Opcode::NotEqualString
                    | Opcode::NotEqualType
                    | Opcode::NotEqualFunc
                    | Opcode::NotEqualEnum => compare_bits!(false),

                    Opcode::Jump => {
                        pc = (pc as i64 + inst.u.as_int()) as usize;
                    }
                    Opcode::BranchIfTrue => {
                        let b = self.stack.pop().unwrap().as_bool();
                        pc = if b {
                            (pc as i64 + inst.u.as_int()) as usize
                        } else {
                            pc + 1
                        };
                    }
                    Opcode::BranchIfFalse => {
                        let b = self.stack.pop().unwrap().as_bool();
                        pc = if b {
                            pc + 1
                        } else {
                            (pc as i64 + inst.u.as_int()) as usize
                        };
                    }
                    Opcode::SkipIfTrue => {
                        let b = self.stack.last().unwrap().as_bool();
                        pc = if b {
                            (pc as i64 + inst.u.as_int()) as usize
                        } else {
                            pc + 1
                        };
                    }
                    Opcode::SkipIfFalse => {
                        let b = self.stack.last().unwrap().as_bool();
                        pc = if b {
                            pc + 1
                        } else {
                            (pc as i64 + inst.u.as_int()) as usize
                        };
                    }

                    Opcode::Call => {
                        let func_id = inst.u.as_func();
                        let func = program.func(func_id);

                        if !func.valid {
                            fatal!(
                                "Calling invalid function '{}'",
                                program.str_of(func.prototype)
                            );
                        }

                        self.frames[frame_idx].pc = pc;

                        match func.mode {
                            FunctionMode::Script => {
                                let params_size = program.ty(func.ty).as_function().params_size;
                                let new_bp = self.stack.len() - params_size;

                                self.frames.push(CallFrame {
                                    func: Some(func_id),
                                    pc: 1,
                                    bp: new_bp,
                                    direct: true,
                                });
                                frame_idx += 1;
                                pc = 1; // Skip NOP
                                bp = new_bp;
                                cur_func = Some(func_id);

                                continue 'dispatch;
                            }
                            FunctionMode::Native => {
                                self.frames.push(CallFrame {
                                    func: Some(func_id),
                                    pc: 0,
                                    bp: 0,
                                    direct: true,
                                });
                                self.call_native(program, func_id, true)?;

                                if !self.run {
                                    self.frames[frame_idx].pc = pc;
                                    return Ok(());
                                }

                                pc += 1;
                            }
                            FunctionMode::Intrinsic | FunctionMode::Record => {
                                unreachable!("direct call to intrinsic or record constructor")
                            }
                        }
                    }
                    Opcode::CallIndirect => {
                        let slot = (self.stack.len() as i64 + inst.u.as_int()) as usize;
                        let func_id = self.stack[slot].as_func();
                        let func = program.func(func_id);

                        if !func.valid {
                            fatal!(
                                "Calling invalid function '{}'",
                                program.str_of(func.prototype)
                            );
                        }

                        match func.mode {
                            FunctionMode::Record => {
                                // The arguments build the object, nothing
                                // else to do.
                                pc += 1;
                            }
                            FunctionMode::Script => {
                                self.frames[frame_idx].pc = pc;

                                let params_size = program.ty(func.ty).as_function().params_size;
                                let new_bp = self.stack.len() - params_size;

                                self.frames.push(CallFrame {
                                    func: Some(func_id),
                                    pc: 1,
                                    bp: new_bp,
                                    direct: false,
                                });
                                frame_idx += 1;
                                pc = 1; // Skip NOP
                                bp = new_bp;
                                cur_func = Some(func_id);

                                continue 'dispatch;
                            }
                            FunctionMode::Native => {
                                self.frames[frame_idx].pc = pc;
                                self.frames.push(CallFrame {
                                    func: Some(func_id),
                                    pc: 0,
                                    bp: 0,
                                    direct: false,
                                });
                                self.call_native(program, func_id, false)?;

                                if !self.run {
                                    self.frames[frame_idx].pc = pc;
                                    return Ok(());
                                }

                                pc += 1;
                            }
                            FunctionMode::Intrinsic => {
                                unreachable!("indirect call to intrinsic")
                            }
                        }
                    }
                    Opcode::Return => {
                        let count = inst.u.as_int() as usize;
                        let src = self.stack.len() - count;
                        let direct = self.frames[frame_idx].direct;
                        let base = bp + direct as usize - 1;

                        self.stack.copy_within(src..src + count, base);
                        self.stack.truncate(base + count);

                        self.frames.pop();
                        frame_idx -= 1;

                        let frame = self.frames[frame_idx];
                        pc = frame.pc + 1;
                        bp = frame.bp;
                        cur_func = frame.func;

                        continue 'dispatch;
                    }

                    Opcode::IntToFloat => {
                        let top = self.stack.last_mut().unwrap();
                        *top = Value::float(top.as_int() as f64);
                        pc += 1;
                    }
                    Opcode::FloatToInt => {
                        let top = self.stack.last_mut().unwrap();
                        *top = Value::int(top.as_float() as i64);
                        pc += 1;
                    }

                    Opcode::InlineIf => {
                        let len = self.stack.len();
                        let b = self.stack[len - 3].as_bool();
                        self.stack[len - 3] = if b {
                            self.stack[len - 2]
                        } else {
                            self.stack[len - 1]
                        };
                        self.stack.truncate(len - 2);
                        pc += 1;
                    }

                    Opcode::End => {
                        debug_assert_eq!(self.stack.len() as i64, inst.u.as_int());

                        pc += 1;
                        self.frames[frame_idx].pc = pc;
                        return Ok(());
                    }
                }

                if !self.run {
                    self.frames[frame_idx].pc = pc;
                    return if self.error {
                        Err(RunError {
                            message: "Execution stopped".to_string(),
                        })
                    } else {
                        Ok(())
                    };
                }
            }
        }
    }

    fn call_native(
        &mut self,
        program: &Program,
        func_id: FuncId,
        direct: bool,
    ) -> Result<(), RunError> {
        let func = program.func(func_id);
        let func_type = program.ty(func.ty).as_function();
        let ret_size = program.ty(func_type.ret).size;
        let params_size = func_type.params_size;

        let old_len = self.stack.len();
        self.stack.resize(old_len + ret_size, Value::NULL);

        let (args_start, args_end) = if func_type.variadic {
            let variadic = self.stack[old_len - 1].as_int() as usize;
            (old_len - 1 - params_size - variadic, old_len - 1)
        } else {
            (old_len - params_size, old_len)
        };

        let native = func
            .native
            .clone()
            .expect("native function without handler");

        let result = {
            let VirtualMachine { stack, run, .. } = self;
            let (below, above) = stack.split_at_mut(old_len);
            let mut call = NativeCall {
                program,
                args: &below[args_start..args_end],
                ret: &mut above[..ret_size],
                run,
            };

            native(&mut call)
        };

        if let Err(message) = result {
            let err = self.fatal(program, message);
            self.frames.pop();
            return Err(err);
        }

        // Copy the return slots down over the consumed arguments (and the
        // function-pointer slot for indirect calls).
        let dest = args_start + direct as usize - 1;
        self.stack.copy_within(old_len..old_len + ret_size, dest);
        self.stack.truncate(dest + ret_size);

        self.frames.pop();
        Ok(())
    }

    fn fatal(&mut self, program: &Program, message: String) -> RunError {
        if self.report {
            error::report_runtime_error(program, &self.frames, &message);
        }

        self.run = false;
        self.error = true;

        RunError { message }
    }

    fn dump_instruction(&self, program: &Program, inst: &Instr, pc: usize, bp: usize) {
        let pad = "  ".repeat(self.frames.len().saturating_sub(1));
        let len = self.stack.len();

        eprint!("[0x{:06X}] {}{:?}", pc, pad, inst.code);

        match inst.code {
            Opcode::Push => match inst.primitive {
                PrimitiveKind::Bool => eprintln!(" [Bool] {} >{}", inst.u.as_bool(), len),
                PrimitiveKind::Int => eprintln!(" [Int] {} >{}", inst.u.as_int(), len),
                PrimitiveKind::Float => eprintln!(" [Float] {} >{}", inst.u.as_float(), len),
                PrimitiveKind::String => {
                    eprintln!(" [String] '{}' >{}", program.str_of(inst.u.as_sym()), len);
                }
                PrimitiveKind::Type => {
                    eprintln!(" [Type] '{}' >{}", program.signature(inst.u.as_type()), len);
                }
                PrimitiveKind::Function => {
                    let func = program.func(inst.u.as_func());
                    eprintln!(" [Function] '{}' >{}", program.str_of(func.prototype), len);
                }
                PrimitiveKind::Enum => eprintln!(" [Enum] {} >{}", inst.u.as_int(), len),
                PrimitiveKind::Opaque => {
                    eprintln!(" [Opaque] 0x{:X} >{}", inst.u.as_opaque(), len);
                }
                _ => eprintln!(" >{}", len),
            },
            Opcode::PushZero | Opcode::PushBig | Opcode::LoadIndirect | Opcode::LoadIndirectK => {
                eprintln!(" |{} >{}", inst.u.as_int(), len);
            }
            Opcode::Pop => eprintln!(" {}", inst.u.as_int()),
            Opcode::Lea | Opcode::Load => eprintln!(" @{} >{}", inst.u.as_int(), len),
            Opcode::LeaLocal | Opcode::LoadLocal => {
                eprintln!(" @{} >{}", bp as i64 + inst.u.as_int(), len);
            }
            Opcode::LeaRel => eprintln!(" @{} >{}", len as i64 + inst.u.as_int(), len),
            Opcode::Store | Opcode::StoreK => eprintln!(" >{}", inst.u.as_int()),
            Opcode::StoreLocal | Opcode::StoreLocalK => {
                eprintln!(" >{}", bp as i64 + inst.u.as_int());
            }
            Opcode::StoreIndirect | Opcode::StoreIndirectK | Opcode::StoreRev
            | Opcode::StoreRevK => eprintln!(" |{}", inst.u.as_int()),
            Opcode::CheckIndex => eprintln!(" < {}", inst.u.as_int()),
            Opcode::Jump
            | Opcode::BranchIfTrue
            | Opcode::BranchIfFalse
            | Opcode::SkipIfTrue
            | Opcode::SkipIfFalse => {
                eprintln!(" 0x{:06X}", pc as i64 + inst.u.as_int());
            }
            Opcode::Call => {
                let func = program.func(inst.u.as_func());
                eprintln!(" '{}'", program.str_of(func.prototype));
            }
            Opcode::CallIndirect => eprintln!(" @{}", len as i64 + inst.u.as_int()),
            Opcode::Return => eprintln!(" {}", inst.u.as_int()),
            Opcode::End => eprintln!(" ({})", inst.u.as_int()),
            _ => eprintln!(),
        }
    }
}

/// Constant-folding engine: a private VM the compiler points at the tail of
/// the IR it just emitted.
pub(crate) struct Folder {
    vm: VirtualMachine,
}

impl Folder {
    pub(crate) fn new() -> Folder {
        Folder {
            vm: VirtualMachine::new(),
        }
    }

    /// Execute main IR from `tail_start`; the tail must already be
    /// terminated by an `End` whose operand is `expected_size`. Returns the
    /// computed value on success (`Value::NULL` for zero-sized results),
    /// `None` if execution trapped.
    pub(crate) fn try_eval_tail(
        &mut self,
        program: &Program,
        tail_start: usize,
        expected_size: usize,
    ) -> Option<Value> {
        self.vm.frames.truncate(1);
        self.vm.frames[0] = CallFrame {
            func: None,
            pc: tail_start,
            bp: 0,
            direct: false,
        };
        self.vm.stack.clear();

        let flags = RunFlags {
            hide_errors: true,
            debug: false,
        };

        match self.vm.run(program, flags) {
            Ok(()) if expected_size == 0 => Some(Value::NULL),
            Ok(()) => self.vm.stack.last().copied(),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{INT_TYPE, NULL_TYPE};

    fn int_push(v: i64) -> Instr {
        Instr::push(PrimitiveKind::Int, Value::int(v))
    }

    fn run_main(instrs: Vec<Instr>) -> (VirtualMachine, Result<(), RunError>) {
        let mut program = Program::new();
        program.ir = instrs;

        let mut vm = VirtualMachine::new();
        let result = vm.run(&program, RunFlags {
            hide_errors: true,
            debug: false,
        });

        (vm, result)
    }

    #[test]
    fn test_integer_arithmetic() {
        let (vm, result) = run_main(vec![
            int_push(7),
            int_push(3),
            Instr::op(Opcode::MultiplyInt),
            int_push(1),
            Instr::op(Opcode::SubstractInt),
            Instr::imm(Opcode::End, 1),
        ]);

        result.unwrap();
        assert_eq!(vm.stack.last().unwrap().as_int(), 20);
    }

    #[test]
    fn test_divide_by_zero_traps() {
        let (_, result) = run_main(vec![
            int_push(1),
            int_push(0),
            Instr::op(Opcode::DivideInt),
            Instr::imm(Opcode::End, 1),
        ]);

        let err = result.unwrap_err();
        assert!(err.message.contains("division by 0"));
    }

    #[test]
    fn test_negative_shift_traps() {
        let (_, result) = run_main(vec![
            int_push(1),
            int_push(-2),
            Instr::op(Opcode::LeftShiftInt),
            Instr::imm(Opcode::End, 1),
        ]);

        assert!(result.unwrap_err().message.contains("negative"));
    }

    #[test]
    fn test_oversized_shift_is_zero() {
        let (vm, result) = run_main(vec![
            int_push(123),
            int_push(64),
            Instr::op(Opcode::RightShiftInt),
            Instr::imm(Opcode::End, 1),
        ]);

        result.unwrap();
        assert_eq!(vm.stack.last().unwrap().as_int(), 0);
    }

    #[test]
    fn test_rotate() {
        let (vm, result) = run_main(vec![
            int_push(1),
            int_push(65),
            Instr::op(Opcode::LeftRotateInt),
            Instr::imm(Opcode::End, 1),
        ]);

        result.unwrap();
        assert_eq!(vm.stack.last().unwrap().as_int(), 2);
    }

    #[test]
    fn test_branch_if_false() {
        // if (false) push 1 else push 2
        let (vm, result) = run_main(vec![
            Instr::push(PrimitiveKind::Bool, Value::bool(false)),
            Instr::imm(Opcode::BranchIfFalse, 3),
            int_push(1),
            Instr::imm(Opcode::Jump, 2),
            int_push(2),
            Instr::imm(Opcode::End, 1),
        ]);

        result.unwrap();
        assert_eq!(vm.stack.last().unwrap().as_int(), 2);
    }

    #[test]
    fn test_skip_keeps_operand() {
        let (vm, result) = run_main(vec![
            Instr::push(PrimitiveKind::Bool, Value::bool(false)),
            Instr::imm(Opcode::SkipIfFalse, 3),
            Instr::push(PrimitiveKind::Bool, Value::bool(true)),
            Instr::op(Opcode::AndBool),
            Instr::imm(Opcode::End, 1),
        ]);

        result.unwrap();
        assert!(!vm.stack.last().unwrap().as_bool());
    }

    #[test]
    fn test_check_index_traps() {
        let (_, result) = run_main(vec![
            int_push(5),
            Instr::imm(Opcode::CheckIndex, 4),
            Instr::imm(Opcode::End, 1),
        ]);

        assert!(result.unwrap_err().message.contains("out of range"));
    }

    #[test]
    fn test_indirect_load_store() {
        // Store 99 at stack[0] through its address, then load it back.
        let (vm, result) = run_main(vec![
            int_push(10),
            int_push(20),
            int_push(99),
            Instr::imm(Opcode::Lea, 0),
            Instr::imm(Opcode::StoreRev, 1),
            Instr::imm(Opcode::Lea, 0),
            Instr::imm(Opcode::LoadIndirect, 1),
            Instr::imm(Opcode::End, 3),
        ]);

        result.unwrap();
        assert_eq!(vm.stack[0].as_int(), 99);
        assert_eq!(vm.stack[2].as_int(), 99);
    }

    #[test]
    fn test_out_of_bounds_load_traps() {
        let (_, result) = run_main(vec![
            Instr::imm(Opcode::Load, 57),
            Instr::imm(Opcode::End, 1),
        ]);

        assert!(result.unwrap_err().message.contains("Out-of-bounds"));
    }

    #[test]
    fn test_script_call_and_return() {
        // func double(n) -> n + n, called with 21
        let mut program = Program::new();

        let name = program.intern("double");
        let proto = program.intern("double(n: Int): Int");
        let signature = program.intern("func (Int): Int");

        let func_ty = program.insert_type(crate::program::TypeInfo {
            signature,
            primitive: PrimitiveKind::Function,
            init0: false,
            size: 1,
            kind: crate::program::TypeKind::Function(crate::program::FunctionType {
                params: vec![INT_TYPE],
                params_size: 1,
                variadic: false,
                ret: INT_TYPE,
            }),
        });

        let func_id = FuncId(0);
        program.functions.push(crate::program::Function {
            name,
            prototype: proto,
            ty: func_ty,
            params: Vec::new(),
            mode: FunctionMode::Script,
            native: None,
            ir: vec![
                Instr::op(Opcode::Nop),
                Instr::imm(Opcode::LoadLocal, 0),
                Instr::imm(Opcode::LoadLocal, 0),
                Instr::op(Opcode::AddInt),
                Instr::imm(Opcode::Return, 1),
            ],
            src: Default::default(),
            tre: false,
            valid: true,
            impure: false,
            side_effects: false,
            overload_prev: func_id,
            overload_next: func_id,
        });

        program.ir = vec![
            int_push(21),
            Instr {
                code: Opcode::Call,
                primitive: PrimitiveKind::Null,
                u: Value::func(func_id),
            },
            Instr::imm(Opcode::End, 1),
        ];

        let mut vm = VirtualMachine::new();
        vm.run(&program, RunFlags::default()).unwrap();

        assert_eq!(vm.stack.last().unwrap().as_int(), 42);
        assert_eq!(vm.frames.len(), 1);
    }

    #[test]
    fn test_folder_evaluates_tail() {
        let mut program = Program::new();
        program.ir = vec![
            int_push(6),
            int_push(7),
            Instr::op(Opcode::MultiplyInt),
            Instr::imm(Opcode::End, 1),
        ];

        let mut folder = Folder::new();
        let value = folder.try_eval_tail(&program, 0, 1).unwrap();

        assert_eq!(value.as_int(), 42);
    }

    #[test]
    fn test_folder_swallows_traps() {
        let mut program = Program::new();
        program.ir = vec![
            int_push(1),
            int_push(0),
            Instr::op(Opcode::DivideInt),
            Instr::imm(Opcode::End, 1),
        ];

        let mut folder = Folder::new();
        assert!(folder.try_eval_tail(&program, 0, 1).is_none());
    }

    #[test]
    fn test_end_saves_pc_for_resume() {
        let mut program = Program::new();
        program.ir = vec![int_push(1), Instr::imm(Opcode::End, 1)];

        let mut vm = VirtualMachine::new();
        vm.run(&program, RunFlags::default()).unwrap();
        assert_eq!(vm.frames[0].pc, 2);

        // Append more code, as the REPL does, and resume.
        program.ir.push(int_push(2));
        program.ir.push(Instr::imm(Opcode::End, 2));

        vm.run(&program, RunFlags::default()).unwrap();
        assert_eq!(vm.stack.len(), 2);
        assert_eq!(vm.stack[1].as_int(), 2);
    }

    #[test]
    fn test_interrupting_native() {
        let mut program = Program::new();

        let name = program.intern("stop");
        let proto = program.intern("stop()");
        let signature = program.intern("func ()");

        let func_ty = program.insert_type(crate::program::TypeInfo {
            signature,
            primitive: PrimitiveKind::Function,
            init0: false,
            size: 1,
            kind: crate::program::TypeKind::Function(crate::program::FunctionType {
                params: Vec::new(),
                params_size: 0,
                variadic: false,
                ret: NULL_TYPE,
            }),
        });

        let func_id = FuncId(0);
        program.functions.push(crate::program::Function {
            name,
            prototype: proto,
            ty: func_ty,
            params: Vec::new(),
            mode: FunctionMode::Native,
            native: Some(Rc::new(|call: &mut NativeCall<'_>| {
                call.interrupt();
                Ok(())
            })),
            ir: Vec::new(),
            src: Default::default(),
            tre: false,
            valid: true,
            impure: true,
            side_effects: true,
            overload_prev: func_id,
            overload_next: func_id,
        });

        program.ir = vec![
            Instr {
                code: Opcode::Call,
                primitive: PrimitiveKind::Null,
                u: Value::func(func_id),
            },
            int_push(1),
            Instr::imm(Opcode::End, 1),
        ];

        let mut vm = VirtualMachine::new();
        // The interrupt makes run() exit cleanly before pushing 1.
        vm.run(&program, RunFlags::default()).unwrap();
        assert!(vm.stack.is_empty());
    }
}
