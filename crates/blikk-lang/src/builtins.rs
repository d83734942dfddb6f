//! Standard library registration
//!
//! Groups of native functions a host can import into a compiler: printing,
//! math and randomness. Hosts embedding blikk for their own purposes can
//! pick the groups they want, or none.

use std::fmt::Write as _;
use std::io::Write as _;
use std::rc::Rc;

use rand::Rng;

use crate::compiler::{Compiler, FunctionFlags};
use crate::program::{FLOAT_TYPE, PrimitiveKind, Program, TypeId, Value};
use crate::vm::NativeFunction;

pub fn import_all(compiler: &mut Compiler, program: &mut Program) {
    import_print(compiler, program);
    import_math(compiler, program);
    import_random(compiler, program);
}

pub fn import_print(compiler: &mut Compiler, program: &mut Program) {
    compiler.add_function(program, "print(...)", FunctionFlags::default(), print_native(false, false));
    compiler.add_function(program, "printLn(...)", FunctionFlags::default(), print_native(false, true));

    // Like printLn but strings are quoted, with control characters escaped
    compiler.add_function(program, "debug(...)", FunctionFlags::default(), print_native(true, true));
}

pub fn import_math(compiler: &mut Compiler, program: &mut Program) {
    compiler.add_global(program, "PI", FLOAT_TYPE, &[Value::float(std::f64::consts::PI)], false);
    compiler.add_global(program, "E", FLOAT_TYPE, &[Value::float(std::f64::consts::E)], false);
    compiler.add_global(program, "TAU", FLOAT_TYPE, &[Value::float(std::f64::consts::TAU)], false);

    compiler.add_function(program, "isNormal(Float): Bool", FunctionFlags::PURE, float_predicate(f64::is_normal));
    compiler.add_function(program, "isInfinity(Float): Bool", FunctionFlags::PURE, float_predicate(f64::is_infinite));
    compiler.add_function(program, "isNaN(Float): Bool", FunctionFlags::PURE, float_predicate(f64::is_nan));

    compiler.add_function(program, "ceil(Float): Float", FunctionFlags::PURE, unary_float(f64::ceil));
    compiler.add_function(program, "floor(Float): Float", FunctionFlags::PURE, unary_float(f64::floor));
    compiler.add_function(program, "round(Float): Float", FunctionFlags::PURE, unary_float(f64::round));
    compiler.add_function(program, "abs(Float): Float", FunctionFlags::PURE, unary_float(f64::abs));

    compiler.add_function(program, "exp(Float): Float", FunctionFlags::PURE, unary_float(f64::exp));
    compiler.add_function(program, "ln(Float): Float", FunctionFlags::PURE, unary_float(f64::ln));
    compiler.add_function(program, "log2(Float): Float", FunctionFlags::PURE, unary_float(f64::log2));
    compiler.add_function(program, "log10(Float): Float", FunctionFlags::PURE, unary_float(f64::log10));
    compiler.add_function(program, "pow(Float, Float): Float", FunctionFlags::PURE, binary_float(f64::powf));
    compiler.add_function(program, "sqrt(Float): Float", FunctionFlags::PURE, unary_float(f64::sqrt));
    compiler.add_function(program, "cbrt(Float): Float", FunctionFlags::PURE, unary_float(f64::cbrt));

    compiler.add_function(program, "cos(Float): Float", FunctionFlags::PURE, unary_float(f64::cos));
    compiler.add_function(program, "sin(Float): Float", FunctionFlags::PURE, unary_float(f64::sin));
    compiler.add_function(program, "tan(Float): Float", FunctionFlags::PURE, unary_float(f64::tan));
    compiler.add_function(program, "acos(Float): Float", FunctionFlags::PURE, unary_float(f64::acos));
    compiler.add_function(program, "asin(Float): Float", FunctionFlags::PURE, unary_float(f64::asin));
    compiler.add_function(program, "atan(Float): Float", FunctionFlags::PURE, unary_float(f64::atan));
    compiler.add_function(program, "atan2(Float, Float): Float", FunctionFlags::PURE, binary_float(f64::atan2));
}

pub fn import_random(compiler: &mut Compiler, program: &mut Program) {
    compiler.add_function(
        program,
        "random(): Float",
        FunctionFlags::NO_SIDE_EFFECT,
        Rc::new(|call| {
            call.ret_mut()[0] = Value::float(rand::random::<f64>());
            Ok(())
        }),
    );

    compiler.add_function(
        program,
        "randomInt(Int, Int): Int",
        FunctionFlags::NO_SIDE_EFFECT,
        Rc::new(|call| {
            let lo = call.args()[0].as_int();
            let hi = call.args()[1].as_int();

            if lo >= hi {
                return Err(format!("randomInt() range {} : {} is empty", lo, hi));
            }

            let value = rand::thread_rng().gen_range(lo..hi);
            call.ret_mut()[0] = Value::int(value);
            Ok(())
        }),
    );
}

fn print_native(quote: bool, newline: bool) -> NativeFunction {
    Rc::new(move |call| {
        let mut out = String::new();

        // Variadic layout: (Type, value…) pairs
        let args = call.args();
        let mut i = 0;
        while i < args.len() {
            let ty = args[i].as_type();
            i += 1;

            let size = call.program.ty(ty).size;
            format_value(call.program, ty, &args[i..i + size], quote, &mut out);
            i += size;
        }

        if newline {
            out.push('\n');
        }

        let stdout = std::io::stdout();
        let _ = stdout.lock().write_all(out.as_bytes());

        Ok(())
    })
}

fn unary_float(f: fn(f64) -> f64) -> NativeFunction {
    Rc::new(move |call| {
        let d = f(call.args()[0].as_float());
        call.ret_mut()[0] = Value::float(d);
        Ok(())
    })
}

fn binary_float(f: fn(f64, f64) -> f64) -> NativeFunction {
    Rc::new(move |call| {
        let d = f(call.args()[0].as_float(), call.args()[1].as_float());
        call.ret_mut()[0] = Value::float(d);
        Ok(())
    })
}

fn float_predicate(f: fn(f64) -> bool) -> NativeFunction {
    Rc::new(move |call| {
        let b = f(call.args()[0].as_float());
        call.ret_mut()[0] = Value::bool(b);
        Ok(())
    })
}

/// Format one value of a known type from its stack slots.
pub fn format_value(program: &Program, ty: TypeId, slots: &[Value], quote: bool, out: &mut String) {
    let info = program.ty(ty);

    match info.primitive {
        PrimitiveKind::Null => out.push_str("null"),
        PrimitiveKind::Bool => {
            let _ = write!(out, "{}", slots[0].as_bool());
        }
        PrimitiveKind::Int => {
            let _ = write!(out, "{}", slots[0].as_int());
        }
        PrimitiveKind::Float => {
            let d = slots[0].as_float();
            if d.is_finite() && d == d.trunc() {
                let _ = write!(out, "{:.1}", d);
            } else {
                let _ = write!(out, "{}", d);
            }
        }
        PrimitiveKind::String => {
            let s = program.str_of(slots[0].as_sym());

            if quote {
                out.push('"');
                for c in s.chars() {
                    match c {
                        '"' => out.push_str("\\\""),
                        '\r' => out.push_str("\\r"),
                        '\n' => out.push_str("\\n"),
                        '\t' => out.push_str("\\t"),
                        '\u{0C}' => out.push_str("\\f"),
                        '\u{0B}' => out.push_str("\\v"),
                        '\u{07}' => out.push_str("\\a"),
                        '\u{08}' => out.push_str("\\b"),
                        '\u{1B}' => out.push_str("\\e"),
                        _ => out.push(c),
                    }
                }
                out.push('"');
            } else {
                out.push_str(s);
            }
        }
        PrimitiveKind::Type => out.push_str(program.signature(slots[0].as_type())),
        PrimitiveKind::Function => {
            out.push_str(program.str_of(program.func(slots[0].as_func()).prototype));
        }
        PrimitiveKind::Array => {
            let array = *info.as_array();
            let unit_size = program.ty(array.unit).size;

            out.push('[');
            for i in 0..array.len as usize {
                if i > 0 {
                    out.push_str(", ");
                }
                format_value(program, array.unit, &slots[i * unit_size..(i + 1) * unit_size], true, out);
            }
            out.push(']');
        }
        PrimitiveKind::Record => {
            let members = info.as_record().members.clone();

            out.push_str(program.signature(ty));
            out.push('(');
            for (i, member) in members.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let size = program.ty(member.ty).size;
                format_value(program, member.ty, &slots[member.offset..member.offset + size], true, out);
            }
            out.push(')');
        }
        PrimitiveKind::Enum => {
            let value = slots[0].as_int();

            match info.as_enum().labels.iter().find(|l| l.value == value) {
                Some(label) => out.push_str(program.str_of(label.name)),
                None => {
                    let _ = write!(out, "{}", value);
                }
            }
        }
        PrimitiveKind::Opaque => {
            let _ = write!(out, "0x{:X}", slots[0].as_opaque());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiagnosticSink;
    use crate::lexer::tokenize;
    use crate::program::{BOOL_TYPE, INT_TYPE, STRING_TYPE};

    fn fmt(program: &Program, ty: TypeId, slots: &[Value]) -> String {
        let mut out = String::new();
        format_value(program, ty, slots, false, &mut out);
        out
    }

    #[test]
    fn test_format_scalars() {
        let program = Program::new();

        assert_eq!(fmt(&program, INT_TYPE, &[Value::int(-7)]), "-7");
        assert_eq!(fmt(&program, BOOL_TYPE, &[Value::bool(true)]), "true");
        assert_eq!(fmt(&program, FLOAT_TYPE, &[Value::float(3.0)]), "3.0");
        assert_eq!(fmt(&program, FLOAT_TYPE, &[Value::float(2.5)]), "2.5");
    }

    #[test]
    fn test_format_quoted_string() {
        let mut program = Program::new();
        let sym = program.intern("a\tb");

        let mut out = String::new();
        format_value(&program, STRING_TYPE, &[Value::sym(sym)], true, &mut out);
        assert_eq!(out, "\"a\\tb\"");
    }

    #[test]
    fn test_imports_register_and_compile() {
        let mut program = Program::new();
        let mut compiler = Compiler::new(&mut program);
        import_all(&mut compiler, &mut program);

        let mut sink = DiagnosticSink::Silent;
        let file = tokenize(
            "printLn(1, \" \", 2.5)\nlet x = sqrt(16.0)\nlet r = randomInt(0, 10)",
            "<test>",
            &mut sink,
        )
        .unwrap();
        compiler.compile_with(&mut program, &file, &mut sink).unwrap();
    }

    #[test]
    fn test_pure_math_folds() {
        let mut program = Program::new();
        let mut compiler = Compiler::new(&mut program);
        import_math(&mut compiler, &mut program);

        let mut sink = DiagnosticSink::Silent;
        let file = tokenize("let x = sqrt(9.0)", "<test>", &mut sink).unwrap();
        compiler.compile_with(&mut program, &file, &mut sink).unwrap();

        let push = program.ir[program.ir.len() - 2];
        assert_eq!(push.code, crate::program::Opcode::Push);
        assert_eq!(push.u.as_float(), 3.0);
    }
}
