//! End-to-end script execution
//!
//! Scripts run through the real compiler and VM; results are observed with
//! probe natives registered by the harness, so nothing depends on stdout.

use std::cell::RefCell;
use std::rc::Rc;

use blikk_lang::builtins;
use blikk_lang::{
    CompileReport, Compiler, DiagnosticSink, FunctionFlags, Program, RunError, RunFlags, Value,
    VirtualMachine, tokenize,
};

struct Harness {
    program: Program,
    compiler: Compiler,
    vm: VirtualMachine,
    probed: Rc<RefCell<Vec<String>>>,
    touched: Rc<RefCell<usize>>,
}

impl Harness {
    fn new() -> Harness {
        let mut program = Program::new();
        let mut compiler = Compiler::new(&mut program);
        builtins::import_all(&mut compiler, &mut program);

        // probe(...) records its arguments, formatted, space separated
        let probed: Rc<RefCell<Vec<String>>> = Rc::default();
        {
            let probed = Rc::clone(&probed);
            compiler.add_function(
                &mut program,
                "probe(...)",
                FunctionFlags::default(),
                Rc::new(move |call| {
                    let mut out = String::new();

                    let args = call.args();
                    let mut i = 0;
                    while i < args.len() {
                        let ty = args[i].as_type();
                        i += 1;

                        if i > 1 {
                            out.push(' ');
                        }
                        let size = call.program.ty(ty).size;
                        builtins::format_value(call.program, ty, &args[i..i + size], false, &mut out);
                        i += size;
                    }

                    probed.borrow_mut().push(out);
                    Ok(())
                }),
            );
        }

        // touch() counts calls; the short-circuit tests use it as a
        // side-effect detector
        let touched: Rc<RefCell<usize>> = Rc::default();
        {
            let touched = Rc::clone(&touched);
            compiler.add_function(
                &mut program,
                "touch(): Bool",
                FunctionFlags::default(),
                Rc::new(move |call| {
                    *touched.borrow_mut() += 1;
                    call.ret_mut()[0] = Value::bool(true);
                    Ok(())
                }),
            );
        }

        Harness {
            program,
            compiler,
            vm: VirtualMachine::new(),
            probed,
            touched,
        }
    }

    fn compile(&mut self, code: &str) -> Result<(), CompileReport> {
        let mut sink = DiagnosticSink::Silent;
        let file = tokenize(code, "<test>", &mut sink).expect("tokenize failed");
        self.compiler.compile_with(&mut self.program, &file, &mut sink)
    }

    fn run(&mut self, code: &str) {
        self.compile(code).expect("compile failed");
        self.vm
            .run(&self.program, RunFlags::default())
            .expect("run failed");
    }

    fn run_err(&mut self, code: &str) -> RunError {
        self.compile(code).expect("compile failed");
        self.vm
            .run(
                &self.program,
                RunFlags {
                    hide_errors: true,
                    debug: false,
                },
            )
            .expect_err("run should have failed")
    }

    fn output(&self) -> Vec<String> {
        self.probed.borrow().clone()
    }
}

#[test]
fn test_arithmetic_precedence() {
    let mut h = Harness::new();
    h.run("probe(1 + 2 * 3)");
    assert_eq!(h.output(), ["7"]);
}

#[test]
fn test_for_loop_is_half_open() {
    let mut h = Harness::new();
    h.run("let mut x = 0; for i in 1 : 5 do x += i; probe(x)");
    assert_eq!(h.output(), ["10"]);
}

#[test]
fn test_factorial() {
    let mut h = Harness::new();
    h.run("func fact(n: Int): Int if n <= 1 do return 1 else return n * fact(n - 1) end end; probe(fact(10))");
    assert_eq!(h.output(), ["3628800"]);
}

#[test]
fn test_record_members() {
    let mut h = Harness::new();
    h.run("record Point (x: Int, y: Int); let p = Point(3, 4); probe(p.x + p.y)");
    assert_eq!(h.output(), ["7"]);
}

#[test]
fn test_enum_equality() {
    let mut h = Harness::new();
    h.run("enum Color (Red, Green, Blue); probe(Color.Green == Color.Green)");
    assert_eq!(h.output(), ["true"]);

    h.run("probe(Color.Red == Color.Blue, Color.Blue)");
    assert_eq!(h.output()[1], "false Blue");
}

#[test]
fn test_array_fill_and_index() {
    let mut h = Harness::new();
    h.run("let mut a = [0, 0, 0, 0]; for i in 0 : 4 do a[i] := i * i end; probe(a[3])");
    assert_eq!(h.output(), ["9"]);
}

#[test]
fn test_array_printing() {
    let mut h = Harness::new();
    h.run("probe([1, 2, 3])");
    assert_eq!(h.output(), ["[1, 2, 3]"]);
}

#[test]
fn test_short_circuit_never_evaluates() {
    let mut h = Harness::new();
    h.run("let a = false and touch()\nlet b = true or touch()\nprobe(a, b)");

    assert_eq!(h.output(), ["false true"]);
    assert_eq!(*h.touched.borrow(), 0);
}

#[test]
fn test_short_circuit_evaluates_when_needed() {
    let mut h = Harness::new();
    h.run("let a = true and touch()\nprobe(a)");

    assert_eq!(h.output(), ["true"]);
    assert_eq!(*h.touched.borrow(), 1);
}

#[test]
fn test_while_loop() {
    let mut h = Harness::new();
    h.run("let mut n = 0\nwhile n < 5 do n += 1\nprobe(n)");
    assert_eq!(h.output(), ["5"]);
}

#[test]
fn test_break_and_continue() {
    let mut h = Harness::new();
    h.run("let mut s = 0\nfor i in 0 : 10\nif i == 3 do continue\nif i == 5 do break\ns += i\nend\nprobe(s)");

    // 0 + 1 + 2 + 4
    assert_eq!(h.output(), ["7"]);
}

#[test]
fn test_deep_tail_recursion() {
    let mut h = Harness::new();
    h.run("func count(n: Int, acc: Int): Int\nif n <= 0 do return acc else return count(n - 1, acc + 1) end\nend\nprobe(count(200000, 0))");

    assert_eq!(h.output(), ["200000"]);
    assert_eq!(h.vm.frames.len(), 1);

    let f = h
        .program
        .functions
        .iter()
        .find(|f| h.program.str_of(f.name) == "count")
        .unwrap();
    assert!(f.tre);
}

#[test]
fn test_assignment_is_an_expression() {
    let mut h = Harness::new();
    h.run("let mut x = 1\nlet y = (x := 5)\nprobe(x, y)");
    assert_eq!(h.output(), ["5 5"]);
}

#[test]
fn test_compound_assignment_on_array_element() {
    let mut h = Harness::new();
    h.run("let mut a = [10, 20, 30]\nlet mut i = 0\ni := 1\na[i] += 5\nprobe(a[0], a[1], a[2])");
    assert_eq!(h.output(), ["10 25 30"]);
}

#[test]
fn test_global_mutation_from_function() {
    let mut h = Harness::new();
    h.run("let mut g = 0\nfunc bump()\ng := g + 1\nend\nbump()\nbump()\nprobe(g)");
    assert_eq!(h.output(), ["2"]);
}

#[test]
fn test_division_by_zero_traps() {
    let mut h = Harness::new();
    h.run("let mut zero = 0");

    let err = h.run_err("probe(1 / zero)");
    assert!(err.message.contains("division by 0"));
}

#[test]
fn test_dynamic_index_out_of_range_traps() {
    let mut h = Harness::new();
    h.run("let a = [1, 2]\nlet mut i = 0\ni := 7");

    let err = h.run_err("probe(a[i])");
    assert!(err.message.contains("out of range"));
}

#[test]
fn test_incremental_statements_share_state() {
    let mut h = Harness::new();
    h.run("let a = 1");
    h.run("let b = a + 1");
    h.run("probe(a + b)");

    assert_eq!(h.output(), ["3"]);
}

#[test]
fn test_failed_compile_then_continue() {
    let mut h = Harness::new();
    assert!(h.compile("let x = nope").is_err());

    h.run("probe(1)");
    assert_eq!(h.output(), ["1"]);
}

#[test]
fn test_string_interning_equality() {
    let mut h = Harness::new();
    h.run("probe(\"abc\" == \"abc\", \"a\" == \"b\")");
    assert_eq!(h.output(), ["true false"]);
}

#[test]
fn test_variadic_layout() {
    let mut h = Harness::new();
    h.run("probe(1, 2.5, true, \"s\")");
    assert_eq!(h.output(), ["1 2.5 true s"]);
}

#[test]
fn test_type_of() {
    let mut h = Harness::new();
    h.run("probe(typeOf(42), typeOf(1.5), typeOf(\"x\"))");
    assert_eq!(h.output(), ["Int Float String"]);
}

#[test]
fn test_math_builtins() {
    let mut h = Harness::new();
    h.run("probe(sqrt(9.0), pow(2.0, 10.0), floor(2.7))");
    assert_eq!(h.output(), ["3.0 1024.0 2.0"]);
}

#[test]
fn test_conversions() {
    let mut h = Harness::new();
    h.run("probe(toInt(2.9), toFloat(2))");
    assert_eq!(h.output(), ["2 2.0"]);
}

#[test]
fn test_nested_records() {
    let mut h = Harness::new();
    h.run("record Inner (a: Int, b: Int)\nrecord Outer (i: Inner, c: Int)\nlet o = Outer(Inner(1, 2), 3)\nprobe(o.i.b, o.c)");
    assert_eq!(h.output(), ["2 3"]);
}

#[test]
fn test_multi_dimensional_array() {
    let mut h = Harness::new();
    h.run("let mut m: [2, 2] Int\nm[1, 1] := 9\nm[0, 1] := 5\nprobe(m[1, 1], m[0, 1], m[0, 0])");
    assert_eq!(h.output(), ["9 5 0"]);
}

#[test]
fn test_function_values_and_indirect_calls() {
    let mut h = Harness::new();

    // A non-mut binding aliases the function symbol, so the call stays
    // direct
    h.run("func double(n: Int): Int\nreturn n + n\nend\nlet f = double\nprobe(f(21))");
    assert_eq!(h.output(), ["42"]);

    // A mut binding loads a function value and calls through it
    h.run("let mut g = double\nprobe(g(10))");
    assert_eq!(h.output()[1], "20");
}

#[test]
fn test_string_escapes_print_raw() {
    let mut h = Harness::new();
    h.run("probe(\"a\\tb\")");
    assert_eq!(h.output(), ["a\tb"]);
}
