//! Interactive REPL
//!
//! Keeps one program image and one virtual machine alive across statements.
//! Incomplete statements (the compiler reports `unexpected_eof`) get a
//! continuation line, pre-indented by the reported block depth. Lines that
//! are syntactically expressions are wrapped so their value prints.

use std::cell::Cell;
use std::rc::Rc;

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::debug;

use blikk_lang::builtins;
use blikk_lang::{
    CompileReport, Compiler, DiagnosticSink, FunctionFlags, Program, RunFlags, VirtualMachine,
    render_diagnostic, tokenize,
};

pub fn run_interactive(debug_instructions: bool) -> i32 {
    println!("blikk {}", env!("CARGO_PKG_VERSION"));

    let mut program = Program::new();
    let mut compiler = Compiler::new(&mut program);
    builtins::import_all(&mut compiler, &mut program);

    // exit() and quit() interrupt the machine and leave the loop
    let quit = Rc::new(Cell::new(false));
    for name in ["exit()", "quit()"] {
        let quit = Rc::clone(&quit);
        compiler.add_function(
            &mut program,
            name,
            FunctionFlags::default(),
            Rc::new(move |call| {
                quit.set(true);
                call.interrupt();
                Ok(())
            }),
        );
    }

    let flags = RunFlags {
        hide_errors: false,
        debug: debug_instructions,
    };

    // Run the prelude so the registered globals land on the stack
    let mut vm = VirtualMachine::new();
    compiler
        .compile(&mut program, "", "<interactive>")
        .expect("prelude must compile");
    vm.run(&program, flags).expect("prelude must run");

    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(err) => {
            eprintln!("Error: {}", err);
            return 1;
        }
    };

    let mut pending = String::new();
    let mut indent = String::new();

    while !quit.get() {
        let prompt = if pending.is_empty() { ">>> " } else { "... " };
        let line = match rl.readline_with_initial(prompt, (&indent, "")) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                pending.clear();
                indent.clear();
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {}", err);
                return 1;
            }
        };
        indent.clear();

        if !pending.is_empty() {
            pending.push('\n');
        }
        pending.push_str(&line);

        let code = pending.trim_end().to_string();
        if code.is_empty() {
            pending.clear();
            continue;
        }

        let _ = rl.add_history_entry(&code);

        let prev_variables = program.variables.len();
        let prev_stack = vm.stack.len();

        // Wrap expression lines so their value prints; errors of the
        // speculative attempt stay silent.
        let mut compiled = false;
        if is_expression_line(&code) {
            let wrapped = format!(
                "begin\n    let __result = {}\n    if typeOf(__result) != Null do printLn(__result)\nend\n",
                code
            );

            debug!("trying expression wrap");
            let mut sink = DiagnosticSink::Silent;
            if let Ok(file) = tokenize(&wrapped, "<interactive>", &mut sink) {
                compiled = compiler.compile_with(&mut program, &file, &mut sink).is_ok();
            }
        }

        if !compiled {
            let mut diags = Vec::new();
            let mut sink = DiagnosticSink::Collect(&mut diags);

            let result = match tokenize(&code, "<interactive>", &mut sink) {
                Ok(file) => compiler.compile_with(&mut program, &file, &mut sink),
                Err(_) => Err(CompileReport::default()),
            };

            if let Err(report) = result {
                if report.unexpected_eof {
                    // The statement is not finished: offer another line,
                    // indented to the current block depth
                    indent = "    ".repeat(report.depth as usize + 1);
                    continue;
                }

                for diag in &diags {
                    eprintln!("{}", render_diagnostic(Some(&code), diag));
                }
                pending.clear();
                continue;
            }
        }

        pending.clear();

        if vm.run(&program, flags).is_err() {
            // Single statements only define globals, so dropping what this
            // one added and resuming the main frame after the failed code
            // is enough.
            compiler.rollback_globals(&mut program, prev_variables, prev_stack);

            vm.stack.truncate(prev_stack);
            vm.frames.truncate(1);
            vm.frames[0].pc = program.ir.len();
        }
    }

    0
}

// A line whose first word cannot begin a statement or declaration is an
// expression; only those get the print wrap.
fn is_expression_line(code: &str) -> bool {
    let first: String = code
        .trim_start()
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();

    !matches!(
        first.as_str(),
        "let" | "func" | "record" | "enum" | "if" | "while" | "for" | "begin" | "return"
            | "break" | "continue" | "pass" | "do" | "else" | "end"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expression_line_detection() {
        assert!(is_expression_line("1 + 2"));
        assert!(is_expression_line("printLn(\"hi\")"));
        assert!(is_expression_line("(3)"));
        assert!(!is_expression_line("let x = 1"));
        assert!(!is_expression_line("  for i in 0 : 3 do pass"));
        assert!(!is_expression_line("func f() do pass"));
    }
}
