//! CLI end-to-end tests
//!
//! Spawn the built binary on inline code and temp files, checking stdout
//! and exit codes.

use std::fs;
use std::process::Command;

fn blikk() -> Command {
    Command::new(env!("CARGO_BIN_EXE_blikk"))
}

fn run_inline(code: &str) -> (String, bool) {
    let output = blikk()
        .arg("-c")
        .arg(code)
        .output()
        .expect("failed to spawn blikk");

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        output.status.success(),
    )
}

#[test]
fn test_arithmetic() {
    let (stdout, ok) = run_inline("printLn(1 + 2 * 3)");
    assert!(ok);
    assert_eq!(stdout, "7\n");
}

#[test]
fn test_for_loop() {
    let (stdout, ok) = run_inline("let mut x = 0; for i in 1 : 5 do x += i; printLn(x)");
    assert!(ok);
    assert_eq!(stdout, "10\n");
}

#[test]
fn test_factorial() {
    let (stdout, ok) = run_inline(
        "func fact(n: Int): Int if n <= 1 do return 1 else return n * fact(n - 1) end end; printLn(fact(10))",
    );
    assert!(ok);
    assert_eq!(stdout, "3628800\n");
}

#[test]
fn test_record() {
    let (stdout, ok) =
        run_inline("record Point (x: Int, y: Int); let p = Point(3, 4); printLn(p.x + p.y)");
    assert!(ok);
    assert_eq!(stdout, "7\n");
}

#[test]
fn test_enum() {
    let (stdout, ok) = run_inline("enum Color (Red, Green, Blue); printLn(Color.Green == Color.Green)");
    assert!(ok);
    assert_eq!(stdout, "true\n");
}

#[test]
fn test_array() {
    let (stdout, ok) = run_inline(
        "let mut a = [0, 0, 0, 0]; for i in 0 : 4 do a[i] := i * i end; printLn(a[3])",
    );
    assert!(ok);
    assert_eq!(stdout, "9\n");
}

#[test]
fn test_compile_error_exit_code() {
    let (_, ok) = run_inline("let x = nope");
    assert!(!ok);
}

#[test]
fn test_runtime_error_exit_code() {
    let (_, ok) = run_inline("let mut zero = 0\nprintLn(1 / zero)");
    assert!(!ok);
}

#[test]
fn test_file_runner() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("fib.bk");

    fs::write(
        &path,
        "func fib(n: Int): Int\nif n < 2 do return n else return fib(n - 1) + fib(n - 2) end\nend\nprintLn(fib(20))\n",
    )
    .unwrap();

    let output = blikk().arg(&path).output().expect("failed to spawn blikk");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "6765\n");
}

#[test]
fn test_missing_file() {
    let output = blikk()
        .arg("/nonexistent/blikk/file.bk")
        .output()
        .expect("failed to spawn blikk");
    assert!(!output.status.success());
}

#[test]
fn test_version() {
    let output = blikk().arg("--version").output().expect("failed to spawn blikk");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("blikk"));
}

#[test]
fn test_print_variants() {
    let (stdout, ok) = run_inline("print(\"a\")\nprint(\"b\")\nprintLn(\"\")\ndebug(\"x\\ty\")");
    assert!(ok);
    assert_eq!(stdout, "ab\n\"x\\ty\"\n");
}

#[test]
fn test_special_globals() {
    let (stdout, ok) = run_inline("printLn(isNaN(NaN), \" \", isInfinity(Inf))");
    assert!(ok);
    assert_eq!(stdout, "true true\n");
}
