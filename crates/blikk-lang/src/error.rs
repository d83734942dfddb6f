//! Diagnostic model and rendering
//!
//! Compiler and lexer errors are values: a kind (error or hint), a source
//! anchor (file, line, byte offset) and a message. They flow through an
//! explicit [`DiagnosticSink`] instead of a process-global log handler, so
//! hosts like the REPL can silence or collect them per compile call.
//!
//! Rendering reconstructs the offending source line around the byte offset,
//! counts the column in code points, and aligns a caret under it while
//! preserving tabs.

use std::fmt;

use crate::program::{CallFrame, Program};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    Error,
    Hint,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub filename: Option<String>,
    pub line: i32,
    /// Byte offset into the source the diagnostic is anchored at.
    pub offset: Option<usize>,
    pub message: String,
}

impl Diagnostic {
    pub fn error(filename: &str, line: i32, offset: usize, message: String) -> Diagnostic {
        Diagnostic {
            kind: DiagnosticKind::Error,
            filename: Some(filename.to_string()),
            line,
            offset: Some(offset),
            message,
        }
    }

    pub fn hint(filename: &str, line: i32, offset: usize, message: String) -> Diagnostic {
        Diagnostic {
            kind: DiagnosticKind::Hint,
            filename: Some(filename.to_string()),
            line,
            offset: Some(offset),
            message,
        }
    }

    /// A diagnostic with no source anchor, e.g. a hint about general rules.
    pub fn bare(kind: DiagnosticKind, message: String) -> Diagnostic {
        Diagnostic {
            kind,
            filename: None,
            line: 0,
            offset: None,
            message,
        }
    }
}

/// Where diagnostics go during a tokenize/compile call.
pub enum DiagnosticSink<'a> {
    /// Render to stderr immediately.
    Default,
    /// Drop everything. Used for speculative compiles.
    Silent,
    /// Collect for the caller to render or inspect later.
    Collect(&'a mut Vec<Diagnostic>),
}

impl DiagnosticSink<'_> {
    pub fn report(&mut self, code: Option<&str>, diag: Diagnostic) {
        match self {
            DiagnosticSink::Default => eprintln!("{}", render_diagnostic(code, &diag)),
            DiagnosticSink::Silent => {}
            DiagnosticSink::Collect(diags) => diags.push(diag),
        }
    }
}

/// Render a diagnostic, echoing the offending source line with an aligned
/// caret when the source and an anchor are available.
pub fn render_diagnostic(code: Option<&str>, diag: &Diagnostic) -> String {
    let kind = match diag.kind {
        DiagnosticKind::Error => "Error",
        DiagnosticKind::Hint => "Hint",
    };
    let indent = match diag.kind {
        DiagnosticKind::Error => "",
        DiagnosticKind::Hint => "    ",
    };

    let (code, filename, offset) = match (code, &diag.filename, diag.offset) {
        (Some(code), Some(filename), Some(offset)) if offset <= code.len() => {
            (code, filename, offset)
        }
        _ => return format!("{}{}: {}", indent, kind, diag.message),
    };

    // Scan back to the previous newline and forward to the next one to
    // reconstruct the whole line, counting the column in code points
    // (UTF-8 continuation bytes are skipped).
    let bytes = code.as_bytes();
    let mut start = offset;
    let mut column = 0usize;
    while start > 0 && bytes[start - 1] != b'\n' {
        start -= 1;
        if bytes[start] & 0xC0 != 0x80 {
            column += 1;
        }
    }
    let mut end = offset;
    while end < bytes.len() && bytes[end] != b'\n' && bytes[end] != b'\r' {
        end += 1;
    }
    let extract = &code[start..end];

    // The caret must line up even when the line mixes tabs and other
    // characters, so the alignment string repeats the line's own tabs and
    // replaces everything else with a space.
    let align: String = extract
        .chars()
        .take(column)
        .map(|c| if c == '\t' { '\t' } else { ' ' })
        .collect();

    let mut out = String::new();
    out.push_str(&format!(
        "{}{}({}:{}): {}: {}\n",
        indent,
        filename,
        diag.line,
        column + 1,
        kind,
        diag.message
    ));
    out.push_str(&format!("{}{:>7} |  {}\n", indent, diag.line, extract));
    out.push_str(&format!("{}        |  {}^", indent, align));

    out
}

// ---------------------------------------------------------------------------
// Runtime errors
// ---------------------------------------------------------------------------

/// A fatal error raised while the VM was executing.
#[derive(Debug, Clone, PartialEq)]
pub struct RunError {
    pub message: String,
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RunError {}

/// The lexer failed; diagnostics went to the sink and no tokenized file was
/// produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidSource;

impl fmt::Display for InvalidSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid source")
    }
}

impl std::error::Error for InvalidSource {}

/// Print a stack trace for a fatal runtime error, walking the frame list
/// and mapping each PC through the per-function source maps.
pub fn report_runtime_error(program: &Program, frames: &[CallFrame], message: &str) {
    eprintln!("Something wrong has happened, execution has stopped");
    eprintln!();

    if !frames.is_empty() {
        eprintln!("Dumping stack trace:");

        for (i, frame) in frames.iter().rev().enumerate() {
            let prototype = match frame.func {
                Some(id) => program.str_of(program.func(id).prototype),
                None => "<outside function>",
            };
            let tre = frame.func.is_some_and(|id| program.func(id).tre);
            let marker = if i == 0 { ">>>" } else { "   " };
            let flag = if tre { "[+]" } else { "   " };

            match program.locate(frame.func, frame.pc) {
                Some((filename, line)) => {
                    eprintln!(" {} {:<36}{} {} ({})", marker, prototype, flag, filename, line);
                }
                None => {
                    eprintln!(" {} {:<36}{} <native function>", marker, prototype, flag);
                }
            }
        }

        eprintln!();
    }

    eprintln!("Error: {}", message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_with_caret() {
        let code = "let x = 1\nlet y = oops\n";
        let offset = code.find("oops").unwrap();
        let diag = Diagnostic::error("test.bk", 2, offset, "Reference to unknown identifier 'oops'".to_string());

        let out = render_diagnostic(Some(code), &diag);
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(
            lines[0],
            "test.bk(2:9): Error: Reference to unknown identifier 'oops'"
        );
        assert!(lines[1].ends_with("let y = oops"));

        // The caret must sit under the 'o' of oops.
        let caret_col = lines[2].find('^').unwrap();
        let code_col = lines[1].find("oops").unwrap();
        assert_eq!(caret_col, code_col);
    }

    #[test]
    fn test_render_counts_code_points() {
        let code = "let héllo = nope\n";
        let offset = code.find("nope").unwrap();
        let diag = Diagnostic::error("test.bk", 1, offset, "bad".to_string());

        let out = render_diagnostic(Some(code), &diag);

        // Byte offset is 13 but the column is 13 in code points too minus
        // the extra UTF-8 byte of 'é'.
        assert!(out.starts_with("test.bk(1:13): Error: bad"));
    }

    #[test]
    fn test_render_preserves_tabs_in_alignment() {
        let code = "\tlet x = nope\n";
        let offset = code.find("nope").unwrap();
        let diag = Diagnostic::error("test.bk", 1, offset, "bad".to_string());

        let out = render_diagnostic(Some(code), &diag);
        let caret_line = out.lines().last().unwrap();

        assert!(caret_line.contains('\t'));
    }

    #[test]
    fn test_render_without_anchor() {
        let diag = Diagnostic::bare(DiagnosticKind::Hint, "Identifiers are case-sensitive".to_string());
        assert_eq!(
            render_diagnostic(None, &diag),
            "    Hint: Identifiers are case-sensitive"
        );
    }

    #[test]
    fn test_collect_sink() {
        let mut diags = Vec::new();
        let mut sink = DiagnosticSink::Collect(&mut diags);

        sink.report(None, Diagnostic::bare(DiagnosticKind::Error, "one".to_string()));
        sink.report(None, Diagnostic::bare(DiagnosticKind::Hint, "two".to_string()));

        assert_eq!(diags.len(), 2);
        assert_eq!(diags[0].message, "one");
        assert_eq!(diags[1].kind, DiagnosticKind::Hint);
    }
}
