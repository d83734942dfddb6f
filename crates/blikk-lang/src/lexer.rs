//! Tokenizer for blikk source code
//!
//! Produces a [`TokenizedFile`]: the token stream plus a side list of
//! offsets of top-level `func`/`record`/`enum` keywords, which the compiler
//! uses for its preparse pass (top-level declarations are order
//! independent).
//!
//! The lexer is pure: on any error it reports through the sink and returns
//! [`InvalidSource`] without producing a file.

use std::rc::Rc;

use unicode_xid::UnicodeXID;

use crate::error::{Diagnostic, DiagnosticSink, InvalidSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    EndOfLine,
    Semicolon,

    Identifier,
    Integer,
    Float,
    String,
    Bool,
    Null,

    Func,
    Return,
    Let,
    Mut,
    Begin,
    End,
    If,
    Else,
    While,
    For,
    In,
    Break,
    Continue,
    Do,
    Record,
    Enum,
    Pass,

    AndAnd,
    OrOr,
    Not,

    Dot,
    Colon,
    Comma,
    LeftParenthesis,
    RightParenthesis,
    LeftBracket,
    RightBracket,

    Assign,
    Reassign,
    PlusAssign,
    MinusAssign,
    MultiplyAssign,
    DivideAssign,
    ModuloAssign,
    AndAssign,
    OrAssign,
    XorAssign,
    LeftShiftAssign,
    RightShiftAssign,
    LeftRotateAssign,
    RightRotateAssign,

    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    And,
    Or,
    XorOrComplement,
    Equal,
    NotEqual,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    LeftShift,
    RightShift,
    LeftRotate,
    RightRotate,
}

impl TokenKind {
    /// Human name used in "Unexpected token" diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            TokenKind::EndOfLine => "end of line",
            TokenKind::Semicolon => ";",
            TokenKind::Identifier => "identifier",
            TokenKind::Integer => "integer",
            TokenKind::Float => "float",
            TokenKind::String => "string",
            TokenKind::Bool => "boolean",
            TokenKind::Null => "null",
            TokenKind::Func => "func",
            TokenKind::Return => "return",
            TokenKind::Let => "let",
            TokenKind::Mut => "mut",
            TokenKind::Begin => "begin",
            TokenKind::End => "end",
            TokenKind::If => "if",
            TokenKind::Else => "else",
            TokenKind::While => "while",
            TokenKind::For => "for",
            TokenKind::In => "in",
            TokenKind::Break => "break",
            TokenKind::Continue => "continue",
            TokenKind::Do => "do",
            TokenKind::Record => "record",
            TokenKind::Enum => "enum",
            TokenKind::Pass => "pass",
            TokenKind::AndAnd => "and",
            TokenKind::OrOr => "or",
            TokenKind::Not => "not",
            TokenKind::Dot => ".",
            TokenKind::Colon => ":",
            TokenKind::Comma => ",",
            TokenKind::LeftParenthesis => "(",
            TokenKind::RightParenthesis => ")",
            TokenKind::LeftBracket => "[",
            TokenKind::RightBracket => "]",
            TokenKind::Assign => "=",
            TokenKind::Reassign => ":=",
            TokenKind::PlusAssign => "+=",
            TokenKind::MinusAssign => "-=",
            TokenKind::MultiplyAssign => "*=",
            TokenKind::DivideAssign => "/=",
            TokenKind::ModuloAssign => "%=",
            TokenKind::AndAssign => "&=",
            TokenKind::OrAssign => "|=",
            TokenKind::XorAssign => "~=",
            TokenKind::LeftShiftAssign => "<<=",
            TokenKind::RightShiftAssign => ">>=",
            TokenKind::LeftRotateAssign => "<<<=",
            TokenKind::RightRotateAssign => ">>>=",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Multiply => "*",
            TokenKind::Divide => "/",
            TokenKind::Modulo => "%",
            TokenKind::And => "&",
            TokenKind::Or => "|",
            TokenKind::XorOrComplement => "~",
            TokenKind::Equal => "==",
            TokenKind::NotEqual => "!=",
            TokenKind::Greater => ">",
            TokenKind::GreaterOrEqual => ">=",
            TokenKind::Less => "<",
            TokenKind::LessOrEqual => "<=",
            TokenKind::LeftShift => "<<",
            TokenKind::RightShift => ">>",
            TokenKind::LeftRotate => "<<<",
            TokenKind::RightRotate => ">>>",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: i32,
    pub offset: usize,
    pub value: TokenValue,
}

impl Token {
    fn bare(kind: TokenKind, line: i32, offset: usize) -> Token {
        Token {
            kind,
            line,
            offset,
            value: TokenValue::None,
        }
    }

    pub fn str_value(&self) -> &str {
        match &self.value {
            TokenValue::Str(s) => s,
            _ => unreachable!("token has no string value"),
        }
    }
}

#[derive(Debug, Default)]
pub struct TokenizedFile {
    pub filename: String,
    pub code: String,
    pub tokens: Vec<Token>,
    /// Token indices of top-level `func`/`record`/`enum` keywords, in
    /// source order, consumed by the compiler's preparse.
    pub prototypes: Vec<usize>,
}

pub fn tokenize(
    code: &str,
    filename: &str,
    sink: &mut DiagnosticSink<'_>,
) -> Result<TokenizedFile, InvalidSource> {
    let mut lexer = Lexer {
        filename,
        code: "",
        offset: 0,
        next: 0,
        line: 1,
        file: TokenizedFile::default(),
        strings: Vec::new(),
    };

    lexer.tokenize(code, sink)
}

struct Lexer<'a> {
    filename: &'a str,
    code: &'a str,
    offset: usize,
    next: usize,
    line: i32,
    file: TokenizedFile,
    strings: Vec<Rc<str>>,
}

impl<'a> Lexer<'a> {
    fn tokenize(
        mut self,
        code: &'a str,
        sink: &mut DiagnosticSink<'_>,
    ) -> Result<TokenizedFile, InvalidSource> {
        // A BOM at position 0 is skipped silently.
        let code = code.strip_prefix('\u{FEFF}').unwrap_or(code);

        // Right-trim so that the synthetic end-of-line below is the only
        // one at the end; premature-EOF errors anchor better that way.
        let code = code.trim_end();
        self.code = code;

        let bytes = code.as_bytes();

        self.offset = 0;
        self.next = 1;
        while self.offset < bytes.len() {
            match bytes[self.offset] {
                b' ' | b'\t' | b'\r' => {}

                b'\n' => {
                    self.push(TokenKind::EndOfLine);
                    self.line += 1;
                }

                b'#' => {
                    while self.next < bytes.len() && bytes[self.next] != b'\n' {
                        self.next += 1;
                    }
                }

                b'0'..=b'9' => self.tokenize_number(sink)?,

                quote @ (b'"' | b'\'') => self.tokenize_string(quote, sink)?,

                b'.' => {
                    self.push(TokenKind::Dot);
                }
                b':' => {
                    let _ = self.push2(b'=', TokenKind::Reassign) || self.push(TokenKind::Colon);
                }
                b'(' => {
                    self.push(TokenKind::LeftParenthesis);
                }
                b')' => {
                    self.push(TokenKind::RightParenthesis);
                }
                b'[' => {
                    self.push(TokenKind::LeftBracket);
                }
                b']' => {
                    self.push(TokenKind::RightBracket);
                }
                b'+' => {
                    let _ = self.push2(b'=', TokenKind::PlusAssign) || self.push(TokenKind::Plus);
                }
                b'-' => {
                    let _ = self.push2(b'=', TokenKind::MinusAssign) || self.push(TokenKind::Minus);
                }
                b'*' => {
                    let _ = self.push2(b'=', TokenKind::MultiplyAssign)
                        || self.push(TokenKind::Multiply);
                }
                b'/' => {
                    let _ =
                        self.push2(b'=', TokenKind::DivideAssign) || self.push(TokenKind::Divide);
                }
                b'%' => {
                    let _ =
                        self.push2(b'=', TokenKind::ModuloAssign) || self.push(TokenKind::Modulo);
                }
                b'~' => {
                    let _ = self.push2(b'=', TokenKind::XorAssign)
                        || self.push(TokenKind::XorOrComplement);
                }
                b'&' => {
                    let _ = self.push2(b'=', TokenKind::AndAssign) || self.push(TokenKind::And);
                }
                b'|' => {
                    let _ = self.push2(b'=', TokenKind::OrAssign) || self.push(TokenKind::Or);
                }
                b'!' => {
                    if !self.push2(b'=', TokenKind::NotEqual) {
                        self.mark_unexpected(sink, self.offset, "Unexpected");
                        return Err(InvalidSource);
                    }
                }
                b'=' => {
                    let _ = self.push2(b'=', TokenKind::Equal) || self.push(TokenKind::Assign);
                }
                b'>' => {
                    let _ = self.push4(b'>', b'>', b'=', TokenKind::RightRotateAssign)
                        || self.push3(b'>', b'>', TokenKind::RightRotate)
                        || self.push3(b'>', b'=', TokenKind::RightShiftAssign)
                        || self.push2(b'>', TokenKind::RightShift)
                        || self.push2(b'=', TokenKind::GreaterOrEqual)
                        || self.push(TokenKind::Greater);
                }
                b'<' => {
                    let _ = self.push4(b'<', b'<', b'=', TokenKind::LeftRotateAssign)
                        || self.push3(b'<', b'<', TokenKind::LeftRotate)
                        || self.push3(b'<', b'=', TokenKind::LeftShiftAssign)
                        || self.push2(b'<', TokenKind::LeftShift)
                        || self.push2(b'=', TokenKind::LessOrEqual)
                        || self.push(TokenKind::Less);
                }
                b',' => {
                    self.push(TokenKind::Comma);
                }
                b';' => {
                    self.push(TokenKind::Semicolon);
                }

                _ => self.tokenize_identifier(sink)?,
            }

            self.offset = self.next;
            self.next += 1;
        }

        // Newlines end statements; make sure the last statement has one.
        self.offset = code.len();
        self.push(TokenKind::EndOfLine);

        self.file.filename = self.filename.to_string();
        self.file.code = code.to_string();

        Ok(self.file)
    }

    fn push(&mut self, kind: TokenKind) -> bool {
        self.file
            .tokens
            .push(Token::bare(kind, self.line, self.offset));
        true
    }

    fn push2(&mut self, c: u8, kind: TokenKind) -> bool {
        let bytes = self.code.as_bytes();
        if self.next < bytes.len() && bytes[self.next] == c {
            self.push(kind);
            self.next += 1;
            true
        } else {
            false
        }
    }

    fn push3(&mut self, c1: u8, c2: u8, kind: TokenKind) -> bool {
        let bytes = self.code.as_bytes();
        if self.next + 1 < bytes.len() && bytes[self.next] == c1 && bytes[self.next + 1] == c2 {
            self.push(kind);
            self.next += 2;
            true
        } else {
            false
        }
    }

    fn push4(&mut self, c1: u8, c2: u8, c3: u8, kind: TokenKind) -> bool {
        let bytes = self.code.as_bytes();
        if self.next + 2 < bytes.len()
            && bytes[self.next] == c1
            && bytes[self.next + 1] == c2
            && bytes[self.next + 2] == c3
        {
            self.push(kind);
            self.next += 3;
            true
        } else {
            false
        }
    }

    fn mark_error(&self, sink: &mut DiagnosticSink<'_>, offset: usize, message: String) {
        sink.report(
            Some(self.code),
            Diagnostic::error(self.filename, self.line, offset, message),
        );
    }

    fn mark_unexpected(&self, sink: &mut DiagnosticSink<'_>, offset: usize, prefix: &str) {
        let c = self.code[offset..].chars().next().unwrap_or('\0');

        if (c as u32) < 32 {
            self.mark_error(sink, offset, format!("{} byte 0x{:02X}", prefix, c as u32));
        } else {
            self.mark_error(sink, offset, format!("{} character '{}'", prefix, c));
        }
    }

    fn tokenize_number(&mut self, sink: &mut DiagnosticSink<'_>) -> Result<(), InvalidSource> {
        let bytes = self.code.as_bytes();

        if bytes[self.offset] == b'0' && self.next < bytes.len() && bytes[self.next].is_ascii_alphabetic()
        {
            let (base, digits): (u32, fn(u8) -> bool) = match bytes[self.next] {
                b'b' => (2, |c| matches!(c, b'0' | b'1')),
                b'o' => (8, |c| matches!(c, b'0'..=b'7')),
                b'x' => (16, |c| c.is_ascii_hexdigit()),
                _ => {
                    self.mark_unexpected(sink, self.next, "Invalid literal base");
                    return Err(InvalidSource);
                }
            };

            let mut value: u64 = 0;
            let mut overflow = false;

            self.next += 1;
            while self.next < bytes.len() {
                let c = bytes[self.next];

                if digits(c) {
                    let digit = (c as char).to_digit(16).unwrap() as u64;
                    overflow |= value > (i64::MAX as u64 - digit) / base as u64;
                    value = value.wrapping_mul(base as u64).wrapping_add(digit);
                } else if c.is_ascii_digit() || (base == 16 && c.is_ascii_alphabetic()) {
                    let what = match base {
                        2 => "Invalid binary digit",
                        8 => "Invalid octal digit",
                        _ => "Invalid hexadecimal digit",
                    };
                    self.mark_unexpected(sink, self.next, what);
                    return Err(InvalidSource);
                } else {
                    break;
                }

                self.next += 1;
            }

            if overflow {
                self.mark_error(
                    sink,
                    self.offset,
                    format!("Number literal is too big (max = {})", i64::MAX),
                );
                return Err(InvalidSource);
            }

            self.file.tokens.push(Token {
                kind: TokenKind::Integer,
                line: self.line,
                offset: self.offset,
                value: TokenValue::Int(value as i64),
            });

            return Ok(());
        }

        // Decimal: scan digits (with '_' separators), switching to float
        // parsing on '.' or an exponent.
        let mut value: u64 = (bytes[self.offset] - b'0') as u64;
        let mut overflow = false;
        let mut fp = false;

        while self.next < bytes.len() {
            let c = bytes[self.next];

            if c.is_ascii_digit() {
                let digit = (c - b'0') as u64;
                overflow |= value > (i64::MAX as u64 - digit) / 10;
                value = value.wrapping_mul(10).wrapping_add(digit);
            } else if c == b'_' {
                // Digit separator, allowed in decimal literals only
            } else if c == b'.' || c == b'e' || c == b'E' {
                fp = true;
                break;
            } else {
                break;
            }

            self.next += 1;
        }

        if fp {
            return self.tokenize_float(sink);
        }

        if overflow {
            self.mark_error(
                sink,
                self.offset,
                format!("Number literal is too big (max = {})", i64::MAX),
            );
            return Err(InvalidSource);
        }

        self.file.tokens.push(Token {
            kind: TokenKind::Integer,
            line: self.line,
            offset: self.offset,
            value: TokenValue::Int(value as i64),
        });

        Ok(())
    }

    // Expects offset to point at the start of the literal.
    fn tokenize_float(&mut self, sink: &mut DiagnosticSink<'_>) -> Result<(), InvalidSource> {
        let bytes = self.code.as_bytes();

        let mut end = self.offset;
        while end < bytes.len() && (bytes[end].is_ascii_digit() || bytes[end] == b'_') {
            end += 1;
        }
        if end < bytes.len() && bytes[end] == b'.' {
            end += 1;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
        }
        if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
            let mut exp = end + 1;
            if exp < bytes.len() && (bytes[exp] == b'+' || bytes[exp] == b'-') {
                exp += 1;
            }
            if exp < bytes.len() && bytes[exp].is_ascii_digit() {
                end = exp;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
            }
        }

        let literal: String = self.code[self.offset..end]
            .chars()
            .filter(|&c| c != '_')
            .collect();
        let malformed = bytes[end - 1] == b'.'
            || (end < bytes.len() && bytes[end].is_ascii_alphabetic());

        match literal.parse::<f64>() {
            Ok(d) if !malformed => {
                self.next = end;
                self.file.tokens.push(Token {
                    kind: TokenKind::Float,
                    line: self.line,
                    offset: self.offset,
                    value: TokenValue::Float(d),
                });
                Ok(())
            }
            _ => {
                self.mark_error(sink, self.offset, "Malformed float number".to_string());
                Err(InvalidSource)
            }
        }
    }

    fn tokenize_string(
        &mut self,
        quote: u8,
        sink: &mut DiagnosticSink<'_>,
    ) -> Result<(), InvalidSource> {
        let bytes = self.code.as_bytes();
        let mut buf = String::new();

        loop {
            if self.next >= bytes.len() || bytes[self.next] == b'\n' {
                self.mark_error(sink, self.offset, "Unfinished string literal".to_string());
                return Err(InvalidSource);
            }
            if bytes[self.next] == b'\r' {
                self.mark_error(
                    sink,
                    self.next,
                    "Carriage return is not allowed in string literals, use \\r".to_string(),
                );
                return Err(InvalidSource);
            }

            if bytes[self.next] == quote {
                self.next += 1;
                break;
            } else if bytes[self.next] == b'\\' {
                self.next += 1;
                if self.next >= bytes.len() {
                    continue;
                }

                match bytes[self.next] {
                    b'r' => buf.push('\r'),
                    b'n' => buf.push('\n'),
                    b't' => buf.push('\t'),
                    b'f' => buf.push('\u{0C}'),
                    b'v' => buf.push('\u{0B}'),
                    b'a' => buf.push('\u{07}'),
                    b'b' => buf.push('\u{08}'),
                    b'e' => buf.push('\u{1B}'),
                    b'x' => {
                        if self.next + 2 >= bytes.len() {
                            self.mark_error(
                                sink,
                                self.next + 1,
                                "Truncated escape sequence".to_string(),
                            );
                            return Err(InvalidSource);
                        }

                        let mut c: u32 = 0;
                        for _ in 0..2 {
                            self.next += 1;
                            match (bytes[self.next] as char).to_digit(16) {
                                Some(digit) => c = (c << 4) | digit,
                                None => {
                                    self.mark_error(
                                        sink,
                                        self.next,
                                        "Invalid hexadecimal digit".to_string(),
                                    );
                                    return Err(InvalidSource);
                                }
                            }
                        }

                        buf.push(char::from_u32(c).unwrap());
                    }
                    c @ (b'u' | b'U') => {
                        let consume = if c == b'U' { 6 } else { 4 };

                        if self.next + consume >= bytes.len() {
                            self.mark_error(
                                sink,
                                self.next + 1,
                                format!(
                                    "Truncated escape sequence (expected {} hexadecimal digits)",
                                    consume
                                ),
                            );
                            return Err(InvalidSource);
                        }

                        let mut uc: u32 = 0;
                        for _ in 0..consume {
                            self.next += 1;
                            match (bytes[self.next] as char).to_digit(16) {
                                Some(digit) => uc = (uc << 4) | digit,
                                None => {
                                    self.mark_error(
                                        sink,
                                        self.next,
                                        "Invalid hexadecimal digit".to_string(),
                                    );
                                    return Err(InvalidSource);
                                }
                            }
                        }

                        match char::from_u32(uc) {
                            Some(c) => buf.push(c),
                            None => {
                                self.mark_error(
                                    sink,
                                    self.next - consume,
                                    "Invalid UTF-8 codepoint".to_string(),
                                );
                                return Err(InvalidSource);
                            }
                        }
                    }
                    b'\\' => buf.push('\\'),
                    b'"' => buf.push('"'),
                    b'\'' => buf.push('\''),
                    b'0' => buf.push('\0'),
                    _ => {
                        self.mark_unexpected(sink, self.next, "Unsupported escape sequence");
                        return Err(InvalidSource);
                    }
                }

                self.next += 1;
            } else {
                let c = self.code[self.next..].chars().next().unwrap();
                buf.push(c);
                self.next += c.len_utf8();
            }
        }

        let interned = self.intern(&buf);
        self.file.tokens.push(Token {
            kind: TokenKind::String,
            line: self.line,
            offset: self.offset,
            value: TokenValue::Str(interned),
        });

        Ok(())
    }

    fn tokenize_identifier(&mut self, sink: &mut DiagnosticSink<'_>) -> Result<(), InvalidSource> {
        let bytes = self.code.as_bytes();
        let first = self.code[self.offset..].chars().next().unwrap();

        if first.is_ascii_alphabetic() || first == '_' {
            // Go on!
        } else if !first.is_ascii() {
            if !first.is_xid_start() {
                self.mark_unexpected(sink, self.offset, "Identifiers cannot start with");
                return Err(InvalidSource);
            }

            self.next += first.len_utf8() - 1;
        } else {
            self.mark_unexpected(sink, self.offset, "Unexpected");
            return Err(InvalidSource);
        }

        while self.next < bytes.len() {
            let c = self.code[self.next..].chars().next().unwrap();

            if c.is_ascii_alphanumeric() || c == '_' {
                self.next += 1;
            } else if !c.is_ascii() {
                if !c.is_xid_continue() {
                    self.mark_unexpected(sink, self.next, "Identifiers cannot contain");
                    return Err(InvalidSource);
                }

                self.next += c.len_utf8();
            } else {
                break;
            }
        }

        let ident = &self.code[self.offset..self.next];

        let keyword = match ident {
            "func" => Some(TokenKind::Func),
            "return" => Some(TokenKind::Return),
            "let" => Some(TokenKind::Let),
            "mut" => Some(TokenKind::Mut),
            "begin" => Some(TokenKind::Begin),
            "end" => Some(TokenKind::End),
            "if" => Some(TokenKind::If),
            "else" => Some(TokenKind::Else),
            "while" => Some(TokenKind::While),
            "for" => Some(TokenKind::For),
            "in" => Some(TokenKind::In),
            "break" => Some(TokenKind::Break),
            "continue" => Some(TokenKind::Continue),
            "do" => Some(TokenKind::Do),
            "record" => Some(TokenKind::Record),
            "enum" => Some(TokenKind::Enum),
            "pass" => Some(TokenKind::Pass),
            "and" => Some(TokenKind::AndAnd),
            "or" => Some(TokenKind::OrOr),
            "not" => Some(TokenKind::Not),
            "null" => Some(TokenKind::Null),
            _ => None,
        };

        match (keyword, ident) {
            (Some(kind), _) => {
                // Top-level records and functions are order-independent;
                // record where their declarations start so the preparse
                // knows where to look.
                if matches!(kind, TokenKind::Func | TokenKind::Record | TokenKind::Enum) {
                    self.file.prototypes.push(self.file.tokens.len());
                }

                self.push(kind);
            }
            (None, "true") | (None, "false") => {
                self.file.tokens.push(Token {
                    kind: TokenKind::Bool,
                    line: self.line,
                    offset: self.offset,
                    value: TokenValue::Bool(ident == "true"),
                });
            }
            (None, _) => {
                let interned = self.intern(ident);
                self.file.tokens.push(Token {
                    kind: TokenKind::Identifier,
                    line: self.line,
                    offset: self.offset,
                    value: TokenValue::Str(interned),
                });
            }
        }

        Ok(())
    }

    fn intern(&mut self, s: &str) -> Rc<str> {
        match self.strings.iter().find(|existing| existing.as_ref() == s) {
            Some(existing) => Rc::clone(existing),
            None => {
                let rc: Rc<str> = Rc::from(s);
                self.strings.push(Rc::clone(&rc));
                rc
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(code: &str) -> TokenizedFile {
        let mut sink = DiagnosticSink::Silent;
        tokenize(code, "<test>", &mut sink).expect("tokenize failed")
    }

    fn lex_err(code: &str) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        let mut sink = DiagnosticSink::Collect(&mut diags);
        assert!(tokenize(code, "<test>", &mut sink).is_err());
        diags
    }

    fn kinds(file: &TokenizedFile) -> Vec<TokenKind> {
        file.tokens.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_basic_tokens() {
        let file = lex("let mut x = 1 + 2");
        assert_eq!(
            kinds(&file),
            vec![
                TokenKind::Let,
                TokenKind::Mut,
                TokenKind::Identifier,
                TokenKind::Assign,
                TokenKind::Integer,
                TokenKind::Plus,
                TokenKind::Integer,
                TokenKind::EndOfLine,
            ]
        );
    }

    #[test]
    fn test_integer_bases() {
        let file = lex("0b101 0o17 0xFF 123");
        let values: Vec<i64> = file
            .tokens
            .iter()
            .filter_map(|t| match t.value {
                TokenValue::Int(i) => Some(i),
                _ => None,
            })
            .collect();
        assert_eq!(values, vec![5, 15, 255, 123]);
    }

    #[test]
    fn test_decimal_digit_separators() {
        let file = lex("1_000_000");
        assert_eq!(file.tokens[0].value, TokenValue::Int(1_000_000));
    }

    #[test]
    fn test_integer_overflow_boundary() {
        let file = lex("9223372036854775807");
        assert_eq!(file.tokens[0].value, TokenValue::Int(i64::MAX));

        let diags = lex_err("9223372036854775808");
        assert!(diags[0].message.contains("too big"));
    }

    #[test]
    fn test_float_literals() {
        let file = lex("1.5 2e3 4.25e-2");
        let values: Vec<f64> = file
            .tokens
            .iter()
            .filter_map(|t| match t.value {
                TokenValue::Float(d) => Some(d),
                _ => None,
            })
            .collect();
        assert_eq!(values, vec![1.5, 2000.0, 0.0425]);
    }

    #[test]
    fn test_malformed_float() {
        let diags = lex_err("1.");
        assert!(diags[0].message.contains("Malformed float"));
    }

    #[test]
    fn test_string_escapes() {
        let file = lex(r#""a\tb\n\x41é\\""#);
        assert_eq!(
            file.tokens[0].value,
            TokenValue::Str(Rc::from("a\tb\nA\u{E9}\\"))
        );
    }

    #[test]
    fn test_string_both_quotes() {
        let file = lex("\"double\" 'single'");
        assert_eq!(file.tokens[0].kind, TokenKind::String);
        assert_eq!(file.tokens[1].kind, TokenKind::String);
    }

    #[test]
    fn test_unfinished_string() {
        let diags = lex_err("\"oops");
        assert!(diags[0].message.contains("Unfinished string literal"));
    }

    #[test]
    fn test_string_interning_dedups() {
        let file = lex(r#""same" "same""#);
        let (a, b) = match (&file.tokens[0].value, &file.tokens[1].value) {
            (TokenValue::Str(a), TokenValue::Str(b)) => (a, b),
            _ => panic!("expected strings"),
        };
        assert!(Rc::ptr_eq(a, b));
    }

    #[test]
    fn test_comments() {
        let file = lex("1 # the rest is ignored ~~~\n2");
        assert_eq!(
            kinds(&file),
            vec![
                TokenKind::Integer,
                TokenKind::EndOfLine,
                TokenKind::Integer,
                TokenKind::EndOfLine,
            ]
        );
    }

    #[test]
    fn test_bom_skipped() {
        let file = lex("\u{FEFF}42");
        assert_eq!(file.tokens[0].value, TokenValue::Int(42));
    }

    #[test]
    fn test_synthetic_end_of_line() {
        let file = lex("1");
        assert_eq!(file.tokens.last().unwrap().kind, TokenKind::EndOfLine);

        // The input is right-trimmed first so there is exactly one.
        let file = lex("1\n\n\n");
        let eols = file
            .tokens
            .iter()
            .filter(|t| t.kind == TokenKind::EndOfLine)
            .count();
        assert_eq!(eols, 1);
    }

    #[test]
    fn test_prototype_offsets() {
        let file = lex("func f()\nend\nrecord R (x: Int)\nenum E (A)");
        assert_eq!(file.prototypes.len(), 3);
        assert_eq!(file.tokens[file.prototypes[0]].kind, TokenKind::Func);
        assert_eq!(file.tokens[file.prototypes[1]].kind, TokenKind::Record);
        assert_eq!(file.tokens[file.prototypes[2]].kind, TokenKind::Enum);
    }

    #[test]
    fn test_shift_and_rotate_operators() {
        let file = lex("a << b >> c <<< d >>> e <<<= f >>>= g");
        let ops: Vec<TokenKind> = file
            .tokens
            .iter()
            .filter(|t| t.kind != TokenKind::Identifier && t.kind != TokenKind::EndOfLine)
            .map(|t| t.kind)
            .collect();
        assert_eq!(
            ops,
            vec![
                TokenKind::LeftShift,
                TokenKind::RightShift,
                TokenKind::LeftRotate,
                TokenKind::RightRotate,
                TokenKind::LeftRotateAssign,
                TokenKind::RightRotateAssign,
            ]
        );
    }

    #[test]
    fn test_unicode_identifiers() {
        let file = lex("été = 1");
        assert_eq!(file.tokens[0].kind, TokenKind::Identifier);
        assert_eq!(file.tokens[0].str_value(), "été");
    }

    #[test]
    fn test_rejected_characters() {
        let diags = lex_err("let $x = 1");
        assert!(diags[0].message.contains("Unexpected character '$'"));
    }

    #[test]
    fn test_keywords_and_bools() {
        let file = lex("true and not false or null");
        assert_eq!(
            kinds(&file),
            vec![
                TokenKind::Bool,
                TokenKind::AndAnd,
                TokenKind::Not,
                TokenKind::Bool,
                TokenKind::OrOr,
                TokenKind::Null,
                TokenKind::EndOfLine,
            ]
        );
        assert_eq!(file.tokens[0].value, TokenValue::Bool(true));
        assert_eq!(file.tokens[3].value, TokenValue::Bool(false));
    }
}
