// Lexer for kfuse .kfs schedule files.
//
// Uses the `logos` crate for DFA-based lexing. Newlines are significant
// (statement terminators); `#` starts a comment that runs to end of line.
//
// Preconditions: input is valid UTF-8.
// Postconditions: returns all tokens with byte-offset spans, plus any lex errors.
// Failure modes: unrecognized characters produce `LexError`; lexing continues.
// Side effects: none.

use logos::Logos;
use std::fmt;

/// Byte-offset span in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A lexer error with location.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub span: Span,
    pub message: String,
}

/// Result of lexing: tokens plus any errors (non-fatal).
#[derive(Debug)]
pub struct LexResult {
    pub tokens: Vec<(Token, Span)>,
    pub errors: Vec<LexError>,
}

/// kfuse token types.
///
/// Identifiers carry no value; use the span to retrieve the text.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r]+|#[^\n]*")]
pub enum Token {
    // ── Keywords ──
    #[token("set")]
    Set,
    #[token("param")]
    Param,
    #[token("stage")]
    Stage,
    #[token("output")]
    Output,
    #[token("compute")]
    Compute,
    #[token("at")]
    At,
    #[token("root")]
    Root,
    #[token("block")]
    Block,
    #[token("thread")]
    Thread,
    #[token("tile")]
    Tile,
    #[token("threads")]
    Threads,
    #[token("bound")]
    Bound,

    // ── Symbols ──
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token("=")]
    Equals,

    // ── Literals ──
    //
    // The size regex must appear before Number so the longer match
    // (number + unit suffix) wins over a bare number.
    /// Size literal (e.g. `48KB`). Value stored in bytes (1 KB = 1024).
    #[regex(r"[0-9]+(KB|MB)", parse_size)]
    Size(u64),

    /// Non-negative integer literal. Negation is a parser concern.
    #[regex(r"[0-9]+", parse_number)]
    Number(i64),

    // ── Identifier ──
    /// Identifier: `[a-zA-Z_][a-zA-Z0-9_]*`
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Ident,

    // ── Structure ──
    #[regex(r"\n+")]
    Newline,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Set => write!(f, "set"),
            Token::Param => write!(f, "param"),
            Token::Stage => write!(f, "stage"),
            Token::Output => write!(f, "output"),
            Token::Compute => write!(f, "compute"),
            Token::At => write!(f, "at"),
            Token::Root => write!(f, "root"),
            Token::Block => write!(f, "block"),
            Token::Thread => write!(f, "thread"),
            Token::Tile => write!(f, "tile"),
            Token::Threads => write!(f, "threads"),
            Token::Bound => write!(f, "bound"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::Equals => write!(f, "="),
            Token::Size(v) => write!(f, "{v}B"),
            Token::Number(v) => write!(f, "{v}"),
            Token::Ident => write!(f, "<ident>"),
            Token::Newline => write!(f, "<newline>"),
        }
    }
}

// ── Callbacks ──

fn parse_number(lex: &mut logos::Lexer<'_, Token>) -> Option<i64> {
    lex.slice().parse().ok()
}

fn parse_size(lex: &mut logos::Lexer<'_, Token>) -> Option<u64> {
    let slice = lex.slice();
    let unit_start = slice.find(|c: char| c.is_alphabetic())?;
    let (num_str, unit) = slice.split_at(unit_start);
    let num: u64 = num_str.parse().ok()?;
    let multiplier: u64 = match unit {
        "KB" => 1_024,
        "MB" => 1_024 * 1_024,
        _ => return None,
    };
    num.checked_mul(multiplier)
}

// ── Public API ──

/// Lex a .kfs source string into tokens.
///
/// Lexing is non-fatal: errors are collected and the lexer continues past
/// bad characters.
pub fn lex(source: &str) -> LexResult {
    let lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    for (result, range) in lexer.spanned() {
        let span = Span {
            start: range.start,
            end: range.end,
        };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => errors.push(LexError {
                span,
                message: format!("unexpected character: {:?}", &source[span.start..span.end]),
            }),
        }
    }

    LexResult { tokens, errors }
}

// ── Tests ──
