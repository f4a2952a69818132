//! Lexer for the template language.
//!
//! Tokenizes Jinja-like template syntax: raw text interleaved with block,
//! variable and comment markers, and an expression sublanguage inside the
//! markers. Whitespace inside markers is emitted as explicit tokens so the
//! parser can choose to observe or skip it.

use regex::Regex;
use std::fmt;
use std::sync::Arc;

/// Characters that terminate a symbol and begin an operator/punctuation token.
const DELIM_CHARS: &str = "()[]{}%*-+~/#,:|.<>=!";

/// Multi-character operators, matched greedily (longest first).
const COMPLEX_OPS: [&str; 8] = ["==", "===", "!=", "!==", "<=", ">=", "//", "**"];

fn is_delim(c: char) -> bool {
    DELIM_CHARS.contains(c)
}

/// The whitespace set recognized inside markers.
fn is_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\r' | '\n' | '\u{00a0}')
}

/// Delimiter strings for the three marker kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tags {
    pub block_start: String,
    pub block_end: String,
    pub variable_start: String,
    pub variable_end: String,
    pub comment_start: String,
    pub comment_end: String,
}

impl Default for Tags {
    fn default() -> Self {
        Self {
            block_start: "{%".to_string(),
            block_end: "%}".to_string(),
            variable_start: "{{".to_string(),
            variable_end: "}}".to_string(),
            comment_start: "{#".to_string(),
            comment_end: "#}".to_string(),
        }
    }
}

/// Tokenizer configuration.
///
/// Custom delimiters must be ASCII: the whitespace-control checks index
/// marker values by byte.
#[derive(Debug, Clone, Default)]
pub struct TokenizerOptions {
    pub tags: Tags,
    /// Eat the first newline after a block end marker.
    pub trim_blocks: bool,
    /// Strip whitespace-only line prefixes before a block start marker.
    pub lstrip_blocks: bool,
}

/// Token types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Data,
    BlockStart,
    BlockEnd,
    VariableStart,
    VariableEnd,
    Comment,
    Symbol,
    String,
    Int,
    Float,
    Boolean,
    None,
    Regex,
    Whitespace,
    Operator,
    Pipe,
    Tilde,
    Comma,
    Colon,
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftCurly,
    RightCurly,
    /// Lexer-detected error; the value carries the message.
    Error,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenKind::Data => "data",
            TokenKind::BlockStart => "block-start",
            TokenKind::BlockEnd => "block-end",
            TokenKind::VariableStart => "variable-start",
            TokenKind::VariableEnd => "variable-end",
            TokenKind::Comment => "comment",
            TokenKind::Symbol => "symbol",
            TokenKind::String => "string",
            TokenKind::Int => "int",
            TokenKind::Float => "float",
            TokenKind::Boolean => "boolean",
            TokenKind::None => "none",
            TokenKind::Regex => "regex",
            TokenKind::Whitespace => "whitespace",
            TokenKind::Operator => "operator",
            TokenKind::Pipe => "pipe",
            TokenKind::Tilde => "tilde",
            TokenKind::Comma => "comma",
            TokenKind::Colon => "colon",
            TokenKind::LeftParen => "left-paren",
            TokenKind::RightParen => "right-paren",
            TokenKind::LeftBracket => "left-bracket",
            TokenKind::RightBracket => "right-bracket",
            TokenKind::LeftCurly => "left-curly",
            TokenKind::RightCurly => "right-curly",
            TokenKind::Error => "error",
        };
        f.write_str(name)
    }
}

/// Token payload. Everything carries its source text except regex
/// literals, which are structured.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenValue {
    Str(String),
    Regex { body: String, flags: String },
}

/// A token with its 0-based source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub value: TokenValue,
    pub lineno: usize,
    pub colno: usize,
}

impl Token {
    pub(crate) fn new(kind: TokenKind, value: impl Into<String>, lineno: usize, colno: usize) -> Self {
        Self {
            kind,
            value: TokenValue::Str(value.into()),
            lineno,
            colno,
        }
    }

    /// The token's textual value. For regex literals this is the body.
    pub fn text(&self) -> &str {
        match &self.value {
            TokenValue::Str(s) => s,
            TokenValue::Regex { body, .. } => body,
        }
    }
}

/// Tokenizer state (owns the source string via Arc for cheap cloning).
pub struct Tokenizer {
    source: Arc<String>,
    /// Current byte position in source
    pos: usize,
    /// Current 0-based line
    lineno: usize,
    /// Current 0-based column (chars since line start)
    colno: usize,
    /// Are we inside a tag/expression (vs raw text)?
    in_code: bool,
    tags: Tags,
    trim_blocks: bool,
    lstrip_blocks: bool,
}

impl Tokenizer {
    pub fn new(source: impl Into<String>, opts: TokenizerOptions) -> Self {
        Self {
            source: Arc::new(source.into()),
            pos: 0,
            lineno: 0,
            colno: 0,
            in_code: false,
            tags: opts.tags,
            trim_blocks: opts.trim_blocks,
            lstrip_blocks: opts.lstrip_blocks,
        }
    }

    /// Get the source string
    pub fn source(&self) -> &Arc<String> {
        &self.source
    }

    /// The configured delimiter strings.
    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn is_finished(&self) -> bool {
        self.pos >= self.source.len()
    }

    /// Peek at the next character without consuming
    fn peek_char(&self) -> Option<char> {
        self.source[self.pos..].chars().next()
    }

    /// Does the remaining input start with `s`?
    fn matches(&self, s: &str) -> bool {
        self.source[self.pos..].starts_with(s)
    }

    /// Advance by one character and return it
    fn advance(&mut self) -> Option<char> {
        let c = self.peek_char()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.lineno += 1;
            self.colno = 0;
        } else {
            self.colno += 1;
        }
        Some(c)
    }

    /// Advance over a string known to be at the current position.
    fn forward_str(&mut self, s: &str) {
        for _ in s.chars() {
            self.advance();
        }
    }

    /// Step back one character, restoring line/column.
    fn back(&mut self) {
        let Some(c) = self.source[..self.pos].chars().next_back() else {
            return;
        };
        self.pos -= c.len_utf8();
        if c == '\n' {
            self.lineno = self.lineno.saturating_sub(1);
            let line_start = self.source[..self.pos]
                .rfind('\n')
                .map(|i| i + 1)
                .unwrap_or(0);
            self.colno = self.source[line_start..self.pos].chars().count();
        } else {
            self.colno = self.colno.saturating_sub(1);
        }
    }

    /// Rewind the input by `count` characters.
    pub fn back_n(&mut self, count: usize) {
        for _ in 0..count {
            self.back();
        }
    }

    /// Match a regex against the remaining input and advance past the
    /// match. Returns the capture groups (index 0 is the whole match), or
    /// nothing if the pattern does not match.
    pub fn extract_regex(&mut self, re: &Regex) -> Option<Vec<String>> {
        let (end, groups) = {
            let caps = re.captures(&self.source[self.pos..])?;
            let end = caps.get(0).map_or(0, |m| m.end());
            let groups = caps
                .iter()
                .map(|m| m.map_or_else(String::new, |m| m.as_str().to_string()))
                .collect::<Vec<_>>();
            (end, groups)
        };
        let target = self.pos + end;
        while self.pos < target {
            if self.advance().is_none() {
                break;
            }
        }
        Some(groups)
    }

    /// Get the next token, or nothing at end of input.
    pub fn next_token(&mut self) -> Option<Token> {
        let lineno = self.lineno;
        let colno = self.colno;
        if self.in_code {
            self.lex_code(lineno, colno)
        } else {
            self.lex_data(lineno, colno)
        }
    }

    /// Lex raw template text until a marker opens (or emit the marker).
    fn lex_data(&mut self, lineno: usize, colno: usize) -> Option<Token> {
        if self.is_finished() {
            return None;
        }

        let block_start = self.tags.block_start.clone();
        let variable_start = self.tags.variable_start.clone();
        let comment_start = self.tags.comment_start.clone();
        let comment_end = self.tags.comment_end.clone();

        // Opening markers, whitespace-control variant first so the '-'
        // lands in the token value.
        for (tag, kind) in [
            (&block_start, TokenKind::BlockStart),
            (&variable_start, TokenKind::VariableStart),
        ] {
            let dashed = format!("{tag}-");
            if self.matches(&dashed) {
                self.forward_str(&dashed);
                self.in_code = true;
                return Some(Token::new(kind, dashed, lineno, colno));
            }
            if self.matches(tag) {
                self.forward_str(tag);
                self.in_code = true;
                return Some(Token::new(kind, tag.clone(), lineno, colno));
            }
        }

        let mut tok = String::new();
        let mut in_comment = false;
        if self.matches(&comment_start) {
            self.forward_str(&comment_start);
            tok.push_str(&comment_start);
            in_comment = true;
        }

        loop {
            if self.is_finished() {
                if in_comment {
                    return Some(Token::new(
                        TokenKind::Error,
                        "expected end of comment, got end of file",
                        self.lineno,
                        self.colno,
                    ));
                }
                break;
            }
            if !in_comment
                && (self.matches(&block_start)
                    || self.matches(&variable_start)
                    || self.matches(&comment_start))
            {
                if self.lstrip_blocks && self.matches(&block_start) {
                    // Drop the current line's prefix if it is pure whitespace.
                    let col = self.colno;
                    let tok_chars = tok.chars().count();
                    if col > 0 && col <= tok_chars {
                        let split = tok
                            .char_indices()
                            .nth(tok_chars - col)
                            .map(|(i, _)| i)
                            .unwrap_or(0);
                        if tok[split..].chars().all(is_space) {
                            tok.truncate(split);
                            if tok.is_empty() {
                                return self.next_token();
                            }
                        }
                    }
                }
                break;
            }
            if self.matches(&comment_end) {
                if !in_comment {
                    let lineno = self.lineno;
                    let colno = self.colno;
                    self.forward_str(&comment_end);
                    return Some(Token::new(
                        TokenKind::Error,
                        "unexpected end of comment",
                        lineno,
                        colno,
                    ));
                }
                self.forward_str(&comment_end);
                tok.push_str(&comment_end);
                break;
            }
            tok.push(self.advance()?);
        }

        let kind = if in_comment {
            TokenKind::Comment
        } else {
            TokenKind::Data
        };
        Some(Token::new(kind, tok, lineno, colno))
    }

    /// Lex code (inside `{{ }}` or `{% %}`).
    fn lex_code(&mut self, lineno: usize, colno: usize) -> Option<Token> {
        let cur = self.peek_char()?;

        if cur == '"' || cur == '\'' {
            return Some(self.lex_string(cur, lineno, colno));
        }

        if is_space(cur) {
            let mut run = String::new();
            while let Some(c) = self.peek_char() {
                if !is_space(c) {
                    break;
                }
                run.push(c);
                self.advance();
            }
            return Some(Token::new(TokenKind::Whitespace, run, lineno, colno));
        }

        // Closing markers, with and without the whitespace-control dash.
        let block_end = self.tags.block_end.clone();
        let dashed = format!("-{block_end}");
        if self.matches(&block_end) || self.matches(&dashed) {
            let val = if self.matches(&block_end) { block_end } else { dashed };
            self.forward_str(&val);
            self.in_code = false;
            if self.trim_blocks {
                self.skip_block_newline();
            }
            return Some(Token::new(TokenKind::BlockEnd, val, lineno, colno));
        }
        let variable_end = self.tags.variable_end.clone();
        let dashed = format!("-{variable_end}");
        if self.matches(&variable_end) || self.matches(&dashed) {
            let val = if self.matches(&variable_end) {
                variable_end
            } else {
                dashed
            };
            self.forward_str(&val);
            self.in_code = false;
            return Some(Token::new(TokenKind::VariableEnd, val, lineno, colno));
        }

        // Regex literal: r/body/flags
        if cur == 'r' && self.source[self.pos..].chars().nth(1) == Some('/') {
            return Some(self.lex_regex(lineno, colno));
        }

        if is_delim(cur) {
            self.advance();
            let mut op = cur.to_string();
            // Greedy multi-char operators (== to === etc.)
            if let Some(c2) = self.peek_char() {
                let two = format!("{op}{c2}");
                if COMPLEX_OPS.contains(&two.as_str()) {
                    self.advance();
                    op = two;
                    if let Some(c3) = self.peek_char() {
                        let three = format!("{op}{c3}");
                        if COMPLEX_OPS.contains(&three.as_str()) {
                            self.advance();
                            op = three;
                        }
                    }
                }
            }
            let kind = match op.as_str() {
                "(" => TokenKind::LeftParen,
                ")" => TokenKind::RightParen,
                "[" => TokenKind::LeftBracket,
                "]" => TokenKind::RightBracket,
                "{" => TokenKind::LeftCurly,
                "}" => TokenKind::RightCurly,
                "," => TokenKind::Comma,
                ":" => TokenKind::Colon,
                "~" => TokenKind::Tilde,
                "|" => TokenKind::Pipe,
                _ => TokenKind::Operator,
            };
            return Some(Token::new(kind, op, lineno, colno));
        }

        // Symbol or number: everything up to whitespace or a delimiter.
        let mut run = String::new();
        while let Some(c) = self.peek_char() {
            if is_space(c) || is_delim(c) {
                break;
            }
            run.push(c);
            self.advance();
        }

        if !run.is_empty() && run.bytes().all(|b| b.is_ascii_digit()) {
            if self.peek_char() == Some('.') {
                self.advance();
                let mut dec = String::new();
                while let Some(c) = self.peek_char() {
                    if !c.is_ascii_digit() {
                        break;
                    }
                    dec.push(c);
                    self.advance();
                }
                return Some(Token::new(
                    TokenKind::Float,
                    format!("{run}.{dec}"),
                    lineno,
                    colno,
                ));
            }
            return Some(Token::new(TokenKind::Int, run, lineno, colno));
        }

        let kind = match run.as_str() {
            "true" | "false" => TokenKind::Boolean,
            "none" | "null" => TokenKind::None,
            _ => TokenKind::Symbol,
        };
        Some(Token::new(kind, run, lineno, colno))
    }

    /// Lex a string literal
    fn lex_string(&mut self, quote: char, lineno: usize, colno: usize) -> Token {
        self.advance(); // consume opening quote
        let mut value = String::new();

        while let Some(c) = self.peek_char() {
            if c == quote {
                self.advance();
                break;
            }
            if c == '\\' {
                self.advance();
                match self.advance() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('r') => value.push('\r'),
                    Some(other) => value.push(other),
                    Option::None => break,
                }
            } else {
                value.push(c);
                self.advance();
            }
        }

        Token::new(TokenKind::String, value, lineno, colno)
    }

    /// Lex a regex literal: `r/body/flags`. `\/` does not end the body.
    fn lex_regex(&mut self, lineno: usize, colno: usize) -> Token {
        self.advance();
        self.advance(); // r/
        let mut body = String::new();
        let mut prev = '\0';
        while let Some(c) = self.peek_char() {
            if c == '/' && prev != '\\' {
                self.advance();
                break;
            }
            body.push(c);
            prev = c;
            self.advance();
        }
        let mut flags = String::new();
        while let Some(c) = self.peek_char() {
            if !matches!(c, 'g' | 'i' | 'm' | 'y') {
                break;
            }
            flags.push(c);
            self.advance();
        }
        Token {
            kind: TokenKind::Regex,
            value: TokenValue::Regex { body, flags },
            lineno,
            colno,
        }
    }

    /// Eat a single newline after a block end (`trim_blocks`).
    fn skip_block_newline(&mut self) {
        match self.peek_char() {
            Some('\n') => {
                self.advance();
            }
            Some('\r') => {
                self.advance();
                if self.peek_char() == Some('\n') {
                    self.advance();
                }
            }
            _ => {}
        }
    }
}

/// Iterator implementation for convenient use
impl Iterator for Tokenizer {
    type Item = Token;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_token()
    }
}
