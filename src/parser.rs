//! Parser for the template language.
//!
//! Transforms the token stream into an AST. A single parser instance owns
//! its tokenizer and a one-slot pushback buffer; lookahead never exceeds
//! one token. Registered extensions are consulted for unknown block tags
//! and may reenter the parser through its public operations.

use crate::ast::*;
use crate::error::{Result, TemplateError};
use crate::extension::Extension;
use crate::lexer::{Token, TokenKind, TokenValue, Tokenizer};
use regex::Regex;
use std::sync::Arc;

fn span_of(tok: &Token) -> Span {
    Span::new(tok.lineno, tok.colno)
}

/// First character of an importable name (symbol or string literal).
fn leading_name_char(expr: &Expr) -> Option<char> {
    match expr {
        Expr::Symbol(s) => s.name.chars().next(),
        Expr::Literal(Literal {
            value: LiteralValue::Str(s),
            ..
        }) => s.chars().next(),
        _ => None,
    }
}

/// Parser state
pub struct Parser {
    tokens: Tokenizer,
    /// One-slot pushback buffer
    peeked: Option<Token>,
    /// Latched by a `-` on a closing marker; consumed at the next text
    /// emission
    drop_leading_whitespace: bool,
    /// Block names that make `parse_nodes` yield control to its caller
    break_on_blocks: Option<Vec<String>>,
    extensions: Vec<Arc<dyn Extension>>,
}

impl Parser {
    pub fn new(tokens: Tokenizer) -> Self {
        Self::with_extensions(tokens, Vec::new())
    }

    pub fn with_extensions(tokens: Tokenizer, extensions: Vec<Arc<dyn Extension>>) -> Self {
        Self {
            tokens,
            peeked: None,
            drop_leading_whitespace: false,
            break_on_blocks: None,
            extensions,
        }
    }

    /// Parse the full template.
    pub fn parse(mut self) -> Result<Root> {
        tracing::trace!("parsing template");
        let children = self.parse_nodes()?;
        Ok(Root {
            span: Span::default(),
            children,
        })
    }

    // ========================================================================
    // Token cursor
    // ========================================================================

    /// Pull the next token from the tokenizer, optionally skipping
    /// whitespace tokens.
    fn pull(&mut self, with_whitespace: bool) -> Option<Token> {
        let mut tok = self.tokens.next_token();
        if !with_whitespace {
            while matches!(&tok, Some(t) if t.kind == TokenKind::Whitespace) {
                tok = self.tokens.next_token();
            }
        }
        tok
    }

    /// Return the next token, honoring the pushback slot. A pushed-back
    /// whitespace token is dropped silently unless `with_whitespace` is
    /// set.
    pub fn next_token(&mut self, with_whitespace: bool) -> Option<Token> {
        if let Some(tok) = self.peeked.take() {
            if with_whitespace || tok.kind != TokenKind::Whitespace {
                return Some(tok);
            }
        }
        self.pull(with_whitespace)
    }

    /// Lazily fill and return the pushback slot.
    pub fn peek_token(&mut self) -> Option<Token> {
        if self.peeked.is_none() {
            self.peeked = self.pull(false);
        }
        self.peeked.clone()
    }

    /// Push a token back. At most one token may be buffered between
    /// reads; a second push is a bug in the caller, not in the template.
    pub fn push_token(&mut self, tok: Token) {
        if self.peeked.is_some() {
            panic!("push_token: can only push one token between reads");
        }
        self.peeked = Some(tok);
    }

    fn peek_pos(&mut self) -> Option<(usize, usize)> {
        self.peek_token().map(|t| (t.lineno, t.colno))
    }

    /// Build a [`TemplateError`], deriving the position from the next
    /// peekable token when not passed explicitly. `pos` is the 0-based
    /// (line, column) of the offending token.
    pub fn error(&mut self, msg: impl Into<String>, pos: Option<(usize, usize)>) -> TemplateError {
        let pos = pos.or_else(|| self.peek_pos());
        TemplateError::at(msg, pos)
    }

    // ========================================================================
    // Skip/expect helpers
    // ========================================================================

    /// Consume a token if its type matches; otherwise push it back.
    pub fn skip(&mut self, kind: TokenKind) -> bool {
        match self.next_token(false) {
            Some(tok) if tok.kind == kind => true,
            Some(tok) => {
                self.push_token(tok);
                false
            }
            None => false,
        }
    }

    /// Consume a token if both its type and value match.
    pub fn skip_value(&mut self, kind: TokenKind, value: &str) -> bool {
        match self.next_token(false) {
            Some(tok) if tok.kind == kind && tok.text() == value => true,
            Some(tok) => {
                self.push_token(tok);
                false
            }
            None => false,
        }
    }

    pub fn skip_symbol(&mut self, name: &str) -> bool {
        self.skip_value(TokenKind::Symbol, name)
    }

    /// Consume a token of the given type or fail at the offending token.
    pub fn expect(&mut self, kind: TokenKind) -> Result<Token> {
        match self.next_token(false) {
            Some(tok) if tok.kind == kind => Ok(tok),
            Some(tok) => Err(TemplateError::at(
                format!("expected {kind}, got {}", tok.kind),
                Some((tok.lineno, tok.colno)),
            )),
            None => Err(self.error("unexpected end of file", None)),
        }
    }

    // ========================================================================
    // Whitespace control
    // ========================================================================

    /// Consume a statement's closing `%}`, recording a `-%}` in the
    /// whitespace latch. When `name` is absent the next symbol token is
    /// consumed as the statement name (used for terminator tags).
    pub fn advance_after_block_end(&mut self, name: Option<&str>) -> Result<Token> {
        let name = match name {
            Some(n) => n.to_string(),
            None => match self.next_token(false) {
                Some(tok) if tok.kind == TokenKind::Symbol => tok.text().to_string(),
                Some(_) => {
                    return Err(self.error(
                        "advance_after_block_end: expected symbol token or explicit name to be passed",
                        None,
                    ));
                }
                None => return Err(self.error("unexpected end of file", None)),
            },
        };
        match self.next_token(false) {
            Some(tok) if tok.kind == TokenKind::BlockEnd => {
                if tok.text().starts_with('-') {
                    self.drop_leading_whitespace = true;
                }
                Ok(tok)
            }
            _ => Err(self.error(format!("expected block end in {name} statement"), None)),
        }
    }

    /// Consume a closing `}}`, recording a `-}}` in the whitespace latch.
    pub fn advance_after_variable_end(&mut self) -> Result<()> {
        let end_len = self.tokens.tags().variable_end.len();
        match self.next_token(false) {
            Some(tok) if tok.kind == TokenKind::VariableEnd => {
                let text = tok.text();
                self.drop_leading_whitespace = text
                    .len()
                    .checked_sub(end_len + 1)
                    .and_then(|i| text.as_bytes().get(i))
                    == Some(&b'-');
                Ok(())
            }
            Some(tok) => {
                self.push_token(tok);
                Err(self.error("expected variable end", None))
            }
            None => Err(self.error("expected variable end", None)),
        }
    }

    // ========================================================================
    // Top-level driver
    // ========================================================================

    /// Parse top-level nodes until end of input or a break block.
    pub fn parse_nodes(&mut self) -> Result<Vec<Node>> {
        let mut buf = Vec::new();
        while let Some(tok) = self.next_token(false) {
            match tok.kind {
                TokenKind::Data => {
                    let mut data = tok.text().to_string();
                    if self.drop_leading_whitespace {
                        data = data.trim_start().to_string();
                        self.drop_leading_whitespace = false;
                    }
                    // A `-` on the next opening marker strips this text's
                    // trailing whitespace.
                    if let Some(next) = self.peek_token() {
                        let val = next.text();
                        let tags = self.tokens.tags();
                        let strip = match next.kind {
                            TokenKind::BlockStart => val.ends_with('-'),
                            TokenKind::VariableStart => {
                                val.as_bytes().get(tags.variable_start.len()) == Some(&b'-')
                            }
                            TokenKind::Comment => {
                                val.as_bytes().get(tags.comment_start.len()) == Some(&b'-')
                            }
                            _ => false,
                        };
                        if strip {
                            data.truncate(data.trim_end().len());
                        }
                    }
                    let span = span_of(&tok);
                    buf.push(Node::Output(Output {
                        span,
                        children: vec![Expr::TemplateData(TemplateData { span, data })],
                    }));
                }
                TokenKind::BlockStart => {
                    self.drop_leading_whitespace = false;
                    match self.parse_statement()? {
                        Some(node) => buf.push(node),
                        None => break,
                    }
                }
                TokenKind::VariableStart => {
                    let expr = self.parse_expression()?;
                    self.drop_leading_whitespace = false;
                    self.advance_after_variable_end()?;
                    let span = expr.span();
                    buf.push(Node::Output(Output {
                        span,
                        children: vec![expr],
                    }));
                }
                TokenKind::Comment => {
                    let end_len = self.tokens.tags().comment_end.len();
                    let text = tok.text();
                    self.drop_leading_whitespace = text
                        .len()
                        .checked_sub(end_len + 1)
                        .and_then(|i| text.as_bytes().get(i))
                        == Some(&b'-');
                }
                TokenKind::Error => {
                    return Err(TemplateError::at(
                        tok.text(),
                        Some((tok.lineno, tok.colno)),
                    ));
                }
                _ => {
                    return Err(TemplateError::at(
                        format!("unexpected token at top-level: {}", tok.kind),
                        Some((tok.lineno, tok.colno)),
                    ));
                }
            }
        }
        Ok(buf)
    }

    /// Parse statements until one of the named blocks is seen.
    /// `break_on_blocks` is saved and restored around the nested parse,
    /// also when it fails.
    pub fn parse_until_blocks(&mut self, names: &[&str]) -> Result<Vec<Node>> {
        let prev = self
            .break_on_blocks
            .replace(names.iter().map(|s| s.to_string()).collect());
        let result = self.parse_nodes();
        self.break_on_blocks = prev;
        result
    }

    /// Parse one statement after a `{%`. Returns `None` when the block's
    /// first symbol is in `break_on_blocks`.
    pub fn parse_statement(&mut self) -> Result<Option<Node>> {
        let Some(tok) = self.peek_token() else {
            return Err(self.error("unexpected end of file", None));
        };
        if tok.kind != TokenKind::Symbol {
            return Err(TemplateError::at(
                "tag name expected",
                Some((tok.lineno, tok.colno)),
            ));
        }
        let tag = tok.text().to_string();
        if let Some(breaks) = &self.break_on_blocks {
            if breaks.iter().any(|b| b == &tag) {
                return Ok(None);
            }
        }
        let node = match tag.as_str() {
            "raw" => self.parse_raw("raw")?,
            "verbatim" => self.parse_raw("verbatim")?,
            "if" | "ifAsync" => self.parse_if()?,
            "for" | "asyncEach" | "asyncAll" => self.parse_for()?,
            "block" => self.parse_block()?,
            "extends" => self.parse_extends()?,
            "include" => self.parse_include()?,
            "set" => self.parse_set()?,
            "macro" => self.parse_macro()?,
            "call" => self.parse_call()?,
            "import" => self.parse_import()?,
            "from" => self.parse_from()?,
            "filter" => self.parse_filter_statement()?,
            _ => {
                for ext in self.extensions.clone() {
                    if ext.tags().contains(&tag.as_str()) {
                        tracing::trace!(tag = %tag, "dispatching block tag to extension");
                        return ext.parse(self).map(Some);
                    }
                }
                return Err(TemplateError::at(
                    format!("unknown block tag: {tag}"),
                    Some((tok.lineno, tok.colno)),
                ));
            }
        };
        Ok(Some(node))
    }

    /// Peek the tag token that opened the current statement.
    fn tag_token(&mut self) -> Result<Token> {
        self.peek_token()
            .ok_or_else(|| TemplateError::at("unexpected end of file", None))
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn parse_if(&mut self) -> Result<Node> {
        let tag = self.tag_token()?;
        let span = span_of(&tag);
        let is_async = if self.skip_symbol("if")
            || self.skip_symbol("elif")
            || self.skip_symbol("elseif")
        {
            false
        } else if self.skip_symbol("ifAsync") {
            true
        } else {
            return Err(self.error("expected if, elif, or elseif", Some((tag.lineno, tag.colno))));
        };

        let cond = self.parse_expression()?;
        self.advance_after_block_end(Some(tag.text()))?;
        let body = NodeList {
            span,
            children: self.parse_until_blocks(&["elif", "elseif", "else", "endif"])?,
        };

        let else_ = match self.peek_token() {
            Some(t) if t.text() == "elif" || t.text() == "elseif" => {
                Some(ElseBranch::Elif(Box::new(self.parse_if()?)))
            }
            Some(t) if t.text() == "else" => {
                self.advance_after_block_end(None)?;
                let else_body = NodeList {
                    span,
                    children: self.parse_until_blocks(&["endif"])?,
                };
                self.advance_after_block_end(None)?;
                Some(ElseBranch::Body(else_body))
            }
            Some(t) if t.text() == "endif" => {
                self.advance_after_block_end(None)?;
                None
            }
            _ => {
                return Err(self.error("expected elif, else, or endif, got end of file", None));
            }
        };

        let node = If {
            span,
            cond,
            body,
            else_,
        };
        Ok(if is_async {
            Node::IfAsync(node)
        } else {
            Node::If(node)
        })
    }

    fn parse_for(&mut self) -> Result<Node> {
        let tag = self.tag_token()?;
        let span = span_of(&tag);
        let (wrap, end_block): (fn(For) -> Node, &str) = if self.skip_symbol("for") {
            (Node::For, "endfor")
        } else if self.skip_symbol("asyncEach") {
            (Node::AsyncEach, "endeach")
        } else if self.skip_symbol("asyncAll") {
            (Node::AsyncAll, "endall")
        } else {
            return Err(self.error(
                "expected for, asyncEach, or asyncAll",
                Some((tag.lineno, tag.colno)),
            ));
        };

        let mut name = self.parse_primary(false)?;
        if !matches!(name, Expr::Symbol(_)) {
            return Err(self.error("variable name expected", Some((tag.lineno, tag.colno))));
        }
        // Comma-separated targets become an unpacking array.
        if matches!(self.peek_token(), Some(t) if t.kind == TokenKind::Comma) {
            let mut arr = Array {
                span: name.span(),
                children: vec![name],
            };
            while self.skip(TokenKind::Comma) {
                arr.children.push(self.parse_primary(false)?);
            }
            name = Expr::Array(arr);
        }

        if !self.skip_symbol("in") {
            return Err(self.error(
                "expected \"in\" keyword for loop",
                Some((tag.lineno, tag.colno)),
            ));
        }
        let arr = self.parse_expression()?;
        self.advance_after_block_end(Some(tag.text()))?;

        let body = NodeList {
            span,
            children: self.parse_until_blocks(&[end_block, "else"])?,
        };
        let else_ = if self.skip_symbol("else") {
            self.advance_after_block_end(Some("else"))?;
            Some(NodeList {
                span,
                children: self.parse_until_blocks(&[end_block])?,
            })
        } else {
            None
        };
        self.advance_after_block_end(None)?;

        Ok(wrap(For {
            span,
            name,
            arr,
            body,
            else_,
        }))
    }

    fn parse_block(&mut self) -> Result<Node> {
        let tag = self.tag_token()?;
        let span = span_of(&tag);
        if !self.skip_symbol("block") {
            return Err(self.error("expected block", Some((tag.lineno, tag.colno))));
        }
        let name = self.parse_primary(false)?;
        if !matches!(name, Expr::Symbol(_)) {
            return Err(self.error("variable name expected", Some((tag.lineno, tag.colno))));
        }
        self.advance_after_block_end(Some(tag.text()))?;
        let body = NodeList {
            span,
            children: self.parse_until_blocks(&["endblock"])?,
        };
        // Both `endblock` and the repeated block name may be omitted.
        self.skip_symbol("endblock");
        if let Expr::Symbol(sym) = &name {
            let block_name = sym.name.clone();
            self.skip_symbol(&block_name);
        }
        match self.peek_token() {
            Some(tok) => {
                self.advance_after_block_end(Some(tok.text()))?;
            }
            None => return Err(self.error("expected endblock, got end of file", None)),
        }
        Ok(Node::Block(Block { span, name, body }))
    }

    fn parse_extends(&mut self) -> Result<Node> {
        let tag = self.tag_token()?;
        let span = span_of(&tag);
        if !self.skip_symbol("extends") {
            return Err(self.error("expected extends", Some((tag.lineno, tag.colno))));
        }
        let template = self.parse_expression()?;
        self.advance_after_block_end(Some(tag.text()))?;
        Ok(Node::Extends(Extends { span, template }))
    }

    fn parse_include(&mut self) -> Result<Node> {
        let tag = self.tag_token()?;
        let span = span_of(&tag);
        if !self.skip_symbol("include") {
            return Err(self.error("expected include", Some((tag.lineno, tag.colno))));
        }
        let template = self.parse_expression()?;
        let ignore_missing = self.skip_symbol("ignore") && self.skip_symbol("missing");
        self.advance_after_block_end(Some(tag.text()))?;
        Ok(Node::Include(Include {
            span,
            template,
            ignore_missing,
        }))
    }

    fn parse_set(&mut self) -> Result<Node> {
        let tag = self.tag_token()?;
        let span = span_of(&tag);
        if !self.skip_symbol("set") {
            return Err(self.error("expected set", Some((tag.lineno, tag.colno))));
        }
        let mut targets = Vec::new();
        loop {
            targets.push(self.parse_primary(false)?);
            if !self.skip(TokenKind::Comma) {
                break;
            }
        }

        let (value, body) = if self.skip_value(TokenKind::Operator, "=") {
            let value = self.parse_expression()?;
            self.advance_after_block_end(Some(tag.text()))?;
            (Some(value), None)
        } else if self.skip(TokenKind::BlockEnd) {
            let capture = Capture {
                span,
                body: NodeList {
                    span,
                    children: self.parse_until_blocks(&["endset"])?,
                },
            };
            self.advance_after_block_end(None)?;
            (None, Some(capture))
        } else {
            return Err(self.error(
                "expected = or block end in set tag",
                Some((tag.lineno, tag.colno)),
            ));
        };

        Ok(Node::Set(Set {
            span,
            targets,
            value,
            body,
        }))
    }

    fn parse_macro(&mut self) -> Result<Node> {
        let tag = self.tag_token()?;
        let span = span_of(&tag);
        if !self.skip_symbol("macro") {
            return Err(self.error("expected macro", Some((tag.lineno, tag.colno))));
        }
        let name = self.parse_primary(true)?;
        let args = self.parse_signature(false)?;
        self.advance_after_block_end(Some(tag.text()))?;
        let body = NodeList {
            span,
            children: self.parse_until_blocks(&["endmacro"])?,
        };
        self.advance_after_block_end(None)?;
        Ok(Node::Macro(Macro {
            span,
            name,
            args,
            body,
        }))
    }

    /// A call block is parsed as a normal function call with an extra
    /// `caller` keyword argument carrying the block body.
    fn parse_call(&mut self) -> Result<Node> {
        let tag = self.tag_token()?;
        let span = span_of(&tag);
        if !self.skip_symbol("call") {
            return Err(self.error("expected call block", Some((tag.lineno, tag.colno))));
        }
        let caller_args = self
            .try_parse_signature()?
            .unwrap_or_else(|| ArgList::new(span));
        let macro_call = self.parse_primary(false)?;
        self.advance_after_block_end(Some(tag.text()))?;
        let body = NodeList {
            span,
            children: self.parse_until_blocks(&["endcall"])?,
        };
        self.advance_after_block_end(None)?;

        let caller_name = Symbol {
            span,
            name: "caller".to_string(),
        };
        let caller = Expr::Caller(Box::new(Caller {
            span,
            name: caller_name.clone(),
            args: caller_args,
            body,
        }));

        let Expr::FunCall(mut call) = macro_call else {
            return Err(TemplateError::at(
                "expected macro call after call block",
                Some((tag.lineno, tag.colno)),
            ));
        };
        let pair = Pair {
            span,
            key: Expr::Symbol(caller_name),
            value: caller,
        };
        match call.args.children.last_mut() {
            Some(Expr::KeywordArgs(kw)) => kw.items.push(pair),
            _ => call.args.children.push(Expr::KeywordArgs(KeywordArgs {
                span,
                items: vec![pair],
            })),
        }
        Ok(Node::Output(Output {
            span,
            children: vec![Expr::FunCall(call)],
        }))
    }

    fn parse_import(&mut self) -> Result<Node> {
        let tag = self.tag_token()?;
        let span = span_of(&tag);
        if !self.skip_symbol("import") {
            return Err(self.error("expected import", Some((tag.lineno, tag.colno))));
        }
        let template = self.parse_expression()?;
        if !self.skip_symbol("as") {
            return Err(self.error("expected \"as\" keyword", Some((tag.lineno, tag.colno))));
        }
        let target = self.parse_expression()?;
        let with_context = self.parse_with_context()?;
        self.advance_after_block_end(Some(tag.text()))?;
        Ok(Node::Import(Import {
            span,
            template,
            target,
            with_context,
        }))
    }

    fn parse_from(&mut self) -> Result<Node> {
        let tag = self.tag_token()?;
        let span = span_of(&tag);
        if !self.skip_symbol("from") {
            return Err(self.error("expected from", Some((tag.lineno, tag.colno))));
        }
        let template = self.parse_expression()?;
        if !self.skip_symbol("import") {
            return Err(self.error("expected import", Some((tag.lineno, tag.colno))));
        }

        let mut children = Vec::new();
        let mut with_context = None;
        loop {
            let Some(next_tok) = self.peek_token() else {
                return Err(self.error("unexpected end of file", None));
            };
            if next_tok.kind == TokenKind::BlockEnd {
                if children.is_empty() {
                    return Err(TemplateError::at(
                        "expected at least one import name",
                        Some((next_tok.lineno, next_tok.colno)),
                    ));
                }
                // The block end is consumed manually here, so the
                // whitespace latch must be maintained manually too.
                if next_tok.text().starts_with('-') {
                    self.drop_leading_whitespace = true;
                }
                self.next_token(false);
                break;
            }
            if !children.is_empty() && !self.skip(TokenKind::Comma) {
                return Err(TemplateError::at(
                    "expected comma",
                    Some((next_tok.lineno, next_tok.colno)),
                ));
            }

            let name = self.parse_primary(false)?;
            if leading_name_char(&name) == Some('_') {
                let s = name.span();
                return Err(TemplateError::at(
                    "names starting with an underscore cannot be imported",
                    Some((s.lineno, s.colno)),
                ));
            }
            if self.skip_symbol("as") {
                let alias = self.parse_primary(false)?;
                children.push(Expr::Pair(Box::new(Pair {
                    span: name.span(),
                    key: name,
                    value: alias,
                })));
            } else {
                children.push(name);
            }
            with_context = self.parse_with_context()?;
        }

        Ok(Node::FromImport(FromImport {
            span,
            template,
            names: ArgList { span, children },
            with_context,
        }))
    }

    fn parse_with_context(&mut self) -> Result<Option<bool>> {
        let with_context = if self.skip_symbol("with") {
            Some(true)
        } else if self.skip_symbol("without") {
            Some(false)
        } else {
            None
        };
        if with_context.is_some() && !self.skip_symbol("context") {
            return Err(self.error("expected context after with/without", None));
        }
        Ok(with_context)
    }

    /// `{% filter name(args) %}body{% endfilter %}`: the captured body
    /// becomes the filter's first argument.
    fn parse_filter_statement(&mut self) -> Result<Node> {
        let tag = self.tag_token()?;
        if !self.skip_symbol("filter") {
            return Err(self.error("expected filter", Some((tag.lineno, tag.colno))));
        }
        let name = self.parse_filter_name()?;
        let args = self.parse_filter_args()?;
        self.advance_after_block_end(Some(tag.text()))?;
        let span = name.span;
        let capture = Capture {
            span,
            body: NodeList {
                span,
                children: self.parse_until_blocks(&["endfilter"])?,
            },
        };
        self.advance_after_block_end(None)?;

        let mut children = vec![Expr::Capture(Box::new(capture))];
        children.extend(args);
        let filter = Expr::Filter(Box::new(Filter {
            span,
            name,
            args: ArgList { span, children },
        }));
        Ok(Node::Output(Output {
            span,
            children: vec![filter],
        }))
    }

    /// `{% raw %}` / `{% verbatim %}`: scan the underlying character
    /// stream for the matching terminator, tracking nesting, and emit the
    /// content verbatim. The final terminator is rewound and consumed by
    /// the scanner's next probe.
    fn parse_raw(&mut self, tag_name: &str) -> Result<Node> {
        let end_tag = format!("end{tag_name}");
        let pattern = format!(r"([\s\S]*?)\{{%-?\s*({tag_name}|{end_tag})\s*-?%\}}");
        let re = Regex::new(&pattern)
            .map_err(|_| TemplateError::at(format!("invalid {tag_name} block pattern"), None))?;

        // Keep the opening tag's block end for line/column numbers.
        let begun = self.advance_after_block_end(None)?;
        let mut raw_level = 1usize;
        let mut content = String::new();

        loop {
            let Some(groups) = self.tokens.extract_regex(&re) else {
                break;
            };
            if raw_level == 0 {
                break;
            }
            let all = &groups[0];
            let pre = &groups[1];
            let block_name = &groups[2];

            if block_name.as_str() == tag_name {
                raw_level += 1;
            } else if block_name.as_str() == end_tag {
                raw_level -= 1;
            }

            if raw_level == 0 {
                // Exclude the terminator and move the tokenizer back to
                // its start; the loop's next probe consumes it.
                content.push_str(pre);
                let rewind = all.chars().count() - pre.chars().count();
                self.tokens.back_n(rewind);
            } else {
                content.push_str(all);
            }
        }

        let span = span_of(&begun);
        Ok(Node::Output(Output {
            span,
            children: vec![Expr::TemplateData(TemplateData {
                span,
                data: content,
            })],
        }))
    }

    // ========================================================================
    // Expression parsing (precedence climbing)
    // ========================================================================

    pub fn parse_expression(&mut self) -> Result<Expr> {
        self.parse_inline_if()
    }

    fn parse_inline_if(&mut self) -> Result<Expr> {
        let mut node = self.parse_or()?;
        if self.skip_symbol("if") {
            let cond = self.parse_or()?;
            let else_ = if self.skip_symbol("else") {
                Some(self.parse_or()?)
            } else {
                None
            };
            let span = node.span();
            node = Expr::InlineIf(Box::new(InlineIf {
                span,
                body: node,
                cond,
                else_,
            }));
        }
        Ok(node)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut node = self.parse_and()?;
        while self.skip_symbol("or") {
            let right = self.parse_and()?;
            let span = node.span();
            node = Expr::Or(Box::new(BinOp {
                span,
                left: node,
                right,
            }));
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut node = self.parse_not()?;
        while self.skip_symbol("and") {
            let right = self.parse_not()?;
            let span = node.span();
            node = Expr::And(Box::new(BinOp {
                span,
                left: node,
                right,
            }));
        }
        Ok(node)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        let pos = self.peek_pos();
        if self.skip_symbol("not") {
            let span = pos.map(|(l, c)| Span::new(l, c)).unwrap_or_default();
            let target = self.parse_not()?;
            return Ok(Expr::Not(Box::new(Unary { span, target })));
        }
        self.parse_in()
    }

    fn parse_in(&mut self) -> Result<Expr> {
        let mut node = self.parse_compare()?;
        loop {
            // check if the next token is 'not'
            let Some(tok) = self.next_token(false) else {
                break;
            };
            let invert = tok.kind == TokenKind::Symbol && tok.text() == "not";
            if !invert {
                // it wasn't 'not', put it back
                self.push_token(tok);
                if !self.skip_symbol("in") {
                    break;
                }
            } else if !self.skip_symbol("in") {
                // an infix 'not' must introduce 'not in'; the token that
                // wasn't 'in' is already buffered by the failed skip
                return Err(self.error(
                    "expected \"in\" keyword after \"not\"",
                    Some((tok.lineno, tok.colno)),
                ));
            }
            let right = self.parse_compare()?;
            let span = node.span();
            node = Expr::In(Box::new(BinOp {
                span,
                left: node,
                right,
            }));
            if invert {
                node = Expr::Not(Box::new(Unary { span, target: node }));
            }
        }
        Ok(node)
    }

    fn parse_compare(&mut self) -> Result<Expr> {
        let expr = self.parse_concat()?;
        let mut ops: Vec<CompareOperand> = Vec::new();
        loop {
            let Some(tok) = self.next_token(false) else {
                break;
            };
            let Some(op) = CompareOp::from_op(tok.text()) else {
                self.push_token(tok);
                break;
            };
            let operand = self.parse_concat()?;
            ops.push(CompareOperand {
                span: span_of(&tok),
                expr: operand,
                op,
            });
        }
        if ops.is_empty() {
            Ok(expr)
        } else {
            let span = ops[0].span;
            Ok(Expr::Compare(Box::new(Compare { span, expr, ops })))
        }
    }

    // finds the '~' for string concatenation
    fn parse_concat(&mut self) -> Result<Expr> {
        let mut node = self.parse_add()?;
        while self.skip_value(TokenKind::Tilde, "~") {
            let right = self.parse_add()?;
            let span = node.span();
            node = Expr::Concat(Box::new(BinOp {
                span,
                left: node,
                right,
            }));
        }
        Ok(node)
    }

    fn parse_add(&mut self) -> Result<Expr> {
        let mut node = self.parse_sub()?;
        while self.skip_value(TokenKind::Operator, "+") {
            let right = self.parse_sub()?;
            let span = node.span();
            node = Expr::Add(Box::new(BinOp {
                span,
                left: node,
                right,
            }));
        }
        Ok(node)
    }

    fn parse_sub(&mut self) -> Result<Expr> {
        let mut node = self.parse_mul()?;
        while self.skip_value(TokenKind::Operator, "-") {
            let right = self.parse_mul()?;
            let span = node.span();
            node = Expr::Sub(Box::new(BinOp {
                span,
                left: node,
                right,
            }));
        }
        Ok(node)
    }

    fn parse_mul(&mut self) -> Result<Expr> {
        let mut node = self.parse_div()?;
        while self.skip_value(TokenKind::Operator, "*") {
            let right = self.parse_div()?;
            let span = node.span();
            node = Expr::Mul(Box::new(BinOp {
                span,
                left: node,
                right,
            }));
        }
        Ok(node)
    }

    fn parse_div(&mut self) -> Result<Expr> {
        let mut node = self.parse_floor_div()?;
        while self.skip_value(TokenKind::Operator, "/") {
            let right = self.parse_floor_div()?;
            let span = node.span();
            node = Expr::Div(Box::new(BinOp {
                span,
                left: node,
                right,
            }));
        }
        Ok(node)
    }

    fn parse_floor_div(&mut self) -> Result<Expr> {
        let mut node = self.parse_mod()?;
        while self.skip_value(TokenKind::Operator, "//") {
            let right = self.parse_mod()?;
            let span = node.span();
            node = Expr::FloorDiv(Box::new(BinOp {
                span,
                left: node,
                right,
            }));
        }
        Ok(node)
    }

    fn parse_mod(&mut self) -> Result<Expr> {
        let mut node = self.parse_pow()?;
        while self.skip_value(TokenKind::Operator, "%") {
            let right = self.parse_pow()?;
            let span = node.span();
            node = Expr::Mod(Box::new(BinOp {
                span,
                left: node,
                right,
            }));
        }
        Ok(node)
    }

    // `**` is parsed as a left-associative loop like the other levels
    fn parse_pow(&mut self) -> Result<Expr> {
        let mut node = self.parse_unary(false)?;
        while self.skip_value(TokenKind::Operator, "**") {
            let right = self.parse_unary(false)?;
            let span = node.span();
            node = Expr::Pow(Box::new(BinOp {
                span,
                left: node,
                right,
            }));
        }
        Ok(node)
    }

    /// `no_filters` keeps a filter chain from binding to the operand of a
    /// prefix operator; the chain is applied to the whole prefix
    /// expression instead.
    fn parse_unary(&mut self, no_filters: bool) -> Result<Expr> {
        let pos = self.peek_pos();
        let span = pos.map(|(l, c)| Span::new(l, c)).unwrap_or_default();
        let mut node = if self.skip_value(TokenKind::Operator, "-") {
            Expr::Neg(Box::new(Unary {
                span,
                target: self.parse_unary(true)?,
            }))
        } else if self.skip_value(TokenKind::Operator, "+") {
            Expr::Pos(Box::new(Unary {
                span,
                target: self.parse_unary(true)?,
            }))
        } else {
            self.parse_primary(false)?
        };
        if !no_filters {
            node = self.parse_filter(node)?;
        }
        Ok(node)
    }

    /// Parse a primary expression: a literal, a symbol, or an aggregate.
    /// Postfix operators are consumed unless `no_postfix` is set.
    pub fn parse_primary(&mut self, no_postfix: bool) -> Result<Expr> {
        let Some(tok) = self.next_token(false) else {
            return Err(self.error("expected expression, got end of file", None));
        };
        let span = span_of(&tok);
        let mut node = match tok.kind {
            TokenKind::String => Expr::Literal(Literal {
                span,
                value: LiteralValue::Str(tok.text().to_string()),
            }),
            TokenKind::Int => {
                let value = tok.text().parse::<i64>().map_err(|_| {
                    TemplateError::at(
                        format!("invalid int literal: {}", tok.text()),
                        Some((tok.lineno, tok.colno)),
                    )
                })?;
                Expr::Literal(Literal {
                    span,
                    value: LiteralValue::Int(value),
                })
            }
            TokenKind::Float => {
                let value = tok.text().parse::<f64>().map_err(|_| {
                    TemplateError::at(
                        format!("invalid float literal: {}", tok.text()),
                        Some((tok.lineno, tok.colno)),
                    )
                })?;
                Expr::Literal(Literal {
                    span,
                    value: LiteralValue::Float(value),
                })
            }
            TokenKind::Boolean => match tok.text() {
                "true" => Expr::Literal(Literal {
                    span,
                    value: LiteralValue::Bool(true),
                }),
                "false" => Expr::Literal(Literal {
                    span,
                    value: LiteralValue::Bool(false),
                }),
                other => {
                    return Err(TemplateError::at(
                        format!("invalid boolean: {other}"),
                        Some((tok.lineno, tok.colno)),
                    ));
                }
            },
            TokenKind::None => Expr::Literal(Literal {
                span,
                value: LiteralValue::None,
            }),
            TokenKind::Regex => {
                let TokenValue::Regex { body, flags } = tok.value.clone() else {
                    return Err(TemplateError::at(
                        "malformed regex token",
                        Some((tok.lineno, tok.colno)),
                    ));
                };
                Expr::Literal(Literal {
                    span,
                    value: LiteralValue::Regex { body, flags },
                })
            }
            TokenKind::Symbol => Expr::Symbol(Symbol {
                span,
                name: tok.text().to_string(),
            }),
            _ => {
                // Not a literal; push the delimiter back and try an
                // aggregate.
                self.push_token(tok.clone());
                match self.parse_aggregate()? {
                    Some(agg) => agg,
                    None => {
                        return Err(TemplateError::at(
                            format!("unexpected token: {}", tok.text()),
                            Some((tok.lineno, tok.colno)),
                        ));
                    }
                }
            }
        };
        if !no_postfix {
            node = self.parse_postfix(node)?;
        }
        Ok(node)
    }

    /// Filter names are one or more dotted symbols.
    fn parse_filter_name(&mut self) -> Result<Symbol> {
        let tok = self.expect(TokenKind::Symbol)?;
        let mut name = tok.text().to_string();
        while self.skip_value(TokenKind::Operator, ".") {
            name.push('.');
            name.push_str(self.expect(TokenKind::Symbol)?.text());
        }
        Ok(Symbol {
            span: span_of(&tok),
            name,
        })
    }

    fn parse_filter_args(&mut self) -> Result<Vec<Expr>> {
        match self.peek_token() {
            Some(t) if t.kind == TokenKind::LeftParen => {
                Ok(self.parse_signature(false)?.children)
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Consume a `| name(args)` chain. The piped operand becomes the
    /// first argument of each filter.
    fn parse_filter(&mut self, mut node: Expr) -> Result<Expr> {
        while self.skip(TokenKind::Pipe) {
            let name = self.parse_filter_name()?;
            let span = name.span;
            let mut children = vec![node];
            children.extend(self.parse_filter_args()?);
            node = Expr::Filter(Box::new(Filter {
                span,
                name,
                args: ArgList { span, children },
            }));
        }
        Ok(node)
    }

    /// Parse a parenthesized group, array literal, or dict literal.
    /// Returns nothing when the next token opens none of them.
    pub fn parse_aggregate(&mut self) -> Result<Option<Expr>> {
        enum Agg {
            Group(Vec<Expr>),
            Array(Vec<Expr>),
            Dict(Vec<Pair>),
        }

        let Some(tok) = self.next_token(false) else {
            return Ok(None);
        };
        let span = span_of(&tok);
        let mut agg = match tok.kind {
            TokenKind::LeftParen => Agg::Group(Vec::new()),
            TokenKind::LeftBracket => Agg::Array(Vec::new()),
            TokenKind::LeftCurly => Agg::Dict(Vec::new()),
            _ => return Ok(None),
        };

        loop {
            let Some(peek) = self.peek_token() else {
                return Err(self.error("unexpected end of file", None));
            };
            if matches!(
                peek.kind,
                TokenKind::RightParen | TokenKind::RightBracket | TokenKind::RightCurly
            ) {
                self.next_token(false);
                break;
            }
            let len = match &agg {
                Agg::Group(c) | Agg::Array(c) => c.len(),
                Agg::Dict(p) => p.len(),
            };
            if len > 0 && !self.skip(TokenKind::Comma) {
                return Err(self.error(
                    "expected comma after expression",
                    Some((tok.lineno, tok.colno)),
                ));
            }
            match &mut agg {
                Agg::Dict(pairs) => {
                    let key = self.parse_primary(false)?;
                    if !self.skip(TokenKind::Colon) {
                        return Err(self.error(
                            "expected colon after dict key",
                            Some((tok.lineno, tok.colno)),
                        ));
                    }
                    let value = self.parse_expression()?;
                    pairs.push(Pair {
                        span: key.span(),
                        key,
                        value,
                    });
                }
                Agg::Group(children) | Agg::Array(children) => {
                    children.push(self.parse_expression()?);
                }
            }
        }

        Ok(Some(match agg {
            Agg::Group(children) => Expr::Group(Group { span, children }),
            Agg::Array(children) => Expr::Array(Array { span, children }),
            Agg::Dict(items) => Expr::Dict(Dict { span, items }),
        }))
    }

    /// Parse a call signature `( expr [= expr], ... )`. Keyword arguments
    /// are collected into a trailing [`KeywordArgs`] child. With
    /// `no_parens`, a block end terminates the list and parens are not
    /// required.
    pub fn parse_signature(&mut self, no_parens: bool) -> Result<ArgList> {
        let Some(mut tok) = self.peek_token() else {
            return Err(self.error("unexpected end of file", None));
        };
        if !no_parens && tok.kind != TokenKind::LeftParen {
            return Err(TemplateError::at(
                "expected arguments",
                Some((tok.lineno, tok.colno)),
            ));
        }
        if tok.kind == TokenKind::LeftParen {
            if let Some(consumed) = self.next_token(false) {
                tok = consumed;
            }
        }
        let span = span_of(&tok);

        let mut children = Vec::new();
        let mut kwargs: Vec<Pair> = Vec::new();
        let mut check_comma = false;
        loop {
            let Some(peek) = self.peek_token() else {
                return Err(self.error("unexpected end of file", None));
            };
            if !no_parens && peek.kind == TokenKind::RightParen {
                self.next_token(false);
                break;
            }
            if no_parens && peek.kind == TokenKind::BlockEnd {
                break;
            }
            if check_comma && !self.skip(TokenKind::Comma) {
                return Err(self.error(
                    "expected comma after expression",
                    Some((peek.lineno, peek.colno)),
                ));
            }
            let arg = self.parse_expression()?;
            if self.skip_value(TokenKind::Operator, "=") {
                let value = self.parse_expression()?;
                kwargs.push(Pair {
                    span: arg.span(),
                    key: arg,
                    value,
                });
            } else {
                children.push(arg);
            }
            check_comma = true;
        }

        if !kwargs.is_empty() {
            children.push(Expr::KeywordArgs(KeywordArgs {
                span,
                items: kwargs,
            }));
        }
        Ok(ArgList { span, children })
    }

    /// Tolerant signature: returns nothing when no opening paren is
    /// present.
    pub fn try_parse_signature(&mut self) -> Result<Option<ArgList>> {
        match self.peek_token() {
            Some(t) if t.kind == TokenKind::LeftParen => self.parse_signature(false).map(Some),
            _ => Ok(None),
        }
    }

    /// Consume postfix operators: calls, subscripts, member lookups.
    pub fn parse_postfix(&mut self, mut node: Expr) -> Result<Expr> {
        while let Some(tok) = self.peek_token() {
            let span = span_of(&tok);
            match tok.kind {
                TokenKind::LeftParen => {
                    let args = self.parse_signature(false)?;
                    node = Expr::FunCall(Box::new(FunCall {
                        span,
                        fun: node,
                        args,
                    }));
                }
                TokenKind::LeftBracket => {
                    let mut children = match self.parse_aggregate()? {
                        Some(Expr::Array(arr)) => arr.children,
                        _ => Vec::new(),
                    };
                    if children.len() != 1 {
                        return Err(TemplateError::at(
                            "invalid index",
                            Some((tok.lineno, tok.colno)),
                        ));
                    }
                    let val = children.remove(0);
                    node = Expr::LookupVal(Box::new(LookupVal {
                        span,
                        target: node,
                        val,
                    }));
                }
                TokenKind::Operator if tok.text() == "." => {
                    self.next_token(false);
                    let val = match self.next_token(false) {
                        Some(t) if t.kind == TokenKind::Symbol => t,
                        Some(t) => {
                            return Err(TemplateError::at(
                                format!("expected name as lookup value, got {}", t.text()),
                                Some((t.lineno, t.colno)),
                            ));
                        }
                        None => {
                            return Err(
                                self.error("expected name as lookup value, got end of file", None)
                            );
                        }
                    };
                    // A literal string, not a variable reference.
                    let lit = Expr::Literal(Literal {
                        span: span_of(&val),
                        value: LiteralValue::Str(val.text().to_string()),
                    });
                    node = Expr::LookupVal(Box::new(LookupVal {
                        span,
                        target: node,
                        val: lit,
                    }));
                }
                _ => break,
            }
        }
        Ok(node)
    }
}
