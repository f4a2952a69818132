//! Plug-in tag protocol.
//!
//! Third-party extensions can claim additional block tag names. When the
//! statement parser sees a block whose first symbol is not a built-in
//! tag, it walks the registered extensions in order and hands control to
//! the first one whose [`Extension::tags`] contain the symbol.

use crate::ast::Node;
use crate::error::Result;
use crate::parser::Parser;

/// A parser extension claiming one or more block tag names.
///
/// The parse hook runs synchronously inside the parser's call stack and
/// may invoke any public parser operation (`peek_token`, `next_token`,
/// `parse_expression`, `parse_until_blocks`, `advance_after_block_end`,
/// ...). When the hook is entered, the claimed tag symbol is the next
/// peekable token; the hook is responsible for consuming it and the
/// surrounding block markers, and must produce an AST node.
pub trait Extension {
    /// The block tag names this extension claims.
    fn tags(&self) -> &[&str];

    /// Parse the claimed tag and everything it owns.
    fn parse(&self, parser: &mut Parser) -> Result<Node>;
}
