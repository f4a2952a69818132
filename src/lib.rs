//! muscade - parser for a Jinja-style template language
//!
//! A hand-written recursive-descent parser with single-token lookahead
//! that turns template source into an AST:
//!
//! ```text
//! {{ expr }}              - Expression interpolation
//! {% if cond %}...{% endif %}     - Conditionals
//! {% for item in items %}...{% endfor %}  - Loops
//! {{ value | filter(args) }}      - Filters
//! {% block name %}...{% endblock %} - Block definitions
//! {% macro name(args) %}...{% endmacro %} - Macro definitions
//! {% raw %}...{% endraw %}        - Verbatim sections
//! {%- ... -%}             - Whitespace control
//! ```
//!
//! Rendering, scoping and inheritance resolution are out of scope: the
//! crate stops at a position-annotated [`ast::Root`] tree. Errors are
//! [`TemplateError`]s with 1-based coordinates and plug into miette.
//! Unknown block tags can be claimed by [`Extension`]s, which reenter
//! the parser through its public operations.
//!
//! # Example
//!
//! ```
//! let root = muscade::parse("Hello, {{ name }}!")?;
//! assert_eq!(root.children.len(), 3);
//! # Ok::<(), muscade::TemplateError>(())
//! ```

pub mod ast;
mod error;
pub mod extension;
pub mod lexer;
pub mod parser;

pub use error::{Result, TemplateError};
pub use extension::Extension;
pub use lexer::{Tags, Token, TokenKind, TokenValue, Tokenizer, TokenizerOptions};
pub use parser::Parser;

use ast::Root;
use std::sync::Arc;

/// Parse a template source with default delimiters and no extensions.
pub fn parse(src: &str) -> Result<Root> {
    Parser::new(Tokenizer::new(src, TokenizerOptions::default())).parse()
}

/// Parse a template source with registered extensions and tokenizer
/// options.
pub fn parse_with(
    src: &str,
    extensions: Vec<Arc<dyn Extension>>,
    opts: TokenizerOptions,
) -> Result<Root> {
    Parser::with_extensions(Tokenizer::new(src, opts), extensions).parse()
}
