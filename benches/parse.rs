//! Benchmarks for the template parser
//!
//! Run with: cargo bench --bench parse
//!
//! Benchmarks cover:
//! - Lexing (tokenization)
//! - Parsing (AST generation)

use divan::{black_box, Bencher};
use muscade::{Parser, Tokenizer, TokenizerOptions};

fn main() {
    divan::main();
}

// ============================================================================
// Template generators
// ============================================================================

/// Simple template with just text
fn simple_text() -> &'static str {
    "Hello, World! This is a simple static text template."
}

/// Template with variable interpolation
fn with_variables() -> &'static str {
    r#"Hello, {{ name }}! Welcome to {{ site_name }}.
Your account was created on {{ created_date }}.
You have {{ message_count }} unread messages."#
}

/// Template with loops
fn with_loops() -> &'static str {
    r#"<ul>
{% for item in items %}
  <li>{{ item.name }}: {{ item.price }}</li>
{% endfor %}
</ul>"#
}

/// Template with conditionals
fn with_conditionals() -> &'static str {
    r#"{% if user.is_admin %}
  <div class="admin-panel">Admin Controls</div>
{% elif user.is_moderator %}
  <div class="mod-panel">Moderator Controls</div>
{% else %}
  <div class="user-panel">User Controls</div>
{% endif %}"#
}

/// Template with filters and operator-heavy expressions
fn with_expressions() -> &'static str {
    r#"{{ title | upper }} - {{ 1 + 2 * 3 ** 2 }}
{{ "draft" if page.draft else page.status | lower }}
{{ items | join(", ") ~ " (" ~ items | length ~ ")" }}"#
}

/// Complex realistic template (like a blog post layout)
fn complex_template() -> &'static str {
    r#"{% extends "base.html" %}
{% import "macros.html" as ui with context %}
{% block content -%}
  <article>
    <h1>{{ post.title | title }}</h1>
    {% if post.tags %}
      <ul class="tags">
      {% for tag in post.tags %}
        <li>{{ tag | lower }}</li>
      {% else %}
        <li>untagged</li>
      {% endfor %}
      </ul>
    {% endif %}
    {% set word_count = post.body | wordcount %}
    {% filter escape %}{{ post.body }}{% endfilter %}
    {% call(section) ui.panel("footer") %}
      {{ section }} - {{ word_count }} words
    {% endcall %}
  </article>
{%- endblock content %}"#
}

fn lex_all(source: &str) -> usize {
    Tokenizer::new(source, TokenizerOptions::default()).count()
}

fn parse_one(source: &str) -> usize {
    Parser::new(Tokenizer::new(source, TokenizerOptions::default()))
        .parse()
        .map(|root| root.children.len())
        .unwrap_or(0)
}

// ============================================================================
// Lexer benchmarks
// ============================================================================

#[divan::bench]
fn lex_simple(bencher: Bencher) {
    bencher.bench(|| lex_all(black_box(simple_text())));
}

#[divan::bench]
fn lex_with_variables(bencher: Bencher) {
    bencher.bench(|| lex_all(black_box(with_variables())));
}

#[divan::bench]
fn lex_with_loops(bencher: Bencher) {
    bencher.bench(|| lex_all(black_box(with_loops())));
}

#[divan::bench]
fn lex_complex(bencher: Bencher) {
    bencher.bench(|| lex_all(black_box(complex_template())));
}

// ============================================================================
// Parser benchmarks
// ============================================================================

#[divan::bench]
fn parse_simple(bencher: Bencher) {
    bencher.bench(|| parse_one(black_box(simple_text())));
}

#[divan::bench]
fn parse_with_variables(bencher: Bencher) {
    bencher.bench(|| parse_one(black_box(with_variables())));
}

#[divan::bench]
fn parse_with_loops(bencher: Bencher) {
    bencher.bench(|| parse_one(black_box(with_loops())));
}

#[divan::bench]
fn parse_with_conditionals(bencher: Bencher) {
    bencher.bench(|| parse_one(black_box(with_conditionals())));
}

#[divan::bench]
fn parse_with_expressions(bencher: Bencher) {
    bencher.bench(|| parse_one(black_box(with_expressions())));
}

#[divan::bench]
fn parse_complex(bencher: Bencher) {
    bencher.bench(|| parse_one(black_box(complex_template())));
}
