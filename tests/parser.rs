//! End-to-end parser tests over the public API.

use muscade::ast::*;
use muscade::{parse, Parser, TokenKind, Tokenizer, TokenizerOptions};

fn data_of(node: &Node) -> &str {
    match node {
        Node::Output(o) => match &o.children[0] {
            Expr::TemplateData(d) => &d.data,
            other => panic!("expected template data, got {other:?}"),
        },
        other => panic!("expected output node, got {other:?}"),
    }
}

fn sym(e: &Expr) -> &str {
    match e {
        Expr::Symbol(s) => &s.name,
        other => panic!("expected symbol, got {other:?}"),
    }
}

fn int_lit(e: &Expr) -> i64 {
    match e {
        Expr::Literal(Literal {
            value: LiteralValue::Int(v),
            ..
        }) => *v,
        other => panic!("expected int literal, got {other:?}"),
    }
}

fn str_lit(e: &Expr) -> &str {
    match e {
        Expr::Literal(Literal {
            value: LiteralValue::Str(s),
            ..
        }) => s,
        other => panic!("expected string literal, got {other:?}"),
    }
}

#[test]
fn hello_interpolation() {
    // hello {{ name }} =>
    // Root[Output[TemplateData("hello ")], Output[Symbol("name")]]
    let root = parse("hello {{ name }}").unwrap();
    assert_eq!(root.children.len(), 2);
    assert_eq!(data_of(&root.children[0]), "hello ");
    let Node::Output(o) = &root.children[1] else {
        panic!("expected output node");
    };
    assert_eq!(sym(&o.children[0]), "name");
}

#[test]
fn if_else_shape() {
    let root = parse("{% if x %}a{% else %}b{% endif %}").unwrap();
    assert_eq!(root.children.len(), 1);
    let Node::If(n) = &root.children[0] else {
        panic!("expected if node");
    };
    assert_eq!(sym(&n.cond), "x");
    assert_eq!(data_of(&n.body.children[0]), "a");
    let Some(ElseBranch::Body(else_body)) = &n.else_ else {
        panic!("expected else body");
    };
    assert_eq!(data_of(&else_body.children[0]), "b");
}

#[test]
fn for_unpacking_shape() {
    let root = parse("{% for k, v in d %}{{ k }}{% endfor %}").unwrap();
    let Node::For(n) = &root.children[0] else {
        panic!("expected for node");
    };
    let Expr::Array(targets) = &n.name else {
        panic!("expected array of targets");
    };
    assert_eq!(sym(&targets.children[0]), "k");
    assert_eq!(sym(&targets.children[1]), "v");
    assert_eq!(sym(&n.arr), "d");
    let Node::Output(o) = &n.body.children[0] else {
        panic!("expected output body");
    };
    assert_eq!(sym(&o.children[0]), "k");
    assert!(n.else_.is_none());
}

#[test]
fn filter_with_argument() {
    // {{ a | upper(2) }} =>
    // Output[Filter(name=upper, args=NodeList[Symbol(a), Literal(2)])]
    let root = parse("{{ a | upper(2) }}").unwrap();
    let Node::Output(o) = &root.children[0] else {
        panic!("expected output node");
    };
    let Expr::Filter(f) = &o.children[0] else {
        panic!("expected filter");
    };
    assert_eq!(f.name.name, "upper");
    assert_eq!(sym(&f.args.children[0]), "a");
    assert_eq!(int_lit(&f.args.children[1]), 2);
}

#[test]
fn arithmetic_precedence() {
    // {{ 1 + 2 * 3 ** 2 }} => Add(1, Mul(2, Pow(3, 2)))
    let root = parse("{{ 1 + 2 * 3 ** 2 }}").unwrap();
    let Node::Output(o) = &root.children[0] else {
        panic!("expected output node");
    };
    let Expr::Add(add) = &o.children[0] else {
        panic!("expected add");
    };
    assert_eq!(int_lit(&add.left), 1);
    let Expr::Mul(mul) = &add.right else {
        panic!("expected mul");
    };
    assert_eq!(int_lit(&mul.left), 2);
    let Expr::Pow(pow) = &mul.right else {
        panic!("expected pow");
    };
    assert_eq!(int_lit(&pow.left), 3);
    assert_eq!(int_lit(&pow.right), 2);
}

#[test]
fn raw_with_whitespace_control() {
    // {%- raw -%}{{ x }}{%- endraw -%} keeps the markers' content
    // verbatim and trims whitespace on its neighbors.
    let root = parse("a \t{%- raw -%}{{ x }}{%- endraw -%}\n b").unwrap();
    assert_eq!(root.children.len(), 3);
    assert_eq!(data_of(&root.children[0]), "a");
    assert_eq!(data_of(&root.children[1]), "{{ x }}");
    assert_eq!(data_of(&root.children[2]), "b");
}

#[test]
fn from_import_names() {
    // {% from "t" import a, b as c %} =>
    // FromImport(template=Literal("t"),
    //            names=[Symbol(a), Pair(Symbol(b), Symbol(c))])
    let root = parse(r#"{% from "t" import a, b as c %}"#).unwrap();
    let Node::FromImport(n) = &root.children[0] else {
        panic!("expected from-import node");
    };
    assert_eq!(str_lit(&n.template), "t");
    assert_eq!(n.names.children.len(), 2);
    assert_eq!(sym(&n.names.children[0]), "a");
    let Expr::Pair(pair) = &n.names.children[1] else {
        panic!("expected alias pair");
    };
    assert_eq!(sym(&pair.key), "b");
    assert_eq!(sym(&pair.value), "c");
    assert!(n.with_context.is_none());
}

#[test]
fn from_import_rejects_underscore_names() {
    let err = parse(r#"{% from "t" import _x %}"#).unwrap_err();
    assert_eq!(
        err.message(),
        "names starting with an underscore cannot be imported"
    );
}

#[test]
fn top_level_nodes_are_outputs_or_statements() {
    let root = parse(
        "text {{ v }} {% if a %}x{% endif %} {% for i in xs %}y{% endfor %} \
         {% block b %}z{% endblock %}",
    )
    .unwrap();
    assert!(!root.children.is_empty());
    for node in &root.children {
        assert!(matches!(
            node,
            Node::Output(_) | Node::If(_) | Node::For(_) | Node::Block(_)
        ));
    }
}

#[test]
fn cursor_never_yields_whitespace_by_default() {
    let mut p = Parser::new(Tokenizer::new(
        "{% if a %}{{ b | f(1, 2) }}{% endif %}",
        TokenizerOptions::default(),
    ));
    while let Some(tok) = p.next_token(false) {
        assert_ne!(tok.kind, TokenKind::Whitespace);
    }
}

#[test]
fn pushback_then_peek_and_next_return_the_token() {
    let mut p = Parser::new(Tokenizer::new("{{ a }}", TokenizerOptions::default()));
    let tok = p.next_token(false).unwrap();
    p.push_token(tok.clone());
    assert_eq!(p.peek_token().as_ref(), Some(&tok));
    assert_eq!(p.next_token(false), Some(tok));
}

#[test]
fn adjacent_markers_trim_surrounded_text() {
    // Text between -%} and {%- loses both leading and trailing
    // whitespace.
    let root = parse("{% if a -%}\n\t hello \t\n{%- endif %}").unwrap();
    let Node::If(n) = &root.children[0] else {
        panic!("expected if node");
    };
    assert_eq!(data_of(&n.body.children[0]), "hello");
}

#[test]
fn filter_binding_with_and_without_prefix_operators() {
    // a + b | upper => Add(a, Filter(upper, b))
    let root = parse("{{ a + b | upper }}").unwrap();
    let Node::Output(o) = &root.children[0] else {
        panic!("expected output node");
    };
    let Expr::Add(add) = &o.children[0] else {
        panic!("expected add");
    };
    assert!(matches!(&add.right, Expr::Filter(_)));

    // -x | upper => Filter(upper, Neg(x))
    let root = parse("{{ -x | upper }}").unwrap();
    let Node::Output(o) = &root.children[0] else {
        panic!("expected output node");
    };
    let Expr::Filter(f) = &o.children[0] else {
        panic!("expected filter");
    };
    assert!(matches!(&f.args.children[0], Expr::Neg(_)));
}

#[test]
fn pow_matches_the_left_associative_loop() {
    let root = parse("{{ 2 ** 3 ** 4 }}").unwrap();
    let Node::Output(o) = &root.children[0] else {
        panic!("expected output node");
    };
    let Expr::Pow(outer) = &o.children[0] else {
        panic!("expected pow");
    };
    let Expr::Pow(inner) = &outer.left else {
        panic!("expected left-nested pow");
    };
    assert_eq!(int_lit(&inner.left), 2);
    assert_eq!(int_lit(&inner.right), 3);
    assert_eq!(int_lit(&outer.right), 4);
}

#[test]
fn errors_carry_one_based_positions() {
    let err = parse("{{ name }\n{{ * }}").unwrap_err();
    assert!(err.lineno().is_some());
    assert!(err.colno().is_some());
    assert!(err.lineno().unwrap() >= 1);
    assert!(err.colno().unwrap() >= 1);
}

#[test]
fn realistic_page_parses() {
    let src = r#"{% extends "base.html" %}
{% import "forms.html" as forms with context %}
{% block content %}
  <h1>{{ page.title | title }}</h1>
  {% for post in posts %}
    {% if post.draft %}{% continue_marker %}{% endif %}
  {% else %}
    <p>No posts yet.</p>
  {% endfor %}
{% endblock content %}"#;
    // The unknown tag fails; everything before it parses.
    let err = parse(src).unwrap_err();
    assert_eq!(err.message(), "unknown block tag: continue_marker");

    let src = r#"{% extends "base.html" %}
{% block content -%}
  {% set items = [1, 2, 3] %}
  {% macro chip(label, kind="info") %}<span>{{ label }}</span>{% endmacro %}
  {% call(item) chip("x") %}{{ item * 2 }}{% endcall %}
  {{ items | join(", ") if items else "none" }}
{%- endblock %}"#;
    let root = parse(src).unwrap();
    assert_eq!(root.children.len(), 3);
}
