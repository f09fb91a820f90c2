//! Canonical `KSIR1` textual encoding and its parser.
//!
//! The format is line-oriented: a `KSIR1` header line, named fields and
//! counted sections, an `end` marker. Quoted tokens are C-style escaped;
//! expressions are embedded as S-expressions. Serialization is
//! canonical: re-serializing a parsed document reproduces it byte for
//! byte, which the loader and every cache key relies on.

use std::fmt::Write as _;

use logos::Logos;

use crate::error::{IrError, Result};
use crate::expr::Expr;
use crate::spec::{
    Attr, Endian, EnumDef, EnumValue, Instance, InstanceBody, Param, PrimitiveType, Process,
    RepeatKind, Spec, SwitchCase, TypeDef, TypeRef, Validation,
};
use crate::validate::validate;

/// Serialize a spec into canonical `KSIR1` text.
pub fn serialize(spec: &Spec) -> String {
    let mut out = String::new();
    out.push_str("KSIR1\n");
    let _ = writeln!(out, "name {}", quote(&spec.name));
    let _ = writeln!(out, "default_endian {}", spec.default_endian.as_str());

    let _ = writeln!(out, "imports {}", spec.imports.len());
    for import in &spec.imports {
        let _ = writeln!(out, "import {}", quote(import));
    }

    let _ = writeln!(out, "params {}", spec.params.len());
    for param in &spec.params {
        let _ = writeln!(out, "param {} {}", quote(&param.id), type_ref_text(&param.ty));
    }

    let _ = writeln!(out, "types {}", spec.types.len());
    for t in &spec.types {
        let _ = writeln!(out, "type {} {}", quote(&t.name), type_ref_text(&t.ty));
    }

    let _ = writeln!(out, "attrs {}", spec.attrs.len());
    for attr in &spec.attrs {
        out.push_str(&attr_line(attr));
        out.push('\n');
    }

    let _ = writeln!(out, "enums {}", spec.enums.len());
    for e in &spec.enums {
        let _ = writeln!(out, "enum {} {}", quote(&e.name), e.values.len());
        for v in &e.values {
            let _ = writeln!(out, "enum_value {} {}", v.value, quote(&v.name));
        }
    }

    let _ = writeln!(out, "instances {}", spec.instances.len());
    for inst in &spec.instances {
        out.push_str(&instance_line(inst));
        out.push('\n');
    }

    let _ = writeln!(out, "validations {}", spec.validations.len());
    for v in &spec.validations {
        let _ = writeln!(
            out,
            "validation {} {} {}",
            quote(&v.target),
            quote(&serialize_expr(&v.condition_expr)),
            quote(&v.message)
        );
    }
    out.push_str("end\n");
    out
}

/// Parse `KSIR1` text and validate the result.
pub fn deserialize(encoded: &str) -> Result<Spec> {
    let spec = parse_unvalidated(encoded)?;
    validate(&spec)?;
    Ok(spec)
}

/// Serialize an expression as an S-expression.
pub fn serialize_expr(expr: &Expr) -> String {
    match expr {
        Expr::Int(value) => format!("(int {value})"),
        Expr::Bool(value) => format!("(bool {})", if *value { "true" } else { "false" }),
        Expr::Name(name) => format!("(name {})", quote(name)),
        Expr::Unary { op, operand } => {
            format!("(un {} {})", quote(op), serialize_expr(operand))
        }
        Expr::Binary { op, lhs, rhs } => format!(
            "(bin {} {} {})",
            quote(op),
            serialize_expr(lhs),
            serialize_expr(rhs)
        ),
    }
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn type_ref_text(ty: &TypeRef) -> String {
    match ty {
        TypeRef::Primitive(p) => format!("primitive {}", quote(p.as_str())),
        TypeRef::User(name) => format!("user {}", quote(name)),
    }
}

fn quoted_opt_expr(expr: &Option<Expr>) -> String {
    match expr {
        Some(expr) => quote(&serialize_expr(expr)),
        None => quote("none"),
    }
}

fn attr_line(attr: &Attr) -> String {
    let mut line = format!(
        "attr {} {} {} {} {} {}",
        quote(&attr.id),
        type_ref_text(&attr.ty),
        attr.endian_override.map_or("none", Endian::as_str),
        quoted_opt_expr(&attr.size_expr),
        quote(attr.enum_name.as_deref().unwrap_or("none")),
        quote(attr.encoding.as_deref().unwrap_or("none")),
    );
    let _ = write!(
        line,
        " {} {} {} {} {}",
        quoted_opt_expr(&attr.if_expr),
        attr.repeat.as_str(),
        quoted_opt_expr(&attr.repeat_expr),
        quoted_opt_expr(&attr.switch_on),
        attr.switch_cases.len(),
    );
    for case in &attr.switch_cases {
        let match_text = match &case.match_expr {
            Some(expr) => quote(&serialize_expr(expr)),
            None => quote("else"),
        };
        let _ = write!(line, " {} {}", match_text, type_ref_text(&case.ty));
    }
    if let Some(Process::XorConst(key)) = attr.process {
        let _ = write!(line, " process_xor {key}");
    }
    if !attr.user_type_args.is_empty() {
        let _ = write!(line, " user_type_args {}", attr.user_type_args.len());
        for arg in &attr.user_type_args {
            let _ = write!(line, " {}", quote(&serialize_expr(arg)));
        }
    }
    line
}

fn instance_line(inst: &Instance) -> String {
    match &inst.body {
        InstanceBody::Value {
            expr,
            explicit_type,
        } => {
            let mut line = format!(
                "instance {} value {}",
                quote(&inst.id),
                quote(&serialize_expr(expr))
            );
            if let Some(ty) = explicit_type {
                let _ = write!(line, " {}", type_ref_text(ty));
            }
            line
        }
        InstanceBody::Parse {
            ty,
            pos_expr,
            size_expr,
            endian_override,
            encoding,
        } => format!(
            "instance {} parse pos {} size {} endian {} enc {} {}",
            quote(&inst.id),
            quoted_opt_expr(pos_expr),
            quoted_opt_expr(size_expr),
            endian_override.map_or("none", Endian::as_str),
            quote(encoding.as_deref().unwrap_or("none")),
            type_ref_text(ty),
        ),
    }
}

// ---------------------------------------------------------------------------
// Parsing

/// Token stream for embedded S-expressions.
#[derive(Logos, Debug, Clone, Copy, PartialEq)]
enum SexprToken {
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[regex(r"-?[0-9]+")]
    Int,
    #[regex(r#""([^"\\]|\\.)*""#)]
    Quoted,
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Word,
    #[regex(r"[ \t\r\n]+", logos::skip)]
    Error,
}

struct SexprParser<'a> {
    tokens: Vec<(SexprToken, &'a str)>,
    pos: usize,
}

impl<'a> SexprParser<'a> {
    fn bump(&mut self) -> Option<(SexprToken, &'a str)> {
        let token = self.tokens.get(self.pos).copied();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse(&mut self) -> Result<Expr> {
        match self.bump() {
            Some((SexprToken::LParen, _)) => {}
            _ => return Err(parse_err("expression must start with '('")),
        }
        let tag = match self.bump() {
            Some((SexprToken::Word, slice)) => slice,
            _ => return Err(parse_err("missing expression tag")),
        };
        let expr = match tag {
            "int" => {
                let literal = match self.bump() {
                    Some((SexprToken::Int, slice)) => slice,
                    _ => return Err(parse_err("missing int literal")),
                };
                let value: i64 = literal
                    .parse()
                    .map_err(|_| parse_err(&format!("invalid int literal: {literal}")))?;
                Expr::Int(value)
            }
            "bool" => match self.bump() {
                Some((SexprToken::Word, "true")) => Expr::Bool(true),
                Some((SexprToken::Word, "false")) => Expr::Bool(false),
                Some((_, slice)) => {
                    return Err(parse_err(&format!("invalid bool literal: {slice}")))
                }
                None => return Err(parse_err("missing bool literal")),
            },
            "name" => match self.bump() {
                Some((SexprToken::Quoted, slice)) => Expr::Name(unescape(slice)),
                _ => return Err(parse_err("invalid name literal")),
            },
            "un" => {
                let op = match self.bump() {
                    Some((SexprToken::Quoted, slice)) => unescape(slice),
                    _ => return Err(parse_err("invalid unary operator")),
                };
                let operand = self.parse()?;
                Expr::unary(op, operand)
            }
            "bin" => {
                let op = match self.bump() {
                    Some((SexprToken::Quoted, slice)) => unescape(slice),
                    _ => return Err(parse_err("invalid binary operator")),
                };
                let lhs = self.parse()?;
                let rhs = self.parse()?;
                Expr::binary(op, lhs, rhs)
            }
            other => return Err(parse_err(&format!("unknown expression tag: {other}"))),
        };
        match self.bump() {
            Some((SexprToken::RParen, _)) => Ok(expr),
            _ => Err(parse_err("expression missing closing ')'")),
        }
    }
}

/// Parse one serialized S-expression.
pub fn parse_expr_text(text: &str) -> Result<Expr> {
    let mut lexer = SexprToken::lexer(text);
    let mut tokens = Vec::new();
    while let Some(token) = lexer.next() {
        tokens.push((token.unwrap_or(SexprToken::Error), lexer.slice()));
    }
    SexprParser { tokens, pos: 0 }.parse()
}

/// Strip the surrounding quotes from a lexed string token and undo
/// backslash escapes.
fn unescape(slice: &str) -> String {
    let inner = &slice[1..slice.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for c in inner.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    out
}

fn parse_err(message: &str) -> IrError {
    IrError::Parse(message.to_string())
}

/// Field cursor over one line: whitespace-separated words and quoted
/// tokens.
struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(line: &'a str) -> Cursor<'a> {
        Cursor { rest: line }
    }

    fn skip_ws(&mut self) {
        self.rest = self.rest.trim_start_matches([' ', '\t']);
    }

    fn at_end(&mut self) -> bool {
        self.skip_ws();
        self.rest.is_empty()
    }

    fn word(&mut self) -> Option<&'a str> {
        self.skip_ws();
        if self.rest.is_empty() {
            return None;
        }
        let end = self.rest.find([' ', '\t']).unwrap_or(self.rest.len());
        let (word, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(word)
    }

    fn quoted(&mut self) -> Option<String> {
        self.skip_ws();
        let mut indices = self.rest.char_indices();
        match indices.next() {
            Some((_, '"')) => {}
            _ => return None,
        }
        let mut out = String::new();
        let mut escaped = false;
        for (i, c) in indices {
            if escaped {
                out.push(c);
                escaped = false;
                continue;
            }
            match c {
                '\\' => escaped = true,
                '"' => {
                    self.rest = &self.rest[i + 1..];
                    return Some(out);
                }
                _ => out.push(c),
            }
        }
        None
    }

    fn number<T: std::str::FromStr>(&mut self) -> Option<T> {
        self.word()?.parse().ok()
    }
}

fn parse_type_ref(cursor: &mut Cursor<'_>) -> Result<TypeRef> {
    let kind = cursor
        .word()
        .ok_or_else(|| parse_err("invalid type reference"))?;
    let payload = cursor
        .quoted()
        .ok_or_else(|| parse_err("invalid type reference"))?;
    match kind {
        "primitive" => PrimitiveType::parse(&payload)
            .map(TypeRef::Primitive)
            .ok_or_else(|| parse_err(&format!("invalid primitive type: {payload}"))),
        "user" => Ok(TypeRef::User(payload)),
        other => Err(parse_err(&format!("unknown type reference kind: {other}"))),
    }
}

fn opt_expr(text: &str) -> Result<Option<Expr>> {
    if text == "none" {
        return Ok(None);
    }
    parse_expr_text(text).map(Some)
}

fn opt_endian(text: &str) -> Result<Option<Endian>> {
    if text == "none" {
        return Ok(None);
    }
    Endian::parse(text)
        .map(Some)
        .ok_or_else(|| parse_err(&format!("invalid endian: {text}")))
}

fn opt_string(text: String) -> Option<String> {
    (text != "none").then_some(text)
}

type DocLines<'a> = std::str::Lines<'a>;

/// Section header: `<key> <count>`.
fn section_header<'a>(lines: &mut DocLines<'a>, context: &str) -> Result<(&'a str, usize)> {
    let line = lines
        .next()
        .ok_or_else(|| parse_err(&format!("missing section header: {context}")))?;
    let mut cursor = Cursor::new(line);
    let key = cursor.word();
    let count = cursor.number::<usize>();
    match (key, count) {
        (Some(key), Some(count)) => Ok((key, count)),
        _ => Err(parse_err(&format!("invalid section header: {context}"))),
    }
}

fn expect_section(lines: &mut DocLines<'_>, expected: &str) -> Result<usize> {
    let (key, count) = section_header(lines, expected)?;
    if key != expected {
        return Err(parse_err(&format!("invalid section header: {expected}")));
    }
    Ok(count)
}

/// Parse `KSIR1` text without running the validator. The loader uses
/// this to defer validation until imports are merged.
pub fn parse_unvalidated(encoded: &str) -> Result<Spec> {
    let mut lines: DocLines<'_> = encoded.lines();

    match lines.next() {
        Some("KSIR1") => {}
        _ => return Err(parse_err("missing KSIR1 header")),
    }

    let mut spec = Spec::default();

    {
        let line = lines
            .next()
            .ok_or_else(|| parse_err("missing spec name line"))?;
        let mut cursor = Cursor::new(line);
        if cursor.word() != Some("name") {
            return Err(parse_err("invalid name line"));
        }
        spec.name = cursor
            .quoted()
            .ok_or_else(|| parse_err("invalid name line"))?;
    }

    {
        let line = lines
            .next()
            .ok_or_else(|| parse_err("missing default endian line"))?;
        let mut cursor = Cursor::new(line);
        let key = cursor.word();
        let value = cursor.word();
        match (key, value) {
            (Some("default_endian"), Some(value)) => {
                spec.default_endian = Endian::parse(value)
                    .ok_or_else(|| parse_err(&format!("invalid endian: {value}")))?;
            }
            _ => return Err(parse_err("invalid default_endian line")),
        }
    }

    // `imports` and `params` sections are optional: older writers
    // emitted neither.
    let (mut key, mut count) = section_header(&mut lines, "imports/types")?;
    if key == "imports" {
        for _ in 0..count {
            let line = lines
                .next()
                .ok_or_else(|| parse_err("truncated import section"))?;
            let mut cursor = Cursor::new(line);
            if cursor.word() != Some("import") {
                return Err(parse_err("invalid import row"));
            }
            let name = cursor
                .quoted()
                .ok_or_else(|| parse_err("invalid import row"))?;
            spec.imports.push(name);
        }
        (key, count) = section_header(&mut lines, "types")?;
    }
    if key == "params" {
        for _ in 0..count {
            let line = lines
                .next()
                .ok_or_else(|| parse_err("truncated param section"))?;
            let mut cursor = Cursor::new(line);
            if cursor.word() != Some("param") {
                return Err(parse_err("invalid param row"));
            }
            let id = cursor
                .quoted()
                .ok_or_else(|| parse_err("invalid param row"))?;
            let ty = parse_type_ref(&mut cursor)?;
            spec.params.push(Param { id, ty });
        }
        (key, count) = section_header(&mut lines, "types")?;
    }
    if key != "types" {
        return Err(parse_err("invalid section header: types"));
    }
    for _ in 0..count {
        let line = lines
            .next()
            .ok_or_else(|| parse_err("truncated type section"))?;
        let mut cursor = Cursor::new(line);
        if cursor.word() != Some("type") {
            return Err(parse_err("invalid type row"));
        }
        let name = cursor
            .quoted()
            .ok_or_else(|| parse_err("invalid type row"))?;
        let ty = parse_type_ref(&mut cursor)?;
        spec.types.push(TypeDef { name, ty });
    }

    let count = expect_section(&mut lines, "attrs")?;
    for _ in 0..count {
        let line = lines
            .next()
            .ok_or_else(|| parse_err("truncated attr section"))?;
        spec.attrs.push(parse_attr_row(line)?);
    }

    let count = expect_section(&mut lines, "enums")?;
    for _ in 0..count {
        let line = lines
            .next()
            .ok_or_else(|| parse_err("truncated enum section"))?;
        let mut cursor = Cursor::new(line);
        if cursor.word() != Some("enum") {
            return Err(parse_err("invalid enum row"));
        }
        let name = cursor
            .quoted()
            .ok_or_else(|| parse_err("invalid enum row"))?;
        let value_count: usize = cursor
            .number()
            .ok_or_else(|| parse_err("invalid enum row"))?;
        let mut values = Vec::with_capacity(value_count);
        for _ in 0..value_count {
            let line = lines
                .next()
                .ok_or_else(|| parse_err("truncated enum value section"))?;
            let mut cursor = Cursor::new(line);
            if cursor.word() != Some("enum_value") {
                return Err(parse_err("invalid enum value row"));
            }
            let value: i64 = cursor
                .number()
                .ok_or_else(|| parse_err("invalid enum value row"))?;
            let value_name = cursor
                .quoted()
                .ok_or_else(|| parse_err("invalid enum value row"))?;
            values.push(EnumValue {
                value,
                name: value_name,
            });
        }
        spec.enums.push(EnumDef { name, values });
    }

    let count = expect_section(&mut lines, "instances")?;
    for _ in 0..count {
        let line = lines
            .next()
            .ok_or_else(|| parse_err("truncated instance section"))?;
        spec.instances.push(parse_instance_row(line)?);
    }

    let count = expect_section(&mut lines, "validations")?;
    for _ in 0..count {
        let line = lines
            .next()
            .ok_or_else(|| parse_err("truncated validation section"))?;
        let mut cursor = Cursor::new(line);
        if cursor.word() != Some("validation") {
            return Err(parse_err("invalid validation row"));
        }
        let target = cursor
            .quoted()
            .ok_or_else(|| parse_err("invalid validation row"))?;
        let cond_text = cursor
            .quoted()
            .ok_or_else(|| parse_err("invalid validation row"))?;
        let message = cursor
            .quoted()
            .ok_or_else(|| parse_err("invalid validation row"))?;
        spec.validations.push(Validation {
            target,
            condition_expr: parse_expr_text(&cond_text)?,
            message,
        });
    }

    match lines.next() {
        Some("end") => {}
        _ => return Err(parse_err("missing end marker")),
    }

    Ok(spec)
}

fn parse_attr_row(line: &str) -> Result<Attr> {
    let mut cursor = Cursor::new(line);
    if cursor.word() != Some("attr") {
        return Err(parse_err("invalid attr row"));
    }
    let id = cursor
        .quoted()
        .ok_or_else(|| parse_err("invalid attr row"))?;
    let ty = parse_type_ref(&mut cursor)?;
    let endian_text = cursor
        .word()
        .ok_or_else(|| parse_err("invalid attr row suffix"))?
        .to_string();
    let size_text = cursor
        .quoted()
        .ok_or_else(|| parse_err("invalid attr row suffix"))?;

    let (enum_text, enc_text) = if cursor.at_end() {
        ("none".to_string(), "none".to_string())
    } else {
        let e = cursor
            .quoted()
            .ok_or_else(|| parse_err("invalid attr row suffix"))?;
        let c = cursor
            .quoted()
            .ok_or_else(|| parse_err("invalid attr row suffix"))?;
        (e, c)
    };

    let mut attr = Attr::new(id, ty);
    attr.endian_override = opt_endian(&endian_text)?;
    attr.size_expr = opt_expr(&size_text)?;
    attr.enum_name = opt_string(enum_text);
    attr.encoding = opt_string(enc_text);

    if !cursor.at_end() {
        let if_text = cursor
            .quoted()
            .ok_or_else(|| parse_err("invalid attr row suffix"))?;
        let repeat_text = cursor
            .word()
            .ok_or_else(|| parse_err("invalid attr row suffix"))?
            .to_string();
        let repeat_expr_text = cursor
            .quoted()
            .ok_or_else(|| parse_err("invalid attr row suffix"))?;
        let switch_on_text = cursor
            .quoted()
            .ok_or_else(|| parse_err("invalid attr row suffix"))?;
        let case_count: usize = cursor
            .number()
            .ok_or_else(|| parse_err("invalid attr row suffix"))?;
        for _ in 0..case_count {
            let match_text = cursor
                .quoted()
                .ok_or_else(|| parse_err("invalid switch case row"))?;
            let case_ty = parse_type_ref(&mut cursor)?;
            let match_expr = if match_text == "else" {
                None
            } else {
                Some(parse_expr_text(&match_text)?)
            };
            attr.switch_cases.push(SwitchCase {
                match_expr,
                ty: case_ty,
            });
        }
        attr.if_expr = opt_expr(&if_text)?;
        attr.repeat = RepeatKind::parse(&repeat_text)
            .ok_or_else(|| parse_err(&format!("invalid repeat kind: {repeat_text}")))?;
        attr.repeat_expr = opt_expr(&repeat_expr_text)?;
        attr.switch_on = opt_expr(&switch_on_text)?;
    }

    while let Some(word) = cursor.word() {
        match word {
            "process_xor" => {
                let key: u8 = cursor
                    .number()
                    .ok_or_else(|| parse_err("invalid process_xor value"))?;
                attr.process = Some(Process::XorConst(key));
            }
            "user_type_args" => {
                let arg_count: usize = cursor
                    .number()
                    .ok_or_else(|| parse_err("invalid user_type_args count"))?;
                for _ in 0..arg_count {
                    let text = cursor
                        .quoted()
                        .ok_or_else(|| parse_err("invalid user_type_args row"))?;
                    attr.user_type_args.push(parse_expr_text(&text)?);
                }
            }
            _ => return Err(parse_err("invalid attr row suffix")),
        }
    }
    Ok(attr)
}

fn parse_instance_row(line: &str) -> Result<Instance> {
    let mut cursor = Cursor::new(line);
    if cursor.word() != Some("instance") {
        return Err(parse_err("invalid instance row"));
    }
    let id = cursor
        .quoted()
        .ok_or_else(|| parse_err("invalid instance row"))?;
    let body = match cursor.word() {
        Some("value") => {
            let expr_text = cursor
                .quoted()
                .ok_or_else(|| parse_err("invalid instance row"))?;
            let explicit_type = if cursor.at_end() {
                None
            } else {
                Some(parse_type_ref(&mut cursor)?)
            };
            InstanceBody::Value {
                expr: parse_expr_text(&expr_text)?,
                explicit_type,
            }
        }
        Some("parse") => {
            let mut field = |label: &str| -> Result<String> {
                if cursor.word() != Some(label) {
                    return Err(parse_err("invalid instance row"));
                }
                cursor
                    .quoted()
                    .ok_or_else(|| parse_err("invalid instance row"))
            };
            let pos_text = field("pos")?;
            let size_text = field("size")?;
            if cursor.word() != Some("endian") {
                return Err(parse_err("invalid instance row"));
            }
            let endian_text = cursor
                .word()
                .ok_or_else(|| parse_err("invalid instance row"))?
                .to_string();
            if cursor.word() != Some("enc") {
                return Err(parse_err("invalid instance row"));
            }
            let enc_text = cursor
                .quoted()
                .ok_or_else(|| parse_err("invalid instance row"))?;
            let ty = parse_type_ref(&mut cursor)?;
            InstanceBody::Parse {
                ty,
                pos_expr: opt_expr(&pos_text)?,
                size_expr: opt_expr(&size_text)?,
                endian_override: opt_endian(&endian_text)?,
                encoding: opt_string(enc_text),
            }
        }
        _ => return Err(parse_err("invalid instance row")),
    };
    Ok(Instance { id, body })
}
