//! Python emitter: one module per spec, parser class derived from
//! `KaitaiStruct`, instances as cached properties.

use std::collections::HashSet;
use std::fmt::Write as _;

use ksc_ir::{
    normalize_op, special_unary_payload, Attr, Endian, Expr, Instance, InstanceBody,
    PrimitiveType, Process, RepeatKind, Spec, ATTR_PREFIX, CAST_PREFIX,
};

use crate::resolve::{build_user_types, read_method, resolve_primitive, to_upper_camel, UserTypes};

const GENERATED_BANNER: &str =
    "# This is a generated file! Please edit source .ksy file and use kaitai-struct-compiler to rebuild\n";

struct PyContext<'a> {
    spec: &'a Spec,
    user_types: UserTypes,
    attrs: HashSet<String>,
    known_instances: HashSet<String>,
}

impl PyContext<'_> {
    fn expr(&self, e: &Expr, parent_prec: i32) -> String {
        match e {
            Expr::Int(value) => value.to_string(),
            Expr::Bool(value) => if *value { "True" } else { "False" }.to_string(),
            Expr::Name(text) => {
                if self.attrs.contains(text) || self.known_instances.contains(text) {
                    format!("self.{text}")
                } else {
                    text.clone()
                }
            }
            Expr::Unary { op, operand } => {
                if special_unary_payload(op, CAST_PREFIX).is_some() {
                    return self.expr(operand, 90);
                }
                if let Some(payload) = special_unary_payload(op, ATTR_PREFIX) {
                    return format!("{}.{payload}", self.expr(operand, 90));
                }
                format!("({}{})", normalize_op(op), self.expr(operand, 90))
            }
            Expr::Binary { op, lhs, rhs } => {
                let op = normalize_op(op);
                let prec = e.precedence();
                let rendered = format!(
                    "{} {op} {}",
                    self.expr(lhs, prec),
                    self.expr(rhs, prec + 1)
                );
                if prec <= parent_prec {
                    format!("({rendered})")
                } else {
                    rendered
                }
            }
        }
    }

    fn read_primitive(&self, primitive: PrimitiveType, override_endian: Option<Endian>) -> String {
        match primitive {
            PrimitiveType::Bytes => "self._io.read_bytes_full()".to_string(),
            PrimitiveType::Str => "''".to_string(),
            _ => format!(
                "self._io.{}()",
                read_method(primitive, override_endian.unwrap_or(self.spec.default_endian))
            ),
        }
    }

    fn read_value(&self, attr: &Attr) -> String {
        let primitive = resolve_primitive(&attr.ty, &self.user_types).unwrap_or(PrimitiveType::U1);
        if primitive == PrimitiveType::Bytes {
            let mut read = match &attr.size_expr {
                Some(size) => format!("self._io.read_bytes({})", self.expr(size, -1)),
                None => "self._io.read_bytes_full()".to_string(),
            };
            if let Some(Process::XorConst(key)) = attr.process {
                read = format!("KaitaiStream.process_xor_one({read}, {key})");
            }
            return read;
        }
        if primitive == PrimitiveType::Str {
            return match &attr.size_expr {
                Some(size) => format!(
                    "KaitaiStream.bytes_to_str(self._io.read_bytes({}), '{}')",
                    self.expr(size, -1),
                    attr.encoding.as_deref().unwrap_or("UTF-8")
                ),
                None => "''".to_string(),
            };
        }
        self.read_primitive(primitive, attr.endian_override)
    }

    /// Multi-line body for a non-repeated attr; the caller indents.
    fn read_attr(&self, attr: &Attr) -> String {
        if let Some(switch_on) = &attr.switch_on {
            let primitive =
                resolve_primitive(&attr.ty, &self.user_types).unwrap_or(PrimitiveType::U1);
            let mut sw = format!("_on = {}\n", self.expr(switch_on, -1));
            let mut wrote_else = false;
            for (i, case) in attr.switch_cases.iter().enumerate() {
                match &case.match_expr {
                    None => {
                        sw.push_str("else:\n");
                        wrote_else = true;
                    }
                    Some(match_expr) => {
                        let keyword = if i == 0 { "if" } else { "elif" };
                        let _ = writeln!(sw, "{keyword} _on == {}:", self.expr(match_expr, -1));
                    }
                }
                let case_primitive =
                    resolve_primitive(&case.ty, &self.user_types).unwrap_or(primitive);
                let _ = writeln!(
                    sw,
                    "    self.{} = {}",
                    attr.id,
                    self.read_primitive(case_primitive, attr.endian_override)
                );
            }
            if !wrote_else {
                let _ = writeln!(
                    sw,
                    "else:\n    self.{} = {}",
                    attr.id,
                    self.read_primitive(primitive, attr.endian_override)
                );
            }
            return sw;
        }
        let primitive = resolve_primitive(&attr.ty, &self.user_types).unwrap_or(PrimitiveType::U1);
        if primitive == PrimitiveType::Bytes {
            if let Some(Process::XorConst(key)) = attr.process {
                let raw = match &attr.size_expr {
                    Some(size) => format!("self._io.read_bytes({})", self.expr(size, -1)),
                    None => "self._io.read_bytes_full()".to_string(),
                };
                let mut lines = format!("self._raw_{} = {raw}\n", attr.id);
                let _ = writeln!(
                    lines,
                    "self.{} = KaitaiStream.process_xor_one(self._raw_{}, {key})",
                    attr.id, attr.id
                );
                return lines;
            }
        }
        format!("self.{} = {}\n", attr.id, self.read_value(attr))
    }

    fn read_parse_instance(&self, inst: &Instance) -> String {
        let InstanceBody::Parse {
            ty,
            size_expr,
            endian_override,
            encoding,
            ..
        } = &inst.body
        else {
            return "None".to_string();
        };
        let primitive = resolve_primitive(ty, &self.user_types).unwrap_or(PrimitiveType::U1);
        if primitive == PrimitiveType::Bytes {
            return match size_expr {
                Some(size) => format!("self._io.read_bytes({})", self.expr(size, -1)),
                None => "self._io.read_bytes_full()".to_string(),
            };
        }
        if primitive == PrimitiveType::Str {
            return match size_expr {
                Some(size) => format!(
                    "(self._io.read_bytes({})).decode(u\"{}\")",
                    self.expr(size, -1),
                    encoding.as_deref().unwrap_or("UTF-8")
                ),
                None => "''".to_string(),
            };
        }
        format!(
            "self._io.{}()",
            read_method(primitive, endian_override.unwrap_or(self.spec.default_endian))
        )
    }
}

/// Render the Python module for a spec.
pub fn render_module(spec: &Spec) -> String {
    let class_name = to_upper_camel(&spec.name);
    let mut ctx = PyContext {
        spec,
        user_types: build_user_types(spec),
        attrs: spec.attrs.iter().map(|a| a.id.clone()).collect(),
        known_instances: HashSet::new(),
    };

    let mut out = String::new();
    out.push_str(GENERATED_BANNER);
    out.push_str("# type: ignore\n\n");
    out.push_str("import kaitaistruct\n");
    out.push_str("from kaitaistruct import KaitaiStruct, KaitaiStream, BytesIO");
    if !spec.validations.is_empty() {
        out.push_str(", ValidationExprError");
    }
    out.push_str("\n\n");
    out.push_str("if getattr(kaitaistruct, 'API_VERSION', (0, 9)) < (0, 11):\n");
    out.push_str("    raise Exception(\"Incompatible Kaitai Struct Python API: 0.11 or later is required, but you have %s\" % (kaitaistruct.__version__))\n\n");
    let _ = writeln!(out, "class {class_name}(KaitaiStruct):");
    out.push_str("    def __init__(self, _io, _parent=None, _root=None):\n");
    let _ = writeln!(out, "        super({class_name}, self).__init__(_io)");
    out.push_str("        self._parent = _parent\n");
    out.push_str("        self._root = _root or self\n");
    out.push_str("        self._read()\n\n");
    out.push_str("    def _read(self):\n");
    if spec.attrs.is_empty() && spec.validations.is_empty() {
        out.push_str("        pass\n");
    }
    for attr in &spec.attrs {
        match attr.repeat {
            RepeatKind::None => {
                for line in ctx.read_attr(attr).lines() {
                    if !line.is_empty() {
                        let _ = writeln!(out, "        {line}");
                    }
                }
            }
            RepeatKind::Eos => {
                let _ = writeln!(out, "        self.{} = []", attr.id);
                out.push_str("        while not self._io.is_eof():\n");
                let _ = writeln!(out, "            _ = {}", ctx.read_value(attr));
                let _ = writeln!(out, "            self.{}.append(_)", attr.id);
            }
            RepeatKind::Expr => {
                let _ = writeln!(out, "        self.{} = []", attr.id);
                let _ = writeln!(
                    out,
                    "        for i in range({}):",
                    ctx.expr(attr.repeat_expr.as_ref().expect("repeat expr"), -1)
                );
                let _ = writeln!(out, "            self.{}.append({})", attr.id, ctx.read_value(attr));
            }
            RepeatKind::Until => {
                // `_` in the termination expression is the Python loop
                // variable holding the last pushed item.
                let _ = writeln!(out, "        self.{} = []", attr.id);
                out.push_str("        while True:\n");
                let _ = writeln!(out, "            _ = {}", ctx.read_value(attr));
                let _ = writeln!(out, "            self.{}.append(_)", attr.id);
                let _ = writeln!(
                    out,
                    "            if {}:",
                    ctx.expr(attr.repeat_expr.as_ref().expect("repeat expr"), -1)
                );
                out.push_str("                break\n");
            }
        }
    }
    for v in &spec.validations {
        let _ = writeln!(out, "        if not ({}):", ctx.expr(&v.condition_expr, -1));
        let _ = writeln!(
            out,
            "            raise ValidationExprError(self.{}, self._io, '/valid/{}')",
            v.target, v.target
        );
    }

    out.push('\n');
    out.push_str("    def _fetch_instances(self):\n");
    out.push_str("        pass\n");
    for attr in &spec.attrs {
        if attr.repeat != RepeatKind::None {
            let _ = writeln!(out, "        for i in range(len(self.{})):", attr.id);
            out.push_str("            pass\n");
        }
    }
    for inst in &spec.instances {
        let _ = writeln!(out, "        _ = self.{}", inst.id);
        let _ = writeln!(out, "        if hasattr(self, '_m_{}'):", inst.id);
        out.push_str("            pass\n");
    }

    for inst in &spec.instances {
        out.push_str("\n    @property\n");
        let _ = writeln!(out, "    def {}(self):", inst.id);
        let _ = writeln!(out, "        if hasattr(self, '_m_{}'):", inst.id);
        let _ = writeln!(out, "            return self._m_{}", inst.id);
        match &inst.body {
            InstanceBody::Parse { pos_expr, .. } => {
                out.push('\n');
                out.push_str("        _pos = self._io.pos()\n");
                if let Some(pos) = pos_expr {
                    let _ = writeln!(out, "        self._io.seek({})", ctx.expr(pos, -1));
                }
                let _ = writeln!(
                    out,
                    "        self._m_{} = {}",
                    inst.id,
                    ctx.read_parse_instance(inst)
                );
                out.push_str("        self._io.seek(_pos)\n");
                let _ = writeln!(out, "        return getattr(self, '_m_{}', None)", inst.id);
            }
            InstanceBody::Value { expr, .. } => {
                let _ = writeln!(out, "        self._m_{} = {}", inst.id, ctx.expr(expr, -1));
                let _ = writeln!(out, "        return self._m_{}", inst.id);
            }
        }
        ctx.known_instances.insert(inst.id.clone());
    }
    out
}
