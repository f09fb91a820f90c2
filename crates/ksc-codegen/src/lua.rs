//! Lua emitter (plain and Wireshark flavors): `class.class(KaitaiStruct)`
//! construction, parse instances as property getters, value instances as
//! methods. The Wireshark variant appends a dissector stub bound to a
//! placeholder protocol and port.

use std::collections::HashSet;
use std::fmt::Write as _;

use ksc_ir::{
    normalize_op, special_unary_payload, Attr, Endian, Expr, Instance, InstanceBody,
    PrimitiveType, Process, RepeatKind, Spec, ATTR_PREFIX, CAST_PREFIX,
};

use crate::resolve::{build_user_types, read_method, resolve_primitive, to_upper_camel, UserTypes};

const GENERATED_BANNER: &str =
    "-- This is a generated file! Please edit source .ksy file and use kaitai-struct-compiler to rebuild\n";

struct LuaContext<'a> {
    spec: &'a Spec,
    user_types: UserTypes,
    attrs: HashSet<String>,
    /// Parse instances read as `self.<id>` (property getters).
    property_instances: HashSet<String>,
    /// Value instances read as `self:<id>()` (methods).
    known_instances: HashSet<String>,
}

impl LuaContext<'_> {
    fn expr(&self, e: &Expr, parent_prec: i32, repeat_item: Option<&str>) -> String {
        match e {
            Expr::Int(value) => value.to_string(),
            Expr::Bool(value) => if *value { "true" } else { "false" }.to_string(),
            Expr::Name(text) => {
                if let Some(item) = repeat_item {
                    if text == "_" {
                        return item.to_string();
                    }
                }
                if self.attrs.contains(text) || self.property_instances.contains(text) {
                    return format!("self.{text}");
                }
                if self.known_instances.contains(text) {
                    return format!("self:{text}()");
                }
                text.clone()
            }
            Expr::Unary { op, operand } => {
                if special_unary_payload(op, CAST_PREFIX).is_some() {
                    return self.expr(operand, 90, repeat_item);
                }
                if let Some(payload) = special_unary_payload(op, ATTR_PREFIX) {
                    return format!("{}.{payload}", self.expr(operand, 90, repeat_item));
                }
                let op = normalize_op(op);
                if op == "!" {
                    return format!("(not {})", self.expr(operand, 90, repeat_item));
                }
                format!("({op}{})", self.expr(operand, 90, repeat_item))
            }
            Expr::Binary { op, lhs, rhs } => {
                let mut op = normalize_op(op);
                if op == "&&" {
                    op = "and";
                }
                if op == "||" {
                    op = "or";
                }
                if op == "!=" {
                    op = "~=";
                }
                let prec = e.precedence();
                let rendered = format!(
                    "{} {op} {}",
                    self.expr(lhs, prec, repeat_item),
                    self.expr(rhs, prec + 1, repeat_item)
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
            PrimitiveType::Bytes => "self._io:read_bytes_full()".to_string(),
            PrimitiveType::Str => "''".to_string(),
            _ => format!(
                "self._io:{}()",
                read_method(primitive, override_endian.unwrap_or(self.spec.default_endian))
            ),
        }
    }

    fn render_read(&self, attr: &Attr) -> String {
        let primitive = resolve_primitive(&attr.ty, &self.user_types).unwrap_or(PrimitiveType::U1);
        if primitive == PrimitiveType::Bytes {
            let mut read = match &attr.size_expr {
                Some(size) => format!("self._io:read_bytes({})", self.expr(size, -1, None)),
                None => "self._io:read_bytes_full()".to_string(),
            };
            if let Some(Process::XorConst(key)) = attr.process {
                read = format!("KaitaiStream.process_xor_one({read}, {key})");
            }
            return read;
        }
        self.read_primitive(primitive, attr.endian_override)
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
            return "nil".to_string();
        };
        let primitive = resolve_primitive(ty, &self.user_types).unwrap_or(PrimitiveType::U1);
        if primitive == PrimitiveType::Bytes {
            return match size_expr {
                Some(size) => format!("self._io:read_bytes({})", self.expr(size, -1, None)),
                None => "self._io:read_bytes_full()".to_string(),
            };
        }
        if primitive == PrimitiveType::Str {
            return match size_expr {
                Some(size) => format!(
                    "str_decode.decode(self._io:read_bytes({}), \"{}\")",
                    self.expr(size, -1, None),
                    encoding.as_deref().unwrap_or("UTF-8")
                ),
                None => "\"\"".to_string(),
            };
        }
        format!(
            "self._io:{}()",
            read_method(primitive, endian_override.unwrap_or(self.spec.default_endian))
        )
    }
}

/// Render the Lua module for a spec; `wireshark_mode` appends the
/// dissector stub.
pub fn render_module(spec: &Spec, wireshark_mode: bool) -> String {
    let class_name = to_upper_camel(&spec.name);
    let user_types = build_user_types(spec);
    let mut property_instances = HashSet::new();
    let mut needs_str_decode = false;
    for inst in &spec.instances {
        let InstanceBody::Parse { ty, .. } = &inst.body else {
            continue;
        };
        property_instances.insert(inst.id.clone());
        let primitive = resolve_primitive(ty, &user_types).unwrap_or(PrimitiveType::U1);
        if primitive == PrimitiveType::Str {
            needs_str_decode = true;
        }
    }

    let mut ctx = LuaContext {
        spec,
        user_types,
        attrs: spec.attrs.iter().map(|a| a.id.clone()).collect(),
        property_instances,
        known_instances: HashSet::new(),
    };

    let mut out = String::new();
    out.push_str(GENERATED_BANNER);
    out.push_str("--\n");
    out.push_str("-- This file is compatible with Lua 5.3\n");
    out.push('\n');
    let _ = writeln!(out, "{class_name} = {class_name} or {{}}");
    out.push_str("local class = require(\"class\")\n");
    out.push_str("if _G[\"KaitaiStruct\"] == nil then require(\"kaitaistruct\") end\n");
    if needs_str_decode {
        out.push_str("local str_decode = require(\"string_decode\")\n");
    }
    out.push('\n');
    let _ = writeln!(out, "{class_name} = class.class(KaitaiStruct)\n");
    let _ = writeln!(out, "function {class_name}:_init(io, _parent, _root)");
    out.push_str("  KaitaiStruct._init(self, io)\n");
    out.push_str("  self._parent = _parent\n");
    out.push_str("  self._root = _root or self\n");
    out.push_str("  self:_read()\n");
    out.push_str("end\n\n");
    let _ = writeln!(out, "function {class_name}:_read()");

    for attr in &spec.attrs {
        match attr.repeat {
            RepeatKind::Expr => {
                let _ = writeln!(out, "  self.{} = {{}}", attr.id);
                let _ = writeln!(
                    out,
                    "  for i = 1, {} do",
                    ctx.expr(attr.repeat_expr.as_ref().expect("repeat expr"), -1, None)
                );
                let _ = writeln!(out, "    self.{}[i] = {}", attr.id, ctx.render_read(attr));
                out.push_str("  end\n");
            }
            RepeatKind::Eos => {
                let _ = writeln!(out, "  self.{} = {{}}", attr.id);
                out.push_str("  while not self._io:is_eof() do\n");
                let _ = writeln!(
                    out,
                    "    self.{}[#self.{} + 1] = {}",
                    attr.id,
                    attr.id,
                    ctx.render_read(attr)
                );
                out.push_str("  end\n");
            }
            RepeatKind::Until => {
                let _ = writeln!(out, "  self.{} = {{}}", attr.id);
                out.push_str("  while true do\n");
                let _ = writeln!(out, "    local repeat_item = {}", ctx.render_read(attr));
                let _ = writeln!(
                    out,
                    "    self.{}[#self.{} + 1] = repeat_item",
                    attr.id, attr.id
                );
                let _ = writeln!(
                    out,
                    "    if {} then break end",
                    ctx.expr(
                        attr.repeat_expr.as_ref().expect("repeat expr"),
                        -1,
                        Some("repeat_item")
                    )
                );
                out.push_str("  end\n");
            }
            RepeatKind::None => {
                let primitive =
                    resolve_primitive(&attr.ty, &ctx.user_types).unwrap_or(PrimitiveType::U1);
                if primitive == PrimitiveType::Bytes {
                    if let Some(Process::XorConst(key)) = attr.process {
                        let raw_read = match &attr.size_expr {
                            Some(size) => {
                                format!("self._io:read_bytes({})", ctx.expr(size, -1, None))
                            }
                            None => "self._io:read_bytes_full()".to_string(),
                        };
                        let _ = writeln!(out, "  self._raw_{} = {raw_read}", attr.id);
                        let _ = writeln!(
                            out,
                            "  self.{} = KaitaiStream.process_xor_one(self._raw_{}, {key})",
                            attr.id, attr.id
                        );
                        continue;
                    }
                }
                let _ = writeln!(out, "  self.{} = {}", attr.id, ctx.render_read(attr));
            }
        }
    }

    for v in &spec.validations {
        let specialized = match &v.condition_expr {
            Expr::Binary { op, lhs, rhs } if op == "==" => {
                let is_target = |e: &Expr| matches!(e, Expr::Name(name) if name == &v.target);
                match (&**lhs, &**rhs) {
                    (lhs_e, Expr::Int(value)) if is_target(lhs_e) => Some(*value),
                    (Expr::Int(value), rhs_e) if is_target(rhs_e) => Some(*value),
                    _ => None,
                }
            }
            _ => None,
        };
        if let Some(expected) = specialized {
            let _ = writeln!(out, "  if not(self.{} == {expected}) then", v.target);
            let _ = writeln!(
                out,
                "    error(\"not equal, expected \" .. {expected} .. \", but got \" .. self.{})",
                v.target
            );
            out.push_str("  end\n");
        } else {
            let _ = writeln!(
                out,
                "  if not ({}) then error('validation failed: /valid/{}') end",
                ctx.expr(&v.condition_expr, -1, None),
                v.target
            );
        }
    }
    out.push_str("end\n");

    for inst in &spec.instances {
        match &inst.body {
            InstanceBody::Parse { pos_expr, .. } => {
                let _ = writeln!(out, "\n{class_name}.property.{} = {{}}", inst.id);
                let _ = writeln!(out, "function {class_name}.property.{}:get()", inst.id);
                let _ = writeln!(out, "  if self._m_{} ~= nil then", inst.id);
                let _ = writeln!(out, "    return self._m_{}", inst.id);
                out.push_str("  end\n\n");
                out.push_str("  local _pos = self._io:pos()\n");
                if let Some(pos) = pos_expr {
                    let _ = writeln!(out, "  self._io:seek({})", ctx.expr(pos, -1, None));
                }
                let _ = writeln!(
                    out,
                    "  self._m_{} = {}",
                    inst.id,
                    ctx.read_parse_instance(inst)
                );
                out.push_str("  self._io:seek(_pos)\n");
                let _ = writeln!(out, "  return self._m_{}", inst.id);
                out.push_str("end\n");
            }
            InstanceBody::Value { expr, .. } => {
                let _ = writeln!(out, "\nfunction {class_name}:{}()", inst.id);
                let _ = writeln!(
                    out,
                    "  if self._m_{} ~= nil then return self._m_{} end",
                    inst.id, inst.id
                );
                let _ = writeln!(out, "  self._m_{} = {}", inst.id, ctx.expr(expr, -1, None));
                let _ = writeln!(out, "  return self._m_{}", inst.id);
                out.push_str("end\n");
            }
        }
        ctx.known_instances.insert(inst.id.clone());
    }

    if wireshark_mode {
        out.push('\n');
        out.push_str("-- Wireshark Lua dissector\n");
        let _ = writeln!(
            out,
            "local {}_proto = Proto(\"{}\", \"{class_name}\")\n",
            spec.name, spec.name
        );
        let _ = writeln!(out, "function {}_proto.dissector(tvb, pinfo, tree)", spec.name);
        let _ = writeln!(out, "  pinfo.cols.protocol = \"{class_name}\"");
        let _ = writeln!(out, "  local subtree = tree:add({}_proto, tvb())", spec.name);
        out.push_str("  local status, parsed = pcall(function()\n");
        let _ = writeln!(out, "    return {class_name}:from_string(tvb:range():string())");
        out.push_str("  end)\n");
        out.push_str("  if not status then\n");
        out.push_str(
            "    subtree:add_expert_info(PI_MALFORMED, PI_ERROR, \"Kaitai Struct parse error: \" .. parsed)\n",
        );
        out.push_str("  end\n");
        out.push_str("end\n\n");
        out.push_str("-- Register the dissector on the desired port by setting this.\n");
        let _ = writeln!(out, "local {}_proto_default_port = 0", spec.name);
        let _ = writeln!(out, "if {}_proto_default_port > 0 then", spec.name);
        let _ = writeln!(
            out,
            "  DissectorTable.get(\"tcp.port\"):add({}_proto_default_port, {}_proto)",
            spec.name, spec.name
        );
        out.push_str("end\n");
    }
    out
}
