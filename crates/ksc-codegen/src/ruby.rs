//! Ruby emitter: one module per spec. Embedded scopes become nested
//! classes; attrs surface through `attr_reader`, so expression names
//! render bare and resolve through the reader methods.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use ksc_ir::{
    normalize_op, special_unary_payload, Attr, Endian, Expr, Instance, InstanceBody,
    PrimitiveType, Process, RepeatKind, Spec, TypeRef, ATTR_PREFIX, CAST_PREFIX,
};

use crate::resolve::{
    build_user_types, is_unresolved_user_type, read_method, resolve_primitive, to_upper_camel,
    UserTypes,
};
use crate::scope::{
    decode_embedded_scopes, direct_child_scopes, last_scope_segment, resolve_scope_ref,
    split_scope_path,
};

const GENERATED_BANNER: &str =
    "# This is a generated file! Please edit source .ksy file and use kaitai-struct-compiler to rebuild\n";

struct RubyContext {
    class_name: String,
    root_name: String,
    user_types: UserTypes,
    local_scopes: BTreeMap<String, Spec>,
}

fn ruby_indent(level: usize) -> String {
    "  ".repeat(level)
}

impl RubyContext {
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
                text.clone()
            }
            Expr::Unary { op, operand } => {
                if special_unary_payload(op, CAST_PREFIX).is_some() {
                    return self.expr(operand, 90, repeat_item);
                }
                if let Some(payload) = special_unary_payload(op, ATTR_PREFIX) {
                    return format!("{}.{payload}", self.expr(operand, 90, repeat_item));
                }
                format!(
                    "({}{})",
                    normalize_op(op),
                    self.expr(operand, 90, repeat_item)
                )
            }
            Expr::Binary { op, lhs, rhs } => {
                let prec = e.precedence();
                let rendered = format!(
                    "{} {} {}",
                    self.expr(lhs, prec, repeat_item),
                    normalize_op(op),
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

    fn ruby_scope_path(&self, scope_name: &str) -> String {
        split_scope_path(scope_name)
            .iter()
            .map(|part| to_upper_camel(part))
            .collect::<Vec<_>>()
            .join("::")
    }

    /// Constant reference to `target_scope` as seen from `current_scope`.
    fn ruby_scope_ref(&self, current_scope: &str, target_scope: &str) -> String {
        if target_scope == current_scope {
            return to_upper_camel(last_scope_segment(target_scope));
        }
        if current_scope.is_empty() {
            let rel = self.ruby_scope_path(target_scope);
            if !rel.is_empty() {
                return rel;
            }
        } else if let Some(rel) = target_scope.strip_prefix(&format!("{current_scope}::")) {
            if !rel.is_empty() {
                return self.ruby_scope_path(rel);
            }
        }
        let rooted = self.ruby_scope_path(target_scope);
        if rooted.is_empty() {
            self.class_name.clone()
        } else {
            format!("{}::{rooted}", self.class_name)
        }
    }

    fn ruby_user_type_ref(&self, current_scope: &str, ty: &TypeRef) -> String {
        let Some(user) = ty.as_user() else {
            return self.class_name.clone();
        };
        if let Some(resolved) = resolve_scope_ref(user, &self.root_name, &self.local_scopes) {
            return self.ruby_scope_ref(current_scope, &resolved);
        }
        split_scope_path(user)
            .iter()
            .map(|part| to_upper_camel(part))
            .collect::<Vec<_>>()
            .join("::")
    }

    fn read_primitive(
        &self,
        primitive: PrimitiveType,
        override_endian: Option<Endian>,
        default_endian: Endian,
    ) -> String {
        match primitive {
            PrimitiveType::Bytes => "@_io.read_bytes_full".to_string(),
            PrimitiveType::Str => "''".to_string(),
            _ => format!(
                "@_io.{}",
                read_method(primitive, override_endian.unwrap_or(default_endian))
            ),
        }
    }

    fn read_value(&self, attr: &Attr, scope_name: &str, default_endian: Endian) -> String {
        if is_unresolved_user_type(&attr.ty, &self.user_types) && attr.switch_on.is_none() {
            return format!(
                "{}.new(@_io, self, @_root)",
                self.ruby_user_type_ref(scope_name, &attr.ty)
            );
        }
        let primitive = resolve_primitive(&attr.ty, &self.user_types).unwrap_or(PrimitiveType::U1);
        if primitive == PrimitiveType::Bytes {
            let mut read = match &attr.size_expr {
                Some(size) => format!("@_io.read_bytes({})", self.expr(size, -1, None)),
                None => "@_io.read_bytes_full".to_string(),
            };
            if let Some(Process::XorConst(key)) = attr.process {
                read = format!("Kaitai::Struct::Stream.process_xor_one({read}, {key})");
            }
            return read;
        }
        if primitive == PrimitiveType::Str {
            if let Some(size) = &attr.size_expr {
                return format!(
                    "(@_io.read_bytes({})).force_encoding(\"{}\").encode('UTF-8')",
                    self.expr(size, -1, None),
                    attr.encoding.as_deref().unwrap_or("UTF-8")
                );
            }
        }
        self.read_primitive(primitive, attr.endian_override, default_endian)
    }

    fn read_parse_instance(
        &self,
        inst: &Instance,
        scope_name: &str,
        default_endian: Endian,
    ) -> String {
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
        if is_unresolved_user_type(ty, &self.user_types) {
            return format!(
                "{}.new(@_io, self, @_root)",
                self.ruby_user_type_ref(scope_name, ty)
            );
        }
        let primitive = resolve_primitive(ty, &self.user_types).unwrap_or(PrimitiveType::U1);
        if primitive == PrimitiveType::Bytes {
            return match size_expr {
                Some(size) => format!("@_io.read_bytes({})", self.expr(size, -1, None)),
                None => "@_io.read_bytes_full".to_string(),
            };
        }
        if primitive == PrimitiveType::Str {
            return match size_expr {
                Some(size) => format!(
                    "(@_io.read_bytes({})).force_encoding(\"{}\").encode('UTF-8')",
                    self.expr(size, -1, None),
                    encoding.as_deref().unwrap_or("UTF-8")
                ),
                None => "\"\"".to_string(),
            };
        }
        format!(
            "@_io.{}",
            read_method(primitive, endian_override.unwrap_or(default_endian))
        )
    }

    fn emit_class(
        &self,
        out: &mut String,
        scope_spec: &Spec,
        scope_name: &str,
        ruby_name: &str,
        level: usize,
        is_root: bool,
    ) {
        let ind = ruby_indent(level);
        let ind1 = ruby_indent(level + 1);
        let ind2 = ruby_indent(level + 2);

        let _ = writeln!(out, "{ind}class {ruby_name} < Kaitai::Struct::Struct");
        let _ = writeln!(out, "{ind1}def initialize(_io, _parent = nil, _root = nil)");
        if is_root {
            let _ = writeln!(out, "{ind2}super(_io, _parent, _root || self)");
        } else {
            let _ = writeln!(out, "{ind2}super(_io, _parent, _root)");
        }
        let _ = writeln!(out, "{ind2}_read");
        let _ = writeln!(out, "{ind1}end\n");
        let _ = writeln!(out, "{ind1}def _read");
        for attr in &scope_spec.attrs {
            match attr.repeat {
                RepeatKind::Expr => {
                    let _ = writeln!(out, "{ind2}@{} = []", attr.id);
                    let _ = writeln!(
                        out,
                        "{ind2}({}).times {{ |i|",
                        self.expr(attr.repeat_expr.as_ref().expect("repeat expr"), -1, None)
                    );
                    let _ = writeln!(
                        out,
                        "{ind2}  @{} << {}",
                        attr.id,
                        self.read_value(attr, scope_name, scope_spec.default_endian)
                    );
                    let _ = writeln!(out, "{ind2}}}");
                    continue;
                }
                RepeatKind::Eos => {
                    let _ = writeln!(out, "{ind2}@{} = []", attr.id);
                    let _ = writeln!(out, "{ind2}i = 0");
                    let _ = writeln!(out, "{ind2}while not @_io.eof?");
                    let _ = writeln!(
                        out,
                        "{ind2}  @{} << {}",
                        attr.id,
                        self.read_value(attr, scope_name, scope_spec.default_endian)
                    );
                    let _ = writeln!(out, "{ind2}  i += 1");
                    let _ = writeln!(out, "{ind2}end");
                    continue;
                }
                RepeatKind::Until => {
                    let _ = writeln!(out, "{ind2}@{} = []", attr.id);
                    let _ = writeln!(out, "{ind2}i = 0");
                    let _ = writeln!(out, "{ind2}loop do");
                    let _ = writeln!(
                        out,
                        "{ind2}  _ = {}",
                        self.read_value(attr, scope_name, scope_spec.default_endian)
                    );
                    let _ = writeln!(out, "{ind2}  @{} << _", attr.id);
                    let _ = writeln!(out, "{ind2}  i += 1");
                    let _ = writeln!(
                        out,
                        "{ind2}  break if {}",
                        self.expr(
                            attr.repeat_expr.as_ref().expect("repeat expr"),
                            -1,
                            Some("_")
                        )
                    );
                    let _ = writeln!(out, "{ind2}end");
                    continue;
                }
                RepeatKind::None => {}
            }
            if let Some(switch_on) = &attr.switch_on {
                let _ = writeln!(out, "{ind2}case {}", self.expr(switch_on, -1, None));
                for case in &attr.switch_cases {
                    match &case.match_expr {
                        Some(match_expr) => {
                            let _ = writeln!(out, "{ind2}when {}", self.expr(match_expr, -1, None));
                        }
                        None => {
                            let _ = writeln!(out, "{ind2}else");
                        }
                    }
                    if is_unresolved_user_type(&case.ty, &self.user_types) {
                        let _ = writeln!(
                            out,
                            "{ind2}  @{} = {}.new(@_io, self, @_root)",
                            attr.id,
                            self.ruby_user_type_ref(scope_name, &case.ty)
                        );
                    } else {
                        let case_primitive = resolve_primitive(&case.ty, &self.user_types)
                            .unwrap_or(PrimitiveType::U1);
                        let _ = writeln!(
                            out,
                            "{ind2}  @{} = {}",
                            attr.id,
                            self.read_primitive(
                                case_primitive,
                                attr.endian_override,
                                scope_spec.default_endian
                            )
                        );
                    }
                }
                let _ = writeln!(out, "{ind2}end");
                continue;
            }
            let _ = writeln!(
                out,
                "{ind2}@{} = {}",
                attr.id,
                self.read_value(attr, scope_name, scope_spec.default_endian)
            );
        }
        for v in &scope_spec.validations {
            let _ = writeln!(
                out,
                "{ind2}raise Kaitai::Struct::ValidationExprError.new(@{}, @_io, '/valid/{}') if !({})",
                v.target,
                v.target,
                self.expr(&v.condition_expr, -1, None)
            );
        }
        let _ = writeln!(out, "{ind2}self");
        let _ = writeln!(out, "{ind1}end");

        for child in direct_child_scopes(&self.local_scopes, scope_name) {
            if let Some(child_spec) = self.local_scopes.get(&child) {
                self.emit_class(
                    out,
                    child_spec,
                    &child,
                    &to_upper_camel(last_scope_segment(&child)),
                    level + 1,
                    false,
                );
            }
        }

        for attr in &scope_spec.attrs {
            let _ = writeln!(out, "{ind1}attr_reader :{}", attr.id);
        }
        let mut first_instance = true;
        for inst in &scope_spec.instances {
            if !first_instance {
                out.push('\n');
            }
            let _ = writeln!(out, "{ind1}def {}", inst.id);
            let _ = writeln!(out, "{ind2}return @{} unless @{}.nil?", inst.id, inst.id);
            match &inst.body {
                InstanceBody::Parse { pos_expr, .. } => {
                    let _ = writeln!(out, "{ind2}_pos = @_io.pos");
                    if let Some(pos) = pos_expr {
                        let _ = writeln!(out, "{ind2}@_io.seek({})", self.expr(pos, -1, None));
                    }
                    let _ = writeln!(
                        out,
                        "{ind2}@{} = {}",
                        inst.id,
                        self.read_parse_instance(inst, scope_name, scope_spec.default_endian)
                    );
                    let _ = writeln!(out, "{ind2}@_io.seek(_pos)");
                }
                InstanceBody::Value { expr, .. } => {
                    let _ = writeln!(out, "{ind2}@{} = {}", inst.id, self.expr(expr, -1, None));
                }
            }
            let _ = writeln!(out, "{ind2}@{}", inst.id);
            let _ = writeln!(out, "{ind1}end");
            first_instance = false;
        }
        let _ = writeln!(out, "{ind}end");
    }
}

/// Render the Ruby module for a spec.
pub fn render_module(spec: &Spec) -> String {
    let ctx = RubyContext {
        class_name: to_upper_camel(&spec.name),
        root_name: spec.name.clone(),
        user_types: build_user_types(spec),
        local_scopes: decode_embedded_scopes(spec),
    };

    let mut out = String::new();
    out.push_str(GENERATED_BANNER);
    out.push('\n');
    out.push_str("require 'kaitai/struct/struct'\n\n");
    out.push_str("unless Gem::Version.new(Kaitai::Struct::VERSION) >= Gem::Version.new('0.11')\n");
    out.push_str("  raise \"Incompatible Kaitai Struct Ruby API: 0.11 or later is required, but you have #{Kaitai::Struct::VERSION}\"\n");
    out.push_str("end\n\n");

    ctx.emit_class(&mut out, spec, "", &ctx.class_name, 0, true);
    out
}
