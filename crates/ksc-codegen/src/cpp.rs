//! C++/STL17 emitter: one header and one source file per spec.
//!
//! The generated root class inherits `kaitai::kstruct`, owns user-typed
//! and repeated storage through `std::unique_ptr`, reads attrs in source
//! order inside `_read()`, and caches instances behind `f_<id>` guards.
//! Embedded scopes become nested classes. Output is deterministic:
//! every collection iterated here has a stable order.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;

use indexmap::IndexMap;
use ksc_ir::{
    compute_instance_types, import_stem, normalize_op, special_unary_payload,
    user_type_matches_import, Attr, Endian, Expr, ExprType, Instance, InstanceBody, PrimitiveType,
    Process, RepeatKind, Spec, TypeRef, ATTR_PREFIX, CAST_PREFIX,
};

use crate::resolve::{
    build_user_types, is_unresolved_user_type, read_method, resolve_primitive, UserTypes,
};
use crate::scope::{
    decode_embedded_scopes, direct_child_scopes, enum_short_name, last_scope_segment,
    parent_scope_name, resolve_enum_owner_scope, resolve_scope_ref, split_scope_path,
};

type NameSet = HashSet<String>;
type Scopes = BTreeMap<String, Spec>;
type InstanceTypes = IndexMap<String, ExprType>;

const GENERATED_BANNER: &str =
    "// This is a generated file! Please edit source .ksy file and use kaitai-struct-compiler to rebuild\n";

// ---------------------------------------------------------------------------
// Expression rendering

/// Render an expression as C++ source. Declared attrs, params and
/// instances turn into accessor calls; `_` becomes the repeat item.
fn render_expr(
    expr: &Expr,
    attrs: &NameSet,
    instances: &NameSet,
    parent_prec: i32,
    repeat_item: Option<&str>,
) -> String {
    match expr {
        Expr::Int(value) => value.to_string(),
        Expr::Bool(value) => if *value { "true" } else { "false" }.to_string(),
        Expr::Name(text) => {
            if let Some(item) = repeat_item {
                if text == "_" {
                    return item.to_string();
                }
            }
            if attrs.contains(text) || instances.contains(text) {
                format!("{text}()")
            } else {
                text.clone()
            }
        }
        Expr::Unary { op, operand } => {
            if let Some(payload) = special_unary_payload(op, CAST_PREFIX) {
                return format!(
                    "static_cast<{}*>({})",
                    cpp_user_type_name(payload),
                    render_expr(operand, attrs, instances, 90, repeat_item)
                );
            }
            if let Some(payload) = special_unary_payload(op, ATTR_PREFIX) {
                return format!(
                    "{}->{payload}()",
                    render_expr(operand, attrs, instances, 90, repeat_item)
                );
            }
            format!(
                "({}{})",
                normalize_op(op),
                render_expr(operand, attrs, instances, 90, repeat_item)
            )
        }
        Expr::Binary { op, lhs, rhs } => {
            let prec = expr.precedence();
            let op = normalize_op(op);
            let mut lhs_text = render_expr(lhs, attrs, instances, prec, repeat_item);
            let mut rhs_text = render_expr(rhs, attrs, instances, prec + 1, repeat_item);
            let logical = op == "&&" || op == "||";
            if logical {
                lhs_text = format!("({lhs_text})");
                rhs_text = format!("({rhs_text})");
            }
            let rendered = format!("{lhs_text} {op} {rhs_text}");
            if logical || prec <= parent_prec {
                format!("({rendered})")
            } else {
                rendered
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Type naming

fn cpp_field_type(primitive: PrimitiveType) -> &'static str {
    match primitive {
        PrimitiveType::U1 => "uint8_t",
        PrimitiveType::U2 => "uint16_t",
        PrimitiveType::U4 => "uint32_t",
        PrimitiveType::U8 => "uint64_t",
        PrimitiveType::S1 => "int8_t",
        PrimitiveType::S2 => "int16_t",
        PrimitiveType::S4 => "int32_t",
        PrimitiveType::S8 => "int64_t",
        PrimitiveType::F4 => "float",
        PrimitiveType::F8 => "double",
        PrimitiveType::Str | PrimitiveType::Bytes => "std::string",
    }
}

/// `a::b` becomes `a_t::b_t`; the runtime base type passes through.
fn cpp_user_type_name(type_name: &str) -> String {
    if type_name == "kaitai::kstruct" || type_name == "struct" || type_name.is_empty() {
        return "kaitai::kstruct".to_string();
    }
    split_scope_path(type_name)
        .iter()
        .map(|part| format!("{part}_t"))
        .collect::<Vec<_>>()
        .join("::")
}

fn sanitize_identifier(value: &str) -> String {
    let mut out: String = value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn enum_cpp_type_name(enum_name: &str) -> String {
    format!("{}_e", sanitize_identifier(enum_short_name(enum_name)))
}

fn enum_value_name(name: &str) -> String {
    sanitize_identifier(name)
}

fn upper_snake(value: &str) -> String {
    sanitize_identifier(value).to_ascii_uppercase()
}

fn nested_enum_type_name(enum_name: &str) -> String {
    format!("{}_t", enum_short_name(enum_name))
}

fn nested_enum_value_name(enum_name: &str, value_name: &str) -> String {
    format!(
        "{}_{}",
        upper_snake(enum_short_name(enum_name)),
        upper_snake(value_name)
    )
}

// ---------------------------------------------------------------------------
// Storage selection

/// Storage base for a switch attr: the largest-ranked primitive among
/// case types. `bytes`/`str` outrank every scalar.
fn switch_case_type(attr: &Attr, user_types: &UserTypes) -> String {
    if attr.switch_cases.is_empty() {
        let primitive = resolve_primitive(&attr.ty, user_types).unwrap_or(PrimitiveType::U1);
        return cpp_field_type(primitive).to_string();
    }
    fn rank(p: PrimitiveType) -> i32 {
        match p {
            PrimitiveType::U1 | PrimitiveType::S1 => 1,
            PrimitiveType::U2 | PrimitiveType::S2 => 2,
            PrimitiveType::U4 | PrimitiveType::S4 | PrimitiveType::F4 => 4,
            PrimitiveType::U8 | PrimitiveType::S8 | PrimitiveType::F8 => 8,
            PrimitiveType::Bytes | PrimitiveType::Str => 100,
        }
    }
    let mut selected = PrimitiveType::U1;
    let mut selected_rank = -1;
    for case in &attr.switch_cases {
        let primitive = resolve_primitive(&case.ty, user_types).unwrap_or(PrimitiveType::U1);
        if rank(primitive) > selected_rank {
            selected = primitive;
            selected_rank = rank(primitive);
        }
    }
    cpp_field_type(selected).to_string()
}

fn effective_attr_primitive(attr: &Attr, user_types: &UserTypes) -> Option<PrimitiveType> {
    if attr.switch_on.is_some() && !attr.switch_cases.is_empty() {
        return resolve_primitive(&attr.switch_cases[0].ty, user_types);
    }
    resolve_primitive(&attr.ty, user_types)
}

fn cpp_attr_type(attr: &Attr, user_types: &UserTypes) -> String {
    if let Some(enum_name) = &attr.enum_name {
        return enum_cpp_type_name(enum_name);
    }
    if let TypeRef::User(user) = &attr.ty {
        if resolve_primitive(&attr.ty, user_types).is_none() {
            return format!("{}*", cpp_user_type_name(user));
        }
    }
    let primitive = effective_attr_primitive(attr, user_types).unwrap_or(PrimitiveType::U1);
    cpp_field_type(primitive).to_string()
}

fn attr_is_unresolved_user(attr: &Attr, user_types: &UserTypes) -> bool {
    is_unresolved_user_type(&attr.ty, user_types) && attr.switch_on.is_none()
}

fn cpp_storage_type(attr: &Attr, user_types: &UserTypes) -> String {
    if attr_is_unresolved_user(attr, user_types) {
        let type_name = cpp_user_type_name(attr.ty.as_user().unwrap_or_default());
        if attr.repeat != RepeatKind::None {
            return format!("std::unique_ptr<std::vector<std::unique_ptr<{type_name}>>>");
        }
        return format!("std::unique_ptr<{type_name}>");
    }
    let base = if attr.switch_on.is_some() {
        switch_case_type(attr, user_types)
    } else {
        cpp_attr_type(attr, user_types)
    };
    if attr.repeat != RepeatKind::None {
        return format!("std::unique_ptr<std::vector<{base}>>");
    }
    base
}

fn cpp_repeat_element_type(attr: &Attr, user_types: &UserTypes) -> String {
    if attr_is_unresolved_user(attr, user_types) {
        let type_name = cpp_user_type_name(attr.ty.as_user().unwrap_or_default());
        return format!("std::unique_ptr<{type_name}>");
    }
    if attr.switch_on.is_some() {
        switch_case_type(attr, user_types)
    } else {
        cpp_attr_type(attr, user_types)
    }
}

fn cpp_accessor_type(attr: &Attr, user_types: &UserTypes) -> String {
    if attr_is_unresolved_user(attr, user_types) {
        let type_name = cpp_user_type_name(attr.ty.as_user().unwrap_or_default());
        if attr.repeat != RepeatKind::None {
            return format!("std::vector<std::unique_ptr<{type_name}>>*");
        }
        return format!("{type_name}*");
    }
    if attr.repeat != RepeatKind::None {
        let base = if attr.switch_on.is_some() {
            switch_case_type(attr, user_types)
        } else {
            cpp_attr_type(attr, user_types)
        };
        return format!("std::vector<{base}>*");
    }
    cpp_storage_type(attr, user_types)
}

fn cpp_type_for_type_ref(ty: &TypeRef, user_types: &UserTypes) -> String {
    if let Some(primitive) = resolve_primitive(ty, user_types) {
        return cpp_field_type(primitive).to_string();
    }
    match ty {
        TypeRef::User(user) => format!("{}*", cpp_user_type_name(user)),
        TypeRef::Primitive(_) => "uint8_t".to_string(),
    }
}

fn cpp_expr_type(ty: ExprType) -> &'static str {
    match ty {
        ExprType::Bool => "bool",
        ExprType::Int8 => "int8_t",
        ExprType::Int32 => "int32_t",
    }
}

fn cpp_instance_type(
    inst: &Instance,
    instance_types: &InstanceTypes,
    user_types: &UserTypes,
) -> String {
    match &inst.body {
        InstanceBody::Parse { ty, .. } => cpp_type_for_type_ref(ty, user_types),
        InstanceBody::Value {
            explicit_type: Some(ty),
            ..
        } => cpp_type_for_type_ref(ty, user_types),
        InstanceBody::Value { .. } => match instance_types.get(&inst.id) {
            Some(ty) => cpp_expr_type(*ty).to_string(),
            None => "int32_t".to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// Read expressions

fn cpp_read_primitive_expr(
    primitive: PrimitiveType,
    override_endian: Option<Endian>,
    default_endian: Endian,
) -> String {
    match primitive {
        PrimitiveType::Bytes => "m__io->read_bytes_full()".to_string(),
        PrimitiveType::Str => "std::string()".to_string(),
        _ => format!(
            "m__io->{}()",
            read_method(primitive, override_endian.unwrap_or(default_endian))
        ),
    }
}

/// One-shot read for a non-switch attr, including user-type
/// construction, sized bytes/str reads, process steps and enum casts.
fn read_expr(
    attr: &Attr,
    default_endian: Endian,
    attrs: &NameSet,
    instances: &NameSet,
    user_types: &UserTypes,
) -> String {
    let primitive = resolve_primitive(&attr.ty, user_types);
    if primitive.is_none() {
        if let TypeRef::User(user) = &attr.ty {
            let type_name = cpp_user_type_name(user);
            let ctor_args = if user_types.contains_key(user) {
                "m__io, this, m__root".to_string()
            } else {
                let mut args: Vec<String> = attr
                    .user_type_args
                    .iter()
                    .map(|arg| render_expr(arg, attrs, instances, -1, None))
                    .collect();
                args.push("m__io".to_string());
                args.join(", ")
            };
            return format!("std::unique_ptr<{type_name}>(new {type_name}({ctor_args}))");
        }
    }
    let primitive = primitive.unwrap_or(PrimitiveType::U1);
    if primitive == PrimitiveType::Bytes {
        let mut read = match &attr.size_expr {
            Some(size) => format!(
                "m__io->read_bytes({})",
                render_expr(size, attrs, instances, -1, None)
            ),
            None => "m__io->read_bytes_full()".to_string(),
        };
        if let Some(Process::XorConst(key)) = attr.process {
            read = format!("kaitai::kstream::process_xor_one({read}, {key})");
        }
        return read;
    }
    if primitive == PrimitiveType::Str {
        let Some(size) = &attr.size_expr else {
            return "std::string()".to_string();
        };
        let encoding = attr.encoding.as_deref().unwrap_or("UTF-8");
        return format!(
            "kaitai::kstream::bytes_to_str(m__io->read_bytes({}), \"{encoding}\")",
            render_expr(size, attrs, instances, -1, None)
        );
    }
    let base = cpp_read_primitive_expr(primitive, attr.endian_override, default_endian);
    if let Some(enum_name) = &attr.enum_name {
        return format!("static_cast<{}>({base})", enum_cpp_type_name(enum_name));
    }
    base
}

/// Switch rendered as an immediately-invoked lambda: the fallback when
/// match expressions are not all integer literals.
fn read_switch_expr(
    attr: &Attr,
    default_endian: Endian,
    attrs: &NameSet,
    instances: &NameSet,
    user_types: &UserTypes,
) -> String {
    let on = render_expr(
        attr.switch_on.as_ref().expect("switch attr"),
        attrs,
        instances,
        -1,
        None,
    );
    let mut out = String::from("([&]() {\n");
    for case in &attr.switch_cases {
        let Some(match_expr) = &case.match_expr else {
            continue;
        };
        let case_primitive = resolve_primitive(&case.ty, user_types).unwrap_or(PrimitiveType::U1);
        let _ = writeln!(
            out,
            "        if ({on} == {}) return {};",
            render_expr(match_expr, attrs, instances, -1, None),
            cpp_read_primitive_expr(case_primitive, attr.endian_override, default_endian)
        );
    }
    let mut has_else = false;
    for case in &attr.switch_cases {
        if case.match_expr.is_some() {
            continue;
        }
        let case_primitive = resolve_primitive(&case.ty, user_types).unwrap_or(PrimitiveType::U1);
        let _ = writeln!(
            out,
            "        return {};",
            cpp_read_primitive_expr(case_primitive, attr.endian_override, default_endian)
        );
        has_else = true;
        break;
    }
    if !has_else {
        out.push_str("        throw std::runtime_error(\"switch-on has no matching case\");\n");
    }
    out.push_str("    })()");
    out
}

/// A native `switch` statement needs every match expression to be an
/// integer literal.
fn can_render_native_switch(attr: &Attr) -> bool {
    if attr.switch_on.is_none() {
        return false;
    }
    attr.switch_cases
        .iter()
        .all(|case| match &case.match_expr {
            Some(expr) => matches!(expr, Expr::Int(_)),
            None => true,
        })
}

fn has_switch_else_case(attr: &Attr) -> bool {
    attr.switch_cases.iter().any(|case| case.match_expr.is_none())
}

fn needs_vector_include(spec: &Spec) -> bool {
    spec.attrs.iter().any(|attr| attr.repeat != RepeatKind::None)
}

fn indent(level: usize) -> String {
    "    ".repeat(level)
}

// ---------------------------------------------------------------------------
// Nested scope naming

fn cpp_scope_type_qualified(root_name: &str, scope_name: &str) -> String {
    let mut out = format!("{root_name}_t");
    for part in split_scope_path(scope_name) {
        let _ = write!(out, "::{part}_t");
    }
    out
}

fn scope_parent_cpp_ptr_type(root_name: &str, scope_name: &str) -> String {
    let parent = parent_scope_name(scope_name);
    if parent.is_empty() {
        format!("{root_name}_t*")
    } else {
        format!("{}*", cpp_scope_type_qualified(root_name, &parent))
    }
}

/// Type token for referring to `target_scope` from inside
/// `current_scope`: bare class name for self/children, fully qualified
/// otherwise.
fn scope_local_type_token(root_name: &str, current_scope: &str, target_scope: &str) -> String {
    let target_parent = parent_scope_name(target_scope);
    if target_parent == current_scope || target_scope == current_scope {
        format!("{}_t", last_scope_segment(target_scope))
    } else {
        cpp_scope_type_qualified(root_name, target_scope)
    }
}

/// C++ type expression for a scope-resolved user reference.
fn nested_user_type_expr(
    user: &str,
    current_scope: &str,
    root_name: &str,
    scopes: &Scopes,
) -> String {
    match resolve_scope_ref(user, root_name, scopes) {
        Some(resolved) => scope_local_type_token(root_name, current_scope, &resolved),
        None => cpp_user_type_name(user),
    }
}

fn nested_attr_base_type(
    attr: &Attr,
    current_scope: &str,
    root_name: &str,
    scopes: &Scopes,
    user_types: &UserTypes,
) -> String {
    if let Some(enum_name) = &attr.enum_name {
        return nested_enum_type_name(enum_name);
    }
    if attr_is_unresolved_user(attr, user_types) {
        let user = attr.ty.as_user().unwrap_or_default();
        return format!(
            "{}*",
            nested_user_type_expr(user, current_scope, root_name, scopes)
        );
    }
    if attr.switch_on.is_some() {
        return switch_case_type(attr, user_types);
    }
    let primitive = resolve_primitive(&attr.ty, user_types).unwrap_or(PrimitiveType::U1);
    cpp_field_type(primitive).to_string()
}

fn nested_attr_storage_type(
    attr: &Attr,
    current_scope: &str,
    root_name: &str,
    scopes: &Scopes,
    user_types: &UserTypes,
) -> String {
    let unresolved_user = attr_is_unresolved_user(attr, user_types);
    if attr.repeat != RepeatKind::None {
        if unresolved_user {
            let user = attr.ty.as_user().unwrap_or_default();
            let type_expr = nested_user_type_expr(user, current_scope, root_name, scopes);
            return format!("std::unique_ptr<std::vector<std::unique_ptr<{type_expr}>>>");
        }
        return format!(
            "std::unique_ptr<std::vector<{}>>",
            nested_attr_base_type(attr, current_scope, root_name, scopes, user_types)
        );
    }
    if unresolved_user {
        let user = attr.ty.as_user().unwrap_or_default();
        let type_expr = nested_user_type_expr(user, current_scope, root_name, scopes);
        return format!("std::unique_ptr<{type_expr}>");
    }
    nested_attr_base_type(attr, current_scope, root_name, scopes, user_types)
}

fn nested_attr_accessor_type(
    attr: &Attr,
    current_scope: &str,
    root_name: &str,
    scopes: &Scopes,
    user_types: &UserTypes,
) -> String {
    let unresolved_user = attr_is_unresolved_user(attr, user_types);
    if attr.repeat != RepeatKind::None {
        if unresolved_user {
            let user = attr.ty.as_user().unwrap_or_default();
            let type_expr = nested_user_type_expr(user, current_scope, root_name, scopes);
            return format!("std::vector<std::unique_ptr<{type_expr}>>*");
        }
        return format!(
            "std::vector<{}>*",
            nested_attr_base_type(attr, current_scope, root_name, scopes, user_types)
        );
    }
    if unresolved_user {
        let user = attr.ty.as_user().unwrap_or_default();
        return format!(
            "{}*",
            nested_user_type_expr(user, current_scope, root_name, scopes)
        );
    }
    nested_attr_base_type(attr, current_scope, root_name, scopes, user_types)
}

// ---------------------------------------------------------------------------
// Nested scope emission

fn emit_nested_class_header(
    out: &mut String,
    root_name: &str,
    scope_name: &str,
    scopes: &Scopes,
    user_types: &UserTypes,
    level: usize,
) {
    let Some(scope_spec) = scopes.get(scope_name) else {
        return;
    };
    let class_name = format!("{}_t", last_scope_segment(scope_name));
    let parent_ptr_type = scope_parent_cpp_ptr_type(root_name, scope_name);
    let children = direct_child_scopes(scopes, scope_name);
    let has_enums = !scope_spec.enums.is_empty();
    let ind = indent(level);
    let ind1 = indent(level + 1);

    let _ = writeln!(out, "{ind}class {class_name} : public kaitai::kstruct {{\n");
    let _ = writeln!(out, "{ind}public:");
    for child in &children {
        let _ = writeln!(out, "{ind1}class {}_t;", last_scope_segment(child));
    }
    if !children.is_empty() {
        out.push('\n');
    }

    for e in &scope_spec.enums {
        let enum_ty = nested_enum_type_name(&e.name);
        let _ = writeln!(out, "{ind1}enum {enum_ty} {{");
        for (i, v) in e.values.iter().enumerate() {
            let sep = if i + 1 == e.values.len() { "" } else { "," };
            let _ = writeln!(
                out,
                "{}{} = {}{sep}",
                indent(level + 2),
                nested_enum_value_name(&e.name, &v.name),
                v.value
            );
        }
        let _ = writeln!(out, "{ind1}}};");
        let _ = writeln!(
            out,
            "{ind1}static bool _is_defined_{enum_ty}({enum_ty} v);\n"
        );
        let _ = writeln!(out, "{ind}private:");
        let _ = writeln!(out, "{ind1}static const std::set<{enum_ty}> _values_{enum_ty};\n");
        let _ = writeln!(out, "{ind}public:");
        out.push('\n');
    }

    if children.is_empty() && !has_enums {
        out.push('\n');
    }

    let _ = writeln!(
        out,
        "{ind1}{class_name}(kaitai::kstream* p__io, {parent_ptr_type} p__parent = nullptr, {root_name}_t* p__root = nullptr);\n"
    );
    let _ = writeln!(out, "{ind}private:");
    let _ = writeln!(out, "{ind1}void _read();");
    let _ = writeln!(out, "{ind1}void _clean_up();\n");
    let _ = writeln!(out, "{ind}public:");
    let _ = writeln!(out, "{ind1}~{class_name}();");

    for child in &children {
        out.push('\n');
        emit_nested_class_header(out, root_name, child, scopes, user_types, level + 1);
    }
    if !children.is_empty() {
        out.push('\n');
        let _ = writeln!(out, "{ind}public:");
    }

    for attr in &scope_spec.attrs {
        let access_type = nested_attr_accessor_type(attr, scope_name, root_name, scopes, user_types);
        if attr.repeat != RepeatKind::None || attr_is_unresolved_user(attr, user_types) {
            let _ = writeln!(
                out,
                "{ind1}{access_type} {}() const {{ return m_{}.get(); }}",
                attr.id, attr.id
            );
        } else {
            let _ = writeln!(
                out,
                "{ind1}{access_type} {}() const {{ return m_{}; }}",
                attr.id, attr.id
            );
        }
    }
    let _ = writeln!(out, "{ind1}{root_name}_t* _root() const {{ return m__root; }}");
    let _ = writeln!(out, "{ind1}{parent_ptr_type} _parent() const {{ return m__parent; }}");

    out.push('\n');
    let _ = writeln!(out, "{ind}private:");
    let mut has_nullable_switch = false;
    for attr in &scope_spec.attrs {
        let _ = writeln!(
            out,
            "{ind1}{} m_{};",
            nested_attr_storage_type(attr, scope_name, root_name, scopes, user_types),
            attr.id
        );
        if attr.switch_on.is_some() && !has_switch_else_case(attr) {
            has_nullable_switch = true;
            let _ = writeln!(out, "{ind1}bool n_{};", attr.id);
        }
    }
    if has_nullable_switch {
        out.push('\n');
        let _ = writeln!(out, "{ind}public:");
        for attr in &scope_spec.attrs {
            if attr.switch_on.is_some() && !has_switch_else_case(attr) {
                let _ = writeln!(
                    out,
                    "{ind1}bool _is_null_{}() {{ {}(); return n_{}; }};",
                    attr.id, attr.id, attr.id
                );
            }
        }
        out.push('\n');
        let _ = writeln!(out, "{ind}private:");
    }
    let _ = writeln!(out, "{ind1}{root_name}_t* m__root;");
    let _ = writeln!(out, "{ind1}{parent_ptr_type} m__parent;");
    let _ = writeln!(out, "{ind}}};");
}

fn emit_nested_class_source(
    out: &mut String,
    root_name: &str,
    scope_name: &str,
    scopes: &Scopes,
    user_types: &UserTypes,
) {
    let Some(scope_spec) = scopes.get(scope_name) else {
        return;
    };
    let class_name = format!("{}_t", last_scope_segment(scope_name));
    let full_class = cpp_scope_type_qualified(root_name, scope_name);
    let parent_ptr_type = scope_parent_cpp_ptr_type(root_name, scope_name);

    let attrs: NameSet = scope_spec.attrs.iter().map(|a| a.id.clone()).collect();
    let instances = NameSet::new();

    let enum_cast_type = |enum_name: &str| -> String {
        match resolve_enum_owner_scope(scope_name, enum_name, scopes) {
            Some(owner) => format!(
                "{}::{}",
                cpp_scope_type_qualified(root_name, &owner),
                nested_enum_type_name(enum_name)
            ),
            None => nested_enum_type_name(enum_name),
        }
    };

    let read_scope_user = |attr: &Attr| -> String {
        let user = attr.ty.as_user().unwrap_or_default();
        let type_expr = nested_user_type_expr(user, scope_name, root_name, scopes);
        let mut args: Vec<String> = attr
            .user_type_args
            .iter()
            .map(|arg| render_expr(arg, &attrs, &instances, -1, None))
            .collect();
        args.push("m__io, this, m__root".to_string());
        format!(
            "std::unique_ptr<{type_expr}>(new {type_expr}({}))",
            args.join(", ")
        )
    };

    for e in &scope_spec.enums {
        let enum_ty = nested_enum_type_name(&e.name);
        let _ = writeln!(
            out,
            "const std::set<{full_class}::{enum_ty}> {full_class}::_values_{enum_ty}{{"
        );
        for v in &e.values {
            let _ = writeln!(
                out,
                "    {full_class}::{},",
                nested_enum_value_name(&e.name, &v.name)
            );
        }
        let _ = writeln!(out, "}};");
        let _ = writeln!(
            out,
            "bool {full_class}::_is_defined_{enum_ty}({full_class}::{enum_ty} v) {{"
        );
        let _ = writeln!(
            out,
            "    return {full_class}::_values_{enum_ty}.find(v) != {full_class}::_values_{enum_ty}.end();"
        );
        out.push_str("}\n\n");
    }

    let _ = writeln!(
        out,
        "{full_class}::{class_name}(kaitai::kstream* p__io, {parent_ptr_type} p__parent, {root_name}_t* p__root) : kaitai::kstruct(p__io) {{"
    );
    out.push_str("    m__parent = p__parent;\n");
    out.push_str("    m__root = p__root;\n");
    for attr in &scope_spec.attrs {
        if attr.repeat != RepeatKind::None || attr_is_unresolved_user(attr, user_types) {
            let _ = writeln!(out, "    m_{} = nullptr;", attr.id);
        }
    }
    out.push_str("    _read();\n");
    out.push_str("}\n\n");

    let _ = writeln!(out, "void {full_class}::_read() {{");
    for attr in &scope_spec.attrs {
        if attr.switch_on.is_some() && attr.repeat == RepeatKind::None {
            let has_else = has_switch_else_case(attr);
            if !has_else {
                let _ = writeln!(out, "    n_{} = true;", attr.id);
            }
            let _ = writeln!(
                out,
                "    switch ({}) {{",
                render_expr(
                    attr.switch_on.as_ref().expect("switch attr"),
                    &attrs,
                    &instances,
                    -1,
                    None
                )
            );
            for case in &attr.switch_cases {
                match &case.match_expr {
                    None => out.push_str("    default: {\n"),
                    Some(Expr::Int(value)) => {
                        let _ = writeln!(out, "    case {value}: {{");
                    }
                    Some(_) => out.push_str("    default: {\n"),
                }
                // n_ bookkeeping only exists when the switch has no else.
                if !has_else {
                    let _ = writeln!(out, "        n_{} = false;", attr.id);
                }
                let case_primitive =
                    resolve_primitive(&case.ty, user_types).unwrap_or(PrimitiveType::U1);
                let _ = writeln!(
                    out,
                    "        m_{} = {};",
                    attr.id,
                    cpp_read_primitive_expr(
                        case_primitive,
                        attr.endian_override,
                        scope_spec.default_endian
                    )
                );
                out.push_str("        break;\n");
                out.push_str("    }\n");
            }
            out.push_str("    }\n");
            continue;
        }

        if attr.repeat == RepeatKind::None {
            if attr_is_unresolved_user(attr, user_types) {
                let _ = writeln!(out, "    m_{} = {};", attr.id, read_scope_user(attr));
            } else if let Some(enum_name) = &attr.enum_name {
                let primitive =
                    resolve_primitive(&attr.ty, user_types).unwrap_or(PrimitiveType::U1);
                let _ = writeln!(
                    out,
                    "    m_{} = static_cast<{}>({});",
                    attr.id,
                    enum_cast_type(enum_name),
                    cpp_read_primitive_expr(
                        primitive,
                        attr.endian_override,
                        scope_spec.default_endian
                    )
                );
            } else {
                let _ = writeln!(
                    out,
                    "    m_{} = {};",
                    attr.id,
                    read_expr(attr, scope_spec.default_endian, &attrs, &instances, user_types)
                );
            }
            continue;
        }

        let repeat_elem = if attr_is_unresolved_user(attr, user_types) {
            let user = attr.ty.as_user().unwrap_or_default();
            format!(
                "std::unique_ptr<{}>",
                nested_user_type_expr(user, scope_name, root_name, scopes)
            )
        } else {
            nested_attr_base_type(attr, scope_name, root_name, scopes, user_types)
        };

        let _ = writeln!(
            out,
            "    m_{} = std::unique_ptr<std::vector<{repeat_elem}>>(new std::vector<{repeat_elem}>());",
            attr.id
        );
        match attr.repeat {
            RepeatKind::Eos => {
                out.push_str("    while (!m__io->is_eof()) {\n");
                if attr_is_unresolved_user(attr, user_types) {
                    let _ = writeln!(
                        out,
                        "        m_{}->push_back({});",
                        attr.id,
                        read_scope_user(attr)
                    );
                } else {
                    let _ = writeln!(
                        out,
                        "        m_{}->push_back({});",
                        attr.id,
                        read_expr(attr, scope_spec.default_endian, &attrs, &instances, user_types)
                    );
                }
                out.push_str("    }\n");
            }
            RepeatKind::Expr => {
                let _ = writeln!(
                    out,
                    "    const int l_{} = {};",
                    attr.id,
                    render_expr(
                        attr.repeat_expr.as_ref().expect("repeat expr"),
                        &attrs,
                        &instances,
                        -1,
                        None
                    )
                );
                let _ = writeln!(out, "    for (int i = 0; i < l_{}; i++) {{", attr.id);
                if attr_is_unresolved_user(attr, user_types) {
                    let _ = writeln!(
                        out,
                        "        m_{}->push_back({});",
                        attr.id,
                        read_scope_user(attr)
                    );
                } else {
                    let _ = writeln!(
                        out,
                        "        m_{}->push_back(std::move({}));",
                        attr.id,
                        read_expr(attr, scope_spec.default_endian, &attrs, &instances, user_types)
                    );
                }
                out.push_str("    }\n");
            }
            _ => {
                out.push_str("    do {\n");
                if attr_is_unresolved_user(attr, user_types) {
                    let _ = writeln!(out, "        auto repeat_item = {};", read_scope_user(attr));
                } else {
                    let _ = writeln!(
                        out,
                        "        auto repeat_item = {};",
                        read_expr(attr, scope_spec.default_endian, &attrs, &instances, user_types)
                    );
                }
                let _ = writeln!(out, "        m_{}->push_back(std::move(repeat_item));", attr.id);
                let _ = writeln!(
                    out,
                    "    }} while (!({}));",
                    render_expr(
                        attr.repeat_expr.as_ref().expect("repeat expr"),
                        &attrs,
                        &instances,
                        -1,
                        Some("repeat_item")
                    )
                );
            }
        }
    }
    out.push_str("}\n\n");

    let _ = writeln!(out, "{full_class}::~{class_name}() {{");
    out.push_str("    _clean_up();\n");
    out.push_str("}\n\n");

    let _ = writeln!(out, "void {full_class}::_clean_up() {{");
    for attr in &scope_spec.attrs {
        if attr.switch_on.is_some() && !has_switch_else_case(attr) {
            let _ = writeln!(out, "    if (!n_{}) {{", attr.id);
            out.push_str("    }\n");
        }
    }
    out.push_str("}\n");

    out.push('\n');

    for child in direct_child_scopes(scopes, scope_name) {
        emit_nested_class_source(out, root_name, &child, scopes, user_types);
    }
}

// ---------------------------------------------------------------------------
// Root emission

fn ctor_param_decl(spec: &Spec, user_types: &UserTypes, with_defaults: bool) -> String {
    let mut args = String::new();
    for p in &spec.params {
        let _ = write!(args, "{} p_{}, ", cpp_type_for_type_ref(&p.ty, user_types), p.id);
    }
    if with_defaults {
        let _ = write!(
            args,
            "kaitai::kstream* p__io, kaitai::kstruct* p__parent = nullptr, {}_t* p__root = nullptr",
            spec.name
        );
    } else {
        let _ = write!(
            args,
            "kaitai::kstream* p__io, kaitai::kstruct* p__parent, {}_t* p__root",
            spec.name
        );
    }
    args
}

/// Render the `.h` file.
pub fn render_header(spec: &Spec) -> String {
    let instance_types = compute_instance_types(spec);
    let user_types = build_user_types(spec);
    let local_scopes = decode_embedded_scopes(spec);

    let mut required_import_headers: HashSet<String> = HashSet::new();
    let mut maybe_add_import = |ty: &TypeRef| {
        if !is_unresolved_user_type(ty, &user_types) {
            return;
        }
        let Some(user) = ty.as_user() else { return };
        if user == "kaitai::kstruct" || user == "struct" {
            return;
        }
        for imp in &spec.imports {
            let stem = import_stem(imp);
            if user_type_matches_import(user, stem) {
                required_import_headers.insert(stem.to_string());
            }
        }
    };
    for p in &spec.params {
        maybe_add_import(&p.ty);
    }
    for a in &spec.attrs {
        maybe_add_import(&a.ty);
        for case in &a.switch_cases {
            maybe_add_import(&case.ty);
        }
    }
    for inst in &spec.instances {
        match &inst.body {
            InstanceBody::Parse { ty, .. } => maybe_add_import(ty),
            InstanceBody::Value {
                explicit_type: Some(ty),
                ..
            } => maybe_add_import(ty),
            InstanceBody::Value { .. } => {}
        }
    }

    let mut out = String::new();
    out.push_str("#pragma once\n\n");
    out.push_str(GENERATED_BANNER);
    out.push('\n');
    let _ = writeln!(out, "class {}_t;\n", spec.name);
    out.push_str("#include \"kaitai/kaitaistruct.h\"\n");
    out.push_str("#include <kaitai/exceptions.h>\n");
    out.push_str("#include <stdint.h>\n");
    out.push_str("#include <memory>\n");
    if needs_vector_include(spec) {
        out.push_str("#include <vector>\n");
    }
    let needs_set_include =
        !spec.enums.is_empty() || local_scopes.values().any(|s| !s.enums.is_empty());
    if needs_set_include {
        out.push_str("#include <set>\n");
    }
    let mut emitted_imports: HashSet<String> = HashSet::new();
    for imp in &spec.imports {
        let stem = import_stem(imp);
        if !required_import_headers.contains(stem) {
            continue;
        }
        if !emitted_imports.insert(stem.to_string()) {
            continue;
        }
        let _ = writeln!(out, "#include \"{stem}.h\"");
    }
    out.push('\n');
    out.push_str("#if KAITAI_STRUCT_VERSION < 11000L\n");
    out.push_str(
        "#error \"Incompatible Kaitai Struct C++/STL API: version 0.11 or later is required\"\n",
    );
    out.push_str("#endif\n\n");

    for e in &spec.enums {
        let _ = writeln!(out, "enum class {} {{", enum_cpp_type_name(&e.name));
        for (i, v) in e.values.iter().enumerate() {
            let sep = if i + 1 == e.values.len() { "" } else { "," };
            let _ = writeln!(out, "    {} = {}{sep}", enum_value_name(&v.name), v.value);
        }
        out.push_str("};\n\n");
    }

    let _ = writeln!(out, "class {}_t : public kaitai::kstruct {{\n", spec.name);
    out.push_str("public:\n");
    let root_children = direct_child_scopes(&local_scopes, "");
    if root_children.is_empty() {
        out.push('\n');
    }
    for child in &root_children {
        let _ = writeln!(out, "    class {}_t;", last_scope_segment(child));
    }
    if !root_children.is_empty() {
        out.push('\n');
    }
    let _ = writeln!(
        out,
        "    {}_t({});\n",
        spec.name,
        ctor_param_decl(spec, &user_types, true)
    );
    out.push_str("private:\n");
    out.push_str("    void _read();\n");
    out.push_str("    void _clean_up();\n\n");
    out.push_str("public:\n");
    let _ = writeln!(out, "    ~{}_t();", spec.name);
    for child in &root_children {
        out.push('\n');
        emit_nested_class_header(&mut out, &spec.name, child, &local_scopes, &user_types, 1);
    }
    if !local_scopes.is_empty() {
        out.push_str("\npublic:\n");
    }

    let mut raw_accessors: Vec<String> = Vec::new();
    let mut raw_fields: Vec<String> = Vec::new();
    for inst in &spec.instances {
        let _ = writeln!(
            out,
            "    {} {}();",
            cpp_instance_type(inst, &instance_types, &user_types),
            inst.id
        );
    }
    for p in &spec.params {
        let _ = writeln!(
            out,
            "    {} {}() const {{ return m_{}; }}",
            cpp_type_for_type_ref(&p.ty, &user_types),
            p.id,
            p.id
        );
    }
    for attr in &spec.attrs {
        let accessor_type = cpp_accessor_type(attr, &user_types);
        if attr.repeat != RepeatKind::None || attr_is_unresolved_user(attr, &user_types) {
            let _ = writeln!(
                out,
                "    {accessor_type} {}() const {{ return m_{}.get(); }}",
                attr.id, attr.id
            );
        } else {
            let _ = writeln!(
                out,
                "    {accessor_type} {}() const {{ return m_{}; }}",
                attr.id, attr.id
            );
        }
        let primitive = resolve_primitive(&attr.ty, &user_types).unwrap_or(PrimitiveType::U1);
        if primitive == PrimitiveType::Bytes
            && matches!(attr.process, Some(Process::XorConst(_)))
            && attr.repeat == RepeatKind::None
        {
            raw_accessors.push(format!(
                "    std::string _raw_{}() const {{ return m__raw_{}; }}\n",
                attr.id, attr.id
            ));
            raw_fields.push(format!("    std::string m__raw_{};\n", attr.id));
        }
    }
    let _ = writeln!(out, "    {}_t* _root() const {{ return m__root; }}", spec.name);
    out.push_str("    kaitai::kstruct* _parent() const { return m__parent; }\n");
    for acc in &raw_accessors {
        out.push_str(acc);
    }
    out.push('\n');
    out.push_str("private:\n");
    for inst in &spec.instances {
        let _ = writeln!(out, "    bool f_{};", inst.id);
        let _ = writeln!(
            out,
            "    {} m_{};",
            cpp_instance_type(inst, &instance_types, &user_types),
            inst.id
        );
    }
    for p in &spec.params {
        let _ = writeln!(
            out,
            "    {} m_{};",
            cpp_type_for_type_ref(&p.ty, &user_types),
            p.id
        );
    }
    for attr in &spec.attrs {
        let _ = writeln!(out, "    {} m_{};", cpp_storage_type(attr, &user_types), attr.id);
    }
    let _ = writeln!(out, "    {}_t* m__root;", spec.name);
    out.push_str("    kaitai::kstruct* m__parent;\n");
    for field in &raw_fields {
        out.push_str(field);
    }
    out.push_str("};\n");
    out
}

fn validation_value_expr(target: &str, attrs: &NameSet, instances: &NameSet) -> String {
    if attrs.contains(target) || instances.contains(target) {
        format!("{target}()")
    } else {
        target.to_string()
    }
}

fn validation_value_type(
    target: &str,
    spec: &Spec,
    instance_types: &InstanceTypes,
    user_types: &UserTypes,
) -> String {
    for attr in &spec.attrs {
        if attr.id == target {
            return cpp_storage_type(attr, user_types);
        }
    }
    for inst in &spec.instances {
        if inst.id == target {
            return cpp_instance_type(inst, instance_types, user_types);
        }
    }
    "int32_t".to_string()
}

fn cpp_read_parse_instance_expr(
    inst: &Instance,
    default_endian: Endian,
    attrs: &NameSet,
    instances: &NameSet,
    user_types: &UserTypes,
) -> String {
    let InstanceBody::Parse {
        ty,
        size_expr,
        endian_override,
        encoding,
        ..
    } = &inst.body
    else {
        return "0".to_string();
    };
    let resolved = resolve_primitive(ty, user_types);
    if resolved.is_none() {
        if let TypeRef::User(user) = ty {
            let type_name = cpp_user_type_name(user);
            if user_types.contains_key(user) {
                return format!("new {type_name}(m__io, this, m__root)");
            }
            return format!("new {type_name}(m__io)");
        }
    }
    let primitive = resolved.unwrap_or(PrimitiveType::U1);
    if primitive == PrimitiveType::Bytes {
        return match size_expr {
            Some(size) => format!(
                "m__io->read_bytes({})",
                render_expr(size, attrs, instances, -1, None)
            ),
            None => "m__io->read_bytes_full()".to_string(),
        };
    }
    if primitive == PrimitiveType::Str {
        let Some(size) = size_expr else {
            return "std::string()".to_string();
        };
        let encoding = encoding.as_deref().unwrap_or("UTF-8");
        return format!(
            "kaitai::kstream::bytes_to_str(m__io->read_bytes({}), \"{encoding}\")",
            render_expr(size, attrs, instances, -1, None)
        );
    }
    format!(
        "m__io->{}()",
        read_method(primitive, endian_override.unwrap_or(default_endian))
    )
}

/// Render the `.cpp` file.
pub fn render_source(spec: &Spec) -> String {
    let instance_types = compute_instance_types(spec);
    let user_types = build_user_types(spec);
    let local_scopes = decode_embedded_scopes(spec);

    let mut attr_names: NameSet = spec.attrs.iter().map(|a| a.id.clone()).collect();
    for p in &spec.params {
        attr_names.insert(p.id.clone());
    }
    let no_instances = NameSet::new();

    let mut out = String::new();
    out.push_str(GENERATED_BANNER);
    out.push('\n');
    let _ = writeln!(out, "#include \"{}.h\"", spec.name);
    if !spec.validations.is_empty() {
        out.push_str("#include \"kaitai/exceptions.h\"\n");
    }
    out.push('\n');

    let _ = writeln!(
        out,
        "{}_t::{}_t({}) : kaitai::kstruct(p__io) {{",
        spec.name,
        spec.name,
        ctor_param_decl(spec, &user_types, false)
    );
    out.push_str("    m__parent = p__parent;\n");
    out.push_str("    m__root = p__root ? p__root : this;\n");
    for p in &spec.params {
        let _ = writeln!(out, "    m_{} = p_{};", p.id, p.id);
    }
    for inst in &spec.instances {
        let _ = writeln!(out, "    f_{} = false;", inst.id);
    }
    for attr in &spec.attrs {
        if attr.repeat != RepeatKind::None || attr_is_unresolved_user(attr, &user_types) {
            let _ = writeln!(out, "    m_{} = nullptr;", attr.id);
        }
    }
    out.push_str("    _read();\n");
    out.push_str("}\n\n");

    let _ = writeln!(out, "void {}_t::_read() {{", spec.name);
    for attr in &spec.attrs {
        if let Some(if_expr) = &attr.if_expr {
            let cond = render_expr(if_expr, &attr_names, &no_instances, -1, None);
            let _ = writeln!(out, "    if ({cond}) {{");
        }
        let ind = if attr.if_expr.is_some() { "        " } else { "    " };
        let nested_ind = if attr.if_expr.is_some() {
            "            "
        } else {
            "        "
        };
        if attr.repeat == RepeatKind::None {
            if attr.switch_on.is_some() {
                if can_render_native_switch(attr) {
                    let _ = writeln!(
                        out,
                        "{ind}switch ({}) {{",
                        render_expr(
                            attr.switch_on.as_ref().expect("switch attr"),
                            &attr_names,
                            &no_instances,
                            -1,
                            None
                        )
                    );
                    let mut has_else = false;
                    for case in &attr.switch_cases {
                        let case_primitive =
                            resolve_primitive(&case.ty, &user_types).unwrap_or(PrimitiveType::U1);
                        match &case.match_expr {
                            None => {
                                let _ = writeln!(out, "{ind}default: {{");
                                has_else = true;
                            }
                            Some(Expr::Int(value)) => {
                                let _ = writeln!(out, "{ind}case {value}: {{");
                            }
                            Some(_) => {
                                let _ = writeln!(out, "{ind}default: {{");
                                has_else = true;
                            }
                        }
                        let _ = writeln!(
                            out,
                            "{nested_ind}m_{} = {};",
                            attr.id,
                            cpp_read_primitive_expr(
                                case_primitive,
                                attr.endian_override,
                                spec.default_endian
                            )
                        );
                        let _ = writeln!(out, "{nested_ind}break;");
                        let _ = writeln!(out, "{ind}}}");
                    }
                    if !has_else {
                        let _ = writeln!(out, "{ind}default: {{");
                        let _ = writeln!(
                            out,
                            "{nested_ind}throw std::runtime_error(\"switch-on has no matching case\");"
                        );
                        let _ = writeln!(out, "{ind}}}");
                    }
                    let _ = writeln!(out, "{ind}}}");
                } else {
                    let _ = writeln!(
                        out,
                        "{ind}m_{} = {};",
                        attr.id,
                        read_switch_expr(
                            attr,
                            spec.default_endian,
                            &attr_names,
                            &no_instances,
                            &user_types
                        )
                    );
                }
            } else {
                let primitive =
                    resolve_primitive(&attr.ty, &user_types).unwrap_or(PrimitiveType::U1);
                if let (PrimitiveType::Bytes, Some(Process::XorConst(key))) =
                    (primitive, attr.process)
                {
                    let raw_read = match &attr.size_expr {
                        Some(size) => format!(
                            "m__io->read_bytes({})",
                            render_expr(size, &attr_names, &no_instances, -1, None)
                        ),
                        None => "m__io->read_bytes_full()".to_string(),
                    };
                    let _ = writeln!(out, "{ind}m__raw_{} = {raw_read};", attr.id);
                    let _ = writeln!(
                        out,
                        "{ind}m_{} = kaitai::kstream::process_xor_one(m__raw_{}, {key});",
                        attr.id, attr.id
                    );
                } else {
                    let _ = writeln!(
                        out,
                        "{ind}m_{} = {};",
                        attr.id,
                        read_expr(
                            attr,
                            spec.default_endian,
                            &attr_names,
                            &no_instances,
                            &user_types
                        )
                    );
                }
            }
        } else {
            let repeat_elem = cpp_repeat_element_type(attr, &user_types);
            let _ = writeln!(
                out,
                "{ind}m_{} = std::unique_ptr<std::vector<{repeat_elem}>>(new std::vector<{repeat_elem}>());",
                attr.id
            );
            match attr.repeat {
                RepeatKind::Eos => {
                    let unresolved_user = attr_is_unresolved_user(attr, &user_types);
                    if unresolved_user {
                        let _ = writeln!(out, "{ind}{{");
                        let _ = writeln!(out, "{nested_ind}int i = 0;");
                        let _ = writeln!(out, "{nested_ind}while (!m__io->is_eof()) {{");
                        let _ = writeln!(
                            out,
                            "{nested_ind}    m_{}->push_back(std::move({}));",
                            attr.id,
                            read_expr(
                                attr,
                                spec.default_endian,
                                &attr_names,
                                &no_instances,
                                &user_types
                            )
                        );
                        let _ = writeln!(out, "{nested_ind}    i++;");
                        let _ = writeln!(out, "{nested_ind}}}");
                        let _ = writeln!(out, "{ind}}}");
                    } else {
                        let _ = writeln!(out, "{ind}while (!m__io->is_eof()) {{");
                        let read = if attr.switch_on.is_some() {
                            read_switch_expr(
                                attr,
                                spec.default_endian,
                                &attr_names,
                                &no_instances,
                                &user_types,
                            )
                        } else {
                            read_expr(
                                attr,
                                spec.default_endian,
                                &attr_names,
                                &no_instances,
                                &user_types,
                            )
                        };
                        let _ = writeln!(out, "{nested_ind}m_{}->push_back({read});", attr.id);
                        let _ = writeln!(out, "{ind}}}");
                    }
                }
                RepeatKind::Expr => {
                    let _ = writeln!(
                        out,
                        "{ind}const int l_{} = {};",
                        attr.id,
                        render_expr(
                            attr.repeat_expr.as_ref().expect("repeat expr"),
                            &attr_names,
                            &no_instances,
                            -1,
                            None
                        )
                    );
                    let _ = writeln!(out, "{ind}for (int i = 0; i < l_{}; i++) {{", attr.id);
                    let read = if attr.switch_on.is_some() {
                        read_switch_expr(
                            attr,
                            spec.default_endian,
                            &attr_names,
                            &no_instances,
                            &user_types,
                        )
                    } else {
                        read_expr(
                            attr,
                            spec.default_endian,
                            &attr_names,
                            &no_instances,
                            &user_types,
                        )
                    };
                    let _ = writeln!(
                        out,
                        "{nested_ind}m_{}->push_back(std::move({read}));",
                        attr.id
                    );
                    let _ = writeln!(out, "{ind}}}");
                }
                _ => {
                    let _ = writeln!(out, "{ind}do {{");
                    let read = if attr.switch_on.is_some() {
                        read_switch_expr(
                            attr,
                            spec.default_endian,
                            &attr_names,
                            &no_instances,
                            &user_types,
                        )
                    } else {
                        read_expr(
                            attr,
                            spec.default_endian,
                            &attr_names,
                            &no_instances,
                            &user_types,
                        )
                    };
                    let _ = writeln!(out, "{nested_ind}auto repeat_item = {read};");
                    let _ = writeln!(
                        out,
                        "{nested_ind}m_{}->push_back(std::move(repeat_item));",
                        attr.id
                    );
                    let _ = writeln!(
                        out,
                        "{ind}}} while (!({}));",
                        render_expr(
                            attr.repeat_expr.as_ref().expect("repeat expr"),
                            &attr_names,
                            &no_instances,
                            -1,
                            Some("repeat_item")
                        )
                    );
                }
            }
        }
        if attr.if_expr.is_some() {
            out.push_str("    }\n");
        }
    }

    let all_instance_names: NameSet = spec.instances.iter().map(|i| i.id.clone()).collect();
    let attr_index_by_id: IndexMap<&str, usize> = spec
        .attrs
        .iter()
        .enumerate()
        .map(|(i, a)| (a.id.as_str(), i))
        .collect();
    for validation in &spec.validations {
        let cond_expr = &validation.condition_expr;
        let specialized = specialize_equality(cond_expr, &validation.target)
            .filter(|_| attr_index_by_id.contains_key(validation.target.as_str()));
        if let Some(expected) = specialized {
            let attr_index = attr_index_by_id[validation.target.as_str()];
            let val_type =
                validation_value_type(&validation.target, spec, &instance_types, &user_types);
            let _ = writeln!(out, "    if (!(m_{} == {expected})) {{", validation.target);
            let _ = writeln!(
                out,
                "        throw kaitai::validation_not_equal_error<{val_type}>({expected}, m_{}, m__io, std::string(\"/seq/{attr_index}\"));",
                validation.target
            );
            out.push_str("    }\n");
        } else {
            let cond = render_expr(cond_expr, &attr_names, &all_instance_names, -1, None);
            let val_expr =
                validation_value_expr(&validation.target, &attr_names, &all_instance_names);
            let val_type =
                validation_value_type(&validation.target, spec, &instance_types, &user_types);
            let _ = writeln!(out, "    if (!({cond})) {{");
            let _ = writeln!(
                out,
                "        throw kaitai::validation_expr_error<{val_type}>({val_expr}, m__io, \"/valid/{}\");",
                validation.target
            );
            out.push_str("    }\n");
        }
    }
    out.push_str("}\n\n");

    let _ = writeln!(out, "{}_t::~{}_t() {{", spec.name, spec.name);
    out.push_str("    _clean_up();\n");
    out.push_str("}\n\n");

    let _ = writeln!(out, "void {}_t::_clean_up() {{", spec.name);
    for inst in &spec.instances {
        if !inst.is_parse() {
            continue;
        }
        let _ = writeln!(out, "    if (f_{}) {{", inst.id);
        out.push_str("    }\n");
    }
    out.push_str("}\n");

    if !local_scopes.is_empty() {
        let root_children = direct_child_scopes(&local_scopes, "");
        if let Some(first) = root_children.first() {
            if local_scopes[first].enums.is_empty() {
                out.push('\n');
            }
        }
        for child in &root_children {
            emit_nested_class_source(&mut out, &spec.name, child, &local_scopes, &user_types);
        }
    }

    let mut known_instances = NameSet::new();
    for inst in &spec.instances {
        out.push('\n');
        let _ = writeln!(
            out,
            "{} {}_t::{}() {{",
            cpp_instance_type(inst, &instance_types, &user_types),
            spec.name,
            inst.id
        );
        let _ = writeln!(out, "    if (f_{})", inst.id);
        let _ = writeln!(out, "        return m_{};", inst.id);
        let _ = writeln!(out, "    f_{} = true;", inst.id);
        match &inst.body {
            InstanceBody::Parse { pos_expr, .. } => {
                out.push_str("    std::streampos _pos = m__io->pos();\n");
                if let Some(pos) = pos_expr {
                    let _ = writeln!(
                        out,
                        "    m__io->seek({});",
                        render_expr(pos, &attr_names, &known_instances, -1, None)
                    );
                }
                let _ = writeln!(
                    out,
                    "    m_{} = {};",
                    inst.id,
                    cpp_read_parse_instance_expr(
                        inst,
                        spec.default_endian,
                        &attr_names,
                        &known_instances,
                        &user_types
                    )
                );
                out.push_str("    m__io->seek(_pos);\n");
            }
            InstanceBody::Value { expr, .. } => {
                let mut rendered = render_expr(expr, &attr_names, &known_instances, -1, None);
                if instance_types.get(&inst.id) == Some(&ExprType::Bool) {
                    rendered = format!(" {rendered} ");
                }
                let _ = writeln!(out, "    m_{} = {rendered};", inst.id);
            }
        }
        let _ = writeln!(out, "    return m_{};", inst.id);
        out.push_str("}\n");
        known_instances.insert(inst.id.clone());
    }

    out
}

/// Equality-to-literal fast path: `target == K` or `K == target` with an
/// integer literal yields the expected value.
fn specialize_equality(cond: &Expr, target: &str) -> Option<i64> {
    let Expr::Binary { op, lhs, rhs } = cond else {
        return None;
    };
    if op != "==" {
        return None;
    }
    let is_target = |e: &Expr| matches!(e, Expr::Name(name) if name == target);
    match (&**lhs, &**rhs) {
        (lhs_e, Expr::Int(value)) if is_target(lhs_e) => Some(*value),
        (Expr::Int(value), rhs_e) if is_target(rhs_e) => Some(*value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> NameSet {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn precedence_avoids_redundant_parens() {
        let expr = Expr::binary(
            "-",
            Expr::binary(
                "+",
                Expr::name("a"),
                Expr::binary("*", Expr::name("b"), Expr::int(3)),
            ),
            Expr::int(2),
        );
        let rendered = render_expr(&expr, &names(&["a", "b"]), &NameSet::new(), -1, None);
        assert_eq!(rendered, "(a() + b() * 3) - 2");
    }

    #[test]
    fn logical_operands_always_wrapped() {
        let expr = Expr::binary(
            "and",
            Expr::binary(">", Expr::name("a"), Expr::name("b")),
            Expr::binary("==", Expr::name("lit"), Expr::int(7)),
        );
        let rendered = render_expr(&expr, &names(&["a", "b"]), &names(&["lit"]), -1, None);
        assert_eq!(rendered, "((a() > b()) && (lit() == 7))");
    }

    #[test]
    fn special_unaries_render_casts_and_member_selects() {
        let cast = Expr::unary("__cast__:header", Expr::name("raw"));
        let rendered = render_expr(&cast, &names(&["raw"]), &NameSet::new(), -1, None);
        assert_eq!(rendered, "static_cast<header_t*>(raw())");

        let select = Expr::unary("__attr__:len", Expr::unary("__cast__:header", Expr::name("raw")));
        let rendered = render_expr(&select, &names(&["raw"]), &NameSet::new(), -1, None);
        assert_eq!(rendered, "static_cast<header_t*>(raw())->len()");
    }

    #[test]
    fn repeat_item_substitutes_underscore() {
        let expr = Expr::binary("==", Expr::name("_"), Expr::int(255));
        let rendered = render_expr(&expr, &NameSet::new(), &NameSet::new(), -1, Some("repeat_item"));
        assert_eq!(rendered, "repeat_item == 255");
    }

    #[test]
    fn equality_specialization_accepts_both_sides() {
        let lhs_form = Expr::binary("==", Expr::name("one"), Expr::int(85));
        let rhs_form = Expr::binary("==", Expr::int(85), Expr::name("one"));
        assert_eq!(specialize_equality(&lhs_form, "one"), Some(85));
        assert_eq!(specialize_equality(&rhs_form, "one"), Some(85));
        let other = Expr::binary("!=", Expr::name("one"), Expr::int(85));
        assert_eq!(specialize_equality(&other, "one"), None);
        let not_target = Expr::binary("==", Expr::name("two"), Expr::int(85));
        assert_eq!(specialize_equality(&not_target, "one"), None);
    }
}
