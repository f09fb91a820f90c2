//! Backend supportability gate.
//!
//! A closed, deterministic rule set applied before any emitter runs.
//! The rules are shared by every target so each restriction is stated
//! exactly once; diagnostics carry the `not yet supported: ` prefix via
//! [`CodegenError::NotYetSupported`].

use std::collections::HashSet;

use ksc_ir::{
    enum_name_matches, special_unary_payload, Expr, InstanceBody, PrimitiveType, Spec, TypeRef,
    ATTR_PREFIX, CAST_PREFIX,
};

use crate::resolve::{build_user_types, resolve_primitive};
use crate::{CodegenError, Result};

const BINARY_OPS: [&str; 21] = [
    "+", "-", "*", "/", "%", "==", "!=", ">", ">=", "<", "<=", "&&", "||", "and", "or", "&", "|",
    "^", "xor", "<<", ">>",
];

/// Reject any construct the current emitters cannot render.
pub fn check(spec: &Spec) -> Result<()> {
    let user_types = build_user_types(spec);

    for attr in &spec.attrs {
        let resolved = resolve_primitive(&attr.ty, &user_types);
        let unresolved_user = resolved.is_none() && matches!(attr.ty, TypeRef::User(_));
        if resolved.is_none() && !unresolved_user {
            return not_supported("attr type must resolve to primitive type");
        }
        if unresolved_user {
            if attr.encoding.is_some() || attr.process.is_some() || attr.enum_name.is_some() {
                return not_supported("complex user-type attrs in this migration slice");
            }
            continue;
        }
        if attr.encoding.is_some() && resolved != Some(PrimitiveType::Str) {
            return not_supported("encoding outside str attrs");
        }
    }

    let mut declared_enums: Vec<&str> = Vec::new();
    for e in &spec.enums {
        if e.name.is_empty() {
            return not_supported("empty enum name");
        }
        declared_enums.push(&e.name);
    }

    for attr in &spec.attrs {
        let resolved = resolve_primitive(&attr.ty, &user_types);
        if resolved.is_none() {
            continue;
        }
        if attr.switch_on.is_some() {
            let mut switch_case_type: Option<PrimitiveType> = None;
            let mut has_else = false;
            for case in &attr.switch_cases {
                let Some(case_primitive) = resolve_primitive(&case.ty, &user_types) else {
                    return not_supported("switch-on case type must resolve to primitive type");
                };
                let expected = *switch_case_type.get_or_insert(case_primitive);
                if expected != case_primitive {
                    return not_supported("switch-on cases must share one primitive type");
                }
                if case.match_expr.is_none() {
                    if has_else {
                        return not_supported("malformed switch cases (duplicate else)");
                    }
                    has_else = true;
                }
            }
        }
        if let Some(enum_name) = &attr.enum_name {
            let known = declared_enums
                .iter()
                .any(|declared| enum_name_matches(declared, enum_name));
            if !known {
                return not_supported("attr.enum_name references unknown enum");
            }
            if !resolved.is_some_and(PrimitiveType::is_integer) {
                return not_supported("enum attrs must be integer-backed");
            }
        }
    }

    let mut known_names: HashSet<&str> = HashSet::new();
    for param in &spec.params {
        known_names.insert(&param.id);
    }
    for attr in &spec.attrs {
        known_names.insert(&attr.id);
    }

    for inst in &spec.instances {
        match &inst.body {
            InstanceBody::Value { expr, .. } => validate_expr(expr, &known_names)?,
            InstanceBody::Parse {
                ty,
                pos_expr,
                size_expr,
                encoding,
                ..
            } => {
                let resolved = resolve_primitive(ty, &user_types);
                let unresolved_user = resolved.is_none() && matches!(ty, TypeRef::User(_));
                if resolved.is_none() && !unresolved_user {
                    return not_supported("parse instance type must resolve to primitive type");
                }
                if unresolved_user && encoding.is_some() {
                    return not_supported("encoding on user-type parse instances");
                }
                if let Some(pos) = pos_expr {
                    validate_expr(pos, &known_names)?;
                }
                if let Some(size) = size_expr {
                    validate_expr(size, &known_names)?;
                }
            }
        }
        known_names.insert(&inst.id);
    }

    for validation in &spec.validations {
        if !known_names.contains(validation.target.as_str()) {
            return not_supported(&format!(
                "validation target outside attrs/instances: {}",
                validation.target
            ));
        }
        validate_expr(&validation.condition_expr, &known_names)?;
    }

    for attr in &spec.attrs {
        for expr in [&attr.if_expr, &attr.size_expr, &attr.repeat_expr, &attr.switch_on]
            .into_iter()
            .flatten()
        {
            validate_expr(expr, &known_names)?;
        }
        for case in &attr.switch_cases {
            if let Some(match_expr) = &case.match_expr {
                validate_expr(match_expr, &known_names)?;
            }
        }
        for arg in &attr.user_type_args {
            validate_expr(arg, &known_names)?;
        }
    }

    Ok(())
}

fn validate_expr(expr: &Expr, known_names: &HashSet<&str>) -> Result<()> {
    match expr {
        Expr::Int(_) | Expr::Bool(_) => Ok(()),
        Expr::Name(text) => {
            if text != "_" && !known_names.contains(text.as_str()) {
                return not_supported(&format!(
                    "expression name reference outside attrs/instances: {text}"
                ));
            }
            Ok(())
        }
        Expr::Unary { op, operand } => {
            let allowed = matches!(op.as_str(), "-" | "!" | "not" | "~")
                || special_unary_payload(op, CAST_PREFIX).is_some()
                || special_unary_payload(op, ATTR_PREFIX).is_some();
            if !allowed {
                return not_supported(&format!("unary operator \"{op}\""));
            }
            validate_expr(operand, known_names)
        }
        Expr::Binary { op, lhs, rhs } => {
            if !BINARY_OPS.contains(&op.as_str()) {
                return not_supported(&format!("binary operator \"{op}\""));
            }
            validate_expr(lhs, known_names)?;
            validate_expr(rhs, known_names)
        }
    }
}

fn not_supported<T>(message: &str) -> Result<T> {
    Err(CodegenError::NotYetSupported(message.to_string()))
}
