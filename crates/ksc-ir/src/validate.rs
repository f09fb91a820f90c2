//! Structural validation of a spec, independent of any backend.
//!
//! Checks stop at the first failure and report a human-readable,
//! path-rooted message. Backend-specific restrictions live in the
//! supportability gate, not here.

use std::collections::{HashMap, HashSet};

use crate::error::{IrError, Result};
use crate::spec::{
    enum_name_matches, import_stem, user_type_matches_import, PrimitiveType, RepeatKind, Spec,
    TypeRef, SCOPE_MARKER,
};

pub fn validate(spec: &Spec) -> Result<()> {
    if spec.name.is_empty() {
        return Err(IrError::Validate("spec.name is required".into()));
    }

    let mut declared_types: HashSet<&str> = HashSet::new();
    declared_types.insert(&spec.name);
    let mut alias_edges: HashMap<&str, &str> = HashMap::new();

    for t in &spec.types {
        if t.name.is_empty() {
            return Err(IrError::Validate("type.name is required".into()));
        }
        if !declared_types.insert(&t.name) {
            return Err(IrError::Validate(format!(
                "duplicate type declaration: {}",
                t.name
            )));
        }
        if let TypeRef::User(target) = &t.ty {
            if target.is_empty() {
                return Err(IrError::Validate(
                    "user type reference requires user_type".into(),
                ));
            }
            // Embedded scope payloads are opaque, not alias targets.
            if !target.starts_with(SCOPE_MARKER) {
                alias_edges.insert(&t.name, target);
            }
        }
    }

    let mut enum_names: HashSet<&str> = HashSet::new();
    for e in &spec.enums {
        if e.name.is_empty() {
            return Err(IrError::Validate("enum.name is required".into()));
        }
        if !enum_names.insert(&e.name) {
            return Err(IrError::Validate(format!(
                "duplicate enum declaration: {}",
                e.name
            )));
        }
        if e.values.is_empty() {
            return Err(IrError::Validate(format!(
                "enum.values must not be empty: {}",
                e.name
            )));
        }
        let mut value_names: HashSet<&str> = HashSet::new();
        for value in &e.values {
            if value.name.is_empty() {
                return Err(IrError::Validate(format!(
                    "enum value name is required in enum: {}",
                    e.name
                )));
            }
            if !value_names.insert(&value.name) {
                return Err(IrError::Validate(format!(
                    "duplicate enum value name in enum {}: {}",
                    e.name, value.name
                )));
            }
        }
    }

    let mut attr_ids: HashSet<&str> = HashSet::new();
    for attr in &spec.attrs {
        if attr.id.is_empty() {
            return Err(IrError::Validate("attr.id is required".into()));
        }
        if !attr_ids.insert(&attr.id) {
            return Err(IrError::Validate(format!(
                "duplicate attr declaration: {}",
                attr.id
            )));
        }
        if let TypeRef::User(user) = &attr.ty {
            if user.is_empty() {
                return Err(IrError::Validate(
                    "attr user type reference requires user_type".into(),
                ));
            }
            let from_import = spec
                .imports
                .iter()
                .any(|imp| user_type_matches_import(user, import_stem(imp)));
            if !declared_types.contains(user.as_str()) && !from_import {
                return Err(IrError::UnknownUserType {
                    spec_name: spec.name.clone(),
                    type_name: user.clone(),
                });
            }
        }
        if attr.encoding.is_some()
            && matches!(attr.ty, TypeRef::Primitive(p) if p != PrimitiveType::Str)
        {
            return Err(IrError::Validate(
                "attr.encoding is only allowed for primitive str type".into(),
            ));
        }
        match attr.repeat {
            RepeatKind::Expr if attr.repeat_expr.is_none() => {
                return Err(IrError::Validate(
                    "attr.repeat_expr is required when repeat=expr".into(),
                ));
            }
            RepeatKind::Until if attr.repeat_expr.is_none() => {
                return Err(IrError::Validate(
                    "attr.repeat_expr is required when repeat=until".into(),
                ));
            }
            RepeatKind::None | RepeatKind::Eos if attr.repeat_expr.is_some() => {
                return Err(IrError::Validate(
                    "attr.repeat_expr is only allowed when repeat=expr/until".into(),
                ));
            }
            _ => {}
        }
        if !attr.switch_cases.is_empty() && attr.switch_on.is_none() {
            return Err(IrError::Validate(
                "attr.switch_cases requires attr.switch_on".into(),
            ));
        }
        if attr.switch_on.is_some() && attr.switch_cases.is_empty() {
            return Err(IrError::Validate(
                "attr.switch_on requires at least one switch case".into(),
            ));
        }
        let mut has_else = false;
        for case in &attr.switch_cases {
            if case.match_expr.is_none() {
                if has_else {
                    return Err(IrError::Validate(
                        "attr.switch_cases has duplicate switch else case".into(),
                    ));
                }
                has_else = true;
            }
        }
        if let Some(enum_name) = &attr.enum_name {
            let integer_backed =
                matches!(attr.ty, TypeRef::Primitive(p) if p.is_integer());
            if !integer_backed {
                return Err(IrError::Validate(
                    "attr.enum_name requires primitive integer type".into(),
                ));
            }
            let known = enum_names
                .iter()
                .any(|declared| enum_name_matches(declared, enum_name));
            if !known {
                return Err(IrError::Validate(format!(
                    "attr references unknown enum: {enum_name}"
                )));
            }
        }
    }

    let mut instance_ids: HashSet<&str> = HashSet::new();
    for inst in &spec.instances {
        if inst.id.is_empty() {
            return Err(IrError::Validate("instance.id is required".into()));
        }
        if !instance_ids.insert(&inst.id) {
            return Err(IrError::Validate(format!(
                "duplicate instance declaration: {}",
                inst.id
            )));
        }
    }

    for validation in &spec.validations {
        if validation.target.is_empty() {
            return Err(IrError::Validate("validation.target is required".into()));
        }
    }

    detect_alias_cycles(&declared_types, &alias_edges)
}

#[derive(Clone, Copy, PartialEq)]
enum VisitState {
    Visiting,
    Visited,
}

fn detect_alias_cycles(
    declared_types: &HashSet<&str>,
    alias_edges: &HashMap<&str, &str>,
) -> Result<()> {
    let mut states: HashMap<&str, VisitState> = HashMap::new();
    // HashMap iteration order is arbitrary, but any cycle is reported
    // through a deterministic message for its entry node.
    let mut names: Vec<&str> = alias_edges.keys().copied().collect();
    names.sort_unstable();
    for name in names {
        visit(name, declared_types, alias_edges, &mut states)?;
    }
    Ok(())
}

fn visit<'a>(
    name: &'a str,
    declared_types: &HashSet<&str>,
    alias_edges: &HashMap<&'a str, &'a str>,
    states: &mut HashMap<&'a str, VisitState>,
) -> Result<()> {
    if !alias_edges.contains_key(name) {
        return Ok(());
    }
    match states.get(name) {
        Some(VisitState::Visiting) => {
            return Err(IrError::Validate(format!(
                "type alias cycle detected at: {name}"
            )));
        }
        Some(VisitState::Visited) => return Ok(()),
        None => {}
    }
    states.insert(name, VisitState::Visiting);

    let target = alias_edges[name];
    if !declared_types.contains(target) {
        return Err(IrError::Validate(format!(
            "type \"{name}\" references unknown user type: {target}"
        )));
    }
    visit(target, declared_types, alias_edges, states)?;

    states.insert(name, VisitState::Visited);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use crate::spec::{Attr, EnumDef, EnumValue, TypeDef};

    fn u1_attr(id: &str) -> Attr {
        Attr::new(id, TypeRef::Primitive(PrimitiveType::U1))
    }

    #[test]
    fn empty_name_rejected() {
        let spec = Spec::default();
        assert_eq!(
            validate(&spec),
            Err(IrError::Validate("spec.name is required".into()))
        );
    }

    #[test]
    fn duplicate_attr_rejected() {
        let mut spec = Spec::new("x");
        spec.attrs.push(u1_attr("a"));
        spec.attrs.push(u1_attr("a"));
        assert!(matches!(validate(&spec), Err(IrError::Validate(m)) if m.contains("duplicate attr")));
    }

    #[test]
    fn unknown_user_type_is_structured() {
        let mut spec = Spec::new("x");
        spec.attrs.push(Attr::new("a", TypeRef::user("mystery")));
        assert_eq!(
            validate(&spec),
            Err(IrError::UnknownUserType {
                spec_name: "x".into(),
                type_name: "mystery".into()
            })
        );
    }

    #[test]
    fn encoding_restricted_to_str() {
        let mut spec = Spec::new("x");
        let mut attr = u1_attr("a");
        attr.encoding = Some("ASCII".into());
        spec.attrs.push(attr);
        assert!(matches!(validate(&spec), Err(IrError::Validate(m)) if m.contains("encoding")));
    }

    #[test]
    fn repeat_expr_pairing_enforced() {
        let mut spec = Spec::new("x");
        let mut attr = u1_attr("a");
        attr.repeat = RepeatKind::Expr;
        spec.attrs.push(attr);
        assert!(matches!(validate(&spec), Err(IrError::Validate(m)) if m.contains("repeat=expr")));

        let mut spec = Spec::new("x");
        let mut attr = u1_attr("a");
        attr.repeat_expr = Some(Expr::int(2));
        spec.attrs.push(attr);
        assert!(matches!(validate(&spec), Err(IrError::Validate(m)) if m.contains("repeat=expr/until")));
    }

    #[test]
    fn enum_reference_resolves_by_suffix() {
        let mut spec = Spec::new("x");
        spec.enums.push(EnumDef {
            name: "body::animal".into(),
            values: vec![EnumValue {
                value: 1,
                name: "cat".into(),
            }],
        });
        let mut attr = u1_attr("pet");
        attr.enum_name = Some("animal".into());
        spec.attrs.push(attr);
        assert_eq!(validate(&spec), Ok(()));

        spec.attrs[0].enum_name = Some("plant".into());
        assert!(matches!(validate(&spec), Err(IrError::Validate(m)) if m.contains("unknown enum")));
    }

    #[test]
    fn alias_cycle_detected() {
        let mut spec = Spec::new("x");
        spec.types.push(TypeDef {
            name: "a".into(),
            ty: TypeRef::user("b"),
        });
        spec.types.push(TypeDef {
            name: "b".into(),
            ty: TypeRef::user("a"),
        });
        assert!(matches!(validate(&spec), Err(IrError::Validate(m)) if m.contains("type alias cycle")));
    }
}
