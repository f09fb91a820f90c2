//! Nested scopes embedded in type references.
//!
//! A typedef whose user reference starts with `__scope_b64__:` carries a
//! base64-encoded KSIR1 document; the emitters decode these on demand
//! and render them as nested classes. Scope names are `::`-joined paths
//! relative to the root spec.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ksc_ir::{parse_unvalidated, Spec, TypeRef, SCOPE_MARKER};

/// Base64 payload of an embedded scope reference, if this is one.
pub fn embedded_scope_payload(ty: &TypeRef) -> Option<&str> {
    let payload = ty.as_user()?.strip_prefix(SCOPE_MARKER)?;
    (!payload.is_empty()).then_some(payload)
}

/// Decode every embedded scope of a spec, keyed by scope path.
/// Undecodable payloads are skipped; the supportability gate has no rule
/// for them, and a missing scope falls back to a plain user type name.
pub fn decode_embedded_scopes(spec: &Spec) -> BTreeMap<String, Spec> {
    let mut scopes = BTreeMap::new();
    for t in &spec.types {
        let Some(payload) = embedded_scope_payload(&t.ty) else {
            continue;
        };
        let Ok(decoded) = STANDARD.decode(payload.as_bytes()) else {
            continue;
        };
        let Ok(text) = String::from_utf8(decoded) else {
            continue;
        };
        let Ok(scope_spec) = parse_unvalidated(&text) else {
            continue;
        };
        scopes.insert(t.name.clone(), scope_spec);
    }
    scopes
}

pub fn split_scope_path(name: &str) -> Vec<&str> {
    if name.is_empty() {
        return Vec::new();
    }
    name.split("::").collect()
}

pub fn last_scope_segment(name: &str) -> &str {
    split_scope_path(name).last().copied().unwrap_or(name)
}

/// Enclosing scope path, empty for top-level scopes.
pub fn parent_scope_name(name: &str) -> String {
    let parts = split_scope_path(name);
    if parts.len() <= 1 {
        return String::new();
    }
    parts[..parts.len() - 1].join("::")
}

/// Scopes directly nested in `parent`, in lexicographic order.
pub fn direct_child_scopes(scopes: &BTreeMap<String, Spec>, parent: &str) -> Vec<String> {
    scopes
        .keys()
        .filter(|name| parent_scope_name(name) == parent)
        .cloned()
        .collect()
}

/// Find the scope a user reference points at: exact path, path relative
/// to the root name, or `::`-suffix match.
pub fn resolve_scope_ref(
    reference: &str,
    root_name: &str,
    scopes: &BTreeMap<String, Spec>,
) -> Option<String> {
    if scopes.contains_key(reference) {
        return Some(reference.to_string());
    }
    if let Some(rel) = reference.strip_prefix(&format!("{root_name}::")) {
        if scopes.contains_key(rel) {
            return Some(rel.to_string());
        }
    }
    for scope_name in scopes.keys() {
        if scope_name == reference {
            return Some(scope_name.clone());
        }
        let suffix_match = scope_name
            .strip_suffix(reference)
            .and_then(|head| head.strip_suffix(':'))
            .is_some();
        if suffix_match {
            return Some(scope_name.clone());
        }
    }
    None
}

pub fn scope_has_enum_name(scope_spec: &Spec, enum_name: &str) -> bool {
    scope_spec
        .enums
        .iter()
        .any(|e| enum_short_name(&e.name) == enum_short_name(enum_name))
}

/// Walk enclosing scopes until one declares the referenced enum.
pub fn resolve_enum_owner_scope(
    current_scope: &str,
    enum_name: &str,
    scopes: &BTreeMap<String, Spec>,
) -> Option<String> {
    let mut scope = current_scope.to_string();
    loop {
        if let Some(spec) = scopes.get(&scope) {
            if scope_has_enum_name(spec, enum_name) {
                return Some(scope);
            }
        }
        if scope.is_empty() {
            return None;
        }
        scope = parent_scope_name(&scope);
    }
}

pub fn enum_short_name(enum_name: &str) -> &str {
    match enum_name.rfind("::") {
        Some(pos) => &enum_name[pos + 2..],
        None => enum_name,
    }
}
