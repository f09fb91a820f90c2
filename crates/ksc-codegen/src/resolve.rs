//! Type resolution, read-method selection and identifier conversion
//! shared by the emitters.

use std::collections::HashSet;

use indexmap::IndexMap;
use ksc_ir::{Endian, PrimitiveType, Spec, TypeRef};

/// Local alias table, in declaration order.
pub type UserTypes = IndexMap<String, TypeRef>;

pub fn build_user_types(spec: &Spec) -> UserTypes {
    spec.types
        .iter()
        .map(|t| (t.name.clone(), t.ty.clone()))
        .collect()
}

/// Follow alias chains until a primitive is reached. `None` for unknown
/// names, embedded scopes and alias cycles.
pub fn resolve_primitive(ty: &TypeRef, user_types: &UserTypes) -> Option<PrimitiveType> {
    let mut cur = match ty {
        TypeRef::Primitive(p) => return Some(*p),
        TypeRef::User(name) => name.as_str(),
    };
    let mut seen: HashSet<&str> = HashSet::new();
    loop {
        if !seen.insert(cur) {
            return None;
        }
        match user_types.get(cur)? {
            TypeRef::Primitive(p) => return Some(*p),
            TypeRef::User(next) => cur = next,
        }
    }
}

/// A user reference that does not collapse to a primitive: a real user
/// type, rendered as a generated class.
pub fn is_unresolved_user_type(ty: &TypeRef, user_types: &UserTypes) -> bool {
    matches!(ty, TypeRef::User(_)) && resolve_primitive(ty, user_types).is_none()
}

/// Runtime stream method for a primitive read. Byte width, signedness
/// and endianness fully determine the name; `u1`/`s1` ignore endianness.
/// Every runtime exposes the same surface, so all emitters share this.
pub fn read_method(primitive: PrimitiveType, endian: Endian) -> &'static str {
    let be = endian == Endian::Be;
    match primitive {
        PrimitiveType::U1 => "read_u1",
        PrimitiveType::U2 => {
            if be {
                "read_u2be"
            } else {
                "read_u2le"
            }
        }
        PrimitiveType::U4 => {
            if be {
                "read_u4be"
            } else {
                "read_u4le"
            }
        }
        PrimitiveType::U8 => {
            if be {
                "read_u8be"
            } else {
                "read_u8le"
            }
        }
        PrimitiveType::S1 => "read_s1",
        PrimitiveType::S2 => {
            if be {
                "read_s2be"
            } else {
                "read_s2le"
            }
        }
        PrimitiveType::S4 => {
            if be {
                "read_s4be"
            } else {
                "read_s4le"
            }
        }
        PrimitiveType::S8 => {
            if be {
                "read_s8be"
            } else {
                "read_s8le"
            }
        }
        PrimitiveType::F4 => {
            if be {
                "read_f4be"
            } else {
                "read_f4le"
            }
        }
        PrimitiveType::F8 => {
            if be {
                "read_f8be"
            } else {
                "read_f8le"
            }
        }
        PrimitiveType::Str | PrimitiveType::Bytes => "read_u1",
    }
}

/// Upper-camel identifier for module/class names; a leading digit is
/// prefixed with `_`.
pub fn to_upper_camel(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut uppercase_next = true;
    for c in value.chars() {
        if !c.is_ascii_alphanumeric() {
            uppercase_next = true;
            continue;
        }
        if uppercase_next {
            out.push(c.to_ascii_uppercase());
            uppercase_next = false;
        } else {
            out.push(c);
        }
    }
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksc_ir::TypeDef;

    #[test]
    fn alias_chains_resolve() {
        let mut spec = Spec::new("x");
        spec.types.push(TypeDef {
            name: "a".into(),
            ty: TypeRef::user("b"),
        });
        spec.types.push(TypeDef {
            name: "b".into(),
            ty: TypeRef::Primitive(PrimitiveType::U2),
        });
        let user_types = build_user_types(&spec);
        assert_eq!(
            resolve_primitive(&TypeRef::user("a"), &user_types),
            Some(PrimitiveType::U2)
        );
        assert!(!is_unresolved_user_type(&TypeRef::user("a"), &user_types));
        assert!(is_unresolved_user_type(&TypeRef::user("zzz"), &user_types));
    }

    #[test]
    fn alias_cycles_do_not_loop() {
        let mut spec = Spec::new("x");
        spec.types.push(TypeDef {
            name: "a".into(),
            ty: TypeRef::user("b"),
        });
        spec.types.push(TypeDef {
            name: "b".into(),
            ty: TypeRef::user("a"),
        });
        let user_types = build_user_types(&spec);
        assert_eq!(resolve_primitive(&TypeRef::user("a"), &user_types), None);
    }

    #[test]
    fn camel_conversion() {
        assert_eq!(to_upper_camel("hello_world"), "HelloWorld");
        assert_eq!(to_upper_camel("script_target_smoke"), "ScriptTargetSmoke");
        assert_eq!(to_upper_camel("7zip"), "_7zip");
    }
}
