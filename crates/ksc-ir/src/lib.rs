//! KSC IR - intermediate representation of a binary format description
//!
//! This crate handles:
//! - IR entities and their structural invariants
//! - The canonical `KSIR1` textual encoding (stable round-trip)
//! - Loading IR files from disk, resolving and merging imports

pub mod error;
pub mod expr;
pub mod loader;
pub mod spec;
pub mod text;
pub mod validate;

// Re-export main types
pub use error::{IrError, Result};
pub use expr::{
    compute_instance_types, normalize_op, result_type, special_unary_payload, Expr, ExprType,
    ATTR_PREFIX, CAST_PREFIX,
};
pub use loader::{load_from_file, load_with_imports};
pub use spec::{
    enum_name_matches, import_stem, user_type_matches_import, Attr, Endian, EnumDef, EnumValue,
    Instance, InstanceBody, Param, PrimitiveType, Process, RepeatKind, Spec, SwitchCase, TypeDef,
    TypeRef, Validation, SCOPE_MARKER,
};
pub use text::{deserialize, parse_expr_text, parse_unvalidated, serialize, serialize_expr};
pub use validate::validate;
