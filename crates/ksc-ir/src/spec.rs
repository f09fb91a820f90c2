//! IR entities: the format description a compile invocation operates on.

use serde::{Deserialize, Serialize};

use crate::expr::Expr;

/// Marker prefix on a user type reference whose payload is a
/// base64-encoded KSIR1 document describing a nested scope.
pub const SCOPE_MARKER: &str = "__scope_b64__:";

/// Byte order of multi-byte primitive reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Endian {
    #[default]
    Le,
    Be,
}

impl Endian {
    pub fn as_str(self) -> &'static str {
        match self {
            Endian::Le => "le",
            Endian::Be => "be",
        }
    }

    pub fn parse(text: &str) -> Option<Endian> {
        match text {
            "le" => Some(Endian::Le),
            "be" => Some(Endian::Be),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrimitiveType {
    U1,
    U2,
    U4,
    U8,
    S1,
    S2,
    S4,
    S8,
    F4,
    F8,
    Str,
    Bytes,
}

impl PrimitiveType {
    pub fn as_str(self) -> &'static str {
        match self {
            PrimitiveType::U1 => "u1",
            PrimitiveType::U2 => "u2",
            PrimitiveType::U4 => "u4",
            PrimitiveType::U8 => "u8",
            PrimitiveType::S1 => "s1",
            PrimitiveType::S2 => "s2",
            PrimitiveType::S4 => "s4",
            PrimitiveType::S8 => "s8",
            PrimitiveType::F4 => "f4",
            PrimitiveType::F8 => "f8",
            PrimitiveType::Str => "str",
            PrimitiveType::Bytes => "bytes",
        }
    }

    pub fn parse(text: &str) -> Option<PrimitiveType> {
        match text {
            "u1" => Some(PrimitiveType::U1),
            "u2" => Some(PrimitiveType::U2),
            "u4" => Some(PrimitiveType::U4),
            "u8" => Some(PrimitiveType::U8),
            "s1" => Some(PrimitiveType::S1),
            "s2" => Some(PrimitiveType::S2),
            "s4" => Some(PrimitiveType::S4),
            "s8" => Some(PrimitiveType::S8),
            "f4" => Some(PrimitiveType::F4),
            "f8" => Some(PrimitiveType::F8),
            "str" => Some(PrimitiveType::Str),
            "bytes" => Some(PrimitiveType::Bytes),
            _ => None,
        }
    }

    /// Integer-backed primitives are the only legal carriers for enums.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            PrimitiveType::U1
                | PrimitiveType::U2
                | PrimitiveType::U4
                | PrimitiveType::U8
                | PrimitiveType::S1
                | PrimitiveType::S2
                | PrimitiveType::S4
                | PrimitiveType::S8
        )
    }
}

/// Reference to either a primitive or a declared/imported user type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeRef {
    Primitive(PrimitiveType),
    User(String),
}

impl TypeRef {
    pub fn user(name: impl Into<String>) -> TypeRef {
        TypeRef::User(name.into())
    }

    pub fn as_user(&self) -> Option<&str> {
        match self {
            TypeRef::User(name) => Some(name),
            TypeRef::Primitive(_) => None,
        }
    }
}

/// Local type alias, or an embedded nested scope when the referenced
/// user type carries the [`SCOPE_MARKER`] prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: String,
    pub ty: TypeRef,
}

/// Constructor parameter of the generated root type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub id: String,
    pub ty: TypeRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RepeatKind {
    #[default]
    None,
    Eos,
    Expr,
    Until,
}

impl RepeatKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RepeatKind::None => "none",
            RepeatKind::Eos => "eos",
            RepeatKind::Expr => "expr",
            RepeatKind::Until => "until",
        }
    }

    pub fn parse(text: &str) -> Option<RepeatKind> {
        match text {
            "none" => Some(RepeatKind::None),
            "eos" => Some(RepeatKind::Eos),
            "expr" => Some(RepeatKind::Expr),
            "until" => Some(RepeatKind::Until),
            _ => None,
        }
    }
}

/// One arm of a type-switched attribute; `match_expr` absent marks the
/// else branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    pub match_expr: Option<Expr>,
    pub ty: TypeRef,
}

/// Post-read processing applied to raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Process {
    /// XOR every byte with a constant key.
    XorConst(u8),
}

/// Ordered field of a spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attr {
    pub id: String,
    pub ty: TypeRef,
    pub endian_override: Option<Endian>,
    pub size_expr: Option<Expr>,
    pub enum_name: Option<String>,
    pub encoding: Option<String>,
    pub if_expr: Option<Expr>,
    pub repeat: RepeatKind,
    pub repeat_expr: Option<Expr>,
    pub switch_on: Option<Expr>,
    pub switch_cases: Vec<SwitchCase>,
    pub process: Option<Process>,
    /// Constructor arguments forwarded when `ty` is an unresolved user
    /// type from an imported scope.
    pub user_type_args: Vec<Expr>,
}

impl Attr {
    pub fn new(id: impl Into<String>, ty: TypeRef) -> Attr {
        Attr {
            id: id.into(),
            ty,
            endian_override: None,
            size_expr: None,
            enum_name: None,
            encoding: None,
            if_expr: None,
            repeat: RepeatKind::None,
            repeat_expr: None,
            switch_on: None,
            switch_cases: Vec::new(),
            process: None,
            user_type_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumValue {
    pub value: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumDef {
    pub name: String,
    pub values: Vec<EnumValue>,
}

/// Derived member of the generated type: either a lazily computed value
/// or a random-access parse at a seekable position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub body: InstanceBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InstanceBody {
    /// Pure expression over declared names, computed once on first access.
    Value {
        expr: Expr,
        /// Overrides inferred storage typing when present.
        explicit_type: Option<TypeRef>,
    },
    /// Seek, read, restore the stream position, cache the result.
    Parse {
        ty: TypeRef,
        pos_expr: Option<Expr>,
        size_expr: Option<Expr>,
        endian_override: Option<Endian>,
        encoding: Option<String>,
    },
}

impl Instance {
    pub fn value(id: impl Into<String>, expr: Expr) -> Instance {
        Instance {
            id: id.into(),
            body: InstanceBody::Value {
                expr,
                explicit_type: None,
            },
        }
    }

    pub fn is_parse(&self) -> bool {
        matches!(self.body, InstanceBody::Parse { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub target: String,
    pub condition_expr: Expr,
    pub message: String,
}

/// Top-level format description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    pub name: String,
    pub default_endian: Endian,
    pub imports: Vec<String>,
    pub params: Vec<Param>,
    pub types: Vec<TypeDef>,
    pub attrs: Vec<Attr>,
    pub enums: Vec<EnumDef>,
    pub instances: Vec<Instance>,
    pub validations: Vec<Validation>,
}

impl Spec {
    pub fn new(name: impl Into<String>) -> Spec {
        Spec {
            name: name.into(),
            ..Spec::default()
        }
    }
}

/// Final path component of an import name, without its extension.
/// `formats/common.ksir` and `common` both stem to `common`.
pub fn import_stem(import_name: &str) -> &str {
    let value = import_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(import_name);
    match value.rfind('.') {
        Some(dot) => &value[..dot],
        None => value,
    }
}

/// Whether a user type reference targets the module named by an import
/// stem, either exactly or as the last `::` segment.
pub fn user_type_matches_import(type_name: &str, stem: &str) -> bool {
    if type_name == stem {
        return true;
    }
    type_name
        .strip_suffix(stem)
        .and_then(|head| head.strip_suffix(':'))
        .is_some()
}

/// Enum references match either exactly or as a `::`-suffix of the
/// declared name.
pub fn enum_name_matches(declared: &str, reference: &str) -> bool {
    if declared == reference {
        return true;
    }
    declared
        .strip_suffix(reference)
        .and_then(|head| head.strip_suffix(':'))
        .is_some()
}
