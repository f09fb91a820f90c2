//! Round-trip stability of the KSIR1 text codec.
//!
//! The canonical property: for any spec that validates, serializing,
//! parsing and serializing again reproduces the first encoding byte for
//! byte.

use ksc_ir::{
    deserialize, serialize, Attr, Endian, EnumDef, EnumValue, Expr, Instance, InstanceBody,
    IrError, Param, PrimitiveType, Process, RepeatKind, Spec, SwitchCase, TypeDef, TypeRef,
    Validation,
};

fn rich_spec() -> Spec {
    let mut spec = Spec::new("packet_header");
    spec.default_endian = Endian::Be;
    spec.imports.push("common_types".into());
    spec.params.push(Param {
        id: "len_hint".into(),
        ty: TypeRef::Primitive(PrimitiveType::U4),
    });
    spec.types.push(TypeDef {
        name: "counter_t".into(),
        ty: TypeRef::Primitive(PrimitiveType::U4),
    });

    let mut magic = Attr::new("magic", TypeRef::Primitive(PrimitiveType::U2));
    magic.endian_override = Some(Endian::Le);
    spec.attrs.push(magic);

    let mut payload = Attr::new("payload", TypeRef::Primitive(PrimitiveType::Bytes));
    payload.size_expr = Some(Expr::binary("+", Expr::name("len_hint"), Expr::int(4)));
    payload.process = Some(Process::XorConst(170));
    spec.attrs.push(payload);

    let mut name = Attr::new("name", TypeRef::Primitive(PrimitiveType::Str));
    name.size_expr = Some(Expr::int(3));
    name.encoding = Some("ASCII".into());
    name.if_expr = Some(Expr::binary("==", Expr::name("magic"), Expr::int(1)));
    spec.attrs.push(name);

    let mut tail = Attr::new("tail", TypeRef::Primitive(PrimitiveType::U1));
    tail.repeat = RepeatKind::Until;
    tail.repeat_expr = Some(Expr::binary("==", Expr::name("_"), Expr::int(255)));
    spec.attrs.push(tail);

    let mut tagged = Attr::new("tagged", TypeRef::Primitive(PrimitiveType::U1));
    tagged.switch_on = Some(Expr::name("magic"));
    tagged.switch_cases.push(SwitchCase {
        match_expr: Some(Expr::int(1)),
        ty: TypeRef::Primitive(PrimitiveType::U1),
    });
    tagged.switch_cases.push(SwitchCase {
        match_expr: None,
        ty: TypeRef::Primitive(PrimitiveType::U1),
    });
    spec.attrs.push(tagged);

    let mut imported = Attr::new("extra", TypeRef::user("common_types"));
    imported.user_type_args.push(Expr::name("magic"));
    imported.user_type_args.push(Expr::int(9));
    spec.attrs.push(imported);

    spec.enums.push(EnumDef {
        name: "animal".into(),
        values: vec![
            EnumValue {
                value: 7,
                name: "cat".into(),
            },
            EnumValue {
                value: 13,
                name: "dog".into(),
            },
        ],
    });

    spec.instances.push(Instance::value(
        "checksum_ok",
        Expr::unary("!", Expr::name("magic")),
    ));
    spec.instances.push(Instance {
        id: "typed_len".into(),
        body: InstanceBody::Value {
            expr: Expr::binary("+", Expr::name("magic"), Expr::int(1)),
            explicit_type: Some(TypeRef::Primitive(PrimitiveType::U4)),
        },
    });
    spec.instances.push(Instance {
        id: "trailer".into(),
        body: InstanceBody::Parse {
            ty: TypeRef::Primitive(PrimitiveType::Str),
            pos_expr: Some(Expr::int(16)),
            size_expr: Some(Expr::int(4)),
            endian_override: Some(Endian::Le),
            encoding: Some("ASCII".into()),
        },
    });

    spec.validations.push(Validation {
        target: "magic".into(),
        condition_expr: Expr::binary(">=", Expr::name("magic"), Expr::int(0)),
        message: "magic must be non-negative".into(),
    });
    spec
}

#[test]
fn serialize_parse_serialize_is_byte_stable() {
    let spec = rich_spec();
    let encoded = serialize(&spec);
    let decoded = deserialize(&encoded).expect("serialized IR parses");
    assert_eq!(serialize(&decoded), encoded);
}

#[test]
fn parsed_spec_matches_original() {
    let spec = rich_spec();
    let decoded = deserialize(&serialize(&spec)).expect("serialized IR parses");
    assert_eq!(decoded, spec);
}

#[test]
fn escaped_text_survives_round_trip() {
    let mut spec = Spec::new("escapes");
    spec.validations.push(Validation {
        target: "x".into(),
        condition_expr: Expr::boolean(true),
        message: r#"say "hi" to c:\path"#.into(),
    });
    spec.attrs
        .push(Attr::new("x", TypeRef::Primitive(PrimitiveType::U1)));
    let encoded = serialize(&spec);
    let decoded = deserialize(&encoded).expect("escapes parse");
    assert_eq!(decoded.validations[0].message, r#"say "hi" to c:\path"#);
    assert_eq!(serialize(&decoded), encoded);
}

#[test]
fn deserialize_runs_the_validator() {
    let mut spec = Spec::new("x");
    spec.attrs
        .push(Attr::new("a", TypeRef::Primitive(PrimitiveType::U1)));
    spec.attrs
        .push(Attr::new("a", TypeRef::Primitive(PrimitiveType::U1)));
    let encoded = serialize(&spec);
    assert!(matches!(
        deserialize(&encoded),
        Err(IrError::Validate(m)) if m.contains("duplicate attr")
    ));
}
