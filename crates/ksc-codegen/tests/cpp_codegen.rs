//! C++/STL17 emitter coverage: class shape, expression rendering,
//! control flow, enums, validations, instances and nested scopes.

use std::fs;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ksc_codegen::cpp::{render_header, render_source};
use ksc_codegen::{emit, CodegenError, EmitOptions, Target};
use ksc_ir::{
    serialize, Attr, Endian, EnumDef, EnumValue, Expr, Instance, InstanceBody, PrimitiveType,
    Process, RepeatKind, Spec, SwitchCase, TypeDef, TypeRef, Validation, SCOPE_MARKER,
};
use tempfile::TempDir;

fn u1_attr(id: &str) -> Attr {
    Attr::new(id, TypeRef::Primitive(PrimitiveType::U1))
}

fn prim_attr(id: &str, p: PrimitiveType) -> Attr {
    Attr::new(id, TypeRef::Primitive(p))
}

#[test]
fn minimal_struct_header_and_source() {
    let mut spec = Spec::new("hello_world");
    spec.attrs.push(u1_attr("one"));

    let header = render_header(&spec);
    let source = render_source(&spec);

    assert!(header.contains("class hello_world_t;"), "forward declaration:\n{header}");
    assert!(
        header.contains(
            "hello_world_t(kaitai::kstream* p__io, kaitai::kstruct* p__parent = nullptr, hello_world_t* p__root = nullptr);"
        ),
        "constructor signature:\n{header}"
    );
    assert!(header.contains("uint8_t one() const { return m_one; }"), "accessor:\n{header}");
    assert!(header.contains("uint8_t m_one;"), "storage:\n{header}");
    assert!(header.contains("#if KAITAI_STRUCT_VERSION < 11000L"), "version gate:\n{header}");
    assert!(source.contains("m_one = m__io->read_u1();"), "read body:\n{source}");
    assert!(source.contains("m__root = p__root ? p__root : this;"), "root default:\n{source}");
}

#[test]
fn emission_is_deterministic() {
    let mut spec = Spec::new("hello_world");
    spec.attrs.push(u1_attr("one"));

    let dir = TempDir::new().unwrap();
    let options = EmitOptions {
        out_dir: dir.path().to_path_buf(),
        python_package: None,
    };
    emit(&spec, Target::CppStl, &options).expect("first emit");
    let h1 = fs::read(dir.path().join("hello_world.h")).unwrap();
    let c1 = fs::read(dir.path().join("hello_world.cpp")).unwrap();
    emit(&spec, Target::CppStl, &options).expect("second emit");
    assert_eq!(h1, fs::read(dir.path().join("hello_world.h")).unwrap());
    assert_eq!(c1, fs::read(dir.path().join("hello_world.cpp")).unwrap());
}

#[test]
fn arithmetic_and_logic_instances() {
    let mut spec = Spec::new("expr_subset_a");
    spec.attrs.push(u1_attr("a"));
    spec.attrs.push(u1_attr("b"));
    spec.instances.push(Instance::value("lit", Expr::int(7)));
    spec.instances.push(Instance::value(
        "arith",
        Expr::binary(
            "-",
            Expr::binary(
                "+",
                Expr::name("a"),
                Expr::binary("*", Expr::name("b"), Expr::int(3)),
            ),
            Expr::int(2),
        ),
    ));
    spec.instances.push(Instance::value(
        "logic",
        Expr::binary(
            "and",
            Expr::binary(">", Expr::name("a"), Expr::name("b")),
            Expr::binary("==", Expr::name("lit"), Expr::int(7)),
        ),
    ));
    spec.instances.push(Instance::value(
        "ref_mix",
        Expr::binary("+", Expr::name("lit"), Expr::name("a")),
    ));
    spec.instances.push(Instance::value(
        "bitwise",
        Expr::binary(
            "|",
            Expr::binary("<<", Expr::name("a"), Expr::int(2)),
            Expr::unary("~", Expr::name("b")),
        ),
    ));

    let header = render_header(&spec);
    let source = render_source(&spec);

    assert!(header.contains("int32_t arith();"), "arith accessor:\n{header}");
    assert!(header.contains("bool logic();"), "logic accessor:\n{header}");
    assert!(header.contains("int8_t lit();"), "narrow literal accessor:\n{header}");
    assert!(
        source.contains("m_arith = (a() + b() * 3) - 2;"),
        "no over-parenthesization:\n{source}"
    );
    assert!(
        source.contains("m_logic =  ((a() > b()) && (lit() == 7)) ;"),
        "logical operands wrapped:\n{source}"
    );
    assert!(source.contains("m_ref_mix = lit() + a();"), "instance refs:\n{source}");
    assert!(
        source.contains("<< 2") && source.contains("~b()") && source.contains("|"),
        "bitwise ops:\n{source}"
    );
}

#[test]
fn control_flow_loops_and_conditionals() {
    let mut spec = Spec::new("control_flow_subset");
    spec.attrs.push(u1_attr("opcode"));

    let mut items = u1_attr("items");
    items.repeat = RepeatKind::Expr;
    items.repeat_expr = Some(Expr::int(2));
    spec.attrs.push(items);

    let mut rest = u1_attr("rest");
    rest.repeat = RepeatKind::Eos;
    spec.attrs.push(rest);

    let mut tail = u1_attr("tail");
    tail.repeat = RepeatKind::Until;
    tail.repeat_expr = Some(Expr::binary("==", Expr::name("_"), Expr::int(255)));
    spec.attrs.push(tail);

    let mut body = u1_attr("body");
    body.if_expr = Some(Expr::binary("==", Expr::name("opcode"), Expr::int(1)));
    spec.attrs.push(body);

    let header = render_header(&spec);
    let source = render_source(&spec);

    assert!(header.contains("std::vector<uint8_t>"), "vector storage:\n{header}");
    assert!(header.contains("#include <vector>"), "vector include:\n{header}");
    assert!(source.contains("for (int i = 0; i < l_items; i++)"), "repeat-expr:\n{source}");
    assert!(source.contains("const int l_items = 2;"), "bound evaluated once:\n{source}");
    assert!(source.contains("while (!m__io->is_eof())"), "repeat-eos:\n{source}");
    assert!(
        source.contains("do {") && source.contains("} while (!(repeat_item == 255));"),
        "repeat-until:\n{source}"
    );
    assert!(
        source.contains("if (opcode() == 1) {")
            && source.contains("        m_body = m__io->read_u1();"),
        "conditional field:\n{source}"
    );
}

#[test]
fn native_switch_with_literal_cases() {
    let mut spec = Spec::new("switch_subset");
    spec.attrs.push(u1_attr("opcode"));
    let mut value = prim_attr("value", PrimitiveType::U2);
    value.switch_on = Some(Expr::name("opcode"));
    value.switch_cases.push(SwitchCase {
        match_expr: Some(Expr::int(1)),
        ty: TypeRef::Primitive(PrimitiveType::U2),
    });
    value.switch_cases.push(SwitchCase {
        match_expr: Some(Expr::int(2)),
        ty: TypeRef::Primitive(PrimitiveType::U2),
    });
    spec.attrs.push(value);

    let source = render_source(&spec);
    assert!(source.contains("switch (opcode()) {"), "native switch:\n{source}");
    assert!(source.contains("case 1: {"), "literal case:\n{source}");
    assert!(
        source.contains("throw std::runtime_error(\"switch-on has no matching case\");"),
        "missing else throws:\n{source}"
    );
}

#[test]
fn dynamic_switch_falls_back_to_lambda() {
    let mut spec = Spec::new("dynamic_switch");
    spec.attrs.push(u1_attr("tag"));
    let mut tagged = prim_attr("tagged", PrimitiveType::U2);
    tagged.switch_on = Some(Expr::binary("+", Expr::name("tag"), Expr::int(1)));
    tagged.switch_cases.push(SwitchCase {
        match_expr: Some(Expr::binary("-", Expr::name("tag"), Expr::int(1))),
        ty: TypeRef::Primitive(PrimitiveType::U2),
    });
    tagged.switch_cases.push(SwitchCase {
        match_expr: Some(Expr::binary("+", Expr::name("tag"), Expr::int(1))),
        ty: TypeRef::Primitive(PrimitiveType::U2),
    });
    spec.attrs.push(tagged);

    let header = render_header(&spec);
    let source = render_source(&spec);
    assert!(header.contains("uint16_t tagged() const"), "switch storage:\n{header}");
    assert!(source.contains("([&]() {"), "lambda switch:\n{source}");
    assert!(
        source.contains("if (tag() + 1 == tag() - 1) return m__io->read_u2le();"),
        "dynamic case:\n{source}"
    );
    assert!(
        source.contains("throw std::runtime_error(\"switch-on has no matching case\");"),
        "no else throws:\n{source}"
    );
}

#[test]
fn enums_strings_and_floats() {
    let mut spec = Spec::new("type_subset");
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
    spec.attrs.push(prim_attr("u8v", PrimitiveType::U8));
    spec.attrs.push(prim_attr("f4v", PrimitiveType::F4));
    spec.attrs.push(prim_attr("f8v", PrimitiveType::F8));
    let mut payload = prim_attr("payload", PrimitiveType::Bytes);
    payload.size_expr = Some(Expr::int(4));
    spec.attrs.push(payload);
    let mut name = prim_attr("name", PrimitiveType::Str);
    name.size_expr = Some(Expr::int(3));
    name.encoding = Some("ASCII".into());
    spec.attrs.push(name);
    let mut pet = u1_attr("pet");
    pet.enum_name = Some("animal".into());
    spec.attrs.push(pet);

    let header = render_header(&spec);
    let source = render_source(&spec);

    assert!(header.contains("enum class animal_e {"), "enum emitted:\n{header}");
    assert!(header.contains("    cat = 7,") && header.contains("    dog = 13"), "values:\n{header}");
    assert!(header.contains("double f8v() const"), "float64 accessor:\n{header}");
    assert!(source.contains("m_f4v = m__io->read_f4le();"), "f4 read:\n{source}");
    assert!(source.contains("m_payload = m__io->read_bytes(4);"), "bytes read:\n{source}");
    assert!(
        source.contains("m_name = kaitai::kstream::bytes_to_str(m__io->read_bytes(3), \"ASCII\");"),
        "encoded string read:\n{source}"
    );
    assert!(
        source.contains("m_pet = static_cast<animal_e>(m__io->read_u1());"),
        "enum cast:\n{source}"
    );
}

#[test]
fn endian_override_supersedes_default() {
    let mut spec = Spec::new("endian_mix");
    spec.default_endian = Endian::Be;
    spec.attrs.push(prim_attr("big", PrimitiveType::U4));
    let mut little = prim_attr("little", PrimitiveType::U4);
    little.endian_override = Some(Endian::Le);
    spec.attrs.push(little);

    let source = render_source(&spec);
    assert!(source.contains("m_big = m__io->read_u4be();"), "default endian:\n{source}");
    assert!(source.contains("m_little = m__io->read_u4le();"), "override:\n{source}");
}

#[test]
fn validation_specializes_equality_to_literal() {
    let mut spec = Spec::new("valid_subset");
    spec.attrs.push(u1_attr("one"));
    spec.validations.push(Validation {
        target: "one".into(),
        condition_expr: Expr::binary("==", Expr::name("one"), Expr::int(0x55)),
        message: "magic must match".into(),
    });

    let source = render_source(&spec);
    assert!(source.contains("if (!(m_one == 85)) {"), "specialized guard:\n{source}");
    assert!(
        source.contains(
            "throw kaitai::validation_not_equal_error<uint8_t>(85, m_one, m__io, std::string(\"/seq/0\"));"
        ),
        "not-equal error:\n{source}"
    );
    assert!(source.contains("#include \"kaitai/exceptions.h\""), "exceptions include:\n{source}");
}

#[test]
fn generic_validation_covers_attrs_and_instances() {
    let mut spec = Spec::new("advanced_semantics");
    spec.attrs.push(u1_attr("len"));
    spec.instances.push(Instance::value(
        "is_flag_one",
        Expr::binary("==", Expr::name("len"), Expr::int(1)),
    ));
    spec.validations.push(Validation {
        target: "len".into(),
        condition_expr: Expr::binary("<", Expr::name("len"), Expr::int(16)),
        message: "len bounded".into(),
    });
    spec.validations.push(Validation {
        target: "is_flag_one".into(),
        condition_expr: Expr::name("is_flag_one"),
        message: "flag".into(),
    });

    let source = render_source(&spec);
    assert!(
        source.contains("throw kaitai::validation_expr_error<uint8_t>(len(), m__io, \"/valid/len\");"),
        "attr validation:\n{source}"
    );
    assert!(
        source.contains(
            "throw kaitai::validation_expr_error<bool>(is_flag_one(), m__io, \"/valid/is_flag_one\");"
        ),
        "instance validation:\n{source}"
    );
}

#[test]
fn process_xor_keeps_raw_shadow() {
    let mut spec = Spec::new("xor_subset");
    let mut payload = prim_attr("payload", PrimitiveType::Bytes);
    payload.size_expr = Some(Expr::int(2));
    payload.process = Some(Process::XorConst(255));
    spec.attrs.push(payload);

    let header = render_header(&spec);
    let source = render_source(&spec);
    assert!(
        header.contains("std::string _raw_payload() const { return m__raw_payload; }"),
        "raw accessor:\n{header}"
    );
    assert!(header.contains("std::string m__raw_payload;"), "raw field:\n{header}");
    assert!(source.contains("m__raw_payload = m__io->read_bytes(2);"), "raw read:\n{source}");
    assert!(
        source.contains("m_payload = kaitai::kstream::process_xor_one(m__raw_payload, 255);"),
        "xor process:\n{source}"
    );
}

#[test]
fn parse_instance_seeks_reads_and_restores() {
    let mut spec = Spec::new("inst_subset");
    spec.attrs.push(u1_attr("one"));
    spec.instances.push(Instance {
        id: "trailer".into(),
        body: InstanceBody::Parse {
            ty: TypeRef::Primitive(PrimitiveType::U2),
            pos_expr: Some(Expr::int(16)),
            size_expr: None,
            endian_override: None,
            encoding: None,
        },
    });

    let header = render_header(&spec);
    let source = render_source(&spec);
    assert!(header.contains("uint16_t trailer();"), "accessor:\n{header}");
    assert!(header.contains("bool f_trailer;"), "cache guard:\n{header}");
    assert!(source.contains("if (f_trailer)"), "cache check:\n{source}");
    assert!(source.contains("std::streampos _pos = m__io->pos();"), "save pos:\n{source}");
    assert!(source.contains("m__io->seek(16);"), "seek:\n{source}");
    assert!(source.contains("m_trailer = m__io->read_u2le();"), "read:\n{source}");
    assert!(source.contains("m__io->seek(_pos);"), "restore pos:\n{source}");
    assert!(source.contains("if (f_trailer) {"), "clean_up guard:\n{source}");
}

#[test]
fn embedded_scope_becomes_nested_class() {
    let mut child = Spec::new("chunk");
    child.attrs.push(prim_attr("weight", PrimitiveType::U2));
    child.enums.push(EnumDef {
        name: "kind".into(),
        values: vec![EnumValue {
            value: 1,
            name: "leaf".into(),
        }],
    });
    let payload = STANDARD.encode(serialize(&child));

    let mut spec = Spec::new("container");
    spec.types.push(TypeDef {
        name: "body".into(),
        ty: TypeRef::user(format!("{SCOPE_MARKER}{payload}")),
    });
    spec.attrs.push(Attr::new("content", TypeRef::user("body")));

    let header = render_header(&spec);
    let source = render_source(&spec);

    assert!(header.contains("class body_t;"), "child forward decl:\n{header}");
    assert!(
        header.contains("class body_t : public kaitai::kstruct {"),
        "nested class:\n{header}"
    );
    assert!(header.contains("#include <set>"), "set include for nested enum:\n{header}");
    assert!(
        header.contains("static bool _is_defined_kind_t(kind_t v);"),
        "membership predicate:\n{header}"
    );
    assert!(header.contains("KIND_LEAF = 1"), "nested enum value:\n{header}");
    assert!(
        header.contains("body_t* content() const { return m_content.get(); }"),
        "owning accessor:\n{header}"
    );
    assert!(header.contains("std::unique_ptr<body_t> m_content;"), "unique storage:\n{header}");
    assert!(
        source.contains(
            "m_content = std::unique_ptr<body_t>(new body_t(m__io, this, m__root));"
        ),
        "child construction:\n{source}"
    );
    assert!(
        source.contains("container_t::body_t::body_t(kaitai::kstream* p__io, container_t* p__parent, container_t* p__root) : kaitai::kstruct(p__io) {"),
        "nested constructor:\n{source}"
    );
    assert!(
        source.contains("const std::set<container_t::body_t::kind_t> container_t::body_t::_values_kind_t{"),
        "membership set:\n{source}"
    );
}

#[test]
fn nullable_switch_in_nested_scope_tracks_null_state() {
    let mut child = Spec::new("frame");
    child.attrs.push(u1_attr("tag"));
    let mut value = prim_attr("value", PrimitiveType::U2);
    value.switch_on = Some(Expr::name("tag"));
    value.switch_cases.push(SwitchCase {
        match_expr: Some(Expr::int(1)),
        ty: TypeRef::Primitive(PrimitiveType::U2),
    });
    child.attrs.push(value);
    let payload = STANDARD.encode(serialize(&child));

    let mut spec = Spec::new("outer");
    spec.types.push(TypeDef {
        name: "body".into(),
        ty: TypeRef::user(format!("{SCOPE_MARKER}{payload}")),
    });
    spec.attrs.push(Attr::new("content", TypeRef::user("body")));

    let header = render_header(&spec);
    let source = render_source(&spec);
    assert!(header.contains("bool n_value;"), "null flag:\n{header}");
    assert!(
        header.contains("bool _is_null_value() { value(); return n_value; };"),
        "null predicate:\n{header}"
    );
    assert!(source.contains("    n_value = true;"), "null default:\n{source}");
    assert!(source.contains("        n_value = false;"), "case clears null:\n{source}");
}

#[test]
fn imported_user_types_include_their_headers() {
    let mut spec = Spec::new("wrapper");
    spec.imports.push("common_types".into());
    let mut extra = Attr::new("extra", TypeRef::user("common_types"));
    extra.user_type_args.push(Expr::name("one"));
    spec.attrs.push(u1_attr("one"));
    spec.attrs.push(extra);

    let header = render_header(&spec);
    let source = render_source(&spec);
    assert!(header.contains("#include \"common_types.h\""), "import include:\n{header}");
    assert!(
        source.contains(
            "m_extra = std::unique_ptr<common_types_t>(new common_types_t(one(), m__io));"
        ),
        "constructor args forwarded:\n{source}"
    );
}

#[test]
fn unsupported_constructs_fail_the_gate() {
    let mut spec = Spec::new("unsupported");
    spec.validations.push(Validation {
        target: "missing".into(),
        condition_expr: Expr::boolean(true),
        message: "todo".into(),
    });
    let dir = TempDir::new().unwrap();
    let options = EmitOptions {
        out_dir: dir.path().to_path_buf(),
        python_package: None,
    };
    let err = emit(&spec, Target::CppStl, &options).unwrap_err();
    let CodegenError::NotYetSupported(message) = err else {
        panic!("expected gate failure, got {err:?}");
    };
    assert!(message.contains("validation target outside attrs/instances"));

    let mut spec = Spec::new("unsupported_expr");
    spec.attrs.push(u1_attr("one"));
    spec.instances.push(Instance::value(
        "bad_op",
        Expr::binary("**", Expr::name("one"), Expr::int(2)),
    ));
    let err = emit(&spec, Target::CppStl, &options).unwrap_err();
    assert!(
        err.to_string().contains("binary operator \"**\""),
        "diagnostic names the operator: {err}"
    );
}
