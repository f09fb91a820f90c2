//! Python, Ruby, Lua and Wireshark-Lua emitter coverage.

use std::fs;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ksc_codegen::{emit, lua, python, ruby, EmitOptions, Target};
use ksc_ir::{
    serialize, Attr, Expr, Instance, InstanceBody, PrimitiveType, Process, RepeatKind, Spec,
    SwitchCase, TypeDef, TypeRef, Validation, SCOPE_MARKER,
};
use tempfile::TempDir;

fn smoke_spec() -> Spec {
    let mut spec = Spec::new("script_target_smoke");
    spec.attrs
        .push(Attr::new("one", TypeRef::Primitive(PrimitiveType::U1)));

    let mut payload = Attr::new("payload", TypeRef::Primitive(PrimitiveType::Bytes));
    payload.size_expr = Some(Expr::int(2));
    payload.process = Some(Process::XorConst(255));
    spec.attrs.push(payload);

    spec.instances.push(Instance::value(
        "is_nonzero",
        Expr::binary("!=", Expr::name("one"), Expr::int(0)),
    ));
    spec.instances.push(Instance {
        id: "trailer".into(),
        body: InstanceBody::Parse {
            ty: TypeRef::Primitive(PrimitiveType::U2),
            pos_expr: Some(Expr::int(8)),
            size_expr: None,
            endian_override: None,
            encoding: None,
        },
    });

    spec.validations.push(Validation {
        target: "one".into(),
        condition_expr: Expr::binary("!=", Expr::name("one"), Expr::int(0)),
        message: "one must be non-zero".into(),
    });
    spec
}

#[test]
fn python_module_shape() {
    let spec = smoke_spec();
    let text = python::render_module(&spec);

    assert!(
        text.contains("class ScriptTargetSmoke(KaitaiStruct):"),
        "class line:\n{text}"
    );
    assert!(
        text.contains("if getattr(kaitaistruct, 'API_VERSION', (0, 9)) < (0, 11):"),
        "version guard:\n{text}"
    );
    assert!(text.contains(", ValidationExprError"), "validation import:\n{text}");
    assert!(text.contains("self.one = self._io.read_u1()"), "u1 read:\n{text}");
    assert!(
        text.contains("self._raw_payload = self._io.read_bytes(2)"),
        "raw shadow:\n{text}"
    );
    assert!(
        text.contains("self.payload = KaitaiStream.process_xor_one(self._raw_payload, 255)"),
        "xor process:\n{text}"
    );
    assert!(
        text.contains("raise ValidationExprError(self.one, self._io, '/valid/one')"),
        "validation raise:\n{text}"
    );
    assert!(text.contains("@property"), "cached properties:\n{text}");
    assert!(
        text.contains("self._m_is_nonzero = self.one != 0"),
        "value instance body:\n{text}"
    );
    assert!(text.contains("_pos = self._io.pos()"), "parse instance saves pos:\n{text}");
    assert!(text.contains("self._io.seek(8)"), "parse instance seeks:\n{text}");
    assert!(text.contains("self._io.seek(_pos)"), "parse instance restores:\n{text}");
    assert!(text.contains("def _fetch_instances(self):"), "fetch stub:\n{text}");
}

#[test]
fn python_repeat_forms() {
    let mut spec = Spec::new("py_loops");
    spec.attrs
        .push(Attr::new("n", TypeRef::Primitive(PrimitiveType::U1)));
    let mut items = Attr::new("items", TypeRef::Primitive(PrimitiveType::U1));
    items.repeat = RepeatKind::Expr;
    items.repeat_expr = Some(Expr::name("n"));
    spec.attrs.push(items);
    let mut tail = Attr::new("tail", TypeRef::Primitive(PrimitiveType::U1));
    tail.repeat = RepeatKind::Until;
    tail.repeat_expr = Some(Expr::binary("==", Expr::name("_"), Expr::int(255)));
    spec.attrs.push(tail);
    let mut rest = Attr::new("rest", TypeRef::Primitive(PrimitiveType::U1));
    rest.repeat = RepeatKind::Eos;
    spec.attrs.push(rest);

    let text = python::render_module(&spec);
    assert!(text.contains("for i in range(self.n):"), "repeat-expr:\n{text}");
    assert!(text.contains("while not self._io.is_eof():"), "repeat-eos:\n{text}");
    // In repeat-until the loop variable `_` is the last pushed item, so
    // the termination test reads naturally.
    assert!(text.contains("if _ == 255:"), "repeat-until condition:\n{text}");
    assert!(text.contains("                break"), "repeat-until break:\n{text}");
}

#[test]
fn python_package_path_and_determinism() {
    let spec = smoke_spec();
    let dir = TempDir::new().unwrap();
    let options = EmitOptions {
        out_dir: dir.path().to_path_buf(),
        python_package: Some("pkg.subpkg".into()),
    };
    emit(&spec, Target::Python, &options).expect("python emit");
    let path = dir
        .path()
        .join("pkg")
        .join("subpkg")
        .join("script_target_smoke.py");
    assert!(path.exists(), "module under package path");
    let first = fs::read(&path).unwrap();
    emit(&spec, Target::Python, &options).expect("second python emit");
    assert_eq!(first, fs::read(&path).unwrap());
}

#[test]
fn ruby_module_shape() {
    let spec = smoke_spec();
    let text = ruby::render_module(&spec);

    assert!(
        text.contains("class ScriptTargetSmoke < Kaitai::Struct::Struct"),
        "class line:\n{text}"
    );
    assert!(
        text.contains("unless Gem::Version.new(Kaitai::Struct::VERSION) >= Gem::Version.new('0.11')"),
        "version guard:\n{text}"
    );
    assert!(text.contains("@one = @_io.read_u1"), "u1 read:\n{text}");
    assert!(
        text.contains("Kaitai::Struct::Stream.process_xor_one(@_io.read_bytes(2), 255)"),
        "xor process:\n{text}"
    );
    assert!(
        text.contains("raise Kaitai::Struct::ValidationExprError.new(@one, @_io, '/valid/one') if !(one != 0)"),
        "validation:\n{text}"
    );
    assert!(text.contains("attr_reader :one"), "readers:\n{text}");
    assert!(text.contains("return @is_nonzero unless @is_nonzero.nil?"), "cache:\n{text}");
    assert!(text.contains("_pos = @_io.pos"), "parse instance saves pos:\n{text}");
    assert!(text.contains("@_io.seek(8)"), "parse instance seeks:\n{text}");
}

#[test]
fn ruby_nested_scopes_emit_nested_classes() {
    let mut child = Spec::new("chunk");
    child
        .attrs
        .push(Attr::new("weight", TypeRef::Primitive(PrimitiveType::U2)));
    let payload = STANDARD.encode(serialize(&child));

    let mut spec = Spec::new("container");
    spec.types.push(TypeDef {
        name: "body".into(),
        ty: TypeRef::user(format!("{SCOPE_MARKER}{payload}")),
    });
    spec.attrs.push(Attr::new("content", TypeRef::user("body")));

    let text = ruby::render_module(&spec);
    assert!(
        text.contains("class Container < Kaitai::Struct::Struct"),
        "root class:\n{text}"
    );
    assert!(
        text.contains("  class Body < Kaitai::Struct::Struct"),
        "nested class:\n{text}"
    );
    assert!(
        text.contains("@content = Body.new(@_io, self, @_root)"),
        "nested construction:\n{text}"
    );
    assert!(text.contains("@weight = @_io.read_u2le"), "nested read:\n{text}");
}

#[test]
fn ruby_switch_lowers_to_case_when() {
    let mut spec = Spec::new("rb_switch");
    spec.attrs
        .push(Attr::new("tag", TypeRef::Primitive(PrimitiveType::U1)));
    let mut value = Attr::new("value", TypeRef::Primitive(PrimitiveType::U2));
    value.switch_on = Some(Expr::name("tag"));
    value.switch_cases.push(SwitchCase {
        match_expr: Some(Expr::int(1)),
        ty: TypeRef::Primitive(PrimitiveType::U2),
    });
    value.switch_cases.push(SwitchCase {
        match_expr: None,
        ty: TypeRef::Primitive(PrimitiveType::U2),
    });
    spec.attrs.push(value);

    let text = ruby::render_module(&spec);
    assert!(text.contains("case tag"), "case head:\n{text}");
    assert!(text.contains("when 1"), "when arm:\n{text}");
    assert!(text.contains("else"), "else arm:\n{text}");
    assert!(text.contains("@value = @_io.read_u2le"), "case read:\n{text}");
}

#[test]
fn lua_module_shape() {
    let spec = smoke_spec();
    let text = lua::render_module(&spec, false);

    assert!(
        text.contains("ScriptTargetSmoke = class.class(KaitaiStruct)"),
        "class construction:\n{text}"
    );
    assert!(
        text.contains("function ScriptTargetSmoke:_init(io, _parent, _root)"),
        "init:\n{text}"
    );
    assert!(text.contains("self.one = self._io:read_u1()"), "u1 read:\n{text}");
    assert!(
        text.contains("KaitaiStream.process_xor_one(self._raw_payload, 255)"),
        "xor process:\n{text}"
    );
    // Parse instances are properties, value instances are methods.
    assert!(
        text.contains("ScriptTargetSmoke.property.trailer = {}"),
        "property declaration:\n{text}"
    );
    assert!(
        text.contains("function ScriptTargetSmoke.property.trailer:get()"),
        "property getter:\n{text}"
    );
    assert!(
        text.contains("function ScriptTargetSmoke:is_nonzero()"),
        "value instance method:\n{text}"
    );
    assert!(
        text.contains("self._m_is_nonzero = self.one ~= 0"),
        "inequality spelled for lua:\n{text}"
    );
    assert!(text.contains("local _pos = self._io:pos()"), "save pos:\n{text}");
    assert!(text.contains("self._io:seek(8)"), "seek:\n{text}");
    assert!(!text.contains("Proto("), "no dissector in plain lua:\n{text}");
}

#[test]
fn lua_validation_specialization() {
    let mut spec = Spec::new("lua_valid");
    spec.attrs
        .push(Attr::new("one", TypeRef::Primitive(PrimitiveType::U1)));
    spec.validations.push(Validation {
        target: "one".into(),
        condition_expr: Expr::binary("==", Expr::name("one"), Expr::int(85)),
        message: "magic".into(),
    });
    spec.validations.push(Validation {
        target: "one".into(),
        condition_expr: Expr::binary("<", Expr::name("one"), Expr::int(100)),
        message: "range".into(),
    });

    let text = lua::render_module(&spec, false);
    assert!(text.contains("if not(self.one == 85) then"), "specialized guard:\n{text}");
    assert!(
        text.contains("error(\"not equal, expected \" .. 85 .. \", but got \" .. self.one)"),
        "specialized error:\n{text}"
    );
    assert!(
        text.contains("if not (self.one < 100) then error('validation failed: /valid/one') end"),
        "generic error:\n{text}"
    );
}

#[test]
fn lua_logical_operators_use_keywords() {
    let mut spec = Spec::new("lua_ops");
    spec.attrs
        .push(Attr::new("a", TypeRef::Primitive(PrimitiveType::U1)));
    spec.attrs
        .push(Attr::new("b", TypeRef::Primitive(PrimitiveType::U1)));
    spec.instances.push(Instance::value(
        "both",
        Expr::binary(
            "&&",
            Expr::binary(">", Expr::name("a"), Expr::int(0)),
            Expr::unary("!", Expr::name("b")),
        ),
    ));

    let text = lua::render_module(&spec, false);
    assert!(
        text.contains("self.a > 0 and (not self.b)"),
        "and/not keywords:\n{text}"
    );
}

#[test]
fn wireshark_variant_appends_dissector_stub() {
    let spec = smoke_spec();
    let dir = TempDir::new().unwrap();
    let options = EmitOptions {
        out_dir: dir.path().to_path_buf(),
        python_package: None,
    };
    emit(&spec, Target::WiresharkLua, &options).expect("wireshark emit");
    let path = dir.path().join("script_target_smoke_wireshark.lua");
    let text = fs::read_to_string(&path).unwrap();

    assert!(text.contains("class.class(KaitaiStruct)"), "parser body present:\n{text}");
    assert!(
        text.contains("local script_target_smoke_proto = Proto(\"script_target_smoke\", \"ScriptTargetSmoke\")"),
        "proto binding:\n{text}"
    );
    assert!(
        text.contains("DissectorTable.get(\"tcp.port\"):add(script_target_smoke_proto_default_port, script_target_smoke_proto)"),
        "port registration:\n{text}"
    );
}

#[test]
fn ruby_and_lua_emission_deterministic() {
    let spec = smoke_spec();
    let dir = TempDir::new().unwrap();
    let options = EmitOptions {
        out_dir: dir.path().to_path_buf(),
        python_package: None,
    };
    emit(&spec, Target::Ruby, &options).expect("ruby emit");
    emit(&spec, Target::Lua, &options).expect("lua emit");
    let rb = fs::read(dir.path().join("script_target_smoke.rb")).unwrap();
    let lua_text = fs::read(dir.path().join("script_target_smoke.lua")).unwrap();
    emit(&spec, Target::Ruby, &options).expect("second ruby emit");
    emit(&spec, Target::Lua, &options).expect("second lua emit");
    assert_eq!(rb, fs::read(dir.path().join("script_target_smoke.rb")).unwrap());
    assert_eq!(
        lua_text,
        fs::read(dir.path().join("script_target_smoke.lua")).unwrap()
    );
}
