//! Expression trees shared by every attribute, instance and validation.
//!
//! Trees are immutable after construction; sub-trees are shared through
//! `Rc`, so cloning an expression is cheap and never copies the tree.

use std::rc::Rc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::spec::{Instance, InstanceBody, Spec};

/// Reserved unary form: reinterpret the operand as a pointer to the named type.
pub const CAST_PREFIX: &str = "__cast__:";
/// Reserved unary form: select a named field on the operand.
pub const ATTR_PREFIX: &str = "__attr__:";

/// Expression tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Integer literal
    Int(i64),
    /// Boolean literal
    Bool(bool),
    /// Reference to a declared attr, param or instance (`_` is the
    /// current repeat item in `repeat=until` context)
    Name(String),
    /// Unary application; `op` may be one of the reserved special forms
    Unary { op: String, operand: Rc<Expr> },
    /// Binary application, left-associative
    Binary {
        op: String,
        lhs: Rc<Expr>,
        rhs: Rc<Expr>,
    },
}

impl Expr {
    pub fn int(value: i64) -> Self {
        Expr::Int(value)
    }

    pub fn boolean(value: bool) -> Self {
        Expr::Bool(value)
    }

    pub fn name(value: impl Into<String>) -> Self {
        Expr::Name(value.into())
    }

    pub fn unary(op: impl Into<String>, operand: Expr) -> Self {
        Expr::Unary {
            op: op.into(),
            operand: Rc::new(operand),
        }
    }

    pub fn binary(op: impl Into<String>, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op: op.into(),
            lhs: Rc::new(lhs),
            rhs: Rc::new(rhs),
        }
    }

    /// Precedence level of this node; higher binds tighter. Atoms and
    /// unaries sit above every binary operator.
    pub fn precedence(&self) -> i32 {
        let Expr::Binary { op, .. } = self else {
            return 100;
        };
        match normalize_op(op) {
            "||" => 10,
            "&&" => 20,
            "|" => 30,
            "^" => 35,
            "&" => 40,
            "==" | "!=" => 45,
            "<" | "<=" | ">" | ">=" => 50,
            "<<" | ">>" => 55,
            "+" | "-" => 60,
            "*" | "/" | "%" => 70,
            _ => 5,
        }
    }
}

/// Map word-form operator aliases onto their symbolic spellings.
pub fn normalize_op(op: &str) -> &str {
    match op {
        "and" => "&&",
        "or" => "||",
        "xor" => "^",
        "not" => "!",
        _ => op,
    }
}

/// Payload of a reserved unary form, if `op` carries the given prefix.
pub fn special_unary_payload<'a>(op: &'a str, prefix: &str) -> Option<&'a str> {
    let payload = op.strip_prefix(prefix)?;
    (!payload.is_empty()).then_some(payload)
}

/// Storage type inferred for a value instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExprType {
    Int8,
    Int32,
    Bool,
}

/// Infer the result type of an expression. Names resolve against the
/// value instances typed so far; anything unknown defaults to `int32`.
pub fn result_type(expr: &Expr, instance_types: &IndexMap<String, ExprType>) -> ExprType {
    match expr {
        Expr::Bool(_) => ExprType::Bool,
        Expr::Int(value) => {
            if (-128..=127).contains(value) {
                ExprType::Int8
            } else {
                ExprType::Int32
            }
        }
        Expr::Name(name) => instance_types
            .get(name)
            .copied()
            .unwrap_or(ExprType::Int32),
        Expr::Unary { op, .. } => {
            if normalize_op(op) == "!" {
                ExprType::Bool
            } else {
                ExprType::Int32
            }
        }
        Expr::Binary { op, .. } => match normalize_op(op) {
            "&&" | "||" | "==" | "!=" | "<" | "<=" | ">" | ">=" => ExprType::Bool,
            _ => ExprType::Int32,
        },
    }
}

/// Type every value instance of a spec in declaration order. Later
/// instances see the types of earlier ones.
pub fn compute_instance_types(spec: &Spec) -> IndexMap<String, ExprType> {
    let mut out = IndexMap::new();
    for Instance { id, body } in &spec.instances {
        let InstanceBody::Value { expr, .. } = body else {
            continue;
        };
        let ty = result_type(expr, &out);
        out.insert(id.clone(), ty);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_orders_operators() {
        let mul = Expr::binary("*", Expr::name("a"), Expr::int(2));
        let add = Expr::binary("+", Expr::name("a"), Expr::int(2));
        let cmp = Expr::binary("<", Expr::name("a"), Expr::int(2));
        let and = Expr::binary("&&", Expr::boolean(true), Expr::boolean(false));
        assert!(mul.precedence() > add.precedence());
        assert!(add.precedence() > cmp.precedence());
        assert!(cmp.precedence() > and.precedence());
        assert_eq!(Expr::int(1).precedence(), 100);
        assert_eq!(Expr::unary("-", Expr::int(1)).precedence(), 100);
    }

    #[test]
    fn word_aliases_normalize() {
        assert_eq!(normalize_op("and"), "&&");
        assert_eq!(normalize_op("or"), "||");
        assert_eq!(normalize_op("xor"), "^");
        assert_eq!(normalize_op("not"), "!");
        assert_eq!(normalize_op("<<"), "<<");
    }

    #[test]
    fn special_unary_payloads() {
        assert_eq!(
            special_unary_payload("__cast__:foo_t", CAST_PREFIX),
            Some("foo_t")
        );
        assert_eq!(special_unary_payload("__cast__:", CAST_PREFIX), None);
        assert_eq!(special_unary_payload("-", CAST_PREFIX), None);
    }

    #[test]
    fn inference_follows_literal_width_and_ops() {
        let types = IndexMap::new();
        assert_eq!(result_type(&Expr::int(5), &types), ExprType::Int8);
        assert_eq!(result_type(&Expr::int(-128), &types), ExprType::Int8);
        assert_eq!(result_type(&Expr::int(128), &types), ExprType::Int32);
        assert_eq!(result_type(&Expr::boolean(true), &types), ExprType::Bool);
        assert_eq!(
            result_type(&Expr::binary("==", Expr::name("x"), Expr::int(1)), &types),
            ExprType::Bool
        );
        assert_eq!(
            result_type(&Expr::binary("+", Expr::name("x"), Expr::int(1)), &types),
            ExprType::Int32
        );
        assert_eq!(
            result_type(&Expr::unary("not", Expr::name("x")), &types),
            ExprType::Bool
        );
    }

    #[test]
    fn inference_resolves_earlier_instances() {
        let mut spec = Spec::new("t");
        spec.instances
            .push(Instance::value("flag", Expr::boolean(true)));
        spec.instances
            .push(Instance::value("copy", Expr::name("flag")));
        spec.instances
            .push(Instance::value("other", Expr::name("unknown")));
        let types = compute_instance_types(&spec);
        assert_eq!(types["flag"], ExprType::Bool);
        assert_eq!(types["copy"], ExprType::Bool);
        assert_eq!(types["other"], ExprType::Int32);
    }
}
