//! # kro-expr
//!
//! The expression engine behind kro's resource templates. Any string value
//! in a ResourceGraphDefinition may embed `${…}` placeholders; this crate
//! parses them, type-checks them against a typing environment, extracts the
//! cross-resource references they make, and evaluates them against live
//! values during reconciliation.
//!
//! The language is a side-effect-free CEL-like subset: literals, member
//! access, indexing, arithmetic, comparisons, logical operators, a ternary,
//! and a whitelisted function set (`has`, `size`, `startsWith`, `endsWith`,
//! `contains`, `matches`, `default`, `string`, `int`, `join`, `lower`,
//! `upper`, `trim`). Functions work in free form (`size(x)`) and method
//! form (`x.size()`).
//!
//! The contract is split so that analysis and reconciliation share one
//! implementation:
//!
//! - [`parse`] + [`check`] + [`references`] run at RGD analysis time, with
//!   no live data;
//! - [`eval`] and [`Template::render`] run per instance reconcile, against
//!   [`Bindings`] built from the instance spec and materialized resources.
//!
//! Evaluation failures caused purely by absent data report
//! [`ExprError::is_missing_data`] so reconcilers can treat them as
//! "not yet" rather than terminal.

#![forbid(unsafe_code)]

mod ast;
mod check;
mod error;
mod eval;
mod parser;
mod refs;
mod template;
mod token;
mod types;

pub use ast::{BinaryOp, Expr, UnaryOp};
pub use check::check;
pub use error::{ExprError, Result};
pub use eval::{eval, Bindings};
pub use parser::parse;
pub use refs::{references, Reference};
pub use template::{is_template, scan, Segment, Template};
pub use types::{Type, TypeEnv};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // end-to-end: parse -> check -> eval, the exact flow analysis and
    // reconciliation run in sequence
    #[test]
    fn parse_check_eval_roundtrip() {
        let expr = parse("deployment.status.availableReplicas >= schema.replicas").unwrap();

        let mut env = TypeEnv::new();
        env.bind("schema", Type::object([("replicas".to_string(), Type::Int)]));
        env.bind("deployment", Type::Dyn);
        assert_eq!(check(&expr, &env).unwrap(), Type::Bool);

        assert_eq!(
            references(&expr),
            vec![
                Reference {
                    root: "deployment".into(),
                    path: "status.availableReplicas".into()
                },
                Reference {
                    root: "schema".into(),
                    path: "replicas".into()
                },
            ]
        );

        let mut bindings = Bindings::new();
        bindings.bind("schema", json!({"replicas": 3}));
        bindings.bind("deployment", json!({"status": {"availableReplicas": 3}}));
        assert_eq!(eval(&expr, &bindings).unwrap(), json!(true));
    }
}
