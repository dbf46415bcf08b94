//! Static reference extraction

use crate::ast::Expr;

/// A `(root, path)` pair extracted from an expression.
///
/// `root` is a top-level binding name (`schema` or a resource id); `path` is
/// the dotted member chain below it, cut off at the first dynamic segment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Reference {
    pub root: String,
    pub path: String,
}

/// Collect every top-level reference an expression makes.
pub fn references(expr: &Expr) -> Vec<Reference> {
    let mut out = Vec::new();
    walk(expr, &mut out);
    out.sort();
    out.dedup();
    out
}

fn walk(expr: &Expr, out: &mut Vec<Reference>) {
    // a member/index chain rooted at an identifier contributes exactly one
    // reference; anything else recurses
    if let Some(r) = chain_reference(expr) {
        out.push(r);
        // still recurse into dynamic index operands
        collect_dynamic_indexes(expr, out);
        return;
    }

    match expr {
        Expr::Null | Expr::Bool(_) | Expr::Int(_) | Expr::Float(_) | Expr::Str(_) => {}
        // not a pure chain (e.g. rooted at a call): recurse into the parts
        Expr::Ident(_) => {}
        Expr::Member { base, .. } => walk(base, out),
        Expr::Index { base, index } => {
            walk(base, out);
            walk(index, out);
        }
        Expr::Unary { expr, .. } => walk(expr, out),
        Expr::Binary { lhs, rhs, .. } => {
            walk(lhs, out);
            walk(rhs, out);
        }
        Expr::Ternary { cond, then, otherwise } => {
            walk(cond, out);
            walk(then, out);
            walk(otherwise, out);
        }
        Expr::Call { target, args, .. } => {
            if let Some(t) = target {
                walk(t, out);
            }
            for arg in args {
                walk(arg, out);
            }
        }
        Expr::List(items) => {
            for item in items {
                walk(item, out);
            }
        }
        Expr::Map(entries) => {
            for (k, v) in entries {
                walk(k, out);
                walk(v, out);
            }
        }
    }
}

/// Render a pure member/index chain as a reference, or None when the
/// expression is not such a chain.
fn chain_reference(expr: &Expr) -> Option<Reference> {
    fn build(expr: &Expr, segments: &mut Vec<String>, truncated: &mut bool) -> Option<String> {
        match expr {
            Expr::Ident(name) => Some(name.clone()),
            Expr::Member { base, field } => {
                let root = build(base, segments, truncated)?;
                if !*truncated {
                    segments.push(field.clone());
                }
                Some(root)
            }
            Expr::Index { base, index } => {
                let root = build(base, segments, truncated)?;
                if !*truncated {
                    match index.as_ref() {
                        Expr::Int(i) => segments.push(format!("[{}]", i)),
                        Expr::Str(s) => segments.push(s.clone()),
                        // dynamic index: the static path stops here
                        _ => *truncated = true,
                    }
                }
                Some(root)
            }
            _ => None,
        }
    }

    let mut segments = Vec::new();
    let mut truncated = false;
    let root = build(expr, &mut segments, &mut truncated)?;
    let mut path = String::new();
    for seg in &segments {
        if seg.starts_with('[') {
            path.push_str(seg);
        } else {
            if !path.is_empty() {
                path.push('.');
            }
            path.push_str(seg);
        }
    }
    Some(Reference { root, path })
}

fn collect_dynamic_indexes(expr: &Expr, out: &mut Vec<Reference>) {
    match expr {
        Expr::Member { base, .. } => collect_dynamic_indexes(base, out),
        Expr::Index { base, index } => {
            collect_dynamic_indexes(base, out);
            match index.as_ref() {
                Expr::Int(_) | Expr::Str(_) => {}
                dynamic => walk(dynamic, out),
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn refs(src: &str) -> Vec<(String, String)> {
        references(&parse(src).unwrap())
            .into_iter()
            .map(|r| (r.root, r.path))
            .collect()
    }

    #[test]
    fn simple_chain() {
        assert_eq!(
            refs("deployment.metadata.name"),
            vec![("deployment".to_string(), "metadata.name".to_string())]
        );
    }

    #[test]
    fn multiple_roots_in_one_expression() {
        assert_eq!(
            refs("schema.replicas + deployment.status.availableReplicas"),
            vec![
                ("deployment".to_string(), "status.availableReplicas".to_string()),
                ("schema".to_string(), "replicas".to_string()),
            ]
        );
    }

    #[test]
    fn call_arguments_are_walked() {
        assert_eq!(
            refs("has(projectConfig.spec.defaultNamespace)"),
            vec![("projectConfig".to_string(), "spec.defaultNamespace".to_string())]
        );
        assert_eq!(
            refs("schema.name.startsWith(service.metadata.name)"),
            vec![
                ("schema".to_string(), "name".to_string()),
                ("service".to_string(), "metadata.name".to_string()),
            ]
        );
    }

    #[test]
    fn literal_index_extends_path_dynamic_cuts_it() {
        assert_eq!(
            refs("deployment.status.conditions[0].status"),
            vec![("deployment".to_string(), "status.conditions[0].status".to_string())]
        );
        // dynamic index: path stops at the list, and the index operand
        // contributes its own reference
        assert_eq!(
            refs("deployment.spec.containers[schema.index].image"),
            vec![
                ("deployment".to_string(), "spec.containers".to_string()),
                ("schema".to_string(), "index".to_string()),
            ]
        );
    }

    #[test]
    fn bare_root() {
        assert_eq!(refs("schema"), vec![("schema".to_string(), String::new())]);
    }

    #[test]
    fn duplicates_are_collapsed() {
        assert_eq!(
            refs("schema.name == schema.name"),
            vec![("schema".to_string(), "name".to_string())]
        );
    }
}
