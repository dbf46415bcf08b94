//! Type model and typing environments

use std::collections::BTreeMap;
use std::fmt;

/// A value type in the expression language.
///
/// `Dyn` is the escape hatch for data whose schema is open or unknown
/// (Kubernetes objects routinely carry fields no schema declares); it
/// unifies with every other type.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    String,
    Int,
    Double,
    Bool,
    Null,
    List(Box<Type>),
    Map(Box<Type>, Box<Type>),
    Object(BTreeMap<String, Type>),
    Dyn,
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::String => write!(f, "string"),
            Type::Int => write!(f, "int"),
            Type::Double => write!(f, "double"),
            Type::Bool => write!(f, "bool"),
            Type::Null => write!(f, "null"),
            Type::List(elem) => write!(f, "list<{}>", elem),
            Type::Map(k, v) => write!(f, "map<{}, {}>", k, v),
            Type::Object(_) => write!(f, "object"),
            Type::Dyn => write!(f, "dyn"),
        }
    }
}

impl Type {
    /// An object type from field name/type pairs.
    pub fn object<I>(fields: I) -> Type
    where
        I: IntoIterator<Item = (String, Type)>,
    {
        Type::Object(fields.into_iter().collect())
    }

    /// Whether a value of `self` can be used where `other` is expected.
    pub fn assignable_to(&self, other: &Type) -> bool {
        match (self, other) {
            (Type::Dyn, _) | (_, Type::Dyn) => true,
            (Type::Int, Type::Double) | (Type::Double, Type::Int) => true,
            (Type::List(a), Type::List(b)) => a.assignable_to(b),
            (Type::Map(ak, av), Type::Map(bk, bv)) => ak.assignable_to(bk) && av.assignable_to(bv),
            (Type::Object(_), Type::Object(_)) => true,
            (a, b) => a == b,
        }
    }

    /// Least upper bound of two types; falls back to `Dyn` when the types
    /// have no common shape.
    pub fn unify(&self, other: &Type) -> Type {
        match (self, other) {
            (a, b) if a == b => a.clone(),
            (Type::Dyn, other) | (other, Type::Dyn) => other.clone(),
            (Type::Int, Type::Double) | (Type::Double, Type::Int) => Type::Double,
            (Type::Null, other) | (other, Type::Null) => other.clone(),
            (Type::List(a), Type::List(b)) => Type::List(Box::new(a.unify(b))),
            (Type::Map(ak, av), Type::Map(bk, bv)) => {
                Type::Map(Box::new(ak.unify(bk)), Box::new(av.unify(bv)))
            }
            _ => Type::Dyn,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Int | Type::Double | Type::Dyn)
    }
}

/// Top-level name bindings for type checking.
///
/// Analysis binds `schema` plus one root per resource id; evaluation later
/// mirrors the same roots with live values.
#[derive(Debug, Clone, Default)]
pub struct TypeEnv {
    roots: BTreeMap<String, Type>,
}

impl TypeEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, name: impl Into<String>, ty: Type) -> &mut Self {
        self.roots.insert(name.into(), ty);
        self
    }

    pub fn lookup(&self, name: &str) -> Option<&Type> {
        self.roots.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.roots.contains_key(name)
    }

    pub fn roots(&self) -> impl Iterator<Item = (&String, &Type)> {
        self.roots.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dyn_unifies_with_everything() {
        assert_eq!(Type::Dyn.unify(&Type::Int), Type::Int);
        assert_eq!(Type::String.unify(&Type::Dyn), Type::String);
        assert!(Type::Dyn.assignable_to(&Type::Bool));
    }

    #[test]
    fn numeric_promotion() {
        assert_eq!(Type::Int.unify(&Type::Double), Type::Double);
        assert!(Type::Int.assignable_to(&Type::Double));
    }

    #[test]
    fn mismatched_types_unify_to_dyn() {
        assert_eq!(Type::String.unify(&Type::Int), Type::Dyn);
    }

    #[test]
    fn list_unification_is_elementwise() {
        let a = Type::List(Box::new(Type::Int));
        let b = Type::List(Box::new(Type::Double));
        assert_eq!(a.unify(&b), Type::List(Box::new(Type::Double)));
    }
}
