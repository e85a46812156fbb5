//! Equations: a linear part, an optional expression tree, a constant, and a
//! relational object.

use crate::algebra::lequ::Lequ;
use crate::algebra::pool::Pool;
use crate::algebra::tree::NlTree;
use crate::container::cone::Cone;
use crate::error::Error;
use crate::{BasisStatus, E, Ei};

/// What kind of relation the equation encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EquObject {
    /// `-body(x) ∈ cone`; the stored constant is the negation of the
    /// user-visible right-hand side.
    #[default]
    ConeInclusion,
    /// `body(x)` is a value, typically one component of a VI mapping or an
    /// objective, paired with a matched variable.
    Mapping,
    /// Logical relation between boolean variables.
    BooleanRelation,
}

impl EquObject {
    pub fn name(self) -> &'static str {
        match self {
            EquObject::ConeInclusion => "cone inclusion",
            EquObject::Mapping => "mapping",
            EquObject::BooleanRelation => "boolean relation",
        }
    }
}

/// Body semantics: `body(x) = cst + Σ coeffᵢ·xᵢ + tree(x)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Equ {
    pub idx: Ei,
    pub object: EquObject,
    pub cone: Cone,
    pub cst: E,
    pub value: E,
    pub multiplier: E,
    pub basis: BasisStatus,
    pub lequ: Lequ,
    pub tree: Option<NlTree>,
    pub(crate) active: bool,
}

impl Equ {
    /// An empty mapping; the canonical shape of a fresh FOOC row.
    pub fn empty_mapping(idx: Ei) -> Self {
        Equ {
            idx,
            object: EquObject::Mapping,
            cone: Cone::None,
            active: true,
            ..Equ::default()
        }
    }

    pub fn cone_inclusion(idx: Ei, cone: Cone) -> Self {
        Equ {
            idx,
            object: EquObject::ConeInclusion,
            cone,
            active: true,
            ..Equ::default()
        }
    }

    /// Whether the body is affine (no expression tree).
    pub fn is_affine(&self) -> bool {
        self.tree.as_ref().is_none_or(NlTree::is_empty)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_cst(&mut self, cst: E) {
        self.cst = cst;
    }

    /// Evaluate the body at `x`.
    pub fn eval_body(&self, x: &[E], pool: &Pool) -> Result<E, Error> {
        let mut acc = self.cst + self.lequ.eval(x)?;
        if let Some(tree) = &self.tree {
            acc += tree.eval(x, pool)?;
        }
        Ok(acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::tree::NlNode;

    #[test]
    fn affine_detection() {
        let mut e = Equ::empty_mapping(0);
        assert!(e.is_affine());
        e.tree = Some(NlTree::new());
        assert!(e.is_affine());
        e.tree = Some(NlTree::from_node(NlNode::Var(0)));
        assert!(!e.is_affine());
    }

    #[test]
    fn body_evaluation() {
        let pool = Pool::new();
        let mut e = Equ::empty_mapping(0);
        e.cst = -1.;
        e.lequ.push(0, 2.).unwrap();
        assert_eq!(e.eval_body(&[3.], &pool).unwrap(), 5.);
    }
}
