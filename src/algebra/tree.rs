//! Nonlinear expression trees.
//!
//! A tree node is an enum with per-variant payload: arithmetic nodes own
//! their children, `Cst` references the shared constant pool, `Var`
//! references a container variable. The tree caches the list of variables
//! appearing in it; the cache must be refreshed before the tree is handed to
//! the cross-reference matrix.

use crate::algebra::pool::{Pool, PoolIdx};
use crate::error::Error;
use crate::{E, IDX_NA, Idx, Vi, valid_idx};

/// Function opcodes allowed in `Call*` nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Sin,
    Cos,
    Tan,
    Exp,
    Log,
    Log10,
    Sqrt,
    /// Squaring, kept as a dedicated opcode for cheap differentiation.
    Sqr,
    Abs,
    Sign,
    Pow,
    Min,
    Max,
}

impl Func {
    pub fn name(self) -> &'static str {
        match self {
            Func::Sin => "sin",
            Func::Cos => "cos",
            Func::Tan => "tan",
            Func::Exp => "exp",
            Func::Log => "log",
            Func::Log10 => "log10",
            Func::Sqrt => "sqrt",
            Func::Sqr => "sqr",
            Func::Abs => "abs",
            Func::Sign => "sign",
            Func::Pow => "pow",
            Func::Min => "min",
            Func::Max => "max",
        }
    }

    /// Functions differentiable everywhere on their domain. The others force
    /// the owning model to the `dnlp` problem type when differentiated.
    pub fn is_smooth(self) -> bool {
        !matches!(self, Func::Abs | Func::Sign | Func::Min | Func::Max)
    }

    /// Fixed arity, or `None` for variadic functions.
    pub fn arity(self) -> Option<usize> {
        match self {
            Func::Pow => Some(2),
            Func::Min | Func::Max => None,
            _ => Some(1),
        }
    }
}

/// Arithmetic opcodes for [`NlNode::arithm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NlOp {
    Add,
    Sub,
    Mul,
    Div,
    Umin,
}

/// One expression-tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum NlNode {
    Add(Vec<NlNode>),
    Mul(Vec<NlNode>),
    Sub(Box<[NlNode; 2]>),
    Div(Box<[NlNode; 2]>),
    Umin(Box<NlNode>),
    Cst(PoolIdx),
    Var(Vi),
    Call1(Func, Box<NlNode>),
    Call2(Func, Box<[NlNode; 2]>),
    CallN(Func, Vec<NlNode>),
}

impl NlNode {
    /// Allocate a fixed-arity arithmetic node with room for `k` children.
    /// `Sub`/`Div` require `k == 2`, `Umin` requires `k == 1`; the children
    /// of those variants are filled by the caller via [`NlNode::sub`],
    /// [`NlNode::div`] and [`NlNode::umin`] instead.
    pub fn arithm(op: NlOp, k: usize) -> Result<NlNode, Error> {
        match op {
            NlOp::Add => Ok(NlNode::Add(Vec::with_capacity(k))),
            NlOp::Mul => Ok(NlNode::Mul(Vec::with_capacity(k))),
            NlOp::Sub | NlOp::Div | NlOp::Umin => Err(Error::InvalidArgument(format!(
                "arithm() only allocates variadic nodes, not {op:?}"
            ))),
        }
    }

    /// Allocate a function-call node from already-built arguments. Arity 0 is
    /// rejected, and a fixed-arity opcode must receive exactly its arity.
    pub fn call(func: Func, mut args: Vec<NlNode>) -> Result<NlNode, Error> {
        if args.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "function {} called with arity 0",
                func.name()
            )));
        }
        if let Some(arity) = func.arity()
            && arity != args.len()
        {
            return Err(Error::InvalidArgument(format!(
                "function {} has arity {}, got {} arguments",
                func.name(),
                arity,
                args.len()
            )));
        }
        Ok(match args.len() {
            1 => NlNode::Call1(func, Box::new(args.pop().unwrap())),
            2 => {
                let b = args.pop().unwrap();
                let a = args.pop().unwrap();
                NlNode::Call2(func, Box::new([a, b]))
            }
            _ => NlNode::CallN(func, args),
        })
    }

    pub fn cst(pool_idx: PoolIdx) -> NlNode {
        NlNode::Cst(pool_idx)
    }

    /// A variable leaf scaled by `coeff`; a coefficient other than 1 is
    /// materialized as `MUL(CST, VAR)`.
    pub fn var(vi: Vi, coeff: E, pool: &mut Pool) -> NlNode {
        if coeff == 1. {
            NlNode::Var(vi)
        } else {
            NlNode::Mul(vec![NlNode::Cst(pool.intern(coeff)), NlNode::Var(vi)])
        }
    }

    pub fn sub(lhs: NlNode, rhs: NlNode) -> NlNode {
        NlNode::Sub(Box::new([lhs, rhs]))
    }

    pub fn div(num: NlNode, den: NlNode) -> NlNode {
        NlNode::Div(Box::new([num, den]))
    }

    /// Negate a subtree.
    pub fn umin(child: NlNode) -> NlNode {
        NlNode::Umin(Box::new(child))
    }

    fn visit_vars(&self, out: &mut Vec<Vi>) {
        match self {
            NlNode::Var(vi) => {
                if !out.contains(vi) {
                    out.push(*vi);
                }
            }
            NlNode::Cst(_) => {}
            NlNode::Add(ch) | NlNode::Mul(ch) | NlNode::CallN(_, ch) => {
                for c in ch {
                    c.visit_vars(out);
                }
            }
            NlNode::Sub(ch) | NlNode::Div(ch) | NlNode::Call2(_, ch) => {
                ch[0].visit_vars(out);
                ch[1].visit_vars(out);
            }
            NlNode::Umin(c) | NlNode::Call1(_, c) => c.visit_vars(out),
        }
    }

    pub fn node_count(&self) -> usize {
        1 + match self {
            NlNode::Add(ch) | NlNode::Mul(ch) | NlNode::CallN(_, ch) => {
                ch.iter().map(NlNode::node_count).sum()
            }
            NlNode::Sub(ch) | NlNode::Div(ch) | NlNode::Call2(_, ch) => {
                ch[0].node_count() + ch[1].node_count()
            }
            NlNode::Umin(c) | NlNode::Call1(_, c) => c.node_count(),
            NlNode::Cst(_) | NlNode::Var(_) => 0,
        }
    }

    /// Rewrite every `Var` leaf through `rosetta`. A dropped leaf (`IDX_NA`)
    /// removes its additive operand; under a multiplicative or functional
    /// node the whole node is dropped, since the subtree has no meaning
    /// without the variable.
    fn map_rosetta(self, rosetta: &[Idx]) -> Result<Option<NlNode>, Error> {
        Ok(match self {
            NlNode::Var(vi) => {
                let vi_new = *rosetta.get(vi).ok_or(Error::IndexOutOfRange {
                    idx: vi,
                    len: rosetta.len(),
                })?;
                if vi_new == IDX_NA {
                    None
                } else if !valid_idx(vi_new) {
                    return Err(Error::RuntimeError(format!(
                        "rosetta maps variable {vi} to sentinel {vi_new}"
                    )));
                } else {
                    Some(NlNode::Var(vi_new))
                }
            }
            NlNode::Cst(p) => Some(NlNode::Cst(p)),
            NlNode::Add(ch) => {
                let mut kept = Vec::with_capacity(ch.len());
                for c in ch {
                    if let Some(c) = c.map_rosetta(rosetta)? {
                        kept.push(c);
                    }
                }
                match kept.len() {
                    0 => None,
                    1 => Some(kept.pop().unwrap()),
                    _ => Some(NlNode::Add(kept)),
                }
            }
            NlNode::Sub(ch) => {
                let [a, b] = *ch;
                match (a.map_rosetta(rosetta)?, b.map_rosetta(rosetta)?) {
                    (Some(a), Some(b)) => Some(NlNode::sub(a, b)),
                    (Some(a), None) => Some(a),
                    (None, Some(b)) => Some(NlNode::umin(b)),
                    (None, None) => None,
                }
            }
            NlNode::Mul(ch) => {
                let mut kept = Vec::with_capacity(ch.len());
                for c in ch {
                    match c.map_rosetta(rosetta)? {
                        Some(c) => kept.push(c),
                        None => return Ok(None),
                    }
                }
                Some(NlNode::Mul(kept))
            }
            NlNode::Div(ch) => {
                let [a, b] = *ch;
                match (a.map_rosetta(rosetta)?, b.map_rosetta(rosetta)?) {
                    (Some(a), Some(b)) => Some(NlNode::div(a, b)),
                    _ => None,
                }
            }
            NlNode::Umin(c) => c.map_rosetta(rosetta)?.map(NlNode::umin),
            NlNode::Call1(f, c) => c
                .map_rosetta(rosetta)?
                .map(|c| NlNode::Call1(f, Box::new(c))),
            NlNode::Call2(f, ch) => {
                let [a, b] = *ch;
                match (a.map_rosetta(rosetta)?, b.map_rosetta(rosetta)?) {
                    (Some(a), Some(b)) => Some(NlNode::Call2(f, Box::new([a, b]))),
                    _ => None,
                }
            }
            NlNode::CallN(f, ch) => {
                let mut kept = Vec::with_capacity(ch.len());
                for c in ch {
                    match c.map_rosetta(rosetta)? {
                        Some(c) => kept.push(c),
                        None => return Ok(None),
                    }
                }
                Some(NlNode::CallN(f, kept))
            }
        })
    }

    /// Evaluate the subtree at the point `x`.
    pub fn eval(&self, x: &[E], pool: &Pool) -> Result<E, Error> {
        Ok(match self {
            NlNode::Cst(p) => pool.get(*p).ok_or(Error::IndexOutOfRange {
                idx: *p,
                len: pool.len(),
            })?,
            NlNode::Var(vi) => *x.get(*vi).ok_or(Error::IndexOutOfRange {
                idx: *vi,
                len: x.len(),
            })?,
            NlNode::Add(ch) => {
                let mut acc = 0.;
                for c in ch {
                    acc += c.eval(x, pool)?;
                }
                acc
            }
            NlNode::Mul(ch) => {
                let mut acc = 1.;
                for c in ch {
                    acc *= c.eval(x, pool)?;
                }
                acc
            }
            NlNode::Sub(ch) => ch[0].eval(x, pool)? - ch[1].eval(x, pool)?,
            NlNode::Div(ch) => ch[0].eval(x, pool)? / ch[1].eval(x, pool)?,
            NlNode::Umin(c) => -c.eval(x, pool)?,
            NlNode::Call1(f, c) => {
                let v = c.eval(x, pool)?;
                match f {
                    Func::Sin => v.sin(),
                    Func::Cos => v.cos(),
                    Func::Tan => v.tan(),
                    Func::Exp => v.exp(),
                    Func::Log => v.ln(),
                    Func::Log10 => v.log10(),
                    Func::Sqrt => v.sqrt(),
                    Func::Sqr => v * v,
                    Func::Abs => v.abs(),
                    Func::Sign => {
                        if v == 0. {
                            0.
                        } else {
                            v.signum()
                        }
                    }
                    _ => {
                        return Err(Error::InvalidValue(format!(
                            "function {} is not unary",
                            f.name()
                        )));
                    }
                }
            }
            NlNode::Call2(f, ch) => {
                let a = ch[0].eval(x, pool)?;
                let b = ch[1].eval(x, pool)?;
                match f {
                    Func::Pow => a.powf(b),
                    Func::Min => a.min(b),
                    Func::Max => a.max(b),
                    _ => {
                        return Err(Error::InvalidValue(format!(
                            "function {} is not binary",
                            f.name()
                        )));
                    }
                }
            }
            NlNode::CallN(f, ch) => {
                let mut vals = Vec::with_capacity(ch.len());
                for c in ch {
                    vals.push(c.eval(x, pool)?);
                }
                match f {
                    Func::Min => vals.iter().copied().fold(E::INFINITY, E::min),
                    Func::Max => vals.iter().copied().fold(E::NEG_INFINITY, E::max),
                    _ => {
                        return Err(Error::InvalidValue(format!(
                            "function {} is not variadic",
                            f.name()
                        )));
                    }
                }
            }
        })
    }
}

/// An expression tree: an optional root plus the cached variable list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NlTree {
    root: Option<NlNode>,
    vlist: Vec<Vi>,
}

impl NlTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_node(node: NlNode) -> Self {
        let mut tree = NlTree {
            root: Some(node),
            vlist: Vec::new(),
        };
        tree.refresh_vlist();
        tree
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn root(&self) -> Option<&NlNode> {
        self.root.as_ref()
    }

    /// Install a root. A non-empty slot is always rejected: callers clear it
    /// first.
    pub fn set_root(&mut self, node: NlNode) -> Result<(), Error> {
        if self.root.is_some() {
            return Err(Error::UnexpectedData(
                "tree root is already set; clear it before installing a new one".into(),
            ));
        }
        self.root = Some(node);
        self.refresh_vlist();
        Ok(())
    }

    pub fn take_root(&mut self) -> Option<NlNode> {
        self.vlist.clear();
        self.root.take()
    }

    /// Variables appearing in the tree, in first-visit order.
    pub fn vlist(&self) -> &[Vi] {
        &self.vlist
    }

    pub fn refresh_vlist(&mut self) {
        self.vlist.clear();
        if let Some(root) = &self.root {
            root.visit_vars(&mut self.vlist);
        }
    }

    /// Fuse a term into the root `ADD` node, creating or wrapping the root as
    /// needed.
    pub fn push_term(&mut self, node: NlNode) {
        match self.root.take() {
            None => self.root = Some(node),
            Some(NlNode::Add(mut ch)) => {
                ch.push(node);
                self.root = Some(NlNode::Add(ch));
            }
            Some(other) => self.root = Some(NlNode::Add(vec![other, node])),
        }
        self.refresh_vlist();
    }

    /// Reserve room for `k` further terms on the root `ADD` node.
    pub fn reserve_terms(&mut self, k: usize) {
        match self.root.take() {
            None => self.root = Some(NlNode::Add(Vec::with_capacity(k))),
            Some(NlNode::Add(mut ch)) => {
                ch.reserve(k);
                self.root = Some(NlNode::Add(ch));
            }
            Some(other) => {
                let mut ch = Vec::with_capacity(k + 1);
                ch.push(other);
                self.root = Some(NlNode::Add(ch));
            }
        }
    }

    /// Rewrite every variable leaf in place through `rosetta`.
    pub fn apply_rosetta(&mut self, rosetta: &[Idx]) -> Result<(), Error> {
        if let Some(root) = self.root.take() {
            self.root = root.map_rosetta(rosetta)?;
        }
        self.refresh_vlist();
        Ok(())
    }

    /// Independent deep copy with remapped leaves.
    pub fn dup_rosetta(&self, rosetta: &[Idx]) -> Result<NlTree, Error> {
        let mut copy = self.clone();
        copy.apply_rosetta(rosetta)?;
        Ok(copy)
    }

    pub fn eval(&self, x: &[E], pool: &Pool) -> Result<E, Error> {
        match &self.root {
            Some(root) => root.eval(x, pool),
            None => Ok(0.),
        }
    }

    pub fn node_count(&self) -> usize {
        self.root.as_ref().map_or(0, NlNode::node_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_rosetta(n: usize) -> Vec<Idx> {
        (0..n).collect()
    }

    #[test]
    fn var_with_coeff_materializes_mul() {
        let mut pool = Pool::new();
        let n = NlNode::var(2, 3., &mut pool);
        match n {
            NlNode::Mul(ch) => {
                assert_eq!(ch.len(), 2);
                assert!(matches!(ch[1], NlNode::Var(2)));
            }
            other => panic!("expected MUL(CST, VAR), got {other:?}"),
        }
        assert!(matches!(NlNode::var(2, 1., &mut pool), NlNode::Var(2)));
    }

    #[test]
    fn set_root_refuses_overwrite() {
        let mut tree = NlTree::new();
        tree.set_root(NlNode::Var(0)).unwrap();
        assert!(tree.set_root(NlNode::Var(1)).is_err());
    }

    #[test]
    fn vlist_tracks_unique_vars() {
        let mut pool = Pool::new();
        let two = pool.intern(2.);
        // x0 * x1 + 2 * x0
        let node = NlNode::Add(vec![
            NlNode::Mul(vec![NlNode::Var(0), NlNode::Var(1)]),
            NlNode::Mul(vec![NlNode::Cst(two), NlNode::Var(0)]),
        ]);
        let tree = NlTree::from_node(node);
        assert_eq!(tree.vlist(), &[0, 1]);
    }

    #[test]
    fn rosetta_prunes_dropped_additive_terms() {
        let mut pool = Pool::new();
        let c = pool.intern(4.);
        // x0 + 4 * x1, with x1 dropped
        let node = NlNode::Add(vec![
            NlNode::Var(0),
            NlNode::Mul(vec![NlNode::Cst(c), NlNode::Var(1)]),
        ]);
        let mut tree = NlTree::from_node(node);
        tree.apply_rosetta(&[7, IDX_NA]).unwrap();
        assert_eq!(tree.root(), Some(&NlNode::Var(7)));
        assert_eq!(tree.vlist(), &[7]);
    }

    #[test]
    fn rosetta_drops_whole_multiplicative_node() {
        let node = NlNode::Mul(vec![NlNode::Var(0), NlNode::Var(1)]);
        let mut tree = NlTree::from_node(node);
        tree.apply_rosetta(&[0, IDX_NA]).unwrap();
        assert!(tree.is_empty());
    }

    #[test]
    fn eval_matches_hand_computation() {
        let mut pool = Pool::new();
        let three = pool.intern(3.);
        // sin(x0) + 3 / x1
        let node = NlNode::Add(vec![
            NlNode::Call1(Func::Sin, Box::new(NlNode::Var(0))),
            NlNode::div(NlNode::Cst(three), NlNode::Var(1)),
        ]);
        let tree = NlTree::from_node(node);
        let v = tree.eval(&[0., 2.], &pool).unwrap();
        assert!((v - 1.5).abs() < 1e-12);
    }

    #[test]
    fn dup_is_independent() {
        let tree = NlTree::from_node(NlNode::Var(1));
        let copy = tree.dup_rosetta(&identity_rosetta(2)).unwrap();
        assert_eq!(copy.root(), Some(&NlNode::Var(1)));
    }

    #[test]
    fn call_rejects_zero_arity_and_wrong_arity() {
        assert!(NlNode::call(Func::Sin, vec![]).is_err());
        assert!(NlNode::call(Func::Pow, vec![NlNode::Var(0)]).is_err());
        assert!(NlNode::call(Func::Pow, vec![NlNode::Var(0), NlNode::Var(1)]).is_ok());
    }
}
