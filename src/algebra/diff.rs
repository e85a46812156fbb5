//! Symbolic differentiation.
//!
//! An [`SdTool`] is built from one equation body and queried for partial
//! derivatives. Each query returns a fresh body split into a constant, a
//! linear part and a residual tree, so callers can keep stationarity rows
//! affine whenever the input allows it. The tool is meant to be allocated
//! per equation and dropped after the last derivative.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::algebra::lequ::Lequ;
use crate::algebra::pool::Pool;
use crate::algebra::tree::{Func, NlNode, NlTree};
use crate::error::Error;
use crate::{E, Vi};

/// A derivative body: `cst + lequ(x) + tree(x)`.
#[derive(Debug, Clone, Default)]
pub struct Deriv {
    pub cst: E,
    pub lequ: Lequ,
    pub tree: Option<NlNode>,
}

impl Deriv {
    /// The zero function: null tree, empty linear part.
    pub fn is_zero(&self) -> bool {
        self.cst == 0. && self.lequ.is_empty() && self.tree.is_none()
    }
}

pub struct SdTool {
    lequ: Lequ,
    tree: Option<NlNode>,
    pool: Rc<RefCell<Pool>>,
    nonsmooth: Cell<bool>,
}

impl SdTool {
    pub fn new(lequ: &Lequ, tree: Option<&NlTree>, pool: Rc<RefCell<Pool>>) -> Self {
        Self {
            lequ: lequ.clone(),
            tree: tree.and_then(|t| t.root().cloned()),
            pool,
            nonsmooth: Cell::new(false),
        }
    }

    /// Whether any derivative so far crossed a nonsmooth function. The owning
    /// model's problem type is upgraded to `dnlp` by the caller.
    pub fn saw_nonsmooth(&self) -> bool {
        self.nonsmooth.get()
    }

    /// Compute `∂ body / ∂ vi`.
    pub fn deriv(&self, vi: Vi) -> Result<Deriv, Error> {
        let mut out = Deriv {
            cst: self.lequ.coeff(vi).unwrap_or(0.),
            ..Deriv::default()
        };

        let node = match &self.tree {
            Some(node) => {
                let mut pool = self.pool.borrow_mut();
                self.diff_node(node, vi, &mut pool)?
            }
            None => None,
        };

        if let Some(node) = node {
            let pool = self.pool.borrow();
            classify(node, &pool, &mut out);
        }
        Ok(out)
    }

    fn diff_node(&self, node: &NlNode, vi: Vi, pool: &mut Pool) -> Result<Option<NlNode>, Error> {
        Ok(match node {
            NlNode::Cst(_) => None,
            NlNode::Var(v) => {
                if *v == vi {
                    Some(NlNode::Cst(pool.intern(1.)))
                } else {
                    None
                }
            }
            NlNode::Add(ch) => {
                let mut terms = Vec::new();
                for c in ch {
                    if let Some(d) = self.diff_node(c, vi, pool)? {
                        terms.push(d);
                    }
                }
                collect_sum(terms)
            }
            NlNode::Sub(ch) => {
                let da = self.diff_node(&ch[0], vi, pool)?;
                let db = self.diff_node(&ch[1], vi, pool)?;
                match (da, db) {
                    (Some(a), Some(b)) => Some(NlNode::sub(a, b)),
                    (Some(a), None) => Some(a),
                    (None, Some(b)) => Some(NlNode::umin(b)),
                    (None, None) => None,
                }
            }
            NlNode::Mul(ch) => {
                // product rule: sum over children of d(ch_i) * prod(others)
                let mut terms = Vec::new();
                for (i, c) in ch.iter().enumerate() {
                    let Some(d) = self.diff_node(c, vi, pool)? else {
                        continue;
                    };
                    let mut factors = vec![d];
                    for (j, other) in ch.iter().enumerate() {
                        if j != i {
                            factors.push(other.clone());
                        }
                    }
                    terms.push(fold_product(factors, pool));
                }
                collect_sum(terms)
            }
            NlNode::Div(ch) => {
                let da = self.diff_node(&ch[0], vi, pool)?;
                let db = self.diff_node(&ch[1], vi, pool)?;
                let num = match (da, db) {
                    (None, None) => return Ok(None),
                    (Some(a), None) => {
                        // a'/b
                        return Ok(Some(NlNode::div(a, ch[1].clone())));
                    }
                    (Some(a), Some(b)) => NlNode::sub(
                        fold_product(vec![a, ch[1].clone()], pool),
                        fold_product(vec![ch[0].clone(), b], pool),
                    ),
                    (None, Some(b)) => {
                        NlNode::umin(fold_product(vec![ch[0].clone(), b], pool))
                    }
                };
                let den = fold_product(vec![ch[1].clone(), ch[1].clone()], pool);
                Some(NlNode::div(num, den))
            }
            NlNode::Umin(c) => self.diff_node(c, vi, pool)?.map(NlNode::umin),
            NlNode::Call1(f, arg) => {
                let Some(darg) = self.diff_node(arg, vi, pool)? else {
                    return Ok(None);
                };
                let outer = self.call1_outer_deriv(*f, arg, pool)?;
                match outer {
                    Some(outer) => Some(fold_product(vec![outer, darg], pool)),
                    None => None,
                }
            }
            NlNode::Call2(Func::Pow, ch) => {
                let Some(darg) = self.diff_node(&ch[0], vi, pool)? else {
                    if self.diff_node(&ch[1], vi, pool)?.is_some() {
                        return Err(Error::NotImplemented(
                            "derivative of pow with a variable exponent",
                        ));
                    }
                    return Ok(None);
                };
                if self.diff_node(&ch[1], vi, pool)?.is_some() {
                    return Err(Error::NotImplemented(
                        "derivative of pow with a variable exponent",
                    ));
                }
                let NlNode::Cst(p) = ch[1] else {
                    return Err(Error::NotImplemented(
                        "derivative of pow with a non-constant exponent",
                    ));
                };
                let expo = pool.get(p).ok_or(Error::IndexOutOfRange {
                    idx: p,
                    len: pool.len(),
                })?;
                if expo == 0. {
                    return Ok(None);
                }
                // c * x^(c-1) * x'
                let mut factors = vec![NlNode::Cst(pool.intern(expo))];
                if expo == 2. {
                    factors.push(ch[0].clone());
                } else {
                    let down = NlNode::Cst(pool.intern(expo - 1.));
                    factors.push(NlNode::Call2(Func::Pow, Box::new([ch[0].clone(), down])));
                }
                factors.push(darg);
                Some(fold_product(factors, pool))
            }
            NlNode::Call2(f, _) | NlNode::CallN(f, _) => {
                if !f.is_smooth() {
                    self.nonsmooth.set(true);
                }
                return Err(Error::NotImplemented(
                    "derivative of a non-whitelisted function",
                ));
            }
        })
    }

    /// Outer derivative of a unary function, as a tree in its argument.
    /// `None` means the outer derivative is identically zero.
    fn call1_outer_deriv(
        &self,
        f: Func,
        arg: &NlNode,
        pool: &mut Pool,
    ) -> Result<Option<NlNode>, Error> {
        Ok(match f {
            Func::Sin => Some(NlNode::Call1(Func::Cos, Box::new(arg.clone()))),
            Func::Cos => Some(NlNode::umin(NlNode::Call1(
                Func::Sin,
                Box::new(arg.clone()),
            ))),
            Func::Tan => {
                // 1 / cos^2
                let cos = NlNode::Call1(Func::Cos, Box::new(arg.clone()));
                Some(NlNode::div(
                    NlNode::Cst(pool.intern(1.)),
                    NlNode::Mul(vec![cos.clone(), cos]),
                ))
            }
            Func::Exp => Some(NlNode::Call1(Func::Exp, Box::new(arg.clone()))),
            Func::Log => Some(NlNode::div(NlNode::Cst(pool.intern(1.)), arg.clone())),
            Func::Log10 => Some(NlNode::div(
                NlNode::Cst(pool.intern(std::f64::consts::LN_10.recip())),
                arg.clone(),
            )),
            Func::Sqrt => Some(NlNode::div(
                NlNode::Cst(pool.intern(0.5)),
                NlNode::Call1(Func::Sqrt, Box::new(arg.clone())),
            )),
            Func::Sqr => Some(NlNode::Mul(vec![
                NlNode::Cst(pool.intern(2.)),
                arg.clone(),
            ])),
            Func::Abs => {
                self.nonsmooth.set(true);
                tracing::debug!(target: "diff", "abs() differentiated; model becomes dnlp");
                Some(NlNode::Call1(Func::Sign, Box::new(arg.clone())))
            }
            Func::Sign => {
                self.nonsmooth.set(true);
                None
            }
            Func::Pow | Func::Min | Func::Max => {
                if !f.is_smooth() {
                    self.nonsmooth.set(true);
                }
                return Err(Error::NotImplemented(
                    "derivative of a non-whitelisted function",
                ));
            }
        })
    }
}

/// Recombine summands into a single node.
fn collect_sum(mut terms: Vec<NlNode>) -> Option<NlNode> {
    match terms.len() {
        0 => None,
        1 => terms.pop(),
        _ => Some(NlNode::Add(terms)),
    }
}

/// Multiply factors with light constant folding: constants are combined, a
/// unit factor disappears, and nested products are flattened.
fn fold_product(factors: Vec<NlNode>, pool: &mut Pool) -> NlNode {
    let mut cst = 1.;
    let mut rest: Vec<NlNode> = Vec::with_capacity(factors.len());
    let mut stack: Vec<NlNode> = factors;
    stack.reverse();
    while let Some(f) = stack.pop() {
        match f {
            NlNode::Cst(p) => {
                if let Some(v) = pool.get(p) {
                    cst *= v;
                } else {
                    rest.push(NlNode::Cst(p));
                }
            }
            NlNode::Mul(ch) => {
                for c in ch.into_iter().rev() {
                    stack.push(c);
                }
            }
            other => rest.push(other),
        }
    }
    if cst == 0. {
        return NlNode::Cst(pool.intern(0.));
    }
    if rest.is_empty() {
        return NlNode::Cst(pool.intern(cst));
    }
    if cst != 1. {
        rest.insert(0, NlNode::Cst(pool.intern(cst)));
    }
    if rest.len() == 1 {
        rest.pop().unwrap()
    } else {
        NlNode::Mul(rest)
    }
}

/// Split the top-level summands of a derivative into constant, linear and
/// residual parts.
fn classify(node: NlNode, pool: &Pool, out: &mut Deriv) {
    let terms = match node {
        NlNode::Add(ch) => ch,
        other => vec![other],
    };
    let mut residual = Vec::new();
    for term in terms {
        match linear_term(&term, pool, 1.) {
            Some((None, c)) => out.cst += c,
            Some((Some(vi), c)) => out.lequ.add(vi, c),
            None => residual.push(term),
        }
    }
    out.tree = collect_sum(residual);
}

/// Recognize `CST`, `VAR`, `CST*VAR` and their negations; returns
/// `(variable, coefficient)` with `variable == None` for a pure constant.
fn linear_term(node: &NlNode, pool: &Pool, sign: E) -> Option<(Option<Vi>, E)> {
    match node {
        NlNode::Cst(p) => pool.get(*p).map(|v| (None, sign * v)),
        NlNode::Var(vi) => Some((Some(*vi), sign)),
        NlNode::Umin(inner) => linear_term(inner, pool, -sign),
        NlNode::Mul(ch) if ch.len() == 2 => match (&ch[0], &ch[1]) {
            (NlNode::Cst(p), NlNode::Var(vi)) | (NlNode::Var(vi), NlNode::Cst(p)) => {
                pool.get(*p).map(|v| (Some(*vi), sign * v))
            }
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::tree::NlTree;

    fn pool() -> Rc<RefCell<Pool>> {
        Rc::new(RefCell::new(Pool::new()))
    }

    #[test]
    fn derivative_of_constant_body_is_zero_function() {
        let pool = pool();
        let tool = SdTool::new(&Lequ::new(), None, pool);
        let d = tool.deriv(0).unwrap();
        assert!(d.is_zero());
    }

    #[test]
    fn derivative_of_quadratic_is_affine() {
        // f = x^2 + 3x + 5, as lequ {x: 3}, cst 5 and tree sqr(x)
        let pool = pool();
        let mut lequ = Lequ::new();
        lequ.push(0, 3.).unwrap();
        let tree = NlTree::from_node(NlNode::Call1(Func::Sqr, Box::new(NlNode::Var(0))));
        let tool = SdTool::new(&lequ, Some(&tree), pool);
        let d = tool.deriv(0).unwrap();
        // 2x + 3
        assert_eq!(d.cst, 3.);
        assert_eq!(d.lequ.coeff(0), Some(2.));
        assert!(d.tree.is_none());
    }

    #[test]
    fn chain_rule_through_sin() {
        // d/dx sin(2x) = 2 cos(2x)
        let pool = pool();
        let two = pool.borrow_mut().intern(2.);
        let inner = NlNode::Mul(vec![NlNode::Cst(two), NlNode::Var(0)]);
        let tree = NlTree::from_node(NlNode::Call1(Func::Sin, Box::new(inner)));
        let tool = SdTool::new(&Lequ::new(), Some(&tree), pool.clone());
        let d = tool.deriv(0).unwrap();
        assert!(d.lequ.is_empty());
        let node = d.tree.expect("nonlinear derivative");
        let p = pool.borrow();
        for x in [0., 0.3, -1.2] {
            let v = node.eval(&[x], &p).unwrap();
            assert!((v - 2. * (2. * x).cos()).abs() < 1e-12);
        }
    }

    #[test]
    fn product_rule() {
        // d/dx (x*y) = y
        let pool = pool();
        let tree = NlTree::from_node(NlNode::Mul(vec![NlNode::Var(0), NlNode::Var(1)]));
        let tool = SdTool::new(&Lequ::new(), Some(&tree), pool);
        let d = tool.deriv(0).unwrap();
        assert_eq!(d.lequ.coeff(1), Some(1.));
        assert!(d.tree.is_none());
    }

    #[test]
    fn pow_with_constant_exponent() {
        // d/dx x^3 = 3 x^2
        let pool = pool();
        let three = pool.borrow_mut().intern(3.);
        let tree = NlTree::from_node(NlNode::Call2(
            Func::Pow,
            Box::new([NlNode::Var(0), NlNode::Cst(three)]),
        ));
        let tool = SdTool::new(&Lequ::new(), Some(&tree), pool.clone());
        let d = tool.deriv(0).unwrap();
        let node = d.tree.expect("nonlinear derivative");
        let p = pool.borrow();
        let v = node.eval(&[2.], &p).unwrap();
        assert!((v - 12.).abs() < 1e-12);
    }

    #[test]
    fn abs_flags_nonsmooth() {
        let pool = pool();
        let tree = NlTree::from_node(NlNode::Call1(Func::Abs, Box::new(NlNode::Var(0))));
        let tool = SdTool::new(&Lequ::new(), Some(&tree), pool);
        let d = tool.deriv(0).unwrap();
        assert!(tool.saw_nonsmooth());
        assert!(d.tree.is_some());
    }

    #[test]
    fn min_is_rejected() {
        let pool = pool();
        let tree = NlTree::from_node(NlNode::Call2(
            Func::Min,
            Box::new([NlNode::Var(0), NlNode::Var(1)]),
        ));
        let tool = SdTool::new(&Lequ::new(), Some(&tree), pool);
        assert!(matches!(
            tool.deriv(0),
            Err(Error::NotImplemented(_))
        ));
        assert!(tool.saw_nonsmooth());
    }
}
