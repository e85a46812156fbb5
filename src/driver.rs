//! Solver-facing view of a finalized MCP model.
//!
//! A complementarity solver consumes the bounds, starting point and basis,
//! plus the sparse Jacobian structure in column-compressed form: `p` of
//! length `n + 1` and `i` of length `nnz`, where each cell identifies the
//! equation whose Jacobian entry it represents. On the way back, the driver
//! writes `x`, `F` and a basis vector, from which the engine reconstructs
//! equation values and multipliers.

use derive_more::{Display, Error as DeriveError};
use faer::Col;
use faer::sparse::{SparseColMat, Triplet};
use problemo::{Problem, ProblemResult};

use crate::error::Error;
use crate::model::Model;
use crate::{BasisStatus, E, Ei, Idx, ModelType};

#[derive(Debug, Display, DeriveError, PartialEq)]
pub enum DriverError {
    #[display("the model handed to the driver is not a checked MCP")]
    NotAnMcp,

    #[display("dimension mismatch in the solution write-back")]
    DimensionMismatch,

    #[display("sparse jacobian assembly failed")]
    JacobianAssembly,

    #[display("solution write-back failed")]
    WriteBack,

    #[display("function evaluation failed")]
    Evaluation,
}

/// One cell of the column-compressed Jacobian structure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JacCell {
    /// The equation this entry belongs to.
    pub ei: Ei,
    /// Jacobian value of the linear part; zero on nonlinear cells, whose
    /// value the solver obtains through its evaluation callback.
    pub val: E,
    pub is_nl: bool,
}

/// Everything a complementarity solver queries before and after a solve.
pub struct McpDriverData {
    n: usize,
    m: usize,
    lb: Col<E>,
    ub: Col<E>,
    x0: Col<E>,
    basis: Vec<BasisStatus>,
    /// Column offsets, length `n + 1`.
    jac_p: Vec<usize>,
    /// Cells, length `nnz`, ordered column-major with ascending rows.
    jac_cells: Vec<JacCell>,
    /// Per equation: whether its body is nonlinear (for presolve).
    equ_is_nl: Vec<bool>,
    var_names: Vec<String>,
    equ_names: Vec<String>,
}

impl McpDriverData {
    /// Extract the solver view from a checked MCP model.
    pub fn from_model(mdl: &Model) -> Result<Self, Problem> {
        build(mdl).via(DriverError::NotAnMcp)
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn lb(&self) -> &Col<E> {
        &self.lb
    }

    pub fn ub(&self) -> &Col<E> {
        &self.ub
    }

    pub fn x0(&self) -> &Col<E> {
        &self.x0
    }

    pub fn basis(&self) -> &[BasisStatus] {
        &self.basis
    }

    /// Column offsets of the Jacobian structure, length `n + 1`.
    pub fn jac_p(&self) -> &[usize] {
        &self.jac_p
    }

    /// Row indices of the Jacobian structure, length `nnz`.
    pub fn jac_i(&self) -> Vec<usize> {
        self.jac_cells.iter().map(|cell| cell.ei).collect()
    }

    pub fn jac_cells(&self) -> &[JacCell] {
        &self.jac_cells
    }

    /// The Jacobian pattern as a sparse matrix; linear entries carry their
    /// value, nonlinear ones a zero placeholder.
    pub fn jacobian_pattern(&self) -> Result<SparseColMat<Idx, E>, Problem> {
        let mut triplets: Vec<Triplet<Idx, Idx, E>> = Vec::with_capacity(self.jac_cells.len());
        for col in 0..self.n {
            for cell in &self.jac_cells[self.jac_p[col]..self.jac_p[col + 1]] {
                triplets.push(Triplet::new(cell.ei, col, cell.val));
            }
        }
        SparseColMat::try_new_from_triplets(self.m, self.n, triplets.as_slice())
            .via(DriverError::JacobianAssembly)
    }
}

fn build(mdl: &Model) -> Result<McpDriverData, Error> {
    if mdl.probtype() != ModelType::Mcp {
        return Err(Error::WrongModelForFunction {
            expected: "mcp",
            got: mdl.probtype().name(),
        });
    }
    let ctr = &mdl.ctr;
    let n = ctr.n();
    let m = ctr.m();
    if n != m {
        return Err(Error::Inconsistency(format!(
            "MCP model '{}' is not square: {n} variables, {m} equations",
            mdl.name()
        )));
    }

    let mut lb = Col::zeros(n);
    let mut ub = Col::zeros(n);
    let mut x0 = Col::zeros(n);
    let mut basis = Vec::with_capacity(n + m);
    for vi in 0..n {
        let var = ctr.var(vi)?;
        lb[vi] = var.lb;
        ub[vi] = var.ub;
        x0[vi] = var.value;
        basis.push(var.basis);
    }
    for ei in 0..m {
        basis.push(ctr.equ(ei)?.basis);
    }

    let mut jac_p = Vec::with_capacity(n + 1);
    let mut jac_cells = Vec::new();
    jac_p.push(0);
    for vi in 0..n {
        let mut col: Vec<JacCell> = ctr
            .var_equs(vi)?
            .filter(|&(ei, _, _)| ei < m)
            .map(|(ei, val, is_nl)| JacCell { ei, val, is_nl })
            .collect();
        col.sort_by_key(|cell| cell.ei);
        jac_cells.extend_from_slice(&col);
        jac_p.push(jac_cells.len());
    }

    let equ_is_nl = (0..m)
        .map(|ei| ctr.equ(ei).map(|e| !e.is_affine()))
        .collect::<Result<Vec<_>, _>>()?;

    /* Reporting names, derived from the roles: primal variables keep their
     * index, multipliers and function rows are labeled by what they match. */
    let var_names = (0..n)
        .map(|vi| {
            let is_mult = ctr
                .varmeta
                .as_ref()
                .is_some_and(|vm| vm[vi].role == crate::container::VarRole::Dual);
            if is_mult {
                format!("mult_{vi}")
            } else {
                format!("x_{vi}")
            }
        })
        .collect();
    let equ_names = (0..m)
        .map(|ei| {
            let role = ctr.equmeta.as_ref().map(|em| em[ei].role);
            match role {
                Some(crate::container::EquRole::Constraint) => format!("cons_{ei}"),
                _ if ctr
                    .equ(ei)
                    .map(|e| e.is_affine() && e.lequ.is_empty() && e.cst == 0.)
                    .unwrap_or(false) =>
                {
                    format!("vizerofunc_{ei}")
                }
                _ => format!("F_{ei}"),
            }
        })
        .collect();

    Ok(McpDriverData {
        n,
        m,
        lb,
        ub,
        x0,
        basis,
        jac_p,
        jac_cells,
        equ_is_nl,
        var_names,
        equ_names,
    })
}

impl McpDriverData {
    /// Whether an equation needs the nonlinear evaluation callback.
    pub fn equ_is_nl(&self, ei: Ei) -> bool {
        self.equ_is_nl.get(ei).copied().unwrap_or(false)
    }

    /// Reporting name of a variable.
    pub fn var_name(&self, vi: usize) -> Option<&str> {
        self.var_names.get(vi).map(String::as_str)
    }

    /// Reporting name of an equation.
    pub fn equ_name(&self, ei: Ei) -> Option<&str> {
        self.equ_names.get(ei).map(String::as_str)
    }
}

/// Evaluate one row's body at the solver's iterate: the function-evaluation
/// callback of the driver.
pub fn eval_equ(mdl: &Model, ei: Ei, x: &Col<E>) -> Result<E, Problem> {
    eval_body(mdl, ei, x).via(DriverError::Evaluation)
}

fn eval_body(mdl: &Model, ei: Ei, x: &Col<E>) -> Result<E, Error> {
    let xs: Vec<E> = (0..x.nrows()).map(|i| x[i]).collect();
    let pool = mdl.ctr.pool();
    let pool = pool.borrow();
    mdl.ctr.equ(ei)?.eval_body(&xs, &pool)
}

/// Write the solver's answer back into the model: levels from `x`, equation
/// values from `f`, multipliers reconstructed through the perp pairing, and
/// the basis vector split over variables and equations.
pub fn write_solution(
    mdl: &mut Model,
    x: &Col<E>,
    f: &Col<E>,
    basis: &[BasisStatus],
) -> Result<(), Problem> {
    write_back(mdl, x, f, basis).via(DriverError::WriteBack)
}

fn write_back(mdl: &mut Model, x: &Col<E>, f: &Col<E>, basis: &[BasisStatus]) -> Result<(), Error> {
    let n = mdl.ctr.n();
    let m = mdl.ctr.m();
    if x.nrows() != n || f.nrows() != m || basis.len() != n + m {
        return Err(Error::InvalidArgument(format!(
            "write-back shapes ({}, {}, {}) do not match the MCP ({n}, {m})",
            x.nrows(),
            f.nrows(),
            basis.len()
        )));
    }

    for vi in 0..n {
        let row = mdl.ctr.var_perp(vi);
        let var = mdl.ctr.var_mut(vi)?;
        var.value = x[vi];
        var.basis = basis[vi];
        var.multiplier = match row {
            Some(ei) if ei < m => f[ei],
            _ => 0.,
        };
    }
    for ei in 0..m {
        let vi = mdl.ctr.equ_perp(ei);
        let equ = mdl.ctr.equ_mut(ei)?;
        equ.value = f[ei];
        equ.basis = basis[n + ei];
        equ.multiplier = match vi {
            Some(vi) if vi < n => x[vi],
            _ => 0.,
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::tree::{Func, NlNode, NlTree};
    use crate::container::{Equ, PairKind, Var};

    /// x ⟂ row0 (2x + 3 + sin(y)), λ ⟂ row1 (x - 1).
    fn tiny_mcp() -> Model {
        let mut mdl = Model::new_rhp("mcp");
        mdl.set_probtype(ModelType::Mcp);
        let x = mdl.ctr.add_var(Var::free(0));
        let lam = mdl.ctr.add_var(Var::bounded(0, 0., E::INFINITY).unwrap());

        let mut row0 = Equ::empty_mapping(0);
        row0.cst = 3.;
        row0.lequ.push(x, 2.).unwrap();
        row0.tree = Some(NlTree::from_node(NlNode::Call1(
            Func::Sin,
            Box::new(NlNode::Var(lam)),
        )));
        let r0 = mdl.ctr.add_equ(row0).unwrap();

        let mut row1 = Equ::empty_mapping(0);
        row1.cst = -1.;
        row1.lequ.push(x, 1.).unwrap();
        let r1 = mdl.ctr.add_equ(row1).unwrap();

        mdl.ctr.set_equ_var_perp(r0, x, PairKind::ViFunction).unwrap();
        mdl.ctr.set_equ_var_perp(r1, lam, PairKind::Constraint).unwrap();
        mdl
    }

    #[test]
    fn column_compressed_structure() {
        let mdl = tiny_mcp();
        let data = McpDriverData::from_model(&mdl).unwrap();
        assert_eq!(data.n(), 2);
        assert_eq!(data.jac_p(), &[0, 2, 3]);
        let cells = data.jac_cells();
        // column x: rows 0 and 1, linear
        assert_eq!(cells[0], JacCell { ei: 0, val: 2., is_nl: false });
        assert_eq!(cells[1], JacCell { ei: 1, val: 1., is_nl: false });
        // column λ: row 0, nonlinear placeholder
        assert_eq!(cells[2], JacCell { ei: 0, val: 0., is_nl: true });
        assert!(data.equ_is_nl(0));
        assert!(!data.equ_is_nl(1));
    }

    #[test]
    fn jacobian_pattern_matches_cells() {
        let mdl = tiny_mcp();
        let data = McpDriverData::from_model(&mdl).unwrap();
        let pattern = data.jacobian_pattern().unwrap();
        assert_eq!(pattern.nrows(), 2);
        assert_eq!(pattern.ncols(), 2);
        assert_eq!(pattern.compute_nnz(), 3);
    }

    #[test]
    fn non_mcp_models_are_refused() {
        let mut mdl = Model::new_rhp("nlp");
        mdl.set_probtype(ModelType::Nlp);
        assert!(McpDriverData::from_model(&mdl).is_err());
    }

    #[test]
    fn write_back_reconstructs_multipliers() {
        let mut mdl = tiny_mcp();
        let x = Col::from_fn(2, |i| [2., 0.5][i]);
        let f = Col::from_fn(2, |i| [7.479, 1.][i]);
        let basis = vec![
            BasisStatus::Basic,
            BasisStatus::Lower,
            BasisStatus::Basic,
            BasisStatus::Basic,
        ];
        write_solution(&mut mdl, &x, &f, &basis).unwrap();
        assert_eq!(mdl.ctr.var(0).unwrap().value, 2.);
        // x is paired with row 0: its multiplier is F_0
        assert_eq!(mdl.ctr.var(0).unwrap().multiplier, 7.479);
        // row 1 is paired with λ: its multiplier is x_1
        assert_eq!(mdl.ctr.equ(1).unwrap().multiplier, 0.5);
        assert_eq!(mdl.ctr.equ(0).unwrap().value, 7.479);
    }

    #[test]
    fn names_and_evaluation_callback() {
        let mdl = tiny_mcp();
        let data = McpDriverData::from_model(&mdl).unwrap();
        assert_eq!(data.var_name(0), Some("x_0"));
        assert_eq!(data.var_name(1), Some("mult_1"));
        assert_eq!(data.equ_name(0), Some("F_0"));
        assert_eq!(data.equ_name(1), Some("cons_1"));

        // row 0 at (x, λ) = (1, 0): 2*1 + 3 + sin(0) = 5
        let x = Col::from_fn(2, |i| [1., 0.][i]);
        let v = eval_equ(&mdl, 0, &x).unwrap();
        assert!((v - 5.).abs() < 1e-12);
    }

    #[test]
    fn write_back_rejects_bad_shapes() {
        let mut mdl = tiny_mcp();
        let x = Col::zeros(1);
        let f = Col::zeros(2);
        assert!(write_solution(&mut mdl, &x, &f, &[]).is_err());
    }
}
