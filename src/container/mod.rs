//! Algebraic container: the holder of variables and equations, their
//! metadata, and the cross-reference matrix.
//!
//! The cross-reference is a column view: for every variable, the list of
//! `(equation, isNL)` membership cells. It is maintained incrementally when
//! equations are installed or extended, and can be audited in O(nnz) by
//! [`Container::check_cross_reference`] (the `expensive_checks` option).

pub mod cone;
pub mod equ;
pub mod meta;
pub mod var;

use std::cell::RefCell;
use std::rc::Rc;

use crate::algebra::diff::Deriv;
use crate::algebra::pool::Pool;
use crate::algebra::tree::{NlNode, NlTree};
use crate::error::Error;
use crate::filter::{FilterOps, Fops};
use crate::{E, Ei, IDX_NA, Idx, Vi, valid_idx};

pub use cone::Cone;
pub use equ::{Equ, EquObject};
pub use meta::{EquMeta, EquPpty, EquRole, VarBasicType, VarMeta, VarPpty, VarRole};
pub use var::{Var, VarType};

/// One membership cell of the column view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmatCell {
    pub ei: Ei,
    pub is_nl: bool,
}

/// How a perp pair is typed in the metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairKind {
    /// `(Primal, ViFunction)`: a variable matched with a VI function or a
    /// stationarity row.
    ViFunction,
    /// `(Dual, Constraint)`: a multiplier matched with a constraint.
    Constraint,
}

/// Record of an equation replaced by a transformed companion, used when
/// reporting solutions back to a parent model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EquSubst {
    pub ei: Ei,
    pub flipped: bool,
}

#[derive(Debug, Default)]
pub struct Container {
    vars: Vec<Var>,
    equs: Vec<Equ>,
    /// Active counts; allocated slots may exceed these.
    n: usize,
    m: usize,
    pool: Rc<RefCell<Pool>>,
    /// Column view: per variable, its membership cells.
    cmat: Vec<Vec<CmatCell>>,
    pub varmeta: Option<Vec<VarMeta>>,
    pub equmeta: Option<Vec<EquMeta>>,
    /// Equations kept only for evaluation at reporting time (objective
    /// equations and VI functions of a reformulated parent).
    pub func2eval: Vec<Ei>,
    /// Per equation: the parent-model equation it was inherited from, or
    /// [`IDX_NA`] when the body is defined here.
    equ_inherited: Vec<Idx>,
    /// Transformed companions, looked up by original equation index.
    equ_subst: Vec<Option<EquSubst>>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// A container sharing an existing constant pool (mandatory for a model
    /// derived from another one).
    pub fn with_pool(pool: Rc<RefCell<Pool>>) -> Self {
        Container {
            pool,
            ..Container::default()
        }
    }

    pub fn pool(&self) -> Rc<RefCell<Pool>> {
        Rc::clone(&self.pool)
    }

    /// Number of active variables.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Number of active equations.
    pub fn m(&self) -> usize {
        self.m
    }

    /// Allocated variable slots, removed ones included.
    pub fn total_n(&self) -> usize {
        self.vars.len()
    }

    /// Allocated equation slots, removed ones included.
    pub fn total_m(&self) -> usize {
        self.equs.len()
    }

    /// Grow the container to `n` active variables and `m` active equations.
    /// Existing entities are untouched; new slots hold free variables and
    /// empty cone inclusions for the front end to populate.
    pub fn resize(&mut self, n: usize, m: usize) -> Result<(), Error> {
        if n < self.vars.len() || m < self.equs.len() {
            return Err(Error::InvalidArgument(format!(
                "resize({n}, {m}) would shrink a container of {} x {}",
                self.vars.len(),
                self.equs.len()
            )));
        }
        for idx in self.vars.len()..n {
            self.vars.push(Var::free(idx));
            self.cmat.push(Vec::new());
        }
        for idx in self.equs.len()..m {
            self.equs.push(Equ::cone_inclusion(idx, Cone::Zero));
            self.equ_inherited.push(IDX_NA);
            self.equ_subst.push(None);
        }
        self.n = n;
        self.m = m;
        self.sync_meta_len();
        Ok(())
    }

    /// Allocate inactive slots up to the given totals without touching the
    /// active counts. Transformations fill these slots one by one.
    pub fn reserve_totals(&mut self, total_n: usize, total_m: usize) {
        for idx in self.vars.len()..total_n {
            let mut v = Var::free(idx);
            v.active = false;
            self.vars.push(v);
            self.cmat.push(Vec::new());
        }
        for idx in self.equs.len()..total_m {
            let mut e = Equ::empty_mapping(idx);
            e.active = false;
            self.equs.push(e);
            self.equ_inherited.push(IDX_NA);
            self.equ_subst.push(None);
        }
        self.sync_meta_len();
    }

    fn sync_meta_len(&mut self) {
        if let Some(vm) = &mut self.varmeta {
            vm.resize_with(self.vars.len(), VarMeta::default);
        }
        if let Some(em) = &mut self.equmeta {
            em.resize_with(self.equs.len(), EquMeta::default);
        }
    }

    /// Allocate the metadata arrays if absent.
    pub fn ensure_metadata(&mut self) {
        if self.varmeta.is_none() {
            self.varmeta = Some(vec![VarMeta::default(); self.vars.len()]);
        }
        if self.equmeta.is_none() {
            self.equmeta = Some(vec![EquMeta::default(); self.equs.len()]);
        }
        self.sync_meta_len();
    }

    pub fn var(&self, vi: Vi) -> Result<&Var, Error> {
        self.vars.get(vi).ok_or(Error::IndexOutOfRange {
            idx: vi,
            len: self.vars.len(),
        })
    }

    pub fn var_mut(&mut self, vi: Vi) -> Result<&mut Var, Error> {
        let len = self.vars.len();
        self.vars
            .get_mut(vi)
            .ok_or(Error::IndexOutOfRange { idx: vi, len })
    }

    pub fn equ(&self, ei: Ei) -> Result<&Equ, Error> {
        self.equs.get(ei).ok_or(Error::IndexOutOfRange {
            idx: ei,
            len: self.equs.len(),
        })
    }

    pub fn equ_mut(&mut self, ei: Ei) -> Result<&mut Equ, Error> {
        let len = self.equs.len();
        self.equs
            .get_mut(ei)
            .ok_or(Error::IndexOutOfRange { idx: ei, len })
    }

    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    pub fn equs(&self) -> &[Equ] {
        &self.equs
    }

    /// Append a variable in the next free slot.
    pub fn add_var(&mut self, mut var: Var) -> Vi {
        let vi = self.vars.len();
        var.idx = vi;
        var.active = true;
        self.vars.push(var);
        self.cmat.push(Vec::new());
        self.n += 1;
        self.sync_meta_len();
        vi
    }

    /// Activate a reserved variable slot.
    pub fn install_var(&mut self, vi: Vi, mut var: Var) -> Result<(), Error> {
        if vi >= self.vars.len() {
            return Err(Error::IndexOutOfRange {
                idx: vi,
                len: self.vars.len(),
            });
        }
        if self.vars[vi].active {
            return Err(Error::UnexpectedData(format!(
                "variable slot {vi} is already in use"
            )));
        }
        var.idx = vi;
        var.active = true;
        self.vars[vi] = var;
        self.n += 1;
        Ok(())
    }

    /// Append an equation in the next free slot and index its body in the
    /// cross-reference matrix.
    pub fn add_equ(&mut self, mut equ: Equ) -> Result<Ei, Error> {
        let ei = self.equs.len();
        equ.idx = ei;
        equ.active = true;
        self.equs.push(equ);
        self.equ_inherited.push(IDX_NA);
        self.equ_subst.push(None);
        self.m += 1;
        self.sync_meta_len();
        self.finalize_add_equ(ei)?;
        Ok(ei)
    }

    /// Activate a reserved equation slot and index its body.
    pub fn install_equ(&mut self, ei: Ei, mut equ: Equ) -> Result<(), Error> {
        if ei >= self.equs.len() {
            return Err(Error::IndexOutOfRange {
                idx: ei,
                len: self.equs.len(),
            });
        }
        if self.equs[ei].active {
            return Err(Error::UnexpectedData(format!(
                "equation slot {ei} is already in use"
            )));
        }
        equ.idx = ei;
        equ.active = true;
        self.equs[ei] = equ;
        self.m += 1;
        self.finalize_add_equ(ei)
    }

    /// Index an equation body: one cell per linear term, then one `isNL`
    /// cell per tree variable not already present in the column list.
    ///
    /// A front end that populates a resized slot through [`Container::equ_mut`]
    /// must call this once the body is complete.
    pub fn finalize_add_equ(&mut self, ei: Ei) -> Result<(), Error> {
        if let Some(tree) = &mut self.equs[ei].tree {
            tree.refresh_vlist();
        }
        let equ = &self.equs[ei];
        let linear: Vec<Vi> = equ.lequ.iter().map(|(vi, _)| vi).collect();
        let nonlinear: Vec<Vi> = equ
            .tree
            .as_ref()
            .map(|t| t.vlist().to_vec())
            .unwrap_or_default();
        for vi in linear {
            self.cmat_add_cell(vi, ei, false)?;
        }
        for vi in nonlinear {
            self.cmat_add_cell(vi, ei, true)?;
        }
        Ok(())
    }

    fn cmat_add_cell(&mut self, vi: Vi, ei: Ei, is_nl: bool) -> Result<(), Error> {
        let col = self.cmat.get_mut(vi).ok_or(Error::IndexOutOfRange {
            idx: vi,
            len: self.vars.len(),
        })?;
        if !col.iter().any(|cell| cell.ei == ei) {
            col.push(CmatCell { ei, is_nl });
        }
        Ok(())
    }

    /// Mark an equation removed. The column cells stay behind; the active
    /// filter skips them through the presence flag.
    pub fn deactivate_equ(&mut self, ei: Ei) -> Result<(), Error> {
        let equ = self.equ_mut(ei)?;
        if equ.active {
            equ.active = false;
            self.m -= 1;
            if let Some(em) = &mut self.equmeta {
                em[ei].ppty |= EquPpty::IS_DELETED;
            }
        }
        Ok(())
    }

    pub fn deactivate_var(&mut self, vi: Vi) -> Result<(), Error> {
        let var = self.var_mut(vi)?;
        if var.active {
            var.active = false;
            self.n -= 1;
            if let Some(vm) = &mut self.varmeta {
                vm[vi].ppty |= VarPpty::IS_DELETED;
            }
        }
        Ok(())
    }

    /// Record that `ei` was replaced by a transformed companion.
    pub fn set_equ_subst(&mut self, ei: Ei, subst: EquSubst) -> Result<(), Error> {
        if ei >= self.equs.len() {
            return Err(Error::IndexOutOfRange {
                idx: ei,
                len: self.equs.len(),
            });
        }
        self.equ_subst[ei] = Some(subst);
        Ok(())
    }

    pub fn equ_subst(&self, ei: Ei) -> Option<EquSubst> {
        self.equ_subst.get(ei).copied().flatten()
    }

    /// Mark `ei` as inherited from parent equation `ei_up`.
    pub fn set_equ_inherited(&mut self, ei: Ei, ei_up: Ei) -> Result<(), Error> {
        if ei >= self.equs.len() {
            return Err(Error::IndexOutOfRange {
                idx: ei,
                len: self.equs.len(),
            });
        }
        self.equ_inherited[ei] = ei_up;
        Ok(())
    }

    pub fn equ_inherited(&self, ei: Ei) -> Option<Ei> {
        match self.equ_inherited.get(ei) {
            Some(&up) if valid_idx(up) => Some(up),
            _ => None,
        }
    }

    /// Relation object and cone of an equation.
    pub fn get_equ_type(&self, ei: Ei) -> Result<(EquObject, Cone), Error> {
        let equ = self.equ(ei)?;
        Ok((equ.object, equ.cone))
    }

    pub fn set_equ_type(&mut self, ei: Ei, object: EquObject, cone: Cone) -> Result<(), Error> {
        let equ = self.equ_mut(ei)?;
        equ.object = object;
        equ.cone = cone;
        Ok(())
    }

    /// Paired equation of a variable, if any.
    pub fn var_perp(&self, vi: Vi) -> Option<Ei> {
        self.varmeta
            .as_ref()
            .and_then(|vm| vm.get(vi))
            .map(|meta| meta.dual)
            .filter(|&ei| valid_idx(ei))
    }

    pub fn equ_perp(&self, ei: Ei) -> Option<Vi> {
        self.equmeta
            .as_ref()
            .and_then(|em| em.get(ei))
            .map(|meta| meta.dual)
            .filter(|&vi| valid_idx(vi))
    }

    /// Perp-pair an equation with a variable, updating both metadata sides.
    /// Conflicting re-pairing is refused.
    pub fn set_equ_var_perp(&mut self, ei: Ei, vi: Vi, kind: PairKind) -> Result<(), Error> {
        if ei >= self.equs.len() {
            return Err(Error::IndexOutOfRange {
                idx: ei,
                len: self.equs.len(),
            });
        }
        if vi >= self.vars.len() {
            return Err(Error::IndexOutOfRange {
                idx: vi,
                len: self.vars.len(),
            });
        }
        self.ensure_metadata();
        let vm = self.varmeta.as_mut().unwrap();
        let em = self.equmeta.as_mut().unwrap();
        if valid_idx(vm[vi].dual) && vm[vi].dual != ei {
            return Err(Error::UnexpectedData(format!(
                "variable {vi} is already paired with equation {}",
                vm[vi].dual
            )));
        }
        if valid_idx(em[ei].dual) && em[ei].dual != vi {
            return Err(Error::UnexpectedData(format!(
                "equation {ei} is already paired with variable {}",
                em[ei].dual
            )));
        }
        vm[vi].dual = ei;
        em[ei].dual = vi;
        match kind {
            PairKind::ViFunction => {
                vm[vi].role = VarRole::Primal;
                vm[vi].ppty |= VarPpty::PERP_TO_VI_FUNCTION;
                em[ei].role = EquRole::ViFunction;
            }
            PairKind::Constraint => {
                vm[vi].role = VarRole::Dual;
                vm[vi].ppty |= VarPpty::IS_MULTIPLIER;
                em[ei].role = EquRole::Constraint;
            }
        }
        Ok(())
    }

    /// Iterate the variables of an equation as `(vi, jacval, isNL)` triples.
    /// The Jacobian value is defined only for the linear part; nonlinear
    /// membership reports a zero value with the NL flag set.
    pub fn equ_vars(&self, ei: Ei) -> Result<impl Iterator<Item = (Vi, E, bool)> + '_, Error> {
        let equ = self.equ(ei)?;
        let nl_only = equ
            .tree
            .as_ref()
            .map(|t| {
                t.vlist()
                    .iter()
                    .copied()
                    .filter(|&vi| equ.lequ.coeff(vi).is_none())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let has_tree = !equ.is_affine();
        Ok(equ
            .lequ
            .iter()
            .map(move |(vi, c)| {
                let is_nl = has_tree
                    && equ
                        .tree
                        .as_ref()
                        .is_some_and(|t| t.vlist().contains(&vi));
                (vi, c, is_nl)
            })
            .chain(nl_only.into_iter().map(|vi| (vi, 0., true))))
    }

    /// Iterate the equations a variable appears in, as `(ei, jacval, isNL)`.
    pub fn var_equs(&self, vi: Vi) -> Result<impl Iterator<Item = (Ei, E, bool)> + '_, Error> {
        let col = self.cmat.get(vi).ok_or(Error::IndexOutOfRange {
            idx: vi,
            len: self.vars.len(),
        })?;
        Ok(col.iter().map(move |cell| {
            let jacval = self.equs[cell.ei].lequ.coeff(vi).unwrap_or(0.);
            (cell.ei, jacval, cell.is_nl)
        }))
    }

    /// Raw column view of a variable.
    pub fn var_column(&self, vi: Vi) -> Result<&[CmatCell], Error> {
        self.cmat.get(vi).map(Vec::as_slice).ok_or({
            Error::IndexOutOfRange {
                idx: vi,
                len: self.vars.len(),
            }
        })
    }

    /// Add a linear term to a row, keeping the column view in sync.
    pub fn equ_add_lvar(&mut self, ei: Ei, vi: Vi, coeff: E) -> Result<(), Error> {
        if ei >= self.equs.len() {
            return Err(Error::IndexOutOfRange {
                idx: ei,
                len: self.equs.len(),
            });
        }
        self.equs[ei].lequ.add(vi, coeff);
        self.cmat_add_cell(vi, ei, false)
    }

    /// Fuse a derivative body into a row with the given sign.
    pub fn equ_add_deriv(&mut self, ei: Ei, deriv: &Deriv, sign: E) -> Result<(), Error> {
        if ei >= self.equs.len() {
            return Err(Error::IndexOutOfRange {
                idx: ei,
                len: self.equs.len(),
            });
        }
        self.equs[ei].cst += sign * deriv.cst;
        let terms: Vec<(Vi, E)> = deriv.lequ.iter().collect();
        for (vi, c) in terms {
            self.equ_add_lvar(ei, vi, sign * c)?;
        }
        if let Some(node) = &deriv.tree {
            let term = if sign < 0. {
                NlNode::umin(node.clone())
            } else {
                node.clone()
            };
            let equ = &mut self.equs[ei];
            equ.tree.get_or_insert_with(NlTree::new).push_term(term);
            let nl_vars: Vec<Vi> = self.equs[ei]
                .tree
                .as_ref()
                .map(|t| t.vlist().to_vec())
                .unwrap_or_default();
            for vi in nl_vars {
                self.cmat_add_cell(vi, ei, true)?;
            }
        }
        Ok(())
    }

    /// Subtract `multiplier * body` from a row: the normal-cone contribution
    /// of a nonlinear constraint. The constant part stays linear in the
    /// multiplier; everything else becomes tree terms.
    pub fn equ_sub_mul_deriv(&mut self, ei: Ei, deriv: &Deriv, vi_mult: Vi) -> Result<(), Error> {
        if ei >= self.equs.len() {
            return Err(Error::IndexOutOfRange {
                idx: ei,
                len: self.equs.len(),
            });
        }
        if deriv.cst != 0. {
            self.equ_add_lvar(ei, vi_mult, -deriv.cst)?;
        }
        let terms: Vec<(Vi, E)> = deriv.lequ.iter().collect();
        let mut pool = self.pool.borrow_mut();
        for (vi, c) in terms {
            let term = NlNode::Mul(vec![
                NlNode::Cst(pool.intern(-c)),
                NlNode::Var(vi),
                NlNode::Var(vi_mult),
            ]);
            self.equs[ei].tree.get_or_insert_with(NlTree::new).push_term(term);
        }
        if let Some(node) = &deriv.tree {
            let term = NlNode::umin(NlNode::Mul(vec![NlNode::Var(vi_mult), node.clone()]));
            self.equs[ei].tree.get_or_insert_with(NlTree::new).push_term(term);
        }
        drop(pool);
        let nl_vars: Vec<Vi> = self.equs[ei]
            .tree
            .as_ref()
            .map(|t| t.vlist().to_vec())
            .unwrap_or_default();
        for vi in nl_vars {
            self.cmat_add_cell(vi, ei, true)?;
        }
        Ok(())
    }

    /// Canonicalize a row: refresh the tree variable cache, drop an empty
    /// tree, and make the column view match the body exactly (cells for
    /// variables whose coefficients canceled out are removed).
    pub fn fix_equ(&mut self, ei: Ei) -> Result<(), Error> {
        if ei >= self.equs.len() {
            return Err(Error::IndexOutOfRange {
                idx: ei,
                len: self.equs.len(),
            });
        }
        if let Some(tree) = &mut self.equs[ei].tree {
            tree.refresh_vlist();
            if tree.is_empty() {
                self.equs[ei].tree = None;
            }
        }
        self.sync_equ_cmat(ei)?;
        let equ = &self.equs[ei];
        let in_body: Vec<bool> = (0..self.vars.len())
            .map(|vi| {
                equ.lequ.coeff(vi).is_some()
                    || equ.tree.as_ref().is_some_and(|t| t.vlist().contains(&vi))
            })
            .collect();
        for (vi, col) in self.cmat.iter_mut().enumerate() {
            col.retain(|cell| cell.ei != ei || in_body[vi]);
        }
        Ok(())
    }

    /// Make the column view consistent with the row body.
    pub fn sync_equ_cmat(&mut self, ei: Ei) -> Result<(), Error> {
        let linear: Vec<Vi> = self.equs[ei].lequ.iter().map(|(vi, _)| vi).collect();
        let nonlinear: Vec<Vi> = self.equs[ei]
            .tree
            .as_ref()
            .map(|t| t.vlist().to_vec())
            .unwrap_or_default();
        for vi in linear {
            self.cmat_add_cell(vi, ei, false)?;
        }
        for vi in nonlinear {
            self.cmat_add_cell(vi, ei, true)?;
        }
        Ok(())
    }

    /// O(nnz) audit of the cross-reference matrix against the equation
    /// bodies. Every violation is logged; the first error is returned.
    pub fn check_cross_reference(&self) -> Result<(), Error> {
        let mut status = Ok(());
        for equ in self.equs.iter().filter(|e| e.active) {
            for (vi, _, _) in self.equ_vars(equ.idx)? {
                let present = self
                    .cmat
                    .get(vi)
                    .is_some_and(|col| col.iter().any(|cell| cell.ei == equ.idx));
                if !present {
                    tracing::error!(
                        target: "container",
                        "variable {vi} of equation {} has no membership cell",
                        equ.idx
                    );
                    status = Error::fold(
                        status,
                        Error::Inconsistency(format!(
                            "missing membership cell ({vi}, {})",
                            equ.idx
                        )),
                    );
                }
            }
        }
        for (vi, col) in self.cmat.iter().enumerate() {
            for cell in col {
                let equ = self.equ(cell.ei)?;
                if !equ.active {
                    continue;
                }
                let in_lin = equ.lequ.coeff(vi).is_some();
                let in_tree = equ
                    .tree
                    .as_ref()
                    .is_some_and(|t| t.vlist().contains(&vi));
                if !in_lin && !in_tree {
                    tracing::error!(
                        target: "container",
                        "stale membership cell ({vi}, {})",
                        cell.ei
                    );
                    status = Error::fold(
                        status,
                        Error::Inconsistency(format!("stale membership cell ({vi}, {})", cell.ei)),
                    );
                }
            }
        }
        status
    }

    /// Copy the kept variables into `dst` in permutation order and return
    /// the rosetta mapping source indices to destination ones (`IDX_NA` for
    /// dropped entries).
    pub fn compress_vars(&self, fops: &Fops, dst: &mut Container) -> Result<Vec<Idx>, Error> {
        let mut kept: Vec<Vi> = (0..self.vars.len())
            .filter(|&vi| self.vars[vi].active && fops.keep_var(self, vi))
            .collect();
        kept.sort_by_key(|&vi| fops.vars_permutation(self, vi));

        let mut rosetta = vec![IDX_NA; self.vars.len()];
        let copy_meta = self.varmeta.is_some();
        if copy_meta {
            dst.ensure_metadata();
        }
        for &vi in &kept {
            let mut var = self.vars[vi].clone();
            var.active = true;
            let vi_new = if dst.vars.iter().any(|v| !v.active) {
                // fill reserved slots first
                let slot = dst.vars.iter().position(|v| !v.active).unwrap();
                var.idx = slot;
                dst.vars[slot] = var;
                dst.n += 1;
                slot
            } else {
                dst.add_var(var)
            };
            rosetta[vi] = vi_new;
            if let (Some(src_meta), Some(dst_meta)) = (&self.varmeta, &mut dst.varmeta) {
                let mut meta = src_meta[vi];
                meta.dual = IDX_NA;
                dst_meta[vi_new] = meta;
            }
        }
        Ok(rosetta)
    }

    /// Copy the kept equations into `dst`, remapping bodies through
    /// `rosetta_vars`. Equations listed in `drop_equs` (e.g. objective
    /// equations removed by a reformulation) are dropped explicitly.
    pub fn compress_equs(
        &self,
        fops: &Fops,
        drop_equs: &[Ei],
        rosetta_vars: &[Idx],
        dst: &mut Container,
    ) -> Result<Vec<Idx>, Error> {
        let mut rosetta = vec![IDX_NA; self.equs.len()];
        let copy_meta = self.equmeta.is_some();
        if copy_meta {
            dst.ensure_metadata();
        }
        for ei in 0..self.equs.len() {
            if !self.equs[ei].active || !fops.keep_equ(self, ei) || drop_equs.contains(&ei) {
                continue;
            }
            let src = &self.equs[ei];
            let mut equ = Equ {
                idx: 0,
                object: src.object,
                cone: src.cone,
                cst: src.cst,
                value: src.value,
                multiplier: src.multiplier,
                basis: src.basis,
                lequ: src.lequ.dup_rosetta(rosetta_vars)?,
                tree: match &src.tree {
                    Some(tree) => {
                        let t = tree.dup_rosetta(rosetta_vars)?;
                        (!t.is_empty()).then_some(t)
                    }
                    None => None,
                },
                active: true,
            };
            equ.idx = dst.equs.len();
            let ei_new = dst.add_equ(equ)?;
            rosetta[ei] = ei_new;
            if let (Some(src_meta), Some(dst_meta)) = (&self.equmeta, &mut dst.equmeta) {
                let mut meta = src_meta[ei];
                meta.dual = IDX_NA;
                dst_meta[ei_new] = meta;
            }
        }
        Ok(rosetta)
    }
}
