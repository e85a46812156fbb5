//! Filter operators (Fops): pluggable predicates over the (variable,
//! equation) index space of a source container, with a variable-permutation
//! facet used by the subdag FOOC.
//!
//! Four flavors share one trait behind an `enum_dispatch` sum type:
//! - [`FopsEmpty`] keeps nothing (destination model before population);
//! - [`FopsActive`] keeps exactly the present, non-deleted entities;
//! - [`FopsSubset`] keeps explicitly listed entities;
//! - [`FopsSubDag`] keeps entities owned by the MPs of an EMPDAG subdag.

use enum_dispatch::enum_dispatch;

use crate::algebra::lequ::Lequ;
use crate::algebra::tree::NlTree;
use crate::container::{Container, VarPpty};
use crate::empdag::uid::{DagUid, MpId, valid_mpid};
use crate::empdag::EmpDag;
use crate::error::Error;
use crate::{Ei, IDX_NA, Idx, Vi};

/// Type tag of a filter operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FopsType {
    Empty,
    Active,
    Subset,
    SubDag,
}

impl FopsType {
    pub fn name(self) -> &'static str {
        match self {
            FopsType::Empty => "empty",
            FopsType::Active => "active",
            FopsType::Subset => "subset",
            FopsType::SubDag => "subdag",
        }
    }
}

#[enum_dispatch]
pub trait FilterOps {
    fn kind(&self) -> FopsType;

    /// Compressed sizes: number of kept variables and equations.
    fn get_sizes(&self, ctr: &Container) -> (usize, usize);

    /// Total predicate on the variable index space.
    fn keep_var(&self, ctr: &Container, vi: Vi) -> bool;

    /// Total predicate on the equation index space.
    fn keep_equ(&self, ctr: &Container, ei: Ei) -> bool;

    /// Rank of a variable in the compressed ordering. The subdag variant
    /// groups variables of the same MP contiguously; the other variants
    /// keep the source order.
    fn vars_permutation(&self, _ctr: &Container, vi: Vi) -> Idx {
        vi
    }

    /// Number of equations this filter removes.
    fn deactivated_equs_len(&self, ctr: &Container) -> usize {
        (0..ctr.total_m())
            .filter(|&ei| !self.keep_equ(ctr, ei))
            .count()
    }

    /// Rewrite a linear part through the compression rosetta.
    fn transform_lequ(&self, src: &Lequ, rosetta_vars: &[Idx]) -> Result<Lequ, Error> {
        src.dup_rosetta(rosetta_vars)
    }

    /// Rewrite an expression tree through the compression rosetta.
    fn transform_nltree(&self, src: &NlTree, rosetta_vars: &[Idx]) -> Result<NlTree, Error> {
        src.dup_rosetta(rosetta_vars)
    }
}

/// Filter operator sum type; owned by the consuming transformation.
#[enum_dispatch(FilterOps)]
#[derive(Debug)]
pub enum Fops {
    Empty(FopsEmpty),
    Active(FopsActive),
    Subset(FopsSubset),
    SubDag(FopsSubDag),
}

/// Keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct FopsEmpty;

impl FilterOps for FopsEmpty {
    fn kind(&self) -> FopsType {
        FopsType::Empty
    }

    fn get_sizes(&self, _ctr: &Container) -> (usize, usize) {
        (0, 0)
    }

    fn keep_var(&self, _ctr: &Container, _vi: Vi) -> bool {
        false
    }

    fn keep_equ(&self, _ctr: &Container, _ei: Ei) -> bool {
        false
    }

    fn transform_lequ(&self, src: &Lequ, _rosetta_vars: &[Idx]) -> Result<Lequ, Error> {
        Ok(src.clone())
    }

    fn transform_nltree(&self, src: &NlTree, _rosetta_vars: &[Idx]) -> Result<NlTree, Error> {
        Ok(src.clone())
    }
}

/// Keeps entities that are present and not tagged deleted.
#[derive(Debug, Default, Clone, Copy)]
pub struct FopsActive;

impl FilterOps for FopsActive {
    fn kind(&self) -> FopsType {
        FopsType::Active
    }

    fn get_sizes(&self, ctr: &Container) -> (usize, usize) {
        (ctr.n(), ctr.m())
    }

    fn keep_var(&self, ctr: &Container, vi: Vi) -> bool {
        match ctr.var(vi) {
            Ok(var) => {
                var.is_active()
                    && !ctr
                        .varmeta
                        .as_ref()
                        .is_some_and(|vm| vm[vi].ppty.contains(VarPpty::IS_DELETED))
            }
            Err(_) => false,
        }
    }

    fn keep_equ(&self, ctr: &Container, ei: Ei) -> bool {
        ctr.equ(ei).map(|e| e.is_active()).unwrap_or(false)
    }
}

/// Keeps entities listed in two explicit arrays; membership is answered by
/// precomputed bitmaps sized to the container totals.
#[derive(Debug, Clone)]
pub struct FopsSubset {
    vars: Vec<Vi>,
    equs: Vec<Ei>,
    var_bitmap: Vec<bool>,
    equ_bitmap: Vec<bool>,
}

impl FopsSubset {
    pub fn new(
        vars: Vec<Vi>,
        equs: Vec<Ei>,
        total_n: usize,
        total_m: usize,
    ) -> Result<Self, Error> {
        let mut var_bitmap = vec![false; total_n];
        let mut equ_bitmap = vec![false; total_m];
        for &vi in &vars {
            *var_bitmap.get_mut(vi).ok_or(Error::IndexOutOfRange {
                idx: vi,
                len: total_n,
            })? = true;
        }
        for &ei in &equs {
            *equ_bitmap.get_mut(ei).ok_or(Error::IndexOutOfRange {
                idx: ei,
                len: total_m,
            })? = true;
        }
        Ok(Self {
            vars,
            equs,
            var_bitmap,
            equ_bitmap,
        })
    }
}

impl FilterOps for FopsSubset {
    fn kind(&self) -> FopsType {
        FopsType::Subset
    }

    fn get_sizes(&self, _ctr: &Container) -> (usize, usize) {
        (self.vars.len(), self.equs.len())
    }

    fn keep_var(&self, _ctr: &Container, vi: Vi) -> bool {
        self.var_bitmap.get(vi).copied().unwrap_or(false)
    }

    fn keep_equ(&self, _ctr: &Container, ei: Ei) -> bool {
        self.equ_bitmap.get(ei).copied().unwrap_or(false)
    }
}

/// Keeps entities whose owning MP appears in the subdag rooted at a given
/// node. With `keep_all_active_vars`, every active variable is kept (those
/// outside the subdag become auxiliaries) while equations are still
/// filtered; this is the MPEC lower-level selection.
#[derive(Debug, Clone)]
pub struct FopsSubDag {
    uid_root: DagUid,
    mplist: Vec<MpId>,
    keep_all_active_vars: bool,
    var_keep: Vec<bool>,
    equ_keep: Vec<bool>,
    /// Compression rank per variable: subdag MP variables first, grouped by
    /// MP, then the auxiliaries in index order.
    var_rank: Vec<Idx>,
    n_subdag_vars: usize,
}

impl FopsSubDag {
    pub fn new(
        empdag: &EmpDag,
        ctr: &Container,
        uid_root: DagUid,
        keep_all_active_vars: bool,
    ) -> Result<Self, Error> {
        let mplist = empdag.subdag_mplist(uid_root)?;
        let total_n = ctr.total_n();
        let total_m = ctr.total_m();

        let mut var_keep = vec![false; total_n];
        let mut equ_keep = vec![false; total_m];
        let mut var_rank = vec![IDX_NA; total_n];
        let mut rank = 0;

        for &mpid in &mplist {
            let mp = empdag.mp(mpid)?;
            // the objective variable and equation belong to the MP's slice
            // of the index space even when not listed among its members
            let vars = mp.vars().iter().copied().chain(mp.objvar());
            for vi in vars {
                if vi >= total_n {
                    return Err(Error::IndexOutOfRange {
                        idx: vi,
                        len: total_n,
                    });
                }
                if ctr.var(vi)?.is_active() && var_rank[vi] == IDX_NA {
                    var_keep[vi] = true;
                    var_rank[vi] = rank;
                    rank += 1;
                }
            }
            let equs = mp.equs().iter().copied().chain(mp.objequ());
            for ei in equs {
                if ei >= total_m {
                    return Err(Error::IndexOutOfRange {
                        idx: ei,
                        len: total_m,
                    });
                }
                if ctr.equ(ei)?.is_active() {
                    equ_keep[ei] = true;
                }
            }
        }
        let n_subdag_vars = rank;

        if keep_all_active_vars {
            for vi in 0..total_n {
                if ctr.var(vi)?.is_active() && !var_keep[vi] {
                    var_keep[vi] = true;
                    var_rank[vi] = rank;
                    rank += 1;
                }
            }
        }

        Ok(Self {
            uid_root,
            mplist,
            keep_all_active_vars,
            var_keep,
            equ_keep,
            var_rank,
            n_subdag_vars,
        })
    }

    pub fn uid_root(&self) -> DagUid {
        self.uid_root
    }

    /// Whether non-subdag active variables ride along as auxiliaries.
    pub fn keeps_all_active_vars(&self) -> bool {
        self.keep_all_active_vars
    }

    pub fn mplist(&self) -> &[MpId] {
        &self.mplist
    }

    /// Number of kept variables owned by the subdag MPs (the differentiated
    /// ones); kept auxiliaries follow them in the permutation.
    pub fn n_subdag_vars(&self) -> usize {
        self.n_subdag_vars
    }

    pub fn owns_mp(&self, mpid: MpId) -> bool {
        valid_mpid(mpid) && self.mplist.binary_search(&mpid).is_ok()
    }
}

impl FilterOps for FopsSubDag {
    fn kind(&self) -> FopsType {
        FopsType::SubDag
    }

    fn get_sizes(&self, _ctr: &Container) -> (usize, usize) {
        (
            self.var_keep.iter().filter(|&&k| k).count(),
            self.equ_keep.iter().filter(|&&k| k).count(),
        )
    }

    fn keep_var(&self, _ctr: &Container, vi: Vi) -> bool {
        self.var_keep.get(vi).copied().unwrap_or(false)
    }

    fn keep_equ(&self, _ctr: &Container, ei: Ei) -> bool {
        self.equ_keep.get(ei).copied().unwrap_or(false)
    }

    fn vars_permutation(&self, _ctr: &Container, vi: Vi) -> Idx {
        self.var_rank.get(vi).copied().unwrap_or(IDX_NA)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Container;

    #[test]
    fn subset_bitmap_membership() {
        let mut ctr = Container::new();
        ctr.resize(4, 3).unwrap();
        let fops = FopsSubset::new(vec![1, 3], vec![0], 4, 3).unwrap();
        assert!(fops.keep_var(&ctr, 1));
        assert!(!fops.keep_var(&ctr, 0));
        assert!(fops.keep_equ(&ctr, 0));
        assert!(!fops.keep_equ(&ctr, 2));
        assert_eq!(fops.get_sizes(&ctr), (2, 1));
    }

    #[test]
    fn subset_rejects_out_of_range_indices() {
        assert!(FopsSubset::new(vec![5], vec![], 4, 3).is_err());
    }

    #[test]
    fn active_counts_follow_deactivation() {
        let mut ctr = Container::new();
        ctr.resize(3, 0).unwrap();
        let fops = Fops::from(FopsActive);
        assert_eq!(fops.get_sizes(&ctr), (3, 0));
        ctr.deactivate_var(1).unwrap();
        assert_eq!(fops.get_sizes(&ctr), (2, 0));
        assert!(!fops.keep_var(&ctr, 1));
    }

    #[test]
    fn empty_keeps_nothing() {
        let mut ctr = Container::new();
        ctr.resize(2, 2).unwrap();
        let fops = Fops::from(FopsEmpty);
        assert_eq!(fops.get_sizes(&ctr), (0, 0));
        assert_eq!(fops.deactivated_equs_len(&ctr), 2);
    }
}
