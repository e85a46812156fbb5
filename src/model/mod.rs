//! Model shell: a container plus an EMPDAG, a problem-type tag, and an
//! optional upstream model (the unmodified source of a transformation).
//!
//! A transformation produces a new model linked upstream; solution values
//! propagate back child → parent through [`report`]. The upstream edge is
//! reference-counted and strictly parent-directed; the [`crate::timings`]
//! struct is the only state shared across a transformation chain.

pub mod ops;
pub mod report;

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;

use crate::container::{Container, EquRole, VarRole};
use crate::empdag::uid::valid_mpid;
use crate::empdag::{EmpDag, EmpDagType};
use crate::error::Error;
use crate::fooc::McpInfo;
use crate::timings::{Stopwatch, Timings};
use crate::{Ei, Idx, ModelType, Sense, Vi, valid_idx};

pub use ops::{BackendOps, GamsOps, RhpOps, ops_for};

/// Shared handle on a model.
pub type ModelRef = Rc<RefCell<Model>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    Rhp,
    Gams,
    Ampl,
    Julia,
}

impl Backend {
    pub fn name(self) -> &'static str {
        match self {
            Backend::Rhp => "RHP",
            Backend::Gams => "GAMS",
            Backend::Ampl => "AMPL",
            Backend::Julia => "JULIA",
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ModelStatus: u8 {
        const META_CHECKED = 1 << 0;
        const CHECKED      = 1 << 1;
        const FINALIZED    = 1 << 2;
    }
}

/// An OVF/CCF annotation recorded by the front end; its presence routes the
/// model through the CCF reformulation pass before FOOC.
#[derive(Debug, Clone)]
pub struct OvfDef {
    pub name: String,
    /// The variable standing for the functional's value.
    pub vi_ovf: Vi,
    /// Argument variables of the functional.
    pub args: Vec<Vi>,
}

/// EMP information attached to a model.
#[derive(Debug, Default)]
pub struct EmpInfo {
    pub empdag: EmpDag,
    pub ovf: Vec<OvfDef>,
}

impl EmpInfo {
    pub fn has_empdag(&self) -> bool {
        self.empdag.exists()
    }
}

#[derive(Debug)]
pub struct Model {
    backend: Backend,
    name: String,
    probtype: ModelType,
    status: ModelStatus,
    pub ctr: Container,
    pub empinfo: EmpInfo,
    mdl_up: Option<ModelRef>,
    /// Maps from the parent's index space into this model's, written during
    /// compression; immutable afterwards.
    pub rosetta_vars: Option<Vec<Idx>>,
    pub rosetta_equs: Option<Vec<Idx>>,
    timings: Rc<RefCell<Timings>>,
    /// FOOC statistics; populated when this model is a generated MCP and
    /// kept alive for post-processing.
    pub mcp_info: Option<McpInfo>,
}

impl Model {
    pub fn new(backend: Backend, name: impl Into<String>) -> Self {
        Self {
            backend,
            name: name.into(),
            probtype: ModelType::Unset,
            status: ModelStatus::empty(),
            ctr: Container::new(),
            empinfo: EmpInfo {
                empdag: EmpDag::new(),
                ovf: Vec::new(),
            },
            mdl_up: None,
            rosetta_vars: None,
            rosetta_equs: None,
            timings: Rc::new(RefCell::new(Timings::default())),
            mcp_info: None,
        }
    }

    pub fn new_rhp(name: impl Into<String>) -> Self {
        Self::new(Backend::Rhp, name)
    }

    /// A fresh RHP model linked upstream to `src`: it borrows the source,
    /// shares its constant pool and its timings.
    pub fn new_target(src: &ModelRef, name: impl Into<String>) -> Self {
        let mut mdl = Self::new_rhp(name);
        link_models(src, &mut mdl);
        mdl
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn ops(&self) -> &'static dyn BackendOps {
        ops_for(self.backend)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn probtype(&self) -> ModelType {
        self.probtype
    }

    pub fn set_probtype(&mut self, probtype: ModelType) {
        self.probtype = probtype;
    }

    /// Nonsmooth function reached during differentiation: the model keeps
    /// working, but its problem type degrades.
    pub fn upgrade_to_dnlp(&mut self) {
        if self.probtype != ModelType::Dnlp {
            tracing::debug!(
                target: "transform",
                "model '{}' upgraded from {} to dnlp",
                self.name,
                self.probtype.name()
            );
            self.probtype = ModelType::Dnlp;
        }
    }

    pub fn status(&self) -> ModelStatus {
        self.status
    }

    pub fn mdl_up(&self) -> Option<&ModelRef> {
        self.mdl_up.as_ref()
    }

    pub fn timings(&self) -> Rc<RefCell<Timings>> {
        Rc::clone(&self.timings)
    }

    /// Sense of the model: the simple-case data, unless a single-MP EMPDAG
    /// carries it.
    pub fn sense(&self) -> Sense {
        self.empinfo.empdag.simple_data.sense
    }

    pub fn set_sense(&mut self, sense: Sense) {
        self.empinfo.empdag.simple_data.sense = sense;
    }

    pub fn objvar(&self) -> Option<Vi> {
        let vi = self.empinfo.empdag.simple_data.objvar;
        valid_idx(vi).then_some(vi)
    }

    pub fn objequ(&self) -> Option<Ei> {
        let ei = self.empinfo.empdag.simple_data.objequ;
        valid_idx(ei).then_some(ei)
    }

    pub fn set_objvar(&mut self, vi: Vi) -> Result<(), Error> {
        if vi >= self.ctr.total_n() {
            return Err(Error::IndexOutOfRange {
                idx: vi,
                len: self.ctr.total_n(),
            });
        }
        self.empinfo.empdag.simple_data.objvar = vi;
        if let Some(vm) = &mut self.ctr.varmeta {
            vm[vi].role = VarRole::Objective;
        }
        Ok(())
    }

    pub fn set_objequ(&mut self, ei: Ei) -> Result<(), Error> {
        if ei >= self.ctr.total_m() {
            return Err(Error::IndexOutOfRange {
                idx: ei,
                len: self.ctr.total_m(),
            });
        }
        self.empinfo.empdag.simple_data.objequ = ei;
        if let Some(em) = &mut self.ctr.equmeta {
            em[ei].role = EquRole::Objective;
        }
        Ok(())
    }

    /// Refuse to mutate a model whose backend is read-only for the engine.
    pub fn assert_mutable(&self) -> Result<(), Error> {
        if !self.ops().supports_mutation() {
            return Err(Error::WrongModelForFunction {
                expected: "RHP",
                got: self.backend.name(),
            });
        }
        Ok(())
    }

    /// Finalize the EMPDAG (idempotent) and tag the model.
    pub fn finalize(&mut self) -> Result<(), Error> {
        let sw = Stopwatch::start();
        self.empinfo.empdag.finalize()?;
        sw.stop_into(&mut self.timings.borrow_mut().empdag_finalize);
        if self.probtype == ModelType::Unset {
            self.probtype = if self.empinfo.has_empdag() {
                ModelType::Emp
            } else {
                ModelType::Nlp
            };
        }
        self.status |= ModelStatus::FINALIZED;
        Ok(())
    }

    /// Validate the problem-type/objective triple and the backend-specific
    /// consistency. Runs once; re-checking is a no-op.
    pub fn check(&mut self) -> Result<(), Error> {
        if self.status.contains(ModelStatus::CHECKED) {
            return Ok(());
        }
        if !self.status.contains(ModelStatus::FINALIZED) {
            self.finalize()?;
        }

        let has_objvar = self.objvar().is_some();
        let has_objequ = self.objequ().is_some();
        let empdag_empty = !self.empinfo.has_empdag();

        if self.probtype.is_opt() && empdag_empty {
            if has_objvar && has_objequ {
                tracing::error!(
                    target: "model",
                    "model '{}': both an objective variable and an objective equation are set",
                    self.name
                );
                return Err(Error::Inconsistency(format!(
                    "model '{}': both objective variable and equation are set",
                    self.name
                )));
            }
            if !has_objvar && !has_objequ {
                return Err(Error::InvalidModel(format!(
                    "model '{}': {} problem without objective data",
                    self.name,
                    self.probtype.name()
                )));
            }
        }
        if matches!(
            self.probtype,
            ModelType::Cns | ModelType::Vi | ModelType::Mcp
        ) && (has_objvar || has_objequ)
        {
            return Err(Error::Inconsistency(format!(
                "model '{}': a {} problem cannot carry objective data",
                self.name,
                self.probtype.name()
            )));
        }

        self.ops().check_mdl(self)?;
        self.status |= ModelStatus::CHECKED;
        Ok(())
    }

    /// Enforce the metadata invariants. Every violation is logged; the
    /// first error is returned.
    pub fn check_metadata(&mut self) -> Result<(), Error> {
        if self.status.contains(ModelStatus::META_CHECKED) {
            return Ok(());
        }
        if !self.probtype.has_metadata() {
            self.status |= ModelStatus::META_CHECKED;
            return Ok(());
        }

        let mut status = Ok(());
        let ctr = &self.ctr;
        let (Some(varmeta), Some(equmeta)) = (&ctr.varmeta, &ctr.equmeta) else {
            return Err(Error::IncompleteMetadata(format!(
                "model '{}' of type {} has no metadata arrays",
                self.name,
                self.probtype.name()
            )));
        };

        let empdag_finalized = self.empinfo.empdag.is_finalized() && self.empinfo.has_empdag();

        for (vi, var) in ctr.vars().iter().enumerate() {
            if !var.is_active() {
                continue;
            }
            let meta = &varmeta[vi];
            if empdag_finalized && !valid_mpid(meta.mp_id) {
                tracing::error!(target: "model", "variable {vi} has no owning MP");
                status = Error::fold(
                    status,
                    Error::IncompleteMetadata(format!("variable {vi} has no owning MP")),
                );
            }
            match meta.role {
                VarRole::Objective => {
                    if valid_idx(meta.dual) {
                        tracing::error!(
                            target: "model",
                            "objective variable {vi} has a dual equation {}",
                            meta.dual
                        );
                        status = Error::fold(
                            status,
                            Error::IncompleteMetadata(format!(
                                "objective variable {vi} has a dual equation"
                            )),
                        );
                    }
                }
                VarRole::Primal | VarRole::Dual => {
                    if valid_idx(meta.dual) {
                        if meta.dual >= ctr.total_m() {
                            status = Error::fold(
                                status,
                                Error::IndexOutOfRange {
                                    idx: meta.dual,
                                    len: ctr.total_m(),
                                },
                            );
                            continue;
                        }
                        let back = &equmeta[meta.dual];
                        if back.dual != vi {
                            tracing::error!(
                                target: "model",
                                "variable {vi} is paired with equation {}, which is paired with {}",
                                meta.dual,
                                back.dual
                            );
                            status = Error::fold(
                                status,
                                Error::IncompleteMetadata(format!(
                                    "asymmetric pairing of variable {vi}"
                                )),
                            );
                        }
                        let ok_roles = matches!(
                            (meta.role, back.role),
                            (VarRole::Primal, EquRole::ViFunction)
                                | (VarRole::Dual, EquRole::Constraint)
                        );
                        if !ok_roles {
                            tracing::error!(
                                target: "model",
                                "pair (variable {vi}, equation {}) has roles ({:?}, {:?})",
                                meta.dual,
                                meta.role,
                                back.role
                            );
                            status = Error::fold(
                                status,
                                Error::IncompleteMetadata(format!(
                                    "pair (variable {vi}, equation {}) is mistyped",
                                    meta.dual
                                )),
                            );
                        }
                    }
                }
                _ => {}
            }
        }

        for (ei, equ) in ctr.equs().iter().enumerate() {
            if !equ.is_active() {
                continue;
            }
            let meta = &equmeta[ei];
            if empdag_finalized && !valid_mpid(meta.mp_id) && meta.role != EquRole::Objective {
                tracing::error!(target: "model", "equation {ei} has no owning MP");
                status = Error::fold(
                    status,
                    Error::IncompleteMetadata(format!("equation {ei} has no owning MP")),
                );
            }
            if meta.role == EquRole::Objective && valid_idx(meta.dual) {
                tracing::error!(
                    target: "model",
                    "objective equation {ei} has a dual variable {}",
                    meta.dual
                );
                status = Error::fold(
                    status,
                    Error::IncompleteMetadata(format!(
                        "objective equation {ei} has a dual variable"
                    )),
                );
            }
        }

        if self.probtype == ModelType::Mcp {
            if ctr.n() != ctr.m() {
                tracing::error!(
                    target: "model",
                    "MCP model '{}' is not square: {} variables, {} equations",
                    self.name,
                    ctr.n(),
                    ctr.m()
                );
                status = Error::fold(
                    status,
                    Error::IncompleteMetadata(format!(
                        "MCP model '{}' is not square",
                        self.name
                    )),
                );
            }
            for (vi, var) in ctr.vars().iter().enumerate() {
                if var.is_active() && !valid_idx(varmeta[vi].dual) {
                    tracing::error!(
                        target: "model",
                        "MCP variable {vi} has no paired equation"
                    );
                    status = Error::fold(
                        status,
                        Error::IncompleteMetadata(format!(
                            "MCP variable {vi} has no paired equation"
                        )),
                    );
                }
            }
        }

        if status.is_ok() {
            self.status |= ModelStatus::META_CHECKED;
        }
        status
    }

    /// Wrap a single-MP EMPDAG into a Nash node and turn the model into an
    /// EMP model.
    pub fn single_mp_to_nash(&mut self) -> Result<(), Error> {
        self.empinfo.empdag.single_mp_to_nash()?;
        self.probtype = ModelType::Emp;
        Ok(())
    }

    /// EMPDAG type, for transformation dispatch.
    pub fn empdag_type(&self) -> EmpDagType {
        self.empinfo.empdag.type_()
    }

    /// Rosetta entry for a parent variable, when this model was compressed
    /// from a parent.
    pub fn rosetta_var(&self, vi_up: Vi) -> Option<Vi> {
        match &self.rosetta_vars {
            Some(map) => map.get(vi_up).copied().filter(|&vi| valid_idx(vi)),
            None => Some(vi_up),
        }
    }

    pub fn rosetta_equ(&self, ei_up: Ei) -> Option<Ei> {
        match &self.rosetta_equs {
            Some(map) => map.get(ei_up).copied().filter(|&ei| valid_idx(ei)),
            None => Some(ei_up),
        }
    }
}

/// Link a freshly-created target model to its source: the target borrows
/// the source, shares the constant pool of its container and the timings of
/// the chain.
pub fn link_models(src: &ModelRef, dst: &mut Model) {
    let src_ref = src.borrow();
    dst.ctr = Container::with_pool(src_ref.ctr.pool());
    dst.timings = src_ref.timings();
    drop(src_ref);
    dst.mdl_up = Some(Rc::clone(src));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Cone, Equ, PairKind, Var};

    #[test]
    fn check_requires_objective_data_for_opt() {
        let mut mdl = Model::new_rhp("m");
        mdl.ctr.resize(1, 1).unwrap();
        mdl.set_probtype(ModelType::Nlp);
        mdl.set_sense(Sense::Min);
        assert!(matches!(mdl.check(), Err(Error::InvalidModel(_))));
        mdl.set_objequ(0).unwrap();
        mdl.check().unwrap();
        // re-checking is a no-op
        mdl.check().unwrap();
    }

    #[test]
    fn check_rejects_both_objvar_and_objequ() {
        let mut mdl = Model::new_rhp("m");
        mdl.ctr.resize(1, 1).unwrap();
        mdl.set_probtype(ModelType::Nlp);
        mdl.set_objvar(0).unwrap();
        mdl.set_objequ(0).unwrap();
        assert!(matches!(mdl.check(), Err(Error::Inconsistency(_))));
    }

    #[test]
    fn mcp_squareness_is_enforced() {
        let mut mdl = Model::new_rhp("mcp");
        mdl.ctr.resize(2, 1).unwrap();
        mdl.set_probtype(ModelType::Mcp);
        mdl.ctr.ensure_metadata();
        assert!(matches!(
            mdl.check_metadata(),
            Err(Error::IncompleteMetadata(_))
        ));
    }

    #[test]
    fn metadata_pairing_symmetry_holds_after_perp() {
        let mut mdl = Model::new_rhp("mcp");
        mdl.ctr.resize(0, 0).unwrap();
        let vi = mdl.ctr.add_var(Var::bounded(0, 0., f64::INFINITY).unwrap());
        let ei = mdl.ctr.add_equ(Equ::cone_inclusion(0, Cone::RPlus)).unwrap();
        mdl.ctr.set_equ_var_perp(ei, vi, PairKind::Constraint).unwrap();
        mdl.set_probtype(ModelType::Mcp);
        mdl.check_metadata().unwrap();
    }

    #[test]
    fn link_models_shares_pool_and_timings() {
        let src = Rc::new(RefCell::new(Model::new_rhp("src")));
        src.borrow_mut().ctr.resize(1, 0).unwrap();
        let dst = Model::new_target(&src, "dst");
        assert!(Rc::ptr_eq(
            &src.borrow().ctr.pool(),
            &dst.ctr.pool()
        ));
        assert!(Rc::ptr_eq(&src.borrow().timings(), &dst.timings()));
        assert!(dst.mdl_up().is_some());
    }
}
