//! The EMPDAG: a directed acyclic graph of mathematical programs and Nash
//! nodes. Control arcs mean "parent chooses the child's levels/parameters";
//! value-function arcs mean "the child's optimal value enters the parent's
//! objective", with a payload describing how.

pub mod mp;
pub mod uid;

use bitflags::bitflags;

use crate::container::{Container, VarPpty, VarRole};
use crate::error::Error;
use crate::{E, Ei, IDX_NA, Idx, Sense, Vi};

pub use mp::{MathPrgm, MpStatus, MpType};
pub use uid::{DagUid, MpId, NashId, UID_NA, valid_mpid, valid_nashid};

/// Payload of a value-function arc.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ArcVFPayload {
    #[default]
    Unset,
    /// The child's objective value substitutes into exactly one equation of
    /// the parent MP.
    Basic { ei: Ei },
    MultipleBasic(Vec<Ei>),
    /// Substitution scaled by a coefficient inside a linear part.
    Lequ { ei: Ei, coeff: E },
    MultipleLequ(Vec<(Ei, E)>),
    /// Substitution inside a general expression.
    Equ { ei: Ei },
    MultipleEqu(Vec<Ei>),
}

/// A value-function arc towards a child MP.
#[derive(Debug, Clone, PartialEq)]
pub struct ArcVF {
    pub child: MpId,
    pub payload: ArcVFPayload,
}

impl ArcVF {
    pub fn basic(child: MpId, ei: Ei) -> Self {
        Self {
            child,
            payload: ArcVFPayload::Basic { ei },
        }
    }
}

/// Terminal labels of the DAG type inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmpDagType {
    #[default]
    Unset,
    Empty,
    SingleOpt,
    SingleVi,
    Opt,
    Vi,
    Mopec,
    Bilevel,
    Multilevel,
    MultilevelMopec,
    Mpec,
    Epec,
    NestedCcf,
    Complex,
}

impl EmpDagType {
    pub fn name(self) -> &'static str {
        match self {
            EmpDagType::Unset => "unset",
            EmpDagType::Empty => "empty",
            EmpDagType::SingleOpt => "single optimization",
            EmpDagType::SingleVi => "single VI",
            EmpDagType::Opt => "optimization",
            EmpDagType::Vi => "VI",
            EmpDagType::Mopec => "MOPEC",
            EmpDagType::Bilevel => "bilevel",
            EmpDagType::Multilevel => "multilevel",
            EmpDagType::MultilevelMopec => "multilevel MOPEC",
            EmpDagType::Mpec => "MPEC",
            EmpDagType::Epec => "EPEC",
            EmpDagType::NestedCcf => "nested CCF",
            EmpDagType::Complex => "complex",
        }
    }
}

/// Kind of the (unique) root node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RootType {
    #[default]
    Unset,
    Opt,
    Vi,
    Equil,
}

bitflags! {
    /// Mix of non-simple constraint edges below optimization nodes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OptEdgeFeatures: u8 {
        const EQUIL       = 1 << 0;
        const VI          = 1 << 1;
        const OPT_SOL_MAP = 1 << 2;
        const MULTILEVEL  = 1 << 3;
    }
}

bitflags! {
    /// Mix of non-simple constraint edges below VI nodes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ViEdgeFeatures: u8 {
        const EQUIL       = 1 << 0;
        const VI          = 1 << 1;
        const OPT_SOL_MAP = 1 << 2;
        const MULTILEVEL  = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EmpDagFeatures {
    pub rootnode: RootType,
    pub constraint: OptEdgeFeatures,
    pub vicons: ViEdgeFeatures,
}

/// Objective data of a model without EMP structure.
#[derive(Debug, Clone, Copy)]
pub struct SimpleData {
    pub sense: Sense,
    pub objvar: Idx,
    pub objequ: Idx,
}

impl Default for SimpleData {
    fn default() -> Self {
        Self {
            sense: Sense::NoSense,
            objvar: IDX_NA,
            objequ: IDX_NA,
        }
    }
}

/// A Nash equilibrium node: the simultaneous solution of its children MPs.
#[derive(Debug, Clone)]
pub struct Nash {
    id: NashId,
}

impl Nash {
    pub fn id(&self) -> NashId {
        self.id
    }
}

#[derive(Debug, Default)]
pub struct EmpDag {
    type_: EmpDagType,
    pub features: EmpDagFeatures,
    finalized: bool,

    mps: Vec<MathPrgm>,
    mp_names: Vec<String>,
    mp_carcs: Vec<Vec<DagUid>>,
    mp_varcs: Vec<Vec<ArcVF>>,
    mp_rarcs: Vec<Vec<DagUid>>,

    nashes: Vec<Nash>,
    nash_names: Vec<String>,
    nash_arcs: Vec<Vec<DagUid>>,
    nash_rarcs: Vec<Vec<DagUid>>,

    /// Sorted array of root uids.
    roots: Vec<DagUid>,
    uid_root: DagUid,

    /// MPs queued for an adversarial (min-max) reformulation.
    pub mps2reformulate: Vec<MpId>,

    /// Objective data of the simple (EMP-less) case.
    pub simple_data: SimpleData,
}

impl EmpDag {
    pub fn new() -> Self {
        Self {
            uid_root: UID_NA,
            ..Self::default()
        }
    }

    pub fn type_(&self) -> EmpDagType {
        self.type_
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn num_mps(&self) -> usize {
        self.mps.len()
    }

    pub fn num_nashes(&self) -> usize {
        self.nashes.len()
    }

    /// Whether any EMP structure was given.
    pub fn exists(&self) -> bool {
        !self.mps.is_empty()
    }

    pub fn roots(&self) -> &[DagUid] {
        &self.roots
    }

    pub fn uid_root(&self) -> Option<DagUid> {
        self.uid_root.is_valid().then_some(self.uid_root)
    }

    fn touch(&mut self) {
        self.finalized = false;
    }

    fn chk_mpid(&self, mpid: MpId) -> Result<(), Error> {
        if (mpid as usize) < self.mps.len() {
            Ok(())
        } else {
            Err(Error::IndexOutOfRange {
                idx: mpid as usize,
                len: self.mps.len(),
            })
        }
    }

    fn chk_nashid(&self, nashid: NashId) -> Result<(), Error> {
        if (nashid as usize) < self.nashes.len() {
            Ok(())
        } else {
            Err(Error::IndexOutOfRange {
                idx: nashid as usize,
                len: self.nashes.len(),
            })
        }
    }

    /* ----------------------------------------------------------------------
     * Node creation
     * ---------------------------------------------------------------------- */

    pub fn add_mp(&mut self, sense: Sense) -> Result<MpId, Error> {
        self.add_mp_named(sense, String::new())
    }

    pub fn add_mp_named(&mut self, sense: Sense, name: String) -> Result<MpId, Error> {
        let id = self.mps.len() as MpId;
        let mp = MathPrgm::new(id, sense)?;
        self.push_mp(mp, name);
        Ok(id)
    }

    pub fn add_ccflib_mp(&mut self, sense: Sense, name: String) -> MpId {
        let id = self.mps.len() as MpId;
        self.push_mp(MathPrgm::new_ccflib(id, sense), name);
        id
    }

    fn push_mp(&mut self, mp: MathPrgm, name: String) {
        self.mps.push(mp);
        self.mp_names.push(name);
        self.mp_carcs.push(Vec::new());
        self.mp_varcs.push(Vec::new());
        self.mp_rarcs.push(Vec::new());
        self.touch();
    }

    pub fn add_nash(&mut self) -> NashId {
        self.add_nash_named(String::new())
    }

    pub fn add_nash_named(&mut self, name: String) -> NashId {
        let id = self.nashes.len() as NashId;
        self.nashes.push(Nash { id });
        self.nash_names.push(name);
        self.nash_arcs.push(Vec::new());
        self.nash_rarcs.push(Vec::new());
        self.touch();
        id
    }

    /* ----------------------------------------------------------------------
     * Node getters
     * ---------------------------------------------------------------------- */

    pub fn mp(&self, mpid: MpId) -> Result<&MathPrgm, Error> {
        self.chk_mpid(mpid)?;
        Ok(&self.mps[mpid as usize])
    }

    pub fn mp_mut(&mut self, mpid: MpId) -> Result<&mut MathPrgm, Error> {
        self.chk_mpid(mpid)?;
        self.touch();
        Ok(&mut self.mps[mpid as usize])
    }

    pub fn mps(&self) -> &[MathPrgm] {
        &self.mps
    }

    pub fn mp_name(&self, mpid: MpId) -> Option<&str> {
        self.mp_names
            .get(mpid as usize)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    pub fn nash_name(&self, nashid: NashId) -> Option<&str> {
        self.nash_names
            .get(nashid as usize)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    /// Case-insensitive name lookup.
    pub fn mp_by_name(&self, name: &str) -> Result<MpId, Error> {
        self.mp_names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(name))
            .map(|pos| pos as MpId)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    pub fn nash_by_name(&self, name: &str) -> Result<NashId, Error> {
        self.nash_names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(name))
            .map(|pos| pos as NashId)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Rename an MP; renaming an already-named MP is refused.
    pub fn set_mp_name(&mut self, mpid: MpId, name: String) -> Result<(), Error> {
        self.chk_mpid(mpid)?;
        let slot = &mut self.mp_names[mpid as usize];
        if !slot.is_empty() {
            return Err(Error::UnexpectedData(format!(
                "MP #{mpid} is already named '{slot}'"
            )));
        }
        *slot = name;
        Ok(())
    }

    /// Follow the forwarding chain of replaced MPs to the current one. The
    /// walk is bounded by the number of MPs: a longer chain is a cycle.
    pub fn mp_cur_id(&self, mpid: MpId) -> Result<MpId, Error> {
        self.chk_mpid(mpid)?;
        let mut cur = mpid;
        for _ in 0..=self.mps.len() {
            match self.mps[cur as usize].next_id() {
                None => return Ok(cur),
                Some(next) => {
                    self.chk_mpid(next)?;
                    cur = next;
                }
            }
        }
        Err(Error::RuntimeError(format!(
            "cycle detected in the forwarding chain starting at MP #{mpid}"
        )))
    }

    /* ----------------------------------------------------------------------
     * MP population (keeps container metadata in sync)
     * ---------------------------------------------------------------------- */

    pub fn mp_addvar(&mut self, ctr: &mut Container, mpid: MpId, vi: Vi) -> Result<(), Error> {
        self.chk_mpid(mpid)?;
        ctr.ensure_metadata();
        let vm = ctr.varmeta.as_mut().unwrap();
        let len = vm.len();
        let meta = vm
            .get_mut(vi)
            .ok_or(Error::IndexOutOfRange { idx: vi, len })?;
        if valid_mpid(meta.mp_id) && meta.mp_id != mpid {
            return Err(Error::UnexpectedData(format!(
                "variable {vi} already belongs to MP #{}",
                meta.mp_id
            )));
        }
        self.mps[mpid as usize].add_var(vi)?;
        meta.mp_id = mpid;
        if meta.role == VarRole::Undefined {
            meta.role = VarRole::Primal;
        }
        self.touch();
        Ok(())
    }

    pub fn mp_addconstraint(
        &mut self,
        ctr: &mut Container,
        mpid: MpId,
        ei: Ei,
    ) -> Result<(), Error> {
        self.chk_mpid(mpid)?;
        ctr.ensure_metadata();
        let em = ctr.equmeta.as_mut().unwrap();
        let len = em.len();
        let meta = em
            .get_mut(ei)
            .ok_or(Error::IndexOutOfRange { idx: ei, len })?;
        if valid_mpid(meta.mp_id) && meta.mp_id != mpid {
            return Err(Error::UnexpectedData(format!(
                "equation {ei} already belongs to MP #{}",
                meta.mp_id
            )));
        }
        self.mps[mpid as usize].add_constraint(ei)?;
        meta.mp_id = mpid;
        meta.role = crate::container::EquRole::Constraint;
        self.touch();
        Ok(())
    }

    /// Add a VI pair `F ⟂ v` (or `0 ⟂ v` when `ei` is `None`).
    pub fn mp_addvipair(
        &mut self,
        ctr: &mut Container,
        mpid: MpId,
        ei: Option<Ei>,
        vi: Vi,
    ) -> Result<(), Error> {
        self.chk_mpid(mpid)?;
        self.mps[mpid as usize].add_vi_pair(ei, vi)?;
        ctr.ensure_metadata();
        {
            let vm = ctr.varmeta.as_mut().unwrap();
            let len = vm.len();
            let vmeta = vm
                .get_mut(vi)
                .ok_or(Error::IndexOutOfRange { idx: vi, len })?;
            vmeta.mp_id = mpid;
            vmeta.role = VarRole::Primal;
            match ei {
                Some(ei) => {
                    vmeta.ppty |= VarPpty::PERP_TO_VI_FUNCTION;
                    vmeta.dual = ei;
                }
                None => vmeta.ppty |= VarPpty::PERP_TO_ZERO_FUNCTION_VI,
            }
        }
        if let Some(ei) = ei {
            let em = ctr.equmeta.as_mut().unwrap();
            let len = em.len();
            let emeta = em
                .get_mut(ei)
                .ok_or(Error::IndexOutOfRange { idx: ei, len })?;
            emeta.mp_id = mpid;
            emeta.role = crate::container::EquRole::ViFunction;
            emeta.dual = vi;
        }
        self.touch();
        Ok(())
    }

    pub fn mp_setobjvar(&mut self, ctr: &mut Container, mpid: MpId, vi: Vi) -> Result<(), Error> {
        self.chk_mpid(mpid)?;
        let sense = self.mps[mpid as usize].sense();
        self.mps[mpid as usize].set_objvar(vi)?;
        ctr.ensure_metadata();
        let vm = ctr.varmeta.as_mut().unwrap();
        let len = vm.len();
        let meta = vm
            .get_mut(vi)
            .ok_or(Error::IndexOutOfRange { idx: vi, len })?;
        meta.mp_id = mpid;
        meta.role = VarRole::Objective;
        meta.ppty |= match sense {
            Sense::Max => VarPpty::IS_OBJ_MAX,
            _ => VarPpty::IS_OBJ_MIN,
        };
        self.touch();
        Ok(())
    }

    pub fn mp_setobjequ(&mut self, ctr: &mut Container, mpid: MpId, ei: Ei) -> Result<(), Error> {
        self.chk_mpid(mpid)?;
        self.mps[mpid as usize].set_objequ(ei)?;
        ctr.ensure_metadata();
        let em = ctr.equmeta.as_mut().unwrap();
        let len = em.len();
        let meta = em
            .get_mut(ei)
            .ok_or(Error::IndexOutOfRange { idx: ei, len })?;
        meta.mp_id = mpid;
        meta.role = crate::container::EquRole::Objective;
        self.touch();
        Ok(())
    }

    /* ----------------------------------------------------------------------
     * Arcs
     * ---------------------------------------------------------------------- */

    /// Value-function arc: the child's optimal value enters the parent.
    pub fn mp_vf_mp(&mut self, parent: MpId, arc: ArcVF) -> Result<(), Error> {
        self.chk_mpid(parent)?;
        self.chk_mpid(arc.child)?;
        if parent == arc.child {
            return Err(Error::EmpIncorrectInput(format!(
                "MP #{parent}: a value-function arc cannot point at its own MP"
            )));
        }
        let child = arc.child;
        self.mp_varcs[parent as usize].push(arc);
        self.mp_rarcs[child as usize].push(DagUid::mp(parent).with_vf_marker());
        self.touch();
        Ok(())
    }

    /// Control arc between two MPs.
    pub fn mp_ctrl_mp(&mut self, parent: MpId, child: MpId) -> Result<(), Error> {
        self.chk_mpid(parent)?;
        self.chk_mpid(child)?;
        if parent == child {
            return Err(Error::EmpIncorrectInput(format!(
                "MP #{parent}: a control arc cannot point at its own MP"
            )));
        }
        self.mp_carcs[parent as usize].push(DagUid::mp(child));
        self.mp_rarcs[child as usize].push(DagUid::mp(parent));
        self.touch();
        Ok(())
    }

    /// Control arc from an MP to a Nash node.
    pub fn mp_ctrl_nash(&mut self, parent: MpId, nashid: NashId) -> Result<(), Error> {
        self.chk_mpid(parent)?;
        self.chk_nashid(nashid)?;
        self.mp_carcs[parent as usize].push(DagUid::nash(nashid));
        self.nash_rarcs[nashid as usize].push(DagUid::mp(parent));
        self.touch();
        Ok(())
    }

    /// Attach an MP to a Nash node. A Nash child is always an MP.
    pub fn nash_addmp(&mut self, nashid: NashId, mpid: MpId) -> Result<(), Error> {
        self.chk_nashid(nashid)?;
        self.chk_mpid(mpid)?;
        self.nash_arcs[nashid as usize].push(DagUid::mp(mpid));
        self.mp_rarcs[mpid as usize].push(DagUid::nash(nashid));
        self.touch();
        Ok(())
    }

    pub fn mp_carcs(&self, mpid: MpId) -> Result<&[DagUid], Error> {
        self.chk_mpid(mpid)?;
        Ok(&self.mp_carcs[mpid as usize])
    }

    pub fn mp_varcs(&self, mpid: MpId) -> Result<&[ArcVF], Error> {
        self.chk_mpid(mpid)?;
        Ok(&self.mp_varcs[mpid as usize])
    }

    pub fn mp_parents(&self, mpid: MpId) -> Result<&[DagUid], Error> {
        self.chk_mpid(mpid)?;
        Ok(&self.mp_rarcs[mpid as usize])
    }

    pub fn nash_children(&self, nashid: NashId) -> Result<&[DagUid], Error> {
        self.chk_nashid(nashid)?;
        Ok(&self.nash_arcs[nashid as usize])
    }

    pub fn nash_parents(&self, nashid: NashId) -> Result<&[DagUid], Error> {
        self.chk_nashid(nashid)?;
        Ok(&self.nash_rarcs[nashid as usize])
    }

    pub fn mp_has_child(&self, mpid: MpId) -> bool {
        self.mp_carcs
            .get(mpid as usize)
            .is_some_and(|arcs| !arcs.is_empty())
            || self
                .mp_varcs
                .get(mpid as usize)
                .is_some_and(|arcs| !arcs.is_empty())
    }

    /// The VF arc between two MPs, if any.
    pub fn find_vf_arc(&self, parent: MpId, child: MpId) -> Option<&ArcVF> {
        self.mp_varcs
            .get(parent as usize)?
            .iter()
            .find(|arc| arc.child == child)
    }

    /* ----------------------------------------------------------------------
     * Roots
     * ---------------------------------------------------------------------- */

    pub fn roots_add(&mut self, uid: DagUid) -> Result<(), Error> {
        self.chk_uid(uid)?;
        if let Err(pos) = self.roots.binary_search(&uid) {
            self.roots.insert(pos, uid);
        }
        self.touch();
        Ok(())
    }

    /// Add to the roots and tag as *the* root of the DAG.
    pub fn set_root(&mut self, uid: DagUid) -> Result<(), Error> {
        self.roots_add(uid)?;
        self.uid_root = uid;
        Ok(())
    }

    pub fn is_root(&self, uid: DagUid) -> bool {
        self.roots.binary_search(&uid).is_ok()
    }

    fn chk_uid(&self, uid: DagUid) -> Result<(), Error> {
        if uid.is_mp() {
            self.chk_mpid(uid.id())
        } else {
            self.chk_nashid(uid.id())
        }
    }

    /// Nodes without reverse arcs.
    pub fn collect_roots(&self) -> Vec<DagUid> {
        let mut roots = Vec::new();
        for (i, rarcs) in self.mp_rarcs.iter().enumerate() {
            if rarcs.is_empty() {
                roots.push(DagUid::mp(i as MpId));
            }
        }
        for (i, rarcs) in self.nash_rarcs.iter().enumerate() {
            if rarcs.is_empty() {
                roots.push(DagUid::nash(i as NashId));
            }
        }
        roots.sort();
        roots
    }

    /* ----------------------------------------------------------------------
     * Removal
     * ---------------------------------------------------------------------- */

    /// Delete a node; allowed only for the last-added node of its kind with
    /// no parents and no children.
    pub fn delete(&mut self, uid: DagUid) -> Result<(), Error> {
        self.chk_uid(uid)?;
        let id = uid.id() as usize;
        if uid.is_mp() {
            if id + 1 != self.mps.len() {
                return Err(Error::OperationNotAllowed(format!(
                    "MP #{id} is not the last-added MP"
                )));
            }
            if !self.mp_rarcs[id].is_empty()
                || !self.mp_carcs[id].is_empty()
                || !self.mp_varcs[id].is_empty()
            {
                return Err(Error::OperationNotAllowed(format!(
                    "MP #{id} still has arcs"
                )));
            }
            self.mps.pop();
            self.mp_names.pop();
            self.mp_carcs.pop();
            self.mp_varcs.pop();
            self.mp_rarcs.pop();
        } else {
            if id + 1 != self.nashes.len() {
                return Err(Error::OperationNotAllowed(format!(
                    "Nash #{id} is not the last-added Nash node"
                )));
            }
            if !self.nash_rarcs[id].is_empty() || !self.nash_arcs[id].is_empty() {
                return Err(Error::OperationNotAllowed(format!(
                    "Nash #{id} still has arcs"
                )));
            }
            self.nashes.pop();
            self.nash_names.pop();
            self.nash_arcs.pop();
            self.nash_rarcs.pop();
        }
        self.roots.retain(|&r| r != uid);
        if self.uid_root == uid {
            self.uid_root = UID_NA;
        }
        self.touch();
        Ok(())
    }

    /* ----------------------------------------------------------------------
     * Subdag enumeration
     * ---------------------------------------------------------------------- */

    fn dfs_mplist(&self, uid: DagUid, mplist: &mut Vec<MpId>) -> Result<(), Error> {
        self.chk_uid(uid)?;
        if uid.is_mp() {
            let id = uid.id();
            if let Err(pos) = mplist.binary_search(&id) {
                mplist.insert(pos, id);
            } else {
                return Ok(());
            }
            for &child in &self.mp_carcs[id as usize] {
                self.dfs_mplist(child, mplist)?;
            }
            for arc in &self.mp_varcs[id as usize] {
                self.dfs_mplist(DagUid::mp(arc.child), mplist)?;
            }
        } else {
            for &child in &self.nash_arcs[uid.id() as usize] {
                self.dfs_mplist(child, mplist)?;
            }
        }
        Ok(())
    }

    /// Sorted list of the MP ids reachable from `uid`.
    pub fn subdag_mplist(&self, uid: DagUid) -> Result<Vec<MpId>, Error> {
        let mut mplist = Vec::new();
        self.dfs_mplist(uid, &mut mplist)?;
        Ok(mplist)
    }

    /* ----------------------------------------------------------------------
     * Finalize: MP finalization, root tagging, checks, type inference
     * ---------------------------------------------------------------------- */

    /// Finalize the DAG. Idempotent: a second call without intervening
    /// mutation is a no-op.
    pub fn finalize(&mut self) -> Result<(), Error> {
        if self.finalized {
            return Ok(());
        }
        self.type_ = EmpDagType::Unset;

        for mp in &mut self.mps {
            mp.finalize()?;
        }

        if !self.mps.is_empty() && self.roots.is_empty() {
            let roots = self.collect_roots();
            match roots.len() {
                0 => {
                    return Err(Error::EmpIncorrectInput(
                        "the EMPDAG has no root; it must have one".into(),
                    ));
                }
                _ => {
                    self.roots = roots;
                }
            }
        }

        // Tag the unique root before any inference runs.
        if self.roots.len() == 1 && !self.uid_root.is_valid() {
            self.uid_root = self.roots[0];
        }

        self.check()?;
        self.compute_features();
        self.infer_type()?;
        self.finalized = true;

        if self.exists() {
            tracing::info!(
                target: "empdag",
                "EMPDAG finalized with type {} ({} MPs, {} Nash nodes)",
                self.type_.name(),
                self.mps.len(),
                self.nashes.len()
            );
        }
        Ok(())
    }

    /// Structural check. Logs every violation and returns the first error.
    pub fn check(&self) -> Result<(), Error> {
        let mut status = Ok(());

        if self.roots.is_empty() {
            if !self.mps.is_empty() {
                tracing::error!(
                    target: "empdag",
                    "there are {} MPs but no root in the EMPDAG",
                    self.mps.len()
                );
                return Err(Error::EmpRuntimeError(
                    "MPs are present but the EMPDAG has no root".into(),
                ));
            }
            return Ok(());
        }

        if self.roots.len() == 1 && !self.uid_root.is_valid() {
            tracing::error!(
                target: "empdag",
                "there is one root but it has not been tagged as the EMPDAG root"
            );
            status = Error::fold(
                status,
                Error::EmpRuntimeError("the unique root has not been tagged".into()),
            );
        }

        for (i, mp) in self.mps.iter().enumerate() {
            if !mp.is_finalized() {
                tracing::error!(target: "empdag", "MP #{i} has not been finalized");
                status = Error::fold(
                    status,
                    Error::EmpRuntimeError(format!("MP #{i} has not been finalized")),
                );
            }
            let uid = DagUid::mp(i as MpId);
            if self.mp_rarcs[i].is_empty() && !self.is_root(uid) {
                tracing::error!(target: "empdag", "MP #{i} is not in the EMPDAG");
                status = Error::fold(
                    status,
                    Error::EmpRuntimeError(format!("MP #{i} is not in the EMPDAG")),
                );
            }
        }

        for (i, _) in self.nashes.iter().enumerate() {
            let uid = DagUid::nash(i as NashId);
            if self.nash_rarcs[i].is_empty() && !self.is_root(uid) {
                tracing::error!(target: "empdag", "Nash #{i} is not in the EMPDAG");
                status = Error::fold(
                    status,
                    Error::EmpRuntimeError(format!("Nash #{i} is not in the EMPDAG")),
                );
            }
            if self.nash_arcs[i].is_empty() {
                tracing::error!(target: "empdag", "Nash #{i} has no child MP");
                status = Error::fold(
                    status,
                    Error::EmpIncorrectInput(format!("Nash #{i} has no child MP")),
                );
            }
        }

        if let Err(err) = self.check_acyclic_and_reachable() {
            status = Error::fold(status, err);
        }

        status
    }

    /// DFS from the roots: every node must be reachable, and no forward arc
    /// may close a cycle.
    fn check_acyclic_and_reachable(&self) -> Result<(), Error> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        fn visit(
            dag: &EmpDag,
            uid: DagUid,
            mp_color: &mut [Color],
            nash_color: &mut [Color],
        ) -> Result<(), Error> {
            let (colors, id) = if uid.is_mp() {
                (&mut *mp_color, uid.id() as usize)
            } else {
                (&mut *nash_color, uid.id() as usize)
            };
            match colors[id] {
                Color::Gray => {
                    return Err(Error::EmpRuntimeError(format!(
                        "the EMPDAG has a cycle through {} #{id}",
                        if uid.is_mp() { "MP" } else { "Nash" }
                    )));
                }
                Color::Black => return Ok(()),
                Color::White => colors[id] = Color::Gray,
            }

            if uid.is_mp() {
                for &child in &dag.mp_carcs[id] {
                    visit(dag, child, mp_color, nash_color)?;
                }
                for arc in &dag.mp_varcs[id] {
                    visit(dag, DagUid::mp(arc.child), mp_color, nash_color)?;
                }
            } else {
                for &child in &dag.nash_arcs[id] {
                    visit(dag, child, mp_color, nash_color)?;
                }
            }

            let colors = if uid.is_mp() { mp_color } else { nash_color };
            colors[id] = Color::Black;
            Ok(())
        }

        let mut mp_color = vec![Color::White; self.mps.len()];
        let mut nash_color = vec![Color::White; self.nashes.len()];
        for &root in &self.roots {
            visit(self, root, &mut mp_color, &mut nash_color)?;
        }
        let unreachable_mp = mp_color.iter().position(|&c| c == Color::White);
        if let Some(i) = unreachable_mp {
            tracing::error!(target: "empdag", "MP #{i} is not reachable from the roots");
            return Err(Error::EmpRuntimeError(format!(
                "MP #{i} is not reachable from the roots"
            )));
        }
        if let Some(i) = nash_color.iter().position(|&c| c == Color::White) {
            tracing::error!(target: "empdag", "Nash #{i} is not reachable from the roots");
            return Err(Error::EmpRuntimeError(format!(
                "Nash #{i} is not reachable from the roots"
            )));
        }
        Ok(())
    }

    fn compute_features(&mut self) {
        let mut features = EmpDagFeatures::default();

        if let Some(root) = self.uid_root() {
            features.rootnode = if root.is_nash() {
                RootType::Equil
            } else {
                match self.mps[root.id() as usize].type_() {
                    MpType::Vi => RootType::Vi,
                    _ => RootType::Opt,
                }
            };
        }

        for (i, mp) in self.mps.iter().enumerate() {
            let into_opt = mp.type_() != MpType::Vi;
            let mut add = |flag: OptEdgeFeatures| {
                if into_opt {
                    features.constraint |= flag;
                } else {
                    features.vicons |= ViEdgeFeatures::from_bits_truncate(flag.bits());
                }
            };
            for &child in &self.mp_carcs[i] {
                if child.is_nash() {
                    add(OptEdgeFeatures::EQUIL);
                    continue;
                }
                let child_mp = &self.mps[child.id() as usize];
                match child_mp.type_() {
                    MpType::Vi => add(OptEdgeFeatures::VI),
                    _ => {
                        if self.mp_has_child(child.id()) {
                            add(OptEdgeFeatures::MULTILEVEL);
                        } else {
                            add(OptEdgeFeatures::OPT_SOL_MAP);
                        }
                    }
                }
            }
        }

        self.features = features;
    }

    /// Infer the DAG type from the computed features.
    fn infer_type(&mut self) -> Result<(), Error> {
        if self.mps.is_empty() {
            self.type_ = EmpDagType::Empty;
            return Ok(());
        }

        if self.mps.iter().any(|mp| mp.type_() == MpType::Ccflib) {
            self.type_ = EmpDagType::NestedCcf;
            return Ok(());
        }

        if self.roots.len() > 1 {
            self.type_ = EmpDagType::Complex;
            return Ok(());
        }

        if self.features.vicons != ViEdgeFeatures::empty() {
            self.type_ = EmpDagType::Complex;
            return Ok(());
        }

        let nb_mps = self.mps.len();
        let constraint = self.features.constraint;

        if constraint == OptEdgeFeatures::empty() {
            self.type_ = match self.features.rootnode {
                RootType::Opt => {
                    if nb_mps > 1 {
                        EmpDagType::Opt
                    } else {
                        EmpDagType::SingleOpt
                    }
                }
                RootType::Vi => {
                    if nb_mps > 1 {
                        EmpDagType::Vi
                    } else {
                        EmpDagType::SingleVi
                    }
                }
                RootType::Equil => EmpDagType::Mopec,
                RootType::Unset => {
                    return Err(Error::RuntimeError(
                        "invalid root node type during EMPDAG type inference".into(),
                    ));
                }
            };
            return Ok(());
        }

        if constraint.contains(OptEdgeFeatures::MULTILEVEL) {
            self.type_ = if self.features.rootnode == RootType::Equil {
                EmpDagType::MultilevelMopec
            } else {
                EmpDagType::Multilevel
            };
            return Ok(());
        }

        if constraint == OptEdgeFeatures::OPT_SOL_MAP {
            self.type_ = match self.features.rootnode {
                RootType::Opt => EmpDagType::Bilevel,
                RootType::Equil => EmpDagType::Epec,
                _ => {
                    return Err(Error::RuntimeError(
                        "invalid root node type during EMPDAG type inference".into(),
                    ));
                }
            };
            return Ok(());
        }

        if constraint.intersects(OptEdgeFeatures::EQUIL | OptEdgeFeatures::VI) {
            self.type_ = match self.features.rootnode {
                RootType::Opt => EmpDagType::Mpec,
                RootType::Equil => EmpDagType::Epec,
                _ => {
                    return Err(Error::RuntimeError(
                        "invalid root node type during EMPDAG type inference".into(),
                    ));
                }
            };
            return Ok(());
        }

        self.type_ = EmpDagType::Complex;
        Ok(())
    }

    /* ----------------------------------------------------------------------
     * Transformations
     * ---------------------------------------------------------------------- */

    /// Wrap a single-MP DAG in a Nash parent with that MP as only child.
    /// The caller is responsible for switching the model type to `emp`.
    pub fn single_mp_to_nash(&mut self) -> Result<NashId, Error> {
        if self.mps.len() != 1 {
            return Err(Error::EmpRuntimeError(format!(
                "the EMPDAG should have exactly 1 MP, found {}",
                self.mps.len()
            )));
        }
        let mpid = self.mps[0].id();
        let nashid = self.add_nash_named("equilibrium".to_string());
        self.nash_addmp(nashid, mpid)?;
        self.roots.clear();
        self.uid_root = UID_NA;
        self.set_root(DagUid::nash(nashid))?;
        Ok(nashid)
    }

    /// Whether some MPs are queued for an adversarial reformulation.
    pub fn has_adversarial_mps(&self) -> bool {
        !self.mps2reformulate.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opt_mp(dag: &mut EmpDag, ctr: &mut Container, vi: Vi, objequ: Ei) -> MpId {
        let mpid = dag.add_mp(Sense::Min).unwrap();
        dag.mp_addvar(ctr, mpid, vi).unwrap();
        dag.mp_setobjequ(ctr, mpid, objequ).unwrap();
        mpid
    }

    fn small_ctr(n: usize, m: usize) -> Container {
        let mut ctr = Container::new();
        ctr.resize(n, m).unwrap();
        ctr
    }

    #[test]
    fn empty_dag_finalizes_to_empty() {
        let mut dag = EmpDag::new();
        dag.finalize().unwrap();
        assert_eq!(dag.type_(), EmpDagType::Empty);
    }

    #[test]
    fn single_opt_is_inferred_and_tagged() {
        let mut ctr = small_ctr(1, 1);
        let mut dag = EmpDag::new();
        let mpid = opt_mp(&mut dag, &mut ctr, 0, 0);
        dag.finalize().unwrap();
        assert_eq!(dag.type_(), EmpDagType::SingleOpt);
        assert_eq!(dag.uid_root(), Some(DagUid::mp(mpid)));
    }

    #[test]
    fn double_finalize_is_noop() {
        let mut ctr = small_ctr(1, 1);
        let mut dag = EmpDag::new();
        opt_mp(&mut dag, &mut ctr, 0, 0);
        dag.finalize().unwrap();
        let ty = dag.type_();
        dag.finalize().unwrap();
        assert_eq!(dag.type_(), ty);
    }

    #[test]
    fn nash_of_two_mps_is_mopec() {
        let mut ctr = small_ctr(2, 2);
        let mut dag = EmpDag::new();
        let mp1 = opt_mp(&mut dag, &mut ctr, 0, 0);
        let mp2 = opt_mp(&mut dag, &mut ctr, 1, 1);
        let nash = dag.add_nash();
        dag.nash_addmp(nash, mp1).unwrap();
        dag.nash_addmp(nash, mp2).unwrap();
        dag.finalize().unwrap();
        assert_eq!(dag.type_(), EmpDagType::Mopec);
        assert_eq!(dag.uid_root(), Some(DagUid::nash(nash)));
    }

    #[test]
    fn ctrl_arc_to_childless_opt_is_bilevel() {
        let mut ctr = small_ctr(2, 2);
        let mut dag = EmpDag::new();
        let upper = opt_mp(&mut dag, &mut ctr, 0, 0);
        let lower = opt_mp(&mut dag, &mut ctr, 1, 1);
        dag.mp_ctrl_mp(upper, lower).unwrap();
        dag.finalize().unwrap();
        assert_eq!(dag.type_(), EmpDagType::Bilevel);
    }

    #[test]
    fn three_level_chain_is_multilevel() {
        let mut ctr = small_ctr(3, 3);
        let mut dag = EmpDag::new();
        let a = opt_mp(&mut dag, &mut ctr, 0, 0);
        let b = opt_mp(&mut dag, &mut ctr, 1, 1);
        let c = opt_mp(&mut dag, &mut ctr, 2, 2);
        dag.mp_ctrl_mp(a, b).unwrap();
        dag.mp_ctrl_mp(b, c).unwrap();
        dag.finalize().unwrap();
        assert_eq!(dag.type_(), EmpDagType::Multilevel);
    }

    #[test]
    fn opt_controlling_nash_is_mpec() {
        let mut ctr = small_ctr(2, 2);
        let mut dag = EmpDag::new();
        let upper = opt_mp(&mut dag, &mut ctr, 0, 0);
        let player = opt_mp(&mut dag, &mut ctr, 1, 1);
        let nash = dag.add_nash();
        dag.nash_addmp(nash, player).unwrap();
        dag.mp_ctrl_nash(upper, nash).unwrap();
        dag.finalize().unwrap();
        assert_eq!(dag.type_(), EmpDagType::Mpec);
    }

    #[test]
    fn rootless_dag_fails_finalize() {
        let mut ctr = small_ctr(2, 2);
        let mut dag = EmpDag::new();
        let a = opt_mp(&mut dag, &mut ctr, 0, 0);
        let b = opt_mp(&mut dag, &mut ctr, 1, 1);
        // force a cycle so no node is parentless
        dag.mp_ctrl_mp(a, b).unwrap();
        dag.mp_ctrl_mp(b, a).unwrap();
        let err = dag.finalize().unwrap_err();
        assert!(matches!(err, Error::EmpIncorrectInput(_)));
    }

    #[test]
    fn cycle_below_the_root_is_rejected() {
        let mut ctr = small_ctr(3, 3);
        let mut dag = EmpDag::new();
        let a = opt_mp(&mut dag, &mut ctr, 0, 0);
        let b = opt_mp(&mut dag, &mut ctr, 1, 1);
        let c = opt_mp(&mut dag, &mut ctr, 2, 2);
        dag.mp_ctrl_mp(a, b).unwrap();
        dag.mp_ctrl_mp(b, c).unwrap();
        dag.mp_ctrl_mp(c, b).unwrap();
        let err = dag.finalize().unwrap_err();
        assert!(matches!(err, Error::EmpRuntimeError(_)));
    }

    #[test]
    fn subdag_enumeration_is_sorted() {
        let mut ctr = small_ctr(3, 3);
        let mut dag = EmpDag::new();
        let a = opt_mp(&mut dag, &mut ctr, 0, 0);
        let b = opt_mp(&mut dag, &mut ctr, 1, 1);
        let c = opt_mp(&mut dag, &mut ctr, 2, 2);
        dag.mp_ctrl_mp(a, c).unwrap();
        dag.mp_ctrl_mp(a, b).unwrap();
        assert_eq!(dag.subdag_mplist(DagUid::mp(a)).unwrap(), vec![a, b, c]);
        assert_eq!(dag.subdag_mplist(DagUid::mp(b)).unwrap(), vec![b]);
    }

    #[test]
    fn forwarding_chain_detects_cycles() {
        let mut ctr = small_ctr(2, 2);
        let mut dag = EmpDag::new();
        let a = opt_mp(&mut dag, &mut ctr, 0, 0);
        let b = opt_mp(&mut dag, &mut ctr, 1, 1);
        dag.mp_mut(a).unwrap().set_next_id(b);
        assert_eq!(dag.mp_cur_id(a).unwrap(), b);
        dag.mp_mut(b).unwrap().set_next_id(a);
        assert!(matches!(dag.mp_cur_id(a), Err(Error::RuntimeError(_))));
    }

    #[test]
    fn delete_only_last_added_isolated_node() {
        let mut ctr = small_ctr(2, 2);
        let mut dag = EmpDag::new();
        let a = opt_mp(&mut dag, &mut ctr, 0, 0);
        let b = opt_mp(&mut dag, &mut ctr, 1, 1);
        assert!(dag.delete(DagUid::mp(a)).is_err());
        dag.delete(DagUid::mp(b)).unwrap();
        assert_eq!(dag.num_mps(), 1);
    }

    #[test]
    fn single_mp_to_nash_rewires_the_root() {
        let mut ctr = small_ctr(1, 1);
        let mut dag = EmpDag::new();
        opt_mp(&mut dag, &mut ctr, 0, 0);
        let nash = dag.single_mp_to_nash().unwrap();
        dag.finalize().unwrap();
        assert_eq!(dag.uid_root(), Some(DagUid::nash(nash)));
        assert_eq!(dag.type_(), EmpDagType::Mopec);
    }
}
