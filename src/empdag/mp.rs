//! Mathematical program (MP) nodes.

use bitflags::bitflags;

use crate::empdag::uid::MpId;
use crate::error::Error;
use crate::{Ei, IDX_NA, Idx, Sense, Vi, valid_idx};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MpStatus: u8 {
        const FINALIZED = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MpType {
    #[default]
    Undef,
    Opt,
    Vi,
    /// A conic convex functional placeholder; must be reformulated before
    /// the FOOC pass can run.
    Ccflib,
}

impl MpType {
    pub fn name(self) -> &'static str {
        match self {
            MpType::Undef => "undefined",
            MpType::Opt => "optimization",
            MpType::Vi => "VI",
            MpType::Ccflib => "CCF",
        }
    }
}

/// One optimization or VI problem: owned variables and equations, and for
/// optimization a sense and an objective (variable or equation).
#[derive(Debug, Clone)]
pub struct MathPrgm {
    id: MpId,
    type_: MpType,
    sense: Sense,
    vars: Vec<Vi>,
    equs: Vec<Ei>,
    objequ: Idx,
    objvar: Idx,
    /// VI bookkeeping: constraints and zero-function matches.
    num_cons: usize,
    num_zeros: usize,
    status: MpStatus,
    /// Forwarding chain towards the MP that replaced this one.
    next_id: Option<MpId>,
}

impl MathPrgm {
    pub fn new(id: MpId, sense: Sense) -> Result<Self, Error> {
        let type_ = match sense {
            Sense::Min | Sense::Max => MpType::Opt,
            Sense::Feas => MpType::Vi,
            other => {
                return Err(Error::InvalidValue(format!(
                    "cannot create an MP with sense {}",
                    other.name()
                )));
            }
        };
        Ok(Self {
            id,
            type_,
            sense,
            vars: Vec::new(),
            equs: Vec::new(),
            objequ: IDX_NA,
            objvar: IDX_NA,
            num_cons: 0,
            num_zeros: 0,
            status: MpStatus::empty(),
            next_id: None,
        })
    }

    pub fn new_ccflib(id: MpId, sense: Sense) -> Self {
        Self {
            id,
            type_: MpType::Ccflib,
            sense,
            vars: Vec::new(),
            equs: Vec::new(),
            objequ: IDX_NA,
            objvar: IDX_NA,
            num_cons: 0,
            num_zeros: 0,
            status: MpStatus::empty(),
            next_id: None,
        }
    }

    pub fn id(&self) -> MpId {
        self.id
    }

    pub fn type_(&self) -> MpType {
        self.type_
    }

    pub fn sense(&self) -> Sense {
        self.sense
    }

    pub fn vars(&self) -> &[Vi] {
        &self.vars
    }

    pub fn equs(&self) -> &[Ei] {
        &self.equs
    }

    pub fn objequ(&self) -> Option<Ei> {
        valid_idx(self.objequ).then_some(self.objequ)
    }

    pub fn objvar(&self) -> Option<Vi> {
        valid_idx(self.objvar).then_some(self.objvar)
    }

    /// Number of VI constraints.
    pub fn num_cons(&self) -> usize {
        self.num_cons
    }

    /// Number of variables matched with the zero function.
    pub fn num_zeros(&self) -> usize {
        self.num_zeros
    }

    pub fn is_finalized(&self) -> bool {
        self.status.contains(MpStatus::FINALIZED)
    }

    pub fn next_id(&self) -> Option<MpId> {
        self.next_id
    }

    /// Mark this MP as replaced by a successor.
    pub fn set_next_id(&mut self, next: MpId) {
        self.next_id = Some(next);
    }

    fn guard_mutable(&self) -> Result<(), Error> {
        if self.is_finalized() {
            return Err(Error::UnexpectedData(format!(
                "MP #{} is finalized and cannot be mutated",
                self.id
            )));
        }
        Ok(())
    }

    pub(crate) fn add_var(&mut self, vi: Vi) -> Result<(), Error> {
        self.guard_mutable()?;
        if self.vars.contains(&vi) {
            return Err(Error::UnexpectedData(format!(
                "variable {vi} already belongs to MP #{}",
                self.id
            )));
        }
        self.vars.push(vi);
        Ok(())
    }

    pub(crate) fn add_constraint(&mut self, ei: Ei) -> Result<(), Error> {
        self.guard_mutable()?;
        if self.equs.contains(&ei) {
            return Err(Error::UnexpectedData(format!(
                "equation {ei} already belongs to MP #{}",
                self.id
            )));
        }
        self.equs.push(ei);
        self.num_cons += 1;
        Ok(())
    }

    /// Add a VI pair: a variable matched with a function (or the zero
    /// function when `ei` is `None`).
    pub(crate) fn add_vi_pair(&mut self, ei: Option<Ei>, vi: Vi) -> Result<(), Error> {
        self.guard_mutable()?;
        if self.type_ != MpType::Vi {
            return Err(Error::OperationNotAllowed(format!(
                "MP #{} is a {} problem, not a VI",
                self.id,
                self.type_.name()
            )));
        }
        self.vars.push(vi);
        match ei {
            Some(ei) => self.equs.push(ei),
            None => self.num_zeros += 1,
        }
        Ok(())
    }

    pub(crate) fn set_objvar(&mut self, vi: Vi) -> Result<(), Error> {
        self.guard_mutable()?;
        if valid_idx(self.objvar) {
            return Err(Error::UnexpectedData(format!(
                "MP #{} already has objective variable {}",
                self.id, self.objvar
            )));
        }
        self.objvar = vi;
        Ok(())
    }

    pub(crate) fn set_objequ(&mut self, ei: Ei) -> Result<(), Error> {
        self.guard_mutable()?;
        if valid_idx(self.objequ) {
            return Err(Error::UnexpectedData(format!(
                "MP #{} already has objective equation {}",
                self.id, self.objequ
            )));
        }
        self.objequ = ei;
        Ok(())
    }

    /// Verify structural consistency and seal the MP. Idempotent.
    pub fn finalize(&mut self) -> Result<(), Error> {
        if self.is_finalized() {
            return Ok(());
        }
        match self.type_ {
            MpType::Opt => {
                let has_objvar = valid_idx(self.objvar);
                let has_objequ = valid_idx(self.objequ);
                if has_objvar && has_objequ {
                    return Err(Error::Inconsistency(format!(
                        "MP #{}: both an objective variable ({}) and an objective \
                         equation ({}) are set",
                        self.id, self.objvar, self.objequ
                    )));
                }
                if !has_objvar && !has_objequ {
                    return Err(Error::EmpIncorrectInput(format!(
                        "MP #{}: {} problem without objective data",
                        self.id,
                        self.sense.name()
                    )));
                }
            }
            MpType::Vi => {
                if self.num_zeros > self.vars.len() {
                    return Err(Error::EmpIncorrectInput(format!(
                        "MP #{}: {} zero functions for {} variables",
                        self.id,
                        self.num_zeros,
                        self.vars.len()
                    )));
                }
            }
            MpType::Ccflib => {}
            MpType::Undef => {
                return Err(Error::EmpIncorrectInput(format!(
                    "MP #{} has no type",
                    self.id
                )));
            }
        }
        self.status |= MpStatus::FINALIZED;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opt_mp_requires_exactly_one_objective() {
        let mut mp = MathPrgm::new(0, Sense::Min).unwrap();
        assert!(matches!(
            mp.finalize(),
            Err(Error::EmpIncorrectInput(_))
        ));
        mp.set_objvar(0).unwrap();
        mp.set_objequ(0).unwrap();
        assert!(matches!(mp.finalize(), Err(Error::Inconsistency(_))));
    }

    #[test]
    fn finalize_is_idempotent_and_seals() {
        let mut mp = MathPrgm::new(0, Sense::Min).unwrap();
        mp.set_objvar(3).unwrap();
        mp.finalize().unwrap();
        mp.finalize().unwrap();
        assert!(mp.add_var(1).is_err());
    }

    #[test]
    fn vi_pairs_count_zero_functions() {
        let mut mp = MathPrgm::new(1, Sense::Feas).unwrap();
        mp.add_vi_pair(Some(0), 0).unwrap();
        mp.add_vi_pair(None, 1).unwrap();
        assert_eq!(mp.num_zeros(), 1);
        assert_eq!(mp.vars().len(), 2);
        assert_eq!(mp.equs().len(), 1);
    }
}
