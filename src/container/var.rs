//! Decision variables.

use crate::container::cone::Cone;
use crate::error::Error;
use crate::{BasisStatus, E, Vi};

/// Discrete / structural type of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum VarType {
    #[default]
    Continuous,
    Binary,
    Integer,
    SemiContinuous,
    SemiInteger,
    Sos1,
    Sos2,
    Indicator,
    /// Member of a cone; the cone tag carries the payload.
    Conic(Cone),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Var {
    pub idx: Vi,
    pub lb: E,
    pub ub: E,
    pub value: E,
    pub multiplier: E,
    pub basis: BasisStatus,
    pub type_: VarType,
    pub(crate) active: bool,
}

impl Var {
    /// A free continuous variable.
    pub fn free(idx: Vi) -> Self {
        Self {
            idx,
            lb: E::NEG_INFINITY,
            ub: E::INFINITY,
            value: 0.,
            multiplier: 0.,
            basis: BasisStatus::Unset,
            type_: VarType::Continuous,
            active: true,
        }
    }

    pub fn bounded(idx: Vi, lb: E, ub: E) -> Result<Self, Error> {
        let mut var = Var::free(idx);
        var.set_bounds(lb, ub)?;
        Ok(var)
    }

    /// Set the bounds, enforcing `lb <= ub`. Equal bounds declare the
    /// variable fixed and pin its level.
    pub fn set_bounds(&mut self, lb: E, ub: E) -> Result<(), Error> {
        if lb > ub {
            return Err(Error::InvalidValue(format!(
                "variable {}: lower bound {lb} exceeds upper bound {ub}",
                self.idx
            )));
        }
        self.lb = lb;
        self.ub = ub;
        if lb == ub {
            self.value = lb;
            self.basis = BasisStatus::Fixed;
        }
        Ok(())
    }

    pub fn fix(&mut self, value: E) {
        self.lb = value;
        self.ub = value;
        self.value = value;
        self.basis = BasisStatus::Fixed;
    }

    pub fn is_fixed(&self) -> bool {
        self.lb == self.ub
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_are_validated() {
        assert!(Var::bounded(0, 1., 0.).is_err());
        let v = Var::bounded(0, 0., 10.).unwrap();
        assert!(!v.is_fixed());
    }

    #[test]
    fn equal_bounds_fix_the_level() {
        let mut v = Var::free(0);
        v.set_bounds(2.5, 2.5).unwrap();
        assert!(v.is_fixed());
        assert_eq!(v.value, 2.5);
        assert_eq!(v.basis, BasisStatus::Fixed);
    }
}
