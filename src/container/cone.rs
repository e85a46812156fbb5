//! Cones used by conic variables and `ConeInclusion` equations.

use crate::E;

/// A closed convex cone. The payload-carrying variants describe the
/// parameterized cones of conic programming.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Cone {
    /// No cone attached (the equation is not a cone inclusion).
    #[default]
    None,
    /// Non-negative orthant ℝ₊.
    RPlus,
    /// Non-positive orthant ℝ₋.
    RMinus,
    /// The singleton {0}.
    Zero,
    /// The whole line ℝ.
    R,
    Polyhedral,
    /// Second-order cone.
    Soc,
    /// Rotated second-order cone.
    Rsoc,
    Exp,
    DualExp,
    Power { alpha: E },
    DualPower { alpha: E },
}

impl Cone {
    pub fn name(self) -> &'static str {
        match self {
            Cone::None => "none",
            Cone::RPlus => "R+",
            Cone::RMinus => "R-",
            Cone::Zero => "{0}",
            Cone::R => "R",
            Cone::Polyhedral => "polyhedral",
            Cone::Soc => "SOC",
            Cone::Rsoc => "RSOC",
            Cone::Exp => "EXP",
            Cone::DualExp => "EXP*",
            Cone::Power { .. } => "POWER",
            Cone::DualPower { .. } => "POWER*",
        }
    }

    /// The scalar polyhedral cones, the only ones the FOOC builder pairs
    /// multipliers with.
    pub fn is_scalar_polyhedral(self) -> bool {
        matches!(self, Cone::RPlus | Cone::RMinus | Cone::Zero | Cone::R)
    }

    /// Dual cone of a scalar polyhedral cone.
    pub fn dual(self) -> Option<Cone> {
        match self {
            Cone::RPlus => Some(Cone::RPlus),
            Cone::RMinus => Some(Cone::RMinus),
            Cone::Zero => Some(Cone::R),
            Cone::R => Some(Cone::Zero),
            _ => None,
        }
    }

    /// Bounds of a multiplier living in this cone.
    pub fn var_bounds(self) -> Option<(E, E)> {
        match self {
            Cone::RPlus => Some((0., E::INFINITY)),
            Cone::RMinus => Some((E::NEG_INFINITY, 0.)),
            Cone::R => Some((E::NEG_INFINITY, E::INFINITY)),
            Cone::Zero => Some((0., 0.)),
            _ => None,
        }
    }
}
