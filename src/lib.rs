//! # remold
//!
//! A reformulation engine for mathematical programming and equilibrium
//! models. Given a model populated by a front end (an optimization problem,
//! a variational inequality, a Nash equilibrium, a bilevel program), the
//! engine rewrites it into a form a downstream numerical solver consumes:
//! typically a Mixed Complementarity Problem (MCP) obtained by symbolic
//! differentiation and normal-cone assembly, or an MPEC for bilevel inputs.
//!
//! The crate is organized around the reformulation pipeline:
//! - [`algebra`]: linear parts, expression trees, the shared constant pool,
//!   and symbolic differentiation.
//! - [`container`]: the holder of variables and equations with their
//!   cross-reference matrix and metadata.
//! - [`filter`]: pluggable predicates selecting which entities of a source
//!   model participate in a transformation.
//! - [`rosetta`]: dense old-index → new-index maps, stacked across a chain
//!   of derived models.
//! - [`empdag`]: the DAG of mathematical programs and Nash nodes.
//! - [`model`]: the model shell tying a container and an EMPDAG together,
//!   with upstream linkage and solution reporting.
//! - [`fooc`]: the first-order-optimality builder producing the MCP.
//! - [`transform`]: the orchestrator choosing a reformulation path.
//! - [`driver`]: the solver-facing view of a finalized MCP.

use serde::{Deserialize, Serialize};

pub mod algebra;
pub mod container;
pub mod driver;
pub mod empdag;
pub mod error;
pub mod filter;
pub mod fooc;
pub mod model;
pub mod options;
pub mod rosetta;
pub mod timings;
pub mod transform;

#[cfg(test)]
pub mod tests;

pub use error::Error;

/// Scalar element type used throughout the engine.
pub type E = f64;

/// Index type for variables, equations and pool entries.
pub type Idx = usize;

/// Variable index.
pub type Vi = Idx;
/// Equation index.
pub type Ei = Idx;

/// Largest index treated as valid; everything at or above is a sentinel.
pub const IDX_MAX_VALID: Idx = usize::MAX - 3;
/// A name lookup returned nothing.
pub const IDX_NOT_FOUND: Idx = usize::MAX - 2;
/// Programming error marker.
pub const IDX_INVALID: Idx = usize::MAX - 1;
/// Explicit "not applicable" (e.g. a dropped entity in a rosetta).
pub const IDX_NA: Idx = usize::MAX;

/// Validity predicate for the index sentinel scheme.
#[inline]
pub const fn valid_idx(idx: Idx) -> bool {
    idx < IDX_MAX_VALID
}

/// Basis status of a variable or equation, as exchanged with solvers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BasisStatus {
    Lower,
    Upper,
    Basic,
    SuperBasic,
    Fixed,
    #[default]
    Unset,
}

/// Optimization sense of a mathematical program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Sense {
    Min,
    Max,
    /// Pure feasibility: no objective.
    Feas,
    /// Sense of a dual problem, fixed by its primal.
    DualSense,
    #[default]
    NoSense,
}

impl Sense {
    pub fn name(self) -> &'static str {
        match self {
            Sense::Min => "min",
            Sense::Max => "max",
            Sense::Feas => "feasibility",
            Sense::DualSense => "dual",
            Sense::NoSense => "none",
        }
    }
}

/// Problem type of a model, in the solver-facing classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ModelType {
    #[default]
    Unset,
    Lp,
    Qcp,
    Nlp,
    /// Nonsmooth NLP; reached when differentiation meets a nonsmooth function.
    Dnlp,
    Mip,
    Minlp,
    Cns,
    Mcp,
    Mpec,
    Vi,
    Emp,
}

impl ModelType {
    pub fn name(self) -> &'static str {
        match self {
            ModelType::Unset => "unset",
            ModelType::Lp => "lp",
            ModelType::Qcp => "qcp",
            ModelType::Nlp => "nlp",
            ModelType::Dnlp => "dnlp",
            ModelType::Mip => "mip",
            ModelType::Minlp => "minlp",
            ModelType::Cns => "cns",
            ModelType::Mcp => "mcp",
            ModelType::Mpec => "mpec",
            ModelType::Vi => "vi",
            ModelType::Emp => "emp",
        }
    }

    /// Types carrying an objective (variable or equation).
    pub fn is_opt(self) -> bool {
        matches!(
            self,
            ModelType::Lp
                | ModelType::Qcp
                | ModelType::Nlp
                | ModelType::Dnlp
                | ModelType::Mip
                | ModelType::Minlp
                | ModelType::Mpec
        )
    }

    /// Types for which variable/equation metadata is expected.
    pub fn has_metadata(self) -> bool {
        matches!(
            self,
            ModelType::Mcp | ModelType::Mpec | ModelType::Vi | ModelType::Emp
        )
    }
}
