//! Bookkeeping of one FOOC pass.

use serde::{Deserialize, Serialize};

use crate::empdag::uid::MpId;
use crate::{Ei, Idx};

/// MCP statistics produced by the FOOC builder; they survive on the target
/// model for post-processing.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct McpInfo {
    /// Size of the (square) MCP.
    pub mcp_size: usize,
    /// Number of primal variables.
    pub n_primalvars: usize,
    /// Number of constraints, i.e. of multipliers.
    pub n_constraints: usize,
    /// Number of affine constraints.
    pub n_lincons: usize,
    /// Number of nonlinear constraints.
    pub n_nlcons: usize,
    /// Number of VI functions.
    pub n_vifuncs: usize,
    /// Number of VI zero functions.
    pub n_vizerofuncs: usize,
    /// Primal variables that are differentiated (all of them, unless a
    /// subdag restricts the pass).
    pub n_foocvars: usize,
    /// Primal variables present in equations but not differentiated.
    pub n_auxvars: usize,
}

/// Scratch data threaded through the FOOC stages.
#[derive(Debug, Default)]
pub struct FoocData {
    pub info: McpInfo,
    /// Target primal variable → its stationarity row, `IDX_INVALID` for
    /// auxiliaries. `None` means the identity (whole-model FOOC).
    pub vi_primal2ei_f: Option<Vec<Idx>>,
    /// Inverse of `vi_primal2ei_f`, indexed by `row - ei_f_start`.
    pub ei_f2vi_primal: Option<Vec<Idx>>,
    /// Sorted source indices of the objective equations.
    pub objequs: Vec<Ei>,
    /// Per MP (position in `mps`): position of its objective equation in
    /// `objequs`, or a sentinel.
    pub mp2objequ: Vec<Idx>,
    pub ei_f_start: usize,
    pub ei_cons_start: usize,
    pub ei_lincons_start: usize,
    pub vi_mult_start: usize,
    pub src_total_n: usize,
    pub src_total_m: usize,
    /// The MPs participating in this pass, sorted.
    pub mps: Vec<MpId>,
}
