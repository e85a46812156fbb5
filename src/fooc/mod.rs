//! First-order optimality conditions.
//!
//! Builds, symbolically, the MCP of a source model into a target model
//! linked upstream to it:
//!
//! ```text
//!                     | x |   primal variables
//! The variables are   | μ |   multipliers of the nonlinear constraints
//!                     | λ |   multipliers of the affine constraints
//!
//! The functional part   |  ±∇ₓf  − (∇ₓg^NL)ᵀ μ  −  Aᵀ λ  |
//!                       |            g^NL(x)             |
//!                       |            Ax + b              |
//! ```
//!
//! Multipliers live in the dual cone (not the polar), so constraints are
//! copied as-is and the pairing reads `g ⟂ μ ∈ Y`.

pub mod data;

use std::collections::HashSet;

use crate::algebra::diff::SdTool;
use crate::algebra::lequ::Lequ;
use crate::algebra::tree::NlTree;
use crate::container::{Equ, EquObject, PairKind, Var, VarBasicType};
use crate::empdag::uid::valid_mpid;
use crate::empdag::{MathPrgm, MpType};
use crate::error::Error;
use crate::filter::{FilterOps, Fops, FopsActive};
use crate::model::{Model, ModelRef};
use crate::rosetta::{RosettaLayer, Rosettas};
use crate::timings::Stopwatch;
use crate::{BasisStatus, E, Ei, IDX_INVALID, IDX_NA, Idx, ModelType, Sense, Vi, valid_idx};

pub use data::{FoocData, McpInfo};

/// Result of a FOOC pass.
#[derive(Debug, Default)]
pub struct FoocOutcome {
    pub info: McpInfo,
    /// Source indices of the objective equations, to be appended to the
    /// source's evaluation list.
    pub objequs: Vec<Ei>,
    /// A nonsmooth function was differentiated; the source's problem type
    /// must degrade to `dnlp`.
    pub nonsmooth: bool,
}

/// Build the MCP of the source model (the upstream of `mdl_mcp`) into
/// `mdl_mcp`. `fops` selects the participating entities; `None` means the
/// whole active model.
pub fn fooc_mcp(mdl_mcp: &mut Model, fops: Option<&Fops>) -> Result<FoocOutcome, Error> {
    let sw = Stopwatch::start();
    let timings = mdl_mcp.timings();

    mdl_mcp.set_probtype(ModelType::Mcp);

    let src_rc: ModelRef = mdl_mcp
        .mdl_up()
        .cloned()
        .ok_or(Error::MissingInput("the source model is missing"))?;
    let src = src_rc.borrow();

    if !src.ops().supports_mutation() {
        return Err(Error::NotImplemented(
            "FOOC with a non-RHP source container",
        ));
    }

    let default_fops = Fops::from(FopsActive);
    let fops = fops.unwrap_or(&default_fops);

    let mut data = FoocData {
        src_total_n: src.ctr.total_n(),
        src_total_m: src.ctr.total_m(),
        ..FoocData::default()
    };

    gather_mps(&src, fops, &mut data)?;
    check_mps_supported(&src, &data)?;

    let (n_primalvars, n_equs4mcp) = fops.get_sizes(&src.ctr);
    data.vi_mult_start = n_primalvars;

    fill_objequs_and_get_vifuncs(&src, fops, &mut data)?;

    let skipped = data.objequs.len() + data.info.n_vifuncs;
    if n_equs4mcp < skipped {
        return Err(Error::RuntimeError(format!(
            "{} equations participate, but {} objective equations and {} VI \
             functions were found",
            n_equs4mcp,
            data.objequs.len(),
            data.info.n_vifuncs
        )));
    }
    let cons_size = n_equs4mcp - skipped;

    let n_foocvars = match fops {
        Fops::SubDag(sd) => sd.n_subdag_vars(),
        _ => n_primalvars,
    };
    data.info.n_primalvars = n_primalvars;
    data.info.n_foocvars = n_foocvars;
    data.info.n_auxvars = n_primalvars - n_foocvars;
    data.info.n_constraints = cons_size;
    let mcp_size = cons_size + n_foocvars;
    data.info.mcp_size = mcp_size;

    /* ----------------------------------------------------------------------
     * Reserve the target: more variable slots than mcp_size, as auxiliary
     * (non-differentiated) variables may flow through.
     * ---------------------------------------------------------------------- */

    mdl_mcp.ctr.reserve_totals(n_primalvars + cons_size, mcp_size);

    let rosetta_vars = src.ctr.compress_vars(fops, &mut mdl_mcp.ctr)?;
    mdl_mcp.rosetta_vars = Some(rosetta_vars);

    let rosettas = compute_all_rosettas(mdl_mcp, &src)?;

    build_f_row_maps(mdl_mcp, fops, &mut data)?;

    count_lincons(&src, fops, &mut data, cons_size)?;

    data.ei_f_start = 0;
    data.ei_cons_start = n_foocvars;
    data.ei_lincons_start = data.ei_cons_start + data.info.n_nlcons;

    if mcp_size < data.info.n_lincons + n_foocvars {
        return Err(Error::RuntimeError(format!(
            "number of affine constraints ({}) exceeds the number of \
             multipliers ({})",
            data.info.n_lincons,
            mcp_size - n_foocvars
        )));
    }

    tracing::info!(
        target: "fooc",
        "model '{}' has an MCP of size {mcp_size}: {n_primalvars} primal \
         variable(s) ({n_foocvars} differentiated, {} auxiliary), {} VI \
         function(s), {} zero VI function(s), {cons_size} constraint(s) \
         ({} affine, {} nonlinear)",
        src.name(),
        data.info.n_auxvars,
        data.info.n_vifuncs,
        data.info.n_vizerofuncs,
        data.info.n_lincons,
        data.info.n_nlcons,
    );

    let vifuncs_src = inject_vifunc_and_cons(mdl_mcp, &src, fops, &mut data, &rosettas)?;

    /* ----------------------------------------------------------------------
     * Stationarity rows. Collect the constraints per MP first, then build
     * every dL/dx and the normal-cone contributions.
     * ---------------------------------------------------------------------- */

    let mut nonsmooth = false;

    if data.mps.is_empty() {
        let cons_nl: Vec<Ei> = (data.ei_cons_start..data.ei_lincons_start).collect();
        let cons_lin: Vec<Ei> = (data.ei_lincons_start..mcp_size).collect();

        if let Some(&objequ) = data.objequs.first() {
            primal_opt(
                mdl_mcp,
                &src,
                None,
                &cons_nl,
                &cons_lin,
                &data,
                Some(objequ),
                &rosettas,
                &mut nonsmooth,
            )?;
        } else if src.objvar().is_some() && matches!(src.sense(), Sense::Min | Sense::Max) {
            primal_opt(
                mdl_mcp,
                &src,
                None,
                &cons_nl,
                &cons_lin,
                &data,
                None,
                &rosettas,
                &mut nonsmooth,
            )?;
        } else {
            let probtype = src.probtype();
            let single_vi = probtype == ModelType::Vi
                || (probtype == ModelType::Emp
                    && src.empdag_type() == crate::empdag::EmpDagType::SingleVi);
            if single_vi {
                primal_vi(mdl_mcp, &cons_nl, &cons_lin, &data, None, &mut nonsmooth)?;
            } else if probtype == ModelType::Mcp {
                return Err(Error::UnexpectedData(
                    "the source already is an MCP; its optimality conditions are itself".into(),
                ));
            } else {
                return Err(Error::WrongModelForFunction {
                    expected: "opt, VI or EMP",
                    got: probtype.name(),
                });
            }
        }
    } else {
        let rosetta_equs = mdl_mcp
            .rosetta_equs
            .clone()
            .ok_or(Error::RuntimeError("equation rosetta not built".into()))?;

        for (pos, &mpid) in data.mps.clone().iter().enumerate() {
            let mp = src.empinfo.empdag.mp(mpid)?.clone();

            let mut cons_nl = Vec::new();
            let mut cons_lin = Vec::new();
            for &ei_src in mp.equs() {
                let ei_mcp = rosetta_equs.get(ei_src).copied().unwrap_or(IDX_NA);
                if !valid_idx(ei_mcp) || ei_mcp < data.ei_cons_start {
                    // dropped or a VI function
                    continue;
                }
                if ei_mcp >= data.ei_lincons_start {
                    cons_lin.push(ei_mcp);
                } else {
                    cons_nl.push(ei_mcp);
                }
            }

            match mp.type_() {
                MpType::Opt => {
                    let objequ_pos = data.mp2objequ[pos];
                    let objequ = if valid_idx(objequ_pos) {
                        Some(data.objequs[objequ_pos])
                    } else {
                        None
                    };
                    primal_opt(
                        mdl_mcp,
                        &src,
                        Some(&mp),
                        &cons_nl,
                        &cons_lin,
                        &data,
                        objequ,
                        &rosettas,
                        &mut nonsmooth,
                    )?;
                }
                MpType::Vi => {
                    primal_vi(mdl_mcp, &cons_nl, &cons_lin, &data, Some(&mp), &mut nonsmooth)?;
                }
                other => {
                    return Err(Error::NotImplemented(match other {
                        MpType::Ccflib => "FOOC over a CCF mathematical program",
                        _ => "FOOC over an untyped mathematical program",
                    }));
                }
            }
        }
    }

    /* ----------------------------------------------------------------------
     * Missing matches: a variable absent from the Lagrangian still gets
     * paired with its own row. Then canonicalize every F row.
     * ---------------------------------------------------------------------- */

    for ei in data.ei_f_start..data.ei_cons_start {
        if mdl_mcp.ctr.equ_perp(ei).is_none() {
            let vi = match &data.ei_f2vi_primal {
                Some(map) => map[ei - data.ei_f_start],
                None => ei,
            };
            mdl_mcp.ctr.set_equ_var_perp(ei, vi, PairKind::ViFunction)?;
        }
        mdl_mcp.ctr.sync_equ_cmat(ei)?;
        mdl_mcp.ctr.fix_equ(ei)?;
    }

    let nvars_expected = data.info.n_primalvars + data.info.n_constraints;
    if mdl_mcp.ctr.n() < nvars_expected {
        return Err(Error::RuntimeError(format!(
            "the MCP container has {} active variables, at least {nvars_expected} \
             are expected",
            mdl_mcp.ctr.n()
        )));
    }
    if mdl_mcp.ctr.m() != mcp_size {
        return Err(Error::RuntimeError(format!(
            "the MCP container has {} active equations, {mcp_size} are expected",
            mdl_mcp.ctr.m()
        )));
    }

    let mut func2eval = data.objequs.clone();
    func2eval.extend(vifuncs_src);

    mdl_mcp.mcp_info = Some(data.info);

    sw.stop_into(&mut timings.borrow_mut().fooc);

    Ok(FoocOutcome {
        info: data.info,
        objequs: func2eval,
        nonsmooth,
    })
}

/// Identify the participating MPs from the filter (or the EMPDAG root).
fn gather_mps(src: &Model, fops: &Fops, data: &mut FoocData) -> Result<(), Error> {
    let empdag = &src.empinfo.empdag;
    if let Fops::SubDag(sd) = fops {
        data.mps = sd.mplist().to_vec();
        return Ok(());
    }
    if empdag.exists() {
        let roots = empdag.roots();
        if roots.len() != 1 {
            return Err(Error::EmpRuntimeError(format!(
                "model '{}': {} roots detected, FOOC needs a unique root",
                src.name(),
                roots.len()
            )));
        }
        data.mps = empdag.subdag_mplist(roots[0])?;
    }
    Ok(())
}

/// FOOC requires childless MPs: value-function or control children must
/// have been reformulated away first.
fn check_mps_supported(src: &Model, data: &FoocData) -> Result<(), Error> {
    let empdag = &src.empinfo.empdag;
    for &mpid in &data.mps {
        if empdag.mp_has_child(mpid) {
            return Err(Error::OperationNotAllowed(format!(
                "MP #{mpid} still has children; FOOC needs a flat (sub)dag"
            )));
        }
    }
    Ok(())
}

/// Collect the objective equations (sorted, with both-way maps) and count
/// the VI functions.
fn fill_objequs_and_get_vifuncs(
    src: &Model,
    fops: &Fops,
    data: &mut FoocData,
) -> Result<(), Error> {
    let mut n_vifuncs = 0usize;
    let mut n_vizerofuncs = 0usize;

    if data.mps.is_empty() {
        let objvar = src.objvar();
        let objequ = src.objequ();
        let sense = src.sense();

        if objvar.is_some() && objequ.is_some() {
            return Err(Error::Inconsistency(format!(
                "model '{}': both an objective variable and an objective \
                 equation are set; exactly one is supported",
                src.name()
            )));
        }
        if let Some(objequ) = objequ {
            if objequ >= data.src_total_m {
                return Err(Error::IndexOutOfRange {
                    idx: objequ,
                    len: data.src_total_m,
                });
            }
            data.objequs.push(objequ);
        } else if objvar.is_none() && sense != Sense::Feas {
            return Err(Error::Inconsistency(format!(
                "model '{}': sense is {}, but neither an objective variable \
                 nor an objective equation was given",
                src.name(),
                sense.name()
            )));
        }

        if sense == Sense::Feas && src.probtype() == ModelType::Vi {
            let varmeta = src.ctr.varmeta.as_ref().ok_or_else(|| {
                Error::IncompleteMetadata(format!(
                    "VI model '{}' has no variable metadata",
                    src.name()
                ))
            })?;
            for vi in 0..src.ctr.total_n() {
                if !fops.keep_var(&src.ctr, vi) {
                    continue;
                }
                match varmeta[vi].basic_type() {
                    VarBasicType::PerpToViFunction => n_vifuncs += 1,
                    VarBasicType::PerpToZeroFunctionVi => n_vizerofuncs += 1,
                    VarBasicType::Plain => {}
                }
            }
        }

        data.info.n_vifuncs = n_vifuncs;
        data.info.n_vizerofuncs = n_vizerofuncs;
        return Ok(());
    }

    data.mp2objequ = vec![IDX_NA; data.mps.len()];
    let mut objequ2mp: Vec<Idx> = Vec::new();

    for (pos, &mpid) in data.mps.iter().enumerate() {
        let mp = src.empinfo.empdag.mp(mpid)?;
        match mp.type_() {
            MpType::Opt => {
                let objvar = mp.objvar();
                let objequ = mp.objequ();
                if objvar.is_some() && objequ.is_some() {
                    return Err(Error::EmpIncorrectInput(format!(
                        "MP #{mpid}: both an objective variable and an \
                         objective equation are set"
                    )));
                }
                if objvar.is_none() && objequ.is_none() {
                    return Err(Error::EmpIncorrectInput(format!(
                        "MP #{mpid}: no objective data"
                    )));
                }
                if let Some(objequ) = objequ {
                    if objequ >= data.src_total_m {
                        return Err(Error::IndexOutOfRange {
                            idx: objequ,
                            len: data.src_total_m,
                        });
                    }
                    // sorted insertion, keeping both-way maps coherent
                    let at = data.objequs.partition_point(|&e| e < objequ);
                    data.objequs.insert(at, objequ);
                    objequ2mp.insert(at, pos);
                    for (k, &mp_pos) in objequ2mp.iter().enumerate() {
                        data.mp2objequ[mp_pos] = k;
                    }
                }
            }
            MpType::Vi => {
                let zeros = mp.num_zeros();
                n_vizerofuncs += zeros;
                n_vifuncs += mp.vars().len() - zeros;
            }
            MpType::Ccflib => {
                return Err(Error::NotImplemented(
                    "FOOC over a CCF mathematical program",
                ));
            }
            MpType::Undef => {
                return Err(Error::EmpIncorrectInput(format!("MP #{mpid} has no type")));
            }
        }
    }

    data.info.n_vifuncs = n_vifuncs;
    data.info.n_vizerofuncs = n_vizerofuncs;

    tracing::debug!(
        target: "fooc",
        "found {} objective equation(s), {} VI function(s), {} zero VI function(s)",
        data.objequs.len(),
        n_vifuncs,
        n_vizerofuncs
    );
    Ok(())
}

/// Composed variable rosettas for every depth of the upstream chain.
fn compute_all_rosettas(mdl_mcp: &Model, src: &Model) -> Result<Rosettas, Error> {
    let mut layers = vec![RosettaLayer {
        total_n: src.ctr.total_n(),
        map_to_child: mdl_mcp.rosetta_vars.clone(),
    }];

    let mut child_rosetta = src.rosetta_vars.clone();
    let mut up = src.mdl_up().cloned();
    while let Some(ancestor) = up {
        let ancestor_ref = ancestor.borrow();
        layers.push(RosettaLayer {
            total_n: ancestor_ref.ctr.total_n(),
            map_to_child: child_rosetta,
        });
        child_rosetta = ancestor_ref.rosetta_vars.clone();
        up = ancestor_ref.mdl_up().cloned();
    }

    Rosettas::compute(&layers)
}

/// Build the primal-variable → stationarity-row maps for a subdag pass.
fn build_f_row_maps(mdl_mcp: &Model, fops: &Fops, data: &mut FoocData) -> Result<(), Error> {
    let Fops::SubDag(sd) = fops else {
        return Ok(());
    };
    let n_primal = data.info.n_primalvars;
    let varmeta = mdl_mcp.ctr.varmeta.as_ref().ok_or_else(|| {
        Error::IncompleteMetadata("subdag FOOC needs variable metadata".into())
    })?;

    let mut vi2ei = vec![IDX_INVALID; n_primal];
    let mut ei2vi = vec![IDX_INVALID; data.info.n_foocvars];
    let mut row = 0usize;
    for vi in 0..n_primal {
        let mp_id = varmeta[vi].mp_id;
        if valid_mpid(mp_id) && sd.owns_mp(mp_id) {
            vi2ei[vi] = row;
            ei2vi[row] = vi;
            row += 1;
        }
    }
    if row != data.info.n_foocvars {
        return Err(Error::RuntimeError(format!(
            "{row} variables tagged for the first-order conditions, {} expected",
            data.info.n_foocvars
        )));
    }
    data.vi_primal2ei_f = Some(vi2ei);
    data.ei_f2vi_primal = Some(ei2vi);
    Ok(())
}

/// Iterate the kept source equations, skipping the objective equations by
/// walking the intervals between their sorted indices.
fn for_each_kept_equ(
    src: &Model,
    fops: &Fops,
    objequs: &[Ei],
    total_m: usize,
    mut f: impl FnMut(Ei) -> Result<(), Error>,
) -> Result<(), Error> {
    let mut start = 0usize;
    for k in 0..=objequs.len() {
        let end = if k < objequs.len() { objequs[k] } else { total_m };
        for ei in start..end {
            if !src.ctr.equ(ei)?.is_active() || !fops.keep_equ(&src.ctr, ei) {
                continue;
            }
            f(ei)?;
        }
        start = end + 1;
    }
    Ok(())
}

fn count_lincons(
    src: &Model,
    fops: &Fops,
    data: &mut FoocData,
    cons_size: usize,
) -> Result<(), Error> {
    let mut n_lincons = 0usize;
    for_each_kept_equ(src, fops, &data.objequs.clone(), data.src_total_m, |ei| {
        let equ = src.ctr.equ(ei)?;
        if equ.object == EquObject::ConeInclusion && equ.is_affine() {
            n_lincons += 1;
        }
        Ok(())
    })?;
    if n_lincons > cons_size {
        return Err(Error::RuntimeError(format!(
            "{n_lincons} affine constraints counted for {cons_size} constraint slots"
        )));
    }
    data.info.n_lincons = n_lincons;
    data.info.n_nlcons = cons_size - n_lincons;
    Ok(())
}

/// Fetch an equation body from the model that defines it, remapping the
/// variables into the target space with the composed rosetta of that depth.
fn fetch_equ_remapped(mdl: &Model, ei: Ei, depth: usize, rosettas: &Rosettas) -> Result<Equ, Error> {
    if let Some(ei_up) = mdl.ctr.equ_inherited(ei) {
        let up = mdl
            .mdl_up()
            .cloned()
            .ok_or(Error::MissingInput("inherited equation without an upstream"))?;
        let up_ref = up.borrow();
        return fetch_equ_remapped(&up_ref, ei_up, depth + 1, rosettas);
    }

    let map = rosettas.at(depth)?;
    let e = mdl.ctr.equ(ei)?;
    let tree = match &e.tree {
        Some(tree) => {
            let t = tree.dup_rosetta(map)?;
            (!t.is_empty()).then_some(t)
        }
        None => None,
    };
    Ok(Equ {
        idx: IDX_NA,
        object: e.object,
        cone: e.cone,
        cst: e.cst,
        value: e.value,
        multiplier: e.multiplier,
        basis: e.basis,
        lequ: e.lequ.dup_rosetta(map)?,
        tree,
        active: true,
    })
}

/// Seed a multiplier variable from the constraint it matches.
fn copy_values_equ2mult(var: &mut Var, equ: &Equ) {
    var.value = if equ.multiplier.is_finite() {
        equ.multiplier
    } else if var.lb == 0. {
        1.
    } else {
        -1.
    };

    match equ.basis {
        BasisStatus::Lower | BasisStatus::Upper => {
            var.basis = BasisStatus::Basic;
            var.multiplier = 0.;
        }
        BasisStatus::Basic => {
            if var.ub.is_finite() {
                var.basis = BasisStatus::Upper;
                var.multiplier = -1.;
            } else {
                var.basis = BasisStatus::Lower;
                var.multiplier = 1.;
            }
        }
        _ => var.basis = BasisStatus::Unset,
    }
}

/// Copy the constraints and VI functions into the MCP, allocating one
/// multiplier per constraint and perp-pairing everything. Returns the
/// source indices of the VI functions, for the evaluation list.
fn inject_vifunc_and_cons(
    mdl_mcp: &mut Model,
    src: &Model,
    fops: &Fops,
    data: &mut FoocData,
    rosettas: &Rosettas,
) -> Result<Vec<Ei>, Error> {
    let rosetta_vars = mdl_mcp
        .rosetta_vars
        .clone()
        .ok_or(Error::RuntimeError("variable rosetta not built".into()))?;
    let mut rosetta_equs = vec![IDX_NA; data.src_total_m];

    let mut ei_nl = data.ei_cons_start;
    let mut ei_lin = data.ei_lincons_start;
    let mut vi_mult = data.vi_mult_start;
    let mut vifuncs: Vec<Ei> = Vec::with_capacity(data.info.n_vifuncs);

    if src.ctr.equmeta.is_some() {
        mdl_mcp.ctr.ensure_metadata();
    }

    let objequs = data.objequs.clone();
    let mut inject = |ei_src: Ei| -> Result<(), Error> {
        let mut equ = fetch_equ_remapped(src, ei_src, 0, rosettas)?;
        let ei;
        let vi;

        match equ.object {
            /* A mapping is one component of a VI: it lands on the row of
             * its matched primal variable. */
            EquObject::Mapping => {
                let equmeta = src.ctr.equmeta.as_ref().ok_or_else(|| {
                    Error::IncompleteMetadata(format!(
                        "mapping equation {ei_src} without metadata"
                    ))
                })?;
                let vi_src = equmeta[ei_src].dual;
                if !valid_idx(vi_src) {
                    return Err(Error::IncompleteMetadata(format!(
                        "VI function {ei_src} has no matched variable"
                    )));
                }
                let vi_dst = rosetta_vars.get(vi_src).copied().unwrap_or(IDX_NA);
                if !valid_idx(vi_dst) {
                    return Err(Error::RuntimeError(format!(
                        "VI variable {vi_src} was dropped but its function was kept"
                    )));
                }
                vi = vi_dst;
                ei = match &data.vi_primal2ei_f {
                    Some(map) => map[vi],
                    None => vi,
                };
                if vifuncs.len() >= data.info.n_vifuncs {
                    return Err(Error::RuntimeError(format!(
                        "processed {} mappings, but only {} VI functions were detected",
                        vifuncs.len() + 1,
                        data.info.n_vifuncs
                    )));
                }
                vifuncs.push(ei_src);
                tracing::trace!(target: "fooc", "VI mapping {ei_src} placed at row {ei}");
            }

            /* A constraint is copied as-is and matched with a fresh
             * multiplier in the dual cone. */
            EquObject::ConeInclusion => {
                if !equ.cone.is_scalar_polyhedral() {
                    return Err(Error::NotImplemented(
                        "conic constraints in the FOOC pass",
                    ));
                }
                ei = if equ.is_affine() {
                    let slot = ei_lin;
                    ei_lin += 1;
                    slot
                } else {
                    let slot = ei_nl;
                    ei_nl += 1;
                    slot
                };

                let dual = equ.cone.dual().ok_or(Error::NotImplemented(
                    "conic constraints in the FOOC pass",
                ))?;
                let (lb, ub) = dual.var_bounds().ok_or(Error::NotImplemented(
                    "conic constraints in the FOOC pass",
                ))?;
                let mut mult = Var::bounded(vi_mult, lb, ub)?;
                copy_values_equ2mult(&mut mult, &equ);
                mdl_mcp.ctr.install_var(vi_mult, mult)?;
                vi = vi_mult;
                vi_mult += 1;
                tracing::trace!(
                    target: "fooc",
                    "constraint {ei_src} placed at row {ei} with multiplier {vi}"
                );
            }

            EquObject::BooleanRelation => {
                return Err(Error::UnexpectedData(format!(
                    "equation {ei_src} is a boolean relation, not a constraint \
                     or mapping"
                )));
            }
        }

        rosetta_equs[ei_src] = ei;
        equ.object = EquObject::Mapping;
        mdl_mcp.ctr.install_equ(ei, equ)?;
        if let (Some(src_meta), Some(dst_meta)) =
            (&src.ctr.equmeta, &mut mdl_mcp.ctr.equmeta)
        {
            dst_meta[ei].mp_id = src_meta[ei_src].mp_id;
        }
        let kind = if ei >= data.ei_cons_start {
            PairKind::Constraint
        } else {
            PairKind::ViFunction
        };
        mdl_mcp.ctr.set_equ_var_perp(ei, vi, kind)?;
        Ok(())
    };

    for_each_kept_equ(src, fops, &objequs, data.src_total_m, &mut inject)?;

    if vifuncs.len() != data.info.n_vifuncs {
        return Err(Error::RuntimeError(format!(
            "expected {} VI mappings, only {} were added",
            data.info.n_vifuncs,
            vifuncs.len()
        )));
    }

    /* ----------------------------------------------------------------------
     * Zero VI functions: an empty mapping per matched variable.
     * ---------------------------------------------------------------------- */

    let mut n_zero = data.info.n_vizerofuncs;
    if n_zero > 0 {
        let varmeta = src.ctr.varmeta.as_ref().ok_or_else(|| {
            Error::IncompleteMetadata("zero VI functions without metadata".into())
        })?;
        for vi_src in 0..data.src_total_n {
            if n_zero == 0 {
                break;
            }
            if varmeta[vi_src].basic_type() != VarBasicType::PerpToZeroFunctionVi {
                continue;
            }
            let vi_new = rosetta_vars.get(vi_src).copied().unwrap_or(IDX_NA);
            if !valid_idx(vi_new) {
                continue;
            }
            let ei = match &data.vi_primal2ei_f {
                Some(map) => map[vi_new],
                None => vi_new,
            };
            mdl_mcp.ctr.install_equ(ei, Equ::empty_mapping(ei))?;
            mdl_mcp.ctr.set_equ_var_perp(ei, vi_new, PairKind::ViFunction)?;
            tracing::trace!(
                target: "fooc",
                "zero VI function added at row {ei} for variable {vi_new}"
            );
            n_zero -= 1;
        }
        if n_zero > 0 {
            return Err(Error::RuntimeError(format!(
                "{n_zero} zero VI functions could not be added"
            )));
        }
    }

    /* ----------------------------------------------------------------------
     * The remaining stationarity rows start as empty mappings.
     * ---------------------------------------------------------------------- */

    for ei in data.ei_f_start..data.ei_cons_start {
        if !mdl_mcp.ctr.equ(ei)?.is_active() {
            mdl_mcp.ctr.install_equ(ei, Equ::empty_mapping(ei))?;
        }
    }

    if ei_lin != data.info.mcp_size || ei_nl != data.ei_lincons_start {
        return Err(Error::RuntimeError(format!(
            "constraint slots inconsistent: affine cursor at {ei_lin}, \
             nonlinear cursor at {ei_nl}"
        )));
    }

    mdl_mcp.rosetta_equs = Some(rosetta_equs);
    Ok(vifuncs)
}

/// Unique variables of a body, in first-appearance order.
fn body_vars(lequ: &Lequ, tree: Option<&NlTree>) -> Vec<Vi> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (vi, _) in lequ.iter() {
        if seen.insert(vi) {
            out.push(vi);
        }
    }
    if let Some(tree) = tree {
        for &vi in tree.vlist() {
            if seen.insert(vi) {
                out.push(vi);
            }
        }
    }
    out
}

/// Target-space membership bitmap of an MP's variables.
fn mp_var_bitmap(mdl_mcp: &Model, mp: &MathPrgm, rosetta_vars: &[Idx]) -> Vec<bool> {
    let mut bitmap = vec![false; mdl_mcp.ctr.total_n()];
    for &vi_src in mp.vars() {
        if let Some(&vi) = rosetta_vars.get(vi_src)
            && valid_idx(vi)
        {
            bitmap[vi] = true;
        }
    }
    bitmap
}

fn f_row_of(data: &FoocData, vi: Vi) -> Result<Ei, Error> {
    let row = match &data.vi_primal2ei_f {
        Some(map) => *map.get(vi).ok_or(Error::IndexOutOfRange {
            idx: vi,
            len: map.len(),
        })?,
        None => vi,
    };
    if row == IDX_INVALID || row >= data.ei_cons_start {
        return Err(Error::RuntimeError(format!(
            "variable {vi} has no stationarity row"
        )));
    }
    Ok(row)
}

/// Stationarity rows of an optimization problem: `±∇f`, then the
/// normal-cone contributions of its constraints.
#[allow(clippy::too_many_arguments)]
fn primal_opt(
    mdl_mcp: &mut Model,
    src: &Model,
    mp: Option<&MathPrgm>,
    cons_nl: &[Ei],
    cons_lin: &[Ei],
    data: &FoocData,
    objequ: Option<Ei>,
    rosettas: &Rosettas,
    nonsmooth: &mut bool,
) -> Result<(), Error> {
    let rosetta_vars = mdl_mcp
        .rosetta_vars
        .clone()
        .ok_or(Error::RuntimeError("variable rosetta not built".into()))?;

    let sense = match mp {
        Some(mp) => mp.sense(),
        None => src.sense(),
    };
    let sign = match sense {
        Sense::Min => 1.,
        Sense::Max => -1.,
        other => {
            return Err(Error::InvalidValue(format!(
                "unsupported sense {} for an optimization problem",
                other.name()
            )));
        }
    };

    let var_in_mp = mp.map(|mp| mp_var_bitmap(mdl_mcp, mp, &rosetta_vars));

    match objequ {
        Some(objequ) => {
            let body = fetch_equ_remapped(src, objequ, 0, rosettas)?;
            let tool = SdTool::new(&body.lequ, body.tree.as_ref(), mdl_mcp.ctr.pool());
            for vi in body_vars(&body.lequ, body.tree.as_ref()) {
                if let Some(bitmap) = &var_in_mp
                    && !bitmap[vi]
                {
                    continue;
                }
                let deriv = tool.deriv(vi)?;
                if deriv.is_zero() {
                    continue;
                }
                let ei = f_row_of(data, vi)?;
                mdl_mcp.ctr.set_equ_var_perp(ei, vi, PairKind::ViFunction)?;
                mdl_mcp.ctr.equ_add_deriv(ei, &deriv, sign)?;
            }
            *nonsmooth |= tool.saw_nonsmooth();
        }
        None => {
            /* Implicit objective: the objective variable itself. Its
             * stationarity row is the constant ±1. */
            let objvar = match mp {
                Some(mp) => mp.objvar(),
                None => src.objvar(),
            }
            .ok_or_else(|| {
                Error::UnexpectedData(
                    "no valid objective variable and no objective equation".into(),
                )
            })?;
            let vi = rosetta_vars.get(objvar).copied().unwrap_or(IDX_NA);
            if !valid_idx(vi) {
                return Err(Error::RuntimeError(format!(
                    "objective variable {objvar} was dropped"
                )));
            }
            let ei = f_row_of(data, vi)?;
            mdl_mcp.ctr.set_equ_var_perp(ei, vi, PairKind::ViFunction)?;
            mdl_mcp.ctr.equ_mut(ei)?.set_cst(sign);
        }
    }

    add_nonlinear_normal_cone(mdl_mcp, cons_nl, var_in_mp.as_deref(), data, nonsmooth)?;
    add_polyhedral_normal_cone(mdl_mcp, cons_lin, var_in_mp.as_deref(), data)?;
    Ok(())
}

/// Stationarity rows of a VI: the functions were already copied in place;
/// only the normal-cone contributions of the VI's constraints remain.
fn primal_vi(
    mdl_mcp: &mut Model,
    cons_nl: &[Ei],
    cons_lin: &[Ei],
    data: &FoocData,
    mp: Option<&MathPrgm>,
    nonsmooth: &mut bool,
) -> Result<(), Error> {
    let var_in_mp = match mp {
        Some(mp) => {
            let rosetta_vars = mdl_mcp
                .rosetta_vars
                .clone()
                .ok_or(Error::RuntimeError("variable rosetta not built".into()))?;
            Some(mp_var_bitmap(mdl_mcp, mp, &rosetta_vars))
        }
        None => None,
    };
    add_nonlinear_normal_cone(mdl_mcp, cons_nl, var_in_mp.as_deref(), data, nonsmooth)?;
    add_polyhedral_normal_cone(mdl_mcp, cons_lin, var_in_mp.as_deref(), data)?;
    Ok(())
}

/// For every nonlinear constraint `g` with multiplier `μ`, add
/// `−μ ∂g/∂xⱼ` to the stationarity row of every variable `xⱼ` of the MP.
fn add_nonlinear_normal_cone(
    mdl_mcp: &mut Model,
    cons_nl: &[Ei],
    var_in_mp: Option<&[bool]>,
    data: &FoocData,
    nonsmooth: &mut bool,
) -> Result<(), Error> {
    for &ei in cons_nl {
        let vi_mult = mdl_mcp.ctr.equ_perp(ei).ok_or_else(|| {
            Error::RuntimeError(format!("constraint {ei} has no multiplier"))
        })?;
        let (lequ, tree) = {
            let equ = mdl_mcp.ctr.equ(ei)?;
            (equ.lequ.clone(), equ.tree.clone())
        };
        let tool = SdTool::new(&lequ, tree.as_ref(), mdl_mcp.ctr.pool());
        for vi in body_vars(&lequ, tree.as_ref()) {
            if vi == vi_mult {
                continue;
            }
            if let Some(bitmap) = var_in_mp
                && !bitmap[vi]
            {
                continue;
            }
            let deriv = tool.deriv(vi)?;
            if deriv.is_zero() {
                continue;
            }
            let row = f_row_of(data, vi)?;
            mdl_mcp.ctr.equ_sub_mul_deriv(row, &deriv, vi_mult)?;
        }
        *nonsmooth |= tool.saw_nonsmooth();
    }
    Ok(())
}

/// For every affine constraint row of `A` with multiplier `λ`, add
/// `−Aᵢⱼ λ` to the stationarity row of every variable `xⱼ` of the MP.
fn add_polyhedral_normal_cone(
    mdl_mcp: &mut Model,
    cons_lin: &[Ei],
    var_in_mp: Option<&[bool]>,
    data: &FoocData,
) -> Result<(), Error> {
    for &ei in cons_lin {
        let vi_mult = mdl_mcp.ctr.equ_perp(ei).ok_or_else(|| {
            Error::RuntimeError(format!("constraint {ei} has no multiplier"))
        })?;
        let terms: Vec<(Vi, E)> = mdl_mcp.ctr.equ(ei)?.lequ.iter().collect();
        for (vi, coeff) in terms {
            if vi == vi_mult {
                continue;
            }
            if let Some(bitmap) = var_in_mp
                && !bitmap[vi]
            {
                continue;
            }
            let row = f_row_of(data, vi)?;
            mdl_mcp.ctr.equ_add_lvar(row, vi_mult, -coeff)?;
        }
    }
    Ok(())
}
