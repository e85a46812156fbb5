//! Transformation orchestrator: reads the EMPDAG type of a source model and
//! runs the reformulation path that produces the solver-facing model.
//!
//! | source type            | target        | path                            |
//! |------------------------|---------------|---------------------------------|
//! | empty / (single) opt   | the source    | identity                        |
//! | (single) VI / MOPEC    | MCP           | FOOC on the whole DAG           |
//! | bilevel / MPEC         | MPEC (MPMCC)  | FOOC on the lower-level subdag, |
//! |                        |               | upper problem appended          |
//! | anything deeper        | —             | not implemented                 |

use std::cell::RefCell;
use std::rc::Rc;

use crate::container::{EquRole, PairKind};
use crate::empdag::uid::valid_mpid;
use crate::empdag::EmpDagType;
use crate::error::Error;
use crate::filter::{Fops, FopsSubDag};
use crate::fooc::{FoocOutcome, fooc_mcp};
use crate::model::{Model, ModelRef};
use crate::options::{CcfVariant, Options, SolveSingleOptAs};
use crate::{Ei, IDX_NA, ModelType, Vi, valid_idx};

/// Produce the solver-facing model for `src`. The identity paths hand back
/// a borrow of the source itself.
pub fn transform(src: &ModelRef, opts: &Options) -> Result<ModelRef, Error> {
    {
        let mut s = src.borrow_mut();
        s.finalize()?;
        s.check()?;
        s.check_metadata()?;
    }

    /* The CCF/OVF reformulations run before any FOOC pass, as they mutate
     * the EMPDAG (new MPs and arcs). */
    let needs_ccf = {
        let s = src.borrow();
        !s.empinfo.ovf.is_empty() || s.empinfo.empdag.has_adversarial_mps()
    };
    if needs_ccf {
        ccf_reformulate(src, opts)?;
    }

    let (empdag_type, probtype) = {
        let s = src.borrow();
        (s.empdag_type(), s.probtype())
    };

    let target = match empdag_type {
        EmpDagType::Empty | EmpDagType::SingleOpt | EmpDagType::Opt => {
            if probtype == ModelType::Vi {
                to_mcp(src, opts, None)?
            } else if probtype.is_opt()
                && opts.solve_single_opt_as == SolveSingleOptAs::Mcp
                && matches!(empdag_type, EmpDagType::Empty | EmpDagType::SingleOpt)
            {
                to_mcp(src, opts, None)?
            } else {
                Rc::clone(src)
            }
        }
        EmpDagType::SingleVi | EmpDagType::Vi | EmpDagType::Mopec => to_mcp(src, opts, None)?,
        EmpDagType::Bilevel | EmpDagType::Mpec => to_mpmcc(src, opts)?,
        EmpDagType::Multilevel
        | EmpDagType::MultilevelMopec
        | EmpDagType::Epec
        | EmpDagType::NestedCcf
        | EmpDagType::Complex => {
            return Err(Error::NotImplemented(
                "transformation of a non-trivial EMPDAG",
            ));
        }
        EmpDagType::Unset => {
            return Err(Error::RuntimeError(
                "EMPDAG type still unset after finalize".into(),
            ));
        }
    };

    if opts.display_timings {
        let timings = src.borrow().timings();
        tracing::info!(target: "transform", "timings: {:?}", timings.borrow());
    }
    Ok(target)
}

/// Formulate the MCP version of the source model.
fn to_mcp(src: &ModelRef, opts: &Options, fops: Option<Fops>) -> Result<ModelRef, Error> {
    check_fooc_input(src)?;

    let mut target = Model::new_target(src, "MCP");
    let outcome = fooc_mcp(&mut target, fops.as_ref())?;
    absorb_fooc_outcome(src, &outcome);

    if opts.expensive_checks {
        target.ctr.check_cross_reference()?;
    }
    target.check_metadata()?;
    Ok(Rc::new(RefCell::new(target)))
}

/// Transform a bilevel/MPEC model into an MPMCC: the lower level becomes
/// its KKT system, the upper level rides along.
fn to_mpmcc(src: &ModelRef, opts: &Options) -> Result<ModelRef, Error> {
    check_fooc_input(src)?;

    let (upper_id, sense, lower_uid, fops) = {
        let s = src.borrow();
        let empdag = &s.empinfo.empdag;
        let roots = empdag.roots();
        if roots.len() != 1 || !roots[0].is_mp() {
            return Err(Error::EmpRuntimeError(
                "bilevel transformation requires a unique MP root".into(),
            ));
        }
        let upper_id = roots[0].id();
        let carcs = empdag.mp_carcs(upper_id)?;
        if carcs.len() != 1 {
            return Err(Error::EmpRuntimeError(format!(
                "expecting 1 child below the upper problem, got {}",
                carcs.len()
            )));
        }
        let lower_uid = carcs[0];
        let sense = empdag.mp(upper_id)?.sense();
        let fops = FopsSubDag::new(empdag, &s.ctr, lower_uid, true)?;
        (upper_id, sense, lower_uid, fops)
    };
    tracing::debug!(
        target: "transform",
        "bilevel: lower level rooted at {lower_uid:?}, upper MP #{upper_id}"
    );

    let mut target = Model::new_target(src, "MPEC");
    let outcome = fooc_mcp(&mut target, Some(&Fops::from(fops)))?;
    absorb_fooc_outcome(src, &outcome);

    /* ----------------------------------------------------------------------
     * Append the upper-level problem. Its variables already flowed through
     * as auxiliaries; its equations and objective did not.
     * ---------------------------------------------------------------------- */

    let s = src.borrow();
    let upper = s.empinfo.empdag.mp(upper_id)?.clone();

    let rosetta_vars = target
        .rosetta_vars
        .clone()
        .ok_or(Error::RuntimeError("variable rosetta not built".into()))?;
    let mut rosetta_equs = target
        .rosetta_equs
        .take()
        .ok_or(Error::RuntimeError("equation rosetta not built".into()))?;

    target.ctr.ensure_metadata();
    for &ei_src in upper.equs() {
        let equ_src = s.ctr.equ(ei_src)?;
        let mut equ = equ_src.clone();
        equ.lequ = equ_src.lequ.dup_rosetta(&rosetta_vars)?;
        equ.tree = match &equ_src.tree {
            Some(tree) => {
                let t = tree.dup_rosetta(&rosetta_vars)?;
                (!t.is_empty()).then_some(t)
            }
            None => None,
        };
        let ei_new = target.ctr.add_equ(equ)?;
        rosetta_equs[ei_src] = ei_new;
        if let Some(em) = &mut target.ctr.equmeta {
            em[ei_new].mp_id = upper_id;
            em[ei_new].role = EquRole::Constraint;
        }
    }

    let objequ_upper = upper.objequ();
    let objvar_upper = upper.objvar();
    if objequ_upper.is_none() && objvar_upper.is_none() {
        return Err(Error::EmpRuntimeError(format!(
            "upper MP #{upper_id} has no objective data"
        )));
    }

    target.set_probtype(ModelType::Mpec);
    target.set_sense(sense);

    if let Some(objequ) = objequ_upper {
        let mapped = rosetta_equs.get(objequ).copied().unwrap_or(IDX_NA);
        let objequ_mpec = if valid_idx(mapped) {
            mapped
        } else {
            let equ_src = s.ctr.equ(objequ)?;
            let mut equ = equ_src.clone();
            equ.lequ = equ_src.lequ.dup_rosetta(&rosetta_vars)?;
            equ.tree = match &equ_src.tree {
                Some(tree) => {
                    let t = tree.dup_rosetta(&rosetta_vars)?;
                    (!t.is_empty()).then_some(t)
                }
                None => None,
            };
            let ei_new = target.ctr.add_equ(equ)?;
            rosetta_equs[objequ] = ei_new;
            ei_new
        };
        target.set_objequ(objequ_mpec)?;
    }

    if let Some(objvar) = objvar_upper {
        let mapped = rosetta_vars.get(objvar).copied().unwrap_or(IDX_NA);
        if !valid_idx(mapped) {
            return Err(Error::RuntimeError(format!(
                "upper objective variable {objvar} was dropped by the lower-level \
                 filtering"
            )));
        }
        target.set_objvar(mapped)?;
    }

    target.rosetta_equs = Some(rosetta_equs);
    drop(s);

    if opts.expensive_checks {
        target.ctr.check_cross_reference()?;
    }
    target.check_metadata()?;
    Ok(Rc::new(RefCell::new(target)))
}

/// Shared pre-conditions of the FOOC-based paths.
fn check_fooc_input(src: &ModelRef) -> Result<(), Error> {
    let s = src.borrow();
    s.assert_mutable()?;
    match s.probtype() {
        ModelType::Mcp => Err(Error::UnexpectedData(format!(
            "model '{}' already is an MCP, which represents optimality conditions",
            s.name()
        ))),
        ModelType::Dnlp => Err(Error::NotImplemented(
            "first-order conditions of a nonsmooth model",
        )),
        ModelType::Cns => Err(Error::NotImplemented(
            "first-order conditions of a constraint system",
        )),
        ModelType::Mip | ModelType::Minlp => Err(Error::NotImplemented(
            "first-order conditions of a model with integer variables",
        )),
        _ => Ok(()),
    }
}

/// Book the side effects of a FOOC pass on the source model: the equations
/// to re-evaluate at reporting time, and the nonsmoothness degradation.
fn absorb_fooc_outcome(src: &ModelRef, outcome: &FoocOutcome) {
    let mut s = src.borrow_mut();
    for &ei in &outcome.objequs {
        if !s.ctr.func2eval.contains(&ei) {
            s.ctr.func2eval.push(ei);
        }
    }
    if outcome.nonsmooth {
        s.upgrade_to_dnlp();
    }
}

/// The CCF/OVF reformulation pass. Variant selection and routing are
/// wired; the reformulations themselves are not part of this core.
fn ccf_reformulate(src: &ModelRef, opts: &Options) -> Result<(), Error> {
    let s = src.borrow();
    tracing::info!(
        target: "transform",
        "model '{}': {} OVF annotation(s), CCF variant {:?}",
        s.name(),
        s.empinfo.ovf.len(),
        opts.ccf_reformulation
    );
    Err(Error::NotImplemented(match opts.ccf_reformulation {
        CcfVariant::Fenchel => "the Fenchel CCF reformulation",
        CcfVariant::Conjugate => "the conjugate CCF reformulation",
        CcfVariant::Equilibrium => "the equilibrium CCF reformulation",
    }))
}

/// Check a variable perp-pairing is available for MCP-bound models; used by
/// embedders that pre-pair VI functions before calling [`transform`].
pub fn pair_vi_function(mdl: &mut Model, ei: Ei, vi: Vi) -> Result<(), Error> {
    mdl.assert_mutable()?;
    if let Some(vm) = &mdl.ctr.varmeta
        && valid_mpid(vm[vi].mp_id)
    {
        // pairing through the owning MP keeps the metadata coherent
        return Err(Error::OperationNotAllowed(format!(
            "variable {vi} belongs to MP #{}; use the MP pairing API",
            vm[vi].mp_id
        )));
    }
    mdl.ctr.set_equ_var_perp(ei, vi, PairKind::ViFunction)
}
