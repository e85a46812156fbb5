//! Solution reporting: values flow child → parent along the upstream chain,
//! through the inverse of the compression rosetta.

use std::rc::Rc;

use crate::error::Error;
use crate::model::{Model, ModelRef};
use crate::timings::Stopwatch;
use crate::{BasisStatus, E, valid_idx};

/// Copy level, multiplier and basis of every entity of `parent` from its
/// image in `child`.
///
/// - a kept entity reads the slot its rosetta entry points at;
/// - an equation replaced by a flipped companion reads the companion and
///   negates the sign conventions;
/// - a dropped entity with no replacement gets NaN values and an unset
///   basis, unless it is on the evaluation list, in which case its level is
///   recomputed from the reported primal point.
pub fn report_values(parent: &mut Model, child: &Model) -> Result<(), Error> {
    let sw = Stopwatch::start();
    let timings = parent.timings();

    let rosetta_vars = child.rosetta_vars.as_deref();
    let rosetta_equs = child.rosetta_equs.as_deref();

    for vi in 0..parent.ctr.total_n() {
        let vi_child = match rosetta_vars {
            Some(map) => map.get(vi).copied().filter(|&j| valid_idx(j)),
            None => Some(vi),
        };
        let var = parent.ctr.var_mut(vi)?;
        match vi_child {
            Some(j) if j < child.ctr.total_n() => {
                let v_src = child.ctr.var(j)?;
                var.value = v_src.value;
                var.multiplier = v_src.multiplier;
                var.basis = v_src.basis;
                tracing::trace!(
                    target: "solreport",
                    "var {vi} <- downstream var {j}: level {}",
                    v_src.value
                );
            }
            _ => {
                var.value = E::NAN;
                var.multiplier = E::NAN;
                var.basis = BasisStatus::Unset;
            }
        }
    }

    // the freshly-reported levels, for re-evaluating dropped mappings
    let levels: Vec<E> = parent.ctr.vars().iter().map(|v| v.value).collect();

    for ei in 0..parent.ctr.total_m() {
        let ei_child = match rosetta_equs {
            Some(map) => map.get(ei).copied().filter(|&j| valid_idx(j)),
            None => Some(ei),
        };

        if let Some(j) = ei_child
            && j < child.ctr.total_m()
        {
            let e_src = child.ctr.equ(j)?;
            let (value, multiplier, basis) = (e_src.value, e_src.multiplier, e_src.basis);
            let equ = parent.ctr.equ_mut(ei)?;
            equ.value = value;
            equ.multiplier = multiplier;
            equ.basis = basis;
            continue;
        }

        /* The equation may have been replaced by a transformed companion
         * (e.g. a flipped one); report through it, adjusting signs. */
        if let Some(subst) = parent.ctr.equ_subst(ei) {
            let companion_child = match rosetta_equs {
                Some(map) => map.get(subst.ei).copied().filter(|&j| valid_idx(j)),
                None => Some(subst.ei),
            };
            if let Some(j) = companion_child
                && j < child.ctr.total_m()
            {
                let e_src = child.ctr.equ(j)?;
                let (mut value, mut multiplier, mut basis) =
                    (e_src.value, e_src.multiplier, e_src.basis);
                if subst.flipped {
                    value = -value;
                    multiplier = -multiplier;
                    basis = match basis {
                        BasisStatus::Lower => BasisStatus::Upper,
                        BasisStatus::Upper => BasisStatus::Lower,
                        other => other,
                    };
                }
                tracing::trace!(
                    target: "solreport",
                    "equ {ei} reported through transformed companion {}",
                    subst.ei
                );
                let equ = parent.ctr.equ_mut(ei)?;
                equ.value = value;
                equ.multiplier = multiplier;
                equ.basis = basis;
                continue;
            }
        }

        /* Objective equations and VI functions of a reformulated model are
         * on the evaluation list: recompute their level. */
        if parent.ctr.func2eval.contains(&ei) {
            let pool = parent.ctr.pool();
            let value = {
                let pool = pool.borrow();
                parent.ctr.equ(ei)?.eval_body(&levels, &pool)?
            };
            let equ = parent.ctr.equ_mut(ei)?;
            equ.value = value;
            equ.multiplier = 0.;
            equ.basis = BasisStatus::Unset;
            continue;
        }

        tracing::trace!(target: "solreport", "equ {ei} was forgotten");
        let equ = parent.ctr.equ_mut(ei)?;
        equ.value = E::NAN;
        equ.multiplier = E::NAN;
        equ.basis = BasisStatus::Unset;
    }

    sw.stop_into(&mut timings.borrow_mut().solreport);
    Ok(())
}

/// Propagate the solution of `target` up to the user model, one link at a
/// time.
pub fn report_solution_chain(target: &ModelRef) -> Result<(), Error> {
    let mut child = Rc::clone(target);
    loop {
        let parent = child.borrow().mdl_up().cloned();
        match parent {
            Some(parent) => {
                report_values(&mut parent.borrow_mut(), &child.borrow())?;
                child = parent;
            }
            None => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Cone, Equ, EquSubst, Var};
    use crate::IDX_NA;
    use std::cell::RefCell;

    fn two_var_parent() -> Model {
        let mut mdl = Model::new_rhp("parent");
        mdl.ctr.add_var(Var::free(0));
        mdl.ctr.add_var(Var::free(0));
        mdl
    }

    #[test]
    fn kept_entities_copy_dropped_get_nan() {
        let mut parent = two_var_parent();
        let mut obj = Equ::empty_mapping(0);
        obj.lequ.push(0, 1.).unwrap();
        parent.ctr.add_equ(obj).unwrap();

        let mut child = Model::new_rhp("child");
        child.ctr.add_var(Var::free(0));
        child.ctr.var_mut(0).unwrap().value = 4.;
        child.ctr.var_mut(0).unwrap().multiplier = 0.5;
        child.ctr.var_mut(0).unwrap().basis = BasisStatus::Basic;
        // parent var 0 kept as child var 0, var 1 dropped; equation dropped
        child.rosetta_vars = Some(vec![0, IDX_NA]);
        child.rosetta_equs = Some(vec![IDX_NA]);

        report_values(&mut parent, &child).unwrap();
        assert_eq!(parent.ctr.var(0).unwrap().value, 4.);
        assert_eq!(parent.ctr.var(0).unwrap().basis, BasisStatus::Basic);
        assert!(parent.ctr.var(1).unwrap().value.is_nan());
        assert!(parent.ctr.equ(0).unwrap().value.is_nan());
        assert_eq!(parent.ctr.equ(0).unwrap().basis, BasisStatus::Unset);
    }

    #[test]
    fn func2eval_equations_are_reevaluated() {
        let mut parent = two_var_parent();
        let mut obj = Equ::empty_mapping(0);
        obj.cst = 1.;
        obj.lequ.push(0, 2.).unwrap();
        let ei = parent.ctr.add_equ(obj).unwrap();
        parent.ctr.func2eval.push(ei);

        let mut child = Model::new_rhp("child");
        child.ctr.add_var(Var::free(0));
        child.ctr.var_mut(0).unwrap().value = 3.;
        child.rosetta_vars = Some(vec![0, IDX_NA]);
        child.rosetta_equs = Some(vec![IDX_NA]);

        report_values(&mut parent, &child).unwrap();
        // 1 + 2 * 3
        assert_eq!(parent.ctr.equ(0).unwrap().value, 7.);
        assert_eq!(parent.ctr.equ(0).unwrap().multiplier, 0.);
    }

    #[test]
    fn flipped_companion_negates_conventions() {
        let mut parent = two_var_parent();
        let dropped = parent
            .ctr
            .add_equ(Equ::cone_inclusion(0, Cone::RMinus))
            .unwrap();
        let companion = parent
            .ctr
            .add_equ(Equ::cone_inclusion(0, Cone::RPlus))
            .unwrap();
        parent
            .ctr
            .set_equ_subst(
                dropped,
                EquSubst {
                    ei: companion,
                    flipped: true,
                },
            )
            .unwrap();

        let mut child = Model::new_rhp("child");
        child.ctr.add_var(Var::free(0));
        let ei = child.ctr.add_equ(Equ::empty_mapping(0)).unwrap();
        {
            let e = child.ctr.equ_mut(ei).unwrap();
            e.value = 2.;
            e.multiplier = -1.5;
            e.basis = BasisStatus::Lower;
        }
        child.rosetta_vars = Some(vec![0, IDX_NA]);
        // the dropped equation has no image; its companion maps to child 0
        child.rosetta_equs = Some(vec![IDX_NA, ei]);

        report_values(&mut parent, &child).unwrap();
        let e = parent.ctr.equ(dropped).unwrap();
        assert_eq!(e.value, -2.);
        assert_eq!(e.multiplier, 1.5);
        assert_eq!(e.basis, BasisStatus::Upper);

        let c = parent.ctr.equ(companion).unwrap();
        assert_eq!(c.value, 2.);
        assert_eq!(c.basis, BasisStatus::Lower);
    }

    #[test]
    fn chain_propagates_to_the_user_model() {
        let parent = Rc::new(RefCell::new(two_var_parent()));
        let mut mid = Model::new_target(&parent, "mid");
        mid.ctr.add_var(Var::free(0));
        mid.rosetta_vars = Some(vec![0, IDX_NA]);
        let mid = Rc::new(RefCell::new(mid));
        let mut leaf = Model::new_target(&mid, "leaf");
        leaf.ctr.add_var(Var::free(0));
        leaf.ctr.var_mut(0).unwrap().value = 9.;
        leaf.rosetta_vars = Some(vec![0]);
        let leaf = Rc::new(RefCell::new(leaf));

        report_solution_chain(&leaf).unwrap();
        assert_eq!(parent.borrow().ctr.var(0).unwrap().value, 9.);
        assert!(parent.borrow().ctr.var(1).unwrap().value.is_nan());
    }
}
