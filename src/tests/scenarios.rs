//! End-to-end reformulation scenarios: a front end populates a source
//! model, the orchestrator builds the solver-facing model, a pretend solver
//! writes its answer back, and the solution is reported up the chain.

use std::cell::RefCell;
use std::rc::Rc;

use faer::Col;
use rstest::rstest;
use rstest_reuse::{apply, template};

use crate::algebra::tree::{Func, NlNode, NlTree};
use crate::container::{Cone, Equ, EquObject, Var};
use crate::driver::{McpDriverData, write_solution};
use crate::empdag::EmpDagType;
use crate::error::Error;
use crate::fooc::fooc_mcp;
use crate::model::report::report_solution_chain;
use crate::model::{Model, ModelRef};
use crate::options::{Options, SolveSingleOptAs};
use crate::transform::{pair_vi_function, transform};
use crate::{BasisStatus, E, ModelType, Sense};

fn shared(mdl: Model) -> ModelRef {
    Rc::new(RefCell::new(mdl))
}

fn mcp_options() -> Options {
    Options {
        solve_single_opt_as: SolveSingleOptAs::Mcp,
        expensive_checks: true,
        ..Options::default()
    }
}

fn sqr(node: NlNode) -> NlNode {
    NlNode::Call1(Func::Sqr, Box::new(node))
}

#[template]
#[rstest]
#[case::minimize(Sense::Min, 1.)]
#[case::maximize(Sense::Max, -1.)]
fn senses(#[case] sense: Sense, #[case] sign: E) {}

/* --------------------------------------------------------------------------
 * Scenario A: unconstrained minimization of x^2 + 3x + 5.
 * -------------------------------------------------------------------------- */

fn unconstrained_quadratic(sense: Sense) -> ModelRef {
    let mut mdl = Model::new_rhp("quadratic");
    let x = mdl.ctr.add_var(Var::free(0));
    let mut f = Equ::empty_mapping(0);
    f.cst = 5.;
    f.lequ.push(x, 3.).unwrap();
    f.tree = Some(NlTree::from_node(sqr(NlNode::Var(x))));
    let objequ = mdl.ctr.add_equ(f).unwrap();
    mdl.set_probtype(ModelType::Nlp);
    mdl.set_sense(sense);
    mdl.set_objequ(objequ).unwrap();
    shared(mdl)
}

#[apply(senses)]
fn unconstrained_quadratic_becomes_a_single_row_mcp(#[case] sense: Sense, #[case] sign: E) {
    let src = unconstrained_quadratic(sense);
    let target = transform(&src, &mcp_options()).unwrap();
    let mcp = target.borrow();

    assert_eq!(mcp.probtype(), ModelType::Mcp);
    assert_eq!(mcp.ctr.n(), 1);
    assert_eq!(mcp.ctr.m(), 1);

    // the stationarity row is ±(2x + 3), affine
    let row = mcp.ctr.equ(0).unwrap();
    assert_eq!(row.object, EquObject::Mapping);
    assert_eq!(row.cst, sign * 3.);
    assert_eq!(row.lequ.coeff(0), Some(sign * 2.));
    assert!(row.is_affine());
    assert_eq!(mcp.ctr.equ_perp(0), Some(0));

    let info = mcp.mcp_info.unwrap();
    assert_eq!(info.mcp_size, 1);
    assert_eq!(info.n_primalvars, 1);
    assert_eq!(info.n_constraints, 0);
}

#[test]
fn unconstrained_quadratic_solution_reports_back() {
    let src = unconstrained_quadratic(Sense::Min);
    let target = transform(&src, &mcp_options()).unwrap();

    {
        let mut mcp = target.borrow_mut();
        let data = McpDriverData::from_model(&mcp).unwrap();
        assert_eq!(data.n(), 1);
        // 2x + 3 = 0  =>  x = -1.5
        let x = Col::from_fn(1, |_| -1.5);
        let f = Col::zeros(1);
        write_solution(&mut mcp, &x, &f, &[BasisStatus::Basic, BasisStatus::Basic]).unwrap();
    }
    report_solution_chain(&target).unwrap();

    let src_ref = src.borrow();
    let x = src_ref.ctr.var(0).unwrap();
    assert_eq!(x.value, -1.5);
    assert_eq!(x.multiplier, 0.);
    // the objective equation is on the evaluation list: f(-1.5) = 2.75
    let obj = src_ref.ctr.equ(0).unwrap();
    assert!((obj.value - 2.75).abs() < 1e-12);
}

/* --------------------------------------------------------------------------
 * Scenario B: min (x - 2)^2  s.t.  x - 1 >= 0,  x >= 0.
 * -------------------------------------------------------------------------- */

fn single_inequality() -> ModelRef {
    let mut mdl = Model::new_rhp("inequality");
    let x = mdl.ctr.add_var(Var::bounded(0, 0., E::INFINITY).unwrap());

    let mut f = Equ::empty_mapping(0);
    f.tree = Some(NlTree::from_node(sqr(NlNode::sub(
        NlNode::Var(x),
        NlNode::Cst(mdl.ctr.pool().borrow_mut().intern(2.)),
    ))));
    let objequ = mdl.ctr.add_equ(f).unwrap();

    let mut g = Equ::cone_inclusion(0, Cone::RPlus);
    g.cst = -1.;
    g.lequ.push(x, 1.).unwrap();
    mdl.ctr.add_equ(g).unwrap();

    mdl.set_probtype(ModelType::Nlp);
    mdl.set_sense(Sense::Min);
    mdl.set_objequ(objequ).unwrap();
    shared(mdl)
}

#[test]
fn single_inequality_yields_two_by_two_mcp() {
    let src = single_inequality();
    let target = transform(&src, &mcp_options()).unwrap();
    let mcp = target.borrow();

    assert_eq!(mcp.ctr.n(), 2);
    assert_eq!(mcp.ctr.m(), 2);
    let info = mcp.mcp_info.unwrap();
    assert_eq!(info.n_constraints, 1);
    assert_eq!(info.n_lincons, 1);
    assert_eq!(info.n_nlcons, 0);

    // row 0: 2(x - 2) - λ ⟂ x
    let row0 = mcp.ctr.equ(0).unwrap();
    assert_eq!(row0.lequ.coeff(1), Some(-1.));
    assert_eq!(mcp.ctr.equ_perp(0), Some(0));
    let pool = mcp.ctr.pool();
    let pool = pool.borrow();
    // at (x, λ) = (2, 0) the stationarity row vanishes
    assert_eq!(row0.eval_body(&[2., 0.], &pool).unwrap(), 0.);
    // at (x, λ) = (1, 0) it reads 2(1 - 2) = -2
    assert_eq!(row0.eval_body(&[1., 0.], &pool).unwrap(), -2.);

    // row 1: x - 1 ⟂ λ >= 0
    let row1 = mcp.ctr.equ(1).unwrap();
    assert_eq!(row1.object, EquObject::Mapping);
    assert_eq!(row1.cst, -1.);
    assert_eq!(row1.lequ.coeff(0), Some(1.));
    assert_eq!(mcp.ctr.equ_perp(1), Some(1));
    let lambda = mcp.ctr.var(1).unwrap();
    assert_eq!((lambda.lb, lambda.ub), (0., E::INFINITY));
}

#[test]
fn single_inequality_solution_reports_back() {
    let src = single_inequality();
    let target = transform(&src, &mcp_options()).unwrap();
    {
        let mut mcp = target.borrow_mut();
        // x = 2, λ = 0: F = (2(x-2) - λ, x - 1) = (0, 1)
        let x = Col::from_fn(2, |i| [2., 0.][i]);
        let f = Col::from_fn(2, |i| [0., 1.][i]);
        let basis = vec![
            BasisStatus::Basic,
            BasisStatus::Lower,
            BasisStatus::Basic,
            BasisStatus::Basic,
        ];
        write_solution(&mut mcp, &x, &f, &basis).unwrap();
    }
    report_solution_chain(&target).unwrap();

    let src_ref = src.borrow();
    assert_eq!(src_ref.ctr.var(0).unwrap().value, 2.);
    // the constraint survives the reformulation: value reported through it
    assert_eq!(src_ref.ctr.equ(1).unwrap().value, 1.);
    assert_eq!(src_ref.ctr.equ(1).unwrap().multiplier, 0.);
    // objective value recomputed for reporting: (2 - 2)^2 = 0
    assert_eq!(src_ref.ctr.equ(0).unwrap().value, 0.);
}

/* --------------------------------------------------------------------------
 * Scenario C: the VI  y - 4 ⟂ y ∈ [0, 10].
 * -------------------------------------------------------------------------- */

fn single_vi() -> ModelRef {
    let mut mdl = Model::new_rhp("vi");
    let y = mdl.ctr.add_var(Var::bounded(0, 0., 10.).unwrap());
    let mut func = Equ::empty_mapping(0);
    func.cst = -4.;
    func.lequ.push(y, 1.).unwrap();
    let fi = mdl.ctr.add_equ(func).unwrap();

    let mpid = mdl.empinfo.empdag.add_mp(Sense::Feas).unwrap();
    let Model { ctr, empinfo, .. } = &mut mdl;
    empinfo.empdag.mp_addvipair(ctr, mpid, Some(fi), y).unwrap();
    shared(mdl)
}

#[test]
fn single_vi_copies_the_function_through() {
    let src = single_vi();
    let target = transform(&src, &mcp_options()).unwrap();
    assert_eq!(src.borrow().empdag_type(), EmpDagType::SingleVi);

    let mcp = target.borrow();
    assert_eq!(mcp.ctr.n(), 1);
    assert_eq!(mcp.ctr.m(), 1);
    let info = mcp.mcp_info.unwrap();
    assert_eq!(info.n_vifuncs, 1);
    assert_eq!(info.n_constraints, 0);

    let row = mcp.ctr.equ(0).unwrap();
    assert_eq!(row.cst, -4.);
    assert_eq!(row.lequ.coeff(0), Some(1.));
    assert_eq!(mcp.ctr.equ_perp(0), Some(0));
    let y = mcp.ctr.var(0).unwrap();
    assert_eq!((y.lb, y.ub), (0., 10.));
}

#[test]
fn single_vi_solution_reports_back() {
    let src = single_vi();
    let target = transform(&src, &mcp_options()).unwrap();
    {
        let mut mcp = target.borrow_mut();
        let x = Col::from_fn(1, |_| 4.);
        let f = Col::zeros(1);
        write_solution(&mut mcp, &x, &f, &[BasisStatus::Basic, BasisStatus::Basic]).unwrap();
    }
    report_solution_chain(&target).unwrap();
    assert_eq!(src.borrow().ctr.var(0).unwrap().value, 4.);
}

/* --------------------------------------------------------------------------
 * Scenario D: Nash game of two coupled minimizations.
 * -------------------------------------------------------------------------- */

fn nash_two_players() -> ModelRef {
    let mut mdl = Model::new_rhp("nash");
    let x = mdl.ctr.add_var(Var::bounded(0, 0., 10.).unwrap());
    let y = mdl.ctr.add_var(Var::bounded(0, 0., 10.).unwrap());

    // f1 = (x - y)^2
    let mut f1 = Equ::empty_mapping(0);
    f1.tree = Some(NlTree::from_node(sqr(NlNode::sub(
        NlNode::Var(x),
        NlNode::Var(y),
    ))));
    let f1 = mdl.ctr.add_equ(f1).unwrap();

    // f2 = (y - 2x)^2
    let two = mdl.ctr.pool().borrow_mut().intern(2.);
    let mut f2 = Equ::empty_mapping(0);
    f2.tree = Some(NlTree::from_node(sqr(NlNode::sub(
        NlNode::Var(y),
        NlNode::Mul(vec![NlNode::Cst(two), NlNode::Var(x)]),
    ))));
    let f2 = mdl.ctr.add_equ(f2).unwrap();

    let Model { ctr, empinfo, .. } = &mut mdl;
    let dag = &mut empinfo.empdag;
    let mp1 = dag.add_mp(Sense::Min).unwrap();
    dag.mp_addvar(ctr, mp1, x).unwrap();
    dag.mp_setobjequ(ctr, mp1, f1).unwrap();
    let mp2 = dag.add_mp(Sense::Min).unwrap();
    dag.mp_addvar(ctr, mp2, y).unwrap();
    dag.mp_setobjequ(ctr, mp2, f2).unwrap();
    let nash = dag.add_nash();
    dag.nash_addmp(nash, mp1).unwrap();
    dag.nash_addmp(nash, mp2).unwrap();
    shared(mdl)
}

#[test]
fn nash_game_yields_square_mcp_without_multipliers() {
    let src = nash_two_players();
    let target = transform(&src, &mcp_options()).unwrap();
    assert_eq!(src.borrow().empdag_type(), EmpDagType::Mopec);

    let mcp = target.borrow();
    assert_eq!(mcp.ctr.n(), 2);
    assert_eq!(mcp.ctr.m(), 2);
    let info = mcp.mcp_info.unwrap();
    assert_eq!(info.n_constraints, 0);
    assert_eq!(info.n_primalvars, 2);

    let pool = mcp.ctr.pool();
    let pool = pool.borrow();
    // each player differentiates only its own objective:
    //   row0 = 2(x - y),  row1 = 2(y - 2x)
    let row0 = mcp.ctr.equ(0).unwrap();
    let row1 = mcp.ctr.equ(1).unwrap();
    for (x, y) in [(0., 0.), (1., 0.5), (-2., 3.)] {
        let at = [x, y];
        assert!((row0.eval_body(&at, &pool).unwrap() - 2. * (x - y)).abs() < 1e-12);
        assert!((row1.eval_body(&at, &pool).unwrap() - 2. * (y - 2. * x)).abs() < 1e-12);
    }
    assert_eq!(mcp.ctr.equ_perp(0), Some(0));
    assert_eq!(mcp.ctr.equ_perp(1), Some(1));
}

/* --------------------------------------------------------------------------
 * Scenario E: bilevel program turned into an MPEC.
 * -------------------------------------------------------------------------- */

fn bilevel() -> ModelRef {
    let mut mdl = Model::new_rhp("bilevel");
    let u = mdl.ctr.add_var(Var::free(0));
    let v = mdl.ctr.add_var(Var::free(0));

    let three = mdl.ctr.pool().borrow_mut().intern(3.);
    // upper objective (u - 3)^2
    let mut f_up = Equ::empty_mapping(0);
    f_up.tree = Some(NlTree::from_node(sqr(NlNode::sub(
        NlNode::Var(u),
        NlNode::Cst(three),
    ))));
    let f_up = mdl.ctr.add_equ(f_up).unwrap();

    // lower objective (v - u)^2
    let mut f_lo = Equ::empty_mapping(0);
    f_lo.tree = Some(NlTree::from_node(sqr(NlNode::sub(
        NlNode::Var(v),
        NlNode::Var(u),
    ))));
    let f_lo = mdl.ctr.add_equ(f_lo).unwrap();

    // lower constraint v >= 0
    let mut g = Equ::cone_inclusion(0, Cone::RPlus);
    g.lequ.push(v, 1.).unwrap();
    let g = mdl.ctr.add_equ(g).unwrap();

    let Model { ctr, empinfo, .. } = &mut mdl;
    let dag = &mut empinfo.empdag;
    let upper = dag.add_mp_named(Sense::Min, "leader".into()).unwrap();
    dag.mp_addvar(ctr, upper, u).unwrap();
    dag.mp_setobjequ(ctr, upper, f_up).unwrap();
    let lower = dag.add_mp_named(Sense::Min, "follower".into()).unwrap();
    dag.mp_addvar(ctr, lower, v).unwrap();
    dag.mp_setobjequ(ctr, lower, f_lo).unwrap();
    dag.mp_addconstraint(ctr, lower, g).unwrap();
    dag.mp_ctrl_mp(upper, lower).unwrap();
    shared(mdl)
}

#[test]
fn bilevel_becomes_an_mpec_with_lower_kkt() {
    let src = bilevel();
    let target = transform(&src, &mcp_options()).unwrap();
    assert_eq!(src.borrow().empdag_type(), EmpDagType::Bilevel);

    let mpec = target.borrow();
    assert_eq!(mpec.probtype(), ModelType::Mpec);
    assert_eq!(mpec.sense(), Sense::Min);
    // v, u (auxiliary), λ; lower KKT rows plus the upper objective
    assert_eq!(mpec.ctr.n(), 3);
    assert_eq!(mpec.ctr.m(), 3);

    let info = mpec.mcp_info.unwrap();
    assert_eq!(info.mcp_size, 2);
    assert_eq!(info.n_foocvars, 1);
    assert_eq!(info.n_auxvars, 1);
    assert_eq!(info.n_constraints, 1);

    // the permutation groups the lower-level variable first: v, then the
    // auxiliary u, then the multiplier
    let v_new = 0;
    let lam = 2;

    let pool = mpec.ctr.pool();
    let pool = pool.borrow();
    // row 0: 2(v - u) - λ ⟂ v
    let row0 = mpec.ctr.equ(0).unwrap();
    assert_eq!(row0.lequ.coeff(lam), Some(-1.));
    let at = |vv: E, uu: E, ll: E| [vv, uu, ll];
    assert_eq!(row0.eval_body(&at(3., 3., 0.), &pool).unwrap(), 0.);
    assert_eq!(row0.eval_body(&at(1., 3., 0.), &pool).unwrap(), -4.);
    assert_eq!(mpec.ctr.equ_perp(0), Some(v_new));

    // row 1: v ⟂ λ
    let row1 = mpec.ctr.equ(1).unwrap();
    assert_eq!(row1.lequ.coeff(v_new), Some(1.));
    assert_eq!(mpec.ctr.equ_perp(1), Some(lam));

    // the upper objective rode along, remapped to the new variable space
    let objequ = mpec.objequ().expect("upper objective preserved");
    let obj = mpec.ctr.equ(objequ).unwrap();
    assert_eq!(obj.eval_body(&at(0., 3., 0.), &pool).unwrap(), 0.);
    assert_eq!(obj.eval_body(&at(0., 5., 0.), &pool).unwrap(), 4.);
    assert!(mpec.objvar().is_none());
}

#[test]
fn bilevel_solution_reports_back_to_the_user_model() {
    let src = bilevel();
    let target = transform(&src, &mcp_options()).unwrap();
    {
        let mut mpec = target.borrow_mut();
        // u = v = 3, λ = 0
        for (vi, value) in [(0, 3.), (1, 3.), (2, 0.)] {
            mpec.ctr.var_mut(vi).unwrap().value = value;
        }
    }
    report_solution_chain(&target).unwrap();
    let src_ref = src.borrow();
    assert_eq!(src_ref.ctr.var(0).unwrap().value, 3.);
    assert_eq!(src_ref.ctr.var(1).unwrap().value, 3.);
}

/* --------------------------------------------------------------------------
 * Objective-variable models and identity paths.
 * -------------------------------------------------------------------------- */

#[apply(senses)]
fn objective_variable_row_carries_the_sense(#[case] sense: Sense, #[case] sign: E) {
    let mut mdl = Model::new_rhp("objvar");
    let x = mdl.ctr.add_var(Var::free(0));
    let mut g = Equ::cone_inclusion(0, Cone::RPlus);
    g.cst = -1.;
    g.lequ.push(x, 1.).unwrap();
    mdl.ctr.add_equ(g).unwrap();
    mdl.set_probtype(ModelType::Lp);
    mdl.set_sense(sense);
    mdl.set_objvar(x).unwrap();
    let src = shared(mdl);

    let target = transform(&src, &mcp_options()).unwrap();
    let mcp = target.borrow();
    assert_eq!(mcp.ctr.n(), 2);
    let row0 = mcp.ctr.equ(0).unwrap();
    assert_eq!(row0.cst, sign);
    assert_eq!(row0.lequ.coeff(1), Some(-1.));
    assert_eq!(mcp.ctr.equ_perp(0), Some(0));
}

#[test]
fn single_opt_transform_is_the_identity_by_default() {
    let src = unconstrained_quadratic(Sense::Min);
    let target = transform(&src, &Options::default()).unwrap();
    assert!(Rc::ptr_eq(&src, &target));
}

#[test]
fn empty_emp_model_refuses_fooc() {
    let mut mdl = Model::new_rhp("empty");
    mdl.set_probtype(ModelType::Emp);
    mdl.finalize().unwrap();
    assert_eq!(mdl.empdag_type(), EmpDagType::Empty);
    let src = shared(mdl);

    let mut target = Model::new_target(&src, "MCP");
    assert!(matches!(
        fooc_mcp(&mut target, None),
        Err(Error::Inconsistency(_))
    ));
}

#[test]
fn nonsmooth_objective_degrades_the_source_to_dnlp() {
    let mut mdl = Model::new_rhp("nonsmooth");
    let x = mdl.ctr.add_var(Var::free(0));
    let mut f = Equ::empty_mapping(0);
    f.tree = Some(NlTree::from_node(NlNode::Call1(
        Func::Abs,
        Box::new(NlNode::Var(x)),
    )));
    let objequ = mdl.ctr.add_equ(f).unwrap();
    mdl.set_probtype(ModelType::Nlp);
    mdl.set_sense(Sense::Min);
    mdl.set_objequ(objequ).unwrap();
    let src = shared(mdl);

    transform(&src, &mcp_options()).unwrap();
    assert_eq!(src.borrow().probtype(), ModelType::Dnlp);
}

/* --------------------------------------------------------------------------
 * A VI declared without EMP structure, through the pairing helper.
 * -------------------------------------------------------------------------- */

#[test]
fn flat_vi_model_goes_through_fooc() {
    let mut mdl = Model::new_rhp("flat-vi");
    let y = mdl.ctr.add_var(Var::bounded(0, 0., 10.).unwrap());
    let mut func = Equ::empty_mapping(0);
    func.cst = -4.;
    func.lequ.push(y, 1.).unwrap();
    let fi = mdl.ctr.add_equ(func).unwrap();
    pair_vi_function(&mut mdl, fi, y).unwrap();
    mdl.set_probtype(ModelType::Vi);
    mdl.set_sense(Sense::Feas);
    let src = shared(mdl);

    let target = transform(&src, &mcp_options()).unwrap();
    let mcp = target.borrow();
    assert_eq!(mcp.ctr.n(), 1);
    assert_eq!(mcp.ctr.m(), 1);
    assert_eq!(mcp.mcp_info.unwrap().n_vifuncs, 1);
    assert_eq!(mcp.ctr.equ(0).unwrap().cst, -4.);
}
