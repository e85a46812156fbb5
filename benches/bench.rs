use std::cell::RefCell;
use std::rc::Rc;

use remold::algebra::diff::SdTool;
use remold::algebra::lequ::Lequ;
use remold::algebra::tree::{Func, NlNode, NlTree};
use remold::container::{Equ, Var};
use remold::model::{Model, ModelRef};
use remold::options::{Options, SolveSingleOptAs};
use remold::transform::transform;
use remold::{ModelType, Sense};

fn main() {
    divan::main();
}

/// Sum of squares of `n` shifted variables, as one expression tree.
fn sum_of_squares(n: usize, pool: &Rc<RefCell<remold::algebra::pool::Pool>>) -> NlTree {
    let mut terms = Vec::with_capacity(n);
    for vi in 0..n {
        let shift = pool.borrow_mut().intern(vi as f64);
        terms.push(NlNode::Call1(
            Func::Sqr,
            Box::new(NlNode::sub(NlNode::Var(vi), NlNode::Cst(shift))),
        ));
    }
    NlTree::from_node(NlNode::Add(terms))
}

#[divan::bench(args = [10, 100, 1000])]
fn differentiate_sum_of_squares(bencher: divan::Bencher, n: usize) {
    let pool = Rc::new(RefCell::new(remold::algebra::pool::Pool::new()));
    let tree = sum_of_squares(n, &pool);
    let lequ = Lequ::new();
    bencher.bench_local(|| {
        let tool = SdTool::new(&lequ, Some(&tree), pool.clone());
        for vi in 0..n {
            divan::black_box(tool.deriv(vi).unwrap());
        }
    });
}

fn quadratic_model(n: usize) -> ModelRef {
    let mut mdl = Model::new_rhp("bench");
    for _ in 0..n {
        mdl.ctr.add_var(Var::free(0));
    }
    let pool = mdl.ctr.pool();
    let mut f = Equ::empty_mapping(0);
    f.tree = Some(sum_of_squares(n, &pool));
    let objequ = mdl.ctr.add_equ(f).unwrap();
    mdl.set_probtype(ModelType::Nlp);
    mdl.set_sense(Sense::Min);
    mdl.set_objequ(objequ).unwrap();
    Rc::new(RefCell::new(mdl))
}

#[divan::bench(args = [10, 100])]
fn fooc_quadratic(bencher: divan::Bencher, n: usize) {
    let opts = Options {
        solve_single_opt_as: SolveSingleOptAs::Mcp,
        ..Options::default()
    };
    bencher.bench_local(|| {
        let src = quadratic_model(n);
        divan::black_box(transform(&src, &opts).unwrap());
    });
}
