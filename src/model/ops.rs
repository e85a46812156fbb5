//! Backend polymorphism. The engine mutates only RHP-backed models; other
//! backends are read-only front-end containers whose population happened
//! before the engine saw them.

use crate::error::Error;
use crate::model::{Backend, Model};

pub trait BackendOps {
    fn backend(&self) -> Backend;

    /// Whether the engine may mutate a model of this backend during a
    /// transformation.
    fn supports_mutation(&self) -> bool;

    /// Backend-specific part of `Model::check`.
    fn check_mdl(&self, mdl: &Model) -> Result<(), Error>;
}

pub struct RhpOps;

impl BackendOps for RhpOps {
    fn backend(&self) -> Backend {
        Backend::Rhp
    }

    fn supports_mutation(&self) -> bool {
        true
    }

    fn check_mdl(&self, mdl: &Model) -> Result<(), Error> {
        let ctr = &mdl.ctr;
        let active_n = ctr.vars().iter().filter(|v| v.is_active()).count();
        if active_n != ctr.n() {
            return Err(Error::Inconsistency(format!(
                "model '{}': {} active variables recorded, {} present",
                mdl.name(),
                ctr.n(),
                active_n
            )));
        }
        let active_m = ctr.equs().iter().filter(|e| e.is_active()).count();
        if active_m != ctr.m() {
            return Err(Error::Inconsistency(format!(
                "model '{}': {} active equations recorded, {} present",
                mdl.name(),
                ctr.m(),
                active_m
            )));
        }
        for var in ctr.vars().iter().filter(|v| v.is_active()) {
            if var.lb > var.ub {
                return Err(Error::InvalidValue(format!(
                    "model '{}': variable {} has lb {} > ub {}",
                    mdl.name(),
                    var.idx,
                    var.lb,
                    var.ub
                )));
            }
        }
        Ok(())
    }
}

/// GAMS-backed containers are read-only for the engine.
pub struct GamsOps;

impl BackendOps for GamsOps {
    fn backend(&self) -> Backend {
        Backend::Gams
    }

    fn supports_mutation(&self) -> bool {
        false
    }

    fn check_mdl(&self, _mdl: &Model) -> Result<(), Error> {
        Ok(())
    }
}

pub fn ops_for(backend: Backend) -> &'static dyn BackendOps {
    match backend {
        Backend::Rhp => &RhpOps,
        Backend::Gams => &GamsOps,
        // population of these happens outside the engine as well
        Backend::Ampl | Backend::Julia => &GamsOps,
    }
}
