//! Engine configuration.
//!
//! The option block is a plain struct passed explicitly into every
//! transformation entry point; there is no global option table. A named-key
//! surface over boxed [`OptionValue`]s serves embedders that read options
//! from configuration files.

use std::any::Any;

use dyn_clone::DynClone;
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub trait OptionValue: Any + Sync + Send + DynClone {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Sync + Send + Clone> OptionValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Clone for Box<dyn OptionValue> {
    fn clone(&self) -> Self {
        dyn_clone::clone_box(&**self)
    }
}

/// How to solve a model whose EMPDAG is a single optimization problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SolveSingleOptAs {
    /// Hand the optimization problem to the solver unchanged.
    #[default]
    Opt,
    /// Convert to an MCP through the FOOC pass.
    Mcp,
}

/// Variant of the CCF/OVF reformulation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CcfVariant {
    #[default]
    Fenchel,
    Conjugate,
    Equilibrium,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Absolute tolerance surfaced to the solver.
    pub atol: f64,
    /// Relative tolerance surfaced to the solver.
    pub rtol: f64,
    /// Iteration limit; -1 means unlimited.
    pub iterlimit: i64,
    /// Retain scratch artifacts.
    pub keep_files: bool,
    pub solver_option_file_number: i64,
    pub display_empdag: bool,
    pub display_ovfdag: bool,
    pub display_timings: bool,
    pub dump_scalar_model: bool,
    /// Run the O(nnz) cross-reference audit after every transformation.
    pub expensive_checks: bool,
    /// Verbosity level.
    pub output: i64,
    /// Solver-specific option file id.
    pub subsolveropt: i64,
    /// Time limit in seconds.
    pub time_limit: i64,
    pub solve_single_opt_as: SolveSingleOptAs,
    pub ccf_reformulation: CcfVariant,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            atol: 0.,
            rtol: 1e-8,
            iterlimit: -1,
            keep_files: false,
            solver_option_file_number: 1,
            display_empdag: false,
            display_ovfdag: false,
            display_timings: false,
            dump_scalar_model: false,
            expensive_checks: false,
            output: 0,
            subsolveropt: 0,
            time_limit: 0,
            solve_single_opt_as: SolveSingleOptAs::default(),
            ccf_reformulation: CcfVariant::default(),
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an option through its key. Unknown keys answer `NotFound`;
    /// wrongly-typed values answer `InvalidArgument`.
    pub fn set(&mut self, key: &str, value: Box<dyn OptionValue>) -> Result<(), Error> {
        fn want<T: Copy + 'static>(
            key: &str,
            value: &dyn OptionValue,
            expected: &'static str,
        ) -> Result<T, Error> {
            value
                .as_any()
                .downcast_ref::<T>()
                .copied()
                .ok_or_else(|| {
                    Error::InvalidArgument(format!("option '{key}' expects a {expected} value"))
                })
        }

        match key {
            "atol" => self.atol = want::<f64>(key, value.as_ref(), "float")?,
            "rtol" => self.rtol = want::<f64>(key, value.as_ref(), "float")?,
            "iterlimit" => self.iterlimit = want::<i64>(key, value.as_ref(), "integer")?,
            "keep_files" => self.keep_files = want::<bool>(key, value.as_ref(), "boolean")?,
            "solver_option_file_number" => {
                self.solver_option_file_number = want::<i64>(key, value.as_ref(), "integer")?;
            }
            "display_empdag" => {
                self.display_empdag = want::<bool>(key, value.as_ref(), "boolean")?;
            }
            "display_ovfdag" => {
                self.display_ovfdag = want::<bool>(key, value.as_ref(), "boolean")?;
            }
            "display_timings" => {
                self.display_timings = want::<bool>(key, value.as_ref(), "boolean")?;
            }
            "dump_scalar_model" => {
                self.dump_scalar_model = want::<bool>(key, value.as_ref(), "boolean")?;
            }
            "expensive_checks" => {
                self.expensive_checks = want::<bool>(key, value.as_ref(), "boolean")?;
            }
            "output" => self.output = want::<i64>(key, value.as_ref(), "integer")?,
            "subsolveropt" => self.subsolveropt = want::<i64>(key, value.as_ref(), "integer")?,
            "time_limit" => self.time_limit = want::<i64>(key, value.as_ref(), "integer")?,
            "solve_single_opt_as" => {
                self.solve_single_opt_as =
                    want::<SolveSingleOptAs>(key, value.as_ref(), "solve_single_opt_as")?;
            }
            "ccf_reformulation" => {
                self.ccf_reformulation = want::<CcfVariant>(key, value.as_ref(), "ccf variant")?;
            }
            _ => return Err(Error::NotFound(key.to_string())),
        }
        Ok(())
    }

    /// Read an option through its key.
    pub fn get(&self, key: &str) -> Result<Box<dyn OptionValue>, Error> {
        Ok(match key {
            "atol" => Box::new(self.atol),
            "rtol" => Box::new(self.rtol),
            "iterlimit" => Box::new(self.iterlimit),
            "keep_files" => Box::new(self.keep_files),
            "solver_option_file_number" => Box::new(self.solver_option_file_number),
            "display_empdag" => Box::new(self.display_empdag),
            "display_ovfdag" => Box::new(self.display_ovfdag),
            "display_timings" => Box::new(self.display_timings),
            "dump_scalar_model" => Box::new(self.dump_scalar_model),
            "expensive_checks" => Box::new(self.expensive_checks),
            "output" => Box::new(self.output),
            "subsolveropt" => Box::new(self.subsolveropt),
            "time_limit" => Box::new(self.time_limit),
            "solve_single_opt_as" => Box::new(self.solve_single_opt_as),
            "ccf_reformulation" => Box::new(self.ccf_reformulation),
            _ => return Err(Error::NotFound(key.to_string())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let opts = Options::default();
        assert_eq!(opts.atol, 0.);
        assert_eq!(opts.rtol, 1e-8);
        assert_eq!(opts.iterlimit, -1);
        assert!(!opts.keep_files);
        assert_eq!(opts.solver_option_file_number, 1);
    }

    #[test]
    fn named_key_roundtrip() {
        let mut opts = Options::default();
        opts.set("rtol", Box::new(1e-6)).unwrap();
        assert_eq!(opts.rtol, 1e-6);
        let v = opts.get("rtol").unwrap();
        assert_eq!(v.as_any().downcast_ref::<f64>(), Some(&1e-6));
    }

    #[test]
    fn unknown_key_and_wrong_type_are_rejected() {
        let mut opts = Options::default();
        assert!(matches!(
            opts.set("no_such_option", Box::new(1i64)),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            opts.set("rtol", Box::new(true)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn boxed_values_are_clonable() {
        let v: Box<dyn OptionValue> = Box::new(3i64);
        let w = v.clone();
        assert_eq!(w.as_any().downcast_ref::<i64>(), Some(&3));
    }
}
