//! Linear part of an equation body: an ordered sequence of `(vi, coeff)`
//! pairs held in parallel arrays.
//!
//! Invariant after any mutation: indices are unique and coefficients are
//! non-zero. Operations that would produce a zero coefficient remove the
//! entry instead.

use crate::error::Error;
use crate::{E, IDX_NA, Idx, Vi, valid_idx};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Lequ {
    vis: Vec<Vi>,
    coeffs: Vec<E>,
}

impl Lequ {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(len: usize) -> Self {
        Self {
            vis: Vec::with_capacity(len),
            coeffs: Vec::with_capacity(len),
        }
    }

    pub fn len(&self) -> usize {
        self.vis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vis.is_empty()
    }

    /// Position and coefficient of `vi`, if present.
    pub fn find(&self, vi: Vi) -> Option<(usize, E)> {
        self.vis
            .iter()
            .position(|&v| v == vi)
            .map(|pos| (pos, self.coeffs[pos]))
    }

    pub fn coeff(&self, vi: Vi) -> Option<E> {
        self.find(vi).map(|(_, c)| c)
    }

    /// Append a term. The variable must not already be present.
    pub fn push(&mut self, vi: Vi, coeff: E) -> Result<(), Error> {
        if !valid_idx(vi) {
            return Err(Error::InvalidArgument(format!(
                "cannot add sentinel variable index {vi} to a linear part"
            )));
        }
        if self.find(vi).is_some() {
            return Err(Error::UnexpectedData(format!(
                "variable {vi} already present in the linear part"
            )));
        }
        if coeff == 0. {
            return Ok(());
        }
        self.vis.push(vi);
        self.coeffs.push(coeff);
        Ok(())
    }

    /// Add `coeff` to the entry for `vi`, creating or removing it as needed.
    pub fn add(&mut self, vi: Vi, coeff: E) {
        match self.vis.iter().position(|&v| v == vi) {
            Some(pos) => {
                let new = self.coeffs[pos] + coeff;
                if new == 0. {
                    self.vis.swap_remove(pos);
                    self.coeffs.swap_remove(pos);
                } else {
                    self.coeffs[pos] = new;
                }
            }
            None => {
                if coeff != 0. {
                    self.vis.push(vi);
                    self.coeffs.push(coeff);
                }
            }
        }
    }

    /// Merge-add another linear part into this one.
    pub fn add_lequ(&mut self, other: &Lequ) {
        for (&vi, &c) in other.vis.iter().zip(&other.coeffs) {
            self.add(vi, c);
        }
    }

    /// Merge-subtract another linear part.
    pub fn sub_lequ(&mut self, other: &Lequ) {
        for (&vi, &c) in other.vis.iter().zip(&other.coeffs) {
            self.add(vi, -c);
        }
    }

    /// Scale every coefficient. Scaling by zero empties the linear part.
    pub fn scale(&mut self, factor: E) {
        if factor == 0. {
            self.vis.clear();
            self.coeffs.clear();
            return;
        }
        for c in &mut self.coeffs {
            *c *= factor;
        }
    }

    pub fn remove(&mut self, vi: Vi) -> Option<E> {
        self.vis.iter().position(|&v| v == vi).map(|pos| {
            self.vis.swap_remove(pos);
            self.coeffs.swap_remove(pos)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (Vi, E)> + '_ {
        self.vis.iter().copied().zip(self.coeffs.iter().copied())
    }

    /// Independent copy with variable indices rewritten through `rosetta`.
    /// Terms whose variable was dropped (`IDX_NA`) are removed.
    pub fn dup_rosetta(&self, rosetta: &[Idx]) -> Result<Lequ, Error> {
        let mut out = Lequ::with_capacity(self.len());
        for (vi, c) in self.iter() {
            let vi_new = *rosetta.get(vi).ok_or(Error::IndexOutOfRange {
                idx: vi,
                len: rosetta.len(),
            })?;
            if vi_new == IDX_NA {
                continue;
            }
            if !valid_idx(vi_new) {
                return Err(Error::RuntimeError(format!(
                    "rosetta maps variable {vi} to sentinel {vi_new}"
                )));
            }
            out.add(vi_new, c);
        }
        Ok(out)
    }

    /// Evaluate at a point.
    pub fn eval(&self, x: &[E]) -> Result<E, Error> {
        let mut acc = 0.;
        for (vi, c) in self.iter() {
            let xi = x.get(vi).ok_or(Error::IndexOutOfRange {
                idx: vi,
                len: x.len(),
            })?;
            acc += c * xi;
        }
        Ok(acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IDX_NA;

    #[test]
    fn push_rejects_duplicates() {
        let mut le = Lequ::new();
        le.push(0, 1.).unwrap();
        assert!(le.push(0, 2.).is_err());
    }

    #[test]
    fn add_cancels_to_removal() {
        let mut le = Lequ::new();
        le.push(3, 2.).unwrap();
        le.add(3, -2.);
        assert!(le.is_empty());
        assert_eq!(le.coeff(3), None);
    }

    #[test]
    fn merge_add_and_scale() {
        let mut a = Lequ::new();
        a.push(0, 1.).unwrap();
        a.push(1, -2.).unwrap();
        let mut b = Lequ::new();
        b.push(1, 2.).unwrap();
        b.push(2, 5.).unwrap();
        a.add_lequ(&b);
        assert_eq!(a.coeff(0), Some(1.));
        assert_eq!(a.coeff(1), None);
        assert_eq!(a.coeff(2), Some(5.));
        a.scale(2.);
        assert_eq!(a.coeff(2), Some(10.));
    }

    #[test]
    fn dup_rosetta_drops_na_entries() {
        let mut le = Lequ::new();
        le.push(0, 1.).unwrap();
        le.push(1, 4.).unwrap();
        let out = le.dup_rosetta(&[5, IDX_NA]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.coeff(5), Some(1.));
    }
}
