//! Stacked index translation across a chain of derived models.
//!
//! Compression writes a dense map `rosetta[src] = dst` (with [`IDX_NA`] for
//! dropped entries) into the derived model. When a transformation needs to
//! fetch an equation body from a deeper ancestor, it uses the composed map
//! for that depth, precomputed here in one flat buffer with per-depth start
//! offsets. The composed arrays are build-once, read-many.

use crate::error::Error;
use crate::{IDX_NA, Idx, valid_idx};

/// One model of the upstream chain, seen from the target: its variable-slot
/// count and the map from its indices into its child's (owned by the child).
#[derive(Debug, Clone)]
pub struct RosettaLayer {
    /// Allocated variable slots of the ancestor at this depth.
    pub total_n: usize,
    /// Map ancestor-index → child-index, or `None` when no compression
    /// occurred between the two.
    pub map_to_child: Option<Vec<Idx>>,
}

/// Composed maps: `at(d)` translates the indices of the ancestor at depth
/// `d` (0 = direct parent of the target) into target indices.
#[derive(Debug, Default)]
pub struct Rosettas {
    data: Vec<Idx>,
    starts: Vec<usize>,
    lens: Vec<usize>,
}

impl Rosettas {
    /// Compose the per-layer maps. `layers[0]` is the direct parent of the
    /// target model, deeper ancestors follow.
    pub fn compute(layers: &[RosettaLayer]) -> Result<Rosettas, Error> {
        let mut out = Rosettas::default();
        if layers.is_empty() {
            return Ok(out);
        }

        let total: usize = layers.iter().map(|l| l.total_n).sum();
        if total == 0 {
            return Err(Error::RuntimeError(
                "no variable defined along the upstream chain".into(),
            ));
        }
        out.data.reserve(total);

        for (depth, layer) in layers.iter().enumerate() {
            let start = out.data.len();

            if depth == 0 {
                match &layer.map_to_child {
                    Some(map) => {
                        if map.len() != layer.total_n {
                            return Err(Error::Inconsistency(format!(
                                "rosetta of depth 0 has length {}, expected {}",
                                map.len(),
                                layer.total_n
                            )));
                        }
                        out.data.extend_from_slice(map);
                    }
                    None => out.data.extend(0..layer.total_n),
                }
            } else {
                let prev_start = out.starts[depth - 1];
                let prev_len = out.lens[depth - 1];
                match &layer.map_to_child {
                    Some(map) => {
                        if map.len() != layer.total_n {
                            return Err(Error::Inconsistency(format!(
                                "rosetta of depth {depth} has length {}, expected {}",
                                map.len(),
                                layer.total_n
                            )));
                        }
                        for &vi_child in map {
                            let composed = if valid_idx(vi_child) {
                                if vi_child >= prev_len {
                                    return Err(Error::IndexOutOfRange {
                                        idx: vi_child,
                                        len: prev_len,
                                    });
                                }
                                out.data[prev_start + vi_child]
                            } else {
                                IDX_NA
                            };
                            out.data.push(composed);
                        }
                    }
                    None => {
                        // no compression at this step: the composed map is the
                        // previous one
                        if layer.total_n > prev_len {
                            return Err(Error::Inconsistency(format!(
                                "ancestor at depth {depth} has {} slots but its child \
                                 only translates {prev_len}",
                                layer.total_n
                            )));
                        }
                        for j in 0..layer.total_n {
                            let v = out.data[prev_start + j];
                            out.data.push(v);
                        }
                    }
                }
            }

            out.starts.push(start);
            out.lens.push(layer.total_n);
        }

        Ok(out)
    }

    pub fn depth(&self) -> usize {
        self.starts.len()
    }

    /// Composed map for the ancestor at `depth`.
    pub fn at(&self, depth: usize) -> Result<&[Idx], Error> {
        if depth >= self.starts.len() {
            return Err(Error::IndexOutOfRange {
                idx: depth,
                len: self.starts.len(),
            });
        }
        let start = self.starts[depth];
        Ok(&self.data[start..start + self.lens[depth]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_layer_identity_when_no_compression() {
        let layers = [RosettaLayer {
            total_n: 3,
            map_to_child: None,
        }];
        let r = Rosettas::compute(&layers).unwrap();
        assert_eq!(r.at(0).unwrap(), &[0, 1, 2]);
    }

    #[test]
    fn composition_matches_iterated_single_steps() {
        // depth 0: parent {0,1,2} -> target, dropping 1
        // depth 1: grandparent {0,1,2,3} -> parent, dropping 2
        let step0 = vec![0, IDX_NA, 1];
        let step1 = vec![0, 1, IDX_NA, 2];
        let layers = [
            RosettaLayer {
                total_n: 3,
                map_to_child: Some(step0.clone()),
            },
            RosettaLayer {
                total_n: 4,
                map_to_child: Some(step1.clone()),
            },
        ];
        let r = Rosettas::compute(&layers).unwrap();
        assert_eq!(r.at(0).unwrap(), step0.as_slice());

        let composed = r.at(1).unwrap();
        for v0 in 0..4 {
            let expected = match step1[v0] {
                IDX_NA => IDX_NA,
                mid => step0[mid],
            };
            assert_eq!(composed[v0], expected, "grandparent index {v0}");
        }
        // spot values: 0 -> 0, 1 -> dropped (parent 1 dropped), 2 -> dropped,
        // 3 -> parent 2 -> target 1
        assert_eq!(composed, &[0, IDX_NA, IDX_NA, 1]);
    }

    #[test]
    fn missing_intermediate_rosetta_copies_previous_map() {
        let step0 = vec![2, 0, 1];
        let layers = [
            RosettaLayer {
                total_n: 3,
                map_to_child: Some(step0.clone()),
            },
            RosettaLayer {
                total_n: 3,
                map_to_child: None,
            },
        ];
        let r = Rosettas::compute(&layers).unwrap();
        assert_eq!(r.at(1).unwrap(), step0.as_slice());
    }

    #[test]
    fn empty_chain_is_an_error() {
        let layers = [RosettaLayer {
            total_n: 0,
            map_to_child: None,
        }];
        assert!(Rosettas::compute(&layers).is_err());
    }
}
