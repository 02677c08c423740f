use crate::env_var::config;

/// The sparsity policy of an operation combining multiple sparse arrays.
///
/// The policy decides, per tile, whether work is needed at all: under `Intersection` a tile is
/// skipped as soon as any operand reports it zero, under `Union` a tile is skipped only when all
/// operands report it zero.
#[derive(serde::Serialize, serde::Deserialize, Copy, Clone, Debug, Eq, PartialEq)]
pub enum SparsityPolicy {
    Union,
    Intersection,
}

/// Per-tile sparsity metadata of a distributed array.
///
/// A shape holds a norm-like magnitude per tile and answers whether a tile is treated as
/// structurally absent. Shapes are replicated, every PE holds an identical copy for the tiles it
/// reports on. Dense arrays use the degenerate [Dense][TileShape::Dense] shape where every tile
/// is non-zero.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
pub enum TileShape {
    Dense {
        num_tiles: usize,
    },
    Sparse {
        norms: Vec<f32>,
        threshold: f32,
    },
}

impl TileShape {
    /// A shape reporting every one of `num_tiles` tiles as non-zero
    pub fn dense(num_tiles: usize) -> TileShape {
        TileShape::Dense {
            num_tiles: num_tiles,
        }
    }

    /// Publish a freshly computed sparsity from a dense buffer of per-tile magnitudes.
    ///
    /// Tiles whose magnitude does not exceed `threshold` are treated as zero.
    pub fn from_norms(norms: Vec<f32>, threshold: f32) -> TileShape {
        TileShape::Sparse {
            norms: norms,
            threshold: threshold,
        }
    }

    /// Like [from_norms][TileShape::from_norms] with the configured default threshold
    pub fn from_norms_default(norms: Vec<f32>) -> TileShape {
        TileShape::from_norms(norms, config().zero_threshold)
    }

    /// Whether tile `tile` is treated as structurally absent
    pub fn is_zero(&self, tile: usize) -> bool {
        match self {
            TileShape::Dense { num_tiles } => {
                assert!(tile < *num_tiles);
                false
            }
            TileShape::Sparse { norms, threshold } => norms[tile] <= *threshold,
        }
    }

    pub fn is_dense(&self) -> bool {
        matches!(self, TileShape::Dense { .. })
    }

    pub fn num_tiles(&self) -> usize {
        match self {
            TileShape::Dense { num_tiles } => *num_tiles,
            TileShape::Sparse { norms, .. } => norms.len(),
        }
    }

    /// The reported magnitude of tile `tile` (infinite for dense shapes)
    pub fn norm(&self, tile: usize) -> f32 {
        match self {
            TileShape::Dense { num_tiles } => {
                assert!(tile < *num_tiles);
                f32::INFINITY
            }
            TileShape::Sparse { norms, .. } => norms[tile],
        }
    }

    /// The zero threshold of a sparse shape
    pub fn threshold(&self) -> Option<f32> {
        match self {
            TileShape::Dense { .. } => None,
            TileShape::Sparse { threshold, .. } => Some(*threshold),
        }
    }

    /// Whether this shape reports on exactly `num_tiles` tiles
    pub fn validate(&self, num_tiles: usize) -> bool {
        self.num_tiles() == num_tiles
    }

    /// Combine the shapes of the operands of a multi-array operation.
    ///
    /// Under `Intersection` the result is zero at a tile as soon as any input is zero there,
    /// under `Union` the result is zero only where all inputs are zero. Combining only dense
    /// inputs, or any dense input under `Union`, yields a dense shape. The surviving tiles of a
    /// sparse result carry the first sparse input's norm.
    pub fn combine(shapes: &[&TileShape], policy: SparsityPolicy) -> TileShape {
        assert!(!shapes.is_empty(), "combining an empty shape list");
        let num_tiles = shapes[0].num_tiles();
        for shape in shapes {
            assert!(
                shape.validate(num_tiles),
                "combining shapes over mismatched tilings: {:?} vs {:?}",
                shape.num_tiles(),
                num_tiles
            );
        }

        let threshold = shapes
            .iter()
            .find_map(|s| s.threshold())
            .unwrap_or_else(|| config().zero_threshold);

        match policy {
            SparsityPolicy::Union => {
                if shapes.iter().any(|s| s.is_dense()) {
                    return TileShape::dense(num_tiles);
                }
                let mut norms = vec![0.0f32; num_tiles];
                for tile in 0..num_tiles {
                    if !shapes.iter().all(|s| s.is_zero(tile)) {
                        norms[tile] = shapes
                            .iter()
                            .map(|s| s.norm(tile))
                            .fold(0.0f32, |acc, n| acc.max(n));
                    }
                }
                TileShape::from_norms(norms, threshold)
            }
            SparsityPolicy::Intersection => {
                if shapes.iter().all(|s| s.is_dense()) {
                    return TileShape::dense(num_tiles);
                }
                let mut norms = vec![0.0f32; num_tiles];
                for tile in 0..num_tiles {
                    if !shapes.iter().any(|s| s.is_zero(tile)) {
                        norms[tile] = shapes
                            .iter()
                            .find(|s| !s.is_dense())
                            .map(|s| s.norm(tile))
                            .unwrap();
                    }
                }
                TileShape::from_norms(norms, threshold)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sparse(norms: &[f32]) -> TileShape {
        TileShape::from_norms(norms.to_vec(), 0.5)
    }

    #[test]
    fn dense_reports_no_zero_tiles() {
        let shape = TileShape::dense(4);
        assert!(shape.is_dense());
        assert!(shape.validate(4));
        for tile in 0..4 {
            assert!(!shape.is_zero(tile));
        }
    }

    #[test]
    fn from_norms_applies_threshold() {
        let shape = sparse(&[1.0, 0.5, 0.0, 2.0]);
        assert!(!shape.is_zero(0));
        assert!(shape.is_zero(1)); // at threshold counts as zero
        assert!(shape.is_zero(2));
        assert!(!shape.is_zero(3));
        assert_eq!(shape.threshold(), Some(0.5));
    }

    #[test]
    fn intersection_zero_where_any_input_zero() {
        let a = sparse(&[1.0, 1.0, 0.0, 1.0]);
        let b = sparse(&[1.0, 1.0, 1.0, 0.0]);
        let combined = TileShape::combine(&[&a, &b], SparsityPolicy::Intersection);
        for tile in 0..4 {
            assert_eq!(
                combined.is_zero(tile),
                a.is_zero(tile) || b.is_zero(tile),
                "tile {:?}",
                tile
            );
        }
        assert!(!combined.is_zero(0));
        assert!(combined.is_zero(2));
        assert!(combined.is_zero(3));
    }

    #[test]
    fn union_zero_only_where_all_inputs_zero() {
        let a = sparse(&[1.0, 0.0, 0.0, 1.0]);
        let b = sparse(&[1.0, 1.0, 0.0, 0.0]);
        let combined = TileShape::combine(&[&a, &b], SparsityPolicy::Union);
        for tile in 0..4 {
            assert_eq!(
                combined.is_zero(tile),
                a.is_zero(tile) && b.is_zero(tile),
                "tile {:?}",
                tile
            );
        }
        assert!(combined.is_zero(2));
        assert!(!combined.is_zero(1));
        assert!(!combined.is_zero(3));
    }

    #[test]
    fn dense_operand_dominates_union() {
        let a = sparse(&[0.0, 0.0, 0.0]);
        let d = TileShape::dense(3);
        let combined = TileShape::combine(&[&a, &d], SparsityPolicy::Union);
        assert!(combined.is_dense());
    }

    #[test]
    fn dense_operand_is_transparent_under_intersection() {
        let a = sparse(&[1.0, 0.0, 2.0]);
        let d = TileShape::dense(3);
        let combined = TileShape::combine(&[&d, &a], SparsityPolicy::Intersection);
        assert!(!combined.is_dense());
        assert!(!combined.is_zero(0));
        assert!(combined.is_zero(1));
        assert_eq!(combined.norm(2), 2.0);
    }

    #[test]
    #[should_panic]
    fn combine_rejects_mismatched_tilings() {
        let a = sparse(&[1.0, 1.0]);
        let b = sparse(&[1.0, 1.0, 1.0]);
        TileShape::combine(&[&a, &b], SparsityPolicy::Union);
    }
}
