/// The distribution pattern mapping tile indices onto the PEs of a world.
#[derive(serde::Serialize, serde::Deserialize, Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Distribution {
    /// Tiles are assigned to PEs in contiguous blocks
    Block,
    /// Tiles are assigned to PEs in a round robin fashion
    Cyclic,
}

impl Default for Distribution {
    fn default() -> Distribution {
        Distribution::Block
    }
}

/// An error that occurs when constructing a process map with invalid geometry
#[derive(Debug, Clone, Copy)]
pub struct MapError {
    pub num_tiles: usize,
    pub num_pes: usize,
    pub my_pe: usize,
}

impl std::fmt::Display for MapError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Invalid map geometry => num_tiles: {} num_pes: {} my_pe: {}",
            self.num_tiles, self.num_pes, self.my_pe
        )
    }
}

impl std::error::Error for MapError {}

/// A deterministic, replicated mapping from a linear tile index to the PE that owns it.
///
/// Every PE of a world constructs an identical map for a given (tile count, world size,
/// distribution) triple, so ownership queries never require communication. It is the caller's
/// responsibility to ensure the maps on all PEs are identical, a mismatch is not detected.
///
/// A map is immutable after construction and is shared read-only by all consumers of the
/// distributed array it describes.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProcMap {
    num_tiles: usize,
    num_pes: usize,
    my_pe: usize,
    dist: Distribution,
    tiles_per_pe: usize, // block width, ceil(num_tiles / num_pes)
}

impl ProcMap {
    /// Construct a map of `num_tiles` tiles over `num_pes` PEs, as seen from PE `my_pe`.
    ///
    /// Returns a [MapError] when either count is zero or `my_pe` is out of range.
    pub fn new(
        num_tiles: usize,
        num_pes: usize,
        my_pe: usize,
        dist: Distribution,
    ) -> Result<ProcMap, MapError> {
        if num_tiles == 0 || num_pes == 0 || my_pe >= num_pes {
            return Err(MapError {
                num_tiles: num_tiles,
                num_pes: num_pes,
                my_pe: my_pe,
            });
        }
        Ok(ProcMap {
            num_tiles: num_tiles,
            num_pes: num_pes,
            my_pe: my_pe,
            dist: dist,
            tiles_per_pe: (num_tiles + num_pes - 1) / num_pes,
        })
    }

    /// The PE that owns tile `tile`
    pub fn owner(&self, tile: usize) -> usize {
        assert!(
            tile < self.num_tiles,
            "tile index {:?} out of range for {:?} tiles",
            tile,
            self.num_tiles
        );
        match self.dist {
            Distribution::Block => tile / self.tiles_per_pe,
            Distribution::Cyclic => tile % self.num_pes,
        }
    }

    /// Whether tile `tile` is owned by the calling PE
    pub fn is_local(&self, tile: usize) -> bool {
        self.owner(tile) == self.my_pe
    }

    /// The number of tiles owned by the calling PE
    pub fn local_size(&self) -> usize {
        match self.dist {
            Distribution::Block => {
                let start = self.my_pe * self.tiles_per_pe;
                if start >= self.num_tiles {
                    0
                } else {
                    std::cmp::min(self.tiles_per_pe, self.num_tiles - start)
                }
            }
            Distribution::Cyclic => {
                let full = self.num_tiles / self.num_pes;
                if self.my_pe < self.num_tiles % self.num_pes {
                    full + 1
                } else {
                    full
                }
            }
        }
    }

    /// Iterate over the tile indices owned by the calling PE, each exactly once
    pub fn local_indices(&self) -> LocalIndices {
        let (cur, step, end) = match self.dist {
            Distribution::Block => {
                let start = self.my_pe * self.tiles_per_pe;
                let end = std::cmp::min(start + self.tiles_per_pe, self.num_tiles);
                (start, 1, end)
            }
            Distribution::Cyclic => (self.my_pe, self.num_pes, self.num_tiles),
        };
        LocalIndices {
            cur: cur,
            step: step,
            end: end,
        }
    }

    pub fn num_tiles(&self) -> usize {
        self.num_tiles
    }

    pub fn num_pes(&self) -> usize {
        self.num_pes
    }

    pub fn my_pe(&self) -> usize {
        self.my_pe
    }

    pub fn distribution(&self) -> Distribution {
        self.dist
    }

    /// Whether `other` describes the same tiling geometry (ignoring the calling PE)
    pub(crate) fn same_geometry(&self, other: &ProcMap) -> bool {
        self.num_tiles == other.num_tiles
            && self.num_pes == other.num_pes
            && self.dist == other.dist
    }
}

pub struct LocalIndices {
    cur: usize,
    step: usize,
    end: usize,
}

impl Iterator for LocalIndices {
    type Item = usize;
    fn next(&mut self) -> Option<usize> {
        if self.cur < self.end {
            let res = self.cur;
            self.cur += self.step;
            Some(res)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_partition(num_tiles: usize, num_pes: usize, dist: Distribution) {
        // every tile is owned by exactly one pe and the local enumerations cover the index
        // space exactly once
        let mut seen = vec![0usize; num_tiles];
        for pe in 0..num_pes {
            let pmap = ProcMap::new(num_tiles, num_pes, pe, dist).unwrap();
            let mut count = 0;
            for tile in pmap.local_indices() {
                assert!(pmap.is_local(tile));
                assert_eq!(pmap.owner(tile), pe);
                seen[tile] += 1;
                count += 1;
            }
            assert_eq!(count, pmap.local_size());
        }
        assert!(seen.iter().all(|&cnt| cnt == 1));
    }

    #[test]
    fn block_partition() {
        check_partition(1, 1, Distribution::Block);
        check_partition(10, 4, Distribution::Block);
        check_partition(16, 5, Distribution::Block);
        check_partition(3, 7, Distribution::Block);
    }

    #[test]
    fn cyclic_partition() {
        check_partition(1, 1, Distribution::Cyclic);
        check_partition(10, 4, Distribution::Cyclic);
        check_partition(16, 5, Distribution::Cyclic);
        check_partition(3, 7, Distribution::Cyclic);
    }

    #[test]
    fn owners_replicated_across_pes() {
        for pe in 0..4 {
            let pmap = ProcMap::new(12, 4, pe, Distribution::Cyclic).unwrap();
            let reference = ProcMap::new(12, 4, 0, Distribution::Cyclic).unwrap();
            for tile in 0..12 {
                assert_eq!(pmap.owner(tile), reference.owner(tile));
            }
        }
    }

    #[test]
    fn invalid_geometry() {
        assert!(ProcMap::new(0, 4, 0, Distribution::Block).is_err());
        assert!(ProcMap::new(4, 0, 0, Distribution::Block).is_err());
        assert!(ProcMap::new(4, 2, 2, Distribution::Block).is_err());
    }

    #[test]
    #[should_panic]
    fn owner_out_of_range() {
        let pmap = ProcMap::new(4, 2, 0, Distribution::Block).unwrap();
        pmap.owner(4);
    }
}
