//! NUMA distance matrix.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{HardwareError, TopologyResult};
use crate::types::NodeId;

/// Distance from a node to itself
pub const LOCAL_DISTANCE: u8 = 0;

/// Distance reported for unknown node pairs
pub const UNREACHABLE: u8 = u8::MAX;

/// Symmetric node distance matrix; lower is closer, self-distance is zero
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistanceMatrix {
    dim: usize,
    cells: Vec<u8>,
}

impl DistanceMatrix {
    /// Build and validate a matrix from rows
    pub fn from_rows<R: AsRef<[u8]>>(rows: &[R]) -> TopologyResult<Self> {
        let dim = rows.len();
        let mut cells = Vec::with_capacity(dim * dim);
        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.len() != dim {
                return Err(HardwareError::DistanceShape {
                    expected: dim,
                    row: i,
                    len: row.len(),
                });
            }
            cells.extend_from_slice(row);
        }

        let matrix = Self { dim, cells };
        matrix.validate()?;
        Ok(matrix)
    }

    /// Every remote pair at the same distance
    pub fn uniform(dim: usize, remote: u8) -> Self {
        let mut cells = vec![remote; dim * dim];
        for i in 0..dim {
            cells[i * dim + i] = LOCAL_DISTANCE;
        }
        Self { dim, cells }
    }

    fn validate(&self) -> TopologyResult<()> {
        for i in 0..self.dim {
            if self.cells[i * self.dim + i] != LOCAL_DISTANCE {
                return Err(HardwareError::SelfDistance(NodeId(i as u32)));
            }
            for j in (i + 1)..self.dim {
                if self.cells[i * self.dim + j] != self.cells[j * self.dim + i] {
                    return Err(HardwareError::AsymmetricDistance(
                        NodeId(i as u32),
                        NodeId(j as u32),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Number of nodes covered
    #[inline(always)]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Distance between two nodes, [`UNREACHABLE`] if either is unknown
    #[inline]
    pub fn get(&self, from: NodeId, to: NodeId) -> u8 {
        let (f, t) = (from.index(), to.index());
        if f < self.dim && t < self.dim {
            self.cells[f * self.dim + t]
        } else {
            UNREACHABLE
        }
    }

    /// Row of distances from one node
    pub fn row(&self, from: NodeId) -> &[u8] {
        let f = from.index();
        if f < self.dim {
            &self.cells[f * self.dim..(f + 1) * self.dim]
        } else {
            &[]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_four_node_matrix() {
        let m = DistanceMatrix::from_rows(&[
            [0u8, 2, 4, 4],
            [2, 0, 4, 4],
            [4, 4, 0, 2],
            [4, 4, 2, 0],
        ])
        .unwrap();
        assert_eq!(m.dim(), 4);
        assert_eq!(m.get(NodeId(0), NodeId(1)), 2);
        assert_eq!(m.get(NodeId(3), NodeId(0)), 4);
        assert_eq!(m.get(NodeId(2), NodeId(2)), LOCAL_DISTANCE);
        assert_eq!(m.get(NodeId(0), NodeId(9)), UNREACHABLE);
        assert_eq!(m.row(NodeId(2)), &[4, 4, 0, 2]);
    }

    #[test]
    fn test_rejects_asymmetric() {
        let err = DistanceMatrix::from_rows(&[[0u8, 2], [3, 0]]).unwrap_err();
        assert_eq!(err, HardwareError::AsymmetricDistance(NodeId(0), NodeId(1)));
    }

    #[test]
    fn test_rejects_nonzero_self() {
        let err = DistanceMatrix::from_rows(&[[1u8, 2], [2, 0]]).unwrap_err();
        assert_eq!(err, HardwareError::SelfDistance(NodeId(0)));
    }

    #[test]
    fn test_rejects_ragged_rows() {
        let rows: [&[u8]; 2] = [&[0, 2], &[2]];
        let err = DistanceMatrix::from_rows(&rows).unwrap_err();
        assert!(matches!(err, HardwareError::DistanceShape { row: 1, .. }));
    }
}
