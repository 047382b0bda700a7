//! Static skeleton graphs.
//!
//! `A` is the symmetrically normalised joint adjacency (no self loops).
//! `A_sep` splits the skeleton into hop-distance partitions: partition `k`
//! connects joints that are exactly `k` bones apart, so partition 0 is the
//! identity.

use candle::{Device, Tensor};
use ndarray::{Array2, Array3, Axis};
use tracing::debug;

use crate::error::{Error, Result};

// (child, parent), 1-based as in the NTU RGB+D joint list
const NTU_RGB_D_INWARD: [(usize, usize); 24] = [
    (1, 2),
    (2, 21),
    (3, 21),
    (4, 3),
    (5, 21),
    (6, 5),
    (7, 6),
    (8, 7),
    (9, 21),
    (10, 9),
    (11, 10),
    (12, 11),
    (13, 1),
    (14, 13),
    (15, 14),
    (16, 15),
    (17, 1),
    (18, 17),
    (19, 18),
    (20, 19),
    (22, 23),
    (23, 8),
    (24, 25),
    (25, 12),
];

// (child, parent), 0-based OpenPose layout used by Kinetics-Skeleton
const KINETICS_INWARD: [(usize, usize); 17] = [
    (4, 3),
    (3, 2),
    (7, 6),
    (6, 5),
    (13, 12),
    (12, 11),
    (10, 9),
    (9, 8),
    (11, 5),
    (8, 2),
    (5, 1),
    (2, 1),
    (0, 1),
    (15, 0),
    (14, 0),
    (17, 15),
    (16, 14),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Kinetics-Skeleton, 18 OpenPose joints.
    Kinetics,
    /// NTU RGB+D 60/120, 25 Kinect joints.
    NtuRgbD,
}

impl Topology {
    pub fn from_num_point(num_point: usize) -> Result<Self> {
        match num_point {
            18 => Ok(Self::Kinetics),
            25 => Ok(Self::NtuRgbD),
            n => Err(Error::UnsupportedJointCount(n)),
        }
    }

    pub fn num_node(&self) -> usize {
        match self {
            Self::Kinetics => 18,
            Self::NtuRgbD => 25,
        }
    }

    /// Undirected bones as 0-based joint pairs.
    pub fn edges(&self) -> Vec<(usize, usize)> {
        match self {
            Self::Kinetics => KINETICS_INWARD.to_vec(),
            Self::NtuRgbD => NTU_RGB_D_INWARD
                .iter()
                .map(|&(i, j)| (i - 1, j - 1))
                .collect(),
        }
    }

    pub fn binary_adjacency(&self) -> Array2<f32> {
        let n = self.num_node();
        let mut a = Array2::zeros((n, n));
        for (i, j) in self.edges() {
            a[[i, j]] = 1.0;
            a[[j, i]] = 1.0;
        }
        a
    }
}

#[derive(Debug, Clone)]
pub struct AdjacencyGraph {
    topology: Topology,
    a_sep: Array3<f32>,
    a: Array2<f32>,
}

impl AdjacencyGraph {
    pub fn new(num_point: usize, num_subset: usize) -> Result<Self> {
        let topology = Topology::from_num_point(num_point)?;
        Self::from_topology(topology, num_subset)
    }

    /// Fails when a hop partition leaves some joint without any neighbour,
    /// since the masked softmax of that row would have no admissible key.
    pub fn from_topology(topology: Topology, num_subset: usize) -> Result<Self> {
        let binary = topology.binary_adjacency();
        let n = topology.num_node();

        let mut a_sep = Array3::zeros((num_subset, n, n));
        for k in 0..num_subset {
            let partition = normalize_adjacency(&k_adjacency(&binary, k));
            let isolated = partition
                .axis_iter(Axis(0))
                .filter(|row| row.iter().all(|&v| v <= 0.0))
                .count();
            if isolated > 0 {
                return Err(Error::config(format!(
                    "{num_subset} hop partitions over {topology:?}: partition {k} leaves \
                     {isolated} joints without neighbours"
                )));
            }
            a_sep.index_axis_mut(Axis(0), k).assign(&partition);
        }
        debug!(?topology, num_subset, "built adjacency partitions");

        Ok(Self {
            topology,
            a_sep,
            a: normalize_adjacency(&binary),
        })
    }

    /// Largest partition count for which every joint keeps a neighbour in
    /// every partition: one more than the smallest joint eccentricity.
    pub fn max_subsets(topology: Topology) -> usize {
        let binary = topology.binary_adjacency();
        let mut k = 1;
        while k_adjacency(&binary, k)
            .axis_iter(Axis(0))
            .all(|row| row.iter().any(|&v| v > 0.0))
        {
            k += 1;
        }
        k
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn num_subset(&self) -> usize {
        self.a_sep.len_of(Axis(0))
    }

    pub fn a_sep(&self) -> &Array3<f32> {
        &self.a_sep
    }

    pub fn a(&self) -> &Array2<f32> {
        &self.a
    }

    /// `A_sep` as a (subset, V, V) tensor on `device`.
    pub fn a_sep_tensor(&self, device: &Device) -> Result<Tensor> {
        let dims = self.a_sep.dim();
        let data: Vec<f32> = self.a_sep.iter().copied().collect();
        Ok(Tensor::from_vec(data, dims, device)?)
    }

    /// `A` as a (V, V) tensor on `device`.
    pub fn a_tensor(&self, device: &Device) -> Result<Tensor> {
        let dims = self.a.dim();
        let data: Vec<f32> = self.a.iter().copied().collect();
        Ok(Tensor::from_vec(data, dims, device)?)
    }
}

/// Joints exactly `k` hops apart.
pub fn k_adjacency(a: &Array2<f32>, k: usize) -> Array2<f32> {
    let n = a.nrows();
    let eye = Array2::<f32>::eye(n);
    if k == 0 {
        return eye;
    }
    let step = a + &eye;
    let mut reach_prev = eye.clone();
    for _ in 1..k {
        reach_prev = reach_prev.dot(&step).mapv(|v| v.min(1.0));
    }
    let reach = reach_prev.dot(&step).mapv(|v| v.min(1.0));
    reach - reach_prev
}

/// `D^-1/2 A D^-1/2`, leaving rows without edges at zero.
pub fn normalize_adjacency(a: &Array2<f32>) -> Array2<f32> {
    let deg_inv_sqrt = a
        .sum_axis(Axis(1))
        .mapv(|d| if d > 0.0 { d.powf(-0.5) } else { 0.0 });
    let mut out = a.clone();
    for ((i, j), v) in out.indexed_iter_mut() {
        *v *= deg_inv_sqrt[i] * deg_inv_sqrt[j];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_topologies() {
        assert_eq!(Topology::from_num_point(25).unwrap(), Topology::NtuRgbD);
        assert_eq!(Topology::from_num_point(18).unwrap(), Topology::Kinetics);
        assert!(matches!(
            AdjacencyGraph::new(17, 4),
            Err(Error::UnsupportedJointCount(17))
        ));
    }

    #[test]
    fn too_many_partitions_are_rejected() {
        // the most central NTU RGB+D joint is at most six bones from any other
        assert_eq!(AdjacencyGraph::max_subsets(Topology::NtuRgbD), 7);
        assert_eq!(AdjacencyGraph::max_subsets(Topology::Kinetics), 5);
        assert!(AdjacencyGraph::new(25, 7).is_ok());
        assert!(matches!(AdjacencyGraph::new(25, 8), Err(Error::Config(_))));
        assert!(matches!(AdjacencyGraph::new(18, 6), Err(Error::Config(_))));
    }

    #[test]
    fn skeletons_are_trees() {
        for topology in [Topology::NtuRgbD, Topology::Kinetics] {
            let a = topology.binary_adjacency();
            assert_eq!(a.sum() as usize, 2 * (topology.num_node() - 1));
            assert_eq!(a, a.t());
        }
    }

    #[test]
    fn hop_partitions() {
        let graph = AdjacencyGraph::new(25, 4).unwrap();
        assert_eq!(graph.num_subset(), 4);
        assert_eq!(graph.a_sep().index_axis(Axis(0), 0), Array2::<f32>::eye(25));

        // spine base (0) -> spine mid (1) -> spine shoulder (20)
        let binary = Topology::NtuRgbD.binary_adjacency();
        let one = k_adjacency(&binary, 1);
        let two = k_adjacency(&binary, 2);
        assert_eq!(one, binary);
        assert_eq!(two[[0, 20]], 1.0);
        assert_eq!(two[[0, 1]], 0.0);
        assert_eq!(two[[0, 0]], 0.0);

        // every joint keeps at least one neighbour in every partition
        for partition in graph.a_sep().axis_iter(Axis(0)) {
            for row in partition.axis_iter(Axis(0)) {
                assert!(row.iter().any(|&v| v > 0.0));
            }
        }
    }

    #[test]
    fn normalized_adjacency_is_symmetric() -> Result<()> {
        let graph = AdjacencyGraph::new(18, 3)?;
        let a = graph.a();
        for ((i, j), v) in a.indexed_iter() {
            assert!((v - a[[j, i]]).abs() < 1e-6);
        }
        let t = graph.a_tensor(&Device::Cpu)?;
        assert_eq!(t.dims2()?, (18, 18));
        let t = graph.a_sep_tensor(&Device::Cpu)?;
        assert_eq!(t.dims3()?, (3, 18, 18));
        Ok(())
    }
}
