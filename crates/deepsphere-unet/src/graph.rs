//! Sphere mesh graphs and the scaled Chebyshev Laplacian.
//!
//! A [`MeshHierarchy`] holds one [`MeshGraph`] per resolution level, level 0
//! being the coarsest and level 5 the input resolution. Graphs are directed
//! COO edge lists; undirected meshes list both directions.
//!
//! [`ChebLaplacian`] turns one graph into the rescaled operator
//!
//! ```text
//! L̂ = (2 / λ_max) · L − I,     λ_max = 2
//! L  = I − D^-1/2 A D^-1/2      (normalized)
//! L  = D − A                    (combinatorial)
//! ```
//!
//! stored as COO triplets on the target device. Self-loops in the input are
//! dropped before the degree is computed and edges without an explicit weight
//! count as 1.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tch::{Device, Tensor};
use tracing::debug;

use crate::error::{ConfigError, ModelError, ModelResult, TrainResult};

/// Number of resolution levels in the U-Net mesh hierarchy.
pub const NUM_LEVELS: usize = 6;

/// Largest eigenvalue assumed when rescaling the Laplacian.
pub const LAMBDA_MAX: f64 = 2.0;

// ---------------------------------------------------------------------------
// LaplacianType
// ---------------------------------------------------------------------------

/// Normalization applied to the graph Laplacian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaplacianType {
    /// `L = I − D^-1/2 A D^-1/2`.
    #[default]
    Normalized,
    /// `L = D − A`.
    Combinatorial,
}

impl LaplacianType {
    /// Lower-case name used in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            LaplacianType::Normalized => "normalized",
            LaplacianType::Combinatorial => "combinatorial",
        }
    }
}

impl fmt::Display for LaplacianType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LaplacianType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normalized" => Ok(LaplacianType::Normalized),
            "combinatorial" => Ok(LaplacianType::Combinatorial),
            other => Err(ModelError::InvalidLaplacianType { value: other.to_string() }),
        }
    }
}

// ---------------------------------------------------------------------------
// MeshGraph
// ---------------------------------------------------------------------------

/// Directed graph of one mesh level in COO form.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshGraph {
    num_nodes: usize,
    sources: Vec<i64>,
    targets: Vec<i64>,
    weights: Option<Vec<f32>>,
}

impl MeshGraph {
    /// Build a graph from parallel source/target index lists.
    ///
    /// # Errors
    ///
    /// Fails when the graph is empty, the two index lists differ in length,
    /// an index is outside `0..num_nodes`, or the weights do not match the
    /// edge count or are not finite.
    pub fn new(
        num_nodes: usize,
        sources: Vec<i64>,
        targets: Vec<i64>,
        weights: Option<Vec<f32>>,
    ) -> ModelResult<Self> {
        if num_nodes == 0 {
            return Err(ModelError::EmptyGraph);
        }
        if sources.len() != targets.len() {
            return Err(ModelError::EdgeIndexShape {
                sources: sources.len(),
                targets: targets.len(),
            });
        }
        for (edge, (&s, &t)) in sources.iter().zip(targets.iter()).enumerate() {
            for node in [s, t] {
                if node < 0 || node as usize >= num_nodes {
                    return Err(ModelError::NodeIndexOutOfRange { edge, node, num_nodes });
                }
            }
        }
        if let Some(w) = &weights {
            if w.len() != sources.len() {
                return Err(ModelError::EdgeWeightCount { edges: sources.len(), weights: w.len() });
            }
            if let Some(edge) = w.iter().position(|v| !v.is_finite()) {
                return Err(ModelError::NonFiniteEdgeWeight { edge });
            }
        }
        Ok(MeshGraph { num_nodes, sources, targets, weights })
    }

    /// Build a graph from `(source, target)` pairs.
    pub fn from_pairs(
        num_nodes: usize,
        edges: &[[i64; 2]],
        weights: Option<Vec<f32>>,
    ) -> ModelResult<Self> {
        let (sources, targets): (Vec<i64>, Vec<i64>) = edges.iter().map(|e| (e[0], e[1])).unzip();
        Self::new(num_nodes, sources, targets, weights)
    }

    /// Undirected cycle over `num_nodes` nodes, both directions listed.
    pub fn ring(num_nodes: usize) -> ModelResult<Self> {
        let n = num_nodes as i64;
        let mut sources = Vec::with_capacity(2 * num_nodes);
        let mut targets = Vec::with_capacity(2 * num_nodes);
        match num_nodes {
            0 | 1 => {}
            2 => {
                sources.extend([0, 1]);
                targets.extend([1, 0]);
            }
            _ => {
                for i in 0..n {
                    let j = (i + 1) % n;
                    sources.extend([i, j]);
                    targets.extend([j, i]);
                }
            }
        }
        Self::new(num_nodes, sources, targets, None)
    }

    /// Number of nodes.
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Number of directed edges, self-loops included.
    pub fn num_edges(&self) -> usize {
        self.sources.len()
    }

    /// Source node of every edge.
    pub fn sources(&self) -> &[i64] {
        &self.sources
    }

    /// Target node of every edge.
    pub fn targets(&self) -> &[i64] {
        &self.targets
    }

    /// Explicit edge weights, if any.
    pub fn weights(&self) -> Option<&[f32]> {
        self.weights.as_deref()
    }

    /// Iterate `(source, target, weight)` with unit weight when none are set.
    pub fn edges(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.sources.iter().zip(self.targets.iter()).enumerate().map(move |(i, (&s, &t))| {
            let w = self.weights.as_ref().map_or(1.0, |w| f64::from(w[i]));
            (s as usize, t as usize, w)
        })
    }
}

// ---------------------------------------------------------------------------
// MeshHierarchy
// ---------------------------------------------------------------------------

/// On-disk form of one mesh level (PyG-style `edge_index` of shape `[2, E]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MeshLevelRecord {
    num_nodes: usize,
    edge_index: [Vec<i64>; 2],
    #[serde(default)]
    edge_weight: Option<Vec<f32>>,
}

/// On-disk form of a complete hierarchy, coarsest level first.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MeshHierarchyRecord {
    levels: Vec<MeshLevelRecord>,
}

/// Six mesh graphs ordered from level 0 (coarsest) to level 5 (input).
///
/// Node counts strictly increase with the level index.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshHierarchy {
    levels: [MeshGraph; NUM_LEVELS],
}

impl MeshHierarchy {
    /// Wrap six already-built graphs.
    ///
    /// # Errors
    ///
    /// [`ModelError::LevelCount`] when `levels.len() != 6`,
    /// [`ModelError::NodeCountOrder`] when node counts do not increase.
    pub fn new(levels: Vec<MeshGraph>) -> ModelResult<Self> {
        let levels: [MeshGraph; NUM_LEVELS] =
            levels.try_into().map_err(|v: Vec<MeshGraph>| ModelError::LevelCount {
                list: "levels",
                expected: NUM_LEVELS,
                found: v.len(),
            })?;
        for level in 0..NUM_LEVELS - 1 {
            let nodes = levels[level].num_nodes();
            let finer_nodes = levels[level + 1].num_nodes();
            if nodes >= finer_nodes {
                return Err(ModelError::NodeCountOrder {
                    level,
                    nodes,
                    finer: level + 1,
                    finer_nodes,
                });
            }
        }
        Ok(MeshHierarchy { levels })
    }

    /// Build from per-level node counts, `(source, target)` edge lists and
    /// optional edge weights, each ordered coarsest first.
    ///
    /// # Errors
    ///
    /// Every list must hold exactly six entries; each level is validated as
    /// in [`MeshGraph::new`] and the error is tagged with its level.
    pub fn from_edge_lists(
        node_counts: &[usize],
        edge_index_list: Vec<Vec<[i64; 2]>>,
        edge_weight_list: Vec<Option<Vec<f32>>>,
    ) -> ModelResult<Self> {
        check_level_count("node_counts", node_counts.len())?;
        check_level_count("edge_index_list", edge_index_list.len())?;
        check_level_count("edge_weight_list", edge_weight_list.len())?;

        let graphs = node_counts
            .iter()
            .zip(edge_index_list)
            .zip(edge_weight_list)
            .enumerate()
            .map(|(level, ((&n, edges), weights))| {
                MeshGraph::from_pairs(n, &edges, weights).map_err(|e| e.at_level(level))
            })
            .collect::<ModelResult<Vec<_>>>()?;
        Self::new(graphs)
    }

    /// Load a hierarchy from the JSON format
    /// `{"levels": [{"num_nodes", "edge_index": [[src..], [dst..]], "edge_weight"}]}`.
    pub fn from_json(path: &Path) -> TrainResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let record: MeshHierarchyRecord = serde_json::from_str(&contents)?;
        check_level_count("levels", record.levels.len())?;
        let graphs = record
            .levels
            .into_iter()
            .enumerate()
            .map(|(level, r)| {
                let [sources, targets] = r.edge_index;
                MeshGraph::new(r.num_nodes, sources, targets, r.edge_weight)
                    .map_err(|e| e.at_level(level))
            })
            .collect::<ModelResult<Vec<_>>>()?;
        let hierarchy = Self::new(graphs)?;
        debug!(path = %path.display(), nodes = ?hierarchy.node_counts(), "loaded mesh hierarchy");
        Ok(hierarchy)
    }

    /// Write the hierarchy in the format read by [`MeshHierarchy::from_json`].
    pub fn to_json(&self, path: &Path) -> TrainResult<()> {
        let record = MeshHierarchyRecord {
            levels: self
                .levels
                .iter()
                .map(|g| MeshLevelRecord {
                    num_nodes: g.num_nodes,
                    edge_index: [g.sources.clone(), g.targets.clone()],
                    edge_weight: g.weights.clone(),
                })
                .collect(),
        };
        let json = serde_json::to_string(&record)?;
        std::fs::write(path, json).map_err(crate::error::DatasetError::from)?;
        Ok(())
    }

    /// Nested ring graphs with `coarsest_nodes · factor^level` nodes per level.
    ///
    /// Only useful for dry runs and tests; real meshes come from an external
    /// generator via [`MeshHierarchy::from_json`].
    pub fn synthetic(coarsest_nodes: usize, factor: usize) -> ModelResult<Self> {
        if factor < 2 {
            return Err(ModelError::InvalidPoolingFactor { factor });
        }
        let graphs = (0..NUM_LEVELS as u32)
            .map(|level| {
                MeshGraph::ring(coarsest_nodes * factor.pow(level))
                    .map_err(|e| e.at_level(level as usize))
            })
            .collect::<ModelResult<Vec<_>>>()?;
        Self::new(graphs)
    }

    /// Graph of `level` (0 = coarsest).
    ///
    /// # Panics
    ///
    /// Panics if `level >= 6`.
    pub fn level(&self, level: usize) -> &MeshGraph {
        &self.levels[level]
    }

    /// All six graphs, coarsest first.
    pub fn levels(&self) -> &[MeshGraph; NUM_LEVELS] {
        &self.levels
    }

    /// Node count per level, coarsest first.
    pub fn node_counts(&self) -> [usize; NUM_LEVELS] {
        std::array::from_fn(|l| self.levels[l].num_nodes())
    }

    /// Node count of the input resolution (level 5).
    pub fn input_nodes(&self) -> usize {
        self.levels[NUM_LEVELS - 1].num_nodes()
    }
}

fn check_level_count(list: &'static str, found: usize) -> ModelResult<()> {
    if found != NUM_LEVELS {
        return Err(ModelError::LevelCount { list, expected: NUM_LEVELS, found });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ChebLaplacian
// ---------------------------------------------------------------------------

/// Entries `(row, col, value)` of the rescaled Laplacian `L̂` of `graph`.
///
/// Off-diagonal entries follow the edge direction of the input; diagonal
/// entries are listed once per node.
pub fn scaled_laplacian_entries(
    graph: &MeshGraph,
    laplacian_type: LaplacianType,
) -> Vec<(i64, i64, f32)> {
    let n = graph.num_nodes();
    let edges: Vec<(usize, usize, f64)> = graph.edges().filter(|(s, t, _)| s != t).collect();

    let mut degree = vec![0.0_f64; n];
    for &(s, _, w) in &edges {
        degree[s] += w;
    }

    let scale = 2.0 / LAMBDA_MAX;
    let mut entries = Vec::with_capacity(edges.len() + n);
    match laplacian_type {
        LaplacianType::Combinatorial => {
            for &(s, t, w) in &edges {
                entries.push((s as i64, t as i64, (-w * scale) as f32));
            }
            for (i, d) in degree.iter().enumerate() {
                entries.push((i as i64, i as i64, (d * scale - 1.0) as f32));
            }
        }
        LaplacianType::Normalized => {
            let inv_sqrt: Vec<f64> = degree
                .iter()
                .map(|&d| if d > 0.0 { d.sqrt().recip() } else { 0.0 })
                .collect();
            for &(s, t, w) in &edges {
                let value = -inv_sqrt[s] * w * inv_sqrt[t];
                entries.push((s as i64, t as i64, (value * scale) as f32));
            }
            for i in 0..n {
                entries.push((i as i64, i as i64, (scale - 1.0) as f32));
            }
        }
    }
    entries
}

/// Rescaled Laplacian of one mesh level, resident on a device.
///
/// Layers each own a handle obtained with [`ChebLaplacian::shallow_clone`];
/// the index and value tensors are stored once per level.
#[derive(Debug)]
pub struct ChebLaplacian {
    num_nodes: i64,
    laplacian_type: LaplacianType,
    rows: Tensor,
    cols: Tensor,
    values: Tensor,
}

impl ChebLaplacian {
    /// Precompute `L̂` for `graph` and move it to `device`.
    pub fn new(graph: &MeshGraph, laplacian_type: LaplacianType, device: Device) -> Self {
        let entries = scaled_laplacian_entries(graph, laplacian_type);
        let rows: Vec<i64> = entries.iter().map(|e| e.0).collect();
        let cols: Vec<i64> = entries.iter().map(|e| e.1).collect();
        let values: Vec<f32> = entries.iter().map(|e| e.2).collect();
        ChebLaplacian {
            num_nodes: graph.num_nodes() as i64,
            laplacian_type,
            rows: Tensor::from_slice(&rows).to_device(device),
            cols: Tensor::from_slice(&cols).to_device(device),
            values: Tensor::from_slice(&values).to_device(device),
        }
    }

    /// New handle on the same device storage.
    pub fn shallow_clone(&self) -> Self {
        ChebLaplacian {
            num_nodes: self.num_nodes,
            laplacian_type: self.laplacian_type,
            rows: self.rows.shallow_clone(),
            cols: self.cols.shallow_clone(),
            values: self.values.shallow_clone(),
        }
    }

    /// Whether `self` and `other` read the same device storage.
    pub fn shares_storage(&self, other: &ChebLaplacian) -> bool {
        self.values.data_ptr() == other.values.data_ptr()
            && self.rows.data_ptr() == other.rows.data_ptr()
            && self.cols.data_ptr() == other.cols.data_ptr()
    }

    /// Number of nodes the operator acts on.
    pub fn num_nodes(&self) -> i64 {
        self.num_nodes
    }

    /// Normalization this operator was built with.
    pub fn laplacian_type(&self) -> LaplacianType {
        self.laplacian_type
    }

    /// Number of stored entries (edges plus diagonal).
    pub fn nnz(&self) -> i64 {
        self.values.size()[0]
    }

    /// Apply `L̂` along the node axis of `x: [B, N, C]`.
    ///
    /// Entry `(row, col)` sends `value · x[row]` to node `col`.
    pub fn propagate(&self, x: &Tensor) -> Tensor {
        let messages = x.index_select(1, &self.rows) * self.values.view([1, -1, 1]);
        x.zeros_like().index_add(1, &self.cols, &messages)
    }
}

/// One [`ChebLaplacian`] per mesh level, coarsest first.
#[derive(Debug)]
pub struct LevelLaplacians {
    levels: [ChebLaplacian; NUM_LEVELS],
    node_counts: [usize; NUM_LEVELS],
}

impl LevelLaplacians {
    /// Build the operator of every level of `hierarchy` on `device`.
    pub fn new(hierarchy: &MeshHierarchy, laplacian_type: LaplacianType, device: Device) -> Self {
        LevelLaplacians {
            levels: std::array::from_fn(|l| {
                ChebLaplacian::new(hierarchy.level(l), laplacian_type, device)
            }),
            node_counts: hierarchy.node_counts(),
        }
    }

    /// Handle on the operator of `level` (0 = coarsest), sharing storage
    /// with every other handle of that level.
    ///
    /// # Panics
    ///
    /// Panics if `level >= 6`.
    pub fn level(&self, level: usize) -> ChebLaplacian {
        self.levels[level].shallow_clone()
    }

    /// Node count per level, coarsest first.
    pub fn node_counts(&self) -> [usize; NUM_LEVELS] {
        self.node_counts
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    fn dense(entries: &[(i64, i64, f32)], n: usize) -> Vec<Vec<f32>> {
        let mut m = vec![vec![0.0; n]; n];
        for &(r, c, v) in entries {
            m[r as usize][c as usize] += v;
        }
        m
    }

    #[test]
    fn laplacian_type_parses_lowercase_names() {
        assert_eq!("normalized".parse::<LaplacianType>().unwrap(), LaplacianType::Normalized);
        assert_eq!(
            "combinatorial".parse::<LaplacianType>().unwrap(),
            LaplacianType::Combinatorial
        );
        let err = "invalid".parse::<LaplacianType>().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn ring_has_two_directed_edges_per_node() {
        let g = MeshGraph::ring(5).unwrap();
        assert_eq!(g.num_edges(), 10);
        assert_eq!(MeshGraph::ring(2).unwrap().num_edges(), 2);
        assert_eq!(MeshGraph::ring(1).unwrap().num_edges(), 0);
    }

    #[test]
    fn combinatorial_laplacian_of_path_graph() {
        // 0 - 1 - 2
        let g = MeshGraph::from_pairs(3, &[[0, 1], [1, 0], [1, 2], [2, 1]], None).unwrap();
        let m = dense(&scaled_laplacian_entries(&g, LaplacianType::Combinatorial), 3);
        // L̂ = (D − A) − I with λ_max = 2
        assert_eq!(m[0], vec![0.0, -1.0, 0.0]);
        assert_eq!(m[1], vec![-1.0, 1.0, -1.0]);
        assert_eq!(m[2], vec![0.0, -1.0, 0.0]);
    }

    #[test]
    fn normalized_laplacian_has_zero_diagonal_after_rescaling() {
        let g = MeshGraph::ring(4).unwrap();
        let m = dense(&scaled_laplacian_entries(&g, LaplacianType::Normalized), 4);
        for (i, row) in m.iter().enumerate() {
            assert_eq!(row[i], 0.0);
            // every node has degree 2 → neighbours get −1/2
            assert!((row[(i + 1) % 4] + 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn self_loops_are_ignored() {
        let with_loop = MeshGraph::from_pairs(2, &[[0, 1], [1, 0], [0, 0]], None).unwrap();
        let without = MeshGraph::from_pairs(2, &[[0, 1], [1, 0]], None).unwrap();
        for kind in [LaplacianType::Normalized, LaplacianType::Combinatorial] {
            assert_eq!(
                dense(&scaled_laplacian_entries(&with_loop, kind), 2),
                dense(&scaled_laplacian_entries(&without, kind), 2)
            );
        }
    }

    #[test]
    fn propagate_matches_dense_product() {
        let weights = Some(vec![1.0, 1.0, 2.0, 2.0]);
        let g = MeshGraph::from_pairs(3, &[[0, 1], [1, 0], [1, 2], [2, 1]], weights).unwrap();
        let entries = scaled_laplacian_entries(&g, LaplacianType::Combinatorial);
        let m = dense(&entries, 3);
        let lap = ChebLaplacian::new(&g, LaplacianType::Combinatorial, Device::Cpu);

        let x = Tensor::from_slice(&[1.0_f32, 2.0, 3.0]).view([1, 3, 1]);
        let y = lap.propagate(&x);
        for node in 0..3 {
            // out[col] = Σ_row m[row][col] · x[row]
            let expected: f32 = (0..3).map(|r| m[r][node] * (r as f32 + 1.0)).sum();
            let got = y.double_value(&[0, node as i64, 0]) as f32;
            assert!((got - expected).abs() < 1e-5, "node {node}: {got} vs {expected}");
        }
        assert_eq!(y.kind(), Kind::Float);
    }

    #[test]
    fn hierarchy_rejects_non_increasing_node_counts() {
        let graphs = [4, 8, 8, 16, 32, 64].iter().map(|&n| MeshGraph::ring(n).unwrap()).collect();
        let err = MeshHierarchy::new(graphs).unwrap_err();
        assert!(matches!(err, ModelError::NodeCountOrder { level: 1, .. }));
    }
}
