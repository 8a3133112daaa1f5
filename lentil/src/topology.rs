//! Weighted overlap graph over data sets.

use crate::assay::AssayCollection;
use crate::lentil_common::*;
use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TopologyEdge {
    pub source: usize,
    pub target: usize,
    /// number of shared feature names
    pub weight: usize,
}

/// Undirected graph with one node per data set and an edge wherever two
/// data sets share at least one feature
#[derive(Clone, Debug)]
pub struct Topology {
    nodes: Vec<Box<str>>,
    edges: Vec<TopologyEdge>,
    /// sorted by neighbour position: (neighbour, edge index)
    adjacency: Vec<Vec<(usize, usize)>>,
}

impl Topology {
    /// Build the overlap graph of the data sets' feature names
    pub fn from_assays(assays: &AssayCollection) -> Self {
        let feature_sets = assays
            .assays()
            .iter()
            .map(|x| x.row_names().iter().map(|r| r.as_ref()).collect::<HashSet<&str>>())
            .collect::<Vec<_>>();

        let topology = Self::from_feature_sets(assays.names(), &feature_sets);

        info!(
            "topology: {} datasets, {} edges, {} component(s)",
            topology.num_nodes(),
            topology.num_edges(),
            topology.num_components()
        );

        if !topology.is_connected() {
            warn!(
                "disconnected topology: data sets in different components cannot be integrated"
            );
        }
        topology
    }

    /// * `names` - node names
    /// * `feature_sets` - features of each node
    pub fn from_feature_sets(names: &[Box<str>], feature_sets: &[HashSet<&str>]) -> Self {
        debug_assert_eq!(names.len(), feature_sets.len());

        let nn = names.len();
        let mut edges = vec![];
        let mut adjacency = vec![vec![]; nn];

        for a in 0..nn {
            for b in (a + 1)..nn {
                let (small, large) = if feature_sets[a].len() <= feature_sets[b].len() {
                    (&feature_sets[a], &feature_sets[b])
                } else {
                    (&feature_sets[b], &feature_sets[a])
                };
                let weight = small.iter().filter(|x| large.contains(*x)).count();
                if weight > 0 {
                    let e = edges.len();
                    edges.push(TopologyEdge {
                        source: a,
                        target: b,
                        weight,
                    });
                    adjacency[a].push((b, e));
                    adjacency[b].push((a, e));
                }
            }
        }

        for nbrs in adjacency.iter_mut() {
            nbrs.sort_unstable();
        }

        Self {
            nodes: names.to_vec(),
            edges,
            adjacency,
        }
    }

    pub fn nodes(&self) -> &[Box<str>] {
        &self.nodes
    }

    pub fn edges(&self) -> &[TopologyEdge] {
        &self.edges
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Neighbouring nodes in ascending position
    pub fn neighbours(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        self.adjacency[node].iter().map(|&(v, _)| v)
    }

    /// Edge weight between two nodes; zero if they are not adjacent
    pub fn weight(&self, a: usize, b: usize) -> usize {
        self.adjacency[a]
            .iter()
            .find(|&&(v, _)| v == b)
            .map(|&(_, e)| self.edges[e].weight)
            .unwrap_or(0)
    }

    /// Component label of every node and the number of components
    pub fn components(&self) -> (Vec<usize>, usize) {
        let nn = self.num_nodes();
        let mut label = vec![usize::MAX; nn];
        let mut n_components = 0;

        for start in 0..nn {
            if label[start] != usize::MAX {
                continue;
            }
            let mut stack = vec![start];
            while let Some(node) = stack.pop() {
                if label[node] != usize::MAX {
                    continue;
                }
                label[node] = n_components;
                for v in self.neighbours(node) {
                    if label[v] == usize::MAX {
                        stack.push(v);
                    }
                }
            }
            n_components += 1;
        }
        (label, n_components)
    }

    pub fn num_components(&self) -> usize {
        self.components().1
    }

    pub fn is_connected(&self) -> bool {
        self.num_components() <= 1
    }

    /// Nodes with no path to any of `references`
    pub fn unreachable_from(&self, references: &[usize]) -> Vec<usize> {
        let (label, _) = self.components();
        let reachable: HashSet<usize> = references.iter().map(|&r| label[r]).collect();
        (0..self.num_nodes())
            .filter(|&v| !reachable.contains(&label[v]))
            .collect()
    }

    /// Fail with [`LentilError::DisconnectedTopology`] unless every node
    /// can reach at least one of `references`
    pub fn check_reachable(&self, references: &[usize]) -> anyhow::Result<()> {
        let unreachable = self.unreachable_from(references);
        if unreachable.is_empty() {
            return Ok(());
        }
        Err(LentilError::DisconnectedTopology {
            n_components: self.num_components(),
            unreachable: unreachable.iter().map(|&v| self.nodes[v].clone()).collect(),
        }
        .into())
    }

    /// Fewest-hop path `from ..= to`, or `None` if `to` is unreachable
    ///
    /// Breadth-first search expanding neighbours in ascending node
    /// position; the first discovered parent of a node is kept, so
    /// among equally short paths the one through earlier data sets
    /// wins.
    pub fn shortest_path(&self, from: usize, to: usize) -> Option<Vec<usize>> {
        let nn = self.num_nodes();
        if from >= nn || to >= nn {
            return None;
        }

        let mut parent = vec![usize::MAX; nn];
        let mut visited = vec![false; nn];
        let mut queue = VecDeque::new();
        visited[from] = true;
        queue.push_back(from);

        while let Some(u) = queue.pop_front() {
            if u == to {
                break;
            }
            for v in self.neighbours(u) {
                if !visited[v] {
                    visited[v] = true;
                    parent[v] = u;
                    queue.push_back(v);
                }
            }
        }

        if !visited[to] {
            return None;
        }

        let mut path = vec![to];
        let mut v = to;
        while v != from {
            v = parent[v];
            path.push(v);
        }
        path.reverse();
        Some(path)
    }
}
