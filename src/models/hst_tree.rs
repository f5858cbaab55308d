use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Split rule of an internal node, or nothing for a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Branch {
        feature: usize,
        split: f64,
        left: usize,
        right: usize,
    },
    Leaf,
}

/// Arena node with its reference (`r_mass`) and latest (`l_mass`) counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HstNode {
    pub kind: NodeKind,
    pub depth: usize,
    pub r_mass: u64,
    pub l_mass: u64,
}

/// One half-space tree stored as an arena; node 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HalfSpaceTree {
    nodes: Vec<HstNode>,
    work_range: Vec<(f64, f64)>,
    absorbed: usize,
    rotations: u64,
}

impl HalfSpaceTree {
    /// Build a full tree of `height` split levels over `n_features` features.
    ///
    /// Each feature gets a working range centred on a random point `s` of the
    /// unit interval, padded to `s ± 2·max(s, 1 - s)`. Nodes split the chosen
    /// feature's current range at its midpoint.
    pub fn new(n_features: usize, height: usize, rng: &mut StdRng) -> Self {
        assert!(n_features > 0, "a tree needs at least one feature");
        let work_range: Vec<(f64, f64)> = (0..n_features)
            .map(|_| {
                let s: f64 = rng.gen();
                let w = 2.0 * s.max(1.0 - s);
                (s - w, s + w)
            })
            .collect();

        let mut tree = HalfSpaceTree {
            nodes: Vec::with_capacity((1usize << (height + 1)) - 1),
            work_range: work_range.clone(),
            absorbed: 0,
            rotations: 0,
        };
        let mins = work_range.iter().map(|r| r.0).collect();
        let maxes = work_range.iter().map(|r| r.1).collect();
        tree.build(mins, maxes, 0, height, rng);
        tree
    }

    fn build(
        &mut self,
        mut mins: Vec<f64>,
        mut maxes: Vec<f64>,
        depth: usize,
        height: usize,
        rng: &mut StdRng,
    ) -> usize {
        let index = self.nodes.len();
        self.nodes.push(HstNode {
            kind: NodeKind::Leaf,
            depth,
            r_mass: 0,
            l_mass: 0,
        });
        if depth == height {
            return index;
        }

        let q = rng.gen_range(0..mins.len());
        let p = (maxes[q] + mins[q]) / 2.0;

        let temp = maxes[q];
        maxes[q] = p;
        let left = self.build(mins.clone(), maxes.clone(), depth + 1, height, rng);
        maxes[q] = temp;
        mins[q] = p;
        let right = self.build(mins, maxes, depth + 1, height, rng);

        self.nodes[index].kind = NodeKind::Branch {
            feature: q,
            split: p,
            left,
            right,
        };
        index
    }

    fn next(&self, node: &HstNode, x: &[Option<f64>]) -> Option<usize> {
        match node.kind {
            NodeKind::Leaf => None,
            NodeKind::Branch {
                feature,
                split,
                left,
                right,
            } => Some(match x.get(feature).copied().flatten() {
                Some(value) if value <= split => left,
                Some(_) => right,
                // Missing value: follow the busier side of the current window.
                None => {
                    if self.nodes[left].l_mass > self.nodes[right].l_mass {
                        left
                    } else {
                        right
                    }
                }
            }),
        }
    }

    /// Node indices visited from the root down to a leaf.
    pub fn path(&self, x: &[Option<f64>]) -> Vec<usize> {
        let mut path = Vec::with_capacity(self.height() + 1);
        let mut current = Some(0);
        while let Some(index) = current {
            path.push(index);
            current = self.next(&self.nodes[index], x);
        }
        path
    }

    /// Depth-decayed reference mass along the path of `x`.
    ///
    /// Larger values mean `x` lands where the last window was dense.
    pub fn mass(&self, x: &[Option<f64>]) -> f64 {
        self.path(x)
            .into_iter()
            .map(|i| {
                let node = &self.nodes[i];
                node.r_mass as f64 * 0.5f64.powi(node.depth as i32)
            })
            .sum()
    }

    /// Count `x` into the latest profile of every node on its path.
    pub fn learn(&mut self, x: &[Option<f64>]) {
        let mut current = Some(0);
        while let Some(index) = current {
            self.nodes[index].l_mass += 1;
            current = self.next(&self.nodes[index], x);
        }
        self.absorbed += 1;
    }

    /// Rotate once `window_size` points have been absorbed since the last rotation.
    pub fn maybe_rotate_window(&mut self, window_size: usize) -> bool {
        if self.absorbed < window_size {
            return false;
        }
        for node in &mut self.nodes {
            node.r_mass = node.l_mass;
            node.l_mass = 0;
        }
        self.absorbed = 0;
        self.rotations += 1;
        true
    }

    pub fn nodes(&self) -> &[HstNode] {
        &self.nodes
    }

    pub fn work_range(&self) -> &[(f64, f64)] {
        &self.work_range
    }

    pub fn reference_profile(&self) -> Vec<u64> {
        self.nodes.iter().map(|n| n.r_mass).collect()
    }

    pub fn latest_profile(&self) -> Vec<u64> {
        self.nodes.iter().map(|n| n.l_mass).collect()
    }

    pub fn absorbed(&self) -> usize {
        self.absorbed
    }

    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    pub fn height(&self) -> usize {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }

    /// Whether the arena is a full binary tree of `height` levels over
    /// `n_features` features with in-bounds child links.
    pub fn is_well_formed(&self, height: usize, n_features: usize) -> bool {
        if self.nodes.len() != (1usize << (height + 1)) - 1 || self.work_range.len() != n_features
        {
            return false;
        }
        self.nodes.iter().all(|node| match node.kind {
            NodeKind::Leaf => node.depth == height,
            NodeKind::Branch {
                feature,
                left,
                right,
                ..
            } => {
                node.depth < height
                    && feature < n_features
                    && left < self.nodes.len()
                    && right < self.nodes.len()
                    && self.nodes[left].depth == node.depth + 1
                    && self.nodes[right].depth == node.depth + 1
            }
        })
    }
}
