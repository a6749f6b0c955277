use std::collections::BTreeSet;

/// Data-flow reachability between outputs, used to decide which unknowns a right-hand side can
/// touch. Nodes are output layout positions.
#[derive(Debug, Clone)]
pub(crate) struct RelevanceGraph {
    successors: Vec<Vec<usize>>,
    predecessors: Vec<Vec<usize>>,
}

impl RelevanceGraph {
    /// `edges` are `(source, dependent)` pairs.
    pub(crate) fn new(n: usize, edges: &[(usize, usize)]) -> Self {
        let mut successors = vec![Vec::new(); n];
        let mut predecessors = vec![Vec::new(); n];
        for &(from, to) in edges {
            if from < n && to < n {
                successors[from].push(to);
                predecessors[to].push(from);
            }
        }
        Self {
            successors,
            predecessors,
        }
    }

    fn reach(adjacency: &[Vec<usize>], start: &[usize]) -> BTreeSet<usize> {
        let mut seen: BTreeSet<usize> = start.iter().copied().filter(|&s| s < adjacency.len()).collect();
        let mut stack: Vec<usize> = seen.iter().copied().collect();
        while let Some(node) = stack.pop() {
            for &next in &adjacency[node] {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        seen
    }

    /// Nodes that `start` influences, `start` included.
    pub(crate) fn downstream(&self, start: &[usize]) -> BTreeSet<usize> {
        Self::reach(&self.successors, start)
    }

    /// Nodes that influence `start`, `start` included.
    pub(crate) fn upstream(&self, start: &[usize]) -> BTreeSet<usize> {
        Self::reach(&self.predecessors, start)
    }
}

/// Seeds that share one restricted linear system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VoiGroup {
    /// Indices into the seed list, ascending.
    pub seeds: Vec<usize>,
    /// Output positions the group's solves can touch.
    pub relevant: BTreeSet<usize>,
}

/// Partitions seeds into groups whose relevant variable sets are disjoint.
///
/// `relevant[i]` is the set of outputs seed `i` can reach on its way to the other side. Seeds
/// with an empty set are left out entirely: their derivatives are zero. Overlapping sets are
/// merged transitively, so the partition is as coarse as the data flow requires. Groups are
/// ordered by their first seed.
pub(crate) fn partition_seeds(relevant: &[BTreeSet<usize>]) -> Vec<VoiGroup> {
    let mut groups: Vec<VoiGroup> = Vec::new();
    for (seed, set) in relevant.iter().enumerate() {
        if set.is_empty() {
            continue;
        }
        let mut merged = VoiGroup {
            seeds: vec![seed],
            relevant: set.clone(),
        };
        let mut kept = Vec::with_capacity(groups.len());
        for group in groups {
            if group.relevant.is_disjoint(&merged.relevant) {
                kept.push(group);
            } else {
                merged.seeds.extend(group.seeds);
                merged.relevant.extend(group.relevant);
            }
        }
        merged.seeds.sort_unstable();
        kept.push(merged);
        groups = kept;
    }
    groups.sort_by_key(|g| g.seeds[0]);
    groups
}
