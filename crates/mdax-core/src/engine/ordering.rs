use std::collections::BTreeSet;

/// A topological order of `n` nodes plus the edges dropped to make the graph acyclic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Ordering {
    pub order: Vec<usize>,
    pub broken: Vec<(usize, usize)>,
}

/// Kahn's algorithm with declaration order as the tie-break.
///
/// When only cycles remain, the lowest-indexed pending node is scheduled next and its
/// remaining incoming edges are recorded as broken. The result depends only on `n` and the
/// edge set, never on hashing or timing.
pub(crate) fn topological_order(n: usize, edges: &[(usize, usize)]) -> Ordering {
    let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    let mut predecessors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    for &(from, to) in edges {
        if from != to && from < n && to < n {
            successors[from].insert(to);
            predecessors[to].insert(from);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| predecessors[i].is_empty()).collect();
    let mut pending: BTreeSet<usize> = (0..n).collect();
    let mut order = Vec::with_capacity(n);
    let mut broken = Vec::new();

    while !pending.is_empty() {
        let next = match ready.pop_first() {
            Some(node) => node,
            None => {
                let Some(&node) = pending.first() else {
                    break;
                };
                for &from in &predecessors[node] {
                    broken.push((from, node));
                    successors[from].remove(&node);
                }
                predecessors[node].clear();
                node
            }
        };
        pending.remove(&next);
        order.push(next);
        let targets: Vec<usize> = successors[next].iter().copied().collect();
        for to in targets {
            predecessors[to].remove(&next);
            if predecessors[to].is_empty() && pending.contains(&to) {
                ready.insert(to);
            }
        }
    }

    Ordering { order, broken }
}
