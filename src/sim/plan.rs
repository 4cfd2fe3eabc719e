//! Topological ordering of the algebraic sub-graph.
//!
//! When the combinational blocks form a DAG, one pass in dependency order
//! settles them exactly; the fixed-point loop is only needed for cycles
//! and label wiring. On a cycle the plan keeps the declaration order so
//! the iterative solver still visits every candidate.

use std::collections::HashMap;

use crate::diagram::{source_block_id, Block};

/// An evaluation order over the algebraic candidates, as indices into the
/// diagram's block list.
#[derive(Debug, Clone, Default)]
pub struct AlgebraicPlan {
    pub ordered: Vec<usize>,
    pub has_cycle: bool,
}

/// Kahn's algorithm over the candidate blocks, with edges drawn from the
/// input map restricted to candidate-to-candidate links.
pub fn build_algebraic_plan(
    blocks: &[Block],
    candidates: &[usize],
    input_map: &HashMap<String, Vec<Option<String>>>,
) -> AlgebraicPlan {
    if candidates.is_empty() {
        return AlgebraicPlan::default();
    }

    let position: HashMap<&str, usize> = candidates
        .iter()
        .enumerate()
        .map(|(pos, &idx)| (blocks[idx].id.as_str(), pos))
        .collect();

    let mut indegree = vec![0usize; candidates.len()];
    let mut out_edges: Vec<Vec<usize>> = vec![Vec::new(); candidates.len()];
    for (target_pos, &target_idx) in candidates.iter().enumerate() {
        let target_id = blocks[target_idx].id.as_str();
        let Some(inputs) = input_map.get(target_id) else {
            continue;
        };
        for key in inputs.iter().flatten() {
            let src_id = source_block_id(key);
            let Some(&src_pos) = position.get(src_id) else {
                continue;
            };
            if src_pos == target_pos || out_edges[src_pos].contains(&target_pos) {
                continue;
            }
            out_edges[src_pos].push(target_pos);
            indegree[target_pos] += 1;
        }
    }

    let mut queue: Vec<usize> = (0..candidates.len())
        .filter(|&pos| indegree[pos] == 0)
        .collect();
    let mut ordered = Vec::with_capacity(candidates.len());
    let mut read_idx = 0;
    while read_idx < queue.len() {
        let pos = queue[read_idx];
        read_idx += 1;
        ordered.push(candidates[pos]);
        for &neighbor in &out_edges[pos] {
            indegree[neighbor] -= 1;
            if indegree[neighbor] == 0 {
                queue.push(neighbor);
            }
        }
    }

    let has_cycle = ordered.len() != candidates.len();
    AlgebraicPlan {
        ordered: if has_cycle {
            candidates.to_vec()
        } else {
            ordered
        },
        has_cycle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagram::{build_input_map, infer_input_counts, BlockType, Connection};

    fn gain(id: &str) -> Block {
        Block::new(id, BlockType::Gain)
    }

    #[test]
    fn chains_order_upstream_first() {
        let blocks = vec![gain("c"), gain("a"), gain("b")];
        let connections = vec![Connection::new("a", "b"), Connection::new("b", "c")];
        let counts = infer_input_counts(&blocks, &connections);
        let input_map = build_input_map(&blocks, &connections, &counts);

        let plan = build_algebraic_plan(&blocks, &[0, 1, 2], &input_map);
        assert!(!plan.has_cycle);
        let ids: Vec<&str> = plan.ordered.iter().map(|&i| blocks[i].id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn cycles_keep_declaration_order() {
        let blocks = vec![gain("a"), gain("b")];
        let connections = vec![Connection::new("a", "b"), Connection::new("b", "a")];
        let counts = infer_input_counts(&blocks, &connections);
        let input_map = build_input_map(&blocks, &connections, &counts);

        let plan = build_algebraic_plan(&blocks, &[0, 1], &input_map);
        assert!(plan.has_cycle);
        assert_eq!(plan.ordered, vec![0, 1]);
    }

    #[test]
    fn edges_outside_the_candidate_set_are_ignored() {
        let blocks = vec![Block::new("src", BlockType::Constant), gain("g")];
        let connections = vec![Connection::new("src", "g")];
        let counts = infer_input_counts(&blocks, &connections);
        let input_map = build_input_map(&blocks, &connections, &counts);

        let plan = build_algebraic_plan(&blocks, &[1], &input_map);
        assert!(!plan.has_cycle);
        assert_eq!(plan.ordered, vec![1]);
    }
}
