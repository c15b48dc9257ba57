use drover_core::WorkItem;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// A dependency edge pointing at an id that is not in the input set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingDependency {
    /// Item declaring the dependency.
    pub work_item_id: String,
    /// Id not present in the item set.
    pub dependency_id: String,
}

/// Output of [`resolve_dependencies`].
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Items in an order that respects every known dependency edge.
    pub ordered: Vec<WorkItem>,
    /// Items on, or downstream of, a dependency cycle, in input order.
    pub cycles: Vec<WorkItem>,
    /// Edges to unknown ids. The owning item is still ordered.
    pub missing: Vec<MissingDependency>,
}

impl Resolution {
    /// Ids of items that can never become eligible.
    pub fn blocked_ids(&self) -> HashSet<&str> {
        self.cycles
            .iter()
            .map(|i| i.id.as_str())
            .chain(self.missing.iter().map(|m| m.work_item_id.as_str()))
            .collect()
    }
}

/// Topologically order work items with Kahn's algorithm.
///
/// Among items that are ready at the same time, lower `priority` comes first,
/// then earlier input position. Edges to ids outside the set do not count
/// toward in-degree; they are reported in [`Resolution::missing`].
pub fn resolve_dependencies(items: &[WorkItem]) -> Resolution {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        index.entry(item.id.as_str()).or_insert(i);
    }

    let mut in_degree = vec![0usize; items.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); items.len()];
    let mut missing = Vec::new();

    for (i, item) in items.iter().enumerate() {
        let mut seen = HashSet::new();
        for dep in &item.dependencies {
            if !seen.insert(dep.as_str()) {
                continue;
            }
            match index.get(dep.as_str()) {
                Some(&d) => {
                    in_degree[i] += 1;
                    dependents[d].push(i);
                }
                None => missing.push(MissingDependency {
                    work_item_id: item.id.clone(),
                    dependency_id: dep.clone(),
                }),
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<(u8, usize)>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse((items[i].priority, i)))
        .collect();

    let mut emitted = vec![false; items.len()];
    let mut ordered = Vec::with_capacity(items.len());
    while let Some(Reverse((_, i))) = ready.pop() {
        emitted[i] = true;
        ordered.push(items[i].clone());
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse((items[next].priority, next)));
            }
        }
    }

    let cycles = items
        .iter()
        .zip(&emitted)
        .filter(|(_, done)| !**done)
        .map(|(item, _)| item.clone())
        .collect();

    Resolution {
        ordered,
        cycles,
        missing,
    }
}

/// Whether every dependency exists in `all` and is completed or verified.
pub fn dependencies_satisfied(item: &WorkItem, all: &[WorkItem]) -> bool {
    blocking_dependencies(item, all).is_empty()
}

/// Dependencies of `item` that are unknown or not yet satisfied.
pub fn blocking_dependencies<'a>(item: &'a WorkItem, all: &[WorkItem]) -> Vec<&'a str> {
    item.dependencies
        .iter()
        .filter(|dep| {
            !all.iter()
                .find(|w| &w.id == *dep)
                .is_some_and(|w| w.status.satisfies_dependency())
        })
        .map(String::as_str)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use drover_core::WorkItemStatus;

    fn ids(items: &[WorkItem]) -> Vec<&str> {
        items.iter().map(|i| i.id.as_str()).collect()
    }

    #[test]
    fn test_linear_chain() {
        let items = vec![
            WorkItem::new("c", "C").with_dependencies(["b"]),
            WorkItem::new("b", "B").with_dependencies(["a"]),
            WorkItem::new("a", "A"),
        ];
        let r = resolve_dependencies(&items);
        assert_eq!(ids(&r.ordered), vec!["a", "b", "c"]);
        assert!(r.cycles.is_empty());
        assert!(r.missing.is_empty());
    }

    #[test]
    fn test_ties_keep_input_order() {
        let items = vec![WorkItem::new("x", "X"), WorkItem::new("y", "Y"), WorkItem::new("z", "Z")];
        assert_eq!(ids(&resolve_dependencies(&items).ordered), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_priority_breaks_ties() {
        let items = vec![
            WorkItem::new("low", "L").with_priority(3),
            WorkItem::new("high", "H").with_priority(0),
            WorkItem::new("mid", "M"),
        ];
        assert_eq!(ids(&resolve_dependencies(&items).ordered), vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_cycle_does_not_block_unrelated() {
        let items = vec![
            WorkItem::new("a", "A").with_dependencies(["b"]),
            WorkItem::new("b", "B").with_dependencies(["a"]),
            WorkItem::new("c", "C"),
            WorkItem::new("d", "D").with_dependencies(["a"]),
        ];
        let r = resolve_dependencies(&items);
        assert_eq!(ids(&r.ordered), vec!["c"]);
        assert_eq!(ids(&r.cycles), vec!["a", "b", "d"]);
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let items = vec![WorkItem::new("a", "A").with_dependencies(["a"])];
        let r = resolve_dependencies(&items);
        assert!(r.ordered.is_empty());
        assert_eq!(ids(&r.cycles), vec!["a"]);
    }

    #[test]
    fn test_missing_dependency_reported_but_ordered() {
        let items = vec![
            WorkItem::new("a", "A").with_dependencies(["ghost", "ghost"]),
            WorkItem::new("b", "B"),
        ];
        let r = resolve_dependencies(&items);
        assert_eq!(ids(&r.ordered), vec!["a", "b"]);
        assert_eq!(
            r.missing,
            vec![MissingDependency {
                work_item_id: "a".into(),
                dependency_id: "ghost".into()
            }]
        );
        assert!(r.blocked_ids().contains("a"));
    }

    #[test]
    fn test_duplicate_edges_counted_once() {
        let items = vec![
            WorkItem::new("b", "B").with_dependencies(["a", "a"]),
            WorkItem::new("a", "A"),
        ];
        assert_eq!(ids(&resolve_dependencies(&items).ordered), vec!["a", "b"]);
    }

    #[test]
    fn test_dependency_satisfaction() {
        let all = vec![
            WorkItem::new("a", "A").with_status(WorkItemStatus::Verified),
            WorkItem::new("b", "B").with_status(WorkItemStatus::Running),
            WorkItem::new("c", "C").with_dependencies(["a", "b", "zzz"]),
        ];
        assert_eq!(blocking_dependencies(&all[2], &all), vec!["b", "zzz"]);
        assert!(!dependencies_satisfied(&all[2], &all));
        assert!(dependencies_satisfied(&all[0], &all));
    }
}
