use std::collections::{BTreeMap, BTreeSet};

pub type Graph = BTreeMap<String, BTreeMap<String, f64>>;

const EPS: f64 = 1e-9;

/// O(V^2) array-scan Dijkstra from `src` over an already-undirected graph.
///
/// Tie-breaking is deterministic so that every node computing the same
/// graph reaches the same first hop for every destination:
/// - among unvisited nodes at an equal minimum distance, the lexically
///   lower node id is visited first;
/// - among equal-cost paths to the same destination, the one whose first
///   hop has the lower node id wins.
///
/// Returns `(next_hop, cost)` tables, both excluding `src` itself.
/// Unreachable destinations are simply absent from either map.
pub fn dijkstra(graph: &Graph, src: &str) -> (BTreeMap<String, String>, BTreeMap<String, f64>) {
    let mut nodes: BTreeSet<String> = graph.keys().cloned().collect();
    nodes.insert(src.to_string());
    for neighbors in graph.values() {
        nodes.extend(neighbors.keys().cloned());
    }

    let mut dist: BTreeMap<String, f64> = nodes.iter().map(|n| (n.clone(), f64::INFINITY)).collect();
    dist.insert(src.to_string(), 0.0);
    let mut first_hop: BTreeMap<String, Option<String>> = nodes.iter().map(|n| (n.clone(), None)).collect();
    let mut visited: BTreeSet<String> = BTreeSet::new();

    for _ in 0..nodes.len() {
        let Some(u) = pick_min_unvisited(&dist, &visited) else {
            break;
        };
        visited.insert(u.clone());

        let Some(edges) = graph.get(&u) else { continue };
        let u_dist = dist[&u];
        if !u_dist.is_finite() {
            continue;
        }

        for (v, weight) in edges {
            if visited.contains(v) {
                continue;
            }
            let nd = u_dist + weight;
            let candidate_first_hop = if u == src { v.clone() } else {
                match first_hop.get(&u).and_then(|fh| fh.clone()) {
                    Some(fh) => fh,
                    None => continue,
                }
            };

            let current = dist.get(v).copied().unwrap_or(f64::INFINITY);
            if nd < current - EPS {
                dist.insert(v.clone(), nd);
                first_hop.insert(v.clone(), Some(candidate_first_hop));
            } else if (nd - current).abs() <= EPS {
                if let Some(Some(existing_fh)) = first_hop.get(v) {
                    if candidate_first_hop < *existing_fh {
                        first_hop.insert(v.clone(), Some(candidate_first_hop));
                    }
                }
            }
        }
    }

    let mut next_hop = BTreeMap::new();
    let mut cost = BTreeMap::new();
    for node in &nodes {
        if node == src {
            continue;
        }
        let Some(d) = dist.get(node).copied() else { continue };
        if !d.is_finite() {
            continue;
        }
        if let Some(Some(fh)) = first_hop.get(node) {
            next_hop.insert(node.clone(), fh.clone());
            cost.insert(node.clone(), d);
        }
    }
    (next_hop, cost)
}

fn pick_min_unvisited(dist: &BTreeMap<String, f64>, visited: &BTreeSet<String>) -> Option<String> {
    let mut best: Option<(&str, f64)> = None;
    for (node, &d) in dist {
        if visited.contains(node) || !d.is_finite() {
            continue;
        }
        match best {
            None => best = Some((node, d)),
            Some((best_node, best_d)) => {
                if d < best_d - EPS || ((d - best_d).abs() <= EPS && node.as_str() < best_node) {
                    best = Some((node, d));
                }
            }
        }
    }
    best.map(|(node, _)| node.to_string())
}

/// Builds the undirected closure of a weighted link map: for every
/// `(u, v, cost)` edge recorded by either endpoint, both directions end up
/// present, using the lower of the two costs if they disagree.
pub fn undirected_closure(links: &BTreeMap<String, BTreeMap<String, f64>>) -> Graph {
    let mut graph: Graph = Graph::new();
    for (u, neighbors) in links {
        for (v, &cost) in neighbors {
            insert_min(&mut graph, u, v, cost);
            insert_min(&mut graph, v, u, cost);
        }
    }
    graph
}

fn insert_min(graph: &mut Graph, from: &str, to: &str, cost: f64) {
    let entry = graph.entry(from.to_string()).or_default();
    match entry.get(to) {
        Some(&existing) if existing <= cost => {}
        _ => {
            entry.insert(to.to_string(), cost);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_from(edges: &[(&str, &str, f64)]) -> Graph {
        let mut links: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        for &(a, b, cost) in edges {
            links.entry(a.to_string()).or_default().insert(b.to_string(), cost);
        }
        undirected_closure(&links)
    }

    #[test]
    fn simple_line_topology() {
        let graph = graph_from(&[("A", "B", 1.0), ("B", "C", 1.0)]);
        let (next_hop, cost) = dijkstra(&graph, "A");
        assert_eq!(next_hop["B"], "B");
        assert_eq!(next_hop["C"], "B");
        assert_eq!(cost["C"], 2.0);
    }

    #[test]
    fn tie_break_prefers_lower_next_hop() {
        // A-B-D and A-C-D both cost 2; B < C so the tie picks B.
        let graph = graph_from(&[
            ("A", "B", 1.0),
            ("A", "C", 1.0),
            ("B", "D", 1.0),
            ("C", "D", 1.0),
        ]);
        let (next_hop, _) = dijkstra(&graph, "A");
        assert_eq!(next_hop["D"], "B");
    }

    #[test]
    fn unreachable_node_is_absent() {
        let graph = graph_from(&[("A", "B", 1.0)]);
        let (next_hop, cost) = dijkstra(&graph, "A");
        assert!(!next_hop.contains_key("Z"));
        assert!(!cost.contains_key("Z"));
    }

    #[test]
    fn undirected_closure_keeps_min_cost_on_conflict() {
        let mut links: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        links.entry("A".to_string()).or_default().insert("B".to_string(), 5.0);
        links.entry("B".to_string()).or_default().insert("A".to_string(), 2.0);
        let graph = undirected_closure(&links);
        assert_eq!(graph["A"]["B"], 2.0);
        assert_eq!(graph["B"]["A"], 2.0);
    }
}
