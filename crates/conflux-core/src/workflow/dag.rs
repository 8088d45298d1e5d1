//! Dependency graph analysis: cycle detection, execution waves, and the ready set.
//!
//! Uses `petgraph` to model step dependencies as a directed graph. Strongly
//! connected components locate cycles; depth-based grouping produces the
//! parallel execution waves shown by `cflx validate`. The ready set is
//! computed from the live instance projection on every scheduling pass.

use std::collections::{HashMap, HashSet, VecDeque};

use conflux_types::instance::{StepStatus, WorkflowInstance};
use conflux_types::workflow::{Dependency, DependencyMode, StepDefinition, WorkflowDefinition};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

/// Graph with an edge from each step to each of its dependencies.
///
/// Unknown dependency names are ignored; validation reports them separately.
fn dependency_graph(steps: &[StepDefinition]) -> (DiGraph<&str, ()>, Vec<NodeIndex>) {
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: Vec<_> = steps.iter().map(|s| graph.add_node(s.name.as_str())).collect();
    let index: HashMap<&str, NodeIndex> = steps
        .iter()
        .zip(&nodes)
        .map(|(s, n)| (s.name.as_str(), *n))
        .collect();

    for (step, node) in steps.iter().zip(&nodes) {
        for dep in &step.depends_on {
            if let Some(target) = index.get(dep.step.as_str()) {
                graph.add_edge(*node, *target, ());
            }
        }
    }
    (graph, nodes)
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

/// Find one dependency cycle, if any.
///
/// The returned path starts and ends on the same step and follows
/// `depends_on` edges, e.g. `["a", "b", "a"]` when `a` depends on `b` and
/// `b` depends on `a`. The earliest-declared step of the cycle comes first.
pub fn find_cycle(steps: &[StepDefinition]) -> Option<Vec<String>> {
    let (graph, _) = dependency_graph(steps);

    let mut cyclic: Vec<Vec<NodeIndex>> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .collect();
    for scc in &mut cyclic {
        scc.sort();
    }
    cyclic.sort();
    let scc = cyclic.into_iter().next()?;

    let start = scc[0];
    if graph.contains_edge(start, start) {
        let name = graph[start].to_string();
        return Some(vec![name.clone(), name]);
    }

    // Shortest path start -> ... -> start inside the component.
    let members: HashSet<NodeIndex> = scc.iter().copied().collect();
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    while let Some(node) = queue.pop_front() {
        let mut next: Vec<NodeIndex> = graph
            .neighbors(node)
            .filter(|n| members.contains(n))
            .collect();
        next.sort();
        for n in next {
            if n == start {
                let mut chain = vec![node];
                let mut cursor = node;
                while cursor != start {
                    match parent.get(&cursor) {
                        Some(p) => cursor = *p,
                        None => break,
                    }
                    chain.push(cursor);
                }
                chain.reverse();
                chain.push(start);
                return Some(chain.into_iter().map(|n| graph[n].to_string()).collect());
            }
            if n != start && !parent.contains_key(&n) {
                parent.insert(n, node);
                queue.push_back(n);
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Execution waves
// ---------------------------------------------------------------------------

/// Group steps into waves: every step's dependencies live in earlier waves.
///
/// Returns `None` if the graph is cyclic.
pub fn execution_waves(steps: &[StepDefinition]) -> Option<Vec<Vec<&StepDefinition>>> {
    if steps.is_empty() {
        return Some(vec![]);
    }
    let (graph, nodes) = dependency_graph(steps);
    // Edges point at dependencies, so reverse topological order runs roots first.
    let mut sorted = toposort(&graph, None).ok()?;
    sorted.reverse();

    let position: HashMap<NodeIndex, usize> =
        nodes.iter().enumerate().map(|(i, n)| (*n, i)).collect();
    let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
    for node in &sorted {
        let d = graph
            .neighbors(*node)
            .map(|dep| depth.get(&dep).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depth.insert(*node, d);
    }

    let max_depth = depth.values().copied().max().unwrap_or(0);
    let mut waves: Vec<Vec<&StepDefinition>> = vec![vec![]; max_depth + 1];
    for node in &nodes {
        waves[depth[node]].push(&steps[position[node]]);
    }
    Some(waves)
}

// ---------------------------------------------------------------------------
// Ready set
// ---------------------------------------------------------------------------

/// Outcome of evaluating the dependency edges of pending steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Pending steps whose every edge is satisfied, in declaration order.
    pub ready: Vec<String>,
    /// Pending steps with an edge that can never be satisfied, with a reason.
    pub blocked: Vec<(String, String)>,
}

enum Edge {
    Satisfied,
    Waiting,
    Blocked(String),
}

fn edge_state(dep: &Dependency, upstream: StepStatus) -> Edge {
    match (upstream, dep.require) {
        (StepStatus::Succeeded, _) => Edge::Satisfied,
        (StepStatus::Notified | StepStatus::Skipped, DependencyMode::Completion) => {
            Edge::Satisfied
        }
        (StepStatus::Notified | StepStatus::Skipped, DependencyMode::Success) => Edge::Blocked(
            format!("'{}' did not succeed and the edge requires success", dep.step),
        ),
        (StepStatus::Compensated, _) => {
            Edge::Blocked(format!("'{}' failed and was compensated", dep.step))
        }
        (StepStatus::Aborted, _) => Edge::Blocked(format!("'{}' was aborted", dep.step)),
        _ => Edge::Waiting,
    }
}

/// Compute the ready set for an instance.
///
/// A step is ready when it is still `Pending` and every `depends_on` edge is
/// satisfied. `completion` edges accept a succeeded, notified or skipped
/// upstream; `success` edges accept only a succeeded one. A compensated or
/// aborted upstream blocks every edge.
pub fn ready_steps(def: &WorkflowDefinition, instance: &WorkflowInstance) -> Readiness {
    let mut readiness = Readiness::default();
    for step in &def.steps {
        if instance.step_status(&step.name) != StepStatus::Pending {
            continue;
        }
        let mut all_satisfied = true;
        let mut blocked = None;
        for dep in &step.depends_on {
            match edge_state(dep, instance.step_status(&dep.step)) {
                Edge::Satisfied => {}
                Edge::Waiting => all_satisfied = false,
                Edge::Blocked(reason) => {
                    blocked = Some(reason);
                    break;
                }
            }
        }
        if let Some(reason) = blocked {
            readiness.blocked.push((step.name.clone(), reason));
        } else if all_satisfied {
            readiness.ready.push(step.name.clone());
        }
    }
    readiness
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conflux_types::instance::{InstanceState, StepState};
    use conflux_types::workflow::{DefinitionRef, RemoteCallSpec, RetryPolicy, StepKind};
    use serde_json::{Map, json};
    use std::collections::{BTreeMap, HashMap};
    use uuid::Uuid;

    fn step(name: &str, deps: Vec<Dependency>) -> StepDefinition {
        StepDefinition {
            name: name.to_string(),
            kind: StepKind::RemoteCall(RemoteCallSpec {
                target: "svc".to_string(),
                method: "POST".to_string(),
                path: "/".to_string(),
                input: json!(null),
                extract: None,
            }),
            depends_on: deps,
            retry: RetryPolicy::default(),
            timeout_secs: None,
        }
    }

    fn on(names: &[&str]) -> Vec<Dependency> {
        names.iter().map(|n| Dependency::on(*n)).collect()
    }

    fn instance(statuses: &[(&str, StepStatus)]) -> WorkflowInstance {
        WorkflowInstance {
            id: Uuid::now_v7(),
            definition: DefinitionRef {
                id: "t".to_string(),
                version: 1,
            },
            correlation_id: "c".to_string(),
            context: Map::new(),
            state: InstanceState::Running,
            steps: statuses
                .iter()
                .map(|(n, s)| {
                    (
                        n.to_string(),
                        StepState {
                            status: *s,
                            ..StepState::default()
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>(),
            executions: vec![],
            cancel_requested: false,
            originating_step: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
            last_seq: 0,
        }
    }

    fn definition(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "t".to_string(),
            version: 1,
            description: None,
            steps,
            error_handlers: vec![],
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn no_cycle_in_diamond() {
        let steps = vec![
            step("start", vec![]),
            step("a", on(&["start"])),
            step("b", on(&["start"])),
            step("join", on(&["a", "b"])),
        ];
        assert_eq!(find_cycle(&steps), None);
    }

    #[test]
    fn finds_three_step_cycle_in_dependency_order() {
        let steps = vec![
            step("root", vec![]),
            step("a", on(&["root", "c"])),
            step("b", on(&["a"])),
            step("c", on(&["b"])),
        ];
        // a depends on c, c on b, b on a
        assert_eq!(find_cycle(&steps).unwrap(), vec!["a", "c", "b", "a"]);
    }

    #[test]
    fn finds_self_loop() {
        let steps = vec![step("a", on(&["a"]))];
        assert_eq!(find_cycle(&steps).unwrap(), vec!["a", "a"]);
    }

    #[test]
    fn waves_follow_depth() {
        let steps = vec![
            step("start", vec![]),
            step("a", on(&["start"])),
            step("b", on(&["start"])),
            step("c", on(&["start"])),
            step("join", on(&["a", "b", "c"])),
        ];
        let waves = execution_waves(&steps).unwrap();
        let names: Vec<Vec<&str>> = waves
            .iter()
            .map(|w| w.iter().map(|s| s.name.as_str()).collect())
            .collect();
        assert_eq!(names, vec![vec!["start"], vec!["a", "b", "c"], vec!["join"]]);

        let cyclic = vec![step("x", on(&["y"])), step("y", on(&["x"]))];
        assert!(execution_waves(&cyclic).is_none());
    }

    #[test]
    fn ready_set_waits_for_all_dependencies() {
        let def = definition(vec![
            step("start", vec![]),
            step("a", on(&["start"])),
            step("b", on(&["start"])),
            step("join", on(&["a", "b"])),
        ]);

        let fresh = instance(&[]);
        assert_eq!(ready_steps(&def, &fresh).ready, vec!["start"]);

        let mid = instance(&[
            ("start", StepStatus::Succeeded),
            ("a", StepStatus::Succeeded),
            ("b", StepStatus::Running),
        ]);
        let r = ready_steps(&def, &mid);
        assert!(r.ready.is_empty());
        assert!(r.blocked.is_empty());

        let done = instance(&[
            ("start", StepStatus::Succeeded),
            ("a", StepStatus::Succeeded),
            ("b", StepStatus::Succeeded),
        ]);
        assert_eq!(ready_steps(&def, &done).ready, vec!["join"]);
    }

    #[test]
    fn completion_edges_accept_notified_success_edges_do_not() {
        let def = definition(vec![
            step("c", vec![]),
            step("lenient", on(&["c"])),
            step("strict", vec![Dependency::requiring_success("c")]),
        ]);
        let inst = instance(&[("c", StepStatus::Notified)]);
        let r = ready_steps(&def, &inst);
        assert_eq!(r.ready, vec!["lenient"]);
        assert_eq!(r.blocked.len(), 1);
        assert_eq!(r.blocked[0].0, "strict");
    }

    #[test]
    fn compensated_and_failed_upstreams() {
        let def = definition(vec![step("c", vec![]), step("next", on(&["c"]))]);

        let compensated = instance(&[("c", StepStatus::Compensated)]);
        let r = ready_steps(&def, &compensated);
        assert!(r.ready.is_empty());
        assert_eq!(r.blocked[0].0, "next");

        // Failed without a resolved handler: neither ready nor blocked yet.
        let failed = instance(&[("c", StepStatus::Failed)]);
        assert_eq!(ready_steps(&def, &failed), Readiness::default());
    }
}
