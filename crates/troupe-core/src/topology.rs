use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::traits::{ModelRegistry, ToolSource};

/// Upper bound on nodes in a single topology.
pub const MAX_NODES: usize = 100;
/// Upper bound on the longest path (in edges) from the entry point.
pub const MAX_DEPTH: usize = 10;

/// What a node is: a worker or one of the two supervisor tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    GlobalSupervisor,
    NodeSupervisor,
    Agent,
}

impl NodeKind {
    pub fn is_supervisor(&self) -> bool {
        matches!(self, NodeKind::GlobalSupervisor | NodeKind::NodeSupervisor)
    }
}

/// How a supervisor orders dispatch among its already-ready children.
/// Edges define data dependency; the strategy never overrides readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordinationStrategy {
    RoundRobin,
    Priority,
    Adaptive,
    Hierarchical,
    #[default]
    Parallel,
    Sequential,
}

/// Model binding and prompt configuration for a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub role: String,
    pub instructions: String,
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_temperature() -> f32 {
    0.7
}

/// A vertex in the topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    pub agent_config: AgentSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordination_strategy: Option<CoordinationStrategy>,
}

impl NodeSpec {
    pub fn strategy(&self) -> CoordinationStrategy {
        self.coordination_strategy.unwrap_or_default()
    }
}

/// A directed edge. `condition_label` doubles as a numeric priority for
/// PRIORITY supervisors (missing parses as 0).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub source: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition_label: Option<String>,
}

impl EdgeSpec {
    pub fn priority(&self) -> i64 {
        self.condition_label
            .as_deref()
            .and_then(|l| l.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// The declarative team topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    pub entry_point: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
}

/// Machine-readable defect class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DefectCode {
    Cycle,
    Unreachable,
    DuplicateId,
    DanglingEdge,
    UnknownModel,
    UnknownTool,
    TooDeep,
    EmptySupervisor,
    NoEntryPoint,
    MultipleEntryPoints,
}

/// One validation defect. `path` locates it (a node id, an edge, or a
/// cycle rendered as `a→b→a`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defect {
    pub code: DefectCode,
    pub path: String,
    pub message: String,
}

/// Every defect found in one pass; validation never short-circuits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<Defect>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn push(&mut self, code: DefectCode, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(Defect {
            code,
            path: path.into(),
            message: message.into(),
        });
    }

    pub fn has(&self, code: DefectCode) -> bool {
        self.errors.iter().any(|d| d.code == code)
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for d in &self.errors {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{:?}[{}]: {}", d.code, d.path, d.message)?;
            first = false;
        }
        Ok(())
    }
}

impl TopologyConfig {
    /// Validate the graph structure plus model/tool references, reporting
    /// every defect found.
    pub fn validate(
        &self,
        models: &dyn ModelRegistry,
        tools: &dyn ToolSource,
    ) -> ValidationReport {
        let mut report = self.validate_structure();

        for node in &self.nodes {
            if node.kind == NodeKind::Agent
                && !models.contains(&node.agent_config.provider, &node.agent_config.model_id)
            {
                report.push(
                    DefectCode::UnknownModel,
                    &node.id,
                    format!(
                        "model {}/{} is not registered",
                        node.agent_config.provider, node.agent_config.model_id
                    ),
                );
            }
            for tool in &node.agent_config.tools {
                if tools.lookup(tool).is_none() {
                    report.push(
                        DefectCode::UnknownTool,
                        &node.id,
                        format!("tool '{tool}' is not registered"),
                    );
                }
            }
        }

        report
    }

    /// Graph-shape rules only (no registry lookups).
    pub fn validate_structure(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        if self.nodes.is_empty() {
            report.push(DefectCode::NoEntryPoint, "", "topology has no nodes");
            return report;
        }
        if self.nodes.len() > MAX_NODES {
            report.push(
                DefectCode::TooDeep,
                "",
                format!("topology has {} nodes, maximum is {MAX_NODES}", self.nodes.len()),
            );
        }

        let mut ids: HashSet<&str> = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                report.push(
                    DefectCode::DuplicateId,
                    &node.id,
                    format!("node id '{}' is defined more than once", node.id),
                );
            }
        }

        // Adjacency over well-formed edges only; bad edges are reported
        // and excluded from the graph checks below.
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for edge in &self.edges {
            let mut dangling = false;
            if !ids.contains(edge.source.as_str()) {
                report.push(
                    DefectCode::DanglingEdge,
                    format!("{}→{}", edge.source, edge.target),
                    format!("edge source '{}' is not a defined node", edge.source),
                );
                dangling = true;
            }
            if !ids.contains(edge.target.as_str()) {
                report.push(
                    DefectCode::DanglingEdge,
                    format!("{}→{}", edge.source, edge.target),
                    format!("edge target '{}' is not a defined node", edge.target),
                );
                dangling = true;
            }
            if !dangling {
                adjacency.entry(edge.source.as_str()).or_default().push(edge.target.as_str());
                *in_degree.entry(edge.target.as_str()).or_default() += 1;
            }
        }

        // Entry point: exactly one in-degree-0 node, matching entry_point,
        // of kind GLOBAL_SUPERVISOR.
        let roots: Vec<&str> = self
            .nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| in_degree.get(id).copied().unwrap_or(0) == 0)
            .collect();
        match roots.len() {
            0 => report.push(
                DefectCode::NoEntryPoint,
                "",
                "no node has in-degree 0; every node has a predecessor",
            ),
            1 => {
                let root = roots[0];
                if root != self.entry_point {
                    report.push(
                        DefectCode::NoEntryPoint,
                        &self.entry_point,
                        format!("entry_point '{}' is not the in-degree-0 node '{root}'", self.entry_point),
                    );
                } else if let Some(node) = self.nodes.iter().find(|n| n.id == root) {
                    if node.kind != NodeKind::GlobalSupervisor {
                        report.push(
                            DefectCode::NoEntryPoint,
                            root,
                            "entry point must be a GLOBAL_SUPERVISOR",
                        );
                    }
                }
            }
            _ => report.push(
                DefectCode::MultipleEntryPoints,
                roots.join(","),
                format!("{} nodes have in-degree 0, expected exactly one", roots.len()),
            ),
        }

        let cycle = detect_cycle(ids.iter().copied(), &adjacency);
        if let Some(path) = &cycle {
            report.push(
                DefectCode::Cycle,
                path.join("→"),
                "topology contains a cycle",
            );
        }

        // Reachability is meaningful even with a cycle; depth and
        // descendant checks need an acyclic graph.
        if ids.contains(self.entry_point.as_str()) {
            let reachable = bfs_reachable(&self.entry_point, &adjacency);
            for node in &self.nodes {
                if !reachable.contains(node.id.as_str()) {
                    report.push(
                        DefectCode::Unreachable,
                        &node.id,
                        format!("node '{}' is not reachable from the entry point", node.id),
                    );
                }
            }

            if cycle.is_none() {
                let depths = longest_depths(&self.entry_point, &adjacency);
                for node in &self.nodes {
                    if depths.get(node.id.as_str()).copied().unwrap_or(0) > MAX_DEPTH {
                        report.push(
                            DefectCode::TooDeep,
                            &node.id,
                            format!("node '{}' is deeper than {MAX_DEPTH} levels", node.id),
                        );
                    }
                }

                for node in &self.nodes {
                    if node.kind == NodeKind::NodeSupervisor
                        && !has_agent_descendant(&node.id, &self.nodes, &adjacency)
                    {
                        report.push(
                            DefectCode::EmptySupervisor,
                            &node.id,
                            format!("supervisor '{}' has no AGENT descendant", node.id),
                        );
                    }
                }
            }
        }

        report
    }

    /// Compile a validated topology into an index-based arena for the
    /// runner. Call only after `validate` passed.
    pub fn compile(&self) -> Result<CompiledGraph, String> {
        let index: HashMap<String, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        if index.len() != self.nodes.len() {
            return Err("duplicate node ids".into());
        }

        let n = self.nodes.len();
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut edge_priority: HashMap<(usize, usize), i64> = HashMap::new();
        for edge in &self.edges {
            let (Some(&s), Some(&t)) = (index.get(&edge.source), index.get(&edge.target)) else {
                return Err(format!("dangling edge {}→{}", edge.source, edge.target));
            };
            successors[s].push(t);
            predecessors[t].push(s);
            edge_priority.insert((s, t), edge.priority());
        }

        let entry = *index
            .get(&self.entry_point)
            .ok_or_else(|| format!("entry point '{}' not defined", self.entry_point))?;

        // Kahn topological order; also yields per-node depth.
        let mut in_deg: Vec<usize> = predecessors.iter().map(|p| p.len()).collect();
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_deg[i] == 0).collect();
        let mut topo_order = Vec::with_capacity(n);
        let mut depth = vec![0usize; n];
        while let Some(i) = queue.pop_front() {
            topo_order.push(i);
            for &succ in &successors[i] {
                depth[succ] = depth[succ].max(depth[i] + 1);
                in_deg[succ] -= 1;
                if in_deg[succ] == 0 {
                    queue.push_back(succ);
                }
            }
        }
        if topo_order.len() != n {
            return Err("topology contains a cycle".into());
        }

        let terminals = topo_order
            .iter()
            .copied()
            .filter(|&i| successors[i].is_empty())
            .collect();

        Ok(CompiledGraph {
            nodes: self.nodes.clone(),
            index,
            successors,
            predecessors,
            edge_priority,
            entry,
            topo_order,
            depth,
            terminals,
        })
    }
}

/// Immutable arena view of a topology snapshot. All runner state is
/// keyed by node index; ids are only materialized at the event boundary.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    pub nodes: Vec<NodeSpec>,
    pub index: HashMap<String, usize>,
    pub successors: Vec<Vec<usize>>,
    pub predecessors: Vec<Vec<usize>>,
    pub edge_priority: HashMap<(usize, usize), i64>,
    pub entry: usize,
    /// Kahn order; stable for aggregation.
    pub topo_order: Vec<usize>,
    /// Longest-path depth from the entry point, in edges.
    pub depth: Vec<usize>,
    /// Out-degree-0 nodes in topological order.
    pub terminals: Vec<usize>,
}

impl CompiledGraph {
    pub fn id(&self, idx: usize) -> &str {
        &self.nodes[idx].id
    }

    pub fn node(&self, idx: usize) -> &NodeSpec {
        &self.nodes[idx]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every node reachable from `from` via forward edges, excluding
    /// `from` itself.
    pub fn descendants(&self, from: usize) -> Vec<usize> {
        let mut seen = vec![false; self.nodes.len()];
        let mut queue = VecDeque::from_iter(self.successors[from].iter().copied());
        let mut out = Vec::new();
        while let Some(i) = queue.pop_front() {
            if seen[i] {
                continue;
            }
            seen[i] = true;
            out.push(i);
            queue.extend(self.successors[i].iter().copied());
        }
        out
    }
}

fn detect_cycle<'a>(
    ids: impl Iterator<Item = &'a str>,
    adjacency: &HashMap<&'a str, Vec<&'a str>>,
) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Grey,
        Black,
    }

    let mut color: HashMap<&str, Color> = ids.map(|id| (id, Color::White)).collect();
    let roots: Vec<&str> = color.keys().copied().collect();

    // Iterative DFS; a back-edge to a grey node closes the cycle and the
    // grey stack segment from that node is the cycle path.
    for root in roots {
        if color[root] != Color::White {
            continue;
        }
        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
        let mut path: Vec<&str> = vec![root];
        color.insert(root, Color::Grey);

        while let Some(&mut (node, ref mut edge_idx)) = stack.last_mut() {
            let next = adjacency.get(node).and_then(|succ| succ.get(*edge_idx)).copied();
            *edge_idx += 1;
            match next {
                Some(succ) => match color[succ] {
                    Color::Grey => {
                        let start = path.iter().position(|&p| p == succ).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|s| s.to_string()).collect();
                        cycle.push(succ.to_string());
                        return Some(cycle);
                    }
                    Color::White => {
                        color.insert(succ, Color::Grey);
                        stack.push((succ, 0));
                        path.push(succ);
                    }
                    Color::Black => {}
                },
                None => {
                    color.insert(node, Color::Black);
                    stack.pop();
                    path.pop();
                }
            }
        }
    }
    None
}

fn bfs_reachable<'a>(entry: &'a str, adjacency: &HashMap<&'a str, Vec<&'a str>>) -> HashSet<&'a str> {
    let mut seen: HashSet<&str> = HashSet::from([entry]);
    let mut queue = VecDeque::from([entry]);
    while let Some(node) = queue.pop_front() {
        for &succ in adjacency.get(node).into_iter().flatten() {
            if seen.insert(succ) {
                queue.push_back(succ);
            }
        }
    }
    seen
}

fn longest_depths<'a>(
    entry: &'a str,
    adjacency: &HashMap<&'a str, Vec<&'a str>>,
) -> HashMap<&'a str, usize> {
    // Relaxation walk from the entry; acyclicity is established before
    // calling, so this terminates.
    let mut depths: HashMap<&str, usize> = HashMap::new();
    depths.insert(entry, 0);
    let mut stack = vec![entry];
    while let Some(node) = stack.pop() {
        let d = depths[node];
        for &succ in adjacency.get(node).into_iter().flatten() {
            let known = depths.get(succ).copied();
            if known.is_none() || known.is_some_and(|best| d + 1 > best) {
                depths.insert(succ, d + 1);
                stack.push(succ);
            }
        }
    }
    depths
}

fn has_agent_descendant(
    id: &str,
    nodes: &[NodeSpec],
    adjacency: &HashMap<&str, Vec<&str>>,
) -> bool {
    let kind_of: HashMap<&str, NodeKind> =
        nodes.iter().map(|n| (n.id.as_str(), n.kind)).collect();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> =
        adjacency.get(id).into_iter().flatten().copied().collect();
    while let Some(node) = queue.pop_front() {
        if !seen.insert(node) {
            continue;
        }
        if kind_of.get(node) == Some(&NodeKind::Agent) {
            return true;
        }
        queue.extend(adjacency.get(node).into_iter().flatten().copied());
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::tests_support::{EmptyTools, NoModels};

    fn node(id: &str, kind: NodeKind) -> NodeSpec {
        NodeSpec {
            id: id.into(),
            name: id.to_uppercase(),
            kind,
            agent_config: AgentSpec {
                role: "worker".into(),
                instructions: "do the task".into(),
                provider: "mock".into(),
                model_id: "m1".into(),
                tools: vec![],
                temperature: 0.7,
                max_tokens: None,
            },
            coordination_strategy: None,
        }
    }

    fn edge(source: &str, target: &str) -> EdgeSpec {
        EdgeSpec {
            source: source.into(),
            target: target.into(),
            condition_label: None,
        }
    }

    fn linear() -> TopologyConfig {
        TopologyConfig {
            nodes: vec![
                node("g", NodeKind::GlobalSupervisor),
                node("a1", NodeKind::Agent),
                node("a2", NodeKind::Agent),
            ],
            edges: vec![edge("g", "a1"), edge("a1", "a2")],
            entry_point: "g".into(),
            output_schema: None,
        }
    }

    #[test]
    fn valid_linear_topology() {
        let report = linear().validate_structure();
        assert!(report.is_ok(), "unexpected defects: {report}");
    }

    #[test]
    fn empty_topology_rejected() {
        let topo = TopologyConfig {
            nodes: vec![],
            edges: vec![],
            entry_point: "g".into(),
            output_schema: None,
        };
        let report = topo.validate_structure();
        assert!(report.has(DefectCode::NoEntryPoint));
    }

    #[test]
    fn duplicate_ids_reported() {
        let mut topo = linear();
        topo.nodes.push(node("a1", NodeKind::Agent));
        let report = topo.validate_structure();
        assert!(report.has(DefectCode::DuplicateId));
    }

    #[test]
    fn dangling_edge_reported() {
        let mut topo = linear();
        topo.edges.push(edge("a2", "ghost"));
        let report = topo.validate_structure();
        assert!(report.has(DefectCode::DanglingEdge));
    }

    #[test]
    fn cycle_reported_with_path() {
        let mut topo = linear();
        topo.edges.push(edge("a2", "a1"));
        let report = topo.validate_structure();
        let defect = report
            .errors
            .iter()
            .find(|d| d.code == DefectCode::Cycle)
            .expect("cycle defect");
        // Path renders the closed walk, e.g. a1→a2→a1.
        assert!(defect.path.contains('→'));
        let first = defect.path.split('→').next().unwrap();
        assert!(defect.path.ends_with(first));
    }

    #[test]
    fn unreachable_node_reported() {
        let mut topo = linear();
        topo.nodes.push(node("island-sup", NodeKind::GlobalSupervisor));
        topo.nodes.push(node("island", NodeKind::Agent));
        topo.edges.push(edge("island-sup", "island"));
        let report = topo.validate_structure();
        assert!(report.has(DefectCode::Unreachable));
        assert!(report.has(DefectCode::MultipleEntryPoints));
    }

    #[test]
    fn entry_must_be_global_supervisor() {
        let mut topo = linear();
        topo.nodes[0].kind = NodeKind::Agent;
        let report = topo.validate_structure();
        assert!(report.has(DefectCode::NoEntryPoint));
    }

    #[test]
    fn entry_point_mismatch_reported() {
        let mut topo = linear();
        topo.entry_point = "a1".into();
        let report = topo.validate_structure();
        assert!(report.has(DefectCode::NoEntryPoint));
    }

    #[test]
    fn too_deep_reported() {
        let mut nodes = vec![node("g", NodeKind::GlobalSupervisor)];
        let mut edges = Vec::new();
        let mut prev = "g".to_string();
        for i in 0..11 {
            let id = format!("n{i}");
            nodes.push(node(&id, NodeKind::Agent));
            edges.push(edge(&prev, &id));
            prev = id;
        }
        let topo = TopologyConfig {
            nodes,
            edges,
            entry_point: "g".into(),
            output_schema: None,
        };
        let report = topo.validate_structure();
        assert!(report.has(DefectCode::TooDeep));
    }

    #[test]
    fn node_supervisor_without_agents_reported() {
        let mut topo = linear();
        topo.nodes.push(node("sup", NodeKind::NodeSupervisor));
        topo.edges.push(edge("a2", "sup"));
        let report = topo.validate_structure();
        assert!(report.has(DefectCode::EmptySupervisor));
    }

    #[test]
    fn unknown_model_and_tool_reported() {
        let mut topo = linear();
        topo.nodes[1].agent_config.tools.push("ghost_tool".into());
        let report = topo.validate(&NoModels, &EmptyTools);
        assert!(report.has(DefectCode::UnknownModel));
        assert!(report.has(DefectCode::UnknownTool));
        // All defects in a single pass: two agents with unknown models
        // plus one unknown tool.
        assert_eq!(report.errors.len(), 3);
    }

    #[test]
    fn compile_builds_arena() {
        let graph = linear().compile().unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.entry, graph.index["g"]);
        assert_eq!(graph.depth[graph.index["a2"]], 2);
        assert_eq!(graph.terminals, vec![graph.index["a2"]]);
        assert_eq!(
            graph.descendants(graph.index["g"]).len(),
            2,
            "both agents hang off the supervisor"
        );
        assert_eq!(graph.topo_order[0], graph.index["g"]);
    }

    #[test]
    fn edge_priority_parsing() {
        let mut e = edge("a", "b");
        assert_eq!(e.priority(), 0);
        e.condition_label = Some("7".into());
        assert_eq!(e.priority(), 7);
        e.condition_label = Some("on_success".into());
        assert_eq!(e.priority(), 0);
    }
}
