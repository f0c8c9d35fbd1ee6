//! Service Topology — dependency graph for topology-aware root cause analysis
//!
//! Loads service dependency relationships from a declarative TOML file and
//! answers upstream/downstream queries. Reverse edges are derived in a
//! second pass; traversal carries a visited set so accidental cycles in the
//! declared topology never loop.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("failed to read topology file {0}: {1}")]
    Io(String, #[source] std::io::Error),

    #[error("failed to parse topology file {0}: {1}")]
    Parse(String, #[source] toml::de::Error),
}

/// Criticality tier of a service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Criticality {
    /// Scoring weight used by the blast-radius calculator.
    pub fn score(&self) -> f64 {
        match self {
            Criticality::Low => 0.3,
            Criticality::Medium => 0.5,
            Criticality::High => 0.7,
            Criticality::Critical => 0.9,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Criticality::Low => "low",
            Criticality::Medium => "medium",
            Criticality::High => "high",
            Criticality::Critical => "critical",
        }
    }
}

/// One node in the topology graph. `depended_by` is derived, never declared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDependency {
    pub service: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_deserializing)]
    pub depended_by: Vec<String>,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub criticality: Criticality,
}

/// Declarative topology file shape: `[[services]]` entries.
#[derive(Debug, Deserialize)]
struct TopologyFile {
    #[serde(default)]
    services: Vec<ServiceDependency>,
}

/// Service dependency graph.
///
/// Stored as two index-keyed adjacency lists (`depends_on`, `depended_by`);
/// no shared-ownership cycle exists, reverse edges are derived.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<String, ServiceDependency>,
}

impl DependencyGraph {
    /// Load from a TOML file. A missing file yields an empty graph with a
    /// warning — topology awareness is an enhancement, not a requirement.
    pub fn load(path: &Path) -> Result<Self, TopologyError> {
        if !path.exists() {
            warn!(
                path = %path.display(),
                "topology file not found, using empty dependency graph"
            );
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| TopologyError::Io(path.display().to_string(), e))?;
        let file: TopologyFile = toml::from_str(&contents)
            .map_err(|e| TopologyError::Parse(path.display().to_string(), e))?;

        let graph = Self::from_services(file.services);
        info!(services = graph.nodes.len(), "loaded service topology");
        Ok(graph)
    }

    /// Two-pass construction: first create nodes, second populate reverse
    /// edges.
    pub fn from_services(services: Vec<ServiceDependency>) -> Self {
        let mut nodes: HashMap<String, ServiceDependency> = HashMap::new();
        for mut svc in services {
            svc.depended_by.clear();
            nodes.insert(svc.service.clone(), svc);
        }

        // Second pass: reverse edges. Collect first to satisfy the borrow
        // checker, then apply.
        let edges: Vec<(String, String)> = nodes
            .values()
            .flat_map(|svc| {
                svc.depends_on
                    .iter()
                    .map(|up| (up.clone(), svc.service.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        for (upstream, downstream) in edges {
            if let Some(node) = nodes.get_mut(&upstream) {
                node.depended_by.push(downstream);
            }
        }

        Self { nodes }
    }

    pub fn get(&self, service: &str) -> Option<&ServiceDependency> {
        self.nodes.get(service)
    }

    /// All known service names, in arbitrary order.
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct upstream dependencies of a service.
    pub fn upstream(&self, service: &str) -> Vec<String> {
        self.nodes
            .get(service)
            .map(|n| n.depends_on.clone())
            .unwrap_or_default()
    }

    /// Direct downstream dependents of a service.
    pub fn downstream(&self, service: &str) -> Vec<String> {
        self.nodes
            .get(service)
            .map(|n| n.depended_by.clone())
            .unwrap_or_default()
    }

    /// Whether `candidate` is upstream of `service`, directly or
    /// transitively. DFS with a visited set; cycles terminate.
    pub fn is_upstream_of(&self, candidate: &str, service: &str) -> bool {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = vec![service];

        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(current) {
                for up in &node.depends_on {
                    if up == candidate {
                        return true;
                    }
                    stack.push(up.as_str());
                }
            }
        }
        false
    }

    /// Topology-based confidence boost for a hypothesised cause service
    /// relative to the affected service.
    ///
    /// Direct upstream +0.15, transitive upstream +0.08, downstream −0.05,
    /// same service or unrelated 0.
    pub fn dependency_boost(&self, affected: &str, hypothesised_cause: &str) -> f64 {
        if affected == hypothesised_cause {
            return 0.0;
        }

        if self.upstream(affected).iter().any(|s| s == hypothesised_cause) {
            return 0.15;
        }
        if self.is_upstream_of(hypothesised_cause, affected) {
            return 0.08;
        }
        if self.is_upstream_of(affected, hypothesised_cause) {
            return -0.05;
        }
        0.0
    }

    /// Criticality score for blast-radius weighting. Unknown services score
    /// medium.
    pub fn criticality_score(&self, service: &str) -> f64 {
        self.nodes
            .get(service)
            .map(|n| n.criticality.score())
            .unwrap_or_else(|| Criticality::Medium.score())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(service: &str, depends_on: &[&str], criticality: Criticality) -> ServiceDependency {
        ServiceDependency {
            service: service.to_string(),
            depends_on: depends_on.iter().map(|s| (*s).to_string()).collect(),
            depended_by: Vec::new(),
            tier: None,
            team: None,
            criticality,
        }
    }

    fn sample_graph() -> DependencyGraph {
        // frontend → api → {database, payment}
        // payment → database
        DependencyGraph::from_services(vec![
            node("frontend", &["api"], Criticality::Medium),
            node("api", &["database", "payment"], Criticality::High),
            node("payment", &["database"], Criticality::Critical),
            node("database", &[], Criticality::Critical),
        ])
    }

    #[test]
    fn reverse_edges_are_derived() {
        let g = sample_graph();
        let mut down = g.downstream("database");
        down.sort();
        assert_eq!(down, vec!["api".to_string(), "payment".to_string()]);
        assert_eq!(g.downstream("frontend"), Vec::<String>::new());
    }

    #[test]
    fn transitive_upstream_resolution() {
        let g = sample_graph();
        assert!(g.is_upstream_of("database", "frontend"));
        assert!(g.is_upstream_of("api", "frontend"));
        assert!(!g.is_upstream_of("frontend", "database"));
    }

    #[test]
    fn cycles_terminate() {
        let g = DependencyGraph::from_services(vec![
            node("a", &["b"], Criticality::Medium),
            node("b", &["c"], Criticality::Medium),
            node("c", &["a"], Criticality::Medium),
        ]);
        // Traversal must not loop; "d" is unreachable
        assert!(!g.is_upstream_of("d", "a"));
        assert!(g.is_upstream_of("c", "a"));
        assert!(g.is_upstream_of("a", "a"));
    }

    #[test]
    fn dependency_boost_bands() {
        let g = sample_graph();
        // Same service
        assert!((g.dependency_boost("api", "api")).abs() < f64::EPSILON);
        // Direct upstream of api
        assert!((g.dependency_boost("api", "database") - 0.15).abs() < f64::EPSILON);
        // Transitive upstream of frontend
        assert!((g.dependency_boost("frontend", "database") - 0.08).abs() < f64::EPSILON);
        // Downstream of database
        assert!((g.dependency_boost("database", "api") + 0.05).abs() < f64::EPSILON);
        // Unrelated
        assert!((g.dependency_boost("api", "not-a-service")).abs() < f64::EPSILON);
    }

    #[test]
    fn criticality_scores() {
        let g = sample_graph();
        assert!((g.criticality_score("payment") - 0.9).abs() < f64::EPSILON);
        assert!((g.criticality_score("api") - 0.7).abs() < f64::EPSILON);
        assert!((g.criticality_score("unknown-svc") - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn loads_from_toml() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"
[[services]]
service = "api"
depends_on = ["database"]
tier = "tier-1"
criticality = "high"

[[services]]
service = "database"
criticality = "critical"
"#
        )
        .unwrap();

        let g = DependencyGraph::load(f.path()).unwrap();
        assert_eq!(g.len(), 2);
        assert_eq!(g.upstream("api"), vec!["database".to_string()]);
        assert_eq!(g.downstream("database"), vec!["api".to_string()]);
        assert_eq!(g.get("api").unwrap().tier.as_deref(), Some("tier-1"));
    }

    #[test]
    fn missing_file_yields_empty_graph() {
        let g = DependencyGraph::load(Path::new("/nonexistent/topology.toml")).unwrap();
        assert!(g.is_empty());
    }
}
