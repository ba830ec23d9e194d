//! Builds a dependency DAG from each process's `depends_on` edges and produces a
//! deterministic startup order: detects cycles, then topologically sorts with
//! alphabetical tie-breaking within the same depth so the order is reproducible
//! across runs (decided in favor of declaration order, which is not stable once
//! a config is re-serialized).

use std::collections::HashMap;

use thiserror::Error;

use crate::config::ProcessConfig;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DependencyGraphError {
    #[error("dependency cycle detected involving process `{0}`")]
    Cycle(String),
}

pub struct DependencyGraph {
    edges: HashMap<String, Vec<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl DependencyGraph {
    pub fn build(processes: &HashMap<String, ProcessConfig>) -> Self {
        let mut edges = HashMap::new();
        for (name, config) in processes {
            edges.insert(name.clone(), config.depends_on.clone());
        }
        Self { edges }
    }

    /// Deterministic topological order: among processes whose dependencies are
    /// all already placed, the alphabetically earliest name goes next.
    pub fn topo_order(&self) -> Result<Vec<String>, DependencyGraphError> {
        let mut marks: HashMap<&str, Mark> =
            self.edges.keys().map(|k| (k.as_str(), Mark::Unvisited)).collect();
        let mut order = Vec::with_capacity(self.edges.len());

        let mut names: Vec<&str> = self.edges.keys().map(String::as_str).collect();
        names.sort_unstable();

        for name in names {
            self.visit(name, &mut marks, &mut order)?;
        }
        Ok(order)
    }

    fn visit<'a>(
        &'a self,
        name: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        order: &mut Vec<String>,
    ) -> Result<(), DependencyGraphError> {
        match marks.get(name).copied().unwrap_or(Mark::Done) {
            Mark::Done => return Ok(()),
            Mark::InProgress => return Err(DependencyGraphError::Cycle(name.to_string())),
            Mark::Unvisited => {}
        }

        marks.insert(name, Mark::InProgress);

        let mut deps: Vec<&str> = self
            .edges
            .get(name)
            .map(|d| d.iter().map(String::as_str).collect())
            .unwrap_or_default();
        deps.sort_unstable();

        for dep in deps {
            self.visit(dep, marks, order)?;
        }

        marks.insert(name, Mark::Done);
        order.push(name.to_string());
        Ok(())
    }

    /// The reverse of `topo_order`, used for shutdown: dependents stop before
    /// their dependencies.
    pub fn shutdown_order(&self) -> Result<Vec<String>, DependencyGraphError> {
        let mut order = self.topo_order()?;
        order.reverse();
        Ok(order)
    }

    pub fn direct_dependencies(&self, name: &str) -> Vec<String> {
        self.edges.get(name).cloned().unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.edges.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InitialState, ProcessType, RestartMode, ShutdownConfig};

    fn process(name: &str, depends_on: Vec<&str>) -> ProcessConfig {
        ProcessConfig {
            name: name.to_string(),
            command: vec!["true".to_string()],
            env: HashMap::new(),
            working_dir: None,
            enabled: true,
            initial_state: InitialState::Running,
            process_type: ProcessType::Longrun,
            scale: 1,
            max_scale: 0,
            scale_locked: false,
            port_base: 0,
            depends_on: depends_on.into_iter().map(String::from).collect(),
            restart: RestartMode::Never,
            restart_max_attempts: 0,
            restart_initial_backoff_secs: 1,
            restart_max_backoff_secs: 5,
            shutdown: ShutdownConfig::default(),
            health_check: None,
            schedule: None,
            max_memory_mb: 0,
        }
    }

    #[test]
    fn orders_dependencies_before_dependents() {
        let mut processes = HashMap::new();
        processes.insert("app".to_string(), process("app", vec!["db"]));
        processes.insert("db".to_string(), process("db", vec![]));
        let graph = DependencyGraph::build(&processes);

        let order = graph.topo_order().unwrap();
        assert_eq!(order, vec!["db".to_string(), "app".to_string()]);
    }

    #[test]
    fn ties_break_alphabetically() {
        let mut processes = HashMap::new();
        processes.insert("web".to_string(), process("web", vec![]));
        processes.insert("api".to_string(), process("api", vec![]));
        processes.insert("cache".to_string(), process("cache", vec![]));
        let graph = DependencyGraph::build(&processes);

        assert_eq!(
            graph.topo_order().unwrap(),
            vec!["api".to_string(), "cache".to_string(), "web".to_string()]
        );
    }

    #[test]
    fn detects_cycles() {
        let mut processes = HashMap::new();
        processes.insert("a".to_string(), process("a", vec!["b"]));
        processes.insert("b".to_string(), process("b", vec!["a"]));
        let graph = DependencyGraph::build(&processes);

        assert!(matches!(graph.topo_order(), Err(DependencyGraphError::Cycle(_))));
    }

    #[test]
    fn shutdown_order_is_reverse_of_startup_order() {
        let mut processes = HashMap::new();
        processes.insert("app".to_string(), process("app", vec!["db"]));
        processes.insert("db".to_string(), process("db", vec![]));
        let graph = DependencyGraph::build(&processes);

        assert_eq!(
            graph.shutdown_order().unwrap(),
            vec!["app".to_string(), "db".to_string()]
        );
    }
}
