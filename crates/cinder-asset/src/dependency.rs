//! Dependency edges between assets
//!
//! A flat list of `(dependent, dependency)` pairs. Whenever an asset's
//! reference list is recomputed, all of its edges are replaced at once.
//! Names compare case-insensitively.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub dependent: String,
    pub dependency: String,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    edges: Vec<DependencyEdge>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every edge leaving `dependent` with edges to `dependencies`.
    /// Empty refs are skipped.
    pub fn set_dependencies<I, S>(&mut self, dependent: &str, dependencies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.remove_dependent(dependent);
        for dependency in dependencies {
            let dependency = dependency.into();
            if dependency.trim().is_empty() {
                continue;
            }
            self.edges.push(DependencyEdge {
                dependent: dependent.to_string(),
                dependency,
            });
        }
    }

    /// Drop every edge leaving `dependent`
    pub fn remove_dependent(&mut self, dependent: &str) {
        self.edges
            .retain(|e| !e.dependent.eq_ignore_ascii_case(dependent));
    }

    /// Refs `dependent` points at
    pub fn dependencies_of(&self, dependent: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.dependent.eq_ignore_ascii_case(dependent))
            .map(|e| e.dependency.as_str())
            .collect()
    }

    /// Assets that point at `dependency`
    pub fn dependents_of(&self, dependency: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.dependency.eq_ignore_ascii_case(dependency))
            .map(|e| e.dependent.as_str())
            .collect()
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn clear(&mut self) {
        self.edges.clear();
    }
}
