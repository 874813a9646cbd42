//! Dependency graph resolution for sibling units.
//!
//! Pure functions for ordering a set of sibling templates by their declared
//! data flow: a node consuming a name some sibling produces must run after
//! that sibling. Names no sibling produces are resolved externally (from
//! the parent's scope) and draw no edge.
//!
//! The resolver is generic over node names, so the same machinery orders
//! sub-installations (by import/export name matching) and deploy items
//! (by explicit `depends_on` declarations).

use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Errors that can occur in graph construction or ordering.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// Two nodes share a name.
    #[error("duplicate node name {0:?}")]
    DuplicateNode(String),

    /// The declared dependencies form a cycle. Permanent configuration
    /// error; reported on the owning unit and never retried.
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

/// One sibling template, described by the names it consumes and produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub name: String,
    pub consumes: BTreeSet<String>,
    pub produces: BTreeSet<String>,
}

impl GraphNode {
    pub fn new<I, J, S, U>(name: impl Into<String>, consumes: I, produces: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = U>,
        S: Into<String>,
        U: Into<String>,
    {
        GraphNode {
            name: name.into(),
            consumes: consumes.into_iter().map(Into::into).collect(),
            produces: produces.into_iter().map(Into::into).collect(),
        }
    }
}

/// A dependency graph over sibling nodes.
///
/// Edges run consumer -> producer on declared name matches. All iteration
/// is over sorted structures, so ordering and cycle reports are
/// deterministic for a given input.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Node name -> names of the producers it depends on.
    prerequisites: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Builds the graph from sibling nodes.
    pub fn new(nodes: &[GraphNode]) -> Result<Self, GraphError> {
        let mut producers_of: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        let mut prerequisites: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for node in nodes {
            if prerequisites
                .insert(node.name.clone(), BTreeSet::new())
                .is_some()
            {
                return Err(GraphError::DuplicateNode(node.name.clone()));
            }
            for produced in &node.produces {
                producers_of
                    .entry(produced.as_str())
                    .or_default()
                    .insert(node.name.as_str());
            }
        }

        for node in nodes {
            for consumed in &node.consumes {
                // No producing sibling: resolved externally, not an edge.
                let Some(producers) = producers_of.get(consumed.as_str()) else {
                    continue;
                };
                let entry = prerequisites
                    .get_mut(&node.name)
                    .expect("node inserted above");
                for producer in producers {
                    entry.insert((*producer).to_string());
                }
            }
        }

        Ok(DependencyGraph { prerequisites })
    }

    /// Returns the number of nodes.
    pub fn len(&self) -> usize {
        self.prerequisites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prerequisites.is_empty()
    }

    /// Returns the producers a node waits on.
    pub fn prerequisites_of(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.prerequisites.get(name)
    }

    /// Computes a linear extension consistent with every consumer->producer
    /// edge, or reports a cycle.
    ///
    /// Uses depth-first search with three-color marking; a back edge to a
    /// gray node indicates a cycle, which is extracted from the DFS path.
    pub fn order(&self) -> Result<Vec<String>, GraphError> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        fn visit(
            node: &str,
            prerequisites: &BTreeMap<String, BTreeSet<String>>,
            colors: &mut BTreeMap<String, Color>,
            path: &mut Vec<String>,
            out: &mut Vec<String>,
        ) -> Result<(), GraphError> {
            colors.insert(node.to_string(), Color::Gray);
            path.push(node.to_string());

            if let Some(prereqs) = prerequisites.get(node) {
                for prereq in prereqs {
                    match colors.get(prereq.as_str()) {
                        Some(Color::Gray) => {
                            // Found a cycle; extract it from the path.
                            let pos = path
                                .iter()
                                .position(|p| p == prereq)
                                .unwrap_or(0);
                            let mut cycle: Vec<String> = path[pos..].to_vec();
                            cycle.push(prereq.clone());
                            return Err(GraphError::Cycle(cycle));
                        }
                        Some(Color::White) => {
                            visit(prereq, prerequisites, colors, path, out)?;
                        }
                        Some(Color::Black) | None => {}
                    }
                }
            }

            path.pop();
            colors.insert(node.to_string(), Color::Black);
            out.push(node.to_string());
            Ok(())
        }

        let mut colors: BTreeMap<String, Color> = self
            .prerequisites
            .keys()
            .map(|name| (name.clone(), Color::White))
            .collect();
        let mut out = Vec::with_capacity(self.prerequisites.len());

        for name in self.prerequisites.keys() {
            if colors.get(name.as_str()) == Some(&Color::White) {
                let mut path = Vec::new();
                visit(name, &self.prerequisites, &mut colors, &mut path, &mut out)?;
            }
        }

        // Prerequisites are visited before their consumers, so the postorder
        // is already a valid execution order.
        Ok(out)
    }

    /// Returns the nodes whose producers have all completed, excluding nodes
    /// already completed themselves.
    ///
    /// Ties (multiple nodes ready simultaneously) are returned together and
    /// triggered concurrently by the caller. Re-query once per completion
    /// event rather than precomputing a static schedule.
    pub fn ready(&self, completed: &BTreeSet<String>) -> Vec<String> {
        self.prerequisites
            .iter()
            .filter(|(name, _)| !completed.contains(name.as_str()))
            .filter(|(_, prereqs)| prereqs.iter().all(|p| completed.contains(p.as_str())))
            .map(|(name, _)| name.clone())
            .collect()
    }
}
