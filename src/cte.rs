//! WITH clause resolution: dependency ordering between sibling CTEs and
//! bottom-up resolution of their bodies into the query's scope.

use std::collections::HashMap;

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{LineageError, Result};
use crate::relation::Scope;
use crate::report::Warning;
use crate::resolver::{CyclePolicy, Resolver};
use crate::tree::CteDef;

/// Order in which sibling CTEs must be resolved so every body sees the
/// siblings it references already finished. A CTE referencing itself is not
/// a dependency.
///
/// On a cycle, returns the names of every CTE taking part in one, in
/// declaration order.
pub fn dependency_order(ctes: &[CteDef]) -> std::result::Result<Vec<usize>, Vec<String>> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..ctes.len()).map(|i| graph.add_node(i)).collect();
    let by_name: HashMap<&str, usize> = ctes
        .iter()
        .enumerate()
        .map(|(i, cte)| (cte.name.as_str(), i))
        .collect();

    for (i, cte) in ctes.iter().enumerate() {
        for name in cte.body.table_references() {
            match by_name.get(name.as_str()) {
                Some(&dep) if dep != i => {
                    graph.add_edge(nodes[dep], nodes[i], ());
                }
                _ => {}
            }
        }
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(|node| graph[node]).collect()),
        Err(_) => {
            let mut members: Vec<usize> = tarjan_scc(&graph)
                .into_iter()
                .filter(|component| component.len() > 1)
                .flatten()
                .map(|node| graph[node])
                .collect();
            members.sort_unstable();
            Err(members.into_iter().map(|i| ctes[i].name.clone()).collect())
        }
    }
}

impl<'c> Resolver<'c> {
    /// Resolve the CTEs of one WITH clause into `scope`. Every name is
    /// declared up front so a reference to a sibling that is not finished
    /// yet can never be mistaken for a catalog table.
    pub(crate) fn resolve_ctes(
        &mut self,
        ctes: &[CteDef],
        recursive: bool,
        scope: &mut Scope<'_>,
    ) -> Result<()> {
        if ctes.is_empty() {
            return Ok(());
        }
        for cte in ctes {
            scope.declare_cte(&cte.name);
        }

        let order = match dependency_order(ctes) {
            Ok(order) => order,
            Err(names) => match self.options.on_cte_cycle {
                CyclePolicy::Fail => return Err(LineageError::CteCycle { names }),
                CyclePolicy::Warn => {
                    tracing::warn!(
                        "CTE dependency cycle between {:?}, resolving in declaration order",
                        names
                    );
                    self.warnings.push(Warning::CteCycle { ctes: names });
                    (0..ctes.len()).collect()
                }
            },
        };

        for idx in order {
            let cte = &ctes[idx];
            if !recursive {
                // own name inside a plain WITH body means the outer table
                scope.hide_cte(&cte.name);
            }
            let relation = self.resolve_query(&cte.body, scope)?.renamed(&cte.columns);
            tracing::debug!(cte = %cte.name, columns = relation.columns.len(), "resolved CTE");
            scope.define_cte(&cte.name, relation);
        }
        Ok(())
    }
}
