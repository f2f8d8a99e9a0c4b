//! Entity relationship graph: adjacency over FQNs with join-path search.
//!
//! Built once from the loaded entity documents. Generation uses
//! `find_join_path` to pull additional schemas on demand instead of
//! retrieving the whole store.

use crate::entities::EntitySchema;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{HashMap, HashSet, VecDeque};

/// Join columns attached to a relationship edge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinEdge {
    pub pairs: Vec<(String, String)>,
}

#[derive(Default)]
pub struct EntityGraph {
    graph: DiGraph<String, JoinEdge>,
    nodes: HashMap<String, NodeIndex>,
    /// FQNs backed by a loaded document; anything else referenced by a
    /// relationship is external.
    resolved: HashSet<String>,
}

impl EntityGraph {
    pub fn from_entities(entities: &[EntitySchema]) -> Self {
        let mut graph = Self::default();
        for entity in entities {
            graph.resolved.insert(entity.fqn.clone());
            graph.node(&entity.fqn);
        }
        for entity in entities {
            for relationship in &entity.entity_relationships {
                let pairs = relationship
                    .foreign_keys
                    .iter()
                    .map(|fk| (fk.column.clone(), fk.foreign_column.clone()))
                    .collect::<Vec<_>>();
                graph.edge(&entity.fqn, &relationship.foreign_fqn, JoinEdge { pairs });
            }
            for path in &entity.complete_entity_relationships_graph {
                graph.add_path_string(path);
            }
        }
        graph
    }

    /// Parse one "A -> B -> C" path, adding any missing hops.
    fn add_path_string(&mut self, path: &str) {
        let hops: Vec<&str> = path.split("->").map(str::trim).filter(|h| !h.is_empty()).collect();
        for window in hops.windows(2) {
            self.edge(window[0], window[1], JoinEdge::default());
        }
    }

    fn node(&mut self, fqn: &str) -> NodeIndex {
        if let Some(index) = self.nodes.get(fqn) {
            return *index;
        }
        let index = self.graph.add_node(fqn.to_string());
        self.nodes.insert(fqn.to_string(), index);
        index
    }

    /// Joins are traversable in both directions; edges are stored both
    /// ways, skipping duplicates.
    fn edge(&mut self, from: &str, to: &str, joins: JoinEdge) {
        let from_index = self.node(from);
        let to_index = self.node(to);
        if !self.graph.edges(from_index).any(|e| e.target() == to_index) {
            self.graph.add_edge(from_index, to_index, joins.clone());
        }
        if !self.graph.edges(to_index).any(|e| e.target() == from_index) {
            let reversed = JoinEdge {
                pairs: joins.pairs.iter().map(|(a, b)| (b.clone(), a.clone())).collect(),
            };
            self.graph.add_edge(to_index, from_index, reversed);
        }
    }

    pub fn contains(&self, fqn: &str) -> bool {
        self.nodes.contains_key(fqn)
    }

    /// Whether an FQN is referenced by relationships but has no loaded
    /// document behind it.
    pub fn is_external(&self, fqn: &str) -> bool {
        self.contains(fqn) && !self.resolved.contains(fqn)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Shortest join path between two entities, endpoints included.
    pub fn find_join_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let start = *self.nodes.get(from)?;
        let goal = *self.nodes.get(to)?;
        if start == goal {
            return Some(vec![from.to_string()]);
        }

        // Plain BFS; the graph is small (hundreds of nodes) and all edges
        // cost the same.
        let mut previous: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            for edge in self.graph.edges(current) {
                let next = edge.target();
                if next == start || previous.contains_key(&next) {
                    continue;
                }
                previous.insert(next, current);
                if next == goal {
                    let mut path = vec![self.graph[next].clone()];
                    let mut cursor = next;
                    while let Some(&back) = previous.get(&cursor) {
                        path.push(self.graph[back].clone());
                        cursor = back;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// Path formatted the way entity documents carry it.
    pub fn format_path(path: &[String]) -> String {
        path.join(" -> ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(fqn: &str, relationships: Vec<(&str, &str, &str)>) -> EntitySchema {
        let (schema, entity) = fqn.rsplit_once('.').map(|(prefix, entity)| {
            (prefix.rsplit('.').next().unwrap_or(prefix).to_string(), entity.to_string())
        }).unwrap();
        serde_json::from_value(json!({
            "FQN": fqn,
            "Schema": schema,
            "Entity": entity,
            "Definition": "test entity",
            "EntityRelationships": relationships.iter().map(|(foreign, local_col, foreign_col)| json!({
                "ForeignFQN": foreign,
                "ForeignKeys": [{"Column": local_col, "ForeignColumn": foreign_col}]
            })).collect::<Vec<_>>()
        }))
        .unwrap()
    }

    #[test]
    fn direct_relationship_is_a_two_hop_path() {
        let graph = EntityGraph::from_entities(&[
            entity("db.SalesLT.SalesOrderHeader", vec![("db.SalesLT.Address", "ShipToAddressID", "AddressID")]),
            entity("db.SalesLT.Address", vec![]),
        ]);
        let path = graph
            .find_join_path("db.SalesLT.SalesOrderHeader", "db.SalesLT.Address")
            .unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!(EntityGraph::format_path(&path), "db.SalesLT.SalesOrderHeader -> db.SalesLT.Address");
    }

    #[test]
    fn multi_hop_path_traverses_intermediate_entities() {
        let graph = EntityGraph::from_entities(&[
            entity("db.s.OrderDetail", vec![("db.s.OrderHeader", "OrderID", "OrderID")]),
            entity("db.s.OrderHeader", vec![("db.s.Customer", "CustomerID", "CustomerID")]),
            entity("db.s.Customer", vec![]),
        ]);
        let path = graph.find_join_path("db.s.OrderDetail", "db.s.Customer").unwrap();
        assert_eq!(path, vec!["db.s.OrderDetail", "db.s.OrderHeader", "db.s.Customer"]);
    }

    #[test]
    fn joins_traverse_against_the_foreign_key_direction() {
        let graph = EntityGraph::from_entities(&[
            entity("db.s.Order", vec![("db.s.Customer", "CustomerID", "CustomerID")]),
            entity("db.s.Customer", vec![]),
        ]);
        assert!(graph.find_join_path("db.s.Customer", "db.s.Order").is_some());
    }

    #[test]
    fn unknown_entities_have_no_path() {
        let graph = EntityGraph::from_entities(&[entity("db.s.Order", vec![])]);
        assert!(graph.find_join_path("db.s.Order", "db.s.Missing").is_none());
    }

    #[test]
    fn relationship_targets_without_documents_are_external() {
        let graph = EntityGraph::from_entities(&[
            entity("db.s.Order", vec![("db.other.Ledger", "LedgerID", "ID")]),
        ]);
        assert!(graph.is_external("db.other.Ledger"));
        assert!(!graph.is_external("db.s.Order"));
    }
}
