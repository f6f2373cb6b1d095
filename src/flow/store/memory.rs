// SPDX-License-Identifier: MIT

//! In-process graph store

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{GraphStore, Node, Props, RelQuery, Relationship, NODE_ID};
use crate::adk::error::StoreError;

#[derive(Debug, Clone)]
struct Edge {
    src: String,
    rel_type: String,
    dst: String,
}

#[derive(Debug, Default)]
struct Graph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

impl Graph {
    fn find(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    fn find_labeled(&self, label: &str, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.label == label && n.id() == id)
    }

    fn is_start(&self, node: &Node, query: &RelQuery) -> bool {
        query.src_label.as_deref().map_or(true, |l| node.label == l)
            && node.matches(&query.src_props)
    }

    fn type_allowed(query: &RelQuery, rel_type: &str) -> bool {
        query.rel_types.is_empty() || query.rel_types.iter().any(|t| t == rel_type)
    }

    /// Depth-first path enumeration. A path never reuses an edge.
    fn walk(&self, query: &RelQuery, current: &str, path: &mut Vec<usize>, hits: &mut Vec<usize>) {
        let depth = path.len();
        if depth > 0 && query.hop.contains(depth) {
            let ends_on_target = self
                .find(current)
                .is_some_and(|end| end.matches(&query.target_props));
            if ends_on_target {
                for idx in path.iter() {
                    if !hits.contains(idx) {
                        hits.push(*idx);
                    }
                }
            }
        }

        let max = query.hop.max().unwrap_or(self.edges.len());
        if depth >= max {
            return;
        }

        for (idx, edge) in self.edges.iter().enumerate() {
            if edge.src != current || path.contains(&idx) || !Self::type_allowed(query, &edge.rel_type) {
                continue;
            }
            path.push(idx);
            self.walk(query, &edge.dst, path, hits);
            path.pop();
        }
    }
}

/// Graph store held entirely in memory. Iteration follows insertion order.
#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    graph: RwLock<Graph>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn new_node_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn get_node(&self, label: &str, filter: &Props) -> Result<Vec<Node>, StoreError> {
        let graph = self.graph.read().await;
        Ok(graph
            .nodes
            .iter()
            .filter(|n| n.label == label && n.matches(filter))
            .cloned()
            .collect())
    }

    async fn add_node(&self, label: &str, mut props: Props) -> Result<Node, StoreError> {
        let mut graph = self.graph.write().await;
        let mut id = new_node_id();
        while graph.find(&id).is_some() {
            id = new_node_id();
        }
        props.insert(NODE_ID.to_string(), Value::String(id));

        let node = Node {
            label: label.to_string(),
            props,
        };
        graph.nodes.push(node.clone());
        Ok(node)
    }

    async fn update_node(
        &self,
        label: &str,
        filter: &Props,
        mut props: Props,
    ) -> Result<Vec<Node>, StoreError> {
        props.remove(NODE_ID);
        let mut graph = self.graph.write().await;
        let mut updated = Vec::new();
        for node in graph
            .nodes
            .iter_mut()
            .filter(|n| n.label == label && n.matches(filter))
        {
            for (k, v) in &props {
                node.props.insert(k.clone(), v.clone());
            }
            updated.push(node.clone());
        }

        if updated.is_empty() {
            return Err(StoreError::not_found(label, Value::Object(filter.clone()).to_string()));
        }
        Ok(updated)
    }

    async fn delete_node(&self, label: &str, filter: &Props) -> Result<usize, StoreError> {
        let mut graph = self.graph.write().await;
        let doomed: Vec<String> = graph
            .nodes
            .iter()
            .filter(|n| n.label == label && n.matches(filter))
            .map(|n| n.id().to_string())
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        graph.nodes.retain(|n| !doomed.iter().any(|id| id == n.id()));
        graph
            .edges
            .retain(|e| !doomed.contains(&e.src) && !doomed.contains(&e.dst));
        log::debug!("Deleted {} {} node(s)", doomed.len(), label);
        Ok(doomed.len())
    }

    async fn get_relationship(&self, query: &RelQuery) -> Result<Vec<Relationship>, StoreError> {
        let graph = self.graph.read().await;
        let mut hits = Vec::new();
        for start in graph.nodes.iter().filter(|n| graph.is_start(n, query)) {
            let mut path = Vec::new();
            graph.walk(query, start.id(), &mut path, &mut hits);
        }

        let mut out = Vec::with_capacity(hits.len());
        for idx in hits {
            let edge = &graph.edges[idx];
            if let (Some(src), Some(dst)) = (graph.find(&edge.src), graph.find(&edge.dst)) {
                out.push(Relationship {
                    src: src.clone(),
                    rel_type: edge.rel_type.clone(),
                    dst: dst.clone(),
                });
            }
        }
        Ok(out)
    }

    async fn add_relationship(
        &self,
        src_label: &str,
        src_id: &str,
        rel_type: &str,
        dst_label: &str,
        dst_id: &str,
    ) -> Result<(), StoreError> {
        let mut graph = self.graph.write().await;
        if graph.find_labeled(src_label, src_id).is_none() {
            return Err(StoreError::not_found(src_label, src_id));
        }
        if graph.find_labeled(dst_label, dst_id).is_none() {
            return Err(StoreError::not_found(dst_label, dst_id));
        }

        let exists = graph
            .edges
            .iter()
            .any(|e| e.src == src_id && e.dst == dst_id && e.rel_type == rel_type);
        if !exists {
            graph.edges.push(Edge {
                src: src_id.to_string(),
                rel_type: rel_type.to_string(),
                dst: dst_id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_relationship(&self, query: &RelQuery) -> Result<usize, StoreError> {
        let mut graph = self.graph.write().await;
        let doomed: Vec<usize> = graph
            .edges
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                Graph::type_allowed(query, &e.rel_type)
                    && graph.find(&e.src).is_some_and(|n| graph.is_start(n, query))
                    && graph
                        .find(&e.dst)
                        .is_some_and(|n| n.matches(&query.target_props))
            })
            .map(|(idx, _)| idx)
            .collect();

        let mut idx = 0;
        graph.edges.retain(|_| {
            let keep = !doomed.contains(&idx);
            idx += 1;
            keep
        });
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::store::{labels, props, rels, HopRange};
    use serde_json::json;

    async fn agent(store: &MemoryGraphStore, name: &str) -> String {
        store
            .add_node(labels::AGENT, props(json!({"workflow_id": "w", "name": name})))
            .await
            .unwrap()
            .id()
            .to_string()
    }

    async fn link(store: &MemoryGraphStore, a: &str, b: &str) {
        store
            .add_relationship(labels::AGENT, a, rels::NEXT, labels::AGENT, b)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_add_assigns_unique_ids() {
        let store = MemoryGraphStore::new();
        let a = agent(&store, "a").await;
        let b = agent(&store, "b").await;
        assert_ne!(a, b);
        assert_eq!(a.len(), 12);
    }

    #[tokio::test]
    async fn test_get_node_filters_and_empty_filter() {
        let store = MemoryGraphStore::new();
        agent(&store, "a").await;
        agent(&store, "b").await;

        let all = store.get_node(labels::AGENT, &Props::new()).await.unwrap();
        assert_eq!(all.len(), 2);

        let only_b = store
            .get_node(labels::AGENT, &props(json!({"name": "b"})))
            .await
            .unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].get_str("name"), Some("b"));
    }

    #[tokio::test]
    async fn test_update_merges_and_keeps_id() {
        let store = MemoryGraphStore::new();
        let a = agent(&store, "a").await;

        let updated = store
            .update_node(
                labels::AGENT,
                &props(json!({"node_id": a})),
                props(json!({"task": "t", "node_id": "hijack"})),
            )
            .await
            .unwrap();
        assert_eq!(updated[0].id(), a);
        assert_eq!(updated[0].get_str("name"), Some("a"));
        assert_eq!(updated[0].get_str("task"), Some("t"));
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = MemoryGraphStore::new();
        let err = store
            .update_node(labels::AGENT, &props(json!({"node_id": "nope"})), Props::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_detaches_relationships() {
        let store = MemoryGraphStore::new();
        let a = agent(&store, "a").await;
        let b = agent(&store, "b").await;
        link(&store, &a, &b).await;

        let n = store
            .delete_node(labels::AGENT, &props(json!({"node_id": b})))
            .await
            .unwrap();
        assert_eq!(n, 1);

        let rels = store
            .get_relationship(&RelQuery::outgoing(labels::AGENT, &a, rels::NEXT))
            .await
            .unwrap();
        assert!(rels.is_empty());
    }

    #[tokio::test]
    async fn test_add_relationship_requires_endpoints() {
        let store = MemoryGraphStore::new();
        let a = agent(&store, "a").await;
        let err = store
            .add_relationship(labels::AGENT, &a, rels::NEXT, labels::AGENT, "ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_relationship_is_merged() {
        let store = MemoryGraphStore::new();
        let a = agent(&store, "a").await;
        let b = agent(&store, "b").await;
        link(&store, &a, &b).await;
        link(&store, &a, &b).await;

        let rels = store
            .get_relationship(&RelQuery::outgoing(labels::AGENT, &a, rels::NEXT))
            .await
            .unwrap();
        assert_eq!(rels.len(), 1);
    }

    #[tokio::test]
    async fn test_single_hop_keeps_insertion_order() {
        let store = MemoryGraphStore::new();
        let a = agent(&store, "a").await;
        let c = agent(&store, "c").await;
        let b = agent(&store, "b").await;
        link(&store, &a, &c).await;
        link(&store, &a, &b).await;

        let rels = store
            .get_relationship(&RelQuery::outgoing(labels::AGENT, &a, rels::NEXT))
            .await
            .unwrap();
        let targets: Vec<&str> = rels.iter().map(|r| r.dst.id()).collect();
        assert_eq!(targets, vec![c.as_str(), b.as_str()]);
    }

    #[tokio::test]
    async fn test_multi_hop_and_target_filter() {
        let store = MemoryGraphStore::new();
        let a = agent(&store, "a").await;
        let b = agent(&store, "b").await;
        let c = agent(&store, "c").await;
        link(&store, &a, &b).await;
        link(&store, &b, &c).await;

        let all = store
            .get_relationship(
                &RelQuery::outgoing(labels::AGENT, &a, rels::NEXT).with_hop(HopRange::Unbounded),
            )
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let to_c = store
            .get_relationship(
                &RelQuery::outgoing(labels::AGENT, &a, rels::NEXT)
                    .with_hop(HopRange::Range(1, 2))
                    .to_target(&c),
            )
            .await
            .unwrap();
        assert_eq!(to_c.len(), 2);

        let one_hop_to_c = store
            .get_relationship(&RelQuery::outgoing(labels::AGENT, &a, rels::NEXT).to_target(&c))
            .await
            .unwrap();
        assert!(one_hop_to_c.is_empty());
    }

    #[tokio::test]
    async fn test_cycles_terminate() {
        let store = MemoryGraphStore::new();
        let a = agent(&store, "a").await;
        let b = agent(&store, "b").await;
        link(&store, &a, &b).await;
        link(&store, &b, &a).await;

        let rels = store
            .get_relationship(
                &RelQuery::outgoing(labels::AGENT, &a, rels::NEXT).with_hop(HopRange::Unbounded),
            )
            .await
            .unwrap();
        assert_eq!(rels.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_relationship_by_type() {
        let store = MemoryGraphStore::new();
        let a = agent(&store, "a").await;
        let b = agent(&store, "b").await;
        link(&store, &a, &b).await;
        store
            .add_relationship(labels::AGENT, &b, rels::INPUT, labels::AGENT, &a)
            .await
            .unwrap();

        let n = store
            .delete_relationship(&RelQuery::outgoing(labels::AGENT, &a, rels::NEXT).to_target(&b))
            .await
            .unwrap();
        assert_eq!(n, 1);

        let inputs = store
            .get_relationship(&RelQuery::outgoing(labels::AGENT, &b, rels::INPUT))
            .await
            .unwrap();
        assert_eq!(inputs.len(), 1);
    }
}
