use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;
use zcad_core::panic_payload_to_string;

use crate::geometry::Geometry;
use crate::node::{GraphNode, NodeId, OutputKey, SourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GraphId(Uuid);

impl GraphId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GraphId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("node {0} is not part of this graph")]
    UnknownNode(NodeId),
}

struct NodeSlot {
    id: NodeId,
    node: Box<dyn GraphNode>,
    inputs: Vec<NodeId>,
    expired: bool,
    preview: bool,
    output: Vec<Geometry>,
    keys: Vec<OutputKey>,
}

impl NodeSlot {
    fn sources(&self) -> impl Iterator<Item = SourceId> + '_ {
        self.keys.iter().map(|key| SourceId {
            node: self.id,
            key: *key,
        })
    }

    /// 节点给出的对象键与输出数量一致时使用对象键，否则按序号。
    fn rekey(&mut self) {
        self.keys = match self.node.output_keys() {
            Some(ids) if ids.len() == self.output.len() => {
                ids.into_iter().map(OutputKey::Object).collect()
            }
            _ => (0..self.output.len()).map(OutputKey::Index).collect(),
        };
    }
}

/// 一次求解的结果。
#[derive(Debug, Default)]
pub struct SolveReport {
    /// 本次实际重新计算的节点数。
    pub solved: usize,
    /// 开启预览的节点的全部当前输出，按节点顺序。
    pub outputs: Vec<(SourceId, Geometry)>,
    /// 求解失败的节点及原因；失败不会中断其余节点。
    pub failures: Vec<(NodeId, String)>,
}

/// 一个打开的生成式图文档。节点按添加顺序即拓扑顺序保存。
pub struct GraphDocument {
    id: GraphId,
    name: String,
    nodes: Vec<NodeSlot>,
    solve_count: u64,
}

impl GraphDocument {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: GraphId::new(),
            name: name.into(),
            nodes: Vec::new(),
            solve_count: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> GraphId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 已执行的求解次数。
    #[inline]
    pub fn solve_count(&self) -> u64 {
        self.solve_count
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_node(&mut self, node: impl GraphNode + 'static) -> NodeId {
        self.push(NodeId::new(), Box::new(node), Vec::new())
    }

    /// 添加带上游输入的节点。上游必须已在图中，从而保持拓扑顺序。
    pub fn add_node_with_inputs(
        &mut self,
        node: impl GraphNode + 'static,
        inputs: &[NodeId],
    ) -> Result<NodeId, GraphError> {
        for input in inputs {
            if self.position(*input).is_none() {
                return Err(GraphError::UnknownNode(*input));
            }
        }
        Ok(self.push(NodeId::new(), Box::new(node), inputs.to_vec()))
    }

    fn push(&mut self, id: NodeId, node: Box<dyn GraphNode>, inputs: Vec<NodeId>) -> NodeId {
        self.nodes.push(NodeSlot {
            id,
            node,
            inputs,
            expired: true,
            preview: true,
            output: Vec::new(),
            keys: Vec::new(),
        });
        id
    }

    pub fn set_preview(&mut self, node: NodeId, enabled: bool) -> Result<(), GraphError> {
        let index = self.position(node).ok_or(GraphError::UnknownNode(node))?;
        self.nodes[index].preview = enabled;
        Ok(())
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().map(|slot| slot.id)
    }

    /// 可变遍历全部节点，供变更响应器评估失效能力。
    pub fn nodes_mut(&mut self) -> impl Iterator<Item = (NodeId, &mut dyn GraphNode)> + '_ {
        self.nodes
            .iter_mut()
            .map(|slot| (slot.id, slot.node.as_mut() as &mut dyn GraphNode))
    }

    pub fn is_expired(&self, node: NodeId) -> bool {
        self.position(node)
            .map(|index| self.nodes[index].expired)
            .unwrap_or(false)
    }

    pub fn needs_solution(&self) -> bool {
        self.nodes.iter().any(|slot| slot.expired)
    }

    /// 当前开启预览的全部输出标识，不触发求解。
    pub fn preview_ids(&self) -> impl Iterator<Item = SourceId> + '_ {
        self.nodes
            .iter()
            .filter(|slot| slot.preview)
            .flat_map(|slot| slot.sources())
    }

    pub fn output(&self, node: NodeId) -> Option<&[Geometry]> {
        self.position(node)
            .map(|index| self.nodes[index].output.as_slice())
    }

    /// 按源对象标识取当前输出项。
    pub fn output_item(&self, source: SourceId) -> Option<&Geometry> {
        let slot = &self.nodes[self.position(source.node)?];
        let item = slot.keys.iter().position(|key| *key == source.key)?;
        slot.output.get(item)
    }

    /// 标记节点及其全部下游为过期，但不求解。
    pub fn expire(&mut self, node: NodeId) -> Result<(), GraphError> {
        let start = self.position(node).ok_or(GraphError::UnknownNode(node))?;
        let mut dirty = vec![node];
        self.nodes[start].expired = true;
        for index in start + 1..self.nodes.len() {
            let slot = &mut self.nodes[index];
            if slot.inputs.iter().any(|input| dirty.contains(input)) {
                slot.expired = true;
                dirty.push(slot.id);
            }
        }
        Ok(())
    }

    /// 重新计算全部过期节点。单个节点出错或 panic 只影响自身输出。
    pub fn solve(&mut self) -> SolveReport {
        let mut report = SolveReport::default();
        for index in 0..self.nodes.len() {
            if !self.nodes[index].expired {
                continue;
            }
            let inputs: Vec<Geometry> = self.nodes[index]
                .inputs
                .iter()
                .filter_map(|input| self.position(*input))
                .flat_map(|upstream| self.nodes[upstream].output.iter().cloned())
                .collect();

            let slot = &mut self.nodes[index];
            let outcome = catch_unwind(AssertUnwindSafe(|| slot.node.solve(&inputs)));
            let failure = match outcome {
                Ok(Ok(output)) => {
                    slot.output = output;
                    None
                }
                Ok(Err(err)) => Some(err.to_string()),
                Err(payload) => Some(format!("panicked: {}", panic_payload_to_string(&*payload))),
            };
            slot.expired = false;
            report.solved += 1;
            if let Some(message) = failure {
                warn!(graph = %self.name, node = %slot.node.name(), error = %message, "节点求解失败");
                slot.output.clear();
                report.failures.push((slot.id, message));
            }
            slot.rekey();
        }
        self.solve_count += 1;

        for slot in self.nodes.iter().filter(|slot| slot.preview) {
            report
                .outputs
                .extend(slot.sources().zip(slot.output.iter().cloned()));
        }
        debug!(
            graph = %self.name,
            solved = report.solved,
            outputs = report.outputs.len(),
            failures = report.failures.len(),
            "图求解完成"
        );
        report
    }

    fn position(&self, node: NodeId) -> Option<usize> {
        self.nodes.iter().position(|slot| slot.id == node)
    }
}

/// 当前打开的全部图文档。
#[derive(Default)]
pub struct GraphRegistry {
    documents: Vec<GraphDocument>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, document: GraphDocument) -> GraphId {
        let id = document.id();
        debug!(graph = %document.name(), "打开图文档");
        self.documents.push(document);
        id
    }

    pub fn close(&mut self, id: GraphId) -> Option<GraphDocument> {
        let index = self.documents.iter().position(|doc| doc.id() == id)?;
        Some(self.documents.remove(index))
    }

    pub fn get(&self, id: GraphId) -> Option<&GraphDocument> {
        self.documents.iter().find(|doc| doc.id() == id)
    }

    pub fn get_mut(&mut self, id: GraphId) -> Option<&mut GraphDocument> {
        self.documents.iter_mut().find(|doc| doc.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GraphDocument> {
        self.documents.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut GraphDocument> {
        self.documents.iter_mut()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use zcad_core::change::DocumentChange;
    use zcad_core::geometry::{Point2, Vector2};

    use super::*;
    use crate::node::{Expirable, GeometrySource, NodeError, Translate};

    struct Exploding;

    impl Expirable for Exploding {
        fn needs_to_be_expired(&self, _change: &DocumentChange) -> bool {
            true
        }
    }

    impl GraphNode for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        fn solve(&mut self, _inputs: &[Geometry]) -> Result<Vec<Geometry>, NodeError> {
            panic!("boom");
        }
    }

    fn point(x: f64) -> Geometry {
        Geometry::Point(Point2::new(x, 0.0))
    }

    #[test]
    fn expiry_propagates_downstream_only() {
        let mut graph = GraphDocument::new("test");
        let a = graph.add_node(GeometrySource::new("a", vec![point(1.0)]));
        let b = graph.add_node(GeometrySource::new("b", vec![point(2.0)]));
        let moved = graph
            .add_node_with_inputs(Translate::new("move", Vector2::new(1.0, 0.0)), &[a])
            .unwrap();
        graph.solve();
        assert!(!graph.needs_solution());

        graph.expire(a).unwrap();
        assert!(graph.is_expired(a));
        assert!(graph.is_expired(moved));
        assert!(!graph.is_expired(b));

        let report = graph.solve();
        assert_eq!(report.solved, 2);
        assert_eq!(graph.output(moved).unwrap(), &[point(2.0)]);
        assert_eq!(graph.solve_count(), 2);
    }

    #[test]
    fn failing_node_does_not_abort_pass() {
        let mut graph = GraphDocument::new("test");
        let bad = graph.add_node(Exploding);
        let good = graph.add_node(GeometrySource::new("good", vec![point(3.0)]));
        let orphan = graph
            .add_node_with_inputs(Translate::new("move", Vector2::new(0.0, 1.0)), &[bad])
            .unwrap();

        let report = graph.solve();
        assert_eq!(report.solved, 3);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].0, bad);
        assert!(report.failures[0].1.contains("boom"));
        assert_eq!(report.failures[1].0, orphan);
        assert_eq!(report.outputs, vec![(SourceId::new(good, 0), point(3.0))]);
    }

    #[test]
    fn unknown_input_is_rejected() {
        let mut graph = GraphDocument::new("test");
        let missing = NodeId::from_u128(42);
        let err = graph
            .add_node_with_inputs(Translate::new("move", Vector2::new(0.0, 0.0)), &[missing])
            .unwrap_err();
        assert_eq!(err, GraphError::UnknownNode(missing));
    }

    #[test]
    fn hidden_nodes_are_not_reported() {
        let mut graph = GraphDocument::new("test");
        let a = graph.add_node(GeometrySource::new("a", vec![point(1.0), point(2.0)]));
        graph.set_preview(a, false).unwrap();
        let report = graph.solve();
        assert!(report.outputs.is_empty());
        assert_eq!(graph.preview_ids().count(), 0);
        graph.set_preview(a, true).unwrap();
        assert_eq!(graph.preview_ids().count(), 2);
        assert_eq!(graph.output(a).unwrap().len(), 2);
    }

    #[test]
    fn outputs_are_addressable_by_source_id() {
        let mut graph = GraphDocument::new("test");
        let a = graph.add_node(GeometrySource::new("a", vec![point(1.0), point(2.0)]));
        graph.solve();
        assert_eq!(graph.output_item(SourceId::new(a, 1)), Some(&point(2.0)));
        assert!(graph.output_item(SourceId::new(a, 2)).is_none());
        assert!(graph.output_item(SourceId::new(NodeId::from_u128(7), 0)).is_none());
    }

    #[test]
    fn registry_open_and_close() {
        let mut registry = GraphRegistry::new();
        let id = registry.open(GraphDocument::new("one"));
        registry.open(GraphDocument::new("two"));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(id).map(GraphDocument::name), Some("one"));
        assert!(registry.close(id).is_some());
        assert!(registry.get(id).is_none());
    }
}
