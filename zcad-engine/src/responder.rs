//! 文档变更响应。
//!
//! 每条变更只把相关节点标记为过期，不立即求解；受影响的图文档记入待求解集合，
//! 到下一次 `tick`/`flush` 时每个文档只求解一次。

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, trace};
use zcad_core::change::DocumentChange;
use zcad_core::transaction::ObjectLookup;
use zcad_graph::{GraphId, GraphRegistry, NodeId, SolveReport};

pub struct ChangeResponder {
    pending: BTreeMap<GraphId, Instant>,
    delay: Duration,
}

impl Default for ChangeResponder {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl ChangeResponder {
    /// `delay` 为文档首次进入待求解集合后等待合并后续变更的时长。
    pub fn new(delay: Duration) -> Self {
        Self {
            pending: BTreeMap::new(),
            delay,
        }
    }

    #[inline]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// 对全部打开的图文档评估一条变更，返回被标记过期的节点数。
    ///
    /// 直接引用 CAD 对象的节点先刷新缓存快照，再标记过期。
    pub fn respond(
        &mut self,
        change: &DocumentChange,
        graphs: &mut GraphRegistry,
        lookup: &dyn ObjectLookup,
    ) -> usize {
        let mut total = 0;
        for graph in graphs.iter_mut() {
            let mut hits: Vec<NodeId> = Vec::new();
            for (id, node) in graph.nodes_mut() {
                if node.needs_to_be_expired(change) {
                    node.refresh(lookup);
                    hits.push(id);
                }
            }
            if hits.is_empty() {
                continue;
            }
            for id in &hits {
                // 节点来自同一文档的遍历，不会是未知节点
                let _ = graph.expire(*id);
            }
            trace!(graph = %graph.name(), change = ?change.kind(), expired = hits.len(), "节点已过期");
            total += hits.len();
            self.schedule(graph.id());
        }
        total
    }

    /// 把文档加入待求解集合。已在集合中的文档保持原有的计时起点。
    pub fn schedule(&mut self, graph: GraphId) {
        self.pending.entry(graph).or_insert_with(Instant::now);
    }

    pub fn is_pending(&self, graph: GraphId) -> bool {
        self.pending.contains_key(&graph)
    }

    #[inline]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// 求解所有已到期的待求解文档，每个文档一次。
    pub fn tick(&mut self, graphs: &mut GraphRegistry, now: Instant) -> Vec<(GraphId, SolveReport)> {
        let due: Vec<GraphId> = self
            .pending
            .iter()
            .filter(|(_, since)| now.saturating_duration_since(**since) >= self.delay)
            .map(|(id, _)| *id)
            .collect();
        self.solve(due, graphs)
    }

    /// 不论是否到期，立即求解全部待求解文档。
    pub fn flush(&mut self, graphs: &mut GraphRegistry) -> Vec<(GraphId, SolveReport)> {
        let due: Vec<GraphId> = self.pending.keys().copied().collect();
        self.solve(due, graphs)
    }

    fn solve(
        &mut self,
        due: Vec<GraphId>,
        graphs: &mut GraphRegistry,
    ) -> Vec<(GraphId, SolveReport)> {
        let mut reports = Vec::with_capacity(due.len());
        for id in due {
            self.pending.remove(&id);
            match graphs.get_mut(id) {
                Some(graph) => reports.push((id, graph.solve())),
                None => debug!(graph = %id, "图文档已关闭，跳过求解"),
            }
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use zcad_core::document::{Entity, EntityId, Line};
    use zcad_core::geometry::{Point2, Vector2};
    use zcad_graph::{GraphDocument, ReferenceParam, Translate};

    use super::*;

    #[derive(Default)]
    struct MapLookup {
        entities: HashMap<EntityId, Entity>,
    }

    impl ObjectLookup for MapLookup {
        fn lookup(&self, id: EntityId) -> Option<Entity> {
            self.entities.get(&id).cloned()
        }

        fn ids_on_layer(&self, layer: &str) -> Vec<EntityId> {
            self.entities
                .iter()
                .filter(|(_, entity)| entity.layer_name() == layer)
                .map(|(id, _)| *id)
                .collect()
        }
    }

    fn line(x: f64) -> Entity {
        Entity::Line(Line {
            start: Point2::new(0.0, 0.0),
            end: Point2::new(x, 0.0),
            layer: "0".to_string(),
        })
    }

    struct Fixture {
        lookup: MapLookup,
        graphs: GraphRegistry,
        graph: GraphId,
        param: NodeId,
        moved: NodeId,
    }

    fn fixture() -> Fixture {
        let (x, y) = (EntityId::new(1), EntityId::new(2));
        let mut lookup = MapLookup::default();
        lookup.entities.insert(x, line(1.0));
        lookup.entities.insert(y, line(2.0));

        let mut doc = GraphDocument::new("demo");
        let param = doc.add_node(ReferenceParam::link("refs", [x, y], &lookup));
        let moved = doc
            .add_node_with_inputs(Translate::new("move", Vector2::new(0.0, 1.0)), &[param])
            .expect("上游节点存在");
        doc.solve();

        let mut graphs = GraphRegistry::new();
        let graph = graphs.open(doc);
        Fixture {
            lookup,
            graphs,
            graph,
            param,
            moved,
        }
    }

    #[test]
    fn two_modifications_produce_one_solve() {
        let mut f = fixture();
        let mut responder = ChangeResponder::default();
        let before = f.graphs.get(f.graph).map(|g| g.solve_count()).unwrap_or(0);

        responder.respond(&DocumentChange::modified([EntityId::new(1)]), &mut f.graphs, &f.lookup);
        responder.respond(&DocumentChange::modified([EntityId::new(2)]), &mut f.graphs, &f.lookup);
        assert!(responder.is_pending(f.graph));
        assert_eq!(responder.pending_len(), 1);

        let reports = responder.flush(&mut f.graphs);
        assert_eq!(reports.len(), 1);
        let after = f.graphs.get(f.graph).map(|g| g.solve_count()).unwrap_or(0);
        assert_eq!(after, before + 1);
        assert!(responder.flush(&mut f.graphs).is_empty());
    }

    #[test]
    fn unrelated_change_expires_nothing() {
        let mut f = fixture();
        let mut responder = ChangeResponder::default();
        let expired = responder.respond(
            &DocumentChange::erased([EntityId::new(99)]),
            &mut f.graphs,
            &f.lookup,
        );
        assert_eq!(expired, 0);
        assert!(!responder.is_pending(f.graph));
    }

    #[test]
    fn erase_expires_dependents_and_refreshes_snapshot() {
        let mut f = fixture();
        let mut responder = ChangeResponder::default();
        f.lookup.entities.remove(&EntityId::new(1));

        let expired = responder.respond(
            &DocumentChange::erased([EntityId::new(1)]),
            &mut f.graphs,
            &f.lookup,
        );
        assert_eq!(expired, 1);
        let graph = f.graphs.get(f.graph).expect("图文档应存在");
        assert!(graph.is_expired(f.param));
        assert!(graph.is_expired(f.moved));

        responder.flush(&mut f.graphs);
        let graph = f.graphs.get(f.graph).expect("图文档应存在");
        assert_eq!(graph.output(f.param).map(<[_]>::len), Some(1));
        assert_eq!(graph.output(f.moved).map(<[_]>::len), Some(1));
    }

    #[test]
    fn tick_waits_for_delay() {
        let mut f = fixture();
        let mut responder = ChangeResponder::new(Duration::from_secs(3600));
        responder.respond(&DocumentChange::modified([EntityId::new(1)]), &mut f.graphs, &f.lookup);

        assert!(responder.tick(&mut f.graphs, Instant::now()).is_empty());
        assert!(responder.is_pending(f.graph));
        let later = Instant::now() + Duration::from_secs(7200);
        assert_eq!(responder.tick(&mut f.graphs, later).len(), 1);
        assert!(!responder.is_pending(f.graph));
    }

    #[test]
    fn closed_graph_is_dropped_from_pending() {
        let mut f = fixture();
        let mut responder = ChangeResponder::default();
        responder.schedule(f.graph);
        f.graphs.close(f.graph);
        assert!(responder.flush(&mut f.graphs).is_empty());
        assert_eq!(responder.pending_len(), 0);
    }
}
