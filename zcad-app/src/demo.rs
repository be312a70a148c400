//! 命令行演示：搭建一个引用文档对象的图，编辑文档，观察预览与烘焙结果。

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};
use zcad_core::document::{Circle, Entity, EntityId, EntityProperties, Line};
use zcad_core::geometry::{Point2, Point3, Vector2};
use zcad_core::transaction::{DbError, OpenMode};
use zcad_engine::command::{CommandBus, CommandRequest};
use zcad_engine::errors::EngineError;
use zcad_engine::session::{PumpSummary, Session, SessionOptions};
use zcad_graph::geometry::{Geometry, Mesh};
use zcad_graph::{GeometrySource, GraphDocument, LayerCollector, ReferenceParam, Translate};

/// 单步的统计，便于文本与 JSON 两种输出。
#[derive(Debug, Serialize)]
pub struct StepReport {
    pub step: &'static str,
    pub changes: usize,
    pub expired: usize,
    pub solved: usize,
    pub node_failures: usize,
    pub preview_updated: usize,
    pub preview_unchanged: usize,
    pub preview_failed: usize,
    pub preview_removed: usize,
    pub displayed: usize,
}

impl StepReport {
    fn new(step: &'static str, summary: PumpSummary, session: &Session) -> Self {
        Self {
            step,
            changes: summary.changes,
            expired: summary.expired,
            solved: summary.solved,
            node_failures: summary.node_failures,
            preview_updated: summary.preview.updated,
            preview_unchanged: summary.preview.unchanged,
            preview_failed: summary.preview.failed,
            preview_removed: summary.preview.removed,
            displayed: session.preview().display().len(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DemoReport {
    pub mode: String,
    pub commands: Vec<&'static str>,
    pub steps: Vec<StepReport>,
    pub baked: usize,
    pub queued: usize,
    pub converted: usize,
    pub entity_kinds: BTreeMap<&'static str, usize>,
}

impl DemoReport {
    pub fn print(&self) {
        println!("ZCAD 预览同步演示（预览模式：{}）", self.mode);
        println!("支持的命令: {}", self.commands.join(", "));
        for step in &self.steps {
            println!(
                "  - {}: 变更={}, 过期节点={}, 求解={}, 预览更新={}, 未变={}, 失败={}, 移除={}, 显示实体={}",
                step.step,
                step.changes,
                step.expired,
                step.solved,
                step.preview_updated,
                step.preview_unchanged,
                step.preview_failed,
                step.preview_removed,
                step.displayed
            );
        }
        println!(
            "烘焙：立即提交 {} 个，排队 {} 个，转换后提交 {} 个",
            self.baked, self.queued, self.converted
        );
        println!("文档实体：");
        for (kind, count) in &self.entity_kinds {
            println!("  - {kind}: {count}");
        }
    }
}

fn append(session: &mut Session, entity: Entity) -> Result<EntityId, EngineError> {
    let mut tx = session.database_mut().begin();
    let model_space = tx.root_container(true);
    let handle = tx.append(&model_space, entity, EntityProperties::default())?;
    let id = handle.id().ok_or(DbError::NotAnEntity)?;
    tx.commit();
    Ok(id)
}

fn line(start: (f64, f64), end: (f64, f64)) -> Entity {
    Entity::Line(Line {
        start: Point2::new(start.0, start.1),
        end: Point2::new(end.0, end.1),
        layer: "Profile".to_string(),
    })
}

pub fn run(options: SessionOptions) -> Result<DemoReport, EngineError> {
    let mode = options.preview.mode.to_string();
    let mut session = Session::new(options);
    let bus = CommandBus::new();

    let edge_id = append(&mut session, line((0.0, 0.0), (4.0, 0.0)))?;
    let rise_id = append(&mut session, line((4.0, 0.0), (4.0, 3.0)))?;
    append(
        &mut session,
        Entity::Circle(Circle {
            center: Point2::new(10.0, 10.0),
            radius: 1.5,
            layer: "0".to_string(),
        }),
    )?;

    let (edge_param, collector) = session.with_lookup(|lookup| {
        (
            ReferenceParam::link("edge", [edge_id], lookup),
            LayerCollector::new("profile", "Profile", lookup),
        )
    });
    let mut graph = GraphDocument::new("demo");
    let edge = graph.add_node(edge_param);
    graph.add_node(collector);
    graph.add_node_with_inputs(Translate::new("offset", Vector2::new(0.0, 10.0)), &[edge])?;
    graph.add_node(GeometrySource::new(
        "stock",
        vec![Geometry::Mesh(Mesh::unit_cube(Point3::new(0.0, 0.0, 0.0), 2.0))],
    ));
    let graph = session.open_graph(graph);

    let mut steps = Vec::new();
    let summary = session.pump(Instant::now())?;
    steps.push(StepReport::new("open", summary, &session));

    {
        let mut tx = session.database_mut().begin();
        let handle = tx.open(edge_id, OpenMode::Write)?;
        if let Entity::Line(edge) = tx.entity_mut(&handle)? {
            edge.end = Point2::new(8.0, 0.0);
        }
        tx.commit();
    }
    let summary = session.pump(Instant::now())?;
    steps.push(StepReport::new("stretch", summary, &session));

    {
        let mut tx = session.database_mut().begin();
        let handle = tx.open(rise_id, OpenMode::Write)?;
        tx.erase(&handle)?;
        tx.commit();
    }
    let summary = session.pump(Instant::now())?;
    steps.push(StepReport::new("erase", summary, &session));

    let outcome = session.bake_graph(graph)?;
    let mut converted = 0;
    if session.take_command_request() {
        let before = session.database().snapshot().len();
        let response = bus.dispatch(&CommandRequest::new("convert_pending"), &mut session);
        if response.success {
            converted = session.database().snapshot().len().saturating_sub(before);
        } else {
            warn!(message = ?response.message, "转换命令失败");
        }
    }
    let summary = session.pump(Instant::now())?;
    steps.push(StepReport::new("bake", summary, &session));

    let snapshot = session.database().snapshot();
    let mut entity_kinds = BTreeMap::new();
    for (_, entity) in snapshot.entities() {
        *entity_kinds.entry(entity.kind_name()).or_default() += 1;
    }
    info!(entities = snapshot.len(), "演示完成");

    Ok(DemoReport {
        mode,
        commands: bus.available_commands().copied().collect(),
        steps,
        baked: outcome.committed.len(),
        queued: outcome.queued,
        converted,
        entity_kinds,
    })
}

#[cfg(test)]
mod tests {
    use zcad_engine::convert::PreviewMode;
    use zcad_engine::validate::ValidationMode;

    use super::*;

    fn options(mode: PreviewMode) -> SessionOptions {
        let mut options = SessionOptions {
            validation: ValidationMode::Strict,
            ..SessionOptions::default()
        };
        options.preview.mode = mode;
        options
    }

    #[test]
    fn demo_bakes_graph_outputs_into_the_document() {
        let report = run(options(PreviewMode::Shaded)).expect("演示应成功");
        assert_eq!(report.steps.len(), 4);
        assert_eq!(report.steps[0].preview_updated, 5);
        assert_eq!(report.steps[2].preview_removed, 1);
        assert_eq!(report.baked, 3);
        assert_eq!(report.queued, 1);
        assert_eq!(report.converted, 1);
        assert_eq!(report.entity_kinds.get("line"), Some(&4));
        assert_eq!(report.entity_kinds.get("circle"), Some(&1));
        assert_eq!(report.entity_kinds.get("solid"), Some(&1));
    }

    #[test]
    fn off_mode_displays_nothing() {
        let report = run(options(PreviewMode::Off)).expect("演示应成功");
        assert!(report.steps.iter().all(|step| step.displayed == 0));
        let json = serde_json::to_value(&report).expect("序列化报告");
        assert_eq!(json["mode"], "off");
    }
}
