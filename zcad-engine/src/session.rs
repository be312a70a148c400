//! 会话：把数据库、图文档、预览服务器、转换队列与变更响应器组装在一起的主线程上下文。

use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use zcad_core::document::EntityId;
use zcad_core::panic_payload_to_string;
use zcad_core::transaction::{Database, ObjectLookup};
use zcad_graph::geometry::Geometry;
use zcad_graph::{GraphDocument, GraphId, GraphRegistry, NodeId, SolveReport, SourceId};

use crate::bake::{BakeSettings, Baker};
use crate::command::CommandWindow;
use crate::convert::{
    MeshSolidConverter, PreviewMode, PreviewSettings, SolidConverter, geometry_to_entities,
};
use crate::dispatch::{MainThreadHandle, MainThreadQueue};
use crate::display::DrawMode;
use crate::errors::EngineError;
use crate::preview::{SyncSummary, TransientPreviewServer};
use crate::queue::{ConversionRequestQueue, DrainReport};
use crate::responder::ChangeResponder;
use crate::validate::ValidationMode;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub preview: PreviewSettings,
    pub validation: ValidationMode,
    pub solve_delay: Duration,
    pub bake: BakeSettings,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            preview: PreviewSettings::default(),
            validation: ValidationMode::for_build(),
            solve_delay: Duration::ZERO,
            bake: BakeSettings::default(),
        }
    }
}

/// 一轮求解与预览同步的统计。
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SolveSummary {
    pub solved: usize,
    pub node_failures: usize,
    pub preview: SyncSummary,
}

/// 一次 `pump` 的统计。
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PumpSummary {
    pub jobs: usize,
    pub changes: usize,
    pub expired: usize,
    pub solved: usize,
    pub node_failures: usize,
    pub preview: SyncSummary,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BakeOutcome {
    pub committed: Vec<EntityId>,
    /// 需要命令上下文、已排入转换队列的几何数量。
    pub queued: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionSummary {
    pub report: DrainReport,
    pub committed: usize,
}

pub struct Session {
    database: Database,
    graphs: GraphRegistry,
    preview: TransientPreviewServer,
    queue: ConversionRequestQueue,
    responder: ChangeResponder,
    baker: Baker,
    solid_converter: Box<dyn SolidConverter>,
    main_thread: MainThreadQueue,
    command_requested: bool,
}

impl Session {
    pub fn new(options: SessionOptions) -> Self {
        Self::with_database(Database::new(), options)
    }

    pub fn with_database(database: Database, options: SessionOptions) -> Self {
        Self {
            database,
            graphs: GraphRegistry::new(),
            preview: TransientPreviewServer::new(options.preview, options.validation),
            queue: ConversionRequestQueue::new(),
            responder: ChangeResponder::new(options.solve_delay),
            baker: Baker::new(options.bake),
            solid_converter: Box::new(MeshSolidConverter::default()),
            main_thread: MainThreadQueue::new(),
            command_requested: false,
        }
    }

    pub fn with_solid_converter(mut self, converter: impl SolidConverter + 'static) -> Self {
        self.solid_converter = Box::new(converter);
        self
    }

    #[inline]
    pub fn database(&self) -> &Database {
        &self.database
    }

    /// 宿主直接编辑文档时使用。提交产生的变更在下一次 `pump` 中处理。
    #[inline]
    pub fn database_mut(&mut self) -> &mut Database {
        &mut self.database
    }

    #[inline]
    pub fn graphs(&self) -> &GraphRegistry {
        &self.graphs
    }

    #[inline]
    pub fn preview(&self) -> &TransientPreviewServer {
        &self.preview
    }

    #[inline]
    pub fn preview_mut(&mut self) -> &mut TransientPreviewServer {
        &mut self.preview
    }

    #[inline]
    pub fn queue(&self) -> &ConversionRequestQueue {
        &self.queue
    }

    #[inline]
    pub fn baker(&self) -> &Baker {
        &self.baker
    }

    pub fn handle(&self) -> MainThreadHandle {
        self.main_thread.handle()
    }

    /// 在只读事务中执行查询。事务结束时回滚，查询期间为读取而做的写入不会保留。
    pub fn with_lookup<R>(&mut self, f: impl FnOnce(&dyn ObjectLookup) -> R) -> R {
        let tx = self.database.begin();
        let result = f(&tx);
        tx.abort();
        result
    }

    /// 打开图文档并安排首次求解。
    pub fn open_graph(&mut self, document: GraphDocument) -> GraphId {
        let id = self.graphs.open(document);
        self.responder.schedule(id);
        id
    }

    /// 关闭图文档，其预览随之清理。
    pub fn close_graph(&mut self, id: GraphId) -> Option<GraphDocument> {
        let document = self.graphs.close(id)?;
        let preserve = self.preview_ids();
        let removed = self.preview.prune(&preserve);
        debug!(graph = %id, removed = removed.len(), "图文档已关闭");
        Some(document)
    }

    /// 开关节点预览，关闭时立即移除其预览实体。
    pub fn set_node_preview(
        &mut self,
        graph: GraphId,
        node: NodeId,
        enabled: bool,
    ) -> Result<(), EngineError> {
        let document = self
            .graphs
            .get_mut(graph)
            .ok_or(EngineError::UnknownGraph(graph))?;
        document.set_preview(node, enabled)?;
        if enabled {
            self.responder.schedule(graph);
        } else {
            let preserve = self.preview_ids();
            self.preview.prune(&preserve);
        }
        Ok(())
    }

    pub fn set_preview_mode(&mut self, mode: PreviewMode) -> Result<(), EngineError> {
        self.preview.set_mode(mode)?;
        Ok(())
    }

    /// 文档重新成为活动文档时重绘预览。
    pub fn activate(&mut self) -> usize {
        self.preview.populate_server()
    }

    /// 文档失去活动状态时把预览从显示中移除。
    pub fn deactivate(&mut self) -> usize {
        self.preview.clear_server()
    }

    /// 全部打开图文档当前的预览输出标识。
    fn preview_ids(&self) -> HashSet<SourceId> {
        self.graphs
            .iter()
            .flat_map(|graph| graph.preview_ids())
            .collect()
    }

    /// 处理数据库已提交的变更：只标记相关节点过期，不求解。返回 (变更数, 过期节点数)。
    pub fn process_changes(&mut self) -> (usize, usize) {
        let changes = self.database.take_changes();
        if changes.is_empty() {
            return (0, 0);
        }
        let tx = self.database.begin();
        let mut expired = 0;
        for change in &changes {
            expired += self.responder.respond(change, &mut self.graphs, &tx);
        }
        tx.abort();
        debug!(changes = changes.len(), expired, "文档变更已处理");
        (changes.len(), expired)
    }

    /// 求解到期的图文档并同步预览。
    pub fn solve_due(&mut self, now: Instant) -> Result<SolveSummary, EngineError> {
        let reports = self.responder.tick(&mut self.graphs, now);
        self.sync_preview(reports)
    }

    /// 立即求解全部待求解的图文档并同步预览。
    pub fn flush(&mut self) -> Result<SolveSummary, EngineError> {
        let reports = self.responder.flush(&mut self.graphs);
        self.sync_preview(reports)
    }

    fn sync_preview(
        &mut self,
        reports: Vec<(GraphId, SolveReport)>,
    ) -> Result<SolveSummary, EngineError> {
        if reports.is_empty() {
            return Ok(SolveSummary::default());
        }
        let solved = reports.len();
        let mut failures = 0;
        let mut outputs = Vec::new();
        for (_, report) in reports {
            failures += report.failures.len();
            outputs.extend(report.outputs);
        }
        let preserve = self.preview_ids();
        let preview = self.preview.sync(outputs, &preserve)?;
        Ok(SolveSummary {
            solved,
            node_failures: failures,
            preview,
        })
    }

    /// 主线程的一次循环：执行投递的工作，处理变更，求解到期文档并同步预览。
    pub fn pump(&mut self, now: Instant) -> Result<PumpSummary, EngineError> {
        let mut summary = PumpSummary::default();
        for job in self.main_thread.take_jobs() {
            summary.jobs += 1;
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| job(self))) {
                warn!(panic = %panic_payload_to_string(&*panic), "主线程任务 panic");
            }
        }

        let (changes, expired) = self.process_changes();
        summary.changes = changes;
        summary.expired = expired;

        let solve = self.solve_due(now)?;
        summary.solved = solve.solved;
        summary.node_failures = solve.node_failures;
        summary.preview = solve.preview;
        Ok(summary)
    }

    /// 烘焙几何。简单几何立即提交；需要命令上下文的几何排入转换队列，
    /// 并请求宿主执行 `convert_pending` 命令。
    pub fn bake(&mut self, geometries: Vec<Geometry>) -> Result<BakeOutcome, EngineError> {
        // 先转换全部简单几何，任一失败则不排入任何转换请求
        let (deferred, simple): (Vec<_>, Vec<_>) = geometries
            .into_iter()
            .partition(Geometry::requires_command_context);
        let mut entities = Vec::new();
        for geometry in &simple {
            entities.extend(geometry_to_entities(geometry, "0", DrawMode::Shaded)?);
        }
        let committed = self.baker.bake_now(&mut self.database, entities)?;
        let queued = deferred.len();
        for geometry in deferred {
            self.baker.enqueue(&self.queue, geometry);
        }
        if queued > 0 {
            self.command_requested = true;
        }
        info!(committed = committed.len(), queued, "烘焙请求完成");
        Ok(BakeOutcome { committed, queued })
    }

    /// 烘焙图文档中全部开启预览的节点的当前输出。
    pub fn bake_graph(&mut self, graph: GraphId) -> Result<BakeOutcome, EngineError> {
        let document = self
            .graphs
            .get(graph)
            .ok_or(EngineError::UnknownGraph(graph))?;
        let geometries: Vec<Geometry> = document
            .preview_ids()
            .filter_map(|source| document.output_item(source).cloned())
            .collect();
        self.bake(geometries)
    }

    /// 取走"需要执行 convert_pending"的请求标记。
    pub fn take_command_request(&mut self) -> bool {
        std::mem::take(&mut self.command_requested)
    }

    /// 在命令窗口内处理转换队列，并提交转换成功的实体。
    pub fn drain_conversions(
        &mut self,
        window: &CommandWindow,
    ) -> Result<ConversionSummary, EngineError> {
        let report = self.queue.run(window, self.solid_converter.as_ref())?;
        let committed = self.baker.commit_pending(&mut self.database)?.len();
        self.command_requested = report.deferred > 0;
        Ok(ConversionSummary { report, committed })
    }
}

#[cfg(test)]
mod tests {
    use zcad_core::document::{Entity, EntityProperties, Line};
    use zcad_core::geometry::{Point2, Point3};
    use zcad_graph::geometry::Mesh;
    use zcad_graph::{GeometrySource, ReferenceParam};

    use super::*;

    fn options() -> SessionOptions {
        SessionOptions {
            validation: ValidationMode::Strict,
            ..SessionOptions::default()
        }
    }

    fn add_line(session: &mut Session, x: f64) -> EntityId {
        let mut tx = session.database_mut().begin();
        let model_space = tx.root_container(true);
        let handle = tx
            .append(
                &model_space,
                Entity::Line(Line {
                    start: Point2::new(0.0, 0.0),
                    end: Point2::new(x, 0.0),
                    layer: "0".to_string(),
                }),
                EntityProperties::default(),
            )
            .expect("追加实体");
        let id = handle.id().expect("实体句柄应有 ID");
        tx.commit();
        id
    }

    #[test]
    fn opening_a_graph_solves_and_previews_it() {
        let mut session = Session::new(options());
        let x = add_line(&mut session, 2.0);

        let mut graph = GraphDocument::new("demo");
        let param = session.with_lookup(|lookup| ReferenceParam::link("ref", [x], lookup));
        graph.add_node(param);
        let id = session.open_graph(graph);

        let summary = session.pump(Instant::now()).expect("pump 应成功");
        assert_eq!(summary.solved, 1);
        assert_eq!(summary.preview.updated, 1);
        assert_eq!(session.preview().register().len(), 1);

        session.close_graph(id);
        assert!(session.preview().register().is_empty());
        assert!(session.preview().display().is_empty());
    }

    #[test]
    fn edits_between_pumps_coalesce_into_one_solve() {
        let mut session = Session::new(options());
        let x = add_line(&mut session, 1.0);
        let y = add_line(&mut session, 2.0);

        let mut graph = GraphDocument::new("demo");
        let param = session.with_lookup(|lookup| ReferenceParam::link("refs", [x, y], lookup));
        graph.add_node(param);
        let id = session.open_graph(graph);
        session.pump(Instant::now()).expect("首次求解");

        for target in [x, y] {
            let mut tx = session.database_mut().begin();
            let handle = tx
                .open(target, zcad_core::transaction::OpenMode::Write)
                .expect("对象存在");
            if let Entity::Line(line) = tx.entity_mut(&handle).expect("可写") {
                line.end = Point2::new(10.0, 5.0);
            }
            tx.commit();
        }

        let summary = session.pump(Instant::now()).expect("第二次 pump");
        assert_eq!(summary.changes, 2);
        assert_eq!(summary.solved, 1);
        assert_eq!(session.graphs().get(id).map(|g| g.solve_count()), Some(2));
        assert_eq!(summary.preview.updated, 2);
    }

    #[test]
    fn closed_mesh_bake_waits_for_command_window() {
        let mut session = Session::new(options());
        let cube = Geometry::Mesh(Mesh::unit_cube(Point3::new(0.0, 0.0, 0.0), 1.0));
        let outcome = session
            .bake(vec![cube, Geometry::Point(Point2::new(1.0, 1.0))])
            .expect("烘焙应成功");
        assert_eq!(outcome.committed.len(), 1);
        assert_eq!(outcome.queued, 1);
        assert!(session.take_command_request());
        assert!(!session.take_command_request());

        let window = CommandWindow::open();
        let summary = session.drain_conversions(&window).expect("转换应成功");
        assert_eq!(summary.report.succeeded, 1);
        assert_eq!(summary.committed, 1);
        assert_eq!(session.database().snapshot().len(), 2);
    }

    #[test]
    fn failed_bake_leaves_no_orphaned_requests() {
        let mut session = Session::new(options());
        let cube = Geometry::Mesh(Mesh::unit_cube(Point3::new(0.0, 0.0, 0.0), 1.0));
        let broken = Geometry::Circle {
            center: Point2::new(0.0, 0.0),
            radius: -1.0,
        };
        assert!(session.bake(vec![cube, broken]).is_err());
        assert!(session.queue().is_empty());
        assert!(!session.take_command_request());
        assert!(session.database().snapshot().is_empty());
    }

    #[test]
    fn hiding_a_node_removes_its_preview() {
        let mut session = Session::new(options());
        let mut graph = GraphDocument::new("demo");
        let node = graph.add_node(GeometrySource::new(
            "points",
            vec![Geometry::Point(Point2::new(0.0, 0.0))],
        ));
        let id = session.open_graph(graph);
        session.pump(Instant::now()).expect("求解");
        assert_eq!(session.preview().register().len(), 1);

        session.set_node_preview(id, node, false).expect("节点存在");
        assert!(session.preview().register().is_empty());
        assert!(matches!(
            session.set_node_preview(id, NodeId::from_u128(9), false),
            Err(EngineError::Graph(_))
        ));
    }

    #[test]
    fn jobs_posted_from_other_threads_run_on_pump() {
        let mut session = Session::new(options());
        let handle = session.handle();
        std::thread::spawn(move || {
            handle
                .post(|session| {
                    session.deactivate();
                })
                .expect("会话仍存在");
        })
        .join()
        .expect("后台线程应正常结束");

        let summary = session.pump(Instant::now()).expect("pump 应成功");
        assert_eq!(summary.jobs, 1);
        assert!(!session.preview().is_displayed());
    }
}
