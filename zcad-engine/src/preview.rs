//! 瞬态预览服务器。
//!
//! 登记表是"当前有哪些预览实体"的唯一依据；服务器另外保留每个源对象最近一次
//! 提交的几何，切换预览模式时据此重新转换。

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};
use zcad_graph::SourceId;
use zcad_graph::geometry::Geometry;

use crate::convert::{GeometryConverter, PreviewConverter, PreviewMode, PreviewSettings};
use crate::display::{TransientAllocator, TransientCanvas, TransientDisplay, TransientEntity};
use crate::errors::PreviewError;
use crate::register::ObjectRegister;
use crate::validate::{ValidationMode, validate_for_transient_use};

/// 一次同步的统计。
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncSummary {
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub removed: usize,
}

pub struct TransientPreviewServer {
    register: ObjectRegister,
    sources: HashMap<SourceId, Geometry>,
    settings: PreviewSettings,
    converter: Box<dyn GeometryConverter>,
    display: Box<dyn TransientDisplay>,
    allocator: TransientAllocator,
    validation: ValidationMode,
    displayed: bool,
}

impl TransientPreviewServer {
    pub fn new(settings: PreviewSettings, validation: ValidationMode) -> Self {
        Self::with_parts(
            settings,
            validation,
            Box::new(PreviewConverter),
            Box::new(TransientCanvas::new()),
        )
    }

    pub fn with_parts(
        settings: PreviewSettings,
        validation: ValidationMode,
        converter: Box<dyn GeometryConverter>,
        display: Box<dyn TransientDisplay>,
    ) -> Self {
        Self {
            register: ObjectRegister::new(),
            sources: HashMap::new(),
            settings,
            converter,
            display,
            allocator: TransientAllocator::new(),
            validation,
            displayed: true,
        }
    }

    #[inline]
    pub fn mode(&self) -> PreviewMode {
        self.settings.mode
    }

    #[inline]
    pub fn settings(&self) -> &PreviewSettings {
        &self.settings
    }

    #[inline]
    pub fn register(&self) -> &ObjectRegister {
        &self.register
    }

    pub fn display(&self) -> &dyn TransientDisplay {
        self.display.as_ref()
    }

    /// 预览实体当前是否绘制在显示中。
    #[inline]
    pub fn is_displayed(&self) -> bool {
        self.displayed
    }

    /// 源对象最近一次提交的几何。
    pub fn source(&self, id: SourceId) -> Option<&Geometry> {
        self.sources.get(&id)
    }

    /// 转换并登记 `id` 的几何，替换并释放其旧的预览实体。返回新实体数量。
    ///
    /// 转换失败时旧预览被移除，几何仍被保留，以便后续切换模式时重试。
    pub fn add_object(&mut self, id: SourceId, geometry: Geometry) -> Result<usize, PreviewError> {
        self.sources.insert(id, geometry.clone());
        self.materialize(id, &geometry)
    }

    fn materialize(&mut self, id: SourceId, geometry: &Geometry) -> Result<usize, PreviewError> {
        let entities = match self.converter.convert(geometry, &self.settings) {
            Ok(entities) => entities,
            Err(source) => {
                self.discard(id);
                return Err(PreviewError::Conversion {
                    id: id.to_string(),
                    source,
                });
            }
        };

        let transient = entities
            .into_iter()
            .map(|entity| self.allocator.allocate(entity))
            .collect();
        let accepted = match validate_for_transient_use(transient, self.validation.is_silent()) {
            Ok(accepted) => accepted,
            Err(err) => {
                self.discard(id);
                return Err(err.into());
            }
        };

        let count = accepted.len();
        if self.displayed {
            if let Some(mode) = self.settings.mode.draw_mode() {
                for entity in &accepted {
                    self.display.add(entity, mode, self.settings.color);
                }
            }
        }
        let displaced = self.register.register_object(id, accepted);
        self.release(displaced);
        Ok(count)
    }

    /// 移除 `id` 的预览实体与保留的几何。返回是否存在该条目。
    pub fn remove_object(&mut self, id: SourceId) -> bool {
        self.sources.remove(&id);
        self.discard(id)
    }

    fn discard(&mut self, id: SourceId) -> bool {
        match self.register.remove_object(id) {
            Some(entities) => {
                self.release(entities);
                true
            }
            None => false,
        }
    }

    fn release(&mut self, entities: Vec<TransientEntity>) {
        for mut entity in entities {
            self.display.erase(entity.key());
            entity.dispose();
        }
    }

    /// 从显示中移除全部预览实体，登记表保持不变。返回移除数量。
    pub fn clear_server(&mut self) -> usize {
        let mut erased = 0;
        for entry in self.register.entries() {
            for entity in &entry.entities {
                if self.display.erase(entity.key()) {
                    erased += 1;
                }
            }
        }
        self.displayed = false;
        debug!(erased, "预览显示已清空");
        erased
    }

    /// 把登记表中的全部实体重新绘制到显示中。返回新绘制的数量，已在显示中的不计。
    pub fn populate_server(&mut self) -> usize {
        self.displayed = true;
        let Some(mode) = self.settings.mode.draw_mode() else {
            return 0;
        };
        let mut drawn = 0;
        for entry in self.register.entries() {
            for entity in &entry.entities {
                if self.display.add(entity, mode, self.settings.color) {
                    drawn += 1;
                }
            }
        }
        debug!(drawn, "预览显示已重建");
        drawn
    }

    /// 切换预览模式。不同模式产出不同种类的实体，因此清空后按保留的源几何重新转换。
    ///
    /// 单个源对象转换失败不影响其余对象，返回遇到的第一个错误。
    pub fn set_mode(&mut self, mode: PreviewMode) -> Result<(), PreviewError> {
        if mode == self.settings.mode {
            return Ok(());
        }
        for entry in self.register.drain() {
            self.release(entry.entities);
        }
        info!(from = %self.settings.mode, to = %mode, "切换预览模式");
        self.settings.mode = mode;

        let mut sources: Vec<(SourceId, Geometry)> = self
            .sources
            .iter()
            .map(|(id, geometry)| (*id, geometry.clone()))
            .collect();
        sources.sort_by_key(|(id, _)| *id);

        let mut first_error = None;
        for (id, geometry) in sources {
            if let Err(err) = self.materialize(id, &geometry) {
                warn!(source = %id, error = %err, "重建预览失败");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// 移除所有不在 `preserve` 中的源对象，返回被移除的标识。
    pub fn prune(&mut self, preserve: &HashSet<SourceId>) -> Vec<SourceId> {
        let removed = self.register.remove_deleted_objects(preserve);
        self.sources.retain(|id, _| preserve.contains(id));
        let mut ids = Vec::with_capacity(removed.len());
        for entry in removed {
            ids.push(entry.id);
            self.release(entry.entities);
        }
        ids
    }

    /// 一次求解后的同步：更新全部输出，再清理不在 `preserve` 中的条目。
    ///
    /// 几何未变化的源对象不会重新转换。转换失败逐项隔离；严格模式下的校验错误立即返回。
    pub fn sync(
        &mut self,
        outputs: Vec<(SourceId, Geometry)>,
        preserve: &HashSet<SourceId>,
    ) -> Result<SyncSummary, PreviewError> {
        let mut summary = SyncSummary::default();
        for (id, geometry) in outputs {
            if self.register.contains(id) && self.sources.get(&id) == Some(&geometry) {
                summary.unchanged += 1;
                continue;
            }
            match self.add_object(id, geometry) {
                Ok(_) => summary.updated += 1,
                Err(err @ PreviewError::Validation(_)) => return Err(err),
                Err(err) => {
                    warn!(source = %id, error = %err, "预览转换失败");
                    summary.failed += 1;
                }
            }
        }
        summary.removed = self.prune(preserve).len();
        debug!(
            updated = summary.updated,
            unchanged = summary.unchanged,
            failed = summary.failed,
            removed = summary.removed,
            "预览同步完成"
        );
        Ok(summary)
    }
}
