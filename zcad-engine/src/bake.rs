//! 把图侧几何烘焙为持久 CAD 对象。

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, info};
use zcad_core::document::{Color, Entity, EntityId, EntityProperties};
use zcad_core::transaction::{Database, DbError};
use zcad_graph::geometry::Geometry;

use crate::queue::{ConversionRequest, ConversionRequestQueue};

/// 烘焙时的可选覆盖项，在提交时应用。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BakeSettings {
    pub layer: Option<String>,
    pub linetype: Option<String>,
    pub color: Option<Color>,
}

impl BakeSettings {
    pub fn apply(&self, entity: &mut Entity, properties: &mut EntityProperties) {
        if let Some(layer) = &self.layer {
            entity.set_layer(layer.clone());
        }
        if let Some(linetype) = &self.linetype {
            properties.linetype = Some(linetype.clone());
        }
        if let Some(color) = self.color {
            properties.color = color;
        }
    }
}

/// 烘焙器。简单实体立即提交；需要命令上下文的几何经转换队列处理后进入收件箱，
/// 由 [`Baker::commit_pending`] 提交。
pub struct Baker {
    settings: BakeSettings,
    inbox: Rc<RefCell<Vec<Entity>>>,
}

impl Baker {
    pub fn new(settings: BakeSettings) -> Self {
        Self {
            settings,
            inbox: Rc::new(RefCell::new(Vec::new())),
        }
    }

    #[inline]
    pub fn settings(&self) -> &BakeSettings {
        &self.settings
    }

    /// 在一个事务内提交实体，任一追加失败则整体回滚。
    pub fn bake_now(
        &self,
        database: &mut Database,
        entities: Vec<Entity>,
    ) -> Result<Vec<EntityId>, DbError> {
        if entities.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = database.begin();
        let model_space = tx.root_container(true);
        let mut ids = Vec::with_capacity(entities.len());
        for mut entity in entities {
            let mut properties = EntityProperties::default();
            self.settings.apply(&mut entity, &mut properties);
            let handle = tx.append(&model_space, entity, properties)?;
            ids.extend(handle.id());
        }
        tx.commit();
        info!(count = ids.len(), "烘焙对象已提交");
        Ok(ids)
    }

    /// 为需要命令上下文的几何排入转换请求，转换成功的实体进入收件箱。
    pub fn enqueue(&self, queue: &ConversionRequestQueue, geometry: Geometry) -> u64 {
        let inbox = Rc::clone(&self.inbox);
        queue.enqueue(ConversionRequest::new(geometry, move |result| {
            if result.success {
                inbox.borrow_mut().extend(result.converted_entities);
            }
            result.success
        }))
    }

    /// 收件箱中等待提交的实体数。
    pub fn pending(&self) -> usize {
        self.inbox.borrow().len()
    }

    pub fn commit_pending(&self, database: &mut Database) -> Result<Vec<EntityId>, DbError> {
        let entities = std::mem::take(&mut *self.inbox.borrow_mut());
        debug!(count = entities.len(), "提交收件箱中的烘焙实体");
        self.bake_now(database, entities)
    }
}
