//! 瞬态实体及其显示。瞬态实体只在视图中绘制，不写入文档数据库。

use std::collections::BTreeMap;
use std::fmt;

use tracing::trace;
use zcad_core::document::{Color, Entity, EntityId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransientKey(u64);

impl TransientKey {
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 实体是否仍与数据库对象绑定。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Free,
    Database(EntityId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransientEntity {
    key: TransientKey,
    entity: Entity,
    residency: Residency,
    disposed: bool,
}

impl TransientEntity {
    #[inline]
    pub fn key(&self) -> TransientKey {
        self.key
    }

    #[inline]
    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    #[inline]
    pub fn residency(&self) -> Residency {
        self.residency
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// 释放实体。释放后不得再绘制。
    pub fn dispose(&mut self) {
        if !self.disposed {
            trace!(key = self.key.0, kind = self.entity.kind_name(), "释放瞬态实体");
            self.disposed = true;
        }
    }
}

/// 为瞬态实体分配唯一键。每个预览服务器持有自己的分配器。
#[derive(Debug, Default)]
pub struct TransientAllocator {
    next: u64,
}

impl TransientAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, entity: Entity) -> TransientEntity {
        self.make(entity, Residency::Free)
    }

    /// 包装一个仍驻留在数据库中的对象副本。这样的实体不能脱离事务保留。
    pub fn adopt(&mut self, id: EntityId, entity: Entity) -> TransientEntity {
        self.make(entity, Residency::Database(id))
    }

    fn make(&mut self, entity: Entity, residency: Residency) -> TransientEntity {
        self.next += 1;
        TransientEntity {
            key: TransientKey(self.next),
            entity,
            residency,
            disposed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawMode {
    Shaded,
    Wireframe,
}

/// 宿主瞬态图形管理器的抽象。
pub trait TransientDisplay {
    /// 绘制实体，返回是否新加入显示。
    fn add(&mut self, entity: &TransientEntity, mode: DrawMode, color: Color) -> bool;
    /// 从显示中移除，返回之前是否在显示中。
    fn erase(&mut self, key: TransientKey) -> bool;
    fn contains(&self, key: TransientKey) -> bool;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 内存中的瞬态显示，记录当前绘制的实体。
#[derive(Debug, Default)]
pub struct TransientCanvas {
    drawn: BTreeMap<TransientKey, (Entity, DrawMode, Color)>,
    draw_calls: u64,
}

impl TransientCanvas {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前显示中的实体及其绘制方式。
    pub fn drawn(&self) -> impl Iterator<Item = (TransientKey, &Entity, DrawMode, Color)> + '_ {
        self.drawn
            .iter()
            .map(|(key, (entity, mode, color))| (*key, entity, *mode, *color))
    }

    /// 累计绘制调用次数。
    pub fn draw_calls(&self) -> u64 {
        self.draw_calls
    }
}

impl TransientDisplay for TransientCanvas {
    fn add(&mut self, entity: &TransientEntity, mode: DrawMode, color: Color) -> bool {
        debug_assert!(!entity.is_disposed(), "drawing a disposed transient entity");
        self.draw_calls += 1;
        self.drawn
            .insert(entity.key(), (entity.entity().clone(), mode, color))
            .is_none()
    }

    fn erase(&mut self, key: TransientKey) -> bool {
        self.drawn.remove(&key).is_some()
    }

    fn contains(&self, key: TransientKey) -> bool {
        self.drawn.contains_key(&key)
    }

    fn len(&self) -> usize {
        self.drawn.len()
    }
}
