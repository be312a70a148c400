use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use thiserror::Error;
use tracing::trace;
use uuid::Uuid;
use zcad_core::change::DocumentChange;
use zcad_core::document::{Entity, EntityId};
use zcad_core::geometry::Vector2;
use zcad_core::transaction::ObjectLookup;

use crate::geometry::Geometry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// 由固定数值构造，便于测试中得到确定的 ID。
    pub fn from_u128(raw: u128) -> Self {
        Self(Uuid::from_u128(raw))
    }

    #[inline]
    pub fn uuid(self) -> Uuid {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 节点输出项的键。与 CAD 对象一一对应的输出以对象 ID 为键，
/// 其余按输出序号。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OutputKey {
    Index(usize),
    Object(EntityId),
}

impl fmt::Display for OutputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputKey::Index(index) => write!(f, "{index}"),
            OutputKey::Object(id) => write!(f, "@{}", id.get()),
        }
    }
}

/// 源对象的稳定标识：产出它的节点加上输出项的键。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId {
    pub node: NodeId,
    pub key: OutputKey,
}

impl SourceId {
    /// 按输出序号标识。
    #[inline]
    pub fn new(node: NodeId, index: usize) -> Self {
        Self {
            node,
            key: OutputKey::Index(index),
        }
    }

    /// 按来源 CAD 对象标识，对象前面的输出被删除时标识不变。
    #[inline]
    pub fn object(node: NodeId, id: EntityId) -> Self {
        Self {
            node,
            key: OutputKey::Object(id),
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.node, self.key)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NodeError {
    #[error("node expects input geometry but none was provided")]
    MissingInput,
    #[error("{0}")]
    Invalid(String),
}

/// 失效能力：节点据此判断一次文档变更是否需要让自己重新求解。
pub trait Expirable {
    fn needs_to_be_expired(&self, change: &DocumentChange) -> bool;
}

pub trait GraphNode: Expirable {
    fn name(&self) -> &str;

    /// 被标记过期之前调用，持有 CAD 对象直接链接的节点在此刷新缓存快照。
    fn refresh(&mut self, _lookup: &dyn ObjectLookup) {}

    /// 上一次 `solve` 的输出若与 CAD 对象一一对应，按输出顺序返回对象 ID。
    fn output_keys(&self) -> Option<Vec<EntityId>> {
        None
    }

    fn solve(&mut self, inputs: &[Geometry]) -> Result<Vec<Geometry>, NodeError>;
}

/// 引用参数：直接链接 CAD 对象并缓存其快照。
#[derive(Debug, Clone)]
pub struct ReferenceParam {
    name: String,
    references: Vec<EntityId>,
    cache: BTreeMap<EntityId, Option<Entity>>,
}

impl ReferenceParam {
    /// 建立链接并立即读取一次快照。
    pub fn link(
        name: impl Into<String>,
        references: impl IntoIterator<Item = EntityId>,
        lookup: &dyn ObjectLookup,
    ) -> Self {
        let mut param = Self {
            name: name.into(),
            references: references.into_iter().collect(),
            cache: BTreeMap::new(),
        };
        param.refresh(lookup);
        param
    }

    pub fn references(&self) -> &[EntityId] {
        &self.references
    }

    /// 缓存中的快照；对象已删除时为 None。
    pub fn cached(&self, id: EntityId) -> Option<&Entity> {
        self.cache.get(&id).and_then(Option::as_ref)
    }
}

impl Expirable for ReferenceParam {
    fn needs_to_be_expired(&self, change: &DocumentChange) -> bool {
        self.references.iter().any(|id| change.affects(*id))
    }
}

impl GraphNode for ReferenceParam {
    fn name(&self) -> &str {
        &self.name
    }

    fn refresh(&mut self, lookup: &dyn ObjectLookup) {
        for id in &self.references {
            self.cache.insert(*id, lookup.lookup(*id));
        }
        trace!(node = %self.name, count = self.cache.len(), "引用快照已刷新");
    }

    fn output_keys(&self) -> Option<Vec<EntityId>> {
        Some(
            self.references
                .iter()
                .copied()
                .filter(|id| self.cached(*id).is_some())
                .collect(),
        )
    }

    fn solve(&mut self, _inputs: &[Geometry]) -> Result<Vec<Geometry>, NodeError> {
        // 已删除的对象不输出，其余保持引用顺序
        Ok(self
            .references
            .iter()
            .filter_map(|id| self.cached(*id))
            .map(Geometry::from_entity)
            .collect())
    }
}

/// 收集某图层上的全部对象。
#[derive(Debug, Clone)]
pub struct LayerCollector {
    name: String,
    layer: String,
    members: BTreeSet<EntityId>,
    snapshots: Vec<(EntityId, Entity)>,
}

impl LayerCollector {
    pub fn new(
        name: impl Into<String>,
        layer: impl Into<String>,
        lookup: &dyn ObjectLookup,
    ) -> Self {
        let mut collector = Self {
            name: name.into(),
            layer: layer.into(),
            members: BTreeSet::new(),
            snapshots: Vec::new(),
        };
        collector.refresh(lookup);
        collector
    }

    pub fn members(&self) -> &BTreeSet<EntityId> {
        &self.members
    }
}

impl Expirable for LayerCollector {
    fn needs_to_be_expired(&self, change: &DocumentChange) -> bool {
        match change {
            // 新建或修改的对象可能落到本图层上，图层在此无从得知，一律视为相关；
            // 成员关系由 refresh 重新计算
            DocumentChange::ObjectCreated(_)
            | DocumentChange::ObjectModified(_)
            | DocumentChange::UnitsChanged { .. } => true,
            DocumentChange::ObjectErased(ids) => !self.members.is_disjoint(ids),
        }
    }
}

impl GraphNode for LayerCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn refresh(&mut self, lookup: &dyn ObjectLookup) {
        self.members = lookup.ids_on_layer(&self.layer).into_iter().collect();
        self.snapshots = self
            .members
            .iter()
            .filter_map(|id| lookup.lookup(*id).map(|entity| (*id, entity)))
            .collect();
    }

    fn output_keys(&self) -> Option<Vec<EntityId>> {
        Some(self.snapshots.iter().map(|(id, _)| *id).collect())
    }

    fn solve(&mut self, _inputs: &[Geometry]) -> Result<Vec<Geometry>, NodeError> {
        Ok(self
            .snapshots
            .iter()
            .map(|(_, entity)| Geometry::from_entity(entity))
            .collect())
    }
}

/// 常量几何源，与 CAD 文档无关。
#[derive(Debug, Clone)]
pub struct GeometrySource {
    name: String,
    items: Vec<Geometry>,
}

impl GeometrySource {
    pub fn new(name: impl Into<String>, items: Vec<Geometry>) -> Self {
        Self {
            name: name.into(),
            items,
        }
    }

    pub fn set_items(&mut self, items: Vec<Geometry>) {
        self.items = items;
    }
}

impl Expirable for GeometrySource {
    fn needs_to_be_expired(&self, _change: &DocumentChange) -> bool {
        false
    }
}

impl GraphNode for GeometrySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn solve(&mut self, _inputs: &[Geometry]) -> Result<Vec<Geometry>, NodeError> {
        Ok(self.items.clone())
    }
}

/// 平移上游几何。仅通过上游传播失效。
#[derive(Debug, Clone)]
pub struct Translate {
    name: String,
    offset: Vector2,
}

impl Translate {
    pub fn new(name: impl Into<String>, offset: Vector2) -> Self {
        Self {
            name: name.into(),
            offset,
        }
    }
}

impl Expirable for Translate {
    fn needs_to_be_expired(&self, _change: &DocumentChange) -> bool {
        false
    }
}

impl GraphNode for Translate {
    fn name(&self) -> &str {
        &self.name
    }

    fn solve(&mut self, inputs: &[Geometry]) -> Result<Vec<Geometry>, NodeError> {
        if inputs.is_empty() {
            return Err(NodeError::MissingInput);
        }
        Ok(inputs
            .iter()
            .map(|geometry| geometry.translated(self.offset))
            .collect())
    }
}
