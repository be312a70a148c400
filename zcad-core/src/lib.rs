pub mod transaction;

use std::any::Any;

/// 将 panic 载荷转为可记录的文本。
pub fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub mod geometry {
    use glam::{DVec2, DVec3};
    use serde::{Deserialize, Serialize};

    /// 二维点，内部以 `glam::DVec2` 表示。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Point2(pub DVec2);

    impl Point2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }

        #[inline]
        pub fn translate(self, offset: Vector2) -> Self {
            Self(self.0 + offset.0)
        }

        #[inline]
        pub fn is_finite(self) -> bool {
            self.0.is_finite()
        }

        /// 提升为 Z=0 的三维点。
        #[inline]
        pub fn extend(self, z: f64) -> Point3 {
            Point3::new(self.0.x, self.0.y, z)
        }
    }

    /// 二维向量。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Vector2(pub DVec2);

    impl Vector2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }
    }

    /// 三维点，供 3D 面与实体网格使用。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Point3(pub DVec3);

    impl Point3 {
        #[inline]
        pub fn new(x: f64, y: f64, z: f64) -> Self {
            Self(DVec3::new(x, y, z))
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }

        #[inline]
        pub fn z(self) -> f64 {
            self.0.z
        }

        #[inline]
        pub fn is_finite(self) -> bool {
            self.0.is_finite()
        }

        /// 按二维偏移平移，Z 保持不变。
        #[inline]
        pub fn translate_xy(self, offset: Vector2) -> Self {
            Self(self.0 + DVec3::new(offset.x(), offset.y(), 0.0))
        }
    }
}

pub mod document {
    use std::collections::{BTreeMap, HashMap};

    use serde::{Deserialize, Serialize};

    use crate::geometry::{Point2, Point3};

    /// 持久句柄：文档保存/重新打开后依然有效，按值比较。
    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    )]
    pub struct EntityId(u64);

    impl EntityId {
        #[inline]
        pub fn new(raw: u64) -> Self {
            Self(raw)
        }

        /// 提供原始数值，便于序列化或日志输出。
        #[inline]
        pub fn get(self) -> u64 {
            self.0
        }
    }

    /// 会话引用：只在当前打开会话内可解析，重新打开文档后失效。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SessionRef {
        pub(crate) session: u64,
        pub(crate) id: EntityId,
    }

    impl SessionRef {
        #[inline]
        pub fn session(self) -> u64 {
            self.session
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Layer {
        pub name: String,
        pub is_visible: bool,
    }

    impl Layer {
        #[inline]
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                is_visible: true,
            }
        }
    }

    /// 文档绘图单位。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Units {
        Unitless,
        #[default]
        Millimeters,
        Centimeters,
        Meters,
        Inches,
        Feet,
    }

    impl Units {
        /// 换算到毫米的比例；无单位按 1 处理。
        pub fn millimeters_per_unit(self) -> f64 {
            match self {
                Units::Unitless | Units::Millimeters => 1.0,
                Units::Centimeters => 10.0,
                Units::Meters => 1_000.0,
                Units::Inches => 25.4,
                Units::Feet => 304.8,
            }
        }

        /// 从 `self` 换算到 `target` 的缩放系数。
        pub fn scale_to(self, target: Units) -> f64 {
            self.millimeters_per_unit() / target.millimeters_per_unit()
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub enum Color {
        #[default]
        ByLayer,
        Index(u8),
        Rgb(u8, u8, u8),
    }

    /// 实体的显示属性，`linetype` 为 `None` 时随层。
    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    pub struct EntityProperties {
        pub color: Color,
        pub linetype: Option<String>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub enum Entity {
        Point(PointEntity),
        Line(Line),
        Circle(Circle),
        Arc(Arc),
        Polyline(Polyline),
        Text(Text),
        Face3D(ThreeDFace),
        Solid(Solid),
    }

    impl Entity {
        #[inline]
        pub fn layer_name(&self) -> &str {
            match self {
                Entity::Point(point) => &point.layer,
                Entity::Line(line) => &line.layer,
                Entity::Circle(circle) => &circle.layer,
                Entity::Arc(arc) => &arc.layer,
                Entity::Polyline(polyline) => &polyline.layer,
                Entity::Text(text) => &text.layer,
                Entity::Face3D(face) => &face.layer,
                Entity::Solid(solid) => &solid.layer,
            }
        }

        pub fn set_layer(&mut self, layer: impl Into<String>) {
            let layer = layer.into();
            match self {
                Entity::Point(point) => point.layer = layer,
                Entity::Line(line) => line.layer = layer,
                Entity::Circle(circle) => circle.layer = layer,
                Entity::Arc(arc) => arc.layer = layer,
                Entity::Polyline(polyline) => polyline.layer = layer,
                Entity::Text(text) => text.layer = layer,
                Entity::Face3D(face) => face.layer = layer,
                Entity::Solid(solid) => solid.layer = layer,
            }
        }

        /// 实体名称，用于日志。
        pub fn kind_name(&self) -> &'static str {
            match self {
                Entity::Point(_) => "point",
                Entity::Line(_) => "line",
                Entity::Circle(_) => "circle",
                Entity::Arc(_) => "arc",
                Entity::Polyline(_) => "polyline",
                Entity::Text(_) => "text",
                Entity::Face3D(_) => "3dface",
                Entity::Solid(_) => "solid",
            }
        }

        /// 几何是否完整：坐标有限、半径为正、顶点数量足够。
        /// 未完整构造的实体不能脱离创建它的事务使用。
        pub fn is_realized(&self) -> bool {
            match self {
                Entity::Point(point) => point.position.is_finite(),
                Entity::Line(line) => line.start.is_finite() && line.end.is_finite(),
                Entity::Circle(circle) => {
                    circle.center.is_finite() && circle.radius.is_finite() && circle.radius > 0.0
                }
                Entity::Arc(arc) => {
                    arc.center.is_finite()
                        && arc.radius.is_finite()
                        && arc.radius > 0.0
                        && arc.start_angle.is_finite()
                        && arc.end_angle.is_finite()
                }
                Entity::Polyline(polyline) => {
                    polyline.vertices.len() >= 2
                        && polyline
                            .vertices
                            .iter()
                            .all(|vertex| vertex.position.is_finite() && vertex.bulge.is_finite())
                }
                Entity::Text(text) => {
                    text.insert.is_finite() && text.height.is_finite() && text.height > 0.0
                }
                Entity::Face3D(face) => face.vertices.iter().all(|vertex| vertex.is_finite()),
                Entity::Solid(solid) => {
                    !solid.triangles.is_empty()
                        && solid
                            .triangles
                            .iter()
                            .flatten()
                            .all(|vertex| vertex.is_finite())
                }
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct PointEntity {
        pub position: Point2,
        pub layer: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Line {
        pub start: Point2,
        pub end: Point2,
        pub layer: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Circle {
        pub center: Point2,
        pub radius: f64,
        pub layer: String,
    }

    /// 圆弧实体，角度以弧度形式储存，遵循数学正方向。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Arc {
        pub center: Point2,
        pub radius: f64,
        pub start_angle: f64,
        pub end_angle: f64,
        pub layer: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Polyline {
        pub vertices: Vec<PolylineVertex>,
        pub is_closed: bool,
        pub layer: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct PolylineVertex {
        pub position: Point2,
        pub bulge: f64,
    }

    impl PolylineVertex {
        #[inline]
        pub fn new(position: Point2) -> Self {
            Self {
                position,
                bulge: 0.0,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Text {
        pub insert: Point2,
        pub content: String,
        pub height: f64,
        pub rotation: f64,
        pub layer: String,
    }

    /// 3D 面（3DFACE）实体，着色预览以它表达网格面片。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ThreeDFace {
        pub layer: String,
        pub vertices: [Point3; 4],
    }

    impl ThreeDFace {
        /// 由三角形构造，第四个顶点与第三个重合。
        pub fn triangle(a: Point3, b: Point3, c: Point3, layer: impl Into<String>) -> Self {
            Self {
                layer: layer.into(),
                vertices: [a, b, c, c],
            }
        }
    }

    /// 三维实体（以封闭三角网格表示）。宿主只允许在授权命令上下文中创建。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Solid {
        pub triangles: Vec<[Point3; 3]>,
        pub layer: String,
    }

    /// 数据库中的一条记录：实体及其显示属性。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Record {
        pub entity: Entity,
        pub properties: EntityProperties,
    }

    /// 持久化文档。所有写操作只能通过 [`crate::transaction::Transaction`] 完成。
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct Document {
        layers: HashMap<String, Layer>,
        records: BTreeMap<EntityId, Record>,
        next_entity_id: u64,
        #[serde(default)]
        units: Units,
    }

    impl Document {
        pub fn new() -> Self {
            let mut doc = Self::default();
            doc.ensure_layer("0");
            doc
        }

        /// 确保图层存在，返回是否为新建。
        pub(crate) fn ensure_layer(&mut self, name: impl AsRef<str>) -> bool {
            let key = name.as_ref();
            if self.layers.contains_key(key) {
                return false;
            }
            self.layers.insert(key.to_string(), Layer::new(key));
            true
        }

        pub(crate) fn remove_layer(&mut self, name: &str) {
            self.layers.remove(name);
        }

        #[inline]
        pub fn layers(&self) -> impl Iterator<Item = &Layer> {
            self.layers.values()
        }

        #[inline]
        pub fn has_layer(&self, name: &str) -> bool {
            self.layers.contains_key(name)
        }

        #[inline]
        pub fn units(&self) -> Units {
            self.units
        }

        pub(crate) fn set_units(&mut self, units: Units) {
            self.units = units;
        }

        pub(crate) fn insert(&mut self, entity: Entity, properties: EntityProperties) -> EntityId {
            self.ensure_layer(entity.layer_name());
            let id = self.next_id();
            self.records.insert(id, Record { entity, properties });
            id
        }

        pub(crate) fn restore(&mut self, id: EntityId, record: Record) {
            self.records.insert(id, record);
        }

        pub(crate) fn remove(&mut self, id: EntityId) -> Option<Record> {
            self.records.remove(&id)
        }

        pub(crate) fn record_mut(&mut self, id: EntityId) -> Option<&mut Record> {
            self.records.get_mut(&id)
        }

        #[inline]
        pub fn record(&self, id: EntityId) -> Option<&Record> {
            self.records.get(&id)
        }

        #[inline]
        pub fn entity(&self, id: EntityId) -> Option<&Entity> {
            self.records.get(&id).map(|record| &record.entity)
        }

        #[inline]
        pub fn contains(&self, id: EntityId) -> bool {
            self.records.contains_key(&id)
        }

        /// 按句柄顺序遍历实体。
        #[inline]
        pub fn entities(&self) -> impl Iterator<Item = (EntityId, &Entity)> {
            self.records.iter().map(|(id, record)| (*id, &record.entity))
        }

        #[inline]
        pub fn len(&self) -> usize {
            self.records.len()
        }

        #[inline]
        pub fn is_empty(&self) -> bool {
            self.records.is_empty()
        }

        #[inline]
        fn next_id(&mut self) -> EntityId {
            let id = self.next_entity_id;
            self.next_entity_id += 1;
            EntityId(id)
        }
    }

}

pub mod change {
    use std::collections::BTreeSet;

    use crate::document::{EntityId, Units};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum ChangeKind {
        ObjectCreated,
        ObjectModified,
        ObjectErased,
        UnitsChanged,
    }

    /// 文档变更通知，提交事务后发布，发布后不可变。
    #[derive(Debug, Clone, PartialEq)]
    pub enum DocumentChange {
        ObjectCreated(BTreeSet<EntityId>),
        ObjectModified(BTreeSet<EntityId>),
        ObjectErased(BTreeSet<EntityId>),
        UnitsChanged { previous: Units, current: Units },
    }

    impl DocumentChange {
        pub fn created(ids: impl IntoIterator<Item = EntityId>) -> Self {
            Self::ObjectCreated(ids.into_iter().collect())
        }

        pub fn modified(ids: impl IntoIterator<Item = EntityId>) -> Self {
            Self::ObjectModified(ids.into_iter().collect())
        }

        pub fn erased(ids: impl IntoIterator<Item = EntityId>) -> Self {
            Self::ObjectErased(ids.into_iter().collect())
        }

        pub fn kind(&self) -> ChangeKind {
            match self {
                DocumentChange::ObjectCreated(_) => ChangeKind::ObjectCreated,
                DocumentChange::ObjectModified(_) => ChangeKind::ObjectModified,
                DocumentChange::ObjectErased(_) => ChangeKind::ObjectErased,
                DocumentChange::UnitsChanged { .. } => ChangeKind::UnitsChanged,
            }
        }

        /// 受影响的句柄集合；单位变更不携带集合。
        pub fn ids(&self) -> Option<&BTreeSet<EntityId>> {
            match self {
                DocumentChange::ObjectCreated(ids)
                | DocumentChange::ObjectModified(ids)
                | DocumentChange::ObjectErased(ids) => Some(ids),
                DocumentChange::UnitsChanged { .. } => None,
            }
        }

        /// 判断变更是否涉及给定对象。单位变更会改变所有几何的含义，因此对任何对象都返回 true。
        pub fn affects(&self, reference: EntityId) -> bool {
            match self.ids() {
                Some(ids) => ids.contains(&reference),
                None => true,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn erased_change_affects_only_listed_ids() {
            let x = EntityId::new(7);
            let change = DocumentChange::erased([x]);
            assert_eq!(change.kind(), ChangeKind::ObjectErased);
            assert!(change.affects(x));
            assert!(!change.affects(EntityId::new(8)));
        }

        #[test]
        fn units_change_affects_everything() {
            let change = DocumentChange::UnitsChanged {
                previous: Units::Millimeters,
                current: Units::Meters,
            };
            assert!(change.ids().is_none());
            assert!(change.affects(EntityId::new(0)));
            assert!(change.affects(EntityId::new(12_345)));
        }
    }
}
