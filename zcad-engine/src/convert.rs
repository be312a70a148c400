//! 图侧几何到 CAD 实体的转换。
//!
//! 预览转换随时可用；实体（Solid）转换只能在授权命令窗口内执行，
//! 因此 [`SolidConverter`] 的入口要求持有 [`CommandWindow`]。

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use zcad_core::document::{
    Arc, Circle, Color, Entity, Line, PointEntity, Polyline, PolylineVertex, Solid, Text,
    ThreeDFace,
};
use zcad_core::geometry::{Point2, Point3};
use zcad_graph::geometry::{Geometry, Mesh};

use crate::command::CommandWindow;
use crate::display::DrawMode;
use crate::errors::ConversionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreviewMode {
    Off,
    #[default]
    Shaded,
    Wireframe,
}

impl PreviewMode {
    /// 预览关闭时返回 None。
    pub fn draw_mode(self) -> Option<DrawMode> {
        match self {
            PreviewMode::Off => None,
            PreviewMode::Shaded => Some(DrawMode::Shaded),
            PreviewMode::Wireframe => Some(DrawMode::Wireframe),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PreviewMode::Off => "off",
            PreviewMode::Shaded => "shaded",
            PreviewMode::Wireframe => "wireframe",
        }
    }
}

impl fmt::Display for PreviewMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<zcad_config::PreviewMode> for PreviewMode {
    fn from(mode: zcad_config::PreviewMode) -> Self {
        match mode {
            zcad_config::PreviewMode::Off => PreviewMode::Off,
            zcad_config::PreviewMode::Shaded => PreviewMode::Shaded,
            zcad_config::PreviewMode::Wireframe => PreviewMode::Wireframe,
        }
    }
}

impl FromStr for PreviewMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(PreviewMode::Off),
            "shaded" => Ok(PreviewMode::Shaded),
            "wireframe" | "wire" => Ok(PreviewMode::Wireframe),
            other => Err(format!("unknown preview mode `{other}`")),
        }
    }
}

/// 预览转换参数。
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewSettings {
    pub mode: PreviewMode,
    pub layer: String,
    pub color: Color,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            mode: PreviewMode::default(),
            layer: "0".to_string(),
            color: Color::ByLayer,
        }
    }
}

pub trait GeometryConverter {
    fn convert(
        &self,
        geometry: &Geometry,
        settings: &PreviewSettings,
    ) -> Result<Vec<Entity>, ConversionError>;
}

/// 默认的预览转换器：着色模式下网格转为 3D 面，线框模式下转为投影到 XY 的边线。
#[derive(Debug, Default, Clone, Copy)]
pub struct PreviewConverter;

impl GeometryConverter for PreviewConverter {
    fn convert(
        &self,
        geometry: &Geometry,
        settings: &PreviewSettings,
    ) -> Result<Vec<Entity>, ConversionError> {
        match settings.mode.draw_mode() {
            None => Ok(Vec::new()),
            Some(mode) => geometry_to_entities(geometry, &settings.layer, mode),
        }
    }
}

/// 把图侧几何转换为实体。除网格外，各模式产出相同。
pub fn geometry_to_entities(
    geometry: &Geometry,
    layer: &str,
    mode: DrawMode,
) -> Result<Vec<Entity>, ConversionError> {
    let layer = layer.to_string();
    let entity = match geometry {
        Geometry::Point(position) => Entity::Point(PointEntity {
            position: *position,
            layer,
        }),
        Geometry::Line { start, end } => Entity::Line(Line {
            start: *start,
            end: *end,
            layer,
        }),
        Geometry::Polyline { points, closed } => {
            if points.len() < 2 {
                return Err(ConversionError::Invalid(format!(
                    "polyline needs at least 2 points, got {}",
                    points.len()
                )));
            }
            Entity::Polyline(Polyline {
                vertices: points.iter().copied().map(PolylineVertex::new).collect(),
                is_closed: *closed,
                layer,
            })
        }
        Geometry::Circle { center, radius } => {
            check_radius(*radius)?;
            Entity::Circle(Circle {
                center: *center,
                radius: *radius,
                layer,
            })
        }
        Geometry::Arc {
            center,
            radius,
            start_angle,
            end_angle,
        } => {
            check_radius(*radius)?;
            Entity::Arc(Arc {
                center: *center,
                radius: *radius,
                start_angle: *start_angle,
                end_angle: *end_angle,
                layer,
            })
        }
        Geometry::Text {
            insert,
            content,
            height,
        } => Entity::Text(Text {
            insert: *insert,
            content: content.clone(),
            height: *height,
            rotation: 0.0,
            layer,
        }),
        Geometry::Mesh(mesh) => return mesh_to_entities(mesh, &layer, mode),
    };
    Ok(vec![entity])
}

fn check_radius(radius: f64) -> Result<(), ConversionError> {
    if radius.is_finite() && radius > 0.0 {
        Ok(())
    } else {
        Err(ConversionError::Invalid(format!("radius must be positive, got {radius}")))
    }
}

fn mesh_to_entities(
    mesh: &Mesh,
    layer: &str,
    mode: DrawMode,
) -> Result<Vec<Entity>, ConversionError> {
    if !mesh.is_valid() {
        return Err(ConversionError::Invalid(
            "mesh has no faces or out-of-range face indices".to_string(),
        ));
    }
    match mode {
        DrawMode::Shaded => Ok(mesh
            .triangles()
            .map(|[a, b, c]| Entity::Face3D(ThreeDFace::triangle(a, b, c, layer)))
            .collect()),
        DrawMode::Wireframe => {
            let mut edges = BTreeSet::new();
            for face in &mesh.faces {
                for i in 0..3 {
                    let (a, b) = (face[i], face[(i + 1) % 3]);
                    edges.insert(if a < b { (a, b) } else { (b, a) });
                }
            }
            Ok(edges
                .into_iter()
                .map(|(a, b)| {
                    Entity::Line(Line {
                        start: project(mesh.vertices[a]),
                        end: project(mesh.vertices[b]),
                        layer: layer.to_string(),
                    })
                })
                .collect())
        }
    }
}

fn project(point: Point3) -> Point2 {
    Point2::new(point.x(), point.y())
}

/// 只能在授权命令窗口内执行的转换。
pub trait SolidConverter {
    fn convert_solid(
        &self,
        window: &CommandWindow,
        geometry: &Geometry,
    ) -> Result<Vec<Entity>, ConversionError>;
}

/// 把封闭网格转换为 [`Solid`] 实体。
#[derive(Debug, Clone)]
pub struct MeshSolidConverter {
    layer: String,
}

impl MeshSolidConverter {
    pub fn new(layer: impl Into<String>) -> Self {
        Self {
            layer: layer.into(),
        }
    }
}

impl Default for MeshSolidConverter {
    fn default() -> Self {
        Self::new("0")
    }
}

impl SolidConverter for MeshSolidConverter {
    fn convert_solid(
        &self,
        _window: &CommandWindow,
        geometry: &Geometry,
    ) -> Result<Vec<Entity>, ConversionError> {
        let Geometry::Mesh(mesh) = geometry else {
            return Err(ConversionError::Unsupported(geometry.kind_name()));
        };
        if !mesh.is_closed() {
            return Err(ConversionError::NotClosed);
        }
        Ok(vec![Entity::Solid(Solid {
            triangles: mesh.triangles().collect(),
            layer: self.layer.clone(),
        })])
    }
}
