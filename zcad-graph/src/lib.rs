//! 生成式图的最小宿主：几何、节点与失效协议。
//!
//! 完整的求解引擎不在本仓库范围内；这里只提供让变更响应器工作的部分：
//! [`node::Expirable`] 能力、几种节点实现，以及带逐节点隔离的求解。

pub mod document;
pub mod node;

pub use document::{GraphDocument, GraphError, GraphId, GraphRegistry, SolveReport};
pub use node::{
    Expirable, GeometrySource, GraphNode, LayerCollector, NodeError, NodeId, OutputKey,
    ReferenceParam, SourceId, Translate,
};

pub mod geometry {
    use std::collections::HashMap;

    use zcad_core::document::{Entity, ThreeDFace};
    use zcad_core::geometry::{Point2, Point3, Vector2};

    /// 三角网格。`faces` 为顶点索引。
    #[derive(Debug, Clone, PartialEq)]
    pub struct Mesh {
        pub vertices: Vec<Point3>,
        pub faces: Vec<[usize; 3]>,
    }

    impl Mesh {
        pub fn new(vertices: Vec<Point3>, faces: Vec<[usize; 3]>) -> Self {
            Self { vertices, faces }
        }

        /// 所有面索引均在范围内。
        pub fn is_valid(&self) -> bool {
            !self.faces.is_empty()
                && self
                    .faces
                    .iter()
                    .flatten()
                    .all(|index| *index < self.vertices.len())
        }

        /// 每条边恰好被两个面共享时视为封闭。
        pub fn is_closed(&self) -> bool {
            if !self.is_valid() {
                return false;
            }
            let mut edges: HashMap<(usize, usize), u32> = HashMap::new();
            for face in &self.faces {
                for i in 0..3 {
                    let a = face[i];
                    let b = face[(i + 1) % 3];
                    let key = if a < b { (a, b) } else { (b, a) };
                    *edges.entry(key).or_default() += 1;
                }
            }
            edges.values().all(|count| *count == 2)
        }

        /// 按面展开为三角形，越界索引的面被跳过。
        pub fn triangles(&self) -> impl Iterator<Item = [Point3; 3]> + '_ {
            self.faces.iter().filter_map(|face| {
                Some([
                    *self.vertices.get(face[0])?,
                    *self.vertices.get(face[1])?,
                    *self.vertices.get(face[2])?,
                ])
            })
        }

        /// 单位立方体，测试与演示使用。
        pub fn unit_cube(origin: Point3, size: f64) -> Self {
            let (x, y, z) = (origin.x(), origin.y(), origin.z());
            let vertices = vec![
                Point3::new(x, y, z),
                Point3::new(x + size, y, z),
                Point3::new(x + size, y + size, z),
                Point3::new(x, y + size, z),
                Point3::new(x, y, z + size),
                Point3::new(x + size, y, z + size),
                Point3::new(x + size, y + size, z + size),
                Point3::new(x, y + size, z + size),
            ];
            let faces = vec![
                [0, 2, 1],
                [0, 3, 2],
                [4, 5, 6],
                [4, 6, 7],
                [0, 1, 5],
                [0, 5, 4],
                [1, 2, 6],
                [1, 6, 5],
                [2, 3, 7],
                [2, 7, 6],
                [3, 0, 4],
                [3, 4, 7],
            ];
            Self { vertices, faces }
        }
    }

    /// 图侧几何，由节点产出，经转换器变为 CAD 实体。
    #[derive(Debug, Clone, PartialEq)]
    pub enum Geometry {
        Point(Point2),
        Line {
            start: Point2,
            end: Point2,
        },
        Polyline {
            points: Vec<Point2>,
            closed: bool,
        },
        Circle {
            center: Point2,
            radius: f64,
        },
        Arc {
            center: Point2,
            radius: f64,
            start_angle: f64,
            end_angle: f64,
        },
        Text {
            insert: Point2,
            content: String,
            height: f64,
        },
        Mesh(Mesh),
    }

    impl Geometry {
        pub fn kind_name(&self) -> &'static str {
            match self {
                Geometry::Point(_) => "point",
                Geometry::Line { .. } => "line",
                Geometry::Polyline { .. } => "polyline",
                Geometry::Circle { .. } => "circle",
                Geometry::Arc { .. } => "arc",
                Geometry::Text { .. } => "text",
                Geometry::Mesh(_) => "mesh",
            }
        }

        /// 封闭网格烘焙为实体，只能在授权命令窗口内创建。
        pub fn requires_command_context(&self) -> bool {
            matches!(self, Geometry::Mesh(mesh) if mesh.is_closed())
        }

        pub fn translated(&self, offset: Vector2) -> Geometry {
            match self {
                Geometry::Point(point) => Geometry::Point(point.translate(offset)),
                Geometry::Line { start, end } => Geometry::Line {
                    start: start.translate(offset),
                    end: end.translate(offset),
                },
                Geometry::Polyline { points, closed } => Geometry::Polyline {
                    points: points.iter().map(|point| point.translate(offset)).collect(),
                    closed: *closed,
                },
                Geometry::Circle { center, radius } => Geometry::Circle {
                    center: center.translate(offset),
                    radius: *radius,
                },
                Geometry::Arc {
                    center,
                    radius,
                    start_angle,
                    end_angle,
                } => Geometry::Arc {
                    center: center.translate(offset),
                    radius: *radius,
                    start_angle: *start_angle,
                    end_angle: *end_angle,
                },
                Geometry::Text {
                    insert,
                    content,
                    height,
                } => Geometry::Text {
                    insert: insert.translate(offset),
                    content: content.clone(),
                    height: *height,
                },
                Geometry::Mesh(mesh) => Geometry::Mesh(Mesh {
                    vertices: mesh
                        .vertices
                        .iter()
                        .map(|vertex| vertex.translate_xy(offset))
                        .collect(),
                    faces: mesh.faces.clone(),
                }),
            }
        }

        /// 读取 CAD 实体为图侧几何。
        pub fn from_entity(entity: &Entity) -> Geometry {
            match entity {
                Entity::Point(point) => Geometry::Point(point.position),
                Entity::Line(line) => Geometry::Line {
                    start: line.start,
                    end: line.end,
                },
                Entity::Circle(circle) => Geometry::Circle {
                    center: circle.center,
                    radius: circle.radius,
                },
                Entity::Arc(arc) => Geometry::Arc {
                    center: arc.center,
                    radius: arc.radius,
                    start_angle: arc.start_angle,
                    end_angle: arc.end_angle,
                },
                Entity::Polyline(polyline) => Geometry::Polyline {
                    points: polyline
                        .vertices
                        .iter()
                        .map(|vertex| vertex.position)
                        .collect(),
                    closed: polyline.is_closed,
                },
                Entity::Text(text) => Geometry::Text {
                    insert: text.insert,
                    content: text.content.clone(),
                    height: text.height,
                },
                Entity::Face3D(face) => Geometry::Mesh(face_mesh(face)),
                Entity::Solid(solid) => {
                    let mut vertices = Vec::with_capacity(solid.triangles.len() * 3);
                    let mut faces = Vec::with_capacity(solid.triangles.len());
                    for triangle in &solid.triangles {
                        let base = vertices.len();
                        vertices.extend_from_slice(triangle);
                        faces.push([base, base + 1, base + 2]);
                    }
                    Geometry::Mesh(Mesh { vertices, faces })
                }
            }
        }
    }

    fn face_mesh(face: &ThreeDFace) -> Mesh {
        let vertices = face.vertices.to_vec();
        let mut faces = vec![[0, 1, 2]];
        if face.vertices[3] != face.vertices[2] {
            faces.push([0, 2, 3]);
        }
        Mesh { vertices, faces }
    }

}
