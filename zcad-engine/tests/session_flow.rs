use std::collections::BTreeMap;
use std::time::Instant;

use serde_json::json;
use zcad_core::document::{Circle, Entity, EntityId, EntityProperties, Line, Units};
use zcad_core::geometry::{Point2, Point3, Vector2};
use zcad_core::transaction::OpenMode;
use zcad_engine::command::{CommandBus, CommandRequest};
use zcad_engine::session::{Session, SessionOptions};
use zcad_engine::validate::ValidationMode;
use zcad_graph::geometry::{Geometry, Mesh};
use zcad_graph::{
    GeometrySource, GraphDocument, GraphId, LayerCollector, NodeId, ReferenceParam, SourceId,
    Translate,
};

fn line(start: (f64, f64), end: (f64, f64), layer: &str) -> Entity {
    Entity::Line(Line {
        start: Point2::new(start.0, start.1),
        end: Point2::new(end.0, end.1),
        layer: layer.to_string(),
    })
}

fn append(session: &mut Session, entity: Entity) -> EntityId {
    let mut tx = session.database_mut().begin();
    let model_space = tx.root_container(true);
    let handle = tx
        .append(&model_space, entity, EntityProperties::default())
        .expect("append entity");
    let id = handle.id().expect("entity handle carries an id");
    tx.commit();
    id
}

struct Demo {
    session: Session,
    edge_id: EntityId,
    rise_id: EntityId,
    edge: NodeId,
    profile: NodeId,
    offset: NodeId,
    graph: GraphId,
}

fn demo() -> Demo {
    let mut session = Session::new(SessionOptions {
        validation: ValidationMode::Strict,
        ..SessionOptions::default()
    });
    let edge_id = append(&mut session, line((0.0, 0.0), (4.0, 0.0), "Profile"));
    let rise_id = append(&mut session, line((4.0, 0.0), (4.0, 3.0), "Profile"));
    append(
        &mut session,
        Entity::Circle(Circle {
            center: Point2::new(10.0, 10.0),
            radius: 1.5,
            layer: "0".to_string(),
        }),
    );

    let (edge_param, collector) = session.with_lookup(|lookup| {
        (
            ReferenceParam::link("edge", [edge_id], lookup),
            LayerCollector::new("profile", "Profile", lookup),
        )
    });
    let mut graph = GraphDocument::new("demo");
    let edge = graph.add_node(edge_param);
    let profile = graph.add_node(collector);
    let offset = graph
        .add_node_with_inputs(Translate::new("offset", Vector2::new(0.0, 10.0)), &[edge])
        .expect("upstream node exists");
    graph.add_node(GeometrySource::new(
        "stock",
        vec![Geometry::Mesh(Mesh::unit_cube(Point3::new(0.0, 0.0, 0.0), 2.0))],
    ));
    let graph = session.open_graph(graph);

    Demo {
        session,
        edge_id,
        rise_id,
        edge,
        profile,
        offset,
        graph,
    }
}

#[test]
fn initial_solve_previews_every_output() {
    let mut demo = demo();
    let summary = demo.session.pump(Instant::now()).expect("first pump");

    assert_eq!(summary.solved, 1);
    assert_eq!(summary.node_failures, 0);
    assert_eq!(summary.preview.updated, 5);
    assert_eq!(demo.session.preview().register().len(), 5);
    // 4 lines from the graph, 12 shaded faces for the cube
    assert_eq!(demo.session.preview().display().len(), 16);
}

#[test]
fn direct_edits_flow_back_into_the_preview() {
    let mut demo = demo();
    demo.session.pump(Instant::now()).expect("first pump");

    {
        let mut tx = demo.session.database_mut().begin();
        let handle = tx.open(demo.edge_id, OpenMode::Write).expect("edge exists");
        if let Entity::Line(edge) = tx.entity_mut(&handle).expect("writable") {
            edge.end = Point2::new(8.0, 0.0);
        }
        tx.commit();
    }
    let summary = demo.session.pump(Instant::now()).expect("pump after edit");
    assert_eq!(summary.changes, 1);
    assert_eq!(summary.solved, 1);
    assert_eq!(summary.preview.updated, 3);
    assert_eq!(summary.preview.unchanged, 2);
    assert_eq!(
        demo.session.preview().source(SourceId::new(demo.offset, 0)),
        Some(&Geometry::Line {
            start: Point2::new(0.0, 10.0),
            end: Point2::new(8.0, 10.0),
        })
    );

    {
        let mut tx = demo.session.database_mut().begin();
        let handle = tx.open(demo.rise_id, OpenMode::Write).expect("rise exists");
        tx.erase(&handle).expect("erase rise");
        tx.commit();
    }
    let summary = demo.session.pump(Instant::now()).expect("pump after erase");
    assert_eq!(summary.expired, 1);
    assert_eq!(summary.preview.removed, 1);
    assert!(
        demo.session
            .preview()
            .register()
            .try_get_object(SourceId::object(demo.profile, demo.rise_id))
            .is_none()
    );
    assert_eq!(demo.session.preview().register().len(), 4);
}

#[test]
fn aborted_edits_do_not_reach_the_graph() {
    let mut demo = demo();
    demo.session.pump(Instant::now()).expect("first pump");

    {
        let mut tx = demo.session.database_mut().begin();
        let handle = tx.open(demo.edge_id, OpenMode::Write).expect("edge exists");
        tx.erase(&handle).expect("erase edge");
        tx.abort();
    }
    let summary = demo.session.pump(Instant::now()).expect("pump after abort");
    assert_eq!(summary.changes, 0);
    assert_eq!(summary.solved, 0);
    assert!(demo.session.database().snapshot().contains(demo.edge_id));
}

#[test]
fn units_change_expires_every_linked_node() {
    let mut demo = demo();
    demo.session.pump(Instant::now()).expect("first pump");

    {
        let mut tx = demo.session.database_mut().begin();
        tx.set_units(Units::Meters);
        tx.commit();
    }
    let summary = demo.session.pump(Instant::now()).expect("pump after units change");
    assert_eq!(summary.changes, 1);
    // edge reference and layer collector; the translate node follows through its input
    assert_eq!(summary.expired, 2);
    assert_eq!(summary.solved, 1);
    let graph = demo.session.graphs().get(demo.graph).expect("graph is open");
    assert!(!graph.is_expired(demo.edge));
    assert_eq!(graph.solve_count(), 2);
}

#[test]
fn commands_switch_mode_and_bake_solids() {
    let mut demo = demo();
    demo.session.pump(Instant::now()).expect("first pump");
    let bus = CommandBus::new();

    let response = bus.dispatch(
        &CommandRequest::new("preview_mode").with_arg("wireframe"),
        &mut demo.session,
    );
    assert!(response.success, "{:?}", response.message);
    // 4 lines plus 18 cube edges
    assert_eq!(demo.session.preview().display().len(), 22);

    let response = bus.dispatch(&CommandRequest::new("clear_preview"), &mut demo.session);
    assert!(response.success);
    assert!(demo.session.preview().display().is_empty());
    let response = bus.dispatch(&CommandRequest::new("populate_preview"), &mut demo.session);
    assert!(response.success);
    assert_eq!(demo.session.preview().display().len(), 22);

    let outcome = demo.session.bake_graph(demo.graph).expect("bake graph");
    assert_eq!(outcome.committed.len(), 4);
    assert_eq!(outcome.queued, 1);
    assert!(demo.session.take_command_request());

    let response = bus.dispatch(&CommandRequest::new("convert_pending"), &mut demo.session);
    assert!(response.success, "{:?}", response.message);
    assert!(demo.session.queue().is_empty());

    let snapshot = demo.session.database().snapshot();
    let mut kinds: BTreeMap<&str, usize> = BTreeMap::new();
    for (_, entity) in snapshot.entities() {
        *kinds.entry(entity.kind_name()).or_default() += 1;
    }
    assert_eq!(
        serde_json::to_value(&kinds).expect("serialize kinds"),
        json!({ "circle": 1, "line": 6, "solid": 1 })
    );

    let summary = demo.session.pump(Instant::now()).expect("pump after bake");
    assert_eq!(summary.changes, 2);
    assert_eq!(summary.solved, 1);
}

#[test]
fn moving_an_object_onto_a_collected_layer_updates_the_preview() {
    let mut session = Session::new(SessionOptions {
        validation: ValidationMode::Strict,
        ..SessionOptions::default()
    });
    let stray = append(&mut session, line((0.0, 0.0), (2.0, 0.0), "Other"));
    let collector = session.with_lookup(|lookup| LayerCollector::new("profile", "Profile", lookup));
    let mut graph = GraphDocument::new("layers");
    graph.add_node(collector);
    session.open_graph(graph);
    session.pump(Instant::now()).expect("first pump");
    assert!(session.preview().register().is_empty());

    {
        let mut tx = session.database_mut().begin();
        let handle = tx.open(stray, OpenMode::Write).expect("line exists");
        tx.entity_mut(&handle).expect("writable").set_layer("Profile");
        tx.commit();
    }
    let summary = session.pump(Instant::now()).expect("pump after move");
    assert_eq!(summary.changes, 1);
    assert_eq!(summary.expired, 1);
    assert_eq!(summary.preview.updated, 1);
    assert_eq!(session.preview().register().len(), 1);
}

#[test]
fn erasing_the_first_collected_object_keeps_later_previews() {
    let mut demo = demo();
    demo.session.pump(Instant::now()).expect("first pump");
    let rise = SourceId::object(demo.profile, demo.rise_id);
    let rise_entities: Vec<_> = demo
        .session
        .preview()
        .register()
        .try_get_object(rise)
        .expect("rise is previewed")
        .iter()
        .map(|entity| entity.key())
        .collect();

    {
        let mut tx = demo.session.database_mut().begin();
        let handle = tx.open(demo.edge_id, OpenMode::Write).expect("edge exists");
        tx.erase(&handle).expect("erase edge");
        tx.commit();
    }
    let summary = demo.session.pump(Instant::now()).expect("pump after erase");
    assert_eq!(summary.expired, 2);
    // the translate node loses its only input
    assert_eq!(summary.node_failures, 1);
    assert_eq!(summary.preview.updated, 0);
    assert_eq!(summary.preview.unchanged, 2);
    assert_eq!(summary.preview.removed, 3);

    let register = demo.session.preview().register();
    assert!(
        register
            .try_get_object(SourceId::object(demo.profile, demo.edge_id))
            .is_none()
    );
    let kept: Vec<_> = register
        .try_get_object(rise)
        .expect("rise is still previewed")
        .iter()
        .map(|entity| entity.key())
        .collect();
    assert_eq!(kept, rise_entities);
}
