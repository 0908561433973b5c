//! Scene tree, property table and live-update application tests

#[cfg(test)]
mod tests {
    use scene_live::lifecycle::ScriptManager;
    use scene_live::protocol::LiveUpdate;
    use scene_live::scene::{
        apply_object_property, PropertyTable, Scene, SceneBehavior, SceneState, SceneTree,
    };
    use scene_live::script::ScriptRegistry;
    use scene_live::types::{ComponentRecord, SceneObjectNode, Vec3};
    use scene_live::SceneError;
    use serde_json::{json, Value};
    use std::any::Any;
    use std::sync::Arc;

    #[derive(Default)]
    struct Demo {
        changes: Vec<(String, Value)>,
    }

    impl SceneBehavior for Demo {
        fn properties(&self) -> PropertyTable {
            PropertyTable::new()
                .number("speed", 0.0, 10.0, 1.0, "Speed")
                .color("cubeColor", "#ffffff", "Cube color")
                .boolean("paused", false, "Paused")
                .vector3("spawn", Vec3::zero(), "Spawn point")
        }

        fn build(&mut self, scene: &mut SceneState) {
            let cube = SceneObjectNode::new("cube", "Cube")
                .with_child(SceneObjectNode::new("cube-light", "Light"));
            scene.spawn(None, cube).unwrap();
            scene
                .spawn(None, SceneObjectNode::new("floor", "Floor"))
                .unwrap();
        }

        fn on_property_changed(&mut self, name: &str, value: &Value, _scene: &mut SceneState) {
            self.changes.push((name.to_string(), value.clone()));
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn scene() -> Scene {
        let scripts = Arc::new(ScriptManager::with_rhai(Arc::new(ScriptRegistry::default())));
        let mut scene = Scene::new("scenes/demo.ts", Box::new(Demo::default()), scripts);
        scene.set_route("/demo");
        scene.init();
        scene
    }

    fn tree() -> SceneTree {
        let mut tree = SceneTree::new();
        tree.insert(
            None,
            SceneObjectNode::new("root", "Root")
                .with_child(SceneObjectNode::new("a", "A"))
                .with_child(
                    SceneObjectNode::new("b", "B")
                        .with_component(ComponentRecord::new("b-mesh", "mesh")),
                ),
        )
        .unwrap();
        tree
    }

    // -----------------------------------------------------------------------
    // Tree editing
    // -----------------------------------------------------------------------

    #[test]
    fn ids_are_unique_across_the_tree() {
        let mut tree = tree();
        assert_eq!(tree.len(), 3);
        let err = tree
            .insert(Some("a"), SceneObjectNode::new("b", "Another B"))
            .unwrap_err();
        assert_eq!(err, SceneError::DuplicateId("b".into()));

        let clash = SceneObjectNode::new("c", "C").with_child(SceneObjectNode::new("c", "C2"));
        assert!(tree.insert(None, clash).is_err());
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn insert_under_missing_parent_fails() {
        let mut tree = tree();
        let err = tree
            .insert(Some("ghost"), SceneObjectNode::new("x", "X"))
            .unwrap_err();
        assert_eq!(err, SceneError::ObjectNotFound("ghost".into()));
    }

    #[test]
    fn remove_takes_the_subtree() {
        let mut tree = tree();
        let removed = tree.remove("root").unwrap();
        assert_eq!(removed.children.len(), 2);
        assert!(tree.is_empty());
        assert!(tree.remove("root").is_none());
    }

    #[test]
    fn duplicate_assigns_fresh_ids_under_same_parent() {
        let mut tree = tree();
        let first = tree.duplicate("b").unwrap();
        let second = tree.duplicate("b").unwrap();
        assert_eq!(first, "b_copy");
        assert_eq!(second, "b_copy2");
        assert_eq!(tree.parent_of("b_copy").as_deref(), Some("root"));
        assert_eq!(tree.find("b_copy").unwrap().components[0].id, "b-mesh_copy");
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn find_by_name_is_depth_first() {
        let tree = tree();
        assert_eq!(tree.find_by_name("B").unwrap().id, "b");
        assert!(tree.find_by_name("Nope").is_none());
    }

    // -----------------------------------------------------------------------
    // Object properties
    // -----------------------------------------------------------------------

    #[test]
    fn transform_properties_whole_and_by_axis() {
        let mut node = SceneObjectNode::new("n", "N");
        apply_object_property(&mut node, "position", &json!([1, 2, 3])).unwrap();
        apply_object_property(&mut node, "position.y", &json!(5.5)).unwrap();
        apply_object_property(&mut node, "scale", &json!({"x": 2, "y": 2, "z": 2})).unwrap();
        assert_eq!(node.transform.position, Vec3::new(1.0, 5.5, 3.0));
        assert_eq!(node.transform.scale, Vec3::new(2.0, 2.0, 2.0));

        let err = apply_object_property(&mut node, "rotation.w", &json!(1)).unwrap_err();
        assert!(matches!(err, SceneError::UnknownProperty(_)));
        let err = apply_object_property(&mut node, "position", &json!("up")).unwrap_err();
        assert!(matches!(err, SceneError::InvalidValue { .. }));
    }

    #[test]
    fn visible_name_and_material() {
        let mut node = SceneObjectNode::new("n", "N");
        apply_object_property(&mut node, "visible", &json!(false)).unwrap();
        apply_object_property(&mut node, "name", &json!("Renamed")).unwrap();
        apply_object_property(&mut node, "material.color", &json!("#00ff00")).unwrap();
        apply_object_property(&mut node, "material.roughness", &json!(0.4)).unwrap();

        assert!(!node.visible);
        assert_eq!(node.name, "Renamed");
        assert_eq!(node.components.len(), 1);
        let material = &node.components[0];
        assert_eq!(material.kind, ComponentRecord::MATERIAL);
        assert_eq!(material.data["color"], json!("#00ff00"));
        assert_eq!(material.data["roughness"], json!(0.4));
    }

    // -----------------------------------------------------------------------
    // Property table
    // -----------------------------------------------------------------------

    #[test]
    fn numbers_are_clamped_and_types_checked() {
        let table = Demo::default().properties();
        assert_eq!(table.validate("speed", &json!(50)).unwrap(), json!(10.0));
        assert_eq!(table.validate("speed", &json!(-1)).unwrap(), json!(0.0));
        assert!(table.validate("speed", &json!("fast")).is_err());
        assert!(table.validate("cubeColor", &json!("#ff0000")).is_ok());
        assert!(table.validate("cubeColor", &json!("red")).is_err());
        assert!(table.validate("paused", &json!(1)).is_err());
        assert_eq!(
            table.validate("missing", &json!(1)).unwrap_err(),
            SceneError::UnknownProperty("missing".into())
        );
    }

    // -----------------------------------------------------------------------
    // Scene updates
    // -----------------------------------------------------------------------

    #[test]
    fn property_update_sets_value_and_records_override() {
        let mut scene = scene();
        let update = LiveUpdate::property_update("scenes/demo.ts", "cubeColor", json!("#ff0000"), false);
        scene.apply_update(&update).unwrap();

        assert_eq!(scene.state().value("cubeColor"), Some(&json!("#ff0000")));
        assert_eq!(scene.state().overrides, json!({"cubeColor": "#ff0000"}));
        let demo = scene.behavior::<Demo>().unwrap();
        assert_eq!(demo.changes.last().unwrap().0, "cubeColor");
    }

    #[test]
    fn object_update_moves_the_object() {
        let mut scene = scene();
        let update = LiveUpdate::property_update(
            "scenes/demo.ts",
            "scene.objects.cube-light.position.x",
            json!(4),
            true,
        );
        scene.apply_update(&update).unwrap();
        let light = scene.state().tree.find("cube-light").unwrap();
        assert_eq!(light.transform.position.x, 4.0);
    }

    #[test]
    fn unknown_targets_are_rejected() {
        let mut scene = scene();
        let missing = LiveUpdate::property_update("s", "scene.objects.ghost.visible", json!(true), false);
        assert_eq!(
            scene.apply_update(&missing).unwrap_err(),
            SceneError::ObjectNotFound("ghost".into())
        );
        let undeclared = LiveUpdate::property_update("s", "gravity", json!(9.8), false);
        assert!(scene.apply_update(&undeclared).is_err());
        assert_eq!(scene.state().overrides, json!({}));
    }

    #[test]
    fn nested_sub_path_updates_vector_property() {
        let mut scene = scene();
        let update = LiveUpdate::property_update("s", "spawn.y", json!(2.5), false);
        scene.apply_update(&update).unwrap();
        let expected = json!({"x": 0.0, "y": 2.5, "z": 0.0});
        assert_eq!(scene.state().value("spawn"), Some(&expected));
        assert_eq!(scene.state().overrides, json!({"spawn": expected.clone()}));

        scene.init();
        assert_eq!(scene.state().value("spawn"), Some(&expected));
    }

    #[test]
    fn partial_vector_override_merges_over_default() {
        let mut scene = scene();
        scene
            .apply_update(&LiveUpdate::scene_reload("scenes/demo.ts", json!({"spawn": {"y": 4}})))
            .unwrap();
        assert_eq!(
            scene.state().value("spawn"),
            Some(&json!({"x": 0.0, "y": 4.0, "z": 0.0}))
        );
    }

    #[test]
    fn axis_edit_after_whole_vector_survives_reinit() {
        let mut scene = scene();
        for (property, value) in [
            ("scene.objects.cube.position", json!([1, 2, 3])),
            ("scene.objects.cube.position.y", json!(5)),
        ] {
            scene
                .apply_update(&LiveUpdate::property_update("s", property, value, false))
                .unwrap();
        }
        scene.init();
        let cube = scene.state().tree.find("cube").unwrap();
        assert_eq!(cube.transform.position, Vec3::new(1.0, 5.0, 3.0));
    }

    #[test]
    fn overrides_survive_reinit() {
        let mut scene = scene();
        scene
            .apply_update(&LiveUpdate::property_update("s", "speed", json!(3), false))
            .unwrap();
        scene
            .apply_update(&LiveUpdate::property_update(
                "s",
                "scene.objects.floor.visible",
                json!(false),
                false,
            ))
            .unwrap();

        scene.init();
        assert_eq!(scene.state().value("speed"), Some(&json!(3.0)));
        assert!(!scene.state().tree.find("floor").unwrap().visible);
    }

    #[test]
    fn null_value_restores_default() {
        let mut scene = scene();
        scene
            .apply_update(&LiveUpdate::property_update("s", "speed", json!(7), false))
            .unwrap();
        scene
            .apply_update(&LiveUpdate::property_update("s", "speed", Value::Null, false))
            .unwrap();
        assert_eq!(scene.state().value("speed"), Some(&json!(1.0)));
        assert_eq!(scene.state().overrides, json!({}));
    }

    #[test]
    fn scene_reload_rebuilds_from_document() {
        let mut scene = scene();
        scene
            .apply_update(&LiveUpdate::property_update("s", "speed", json!(3), false))
            .unwrap();
        let doc = json!({
            "paused": true,
            "scene": {"objects": {"cube": {"position": [0, 2, 0], "material": {"color": "#123456"}}}}
        });
        scene
            .apply_update(&LiveUpdate::scene_reload("scenes/demo.ts", doc.clone()))
            .unwrap();

        assert_eq!(scene.state().value("speed"), Some(&json!(1.0)));
        assert_eq!(scene.state().value("paused"), Some(&json!(true)));
        let cube = scene.state().tree.find("cube").unwrap();
        assert_eq!(cube.transform.position.y, 2.0);
        assert_eq!(cube.components[0].data["color"], json!("#123456"));
        assert_eq!(scene.state().overrides, doc);
    }

    #[test]
    fn queued_updates_apply_on_drain() {
        let mut scene = scene();
        scene.queue_update(LiveUpdate::property_update("s", "speed", json!(4), false));
        scene.queue_update(LiveUpdate::property_update("s", "bogus", json!(1), false));
        assert_eq!(scene.pending_updates(), 2);
        assert_eq!(scene.state().value("speed"), Some(&json!(1.0)));

        assert_eq!(scene.drain_pending(), 2);
        assert_eq!(scene.pending_updates(), 0);
        assert_eq!(scene.state().value("speed"), Some(&json!(4.0)));
    }

    #[test]
    fn get_object_uses_registry_then_tree() {
        let mut scene = scene();
        assert_eq!(scene.state_mut().get_object("Cube").unwrap().id, "cube");
        scene.clear_registry();
        assert!(scene.state().registry.is_empty());
        scene.state_mut().get_object("Light").unwrap().visible = false;
        assert!(!scene.state().tree.find("cube-light").unwrap().visible);
    }

    #[test]
    fn ignored_message_kinds_are_no_ops() {
        let mut scene = scene();
        let ping = LiveUpdate::from_json(r#"{"type":"ping"}"#).unwrap();
        scene.apply_update(&ping).unwrap();
        assert_eq!(scene.state().overrides, json!({}));
    }
}
