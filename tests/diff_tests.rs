//! Scene diff engine tests

#[cfg(test)]
mod tests {
    use scene_live::diff::{classify, diff, get_dotted, remove_dotted, set_dotted, DiffKind};
    use serde_json::json;

    #[test]
    fn identical_documents_produce_no_entries() {
        let doc = json!({"speed": 2, "scene": {"objects": {"cube": {"visible": true}}}});
        assert!(diff(&doc, &doc.clone()).is_empty());
    }

    #[test]
    fn detects_create_change_remove() {
        let old = json!({"a": 1, "b": "x", "gone": true});
        let new = json!({"a": 2, "b": "x", "fresh": [1, 2]});
        let entries = diff(&old, &new);

        let summary: Vec<(String, DiffKind)> =
            entries.iter().map(|e| (e.dotted(), e.kind)).collect();
        assert_eq!(
            summary,
            vec![
                ("a".to_string(), DiffKind::Change),
                ("fresh".to_string(), DiffKind::Create),
                ("gone".to_string(), DiffKind::Remove),
            ]
        );
        assert_eq!(entries[0].value, json!(2));
        assert_eq!(entries[2].value, json!(true));
    }

    #[test]
    fn recurses_into_nested_objects() {
        let old = json!({"scene": {"objects": {"cube": {"position": [0, 0, 0]}}}});
        let new = json!({"scene": {"objects": {"cube": {"position": [0, 1, 0]}}}});
        let entries = diff(&old, &new);
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].path,
            vec!["scene", "objects", "cube", "position", "1"]
        );
        assert_eq!(entries[0].kind, DiffKind::Change);
    }

    #[test]
    fn array_length_changes_are_index_entries() {
        let entries = diff(&json!({"l": [1, 2, 3]}), &json!({"l": [1]}));
        let paths: Vec<String> = entries.iter().map(|e| e.dotted()).collect();
        assert_eq!(paths, vec!["l.1", "l.2"]);
        assert!(entries.iter().all(|e| e.kind == DiffKind::Remove));
    }

    #[test]
    fn type_change_is_a_single_change() {
        let entries = diff(&json!({"v": {"x": 1}}), &json!({"v": 5}));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, DiffKind::Change);
        assert_eq!(entries[0].value, json!(5));
    }

    #[test]
    fn classification_splits_scene_entries() {
        let old = json!({"speed": 1, "scene": {"objects": {}}});
        let new = json!({"speed": 2, "scene": {"objects": {"cube": {"visible": false}}}, "sceneTint": "#fff"});
        let classified = classify(diff(&old, &new));
        let props: Vec<String> = classified.properties.iter().map(|e| e.dotted()).collect();
        assert_eq!(props, vec!["sceneTint", "speed"]);
        assert_eq!(classified.structural.len(), 1);
        assert_eq!(classified.structural[0].dotted(), "scene.objects.cube");
        assert!(!classified.is_empty());
    }

    #[test]
    fn dotted_helpers() {
        let mut doc = json!({});
        set_dotted(&mut doc, "scene.objects.cube.visible", json!(false));
        set_dotted(&mut doc, "cubeColor", json!("#ff0000"));
        assert_eq!(get_dotted(&doc, "scene.objects.cube.visible"), Some(&json!(false)));
        assert_eq!(get_dotted(&doc, "cubeColor"), Some(&json!("#ff0000")));
        assert_eq!(get_dotted(&doc, "scene.nothing"), None);

        assert_eq!(remove_dotted(&mut doc, "scene.objects.cube.visible"), Some(json!(false)));
        assert_eq!(doc, json!({"cubeColor": "#ff0000", "scene": {"objects": {"cube": {}}}}));
    }

    #[test]
    fn set_dotted_replaces_scalar_intermediates() {
        let mut doc = json!({"a": 3});
        set_dotted(&mut doc, "a.b", json!(1));
        assert_eq!(doc, json!({"a": {"b": 1}}));
    }

    #[test]
    fn axis_write_keeps_other_vector_components() {
        let mut doc = json!({});
        set_dotted(&mut doc, "scene.objects.cube.position", json!([1, 2, 3]));
        set_dotted(&mut doc, "scene.objects.cube.position.y", json!(5));
        assert_eq!(
            doc,
            json!({"scene": {"objects": {"cube": {"position": {"x": 1, "y": 5, "z": 3}}}}})
        );
    }

    #[test]
    fn index_write_targets_array_element() {
        let mut doc = json!({"l": [1, 2, 3, 4]});
        set_dotted(&mut doc, "l.1", json!(9));
        assert_eq!(doc, json!({"l": [1, 9, 3, 4]}));

        let mut doc = json!({"v": [1, 2, 3]});
        set_dotted(&mut doc, "v.2", json!(7));
        assert_eq!(doc, json!({"v": [1, 2, 7]}));
    }
}
