//! Live-update broker tests (in-memory store, paused clock)

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use scene_live::broker::{BrokerInput, LiveUpdateBroker};
    use scene_live::protocol::{kinds, LiveUpdate, UpdateAction};
    use scene_live::store::MemoryStore;
    use scene_live::types::BrokerConfig;
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    const SCENE: &str = "levels/one.ts";

    struct Harness {
        broker: LiveUpdateBroker,
        store: Arc<MemoryStore>,
        scene_rx: UnboundedReceiver<LiveUpdate>,
        path: PathBuf,
    }

    fn harness_with(config: BrokerConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let (broker, scene_rx) = LiveUpdateBroker::new(config, "/project", store.clone());
        let path = broker.register_scene(SCENE);
        Harness {
            broker,
            store,
            scene_rx,
            path,
        }
    }

    fn harness() -> Harness {
        harness_with(BrokerConfig::default())
    }

    fn compact() -> BrokerConfig {
        BrokerConfig {
            pretty_json: false,
            ..Default::default()
        }
    }

    fn edit(property: &str, value: Value, temporary: bool) -> String {
        LiveUpdate::property_update(SCENE, property, value, temporary)
            .to_json()
            .unwrap()
    }

    fn client(broker: &LiveUpdateBroker, id: u64) -> UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        broker.add_client(id, tx);
        rx
    }

    fn decode(frame: Bytes) -> LiveUpdate {
        serde_json::from_slice(&frame).unwrap()
    }

    fn on_disk(h: &Harness) -> Value {
        serde_json::from_str(&h.store.contents(&h.path).unwrap()).unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1_000)).await;
    }

    // -----------------------------------------------------------------------
    // Debounced write-back
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn rapid_edits_collapse_into_one_write() {
        let h = harness();
        for i in 1..=5 {
            h.broker
                .handle(BrokerInput::EditorMessage {
                    client: 1,
                    text: edit("speed", json!(i), false),
                })
                .await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(h.store.write_count(), 0);
        assert_eq!(h.broker.pending_writes(), 1);

        settle().await;
        assert_eq!(h.store.write_count(), 1);
        assert_eq!(on_disk(&h), json!({"speed": 5}));
        assert_eq!(h.broker.pending_writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn temporary_edits_are_never_written() {
        let mut h = harness();
        h.broker
            .handle(BrokerInput::EditorMessage {
                client: 1,
                text: edit("speed", json!(9), true),
            })
            .await;
        settle().await;
        assert_eq!(h.store.write_count(), 0);
        assert!(h.store.contents(&h.path).is_none());

        let relayed = h.scene_rx.try_recv().unwrap();
        assert!(relayed.temporary);
        assert_eq!(relayed.value, json!(9));
    }

    #[tokio::test(start_paused = true)]
    async fn properties_debounce_independently() {
        let h = harness();
        h.broker
            .handle(BrokerInput::EditorMessage {
                client: 1,
                text: edit("speed", json!(2), false),
            })
            .await;
        h.broker
            .handle(BrokerInput::EditorMessage {
                client: 1,
                text: edit("cubeColor", json!("#00ff00"), false),
            })
            .await;
        assert_eq!(h.broker.pending_writes(), 2);

        settle().await;
        assert_eq!(h.store.write_count(), 2);
        assert_eq!(on_disk(&h), json!({"cubeColor": "#00ff00", "speed": 2}));
    }

    #[tokio::test(start_paused = true)]
    async fn write_produces_sorted_compact_document() {
        let h = harness_with(compact());
        h.store.insert(&h.path, r#"{"speed":1}"#);
        h.broker
            .handle(BrokerInput::EditorMessage {
                client: 1,
                text: edit("cubeColor", json!("#ff0000"), false),
            })
            .await;
        settle().await;
        assert_eq!(
            h.store.contents(&h.path).unwrap(),
            r##"{"cubeColor":"#ff0000","speed":1}"##
        );
    }

    #[tokio::test(start_paused = true)]
    async fn first_write_creates_the_override_file() {
        let h = harness_with(compact());
        h.broker
            .handle(BrokerInput::LocalEdit(LiveUpdate::property_update(
                SCENE,
                "cubeColor",
                json!("#ff0000"),
                false,
            )))
            .await;
        settle().await;
        assert_eq!(
            h.store.contents("/project/levels/one.editor.json").unwrap(),
            r##"{"cubeColor":"#ff0000"}"##
        );
    }

    #[tokio::test(start_paused = true)]
    async fn nested_property_writes_nest_in_the_document() {
        let h = harness();
        h.broker
            .handle(BrokerInput::EditorMessage {
                client: 1,
                text: edit("scene.objects.cube.position", json!([0, 1, 0]), false),
            })
            .await;
        settle().await;
        assert_eq!(
            on_disk(&h),
            json!({"scene": {"objects": {"cube": {"position": [0, 1, 0]}}}})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn axis_edit_keeps_other_vector_components_on_disk() {
        let h = harness();
        for (property, value) in [
            ("scene.objects.cube.position", json!([1, 2, 3])),
            ("scene.objects.cube.position.y", json!(5)),
        ] {
            h.broker
                .handle(BrokerInput::EditorMessage {
                    client: 1,
                    text: edit(property, value, false),
                })
                .await;
            settle().await;
        }
        assert_eq!(
            on_disk(&h),
            json!({"scene": {"objects": {"cube": {"position": {"x": 1, "y": 5, "z": 3}}}}})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn flush_waits_for_a_write_already_underway() {
        let h = harness();
        h.store.set_write_delay(Duration::from_millis(400));
        h.broker
            .handle(BrokerInput::EditorMessage {
                client: 1,
                text: edit("speed", json!(7), false),
            })
            .await;
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(h.broker.pending_writes(), 0);
        assert_eq!(h.broker.stats().persisted, 0);

        h.broker.flush().await;
        assert_eq!(h.broker.stats().persisted, 1);
        assert_eq!(on_disk(&h), json!({"speed": 7}));
    }

    #[tokio::test]
    async fn flush_writes_pending_edits_immediately() {
        let h = harness();
        h.broker
            .handle(BrokerInput::EditorMessage {
                client: 1,
                text: edit("speed", json!(3), false),
            })
            .await;
        h.broker.flush().await;
        assert_eq!(h.store.write_count(), 1);
        assert_eq!(h.broker.pending_writes(), 0);
        assert_eq!(on_disk(&h), json!({"speed": 3}));
    }

    #[tokio::test]
    async fn failed_write_is_dropped_and_cache_untouched() {
        let h = harness();
        h.store.fail_writes(true);
        let update = LiveUpdate::property_update(SCENE, "speed", json!(4), false);
        assert!(!h.broker.persist(&update).await);
        assert!(h.broker.cached_document(&h.path).is_none());
        assert_eq!(h.broker.stats().dropped, 1);

        h.store.fail_writes(false);
        assert!(h.broker.persist(&update).await);
        assert_eq!(h.broker.stats().persisted, 1);
    }

    #[tokio::test]
    async fn unreadable_override_abandons_the_write() {
        let h = harness();
        h.store.insert(&h.path, "{ nope");
        let update = LiveUpdate::property_update(SCENE, "speed", json!(4), false);
        assert!(!h.broker.persist(&update).await);
        assert_eq!(h.store.contents(&h.path).unwrap(), "{ nope");
    }

    // -----------------------------------------------------------------------
    // Echo suppression & file changes
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn own_write_does_not_echo() {
        let mut h = harness();
        let update = LiveUpdate::property_update(SCENE, "speed", json!(6), false);
        assert!(h.broker.persist(&update).await);

        let emitted = h
            .broker
            .handle_file_change(&h.path)
            .await;
        assert_eq!(emitted, 0);
        assert!(h.scene_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn identical_rewrite_emits_nothing() {
        let mut h = harness();
        h.store.insert(&h.path, r#"{"speed": 1}"#);
        h.broker.prime(&h.path).await.unwrap();

        // Same bytes.
        assert_eq!(h.broker.handle_file_change(&h.path).await, 0);
        // Same document, different formatting.
        h.store.insert(&h.path, "{\n  \"speed\": 1\n}");
        assert_eq!(h.broker.handle_file_change(&h.path).await, 0);
        assert!(h.scene_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn property_change_on_disk_is_emitted() {
        let mut h = harness();
        let mut rx = client(&h.broker, 7);
        h.store.insert(&h.path, r##"{"cubeColor": "#ffffff", "speed": 1}"##);
        h.broker.prime(&h.path).await.unwrap();

        h.store.insert(&h.path, r##"{"cubeColor": "#ff0000"}"##);
        assert_eq!(h.broker.handle_file_change(&h.path).await, 2);

        let first = h.scene_rx.try_recv().unwrap();
        assert_eq!(first.action(), Some(UpdateAction::Property));
        assert_eq!(first.property.as_deref(), Some("cubeColor"));
        assert_eq!(first.value, json!("#ff0000"));
        assert_eq!(first.scene_path.as_deref(), Some(SCENE));

        let removed = h.scene_rx.try_recv().unwrap();
        assert_eq!(removed.property.as_deref(), Some("speed"));
        assert!(removed.value.is_null());

        assert_eq!(decode(rx.try_recv().unwrap()).property.as_deref(), Some("cubeColor"));
    }

    #[tokio::test]
    async fn first_observation_diffs_against_empty() {
        let mut h = harness();
        h.store.insert(&h.path, r#"{"speed": 2}"#);
        assert_eq!(h.broker.handle_file_change(&h.path).await, 1);
        assert_eq!(h.scene_rx.try_recv().unwrap().value, json!(2));
    }

    #[tokio::test]
    async fn structural_change_sends_scene_reload() {
        let mut h = harness();
        let mut rx = client(&h.broker, 1);
        h.store.insert(&h.path, r#"{"speed": 1}"#);
        h.broker.prime(&h.path).await.unwrap();

        let doc = json!({"speed": 2, "scene": {"objects": {"cube": {"visible": false}}}});
        h.store.insert(&h.path, doc.to_string());
        assert_eq!(h.broker.handle_file_change(&h.path).await, 1);

        let reload = h.scene_rx.try_recv().unwrap();
        assert_eq!(reload.kind.as_deref(), Some(kinds::SCENE_RELOAD));
        assert_eq!(reload.value, doc);
        assert!(h.scene_rx.try_recv().is_err());
        assert_eq!(decode(rx.try_recv().unwrap()).action(), Some(UpdateAction::Reload));
    }

    #[tokio::test]
    async fn malformed_file_is_dropped_and_broker_keeps_going() {
        let mut h = harness();
        h.store.insert(&h.path, r#"{"speed": 1}"#);
        h.broker.prime(&h.path).await.unwrap();

        h.store.insert(&h.path, r#"{"speed": "#);
        assert_eq!(h.broker.handle_file_change(&h.path).await, 0);
        assert_eq!(h.broker.stats().dropped, 1);
        assert_eq!(h.broker.cached_document(&h.path), Some(json!({"speed": 1})));

        h.store.insert(&h.path, r#"{"speed": 4}"#);
        assert_eq!(h.broker.handle_file_change(&h.path).await, 1);
        assert_eq!(h.scene_rx.try_recv().unwrap().value, json!(4));
    }

    #[tokio::test]
    async fn non_override_files_are_ignored() {
        let h = harness();
        h.store.insert("/project/levels/one.ts", "export default {}");
        assert_eq!(
            h.broker
                .handle_file_change(&PathBuf::from("/project/levels/one.ts"))
                .await,
            0
        );
    }

    #[tokio::test]
    async fn unknown_override_file_maps_to_relative_scene() {
        let mut h = harness();
        h.store.insert("/project/other.editor.json", r#"{"a": true}"#);
        h.broker
            .handle_file_change(&PathBuf::from("/project/other.editor.json"))
            .await;
        assert_eq!(h.scene_rx.try_recv().unwrap().scene_path.as_deref(), Some("other"));
    }

    // -----------------------------------------------------------------------
    // Clients
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn editor_message_reaches_scene_and_other_clients() {
        let mut h = harness();
        let mut sender = client(&h.broker, 1);
        let mut other = client(&h.broker, 2);
        h.broker
            .handle(BrokerInput::EditorMessage {
                client: 1,
                text: edit("speed", json!(8), true),
            })
            .await;

        assert_eq!(h.scene_rx.try_recv().unwrap().value, json!(8));
        assert_eq!(decode(other.try_recv().unwrap()).value, json!(8));
        assert!(sender.try_recv().is_err());
        assert_eq!(h.broker.stats().relayed, 1);
    }

    #[tokio::test]
    async fn closed_clients_are_pruned() {
        let h = harness();
        let _alive = client(&h.broker, 1);
        drop(client(&h.broker, 2));
        assert_eq!(h.broker.client_count(), 2);

        let sent = h
            .broker
            .broadcast(&LiveUpdate::property_update(SCENE, "speed", json!(1), true));
        assert_eq!(sent, 1);
        assert_eq!(h.broker.client_count(), 1);
    }

    #[tokio::test]
    async fn disconnect_removes_client() {
        let h = harness();
        let (tx, _rx) = mpsc::unbounded_channel();
        h.broker
            .handle(BrokerInput::ClientConnected {
                client: 3,
                sender: tx,
            })
            .await;
        assert_eq!(h.broker.client_count(), 1);
        h.broker.handle(BrokerInput::ClientDisconnected(3)).await;
        assert_eq!(h.broker.client_count(), 0);
    }

    #[tokio::test]
    async fn junk_and_pings_are_ignored() {
        let mut h = harness();
        for text in ["not json", r#"{"type":"ping"}"#, r#"{"type":"scene-reload","value":{}}"#] {
            h.broker
                .handle(BrokerInput::EditorMessage {
                    client: 1,
                    text: text.to_string(),
                })
                .await;
        }
        assert!(h.scene_rx.try_recv().is_err());
        assert_eq!(h.broker.stats().dropped, 3);
        assert_eq!(h.broker.pending_writes(), 0);
    }

    #[tokio::test]
    async fn run_flushes_when_inputs_close() {
        let h = harness();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(h.broker.clone().run(rx));
        tx.send(BrokerInput::EditorMessage {
            client: 1,
            text: edit("speed", json!(5), false),
        })
        .unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(on_disk(&h), json!({"speed": 5}));
    }
}
