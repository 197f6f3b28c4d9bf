use hub_bridge::{DispatchOutcome, DropReason, Hub};
use hub_shared::memory::{InMemoryStore, RecordingTransport};
use hub_shared::{
    decode_topic, ClaimRequest, DeviceRepository, DeviceStatus, MessageKind, OutboundCommand, QoS,
};
use std::sync::Arc;

struct Pipeline {
    store: Arc<InMemoryStore>,
    transport: Arc<RecordingTransport>,
    hub: Hub,
}

fn pipeline() -> Pipeline {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    let hub = Hub::new(store.clone(), transport.clone(), QoS::AtLeastOnce);

    Pipeline {
        store,
        transport,
        hub,
    }
}

#[tokio::test]
async fn test_claim_ingest_and_command_round_trip() {
    let p = pipeline();
    let location = p.store.add_location(42, "Plant 1").await;

    let device = p
        .hub
        .devices
        .claim_device(
            42,
            ClaimRequest {
                location_id: location.id,
                mac_address: "a4:cf:12:00:00:01".to_string(),
                proof_of_possession: "printed-on-label".to_string(),
                name: "Boiler room".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(device.status, DeviceStatus::Offline);

    let base = format!("customer/42/location/{}/device/{}", location.id, device.id);

    // 设备上线
    let outcome = p
        .hub
        .dispatcher
        .dispatch(&format!("{}/status", base), br#"{"state":"online"}"#)
        .await;
    assert!(matches!(outcome, DispatchOutcome::StatusUpdated { status: DeviceStatus::Online, .. }));

    // 三条遥测，其中一条没有时间戳
    let outcome = p
        .hub
        .dispatcher
        .dispatch(
            &format!("{}/telemetry", base),
            br#"[{"timestamp":1700000000000,"temperature":61.0},
                 {"temperature":62.5,"humidity":30.0},
                 {"timestamp":1700000120000,"pressure":1.2}]"#,
        )
        .await;
    assert_eq!(
        outcome,
        DispatchOutcome::TelemetryStored {
            device_id: device.id,
            samples: 3,
            skipped: 0
        }
    );

    let history = p
        .hub
        .devices
        .device_telemetry(42, device.id, Some(1_600_000_000_000), Some(i64::MAX))
        .await
        .unwrap();
    assert_eq!(history.len(), 3);

    // 命令下发到规范主题
    p.hub
        .devices
        .send_command(42, device.id, &OutboundCommand::new("BLINK").with_field("times", serde_json::json!(3)))
        .await
        .unwrap();

    let published = p.transport.published().await;
    assert_eq!(published.len(), 1);
    let key = decode_topic(&published[0].topic).unwrap();
    assert_eq!(key.kind, MessageKind::Command);
    assert_eq!(key.tenant_id(), Some(42));
    assert_eq!(key.to_topic().unwrap(), format!("{}/cmd", base));

    // 设备在线时不能被重新认领
    let err = p
        .hub
        .devices
        .claim_device(
            42,
            ClaimRequest {
                location_id: location.id,
                mac_address: "A4:CF:12:00:00:01".to_string(),
                proof_of_possession: "printed-on-label".to_string(),
                name: "Other".to_string(),
            },
        )
        .await;
    assert!(err.is_err());
    let stored = p.store.find_device(device.id).await.unwrap().unwrap();
    assert_eq!(stored.name.as_deref(), Some("Boiler room"));
}

#[tokio::test]
async fn test_hostile_input_never_stops_ingestion() {
    let p = pipeline();
    let location = p.store.add_location(1, "Site").await;
    let device = p
        .hub
        .devices
        .claim_device(
            1,
            ClaimRequest {
                location_id: location.id,
                mac_address: "00:11:22:33:44:55".to_string(),
                proof_of_possession: "pop".to_string(),
                name: "Door".to_string(),
            },
        )
        .await
        .unwrap();
    let telemetry_topic = format!("customer/1/location/{}/device/{}/telemetry", location.id, device.id);

    let hostile: Vec<(String, Vec<u8>)> = vec![
        ("".to_string(), b"[]".to_vec()),
        ("customer/1/location/x/device/1/telemetry".to_string(), b"[]".to_vec()),
        (telemetry_topic.clone(), vec![0xde, 0xad, 0xbe, 0xef]),
        (telemetry_topic.clone(), b"{\"temperature\": 1}".to_vec()),
        (format!("customer/2/location/{}/device/{}/telemetry", location.id, device.id), b"[{}]".to_vec()),
        (format!("customer/1/location/{}/device/{}/status", location.id, device.id), b"sleeping".to_vec()),
    ];

    // 并发投递，模拟多个传输层工作线程
    let mut handles = Vec::new();
    for (topic, payload) in hostile {
        let dispatcher = p.hub.dispatcher.clone();
        handles.push(tokio::spawn(async move { dispatcher.dispatch(&topic, &payload).await }));
    }
    for handle in handles {
        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Dropped(_)));
    }

    assert!(p.store.samples().await.is_empty());
    assert_eq!(
        p.store.find_device(device.id).await.unwrap().unwrap().status,
        DeviceStatus::Offline
    );

    // 之后的正常消息仍被处理
    let outcome = p.hub.dispatcher.dispatch(&telemetry_topic, br#"[{"temperature": 20.0}]"#).await;
    assert!(matches!(outcome, DispatchOutcome::TelemetryStored { samples: 1, .. }));

    assert_eq!(
        p.hub.dispatcher.dispatch("smart-led/device/00:11:22:33:44:55/cmd", b"{}").await,
        DispatchOutcome::CommandIgnored
    );
    assert_eq!(
        p.hub.dispatcher.dispatch("smart-led/device/zz/status", b"online").await,
        DispatchOutcome::Dropped(DropReason::DecodeFailed)
    );
}
