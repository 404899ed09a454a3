//! Device admission and the device listing, through a running hub.

mod common;

use ttyhub_core::protocol::messages::{HeartbeatMessage, RegisterCode};
use ttyhub_core::Frame;
use ttyhub_server::domain::{DeviceKey, ServerConfig};
use ttyhub_server::infrastructure::Hub;

use common::{loopback_config, start_hub, FakeDevice};

#[tokio::test]
async fn test_listing_groups_devices_by_namespace() {
    // Arrange
    let hub = start_hub().await;
    let _a = FakeDevice::online(&hub, "lab", "gw-1").await;
    let _b = FakeDevice::online(&hub, "lab", "gw-2").await;
    let _c = FakeDevice::online(&hub, "", "edge").await;

    // Act
    let lab = hub.registry().list_group("lab");
    let snapshot = hub.registry().snapshot();

    // Assert
    let mut ids: Vec<_> = lab.iter().map(|d| d.id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, ["gw-1", "gw-2"]);
    assert_eq!(snapshot.len(), 2);
    assert_eq!(hub.registry().device_count(), 3);
    assert_eq!(lab[0].description, format!("fake {}", lab[0].id));
    hub.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_uptime_shows_in_listing() {
    let hub = start_hub().await;
    let mut device = FakeDevice::online(&hub, "", "gw").await;

    device
        .send(Frame::Heartbeat(HeartbeatMessage { uptime: Some(86_400) }))
        .await;
    assert_eq!(
        device.recv().await,
        Frame::Heartbeat(HeartbeatMessage { uptime: None })
    );

    let summary = hub.registry().summary(&DeviceKey::new("", "gw")).unwrap();
    assert_eq!(summary.uptime, 86_400);
    hub.shutdown().await;
}

#[tokio::test]
async fn test_token_is_enforced_when_configured() {
    // Arrange
    let config = ServerConfig {
        device_token: Some("s3cret".to_string()),
        ..loopback_config()
    };
    let hub = Hub::start(config).await.unwrap();

    // Act
    let mut wrong = FakeDevice::dial(&hub, "", "gw", Some("guess")).await;
    let mut right = FakeDevice::dial(&hub, "", "gw2", Some("s3cret")).await;

    // Assert
    let Frame::RegisterAck(ack) = wrong.recv().await else {
        panic!("expected register ack");
    };
    assert_eq!(ack.code, RegisterCode::InvalidToken);
    let Frame::RegisterAck(ack) = right.recv().await else {
        panic!("expected register ack");
    };
    assert_eq!(ack.code, RegisterCode::Accepted);
    assert!(!hub.registry().contains(&DeviceKey::new("", "gw")));
    hub.shutdown().await;
}

#[tokio::test]
async fn test_invalid_device_id_is_refused() {
    let hub = start_hub().await;

    let mut device = FakeDevice::dial(&hub, "", "has space", None).await;

    let Frame::RegisterAck(ack) = device.recv().await else {
        panic!("expected register ack");
    };
    assert_eq!(ack.code, RegisterCode::InvalidId);
    hub.shutdown().await;
}

#[tokio::test]
async fn test_eviction_removes_device_from_listing() {
    let hub = start_hub().await;
    let mut device = FakeDevice::online(&hub, "", "gw").await;

    hub.broker()
        .evict_device(DeviceKey::new("", "gw"), "maintenance")
        .await
        .unwrap();

    let frames = device.drain_until_closed().await;
    assert!(matches!(frames.first(), Some(Frame::Announce(a)) if a.reason == "maintenance"));
    assert!(!hub.registry().contains(&DeviceKey::new("", "gw")));
    hub.shutdown().await;
}
