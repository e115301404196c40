// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integration tests for the MQTT publisher using mockforge-mqtt.

#![cfg(feature = "mqtt")]

use std::sync::Arc;
use std::time::Duration;

use mockforge_mqtt::broker::MqttConfig;
use mockforge_mqtt::start_mqtt_server;
use parking_lot::Mutex;
use sensim_lib::CollaboratorError;
use sensim_lib::backend::{MqttPublisher, MqttPublisherConfig, ReadingPublisher};
use tokio::time::sleep;

/// Helper to find an available port for testing.
fn get_test_port() -> u16 {
    use std::sync::atomic::{AtomicU16, Ordering};
    static PORT_COUNTER: AtomicU16 = AtomicU16::new(18950);
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Starts a mock MQTT broker on the given port.
async fn start_mock_broker(port: u16) {
    let config = MqttConfig {
        port,
        host: "127.0.0.1".to_string(),
        ..Default::default()
    };

    tokio::spawn(async move {
        let _ = start_mqtt_server(config).await;
    });

    sleep(Duration::from_millis(500)).await;
}

fn publisher_for(port: u16) -> MqttPublisher {
    let config = MqttPublisherConfig::from_url(&format!("mqtt://127.0.0.1:{port}"))
        .unwrap()
        .with_connection_timeout(Duration::from_secs(5));
    MqttPublisher::connect(config).unwrap()
}

// ============================================================================
// Connection
// ============================================================================

mod connection {
    use super::*;

    #[tokio::test]
    async fn ping_waits_for_broker() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let publisher = publisher_for(port);
        publisher.ping().await.unwrap();
        assert!(publisher.is_connected());
    }

    #[tokio::test]
    async fn ping_fails_without_broker() {
        let port = get_test_port();
        let config = MqttPublisherConfig::new("127.0.0.1")
            .with_port(port)
            .with_connection_timeout(Duration::from_millis(300));
        let publisher = MqttPublisher::connect(config).unwrap();

        let err = publisher.ping().await.unwrap_err();
        assert!(matches!(err, CollaboratorError::ConnectionFailed(_)));
        assert!(!publisher.is_connected());
    }

    #[tokio::test]
    async fn tcp_scheme_is_accepted() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let config = MqttPublisherConfig::from_url(&format!("tcp://127.0.0.1:{port}")).unwrap();
        let publisher = MqttPublisher::connect(config).unwrap();
        assert!(publisher.ping().await.is_ok());
    }
}

// ============================================================================
// Publishing
// ============================================================================

mod publishing {
    use super::*;

    #[tokio::test]
    async fn publish_invokes_completion_callback() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let publisher = publisher_for(port);
        publisher.ping().await.unwrap();

        let outcome: Arc<Mutex<Option<bool>>> = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&outcome);
        publisher
            .publish(
                "device_13",
                r#"{"deviceId":"13","deviceType":"temperature","timestamp":1,"data":{}}"#,
                Some(Box::new(move |result: Result<(), CollaboratorError>| {
                    *seen.lock() = Some(result.is_ok());
                })),
            )
            .await
            .unwrap();

        assert_eq!(*outcome.lock(), Some(true));
    }

    #[tokio::test]
    async fn publish_after_close_is_refused() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let publisher = publisher_for(port);
        publisher.ping().await.unwrap();
        publisher.close().await.unwrap();

        assert!(matches!(
            publisher.publish("device_13", "{}", None).await,
            Err(CollaboratorError::Closed(_))
        ));
        assert!(matches!(
            publisher.ping().await,
            Err(CollaboratorError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let publisher = publisher_for(port);
        publisher.ping().await.unwrap();
        publisher.close().await.unwrap();
        publisher.close().await.unwrap();
    }
}
