// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integration tests for the HBase REST store using wiremock.

#![cfg(feature = "http")]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sensim_lib::backend::memory::{MemoryCatalog, MemoryPublisher, MemoryQueue};
use sensim_lib::backend::{Collaborators, HbaseRestConfig, HbaseRestStore, ReadingStore};
use sensim_lib::{CollaboratorError, DeviceId, SimulatorConfig, Supervisor};
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn store_for(server: &MockServer) -> HbaseRestStore {
    let config = HbaseRestConfig::new(server.uri(), "sensor_data", "cf");
    HbaseRestStore::new(config).unwrap()
}

// ============================================================================
// Connectivity
// ============================================================================

mod ping {
    use super::*;

    #[tokio::test]
    async fn succeeds_when_schema_exists() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sensor_data/schema"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "sensor_data"})))
            .expect(1)
            .mount(&server)
            .await;

        store_for(&server).ping().await.unwrap();
    }

    #[tokio::test]
    async fn missing_table_still_counts_as_reachable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sensor_data/schema"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(store_for(&server).ping().await.is_ok());
    }

    #[tokio::test]
    async fn server_error_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sensor_data/schema"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let err = store_for(&server).ping().await.unwrap_err();
        assert!(matches!(
            err,
            CollaboratorError::Rejected { status: 503, .. }
        ));
    }

    #[tokio::test]
    async fn closed_store_refuses_requests() {
        let server = MockServer::start().await;
        let store = store_for(&server);
        store.close().await.unwrap();

        assert!(matches!(
            store.ping().await,
            Err(CollaboratorError::Closed(_))
        ));
    }
}

// ============================================================================
// Writes
// ============================================================================

mod put {
    use super::*;

    #[tokio::test]
    async fn sends_base64_cell_set_to_row_url() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/sensor_data/13_1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let fields = HashMap::from([("temperature".to_string(), "{}".to_string())]);
        store_for(&server).put("13_1", &fields).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["Row"][0]["key"], "MTNfMQ==");
        assert_eq!(body["Row"][0]["Cell"][0]["column"], "Y2Y6dGVtcGVyYXR1cmU=");
        assert_eq!(body["Row"][0]["Cell"][0]["$"], "e30=");
    }

    #[tokio::test]
    async fn rejected_write_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500).set_body_string("region offline"))
            .mount(&server)
            .await;

        let fields = HashMap::from([("temperature".to_string(), "{}".to_string())]);
        let err = store_for(&server).put("13_1", &fields).await.unwrap_err();

        let CollaboratorError::Rejected { status, message } = err else {
            panic!("expected a rejection, got {err:?}");
        };
        assert_eq!(status, 500);
        assert_eq!(message, "region offline");
    }

    #[tokio::test]
    async fn slow_gateway_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let config = HbaseRestConfig::new(server.uri(), "sensor_data", "cf")
            .with_timeout(Duration::from_millis(50));
        let store = HbaseRestStore::new(config).unwrap();

        let err = store.put("13_1", &HashMap::new()).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Timeout(_)));
    }
}

// ============================================================================
// Read-back
// ============================================================================

mod read_back {
    use super::*;

    #[tokio::test]
    async fn get_row_decodes_cells() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sensor_data/13_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Row": [{
                    "key": "MTNfMQ==",
                    "Cell": [{
                        "column": "Y2Y6dGVtcGVyYXR1cmU=",
                        "$": "e30=",
                        "timestamp": 1
                    }]
                }]
            })))
            .mount(&server)
            .await;

        let cells = store_for(&server).get_row("13_1").await.unwrap().unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].family, "cf");
        assert_eq!(cells[0].qualifier, "temperature");
        assert_eq!(cells[0].value, "{}");
        assert_eq!(cells[0].timestamp, Some(1));
    }

    #[tokio::test]
    async fn missing_row_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(store_for(&server).get_row("13_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scan_device_uses_row_prefix_glob() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sensor_data/13_*"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Row": [
                    {"key": "MTNfMQ==", "Cell": []},
                    {"key": "MTNfMg==", "Cell": []}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let rows = store_for(&server)
            .scan_device(&DeviceId::new("13"))
            .await
            .unwrap();
        let keys: Vec<&str> = rows.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["13_1", "13_2"]);
    }
}

// ============================================================================
// End to end
// ============================================================================

#[tokio::test]
async fn supervisor_writes_active_device_readings() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sensor_data/schema"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let catalog = MemoryCatalog::new()
        .with_template("temperature", Some(r#"{"temperature":{"range":"-10~40"}}"#))
        .with_device("13", "probe", "temperature", true);
    let publisher = Arc::new(MemoryPublisher::new());
    let supervisor = Supervisor::new(
        SimulatorConfig::default().with_pop_timeout(Duration::from_millis(100)),
        Collaborators::new(
            Arc::new(catalog),
            Arc::new(MemoryQueue::new()),
            Arc::new(store_for(&server)),
            Arc::clone(&publisher) as _,
        ),
    );

    supervisor.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    supervisor.shutdown().await;

    let puts: Vec<_> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() == "PUT")
        .collect();
    assert_eq!(puts.len(), 1);
    assert!(puts[0].url.path().starts_with("/sensor_data/13_"));
    assert_eq!(publisher.messages_for("device_13").len(), 1);
}
