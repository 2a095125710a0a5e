// Integration tests for `AccountClient` using wiremock.

use serde_json::json;
use url::Url;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use aerlink_api::{AccountClient, AccountService, Error};

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup() -> (MockServer, AccountClient) {
    let server = MockServer::start().await;
    let url = Url::parse(&format!("{}/api.php/get/control", server.uri())).unwrap();
    let client = AccountClient::new(AccountService::custom(url, "1.2.2")).unwrap();
    (server, client)
}

fn control_payload() -> serde_json::Value {
    json!({
        "config": {
            "token": 1_234_567_890_i64,
            "pushToken": "channel-0123456789",
            "serverIP": "212.92.35.33",
            "serverPort": 8210,
            "hash": "ea4b71bd",
            "inst": [{
                "id": 1,
                "name": "First installation",
                "devices": [{
                    "id": 12_015_601_252_591_i64,
                    "name": "Living room",
                    "familyId": 4864,
                    "modelId": 550,
                    "widgets": [15, 3, 5, 7, 17, 9, 13],
                }],
            }],
        },
        "status": {
            "hash": "7398e787",
            "status": [
                {"deviceId": 12_015_601_252_591_i64, "uid": 1, "value": 0},
                {"deviceId": 12_015_601_252_591_i64, "uid": 2, "value": 4},
                {"deviceId": 12_015_601_252_591_i64, "uid": 9, "value": 210},
            ],
        },
    })
}

// ── Happy path ──────────────────────────────────────────────────────

#[tokio::test]
async fn resolve_parses_endpoint_token_and_catalog() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api.php/get/control"))
        .and(body_string_contains("username=admin"))
        .and(body_string_contains("version=1.2.2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(control_payload()))
        .mount(&server)
        .await;

    let session = client.resolve("admin", "password").await.unwrap();

    assert_eq!(session.server_host, "212.92.35.33");
    assert_eq!(session.server_port, 8210);
    assert_eq!(session.token, 1_234_567_890);
    assert_eq!(session.devices.len(), 1);
    assert_eq!(session.devices[0].id, "12015601252591");
    assert_eq!(session.devices[0].name, "Living room");
    assert_eq!(session.devices[0].model_id, Some(550));
    assert_eq!(session.snapshot.len(), 3);
    assert_eq!(session.snapshot[0].uid, 1);
    assert_eq!(session.snapshot[0].value, 0);
}

#[tokio::test]
async fn resolve_synthesizes_devices_seen_only_in_status() {
    let (server, client) = setup().await;

    let mut payload = control_payload();
    payload["status"]["status"]
        .as_array_mut()
        .unwrap()
        .push(json!({"deviceId": 777, "uid": 1, "value": 1}));

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(payload))
        .mount(&server)
        .await;

    let session = client.resolve("admin", "password").await.unwrap();

    let ghost = session.devices.iter().find(|d| d.id == "777").unwrap();
    assert_eq!(ghost.name, "Device 777");
    assert_eq!(ghost.widgets, vec![42]);
}

// ── Failure modes ───────────────────────────────────────────────────

#[tokio::test]
async fn resolve_maps_error_code_to_invalid_credentials() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errorCode": 5,
            "errorMessage": "Incorrect User name or password",
        })))
        .mount(&server)
        .await;

    let err = client.resolve("admin", "wrong").await.unwrap_err();
    assert!(matches!(err, Error::InvalidCredentials { ref message }
        if message == "Incorrect User name or password"));
    assert!(err.is_auth());
    assert!(!err.is_transient());
}

#[tokio::test]
async fn resolve_rejects_unparseable_body() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let err = client.resolve("admin", "password").await.unwrap_err();
    assert!(matches!(err, Error::MalformedResponse { .. }));
}

#[tokio::test]
async fn resolve_rejects_payload_without_config() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": {"status": []}})))
        .mount(&server)
        .await;

    let err = client.resolve("admin", "password").await.unwrap_err();
    assert!(matches!(err, Error::MalformedResponse { ref message }
        if message.contains("config")));
}

#[tokio::test]
async fn resolve_reports_unreachable_service() {
    // Nothing listens on this port; connection is refused immediately.
    let url = Url::parse("http://127.0.0.1:9/api.php/get/control").unwrap();
    let client = AccountClient::new(AccountService::custom(url, "1.2.2")).unwrap();

    let err = client.resolve("admin", "password").await.unwrap_err();
    assert!(matches!(err, Error::Unreachable(_)));
    assert!(err.is_transient());
}
