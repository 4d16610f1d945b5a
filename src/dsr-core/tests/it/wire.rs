//! Engine over HTTP against mockito servers.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use dsr_core::{
    CredentialSigner, DeviceBindingConfig, DeviceBindingEngine, DeviceBindingError, FixedIntegrityAttestor,
    MockVirtualHealthCardSigner, PollingPolicy, StaticDeviceAttributes,
};
use mockito::{Matcher, Server, ServerGuard};

use crate::support::{software_keystore, PlainFactory, ROOT_NONCE};

fn engine(server: &ServerGuard) -> DeviceBindingEngine {
    let mut config = DeviceBindingConfig::default().with_base_url(&server.url());
    config.polling = PollingPolicy {
        interval: Duration::from_millis(10),
        deadline: Duration::from_millis(500),
    };
    DeviceBindingEngine::with_channel_factory(
        config,
        software_keystore(),
        Arc::new(FixedIntegrityAttestor::new("integrity")),
        Arc::new(StaticDeviceAttributes::default()),
        Arc::new(PlainFactory),
    )
    .unwrap()
}

async fn mock_registration(server: &mut ServerGuard) {
    // Any parseable certificate stands in for the GMS-issued one.
    let cert = MockVirtualHealthCardSigner::new().unwrap().certificate().unwrap();
    server
        .mock("GET", "/nonce")
        .match_header("x-authorization", "FsMxoUGiJZowZ99lg7AfFYZl9/oEZ8jpMvCuMDhbAKE=")
        .with_status(200)
        .with_body(URL_SAFE_NO_PAD.encode(ROOT_NONCE))
        .create_async()
        .await;
    server
        .mock("POST", "/register-device")
        .match_body(Matcher::Regex(r#"^\{"token":"[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+"\}$"#.into()))
        .with_status(200)
        .with_body(serde_json::json!({ "cert": STANDARD.encode(cert) }).to_string())
        .create_async()
        .await;
}

#[tokio::test]
async fn enroll_over_http() {
    let mut server = Server::new_async().await;
    mock_registration(&mut server).await;
    let attestation = server
        .mock("POST", "/device-attestation")
        .match_body(Matcher::PartialJson(serde_json::json!({})))
        .with_status(200)
        .with_body("auth-code")
        .create_async()
        .await;
    let exchange = server
        .mock("POST", "/device-token")
        .match_body(Matcher::UrlEncoded("code".into(), "auth-code".into()))
        .with_status(200)
        .with_body(r#"{"token":"abc"}"#)
        .create_async()
        .await;
    let prescriptions = server
        .mock("GET", "/api/v1/erezept")
        .match_header("x-device-token", "abc")
        .with_status(200)
        .with_body("[]")
        .create_async()
        .await;

    let engine = engine(&server);
    let outcome = engine.enroll().await.unwrap();
    let list = engine.prescriptions(&outcome.attestation.device_token).await.unwrap();

    assert!(outcome.registration.is_some());
    assert!(engine.is_registered().unwrap());
    assert_eq!(outcome.attestation.device_token.as_str(), "abc");
    assert!(list.is_empty());
    attestation.assert_async().await;
    exchange.assert_async().await;
    prescriptions.assert_async().await;
}

#[tokio::test]
async fn pending_token_until_deadline() {
    let mut server = Server::new_async().await;
    mock_registration(&mut server).await;
    server
        .mock("POST", "/device-attestation")
        .with_status(200)
        .with_body("auth-code")
        .create_async()
        .await;
    server
        .mock("POST", "/device-token")
        .with_status(202)
        .create_async()
        .await;

    let err = engine(&server).enroll().await.unwrap_err();
    assert!(matches!(err, DeviceBindingError::TokenNotReady { .. }));
    assert_eq!(err.code(), Some("202"));
}

#[tokio::test]
async fn attestation_error_body_is_surfaced() {
    let mut server = Server::new_async().await;
    mock_registration(&mut server).await;
    server
        .mock("POST", "/device-attestation")
        .with_status(401)
        .with_body(r#"{"errorCode":"DEVICE_UNKNOWN","description":"Device not registered"}"#)
        .create_async()
        .await;

    let err = engine(&server).enroll().await.unwrap_err();
    assert_eq!(err, DeviceBindingError::remote("DEVICE_UNKNOWN", "Device not registered"));
}

#[tokio::test]
async fn device_list_and_delete() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/device-registrations")
        .match_query(Matcher::UrlEncoded("userIdentifier".into(), "X764228532".into()))
        .with_status(200)
        .with_body(
            r#"[{"userIdentifier":"X764228532","deviceIdentifier":"dev-1","deviceType":"android","createdAt":"2024-05-01"}]"#,
        )
        .create_async()
        .await;
    let delete = server
        .mock("DELETE", "/device-registrations")
        .match_query(Matcher::UrlEncoded("deviceIdentifier".into(), "dev-1".into()))
        .with_status(200)
        .create_async()
        .await;

    let engine = engine(&server);
    let devices = engine.list_devices(None).await.unwrap();
    engine.delete_device(None, &devices[0].device_identifier).await.unwrap();

    assert_eq!(devices[0].device_type, "android");
    delete.assert_async().await;
}
