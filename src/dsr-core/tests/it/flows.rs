//! End-to-end registration and attestation against an in-process GMS.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use dsr_core::jwt::public_key_hash;
use dsr_core::{AttestationState, Csr, DeviceBindingError, Pkce, RegistrationState};
use dsr_crypto::{NonceTag, RootNonce};
use dsr_keystore::{KeyDescription, ATTESTATION_KEYPAIR_ALIAS, MTLS_CERT_ALIAS, MTLS_KEYPAIR_ALIAS};
use tokio::time::Instant;

use crate::support::{engine_with, software_keystore, FakeGms, ROOT_NONCE};

fn root() -> RootNonce {
    RootNonce::new(ROOT_NONCE.to_vec())
}

// =============================================================================
// Registration
// =============================================================================

#[tokio::test]
async fn registration_stores_certificate_and_signs_with_health_card() {
    let gms = Arc::new(FakeGms::default());
    let keystore = software_keystore();
    let engine = engine_with(gms.clone(), keystore.clone());
    let mut states = engine.registration_state();

    assert!(!engine.is_registered().unwrap());
    let outcome = engine.register().await.unwrap();

    assert!(engine.is_registered().unwrap());
    assert_eq!(keystore.certificate(MTLS_CERT_ALIAS).unwrap(), outcome.client_certificate);
    assert!(states.has_changed().unwrap());
    assert_eq!(
        *states.borrow_and_update(),
        RegistrationState::Registered(outcome.client_certificate.clone())
    );

    let parsed = outcome.registration_token.parse().unwrap();
    assert_eq!(parsed.header.alg, "BP256R1");
    assert!(parsed.verify_with_x5c().unwrap());

    let claims = parsed.payload;
    assert_eq!(claims["nonce"], STANDARD.encode(ROOT_NONCE));
    assert_eq!(outcome.nonce, STANDARD.encode(ROOT_NONCE));
    let integrity_nonce = URL_SAFE_NO_PAD.encode(root().derive(NonceTag::Integrity).as_bytes());
    assert_eq!(outcome.integrity_nonce, integrity_nonce);
    assert_eq!(claims["integrityVerdict"], format!("integrity.{integrity_nonce}"));
    assert_eq!(outcome.smartcard_nonce, root().derive(NonceTag::Smartcard));

    let csr = Csr::from_der(STANDARD.decode(claims["csr"].as_str().unwrap()).unwrap()).unwrap();
    assert!(csr.verify().unwrap());
    assert_eq!(
        csr.challenge_password().unwrap(),
        Some(STANDARD.encode(root().derive(NonceTag::CsrMtls).as_bytes()))
    );
    assert_eq!(claims["sub"], public_key_hash(&csr.public_key().unwrap()).unwrap());
    assert!(!claims["attestCertChain"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn registration_binds_mtls_key_to_derived_nonce() {
    let gms = Arc::new(FakeGms::default());
    let keystore = software_keystore();
    let engine = engine_with(gms, keystore.clone());
    engine.register().await.unwrap();

    let leaf = keystore.certificate(MTLS_KEYPAIR_ALIAS).unwrap();
    let description = KeyDescription::from_certificate(&leaf).unwrap().unwrap();
    assert_eq!(description.challenge(), root().derive(NonceTag::KeypairMtls).as_bytes());
}

#[tokio::test]
async fn registration_failure_stores_nothing() {
    let gms = Arc::new(FakeGms {
        register_error: Some(DeviceBindingError::remote("INVALID_TOKEN", "JWT signature invalid")),
        ..FakeGms::default()
    });
    let engine = engine_with(gms.clone(), software_keystore());

    let err = engine.register().await.unwrap_err();

    assert_eq!(err.to_string(), "Error: JWT signature invalid, ErrorCode: INVALID_TOKEN");
    assert!(!engine.is_registered().unwrap());
    assert_eq!(*engine.registration_state().borrow(), RegistrationState::Failed(err));
    assert_eq!(gms.registration_tokens.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_reregistration_leaves_device_unregistered() {
    let keystore = software_keystore();
    let gms = Arc::new(FakeGms::default());
    let engine = engine_with(gms.clone(), keystore.clone());
    engine.register().await.unwrap();
    let old_certificate = keystore.certificate(MTLS_CERT_ALIAS).unwrap();

    let rejecting = engine_with(
        Arc::new(FakeGms {
            register_error: Some(DeviceBindingError::remote("INVALID_TOKEN", "JWT signature invalid")),
            ..FakeGms::default()
        }),
        keystore.clone(),
    );
    rejecting.register().await.unwrap_err();

    assert!(!engine.is_registered().unwrap());
    assert_ne!(keystore.certificate(MTLS_KEYPAIR_ALIAS).unwrap(), old_certificate);

    let outcome = engine.enroll().await.unwrap();
    assert!(outcome.registration.is_some());
    let (token, _) = gms.attestations.lock().unwrap().last().cloned().unwrap();
    let parsed = token.parse().unwrap();
    assert_eq!(parsed.header.x5c, vec![STANDARD.encode(keystore.certificate(MTLS_CERT_ALIAS).unwrap())]);
    assert!(parsed.verify_with_x5c().unwrap());
}

// =============================================================================
// Attestation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn attestation_polls_until_token_is_issued() {
    let gms = Arc::new(FakeGms {
        pending_polls: 3,
        ..FakeGms::default()
    });
    let keystore = software_keystore();
    let engine = engine_with(gms.clone(), keystore.clone());
    engine.register().await.unwrap();

    let outcome = engine.attest().await.unwrap();

    assert_eq!(outcome.device_token.as_str(), "abc");
    assert_eq!(
        *engine.attestation_state().borrow(),
        AttestationState::Completed(outcome.device_token.clone())
    );

    assert_eq!(gms.poll_count(), 4);
    let polls = gms.polls.lock().unwrap();
    for pair in polls.windows(2) {
        assert!(pair[1].0 - pair[0].0 >= Duration::from_millis(2_000));
    }
    let (_, code, verifier) = &polls[0];
    assert_eq!(code, "auth-code");
    assert_eq!(verifier, outcome.pkce.verifier());

    let attestations = gms.attestations.lock().unwrap();
    let (token, challenge) = &attestations[0];
    assert_eq!(challenge, Pkce::from_verifier(verifier.clone()).challenge());

    let parsed = token.parse().unwrap();
    assert_eq!(parsed.header.alg, "ES256");
    assert_eq!(parsed.header.x5c, vec![STANDARD.encode(keystore.certificate(MTLS_CERT_ALIAS).unwrap())]);
    assert!(parsed.verify_with_x5c().unwrap());
    assert_eq!(parsed.payload["deviceAttributes"]["build"]["model"], "Pixel 8 Pro");

    let leaf = keystore.certificate(ATTESTATION_KEYPAIR_ALIAS).unwrap();
    let description = KeyDescription::from_certificate(&leaf).unwrap().unwrap();
    assert_eq!(description.challenge(), root().derive(NonceTag::AttestationChallenge).as_bytes());
}

#[tokio::test(start_paused = true)]
async fn attestation_gives_up_at_deadline() {
    let gms = Arc::new(FakeGms {
        pending_polls: u32::MAX,
        ..FakeGms::default()
    });
    let engine = engine_with(gms.clone(), software_keystore());
    engine.register().await.unwrap();

    let started = Instant::now();
    let err = engine.attest().await.unwrap_err();

    assert!(err.is_token_not_ready());
    assert!(started.elapsed() <= Duration::from_millis(62_000));
    assert_eq!(gms.poll_count(), 30);
    assert!(matches!(
        *engine.attestation_state().borrow(),
        AttestationState::Failed(DeviceBindingError::TokenNotReady { .. })
    ));
}

#[tokio::test]
async fn attestation_requires_registration() {
    let gms = Arc::new(FakeGms::default());
    let engine = engine_with(gms.clone(), software_keystore());

    let err = engine.attest().await.unwrap_err();

    assert!(matches!(err, DeviceBindingError::KeystoreUnavailable { .. }));
    assert!(gms.attestations.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn enroll_registers_once() {
    let gms = Arc::new(FakeGms::default());
    let engine = engine_with(gms.clone(), software_keystore());

    let first = engine.enroll().await.unwrap();
    let second = engine.enroll().await.unwrap();

    assert!(first.registration.is_some());
    assert!(second.registration.is_none());
    assert_eq!(gms.registration_tokens.lock().unwrap().len(), 1);
    assert_eq!(gms.attestations.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn reset_forgets_registration() {
    let engine = engine_with(Arc::new(FakeGms::default()), software_keystore());
    engine.register().await.unwrap();

    engine.reset().unwrap();

    assert!(!engine.is_registered().unwrap());
}
