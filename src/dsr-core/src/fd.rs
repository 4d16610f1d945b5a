//! Prescription service (FD) client.
//!
//! FD is reached over mutual TLS only and authorizes each request with the
//! device token in `X-Device-Token`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::channel::{MtlsChannelManager, SecureChannelFactory};
use crate::config::DeviceBindingConfig;
use crate::error::DeviceBindingError;
use crate::gms::DeviceToken;
use crate::http::{read_json, remote_error};

/// Header carrying the device token.
pub const DEVICE_TOKEN_HEADER: &str = "X-Device-Token";

const PRESCRIPTIONS_PATH: &str = "api/v1/erezept";

/// Patient or prescriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    /// Display name.
    pub name: String,
    /// Postal address.
    pub address: String,
    /// Phone or mail.
    pub contact: String,
}

/// What was prescribed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Medication {
    /// Drug name.
    pub medication: String,
    /// Strength, e.g. `400 mg`.
    pub strength: String,
    /// Package size.
    pub pack_size: String,
    /// How to take it.
    pub dosage_instruction: String,
}

/// One prescription of the insurant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prescription {
    /// Prescription id.
    pub id: String,
    /// Issue date as sent by FD.
    pub issued_at: String,
    /// Patient.
    pub patient: Party,
    /// Prescriber.
    pub doctor: Party,
    /// Prescribed medication.
    pub prescription: Medication,
}

/// FD operations.
#[async_trait]
pub trait FdApi: Send + Sync {
    /// Prescriptions visible to the holder of `token`.
    async fn prescriptions(&self, token: &DeviceToken) -> Result<Vec<Prescription>, DeviceBindingError>;
}

/// HTTP implementation of [`FdApi`].
pub struct FdClient {
    mtls: MtlsChannelManager,
}

impl FdClient {
    /// Client for the configured FD URL.
    pub fn new(config: &DeviceBindingConfig, factory: Arc<dyn SecureChannelFactory>) -> Result<Self, DeviceBindingError> {
        Ok(Self {
            mtls: MtlsChannelManager::new(&config.fd_url, &config.authorization, config.retry, factory)?,
        })
    }

    /// The mutual TLS channel.
    pub fn channel(&self) -> &MtlsChannelManager {
        &self.mtls
    }
}

impl fmt::Debug for FdClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdClient").field("mtls", &self.mtls).finish()
    }
}

#[async_trait]
impl FdApi for FdClient {
    #[instrument(skip_all)]
    async fn prescriptions(&self, token: &DeviceToken) -> Result<Vec<Prescription>, DeviceBindingError> {
        let stub = self.mtls.switch_to_mtls_if_necessary()?;
        let request = stub
            .get(PRESCRIPTIONS_PATH)
            .header(ACCEPT, "application/json")
            .header(DEVICE_TOKEN_HEADER, token.as_str());
        let response = stub.send(request).await?;
        if !response.status().is_success() {
            return Err(remote_error(response).await);
        }

        let prescriptions: Vec<Prescription> = read_json(response).await?;
        info!(count = prescriptions.len(), "Fetched prescriptions");
        Ok(prescriptions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelState;
    use crate::http::AUTHORIZATION_HEADER;
    use mockito::Server;
    use reqwest::Client;

    struct PlainFactory;

    impl SecureChannelFactory for PlainFactory {
        fn server_tls(&self) -> Result<Client, DeviceBindingError> {
            Ok(Client::new())
        }

        fn mutual_tls(&self) -> Result<Client, DeviceBindingError> {
            Ok(Client::new())
        }
    }

    const BODY: &str = r#"[{
        "id": "160.000.100.000.001.05",
        "issuedAt": "2024-03-01",
        "patient": {"name": "Zacharias Zebra", "address": "Teststr. 1, Berlin", "contact": "0301234"},
        "doctor": {"name": "Dr. Test", "address": "Praxisweg 2, Berlin", "contact": "0305678"},
        "prescription": {"medication": "Ibuprofen", "strength": "400 mg", "packSize": "N1", "dosageInstruction": "1-0-1"}
    }]"#;

    #[tokio::test]
    async fn test_prescriptions_send_device_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/erezept")
            .match_header(DEVICE_TOKEN_HEADER, "device-token")
            .match_header(AUTHORIZATION_HEADER, mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(BODY)
            .create_async()
            .await;

        let config = DeviceBindingConfig::default().with_base_url(&server.url());
        let client = FdClient::new(&config, Arc::new(PlainFactory)).unwrap();
        let list = client.prescriptions(&DeviceToken::new("device-token")).await.unwrap();

        mock.assert_async().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].prescription.pack_size, "N1");
        assert_eq!(list[0].doctor.name, "Dr. Test");
        assert_eq!(client.channel().state().unwrap(), ChannelState::MutualTls);
    }

    #[tokio::test]
    async fn test_prescriptions_error_body() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/v1/erezept")
            .with_status(403)
            .with_body(r#"{"errorCode":"TOKEN_EXPIRED","description":"Device token expired"}"#)
            .create_async()
            .await;

        let config = DeviceBindingConfig::default().with_base_url(&server.url());
        let client = FdClient::new(&config, Arc::new(PlainFactory)).unwrap();
        let err = client.prescriptions(&DeviceToken::new("old")).await.unwrap_err();
        assert_eq!(err, DeviceBindingError::remote("TOKEN_EXPIRED", "Device token expired"));
    }
}
