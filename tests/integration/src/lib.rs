//! Integration tests for the caucase daemon.
//!
//! These tests run the whole daemon in-process on ephemeral ports and talk
//! to it over plain HTTP and over HTTPS with client certificates.

// Allow unwrap() in tests - panics are acceptable for test assertions
#![allow(clippy::disallowed_methods)]

use std::time::Duration;

use anyhow::{bail, Context, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use reqwest::header::{CONTENT_LOCATION, CONTENT_TYPE, LOCATION};
use reqwest::{Certificate, Client, Identity, Response, StatusCode};
use serde::Deserialize;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use caucase_server::{Daemon, DaemonConfig, ListenerState};

pub const CSR_CONTENT_TYPE: &str = "application/pkcs10";
pub const JSON_CONTENT_TYPE: &str = "application/json";

// ============================================================================
// API Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PendingCsr {
    pub id: u64,
    pub csr: String,
}

// ============================================================================
// Test Server
// ============================================================================

/// A daemon running in the test process, with its own data directory.
pub struct TestServer {
    pub http_url: String,
    pub https_url: String,
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
    data_dir: TempDir,
}

impl TestServer {
    /// Start a server in a fresh data directory.
    pub async fn start() -> Result<Self> {
        Self::start_in(TempDir::new().context("Failed to create temp dir")?).await
    }

    /// Start a server on an existing data directory.
    pub async fn start_in(data_dir: TempDir) -> Result<Self> {
        let config = DaemonConfig::new(
            data_dir.path().join("caucase.sqlite"),
            data_dir.path().join("server.key.pem"),
            "127.0.0.1:0",
        )?;
        let daemon = Daemon::bind(config).await?;
        let http_url = format!("http://{}", daemon.http_addr()?);
        let https_url = format!("https://{}", daemon.https_addr()?);
        let (mut http_state, mut https_state) = daemon.listener_states();

        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(daemon.run(shutdown));

        tokio::time::timeout(Duration::from_secs(5), async {
            http_state.wait_for(|s| *s == ListenerState::Serving).await?;
            https_state.wait_for(|s| *s == ListenerState::Serving).await?;
            Ok::<_, watch::error::RecvError>(())
        })
        .await
        .context("Server failed to start within 5 seconds")??;

        Ok(Self {
            http_url,
            https_url,
            stop,
            task,
            data_dir,
        })
    }

    /// Stop the server, handing back its data directory.
    pub async fn stop(self) -> Result<TempDir> {
        self.stop.send_replace(true);
        self.task.await??;
        Ok(self.data_dir)
    }

    /// Client for the plain HTTP listener.
    pub fn http(&self) -> CaucaseClient {
        CaucaseClient::new(Client::new(), &self.http_url)
    }

    /// Client for the HTTPS listener trusting the service CA, optionally
    /// presenting `identity` (key then certificate PEM).
    pub async fn https(&self, identity: Option<&str>) -> Result<CaucaseClient> {
        let ca = self.http().get_text("/cas/crt/ca.crt.pem").await?;
        let mut builder = Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(Certificate::from_pem(ca.as_bytes())?)
            .timeout(Duration::from_secs(10));
        if let Some(pem) = identity {
            builder = builder.identity(Identity::from_pem(pem.as_bytes())?);
        }
        Ok(CaucaseClient::new(builder.build()?, &self.https_url))
    }
}

// ============================================================================
// Test Client
// ============================================================================

/// HTTP client for the caucase API.
pub struct CaucaseClient {
    client: Client,
    base_url: String,
}

impl CaucaseClient {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get(&self, path: &str) -> Result<Response> {
        Ok(self.client.get(self.url(path)).send().await?)
    }

    pub async fn get_text(&self, path: &str) -> Result<String> {
        let resp = self.get(path).await?;
        if !resp.status().is_success() {
            bail!("GET {path} failed: {}", resp.status());
        }
        Ok(resp.text().await?)
    }

    pub async fn put(&self, path: &str, content_type: &str, body: String) -> Result<Response> {
        Ok(self
            .client
            .put(self.url(path))
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await?)
    }

    /// Submit a CSR, returning its id and the certificate path when it was
    /// approved on the spot.
    pub async fn submit_csr(&self, authority: &str, csr: &str) -> Result<(u64, Option<String>)> {
        let resp = self
            .put(&format!("/{authority}/csr"), CSR_CONTENT_TYPE, csr.to_owned())
            .await?;
        if resp.status() != StatusCode::CREATED {
            bail!("CSR submission failed: {}", resp.status());
        }
        let id = resp.headers()[LOCATION].to_str()?.parse()?;
        let crt = resp
            .headers()
            .get(CONTENT_LOCATION)
            .map(|v| v.to_str().map(str::to_owned))
            .transpose()?;
        Ok((id, crt))
    }

    /// Put a signed or unsigned request.
    pub async fn put_json<T: serde::Serialize>(&self, path: &str, body: &T) -> Result<Response> {
        self.put(path, JSON_CONTENT_TYPE, serde_json::to_string(body)?)
            .await
    }
}

/// A fresh key and a CSR for `common_name`.
pub fn new_request(common_name: &str) -> (KeyPair, String) {
    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
    let csr = csr_for(&key, common_name);
    (key, csr)
}

pub fn csr_for(key: &KeyPair, common_name: &str) -> String {
    let mut params = CertificateParams::new(vec![format!("{common_name}.example.com")]).unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.serialize_request(key).unwrap().pem().unwrap()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use caucase_crypto::PrivateKey;
    use caucase_http::{RenewPayload, RevokeCrtPayload, RevokeSerialPayload, SignedRequest};

    use super::*;

    #[tokio::test]
    async fn test_public_reads_over_http() {
        let server = TestServer::start().await.unwrap();
        let client = server.http();

        for authority in ["cau", "cas"] {
            let resp = client
                .get(&format!("/{authority}/crt/ca.crt.pem"))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(resp.headers()[CONTENT_TYPE], "application/pkix-cert");

            let chain: Vec<String> = client
                .get(&format!("/{authority}/crt/ca.crt.json"))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            assert_eq!(chain.len(), 1);

            let resp = client.get(&format!("/{authority}/crl")).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(resp.headers()[CONTENT_TYPE], "application/pkix-crl");
        }

        let resp = client.get("/cas/unknown").await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_service_enrollment_lifecycle() {
        let server = TestServer::start().await.unwrap();
        let http = server.http();

        // The first user is approved automatically.
        let (admin_key, admin_csr) = new_request("admin");
        let (_, admin_crt_path) = http.submit_csr("cau", &admin_csr).await.unwrap();
        let admin_crt = http.get_text(&admin_crt_path.unwrap()).await.unwrap();
        let admin_identity = format!("{}{}", admin_key.serialize_pem(), admin_crt);

        // Services wait for an operator.
        let (service_key, service_csr) = new_request("service");
        let (csr_id, crt_path) = http.submit_csr("cas", &service_csr).await.unwrap();
        assert!(crt_path.is_none());
        assert_eq!(
            http.get_text(&format!("/cas/csr/{csr_id}")).await.unwrap(),
            service_csr
        );
        // The server's own certificate already holds a serial equal to this
        // id; the pending request still has no certificate.
        let resp = http.get(&format!("/cas/crt/{csr_id}")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        // Operator-only routes look absent without a user certificate.
        let resp = http.get("/cas/csr").await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let anonymous = server.https(None).await.unwrap();
        let resp = anonymous
            .put(&format!("/cas/crt/{csr_id}"), CSR_CONTENT_TYPE, String::new())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let admin = server.https(Some(&admin_identity)).await.unwrap();
        let pending: Vec<PendingCsr> = admin.get("/cas/csr").await.unwrap().json().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, csr_id);
        assert_eq!(pending[0].csr, service_csr);

        let resp = admin
            .put(&format!("/cas/crt/{csr_id}"), CSR_CONTENT_TYPE, String::new())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let crt_path = resp.headers()[CONTENT_LOCATION].to_str().unwrap().to_owned();
        assert_eq!(crt_path, format!("/cas/crt/{csr_id}"));
        let service_crt = http.get_text(&crt_path).await.unwrap();
        let info = caucase_ca::x509::parse_certificate(&service_crt).unwrap();
        assert_eq!(info.common_name.as_deref(), Some("service"));

        // Renewal keeps the key and retires the old certificate.
        let signing_key = PrivateKey::from_pkcs8_pem(&service_key.serialize_pem()).unwrap();
        let renewal = SignedRequest::sign(
            &signing_key,
            &RenewPayload {
                crt_pem: service_crt.clone(),
                renew_csr_pem: csr_for(&service_key, "service"),
            },
            "sha256",
        )
        .unwrap();
        let resp = http.put_json("/cas/crt/renew", &renewal).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let renewed_crt = resp.text().await.unwrap();
        assert_ne!(renewed_crt, service_crt);

        let old_serial = caucase_ca::x509::parse_certificate(&service_crt).unwrap().serial;
        let crl = http.get_text("/cas/crl").await.unwrap();
        assert!(caucase_ca::x509::crl_serials(&crl)
            .unwrap()
            .contains(&old_serial));

        // The holder revokes its own certificate.
        let revocation = SignedRequest::sign(
            &signing_key,
            &RevokeCrtPayload {
                revoke_crt_pem: renewed_crt.clone(),
            },
            "sha256",
        )
        .unwrap();
        let resp = http.put_json("/cas/crt/revoke", &revocation).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let renewed_serial = caucase_ca::x509::parse_certificate(&renewed_crt).unwrap().serial;
        let crl = http.get_text("/cas/crl").await.unwrap();
        assert!(caucase_ca::x509::crl_serials(&crl)
            .unwrap()
            .contains(&renewed_serial));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_revoked_operator_loses_access() {
        let server = TestServer::start().await.unwrap();
        let http = server.http();

        let (admin_key, admin_csr) = new_request("admin");
        let (_, crt_path) = http.submit_csr("cau", &admin_csr).await.unwrap();
        let admin_crt = http.get_text(&crt_path.unwrap()).await.unwrap();
        let admin = server
            .https(Some(&format!("{}{}", admin_key.serialize_pem(), admin_crt)))
            .await
            .unwrap();
        assert_eq!(admin.get("/cau/csr").await.unwrap().status(), StatusCode::OK);

        // Serial revocation needs an operator.
        let serial = caucase_ca::x509::parse_certificate(&admin_crt).unwrap().serial;
        let request = SignedRequest::unsigned(&RevokeSerialPayload {
            revoke_serial: serial,
        })
        .unwrap();
        let resp = http.put_json("/cau/crt/revoke", &request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = admin.put_json("/cau/crt/revoke", &request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        // The handshake still succeeds, the application refuses.
        let admin = server
            .https(Some(&format!("{}{}", admin_key.serialize_pem(), admin_crt)))
            .await
            .unwrap();
        assert_eq!(
            admin.get("/cau/csr").await.unwrap().status(),
            StatusCode::NOT_FOUND
        );

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_keeps_authorities() {
        let server = TestServer::start().await.unwrap();
        let cau_ca = server.http().get_text("/cau/crt/ca.crt.pem").await.unwrap();
        let cas_ca = server.http().get_text("/cas/crt/ca.crt.pem").await.unwrap();
        let (_, csr) = new_request("pending");
        let (csr_id, _) = server.http().submit_csr("cas", &csr).await.unwrap();
        let data_dir = server.stop().await.unwrap();

        let server = TestServer::start_in(data_dir).await.unwrap();
        let http = server.http();
        assert_eq!(http.get_text("/cau/crt/ca.crt.pem").await.unwrap(), cau_ca);
        assert_eq!(http.get_text("/cas/crt/ca.crt.pem").await.unwrap(), cas_ca);
        assert_eq!(http.get_text(&format!("/cas/csr/{csr_id}")).await.unwrap(), csr);

        // The HTTPS listener still presents a certificate the service CA vouches for.
        let anonymous = server.https(None).await.unwrap();
        assert_eq!(
            anonymous.get("/cas/crt/ca.crt.pem").await.unwrap().status(),
            StatusCode::OK
        );

        server.stop().await.unwrap();
    }
}
