//! Request routing for both authorities.
//!
//! Paths have the form `/{authority}/{resource}[/{id}]`. Routing is a closed
//! match over the known authorities and resources; anything else is `404`.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use caucase_auth::{AuthBackend, AuthContext, AuthError};
use caucase_ca::{CertificateAuthority, Submission};

use crate::error::ApiError;
use crate::peer::PeerInfo;
use crate::signed::{RenewPayload, RevokeCrtPayload, RevokeSerialPayload, SignedRequest};

/// Largest accepted request body.
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

const CSR_CONTENT_TYPE: &str = "application/pkcs10";
const CRT_CONTENT_TYPE: &str = "application/pkix-cert";
const CRL_CONTENT_TYPE: &str = "application/pkix-crl";
const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Authority {
    Cau,
    Cas,
}

impl Authority {
    fn parse(segment: &str) -> Option<Self> {
        match segment {
            "cau" => Some(Self::Cau),
            "cas" => Some(Self::Cas),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Cau => "cau",
            Self::Cas => "cas",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resource {
    Crl,
    Csr,
    Crt,
}

impl Resource {
    fn parse(segment: &str) -> Option<Self> {
        match segment {
            "crl" => Some(Self::Crl),
            "csr" => Some(Self::Csr),
            "crt" => Some(Self::Crt),
            _ => None,
        }
    }
}

/// A routed request.
struct Call<'a> {
    authority: Authority,
    engine: &'a CertificateAuthority,
    id: Option<&'a str>,
    method: Method,
    headers: HeaderMap,
    peer: Option<PeerInfo>,
    body: Body,
}

#[derive(Serialize)]
struct PendingCsrEntry {
    id: u64,
    csr: String,
}

/// The HTTP application: both authorities and the authentication backend.
pub struct Application {
    cau: Arc<CertificateAuthority>,
    cas: Arc<CertificateAuthority>,
    auth: Arc<dyn AuthBackend>,
}

impl Application {
    /// Creates the application.
    ///
    /// `auth` decides which callers are privileged operators; it validates
    /// against the user authority, for both authorities.
    pub fn new(
        cau: Arc<CertificateAuthority>,
        cas: Arc<CertificateAuthority>,
        auth: Arc<dyn AuthBackend>,
    ) -> Self {
        Self { cau, cas, auth }
    }

    /// Builds the axum router.
    pub fn router(self) -> Router {
        Router::new()
            .fallback(dispatch)
            .with_state(Arc::new(self))
            .layer(TraceLayer::new_for_http())
    }

    async fn handle(&self, request: Request) -> Result<Response, ApiError> {
        let (parts, body) = request.into_parts();
        let peer = parts
            .extensions
            .get::<ConnectInfo<PeerInfo>>()
            .map(|ConnectInfo(peer)| peer.clone());

        let path = parts.uri.path();
        let mut segments = path.strip_prefix('/').unwrap_or(path).split('/');
        let authority = segments
            .next()
            .and_then(Authority::parse)
            .ok_or(ApiError::NotFound)?;
        let resource_name = segments.next().ok_or(ApiError::NotFound)?;
        if resource_name.starts_with('_') {
            return Err(ApiError::NotFound);
        }
        let resource = Resource::parse(resource_name).ok_or(ApiError::NotFound)?;
        let id = segments.next();
        if segments.next().is_some() {
            return Err(ApiError::NotFound);
        }

        let engine = match authority {
            Authority::Cau => self.cau.as_ref(),
            Authority::Cas => self.cas.as_ref(),
        };
        let call = Call {
            authority,
            engine,
            id,
            method: parts.method,
            headers: parts.headers,
            peer,
            body,
        };

        match resource {
            Resource::Crl => self.crl(call).await,
            Resource::Csr => self.csr(call).await,
            Resource::Crt => self.crt(call).await,
        }
    }

    /// Resolves the caller, answering `404` when it is not a valid user.
    async fn authenticate(&self, peer: Option<&PeerInfo>) -> Result<AuthContext, ApiError> {
        let certificate = peer.and_then(|peer| peer.client_certificate.as_deref());
        match self.auth.authenticate(certificate).await {
            Ok(context) => {
                debug!(caller = %context.display_name(), backend = self.auth.name(), "Caller authenticated");
                Ok(context)
            }
            Err(AuthError::Backend(detail)) => Err(ApiError::Internal(detail)),
            Err(err) => {
                debug!(error = %err, "Authentication rejected");
                Err(ApiError::NotFound)
            }
        }
    }

    // ------------------------------------------------------------------
    // /a/crl
    // ------------------------------------------------------------------

    async fn crl(&self, call: Call<'_>) -> Result<Response, ApiError> {
        if call.id.is_some() {
            return Err(ApiError::NotFound);
        }
        if call.method != Method::GET {
            return Err(ApiError::MethodNotAllowed { allow: "GET" });
        }
        let crl = call.engine.get_crl().await?;
        Ok(with_content_type(CRL_CONTENT_TYPE, crl))
    }

    // ------------------------------------------------------------------
    // /a/csr
    // ------------------------------------------------------------------

    async fn csr(&self, call: Call<'_>) -> Result<Response, ApiError> {
        match (call.method.clone(), call.id) {
            (Method::GET, None) => {
                self.authenticate(call.peer.as_ref()).await?;
                let pending = call
                    .engine
                    .list_pending_csrs()
                    .await?
                    .into_iter()
                    .map(|csr| PendingCsrEntry {
                        id: csr.id,
                        csr: csr.csr_pem,
                    })
                    .collect::<Vec<_>>();
                json_response(&pending)
            }
            (Method::GET, Some(id)) => {
                let csr = call.engine.get_csr(parse_id(id)?).await?;
                Ok(with_content_type(CSR_CONTENT_TYPE, csr))
            }
            (Method::PUT, None) => {
                require_content_type(&call.headers, CSR_CONTENT_TYPE)?;
                let csr = body_text(read_body(&call.headers, call.body).await?)?;
                let submission = call.engine.submit_csr(&csr).await?;

                let mut response = StatusCode::CREATED.into_response();
                response
                    .headers_mut()
                    .insert(header::LOCATION, HeaderValue::from(submission.csr_id()));
                if let Submission::Issued { csr_id, .. } = submission {
                    response.headers_mut().insert(
                        header::CONTENT_LOCATION,
                        certificate_location(call.authority, csr_id)?,
                    );
                }
                Ok(response)
            }
            (Method::DELETE, Some(id)) => {
                let caller = self.authenticate(call.peer.as_ref()).await?;
                let csr_id = parse_id(id)?;
                call.engine.delete_csr(csr_id).await?;
                info!(
                    authority = call.authority.as_str(),
                    csr_id,
                    caller = %caller.display_name(),
                    "CSR deleted"
                );
                Ok(StatusCode::NO_CONTENT.into_response())
            }
            (Method::PUT | Method::DELETE, _) => Err(ApiError::NotFound),
            _ => Err(ApiError::MethodNotAllowed {
                allow: "DELETE, GET, PUT",
            }),
        }
    }

    // ------------------------------------------------------------------
    // /a/crt
    // ------------------------------------------------------------------

    async fn crt(&self, call: Call<'_>) -> Result<Response, ApiError> {
        match (call.method.clone(), call.id) {
            (Method::GET, Some("ca.crt.pem")) => {
                let ca = call.engine.get_ca_certificate().await?;
                Ok(with_content_type(CRT_CONTENT_TYPE, ca))
            }
            (Method::GET, Some("ca.crt.json")) => {
                json_response(&call.engine.get_valid_ca_chain().await?)
            }
            (Method::GET, Some(csr_id)) => {
                let crt = call.engine.get_certificate_for_csr(parse_id(csr_id)?).await?;
                Ok(with_content_type(CRT_CONTENT_TYPE, crt))
            }
            (Method::PUT, Some("renew")) => self.renew(call).await,
            (Method::PUT, Some("revoke")) => self.revoke(call).await,
            (Method::PUT, Some(id)) => self.approve(call, id).await,
            (Method::GET | Method::PUT, None) => Err(ApiError::NotFound),
            _ => Err(ApiError::MethodNotAllowed { allow: "GET, PUT" }),
        }
    }

    async fn approve(&self, call: Call<'_>, id: &str) -> Result<Response, ApiError> {
        let caller = self.authenticate(call.peer.as_ref()).await?;
        let body = read_body(&call.headers, call.body).await?;
        if !body.is_empty() {
            require_content_type(&call.headers, CSR_CONTENT_TYPE)?;
        }
        let csr_id = parse_id(id)?;
        let template = if body.is_empty() {
            None
        } else {
            Some(body_text(body)?)
        };

        let serial = call
            .engine
            .create_certificate(csr_id, template.as_deref())
            .await?;
        info!(
            authority = call.authority.as_str(),
            csr_id,
            serial,
            caller = %caller.display_name(),
            "CSR approved over HTTP"
        );

        let mut response = StatusCode::NO_CONTENT.into_response();
        response.headers_mut().insert(
            header::CONTENT_LOCATION,
            certificate_location(call.authority, csr_id)?,
        );
        Ok(response)
    }

    async fn renew(&self, call: Call<'_>) -> Result<Response, ApiError> {
        require_content_type(&call.headers, JSON_CONTENT_TYPE)?;
        let request = SignedRequest::from_body(&read_body(&call.headers, call.body).await?)?;
        let payload: RenewPayload = request.payload()?;
        request.verify(&payload.crt_pem)?;

        let crt = call
            .engine
            .renew(&payload.crt_pem, &payload.renew_csr_pem)
            .await?;
        Ok(with_content_type(CRT_CONTENT_TYPE, crt))
    }

    async fn revoke(&self, call: Call<'_>) -> Result<Response, ApiError> {
        require_content_type(&call.headers, JSON_CONTENT_TYPE)?;
        let request = SignedRequest::from_body(&read_body(&call.headers, call.body).await?)?;

        if request.is_signed() {
            let payload: RevokeCrtPayload = request.payload()?;
            request.verify(&payload.revoke_crt_pem)?;
            call.engine.revoke(&payload.revoke_crt_pem).await?;
        } else {
            let caller = self.authenticate(call.peer.as_ref()).await?;
            let payload: RevokeSerialPayload = request.payload()?;
            call.engine.revoke_by_serial(payload.revoke_serial).await?;
            info!(
                authority = call.authority.as_str(),
                serial = payload.revoke_serial,
                caller = %caller.display_name(),
                "Certificate revoked by operator"
            );
        }
        Ok(StatusCode::NO_CONTENT.into_response())
    }
}

async fn dispatch(State(app): State<Arc<Application>>, request: Request) -> Response {
    match app.handle(request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

fn parse_id(id: &str) -> Result<u64, ApiError> {
    id.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid identifier {id:?}")))
}

/// Where the certificate issued from CSR `csr_id` can be fetched.
fn certificate_location(authority: Authority, csr_id: u64) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(&format!("/{}/crt/{csr_id}", authority.as_str()))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

fn with_content_type(content_type: &'static str, body: String) -> Response {
    ([(header::CONTENT_TYPE, content_type)], body).into_response()
}

fn json_response<T: Serialize>(value: &T) -> Result<Response, ApiError> {
    let body = serde_json::to_string(value).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(with_content_type(JSON_CONTENT_TYPE, body))
}

fn require_content_type(headers: &HeaderMap, expected: &str) -> Result<(), ApiError> {
    let actual = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(str::trim);
    if actual == Some(expected) {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("expected {expected} content")))
    }
}

/// Reads the body, enforcing [`MAX_BODY_SIZE`].
async fn read_body(headers: &HeaderMap, body: Body) -> Result<Vec<u8>, ApiError> {
    if let Some(length) = headers.get(header::CONTENT_LENGTH) {
        let length: usize = length
            .to_str()
            .ok()
            .and_then(|value| value.trim().parse().ok())
            .ok_or_else(|| ApiError::BadRequest("invalid Content-Length".into()))?;
        if length > MAX_BODY_SIZE {
            return Err(ApiError::TooLarge);
        }
    }
    let bytes = to_bytes(body, MAX_BODY_SIZE)
        .await
        .map_err(|_| ApiError::TooLarge)?;
    Ok(bytes.to_vec())
}

fn body_text(body: Vec<u8>) -> Result<String, ApiError> {
    String::from_utf8(body).map_err(|_| ApiError::BadRequest("body is not UTF-8".into()))
}
