//! HTTP surface of the adapter.
//!
//! Every path below a tenant's prefix belongs to that tenant:
//! - `{prefix}/saml/login` - Sends an AuthnRequest to the IdP
//! - `{prefix}/saml/acs` - Assertion Consumer Service (Redirect, POST or PAOS)
//! - `{prefix}/saml/slo` - Single Logout, both directions
//! - `{prefix}/saml/logout` - SP-initiated logout
//! - `{prefix}/saml/metadata` - SP metadata
//! - anything else - the protected resource of the host application
//!
//! Tenant prefixes are configuration, not route templates, so a single
//! fallback handler resolves the tenant and dispatches on the remaining path.

mod health;
mod protected;
mod saml;

use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode, Uri, header, request::Parts},
    response::{IntoResponse, Response},
    routing::get,
};
pub use protected::is_bearer_only;
use tower::ServiceBuilder;
use tower_cookies::{CookieManagerLayer, Cookies};
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::{
    AppState,
    saml::{DecodedMessage, InboundMessage, MessageKind, SamlError, binding, peek_issuer},
    tenant::{RequestContext, TenantMatch, TrustConfig},
};

/// Build the router for `state`.
pub fn build_app(state: AppState) -> Router {
    let config = Arc::clone(&state.config);
    let mut app = Router::new().route("/health", get(health::health_check));

    let metrics = &config.observability.metrics;
    if metrics.enabled && metrics.prometheus.enabled {
        app = app.route(&metrics.prometheus.path, get(health::metrics));
    }

    // Outermost first: the request id is assigned before the trace span opens
    app.fallback(dispatch)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(RequestBodyLimitLayer::new(config.server.body_limit_bytes))
                .layer(CookieManagerLayer::new()),
        )
        .with_state(state)
}

/// A request already matched to its tenant.
pub(crate) struct TenantRequest {
    pub config: Arc<TrustConfig>,
    pub matched: TenantMatch,
    pub parts: Parts,
    /// The carried SAML message, decoded once at dispatch.
    pub message: Option<Result<DecodedMessage, SamlError>>,
}

impl TenantRequest {
    /// Where to land when no safe return path is known.
    pub fn home(&self) -> String {
        format!("{}/", self.matched.path_prefix)
    }

    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.parts.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Move the decoded message out, failing when the request carried none
    /// or it did not decode.
    pub fn take_message(&mut self) -> Result<DecodedMessage, SamlError> {
        self.message
            .take()
            .unwrap_or_else(|| Err(SamlError::Decode("request carries no SAML message".into())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Login,
    Acs,
    Slo,
    Logout,
    Metadata,
    Resource,
}

impl Endpoint {
    fn classify(config: &TrustConfig, path: &str, local_path: &str) -> Self {
        match local_path {
            "/saml/login" => Endpoint::Login,
            "/saml/acs" => Endpoint::Acs,
            "/saml/slo" => Endpoint::Slo,
            "/saml/logout" => Endpoint::Logout,
            "/saml/metadata" => Endpoint::Metadata,
            _ if url_path_is(&config.acs_url, path) => Endpoint::Acs,
            _ if config.slo_url.as_deref().is_some_and(|url| url_path_is(url, path)) => {
                Endpoint::Slo
            }
            _ => Endpoint::Resource,
        }
    }

    fn allows(&self, method: &Method) -> bool {
        match self {
            Endpoint::Login | Endpoint::Metadata => method == Method::GET,
            Endpoint::Acs | Endpoint::Slo | Endpoint::Logout => {
                method == Method::GET || method == Method::POST
            }
            Endpoint::Resource => true,
        }
    }
}

fn url_path_is(url: &str, path: &str) -> bool {
    url::Url::parse(url).is_ok_and(|u| u.path() == path)
}

async fn dispatch(State(state): State<AppState>, cookies: Cookies, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, state.config.server.body_limit_bytes).await {
        Ok(body) => body,
        Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
    };

    let inbound = match inbound_message(&parts.method, &parts.uri, &parts.headers, &body) {
        Ok(inbound) => inbound,
        Err(e) => {
            e.record_rejection(None);
            return e.into_response();
        }
    };
    let message = inbound.as_ref().map(binding::decode);
    let issuer = match &message {
        Some(Ok(decoded)) => peek_issuer(decoded),
        _ => None,
    };
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok());
    let ctx = RequestContext {
        host,
        path: parts.uri.path(),
        issuer: issuer.as_deref(),
    };
    let (config, matched) = match state.tenants.resolve(&ctx) {
        Ok(resolved) => resolved,
        Err(e) => {
            e.record_rejection(None);
            return e.into_response();
        }
    };

    let endpoint = Endpoint::classify(&config, parts.uri.path(), matched.local_path(parts.uri.path()));
    if !endpoint.allows(&parts.method) {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    tracing::debug!(
        tenant = %config.tenant_id,
        endpoint = ?endpoint,
        path = %parts.uri.path(),
        "Dispatching request"
    );

    let request = TenantRequest {
        config,
        matched,
        parts,
        message,
    };
    match endpoint {
        Endpoint::Login => saml::login(&state, request).await,
        Endpoint::Acs => saml::acs(&state, &cookies, request).await,
        Endpoint::Slo => saml::slo(&state, &cookies, request).await,
        Endpoint::Logout => saml::logout(&state, &cookies, request).await,
        Endpoint::Metadata => saml::metadata(request),
        Endpoint::Resource => protected::resource(&state, &cookies, request).await,
    }
}

/// The SAML message carried by a request, if any.
///
/// GET requests carry it in the query (Redirect binding), form POSTs in the
/// body (POST binding) and XML POSTs as a SOAP envelope (PAOS).
fn inbound_message(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Option<InboundMessage>, SamlError> {
    if method == Method::GET {
        let query = uri.query().unwrap_or_default();
        let carries_message = url::form_urlencoded::parse(query.as_bytes())
            .any(|(key, _)| key == "SAMLRequest" || key == "SAMLResponse");
        return Ok(carries_message.then(|| InboundMessage::Redirect {
            raw_query: query.to_string(),
        }));
    }
    if method != Method::POST {
        return Ok(None);
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if content_type.starts_with("application/x-www-form-urlencoded") {
        return form_message(body);
    }
    if content_type.contains("xml") {
        let envelope = std::str::from_utf8(body)
            .map_err(|_| SamlError::Decode("SOAP body is not UTF-8".into()))?;
        return Ok(Some(InboundMessage::Soap {
            envelope: envelope.to_string(),
        }));
    }
    Ok(None)
}

fn form_message(body: &[u8]) -> Result<Option<InboundMessage>, SamlError> {
    let mut message: Option<(MessageKind, String)> = None;
    let mut relay_state = None;
    for (key, value) in url::form_urlencoded::parse(body) {
        let kind = match key.as_ref() {
            "SAMLRequest" => MessageKind::Request,
            "SAMLResponse" => MessageKind::Response,
            "RelayState" => {
                if relay_state.replace(value.into_owned()).is_some() {
                    return Err(SamlError::Decode("duplicate RelayState".into()));
                }
                continue;
            }
            _ => continue,
        };
        if message.replace((kind, value.into_owned())).is_some() {
            return Err(SamlError::Decode(
                "form carries more than one SAML message".into(),
            ));
        }
    }
    Ok(message.map(|(kind, message)| InboundMessage::Post {
        kind,
        message,
        relay_state,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_message() {
        let inbound = form_message(b"SAMLResponse=PHg%2B&RelayState=%2Fhome")
            .unwrap()
            .unwrap();
        let InboundMessage::Post {
            kind,
            message,
            relay_state,
        } = inbound
        else {
            panic!("expected a POST message");
        };
        assert_eq!(kind, MessageKind::Response);
        assert_eq!(message, "PHg+");
        assert_eq!(relay_state.as_deref(), Some("/home"));

        assert!(form_message(b"foo=bar").unwrap().is_none());
        assert!(form_message(b"SAMLRequest=a&SAMLResponse=b").is_err());
    }

    #[test]
    fn test_get_without_saml_params_is_not_a_message() {
        let uri: Uri = "/demo/saml/acs?x=1".parse().unwrap();
        let inbound =
            inbound_message(&Method::GET, &uri, &HeaderMap::new(), &Bytes::new()).unwrap();
        assert!(inbound.is_none());

        let uri: Uri = "/demo/saml/acs?SAMLResponse=abc".parse().unwrap();
        let inbound =
            inbound_message(&Method::GET, &uri, &HeaderMap::new(), &Bytes::new()).unwrap();
        assert!(matches!(inbound, Some(InboundMessage::Redirect { .. })));
    }

    #[test]
    fn test_soap_body() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            "application/vnd.paos+xml".parse().unwrap(),
        );
        let uri: Uri = "/demo/saml/acs".parse().unwrap();
        let inbound = inbound_message(
            &Method::POST,
            &uri,
            &headers,
            &Bytes::from_static(b"<soap:Envelope/>"),
        )
        .unwrap();
        assert!(matches!(inbound, Some(InboundMessage::Soap { .. })));
    }
}
