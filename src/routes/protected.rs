//! Stand-in for the host application's protected resources.

use axum::{
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use tower_cookies::Cookies;

use super::{
    TenantRequest,
    saml::{current_session, paos_capable},
};
use crate::{AppState, saml::LoginOptions};

/// Whether a client cannot follow a browser redirect to the IdP.
///
/// AJAX and SOAP callers, and clients that do not accept HTML, get a 401
/// instead of a login redirect.
pub fn is_bearer_only(headers: &HeaderMap) -> bool {
    let header_value = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    if header_value("x-requested-with").is_some_and(|v| v.eq_ignore_ascii_case("XMLHttpRequest")) {
        return true;
    }
    if header_value("faces-request").is_some_and(|v| v.eq_ignore_ascii_case("partial/ajax")) {
        return true;
    }
    if headers.contains_key("soapaction") {
        return true;
    }
    match headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) {
        None => true,
        Some(accept) => !accept.contains("text/html") && !accept.contains("*/*"),
    }
}

#[tracing::instrument(name = "saml.resource", skip_all, fields(tenant = %request.config.tenant_id))]
pub(crate) async fn resource(state: &AppState, cookies: &Cookies, request: TenantRequest) -> Response {
    if let Some(session) = current_session(state, cookies, &request).await {
        if !session.has_any_role(&request.config.required_roles) {
            tracing::info!(
                tenant = %request.config.tenant_id,
                principal = %session.principal,
                "Session lacks every required role"
            );
            return (StatusCode::FORBIDDEN, "Forbidden").into_response();
        }
        return format!("principal={}", session.principal).into_response();
    }

    let return_to = request
        .parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string());

    let started = if paos_capable(&request) {
        state
            .engine
            .handle_ecp_login(&request.config, return_to.as_deref())
    } else if is_bearer_only(&request.parts.headers) {
        return (StatusCode::UNAUTHORIZED, "Authentication required").into_response();
    } else {
        state.engine.start_login(
            &request.config,
            LoginOptions {
                relay_state: return_to,
                ..Default::default()
            },
        )
    };
    match started {
        Ok(message) => message.into_response(),
        Err(e) => e.into_response(),
    }
}
