//! SAML protocol endpoints.

use axum::{
    extract::Query,
    http::header,
    response::{IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use tower_cookies::{
    Cookie, Cookies,
    cookie::{SameSite as CookieSameSite, time::Duration as CookieDuration},
};
use uuid::Uuid;

use super::TenantRequest;
use crate::{
    AppState,
    config::{SameSite, SessionConfig},
    saml::{
        Binding, LoginCompletion, LoginOptions, LoginOutcome, LogoutOutcome, SamlError,
        binding::soap, sp_metadata,
    },
    session::Session,
};

const METADATA_MEDIA_TYPE: &str = "application/samlmetadata+xml";

/// Query parameters for the login endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct LoginQuery {
    /// Path to return to after login
    #[serde(default)]
    pub return_to: Option<String>,
    #[serde(default)]
    pub passive: Option<bool>,
    #[serde(default)]
    pub force: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogoutQuery {
    #[serde(default)]
    pub return_to: Option<String>,
}

fn cookie_same_site(config: &SessionConfig) -> CookieSameSite {
    match config.same_site {
        SameSite::Strict => CookieSameSite::Strict,
        SameSite::Lax => CookieSameSite::Lax,
        SameSite::None => CookieSameSite::None,
    }
}

fn cookie_path(request: &TenantRequest) -> String {
    match request.matched.path_prefix.as_str() {
        "" => "/".to_string(),
        prefix => prefix.to_string(),
    }
}

fn session_cookie(config: &SessionConfig, path: String, session: &Session) -> Cookie<'static> {
    let max_age = i64::try_from(session.ttl().as_secs()).unwrap_or(i64::MAX);
    Cookie::build((config.cookie_name.clone(), session.id.to_string()))
        .path(path)
        .http_only(true)
        .secure(config.secure)
        .same_site(cookie_same_site(config))
        .max_age(CookieDuration::seconds(max_age))
        .build()
}

/// Build a session removal cookie with the same security attributes as the login cookie.
pub(crate) fn removal_cookie(config: &SessionConfig, path: String) -> Cookie<'static> {
    Cookie::build(config.cookie_name.clone())
        .path(path)
        .http_only(true)
        .secure(config.secure)
        .same_site(cookie_same_site(config))
        .max_age(CookieDuration::ZERO)
        .build()
}

/// The caller's session, if it belongs to the resolved tenant.
pub(crate) async fn current_session(
    state: &AppState,
    cookies: &Cookies,
    request: &TenantRequest,
) -> Option<Session> {
    let cookie = cookies.get(&state.config.session.cookie_name)?;
    let session_id = cookie.value().parse::<Uuid>().ok()?;
    match state.engine.sessions().get_session(session_id).await {
        Ok(Some(session)) if session.tenant == request.config.tenant_id => Some(session),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(error = %e, "Session lookup failed");
            None
        }
    }
}

/// Only relative paths, to prevent open redirects.
fn safe_return_to(target: Option<String>, home: String) -> String {
    target
        .filter(|url| url.starts_with('/') && !url.starts_with("//") && !url.starts_with("/\\"))
        .unwrap_or(home)
}

pub(crate) fn paos_capable(request: &TenantRequest) -> bool {
    soap::is_paos_capable(request.header(header::ACCEPT), request.header("paos"))
}

#[tracing::instrument(name = "saml.login", skip_all, fields(tenant = %request.config.tenant_id))]
pub(crate) async fn login(state: &AppState, request: TenantRequest) -> Response {
    let query = match Query::<LoginQuery>::try_from_uri(&request.parts.uri) {
        Ok(Query(query)) => query,
        Err(e) => return SamlError::Decode(format!("invalid login query: {}", e)).into_response(),
    };
    let binding = paos_capable(&request).then_some(Binding::Paos);

    match state.engine.start_login(
        &request.config,
        LoginOptions {
            binding,
            relay_state: query.return_to,
            is_passive: query.passive,
            force_authn: query.force,
        },
    ) {
        Ok(message) => message.into_response(),
        Err(e) => e.into_response(),
    }
}

#[tracing::instrument(name = "saml.acs", skip_all, fields(tenant = %request.config.tenant_id))]
pub(crate) async fn acs(state: &AppState, cookies: &Cookies, mut request: TenantRequest) -> Response {
    let decoded = match request.take_message() {
        Ok(decoded) => decoded,
        Err(e) => {
            e.record_rejection(Some(&request.config.tenant_id));
            return e.into_response();
        }
    };

    let LoginCompletion {
        outcome,
        relay_state,
    } = match state
        .engine
        .handle_decoded_response(&request.config, &decoded)
        .await
    {
        Ok(completion) => completion,
        Err(e) => return e.into_response(),
    };
    if outcome == LoginOutcome::NoPrincipal {
        // Answering with another login would loop a passive tenant forever
        return (
            axum::http::StatusCode::UNAUTHORIZED,
            "No authenticated principal",
        )
            .into_response();
    }
    match outcome.into_session() {
        Ok(session) => {
            cookies.add(session_cookie(
                &state.config.session,
                cookie_path(&request),
                &session,
            ));
            Redirect::to(&safe_return_to(relay_state, request.home())).into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[tracing::instrument(name = "saml.slo", skip_all, fields(tenant = %request.config.tenant_id))]
pub(crate) async fn slo(state: &AppState, cookies: &Cookies, mut request: TenantRequest) -> Response {
    let decoded = match request.take_message() {
        Ok(decoded) => decoded,
        Err(e) => {
            e.record_rejection(Some(&request.config.tenant_id));
            return e.into_response();
        }
    };

    match state.engine.handle_decoded_slo(&request.config, &decoded).await {
        Ok(LogoutOutcome::LoggedOut { relay_state }) => {
            cookies.remove(removal_cookie(&state.config.session, cookie_path(&request)));
            Redirect::to(&safe_return_to(relay_state, request.home())).into_response()
        }
        Ok(LogoutOutcome::Respond(message)) => {
            cookies.remove(removal_cookie(&state.config.session, cookie_path(&request)));
            message.into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[tracing::instrument(name = "saml.logout", skip_all, fields(tenant = %request.config.tenant_id))]
pub(crate) async fn logout(state: &AppState, cookies: &Cookies, request: TenantRequest) -> Response {
    let query = Query::<LogoutQuery>::try_from_uri(&request.parts.uri)
        .map(|Query(q)| q)
        .unwrap_or_default();
    let session = current_session(state, cookies, &request).await;
    cookies.remove(removal_cookie(&state.config.session, cookie_path(&request)));

    let Some(session) = session else {
        return Redirect::to(&safe_return_to(query.return_to, request.home())).into_response();
    };
    match state
        .engine
        .start_logout(&request.config, &session, query.return_to.as_deref())
        .await
    {
        Ok(Some(message)) => message.into_response(),
        Ok(None) => Redirect::to(&safe_return_to(query.return_to, request.home())).into_response(),
        Err(e) => e.into_response(),
    }
}

#[tracing::instrument(name = "saml.metadata", skip_all, fields(tenant = %request.config.tenant_id))]
pub(crate) fn metadata(request: TenantRequest) -> Response {
    match sp_metadata(&request.config) {
        Ok(xml) => ([(header::CONTENT_TYPE, METADATA_MEDIA_TYPE)], xml).into_response(),
        Err(e) => e.into_response(),
    }
}
