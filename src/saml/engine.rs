//! The SP protocol state machine.
//!
//! A login moves `UNAUTHENTICATED → REQUEST_SENT → RESPONSE_VALIDATED →
//! AUTHENTICATED`, or ends in `RESPONSE_REJECTED` on any error. The
//! pending entry of a request is consumed by the first response naming it,
//! whatever that response's fate, and a session is only ever created from a
//! fully validated assertion.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use roxmltree::{Document, Node};
use uuid::Uuid;

use super::{
    binding::{
        self, Binding, DecodedMessage, InboundMessage, MessageKind, OutboundMessage,
        soap::{self, EcpRequest},
    },
    constants::*,
    decrypt::decrypt_assertion,
    error::SamlError,
    logout::{LogoutSubject, build_logout_request, build_logout_response},
    mapper::{project, resolve_principal},
    model::{
        Assertion, LogoutRequestInfo, LogoutResponseInfo, ResponseHeader, StatusInfo,
        SubjectConfirmation,
    },
    request::{AuthnRequestOptions, build_authn_request},
    signature::{SignatureCheck, SignatureVerifier, sign_root},
    xml::{self, child_element, is_element, trimmed_text, wrap_in_scope},
};
use crate::{
    observability::metrics,
    session::{
        PendingKind, PendingRequest, PendingRequestStore, ReplayCache, Session, SessionStore,
    },
    tenant::TrustConfig,
};

#[derive(Debug, Clone, Default)]
pub struct LoginOptions {
    /// Binding for the AuthnRequest; defaults to the tenant's SSO binding.
    /// `Paos` starts an ECP login.
    pub binding: Option<Binding>,
    pub relay_state: Option<String>,
    pub is_passive: Option<bool>,
    pub force_authn: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Authenticated(Session),
    /// A passive request the IdP could not satisfy without interaction.
    NoPrincipal,
    /// The IdP answered with a non-success status.
    Rejected(StatusInfo),
}

impl LoginOutcome {
    fn label(&self) -> &'static str {
        match self {
            LoginOutcome::Authenticated(_) => "authenticated",
            LoginOutcome::NoPrincipal => "no_principal",
            LoginOutcome::Rejected(_) => "rejected",
        }
    }

    /// The session, or `STATUS_DENIED` for every other outcome.
    pub fn into_session(self) -> Result<Session, SamlError> {
        match self {
            LoginOutcome::Authenticated(session) => Ok(session),
            LoginOutcome::NoPrincipal => Err(SamlError::StatusDenied {
                status: STATUS_NO_PASSIVE.to_string(),
                message: None,
            }),
            LoginOutcome::Rejected(status) => Err(SamlError::StatusDenied {
                status: status.effective_code().to_string(),
                message: status.message,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoginCompletion {
    pub outcome: LoginOutcome,
    /// RelayState recorded with the request, or the IdP's for unsolicited
    /// responses.
    pub relay_state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogoutOutcome {
    /// An SP-initiated logout completed at the IdP.
    LoggedOut { relay_state: Option<String> },
    /// Answer to an IdP-initiated LogoutRequest.
    Respond(OutboundMessage),
}

/// Result of the synchronous half of response processing.
enum ValidatedResponse {
    Status {
        status: StatusInfo,
        passive: bool,
        relay_state: Option<String>,
    },
    Assertion {
        assertion: Box<Assertion>,
        relay_state: Option<String>,
    },
}

pub struct SamlEngine {
    pending: PendingRequestStore,
    /// Assertion IDs already turned into sessions.
    consumed: ReplayCache,
    sessions: Arc<dyn SessionStore>,
    session_ttl: Duration,
}

impl SamlEngine {
    pub const DEFAULT_SESSION_TTL_SECS: i64 = 8 * 60 * 60;

    pub fn new(sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            pending: PendingRequestStore::default(),
            consumed: ReplayCache::default(),
            sessions,
            session_ttl: Duration::seconds(Self::DEFAULT_SESSION_TTL_SECS),
        }
    }

    pub fn with_pending_store(mut self, pending: PendingRequestStore) -> Self {
        self.pending = pending;
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn pending(&self) -> &PendingRequestStore {
        &self.pending
    }

    pub fn consumed_assertions(&self) -> &ReplayCache {
        &self.consumed
    }

    /// Drop expired pending requests and consumed assertion IDs.
    pub fn sweep_expired(&self) -> usize {
        self.pending.sweep() + self.consumed.sweep()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Login
    // ─────────────────────────────────────────────────────────────────────────

    /// Build an AuthnRequest, record it as pending and bind it for the IdP.
    pub fn start_login(
        &self,
        config: &TrustConfig,
        options: LoginOptions,
    ) -> Result<OutboundMessage, SamlError> {
        if options.binding == Some(Binding::Paos) {
            return self.handle_ecp_login(config, options.relay_state.as_deref());
        }
        let binding = options.binding.unwrap_or(config.sso.binding);
        let signing_key = config.outbound_signing_key()?;

        let request = build_authn_request(
            config,
            &AuthnRequestOptions {
                is_passive: options.is_passive,
                force_authn: options.force_authn,
                protocol_binding: None,
            },
        );
        self.pending.insert(
            request.id.clone(),
            PendingRequest::authn(
                &config.tenant_id,
                options.relay_state.clone(),
                request.is_passive,
            ),
        );

        tracing::debug!(
            tenant = %config.tenant_id,
            request_id = %request.id,
            binding = ?binding,
            passive = request.is_passive,
            signed = signing_key.is_some(),
            "Sending AuthnRequest"
        );
        binding::encode(
            &request.xml,
            MessageKind::Request,
            binding,
            &config.sso.url,
            options.relay_state.as_deref(),
            signing_key,
        )
    }

    /// Answer a PAOS-capable client with the ECP SOAP envelope.
    pub fn handle_ecp_login(
        &self,
        config: &TrustConfig,
        relay_state: Option<&str>,
    ) -> Result<OutboundMessage, SamlError> {
        let signing_key = config.outbound_signing_key()?;
        let request = build_authn_request(
            config,
            &AuthnRequestOptions {
                protocol_binding: Some(Binding::Paos),
                ..Default::default()
            },
        );
        self.pending.insert(
            request.id.clone(),
            PendingRequest::authn(
                &config.tenant_id,
                relay_state.map(str::to_string),
                request.is_passive,
            ),
        );

        let xml = match signing_key {
            Some(key) => sign_root(&request.xml, key)?,
            None => request.xml,
        };
        tracing::debug!(tenant = %config.tenant_id, request_id = %request.id, "Sending ECP AuthnRequest");
        Ok(OutboundMessage::Soap {
            envelope: soap::ecp_envelope(
                &xml,
                &EcpRequest {
                    acs_url: &config.acs_url,
                    sp_entity_id: &config.sp_entity_id,
                    idp_entity_id: &config.idp_entity_id,
                    sso_url: &config.sso.url,
                    relay_state,
                    is_passive: request.is_passive,
                },
            ),
        })
    }

    /// Consume a Response at the ACS.
    pub async fn handle_response(
        &self,
        config: &TrustConfig,
        inbound: &InboundMessage,
    ) -> Result<LoginCompletion, SamlError> {
        let result = match binding::decode(inbound) {
            Ok(decoded) => self.consume_response(config, &decoded).await,
            Err(e) => Err(e),
        };
        self.record_login(config, &result);
        result
    }

    /// [`handle_response`](Self::handle_response) for a message the transport
    /// already decoded.
    pub async fn handle_decoded_response(
        &self,
        config: &TrustConfig,
        decoded: &DecodedMessage,
    ) -> Result<LoginCompletion, SamlError> {
        let result = self.consume_response(config, decoded).await;
        self.record_login(config, &result);
        result
    }

    fn record_login(&self, config: &TrustConfig, result: &Result<LoginCompletion, SamlError>) {
        match result {
            Ok(completion) => {
                metrics::record_saml_login(&config.tenant_id, completion.outcome.label())
            }
            Err(e) => {
                e.record_rejection(Some(&config.tenant_id));
                metrics::record_saml_login(&config.tenant_id, "error");
            }
        }
    }

    async fn consume_response(
        &self,
        config: &TrustConfig,
        decoded: &DecodedMessage,
    ) -> Result<LoginCompletion, SamlError> {
        if decoded.kind != MessageKind::Response {
            return Err(SamlError::Decode("expected a SAMLResponse".into()));
        }

        match self.validate_response(config, decoded)? {
            ValidatedResponse::Status {
                status,
                passive,
                relay_state,
            } => {
                let outcome = if passive && status.is_no_passive() {
                    tracing::info!(tenant = %config.tenant_id, "Passive login found no IdP session");
                    LoginOutcome::NoPrincipal
                } else {
                    tracing::info!(
                        tenant = %config.tenant_id,
                        status = %status,
                        denied = status.is_request_denied(),
                        "IdP rejected the login"
                    );
                    LoginOutcome::Rejected(status)
                };
                Ok(LoginCompletion {
                    outcome,
                    relay_state,
                })
            }
            ValidatedResponse::Assertion {
                assertion,
                relay_state,
            } => {
                let session = self.build_session(config, &assertion);
                self.sessions.create_session(session.clone()).await?;
                tracing::info!(
                    tenant = %config.tenant_id,
                    principal = %session.principal,
                    session_id = %session.id,
                    roles = session.roles.len(),
                    "SAML session created"
                );
                Ok(LoginCompletion {
                    outcome: LoginOutcome::Authenticated(session),
                    relay_state,
                })
            }
        }
    }

    fn validate_response(
        &self,
        config: &TrustConfig,
        decoded: &DecodedMessage,
    ) -> Result<ValidatedResponse, SamlError> {
        let doc = xml::parse(&decoded.xml)?;
        let root = soap::message_root(&doc)?;
        let header = ResponseHeader::parse(root)?;

        // Taken before any other check so a rejected response still
        // consumes the request it names
        let pending = header
            .in_response_to
            .as_deref()
            .map(|id| self.pending.take(id, PendingKind::Authn, &config.tenant_id));

        let signed = decoded.query_signature.is_some()
            || child_element(root, NS_DSIG, "Signature").is_some();
        check_destination(header.destination.as_deref(), Some(&config.acs_url), signed)?;
        check_issuer(header.issuer.as_deref(), &config.idp_entity_id, false)?;

        let pending = pending.transpose()?;
        if pending.is_none() && !config.allow_unsolicited {
            return Err(SamlError::ReplayOrUnknownRequest(
                "unsolicited responses are not accepted".into(),
            ));
        }
        let passive = pending.as_ref().is_some_and(|p| p.is_passive);
        let relay_state = match pending {
            Some(p) => p.relay_state,
            None => decoded.relay_state.clone(),
        };
        tracing::debug!(
            tenant = %config.tenant_id,
            response_id = %header.id,
            solicited = header.in_response_to.is_some(),
            "Validating Response"
        );

        let verifier = config.verifier();
        let message_signature = verify_message(&verifier, &doc, root, decoded)?;
        let policy = &config.signatures;

        if !header.status.is_success() {
            // No assertion can vouch for an error status, so only the
            // message signature counts
            if !message_signature.is_verified() && policy.wants_message_signature() {
                return Err(SamlError::InvalidSignature(
                    "error status is not signed".into(),
                ));
            }
            return Ok(ValidatedResponse::Status {
                status: header.status,
                passive,
                relay_state,
            });
        }

        let candidates: Vec<Node<'_, '_>> = root
            .children()
            .filter(|n| {
                is_element(*n, NS_ASSERTION, "Assertion")
                    || is_element(*n, NS_ASSERTION, "EncryptedAssertion")
            })
            .collect();
        let node = match candidates.as_slice() {
            [] => return Err(SamlError::MissingAssertion),
            [node] => *node,
            _ => {
                return Err(SamlError::Decode(
                    "response carries more than one assertion".into(),
                ));
            }
        };

        let (assertion, assertion_signature) = if is_element(node, NS_ASSERTION, "EncryptedAssertion")
        {
            let plaintext = decrypt_assertion(node, &config.decryption_keys)?;
            let scoped = wrap_in_scope(node, &plaintext);
            let assertion_doc = xml::parse(&scoped)
                .map_err(|_| SamlError::DecryptionFailed("plaintext is not well-formed".into()))?;
            let assertion_node = assertion_doc
                .root_element()
                .first_element_child()
                .filter(|n| is_element(*n, NS_ASSERTION, "Assertion"))
                .ok_or_else(|| {
                    SamlError::DecryptionFailed("plaintext is not an assertion".into())
                })?;
            let check = verifier.verify_element(&assertion_doc, assertion_node, None)?;
            (Assertion::parse(assertion_node)?, check)
        } else {
            let check = verifier.verify_element(&doc, node, None)?;
            (Assertion::parse(node)?, check)
        };

        if policy.want_response_signed && !message_signature.is_verified() {
            return Err(SamlError::NoSignaturePresent("response"));
        }
        if policy.want_assertions_signed && !assertion_signature.is_verified() {
            return Err(SamlError::NoSignaturePresent("assertion"));
        }
        if policy.require_signature
            && !message_signature.is_verified()
            && !assertion_signature.is_verified()
        {
            return Err(SamlError::NoSignaturePresent("response or assertion"));
        }

        check_issuer(assertion.issuer.as_deref(), &config.idp_entity_id, true)?;
        let now = Utc::now();
        check_conditions(&assertion, config, now)?;
        check_subject_confirmations(&assertion, config, header.in_response_to.as_deref(), now)?;
        if let Some(session_end) = assertion
            .authn_statement
            .as_ref()
            .and_then(|s| s.session_not_on_or_after)
            && now - config.clock_skew >= session_end
        {
            return Err(SamlError::ExpiredAssertion(
                "IdP session has already ended".into(),
            ));
        }

        // Last, so only an assertion that would otherwise be accepted is
        // marked as used
        let usable_until = assertion_deadline(&assertion).map(|t| t + config.clock_skew);
        self.consumed
            .record(&config.tenant_id, &assertion.id, usable_until)?;

        Ok(ValidatedResponse::Assertion {
            assertion: Box::new(assertion),
            relay_state,
        })
    }

    fn build_session(&self, config: &TrustConfig, assertion: &Assertion) -> Session {
        let projection = project(assertion, &config.mapping);
        let principal = resolve_principal(&config.principal, assertion, &projection);
        let now = Utc::now();
        let mut expires_at = now + self.session_ttl;
        if let Some(session_end) = assertion
            .authn_statement
            .as_ref()
            .and_then(|s| s.session_not_on_or_after)
        {
            expires_at = expires_at.min(session_end);
        }

        Session {
            id: Uuid::new_v4(),
            tenant: config.tenant_id.clone(),
            principal,
            name_id: assertion.name_id.as_ref().map(|n| n.value.clone()),
            name_id_format: assertion.name_id.as_ref().and_then(|n| n.format.clone()),
            session_index: assertion.session_index().map(str::to_string),
            attributes: projection.attributes,
            friendly_attributes: projection.friendly_attributes,
            roles: projection.roles,
            issuer: assertion.issuer.clone().unwrap_or_default(),
            created_at: now,
            expires_at,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logout
    // ─────────────────────────────────────────────────────────────────────────

    /// Remove the local session and, when the IdP has an SLO endpoint, build
    /// the LogoutRequest that propagates the logout.
    ///
    /// Returns `None` for a purely local logout.
    pub async fn start_logout(
        &self,
        config: &TrustConfig,
        session: &Session,
        relay_state: Option<&str>,
    ) -> Result<Option<OutboundMessage>, SamlError> {
        self.sessions.delete_session(session.id).await?;

        let (Some(slo), Some(name_id)) = (&config.slo, session.name_id.as_deref()) else {
            tracing::info!(tenant = %config.tenant_id, session_id = %session.id, "Local logout");
            metrics::record_saml_logout("sp_initiated");
            return Ok(None);
        };

        let signing_key = config.outbound_signing_key()?;
        let logout = build_logout_request(
            &config.sp_entity_id,
            &slo.url,
            LogoutSubject {
                name_id,
                name_id_format: session.name_id_format.as_deref(),
                session_index: session.session_index.as_deref(),
            },
        )?;
        self.pending.insert(
            logout.id.clone(),
            PendingRequest::logout(
                &config.tenant_id,
                relay_state.map(str::to_string),
                Some(session.id),
            ),
        );

        tracing::info!(
            tenant = %config.tenant_id,
            session_id = %session.id,
            request_id = %logout.id,
            "Sending LogoutRequest"
        );
        binding::encode(
            &logout.xml,
            MessageKind::Request,
            front_channel(slo.binding),
            &slo.url,
            relay_state,
            signing_key,
        )
        .map(Some)
    }

    /// Dispatch a message received at the SLO endpoint.
    pub async fn handle_slo(
        &self,
        config: &TrustConfig,
        inbound: &InboundMessage,
    ) -> Result<LogoutOutcome, SamlError> {
        match binding::decode(inbound) {
            Ok(decoded) => self.handle_decoded_slo(config, &decoded).await,
            Err(e) => {
                e.record_rejection(Some(&config.tenant_id));
                Err(e)
            }
        }
    }

    /// [`handle_slo`](Self::handle_slo) for a message the transport already
    /// decoded.
    pub async fn handle_decoded_slo(
        &self,
        config: &TrustConfig,
        decoded: &DecodedMessage,
    ) -> Result<LogoutOutcome, SamlError> {
        let result = match decoded.kind {
            MessageKind::Request => self.logout_request(config, decoded).await,
            MessageKind::Response => self.logout_response(config, decoded),
        };
        if let Err(e) = &result {
            e.record_rejection(Some(&config.tenant_id));
        }
        result
    }

    /// Complete an SP-initiated logout.
    pub fn handle_logout_response(
        &self,
        config: &TrustConfig,
        inbound: &InboundMessage,
    ) -> Result<LogoutOutcome, SamlError> {
        let result = binding::decode(inbound).and_then(|d| self.logout_response(config, &d));
        if let Err(e) = &result {
            e.record_rejection(Some(&config.tenant_id));
        }
        result
    }

    /// Serve an IdP-initiated LogoutRequest.
    pub async fn handle_logout_request(
        &self,
        config: &TrustConfig,
        inbound: &InboundMessage,
    ) -> Result<LogoutOutcome, SamlError> {
        let result = match binding::decode(inbound) {
            Ok(decoded) => self.logout_request(config, &decoded).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            e.record_rejection(Some(&config.tenant_id));
        }
        result
    }

    fn logout_response(
        &self,
        config: &TrustConfig,
        decoded: &DecodedMessage,
    ) -> Result<LogoutOutcome, SamlError> {
        let doc = xml::parse(&decoded.xml)?;
        let root = soap::message_root(&doc)?;
        let info = LogoutResponseInfo::parse(root)?;

        let pending = info
            .in_response_to
            .as_deref()
            .map(|id| self.pending.take(id, PendingKind::Logout, &config.tenant_id));

        let signed = decoded.query_signature.is_some()
            || child_element(root, NS_DSIG, "Signature").is_some();
        check_destination(info.destination.as_deref(), config.slo_url.as_deref(), signed)?;
        check_issuer(info.issuer.as_deref(), &config.idp_entity_id, false)?;
        let pending = pending.transpose()?.ok_or_else(|| {
            SamlError::ReplayOrUnknownRequest("LogoutResponse without InResponseTo".into())
        })?;

        let check = verify_message(&config.verifier(), &doc, root, decoded)?;
        require_message_signature(config, &check)?;

        if !info.status.is_success() {
            return Err(SamlError::StatusDenied {
                status: info.status.effective_code().to_string(),
                message: info.status.message.clone(),
            });
        }

        tracing::info!(
            tenant = %config.tenant_id,
            session_id = ?pending.session_id,
            "Single logout completed"
        );
        metrics::record_saml_logout("sp_initiated");
        Ok(LogoutOutcome::LoggedOut {
            relay_state: pending.relay_state.or_else(|| decoded.relay_state.clone()),
        })
    }

    async fn logout_request(
        &self,
        config: &TrustConfig,
        decoded: &DecodedMessage,
    ) -> Result<LogoutOutcome, SamlError> {
        let info = self.validate_logout_request(config, decoded)?;
        let name_id = info
            .name_id
            .ok_or_else(|| SamlError::Decode("LogoutRequest has no NameID".into()))?;

        let removed = self
            .sessions
            .delete_matching(&config.tenant_id, &name_id.value, &info.session_indexes)
            .await?;
        tracing::info!(
            tenant = %config.tenant_id,
            request_id = %info.id,
            sessions = removed,
            "IdP-initiated logout"
        );

        let slo = config.slo.as_ref().ok_or_else(|| {
            SamlError::Configuration(format!(
                "tenant '{}' has no IdP single logout endpoint",
                config.tenant_id
            ))
        })?;
        let response = build_logout_response(
            &config.sp_entity_id,
            &slo.url,
            &info.id,
            STATUS_SUCCESS,
        );
        let binding = match decoded.binding {
            Binding::Paos => Binding::Paos,
            _ => front_channel(slo.binding),
        };
        let message = binding::encode(
            &response.xml,
            MessageKind::Response,
            binding,
            &slo.url,
            decoded.relay_state.as_deref(),
            config.outbound_signing_key()?,
        )?;
        metrics::record_saml_logout("idp_initiated");
        Ok(LogoutOutcome::Respond(message))
    }

    fn validate_logout_request(
        &self,
        config: &TrustConfig,
        decoded: &DecodedMessage,
    ) -> Result<LogoutRequestInfo, SamlError> {
        let doc = xml::parse(&decoded.xml)?;
        let root = soap::message_root(&doc)?;
        let info = LogoutRequestInfo::parse(root)?;

        let signed = decoded.query_signature.is_some()
            || child_element(root, NS_DSIG, "Signature").is_some();
        check_destination(info.destination.as_deref(), config.slo_url.as_deref(), signed)?;
        check_issuer(info.issuer.as_deref(), &config.idp_entity_id, true)?;

        let check = verify_message(&config.verifier(), &doc, root, decoded)?;
        require_message_signature(config, &check)?;

        if let Some(deadline) = info.not_on_or_after
            && Utc::now() - config.clock_skew >= deadline
        {
            return Err(SamlError::ExpiredAssertion("LogoutRequest has expired".into()));
        }
        Ok(info)
    }
}

/// Issuer of a decoded message, for issuer-based tenant resolution.
pub fn peek_issuer(decoded: &DecodedMessage) -> Option<String> {
    let doc = xml::parse(&decoded.xml).ok()?;
    let root = soap::message_root(&doc).ok()?;
    child_element(root, NS_ASSERTION, "Issuer").map(trimmed_text)
}

/// The latest instant at which any part of the assertion still holds.
fn assertion_deadline(assertion: &Assertion) -> Option<DateTime<Utc>> {
    assertion
        .conditions
        .as_ref()
        .and_then(|c| c.not_on_or_after)
        .into_iter()
        .chain(
            assertion
                .subject_confirmations
                .iter()
                .filter_map(|c| c.not_on_or_after),
        )
        .max()
}

/// SLO messages travel through the browser; PAOS is only for login.
fn front_channel(binding: Binding) -> Binding {
    match binding {
        Binding::Paos => Binding::Redirect,
        other => other,
    }
}

fn verify_message(
    verifier: &SignatureVerifier<'_>,
    doc: &Document<'_>,
    root: Node<'_, '_>,
    decoded: &DecodedMessage,
) -> Result<SignatureCheck, SamlError> {
    match &decoded.query_signature {
        Some(query) => verifier.verify_query(query).map(SignatureCheck::Verified),
        None => verifier.verify_element(doc, root, None),
    }
}

fn require_message_signature(config: &TrustConfig, check: &SignatureCheck) -> Result<(), SamlError> {
    if config.signatures.wants_message_signature() && !check.is_verified() {
        return Err(SamlError::NoSignaturePresent("message"));
    }
    Ok(())
}

/// A present Destination must be ours; a signed message must carry one.
fn check_destination(
    actual: Option<&str>,
    expected: Option<&str>,
    signed: bool,
) -> Result<(), SamlError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    match actual {
        Some(actual) if actual == expected => Ok(()),
        None if !signed => Ok(()),
        other => Err(SamlError::InvalidDestination {
            expected: expected.to_string(),
            actual: other.unwrap_or_default().to_string(),
        }),
    }
}

fn check_issuer(actual: Option<&str>, expected: &str, required: bool) -> Result<(), SamlError> {
    match actual {
        Some(actual) if actual == expected => Ok(()),
        None if !required => Ok(()),
        other => Err(SamlError::InvalidIssuer {
            expected: expected.to_string(),
            actual: other.unwrap_or_default().to_string(),
        }),
    }
}

fn check_conditions(
    assertion: &Assertion,
    config: &TrustConfig,
    now: DateTime<Utc>,
) -> Result<(), SamlError> {
    let Some(conditions) = &assertion.conditions else {
        return Ok(());
    };
    let skew = config.clock_skew;
    if let Some(not_before) = conditions.not_before
        && now + skew < not_before
    {
        return Err(SamlError::ExpiredAssertion(format!(
            "assertion not valid before {}",
            not_before
        )));
    }
    if let Some(not_on_or_after) = conditions.not_on_or_after
        && now - skew >= not_on_or_after
    {
        return Err(SamlError::ExpiredAssertion(format!(
            "assertion expired at {}",
            not_on_or_after
        )));
    }
    for audiences in &conditions.audience_restrictions {
        if !audiences.iter().any(|a| a == &config.sp_entity_id) {
            return Err(SamlError::InvalidAudience(config.sp_entity_id.clone()));
        }
    }
    Ok(())
}

fn check_subject_confirmation(
    confirmation: &SubjectConfirmation,
    config: &TrustConfig,
    in_response_to: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), SamlError> {
    if confirmation.method.as_deref() != Some(CM_BEARER) {
        return Err(SamlError::Decode(format!(
            "unsupported subject confirmation method '{}'",
            confirmation.method.as_deref().unwrap_or_default()
        )));
    }
    if let Some(not_on_or_after) = confirmation.not_on_or_after
        && now - config.clock_skew >= not_on_or_after
    {
        return Err(SamlError::ExpiredAssertion(
            "subject confirmation expired".into(),
        ));
    }
    if let Some(recipient) = &confirmation.recipient
        && recipient != &config.acs_url
    {
        return Err(SamlError::InvalidDestination {
            expected: config.acs_url.clone(),
            actual: recipient.clone(),
        });
    }
    if let Some(expected) = &confirmation.in_response_to
        && Some(expected.as_str()) != in_response_to
    {
        return Err(SamlError::ReplayOrUnknownRequest(format!(
            "subject confirmation answers '{}'",
            expected
        )));
    }
    Ok(())
}

/// When confirmations are present, at least one bearer confirmation must
/// hold. The first failure is reported.
fn check_subject_confirmations(
    assertion: &Assertion,
    config: &TrustConfig,
    in_response_to: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), SamlError> {
    let mut first_error = None;
    for confirmation in &assertion.subject_confirmations {
        match check_subject_confirmation(confirmation, config, in_response_to, now) {
            Ok(()) => return Ok(()),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::session::MemorySessionStore;

    fn config() -> TrustConfig {
        TrustConfig::new(
            "demo",
            "https://idp.example.com",
            "https://idp.example.com/sso",
            "https://sp.example.com",
            "https://sp.example.com/demo/saml/acs",
        )
    }

    fn engine() -> SamlEngine {
        SamlEngine::new(Arc::new(MemorySessionStore::new()))
    }

    #[rstest]
    #[case(None, Some("https://sp/acs"), false, true)]
    #[case(None, Some("https://sp/acs"), true, false)]
    #[case(Some("https://sp/acs"), Some("https://sp/acs"), true, true)]
    #[case(Some("https://evil/acs"), Some("https://sp/acs"), false, false)]
    #[case(Some("https://evil/acs"), None, true, true)]
    fn test_check_destination(
        #[case] actual: Option<&str>,
        #[case] expected: Option<&str>,
        #[case] signed: bool,
        #[case] ok: bool,
    ) {
        assert_eq!(check_destination(actual, expected, signed).is_ok(), ok);
    }

    #[test]
    fn test_check_issuer() {
        assert!(check_issuer(None, "idp", false).is_ok());
        assert!(matches!(
            check_issuer(None, "idp", true),
            Err(SamlError::InvalidIssuer { .. })
        ));
        assert!(matches!(
            check_issuer(Some("other"), "idp", false),
            Err(SamlError::InvalidIssuer { .. })
        ));
    }

    #[test]
    fn test_conditions_respect_clock_skew() {
        let config = config();
        let now = Utc::now();
        let mut assertion = Assertion {
            conditions: Some(crate::saml::model::Conditions {
                not_before: Some(now + Duration::seconds(10)),
                not_on_or_after: Some(now - Duration::seconds(10)),
                audience_restrictions: vec![vec!["https://sp.example.com".into()]],
            }),
            ..Default::default()
        };
        assert!(check_conditions(&assertion, &config, now).is_ok());

        if let Some(conditions) = assertion.conditions.as_mut() {
            conditions.not_on_or_after = Some(now - Duration::seconds(31));
        }
        assert!(matches!(
            check_conditions(&assertion, &config, now),
            Err(SamlError::ExpiredAssertion(_))
        ));
    }

    #[test]
    fn test_every_audience_restriction_must_name_the_sp() {
        let config = config();
        let assertion = Assertion {
            conditions: Some(crate::saml::model::Conditions {
                not_before: None,
                not_on_or_after: None,
                audience_restrictions: vec![
                    vec!["https://sp.example.com".into()],
                    vec!["https://other.example.com".into()],
                ],
            }),
            ..Default::default()
        };
        assert!(matches!(
            check_conditions(&assertion, &config, Utc::now()),
            Err(SamlError::InvalidAudience(_))
        ));
    }

    #[test]
    fn test_one_valid_subject_confirmation_is_enough() {
        let config = config();
        let bad = SubjectConfirmation {
            method: Some(CM_BEARER.into()),
            recipient: Some("https://evil.example.com/acs".into()),
            not_on_or_after: None,
            in_response_to: None,
        };
        let good = SubjectConfirmation {
            method: Some(CM_BEARER.into()),
            recipient: Some(config.acs_url.clone()),
            not_on_or_after: Some(Utc::now() + Duration::minutes(5)),
            in_response_to: Some("ID_1".into()),
        };
        let mut assertion = Assertion {
            subject_confirmations: vec![bad.clone()],
            ..Default::default()
        };
        assert!(matches!(
            check_subject_confirmations(&assertion, &config, Some("ID_1"), Utc::now()),
            Err(SamlError::InvalidDestination { .. })
        ));

        assertion.subject_confirmations.push(good);
        assert!(check_subject_confirmations(&assertion, &config, Some("ID_1"), Utc::now()).is_ok());
        assert!(matches!(
            check_subject_confirmations(&assertion, &config, Some("ID_2"), Utc::now()),
            Err(SamlError::InvalidDestination { .. })
        ));
    }

    #[test]
    fn test_start_login_records_pending_request() {
        let engine = engine();
        let message = engine
            .start_login(
                &config(),
                LoginOptions {
                    relay_state: Some("/home".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        let OutboundMessage::Redirect { url } = message else {
            panic!("expected a redirect");
        };
        assert!(url.starts_with("https://idp.example.com/sso?SAMLRequest="));
        assert!(url.contains("RelayState=%2Fhome"));
        assert_eq!(engine.pending().len(), 1);
    }

    #[test]
    fn test_start_login_paos_returns_ecp_envelope() {
        let engine = engine();
        let message = engine
            .start_login(
                &config(),
                LoginOptions {
                    binding: Some(Binding::Paos),
                    ..Default::default()
                },
            )
            .unwrap();
        let OutboundMessage::Soap { envelope } = message else {
            panic!("expected a SOAP envelope");
        };
        assert!(envelope.contains("AuthnRequest"));
        assert!(envelope.contains(BINDING_PAOS));
        assert_eq!(engine.pending().len(), 1);
    }

    #[test]
    fn test_login_outcome_into_session() {
        let err = LoginOutcome::NoPrincipal.into_session().unwrap_err();
        assert_eq!(err.reason().as_str(), "STATUS_DENIED");
    }

    #[tokio::test]
    async fn test_local_logout_without_idp_slo() {
        let engine = engine();
        let config = config();
        let session = Session {
            id: Uuid::new_v4(),
            tenant: "demo".into(),
            principal: "alice".into(),
            name_id: Some("alice".into()),
            name_id_format: None,
            session_index: None,
            attributes: Default::default(),
            friendly_attributes: Default::default(),
            roles: Default::default(),
            issuer: config.idp_entity_id.clone(),
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::hours(1),
        };
        engine.sessions().create_session(session.clone()).await.unwrap();

        let outbound = engine.start_logout(&config, &session, None).await.unwrap();
        assert!(outbound.is_none());
        assert!(engine.sessions().get_session(session.id).await.unwrap().is_none());
        assert!(engine.pending().is_empty());
    }
}
