//! SAML 2.0 Web Browser SSO, ECP and Single Logout for a Service Provider.
//!
//! Inbound messages flow binding → signature → decryption → engine checks →
//! mapper. Nothing reaches the session layer until every check has passed.

pub mod binding;
pub mod constants;
mod decrypt;
mod engine;
pub mod error;
mod logout;
pub mod mapper;
mod metadata;
pub mod model;
mod request;
pub mod signature;
pub mod xml;

pub use binding::{Binding, DecodedMessage, InboundMessage, MessageKind, OutboundMessage};
#[cfg(test)]
pub(crate) use decrypt::test_support as encryption_support;
pub use decrypt::decrypt_assertion;
pub use engine::{
    LoginCompletion, LoginOptions, LoginOutcome, LogoutOutcome, SamlEngine, peek_issuer,
};
pub use error::{ErrorReason, SamlError};
pub use logout::{LogoutSubject, OutboundLogout, build_logout_request, build_logout_response};
pub use metadata::sp_metadata;
pub use request::{AuthnRequest, AuthnRequestOptions, build_authn_request, new_request_id};
