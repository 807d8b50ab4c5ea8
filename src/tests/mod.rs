//! End-to-end flows against an in-test identity provider.
