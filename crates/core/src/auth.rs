// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Authentication hook: an external collaborator consulted before a producer
//! reserves a mount, or a listener joins one. The core never inspects the
//! request itself beyond handing it through; the concrete check (htpasswd,
//! LDAP, URL authenticator, ...) lives entirely outside the core.

/// Outcome of an authentication check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Ok,
    Failed,
    /// No authenticator is configured for this mount; the caller should
    /// treat this the same as a match against a default-allow policy, which
    /// is itself an authenticator's concern, not the core's.
    NoMatch,
}

impl AuthOutcome {
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Whatever the transport layer can hand the authenticator: the raw request
/// bits it needs (basic-auth header, source credentials, query string, ...).
/// The core treats this as opaque.
pub trait AuthRequest: Send + Sync {
    fn header(&self, name: &str) -> Option<&str>;
}

/// Authentication hook consulted before reserving or joining a mount. Any
/// outcome other than `Ok` means "close the connection"; the core does not
/// interpret the reason.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, mount: &str, request: &dyn AuthRequest) -> AuthOutcome;
}

/// An [`Authenticator`] that admits everyone. Useful for mounts with no
/// configured authenticator and for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _mount: &str, _request: &dyn AuthRequest) -> AuthOutcome {
        AuthOutcome::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptyRequest;
    impl AuthRequest for EmptyRequest {
        fn header(&self, _name: &str) -> Option<&str> {
            None
        }
    }

    #[test]
    fn allow_all_always_ok() {
        let auth = AllowAll;
        assert_eq!(auth.authenticate("/live", &EmptyRequest), AuthOutcome::Ok);
        assert!(auth.authenticate("/live", &EmptyRequest).is_ok());
    }
}
