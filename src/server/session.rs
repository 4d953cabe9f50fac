// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The view of a session that the engine needs: identity for transfer checks and the secure
//! channel the session is currently bound to. Session and secure channel management proper is
//! owned by the transport.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::types::MessageSecurityMode;

pub const ANONYMOUS_USER_TOKEN_ID: &str = "ANONYMOUS";

/// Identifies an authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserToken(pub String);

impl UserToken {
    pub fn anonymous() -> Self {
        UserToken(ANONYMOUS_USER_TOKEN_ID.to_string())
    }

    pub fn is_anonymous(&self) -> bool {
        self.0 == ANONYMOUS_USER_TOKEN_ID
    }
}

/// Key used to identify a user.
/// Goes beyond just the identity token, since transferring a subscription also
/// depends on the application URI and security mode.
#[derive(Debug, Clone)]
pub struct UserSecurityKey {
    pub token: UserToken,
    pub security_mode: MessageSecurityMode,
    pub application_uri: String,
}

impl UserSecurityKey {
    pub fn new(token: UserToken, security_mode: MessageSecurityMode, application_uri: &str) -> Self {
        Self {
            token,
            security_mode,
            application_uri: application_uri.to_owned(),
        }
    }

    /// Tests if `other`, the identity of a session asking for a transfer, may take over a
    /// subscription owned by `self`. Anonymous identities only match over a signed channel
    /// from the same application.
    pub fn is_equivalent_for_transfer(&self, other: &UserSecurityKey) -> bool {
        if self.token.is_anonymous() {
            other.token.is_anonymous()
                && matches!(
                    other.security_mode,
                    MessageSecurityMode::Sign | MessageSecurityMode::SignAndEncrypt
                )
                && self.application_uri == other.application_uri
        } else {
            other.token == self.token
        }
    }
}

/// A session as seen by the publish / subscribe engine.
#[derive(Debug)]
pub struct Session {
    session_id: u32,
    security_key: UserSecurityKey,
    /// The secure channel the session is currently activated on
    secure_channel_id: AtomicU32,
    closed: AtomicBool,
}

impl Session {
    pub fn new(session_id: u32, secure_channel_id: u32, security_key: UserSecurityKey) -> Self {
        Self {
            session_id,
            security_key,
            secure_channel_id: AtomicU32::new(secure_channel_id),
            closed: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn security_key(&self) -> &UserSecurityKey {
        &self.security_key
    }

    pub fn secure_channel_id(&self) -> u32 {
        self.secure_channel_id.load(Ordering::Acquire)
    }

    /// Called when the session is activated on another secure channel. Requests queued on the
    /// previous channel become invalid.
    pub fn set_secure_channel_id(&self, secure_channel_id: u32) {
        self.secure_channel_id
            .store(secure_channel_id, Ordering::Release);
    }

    pub fn is_secure_channel_valid(&self, secure_channel_id: u32) -> bool {
        !self.is_closed() && self.secure_channel_id() == secure_channel_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Per-request context passed into every engine operation.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub session: Arc<Session>,
    pub request_handle: u32,
    /// The secure channel the request arrived on
    pub secure_channel_id: u32,
    /// Absolute time at which the request times out
    pub deadline: Instant,
    /// Diagnostics mask requested by the client
    pub return_diagnostics: u32,
}

impl OperationContext {
    pub fn new(session: Arc<Session>, request_handle: u32, timeout: Duration) -> Self {
        let secure_channel_id = session.secure_channel_id();
        Self {
            session,
            request_handle,
            secure_channel_id,
            deadline: Instant::now() + timeout,
            return_diagnostics: 0,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session.session_id()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(token: UserToken, mode: MessageSecurityMode, uri: &str) -> UserSecurityKey {
        UserSecurityKey::new(token, mode, uri)
    }

    #[test]
    fn transfer_equivalence() {
        let anon = key(UserToken::anonymous(), MessageSecurityMode::None, "urn:a");
        // Anonymous over an unsigned channel is never equivalent
        assert!(!anon.is_equivalent_for_transfer(&anon));
        let anon_signed = key(UserToken::anonymous(), MessageSecurityMode::Sign, "urn:a");
        assert!(anon.is_equivalent_for_transfer(&anon_signed));
        let anon_other_app = key(UserToken::anonymous(), MessageSecurityMode::Sign, "urn:b");
        assert!(!anon.is_equivalent_for_transfer(&anon_other_app));

        let user = key(UserToken("bob".into()), MessageSecurityMode::None, "urn:a");
        let same_user = key(UserToken("bob".into()), MessageSecurityMode::None, "urn:x");
        let other_user = key(UserToken("alice".into()), MessageSecurityMode::None, "urn:a");
        assert!(user.is_equivalent_for_transfer(&same_user));
        assert!(!user.is_equivalent_for_transfer(&other_user));
        assert!(!user.is_equivalent_for_transfer(&anon_signed));
    }

    #[test]
    fn secure_channel_validity() {
        let session = Session::new(
            1,
            10,
            key(UserToken::anonymous(), MessageSecurityMode::None, ""),
        );
        assert!(session.is_secure_channel_valid(10));
        session.set_secure_channel_id(11);
        assert!(!session.is_secure_channel_valid(10));
        assert!(session.is_secure_channel_valid(11));
        session.set_closed();
        assert!(!session.is_secure_channel_valid(11));
    }
}
