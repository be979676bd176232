use std::collections::BTreeMap;

use bincode::{Decode, Encode};

use super::{Controller, StreamError};

/// Credential mapping sent in an authentication request, e.g. `name` and `password`.
pub type Credentials = BTreeMap<String, String>;

/// Outcome of one authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Authorization {
    authenticated: bool,
    reason: Option<String>,
}

impl Authorization {
    pub fn new(authenticated: bool, reason: Option<String>) -> Self {
        Self {
            authenticated,
            reason,
        }
    }

    pub fn accepted() -> Self {
        Self::new(true, None)
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::new(false, Some(reason.into()))
    }

    pub fn authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Turns a rejection into [`StreamError::AuthenticationRejected`].
    pub fn into_result(self) -> Result<Self, StreamError> {
        if self.authenticated {
            Ok(self)
        } else {
            Err(StreamError::AuthenticationRejected(self.reason))
        }
    }
}

impl From<bool> for Authorization {
    fn from(authenticated: bool) -> Self {
        Self::new(authenticated, None)
    }
}

/// Host callbacks invoked by a [`Controller`] at its state transitions.
///
/// Hooks run synchronously on whichever thread drives the controller and must not block on
/// that same controller's receive half.
pub trait SubscriptionHooks: Send + Sync {
    /// Decides on the first message of a connection.
    fn authenticate(&self, controller: &Controller, credentials: &Credentials) -> Authorization;

    fn on_join(&self, _controller: &Controller) {}

    /// Called after a rejection has been sent to the peer. The controller is closed once this
    /// returns, whether or not the hook closed it.
    fn on_unauthenticated(&self, _controller: &Controller, _authorization: &Authorization) {}

    fn on_disconnect(&self, _controller: &Controller) {}

    /// Receives every per-connection failure other than a plain disconnect.
    fn on_error(&self, _controller: &Controller, _error: &StreamError) {}
}

/// Accepts exactly the listed credential mappings.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    allowed: Vec<Credentials>,
}

impl AllowList {
    pub fn new(allowed: Vec<Credentials>) -> Self {
        Self { allowed }
    }

    pub fn allow(mut self, credentials: Credentials) -> Self {
        self.allowed.push(credentials);
        self
    }

    pub fn check(&self, credentials: &Credentials) -> Authorization {
        if self.allowed.contains(credentials) {
            Authorization::accepted()
        } else {
            Authorization::rejected("unknown credentials")
        }
    }
}

impl SubscriptionHooks for AllowList {
    fn authenticate(&self, _controller: &Controller, credentials: &Credentials) -> Authorization {
        self.check(credentials)
    }
}
