//! Rate limit key resolution.

use std::fmt;
use std::net::IpAddr;

/// Key substituted for an identifier that came out empty.
pub const UNRESOLVED: &str = "unresolved";

/// What the limiter knows about an inbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Authenticated principal, if the call carried one
    pub user_id: Option<String>,
    /// Network address of the caller
    pub client_addr: IpAddr,
    /// Logical route path of the call
    pub route: Option<String>,
}

impl RequestContext {
    /// Context for an anonymous call from `client_addr`.
    pub fn anonymous(client_addr: IpAddr) -> Self {
        Self {
            user_id: None,
            client_addr,
            route: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }
}

/// How far an identifier is narrowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyScope {
    /// One budget per caller, shared by every route
    #[default]
    PerCaller,
    /// Independent budgets for each route a caller hits
    PerRoute,
}

/// The key a bucket is tracked under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier(String);

impl Identifier {
    /// Wrap an already-built key, e.g. one supplied by an operator.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive the key for a call.
    ///
    /// An authenticated user wins over the network address; with
    /// [`KeyScope::PerRoute`] the route is appended.
    pub fn resolve(ctx: &RequestContext, scope: KeyScope) -> Self {
        let base = match ctx.user_id.as_deref().map(str::trim) {
            Some(user) if !user.is_empty() => format!("user:{}", user),
            _ => format!("ip:{}", ctx.client_addr),
        };

        match (scope, ctx.route.as_deref()) {
            (KeyScope::PerRoute, Some(route)) if !route.is_empty() => {
                Self(format!("{}:{}", base, route))
            }
            _ => Self(base),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
