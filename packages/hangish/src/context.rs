//! Shared session context: one transport, one cookie store.

use std::sync::Arc;

use crate::cookies::{AUTH_COOKIE_NAMES, CookieStore, parse_set_cookie};
use crate::error::HttpError;
use crate::http::{HttpRequest, HttpResponse, HttpStream, HttpTransport, set_cookie_headers};

/// Which cookies go out on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieScope {
    All,
    /// Only [`AUTH_COOKIE_NAMES`]; the RPC endpoint rejects the rest.
    AuthOnly,
}

/// Owns the HTTP transport and the cookie store and is cloned into every
/// component that talks to the service.
///
/// Cookies are read when a request is dispatched, never when it is built, so
/// a rotation that lands in between is not lost.
pub struct SessionContext<H> {
    transport: Arc<H>,
    cookies: CookieStore,
    user_agent: Arc<str>,
}

impl<H> Clone for SessionContext<H> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            cookies: self.cookies.clone(),
            user_agent: Arc::clone(&self.user_agent),
        }
    }
}

impl<H: HttpTransport> SessionContext<H> {
    pub fn new(transport: H, cookies: CookieStore, user_agent: impl Into<String>) -> Self {
        Self {
            transport: Arc::new(transport),
            cookies,
            user_agent: Arc::from(user_agent.into()),
        }
    }

    pub fn cookies(&self) -> &CookieStore {
        &self.cookies
    }

    pub fn transport(&self) -> &H {
        &self.transport
    }

    pub async fn open(&self, request: HttpRequest) -> Result<HttpStream, HttpError> {
        self.open_scoped(request, CookieScope::All).await
    }

    pub async fn open_scoped(
        &self,
        mut request: HttpRequest,
        scope: CookieScope,
    ) -> Result<HttpStream, HttpError> {
        let snapshot = self.cookies.snapshot();
        let cookie_header = match scope {
            CookieScope::All => snapshot.header_value(),
            CookieScope::AuthOnly => {
                snapshot.header_value_matching(|name| AUTH_COOKIE_NAMES.contains(&name))
            }
        };
        if let Some(value) = cookie_header {
            request.headers.push(("Cookie".into(), value));
        }
        request
            .headers
            .push(("User-Agent".into(), self.user_agent.to_string()));
        self.transport.open(request).await
    }

    /// Open and read the whole body.
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        self.open(request).await?.collect().await
    }

    pub async fn execute_scoped(
        &self,
        request: HttpRequest,
        scope: CookieScope,
    ) -> Result<HttpResponse, HttpError> {
        self.open_scoped(request, scope).await?.collect().await
    }

    /// Add response cookies whose names are new. Returns the added names.
    pub fn absorb(&self, headers: &[(String, String)]) -> Vec<String> {
        let incoming: Vec<_> = set_cookie_headers(headers).filter_map(parse_set_cookie).collect();
        self.cookies.update(|set| set.absorb_new(incoming))
    }

    /// Take every response cookie, overwriting held values. Returns the
    /// names written.
    pub fn merge(&self, headers: &[(String, String)]) -> Vec<String> {
        let incoming: Vec<_> = set_cookie_headers(headers).filter_map(parse_set_cookie).collect();
        self.cookies.update(|set| {
            incoming
                .into_iter()
                .map(|cookie| {
                    let name = cookie.name.clone();
                    set.insert(cookie);
                    name
                })
                .collect()
        })
    }

    /// Overwrite cookies the store already holds. Returns the rotated names.
    pub fn rotate(&self, headers: &[(String, String)]) -> Vec<String> {
        let incoming: Vec<_> = set_cookie_headers(headers).filter_map(parse_set_cookie).collect();
        if incoming.is_empty() {
            return Vec::new();
        }
        self.cookies.update(|set| set.rotate_existing(incoming))
    }
}
