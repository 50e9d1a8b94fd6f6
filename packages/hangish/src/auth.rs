//! Account login: stored cookies, or the GALX / credentials / PIN handshake.
//!
//! ```text
//! Initial ──authenticate──▶ Authenticated              (cookie file present)
//!    │
//!    └──▶ GalxRequested ──submit_credentials──▶ CredentialsSent
//!                                                  │
//!              ┌───────────────────────────────────┼──────────────┐
//!              ▼                                   ▼              ▼
//!        Authenticated                 AwaitingSecondFactor    Failed
//!                                                  │
//!                             submit_second_factor_pin
//!                                                  ▼
//!                                          SecondFactorSent ──▶ Authenticated | Failed
//! ```
//!
//! Nothing here retries on its own. A wrong password or PIN is reported and
//! the caller decides what to do next.

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::context::SessionContext;
use crate::cookies::{CookieFile, SessionCookieSet, parse_set_cookie};
use crate::error::AuthError;
use crate::http::{HttpRequest, HttpResponse, HttpTransport, set_cookie_headers};

/// Anti-forgery cookie handed out with the login page.
pub const GALX_COOKIE: &str = "GALX";

pub const MAX_REDIRECTS: usize = 10;

const SEC_TOK_MARKER: &str = "id=\"secTok\"";
const TIME_STMP_MARKER: &str = "id=\"timeStmp\"";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Initial,
    GalxRequested,
    CredentialsSent,
    AwaitingSecondFactor,
    SecondFactorSent,
    Authenticated,
    Failed(AuthError),
}

impl AuthState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::GalxRequested => "galx_requested",
            Self::CredentialsSent => "credentials_sent",
            Self::AwaitingSecondFactor => "awaiting_second_factor",
            Self::SecondFactorSent => "second_factor_sent",
            Self::Authenticated => "authenticated",
            Self::Failed(_) => "failed",
        }
    }
}

/// What the caller has to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    CredentialsRequired,
    SecondFactorRequired,
    Authenticated(SessionCookieSet),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    CredentialsRequired,
    SecondFactorRequired,
    /// Carries the cookie names, never their values.
    Authenticated { cookies: Vec<String> },
    Failed(AuthError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SecondFactorTokens {
    sec_tok: String,
    time_stmp: String,
}

#[derive(Clone, Copy)]
enum Step {
    Credentials,
    SecondFactor,
}

pub struct AuthSession<H> {
    ctx: SessionContext<H>,
    config: AuthConfig,
    cookie_file: CookieFile,
    state: AuthState,
    galx: Option<String>,
    second_factor: Option<SecondFactorTokens>,
    events: broadcast::Sender<AuthEvent>,
}

impl<H: HttpTransport> AuthSession<H> {
    pub fn new(ctx: SessionContext<H>, config: AuthConfig, cookie_file: CookieFile) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            ctx,
            config,
            cookie_file,
            state: AuthState::Initial,
            galx: None,
            second_factor: None,
            events,
        }
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    /// Sign in from the cookie file if there is one, otherwise start the
    /// handshake by fetching the GALX token.
    pub async fn authenticate(&mut self) -> Result<AuthOutcome, AuthError> {
        self.ctx.cookies().replace(SessionCookieSet::new());
        let stored = match self.cookie_file.load() {
            Ok(stored) => stored,
            Err(e) => return Err(self.fail(e.into())),
        };
        match stored {
            Some(cookies) => {
                info!(
                    path = %self.cookie_file.path().display(),
                    count = cookies.len(),
                    "signed in from stored cookies"
                );
                self.ctx.cookies().replace(cookies.clone());
                self.set_authenticated(&cookies);
                Ok(AuthOutcome::Authenticated(cookies))
            }
            None => self.fetch_galx_token().await,
        }
    }

    /// GET the login page for a fresh GALX token. Also the way back in after
    /// a failed attempt.
    pub async fn fetch_galx_token(&mut self) -> Result<AuthOutcome, AuthError> {
        self.ctx.cookies().replace(SessionCookieSet::new());
        self.galx = None;
        self.second_factor = None;
        self.state = AuthState::GalxRequested;

        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("passive", "true")
            .append_pair("skipvpage", "true")
            .append_pair("continue", &self.config.continue_url)
            .append_pair("authuser", "0")
            .finish();
        let request = HttpRequest::get(format!("{}?{query}", self.config.login_url));
        debug!(url = %self.config.login_url, "requesting login token");

        let response = match self.ctx.execute(request).await {
            Ok(response) => response,
            Err(e) => return Err(self.fail(AuthError::TokenFetchFailed(e.to_string()))),
        };
        self.ctx.absorb(&response.headers);

        let galx = set_cookie_headers(&response.headers)
            .filter_map(parse_set_cookie)
            .find(|c| c.name == GALX_COOKIE);
        let Some(galx) = galx else {
            return Err(self.fail(AuthError::TokenFetchFailed(format!(
                "login page (HTTP {}) set no {GALX_COOKIE} cookie",
                response.status
            ))));
        };
        self.galx = Some(galx.value);
        self.emit(AuthEvent::CredentialsRequired);
        Ok(AuthOutcome::CredentialsRequired)
    }

    pub async fn submit_credentials(
        &mut self,
        email: &str,
        password: &str,
    ) -> Result<AuthOutcome, AuthError> {
        let galx = match (&self.state, &self.galx) {
            (AuthState::GalxRequested, Some(galx)) => galx.clone(),
            _ => return Err(self.invalid_state("submit credentials")),
        };
        self.state = AuthState::CredentialsSent;
        info!("submitting credentials");

        let request = HttpRequest::post(self.config.login_auth_url.clone()).form([
            ("GALX", galx.as_str()),
            ("Email", email),
            ("Passwd", password),
            ("bgresponse", "js_disabled"),
            ("dnConn", "0"),
            ("signIn", "Accedi"),
            ("checkedDomains", "youtube"),
            ("PersistentCookie", "yes"),
            ("rmShown", "1"),
            ("pstMsg", "0"),
            ("skipvpage", "true"),
            ("continue", self.config.continue_url.as_str()),
        ]);
        self.send(request, Step::Credentials).await
    }

    /// Retrying is allowed after a wrong PIN; the challenge tokens are kept.
    pub async fn submit_second_factor_pin(&mut self, pin: &str) -> Result<AuthOutcome, AuthError> {
        let retry = matches!(self.state, AuthState::Failed(AuthError::WrongSecondFactorPin));
        let tokens = match (&self.state, &self.second_factor) {
            (AuthState::AwaitingSecondFactor, Some(tokens)) => tokens.clone(),
            (_, Some(tokens)) if retry => tokens.clone(),
            _ => return Err(self.invalid_state("submit a second-factor pin")),
        };
        self.state = AuthState::SecondFactorSent;
        info!("submitting second-factor pin");

        let request = HttpRequest::post(self.config.second_factor_url.clone()).form([
            ("timeStmp", tokens.time_stmp.as_str()),
            ("secTok", tokens.sec_tok.as_str()),
            ("smsUserPin", pin),
            ("smsVerifyPin", "Verify"),
            ("smsToken", ""),
            ("checkedConnection", "youtube:73:0"),
            ("checkedDomains", "youtube"),
            ("PersistentCookie", "on"),
            ("PersistentOptionSelection", "1"),
            ("pstMsg", "0"),
            ("skipvpage", "true"),
        ]);
        self.send(request, Step::SecondFactor).await
    }

    /// Sign out locally: delete the cookie file and start over.
    pub fn forget(&mut self) -> Result<(), AuthError> {
        self.cookie_file.remove()?;
        self.ctx.cookies().replace(SessionCookieSet::new());
        self.galx = None;
        self.second_factor = None;
        self.state = AuthState::Initial;
        info!(path = %self.cookie_file.path().display(), "stored cookies removed");
        Ok(())
    }

    /// Send a login step and follow redirects until a final answer.
    async fn send(&mut self, request: HttpRequest, step: Step) -> Result<AuthOutcome, AuthError> {
        let mut response = match self.ctx.execute(request).await {
            Ok(response) => response,
            Err(e) => return Err(self.fail(e.into())),
        };
        let mut redirects = 0;
        loop {
            self.ctx.absorb(&response.headers);
            let target = response
                .is_redirect()
                .then(|| response.redirect_target())
                .flatten();
            let Some(target) = target else {
                return match step {
                    Step::Credentials => self.after_credentials(&response),
                    Step::SecondFactor => self.after_second_factor(&response),
                };
            };
            if redirects == MAX_REDIRECTS {
                return Err(self.fail(AuthError::Unknown(format!(
                    "more than {MAX_REDIRECTS} redirects"
                ))));
            }
            redirects += 1;
            debug!(%target, "following login redirect");
            response = match self.ctx.execute(HttpRequest::get(target)).await {
                Ok(response) => response,
                Err(e) => return Err(self.fail(e.into())),
            };
        }
    }

    fn after_credentials(&mut self, response: &HttpResponse) -> Result<AuthOutcome, AuthError> {
        if response.status != 200 {
            return Err(self.fail(AuthError::Unknown(format!("HTTP {}", response.status))));
        }
        if self.ctx.cookies().snapshot().has_auth_quorum() {
            return Ok(self.authenticated());
        }
        if response.url.starts_with(&self.config.second_factor_url) {
            let body = response.text();
            let tokens = attribute_token(&body, SEC_TOK_MARKER)
                .zip(attribute_token(&body, TIME_STMP_MARKER))
                .map(|(sec_tok, time_stmp)| SecondFactorTokens { sec_tok, time_stmp });
            let Some(tokens) = tokens else {
                return Err(self.fail(AuthError::Unknown(
                    "second-factor page without challenge tokens".into(),
                )));
            };
            info!("second factor required");
            self.second_factor = Some(tokens);
            self.state = AuthState::AwaitingSecondFactor;
            self.emit(AuthEvent::SecondFactorRequired);
            return Ok(AuthOutcome::SecondFactorRequired);
        }
        self.ctx.cookies().replace(SessionCookieSet::new());
        Err(self.fail(AuthError::WrongCredentials))
    }

    fn after_second_factor(&mut self, response: &HttpResponse) -> Result<AuthOutcome, AuthError> {
        if response.status != 200 {
            return Err(self.fail(AuthError::Unknown(format!("HTTP {}", response.status))));
        }
        if self.ctx.cookies().snapshot().has_auth_quorum() {
            return Ok(self.authenticated());
        }
        Err(self.fail(AuthError::WrongSecondFactorPin))
    }

    /// Persist what is worth keeping and continue with exactly that.
    fn authenticated(&mut self) -> AuthOutcome {
        let live = self.ctx.cookies().snapshot();
        let kept = match self.cookie_file.save(&live) {
            Ok(kept) => kept,
            Err(e) => {
                warn!(error = %e, "could not persist cookies; continuing with this session only");
                live.persistable()
            }
        };
        self.ctx.cookies().replace(kept.clone());
        self.galx = None;
        self.second_factor = None;
        info!(count = kept.len(), "signed in");
        self.set_authenticated(&kept);
        AuthOutcome::Authenticated(kept)
    }

    fn set_authenticated(&mut self, cookies: &SessionCookieSet) {
        self.state = AuthState::Authenticated;
        self.emit(AuthEvent::Authenticated {
            cookies: cookies.names().map(str::to_string).collect(),
        });
    }

    fn invalid_state(&self, action: &'static str) -> AuthError {
        AuthError::InvalidState {
            action,
            actual: self.state.name(),
        }
    }

    fn fail(&mut self, error: AuthError) -> AuthError {
        warn!(error = %error, code = error.error_code(), "authentication failed");
        self.state = AuthState::Failed(error.clone());
        self.emit(AuthEvent::Failed(error.clone()));
        error
    }

    fn emit(&self, event: AuthEvent) {
        let _ = self.events.send(event);
    }
}

/// Text between the first pair of single quotes after `marker`.
fn attribute_token(html: &str, marker: &str) -> Option<String> {
    let after = &html[html.find(marker)? + marker.len()..];
    let open = after.find('\'')? + 1;
    let len = after[open..].find('\'')?;
    Some(after[open..open + len].to_string())
}
