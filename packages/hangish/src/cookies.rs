//! Session cookies: parsing, the shared store, merge policies, and the
//! persisted cookie file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use tracing::{debug, info};

use crate::error::CookieFileError;

/// Cookie names that together prove a signed-in account.
pub const AUTH_COOKIE_NAMES: [&str; 5] = ["APISID", "HSID", "SAPISID", "SID", "SSID"];

/// How many of [`AUTH_COOKIE_NAMES`] must be present to count as signed in.
pub const AUTH_COOKIE_QUORUM: usize = 5;

/// The primary session cookie. Always persisted, even when session-scoped.
pub const PRIMARY_SESSION_COOKIE: &str = "S";

/// Cookies never restored from the cookie file.
pub const EXCLUDED_ON_LOAD: [&str; 5] = ["ACCOUNT_CHOOSER", "GALX", "GAPS", "LSID", "NID"];

/// Domain assigned to cookies restored from the cookie file.
pub const SERVICE_COOKIE_DOMAIN: &str = ".google.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    /// No expiry: the cookie lives for the browser session only.
    pub session: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            expires: None,
            session: true,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn expiring(mut self, at: DateTime<Utc>) -> Self {
        self.expires = Some(at);
        self.session = false;
        self
    }

    fn is_persistable(&self) -> bool {
        self.name == PRIMARY_SESSION_COOKIE
            || (!self.session
                && self
                    .domain
                    .as_deref()
                    .is_some_and(|d| {
                        let d = d.trim_start_matches('.');
                        d == "google.com" || d.ends_with(".google.com")
                    }))
    }
}

/// Parse one `Set-Cookie` header value.
///
/// Understands `Domain`, `Path`, `Expires` and `Max-Age`; other attributes
/// are ignored. `Max-Age` wins over `Expires`.
pub fn parse_set_cookie(header: &str) -> Option<Cookie> {
    let mut parts = header.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let mut cookie = Cookie::new(name, value.trim().trim_matches('"'));
    let mut max_age = None;

    for attr in parts {
        let (key, val) = attr.split_once('=').unwrap_or((attr, ""));
        let val = val.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "domain" if !val.is_empty() => cookie.domain = Some(val.to_string()),
            "path" if !val.is_empty() => cookie.path = Some(val.to_string()),
            "expires" => cookie.expires = parse_cookie_date(val),
            "max-age" => max_age = val.parse::<i64>().ok(),
            _ => {}
        }
    }

    if let Some(secs) = max_age {
        // Out-of-range ages saturate at the far end of the calendar.
        let now = Utc::now();
        cookie.expires = Some(
            Duration::try_seconds(secs)
                .and_then(|age| now.checked_add_signed(age))
                .unwrap_or(if secs < 0 {
                    DateTime::<Utc>::MIN_UTC
                } else {
                    DateTime::<Utc>::MAX_UTC
                }),
        );
    }
    cookie.session = cookie.expires.is_none();
    Some(cookie)
}

fn parse_cookie_date(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc2822(text) {
        return Some(dt.with_timezone(&Utc));
    }
    // Netscape style, as the login servers send it: `Fri, 01-Jan-2038 00:00:00 GMT`
    NaiveDateTime::parse_from_str(text, "%a, %d-%b-%Y %H:%M:%S GMT")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Name-keyed set of cookies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCookieSet {
    cookies: BTreeMap<String, Cookie>,
}

impl SessionCookieSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cookie: Cookie) -> Option<Cookie> {
        self.cookies.insert(cookie.name.clone(), cookie)
    }

    pub fn get(&self, name: &str) -> Option<&Cookie> {
        self.cookies.get(name)
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(|c| c.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.cookies.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Cookie> {
        self.cookies.remove(name)
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cookie> {
        self.cookies.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.cookies.keys().map(String::as_str)
    }

    /// Insert cookies whose names are not yet present. Used while logging
    /// in, where the first value the server hands out is the one that counts.
    pub fn absorb_new(&mut self, incoming: impl IntoIterator<Item = Cookie>) -> Vec<String> {
        let mut added = Vec::new();
        for cookie in incoming {
            if !self.cookies.contains_key(&cookie.name) {
                added.push(cookie.name.clone());
                self.cookies.insert(cookie.name.clone(), cookie);
            }
        }
        added
    }

    /// Overwrite cookies that are already present and ignore the rest. Used
    /// once signed in, when the server rotates session cookies under us.
    /// Returns the names that changed value.
    pub fn rotate_existing(&mut self, incoming: impl IntoIterator<Item = Cookie>) -> Vec<String> {
        let mut rotated = Vec::new();
        for mut cookie in incoming {
            let Some(existing) = self.cookies.get_mut(&cookie.name) else {
                continue;
            };
            if existing.value == cookie.value {
                continue;
            }
            if cookie.domain.is_none() {
                cookie.domain = existing.domain.take();
            }
            rotated.push(cookie.name.clone());
            *existing = cookie;
        }
        rotated
    }

    pub fn auth_cookie_count(&self) -> usize {
        AUTH_COOKIE_NAMES
            .iter()
            .filter(|name| self.cookies.contains_key(**name))
            .count()
    }

    pub fn has_auth_quorum(&self) -> bool {
        self.auth_cookie_count() >= AUTH_COOKIE_QUORUM
    }

    /// Cookies worth keeping across restarts.
    pub fn persistable(&self) -> Self {
        Self {
            cookies: self
                .cookies
                .iter()
                .filter(|(_, c)| c.is_persistable())
                .map(|(n, c)| (n.clone(), c.clone()))
                .collect(),
        }
    }

    /// `Cookie` request header value, `None` when there is nothing to send.
    pub fn header_value(&self) -> Option<String> {
        self.header_value_matching(|_| true)
    }

    pub fn header_value_matching(&self, keep: impl Fn(&str) -> bool) -> Option<String> {
        let pairs: Vec<String> = self
            .cookies
            .values()
            .filter(|c| keep(&c.name))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        (!pairs.is_empty()).then(|| pairs.join("; "))
    }
}

impl FromIterator<Cookie> for SessionCookieSet {
    fn from_iter<I: IntoIterator<Item = Cookie>>(iter: I) -> Self {
        let mut set = Self::new();
        for cookie in iter {
            set.insert(cookie);
        }
        set
    }
}

/// Shared handle on the live cookie set.
///
/// Readers take a [`snapshot`](Self::snapshot) at the moment they need the
/// cookies; writers go through [`update`](Self::update).
#[derive(Debug, Clone, Default)]
pub struct CookieStore {
    inner: Arc<RwLock<SessionCookieSet>>,
}

impl CookieStore {
    pub fn new(set: SessionCookieSet) -> Self {
        Self {
            inner: Arc::new(RwLock::new(set)),
        }
    }

    pub fn snapshot(&self) -> SessionCookieSet {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, set: SessionCookieSet) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = set;
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut SessionCookieSet) -> R) -> R {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

/// The persisted cookie file: a flat JSON object of name to value.
#[derive(Debug, Clone)]
pub struct CookieFile {
    path: PathBuf,
}

impl CookieFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the stored cookies, minus [`EXCLUDED_ON_LOAD`]. `Ok(None)` when
    /// there is no file.
    pub fn load(&self) -> Result<Option<SessionCookieSet>, CookieFileError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CookieFileError::Read {
                    path: self.path.clone(),
                    reason: e.to_string(),
                });
            }
        };
        let map: BTreeMap<String, String> =
            serde_json::from_str(&text).map_err(|e| CookieFileError::Parse {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        let set: SessionCookieSet = map
            .into_iter()
            .filter(|(name, _)| !EXCLUDED_ON_LOAD.contains(&name.as_str()))
            .map(|(name, value)| Cookie::new(name, value).with_domain(SERVICE_COOKIE_DOMAIN))
            .collect();
        debug!(path = %self.path.display(), count = set.len(), "loaded cookies");
        Ok(Some(set))
    }

    /// Persist the cookies worth keeping after a fresh login and return them.
    pub fn save(&self, set: &SessionCookieSet) -> Result<SessionCookieSet, CookieFileError> {
        let keep = set.persistable();
        self.write(&keep)?;
        Ok(keep)
    }

    /// Rewrite the file with exactly `set`, after cookies rotated.
    pub fn write(&self, set: &SessionCookieSet) -> Result<(), CookieFileError> {
        let map: BTreeMap<&str, &str> = set.iter().map(|c| (c.name.as_str(), c.value.as_str())).collect();
        let write_err = |reason: String| CookieFileError::Write {
            path: self.path.clone(),
            reason,
        };
        let json = serde_json::to_string_pretty(&map).map_err(|e| write_err(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
        }
        std::fs::write(&self.path, json).map_err(|e| write_err(e.to_string()))?;
        info!(path = %self.path.display(), count = map.len(), "wrote cookie file");
        Ok(())
    }

    /// Delete the file. Missing is fine.
    pub fn remove(&self) -> Result<(), CookieFileError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CookieFileError::Write {
                path: self.path.clone(),
                reason: e.to_string(),
            }),
        }
    }
}
