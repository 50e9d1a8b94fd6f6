//! Signed-in session: startup values, the push channel, and RPC submission.
//!
//! [`Client::connect`] runs the post-login sequence (pvt token, chat page,
//! channel start). RPC calls are fire-and-forget from the caller's side:
//! [`Client::submit`] returns a [`RequestHandle`] at once and the outcome
//! arrives later as an [`RpcEvent`] carrying the caller's correlation id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::Utc;
use data_encoding::HEXLOWER;
use hangish_wire::{FieldError, FieldValue, StructuredMessage, WireValue, encode_to_string, parse_array_literal};
use sha1::{Digest, Sha1};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, PushChannel};
use crate::config::{ChannelConfig, FileConfig, RpcConfig, StartupConfigUrls};
use crate::context::{CookieScope, SessionContext};
use crate::cookies::CookieFile;
use crate::error::{RpcError, StartupError};
use crate::http::{HttpRequest, HttpTransport};
use crate::schemas::{BUILD_TYPE, CLIENT_ID, CLIENT_IDENTIFIER, CLIENT_VERSION, REQUEST_HEADER};
use crate::startup::{StartupConfig, fetch_pvt_token, fetch_startup_config};

const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientConfig {
    pub startup: StartupConfigUrls,
    pub channel: ChannelConfig,
    pub rpc: RpcConfig,
}

impl ClientConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            startup: StartupConfigUrls::from_file(&fc.startup),
            channel: ChannelConfig::from_file(&fc.channel),
            rpc: RpcConfig::from_file(&fc.rpc),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestHandle(u64);

impl std::fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcEvent {
    Succeeded {
        correlation: String,
        handle: RequestHandle,
        body: WireValue,
    },
    Failed {
        correlation: String,
        handle: RequestHandle,
        error: RpcError,
    },
}

impl RpcEvent {
    pub fn correlation(&self) -> &str {
        match self {
            Self::Succeeded { correlation, .. } | Self::Failed { correlation, .. } => correlation,
        }
    }
}

/// Outstanding requests: handle to the caller's correlation id.
#[derive(Debug, Default)]
pub struct PendingRequestTable {
    next: u64,
    pending: HashMap<RequestHandle, String>,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, correlation: impl Into<String>) -> RequestHandle {
        self.next += 1;
        let handle = RequestHandle(self.next);
        self.pending.insert(handle, correlation.into());
        handle
    }

    /// Take the correlation id for a finished request. `None` if the handle
    /// was already completed.
    pub fn complete(&mut self, handle: RequestHandle) -> Option<String> {
        self.pending.remove(&handle)
    }

    pub fn contains(&self, handle: RequestHandle) -> bool {
        self.pending.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// `SAPISIDHASH <ms>_<sha1("<ms> <SAPISID> <origin>")>`
pub fn sapisid_hash(now_ms: i64, sapisid: &str, origin: &str) -> String {
    let digest = Sha1::digest(format!("{now_ms} {sapisid} {origin}").as_bytes());
    format!("SAPISIDHASH {now_ms}_{}", HEXLOWER.encode(&digest))
}

/// Build an RPC POST. Cookies are attached at dispatch.
pub fn rpc_request(
    rpc: &RpcConfig,
    api_key: &str,
    endpoint: &str,
    body: String,
    sapisid: &str,
    now_ms: i64,
) -> HttpRequest {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("alt", "protojson")
        .append_pair("key", api_key)
        .finish();
    HttpRequest::post(format!("{}{endpoint}?{query}", rpc.endpoint_url))
        .header("authorization", sapisid_hash(now_ms, sapisid, &rpc.origin))
        .header("x-origin", rpc.origin.clone())
        .header("x-goog-authuser", "0")
        .header("content-type", "application/json+protobuf")
        .body(body.into_bytes())
}

/// The standard request header every RPC body starts with.
pub fn request_header(startup: &StartupConfig, language: &str) -> Result<StructuredMessage, FieldError> {
    let quasar = CLIENT_ID.number_of("QUASAR").unwrap_or(3);
    let production = BUILD_TYPE.number_of("PRODUCTION").unwrap_or(3);

    let mut version = StructuredMessage::new(&CLIENT_VERSION);
    version
        .set("client_id", FieldValue::Enum(quasar))?
        .set("build_type", FieldValue::Enum(production))?;
    if let Some(major) = &startup.header_version {
        version.set("major_version", major.as_str())?;
    }
    if let Some(date) = startup
        .header_date
        .as_deref()
        .and_then(|d| d.parse::<i64>().ok())
    {
        version.set("version", date)?;
    }

    let identifier =
        StructuredMessage::new(&CLIENT_IDENTIFIER).with("header_id", startup.header_id.as_str())?;

    StructuredMessage::new(&REQUEST_HEADER)
        .with("client_version", version)?
        .with("client_identifier", identifier)?
        .with("language_code", language)
}

pub struct Client<H> {
    ctx: SessionContext<H>,
    rpc: RpcConfig,
    startup: StartupConfig,
    channel: PushChannel,
    cookie_file: CookieFile,
    pending: Arc<Mutex<PendingRequestTable>>,
    client_id: Arc<RwLock<Option<String>>>,
    rpc_events: broadcast::Sender<RpcEvent>,
    cancel: CancellationToken,
    housekeeping: JoinHandle<()>,
}

impl<H: HttpTransport> Client<H> {
    /// Fetch the pvt token and the chat page with the signed-in cookies in
    /// `ctx`, then start the push channel.
    ///
    /// A [`StartupError`] for which
    /// [`is_session_stale`](StartupError::is_session_stale) holds means the
    /// stored cookies are dead and a fresh login is needed.
    pub async fn connect(
        ctx: SessionContext<H>,
        config: ClientConfig,
        cookie_file: CookieFile,
    ) -> Result<Self, StartupError> {
        let pvt = fetch_pvt_token(&ctx, &config.startup).await?;
        if !pvt.updated_cookies.is_empty() {
            persist_cookies(&ctx, &cookie_file);
        }
        let startup = fetch_startup_config(&ctx, &config.startup, &pvt.token).await?;

        let channel = PushChannel::spawn(ctx.clone(), startup.channel_params(), config.channel);
        let client_id = Arc::new(RwLock::new(None));
        let cancel = CancellationToken::new();
        let housekeeping = tokio::spawn(housekeeping(
            channel.subscribe(),
            ctx.clone(),
            cookie_file.clone(),
            Arc::clone(&client_id),
            cancel.clone(),
        ));
        let (rpc_events, _) = broadcast::channel(EVENT_CAPACITY);
        channel.start();
        info!("client connected; push channel starting");

        Ok(Self {
            ctx,
            rpc: config.rpc,
            startup,
            channel,
            cookie_file,
            pending: Arc::new(Mutex::new(PendingRequestTable::new())),
            client_id,
            rpc_events,
            cancel,
            housekeeping,
        })
    }

    pub fn startup(&self) -> &StartupConfig {
        &self.startup
    }

    pub fn channel(&self) -> &PushChannel {
        &self.channel
    }

    pub fn subscribe_channel(&self) -> broadcast::Receiver<ChannelEvent> {
        self.channel.subscribe()
    }

    pub fn subscribe_rpc(&self) -> broadcast::Receiver<RpcEvent> {
        self.rpc_events.subscribe()
    }

    /// Latest client id handed out by channel negotiation.
    pub fn client_id(&self) -> Option<String> {
        self.client_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn request_header(&self) -> Result<StructuredMessage, FieldError> {
        request_header(&self.startup, &self.rpc.language)
    }

    pub fn pending_requests(&self) -> usize {
        lock(&self.pending).len()
    }

    /// POST `message` to `endpoint` (e.g. `conversations/sendchatmessage`).
    /// The reply, or the failure, arrives as an [`RpcEvent`] tagged with
    /// `correlation`.
    pub fn submit(
        &self,
        endpoint: &str,
        message: &StructuredMessage,
        correlation: impl Into<String>,
    ) -> RequestHandle {
        let handle = lock(&self.pending).insert(correlation);
        let request = self
            .ctx
            .cookies()
            .snapshot()
            .value("SAPISID")
            .map(|sapisid| {
                rpc_request(
                    &self.rpc,
                    &self.startup.api_key,
                    endpoint,
                    encode_to_string(message),
                    sapisid,
                    Utc::now().timestamp_millis(),
                )
            })
            .ok_or(RpcError::NotSignedIn);
        debug!(%handle, endpoint, "submitting request");

        let ctx = self.ctx.clone();
        let cookie_file = self.cookie_file.clone();
        let pending = Arc::clone(&self.pending);
        let events = self.rpc_events.clone();
        tokio::spawn(async move {
            let result = match request {
                Ok(request) => call(&ctx, &cookie_file, request).await,
                Err(e) => Err(e),
            };
            let Some(correlation) = lock(&pending).complete(handle) else {
                return;
            };
            let event = match result {
                Ok(body) => RpcEvent::Succeeded {
                    correlation,
                    handle,
                    body,
                },
                Err(error) => {
                    warn!(%handle, error = %error, "request failed");
                    RpcEvent::Failed {
                        correlation,
                        handle,
                        error,
                    }
                }
            };
            let _ = events.send(event);
        });
        handle
    }

    /// Stop the channel and background work.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.channel.shutdown().await;
        if let Err(e) = self.housekeeping.await {
            warn!(error = %e, "client housekeeping ended abnormally");
        }
    }
}

async fn call<H: HttpTransport>(
    ctx: &SessionContext<H>,
    cookie_file: &CookieFile,
    request: HttpRequest,
) -> Result<WireValue, RpcError> {
    let response = ctx.execute_scoped(request, CookieScope::AuthOnly).await?;
    let rotated = ctx.rotate(&response.headers);
    if !rotated.is_empty() {
        debug!(names = ?rotated, "rpc reply rotated cookies");
        persist_cookies(ctx, cookie_file);
    }
    if !response.is_success() {
        return Err(RpcError::Status {
            status: response.status,
            body: response.text(),
        });
    }
    Ok(parse_array_literal(&response.text())?)
}

/// Keep the cookie file and client id in step with the channel.
async fn housekeeping<H: HttpTransport>(
    mut events: broadcast::Receiver<ChannelEvent>,
    ctx: SessionContext<H>,
    cookie_file: CookieFile,
    client_id: Arc<RwLock<Option<String>>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(ChannelEvent::CookiesRotated(names)) => {
                debug!(?names, "cookies rotated");
                persist_cookies(&ctx, &cookie_file);
            }
            Ok(ChannelEvent::ClientIdUpdated(id)) => {
                *client_id.write().unwrap_or_else(PoisonError::into_inner) = Some(id);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "client housekeeping lagged behind the channel");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Rewrite an existing cookie file with the live cookies. A missing file
/// stays missing: the user signed out.
fn persist_cookies<H: HttpTransport>(ctx: &SessionContext<H>, cookie_file: &CookieFile) {
    if !cookie_file.exists() {
        return;
    }
    if let Err(e) = cookie_file.write(&ctx.cookies().snapshot()) {
        warn!(error = %e, "could not update cookie file");
    }
}

fn lock(table: &Mutex<PendingRequestTable>) -> MutexGuard<'_, PendingRequestTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cookies::{Cookie, CookieStore, SessionCookieSet};
    use crate::testing::{Reply, ScriptedTransport};

    const PAGE: &str = concat!(
        "AF_initDataCallback({key: 'ds:0', data:function(){return [[\"cin:cac\",null,\"APIKEY\"]]}});",
        "AF_initDataCallback({key: 'ds:1', data:function(){return ",
        "[[\"cin:bcsc\",null,\"/webchannel/\",null,\"ec\",\"prop\",null,\"HID\"]]}});",
        "AF_initDataCallback({key: 'ds:2', data:function(){return ",
        "[[\"cin:acc\",null,null,null,\"1433184004\",null,\"chat_frontend_1\"]]}});"
    );
    const NEGOTIATED: &str = r#"[[0,["c","SID1","",8]],[2,["cfj","me@example.test/CID7"]]]"#;

    fn config() -> ClientConfig {
        ClientConfig {
            startup: StartupConfigUrls {
                pvt_url: "https://chat.example.test/extension-start".into(),
                chat_url: "https://chat.example.test/chat".into(),
            },
            channel: ChannelConfig {
                origin: "https://chat.example.test".into(),
                ..ChannelConfig::default()
            },
            rpc: RpcConfig {
                endpoint_url: "https://api.example.test/chat/v1/".into(),
                origin: "https://chat.example.test".into(),
                language: "en".into(),
            },
        }
    }

    fn signed_in() -> SessionCookieSet {
        ["APISID", "HSID", "SAPISID", "SID", "SSID", "NID"]
            .iter()
            .map(|name| Cookie::new(*name, format!("v-{name}")))
            .collect()
    }

    fn script(transport: &ScriptedTransport) {
        transport.reply("GET", "extension-start", Reply::ok(r#"["pvt-1"]"#));
        transport.reply("GET", "/chat?", Reply::ok(PAGE));
        transport.reply(
            "POST",
            "/bind",
            Reply::ok(NEGOTIATED).set_cookie("SID=rotated; Path=/"),
        );
    }

    async fn connect(
        transport: &ScriptedTransport,
        dir: &tempfile::TempDir,
    ) -> Client<ScriptedTransport> {
        let ctx = SessionContext::new(transport.clone(), CookieStore::new(signed_in()), "test");
        let file = CookieFile::new(dir.path().join("cookies.json"));
        Client::connect(ctx, config(), file).await.unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn sapisid_hash_format() {
        assert_eq!(
            sapisid_hash(1000, "SAPI", "https://talkgadget.google.com"),
            "SAPISIDHASH 1000_302585baad0adb1fd80edca90fab991f1c269dd1"
        );
    }

    #[test]
    fn pending_table_completes_once() {
        let mut table = PendingRequestTable::new();
        let a = table.insert("a");
        let b = table.insert("b");
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(table.complete(a).as_deref(), Some("a"));
        assert_eq!(table.complete(a), None);
        assert!(table.contains(b));
    }

    #[test]
    fn request_header_layout() {
        let startup = crate::startup::extract_startup_config(PAGE).unwrap();
        let header = request_header(&startup, "en").unwrap();
        assert_eq!(
            encode_to_string(&header),
            r#"[[3,3,"chat_frontend_1",1433184004],[null,"HID"],null,"en"]"#
        );
    }

    #[test]
    fn rpc_request_headers() {
        let req = rpc_request(
            &config().rpc,
            "K",
            "conversations/settyping",
            "[]".into(),
            "SAPI",
            1000,
        );
        assert_eq!(
            req.url,
            "https://api.example.test/chat/v1/conversations/settyping?alt=protojson&key=K"
        );
        assert!(req.header_value("authorization").unwrap().starts_with("SAPISIDHASH 1000_"));
        assert_eq!(req.header_value("x-origin"), Some("https://chat.example.test"));
        assert_eq!(req.header_value("x-goog-authuser"), Some("0"));
        assert_eq!(req.header_value("content-type"), Some("application/json+protobuf"));
    }

    #[tokio::test]
    async fn connect_runs_startup_and_starts_the_channel() {
        let transport = ScriptedTransport::new();
        script(&transport);
        let dir = tempfile::tempdir().unwrap();
        let client = connect(&transport, &dir).await;

        assert_eq!(client.startup().api_key, "APIKEY");
        let requests = transport.requests();
        assert!(requests[1].url.contains("pvt=pvt-1"));

        transport.wait_for("GET", "/bind", 1).await;
        let poll = transport
            .requests()
            .into_iter()
            .find(|r| r.method.as_str() == "GET" && r.url.contains("/bind"))
            .unwrap();
        assert!(poll.url.starts_with("https://chat.example.test/webchannel/bind?"));
        assert!(poll.url.contains("clid=HID"));
        eventually(|| client.client_id().as_deref() == Some("CID7")).await;
        client.shutdown().await;
    }

    #[tokio::test]
    async fn rotated_cookies_reach_an_existing_cookie_file() {
        let transport = ScriptedTransport::new();
        script(&transport);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        std::fs::write(&path, "{}").unwrap();
        let client = connect(&transport, &dir).await;

        eventually(|| {
            std::fs::read_to_string(&path)
                .map(|text| text.contains("\"SID\": \"rotated\""))
                .unwrap_or(false)
        })
        .await;
        client.shutdown().await;
    }

    #[tokio::test]
    async fn missing_cookie_file_is_not_recreated() {
        let transport = ScriptedTransport::new();
        script(&transport);
        let dir = tempfile::tempdir().unwrap();
        let client = connect(&transport, &dir).await;
        transport.wait_for("GET", "/bind", 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!dir.path().join("cookies.json").exists());
        client.shutdown().await;
    }

    #[tokio::test]
    async fn stale_session_is_reported() {
        let transport = ScriptedTransport::new();
        transport.reply("GET", "extension-start", Reply::ok("[]"));
        let dir = tempfile::tempdir().unwrap();
        let ctx = SessionContext::new(transport.clone(), CookieStore::new(signed_in()), "test");
        let file = CookieFile::new(dir.path().join("cookies.json"));
        let Err(err) = Client::connect(ctx, config(), file).await else {
            panic!("expected a startup failure");
        };
        assert!(err.is_session_stale());
    }

    #[tokio::test]
    async fn submit_reports_success_with_correlation() {
        let transport = ScriptedTransport::new();
        script(&transport);
        transport.reply("POST", "sendchatmessage", Reply::ok(r#"["csmrp",[1]]"#));
        let dir = tempfile::tempdir().unwrap();
        let client = connect(&transport, &dir).await;
        let mut rpc = client.subscribe_rpc();

        let header = client.request_header().unwrap();
        let handle = client.submit("conversations/sendchatmessage", &header, "msg-1");
        let event = rpc.recv().await.unwrap();
        assert_eq!(
            event,
            RpcEvent::Succeeded {
                correlation: "msg-1".into(),
                handle,
                body: parse_array_literal(r#"["csmrp",[1]]"#).unwrap(),
            }
        );
        assert_eq!(client.pending_requests(), 0);

        let post = transport
            .requests()
            .into_iter()
            .find(|r| r.url.contains("sendchatmessage"))
            .unwrap();
        assert!(post.url.ends_with("?alt=protojson&key=APIKEY"));
        let cookie = post.header_value("cookie").unwrap();
        assert!(cookie.contains("SAPISID=v-SAPISID"));
        assert!(!cookie.contains("NID"));
        assert_eq!(post.body.as_deref(), Some(encode_to_string(&header).as_bytes()));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn rpc_reply_rotation_reaches_cookie_file() {
        let transport = ScriptedTransport::new();
        script(&transport);
        transport.reply(
            "POST",
            "settyping",
            Reply::ok("[]").set_cookie("SAPISID=fresh; Path=/"),
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        std::fs::write(&path, "{}").unwrap();
        let client = connect(&transport, &dir).await;
        let mut rpc = client.subscribe_rpc();

        let header = client.request_header().unwrap();
        client.submit("conversations/settyping", &header, "t");
        assert!(matches!(rpc.recv().await.unwrap(), RpcEvent::Succeeded { .. }));
        assert_eq!(client.ctx.cookies().snapshot().value("SAPISID"), Some("fresh"));
        eventually(|| {
            std::fs::read_to_string(&path)
                .map(|text| text.contains("\"SAPISID\": \"fresh\""))
                .unwrap_or(false)
        })
        .await;
        client.shutdown().await;
    }

    #[tokio::test]
    async fn submit_reports_http_failure() {
        let transport = ScriptedTransport::new();
        script(&transport);
        transport.reply("POST", "settyping", Reply::status(403, "denied"));
        let dir = tempfile::tempdir().unwrap();
        let client = connect(&transport, &dir).await;
        let mut rpc = client.subscribe_rpc();

        let header = client.request_header().unwrap();
        client.submit("conversations/settyping", &header, "typing");
        let event = rpc.recv().await.unwrap();
        assert_eq!(event.correlation(), "typing");
        assert!(matches!(
            event,
            RpcEvent::Failed {
                error: RpcError::Status { status: 403, .. },
                ..
            }
        ));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn submit_without_sapisid_fails() {
        let transport = ScriptedTransport::new();
        script(&transport);
        let dir = tempfile::tempdir().unwrap();
        let client = connect(&transport, &dir).await;
        client.ctx.cookies().update(|set| set.remove("SAPISID"));
        let mut rpc = client.subscribe_rpc();

        let header = client.request_header().unwrap();
        client.submit("conversations/settyping", &header, "t");
        assert!(matches!(
            rpc.recv().await.unwrap(),
            RpcEvent::Failed {
                error: RpcError::NotSignedIn,
                ..
            }
        ));
        assert_eq!(transport.count("POST", "settyping"), 0);
        client.shutdown().await;
    }
}
