//! Scripted HTTP transport for tests.
//!
//! Routes are keyed by method and a URL substring and hold a queue of
//! replies. A request with no queued reply is still recorded but never
//! completes, which is what a long-poll looks like from the client side.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::sync::{Notify, mpsc};

use crate::error::HttpError;
use crate::http::{HttpRequest, HttpStream, HttpTransport};

pub enum Reply {
    Full {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
    Streaming {
        status: u16,
        headers: Vec<(String, String)>,
        chunks: mpsc::UnboundedReceiver<Result<Vec<u8>, HttpError>>,
    },
    Fail(HttpError),
}

impl Reply {
    pub fn ok(body: &str) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self::Full {
            status,
            headers: Vec::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn redirect(location: &str) -> Self {
        Self::status(302, "").header("Location", location)
    }

    /// A streamed body fed through the returned sender. Dropping the sender
    /// ends the body.
    pub fn streaming(status: u16) -> (Self, BodyFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self::Streaming {
                status,
                headers: Vec::new(),
                chunks: rx,
            },
            BodyFeed(tx),
        )
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        match &mut self {
            Self::Full { headers, .. } | Self::Streaming { headers, .. } => {
                headers.push((name.to_string(), value.to_string()));
            }
            Self::Fail(_) => {}
        }
        self
    }

    pub fn set_cookie(self, cookie: &str) -> Self {
        self.header("Set-Cookie", cookie)
    }
}

pub struct BodyFeed(mpsc::UnboundedSender<Result<Vec<u8>, HttpError>>);

impl BodyFeed {
    pub fn send(&self, chunk: &str) {
        let _ = self.0.send(Ok(chunk.as_bytes().to_vec()));
    }

    pub fn send_bytes(&self, chunk: &[u8]) {
        let _ = self.0.send(Ok(chunk.to_vec()));
    }

    pub fn fail(&self, reason: &str) {
        let _ = self.0.send(Err(HttpError::Body(reason.to_string())));
    }
}

struct Route {
    method: &'static str,
    url_part: String,
    replies: VecDeque<Reply>,
}

#[derive(Default)]
struct State {
    routes: Vec<Route>,
    requests: Vec<HttpRequest>,
}

#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<State>>,
    arrived: Arc<Notify>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for the next `method` request whose URL contains
    /// `url_part`.
    pub fn reply(&self, method: &'static str, url_part: &str, reply: Reply) {
        let mut state = self.lock();
        if let Some(route) = state
            .routes
            .iter_mut()
            .find(|r| r.method == method && r.url_part == url_part)
        {
            route.replies.push_back(reply);
            return;
        }
        state.routes.push(Route {
            method,
            url_part: url_part.to_string(),
            replies: VecDeque::from([reply]),
        });
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.lock().requests.clone()
    }

    pub fn count(&self, method: &str, url_part: &str) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.method.as_str() == method && r.url.contains(url_part))
            .count()
    }

    /// Wait until at least `n` matching requests have been opened.
    pub async fn wait_for(&self, method: &str, url_part: &str, n: usize) {
        loop {
            let arrived = self.arrived.notified();
            if self.count(method, url_part) >= n {
                return;
            }
            arrived.await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HttpTransport for ScriptedTransport {
    fn open(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpStream, HttpError>> {
        let url = request.url.clone();
        let method = request.method.as_str();
        let reply = {
            let mut state = self.lock();
            state.requests.push(request);
            state
                .routes
                .iter_mut()
                .find(|r| r.method == method && url.contains(&r.url_part) && !r.replies.is_empty())
                .and_then(|r| r.replies.pop_front())
        };
        self.arrived.notify_waiters();

        let Some(reply) = reply else {
            return futures::future::pending().boxed();
        };
        async move {
            match reply {
                Reply::Fail(e) => Err(e),
                Reply::Full {
                    status,
                    headers,
                    body,
                } => Ok(HttpStream {
                    status,
                    url,
                    headers,
                    body: futures::stream::iter([Ok(body)]).boxed(),
                }),
                Reply::Streaming {
                    status,
                    headers,
                    chunks,
                } => Ok(HttpStream {
                    status,
                    url,
                    headers,
                    body: futures::stream::unfold(chunks, |mut rx| async move {
                        rx.recv().await.map(|chunk| (chunk, rx))
                    })
                    .boxed(),
                }),
            }
        }
        .boxed()
    }
}
