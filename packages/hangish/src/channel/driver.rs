//! Runs a [`ChannelMachine`] on tokio.
//!
//! One actor task owns the machine, the timers, and the handles of the
//! negotiation and long-poll tasks. Everything that happens (a command from
//! the handle, a request completing, a chunk arriving) reaches the actor as a
//! [`ChannelInput`] on one queue, so the machine sees a single ordered flow.

use std::pin::Pin;

use chrono::Utc;
use futures::StreamExt;
use hangish_wire::parse_array_literal;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Sleep, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::deframe::Deframer;
use super::machine::{ChannelEffect, ChannelInput, ChannelMachine};
use super::negotiate::{PROTOCOL_VERSION, negotiation_request, parse_negotiation, status_failure};
use super::submission::batch_updates;
use super::{ChannelEvent, ChannelParams, ChannelSession, ChannelStatus};
use crate::config::ChannelConfig;
use crate::context::SessionContext;
use crate::error::{ChannelFailure, DeframeError};
use crate::http::{HttpRequest, HttpTransport};

/// Body text meaning the server forgot our session id.
pub const SESSION_EXPIRED_MARKER: &str = "Unknown SID";

const EVENT_CAPACITY: usize = 256;

/// Handle to a running push channel.
pub struct PushChannel {
    inputs: mpsc::UnboundedSender<ChannelInput>,
    events: broadcast::Sender<ChannelEvent>,
    status: watch::Receiver<ChannelStatus>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PushChannel {
    /// Spawn the channel actor. Nothing goes on the wire until
    /// [`start`](Self::start).
    pub fn spawn<H: HttpTransport>(
        ctx: SessionContext<H>,
        params: ChannelParams,
        config: ChannelConfig,
    ) -> Self {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status_tx, status) = watch::channel(ChannelStatus::Inactive);
        let cancel = CancellationToken::new();

        let actor = ChannelActor {
            ctx,
            config,
            machine: ChannelMachine::new(params.clone()),
            params,
            events: events.clone(),
            status: status_tx,
            inputs: inputs_tx.clone(),
            long_poll: None,
            negotiation: None,
            reconnect: None,
            watchdog: None,
        };
        let task = tokio::spawn(actor.run(inputs_rx, cancel.clone()));

        Self {
            inputs: inputs_tx,
            events,
            status,
            cancel,
            task: Some(task),
        }
    }

    pub fn start(&self) {
        self.send(ChannelInput::Start);
    }

    /// Ask for a new session id. Collapses into a negotiation already in
    /// flight.
    pub fn renegotiate(&self) {
        self.send(ChannelInput::Renegotiate);
    }

    /// Drop the current long-poll and reopen it after the reconnect delay.
    pub fn fast_reconnect(&self) {
        self.send(ChannelInput::FastReconnect);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// Stop the channel and wait for the actor to finish. No event is
    /// emitted after this returns.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "channel actor ended abnormally");
            }
        }
    }

    fn send(&self, input: ChannelInput) {
        if self.inputs.send(input).is_err() {
            debug!("channel actor is gone");
        }
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ChannelActor<H> {
    ctx: SessionContext<H>,
    config: ChannelConfig,
    params: ChannelParams,
    machine: ChannelMachine,
    events: broadcast::Sender<ChannelEvent>,
    status: watch::Sender<ChannelStatus>,
    inputs: mpsc::UnboundedSender<ChannelInput>,
    long_poll: Option<JoinHandle<()>>,
    negotiation: Option<JoinHandle<()>>,
    reconnect: Option<Pin<Box<Sleep>>>,
    watchdog: Option<Pin<Box<Sleep>>>,
}

impl<H: HttpTransport> ChannelActor<H> {
    async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<ChannelInput>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.apply(ChannelInput::Stop);
                    break;
                }
                Some(input) = inputs.recv() => self.apply(input),
                _ = sleep_opt(&mut self.reconnect) => {
                    self.reconnect = None;
                    self.apply(ChannelInput::ReconnectTimer);
                }
                _ = sleep_opt(&mut self.watchdog) => {
                    self.watchdog = None;
                    self.apply(ChannelInput::WatchdogFired);
                }
            }
        }
        abort(&mut self.negotiation);
        abort(&mut self.long_poll);
        debug!("channel actor stopped");
    }

    fn apply(&mut self, input: ChannelInput) {
        for effect in self.machine.handle(input) {
            match effect {
                ChannelEffect::Negotiate => self.spawn_negotiation(),
                ChannelEffect::OpenLongPoll {
                    generation,
                    session,
                } => self.spawn_long_poll(generation, &session),
                ChannelEffect::CancelLongPoll => abort(&mut self.long_poll),
                ChannelEffect::ScheduleReconnect => {
                    self.reconnect = Some(Box::pin(sleep(self.config.reconnect_delay)));
                }
                ChannelEffect::CancelReconnect => self.reconnect = None,
                ChannelEffect::ArmWatchdog => {
                    self.watchdog = Some(Box::pin(sleep(self.config.watchdog)));
                }
                ChannelEffect::DisarmWatchdog => self.watchdog = None,
                ChannelEffect::Emit(event) => {
                    if let ChannelEvent::StatusChanged(status) = &event {
                        info!(%status, "channel status");
                        self.status.send_replace(status.clone());
                    }
                    // No subscribers is fine.
                    let _ = self.events.send(event);
                }
            }
        }
    }

    fn spawn_negotiation(&mut self) {
        let ctx = self.ctx.clone();
        let inputs = self.inputs.clone();
        let request = negotiation_request(&self.config.origin, &self.params);
        debug!("negotiating channel session");
        self.negotiation = Some(tokio::spawn(async move {
            let input = match ctx.execute(request).await {
                Ok(response) => {
                    let rotated = ctx.rotate(&response.headers);
                    if !rotated.is_empty() {
                        let _ = inputs.send(ChannelInput::CookiesRotated(rotated));
                    }
                    if response.is_success() {
                        match parse_negotiation(&response.text()) {
                            Ok(session) => ChannelInput::NegotiationSucceeded(session),
                            Err(failure) => ChannelInput::NegotiationFailed(failure),
                        }
                    } else {
                        ChannelInput::NegotiationFailed(status_failure(response.status))
                    }
                }
                Err(e) => ChannelInput::NegotiationFailed(ChannelFailure::Transport {
                    status: None,
                    reason: e.to_string(),
                }),
            };
            let _ = inputs.send(input);
        }));
    }

    fn spawn_long_poll(&mut self, generation: u64, session: &ChannelSession) {
        abort(&mut self.long_poll);
        let ctx = self.ctx.clone();
        let inputs = self.inputs.clone();
        let request = long_poll_request(&self.config.origin, session);
        let deframer = Deframer::new(self.config.frame_length, self.config.max_frame_bytes);
        debug!(generation, "opening long-poll");
        self.long_poll = Some(tokio::spawn(long_poll(
            ctx, request, generation, deframer, inputs,
        )));
    }
}

async fn long_poll<H: HttpTransport>(
    ctx: SessionContext<H>,
    request: HttpRequest,
    generation: u64,
    mut deframer: Deframer,
    inputs: mpsc::UnboundedSender<ChannelInput>,
) {
    let mut stream = match ctx.open(request).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = inputs.send(ChannelInput::LongPollFailed {
                generation,
                reason: e.to_string(),
            });
            return;
        }
    };

    let rotated = ctx.rotate(&stream.headers);
    if !rotated.is_empty() {
        let _ = inputs.send(ChannelInput::CookiesRotated(rotated));
    }
    let status = stream.status;
    let _ = inputs.send(ChannelInput::LongPollOpened { generation, status });
    if !(200..300).contains(&status) {
        return;
    }

    let mut marker = MarkerScan::new(SESSION_EXPIRED_MARKER.as_bytes());
    while let Some(chunk) = stream.body.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(generation, error = %e, "long-poll body ended with an error");
                break;
            }
        };
        let seen = marker.feed(&bytes);
        let data = &bytes[..seen.unwrap_or(bytes.len())];
        if !data.is_empty() {
            let events = deframer.push(data).into_iter().flat_map(frame_events).collect();
            let _ = inputs.send(ChannelInput::LongPollData {
                generation,
                at: Utc::now(),
                events,
            });
        }
        if seen.is_some() {
            break;
        }
    }

    let _ = inputs.send(ChannelInput::LongPollClosed {
        generation,
        session_expired: marker.found(),
    });
}

/// What one deframed frame contributes to the event stream.
fn frame_events(frame: Result<String, DeframeError>) -> Vec<ChannelEvent> {
    let dropped = |reason: String| {
        warn!(%reason, "dropping push frame");
        vec![ChannelEvent::FrameDropped { reason }]
    };
    let text = match frame {
        Ok(text) => text,
        Err(e) => return dropped(e.to_string()),
    };
    debug!(frame_len = text.len(), "push frame");
    match parse_array_literal(&text).and_then(|value| batch_updates(&value)) {
        Ok(updates) => updates.into_iter().map(ChannelEvent::BatchUpdate).collect(),
        Err(e) => dropped(e.to_string()),
    }
}

pub fn long_poll_request(origin: &str, session: &ChannelSession) -> HttpRequest {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query
        .append_pair("VER", PROTOCOL_VERSION)
        .append_pair("RID", "rpc")
        .append_pair("t", "1")
        .append_pair("CI", "0")
        .append_pair("clid", &session.header_client_id)
        .append_pair("prop", &session.prop_param);
    if let Some(gsession_id) = &session.gsession_id {
        query.append_pair("gsessionid", gsession_id);
    }
    query
        .append_pair("SID", &session.sid)
        .append_pair("ec", &session.ec_param);

    HttpRequest::get(format!("{origin}{}bind?{}", session.path, query.finish()))
        .header("Connection", "Keep-Alive")
}

/// Finds a byte marker across chunk boundaries.
struct MarkerScan {
    marker: &'static [u8],
    carry: Vec<u8>,
    found: bool,
}

impl MarkerScan {
    fn new(marker: &'static [u8]) -> Self {
        Self {
            marker,
            carry: Vec::new(),
            found: false,
        }
    }

    /// Once the marker has been seen, returns how many bytes of `chunk`
    /// precede it (zero when it began in an earlier chunk).
    fn feed(&mut self, chunk: &[u8]) -> Option<usize> {
        if self.found {
            return Some(0);
        }
        let carried = self.carry.len();
        self.carry.extend_from_slice(chunk);
        let at = self
            .carry
            .windows(self.marker.len())
            .position(|w| w == self.marker);
        self.found = at.is_some();
        let keep = self.marker.len().saturating_sub(1);
        if self.carry.len() > keep {
            self.carry.drain(..self.carry.len() - keep);
        }
        at.map(|at| at.saturating_sub(carried))
    }

    fn found(&self) -> bool {
        self.found
    }
}

async fn sleep_opt(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

fn abort(task: &mut Option<JoinHandle<()>>) {
    if let Some(task) = task.take() {
        task.abort();
    }
}
