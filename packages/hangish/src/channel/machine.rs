//! Channel state machine: inputs in, effects out, no I/O.
//!
//! The driver turns request completions and timer expiries into
//! [`ChannelInput`]s and carries out the returned [`ChannelEffect`]s in
//! order. Each long-poll carries a generation number; input from a
//! superseded long-poll is ignored.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{ChannelEvent, ChannelParams, ChannelSession, ChannelStatus, NegotiatedSession};
use crate::error::ChannelFailure;

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelInput {
    Start,
    NegotiationSucceeded(NegotiatedSession),
    NegotiationFailed(ChannelFailure),
    /// Long-poll response headers arrived.
    LongPollOpened { generation: u64, status: u16 },
    /// Body bytes arrived; `events` holds what the complete frames decoded to.
    LongPollData {
        generation: u64,
        at: DateTime<Utc>,
        events: Vec<ChannelEvent>,
    },
    /// The body ended, cleanly or not.
    LongPollClosed { generation: u64, session_expired: bool },
    /// The request failed before any response arrived.
    LongPollFailed { generation: u64, reason: String },
    CookiesRotated(Vec<String>),
    ReconnectTimer,
    WatchdogFired,
    Renegotiate,
    FastReconnect,
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEffect {
    Negotiate,
    /// Cancel any outstanding long-poll, then open this one.
    OpenLongPoll {
        generation: u64,
        session: ChannelSession,
    },
    CancelLongPoll,
    ScheduleReconnect,
    CancelReconnect,
    /// (Re)start the watchdog window.
    ArmWatchdog,
    DisarmWatchdog,
    Emit(ChannelEvent),
}

#[derive(Debug)]
pub struct ChannelMachine {
    params: ChannelParams,
    status: ChannelStatus,
    session: Option<ChannelSession>,
    negotiating: bool,
    generation: u64,
    poll_open: bool,
    restoring: bool,
    last_push: Option<DateTime<Utc>>,
}

impl ChannelMachine {
    pub fn new(params: ChannelParams) -> Self {
        Self {
            params,
            status: ChannelStatus::Inactive,
            session: None,
            negotiating: false,
            generation: 0,
            poll_open: false,
            restoring: false,
            last_push: None,
        }
    }

    pub fn status(&self) -> &ChannelStatus {
        &self.status
    }

    pub fn session(&self) -> Option<&ChannelSession> {
        self.session.as_ref()
    }

    pub fn is_negotiating(&self) -> bool {
        self.negotiating
    }

    pub fn last_push(&self) -> Option<DateTime<Utc>> {
        self.last_push
    }

    pub fn handle(&mut self, input: ChannelInput) -> Vec<ChannelEffect> {
        let mut fx = Vec::new();

        if self.status.is_terminal() && !matches!(input, ChannelInput::Stop) {
            debug!(?input, "channel failed permanently; input ignored");
            return fx;
        }

        match input {
            ChannelInput::Start => {
                if self.status != ChannelStatus::Inactive {
                    debug!(status = %self.status, "start ignored");
                    return fx;
                }
                self.set_status(ChannelStatus::Connecting, &mut fx);
                self.begin_negotiation(&mut fx);
            }
            ChannelInput::Renegotiate => {
                if self.status != ChannelStatus::Inactive {
                    self.begin_negotiation(&mut fx);
                }
            }
            ChannelInput::NegotiationSucceeded(negotiated) => {
                self.negotiating = false;
                if self.status == ChannelStatus::Inactive {
                    return fx;
                }
                if let Some(client_id) = &negotiated.client_id {
                    fx.push(ChannelEffect::Emit(ChannelEvent::ClientIdUpdated(
                        client_id.clone(),
                    )));
                }
                info!(sid = %negotiated.sid, "channel session negotiated");
                self.session = Some(ChannelSession::new(&self.params, negotiated));
                if self.status == ChannelStatus::Active && self.poll_open {
                    fx.push(ChannelEffect::ArmWatchdog);
                } else if self.status == ChannelStatus::Active {
                    // A reconnect was skipped while negotiating.
                    self.open_long_poll(&mut fx);
                } else {
                    self.set_status(ChannelStatus::Connecting, &mut fx);
                    self.open_long_poll(&mut fx);
                }
            }
            ChannelInput::NegotiationFailed(failure) => {
                self.negotiating = false;
                if self.status != ChannelStatus::Inactive {
                    self.fail(failure, &mut fx);
                }
            }
            ChannelInput::LongPollOpened { generation, status } => {
                if !self.is_current(generation) {
                    return fx;
                }
                match status {
                    200..=299 => debug!(generation, "long-poll open"),
                    400 => {
                        info!(generation, "long-poll rejected with HTTP 400; renegotiating");
                        self.session_expired(&mut fx);
                    }
                    401 => self.fail(ChannelFailure::Unauthorized, &mut fx),
                    other => self.fail(
                        ChannelFailure::Transport {
                            status: Some(other),
                            reason: "long-poll rejected".into(),
                        },
                        &mut fx,
                    ),
                }
            }
            ChannelInput::LongPollData {
                generation,
                at,
                events,
            } => {
                if !self.is_current(generation) {
                    return fx;
                }
                if self.status != ChannelStatus::Active {
                    self.set_status(ChannelStatus::Active, &mut fx);
                    if std::mem::take(&mut self.restoring) {
                        fx.push(ChannelEffect::Emit(ChannelEvent::Restored {
                            last_push: self.last_push,
                        }));
                    }
                }
                self.last_push = Some(at);
                fx.push(ChannelEffect::ArmWatchdog);
                fx.extend(events.into_iter().map(ChannelEffect::Emit));
            }
            ChannelInput::LongPollClosed {
                generation,
                session_expired,
            } => {
                if !self.is_current(generation) {
                    return fx;
                }
                self.poll_open = false;
                if session_expired {
                    info!(generation, "channel session expired; renegotiating");
                    self.session_expired(&mut fx);
                } else {
                    debug!(generation, "long-poll finished; reconnecting");
                    fx.push(ChannelEffect::DisarmWatchdog);
                    fx.push(ChannelEffect::ScheduleReconnect);
                }
            }
            ChannelInput::LongPollFailed { generation, reason } => {
                if !self.is_current(generation) {
                    return fx;
                }
                self.fail(
                    ChannelFailure::Transport {
                        status: None,
                        reason,
                    },
                    &mut fx,
                );
            }
            ChannelInput::CookiesRotated(names) => {
                if !names.is_empty() {
                    fx.push(ChannelEffect::Emit(ChannelEvent::CookiesRotated(names)));
                }
            }
            ChannelInput::ReconnectTimer => {
                if self.status == ChannelStatus::Inactive || self.negotiating {
                    return fx;
                }
                if self.session.is_some() {
                    self.open_long_poll(&mut fx);
                } else {
                    self.begin_negotiation(&mut fx);
                }
            }
            ChannelInput::WatchdogFired => {
                if self.status == ChannelStatus::Inactive {
                    return fx;
                }
                warn!("no data from the long-poll within the watchdog window; reconnecting");
                self.enter_connecting(&mut fx);
                self.drop_long_poll(&mut fx);
                fx.push(ChannelEffect::ScheduleReconnect);
            }
            ChannelInput::FastReconnect => {
                if self.status == ChannelStatus::Inactive {
                    return fx;
                }
                self.drop_long_poll(&mut fx);
                fx.push(ChannelEffect::ScheduleReconnect);
            }
            ChannelInput::Stop => self.stop(&mut fx),
        }
        fx
    }

    fn is_current(&self, generation: u64) -> bool {
        self.poll_open && generation == self.generation
    }

    fn set_status(&mut self, status: ChannelStatus, fx: &mut Vec<ChannelEffect>) {
        if self.status != status {
            debug!(from = %self.status, to = %status, "channel status");
            self.status = status.clone();
            fx.push(ChannelEffect::Emit(ChannelEvent::StatusChanged(status)));
        }
    }

    /// Leaving `Active` for a reconnect means the next data restores it.
    fn enter_connecting(&mut self, fx: &mut Vec<ChannelEffect>) {
        if self.status == ChannelStatus::Active {
            self.restoring = true;
        }
        self.set_status(ChannelStatus::Connecting, fx);
    }

    fn begin_negotiation(&mut self, fx: &mut Vec<ChannelEffect>) {
        if self.negotiating {
            debug!("negotiation already in flight");
            return;
        }
        self.negotiating = true;
        fx.push(ChannelEffect::Negotiate);
    }

    fn open_long_poll(&mut self, fx: &mut Vec<ChannelEffect>) {
        let Some(session) = self.session.clone() else {
            return;
        };
        self.generation += 1;
        self.poll_open = true;
        fx.push(ChannelEffect::CancelReconnect);
        fx.push(ChannelEffect::OpenLongPoll {
            generation: self.generation,
            session,
        });
        fx.push(ChannelEffect::ArmWatchdog);
    }

    fn drop_long_poll(&mut self, fx: &mut Vec<ChannelEffect>) {
        self.poll_open = false;
        fx.push(ChannelEffect::CancelLongPoll);
        fx.push(ChannelEffect::DisarmWatchdog);
    }

    fn session_expired(&mut self, fx: &mut Vec<ChannelEffect>) {
        self.enter_connecting(fx);
        self.drop_long_poll(fx);
        fx.push(ChannelEffect::CancelReconnect);
        self.begin_negotiation(fx);
    }

    fn fail(&mut self, failure: ChannelFailure, fx: &mut Vec<ChannelEffect>) {
        warn!(error = %failure, code = failure.error_code(), "channel failed permanently");
        self.negotiating = false;
        self.drop_long_poll(fx);
        fx.push(ChannelEffect::CancelReconnect);
        self.set_status(ChannelStatus::PermanentError(failure), fx);
    }

    /// A permanent failure survives `Stop`: the channel cannot be started
    /// again, and a new one is needed after signing in afresh.
    fn stop(&mut self, fx: &mut Vec<ChannelEffect>) {
        self.negotiating = false;
        self.restoring = false;
        self.drop_long_poll(fx);
        fx.push(ChannelEffect::CancelReconnect);
        if !self.status.is_terminal() {
            self.set_status(ChannelStatus::Inactive, fx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ChannelParams {
        ChannelParams {
            path: "/webchannel/".into(),
            ec_param: "[\"ci:ec\",true,true,false]".into(),
            prop_param: "hangish".into(),
            header_client_id: "hcid".into(),
        }
    }

    fn negotiated(sid: &str) -> NegotiatedSession {
        NegotiatedSession {
            sid: sid.into(),
            gsession_id: Some("gs".into()),
            client_id: None,
        }
    }

    fn count(fx: &[ChannelEffect], pred: impl Fn(&ChannelEffect) -> bool) -> usize {
        fx.iter().filter(|e| pred(e)).count()
    }

    fn opened(fx: &[ChannelEffect]) -> Option<u64> {
        fx.iter().find_map(|e| match e {
            ChannelEffect::OpenLongPoll { generation, .. } => Some(*generation),
            _ => None,
        })
    }

    fn statuses(fx: &[ChannelEffect]) -> Vec<ChannelStatus> {
        fx.iter()
            .filter_map(|e| match e {
                ChannelEffect::Emit(ChannelEvent::StatusChanged(s)) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    /// Started, negotiated, long-poll open, first data received.
    fn active() -> (ChannelMachine, u64) {
        let mut m = ChannelMachine::new(params());
        m.handle(ChannelInput::Start);
        let fx = m.handle(ChannelInput::NegotiationSucceeded(negotiated("s1")));
        let generation = opened(&fx).unwrap();
        m.handle(ChannelInput::LongPollOpened {
            generation,
            status: 200,
        });
        m.handle(data(generation));
        assert_eq!(m.status(), &ChannelStatus::Active);
        (m, generation)
    }

    fn data(generation: u64) -> ChannelInput {
        ChannelInput::LongPollData {
            generation,
            at: Utc::now(),
            events: Vec::new(),
        }
    }

    #[test]
    fn start_negotiates_then_opens_long_poll() {
        let mut m = ChannelMachine::new(params());
        let fx = m.handle(ChannelInput::Start);
        assert_eq!(statuses(&fx), [ChannelStatus::Connecting]);
        assert_eq!(count(&fx, |e| *e == ChannelEffect::Negotiate), 1);

        let fx = m.handle(ChannelInput::NegotiationSucceeded(negotiated("s1")));
        assert!(statuses(&fx).is_empty());
        let Some(ChannelEffect::OpenLongPoll { session, .. }) = fx
            .iter()
            .find(|e| matches!(e, ChannelEffect::OpenLongPoll { .. }))
        else {
            panic!("no long-poll opened: {fx:?}");
        };
        assert_eq!(session.sid, "s1");
        assert_eq!(session.header_client_id, "hcid");
        assert!(fx.contains(&ChannelEffect::ArmWatchdog));
    }

    #[test]
    fn first_data_makes_the_channel_active() {
        let mut m = ChannelMachine::new(params());
        m.handle(ChannelInput::Start);
        let generation = opened(&m.handle(ChannelInput::NegotiationSucceeded(negotiated("s1")))).unwrap();
        let fx = m.handle(data(generation));
        assert_eq!(statuses(&fx), [ChannelStatus::Active]);
        assert!(m.last_push().is_some());

        let fx = m.handle(data(generation));
        assert!(statuses(&fx).is_empty());
        assert_eq!(fx, [ChannelEffect::ArmWatchdog]);
    }

    #[test]
    fn decoded_events_are_emitted_in_order() {
        let (mut m, generation) = active();
        let fx = m.handle(ChannelInput::LongPollData {
            generation,
            at: Utc::now(),
            events: vec![
                ChannelEvent::FrameDropped { reason: "a".into() },
                ChannelEvent::FrameDropped { reason: "b".into() },
            ],
        });
        assert_eq!(
            &fx[1..],
            [
                ChannelEffect::Emit(ChannelEvent::FrameDropped { reason: "a".into() }),
                ChannelEffect::Emit(ChannelEvent::FrameDropped { reason: "b".into() }),
            ]
        );
    }

    #[test]
    fn double_renegotiate_is_single_flight() {
        let (mut m, _) = active();
        let first = m.handle(ChannelInput::Renegotiate);
        let second = m.handle(ChannelInput::Renegotiate);
        assert_eq!(first, [ChannelEffect::Negotiate]);
        assert!(second.is_empty());
        assert!(m.is_negotiating());
    }

    #[test]
    fn negotiation_while_active_only_rearms_watchdog() {
        let (mut m, _) = active();
        m.handle(ChannelInput::Renegotiate);
        let fx = m.handle(ChannelInput::NegotiationSucceeded(negotiated("s2")));
        assert_eq!(fx, [ChannelEffect::ArmWatchdog]);
        assert_eq!(m.session().unwrap().sid, "s2");
    }

    #[test]
    fn http_400_renegotiates_without_reopening() {
        let (mut m, generation) = active();
        let fx = m.handle(ChannelInput::LongPollOpened {
            generation,
            status: 400,
        });
        assert_eq!(statuses(&fx), [ChannelStatus::Connecting]);
        assert_eq!(count(&fx, |e| *e == ChannelEffect::Negotiate), 1);
        assert_eq!(opened(&fx), None);

        // The rejected body ending must not schedule anything.
        let fx = m.handle(ChannelInput::LongPollClosed {
            generation,
            session_expired: false,
        });
        assert!(fx.is_empty());

        let fx = m.handle(ChannelInput::NegotiationSucceeded(negotiated("s2")));
        assert!(opened(&fx).is_some());
    }

    #[test]
    fn http_401_is_permanent() {
        let (mut m, generation) = active();
        let fx = m.handle(ChannelInput::LongPollOpened {
            generation,
            status: 401,
        });
        assert_eq!(
            statuses(&fx),
            [ChannelStatus::PermanentError(ChannelFailure::Unauthorized)]
        );
        assert!(m.handle(ChannelInput::Renegotiate).is_empty());
        assert!(m.handle(ChannelInput::WatchdogFired).is_empty());
        assert!(m.handle(ChannelInput::ReconnectTimer).is_empty());
    }

    #[test]
    fn other_statuses_are_permanent() {
        let (mut m, generation) = active();
        let fx = m.handle(ChannelInput::LongPollOpened {
            generation,
            status: 503,
        });
        assert!(matches!(
            statuses(&fx)[..],
            [ChannelStatus::PermanentError(ChannelFailure::Transport {
                status: Some(503),
                ..
            })]
        ));
    }

    #[test]
    fn negotiation_failure_is_permanent() {
        let mut m = ChannelMachine::new(params());
        m.handle(ChannelInput::Start);
        let fx = m.handle(ChannelInput::NegotiationFailed(ChannelFailure::Unauthorized));
        assert_eq!(
            statuses(&fx),
            [ChannelStatus::PermanentError(ChannelFailure::Unauthorized)]
        );
    }

    #[test]
    fn completion_schedules_reconnect() {
        let (mut m, generation) = active();
        let fx = m.handle(ChannelInput::LongPollClosed {
            generation,
            session_expired: false,
        });
        assert!(fx.contains(&ChannelEffect::ScheduleReconnect));
        assert_eq!(m.status(), &ChannelStatus::Active);

        let fx = m.handle(ChannelInput::ReconnectTimer);
        assert_eq!(opened(&fx), Some(generation + 1));
    }

    #[test]
    fn expiry_marker_renegotiates() {
        let (mut m, generation) = active();
        let fx = m.handle(ChannelInput::LongPollClosed {
            generation,
            session_expired: true,
        });
        assert_eq!(statuses(&fx), [ChannelStatus::Connecting]);
        assert!(fx.contains(&ChannelEffect::Negotiate));
        assert!(!fx.contains(&ChannelEffect::ScheduleReconnect));
    }

    #[test]
    fn watchdog_reconnects_once_and_reports_restore() {
        let (mut m, generation) = active();
        let before = m.last_push();
        let fx = m.handle(ChannelInput::WatchdogFired);
        assert_eq!(statuses(&fx), [ChannelStatus::Connecting]);
        assert_eq!(count(&fx, |e| *e == ChannelEffect::ScheduleReconnect), 1);
        assert!(fx.contains(&ChannelEffect::DisarmWatchdog));

        // Data from the abandoned long-poll no longer counts.
        assert!(m.handle(data(generation)).is_empty());

        let next = opened(&m.handle(ChannelInput::ReconnectTimer)).unwrap();
        let fx = m.handle(data(next));
        assert_eq!(statuses(&fx), [ChannelStatus::Active]);
        assert!(fx.contains(&ChannelEffect::Emit(ChannelEvent::Restored { last_push: before })));
    }

    #[test]
    fn reconnect_timer_during_negotiation_is_ignored() {
        let (mut m, _) = active();
        m.handle(ChannelInput::WatchdogFired);
        m.handle(ChannelInput::Renegotiate);
        assert!(m.handle(ChannelInput::ReconnectTimer).is_empty());
        let fx = m.handle(ChannelInput::NegotiationSucceeded(negotiated("s3")));
        assert!(opened(&fx).is_some());
    }

    #[test]
    fn failure_before_headers_is_permanent() {
        let mut m = ChannelMachine::new(params());
        m.handle(ChannelInput::Start);
        let generation = opened(&m.handle(ChannelInput::NegotiationSucceeded(negotiated("s1")))).unwrap();
        let fx = m.handle(ChannelInput::LongPollFailed {
            generation,
            reason: "connection refused".into(),
        });
        assert!(m.status().is_terminal());
        assert!(fx.contains(&ChannelEffect::CancelReconnect));
    }

    #[test]
    fn client_id_from_negotiation_is_reported() {
        let mut m = ChannelMachine::new(params());
        m.handle(ChannelInput::Start);
        let fx = m.handle(ChannelInput::NegotiationSucceeded(NegotiatedSession {
            client_id: Some("cid".into()),
            ..negotiated("s1")
        }));
        assert!(fx.contains(&ChannelEffect::Emit(ChannelEvent::ClientIdUpdated("cid".into()))));
    }

    #[test]
    fn stop_cancels_everything_and_sticks() {
        let (mut m, generation) = active();
        let fx = m.handle(ChannelInput::Stop);
        assert_eq!(statuses(&fx), [ChannelStatus::Inactive]);
        assert!(fx.contains(&ChannelEffect::CancelLongPoll));
        assert!(fx.contains(&ChannelEffect::DisarmWatchdog));
        assert!(fx.contains(&ChannelEffect::CancelReconnect));

        assert!(m.handle(data(generation)).is_empty());
        assert!(m.handle(ChannelInput::WatchdogFired).is_empty());
        assert!(m.handle(ChannelInput::ReconnectTimer).is_empty());
        assert!(m.handle(ChannelInput::NegotiationSucceeded(negotiated("x"))).is_empty());
    }

    #[test]
    fn permanent_error_survives_stop() {
        let (mut m, generation) = active();
        m.handle(ChannelInput::LongPollOpened {
            generation,
            status: 401,
        });
        let fx = m.handle(ChannelInput::Stop);
        assert!(statuses(&fx).is_empty());
        assert!(fx.contains(&ChannelEffect::CancelReconnect));
        assert!(m.status().is_terminal());

        assert!(m.handle(ChannelInput::Start).is_empty());
        assert!(m.status().is_terminal());
    }

    #[test]
    fn completion_during_negotiation_reopens_after_it() {
        let (mut m, generation) = active();
        m.handle(ChannelInput::Renegotiate);
        let fx = m.handle(ChannelInput::LongPollClosed {
            generation,
            session_expired: false,
        });
        assert!(fx.contains(&ChannelEffect::ScheduleReconnect));
        assert!(m.handle(ChannelInput::ReconnectTimer).is_empty());

        let fx = m.handle(ChannelInput::NegotiationSucceeded(negotiated("s2")));
        let Some(ChannelEffect::OpenLongPoll { session, .. }) = fx
            .iter()
            .find(|e| matches!(e, ChannelEffect::OpenLongPoll { .. }))
        else {
            panic!("long-poll not reopened: {fx:?}");
        };
        assert_eq!(session.sid, "s2");
        assert!(fx.contains(&ChannelEffect::ArmWatchdog));
        assert_eq!(m.status(), &ChannelStatus::Active);
    }

    #[test]
    fn fast_reconnect_during_negotiation_reopens_after_it() {
        let (mut m, _) = active();
        m.handle(ChannelInput::Renegotiate);
        let fx = m.handle(ChannelInput::FastReconnect);
        assert!(fx.contains(&ChannelEffect::CancelLongPoll));
        assert!(m.handle(ChannelInput::ReconnectTimer).is_empty());
        let fx = m.handle(ChannelInput::NegotiationSucceeded(negotiated("s2")));
        assert!(opened(&fx).is_some());
    }
}
