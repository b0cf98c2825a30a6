//! Reliable framed link between the two controllers
//!
//! Data frames are acknowledged. The sender keeps one frame awaiting ACK and
//! queues the rest; a NACK or ACK timeout schedules a retransmit after a
//! fixed backoff, up to `max_retries` retransmissions. Heartbeats are sent on
//! a fixed interval and never acknowledged; any valid frame refreshes peer
//! liveness.
//!
//! Requests occupy a single correlation slot. A response is delivered only
//! if it matches the slot; anything else is acknowledged and dropped.
//! Notices take their own correlation id and never touch the slot.
//!
//! Correlation ids start from a clock-derived value so a restarted node does
//! not reuse the id its peer saw last. Duplicate suppression is reset once
//! the peer has been silent for the liveness window.

use crate::domain::error::LinkError;
use crate::domain::types::{epoch_ms, CorrelationId};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::frame::{decode, Decoded, Frame, FrameType};
use bytes::{Buf, BytesMut};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Byte transport under the link. Both calls must return immediately.
pub trait Transport: Send {
    fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), LinkError>;

    /// Append whatever bytes have arrived to `buf`, returning how many
    fn poll_bytes(&mut self, buf: &mut BytesMut) -> Result<usize, LinkError>;
}

/// In-memory transport over a pair of bounded channels
pub struct ChannelTransport {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl ChannelTransport {
    pub fn from_parts(tx: mpsc::Sender<Vec<u8>>, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { tx, rx }
    }

    /// Two connected endpoints
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (Self::from_parts(a_tx, a_rx), Self::from_parts(b_tx, b_rx))
    }
}

impl Transport for ChannelTransport {
    fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        match self.tx.try_send(bytes.to_vec()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Line overrun; the retry layer recovers
                debug!(len = bytes.len(), "transport_overrun");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(LinkError::TransportClosed),
        }
    }

    fn poll_bytes(&mut self, buf: &mut BytesMut) -> Result<usize, LinkError> {
        let mut total = 0;
        loop {
            match self.rx.try_recv() {
                Ok(chunk) => {
                    total += chunk.len();
                    buf.extend_from_slice(&chunk);
                }
                Err(mpsc::error::TryRecvError::Empty) => return Ok(total),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return if total > 0 { Ok(total) } else { Err(LinkError::TransportClosed) };
                }
            }
        }
    }
}

/// Link timing, taken from `[link]`
#[derive(Debug, Clone, Copy)]
pub struct LinkSettings {
    pub heartbeat_interval: Duration,
    pub missed_heartbeats: u32,
    pub ack_timeout: Duration,
    pub retry_backoff: Duration,
    pub max_retries: u32,
}

impl LinkSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            missed_heartbeats: config.missed_heartbeats(),
            ack_timeout: config.ack_timeout(),
            retry_backoff: config.retry_backoff(),
            max_retries: config.link_max_retries(),
        }
    }

    /// Silence after which the peer is considered unreachable
    pub fn liveness_window(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats
    }
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Something the owner of the link has to act on
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Peer sent a request (CAPTURE_REQUEST or AUTH_QUERY)
    Request(Frame),
    /// Response matching the active correlation slot; the slot is now free
    Response(Frame),
    /// Peer sent a notice (ACCESS_LOG)
    Notice(Frame),
    /// A data frame could not be delivered
    Failed { corr: CorrelationId, error: LinkError },
}

struct Outstanding {
    frame: Frame,
    bytes: Vec<u8>,
    attempts: u32,
    ack_deadline: Instant,
    resend_at: Option<Instant>,
}

pub struct SerialLink<T: Transport> {
    transport: T,
    settings: LinkSettings,
    metrics: Arc<Metrics>,
    rx_buf: BytesMut,
    queue: VecDeque<Frame>,
    outstanding: Option<Outstanding>,
    /// Single in-flight request slot: correlation id and expected response type
    active: Option<(CorrelationId, FrameType)>,
    next_corr: u16,
    last_delivered: Option<(FrameType, CorrelationId)>,
    last_heard: Instant,
    next_heartbeat: Instant,
    peer_reachable: bool,
}

impl<T: Transport> SerialLink<T> {
    pub fn new(transport: T, settings: LinkSettings, metrics: Arc<Metrics>, now: Instant) -> Self {
        Self {
            transport,
            settings,
            metrics,
            rx_buf: BytesMut::with_capacity(1024),
            queue: VecDeque::new(),
            outstanding: None,
            active: None,
            next_corr: initial_corr(epoch_ms()),
            last_delivered: None,
            last_heard: now,
            next_heartbeat: now,
            peer_reachable: true,
        }
    }

    /// Correlation id of the in-flight request, if any
    pub fn active(&self) -> Option<CorrelationId> {
        self.active.map(|(corr, _)| corr)
    }

    pub fn is_peer_reachable(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_heard) < self.settings.liveness_window()
    }

    /// Start a request transaction. Fails with `Busy` while another request
    /// holds the correlation slot.
    pub fn begin_request<B: Serialize>(
        &mut self,
        kind: FrameType,
        body: &B,
        now: Instant,
    ) -> Result<CorrelationId, LinkError> {
        if let Some((corr, _)) = self.active {
            return Err(LinkError::Busy(corr));
        }
        let expected = kind
            .response_type()
            .ok_or_else(|| LinkError::BadPayload(format!("{} is not a request", kind.as_str())))?;

        let corr = self.allocate_corr();
        let frame = Frame::with_json(kind, corr, body)?;
        self.active = Some((corr, expected));
        debug!(corr = %corr, kind = kind.as_str(), "link_request_started");
        self.enqueue(frame, now);
        Ok(corr)
    }

    /// Send a notice. It is acknowledged and retransmitted like any data
    /// frame but leaves the request slot alone.
    pub fn notify<B: Serialize>(
        &mut self,
        kind: FrameType,
        body: &B,
        now: Instant,
    ) -> Result<CorrelationId, LinkError> {
        if !kind.is_notice() {
            return Err(LinkError::BadPayload(format!("{} is not a notice", kind.as_str())));
        }
        let corr = self.allocate_corr();
        let frame = Frame::with_json(kind, corr, body)?;
        debug!(corr = %corr, kind = kind.as_str(), "link_notice_queued");
        self.enqueue(frame, now);
        Ok(corr)
    }

    /// Frame `corr` is still queued or awaiting its ACK
    pub fn is_pending(&self, corr: CorrelationId) -> bool {
        self.outstanding.as_ref().is_some_and(|o| o.frame.corr == corr)
            || self.queue.iter().any(|f| f.corr == corr)
    }

    /// Answer a request received from the peer, reusing its correlation id
    pub fn respond<B: Serialize>(
        &mut self,
        request: &Frame,
        body: &B,
        now: Instant,
    ) -> Result<(), LinkError> {
        let kind = request.kind.response_type().ok_or_else(|| {
            LinkError::BadPayload(format!("{} has no response", request.kind.as_str()))
        })?;
        let frame = Frame::with_json(kind, request.corr, body)?;
        self.enqueue(frame, now);
        Ok(())
    }

    /// Free the correlation slot. Late responses for it are dropped.
    pub fn abandon(&mut self) {
        let Some((corr, _)) = self.active.take() else {
            return;
        };
        self.queue.retain(|f| f.corr != corr);
        if self.outstanding.as_ref().is_some_and(|o| o.frame.corr == corr) {
            self.outstanding = None;
        }
        debug!(corr = %corr, "link_request_abandoned");
    }

    /// Drive the link: read and dispatch frames, retransmit, heartbeat.
    pub fn poll(&mut self, now: Instant) -> Vec<LinkEvent> {
        let mut events = Vec::new();

        match self.transport.poll_bytes(&mut self.rx_buf) {
            Ok(n) if n > 0 => trace!(bytes = n, buffered = self.rx_buf.len(), "link_bytes_received"),
            Ok(_) => {}
            Err(e) => trace!(error = %e, "link_read_failed"),
        }

        while let Some((decoded, consumed)) = decode(&self.rx_buf) {
            self.rx_buf.advance(consumed);
            match decoded {
                Decoded::Frame(frame) => self.handle_frame(frame, now, &mut events),
                Decoded::Skipped => debug!(discarded = consumed, "link_sync_discarded_bytes"),
                Decoded::Corrupt { corr, reason } => {
                    self.metrics.record_link_corrupt();
                    warn!(reason, corr = ?corr.map(|c| c.0), "link_frame_corrupt");
                    if let Some(corr) = corr {
                        self.write(&Frame::control(FrameType::Nack, corr));
                    }
                }
            }
        }

        self.service_outstanding(now, &mut events);
        self.pump_queue(now);

        if now >= self.next_heartbeat {
            self.write(&Frame::control(FrameType::Heartbeat, CorrelationId::CONTROL));
            self.next_heartbeat = now + self.settings.heartbeat_interval;
        }

        let reachable = self.is_peer_reachable(now);
        if reachable != self.peer_reachable {
            self.peer_reachable = reachable;
            if reachable {
                info!("peer_reachable");
            } else {
                warn!(
                    silent_ms = %now.saturating_duration_since(self.last_heard).as_millis(),
                    "peer_unreachable"
                );
            }
        }

        events
    }

    fn handle_frame(&mut self, frame: Frame, now: Instant, events: &mut Vec<LinkEvent>) {
        if !self.is_peer_reachable(now) && self.last_delivered.take().is_some() {
            debug!("link_duplicate_filter_reset");
        }
        self.last_heard = now;
        trace!(kind = frame.kind.as_str(), corr = %frame.corr, "link_frame_received");

        match frame.kind {
            FrameType::Heartbeat => {}
            FrameType::Ack => {
                if self.outstanding.as_ref().is_some_and(|o| o.frame.corr == frame.corr) {
                    self.outstanding = None;
                }
            }
            FrameType::Nack => {
                if let Some(out) = self.outstanding.as_mut() {
                    if out.frame.corr == frame.corr && out.resend_at.is_none() {
                        out.resend_at = Some(now + self.settings.retry_backoff);
                    }
                }
            }
            FrameType::CaptureRequest
            | FrameType::CaptureResult
            | FrameType::AuthQuery
            | FrameType::AuthResult
            | FrameType::AccessLog => {
                self.write(&Frame::control(FrameType::Ack, frame.corr));

                if self.last_delivered == Some((frame.kind, frame.corr)) {
                    debug!(kind = frame.kind.as_str(), corr = %frame.corr, "link_duplicate_dropped");
                    return;
                }
                self.last_delivered = Some((frame.kind, frame.corr));

                if frame.kind.response_type().is_some() {
                    events.push(LinkEvent::Request(frame));
                    return;
                }
                if frame.kind.is_notice() {
                    events.push(LinkEvent::Notice(frame));
                    return;
                }

                // A response implies our request got through
                if self.outstanding.as_ref().is_some_and(|o| o.frame.corr == frame.corr) {
                    self.outstanding = None;
                }
                if self.active == Some((frame.corr, frame.kind)) {
                    self.active = None;
                    events.push(LinkEvent::Response(frame));
                } else {
                    debug!(kind = frame.kind.as_str(), corr = %frame.corr, "link_stale_response_dropped");
                }
            }
        }
    }

    fn service_outstanding(&mut self, now: Instant, events: &mut Vec<LinkEvent>) {
        let Some(out) = self.outstanding.as_mut() else {
            return;
        };

        if out.resend_at.is_none() && now >= out.ack_deadline {
            out.resend_at = Some(now + self.settings.retry_backoff);
        }

        let Some(resend_at) = out.resend_at else {
            return;
        };
        if now < resend_at {
            return;
        }

        if out.attempts > self.settings.max_retries {
            let corr = out.frame.corr;
            let error = LinkError::RetriesExhausted { corr, attempts: out.attempts };
            warn!(corr = %corr, kind = out.frame.kind.as_str(), attempts = out.attempts, "link_retries_exhausted");
            self.outstanding = None;
            if self.active.is_some_and(|(c, _)| c == corr) {
                self.active = None;
            }
            events.push(LinkEvent::Failed { corr, error });
            return;
        }

        out.attempts += 1;
        out.ack_deadline = now + self.settings.ack_timeout;
        out.resend_at = None;
        self.metrics.record_link_retry();
        debug!(corr = %out.frame.corr, attempt = out.attempts, "link_retransmit");
        let bytes = out.bytes.clone();
        self.write_raw(&bytes);
    }

    fn enqueue(&mut self, frame: Frame, now: Instant) {
        self.queue.push_back(frame);
        self.pump_queue(now);
    }

    fn pump_queue(&mut self, now: Instant) {
        if self.outstanding.is_some() {
            return;
        }
        let Some(frame) = self.queue.pop_front() else {
            return;
        };
        let bytes = frame.encode();
        self.write_raw(&bytes);
        self.outstanding = Some(Outstanding {
            frame,
            bytes,
            attempts: 1,
            ack_deadline: now + self.settings.ack_timeout,
            resend_at: None,
        });
    }

    fn write(&mut self, frame: &Frame) {
        self.write_raw(&frame.encode());
    }

    fn write_raw(&mut self, bytes: &[u8]) {
        if let Err(e) = self.transport.send_bytes(bytes) {
            trace!(error = %e, "link_write_failed");
        }
    }

    fn allocate_corr(&mut self) -> CorrelationId {
        let corr = CorrelationId(self.next_corr);
        self.next_corr = self.next_corr.wrapping_add(1);
        if self.next_corr == CorrelationId::CONTROL.0 {
            self.next_corr = 1;
        }
        corr
    }
}

/// First correlation id for a fresh link, never the control id
fn initial_corr(epoch_ms: u64) -> u16 {
    match (epoch_ms % u64::from(u16::MAX)) as u16 {
        0 => 1,
        seed => seed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::AuthQuery;
    use parking_lot::Mutex;

    fn settings() -> LinkSettings {
        LinkSettings {
            heartbeat_interval: Duration::from_millis(1000),
            missed_heartbeats: 3,
            ack_timeout: Duration::from_millis(300),
            retry_backoff: Duration::from_millis(100),
            max_retries: 3,
        }
    }

    fn pair(now: Instant) -> (SerialLink<ChannelTransport>, SerialLink<ChannelTransport>) {
        let (a, b) = ChannelTransport::pair(64);
        let metrics = Arc::new(Metrics::new());
        (
            SerialLink::new(a, settings(), metrics.clone(), now),
            SerialLink::new(b, settings(), metrics, now),
        )
    }

    fn query(plate: &str) -> AuthQuery {
        AuthQuery { plate: plate.to_string() }
    }

    /// Transport that drops every outgoing write while `mute` is set
    struct Muted {
        inner: ChannelTransport,
        mute: Arc<Mutex<bool>>,
    }

    impl Transport for Muted {
        fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
            if *self.mute.lock() {
                return Ok(());
            }
            self.inner.send_bytes(bytes)
        }

        fn poll_bytes(&mut self, buf: &mut BytesMut) -> Result<usize, LinkError> {
            self.inner.poll_bytes(buf)
        }
    }

    #[test]
    fn test_request_response_roundtrip() {
        let t0 = Instant::now();
        let (mut ctrl, mut vision) = pair(t0);

        let corr = ctrl.begin_request(FrameType::AuthQuery, &query("ABC123"), t0).unwrap();
        assert_eq!(ctrl.active(), Some(corr));

        let events = vision.poll(t0);
        let request = match events.as_slice() {
            [LinkEvent::Request(f)] => f.clone(),
            other => panic!("unexpected events {other:?}"),
        };
        assert_eq!(request.json::<AuthQuery>().unwrap().plate, "ABC123");

        vision.respond(&request, &crate::domain::types::RemoteLookup::NotFound, t0).unwrap();

        let events = ctrl.poll(t0);
        assert!(matches!(events.as_slice(), [LinkEvent::Response(f)] if f.corr == corr));
        assert_eq!(ctrl.active(), None);
    }

    #[test]
    fn test_busy_while_slot_occupied() {
        let t0 = Instant::now();
        let (mut ctrl, _vision) = pair(t0);

        let corr = ctrl.begin_request(FrameType::AuthQuery, &query("A"), t0).unwrap();
        let second = ctrl.begin_request(FrameType::AuthQuery, &query("B"), t0);
        assert_eq!(second, Err(LinkError::Busy(corr)));

        ctrl.abandon();
        assert!(ctrl.begin_request(FrameType::AuthQuery, &query("B"), t0).is_ok());
    }

    #[test]
    fn test_retries_exhausted_after_max_retries() {
        let t0 = Instant::now();
        let (a, _b) = ChannelTransport::pair(64);
        let mute = Arc::new(Mutex::new(false));
        let metrics = Arc::new(Metrics::new());
        // Peer never answers: the other end is never polled
        let mut ctrl =
            SerialLink::new(Muted { inner: a, mute: mute.clone() }, settings(), metrics, t0);

        let corr = ctrl.begin_request(FrameType::CaptureRequest, &query("X"), t0).unwrap();

        let mut failed = None;
        let mut now = t0;
        for _ in 0..100 {
            now += Duration::from_millis(50);
            for event in ctrl.poll(now) {
                if let LinkEvent::Failed { corr, error } = event {
                    failed = Some((corr, error, now));
                }
            }
            if failed.is_some() {
                break;
            }
        }

        let (failed_corr, error, at) = failed.expect("link should give up");
        assert_eq!(failed_corr, corr);
        assert_eq!(error, LinkError::RetriesExhausted { corr, attempts: 4 });
        // 4 transmissions x (300 ms ack + 100 ms backoff)
        assert!(at - t0 >= Duration::from_millis(1600));
        assert_eq!(ctrl.active(), None);
    }

    #[test]
    fn test_lost_ack_retransmit_is_deduplicated() {
        let t0 = Instant::now();
        let (a, b) = ChannelTransport::pair(64);
        let metrics = Arc::new(Metrics::new());
        let mute = Arc::new(Mutex::new(true));
        let mut ctrl = SerialLink::new(a, settings(), metrics.clone(), t0);
        let mut vision = SerialLink::new(Muted { inner: b, mute: mute.clone() }, settings(), metrics, t0);

        ctrl.begin_request(FrameType::CaptureRequest, &query("X"), t0).unwrap();

        // Vision receives the request but its ACK is lost
        assert_eq!(vision.poll(t0).len(), 1);
        *mute.lock() = false;

        // Controller retransmits after ack timeout + backoff
        ctrl.poll(t0 + Duration::from_millis(300));
        ctrl.poll(t0 + Duration::from_millis(400));

        let events = vision.poll(t0 + Duration::from_millis(400));
        assert!(events.is_empty(), "duplicate must not be delivered twice: {events:?}");
    }

    #[test]
    fn test_late_response_after_abandon_is_dropped() {
        let t0 = Instant::now();
        let (mut ctrl, mut vision) = pair(t0);

        ctrl.begin_request(FrameType::AuthQuery, &query("ABC123"), t0).unwrap();
        let request = match vision.poll(t0).pop() {
            Some(LinkEvent::Request(f)) => f,
            other => panic!("unexpected {other:?}"),
        };
        ctrl.poll(t0);
        ctrl.abandon();

        vision.respond(&request, &crate::domain::types::RemoteLookup::NotFound, t0).unwrap();
        assert!(ctrl.poll(t0).is_empty());
    }

    #[test]
    fn test_corrupt_frame_is_nacked_and_resent() {
        let t0 = Instant::now();
        let (a, mut raw_peer) = ChannelTransport::pair(64);
        let metrics = Arc::new(Metrics::new());
        let mut ctrl = SerialLink::new(a, settings(), metrics.clone(), t0);

        // Peer sends a damaged data frame
        let mut bytes = Frame::with_json(FrameType::AuthQuery, CorrelationId(42), &query("Z"))
            .unwrap()
            .encode();
        bytes[7] ^= 0x55;
        raw_peer.send_bytes(&bytes).unwrap();

        assert!(ctrl.poll(t0).is_empty());
        assert_eq!(metrics.report().link_corrupt_total, 1);

        let mut buf = BytesMut::new();
        raw_peer.poll_bytes(&mut buf).unwrap();
        let mut saw_nack = false;
        while let Some((decoded, consumed)) = decode(&buf) {
            buf.advance(consumed);
            if let Decoded::Frame(f) = decoded {
                saw_nack |= f.kind == FrameType::Nack && f.corr == CorrelationId(42);
            }
        }
        assert!(saw_nack);
    }

    #[test]
    fn test_peer_unreachable_after_missed_heartbeats() {
        let t0 = Instant::now();
        let (mut ctrl, mut vision) = pair(t0);

        let mut now = t0;
        for _ in 0..5 {
            vision.poll(now);
            ctrl.poll(now);
            now += Duration::from_millis(1000);
        }
        assert!(ctrl.is_peer_reachable(now));

        // Vision goes silent
        let silent_from = now - Duration::from_millis(1000);
        for _ in 0..4 {
            ctrl.poll(now);
            now += Duration::from_millis(500);
        }
        assert!(now - silent_from >= Duration::from_millis(3000));
        assert!(!ctrl.is_peer_reachable(now));

        // Any valid frame restores liveness
        vision.poll(now);
        ctrl.poll(now);
        assert!(ctrl.is_peer_reachable(now));
    }

    #[test]
    fn test_initial_corr_never_control() {
        assert_eq!(initial_corr(0), 1);
        assert_eq!(initial_corr(u64::from(u16::MAX)), 1);
        assert_eq!(initial_corr(1_700_000_000_123), (1_700_000_000_123u64 % 65535) as u16);
        assert_ne!(initial_corr(1_700_000_000_123), initial_corr(1_700_000_004_000));
    }

    #[test]
    fn test_restarted_peer_reusing_corr_is_delivered() {
        let t0 = Instant::now();
        let metrics = Arc::new(Metrics::new());
        let (to_vision, vision_rx) = mpsc::channel(64);
        let (vision_tx, ctrl_rx) = mpsc::channel(64);
        let mut vision = SerialLink::new(
            ChannelTransport::from_parts(vision_tx, vision_rx),
            settings(),
            metrics.clone(),
            t0,
        );
        let mut ctrl = SerialLink::new(
            ChannelTransport::from_parts(to_vision.clone(), ctrl_rx),
            settings(),
            metrics.clone(),
            t0,
        );

        ctrl.next_corr = 7;
        ctrl.begin_request(FrameType::CaptureRequest, &query("X"), t0).unwrap();
        assert!(matches!(vision.poll(t0).as_slice(), [LinkEvent::Request(_)]));

        // Controller comes back after a power cycle and happens to reuse id 7
        let t1 = t0 + Duration::from_secs(5);
        let (_unused, fresh_rx) = mpsc::channel(64);
        let mut rebooted =
            SerialLink::new(ChannelTransport::from_parts(to_vision, fresh_rx), settings(), metrics, t1);
        rebooted.next_corr = 7;
        let corr = rebooted.begin_request(FrameType::CaptureRequest, &query("Y"), t1).unwrap();

        let delivered: Vec<_> = vision
            .poll(t1)
            .into_iter()
            .filter_map(|e| match e {
                LinkEvent::Request(f) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].corr, corr);
        assert_eq!(delivered[0].json::<AuthQuery>().unwrap().plate, "Y");
    }

    #[test]
    fn test_notice_delivered_without_slot() {
        let t0 = Instant::now();
        let (mut ctrl, mut vision) = pair(t0);

        let request = ctrl.begin_request(FrameType::AuthQuery, &query("A"), t0).unwrap();
        let notice = ctrl.notify(FrameType::AccessLog, &query("B"), t0).unwrap();
        assert_ne!(notice, request);
        assert_eq!(ctrl.active(), Some(request));
        assert!(ctrl.is_pending(notice));

        // Request first; the notice follows once the request is acknowledged
        let mut now = t0;
        let mut notices = Vec::new();
        for _ in 0..4 {
            for event in vision.poll(now) {
                if let LinkEvent::Notice(f) = event {
                    notices.push(f);
                }
            }
            ctrl.poll(now);
            now += Duration::from_millis(50);
        }
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].corr, notice);
        assert!(!ctrl.is_pending(notice));
        assert_eq!(ctrl.active(), Some(request));

        assert!(ctrl.notify(FrameType::AuthQuery, &query("C"), now).is_err());
    }

    #[test]
    fn test_correlation_ids_skip_control() {
        let t0 = Instant::now();
        let (mut ctrl, _vision) = pair(t0);
        ctrl.next_corr = u16::MAX;

        let first = ctrl.begin_request(FrameType::AuthQuery, &query("A"), t0).unwrap();
        ctrl.abandon();
        let second = ctrl.begin_request(FrameType::AuthQuery, &query("B"), t0).unwrap();

        assert_eq!(first, CorrelationId(u16::MAX));
        assert_eq!(second, CorrelationId(1));
    }
}
