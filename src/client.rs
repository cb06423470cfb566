//! Stratum pool client
//!
//! `StratumPoolClient` is a handle around one background connection task. The
//! task owns the socket, the line buffer, the session state machine, the share
//! timer and the reconnect timer, so no protocol state is ever touched from
//! two places at once. The handle observes it through a `watch` channel and
//! receives `PoolEvent`s over an unbounded channel.

use crate::config::ClientConfig;
use crate::session::Session;
use crate::utils::ExponentialBackoff;
use crate::worker::{ShareWorker, SharedHashRate, SimulationWorker};
use bytes::BytesMut;
use crate::{
    Credentials, Error, HashRate, Job, PoolEndpoint, Result, SessionState, ShareStats, APP_NAME,
    APP_VERSION,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::codec::{Decoder, FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// Longest line accepted from a pool before it is discarded
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Everything the client reports to its owner
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum PoolEvent {
    /// Subscribe response accepted
    Subscribed {
        extranonce1: String,
        extranonce2_size: usize,
    },
    /// Credentials accepted
    Authorized,
    /// Credentials rejected; the client will not retry on its own
    AuthorizationFailed { error: Option<Value> },
    /// A job notification replaced the current job
    NewJob(Job),
    /// Share difficulty changed
    DifficultyChanged(f64),
    /// A share was written to the pool
    ShareSubmitted {
        job_id: String,
        nonce: String,
        extranonce2: String,
        difficulty: f64,
    },
    /// Pool verdict for a submitted share
    ShareResult {
        job_id: String,
        accepted: bool,
        error: Option<Value>,
    },
    /// Socket failed to open, read or write
    SocketError(String),
    /// Pool closed the connection
    Disconnected,
    /// A reconnect attempt has been scheduled
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnect budget exhausted; terminal
    MaxReconnectAttemptsReached { attempts: u32 },
}

/// Point-in-time view of the client
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClientStatus {
    pub state: SessionState,
    pub job: Option<Job>,
    pub extranonce1: Option<String>,
    pub extranonce2_size: Option<usize>,
    pub reconnect_attempts: u32,
    pub shares: ShareStats,
}

impl ClientStatus {
    pub fn is_connected(&self) -> bool {
        !matches!(
            self.state,
            SessionState::Disconnected | SessionState::Connecting | SessionState::GivenUp
        )
    }

    pub fn is_subscribed(&self) -> bool {
        self.state.is_subscribed()
    }

    pub fn is_authorized(&self) -> bool {
        self.state.is_authorized()
    }
}

/// Background task bookkeeping for a live connection
struct ConnectionHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// Client for a single mining pool
pub struct StratumPoolClient {
    config: ClientConfig,
    hash_rate: SharedHashRate,
    events: mpsc::UnboundedSender<PoolEvent>,
    status: Arc<watch::Sender<ClientStatus>>,
    connection: Option<ConnectionHandle>,
}

impl StratumPoolClient {
    /// Create a disconnected client and the receiver for its events
    pub fn new(config: ClientConfig) -> Result<(Self, mpsc::UnboundedReceiver<PoolEvent>)> {
        let hash_rate = SharedHashRate::new(config.hash_rate)?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ClientStatus::default());

        Ok((
            Self {
                config,
                hash_rate,
                events,
                status: Arc::new(status),
                connection: None,
            },
            events_rx,
        ))
    }

    /// Connect to `pool_url` as `<identifier>.<worker_name>`.
    ///
    /// Fails synchronously on a malformed URL without touching the network.
    /// Otherwise returns once the socket is open and the handshake grace
    /// period has elapsed; authorization is reported later through events.
    /// If the first socket open fails, the error is returned and the
    /// reconnect loop keeps trying in the background until `disconnect`.
    #[instrument(skip(self))]
    pub async fn connect(&mut self, pool_url: &str, identifier: &str, worker_name: &str) -> Result<()> {
        let endpoint = PoolEndpoint::parse(pool_url)?;
        self.disconnect().await;

        let credentials = Credentials::new(identifier, worker_name);
        info!("Connecting to {} as {}", endpoint, credentials.username());

        let span = info_span!("pool_connection", pool = %endpoint);
        let shutdown = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = ConnectionTask {
            endpoint,
            credentials,
            config: self.config.clone(),
            worker: Box::new(SimulationWorker::new(
                self.hash_rate.clone(),
                self.config.share_timing,
            )),
            events: self.events.clone(),
            status: Arc::clone(&self.status),
            shutdown: shutdown.clone(),
            stats: ShareStats::default(),
        };
        let task = tokio::spawn(task.run(ready_tx).instrument(span));
        self.connection = Some(ConnectionHandle { shutdown, task });

        match ready_rx.await {
            Ok(Ok(())) => {
                sleep(self.config.connect_grace).await;
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::cancelled("connect")),
        }
    }

    /// Tear the session down. Safe to call in any state, any number of times.
    ///
    /// Returns the last status seen before the reset, share counters included.
    pub async fn disconnect(&mut self) -> ClientStatus {
        if let Some(connection) = self.connection.take() {
            // Cancelling first stops both timers before the socket is dropped
            connection.shutdown.cancel();
            if let Err(e) = connection.task.await {
                if e.is_panic() {
                    error!("Connection task panicked: {}", e);
                }
            }
            info!("Disconnected from pool");
        }
        self.status.send_replace(ClientStatus::default())
    }

    /// Current snapshot of the client
    pub fn status(&self) -> ClientStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status change
    pub fn subscribe_status(&self) -> watch::Receiver<ClientStatus> {
        self.status.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn current_job(&self) -> Option<Job> {
        self.status.borrow().job.clone()
    }

    pub fn hash_rate(&self) -> HashRate {
        self.hash_rate.get()
    }

    /// Change the simulated hash rate; applies from the next scheduled share
    pub fn set_hash_rate(&self, rate: HashRate) -> Result<()> {
        self.hash_rate.set(rate)?;
        info!("Hash rate set to {}", rate);
        Ok(())
    }
}

impl Drop for StratumPoolClient {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.shutdown.cancel();
        }
    }
}

/// How one connection ended
enum SessionEnd {
    Shutdown,
    Closed,
    Failed(Error),
}

/// The single task that owns all mutable connection state
struct ConnectionTask {
    endpoint: PoolEndpoint,
    credentials: Credentials,
    config: ClientConfig,
    worker: Box<dyn ShareWorker>,
    events: mpsc::UnboundedSender<PoolEvent>,
    status: Arc<watch::Sender<ClientStatus>>,
    shutdown: CancellationToken,
    stats: ShareStats,
}

impl ConnectionTask {
    async fn run(mut self, ready: oneshot::Sender<Result<()>>) {
        let backoff = ExponentialBackoff::new(self.config.reconnect_delay, self.config.max_reconnect_delay);
        let shutdown = self.shutdown.clone();
        let mut ready = Some(ready);
        let mut attempt: u32 = 0;

        loop {
            self.publish(SessionState::Connecting, None, attempt);

            let opened = tokio::select! {
                _ = shutdown.cancelled() => return,
                opened = self.open() => opened,
            };

            match opened {
                Ok(stream) => {
                    attempt = 0;
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Ok(()));
                    }
                    match self.run_session(stream).await {
                        SessionEnd::Shutdown => return,
                        SessionEnd::Closed => {
                            warn!("Pool closed the connection");
                            self.emit(PoolEvent::Disconnected);
                        }
                        SessionEnd::Failed(e) => {
                            warn!("Connection failed: {}", e);
                            self.emit(PoolEvent::SocketError(e.to_string()));
                        }
                    }
                }
                Err(e) => {
                    warn!("Could not connect: {}", e);
                    self.emit(PoolEvent::SocketError(e.to_string()));
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(e));
                    }
                }
            }

            if attempt >= self.config.max_reconnect_attempts {
                error!("Giving up after {} reconnect attempts", attempt);
                self.publish(SessionState::GivenUp, None, attempt);
                self.emit(PoolEvent::MaxReconnectAttemptsReached { attempts: attempt });
                return;
            }

            let delay = backoff.delay_for(attempt);
            attempt += 1;
            self.publish(SessionState::Connecting, None, attempt);
            info!("Reconnecting in {:?} (attempt {}/{})", delay, attempt, self.config.max_reconnect_attempts);
            self.emit(PoolEvent::Reconnecting { attempt, delay });

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = sleep(delay) => {}
            }
        }
    }

    async fn open(&self) -> Result<TcpStream> {
        let (host, port) = self.endpoint.socket_target();
        let stream = timeout(self.config.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::timeout(format!("connect to {}", self.endpoint)))?
            .map_err(|e| Error::network(format!("connect to {}: {}", self.endpoint, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", e);
        }
        info!("Connected to {}", self.endpoint);
        Ok(stream)
    }

    async fn run_session(&mut self, stream: TcpStream) -> SessionEnd {
        let shutdown = self.shutdown.clone();
        let (reader, writer) = stream.into_split();
        let mut lines = FramedRead::new(reader, PoolLineCodec::new());
        let mut sink = FramedWrite::new(writer, LinesCodec::new());

        let agent = format!("{}/{}", APP_NAME, APP_VERSION);
        let mut session = Session::new(self.credentials.clone(), agent);
        session.start();
        if let Err(e) = flush(&mut session, &mut sink).await {
            return SessionEnd::Failed(e);
        }

        // One share timer per session; it is re-armed, never duplicated
        let share_timer = sleep(Duration::ZERO);
        tokio::pin!(share_timer);
        let mut share_armed = false;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,

                line = lines.next() => match line {
                    Some(Ok(line)) => {
                        for event in session.handle_line(&line) {
                            self.emit(event);
                        }
                        if let Err(e) = flush(&mut session, &mut sink).await {
                            return SessionEnd::Failed(e);
                        }
                        if session.is_mining() && !share_armed {
                            let delay = self.worker.share_delay(session.difficulty());
                            share_timer.as_mut().reset(deadline_after(delay));
                            share_armed = true;
                            debug!("First share due in {:?}", delay);
                        }
                        self.publish_session(&session);
                    }
                    Some(Err(LinesCodecError::Io(e))) => return SessionEnd::Failed(e.into()),
                    Some(Err(e)) => return SessionEnd::Failed(Error::stratum(e.to_string())),
                    None => return SessionEnd::Closed,
                },

                _ = &mut share_timer, if share_armed => {
                    share_armed = false;
                    match session.submit_share(self.worker.as_mut()) {
                        Ok(event) => {
                            self.stats.submitted += 1;
                            self.emit(event);
                            if let Err(e) = flush(&mut session, &mut sink).await {
                                return SessionEnd::Failed(e);
                            }
                            let delay = self.worker.share_delay(session.difficulty());
                            share_timer.as_mut().reset(deadline_after(delay));
                            share_armed = true;
                        }
                        Err(e) => debug!("Share timer stopped: {}", e),
                    }
                    self.publish_session(&session);
                }
            }
        }
    }

    fn emit(&mut self, event: PoolEvent) {
        if let PoolEvent::ShareResult { accepted, .. } = &event {
            self.stats.record_verdict(*accepted);
        }
        // A dropped receiver only means nobody is listening
        let _ = self.events.send(event);
    }

    fn publish(&self, state: SessionState, session: Option<&Session>, attempts: u32) {
        let subscription = session.and_then(Session::subscription);
        self.status.send_replace(ClientStatus {
            state,
            job: session.and_then(Session::job).cloned(),
            extranonce1: subscription.map(|s| s.extranonce1.clone()),
            extranonce2_size: subscription.map(|s| s.extranonce2_size),
            reconnect_attempts: attempts,
            shares: self.stats,
        });
    }

    fn publish_session(&self, session: &Session) {
        self.publish(session.state(), Some(session), 0);
    }
}

/// Newline framing that skips oversized or non-UTF-8 lines instead of ending the stream
struct PoolLineCodec(LinesCodec);

impl PoolLineCodec {
    fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
    }
}

impl Decoder for PoolLineCodec {
    type Item = String;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<String>, Self::Error> {
        loop {
            match self.0.decode(buf) {
                Err(e) if is_discardable(&e) => warn!("Discarding pool line: {}", e),
                other => return other,
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<String>, Self::Error> {
        loop {
            match self.0.decode_eof(buf) {
                Err(e) if is_discardable(&e) => warn!("Discarding pool line: {}", e),
                other => return other,
            }
        }
    }
}

/// Errors raised after `LinesCodec` has already dropped the offending line
fn is_discardable(error: &LinesCodecError) -> bool {
    matches!(error, LinesCodecError::MaxLineLengthExceeded)
        || matches!(error, LinesCodecError::Io(e) if e.kind() == io::ErrorKind::InvalidData)
}

/// Write every queued request. A write on a dead socket ends the session.
async fn flush(
    session: &mut Session,
    sink: &mut FramedWrite<OwnedWriteHalf, LinesCodec>,
) -> Result<()> {
    for request in session.drain_outbox() {
        let line = request.to_line()?;
        debug!("-> {}", line);
        sink.send(line).await.map_err(|e| match e {
            LinesCodecError::Io(e) => Error::Io(e),
            other => Error::stratum(other.to_string()),
        })?;
    }
    Ok(())
}

fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn client() -> (StratumPoolClient, mpsc::UnboundedReceiver<PoolEvent>) {
        StratumPoolClient::new(ClientConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_client_creation() {
        let (client, _events) = client();
        assert_eq!(client.state(), SessionState::Disconnected);
        assert!(client.current_job().is_none());
        assert_eq!(client.status(), ClientStatus::default());
    }

    #[tokio::test]
    async fn test_invalid_url_fails_before_io() {
        let (mut client, mut events) = client();

        let result = client.connect("localhost:3333", "wallet", "rig").await;

        assert_matches!(result, Err(Error::InvalidPoolUrl { .. }));
        assert_eq!(client.state(), SessionState::Disconnected);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (mut client, _events) = client();
        assert_eq!(client.disconnect().await, ClientStatus::default());
        assert_eq!(client.disconnect().await, ClientStatus::default());
        assert_eq!(client.status(), ClientStatus::default());
    }

    #[test]
    fn test_hash_rate_setter() {
        let (client, _events) = client();
        client.set_hash_rate(HashRate::new(5e12)).unwrap();
        assert_eq!(client.hash_rate().value(), 5e12);
        assert!(client.set_hash_rate(HashRate::new(0.0)).is_err());
        assert_eq!(client.hash_rate().value(), 5e12);
    }

    #[test]
    fn test_client_rejects_invalid_hash_rate() {
        let config = ClientConfig {
            hash_rate: HashRate::new(-1.0),
            ..ClientConfig::default()
        };
        assert!(StratumPoolClient::new(config).is_err());
    }

    #[test]
    fn test_status_flags() {
        let mut status = ClientStatus::default();
        assert!(!status.is_connected());

        status.state = SessionState::Subscribed;
        assert!(status.is_connected());
        assert!(status.is_subscribed());
        assert!(!status.is_authorized());

        status.state = SessionState::Mining;
        assert!(status.is_authorized());

        status.state = SessionState::GivenUp;
        assert!(!status.is_connected());
    }

    #[test]
    fn test_event_serialization() {
        let event = PoolEvent::ShareResult {
            job_id: "j1".to_string(),
            accepted: true,
            error: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "share_result");
        assert_eq!(value["data"]["accepted"], true);

        let value = serde_json::to_value(PoolEvent::DifficultyChanged(4.5)).unwrap();
        assert_eq!(value["data"], 4.5);
    }

    #[test]
    fn test_oversized_line_is_skipped() {
        let mut codec = PoolLineCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&vec![b'a'; MAX_LINE_LENGTH + 10]);
        buf.extend_from_slice(b"\n{\"id\":1}\n");

        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some(r#"{"id":1}"#));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_invalid_utf8_line_is_skipped() {
        let mut codec = PoolLineCodec::new();
        let mut buf = BytesMut::from(&b"\xff\xfe garbage\n{\"id\":2}\n"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some(r#"{"id":2}"#));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_invalid_utf8_tail_is_skipped_at_eof() {
        let mut codec = PoolLineCodec::new();
        let mut buf = BytesMut::from(&b"\xc3\x28\n"[..]);

        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }
}
