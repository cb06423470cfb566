//! Pool session state machine
//!
//! One `Session` lives for exactly one TCP connection. It consumes inbound
//! lines, queues outbound requests and reports what happened as `PoolEvent`s.
//! It performs no I/O and owns no timers, so the connection task in
//! [`crate::client`] is the only place where sockets and clocks appear.
//!
//! Responses are matched to requests through a pending map keyed by message
//! id, so the meaning of a response never depends on the magnitude of its id.

use crate::stratum::{
    parse_difficulty, JobNotification, StratumMessage, StratumMethod, StratumRequest,
    SubmitParams, SubscribeResult, DEFAULT_PASSWORD,
};
use crate::worker::{share_span, ShareWorker};
use crate::{Credentials, Error, Job, PoolEvent, Result, SessionState};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

/// Id of the `mining.subscribe` request on every connection
pub const SUBSCRIBE_ID: u64 = 1;
/// Id of the `mining.authorize` request on every connection
pub const AUTHORIZE_ID: u64 = 2;

/// Purpose of an in-flight request
#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingRequest {
    Subscribe,
    Authorize,
    Submit { job_id: String },
}

/// Protocol state for a single pool connection
#[derive(Debug)]
pub struct Session {
    credentials: Credentials,
    client_agent: String,
    state: SessionState,
    subscription: Option<SubscribeResult>,
    job: Option<Job>,
    difficulty: f64,
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
    outbox: VecDeque<StratumRequest>,
}

impl Session {
    /// A session for a freshly opened socket, still `Connecting`
    pub fn new(credentials: Credentials, client_agent: impl Into<String>) -> Self {
        Self {
            credentials,
            client_agent: client_agent.into(),
            state: SessionState::Connecting,
            subscription: None,
            job: None,
            difficulty: 1.0,
            next_id: SUBSCRIBE_ID,
            pending: HashMap::new(),
            outbox: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn job(&self) -> Option<&Job> {
        self.job.as_ref()
    }

    pub fn subscription(&self) -> Option<&SubscribeResult> {
        self.subscription.as_ref()
    }

    /// Difficulty that the next share will be submitted at
    pub fn difficulty(&self) -> f64 {
        self.job
            .as_ref()
            .map_or(self.difficulty, |job| job.difficulty)
    }

    /// Whether the share timer should be running
    pub fn is_mining(&self) -> bool {
        self.state == SessionState::Mining && self.job.is_some()
    }

    /// Queue the opening `mining.subscribe`
    pub fn start(&mut self) {
        if self.pending.values().any(|p| *p == PendingRequest::Subscribe) || self.subscription.is_some() {
            return;
        }
        let id = self.allocate_id();
        self.pending.insert(id, PendingRequest::Subscribe);
        self.outbox
            .push_back(StratumRequest::subscribe(id, &self.client_agent));
    }

    /// Take every request waiting to be written
    pub fn drain_outbox(&mut self) -> Vec<StratumRequest> {
        self.outbox.drain(..).collect()
    }

    /// Handle one complete inbound line.
    ///
    /// Malformed or unrecognized input is logged and produces no events.
    pub fn handle_line(&mut self, line: &str) -> Vec<PoolEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }

        match StratumMessage::parse(line) {
            Ok(message) => self.handle_message(message),
            Err(e) => {
                warn!("Discarding malformed line from pool: {} ({:?})", e, truncate(line));
                Vec::new()
            }
        }
    }

    /// Dispatch a parsed message
    pub fn handle_message(&mut self, message: StratumMessage) -> Vec<PoolEvent> {
        if let Some(method) = message.method_enum() {
            return match method {
                StratumMethod::Notify => self.on_notify(&message.params),
                StratumMethod::SetDifficulty => self.on_set_difficulty(&message.params),
                other => {
                    debug!("Ignoring unsupported pool method {}", other.as_str());
                    Vec::new()
                }
            };
        }

        // Consumed even when the response is malformed; a repeated reply is an unknown id
        let pending = message.id_u64().and_then(|id| self.pending.remove(&id));
        match pending {
            Some(PendingRequest::Subscribe) => self.on_subscribe_response(&message),
            Some(PendingRequest::Authorize) => self.on_authorize_response(&message),
            Some(PendingRequest::Submit { job_id }) => self.on_submit_response(job_id, &message),
            None => {
                debug!("Ignoring response with unknown id {:?}", message.id);
                Vec::new()
            }
        }
    }

    /// Build the next share submission against the current job.
    ///
    /// Only valid while `Mining`; the caller stops its timer on error.
    pub fn submit_share(&mut self, worker: &mut dyn ShareWorker) -> Result<PoolEvent> {
        if self.state != SessionState::Mining {
            return Err(Error::invalid_state(format!(
                "cannot submit a share while {}",
                self.state
            )));
        }
        let (job_id, ntime, difficulty, extranonce2_size) = match &self.job {
            Some(job) => (
                job.id.clone(),
                job.ntime.clone(),
                job.difficulty,
                job.extranonce2_size,
            ),
            None => return Err(Error::invalid_state("no current job")),
        };

        let _span = share_span(worker.worker_type(), &job_id).entered();
        let candidate = worker.fabricate(extranonce2_size);

        let id = self.allocate_id();
        self.pending.insert(
            id,
            PendingRequest::Submit {
                job_id: job_id.clone(),
            },
        );
        self.outbox.push_back(StratumRequest::submit(
            id,
            &SubmitParams {
                username: self.credentials.username(),
                job_id: job_id.clone(),
                extranonce2: candidate.extranonce2.clone(),
                ntime,
                nonce: candidate.nonce.clone(),
            },
        ));
        debug!(
            "Submitting share id={} nonce={} extranonce2={} difficulty={}",
            id, candidate.nonce, candidate.extranonce2, difficulty
        );

        Ok(PoolEvent::ShareSubmitted {
            job_id,
            nonce: candidate.nonce,
            extranonce2: candidate.extranonce2,
            difficulty,
        })
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn on_subscribe_response(&mut self, message: &StratumMessage) -> Vec<PoolEvent> {
        if let Some(error) = message.error_payload() {
            warn!("Pool rejected subscription: {}", error);
            return Vec::new();
        }
        let Some(result) = message.result.as_ref().filter(|result| is_truthy(result)) else {
            warn!("Pool returned an empty subscribe result");
            return Vec::new();
        };

        let subscription = match SubscribeResult::from_result(result) {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!("Malformed subscribe response, staying unsubscribed: {}", e);
                return Vec::new();
            }
        };

        info!(
            "Subscribed: extranonce1={} extranonce2_size={}",
            subscription.extranonce1, subscription.extranonce2_size
        );
        self.state = SessionState::Subscribed;
        self.subscription = Some(subscription.clone());

        let id = self.allocate_id();
        self.pending.insert(id, PendingRequest::Authorize);
        self.outbox.push_back(StratumRequest::authorize(
            id,
            &self.credentials.username(),
            DEFAULT_PASSWORD,
        ));

        vec![PoolEvent::Subscribed {
            extranonce1: subscription.extranonce1,
            extranonce2_size: subscription.extranonce2_size,
        }]
    }

    fn on_authorize_response(&mut self, message: &StratumMessage) -> Vec<PoolEvent> {
        if message.result_is_true() && message.error_payload().is_none() {
            info!("Authorized as {}", self.credentials.username());
            self.state = SessionState::Authorized;
            return vec![PoolEvent::Authorized];
        }

        let error = message
            .error_payload()
            .cloned()
            .or_else(|| message.result.clone());
        warn!(
            "Authorization failed for {}: {}",
            self.credentials.username(),
            error.as_ref().map_or_else(|| "no reason given".to_string(), serde_json::Value::to_string)
        );
        vec![PoolEvent::AuthorizationFailed { error }]
    }

    fn on_submit_response(&mut self, job_id: String, message: &StratumMessage) -> Vec<PoolEvent> {
        let accepted = message.result_is_true();
        let error = message.error_payload().cloned();

        if accepted {
            debug!("Share for job {} accepted", job_id);
        } else {
            warn!(
                "Share for job {} rejected: {}",
                job_id,
                error.as_ref().map_or_else(|| "no reason given".to_string(), serde_json::Value::to_string)
            );
        }

        vec![PoolEvent::ShareResult {
            job_id,
            accepted,
            error,
        }]
    }

    fn on_notify(&mut self, params: &Value) -> Vec<PoolEvent> {
        let notification = match JobNotification::from_params(params) {
            Ok(notification) => notification,
            Err(e) => {
                warn!("Ignoring malformed job notification: {}", e);
                return Vec::new();
            }
        };

        let (extranonce1, extranonce2_size) = self
            .subscription
            .as_ref()
            .map(|s| (s.extranonce1.clone(), s.extranonce2_size))
            .unwrap_or_default();

        let job = Job {
            id: notification.job_id,
            extranonce1,
            extranonce2_size,
            prev_hash: notification.prev_hash,
            coinbase1: notification.coinbase1,
            coinbase2: notification.coinbase2,
            merkle_branches: notification.merkle_branches,
            version: notification.version,
            bits: notification.bits,
            ntime: notification.ntime,
            clean_jobs: notification.clean_jobs,
            difficulty: self.difficulty,
            height: notification.height,
        };
        debug!("New job {} (clean_jobs={})", job.id, job.clean_jobs);

        self.job = Some(job.clone());
        if self.state == SessionState::Authorized {
            info!("Mining job {} at difficulty {}", job.id, job.difficulty);
            self.state = SessionState::Mining;
        }

        vec![PoolEvent::NewJob(job)]
    }

    fn on_set_difficulty(&mut self, params: &Value) -> Vec<PoolEvent> {
        let difficulty = match parse_difficulty(params) {
            Ok(difficulty) => difficulty,
            Err(e) => {
                warn!("Ignoring difficulty update: {}", e);
                return Vec::new();
            }
        };

        debug!("Pool difficulty set to {}", difficulty);
        self.difficulty = difficulty;
        if let Some(job) = self.job.as_mut() {
            job.difficulty = difficulty;
        }

        vec![PoolEvent::DifficultyChanged(difficulty)]
    }
}

/// JavaScript-style truthiness of a JSON result
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn truncate(line: &str) -> &str {
    const MAX: usize = 120;
    match line.char_indices().nth(MAX) {
        Some((index, _)) => &line[..index],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::ShareCandidate;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::time::Duration;

    /// Deterministic worker counting bytes up from zero
    struct CountingWorker(u8);

    impl ShareWorker for CountingWorker {
        fn worker_type(&self) -> &'static str {
            "counting"
        }

        fn share_delay(&self, _difficulty: f64) -> Duration {
            Duration::from_millis(1)
        }

        fn fabricate(&mut self, extranonce2_size: usize) -> ShareCandidate {
            self.0 = self.0.wrapping_add(1);
            ShareCandidate {
                nonce: hex::encode([self.0; 4]),
                extranonce2: hex::encode(vec![self.0; extranonce2_size]),
            }
        }
    }

    fn session() -> Session {
        Session::new(Credentials::new("wallet", "rig01"), "test-agent/1.0")
    }

    fn line(value: Value) -> String {
        value.to_string()
    }

    fn notify(job_id: &str) -> String {
        line(json!({
            "id": null,
            "method": "mining.notify",
            "params": [job_id, "prev", "cb1", "cb2", ["b1"], "20000000", "1d00ffff", "5f5e1000", true]
        }))
    }

    fn subscribed() -> Session {
        let mut session = session();
        session.start();
        session.handle_line(&line(json!({"id": 1, "result": ["x", "abc123", 4], "error": null})));
        session.drain_outbox();
        session
    }

    fn mining() -> Session {
        let mut session = subscribed();
        session.handle_line(&line(json!({"id": 2, "result": true, "error": null})));
        session.handle_line(&notify("j1"));
        session
    }

    #[test]
    fn test_start_queues_subscribe_once() {
        let mut session = session();
        assert_eq!(session.state(), SessionState::Connecting);

        session.start();
        session.start();
        let outbox = session.drain_outbox();

        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].id, SUBSCRIBE_ID);
        assert_eq!(outbox[0].method, "mining.subscribe");
        assert_eq!(outbox[0].params, vec![json!("test-agent/1.0")]);
    }

    #[test]
    fn test_subscribe_response_sends_authorize() {
        let mut session = session();
        session.start();
        session.drain_outbox();

        let events =
            session.handle_line(&line(json!({"id": 1, "result": ["x", "abc123", 4], "error": null})));

        assert_eq!(
            events,
            vec![PoolEvent::Subscribed {
                extranonce1: "abc123".to_string(),
                extranonce2_size: 4
            }]
        );
        assert_eq!(session.state(), SessionState::Subscribed);
        let subscription = session.subscription().unwrap();
        assert_eq!(subscription.extranonce1, "abc123");
        assert_eq!(subscription.extranonce2_size, 4);

        let outbox = session.drain_outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].id, AUTHORIZE_ID);
        assert_eq!(outbox[0].method, "mining.authorize");
        assert_eq!(outbox[0].params, vec![json!("wallet.rig01"), json!("x")]);
    }

    #[test]
    fn test_subscribe_applies_only_once() {
        let mut session = subscribed();

        let events =
            session.handle_line(&line(json!({"id": 1, "result": ["y", "ffff", 8], "error": null})));

        assert!(events.is_empty());
        assert_eq!(session.subscription().unwrap().extranonce1, "abc123");
        assert_eq!(session.subscription().unwrap().extranonce2_size, 4);
        assert!(session.drain_outbox().is_empty());
    }

    #[test]
    fn test_malformed_subscribe_leaves_session_stuck() {
        for result in [json!(true), json!(["x", "abc123"]), json!({"extranonce1": "abc"})] {
            let mut session = session();
            session.start();
            session.drain_outbox();

            let events = session.handle_line(&line(json!({"id": 1, "result": result, "error": null})));

            assert!(events.is_empty());
            assert_eq!(session.state(), SessionState::Connecting);
            assert!(session.subscription().is_none());
            assert!(session.drain_outbox().is_empty());
        }
    }

    #[test]
    fn test_corrected_subscribe_reply_is_ignored() {
        let mut session = session();
        session.start();
        session.drain_outbox();

        session.handle_line(&line(json!({"id": 1, "result": ["x", "abc123"], "error": null})));
        let events =
            session.handle_line(&line(json!({"id": 1, "result": ["x", "abc123", 4], "error": null})));

        assert!(events.is_empty());
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.subscription().is_none());
        assert!(session.drain_outbox().is_empty());
    }

    #[test]
    fn test_authorize_success() {
        let mut session = subscribed();

        let events = session.handle_line(&line(json!({"id": 2, "result": true, "error": null})));

        assert_eq!(events, vec![PoolEvent::Authorized]);
        assert_eq!(session.state(), SessionState::Authorized);

        // A second `true` for the same id is not a new authorization
        let events = session.handle_line(&line(json!({"id": 2, "result": true, "error": null})));
        assert!(events.is_empty());
    }

    #[test]
    fn test_authorize_failure_is_not_retried() {
        let mut session = subscribed();

        let events = session.handle_line(&line(
            json!({"id": 2, "result": null, "error": [24, "Unauthorized worker", null]}),
        ));

        assert_matches!(
            events.as_slice(),
            [PoolEvent::AuthorizationFailed { error: Some(error) }] if error[1] == "Unauthorized worker"
        );
        assert_eq!(session.state(), SessionState::Subscribed);
        assert!(session.drain_outbox().is_empty());
    }

    #[test]
    fn test_authorize_false_result_fails() {
        let mut session = subscribed();
        let events = session.handle_line(&line(json!({"id": 2, "result": false, "error": null})));
        assert_eq!(
            events,
            vec![PoolEvent::AuthorizationFailed {
                error: Some(json!(false))
            }]
        );
    }

    #[test]
    fn test_notify_before_authorization_does_not_mine() {
        let mut session = subscribed();

        let events = session.handle_line(&notify("j0"));

        assert_matches!(events.as_slice(), [PoolEvent::NewJob(job)] if job.id == "j0");
        assert_eq!(session.state(), SessionState::Subscribed);
        assert!(!session.is_mining());
    }

    #[test]
    fn test_notify_while_authorized_starts_mining() {
        let session = mining();

        assert_eq!(session.state(), SessionState::Mining);
        assert!(session.is_mining());

        let job = session.job().unwrap();
        assert_eq!(job.id, "j1");
        assert_eq!(job.extranonce1, "abc123");
        assert_eq!(job.extranonce2_size, 4);
        assert_eq!(job.prev_hash, "prev");
        assert_eq!(job.coinbase1, "cb1");
        assert_eq!(job.coinbase2, "cb2");
        assert_eq!(job.merkle_branches, vec!["b1"]);
        assert_eq!(job.version, "20000000");
        assert_eq!(job.bits, "1d00ffff");
        assert_eq!(job.ntime, "5f5e1000");
        assert!(job.clean_jobs);
        assert_eq!(job.difficulty, 1.0);
    }

    #[test]
    fn test_notify_replaces_job_without_merge() {
        let mut session = mining();

        session.handle_line(&line(json!({
            "id": null,
            "method": "mining.notify",
            "params": ["j2", "prev2", "c1", "c2", [], "20000004", "17034219", "66000000", false]
        })));

        let job = session.job().unwrap();
        assert_eq!(job.id, "j2");
        assert_eq!(job.prev_hash, "prev2");
        assert_eq!(job.coinbase1, "c1");
        assert!(job.merkle_branches.is_empty());
        assert_eq!(job.version, "20000004");
        assert!(!job.clean_jobs);
    }

    #[test]
    fn test_set_difficulty_touches_only_difficulty() {
        let mut session = mining();
        let before = session.job().unwrap().clone();

        let events = session.handle_line(&line(
            json!({"id": null, "method": "mining.set_difficulty", "params": [4.5]}),
        ));

        assert_eq!(events, vec![PoolEvent::DifficultyChanged(4.5)]);
        let after = session.job().unwrap();
        assert_eq!(after.difficulty, 4.5);
        assert_eq!(Job { difficulty: 4.5, ..before }, *after);
    }

    #[test]
    fn test_difficulty_carries_over_to_next_job() {
        let mut session = subscribed();
        session.handle_line(&line(
            json!({"id": null, "method": "mining.set_difficulty", "params": [16]}),
        ));
        assert_eq!(session.difficulty(), 16.0);

        session.handle_line(&notify("j1"));
        assert_eq!(session.job().unwrap().difficulty, 16.0);
    }

    #[test]
    fn test_submit_share() {
        let mut session = mining();
        let mut worker = CountingWorker(0);

        let event = session.submit_share(&mut worker).unwrap();

        assert_eq!(
            event,
            PoolEvent::ShareSubmitted {
                job_id: "j1".to_string(),
                nonce: "01010101".to_string(),
                extranonce2: "01010101".to_string(),
                difficulty: 1.0,
            }
        );
        let outbox = session.drain_outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].id, 3);
        assert_eq!(
            outbox[0].params,
            vec![
                json!("wallet.rig01"),
                json!("j1"),
                json!("01010101"),
                json!("5f5e1000"),
                json!("01010101")
            ]
        );
    }

    #[test]
    fn test_submit_uses_latest_job() {
        let mut session = mining();
        let mut worker = CountingWorker(0);

        session.handle_line(&notify("j2"));
        session.handle_line(&line(
            json!({"id": null, "method": "mining.set_difficulty", "params": [2]}),
        ));

        assert_matches!(
            session.submit_share(&mut worker).unwrap(),
            PoolEvent::ShareSubmitted { job_id, difficulty, .. } if job_id == "j2" && difficulty == 2.0
        );
    }

    #[test]
    fn test_submit_rejected_outside_mining() {
        let mut worker = CountingWorker(0);

        let mut fresh = session();
        assert_matches!(fresh.submit_share(&mut worker), Err(Error::InvalidState { .. }));

        let mut authorized = subscribed();
        authorized.handle_line(&line(json!({"id": 2, "result": true, "error": null})));
        assert_matches!(authorized.submit_share(&mut worker), Err(Error::InvalidState { .. }));
        assert!(authorized.drain_outbox().is_empty());
    }

    #[test]
    fn test_share_verdicts() {
        let mut session = mining();
        let mut worker = CountingWorker(0);
        session.submit_share(&mut worker).unwrap();
        session.submit_share(&mut worker).unwrap();

        let accepted = session.handle_line(&line(json!({"id": 3, "result": true, "error": null})));
        assert_eq!(
            accepted,
            vec![PoolEvent::ShareResult {
                job_id: "j1".to_string(),
                accepted: true,
                error: None
            }]
        );

        let rejected = session.handle_line(&line(
            json!({"id": 4, "result": false, "error": [23, "Low difficulty share", null]}),
        ));
        assert_matches!(
            rejected.as_slice(),
            [PoolEvent::ShareResult { accepted: false, error: Some(_), .. }]
        );

        // Rejection does not stop mining
        assert!(session.is_mining());
    }

    #[test]
    fn test_unrecognized_messages_are_ignored() {
        let mut session = mining();
        for message in [
            json!({"id": 99, "result": true, "error": null}),
            json!({"id": null, "method": "client.show_message", "params": ["hello"]}),
            json!({"id": null, "method": "mining.notify", "params": ["short"]}),
            json!({"id": null, "method": "mining.set_difficulty", "params": ["x"]}),
            json!({}),
        ] {
            assert!(session.handle_line(&line(message)).is_empty());
        }
        assert_eq!(session.job().unwrap().id, "j1");
        assert_eq!(session.state(), SessionState::Mining);
    }

    #[test]
    fn test_malformed_json_is_discarded() {
        let mut session = session();
        session.start();

        assert!(session.handle_line("not-json").is_empty());
        assert!(session.handle_line("").is_empty());
        let events =
            session.handle_line(&line(json!({"id": 1, "result": ["x", "abc123", 4], "error": null})));
        assert_eq!(events.len(), 1);
        assert_eq!(session.state(), SessionState::Subscribed);
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!("a")));
        assert!(is_truthy(&json!(1)));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short"), "short");
        assert_eq!(truncate(&"é".repeat(200)).chars().count(), 120);
    }
}
