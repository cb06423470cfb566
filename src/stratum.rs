//! Stratum protocol message definitions
//!
//! Newline-delimited JSON-RPC as spoken by mining pools. Outbound requests are
//! always `{"id", "method", "params"}`; inbound lines are either responses
//! (`id` + `result`/`error`) or notifications (`method` + `params`).

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Largest extranonce2 size we are willing to fabricate, in bytes
pub const MAX_EXTRANONCE2_SIZE: usize = 32;

/// Password sent with `mining.authorize`; pools using wallet logins ignore it
pub const DEFAULT_PASSWORD: &str = "x";

/// Stratum protocol methods
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StratumMethod {
    /// Client subscribes to mining notifications
    Subscribe,
    /// Client authorizes with credentials
    Authorize,
    /// Client submits a share
    Submit,
    /// Server notifies client of new work
    Notify,
    /// Server changes the share difficulty
    SetDifficulty,
    /// Unknown method
    Unknown(String),
}

impl StratumMethod {
    /// Parse method from string
    pub fn parse_method(s: &str) -> Self {
        match s {
            "mining.subscribe" => Self::Subscribe,
            "mining.authorize" => Self::Authorize,
            "mining.submit" => Self::Submit,
            "mining.notify" => Self::Notify,
            "mining.set_difficulty" => Self::SetDifficulty,
            _ => Self::Unknown(s.to_string()),
        }
    }

    /// Convert to string representation
    pub fn as_str(&self) -> &str {
        match self {
            Self::Subscribe => "mining.subscribe",
            Self::Authorize => "mining.authorize",
            Self::Submit => "mining.submit",
            Self::Notify => "mining.notify",
            Self::SetDifficulty => "mining.set_difficulty",
            Self::Unknown(s) => s,
        }
    }
}

/// Stratum request message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumRequest {
    /// Request ID
    pub id: u64,
    /// Method name
    pub method: String,
    /// Method parameters
    pub params: Vec<Value>,
}

impl StratumRequest {
    /// Create a new request
    pub fn new(id: u64, method: StratumMethod, params: Vec<Value>) -> Self {
        Self {
            id,
            method: method.as_str().to_string(),
            params,
        }
    }

    /// `mining.subscribe` with our client identifier
    pub fn subscribe(id: u64, client_agent: &str) -> Self {
        Self::new(id, StratumMethod::Subscribe, vec![Value::from(client_agent)])
    }

    /// `mining.authorize` for `<identifier>.<worker>`
    pub fn authorize(id: u64, username: &str, password: &str) -> Self {
        Self::new(
            id,
            StratumMethod::Authorize,
            vec![Value::from(username), Value::from(password)],
        )
    }

    /// `mining.submit`
    pub fn submit(id: u64, share: &SubmitParams) -> Self {
        Self::new(
            id,
            StratumMethod::Submit,
            vec![
                Value::from(share.username.as_str()),
                Value::from(share.job_id.as_str()),
                Value::from(share.extranonce2.as_str()),
                Value::from(share.ntime.as_str()),
                Value::from(share.nonce.as_str()),
            ],
        )
    }

    /// Serialize to a single JSON line, without the trailing newline
    pub fn to_line(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::from)
    }
}

/// Parameters of a share submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitParams {
    pub username: String,
    pub job_id: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
}

/// Any inbound line from the pool
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StratumMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl StratumMessage {
    /// Parse one line of pool output
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim()).map_err(Error::from)
    }

    /// Numeric message id, if any
    pub fn id_u64(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }

    /// Get the method as enum
    pub fn method_enum(&self) -> Option<StratumMethod> {
        self.method.as_deref().map(StratumMethod::parse_method)
    }

    /// The `error` member when it carries something other than null
    pub fn error_payload(&self) -> Option<&Value> {
        self.error.as_ref().filter(|error| !error.is_null())
    }

    /// `true` only for a literal boolean `true` result
    pub fn result_is_true(&self) -> bool {
        matches!(self.result, Some(Value::Bool(true)))
    }
}

/// Session parameters handed out by the pool in the subscribe response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeResult {
    pub extranonce1: String,
    pub extranonce2_size: usize,
}

impl SubscribeResult {
    /// Read `[subscriptions, extranonce1, extranonce2_size]`
    pub fn from_result(result: &Value) -> Result<Self> {
        let items = result
            .as_array()
            .ok_or_else(|| Error::stratum("subscribe result is not an array"))?;
        if items.len() < 3 {
            return Err(Error::stratum(format!(
                "subscribe result has {} elements, expected 3",
                items.len()
            )));
        }

        let extranonce1 = items[1]
            .as_str()
            .ok_or_else(|| Error::stratum("extranonce1 is not a string"))?
            .to_string();
        let extranonce2_size = items[2]
            .as_u64()
            .ok_or_else(|| Error::stratum("extranonce2 size is not an integer"))?
            as usize;
        if extranonce2_size > MAX_EXTRANONCE2_SIZE {
            return Err(Error::stratum(format!(
                "extranonce2 size {} exceeds {}",
                extranonce2_size, MAX_EXTRANONCE2_SIZE
            )));
        }

        Ok(Self {
            extranonce1,
            extranonce2_size,
        })
    }
}

/// Positional parameters of `mining.notify`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNotification {
    pub job_id: String,
    pub prev_hash: String,
    pub coinbase1: String,
    pub coinbase2: String,
    pub merkle_branches: Vec<String>,
    pub version: String,
    pub bits: String,
    pub ntime: String,
    pub clean_jobs: bool,
    pub height: Option<u64>,
}

impl JobNotification {
    /// Parse `[job_id, prevhash, coinb1, coinb2, merkle_branch, version, nbits, ntime, clean_jobs, (height)]`
    pub fn from_params(params: &Value) -> Result<Self> {
        let items = params
            .as_array()
            .ok_or_else(|| Error::stratum("notify params are not an array"))?;
        if items.len() < 9 {
            return Err(Error::stratum(format!(
                "notify has {} params, expected at least 9",
                items.len()
            )));
        }

        let merkle_branches = items[4]
            .as_array()
            .ok_or_else(|| Error::stratum("merkle branches are not an array"))?
            .iter()
            .map(|branch| opaque_field(branch, "merkle branch"))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            job_id: opaque_field(&items[0], "job id")?,
            prev_hash: opaque_field(&items[1], "prevhash")?,
            coinbase1: opaque_field(&items[2], "coinbase1")?,
            coinbase2: opaque_field(&items[3], "coinbase2")?,
            merkle_branches,
            version: opaque_field(&items[5], "version")?,
            bits: opaque_field(&items[6], "nbits")?,
            ntime: opaque_field(&items[7], "ntime")?,
            clean_jobs: items[8].as_bool().unwrap_or(false),
            height: items.get(9).and_then(Value::as_u64),
        })
    }
}

/// Opaque string field; some pools send job ids as bare numbers
fn opaque_field(value: &Value, name: &str) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(Error::stratum(format!("{} has unexpected type: {}", name, other))),
    }
}

/// Difficulty from `mining.set_difficulty` params
pub fn parse_difficulty(params: &Value) -> Result<f64> {
    let difficulty = params
        .get(0)
        .and_then(Value::as_f64)
        .ok_or_else(|| Error::stratum("set_difficulty without a numeric difficulty"))?;
    if !difficulty.is_finite() || difficulty <= 0.0 {
        return Err(Error::stratum(format!("invalid difficulty {}", difficulty)));
    }
    Ok(difficulty)
}
