//! Single-use confirmation tokens.
//!
//! Tokens gate confirm-listed tools: the engine mints one, hands it to the
//! client, and the next `execute` carrying it is allowed exactly once. The
//! clock is injectable so TTL behavior is testable without sleeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use rand::RngCore;

/// Default token lifetime.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(600);

/// Source of time for TTL decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// Wall-clock time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[derive(Debug, Clone)]
struct Record {
    upstream: String,
    tool: String,
    minted_at: SystemTime,
}

/// Process-wide store of live confirmation records.
pub struct ConfirmationStore {
    records: Mutex<HashMap<String, Record>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ConfirmationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationStore")
            .field("records", &self.records)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl ConfirmationStore {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    /// Mint a fresh single-use token for `(upstream, tool)`.
    pub fn mint(&self, upstream: &str, tool: &str) -> String {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);
        self.records.lock().insert(
            token.clone(),
            Record {
                upstream: upstream.to_string(),
                tool: tool.to_string(),
                minted_at: self.clock.now(),
            },
        );
        token
    }

    /// Validate and consume `token` for `(upstream, tool)`.
    ///
    /// Returns false for unknown, expired, or mismatched tokens; the record
    /// is erased on success and on expiry either way.
    pub fn validate(&self, token: &str, upstream: &str, tool: &str) -> bool {
        let mut records = self.records.lock();
        let Some(record) = records.get(token) else {
            return false;
        };
        if self.is_expired(record) {
            records.remove(token);
            return false;
        }
        let matches = record.upstream == upstream && record.tool == tool;
        if matches {
            records.remove(token);
        }
        matches
    }

    /// Drop every expired record. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut records = self.records.lock();
        let before = records.len();
        let now = self.clock.now();
        let ttl = self.ttl;
        records.retain(|_, r| {
            now.duration_since(r.minted_at)
                .map(|age| age < ttl)
                .unwrap_or(true)
        });
        before - records.len()
    }

    /// Erase all records. Returns the prior live count.
    pub fn clear(&self) -> usize {
        let mut records = self.records.lock();
        let n = records.len();
        records.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn is_expired(&self, record: &Record) -> bool {
        self.clock
            .now()
            .duration_since(record.minted_at)
            .map(|age| age >= self.ttl)
            .unwrap_or(false)
            // A zero TTL expires records the instant they are minted.
            || self.ttl.is_zero()
    }
}
