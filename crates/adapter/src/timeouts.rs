//! Per-request deadlines.
//!
//! Every forwarded request gets a deadline. Clients may ask for their own budget through
//! `params._meta.timeoutMs`; the gateway honours it up to `maxCallTimeout`.

use serde_json::Value;
use std::time::Duration;

/// Default per-request deadline (seconds) when neither config nor client provides one.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 60;

/// Default ceiling (seconds) for client-supplied budgets.
pub const DEFAULT_MAX_CALL_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimeouts {
    pub default: Duration,
    pub max: Duration,
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            max: Duration::from_secs(DEFAULT_MAX_CALL_TIMEOUT_SECS),
        }
    }
}

impl CallTimeouts {
    /// Effective deadline for one request.
    pub fn for_params(&self, params: Option<&Value>) -> Duration {
        timeout_budget_from_meta(params, self.max).unwrap_or(self.default.min(self.max))
    }
}

fn timeout_budget_from_meta(params: Option<&Value>, cap: Duration) -> Option<Duration> {
    let meta = params?.get("_meta").and_then(Value::as_object)?;
    let timeout_ms = meta.get("timeoutMs").and_then(Value::as_u64)?;
    if timeout_ms == 0 {
        return None;
    }
    Some(Duration::from_millis(timeout_ms).min(cap))
}
