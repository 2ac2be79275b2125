//! Which storage failures are worth a redelivery.

use ahash::AHashSet;
use tf_core::error::{ErrorCode, StorageError};

/// Codes every consumer treats as transient.
pub const DEFAULT_RECOVERABLE: [ErrorCode; 3] = [
    ErrorCode::TimedOut,
    ErrorCode::ConnectionReset,
    ErrorCode::HostNotFound,
];

/// Allow-list of recoverable storage error codes. Anything not listed is
/// permanent and the chunk goes to the DLQ.
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    codes: AHashSet<ErrorCode>,
}

impl RecoveryPolicy {
    /// The default codes plus `extra`, given in their string form.
    pub fn new(extra: &[String]) -> Self {
        let mut codes: AHashSet<ErrorCode> = DEFAULT_RECOVERABLE.into_iter().collect();
        codes.extend(extra.iter().map(|c| ErrorCode::from_code(c.trim())));
        Self { codes }
    }

    pub fn is_recoverable(&self, err: &StorageError) -> bool {
        self.codes.contains(&err.code)
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::new(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(code: &str) -> StorageError {
        StorageError::new(ErrorCode::from_code(code), "boom")
    }

    #[test]
    fn network_codes_are_recoverable() {
        let policy = RecoveryPolicy::default();
        for code in ["ETIMEDOUT", "ECONNRESET", "ENOTFOUND"] {
            assert!(policy.is_recoverable(&err(code)), "{code}");
        }
    }

    #[test]
    fn everything_else_is_permanent() {
        let policy = RecoveryPolicy::default();
        assert!(!policy.is_recoverable(&err("23505")));
        assert!(!policy.is_recoverable(&err("POOL_EXHAUSTED")));
    }

    #[test]
    fn extra_codes_extend_the_list() {
        let policy = RecoveryPolicy::new(&["POOL_EXHAUSTED".to_string()]);
        assert!(policy.is_recoverable(&err("POOL_EXHAUSTED")));
        assert!(policy.is_recoverable(&err("ETIMEDOUT")));
        assert!(!policy.is_recoverable(&err("42P01")));
    }
}
