//! Applies the configured strictness to recoverable format violations

use crate::config::Strictness;
use crate::progress::{MessageLog, ProgressListener, Severity};
use crate::{FormatViolation, HeapError, HeapResult};

/// Routes violations and user messages for one build
pub struct Policy<'a> {
    strictness: Strictness,
    listener: &'a dyn ProgressListener,
    log: &'a MessageLog,
}

impl<'a> Policy<'a> {
    pub fn new(strictness: Strictness, listener: &'a dyn ProgressListener, log: &'a MessageLog) -> Self {
        Self {
            strictness,
            listener,
            log,
        }
    }

    pub fn strictness(&self) -> Strictness {
        self.strictness
    }

    /// `Err(Stopped)` under STOP, otherwise a warning and `Ok`
    pub fn violation(&self, violation: FormatViolation) -> HeapResult<()> {
        match self.strictness {
            Strictness::Stop => Err(HeapError::Stopped { source: violation }),
            Strictness::Warn | Strictness::Permissive => {
                self.warn(violation.to_string());
                Ok(())
            }
        }
    }

    pub fn info(&self, text: String) {
        self.log.send(self.listener, Severity::Info, text);
    }

    pub fn warn(&self, text: String) {
        self.log.send(self.listener, Severity::Warning, text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NullListener;

    fn overrun() -> FormatViolation {
        FormatViolation::RecordOverrun {
            offset: 10,
            length: 100,
            available: 5,
        }
    }

    #[test]
    fn test_stop_fails() {
        let log = MessageLog::new();
        let policy = Policy::new(Strictness::Stop, &NullListener, &log);
        let err = policy.violation(overrun()).unwrap_err();
        assert!(matches!(err, HeapError::Stopped { .. }));
        assert_eq!(log.warning_count(), 0);
    }

    #[test]
    fn test_warn_and_permissive_continue() {
        for strictness in [Strictness::Warn, Strictness::Permissive] {
            let log = MessageLog::new();
            let policy = Policy::new(strictness, &NullListener, &log);
            policy.violation(overrun()).unwrap();
            assert_eq!(log.warning_count(), 1);
        }
    }
}
