use std::time::Duration;

use crate::error::DaemonError;

/// Run `op` until it succeeds, fails fatally, or `attempts` recoverable
/// failures have been seen. Exhaustion yields `Ok(None)`.
pub fn retry_recoverable<T>(
    what: &str,
    attempts: u32,
    delay: Duration,
    mut op: impl FnMut() -> Result<T, DaemonError>,
) -> Result<Option<T>, DaemonError> {
    for attempt in 1..=attempts {
        match op() {
            Ok(value) => return Ok(Some(value)),
            Err(err) if err.is_recoverable() => {
                tracing::warn!(attempt, attempts, error = %err, "{what} interrupted, retrying");
                if attempt < attempts {
                    std::thread::sleep(delay);
                }
            }
            Err(err) => return Err(err),
        }
    }
    tracing::warn!(attempts, "{what} kept failing, giving up until the next change");
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_sync::FileError;

    fn vanished() -> DaemonError {
        DaemonError::File(FileError::Vanished { path: "x".into() })
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let mut calls = 0;
        let out = retry_recoverable("diff", 5, Duration::ZERO, || {
            calls += 1;
            if calls < 3 {
                Err(vanished())
            } else {
                Ok(calls)
            }
        })
        .unwrap();
        assert_eq!(out, Some(3));
    }

    #[test]
    fn gives_up_quietly_when_exhausted() {
        let mut calls = 0;
        let out: Option<()> = retry_recoverable("diff", 4, Duration::ZERO, || {
            calls += 1;
            Err(vanished())
        })
        .unwrap();
        assert_eq!(out, None);
        assert_eq!(calls, 4);
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let mut calls = 0;
        let err = retry_recoverable::<()>("diff", 5, Duration::ZERO, || {
            calls += 1;
            Err(DaemonError::NoPeers)
        })
        .unwrap_err();
        assert!(matches!(err, DaemonError::NoPeers));
        assert_eq!(calls, 1);
    }
}
