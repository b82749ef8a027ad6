use std::fmt::Display;

use serde::Serialize;

/// Outcome of a best-effort sequence of steps. Steps that fail are recorded
/// and the sequence carries on.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct StepReport {
    failures: Vec<StepFailure>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StepFailure {
    pub step: String,
    pub error: String,
}

impl StepReport {
    pub fn record(&mut self, step: impl Into<String>, error: impl Display) {
        let step = step.into();
        let error = format!("{error:#}");
        tracing::warn!(%step, %error, "Step failed, continuing");
        self.failures.push(StepFailure { step, error });
    }

    /// Record the error of `result`, if any, and hand back the success value.
    pub fn check<T, E: Display>(&mut self, step: impl Into<String>, result: Result<T, E>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.record(step, e);
                None
            }
        }
    }

    pub fn merge(&mut self, other: StepReport) {
        self.failures.extend(other.failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[StepFailure] {
        &self.failures
    }

    pub fn has_failed(&self, step: &str) -> bool {
        self.failures.iter().any(|f| f.step == step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_merge() {
        let mut report = StepReport::default();
        assert!(report.is_clean());

        assert_eq!(report.check("first", Ok::<_, String>(1)), Some(1));
        assert_eq!(report.check("second", Err::<u8, _>("boom")), None);

        let mut other = StepReport::default();
        other.record("third", anyhow::anyhow!("outer").context("ctx"));
        report.merge(other);

        assert!(!report.is_clean());
        assert!(report.has_failed("second"));
        assert!(report.has_failed("third"));
        assert!(!report.has_failed("first"));
        assert_eq!(report.failures()[1].error, "ctx: outer");
    }
}
