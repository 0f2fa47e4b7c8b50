//! Error classification shared by every control loop.
//!
//! Each reconciler error enum implements [`ReconcilerError`], which tells the runtime which
//! [`ErrorClass`] a failure belongs to. [`RequeuePolicy`] then turns the class into the
//! [`Action`] handed back to the work queue.

use std::{error::Error, time::Duration};

use kube::{
    core::DynamicObject,
    runtime::{controller::Action, reflector::ObjectRef},
};

/// How a failed reconcile is handled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// The object vanished. Nothing is left to do.
    NotFound,

    /// An optimistic concurrency collision. The reconcile is retried right away.
    Conflict,

    /// Store I/O failed or timed out. Retried after a short fixed delay.
    Transient,

    /// The user-provided input is unusable. Retried only if upstream data could plausibly change.
    Configuration { retry: bool },

    /// Identical input reproduces the failure.
    Fatal,
}

/// [`Error`] extensions that help report reconciliation errors
///
/// This should be implemented for reconciler error types.
pub trait ReconcilerError: Error {
    /// `PascalCase`d name for the error category, used as the event reason
    ///
    /// This can typically be implemented by delegating to [`strum::EnumDiscriminants`] and [`strum::IntoStaticStr`].
    fn category(&self) -> &'static str;

    fn class(&self) -> ErrorClass;

    /// A reference to a secondary object providing additional context, if any
    ///
    /// This should be [`Some`] if the error happens while evaluating some related object
    /// (for example: when writing a [`StatefulSet`] owned by the deployment).
    ///
    /// [`StatefulSet`]: `k8s_openapi::api::apps::v1::StatefulSet`
    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        None
    }
}

/// Delays used to requeue failed reconciles.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RequeuePolicy {
    pub conflict: Duration,
    pub transient: Duration,
    pub configuration: Duration,
    pub fatal: Duration,
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self {
            conflict: Duration::from_millis(100),
            transient: Duration::from_secs(5),
            configuration: Duration::from_secs(30),
            fatal: Duration::from_secs(5 * 60),
        }
    }
}

impl RequeuePolicy {
    pub fn action_for(&self, class: ErrorClass) -> Action {
        match class {
            ErrorClass::NotFound | ErrorClass::Configuration { retry: false } => {
                Action::await_change()
            }
            ErrorClass::Conflict => Action::requeue(self.conflict),
            ErrorClass::Transient => Action::requeue(self.transient),
            ErrorClass::Configuration { retry: true } => Action::requeue(self.configuration),
            ErrorClass::Fatal => Action::requeue(self.fatal),
        }
    }

    /// Whether failures of this class should be surfaced to the user on the owning object.
    pub fn is_reported(class: ErrorClass) -> bool {
        !matches!(class, ErrorClass::NotFound | ErrorClass::Conflict)
    }
}

/// Renders the error followed by every source in its chain, separated by `: `.
pub fn error_chain(error: &dyn Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(error) = source {
        message.push_str(": ");
        message.push_str(&error.to_string());
        source = error.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use snafu::Snafu;

    use super::*;

    #[derive(Debug, Snafu)]
    #[snafu(display("failed to apply ops file"))]
    struct Outer {
        source: Inner,
    }

    #[derive(Debug, Snafu)]
    #[snafu(display("path /instance_groups/name=web not found"))]
    struct Inner;

    #[rstest]
    #[case(ErrorClass::NotFound, Action::await_change())]
    #[case(ErrorClass::Configuration { retry: false }, Action::await_change())]
    #[case(ErrorClass::Conflict, Action::requeue(Duration::from_millis(100)))]
    #[case(ErrorClass::Transient, Action::requeue(Duration::from_secs(5)))]
    #[case(ErrorClass::Configuration { retry: true }, Action::requeue(Duration::from_secs(30)))]
    #[case(ErrorClass::Fatal, Action::requeue(Duration::from_secs(300)))]
    fn classes_map_to_actions(#[case] class: ErrorClass, #[case] expected: Action) {
        assert_eq!(RequeuePolicy::default().action_for(class), expected);
    }

    #[test]
    fn error_chain_walks_every_source() {
        let error = Outer { source: Inner };

        assert_eq!(
            error_chain(&error),
            "failed to apply ops file: path /instance_groups/name=web not found"
        );
    }
}
