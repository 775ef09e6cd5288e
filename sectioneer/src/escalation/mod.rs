//! Fault escalation policy.
//!
//! Step failures inside a slice cycle are absorbed locally and routed
//! through one [`ErrorEscalationHandler`], which applies the behaviours
//! configured under `general.error_behaviour` in a fixed order regardless of
//! declaration order: `email` first (best effort, never escalates further),
//! then `stop` (cooperative flag), then `exception` (fatal, terminates the
//! run).
//!
//! Scheduler exhaustion is a separate, deliberately synchronous path: the
//! operator is notified by email and the run blocks on an
//! [`AcknowledgeGate`] until a human confirms, after which the autofunction
//! queue is cleared.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{EmailSettings, ErrorBehaviour, GeneralSettings};

/// Fatal outcome of escalation.
#[derive(Debug, Error)]
pub enum EscalationError {
    #[error("acquisition error escalated as fatal in {context}: {message}")]
    Fatal { context: &'static str, message: String },
}

/// Cooperative stop signal polled by the slice cycle between steps.
///
/// Triggering never interrupts an in-flight hardware operation; the loop
/// exits at the next checked boundary.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Outbound notification collaborator. SMTP transport lives outside the
/// engine; the built-in [`LogEmail`] only records the message.
pub trait EmailSender: Send {
    fn send(&self, sender: &str, receiver: &str, subject: &str, body: &str) -> Result<(), String>;
}

/// Email sink that writes notifications to the structured log.
#[derive(Debug, Default)]
pub struct LogEmail;

impl EmailSender for LogEmail {
    fn send(&self, sender: &str, receiver: &str, subject: &str, body: &str) -> Result<(), String> {
        info!(sender, receiver, subject, body, "email notification");
        Ok(())
    }
}

/// Blocking operator checkpoint used by scheduler exhaustion.
pub trait AcknowledgeGate: Send {
    /// Blocks until the operator acknowledges `message`.
    fn wait_for_acknowledgement(&self, message: &str);
}

/// Gate that acknowledges immediately; for tests and unattended runs.
#[derive(Debug, Default)]
pub struct AutoAcknowledge;

impl AcknowledgeGate for AutoAcknowledge {
    fn wait_for_acknowledgement(&self, message: &str) {
        warn!(message, "auto-acknowledging escalation");
    }
}

/// Applies the configured behaviour set to raised faults.
pub struct ErrorEscalationHandler {
    behaviours: std::collections::HashSet<ErrorBehaviour>,
    email_settings: EmailSettings,
    email: Box<dyn EmailSender>,
    gate: Box<dyn AcknowledgeGate>,
    stop: StopFlag,
}

impl ErrorEscalationHandler {
    pub fn new(
        general: &GeneralSettings,
        email_settings: EmailSettings,
        email: Box<dyn EmailSender>,
        gate: Box<dyn AcknowledgeGate>,
        stop: StopFlag,
    ) -> Self {
        Self {
            behaviours: general.error_behaviour.clone(),
            email_settings,
            email,
            gate,
            stop,
        }
    }

    /// Routes one step fault through the behaviour set.
    ///
    /// Returns `Err` only when the `exception` behaviour is configured.
    pub fn handle(&self, context: &'static str, fault: &dyn Display) -> Result<(), EscalationError> {
        error!(context, fault = %fault, "step fault");

        if self.behaviours.contains(&ErrorBehaviour::Email) {
            self.send_email("acquisition error", &format!("{context}: {fault}"));
        }
        if self.behaviours.contains(&ErrorBehaviour::Stop) {
            warn!(context, "stop flag set by escalation");
            self.stop.trigger();
        }
        if self.behaviours.contains(&ErrorBehaviour::Exception) {
            return Err(EscalationError::Fatal {
                context,
                message: fault.to_string(),
            });
        }
        Ok(())
    }

    /// Scheduler-exhaustion checkpoint: email the operator, then block until
    /// acknowledged. The caller clears its queue afterwards.
    pub fn notify_exhaustion(&self, autofunction: &str, attempts: u32) {
        let message = format!(
            "{attempts} attempts of autofunction '{autofunction}' failed; acquisition paused"
        );
        self.send_email("autofunction attempts exhausted", &message);
        self.gate.wait_for_acknowledgement(&message);
    }

    fn send_email(&self, subject: &str, body: &str) {
        let (sender, receiver) = match (&self.email_settings.sender, &self.email_settings.receiver)
        {
            (Some(s), Some(r)) => (s.as_str(), r.as_str()),
            _ => {
                warn!(subject, "email escalation configured without sender/receiver");
                return;
            }
        };
        if let Err(e) = self.email.send(sender, receiver, subject, body) {
            // send failures are logged, never escalated
            error!(subject, error = %e, "email sending failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// Records sent mail for assertions.
    #[derive(Default)]
    pub struct RecordingEmail {
        pub sent: Arc<Mutex<Vec<String>>>,
    }

    impl EmailSender for RecordingEmail {
        fn send(
            &self,
            _sender: &str,
            _receiver: &str,
            subject: &str,
            _body: &str,
        ) -> Result<(), String> {
            self.sent.lock().push(subject.to_string());
            Ok(())
        }
    }

    /// Counts acknowledgement requests.
    #[derive(Default)]
    pub struct CountingGate {
        pub count: Arc<Mutex<u32>>,
    }

    impl AcknowledgeGate for CountingGate {
        fn wait_for_acknowledgement(&self, _message: &str) {
            *self.count.lock() += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::geom::Point;
    use std::path::PathBuf;

    fn general(behaviours: &[ErrorBehaviour]) -> GeneralSettings {
        GeneralSettings {
            error_behaviour: behaviours.iter().cloned().collect(),
            additive_beam_shift: Point::default(),
            beam_settings_file: PathBuf::from("beam.yaml"),
        }
    }

    fn email_settings() -> EmailSettings {
        EmailSettings {
            sender: Some("rig@lab".into()),
            receiver: Some("operator@lab".into()),
        }
    }

    fn handler(
        behaviours: &[ErrorBehaviour],
        stop: StopFlag,
    ) -> (ErrorEscalationHandler, Arc<parking_lot::Mutex<Vec<String>>>) {
        let email = RecordingEmail::default();
        let sent = email.sent.clone();
        let h = ErrorEscalationHandler::new(
            &general(behaviours),
            email_settings(),
            Box::new(email),
            Box::new(AutoAcknowledge),
            stop,
        );
        (h, sent)
    }

    #[test]
    fn test_stop_behaviour_sets_flag() {
        let stop = StopFlag::new();
        let (h, _) = handler(&[ErrorBehaviour::Stop], stop.clone());
        assert!(h.handle("milling", &"stage fault").is_ok());
        assert!(stop.is_set());
    }

    #[test]
    fn test_exception_behaviour_is_fatal() {
        let (h, sent) = handler(
            &[ErrorBehaviour::Email, ErrorBehaviour::Exception],
            StopFlag::new(),
        );
        let err = h.handle("acquire", &"grab failed").unwrap_err();
        assert!(matches!(err, EscalationError::Fatal { context: "acquire", .. }));
        // email went out before the fatal return
        assert_eq!(sent.lock().len(), 1);
    }

    #[test]
    fn test_email_failure_never_escalates() {
        struct BrokenEmail;
        impl EmailSender for BrokenEmail {
            fn send(&self, _: &str, _: &str, _: &str, _: &str) -> Result<(), String> {
                Err("smtp down".into())
            }
        }
        let h = ErrorEscalationHandler::new(
            &general(&[ErrorBehaviour::Email]),
            email_settings(),
            Box::new(BrokenEmail),
            Box::new(AutoAcknowledge),
            StopFlag::new(),
        );
        assert!(h.handle("drift", &"oops").is_ok());
    }

    #[test]
    fn test_exhaustion_blocks_on_gate() {
        let email = RecordingEmail::default();
        let gate = CountingGate::default();
        let count = gate.count.clone();
        let h = ErrorEscalationHandler::new(
            &general(&[]),
            email_settings(),
            Box::new(email),
            Box::new(gate),
            StopFlag::new(),
        );
        h.notify_exhaustion("autofocus", 5);
        assert_eq!(*count.lock(), 1);
    }
}
