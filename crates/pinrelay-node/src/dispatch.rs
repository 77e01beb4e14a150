//! Node-local dispatch path: apply a pin command and report the outcome.
//!
//! Polled commands and scheduled commands both go through
//! [`LocalDispatch::apply`], so they are applied and reported the same way.
//! Reports queue on an unbounded channel that the client drains onto the
//! dispatcher connection between polls.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use pinrelay_core::{Actuator, PinCommand, TextMessage};

/// Reports waiting to be sent to the dispatcher.
pub type ReportSender = mpsc::UnboundedSender<TextMessage>;
pub type ReportReceiver = mpsc::UnboundedReceiver<TextMessage>;

pub fn report_channel() -> (ReportSender, ReportReceiver) {
    mpsc::unbounded_channel()
}

/// Text reported after applying `pin`.
pub fn action_report(pin: &str, applied: bool) -> String {
    if applied {
        format!("Action {pin} successful")
    } else {
        format!("Action {pin} not successful")
    }
}

#[derive(Clone)]
pub struct LocalDispatch {
    actuator: Arc<dyn Actuator>,
    reports: ReportSender,
}

impl LocalDispatch {
    pub fn new(actuator: Arc<dyn Actuator>, reports: ReportSender) -> Self {
        Self { actuator, reports }
    }

    /// Applies `command` and, when it carries an origin, reports the outcome to it.
    pub fn apply(&self, command: &PinCommand) -> bool {
        let applied = self.actuator.apply_command(command);
        info!(
            pin = %command.pin,
            state = command.state,
            applied,
            "Applied pin command"
        );

        if command.has_origin() {
            self.report(TextMessage::new(
                command.origin_id,
                action_report(&command.pin, applied),
            ));
        }
        applied
    }

    /// Queues a message for the dispatcher.
    pub fn report(&self, message: TextMessage) {
        if self.reports.send(message).is_err() {
            debug!("Report channel closed, dropping message");
        }
    }

    /// Drives every pin in `pins` low.
    pub fn clear(&self, pins: &[String]) {
        for pin in pins {
            self.actuator.apply(pin, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinrelay_core::{PinRegistry, SimulatedActuator};

    fn dispatch() -> (LocalDispatch, Arc<PinRegistry>, ReportReceiver) {
        let pins = Arc::new(PinRegistry::new(["light", "fan"]));
        let (tx, rx) = report_channel();
        let actuator = Arc::new(SimulatedActuator::new(Arc::clone(&pins)));
        (LocalDispatch::new(actuator, tx), pins, rx)
    }

    #[test]
    fn test_apply_reports_to_origin() {
        let (dispatch, pins, mut reports) = dispatch();

        assert!(dispatch.apply(&PinCommand::new("light", true).with_origin(42)));
        assert_eq!(pins.get("light"), Some(true));

        let report = reports.try_recv().unwrap();
        assert_eq!(report.chat_id, 42);
        assert_eq!(report.text, "Action light successful");
    }

    #[test]
    fn test_apply_without_origin_is_silent() {
        let (dispatch, _pins, mut reports) = dispatch();
        assert!(dispatch.apply(&PinCommand::new("fan", true)));
        assert!(reports.try_recv().is_err());
    }

    #[test]
    fn test_failed_apply_reported() {
        let (dispatch, _pins, mut reports) = dispatch();
        assert!(!dispatch.apply(&PinCommand::new("garage", true).with_origin(7)));
        assert_eq!(
            reports.try_recv().unwrap().text,
            "Action garage not successful"
        );
    }

    #[test]
    fn test_clear_drives_pins_low() {
        let (dispatch, pins, _reports) = dispatch();
        dispatch.apply(&PinCommand::new("light", true));
        dispatch.apply(&PinCommand::new("fan", true));

        dispatch.clear(&["light".to_string(), "fan".to_string()]);
        assert_eq!(pins.get("light"), Some(false));
        assert_eq!(pins.get("fan"), Some(false));
    }
}
