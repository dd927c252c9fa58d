//! Outbound message serials and ACK/NACK correlation
//!
//! Data-bearing envelopes get the next `msgSerial` of the current connection
//! epoch and stay pending until an `Ack` or `Nack` covering their serial
//! arrives. Everything else passes through unnumbered.

use crate::core::connection_state::ConnectionState;
use crate::protocol::{codes, Action, ErrorInfo, ProtocolMessage};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, warn};

/// Completion callback for a sent envelope
pub type AckCallback = Box<dyn FnOnce(Result<(), ErrorInfo>) + Send>;

/// A sent envelope waiting for its acknowledgement
pub struct PendingAck {
    pub serial: i64,
    pub message: ProtocolMessage,
    pub callback: Option<AckCallback>,
}

impl PendingAck {
    fn resolve(self, result: Result<(), ErrorInfo>) {
        if let Some(callback) = self.callback {
            callback(result);
        }
    }
}

impl fmt::Debug for PendingAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingAck")
            .field("serial", &self.serial)
            .field("action", &self.message.action)
            .field("channel", &self.message.channel)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct AckProcessor {
    next_serial: i64,
    pending: VecDeque<PendingAck>,
}

impl AckProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number the envelope if it needs an acknowledgement
    ///
    /// Returns the callback back to the caller when the envelope is not
    /// tracked, so the caller can complete it once the send went out.
    pub fn queue_if_necessary(
        &mut self,
        message: &mut ProtocolMessage,
        callback: Option<AckCallback>,
    ) -> Option<AckCallback> {
        if !message.action.is_data_bearing() {
            return callback;
        }

        let serial = self.next_serial;
        self.next_serial += 1;
        message.msg_serial = Some(serial);
        self.pending.push_back(PendingAck {
            serial,
            message: message.clone(),
            callback,
        });
        None
    }

    /// Resolve callbacks for an inbound `Ack`/`Nack`; returns false for any
    /// other action
    pub fn on_message_received(&mut self, message: &ProtocolMessage) -> bool {
        let result = match message.action {
            Action::Ack => Ok(()),
            Action::Nack => Err(message.error.clone().unwrap_or_else(|| {
                ErrorInfo::new(codes::NACK_RECEIVED, 500, "Message rejected by server")
            })),
            _ => return false,
        };

        let Some(start) = message.msg_serial else {
            warn!("{} without msgSerial ignored", message.action);
            return true;
        };
        let count = i64::from(message.count.unwrap_or(1));
        let range = start..start.saturating_add(count);

        let mut resolved = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.pending.len());
        for entry in self.pending.drain(..) {
            if range.contains(&entry.serial) {
                resolved.push(entry);
            } else {
                remaining.push_back(entry);
            }
        }
        self.pending = remaining;

        if (resolved.len() as i64) < count {
            debug!(
                "{} for serials {:?} matched {} pending entries",
                message.action,
                range,
                resolved.len()
            );
        }
        for entry in resolved {
            entry.resolve(result.clone());
        }
        true
    }

    /// React to a connection state transition
    ///
    /// Entering `Connected` starts a new epoch: the serial restarts at zero
    /// and the still-unacknowledged entries are handed back so the engine can
    /// send them again ahead of newly queued envelopes. Entering `Closed` or
    /// `Failed` fails every pending entry.
    pub fn on_state_changed(
        &mut self,
        state: ConnectionState,
        reason: Option<&ErrorInfo>,
    ) -> Vec<PendingAck> {
        match state {
            ConnectionState::Connected => {
                self.next_serial = 0;
                self.pending.drain(..).collect()
            }
            ConnectionState::Closed | ConnectionState::Failed => {
                let error = reason.cloned().unwrap_or_else(|| match state {
                    ConnectionState::Closed => ErrorInfo::closed(),
                    _ => ErrorInfo::connection_failed("Connection failed"),
                });
                self.fail_all(&error);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Fail every pending entry with `error`
    pub fn fail_all(&mut self, error: &ErrorInfo) {
        for entry in self.pending.drain(..) {
            entry.resolve(Err(error.clone()));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn next_serial(&self) -> i64 {
        self.next_serial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Outcomes = Arc<Mutex<Vec<(usize, Result<(), ErrorInfo>)>>>;

    fn recording(outcomes: &Outcomes, index: usize) -> Option<AckCallback> {
        let outcomes = Arc::clone(outcomes);
        Some(Box::new(move |result| outcomes.lock().push((index, result))))
    }

    fn data_message() -> ProtocolMessage {
        ProtocolMessage::messages("chat", vec![Message::new("greeting", "hi")])
    }

    fn queue_three(processor: &mut AckProcessor, outcomes: &Outcomes) -> Vec<i64> {
        (0..3)
            .map(|i| {
                let mut message = data_message();
                assert!(processor
                    .queue_if_necessary(&mut message, recording(outcomes, i))
                    .is_none());
                message.msg_serial.unwrap()
            })
            .collect()
    }

    #[test]
    fn test_serials_restart_on_connected() {
        let mut processor = AckProcessor::new();
        let outcomes = Outcomes::default();

        assert_eq!(queue_three(&mut processor, &outcomes), vec![0, 1, 2]);

        let replay = processor.on_state_changed(ConnectionState::Connected, None);
        assert_eq!(replay.len(), 3);

        let mut next = data_message();
        processor.queue_if_necessary(&mut next, None);
        assert_eq!(next.msg_serial, Some(0));
    }

    #[test]
    fn test_ack_resolves_range_in_order() {
        let mut processor = AckProcessor::new();
        let outcomes = Outcomes::default();
        queue_three(&mut processor, &outcomes);

        assert!(processor.on_message_received(&ProtocolMessage::ack(0, 3)));

        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 3);
        for (i, (index, result)) in outcomes.iter().enumerate() {
            assert_eq!(*index, i);
            assert!(result.is_ok());
        }
        assert_eq!(processor.pending_count(), 0);
    }

    #[test]
    fn test_nack_carries_error() {
        let mut processor = AckProcessor::new();
        let outcomes = Outcomes::default();
        queue_three(&mut processor, &outcomes);

        let error = ErrorInfo::new(40160, 401, "not permitted");
        processor.on_message_received(&ProtocolMessage::nack(0, 3, Some(error.clone())));

        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|(_, r)| r.as_ref().err() == Some(&error)));
    }

    #[test]
    fn test_partial_count_resolves_only_identified_entries() {
        let mut processor = AckProcessor::new();
        let outcomes = Outcomes::default();
        queue_three(&mut processor, &outcomes);

        processor.on_message_received(&ProtocolMessage::ack(0, 1));
        assert_eq!(outcomes.lock().len(), 1);
        assert_eq!(processor.pending_count(), 2);

        processor.on_message_received(&ProtocolMessage::ack(1, 2));
        let indices: Vec<usize> = outcomes.lock().iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_out_of_range_ack_is_ignored() {
        let mut processor = AckProcessor::new();
        let outcomes = Outcomes::default();
        queue_three(&mut processor, &outcomes);

        assert!(processor.on_message_received(&ProtocolMessage::ack(10, 2)));
        assert!(outcomes.lock().is_empty());
        assert_eq!(processor.pending_count(), 3);

        // Second ack for the same serial finds nothing left
        processor.on_message_received(&ProtocolMessage::ack(2, 1));
        processor.on_message_received(&ProtocolMessage::ack(2, 1));
        assert_eq!(outcomes.lock().len(), 1);
    }

    #[test]
    fn test_non_data_actions_pass_through() {
        let mut processor = AckProcessor::new();
        let mut attach = ProtocolMessage::attach("chat");
        let returned = processor.queue_if_necessary(&mut attach, Some(Box::new(|_| {})));

        assert!(returned.is_some());
        assert_eq!(attach.msg_serial, None);
        assert_eq!(processor.next_serial(), 0);
        assert!(!processor.on_message_received(&ProtocolMessage::attach("chat")));
    }

    #[test]
    fn test_terminal_states_fail_pending() {
        let mut processor = AckProcessor::new();
        let outcomes = Outcomes::default();
        queue_three(&mut processor, &outcomes);

        processor.on_state_changed(ConnectionState::Disconnected, None);
        assert!(outcomes.lock().is_empty());

        let error = ErrorInfo::new(80000, 500, "broken");
        processor.on_state_changed(ConnectionState::Failed, Some(&error));
        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|(_, r)| r.as_ref().err() == Some(&error)));
    }
}
