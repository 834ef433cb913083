//! Dialog Manager (call manager)
//!
//! Maintains per-call state, the two legs' signalling transports, the RTP
//! port mapping extracted from each side's SDP, and the originator headers
//! that must be replayed verbatim when relaying the callee's final
//! response back to the caller.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use tracing::debug;

use crate::error::SipError;
use crate::history::RingBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DialogState {
    Initiated,
    Ringing,
    Established,
    Terminating,
    Terminated,
}

/// Aggregate counters returned by [`DialogManager::statistics`]: how many
/// active dialogs sit in each state, how many have been handled overall
/// (active + historical), and the mean duration of calls that reached
/// `ESTABLISHED` before ending.
#[derive(Debug, Clone, Serialize)]
pub struct DialogStatistics {
    pub initiated: usize,
    pub ringing: usize,
    pub established: usize,
    pub terminating: usize,
    pub total_handled: usize,
    pub average_duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TerminationReason {
    Bye,
    Timeout,
    Failed(String),
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::Bye => write!(f, "BYE"),
            TerminationReason::Timeout => write!(f, "TIMEOUT"),
            TerminationReason::Failed(reason) => write!(f, "FAILED: {}", reason),
        }
    }
}

/// Originator headers captured from the initial INVITE, replayed verbatim
/// when forwarding the callee's final response to the caller so dialog
/// identification at the caller matches what it sent.
#[derive(Debug, Clone, Serialize)]
pub struct PreservedHeaders {
    pub via: String,
    pub from: String,
    pub to: String,
    pub cseq: String,
    pub contact: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Dialog {
    pub call_id: String,
    pub from_number: String,
    pub to_number: String,
    pub from_transport: SocketAddr,
    pub to_transport: Option<SocketAddr>,
    pub from_rtp_port: Option<u16>,
    pub to_rtp_port: Option<u16>,
    pub preserved: PreservedHeaders,
    pub state: DialogState,
    pub invite_time: DateTime<Utc>,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub termination_reason: Option<TerminationReason>,
    pub waiting_for_ack: bool,
}

impl Dialog {
    fn involves(&self, number: &str) -> bool {
        self.from_number == number || self.to_number == number
    }
}

pub struct DialogManager {
    dialogs: RwLock<HashMap<String, Dialog>>,
    history: RwLock<RingBuffer<Dialog>>,
    setup_timeout_ms: i64,
}

impl DialogManager {
    pub fn new(setup_timeout_ms: u64, history_capacity: usize) -> Self {
        Self {
            dialogs: RwLock::new(HashMap::new()),
            history: RwLock::new(RingBuffer::new(history_capacity)),
            setup_timeout_ms: setup_timeout_ms as i64,
        }
    }

    pub fn create(
        &self,
        call_id: &str,
        from_number: &str,
        to_number: &str,
        from_transport: SocketAddr,
        preserved: PreservedHeaders,
    ) -> Dialog {
        let dialog = Dialog {
            call_id: call_id.to_string(),
            from_number: from_number.to_string(),
            to_number: to_number.to_string(),
            from_transport,
            to_transport: None,
            from_rtp_port: None,
            to_rtp_port: None,
            preserved,
            state: DialogState::Initiated,
            invite_time: Utc::now(),
            answer_time: None,
            end_time: None,
            duration_seconds: None,
            termination_reason: None,
            waiting_for_ack: false,
        };
        self.dialogs.write().unwrap().insert(call_id.to_string(), dialog.clone());
        debug!(call_id, from = from_number, to = to_number, "dialog created");
        dialog
    }

    pub fn lookup(&self, call_id: &str) -> Option<Dialog> {
        self.dialogs.read().unwrap().get(call_id).cloned()
    }

    fn with_dialog_mut<T>(
        &self,
        call_id: &str,
        f: impl FnOnce(&mut Dialog) -> T,
    ) -> Result<T, SipError> {
        let mut dialogs = self.dialogs.write().unwrap();
        match dialogs.get_mut(call_id) {
            Some(dialog) => Ok(f(dialog)),
            None => Err(SipError::UnknownDialog(call_id.to_string())),
        }
    }

    pub fn set_target(&self, call_id: &str, to_transport: SocketAddr) -> Result<(), SipError> {
        self.with_dialog_mut(call_id, |d| {
            d.to_transport = Some(to_transport);
            d.state = DialogState::Ringing;
        })?;
        debug!(call_id, "dialog ringing");
        Ok(())
    }

    pub fn set_rtp_ports(
        &self,
        call_id: &str,
        from_rtp: Option<u16>,
        to_rtp: Option<u16>,
    ) -> Result<(), SipError> {
        self.with_dialog_mut(call_id, |d| {
            if let Some(p) = from_rtp {
                d.from_rtp_port = Some(p);
            }
            if let Some(p) = to_rtp {
                d.to_rtp_port = Some(p);
            }
        })
    }

    pub fn answer(&self, call_id: &str) -> Result<(), SipError> {
        let now = Utc::now();
        self.with_dialog_mut(call_id, |d| {
            d.state = DialogState::Established;
            d.answer_time = Some(now);
            d.waiting_for_ack = true;
        })?;
        debug!(call_id, "dialog established");
        Ok(())
    }

    /// Move a dialog to `TERMINATING` without removing it; both legs may
    /// still reference it (e.g. an in-flight ACK) until the BYE's 200 OK
    /// is observed.
    pub fn mark_terminating(&self, call_id: &str) -> Result<(), SipError> {
        self.with_dialog_mut(call_id, |d| {
            d.state = DialogState::Terminating;
        })?;
        debug!(call_id, "dialog terminating");
        Ok(())
    }

    /// Clear the `waiting_for_ack` flag once the caller's ACK has been
    /// relayed downstream. Observability only; does not affect routing.
    pub fn ack_received(&self, call_id: &str) -> Result<(), SipError> {
        self.with_dialog_mut(call_id, |d| {
            d.waiting_for_ack = false;
        })
    }

    /// Finalize a dialog: mark `TERMINATED`, compute duration, append to
    /// history, and remove it from the active map.
    pub fn end(&self, call_id: &str, reason: TerminationReason) -> Result<Dialog, SipError> {
        let now = Utc::now();
        let mut dialogs = self.dialogs.write().unwrap();
        let mut dialog = dialogs
            .remove(call_id)
            .ok_or_else(|| SipError::UnknownDialog(call_id.to_string()))?;
        drop(dialogs);

        dialog.state = DialogState::Terminated;
        dialog.end_time = Some(now);
        dialog.duration_seconds = dialog
            .answer_time
            .map(|answered| (now - answered).num_seconds().max(0));
        dialog.termination_reason = Some(reason);

        self.history.write().unwrap().push(dialog.clone());
        debug!(call_id, reason = %dialog.termination_reason.as_ref().unwrap(), "dialog ended");
        Ok(dialog)
    }

    /// True iff any active dialog in `{RINGING, ESTABLISHED}` mentions
    /// `number` in either role.
    pub fn is_number_busy(&self, number: &str) -> bool {
        self.dialogs.read().unwrap().values().any(|d| {
            d.involves(number) && matches!(d.state, DialogState::Ringing | DialogState::Established)
        })
    }

    pub fn calls_by_number(&self, number: &str) -> Vec<Dialog> {
        self.dialogs
            .read()
            .unwrap()
            .values()
            .filter(|d| d.involves(number))
            .cloned()
            .collect()
    }

    pub fn active_calls(&self) -> Vec<Dialog> {
        self.dialogs.read().unwrap().values().cloned().collect()
    }

    pub fn history(&self, limit: usize, offset: usize) -> Vec<Dialog> {
        self.history
            .read()
            .unwrap()
            .page(limit, offset)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn clear_all_calls(&self) {
        self.dialogs.write().unwrap().clear();
    }

    /// Counts by state across active dialogs, total calls handled (active
    /// plus historical), and the mean duration of calls that were answered
    /// before ending.
    pub fn statistics(&self) -> DialogStatistics {
        let dialogs = self.dialogs.read().unwrap();
        let (mut initiated, mut ringing, mut established, mut terminating) = (0, 0, 0, 0);
        for d in dialogs.values() {
            match d.state {
                DialogState::Initiated => initiated += 1,
                DialogState::Ringing => ringing += 1,
                DialogState::Established => established += 1,
                DialogState::Terminating => terminating += 1,
                DialogState::Terminated => {}
            }
        }
        let active_count = dialogs.len();
        drop(dialogs);

        let history = self.history.read().unwrap();
        let durations: Vec<i64> = history.iter().filter_map(|d| d.duration_seconds).collect();
        let average_duration_seconds = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<i64>() as f64 / durations.len() as f64)
        };
        let total_handled = active_count + history.len();

        DialogStatistics {
            initiated,
            ringing,
            established,
            terminating,
            total_handled,
            average_duration_seconds,
        }
    }

    /// End any dialog still `INITIATED` past `CALL_SETUP_TIMEOUT`.
    /// Returns the number of dialogs timed out.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Utc::now())
    }

    fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        let stale: Vec<String> = {
            let dialogs = self.dialogs.read().unwrap();
            dialogs
                .values()
                .filter(|d| {
                    d.state == DialogState::Initiated
                        && (now - d.invite_time).num_milliseconds() > self.setup_timeout_ms
                })
                .map(|d| d.call_id.clone())
                .collect()
        };

        for call_id in &stale {
            let _ = self.end(call_id, TerminationReason::Timeout);
        }

        if !stale.is_empty() {
            debug!(count = stale.len(), "timed out stale dialogs");
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> PreservedHeaders {
        PreservedHeaders {
            via: "SIP/2.0/UDP 10.0.0.5:5061".to_string(),
            from: "<sip:100@srv>".to_string(),
            to: "<sip:101@srv>".to_string(),
            cseq: "1 INVITE".to_string(),
            contact: Some("<sip:100@10.0.0.5:5061>".to_string()),
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn lifecycle_initiated_to_established() {
        let mgr = DialogManager::new(30_000, 10);
        mgr.create("c1", "100", "101", addr("10.0.0.5:5061"), headers());
        assert_eq!(mgr.lookup("c1").unwrap().state, DialogState::Initiated);

        mgr.set_target("c1", addr("10.0.0.6:5062")).unwrap();
        assert_eq!(mgr.lookup("c1").unwrap().state, DialogState::Ringing);

        mgr.answer("c1").unwrap();
        let dialog = mgr.lookup("c1").unwrap();
        assert_eq!(dialog.state, DialogState::Established);
        assert!(dialog.answer_time.is_some());
    }

    #[test]
    fn established_dialog_requires_both_rtp_ports() {
        let mgr = DialogManager::new(30_000, 10);
        mgr.create("c1", "100", "101", addr("10.0.0.5:5061"), headers());
        mgr.set_target("c1", addr("10.0.0.6:5062")).unwrap();
        mgr.set_rtp_ports("c1", Some(40000), Some(41000)).unwrap();
        mgr.answer("c1").unwrap();
        let dialog = mgr.lookup("c1").unwrap();
        assert_eq!(dialog.from_rtp_port, Some(40000));
        assert_eq!(dialog.to_rtp_port, Some(41000));
    }

    #[test]
    fn busy_rule_blocks_second_call_to_ringing_callee() {
        let mgr = DialogManager::new(30_000, 10);
        mgr.create("c1", "100", "101", addr("10.0.0.5:5061"), headers());
        mgr.set_target("c1", addr("10.0.0.6:5062")).unwrap();
        assert!(mgr.is_number_busy("101"));
        assert!(!mgr.is_number_busy("102"));
    }

    #[test]
    fn end_removes_from_active_and_records_history() {
        let mgr = DialogManager::new(30_000, 10);
        mgr.create("c1", "100", "101", addr("10.0.0.5:5061"), headers());
        mgr.set_target("c1", addr("10.0.0.6:5062")).unwrap();
        mgr.answer("c1").unwrap();
        mgr.mark_terminating("c1").unwrap();
        let ended = mgr.end("c1", TerminationReason::Bye).unwrap();
        assert_eq!(ended.state, DialogState::Terminated);
        assert!(ended.duration_seconds.unwrap() >= 0);
        assert!(mgr.lookup("c1").is_none());
        assert_eq!(mgr.history(10, 0).len(), 1);
    }

    #[test]
    fn unknown_call_id_operations_return_error() {
        let mgr = DialogManager::new(30_000, 10);
        assert!(mgr.set_target("nope", addr("10.0.0.6:5062")).is_err());
        assert!(mgr.answer("nope").is_err());
        assert!(mgr.end("nope", TerminationReason::Bye).is_err());
    }

    #[test]
    fn cleanup_times_out_stale_initiated_dialogs() {
        let mgr = DialogManager::new(1000, 10);
        mgr.create("c1", "100", "101", addr("10.0.0.5:5061"), headers());
        let timed_out = mgr.cleanup_at(Utc::now() + chrono::Duration::seconds(5));
        assert_eq!(timed_out, 1);
        assert!(mgr.lookup("c1").is_none());
        let history = mgr.history(10, 0);
        assert_eq!(history[0].termination_reason, Some(TerminationReason::Timeout));
    }

    #[test]
    fn statistics_counts_active_dialogs_by_state() {
        let mgr = DialogManager::new(30_000, 10);
        mgr.create("c1", "100", "101", addr("10.0.0.5:5061"), headers());
        mgr.create("c2", "102", "103", addr("10.0.0.7:5061"), headers());
        mgr.set_target("c2", addr("10.0.0.8:5062")).unwrap();

        let stats = mgr.statistics();
        assert_eq!(stats.initiated, 1);
        assert_eq!(stats.ringing, 1);
        assert_eq!(stats.established, 0);
        assert_eq!(stats.total_handled, 2);
        assert_eq!(stats.average_duration_seconds, None);
    }

    #[test]
    fn statistics_reports_average_duration_of_ended_calls() {
        let mgr = DialogManager::new(30_000, 10);
        mgr.create("c1", "100", "101", addr("10.0.0.5:5061"), headers());
        mgr.set_target("c1", addr("10.0.0.6:5062")).unwrap();
        mgr.answer("c1").unwrap();
        mgr.mark_terminating("c1").unwrap();
        mgr.end("c1", TerminationReason::Bye).unwrap();

        let stats = mgr.statistics();
        assert_eq!(stats.total_handled, 1);
        assert!(stats.average_duration_seconds.unwrap() >= 0.0);
    }

    #[test]
    fn cleanup_does_not_touch_established_dialogs() {
        let mgr = DialogManager::new(1000, 10);
        mgr.create("c1", "100", "101", addr("10.0.0.5:5061"), headers());
        mgr.set_target("c1", addr("10.0.0.6:5062")).unwrap();
        mgr.answer("c1").unwrap();
        let timed_out = mgr.cleanup_at(Utc::now() + chrono::Duration::seconds(5));
        assert_eq!(timed_out, 0);
        assert!(mgr.lookup("c1").is_some());
    }
}
