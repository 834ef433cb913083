//! B2BUA dispatch
//!
//! Routes every parsed datagram by method (requests) or by dialog state
//! (responses). This is the only place that touches the Registrar, the
//! Dialog Manager, and the RTP relay together; everything below it is a
//! pure function of its inputs.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::message::{SipMessage, StartLine};
use super::transport::SipTransport;
use super::validation;
use crate::config::Config;
use crate::dialog::{Dialog, DialogManager, DialogState, PreservedHeaders, TerminationReason};
use crate::error::SipError;
use crate::registrar::Registrar;
use crate::rtp::RtpRelay;
use crate::sdp;

pub struct Engine {
    config: Arc<Config>,
    registrar: Arc<Registrar>,
    dialogs: Arc<DialogManager>,
    rtp: Arc<RtpRelay>,
    transport: Arc<SipTransport>,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        registrar: Arc<Registrar>,
        dialogs: Arc<DialogManager>,
        rtp: Arc<RtpRelay>,
        transport: Arc<SipTransport>,
    ) -> Self {
        Self {
            config,
            registrar,
            dialogs,
            rtp,
            transport,
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("sip engine shutting down");
                    break;
                }
                result = self.transport.recv() => {
                    match result {
                        Ok((msg, source)) => self.dispatch(msg, source).await,
                        Err(e) => warn!(error = %e, "failed to parse incoming datagram"),
                    }
                }
            }
        }
    }

    async fn dispatch(&self, msg: SipMessage, source: SocketAddr) {
        let is_request = msg.is_request();

        let result = if is_request {
            match msg.method() {
                Some("REGISTER") => self.handle_register(&msg, source).await,
                Some("INVITE") => self.handle_invite(&msg, source).await,
                Some("ACK") => self.handle_ack(&msg, source).await,
                Some("BYE") => self.handle_bye(&msg, source).await,
                Some(other) => {
                    warn!(method = other, %source, "unsupported method, dropping");
                    return;
                }
                None => return,
            }
        } else {
            self.handle_response(&msg, source).await
        };

        if let Err(e) = result {
            match (is_request, e.status_code()) {
                (true, Some(code)) => {
                    let resp = build_response(&msg, code, e.reason_phrase());
                    if let Err(send_err) = self.transport.send(&resp, source).await {
                        warn!(error = %send_err, "failed to send error response");
                    }
                }
                _ => warn!(error = %e, %source, "dropping message"),
            }
        }
    }

    fn is_valid_extension(&self, number: &str) -> bool {
        self.config.is_valid_extension(number)
    }

    fn own_contact(&self) -> String {
        format!("<sip:{}:{}>", self.config.server_address, self.config.sip_port)
    }

    fn own_via(&self, branch: &str) -> String {
        format!(
            "SIP/2.0/UDP {}:{};branch={}",
            self.config.server_address, self.config.sip_port, branch
        )
    }

    async fn handle_register(&self, msg: &SipMessage, source: SocketAddr) -> Result<(), SipError> {
        validation::validate_register(msg, |n| self.is_valid_extension(n)).map_err(SipError::Validation)?;

        let to_uri = validation::parse_sip_uri(
            &validation::extract_uri(msg.headers.to.as_deref().unwrap_or("")),
            |n| self.is_valid_extension(n),
        )
        .map_err(|e| SipError::Validation(vec![e]))?;

        let contact_raw = msg
            .headers
            .contact
            .clone()
            .ok_or_else(|| SipError::Validation(vec!["missing Contact".to_string()]))?;
        let contact_uri = validation::extract_uri(&contact_raw);

        let expires: i64 = msg
            .headers
            .expires
            .as_deref()
            .map(|v| v.parse().unwrap_or(self.config.registration_timeout_secs as i64))
            .unwrap_or(self.config.registration_timeout_secs as i64);

        if expires == 0 {
            self.registrar.unregister(&to_uri.number);
        } else {
            self.registrar
                .register(&to_uri.number, &contact_uri, source, expires);
        }

        let response = build_response(msg, 200, "OK")
            .with_header("Contact", contact_raw)
            .with_header("Expires", expires.to_string());
        self.transport.send(&response, source).await?;
        Ok(())
    }

    async fn handle_invite(&self, msg: &SipMessage, source: SocketAddr) -> Result<(), SipError> {
        validation::validate_invite(msg, |n| self.is_valid_extension(n)).map_err(SipError::Validation)?;

        let call_id = msg
            .headers
            .call_id
            .clone()
            .ok_or_else(|| SipError::Validation(vec!["missing Call-ID".to_string()]))?;

        let from_uri = validation::parse_sip_uri(
            &validation::extract_uri(msg.headers.from.as_deref().unwrap_or("")),
            |n| self.is_valid_extension(n),
        )
        .map_err(|e| SipError::Validation(vec![e]))?;
        let to_uri = validation::parse_sip_uri(
            &validation::extract_uri(msg.headers.to.as_deref().unwrap_or("")),
            |n| self.is_valid_extension(n),
        )
        .map_err(|e| SipError::Validation(vec![e]))?;

        if !self.registrar.is_registered(&from_uri.number) {
            return Err(SipError::UnregisteredParty(from_uri.number));
        }
        let callee = self
            .registrar
            .lookup(&to_uri.number)
            .ok_or_else(|| SipError::UnregisteredParty(to_uri.number.clone()))?;

        if self.dialogs.is_number_busy(&to_uri.number) {
            return Err(SipError::Busy(to_uri.number));
        }

        let trying = build_response(msg, 100, "Trying");
        self.transport.send(&trying, source).await?;

        let preserved = PreservedHeaders {
            via: msg.headers.via.clone().unwrap_or_default(),
            from: msg.headers.from.clone().unwrap_or_default(),
            to: msg.headers.to.clone().unwrap_or_default(),
            cseq: msg.headers.cseq.clone().unwrap_or_default(),
            contact: msg.headers.contact.clone(),
        };
        self.dialogs
            .create(&call_id, &from_uri.number, &to_uri.number, source, preserved);
        self.dialogs.set_target(&call_id, callee.transport_address)?;

        if let Some(port) = sdp::extract_audio_port(&msg.body) {
            self.dialogs.set_rtp_ports(&call_id, Some(port), None)?;
        }

        let rewritten_body = sdp::rewrite_sdp(&msg.body, &self.config.server_address, self.config.rtp_port);
        let branch = new_branch();
        let downstream = SipMessage::request("INVITE", callee.contact_uri.clone())
            .with_header("Via", self.own_via(&branch))
            .with_header("From", msg.headers.from.clone().unwrap_or_default())
            .with_header("To", msg.headers.to.clone().unwrap_or_default())
            .with_header("Call-ID", call_id.clone())
            .with_header("CSeq", msg.headers.cseq.clone().unwrap_or_default())
            .with_header("Contact", self.own_contact())
            .with_header("Content-Type", "application/sdp")
            .with_body(rewritten_body);

        self.transport.send(&downstream, callee.transport_address).await?;
        Ok(())
    }

    async fn handle_ack(&self, msg: &SipMessage, source: SocketAddr) -> Result<(), SipError> {
        let call_id = msg
            .headers
            .call_id
            .clone()
            .ok_or_else(|| SipError::UnknownDialog("<missing>".to_string()))?;
        let dialog = self
            .dialogs
            .lookup(&call_id)
            .ok_or_else(|| SipError::UnknownDialog(call_id.clone()))?;

        if source != dialog.from_transport {
            return Err(SipError::UnknownDialog(call_id));
        }
        let to_transport = dialog
            .to_transport
            .ok_or_else(|| SipError::UnknownDialog(call_id.clone()))?;
        let callee = self
            .registrar
            .lookup(&dialog.to_number)
            .ok_or_else(|| SipError::UnknownDialog(call_id.clone()))?;

        let branch = msg
            .headers
            .via
            .as_deref()
            .and_then(extract_branch)
            .unwrap_or_else(new_branch);
        let cseq_ack = swap_cseq_method(&dialog.preserved.cseq, "ACK");

        let downstream = SipMessage::request("ACK", callee.contact_uri.clone())
            .with_header("Via", self.own_via(&branch))
            .with_header("From", dialog.preserved.from.clone())
            .with_header("To", dialog.preserved.to.clone())
            .with_header("Call-ID", call_id.clone())
            .with_header("CSeq", cseq_ack);

        self.transport.send(&downstream, to_transport).await?;
        self.dialogs.ack_received(&call_id)?;
        Ok(())
    }

    async fn handle_bye(&self, msg: &SipMessage, source: SocketAddr) -> Result<(), SipError> {
        validation::validate_bye(msg, |n| self.is_valid_extension(n)).map_err(SipError::Validation)?;

        let call_id = msg
            .headers
            .call_id
            .clone()
            .ok_or_else(|| SipError::UnknownDialog("<missing>".to_string()))?;
        let dialog = self
            .dialogs
            .lookup(&call_id)
            .ok_or_else(|| SipError::UnknownDialog(call_id.clone()))?;

        let (other_leg, other_number) = if source == dialog.from_transport {
            (dialog.to_transport, dialog.to_number.clone())
        } else if Some(source) == dialog.to_transport {
            (Some(dialog.from_transport), dialog.from_number.clone())
        } else {
            return Err(SipError::UnknownDialog(call_id));
        };

        let ok = build_response(msg, 200, "OK");
        self.transport.send(&ok, source).await?;
        self.dialogs.mark_terminating(&call_id)?;

        match other_leg {
            Some(other_addr) => {
                let target_uri = self
                    .registrar
                    .lookup(&other_number)
                    .map(|b| b.contact_uri)
                    .unwrap_or_else(|| format!("sip:{}@{}", other_number, other_addr));
                let branch = new_branch();
                let downstream = SipMessage::request("BYE", target_uri)
                    .with_header("Via", self.own_via(&branch))
                    .with_header("From", dialog.preserved.from.clone())
                    .with_header("To", dialog.preserved.to.clone())
                    .with_header("Call-ID", call_id.clone())
                    .with_header("CSeq", msg.headers.cseq.clone().unwrap_or_default());
                self.transport.send(&downstream, other_addr).await?;
            }
            None => {
                self.dialogs.end(&call_id, TerminationReason::Bye)?;
                self.rtp.remove(&call_id);
            }
        }
        Ok(())
    }

    async fn handle_response(&self, msg: &SipMessage, source: SocketAddr) -> Result<(), SipError> {
        let call_id = msg
            .headers
            .call_id
            .clone()
            .ok_or_else(|| SipError::UnknownDialog("<missing>".to_string()))?;
        let dialog = self
            .dialogs
            .lookup(&call_id)
            .ok_or_else(|| SipError::UnknownDialog(call_id.clone()))?;
        let status = msg.status().unwrap_or(0);
        let reason = response_reason(msg);

        match status {
            100 => Ok(()),
            180 | 183 if dialog.state == DialogState::Ringing => {
                let resp = build_response_from_preserved(&dialog, status, &reason);
                self.transport.send(&resp, dialog.from_transport).await?;
                Ok(())
            }
            200 => match dialog.state {
                DialogState::Ringing => self.handle_invite_success(&dialog, msg, source).await,
                DialogState::Terminating => {
                    self.dialogs.end(&call_id, TerminationReason::Bye)?;
                    self.rtp.remove(&call_id);
                    Ok(())
                }
                other => {
                    warn!(call_id = %call_id, state = ?other, "unexpected 200 OK, ignoring");
                    Ok(())
                }
            },
            400..=699 if matches!(dialog.state, DialogState::Initiated | DialogState::Ringing) => {
                let resp = build_response_from_preserved(&dialog, status, &reason);
                self.transport.send(&resp, dialog.from_transport).await?;
                self.dialogs
                    .end(&call_id, TerminationReason::Failed(format!("{} {}", status, reason)))?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn handle_invite_success(
        &self,
        dialog: &Dialog,
        msg: &SipMessage,
        source: SocketAddr,
    ) -> Result<(), SipError> {
        let to_rtp_port = sdp::extract_audio_port(&msg.body)
            .ok_or_else(|| SipError::Validation(vec!["200 OK missing m=audio line".to_string()]))?;
        let from_rtp_port = dialog.from_rtp_port.ok_or_else(|| {
            SipError::Internal(anyhow::anyhow!(
                "dialog {} never captured caller's rtp port",
                dialog.call_id
            ))
        })?;

        let from_media = SocketAddr::new(dialog.from_transport.ip(), from_rtp_port);
        let to_media = SocketAddr::new(source.ip(), to_rtp_port);
        self.rtp.install(&dialog.call_id, from_media, to_media);

        self.dialogs
            .set_rtp_ports(&dialog.call_id, None, Some(to_rtp_port))?;
        self.dialogs.answer(&dialog.call_id)?;

        let rewritten_body = sdp::rewrite_sdp(&msg.body, &self.config.server_address, self.config.rtp_port);
        let response = SipMessage::response(200, "OK")
            .with_header("Via", dialog.preserved.via.clone())
            .with_header("From", dialog.preserved.from.clone())
            .with_header("To", dialog.preserved.to.clone())
            .with_header("Call-ID", dialog.call_id.clone())
            .with_header("CSeq", dialog.preserved.cseq.clone())
            .with_header("Contact", self.own_contact())
            .with_header("Content-Type", "application/sdp")
            .with_body(rewritten_body);

        self.transport.send(&response, dialog.from_transport).await?;
        Ok(())
    }
}

fn build_response(request: &SipMessage, status: u16, reason: &str) -> SipMessage {
    let mut resp = SipMessage::response(status, reason);
    if let Some(v) = &request.headers.via {
        resp = resp.with_header("Via", v.clone());
    }
    if let Some(v) = &request.headers.from {
        resp = resp.with_header("From", v.clone());
    }
    if let Some(v) = &request.headers.to {
        resp = resp.with_header("To", v.clone());
    }
    if let Some(v) = &request.headers.call_id {
        resp = resp.with_header("Call-ID", v.clone());
    }
    if let Some(v) = &request.headers.cseq {
        resp = resp.with_header("CSeq", v.clone());
    }
    resp
}

fn build_response_from_preserved(dialog: &Dialog, status: u16, reason: &str) -> SipMessage {
    SipMessage::response(status, reason)
        .with_header("Via", dialog.preserved.via.clone())
        .with_header("From", dialog.preserved.from.clone())
        .with_header("To", dialog.preserved.to.clone())
        .with_header("Call-ID", dialog.call_id.clone())
        .with_header("CSeq", dialog.preserved.cseq.clone())
}

fn response_reason(msg: &SipMessage) -> String {
    match &msg.start_line {
        StartLine::Response { reason, .. } => reason.clone(),
        StartLine::Request { .. } => String::new(),
    }
}

fn new_branch() -> String {
    format!("z9hG4bK-{:08x}", rand::random::<u32>())
}

fn extract_branch(via: &str) -> Option<String> {
    via.split(';')
        .map(str::trim)
        .find_map(|seg| seg.strip_prefix("branch=").map(str::to_string))
}

fn swap_cseq_method(cseq: &str, method: &str) -> String {
    let seq = cseq.split_whitespace().next().unwrap_or("1");
    format!("{} {}", seq, method)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_branch_finds_param() {
        assert_eq!(
            extract_branch("SIP/2.0/UDP 10.0.0.5:5061;branch=z9hG4bK-1;rport"),
            Some("z9hG4bK-1".to_string())
        );
    }

    #[test]
    fn extract_branch_none_without_param() {
        assert_eq!(extract_branch("SIP/2.0/UDP 10.0.0.5:5061"), None);
    }

    #[test]
    fn swap_cseq_method_keeps_sequence_number() {
        assert_eq!(swap_cseq_method("4 INVITE", "ACK"), "4 ACK");
    }

    #[test]
    fn new_branch_has_magic_cookie_prefix() {
        assert!(new_branch().starts_with("z9hG4bK-"));
    }
}
