//! Admin facade
//!
//! A read-mostly aggregation over the Registrar, Dialog Manager, and RTP
//! relay, shaped for an external HTTP/CLI layer to serialize directly.
//! No such layer is built here; this module is the seam it would call.

use serde::Serialize;
use std::sync::Arc;

use crate::config::Config;
use crate::dialog::{Dialog, DialogManager, DialogStatistics};
use crate::registrar::{Binding, RegistrationEvent, Registrar};
use crate::rtp::{RtpRelay, RtpStreamInfo};

/// One configured extension and whether it currently has a live binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionStatus {
    pub extension: String,
    pub registered: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    pub registered_users: usize,
    pub active_calls: usize,
    pub calls_in_history: usize,
    pub rtp_streams: usize,
    pub configured_extensions: usize,
    pub dialogs: DialogStatistics,
}

pub struct AdminFacade {
    config: Arc<Config>,
    registrar: Arc<Registrar>,
    dialogs: Arc<DialogManager>,
    rtp: Arc<RtpRelay>,
}

impl AdminFacade {
    pub fn new(
        config: Arc<Config>,
        registrar: Arc<Registrar>,
        dialogs: Arc<DialogManager>,
        rtp: Arc<RtpRelay>,
    ) -> Self {
        Self {
            config,
            registrar,
            dialogs,
            rtp,
        }
    }

    pub fn list_users(&self) -> Vec<Binding> {
        self.registrar.list_users()
    }

    pub fn registration_history(&self, limit: usize, offset: usize) -> Vec<RegistrationEvent> {
        self.registrar.history(limit, offset)
    }

    /// The full configured extension range, each tagged with whether it
    /// currently has a live registrar binding.
    pub fn list_extensions(&self) -> Vec<ExtensionStatus> {
        let registered: std::collections::HashSet<String> =
            self.registrar.list_users().into_iter().map(|b| b.extension).collect();
        self.config
            .extensions()
            .map(|extension| {
                let registered = registered.contains(&extension);
                ExtensionStatus { extension, registered }
            })
            .collect()
    }

    pub fn list_active_calls(&self) -> Vec<Dialog> {
        self.dialogs.active_calls()
    }

    pub fn call_history(&self, limit: usize, offset: usize) -> Vec<Dialog> {
        self.dialogs.history(limit, offset)
    }

    pub fn list_rtp_streams(&self) -> Vec<RtpStreamInfo> {
        self.rtp.list_streams()
    }

    pub fn statistics(&self) -> Statistics {
        Statistics {
            registered_users: self.registrar.list_users().len(),
            active_calls: self.dialogs.active_calls().len(),
            calls_in_history: self.dialogs.history(usize::MAX, 0).len(),
            rtp_streams: self.rtp.list_streams().len(),
            configured_extensions: self.list_extensions().len(),
            dialogs: self.dialogs.statistics(),
        }
    }

    pub fn unregister(&self, number: &str) -> bool {
        self.registrar.unregister(number)
    }

    pub fn clear_all_calls(&self) {
        self.dialogs.clear_all_calls();
    }

    pub fn clear_all_users(&self) {
        self.registrar.clear_all_users();
    }
}
