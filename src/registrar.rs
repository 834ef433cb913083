//! Registrar (user manager)
//!
//! Maintains the `extension -> contact binding` map with expiry. Reads
//! never observe an expired binding; writes are serialized under a single
//! lock held only across synchronous, non-awaiting code.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use tracing::debug;

use crate::history::RingBuffer;

#[derive(Debug, Clone, Serialize)]
pub struct Binding {
    pub extension: String,
    pub contact_uri: String,
    pub transport_address: SocketAddr,
    pub expires_seconds: i64,
    pub expires_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub registration_count: u32,
}

impl Binding {
    fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RegistrationEventKind {
    Register,
    Unregister,
    Expire,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationEvent {
    pub extension: String,
    pub kind: RegistrationEventKind,
    pub at: DateTime<Utc>,
}

pub struct Registrar {
    bindings: RwLock<HashMap<String, Binding>>,
    history: RwLock<RingBuffer<RegistrationEvent>>,
}

impl Registrar {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
            history: RwLock::new(RingBuffer::new(history_capacity)),
        }
    }

    pub fn register(
        &self,
        number: &str,
        contact_uri: &str,
        transport_address: SocketAddr,
        expires_seconds: i64,
    ) -> Binding {
        self.register_at(number, contact_uri, transport_address, expires_seconds, Utc::now())
    }

    fn register_at(
        &self,
        number: &str,
        contact_uri: &str,
        transport_address: SocketAddr,
        expires_seconds: i64,
        now: DateTime<Utc>,
    ) -> Binding {
        let mut bindings = self.bindings.write().unwrap();
        let prior = bindings.get(number);
        let (registered_at, registration_count) = match prior {
            Some(b) => (b.registered_at, b.registration_count + 1),
            None => (now, 1),
        };

        let binding = Binding {
            extension: number.to_string(),
            contact_uri: contact_uri.to_string(),
            transport_address,
            expires_seconds,
            expires_at: now + Duration::seconds(expires_seconds),
            registered_at,
            last_seen: now,
            registration_count,
        };

        bindings.insert(number.to_string(), binding.clone());
        drop(bindings);

        self.history.write().unwrap().push(RegistrationEvent {
            extension: number.to_string(),
            kind: RegistrationEventKind::Register,
            at: now,
        });

        debug!(extension = %number, expires_seconds, "registered binding");
        binding
    }

    pub fn unregister(&self, number: &str) -> bool {
        let removed = self.bindings.write().unwrap().remove(number).is_some();
        if removed {
            self.history.write().unwrap().push(RegistrationEvent {
                extension: number.to_string(),
                kind: RegistrationEventKind::Unregister,
                at: Utc::now(),
            });
            debug!(extension = %number, "unregistered binding");
        }
        removed
    }

    pub fn lookup(&self, number: &str) -> Option<Binding> {
        self.lookup_at(number, Utc::now())
    }

    fn lookup_at(&self, number: &str, now: DateTime<Utc>) -> Option<Binding> {
        let bindings = self.bindings.read().unwrap();
        match bindings.get(number) {
            Some(b) if b.is_live_at(now) => Some(b.clone()),
            Some(_) => {
                drop(bindings);
                self.bindings.write().unwrap().remove(number);
                None
            }
            None => None,
        }
    }

    pub fn is_registered(&self, number: &str) -> bool {
        self.lookup(number).is_some()
    }

    pub fn update_last_seen(&self, number: &str) {
        if let Some(binding) = self.bindings.write().unwrap().get_mut(number) {
            binding.last_seen = Utc::now();
        }
    }

    /// Remove all expired bindings. Returns the number removed.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Utc::now())
    }

    fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = {
            let bindings = self.bindings.read().unwrap();
            bindings
                .iter()
                .filter(|(_, b)| !b.is_live_at(now))
                .map(|(k, _)| k.clone())
                .collect()
        };

        if expired.is_empty() {
            return 0;
        }

        let mut bindings = self.bindings.write().unwrap();
        for number in &expired {
            bindings.remove(number);
        }
        drop(bindings);

        let mut history = self.history.write().unwrap();
        for number in &expired {
            history.push(RegistrationEvent {
                extension: number.clone(),
                kind: RegistrationEventKind::Expire,
                at: now,
            });
        }
        drop(history);

        debug!(count = expired.len(), "expired registrar bindings");
        expired.len()
    }

    pub fn list_users(&self) -> Vec<Binding> {
        let now = Utc::now();
        self.bindings
            .read()
            .unwrap()
            .values()
            .filter(|b| b.is_live_at(now))
            .cloned()
            .collect()
    }

    pub fn history(&self, limit: usize, offset: usize) -> Vec<RegistrationEvent> {
        self.history
            .read()
            .unwrap()
            .page(limit, offset)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn clear_all_users(&self) {
        self.bindings.write().unwrap().clear();
    }
}
