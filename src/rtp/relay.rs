//! RTP relay
//!
//! Forwards RTP datagrams between the two legs of an established call.
//! The relay never inspects payload: it looks up the packet's source
//! address in the stream table and retransmits the bytes unchanged to
//! the paired address. Codec-oblivious by construction.

use bytes::BytesMut;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MAX_DATAGRAM: usize = 2048;

struct Route {
    call_id: String,
    to: SocketAddr,
    packets: AtomicU64,
    bytes: AtomicU64,
}

struct CallAddrs {
    caller: SocketAddr,
    callee: SocketAddr,
}

#[derive(Debug, Clone, Serialize)]
pub struct RtpStreamInfo {
    pub call_id: String,
    pub caller_addr: SocketAddr,
    pub callee_addr: SocketAddr,
    pub caller_to_callee_packets: u64,
    pub callee_to_caller_packets: u64,
}

pub struct RtpRelay {
    /// Keyed by the datagram's *source* address, for O(1) forwarding lookup.
    streams: RwLock<HashMap<SocketAddr, Route>>,
    by_call: RwLock<HashMap<String, CallAddrs>>,
}

impl RtpRelay {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            by_call: RwLock::new(HashMap::new()),
        }
    }

    /// Install both directions of a call's media path.
    pub fn install(&self, call_id: &str, caller_addr: SocketAddr, callee_addr: SocketAddr) {
        let mut streams = self.streams.write().unwrap();
        streams.insert(
            caller_addr,
            Route {
                call_id: call_id.to_string(),
                to: callee_addr,
                packets: AtomicU64::new(0),
                bytes: AtomicU64::new(0),
            },
        );
        streams.insert(
            callee_addr,
            Route {
                call_id: call_id.to_string(),
                to: caller_addr,
                packets: AtomicU64::new(0),
                bytes: AtomicU64::new(0),
            },
        );
        drop(streams);

        self.by_call.write().unwrap().insert(
            call_id.to_string(),
            CallAddrs {
                caller: caller_addr,
                callee: callee_addr,
            },
        );
        debug!(call_id, %caller_addr, %callee_addr, "rtp stream installed");
    }

    pub fn remove(&self, call_id: &str) {
        if let Some(addrs) = self.by_call.write().unwrap().remove(call_id) {
            let mut streams = self.streams.write().unwrap();
            streams.remove(&addrs.caller);
            streams.remove(&addrs.callee);
            debug!(call_id, "rtp stream removed");
        }
    }

    /// Look up the forwarding destination for a datagram arriving from
    /// `source`, recording it toward that route's counters. `None` means
    /// the source matches no installed stream.
    fn route_for(&self, source: SocketAddr, len: usize) -> Option<SocketAddr> {
        let streams = self.streams.read().unwrap();
        let route = streams.get(&source)?;
        route.packets.fetch_add(1, Ordering::Relaxed);
        route.bytes.fetch_add(len as u64, Ordering::Relaxed);
        Some(route.to)
    }

    pub fn list_streams(&self) -> Vec<RtpStreamInfo> {
        let by_call = self.by_call.read().unwrap();
        let streams = self.streams.read().unwrap();
        by_call
            .iter()
            .map(|(call_id, addrs)| {
                let caller_to_callee = streams
                    .get(&addrs.caller)
                    .map(|r| r.packets.load(Ordering::Relaxed))
                    .unwrap_or(0);
                let callee_to_caller = streams
                    .get(&addrs.callee)
                    .map(|r| r.packets.load(Ordering::Relaxed))
                    .unwrap_or(0);
                RtpStreamInfo {
                    call_id: call_id.clone(),
                    caller_addr: addrs.caller,
                    callee_addr: addrs.callee,
                    caller_to_callee_packets: caller_to_callee,
                    callee_to_caller_packets: callee_to_caller,
                }
            })
            .collect()
    }
}

impl Default for RtpRelay {
    fn default() -> Self {
        Self::new()
    }
}

/// Bind-and-forward loop. Unmatched datagrams are logged and dropped;
/// nothing about a missing route is fatal to the relay itself.
pub async fn run(socket: UdpSocket, relay: Arc<RtpRelay>, shutdown: CancellationToken) {
    let mut buf = BytesMut::zeroed(MAX_DATAGRAM);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("rtp relay shutting down");
                break;
            }
            result = socket.recv_from(&mut buf) => {
                let (len, source) = match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "rtp socket read error");
                        continue;
                    }
                };

                match relay.route_for(source, len) {
                    Some(dest) => {
                        debug!(%source, %dest, len, "forwarding rtp datagram");
                        if let Err(e) = socket.send_to(&buf[..len], dest).await {
                            warn!(%dest, error = %e, "failed to forward rtp datagram");
                        }
                    }
                    None => {
                        warn!(%source, len, "dropping rtp datagram with no matching stream");
                    }
                }
            }
        }
    }
}
