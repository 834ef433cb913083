//! End-to-end tests driving the B2BUA over real UDP sockets bound to
//! `127.0.0.1:0`. Each test plays one or both "phones" with a plain
//! `tokio::net::UdpSocket` and inspects the server's shared state
//! directly where that's the simplest way to assert on outcome.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use sipbounce::config::Config;
use sipbounce::dialog::{DialogManager, DialogState};
use sipbounce::registrar::Registrar;
use sipbounce::rtp::{self, RtpRelay};
use sipbounce::sip::{Engine, SipTransport};

const RECV_TIMEOUT: Duration = Duration::from_millis(500);

struct Harness {
    sip_addr: SocketAddr,
    rtp_addr: SocketAddr,
    registrar: Arc<Registrar>,
    dialogs: Arc<DialogManager>,
    shutdown: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn spawn_server(call_setup_timeout_ms: u64) -> Harness {
    let mut env = HashMap::new();
    env.insert("SERVER_ADDRESS", "127.0.0.1");
    env.insert("SIP_HOST", "127.0.0.1");
    env.insert("SIP_PORT", "0");
    env.insert("RTP_HOST", "127.0.0.1");
    env.insert("RTP_PORT", "0");
    let timeout_str = call_setup_timeout_ms.to_string();
    env.insert("CALL_SETUP_TIMEOUT_MS", timeout_str.as_str());

    let config = Arc::new(
        Config::from_getter(|key| env.get(key.env_var()).map(|v| v.to_string())).expect("valid test config"),
    );
    let registrar = Arc::new(Registrar::new(config.history_capacity));
    let dialogs = Arc::new(DialogManager::new(config.call_setup_timeout_ms, config.history_capacity));
    let rtp_relay = Arc::new(RtpRelay::new());

    let sip_transport = Arc::new(
        SipTransport::bind(&config.sip_host, config.sip_port)
            .await
            .expect("bind sip socket"),
    );
    let sip_addr = sip_transport.local_addr().expect("sip local addr");

    let rtp_socket = UdpSocket::bind((config.rtp_host.as_str(), config.rtp_port))
        .await
        .expect("bind rtp socket");
    let rtp_addr = rtp_socket.local_addr().expect("rtp local addr");

    let shutdown = CancellationToken::new();

    let engine = Arc::new(Engine::new(
        config.clone(),
        registrar.clone(),
        dialogs.clone(),
        rtp_relay.clone(),
        sip_transport,
    ));
    tokio::spawn(engine.run(shutdown.clone()));
    tokio::spawn(rtp::relay::run(rtp_socket, rtp_relay, shutdown.clone()));

    Harness {
        sip_addr,
        rtp_addr,
        registrar,
        dialogs,
        shutdown,
    }
}

fn sdp_body(port: u16) -> String {
    format!(
        "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=call\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio {} RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n",
        port
    )
}

async fn recv_text(socket: &UdpSocket) -> (String, SocketAddr) {
    let mut buf = [0u8; 8192];
    let (len, from) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for datagram")
        .expect("recv_from failed");
    (String::from_utf8_lossy(&buf[..len]).to_string(), from)
}

fn status_of(raw: &str) -> u16 {
    raw.lines()
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

async fn register(socket: &UdpSocket, server: SocketAddr, extension: &str) {
    let local = socket.local_addr().unwrap();
    let req = format!(
        "REGISTER sip:{ext}@srv SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local}\r\n\
         From: <sip:{ext}@srv>\r\n\
         To: <sip:{ext}@srv>\r\n\
         Call-ID: reg-{ext}@{local}\r\n\
         CSeq: 1 REGISTER\r\n\
         Contact: <sip:{ext}@{local}>\r\n\
         Expires: 3600\r\n\
         \r\n",
        ext = extension,
        local = local,
    );
    socket.send_to(req.as_bytes(), server).await.unwrap();
    let (resp, _) = recv_text(socket).await;
    assert_eq!(status_of(&resp), 200, "registration should succeed: {}", resp);
}

#[tokio::test]
async fn register_with_valid_extension_succeeds() {
    let harness = spawn_server(30_000).await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    register(&client, harness.sip_addr, "100").await;
    assert!(harness.registrar.is_registered("100"));
}

#[tokio::test]
async fn register_with_out_of_range_extension_is_rejected() {
    let harness = spawn_server(30_000).await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let local = client.local_addr().unwrap();
    let req = format!(
        "REGISTER sip:999@srv SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local}\r\n\
         From: <sip:999@srv>\r\n\
         To: <sip:999@srv>\r\n\
         Call-ID: reg-999@{local}\r\n\
         CSeq: 1 REGISTER\r\n\
         Contact: <sip:999@{local}>\r\n\
         \r\n",
        local = local,
    );
    client.send_to(req.as_bytes(), harness.sip_addr).await.unwrap();
    let (resp, _) = recv_text(&client).await;
    assert_eq!(status_of(&resp), 400);
    assert!(!harness.registrar.is_registered("999"));
}

#[tokio::test]
async fn invite_between_registered_extensions_establishes_and_relays_rtp() {
    let harness = spawn_server(30_000).await;

    let caller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let callee = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let caller_local = caller.local_addr().unwrap();

    register(&caller, harness.sip_addr, "100").await;
    register(&callee, harness.sip_addr, "101").await;

    let caller_rtp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let callee_rtp = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let call_id = format!("call-1@{}", caller_local);
    let invite = format!(
        "INVITE sip:101@srv SIP/2.0\r\n\
         Via: SIP/2.0/UDP {caller_local}\r\n\
         From: <sip:100@srv>\r\n\
         To: <sip:101@srv>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:100@{caller_local}>\r\n\
         Content-Type: application/sdp\r\n\
         \r\n{sdp}",
        caller_local = caller_local,
        call_id = call_id,
        sdp = sdp_body(caller_rtp.local_addr().unwrap().port()),
    );
    caller.send_to(invite.as_bytes(), harness.sip_addr).await.unwrap();

    let (trying, _) = recv_text(&caller).await;
    assert_eq!(status_of(&trying), 100);

    let (downstream_invite, server_via_callee) = recv_text(&callee).await;
    assert!(downstream_invite.starts_with("INVITE"));
    assert!(downstream_invite.contains(&harness.rtp_addr.port().to_string()));

    let ok_200 = format!(
        "SIP/2.0 200 OK\r\n\
         Via: SIP/2.0/UDP {server_via}\r\n\
         From: <sip:100@srv>\r\n\
         To: <sip:101@srv>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 INVITE\r\n\
         Content-Type: application/sdp\r\n\
         \r\n{sdp}",
        server_via = server_via_callee,
        call_id = call_id,
        sdp = sdp_body(callee_rtp.local_addr().unwrap().port()),
    );
    callee.send_to(ok_200.as_bytes(), harness.sip_addr).await.unwrap();

    let (final_ok, _) = recv_text(&caller).await;
    assert_eq!(status_of(&final_ok), 200);
    assert!(final_ok.contains(&harness.rtp_addr.port().to_string()));

    let dialog = harness
        .dialogs
        .active_calls()
        .into_iter()
        .find(|d| d.call_id == call_id)
        .expect("dialog should be active");
    assert_eq!(dialog.state, DialogState::Established);

    let ack = format!(
        "ACK sip:100@{caller_local} SIP/2.0\r\n\
         Via: SIP/2.0/UDP {caller_local}\r\n\
         From: <sip:100@srv>\r\n\
         To: <sip:101@srv>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 ACK\r\n\
         \r\n",
        caller_local = caller_local,
        call_id = call_id,
    );
    caller.send_to(ack.as_bytes(), harness.sip_addr).await.unwrap();
    let (downstream_ack, _) = recv_text(&callee).await;
    assert!(downstream_ack.starts_with("ACK"));

    caller_rtp
        .send_to(b"\x80\x00\x00\x01deadbeef", harness.rtp_addr)
        .await
        .unwrap();
    let mut buf = [0u8; 64];
    let (len, _) = timeout(RECV_TIMEOUT, callee_rtp.recv_from(&mut buf))
        .await
        .expect("timed out waiting for relayed rtp")
        .unwrap();
    assert_eq!(&buf[..len], b"\x80\x00\x00\x01deadbeef");

    let bye = format!(
        "BYE sip:101@srv SIP/2.0\r\n\
         Via: SIP/2.0/UDP {caller_local}\r\n\
         From: <sip:100@srv>\r\n\
         To: <sip:101@srv>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 2 BYE\r\n\
         \r\n",
        caller_local = caller_local,
        call_id = call_id,
    );
    caller.send_to(bye.as_bytes(), harness.sip_addr).await.unwrap();
    let (bye_ack, _) = recv_text(&caller).await;
    assert_eq!(status_of(&bye_ack), 200);

    let (downstream_bye, server_via_bye) = recv_text(&callee).await;
    assert!(downstream_bye.starts_with("BYE"));

    let bye_200 = format!(
        "SIP/2.0 200 OK\r\nVia: SIP/2.0/UDP {via}\r\nCall-ID: {call_id}\r\nCSeq: 2 BYE\r\n\r\n",
        via = server_via_bye,
        call_id = call_id,
    );
    callee.send_to(bye_200.as_bytes(), harness.sip_addr).await.unwrap();

    timeout(RECV_TIMEOUT, async {
        loop {
            if harness.dialogs.active_calls().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("dialog should be torn down");
}

#[tokio::test]
async fn invite_to_busy_callee_is_rejected_with_486() {
    let harness = spawn_server(30_000).await;

    let caller_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let callee = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let caller_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    register(&caller_a, harness.sip_addr, "100").await;
    register(&callee, harness.sip_addr, "101").await;
    register(&caller_b, harness.sip_addr, "102").await;

    let local_a = caller_a.local_addr().unwrap();
    let rtp_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let invite_a = format!(
        "INVITE sip:101@srv SIP/2.0\r\nVia: SIP/2.0/UDP {local_a}\r\nFrom: <sip:100@srv>\r\nTo: <sip:101@srv>\r\nCall-ID: call-a@{local_a}\r\nCSeq: 1 INVITE\r\nContact: <sip:100@{local_a}>\r\nContent-Type: application/sdp\r\n\r\n{sdp}",
        local_a = local_a,
        sdp = sdp_body(rtp_a.local_addr().unwrap().port()),
    );
    caller_a.send_to(invite_a.as_bytes(), harness.sip_addr).await.unwrap();
    let (trying, _) = recv_text(&caller_a).await;
    assert_eq!(status_of(&trying), 100);
    let (_downstream, _) = recv_text(&callee).await;

    let local_b = caller_b.local_addr().unwrap();
    let rtp_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let invite_b = format!(
        "INVITE sip:101@srv SIP/2.0\r\nVia: SIP/2.0/UDP {local_b}\r\nFrom: <sip:102@srv>\r\nTo: <sip:101@srv>\r\nCall-ID: call-b@{local_b}\r\nCSeq: 1 INVITE\r\nContact: <sip:102@{local_b}>\r\nContent-Type: application/sdp\r\n\r\n{sdp}",
        local_b = local_b,
        sdp = sdp_body(rtp_b.local_addr().unwrap().port()),
    );
    caller_b.send_to(invite_b.as_bytes(), harness.sip_addr).await.unwrap();
    // Busy is rejected before "100 Trying" is ever sent: the caller should
    // see only the 486, not a Trying that's immediately followed by a failure.
    let (busy, _) = recv_text(&caller_b).await;
    assert_eq!(status_of(&busy), 486);
}

#[tokio::test]
async fn unanswered_invite_times_out_and_is_cleaned_up() {
    let harness = spawn_server(50).await;

    let caller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let callee = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let local = caller.local_addr().unwrap();

    register(&caller, harness.sip_addr, "100").await;
    register(&callee, harness.sip_addr, "101").await;

    let rtp_caller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let invite = format!(
        "INVITE sip:101@srv SIP/2.0\r\nVia: SIP/2.0/UDP {local}\r\nFrom: <sip:100@srv>\r\nTo: <sip:101@srv>\r\nCall-ID: call-timeout@{local}\r\nCSeq: 1 INVITE\r\nContact: <sip:100@{local}>\r\nContent-Type: application/sdp\r\n\r\n{sdp}",
        local = local,
        sdp = sdp_body(rtp_caller.local_addr().unwrap().port()),
    );
    caller.send_to(invite.as_bytes(), harness.sip_addr).await.unwrap();
    let (trying, _) = recv_text(&caller).await;
    assert_eq!(status_of(&trying), 100);
    let (_downstream, _) = recv_text(&callee).await;

    assert_eq!(harness.dialogs.active_calls().len(), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let timed_out = harness.dialogs.cleanup();
    assert_eq!(timed_out, 1);
    assert!(harness.dialogs.active_calls().is_empty());
}
