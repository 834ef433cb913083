mod admin;
mod cli;
mod config;
mod dialog;
mod error;
mod history;
mod registrar;
mod rtp;
mod sdp;
mod shutdown;
mod sip;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::info;

use admin::AdminFacade;
use config::Config;
use dialog::DialogManager;
use registrar::Registrar;
use rtp::RtpRelay;
use sip::{Engine, SipTransport};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args();

    if args.help {
        cli::print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("sipbounce=info".parse().unwrap()),
        )
        .init();

    let config = Config::from_env()?;
    config.validate()?;

    if args.validate {
        info!("configuration is valid");
        return Ok(());
    }

    info!("sipbounce v{}", env!("CARGO_PKG_VERSION"));
    info!("  sip: {}:{}", config.sip_host, config.sip_port);
    info!("  rtp: {}:{}", config.rtp_host, config.rtp_port);
    info!("  server address: {}", config.server_address);
    info!("  extensions: {}-{}", config.ext_min, config.ext_max);

    let config = Arc::new(config);
    let registrar = Arc::new(Registrar::new(config.history_capacity));
    let dialogs = Arc::new(DialogManager::new(config.call_setup_timeout_ms, config.history_capacity));
    let rtp_relay = Arc::new(RtpRelay::new());
    let admin = Arc::new(AdminFacade::new(
        config.clone(),
        registrar.clone(),
        dialogs.clone(),
        rtp_relay.clone(),
    ));

    let sip_transport = Arc::new(SipTransport::bind(&config.sip_host, config.sip_port).await?);
    let rtp_socket = UdpSocket::bind((config.rtp_host.as_str(), config.rtp_port)).await?;

    info!("listening for SIP on {}", sip_transport.local_addr()?);
    info!("relaying RTP on {}", rtp_socket.local_addr()?);

    let shutdown = shutdown::install();

    let engine = Arc::new(Engine::new(
        config.clone(),
        registrar.clone(),
        dialogs.clone(),
        rtp_relay.clone(),
        sip_transport,
    ));
    let sip_task = tokio::spawn(engine.run(shutdown.clone()));

    let rtp_task = tokio::spawn(rtp::relay::run(rtp_socket, rtp_relay, shutdown.clone()));

    let cleanup_task = tokio::spawn(run_cleanup(
        registrar,
        dialogs,
        admin,
        Duration::from_millis(config.cleanup_interval_ms),
        shutdown.clone(),
    ));

    let _ = tokio::join!(sip_task, rtp_task, cleanup_task);

    info!("shutdown complete");
    Ok(())
}

async fn run_cleanup(
    registrar: Arc<Registrar>,
    dialogs: Arc<DialogManager>,
    admin: Arc<AdminFacade>,
    interval: Duration,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("cleanup task shutting down");
                break;
            }
            _ = ticker.tick() => {
                let expired = registrar.cleanup();
                let timed_out = dialogs.cleanup();
                if expired > 0 || timed_out > 0 {
                    info!(expired_registrations = expired, timed_out_calls = timed_out, "cleanup pass");
                }
                let stats = admin.statistics();
                if stats.active_calls > 0 || stats.registered_users > 0 {
                    info!(?stats, "status");
                }
            }
        }
    }
}
