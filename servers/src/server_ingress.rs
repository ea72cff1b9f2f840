use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use lib_common::{AckRouter, Dispatcher, SocketRegistry};

mod ingress_logic;
use ingress_logic::{config, http, logger, producers, serve, tls};

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = config::load_config();
    logger::init(&config)?;
    lib_common::metrics::register();

    // Read-only after this point: dispatch rules and reliable-ack sources.
    let dispatch_rules = producers::build_dispatch_rules(&config.parsed_dispatch_rules()?)?;
    let ack_sources = Arc::new(config.parsed_reliable_ack_sources()?);

    let dispatcher = Arc::new(Dispatcher::new(dispatch_rules));
    let registry = Arc::new(SocketRegistry::new());
    let (ack_tx, ack_rx) = mpsc::unbounded_channel();

    let shutdown = CancellationToken::new();

    let ack_router = AckRouter::new(
        registry.clone(),
        ack_sources.clone(),
        ack_rx,
        shutdown.child_token(),
    );
    let ack_handle = tokio::spawn(ack_router.run());

    let state = http::AppState {
        dispatcher,
        registry,
        ack_sources,
        ack_tx,
        pass_through: config.pass_through()?,
        cert_order: config.cert_order()?,
        transmit_decoded: config.transmit_decoded_records,
        shutdown: shutdown.clone(),
    };
    let router = http::router(state);

    let tls_acceptor = match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let server_config = tls::build_server_config(
                cert_path,
                key_path,
                config.tls_client_ca_path.as_deref(),
            )?;
            Some(TlsAcceptor::from(Arc::new(server_config)))
        }
        _ => None,
    };

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    log::info!(
        "telemetry ingress listening on {} ({}, pass-through {:?})",
        addr,
        if tls_acceptor.is_some() { "mTLS" } else { "plain TCP" },
        config.pass_through()?
    );

    let serve_handle = tokio::spawn(serve::run(
        listener,
        tls_acceptor,
        router,
        shutdown.child_token(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
                term_signal.recv().await;
                log::info!("SIGTERM received, initiating shutdown.");
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    // Cancel every read loop, pending ack write, and the ack router.
    shutdown.cancel();

    let _ = tokio::try_join!(serve_handle, ack_handle);

    log::info!("Shutdown complete.");
    Ok(())
}
