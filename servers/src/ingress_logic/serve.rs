//! The accept loop.
//!
//! `axum-server` cannot surface the peer certificate chain, so the server
//! terminates TLS itself: accept TCP, run the rustls handshake, stash the
//! verified peer chain in the request extensions, and hand the stream to
//! hyper with the axum router behind it. Upgrade support is required for
//! the WebSocket path.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::Request;
use axum::middleware::AddExtension;
use axum::Router;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls_pki_types::CertificateDer;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};

/// The verified client certificate chain of a direct-TLS connection,
/// inserted into every request's extensions by the accept loop.
#[derive(Clone)]
pub struct PeerCertificates(pub Arc<Vec<CertificateDer<'static>>>);

type ConnService = AddExtension<Router, ConnectInfo<SocketAddr>>;

/// Accept connections until shutdown. With a TLS acceptor the handshake
/// runs (and, in mTLS mode, client verification happens) before any HTTP
/// is read; without one the stream is served as plain TCP for deployments
/// behind a TLS-terminating balancer.
pub async fn run(
    listener: TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
    router: Router,
    shutdown: CancellationToken,
) {
    let mut make_service = router.into_make_service_with_connect_info::<SocketAddr>();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                log::info!("acceptor shutting down");
                break;
            }
            conn = listener.accept() => {
                let (tcp_stream, remote_addr) = match conn {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::warn!("failed to accept TCP connection: {}", e);
                        continue;
                    }
                };

                // Resolving the make-service here attaches ConnectInfo so
                // handlers and the request logger see the remote address.
                let service: Result<ConnService, Infallible> =
                    make_service.call(remote_addr).await;
                let service = service.expect("infallible");

                match tls_acceptor.clone() {
                    Some(acceptor) => {
                        tokio::spawn(handle_tls_connection(
                            tcp_stream, remote_addr, acceptor, service,
                        ));
                    }
                    None => {
                        tokio::spawn(async move {
                            serve_stream(TokioIo::new(tcp_stream), remote_addr, None, service)
                                .await;
                        });
                    }
                }
            }
        }
    }
}

async fn handle_tls_connection(
    tcp_stream: TcpStream,
    remote_addr: SocketAddr,
    acceptor: TlsAcceptor,
    service: ConnService,
) {
    let tls_stream = match acceptor.accept(tcp_stream).await {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!("TLS handshake with {} failed: {}", remote_addr, e);
            return;
        }
    };

    // The verified peer chain has to be captured now; it is unreachable
    // once the stream is wrapped for hyper.
    let peer_certs = {
        let (_, server_conn) = tls_stream.get_ref();
        server_conn
            .peer_certificates()
            .map(|certs| PeerCertificates(Arc::new(certs.to_vec())))
    };

    serve_stream(TokioIo::new(tls_stream), remote_addr, peer_certs, service).await;
}

async fn serve_stream<IO>(
    io: IO,
    remote_addr: SocketAddr,
    peer_certs: Option<PeerCertificates>,
    service: ConnService,
) where
    IO: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let hyper_service = service_fn(move |mut request: Request<Incoming>| {
        if let Some(certs) = &peer_certs {
            request.extensions_mut().insert(certs.clone());
        }
        service.clone().oneshot(request)
    });

    if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, hyper_service)
        .await
    {
        log::debug!("connection from {} ended with error: {}", remote_addr, e);
    }
}
