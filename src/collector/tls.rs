//! mTLS collector transport (spec §4.1 "with TLS the server presents the
//! server cert from C8 and requires client certs signed by the same CA").

use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::metrics::Metrics;
use crate::pipeline::IngestedRecord;

pub async fn run(
    addr: SocketAddr,
    acceptor: TlsAcceptor,
    tx: mpsc::Sender<IngestedRecord>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening for TLS IPFIX connections on {}", &addr);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => { error!("Accept failed on {}: {}", addr, e); continue; }
                };
                let acceptor = acceptor.clone();
                let tx = tx.clone();
                let metrics = metrics.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!("TLS handshake with {} failed: {}", peer, e);
                            return;
                        }
                    };
                    super::session::run_stream_session(tls_stream, peer.ip(), tx, metrics, cancel).await;
                });
            }
        }
    }
}
