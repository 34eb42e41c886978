//! Plain-TCP collector transport (spec §4.1 "session accept... spawn a
//! per-connection reader").

use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::metrics::Metrics;
use crate::pipeline::IngestedRecord;

pub async fn run(addr: SocketAddr, tx: mpsc::Sender<IngestedRecord>, metrics: Arc<Metrics>, cancel: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening for TCP IPFIX connections on {}", &addr);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => { error!("Accept failed on {}: {}", addr, e); continue; }
                };
                let tx = tx.clone();
                let metrics = metrics.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    super::session::run_stream_session(stream, peer.ip(), tx, metrics, cancel).await;
                });
            }
        }
    }
}
