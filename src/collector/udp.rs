//! UDP collector transport (spec §4.1 "a single reader consumes datagrams;
//! each datagram is one message"). Generalizes the teacher's
//! `threads/listener.rs::listen`, which binds one `UdpSocket` and loops on
//! `recv_from`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ipfix::TemplateCache;
use crate::metrics::Metrics;
use crate::pipeline::IngestedRecord;

const MAX_DATAGRAM_SIZE: usize = 65535;

pub async fn run(
    addr: SocketAddr,
    template_refresh_timeout: Duration,
    tx: mpsc::Sender<IngestedRecord>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let socket = UdpSocket::bind(addr).await?;
    info!("Listening for UDP IPFIX datagrams on {}", &addr);

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut cache = TemplateCache::new();

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = socket.recv_from(&mut buf) => result,
        };
        let (len, peer) = match received {
            Ok(v) => v,
            Err(e) => {
                error!("UDP recv failed on {}: {}", addr, e);
                continue;
            }
        };
        super::session::publish_datagram(&buf[..len], peer.ip(), template_refresh_timeout, &mut cache, &tx, &metrics, &cancel).await;
        cache.sweep_expired();
    }
}
