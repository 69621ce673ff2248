//! UDP and TCP accept loops: read a query, hand it to a [`Responder`],
//! write back whatever it decides, and fold the per-query metrics into
//! the process-wide counters.
//!
//! One task per TCP connection; UDP reads happen in a single task that
//! hands processing off to a worker and keeps listening, replying
//! through an mpsc channel back to the owner of the socket (since
//! `UdpSocket::send_to` needs `&self`, this is really just to keep the
//! structure symmetric with the TCP side and bound the number of
//! concurrent in-flight replies).

use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::sync::RwLock;

use dns_resolver::cache::SharedCache;
use dns_resolver::metrics::Metrics;
use dns_resolver::responder::{Responder, Transport};
use dns_types::protocol::types::{Message, HEADER_MASK_RCODE};
use dns_types::zones::types::Zones;

use crate::metrics as server_metrics;
use crate::net::{read_tcp_bytes, send_tcp_bytes, TcpError};

/// Everything a connection-handling task needs, cheap to clone since
/// it's all `Arc`/shared-handle internally.
#[derive(Clone)]
pub struct ListenArgs {
    pub responder: Arc<Responder<'static, 'static>>,
    pub zones: Arc<RwLock<Zones>>,
    pub cache: SharedCache,
}

async fn process(args: &ListenArgs, raw: &[u8], transport: Transport) -> Option<(Metrics, BytesMut)> {
    let query = match Message::from_octets(raw) {
        Ok(msg) => msg,
        Err(err) => {
            tracing::debug!(?err, "could not parse message");
            let id = err.id()?;
            let response = Message::make_format_error_response(id);
            let bytes = response.to_octets().ok()?;
            return Some((Metrics::new(), bytes));
        }
    };

    let zones = args.zones.read().await;
    let (metrics, reply) = args
        .responder
        .handle_query(&zones, &args.cache, &query, raw, transport);
    reply.map(|bytes| (metrics, bytes))
}

pub async fn listen_tcp_task(args: ListenArgs, socket: TcpListener) {
    loop {
        match socket.accept().await {
            Ok((stream, peer)) => {
                tracing::info!(?peer, "TCP request");
                server_metrics::DNS_REQUESTS_TOTAL
                    .with_label_values(&["tcp"])
                    .inc();
                let args = args.clone();
                tokio::spawn(handle_tcp_connection(args, stream, peer));
            }
            Err(error) => tracing::debug!(?error, "TCP accept error"),
        }
    }
}

async fn handle_tcp_connection(args: ListenArgs, mut stream: TcpStream, peer: std::net::SocketAddr) {
    let timer = server_metrics::DNS_RESPONSE_TIME_SECONDS
        .with_label_values(&["tcp"])
        .start_timer();

    let raw = match read_tcp_bytes(&mut stream).await {
        Ok(bytes) => bytes,
        Err(error) => {
            tracing::debug!(?peer, ?error, "TCP read error");
            let id = match error {
                TcpError::TooShort { id, .. } => id,
                TcpError::IO { id, .. } => id,
            };
            if let Some(id) = id {
                let response = Message::make_format_error_response(id);
                if let Ok(bytes) = response.to_octets() {
                    let _ = send_tcp_bytes(&mut stream, &bytes).await;
                }
            }
            timer.observe_duration();
            return;
        }
    };

    if let Some((metrics, bytes)) = process(&args, &raw, Transport::Tcp).await {
        server_metrics::record("tcp", &metrics);
        server_metrics::DNS_RESPONSES_TOTAL
            .with_label_values(&[response_rcode(&bytes)])
            .inc();
        if let Err(error) = send_tcp_bytes(&mut stream, &bytes).await {
            tracing::debug!(?peer, ?error, "TCP send error");
        }
    }

    timer.observe_duration();
}

pub async fn listen_udp_task(args: ListenArgs, socket: UdpSocket) {
    let (tx, mut rx) = mpsc::channel::<(BytesMut, std::net::SocketAddr, Instant)>(32);
    let mut buf = vec![0u8; 65535];

    loop {
        tokio::select! {
            Ok((size, peer)) = socket.recv_from(&mut buf) => {
                tracing::info!(?peer, "UDP request");
                server_metrics::DNS_REQUESTS_TOTAL.with_label_values(&["udp"]).inc();
                let raw = BytesMut::from(&buf[..size]);
                let args = args.clone();
                let reply = tx.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    if let Some((metrics, bytes)) = process(&args, &raw, Transport::Udp).await {
                        server_metrics::record("udp", &metrics);
                        if reply.send((bytes, peer, started)).await.is_err() {
                            tracing::debug!(?peer, "UDP reply channel closed");
                        }
                    }
                });
            }

            Some((bytes, peer, started)) = rx.recv() => {
                server_metrics::DNS_RESPONSES_TOTAL
                    .with_label_values(&[response_rcode(&bytes)])
                    .inc();
                if let Err(error) = socket.send_to(&bytes, peer).await {
                    tracing::debug!(?peer, ?error, "UDP send error");
                }
                server_metrics::DNS_RESPONSE_TIME_SECONDS
                    .with_label_values(&["udp"])
                    .observe(started.elapsed().as_secs_f64());
            }
        }
    }
}

/// Pull the RCODE out of an already-rendered response for the
/// `dns_responses_total` label, without re-parsing the whole message.
fn response_rcode(bytes: &[u8]) -> &'static str {
    if bytes.len() < 4 {
        return "unknown";
    }
    match bytes[3] & HEADER_MASK_RCODE {
        0 => "NOERROR",
        1 => "FORMERR",
        2 => "SERVFAIL",
        3 => "NXDOMAIN",
        4 => "NOTIMP",
        5 => "REFUSED",
        6 => "YXDOMAIN",
        16 => "BADSIG",
        17 => "BADKEY",
        18 => "BADTIME",
        _ => "other",
    }
}
