mod axfr_client;
mod config;
mod logging;
mod metrics;
mod net;
mod server;
mod tsig;
mod zonefile;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::Instrument;

use dns_resolver::cache::SharedCache;
use dns_resolver::responder::Responder;
use dns_types::protocol::tsig::TsigKey;
use dns_types::zones::types::Zones;

use config::ServerConfig;
use server::ListenArgs;
use tsig::HmacSha256Signer;

static SIGNER: HmacSha256Signer = HmacSha256Signer;

/// A simple authoritative DNS server.
///
/// Reads a jnamed.conf-style configuration file naming the zones to
/// serve, the TSIG keys it knows, and the address to listen on.
///
/// Prometheus metrics are served at
/// "http://{metrics_address}:{metrics_port}/metrics"
#[derive(Debug, Parser, Clone)]
struct Args {
    /// Path to the configuration file.
    #[clap(default_value = "jnamed.conf")]
    config: PathBuf,

    /// Interface to listen on to serve Prometheus metrics.
    #[clap(long, value_parser, default_value_t = Ipv4Addr::LOCALHOST)]
    metrics_address: Ipv4Addr,

    /// Port to listen on to serve Prometheus metrics.
    #[clap(long, value_parser, default_value_t = 9420)]
    metrics_port: u16,
}

async fn load_config(path: &PathBuf) -> ServerConfig {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(error) => {
            tracing::error!(?path, ?error, "could not read configuration file");
            process::exit(1);
        }
    };
    match ServerConfig::parse(&text) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(?path, %error, "could not parse configuration file");
            process::exit(1);
        }
    }
}

/// Load every primary and secondary zone named in `config` into a
/// fresh `Zones`.  A zone that fails to load is logged and skipped
/// rather than aborting the whole reload.
async fn load_zones(config: &ServerConfig) -> Zones {
    let mut zones = Zones::new();

    for primary in &config.primaries {
        match tokio::fs::read_to_string(&primary.file).await {
            Ok(text) => match zonefile::parse(&primary.origin, &text) {
                Ok(zone) => zones.insert(zone),
                Err(error) => tracing::warn!(
                    origin = %primary.origin.to_dotted_string(),
                    file = ?primary.file,
                    %error,
                    "could not parse zone file"
                ),
            },
            Err(error) => tracing::warn!(
                file = ?primary.file,
                ?error,
                "could not read zone file"
            ),
        }
    }

    for secondary in &config.secondaries {
        match axfr_client::fetch_zone(&secondary.origin, &secondary.remote).await {
            Ok(zone) => zones.insert(zone),
            Err(error) => tracing::warn!(
                origin = %secondary.origin.to_dotted_string(),
                remote = %secondary.remote,
                %error,
                "could not transfer secondary zone"
            ),
        }
    }

    zones
}

/// Reload zones on SIGUSR1, re-reading the configuration file so
/// zones added or removed there take effect too (TSIG keys and the
/// listen address are fixed for the process lifetime).
async fn reload_task(zones_lock: Arc<RwLock<Zones>>, args: Args) {
    let mut stream = match signal(SignalKind::user_defined1()) {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "could not subscribe to SIGUSR1");
            process::exit(1);
        }
    };

    loop {
        stream.recv().await;
        tracing::error_span!("SIGUSR1").in_scope(|| tracing::info!("received"));
        let start = Instant::now();

        let config = load_config(&args.config)
            .instrument(tracing::error_span!("SIGUSR1"))
            .await;
        let zones = load_zones(&config)
            .instrument(tracing::error_span!("SIGUSR1"))
            .await;

        let mut lock = zones_lock.write().await;
        *lock = zones;
        drop(lock);

        tracing::error_span!("SIGUSR1").in_scope(|| {
            tracing::info!(duration_seconds = %start.elapsed().as_secs_f64(), "done")
        });
    }
}

/// Delete expired cache entries every 5 minutes.
async fn prune_cache_task(cache: SharedCache) {
    loop {
        sleep(Duration::from_secs(60 * 5)).await;
        let (overflow, current_size, expired, pruned) = cache.prune();
        if overflow {
            tracing::warn!(%current_size, "cache overflowed its desired size");
        }
        if expired > 0 || pruned > 0 {
            tracing::info!(%expired, %pruned, "pruned cache");
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    logging::begin_logging();

    let config = load_config(&args.config).await;
    let zones = load_zones(&config).await;

    let address: IpAddr = config.address;
    tracing::info!(%address, port = %config.port, "binding DNS UDP socket");
    let udp = match UdpSocket::bind((address, config.port)).await {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS UDP socket");
            process::exit(1);
        }
    };

    tracing::info!(%address, port = %config.port, "binding DNS TCP socket");
    let tcp = match TcpListener::bind((address, config.port)).await {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS TCP socket");
            process::exit(1);
        }
    };

    let keyring: &'static Vec<TsigKey> = Box::leak(Box::new(config.keys.clone()));
    let responder = Arc::new(Responder::with_tsig(keyring, &SIGNER));
    let zones_lock = Arc::new(RwLock::new(zones));
    let cache = SharedCache::new();

    let listen_args = ListenArgs {
        responder,
        zones: zones_lock.clone(),
        cache: cache.clone(),
    };

    tokio::spawn(server::listen_tcp_task(listen_args.clone(), tcp));
    tokio::spawn(server::listen_udp_task(listen_args, udp));
    tokio::spawn(reload_task(zones_lock, args.clone()));
    tokio::spawn(prune_cache_task(cache));

    let metrics_addr = SocketAddr::from((args.metrics_address, args.metrics_port));
    tracing::info!(address = %metrics_addr, "binding Prometheus metrics socket");
    if let Err(error) = metrics::serve_prometheus_endpoint(metrics_addr).await {
        tracing::error!(?error, "could not bind Prometheus metrics socket");
        process::exit(1);
    }
}
