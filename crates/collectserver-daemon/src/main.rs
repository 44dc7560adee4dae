// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use collectserver::constants::{
    DEFAULT_DATA_DIR, DEFAULT_MONITOR_ADDR, DEFAULT_TCP_ADDR, DEFAULT_UDP_ADDR,
    ERROR_CHANNEL_CAPACITY, EVENT_CHANNEL_CAPACITY,
};
use collectserver::event::EventSender;
use collectserver::flusher::RetryStrategy;
use collectserver::sink::{HttpSink, HttpSinkConfig, LogSink, Sink};
use collectserver::stats::Stats;
use collectserver::{error_channel, monitor, tls, Batcher, BatcherConfig, Collector};

const LOG_LEVEL_ENV: &str = "COLLECTSERVER_LOG_LEVEL";

#[derive(Parser, Debug)]
#[command(name = "collectserver")]
#[command(about = "Collects syslog-style events over TCP and UDP and delivers them in batches")]
#[command(version)]
struct Args {
    /// Events per batch
    #[arg(long, default_value = "4", value_parser = parse_positive)]
    batchsize: usize,

    /// Maximum age of an open batch, in milliseconds
    #[arg(long, default_value = "3000", value_parser = parse_millis)]
    duration: Duration,

    /// Maximum number of batches being delivered at once
    #[arg(long, default_value = "3", value_parser = parse_positive)]
    maxpending: usize,

    /// Directory of the overflow journal
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    datadir: PathBuf,

    #[arg(long, default_value = DEFAULT_UDP_ADDR)]
    udpaddr: String,

    #[arg(long, default_value = DEFAULT_TCP_ADDR)]
    tcpaddr: String,

    /// Address of the HTTP monitoring endpoint
    #[arg(long, default_value = DEFAULT_MONITOR_ADDR)]
    monaddr: String,

    /// CA certificate; TLS on the TCP collector needs both --tlspem and --tlskey
    #[arg(long)]
    tlspem: Option<PathBuf>,

    /// CA private key
    #[arg(long)]
    tlskey: Option<PathBuf>,

    /// Deliver batches to this URL instead of logging them
    #[arg(long)]
    sinkurl: Option<String>,

    /// Sink call timeout, in milliseconds
    #[arg(long, default_value = "5000", value_parser = parse_millis)]
    sinktimeout: Duration,

    /// Compress sink request bodies with zstd at this level (1-22)
    #[arg(long, value_parser = clap::value_parser!(i32).range(1..=22))]
    sinkcompression: Option<i32>,

    /// Interval between journal recovery sweeps, in milliseconds
    #[arg(long, default_value = "5000", value_parser = parse_millis)]
    sweepinterval: Duration,

    /// How long running deliveries may take to finish at shutdown, in milliseconds
    #[arg(long, default_value = "5000", value_parser = parse_millis)]
    shutdowngrace: Duration,

    #[arg(long)]
    debug: bool,
}

fn parse_positive(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

fn parse_millis(s: &str) -> Result<Duration, String> {
    match s.parse::<u64>() {
        Ok(0) => Err("must be greater than 0".to_string()),
        Ok(ms) => Ok(Duration::from_millis(ms)),
        Err(e) => Err(e.to_string()),
    }
}

#[tokio::main]
pub async fn main() -> ExitCode {
    let args = Args::parse();

    let log_level = std::env::var(LOG_LEVEL_ENV)
        .map(|val| val.to_lowercase())
        .unwrap_or_else(|_| if args.debug { "debug" } else { "info" }.to_string());
    if let Err(e) = init_logging(&log_level) {
        eprintln!("collectserver: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).context("could not parse log level in configuration")?,
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;
    debug!("Logging subsystem enabled");
    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    let stats = Arc::new(Stats::default());

    let tls = match (&args.tlspem, &args.tlskey) {
        (Some(pem), Some(key)) => Some(
            tls::load_server_config(pem, key)
                .with_context(|| format!("loading TLS material from {pem:?} and {key:?}"))?,
        ),
        (None, None) => None,
        _ => {
            warn!("TLS needs both --tlspem and --tlskey; the TCP collector runs without TLS");
            None
        }
    };

    let sink: Arc<dyn Sink> = match &args.sinkurl {
        Some(url) => {
            info!("Delivering batches to {}", url);
            Arc::new(
                HttpSink::new(HttpSinkConfig {
                    url: url.clone(),
                    timeout: args.sinktimeout,
                    compression_level: args.sinkcompression,
                })
                .context("creating HTTP sink")?,
            )
        }
        None => Arc::new(LogSink),
    };

    let (errors, drain) = error_channel(ERROR_CHANNEL_CAPACITY, Arc::clone(&stats));
    let drain_cancel = CancellationToken::new();
    let drain_task = tokio::spawn(drain.run(drain_cancel.clone()));

    let batcher = Batcher::new(
        BatcherConfig {
            batch_size: args.batchsize,
            flush_interval: args.duration,
            max_pending: args.maxpending,
            data_dir: args.datadir.clone(),
            channel_capacity: EVENT_CHANNEL_CAPACITY,
            sweep_interval: args.sweepinterval,
            delivery_timeout: args.sinktimeout,
            shutdown_grace: args.shutdowngrace,
            retry_strategy: RetryStrategy::default(),
        },
        sink,
        Arc::clone(&stats),
    );
    let sender = batcher.sender();
    let handle = batcher
        .start(errors)
        .await
        .context("starting batching engine")?;

    let shutdown = CancellationToken::new();
    let started = start_collectors(&args, tls, &sender, &stats, &shutdown).await;
    drop(sender);
    let mut collectors = match started {
        Ok(collectors) => collectors,
        Err(e) => {
            shutdown.cancel();
            handle.shutdown().await;
            return Err(e);
        }
    };

    let monitor = match monitor::start(&args.monaddr, Arc::clone(&stats), shutdown.clone()).await
    {
        Ok((_, task)) => Some(task),
        Err(e) => {
            error!("Monitor endpoint disabled: {e}");
            None
        }
    };

    shutdown_signal().await?;
    info!("Shutting down");

    shutdown.cancel();
    for collector in &mut collectors {
        collector.stopped().await;
    }
    if !handle.shutdown().await {
        warn!("Some deliveries did not finish in time; their batches stay in the journal");
    }
    if let Some(task) = monitor {
        if let Err(e) = task.await {
            error!("Monitor task failed: {e}");
        }
    }
    drain_cancel.cancel();
    if let Err(e) = drain_task.await {
        error!("Error drain failed: {e}");
    }
    info!("Stopped");
    Ok(())
}

async fn start_collectors(
    args: &Args,
    tls: Option<Arc<collectserver::tls::ServerConfig>>,
    sender: &EventSender,
    stats: &Arc<Stats>,
    shutdown: &CancellationToken,
) -> anyhow::Result<Vec<Collector>> {
    let mut collectors = vec![
        Collector::new("udp", &args.udpaddr, None)?.with_stats(Arc::clone(stats)),
        Collector::new("tcp", &args.tcpaddr, tls)?.with_stats(Arc::clone(stats)),
    ];
    for collector in &mut collectors {
        collector
            .start(sender.clone(), shutdown.clone())
            .await
            .with_context(|| format!("starting {} collector", collector.protocol()))?;
    }
    Ok(collectors)
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("waiting for Ctrl-C")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    Ok(())
}
