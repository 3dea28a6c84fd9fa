//! # SVP Server Entry Point
//!
//! Command line front end: runs the synthetic profile server, or performs a
//! single atlas query, transmission or store operation.

// Test modules
#[cfg(test)]
mod tests;

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use svp_lib::{
    atlas::{
        climatology::ClimatologyAtlas,
        fetch::{CachingFetcher, DirectoryFetcher, GridFetcher, HttpFetcher, SchemeFetcher},
        forecast::ForecastAtlas,
        GridSource,
    },
    config::{Config, CONFIG_FILE},
    registry::ClientRegistry,
    renderer::draw_ascii,
    server::{ServerSettings, ServerState, SyntheticProfileServer},
    session::Session,
    store::{JsonDirStore, ProfileId, ProfileStore},
    telemetry::{Listener, TelemetryHub},
    transmission::{ClientTarget, TransmissionClient, TransmissionOutcome, TransmitSettings},
};

#[derive(Parser)]
#[command(name = "svp-server", version, about = "Synthetic sound speed profile server")]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server until interrupted
    Serve,
    /// Build a profile for one position
    Query {
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,
        /// RFC 3339 time, default now
        #[arg(long)]
        time: Option<DateTime<Utc>>,
        /// Atlas name, default the configured server source
        #[arg(long)]
        source: Option<String>,
        /// Save the profile to the store
        #[arg(long)]
        save: bool,
        /// Plot the profile
        #[arg(long)]
        plot: bool,
    },
    /// Send a stored profile to every configured client
    Transmit { id: ProfileId },
    /// List stored profiles
    List,
    /// Delete a stored profile
    Delete { id: ProfileId },
    /// Print the effective configuration
    Config {
        /// Write it to the configuration file
        #[arg(long)]
        write: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// `CachingFetcher(SchemeFetcher(http, directory))`, rooted at the working
/// directory for relative templates.
fn build_fetcher(config: &Config) -> anyhow::Result<Arc<dyn GridFetcher>> {
    let http = HttpFetcher::new(Duration::from_secs(config.atlas.http_timeout_secs))
        .context("creating HTTP client")?;
    let scheme: Arc<dyn GridFetcher> =
        Arc::new(SchemeFetcher::new(http, DirectoryFetcher::new(".")));
    Ok(Arc::new(CachingFetcher::new(
        scheme,
        config.atlas.cache_dir.clone(),
        Duration::from_secs(config.atlas.cache_ttl_minutes * 60),
    )))
}

/// Every configured atlas, enabled or not.
fn build_sources(config: &Config, fetcher: Arc<dyn GridFetcher>) -> Vec<Arc<dyn GridSource>> {
    let mut sources: Vec<Arc<dyn GridSource>> = vec![
        Arc::new(ClimatologyAtlas::new(&config.atlas.climatology, fetcher.clone())),
        Arc::new(ForecastAtlas::global(&config.atlas.global_forecast, fetcher.clone())),
    ];
    for regional in &config.atlas.regional {
        sources.push(Arc::new(ForecastAtlas::regional(regional, fetcher.clone())));
    }
    sources
}

fn select_source(config: &Config, name: Option<&str>) -> anyhow::Result<Arc<dyn GridSource>> {
    let name = name.unwrap_or(&config.server.source);
    let sources = build_sources(config, build_fetcher(config)?);
    let names: Vec<String> = sources.iter().map(|s| s.name().to_string()).collect();
    sources
        .into_iter()
        .find(|s| s.name() == name)
        .with_context(|| format!("unknown source {name:?}, configured: {}", names.join(", ")))
}

fn open_store(config: &Config) -> anyhow::Result<Arc<dyn ProfileStore>> {
    let store = JsonDirStore::open(&config.store.directory)
        .with_context(|| format!("opening store {}", config.store.directory.display()))?;
    Ok(Arc::new(store))
}

/// Parse the client targets and start an echo listener for each confirming
/// client. The listeners stop when `shutdown` is cancelled.
async fn build_registry(
    config: &Config,
    shutdown: &CancellationToken,
) -> anyhow::Result<(ClientRegistry, Vec<JoinHandle<()>>)> {
    let settings = TransmitSettings::from(&config.clients);
    let mut clients = Vec::new();
    let mut listeners = Vec::new();
    for entry in &config.clients.targets {
        let target: ClientTarget = entry.parse().with_context(|| format!("client {entry:?}"))?;
        let mut client = TransmissionClient::new(target.clone(), settings.clone());
        if let (true, Some(port)) = (target.protocol.confirms(), target.echo_port) {
            let hub = Arc::new(TelemetryHub::new());
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            let listener = Listener::bind(format!("{} echo", target.name), addr, hub.clone())
                .await
                .with_context(|| format!("binding echo port {port}"))?;
            client = client.with_echo(hub.applied());
            listeners.push(tokio::spawn(listener.run(shutdown.clone())));
        }
        clients.push(client);
    }
    Ok((ClientRegistry::new(clients), listeners))
}

async fn serve(config: Config, source: Arc<dyn GridSource>) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let (registry, mut tasks) = build_registry(&config, &cancel).await?;

    let hub = Arc::new(TelemetryHub::new());
    let nav_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.listeners.navigation_port));
    let navigation = Listener::bind("navigation", nav_addr, hub.clone())
        .await
        .with_context(|| format!("binding navigation port {}", config.listeners.navigation_port))?;
    tasks.push(tokio::spawn(navigation.run(cancel.clone())));

    let settings = ServerSettings::from(&config);
    // Give navigation a chance to report before the start checks
    let mut nav = hub.navigation();
    if nav.borrow().is_none() {
        let _ = tokio::time::timeout(settings.stale_after, nav.changed()).await;
    }
    let mut surface = hub.surface();
    if settings.surface_correction && surface.borrow().is_none() {
        let _ = tokio::time::timeout(settings.stale_after, surface.changed()).await;
    }

    let session = Session::new(open_store(&config)?);
    let mut server = SyntheticProfileServer::new(source, registry, session, &hub, settings);
    if let Err(e) = server.check_settings(&cancel).await {
        cancel.cancel();
        return Err(e.into());
    }

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            interrupt.cancel();
        }
    });

    let state = server.run(cancel.clone()).await;
    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    if state == ServerState::Faulted {
        bail!("server faulted");
    }
    Ok(())
}

fn query(
    config: &Config,
    lat: f64,
    lon: f64,
    time: Option<DateTime<Utc>>,
    source: Option<&str>,
    save: bool,
    plot: bool,
) -> anyhow::Result<()> {
    let source = select_source(config, source)?;
    let time = time.unwrap_or_else(Utc::now);
    let Some(mut profile) = source.query(lat, lon, time) else {
        bail!("{} has no data at {lat}, {lon} for {time}", source.name());
    };
    source.close();

    if let Some(&tolerance) = config.clients.tolerances.first() {
        profile.rebuild_device_view(tolerance);
    }
    if let Some(origin) = profile.meta.position {
        println!(
            "{}: {} levels from node {:.3}, {:.3}",
            source.name(),
            profile.processed.valid_count(),
            origin.latitude,
            origin.longitude
        );
    }
    for sample in profile.processed.valid() {
        println!(
            "{:>9.2} m  {:>8.2} m/s  {:>6.2} °C  {:>6.2} PSU",
            sample.depth, sample.speed, sample.temperature, sample.salinity
        );
    }
    if plot {
        draw_ascii(&profile);
    }
    if save {
        let id = open_store(config)?.save(&profile)?;
        println!("saved as {id}");
    }
    Ok(())
}

async fn transmit(config: &Config, id: ProfileId) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let Some(profile) = store.get(id) else {
        bail!("no stored profile {id}");
    };
    let cancel = CancellationToken::new();
    let (mut registry, tasks) = build_registry(config, &cancel).await?;
    let report = registry.transmit_all(&profile, &cancel).await;
    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }

    for (client, outcome) in &report.outcomes {
        match outcome {
            TransmissionOutcome::DeliveredUnconfirmed => println!("{client}: sent"),
            TransmissionOutcome::DeliveredConfirmed { profile_time } => {
                println!("{client}: confirmed ({profile_time})")
            }
            TransmissionOutcome::DeliveredRejected { max_delta, depth } => {
                println!("{client}: rejected, {max_delta:.2} m/s at {depth:.1} m")
            }
            TransmissionOutcome::TimedOut => println!("{client}: no confirmation"),
            TransmissionOutcome::SendFailed(e) => println!("{client}: failed, {e}"),
        }
    }
    if !report.success {
        bail!("transmission failed");
    }
    Ok(())
}

/// Main application entry point.
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let config = Config::load_from_path(&cli.config);

    match cli.command {
        Command::Serve => {
            // Blocking HTTP clients must be created outside the runtime
            let source = select_source(&config, None)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            // The last handle is dropped here, outside the runtime
            let result = runtime.block_on(serve(config, source.clone()));
            drop(runtime);
            drop(source);
            result
        }
        Command::Query {
            lat,
            lon,
            time,
            source,
            save,
            plot,
        } => query(&config, lat, lon, time, source.as_deref(), save, plot),
        Command::Transmit { id } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(transmit(&config, id))
        }
        Command::List => {
            let store = open_store(&config)?;
            for (id, summary) in store.list() {
                println!(
                    "{id:>6}  {}  {:>9.4} {:>10.4}  {:?}  {} samples",
                    summary.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    summary.position.latitude,
                    summary.position.longitude,
                    summary.probe,
                    summary.samples
                );
            }
            Ok(())
        }
        Command::Delete { id } => {
            if !open_store(&config)?.delete(id) {
                warn!(%id, "no such profile");
                bail!("no stored profile {id}");
            }
            println!("deleted {id}");
            Ok(())
        }
        Command::Config { write } => {
            print!("{}", toml::to_string_pretty(&config)?);
            if write {
                config.save_to_path(&cli.config)?;
            }
            Ok(())
        }
    }
}
