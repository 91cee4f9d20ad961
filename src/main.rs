use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ipnet::IpNet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use homeguard_rs::agent::Investigator;
use homeguard_rs::backend::BackendClient;
use homeguard_rs::collectors::HostDiscovery;
use homeguard_rs::config::AppConfig;
use homeguard_rs::discovery::PingSweep;
use homeguard_rs::fingerprint::{FingerprintStore, KnownDevice};
use homeguard_rs::monitor::{Alert, Monitor};
use homeguard_rs::orchestrator::Orchestrator;
use homeguard_rs::report::default_report_path;
use homeguard_rs::tools::ToolInput;
use homeguard_rs::types::DiscoveredHost;
use homeguard_rs::{logging, netdetect, ports, server};

/// homeguard-rs: home network security scanner with discovery, fingerprinting, identification
/// and risk reporting for private networks.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "homeguard-rs",
    version,
    about = "Home network security scanner for private networks.",
    long_about = None
)]
struct Cli {
    /// CIDR (e.g., 192.168.1.0/24) or comma-separated IPs. If omitted, auto-detect local /24.
    #[arg(long)]
    targets: Option<String>,

    /// Path to ports list file (one port or range per line). Defaults to the quick port set.
    #[arg(long)]
    ports: Option<PathBuf>,

    /// Scan the full port catalogue instead of the quick set. Ignored with --ports.
    #[arg(long, default_value_t = false)]
    full: bool,

    /// Max concurrent TCP connect attempts per device.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Max devices processed at once.
    #[arg(long = "device-concurrency")]
    device_concurrency: Option<usize>,

    /// Socket connect timeout in milliseconds.
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Write the report as pretty JSON to this path (default ~/.homeguard/reports/).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Fingerprint store file.
    #[arg(long)]
    store: Option<PathBuf>,

    /// Threat-intel / inference backend base URL.
    #[arg(long = "backend-url")]
    backend_url: Option<String>,

    /// Ask the inference backend about devices local rules cannot identify.
    #[arg(long, default_value_t = false)]
    augmented: bool,

    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// trace, debug, info, warn or error.
    #[arg(long = "log-level")]
    log_level: Option<String>,

    /// pretty, compact or json.
    #[arg(long = "log-format")]
    log_format: Option<String>,

    /// Print the devices remembered in the fingerprint store and exit.
    #[arg(long = "list-known", default_value_t = false)]
    list_known: bool,

    /// Attach a label to a known device (`<fingerprint-id>:<key>=<value>`, repeatable) and exit.
    #[arg(long = "label", value_name = "ID:KEY=VALUE")]
    labels: Vec<String>,

    /// Compare the finished scan against the saved baseline and print any alerts.
    #[arg(long, default_value_t = false)]
    monitor: bool,

    /// Print the most recent monitoring alerts and exit.
    #[arg(long, num_args = 0..=1, default_missing_value = "20", value_name = "N")]
    alerts: Option<usize>,

    /// Let the backend chat model investigate one device with the scan tools, then exit.
    #[arg(long, value_name = "IP")]
    investigate: Option<String>,

    /// Serve the HTTP API on this address instead of running a one-off scan.
    #[arg(long, num_args = 0..=1, default_missing_value = "127.0.0.1:8080")]
    serve: Option<String>,
}

impl Cli {
    fn load_config(&self) -> Result<AppConfig> {
        let mut cfg = match &self.config {
            Some(path) => AppConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => AppConfig::default(),
        }
        .merge_env();

        if let Some(path) = &self.ports {
            cfg.scan.ports = ports::load_ports_from_path(path)?;
        } else if self.full {
            cfg.scan.ports = ports::full_ports();
        }
        if let Some(n) = self.concurrency {
            cfg.scan.port_concurrency = n;
        }
        if let Some(n) = self.device_concurrency {
            cfg.scan.device_concurrency = n;
        }
        if let Some(ms) = self.timeout_ms {
            cfg.scan.connect_timeout_ms = ms;
        }
        if let Some(path) = &self.store {
            cfg.fingerprint.store_path = path.clone();
        }
        if let Some(url) = &self.backend_url {
            cfg.backend.url = Some(url.clone());
        }
        if self.augmented {
            cfg.backend.augmented_lookup = true;
        }
        if let Some(level) = &self.log_level {
            cfg.logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            cfg.logging.format = format.clone();
        }
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = cli.load_config()?;
    logging::init_logging(&cfg.logging)?;

    if !cli.labels.is_empty() {
        let mut store = FingerprintStore::open(cfg.fingerprint.clone());
        for raw in &cli.labels {
            let (id, key, value) = parse_label(raw)?;
            if !store.set_label(id, key, value)? {
                anyhow::bail!("unknown fingerprint id: {id}");
            }
            info!(fingerprint_id = id, key, "label set");
        }
    }

    let monitor = Monitor::new(cfg.monitor.clone());
    if let Some(limit) = cli.alerts {
        print_alerts(&monitor.recent_alerts(limit));
        return Ok(());
    }

    if cli.list_known || !cli.labels.is_empty() {
        let store = FingerprintStore::open(cfg.fingerprint.clone());
        print_known_devices(&store.list_known_devices());
        return Ok(());
    }

    let orchestrator = Arc::new(Orchestrator::from_config(&cfg).context("building scanner")?);
    let discovery = Arc::new(PingSweep::default());

    if let Some(ip) = cli.investigate.as_deref() {
        return investigate(&cfg, &orchestrator, discovery.as_ref(), ip).await;
    }

    if let Some(bind) = cli.serve.as_deref() {
        let state = server::AppState::new(orchestrator, discovery).with_monitor(monitor);
        let stop = CancellationToken::new();
        let rescans = server::spawn_monitor_loop(state.clone(), stop.clone());
        let serving = server::spawn_server(bind, state);
        tokio::select! {
            res = serving => res?,
            _ = tokio::signal::ctrl_c() => info!("shutting down"),
        }
        stop.cancel();
        if let Some(handle) = rescans {
            let _ = handle.await;
        }
        return Ok(());
    }

    let (label, hosts) = resolve_targets(cli.targets.as_deref(), discovery.as_ref()).await?;
    info!(network = %label, hosts = hosts.len(), "scanning");

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, finishing with the devices already scanned");
            on_signal.cancel();
        }
    });

    let report = orchestrator.scan_network(&label, hosts, cancel).await;
    println!("{}", report.render_table());

    let path = cli
        .output
        .clone()
        .unwrap_or_else(|| default_report_path(&report.scan_id));
    report
        .save(&path)
        .with_context(|| format!("writing report {}", path.display()))?;
    println!("Report saved: {}", path.display());

    if cli.monitor {
        let alerts = monitor.compare(&report).context("comparing against baseline")?;
        print_alerts(&alerts);
    }
    Ok(())
}

/// A CIDR is swept; a list of addresses is scanned as given.
async fn resolve_targets(
    targets: Option<&str>,
    discovery: &dyn HostDiscovery,
) -> Result<(String, Vec<DiscoveredHost>)> {
    let Some(t) = targets.map(str::trim) else {
        let hosts = discovery.discover_devices(None).await?;
        let label = netdetect::detect_local_cidrs()?
            .first()
            .map_or_else(|| "local".to_string(), IpNet::to_string);
        return Ok((label, hosts));
    };

    if t.contains('/') {
        let net = netdetect::validate_network_cidr(t)?;
        return Ok((net.to_string(), discovery.discover_devices(Some(net)).await?));
    }

    let mut ips = Vec::new();
    for raw in t.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let ip: IpAddr = netdetect::validate_target_ip(raw)?;
        if !ips.contains(&ip) {
            ips.push(ip);
        }
    }
    Ok((t.to_string(), discovery.describe_targets(ips).await?))
}

async fn investigate(
    cfg: &AppConfig,
    orchestrator: &Orchestrator,
    discovery: &dyn HostDiscovery,
    ip: &str,
) -> Result<()> {
    let ip = netdetect::validate_target_ip(ip)?;
    let url = cfg
        .backend
        .url
        .as_deref()
        .context("--investigate needs a backend (--backend-url or HOMEGUARD_BACKEND_URL)")?;
    let backend = BackendClient::new(url, Duration::from_secs(cfg.backend.request_timeout_secs))?;

    let host = discovery
        .describe_targets(vec![ip])
        .await?
        .into_iter()
        .next()
        .context("no host record for target")?;
    let record = orchestrator
        .process_device(&host, &CancellationToken::new())
        .await?;

    let run = Investigator::new(Arc::new(backend), orchestrator.tools().clone())
        .investigate(&ToolInput::from(&record))
        .await?;

    println!("\nInvestigation of {} ({} rounds)", run.ip, run.rounds);
    for step in &run.steps {
        println!("  {:<20} {}", step.tool, if step.ok { "ok" } else { "failed" });
    }
    match &run.summary {
        Some(summary) => println!("\n{summary}"),
        None if run.exhausted => println!("\nNo conclusion within the round limit."),
        None => println!("\nThe model returned no summary."),
    }
    Ok(())
}

fn parse_label(raw: &str) -> Result<(&str, &str, &str)> {
    let (id, rest) = raw
        .split_once(':')
        .with_context(|| format!("label must look like <id>:<key>=<value>: {raw}"))?;
    let (key, value) = rest
        .split_once('=')
        .with_context(|| format!("label must look like <id>:<key>=<value>: {raw}"))?;
    if id.trim().is_empty() || key.trim().is_empty() {
        anyhow::bail!("label needs a fingerprint id and a key: {raw}");
    }
    Ok((id.trim(), key.trim(), value.trim()))
}

fn print_known_devices(devices: &[KnownDevice]) {
    let mut id_w = "id".len();
    let mut type_w = "type".len();
    let mut vendor_w = "vendor".len();
    for d in devices {
        id_w = id_w.max(d.fingerprint_id.len());
        type_w = type_w.max(d.device_type.len().min(32));
        vendor_w = vendor_w.max(d.vendor.len().min(24));
    }
    let seen_w = "seen".len().max(5);

    println!("\nKnown devices: {}", devices.len());
    println!(
        "{:<id_w$}  {:<type_w$}  {:<vendor_w$}  {:>seen_w$}  last_seen",
        "id", "type", "vendor", "seen"
    );
    println!(
        "{:-<id_w$}  {:-<type_w$}  {:-<vendor_w$}  {:-<seen_w$}  ---------",
        "", "", "", ""
    );
    for d in devices {
        let device_type: String = d.device_type.chars().take(32).collect();
        let vendor: String = d.vendor.chars().take(24).collect();
        println!(
            "{:<id_w$}  {:<type_w$}  {:<vendor_w$}  {:>seen_w$}  {}",
            d.fingerprint_id, device_type, vendor, d.seen_count, d.last_seen
        );
    }
}

fn print_alerts(alerts: &[Alert]) {
    let ip_w = alerts
        .iter()
        .filter_map(|a| a.ip.as_ref().map(String::len))
        .fold("ip".len(), usize::max);
    println!("\nAlerts: {}", alerts.len());
    println!("{:<8}  {:<ip_w$}  message", "severity", "ip");
    println!("{:-<8}  {:-<ip_w$}  -------", "", "");
    for a in alerts {
        println!(
            "{:<8}  {:<ip_w$}  {}",
            a.severity.as_str(),
            a.ip.as_deref().unwrap_or("-"),
            a.message
        );
    }
}
