//! Command-line entry point.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use meshboot::audit::AuditLog;
use meshboot::context::{FactStore, RunConfig, RunContext};
use meshboot::orchestrate;
use meshboot::pipeline::ExecutorOptions;
use meshboot::pki::CaManager;
use meshboot::runner::{HostRunner, LocalTransport, RetryPolicy, SshTransport, Transport};
use meshboot::topology::Topology;
use meshboot::vars::{self, TargetEnv};

#[derive(Parser, Debug)]
#[command(
    name = "meshboot",
    version,
    about = "Bootstrap a mesh cluster from a declarative topology"
)]
struct Cli {
    /// Topology file: a JSON list of nodes with roles.
    #[arg(long)]
    topology: PathBuf,

    /// Target environment the variable list is validated against.
    #[arg(long, default_value = "metal")]
    env: TargetEnv,

    /// Base64-encoded key=value variable list.
    #[arg(long)]
    vars: Option<String>,

    /// Run only stages carrying these tags (comma-separated).
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,

    /// Reachable endpoint of the consistent store.
    #[arg(long, default_value = "http://127.0.0.1:2379")]
    etcd_endpoint: String,

    /// ssh user for host access.
    #[arg(long)]
    ssh_user: Option<String>,

    /// ssh identity file.
    #[arg(long)]
    ssh_identity: Option<PathBuf>,

    /// Run commands through a local shell instead of ssh. Single-host
    /// deploys only.
    #[arg(long)]
    local: bool,

    /// Directory holding CA material on this host.
    #[arg(long, default_value = "/var/lib/mesh/pki")]
    pki_dir: PathBuf,

    /// Write a JSON-lines audit record to this file.
    #[arg(long)]
    audit_file: Option<PathBuf>,

    /// Proceed even when the observed MTU floor is below the minimum.
    #[arg(long)]
    mtu_override: bool,

    /// Worker-pool bound for parallel stages.
    #[arg(long, default_value_t = 16)]
    parallel: usize,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let decoded = match &cli.vars {
        Some(blob) => vars::decode(blob)?,
        None => Vec::new(),
    };
    vars::validate(cli.env, &decoded)?;

    let mut config = RunConfig {
        etcd_endpoint: cli.etcd_endpoint.clone(),
        mtu_override: cli.mtu_override,
        pki_dir: cli.pki_dir.clone(),
        ..RunConfig::default()
    };
    config.apply_vars(&decoded)?;

    let topology = Topology::from_json(&cli.topology)
        .with_context(|| format!("loading topology {}", cli.topology.display()))?;
    tracing::info!(
        nodes = topology.nodes().len(),
        hypervisors = topology.hypervisors().len(),
        etcd_masters = topology.etcd_masters().len(),
        "topology resolved"
    );

    let transport: Arc<dyn Transport> = if cli.local {
        Arc::new(LocalTransport)
    } else {
        Arc::new(SshTransport::new(cli.ssh_user.clone(), cli.ssh_identity.clone()))
    };
    let runner = Arc::new(HostRunner::new(transport, RetryPolicy::default()));

    let audit = match &cli.audit_file {
        Some(path) => AuditLog::create(path)?,
        None => AuditLog::disabled(),
    };

    let ca = CaManager::new(&config.pki_dir, config.deploy_name.clone());
    let ctx = Arc::new(RunContext {
        topology,
        runner,
        config,
        facts: FactStore::default(),
        ca,
        audit: Mutex::new(audit),
    });

    let options = ExecutorOptions {
        max_parallel: cli.parallel,
        tags: if cli.tags.is_empty() {
            None
        } else {
            Some(cli.tags.iter().cloned().collect::<HashSet<_>>())
        },
    };

    let report = orchestrate::run(ctx, options).await;
    print!("{}", report.summary());
    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
