mod config;

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use lodestar_election::{
    ElectionEvent, Elector, FileRegistry, HeartbeatStrategy, MulticastDiscovery,
    RegistryStrategy, Strategy,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::{NodeConfig, StrategyKind};

#[derive(Parser)]
#[command(name = "lodestar-node", about = "lodestar leader election node")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "LODESTAR_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// election strategy: registry or heartbeat
    #[arg(short, long, env = "LODESTAR_STRATEGY")]
    strategy: Option<StrategyKind>,

    // -- registry options --
    /// registry file listing `<group> <identity>` entries
    #[arg(long, env = "LODESTAR_REGISTRY_FILE")]
    registry_file: Option<PathBuf>,

    /// registry group this node belongs to
    #[arg(long, env = "LODESTAR_GROUP")]
    group: Option<String>,

    /// file holding this node's identity
    #[arg(long, env = "LODESTAR_IDENTITY_FILE")]
    identity_file: Option<PathBuf>,

    /// read the identity from this field of a JSON identity file
    #[arg(long, env = "LODESTAR_IDENTITY_FIELD")]
    identity_field: Option<String>,

    /// how many times to look for the identity before giving up
    #[arg(long, env = "LODESTAR_IDENTITY_ATTEMPTS")]
    identity_attempts: Option<u32>,

    /// seconds between leader rechecks of the registry
    #[arg(long, env = "LODESTAR_RECHECK_INTERVAL_SECS")]
    recheck_interval_secs: Option<u64>,

    /// seconds between registry polls while following
    #[arg(long, env = "LODESTAR_REGISTRY_POLL_SECS")]
    registry_poll_secs: Option<u64>,

    // -- heartbeat options --
    /// group name the leader advertises
    #[arg(long, env = "LODESTAR_NAME")]
    name: Option<String>,

    /// discovery service type
    #[arg(long, env = "LODESTAR_SERVICE_TYPE")]
    service_type: Option<String>,

    /// address the leader's heartbeat responder binds to
    #[arg(long, env = "LODESTAR_HOST")]
    host: Option<IpAddr>,

    /// heartbeat port
    #[arg(short, long, env = "LODESTAR_PORT")]
    port: Option<u16>,

    /// missed heartbeats tolerated before re-electing
    #[arg(long, env = "LODESTAR_MAX_FAILED_RESPONSES")]
    max_failed_responses: Option<u32>,

    /// milliseconds between heartbeats
    #[arg(long, env = "LODESTAR_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    // -- backoff --
    /// seconds to wait after a throttled request
    #[arg(long, env = "LODESTAR_THROTTLED_BACKOFF_SECS")]
    throttled_backoff_secs: Option<u64>,

    /// seconds to wait after a transient failure
    #[arg(long, env = "LODESTAR_TRANSIENT_BACKOFF_SECS")]
    transient_backoff_secs: Option<u64>,
}

/// Applies CLI overrides to a `NodeConfig`. Only `Some` values take
/// effect, giving the order defaults → TOML file → env vars → CLI flags.
fn apply_args(cfg: &mut NodeConfig, args: &Args) {
    if let Some(kind) = args.strategy {
        cfg.strategy = kind;
    }
    if let Some(ref v) = args.registry_file {
        cfg.registry.file = v.clone();
    }
    if let Some(ref v) = args.group {
        cfg.registry.group = v.clone();
    }
    if let Some(ref v) = args.identity_file {
        cfg.registry.identity_file = v.clone();
    }
    if let Some(ref v) = args.identity_field {
        cfg.registry.identity_field = Some(v.clone());
    }
    if let Some(v) = args.identity_attempts {
        cfg.registry.identity_attempts = v;
    }
    if let Some(v) = args.recheck_interval_secs {
        cfg.registry.recheck_interval_secs = v;
    }
    if let Some(v) = args.registry_poll_secs {
        cfg.registry.poll_interval_secs = v;
    }
    if let Some(ref v) = args.name {
        cfg.heartbeat.name = v.clone();
    }
    if let Some(ref v) = args.service_type {
        cfg.heartbeat.service_type = v.clone();
    }
    if let Some(v) = args.host {
        cfg.heartbeat.host = v;
    }
    if let Some(v) = args.port {
        cfg.heartbeat.port = v;
    }
    if let Some(v) = args.max_failed_responses {
        cfg.heartbeat.max_failed_responses = v;
    }
    if let Some(v) = args.poll_interval_ms {
        cfg.heartbeat.poll_interval_ms = v;
    }
    if let Some(v) = args.throttled_backoff_secs {
        cfg.backoff.throttled_secs = v;
    }
    if let Some(v) = args.transient_backoff_secs {
        cfg.backoff.transient_secs = v;
    }
}

/// Prints `msg` to stderr and exits with code 1.
fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

/// How the event loop ended.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    /// Ctrl-C; the elector was shut down cleanly.
    Interrupted,
    /// The election loop halted on its own, after an error.
    Halted,
}

/// Logs events until the loop halts or the process is interrupted.
async fn watch_events<S: Strategy>(
    mut elector: Elector<S>,
    mut events: mpsc::Receiver<ElectionEvent>,
) -> Outcome {
    elector.start();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ElectionEvent::Leader) => info!(role = "leader", "role changed"),
                Some(ElectionEvent::Follower) => info!(role = "follower", "role changed"),
                Some(ElectionEvent::Reelection) => info!("reelection"),
                Some(ElectionEvent::Error(e)) => {
                    warn!(class = %e.class(), "election error: {e}");
                }
                None => {
                    error!("election loop halted");
                    return Outcome::Halted;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                elector.shutdown().await;
                return Outcome::Interrupted;
            }
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lodestar=info".into()),
        )
        .init();

    let args = Args::parse();

    // --config-template: dump defaults and exit
    if args.config_template {
        match NodeConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    // build NodeConfig: defaults → TOML file → CLI/env overrides
    let mut cfg = match &args.config {
        Some(path) => NodeConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => NodeConfig::default(),
    };
    apply_args(&mut cfg, &args);

    let outcome = match cfg.strategy {
        StrategyKind::Registry => {
            let registry_config = cfg
                .registry_config()
                .unwrap_or_else(|e| exit_err(format!("invalid registry config: {e}")));
            let registry = FileRegistry::new(&cfg.registry.file, cfg.file_registry_config());
            info!(
                file = %cfg.registry.file.display(),
                group = %cfg.registry.group,
                "using registry strategy"
            );
            let strategy = RegistryStrategy::new(registry, cfg.identity_source(), registry_config);
            let (elector, events) = Elector::new(strategy, cfg.elector_config());
            watch_events(elector, events).await
        }
        StrategyKind::Heartbeat => {
            let discovery = MulticastDiscovery::new(cfg.multicast_config());
            let strategy = HeartbeatStrategy::new(discovery, cfg.heartbeat_config())
                .unwrap_or_else(|e| exit_err(format!("invalid heartbeat config: {e}")));
            info!(
                name = %cfg.heartbeat.name,
                port = cfg.heartbeat.port,
                "using heartbeat strategy"
            );
            let (elector, events) = Elector::new(strategy, cfg.elector_config());
            watch_events(elector, events).await
        }
    };

    if outcome == Outcome::Halted {
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("lodestar-node").chain(argv.iter().copied()))
            .unwrap()
    }

    #[test]
    fn flags_override_file_values() {
        let mut cfg = NodeConfig::from_toml(
            r#"
            strategy = "heartbeat"
            [heartbeat]
            name = "from-file"
            port = 7000
            "#,
        )
        .unwrap();
        let args = parse(&["--name", "from-flag", "--strategy", "registry"]);
        apply_args(&mut cfg, &args);

        assert_eq!(cfg.strategy, StrategyKind::Registry);
        assert_eq!(cfg.heartbeat.name, "from-flag");
        // untouched by the command line
        assert_eq!(cfg.heartbeat.port, 7000);
    }

    #[test]
    fn absent_flags_change_nothing() {
        let mut cfg = NodeConfig::default();
        apply_args(&mut cfg, &parse(&[]));
        assert_eq!(cfg, NodeConfig::default());
    }

    #[test]
    fn registry_flags() {
        let mut cfg = NodeConfig::default();
        let args = parse(&[
            "--group",
            "web",
            "--registry-file",
            "/tmp/members",
            "--identity-field",
            "TaskARN",
            "--transient-backoff-secs",
            "5",
        ]);
        apply_args(&mut cfg, &args);
        assert_eq!(cfg.registry.group, "web");
        assert_eq!(cfg.registry.file, PathBuf::from("/tmp/members"));
        assert_eq!(cfg.registry.identity_field.as_deref(), Some("TaskARN"));
        assert_eq!(cfg.backoff.transient_secs, 5);
    }

    #[test]
    fn bad_strategy_flag_is_rejected() {
        let res = Args::try_parse_from(["lodestar-node", "--strategy", "raft"]);
        assert!(res.is_err());
    }
}
