//! anxccm-lbaas: converge LBaaS resources onto a service definition.
//!
//! Drives the reconciliation engine against an in-memory provider whose
//! state is kept in a JSON file between runs, which makes it usable as an
//! offline planner:
//! - `check` shows what a reconciliation would create and destroy
//! - `reconcile` converges every given load balancer, concurrently
//! - `status` lists the bound addresses and ports

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use anxccm_lbaas::{
    DirectState, Identifier, InMemoryLbaas, LbaasApi, LbaasError, MemoryState, ReconcileConfig,
    Reconciliation, ServiceDefinition, StateRetriever, StateSource,
};

/// LBaaS reconciliation engine
#[derive(Parser, Debug)]
#[command(name = "anxccm-lbaas", version, about)]
struct Cli {
    /// Provider state file, created if missing
    #[arg(long, default_value = "lbaas-state.json")]
    state: PathBuf,

    /// Service definition (JSON)
    #[arg(long)]
    service: PathBuf,

    /// Load balancer to reconcile (can be repeated)
    #[arg(long = "load-balancer", required = true)]
    load_balancers: Vec<String>,

    /// Reconciliation settings (JSON), defaults apply for missing fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of polls a new object stays progressing
    #[arg(long, default_value = "0")]
    ready_after: u32,

    /// Override the readiness backoff step budget
    #[arg(long)]
    backoff_steps: Option<u32>,

    /// Override the initial readiness backoff interval in milliseconds
    #[arg(long)]
    backoff_initial_ms: Option<u64>,

    /// Override the maximum number of reconciliation cycles
    #[arg(long)]
    max_cycles: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show what would be created and destroyed
    Check,

    /// Converge the load balancers onto the service
    Reconcile {
        /// Remove everything belonging to the service instead
        #[arg(long)]
        delete: bool,
    },

    /// Show bound addresses and ports
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "anxccm_lbaas=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let service = load_service(&cli.service).await?;
    let config = load_config(&cli).await?;
    let load_balancers: Vec<Identifier> = cli
        .load_balancers
        .iter()
        .map(|lb| Identifier::from(lb.as_str()))
        .collect();

    let api = Arc::new(InMemoryLbaas::from_state(load_state(&cli.state).await?));
    api.configure(|f| f.ready_after_polls = cli.ready_after);
    for lb in &load_balancers {
        api.add_load_balancer(lb.clone());
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received SIGINT, canceling");
                cancel.cancel();
            }
        });
    }

    info!(
        service = %service.name,
        load_balancers = load_balancers.len(),
        "Starting {:?}",
        cli.command
    );

    let outcome = match cli.command {
        Commands::Check => check(api.clone(), &load_balancers, &service, &config, &cancel).await,
        Commands::Status => status(api.clone(), &load_balancers, &service, &config, &cancel).await,
        Commands::Reconcile { delete } => {
            let service = if delete { service.emptied() } else { service };
            let results =
                reconcile_all(api.clone(), load_balancers, service, config, cancel).await;
            let failed = results.iter().filter(|(_, r)| r.is_err()).count();
            for (lb, result) in results {
                match result {
                    Ok(()) => println!("{lb}: converged"),
                    Err(e) => println!("{lb}: {e}"),
                }
            }
            if failed > 0 {
                Err(anyhow::anyhow!("{failed} load balancer(s) failed to converge"))
            } else {
                Ok(())
            }
        }
    };

    // Partial progress is real provider state, keep it even on failure.
    save_state(&cli.state, &api.state()).await?;
    outcome
}

async fn check(
    api: Arc<InMemoryLbaas>,
    load_balancers: &[Identifier],
    service: &ServiceDefinition,
    config: &ReconcileConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    for lb in load_balancers {
        let mut reconciliation = Reconciliation::direct(
            api.clone(),
            lb.clone(),
            service.clone(),
            config.clone(),
            cancel.clone(),
        );
        match reconciliation.reconcile_check().await {
            Ok(plan) if plan.is_empty() => println!("{lb}: up to date"),
            Ok(plan) => {
                for resource in &plan.destroy {
                    println!("{lb}: destroy {resource}");
                }
                for resource in &plan.create {
                    println!("{lb}: create {resource}");
                }
            }
            Err(LbaasError::ResourceProgressing { identifiers }) => {
                println!("{lb}: {} resources still progressing", identifiers.len());
            }
            Err(e) => return Err(e).with_context(|| format!("check of {lb} failed")),
        }
    }
    Ok(())
}

async fn status(
    api: Arc<InMemoryLbaas>,
    load_balancers: &[Identifier],
    service: &ServiceDefinition,
    config: &ReconcileConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    for lb in load_balancers {
        let mut reconciliation = Reconciliation::direct(
            api.clone(),
            lb.clone(),
            service.clone(),
            config.clone(),
            cancel.clone(),
        );
        let bound = reconciliation
            .status()
            .await
            .with_context(|| format!("status of {lb} failed"))?;
        if bound.is_empty() {
            println!("{lb}: nothing bound");
        }
        for (address, ports) in bound {
            let ports: Vec<String> = ports.iter().map(u16::to_string).collect();
            println!("{lb}: {address} {}", ports.join(","));
        }
    }
    Ok(())
}

/// Reconcile every load balancer in its own task. More than one load
/// balancer share their snapshots through a `StateRetriever`.
async fn reconcile_all(
    api: Arc<InMemoryLbaas>,
    load_balancers: Vec<Identifier>,
    service: ServiceDefinition,
    config: ReconcileConfig,
    cancel: CancellationToken,
) -> Vec<(Identifier, anxccm_lbaas::Result<()>)> {
    let api: Arc<dyn LbaasApi> = api;
    let state: Arc<dyn StateSource> = if load_balancers.len() > 1 {
        Arc::new(StateRetriever::new(
            Arc::clone(&api),
            service.tag(),
            load_balancers.iter().cloned(),
        ))
    } else {
        Arc::new(DirectState::new(Arc::clone(&api), service.tag()))
    };

    let mut tasks = JoinSet::new();
    for lb in load_balancers {
        let mut reconciliation = Reconciliation::new(
            Arc::clone(&api),
            Arc::clone(&state),
            lb.clone(),
            service.clone(),
            config.clone(),
            cancel.child_token(),
        );
        tasks.spawn(async move {
            let result = reconciliation.reconcile().await;
            if let Err(e) = &result {
                warn!(lb = %lb, "Reconciliation failed: {}", e);
            }
            (lb, result)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => error!("Reconciliation task failed: {}", e),
        }
    }
    results
}

async fn load_service(path: &Path) -> Result<ServiceDefinition> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read service definition {}", path.display()))?;
    let service: ServiceDefinition = serde_json::from_str(&raw)
        .with_context(|| format!("invalid service definition {}", path.display()))?;
    if service.uid.is_empty() {
        bail!("service definition {} has no uid", path.display());
    }
    Ok(service)
}

async fn load_config(cli: &Cli) -> Result<ReconcileConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => ReconcileConfig::default(),
    };
    if let Some(steps) = cli.backoff_steps {
        config.backoff.steps = steps;
    }
    if let Some(initial_ms) = cli.backoff_initial_ms {
        config.backoff.initial_ms = initial_ms;
    }
    if let Some(max_cycles) = cli.max_cycles {
        config.max_cycles = max_cycles;
    }
    config
        .validate()
        .context("invalid reconciliation settings")?;
    Ok(config)
}

/// Read the provider state, starting empty if the file does not exist yet.
async fn load_state(path: &Path) -> Result<MemoryState> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        info!("No provider state at {}, starting empty", path.display());
        return Ok(MemoryState::default());
    }
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read provider state {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("invalid provider state {}", path.display()))
}

async fn save_state(path: &Path, state: &MemoryState) -> Result<()> {
    let raw = serde_json::to_string_pretty(state)?;
    tokio::fs::write(path, raw)
        .await
        .with_context(|| format!("failed to write provider state {}", path.display()))
}

#[cfg(test)]
mod tests {
    use anxccm_lbaas::{Backend, HealthCheck, Mode, ProviderStatus, Resource, Tag};

    use super::*;

    #[tokio::test]
    async fn test_missing_state_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = load_state(&dir.path().join("absent.json")).await.unwrap();
        assert_eq!(state, MemoryState::default());
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let api = InMemoryLbaas::new();
        api.add_load_balancer("lb-1");
        let tag = Tag::for_service("uid-1");
        api.insert(
            Resource::from(Backend {
                identifier: None,
                name: "http.default.web".into(),
                load_balancer: "lb-1".into(),
                mode: Mode::Tcp,
                health_check: HealthCheck::Tcp,
                status: ProviderStatus::READY,
            }),
            std::slice::from_ref(&tag),
        );
        save_state(&path, &api.state()).await.unwrap();

        let restored = InMemoryLbaas::from_state(load_state(&path).await.unwrap());
        assert_eq!(restored.state(), api.state());
        assert_eq!(restored.tagged(&tag).len(), 1);
    }

    fn cli_with_config(path: &Path) -> Cli {
        Cli::try_parse_from([
            "anxccm-lbaas",
            "--service",
            "service.json",
            "--load-balancer",
            "lb-1",
            "--config",
            path.to_str().unwrap(),
            "check",
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_config_file_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"max_cycles": 4, "backoff": {"steps": 3}}"#).unwrap();

        let mut cli = cli_with_config(&path);
        cli.max_cycles = Some(7);
        let config = load_config(&cli).await.unwrap();
        assert_eq!(config.max_cycles, 7);
        assert_eq!(config.backoff.steps, 3);
    }

    #[tokio::test]
    async fn test_invalid_backoff_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        for raw in [
            r#"{"backoff": {"factor": -1.0}}"#,
            r#"{"backoff": {"jitter": 5.0}}"#,
            r#"{"backoff": {"initial_ms": 2000, "cap_ms": 10}}"#,
        ] {
            std::fs::write(&path, raw).unwrap();
            let err = load_config(&cli_with_config(&path)).await.unwrap_err();
            assert!(
                format!("{err:#}").contains("invalid configuration"),
                "{raw}: {err:#}"
            );
        }
    }

    #[tokio::test]
    async fn test_service_without_uid_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.json");
        std::fs::write(&path, r#"{"name": "default.web", "uid": ""}"#).unwrap();

        assert!(load_service(&path).await.is_err());
    }
}
