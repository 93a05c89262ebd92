use clap::Parser;
use mcp_hub::config::{ConfigEvent, ConfigManager, ConfigValidator, HubConfig};
use mcp_hub::core::{
    AdapterFactory, FirstActiveSelector, HubDirectory, InMemoryDirectory, LoadBalancer,
    LoadBalancingStrategy, Router, ServerSelector,
};
use mcp_hub::utils::{init_tracing, ShutdownCoordinator};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "mcp-hub")]
#[command(about = "Route tool calls across stdio, SSE and HTTP tool servers")]
#[command(version)]
enum Cli {
    /// Run the hub until interrupted
    Serve(ServeArgs),
    /// Check a configuration file and exit
    Validate(ValidateArgs),
    /// Print the configuration JSON schema
    Schema,
}

#[derive(Parser)]
struct ServeArgs {
    /// Configuration file path (TOML, YAML or JSON)
    #[arg(short, long, env = "MCP_HUB_CONFIG", default_value = "~/.config/mcp-hub/config.toml")]
    config: String,
    /// Log filter, overrides the configured level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Parser)]
struct ValidateArgs {
    #[arg(short, long, env = "MCP_HUB_CONFIG", default_value = "~/.config/mcp-hub/config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse() {
        Cli::Serve(args) => serve(args).await,
        Cli::Validate(args) => {
            match ConfigValidator::new().validate_file(&args.config).await {
                Ok(config) => {
                    println!(
                        "{} is valid: {} servers, {} groups, {} endpoints",
                        args.config,
                        config.servers.len(),
                        config.groups.len(),
                        config.endpoints.len()
                    );
                    Ok(())
                }
                Err(errors) => {
                    for e in &errors {
                        eprintln!("{}", e);
                    }
                    anyhow::bail!("{} validation error(s) in {}", errors.len(), args.config)
                }
            }
        }
        Cli::Schema => {
            println!("{}", ConfigValidator::new().export_schema());
            Ok(())
        }
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config_manager = Arc::new(ConfigManager::new(&args.config).await?);
    let config = config_manager.get_config();
    init_tracing(&config.logging, args.log_level.as_deref());

    info!("Starting mcp-hub");
    info!("Config file: {}", config_manager.path().display());

    if let Err(errors) = ConfigValidator::new().validate(&config) {
        for e in &errors {
            error!("Invalid configuration: {}", e);
        }
        anyhow::bail!("configuration has {} error(s)", errors.len());
    }

    let directory = Arc::new(InMemoryDirectory::from_config(&config));
    let factory = Arc::new(AdapterFactory::new(config.factory.clone()));
    factory.start_health_monitor();

    let load_balancer = Arc::new(LoadBalancer::from_config(&config.load_balancer));
    load_balancer.load_group_weights(&config.groups)?;
    let selector: Arc<dyn ServerSelector> = match load_balancer.strategy() {
        LoadBalancingStrategy::FirstActive => Arc::new(FirstActiveSelector),
        strategy => {
            info!("Load balancing enabled: {}", strategy);
            load_balancer.clone() as Arc<dyn ServerSelector>
        }
    };
    let router = Router::with_selector(factory.clone(), directory.clone(), selector);

    for server in config.servers.iter().filter(|s| s.is_active()) {
        info!("Configuring server: {}", server.id);
        if let Err(e) = factory.create_adapter(&server.id, &server.connection).await {
            error!("Failed to start server {}: {}", server.id, e);
        }
    }
    for endpoint in &config.endpoints {
        let tools = router.get_available_tools(&endpoint.id).await;
        info!("Endpoint {} exposes {} tools", endpoint.id, tools.len());
    }

    let shutdown = ShutdownCoordinator::new();
    let reload_task = {
        let stop = shutdown.token();
        let config_manager = config_manager.clone();
        let directory = directory.clone();
        let factory = factory.clone();
        let load_balancer = load_balancer.clone();
        let mut events = config_manager.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = stop.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(ConfigEvent::Reloaded) => {
                        let config = config_manager.get_config();
                        apply_reload(&config, &directory, &factory, &load_balancer).await;
                    }
                    Ok(ConfigEvent::Error(e)) => warn!("Keeping previous configuration: {}", e),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Missed {} configuration events", n)
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    shutdown.wait_for_shutdown_signal().await;

    if let Err(e) = reload_task.await {
        warn!("Reload task ended abnormally: {}", e);
    }
    factory.graceful_shutdown().await;
    info!("mcp-hub stopped");
    Ok(())
}

async fn apply_reload(
    config: &HubConfig,
    directory: &InMemoryDirectory,
    factory: &AdapterFactory,
    load_balancer: &LoadBalancer,
) {
    if let Err(errors) = ConfigValidator::new().validate(config) {
        warn!("Ignoring reloaded configuration with {} error(s)", errors.len());
        return;
    }

    let previous = directory.all_servers();
    directory.replace_from_config(config);
    if let Err(e) = load_balancer.load_group_weights(&config.groups) {
        warn!("Failed to apply group weights: {}", e);
    }

    let kept: HashSet<&str> = config
        .servers
        .iter()
        .filter(|s| s.is_active())
        .map(|s| s.id.as_str())
        .collect();
    for server in previous {
        let unchanged = directory
            .server(&server.id)
            .map(|current| current.connection == server.connection)
            .unwrap_or(false);
        if !kept.contains(server.id.as_str()) || !unchanged {
            let removed = factory.remove_adapters_by_server(&server.id).await;
            if removed > 0 {
                info!("Stopped {} adapter(s) of server {} after reload", removed, server.id);
            }
        }
    }
    info!("Configuration reloaded: {} servers", config.servers.len());
}
