use std::path::Path;

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use sluice::{
    TrafficCore, TrafficPorts,
    config::{GatewayConfigValidator, load_config},
    metrics::MetricsRecorder,
    tracing_setup,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "sluice.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "sluice.toml")]
        config: String,
    },
    /// Run one health-check cycle against every configured instance
    Probe {
        #[clap(short, long, default_value = "sluice.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    match Args::parse().command {
        Commands::Validate { config } => validate_config_command(&config).await,
        Commands::Init { config } => init_config_command(&config).await,
        Commands::Probe { config } => probe_command(&config).await,
    }
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        return Err(eyre!("Configuration file '{config_path}' not found"));
    }

    let config = load_config(config_path)
        .await
        .wrap_err("Configuration parsing failed")?;
    println!("✅ Configuration parsing: OK");

    match GatewayConfigValidator::validate(&config) {
        Ok(()) => {
            let instances: usize = config.services.values().map(|s| s.instances.len()).sum();
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Services: {}", config.services.len());
            println!("   • Instances: {instances}");
            println!("   • Health Checks: {}", config.health_check.enabled);
            println!("   • Cache: {}", config.cache.enabled);
            println!("   • Cache Rules: {}", config.dispatcher.cache_rules.len());
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure all instance URLs start with http:// or https://");
            println!("   • Give every instance of a service a unique name");
            println!("   • Use human-readable cache rule TTLs (e.g. '90s', '5m')");
            Err(eyre!("Configuration '{config_path}' is invalid"))
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        return Err(eyre!("Configuration file '{config_path}' already exists"));
    }

    let default_config = r#"# Sluice traffic-resilience configuration

[services.generation]
health_path = "/health"

[[services.generation.instances]]
name = "generation-1"
url = "http://localhost:8001"
weight = 1.0

[[services.generation.instances]]
name = "generation-2"
url = "http://localhost:8002"
weight = 1.0

[health_check]
enabled = true
interval_secs = 30
timeout_secs = 5
unhealthy_threshold = 3
healthy_threshold = 2
max_response_time_ms = 5000

[circuit_breaker]
failure_threshold = 10.0
window_secs = 60
recovery_timeout_secs = 30
half_open_max_calls = 3

[pool]
max_connections = 100
max_idle_connections = 20
keep_alive_secs = 30
request_timeout_secs = 30

[cache]
enabled = true
local_max_items = 1000
default_ttl_secs = 300

# Shared remote tier, e.g. Redis, is wired in by the embedding application.

[[dispatcher.cache_rules]]
methods = ["GET"]
path = "/models/**"
ttl = "5m"
tags = ["models"]
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'sluice validate --config {config_path}' to check it");
    Ok(())
}

/// Probe every instance once and print the resulting health table
async fn probe_command(config_path: &str) -> Result<()> {
    tracing_setup::init_console_tracing()?;

    let config = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    let ports = TrafficPorts::http()?.with_metrics(std::sync::Arc::new(MetricsRecorder::new()));
    let core = TrafficCore::new(config, ports).await?;

    let mut reports = core.health_checker().check_once().await;
    reports.sort_by(|a, b| (&a.service, &a.instance).cmp(&(&b.service, &b.instance)));

    for report in &reports {
        let status = report
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "deregistered".to_string());
        println!(
            "{:<20} {:<20} {:<10} {:?}  {}",
            report.service, report.instance, status, report.outcome, report.url
        );
    }

    core.stop().await;
    Ok(())
}
