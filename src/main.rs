mod cli;

use anyhow::{Context, Result};
use breaker::config::{AppConfig, LogConfig, LogWay};
use breaker::protocol::CommandRegistry;
use breaker::{bridge, portal};
use clap::Parser;
use cli::{Cli, Commands};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Check { config } => {
            init_logging(&cli.log_level, &LogConfig::default())?;
            check_config(config)?;
        }
        Commands::Template {
            template_type,
            output,
        } => {
            generate_config_template(template_type, output.as_deref())?;
        }
        Commands::Portal { config } => {
            let settings = AppConfig::load_portal_config(config)?;
            init_logging(&cli.log_level, &settings.log)?;
            info!("Breaker v{}", env!("CARGO_PKG_VERSION"));
            info!("Loaded portal configuration from: {}", config);

            let registry = Arc::new(CommandRegistry::builtin());
            portal::run_portal(settings.portal, registry).await?;
        }
        Commands::Bridge { config } => {
            let settings = AppConfig::load_bridge_config(config)?;
            init_logging(&cli.log_level, &settings.log)?;
            info!("Breaker v{}", env!("CARGO_PKG_VERSION"));
            info!("Loaded bridge configuration from: {}", config);

            let registry = Arc::new(CommandRegistry::builtin());
            bridge::run_bridge(settings.bridge, registry).await?;
        }
    }

    Ok(())
}

/// 初始化日志；RUST_LOG 优先，其次配置文件中的级别，最后是命令行参数
fn init_logging(cli_level: &str, log: &LogConfig) -> Result<()> {
    let level = log.level.as_deref().unwrap_or(cli_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match log.way {
        LogWay::Console => builder.init(),
        LogWay::File => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log.file)
                .with_context(|| format!("Failed to open log file {:?}", log.file))?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
    }
    Ok(())
}

/// Generate configuration template
fn generate_config_template(template_type: &str, output: Option<&str>) -> Result<()> {
    let content = match template_type {
        "portal" => include_str!("../templates/portal.toml"),
        "bridge" => include_str!("../templates/bridge.toml"),
        other => anyhow::bail!("Unknown template type: {}", other),
    };

    if let Some(path) = output {
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config template to {}", path))?;
        println!("Generated {} configuration template: {}", template_type, path);
    } else {
        println!("{}", content);
    }

    Ok(())
}

/// 检查配置文件
fn check_config(config_path: &str) -> Result<()> {
    let path = std::path::Path::new(config_path);
    if !path.exists() {
        anyhow::bail!("Configuration file not found: {}", config_path);
    }

    println!("Checking configuration file: {}\n", config_path);

    match AppConfig::from_file(config_path)? {
        AppConfig::Portal(settings) => {
            let portal = &settings.portal;
            println!("✓ Configuration type: Portal");
            println!("✓ Control address: {}", portal.server_addr);
            println!("✓ Proxy bind address: {}", portal.proxy_bind_addr);
            println!("✓ Worker pool capacity: {}", portal.worker_pool_capacity);
            println!("✓ Worker timeout: {}s", portal.worker_timeout_secs);
            println!("✓ Heartbeat timeout: {}s", portal.heartbeat_timeout_secs);
            println!("✓ Max frame length: {} bytes", portal.max_frame_length);
            println!("\n✓ Portal configuration is valid!");
        }
        AppConfig::Bridge(settings) => {
            let bridge = &settings.bridge;
            println!("✓ Configuration type: Bridge");
            println!("✓ Portal address: {}", bridge.server_addr);
            println!("✓ Proxy name: {}", bridge.proxy_name());
            println!(
                "✓ Mapping: remote port {} -> {}",
                bridge.remote_port,
                bridge.service_description()
            );
            println!("✓ Heartbeat interval: {:?}", bridge.heartbeat_interval());
            println!("✓ Reconnect delay: {:?}", bridge.reconnect_delay());
            println!("\n✓ Bridge configuration is valid!");
        }
    }

    Ok(())
}
