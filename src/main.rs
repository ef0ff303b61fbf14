use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use quic_sni_filter::config::{Config, LoggingConfig};
use quic_sni_filter::{ProcessResult, SniFilter};

/// 回放 hex 编码的隧道 IP 包，输出每个包的 SNI 决策
#[derive(Parser, Debug)]
#[command(name = "quic-sni-filter", version, about)]
struct Cli {
    /// 配置文件路径 (未指定时使用默认配置)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 包文件: 每行一个 hex 编码的 IP 包，`#` 开头为注释
    dump: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // 加载配置
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    // 初始化日志系统
    init_logging(&config.logging);

    info!("Starting quic-sni-filter replay...");
    if let Some(path) = &cli.config {
        info!("Configuration loaded from {}", path.display());
    }

    let filter: SniFilter<Vec<u8>> = SniFilter::from_config(&config)?;
    if !filter.is_enabled() {
        warn!("No rules configured and force_logging is off: every packet passes through");
    }

    let content = std::fs::read_to_string(&cli.dump)
        .with_context(|| format!("Failed to read packet dump: {}", cli.dump.display()))?;

    for (index, line) in content.lines().enumerate() {
        let line_no = index + 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let packet = hex::decode(line)
            .with_context(|| format!("Invalid hex on line {}", line_no))?;

        match filter.process(packet)? {
            ProcessResult::Passthrough(packet) => {
                debug!("line {}: passthrough ({} bytes)", line_no, packet.len());
            }
            ProcessResult::Buffered => {
                info!("line {}: buffered, waiting for the rest of the ClientHello", line_no);
            }
            ProcessResult::Release {
                action,
                domain,
                packets,
            } => {
                info!(
                    "line {}: {} -> {} ({} packet(s) released)",
                    line_no,
                    domain.as_deref().unwrap_or("-"),
                    action,
                    packets.len()
                );
            }
        }
    }

    filter.dispose();
    info!("Replay finished: {}", filter.stats());

    Ok(())
}

/// 初始化日志系统
fn init_logging(config: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.format == "json" {
        registry
            .with(fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_thread_ids(true))
            .init();
    }
}
