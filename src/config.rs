use crate::error::PolicyError;
use crate::filter::FilterOptions;
use crate::policy::Policy;
use crate::quic::reassembly::ReassemblyLimits;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub rules: RulesConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 日志格式: json, pretty
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// 没有任何规则时也解析并记录 SNI
    #[serde(default)]
    pub force_logging: bool,
    /// 流空闲超时(毫秒)
    #[serde(default = "default_flow_timeout_ms")]
    pub flow_timeout_ms: u64,
    /// 两次清理之间的最小间隔(毫秒)
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// 单个流最多重组的 CRYPTO 字节数
    #[serde(default = "default_max_crypto_bytes")]
    pub max_crypto_bytes: usize,
    /// 单个流最多检查的 Initial 包数
    #[serde(default = "default_max_initial_packets")]
    pub max_initial_packets: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            force_logging: false,
            flow_timeout_ms: default_flow_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            max_crypto_bytes: default_max_crypto_bytes(),
            max_initial_packets: default_max_initial_packets(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RulesConfig {
    /// 阻断的域名模式
    #[serde(default)]
    pub blocks: Vec<String>,
    /// 走隧道的域名模式，非空时其余域名全部绕过
    #[serde(default)]
    pub includes: Vec<String>,
    /// 绕过隧道的域名模式，includes 为空时生效
    #[serde(default)]
    pub excludes: Vec<String>,
}

// 默认值函数
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_flow_timeout_ms() -> u64 {
    500
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_max_crypto_bytes() -> usize {
    ReassemblyLimits::default().max_crypto_bytes
}

fn default_max_initial_packets() -> usize {
    ReassemblyLimits::default().max_packets
}

impl Config {
    /// 从文件加载配置
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// 从 TOML 字符串解析配置
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Invalid TOML configuration")?;
        // 提前校验规则，避免运行时才发现冲突
        config.policy()?;
        Ok(config)
    }

    /// 保存配置到文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// 由 `[rules]` 构建域名策略
    pub fn policy(&self) -> std::result::Result<Policy, PolicyError> {
        Policy::new(&self.rules.blocks, &self.rules.includes, &self.rules.excludes)
    }

    /// 由 `[filter]` 构建过滤器参数
    pub fn filter_options(&self) -> FilterOptions {
        FilterOptions {
            force_logging: self.filter.force_logging,
            flow_timeout: Duration::from_millis(self.filter.flow_timeout_ms),
            sweep_interval: Duration::from_millis(self.filter.sweep_interval_ms),
            limits: ReassemblyLimits {
                max_crypto_bytes: self.filter.max_crypto_bytes,
                max_packets: self.filter.max_initial_packets,
            },
        }
    }
}
