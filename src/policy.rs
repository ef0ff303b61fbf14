/// 域名策略引擎
///
/// 根据 block / include / exclude 三组规则决定一个域名的处理动作。
use crate::error::PolicyError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, trace};

/// 对一个流采取的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// 不干预，按默认路由处理
    #[default]
    None,
    /// 丢弃
    Block,
    /// 走隧道
    Include,
    /// 绕过隧道
    Exclude,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::None => "none",
            Action::Block => "block",
            Action::Include => "include",
            Action::Exclude => "exclude",
        };
        f.write_str(name)
    }
}

/// 域名策略
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    blocks: Vec<String>,
    includes: Vec<String>,
    excludes: Vec<String>,
}

impl Policy {
    /// 创建策略并校验规则
    ///
    /// 空模式、同时出现在 includes 和 excludes 中的模式都会被拒绝。
    pub fn new<S: AsRef<str>>(
        blocks: &[S],
        includes: &[S],
        excludes: &[S],
    ) -> Result<Self, PolicyError> {
        let blocks = normalize_list(blocks, "blocks")?;
        let includes = normalize_list(includes, "includes")?;
        let excludes = normalize_list(excludes, "excludes")?;

        if let Some(conflict) = includes.iter().find(|p| excludes.contains(p)) {
            return Err(PolicyError::Conflicting(conflict.clone()));
        }

        Ok(Self {
            blocks,
            includes,
            excludes,
        })
    }

    /// 没有任何规则
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.includes.is_empty() && self.excludes.is_empty()
    }

    /// 计算域名对应的动作
    ///
    /// 1. 命中 blocks → `Block`
    /// 2. includes 非空 → 命中为 `Include`，否则 `Exclude`
    /// 3. excludes 非空 → 命中为 `Exclude`，否则 `Include`
    /// 4. 其余 → `None`
    pub fn evaluate(&self, domain: &str) -> Action {
        let domain = normalize(domain);

        let action = if let Some(pattern) = find_match(&self.blocks, &domain) {
            debug!("Domain '{}' matched block pattern '{}'", domain, pattern);
            Action::Block
        } else if !self.includes.is_empty() {
            match find_match(&self.includes, &domain) {
                Some(pattern) => {
                    debug!("Domain '{}' matched include pattern '{}'", domain, pattern);
                    Action::Include
                }
                None => Action::Exclude,
            }
        } else if !self.excludes.is_empty() {
            match find_match(&self.excludes, &domain) {
                Some(pattern) => {
                    debug!("Domain '{}' matched exclude pattern '{}'", domain, pattern);
                    Action::Exclude
                }
                None => Action::Include,
            }
        } else {
            Action::None
        };

        trace!("Policy decision for '{}': {}", domain, action);
        action
    }
}

fn normalize_list<S: AsRef<str>>(
    patterns: &[S],
    list: &'static str,
) -> Result<Vec<String>, PolicyError> {
    patterns
        .iter()
        .map(|p| {
            let p = p.as_ref().trim();
            if p.is_empty() {
                Err(PolicyError::EmptyPattern { list })
            } else {
                Ok(normalize(p))
            }
        })
        .collect()
}

/// 小写化并去掉末尾的单个 `.`
fn normalize(name: &str) -> String {
    let name = name.strip_suffix('.').unwrap_or(name);
    name.to_ascii_lowercase()
}

fn find_match<'a>(patterns: &'a [String], domain: &str) -> Option<&'a str> {
    patterns
        .iter()
        .map(String::as_str)
        .find(|pattern| match_pattern(domain, pattern))
}

/// 通配符匹配
///
/// - `*` 匹配所有域名
/// - `*.google.com` 匹配 `google.com` 本身及其所有子域名
/// - 不含 `*` 的模式精确匹配
/// - 其他位置的 `*` 匹配任意字符序列，例如 `api.*.com`、`*.prod.*.internal`
fn match_pattern(domain: &str, pattern: &str) -> bool {
    // "*" 匹配所有
    if pattern == "*" {
        return true;
    }

    if !pattern.contains('*') {
        return domain == pattern;
    }

    if let Some(suffix) = pattern.strip_prefix("*.") {
        if !suffix.contains('*') {
            return domain == suffix
                || (domain.len() > suffix.len()
                    && domain.ends_with(suffix)
                    && domain.as_bytes()[domain.len() - suffix.len() - 1] == b'.');
        }
    }

    glob_match(domain, pattern)
}

/// 按 `*` 分段匹配，首尾段锚定
fn glob_match(domain: &str, pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    let (first, rest) = match parts.split_first() {
        Some(split) => split,
        None => return false,
    };

    let mut remaining = match domain.strip_prefix(first) {
        Some(remaining) => remaining,
        None => return false,
    };

    let Some((last, middle)) = rest.split_last() else {
        return remaining.is_empty();
    };

    for part in middle {
        if part.is_empty() {
            continue;
        }
        match remaining.find(part) {
            Some(idx) => remaining = &remaining[idx + part.len()..],
            None => return false,
        }
    }

    remaining.ends_with(last)
}
