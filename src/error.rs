//! 过滤器错误类型
use thiserror::Error;

/// 域名策略无效
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// 空模式或只含空白的模式
    #[error("Empty pattern in {list} list")]
    EmptyPattern { list: &'static str },

    /// 同一模式同时出现在 include 和 exclude 中
    #[error("Pattern '{0}' is listed in both includes and excludes")]
    Conflicting(String),
}

/// 返回给过滤器调用方的错误
#[derive(Error, Debug)]
pub enum FilterError {
    /// 过滤器已释放，不再接受数据包
    #[error("Filter has been disposed")]
    Disposed,

    #[error("Invalid policy: {0}")]
    Policy(#[from] PolicyError),
}

pub type Result<T> = std::result::Result<T, FilterError>;
