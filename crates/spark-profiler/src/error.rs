//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为剖析会话构建期的全部失败路径提供集中定义：会话冲突、步骤失衡、时钟误用、并发误用；
//! - 构建期错误在违反约束的调用点立即返回。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，同时满足 `Clone + Eq`，便于测试直接断言；
//! - 结构等价校验的差异 **不** 在此定义，它属于 `spark-profiler-tck`，以值的形式返回而非错误传播。

use thiserror::Error;

/// crate 内统一的 `Result` 别名。
pub type Result<T, E = ProfilerError> = core::result::Result<T, E>;

/// 剖析器核心错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：聚合会话生命周期、步骤栈与时钟推进中的非法操作，调用方可按变体精确处理；
/// - **契约 (What)**：变体携带可读上下文（上下文键、步骤名等），`Display` 输出面向日志；
/// - **设计权衡 (Trade-offs)**：上下文使用 `String` 保存，牺牲少量分配换取诊断可读性。
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProfilerError {
    /// 同一上下文已存在活跃会话时再次调用 `start`。
    #[error("a profiling session is already active for context `{context}`")]
    ConflictingSession { context: String },

    /// 步骤栈失衡：`stop` 时仍有非根步骤未关闭，或步骤在其子步骤之前被关闭。
    ///
    /// `open` 按从外到内的顺序列出被强制关闭的步骤名。
    #[error("step `{step}` closed while descendants were still open: {open:?}")]
    UnbalancedStep { step: String, open: Vec<String> },

    /// 请求以负数推进时钟。
    #[error("clock cannot be advanced by a negative amount ({millis} ms)")]
    InvalidClockAdvance { millis: i64 },

    /// 另一个执行线程正在操作同一会话。
    #[error("session `{session}` is being mutated concurrently")]
    ConcurrentAccess { session: String },

    /// 步骤名、分类名或上下文描述为空。
    #[error("{what} must not be empty")]
    EmptyName { what: &'static str },

    /// 存储协作方返回的失败。
    #[error("session storage failure: {detail}")]
    Storage { detail: String },

    /// 配置解析或校验失败。
    #[error("invalid profiler configuration: {detail}")]
    Configuration { detail: String },
}

impl ProfilerError {
    pub(crate) fn storage(detail: impl core::fmt::Display) -> Self {
        ProfilerError::Storage {
            detail: detail.to_string(),
        }
    }

    pub(crate) fn configuration(detail: impl core::fmt::Display) -> Self {
        ProfilerError::Configuration {
            detail: detail.to_string(),
        }
    }

    /// 是否属于构建期（调用方编程错误）而非协作方故障。
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            ProfilerError::ConflictingSession { .. }
                | ProfilerError::UnbalancedStep { .. }
                | ProfilerError::ConcurrentAccess { .. }
                | ProfilerError::EmptyName { .. }
        )
    }
}
