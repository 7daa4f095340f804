//! # Profiler：会话装配与上下文仓储
//!
//! ## 核心意图（Why）
//! - 持有注入的时钟、配置与存储，并以 `DashMap` 记录“哪个上下文正有活跃会话”，
//!   保证同一上下文同一时刻至多一个会话，不同上下文的会话可以并发存在；
//! - 上下文通过 [`ProfilingContext`] 显式传入，不依赖线程局部状态。
//!
//! ## 行为契约（What）
//! - `start`：若上下文键已被占用，返回 [`ProfilerError::ConflictingSession`]；
//! - 活跃会话停止或被丢弃时自动释放上下文键；
//! - `Profiler` 可廉价克隆，克隆体共享同一份仓储。
//!
//! ## 风险提示（Trade-offs）
//! - 仓储只记录上下文到会话 ID 的映射，会话本体由调用方持有；
//!   持有 `ActiveSession` 不释放会让该上下文一直处于占用状态。

use std::fmt;
use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::ProfilerOptions;
use crate::error::{ProfilerError, Result};
use crate::model::Session;
use crate::session::ActiveSession;
use crate::storage::SessionStorage;

/// 开始会话时显式传入的执行上下文。
///
/// # 教案式说明
/// - **意图 (Why)**：替代“当前请求”的环境状态；同一个键代表同一个逻辑执行流；
/// - **契约 (What)**：`key` 用于冲突检测，`descriptor` 成为根步骤与会话的名称，默认与 `key` 相同；
///   `user` 为可选的发起者标识。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProfilingContext {
    key: Arc<str>,
    descriptor: String,
    user: Option<String>,
}

impl ProfilingContext {
    /// 以描述同时作为上下文键，例如请求路径 `"/orders"`。
    pub fn new(descriptor: impl Into<String>) -> Self {
        let descriptor = descriptor.into();
        Self {
            key: Arc::from(descriptor.as_str()),
            descriptor,
            user: None,
        }
    }

    /// 使用独立的上下文键（例如请求 ID），允许同一路径的多个请求并发剖析。
    pub fn with_key(key: impl Into<String>, descriptor: impl Into<String>) -> Self {
        Self {
            key: Arc::from(key.into()),
            descriptor: descriptor.into(),
            user: None,
        }
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }
}

/// 所有会话共享的装配结果。
pub(crate) struct ProfilerShared {
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) options: ProfilerOptions,
    pub(crate) storage: Option<Arc<dyn SessionStorage>>,
    active: DashMap<Arc<str>, Uuid>,
}

impl ProfilerShared {
    /// 释放上下文键；只移除仍指向 `session` 的条目，避免误删后继会话。
    pub(crate) fn release(&self, context: &Arc<str>, session: Uuid) {
        self.active.remove_if(context, |_, owner| *owner == session);
    }
}

impl fmt::Debug for ProfilerShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfilerShared")
            .field("options", &self.options)
            .field("storage", &self.storage.is_some())
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}

/// 剖析器入口。
#[derive(Clone, Debug)]
pub struct Profiler {
    shared: Arc<ProfilerShared>,
}

impl Profiler {
    /// 使用默认配置、无存储的剖析器。
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::builder().clock(clock).build_unchecked()
    }

    pub fn builder() -> ProfilerBuilder {
        ProfilerBuilder::default()
    }

    /// 为 `context` 开始一个新会话并打开根步骤。
    ///
    /// # 教案式注释
    /// - **意图 (Why)**：原子地占用上下文键，阻止同一执行流里出现两个交错的会话；
    /// - **契约 (What)**：
    ///   - 描述为空时返回 [`ProfilerError::EmptyName`]；
    ///   - 键已被占用时返回 [`ProfilerError::ConflictingSession`]；
    ///   - 成功时根步骤已打开，`started_at` 取自时钟的墙钟时间。
    pub fn start(&self, context: &ProfilingContext) -> Result<ActiveSession> {
        if context.descriptor.trim().is_empty() {
            return Err(ProfilerError::EmptyName {
                what: "context descriptor",
            });
        }
        match self.shared.active.entry(Arc::clone(&context.key)) {
            Entry::Occupied(_) => Err(ProfilerError::ConflictingSession {
                context: context.key.to_string(),
            }),
            Entry::Vacant(vacant) => {
                let session = ActiveSession::open(
                    Arc::clone(&self.shared),
                    Arc::clone(&context.key),
                    context.descriptor.clone(),
                    context.user.clone(),
                );
                vacant.insert(session.id());
                tracing::debug!(
                    session = %session.id(),
                    context = %context.key,
                    "session started"
                );
                Ok(session)
            }
        }
    }

    /// 该上下文当前是否有活跃会话。
    pub fn is_active(&self, context_key: &str) -> bool {
        self.shared.active.contains_key(context_key)
    }

    /// 活跃会话数量。
    pub fn active_sessions(&self) -> usize {
        self.shared.active.len()
    }

    /// 按配置的小数位与琐碎阈值渲染会话文本树。
    pub fn render(&self, session: &Session) -> String {
        let options = &self.shared.options;
        session.render_filtered(
            usize::from(options.decimal_places),
            options.trivial_threshold_ms,
        )
    }

    pub fn options(&self) -> &ProfilerOptions {
        &self.shared.options
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.shared.clock
    }

    pub fn storage(&self) -> Option<&Arc<dyn SessionStorage>> {
        self.shared.storage.as_ref()
    }
}

/// [`Profiler`] 的装配器。
///
/// 未指定时钟时使用 [`SystemClock`]。
#[derive(Default)]
pub struct ProfilerBuilder {
    clock: Option<Arc<dyn Clock>>,
    options: ProfilerOptions,
    storage: Option<Arc<dyn SessionStorage>>,
}

impl ProfilerBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn options(mut self, options: ProfilerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// 校验配置并完成装配。
    pub fn build(self) -> Result<Profiler> {
        self.options.validate()?;
        Ok(self.build_unchecked())
    }

    fn build_unchecked(self) -> Profiler {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);
        Profiler {
            shared: Arc::new(ProfilerShared {
                clock,
                options: self.options,
                storage: self.storage,
                active: DashMap::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    #[test]
    fn independent_contexts_coexist() {
        let profiler = Profiler::new(Arc::new(MockClock::new()));
        let first = profiler
            .start(&ProfilingContext::with_key("req-1", "/orders"))
            .unwrap();
        let second = profiler
            .start(&ProfilingContext::with_key("req-2", "/orders"))
            .unwrap();
        assert_eq!(profiler.active_sessions(), 2);
        assert_ne!(first.id(), second.id());
        drop(first);
        assert!(!profiler.is_active("req-1"));
        assert!(profiler.is_active("req-2"));
    }

    #[test]
    fn release_ignores_successor_sessions() {
        let profiler = Profiler::new(Arc::new(MockClock::new()));
        let context = ProfilingContext::new("/reuse");
        let stale = profiler.start(&context).unwrap();
        let stale_id = stale.id();
        drop(stale);
        let fresh = profiler.start(&context).unwrap();
        profiler.shared.release(&Arc::from("/reuse"), stale_id);
        assert!(profiler.is_active("/reuse"));
        drop(fresh);
        assert!(!profiler.is_active("/reuse"));
    }

    #[test]
    fn build_validates_options() {
        let options = ProfilerOptions {
            decimal_places: 9,
            ..ProfilerOptions::default()
        };
        assert!(matches!(
            Profiler::builder().options(options).build(),
            Err(ProfilerError::Configuration { .. })
        ));
    }

    #[test]
    fn render_applies_options() {
        let clock = MockClock::new();
        let profiler = Profiler::builder()
            .clock(Arc::new(clock.clone()))
            .options(ProfilerOptions {
                decimal_places: 0,
                machine_name: Some("web-02".to_owned()),
                ..ProfilerOptions::default()
            })
            .build()
            .unwrap();
        let session = profiler.start(&ProfilingContext::new("/render")).unwrap();
        drop(session.step("quick").unwrap());
        {
            let _slow = session.step("slow").unwrap();
            clock.advance(3).unwrap();
        }
        let text = profiler.render(&session.stop().unwrap());
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("web-02 at "));
        assert_eq!(&lines[1..], ["/render = 3ms", "> slow = 3ms"]);
    }

    #[test]
    fn blank_descriptor_is_rejected() {
        let profiler = Profiler::new(Arc::new(MockClock::new()));
        assert_eq!(
            profiler.start(&ProfilingContext::new(" ")).unwrap_err(),
            ProfilerError::EmptyName {
                what: "context descriptor"
            }
        );
        assert_eq!(profiler.active_sessions(), 0);
    }
}
