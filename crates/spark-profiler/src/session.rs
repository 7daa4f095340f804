//! # 活跃会话与步骤守卫
//!
//! ## 核心意图（Why）
//! - [`ActiveSession`] 是会话构建期的显式上下文：所有 `step`/`custom_timing`/`stop` 都在它上面调用，
//!   不存在线程局部的“当前剖析器”，多个请求的会话互不串扰；
//! - 步骤生命周期映射为作用域守卫：[`StepGuard`] 在任何退出路径（包括 panic 展开）上关闭对应节点。
//!
//! ## 状态机约束（What）
//! - 打开的节点始终构成一条从根到叶的栈；新步骤总是挂在栈顶之下；
//! - 关闭某个节点时，仍打开的后代按由内向外的顺序一并关闭，任何节点都不会永久处于打开状态；
//! - 自定义计时只会追加到栈顶节点，也就是一个仍然打开的节点；
//! - `stop` 消耗会话；守卫借用会话，因此编译器保证 `stop` 之前所有守卫都已释放，
//!   只有被 `mem::forget` 的守卫才会让 `stop` 观察到失衡并返回 [`ProfilerError::UnbalancedStep`]。
//!
//! ## 并发（Trade-offs）
//! - 会话状态由 `parking_lot::Mutex` 保护；打开步骤、追加计时等操作使用 `try_lock`，
//!   观察到并发调用时返回 [`ProfilerError::ConcurrentAccess`]，而不是猜测一种合并语义；
//! - 关闭路径使用阻塞加锁：关闭必须发生，否则树会残缺。

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::clock::Ticks;
use crate::error::{ProfilerError, Result};
use crate::model::{CustomTiming, Session, Timing};
use crate::profiler::ProfilerShared;

const ROOT: usize = 0;

/// 正在构建中的剖析会话。
///
/// 由 [`crate::Profiler::start`] 创建；`stop`/`stop_async` 产出不可变的 [`Session`]。
/// 未停止就被丢弃时，会话结果被放弃，上下文键随即释放。
#[derive(Debug)]
pub struct ActiveSession {
    id: Uuid,
    context: Arc<str>,
    user: Option<String>,
    started_at: DateTime<Utc>,
    origin: Ticks,
    shared: Arc<ProfilerShared>,
    state: Mutex<SessionState>,
}

impl ActiveSession {
    pub(crate) fn open(
        shared: Arc<ProfilerShared>,
        context: Arc<str>,
        descriptor: String,
        user: Option<String>,
    ) -> Self {
        let origin = shared.clock.now();
        let started_at = shared.clock.wall_time();
        let id = Uuid::new_v4();
        let mut state = SessionState::default();
        state.push_node(None, descriptor, origin, None);
        Self {
            id,
            context,
            user,
            started_at,
            origin,
            shared,
            state: Mutex::new(state),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// 会话所属上下文的键。
    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// 自会话开始以来经过的刻度。
    pub fn elapsed(&self) -> Ticks {
        self.shared.clock.now() - self.origin
    }

    /// 当前打开的节点数（含根节点）。
    pub fn open_steps(&self) -> usize {
        self.state.lock().stack.len()
    }

    /// 栈顶步骤的名称。
    pub fn current_step(&self) -> String {
        let state = self.state.lock();
        let top = state.top();
        state.nodes[top].name.clone()
    }

    /// 在栈顶节点下打开一个子步骤。
    ///
    /// # 契约 (What)
    /// - `name` 不能为空，否则返回 [`ProfilerError::EmptyName`]；
    /// - 返回的守卫被释放时固定该步骤的耗时 `clock.now() - start`；
    /// - 兄弟步骤按调用顺序排列，嵌套深度不设上限。
    pub fn step(&self, name: impl Into<String>) -> Result<StepGuard<'_>> {
        self.open_step(name.into(), None)
    }

    /// 与 [`step`](Self::step) 相同，但若最终耗时低于 `min`，该步骤及其子树会从父节点中移除。
    pub fn step_if(&self, name: impl Into<String>, min: Ticks) -> Result<StepGuard<'_>> {
        self.open_step(name.into(), Some(min))
    }

    fn open_step(&self, name: String, min: Option<Ticks>) -> Result<StepGuard<'_>> {
        ensure_named(&name, "step name")?;
        let mut state = self.lock()?;
        let now = self.shared.clock.now();
        let parent = state.top();
        let index = state.push_node(Some(parent), name, now, min);
        tracing::debug!(
            session = %self.id,
            step = %state.nodes[index].name,
            depth = state.stack.len() - 1,
            "step opened"
        );
        Ok(StepGuard {
            session: self,
            index,
            closed: false,
        })
    }

    /// 在栈顶节点下追加一条自定义计时，`command` 为描述性载荷（例如执行的 SQL）。
    pub fn custom_timing(&self, category: &str, command: &str) -> Result<CustomTimingGuard<'_>> {
        self.push_custom_timing(category, command, None)
    }

    /// 带执行类型（如 `"Reader"`、`"NonQuery"`）的自定义计时。
    pub fn custom_timing_typed(
        &self,
        category: &str,
        command: &str,
        execute_type: &str,
    ) -> Result<CustomTimingGuard<'_>> {
        self.push_custom_timing(category, command, Some(execute_type.to_owned()))
    }

    fn push_custom_timing(
        &self,
        category: &str,
        command: &str,
        execute_type: Option<String>,
    ) -> Result<CustomTimingGuard<'_>> {
        ensure_named(category, "custom timing category")?;
        let command = self.shared.options.clip_command(command);
        let mut state = self.lock()?;
        let now = self.shared.clock.now();
        let node = state.top();
        let entries = state.nodes[node]
            .custom_timings
            .entry(category.to_owned())
            .or_default();
        entries.push(PendingCustomTiming {
            id: Uuid::new_v4(),
            command: (!command.is_empty()).then_some(command),
            execute_type,
            start: now,
            stop: None,
            first_fetch: None,
            errored: false,
        });
        let position = entries.len() - 1;
        tracing::trace!(session = %self.id, category, position, "custom timing opened");
        Ok(CustomTimingGuard {
            session: self,
            node,
            category: category.to_owned(),
            position,
            finished: false,
        })
    }

    /// 关闭根节点并产出不可变的 [`Session`]。
    ///
    /// # 契约 (What)
    /// - 栈中只剩根节点时成功；否则所有打开的节点被强制关闭，返回
    ///   [`ProfilerError::UnbalancedStep`]，会话结果被丢弃；
    /// - 尚未停止的自定义计时以当前时刻收尾；
    /// - 返回前上下文键已释放，同一上下文可以立即开始新会话。
    pub fn stop(mut self) -> Result<Session> {
        let now = self.shared.clock.now();
        let mut state = std::mem::take(self.state.get_mut());
        let forced = state.close_from(ROOT, now).unwrap_or_default();
        state.finish_custom_timings(now);
        let root_name = state.nodes[ROOT].name.clone();
        if !forced.is_empty() {
            tracing::warn!(
                session = %self.id,
                open = ?forced,
                "session stopped with unclosed steps"
            );
            return Err(ProfilerError::UnbalancedStep {
                step: root_name,
                open: forced,
            });
        }

        let root = state.build_timing(ROOT, self.origin);
        let session = Session {
            id: self.id,
            name: root_name,
            started_at: self.started_at,
            duration: root.duration,
            machine_name: self.shared.options.machine_name.clone(),
            user: self.user.take(),
            root,
        };
        tracing::debug!(
            session = %session.id,
            context = %self.context,
            duration_ticks = session.duration.get(),
            "session stopped"
        );
        Ok(session)
    }

    /// 异步停止：先同步完成全部耗时计算，再把结果交给配置的存储。
    ///
    /// 只有持久化会挂起；未配置存储时等价于 [`stop`](Self::stop)。
    pub async fn stop_async(self) -> Result<Session> {
        let storage = self.shared.storage.clone();
        let session = self.stop()?;
        if let Some(storage) = storage {
            storage.save(&session).await?;
        }
        Ok(session)
    }

    fn lock(&self) -> Result<MutexGuard<'_, SessionState>> {
        self.state
            .try_lock()
            .ok_or_else(|| ProfilerError::ConcurrentAccess {
                session: self.context.to_string(),
            })
    }

    fn finish_step(&self, index: usize, strict: bool) -> Result<Ticks> {
        let now = self.shared.clock.now();
        let mut state = self.state.lock();
        let forced = state.close_from(index, now);
        let node = &state.nodes[index];
        let duration = node.stop.unwrap_or(now) - node.start;
        match forced {
            Some(open) if !open.is_empty() => {
                tracing::warn!(
                    session = %self.id,
                    step = %node.name,
                    open = ?open,
                    "step closed before its descendants"
                );
                if strict {
                    return Err(ProfilerError::UnbalancedStep {
                        step: node.name.clone(),
                        open,
                    });
                }
            }
            Some(_) => {
                tracing::debug!(
                    session = %self.id,
                    step = %node.name,
                    duration_ticks = duration.get(),
                    "step closed"
                );
            }
            None => {}
        }
        Ok(duration)
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.shared.release(&self.context, self.id);
    }
}

/// 步骤的作用域守卫。
///
/// 被释放（包括 panic 展开）时关闭对应节点以及所有仍打开的后代。
#[must_use = "dropping the guard closes the step immediately"]
#[derive(Debug)]
pub struct StepGuard<'a> {
    session: &'a ActiveSession,
    index: usize,
    closed: bool,
}

impl StepGuard<'_> {
    /// 显式关闭并返回固定下来的耗时。
    ///
    /// 若仍有后代未关闭，它们会被由内向外关闭，随后返回 [`ProfilerError::UnbalancedStep`]；
    /// 无论成功与否，树都保持一致。已被祖先强制关闭的步骤直接返回其耗时。
    pub fn close(mut self) -> Result<Ticks> {
        self.closed = true;
        self.session.finish_step(self.index, true)
    }
}

impl Drop for StepGuard<'_> {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.session.finish_step(self.index, false);
        }
    }
}

/// 自定义计时的作用域守卫。
#[must_use = "dropping the guard stops the custom timing immediately"]
#[derive(Debug)]
pub struct CustomTimingGuard<'a> {
    session: &'a ActiveSession,
    node: usize,
    category: String,
    position: usize,
    finished: bool,
}

impl CustomTimingGuard<'_> {
    /// 记录首个结果返回的时刻，只有第一次调用生效。
    pub fn first_fetch_completed(&mut self) {
        let now = self.session.shared.clock.now();
        self.with_entry(|entry| {
            if entry.first_fetch.is_none() {
                entry.first_fetch = Some(now - entry.start);
            }
        });
    }

    /// 标记该次调用失败。
    pub fn errored(&mut self) {
        self.with_entry(|entry| entry.errored = true);
    }

    /// 显式停止并返回耗时。
    pub fn stop(mut self) -> Ticks {
        self.finished = true;
        self.finish()
    }

    fn finish(&self) -> Ticks {
        let now = self.session.shared.clock.now();
        self.with_entry(|entry| {
            let stop = *entry.stop.get_or_insert(now);
            stop - entry.start
        })
        .unwrap_or_default()
    }

    fn with_entry<R>(&self, f: impl FnOnce(&mut PendingCustomTiming) -> R) -> Option<R> {
        let mut state = self.session.state.lock();
        state.nodes[self.node]
            .custom_timings
            .get_mut(&self.category)
            .and_then(|entries| entries.get_mut(self.position))
            .map(f)
    }
}

impl Drop for CustomTimingGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.finish();
        }
    }
}

fn ensure_named(value: &str, what: &'static str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ProfilerError::EmptyName { what });
    }
    Ok(())
}

/// 构建期的节点竞技场与打开栈。
///
/// 节点以绝对刻度记录，产出 [`Timing`] 时再换算为相对会话起点的偏移。
#[derive(Debug, Default)]
struct SessionState {
    nodes: Vec<NodeSlot>,
    stack: Vec<usize>,
}

#[derive(Debug)]
struct NodeSlot {
    id: Uuid,
    name: String,
    start: Ticks,
    stop: Option<Ticks>,
    parent: Option<usize>,
    children: Vec<usize>,
    custom_timings: BTreeMap<String, Vec<PendingCustomTiming>>,
    min_duration: Option<Ticks>,
}

#[derive(Debug)]
struct PendingCustomTiming {
    id: Uuid,
    command: Option<String>,
    execute_type: Option<String>,
    start: Ticks,
    stop: Option<Ticks>,
    first_fetch: Option<Ticks>,
    errored: bool,
}

impl SessionState {
    fn top(&self) -> usize {
        self.stack.last().copied().unwrap_or(ROOT)
    }

    fn push_node(
        &mut self,
        parent: Option<usize>,
        name: String,
        start: Ticks,
        min_duration: Option<Ticks>,
    ) -> usize {
        let index = self.nodes.len();
        self.nodes.push(NodeSlot {
            id: Uuid::new_v4(),
            name,
            start,
            stop: None,
            parent,
            children: Vec::new(),
            custom_timings: BTreeMap::new(),
            min_duration,
        });
        if let Some(parent) = parent {
            self.nodes[parent].children.push(index);
        }
        self.stack.push(index);
        index
    }

    /// 关闭 `index` 及其之上的所有打开节点（由内向外）。
    ///
    /// 返回被强制关闭的后代名称（由外向内）；`index` 已不在栈中时返回 `None`。
    fn close_from(&mut self, index: usize, now: Ticks) -> Option<Vec<String>> {
        let position = self.stack.iter().position(|&open| open == index)?;
        let closing: Vec<usize> = self.stack.drain(position..).collect();
        for &node in closing.iter().rev() {
            self.close_node(node, now);
        }
        Some(
            closing[1..]
                .iter()
                .map(|&node| self.nodes[node].name.clone())
                .collect(),
        )
    }

    fn close_node(&mut self, index: usize, now: Ticks) {
        let node = &mut self.nodes[index];
        node.stop = Some(now);
        let duration = now - node.start;
        let discard = node.min_duration.is_some_and(|min| duration < min);
        let parent = node.parent;
        if let (true, Some(parent)) = (discard, parent) {
            self.nodes[parent].children.retain(|&child| child != index);
        }
    }

    fn finish_custom_timings(&mut self, now: Ticks) {
        for node in &mut self.nodes {
            for entry in node.custom_timings.values_mut().flatten() {
                entry.stop.get_or_insert(now);
            }
        }
    }

    fn build_timing(&self, index: usize, origin: Ticks) -> Timing {
        let node = &self.nodes[index];
        let stop = node.stop.unwrap_or(node.start);
        Timing {
            id: node.id,
            name: node.name.clone(),
            start: node.start - origin,
            duration: stop - node.start,
            children: node
                .children
                .iter()
                .map(|&child| self.build_timing(child, origin))
                .collect(),
            custom_timings: node
                .custom_timings
                .iter()
                .map(|(category, entries)| {
                    let entries = entries
                        .iter()
                        .map(|entry| entry.to_custom_timing(origin))
                        .collect();
                    (category.clone(), entries)
                })
                .collect(),
        }
    }
}

impl PendingCustomTiming {
    fn to_custom_timing(&self, origin: Ticks) -> CustomTiming {
        let stop = self.stop.unwrap_or(self.start);
        CustomTiming {
            id: self.id,
            command: self.command.clone(),
            execute_type: self.execute_type.clone(),
            start: self.start - origin,
            duration: stop - self.start,
            first_fetch: self.first_fetch,
            errored: self.errored,
        }
    }
}
