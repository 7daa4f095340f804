//! 时间抽象模块，提供可注入的时钟接口以支撑剖析会话在测试中获得完全确定的耗时。
//!
//! # 模块定位（Why）
//! - 会话构建器只依赖 [`Clock`] 的 `now`/`wall_time` 契约，从不感知具体时间源；
//! - 测试注入 [`MockClock`] 手动推进时间，生产环境使用基于 `Instant` 的 [`SystemClock`]。
//!
//! # 结构概览（What）
//! - [`Ticks`]：整数刻度，1 毫秒 = [`TICKS_PER_MILLISECOND`] 个刻度（100 ns 分辨率）；
//! - [`Clock`]：核心 trait，返回单调刻度与墙钟时间；
//! - [`MockClock`]：虚拟时钟，支持手动推进与重置。

use std::fmt;
use std::ops::{Add, Sub};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ProfilerError, Result};

/// 每毫秒对应的刻度数。
pub const TICKS_PER_MILLISECOND: u64 = 10_000;

const NANOS_PER_TICK: u64 = 1_000_000 / TICKS_PER_MILLISECOND;

/// 单调时钟刻度。
///
/// 既用于表示时间点（相对某个起点的偏移），也用于表示持续时间；
/// 减法饱和到零，因此耗时永远非负。
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Ticks(pub u64);

impl Ticks {
    pub const ZERO: Ticks = Ticks(0);

    /// 由整毫秒构造。
    pub const fn from_millis(millis: u64) -> Self {
        Ticks(millis.saturating_mul(TICKS_PER_MILLISECOND))
    }

    /// 由 [`Duration`] 构造，不足一个刻度的部分被舍去。
    pub fn from_duration(duration: Duration) -> Self {
        let ticks = duration.as_nanos() / u128::from(NANOS_PER_TICK);
        Ticks(u64::try_from(ticks).unwrap_or(u64::MAX))
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// 以毫秒表示（含小数部分）。
    pub fn as_millis_f64(self) -> f64 {
        self.0 as f64 / TICKS_PER_MILLISECOND as f64
    }

    pub fn to_duration(self) -> Duration {
        Duration::from_nanos(self.0.saturating_mul(NANOS_PER_TICK))
    }

    pub fn saturating_sub(self, rhs: Ticks) -> Ticks {
        Ticks(self.0.saturating_sub(rhs.0))
    }
}

impl Add for Ticks {
    type Output = Ticks;

    fn add(self, rhs: Ticks) -> Ticks {
        Ticks(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Ticks {
    type Output = Ticks;

    fn sub(self, rhs: Ticks) -> Ticks {
        self.saturating_sub(rhs)
    }
}

impl fmt::Display for Ticks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}ms", self.as_millis_f64())
    }
}

/// 抽象可注入的时钟。
///
/// # 接口约束（What）
/// - `now`：返回单调不减的刻度；
/// - `wall_time`：返回当前墙钟时间，仅用于标记会话开始时刻，不参与耗时计算。
///
/// # 使用指引（How）
/// - 通过 `Arc<dyn Clock>` 注入 [`crate::Profiler`]；
/// - 测试中每个用例持有私有的 [`MockClock`]，不要在无关会话之间共享可变时钟。
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Ticks;

    fn wall_time(&self) -> DateTime<Utc>;
}

/// 以构造时刻为零点的真实时钟。
#[derive(Clone, Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Ticks {
        Ticks::from_duration(self.origin.elapsed())
    }

    fn wall_time(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 虚拟时钟：通过手动推进时间在测试中复现确定的耗时。
///
/// # 行为概览（How）
/// - 内部维护自构造起累积的刻度与墙钟起点；
/// - `advance` 按毫秒推进，负数被拒绝；`advance_by` 接受 [`Duration`]，天然非负；
/// - 克隆体共享同一份状态，便于测试一边持有句柄推进，一边把 `Arc<dyn Clock>` 交给剖析器。
///
/// # 契约说明（What）
/// - 刻度单调不减；`advance(n)` 恰好增加 `n * TICKS_PER_MILLISECOND`；
/// - `advance(0)` 不产生任何可观测变化。
#[derive(Clone, Debug)]
pub struct MockClock {
    inner: Arc<Mutex<MockClockState>>,
}

#[derive(Debug)]
struct MockClockState {
    origin: DateTime<Utc>,
    elapsed: Ticks,
}

impl MockClock {
    /// 以当前墙钟时间为起点构造虚拟时钟。
    pub fn new() -> Self {
        Self::with_origin(Utc::now())
    }

    /// 以固定墙钟起点构造，测试可借此得到完全确定的 `started_at`。
    pub fn with_origin(origin: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockClockState {
                origin,
                elapsed: Ticks::ZERO,
            })),
        }
    }

    /// 推进 `millis` 毫秒并返回推进后的刻度。
    ///
    /// 负数返回 [`ProfilerError::InvalidClockAdvance`]，时钟保持不变。
    pub fn advance(&self, millis: i64) -> Result<Ticks> {
        let millis =
            u64::try_from(millis).map_err(|_| ProfilerError::InvalidClockAdvance { millis })?;
        Ok(self.advance_ticks(Ticks::from_millis(millis)))
    }

    /// 按 [`Duration`] 推进。
    pub fn advance_by(&self, delta: Duration) -> Ticks {
        self.advance_ticks(Ticks::from_duration(delta))
    }

    fn advance_ticks(&self, delta: Ticks) -> Ticks {
        let mut state = self.inner.lock();
        state.elapsed = state.elapsed + delta;
        state.elapsed
    }

    /// 自起点以来累积的刻度。
    pub fn elapsed(&self) -> Ticks {
        self.inner.lock().elapsed
    }

    /// 将累积刻度归零，供同一时钟在多个阶段复用。
    ///
    /// 只应在没有活跃会话时调用，否则后续步骤会观察到时间倒退。
    pub fn reset(&self) {
        self.inner.lock().elapsed = Ticks::ZERO;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Ticks {
        self.inner.lock().elapsed
    }

    fn wall_time(&self) -> DateTime<Utc> {
        let state = self.inner.lock();
        let nanos = i64::try_from(state.elapsed.to_duration().as_nanos()).unwrap_or(i64::MAX);
        state.origin + TimeDelta::nanoseconds(nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn advance_adds_exact_ticks() {
        let clock = MockClock::new();
        assert_eq!(clock.advance(3).unwrap(), Ticks(30_000));
        assert_eq!(clock.advance(0).unwrap(), Ticks(30_000));
        assert_eq!(clock.now(), Ticks::from_millis(3));
    }

    #[test]
    fn negative_advance_is_rejected_without_side_effects() {
        let clock = MockClock::new();
        clock.advance(5).unwrap();
        assert_eq!(
            clock.advance(-1),
            Err(ProfilerError::InvalidClockAdvance { millis: -1 })
        );
        assert_eq!(clock.now(), Ticks::from_millis(5));
    }

    #[test]
    fn clones_share_state_and_reset_rewinds() {
        let clock = MockClock::new();
        let handle: Arc<dyn Clock> = Arc::new(clock.clone());
        clock.advance_by(Duration::from_micros(250));
        assert_eq!(handle.now(), Ticks(2_500));
        clock.reset();
        assert_eq!(handle.now(), Ticks::ZERO);
    }

    #[test]
    fn wall_time_follows_origin() {
        let origin = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = MockClock::with_origin(origin);
        clock.advance(1_500).unwrap();
        assert_eq!(clock.wall_time(), origin + TimeDelta::milliseconds(1_500));
    }

    #[test]
    fn ticks_arithmetic_saturates() {
        assert_eq!(Ticks(5) - Ticks(9), Ticks::ZERO);
        assert_eq!(Ticks::from_millis(2).to_duration(), Duration::from_millis(2));
        assert_eq!(Ticks::from_millis(1).to_string(), "1.0ms");
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
