#![deny(unsafe_code)]
#![doc = "spark-profiler: 基于可控时钟的分层请求剖析会话模型。"]
#![doc = ""]
#![doc = "一次剖析会话是一棵计时树：根步骤对应整个请求，子步骤按调用顺序嵌套，"]
#![doc = "每个步骤还可以挂载按分类分组的自定义计时（SQL、外部 HTTP 调用等）。"]
#![doc = "时钟通过 [`Clock`] 注入，测试使用 [`MockClock`] 获得完全确定的耗时。"]

//! # 使用方式
//!
//! ```
//! use std::sync::Arc;
//! use spark_profiler::{MockClock, Profiler, ProfilingContext, Ticks};
//!
//! let clock = MockClock::new();
//! let profiler = Profiler::new(Arc::new(clock.clone()));
//! let session = profiler.start(&ProfilingContext::new("/test")).unwrap();
//! {
//!     let _step = session.step("Depth 1").unwrap();
//!     clock.advance(1).unwrap();
//! }
//! let result = session.stop().unwrap();
//! assert_eq!(result.duration, Ticks::from_millis(1));
//! assert_eq!(result.root.children.len(), 1);
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod model;
pub mod profiler;
pub mod session;
pub mod storage;

pub use clock::{Clock, MockClock, SystemClock, TICKS_PER_MILLISECOND, Ticks};
pub use config::ProfilerOptions;
pub use error::{ProfilerError, Result};
pub use model::{CustomTiming, Session, Timing, TimingHierarchy};
pub use profiler::{Profiler, ProfilerBuilder, ProfilingContext};
pub use session::{ActiveSession, CustomTimingGuard, StepGuard};
pub use storage::{InMemoryStorage, SessionStorage};
