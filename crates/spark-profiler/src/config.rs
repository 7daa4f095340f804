//! 剖析器配置。
//!
//! # 背景说明（Why）
//! - 将渲染精度、琐碎阈值、机器名等可调项收敛到 [`ProfilerOptions`]，由宿主在装配
//!   [`crate::Profiler`] 时一次性注入；
//! - 所有字段都有默认值，配置文件只需覆盖关心的项。
//!
//! # 集成方式（How）
//! - 代码中直接构造 `ProfilerOptions { .. Default::default() }`；
//! - 启用 `config-toml` 特性后可用 [`ProfilerOptions::from_toml_str`] 从配置文本加载。

use serde::{Deserialize, Serialize};

use crate::error::{ProfilerError, Result};

/// 剖析器的可调参数。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfilerOptions {
    /// 低于该毫秒数的步骤视为琐碎步骤。
    pub trivial_threshold_ms: f64,
    /// 文本渲染时毫秒数保留的小数位。
    pub decimal_places: u8,
    /// 写入每个会话的机器名。
    pub machine_name: Option<String>,
    /// 自定义计时命令文本的最大字节数，超出部分在字符边界处截断。
    pub max_command_len: Option<usize>,
}

impl Default for ProfilerOptions {
    fn default() -> Self {
        Self {
            trivial_threshold_ms: 2.0,
            decimal_places: 1,
            machine_name: None,
            max_command_len: None,
        }
    }
}

impl ProfilerOptions {
    /// 校验取值范围。
    ///
    /// - `trivial_threshold_ms` 必须是有限的非负数；
    /// - `decimal_places` 不超过 6，再往下已低于刻度分辨率。
    pub fn validate(&self) -> Result<()> {
        if !self.trivial_threshold_ms.is_finite() || self.trivial_threshold_ms < 0.0 {
            return Err(ProfilerError::configuration(format!(
                "trivial_threshold_ms must be a finite, non-negative number (got {})",
                self.trivial_threshold_ms
            )));
        }
        if self.decimal_places > 6 {
            return Err(ProfilerError::configuration(format!(
                "decimal_places must be at most 6 (got {})",
                self.decimal_places
            )));
        }
        if self.max_command_len == Some(0) {
            return Err(ProfilerError::configuration(
                "max_command_len must be greater than zero",
            ));
        }
        Ok(())
    }

    /// 从 TOML 文本解析并校验。
    #[cfg(feature = "config-toml")]
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: ProfilerOptions = toml::from_str(text).map_err(ProfilerError::configuration)?;
        options.validate()?;
        Ok(options)
    }

    /// 按 `max_command_len` 截断命令文本。
    pub(crate) fn clip_command(&self, command: &str) -> String {
        match self.max_command_len {
            Some(limit) if command.len() > limit => {
                let mut end = limit;
                while !command.is_char_boundary(end) {
                    end -= 1;
                }
                command[..end].to_owned()
            }
            _ => command.to_owned(),
        }
    }
}
