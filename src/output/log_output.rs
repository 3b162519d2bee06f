// 该文件是 Pico Detect 项目的一部分。
// src/output/log_output.rs - 日志输出
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::SourceFrame,
  model::{DetectResult, WithLabel},
  output::Render,
};

#[derive(Error, Debug)]
pub enum LogOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// 将每帧检测结果写入 tracing 日志
///
/// `log://`，`log://?always` 时无检测结果的帧也会记录
#[derive(Debug, Default)]
pub struct LogOutput {
  always: bool,
}

impl FromUrlWithScheme for LogOutput {
  const SCHEME: &'static str = "log";
}

impl FromUrl for LogOutput {
  type Error = LogOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(LogOutputError::SchemeMismatch);
    }
    let always = url.query_pairs().any(|(k, _)| k == "always");
    Ok(LogOutput { always })
  }
}

impl<T: WithLabel> Render<SourceFrame, DetectResult<T>> for LogOutput {
  type Error = LogOutputError;

  fn render_result(
    &self,
    frame: &SourceFrame,
    result: &DetectResult<T>,
  ) -> Result<(), Self::Error> {
    if result.is_empty() {
      if self.always {
        info!("帧 {}: 无检测结果", frame.index);
      } else {
        debug!("帧 {}: 无检测结果", frame.index);
      }
      return Ok(());
    }

    info!("帧 {}: {} 个检测结果", frame.index, result.len());
    for item in result.iter() {
      let b = &item.bbox;
      info!(
        "  {} @ ({} {} {} {}) {:.3}",
        item.kind.to_label_str(),
        b.left,
        b.top,
        b.right,
        b.bottom,
        item.score
      );
    }
    Ok(())
  }
}
