// 该文件是 Pico Detect 项目的一部分。
// src/output.rs - 输出定义
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
use tracing::warn;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::SourceFrame,
  model::{DetectResult, WithLabel},
};

/// 输出端接收源帧与源空间中的检测结果
pub trait Render<Frame, Output>: Sized {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

/// 多个输出依次渲染，遇到第一个错误即返回
impl<Frame, Output, R: Render<Frame, Output>> Render<Frame, Output> for Vec<R> {
  type Error = R::Error;

  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error> {
    for output in self {
      output.render_result(frame, result)?;
    }
    Ok(())
  }
}

impl<Frame, Output, R: Render<Frame, Output>> Render<Frame, Output> for &R {
  type Error = R::Error;

  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error> {
    (**self).render_result(frame, result)
  }
}

/// 接收采集端的每一帧，与检测结果无关（例如推流）
pub trait FrameSink {
  fn push_frame(&self, frame: &SourceFrame) -> Result<(), OutputError>;
}

/// 在输入迭代器上分流：每取出一帧先交给所有 [`FrameSink`]，再交给检测循环。
///
/// 推流因此按采集速率进行，检测跳过或丢弃的帧同样会被推出。
pub struct FrameTee<I> {
  input: I,
  sinks: Vec<Box<dyn FrameSink + Send>>,
}

impl<I> FrameTee<I> {
  pub fn new(input: I) -> Self {
    Self {
      input,
      sinks: Vec::new(),
    }
  }

  pub fn with_sink(mut self, sink: Box<dyn FrameSink + Send>) -> Self {
    self.sinks.push(sink);
    self
  }

  pub fn get_ref(&self) -> &I {
    &self.input
  }
}

impl<I: Iterator<Item = SourceFrame>> Iterator for FrameTee<I> {
  type Item = SourceFrame;

  fn next(&mut self) -> Option<Self::Item> {
    let frame = self.input.next()?;
    for sink in &self.sinks {
      if let Err(e) = sink.push_frame(&frame) {
        warn!("第 {} 帧推送失败: {}", frame.index, e);
      }
    }
    Some(frame)
  }
}

mod log_output;
pub use self::log_output::{LogOutput, LogOutputError};

#[cfg(feature = "record_output")]
mod record;
#[cfg(feature = "record_output")]
pub use self::record::{RecordOutput, RecordOutputError};

#[cfg(feature = "gstreamer_output")]
mod gstreamer_rtsp_server;
#[cfg(feature = "gstreamer_output")]
pub use self::gstreamer_rtsp_server::{
  GStreamerRtspServer, GStreamerRtspServerError, RtspStreamConfig,
};

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("日志输出错误: {0}")]
  LogOutputError(#[from] LogOutputError),
  #[cfg(feature = "record_output")]
  #[error("检测记录输出错误: {0}")]
  RecordOutputError(#[from] RecordOutputError),
  #[cfg(feature = "gstreamer_output")]
  #[error("GStreamer RTSP 推流错误: {0}")]
  GStreamerRtspServerError(#[from] GStreamerRtspServerError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

pub enum OutputWrapper {
  Log(LogOutput),
  #[cfg(feature = "record_output")]
  Record(RecordOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      LogOutput::SCHEME => Ok(OutputWrapper::Log(LogOutput::from_url(url)?)),
      #[cfg(feature = "record_output")]
      RecordOutput::SCHEME => Ok(OutputWrapper::Record(RecordOutput::from_url(url)?)),
      scheme => Err(OutputError::SchemeMismatch(scheme.to_string())),
    }
  }
}

impl<T: WithLabel> Render<SourceFrame, DetectResult<T>> for OutputWrapper {
  type Error = OutputError;

  fn render_result(
    &self,
    frame: &SourceFrame,
    result: &DetectResult<T>,
  ) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::Log(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
      #[cfg(feature = "record_output")]
      OutputWrapper::Record(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::RgbImage;
  use std::sync::{Arc, Mutex};

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = Url::parse("ftp://example.com/out").unwrap();
    assert!(matches!(
      OutputWrapper::from_url(&url),
      Err(OutputError::SchemeMismatch(s)) if s == "ftp"
    ));
  }

  struct Indices(Arc<Mutex<Vec<u64>>>);

  impl FrameSink for Indices {
    fn push_frame(&self, frame: &SourceFrame) -> Result<(), OutputError> {
      self.0.lock().unwrap().push(frame.index);
      Ok(())
    }
  }

  struct Failing;

  impl FrameSink for Failing {
    fn push_frame(&self, _frame: &SourceFrame) -> Result<(), OutputError> {
      Err(OutputError::SchemeMismatch("stream".to_string()))
    }
  }

  #[test]
  fn tee_passes_every_frame_through_sinks() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let frames = (0..3).map(|i| SourceFrame::new(RgbImage::new(2, 2), i, 0));
    let tee = FrameTee::new(frames)
      .with_sink(Box::new(Failing))
      .with_sink(Box::new(Indices(seen.clone())));

    let indices: Vec<u64> = tee.map(|f| f.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
  }

  #[test]
  fn rtsp_is_not_a_render_output() {
    let url = Url::parse("rtsp://0.0.0.0/live/0").unwrap();
    assert!(matches!(
      OutputWrapper::from_url(&url),
      Err(OutputError::SchemeMismatch(s)) if s == "rtsp"
    ));
  }

  #[test]
  fn log_scheme_is_dispatched() {
    let url = Url::parse("log://").unwrap();
    assert!(matches!(
      OutputWrapper::from_url(&url),
      Ok(OutputWrapper::Log(_))
    ));
  }
}
