// 该文件是 Pico Detect 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 摄像头/视频输入
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

//! # GStreamer 视频输入
//!
//! 帧按摄像头原始分辨率输出，长宽比交给信箱缩放处理，管道内不做裁剪。
//!
//! - 摄像头：`gst://camera/dev/video0?width=320&height=240&fps=30&format=NV12`
//! - 视频文件：`gst://file/path/to/video.mp4?width=320&height=240`
//!
//! 可选参数 `io-mode`、`rotate`（0/90/180/270）。
//!
//! 使用前需要安装 GStreamer 开发库（`libgstreamer1.0-dev`、
//! `libgstreamer-plugins-base1.0-dev`），并启用 `gstreamer_input` 特性。

use std::collections::HashMap;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, decode_url_path,
  frame::SourceFrame,
  geometry::{FrameDimensions, GeometryError},
  input::{DEFAULT_SOURCE_FPS, DEFAULT_SOURCE_HEIGHT, DEFAULT_SOURCE_WIDTH},
};

#[derive(Error, Debug)]
pub enum GStreamerInputError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  #[error("Failed to convert element to appsink")]
  AppSinkConversionFailed,
  #[error("Failed to get video info from caps")]
  VideoInfoError,
  #[error("Unsupported video format")]
  UnsupportedFormat,
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  #[error("Buffer size mismatch: expected {expected} bytes, got {actual} bytes")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("Frame size mismatch: expected {expected}, got {width}x{height}")]
  FrameSizeMismatch {
    expected: FrameDimensions,
    width: u32,
    height: u32,
  },
  #[error("Invalid dimensions: {0}")]
  Dimensions(#[from] GeometryError),
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GStreamerInputBuilderItem {
  FileSource(String),
  CameraSource {
    camera: String,
    io_mode: Option<u32>,
    format: String,
    width: u32,
    height: u32,
    fps: u32,
  },
  Scale {
    width: u32,
    height: u32,
  },
  VideoFlip {
    method: u32,
    direction: u32,
  },
  TargetFormat {
    format: String,
  },
}

impl GStreamerInputBuilderItem {
  fn to_pipeline(&self) -> String {
    match self {
      GStreamerInputBuilderItem::FileSource(path) => {
        format!("filesrc location={} ! decodebin", path)
      }
      GStreamerInputBuilderItem::CameraSource {
        camera,
        io_mode,
        format,
        width,
        height,
        fps,
      } => {
        let io_mode_str = io_mode
          .map(|mode| format!(" io-mode={}", mode))
          .unwrap_or_default();
        format!(
          "v4l2src device={}{} ! video/x-raw,format={},width={},height={},framerate={}/1",
          camera, io_mode_str, format, width, height, fps
        )
      }
      GStreamerInputBuilderItem::Scale { width, height } => {
        format!("videoscale ! video/x-raw,width={},height={}", width, height)
      }
      GStreamerInputBuilderItem::VideoFlip { method, direction } => {
        format!("videoflip method={} video-direction={}", method, direction)
      }
      GStreamerInputBuilderItem::TargetFormat { format } => {
        format!("videoconvert ! video/x-raw,format={}", format)
      }
    }
  }
}

/// GStreamer 输入管道构建器
pub struct GStreamerInputPipelineBuilder {
  items: Vec<GStreamerInputBuilderItem>,
  dimensions: FrameDimensions,
}

impl GStreamerInputPipelineBuilder {
  pub fn camera(
    device: &str,
    width: u32,
    height: u32,
    fps: u32,
  ) -> Result<Self, GStreamerInputError> {
    let dimensions = FrameDimensions::new(width, height)?;
    Ok(Self {
      items: vec![GStreamerInputBuilderItem::CameraSource {
        camera: device.to_string(),
        io_mode: None,
        format: "NV12".to_string(),
        width,
        height,
        fps,
      }],
      dimensions,
    })
  }

  pub fn file(path: &str, width: u32, height: u32) -> Result<Self, GStreamerInputError> {
    let dimensions = FrameDimensions::new(width, height)?;
    Ok(Self {
      items: vec![
        GStreamerInputBuilderItem::FileSource(path.to_string()),
        GStreamerInputBuilderItem::Scale { width, height },
      ],
      dimensions,
    })
  }

  pub fn rotate(mut self, rotate: &str) -> Self {
    let (method, direction) = match rotate {
      "90" => (1, 1),
      "180" => (2, 2),
      "270" => (3, 3),
      _ => (0, 0),
    };
    self
      .items
      .push(GStreamerInputBuilderItem::VideoFlip { method, direction });
    self
  }

  pub fn dimensions(&self) -> FrameDimensions {
    self.dimensions
  }

  /// 管道描述（不含 appsink）
  pub fn description(&self) -> String {
    let mut items = self.items.clone();
    items.push(GStreamerInputBuilderItem::TargetFormat {
      format: "RGB".to_string(),
    });
    items
      .iter()
      .map(GStreamerInputBuilderItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ")
  }

  pub fn build(self) -> Result<GStreamerInput, GStreamerInputError> {
    gst::init()?;

    let full_pipeline = format!(
      "{} ! appsink max-buffers=2 drop=true name=sink",
      self.description()
    );
    info!("GStreamer pipeline description: {}", full_pipeline);

    let pipeline = gst::parse::launch(&full_pipeline)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("Failed to create pipeline".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    pipeline.set_state(gst::State::Playing)?;

    Ok(GStreamerInput {
      pipeline,
      appsink,
      dimensions: self.dimensions,
      frame_index: 0,
    })
  }
}

impl FromUrlWithScheme for GStreamerInputPipelineBuilder {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerInputPipelineBuilder {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(GStreamerInputError::SchemeMismatch);
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();
    let get_u32 = |key: &str, default: u32| {
      query
        .get(key)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
    };

    let width = get_u32("width", DEFAULT_SOURCE_WIDTH);
    let height = get_u32("height", DEFAULT_SOURCE_HEIGHT);
    let path = decode_url_path(url);

    let mut builder = match url.host_str() {
      Some("camera") => {
        let mut builder =
          Self::camera(&path, width, height, get_u32("fps", DEFAULT_SOURCE_FPS))?;
        if let Some(GStreamerInputBuilderItem::CameraSource {
          io_mode, format, ..
        }) = builder.items.first_mut()
        {
          *io_mode = query.get("io-mode").and_then(|v| v.parse().ok());
          if let Some(f) = query.get("format") {
            *format = f.clone();
          }
        }
        builder
      }
      Some("file") => Self::file(&path, width, height)?,
      _ => return Err(GStreamerInputError::SchemeMismatch),
    };

    if let Some(rotate) = query.get("rotate") {
      builder = builder.rotate(rotate);
    }

    Ok(builder)
  }
}

/// GStreamer 视频输入，逐帧输出 RGB 源帧
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  dimensions: FrameDimensions,
  frame_index: u64,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

impl GStreamerInput {
  pub fn dimensions(&self) -> FrameDimensions {
    self.dimensions
  }

  fn pull_sample(&self) -> Option<gst::Sample> {
    self
      .appsink
      .pull_sample()
      .map_err(|e| {
        error!("Failed to pull sample: {}", e);
        e
      })
      .ok()
  }
}

impl Iterator for GStreamerInput {
  type Item = SourceFrame;

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      let sample = self.pull_sample()?;
      match convert_sample(&sample, self.dimensions) {
        Ok((image, timestamp_ms)) => {
          let index = self.frame_index;
          self.frame_index += 1;
          return Some(SourceFrame::new(image, index, timestamp_ms));
        }
        // 单帧转换失败不中断采集
        Err(e) => warn!("丢弃无法转换的帧: {}", e),
      }
    }
  }
}

fn convert_sample(
  sample: &gst::Sample,
  expected: FrameDimensions,
) -> Result<(RgbImage, u64), GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("No caps in sample".to_string()))?;

  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;
  let (width, height) = (video_info.width(), video_info.height());
  if (width, height) != (expected.width(), expected.height()) {
    return Err(GStreamerInputError::FrameSizeMismatch {
      expected,
      width,
      height,
    });
  }

  let map = buffer.map_readable().map_err(|e| {
    GStreamerInputError::PipelineError(format!("Failed to map buffer for reading: {}", e))
  })?;
  let data = map.as_slice();

  let row_bytes = width as usize * 3;
  let stride = video_info.stride()[0] as usize;
  let expected_size = stride * (height as usize - 1) + row_bytes;
  if data.len() < expected_size {
    return Err(GStreamerInputError::BufferSizeMismatch {
      expected: expected_size,
      actual: data.len(),
    });
  }

  let mut pixels = Vec::with_capacity(row_bytes * height as usize);
  match video_info.format() {
    gst_video::VideoFormat::Rgb => {
      for row in data.chunks(stride).take(height as usize) {
        pixels.extend_from_slice(&row[..row_bytes]);
      }
    }
    gst_video::VideoFormat::Bgr => {
      for row in data.chunks(stride).take(height as usize) {
        for bgr in row[..row_bytes].chunks_exact(3) {
          pixels.extend_from_slice(&[bgr[2], bgr[1], bgr[0]]);
        }
      }
    }
    _ => return Err(GStreamerInputError::UnsupportedFormat),
  }

  let image = RgbImage::from_raw(width, height, pixels).ok_or_else(|| {
    GStreamerInputError::PipelineError("Failed to build image from buffer".to_string())
  })?;
  let timestamp_ms = buffer.pts().map(|pts| pts.mseconds()).unwrap_or(0);

  Ok((image, timestamp_ms))
}
