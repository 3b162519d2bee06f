// 该文件是 Pico Detect 项目的一部分。
// src/output/gstreamer_rtsp_server.rs - GStreamer RTSP 推流服务
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

//! # RTSP 推流
//!
//! `rtsp://0.0.0.0/live/0?port=8554&width=320&height=240&fps=30`
//!
//! 在 `port` 上运行 RTSP 服务，挂载点为 URL 路径。帧由采集端通过
//! [`FrameSink`] 推入，与检测循环无关；没有客户端连接时帧直接丢弃。

use std::{
  collections::HashMap,
  sync::{Arc, Mutex},
  thread,
};

use gstreamer::{self as gst, glib, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_rtsp_server::{self as gst_rtsp_server, prelude::*};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::SourceFrame,
  geometry::{FrameDimensions, GeometryError},
  input::{DEFAULT_SOURCE_FPS, DEFAULT_SOURCE_HEIGHT, DEFAULT_SOURCE_WIDTH},
  output::{FrameSink, OutputError},
};

pub const DEFAULT_RTSP_PORT: u16 = 8554;
pub const DEFAULT_STREAM_PATH: &str = "/live/0";

#[derive(Error, Debug)]
pub enum GStreamerRtspServerError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] glib::Error),
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] glib::BoolError),
  #[error("RTSP server has no mount points")]
  MountPointsNotFound,
  #[error("Invalid stream size: {0}")]
  Dimensions(#[from] GeometryError),
  #[error("Frame size mismatch: stream is {expected}, frame is {width}x{height}")]
  FrameSizeMismatch {
    expected: FrameDimensions,
    width: u32,
    height: u32,
  },
  #[error("Stream source lock poisoned")]
  LockPoisoned,
}

/// 推流参数
#[derive(Debug, Clone, PartialEq)]
pub struct RtspStreamConfig {
  pub address: String,
  pub port: u16,
  pub mount: String,
  pub dimensions: FrameDimensions,
  pub fps: u32,
}

impl RtspStreamConfig {
  pub fn from_url(url: &Url) -> Result<Self, GStreamerRtspServerError> {
    if url.scheme() != GStreamerRtspServer::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        GStreamerRtspServer::SCHEME,
        url.scheme()
      );
      return Err(GStreamerRtspServerError::SchemeMismatch);
    }

    let query: HashMap<_, _> = url.query_pairs().collect();
    let get = |key: &str| query.get(key).and_then(|v| v.parse::<u32>().ok());

    let dimensions = FrameDimensions::new(
      get("width").unwrap_or(DEFAULT_SOURCE_WIDTH),
      get("height").unwrap_or(DEFAULT_SOURCE_HEIGHT),
    )?;
    let port = query
      .get("port")
      .and_then(|v| v.parse().ok())
      .unwrap_or(DEFAULT_RTSP_PORT);
    let mount = match url.path() {
      "" | "/" => DEFAULT_STREAM_PATH.to_string(),
      path => path.to_string(),
    };

    Ok(Self {
      address: url.host_str().unwrap_or("0.0.0.0").to_string(),
      port,
      mount,
      dimensions,
      fps: get("fps").filter(|fps| *fps > 0).unwrap_or(DEFAULT_SOURCE_FPS),
    })
  }

  /// 媒体工厂的管道描述，appsrc 由推流端喂入 RGB 源帧
  pub fn launch_description(&self) -> String {
    format!(
      "( appsrc name=src is-live=true do-timestamp=true format=time ! \
       videoconvert ! video/x-raw,format=I420 ! \
       x264enc speed-preset=ultrafast tune=zerolatency bitrate=2000 key-int-max={} ! \
       h264parse ! rtph264pay config-interval=1 name=pay0 pt=96 )",
      self.fps
    )
  }
}

/// 在独立的 GLib 主循环上运行的 RTSP 服务
pub struct GStreamerRtspServer {
  config: RtspStreamConfig,
  main_loop: glib::MainLoop,
  source_id: Option<glib::SourceId>,
  appsrc: Arc<Mutex<Option<gst_app::AppSrc>>>,
}

impl FromUrlWithScheme for GStreamerRtspServer {
  const SCHEME: &'static str = "rtsp";
}

impl FromUrl for GStreamerRtspServer {
  type Error = GStreamerRtspServerError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    Self::serve(RtspStreamConfig::from_url(url)?)
  }
}

impl GStreamerRtspServer {
  pub fn serve(config: RtspStreamConfig) -> Result<Self, GStreamerRtspServerError> {
    gst::init()?;

    let server = gst_rtsp_server::RTSPServer::new();
    server.set_address(&config.address);
    server.set_service(&config.port.to_string());

    let mounts = server
      .mount_points()
      .ok_or(GStreamerRtspServerError::MountPointsNotFound)?;

    let factory = gst_rtsp_server::RTSPMediaFactory::new();
    let launch = config.launch_description();
    info!("RTSP media pipeline: {}", launch);
    factory.set_launch(&launch);
    factory.set_shared(true);

    let caps = gst::Caps::builder("video/x-raw")
      .field("format", "RGB")
      .field("width", config.dimensions.width() as i32)
      .field("height", config.dimensions.height() as i32)
      .field("framerate", gst::Fraction::new(config.fps as i32, 1))
      .build();
    let appsrc = Arc::new(Mutex::new(None));
    let slot = appsrc.clone();
    factory.connect_media_configure(move |_, media| {
      let element = media.element();
      let Some(src) = element
        .downcast_ref::<gst::Bin>()
        .and_then(|bin| bin.by_name_recurse_up("src"))
        .and_then(|src| src.downcast::<gst_app::AppSrc>().ok())
      else {
        error!("RTSP 媒体中找不到 appsrc");
        return;
      };
      src.set_caps(Some(&caps));
      info!("RTSP 客户端已连接");
      if let Ok(mut slot) = slot.lock() {
        *slot = Some(src);
      }
    });

    mounts.add_factory(&config.mount, factory);

    let source_id = server.attach(None)?;
    let main_loop = glib::MainLoop::new(None, false);
    let runner = main_loop.clone();
    thread::spawn(move || runner.run());

    info!(
      "推流地址: rtsp://{}:{}{} ({} @ {} fps)",
      config.address, config.port, config.mount, config.dimensions, config.fps
    );

    Ok(Self {
      config,
      main_loop,
      source_id: Some(source_id),
      appsrc,
    })
  }

  pub fn config(&self) -> &RtspStreamConfig {
    &self.config
  }

  fn push(&self, frame: &SourceFrame) -> Result<(), GStreamerRtspServerError> {
    let (width, height) = frame.image.dimensions();
    let expected = self.config.dimensions;
    if (width, height) != (expected.width(), expected.height()) {
      return Err(GStreamerRtspServerError::FrameSizeMismatch {
        expected,
        width,
        height,
      });
    }

    let mut slot = self
      .appsrc
      .lock()
      .map_err(|_| GStreamerRtspServerError::LockPoisoned)?;
    let Some(appsrc) = slot.as_ref() else {
      return Ok(());
    };

    let buffer = gst::Buffer::from_slice(frame.image.as_raw().clone());
    if let Err(e) = appsrc.push_buffer(buffer) {
      debug!("RTSP 媒体已停止 ({:?})，等待新的客户端", e);
      *slot = None;
    }
    Ok(())
  }
}

impl FrameSink for GStreamerRtspServer {
  fn push_frame(&self, frame: &SourceFrame) -> Result<(), OutputError> {
    Ok(self.push(frame)?)
  }
}

impl Drop for GStreamerRtspServer {
  fn drop(&mut self) {
    if let Some(source_id) = self.source_id.take() {
      source_id.remove();
    }
    self.main_loop.quit();
    if let Ok(slot) = self.appsrc.lock() {
      if let Some(Err(e)) = slot.as_ref().map(|appsrc| appsrc.end_of_stream()) {
        warn!("Failed to end RTSP stream: {:?}", e);
      }
    }
    info!("RTSP 推流服务已停止");
  }
}
