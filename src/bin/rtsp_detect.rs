// 该文件是 Pico Detect 项目的一部分。
// src/bin/rtsp_detect.rs - 摄像头检测与推流
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

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

/// 摄像头目标检测，检测框映射回摄像头坐标后输出
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型，例如 yolov5:///userdata/yolov5s.rknn?box_threshold=0.25
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源，例如 gst://camera/dev/video0?width=320&height=240
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 检测结果输出，可重复指定，例如 record:///userdata/detect
  #[arg(long, value_name = "OUTPUT", default_value = "log://")]
  pub output: Vec<Url>,
  /// 推流服务，按采集速率推送源帧，例如 rtsp://0.0.0.0/live/0?port=8554
  #[arg(long, value_name = "STREAM")]
  pub stream: Option<Url>,
  /// 处理帧数上限
  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
  /// 采集线程预处理，推理线程只做推理和输出
  #[arg(long)]
  pub pipelined: bool,
}

#[cfg(feature = "model_yolov5")]
fn run(args: Args) -> Result<()> {
  use std::sync::{Arc, atomic::AtomicBool};

  use pico_detect::{
    FromUrl,
    detector::Detector,
    input::InputWrapper,
    model::{CocoLabel, Yolov5, Yolov5Builder},
    output::{FrameTee, OutputWrapper},
    task::{ContinuousTask, PipelinedTask, Task, install_interrupt_handler},
  };

  let input = InputWrapper::from_url(&args.input)?;
  info!("输入帧尺寸: {}", input.dimensions());
  let dimensions = input.dimensions();
  let mut input = FrameTee::new(input);
  if let Some(stream) = &args.stream {
    // 未指定尺寸时按输入帧尺寸推流
    let mut stream = stream.clone();
    if !stream.query_pairs().any(|(k, _)| k == "width" || k == "height") {
      stream
        .query_pairs_mut()
        .append_pair("width", &dimensions.width().to_string())
        .append_pair("height", &dimensions.height().to_string());
    }
    input = input.with_sink(open_stream(&stream)?);
  }

  let model: Yolov5<640, 640, CocoLabel> = Yolov5Builder::from_url(&args.model)?.build()?;
  let detector = Detector::new(model);

  let output = args
    .output
    .iter()
    .map(OutputWrapper::from_url)
    .collect::<Result<Vec<_>, _>>()?;

  let stop = Arc::new(AtomicBool::new(false));
  install_interrupt_handler(stop.clone())?;

  if args.pipelined {
    PipelinedTask::default()
      .with_frame_number(args.frame_number)
      .with_stop_flag(stop)
      .run_task(input, detector, output)
  } else {
    ContinuousTask::default()
      .with_frame_number(args.frame_number)
      .with_stop_flag(stop)
      .run_task(input, detector, output)
  }
}

#[cfg(all(feature = "model_yolov5", feature = "gstreamer_output"))]
fn open_stream(url: &Url) -> Result<Box<dyn pico_detect::output::FrameSink + Send>> {
  use pico_detect::{FromUrl, output::GStreamerRtspServer};

  Ok(Box::new(GStreamerRtspServer::from_url(url)?))
}

#[cfg(all(feature = "model_yolov5", not(feature = "gstreamer_output")))]
fn open_stream(url: &Url) -> Result<Box<dyn pico_detect::output::FrameSink + Send>> {
  anyhow::bail!("未启用 gstreamer_output 特性，无法推流到 {}", url)
}

#[cfg(not(feature = "model_yolov5"))]
fn run(_args: Args) -> Result<()> {
  anyhow::bail!("未启用 model_yolov5 特性，无法加载 RKNN 模型")
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);
  for output in &args.output {
    info!("输出: {}", output);
  }
  if let Some(stream) = &args.stream {
    info!("推流: {}", stream);
  }

  run(args)
}
