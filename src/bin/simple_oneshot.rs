// 该文件是 Pico Detect 项目的一部分。
// src/bin/simple_oneshot.rs - 单帧检测
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

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型，例如 yolov5:///userdata/yolov5s.rknn
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入图像，例如 image:///userdata/bus.jpg
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出
  #[arg(long, value_name = "OUTPUT", default_value = "log://?always")]
  pub output: Url,
}

#[cfg(feature = "model_yolov5")]
fn run(args: Args) -> Result<()> {
  use pico_detect::{
    FromUrl,
    detector::Detector,
    input::InputWrapper,
    model::{CocoLabel, Yolov5, Yolov5Builder},
    output::OutputWrapper,
    task::{OneShotTask, Task},
  };

  let input = InputWrapper::from_url(&args.input)?;
  let model: Yolov5<640, 640, CocoLabel> = Yolov5Builder::from_url(&args.model)?.build()?;
  let output = OutputWrapper::from_url(&args.output)?;

  OneShotTask.run_task(input, Detector::new(model), output)
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
  info!("输出: {}", args.output);

  run(args)
}
