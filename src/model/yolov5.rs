// 该文件是 Pico Detect 项目的一部分。
// src/model/yolov5.rs - RKNN YOLOv5 模型
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

use std::marker::PhantomData;

use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, decode_url_path,
  frame::{AsNhwcFrame, RgbNhwcFrame},
  geometry::FrameDimensions,
  model::{
    DetectResult, Model, WithLabel,
    postprocess::{PostprocessConfig, PostprocessError, YOLOV5_STRIDES, postprocess},
  },
};

const YOLOV5_NUM_INPUTS: u32 = 1;
const YOLOV5_NUM_OUTPUTS: u32 = 3;

#[derive(Error, Debug)]
pub enum Yolov5Error {
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("模型无效: {0}, 错误: {1}")]
  ModelInvalid(String, rknpu::Error),
  #[error("RKNN 错误: {0}")]
  RknnError(#[from] rknpu::Error),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("后处理错误: {0}")]
  PostprocessError(#[from] PostprocessError),
}

impl Yolov5Error {
  fn invalid(msg: &str, e: rknpu::Error) -> Self {
    Yolov5Error::ModelInvalid(msg.to_string(), e)
  }
}

pub struct Yolov5<const W: u32, const H: u32, T> {
  context: Context,
  config: PostprocessConfig,
  _phantom: PhantomData<T>,
}

pub struct Yolov5Builder {
  model_path: String,
  flags: InitFlags,
  config: PostprocessConfig,
}

impl FromUrlWithScheme for Yolov5Builder {
  const SCHEME: &'static str = "yolov5";
}

impl FromUrl for Yolov5Builder {
  type Error = Yolov5Error;

  /// `yolov5:///path/model.rknn?box_threshold=0.25&nms_threshold=0.45`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(Yolov5Error::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let mut config = PostprocessConfig::default();
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "box_threshold" => config.box_threshold = parse_query(&key, &value)?,
        "nms_threshold" => config.nms_threshold = parse_query(&key, &value)?,
        "max_detections" => config.max_detections = parse_query(&key, &value)?,
        _ => debug!("忽略未知参数: {}={}", key, value),
      }
    }

    Ok(Yolov5Builder {
      model_path: decode_url_path(url),
      flags: InitFlags::default(),
      config,
    })
  }
}

fn parse_query<V: std::str::FromStr>(key: &str, value: &str) -> Result<V, Yolov5Error> {
  value
    .parse()
    .map_err(|_| Yolov5Error::ModelPathError(format!("参数 {} 的值无效: {}", key, value)))
}

impl Yolov5Builder {
  pub fn flags(mut self, flags: InitFlags) -> Self {
    self.flags = flags;
    self
  }

  pub fn config(mut self, config: PostprocessConfig) -> Self {
    self.config = config;
    self
  }

  pub fn build<const W: u32, const H: u32, T>(self) -> Result<Yolov5<W, H, T>, Yolov5Error> {
    info!("加载模型文件: {}", self.model_path);
    let model_data = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&model_data, self.flags)?;

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("模型 API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("模型驱动版本: {}", drv_ver);
        }
      }
      Err(e) => {
        error!("查询 SDK 版本失败: {}", e);
        return Err(Yolov5Error::invalid("无法查询 SDK 版本", e));
      }
    }

    let num_inputs = context
      .num_inputs()
      .map_err(|e| Yolov5Error::invalid("无法获取输入数量", e))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| Yolov5Error::invalid("无法获取输出数量", e))?;

    if num_inputs != YOLOV5_NUM_INPUTS || num_outputs != YOLOV5_NUM_OUTPUTS {
      let msg = format!(
        "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
        YOLOV5_NUM_INPUTS, YOLOV5_NUM_OUTPUTS, num_inputs, num_outputs
      );
      error!("{}", msg);
      return Err(Yolov5Error::invalid(&msg, rknpu::Error::InvalidModel));
    }

    info!(
      "模型加载完成，输入 {}x{}，阈值 {:.2}/{:.2}",
      W, H, self.config.box_threshold, self.config.nms_threshold
    );

    Ok(Yolov5 {
      context,
      config: self.config,
      _phantom: PhantomData,
    })
  }
}

impl<const W: u32, const H: u32, T: WithLabel> Model for Yolov5<W, H, T> {
  type Input = RgbNhwcFrame<W, H>;
  type Output = DetectResult<T>;
  type Error = Yolov5Error;

  fn input_dimensions(&self) -> FrameDimensions {
    RgbNhwcFrame::<W, H>::dimensions()
  }

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    debug!("设置模型输入");
    self
      .context
      .set_input(0, input.as_nhwc(), TensorFormat::NHWC, TensorType::UInt8)?;

    debug!("执行模型推理");
    self.context.run()?;

    let output = self.context.get_outputs()?;
    let mut heads = Vec::with_capacity(YOLOV5_STRIDES.len());
    for idx in 0..YOLOV5_STRIDES.len() {
      heads.push(output.get_f32(idx)?);
    }

    Ok(postprocess(&heads, self.input_dimensions(), &self.config)?)
  }
}
