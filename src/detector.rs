// 该文件是 Pico Detect 项目的一部分。
// src/detector.rs - 预处理、推理与坐标映射串联
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
use tracing::debug;

use crate::{
  frame::{FrameError, ModelInput, SourceFrame},
  geometry::GeometryError,
  model::{DetectResult, Model},
  preprocess::{LetterboxCache, LetterboxedFrame},
};

#[derive(Error, Debug)]
pub enum DetectorError {
  #[error("几何变换错误: {0}")]
  Geometry(#[from] GeometryError),
  #[error("模型输入错误: {0}")]
  Frame(#[from] FrameError),
  #[error("模型推理错误: {0}")]
  Model(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl DetectorError {
  /// 仅影响当前帧的错误，调用方可以跳过该帧继续处理
  pub fn is_frame_local(&self) -> bool {
    matches!(self, DetectorError::Geometry(_) | DetectorError::Frame(_))
  }
}

/// 源帧 -> 信箱缩放 -> 模型推理 -> 映射回源空间
pub struct Detector<M> {
  model: M,
  cache: LetterboxCache,
}

impl<M: Model> Detector<M> {
  pub fn new(model: M) -> Self {
    let cache = LetterboxCache::new(model.input_dimensions());
    Self { model, cache }
  }

  pub fn model(&self) -> &M {
    &self.model
  }

  /// 预处理器的独立副本，可交给采集线程使用
  pub fn preprocessor(&self) -> LetterboxCache {
    self.cache.clone()
  }

  pub fn prepare(&mut self, frame: &SourceFrame) -> Result<LetterboxedFrame, GeometryError> {
    self.cache.prepare(frame)
  }
}

impl<M, T> Detector<M>
where
  M: Model<Output = DetectResult<T>>,
  M::Error: std::error::Error + Send + Sync + 'static,
{
  /// 对已完成信箱缩放的帧推理，结果使用同一帧附带的变换映射回源空间
  pub fn infer(&self, prepared: &LetterboxedFrame) -> Result<DetectResult<T>, DetectorError> {
    let input = M::Input::from_letterboxed(prepared.image())?;
    let result = self
      .model
      .infer(&input)
      .map_err(|e| DetectorError::Model(Box::new(e)))?;
    debug!("模型空间检测数: {}", result.len());
    Ok(result.map_to_source(prepared.letterbox()))
  }

  pub fn detect(&mut self, frame: &SourceFrame) -> Result<DetectResult<T>, DetectorError> {
    let prepared = self.prepare(frame)?;
    self.infer(&prepared)
  }
}
