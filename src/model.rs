// 该文件是 Pico Detect 项目的一部分。
// src/model.rs - 模型
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

use tracing::debug;

use crate::{
  frame::ModelInput,
  geometry::{BoxRect, FrameDimensions, Letterbox},
};

/// 推理引擎接口：输入为模型尺寸的填充图像，输出为模型空间中的检测结果
pub trait Model {
  type Input: ModelInput;
  type Output;
  type Error;

  fn input_dimensions(&self) -> FrameDimensions;
  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem<T> {
  pub kind: T,
  pub score: f32,
  pub bbox: BoxRect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectResult<T> {
  pub items: Box<[DetectItem<T>]>,
}

impl<T> DetectResult<T> {
  pub fn empty() -> Self {
    Self {
      items: Box::new([]),
    }
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, DetectItem<T>> {
    self.items.iter()
  }

  /// 将模型空间的检测框映射回源空间并裁剪到源帧范围，丢弃裁剪后退化的框
  pub fn map_to_source(self, letterbox: &Letterbox) -> Self {
    let before = self.items.len();
    let items: Box<[DetectItem<T>]> = self
      .items
      .into_vec()
      .into_iter()
      .filter_map(|item| {
        let bbox = item.bbox.map_to_source(letterbox);
        (!bbox.is_empty()).then_some(DetectItem { bbox, ..item })
      })
      .collect();

    if items.len() != before {
      debug!("丢弃 {} 个落在填充区域内的检测框", before - items.len());
    }

    Self { items }
  }
}

impl<T> From<Vec<DetectItem<T>>> for DetectResult<T> {
  fn from(items: Vec<DetectItem<T>>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

pub trait WithLabel: Sized + std::fmt::Debug {
  fn to_label_str(&self) -> String;
  fn to_label_id(&self) -> u32;
  fn from_label_id(id: u32) -> Self;
}

mod label;
pub use self::label::{COCO_LABELS, CocoLabel};

pub mod postprocess;

#[cfg(feature = "model_yolov5")]
mod yolov5;
#[cfg(feature = "model_yolov5")]
pub use self::yolov5::{Yolov5, Yolov5Builder, Yolov5Error};
