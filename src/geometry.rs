// 该文件是 Pico Detect 项目的一部分。
// src/geometry.rs - 信箱变换几何与坐标映射
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

//! # 信箱变换几何
//!
//! 摄像头帧（源空间）按统一比例缩放后居中贴入模型输入（模型空间），
//! 剩余部分以背景色填充。本模块只负责其中的数值部分：
//!
//! - [`LetterboxTransform`]：缩放比例与左、上填充
//! - [`Letterbox`]：变换与其对应的（源尺寸，模型尺寸）绑定在一起的不可变值
//! - [`map_to_source`] / [`map_to_model`]：两个空间之间的点映射
//!
//! 所有取整均为截断（向零取整），与摄像头端的参考实现逐位一致。

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeometryError {
  #[error("无效的尺寸: {width}x{height}")]
  InvalidDimensions { width: u32, height: u32 },
  #[error("源图像尺寸不匹配: 期望 {expected}, 实际 {actual_width}x{actual_height}")]
  SourceMismatch {
    expected: FrameDimensions,
    actual_width: u32,
    actual_height: u32,
  },
}

/// 帧尺寸，宽高均为正数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameDimensions {
  width: u32,
  height: u32,
}

impl FrameDimensions {
  pub fn new(width: u32, height: u32) -> Result<Self, GeometryError> {
    if width == 0 || height == 0 {
      return Err(GeometryError::InvalidDimensions { width, height });
    }
    Ok(Self { width, height })
  }

  /// 供常量上下文使用，零尺寸在编译期报错
  pub const fn const_new(width: u32, height: u32) -> Self {
    assert!(width > 0 && height > 0, "帧尺寸必须为正数");
    Self { width, height }
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }
}

impl fmt::Display for FrameDimensions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}x{}", self.width, self.height)
  }
}

/// 像素坐标，可位于模型空间或源空间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Point2D {
  pub x: i32,
  pub y: i32,
}

impl Point2D {
  pub fn new(x: i32, y: i32) -> Self {
    Self { x, y }
  }
}

/// 模型空间与源空间之间的变换参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxTransform {
  pub scale: f32,
  pub pad_left: i32,
  pub pad_top: i32,
}

impl LetterboxTransform {
  /// 计算变换以及缩放后的图像尺寸 `(scaled_width, scaled_height)`。
  ///
  /// 比例取两轴比例的较小值；缩放尺寸与填充都按截断取整，
  /// 奇数余量的多出一个像素落在右侧/底部。
  pub fn compute(source: FrameDimensions, model: FrameDimensions) -> (Self, (u32, u32)) {
    let scale_x = model.width as f32 / source.width as f32;
    let scale_y = model.height as f32 / source.height as f32;
    let scale = if scale_x < scale_y { scale_x } else { scale_y };

    let scaled_width = (source.width as f32 * scale) as i32;
    let scaled_height = (source.height as f32 * scale) as i32;

    let pad_left = (model.width as i32 - scaled_width) / 2;
    let pad_top = (model.height as i32 - scaled_height) / 2;

    (
      Self {
        scale,
        pad_left,
        pad_top,
      },
      (scaled_width as u32, scaled_height as u32),
    )
  }
}

/// 将模型空间中的点映射回源空间。
///
/// 不做边界检查：填充带内的点会得到负数或越界坐标，由调用方负责裁剪。
pub fn map_to_source(point: Point2D, transform: &LetterboxTransform) -> Point2D {
  let mx = point.x - transform.pad_left;
  let my = point.y - transform.pad_top;
  Point2D {
    x: (mx as f32 / transform.scale) as i32,
    y: (my as f32 / transform.scale) as i32,
  }
}

/// 将源空间中的点映射到模型空间。
///
/// 与 [`map_to_source`] 组成往返：`scale >= 1` 时误差不超过 1 像素，
/// 缩小时误差上限为 `ceil(1 / scale)` 像素。
pub fn map_to_model(point: Point2D, transform: &LetterboxTransform) -> Point2D {
  Point2D {
    x: (point.x as f32 * transform.scale) as i32 + transform.pad_left,
    y: (point.y as f32 * transform.scale) as i32 + transform.pad_top,
  }
}

/// 与尺寸对绑定的信箱变换。
///
/// 只能通过 [`Letterbox::new`] 由一对尺寸推导得到，推理前的预处理与推理后的
/// 坐标映射共用同一个值，避免分别重新计算导致的浮点差异。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  source: FrameDimensions,
  model: FrameDimensions,
  transform: LetterboxTransform,
  scaled: (u32, u32),
}

impl Letterbox {
  pub fn new(source: FrameDimensions, model: FrameDimensions) -> Self {
    let (transform, scaled) = LetterboxTransform::compute(source, model);
    Self {
      source,
      model,
      transform,
      scaled,
    }
  }

  pub fn source(&self) -> FrameDimensions {
    self.source
  }

  pub fn model(&self) -> FrameDimensions {
    self.model
  }

  pub fn transform(&self) -> &LetterboxTransform {
    &self.transform
  }

  /// 缩放后（未填充）图像的尺寸，极端长宽比下可能为 0
  pub fn scaled(&self) -> (u32, u32) {
    self.scaled
  }

  /// 模型空间中实际图像所占区域（右、下为开区间）
  pub fn scaled_region(&self) -> BoxRect {
    BoxRect {
      left: self.transform.pad_left,
      top: self.transform.pad_top,
      right: self.transform.pad_left + self.scaled.0 as i32,
      bottom: self.transform.pad_top + self.scaled.1 as i32,
    }
  }

  pub fn is_identity(&self) -> bool {
    self.source == self.model
  }

  pub fn map_to_source(&self, point: Point2D) -> Point2D {
    map_to_source(point, &self.transform)
  }

  pub fn map_to_model(&self, point: Point2D) -> Point2D {
    map_to_model(point, &self.transform)
  }
}

/// 轴对齐矩形框，坐标为 `[left, top, right, bottom]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BoxRect {
  pub left: i32,
  pub top: i32,
  pub right: i32,
  pub bottom: i32,
}

impl BoxRect {
  pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
    Self {
      left,
      top,
      right,
      bottom,
    }
  }

  pub fn width(&self) -> i32 {
    self.right - self.left
  }

  pub fn height(&self) -> i32 {
    self.bottom - self.top
  }

  pub fn is_empty(&self) -> bool {
    self.width() <= 0 || self.height() <= 0
  }

  pub fn top_left(&self) -> Point2D {
    Point2D::new(self.left, self.top)
  }

  pub fn bottom_right(&self) -> Point2D {
    Point2D::new(self.right, self.bottom)
  }

  pub fn to_array(&self) -> [i32; 4] {
    [self.left, self.top, self.right, self.bottom]
  }

  /// 裁剪到帧范围内：左、上取 `[0, w - 1]`，右、下为开边界取 `[0, w]`
  pub fn clamp_to(&self, dims: FrameDimensions) -> Self {
    let (w, h) = (dims.width as i32, dims.height as i32);
    Self {
      left: self.left.clamp(0, w - 1),
      top: self.top.clamp(0, h - 1),
      right: self.right.clamp(0, w),
      bottom: self.bottom.clamp(0, h),
    }
  }

  /// 两个角点分别映射回源空间，并裁剪到源帧范围内
  pub fn map_to_source(&self, letterbox: &Letterbox) -> Self {
    let top_left = letterbox.map_to_source(self.top_left());
    let bottom_right = letterbox.map_to_source(self.bottom_right());
    Self {
      left: top_left.x,
      top: top_left.y,
      right: bottom_right.x,
      bottom: bottom_right.y,
    }
    .clamp_to(letterbox.source)
  }
}
