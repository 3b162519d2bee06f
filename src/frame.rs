// 该文件是 Pico Detect 项目的一部分。
// src/frame.rs - 源帧与 NHWC 模型输入帧定义
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

use image::RgbImage;
use thiserror::Error;

use crate::geometry::{FrameDimensions, GeometryError};

const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
  #[error("图像尺寸不匹配: 期望 {expected_width}x{expected_height}, 实际 {width}x{height}")]
  SizeMismatch {
    expected_width: u32,
    expected_height: u32,
    width: u32,
    height: u32,
  },
}

/// 摄像头（或文件）送来的一帧原始图像，交错三通道
#[derive(Debug, Clone)]
pub struct SourceFrame {
  pub image: RgbImage,
  pub index: u64,
  pub timestamp_ms: u64,
}

impl SourceFrame {
  pub fn new(image: RgbImage, index: u64, timestamp_ms: u64) -> Self {
    Self {
      image,
      index,
      timestamp_ms,
    }
  }

  pub fn dimensions(&self) -> Result<FrameDimensions, GeometryError> {
    FrameDimensions::new(self.image.width(), self.image.height())
  }
}

pub trait AsNhwcFrame {
  fn as_nhwc(&self) -> &[u8];
}

/// 从信箱缩放后的图像构造模型输入
pub trait ModelInput: Sized {
  fn from_letterboxed(image: &RgbImage) -> Result<Self, FrameError>;
}

impl ModelInput for RgbImage {
  fn from_letterboxed(image: &RgbImage) -> Result<Self, FrameError> {
    Ok(image.clone())
  }
}

/// 固定尺寸的 NHWC 帧，推理引擎直接按字节读取
#[derive(Debug, Clone)]
pub struct RgbNhwcFrame<const W: u32, const H: u32> {
  data: Box<[u8]>,
}

impl<const W: u32, const H: u32> RgbNhwcFrame<W, H> {
  pub const LEN: usize = RGB_CHANNELS * W as usize * H as usize;

  pub fn height(&self) -> usize {
    H as usize
  }

  pub fn width(&self) -> usize {
    W as usize
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn dimensions() -> FrameDimensions {
    FrameDimensions::const_new(W, H)
  }
}

impl<const W: u32, const H: u32> TryFrom<Vec<u8>> for RgbNhwcFrame<W, H> {
  type Error = FrameError;

  fn try_from(data: Vec<u8>) -> Result<Self, Self::Error> {
    if data.len() != Self::LEN {
      return Err(FrameError::LengthMismatch {
        expected: Self::LEN,
        actual: data.len(),
      });
    }

    Ok(Self {
      data: data.into_boxed_slice(),
    })
  }
}

impl<const W: u32, const H: u32> Default for RgbNhwcFrame<W, H> {
  fn default() -> Self {
    Self {
      data: vec![0u8; Self::LEN].into_boxed_slice(),
    }
  }
}

impl<const W: u32, const H: u32> AsMut<[u8]> for RgbNhwcFrame<W, H> {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

impl<const W: u32, const H: u32> AsNhwcFrame for RgbNhwcFrame<W, H> {
  fn as_nhwc(&self) -> &[u8] {
    &self.data
  }
}

impl<const W: u32, const H: u32> ModelInput for RgbNhwcFrame<W, H> {
  fn from_letterboxed(image: &RgbImage) -> Result<Self, FrameError> {
    if image.dimensions() != (W, H) {
      return Err(FrameError::SizeMismatch {
        expected_width: W,
        expected_height: H,
        width: image.width(),
        height: image.height(),
      });
    }

    // RgbImage 本身就是行优先的交错布局
    Self::try_from(image.as_raw().clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  #[test]
  fn nhwc_keeps_interleaved_layout() {
    let image = RgbImage::from_fn(4, 2, |x, y| Rgb([x as u8, y as u8, 7]));
    let frame = RgbNhwcFrame::<4, 2>::from_letterboxed(&image).unwrap();
    let data = frame.as_nhwc();
    assert_eq!(data.len(), 4 * 2 * 3);
    // (x=1, y=1)
    assert_eq!(&data[(4 + 1) * 3..(4 + 1) * 3 + 3], &[1, 1, 7]);
  }

  #[test]
  fn wrong_size_is_rejected() {
    let image = RgbImage::new(4, 3);
    let err = RgbNhwcFrame::<4, 2>::from_letterboxed(&image).unwrap_err();
    assert_eq!(
      err,
      FrameError::SizeMismatch {
        expected_width: 4,
        expected_height: 2,
        width: 4,
        height: 3
      }
    );
  }

  #[test]
  fn short_buffer_is_rejected() {
    let err = RgbNhwcFrame::<2, 2>::try_from(vec![0u8; 5]).unwrap_err();
    assert_eq!(
      err,
      FrameError::LengthMismatch {
        expected: 12,
        actual: 5
      }
    );
  }

  #[test]
  fn empty_source_has_no_dimensions() {
    let frame = SourceFrame::new(RgbImage::new(0, 0), 3, 0);
    assert!(frame.dimensions().is_err());
  }
}
