// 该文件是 Pico Detect 项目的一部分。
// src/preprocess.rs - 信箱缩放预处理
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

use image::{
  Rgb, RgbImage,
  imageops::{self, FilterType},
};
use tracing::{debug, info};

use crate::{
  frame::SourceFrame,
  geometry::{FrameDimensions, GeometryError, Letterbox, LetterboxTransform},
};

/// 填充背景色（黑色）
pub const BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);

/// 填充后的模型输入图像及其对应的信箱变换。
///
/// 两者作为一个整体在线程间传递，推理结果必须用同一个 [`Letterbox`] 映射回源空间。
#[derive(Debug, Clone)]
pub struct LetterboxedFrame {
  image: RgbImage,
  letterbox: Letterbox,
}

impl LetterboxedFrame {
  pub fn image(&self) -> &RgbImage {
    &self.image
  }

  pub fn letterbox(&self) -> &Letterbox {
    &self.letterbox
  }

  pub fn transform(&self) -> &LetterboxTransform {
    self.letterbox.transform()
  }

  pub fn into_image(self) -> RgbImage {
    self.image
  }

  pub fn into_parts(self) -> (RgbImage, Letterbox) {
    (self.image, self.letterbox)
  }
}

impl Letterbox {
  /// 按双线性插值缩放源图像，并贴入背景色填充的模型尺寸画布。
  pub fn apply(&self, source: &RgbImage) -> Result<LetterboxedFrame, GeometryError> {
    let expected = self.source();
    if source.dimensions() != (expected.width(), expected.height()) {
      return Err(GeometryError::SourceMismatch {
        expected,
        actual_width: source.width(),
        actual_height: source.height(),
      });
    }

    let model = self.model();
    let (scaled_width, scaled_height) = self.scaled();
    let transform = self.transform();

    let mut canvas = RgbImage::from_pixel(model.width(), model.height(), BACKGROUND);
    let (x, y) = (transform.pad_left as i64, transform.pad_top as i64);
    if scaled_width == 0 || scaled_height == 0 {
      debug!("缩放后图像为空 ({}x{})，仅输出背景", scaled_width, scaled_height);
    } else if source.dimensions() == (scaled_width, scaled_height) {
      imageops::replace(&mut canvas, source, x, y);
    } else {
      let resized = imageops::resize(source, scaled_width, scaled_height, FilterType::Triangle);
      imageops::replace(&mut canvas, &resized, x, y);
    }

    Ok(LetterboxedFrame {
      image: canvas,
      letterbox: *self,
    })
  }
}

/// 对源图像做信箱缩放，返回模型尺寸的填充图像与变换参数。
pub fn letterbox(
  source: &RgbImage,
  source_dims: FrameDimensions,
  model_dims: FrameDimensions,
) -> Result<(RgbImage, LetterboxTransform), GeometryError> {
  let frame = Letterbox::new(source_dims, model_dims).apply(source)?;
  let transform = *frame.transform();
  Ok((frame.into_image(), transform))
}

/// 按（源尺寸，模型尺寸）缓存信箱变换，同一尺寸对的所有帧复用同一个值。
#[derive(Debug, Clone)]
pub struct LetterboxCache {
  model: FrameDimensions,
  current: Option<Letterbox>,
}

impl LetterboxCache {
  pub fn new(model: FrameDimensions) -> Self {
    Self {
      model,
      current: None,
    }
  }

  pub fn model(&self) -> FrameDimensions {
    self.model
  }

  pub fn current(&self) -> Option<&Letterbox> {
    self.current.as_ref()
  }

  pub fn letterbox_for(&mut self, source: FrameDimensions) -> Letterbox {
    match self.current {
      Some(letterbox) if letterbox.source() == source => letterbox,
      _ => {
        let letterbox = Letterbox::new(source, self.model);
        let transform = letterbox.transform();
        info!(
          "信箱变换: {} -> {}, 缩放 {:.4}, 填充 ({}, {})",
          source, self.model, transform.scale, transform.pad_left, transform.pad_top
        );
        self.current = Some(letterbox);
        letterbox
      }
    }
  }

  pub fn prepare(&mut self, frame: &SourceFrame) -> Result<LetterboxedFrame, GeometryError> {
    let source = frame.dimensions()?;
    self.letterbox_for(source).apply(&frame.image)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn dims(w: u32, h: u32) -> FrameDimensions {
    FrameDimensions::new(w, h).unwrap()
  }

  fn gradient(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
      Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    })
  }

  #[test]
  fn square_source_is_copied_unchanged() {
    let source = gradient(640, 640);
    let (padded, transform) = letterbox(&source, dims(640, 640), dims(640, 640)).unwrap();
    assert_eq!(transform.scale, 1.0);
    assert_eq!((transform.pad_left, transform.pad_top), (0, 0));
    assert_eq!(padded, source);
  }

  #[test]
  fn camera_frame_is_padded_top_and_bottom() {
    let source = RgbImage::from_pixel(320, 240, Rgb([200, 100, 50]));
    let (padded, transform) = letterbox(&source, dims(320, 240), dims(640, 640)).unwrap();
    assert_eq!(padded.dimensions(), (640, 640));
    assert_eq!(transform.pad_top, 80);

    for x in [0, 319, 639] {
      assert_eq!(*padded.get_pixel(x, 0), BACKGROUND);
      assert_eq!(*padded.get_pixel(x, 79), BACKGROUND);
      assert_eq!(*padded.get_pixel(x, 560), BACKGROUND);
      assert_eq!(*padded.get_pixel(x, 639), BACKGROUND);

      for y in [80, 320, 559] {
        let Rgb([r, g, b]) = *padded.get_pixel(x, y);
        assert!(r.abs_diff(200) <= 1 && g.abs_diff(100) <= 1 && b.abs_diff(50) <= 1);
      }
    }
  }

  #[test]
  fn odd_padding_leaves_extra_row_at_bottom() {
    let source = RgbImage::from_pixel(4, 1, Rgb([255, 255, 255]));
    let frame = Letterbox::new(dims(4, 1), dims(4, 4)).apply(&source).unwrap();
    assert_eq!(frame.transform().pad_top, 1);
    let image = frame.image();
    assert_eq!(*image.get_pixel(0, 0), BACKGROUND);
    assert_eq!(*image.get_pixel(0, 1), Rgb([255, 255, 255]));
    assert_eq!(*image.get_pixel(3, 1), Rgb([255, 255, 255]));
    assert_eq!(*image.get_pixel(0, 2), BACKGROUND);
    assert_eq!(*image.get_pixel(0, 3), BACKGROUND);
  }

  #[test]
  fn tall_source_is_padded_left_and_right() {
    let source = RgbImage::from_pixel(100, 200, Rgb([9, 9, 9]));
    let frame = Letterbox::new(dims(100, 200), dims(64, 64)).apply(&source).unwrap();
    assert_eq!(frame.letterbox().scaled(), (32, 64));
    assert_eq!(frame.transform().pad_left, 16);
    assert_eq!(*frame.image().get_pixel(15, 32), BACKGROUND);
    assert_eq!(*frame.image().get_pixel(48, 32), BACKGROUND);
    assert_ne!(*frame.image().get_pixel(16, 32), BACKGROUND);
  }

  #[test]
  fn mismatched_source_is_rejected() {
    let source = gradient(320, 200);
    let err = Letterbox::new(dims(320, 240), dims(640, 640))
      .apply(&source)
      .unwrap_err();
    assert!(matches!(
      err,
      GeometryError::SourceMismatch {
        actual_width: 320,
        actual_height: 200,
        ..
      }
    ));
  }

  #[test]
  fn cache_reuses_transform_for_same_source() {
    let mut cache = LetterboxCache::new(dims(640, 640));
    let first = cache.letterbox_for(dims(320, 240));
    let second = cache.letterbox_for(dims(320, 240));
    assert_eq!(first, second);

    let other = cache.letterbox_for(dims(640, 480));
    assert_eq!(other.transform().pad_top, 80);
    assert_eq!(cache.current(), Some(&other));
  }

  #[test]
  fn cache_prepares_source_frames() {
    let mut cache = LetterboxCache::new(dims(640, 640));
    let frame = SourceFrame::new(gradient(320, 240), 0, 0);
    let prepared = cache.prepare(&frame).unwrap();
    assert_eq!(prepared.image().dimensions(), (640, 640));
    assert_eq!(prepared.letterbox().source(), dims(320, 240));
  }
}
