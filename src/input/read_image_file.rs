// 该文件是 Pico Detect 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, decode_url_path,
  frame::SourceFrame,
  geometry::{FrameDimensions, GeometryError},
};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("图像尺寸错误: {0}")]
  Dimensions(#[from] GeometryError),
  #[error("参数 {0} 的值无效: {1}")]
  InvalidQuery(String, String),
}

/// 读取单张图片作为源帧，`?repeat=N` 可重复输出 N 次（用于测速）
///
/// `image:///path/to/frame.jpg?repeat=100`
pub struct ImageFileInput {
  image: RgbImage,
  dimensions: FrameDimensions,
  repeat: u64,
  emitted: u64,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemeMismatch);
    }

    let repeat = match url.query_pairs().find(|(k, _)| k == "repeat") {
      Some((_, v)) => v
        .parse()
        .map_err(|_| ImageFileInputError::InvalidQuery("repeat".to_string(), v.to_string()))?,
      None => 1,
    };

    let path = decode_url_path(url);
    let image = ImageReader::open(&path)?.decode()?.to_rgb8();
    info!("读取图像 {}: {}x{}", path, image.width(), image.height());

    Self::from_image(image, repeat)
  }
}

impl ImageFileInput {
  pub fn from_image(image: RgbImage, repeat: u64) -> Result<Self, ImageFileInputError> {
    let dimensions = FrameDimensions::new(image.width(), image.height())?;
    Ok(Self {
      image,
      dimensions,
      repeat,
      emitted: 0,
    })
  }

  pub fn dimensions(&self) -> FrameDimensions {
    self.dimensions
  }
}

impl Iterator for ImageFileInput {
  type Item = SourceFrame;

  fn next(&mut self) -> Option<Self::Item> {
    if self.emitted >= self.repeat {
      return None;
    }
    let index = self.emitted;
    self.emitted += 1;
    Some(SourceFrame::new(self.image.clone(), index, 0))
  }
}
