// 该文件是 Pico Detect 项目的一部分。
// src/output/record.rs - 检测结果记录输出
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

use std::{
  fs::File,
  io::{BufWriter, Write},
  path::{Path, PathBuf},
  sync::Mutex,
};

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, decode_url_path,
  frame::SourceFrame,
  model::{DetectResult, WithLabel},
  output::Render,
};

#[derive(Error, Debug)]
pub enum RecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("记录文件锁已失效")]
  LockPoisoned,
}

/// 将源空间检测结果按帧写入 JSON Lines 文件
///
/// `record:///var/log/detect?always&label=id`
///
/// - `always`：无检测结果的帧也写入
/// - `label=id`：只记录类别编号，默认记录类别名
pub struct RecordOutput {
  path: PathBuf,
  writer: Mutex<BufWriter<File>>,
  always: bool,
  label_with_name: bool,
}

impl FromUrlWithScheme for RecordOutput {
  const SCHEME: &'static str = "record";
}

impl FromUrl for RecordOutput {
  type Error = RecordOutputError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        uri.scheme()
      );
      return Err(RecordOutputError::SchemeMismatch);
    }

    let always = uri.query_pairs().any(|(k, _)| k == "always");
    let label_with_name = !uri.query_pairs().any(|(k, v)| k == "label" && v == "id");

    Self::create(decode_url_path(uri), always, label_with_name)
  }
}

impl RecordOutput {
  pub fn create(
    directory: impl AsRef<Path>,
    always: bool,
    label_with_name: bool,
  ) -> Result<Self, RecordOutputError> {
    let directory = directory.as_ref();
    std::fs::create_dir_all(directory)?;

    let path = directory.join(format!("detect-{}.jsonl", Utc::now().format("%Y%m%d-%H%M%S")));
    let file = File::create(&path)?;
    info!("检测结果记录到 {}", path.display());

    Ok(RecordOutput {
      path,
      writer: Mutex::new(BufWriter::new(file)),
      always,
      label_with_name,
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl<T: WithLabel> Render<SourceFrame, DetectResult<T>> for RecordOutput {
  type Error = RecordOutputError;

  fn render_result(
    &self,
    frame: &SourceFrame,
    result: &DetectResult<T>,
  ) -> Result<(), Self::Error> {
    if !self.always && result.is_empty() {
      return Ok(());
    }

    let detections: Vec<_> = result
      .iter()
      .map(|item| {
        let label = if self.label_with_name {
          item.kind.to_label_str()
        } else {
          item.kind.to_label_id().to_string()
        };
        json!({
          "label": label,
          "class_id": item.kind.to_label_id(),
          "score": item.score,
          "bbox": item.bbox.to_array(),
        })
      })
      .collect();
    let record = json!({
      "frame": frame.index,
      "timestamp_ms": frame.timestamp_ms,
      "time": Utc::now().to_rfc3339(),
      "detections": detections,
    });

    let mut writer = self
      .writer
      .lock()
      .map_err(|_| RecordOutputError::LockPoisoned)?;
    serde_json::to_writer(&mut *writer, &record)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    geometry::BoxRect,
    model::{CocoLabel, DetectItem},
  };
  use image::RgbImage;
  use serde_json::Value;

  fn frame(index: u64) -> SourceFrame {
    SourceFrame::new(RgbImage::new(4, 4), index, index * 33)
  }

  fn person() -> DetectResult<CocoLabel> {
    DetectResult::from(vec![DetectItem {
      kind: CocoLabel::from_label_id(0),
      score: 0.5,
      bbox: BoxRect::new(50, 50, 150, 190),
    }])
  }

  fn read_lines(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
      .unwrap()
      .lines()
      .map(|line| serde_json::from_str(line).unwrap())
      .collect()
  }

  #[test]
  fn writes_one_line_per_frame_with_detections() {
    let dir = tempfile::tempdir().unwrap();
    let url = Url::parse(&format!("record://{}", dir.path().display())).unwrap();
    let output = RecordOutput::from_url(&url).unwrap();

    output.render_result(&frame(0), &person()).unwrap();
    output
      .render_result(&frame(1), &DetectResult::<CocoLabel>::empty())
      .unwrap();

    let lines = read_lines(output.path());
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["frame"], 0);
    assert_eq!(lines[0]["detections"][0]["label"], "person");
    assert_eq!(lines[0]["detections"][0]["class_id"], 0);
    assert_eq!(
      lines[0]["detections"][0]["bbox"],
      serde_json::json!([50, 50, 150, 190])
    );
  }

  #[test]
  fn always_records_empty_frames_with_ids() {
    let dir = tempfile::tempdir().unwrap();
    let output = RecordOutput::create(dir.path().join("nested"), true, false).unwrap();

    output
      .render_result(&frame(3), &DetectResult::<CocoLabel>::empty())
      .unwrap();
    output.render_result(&frame(4), &person()).unwrap();

    let lines = read_lines(output.path());
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["frame"], 3);
    assert_eq!(lines[0]["timestamp_ms"], 99);
    assert!(lines[0]["detections"].as_array().unwrap().is_empty());
    assert_eq!(lines[1]["detections"][0]["label"], "0");
  }
}
