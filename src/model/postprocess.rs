// 该文件是 Pico Detect 项目的一部分。
// src/model/postprocess.rs - YOLOv5 输出解码与非极大值抑制
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

//! YOLOv5 三个检测头的输出布局为 NCHW `[1, 3 * (5 + C), H, W]`，
//! RKNN 模型内已完成 sigmoid，这里直接按概率解码。

use thiserror::Error;
use tracing::{debug, error};

use crate::{
  geometry::{BoxRect, FrameDimensions},
  model::{DetectItem, DetectResult, WithLabel},
};

pub const YOLOV5_CLASS_NUM: usize = 80;
pub const YOLOV5_ANCHORS_PER_HEAD: usize = 3;
pub const YOLOV5_STRIDES: [u32; 3] = [8, 16, 32];
pub const YOLOV5_ANCHORS: [[[f32; 2]; YOLOV5_ANCHORS_PER_HEAD]; 3] = [
  [[10.0, 13.0], [16.0, 30.0], [33.0, 23.0]],
  [[30.0, 61.0], [62.0, 45.0], [59.0, 119.0]],
  [[116.0, 90.0], [156.0, 198.0], [373.0, 326.0]],
];

const DEFAULT_BOX_THRESHOLD: f32 = 0.25;
const DEFAULT_NMS_THRESHOLD: f32 = 0.45;
const DEFAULT_MAX_DETECTIONS: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PostprocessError {
  #[error("检测头数量错误: 期望 {expected}, 实际 {actual}")]
  HeadCount { expected: usize, actual: usize },
  #[error("检测头 {head} 大小不匹配: 期望 {expected}, 实际 {actual}")]
  HeadSize {
    head: usize,
    expected: usize,
    actual: usize,
  },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostprocessConfig {
  pub box_threshold: f32,
  pub nms_threshold: f32,
  pub max_detections: usize,
  pub class_num: usize,
}

impl Default for PostprocessConfig {
  fn default() -> Self {
    Self {
      box_threshold: DEFAULT_BOX_THRESHOLD,
      nms_threshold: DEFAULT_NMS_THRESHOLD,
      max_detections: DEFAULT_MAX_DETECTIONS,
      class_num: YOLOV5_CLASS_NUM,
    }
  }
}

/// 解码后、抑制前的候选框（模型空间，浮点）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
  pub class_id: u32,
  pub score: f32,
  pub x1: f32,
  pub y1: f32,
  pub x2: f32,
  pub y2: f32,
}

impl Candidate {
  fn area(&self) -> f32 {
    (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
  }

  pub fn iou(&self, other: &Candidate) -> f32 {
    let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
    let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
    let inter = w * h;
    let union = self.area() + other.area() - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
  }
}

/// 每个检测头期望的元素个数
pub fn head_len(model: FrameDimensions, stride: u32, class_num: usize) -> usize {
  let grid_h = (model.height() / stride) as usize;
  let grid_w = (model.width() / stride) as usize;
  YOLOV5_ANCHORS_PER_HEAD * (5 + class_num) * grid_h * grid_w
}

/// 解码单个检测头，将超过阈值的候选框追加到 `out`
pub fn decode_head(
  data: &[f32],
  grid_h: usize,
  grid_w: usize,
  stride: u32,
  anchors: &[[f32; 2]; YOLOV5_ANCHORS_PER_HEAD],
  config: &PostprocessConfig,
  out: &mut Vec<Candidate>,
) {
  let grid_len = grid_h * grid_w;
  let prop_size = 5 + config.class_num;
  let stride = stride as f32;

  for (a, anchor) in anchors.iter().enumerate() {
    let base = prop_size * a * grid_len;
    for i in 0..grid_h {
      for j in 0..grid_w {
        let cell = base + i * grid_w + j;
        let box_confidence = data[cell + 4 * grid_len];
        if box_confidence < config.box_threshold {
          continue;
        }

        let (class_id, class_prob) = (0..config.class_num)
          .map(|c| (c, data[cell + (5 + c) * grid_len]))
          .fold((0usize, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
        if class_prob <= config.box_threshold {
          continue;
        }

        let box_x = (data[cell] * 2.0 - 0.5 + j as f32) * stride;
        let box_y = (data[cell + grid_len] * 2.0 - 0.5 + i as f32) * stride;
        let box_w = (data[cell + 2 * grid_len] * 2.0).powi(2) * anchor[0];
        let box_h = (data[cell + 3 * grid_len] * 2.0).powi(2) * anchor[1];

        out.push(Candidate {
          class_id: class_id as u32,
          score: class_prob * box_confidence,
          x1: box_x - box_w / 2.0,
          y1: box_y - box_h / 2.0,
          x2: box_x + box_w / 2.0,
          y2: box_y + box_h / 2.0,
        });
      }
    }
  }
}

/// 按类别的非极大值抑制，结果按分数降序
pub fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
  candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
  for candidate in candidates {
    let suppressed = kept
      .iter()
      .any(|k| k.class_id == candidate.class_id && k.iou(&candidate) > iou_threshold);
    if !suppressed {
      kept.push(candidate);
    }
  }
  kept
}

/// 解码三个检测头并输出模型空间中的检测结果（坐标裁剪到模型输入范围）
pub fn postprocess<T: WithLabel>(
  heads: &[&[f32]],
  model: FrameDimensions,
  config: &PostprocessConfig,
) -> Result<DetectResult<T>, PostprocessError> {
  if heads.len() != YOLOV5_STRIDES.len() {
    error!("检测头数量错误: {}", heads.len());
    return Err(PostprocessError::HeadCount {
      expected: YOLOV5_STRIDES.len(),
      actual: heads.len(),
    });
  }

  let mut candidates = Vec::new();
  for (head, ((data, stride), anchors)) in heads
    .iter()
    .zip(YOLOV5_STRIDES)
    .zip(YOLOV5_ANCHORS.iter())
    .enumerate()
  {
    let expected = head_len(model, stride, config.class_num);
    if data.len() != expected {
      return Err(PostprocessError::HeadSize {
        head,
        expected,
        actual: data.len(),
      });
    }

    let grid_h = (model.height() / stride) as usize;
    let grid_w = (model.width() / stride) as usize;
    decode_head(data, grid_h, grid_w, stride, anchors, config, &mut candidates);
  }
  debug!("候选框数量: {}", candidates.len());

  let max_x = model.width() as f32;
  let max_y = model.height() as f32;
  let items: Vec<DetectItem<T>> = nms(candidates, config.nms_threshold)
    .into_iter()
    .take(config.max_detections)
    .map(|c| DetectItem {
      kind: T::from_label_id(c.class_id),
      score: c.score,
      bbox: BoxRect::new(
        c.x1.clamp(0.0, max_x) as i32,
        c.y1.clamp(0.0, max_y) as i32,
        c.x2.clamp(0.0, max_x) as i32,
        c.y2.clamp(0.0, max_y) as i32,
      ),
    })
    .collect();
  debug!("检测到 {} 个物体", items.len());

  Ok(items.into())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::CocoLabel;

  const CLASSES: usize = 2;

  fn config() -> PostprocessConfig {
    PostprocessConfig {
      class_num: CLASSES,
      ..PostprocessConfig::default()
    }
  }

  /// 在 (anchor, i, j) 处写入一个候选
  #[allow(clippy::too_many_arguments)]
  fn set_cell(
    data: &mut [f32],
    grid_h: usize,
    grid_w: usize,
    anchor: usize,
    i: usize,
    j: usize,
    xywh: [f32; 4],
    confidence: f32,
    class_probs: [f32; CLASSES],
  ) {
    let grid_len = grid_h * grid_w;
    let cell = (5 + CLASSES) * anchor * grid_len + i * grid_w + j;
    for (k, v) in xywh.iter().enumerate() {
      data[cell + k * grid_len] = *v;
    }
    data[cell + 4 * grid_len] = confidence;
    for (c, p) in class_probs.iter().enumerate() {
      data[cell + (5 + c) * grid_len] = *p;
    }
  }

  #[test]
  fn decodes_single_cell() {
    let (grid_h, grid_w) = (4, 4);
    let mut data = vec![0.0f32; 3 * (5 + CLASSES) * grid_h * grid_w];
    // 中心偏移 0.5 -> 0.5，宽高 0.5 -> 1.0 倍 anchor
    set_cell(&mut data, grid_h, grid_w, 1, 2, 1, [0.5, 0.5, 0.5, 0.5], 0.8, [0.1, 0.9]);

    let mut out = Vec::new();
    let anchors = [[10.0, 10.0], [20.0, 40.0], [30.0, 30.0]];
    decode_head(&data, grid_h, grid_w, 8, &anchors, &config(), &mut out);

    assert_eq!(out.len(), 1);
    let c = out[0];
    assert_eq!(c.class_id, 1);
    assert!((c.score - 0.72).abs() < 1e-6);
    // 中心 ((0.5 + 1) * 8, (0.5 + 2) * 8) = (12, 20)
    assert!((c.x1 - 2.0).abs() < 1e-4 && (c.x2 - 22.0).abs() < 1e-4);
    assert!((c.y1 - 0.0).abs() < 1e-4 && (c.y2 - 40.0).abs() < 1e-4);
  }

  #[test]
  fn low_confidence_is_skipped() {
    let (grid_h, grid_w) = (2, 2);
    let mut data = vec![0.0f32; 3 * (5 + CLASSES) * grid_h * grid_w];
    set_cell(&mut data, grid_h, grid_w, 0, 0, 0, [0.5; 4], 0.2, [0.9, 0.0]);
    set_cell(&mut data, grid_h, grid_w, 0, 1, 1, [0.5; 4], 0.9, [0.2, 0.1]);

    let mut out = Vec::new();
    decode_head(&data, grid_h, grid_w, 8, &YOLOV5_ANCHORS[0], &config(), &mut out);
    assert!(out.is_empty());
  }

  fn candidate(class_id: u32, score: f32, x1: f32) -> Candidate {
    Candidate {
      class_id,
      score,
      x1,
      y1: 0.0,
      x2: x1 + 10.0,
      y2: 10.0,
    }
  }

  #[test]
  fn nms_suppresses_same_class_only() {
    let kept = nms(
      vec![
        candidate(0, 0.5, 1.0),
        candidate(0, 0.9, 0.0),
        candidate(1, 0.7, 0.0),
        candidate(0, 0.4, 50.0),
      ],
      0.45,
    );
    let scores: Vec<f32> = kept.iter().map(|c| c.score).collect();
    assert_eq!(scores, vec![0.9, 0.7, 0.4]);
  }

  #[test]
  fn iou_of_disjoint_boxes_is_zero() {
    assert_eq!(candidate(0, 1.0, 0.0).iou(&candidate(0, 1.0, 20.0)), 0.0);
    assert!((candidate(0, 1.0, 0.0).iou(&candidate(0, 1.0, 0.0)) - 1.0).abs() < 1e-6);
  }

  #[test]
  fn postprocess_checks_head_shapes() {
    let model = FrameDimensions::new(64, 64).unwrap();
    let heads: Vec<Vec<f32>> = YOLOV5_STRIDES
      .iter()
      .map(|&s| vec![0.0; head_len(model, s, CLASSES)])
      .collect();
    let mut refs: Vec<&[f32]> = heads.iter().map(Vec::as_slice).collect();

    let result = postprocess::<CocoLabel>(&refs, model, &config()).unwrap();
    assert!(result.is_empty());

    refs.pop();
    assert_eq!(
      postprocess::<CocoLabel>(&refs, model, &config()).unwrap_err(),
      PostprocessError::HeadCount {
        expected: 3,
        actual: 2
      }
    );

    let short = vec![0.0f32; 7];
    refs.push(&short);
    assert!(matches!(
      postprocess::<CocoLabel>(&refs, model, &config()),
      Err(PostprocessError::HeadSize { head: 2, .. })
    ));
  }

  #[test]
  fn postprocess_clamps_to_model_input() {
    let model = FrameDimensions::new(64, 64).unwrap();
    let mut heads: Vec<Vec<f32>> = YOLOV5_STRIDES
      .iter()
      .map(|&s| vec![0.0; head_len(model, s, CLASSES)])
      .collect();
    // stride 32 检测头 2x2，大 anchor 超出画面
    set_cell(&mut heads[2], 2, 2, 2, 1, 1, [0.5, 0.5, 0.5, 0.5], 0.9, [0.9, 0.0]);
    let refs: Vec<&[f32]> = heads.iter().map(Vec::as_slice).collect();

    let result = postprocess::<CocoLabel>(&refs, model, &config()).unwrap();
    assert_eq!(result.len(), 1);
    let item = &result.items[0];
    assert_eq!(item.kind, CocoLabel::from_label_id(0));
    assert_eq!(item.bbox, BoxRect::new(0, 0, 64, 64));
  }
}
