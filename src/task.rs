// 该文件是 Pico Detect 项目的一部分。
// src/task.rs - 检测任务循环
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
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
    mpsc::{self, TrySendError},
  },
  thread,
  time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
  detector::{Detector, DetectorError},
  frame::SourceFrame,
  model::{DetectResult, Model, WithLabel},
  output::Render,
};

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, detector: Detector<M>, output: O) -> Result<(), Self::Error>;
}

/// 安装 Ctrl-C 处理：置位停止标志，30 秒内未退出则强制结束进程
pub fn install_interrupt_handler(stop: Arc<AtomicBool>) -> Result<(), ctrlc::Error> {
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    stop.store(true, Ordering::SeqCst);
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })
}

/// 单帧错误只丢弃该帧，其余错误向上传递
fn skip_frame_local(frame: &SourceFrame, err: DetectorError) -> Result<(), DetectorError> {
  if err.is_frame_local() {
    warn!("跳过第 {} 帧: {}", frame.index, err);
    Ok(())
  } else {
    Err(err)
  }
}

pub struct OneShotTask;

impl<T, RE, I, M, O> Task<I, M, O> for OneShotTask
where
  T: WithLabel,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = SourceFrame>,
  M: Model<Output = DetectResult<T>>,
  M::Error: std::error::Error + Sync + Send + 'static,
  O: Render<SourceFrame, DetectResult<T>, Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, mut detector: Detector<M>, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
    info!("输入帧获取成功，开始推理...");
    let now = Instant::now();
    let result = detector.detect(&frame)?;
    info!("推理完成，耗时: {:.2?}", now.elapsed());
    output.render_result(&frame, &result)?;
    info!("渲染完成，耗时: {:.2?}", now.elapsed());

    Ok(())
  }
}

/// 逐帧串行处理：信箱缩放、推理、映射、输出
#[derive(Default, Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
  stop: Arc<AtomicBool>,
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
    self.stop = stop;
    self
  }
}

impl<T, RE, I, M, O> Task<I, M, O> for ContinuousTask
where
  T: WithLabel,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = SourceFrame>,
  M: Model<Output = DetectResult<T>>,
  M::Error: std::error::Error + Sync + Send + 'static,
  O: Render<SourceFrame, DetectResult<T>, Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, mut detector: Detector<M>, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");

    let mut processed = 0usize;
    for frame in input {
      if self.stop.load(Ordering::SeqCst) {
        warn!("中断信号接收，退出任务循环");
        break;
      }

      let now = Instant::now();
      match detector.detect(&frame) {
        Ok(result) => {
          let elapsed_a = now.elapsed();
          output.render_result(&frame, &result)?;
          debug!(
            "第 {} 帧完成，耗时: {:.2?} / {:.2?}",
            frame.index,
            elapsed_a,
            now.elapsed()
          );
        }
        Err(e) => skip_frame_local(&frame, e)?,
      }

      processed += 1;
      if self.frame_number.is_some_and(|n| processed >= n) {
        info!("达到指定帧数 {}, 退出任务循环", processed);
        break;
      }
    }

    info!("任务完成，共处理 {} 帧", processed);
    Ok(())
  }
}

/// 采集线程完成信箱缩放，调用线程负责推理与输出。
///
/// 两个线程之间通过容量为 2 的通道传递（源帧，填充帧）对；
/// 推理跟不上时默认丢弃新帧，不阻塞采集。
#[derive(Debug)]
pub struct PipelinedTask {
  frame_number: Option<usize>,
  stop: Arc<AtomicBool>,
  drop_frames: bool,
}

impl Default for PipelinedTask {
  fn default() -> Self {
    Self {
      frame_number: None,
      stop: Arc::default(),
      drop_frames: true,
    }
  }
}

impl PipelinedTask {
  const QUEUE_DEPTH: usize = 2;

  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
    self.stop = stop;
    self
  }

  /// 为 false 时队列满则阻塞采集线程，不丢帧
  pub fn with_drop_frames(mut self, drop_frames: bool) -> Self {
    self.drop_frames = drop_frames;
    self
  }
}

impl<T, RE, I, M, O> Task<I, M, O> for PipelinedTask
where
  T: WithLabel,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = SourceFrame> + Send,
  M: Model<Output = DetectResult<T>>,
  M::Error: std::error::Error + Sync + Send + 'static,
  O: Render<SourceFrame, DetectResult<T>, Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, detector: Detector<M>, output: O) -> Result<(), Self::Error> {
    info!("开始流水线任务...");
    let mut preprocessor = detector.preprocessor();
    let stop = self.stop.as_ref();
    let drop_frames = self.drop_frames;

    thread::scope(|s| -> anyhow::Result<()> {
      let (tx, rx) = mpsc::sync_channel(Self::QUEUE_DEPTH);

      s.spawn(move || {
        let mut dropped = 0u64;
        for frame in input {
          if stop.load(Ordering::SeqCst) {
            break;
          }
          let prepared = match preprocessor.prepare(&frame) {
            Ok(prepared) => prepared,
            Err(e) => {
              warn!("跳过第 {} 帧: {}", frame.index, e);
              continue;
            }
          };
          let sent = if drop_frames {
            match tx.try_send((frame, prepared)) {
              Ok(()) => true,
              Err(TrySendError::Full((frame, _))) => {
                dropped += 1;
                debug!("推理繁忙，丢弃第 {} 帧", frame.index);
                true
              }
              Err(TrySendError::Disconnected(_)) => false,
            }
          } else {
            tx.send((frame, prepared)).is_ok()
          };
          if !sent {
            break;
          }
        }
        info!("采集线程退出，丢弃 {} 帧", dropped);
      });

      let mut processed = 0usize;
      for (frame, prepared) in rx {
        let now = Instant::now();
        match detector.infer(&prepared) {
          Ok(result) => output.render_result(&frame, &result)?,
          Err(e) => {
            if let Err(e) = skip_frame_local(&frame, e) {
              stop.store(true, Ordering::SeqCst);
              return Err(e.into());
            }
          }
        }
        debug!("第 {} 帧完成，耗时: {:.2?}", frame.index, now.elapsed());

        processed += 1;
        if self.frame_number.is_some_and(|n| processed >= n) {
          info!("达到指定帧数 {}, 退出任务循环", processed);
          stop.store(true, Ordering::SeqCst);
          break;
        }
        if stop.load(Ordering::SeqCst) {
          warn!("中断信号接收，退出任务循环");
          break;
        }
      }

      info!("任务完成，共处理 {} 帧", processed);
      Ok(())
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    frame::FrameError,
    geometry::{BoxRect, FrameDimensions},
    model::{CocoLabel, DetectItem},
  };
  use crate::output::{FrameSink, FrameTee, OutputError};
  use image::RgbImage;
  use std::sync::Mutex;
  use thiserror::Error;

  #[derive(Debug, Error)]
  #[error("stub")]
  struct StubError;

  /// 每帧在模型空间中心报告一个固定框
  struct CenterModel;

  impl Model for CenterModel {
    type Input = RgbImage;
    type Output = DetectResult<CocoLabel>;
    type Error = StubError;

    fn input_dimensions(&self) -> FrameDimensions {
      FrameDimensions::new(64, 64).unwrap()
    }

    fn infer(&self, _input: &RgbImage) -> Result<Self::Output, Self::Error> {
      Ok(DetectResult::from(vec![DetectItem {
        kind: CocoLabel::from_label_id(0),
        score: 0.8,
        bbox: BoxRect::new(16, 24, 48, 40),
      }]))
    }
  }

  #[derive(Default)]
  struct Collect {
    seen: Mutex<Vec<(u64, Vec<BoxRect>)>>,
  }

  impl Render<SourceFrame, DetectResult<CocoLabel>> for Collect {
    type Error = FrameError;

    fn render_result(
      &self,
      frame: &SourceFrame,
      result: &DetectResult<CocoLabel>,
    ) -> Result<(), Self::Error> {
      let boxes = result.iter().map(|item| item.bbox).collect();
      self.seen.lock().unwrap().push((frame.index, boxes));
      Ok(())
    }
  }

  fn frames(sizes: &[(u32, u32)]) -> Vec<SourceFrame> {
    sizes
      .iter()
      .enumerate()
      .map(|(i, &(w, h))| SourceFrame::new(RgbImage::new(w, h), i as u64, 0))
      .collect()
  }

  #[test]
  fn one_shot_uses_first_frame() {
    let collect = Collect::default();
    OneShotTask
      .run_task(
        frames(&[(32, 16), (32, 16)]).into_iter(),
        Detector::new(CenterModel),
        &collect,
      )
      .unwrap();
    let seen = collect.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    // 32x16 -> 64x64: scale 2, pad_top 16
    assert_eq!(seen[0].1, vec![BoxRect::new(8, 4, 24, 12)]);
  }

  #[test]
  fn one_shot_without_frames_fails() {
    let collect = Collect::default();
    let err = OneShotTask.run_task(
      Vec::<SourceFrame>::new().into_iter(),
      Detector::new(CenterModel),
      &collect,
    );
    assert!(err.is_err());
  }

  #[test]
  fn continuous_skips_bad_frames_and_honours_limit() {
    let collect = Collect::default();
    ContinuousTask::default()
      .with_frame_number(Some(3))
      .run_task(
        frames(&[(32, 16), (0, 0), (32, 16), (32, 16)]).into_iter(),
        Detector::new(CenterModel),
        &collect,
      )
      .unwrap();
    let seen = collect.seen.lock().unwrap();
    let indices: Vec<u64> = seen.iter().map(|(i, _)| *i).collect();
    assert_eq!(indices, vec![0, 2]);
  }

  #[test]
  fn continuous_stops_when_flag_is_set() {
    let collect = Collect::default();
    let stop = Arc::new(AtomicBool::new(true));
    ContinuousTask::default()
      .with_stop_flag(stop)
      .run_task(
        frames(&[(32, 16)]).into_iter(),
        Detector::new(CenterModel),
        &collect,
      )
      .unwrap();
    assert!(collect.seen.lock().unwrap().is_empty());
  }

  #[test]
  fn pipelined_keeps_frame_and_transform_together() {
    let collect = Collect::default();
    PipelinedTask::default()
      .with_drop_frames(false)
      .run_task(
        frames(&[(32, 16), (16, 32), (0, 0), (64, 64)]).into_iter(),
        Detector::new(CenterModel),
        &collect,
      )
      .unwrap();
    let seen = collect.seen.lock().unwrap();
    assert_eq!(
      *seen,
      vec![
        (0, vec![BoxRect::new(8, 4, 24, 12)]),
        // 16x32 -> 64x64: scale 2, pad_left 16
        (1, vec![BoxRect::new(0, 12, 16, 20)]),
        (3, vec![BoxRect::new(16, 24, 48, 40)]),
      ]
    );
  }

  #[test]
  fn pipelined_honours_frame_limit() {
    let collect = Collect::default();
    PipelinedTask::default()
      .with_drop_frames(false)
      .with_frame_number(Some(2))
      .run_task(
        frames(&[(32, 16); 10]).into_iter(),
        Detector::new(CenterModel),
        &collect,
      )
      .unwrap();
    assert_eq!(collect.seen.lock().unwrap().len(), 2);
  }

  struct Streamed(Arc<Mutex<Vec<u64>>>);

  impl FrameSink for Streamed {
    fn push_frame(&self, frame: &SourceFrame) -> Result<(), OutputError> {
      self.0.lock().unwrap().push(frame.index);
      Ok(())
    }
  }

  #[test]
  fn stream_sees_frames_skipped_by_detection() {
    let streamed = Arc::new(Mutex::new(Vec::new()));
    let input = FrameTee::new(frames(&[(32, 16), (0, 0), (32, 16)]).into_iter())
      .with_sink(Box::new(Streamed(streamed.clone())));
    let collect = Collect::default();
    ContinuousTask::default()
      .run_task(input, Detector::new(CenterModel), &collect)
      .unwrap();

    assert_eq!(collect.seen.lock().unwrap().len(), 2);
    assert_eq!(*streamed.lock().unwrap(), vec![0, 1, 2]);
  }

  #[test]
  fn stream_sees_frames_dropped_by_pipeline() {
    let streamed = Arc::new(Mutex::new(Vec::new()));
    let input = FrameTee::new(frames(&[(32, 16); 20]).into_iter())
      .with_sink(Box::new(Streamed(streamed.clone())));
    let collect = Collect::default();
    PipelinedTask::default()
      .run_task(input, Detector::new(CenterModel), &collect)
      .unwrap();

    let processed = collect.seen.lock().unwrap().len();
    assert!((1..=20).contains(&processed));
    assert_eq!(*streamed.lock().unwrap(), (0..20).collect::<Vec<u64>>());
  }
}
