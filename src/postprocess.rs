// 该文件是 Qianli （千里眼） 项目的一部分。
// src/postprocess.rs - 检测输出解码与非极大值抑制
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

use std::{fmt, str::FromStr};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::{preprocess::PreprocessParams, runtime::Shape};

const BOX_CHANNELS: usize = 4;

pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.25;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.65;
pub const DEFAULT_TOPK: usize = 100;
pub const DEFAULT_NUM_LABELS: usize = 80;

#[derive(Error, Debug)]
pub enum PostprocessError {
  #[error("输出张量形状无效: {0}, 期望 (通道, 锚点) 或 (1, 通道, 锚点)")]
  InvalidShape(Shape),
  #[error("输出通道数 {channels} 不足以容纳 4 个框参数和 {labels} 个类别分数")]
  TooFewChannels { channels: usize, labels: usize },
  #[error("输出数据被截断: 期望 {expected} 个元素, 实际 {actual} 个")]
  TruncatedOutput { expected: usize, actual: usize },
  #[error("类别数必须大于 0")]
  NoLabels,
  #[error("无效的抑制模式: {0}")]
  InvalidNmsMode(String),
}

/// 左上角坐标与宽高，单位为原图像素
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Rect {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

impl Rect {
  pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
    Self {
      x,
      y,
      width,
      height,
    }
  }

  pub fn from_corners(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
    Self::new(x0, y0, x1 - x0, y1 - y0)
  }

  pub fn right(&self) -> f32 {
    self.x + self.width
  }

  pub fn bottom(&self) -> f32 {
    self.y + self.height
  }

  pub fn area(&self) -> f32 {
    self.width.max(0.0) * self.height.max(0.0)
  }

  pub fn iou(&self, other: &Rect) -> f32 {
    let iw = (self.right().min(other.right()) - self.x.max(other.x)).max(0.0);
    let ih = (self.bottom().min(other.bottom()) - self.y.max(other.y)).max(0.0);
    let inter = iw * ih;
    let union = self.area() + other.area() - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
  pub rect: Rect,
  /// 类别序号，范围 `[0, num_labels)`
  pub label: usize,
  pub confidence: f32,
}

/// 非极大值抑制的作用范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NmsMode {
  /// 所有类别一起抑制
  #[default]
  ClassAgnostic,
  /// 只在同类别之间抑制
  PerClass,
}

impl FromStr for NmsMode {
  type Err = PostprocessError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "agnostic" | "class-agnostic" => Ok(NmsMode::ClassAgnostic),
      "class" | "per-class" => Ok(NmsMode::PerClass),
      other => Err(PostprocessError::InvalidNmsMode(other.to_string())),
    }
  }
}

impl fmt::Display for NmsMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      NmsMode::ClassAgnostic => f.write_str("agnostic"),
      NmsMode::PerClass => f.write_str("class"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostprocessConfig {
  pub score_threshold: f32,
  pub iou_threshold: f32,
  pub topk: usize,
  pub num_labels: usize,
  pub nms_mode: NmsMode,
}

impl Default for PostprocessConfig {
  fn default() -> Self {
    Self {
      score_threshold: DEFAULT_SCORE_THRESHOLD,
      iou_threshold: DEFAULT_IOU_THRESHOLD,
      topk: DEFAULT_TOPK,
      num_labels: DEFAULT_NUM_LABELS,
      nms_mode: NmsMode::default(),
    }
  }
}

/// 行优先的 (通道, 锚点) 输出视图，按锚点逐列访问
#[derive(Debug, Clone, Copy)]
pub struct OutputView<'a> {
  data: &'a [f32],
  num_channels: usize,
  num_anchors: usize,
}

impl<'a> OutputView<'a> {
  pub fn new(
    data: &'a [f32],
    num_channels: usize,
    num_anchors: usize,
  ) -> Result<Self, PostprocessError> {
    let expected = num_channels
      .checked_mul(num_anchors)
      .ok_or_else(|| PostprocessError::InvalidShape(Shape::from([
        num_channels as i64,
        num_anchors as i64,
      ])))?;
    if data.len() < expected {
      return Err(PostprocessError::TruncatedOutput {
        expected,
        actual: data.len(),
      });
    }
    Ok(Self {
      data: &data[..expected],
      num_channels,
      num_anchors,
    })
  }

  /// 接受 (C, N) 或 (1, C, N)
  pub fn from_shape(data: &'a [f32], shape: &Shape) -> Result<Self, PostprocessError> {
    let dims = match shape.dims() {
      [c, n] => (*c, *n),
      [1, c, n] => (*c, *n),
      _ => return Err(PostprocessError::InvalidShape(shape.clone())),
    };
    match (usize::try_from(dims.0), usize::try_from(dims.1)) {
      (Ok(c), Ok(n)) => Self::new(data, c, n),
      _ => Err(PostprocessError::InvalidShape(shape.clone())),
    }
  }

  pub fn num_channels(&self) -> usize {
    self.num_channels
  }

  pub fn num_anchors(&self) -> usize {
    self.num_anchors
  }

  /// 第 `anchor` 个锚点的第 `channel` 个通道值
  pub fn get(&self, channel: usize, anchor: usize) -> Option<f32> {
    if channel >= self.num_channels || anchor >= self.num_anchors {
      return None;
    }
    self.data.get(channel * self.num_anchors + anchor).copied()
  }

  fn anchor(&self, anchor: usize) -> impl Iterator<Item = f32> + '_ {
    self
      .data
      .iter()
      .skip(anchor)
      .step_by(self.num_anchors)
      .copied()
  }
}

/// 解码全部锚点：取最高类别分数，保留分数高于阈值者，
/// 去掉填充偏移后按比例映射回原图并裁剪到图像范围内。不做抑制。
pub fn decode(
  view: &OutputView<'_>,
  params: &PreprocessParams,
  config: &PostprocessConfig,
) -> Result<Vec<Detection>, PostprocessError> {
  if config.num_labels == 0 {
    return Err(PostprocessError::NoLabels);
  }
  if view.num_channels < BOX_CHANNELS + config.num_labels {
    return Err(PostprocessError::TooFewChannels {
      channels: view.num_channels,
      labels: config.num_labels,
    });
  }

  let mut candidates = Vec::new();
  for anchor in 0..view.num_anchors {
    let mut values = view.anchor(anchor);
    let (Some(cx), Some(cy), Some(w), Some(h)) =
      (values.next(), values.next(), values.next(), values.next())
    else {
      continue;
    };

    // 相同分数取第一个
    let mut label = 0;
    let mut score = f32::NEG_INFINITY;
    for (i, s) in values.take(config.num_labels).enumerate() {
      if s > score {
        score = s;
        label = i;
      }
    }

    if score > config.score_threshold {
      let x = cx - params.pad_x;
      let y = cy - params.pad_y;
      let x0 = ((x - 0.5 * w) * params.scale_ratio).clamp(0.0, params.original_width);
      let y0 = ((y - 0.5 * h) * params.scale_ratio).clamp(0.0, params.original_height);
      let x1 = ((x + 0.5 * w) * params.scale_ratio).clamp(0.0, params.original_width);
      let y1 = ((y + 0.5 * h) * params.scale_ratio).clamp(0.0, params.original_height);
      candidates.push(Detection {
        rect: Rect::from_corners(x0, y0, x1, y1),
        label,
        confidence: score,
      });
    }
  }

  Ok(candidates)
}

/// 贪心非极大值抑制，返回保留下来的候选序号，按分数从高到低
pub fn non_max_suppression(candidates: &[Detection], iou_threshold: f32, mode: NmsMode) -> Vec<usize> {
  let mut order: Vec<usize> = (0..candidates.len()).collect();
  order.sort_by(|&a, &b| {
    candidates[b]
      .confidence
      .total_cmp(&candidates[a].confidence)
  });

  let mut kept: Vec<usize> = Vec::new();
  for i in order {
    let current = &candidates[i];
    let suppressed = kept.iter().any(|&k| {
      let other = &candidates[k];
      let comparable = match mode {
        NmsMode::ClassAgnostic => true,
        NmsMode::PerClass => other.label == current.label,
      };
      comparable && current.rect.iou(&other.rect) >= iou_threshold
    });
    if !suppressed {
      kept.push(i);
    }
  }
  kept
}

pub fn postprocess(
  view: &OutputView<'_>,
  params: &PreprocessParams,
  config: &PostprocessConfig,
) -> Result<Vec<Detection>, PostprocessError> {
  let candidates = decode(view, params, config)?;
  if candidates.is_empty() {
    return Ok(candidates);
  }

  let kept = non_max_suppression(&candidates, config.iou_threshold, config.nms_mode);
  debug!(
    "候选框 {} 个, 抑制后 {} 个, 上限 {}",
    candidates.len(),
    kept.len(),
    config.topk
  );
  Ok(
    kept
      .into_iter()
      .take(config.topk)
      .map(|i| candidates[i])
      .collect(),
  )
}
