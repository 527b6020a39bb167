// 该文件是 Qianli （千里眼） 项目的一部分。
// src/model/yolov8.rs - YOLOv8 检测器
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

use std::{collections::HashMap, path::PathBuf, str::FromStr};

use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  engine::{DEFAULT_WARMUP_ITERATIONS, EngineContext, EngineError},
  frame::BgrFrame,
  labels::{LabelError, LabelSet},
  model::{DetectResult, Model},
  postprocess::{
    self, Detection, NmsMode, OutputView, PostprocessConfig, PostprocessError,
  },
  preprocess::{Letterbox, PreprocessError},
  runtime::{Runtime, Shape},
  url_file_path,
};

const YOLOV8_SCHEME: &str = "yolov8";
const YOLOV8_BOX_CHANNELS: i64 = 4;

#[derive(Error, Debug)]
pub enum YoloV8Error {
  #[error("推理引擎错误: {0}")]
  Engine(#[from] EngineError),
  #[error("预处理错误: {0}")]
  Preprocess(#[from] PreprocessError),
  #[error("后处理错误: {0}")]
  Postprocess(#[from] PostprocessError),
  #[error("类别文件错误: {0}")]
  Label(#[from] LabelError),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("参数 {key} 的值 {value} 无效")]
  InvalidParameter { key: String, value: String },
  #[error("模型输入形状 {0} 不是 (1, 3, 高, 宽)")]
  InputLayout(Shape),
  #[error("模型输出形状 {shape} 容纳不下 {labels} 个类别")]
  OutputLayout { shape: Shape, labels: usize },
}

pub struct YoloV8Builder {
  model_path: PathBuf,
  config: PostprocessConfig,
  warmup: Option<usize>,
  labels: Option<LabelSet>,
  label_path: Option<PathBuf>,
}

impl Default for YoloV8Builder {
  fn default() -> Self {
    Self {
      model_path: PathBuf::new(),
      config: PostprocessConfig::default(),
      warmup: Some(DEFAULT_WARMUP_ITERATIONS),
      labels: None,
      label_path: None,
    }
  }
}

fn parse_param<T: FromStr>(query: &HashMap<String, String>, key: &str) -> Result<Option<T>, YoloV8Error> {
  match query.get(key) {
    Some(value) => value.parse().map(Some).map_err(|_| {
      error!("参数 {} 的值 {} 无效", key, value);
      YoloV8Error::InvalidParameter {
        key: key.to_string(),
        value: value.clone(),
      }
    }),
    None => Ok(None),
  }
}

impl FromUrlWithScheme for YoloV8Builder {
  const SCHEME: &'static str = YOLOV8_SCHEME;
}

impl FromUrl for YoloV8Builder {
  type Error = YoloV8Error;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(YoloV8Error::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();

    let mut builder = YoloV8Builder::new(url_file_path(url));
    if let Some(score) = parse_param(&query, "score")? {
      builder = builder.score_threshold(score);
    }
    if let Some(iou) = parse_param(&query, "iou")? {
      builder = builder.iou_threshold(iou);
    }
    if let Some(topk) = parse_param(&query, "topk")? {
      builder = builder.topk(topk);
    }
    if let Some(labels) = parse_param(&query, "labels")? {
      builder = builder.num_labels(labels);
    }
    if let Some(mode) = query.get("nms") {
      builder = builder.nms_mode(mode.parse()?);
    }
    if let Some(warmup) = parse_param::<usize>(&query, "warmup")? {
      builder = builder.warmup((warmup > 0).then_some(warmup));
    }
    if let Some(names) = query.get("names") {
      builder.label_path = Some(PathBuf::from(names));
    }

    Ok(builder)
  }
}

impl YoloV8Builder {
  pub fn new(model_path: impl Into<PathBuf>) -> Self {
    Self {
      model_path: model_path.into(),
      ..Default::default()
    }
  }

  pub fn score_threshold(mut self, threshold: f32) -> Self {
    self.config.score_threshold = threshold;
    self
  }

  pub fn iou_threshold(mut self, threshold: f32) -> Self {
    self.config.iou_threshold = threshold;
    self
  }

  pub fn topk(mut self, topk: usize) -> Self {
    self.config.topk = topk;
    self
  }

  pub fn num_labels(mut self, num_labels: usize) -> Self {
    self.config.num_labels = num_labels;
    self
  }

  pub fn nms_mode(mut self, mode: NmsMode) -> Self {
    self.config.nms_mode = mode;
    self
  }

  /// `None` 表示不预热
  pub fn warmup(mut self, iterations: Option<usize>) -> Self {
    self.warmup = iterations;
    self
  }

  pub fn labels(mut self, labels: LabelSet) -> Self {
    self.labels = Some(labels);
    self
  }

  pub fn config(&self) -> &PostprocessConfig {
    &self.config
  }

  pub fn build<R: Runtime>(self, runtime: R) -> Result<YoloV8<R>, YoloV8Error> {
    if self.config.num_labels == 0 {
      return Err(PostprocessError::NoLabels.into());
    }

    let labels = match (self.labels, self.label_path) {
      (Some(labels), _) => labels,
      (None, Some(path)) => LabelSet::from_file(path)?,
      (None, None) => LabelSet::coco(),
    };

    let mut engine = EngineContext::from_file(runtime, &self.model_path)?;

    let input_shape = engine
      .catalog()
      .input(0)
      .map(|b| b.shape.clone())
      .unwrap_or_default();
    let (width, height) = match input_shape.dims() {
      [1, 3, h, w] if *h > 0 && *w > 0 => (*w as u32, *h as u32),
      _ => return Err(YoloV8Error::InputLayout(input_shape)),
    };

    let output_shape = engine
      .catalog()
      .output(0)
      .map(|b| b.shape.clone())
      .unwrap_or_default();
    let channels = match output_shape.dims() {
      [c, _] | [1, c, _] => *c,
      _ => 0,
    };
    if channels < YOLOV8_BOX_CHANNELS + self.config.num_labels as i64 {
      return Err(YoloV8Error::OutputLayout {
        shape: output_shape,
        labels: self.config.num_labels,
      });
    }

    engine.make_pipe(self.warmup)?;

    info!(
      "YOLOv8 模型就绪: 输入 {}x{}, 类别 {}, 抑制方式 {}",
      width, height, self.config.num_labels, self.config.nms_mode
    );
    debug!("后处理参数: {:?}", self.config);

    Ok(YoloV8 {
      engine,
      letterbox: Letterbox::new(width, height),
      config: self.config,
      labels,
    })
  }
}

pub struct YoloV8<R: Runtime> {
  engine: EngineContext<R>,
  letterbox: Letterbox,
  config: PostprocessConfig,
  labels: LabelSet,
}

impl<R: Runtime> YoloV8<R> {
  pub fn labels(&self) -> &LabelSet {
    &self.labels
  }

  pub fn config(&self) -> &PostprocessConfig {
    &self.config
  }

  /// 模型输入尺寸 (宽, 高)
  pub fn input_size(&self) -> (u32, u32) {
    self.letterbox.target_size()
  }

  pub fn engine(&self) -> &EngineContext<R> {
    &self.engine
  }

  pub fn detect(&mut self, frame: &BgrFrame) -> Result<DetectResult, YoloV8Error> {
    let letterbox = self.letterbox;
    self.run(frame, letterbox, true)
  }

  /// 缩放到指定的 (宽, 高)，用于可变输入形状的执行计划
  pub fn detect_with_size(
    &mut self,
    frame: &BgrFrame,
    size: (u32, u32),
  ) -> Result<DetectResult, YoloV8Error> {
    self.run(frame, Letterbox::new(size.0, size.1), true)
  }

  /// 只解码，不做抑制与数量截断
  pub fn detect_raw(&mut self, frame: &BgrFrame) -> Result<DetectResult, YoloV8Error> {
    let letterbox = self.letterbox;
    self.run(frame, letterbox, false)
  }

  fn run(
    &mut self,
    frame: &BgrFrame,
    letterbox: Letterbox,
    suppress: bool,
  ) -> Result<DetectResult, YoloV8Error> {
    let (tensor, params) = letterbox.apply(frame)?;
    self.engine.copy_from_tensor(&tensor)?;
    self.engine.infer()?;

    let output = self.engine.output(0)?;
    let view = OutputView::from_shape(&output.values, &output.shape)?;
    let items: Vec<Detection> = if suppress {
      postprocess::postprocess(&view, &params, &self.config)?
    } else {
      postprocess::decode(&view, &params, &self.config)?
    };
    debug!("检测到 {} 个物体", items.len());

    Ok(DetectResult {
      width: frame.width(),
      height: frame.height(),
      items: items.into_boxed_slice(),
    })
  }
}

impl<R: Runtime> Model for YoloV8<R> {
  type Input = BgrFrame;
  type Output = DetectResult;
  type Error = YoloV8Error;

  fn infer(&mut self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.detect(input)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_reads_query_parameters() {
    let url = Url::parse("yolov8:///models/yolo%20v8.plan?score=0.5&iou=0.4&topk=7&labels=3&nms=class&warmup=0").unwrap();
    let builder = YoloV8Builder::from_url(&url).unwrap();
    assert_eq!(builder.model_path, PathBuf::from("/models/yolo v8.plan"));
    assert_eq!(builder.config.score_threshold, 0.5);
    assert_eq!(builder.config.iou_threshold, 0.4);
    assert_eq!(builder.config.topk, 7);
    assert_eq!(builder.config.num_labels, 3);
    assert_eq!(builder.config.nms_mode, NmsMode::PerClass);
    assert_eq!(builder.warmup, None);
  }

  #[test]
  fn builder_defaults() {
    let url = Url::parse("yolov8:///models/yolov8n.plan").unwrap();
    let builder = YoloV8Builder::from_url(&url).unwrap();
    assert_eq!(*builder.config(), PostprocessConfig::default());
    assert_eq!(builder.warmup, Some(DEFAULT_WARMUP_ITERATIONS));
  }

  #[test]
  fn builder_rejects_bad_urls() {
    let url = Url::parse("onnx:///models/yolov8n.plan").unwrap();
    assert!(matches!(
      YoloV8Builder::from_url(&url),
      Err(YoloV8Error::ModelPathError(_))
    ));

    let url = Url::parse("yolov8:///m.plan?score=high").unwrap();
    assert!(matches!(
      YoloV8Builder::from_url(&url),
      Err(YoloV8Error::InvalidParameter { .. })
    ));

    let url = Url::parse("yolov8:///m.plan?nms=soft").unwrap();
    assert!(matches!(
      YoloV8Builder::from_url(&url),
      Err(YoloV8Error::Postprocess(PostprocessError::InvalidNmsMode(_)))
    ));
  }
}
