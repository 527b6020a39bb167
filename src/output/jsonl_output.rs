// 该文件是 Qianli （千里眼） 项目的一部分。
// src/output/jsonl_output.rs - JSON 行文件输出
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
  fs::{File, OpenOptions},
  io::{BufWriter, Write},
  path::{Path, PathBuf},
  sync::Mutex,
};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use url::Url;

use super::{Publish, labels_from_url};
use crate::{
  FromUrl, FromUrlWithScheme,
  labels::{LabelError, LabelSet},
  model::DetectResult,
  postprocess::Rect,
  url_file_path,
};

#[derive(Error, Debug)]
pub enum JsonLinesOutputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("类别文件错误: {0}")]
  LabelError(#[from] LabelError),
  #[error("输出文件锁已损坏")]
  Poisoned,
}

#[derive(Serialize)]
struct FrameRecord<'a> {
  timestamp: String,
  frame: usize,
  width: u32,
  height: u32,
  detections: Vec<DetectionRecord<'a>>,
}

#[derive(Serialize)]
struct DetectionRecord<'a> {
  label: usize,
  name: &'a str,
  confidence: f32,
  #[serde(rename = "box")]
  rect: Rect,
}

/// 每帧一行 JSON 追加写入文件
pub struct JsonLinesOutput {
  path: PathBuf,
  writer: Mutex<BufWriter<File>>,
  labels: LabelSet,
  skip_empty: bool,
}

impl FromUrlWithScheme for JsonLinesOutput {
  const SCHEME: &'static str = "jsonl";
}

impl FromUrl for JsonLinesOutput {
  type Error = JsonLinesOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(JsonLinesOutputError::SchemeMismatch(url.scheme().to_string()));
    }

    let labels = labels_from_url(url)?;
    let skip_empty = url.query_pairs().any(|(k, _)| k == "skip_empty");
    let mut output = Self::create(url_file_path(url), labels)?;
    output.skip_empty = skip_empty;
    Ok(output)
  }
}

impl JsonLinesOutput {
  pub fn create(path: impl AsRef<Path>, labels: LabelSet) -> Result<Self, JsonLinesOutputError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    info!("检测结果写入 {}", path.display());

    Ok(Self {
      path: path.to_path_buf(),
      writer: Mutex::new(BufWriter::new(file)),
      labels,
      skip_empty: false,
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Publish<DetectResult> for JsonLinesOutput {
  type Error = JsonLinesOutputError;

  fn publish(&self, frame_index: usize, result: &DetectResult) -> Result<(), Self::Error> {
    if self.skip_empty && result.is_empty() {
      return Ok(());
    }

    let record = FrameRecord {
      timestamp: Utc::now().to_rfc3339(),
      frame: frame_index,
      width: result.width,
      height: result.height,
      detections: result
        .items
        .iter()
        .map(|item| DetectionRecord {
          label: item.label,
          name: self.labels.name(item.label),
          confidence: item.confidence,
          rect: item.rect,
        })
        .collect(),
    };

    let mut writer = self
      .writer
      .lock()
      .map_err(|_| JsonLinesOutputError::Poisoned)?;
    serde_json::to_writer(&mut *writer, &record)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
  }
}
