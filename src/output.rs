// 该文件是 Qianli （千里眼） 项目的一部分。
// src/output.rs - 检测结果发布
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

use thiserror::Error;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  labels::{LabelError, LabelSet},
  model::DetectResult,
};

/// 检测结果的发布方，`frame_index` 从 1 开始
pub trait Publish<D> {
  type Error;
  fn publish(&self, frame_index: usize, result: &D) -> Result<(), Self::Error>;
}

mod jsonl_output;
mod log_output;

pub use self::jsonl_output::{JsonLinesOutput, JsonLinesOutputError};
pub use self::log_output::{LogOutput, LogOutputError};

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("JSON 行输出错误: {0}")]
  JsonLinesOutputError(#[from] JsonLinesOutputError),
  #[error("日志输出错误: {0}")]
  LogOutputError(#[from] LogOutputError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// `names=<文件>` 指定类别名称，缺省为 COCO
fn labels_from_url(url: &Url) -> Result<LabelSet, LabelError> {
  match url.query_pairs().find(|(k, _)| k == "names") {
    Some((_, path)) => LabelSet::from_file(&*path),
    None => Ok(LabelSet::coco()),
  }
}

pub enum OutputWrapper {
  JsonLines(JsonLinesOutput),
  Log(LogOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      JsonLinesOutput::SCHEME => Ok(OutputWrapper::JsonLines(JsonLinesOutput::from_url(url)?)),
      LogOutput::SCHEME => Ok(OutputWrapper::Log(LogOutput::from_url(url)?)),
      other => Err(OutputError::SchemeMismatch(other.to_string())),
    }
  }
}

impl Publish<DetectResult> for OutputWrapper {
  type Error = OutputError;

  fn publish(&self, frame_index: usize, result: &DetectResult) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::JsonLines(output) => output
        .publish(frame_index, result)
        .map_err(OutputError::from),
      OutputWrapper::Log(output) => output
        .publish(frame_index, result)
        .map_err(OutputError::from),
    }
  }
}
