// 该文件是 Qianli （千里眼） 项目的一部分。
// src/output/log_output.rs - 日志输出
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
use tracing::info;
use url::Url;

use super::{Publish, labels_from_url};
use crate::{
  FromUrl, FromUrlWithScheme,
  labels::{LabelError, LabelSet},
  model::DetectResult,
};

#[derive(Error, Debug)]
pub enum LogOutputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("类别文件错误: {0}")]
  LabelError(#[from] LabelError),
}

pub struct LogOutput {
  labels: LabelSet,
}

impl LogOutput {
  pub fn new(labels: LabelSet) -> Self {
    Self { labels }
  }
}

impl FromUrlWithScheme for LogOutput {
  const SCHEME: &'static str = "log";
}

impl FromUrl for LogOutput {
  type Error = LogOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(LogOutputError::SchemeMismatch(url.scheme().to_string()));
    }
    Ok(Self::new(labels_from_url(url)?))
  }
}

impl Publish<DetectResult> for LogOutput {
  type Error = LogOutputError;

  fn publish(&self, frame_index: usize, result: &DetectResult) -> Result<(), Self::Error> {
    info!(
      "第 {} 帧 ({}x{}): {} 个目标",
      frame_index,
      result.width,
      result.height,
      result.len()
    );
    for item in result.items.iter() {
      info!(
        "  {} ({}) {:.3} [{:.1}, {:.1}, {:.1}, {:.1}]",
        self.labels.name(item.label),
        item.label,
        item.confidence,
        item.rect.x,
        item.rect.y,
        item.rect.width,
        item.rect.height
      );
    }
    Ok(())
  }
}
