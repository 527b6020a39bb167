// 该文件是 Qianli （千里眼） 项目的一部分。
// src/input/directory.rs - 目录图像输入
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

use std::{collections::VecDeque, path::PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use super::read_image_file::read_bgr_frame;
use crate::{FromUrl, FromUrlWithScheme, frame::BgrFrame, url_file_path};

#[derive(Error, Debug)]
pub enum DirectoryInputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("读取目录 {path} 失败: {source}")]
  ReadDir {
    path: PathBuf,
    source: std::io::Error,
  },
}

/// 按路径顺序读取目录中的全部图像，无法解码的文件跳过
pub struct DirectoryInput {
  pending: VecDeque<PathBuf>,
}

impl FromUrlWithScheme for DirectoryInput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryInput {
  type Error = DirectoryInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(DirectoryInputError::SchemeMismatch(url.scheme().to_string()));
    }
    Self::open(url_file_path(url))
  }
}

impl DirectoryInput {
  pub fn open(dir: impl Into<PathBuf>) -> Result<Self, DirectoryInputError> {
    let dir = dir.into();
    let read_dir_error = |source| DirectoryInputError::ReadDir {
      path: dir.clone(),
      source,
    };

    let mut files = Vec::new();
    for entry in std::fs::read_dir(&dir).map_err(read_dir_error)? {
      let path = entry.map_err(read_dir_error)?.path();
      if path.is_file() {
        files.push(path);
      }
    }
    files.sort();

    info!("目录 {} 中有 {} 个文件", dir.display(), files.len());
    Ok(Self {
      pending: files.into(),
    })
  }

  /// 尚未读取的文件数
  pub fn remaining(&self) -> usize {
    self.pending.len()
  }
}

impl Iterator for DirectoryInput {
  type Item = BgrFrame;

  fn next(&mut self) -> Option<Self::Item> {
    while let Some(path) = self.pending.pop_front() {
      match read_bgr_frame(&path) {
        Ok(frame) => {
          debug!("读取图像 {}", path.display());
          return Some(frame);
        }
        Err(e) => warn!("跳过无法解码的文件 {}: {}", path.display(), e),
      }
    }
    None
  }
}
