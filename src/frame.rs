// 该文件是 Qianli （千里眼） 项目的一部分。
// src/frame.rs - BGR 帧与 NCHW 张量定义
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

use image::{DynamicImage, Rgb, RgbImage};
use thiserror::Error;

use crate::runtime::Shape;

const BGR_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  DataLength { expected: usize, actual: usize },
  #[error("帧尺寸过大: {width}x{height}")]
  TooLarge { width: u32, height: u32 },
  #[error("张量尺寸过大: {channels}x{height}x{width}")]
  TensorTooLarge {
    channels: usize,
    height: usize,
    width: usize,
  },
}

fn tensor_len(channels: usize, height: usize, width: usize) -> Result<usize, FrameError> {
  channels
    .checked_mul(height)
    .and_then(|n| n.checked_mul(width))
    .filter(|&n| n.checked_mul(std::mem::size_of::<f32>()).is_some())
    .ok_or(FrameError::TensorTooLarge {
      channels,
      height,
      width,
    })
}

/// 8 位三通道 HWC 图像，通道顺序为 B, G, R
#[derive(Debug, Clone, PartialEq)]
pub struct BgrFrame {
  // 借用 RgbImage 的存储，三个通道依次是 B, G, R
  pixels: RgbImage,
}

impl BgrFrame {
  pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
    let expected = (width as usize)
      .checked_mul(height as usize)
      .and_then(|n| n.checked_mul(BGR_CHANNELS))
      .ok_or(FrameError::TooLarge { width, height })?;
    if data.len() != expected {
      return Err(FrameError::DataLength {
        expected,
        actual: data.len(),
      });
    }

    let pixels = RgbImage::from_raw(width, height, data)
      .ok_or(FrameError::TooLarge { width, height })?;
    Ok(Self { pixels })
  }

  pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Self {
    Self {
      pixels: RgbImage::from_pixel(width, height, Rgb(bgr)),
    }
  }

  pub fn from_rgb_image(mut image: RgbImage) -> Self {
    for pixel in image.pixels_mut() {
      pixel.0.swap(0, 2);
    }
    Self { pixels: image }
  }

  pub fn from_dynamic_image(image: &DynamicImage) -> Self {
    Self::from_rgb_image(image.to_rgb8())
  }

  pub fn width(&self) -> u32 {
    self.pixels.width()
  }

  pub fn height(&self) -> u32 {
    self.pixels.height()
  }

  pub fn channels(&self) -> usize {
    BGR_CHANNELS
  }

  pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
    self.pixels.get_pixel_checked(x, y).map(|p| p.0)
  }

  pub fn as_bytes(&self) -> &[u8] {
    self.pixels.as_raw()
  }

  pub(crate) fn as_buffer(&self) -> &RgbImage {
    &self.pixels
  }
}

/// 单张图像的 (1, C, H, W) 平面浮点张量
#[derive(Debug, Clone, PartialEq)]
pub struct NchwTensor {
  channels: usize,
  height: usize,
  width: usize,
  data: Vec<f32>,
}

impl NchwTensor {
  pub fn new(
    channels: usize,
    height: usize,
    width: usize,
    data: Vec<f32>,
  ) -> Result<Self, FrameError> {
    let expected = tensor_len(channels, height, width)?;
    if data.len() != expected {
      return Err(FrameError::DataLength {
        expected,
        actual: data.len(),
      });
    }
    Ok(Self {
      channels,
      height,
      width,
      data,
    })
  }

  pub fn zeros(channels: usize, height: usize, width: usize) -> Result<Self, FrameError> {
    let len = tensor_len(channels, height, width)?;
    Ok(Self {
      channels,
      height,
      width,
      data: vec![0.0; len],
    })
  }

  pub fn channels(&self) -> usize {
    self.channels
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn shape(&self) -> Shape {
    Shape::from([
      1,
      self.channels as i64,
      self.height as i64,
      self.width as i64,
    ])
  }

  pub fn get(&self, channel: usize, y: usize, x: usize) -> Option<f32> {
    if channel >= self.channels || y >= self.height || x >= self.width {
      return None;
    }
    self
      .data
      .get((channel * self.height + y) * self.width + x)
      .copied()
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }

  pub(crate) fn as_mut_slice(&mut self) -> &mut [f32] {
    &mut self.data
  }

  pub fn byte_size(&self) -> usize {
    self.data.len() * std::mem::size_of::<f32>()
  }

  pub fn to_le_bytes(&self) -> Vec<u8> {
    self.data.iter().flat_map(|v| v.to_le_bytes()).collect()
  }
}
