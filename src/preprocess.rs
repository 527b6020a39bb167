// 该文件是 Qianli （千里眼） 项目的一部分。
// src/preprocess.rs - 信箱缩放预处理
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

//! 把任意尺寸的 BGR 图像等比缩放并居中填充到模型输入尺寸，
//! 输出 RGB 顺序、归一化到 `[0, 1]` 的 NCHW 张量。

use image::{
  Rgb, RgbImage,
  imageops::{self, FilterType},
};
use thiserror::Error;
use tracing::debug;

use crate::frame::{BgrFrame, FrameError, NchwTensor};

pub const LETTERBOX_PAD_VALUE: u8 = 114;

#[derive(Error, Debug)]
pub enum PreprocessError {
  #[error("输入图像为空: {width}x{height}")]
  EmptyImage { width: u32, height: u32 },
  #[error("目标尺寸无效: {width}x{height}")]
  InvalidTarget { width: u32, height: u32 },
  #[error("张量创建失败: {0}")]
  Tensor(#[from] FrameError),
}

/// 从填充后的模型坐标映射回原图坐标所需的参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreprocessParams {
  /// 缩放比例的倒数
  pub scale_ratio: f32,
  pub pad_x: f32,
  pub pad_y: f32,
  pub original_width: f32,
  pub original_height: f32,
}

impl PreprocessParams {
  /// 模型坐标与原图坐标一致时的参数
  pub fn identity(width: f32, height: f32) -> Self {
    Self {
      scale_ratio: 1.0,
      pad_x: 0.0,
      pad_y: 0.0,
      original_width: width,
      original_height: height,
    }
  }

  /// 模型坐标到原图坐标
  pub fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
    (
      (x - self.pad_x) * self.scale_ratio,
      (y - self.pad_y) * self.scale_ratio,
    )
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Letterbox {
  width: u32,
  height: u32,
  pad_value: u8,
}

impl Letterbox {
  pub fn new(width: u32, height: u32) -> Self {
    Self {
      width,
      height,
      pad_value: LETTERBOX_PAD_VALUE,
    }
  }

  pub fn with_pad_value(mut self, pad_value: u8) -> Self {
    self.pad_value = pad_value;
    self
  }

  /// (宽, 高)
  pub fn target_size(&self) -> (u32, u32) {
    (self.width, self.height)
  }

  pub fn apply(&self, frame: &BgrFrame) -> Result<(NchwTensor, PreprocessParams), PreprocessError> {
    let (src_w, src_h) = (frame.width(), frame.height());
    if src_w == 0 || src_h == 0 {
      return Err(PreprocessError::EmptyImage {
        width: src_w,
        height: src_h,
      });
    }
    if self.width == 0 || self.height == 0 {
      return Err(PreprocessError::InvalidTarget {
        width: self.width,
        height: self.height,
      });
    }

    let (dst_w, dst_h) = (self.width as f32, self.height as f32);
    let ratio = (dst_h / src_h as f32).min(dst_w / src_w as f32);

    let scaled_w = ((src_w as f32 * ratio).round() as u32).clamp(1, self.width);
    let scaled_h = ((src_h as f32 * ratio).round() as u32).clamp(1, self.height);

    let dw = (self.width - scaled_w) as f32 / 2.0;
    let dh = (self.height - scaled_h) as f32 / 2.0;

    let resized;
    let scaled: &RgbImage = if (scaled_w, scaled_h) != (src_w, src_h) {
      resized = imageops::resize(frame.as_buffer(), scaled_w, scaled_h, FilterType::Triangle);
      &resized
    } else {
      frame.as_buffer()
    };

    // 奇数余量时多出的一个像素落在右侧与下侧
    let top = (dh - 0.1).round() as i64;
    let left = (dw - 0.1).round() as i64;

    let mut canvas = RgbImage::from_pixel(self.width, self.height, Rgb([self.pad_value; 3]));
    imageops::replace(&mut canvas, scaled, left, top);

    debug!(
      "信箱缩放: {}x{} -> {}x{}, 比例 {:.4}, 填充 ({:.1}, {:.1})",
      src_w, src_h, scaled_w, scaled_h, ratio, dw, dh
    );

    let tensor = planar_rgb(&canvas)?;
    let params = PreprocessParams {
      scale_ratio: 1.0 / ratio,
      pad_x: dw,
      pad_y: dh,
      original_width: src_w as f32,
      original_height: src_h as f32,
    };
    Ok((tensor, params))
  }
}

/// BGR 交错像素拆分为 R, G, B 三个平面并除以 255
fn planar_rgb(canvas: &RgbImage) -> Result<NchwTensor, FrameError> {
  let (w, h) = (canvas.width() as usize, canvas.height() as usize);
  let plane = w * h;
  let mut tensor = NchwTensor::zeros(3, h, w)?;
  let data = tensor.as_mut_slice();
  for (i, pixel) in canvas.pixels().enumerate() {
    let [b, g, r] = pixel.0;
    data[i] = r as f32 / 255.0;
    data[plane + i] = g as f32 / 255.0;
    data[2 * plane + i] = b as f32 / 255.0;
  }
  Ok(tensor)
}

#[cfg(test)]
mod tests {
  use super::*;

  const PAD: f32 = LETTERBOX_PAD_VALUE as f32 / 255.0;

  fn approx(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-4
  }

  #[test]
  fn full_hd_to_square_pads_top_and_bottom() {
    let frame = BgrFrame::filled(1920, 1080, [0, 0, 255]);
    let (tensor, params) = Letterbox::new(640, 640).apply(&frame).unwrap();

    assert_eq!(tensor.shape().dims(), &[1, 3, 640, 640]);
    assert!(approx(params.pad_x, 0.0));
    assert!(approx(params.pad_y, 140.0));
    assert!(approx(params.scale_ratio, 3.0));
    assert_eq!(params.original_width, 1920.0);
    assert_eq!(params.original_height, 1080.0);

    assert!(approx(tensor.get(0, 139, 320).unwrap(), PAD));
    assert!(approx(tensor.get(0, 140, 320).unwrap(), 1.0));
    assert!(approx(tensor.get(0, 499, 320).unwrap(), 1.0));
    assert!(approx(tensor.get(0, 500, 320).unwrap(), PAD));
  }

  #[test]
  fn matching_aspect_ratio_has_no_padding() {
    let frame = BgrFrame::filled(1280, 1280, [1, 2, 3]);
    let (_, params) = Letterbox::new(640, 640).apply(&frame).unwrap();
    assert_eq!((params.pad_x, params.pad_y), (0.0, 0.0));
    assert!(approx(params.scale_ratio, 2.0));

    let frame = BgrFrame::filled(320, 160, [1, 2, 3]);
    let (_, params) = Letterbox::new(640, 320).apply(&frame).unwrap();
    assert_eq!((params.pad_x, params.pad_y), (0.0, 0.0));
  }

  #[test]
  fn exact_size_is_identity() {
    let frame = BgrFrame::filled(8, 4, [0, 128, 255]);
    let (tensor, params) = Letterbox::new(8, 4).apply(&frame).unwrap();
    assert_eq!(params, PreprocessParams::identity(8.0, 4.0));
    assert!(approx(tensor.get(0, 2, 3).unwrap(), 1.0));
    assert!(approx(tensor.get(1, 2, 3).unwrap(), 128.0 / 255.0));
    assert!(approx(tensor.get(2, 2, 3).unwrap(), 0.0));
  }

  #[test]
  fn odd_slack_puts_extra_pixel_after_the_image() {
    // 3x2 缩放到 8x8: 8x5, 纵向余量 3
    let frame = BgrFrame::filled(3, 2, [255, 255, 255]);
    let (tensor, params) = Letterbox::new(8, 8).apply(&frame).unwrap();
    assert!(approx(params.pad_y, 1.5));
    // 上方填充 1 行，下方填充 2 行
    assert!(approx(tensor.get(0, 0, 4).unwrap(), PAD));
    assert!(approx(tensor.get(0, 1, 4).unwrap(), 1.0));
    assert!(approx(tensor.get(0, 5, 4).unwrap(), 1.0));
    assert!(approx(tensor.get(0, 6, 4).unwrap(), PAD));
    assert!(approx(tensor.get(0, 7, 4).unwrap(), PAD));
  }

  #[test]
  fn output_shape_always_matches_target() {
    for (w, h) in [(1, 1), (7, 3), (3, 7), (641, 17), (2000, 2001)] {
      let frame = BgrFrame::filled(w, h, [9, 9, 9]);
      let (tensor, _) = Letterbox::new(64, 48).apply(&frame).unwrap();
      assert_eq!(tensor.shape().dims(), &[1, 3, 48, 64]);
    }
  }

  #[test]
  fn empty_input_is_rejected() {
    let frame = BgrFrame::filled(0, 10, [0, 0, 0]);
    assert!(matches!(
      Letterbox::new(64, 64).apply(&frame),
      Err(PreprocessError::EmptyImage { .. })
    ));
  }
}
