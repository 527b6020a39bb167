// 该文件是 Qianli （千里眼） 项目的一部分。
// tests/onnx.rs - ONNX Runtime 后端测试
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

#![cfg(feature = "onnx")]

use qianli::{
  engine::{EngineContext, EngineError},
  frame::{BgrFrame, NchwTensor},
  model::YoloV8Builder,
  runtime::{
    BindingApi, DataType, Shape,
    onnx::OnnxRuntime,
    replay::{ReplayPlanBuilder, ReplayRuntime},
  },
};
use tempfile::TempDir;

// protobuf 线格式：0 为 varint，2 为定长
fn varint(mut value: u64, out: &mut Vec<u8>) {
  while value >= 0x80 {
    out.push((value as u8) | 0x80);
    value >>= 7;
  }
  out.push(value as u8);
}

fn field_varint(field: u64, value: u64, out: &mut Vec<u8>) {
  varint(field << 3, out);
  varint(value, out);
}

fn field_bytes(field: u64, bytes: &[u8], out: &mut Vec<u8>) {
  varint((field << 3) | 2, out);
  varint(bytes.len() as u64, out);
  out.extend_from_slice(bytes);
}

/// float 张量的 ValueInfoProto
fn value_info(name: &str, dims: &[u64]) -> Vec<u8> {
  let mut shape = Vec::new();
  for &d in dims {
    let mut dim = Vec::new();
    field_varint(1, d, &mut dim);
    field_bytes(1, &dim, &mut shape);
  }
  let mut tensor = Vec::new();
  field_varint(1, 1, &mut tensor);
  field_bytes(2, &shape, &mut tensor);
  let mut ty = Vec::new();
  field_bytes(1, &tensor, &mut ty);

  let mut info = Vec::new();
  field_bytes(1, name.as_bytes(), &mut info);
  field_bytes(2, &ty, &mut info);
  info
}

/// 把 (1, 3, 4, 4) 的输入原样重排为 (1, 6, 8) 输出的模型
fn reshape_model() -> Vec<u8> {
  let mut node = Vec::new();
  field_bytes(1, b"images", &mut node);
  field_bytes(1, b"shape", &mut node);
  field_bytes(2, b"output0", &mut node);
  field_bytes(3, b"reshape", &mut node);
  field_bytes(4, b"Reshape", &mut node);

  let mut target = Vec::new();
  field_varint(1, 3, &mut target);
  field_varint(2, 7, &mut target);
  field_bytes(8, b"shape", &mut target);
  let raw: Vec<u8> = [1i64, 6, 8].iter().flat_map(|v| v.to_le_bytes()).collect();
  field_bytes(9, &raw, &mut target);

  let mut graph = Vec::new();
  field_bytes(1, &node, &mut graph);
  field_bytes(2, b"qianli-reshape", &mut graph);
  field_bytes(5, &target, &mut graph);
  field_bytes(11, &value_info("images", &[1, 3, 4, 4]), &mut graph);
  field_bytes(12, &value_info("output0", &[1, 6, 8]), &mut graph);

  let mut opset = Vec::new();
  field_bytes(1, b"", &mut opset);
  field_varint(2, 13, &mut opset);

  let mut model = Vec::new();
  field_varint(1, 7, &mut model);
  field_bytes(2, b"qianli", &mut model);
  field_bytes(7, &graph, &mut model);
  field_bytes(8, &opset, &mut model);
  model
}

#[test]
fn engine_runs_the_network_on_copied_input() {
  let mut engine = EngineContext::from_bytes(OnnxRuntime::default(), &reshape_model()).unwrap();
  assert_eq!(engine.binding_api(), BindingApi::ByName);

  let catalog = engine.catalog();
  assert_eq!(catalog.inputs()[0].name, "images");
  assert_eq!(catalog.inputs()[0].shape, Shape::from([1, 3, 4, 4]));
  assert_eq!(catalog.outputs()[0].name, "output0");
  assert_eq!(catalog.outputs()[0].shape, Shape::from([1, 6, 8]));

  engine.make_pipe(Some(1)).unwrap();

  let ramp: Vec<f32> = (0..48).map(|v| v as f32).collect();
  engine
    .copy_from_tensor(&NchwTensor::new(3, 4, 4, ramp.clone()).unwrap())
    .unwrap();
  engine.infer().unwrap();
  let out = engine.output(0).unwrap();
  assert_eq!(out.shape, Shape::from([1, 6, 8]));
  assert_eq!(out.values, ramp);

  // 输入变化，输出随之变化
  let reversed: Vec<f32> = ramp.iter().rev().copied().collect();
  engine
    .copy_from_tensor(&NchwTensor::new(3, 4, 4, reversed.clone()).unwrap())
    .unwrap();
  engine.infer().unwrap();
  assert_eq!(engine.output(0).unwrap().values, reversed);
}

#[test]
fn detections_depend_on_frame_content() {
  let dir = TempDir::new().unwrap();
  let path = dir.path().join("reshape.onnx");
  std::fs::write(&path, reshape_model()).unwrap();

  let mut model = YoloV8Builder::new(&path)
    .num_labels(2)
    .warmup(Some(1))
    .build(OnnxRuntime::default())
    .unwrap();
  assert_eq!(model.input_size(), (4, 4));

  let black = model.detect(&BgrFrame::filled(4, 4, [0, 0, 0])).unwrap();
  assert!(black.items.is_empty());

  // 白色帧的每个通道都是 1.0：8 个相同的框 (0.5, 0.5, 1, 1)，NMS 后剩下一个
  let white = model.detect(&BgrFrame::filled(4, 4, [255, 255, 255])).unwrap();
  assert_eq!(white.items.len(), 1);
  let hit = &white.items[0];
  assert_eq!(hit.label, 0);
  assert!((hit.confidence - 1.0).abs() < 1e-6);
  assert!((hit.rect.x - 0.5).abs() < 1e-4);
  assert!((hit.rect.y - 0.5).abs() < 1e-4);
  assert!((hit.rect.width - 1.0).abs() < 1e-4);
  assert!((hit.rect.height - 1.0).abs() < 1e-4);
}

#[test]
fn rejects_blobs_that_are_not_onnx_models() {
  let replay_plan = ReplayPlanBuilder::new(BindingApi::ByName)
    .input("images", DataType::Float32, [1, 3, 4, 4], None)
    .output_f32("output0", [1, 6, 8], &[0.0; 48])
    .build()
    .unwrap();

  assert!(matches!(
    EngineContext::from_bytes(OnnxRuntime::default(), &replay_plan),
    Err(EngineError::Deserialize(_))
  ));
  assert!(matches!(
    EngineContext::from_bytes(OnnxRuntime::default(), b"not a model"),
    Err(EngineError::Deserialize(_))
  ));
  assert!(matches!(
    EngineContext::from_bytes(ReplayRuntime::new(), &reshape_model()),
    Err(EngineError::Deserialize(_))
  ));
}
