// 该文件是 Qianli （千里眼） 项目的一部分。
// tests/engine.rs - 推理引擎上下文测试
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

use qianli::{
  engine::{EngineContext, EngineError},
  frame::NchwTensor,
  runtime::{
    BindingApi, DataType, Shape,
    replay::{ReplayPlanBuilder, ReplayRuntime},
  },
};

const OUTPUT: [f32; 6] = [0.5, 1.5, 2.5, 3.5, 4.5, 5.5];

fn plan(api: BindingApi) -> Vec<u8> {
  ReplayPlanBuilder::new(api)
    .input("images", DataType::Float32, [1, 3, 8, 8], None)
    .output_f32("output0", [1, 2, 3], &OUTPUT)
    .build()
    .unwrap()
}

#[test]
fn discovers_bindings_and_replays_output_for_both_binding_apis() {
  for api in [BindingApi::ByIndex, BindingApi::ByName] {
    let mut engine = EngineContext::from_bytes(ReplayRuntime::new(), &plan(api)).unwrap();
    assert_eq!(engine.binding_api(), api);

    let catalog = engine.catalog();
    assert_eq!(catalog.inputs().len(), 1);
    assert_eq!(catalog.outputs().len(), 1);
    let input = &catalog.inputs()[0];
    assert_eq!(input.name, "images");
    assert_eq!(input.index, 0);
    assert_eq!(input.element_size, 4);
    assert_eq!(input.element_count, 192);
    assert_eq!(input.byte_size(), 768);
    let output = &catalog.outputs()[0];
    assert_eq!(output.index, 1);
    assert_eq!(output.shape, Shape::from([1, 2, 3]));

    engine.make_pipe(None).unwrap();
    engine
      .copy_from_tensor(&NchwTensor::zeros(3, 8, 8).unwrap())
      .unwrap();
    engine.infer().unwrap();

    let out = engine.output(0).unwrap();
    assert_eq!(out.name, "output0");
    assert_eq!(out.shape, Shape::from([1, 2, 3]));
    assert_eq!(out.values, OUTPUT.to_vec());
  }
}

#[test]
fn warmup_runs_requested_iterations() {
  let runtime = ReplayRuntime::new();
  let stats = runtime.stats();
  let mut engine = EngineContext::from_bytes(runtime, &plan(BindingApi::ByName)).unwrap();

  engine.make_pipe(Some(10)).unwrap();
  assert_eq!(stats.launches(), 10);

  engine.infer().unwrap();
  assert_eq!(stats.launches(), 11);
}

#[test]
fn warmup_fills_every_input() {
  let blob = ReplayPlanBuilder::new(BindingApi::ByIndex)
    .input("images", DataType::Float32, [1, 3, 4, 4], None)
    .input("scale", DataType::Float32, [1, 2], None)
    .output_f32("output0", [1, 2, 3], &OUTPUT)
    .build()
    .unwrap();
  let runtime = ReplayRuntime::new();
  let stats = runtime.stats();
  let mut engine = EngineContext::from_bytes(runtime, &blob).unwrap();
  assert_eq!(engine.catalog().inputs().len(), 2);

  engine.make_pipe(Some(3)).unwrap();
  assert_eq!(stats.launches(), 3);
}

#[test]
fn teardown_releases_every_allocation() {
  let runtime = ReplayRuntime::new();
  let stats = runtime.stats();
  {
    let mut engine = EngineContext::from_bytes(runtime, &plan(BindingApi::ByName)).unwrap();
    engine.make_pipe(Some(1)).unwrap();
    // 一个输入设备缓冲区，一个输出设备缓冲区加一个主机缓冲区
    assert_eq!(stats.device_allocations(), 2);
    assert_eq!(stats.host_allocations(), 1);
    assert_eq!(stats.live_allocations(), 3);

    engine.make_pipe(None).unwrap();
    assert_eq!(stats.live_allocations(), 3);
  }
  assert_eq!(stats.device_frees(), 4);
  assert_eq!(stats.host_frees(), 2);
  assert_eq!(stats.live_allocations(), 0);
}

#[test]
fn load_errors_are_fatal() {
  assert!(matches!(
    EngineContext::from_bytes(ReplayRuntime::new(), &[]),
    Err(EngineError::EmptyPlan)
  ));
  assert!(matches!(
    EngineContext::from_bytes(ReplayRuntime::new(), b"not a plan at all"),
    Err(EngineError::Deserialize(_))
  ));

  let dir = tempfile::tempdir().unwrap();
  assert!(matches!(
    EngineContext::from_file(ReplayRuntime::new(), dir.path().join("missing.plan")),
    Err(EngineError::Io { .. })
  ));

  let empty = dir.path().join("empty.plan");
  std::fs::write(&empty, b"").unwrap();
  assert!(matches!(
    EngineContext::from_file(ReplayRuntime::new(), &empty),
    Err(EngineError::EmptyPlan)
  ));

  let no_outputs = ReplayPlanBuilder::new(BindingApi::ByName)
    .input("images", DataType::Float32, [1, 3, 8, 8], None)
    .build()
    .unwrap();
  assert!(matches!(
    EngineContext::from_bytes(ReplayRuntime::new(), &no_outputs),
    Err(EngineError::NoOutputs)
  ));

  let no_inputs = ReplayPlanBuilder::new(BindingApi::ByName)
    .output_f32("output0", [1, 2, 3], &OUTPUT)
    .build()
    .unwrap();
  assert!(matches!(
    EngineContext::from_bytes(ReplayRuntime::new(), &no_inputs),
    Err(EngineError::NoInputs)
  ));
}

#[test]
fn loads_plan_from_file() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("model.plan");
  std::fs::write(&path, plan(BindingApi::ByIndex)).unwrap();
  let engine = EngineContext::from_file(ReplayRuntime::new(), &path).unwrap();
  assert_eq!(engine.catalog().num_tensors(), 2);
}

#[test]
fn pipe_must_exist_before_use() {
  let mut engine = EngineContext::from_bytes(ReplayRuntime::new(), &plan(BindingApi::ByName)).unwrap();
  assert!(!engine.is_pipe_ready());
  assert!(matches!(engine.infer(), Err(EngineError::PipeNotReady)));
  assert!(matches!(
    engine.copy_from_tensor(&NchwTensor::zeros(3, 8, 8).unwrap()),
    Err(EngineError::PipeNotReady)
  ));
  assert!(matches!(engine.output(0), Err(EngineError::PipeNotReady)));
}

#[test]
fn oversized_input_is_rejected() {
  let mut engine = EngineContext::from_bytes(ReplayRuntime::new(), &plan(BindingApi::ByName)).unwrap();
  engine.make_pipe(None).unwrap();
  assert!(matches!(
    engine.copy_from_tensor(&NchwTensor::zeros(3, 16, 16).unwrap()),
    Err(EngineError::InputTooLarge {
      bytes: 3072,
      capacity: 768,
      ..
    })
  ));
  assert!(matches!(engine.output(1), Err(EngineError::UnknownBinding(1))));
}

#[test]
fn dynamic_input_accepts_smaller_shapes() {
  let blob = ReplayPlanBuilder::new(BindingApi::ByName)
    .input(
      "images",
      DataType::Float32,
      [1, 3, -1, -1],
      Some(Shape::from([1, 3, 16, 16])),
    )
    .output_f32("output0", [1, 2, 3], &OUTPUT)
    .build()
    .unwrap();
  let mut engine = EngineContext::from_bytes(ReplayRuntime::new(), &blob).unwrap();
  assert_eq!(engine.catalog().inputs()[0].shape, Shape::from([1, 3, 16, 16]));

  engine.make_pipe(Some(1)).unwrap();
  engine
    .copy_from_tensor(&NchwTensor::zeros(3, 8, 16).unwrap())
    .unwrap();
  engine.infer().unwrap();
  assert_eq!(engine.output(0).unwrap().values, OUTPUT.to_vec());

  // 字节数未超出容量，但形状超出最大形状
  assert!(matches!(
    engine.copy_from_tensor(&NchwTensor::zeros(3, 4, 32).unwrap()),
    Err(EngineError::InputShape { .. })
  ));
}

#[test]
fn allocation_failure_propagates_and_leaks_nothing() {
  let runtime = ReplayRuntime::new().with_device_memory_limit(780);
  let stats = runtime.stats();
  let mut engine = EngineContext::from_bytes(runtime, &plan(BindingApi::ByName)).unwrap();

  match engine.make_pipe(None) {
    Err(EngineError::Allocation { name, .. }) => assert_eq!(name, "output0"),
    other => panic!("期望分配失败, 实际 {:?}", other.map(|_| ())),
  }
  assert!(!engine.is_pipe_ready());
  assert_eq!(stats.live_allocations(), 0);
}

#[test]
fn non_float_output_cannot_be_read_as_f32() {
  let blob = ReplayPlanBuilder::new(BindingApi::ByName)
    .input("images", DataType::Float32, [1, 3, 2, 2], None)
    .output("mask", DataType::UInt8, [1, 4], &[1, 2, 3, 4])
    .build()
    .unwrap();
  let mut engine = EngineContext::from_bytes(ReplayRuntime::new(), &blob).unwrap();
  engine.make_pipe(Some(1)).unwrap();
  assert!(matches!(
    engine.output(0),
    Err(EngineError::OutputType {
      data_type: DataType::UInt8,
      ..
    })
  ));
}
