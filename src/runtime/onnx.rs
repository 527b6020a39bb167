// 该文件是 Qianli （千里眼） 项目的一部分。
// src/runtime/onnx.rs - ONNX Runtime 后端
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

//! 由 ONNX Runtime 执行 ONNX 模型，可选 CUDA 或 TensorRT 执行提供方。
//!
//! 缓冲区在主机内存中分配，设备侧的拷贝由执行提供方完成。
//! 执行流上的操作在提交时即完成，`synchronize` 只是一个顺序点。

use std::{
  collections::HashMap,
  sync::{Arc, Mutex, MutexGuard},
};

use ort::{
  execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch},
  session::{Session, builder::GraphOptimizationLevel},
  tensor::TensorElementType,
  value::{Tensor, ValueType},
};
use tracing::{debug, info};
use url::Url;

use super::{
  BindingApi, DataType, DeviceMemory, DevicePtr, Engine, ExecutionContext, HostMemory, IoMode,
  Runtime, RuntimeError, Shape, Stream,
};
use crate::FromUrl;

const ONNX_ADDRESS_BASE: u64 = 0x6f00_0000_0000;
const ONNX_ADDRESS_STEP: u64 = 0x100;

/// 执行提供方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnnxDevice {
  #[default]
  Cpu,
  /// CUDA 设备序号
  Cuda(i32),
  /// TensorRT 设备序号，不支持的算子回落到 CUDA
  TensorRt(i32),
}

impl OnnxDevice {
  fn parse(name: &str, device_id: i32) -> Result<Self, RuntimeError> {
    match name {
      "cpu" => Ok(OnnxDevice::Cpu),
      "cuda" => Ok(OnnxDevice::Cuda(device_id)),
      "tensorrt" | "trt" => Ok(OnnxDevice::TensorRt(device_id)),
      other => Err(RuntimeError::InvalidOption {
        key: "device".to_string(),
        value: other.to_string(),
      }),
    }
  }

  fn providers(self) -> Result<Vec<ExecutionProviderDispatch>, RuntimeError> {
    let mut providers = Vec::new();
    match self {
      OnnxDevice::Cpu => {}
      #[cfg(feature = "tensorrt")]
      OnnxDevice::TensorRt(device_id) => {
        use ort::execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider};
        providers.push(
          TensorRTExecutionProvider::default()
            .with_device_id(device_id)
            .build(),
        );
        providers.push(CUDAExecutionProvider::default().with_device_id(device_id).build());
      }
      #[cfg(not(feature = "tensorrt"))]
      OnnxDevice::TensorRt(_) => {
        return Err(RuntimeError::Unsupported("未启用 tensorrt 特性"));
      }
      #[cfg(feature = "cuda")]
      OnnxDevice::Cuda(device_id) => {
        use ort::execution_providers::CUDAExecutionProvider;
        providers.push(CUDAExecutionProvider::default().with_device_id(device_id).build());
      }
      #[cfg(not(feature = "cuda"))]
      OnnxDevice::Cuda(_) => {
        return Err(RuntimeError::Unsupported("未启用 cuda 特性"));
      }
    }
    providers.push(CPUExecutionProvider::default().build());
    Ok(providers)
  }
}

#[derive(Debug, Clone, Default)]
pub struct OnnxRuntime {
  device: OnnxDevice,
  max_shapes: HashMap<String, Shape>,
  default_max_shape: Option<Shape>,
}

impl FromUrl for OnnxRuntime {
  type Error = RuntimeError;

  /// 读取 `device=cpu|cuda|tensorrt`、`device_id=<n>` 与 `max_shape=1x3x640x640`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();

    let device_id = match query.get("device_id") {
      Some(value) => value.parse::<i32>().map_err(|_| RuntimeError::InvalidOption {
        key: "device_id".to_string(),
        value: value.clone(),
      })?,
      None => 0,
    };
    let device = match query.get("device") {
      Some(name) => OnnxDevice::parse(name, device_id)?,
      None => OnnxDevice::Cpu,
    };

    let mut runtime = Self::new(device);
    if let Some(shape) = query.get("max_shape") {
      runtime.default_max_shape = Some(shape.parse()?);
    }
    Ok(runtime)
  }
}

impl OnnxRuntime {
  pub fn new(device: OnnxDevice) -> Self {
    Self {
      device,
      ..Default::default()
    }
  }

  pub fn device(&self) -> OnnxDevice {
    self.device
  }

  /// 为名为 `name` 的动态输入指定最大形状
  pub fn with_max_shape(mut self, name: impl Into<String>, shape: Shape) -> Self {
    self.max_shapes.insert(name.into(), shape);
    self
  }

  /// 动态输入的最大形状：显式指定的优先，否则只允许批次维度为动态并按 1 处理
  fn resolve_max_shape(&self, name: &str, declared: &Shape) -> Result<Shape, RuntimeError> {
    if !declared.is_dynamic() {
      return Ok(declared.clone());
    }

    if let Some(max) = self.max_shapes.get(name).or(self.default_max_shape.as_ref()) {
      let consistent = max.rank() == declared.rank()
        && !max.is_dynamic()
        && declared
          .dims()
          .iter()
          .zip(max.dims())
          .all(|(&d, &m)| d < 0 || d == m);
      if !consistent {
        return Err(RuntimeError::InvalidShape(format!(
          "输入张量 {} 的形状 {} 与指定的最大形状 {} 不一致",
          name, declared, max
        )));
      }
      return Ok(max.clone());
    }

    match declared.dims().split_first() {
      Some((_, rest)) if rest.iter().all(|&d| d >= 0) => {
        let mut dims = declared.dims().to_vec();
        dims[0] = 1;
        Ok(Shape::new(dims))
      }
      _ => Err(RuntimeError::Deserialize(format!(
        "输入张量 {} 的形状 {} 含动态维度，请通过 max_shape 指定最大形状",
        name, declared
      ))),
    }
  }
}

fn tensor_info(name: &str, value_type: &ValueType) -> Result<(DataType, Shape), RuntimeError> {
  match value_type {
    ValueType::Tensor { ty, shape, .. } => {
      let data_type = match ty {
        TensorElementType::Float32 => DataType::Float32,
        TensorElementType::Float16 => DataType::Float16,
        TensorElementType::Int32 => DataType::Int32,
        TensorElementType::Int64 => DataType::Int64,
        TensorElementType::Int8 => DataType::Int8,
        TensorElementType::Uint8 => DataType::UInt8,
        TensorElementType::Bool => DataType::Bool,
        other => {
          return Err(RuntimeError::Deserialize(format!(
            "张量 {} 的元素类型 {:?} 不受支持",
            name, other
          )));
        }
      };
      Ok((data_type, Shape::new(shape.iter().copied().collect::<Vec<i64>>())))
    }
    other => Err(RuntimeError::Deserialize(format!(
      "{} 不是张量: {:?}",
      name, other
    ))),
  }
}

fn execution_error(e: ort::Error) -> RuntimeError {
  RuntimeError::Execution(e.to_string())
}

impl Runtime for OnnxRuntime {
  type Engine = OnnxEngine;
  type Context = OnnxContext;
  type Stream = OnnxStream;

  fn name(&self) -> &'static str {
    "onnx"
  }

  fn deserialize_engine(&self, blob: &[u8]) -> Result<Self::Engine, RuntimeError> {
    let providers = self.device.providers()?;
    let session = Session::builder()
      .map_err(|e| RuntimeError::Deserialize(e.to_string()))?
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(|e| RuntimeError::Deserialize(e.to_string()))?
      .with_execution_providers(providers)
      .map_err(|e| RuntimeError::Deserialize(e.to_string()))?
      .commit_from_memory(blob)
      .map_err(|e| RuntimeError::Deserialize(e.to_string()))?;

    let mut tensors = Vec::with_capacity(session.inputs.len() + session.outputs.len());
    for input in &session.inputs {
      let (data_type, shape) = tensor_info(&input.name, &input.input_type)?;
      let max_shape = self.resolve_max_shape(&input.name, &shape)?;
      tensors.push(OnnxTensor {
        name: input.name.clone(),
        data_type,
        mode: IoMode::Input,
        shape,
        max_shape,
      });
    }
    for output in &session.outputs {
      let (data_type, shape) = tensor_info(&output.name, &output.output_type)?;
      tensors.push(OnnxTensor {
        name: output.name.clone(),
        data_type,
        mode: IoMode::Output,
        max_shape: shape.clone(),
        shape,
      });
    }

    info!(
      "ONNX 模型加载完成: {} 个输入, {} 个输出, 执行提供方 {:?}",
      session.inputs.len(),
      session.outputs.len(),
      self.device
    );
    Ok(OnnxEngine {
      session: Arc::new(Mutex::new(session)),
      tensors: tensors.into(),
    })
  }

  fn create_stream(&self) -> Result<Self::Stream, RuntimeError> {
    Ok(OnnxStream {
      arena: Arc::new(Mutex::new(Arena::default())),
    })
  }
}

#[derive(Debug)]
struct OnnxTensor {
  name: String,
  data_type: DataType,
  mode: IoMode,
  shape: Shape,
  max_shape: Shape,
}

pub struct OnnxEngine {
  session: Arc<Mutex<Session>>,
  tensors: Arc<[OnnxTensor]>,
}

impl OnnxEngine {
  fn tensor(&self, index: usize) -> Result<&OnnxTensor, RuntimeError> {
    self
      .tensors
      .get(index)
      .ok_or_else(|| RuntimeError::UnknownTensor(format!("#{}", index)))
  }
}

impl Engine for OnnxEngine {
  type Context = OnnxContext;

  fn num_io_tensors(&self) -> usize {
    self.tensors.len()
  }

  fn tensor_name(&self, index: usize) -> Result<&str, RuntimeError> {
    Ok(self.tensor(index)?.name.as_str())
  }

  fn tensor_data_type(&self, index: usize) -> Result<DataType, RuntimeError> {
    Ok(self.tensor(index)?.data_type)
  }

  fn tensor_io_mode(&self, index: usize) -> Result<IoMode, RuntimeError> {
    Ok(self.tensor(index)?.mode)
  }

  fn profile_max_shape(&self, index: usize) -> Result<Shape, RuntimeError> {
    let tensor = self.tensor(index)?;
    match tensor.mode {
      IoMode::Input => Ok(tensor.max_shape.clone()),
      IoMode::Output => Err(RuntimeError::InvalidShape(format!(
        "输出张量 {} 没有最大形状",
        tensor.name
      ))),
    }
  }

  fn create_execution_context(&self) -> Result<Self::Context, RuntimeError> {
    let mut context = OnnxContext {
      session: Arc::clone(&self.session),
      tensors: Arc::clone(&self.tensors),
      shapes: self.tensors.iter().map(|t| t.max_shape.clone()).collect(),
      addresses: vec![DevicePtr::NULL; self.tensors.len()],
    };

    // 输出形状依赖输入时，用最大输入形状的全零数据推出输出形状
    if context.shapes.iter().any(Shape::is_dynamic) {
      let mut inputs = Vec::new();
      for tensor in context.tensors.iter().filter(|t| t.mode == IoMode::Input) {
        if tensor.data_type != DataType::Float32 {
          return Err(RuntimeError::ContextCreation(format!(
            "输入张量 {} 的元素类型 {} 不受支持",
            tensor.name, tensor.data_type
          )));
        }
        let count = tensor.max_shape.element_count().unwrap_or(0);
        inputs.push((tensor.name.clone(), tensor.max_shape.clone(), vec![0.0f32; count]));
      }
      context
        .run(inputs)
        .map_err(|e| RuntimeError::ContextCreation(e.to_string()))?;
      debug!("由全零输入推出输出形状: {:?}", context.shapes);
    }

    Ok(context)
  }
}

pub struct OnnxContext {
  session: Arc<Mutex<Session>>,
  tensors: Arc<[OnnxTensor]>,
  shapes: Vec<Shape>,
  addresses: Vec<DevicePtr>,
}

impl OnnxContext {
  fn position(&self, name: &str) -> Result<usize, RuntimeError> {
    self
      .tensors
      .iter()
      .position(|t| t.name == name)
      .ok_or_else(|| RuntimeError::UnknownTensor(name.to_string()))
  }

  /// 执行一次推理，按张量顺序返回每个输出的序号与数据，并记录实际输出形状
  fn run(
    &mut self,
    inputs: Vec<(String, Shape, Vec<f32>)>,
  ) -> Result<Vec<(usize, Vec<f32>)>, RuntimeError> {
    let mut values = Vec::with_capacity(inputs.len());
    for (name, shape, data) in inputs {
      let tensor = Tensor::from_array((shape.dims().to_vec(), data)).map_err(execution_error)?;
      values.push((name, tensor));
    }

    let mut session = self
      .session
      .lock()
      .map_err(|_| RuntimeError::Execution("推理会话锁已损坏".to_string()))?;
    let outputs = session.run(values).map_err(execution_error)?;

    let mut results = Vec::new();
    for (index, tensor) in self.tensors.iter().enumerate() {
      if tensor.mode != IoMode::Output {
        continue;
      }
      let value = outputs
        .get(tensor.name.as_str())
        .ok_or_else(|| RuntimeError::Execution(format!("缺少输出张量 {}", tensor.name)))?;
      let (shape, data) = value.try_extract_tensor::<f32>().map_err(execution_error)?;
      self.shapes[index] = Shape::new(shape.iter().copied().collect::<Vec<i64>>());
      results.push((index, data.to_vec()));
    }
    Ok(results)
  }
}

impl ExecutionContext for OnnxContext {
  type Stream = OnnxStream;

  fn binding_api(&self) -> BindingApi {
    BindingApi::ByName
  }

  fn tensor_shape(&self, index: usize) -> Result<Shape, RuntimeError> {
    self
      .shapes
      .get(index)
      .cloned()
      .ok_or_else(|| RuntimeError::UnknownTensor(format!("#{}", index)))
  }

  fn set_input_shape(&mut self, name: &str, shape: &Shape) -> Result<(), RuntimeError> {
    let index = self.position(name)?;
    let tensor = &self.tensors[index];
    if tensor.mode != IoMode::Input {
      return Err(RuntimeError::InvalidShape(format!("张量 {} 不是输入张量", name)));
    }
    if !shape.fits_within(&tensor.max_shape) {
      return Err(RuntimeError::InvalidShape(format!(
        "张量 {} 的形状 {} 超出最大形状 {}",
        name, shape, tensor.max_shape
      )));
    }
    self.shapes[index] = shape.clone();
    Ok(())
  }

  fn set_tensor_address(&mut self, name: &str, address: DevicePtr) -> Result<(), RuntimeError> {
    let index = self.position(name)?;
    self.addresses[index] = address;
    Ok(())
  }

  fn enqueue(&mut self, stream: &Self::Stream) -> Result<(), RuntimeError> {
    let mut inputs = Vec::new();
    {
      let arena = lock(&stream.arena)?;
      for ((tensor, shape), address) in self.tensors.iter().zip(&self.shapes).zip(&self.addresses) {
        if address.is_null() {
          return Err(RuntimeError::Execution(format!(
            "张量 {} 未绑定设备地址",
            tensor.name
          )));
        }
        if tensor.mode != IoMode::Input {
          continue;
        }
        if tensor.data_type != DataType::Float32 {
          return Err(RuntimeError::Execution(format!(
            "输入张量 {} 的元素类型 {} 不受支持",
            tensor.name, tensor.data_type
          )));
        }
        let count = shape.element_count().ok_or_else(|| {
          RuntimeError::Execution(format!("输入张量 {} 的形状尚未确定", tensor.name))
        })?;
        let bytes = arena.get(address.0)?;
        let needed = count * DataType::Float32.size();
        if bytes.len() < needed {
          return Err(RuntimeError::Execution(format!(
            "输入张量 {} 需要 {} 字节, 缓冲区只有 {} 字节",
            tensor.name,
            needed,
            bytes.len()
          )));
        }
        let data: Vec<f32> = bytes[..needed]
          .chunks_exact(4)
          .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
          .collect();
        inputs.push((tensor.name.clone(), shape.clone(), data));
      }
    }

    let results = self.run(inputs)?;

    let mut arena = lock(&stream.arena)?;
    for (index, values) in results {
      let name = &self.tensors[index].name;
      let buf = arena.get_mut(self.addresses[index].0)?;
      let needed = values.len() * DataType::Float32.size();
      if buf.len() < needed {
        return Err(RuntimeError::Execution(format!(
          "输出张量 {} 需要 {} 字节, 缓冲区只有 {} 字节",
          name,
          needed,
          buf.len()
        )));
      }
      for (dst, v) in buf.chunks_exact_mut(4).zip(&values) {
        dst.copy_from_slice(&v.to_le_bytes());
      }
    }
    Ok(())
  }
}

#[derive(Debug, Default)]
struct Arena {
  buffers: HashMap<u64, Vec<u8>>,
  handles: u64,
}

impl Arena {
  fn insert(&mut self, bytes: usize) -> u64 {
    self.handles += 1;
    let address = ONNX_ADDRESS_BASE + self.handles * ONNX_ADDRESS_STEP;
    self.buffers.insert(address, vec![0u8; bytes]);
    address
  }

  fn get(&self, address: u64) -> Result<&[u8], RuntimeError> {
    self
      .buffers
      .get(&address)
      .map(Vec::as_slice)
      .ok_or_else(|| RuntimeError::Copy(format!("内存地址 {:#x} 无效", address)))
  }

  fn get_mut(&mut self, address: u64) -> Result<&mut [u8], RuntimeError> {
    self
      .buffers
      .get_mut(&address)
      .map(Vec::as_mut_slice)
      .ok_or_else(|| RuntimeError::Copy(format!("内存地址 {:#x} 无效", address)))
  }
}

fn lock(arena: &Mutex<Arena>) -> Result<MutexGuard<'_, Arena>, RuntimeError> {
  arena
    .lock()
    .map_err(|_| RuntimeError::Synchronize("执行流状态已损坏".to_string()))
}

#[derive(Debug)]
pub struct OnnxStream {
  arena: Arc<Mutex<Arena>>,
}

impl OnnxStream {
  fn alloc(&self, bytes: usize) -> Result<(u64, Arc<Mutex<Arena>>), RuntimeError> {
    let address = lock(&self.arena)?.insert(bytes);
    Ok((address, Arc::clone(&self.arena)))
  }
}

impl Stream for OnnxStream {
  type DeviceMemory = OnnxMemory;
  type HostMemory = OnnxMemory;

  fn alloc_device_async(&self, bytes: usize) -> Result<Self::DeviceMemory, RuntimeError> {
    let (address, arena) = self.alloc(bytes)?;
    Ok(OnnxMemory {
      address,
      len: bytes,
      arena,
    })
  }

  fn alloc_host_pinned(&self, bytes: usize) -> Result<Self::HostMemory, RuntimeError> {
    self.alloc_device_async(bytes)
  }

  fn copy_to_device_async(&self, dst: &Self::DeviceMemory, src: &[u8]) -> Result<(), RuntimeError> {
    let mut arena = lock(&self.arena)?;
    let buf = arena.get_mut(dst.address)?;
    if src.len() > buf.len() {
      return Err(RuntimeError::Copy(format!(
        "拷贝 {} 字节超出缓冲区 {} 字节",
        src.len(),
        buf.len()
      )));
    }
    buf[..src.len()].copy_from_slice(src);
    Ok(())
  }

  fn copy_to_host_async(
    &self,
    dst: &Self::HostMemory,
    src: &Self::DeviceMemory,
  ) -> Result<(), RuntimeError> {
    let mut arena = lock(&self.arena)?;
    let data = arena.get(src.address)?;
    if data.len() < dst.len {
      return Err(RuntimeError::Copy(format!(
        "源缓冲区 {} 字节小于目标缓冲区 {} 字节",
        data.len(),
        dst.len
      )));
    }
    let data = data[..dst.len].to_vec();
    arena.get_mut(dst.address)?.copy_from_slice(&data);
    Ok(())
  }

  fn synchronize(&self) -> Result<(), RuntimeError> {
    Ok(())
  }
}

/// 主机内存句柄，设备缓冲区与锁页缓冲区共用
#[derive(Debug)]
pub struct OnnxMemory {
  address: u64,
  len: usize,
  arena: Arc<Mutex<Arena>>,
}

impl DeviceMemory for OnnxMemory {
  fn address(&self) -> DevicePtr {
    DevicePtr(self.address)
  }

  fn len(&self) -> usize {
    self.len
  }
}

impl HostMemory for OnnxMemory {
  fn len(&self) -> usize {
    self.len
  }

  fn read<T>(&self, f: impl FnOnce(&[u8]) -> T) -> Result<T, RuntimeError> {
    let arena = lock(&self.arena)?;
    Ok(f(arena.get(self.address)?))
  }
}

impl Drop for OnnxMemory {
  fn drop(&mut self) {
    if let Ok(mut arena) = self.arena.lock() {
      arena.buffers.remove(&self.address);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn runtime_options_from_model_url() {
    let url = Url::parse("yolov8:///m.onnx?device=cpu&max_shape=1x3x640x640").unwrap();
    let runtime = OnnxRuntime::from_url(&url).unwrap();
    assert_eq!(runtime.device(), OnnxDevice::Cpu);
    assert_eq!(runtime.default_max_shape, Some(Shape::from([1, 3, 640, 640])));

    let url = Url::parse("yolov8:///m.onnx?device=cuda&device_id=1").unwrap();
    assert_eq!(OnnxRuntime::from_url(&url).unwrap().device(), OnnxDevice::Cuda(1));

    let url = Url::parse("yolov8:///m.onnx?device=npu").unwrap();
    assert!(matches!(
      OnnxRuntime::from_url(&url),
      Err(RuntimeError::InvalidOption { .. })
    ));
    let url = Url::parse("yolov8:///m.onnx?device_id=first").unwrap();
    assert!(OnnxRuntime::from_url(&url).is_err());
  }

  #[test]
  fn dynamic_inputs_need_a_max_shape() {
    let runtime = OnnxRuntime::default();
    assert_eq!(
      runtime
        .resolve_max_shape("images", &Shape::from([1, 3, 640, 640]))
        .unwrap(),
      Shape::from([1, 3, 640, 640])
    );
    // 只有批次维度动态时按 1 处理
    assert_eq!(
      runtime
        .resolve_max_shape("images", &Shape::from([-1, 3, 640, 640]))
        .unwrap(),
      Shape::from([1, 3, 640, 640])
    );
    assert!(matches!(
      runtime.resolve_max_shape("images", &Shape::from([1, 3, -1, -1])),
      Err(RuntimeError::Deserialize(_))
    ));

    let runtime = OnnxRuntime::default().with_max_shape("images", Shape::from([1, 3, 960, 960]));
    assert_eq!(
      runtime
        .resolve_max_shape("images", &Shape::from([1, 3, -1, -1]))
        .unwrap(),
      Shape::from([1, 3, 960, 960])
    );
    assert!(matches!(
      runtime.resolve_max_shape("images", &Shape::from([1, 1, -1, -1])),
      Err(RuntimeError::InvalidShape(_))
    ));
  }

  #[test]
  fn stream_copies_are_immediate() {
    let stream = OnnxRuntime::default().create_stream().unwrap();
    let device = stream.alloc_device_async(4).unwrap();
    let host = stream.alloc_host_pinned(4).unwrap();
    stream.copy_to_device_async(&device, &[1, 2, 3, 4]).unwrap();
    stream.copy_to_host_async(&host, &device).unwrap();
    assert_eq!(host.read(|b| b.to_vec()).unwrap(), vec![1, 2, 3, 4]);
    assert!(stream.copy_to_device_async(&device, &[0; 8]).is_err());

    let address = device.address().0;
    drop(device);
    assert!(lock(&stream.arena).unwrap().get(address).is_err());
  }
}
