// 该文件是 Qianli （千里眼） 项目的一部分。
// src/engine.rs - 推理引擎上下文
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

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::{
  frame::NchwTensor,
  runtime::{
    BindingApi, DataType, DeviceMemory, Engine, ExecutionContext, HostMemory, Runtime,
    RuntimeError, Shape, Stream,
  },
};

mod binding;
mod buffer;
mod executor;

pub use self::binding::{Binding, BindingCatalog};
use self::{
  buffer::BufferPool,
  executor::{TensorBinder, select_binder},
};

pub const DEFAULT_WARMUP_ITERATIONS: usize = 10;

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("读取执行计划 {path} 失败: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("执行计划为空")]
  EmptyPlan,
  #[error("执行计划无效: {0}")]
  Deserialize(RuntimeError),
  #[error("创建执行上下文失败: {0}")]
  ContextCreation(RuntimeError),
  #[error("创建执行流失败: {0}")]
  Stream(RuntimeError),
  #[error("执行计划没有输入张量")]
  NoInputs,
  #[error("执行计划没有输出张量")]
  NoOutputs,
  #[error("张量 {name} 的形状 {shape} 无法确定缓冲区大小")]
  DynamicShape { name: String, shape: Shape },
  #[error("张量绑定失败: {0}")]
  Binding(RuntimeError),
  #[error("为张量 {name} 分配缓冲区失败: {source}")]
  Allocation { name: String, source: RuntimeError },
  #[error("推理执行失败: {0}")]
  Execution(RuntimeError),
  #[error("缓冲区尚未分配，请先调用 make_pipe")]
  PipeNotReady,
  #[error("输入 {name} 的数据 {bytes} 字节超出缓冲区容量 {capacity} 字节")]
  InputTooLarge {
    name: String,
    bytes: usize,
    capacity: usize,
  },
  #[error("输入 {name} 的形状 {shape} 超出最大形状 {max}")]
  InputShape { name: String, shape: Shape, max: Shape },
  #[error("输入 {name} 的元素类型为 {actual}, 无法写入 {expected} 数据")]
  InputTypeMismatch {
    name: String,
    expected: DataType,
    actual: DataType,
  },
  #[error("输出 {name} 的元素类型为 {data_type}, 只支持 f32")]
  OutputType { name: String, data_type: DataType },
  #[error("张量序号 {0} 不存在")]
  UnknownBinding(usize),
}

/// 输出张量在主机端的副本
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
  pub name: String,
  pub shape: Shape,
  pub values: Vec<f32>,
}

/// 一个执行计划及其执行上下文、执行流与缓冲区。
///
/// 字段按释放顺序声明：执行上下文、执行计划、运行时、执行流，最后是缓冲区。
/// 同一个上下文上的调用须由调用者串行化。
pub struct EngineContext<R: Runtime> {
  context: R::Context,
  engine: R::Engine,
  runtime: R,
  stream: R::Stream,
  buffers: Option<BufferPool<R::Stream>>,
  binder: Box<dyn TensorBinder<R::Context>>,
  catalog: BindingCatalog,
}

impl<R: Runtime> EngineContext<R> {
  pub fn from_file(runtime: R, path: impl AsRef<Path>) -> Result<Self, EngineError> {
    let path = path.as_ref();
    info!("加载执行计划文件: {}", path.display());
    let blob = std::fs::read(path).map_err(|source| EngineError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    debug!(
      "执行计划大小: {:.2} MB",
      blob.len() as f64 / (1024.0 * 1024.0)
    );
    Self::from_bytes(runtime, &blob)
  }

  pub fn from_bytes(runtime: R, blob: &[u8]) -> Result<Self, EngineError> {
    if blob.is_empty() {
      return Err(EngineError::EmptyPlan);
    }

    info!("使用 {} 运行时反序列化执行计划", runtime.name());
    let engine = runtime
      .deserialize_engine(blob)
      .map_err(EngineError::Deserialize)?;
    let mut context = engine
      .create_execution_context()
      .map_err(EngineError::ContextCreation)?;
    let stream = runtime.create_stream().map_err(EngineError::Stream)?;

    let mut binder = select_binder(context.binding_api(), engine.num_io_tensors());
    let catalog = BindingCatalog::discover(&engine, &mut context, binder.as_mut())?;
    if catalog.inputs().is_empty() {
      return Err(EngineError::NoInputs);
    }
    if catalog.outputs().is_empty() {
      return Err(EngineError::NoOutputs);
    }

    info!(
      "执行计划加载完成: {} 个输入, {} 个输出",
      catalog.inputs().len(),
      catalog.outputs().len()
    );

    Ok(Self {
      context,
      engine,
      runtime,
      stream,
      buffers: None,
      binder,
      catalog,
    })
  }

  pub fn catalog(&self) -> &BindingCatalog {
    &self.catalog
  }

  pub fn binding_api(&self) -> BindingApi {
    self.binder.api()
  }

  pub fn runtime(&self) -> &R {
    &self.runtime
  }

  pub fn engine(&self) -> &R::Engine {
    &self.engine
  }

  pub fn is_pipe_ready(&self) -> bool {
    self.buffers.is_some()
  }

  /// 分配全部缓冲区并绑定地址；`warmup` 给出预热推理次数
  pub fn make_pipe(&mut self, warmup: Option<usize>) -> Result<(), EngineError> {
    if self.buffers.take().is_some() {
      debug!("释放已有缓冲区并重新分配");
    }

    let pool = BufferPool::allocate(&self.stream, &self.catalog)?;
    for (binding, device) in self.catalog.inputs().iter().zip(pool.inputs()) {
      self
        .binder
        .bind_address(&mut self.context, binding, device.address())
        .map_err(EngineError::Binding)?;
    }
    for (binding, output) in self.catalog.outputs().iter().zip(pool.outputs()) {
      self
        .binder
        .bind_address(&mut self.context, binding, output.device.address())
        .map_err(EngineError::Binding)?;
    }
    self.buffers = Some(pool);

    match warmup {
      Some(iterations) if iterations > 0 => self.warmup(iterations),
      _ => Ok(()),
    }
  }

  /// 以全零输入执行若干次推理
  pub fn warmup(&mut self, iterations: usize) -> Result<(), EngineError> {
    let buffers = self.buffers.as_ref().ok_or(EngineError::PipeNotReady)?;
    info!("预热推理 {} 次", iterations);

    for (binding, device) in self.catalog.inputs().iter().zip(buffers.inputs()) {
      self
        .binder
        .commit_input_shape(&mut self.context, binding, &binding.shape)
        .map_err(EngineError::Binding)?;
      let zeros = vec![0u8; binding.byte_size()];
      self
        .stream
        .copy_to_device_async(device, &zeros)
        .map_err(EngineError::Execution)?;
    }

    for _ in 0..iterations {
      self.infer()?;
    }
    debug!("预热完成");
    Ok(())
  }

  /// 把预处理后的张量拷入第一个输入，并提交其实际形状
  pub fn copy_from_tensor(&mut self, tensor: &NchwTensor) -> Result<(), EngineError> {
    self.copy_input(0, &tensor.shape(), DataType::Float32, &tensor.to_le_bytes())
  }

  pub fn copy_input(
    &mut self,
    index: usize,
    shape: &Shape,
    data_type: DataType,
    bytes: &[u8],
  ) -> Result<(), EngineError> {
    let buffers = self.buffers.as_ref().ok_or(EngineError::PipeNotReady)?;
    let binding = self
      .catalog
      .input(index)
      .ok_or(EngineError::UnknownBinding(index))?;
    let device = buffers
      .input(index)
      .ok_or(EngineError::UnknownBinding(index))?;

    if binding.data_type != data_type {
      return Err(EngineError::InputTypeMismatch {
        name: binding.name.clone(),
        expected: data_type,
        actual: binding.data_type,
      });
    }
    if bytes.len() > binding.byte_size() {
      return Err(EngineError::InputTooLarge {
        name: binding.name.clone(),
        bytes: bytes.len(),
        capacity: binding.byte_size(),
      });
    }
    if !shape.fits_within(&binding.shape) {
      return Err(EngineError::InputShape {
        name: binding.name.clone(),
        shape: shape.clone(),
        max: binding.shape.clone(),
      });
    }

    self
      .binder
      .commit_input_shape(&mut self.context, binding, shape)
      .map_err(EngineError::Binding)?;
    self
      .stream
      .copy_to_device_async(device, bytes)
      .map_err(EngineError::Execution)
  }

  /// 提交执行，拷回全部输出，并阻塞到执行流完成
  pub fn infer(&mut self) -> Result<(), EngineError> {
    let buffers = self.buffers.as_ref().ok_or(EngineError::PipeNotReady)?;

    self
      .binder
      .launch(&mut self.context, &self.stream)
      .map_err(EngineError::Execution)?;
    for output in buffers.outputs() {
      self
        .stream
        .copy_to_host_async(&output.host, &output.device)
        .map_err(EngineError::Execution)?;
    }
    self.stream.synchronize().map_err(EngineError::Execution)
  }

  pub fn output(&self, index: usize) -> Result<OutputTensor, EngineError> {
    let buffers = self.buffers.as_ref().ok_or(EngineError::PipeNotReady)?;
    let binding = self
      .catalog
      .output(index)
      .ok_or(EngineError::UnknownBinding(index))?;
    let buffer = buffers
      .output(index)
      .ok_or(EngineError::UnknownBinding(index))?;

    if binding.data_type != DataType::Float32 {
      return Err(EngineError::OutputType {
        name: binding.name.clone(),
        data_type: binding.data_type,
      });
    }

    // 输入形状变化时输出形状可能随之缩小
    let (shape, count) = match self.context.tensor_shape(binding.index) {
      Ok(shape) => match shape.element_count() {
        Some(count) if count <= binding.element_count => (shape, count),
        _ => (binding.shape.clone(), binding.element_count),
      },
      Err(_) => (binding.shape.clone(), binding.element_count),
    };

    let values = buffer
      .host
      .read(|bytes| {
        bytes
          .chunks_exact(4)
          .take(count)
          .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
          .collect::<Vec<f32>>()
      })
      .map_err(EngineError::Execution)?;

    Ok(OutputTensor {
      name: binding.name.clone(),
      shape,
      values,
    })
  }
}
