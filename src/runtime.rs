// 该文件是 Qianli （千里眼） 项目的一部分。
// src/runtime.rs - 加速器运行时能力接口
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

//! 加速器运行时的能力接口。
//!
//! 推理核心只依赖这里的 trait：反序列化执行计划、枚举 I/O 张量、
//! 在执行流上分配内存、拷贝数据、提交执行与同步。
//! 具体的加速器实现这些 trait：`onnx` 特性下的 ONNX Runtime 后端，
//! 以及用于离线验证与测试的 [`replay`] 回放运行时。

use std::{fmt, str::FromStr};

use thiserror::Error;
use url::Url;

use crate::FromUrl;

#[cfg(feature = "onnx")]
pub mod onnx;
pub mod replay;

/// 模型 URL 中选择运行时的查询参数
pub const RUNTIME_QUERY_KEY: &str = "runtime";

#[derive(Error, Debug)]
pub enum RuntimeError {
  #[error("执行计划反序列化失败: {0}")]
  Deserialize(String),
  #[error("执行计划序列化失败: {0}")]
  Serialize(String),
  #[error("执行上下文创建失败: {0}")]
  ContextCreation(String),
  #[error("内存分配失败（{bytes} 字节）: {reason}")]
  Allocation { bytes: usize, reason: String },
  #[error("数据拷贝失败: {0}")]
  Copy(String),
  #[error("执行失败: {0}")]
  Execution(String),
  #[error("执行流同步失败: {0}")]
  Synchronize(String),
  #[error("张量不存在: {0}")]
  UnknownTensor(String),
  #[error("形状无效: {0}")]
  InvalidShape(String),
  #[error("当前运行时不支持该操作: {0}")]
  Unsupported(&'static str),
  #[error("运行时参数 {key} 的值 {value} 无效")]
  InvalidOption { key: String, value: String },
}

/// 张量元素类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
  Float32,
  Float16,
  Int32,
  Int64,
  Int8,
  UInt8,
  Bool,
}

impl DataType {
  /// 每个元素占用的字节数
  pub fn size(self) -> usize {
    match self {
      DataType::Float32 | DataType::Int32 => 4,
      DataType::Float16 => 2,
      DataType::Int64 => 8,
      DataType::Int8 | DataType::UInt8 | DataType::Bool => 1,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      DataType::Float32 => "f32",
      DataType::Float16 => "f16",
      DataType::Int32 => "i32",
      DataType::Int64 => "i64",
      DataType::Int8 => "i8",
      DataType::UInt8 => "u8",
      DataType::Bool => "bool",
    }
  }
}

impl fmt::Display for DataType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for DataType {
  type Err = RuntimeError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "f32" | "float32" => Ok(DataType::Float32),
      "f16" | "float16" => Ok(DataType::Float16),
      "i32" | "int32" => Ok(DataType::Int32),
      "i64" | "int64" => Ok(DataType::Int64),
      "i8" | "int8" => Ok(DataType::Int8),
      "u8" | "uint8" => Ok(DataType::UInt8),
      "bool" => Ok(DataType::Bool),
      other => Err(RuntimeError::Deserialize(format!("未知的元素类型: {}", other))),
    }
  }
}

/// 张量的 I/O 方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
  Input,
  Output,
}

/// 张量形状，`-1` 表示动态维度
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct Shape {
  dims: Vec<i64>,
}

impl Shape {
  pub fn new(dims: impl Into<Vec<i64>>) -> Self {
    Self { dims: dims.into() }
  }

  pub fn dims(&self) -> &[i64] {
    &self.dims
  }

  pub fn rank(&self) -> usize {
    self.dims.len()
  }

  pub fn dim(&self, axis: usize) -> Option<i64> {
    self.dims.get(axis).copied()
  }

  pub fn is_dynamic(&self) -> bool {
    self.dims.iter().any(|&d| d < 0)
  }

  /// 各维度之积；存在动态维度或溢出时返回 `None`
  pub fn element_count(&self) -> Option<usize> {
    self.dims.iter().try_fold(1usize, |acc, &d| {
      let d = usize::try_from(d).ok()?;
      acc.checked_mul(d)
    })
  }

  /// 秩相同，且每个维度都落在 `[0, max]` 内
  pub fn fits_within(&self, max: &Shape) -> bool {
    self.rank() == max.rank()
      && self
        .dims
        .iter()
        .zip(max.dims.iter())
        .all(|(&d, &m)| d >= 0 && d <= m)
  }
}

impl From<Vec<i64>> for Shape {
  fn from(dims: Vec<i64>) -> Self {
    Self { dims }
  }
}

impl<const N: usize> From<[i64; N]> for Shape {
  fn from(dims: [i64; N]) -> Self {
    Self {
      dims: dims.to_vec(),
    }
  }
}

/// 解析 `1x3x640x640` 形式的形状，允许外层括号，`-1` 表示动态维度
impl FromStr for Shape {
  type Err = RuntimeError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let invalid = || RuntimeError::InvalidShape(s.to_string());
    let body = s.trim().trim_start_matches('(').trim_end_matches(')');
    if body.is_empty() {
      return Err(invalid());
    }
    let dims = body
      .split(['x', 'X', ','])
      .map(|d| d.trim().parse::<i64>().map_err(|_| invalid()))
      .collect::<Result<Vec<i64>, RuntimeError>>()?;
    if dims.iter().any(|&d| d < -1) {
      return Err(invalid());
    }
    Ok(Shape::new(dims))
  }
}

impl fmt::Display for Shape {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let dims: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
    write!(f, "({})", dims.join("x"))
  }
}

/// 设备内存地址
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
  pub const NULL: DevicePtr = DevicePtr(0);

  pub fn is_null(self) -> bool {
    self.0 == 0
  }
}

impl fmt::Display for DevicePtr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:#x}", self.0)
  }
}

/// 执行上下文提供的张量绑定能力
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingApi {
  /// 按槽位序号设置形状，执行时传入完整的地址表
  ByIndex,
  /// 按张量名设置形状与地址，执行时只传入执行流
  ByName,
}

/// 可用的运行时种类，由模型 URL 的 `runtime=` 参数选择
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
  /// ONNX Runtime，需要启用 `onnx` 特性
  Onnx,
  /// 回放录制好的输出，不执行网络
  Replay,
}

impl RuntimeKind {
  pub fn is_available(self) -> bool {
    match self {
      RuntimeKind::Onnx => cfg!(feature = "onnx"),
      RuntimeKind::Replay => true,
    }
  }
}

impl Default for RuntimeKind {
  fn default() -> Self {
    if RuntimeKind::Onnx.is_available() {
      RuntimeKind::Onnx
    } else {
      RuntimeKind::Replay
    }
  }
}

impl FromStr for RuntimeKind {
  type Err = RuntimeError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "onnx" | "ort" => Ok(RuntimeKind::Onnx),
      "replay" => Ok(RuntimeKind::Replay),
      other => Err(RuntimeError::InvalidOption {
        key: RUNTIME_QUERY_KEY.to_string(),
        value: other.to_string(),
      }),
    }
  }
}

impl fmt::Display for RuntimeKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RuntimeKind::Onnx => f.write_str("onnx"),
      RuntimeKind::Replay => f.write_str("replay"),
    }
  }
}

impl FromUrl for RuntimeKind {
  type Error = RuntimeError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let kind = match url.query_pairs().find(|(k, _)| k == RUNTIME_QUERY_KEY) {
      Some((_, value)) => value.parse()?,
      None => RuntimeKind::default(),
    };
    if !kind.is_available() {
      return Err(RuntimeError::Unsupported("onnx 运行时未编译，请启用 onnx 特性"));
    }
    Ok(kind)
  }
}

pub trait Runtime {
  type Engine: Engine<Context = Self::Context>;
  type Context: ExecutionContext<Stream = Self::Stream>;
  type Stream: Stream;

  fn name(&self) -> &'static str;
  fn deserialize_engine(&self, blob: &[u8]) -> Result<Self::Engine, RuntimeError>;
  fn create_stream(&self) -> Result<Self::Stream, RuntimeError>;
}

/// 已反序列化的执行计划
pub trait Engine {
  type Context;

  fn num_io_tensors(&self) -> usize;
  fn tensor_name(&self, index: usize) -> Result<&str, RuntimeError>;
  fn tensor_data_type(&self, index: usize) -> Result<DataType, RuntimeError>;
  fn tensor_io_mode(&self, index: usize) -> Result<IoMode, RuntimeError>;
  /// 输入张量在优化配置中允许的最大形状
  fn profile_max_shape(&self, index: usize) -> Result<Shape, RuntimeError>;
  fn create_execution_context(&self) -> Result<Self::Context, RuntimeError>;
}

/// 执行上下文。超出 [`ExecutionContext::binding_api`] 所报告能力的操作返回
/// [`RuntimeError::Unsupported`]。
pub trait ExecutionContext {
  type Stream: Stream;

  fn binding_api(&self) -> BindingApi;

  /// 当前生效的张量形状（输入形状提交后，输出形状随之确定）
  fn tensor_shape(&self, index: usize) -> Result<Shape, RuntimeError>;

  fn set_binding_shape(&mut self, _index: usize, _shape: &Shape) -> Result<(), RuntimeError> {
    Err(RuntimeError::Unsupported("set_binding_shape"))
  }

  fn enqueue_bindings(
    &mut self,
    _bindings: &[DevicePtr],
    _stream: &Self::Stream,
  ) -> Result<(), RuntimeError> {
    Err(RuntimeError::Unsupported("enqueue_bindings"))
  }

  fn set_input_shape(&mut self, _name: &str, _shape: &Shape) -> Result<(), RuntimeError> {
    Err(RuntimeError::Unsupported("set_input_shape"))
  }

  fn set_tensor_address(&mut self, _name: &str, _address: DevicePtr) -> Result<(), RuntimeError> {
    Err(RuntimeError::Unsupported("set_tensor_address"))
  }

  fn enqueue(&mut self, _stream: &Self::Stream) -> Result<(), RuntimeError> {
    Err(RuntimeError::Unsupported("enqueue"))
  }
}

/// 执行流：其上的操作按提交顺序异步完成，`synchronize` 阻塞到全部完成
pub trait Stream {
  type DeviceMemory: DeviceMemory;
  type HostMemory: HostMemory;

  fn alloc_device_async(&self, bytes: usize) -> Result<Self::DeviceMemory, RuntimeError>;
  fn alloc_host_pinned(&self, bytes: usize) -> Result<Self::HostMemory, RuntimeError>;
  fn copy_to_device_async(&self, dst: &Self::DeviceMemory, src: &[u8]) -> Result<(), RuntimeError>;
  fn copy_to_host_async(
    &self,
    dst: &Self::HostMemory,
    src: &Self::DeviceMemory,
  ) -> Result<(), RuntimeError>;
  fn synchronize(&self) -> Result<(), RuntimeError>;
}

/// 设备内存句柄，析构时释放
pub trait DeviceMemory {
  fn address(&self) -> DevicePtr;
  fn len(&self) -> usize;

  fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// 锁页主机内存句柄，析构时释放
pub trait HostMemory {
  fn len(&self) -> usize;

  fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// 读取当前内容。调用者须先同步执行流，才能看到设备端拷回的数据。
  fn read<T>(&self, f: impl FnOnce(&[u8]) -> T) -> Result<T, RuntimeError>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn element_count_is_product_of_static_dims() {
    assert_eq!(Shape::from([1, 3, 640, 640]).element_count(), Some(1228800));
    assert_eq!(Shape::from([1, 84, 8400]).element_count(), Some(705600));
    assert_eq!(Shape::from([1, 3, -1, -1]).element_count(), None);
    assert_eq!(Shape::new(Vec::new()).element_count(), Some(1));
  }

  #[test]
  fn shape_fits_within_profile_max() {
    let max = Shape::from([1, 3, 640, 640]);
    assert!(Shape::from([1, 3, 320, 640]).fits_within(&max));
    assert!(!Shape::from([1, 3, 800, 640]).fits_within(&max));
    assert!(!Shape::from([3, 640, 640]).fits_within(&max));
    assert!(!Shape::from([1, 3, -1, 640]).fits_within(&max));
  }

  #[test]
  fn data_type_parses_aliases() {
    assert_eq!("float32".parse::<DataType>().unwrap(), DataType::Float32);
    assert_eq!("f16".parse::<DataType>().unwrap().size(), 2);
    assert!("complex64".parse::<DataType>().is_err());
  }

  #[test]
  fn shape_parses_from_text() {
    assert_eq!("1x3x640x640".parse::<Shape>().unwrap(), Shape::from([1, 3, 640, 640]));
    assert_eq!("(1x3x-1x-1)".parse::<Shape>().unwrap(), Shape::from([1, 3, -1, -1]));
    assert_eq!(
      Shape::from([1, 84, 8400]).to_string().parse::<Shape>().unwrap(),
      Shape::from([1, 84, 8400])
    );
    assert!("".parse::<Shape>().is_err());
    assert!("1x3xwide".parse::<Shape>().is_err());
    assert!("1x-2".parse::<Shape>().is_err());
  }

  #[test]
  fn runtime_is_selected_from_model_url() {
    let url = Url::parse("yolov8:///m.plan?runtime=replay").unwrap();
    assert_eq!(RuntimeKind::from_url(&url).unwrap(), RuntimeKind::Replay);

    let url = Url::parse("yolov8:///m.onnx?runtime=tflite").unwrap();
    assert!(matches!(
      RuntimeKind::from_url(&url),
      Err(RuntimeError::InvalidOption { .. })
    ));

    let url = Url::parse("yolov8:///m.onnx?runtime=onnx").unwrap();
    assert_eq!(
      RuntimeKind::from_url(&url).is_ok(),
      cfg!(feature = "onnx")
    );

    let url = Url::parse("yolov8:///m.onnx").unwrap();
    assert_eq!(RuntimeKind::from_url(&url).unwrap(), RuntimeKind::default());
    assert!(RuntimeKind::default().is_available());
  }
}
