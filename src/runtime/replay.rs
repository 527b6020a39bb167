// 该文件是 Qianli （千里眼） 项目的一部分。
// src/runtime/replay.rs - 回放运行时
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

//! 回放运行时：在主机内存上模拟加速器的执行流语义，
//! 每次执行把计划中录制好的输出写入输出张量。
//!
//! 计划文件布局（小端序）：
//!
//! ```text
//! magic "QLRP" | version u16 | reserved u16 | header_len u64 | header (JSON) | payload
//! ```
//!
//! payload 按头部顺序依次存放每个输出张量的原始数据。

use std::{
  collections::{HashMap, VecDeque},
  sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicUsize, Ordering},
  },
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
  BindingApi, DataType, DeviceMemory, DevicePtr, Engine, ExecutionContext, HostMemory, IoMode,
  Runtime, RuntimeError, Shape, Stream,
};

const REPLAY_MAGIC: &[u8; 4] = b"QLRP";
const REPLAY_VERSION: u16 = 1;
const REPLAY_PREAMBLE_LEN: usize = 16;
const REPLAY_ADDRESS_BASE: u64 = 0x7f00_0000_0000;
const REPLAY_ADDRESS_STEP: u64 = 0x100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum BindingKind {
  Index,
  Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ModeKind {
  Input,
  Output,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TensorEntry {
  name: String,
  dtype: String,
  mode: ModeKind,
  shape: Vec<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  max_shape: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlanHeader {
  binding: BindingKind,
  tensors: Vec<TensorEntry>,
}

#[derive(Debug)]
struct ReplayTensor {
  name: String,
  data_type: DataType,
  mode: IoMode,
  shape: Shape,
  max_shape: Shape,
  payload: Option<Arc<[u8]>>,
}

#[derive(Debug)]
struct ReplayProgram {
  binding: BindingApi,
  tensors: Vec<ReplayTensor>,
}

fn deserialize_error(msg: impl Into<String>) -> RuntimeError {
  RuntimeError::Deserialize(msg.into())
}

impl ReplayProgram {
  fn parse(blob: &[u8]) -> Result<Self, RuntimeError> {
    if blob.len() < REPLAY_PREAMBLE_LEN {
      return Err(deserialize_error(format!(
        "数据长度 {} 小于文件头长度 {}",
        blob.len(),
        REPLAY_PREAMBLE_LEN
      )));
    }

    let (preamble, rest) = blob.split_at(REPLAY_PREAMBLE_LEN);
    if &preamble[..4] != REPLAY_MAGIC {
      return Err(deserialize_error("魔数不匹配，不是回放计划文件"));
    }

    let version = u16::from_le_bytes([preamble[4], preamble[5]]);
    if version != REPLAY_VERSION {
      return Err(deserialize_error(format!(
        "不支持的计划版本 {}, 期望 {}",
        version, REPLAY_VERSION
      )));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&preamble[8..16]);
    let header_len = usize::try_from(u64::from_le_bytes(len_bytes))
      .map_err(|_| deserialize_error("头部长度超出地址空间"))?;
    if header_len > rest.len() {
      return Err(deserialize_error(format!(
        "头部被截断: 声明 {} 字节, 剩余 {} 字节",
        header_len,
        rest.len()
      )));
    }

    let (header_bytes, mut payload) = rest.split_at(header_len);
    let header: PlanHeader = serde_json::from_slice(header_bytes)
      .map_err(|e| deserialize_error(format!("头部 JSON 无效: {}", e)))?;

    let mut tensors: Vec<ReplayTensor> = Vec::with_capacity(header.tensors.len());
    for entry in header.tensors {
      if tensors.iter().any(|t| t.name == entry.name) {
        return Err(deserialize_error(format!("张量名重复: {}", entry.name)));
      }

      let data_type: DataType = entry.dtype.parse()?;
      let shape = Shape::new(entry.shape);

      let tensor = match entry.mode {
        ModeKind::Input => {
          let max_shape = entry.max_shape.map(Shape::new).unwrap_or_else(|| shape.clone());
          if max_shape.is_dynamic() {
            return Err(deserialize_error(format!(
              "输入张量 {} 缺少静态的最大形状",
              entry.name
            )));
          }
          let consistent = max_shape.rank() == shape.rank()
            && shape
              .dims()
              .iter()
              .zip(max_shape.dims())
              .all(|(&d, &m)| d < 0 || d == m);
          if !consistent {
            return Err(deserialize_error(format!(
              "输入张量 {} 的形状 {} 与最大形状 {} 不一致",
              entry.name, shape, max_shape
            )));
          }
          ReplayTensor {
            name: entry.name,
            data_type,
            mode: IoMode::Input,
            shape,
            max_shape,
            payload: None,
          }
        }
        ModeKind::Output => {
          let bytes = shape
            .element_count()
            .and_then(|count| count.checked_mul(data_type.size()))
            .ok_or_else(|| {
              deserialize_error(format!("输出张量 {} 的形状 {} 必须是静态的", entry.name, shape))
            })?;
          if payload.len() < bytes {
            return Err(deserialize_error(format!(
              "输出张量 {} 的回放数据被截断: 需要 {} 字节, 剩余 {} 字节",
              entry.name,
              bytes,
              payload.len()
            )));
          }
          let (data, remain) = payload.split_at(bytes);
          payload = remain;
          ReplayTensor {
            name: entry.name,
            data_type,
            mode: IoMode::Output,
            max_shape: shape.clone(),
            shape,
            payload: Some(Arc::from(data)),
          }
        }
      };
      tensors.push(tensor);
    }

    if !payload.is_empty() {
      return Err(deserialize_error(format!(
        "回放数据末尾有 {} 个多余字节",
        payload.len()
      )));
    }

    let binding = match header.binding {
      BindingKind::Index => BindingApi::ByIndex,
      BindingKind::Name => BindingApi::ByName,
    };

    Ok(Self { binding, tensors })
  }

  fn tensor(&self, index: usize) -> Result<&ReplayTensor, RuntimeError> {
    self
      .tensors
      .get(index)
      .ok_or_else(|| RuntimeError::UnknownTensor(format!("#{}", index)))
  }

  fn position(&self, name: &str) -> Result<usize, RuntimeError> {
    self
      .tensors
      .iter()
      .position(|t| t.name == name)
      .ok_or_else(|| RuntimeError::UnknownTensor(name.to_string()))
  }
}

/// 回放运行时的内存与执行计数
#[derive(Debug, Default)]
pub struct ReplayStats {
  device_allocs: AtomicUsize,
  device_frees: AtomicUsize,
  host_allocs: AtomicUsize,
  host_frees: AtomicUsize,
  launches: AtomicUsize,
}

impl ReplayStats {
  pub fn device_allocations(&self) -> usize {
    self.device_allocs.load(Ordering::SeqCst)
  }

  pub fn device_frees(&self) -> usize {
    self.device_frees.load(Ordering::SeqCst)
  }

  pub fn host_allocations(&self) -> usize {
    self.host_allocs.load(Ordering::SeqCst)
  }

  pub fn host_frees(&self) -> usize {
    self.host_frees.load(Ordering::SeqCst)
  }

  /// 已完成的执行次数（在同步时计数）
  pub fn launches(&self) -> usize {
    self.launches.load(Ordering::SeqCst)
  }

  pub fn live_allocations(&self) -> usize {
    (self.device_allocations() + self.host_allocations())
      .saturating_sub(self.device_frees() + self.host_frees())
  }
}

#[derive(Debug, Clone, Default)]
pub struct ReplayRuntime {
  stats: Arc<ReplayStats>,
  device_memory_limit: Option<usize>,
}

impl ReplayRuntime {
  pub fn new() -> Self {
    Self::default()
  }

  /// 限制每个执行流可占用的设备内存
  pub fn with_device_memory_limit(mut self, bytes: usize) -> Self {
    self.device_memory_limit = Some(bytes);
    self
  }

  pub fn stats(&self) -> Arc<ReplayStats> {
    Arc::clone(&self.stats)
  }
}

impl Runtime for ReplayRuntime {
  type Engine = ReplayEngine;
  type Context = ReplayContext;
  type Stream = ReplayStream;

  fn name(&self) -> &'static str {
    "replay"
  }

  fn deserialize_engine(&self, blob: &[u8]) -> Result<Self::Engine, RuntimeError> {
    let program = ReplayProgram::parse(blob)?;
    debug!(
      "回放计划解析完成: {} 个张量, 绑定方式 {:?}",
      program.tensors.len(),
      program.binding
    );
    Ok(ReplayEngine {
      program: Arc::new(program),
    })
  }

  fn create_stream(&self) -> Result<Self::Stream, RuntimeError> {
    Ok(ReplayStream {
      state: Arc::new(Mutex::new(StreamState::default())),
      stats: Arc::clone(&self.stats),
      device_memory_limit: self.device_memory_limit,
    })
  }
}

#[derive(Debug)]
pub struct ReplayEngine {
  program: Arc<ReplayProgram>,
}

impl Engine for ReplayEngine {
  type Context = ReplayContext;

  fn num_io_tensors(&self) -> usize {
    self.program.tensors.len()
  }

  fn tensor_name(&self, index: usize) -> Result<&str, RuntimeError> {
    Ok(self.program.tensor(index)?.name.as_str())
  }

  fn tensor_data_type(&self, index: usize) -> Result<DataType, RuntimeError> {
    Ok(self.program.tensor(index)?.data_type)
  }

  fn tensor_io_mode(&self, index: usize) -> Result<IoMode, RuntimeError> {
    Ok(self.program.tensor(index)?.mode)
  }

  fn profile_max_shape(&self, index: usize) -> Result<Shape, RuntimeError> {
    let tensor = self.program.tensor(index)?;
    match tensor.mode {
      IoMode::Input => Ok(tensor.max_shape.clone()),
      IoMode::Output => Err(RuntimeError::InvalidShape(format!(
        "输出张量 {} 没有优化配置",
        tensor.name
      ))),
    }
  }

  fn create_execution_context(&self) -> Result<Self::Context, RuntimeError> {
    let shapes = self.program.tensors.iter().map(|t| t.shape.clone()).collect();
    Ok(ReplayContext {
      program: Arc::clone(&self.program),
      shapes,
      addresses: vec![DevicePtr::NULL; self.program.tensors.len()],
    })
  }
}

#[derive(Debug)]
pub struct ReplayContext {
  program: Arc<ReplayProgram>,
  shapes: Vec<Shape>,
  addresses: Vec<DevicePtr>,
}

impl ReplayContext {
  fn require(&self, api: BindingApi, op: &'static str) -> Result<(), RuntimeError> {
    if self.program.binding == api {
      Ok(())
    } else {
      Err(RuntimeError::Unsupported(op))
    }
  }

  fn commit_shape(&mut self, index: usize, shape: &Shape) -> Result<(), RuntimeError> {
    let tensor = self.program.tensor(index)?;
    if tensor.mode != IoMode::Input {
      return Err(RuntimeError::InvalidShape(format!(
        "张量 {} 不是输入张量",
        tensor.name
      )));
    }
    if !shape.fits_within(&tensor.max_shape) {
      return Err(RuntimeError::InvalidShape(format!(
        "张量 {} 的形状 {} 超出最大形状 {}",
        tensor.name, shape, tensor.max_shape
      )));
    }
    self.shapes[index] = shape.clone();
    Ok(())
  }

  fn launch(&self, addresses: &[DevicePtr], stream: &ReplayStream) -> Result<(), RuntimeError> {
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();

    for ((tensor, shape), address) in self.program.tensors.iter().zip(&self.shapes).zip(addresses) {
      if address.is_null() {
        return Err(RuntimeError::Execution(format!(
          "张量 {} 未绑定设备地址",
          tensor.name
        )));
      }
      match (&tensor.mode, &tensor.payload) {
        (IoMode::Input, _) => {
          let count = shape.element_count().ok_or_else(|| {
            RuntimeError::Execution(format!("输入张量 {} 的形状尚未确定", tensor.name))
          })?;
          inputs.push(LaunchInput {
            name: tensor.name.clone(),
            address: address.0,
            bytes: count * tensor.data_type.size(),
          });
        }
        (IoMode::Output, Some(payload)) => outputs.push(LaunchOutput {
          name: tensor.name.clone(),
          address: address.0,
          payload: Arc::clone(payload),
        }),
        (IoMode::Output, None) => {
          return Err(RuntimeError::Execution(format!(
            "输出张量 {} 没有回放数据",
            tensor.name
          )));
        }
      }
    }

    stream.submit(Command::Launch(Launch { inputs, outputs }))
  }
}

impl ExecutionContext for ReplayContext {
  type Stream = ReplayStream;

  fn binding_api(&self) -> BindingApi {
    self.program.binding
  }

  fn tensor_shape(&self, index: usize) -> Result<Shape, RuntimeError> {
    self
      .shapes
      .get(index)
      .cloned()
      .ok_or_else(|| RuntimeError::UnknownTensor(format!("#{}", index)))
  }

  fn set_binding_shape(&mut self, index: usize, shape: &Shape) -> Result<(), RuntimeError> {
    self.require(BindingApi::ByIndex, "set_binding_shape")?;
    self.commit_shape(index, shape)
  }

  fn enqueue_bindings(
    &mut self,
    bindings: &[DevicePtr],
    stream: &Self::Stream,
  ) -> Result<(), RuntimeError> {
    self.require(BindingApi::ByIndex, "enqueue_bindings")?;
    if bindings.len() != self.program.tensors.len() {
      return Err(RuntimeError::Execution(format!(
        "地址表长度 {} 与张量数量 {} 不一致",
        bindings.len(),
        self.program.tensors.len()
      )));
    }
    self.launch(bindings, stream)
  }

  fn set_input_shape(&mut self, name: &str, shape: &Shape) -> Result<(), RuntimeError> {
    self.require(BindingApi::ByName, "set_input_shape")?;
    let index = self.program.position(name)?;
    self.commit_shape(index, shape)
  }

  fn set_tensor_address(&mut self, name: &str, address: DevicePtr) -> Result<(), RuntimeError> {
    self.require(BindingApi::ByName, "set_tensor_address")?;
    let index = self.program.position(name)?;
    self.addresses[index] = address;
    Ok(())
  }

  fn enqueue(&mut self, stream: &Self::Stream) -> Result<(), RuntimeError> {
    self.require(BindingApi::ByName, "enqueue")?;
    self.launch(&self.addresses, stream)
  }
}

#[derive(Debug)]
struct LaunchInput {
  name: String,
  address: u64,
  bytes: usize,
}

#[derive(Debug)]
struct LaunchOutput {
  name: String,
  address: u64,
  payload: Arc<[u8]>,
}

#[derive(Debug)]
struct Launch {
  inputs: Vec<LaunchInput>,
  outputs: Vec<LaunchOutput>,
}

#[derive(Debug)]
enum Command {
  Alloc { address: u64, bytes: usize },
  CopyToDevice { dst: u64, data: Vec<u8> },
  CopyToHost { dst: u64, src: u64 },
  Launch(Launch),
}

#[derive(Debug, Default)]
struct StreamState {
  device: HashMap<u64, Vec<u8>>,
  host: HashMap<u64, Vec<u8>>,
  queue: VecDeque<Command>,
  handles: u64,
  reserved: usize,
}

type SharedState = Arc<Mutex<StreamState>>;

fn lock(state: &Mutex<StreamState>) -> Result<MutexGuard<'_, StreamState>, RuntimeError> {
  state
    .lock()
    .map_err(|_| RuntimeError::Synchronize("执行流状态已损坏".to_string()))
}

impl StreamState {
  fn next_address(&mut self) -> u64 {
    self.handles += 1;
    REPLAY_ADDRESS_BASE + self.handles * REPLAY_ADDRESS_STEP
  }

  fn run(&mut self, command: Command) -> Result<(), RuntimeError> {
    match command {
      Command::Alloc { address, bytes } => {
        self.device.insert(address, vec![0u8; bytes]);
      }
      Command::CopyToDevice { dst, data } => {
        let buf = self
          .device
          .get_mut(&dst)
          .ok_or_else(|| RuntimeError::Copy(format!("设备地址 {:#x} 无效", dst)))?;
        if data.len() > buf.len() {
          return Err(RuntimeError::Copy(format!(
            "拷贝 {} 字节超出设备缓冲区 {} 字节",
            data.len(),
            buf.len()
          )));
        }
        buf[..data.len()].copy_from_slice(&data);
      }
      Command::CopyToHost { dst, src } => {
        let src_buf = self
          .device
          .get(&src)
          .ok_or_else(|| RuntimeError::Copy(format!("设备地址 {:#x} 无效", src)))?;
        let dst_buf = self
          .host
          .get_mut(&dst)
          .ok_or_else(|| RuntimeError::Copy(format!("主机缓冲区 {:#x} 已释放", dst)))?;
        let n = dst_buf.len();
        if src_buf.len() < n {
          return Err(RuntimeError::Copy(format!(
            "设备缓冲区 {} 字节小于主机缓冲区 {} 字节",
            src_buf.len(),
            n
          )));
        }
        dst_buf.copy_from_slice(&src_buf[..n]);
      }
      Command::Launch(launch) => {
        for input in &launch.inputs {
          let buf = self.device.get(&input.address).ok_or_else(|| {
            RuntimeError::Execution(format!(
              "输入张量 {} 绑定的设备地址 {:#x} 无效",
              input.name, input.address
            ))
          })?;
          if buf.len() < input.bytes {
            return Err(RuntimeError::Execution(format!(
              "输入张量 {} 需要 {} 字节, 缓冲区只有 {} 字节",
              input.name,
              input.bytes,
              buf.len()
            )));
          }
        }
        for output in &launch.outputs {
          let buf = self.device.get_mut(&output.address).ok_or_else(|| {
            RuntimeError::Execution(format!(
              "输出张量 {} 绑定的设备地址 {:#x} 无效",
              output.name, output.address
            ))
          })?;
          let n = output.payload.len();
          if buf.len() < n {
            return Err(RuntimeError::Execution(format!(
              "输出张量 {} 需要 {} 字节, 缓冲区只有 {} 字节",
              output.name,
              n,
              buf.len()
            )));
          }
          buf[..n].copy_from_slice(&output.payload);
        }
      }
    }
    Ok(())
  }
}

/// 回放执行流。提交的操作排队，直到 `synchronize` 时按顺序执行。
#[derive(Debug)]
pub struct ReplayStream {
  state: SharedState,
  stats: Arc<ReplayStats>,
  device_memory_limit: Option<usize>,
}

impl ReplayStream {
  fn submit(&self, command: Command) -> Result<(), RuntimeError> {
    lock(&self.state)?.queue.push_back(command);
    Ok(())
  }

  /// 尚未执行的操作数
  pub fn pending(&self) -> usize {
    lock(&self.state).map(|state| state.queue.len()).unwrap_or(0)
  }
}

impl Stream for ReplayStream {
  type DeviceMemory = ReplayDeviceMemory;
  type HostMemory = ReplayHostMemory;

  fn alloc_device_async(&self, bytes: usize) -> Result<Self::DeviceMemory, RuntimeError> {
    let mut state = lock(&self.state)?;
    if let Some(limit) = self.device_memory_limit
      && state.reserved.saturating_add(bytes) > limit
    {
      return Err(RuntimeError::Allocation {
        bytes,
        reason: format!("设备内存不足, 已占用 {} / {} 字节", state.reserved, limit),
      });
    }

    let address = state.next_address();
    state.reserved += bytes;
    state.queue.push_back(Command::Alloc { address, bytes });
    self.stats.device_allocs.fetch_add(1, Ordering::SeqCst);

    Ok(ReplayDeviceMemory {
      address,
      len: bytes,
      state: Arc::clone(&self.state),
      stats: Arc::clone(&self.stats),
    })
  }

  fn alloc_host_pinned(&self, bytes: usize) -> Result<Self::HostMemory, RuntimeError> {
    let mut state = lock(&self.state)?;
    let id = state.next_address();
    state.host.insert(id, vec![0u8; bytes]);
    self.stats.host_allocs.fetch_add(1, Ordering::SeqCst);

    Ok(ReplayHostMemory {
      id,
      len: bytes,
      state: Arc::clone(&self.state),
      stats: Arc::clone(&self.stats),
    })
  }

  fn copy_to_device_async(&self, dst: &Self::DeviceMemory, src: &[u8]) -> Result<(), RuntimeError> {
    if src.len() > dst.len() {
      return Err(RuntimeError::Copy(format!(
        "拷贝 {} 字节超出设备缓冲区 {} 字节",
        src.len(),
        dst.len()
      )));
    }
    self.submit(Command::CopyToDevice {
      dst: dst.address,
      data: src.to_vec(),
    })
  }

  fn copy_to_host_async(
    &self,
    dst: &Self::HostMemory,
    src: &Self::DeviceMemory,
  ) -> Result<(), RuntimeError> {
    if src.len() < dst.len() {
      return Err(RuntimeError::Copy(format!(
        "设备缓冲区 {} 字节小于主机缓冲区 {} 字节",
        src.len(),
        dst.len()
      )));
    }
    self.submit(Command::CopyToHost {
      dst: dst.id,
      src: src.address,
    })
  }

  fn synchronize(&self) -> Result<(), RuntimeError> {
    let mut state = lock(&self.state)?;
    while let Some(command) = state.queue.pop_front() {
      let is_launch = matches!(command, Command::Launch(_));
      if let Err(e) = state.run(command) {
        let dropped = state.queue.len();
        state.queue.clear();
        if dropped > 0 {
          warn!("执行流出错, 丢弃其后 {} 个操作", dropped);
        }
        return Err(e);
      }
      if is_launch {
        self.stats.launches.fetch_add(1, Ordering::SeqCst);
      }
    }
    Ok(())
  }
}

impl Drop for ReplayStream {
  fn drop(&mut self) {
    if let Err(e) = self.synchronize() {
      warn!("销毁执行流时未完成的操作失败: {}", e);
    }
  }
}

#[derive(Debug)]
pub struct ReplayDeviceMemory {
  address: u64,
  len: usize,
  state: SharedState,
  stats: Arc<ReplayStats>,
}

impl DeviceMemory for ReplayDeviceMemory {
  fn address(&self) -> DevicePtr {
    DevicePtr(self.address)
  }

  fn len(&self) -> usize {
    self.len
  }
}

impl Drop for ReplayDeviceMemory {
  fn drop(&mut self) {
    if let Ok(mut state) = self.state.lock() {
      let address = self.address;
      state
        .queue
        .retain(|c| !matches!(c, Command::Alloc { address: a, .. } if *a == address));
      state.device.remove(&address);
      state.reserved = state.reserved.saturating_sub(self.len);
    }
    self.stats.device_frees.fetch_add(1, Ordering::SeqCst);
  }
}

#[derive(Debug)]
pub struct ReplayHostMemory {
  id: u64,
  len: usize,
  state: SharedState,
  stats: Arc<ReplayStats>,
}

impl HostMemory for ReplayHostMemory {
  fn len(&self) -> usize {
    self.len
  }

  fn read<T>(&self, f: impl FnOnce(&[u8]) -> T) -> Result<T, RuntimeError> {
    let state = lock(&self.state)?;
    let bytes = state
      .host
      .get(&self.id)
      .ok_or_else(|| RuntimeError::Copy(format!("主机缓冲区 {:#x} 已释放", self.id)))?;
    Ok(f(bytes))
  }
}

impl Drop for ReplayHostMemory {
  fn drop(&mut self) {
    if let Ok(mut state) = self.state.lock() {
      state.host.remove(&self.id);
    }
    self.stats.host_frees.fetch_add(1, Ordering::SeqCst);
  }
}

/// 生成回放计划文件
#[derive(Debug, Clone)]
pub struct ReplayPlanBuilder {
  binding: BindingKind,
  tensors: Vec<TensorEntry>,
  payload: Vec<u8>,
}

impl ReplayPlanBuilder {
  pub fn new(api: BindingApi) -> Self {
    let binding = match api {
      BindingApi::ByIndex => BindingKind::Index,
      BindingApi::ByName => BindingKind::Name,
    };
    Self {
      binding,
      tensors: Vec::new(),
      payload: Vec::new(),
    }
  }

  pub fn input(
    mut self,
    name: &str,
    data_type: DataType,
    shape: impl Into<Shape>,
    max_shape: Option<Shape>,
  ) -> Self {
    self.tensors.push(TensorEntry {
      name: name.to_string(),
      dtype: data_type.as_str().to_string(),
      mode: ModeKind::Input,
      shape: shape.into().dims().to_vec(),
      max_shape: max_shape.map(|s| s.dims().to_vec()),
    });
    self
  }

  pub fn output(
    mut self,
    name: &str,
    data_type: DataType,
    shape: impl Into<Shape>,
    payload: &[u8],
  ) -> Self {
    self.tensors.push(TensorEntry {
      name: name.to_string(),
      dtype: data_type.as_str().to_string(),
      mode: ModeKind::Output,
      shape: shape.into().dims().to_vec(),
      max_shape: None,
    });
    self.payload.extend_from_slice(payload);
    self
  }

  pub fn output_f32(self, name: &str, shape: impl Into<Shape>, values: &[f32]) -> Self {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    self.output(name, DataType::Float32, shape, &bytes)
  }

  /// 序列化为计划文件，并校验其能被重新解析
  pub fn build(&self) -> Result<Vec<u8>, RuntimeError> {
    let header = PlanHeader {
      binding: self.binding,
      tensors: self.tensors.clone(),
    };
    let header = serde_json::to_vec(&header).map_err(|e| RuntimeError::Serialize(e.to_string()))?;

    let mut blob = Vec::with_capacity(REPLAY_PREAMBLE_LEN + header.len() + self.payload.len());
    blob.extend_from_slice(REPLAY_MAGIC);
    blob.extend_from_slice(&REPLAY_VERSION.to_le_bytes());
    blob.extend_from_slice(&0u16.to_le_bytes());
    blob.extend_from_slice(&(header.len() as u64).to_le_bytes());
    blob.extend_from_slice(&header);
    blob.extend_from_slice(&self.payload);

    ReplayProgram::parse(&blob)?;
    Ok(blob)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn simple_plan(api: BindingApi) -> Vec<u8> {
    ReplayPlanBuilder::new(api)
      .input(
        "images",
        DataType::Float32,
        [1, 3, -1, -1],
        Some(Shape::from([1, 3, 8, 8])),
      )
      .output_f32("output0", [1, 2, 3], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0])
      .build()
      .unwrap()
  }

  #[test]
  fn parses_what_the_builder_writes() {
    let engine = ReplayRuntime::new()
      .deserialize_engine(&simple_plan(BindingApi::ByName))
      .unwrap();
    assert_eq!(engine.num_io_tensors(), 2);
    assert_eq!(engine.tensor_name(0).unwrap(), "images");
    assert_eq!(engine.tensor_io_mode(1).unwrap(), IoMode::Output);
    assert_eq!(
      engine.profile_max_shape(0).unwrap(),
      Shape::from([1, 3, 8, 8])
    );
    assert!(engine.profile_max_shape(1).is_err());
  }

  #[test]
  fn rejects_corrupt_blobs() {
    let runtime = ReplayRuntime::new();
    let blob = simple_plan(BindingApi::ByIndex);

    assert!(runtime.deserialize_engine(&[]).is_err());
    assert!(runtime.deserialize_engine(&blob[..10]).is_err());

    let mut bad_magic = blob.clone();
    bad_magic[0] = b'X';
    assert!(runtime.deserialize_engine(&bad_magic).is_err());

    let mut trailing = blob.clone();
    trailing.push(0);
    assert!(runtime.deserialize_engine(&trailing).is_err());

    let truncated = &blob[..blob.len() - 4];
    assert!(matches!(
      runtime.deserialize_engine(truncated),
      Err(RuntimeError::Deserialize(_))
    ));
  }

  #[test]
  fn builder_rejects_payload_size_mismatch() {
    let result = ReplayPlanBuilder::new(BindingApi::ByName)
      .input("images", DataType::Float32, [1, 3, 4, 4], None)
      .output_f32("output0", [1, 2, 3], &[0.0; 5])
      .build();
    assert!(result.is_err());
  }

  #[test]
  fn stream_runs_commands_in_submission_order() {
    let runtime = ReplayRuntime::new();
    let stream = runtime.create_stream().unwrap();

    let device = stream.alloc_device_async(8).unwrap();
    let host = stream.alloc_host_pinned(8).unwrap();
    stream
      .copy_to_device_async(&device, &[1, 2, 3, 4, 5, 6, 7, 8])
      .unwrap();
    stream.copy_to_host_async(&host, &device).unwrap();
    assert_eq!(stream.pending(), 3);

    host
      .read(|bytes| assert_eq!(bytes, &[0u8; 8]))
      .unwrap();
    stream.synchronize().unwrap();
    assert_eq!(stream.pending(), 0);
    host
      .read(|bytes| assert_eq!(bytes, &[1, 2, 3, 4, 5, 6, 7, 8]))
      .unwrap();
  }

  #[test]
  fn capability_outside_reported_api_is_unsupported() {
    let engine = ReplayRuntime::new()
      .deserialize_engine(&simple_plan(BindingApi::ByIndex))
      .unwrap();
    let mut context = engine.create_execution_context().unwrap();
    assert_eq!(context.binding_api(), BindingApi::ByIndex);
    assert!(matches!(
      context.set_input_shape("images", &Shape::from([1, 3, 8, 8])),
      Err(RuntimeError::Unsupported(_))
    ));
    context
      .set_binding_shape(0, &Shape::from([1, 3, 4, 8]))
      .unwrap();
    assert_eq!(context.tensor_shape(0).unwrap(), Shape::from([1, 3, 4, 8]));
    assert!(
      context
        .set_binding_shape(0, &Shape::from([1, 3, 16, 8]))
        .is_err()
    );
  }

  #[test]
  fn launch_fails_at_synchronize_when_input_buffer_is_freed() {
    let runtime = ReplayRuntime::new();
    let engine = runtime
      .deserialize_engine(&simple_plan(BindingApi::ByName))
      .unwrap();
    let mut context = engine.create_execution_context().unwrap();
    let stream = runtime.create_stream().unwrap();

    let input = stream.alloc_device_async(3 * 8 * 8 * 4).unwrap();
    let output = stream.alloc_device_async(6 * 4).unwrap();
    context
      .set_input_shape("images", &Shape::from([1, 3, 8, 8]))
      .unwrap();
    context.set_tensor_address("images", input.address()).unwrap();
    context
      .set_tensor_address("output0", output.address())
      .unwrap();
    context.enqueue(&stream).unwrap();
    drop(input);

    assert!(matches!(
      stream.synchronize(),
      Err(RuntimeError::Execution(_))
    ));
    assert_eq!(stream.pending(), 0);
    assert_eq!(runtime.stats().launches(), 0);
  }

  #[test]
  fn allocation_beyond_limit_fails_and_frees_are_counted() {
    let runtime = ReplayRuntime::new().with_device_memory_limit(100);
    let stats = runtime.stats();
    let stream = runtime.create_stream().unwrap();

    let a = stream.alloc_device_async(60).unwrap();
    assert!(matches!(
      stream.alloc_device_async(60),
      Err(RuntimeError::Allocation { bytes: 60, .. })
    ));
    drop(a);
    let _b = stream.alloc_device_async(60).unwrap();

    assert_eq!(stats.device_allocations(), 2);
    assert_eq!(stats.device_frees(), 1);
    assert_eq!(stats.live_allocations(), 1);
  }
}
