// 该文件是 Qianli （千里眼） 项目的一部分。
// src/engine/buffer.rs - 设备与主机缓冲区
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

use tracing::debug;

use super::{
  EngineError,
  binding::{Binding, BindingCatalog},
};
use crate::runtime::{RuntimeError, Stream};

pub(crate) struct OutputBuffer<S: Stream> {
  pub device: S::DeviceMemory,
  pub host: S::HostMemory,
}

/// 按绑定目录分配的全部缓冲区。输入只有设备端存储，输出另有锁页主机缓冲区。
/// 句柄析构即释放，分配中途失败时已分配的部分随之释放。
pub(crate) struct BufferPool<S: Stream> {
  inputs: Box<[S::DeviceMemory]>,
  outputs: Box<[OutputBuffer<S>]>,
}

fn allocation_error(binding: &Binding) -> impl FnOnce(RuntimeError) -> EngineError + '_ {
  move |source| EngineError::Allocation {
    name: binding.name.clone(),
    source,
  }
}

impl<S: Stream> BufferPool<S> {
  pub fn allocate(stream: &S, catalog: &BindingCatalog) -> Result<Self, EngineError> {
    let mut inputs = Vec::with_capacity(catalog.inputs().len());
    for binding in catalog.inputs() {
      let device = stream
        .alloc_device_async(binding.byte_size())
        .map_err(allocation_error(binding))?;
      inputs.push(device);
    }

    let mut outputs = Vec::with_capacity(catalog.outputs().len());
    for binding in catalog.outputs() {
      let device = stream
        .alloc_device_async(binding.byte_size())
        .map_err(allocation_error(binding))?;
      let host = stream
        .alloc_host_pinned(binding.byte_size())
        .map_err(allocation_error(binding))?;
      outputs.push(OutputBuffer { device, host });
    }

    debug!(
      "缓冲区分配完成: {} 个输入, {} 个输出",
      inputs.len(),
      outputs.len()
    );
    Ok(Self {
      inputs: inputs.into_boxed_slice(),
      outputs: outputs.into_boxed_slice(),
    })
  }

  pub fn inputs(&self) -> &[S::DeviceMemory] {
    &self.inputs
  }

  pub fn outputs(&self) -> &[OutputBuffer<S>] {
    &self.outputs
  }

  pub fn input(&self, index: usize) -> Option<&S::DeviceMemory> {
    self.inputs.get(index)
  }

  pub fn output(&self, index: usize) -> Option<&OutputBuffer<S>> {
    self.outputs.get(index)
  }
}
