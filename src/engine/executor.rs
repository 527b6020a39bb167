// 该文件是 Qianli （千里眼） 项目的一部分。
// src/engine/executor.rs - 张量绑定策略
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

use super::binding::Binding;
use crate::runtime::{BindingApi, DevicePtr, ExecutionContext, RuntimeError, Shape};

/// 把形状与地址绑定到张量槽位，并提交执行。
/// 启动时根据执行上下文报告的能力选定一种实现。
pub(crate) trait TensorBinder<C: ExecutionContext> {
  fn api(&self) -> BindingApi;

  fn commit_input_shape(
    &mut self,
    context: &mut C,
    binding: &Binding,
    shape: &Shape,
  ) -> Result<(), RuntimeError>;

  fn bind_address(
    &mut self,
    context: &mut C,
    binding: &Binding,
    address: DevicePtr,
  ) -> Result<(), RuntimeError>;

  fn launch(&mut self, context: &mut C, stream: &C::Stream) -> Result<(), RuntimeError>;
}

/// 按序号绑定：维护完整的地址表，执行时整体传入
#[derive(Debug)]
pub(crate) struct IndexBinder {
  table: Vec<DevicePtr>,
}

impl IndexBinder {
  pub fn new(num_tensors: usize) -> Self {
    Self {
      table: vec![DevicePtr::NULL; num_tensors],
    }
  }
}

impl<C: ExecutionContext> TensorBinder<C> for IndexBinder {
  fn api(&self) -> BindingApi {
    BindingApi::ByIndex
  }

  fn commit_input_shape(
    &mut self,
    context: &mut C,
    binding: &Binding,
    shape: &Shape,
  ) -> Result<(), RuntimeError> {
    context.set_binding_shape(binding.index, shape)
  }

  fn bind_address(
    &mut self,
    _context: &mut C,
    binding: &Binding,
    address: DevicePtr,
  ) -> Result<(), RuntimeError> {
    let slot = self
      .table
      .get_mut(binding.index)
      .ok_or_else(|| RuntimeError::UnknownTensor(binding.name.clone()))?;
    *slot = address;
    Ok(())
  }

  fn launch(&mut self, context: &mut C, stream: &C::Stream) -> Result<(), RuntimeError> {
    context.enqueue_bindings(&self.table, stream)
  }
}

/// 按名称绑定：形状与地址直接写入执行上下文
#[derive(Debug, Default)]
pub(crate) struct NameBinder;

impl<C: ExecutionContext> TensorBinder<C> for NameBinder {
  fn api(&self) -> BindingApi {
    BindingApi::ByName
  }

  fn commit_input_shape(
    &mut self,
    context: &mut C,
    binding: &Binding,
    shape: &Shape,
  ) -> Result<(), RuntimeError> {
    context.set_input_shape(&binding.name, shape)
  }

  fn bind_address(
    &mut self,
    context: &mut C,
    binding: &Binding,
    address: DevicePtr,
  ) -> Result<(), RuntimeError> {
    context.set_tensor_address(&binding.name, address)
  }

  fn launch(&mut self, context: &mut C, stream: &C::Stream) -> Result<(), RuntimeError> {
    context.enqueue(stream)
  }
}

pub(crate) fn select_binder<C: ExecutionContext>(
  api: BindingApi,
  num_tensors: usize,
) -> Box<dyn TensorBinder<C>> {
  debug!("选择张量绑定方式: {:?}", api);
  match api {
    BindingApi::ByIndex => Box::new(IndexBinder::new(num_tensors)),
    BindingApi::ByName => Box::new(NameBinder),
  }
}
