pub use crate::autograd::{Affine, DeltaSet, EvalResult, Graph, Layer, Parameter, Sequential, StateSet};
pub use crate::core::{
    config::{Config, ExecutionMode, RefcountPolicy},
    device::{get_default_device, set_default_device, Device},
    error::{Error, Result},
};
pub use crate::distributor::{DeviceContext, WorkDistributor};
pub use crate::memory::{DeviceMemoryPool, DevicePtr, HostAllocator, MemoryKind};
pub use crate::tensor::{Tensor, TensorList};
