mod distributor;
mod partition;
mod worker;

pub use distributor::{DeviceContext, WorkDistributor};
pub use partition::partition;
