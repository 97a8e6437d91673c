pub mod prelude;

pub use axonic_autograd as autograd;
pub use axonic_core as core;
pub use axonic_distributor as distributor;
pub use axonic_memory as memory;
pub use axonic_tensor as tensor;
