pub mod delta;
pub mod graph;
pub mod layer;
pub mod operation;
pub mod parameter;
pub mod state;

pub use delta::{Delta, DeltaSet};
pub use graph::{EvalResult, Graph, NodeId};
pub use layer::{Affine, Layer, Sequential};
pub use operation::{Backward, Operation};
pub use parameter::{ParamId, Parameter};
pub use state::{State, StateSet};
