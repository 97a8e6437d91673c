use crate::parameter::Parameter;
use axonic_core::error::{Error, Result};
use axonic_tensor::{Tensor, TensorList};
use std::{fmt, sync::Arc};

/// Jacobian-transpose rule of an externally defined layer.
pub trait Backward: Send + Sync {
    fn name(&self) -> &str;

    /// Gradient for each forward input, in order. `None` means the input
    /// receives no gradient from this node.
    fn backward(&self, inputs: &[&TensorList], output: &TensorList, grad: &TensorList) -> Result<Vec<Option<TensorList>>>;
}

/// How a graph node was produced, and therefore how its gradient flows upstream.
#[derive(Clone)]
pub enum Operation {
    Input { requires_grad: bool },
    Constant,
    Parameter { param: Parameter },
    Add,
    Sub,
    Mul,
    Scale(f64),
    /// Sum of each entry's elements into a scalar entry.
    Sum,
    Custom(Arc<dyn Backward>),
}

impl Operation {
    pub fn name(&self) -> &str {
        match self {
            Self::Input { .. } => "input",
            Self::Constant => "constant",
            Self::Parameter { .. } => "parameter",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Scale(_) => "scale",
            Self::Sum => "sum",
            Self::Custom(backward) => backward.name(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Input { .. } | Self::Constant | Self::Parameter { .. })
    }

    pub fn arity(&self) -> Option<usize> {
        match self {
            Self::Input { .. } | Self::Constant | Self::Parameter { .. } => Some(0),
            Self::Add | Self::Sub | Self::Mul => Some(2),
            Self::Scale(_) | Self::Sum => Some(1),
            Self::Custom(_) => None,
        }
    }

    pub(crate) fn forward(&self, inputs: &[&TensorList]) -> Result<TensorList> {
        match (self, inputs) {
            (Self::Add, [a, b]) => a.add(b),
            (Self::Sub, [a, b]) => a.sub(b),
            (Self::Mul, [a, b]) => a.mul(b),
            (Self::Scale(factor), [a]) => a.scale(*factor),
            (Self::Sum, [a]) => {
                let sums = a
                    .tensors()?
                    .iter()
                    .map(|t| Tensor::scalar(t.sum()?))
                    .collect::<Result<Vec<_>>>()?;
                TensorList::from_tensors(sums)
            },
            _ => Err(Error::Internal {
                message: format!("{} cannot be evaluated on {} inputs", self.name(), inputs.len()),
            }),
        }
    }

    /// Applies the local Jacobian transpose. Gradients come back at the
    /// output's batch length; the graph reduces broadcast operands.
    pub(crate) fn vjp(
        &self,
        inputs: &[&TensorList],
        output: &TensorList,
        grad: &TensorList,
    ) -> Result<Vec<Option<TensorList>>> {
        match (self, inputs) {
            (Self::Add, [_, _]) => Ok(vec![Some(grad.clone()), Some(grad.clone())]),
            (Self::Sub, [_, _]) => Ok(vec![Some(grad.clone()), Some(grad.scale(-1.0)?)]),
            (Self::Mul, [a, b]) => Ok(vec![Some(grad.mul(b)?), Some(grad.mul(a)?)]),
            (Self::Scale(factor), [_]) => Ok(vec![Some(grad.scale(*factor)?)]),
            (Self::Sum, [a]) => {
                let rows = grad
                    .to_vecs()?
                    .into_iter()
                    .map(|g| vec![g[0]; a.element_size()])
                    .collect();
                Ok(vec![Some(TensorList::from_vecs(a.element_shape(), rows)?)])
            },
            (Self::Custom(backward), _) => backward.backward(inputs, output, grad),
            _ => Err(Error::Internal {
                message: format!("{} has no gradient rule for {} inputs", self.name(), inputs.len()),
            }),
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input { requires_grad } => write!(f, "Input(requires_grad={})", requires_grad),
            Self::Parameter { param } => write!(f, "Parameter({})", param.name()),
            Self::Scale(factor) => write!(f, "Scale({})", factor),
            other => write!(f, "{}", other.name()),
        }
    }
}
