use crate::{
    graph::{EvalResult, Graph},
    parameter::Parameter,
};
use axonic_core::error::{Error, Result};
use axonic_tensor::Tensor;

pub trait Layer: Send + Sync {
    /// Stable name used to key this layer's parameters.
    fn id(&self) -> &str;

    fn evaluate(&self, graph: &Graph, inputs: &[&EvalResult]) -> Result<EvalResult>;

    /// Learnable buffers, in a stable order.
    fn state(&self) -> Vec<Parameter>;

    fn freeze(&self) {
        self.state().iter().for_each(|p| p.freeze());
    }

    fn unfreeze(&self) {
        self.state().iter().for_each(|p| p.unfreeze());
    }
}

fn single_input<'a>(layer: &dyn Layer, inputs: &[&'a EvalResult]) -> Result<&'a EvalResult> {
    match inputs {
        [input] => Ok(*input),
        _ => Err(Error::InvalidArgument(format!(
            "{} takes one input, got {}",
            layer.id(),
            inputs.len()
        ))),
    }
}

/// Elementwise `y = w * x + b`; `w` and `b` broadcast over the batch.
pub struct Affine {
    id: String,
    weight: Parameter,
    bias: Parameter,
}

impl Affine {
    pub fn new(id: impl Into<String>, weight: Tensor, bias: Tensor) -> Result<Self> {
        if weight.shape() != bias.shape() {
            return Err(Error::DimensionMismatch {
                expected: weight.shape().to_vec(),
                got: bias.shape().to_vec(),
            });
        }
        let id = id.into();
        Ok(Self {
            weight: Parameter::new(format!("{}.weight", id), weight),
            bias: Parameter::new(format!("{}.bias", id), bias),
            id,
        })
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> &Parameter {
        &self.bias
    }
}

impl Layer for Affine {
    fn id(&self) -> &str {
        &self.id
    }

    fn evaluate(&self, graph: &Graph, inputs: &[&EvalResult]) -> Result<EvalResult> {
        let x = single_input(self, inputs)?;
        let w = graph.parameter(&self.weight)?;
        let b = graph.parameter(&self.bias)?;
        w.mul(x)?.add(&b)
    }

    fn state(&self) -> Vec<Parameter> {
        vec![self.weight.clone(), self.bias.clone()]
    }
}

/// Layers applied one after another.
pub struct Sequential {
    id: String,
    layers: Vec<Box<dyn Layer>>,
}

impl Sequential {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            layers: Vec::new(),
        }
    }

    pub fn push(mut self, layer: impl Layer + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Layer for Sequential {
    fn id(&self) -> &str {
        &self.id
    }

    fn evaluate(&self, graph: &Graph, inputs: &[&EvalResult]) -> Result<EvalResult> {
        let mut current = single_input(self, inputs)?.clone();
        for layer in &self.layers {
            current = layer.evaluate(graph, &[&current])?;
        }
        Ok(current)
    }

    fn state(&self) -> Vec<Parameter> {
        self.layers.iter().flat_map(|layer| layer.state()).collect()
    }
}
