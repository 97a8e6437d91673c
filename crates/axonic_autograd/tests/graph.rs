mod utils;

use axonic_autograd::{Affine, Backward, DeltaSet, Graph, Layer, Parameter, Sequential};
use axonic_core::{
    config::{Config, ExecutionMode},
    error::{Error, Result},
};
use axonic_tensor::TensorList;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use utils::{assert_close, scalars, setup_config, tensor};

/// Identity layer that records how often its gradient rule runs.
#[derive(Default)]
struct Probe {
    calls: AtomicUsize,
    seen: Mutex<Vec<f64>>,
    drop_gradient: bool,
}

impl Backward for Probe {
    fn name(&self) -> &str {
        "probe"
    }

    fn backward(&self, _inputs: &[&TensorList], _output: &TensorList, grad: &TensorList) -> Result<Vec<Option<TensorList>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock()?.extend(grad.to_flat()?);
        if self.drop_gradient {
            Ok(vec![None])
        } else {
            Ok(vec![Some(grad.clone())])
        }
    }
}

fn linear_layer_end_to_end(mode: ExecutionMode) -> Result<()> {
    let graph = Graph::new(&setup_config(mode));
    let layer = Affine::new("fc", tensor(&[2.0])?, tensor(&[1.0])?)?;
    let x = graph.input(scalars(&[3.0])?, true)?;

    let y = layer.evaluate(&graph, &[&x])?;
    assert_eq!(y.value()?.to_flat()?, vec![7.0]);

    let deltas = y.backward(&scalars(&[1.0])?)?;
    assert_eq!(deltas.len(), 2);
    assert_eq!(deltas.get(layer.weight().id())?, Some(vec![3.0]));
    assert_eq!(deltas.get(layer.bias().id())?, Some(vec![1.0]));
    assert_eq!(x.input_gradient()?.map(|g| g.to_flat()).transpose()?, Some(vec![2.0]));
    Ok(())
}

fn fan_out_sums_before_propagating(mode: ExecutionMode) -> Result<()> {
    let graph = Graph::new(&setup_config(mode));
    let w = Parameter::new("w", tensor(&[0.5])?);
    let x = graph.input(scalars(&[4.0])?, true)?;
    let p = graph.parameter(&w)?;

    let y = x.add(&x)?.add(&p.add(&p)?)?;
    let deltas = y.backward(&scalars(&[1.5])?)?;

    assert_close(&x.input_gradient()?.map(|g| g.to_flat()).transpose()?.unwrap_or_default(), &[3.0]);
    assert_close(&deltas.get(w.id())?.unwrap_or_default(), &[3.0]);
    Ok(())
}

fn shared_node_fires_once(mode: ExecutionMode) -> Result<()> {
    let graph = Graph::new(&setup_config(mode));
    let probe = Arc::new(Probe::default());
    let x = graph.input(scalars(&[2.0])?, true)?;
    let c = graph.custom(probe.clone(), &[&x], x.value()?)?;

    // y = c + c * c, so dy/dc = 1 + 2c = 5.
    let y = c.add(&c.mul(&c)?)?;
    y.backward(&scalars(&[1.0])?)?;

    assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    assert_close(&probe.seen.lock()?, &[5.0]);
    assert_close(&x.input_gradient()?.map(|g| g.to_flat()).transpose()?.unwrap_or_default(), &[5.0]);
    Ok(())
}

fn missing_gradient_does_not_stall_siblings(mode: ExecutionMode) -> Result<()> {
    let graph = Graph::new(&setup_config(mode));
    let probe = Arc::new(Probe {
        drop_gradient: true,
        ..Probe::default()
    });
    let x = graph.input(scalars(&[1.0])?, true)?;
    let a = x.scale(2.0)?;
    let c = graph.custom(probe.clone(), &[&a], a.value()?)?;

    let y = c.add(&a)?;
    y.backward(&scalars(&[1.0])?)?;

    assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    assert_close(&x.input_gradient()?.map(|g| g.to_flat()).transpose()?.unwrap_or_default(), &[2.0]);
    Ok(())
}

fn frozen_branches_are_pruned(mode: ExecutionMode) -> Result<()> {
    let graph = Graph::new(&setup_config(mode));
    let layer = Affine::new("frozen", tensor(&[2.0])?, tensor(&[1.0])?)?;
    layer.freeze();
    let x = graph.input(scalars(&[3.0])?, false)?;

    let y = layer.evaluate(&graph, &[&x])?;
    assert!(!y.is_alive());
    assert!(y.backward(&scalars(&[1.0])?)?.is_empty());

    // Only the trainable half of a mixed layer gets a delta.
    layer.bias().unfreeze();
    let y = layer.evaluate(&graph, &[&x])?;
    assert!(y.is_alive());
    let deltas = y.backward(&scalars(&[1.0])?)?;
    assert!(!deltas.contains(layer.weight().id()));
    assert_eq!(deltas.get(layer.bias().id())?, Some(vec![1.0]));
    Ok(())
}

fn broadcast_parameters_reduce_over_batch(mode: ExecutionMode) -> Result<()> {
    let graph = Graph::new(&setup_config(mode));
    let w = Parameter::new("w", tensor(&[2.0])?);
    let x = graph.input(scalars(&[1.0, 2.0, 3.0])?, true)?;
    let y = graph.parameter(&w)?.mul(&x)?;
    assert_eq!(y.value()?.to_flat()?, vec![2.0, 4.0, 6.0]);

    // A single-entry gradient broadcasts over the batch.
    let deltas = y.backward(&scalars(&[1.0])?)?;
    assert_close(&deltas.get(w.id())?.unwrap_or_default(), &[6.0]);
    assert_close(
        &x.input_gradient()?.map(|g| g.to_flat()).transpose()?.unwrap_or_default(),
        &[2.0, 2.0, 2.0],
    );
    Ok(())
}

fn sum_and_sub_rules(mode: ExecutionMode) -> Result<()> {
    let graph = Graph::new(&setup_config(mode));
    let w = Parameter::new("w", tensor(&[1.0, 2.0, 3.0])?);
    let target = graph.constant(TensorList::single(tensor(&[0.0, 1.0, 1.0])?))?;

    // loss = sum(0.5 * (w - t) * (w - t)); d loss / dw = w - t.
    let diff = graph.parameter(&w)?.sub(&target)?;
    let loss = diff.mul(&diff)?.scale(0.5)?.sum()?;
    assert_close(&loss.value()?.to_flat()?, &[3.0]);

    let deltas = loss.backward(&TensorList::single(axonic_tensor::Tensor::scalar(1.0)?))?;
    assert_close(&deltas.get(w.id())?.unwrap_or_default(), &[1.0, 1.0, 2.0]);
    Ok(())
}

fn repeated_passes_accumulate(mode: ExecutionMode) -> Result<()> {
    let graph = Graph::new(&setup_config(mode));
    let net = Sequential::new("net")
        .push(Affine::new("a", tensor(&[2.0])?, tensor(&[0.0])?)?)
        .push(Affine::new("b", tensor(&[3.0])?, tensor(&[1.0])?)?);
    let x = graph.input(scalars(&[1.0])?, false)?;
    let y = net.evaluate(&graph, &[&x])?;
    assert_eq!(y.value()?.to_flat()?, vec![7.0]);

    let deltas = DeltaSet::new();
    y.accumulate(&deltas, &scalars(&[1.0])?)?;
    y.accumulate(&deltas, &scalars(&[1.0])?)?;

    let params = net.state();
    assert_eq!(params.len(), 4);
    // a.weight: dy/dwa = wb * x = 3, twice.
    assert_close(&deltas.get(params[0].id())?.unwrap_or_default(), &[6.0]);
    // b.weight: dy/dwb = wa * x = 2, twice.
    assert_close(&deltas.get(params[2].id())?.unwrap_or_default(), &[4.0]);
    Ok(())
}

test_modes!(
    linear_layer_end_to_end,
    fan_out_sums_before_propagating,
    shared_node_fires_once,
    missing_gradient_does_not_stall_siblings,
    frozen_branches_are_pruned,
    broadcast_parameters_reduce_over_batch,
    sum_and_sub_rules,
    repeated_passes_accumulate,
);

#[test]
fn conservative_forces_serial() {
    let config = Config::new()
        .with_execution(ExecutionMode::Parallel)
        .with_conservative(true);
    assert_eq!(Graph::new(&config).execution(), ExecutionMode::Serial);
}

#[test]
fn operands_must_share_a_graph() -> Result<()> {
    let config = setup_config(ExecutionMode::Serial);
    let (a, b) = (Graph::new(&config), Graph::new(&config));
    let x = a.input(scalars(&[1.0])?, true)?;
    let y = b.input(scalars(&[1.0])?, true)?;
    assert!(matches!(x.add(&y), Err(Error::InvalidArgument(_))));
    Ok(())
}

#[test]
fn forward_shape_errors_carry_context() -> Result<()> {
    let graph = Graph::new(&setup_config(ExecutionMode::Serial));
    let x = graph.input(scalars(&[1.0, 2.0])?, true)?;
    let y = graph.input(scalars(&[1.0, 2.0, 3.0])?, true)?;
    assert!(matches!(x.mul(&y), Err(Error::ComputationError { .. })));
    assert_eq!(graph.len(), 2);
    Ok(())
}
