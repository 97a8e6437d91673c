//! Per-run evaluation graph and the backward pass.
//!
//! Every forward evaluation appends a node to the graph's arena and hands back
//! an [`EvalResult`] (node index plus a shared handle to the graph). Nodes are
//! freed together when the last handle to the graph is dropped.
//!
//! Backward scheduling uses a counting gate: before a pass, each live node
//! reachable from the root is given a gate equal to the number of live
//! consumer edges pointing at it. Consumers add their gradient into the
//! node's pending buffer and decrement the gate; whoever brings it to zero
//! fires the node's gradient rule exactly once, with the summed gradient.

use crate::{
    delta::DeltaSet,
    operation::{Backward, Operation},
    parameter::Parameter,
};
use axonic_core::{
    config::{Config, ExecutionMode},
    error::{Error, Result},
};
use axonic_tensor::TensorList;
use log::{debug, error, trace};
use rayon::prelude::*;
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

struct Node {
    op: Operation,
    inputs: Vec<NodeId>,
    value: TensorList,
    alive: bool,
}

struct GraphInner {
    execution: ExecutionMode,
    nodes: RwLock<Vec<Arc<Node>>>,
    input_grads: Mutex<HashMap<NodeId, TensorList>>,
}

#[derive(Clone)]
pub struct Graph {
    inner: Arc<GraphInner>,
}

impl Graph {
    pub fn new(config: &Config) -> Self {
        Self {
            inner: Arc::new(GraphInner {
                execution: config.effective_execution(),
                nodes: RwLock::new(Vec::new()),
                input_grads: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn execution(&self) -> ExecutionMode {
        self.inner.execution
    }

    pub fn len(&self) -> usize {
        self.inner.nodes.read().map(|nodes| nodes.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn input(&self, value: TensorList, requires_grad: bool) -> Result<EvalResult> {
        self.push(Operation::Input { requires_grad }, vec![], value, requires_grad)
    }

    pub fn constant(&self, value: TensorList) -> Result<EvalResult> {
        self.push(Operation::Constant, vec![], value, false)
    }

    /// Leaf holding a snapshot of the parameter's current weights.
    /// Frozen parameters produce a dead leaf.
    pub fn parameter(&self, param: &Parameter) -> Result<EvalResult> {
        let value = TensorList::single(param.weights().to_host()?);
        let alive = !param.is_frozen();
        self.push(Operation::Parameter { param: param.clone() }, vec![], value, alive)
    }

    /// Records an externally computed node. `value` is the layer's forward output.
    pub fn custom(
        &self,
        backward: Arc<dyn Backward>,
        inputs: &[&EvalResult],
        value: TensorList,
    ) -> Result<EvalResult> {
        let ids = self.member_ids(inputs)?;
        let alive = self.any_alive(&ids)?;
        self.push(Operation::Custom(backward), ids, value, alive)
    }

    fn apply(&self, op: Operation, inputs: &[&EvalResult]) -> Result<EvalResult> {
        let ids = self.member_ids(inputs)?;
        let values: Vec<TensorList> = inputs.iter().map(|r| r.value()).collect::<Result<_>>()?;
        let refs: Vec<&TensorList> = values.iter().collect();
        let value = op.forward(&refs).map_err(|e| {
            let shapes: Vec<Vec<usize>> = values.iter().map(|v| v.element_shape().to_vec()).collect();
            error!("forward {} failed on {:?}: {}", op.name(), shapes, e);
            e
        })?;
        let alive = self.any_alive(&ids)?;
        self.push(op, ids, value, alive)
    }

    fn member_ids(&self, inputs: &[&EvalResult]) -> Result<Vec<NodeId>> {
        inputs
            .iter()
            .map(|r| {
                if Arc::ptr_eq(&r.graph.inner, &self.inner) {
                    Ok(r.node)
                } else {
                    Err(Error::InvalidArgument("operands belong to different graphs".into()))
                }
            })
            .collect()
    }

    fn any_alive(&self, ids: &[NodeId]) -> Result<bool> {
        let nodes = self.inner.nodes.read()?;
        Ok(ids.iter().any(|id| nodes[id.0].alive))
    }

    fn push(&self, op: Operation, inputs: Vec<NodeId>, value: TensorList, alive: bool) -> Result<EvalResult> {
        let mut nodes = self.inner.nodes.write()?;
        let id = NodeId(nodes.len());
        trace!("node {} = {:?}{:?} alive={}", id.0, op, inputs, alive);
        nodes.push(Arc::new(Node {
            op,
            inputs,
            value,
            alive,
        }));
        Ok(EvalResult {
            graph: self.clone(),
            node: id,
        })
    }

    fn node(&self, id: NodeId) -> Result<Arc<Node>> {
        let nodes = self.inner.nodes.read()?;
        nodes.get(id.0).cloned().ok_or(Error::IndexOutOfBounds {
            index: id.0,
            size: nodes.len(),
        })
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.len())
            .field("execution", &self.inner.execution)
            .finish()
    }
}

/// A forward value together with its place in the graph.
#[derive(Clone)]
pub struct EvalResult {
    graph: Graph,
    node: NodeId,
}

impl EvalResult {
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn id(&self) -> NodeId {
        self.node
    }

    pub fn value(&self) -> Result<TensorList> {
        Ok(self.graph.node(self.node)?.value.clone())
    }

    pub fn operation(&self) -> Result<Operation> {
        Ok(self.graph.node(self.node)?.op.clone())
    }

    /// Whether a backward pass through this node can reach anything trainable.
    pub fn is_alive(&self) -> bool {
        self.graph.node(self.node).map(|node| node.alive).unwrap_or(false)
    }

    pub fn add(&self, rhs: &EvalResult) -> Result<EvalResult> {
        self.graph.apply(Operation::Add, &[self, rhs])
    }

    pub fn sub(&self, rhs: &EvalResult) -> Result<EvalResult> {
        self.graph.apply(Operation::Sub, &[self, rhs])
    }

    pub fn mul(&self, rhs: &EvalResult) -> Result<EvalResult> {
        self.graph.apply(Operation::Mul, &[self, rhs])
    }

    pub fn scale(&self, factor: f64) -> Result<EvalResult> {
        self.graph.apply(Operation::Scale(factor), &[self])
    }

    pub fn sum(&self) -> Result<EvalResult> {
        self.graph.apply(Operation::Sum, &[self])
    }

    /// Gradient accumulated into this input leaf by backward passes so far.
    pub fn input_gradient(&self) -> Result<Option<TensorList>> {
        Ok(self.graph.inner.input_grads.lock()?.get(&self.node).cloned())
    }

    /// Runs a fresh backward pass from this node and returns its deltas.
    pub fn backward(&self, grad: &TensorList) -> Result<DeltaSet> {
        let deltas = DeltaSet::new();
        self.accumulate(&deltas, grad)?;
        Ok(deltas)
    }

    /// Propagates `grad` through every live node upstream of this one, adding
    /// parameter gradients into `deltas` and input gradients into the leaves.
    pub fn accumulate(&self, deltas: &DeltaSet, grad: &TensorList) -> Result<()> {
        let root = self.graph.node(self.node)?;
        if !root.alive {
            debug!("skipping backward from dead node {}", self.node.0);
            return Ok(());
        }
        let grad = conform(grad, &root.value, root.op.name())?;

        let pass = Pass::new(&self.graph, self.node, deltas)?;
        match self.graph.inner.execution {
            ExecutionMode::Serial => pass.run_serial(self.node, grad),
            ExecutionMode::Parallel => pass.run_parallel(self.node, Some(grad)),
        }
    }
}

impl fmt::Debug for EvalResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvalResult").field("node", &self.node).finish()
    }
}

/// Brings a gradient to the batch length and element shape of `value`.
fn conform(grad: &TensorList, value: &TensorList, op: &str) -> Result<TensorList> {
    if grad.element_shape() != value.element_shape() {
        return Err(Error::computation(
            op,
            vec![grad.element_shape().to_vec(), value.element_shape().to_vec()],
            "gradient shape does not match value",
        ));
    }
    match (grad.len(), value.len()) {
        (g, v) if g == v => Ok(grad.clone()),
        (_, 1) => grad.sum_batch(),
        (1, v) => grad.broadcast_to(v),
        (g, v) => Err(Error::computation(
            op,
            vec![vec![g], vec![v]],
            "gradient batch does not match value",
        )),
    }
}

struct Pass<'a> {
    graph: &'a Graph,
    nodes: Vec<Arc<Node>>,
    gates: Vec<AtomicUsize>,
    pending: Vec<Mutex<Option<TensorList>>>,
    deltas: &'a DeltaSet,
}

impl<'a> Pass<'a> {
    fn new(graph: &'a Graph, root: NodeId, deltas: &'a DeltaSet) -> Result<Self> {
        let nodes: Vec<Arc<Node>> = graph.inner.nodes.read()?.iter().take(root.0 + 1).cloned().collect();

        let mut reachable = vec![false; nodes.len()];
        let mut gates = vec![0usize; nodes.len()];
        let mut stack = vec![root.0];
        reachable[root.0] = true;
        while let Some(id) = stack.pop() {
            for input in &nodes[id].inputs {
                if !nodes[input.0].alive {
                    continue;
                }
                gates[input.0] += 1;
                if !reachable[input.0] {
                    reachable[input.0] = true;
                    stack.push(input.0);
                }
            }
        }
        debug!(
            "backward from node {}: {} of {} nodes reachable",
            root.0,
            reachable.iter().filter(|r| **r).count(),
            nodes.len()
        );

        let pending = (0..nodes.len()).map(|_| Mutex::new(None)).collect();
        Ok(Self {
            graph,
            nodes,
            gates: gates.into_iter().map(AtomicUsize::new).collect(),
            pending,
            deltas,
        })
    }

    fn run_serial(&self, root: NodeId, grad: TensorList) -> Result<()> {
        let mut queue = VecDeque::from([(root, Some(grad))]);
        while let Some((id, grad)) = queue.pop_front() {
            queue.extend(self.fire(id, grad)?);
        }
        Ok(())
    }

    fn run_parallel(&self, id: NodeId, grad: Option<TensorList>) -> Result<()> {
        let ready = self.fire(id, grad)?;
        ready
            .into_par_iter()
            .try_for_each(|(next, grad)| self.run_parallel(next, grad))
    }

    /// Adds `grad` to the pending sum and passes the gate once.
    fn deliver(&self, id: NodeId, grad: Option<TensorList>) -> Result<Gate> {
        if let Some(grad) = grad {
            let mut slot = self.pending[id.0].lock()?;
            *slot = Some(match slot.take() {
                Some(acc) => acc.add(&grad)?,
                None => grad,
            });
        }
        match self.gates[id.0].fetch_sub(1, Ordering::SeqCst) {
            0 => Err(Error::Internal {
                message: format!("gate of node {} passed more times than it has consumers", id.0),
            }),
            1 => Ok(Gate::Open(self.pending[id.0].lock()?.take())),
            _ => Ok(Gate::Waiting),
        }
    }

    /// Runs the gradient rule of one node and returns the upstream nodes whose
    /// gates it opened. A node fired without a gradient still passes its
    /// inputs' gates so that their other consumers are not starved.
    fn fire(&self, id: NodeId, grad: Option<TensorList>) -> Result<Vec<(NodeId, Option<TensorList>)>> {
        let node = &self.nodes[id.0];
        trace!("firing node {} ({})", id.0, node.op.name());

        let Some(grad) = grad else {
            let mut ready = Vec::new();
            for input in node.inputs.iter().filter(|i| self.nodes[i.0].alive) {
                if let Gate::Open(grad) = self.deliver(*input, None)? {
                    ready.push((*input, grad));
                }
            }
            return Ok(ready);
        };

        match &node.op {
            Operation::Parameter { param } => {
                let grad = if grad.len() > 1 { grad.sum_batch()? } else { grad };
                self.deltas.add_in_place(param.id(), param.shape(), &grad.to_flat()?)?;
                Ok(vec![])
            },
            Operation::Input { requires_grad: true } => {
                let mut grads = self.graph.inner.input_grads.lock()?;
                let summed = match grads.remove(&id) {
                    Some(acc) => acc.add(&grad)?,
                    None => grad,
                };
                grads.insert(id, summed);
                Ok(vec![])
            },
            Operation::Input { .. } | Operation::Constant => Ok(vec![]),
            op => {
                let inputs: Vec<&TensorList> = node.inputs.iter().map(|i| &self.nodes[i.0].value).collect();
                let grads = op.vjp(&inputs, &node.value, &grad).map_err(|e| {
                    let shapes: Vec<Vec<usize>> = inputs.iter().map(|v| v.element_shape().to_vec()).collect();
                    error!("backward {} failed on {:?}: {}", op.name(), shapes, e);
                    e
                })?;
                if grads.len() != node.inputs.len() {
                    return Err(Error::computation(
                        op.name(),
                        vec![vec![node.inputs.len()], vec![grads.len()]],
                        "gradient rule returned the wrong number of gradients",
                    ));
                }

                let mut ready = Vec::new();
                for (input, grad) in node.inputs.iter().zip(grads) {
                    let upstream = &self.nodes[input.0];
                    if !upstream.alive {
                        continue;
                    }
                    let grad = grad
                        .map(|g| conform(&g, &upstream.value, op.name()))
                        .transpose()?;
                    if let Gate::Open(summed) = self.deliver(*input, grad)? {
                        ready.push((*input, summed));
                    }
                }
                Ok(ready)
            },
        }
    }
}

enum Gate {
    Waiting,
    Open(Option<TensorList>),
}
