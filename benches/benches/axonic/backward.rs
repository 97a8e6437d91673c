use axonic_autograd::{Affine, Graph, Layer, Sequential};
use axonic_core::config::{Config, ExecutionMode};
use axonic_tensor::{Tensor, TensorList};
use criterion::{black_box, Criterion};

const DEPTHS: [(usize, &str); 3] = [(4, "shallow"), (32, "medium"), (128, "deep")];
const WIDTH: usize = 64;
const BATCH: usize = 16;

fn network(depth: usize) -> Sequential {
    (0..depth).fold(Sequential::new("net"), |net, i| {
        let weight = Tensor::full(&[WIDTH], 1.0 + 1.0 / (i + 1) as f64).unwrap();
        let bias = Tensor::zeros(&[WIDTH]).unwrap();
        net.push(Affine::new(format!("fc{}", i), weight.scale(0.5).unwrap(), bias).unwrap())
    })
}

pub fn basic(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("backward/basic");
    group.warm_up_time(core::time::Duration::from_millis(500));
    group.measurement_time(core::time::Duration::from_secs(3));
    group.sample_size(30);

    let input = TensorList::stack(&[WIDTH], &vec![0.5; WIDTH * BATCH]).unwrap();
    let grad = TensorList::stack(&[WIDTH], &vec![1.0; WIDTH * BATCH]).unwrap();
    for mode in [ExecutionMode::Serial, ExecutionMode::Parallel] {
        let config = Config::new().with_execution(mode);
        for (depth, label) in DEPTHS {
            let net = network(depth);
            group.bench_function(format!("{}/{}", mode.as_str(), label), |b| {
                b.iter(|| {
                    let graph = Graph::new(&config);
                    let x = graph.input(input.clone(), false).unwrap();
                    let y = net.evaluate(&graph, &[&x]).unwrap();
                    black_box(y.backward(&grad).unwrap())
                })
            });
        }
    }

    group.finish();
}
