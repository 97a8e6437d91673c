mod backward;
mod pool;

use criterion::{criterion_group, criterion_main};

criterion_group!(benches, pool::allocate, backward::basic);
criterion_main!(benches);
