#![allow(dead_code)]

use axonic_core::{
    config::{Config, ExecutionMode},
    error::Result,
};
use axonic_tensor::{Tensor, TensorList};

pub fn setup_config(mode: ExecutionMode) -> Config {
    let _ = env_logger::builder().is_test(true).try_init();
    Config::new().with_execution(mode)
}

pub fn scalars(values: &[f64]) -> Result<TensorList> {
    TensorList::stack(&[1], values)
}

pub fn tensor(values: &[f64]) -> Result<Tensor> {
    Tensor::new(values.to_vec())
}

pub fn assert_close(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len(), "{:?} vs {:?}", actual, expected);
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-9, "{:?} vs {:?}", actual, expected);
    }
}

#[macro_export]
macro_rules! test_modes {
    ($($name:ident),* $(,)?) => {
        $(
            paste::paste! {
                #[test]
                fn [<$name _serial>]() -> Result<()> {
                    $name(ExecutionMode::Serial)
                }

                #[test]
                fn [<$name _parallel>]() -> Result<()> {
                    $name(ExecutionMode::Parallel)
                }
            }
        )*
    };
}
