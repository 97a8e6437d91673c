//! Parameter snapshots for optimizers that probe and roll back weights.

use crate::{
    delta::DeltaSet,
    parameter::{ParamId, Parameter},
};
use axonic_core::error::{check_finite, Error, Result};
use log::debug;
use std::collections::BTreeMap;

/// A parameter paired with a scratch copy of its weights.
#[derive(Debug)]
pub struct State {
    param: Parameter,
    scratch: Vec<f64>,
}

impl State {
    pub fn new(param: Parameter) -> Result<Self> {
        let scratch = param.weights().to_vec()?;
        Ok(Self { param, scratch })
    }

    pub fn param(&self) -> &Parameter {
        &self.param
    }

    pub fn scratch(&self) -> &[f64] {
        &self.scratch
    }

    pub fn backup(&mut self) -> Result<()> {
        self.scratch = self.param.weights().to_vec()?;
        Ok(())
    }

    pub fn restore(&self) -> Result<()> {
        self.param.weights().write_from(&self.scratch)
    }

    /// `weights += alpha * delta`.
    pub fn apply(&self, delta: &[f64], alpha: f64) -> Result<()> {
        let mut weights = self.param.weights().to_vec()?;
        if weights.len() != delta.len() {
            return Err(Error::DimensionMismatch {
                expected: self.param.shape().to_vec(),
                got: vec![delta.len()],
            });
        }
        for (w, d) in weights.iter_mut().zip(delta) {
            *w += alpha * d;
        }
        check_finite("state apply", &weights)?;
        self.param.weights().write_from(&weights)
    }
}

#[derive(Debug, Default)]
pub struct StateSet {
    states: BTreeMap<ParamId, State>,
}

impl StateSet {
    pub fn new(params: &[Parameter]) -> Result<Self> {
        let states = params
            .iter()
            .map(|p| Ok((p.id(), State::new(p.clone())?)))
            .collect::<Result<_>>()?;
        Ok(Self { states })
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, id: ParamId) -> Option<&State> {
        self.states.get(&id)
    }

    pub fn backup(&mut self) -> Result<()> {
        self.states.values_mut().try_for_each(|state| state.backup())
    }

    pub fn restore(&self) -> Result<()> {
        self.states.values().try_for_each(|state| state.restore())
    }

    /// Steps every trainable parameter that has an entry in `deltas`.
    /// Returns the number of parameters touched.
    pub fn apply(&self, deltas: &DeltaSet, alpha: f64) -> Result<usize> {
        let mut applied = 0;
        for (id, state) in &self.states {
            if state.param.is_frozen() {
                continue;
            }
            if let Some(delta) = deltas.get(*id)? {
                state.apply(&delta, alpha)?;
                applied += 1;
            }
        }
        debug!("applied {} of {} deltas with alpha {}", applied, deltas.len(), alpha);
        Ok(applied)
    }
}
