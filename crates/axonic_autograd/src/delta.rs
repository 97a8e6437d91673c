//! Gradient accumulators keyed by parameter identity.
//!
//! All algebra treats a key missing on one side as the zero vector of the
//! other side's shape. Only [`DeltaSet::add_in_place`] mutates; it locks the
//! individual buffer, so concurrent branches may target the same parameter.

use crate::parameter::ParamId;
use axonic_core::error::{check_finite, Error, Result};
use dashmap::DashMap;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

#[derive(Debug)]
pub struct Delta {
    shape: Vec<usize>,
    data: Mutex<Vec<f64>>,
}

impl Delta {
    fn new(shape: &[usize], data: Vec<f64>) -> Self {
        Self {
            shape: shape.to_vec(),
            data: Mutex::new(data),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn to_vec(&self) -> Result<Vec<f64>> {
        Ok(self.data.lock()?.clone())
    }

    fn add_in_place(&self, src: &[f64]) -> Result<()> {
        let mut data = self.data.lock()?;
        if data.len() != src.len() {
            return Err(Error::DimensionMismatch {
                expected: self.shape.clone(),
                got: vec![src.len()],
            });
        }
        let summed: Vec<f64> = data.iter().zip(src).map(|(d, s)| d + s).collect();
        check_finite("delta accumulate", &summed)?;
        *data = summed;
        Ok(())
    }
}

type Snapshot = BTreeMap<ParamId, (Vec<usize>, Vec<f64>)>;

#[derive(Debug, Default)]
pub struct DeltaSet {
    entries: DashMap<ParamId, Arc<Delta>>,
}

impl DeltaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: ParamId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn keys(&self) -> Vec<ParamId> {
        let mut keys: Vec<ParamId> = self.entries.iter().map(|entry| *entry.key()).collect();
        keys.sort();
        keys
    }

    pub fn get(&self, id: ParamId) -> Result<Option<Vec<f64>>> {
        match self.delta(id) {
            Some(delta) => delta.to_vec().map(Some),
            None => Ok(None),
        }
    }

    pub fn delta(&self, id: ParamId) -> Option<Arc<Delta>> {
        self.entries.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// `self[id] += src`, creating a zero entry of `shape` first if absent.
    pub fn add_in_place(&self, id: ParamId, shape: &[usize], src: &[f64]) -> Result<()> {
        check_finite("delta accumulate", src)?;
        let delta = Arc::clone(
            self.entries
                .entry(id)
                .or_insert_with(|| Arc::new(Delta::new(shape, vec![0.0; src.len()])))
                .value(),
        );
        delta.add_in_place(src)
    }

    fn snapshot(&self) -> Result<Snapshot> {
        self.entries
            .iter()
            .map(|entry| Ok((*entry.key(), (entry.shape.clone(), entry.to_vec()?))))
            .collect()
    }

    fn from_snapshot(snapshot: Snapshot) -> Self {
        let entries = snapshot
            .into_iter()
            .map(|(id, (shape, data))| (id, Arc::new(Delta::new(&shape, data))))
            .collect();
        Self { entries }
    }

    fn combine<F>(&self, rhs: &DeltaSet, op: &'static str, func: F) -> Result<DeltaSet>
    where
        F: Fn(f64, f64) -> f64,
    {
        let mut lhs = self.snapshot()?;
        let rhs = rhs.snapshot()?;
        for (id, (shape, b)) in rhs {
            let entry = lhs.entry(id).or_insert_with(|| (shape.clone(), vec![0.0; b.len()]));
            if entry.1.len() != b.len() {
                return Err(Error::DimensionMismatch {
                    expected: entry.0.clone(),
                    got: shape,
                });
            }
            for (a, b) in entry.1.iter_mut().zip(b) {
                *a = func(*a, b);
            }
            check_finite(op, &entry.1)?;
        }
        // Keys only on the left are kept as is: func(a, 0) == a for add and subtract.
        Ok(Self::from_snapshot(lhs))
    }

    pub fn add(&self, rhs: &DeltaSet) -> Result<DeltaSet> {
        self.combine(rhs, "add", |a, b| a + b)
    }

    pub fn subtract(&self, rhs: &DeltaSet) -> Result<DeltaSet> {
        self.combine(rhs, "subtract", |a, b| a - b)
    }

    pub fn scale(&self, factor: f64) -> Result<DeltaSet> {
        check_finite("scale", &[factor])?;
        let mut snapshot = self.snapshot()?;
        for (_, data) in snapshot.values_mut() {
            data.iter_mut().for_each(|v| *v *= factor);
            check_finite("scale", data)?;
        }
        Ok(Self::from_snapshot(snapshot))
    }

    /// Sum of products over shared keys; missing keys contribute zero.
    pub fn dot(&self, rhs: &DeltaSet) -> Result<f64> {
        // Snapshot first: no shard guard may be held across lookups into `rhs`,
        // which can be `self`.
        let lhs = self.snapshot()?;
        let mut dot = 0.0;
        for (id, (shape, a)) in &lhs {
            let Some(other) = rhs.delta(*id) else {
                continue;
            };
            let b = other.to_vec()?;
            if a.len() != b.len() {
                return Err(Error::DimensionMismatch {
                    expected: shape.clone(),
                    got: other.shape.clone(),
                });
            }
            dot += a.iter().zip(b.iter()).map(|(x, y)| x * y).sum::<f64>();
        }
        check_finite("dot", &[dot])?;
        Ok(dot)
    }

    pub fn magnitude(&self) -> Result<f64> {
        Ok(self.dot(self)?.sqrt())
    }

    /// Deep copy; the result shares no buffers with `self`.
    pub fn copy(&self) -> Result<DeltaSet> {
        Ok(Self::from_snapshot(self.snapshot()?))
    }
}
