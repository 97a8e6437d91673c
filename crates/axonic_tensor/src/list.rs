use crate::Tensor;
use axonic_core::{
    device::Device,
    error::{check_finite, Error, Result},
    layout::Layout,
};
use axonic_memory::{DeviceMemoryPool, DevicePtr, MemoryKind};
use std::{fmt, sync::Arc};

#[derive(Clone)]
struct DeviceView {
    block: Arc<DevicePtr>,
    /// Element offset of each batch entry inside `block`.
    offsets: Vec<usize>,
}

#[derive(Clone)]
enum ListRepr {
    Host(Vec<Tensor>),
    Device(DeviceView),
}

/// An ordered batch of tensors sharing one element shape.
///
/// A device-resident list is a single pooled block plus a batch-index to
/// offset map, so selecting or chunking it never copies element data.
#[derive(Clone)]
pub struct TensorList {
    element: Layout,
    repr: ListRepr,
}

impl TensorList {
    pub fn from_tensors(tensors: Vec<Tensor>) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::InvalidArgument("TensorList needs at least one tensor".into()))?;
        let element = Layout::from_shape(first.shape());
        if let Some(bad) = tensors.iter().find(|t| t.shape() != element.shape()) {
            return Err(Error::DimensionMismatch {
                expected: element.shape().to_vec(),
                got: bad.shape().to_vec(),
            });
        }

        Ok(Self {
            element,
            repr: ListRepr::Host(tensors),
        })
    }

    pub fn single(tensor: Tensor) -> Self {
        Self {
            element: Layout::from_shape(tensor.shape()),
            repr: ListRepr::Host(vec![tensor]),
        }
    }

    /// Splits a flat batch buffer into `data.len() / size(element_shape)` entries.
    pub fn stack(element_shape: &[usize], data: &[f64]) -> Result<Self> {
        let size = Layout::compute_size(element_shape);
        if size == 0 || data.is_empty() || data.len() % size != 0 {
            return Err(Error::DimensionMismatch {
                expected: element_shape.to_vec(),
                got: vec![data.len()],
            });
        }
        let tensors = data
            .chunks(size)
            .map(|chunk| Tensor::from_vec(element_shape, chunk.to_vec()))
            .collect::<Result<Vec<_>>>()?;
        Self::from_tensors(tensors)
    }

    pub fn from_vecs(element_shape: &[usize], rows: Vec<Vec<f64>>) -> Result<Self> {
        let tensors = rows
            .into_iter()
            .map(|row| Tensor::from_vec(element_shape, row))
            .collect::<Result<Vec<_>>>()?;
        Self::from_tensors(tensors)
    }

    pub fn len(&self) -> usize {
        match &self.repr {
            ListRepr::Host(tensors) => tensors.len(),
            ListRepr::Device(view) => view.offsets.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element_shape(&self) -> &[usize] {
        self.element.shape()
    }

    pub fn element_size(&self) -> usize {
        self.element.size()
    }

    pub fn is_device(&self) -> bool {
        matches!(self.repr, ListRepr::Device(_))
    }

    pub fn device(&self) -> Device {
        match &self.repr {
            ListRepr::Host(tensors) => tensors.first().map(|t| t.device()).unwrap_or(Device::CPU),
            ListRepr::Device(view) => view.block.device(),
        }
    }

    /// Entry `index` as a tensor. Device entries are copied to the host.
    pub fn get(&self, index: usize) -> Result<Tensor> {
        let len = self.len();
        if index >= len {
            return Err(Error::IndexOutOfBounds { index, size: len });
        }
        match &self.repr {
            ListRepr::Host(tensors) => Ok(tensors[index].clone()),
            ListRepr::Device(view) => {
                let mut data = vec![0.0; self.element_size()];
                view.block.read(view.offsets[index], &mut data)?;
                Tensor::from_vec(self.element_shape(), data)
            },
        }
    }

    pub fn tensors(&self) -> Result<Vec<Tensor>> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }

    pub fn to_vecs(&self) -> Result<Vec<Vec<f64>>> {
        match &self.repr {
            ListRepr::Host(tensors) => tensors.iter().map(|t| t.to_vec()).collect(),
            ListRepr::Device(view) => view
                .offsets
                .iter()
                .map(|&offset| {
                    let mut data = vec![0.0; self.element_size()];
                    view.block.read(offset, &mut data)?;
                    Ok(data)
                })
                .collect(),
        }
    }

    pub fn to_flat(&self) -> Result<Vec<f64>> {
        Ok(self.to_vecs()?.concat())
    }

    /// Uploads the whole batch into one contiguous pooled block.
    pub fn to_device(&self, pool: &DeviceMemoryPool, device: Device) -> Result<TensorList> {
        if device == Device::CPU {
            return self.to_host();
        }
        let size = self.element_size();
        let flat = self.to_flat()?;
        let block = pool.allocate_elements(device, flat.len(), MemoryKind::Device)?;
        block.write(0, &flat)?;

        Ok(Self {
            element: self.element.clone(),
            repr: ListRepr::Device(DeviceView {
                block: Arc::new(block),
                offsets: (0..self.len()).map(|i| i * size).collect(),
            }),
        })
    }

    pub fn to_host(&self) -> Result<TensorList> {
        match &self.repr {
            ListRepr::Host(tensors) => Ok(Self {
                element: self.element.clone(),
                repr: ListRepr::Host(tensors.iter().map(|t| t.to_host()).collect::<Result<_>>()?),
            }),
            ListRepr::Device(_) => Self::from_tensors(self.tensors()?),
        }
    }

    /// Picks entries by index. Device lists share the underlying block.
    pub fn select(&self, indices: &[usize]) -> Result<TensorList> {
        let len = self.len();
        if let Some(&index) = indices.iter().find(|&&i| i >= len) {
            return Err(Error::IndexOutOfBounds { index, size: len });
        }
        if indices.is_empty() {
            return Err(Error::InvalidArgument("cannot select an empty batch".into()));
        }

        let repr = match &self.repr {
            ListRepr::Host(tensors) => ListRepr::Host(indices.iter().map(|&i| tensors[i].clone()).collect()),
            ListRepr::Device(view) => ListRepr::Device(DeviceView {
                block: Arc::clone(&view.block),
                offsets: indices.iter().map(|&i| view.offsets[i]).collect(),
            }),
        };
        Ok(Self {
            element: self.element.clone(),
            repr,
        })
    }

    pub fn chunks(&self, chunk_len: usize) -> Result<Vec<TensorList>> {
        if chunk_len == 0 {
            return Err(Error::InvalidArgument("chunk length must be positive".into()));
        }
        let indices: Vec<usize> = (0..self.len()).collect();
        indices.chunks(chunk_len).map(|chunk| self.select(chunk)).collect()
    }

    pub fn concat(lists: &[TensorList]) -> Result<TensorList> {
        let mut tensors = Vec::new();
        for list in lists {
            tensors.extend(list.tensors()?);
        }
        Self::from_tensors(tensors)
    }

    pub fn zeros_like(&self) -> Result<TensorList> {
        let tensors = (0..self.len())
            .map(|_| Tensor::zeros(self.element_shape()))
            .collect::<Result<Vec<_>>>()?;
        Self::from_tensors(tensors)
    }

    /// Repeats a single-entry list `len` times.
    pub fn broadcast_to(&self, len: usize) -> Result<TensorList> {
        match self.len() {
            n if n == len => Ok(self.clone()),
            1 => {
                let entry = self.get(0)?;
                Self::from_tensors(vec![entry; len])
            },
            n => Err(Error::computation(
                "broadcast",
                vec![vec![n], vec![len]],
                "only single-entry lists broadcast",
            )),
        }
    }

    /// Sums over the batch, yielding a single-entry list.
    pub fn sum_batch(&self) -> Result<TensorList> {
        let mut acc = vec![0.0; self.element_size()];
        for row in self.to_vecs()? {
            for (a, v) in acc.iter_mut().zip(row) {
                *a += v;
            }
        }
        check_finite("sum_batch", &acc)?;
        Ok(Self::single(Tensor::from_vec(self.element_shape(), acc)?))
    }

    fn zip_with<F>(&self, rhs: &TensorList, op: &'static str, func: F) -> Result<TensorList>
    where
        F: Fn(f64, f64) -> f64,
    {
        if self.element_shape() != rhs.element_shape() {
            return Err(Error::computation(
                op,
                vec![self.element_shape().to_vec(), rhs.element_shape().to_vec()],
                "element shapes differ",
            ));
        }
        let len = match (self.len(), rhs.len()) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            (a, b) => {
                return Err(Error::computation(
                    op,
                    vec![vec![a], vec![b]],
                    "batch sizes differ and neither is one",
                ))
            },
        };

        let (lhs, rhs) = (self.to_vecs()?, rhs.to_vecs()?);
        let rows = (0..len)
            .map(|i| {
                let a = &lhs[if lhs.len() == 1 { 0 } else { i }];
                let b = &rhs[if rhs.len() == 1 { 0 } else { i }];
                let row: Vec<f64> = a.iter().zip(b.iter()).map(|(&x, &y)| func(x, y)).collect();
                check_finite(op, &row)?;
                Ok(row)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_vecs(self.element_shape(), rows)
    }

    /// Elementwise sum; a single-entry operand broadcasts over the batch.
    pub fn add(&self, rhs: &TensorList) -> Result<TensorList> {
        self.zip_with(rhs, "add", |a, b| a + b)
    }

    pub fn sub(&self, rhs: &TensorList) -> Result<TensorList> {
        self.zip_with(rhs, "sub", |a, b| a - b)
    }

    pub fn mul(&self, rhs: &TensorList) -> Result<TensorList> {
        self.zip_with(rhs, "mul", |a, b| a * b)
    }

    pub fn scale(&self, factor: f64) -> Result<TensorList> {
        check_finite("scale", &[factor])?;
        let rows = self
            .to_vecs()?
            .into_iter()
            .map(|row| {
                let row: Vec<f64> = row.into_iter().map(|v| v * factor).collect();
                check_finite("scale", &row)?;
                Ok(row)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_vecs(self.element_shape(), rows)
    }

    /// Sum of all elements across the batch.
    pub fn sum(&self) -> Result<f64> {
        let sum = self.to_flat()?.iter().sum::<f64>();
        check_finite("sum", &[sum])?;
        Ok(sum)
    }
}

impl fmt::Debug for TensorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorList")
            .field("len", &self.len())
            .field("element_shape", &self.element_shape())
            .field("device", &self.device())
            .finish()
    }
}
