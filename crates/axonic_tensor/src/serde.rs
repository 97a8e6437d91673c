//! Flat snapshots of tensor contents for external persistence.
//! Device tensors are read back first; deserialized tensors always live on the host.

use crate::{Tensor, TensorList};
use axonic_core::{device::Device, layout::Layout};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

#[derive(Serialize, Deserialize)]
struct SerializedTensor {
    layout: Layout,
    device: Device,
    data: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct SerializedTensorList {
    element: Layout,
    rows: Vec<Vec<f64>>,
}

impl Serialize for Tensor {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let data = self.to_vec().map_err(serde::ser::Error::custom)?;
        SerializedTensor {
            layout: self.layout().clone(),
            device: self.device(),
            data,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Tensor {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let serialized = SerializedTensor::deserialize(deserializer)?;
        Tensor::from_vec(serialized.layout.shape(), serialized.data).map_err(de::Error::custom)
    }
}

impl Serialize for TensorList {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let rows = self.to_vecs().map_err(serde::ser::Error::custom)?;
        SerializedTensorList {
            element: Layout::from_shape(self.element_shape()),
            rows,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TensorList {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let serialized = SerializedTensorList::deserialize(deserializer)?;
        TensorList::from_vecs(serialized.element.shape(), serialized.rows).map_err(de::Error::custom)
    }
}
