//! Named parameter tensors and ordered parameter sets.
//!
//! Parameters are opaque to the orchestrator: only element-wise arithmetic,
//! shape checks and distances are needed.

use serde::{Deserialize, Serialize};

/// A named, row-major parameter tensor (weights or biases of one layer).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterTensor {
    /// Tensor name, e.g. `dense_1/kernel`
    pub name: String,
    /// Dimensions
    pub shape: Vec<usize>,
    /// Flat values
    pub values: Vec<f32>,
}

impl ParameterTensor {
    /// Create a tensor. The value count must match the shape.
    pub fn new(name: &str, shape: Vec<usize>, values: Vec<f32>) -> Option<Self> {
        if shape.iter().product::<usize>() != values.len() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            shape,
            values,
        })
    }

    /// A one-dimensional tensor.
    pub fn vector(name: &str, values: Vec<f32>) -> Self {
        Self {
            name: name.to_string(),
            shape: vec![values.len()],
            values,
        }
    }

    /// Tensor of zeros.
    pub fn zeros(name: &str, shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            name: name.to_string(),
            shape,
            values: vec![0.0; len],
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Shape of a parameter set: ordered `(name, dims)` pairs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeSignature(pub Vec<(String, Vec<usize>)>);

impl ShapeSignature {
    /// Total number of scalar elements.
    pub fn num_elements(&self) -> usize {
        self.0.iter().map(|(_, dims)| dims.iter().product::<usize>()).sum()
    }

    /// Describe the first difference to `other`, or `None` if equal.
    pub fn diff(&self, other: &ShapeSignature) -> Option<String> {
        if self.0.len() != other.0.len() {
            return Some(format!(
                "expected {} tensors, got {}",
                self.0.len(),
                other.0.len()
            ));
        }
        self.0
            .iter()
            .zip(other.0.iter())
            .find(|(a, b)| a != b)
            .map(|((name, dims), (other_name, other_dims))| {
                format!(
                    "expected {}{:?}, got {}{:?}",
                    name, dims, other_name, other_dims
                )
            })
    }
}

/// Ordered collection of parameter tensors.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub tensors: Vec<ParameterTensor>,
}

impl ParameterSet {
    /// Create from tensors.
    pub fn new(tensors: Vec<ParameterTensor>) -> Self {
        Self { tensors }
    }

    /// Single-tensor set holding a flat vector.
    pub fn from_vector(values: Vec<f32>) -> Self {
        Self::new(vec![ParameterTensor::vector("params", values)])
    }

    /// Zero-valued set of the same shape.
    pub fn zeros_like(&self) -> Self {
        Self::new(
            self.tensors
                .iter()
                .map(|t| ParameterTensor::zeros(&t.name, t.shape.clone()))
                .collect(),
        )
    }

    /// Shape signature of this set.
    pub fn signature(&self) -> ShapeSignature {
        ShapeSignature(
            self.tensors
                .iter()
                .map(|t| (t.name.clone(), t.shape.clone()))
                .collect(),
        )
    }

    /// Check against an expected signature.
    ///
    /// Also catches tensors whose value count disagrees with their own shape,
    /// since deserialized updates are not trusted.
    pub fn conforms_to(&self, expected: &ShapeSignature) -> Result<(), String> {
        if let Some(detail) = expected.diff(&self.signature()) {
            return Err(detail);
        }
        for tensor in &self.tensors {
            let declared: usize = tensor.shape.iter().product();
            if declared != tensor.values.len() {
                return Err(format!(
                    "tensor {} declares {} elements but carries {}",
                    tensor.name,
                    declared,
                    tensor.values.len()
                ));
            }
        }
        Ok(())
    }

    /// Total number of scalar elements.
    pub fn num_elements(&self) -> usize {
        self.tensors.iter().map(|t| t.len()).sum()
    }

    /// All values in tensor order.
    pub fn flatten(&self) -> Vec<f32> {
        let mut flat = Vec::with_capacity(self.num_elements());
        for tensor in &self.tensors {
            flat.extend_from_slice(&tensor.values);
        }
        flat
    }

    /// Iterate over all values in tensor order.
    pub fn iter_values(&self) -> impl Iterator<Item = f32> + '_ {
        self.tensors.iter().flat_map(|t| t.values.iter().copied())
    }

    /// Rebuild a set with this set's shape from flat values.
    pub fn with_flat_values(&self, flat: &[f32]) -> Option<Self> {
        if flat.len() != self.num_elements() {
            return None;
        }
        let mut offset = 0;
        let tensors = self
            .tensors
            .iter()
            .map(|t| {
                let values = flat[offset..offset + t.len()].to_vec();
                offset += t.len();
                ParameterTensor {
                    name: t.name.clone(),
                    shape: t.shape.clone(),
                    values,
                }
            })
            .collect();
        Some(Self::new(tensors))
    }

    /// Euclidean distance to another set of the same shape.
    pub fn l2_distance(&self, other: &ParameterSet) -> f64 {
        self.iter_values()
            .zip(other.iter_values())
            .map(|(a, b)| {
                let d = a as f64 - b as f64;
                d * d
            })
            .sum::<f64>()
            .sqrt()
    }

    /// Euclidean norm.
    pub fn l2_norm(&self) -> f64 {
        self.iter_values()
            .map(|v| (v as f64) * (v as f64))
            .sum::<f64>()
            .sqrt()
    }

    /// `self - scale * other`, element-wise.
    pub fn sub_scaled(&self, other: &ParameterSet, scale: f32) -> ParameterSet {
        let tensors = self
            .tensors
            .iter()
            .zip(other.tensors.iter())
            .map(|(a, b)| ParameterTensor {
                name: a.name.clone(),
                shape: a.shape.clone(),
                values: a
                    .values
                    .iter()
                    .zip(b.values.iter())
                    .map(|(x, g)| x - scale * g)
                    .collect(),
            })
            .collect();
        ParameterSet::new(tensors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_layer() -> ParameterSet {
        ParameterSet::new(vec![
            ParameterTensor::new("dense/kernel", vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
            ParameterTensor::vector("dense/bias", vec![0.5, -0.5]),
        ])
    }

    #[test]
    fn test_tensor_shape_check() {
        assert!(ParameterTensor::new("w", vec![2, 3], vec![0.0; 6]).is_some());
        assert!(ParameterTensor::new("w", vec![2, 3], vec![0.0; 5]).is_none());
    }

    #[test]
    fn test_flatten_and_rebuild() {
        let set = two_layer();
        let flat = set.flatten();
        assert_eq!(flat, vec![1.0, 2.0, 3.0, 4.0, 0.5, -0.5]);

        let rebuilt = set.with_flat_values(&flat).unwrap();
        assert_eq!(rebuilt, set);
        assert!(set.with_flat_values(&flat[..5]).is_none());
    }

    #[test]
    fn test_conforms_to() {
        let set = two_layer();
        let sig = set.signature();
        assert!(set.conforms_to(&sig).is_ok());
        assert_eq!(sig.num_elements(), 6);

        let other = ParameterSet::from_vector(vec![1.0; 6]);
        let err = other.conforms_to(&sig).unwrap_err();
        assert!(err.contains("expected 2 tensors"));
    }

    #[test]
    fn test_conforms_to_catches_lying_tensor() {
        let mut set = two_layer();
        let sig = set.signature();
        set.tensors[1].values.push(9.0);
        assert!(set.conforms_to(&sig).is_err());
    }

    #[test]
    fn test_distances() {
        let a = ParameterSet::from_vector(vec![0.0, 0.0]);
        let b = ParameterSet::from_vector(vec![3.0, 4.0]);
        assert!((a.l2_distance(&b) - 5.0).abs() < 1e-12);
        assert!((b.l2_norm() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_sub_scaled() {
        let params = ParameterSet::from_vector(vec![1.0, 1.0]);
        let grad = ParameterSet::from_vector(vec![2.0, -2.0]);
        let next = params.sub_scaled(&grad, 0.5);
        assert_eq!(next.flatten(), vec![0.0, 2.0]);
    }
}
