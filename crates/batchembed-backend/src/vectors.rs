//! Decoding and validation of backend vectors.
use serde_json::Value;

use batchembed_core::BackendError;

/// Turn a decoded response body into one vector per input.
///
/// Accepts `[[f, ..], ..]` and the per-input singleton nesting `[[[f, ..]], ..]`
/// some servers emit. Anything else is a permanent error.
pub fn decode_vectors(endpoint: &str, body: Value) -> Result<Vec<Vec<f32>>, BackendError> {
    let Value::Array(items) = body else {
        return Err(BackendError::permanent(endpoint, "response is not a JSON array"));
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            let item = match item {
                Value::Array(mut inner) if inner.len() == 1 && inner[0].is_array() => inner.remove(0),
                other => other,
            };
            let Value::Array(nums) = item else {
                return Err(BackendError::permanent(endpoint, format!("item {i} is not a vector")));
            };
            nums.iter()
                .map(|n| {
                    n.as_f64().map(|f| f as f32).ok_or_else(|| {
                        BackendError::permanent(endpoint, format!("item {i} has a non-numeric component"))
                    })
                })
                .collect()
        })
        .collect()
}

/// Check count and length, then apply optional truncation.
pub fn validate_vectors(
    endpoint: &str,
    vectors: Vec<Vec<f32>>,
    expected_count: usize,
    dim: usize,
    truncate_dim: Option<usize>,
) -> Result<Vec<Vec<f32>>, BackendError> {
    if vectors.len() != expected_count {
        return Err(BackendError::permanent(
            endpoint,
            format!("returned {} vectors for {} inputs", vectors.len(), expected_count),
        ));
    }
    if let Some((i, v)) = vectors.iter().enumerate().find(|(_, v)| v.len() != dim) {
        return Err(BackendError::permanent(
            endpoint,
            format!("vector {} has length {}, expected {}", i, v.len(), dim),
        ));
    }
    if let Some((i, _)) = vectors.iter().enumerate().find(|(_, v)| v.iter().any(|x| !x.is_finite())) {
        return Err(BackendError::permanent(endpoint, format!("vector {i} contains non-finite values")));
    }
    Ok(match truncate_dim {
        Some(d) if d < dim => vectors.into_iter().map(|v| truncate_renormalize(v, d)).collect(),
        _ => vectors,
    })
}

/// Keep the first `d` components and rescale to unit L2 norm.
pub fn truncate_renormalize(mut v: Vec<f32>, d: usize) -> Vec<f32> {
    v.truncate(d);
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt() + 1e-12;
    for x in &mut v {
        *x /= norm;
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_flat_and_nested_shapes() {
        let flat = decode_vectors("e", json!([[1.0, 2.0], [3.0, 4.0]])).unwrap();
        assert_eq!(flat, vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        let nested = decode_vectors("e", json!([[[1.0, 2.0]], [[3.0, 4.0]]])).unwrap();
        assert_eq!(nested, flat);
    }

    #[test]
    fn malformed_bodies_are_permanent() {
        assert!(!decode_vectors("e", json!({"error": "x"})).unwrap_err().is_transient());
        assert!(!decode_vectors("e", json!([["a"]])).unwrap_err().is_transient());
        assert!(!decode_vectors("e", json!([1.0])).unwrap_err().is_transient());
    }

    #[test]
    fn count_and_length_are_enforced() {
        let two = vec![vec![0.0; 3], vec![0.0; 3]];
        assert!(validate_vectors("e", two.clone(), 2, 3, None).is_ok());
        assert!(validate_vectors("e", two.clone(), 3, 3, None).is_err());
        assert!(validate_vectors("e", two, 2, 4, None).is_err());
        assert!(validate_vectors("e", vec![vec![f32::NAN, 0.0, 0.0]], 1, 3, None).is_err());
    }

    #[test]
    fn truncation_renormalizes() {
        let out = validate_vectors("e", vec![vec![3.0, 4.0, 100.0]], 1, 3, Some(2)).unwrap();
        assert_eq!(out[0].len(), 2);
        assert!((out[0][0] - 0.6).abs() < 1e-6);
        assert!((out[0][1] - 0.8).abs() < 1e-6);
    }
}
