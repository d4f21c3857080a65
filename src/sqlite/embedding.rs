//! Embedding BLOB conversion and vector similarity computation.

use crate::errors::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Convert a vector of f32 embedding values to a BLOB (little-endian bytes).
///
/// # Errors
///
/// Returns `Error::DimensionMismatch` if the vector length is not `dims`.
pub fn vec_to_blob(vec: &[f32], dims: usize) -> Result<Vec<u8>> {
    if vec.len() != dims {
        return Err(Error::DimensionMismatch {
            expected: dims,
            actual: vec.len(),
        });
    }
    Ok(vec.iter().flat_map(|&x| x.to_le_bytes()).collect())
}

/// Convert a BLOB (little-endian bytes) to a vector of f32 embedding values.
///
/// # Errors
///
/// Returns `Error::InvalidEmbedding` if the blob is not exactly `dims * 4` bytes.
pub fn blob_to_vec(blob: &[u8], dims: usize) -> Result<Vec<f32>> {
    if blob.len() != dims * 4 {
        return Err(Error::InvalidEmbedding(format!(
            "BLOB is {} bytes, expected {}",
            blob.len(),
            dims * 4
        )));
    }
    let mut vec = Vec::with_capacity(dims);
    for chunk in blob.chunks_exact(4) {
        let val = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        vec.push(val);
    }
    Ok(vec)
}

/// Reject empty vectors and NaN/infinite components.
pub fn check_finite(vec: &[f32]) -> Result<()> {
    if vec.is_empty() {
        return Err(Error::InvalidEmbedding("vector is empty".to_string()));
    }
    if vec.iter().any(|x| !x.is_finite()) {
        return Err(Error::InvalidEmbedding(
            "Vector contains NaN or infinite values".to_string(),
        ));
    }
    Ok(())
}

/// Compute cosine similarity between two embedding vectors.
///
/// Zero-norm vectors have similarity 0.0 with everything.
///
/// # Errors
///
/// - Returns `Error::InvalidEmbedding` if either vector is empty or non-finite.
/// - Returns `Error::DimensionMismatch` if vectors have different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64> {
    check_finite(a)?;
    check_finite(b)?;
    if a.len() != b.len() {
        return Err(Error::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as f64) * (*y as f64))
        .sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }

    Ok(dot / (norm_a * norm_b))
}

/// Euclidean distance between two vectors of equal length.
pub fn l2_distance(a: &[f32], b: &[f32]) -> Result<f64> {
    check_finite(a)?;
    check_finite(b)?;
    if a.len() != b.len() {
        return Err(Error::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    Ok(a.iter()
        .zip(b.iter())
        .map(|(x, y)| ((*x as f64) - (*y as f64)).powi(2))
        .sum::<f64>()
        .sqrt())
}
