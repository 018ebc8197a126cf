/// Norms below this are treated as zero vectors.
pub const MIN_NORM: f32 = 1e-12;

pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale `v` to unit length in place. Returns `false` for (near) zero vectors,
/// which are left untouched.
pub fn l2_normalize(v: &mut [f32]) -> bool {
    let norm = l2_norm(v);
    if !norm.is_finite() || norm < MIN_NORM {
        return false;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_length_after_normalize() {
        let mut v = vec![3.0f32, 4.0];
        assert!(l2_normalize(&mut v));
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
        assert!((l2_norm(&v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_is_refused() {
        let mut v = vec![0.0f32; 8];
        assert!(!l2_normalize(&mut v));
    }
}
