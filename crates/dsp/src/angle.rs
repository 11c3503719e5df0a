use num_complex::Complex32;

/// An angle in turns (cycles), kept in the half-open interval [-0.5, 0.5).
///
/// Storing phases as fractional turns makes normalisation a single
/// subtraction and keeps repeated additions cheap in the tracking loop.
pub type DeciAngle = f32;

/// Normalise an angle in turns to [-0.5, 0.5).
///
/// Floor-based so that the upper bound stays exclusive for every input,
/// including exact half-integers.
pub fn normalize_deciangle(angle: DeciAngle) -> DeciAngle {
    angle - (angle + 0.5).floor()
}

/// Complex argument of `z` as a normalised DeciAngle.
pub fn arg_to_deciangle(z: Complex32) -> DeciAngle {
    normalize_deciangle(z.arg() / (2.0 * std::f32::consts::PI))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_range() {
        let inputs = [
            0.0f32, 0.25, -0.25, 0.5, -0.5, 0.75, -0.75, 1.0, -1.0, 1.5, -1.5, 2.3, -2.3, 17.49,
            -17.51, 123.456, -123.456,
        ];
        for &a in &inputs {
            let n = normalize_deciangle(a);
            assert!(
                (-0.5..0.5).contains(&n),
                "normalize_deciangle({}) = {} out of range",
                a,
                n
            );
        }
    }

    #[test]
    fn test_normalize_identity_in_range() {
        for &a in &[0.0f32, 0.1, -0.1, 0.499, -0.5] {
            assert_eq!(normalize_deciangle(a), a);
        }
    }

    #[test]
    fn test_normalize_half_turn_wraps_down() {
        // +0.5 turns is the excluded endpoint and must wrap to -0.5.
        assert_eq!(normalize_deciangle(0.5), -0.5);
        assert_eq!(normalize_deciangle(1.5), -0.5);
    }

    #[test]
    fn test_normalize_subtracts_whole_turns() {
        assert!((normalize_deciangle(1.25) - 0.25).abs() < 1e-6);
        assert!((normalize_deciangle(-1.25) + 0.25).abs() < 1e-6);
        assert!((normalize_deciangle(3.1) - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_arg_to_deciangle() {
        assert!(arg_to_deciangle(Complex32::new(1.0, 0.0)).abs() < 1e-6);
        assert!((arg_to_deciangle(Complex32::new(0.0, 1.0)) - 0.25).abs() < 1e-6);
        // arg of -1 is pi, i.e. +0.5 turns, which normalises to -0.5.
        assert!((arg_to_deciangle(Complex32::new(-1.0, 0.0)) + 0.5).abs() < 1e-6);
    }
}
