// affine.rs — 2D affine transform builder.
//
// Matrices are stored row-major as [a, b, tx, c, d, ty]:
//
//   | a  b  tx |   | x |
//   | c  d  ty | * | y |
//   | 0  0  1  |   | 1 |
//
// This is the forward transform (source → destination), the form the
// `affine_transform_2d` operation takes as its `matrix` parameter. The
// kernel inverts it once and samples the source at the inverse-mapped
// position of every output pixel.
//
// Builder calls append: `identity().translate(-cx, -cy).rotate(a)` first
// translates, then rotates.

use crate::error::Result;
use crate::params::invalid;

/// Operation the matrix parameter belongs to, for error messages.
const OP: &str = "affine_transform_2d";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform2D {
    m: [f64; 6],
}

impl Default for AffineTransform2D {
    fn default() -> Self {
        Self::identity()
    }
}

impl AffineTransform2D {
    pub fn identity() -> Self {
        AffineTransform2D { m: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0] }
    }

    /// From a row-major `[a, b, tx, c, d, ty]` matrix.
    pub fn from_matrix(m: [f64; 6]) -> Self {
        AffineTransform2D { m }
    }

    /// From an operation parameter; must hold exactly six finite values.
    pub fn from_params(values: &[f64]) -> Result<Self> {
        let m: [f64; 6] = values
            .try_into()
            .map_err(|_| invalid(OP, "matrix", &format!("expected 6 values, got {}", values.len())))?;
        if m.iter().any(|v| !v.is_finite()) {
            return Err(invalid(OP, "matrix", "contains a non-finite value"));
        }
        Ok(AffineTransform2D { m })
    }

    pub fn translation(dx: f64, dy: f64) -> Self {
        AffineTransform2D { m: [1.0, 0.0, dx, 0.0, 1.0, dy] }
    }

    /// Counter-clockwise rotation by `radians` about the origin (with y
    /// pointing down this turns clockwise on screen).
    pub fn rotation(radians: f64) -> Self {
        let (s, c) = radians.sin_cos();
        AffineTransform2D { m: [c, -s, 0.0, s, c, 0.0] }
    }

    pub fn scaling(sx: f64, sy: f64) -> Self {
        AffineTransform2D { m: [sx, 0.0, 0.0, 0.0, sy, 0.0] }
    }

    /// `next` applied after `self`.
    pub fn compose(&self, next: &AffineTransform2D) -> Self {
        let [a1, b1, t1, c1, d1, u1] = self.m;
        let [a2, b2, t2, c2, d2, u2] = next.m;
        AffineTransform2D {
            m: [
                a2 * a1 + b2 * c1,
                a2 * b1 + b2 * d1,
                a2 * t1 + b2 * u1 + t2,
                c2 * a1 + d2 * c1,
                c2 * b1 + d2 * d1,
                c2 * t1 + d2 * u1 + u2,
            ],
        }
    }

    pub fn translate(self, dx: f64, dy: f64) -> Self {
        self.compose(&Self::translation(dx, dy))
    }

    pub fn rotate(self, radians: f64) -> Self {
        self.compose(&Self::rotation(radians))
    }

    pub fn rotate_degrees(self, degrees: f64) -> Self {
        self.rotate(degrees.to_radians())
    }

    /// Rotate about `(cx, cy)` instead of the origin.
    pub fn rotate_about(self, radians: f64, cx: f64, cy: f64) -> Self {
        self.translate(-cx, -cy).rotate(radians).translate(cx, cy)
    }

    pub fn scale(self, sx: f64, sy: f64) -> Self {
        self.compose(&Self::scaling(sx, sy))
    }

    pub fn determinant(&self) -> f64 {
        self.m[0] * self.m[4] - self.m[1] * self.m[3]
    }

    /// # Errors
    /// `InvalidParameter` if the matrix is singular.
    pub fn inverse(&self) -> Result<Self> {
        let [a, b, tx, c, d, ty] = self.m;
        let det = self.determinant();
        if !det.is_finite() || det.abs() < 1e-12 {
            return Err(invalid(OP, "matrix", "matrix is not invertible"));
        }
        let inv_det = 1.0 / det;
        let ia = d * inv_det;
        let ib = -b * inv_det;
        let ic = -c * inv_det;
        let id = a * inv_det;
        Ok(AffineTransform2D {
            m: [ia, ib, -(ia * tx + ib * ty), ic, id, -(ic * tx + id * ty)],
        })
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let [a, b, tx, c, d, ty] = self.m;
        (a * x + b * y + tx, c * x + d * y + ty)
    }

    pub fn matrix(&self) -> [f64; 6] {
        self.m
    }

    /// The `matrix` parameter for `affine_transform_2d`.
    pub fn to_params(&self) -> Vec<f64> {
        self.m.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;

    fn close(a: (f64, f64), b: (f64, f64)) -> bool {
        (a.0 - b.0).abs() < 1e-9 && (a.1 - b.1).abs() < 1e-9
    }

    #[test]
    fn test_builder_order() {
        // Translate first, then scale: (1, 1) → (3, 3) → (6, 9).
        let t = AffineTransform2D::identity().translate(2.0, 2.0).scale(2.0, 3.0);
        assert!(close(t.apply(1.0, 1.0), (6.0, 9.0)));
    }

    #[test]
    fn test_rotate_about_centre_keeps_centre() {
        let t = AffineTransform2D::identity().rotate_about(0.7, 10.0, 20.0);
        assert!(close(t.apply(10.0, 20.0), (10.0, 20.0)));
        let q = AffineTransform2D::identity().rotate_degrees(90.0);
        assert!(close(q.apply(1.0, 0.0), (0.0, 1.0)));
    }

    #[test]
    fn test_inverse_round_trip() {
        let t = AffineTransform2D::identity().scale(2.0, 0.5).rotate(0.3).translate(5.0, -1.0);
        let inv = t.inverse().unwrap();
        let p = t.apply(3.0, 4.0);
        assert!(close(inv.apply(p.0, p.1), (3.0, 4.0)));
        let id = t.compose(&inv);
        assert!(close(id.apply(7.0, -2.0), (7.0, -2.0)));
    }

    #[test]
    fn test_singular_inverse() {
        let t = AffineTransform2D::scaling(0.0, 1.0);
        assert!(matches!(t.inverse(), Err(PipelineError::InvalidParameter { ref name, .. }) if name == "matrix"));
    }

    #[test]
    fn test_from_params_length() {
        assert!(AffineTransform2D::from_params(&[1.0, 0.0, 0.0, 0.0, 1.0]).is_err());
        assert!(AffineTransform2D::from_params(&[1.0, 0.0, 0.0, 0.0, 1.0, f64::NAN]).is_err());
        let t = AffineTransform2D::from_params(&[1.0, 0.0, 3.0, 0.0, 1.0, 4.0]).unwrap();
        assert_eq!(t, AffineTransform2D::translation(3.0, 4.0));
        assert_eq!(t.to_params(), vec![1.0, 0.0, 3.0, 0.0, 1.0, 4.0]);
    }
}
