//! Quadric error metric for surface simplification.
//!
//! A quadric accumulates squared distances to a set of planes. Summing the
//! quadrics of two vertices and minimising gives the position of the merged
//! vertex and the error of the collapse.

use nalgebra::{Matrix3, Point3, Vector3};

/// Symmetric 4x4 plane quadric, upper triangle stored row-wise:
///
/// ```text
/// [a b c d]
/// [  e f g]
/// [    h i]
/// [      j]
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Quadric {
    a: f64,
    b: f64,
    c: f64,
    d: f64,
    e: f64,
    f: f64,
    g: f64,
    h: f64,
    i: f64,
    j: f64,
}

impl Quadric {
    /// Quadric of the plane `n · x + d = 0` with unit normal `n`.
    pub fn from_plane(normal: &Vector3<f64>, d: f64) -> Self {
        let (a, b, c) = (normal.x, normal.y, normal.z);
        Self {
            a: a * a,
            b: a * b,
            c: a * c,
            d: a * d,
            e: b * b,
            f: b * c,
            g: b * d,
            h: c * c,
            i: c * d,
            j: d * d,
        }
    }

    /// Quadric of the plane through a triangle; `None` when it is degenerate.
    pub fn from_triangle(p0: &Point3<f64>, p1: &Point3<f64>, p2: &Point3<f64>) -> Option<Self> {
        let normal = (p1 - p0).cross(&(p2 - p0));
        let len = normal.norm();
        if len < 1e-12 {
            return None;
        }
        let n = normal / len;
        Some(Self::from_plane(&n, -n.dot(&p0.coords)))
    }

    pub fn add(&mut self, other: &Self) {
        self.a += other.a;
        self.b += other.b;
        self.c += other.c;
        self.d += other.d;
        self.e += other.e;
        self.f += other.f;
        self.g += other.g;
        self.h += other.h;
        self.i += other.i;
        self.j += other.j;
    }

    /// Sum of squared plane distances at `p`: `[p 1]ᵀ Q [p 1]`
    pub fn evaluate(&self, p: &Point3<f64>) -> f64 {
        let (x, y, z) = (p.x, p.y, p.z);
        x.mul_add(
            x.mul_add(self.a, 2.0 * y.mul_add(self.b, z.mul_add(self.c, self.d))),
            y.mul_add(
                y.mul_add(self.e, 2.0 * z.mul_add(self.f, self.g)),
                z.mul_add(z.mul_add(self.h, 2.0 * self.i), self.j),
            ),
        )
    }

    /// Position minimising the error, if the 3x3 system is well posed.
    pub fn optimal_point(&self) -> Option<Point3<f64>> {
        let m = Matrix3::new(
            self.a, self.b, self.c,
            self.b, self.e, self.f,
            self.c, self.f, self.h,
        );
        if m.determinant().abs() < 1e-10 {
            return None;
        }
        let rhs = Vector3::new(-self.d, -self.g, -self.i);
        m.try_inverse().map(|inv| Point3::from(inv * rhs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_plane_distance() {
        let q = Quadric::from_plane(&Vector3::z(), 0.0);
        assert_relative_eq!(q.evaluate(&Point3::new(1.0, 2.0, 0.0)), 0.0);
        assert_relative_eq!(q.evaluate(&Point3::new(0.0, 0.0, 2.0)), 4.0);
        assert!(Quadric::default().evaluate(&Point3::new(3.0, 1.0, 2.0)).abs() < 1e-15);
    }

    #[test]
    fn test_optimal_point_of_three_planes() {
        // x = 1, y = 2, z = 3
        let mut q = Quadric::from_plane(&Vector3::x(), -1.0);
        q.add(&Quadric::from_plane(&Vector3::y(), -2.0));
        q.add(&Quadric::from_plane(&Vector3::z(), -3.0));
        let p = q.optimal_point().unwrap();
        assert_relative_eq!(p.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(p.y, 2.0, epsilon = 1e-12);
        assert_relative_eq!(p.z, 3.0, epsilon = 1e-12);
        assert!(q.evaluate(&p).abs() < 1e-12);
    }

    #[test]
    fn test_single_plane_is_underdetermined() {
        let q = Quadric::from_triangle(
            &Point3::new(0.0, 0.0, 1.0),
            &Point3::new(1.0, 0.0, 1.0),
            &Point3::new(0.0, 1.0, 1.0),
        )
        .unwrap();
        assert!(q.optimal_point().is_none());
        assert_relative_eq!(q.evaluate(&Point3::new(5.0, 5.0, 3.0)), 4.0, epsilon = 1e-12);
    }
}
