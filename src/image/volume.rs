//! Dense voxel volumes.
//!
//! All volumes are stored x-fastest: the flat index of voxel `(x, y, z)` is
//! `x + nx * (y + ny * z)`. Axis 0 is x, axis 2 is the through-thickness
//! (proximal-distal) axis.

use nalgebra::{Point3, Vector3};

/// A 3-D scalar field on a regular grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume<T> {
    /// Voxel values, x-fastest
    pub data: Vec<T>,
    /// Extents in voxels along x, y, z
    pub dims: [usize; 3],
    /// Voxel spacing (mm)
    pub spacing: Vector3<f64>,
    /// Physical position of voxel (0, 0, 0) (mm)
    pub origin: Point3<f64>,
}

impl<T: Copy + Default> Volume<T> {
    /// Create a volume filled with `T::default()`.
    pub fn new(dims: [usize; 3], spacing: Vector3<f64>) -> Self {
        Self::filled(dims, spacing, T::default())
    }

    pub fn filled(dims: [usize; 3], spacing: Vector3<f64>, value: T) -> Self {
        Self {
            data: vec![value; dims[0] * dims[1] * dims[2]],
            dims,
            spacing,
            origin: Point3::origin(),
        }
    }

    /// Wrap existing x-fastest data. Returns `None` if the length is wrong.
    pub fn from_vec(data: Vec<T>, dims: [usize; 3], spacing: Vector3<f64>) -> Option<Self> {
        if data.len() != dims[0] * dims[1] * dims[2] {
            return None;
        }
        Some(Self {
            data,
            dims,
            spacing,
            origin: Point3::origin(),
        })
    }

    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        x + self.dims[0] * (y + self.dims[1] * z)
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> T {
        self.data[self.index(x, y, z)]
    }

    /// Bounds-checked access with signed indices.
    #[inline]
    pub fn get_checked(&self, x: isize, y: isize, z: isize) -> Option<T> {
        if x < 0 || y < 0 || z < 0 {
            return None;
        }
        let (x, y, z) = (x as usize, y as usize, z as usize);
        if x >= self.dims[0] || y >= self.dims[1] || z >= self.dims[2] {
            return None;
        }
        Some(self.get(x, y, z))
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, z: usize, value: T) {
        let idx = self.index(x, y, z);
        self.data[idx] = value;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Volume of one voxel (mm³)
    pub fn voxel_volume(&self) -> f64 {
        self.spacing.x * self.spacing.y * self.spacing.z
    }

    /// Physical extent along each axis (mm)
    pub fn physical_size(&self) -> Vector3<f64> {
        Vector3::new(
            self.dims[0] as f64 * self.spacing.x,
            self.dims[1] as f64 * self.spacing.y,
            self.dims[2] as f64 * self.spacing.z,
        )
    }

    /// Apply `f` voxel-wise, keeping the grid.
    pub fn map<U, F>(&self, f: F) -> Volume<U>
    where
        U: Copy + Default,
        F: Fn(T) -> U,
    {
        Volume {
            data: self.data.iter().map(|&v| f(v)).collect(),
            dims: self.dims,
            spacing: self.spacing,
            origin: self.origin,
        }
    }

    /// Combine two volumes on the same grid voxel-wise.
    pub fn zip_map<U, V, F>(&self, other: &Volume<U>, f: F) -> Option<Volume<V>>
    where
        U: Copy + Default,
        V: Copy + Default,
        F: Fn(T, U) -> V,
    {
        if self.dims != other.dims {
            return None;
        }
        Some(Volume {
            data: self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(&a, &b)| f(a, b))
                .collect(),
            dims: self.dims,
            spacing: self.spacing,
            origin: self.origin,
        })
    }

    /// True when both volumes share extents and (to 1e-9 mm) spacing.
    pub fn same_grid<U>(&self, other: &Volume<U>) -> bool {
        self.dims == other.dims && (self.spacing - other.spacing).amax() < 1e-9
    }
}

impl Volume<f64> {
    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }
}

impl Volume<u8> {
    /// Number of non-zero voxels
    pub fn count_nonzero(&self) -> usize {
        self.data.iter().filter(|&&v| v != 0).count()
    }
}

/// Bone phase labels carried by a segmentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Background,
    Trabecular,
    Cortical,
}

impl Phase {
    pub fn label(self) -> u8 {
        match self {
            Phase::Background => 0,
            Phase::Trabecular => 1,
            Phase::Cortical => 2,
        }
    }
}

/// Segmentation gray value for cortical bone in scanner exports
pub const SEG_GRAY_CORTICAL: i16 = 127;
/// Segmentation gray value for trabecular bone in scanner exports
pub const SEG_GRAY_TRABECULAR: i16 = 126;

/// Tri-valued bone segmentation aligned 1:1 with a density volume.
///
/// 0 is background, 1 trabecular, 2 cortical. Other non-zero labels are
/// bone of unspecified phase.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationMask {
    pub labels: Volume<u8>,
}

impl SegmentationMask {
    /// Build from raw scanner gray values (127 cortical, 126 trabecular).
    pub fn from_gray_values(gray: &Volume<i16>) -> Self {
        let labels = gray.map(|v| match v {
            SEG_GRAY_CORTICAL => Phase::Cortical.label(),
            SEG_GRAY_TRABECULAR => Phase::Trabecular.label(),
            0 => Phase::Background.label(),
            v if v > 0 && v <= u8::MAX as i16 => v as u8,
            _ => 3,
        });
        Self { labels }
    }

    pub fn from_labels(labels: Volume<u8>) -> Self {
        Self { labels }
    }

    /// Any non-zero label becomes bone (1).
    pub fn binarized(&self) -> Volume<u8> {
        self.labels.map(|v| u8::from(v != 0))
    }

    /// Bone voxels that also lie inside `mask`.
    pub fn restricted_to(&self, mask: &Volume<u8>) -> Option<Volume<u8>> {
        self.labels
            .zip_map(mask, |s, m| u8::from(s != 0 && m != 0))
    }

    pub fn dims(&self) -> [usize; 3] {
        self.labels.dims
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indexing_is_x_fastest() {
        let mut vol: Volume<u8> = Volume::new([3, 4, 5], Vector3::new(1.0, 1.0, 1.0));
        vol.set(2, 1, 0, 7);
        assert_eq!(vol.data[2 + 3], 7);
        vol.set(0, 0, 1, 9);
        assert_eq!(vol.data[12], 9);
        assert_eq!(vol.get_checked(-1, 0, 0), None);
        assert_eq!(vol.get_checked(0, 0, 5), None);
        assert_eq!(vol.get_checked(0, 0, 1), Some(9));
    }

    #[test]
    fn test_segmentation_gray_values() {
        let gray = Volume::from_vec(vec![0i16, 126, 127, 5], [4, 1, 1], Vector3::new(1.0, 1.0, 1.0))
            .unwrap();
        let seg = SegmentationMask::from_gray_values(&gray);
        assert_eq!(seg.labels.data, vec![0, 1, 2, 5]);
        assert_eq!(seg.binarized().data, vec![0, 1, 1, 1]);
    }

    #[test]
    fn test_zip_map_requires_same_dims() {
        let a: Volume<u8> = Volume::new([2, 2, 2], Vector3::new(1.0, 1.0, 1.0));
        let b: Volume<u8> = Volume::new([2, 2, 3], Vector3::new(1.0, 1.0, 1.0));
        assert!(a.zip_map(&b, |x, y| x + y).is_none());
    }
}
