//! Unit conversion utilities for bone densitometry
//!
//! This module provides constants and conversion functions for the units
//! that appear when going from calibrated micro-CT voxels to homogenized
//! element properties, eliminating magic numbers throughout the codebase.

// ============================================================================
// Density
// ============================================================================

/// Mineral density of fully mineralized bone tissue (mg HA / cm³)
///
/// A voxel at this density has a bone volume fraction of one.
pub const FULL_BONE_DENSITY_MG_CM3: f64 = 1200.0;

/// Convert bone mineral density (mg HA / cm³) to bone volume fraction
///
/// # Examples
/// ```
/// use bone_hfe::utils::units::bmd_to_bvtv;
/// let bvtv = bmd_to_bvtv(600.0); // half mineralized
/// assert_eq!(bvtv, 0.5);
/// ```
#[inline]
pub fn bmd_to_bvtv(bmd: f64) -> f64 {
    bmd / FULL_BONE_DENSITY_MG_CM3
}

/// Convert bone volume fraction to bone mineral density (mg HA / cm³)
#[inline]
pub fn bvtv_to_bmd(bvtv: f64) -> f64 {
    bvtv * FULL_BONE_DENSITY_MG_CM3
}

// ============================================================================
// Length and volume
// ============================================================================

/// Cubic millimetres per cubic centimetre
pub const MM3_PER_CM3: f64 = 1000.0;

/// Micrometres per millimetre
pub const UM_PER_MM: f64 = 1000.0;

/// Convert micrometres to millimetres
#[inline]
pub fn um_to_mm(um: f64) -> f64 {
    um / UM_PER_MM
}

/// Convert millimetres to micrometres
#[inline]
pub fn mm_to_um(mm: f64) -> f64 {
    mm * UM_PER_MM
}

/// Convert a volume in mm³ to cm³
#[inline]
pub fn mm3_to_cm3(mm3: f64) -> f64 {
    mm3 / MM3_PER_CM3
}

// ============================================================================
// Mineral content
// ============================================================================

/// Bone mineral content (mg HA) of a region of given density and volume
///
/// # Examples
/// ```
/// use bone_hfe::utils::units::mineral_content_mg;
/// // 1 cm³ of fully mineralized bone
/// let bmc = mineral_content_mg(1200.0, 1000.0);
/// assert_eq!(bmc, 1200.0);
/// ```
#[inline]
pub fn mineral_content_mg(density_mg_cm3: f64, volume_mm3: f64) -> f64 {
    density_mg_cm3 * mm3_to_cm3(volume_mm3)
}

/// Round to a fixed number of decimal places
///
/// Used where calibrated quantities are defined at a given precision
/// (voxel spacing at five decimals, deck material constants).
#[inline]
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round_ties_even() / scale
}
