//! Utility modules for bone preprocessing
//!
//! This module contains helper functions and utilities that are used
//! throughout the codebase.

pub mod units;

// Re-export commonly used items
pub use units::{
    bmd_to_bvtv, bvtv_to_bmd,
    um_to_mm, mm_to_um, mm3_to_cm3,
    mineral_content_mg, round_to,
};
