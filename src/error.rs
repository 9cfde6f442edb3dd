//! Error types for the preprocessing pipeline.
//!
//! Only fatal conditions live here. Numerical degeneracies (singular fabric
//! tensors, empty ROIs, out-of-range triangle mapping) are recovered in place
//! and counted in the run summary instead.

use thiserror::Error;

/// Errors that abort a preprocessing run.
#[derive(Debug, Error)]
pub enum HfeError {
    /// Underlying read or write failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Pixel format that is recognised but not decodable.
    #[error("Unsupported pixel format: {name} (type code {code})")]
    UnsupportedPixelFormat { code: i32, name: &'static str },

    /// Pixel format code that is not recognised at all.
    #[error("Unknown pixel format type code {0}")]
    UnknownPixelFormat(i32),

    /// File ended before the binary header or text log was complete.
    #[error("Truncated header: expected {expected} bytes, found {found}")]
    TruncatedHeader { expected: usize, found: usize },

    /// File ended before all voxels were read.
    #[error("Truncated voxel payload: expected {expected} bytes, found {found}")]
    TruncatedPayload { expected: usize, found: usize },

    /// Header field that cannot describe a valid volume.
    #[error("Corrupt header: {0}")]
    CorruptHeader(String),

    /// Calibration tag needed to convert native units is absent.
    #[error("Missing calibration tag '{0}' required for native image units")]
    MissingCalibration(&'static str),

    /// A voxel value cannot be represented in the requested pixel format.
    #[error("Voxel value {value} does not fit the {format} pixel format")]
    VoxelOutOfRange { value: i16, format: &'static str },

    /// Configuration rejected before any heavy computation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// TOML configuration could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Voxel label not covered by the declared material id range.
    #[error("Material id {label} outside declared range {min}..={max}")]
    MaterialIdOutOfRange { label: u32, min: u32, max: u32 },

    /// Mesh re-parse produced a different mesh than was generated.
    #[error("Mesh {what} count mismatch: generated {expected}, parsed {found}")]
    MeshCountMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    /// Mesh description text could not be parsed.
    #[error("Mesh deck line {line}: {message}")]
    DeckParse { line: usize, message: String },

    /// Images of one specimen do not share a grid.
    #[error("Image shape mismatch: {0}")]
    ShapeMismatch(String),

    /// No element holds any bone, so there is no model to write.
    #[error("No bone elements: the phase masks do not overlap the element grid")]
    EmptyModel,
}

/// Result type for preprocessing operations.
pub type HfeResult<T> = std::result::Result<T, HfeError>;
