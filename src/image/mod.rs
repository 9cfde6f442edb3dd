pub mod volume;
pub mod aim;
pub mod resample;

pub use volume::{Volume, SegmentationMask, Phase};
pub use aim::{AimImage, AimVersion, PixelFormat, Calibration, read_aim, write_aim, load_aim, save_aim, scanner_log};
pub use resample::{ZPolicy, ResampleTarget, coarsening_factor, adjust_size, crop_or_pad, resample, align_to};
