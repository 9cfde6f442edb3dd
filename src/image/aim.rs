//! AIM volumetric image codec.
//!
//! An AIM file is a binary header, a free-text processing log and a raw voxel
//! payload. Two header versions exist:
//!
//! | version | marker                          | header | type slot | log length     | extents            |
//! |---------|---------------------------------|--------|-----------|----------------|--------------------|
//! | 020     | int slot 5 == 16                | 160 B  | int 10    | int 2          | int 14, 15, 16     |
//! | 030     | magic `AIMDATA_V030   \0`       | 280 B  | int 17    | i64 at byte 32 | i64 at 96, 104, 112 |
//!
//! The payload is raster ordered (x fastest) with the header extents. Decoded
//! volumes have their y axis mirrored relative to the file so that every
//! consumer sees the same anatomical orientation; the encoder undoes this.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use nalgebra::Vector3;
use tracing::{debug, warn};

use super::volume::Volume;
use crate::error::{HfeError, HfeResult};
use crate::utils::units::{round_to, um_to_mm};

const HEADER_INTS: usize = 32;
const V020_HEADER_BYTES: usize = 160;
const V030_HEADER_BYTES: usize = 280;
const V020_MARKER: i32 = 16;
const V030_MAGIC: &[u8; 16] = b"AIMDATA_V030   \0";

const TYPE_SHORT: i32 = 131_074;
const TYPE_CHAR: i32 = 65_537;
const TYPE_BIN_COMPRESSED: i32 = 1_376_257;

/// Header layout version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AimVersion {
    V020,
    V030,
}

/// Supported voxel element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit signed
    Char,
    /// 16-bit signed
    Short,
}

impl PixelFormat {
    fn from_code(code: i32) -> HfeResult<Self> {
        match code {
            TYPE_SHORT => Ok(PixelFormat::Short),
            TYPE_CHAR => Ok(PixelFormat::Char),
            TYPE_BIN_COMPRESSED => Err(HfeError::UnsupportedPixelFormat {
                code,
                name: "bin compressed",
            }),
            other => Err(HfeError::UnknownPixelFormat(other)),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            PixelFormat::Short => TYPE_SHORT,
            PixelFormat::Char => TYPE_CHAR,
        }
    }

    pub fn bytes_per_voxel(self) -> usize {
        match self {
            PixelFormat::Short => 2,
            PixelFormat::Char => 1,
        }
    }

    fn name(self) -> &'static str {
        match self {
            PixelFormat::Short => "short",
            PixelFormat::Char => "char",
        }
    }
}

/// Calibration recovered from the processing log.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    /// Scanner attenuation scaling ("Scaled by factor")
    pub scaling: Option<f64>,
    /// Density calibration slope
    pub slope: Option<f64>,
    /// Density calibration intercept
    pub intercept: Option<f64>,
    /// Isotropic scale applied after reconstruction
    pub post_scan_scale: f64,
    /// Original reconstruction extents in voxels
    pub original_dims_voxels: Option<[f64; 3]>,
    /// Original reconstruction extents in micrometres
    pub original_dims_um: Option<[f64; 3]>,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            scaling: None,
            slope: None,
            intercept: None,
            post_scan_scale: 1.0,
            original_dims_voxels: None,
            original_dims_um: None,
        }
    }
}

impl Calibration {
    /// Scan the processing log for calibration tags; unknown lines are ignored.
    pub fn from_log(log: &str) -> Self {
        let mut cal = Calibration::default();
        for line in log.lines() {
            if line.contains("Orig-ISQ-Dim-p") || line.contains("Orig-GOBJ-Dim-p") {
                cal.original_dims_voxels = numeric_triplet(line);
            } else if line.contains("Orig-ISQ-Dim-um") || line.contains("Orig-GOBJ-Dim-um") {
                cal.original_dims_um = numeric_triplet(line);
            } else if line.contains("Scaled by factor") {
                cal.scaling = last_number(line);
            } else if line.contains("Density: intercept") {
                cal.intercept = last_number(line);
            } else if line.contains("Density: slope") {
                cal.slope = last_number(line);
            } else if line.contains("scale") && !line.contains("downscaled") {
                match last_number(line) {
                    Some(scale) => cal.post_scan_scale = scale,
                    None => warn!(line, "Ignoring scale line without numeric value"),
                }
            }
        }
        cal
    }

    /// Voxel spacing implied by the original extents, if both tags were present.
    pub fn derived_spacing(&self) -> Option<Vector3<f64>> {
        let p = self.original_dims_voxels?;
        let um = self.original_dims_um?;
        if p.iter().any(|&v| v <= 0.0) {
            return None;
        }
        let axis = |i: usize| self.post_scan_scale * round_to(um_to_mm(um[i] / p[i]), 5);
        Some(Vector3::new(axis(0), axis(1), axis(2)))
    }
}

fn numeric_triplet(line: &str) -> Option<[f64; 3]> {
    let values: Vec<f64> = line
        .split_whitespace()
        .filter_map(|tok| tok.parse::<f64>().ok())
        .collect();
    if values.len() < 3 {
        return None;
    }
    Some([values[0], values[1], values[2]])
}

fn last_number(line: &str) -> Option<f64> {
    line.split_whitespace().last()?.parse().ok()
}

/// A decoded AIM image.
#[derive(Debug, Clone, PartialEq)]
pub struct AimImage {
    /// Voxels in pipeline orientation; 8-bit images are widened losslessly
    pub voxels: Volume<i16>,
    pub pixel_format: PixelFormat,
    pub calibration: Calibration,
    /// Raw processing log
    pub log: String,
}

impl AimImage {
    /// Wrap a volume for encoding, deriving the calibration from `log`.
    pub fn new(voxels: Volume<i16>, pixel_format: PixelFormat, log: String) -> Self {
        Self {
            calibration: Calibration::from_log(&log),
            voxels,
            pixel_format,
            log,
        }
    }

    pub fn spacing(&self) -> Vector3<f64> {
        self.voxels.spacing
    }

    /// Log lines that carried a calibration tag.
    pub fn calibration_lines(&self) -> Vec<&str> {
        const TAGS: [&str; 6] = [
            "Orig-ISQ-Dim",
            "Orig-GOBJ-Dim",
            "Scaled by factor",
            "Density: slope",
            "Density: intercept",
            "scale",
        ];
        self.log
            .lines()
            .filter(|line| TAGS.iter().any(|tag| line.contains(tag)))
            .collect()
    }
}

/// Processing log carrying the calibration tags the decoder understands.
pub fn scanner_log(dims: [usize; 3], spacing: Vector3<f64>, scaling: f64, slope: f64, intercept: f64) -> String {
    let um = |i: usize| spacing[i] * 1000.0 * dims[i] as f64;
    format!(
        "!\n! Processing Log\n!\n!-------------------------------------------------------------------------------\n\
         Created by                    bone_hfe\n\
         Orig-ISQ-Dim-p                {} {} {}\n\
         Orig-ISQ-Dim-um               {} {} {}\n\
         Scaled by factor              {}\n\
         Density: slope                {}\n\
         Density: intercept            {}\n",
        dims[0], dims[1], dims[2], um(0), um(1), um(2), scaling, slope, intercept
    )
}

/// Decode an AIM stream.
///
/// `fallback_spacing` is kept when the log lacks the original-dimension tags.
pub fn read_aim<R: Read>(reader: &mut R, fallback_spacing: Vector3<f64>) -> HfeResult<AimImage> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    decode(&bytes, fallback_spacing)
}

/// Decode an AIM file from disk.
pub fn load_aim<P: AsRef<Path>>(path: P, fallback_spacing: Vector3<f64>) -> HfeResult<AimImage> {
    let mut reader = BufReader::new(File::open(path)?);
    read_aim(&mut reader, fallback_spacing)
}

/// Encode an AIM file to disk.
pub fn save_aim<P: AsRef<Path>>(path: P, image: &AimImage, version: AimVersion) -> HfeResult<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_aim(&mut writer, image, version)?;
    writer.flush()?;
    Ok(())
}

struct Header {
    version: AimVersion,
    pixel_format: PixelFormat,
    header_bytes: usize,
    log_len: usize,
    dims: [usize; 3],
}

fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    i32::from_le_bytes(buf)
}

fn read_i64(bytes: &[u8], offset: usize) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    i64::from_le_bytes(buf)
}

fn non_negative(value: i64, field: &str) -> HfeResult<usize> {
    usize::try_from(value).map_err(|_| HfeError::CorruptHeader(format!("negative {field}: {value}")))
}

fn parse_header(bytes: &[u8]) -> HfeResult<Header> {
    if bytes.len() < HEADER_INTS * 4 {
        return Err(HfeError::TruncatedHeader {
            expected: HEADER_INTS * 4,
            found: bytes.len(),
        });
    }
    let int = |slot: usize| read_i32(bytes, slot * 4);

    if int(5) == V020_MARKER {
        if bytes.len() < V020_HEADER_BYTES {
            return Err(HfeError::TruncatedHeader {
                expected: V020_HEADER_BYTES,
                found: bytes.len(),
            });
        }
        let pixel_format = PixelFormat::from_code(int(10))?;
        Ok(Header {
            version: AimVersion::V020,
            pixel_format,
            header_bytes: V020_HEADER_BYTES,
            log_len: non_negative(int(2) as i64, "log length")?,
            dims: [
                non_negative(int(14) as i64, "x extent")?,
                non_negative(int(15) as i64, "y extent")?,
                non_negative(int(16) as i64, "z extent")?,
            ],
        })
    } else if bytes.starts_with(V030_MAGIC) {
        if bytes.len() < V030_HEADER_BYTES {
            return Err(HfeError::TruncatedHeader {
                expected: V030_HEADER_BYTES,
                found: bytes.len(),
            });
        }
        let pixel_format = PixelFormat::from_code(int(17))?;
        Ok(Header {
            version: AimVersion::V030,
            pixel_format,
            header_bytes: V030_HEADER_BYTES,
            log_len: non_negative(read_i64(bytes, 32), "log length")?,
            dims: [
                non_negative(read_i64(bytes, 96), "x extent")?,
                non_negative(read_i64(bytes, 104), "y extent")?,
                non_negative(read_i64(bytes, 112), "z extent")?,
            ],
        })
    } else {
        Err(HfeError::CorruptHeader(
            "no recognised AIM version marker".to_string(),
        ))
    }
}

fn decode(bytes: &[u8], fallback_spacing: Vector3<f64>) -> HfeResult<AimImage> {
    let header = parse_header(bytes)?;
    let log_end = header
        .header_bytes
        .checked_add(header.log_len)
        .ok_or_else(|| HfeError::CorruptHeader(format!("log length {} overflows", header.log_len)))?;
    if bytes.len() < log_end {
        return Err(HfeError::TruncatedHeader {
            expected: log_end,
            found: bytes.len(),
        });
    }
    let log = String::from_utf8_lossy(&bytes[header.header_bytes..log_end]).into_owned();

    let [nx, ny, nz] = header.dims;
    let bpv = header.pixel_format.bytes_per_voxel();
    let payload_len = nx
        .checked_mul(ny)
        .and_then(|n| n.checked_mul(nz))
        .and_then(|n| n.checked_mul(bpv))
        .ok_or_else(|| HfeError::CorruptHeader(format!("extents {:?} overflow", header.dims)))?;
    let payload_end = log_end
        .checked_add(payload_len)
        .ok_or_else(|| HfeError::CorruptHeader(format!("payload of {payload_len} bytes overflows")))?;
    if bytes.len() < payload_end {
        return Err(HfeError::TruncatedPayload {
            expected: payload_len,
            found: bytes.len() - log_end,
        });
    }
    let payload = &bytes[log_end..payload_end];

    let calibration = Calibration::from_log(&log);
    let spacing = calibration.derived_spacing().unwrap_or(fallback_spacing);

    let mut voxels: Volume<i16> = Volume::new(header.dims, spacing);
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                let raster = x + nx * (y + ny * z);
                let value = match header.pixel_format {
                    PixelFormat::Short => {
                        i16::from_le_bytes([payload[2 * raster], payload[2 * raster + 1]])
                    }
                    PixelFormat::Char => i16::from(payload[raster] as i8),
                };
                voxels.set(x, ny - 1 - y, z, value);
            }
        }
    }

    debug!(
        version = ?header.version,
        format = header.pixel_format.name(),
        nx,
        ny,
        nz,
        "Decoded AIM image"
    );

    Ok(AimImage {
        voxels,
        pixel_format: header.pixel_format,
        calibration,
        log,
    })
}

/// Encode an image in the given header version.
pub fn write_aim<W: Write>(writer: &mut W, image: &AimImage, version: AimVersion) -> HfeResult<()> {
    let [nx, ny, nz] = image.voxels.dims;
    let bpv = image.pixel_format.bytes_per_voxel();
    let log = image.log.as_bytes();

    let mut payload = Vec::with_capacity(nx * ny * nz * bpv);
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                let value = image.voxels.get(x, ny - 1 - y, z);
                match image.pixel_format {
                    PixelFormat::Short => payload.extend_from_slice(&value.to_le_bytes()),
                    PixelFormat::Char => {
                        let v = i8::try_from(value).map_err(|_| HfeError::VoxelOutOfRange {
                            value,
                            format: "char",
                        })?;
                        payload.push(v as u8);
                    }
                }
            }
        }
    }

    let header = match version {
        AimVersion::V020 => {
            let mut h = vec![0u8; V020_HEADER_BYTES];
            let mut put = |slot: usize, v: i32| h[slot * 4..slot * 4 + 4].copy_from_slice(&v.to_le_bytes());
            put(0, 20);
            put(1, 140);
            put(2, log.len() as i32);
            put(3, payload.len() as i32);
            put(5, V020_MARKER);
            put(10, image.pixel_format.code());
            put(14, nx as i32);
            put(15, ny as i32);
            put(16, nz as i32);
            h
        }
        AimVersion::V030 => {
            let mut h = vec![0u8; V030_HEADER_BYTES];
            h[..16].copy_from_slice(V030_MAGIC);
            let mut put64 = |offset: usize, v: i64| h[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
            put64(16, 40);
            put64(24, (V030_HEADER_BYTES - 40) as i64);
            put64(32, log.len() as i64);
            put64(40, payload.len() as i64);
            put64(96, nx as i64);
            put64(104, ny as i64);
            put64(112, nz as i64);
            h[68..72].copy_from_slice(&image.pixel_format.code().to_le_bytes());
            h
        }
    };

    writer.write_all(&header)?;
    writer.write_all(log)?;
    writer.write_all(&payload)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn synthetic(format: PixelFormat) -> AimImage {
        let dims = [4, 3, 2];
        let spacing = Vector3::new(0.0607, 0.0607, 0.0607);
        let data: Vec<i16> = (0..24).map(|i| (i * 5 - 40) as i16).collect();
        let voxels = Volume::from_vec(data, dims, spacing).unwrap();
        AimImage::new(voxels, format, scanner_log(dims, spacing, 8192.0, 1603.51904, -391.209015))
    }

    #[test]
    fn test_round_trip_both_versions() {
        for version in [AimVersion::V020, AimVersion::V030] {
            for format in [PixelFormat::Short, PixelFormat::Char] {
                let image = synthetic(format);
                let mut bytes = Vec::new();
                write_aim(&mut bytes, &image, version).unwrap();
                let decoded = read_aim(&mut bytes.as_slice(), Vector3::new(1.0, 1.0, 1.0)).unwrap();
                assert_eq!(decoded.voxels.data, image.voxels.data);
                assert_eq!(decoded.voxels.dims, image.voxels.dims);
                assert_eq!(decoded.pixel_format, format);
                assert_relative_eq!(decoded.spacing().x, 0.0607, epsilon = 1e-12);
                assert_eq!(decoded.calibration.scaling, Some(8192.0));
                assert_eq!(decoded.calibration.slope, Some(1603.51904));
                assert_eq!(decoded.calibration.intercept, Some(-391.209015));
            }
        }
    }

    #[test]
    fn test_y_axis_is_mirrored() {
        let image = synthetic(PixelFormat::Short);
        let mut bytes = Vec::new();
        write_aim(&mut bytes, &image, AimVersion::V020).unwrap();
        let payload = &bytes[V020_HEADER_BYTES + image.log.len()..];
        // file voxel (0, 0, 0) is pipeline voxel (0, ny - 1, 0)
        let first = i16::from_le_bytes([payload[0], payload[1]]);
        assert_eq!(first, image.voxels.get(0, 2, 0));
    }

    #[test]
    fn test_missing_tags_keep_fallback_spacing() {
        let voxels = Volume::from_vec(vec![1i16; 8], [2, 2, 2], Vector3::new(1.0, 1.0, 1.0)).unwrap();
        let image = AimImage::new(voxels, PixelFormat::Short, "no tags here\n".to_string());
        let mut bytes = Vec::new();
        write_aim(&mut bytes, &image, AimVersion::V030).unwrap();
        let fallback = Vector3::new(0.082, 0.082, 0.082);
        let decoded = read_aim(&mut bytes.as_slice(), fallback).unwrap();
        assert_eq!(decoded.spacing(), fallback);
        assert_eq!(decoded.calibration.scaling, None);
    }

    #[test]
    fn test_post_scan_scale_applies() {
        let log = "Orig-ISQ-Dim-p 10 10 10\nOrig-ISQ-Dim-um 820 820 820\nIPL post-scan scale 2.0\nwas downscaled by 4\n";
        let cal = Calibration::from_log(log);
        assert_eq!(cal.post_scan_scale, 2.0);
        let spacing = cal.derived_spacing().unwrap();
        assert_relative_eq!(spacing.z, 0.164, epsilon = 1e-12);
    }

    #[test]
    fn test_compressed_format_is_fatal() {
        let image = synthetic(PixelFormat::Short);
        let mut bytes = Vec::new();
        write_aim(&mut bytes, &image, AimVersion::V020).unwrap();
        bytes[40..44].copy_from_slice(&TYPE_BIN_COMPRESSED.to_le_bytes());
        let err = read_aim(&mut bytes.as_slice(), Vector3::new(1.0, 1.0, 1.0)).unwrap_err();
        assert!(matches!(err, HfeError::UnsupportedPixelFormat { .. }));

        bytes[40..44].copy_from_slice(&42i32.to_le_bytes());
        let err = read_aim(&mut bytes.as_slice(), Vector3::new(1.0, 1.0, 1.0)).unwrap_err();
        assert!(matches!(err, HfeError::UnknownPixelFormat(42)));
    }

    #[test]
    fn test_truncated_inputs_are_fatal() {
        let image = synthetic(PixelFormat::Short);
        let mut bytes = Vec::new();
        write_aim(&mut bytes, &image, AimVersion::V030).unwrap();

        let err = read_aim(&mut &bytes[..100], Vector3::new(1.0, 1.0, 1.0)).unwrap_err();
        assert!(matches!(err, HfeError::TruncatedHeader { .. }));

        let err = read_aim(&mut &bytes[..bytes.len() - 3], Vector3::new(1.0, 1.0, 1.0)).unwrap_err();
        assert!(matches!(err, HfeError::TruncatedPayload { .. }));
    }

    #[test]
    fn test_oversized_extents_are_corrupt() {
        let image = synthetic(PixelFormat::Short);
        let mut bytes = Vec::new();
        write_aim(&mut bytes, &image, AimVersion::V030).unwrap();
        for offset in [96, 104, 112] {
            bytes[offset..offset + 8].copy_from_slice(&(1i64 << 40).to_le_bytes());
        }
        let err = read_aim(&mut bytes.as_slice(), Vector3::new(1.0, 1.0, 1.0)).unwrap_err();
        assert!(matches!(err, HfeError::CorruptHeader(_)));

        // Fits in usize but exceeds the file
        for (offset, n) in [(96, 1i64 << 20), (104, 1), (112, 1)] {
            bytes[offset..offset + 8].copy_from_slice(&n.to_le_bytes());
        }
        let err = read_aim(&mut bytes.as_slice(), Vector3::new(1.0, 1.0, 1.0)).unwrap_err();
        assert!(matches!(err, HfeError::TruncatedPayload { .. }));
    }

    #[test]
    fn test_char_out_of_range_rejected() {
        let voxels = Volume::from_vec(vec![300i16], [1, 1, 1], Vector3::new(1.0, 1.0, 1.0)).unwrap();
        let image = AimImage::new(voxels, PixelFormat::Char, String::new());
        let mut bytes = Vec::new();
        assert!(matches!(
            write_aim(&mut bytes, &image, AimVersion::V020),
            Err(HfeError::VoxelOutOfRange { value: 300, .. })
        ));
    }
}
