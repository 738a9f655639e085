//! Raw tensor files.
//!
//! Tensors are header-less row-major arrays of little-endian `f32`. The
//! caller supplies the shape; a file whose byte count does not match it
//! exactly is rejected before any device work starts.

use halocorr_core::{Error, FrameShape, HaloExtents, HaloKernel, ImageBatch, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::debug;

const F32_BYTES: usize = std::mem::size_of::<f32>();

/// Decode little-endian `f32` values. Trailing bytes that do not form a
/// whole value are ignored.
pub fn decode_f32_le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(F32_BYTES)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Encode values as little-endian `f32` bytes.
pub fn encode_f32_le(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Read exactly `len` values from `path`.
pub fn read_f32_file(path: impl AsRef<Path>, len: usize) -> Result<Vec<f32>> {
    let path = path.as_ref();
    let expected = len
        .checked_mul(F32_BYTES)
        .ok_or_else(|| Error::precondition(format!("{len} values do not fit in memory")))?
        as u64;
    let file = File::open(path)?;
    let actual = file.metadata()?.len();
    if actual != expected {
        return Err(Error::size_mismatch(path.display().to_string(), expected, actual));
    }

    let mut bytes = Vec::with_capacity(expected as usize);
    BufReader::new(file).read_to_end(&mut bytes)?;
    if bytes.len() as u64 != expected {
        // File changed between stat and read.
        return Err(Error::size_mismatch(
            path.display().to_string(),
            expected,
            bytes.len() as u64,
        ));
    }
    debug!("read {} values from {}", len, path.display());
    Ok(decode_f32_le(&bytes))
}

/// Write `values` to `path`, replacing any existing file.
pub fn write_f32_file(path: impl AsRef<Path>, values: &[f32]) -> Result<()> {
    let path = path.as_ref();
    let mut writer = BufWriter::new(File::create(path)?);
    for value in values {
        writer.write_all(&value.to_le_bytes())?;
    }
    writer.flush()?;
    debug!("wrote {} values to {}", values.len(), path.display());
    Ok(())
}

/// Load `count` frames of `frame` pixels.
pub fn load_batch(path: impl AsRef<Path>, frame: FrameShape, count: usize) -> Result<ImageBatch> {
    if count == 0 {
        return Err(Error::precondition("number of images must be at least 1"));
    }
    if frame.is_empty() {
        return Err(Error::precondition(format!("frame shape {frame} has no pixels")));
    }
    let len = frame
        .len()
        .checked_mul(count)
        .ok_or_else(|| Error::precondition(format!("{count} frames of {frame} do not fit in memory")))?;
    let data = read_f32_file(path, len)?;
    ImageBatch::new(frame, data)
}

/// Load a `(L0+R0+1) × (L1+R1+1)` coefficient window.
pub fn load_halo(path: impl AsRef<Path>, extents: HaloExtents) -> Result<HaloKernel> {
    extents.validate()?;
    let coefficients = read_f32_file(path, extents.footprint())?;
    HaloKernel::new(extents, coefficients)
}

#[cfg(test)]
mod tests {
    use super::*;
    use halocorr_core::ErrorClass;
    use tempfile::tempdir;

    #[test]
    fn test_encode_layout() {
        let bytes = encode_f32_le(&[1.0, -2.5]);
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
        assert_eq!(decode_f32_le(&bytes), vec![1.0, -2.5]);
    }

    #[test]
    fn test_file_roundtrip_is_bit_exact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("images_out.dat");
        let values = vec![0.0, -0.0, f32::MIN_POSITIVE, 1.0e-40, f32::MAX, 3.25];

        write_f32_file(&path, &values).unwrap();
        let back = read_f32_file(&path, values.len()).unwrap();

        let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&back), bits(&values));
    }

    #[test]
    fn test_size_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.dat");
        std::fs::write(&path, [0u8; 10]).unwrap();

        let err = read_f32_file(&path, 3).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Precondition);
        assert!(matches!(
            err,
            Error::SizeMismatch {
                expected: 12,
                actual: 10,
                ..
            }
        ));
    }

    #[test]
    fn test_load_batch_and_halo() {
        let dir = tempdir().unwrap();
        let frame = FrameShape::new(2, 3);
        let images = dir.path().join("images_in.dat");
        write_f32_file(&images, &(0..12).map(|v| v as f32).collect::<Vec<_>>()).unwrap();

        let batch = load_batch(&images, frame, 2).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.image(1), &[6.0, 7.0, 8.0, 9.0, 10.0, 11.0]);
        assert!(load_batch(&images, frame, 3).is_err());
        assert!(load_batch(&images, frame, 0).is_err());

        let coeffs = dir.path().join("kernel_in.dat");
        let identity = HaloKernel::identity(HaloExtents::uniform(1));
        write_f32_file(&coeffs, identity.coefficients()).unwrap();
        assert_eq!(load_halo(&coeffs, HaloExtents::uniform(1)).unwrap(), identity);
        assert!(load_halo(&coeffs, HaloExtents::new(1, 1, 0, 1)).is_err());
    }

    #[test]
    fn test_oversized_shapes_are_preconditions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kernel_in.dat");
        std::fs::write(&path, [0u8; 4]).unwrap();

        let err = load_halo(&path, HaloExtents::new(u32::MAX, 0, 0, 0)).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Precondition);
        let err = read_f32_file(&path, usize::MAX).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Precondition);
        let err = load_batch(&path, FrameShape::new(2, 2), usize::MAX).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Precondition);
    }

    #[test]
    fn test_missing_file_is_io() {
        let err = read_f32_file("/nonexistent/images_in.dat", 4).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Io);
    }
}
