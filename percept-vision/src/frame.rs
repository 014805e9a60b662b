//! Frame data flowing from the synchronizer through the ring buffer

use crate::error::VisionError;
use bytes::Bytes;
use nalgebra::{Matrix3, Vector3};
use percept_core::Stamp;

/// Packed 8-bit image, row-major, `channels` bytes per pixel
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBuffer {
    width: u32,
    height: u32,
    channels: u8,
    data: Bytes,
}

impl ImageBuffer {
    pub fn new(width: u32, height: u32, channels: u8, data: impl Into<Bytes>) -> Result<Self, VisionError> {
        let data = data.into();
        let expected = Self::byte_len(width, height, channels)?;

        if channels == 0 {
            return Err(VisionError::Processing("Image must have at least one channel".to_string()));
        }
        if data.len() != expected {
            return Err(VisionError::Processing(format!(
                "Image buffer holds {} bytes, expected {} for {}x{}x{}",
                data.len(),
                expected,
                width,
                height,
                channels
            )));
        }

        Ok(Self { width, height, channels, data })
    }

    /// Image filled with a single byte value
    pub fn filled(width: u32, height: u32, channels: u8, value: u8) -> Result<Self, VisionError> {
        let len = Self::byte_len(width, height, channels)?;
        Self::new(width, height, channels, vec![value; len])
    }

    fn byte_len(width: u32, height: u32, channels: u8) -> Result<usize, VisionError> {
        (width as usize)
            .checked_mul(height as usize)
            .and_then(|p| p.checked_mul(channels as usize))
            .ok_or_else(|| VisionError::Processing("Image dimensions overflow".to_string()))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }
}

/// Depth image in meters, row-major
#[derive(Debug, Clone, PartialEq)]
pub struct DepthImage {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl DepthImage {
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Result<Self, VisionError> {
        if data.len() != (width as usize) * (height as usize) {
            return Err(VisionError::Processing(format!(
                "Depth buffer holds {} values, expected {}x{}",
                data.len(),
                width,
                height
            )));
        }
        Ok(Self { width, height, data })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Depth at a pixel, `None` outside the image or for invalid readings
    pub fn depth_at(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let value = self.data[(y as usize) * (self.width as usize) + x as usize];
        (value.is_finite() && value > 0.0).then_some(value)
    }
}

/// Pinhole camera intrinsics with a cached inverse
#[derive(Debug, Clone, PartialEq)]
pub struct CameraIntrinsics {
    k: Matrix3<f64>,
    k_inv: Matrix3<f64>,
}

impl CameraIntrinsics {
    /// Build from a row-major 3x3 matrix, as carried by calibration messages
    pub fn from_row_major(k: [f64; 9]) -> Result<Self, VisionError> {
        if k.iter().any(|v| !v.is_finite()) {
            return Err(VisionError::Projection("Intrinsics contain non-finite values".to_string()));
        }
        let k = Matrix3::from_row_slice(&k);
        let k_inv = k
            .try_inverse()
            .ok_or_else(|| VisionError::Projection("Intrinsics matrix is singular".to_string()))?;
        Ok(Self { k, k_inv })
    }

    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Result<Self, VisionError> {
        Self::from_row_major([fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0])
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.k
    }

    pub fn inverse(&self) -> &Matrix3<f64> {
        &self.k_inv
    }

    /// Camera-frame ray through a pixel: `K⁻¹ · [u, v, 1]ᵗ`
    pub fn ray(&self, u: f64, v: f64) -> Vector3<f64> {
        self.k_inv * Vector3::new(u, v, 1.0)
    }

    /// Pixel a camera-frame point projects to, `None` behind the camera
    pub fn project(&self, point: &Vector3<f64>) -> Option<(f64, f64)> {
        if point.z <= 0.0 {
            return None;
        }
        let p = self.k * point;
        Some((p.x / p.z, p.y / p.z))
    }
}

/// One fused, immutable frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic fusion counter
    pub sequence: u64,
    pub stamp: Stamp,
    pub image: ImageBuffer,
    pub depth: Option<DepthImage>,
    pub intrinsics: Option<CameraIntrinsics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filled_rejects_overflowing_dimensions() {
        // Overflows usize on 32- and 64-bit targets alike
        let result = ImageBuffer::filled(u32::MAX, u32::MAX, 4, 0);
        assert!(matches!(result, Err(VisionError::Processing(_))));
    }

    #[test]
    fn test_image_buffer_size_check() {
        assert!(ImageBuffer::new(2, 2, 3, vec![0u8; 12]).is_ok());
        assert!(ImageBuffer::new(2, 2, 3, vec![0u8; 11]).is_err());
        assert!(ImageBuffer::new(2, 2, 0, Vec::<u8>::new()).is_err());
    }

    #[test]
    fn test_image_buffer_filled() {
        let img = ImageBuffer::filled(4, 3, 1, 7).unwrap();
        assert_eq!(img.data().len(), 12);
        assert!(img.data().iter().all(|&b| b == 7));
    }

    #[test]
    fn test_depth_lookup() {
        let depth = DepthImage::new(2, 1, vec![1.5, f32::NAN]).unwrap();
        assert_eq!(depth.depth_at(0, 0), Some(1.5));
        assert_eq!(depth.depth_at(1, 0), None);
        assert_eq!(depth.depth_at(5, 0), None);
        assert!(DepthImage::new(2, 2, vec![0.0; 3]).is_err());
    }

    #[test]
    fn test_intrinsics_ray_and_project() {
        let k = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0).unwrap();
        let ray = k.ray(320.0, 240.0);
        assert!((ray - Vector3::new(0.0, 0.0, 1.0)).norm() < 1e-12);

        let point = Vector3::new(0.4, -0.2, 2.0);
        let (u, v) = k.project(&point).unwrap();
        let back = k.ray(u, v) * point.z;
        assert!((back - point).norm() < 1e-9);

        assert!(k.project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn test_singular_intrinsics_rejected() {
        assert!(CameraIntrinsics::from_row_major([0.0; 9]).is_err());
        assert!(CameraIntrinsics::new(f64::NAN, 1.0, 0.0, 0.0).is_err());
    }
}
