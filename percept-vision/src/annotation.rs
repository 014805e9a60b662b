//! Rendering detection boxes onto frames for display

use crate::error::VisionError;
use crate::frame::{Frame, ImageBuffer};
use crate::processing::SmoothedDetection;
use image::{GrayImage, Luma, Rgb, RgbImage, Rgba, RgbaImage};
use imageproc::drawing::{draw_hollow_rect_mut, Canvas};
use imageproc::rect::Rect;
use percept_core::Stamp;

/// Image published on the annotated stream
#[derive(Debug, Clone)]
pub struct AnnotatedImage {
    /// Sequence of the report whose detections were drawn
    pub report_sequence: u64,
    pub frame_sequence: u64,
    pub stamp: Stamp,
    pub image: ImageBuffer,
}

/// Draws detections onto a copy of a frame
pub trait FrameAnnotator: Send + Sync {
    fn annotate(&self, frame: &Frame, detections: &[SmoothedDetection]) -> Result<ImageBuffer, VisionError>;
}

const PALETTE: [[u8; 3]; 6] = [
    [255, 0, 255],
    [0, 0, 255],
    [0, 255, 255],
    [0, 255, 0],
    [255, 255, 0],
    [255, 0, 0],
];

/// Class-coloured box outlines on 1, 3 or 4 channel frames
#[derive(Debug, Clone)]
pub struct BoxAnnotator {
    thickness: u32,
}

impl Default for BoxAnnotator {
    fn default() -> Self {
        Self { thickness: 2 }
    }
}

impl BoxAnnotator {
    pub fn new(thickness: u32) -> Self {
        Self {
            thickness: thickness.max(1),
        }
    }

    pub fn color_for(class_id: usize) -> [u8; 3] {
        PALETTE[class_id % PALETTE.len()]
    }

    fn draw<C: Canvas>(&self, canvas: &mut C, detections: &[SmoothedDetection], pixel: impl Fn([u8; 3]) -> C::Pixel) {
        let (width, height) = canvas.dimensions();
        for detection in detections {
            let color = pixel(Self::color_for(detection.class_id));
            let bbox = &detection.bbox;
            if !bbox.is_valid() {
                continue;
            }

            // Clamp to the canvas; boxes fully outside draw nothing
            let x0 = bbox.x.max(0.0).min(width as f32) as i64;
            let y0 = bbox.y.max(0.0).min(height as f32) as i64;
            let x1 = (bbox.x + bbox.width).max(0.0).min(width as f32) as i64;
            let y1 = (bbox.y + bbox.height).max(0.0).min(height as f32) as i64;

            for inset in 0..self.thickness as i64 {
                let w = x1 - x0 - 2 * inset;
                let h = y1 - y0 - 2 * inset;
                if w < 1 || h < 1 {
                    break;
                }
                let rect = Rect::at((x0 + inset) as i32, (y0 + inset) as i32).of_size(w as u32, h as u32);
                draw_hollow_rect_mut(canvas, rect, color);
            }
        }
    }
}

impl FrameAnnotator for BoxAnnotator {
    fn annotate(&self, frame: &Frame, detections: &[SmoothedDetection]) -> Result<ImageBuffer, VisionError> {
        let src = &frame.image;
        let (w, h) = (src.width(), src.height());
        let malformed = || VisionError::Processing("Frame buffer does not match its dimensions".to_string());

        let data = match src.channels() {
            1 => {
                let mut img = GrayImage::from_raw(w, h, src.data().to_vec()).ok_or_else(malformed)?;
                self.draw(&mut img, detections, |c| Luma([(c.iter().map(|&v| v as u16).sum::<u16>() / 3) as u8]));
                img.into_raw()
            }
            3 => {
                let mut img = RgbImage::from_raw(w, h, src.data().to_vec()).ok_or_else(malformed)?;
                self.draw(&mut img, detections, Rgb);
                img.into_raw()
            }
            4 => {
                let mut img = RgbaImage::from_raw(w, h, src.data().to_vec()).ok_or_else(malformed)?;
                self.draw(&mut img, detections, |[r, g, b]| Rgba([r, g, b, 255]));
                img.into_raw()
            }
            other => {
                return Err(VisionError::Processing(format!(
                    "Cannot annotate {}-channel frames",
                    other
                )))
            }
        };

        ImageBuffer::new(w, h, src.channels(), data)
    }
}
