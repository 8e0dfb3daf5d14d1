use image::{DynamicImage, RgbImage};

pub const PDF_POINTS_PER_INCH: f32 = 72.0;
pub const DEFAULT_OCR_DPI: f32 = 300.0;

/// Render scale for a PDF page at `dpi`.
#[inline]
pub fn render_scale(dpi: f32) -> f32 {
    dpi / PDF_POINTS_PER_INCH
}

/// Every engine consumes 3-channel RGB. Alpha is dropped, gray is replicated.
pub fn normalize_color(image: DynamicImage) -> RgbImage {
    match image {
        DynamicImage::ImageRgb8(rgb) => rgb,
        other => other.to_rgb8(),
    }
}
