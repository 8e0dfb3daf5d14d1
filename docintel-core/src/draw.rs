use image::{DynamicImage, Rgba};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};

use crate::blocks::Block;

const NATIVE_BLOCK_COLOR: Rgba<u8> = Rgba([0, 120, 255, 255]);
const OCR_BLOCK_COLOR: Rgba<u8> = Rgba([255, 60, 0, 255]);

/// Page raster with every block outlined, blue for native text and orange for OCR.
pub(crate) fn draw_blocks(blocks: &[Block], page_image: &DynamicImage) -> DynamicImage {
    let mut out_img = page_image.to_rgba8();
    for block in blocks {
        let [x0, y0, x1, y1] = block.bbox;
        let rect = Rect::at(x0, y0).of_size((x1 - x0).max(1) as u32, (y1 - y0).max(1) as u32);
        let color = if block.is_native() {
            NATIVE_BLOCK_COLOR
        } else {
            OCR_BLOCK_COLOR
        };
        draw_hollow_rect_mut(&mut out_img, rect, color);
    }
    DynamicImage::ImageRgba8(out_img)
}
