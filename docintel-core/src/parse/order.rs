use crate::blocks::Block;

/// Top-to-bottom, then left-to-right. The sort is stable so blocks sharing a
/// top-left corner keep their extraction order.
pub fn sort_reading_order(blocks: &mut [Block]) {
    blocks.sort_by_key(|b| (b.bbox[1], b.bbox[0]));
}
