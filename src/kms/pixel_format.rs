use drm_fourcc::DrmFourcc;

/// The only format the allocators and framebuffers use.
pub const FORMAT: DrmFourcc = DrmFourcc::Xrgb8888;
pub const BITS_PER_PIXEL: u32 = 32;
pub const BYTES_PER_PIXEL: u32 = BITS_PER_PIXEL / 8;

/// Smallest legal row pitch for `width` pixels, `None` if it overflows.
pub fn min_stride(width: u32) -> Option<u32> {
    width.checked_mul(BYTES_PER_PIXEL)
}

/// Pack an opaque colour. The X byte is left at zero.
pub fn xrgb(r: u8, g: u8, b: u8) -> u32 {
    (u32::from(r) << 16) | (u32::from(g) << 8) | u32::from(b)
}

/// Fill the visible `width` x `height` area of a strided XRGB8888 image.
/// Row padding past `width * 4` is left untouched.
pub fn fill_rows(dst: &mut [u8], width: u32, height: u32, stride: u32, pixel: u32) {
    let row_bytes = width as usize * BYTES_PER_PIXEL as usize;
    let bytes = pixel.to_le_bytes();
    for y in 0..height as usize {
        let row_start = y * stride as usize;
        let row = &mut dst[row_start..row_start + row_bytes];
        for px in row.chunks_exact_mut(4) {
            px.copy_from_slice(&bytes);
        }
    }
}
