use crate::rect::Rect;
use crate::vram::{
    page_start_x, page_start_y, PaletteReg, TextureMode, Vram, VRAM_PAGE_HEIGHT, VRAM_PAGE_WIDTH,
    VRAM_WIDTH,
};
use xxhash_rust::xxh3::{xxh3_128, xxh3_64, Xxh3};

pub type HashType = u64;

fn as_bytes(halfwords: &[u16]) -> &[u8] {
    bytemuck::cast_slice(halfwords)
}

/// Hashes the raw halfwords of a texture page. Rows that run past the right
/// edge of VRAM continue from x = 0, like the hardware sampler does.
pub fn hash_page(vram: &Vram, page: u32, mode: TextureMode) -> HashType {
    let mut state = Xxh3::new();
    let start_x = page_start_x(page);
    let start_y = page_start_y(page);
    let row_width = mode.page_count() * VRAM_PAGE_WIDTH;
    let first = row_width.min(VRAM_WIDTH - start_x) as usize;
    let wrapped = row_width as usize - first;

    for y in start_y..start_y + VRAM_PAGE_HEIGHT {
        state.update(as_bytes(&vram.row(start_x, y)[..first]));
        if wrapped > 0 {
            state.update(as_bytes(&vram.row(0, y)[..wrapped]));
        }
    }

    state.digest()
}

/// Palette hash for paletted modes, clamped to the VRAM row. Zero for direct modes.
pub fn hash_palette(vram: &Vram, palette: PaletteReg, mode: TextureMode) -> HashType {
    if !mode.has_palette() {
        return 0;
    }
    xxh3_64(as_bytes(vram.palette(palette, mode)))
}

/// Hash of entries `min..=max` of a palette.
pub fn hash_partial_palette(palette: &[u16], min: u32, max: u32) -> HashType {
    debug_assert!(min <= max && (max as usize) < palette.len());
    xxh3_64(as_bytes(&palette[min as usize..=max as usize]))
}

pub fn hash_rect(vram: &Vram, rect: &Rect) -> HashType {
    let mut state = Xxh3::new();
    let width = rect.width() as usize;
    for y in rect.top..rect.bottom {
        state.update(as_bytes(&vram.row(rect.left as u32, y as u32)[..width]));
    }
    state.digest()
}

/// 128-bit hash of a whole upload's pixel data.
pub fn hash_upload(pixels: &[u16]) -> u128 {
    xxh3_128(as_bytes(pixels))
}
