use crate::vram::{rgba5551_to_rgba8888, TextureMode, Vram};

fn lookup(palette: &[u16], index: u16) -> u32 {
    palette
        .get(index as usize)
        .copied()
        .map(rgba5551_to_rgba8888)
        .unwrap_or(0)
}

/// Decodes `width` x `height` texels starting at VRAM halfword (`x`, `y`)
/// into RGBA8. `width` is in texels; reads wrap around the VRAM edges.
pub fn decode_texture(
    mode: TextureMode,
    vram: &Vram,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    palette: &[u16],
) -> Vec<u32> {
    let mut out = vec![0u32; (width * height) as usize];
    for row in 0..height {
        let dest = &mut out[(row * width) as usize..((row + 1) * width) as usize];
        match mode {
            TextureMode::Palette4Bit => decode_row4(vram, x, y + row, palette, dest),
            TextureMode::Palette8Bit => decode_row8(vram, x, y + row, palette, dest),
            TextureMode::Direct16Bit | TextureMode::ReservedDirect16Bit => {
                decode_row16(vram, x, y + row, dest)
            }
        }
    }
    out
}

fn decode_row4(vram: &Vram, x: u32, y: u32, palette: &[u16], dest: &mut [u32]) {
    for (i, chunk) in dest.chunks_mut(4).enumerate() {
        let value = vram.pixel(x + i as u32, y);
        for (j, texel) in chunk.iter_mut().enumerate() {
            *texel = lookup(palette, (value >> (j * 4)) & 0xF);
        }
    }
}

fn decode_row8(vram: &Vram, x: u32, y: u32, palette: &[u16], dest: &mut [u32]) {
    for (i, chunk) in dest.chunks_mut(2).enumerate() {
        let value = vram.pixel(x + i as u32, y);
        for (j, texel) in chunk.iter_mut().enumerate() {
            *texel = lookup(palette, (value >> (j * 8)) & 0xFF);
        }
    }
}

fn decode_row16(vram: &Vram, x: u32, y: u32, dest: &mut [u32]) {
    for (i, texel) in dest.iter_mut().enumerate() {
        *texel = rgba5551_to_rgba8888(vram.pixel(x + i as u32, y));
    }
}
