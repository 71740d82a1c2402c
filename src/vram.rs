use crate::rect::Rect;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const VRAM_WIDTH: u32 = 1024;
pub const VRAM_HEIGHT: u32 = 512;
pub const VRAM_SIZE: usize = (VRAM_WIDTH * VRAM_HEIGHT) as usize;

// Cache bookkeeping granularity. Matches the 4-bit texture page footprint.
pub const VRAM_PAGE_WIDTH: u32 = 64;
pub const VRAM_PAGE_HEIGHT: u32 = 256;
pub const VRAM_PAGES_WIDE: u32 = VRAM_WIDTH / VRAM_PAGE_WIDTH;
pub const VRAM_PAGES_HIGH: u32 = VRAM_HEIGHT / VRAM_PAGE_HEIGHT;
pub const NUM_VRAM_PAGES: usize = (VRAM_PAGES_WIDE * VRAM_PAGES_HIGH) as usize;
pub const VRAM_PAGE_X_MASK: u32 = 0xF;
pub const VRAM_PAGE_Y_MASK: u32 = 0x10;

// Decoded texture size, in texels.
pub const TEXTURE_PAGE_WIDTH: u32 = 256;
pub const TEXTURE_PAGE_HEIGHT: u32 = 256;

pub const MAX_CLUT_SIZE: usize = 256;

const MASK_BIT: u16 = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TextureMode {
    Palette4Bit,
    Palette8Bit,
    Direct16Bit,
    ReservedDirect16Bit,
}

impl TextureMode {
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0 => TextureMode::Palette4Bit,
            1 => TextureMode::Palette8Bit,
            2 => TextureMode::Direct16Bit,
            _ => TextureMode::ReservedDirect16Bit,
        }
    }

    pub const fn bits(self) -> u8 {
        match self {
            TextureMode::Palette4Bit => 0,
            TextureMode::Palette8Bit => 1,
            TextureMode::Direct16Bit => 2,
            TextureMode::ReservedDirect16Bit => 3,
        }
    }

    pub const fn has_palette(self) -> bool {
        matches!(self, TextureMode::Palette4Bit | TextureMode::Palette8Bit)
    }

    /// Texels per halfword, as a shift.
    pub const fn shift(self) -> u32 {
        match self {
            TextureMode::Palette4Bit => 2,
            TextureMode::Palette8Bit => 1,
            TextureMode::Direct16Bit | TextureMode::ReservedDirect16Bit => 0,
        }
    }

    /// Number of 64-halfword cache pages covered by one texture page.
    pub const fn page_count(self) -> u32 {
        match self {
            TextureMode::Palette4Bit => 1,
            TextureMode::Palette8Bit => 2,
            TextureMode::Direct16Bit | TextureMode::ReservedDirect16Bit => 4,
        }
    }

    pub const fn palette_width(self) -> u32 {
        match self {
            TextureMode::Palette4Bit => 16,
            TextureMode::Palette8Bit => 256,
            TextureMode::Direct16Bit | TextureMode::ReservedDirect16Bit => 0,
        }
    }

    /// Converts a width in halfwords to a width in texels.
    pub const fn texels(self, halfwords: u32) -> u32 {
        halfwords << self.shift()
    }

    pub const fn name(self) -> &'static str {
        match self {
            TextureMode::Palette4Bit => "Palette4Bit",
            TextureMode::Palette8Bit => "Palette8Bit",
            TextureMode::Direct16Bit => "Direct16Bit",
            TextureMode::ReservedDirect16Bit => "Reserved_Direct16Bit",
        }
    }
}

/// CLUT register: `x = (bits & 0x3F) * 16`, `y = (bits >> 6) & 0x1FF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PaletteReg(pub u16);

impl PaletteReg {
    pub fn from_position(x: u32, y: u32) -> Self {
        PaletteReg((((y & 0x1FF) << 6) | ((x / 16) & 0x3F)) as u16)
    }

    pub fn x_base(self) -> u32 {
        (self.0 as u32 & 0x3F) * 16
    }

    pub fn y_base(self) -> u32 {
        (self.0 as u32 >> 6) & 0x1FF
    }

    /// Number of entries actually readable before the right edge of VRAM.
    pub fn clamped_width(self, mode: TextureMode) -> u32 {
        mode.palette_width().min(VRAM_WIDTH - self.x_base())
    }

    pub fn rect(self, mode: TextureMode) -> Rect {
        let x = self.x_base();
        let y = self.y_base();
        Rect::from_size(x, y, self.clamped_width(mode), 1)
    }
}

impl fmt::Display for PaletteReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CLUT@[{},{}]", self.x_base(), self.y_base())
    }
}

pub const fn page_index(page_x: u32, page_y: u32) -> u32 {
    page_y * VRAM_PAGES_WIDE + page_x
}

pub const fn page_start_x(page: u32) -> u32 {
    (page & VRAM_PAGE_X_MASK) * VRAM_PAGE_WIDTH
}

pub const fn page_start_y(page: u32) -> u32 {
    ((page & VRAM_PAGE_Y_MASK) >> 4) * VRAM_PAGE_HEIGHT
}

pub fn page_rect(page: u32) -> Rect {
    Rect::from_size(
        page_start_x(page),
        page_start_y(page),
        VRAM_PAGE_WIDTH,
        VRAM_PAGE_HEIGHT,
    )
}

/// Page containing the given VRAM coordinate.
pub fn page_for_position(x: u32, y: u32) -> u32 {
    page_index(x / VRAM_PAGE_WIDTH, y / VRAM_PAGE_HEIGHT)
}

pub fn texture_page_is_wrapping(page: u32, mode: TextureMode) -> bool {
    page_start_x(page) + mode.page_count() * VRAM_PAGE_WIDTH > VRAM_WIDTH
}

/// Portion of the texture page that lies left of the right VRAM edge.
pub fn texture_rect(page: u32, mode: TextureMode) -> Rect {
    let x = page_start_x(page);
    let width = (mode.page_count() * VRAM_PAGE_WIDTH).min(VRAM_WIDTH - x);
    Rect::from_size(x, page_start_y(page), width, VRAM_PAGE_HEIGHT)
}

/// Portion of the texture page that wrapped around to x = 0, if any.
pub fn wrapped_texture_rect(page: u32, mode: TextureMode) -> Rect {
    if !texture_page_is_wrapping(page, mode) {
        return Rect::INVALID;
    }

    let overflow = page_start_x(page) + mode.page_count() * VRAM_PAGE_WIDTH - VRAM_WIDTH;
    Rect::from_size(0, page_start_y(page), overflow, VRAM_PAGE_HEIGHT)
}

/// Pages touched by `rect`, row by row. `rect` must lie inside VRAM.
pub fn rect_pages(rect: &Rect) -> impl Iterator<Item = u32> {
    debug_assert!(!rect.is_empty());
    debug_assert!(rect.left >= 0 && rect.top >= 0);
    debug_assert!(rect.right as u32 <= VRAM_WIDTH && rect.bottom as u32 <= VRAM_HEIGHT);

    let start_x = rect.left as u32 / VRAM_PAGE_WIDTH;
    let end_x = (rect.right as u32 - 1) / VRAM_PAGE_WIDTH;
    let start_y = rect.top as u32 / VRAM_PAGE_HEIGHT;
    let end_y = (rect.bottom as u32 - 1) / VRAM_PAGE_HEIGHT;

    (start_y..=end_y).flat_map(move |py| (start_x..=end_x).map(move |px| page_index(px, py)))
}

/// `count` pages starting at `page`, wrapping horizontally within the page row.
pub fn x_wrapped_pages(page: u32, count: u32) -> impl Iterator<Item = u32> {
    (0..count).map(move |i| (page & VRAM_PAGE_Y_MASK) | ((page + i) & VRAM_PAGE_X_MASK))
}

/// Clamps a transfer rectangle to VRAM. Transfers that run off an edge wrap,
/// so the whole width (or height) is considered touched.
pub fn transfer_bounds(x: u32, y: u32, width: u32, height: u32) -> Rect {
    let x = x % VRAM_WIDTH;
    let y = y % VRAM_HEIGHT;
    let (left, right) = if x + width > VRAM_WIDTH {
        (0, VRAM_WIDTH)
    } else {
        (x, x + width)
    };
    let (top, bottom) = if y + height > VRAM_HEIGHT {
        (0, VRAM_HEIGHT)
    } else {
        (y, y + height)
    };
    Rect::new(left as i32, top as i32, right as i32, bottom as i32)
}

/// RGBA5551 (as stored in VRAM) to little-endian RGBA8888.
pub fn rgba5551_to_rgba8888(color: u16) -> u32 {
    let expand = |c: u16| -> u32 {
        let c = (c & 0x1F) as u32;
        (c << 3) | (c >> 2)
    };
    let r = expand(color);
    let g = expand(color >> 5);
    let b = expand(color >> 10);
    let a = if color & MASK_BIT != 0 { 0xFF } else { 0x00 };
    r | (g << 8) | (b << 16) | (a << 24)
}

/// The emulated framebuffer: 1024x512 16-bit pixels.
pub struct Vram {
    pixels: Box<[u16]>,
}

impl Vram {
    pub fn new() -> Self {
        Self {
            pixels: vec![0u16; VRAM_SIZE].into_boxed_slice(),
        }
    }

    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> u16 {
        self.pixels[((y % VRAM_HEIGHT) * VRAM_WIDTH + (x % VRAM_WIDTH)) as usize]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, value: u16) {
        self.pixels[((y % VRAM_HEIGHT) * VRAM_WIDTH + (x % VRAM_WIDTH)) as usize] = value;
    }

    /// Row `y` starting at `x`, up to the right edge of VRAM.
    pub fn row(&self, x: u32, y: u32) -> &[u16] {
        let start = (y * VRAM_WIDTH + x) as usize;
        let end = ((y + 1) * VRAM_WIDTH) as usize;
        &self.pixels[start..end]
    }

    /// `len` halfwords of row `y` starting at `x`, wrapping at the right edge.
    pub fn row_wrapped(&self, x: u32, y: u32, len: u32) -> impl Iterator<Item = u16> + '_ {
        (0..len).map(move |i| self.pixel(x + i, y))
    }

    pub fn palette(&self, palette: PaletteReg, mode: TextureMode) -> &[u16] {
        let width = palette.clamped_width(mode) as usize;
        &self.row(palette.x_base(), palette.y_base())[..width]
    }

    /// Replaces the whole surface. Returns false, leaving VRAM untouched, when
    /// `pixels` isn't exactly 1024x512 halfwords.
    pub fn restore(&mut self, pixels: &[u16]) -> bool {
        if pixels.len() != VRAM_SIZE {
            return false;
        }
        self.pixels.copy_from_slice(pixels);
        true
    }

    pub fn fill(&mut self, rect: &Rect, value: u16) {
        for y in rect.top..rect.bottom {
            for x in rect.left..rect.right {
                self.set_pixel(x as u32, y as u32, value);
            }
        }
    }

    /// Reads a rectangle row-major. Coordinates wrap.
    pub fn read_rect(&self, x: u32, y: u32, width: u32, height: u32) -> Vec<u16> {
        let mut out = Vec::with_capacity((width * height) as usize);
        for row in 0..height {
            out.extend(self.row_wrapped(x, y + row, width));
        }
        out
    }

    pub fn write(
        &mut self,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        data: &[u16],
        set_mask: bool,
        check_mask: bool,
    ) {
        if data.len() < (width * height) as usize {
            return;
        }
        let or_mask = if set_mask { MASK_BIT } else { 0 };
        for row in 0..height {
            for col in 0..width {
                let dst_x = x + col;
                let dst_y = y + row;
                if check_mask && self.pixel(dst_x, dst_y) & MASK_BIT != 0 {
                    continue;
                }
                let value = data[(row * width + col) as usize] | or_mask;
                self.set_pixel(dst_x, dst_y, value);
            }
        }
    }

    /// VRAM-to-VRAM copy. The source is read in full before writing so
    /// overlapping regions behave like a transfer through a buffer.
    pub fn copy(
        &mut self,
        src_x: u32,
        src_y: u32,
        dst_x: u32,
        dst_y: u32,
        width: u32,
        height: u32,
        set_mask: bool,
        check_mask: bool,
    ) {
        let data = self.read_rect(src_x, src_y, width, height);
        self.write(dst_x, dst_y, width, height, &data, set_mask, check_mask);
    }
}

impl Default for Vram {
    fn default() -> Self {
        Self::new()
    }
}
