use crate::hash::HashType;
use crate::rect::Rect;
use crate::vram::TextureMode;
use std::fmt;

/// What a replacement (or dump) file stands in for, from its title prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplacementKind {
    /// A whole upload, matched on its raw pixels.
    VramReplacement,
    /// A sub-rectangle of an upload, as sampled by draws.
    TextureFromVramWrite,
    /// A sub-rectangle of a texture page.
    TextureFromPage,
}

impl ReplacementKind {
    pub fn from_file_title(title: &str) -> Option<Self> {
        if title.starts_with("vram-write-") {
            Some(ReplacementKind::VramReplacement)
        } else if title.starts_with("texupload-") {
            Some(ReplacementKind::TextureFromVramWrite)
        } else if title.starts_with("texpage-") {
            Some(ReplacementKind::TextureFromPage)
        } else {
            None
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            ReplacementKind::VramReplacement => "vram-write",
            ReplacementKind::TextureFromVramWrite => "texupload",
            ReplacementKind::TextureFromPage => "texpage",
        }
    }
}

fn parse_hex64(token: &str) -> Option<u64> {
    if token.len() != 16 || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(token, 16).ok()
}

fn parse_dec<T: std::str::FromStr>(token: &str) -> Option<T> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

fn parse_nonzero_u16(token: &str) -> Option<u16> {
    parse_dec::<u16>(token).filter(|&v| v != 0)
}

fn parse_size(token: &str) -> Option<(u16, u16)> {
    let (w, h) = token.split_once('x')?;
    Some((parse_nonzero_u16(w)?, parse_nonzero_u16(h)?))
}

/// 128-bit content hash of an upload; file title `vram-write-<32 hex digits>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VramReplacementName {
    pub high: u64,
    pub low: u64,
}

impl VramReplacementName {
    const TITLE_LEN: usize = 11 + 32;

    pub fn from_hash(hash: u128) -> Self {
        Self {
            high: (hash >> 64) as u64,
            low: hash as u64,
        }
    }

    pub fn parse(title: &str) -> Option<Self> {
        if title.len() != Self::TITLE_LEN || !title.is_ascii() || !title.starts_with("vram-write-") {
            return None;
        }
        let digits = &title[11..];
        Some(Self {
            high: parse_hex64(&digits[..16])?,
            low: parse_hex64(&digits[16..])?,
        })
    }

    pub fn file_title(&self) -> String {
        format!("vram-write-{}", self)
    }
}

impl fmt::Display for VramReplacementName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}{:016X}", self.high, self.low)
    }
}

/// Key of the texture replacement multi-maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplacementIndexKey {
    pub src_hash: HashType,
    pub mode: TextureMode,
}

/// Structured texture replacement name. Offsets and sizes are in texels;
/// the source size is in VRAM halfwords.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureReplacementName {
    pub kind: ReplacementKind,
    pub mode: TextureMode,
    pub semitransparent: bool,
    pub src_hash: HashType,
    pub pal_hash: HashType,
    pub src_width: u16,
    pub src_height: u16,
    pub offset_x: u16,
    pub offset_y: u16,
    pub width: u16,
    pub height: u16,
    pub pal_min: u8,
    pub pal_max: u8,
}

fn mode_tag(mode: TextureMode, semitransparent: bool) -> &'static str {
    match (mode, semitransparent) {
        (TextureMode::Palette4Bit, false) => "P4",
        (TextureMode::Palette8Bit, false) => "P8",
        (TextureMode::Direct16Bit | TextureMode::ReservedDirect16Bit, false) => "C16",
        (TextureMode::Palette4Bit, true) => "STP4",
        (TextureMode::Palette8Bit, true) => "STP8",
        (TextureMode::Direct16Bit | TextureMode::ReservedDirect16Bit, true) => "STC16",
    }
}

fn parse_mode_tag(tag: &str) -> Option<(TextureMode, bool)> {
    let (tag, semitransparent) = match tag.strip_prefix("ST") {
        Some(rest) => (rest, true),
        None => (tag, false),
    };
    let mode = match tag {
        "P4" => TextureMode::Palette4Bit,
        "P8" => TextureMode::Palette8Bit,
        "C16" => TextureMode::Direct16Bit,
        _ => return None,
    };
    Some((mode, semitransparent))
}

impl TextureReplacementName {
    pub fn index(&self) -> ReplacementIndexKey {
        ReplacementIndexKey {
            src_hash: self.src_hash,
            mode: self.mode,
        }
    }

    /// Target rectangle in texel space of the source.
    pub fn dest_rect(&self) -> Rect {
        Rect::from_size(
            self.offset_x as u32,
            self.offset_y as u32,
            self.width as u32,
            self.height as u32,
        )
    }

    /// Parses a file title. Any malformed or out-of-range token rejects the name.
    pub fn parse(title: &str) -> Option<Self> {
        let tokens: Vec<&str> = title.split('-').collect();
        let kind = match *tokens.first()? {
            "texupload" => ReplacementKind::TextureFromVramWrite,
            "texpage" => ReplacementKind::TextureFromPage,
            _ => return None,
        };
        let (mode, semitransparent) = parse_mode_tag(tokens.get(1)?)?;
        let src_hash = parse_hex64(tokens.get(2)?)?;

        if mode.has_palette() {
            // type-mode-src-pal-WxH-ox-oy-WxH-Pmin-max
            if tokens.len() != 10 {
                return None;
            }
            let pal_hash = parse_hex64(tokens[3])?;
            let (src_width, src_height) = parse_size(tokens[4])?;
            let offset_x = parse_dec(tokens[5])?;
            let offset_y = parse_dec(tokens[6])?;
            let (width, height) = parse_size(tokens[7])?;
            let pal_min: u8 = parse_dec(tokens[8].strip_prefix('P')?)?;
            let pal_max: u8 = parse_dec(tokens[9])?;
            if pal_min > pal_max || pal_max as u32 >= mode.palette_width() {
                return None;
            }

            Some(Self {
                kind,
                mode,
                semitransparent,
                src_hash,
                pal_hash,
                src_width,
                src_height,
                offset_x,
                offset_y,
                width,
                height,
                pal_min,
                pal_max,
            })
        } else {
            // type-mode-src-WxH-ox-oy-WxH
            if tokens.len() != 7 {
                return None;
            }
            let (src_width, src_height) = parse_size(tokens[3])?;
            let offset_x = parse_dec(tokens[4])?;
            let offset_y = parse_dec(tokens[5])?;
            let (width, height) = parse_size(tokens[6])?;

            Some(Self {
                kind,
                mode,
                semitransparent,
                src_hash,
                pal_hash: 0,
                src_width,
                src_height,
                offset_x,
                offset_y,
                width,
                height,
                pal_min: 0,
                pal_max: 0,
            })
        }
    }
}

impl fmt::Display for TextureReplacementName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind.prefix();
        let mode = mode_tag(self.mode, self.semitransparent);
        if self.mode.has_palette() {
            write!(
                f,
                "{}-{}-{:016X}-{:016X}-{}x{}-{}-{}-{}x{}-P{}-{}",
                kind,
                mode,
                self.src_hash,
                self.pal_hash,
                self.src_width,
                self.src_height,
                self.offset_x,
                self.offset_y,
                self.width,
                self.height,
                self.pal_min,
                self.pal_max
            )
        } else {
            write!(
                f,
                "{}-{}-{:016X}-{}x{}-{}-{}-{}x{}",
                kind,
                mode,
                self.src_hash,
                self.src_width,
                self.src_height,
                self.offset_x,
                self.offset_y,
                self.width,
                self.height
            )
        }
    }
}
