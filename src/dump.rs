use crate::config::{Configuration, LOCAL_CONFIG_FILENAME};
use crate::decode::decode_texture;
use crate::hash::{hash_upload, HashType};
use crate::rect::Rect;
use crate::replacement::{ReplacementIndex, ReplacementKind, TextureReplacementName, VramReplacementName};
use crate::vram::{rgba5551_to_rgba8888, TextureMode, Vram};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Where a game's dumps and replacements live: `<textures>/<game id>/{dumps,replacements}`.
#[derive(Debug, Clone, Copy)]
pub struct DumpTarget<'a> {
    pub textures_dir: &'a Path,
    pub game_id: &'a str,
}

impl<'a> DumpTarget<'a> {
    pub fn game_directory(&self) -> PathBuf {
        self.textures_dir.join(self.game_id)
    }

    pub fn dump_directory(&self) -> PathBuf {
        self.game_directory().join("dumps")
    }

    pub fn replacement_directory(&self) -> PathBuf {
        self.game_directory().join("replacements")
    }

    /// Creates the game directory with a config template on first use.
    /// Returns false (after logging) when there is no game or creation fails.
    pub fn ensure_game_directory(&self) -> bool {
        if self.game_id.is_empty() {
            return false;
        }

        let game_dir = self.game_directory();
        if game_dir.is_dir() {
            return true;
        }

        if let Err(e) = fs::create_dir_all(&game_dir) {
            error!("Failed to create game directory: {}", e);
            return false;
        }

        let config_path = game_dir.join(LOCAL_CONFIG_FILENAME);
        if !config_path.exists() {
            if let Err(e) = fs::write(&config_path, Configuration::default().export_template()) {
                error!("Failed to write configuration template: {}", e);
                return false;
            }
        }

        for dir in [self.dump_directory(), self.replacement_directory()] {
            if let Err(e) = fs::create_dir_all(&dir) {
                error!("Failed to create {}: {}", dir.display(), e);
                return false;
            }
        }
        true
    }
}

/// Everything needed to export one texture.
#[derive(Debug, Clone, Copy)]
pub struct DumpRequest<'a> {
    pub kind: ReplacementKind,
    /// Texel offset of `rect` inside the source.
    pub offset_x: u32,
    pub offset_y: u32,
    /// Source size in halfwords.
    pub src_width: u32,
    pub src_height: u32,
    pub mode: TextureMode,
    pub src_hash: HashType,
    pub pal_hash: HashType,
    pub pal_min: u32,
    pub pal_max: u32,
    pub palette: &'a [u16],
    /// Area to decode, in VRAM halfwords.
    pub rect: Rect,
    pub semitransparent_draws: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DumpedTextureKey {
    src_hash: HashType,
    pal_hash: HashType,
    offset_x: u16,
    offset_y: u16,
    width: u16,
    height: u16,
    kind: ReplacementKind,
    mode: TextureMode,
    semitransparent: bool,
}

/// Fixes up decoded alpha for authoring tools. Zero texels stay transparent
/// unless alpha is forced. Semi-transparent dumps map the mask bit to half alpha.
pub fn apply_dump_alpha(pixels: &mut [u32], force_alpha: bool, semitransparent: bool) {
    if force_alpha {
        pixels.iter_mut().for_each(|p| *p |= 0xFF00_0000);
    } else if semitransparent {
        for p in pixels.iter_mut() {
            if *p != 0 {
                let alpha = if *p & 0x8000_0000 != 0 { 0x8000_0000 } else { 0xFF00_0000 };
                *p = (*p & 0x00FF_FFFF) | alpha;
            }
        }
    } else {
        for p in pixels.iter_mut() {
            if *p != 0 {
                *p |= 0xFF00_0000;
            }
        }
    }
}

fn save_png(path: &Path, width: u32, height: u32, pixels: &[u32]) -> crate::error::Result<()> {
    let bytes: Vec<u8> = pixels.iter().flat_map(|p| p.to_le_bytes()).collect();
    match image::RgbaImage::from_raw(width, height, bytes) {
        Some(img) => Ok(img.save(path)?),
        None => Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "pixel buffer too small").into()),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Writes dump images, once per distinct key per session.
#[derive(Default)]
pub struct TextureDumper {
    dumped_textures: HashSet<DumpedTextureKey>,
    dumped_vram_writes: HashSet<VramReplacementName>,
}

impl TextureDumper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.dumped_textures.clear();
        self.dumped_vram_writes.clear();
    }

    pub fn dumped_texture_count(&self) -> usize {
        self.dumped_textures.len()
    }

    pub fn dumped_vram_write_count(&self) -> usize {
        self.dumped_vram_writes.len()
    }

    /// Returns the written path, or None when filtered, already dumped or failed.
    pub fn dump_texture(
        &mut self,
        target: DumpTarget<'_>,
        config: &Configuration,
        dump_replaced: bool,
        vram: &Vram,
        replacements: &ReplacementIndex,
        req: &DumpRequest<'_>,
    ) -> Option<PathBuf> {
        let shift = req.mode.shift();
        let width = (req.rect.width() as u32) << shift;
        let height = req.rect.height() as u32;
        if width < config.texture_dump_width_threshold || height < config.texture_dump_height_threshold {
            return None;
        }

        let (Ok(offset_x), Ok(offset_y), Ok(dump_width), Ok(dump_height)) = (
            u16::try_from(req.offset_x),
            u16::try_from(req.offset_y),
            u16::try_from(width),
            u16::try_from(height),
        ) else {
            warn!(
                "Not dumping texture {:016X} with out of range area {}x{} at ({}, {})",
                req.src_hash, width, height, req.offset_x as i32, req.offset_y as i32
            );
            return None;
        };

        let semitransparent = req.semitransparent_draws && !config.dump_texture_force_alpha_channel;
        let key = DumpedTextureKey {
            src_hash: req.src_hash,
            pal_hash: req.pal_hash,
            offset_x,
            offset_y,
            width: dump_width,
            height: dump_height,
            kind: req.kind,
            mode: req.mode,
            semitransparent,
        };
        if self.dumped_textures.contains(&key) {
            return None;
        }

        if !target.ensure_game_directory() {
            return None;
        }
        let dump_dir = target.dump_directory();
        if let Err(e) = fs::create_dir_all(&dump_dir) {
            error!("Failed to create dump directory: {}", e);
            return None;
        }

        self.dumped_textures.insert(key);

        let name = TextureReplacementName {
            kind: req.kind,
            mode: req.mode,
            semitransparent,
            src_hash: req.src_hash,
            pal_hash: req.pal_hash,
            src_width: req.src_width as u16,
            src_height: req.src_height as u16,
            offset_x,
            offset_y,
            width: dump_width,
            height: dump_height,
            pal_min: req.pal_min as u8,
            pal_max: req.pal_max as u8,
        };

        // only the hash is compared, a smaller area of a replaced texture still counts
        if !dump_replaced && replacements.is_replaced(&name) {
            debug!(
                "Not dumping currently-replaced texture {:016X} [{}x{}] at {}",
                req.src_hash, width, height, req.rect
            );
            return None;
        }

        let path = dump_dir.join(format!("{}.png", name));
        if path.exists() {
            return None;
        }

        debug!(
            "Dumping texture {:016X} [{}x{}] at {}",
            req.src_hash, width, height, req.rect
        );

        let mut pixels = decode_texture(
            req.mode,
            vram,
            req.rect.left as u32,
            req.rect.top as u32,
            width,
            height,
            req.palette,
        );
        apply_dump_alpha(&mut pixels, config.dump_texture_force_alpha_channel, semitransparent);

        match save_png(&path, width, height, &pixels) {
            Ok(()) => Some(path),
            Err(e) => {
                error!("Failed to write texture dump to {}: {}", file_name(&path), e);
                None
            }
        }
    }

    /// Exports a whole upload as `vram-write-<hash>.png`, once per hash.
    pub fn dump_vram_write(
        &mut self,
        target: DumpTarget<'_>,
        config: &Configuration,
        width: u32,
        height: u32,
        pixels: &[u16],
    ) -> Option<PathBuf> {
        let data = &pixels[..(width * height) as usize];
        let name = VramReplacementName::from_hash(hash_upload(data));
        if !self.dumped_vram_writes.insert(name) {
            return None;
        }

        if !target.ensure_game_directory() {
            return None;
        }
        let path = target.dump_directory().join(format!("{}.png", name.file_title()));
        if path.exists() {
            return None;
        }

        let mut rgba: Vec<u32> = data.iter().map(|&p| rgba5551_to_rgba8888(p)).collect();
        if config.dump_vram_write_force_alpha_channel {
            rgba.iter_mut().for_each(|p| *p |= 0xFF00_0000);
        }

        info!("Dumping {}x{} VRAM write to '{}'", width, height, file_name(&path));
        match save_png(&path, width, height, &rgba) {
            Ok(()) => Some(path),
            Err(e) => {
                error!("Failed to dump {}x{} VRAM write to '{}': {}", width, height, file_name(&path), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vram::PaletteReg;

    fn read_png(path: &Path) -> image::RgbaImage {
        image::open(path).unwrap().to_rgba8()
    }

    #[test]
    fn test_alpha_modes() {
        let source = [0u32, 0x80FF_0000, 0x0000_00FF];

        let mut forced = source;
        apply_dump_alpha(&mut forced, true, false);
        assert_eq!(forced, [0xFF00_0000, 0xFFFF_0000, 0xFF00_00FF]);

        let mut semi = source;
        apply_dump_alpha(&mut semi, false, true);
        assert_eq!(semi, [0, 0x80FF_0000, 0xFF00_00FF]);

        let mut plain = source;
        apply_dump_alpha(&mut plain, false, false);
        assert_eq!(plain, [0, 0xFFFF_0000, 0xFF00_00FF]);
    }

    #[test]
    fn test_game_directory_gets_template() {
        let dir = tempfile::tempdir().unwrap();
        let target = DumpTarget {
            textures_dir: dir.path(),
            game_id: "SLUS-00001",
        };
        assert!(target.ensure_game_directory());
        assert!(target.dump_directory().is_dir());
        assert!(target.replacement_directory().is_dir());
        let text = fs::read_to_string(target.game_directory().join(LOCAL_CONFIG_FILENAME)).unwrap();
        assert!(Configuration::default().parse_local(&text).is_ok());

        let no_game = DumpTarget {
            textures_dir: dir.path(),
            game_id: "",
        };
        assert!(!no_game.ensure_game_directory());
    }

    #[test]
    fn test_dump_texture_once_and_filtered_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let target = DumpTarget {
            textures_dir: dir.path(),
            game_id: "GAME",
        };
        let mut vram = Vram::new();
        vram.fill(&Rect::new(0, 0, 4, 16), 0x1111);
        let palette_reg = PaletteReg::from_position(0, 300);
        vram.set_pixel(1, 300, 0x801F);
        let palette = vram.palette(palette_reg, TextureMode::Palette4Bit).to_vec();

        let config = Configuration::default();
        let replacements = ReplacementIndex::new();
        let mut dumper = TextureDumper::new();
        let req = DumpRequest {
            kind: ReplacementKind::TextureFromVramWrite,
            offset_x: 0,
            offset_y: 0,
            src_width: 4,
            src_height: 16,
            mode: TextureMode::Palette4Bit,
            src_hash: 0xAB,
            pal_hash: 0xCD,
            pal_min: 1,
            pal_max: 1,
            palette: &palette,
            rect: Rect::new(0, 0, 4, 16),
            semitransparent_draws: false,
        };

        let path = dumper
            .dump_texture(target, &config, true, &vram, &replacements, &req)
            .unwrap();
        let img = read_png(&path);
        assert_eq!(img.dimensions(), (16, 16));
        assert_eq!(img.get_pixel(0, 0).0, [0xFF, 0, 0, 0xFF]);
        assert!(file_name(&path).starts_with("texupload-P4-00000000000000AB-00000000000000CD-4x16-0-0-16x16-P1-1"));

        assert!(dumper
            .dump_texture(target, &config, true, &vram, &replacements, &req)
            .is_none());
        assert_eq!(dumper.dumped_texture_count(), 1);

        let small = DumpRequest {
            rect: Rect::new(0, 0, 2, 16),
            ..req
        };
        assert!(dumper
            .dump_texture(target, &config, true, &vram, &replacements, &small)
            .is_none());

        // an offset that went negative upstream must not wrap into a name
        let wrapped = DumpRequest {
            offset_x: (-4i32) as u32,
            ..req
        };
        assert!(dumper
            .dump_texture(target, &config, true, &vram, &replacements, &wrapped)
            .is_none());
        assert_eq!(dumper.dumped_texture_count(), 1);
    }

    #[test]
    fn test_dump_vram_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let target = DumpTarget {
            textures_dir: dir.path(),
            game_id: "GAME",
        };
        let pixels = vec![0x001Fu16; 8 * 4];
        let mut dumper = TextureDumper::new();
        let config = Configuration::default();

        let path = dumper.dump_vram_write(target, &config, 8, 4, &pixels).unwrap();
        let img = read_png(&path);
        assert_eq!(img.dimensions(), (8, 4));
        // forced alpha by default
        assert_eq!(img.get_pixel(3, 3).0, [0xFF, 0, 0, 0xFF]);
        assert!(dumper.dump_vram_write(target, &config, 8, 4, &pixels).is_none());
    }
}
