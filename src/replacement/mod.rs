mod names;


pub use names::{ReplacementIndexKey, ReplacementKind, TextureReplacementName, VramReplacementName};

use crate::hash::{hash_partial_palette, hash_rect, HashType};
use crate::rect::Rect;
use crate::vram::{
    page_start_x, page_start_y, PaletteReg, TextureMode, Vram, TEXTURE_PAGE_HEIGHT,
    TEXTURE_PAGE_WIDTH, VRAM_HEIGHT, VRAM_WIDTH,
};
use log::{error, info, trace, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};
use walkdir::WalkDir;

const VALID_EXTENSIONS: [&str; 3] = ["png", "jpg", "webp"];
const PRELOAD_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Decoded replacement image, RGBA8 packed little-endian into `u32`s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacementImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u32>,
}

impl ReplacementImage {
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let rgba = image::open(path)?.to_rgba8();
        let (width, height) = rgba.dimensions();
        let pixels = rgba.pixels().map(|p| u32::from_le_bytes(p.0)).collect();
        Ok(Self {
            width,
            height,
            pixels,
        })
    }
}

/// One replacement image placed over part of a texture page.
#[derive(Debug, Clone)]
pub struct SubImage {
    /// Destination in texel space of the page.
    pub dst_rect: Rect,
    pub image: Rc<ReplacementImage>,
    pub scale_x: f32,
    pub scale_y: f32,
    pub invert_alpha: bool,
}

type TextureReplacementMap = HashMap<ReplacementIndexKey, Vec<(TextureReplacementName, PathBuf)>>;

fn has_valid_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VALID_EXTENSIONS.iter().any(|v| e.eq_ignore_ascii_case(v)))
        .unwrap_or(false)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn insert_texture_name(
    map: &mut TextureReplacementMap,
    name: TextureReplacementName,
    path: PathBuf,
) -> bool {
    let entries = map.entry(name.index()).or_default();
    // Several replacements may share a source, but not the same name.
    if let Some((_, existing)) = entries.iter().find(|(n, _)| *n == name) {
        warn!(
            "Duplicate texture replacement: '{}' and '{}'",
            file_name(existing),
            file_name(&path)
        );
        return false;
    }
    entries.push((name, path));
    true
}

/// Scans the 8-bit or 4-bit indices inside `rect` and returns the tightest
/// `[min, max]` palette range in use, clamped so `x_base + max` stays in VRAM.
pub fn reduce_palette_bounds(
    vram: &Vram,
    rect: &Rect,
    mode: TextureMode,
    palette: PaletteReg,
) -> (u32, u32) {
    debug_assert!(mode.has_palette());
    let mut pal_min = mode.palette_width() - 1;
    let mut pal_max = 0;

    for y in rect.top..rect.bottom {
        let row = &vram.row(rect.left as u32, y as u32)[..rect.width() as usize];
        for &value in row {
            let (bits, count) = match mode {
                TextureMode::Palette4Bit => (4, 4),
                _ => (8, 2),
            };
            let mask = (1u32 << bits) - 1;
            for i in 0..count {
                let index = (value as u32 >> (i * bits)) & mask;
                pal_min = pal_min.min(index);
                pal_max = pal_max.max(index);
            }
        }
    }

    let x_base = palette.x_base();
    if x_base + pal_max >= VRAM_WIDTH {
        warn!(
            "Texture with CLUT at {},{} is outside of VRAM bounds, clamping.",
            x_base,
            palette.y_base()
        );
        pal_min = pal_min.min(VRAM_WIDTH - x_base - 1);
        pal_max = pal_max.min(VRAM_WIDTH - x_base - 1);
    }

    (pal_min, pal_max)
}

/// Does `name` apply under the palette currently at `palette`?
pub fn is_matching_replacement_palette(
    vram: &Vram,
    full_palette_hash: HashType,
    mode: TextureMode,
    palette: PaletteReg,
    name: &TextureReplacementName,
) -> bool {
    if !mode.has_palette() {
        return true;
    }

    let full_max = mode.palette_width() - 1;
    if name.pal_min == 0 && name.pal_max as u32 == full_max {
        return name.pal_hash == full_palette_hash;
    }

    if palette.x_base() + name.pal_max as u32 >= VRAM_WIDTH {
        return false;
    }

    // Rehashed per lookup; the hash cache keeps this off the hot path.
    let partial = hash_partial_palette(
        vram.palette(palette, mode),
        name.pal_min as u32,
        name.pal_max as u32,
    );
    partial == name.pal_hash
}

/// Index of replacement files for the current game, plus the decoded image cache.
#[derive(Default)]
pub struct ReplacementIndex {
    vram_replacements: HashMap<VramReplacementName, PathBuf>,
    vram_write_textures: TextureReplacementMap,
    texture_page_textures: TextureReplacementMap,
    image_cache: HashMap<PathBuf, Rc<ReplacementImage>>,
}

impl ReplacementIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets all names. Decoded images stay until `purge_unreferenced`.
    pub fn clear_names(&mut self) {
        self.vram_replacements.clear();
        self.vram_write_textures.clear();
        self.texture_page_textures.clear();
    }

    pub fn clear(&mut self) {
        self.clear_names();
        self.image_cache.clear();
    }

    pub fn vram_replacement_count(&self) -> usize {
        self.vram_replacements.len()
    }

    pub fn vram_write_texture_count(&self) -> usize {
        self.vram_write_textures.values().map(Vec::len).sum()
    }

    pub fn texture_page_texture_count(&self) -> usize {
        self.texture_page_textures.values().map(Vec::len).sum()
    }

    pub fn total_count(&self) -> usize {
        self.vram_replacement_count() + self.vram_write_texture_count() + self.texture_page_texture_count()
    }

    pub fn has_vram_write_textures(&self) -> bool {
        !self.vram_write_textures.is_empty()
    }

    pub fn has_texture_page_textures(&self) -> bool {
        !self.texture_page_textures.is_empty()
    }

    pub fn cached_image_count(&self) -> usize {
        self.image_cache.len()
    }

    fn add_file(
        &mut self,
        title: &str,
        path: PathBuf,
        load_vram_writes: bool,
        load_textures: bool,
    ) -> bool {
        match ReplacementKind::from_file_title(title) {
            None => false,
            Some(ReplacementKind::VramReplacement) => {
                if !load_vram_writes {
                    return false;
                }
                let Some(name) = VramReplacementName::parse(title) else {
                    warn!("Ignoring malformed VRAM replacement name '{}'", title);
                    return false;
                };
                if let Some(existing) = self.vram_replacements.get(&name) {
                    warn!(
                        "Duplicate VRAM replacement: '{}' and '{}'",
                        file_name(existing),
                        file_name(&path)
                    );
                    return false;
                }
                self.vram_replacements.insert(name, path);
                true
            }
            Some(kind) => {
                if !load_textures {
                    return false;
                }
                let Some(name) = TextureReplacementName::parse(title) else {
                    warn!("Ignoring malformed texture replacement name '{}'", title);
                    return false;
                };
                debug_assert_eq!(name.kind, kind);
                let map = if kind == ReplacementKind::TextureFromVramWrite {
                    &mut self.vram_write_textures
                } else {
                    &mut self.texture_page_textures
                };
                insert_texture_name(map, name, path)
            }
        }
    }

    /// Recursively indexes every replacement image under `dir`.
    pub fn scan(&mut self, dir: &Path, load_vram_writes: bool, load_textures: bool) {
        for entry in WalkDir::new(dir).follow_links(true) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    trace!("Skipping unreadable replacement entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || !has_valid_extension(entry.path()) {
                continue;
            }
            let Some(title) = entry.path().file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let title = title.to_string();
            self.add_file(&title, entry.into_path(), load_vram_writes, load_textures);
        }
    }

    /// Registers `[Aliases]` entries. Files are relative to `dir`.
    pub fn apply_aliases(
        &mut self,
        dir: &Path,
        aliases: &[(String, String)],
        load_vram_writes: bool,
        load_textures: bool,
    ) {
        for (name, file) in aliases {
            if ReplacementKind::from_file_title(name).is_none() {
                continue;
            }
            let path = dir.join(file);
            if !path.is_file() {
                error!("File '{}' for alias '{}' does not exist.", file, name);
                continue;
            }
            self.add_file(name, path, load_vram_writes, load_textures);
        }
    }

    pub fn log_counts(&self, game_id: &str, textures: bool, vram_writes: bool) {
        if textures {
            info!(
                "Found {} replacement upload textures for '{}'",
                self.vram_write_texture_count(),
                game_id
            );
            info!(
                "Found {} replacement page textures for '{}'",
                self.texture_page_texture_count(),
                game_id
            );
        }
        if vram_writes {
            info!(
                "Found {} replacement VRAM for '{}'",
                self.vram_replacement_count(),
                game_id
            );
        }
    }

    /// Loads (or returns the cached) image at `path`.
    pub fn image(&mut self, path: &Path) -> Option<Rc<ReplacementImage>> {
        if let Some(image) = self.image_cache.get(path) {
            return Some(image.clone());
        }

        match ReplacementImage::load(path) {
            Ok(image) => {
                trace!("Loaded '{}': {}x{}", file_name(path), image.width, image.height);
                let image = Rc::new(image);
                self.image_cache.insert(path.to_path_buf(), image.clone());
                Some(image)
            }
            Err(e) => {
                error!("Failed to load '{}': {}", file_name(path), e);
                None
            }
        }
    }

    fn all_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.vram_replacements.values().cloned().collect();
        for map in [&self.vram_write_textures, &self.texture_page_textures] {
            paths.extend(map.values().flatten().map(|(_, p)| p.clone()));
        }
        paths
    }

    /// Decodes every indexed image up front. `progress(loaded, total)` is
    /// called at most once per second.
    pub fn preload(&mut self, progress: &mut dyn FnMut(usize, usize)) {
        let paths = self.all_paths();
        let total = paths.len();
        let mut last_update = Instant::now();
        for (loaded, path) in paths.iter().enumerate() {
            if last_update.elapsed() >= PRELOAD_PROGRESS_INTERVAL {
                progress(loaded, total);
                last_update = Instant::now();
            }
            self.image(path);
        }
    }

    /// Drops cached images that no indexed name refers to anymore.
    pub fn purge_unreferenced(&mut self) {
        let referenced: std::collections::HashSet<PathBuf> = self.all_paths().into_iter().collect();
        self.image_cache.retain(|path, _| referenced.contains(path));
    }

    pub fn vram_replacement(&mut self, name: &VramReplacementName) -> Option<Rc<ReplacementImage>> {
        let path = self.vram_replacements.get(name)?.clone();
        self.image(&path)
    }

    /// True when a replacement with the same source/palette hash exists, ignoring sizes.
    pub fn is_replaced(&self, name: &TextureReplacementName) -> bool {
        let map = if name.kind == ReplacementKind::TextureFromPage {
            &self.texture_page_textures
        } else {
            &self.vram_write_textures
        };
        map.get(&name.index())
            .map(|entries| entries.iter().any(|(n, _)| n.pal_hash == name.pal_hash))
            .unwrap_or(false)
    }

    /// Collects upload replacements for a write with content hash `write_hash`.
    /// `offset_to_page` is the page origin relative to the write origin, in texels.
    pub fn gather_vram_write_subimages(
        &mut self,
        vram: &Vram,
        out: &mut Vec<SubImage>,
        write_hash: HashType,
        palette_hash: HashType,
        mode: TextureMode,
        palette: PaletteReg,
        offset_to_page: (i32, i32),
    ) {
        let key = ReplacementIndexKey {
            src_hash: write_hash,
            mode,
        };
        let Some(entries) = self.vram_write_textures.get(&key) else {
            return;
        };

        let candidates: Vec<(TextureReplacementName, PathBuf)> = entries
            .iter()
            .filter(|(name, _)| is_matching_replacement_palette(vram, palette_hash, mode, palette, name))
            .cloned()
            .collect();

        for (name, path) in candidates {
            let rect_in_page = name.dest_rect().offset(-offset_to_page.0, -offset_to_page.1);
            if rect_in_page.right <= 0
                || rect_in_page.bottom <= 0
                || rect_in_page.left >= TEXTURE_PAGE_WIDTH as i32
                || rect_in_page.top >= TEXTURE_PAGE_HEIGHT as i32
            {
                continue;
            }

            let Some(image) = self.image(&path) else {
                continue;
            };
            out.push(SubImage {
                dst_rect: rect_in_page,
                scale_x: image.width as f32 / name.width as f32,
                scale_y: image.height as f32 / name.height as f32,
                image,
                invert_alpha: name.semitransparent,
            });
        }
    }

    /// Collects page replacements matching the page at `page`. Sub-page names
    /// are matched by rehashing the named area of VRAM.
    pub fn gather_page_subimages(
        &mut self,
        vram: &Vram,
        out: &mut Vec<SubImage>,
        page: u32,
        page_hash: HashType,
        palette_hash: HashType,
        mode: TextureMode,
        palette: PaletteReg,
    ) {
        let shift = mode.shift() as i32;
        let start_x = page_start_x(page) as i32;
        let start_y = page_start_y(page) as i32;

        let mut candidates = Vec::new();
        for (key, entries) in &self.texture_page_textures {
            if key.mode != mode {
                continue;
            }
            for (name, path) in entries {
                if !is_matching_replacement_palette(vram, palette_hash, mode, palette, name) {
                    continue;
                }

                let rect_in_page = if name.width as u32 == TEXTURE_PAGE_WIDTH
                    && name.height as u32 == TEXTURE_PAGE_HEIGHT
                {
                    if name.src_hash != page_hash {
                        continue;
                    }
                    Rect::new(0, 0, TEXTURE_PAGE_WIDTH as i32, TEXTURE_PAGE_HEIGHT as i32)
                } else {
                    let rect = name.dest_rect();
                    let hash_rect_vram = Rect::new(
                        (rect.left >> shift) + start_x,
                        rect.top + start_y,
                        (rect.right >> shift) + start_x,
                        rect.bottom + start_y,
                    );
                    if hash_rect_vram.is_empty()
                        || hash_rect_vram.right > VRAM_WIDTH as i32
                        || hash_rect_vram.bottom > VRAM_HEIGHT as i32
                        || hash_rect(vram, &hash_rect_vram) != name.src_hash
                    {
                        continue;
                    }
                    rect
                };
                candidates.push((name.clone(), path.clone(), rect_in_page));
            }
        }

        for (name, path, rect_in_page) in candidates {
            let Some(image) = self.image(&path) else {
                continue;
            };
            out.push(SubImage {
                dst_rect: rect_in_page,
                scale_x: image.width as f32 / name.width as f32,
                scale_y: image.height as f32 / name.height as f32,
                image,
                invert_alpha: name.semitransparent,
            });
        }
    }
}
