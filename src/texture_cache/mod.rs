mod hash_cache;
mod page;
mod replace;
mod source;
mod writes;

#[cfg(test)]
mod tests;

pub use hash_cache::{HashCache, HashCacheEntry, HashCacheKey, MAX_HASH_CACHE_AGE};
pub use page::{PageEntry, NUM_PAGE_DRAW_RECTS};
pub use source::{Source, SourceKey, MAX_PAGE_REFS_PER_SOURCE};
pub use writes::{
    split_remainders, PaletteRecord, PaletteRecordFlags, VramWrite, MAX_PAGE_REFS_PER_WRITE,
};

use crate::config::{CacheSettings, Configuration, LOCAL_CONFIG_FILENAME};
use crate::debug_flags;
use crate::dump::{DumpTarget, TextureDumper};
use crate::error::{CacheError, Result};
use crate::gpu_device::{GpuDevice, PipelineConfig, PipelineHandle, TextureHandle};
use crate::hash::hash_upload;
use crate::rect::Rect;
use crate::replacement::{ReplacementImage, ReplacementIndex, VramReplacementName};
use crate::savestate::{
    PaletteRecordState, SourceKeyState, TextureCacheState, VramWriteState, MIN_STATE_VERSION,
};
use crate::vram::{PaletteReg, Vram, MAX_CLUT_SIZE, NUM_VRAM_PAGES, VRAM_HEIGHT, VRAM_WIDTH};
use log::{debug, info, warn};
use slotmap::SlotMap;
use smallvec::SmallVec;
use std::collections::HashSet;
use std::path::PathBuf;
use std::rc::Rc;

slotmap::new_key_type! {
    pub struct SourceId;
    pub struct WriteId;
}

fn vram_bounds() -> Rect {
    Rect::new(0, 0, VRAM_WIDTH as i32, VRAM_HEIGHT as i32)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub sources: usize,
    pub vram_writes: usize,
    pub hash_cache_entries: usize,
    pub hash_cache_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, Copy)]
struct Pipelines {
    normal: PipelineHandle,
    invert_alpha: PipelineHandle,
}

/// The texture cache for one emulation session: VRAM, the page table, live
/// sources, pending writes, the hash cache and the replacement/dump state.
pub struct TextureCache<D: GpuDevice> {
    device: D,
    vram: Vram,
    settings: CacheSettings,
    // host config merged with the per-title file
    config: Configuration,
    game_id: String,
    frame_number: u32,

    pages: Vec<PageEntry>,
    sources: SlotMap<SourceId, Source>,
    writes: SlotMap<WriteId, VramWrite>,
    last_write: Option<WriteId>,
    track_vram_writes: bool,

    hash_cache: HashCache,
    replacements: ReplacementIndex,
    dumper: TextureDumper,
    pipelines: Option<Pipelines>,
    replacement_render_target: Option<TextureHandle>,
    preload_progress: Option<Box<dyn FnMut(usize, usize)>>,

    stats: CacheStats,
}

impl<D: GpuDevice> TextureCache<D> {
    pub fn new(device: D, settings: CacheSettings) -> Self {
        let config = settings.config.clone();
        Self {
            device,
            vram: Vram::new(),
            settings,
            config,
            game_id: String::new(),
            frame_number: 0,
            pages: vec![PageEntry::default(); NUM_VRAM_PAGES],
            sources: SlotMap::with_key(),
            writes: SlotMap::with_key(),
            last_write: None,
            track_vram_writes: false,
            hash_cache: HashCache::default(),
            replacements: ReplacementIndex::new(),
            dumper: TextureDumper::new(),
            pipelines: None,
            replacement_render_target: None,
            preload_progress: None,
            stats: CacheStats::default(),
        }
    }

    pub fn initialize(&mut self) -> Result<()> {
        self.load_local_configuration(false, false);
        self.update_tracking_state();
        self.compile_pipelines()
    }

    /// Applies new host settings. Toggling replacements rebuilds everything;
    /// a changed per-title config reloads the replacement index.
    pub fn update_settings(&mut self, settings: CacheSettings) -> Result<()> {
        let old = std::mem::replace(&mut self.settings, settings);
        self.update_tracking_state();

        if old.enable_texture_replacements != self.settings.enable_texture_replacements {
            self.invalidate();
            self.destroy_pipelines();
            self.compile_pipelines()?;
        }

        let replacements_changed = old.enable_texture_replacements
            != self.settings.enable_texture_replacements
            || old.enable_vram_write_replacements != self.settings.enable_vram_write_replacements
            || old.textures_dir != self.settings.textures_dir;

        let old_linear_filter = self.config.replacement_scale_linear_filter;
        if self.load_local_configuration(false, false) || replacements_changed {
            if self.config.replacement_scale_linear_filter != old_linear_filter {
                self.compile_pipelines()?;
            }
            self.reload_texture_replacements();
        }
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.invalidate();
        self.clear_hash_cache();
        self.destroy_pipelines();
        if let Some(rt) = self.replacement_render_target.take() {
            self.device.recycle_texture(rt);
        }
        self.track_vram_writes = false;
        self.replacements.clear();
        self.dumper.clear();
        self.game_id.clear();
    }

    pub fn set_game_id(&mut self, game_id: &str) {
        if self.game_id == game_id {
            return;
        }
        self.game_id = game_id.to_string();
        self.reload_texture_replacements();
    }

    /// Called between preload steps with (loaded, total).
    pub fn set_preload_progress_callback(&mut self, callback: Box<dyn FnMut(usize, usize)>) {
        self.preload_progress = Some(callback);
    }

    fn dump_target(&self) -> DumpTarget<'_> {
        DumpTarget {
            textures_dir: &self.settings.textures_dir,
            game_id: &self.game_id,
        }
    }

    pub fn replacement_directory(&self) -> PathBuf {
        self.dump_target().replacement_directory()
    }

    pub fn dump_directory(&self) -> PathBuf {
        self.dump_target().dump_directory()
    }

    /// Rebuilds the replacement index for the current game, then drops every
    /// source so the next lookups pick replacements up.
    pub fn reload_texture_replacements(&mut self) {
        self.replacements.clear_names();

        let load_vram_writes = self.settings.enable_vram_write_replacements;
        let load_textures = self.settings.enable_texture_replacements;
        if (load_vram_writes || load_textures) && !self.game_id.is_empty() {
            let dir = self.replacement_directory();
            self.replacements.scan(&dir, load_vram_writes, load_textures);
        }

        self.load_local_configuration(load_vram_writes, load_textures);
        if !self.game_id.is_empty() {
            self.replacements
                .log_counts(&self.game_id, load_textures, load_vram_writes);
        }

        if self.settings.preload_textures {
            match self.preload_progress.as_mut() {
                Some(progress) => self.replacements.preload(&mut **progress),
                None => self.replacements.preload(&mut |_: usize, _: usize| {}),
            }
        }

        self.replacements.purge_unreferenced();
        self.update_tracking_state();
        self.invalidate_sources();
    }

    /// Rebuilds `config` from the host defaults plus `<game>/config.toml`,
    /// registering its aliases if asked. Returns true if the config changed.
    fn load_local_configuration(&mut self, load_vram_write_aliases: bool, load_texture_aliases: bool) -> bool {
        let old = std::mem::replace(&mut self.config, self.settings.config.clone());
        if self.game_id.is_empty() {
            return self.config != old;
        }

        let path = self.dump_target().game_directory().join(LOCAL_CONFIG_FILENAME);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(_) => return self.config != old,
        };

        match self.config.parse_local(&text) {
            Ok(local) => {
                self.config = local.config;
                if load_vram_write_aliases || load_texture_aliases {
                    let dir = self.replacement_directory();
                    self.replacements.apply_aliases(
                        &dir,
                        &local.aliases,
                        load_vram_write_aliases,
                        load_texture_aliases,
                    );
                }
            }
            Err(e) => warn!("Failed to parse {}: {}", path.display(), e),
        }

        self.config != old
    }

    fn is_dumping_vram_write_textures(&self) -> bool {
        self.settings.dump_textures && !self.config.dump_texture_pages
    }

    fn should_track_vram_writes(&self) -> bool {
        self.settings.always_track_uploads
            || debug_flags::always_track_vram_writes()
            || self.is_dumping_vram_write_textures()
            || (self.settings.enable_texture_replacements && self.replacements.has_vram_write_textures())
    }

    fn update_tracking_state(&mut self) {
        let track = self.should_track_vram_writes();
        if track != self.track_vram_writes {
            debug!("VRAM write tracking {}", if track { "enabled" } else { "disabled" });
        }
        self.track_vram_writes = track;
    }

    fn compile_pipelines(&mut self) -> Result<()> {
        if !self.settings.enable_texture_replacements {
            return Ok(());
        }
        self.destroy_pipelines();

        let linear_filter = self.config.replacement_scale_linear_filter;
        let normal = self
            .device
            .create_pipeline(PipelineConfig {
                invert_alpha: false,
                linear_filter,
            })
            .ok_or(CacheError::PipelineCompile("replacement merge"))?;
        let Some(invert_alpha) = self.device.create_pipeline(PipelineConfig {
            invert_alpha: true,
            linear_filter,
        }) else {
            self.device.destroy_pipeline(normal);
            return Err(CacheError::PipelineCompile("semi-transparent replacement merge"));
        };

        self.pipelines = Some(Pipelines {
            normal,
            invert_alpha,
        });
        Ok(())
    }

    fn destroy_pipelines(&mut self) {
        if let Some(p) = self.pipelines.take() {
            self.device.destroy_pipeline(p.normal);
            self.device.destroy_pipeline(p.invert_alpha);
        }
    }

    /// Frame counter used for hash cache ageing.
    pub fn set_frame_number(&mut self, frame: u32) {
        self.frame_number = frame;
    }

    /// Drops everything: sources, draw rects, pending writes (dumping them)
    /// and the hash cache.
    pub fn invalidate(&mut self) {
        for pn in 0..NUM_VRAM_PAGES {
            self.invalidate_page_sources(pn as u32);
            self.pages[pn].clear_draw_rects();

            while let Some(&id) = self.pages[pn].writes.last() {
                if self.writes.contains_key(id) {
                    self.remove_vram_write(id);
                } else {
                    debug_assert!(false, "stale write on page {}", pn);
                    self.pages[pn].writes.pop();
                }
            }
        }

        debug_assert!(self.pages.iter().all(|p| p.sources.is_empty()));
        debug_assert!(self.last_write.is_none());
        self.clear_hash_cache();
    }

    /// Drops sources and the hash cache, keeping draw rects and writes.
    pub fn invalidate_sources(&mut self) {
        for pn in 0..NUM_VRAM_PAGES {
            self.invalidate_page_sources(pn as u32);
        }
        self.clear_hash_cache();
    }

    /// Fills `rect` with `color` as a CPU-side write.
    pub fn fill_vram(&mut self, rect: &Rect, color: u16) {
        let rect = rect.intersection(&vram_bounds());
        if rect.is_empty() {
            return;
        }
        self.add_written_rectangle(&rect, false);
        self.vram.fill(&rect, color);
    }

    /// Whole-upload replacement for the given pixels, if one exists.
    pub fn vram_replacement(&mut self, width: u32, height: u32, pixels: &[u16]) -> Option<Rc<ReplacementImage>> {
        let len = (width * height) as usize;
        if pixels.len() < len {
            return None;
        }
        let name = VramReplacementName::from_hash(hash_upload(&pixels[..len]));
        self.replacements.vram_replacement(&name)
    }

    pub fn should_dump_vram_write(&self, width: u32, height: u32) -> bool {
        self.settings.dump_vram_writes
            && width >= self.config.vram_write_dump_width_threshold
            && height >= self.config.vram_write_dump_height_threshold
    }

    pub fn dump_vram_write(&mut self, width: u32, height: u32, pixels: &[u16]) {
        if pixels.len() < (width * height) as usize {
            return;
        }
        let target = DumpTarget {
            textures_dir: &self.settings.textures_dir,
            game_id: &self.game_id,
        };
        self.dumper
            .dump_vram_write(target, &self.config, width, height, pixels);
    }

    /// Every distinct pending write, with palette records brought up to date
    /// when dumping.
    pub fn save_state(&mut self) -> TextureCacheState {
        let mut state = TextureCacheState {
            vram: self.vram.pixels().to_vec(),
            writes: Vec::new(),
        };
        if !self.track_vram_writes {
            return state;
        }

        let mut order = Vec::new();
        let mut seen = HashSet::new();
        for pn in 0..NUM_VRAM_PAGES {
            for &id in &self.pages[pn].writes {
                if seen.insert(id) {
                    order.push(id);
                }
            }
        }

        if self.settings.dump_textures {
            for &id in &order {
                self.sync_vram_write_palette_records(id);
            }
        }

        state.writes = order
            .iter()
            .filter_map(|&id| self.writes.get(id))
            .map(write_state)
            .collect();
        state
    }

    /// Restores VRAM and the pending writes. Streams older than
    /// `MIN_STATE_VERSION` carry no cache state and just leave the cache empty.
    pub fn load_state(&mut self, stream_version: u32, state: &TextureCacheState) -> Result<()> {
        if stream_version < MIN_STATE_VERSION {
            warn!("Texture cache not in save state due to old version.");
            self.invalidate();
            return Ok(());
        }

        self.invalidate();
        state.validate()?;

        // restored hashes describe this image, so it goes in before any write
        if !self.vram.restore(&state.vram) {
            return Err(CacheError::CorruptState("VRAM image has wrong size"));
        }
        if !self.track_vram_writes {
            return Ok(());
        }

        // palette records only matter for dumping
        let keep_records = self.settings.dump_textures;
        for ws in &state.writes {
            let palette_records = if keep_records {
                ws.palette_records.iter().map(record_from_state).collect()
            } else {
                Vec::new()
            };
            self.insert_write(VramWrite {
                active_rect: ws.active_rect,
                write_rect: ws.write_rect,
                hash: ws.hash,
                num_splits: 0,
                palette_records,
                page_refs: SmallVec::new(),
            });
        }

        info!("Restored {} VRAM writes from save state", state.writes.len());
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            sources: self.sources.len(),
            vram_writes: self.writes.len(),
            hash_cache_entries: self.hash_cache.len(),
            hash_cache_bytes: self.hash_cache.memory_usage(),
            ..self.stats
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn vram(&self) -> &Vram {
        &self.vram
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    pub fn frame_number(&self) -> u32 {
        self.frame_number
    }

    pub fn is_tracking_vram_writes(&self) -> bool {
        self.track_vram_writes
    }

    pub fn page(&self, page: u32) -> &PageEntry {
        &self.pages[page as usize]
    }

    pub fn source(&self, id: SourceId) -> Option<&Source> {
        self.sources.get(id)
    }

    pub fn vram_write(&self, id: WriteId) -> Option<&VramWrite> {
        self.writes.get(id)
    }

    pub fn vram_writes(&self) -> impl Iterator<Item = (WriteId, &VramWrite)> {
        self.writes.iter()
    }

    pub fn last_vram_write(&self) -> Option<WriteId> {
        self.last_write
    }

    pub fn hash_cache(&self) -> &HashCache {
        &self.hash_cache
    }

    pub fn replacements(&self) -> &ReplacementIndex {
        &self.replacements
    }

    pub fn dumper(&self) -> &TextureDumper {
        &self.dumper
    }
}

fn write_state(write: &VramWrite) -> VramWriteState {
    VramWriteState {
        active_rect: write.active_rect,
        write_rect: write.write_rect,
        hash: write.hash,
        palette_records: write
            .palette_records
            .iter()
            .map(|rec| PaletteRecordState {
                rect: rec.rect,
                key: SourceKeyState {
                    page: rec.key.page,
                    mode: rec.key.mode,
                    palette: rec.key.palette.0,
                },
                flags: rec.flags.bits(),
                palette_hash: rec.palette_hash,
                palette: rec.palette.to_vec(),
            })
            .collect(),
    }
}

fn record_from_state(rs: &PaletteRecordState) -> PaletteRecord {
    let mut palette = [0u16; MAX_CLUT_SIZE];
    palette.copy_from_slice(&rs.palette);
    PaletteRecord {
        rect: rs.rect,
        key: SourceKey::new(rs.key.page as u32, rs.key.mode, PaletteReg(rs.key.palette)),
        flags: PaletteRecordFlags::from_bits_truncate(rs.flags),
        palette_hash: rs.palette_hash,
        palette,
    }
}
