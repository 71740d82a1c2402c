use super::{vram_bounds, HashCacheKey, PaletteRecordFlags, SourceId, TextureCache};
use crate::gpu_device::{GpuDevice, TextureHandle};
use crate::hash::{hash_page, hash_palette, HashType};
use crate::rect::Rect;
use crate::vram::{
    rect_pages, texture_rect, wrapped_texture_rect, x_wrapped_pages, PaletteReg, TextureMode,
    NUM_VRAM_PAGES,
};
use log::trace;
use smallvec::SmallVec;
use std::fmt;

// 4 texture pages, plus up to 5 for a 256-entry palette that isn't page aligned.
pub const MAX_PAGE_REFS_PER_SOURCE: usize = 9;

/// One cacheable interpretation of a page: (page, mode, palette).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub page: u8,
    pub mode: TextureMode,
    pub palette: PaletteReg,
}

impl SourceKey {
    /// Direct modes ignore the palette register, so it is zeroed to keep keys canonical.
    pub fn new(page: u32, mode: TextureMode, palette: PaletteReg) -> Self {
        debug_assert!((page as usize) < NUM_VRAM_PAGES);
        Self {
            page: page as u8,
            mode,
            palette: if mode.has_palette() { palette } else { PaletteReg(0) },
        }
    }

    pub fn page(&self) -> u32 {
        self.page as u32
    }

    pub fn has_palette(&self) -> bool {
        self.mode.has_palette()
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_palette() {
            write!(f, "{} Page[{}] {}", self.mode.name(), self.page, self.palette)
        } else {
            write!(f, "{} Page[{}]", self.mode.name(), self.page)
        }
    }
}

#[derive(Debug, Clone)]
pub struct Source {
    pub key: SourceKey,
    pub texture_hash: HashType,
    pub palette_hash: HashType,
    /// Footprint left of the VRAM edge.
    pub texture_rect: Rect,
    /// Footprint that wrapped to x = 0, or INVALID.
    pub wrapped_texture_rect: Rect,
    pub palette_rect: Rect,
    /// Union of sampled UV rects. Only grown while dumping.
    pub active_uv_rect: Rect,
    pub palette_record_flags: PaletteRecordFlags,
    pub texture: TextureHandle,
    pub(super) hash_key: HashCacheKey,
    pub(super) page_refs: SmallVec<[u32; MAX_PAGE_REFS_PER_SOURCE]>,
}

impl Source {
    /// Does writing `rect` change what this source decodes to?
    pub fn overlaps(&self, rect: &Rect) -> bool {
        self.texture_rect.intersects(rect)
            || self.wrapped_texture_rect.intersects(rect)
            || (self.key.has_palette() && self.palette_rect.intersects(rect))
    }

    pub fn page_refs(&self) -> &[u32] {
        &self.page_refs
    }

    pub fn hash_cache_key(&self) -> HashCacheKey {
        self.hash_key
    }
}

impl<D: GpuDevice> TextureCache<D> {
    /// Finds or builds the source for `key`. `uv_rect` is the VRAM area the draw
    /// samples (INVALID if unknown).
    pub fn lookup_source(
        &mut self,
        key: SourceKey,
        uv_rect: Rect,
        flags: PaletteRecordFlags,
    ) -> Option<SourceId> {
        let page = &mut self.pages[key.page as usize];
        let sources = &self.sources;
        if let Some(pos) = page.sources.iter().position(|&id| sources[id].key == key) {
            if crate::debug_flags::trace_sources() {
                trace!("TC: Source hit {}", key);
            }
            // approximate LRU within the page
            if let Some(id) = page.sources.remove(pos) {
                page.sources.push_front(id);
                return Some(self.return_source(id, uv_rect, flags));
            }
        }

        let id = self.create_source(key)?;
        Some(self.return_source(id, uv_rect, flags))
    }

    fn return_source(&mut self, id: SourceId, uv_rect: Rect, flags: PaletteRecordFlags) -> SourceId {
        let src = &mut self.sources[id];
        if let Some(entry) = self.hash_cache.entries.get_mut(&src.hash_key) {
            entry.last_used_frame = self.frame_number;
        } else {
            debug_assert!(false, "source without hash cache entry");
        }

        if self.settings.dump_textures {
            src.active_uv_rect = src.active_uv_rect.union(&uv_rect);
            src.palette_record_flags |= flags;
        }
        id
    }

    fn create_source(&mut self, key: SourceKey) -> Option<SourceId> {
        if crate::debug_flags::trace_sources() {
            trace!("TC: Create source {}", key);
        }

        let page = key.page();
        let texture_hash = hash_page(&self.vram, page, key.mode);
        let palette_hash = hash_palette(&self.vram, key.palette, key.mode);
        let hash_key = self.lookup_hash_cache(key, texture_hash, palette_hash)?;

        let entry = self.hash_cache.entries.get_mut(&hash_key)?;
        entry.ref_count += 1;
        let texture = entry.texture;

        let palette_rect = if key.has_palette() {
            key.palette.rect(key.mode)
        } else {
            Rect::INVALID
        };

        let id = self.sources.insert(Source {
            key,
            texture_hash,
            palette_hash,
            texture_rect: texture_rect(page, key.mode),
            wrapped_texture_rect: wrapped_texture_rect(page, key.mode),
            palette_rect,
            active_uv_rect: Rect::INVALID,
            palette_record_flags: PaletteRecordFlags::empty(),
            texture,
            hash_key,
            page_refs: SmallVec::new(),
        });
        entry.sources.push(id);

        let mut refs: SmallVec<[u32; MAX_PAGE_REFS_PER_SOURCE]> = SmallVec::new();
        for pn in x_wrapped_pages(page, key.mode.page_count()) {
            if !refs.contains(&pn) {
                refs.push(pn);
                self.pages[pn as usize].sources.push_front(id);
            }
        }
        if key.has_palette() {
            for pn in rect_pages(&palette_rect) {
                if !refs.contains(&pn) {
                    refs.push(pn);
                    self.pages[pn as usize].sources.push_back(id);
                }
            }
        }
        debug_assert!(refs.len() <= MAX_PAGE_REFS_PER_SOURCE);

        if crate::debug_flags::trace_sources() {
            trace!("TC: Linked new source {} to {} pages", key, refs.len());
        }
        self.sources[id].page_refs = refs;
        Some(id)
    }

    /// Unlinks and drops a source, handing its sampled area to the dumper first.
    pub(super) fn destroy_source(&mut self, id: SourceId) {
        let Some(src) = self.sources.remove(id) else {
            return;
        };
        if crate::debug_flags::trace_sources() {
            trace!("TC: Invalidate source {}", src.key);
        }

        if self.settings.dump_textures && !src.active_uv_rect.is_invalid() {
            if !self.config.dump_texture_pages {
                let uv = src.active_uv_rect.intersection(&vram_bounds());
                if !uv.is_empty() {
                    for pn in rect_pages(&uv) {
                        let writes = self.pages[pn as usize].writes.clone();
                        for wid in writes {
                            self.update_vram_write_sources(
                                wid,
                                src.key,
                                src.active_uv_rect,
                                src.palette_record_flags,
                            );
                        }
                    }
                }
            } else {
                self.dump_texture_from_page(&src);
            }
        }

        for &pn in &src.page_refs {
            self.pages[pn as usize].sources.retain(|&s| s != id);
        }

        match self.hash_cache.entries.get_mut(&src.hash_key) {
            Some(entry) => {
                debug_assert!(entry.ref_count > 0);
                entry.ref_count -= 1;
                entry.sources.retain(|s| *s != id);
            }
            None => debug_assert!(false, "source without hash cache entry"),
        }
    }

    /// Drops every source linked to `page`.
    pub fn invalidate_page_sources(&mut self, page: u32) {
        debug_assert!((page as usize) < NUM_VRAM_PAGES);
        while let Some(&id) = self.pages[page as usize].sources.front() {
            self.destroy_source(id);
        }
    }

    /// Drops the sources of `page` whose texture or palette overlaps `rect`.
    pub fn invalidate_page_sources_in_rect(&mut self, page: u32, rect: &Rect) {
        debug_assert!((page as usize) < NUM_VRAM_PAGES);
        let sources = &self.sources;
        let doomed: SmallVec<[SourceId; 16]> = self.pages[page as usize]
            .sources
            .iter()
            .copied()
            .filter(|&id| sources[id].overlaps(rect))
            .collect();

        for id in doomed {
            self.destroy_source(id);
        }
    }

    /// True if any page under `rect` was rendered into within `rect`.
    pub fn is_rect_drawn(&self, rect: &Rect) -> bool {
        let rect = rect.intersection(&vram_bounds());
        if rect.is_empty() {
            return false;
        }
        rect_pages(&rect).any(|pn| self.pages[pn as usize].is_drawn(&rect))
    }

    /// True if any page of `key`'s texture footprint has draws intersecting `rect`.
    pub fn are_source_pages_drawn(&self, key: SourceKey, rect: &Rect) -> bool {
        x_wrapped_pages(key.page(), key.mode.page_count())
            .any(|pn| self.pages[pn as usize].is_drawn(rect))
    }

    /// Records a hardware draw into `rect`. `clip` is the current drawing area,
    /// used to pick which draw rect of a full page absorbs the new area.
    pub fn add_drawn_rectangle(&mut self, rect: &Rect, clip: &Rect) {
        let rect = rect.intersection(&vram_bounds());
        if rect.is_empty() {
            return;
        }

        for pn in rect_pages(&rect) {
            let writes = self.pages[pn as usize].writes.clone();
            for wid in writes {
                let hit = self
                    .writes
                    .get(wid)
                    .map(|w| w.active_rect.intersects(&rect))
                    .unwrap_or(false);
                if hit {
                    self.remove_vram_write(wid);
                }
            }

            let rc = rect.intersection(&crate::vram::page_rect(pn));
            if let Some(invalidated) = self.pages[pn as usize].add_draw_rect(rc, clip) {
                self.invalidate_page_sources_in_rect(pn, &invalidated);
            }
        }
    }
}
