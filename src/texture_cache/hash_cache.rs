use super::{SourceId, SourceKey, TextureCache};
use crate::decode::decode_texture;
use crate::gpu_device::{GpuDevice, TextureHandle, TextureKind};
use crate::hash::HashType;
use crate::vram::{page_start_x, page_start_y, TextureMode, TEXTURE_PAGE_HEIGHT, TEXTURE_PAGE_WIDTH};
use log::{error, trace, warn};
use smallvec::SmallVec;
use std::collections::HashMap;

/// Frames an unreferenced entry survives before `compact` drops it.
pub const MAX_HASH_CACHE_AGE: u32 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashCacheKey {
    pub texture_hash: HashType,
    pub palette_hash: HashType,
    pub mode: TextureMode,
}

#[derive(Debug)]
pub struct HashCacheEntry {
    pub texture: TextureHandle,
    /// Live sources backed by this entry.
    pub ref_count: u32,
    pub last_used_frame: u32,
    pub vram_usage: usize,
    pub(super) sources: SmallVec<[SourceId; 4]>,
}

#[derive(Debug, Default)]
pub struct HashCache {
    pub(super) entries: HashMap<HashCacheKey, HashCacheEntry>,
    pub(super) memory_usage: usize,
}

impl HashCache {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn memory_usage(&self) -> usize {
        self.memory_usage
    }

    pub fn get(&self, key: &HashCacheKey) -> Option<&HashCacheEntry> {
        self.entries.get(key)
    }

    /// Picks the entries to drop at `frame`: every unreferenced entry older
    /// than `MAX_HASH_CACHE_AGE`, then the least recently used unreferenced
    /// entries until both limits hold. The flag is set when the limits still
    /// can't be met.
    pub fn select_evictions(
        &self,
        frame: u32,
        max_entries: usize,
        max_bytes: usize,
    ) -> (Vec<HashCacheKey>, bool) {
        let min_frame = frame.saturating_sub(MAX_HASH_CACHE_AGE);
        let mut count = self.entries.len();
        let mut bytes = self.memory_usage;
        let mut evict = Vec::new();
        let mut purge_list = Vec::new();

        for (key, entry) in &self.entries {
            if entry.ref_count > 0 {
                continue;
            }
            if entry.last_used_frame < min_frame {
                evict.push(*key);
                count -= 1;
                bytes = bytes.saturating_sub(entry.vram_usage);
            } else {
                purge_list.push((entry.last_used_frame, *key, entry.vram_usage));
            }
        }

        let over = |count: usize, bytes: usize| count > max_entries || bytes > max_bytes;
        if over(count, bytes) {
            purge_list.sort_unstable_by_key(|&(frame, key, _)| (frame, key));
            for (_, key, usage) in purge_list {
                if !over(count, bytes) {
                    break;
                }
                evict.push(key);
                count -= 1;
                bytes = bytes.saturating_sub(usage);
            }
        }

        (evict, over(count, bytes))
    }
}

impl<D: GpuDevice> TextureCache<D> {
    /// Returns the key of the entry for (texture, palette, mode), decoding the
    /// page into a new texture on a miss. None if the device is out of textures.
    pub(super) fn lookup_hash_cache(
        &mut self,
        key: SourceKey,
        texture_hash: HashType,
        palette_hash: HashType,
    ) -> Option<HashCacheKey> {
        let hkey = HashCacheKey {
            texture_hash,
            palette_hash,
            mode: key.mode,
        };
        if self.hash_cache.entries.contains_key(&hkey) {
            trace!("TC: Hash cache hit {:X} {:X}", texture_hash, palette_hash);
            self.stats.hits += 1;
            return Some(hkey);
        }

        trace!("TC: Hash cache miss {:X} {:X}", texture_hash, palette_hash);
        self.stats.misses += 1;

        let Some(texture) =
            self.device
                .fetch_texture(TEXTURE_PAGE_WIDTH, TEXTURE_PAGE_HEIGHT, TextureKind::Texture)
        else {
            error!("Failed to create texture.");
            return None;
        };
        self.decode_page_into(key, texture);

        let texture = if self.settings.enable_texture_replacements {
            self.apply_texture_replacements(key, texture_hash, palette_hash, texture)
        } else {
            texture
        };

        let vram_usage = self.device.texture_vram_usage(texture);
        self.hash_cache.memory_usage += vram_usage;
        self.hash_cache.entries.insert(
            hkey,
            HashCacheEntry {
                texture,
                ref_count: 0,
                last_used_frame: 0,
                vram_usage,
                sources: SmallVec::new(),
            },
        );
        Some(hkey)
    }

    fn decode_page_into(&mut self, key: SourceKey, texture: TextureHandle) {
        let palette: &[u16] = if key.has_palette() {
            self.vram.palette(key.palette, key.mode)
        } else {
            &[]
        };
        let pixels = decode_texture(
            key.mode,
            &self.vram,
            page_start_x(key.page()),
            page_start_y(key.page()),
            TEXTURE_PAGE_WIDTH,
            TEXTURE_PAGE_HEIGHT,
            palette,
        );
        if !self
            .device
            .update_texture(texture, 0, 0, TEXTURE_PAGE_WIDTH, TEXTURE_PAGE_HEIGHT, &pixels)
        {
            error!("Failed to upload decoded page for {}", key);
        }
    }

    /// Destroys the entry's sources, then returns its texture to the device.
    pub(super) fn remove_from_hash_cache(&mut self, key: &HashCacheKey) {
        let sources = match self.hash_cache.entries.get(key) {
            Some(entry) => entry.sources.clone(),
            None => return,
        };
        for id in sources {
            self.destroy_source(id);
        }

        if let Some(entry) = self.hash_cache.entries.remove(key) {
            debug_assert_eq!(entry.ref_count, 0);
            debug_assert!(self.hash_cache.memory_usage >= entry.vram_usage);
            self.hash_cache.memory_usage = self.hash_cache.memory_usage.saturating_sub(entry.vram_usage);
            self.device.recycle_texture(entry.texture);
        }
    }

    pub(super) fn clear_hash_cache(&mut self) {
        let keys: Vec<HashCacheKey> = self.hash_cache.entries.keys().copied().collect();
        for key in keys {
            self.remove_from_hash_cache(&key);
        }
    }

    /// Evicts stale and excess entries. Meant to run once per frame, after
    /// `set_frame_number`.
    pub fn compact(&mut self) {
        let (evict, still_over) = self.hash_cache.select_evictions(
            self.frame_number,
            self.config.max_hash_cache_entries as usize,
            self.config.max_hash_cache_vram_usage_bytes(),
        );

        for key in &evict {
            self.remove_from_hash_cache(key);
        }
        self.stats.evictions += evict.len() as u64;

        if still_over {
            warn!(
                "Cannot find hash cache entries to purge, current hash cache size is {:.2} MB in {} textures.",
                self.hash_cache.memory_usage as f64 / 1048576.0,
                self.hash_cache.entries.len()
            );
        }
    }
}
