use super::{vram_bounds, Source, SourceKey, TextureCache, WriteId};
use crate::debug_flags;
use crate::dump::{DumpRequest, DumpTarget};
use crate::gpu_device::GpuDevice;
use crate::hash::{hash_palette, hash_partial_palette, hash_rect, HashType};
use crate::rect::Rect;
use crate::replacement::{reduce_palette_bounds, ReplacementKind};
use crate::vram::{rect_pages, transfer_bounds, Vram, MAX_CLUT_SIZE};
use bitflags::bitflags;
use log::{debug, warn};
use smallvec::SmallVec;

// A full-width upload covering all of VRAM touches every page.
pub const MAX_PAGE_REFS_PER_WRITE: usize = 32;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PaletteRecordFlags: u8 {
        const HAS_SEMI_TRANSPARENT_DRAWS = 0b00000001;
    }
}

/// Palette snapshot for one source key that sampled part of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaletteRecord {
    /// Sampled area, in VRAM halfwords.
    pub rect: Rect,
    pub key: SourceKey,
    pub flags: PaletteRecordFlags,
    pub palette_hash: HashType,
    pub palette: [u16; MAX_CLUT_SIZE],
}

impl PaletteRecord {
    /// Freezes the palette `key` points at right now. 8-bit palettes running
    /// off the right edge of VRAM are zero padded and hashed over what exists.
    pub fn capture(vram: &Vram, key: SourceKey, rect: Rect, flags: PaletteRecordFlags) -> Self {
        let mut palette = [0u16; MAX_CLUT_SIZE];
        let palette_hash = if key.has_palette() {
            let live = vram.palette(key.palette, key.mode);
            palette[..live.len()].copy_from_slice(live);
            hash_palette(vram, key.palette, key.mode)
        } else {
            0
        };

        Self {
            rect,
            key,
            flags,
            palette_hash,
            palette,
        }
    }

    pub fn has_semi_transparent_draws(&self) -> bool {
        self.flags.contains(PaletteRecordFlags::HAS_SEMI_TRANSPARENT_DRAWS)
    }
}

/// A CPU upload that hasn't been fully overwritten or drawn over yet.
#[derive(Debug, Clone)]
pub struct VramWrite {
    /// Part of the upload still holding its original content.
    pub active_rect: Rect,
    /// The upload as it was made (after coalescing). Hashes and names use this.
    pub write_rect: Rect,
    pub hash: HashType,
    pub num_splits: u32,
    pub palette_records: Vec<PaletteRecord>,
    pub(super) page_refs: SmallVec<[u32; MAX_PAGE_REFS_PER_WRITE]>,
}

impl VramWrite {
    fn new(rect: Rect, hash: HashType) -> Self {
        Self {
            active_rect: rect,
            write_rect: rect,
            hash,
            num_splits: 0,
            palette_records: Vec::new(),
            page_refs: SmallVec::new(),
        }
    }

    pub fn page_refs(&self) -> &[u32] {
        &self.page_refs
    }
}

/// Carves `active` minus `split` into up to four disjoint rectangles (some may
/// be empty). `split` must lie inside `active`. Cuts along the axis with the
/// larger margin first so the common strip case yields two pieces.
pub fn split_remainders(active: &Rect, split: &Rect) -> [Rect; 4] {
    let (a, s) = (active, split);
    let to_left = s.left - a.left;
    let to_right = a.right - s.right;
    let to_top = s.top - a.top;
    let to_bottom = a.bottom - s.bottom;

    if to_top.max(to_bottom) > to_left.max(to_right) {
        [
            Rect::new(a.left, a.top, a.right, s.top),
            Rect::new(a.left, s.bottom, a.right, a.bottom),
            Rect::new(a.left, s.top, s.left, s.bottom),
            Rect::new(s.right, s.top, a.right, s.bottom),
        ]
    } else {
        [
            Rect::new(a.left, a.top, s.left, a.bottom),
            Rect::new(s.right, a.top, a.right, a.bottom),
            Rect::new(s.left, a.top, s.right, s.top),
            Rect::new(s.left, s.bottom, s.right, a.bottom),
        ]
    }
}

impl<D: GpuDevice> TextureCache<D> {
    fn link_write(&mut self, id: WriteId) {
        let Some(write) = self.writes.get_mut(id) else {
            return;
        };
        write.page_refs.clear();
        for pn in rect_pages(&write.active_rect) {
            debug_assert!(write.page_refs.len() < MAX_PAGE_REFS_PER_WRITE);
            write.page_refs.push(pn);
            self.pages[pn as usize].writes.push(id);
        }
    }

    fn unlink_write(&mut self, id: WriteId) {
        let Some(write) = self.writes.get_mut(id) else {
            return;
        };
        for pn in write.page_refs.drain(..) {
            self.pages[pn as usize].writes.retain(|&w| w != id);
        }
    }

    pub(super) fn insert_write(&mut self, write: VramWrite) -> WriteId {
        let id = self.writes.insert(write);
        self.link_write(id);
        id
    }

    /// CPU-to-VRAM transfer of `width * height` halfwords, row-major.
    /// Coordinates wrap at the VRAM edges.
    pub fn write_vram(
        &mut self,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        data: &[u16],
        set_mask: bool,
        check_mask: bool,
    ) {
        if width == 0 || height == 0 {
            return;
        }
        if data.len() < (width * height) as usize {
            warn!(
                "Ignoring VRAM write of {}x{} at ({}, {}) with only {} halfwords",
                width,
                height,
                x,
                y,
                data.len()
            );
            return;
        }

        let bounds = transfer_bounds(x, y, width, height);
        self.add_written_rectangle(&bounds, false);

        if self.should_dump_vram_write(width, height) {
            self.dump_vram_write(width, height, data);
        }

        self.vram.write(x, y, width, height, data, set_mask, check_mask);

        if !self.track_vram_writes {
            return;
        }

        if let Some(last) = self.last_write {
            if self.try_merge_vram_write(last, &bounds) {
                return;
            }
        }

        let hash = hash_rect(&self.vram, &bounds);
        let id = self.insert_write(VramWrite::new(bounds, hash));
        if debug_flags::trace_writes() {
            debug!(
                "New VRAM write {:016X} at {} touching {} pages",
                hash,
                bounds,
                self.writes[id].page_refs.len()
            );
        }
        self.last_write = Some(id);
    }

    /// VRAM-to-VRAM transfer. The whole source is read before anything is written.
    pub fn copy_vram(
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
        if width == 0 || height == 0 {
            return;
        }

        let dst_bounds = transfer_bounds(dst_x, dst_y, width, height);
        if !self.config.convert_copies_to_writes {
            self.add_written_rectangle(&dst_bounds, false);
            self.vram
                .copy(src_x, src_y, dst_x, dst_y, width, height, set_mask, check_mask);
            return;
        }

        // dump whatever the destination held before it gets replaced
        let mut flushed: SmallVec<[WriteId; 8]> = SmallVec::new();
        for pn in rect_pages(&dst_bounds) {
            let ids = self.pages[pn as usize].writes.clone();
            for id in ids {
                if flushed.contains(&id) {
                    continue;
                }
                let hit = self
                    .writes
                    .get(id)
                    .map(|w| w.active_rect.intersects(&dst_bounds))
                    .unwrap_or(false);
                if !hit {
                    continue;
                }
                flushed.push(id);
                self.sync_vram_write_palette_records(id);
                if let Some(write) = self.writes.get(id).cloned() {
                    self.dump_textures_from_vram_write(&write);
                }
            }
        }

        self.vram
            .copy(src_x, src_y, dst_x, dst_y, width, height, set_mask, check_mask);
        self.add_written_rectangle(&dst_bounds, true);
    }

    /// Handles new content in `rect`: drops the sources reading it, forgets
    /// draws there, and splits, rehashes or removes the writes it overlaps.
    /// With `update_in_place`, writes lying entirely inside `rect` keep their
    /// identity and are only rehashed.
    pub fn add_written_rectangle(&mut self, rect: &Rect, update_in_place: bool) {
        let rect = rect.intersection(&vram_bounds());
        if rect.is_empty() {
            return;
        }

        for pn in rect_pages(&rect) {
            self.invalidate_page_sources_in_rect(pn, &rect);
            self.pages[pn as usize].remove_draw_rects_intersecting(&rect);

            let ids = self.pages[pn as usize].writes.clone();
            for id in ids {
                let Some(write) = self.writes.get(id) else {
                    continue;
                };
                let intersection = write.active_rect.intersection(&rect);
                if intersection.is_empty() {
                    continue;
                }

                if update_in_place && rect.contains(&write.active_rect) {
                    let new_hash = hash_rect(&self.vram, &write.write_rect);
                    if debug_flags::trace_writes() {
                        debug!("New VRAM write hash {:016X} => {:016X}", write.hash, new_hash);
                    }
                    self.writes[id].hash = new_hash;
                } else if write.num_splits < self.config.max_vram_write_splits
                    && write.active_rect != intersection
                {
                    self.split_vram_write(id, &intersection);
                } else {
                    self.remove_vram_write(id);
                }
            }
        }
    }

    /// Grows write `id` by `rect` when it directly continues it and nothing
    /// has sampled the write yet.
    fn try_merge_vram_write(&mut self, id: WriteId, rect: &Rect) -> bool {
        let Some(last) = self.writes.get(id) else {
            return false;
        };

        // split writes are never grown again
        if last.num_splits != 0 {
            return false;
        }

        let coalesce_width = self.config.max_vram_write_coalesce_width as i32;
        let coalesce_height = self.config.max_vram_write_coalesce_height as i32;
        let wr = last.write_rect;
        let merge_vertical = rect.height() <= coalesce_height
            && wr.left == rect.left
            && wr.right == rect.right
            && wr.bottom == rect.top;
        let merge_horizontal = rect.width() <= coalesce_width
            && wr.top == rect.top
            && wr.bottom == rect.bottom
            && wr.right == rect.left;
        if !merge_vertical && !merge_horizontal {
            return false;
        }

        let active = last.active_rect;
        let sampled = rect_pages(&active).any(|pn| {
            self.pages[pn as usize].sources.iter().any(|&sid| {
                let uv = self.sources[sid].active_uv_rect;
                !uv.is_invalid() && uv.intersects(&active)
            })
        });
        if sampled {
            return false;
        }

        self.unlink_write(id);
        let new_rect = wr.union(rect);
        let hash = hash_rect(&self.vram, &new_rect);
        if debug_flags::trace_writes() {
            debug!("Expanding VRAM write {:016X} from {} to {}", self.writes[id].hash, wr, new_rect);
        }
        let write = &mut self.writes[id];
        write.active_rect = new_rect;
        write.write_rect = new_rect;
        write.hash = hash;
        self.link_write(id);
        true
    }

    /// Replaces write `id` with the pieces of its active area outside `split`.
    fn split_vram_write(&mut self, id: WriteId, split: &Rect) {
        self.sync_vram_write_palette_records(id);
        self.unlink_write(id);
        let Some(mut parent) = self.writes.remove(id) else {
            return;
        };
        if self.last_write == Some(id) {
            self.last_write = None;
        }

        debug_assert!(parent.active_rect.contains(split) && parent.active_rect != *split);
        parent.num_splits += 1;

        for (direction, piece) in split_remainders(&parent.active_rect, split).iter().enumerate() {
            if piece.is_empty() {
                continue;
            }

            let palette_records = parent
                .palette_records
                .iter()
                .filter(|rec| rec.rect.intersects(piece))
                .cloned()
                .collect();
            self.insert_write(VramWrite {
                active_rect: *piece,
                write_rect: parent.write_rect,
                hash: parent.hash,
                num_splits: parent.num_splits,
                palette_records,
                page_refs: SmallVec::new(),
            });

            if debug_flags::trace_writes() {
                debug!(
                    "Split VRAM write {:016X} at {} in direction {} => {}",
                    parent.hash, parent.active_rect, direction, piece
                );
            }
        }
    }

    /// Drops write `id`, dumping what was sampled from it.
    pub(super) fn remove_vram_write(&mut self, id: WriteId) {
        let Some(write) = self.writes.get(id) else {
            return;
        };
        if debug_flags::trace_writes() {
            debug!("Remove VRAM write {:016X} at {}", write.hash, write.write_rect);
        }

        self.sync_vram_write_palette_records(id);

        let write = &self.writes[id];
        if write.num_splits > 0 && !write.palette_records.is_empty() {
            // hand the records to another piece of the same upload, which dumps them later
            if let Some(other) = self.find_write_with_hash(id, write.hash, &write.write_rect) {
                let records = std::mem::take(&mut self.writes[id].palette_records);
                let target = &mut self.writes[other].palette_records;
                for rec in records {
                    match target.iter_mut().find(|r| r.key == rec.key) {
                        Some(existing) => {
                            existing.rect = existing.rect.union(&rec.rect);
                            existing.flags |= rec.flags;
                        }
                        None => target.push(rec),
                    }
                }
            }
        }

        self.unlink_write(id);
        if let Some(write) = self.writes.remove(id) {
            self.dump_textures_from_vram_write(&write);
        }
        if self.last_write == Some(id) {
            self.last_write = None;
        }
    }

    fn find_write_with_hash(&self, exclude: WriteId, hash: HashType, rect: &Rect) -> Option<WriteId> {
        rect_pages(rect).find_map(|pn| {
            self.pages[pn as usize].writes.iter().copied().find(|&other| {
                other != exclude
                    && self
                        .writes
                        .get(other)
                        .map(|w| w.hash == hash)
                        .unwrap_or(false)
            })
        })
    }

    /// Pulls the sampled areas of sources that are still alive into the
    /// write's palette records.
    pub(super) fn sync_vram_write_palette_records(&mut self, id: WriteId) {
        if !self.is_dumping_vram_write_textures() {
            return;
        }
        let Some(write) = self.writes.get(id) else {
            return;
        };

        let mut sampled: SmallVec<[(SourceKey, Rect, PaletteRecordFlags); 8]> = SmallVec::new();
        for pn in rect_pages(&write.active_rect) {
            for &sid in &self.pages[pn as usize].sources {
                let src = &self.sources[sid];
                if !src.active_uv_rect.is_invalid() {
                    sampled.push((src.key, src.active_uv_rect, src.palette_record_flags));
                }
            }
        }

        for (key, uv_rect, flags) in sampled {
            self.update_vram_write_sources(id, key, uv_rect, flags);
        }
    }

    /// Records that `key` sampled `global_uv_rect`, keeping the first palette
    /// snapshot taken for that key.
    pub(super) fn update_vram_write_sources(
        &mut self,
        id: WriteId,
        key: SourceKey,
        global_uv_rect: Rect,
        flags: PaletteRecordFlags,
    ) {
        let Some(write) = self.writes.get_mut(id) else {
            return;
        };
        let intersection = write.active_rect.intersection(&global_uv_rect);
        if intersection.is_empty() {
            return;
        }

        match write.palette_records.iter_mut().find(|rec| rec.key == key) {
            Some(rec) => {
                rec.rect = rec.rect.union(&intersection);
                rec.flags |= flags;
            }
            None => write
                .palette_records
                .push(PaletteRecord::capture(&self.vram, key, intersection, flags)),
        }
    }

    pub(super) fn dump_textures_from_vram_write(&mut self, write: &VramWrite) {
        if !self.settings.dump_textures || self.config.dump_texture_pages {
            return;
        }

        for rec in &write.palette_records {
            let has_palette = rec.key.has_palette();
            if !has_palette && !self.config.dump_c16_textures {
                continue;
            }

            // records handed over from another upload can reach outside this one
            let rect = rec.rect.intersection(&write.write_rect);
            if rect.is_empty() {
                continue;
            }

            let mut pal_hash = rec.palette_hash;
            let mut pal_min = 0;
            let mut pal_max = if has_palette {
                rec.key.mode.palette_width() - 1
            } else {
                0
            };
            if has_palette && self.config.reduce_palette_range {
                (pal_min, pal_max) = reduce_palette_bounds(&self.vram, &rect, rec.key.mode, rec.key.palette);
                pal_hash = hash_partial_palette(&rec.palette, pal_min, pal_max);
            }

            let req = DumpRequest {
                kind: ReplacementKind::TextureFromVramWrite,
                offset_x: ((rect.left - write.write_rect.left) as u32) << rec.key.mode.shift(),
                offset_y: (rect.top - write.write_rect.top) as u32,
                src_width: write.write_rect.width() as u32,
                src_height: write.write_rect.height() as u32,
                mode: rec.key.mode,
                src_hash: write.hash,
                pal_hash,
                pal_min,
                pal_max,
                palette: &rec.palette,
                rect,
                semitransparent_draws: rec.has_semi_transparent_draws(),
            };
            let target = DumpTarget {
                textures_dir: &self.settings.textures_dir,
                game_id: &self.game_id,
            };
            self.dumper.dump_texture(
                target,
                &self.config,
                self.settings.dump_replaced_textures,
                &self.vram,
                &self.replacements,
                &req,
            );
        }
    }

    /// Dumps the sampled (or whole) page of a dying source, without the part
    /// that wrapped around to x = 0.
    pub(super) fn dump_texture_from_page(&mut self, src: &Source) {
        let key = src.key;
        let has_palette = key.has_palette();
        if !has_palette && !self.config.dump_c16_textures {
            return;
        }

        let page_rect = src.texture_rect;
        let dump_rect = if self.config.dump_full_texture_pages {
            page_rect
        } else {
            src.active_uv_rect.intersection(&page_rect)
        };
        if dump_rect.is_empty() {
            return;
        }

        let texture_hash = hash_rect(&self.vram, &dump_rect);
        let palette: &[u16] = if has_palette {
            self.vram.palette(key.palette, key.mode)
        } else {
            &[]
        };

        let mut pal_hash = src.palette_hash;
        let mut pal_min = 0;
        let mut pal_max = if has_palette {
            key.mode.palette_width() - 1
        } else {
            0
        };
        if has_palette && self.config.reduce_palette_range {
            (pal_min, pal_max) = reduce_palette_bounds(&self.vram, &dump_rect, key.mode, key.palette);
            pal_hash = hash_partial_palette(palette, pal_min, pal_max);
        }

        let req = DumpRequest {
            kind: ReplacementKind::TextureFromPage,
            offset_x: ((dump_rect.left - page_rect.left) as u32) << key.mode.shift(),
            offset_y: (dump_rect.top - page_rect.top) as u32,
            src_width: page_rect.width() as u32,
            src_height: page_rect.height() as u32,
            mode: key.mode,
            src_hash: texture_hash,
            pal_hash,
            pal_min,
            pal_max,
            palette,
            rect: dump_rect,
            semitransparent_draws: src
                .palette_record_flags
                .contains(PaletteRecordFlags::HAS_SEMI_TRANSPARENT_DRAWS),
        };
        let target = DumpTarget {
            textures_dir: &self.settings.textures_dir,
            game_id: &self.game_id,
        };
        self.dumper.dump_texture(
            target,
            &self.config,
            self.settings.dump_replaced_textures,
            &self.vram,
            &self.replacements,
            &req,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area(r: &Rect) -> i32 {
        if r.is_empty() {
            0
        } else {
            r.width() * r.height()
        }
    }

    fn check_partition(active: Rect, split: Rect) {
        let pieces = split_remainders(&active, &split);
        let live: Vec<Rect> = pieces.iter().copied().filter(|r| !r.is_empty()).collect();

        for (i, a) in live.iter().enumerate() {
            assert!(active.contains(a), "{} escapes {}", a, active);
            assert!(!a.intersects(&split), "{} overlaps the split", a);
            for b in &live[i + 1..] {
                assert!(!a.intersects(b), "{} overlaps {}", a, b);
            }
        }

        let covered: i32 = live.iter().map(area).sum();
        assert_eq!(covered, area(&active) - area(&split));
    }

    #[test]
    fn test_split_partitions_remainder() {
        let active = Rect::new(0, 0, 64, 64);
        check_partition(active, Rect::new(16, 16, 32, 32));
        check_partition(active, Rect::new(0, 0, 64, 8));
        check_partition(active, Rect::new(0, 0, 8, 64));
        check_partition(active, Rect::new(60, 10, 64, 12));
        check_partition(Rect::new(100, 40, 228, 48), Rect::new(120, 40, 140, 48));
    }

    #[test]
    fn test_horizontal_strip_leaves_two_pieces() {
        let pieces = split_remainders(&Rect::new(0, 0, 256, 64), &Rect::new(0, 16, 256, 32));
        let live: Vec<Rect> = pieces.iter().copied().filter(|r| !r.is_empty()).collect();
        assert_eq!(live, vec![Rect::new(0, 0, 256, 16), Rect::new(0, 32, 256, 64)]);
    }

    #[test]
    fn test_palette_record_capture() {
        let mut vram = Vram::new();
        for i in 0..256 {
            vram.set_pixel(1000 + i, 10, 0x100 + i as u16);
        }

        let key = SourceKey::new(0, crate::vram::TextureMode::Palette8Bit, crate::vram::PaletteReg::from_position(1008, 10));
        let rec = PaletteRecord::capture(&vram, key, Rect::new(0, 0, 8, 8), PaletteRecordFlags::empty());
        // 16 entries fit before the edge
        assert_eq!(rec.palette[0], 0x108);
        assert_eq!(rec.palette[15], 0x117);
        assert!(rec.palette[16..].iter().all(|&p| p == 0));
        assert_eq!(rec.palette_hash, hash_partial_palette(&rec.palette, 0, 15));

        let direct = SourceKey::new(0, crate::vram::TextureMode::Direct16Bit, crate::vram::PaletteReg(0));
        let rec = PaletteRecord::capture(&vram, direct, Rect::new(0, 0, 8, 8), PaletteRecordFlags::HAS_SEMI_TRANSPARENT_DRAWS);
        assert_eq!(rec.palette_hash, 0);
        assert!(rec.has_semi_transparent_draws());
    }
}
