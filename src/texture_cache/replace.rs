use super::{SourceKey, TextureCache, WriteId};
use crate::gpu_device::{GpuDevice, TextureHandle, TextureKind};
use crate::hash::HashType;
use crate::rect::Rect;
use crate::replacement::SubImage;
use crate::vram::{
    page_start_x, page_start_y, x_wrapped_pages, TEXTURE_PAGE_HEIGHT, TEXTURE_PAGE_WIDTH,
    VRAM_WIDTH,
};
use log::{debug, error, warn};
use smallvec::SmallVec;

impl<D: GpuDevice> TextureCache<D> {
    /// Composites every matching replacement over the freshly decoded
    /// `texture`. Returns the texture to store in the hash cache, which is
    /// `texture` itself when nothing matched or the device ran out of memory.
    pub(super) fn apply_texture_replacements(
        &mut self,
        key: SourceKey,
        texture_hash: HashType,
        palette_hash: HashType,
        texture: TextureHandle,
    ) -> TextureHandle {
        let mut subimages = Vec::new();
        if self.replacements.has_texture_page_textures() {
            self.replacements.gather_page_subimages(
                &self.vram,
                &mut subimages,
                key.page(),
                texture_hash,
                palette_hash,
                key.mode,
                key.palette,
            );
        }
        if self.replacements.has_vram_write_textures() {
            self.gather_write_subimages(key, palette_hash, &mut subimages);
        }
        if subimages.is_empty() {
            return texture;
        }

        let Some(pipelines) = self.pipelines else {
            warn!("Replacement pipelines missing, not replacing {}", key);
            return texture;
        };

        let max_possible_scale = self.device.max_texture_size() as f32 / TEXTURE_PAGE_WIDTH as f32;
        let (scale_x, scale_y) = subimages
            .iter()
            .fold((subimages[0].scale_x, subimages[0].scale_y), |(x, y), si| {
                (x.max(si.scale_x), y.max(si.scale_y))
            });
        let scale_x = scale_x.min(max_possible_scale);
        let scale_y = scale_y.min(max_possible_scale);

        let new_width = (TEXTURE_PAGE_WIDTH as f32 * scale_x).ceil() as u32;
        let new_height = (TEXTURE_PAGE_HEIGHT as f32 * scale_y).ceil() as u32;

        let Some(target) = self.replacement_target(new_width, new_height) else {
            error!("Failed to create {}x{} render target.", new_width, new_height);
            return texture;
        };

        // grab the real texture first in case we're out of memory
        let Some(replacement) = self.device.fetch_texture(new_width, new_height, TextureKind::Texture) else {
            error!("Failed to create {}x{} texture.", new_width, new_height);
            return texture;
        };

        let full = Rect::new(0, 0, new_width as i32, new_height as i32);
        self.device.draw_fullscreen(target, full, pipelines.normal, texture);

        for si in &subimages {
            let Some(temp) = self
                .device
                .fetch_texture(si.image.width, si.image.height, TextureKind::Texture)
            else {
                continue;
            };

            if self
                .device
                .update_texture(temp, 0, 0, si.image.width, si.image.height, &si.image.pixels)
            {
                let dst = Rect::new(
                    (si.dst_rect.left as f32 * scale_x) as i32,
                    (si.dst_rect.top as f32 * scale_y) as i32,
                    (si.dst_rect.right as f32 * scale_x) as i32,
                    (si.dst_rect.bottom as f32 * scale_y) as i32,
                );
                let pipeline = if si.invert_alpha {
                    pipelines.invert_alpha
                } else {
                    pipelines.normal
                };
                self.device.draw_fullscreen(target, dst, pipeline, temp);
            }
            self.device.recycle_texture(temp);
        }

        self.device
            .copy_texture_region(replacement, 0, 0, target, 0, 0, new_width, new_height);
        self.device.recycle_texture(texture);

        debug!(
            "Replaced {} with {} image(s) at {}x{}",
            key,
            subimages.len(),
            new_width,
            new_height
        );
        replacement
    }

    /// The shared compositing target, regrown when too small.
    fn replacement_target(&mut self, width: u32, height: u32) -> Option<TextureHandle> {
        if let Some(rt) = self.replacement_render_target {
            let (w, h) = self.device.texture_size(rt);
            if w >= width && h >= height {
                return Some(rt);
            }
            self.device.recycle_texture(rt);
            self.replacement_render_target = None;
        }

        let rt = self.device.fetch_texture(width, height, TextureKind::RenderTarget)?;
        self.replacement_render_target = Some(rt);
        Some(rt)
    }

    /// Upload replacements from every write on the pages `key` covers, placed
    /// relative to the page origin.
    fn gather_write_subimages(
        &mut self,
        key: SourceKey,
        palette_hash: HashType,
        out: &mut Vec<SubImage>,
    ) {
        let shift = key.mode.shift() as i32;
        let base_x = page_start_x(key.page()) as i32;
        let base_y = page_start_y(key.page()) as i32;
        let mut seen: SmallVec<[WriteId; 8]> = SmallVec::new();

        for pn in x_wrapped_pages(key.page(), key.mode.page_count()) {
            // pages that wrapped to x = 0 see the page origin one VRAM width to the left
            let page_x = if (page_start_x(pn) as i32) < base_x {
                base_x - VRAM_WIDTH as i32
            } else {
                base_x
            };

            for &id in &self.pages[pn as usize].writes {
                if seen.contains(&id) {
                    continue;
                }
                seen.push(id);

                let Some(write) = self.writes.get(id) else {
                    continue;
                };
                let offset_to_page = (
                    (page_x - write.write_rect.left) << shift,
                    base_y - write.write_rect.top,
                );
                self.replacements.gather_vram_write_subimages(
                    &self.vram,
                    out,
                    write.hash,
                    palette_hash,
                    key.mode,
                    key.palette,
                    offset_to_page,
                );
            }
        }
    }
}
