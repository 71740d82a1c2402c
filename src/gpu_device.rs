use crate::rect::Rect;
use log::{debug, warn};
use slotmap::SlotMap;

slotmap::new_key_type! {
    pub struct TextureHandle;
    pub struct PipelineHandle;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureKind {
    Texture,
    RenderTarget,
}

/// Full-screen merge pass used when compositing replacement images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineConfig {
    pub invert_alpha: bool,
    pub linear_filter: bool,
}

/// What the cache needs from the renderer's device layer. All textures are RGBA8.
pub trait GpuDevice {
    /// Allocates (or reuses from the recycle pool) a zeroed texture.
    fn fetch_texture(&mut self, width: u32, height: u32, kind: TextureKind) -> Option<TextureHandle>;

    /// Returns a texture to the pool. The handle must not be used afterwards.
    fn recycle_texture(&mut self, texture: TextureHandle);

    fn update_texture(
        &mut self,
        texture: TextureHandle,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pixels: &[u32],
    ) -> bool;

    fn texture_size(&self, texture: TextureHandle) -> (u32, u32);

    fn texture_vram_usage(&self, texture: TextureHandle) -> usize {
        let (w, h) = self.texture_size(texture);
        w as usize * h as usize * 4
    }

    fn max_texture_size(&self) -> u32;

    fn create_pipeline(&mut self, config: PipelineConfig) -> Option<PipelineHandle>;

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle);

    /// Draws `source` stretched over `viewport` of `target`.
    fn draw_fullscreen(
        &mut self,
        target: TextureHandle,
        viewport: Rect,
        pipeline: PipelineHandle,
        source: TextureHandle,
    );

    fn copy_texture_region(
        &mut self,
        dst: TextureHandle,
        dst_x: u32,
        dst_y: u32,
        src: TextureHandle,
        src_x: u32,
        src_y: u32,
        width: u32,
        height: u32,
    );
}

struct SoftTexture {
    width: u32,
    height: u32,
    kind: TextureKind,
    pixels: Vec<u32>,
}

impl SoftTexture {
    fn sample_nearest(&self, u: f32, v: f32) -> u32 {
        let x = (u.floor() as i64).clamp(0, self.width as i64 - 1) as u32;
        let y = (v.floor() as i64).clamp(0, self.height as i64 - 1) as u32;
        self.pixels[(y * self.width + x) as usize]
    }

    fn sample_linear(&self, u: f32, v: f32) -> u32 {
        let u = (u - 0.5).max(0.0);
        let v = (v - 0.5).max(0.0);
        let x0 = (u.floor() as u32).min(self.width - 1);
        let y0 = (v.floor() as u32).min(self.height - 1);
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let fx = u - u.floor();
        let fy = v - v.floor();
        let texel = |x: u32, y: u32| self.pixels[(y * self.width + x) as usize];

        let mut out = 0u32;
        for shift in [0, 8, 16, 24] {
            let c = |p: u32| ((p >> shift) & 0xFF) as f32;
            let top = c(texel(x0, y0)) * (1.0 - fx) + c(texel(x1, y0)) * fx;
            let bottom = c(texel(x0, y1)) * (1.0 - fx) + c(texel(x1, y1)) * fx;
            let value = (top * (1.0 - fy) + bottom * fy).round() as u32;
            out |= value.min(0xFF) << shift;
        }
        out
    }
}

/// CPU-side device. Used by tests and the headless driver.
pub struct SoftwareDevice {
    textures: SlotMap<TextureHandle, SoftTexture>,
    pipelines: SlotMap<PipelineHandle, PipelineConfig>,
    pool: Vec<TextureHandle>,
    max_texture_size: u32,
    allocation_limit: Option<usize>,
    fail_pipelines: bool,
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self {
            textures: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            pool: Vec::new(),
            max_texture_size: 8192,
            allocation_limit: None,
            fail_pipelines: false,
        }
    }

    pub fn with_max_texture_size(mut self, size: u32) -> Self {
        self.max_texture_size = size;
        self
    }

    /// Makes `fetch_texture` fail once this many textures are live.
    pub fn set_allocation_limit(&mut self, limit: Option<usize>) {
        self.allocation_limit = limit;
    }

    pub fn set_fail_pipelines(&mut self, fail: bool) {
        self.fail_pipelines = fail;
    }

    pub fn texture_pixels(&self, texture: TextureHandle) -> Option<&[u32]> {
        self.textures.get(texture).map(|t| t.pixels.as_slice())
    }

    /// Textures handed out and not yet recycled.
    pub fn live_textures(&self) -> usize {
        self.textures.len() - self.pool.len()
    }

    pub fn pooled_textures(&self) -> usize {
        self.pool.len()
    }

    pub fn live_pipelines(&self) -> usize {
        self.pipelines.len()
    }
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for SoftwareDevice {
    fn fetch_texture(&mut self, width: u32, height: u32, kind: TextureKind) -> Option<TextureHandle> {
        if width == 0 || height == 0 || width > self.max_texture_size || height > self.max_texture_size {
            warn!("Refusing {}x{} texture allocation", width, height);
            return None;
        }

        if let Some(limit) = self.allocation_limit {
            if self.live_textures() >= limit {
                return None;
            }
        }

        let textures = &self.textures;
        if let Some(pos) = self.pool.iter().position(|&h| {
            textures
                .get(h)
                .map(|t| t.width == width && t.height == height && t.kind == kind)
                .unwrap_or(false)
        }) {
            let handle = self.pool.swap_remove(pos);
            if let Some(tex) = self.textures.get_mut(handle) {
                tex.pixels.iter_mut().for_each(|p| *p = 0);
            }
            return Some(handle);
        }

        Some(self.textures.insert(SoftTexture {
            width,
            height,
            kind,
            pixels: vec![0; (width * height) as usize],
        }))
    }

    fn recycle_texture(&mut self, texture: TextureHandle) {
        if self.textures.contains_key(texture) && !self.pool.contains(&texture) {
            self.pool.push(texture);
        }
    }

    fn update_texture(
        &mut self,
        texture: TextureHandle,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pixels: &[u32],
    ) -> bool {
        let Some(tex) = self.textures.get_mut(texture) else {
            return false;
        };
        if x + width > tex.width || y + height > tex.height || pixels.len() < (width * height) as usize {
            return false;
        }

        for row in 0..height {
            let src = &pixels[(row * width) as usize..((row + 1) * width) as usize];
            let start = ((y + row) * tex.width + x) as usize;
            tex.pixels[start..start + width as usize].copy_from_slice(src);
        }
        true
    }

    fn texture_size(&self, texture: TextureHandle) -> (u32, u32) {
        self.textures
            .get(texture)
            .map(|t| (t.width, t.height))
            .unwrap_or((0, 0))
    }

    fn max_texture_size(&self) -> u32 {
        self.max_texture_size
    }

    fn create_pipeline(&mut self, config: PipelineConfig) -> Option<PipelineHandle> {
        if self.fail_pipelines {
            return None;
        }
        debug!("Creating merge pipeline {:?}", config);
        Some(self.pipelines.insert(config))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        self.pipelines.remove(pipeline);
    }

    fn draw_fullscreen(
        &mut self,
        target: TextureHandle,
        viewport: Rect,
        pipeline: PipelineHandle,
        source: TextureHandle,
    ) {
        let Some(config) = self.pipelines.get(pipeline).copied() else {
            return;
        };
        let Some(src) = self.textures.get(source) else {
            return;
        };
        let Some(dst) = self.textures.get(target) else {
            return;
        };
        if viewport.is_empty() {
            return;
        }

        let (dst_w, dst_h) = (dst.width as i32, dst.height as i32);
        let clipped = viewport.intersection(&Rect::new(0, 0, dst_w, dst_h));
        if clipped.is_empty() {
            return;
        }

        let scale_x = src.width as f32 / viewport.width() as f32;
        let scale_y = src.height as f32 / viewport.height() as f32;
        let mut out = Vec::with_capacity((clipped.width() * clipped.height()) as usize);
        for y in clipped.top..clipped.bottom {
            for x in clipped.left..clipped.right {
                let u = (x - viewport.left) as f32 * scale_x + scale_x * 0.5;
                let v = (y - viewport.top) as f32 * scale_y + scale_y * 0.5;
                let mut texel = if config.linear_filter {
                    src.sample_linear(u, v)
                } else {
                    src.sample_nearest(u, v)
                };
                if config.invert_alpha && texel != 0 {
                    let alpha = 0xFF - (texel >> 24);
                    texel = (texel & 0x00FF_FFFF) | (alpha << 24);
                }
                out.push(texel);
            }
        }

        if let Some(dst) = self.textures.get_mut(target) {
            let width = clipped.width() as usize;
            for (row, y) in (clipped.top..clipped.bottom).enumerate() {
                let start = (y * dst_w + clipped.left) as usize;
                dst.pixels[start..start + width].copy_from_slice(&out[row * width..(row + 1) * width]);
            }
        }
    }

    fn copy_texture_region(
        &mut self,
        dst: TextureHandle,
        dst_x: u32,
        dst_y: u32,
        src: TextureHandle,
        src_x: u32,
        src_y: u32,
        width: u32,
        height: u32,
    ) {
        let Some(src_tex) = self.textures.get(src) else {
            return;
        };
        let mut rows = Vec::with_capacity(height as usize);
        for row in 0..height.min(src_tex.height.saturating_sub(src_y)) {
            let start = ((src_y + row) * src_tex.width + src_x) as usize;
            let len = width.min(src_tex.width.saturating_sub(src_x)) as usize;
            rows.push(src_tex.pixels[start..start + len].to_vec());
        }

        if let Some(dst_tex) = self.textures.get_mut(dst) {
            for (row, data) in rows.iter().enumerate() {
                let y = dst_y + row as u32;
                if y >= dst_tex.height || dst_x >= dst_tex.width {
                    break;
                }
                let len = data.len().min((dst_tex.width - dst_x) as usize);
                let start = (y * dst_tex.width + dst_x) as usize;
                dst_tex.pixels[start..start + len].copy_from_slice(&data[..len]);
            }
        }
    }
}
