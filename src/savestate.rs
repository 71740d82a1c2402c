use crate::error::{CacheError, Result};
use crate::rect::Rect;
use crate::vram::{TextureMode, MAX_CLUT_SIZE, NUM_VRAM_PAGES, VRAM_HEIGHT, VRAM_SIZE, VRAM_WIDTH};
use serde::{Deserialize, Serialize};

/// Oldest host stream version whose snapshots carry texture cache state.
/// Older snapshots load with an empty cache.
pub const MIN_STATE_VERSION: u32 = 74;

pub const CURRENT_STATE_VERSION: u32 = 74;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceKeyState {
    pub page: u8,
    pub mode: TextureMode,
    pub palette: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaletteRecordState {
    pub rect: Rect,
    pub key: SourceKeyState,
    pub flags: u8,
    pub palette_hash: u64,
    // Always MAX_CLUT_SIZE entries, zero padded for 4-bit palettes.
    pub palette: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VramWriteState {
    pub active_rect: Rect,
    pub write_rect: Rect,
    pub hash: u64,
    pub palette_records: Vec<PaletteRecordState>,
}

/// VRAM contents followed by the pending writes, in a fixed field order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextureCacheState {
    /// All 1024x512 halfwords, row-major.
    pub vram: Vec<u16>,
    pub writes: Vec<VramWriteState>,
}

fn rect_in_vram(rect: &Rect) -> bool {
    !rect.is_empty()
        && rect.left >= 0
        && rect.top >= 0
        && rect.right <= VRAM_WIDTH as i32
        && rect.bottom <= VRAM_HEIGHT as i32
}

impl TextureCacheState {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn save_to_file(&self, filename: &std::path::Path) -> Result<()> {
        std::fs::write(filename, self.to_bytes()?)?;
        log::info!("Texture cache state written to: {}", filename.display());
        Ok(())
    }

    pub fn load_from_file(filename: &std::path::Path) -> Result<Self> {
        let data = std::fs::read(filename)?;
        Self::from_bytes(&data)
    }

    /// Rejects states that would break page bookkeeping when relinked.
    pub fn validate(&self) -> Result<()> {
        if self.vram.len() != VRAM_SIZE {
            return Err(CacheError::CorruptState("VRAM image has wrong size"));
        }
        for write in &self.writes {
            if !rect_in_vram(&write.active_rect) || !rect_in_vram(&write.write_rect) {
                return Err(CacheError::CorruptState("write rectangle outside VRAM"));
            }
            for rec in &write.palette_records {
                if !rect_in_vram(&rec.rect) {
                    return Err(CacheError::CorruptState("palette record rectangle outside VRAM"));
                }
                if rec.palette.len() != MAX_CLUT_SIZE {
                    return Err(CacheError::CorruptState("palette record has wrong size"));
                }
                if rec.key.page as usize >= NUM_VRAM_PAGES {
                    return Err(CacheError::CorruptState("palette record page out of range"));
                }
            }
        }
        Ok(())
    }
}
