//! Texture cache for a PS1-style GPU: tracks which parts of VRAM are texture
//! pages, uploads and render targets, keeps decoded pages in a content-hashed
//! cache, and composites replacement images over them.

pub mod config;
pub mod debug_flags;
pub mod decode;
pub mod dump;
pub mod error;
pub mod gpu_device;
pub mod hash;
pub mod rect;
pub mod replacement;
pub mod savestate;
pub mod texture_cache;
pub mod vram;

pub use config::{CacheSettings, Configuration};
pub use error::{CacheError, Result};
pub use gpu_device::{GpuDevice, SoftwareDevice};
pub use rect::Rect;
pub use texture_cache::{
    CacheStats, PaletteRecordFlags, SourceId, SourceKey, TextureCache, WriteId,
};
pub use vram::{PaletteReg, TextureMode, Vram};
