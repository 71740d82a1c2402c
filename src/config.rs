use crate::error::Result;
use log::warn;
use std::fmt::Write as _;
use std::path::PathBuf;

pub const LOCAL_CONFIG_FILENAME: &str = "config.toml";

/// Per-title tunables. Host defaults, optionally overridden by
/// `<textures>/<game id>/config.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub dump_texture_pages: bool,
    pub dump_full_texture_pages: bool,
    pub dump_texture_force_alpha_channel: bool,
    pub dump_vram_write_force_alpha_channel: bool,
    pub dump_c16_textures: bool,
    pub reduce_palette_range: bool,
    pub convert_copies_to_writes: bool,
    pub replacement_scale_linear_filter: bool,

    pub max_hash_cache_entries: u32,
    pub max_hash_cache_vram_usage_mb: u32,

    pub max_vram_write_splits: u32,
    pub max_vram_write_coalesce_width: u32,
    pub max_vram_write_coalesce_height: u32,

    pub texture_dump_width_threshold: u32,
    pub texture_dump_height_threshold: u32,

    pub vram_write_dump_width_threshold: u32,
    pub vram_write_dump_height_threshold: u32,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            dump_texture_pages: false,
            dump_full_texture_pages: false,
            dump_texture_force_alpha_channel: false,
            dump_vram_write_force_alpha_channel: true,
            dump_c16_textures: false,
            reduce_palette_range: true,
            convert_copies_to_writes: false,
            replacement_scale_linear_filter: false,
            max_hash_cache_entries: 1200,
            max_hash_cache_vram_usage_mb: 2048,
            max_vram_write_splits: 0,
            max_vram_write_coalesce_width: 0,
            max_vram_write_coalesce_height: 0,
            texture_dump_width_threshold: 16,
            texture_dump_height_threshold: 16,
            vram_write_dump_width_threshold: 128,
            vram_write_dump_height_threshold: 128,
        }
    }
}

/// Result of reading a per-title config file.
#[derive(Debug, Clone, Default)]
pub struct LocalConfig {
    pub config: Configuration,
    /// `[Aliases]` entries: replacement name -> file relative to the replacements dir.
    pub aliases: Vec<(String, String)>,
}

fn read_bool(table: &toml::Table, key: &str, value: &mut bool) {
    match table.get(key) {
        None => {}
        Some(toml::Value::Boolean(b)) => *value = *b,
        Some(other) => warn!("Ignoring {} = {}: expected a boolean", key, other),
    }
}

fn read_u32(table: &toml::Table, key: &str, value: &mut u32) {
    match table.get(key) {
        None => {}
        Some(toml::Value::Integer(i)) => match u32::try_from(*i) {
            Ok(v) => *value = v,
            Err(_) => warn!("Ignoring {} = {}: out of range", key, i),
        },
        Some(other) => warn!("Ignoring {} = {}: expected an integer", key, other),
    }
}

impl Configuration {
    /// Applies the options present in `text` on top of `self`. Unknown keys and
    /// wrong-typed values are skipped with a warning.
    pub fn parse_local(&self, text: &str) -> Result<LocalConfig> {
        let table: toml::Table = text.parse()?;
        let mut config = self.clone();

        read_bool(&table, "DumpTexturePages", &mut config.dump_texture_pages);
        read_bool(&table, "DumpFullTexturePages", &mut config.dump_full_texture_pages);
        read_bool(
            &table,
            "DumpTextureForceAlphaChannel",
            &mut config.dump_texture_force_alpha_channel,
        );
        read_bool(
            &table,
            "DumpVRAMWriteForceAlphaChannel",
            &mut config.dump_vram_write_force_alpha_channel,
        );
        read_bool(&table, "DumpC16Textures", &mut config.dump_c16_textures);
        read_bool(&table, "ReducePaletteRange", &mut config.reduce_palette_range);
        read_bool(&table, "ConvertCopiesToWrites", &mut config.convert_copies_to_writes);
        read_bool(
            &table,
            "ReplacementScaleLinearFilter",
            &mut config.replacement_scale_linear_filter,
        );
        read_u32(&table, "MaxHashCacheEntries", &mut config.max_hash_cache_entries);
        read_u32(&table, "MaxHashCacheVRAMUsageMB", &mut config.max_hash_cache_vram_usage_mb);
        read_u32(&table, "MaxVRAMWriteSplits", &mut config.max_vram_write_splits);
        read_u32(&table, "MaxVRAMWriteCoalesceWidth", &mut config.max_vram_write_coalesce_width);
        read_u32(&table, "MaxVRAMWriteCoalesceHeight", &mut config.max_vram_write_coalesce_height);
        read_u32(&table, "DumpTextureWidthThreshold", &mut config.texture_dump_width_threshold);
        read_u32(&table, "DumpTextureHeightThreshold", &mut config.texture_dump_height_threshold);
        read_u32(&table, "DumpVRAMWriteWidthThreshold", &mut config.vram_write_dump_width_threshold);
        read_u32(&table, "DumpVRAMWriteHeightThreshold", &mut config.vram_write_dump_height_threshold);

        let mut aliases = Vec::new();
        match table.get("Aliases") {
            None => {}
            Some(toml::Value::Table(entries)) => {
                for (name, file) in entries {
                    match file.as_str() {
                        Some(file) => aliases.push((name.clone(), file.to_string())),
                        None => warn!("Ignoring alias '{}': expected a file name", name),
                    }
                }
            }
            Some(_) => warn!("Ignoring Aliases: expected a table"),
        }

        Ok(LocalConfig { config, aliases })
    }

    pub fn max_hash_cache_vram_usage_bytes(&self) -> usize {
        self.max_hash_cache_vram_usage_mb as usize * 1024 * 1024
    }

    /// Commented template written into new game directories.
    pub fn export_template(&self) -> String {
        let mut out = String::new();
        let mut entry = |comment: &str, key: &str, value: String| {
            let _ = writeln!(out, "# {}", comment);
            let _ = writeln!(out, "{} = {}", key, value);
            out.push('\n');
        };

        entry(
            "Dumps whole texture pages instead of uploads. Needed for games that build textures with draws.",
            "DumpTexturePages",
            self.dump_texture_pages.to_string(),
        );
        entry(
            "Dumps the entire page rather than the sampled area. Only with DumpTexturePages.",
            "DumpFullTexturePages",
            self.dump_full_texture_pages.to_string(),
        );
        entry(
            "Writes every dumped texel as opaque.",
            "DumpTextureForceAlphaChannel",
            self.dump_texture_force_alpha_channel.to_string(),
        );
        entry(
            "Writes every dumped upload pixel as opaque.",
            "DumpVRAMWriteForceAlphaChannel",
            self.dump_vram_write_force_alpha_channel.to_string(),
        );
        entry(
            "Also dumps 16-bit direct color textures.",
            "DumpC16Textures",
            self.dump_c16_textures.to_string(),
        );
        entry(
            "Names dumps by the range of palette indices actually used.",
            "ReducePaletteRange",
            self.reduce_palette_range.to_string(),
        );
        entry(
            "Treats VRAM copies as uploads of the destination area.",
            "ConvertCopiesToWrites",
            self.convert_copies_to_writes.to_string(),
        );
        entry(
            "Uses bilinear filtering when scaling replacements to a common size.",
            "ReplacementScaleLinearFilter",
            self.replacement_scale_linear_filter.to_string(),
        );
        entry(
            "Soft limit on decoded textures kept around.",
            "MaxHashCacheEntries",
            self.max_hash_cache_entries.to_string(),
        );
        entry(
            "Soft limit on decoded texture memory, in megabytes.",
            "MaxHashCacheVRAMUsageMB",
            self.max_hash_cache_vram_usage_mb.to_string(),
        );
        entry(
            "Times an upload may be carved up by later writes before it is dropped.",
            "MaxVRAMWriteSplits",
            self.max_vram_write_splits.to_string(),
        );
        entry(
            "Largest width adjacent uploads are merged up to.",
            "MaxVRAMWriteCoalesceWidth",
            self.max_vram_write_coalesce_width.to_string(),
        );
        entry(
            "Largest height adjacent uploads are merged up to.",
            "MaxVRAMWriteCoalesceHeight",
            self.max_vram_write_coalesce_height.to_string(),
        );
        entry(
            "Smallest texture width that gets dumped.",
            "DumpTextureWidthThreshold",
            self.texture_dump_width_threshold.to_string(),
        );
        entry(
            "Smallest texture height that gets dumped.",
            "DumpTextureHeightThreshold",
            self.texture_dump_height_threshold.to_string(),
        );
        entry(
            "Smallest upload width that gets dumped.",
            "DumpVRAMWriteWidthThreshold",
            self.vram_write_dump_width_threshold.to_string(),
        );
        entry(
            "Smallest upload height that gets dumped.",
            "DumpVRAMWriteHeightThreshold",
            self.vram_write_dump_height_threshold.to_string(),
        );

        out.push_str("# Maps replacement names to files under replacements/.\n");
        out.push_str("[Aliases]\n");
        out.push_str("# \"texupload-P4-AAAAAAAAAAAAAAAA-BBBBBBBBBBBBBBBB-64x256-0-192-64x64-P0-14\" = \"shared/font.png\"\n");
        out
    }
}

/// Host-side switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub enable_texture_replacements: bool,
    pub enable_vram_write_replacements: bool,
    pub always_track_uploads: bool,
    pub preload_textures: bool,
    pub dump_textures: bool,
    pub dump_replaced_textures: bool,
    pub dump_vram_writes: bool,
    /// Root holding one directory per game id.
    pub textures_dir: PathBuf,
    pub config: Configuration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enable_texture_replacements: false,
            enable_vram_write_replacements: false,
            always_track_uploads: false,
            preload_textures: false,
            dump_textures: false,
            dump_replaced_textures: true,
            dump_vram_writes: false,
            textures_dir: PathBuf::from("textures"),
            config: Configuration::default(),
        }
    }
}
