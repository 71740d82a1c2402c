use super::*;
use crate::gpu_device::SoftwareDevice;
use crate::hash::{hash_page, hash_rect};
use crate::replacement::{ReplacementKind, TextureReplacementName};
use crate::savestate::CURRENT_STATE_VERSION;
use crate::vram::TextureMode;
use std::fs;
use std::path::Path;

const GAME: &str = "SLUS-00001";
const SCREEN: Rect = Rect::new(0, 0, 320, 240);

fn tracking() -> CacheSettings {
    CacheSettings {
        always_track_uploads: true,
        ..CacheSettings::default()
    }
}

fn new_cache(settings: CacheSettings) -> TextureCache<SoftwareDevice> {
    let mut cache = TextureCache::new(SoftwareDevice::new(), settings);
    cache.initialize().unwrap();
    cache
}

fn pattern(width: u32, height: u32, seed: u16) -> Vec<u16> {
    (0..width * height)
        .map(|i| seed.wrapping_mul(31).wrapping_add(i as u16) | 0x8000)
        .collect()
}

fn upload(cache: &mut TextureCache<SoftwareDevice>, x: u32, y: u32, width: u32, height: u32, seed: u16) {
    let data = pattern(width, height, seed);
    cache.write_vram(x, y, width, height, &data, false, false);
}

fn write_rects(cache: &TextureCache<SoftwareDevice>) -> Vec<Rect> {
    let mut rects: Vec<Rect> = cache.vram_writes().map(|(_, w)| w.active_rect).collect();
    rects.sort_by_key(|r| (r.top, r.left));
    rects
}

fn write_png(path: &Path, width: u32, height: u32, rgba: [u8; 4]) {
    let mut img = image::RgbaImage::new(width, height);
    for p in img.pixels_mut() {
        p.0 = rgba;
    }
    img.save(path).unwrap();
}

fn replacement_dir(root: &Path) -> std::path::PathBuf {
    let dir = root.join(GAME).join("replacements");
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn p4_key(page: u32) -> SourceKey {
    SourceKey::new(page, TextureMode::Palette4Bit, PaletteReg::from_position(0, 480))
}

#[test]
fn test_write_links_every_page_it_touches() {
    let mut cache = new_cache(tracking());
    upload(&mut cache, 32, 0, 128, 300, 1);

    let (id, write) = cache.vram_writes().next().unwrap();
    assert_eq!(write.active_rect, Rect::new(32, 0, 160, 300));
    assert_eq!(write.page_refs(), &[0, 1, 2, 16, 17, 18]);
    for pn in [0, 1, 2, 16, 17, 18] {
        assert_eq!(cache.page(pn).writes(), &[id]);
    }
    assert!(cache.page(3).writes().is_empty());
    assert_eq!(cache.last_vram_write(), Some(id));
}

#[test]
fn test_untracked_uploads_only_touch_vram() {
    let mut cache = new_cache(CacheSettings::default());
    assert!(!cache.is_tracking_vram_writes());
    upload(&mut cache, 0, 0, 16, 16, 3);
    assert_eq!(cache.stats().vram_writes, 0);
    assert_eq!(cache.vram().pixel(0, 0), pattern(1, 1, 3)[0]);
}

#[test]
fn test_overlapping_upload_removes_write_without_splits() {
    let mut cache = new_cache(tracking());
    upload(&mut cache, 0, 0, 64, 64, 1);
    let first = cache.last_vram_write().unwrap();

    upload(&mut cache, 16, 16, 16, 16, 2);
    assert!(cache.vram_write(first).is_none());
    assert_eq!(write_rects(&cache), vec![Rect::new(16, 16, 32, 32)]);
}

#[test]
fn test_short_upload_is_ignored() {
    let mut cache = new_cache(tracking());
    upload(&mut cache, 0, 0, 64, 64, 1);
    let first = cache.last_vram_write().unwrap();
    let before = cache.vram().read_rect(0, 0, 64, 64);

    cache.write_vram(0, 0, 64, 64, &vec![0x8000; 10], false, false);
    assert!(cache.vram_write(first).is_some());
    assert_eq!(cache.last_vram_write(), Some(first));
    assert_eq!(cache.stats().vram_writes, 1);
    assert_eq!(cache.vram().read_rect(0, 0, 64, 64), before);
}

#[test]
fn test_split_leaves_disjoint_pieces() {
    let mut settings = tracking();
    settings.config.max_vram_write_splits = 2;
    let mut cache = new_cache(settings);

    upload(&mut cache, 0, 0, 64, 64, 1);
    let parent = cache.last_vram_write().unwrap();
    let parent_hash = cache.vram_write(parent).unwrap().hash;
    let hole = Rect::new(16, 16, 32, 32);

    upload(&mut cache, 16, 16, 16, 16, 2);
    assert!(cache.vram_write(parent).is_none());

    let newest = cache.last_vram_write().unwrap();
    assert_eq!(cache.vram_write(newest).unwrap().active_rect, hole);

    let pieces: Vec<&VramWrite> = cache
        .vram_writes()
        .filter(|&(id, _)| id != newest)
        .map(|(_, w)| w)
        .collect();
    assert_eq!(pieces.len(), 4);

    let full = Rect::new(0, 0, 64, 64);
    let mut area = 0;
    for (i, piece) in pieces.iter().enumerate() {
        assert_eq!(piece.write_rect, full);
        assert_eq!(piece.hash, parent_hash);
        assert_eq!(piece.num_splits, 1);
        assert!(full.contains(&piece.active_rect));
        assert!(!piece.active_rect.intersects(&hole));
        for other in &pieces[i + 1..] {
            assert!(!piece.active_rect.intersects(&other.active_rect));
        }
        area += piece.active_rect.width() * piece.active_rect.height();
    }
    assert_eq!(area, 64 * 64 - 16 * 16);
    assert_eq!(cache.page(0).writes().len(), 5);
}

#[test]
fn test_split_budget_is_per_write() {
    let mut settings = tracking();
    settings.config.max_vram_write_splits = 1;
    let mut cache = new_cache(settings);

    upload(&mut cache, 0, 0, 64, 64, 1);
    // top strip off: one piece left below it
    upload(&mut cache, 0, 0, 64, 16, 2);
    let below: Vec<Rect> = cache
        .vram_writes()
        .filter(|(_, w)| w.num_splits == 1)
        .map(|(_, w)| w.active_rect)
        .collect();
    assert_eq!(below, vec![Rect::new(0, 16, 64, 64)]);

    // the piece has used its split, so touching it again removes it
    upload(&mut cache, 0, 40, 64, 8, 3);
    assert!(cache.vram_writes().all(|(_, w)| w.num_splits == 0));
}

#[test]
fn test_vertical_strips_coalesce() {
    let mut settings = tracking();
    settings.config.max_vram_write_coalesce_width = 256;
    settings.config.max_vram_write_coalesce_height = 16;
    let mut cache = new_cache(settings);

    upload(&mut cache, 0, 0, 256, 8, 1);
    upload(&mut cache, 0, 8, 256, 8, 2);
    let merged = Rect::new(0, 0, 256, 16);
    assert_eq!(write_rects(&cache), vec![merged]);
    let (_, write) = cache.vram_writes().next().unwrap();
    assert_eq!(write.write_rect, merged);
    assert_eq!(write.hash, hash_rect(cache.vram(), &merged));
    assert_eq!(write.page_refs(), &[0, 1, 2, 3]);

    // different width never joins
    upload(&mut cache, 0, 16, 128, 8, 3);
    assert_eq!(cache.stats().vram_writes, 2);
}

#[test]
fn test_sampled_upload_lifecycle() {
    let mut cache = new_cache(tracking());
    upload(&mut cache, 0, 0, 64, 64, 1);
    let write = cache.last_vram_write().unwrap();

    let key = SourceKey::new(0, TextureMode::Direct16Bit, PaletteReg(0));
    let s1 = cache.lookup_source(key, Rect::new(0, 0, 64, 64), PaletteRecordFlags::empty()).unwrap();
    let e1 = cache.source(s1).unwrap().hash_cache_key();
    assert_eq!(cache.lookup_source(key, Rect::INVALID, PaletteRecordFlags::empty()), Some(s1));
    assert_eq!(cache.hash_cache().get(&e1).unwrap().ref_count, 1);

    upload(&mut cache, 0, 0, 64, 64, 2);
    assert!(cache.source(s1).is_none());
    assert_eq!(cache.hash_cache().get(&e1).unwrap().ref_count, 0);
    assert!(cache.vram_write(write).is_none());
    assert_eq!(write_rects(&cache), vec![Rect::new(0, 0, 64, 64)]);
}

#[test]
fn test_horizontal_strips_coalesce_up_to_width() {
    let mut settings = tracking();
    settings.config.max_vram_write_coalesce_width = 128;
    let mut cache = new_cache(settings.clone());
    upload(&mut cache, 0, 0, 128, 16, 1);
    upload(&mut cache, 128, 0, 128, 16, 2);
    assert_eq!(write_rects(&cache), vec![Rect::new(0, 0, 256, 16)]);

    settings.config.max_vram_write_coalesce_width = 64;
    let mut cache = new_cache(settings);
    upload(&mut cache, 0, 0, 128, 16, 1);
    upload(&mut cache, 128, 0, 128, 16, 2);
    assert_eq!(cache.stats().vram_writes, 2);
}

#[test]
fn test_sampled_write_is_not_grown() {
    let mut settings = tracking();
    settings.dump_textures = true;
    settings.config.max_vram_write_coalesce_height = 16;

    // without a sampler the strip across the page boundary merges
    let mut cache = new_cache(settings.clone());
    upload(&mut cache, 0, 240, 64, 16, 1);
    upload(&mut cache, 0, 256, 64, 16, 2);
    assert_eq!(write_rects(&cache), vec![Rect::new(0, 240, 64, 272)]);

    let mut cache = new_cache(settings);
    upload(&mut cache, 0, 240, 64, 16, 1);
    let key = SourceKey::new(0, TextureMode::Direct16Bit, PaletteReg(0));
    let id = cache
        .lookup_source(key, Rect::new(0, 240, 16, 256), PaletteRecordFlags::empty())
        .unwrap();
    upload(&mut cache, 0, 256, 64, 16, 2);

    // the source lives on page 0 only, so the second strip didn't invalidate it
    assert!(cache.source(id).is_some());
    assert_eq!(
        write_rects(&cache),
        vec![Rect::new(0, 240, 64, 256), Rect::new(0, 256, 64, 272)]
    );
}

#[test]
fn test_source_lookup_reuses_source_and_entry() {
    let mut cache = new_cache(CacheSettings::default());
    let key = p4_key(1);
    let a = cache.lookup_source(key, Rect::INVALID, PaletteRecordFlags::empty()).unwrap();
    let b = cache.lookup_source(key, Rect::INVALID, PaletteRecordFlags::empty()).unwrap();
    assert_eq!(a, b);

    let src = cache.source(a).unwrap();
    // texture page, then the palette's page
    assert_eq!(src.page_refs(), &[1, 16]);
    assert!(cache.page(16).sources().any(|id| id == a));
    let entry = cache.hash_cache().get(&src.hash_cache_key()).unwrap();
    assert_eq!(entry.ref_count, 1);

    let stats = cache.stats();
    assert_eq!((stats.sources, stats.hash_cache_entries), (1, 1));
    assert_eq!((stats.hits, stats.misses), (0, 1));

    let p8 = SourceKey::new(1, TextureMode::Palette8Bit, key.palette);
    cache.lookup_source(p8, Rect::INVALID, PaletteRecordFlags::empty()).unwrap();
    assert_eq!(cache.stats().hash_cache_entries, 2);
}

#[test]
fn test_direct_keys_ignore_palette() {
    assert_eq!(
        SourceKey::new(3, TextureMode::Direct16Bit, PaletteReg(0x1234)),
        SourceKey::new(3, TextureMode::Direct16Bit, PaletteReg(0))
    );
    assert_ne!(p4_key(3), SourceKey::new(3, TextureMode::Palette4Bit, PaletteReg(0)));
}

#[test]
fn test_identical_pages_share_an_entry() {
    let mut cache = new_cache(CacheSettings::default());
    let a = SourceKey::new(0, TextureMode::Direct16Bit, PaletteReg(0));
    let b = SourceKey::new(5, TextureMode::Direct16Bit, PaletteReg(0));
    let sa = cache.lookup_source(a, Rect::INVALID, PaletteRecordFlags::empty()).unwrap();
    let sb = cache.lookup_source(b, Rect::INVALID, PaletteRecordFlags::empty()).unwrap();
    assert_ne!(sa, sb);

    let hkey = cache.source(sa).unwrap().hash_cache_key();
    assert_eq!(hkey, cache.source(sb).unwrap().hash_cache_key());
    assert_eq!(cache.hash_cache().len(), 1);
    assert_eq!(cache.hash_cache().get(&hkey).unwrap().ref_count, 2);
    assert_eq!(cache.stats().hits, 1);

    // x = 320 is inside page 5's footprint only
    upload(&mut cache, 320, 0, 16, 16, 1);
    assert!(cache.source(sb).is_none());
    assert!(cache.source(sa).is_some());
    assert_eq!(cache.hash_cache().get(&hkey).unwrap().ref_count, 1);

    cache.set_frame_number(10_000);
    cache.compact();
    assert!(cache.hash_cache().get(&hkey).is_some());
}

#[test]
fn test_compact_evicts_only_unreferenced_entries() {
    let mut settings = CacheSettings::default();
    settings.config.max_hash_cache_entries = 1;
    let mut cache = new_cache(settings);

    // make page 1 differ from page 0
    cache.write_vram(64, 0, 1, 1, &[0x1111], false, false);
    let a = cache.lookup_source(p4_key(0), Rect::INVALID, PaletteRecordFlags::empty()).unwrap();
    let b = cache.lookup_source(p4_key(1), Rect::INVALID, PaletteRecordFlags::empty()).unwrap();
    let ka = cache.source(a).unwrap().hash_cache_key();
    let kb = cache.source(b).unwrap().hash_cache_key();
    assert_ne!(ka, kb);

    cache.write_vram(0, 0, 1, 1, &[0x2222], false, false);
    assert!(cache.source(a).is_none());
    assert_eq!(cache.hash_cache().get(&ka).unwrap().ref_count, 0);

    cache.set_frame_number(1);
    cache.compact();
    assert!(cache.hash_cache().get(&ka).is_none());
    assert!(cache.hash_cache().get(&kb).is_some());
    assert_eq!(cache.stats().evictions, 1);

    // everything referenced: over the limit but nothing to drop
    cache.lookup_source(p4_key(0), Rect::INVALID, PaletteRecordFlags::empty()).unwrap();
    cache.compact();
    assert_eq!(cache.hash_cache().len(), 2);
    assert_eq!(cache.stats().evictions, 1);
}

#[test]
fn test_old_entries_age_out() {
    let mut cache = new_cache(CacheSettings::default());
    let id = cache.lookup_source(p4_key(0), Rect::INVALID, PaletteRecordFlags::empty()).unwrap();
    let key = cache.source(id).unwrap().hash_cache_key();
    cache.write_vram(0, 0, 1, 1, &[0x2222], false, false);

    cache.set_frame_number(MAX_HASH_CACHE_AGE);
    cache.compact();
    assert!(cache.hash_cache().get(&key).is_some());

    cache.set_frame_number(MAX_HASH_CACHE_AGE + 1);
    cache.compact();
    assert!(cache.hash_cache().is_empty());
    assert_eq!(cache.hash_cache().memory_usage(), 0);
}

#[test]
fn test_drawing_over_a_texture_invalidates_it_once() {
    let mut cache = new_cache(CacheSettings::default());
    let key = p4_key(0);
    let first = cache.lookup_source(key, Rect::INVALID, PaletteRecordFlags::empty()).unwrap();

    let drawn = Rect::new(0, 0, 32, 32);
    cache.add_drawn_rectangle(&drawn, &SCREEN);
    assert!(cache.source(first).is_none());
    assert!(cache.is_rect_drawn(&Rect::new(8, 8, 9, 9)));
    assert!(!cache.is_rect_drawn(&Rect::new(40, 40, 48, 48)));
    assert!(cache.are_source_pages_drawn(key, &drawn));

    // already covered: the new source survives
    let second = cache.lookup_source(key, Rect::INVALID, PaletteRecordFlags::empty()).unwrap();
    cache.add_drawn_rectangle(&Rect::new(4, 4, 20, 20), &SCREEN);
    assert!(cache.source(second).is_some());
}

#[test]
fn test_drawing_removes_writes_and_uploads_clear_draws() {
    let mut cache = new_cache(tracking());
    upload(&mut cache, 0, 0, 64, 64, 1);
    cache.add_drawn_rectangle(&Rect::new(0, 0, 8, 8), &SCREEN);
    assert_eq!(cache.stats().vram_writes, 0);
    assert!(cache.last_vram_write().is_none());

    assert!(cache.is_rect_drawn(&Rect::new(0, 0, 8, 8)));
    upload(&mut cache, 0, 0, 4, 4, 2);
    assert!(!cache.is_rect_drawn(&Rect::new(0, 0, 8, 8)));
    assert_eq!(cache.page(0).total_draw_rect(), Rect::INVALID);
}

#[test]
fn test_invalidate_returns_every_texture() {
    let mut cache = new_cache(tracking());
    upload(&mut cache, 0, 0, 64, 64, 1);
    upload(&mut cache, 512, 256, 64, 64, 2);
    for page in [0, 1, 8, 24] {
        cache.lookup_source(p4_key(page), Rect::INVALID, PaletteRecordFlags::empty()).unwrap();
    }
    cache.add_drawn_rectangle(&SCREEN, &SCREEN);
    assert!(cache.device().live_textures() > 0);

    cache.invalidate();
    let stats = cache.stats();
    assert_eq!((stats.sources, stats.vram_writes, stats.hash_cache_entries), (0, 0, 0));
    assert_eq!(cache.device().live_textures(), 0);
    assert!((0..NUM_VRAM_PAGES as u32).all(|pn| cache.page(pn).draw_rects().is_empty()));
}

#[test]
fn test_copy_converted_to_write_keeps_identity() {
    let mut settings = tracking();
    settings.config.convert_copies_to_writes = true;
    let mut cache = new_cache(settings.clone());

    upload(&mut cache, 0, 0, 64, 64, 1);
    upload(&mut cache, 128, 0, 32, 32, 2);
    let target = cache.last_vram_write().unwrap();
    let before = cache.vram_write(target).unwrap().hash;

    cache.copy_vram(0, 0, 128, 0, 64, 64, false, false);
    let write = cache.vram_write(target).unwrap();
    assert_ne!(write.hash, before);
    assert_eq!(write.hash, hash_rect(cache.vram(), &Rect::new(128, 0, 160, 32)));
    assert_eq!(cache.vram().pixel(128, 0), cache.vram().pixel(0, 0));

    settings.config.convert_copies_to_writes = false;
    let mut cache = new_cache(settings);
    upload(&mut cache, 0, 0, 64, 64, 1);
    upload(&mut cache, 128, 0, 32, 32, 2);
    let target = cache.last_vram_write().unwrap();
    cache.copy_vram(0, 0, 128, 0, 64, 64, false, false);
    assert!(cache.vram_write(target).is_none());
}

#[test]
fn test_fill_counts_as_a_write() {
    let mut cache = new_cache(tracking());
    upload(&mut cache, 0, 128, 64, 64, 1);
    let id = cache.lookup_source(p4_key(0), Rect::INVALID, PaletteRecordFlags::empty()).unwrap();

    cache.fill_vram(&Rect::new(0, 100, 64, 140), 0x7FFF);
    assert!(cache.source(id).is_none());
    assert_eq!(cache.stats().vram_writes, 0);
    assert_eq!(cache.vram().pixel(10, 139), 0x7FFF);
}

#[test]
fn test_save_state_round_trip() {
    let mut cache = new_cache(tracking());
    upload(&mut cache, 0, 0, 64, 64, 1);
    upload(&mut cache, 256, 256, 32, 32, 2);

    let state = cache.save_state();
    assert_eq!(state.writes.len(), 2);
    let restored = TextureCacheState::from_bytes(&state.to_bytes().unwrap()).unwrap();
    assert_eq!(restored, state);

    let mut other = new_cache(tracking());
    other.load_state(CURRENT_STATE_VERSION, &restored).unwrap();

    let summary = |c: &TextureCache<SoftwareDevice>| {
        let mut v: Vec<(Rect, u64)> = c.vram_writes().map(|(_, w)| (w.active_rect, w.hash)).collect();
        v.sort_by_key(|(r, _)| (r.top, r.left));
        v
    };
    assert_eq!(summary(&other), summary(&cache));
    assert_eq!(other.page(0).writes().len(), 1);
    assert_eq!(other.page(20).writes().len(), 1);

    // restored hashes must still describe what is in VRAM
    assert!(other.vram().pixels() == cache.vram().pixels());
    for (_, w) in other.vram_writes() {
        assert_eq!(hash_rect(other.vram(), &w.write_rect), w.hash);
    }
}

#[test]
fn test_old_or_corrupt_state_leaves_cache_empty() {
    let mut cache = new_cache(tracking());
    upload(&mut cache, 0, 0, 64, 64, 1);
    let state = cache.save_state();

    upload(&mut cache, 128, 0, 16, 16, 2);
    cache.load_state(MIN_STATE_VERSION - 1, &state).unwrap();
    assert_eq!(cache.stats().vram_writes, 0);

    let mut bad = state.clone();
    bad.writes[0].active_rect = Rect::new(1000, 0, 1100, 10);
    assert!(matches!(
        cache.load_state(CURRENT_STATE_VERSION, &bad),
        Err(CacheError::CorruptState(_))
    ));
    assert_eq!(cache.stats().vram_writes, 0);

    // not tracking: nothing to restore into
    let mut untracked = new_cache(CacheSettings::default());
    untracked.load_state(CURRENT_STATE_VERSION, &state).unwrap();
    assert_eq!(untracked.stats().vram_writes, 0);
}

#[test]
fn test_pipeline_failure_is_reported() {
    let mut device = SoftwareDevice::new();
    device.set_fail_pipelines(true);
    let settings = CacheSettings {
        enable_texture_replacements: true,
        ..CacheSettings::default()
    };
    let mut cache = TextureCache::new(device, settings);
    assert!(matches!(cache.initialize(), Err(CacheError::PipelineCompile(_))));
    assert_eq!(cache.device().live_pipelines(), 0);
}

#[test]
fn test_full_page_replacement_is_upscaled() {
    let dir = tempfile::tempdir().unwrap();
    let settings = CacheSettings {
        enable_texture_replacements: true,
        textures_dir: dir.path().to_path_buf(),
        ..CacheSettings::default()
    };
    let mut cache = new_cache(settings);
    assert_eq!(cache.device().live_pipelines(), 2);

    let page_hash = hash_page(cache.vram(), 0, TextureMode::Direct16Bit);
    let name = TextureReplacementName {
        kind: ReplacementKind::TextureFromPage,
        mode: TextureMode::Direct16Bit,
        semitransparent: false,
        src_hash: page_hash,
        pal_hash: 0,
        src_width: 256,
        src_height: 256,
        offset_x: 0,
        offset_y: 0,
        width: 256,
        height: 256,
        pal_min: 0,
        pal_max: 0,
    };
    let rgba = [10, 20, 30, 255];
    write_png(&replacement_dir(dir.path()).join(format!("{}.png", name)), 512, 512, rgba);
    cache.set_game_id(GAME);
    assert!(cache.replacements().has_texture_page_textures());

    let key = SourceKey::new(0, TextureMode::Direct16Bit, PaletteReg(0));
    let id = cache.lookup_source(key, Rect::INVALID, PaletteRecordFlags::empty()).unwrap();
    let texture = cache.source(id).unwrap().texture;
    assert_eq!(cache.device().texture_size(texture), (512, 512));

    let pixels = cache.device().texture_pixels(texture).unwrap();
    let expected = u32::from_le_bytes(rgba);
    assert!(pixels.iter().all(|&p| p == expected));
    assert_eq!(cache.stats().hash_cache_bytes, 512 * 512 * 4);
}

#[test]
fn test_upload_replacement_lands_on_the_page() {
    let dir = tempfile::tempdir().unwrap();
    let data = pattern(64, 64, 9);
    let write_rect = Rect::new(0, 0, 64, 64);
    let mut scratch = Vram::new();
    scratch.write(0, 0, 64, 64, &data, false, false);
    let write_hash = hash_rect(&scratch, &write_rect);

    let name = TextureReplacementName {
        kind: ReplacementKind::TextureFromVramWrite,
        mode: TextureMode::Direct16Bit,
        semitransparent: false,
        src_hash: write_hash,
        pal_hash: 0,
        src_width: 64,
        src_height: 64,
        offset_x: 0,
        offset_y: 0,
        width: 64,
        height: 64,
        pal_min: 0,
        pal_max: 0,
    };
    let rgba = [200, 100, 50, 255];
    write_png(&replacement_dir(dir.path()).join(format!("{}.png", name)), 64, 64, rgba);

    let settings = CacheSettings {
        enable_texture_replacements: true,
        textures_dir: dir.path().to_path_buf(),
        ..CacheSettings::default()
    };
    let mut cache = new_cache(settings);
    assert!(!cache.is_tracking_vram_writes());
    cache.set_game_id(GAME);
    // upload replacements need write tracking
    assert!(cache.is_tracking_vram_writes());

    cache.write_vram(0, 0, 64, 64, &data, false, false);
    assert_eq!(cache.vram_writes().next().unwrap().1.hash, write_hash);

    let key = SourceKey::new(0, TextureMode::Direct16Bit, PaletteReg(0));
    let id = cache.lookup_source(key, Rect::INVALID, PaletteRecordFlags::empty()).unwrap();
    let texture = cache.source(id).unwrap().texture;
    assert_eq!(cache.device().texture_size(texture), (256, 256));

    let pixels = cache.device().texture_pixels(texture).unwrap();
    assert_eq!(pixels[0], u32::from_le_bytes(rgba));
    assert_eq!(pixels[63 * 256 + 63], u32::from_le_bytes(rgba));
    // outside the upload: still the decoded (empty) page
    assert_eq!(pixels[100 * 256 + 100], 0);
}

#[test]
fn test_whole_upload_replacement_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let data = pattern(16, 16, 4);
    let name = VramReplacementName::from_hash(hash_upload(&data));
    write_png(
        &replacement_dir(dir.path()).join(format!("{}.png", name.file_title())),
        32,
        32,
        [1, 2, 3, 255],
    );

    let settings = CacheSettings {
        enable_vram_write_replacements: true,
        textures_dir: dir.path().to_path_buf(),
        ..CacheSettings::default()
    };
    let mut cache = new_cache(settings);
    cache.set_game_id(GAME);

    let image = cache.vram_replacement(16, 16, &data).unwrap();
    assert_eq!((image.width, image.height), (32, 32));
    assert!(cache.vram_replacement(16, 16, &pattern(16, 16, 5)).is_none());
    assert!(cache.vram_replacement(16, 16, &data[..10]).is_none());
}

#[test]
fn test_sampled_upload_is_dumped_when_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let settings = CacheSettings {
        dump_textures: true,
        textures_dir: dir.path().to_path_buf(),
        ..CacheSettings::default()
    };
    let mut cache = new_cache(settings);
    cache.set_game_id(GAME);
    assert!(cache.is_tracking_vram_writes());

    let clut: Vec<u16> = (0..16).map(|i| 0x8000 | (i * 0x421)).collect();
    cache.write_vram(0, 480, 16, 1, &clut, false, false);
    upload(&mut cache, 0, 0, 64, 64, 1);
    let write_hash = cache.vram_write(cache.last_vram_write().unwrap()).unwrap().hash;

    let sampled = Rect::new(0, 0, 16, 16);
    cache
        .lookup_source(p4_key(0), sampled, PaletteRecordFlags::empty())
        .unwrap();
    upload(&mut cache, 0, 0, 64, 64, 2);
    assert_eq!(cache.dumper().dumped_texture_count(), 1);

    let dumps: Vec<String> = fs::read_dir(cache.dump_directory())
        .unwrap()
        .map(|e| e.unwrap().path().file_stem().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(dumps.len(), 1);
    let name = TextureReplacementName::parse(&dumps[0]).unwrap();
    assert_eq!(name.kind, ReplacementKind::TextureFromVramWrite);
    assert_eq!(name.mode, TextureMode::Palette4Bit);
    assert_eq!(name.src_hash, write_hash);
    assert_eq!((name.src_width, name.src_height), (64, 64));
    assert_eq!((name.offset_x, name.offset_y), (0, 0));
    assert_eq!((name.width, name.height), (64, 16));
    assert!(cache.dump_directory().starts_with(dir.path().join(GAME)));
}

#[test]
fn test_removed_piece_hands_records_to_sibling() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = CacheSettings {
        dump_textures: true,
        textures_dir: dir.path().to_path_buf(),
        ..CacheSettings::default()
    };
    settings.config.max_vram_write_splits = 1;
    let mut cache = new_cache(settings);
    cache.set_game_id(GAME);

    let clut: Vec<u16> = (0..16).map(|i| 0x8000 | (i * 0x421)).collect();
    cache.write_vram(0, 480, 16, 1, &clut, false, false);
    upload(&mut cache, 0, 0, 64, 64, 1);
    let parent_hash = cache.vram_write(cache.last_vram_write().unwrap()).unwrap().hash;

    let sampled = Rect::new(0, 0, 16, 16);
    cache
        .lookup_source(p4_key(0), sampled, PaletteRecordFlags::empty())
        .unwrap();

    // a hole away from the sampled corner splits the upload
    upload(&mut cache, 32, 32, 16, 16, 2);
    let pieces = |c: &TextureCache<SoftwareDevice>| -> Vec<(Rect, Vec<PaletteRecord>)> {
        let mut v: Vec<(Rect, Vec<PaletteRecord>)> = c
            .vram_writes()
            .filter(|(_, w)| w.hash == parent_hash)
            .map(|(_, w)| (w.active_rect, w.palette_records.clone()))
            .collect();
        v.sort_by_key(|(r, _)| (r.top, r.left));
        v
    };
    let split = pieces(&cache);
    assert_eq!(split.len(), 4);
    let holders: Vec<Rect> = split
        .iter()
        .filter(|(_, recs)| !recs.is_empty())
        .map(|(r, _)| *r)
        .collect();
    assert_eq!(holders, vec![Rect::new(0, 0, 32, 64)]);

    // overwriting the piece holding the records moves them to another piece
    upload(&mut cache, 0, 0, 32, 64, 3);
    assert_eq!(cache.dumper().dumped_texture_count(), 0);

    let remaining = pieces(&cache);
    assert_eq!(remaining.len(), 3);
    let holders: Vec<&Vec<PaletteRecord>> = remaining
        .iter()
        .filter(|(_, recs)| !recs.is_empty())
        .map(|(_, recs)| recs)
        .collect();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].len(), 1);
    assert_eq!(holders[0][0].key, p4_key(0));
    assert_eq!(holders[0][0].rect, sampled);

    // the last piece standing dumps them
    cache.invalidate();
    assert_eq!(cache.dumper().dumped_texture_count(), 1);
}

#[test]
fn test_local_config_overrides_host_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let game_dir = dir.path().join(GAME);
    fs::create_dir_all(&game_dir).unwrap();
    fs::write(
        game_dir.join(LOCAL_CONFIG_FILENAME),
        "MaxVRAMWriteSplits = 2\nConvertCopiesToWrites = true\n",
    )
    .unwrap();

    let settings = CacheSettings {
        textures_dir: dir.path().to_path_buf(),
        ..tracking()
    };
    let mut cache = new_cache(settings);
    assert_eq!(cache.config().max_vram_write_splits, 0);

    cache.set_game_id(GAME);
    assert_eq!(cache.game_id(), GAME);
    assert_eq!(cache.config().max_vram_write_splits, 2);
    assert!(cache.config().convert_copies_to_writes);

    cache.set_game_id("SLUS-99999");
    assert_eq!(cache.config(), &Configuration::default());
}

#[test]
fn test_enabling_replacements_compiles_pipelines() {
    let mut cache = new_cache(CacheSettings::default());
    assert_eq!(cache.device().live_pipelines(), 0);

    let mut settings = cache.settings().clone();
    settings.enable_texture_replacements = true;
    cache.update_settings(settings).unwrap();
    assert_eq!(cache.device().live_pipelines(), 2);

    cache.shutdown();
    assert_eq!(cache.device().live_pipelines(), 0);
    assert!(!cache.is_tracking_vram_writes());
}
