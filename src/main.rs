use psx_texture_cache::debug_flags;
use psx_texture_cache::savestate::{TextureCacheState, CURRENT_STATE_VERSION};
use psx_texture_cache::{
    CacheSettings, PaletteRecordFlags, PaletteReg, Rect, SoftwareDevice, SourceKey, TextureCache,
    TextureMode,
};
use std::env;
use std::path::PathBuf;
use std::process;

struct Options {
    frames: u32,
    game_id: String,
    settings: CacheSettings,
    save_state: Option<PathBuf>,
    load_state: Option<PathBuf>,
}

fn usage(program: &str) {
    eprintln!(
        "Usage: {} [--frames N] [--game-id ID] [--textures-dir DIR] [--dump] [--dump-uploads] [--replace] [--save-state FILE] [--load-state FILE]",
        program
    );
}

fn take_value(args: &[String], i: usize, flag: &str) -> String {
    match args.get(i + 1) {
        Some(v) => v.clone(),
        None => {
            eprintln!("{} requires a value", flag);
            process::exit(2);
        }
    }
}

fn parse_args() -> Options {
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        usage(&args[0]);
        process::exit(0);
    }

    let mut opts = Options {
        frames: 600,
        game_id: String::from("SLUS-00000"),
        settings: CacheSettings::default(),
        save_state: None,
        load_state: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--frames" => {
                let v = take_value(&args, i, "--frames");
                opts.frames = match v.parse() {
                    Ok(n) => n,
                    Err(_) => {
                        eprintln!("--frames: '{}' is not a number", v);
                        process::exit(2);
                    }
                };
                i += 2;
            }
            "--game-id" => {
                opts.game_id = take_value(&args, i, "--game-id");
                i += 2;
            }
            "--textures-dir" => {
                opts.settings.textures_dir = PathBuf::from(take_value(&args, i, "--textures-dir"));
                i += 2;
            }
            "--dump" => {
                opts.settings.dump_textures = true;
                i += 1;
            }
            "--dump-uploads" => {
                opts.settings.dump_vram_writes = true;
                i += 1;
            }
            "--replace" => {
                opts.settings.enable_texture_replacements = true;
                opts.settings.enable_vram_write_replacements = true;
                i += 1;
            }
            "--save-state" => {
                opts.save_state = Some(PathBuf::from(take_value(&args, i, "--save-state")));
                i += 2;
            }
            "--load-state" => {
                opts.load_state = Some(PathBuf::from(take_value(&args, i, "--load-state")));
                i += 2;
            }
            s => {
                eprintln!("Unknown option: {}", s);
                usage(&args[0]);
                process::exit(2);
            }
        }
    }
    opts
}

// Small LCG so runs are reproducible.
struct Lcg(u32);

impl Lcg {
    fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        self.0 >> 8
    }
}

const FRAMEBUFFER: Rect = Rect::new(0, 0, 320, 240);
const CLUT_X: u32 = 0;
const CLUT_Y: u32 = 480;
const TEXTURE_PAGES: [u32; 4] = [24, 25, 26, 27];

/// One synthetic frame: a game streaming 4-bit textures into the lower half
/// of VRAM while rendering into a 320x240 framebuffer.
fn run_frame(cache: &mut TextureCache<SoftwareDevice>, frame: u32, rng: &mut Lcg) {
    cache.set_frame_number(frame);

    if frame % 30 == 0 {
        let clut: Vec<u16> = (0..16).map(|_| (rng.next() as u16) | 0x8000).collect();
        cache.write_vram(CLUT_X, CLUT_Y + (frame / 30) % 4, 16, 1, &clut, false, false);
    }

    if frame % 60 == 0 {
        let page = TEXTURE_PAGES[((frame / 60) % TEXTURE_PAGES.len() as u32) as usize];
        let x = (page & 0xF) * 64;
        // upload in 64x16 strips, which coalesce when enabled
        for strip in 0..16 {
            let pixels: Vec<u16> = (0..64 * 16).map(|_| rng.next() as u16).collect();
            cache.write_vram(x, 256 + strip * 16, 64, 16, &pixels, false, false);
        }
    }

    for (n, &page) in TEXTURE_PAGES.iter().enumerate() {
        let palette = PaletteReg::from_position(CLUT_X, CLUT_Y + n as u32 % 4);
        let key = SourceKey::new(page, TextureMode::Palette4Bit, palette);
        let x = ((page & 0xF) * 64) as i32;
        let uv = Rect::new(x, 256, x + 16, 256 + 64);
        let flags = if rng.next() % 4 == 0 {
            PaletteRecordFlags::HAS_SEMI_TRANSPARENT_DRAWS
        } else {
            PaletteRecordFlags::empty()
        };
        if cache.lookup_source(key, uv, flags).is_none() {
            log::warn!("Source lookup failed for {}", key);
        }
    }

    cache.add_drawn_rectangle(&FRAMEBUFFER, &FRAMEBUFFER);
    cache.compact();
}

fn print_stats(cache: &TextureCache<SoftwareDevice>, frame: u32) {
    let stats = cache.stats();
    println!(
        "frame {:>6}: {} sources, {} writes, {} hash entries ({:.2} MB), {} hits, {} misses, {} evictions",
        frame,
        stats.sources,
        stats.vram_writes,
        stats.hash_cache_entries,
        stats.hash_cache_bytes as f64 / 1048576.0,
        stats.hits,
        stats.misses,
        stats.evictions
    );
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let opts = parse_args();
    let quiet = debug_flags::quiet();

    let mut settings = opts.settings;
    settings.always_track_uploads = true;

    let mut cache = TextureCache::new(SoftwareDevice::new(), settings);
    if let Err(e) = cache.initialize() {
        eprintln!("Failed to initialize texture cache: {}", e);
        process::exit(1);
    }
    cache.set_game_id(&opts.game_id);

    if let Some(path) = &opts.load_state {
        let loaded = TextureCacheState::load_from_file(path)
            .and_then(|state| cache.load_state(CURRENT_STATE_VERSION, &state));
        if let Err(e) = loaded {
            eprintln!("Failed to load state from {}: {}", path.display(), e);
            process::exit(1);
        }
        if !quiet {
            println!("Loaded state from {}", path.display());
        }
    }

    let interval = debug_flags::stats_interval();
    let mut rng = Lcg(0x1234_5678);
    for frame in 0..opts.frames {
        run_frame(&mut cache, frame, &mut rng);
        if !quiet && interval != 0 && frame % interval == 0 {
            print_stats(&cache, frame);
        }
    }

    if let Some(path) = &opts.save_state {
        if let Err(e) = cache.save_state().save_to_file(path) {
            eprintln!("Failed to save state to {}: {}", path.display(), e);
            process::exit(1);
        }
        if !quiet {
            println!("Saved state to {}", path.display());
        }
    }

    if !quiet {
        print_stats(&cache, opts.frames);
    }
    cache.shutdown();
}
