use std::sync::OnceLock;

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

// Per-lookup source create/hit/invalidate chatter (very noisy)
pub fn trace_sources() -> bool {
    static ON: OnceLock<bool> = OnceLock::new();
    *ON.get_or_init(|| env_flag("TC_TRACE_SOURCES", false))
}

// VRAM write create/merge/split/remove lifecycle
pub fn trace_writes() -> bool {
    static ON: OnceLock<bool> = OnceLock::new();
    *ON.get_or_init(|| env_flag("TC_TRACE_WRITES", false))
}

// Track uploads even when nothing needs them (dump or replacement off)
pub fn always_track_vram_writes() -> bool {
    static ON: OnceLock<bool> = OnceLock::new();
    *ON.get_or_init(|| env_flag("TC_ALWAYS_TRACK_VRAM_WRITES", false))
}

// Headless driver: print cache stats every N frames (0 = only at exit)
pub fn stats_interval() -> u32 {
    static V: OnceLock<u32> = OnceLock::new();
    *V.get_or_init(|| env_u32("TC_STATS_INTERVAL", 0))
}

pub fn quiet() -> bool {
    static ON: OnceLock<bool> = OnceLock::new();
    *ON.get_or_init(|| env_flag("QUIET", false))
}
