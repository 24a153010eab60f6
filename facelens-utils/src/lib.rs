//! Common helpers shared across the facelens crates.

/// Persisted settings for detectors, patch networks, alignment and matching.
pub mod config;
/// Test fixture discovery and loading.
pub mod fixtures;
/// Image loading and resizing.
pub mod image_utils;
/// Scoped timing records.
pub mod telemetry;

use log::LevelFilter;

pub use config::{
    AlignmentKind, AlignmentSettings, AppSettings, DetectorSettings, MatchAggregation,
    MatcherSettings, ModelPaths, MtcnnSettings, OverlapMetric, PatchNetworkSettings,
    ResizeQuality, SsdSettings, TelemetrySettings, TinySettings,
};
pub use fixtures::{fixture_path, fixtures_dir, load_fixture_image, load_fixture_json};
pub use image_utils::{load_image, resize_filter, resize_rgb};
pub use telemetry::{
    TELEMETRY_TARGET, TimingGuard, configure as configure_telemetry, telemetry_allows,
    telemetry_enabled, telemetry_level, timing_guard, timing_guard_if,
};

/// Initialize `env_logger` once, honouring `RUST_LOG` when it is set.
///
/// Telemetry records are always let through the logger; whether they are produced is decided by
/// [`telemetry::configure`]. Calling this more than once is harmless.
pub fn init_logging(default_filter: LevelFilter) {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter.as_str()),
    );
    builder.filter_module(TELEMETRY_TARGET, LevelFilter::Trace);
    // A logger installed earlier (e.g. by a test harness) keeps precedence.
    let _ = builder.try_init();
}

/// Apply telemetry settings to the global timing state.
pub fn apply_telemetry_settings(settings: &TelemetrySettings) {
    telemetry::configure(settings.enabled, settings.level_filter());
}
