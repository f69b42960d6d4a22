//! Objects derived from a Prometheus instance's configuration

mod panopticon;
mod preset;

pub use self::panopticon::create_panopticon_service_monitor;
pub use self::preset::{
    create_preset, generate_preset_for_prometheus, labels_for_label_selector, AlertPreset,
    MonitoringPresets, PRESET_NAME,
};
