use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of physical LED sections (top, back, chain, bottom)
pub const SECTION_COUNT: usize = 4;

/// Number of raw argument slots carried by every layer
pub const LAYER_ARG_COUNT: usize = 3;

/// Highest number of patterns the catalog accepts
pub const MAX_PATTERNS: usize = 256;

/// Highest number of layers the store accepts
pub const MAX_LAYERS: usize = 64;

/// State of the serial link to the LED controller board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(text)
    }
}

/// Describes one argument of a pattern and its inclusive valid range
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternArgInfo {
    pub name: String,
    pub start: i32,
    pub end: i32,
}

/// A pattern offered by the board. Entries the board has not reported yet
/// are placeholders with an empty name and no arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternInfo {
    pub name: String,
    pub args: Vec<PatternArgInfo>,
}

impl PatternInfo {
    pub fn is_placeholder(&self) -> bool {
        self.name.is_empty() && self.args.is_empty()
    }
}

/// Configuration of a single animation layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSettings {
    pub layer_num: usize,
    pub pattern_num: i32,
    /// Raw pattern parameters; only as many slots as the pattern defines are used
    pub args: [i32; LAYER_ARG_COUNT],
    /// Logarithmic UI scale, 0..=1000
    pub anim_speed: i32,
    /// 0..=30, sent as-is
    pub anim_step: i32,
}

/// Everything known about the board: brightness, pattern catalog and layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    pub global_brightness: i32,
    pub section_brightness: [i32; SECTION_COUNT],
    patterns: Vec<PatternInfo>,
    layers: Vec<LayerSettings>,
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn patterns(&self) -> &[PatternInfo] {
        &self.patterns
    }

    pub fn pattern(&self, index: usize) -> Option<&PatternInfo> {
        self.patterns.get(index)
    }

    /// Store a pattern, padding the catalog with placeholders up to `index`.
    /// The catalog never shrinks.
    pub fn set_pattern(&mut self, index: usize, info: PatternInfo) {
        if self.patterns.len() <= index {
            self.patterns.resize_with(index + 1, PatternInfo::default);
        }
        self.patterns[index] = info;
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Read a layer without creating it
    pub fn layer(&self, index: usize) -> Option<&LayerSettings> {
        self.layers.get(index)
    }

    /// Get a layer, creating it (and every layer before it) with defaults
    /// if it does not exist yet. The returned layer's `layer_num` always
    /// equals `index`.
    pub fn layer_mut(&mut self, index: usize) -> &mut LayerSettings {
        if self.layers.len() <= index {
            self.layers.resize_with(index + 1, LayerSettings::default);
        }
        let layer = &mut self.layers[index];
        layer.layer_num = index;
        layer
    }
}
