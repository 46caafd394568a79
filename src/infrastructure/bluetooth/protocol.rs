//! LED Controller Protocol
//!
//! Line-oriented text protocol spoken by the LED controller board over the
//! serial link. Every line starts with a single-letter code followed by
//! comma-separated fields:
//!
//! ```text
//! l<idx>,<name>,(<argName>,<start>,<end>)*   pattern catalog entry
//! b<value>                                   global brightness
//! s<v0>,<v1>,<v2>,<v3>                       section brightness
//! p<layer>,<pattern>,<arg0>,<arg1>,<arg2>    layer pattern + args
//! a<layer>,<linearSpeed>                     layer animation speed
//! t<layer>,<step>                            layer animation step
//! ```
//!
//! The same grammar is used in both directions. Integer fields that fail to
//! parse read as 0.

use crate::domain::models::{
    DeviceState, LayerSettings, PatternArgInfo, PatternInfo, LAYER_ARG_COUNT, MAX_LAYERS,
    MAX_PATTERNS, SECTION_COUNT,
};
use thiserror::Error;

/// Serial Port Profile service class UUID
pub const SPP_SERVICE_UUID: &str = "00001101-0000-1000-8000-00805f9b34fb";

/// RFCOMM channel used when the service record lookup fails
pub const FALLBACK_RFCOMM_CHANNEL: u8 = 1;

/// Upper bound of the logarithmic animation speed scale
pub const ANIM_SPEED_MAX: i32 = 1000;

/// Decades spanned by the linear device speed (10^3 - 1 = 999)
const ANIM_SPEED_DECADES: f64 = 3.0;

/// Requests the board understands on top of the configuration lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRequest {
    /// Report every pattern with its argument metadata
    PatternCatalog,
    /// Report the full current configuration
    Configuration,
}

impl DeviceRequest {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PatternCatalog => "l",
            Self::Configuration => "c",
        }
    }
}

/// Sent on every new connection
pub const BOOTSTRAP_SEQUENCE: &[DeviceRequest] =
    &[DeviceRequest::PatternCatalog, DeviceRequest::Configuration];

/// A single decoded device report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateDelta {
    Pattern {
        index: usize,
        info: PatternInfo,
    },
    GlobalBrightness(i32),
    SectionBrightness([i32; SECTION_COUNT]),
    LayerPattern {
        layer: usize,
        pattern_num: i32,
        args: [i32; LAYER_ARG_COUNT],
    },
    LayerAnimSpeed {
        layer: usize,
        anim_speed: i32,
    },
    LayerAnimStep {
        layer: usize,
        anim_step: i32,
    },
}

impl StateDelta {
    pub fn apply(self, state: &mut DeviceState) {
        match self {
            Self::Pattern { index, info } => state.set_pattern(index, info),
            Self::GlobalBrightness(value) => state.global_brightness = value,
            Self::SectionBrightness(values) => state.section_brightness = values,
            Self::LayerPattern {
                layer,
                pattern_num,
                args,
            } => {
                let layer = state.layer_mut(layer);
                layer.pattern_num = pattern_num;
                layer.args = args;
            }
            Self::LayerAnimSpeed { layer, anim_speed } => {
                state.layer_mut(layer).anim_speed = anim_speed;
            }
            Self::LayerAnimStep { layer, anim_step } => {
                state.layer_mut(layer).anim_step = anim_step;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty line")]
    Empty,
    #[error("line does not start with an alphabetic code")]
    InvalidCode,
    #[error("unknown code '{0}'")]
    UnknownCode(char),
    #[error("code '{code}' is missing its {field} field")]
    MissingField { code: char, field: &'static str },
    #[error("code '{code}' has negative index {value}")]
    NegativeIndex { code: char, value: i32 },
    #[error("code '{code}' index {value} is not below {limit}")]
    IndexOutOfRange { code: char, value: usize, limit: usize },
}

/// Decode one line received from the board
pub fn decode_line(line: &str) -> Result<StateDelta, DecodeError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let code = line.chars().next().ok_or(DecodeError::Empty)?;
    if !code.is_ascii_alphabetic() {
        return Err(DecodeError::InvalidCode);
    }

    let fields = split_fields(&line[code.len_utf8()..]);
    let fields = Fields {
        code,
        items: &fields,
    };

    match code {
        'l' => {
            let index = fields.index(0, "index", MAX_PATTERNS)?;
            let name = fields.text(1, "name")?.to_string();
            let args = fields.items[2..]
                .chunks_exact(3)
                .map(|triple| PatternArgInfo {
                    name: triple[0].to_string(),
                    start: parse_int(triple[1]),
                    end: parse_int(triple[2]),
                })
                .collect();
            Ok(StateDelta::Pattern {
                index,
                info: PatternInfo { name, args },
            })
        }
        'b' => Ok(StateDelta::GlobalBrightness(fields.int(0, "brightness")?)),
        's' => {
            let mut values = [0; SECTION_COUNT];
            fields.fill(0, &mut values);
            Ok(StateDelta::SectionBrightness(values))
        }
        'p' => {
            let layer = fields.index(0, "layer", MAX_LAYERS)?;
            let pattern_num = fields.int(1, "pattern")?;
            let mut args = [0; LAYER_ARG_COUNT];
            fields.fill(2, &mut args);
            Ok(StateDelta::LayerPattern {
                layer,
                pattern_num,
                args,
            })
        }
        'a' => Ok(StateDelta::LayerAnimSpeed {
            layer: fields.index(0, "layer", MAX_LAYERS)?,
            anim_speed: decode_anim_speed(fields.int(1, "speed")?),
        }),
        't' => Ok(StateDelta::LayerAnimStep {
            layer: fields.index(0, "layer", MAX_LAYERS)?,
            anim_step: fields.int(1, "step")?,
        }),
        other => Err(DecodeError::UnknownCode(other)),
    }
}

/// Decode a line and apply it to the state. The state is left untouched if
/// the line is invalid.
pub fn apply_line(state: &mut DeviceState, line: &str) -> Result<(), DecodeError> {
    decode_line(line)?.apply(state);
    Ok(())
}

/// Commands restoring global brightness and section brightness
pub fn encode_global(state: &DeviceState) -> String {
    format!(
        "b{}\ns{}\n",
        state.global_brightness,
        join(&state.section_brightness)
    )
}

/// Commands restoring a layer's pattern, animation speed and step
pub fn encode_layer(layer: &LayerSettings) -> String {
    format!(
        "p{num},{pattern},{args}\na{num},{speed}\nt{num},{step}\n",
        num = layer.layer_num,
        pattern = layer.pattern_num,
        args = join(&layer.args),
        speed = encode_anim_speed(layer.anim_speed),
        step = layer.anim_step,
    )
}

/// Convert the logarithmic UI speed (0..=1000) to the board's linear speed
/// (999..=0)
pub fn encode_anim_speed(anim_speed: i32) -> i32 {
    let speed = anim_speed.clamp(0, ANIM_SPEED_MAX);
    let exponent =
        f64::from(ANIM_SPEED_MAX - speed) / f64::from(ANIM_SPEED_MAX) * ANIM_SPEED_DECADES;
    10f64.powf(exponent).round() as i32 - 1
}

/// Inverse of [`encode_anim_speed`]. Negative linear speeds are treated as 0.
pub fn decode_anim_speed(linear_speed: i32) -> i32 {
    let linear = f64::from(linear_speed.max(0));
    let scaled = (linear + 1.0).log10() / ANIM_SPEED_DECADES * f64::from(ANIM_SPEED_MAX);
    (ANIM_SPEED_MAX - scaled.round() as i32).clamp(0, ANIM_SPEED_MAX)
}

struct Fields<'a> {
    code: char,
    items: &'a [&'a str],
}

impl<'a> Fields<'a> {
    fn text(&self, position: usize, field: &'static str) -> Result<&'a str, DecodeError> {
        self.items
            .get(position)
            .copied()
            .ok_or(DecodeError::MissingField {
                code: self.code,
                field,
            })
    }

    fn int(&self, position: usize, field: &'static str) -> Result<i32, DecodeError> {
        self.text(position, field).map(parse_int)
    }

    fn index(
        &self,
        position: usize,
        field: &'static str,
        limit: usize,
    ) -> Result<usize, DecodeError> {
        let value = self.int(position, field)?;
        let index = usize::try_from(value).map_err(|_| DecodeError::NegativeIndex {
            code: self.code,
            value,
        })?;
        if index >= limit {
            return Err(DecodeError::IndexOutOfRange {
                code: self.code,
                value: index,
                limit,
            });
        }
        Ok(index)
    }

    /// Copy integers starting at `position` into `out`; absent values stay 0
    /// and extra values are ignored
    fn fill(&self, position: usize, out: &mut [i32]) {
        let values = self.items.iter().skip(position).map(|s| parse_int(s));
        for (slot, value) in out.iter_mut().zip(values) {
            *slot = value;
        }
    }
}

fn split_fields(rest: &str) -> Vec<&str> {
    let mut fields: Vec<&str> = rest.split(',').collect();
    // Trailing empty fields carry no data
    while fields.last().is_some_and(|field| field.is_empty()) {
        fields.pop();
    }
    fields
}

fn parse_int(text: &str) -> i32 {
    text.trim().parse().unwrap_or(0)
}

fn join(values: &[i32]) -> String {
    values
        .iter()
        .map(i32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_layers() -> DeviceState {
        let mut state = DeviceState::new();
        state.global_brightness = 7;
        state.section_brightness = [1, 2, 3, 4];
        state.layer_mut(1).pattern_num = 9;
        state
    }

    #[test]
    fn test_decode_global_brightness_changes_nothing_else() {
        let mut state = state_with_layers();
        let before = state.clone();

        apply_line(&mut state, "b128").unwrap();

        assert_eq!(state.global_brightness, 128);
        state.global_brightness = before.global_brightness;
        assert_eq!(state, before);
    }

    #[test]
    fn test_decode_section_brightness() {
        let mut state = DeviceState::new();
        apply_line(&mut state, "s10,20,30,40").unwrap();
        assert_eq!(state.section_brightness, [10, 20, 30, 40]);

        // Short reports zero the missing sections, long ones are truncated
        apply_line(&mut state, "s5,6").unwrap();
        assert_eq!(state.section_brightness, [5, 6, 0, 0]);
        apply_line(&mut state, "s1,2,3,4,5").unwrap();
        assert_eq!(state.section_brightness, [1, 2, 3, 4]);
    }

    #[test]
    fn test_decode_pattern_extends_catalog() {
        let mut state = DeviceState::new();
        state.set_pattern(
            0,
            PatternInfo {
                name: "Solid".to_string(),
                args: Vec::new(),
            },
        );

        apply_line(&mut state, "l2,Rainbow,speed,0,10,hue,0,255").unwrap();

        assert_eq!(state.patterns().len(), 3);
        assert_eq!(state.pattern(0).unwrap().name, "Solid");
        assert!(state.pattern(1).unwrap().is_placeholder());

        let rainbow = state.pattern(2).unwrap();
        assert_eq!(rainbow.name, "Rainbow");
        assert_eq!(
            rainbow.args,
            vec![
                PatternArgInfo {
                    name: "speed".to_string(),
                    start: 0,
                    end: 10
                },
                PatternArgInfo {
                    name: "hue".to_string(),
                    start: 0,
                    end: 255
                },
            ]
        );
    }

    #[test]
    fn test_decode_pattern_ignores_incomplete_triple() {
        let delta = decode_line("l0,Fade,rate,1").unwrap();
        match delta {
            StateDelta::Pattern { index, info } => {
                assert_eq!(index, 0);
                assert_eq!(info.name, "Fade");
                assert!(info.args.is_empty());
            }
            other => panic!("unexpected delta: {:?}", other),
        }
    }

    #[test]
    fn test_decode_layer_lines() {
        let mut state = DeviceState::new();
        apply_line(&mut state, "p1,3,5,6,7").unwrap();
        apply_line(&mut state, "a1,31").unwrap();
        apply_line(&mut state, "t1,10\r\n").unwrap();

        let layer = state.layer(1).unwrap();
        assert_eq!(layer.layer_num, 1);
        assert_eq!(layer.pattern_num, 3);
        assert_eq!(layer.args, [5, 6, 7]);
        assert_eq!(layer.anim_speed, decode_anim_speed(31));
        assert_eq!(layer.anim_step, 10);
        assert_eq!(state.layer_count(), 2);
    }

    #[test]
    fn test_decode_layer_args_fixed_length() {
        let mut state = DeviceState::new();
        apply_line(&mut state, "p0,2,9").unwrap();
        assert_eq!(state.layer(0).unwrap().args, [9, 0, 0]);

        apply_line(&mut state, "p0,2,1,2,3,4,5").unwrap();
        assert_eq!(state.layer(0).unwrap().args, [1, 2, 3]);
    }

    #[test]
    fn test_unparseable_integers_decode_to_zero() {
        let mut state = DeviceState::new();
        apply_line(&mut state, "s10,x,30,").unwrap();
        assert_eq!(state.section_brightness, [10, 0, 30, 0]);

        apply_line(&mut state, "bbright").unwrap();
        assert_eq!(state.global_brightness, 0);
    }

    #[test]
    fn test_unknown_code_leaves_state_unchanged() {
        let mut state = state_with_layers();
        let before = state.clone();

        assert_eq!(
            apply_line(&mut state, "z1,2,3"),
            Err(DecodeError::UnknownCode('z'))
        );
        assert_eq!(state, before);
    }

    #[test]
    fn test_invalid_lines_rejected() {
        assert_eq!(decode_line(""), Err(DecodeError::Empty));
        assert_eq!(decode_line("1,2,3"), Err(DecodeError::InvalidCode));
        assert_eq!(decode_line(",b5"), Err(DecodeError::InvalidCode));
        assert_eq!(
            decode_line("a2"),
            Err(DecodeError::MissingField {
                code: 'a',
                field: "speed"
            })
        );
        assert_eq!(
            decode_line("t-1,4"),
            Err(DecodeError::NegativeIndex { code: 't', value: -1 })
        );
        assert_eq!(
            decode_line("l"),
            Err(DecodeError::MissingField {
                code: 'l',
                field: "index"
            })
        );
    }

    #[test]
    fn test_invalid_layer_line_does_not_create_layer() {
        let mut state = DeviceState::new();
        assert!(apply_line(&mut state, "x4,1").is_err());
        assert!(apply_line(&mut state, "a4").is_err());
        assert_eq!(state.layer_count(), 0);
    }

    #[test]
    fn test_huge_indexes_rejected_without_growing_state() {
        let mut state = DeviceState::new();
        assert_eq!(
            apply_line(&mut state, "l2000000000,x"),
            Err(DecodeError::IndexOutOfRange {
                code: 'l',
                value: 2_000_000_000,
                limit: MAX_PATTERNS
            })
        );
        assert_eq!(
            apply_line(&mut state, "p2000000000,1,2,3,4"),
            Err(DecodeError::IndexOutOfRange {
                code: 'p',
                value: 2_000_000_000,
                limit: MAX_LAYERS
            })
        );
        assert!(apply_line(&mut state, &format!("t{},1", MAX_LAYERS)).is_err());
        assert!(state.patterns().is_empty());
        assert_eq!(state.layer_count(), 0);

        // The last valid slots still work
        apply_line(&mut state, &format!("l{},Last", MAX_PATTERNS - 1)).unwrap();
        apply_line(&mut state, &format!("t{},1", MAX_LAYERS - 1)).unwrap();
        assert_eq!(state.patterns().len(), MAX_PATTERNS);
        assert_eq!(state.layer_count(), MAX_LAYERS);
    }

    #[test]
    fn test_encode_global() {
        let mut state = DeviceState::new();
        state.global_brightness = 200;
        state.section_brightness = [10, 20, 30, 40];
        assert_eq!(encode_global(&state), "b200\ns10,20,30,40\n");
    }

    #[test]
    fn test_encode_layer() {
        let layer = LayerSettings {
            layer_num: 1,
            pattern_num: 3,
            args: [5, 6, 7],
            anim_speed: 500,
            anim_step: 10,
        };

        let encoded = encode_layer(&layer);
        let lines: Vec<&str> = encoded.split_terminator('\n').collect();

        // 10^1.5 = 31.62 -> 32 - 1
        assert_eq!(lines, vec!["p1,3,5,6,7", "a1,31", "t1,10"]);
        assert!(encoded.ends_with('\n'));
        assert_eq!(encoded.matches('\n').count(), 3);
    }

    #[test]
    fn test_encoded_layer_decodes_back() {
        let mut source = DeviceState::new();
        {
            let layer = source.layer_mut(2);
            layer.pattern_num = 4;
            layer.args = [1, 2, 3];
            layer.anim_speed = 250;
            layer.anim_step = 30;
        }

        let mut echoed = DeviceState::new();
        for line in encode_layer(source.layer(2).unwrap()).lines() {
            apply_line(&mut echoed, line).unwrap();
        }

        let layer = echoed.layer(2).unwrap();
        assert_eq!(layer.pattern_num, 4);
        assert_eq!(layer.args, [1, 2, 3]);
        assert!((layer.anim_speed - 250).abs() <= 1);
        assert_eq!(layer.anim_step, 30);
    }

    #[test]
    fn test_anim_speed_endpoints() {
        assert_eq!(encode_anim_speed(0), 999);
        assert_eq!(encode_anim_speed(1000), 0);
        assert_eq!(decode_anim_speed(999), 0);
        assert_eq!(decode_anim_speed(0), 1000);
    }

    #[test]
    fn test_anim_speed_round_trip_within_one() {
        // Above ~450 the board's integer scale is coarser than one UI step
        for speed in 0..=450 {
            let decoded = decode_anim_speed(encode_anim_speed(speed));
            assert!(
                (decoded - speed).abs() <= 1,
                "speed {} decoded as {}",
                speed,
                decoded
            );
        }
    }

    #[test]
    fn test_anim_speed_device_value_is_stable() {
        // Whatever the board echoes back re-encodes to the same wire value
        for speed in 0..=ANIM_SPEED_MAX {
            let linear = encode_anim_speed(speed);
            assert_eq!(
                encode_anim_speed(decode_anim_speed(linear)),
                linear,
                "speed {}",
                speed
            );
        }
    }

    #[test]
    fn test_anim_speed_out_of_range_is_clamped() {
        assert_eq!(decode_anim_speed(-5), 1000);
        assert_eq!(decode_anim_speed(100_000), 0);
        assert_eq!(encode_anim_speed(-10), 999);
        assert_eq!(encode_anim_speed(2000), 0);
    }

    #[test]
    fn test_bootstrap_sequence() {
        let requests: Vec<&str> = BOOTSTRAP_SEQUENCE.iter().map(|r| r.as_str()).collect();
        assert_eq!(requests, vec!["l", "c"]);
    }
}
