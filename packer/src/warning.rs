use thiserror::Error;

///Non-fatal diagnostics. Warnings never change the output beyond what their
///code path already does; they are logged and processing continues.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PostWarning {
    #[error("bridging speed is {speed:.0} mm/s; <= 5 mm/s is recommended to avoid warping")]
    BridgeSpeedHigh { speed: f64 },

    #[error("infill is printed before perimeters, this can disturb arc anchoring")]
    InfillFirst,

    #[error("external perimeters are printed first, inner-first gives better overhangs")]
    ExternalPerimetersFirst,

    #[error("avoid_crossing_perimeters is off, travel moves may cross the outline")]
    AvoidCrossingPerimetersOff,

    #[error(
        "setting `{key}` is a per-extruder list, using its first value (reported once)"
    )]
    TupleValueUsed { key: String },

    #[error("layer {layer}: no ;HEIGHT marker found, falling back to layer_height")]
    NoHeightMarker { layer: usize },

    #[error(
        "layer {layer}: overhang region is only {filled:.0}% filled with arcs; consider \
         raising ExtendIntoPerimeter, lowering MaxDistanceFromPerimeter or setting \
         ArcCenterOffset to 0"
    )]
    LowFill { layer: usize, filled: f64 },

    #[error("layer {layer}: arc generation was stuck at a tight spot, retrying with ArcCenterOffset 0")]
    StartupStuckRecovered { layer: usize },

    #[error("layer {layer}: the tight-spot retry did not help, leaving region partly filled")]
    StartupStuckAbandoned { layer: usize },

    #[error("layer {layer}: arc count exceeded the safety limit of {limit}, region truncated")]
    SafetyBreak { layer: usize, limit: usize },
}

///Route a warning through the log facade so callers don't juggle levels.
pub fn emit(warning: &PostWarning) {
    log::warn!("{}", warning);
}
