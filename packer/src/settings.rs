use std::collections::HashMap;

use geo::{LineString, Polygon};
use serde::Deserialize;

use crate::error::PostError;
use crate::warning::PostWarning;

///Settings extracted from the slicer's config trailer in the g-code file.
///Only the keys the post-processor actually consumes are lifted out.
#[derive(Debug, Clone)]
pub struct SlicerSettings {
    ///Diameter of the nozzle in mm
    pub nozzle_diameter: f64,

    ///Diameter of the filament in mm
    pub filament_diameter: f64,

    ///The height of the layers
    pub layer_height: f64,

    ///Default extrusion width
    pub extrusion_width: f64,

    ///Extrusion width of perimeters
    pub perimeter_extrusion_width: f64,

    ///Extrusion width of solid infill
    pub solid_infill_extrusion_width: f64,

    ///Extrusion width of sparse infill
    pub infill_extrusion_width: f64,

    ///Travel speed in mm/s, used to recognize travel moves inside features
    pub travel_speed: f64,

    ///Length to retract in mm
    pub retract_length: f64,

    ///The velocity of retracts in mm/s
    pub retract_speed: f64,

    ///Bridging speed in mm/s
    pub bridge_speed: f64,

    ///Bridging fan speed in percent
    pub bridge_fan_speed: f64,

    pub use_relative_e_distances: bool,
    pub use_volumetric_e: bool,
    pub overhangs: bool,
    pub infill_first: bool,
    pub external_perimeters_first: bool,
    pub avoid_crossing_perimeters: bool,
}

impl SlicerSettings {
    ///Read the `; prusaslicer_config = begin` trailer. Returns the typed
    ///settings plus any advisory warnings found along the way.
    pub fn from_gcode(gcode: &str) -> Result<(Self, Vec<PostWarning>), PostError> {
        let mut raw = RawConfig::parse(gcode);

        let nozzle_diameter = raw.f64_or("nozzle_diameter", 0.4)?;
        let settings = SlicerSettings {
            nozzle_diameter,
            filament_diameter: raw.f64_or("filament_diameter", 1.75)?,
            layer_height: raw.f64_required("layer_height")?,
            extrusion_width: raw.width_required("extrusion_width", nozzle_diameter)?,
            perimeter_extrusion_width: raw
                .width_required("perimeter_extrusion_width", nozzle_diameter)?,
            solid_infill_extrusion_width: raw
                .width_required("solid_infill_extrusion_width", nozzle_diameter)?,
            infill_extrusion_width: raw
                .width_required("infill_extrusion_width", nozzle_diameter)?,
            travel_speed: raw.f64_required("travel_speed")?,
            retract_length: raw.f64_or("retract_length", 1.0)?,
            retract_speed: raw.f64_or("retract_speed", 35.0)?,
            bridge_speed: raw.f64_or("bridge_speed", 0.0)?,
            bridge_fan_speed: raw.f64_or("bridge_fan_speed", 100.0)?,
            use_relative_e_distances: raw.bool_or("use_relative_e_distances", false),
            use_volumetric_e: raw.bool_or("use_volumetric_e", false),
            overhangs: raw.bool_or("overhangs", false),
            infill_first: raw.bool_or("infill_first", false),
            external_perimeters_first: raw.bool_or("external_perimeters_first", false),
            avoid_crossing_perimeters: raw.bool_or("avoid_crossing_perimeters", false),
        };

        Ok((settings, raw.warnings))
    }

    ///Hard requirements of the substitution stage; failing any of these means
    ///the file must be left untouched.
    pub fn check_required(&self) -> Result<Vec<PostWarning>, PostError> {
        if !self.use_relative_e_distances {
            return Err(PostError::SettingIncompatible {
                reason: "relative E distances must be enabled in the slicer".to_string(),
            });
        }
        if self.extrusion_width < 0.001
            || self.perimeter_extrusion_width < 0.001
            || self.solid_infill_extrusion_width < 0.001
        {
            return Err(PostError::SettingIncompatible {
                reason: "all extrusion widths must be greater than 0.001 mm".to_string(),
            });
        }
        if !self.overhangs {
            return Err(PostError::SettingIncompatible {
                reason: "overhang detection must be enabled in the slicer".to_string(),
            });
        }

        let mut warnings = vec![];
        if self.bridge_speed > 5.0 {
            warnings.push(PostWarning::BridgeSpeedHigh {
                speed: self.bridge_speed,
            });
        }
        if self.infill_first {
            warnings.push(PostWarning::InfillFirst);
        }
        if self.external_perimeters_first {
            warnings.push(PostWarning::ExternalPerimetersFirst);
        }
        if !self.avoid_crossing_perimeters {
            warnings.push(PostWarning::AvoidCrossingPerimetersOff);
        }
        Ok(warnings)
    }
}

///Key/value view of the config trailer with typed accessors. Per-extruder
///list values collapse to their first element, reported once.
struct RawConfig {
    values: HashMap<String, String>,
    warnings: Vec<PostWarning>,
    warned_tuple: bool,
}

impl RawConfig {
    fn parse(gcode: &str) -> Self {
        let mut values = HashMap::new();
        let mut in_config = false;
        for line in gcode.lines() {
            if line.contains("prusaslicer_config = begin") {
                in_config = true;
                continue;
            }
            if line.contains("prusaslicer_config = end") {
                break;
            }
            if !in_config {
                continue;
            }
            let stripped = line.trim_start_matches(';').trim();
            if let Some((key, value)) = stripped.split_once("= ") {
                values.insert(key.trim().to_string(), value.trim().to_string());
            } else if let Some(key) = stripped.strip_suffix('=') {
                values.insert(key.trim().to_string(), String::new());
            }
        }

        RawConfig {
            values,
            warnings: vec![],
            warned_tuple: false,
        }
    }

    ///First element of a per-extruder list, or the scalar itself.
    fn scalar(&mut self, key: &str) -> Option<String> {
        let value = self.values.get(key)?.clone();
        if let Some((first, _)) = value.split_once(',') {
            if !self.warned_tuple {
                self.warnings.push(PostWarning::TupleValueUsed {
                    key: key.to_string(),
                });
                self.warned_tuple = true;
            }
            return Some(first.trim().to_string());
        }
        Some(value)
    }

    fn f64_required(&mut self, key: &str) -> Result<f64, PostError> {
        let value = self.scalar(key).ok_or_else(|| PostError::SettingMissing {
            key: key.to_string(),
        })?;
        value
            .parse::<f64>()
            .map_err(|_| PostError::SettingUnreadable {
                key: key.to_string(),
                value,
            })
    }

    fn f64_or(&mut self, key: &str, fallback: f64) -> Result<f64, PostError> {
        match self.scalar(key) {
            None => Ok(fallback),
            Some(value) => value
                .parse::<f64>()
                .map_err(|_| PostError::SettingUnreadable {
                    key: key.to_string(),
                    value,
                }),
        }
    }

    ///Extrusion widths may be given as a percentage of the nozzle diameter.
    fn width_required(&mut self, key: &str, nozzle_diameter: f64) -> Result<f64, PostError> {
        let value = self.scalar(key).ok_or_else(|| PostError::SettingMissing {
            key: key.to_string(),
        })?;
        if let Some(percent) = value.strip_suffix('%') {
            let percent = percent
                .trim()
                .parse::<f64>()
                .map_err(|_| PostError::SettingUnreadable {
                    key: key.to_string(),
                    value: value.clone(),
                })?;
            return Ok(nozzle_diameter * percent / 100.0);
        }
        value
            .parse::<f64>()
            .map_err(|_| PostError::SettingUnreadable {
                key: key.to_string(),
                value,
            })
    }

    fn bool_or(&mut self, key: &str, fallback: bool) -> bool {
        match self.scalar(key) {
            None => fallback,
            Some(value) => matches!(value.trim(), "1") || value.trim().eq_ignore_ascii_case("true"),
        }
    }
}

///Optional overrides for the tuning record, read from an hjson file next to
///the invocation. Every field falls back to the built-in default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TuningOverrides {
    pub check_for_allowed_space: Option<bool>,
    pub allowed_space_for_arcs: Option<Vec<(f64, f64)>>,
    pub arc_center_offset: Option<f64>,
    pub arc_min_print_speed: Option<f64>,
    pub arc_print_speed: Option<f64>,
    pub arc_travel_feed_rate: Option<f64>,
    pub extend_into_perimeter: Option<f64>,
    pub max_distance_from_perimeter: Option<f64>,
    pub min_area: Option<f64>,
    pub min_bridge_length: Option<f64>,
    pub path_to_output: Option<String>,
    pub r_max: Option<f64>,
    pub time_lapse_every_n_arcs: Option<usize>,
    pub above_arcs_fan_speed: Option<f64>,
    pub above_arcs_infill_print_speed: Option<f64>,
    pub above_arcs_perimeter_print_speed: Option<f64>,
    pub apply_above_fan_speed_to_whole_layer: Option<bool>,
    pub cooling_setting_detection_distance: Option<f64>,
    pub special_cooling_z_dist: Option<f64>,
    pub arc_extrusion_multiplier: Option<f64>,
    pub arc_slow_down_below_this_duration: Option<f64>,
    pub arc_width: Option<f64>,
    pub arc_fan_speed: Option<f64>,
    pub corner_importance_multiplier: Option<f64>,
    pub distance_between_points_on_start_line: Option<f64>,
    pub gcode_arc_pt_min_dist: Option<f64>,
    pub extend_arc_dist: Option<f64>,
    pub hilbert_filling_percentage: Option<f64>,
    pub hilbert_infill_extrusion_multiplier: Option<f64>,
    pub hilbert_travel_every_n_seconds: Option<f64>,
    pub min_start_arcs: Option<usize>,
    pub points_per_circle: Option<usize>,
    pub safety_break_max_arc_number: Option<usize>,
    pub warn_below_this_filling_percentage: Option<f64>,
    pub use_least_amount_of_center_points: Option<bool>,
    pub svg_output_dir: Option<String>,
    pub seed: Option<u64>,
}

impl TuningOverrides {
    pub fn from_file(path: &std::path::Path) -> Result<Self, PostError> {
        let content = std::fs::read_to_string(path)?;
        deser_hjson::from_str(&content).map_err(|e| PostError::SettingUnreadable {
            key: path.display().to_string(),
            value: e.to_string(),
        })
    }
}

///The complete, immutable parameter record of one run: slicer settings plus
///the tuning values. The tight-spot recovery is the only documented mutation
///and it stays local to one region's packing state.
#[derive(Debug, Clone)]
pub struct Settings {
    pub slicer: SlicerSettings,

    ///Restrict arc generation to `allowed_space_for_arcs`
    pub check_for_allowed_space: bool,

    ///Printable area in which arc regions are accepted
    pub allowed_space_for_arcs: Polygon<f64>,

    ///Distance a new family center is pulled back from the farthest point
    pub arc_center_offset: f64,

    ///Feed-rate clamp for very short arcs, mm/min
    pub arc_min_print_speed: f64,

    ///Regular arc feed rate, mm/min
    pub arc_print_speed: f64,

    ///Feed rate of positioning moves between arcs, mm/min
    pub arc_travel_feed_rate: f64,

    ///How far bridge strokes are widened into the surrounding perimeter
    pub extend_into_perimeter: f64,

    ///Expansion stops once every uncovered point is closer than this to the boundary
    pub max_distance_from_perimeter: f64,

    ///Minimum region area worth substituting, mm^2
    pub min_area: f64,

    ///Minimum overhang-perimeter length for a region to qualify, mm
    pub min_bridge_length: f64,

    ///Write the result here instead of overwriting the input
    pub path_to_output: Option<String>,

    ///Largest radius a family may reach, mm
    pub r_max: f64,

    ///Emit an M240 trigger around every Nth arc, 0 disables
    pub time_lapse_every_n_arcs: usize,

    ///Fan speed used above substituted zones (PWM value)
    pub above_arcs_fan_speed: f64,

    ///Feed rate of the Hilbert fill above arcs, mm/min
    pub above_arcs_infill_print_speed: f64,

    ///Feed rate override for perimeters near arcs, mm/min
    pub above_arcs_perimeter_print_speed: f64,

    ///Keep the above-arc fan speed for the rest of the layer
    pub apply_above_fan_speed_to_whole_layer: bool,

    ///Motion closer than this to a carried-forward region gets cooling overrides
    pub cooling_setting_detection_distance: f64,

    ///How far above an arc region (in z) the cooling overrides keep applying
    pub special_cooling_z_dist: f64,

    ///Extrusion multiplier of arc moves
    pub arc_extrusion_multiplier: f64,

    ///Arcs quicker than this duration are slowed down, seconds
    pub arc_slow_down_below_this_duration: f64,

    ///Radial distance between consecutive arcs of a family
    pub arc_width: f64,

    ///Fan speed while printing arcs (PWM value)
    pub arc_fan_speed: f64,

    ///Weight of the corner score against the mid-line score
    pub corner_importance_multiplier: f64,

    ///Vertex spacing when the start line is densified for retries
    pub distance_between_points_on_start_line: f64,

    ///Minimum distance between consecutive emitted arc points
    pub gcode_arc_pt_min_dist: f64,

    ///Length of the tangential move appended to each arc
    pub extend_arc_dist: f64,

    ///Density of the Hilbert fill in percent
    pub hilbert_filling_percentage: f64,

    ///Extrusion multiplier of the Hilbert fill
    pub hilbert_infill_extrusion_multiplier: f64,

    ///Target traversal time of one Hilbert sub-chain, seconds
    pub hilbert_travel_every_n_seconds: f64,

    ///Smallest acceptable seed family
    pub min_start_arcs: usize,

    ///Vertices of the polygonal circle approximation
    pub points_per_circle: usize,

    ///Hard cap on expansion steps per region
    pub safety_break_max_arc_number: usize,

    ///Report regions filled below this percentage
    pub warn_below_this_filling_percentage: f64,

    ///Keep growing a family after it touched the region boundary
    pub use_least_amount_of_center_points: bool,

    ///When set, one SVG of the packing state is written per region
    pub svg_output_dir: Option<String>,

    ///Base seed of the per-layer random sources
    pub seed: u64,
}

impl Settings {
    pub fn new(slicer: SlicerSettings, overrides: TuningOverrides) -> Self {
        let allowed = overrides
            .allowed_space_for_arcs
            .unwrap_or_else(|| vec![(0.0, 0.0), (500.0, 0.0), (500.0, 500.0), (0.0, 500.0)]);

        Settings {
            check_for_allowed_space: overrides.check_for_allowed_space.unwrap_or(false),
            allowed_space_for_arcs: Polygon::new(LineString::from(allowed), vec![]),
            arc_center_offset: overrides.arc_center_offset.unwrap_or(2.0),
            arc_min_print_speed: overrides.arc_min_print_speed.unwrap_or(0.5 * 60.0),
            arc_print_speed: overrides.arc_print_speed.unwrap_or(1.5 * 60.0),
            arc_travel_feed_rate: overrides.arc_travel_feed_rate.unwrap_or(30.0 * 60.0),
            extend_into_perimeter: overrides
                .extend_into_perimeter
                .unwrap_or(1.5 * slicer.perimeter_extrusion_width),
            max_distance_from_perimeter: overrides
                .max_distance_from_perimeter
                .unwrap_or(2.0 * slicer.perimeter_extrusion_width),
            min_area: overrides.min_area.unwrap_or(5.0 * 10.0),
            min_bridge_length: overrides.min_bridge_length.unwrap_or(5.0),
            path_to_output: overrides.path_to_output,
            r_max: overrides.r_max.unwrap_or(110.0),
            time_lapse_every_n_arcs: overrides.time_lapse_every_n_arcs.unwrap_or(0),
            above_arcs_fan_speed: overrides.above_arcs_fan_speed.unwrap_or(25.0),
            above_arcs_infill_print_speed: overrides
                .above_arcs_infill_print_speed
                .unwrap_or(10.0 * 60.0),
            above_arcs_perimeter_print_speed: overrides
                .above_arcs_perimeter_print_speed
                .unwrap_or(3.0 * 60.0),
            apply_above_fan_speed_to_whole_layer: overrides
                .apply_above_fan_speed_to_whole_layer
                .unwrap_or(true),
            cooling_setting_detection_distance: overrides
                .cooling_setting_detection_distance
                .unwrap_or(5.0),
            special_cooling_z_dist: overrides.special_cooling_z_dist.unwrap_or(3.0),
            arc_extrusion_multiplier: overrides.arc_extrusion_multiplier.unwrap_or(1.35),
            arc_slow_down_below_this_duration: overrides
                .arc_slow_down_below_this_duration
                .unwrap_or(3.0),
            arc_width: overrides
                .arc_width
                .unwrap_or(slicer.nozzle_diameter * 0.95),
            arc_fan_speed: overrides.arc_fan_speed.unwrap_or(255.0),
            corner_importance_multiplier: overrides
                .corner_importance_multiplier
                .unwrap_or(0.2),
            distance_between_points_on_start_line: overrides
                .distance_between_points_on_start_line
                .unwrap_or(0.1),
            gcode_arc_pt_min_dist: overrides.gcode_arc_pt_min_dist.unwrap_or(0.1),
            extend_arc_dist: overrides.extend_arc_dist.unwrap_or(1.0),
            hilbert_filling_percentage: overrides.hilbert_filling_percentage.unwrap_or(100.0),
            hilbert_infill_extrusion_multiplier: overrides
                .hilbert_infill_extrusion_multiplier
                .unwrap_or(1.05),
            hilbert_travel_every_n_seconds: overrides
                .hilbert_travel_every_n_seconds
                .unwrap_or(6.0),
            min_start_arcs: overrides.min_start_arcs.unwrap_or(2),
            points_per_circle: overrides.points_per_circle.unwrap_or(80),
            safety_break_max_arc_number: overrides.safety_break_max_arc_number.unwrap_or(2000),
            warn_below_this_filling_percentage: overrides
                .warn_below_this_filling_percentage
                .unwrap_or(90.0),
            use_least_amount_of_center_points: overrides
                .use_least_amount_of_center_points
                .unwrap_or(true),
            svg_output_dir: overrides.svg_output_dir,
            seed: overrides.seed.unwrap_or(0),
            slicer,
        }
    }
}
