use geo::{EuclideanDistance, EuclideanLength, Line, LineString, Point};

use crate::layer::Layer;
use crate::plotter::arcs::RegionPacking;
use crate::plotter::move_toward_point;
use crate::settings::Settings;

use super::{feed_rate_line, parse_motion, point_line, retract_line};

///Millimeters of filament per millimeter of travel. Arcs extrude a round
///bead scaled by their multiplier; the Hilbert fill uses the flattened-track
///model with the multiplier on the round cap term.
pub fn e_steps_per_mm(settings: &Settings, layer_height: Option<f64>) -> f64 {
    let e_volume = match layer_height {
        Some(h) => {
            let w = settings.slicer.infill_extrusion_width;
            (w - h) * h
                + std::f64::consts::PI
                    * (h / 2.0).powi(2)
                    * settings.hilbert_infill_extrusion_multiplier
        }
        None => {
            (settings.slicer.nozzle_diameter / 2.0).powi(2)
                * std::f64::consts::PI
                * settings.arc_extrusion_multiplier
        }
    };
    if settings.slicer.use_volumetric_e {
        e_volume
    } else {
        let filament_area =
            (settings.slicer.filament_diameter / 2.0).powi(2) * std::f64::consts::PI;
        e_volume / filament_area
    }
}

///Commands for one arc rim: position, unretract, print the rim at a feed
///rate clamped against too-short arcs, extend past the end along the last
///tangent, retract.
pub fn arc_to_gcode(
    rim: &LineString<f64>,
    e_steps_per_mm: f64,
    index: usize,
    settings: &Settings,
) -> Vec<String> {
    let pts: Vec<Point<f64>> = rim.points().collect();
    if pts.len() < 2 {
        return vec![];
    }

    let length = rim.euclidean_length();
    let extended = move_toward_point(
        &pts[pts.len() - 2],
        &pts[pts.len() - 1],
        settings.extend_arc_dist,
    );
    let print_speed = (length / settings.arc_slow_down_below_this_duration * 60.0)
        .clamp(settings.arc_min_print_speed, settings.arc_print_speed);

    let mut lines = vec![
        format!(";Arc {} Length:{:.5}\n", index, length),
        point_line(&pts[0], 0.0, Some(settings.arc_travel_feed_rate)),
        retract_line(false, settings),
        feed_rate_line(print_speed),
    ];

    let mut previous = pts[0];
    for p in pts.iter().skip(1) {
        let distance = p.euclidean_distance(&previous);
        if distance > settings.gcode_arc_pt_min_dist {
            lines.push(point_line(p, distance * e_steps_per_mm, None));
            previous = *p;
        }
    }
    lines.push(point_line(
        &extended,
        settings.extend_arc_dist * e_steps_per_mm,
        None,
    ));
    lines.push(retract_line(true, settings));
    lines
}

///The whole replacement block of one region: the bridging fan speed, then
///every arc rim in emission order, with the time-lapse trigger interleaved.
pub fn region_to_gcode(packing: &RegionPacking, settings: &Settings) -> Vec<String> {
    let mut block = vec![format!(
        "M106 S{:.0}\n",
        (settings.slicer.bridge_fan_speed * 2.55).round()
    )];
    let e_steps = e_steps_per_mm(settings, None);
    for (index, rim) in packing.emit_lines.iter().enumerate() {
        let arc = arc_to_gcode(rim, e_steps, index, settings);
        if arc.is_empty() {
            continue;
        }
        block.extend(arc);
        if settings.time_lapse_every_n_arcs > 0 && index % settings.time_lapse_every_n_arcs != 0 {
            block.push("M240\n".to_string());
        }
    }
    block
}

///Hilbert sub-chains as motion commands. Each chain starts with a travel
///move; filament is unretracted once at the very beginning and retracted
///once at the very end, travel in between stays primed.
pub fn hilbert_to_gcode(
    chains: &[Vec<Point<f64>>],
    settings: &Settings,
    layer_height: f64,
) -> Vec<String> {
    if chains.iter().all(|chain| chain.is_empty()) {
        return vec![];
    }
    let e_steps = e_steps_per_mm(settings, Some(layer_height));

    let mut lines = vec![];
    for (chain_index, chain) in chains.iter().enumerate() {
        let mut previous: Option<Point<f64>> = None;
        for (point_index, point) in chain.iter().enumerate() {
            match point_index {
                0 => {
                    lines.push(point_line(point, 0.0, Some(settings.arc_travel_feed_rate)));
                    if chain_index == 0 {
                        lines.push(retract_line(false, settings));
                    }
                }
                1 => {
                    let distance =
                        point.euclidean_distance(previous.as_ref().expect("point follows"));
                    lines.push(point_line(
                        point,
                        distance * e_steps,
                        Some(settings.above_arcs_infill_print_speed),
                    ));
                }
                _ => {
                    let distance =
                        point.euclidean_distance(previous.as_ref().expect("point follows"));
                    lines.push(point_line(point, distance * e_steps, None));
                }
            }
            previous = Some(*point);
        }
    }
    lines.push(retract_line(true, settings));
    lines
}

fn line_exported(delete_ranges: &[(usize, usize)], index: usize) -> bool {
    delete_ranges
        .iter()
        .all(|(start, end)| index < *start || index > *end)
}

///Does this motion pass close enough to a carried-forward arc region that it
///needs the cooling overrides?
fn is_close_to_carried(
    layer: &Layer,
    line: &str,
    last_point: &mut Option<Point<f64>>,
    settings: &Settings,
) -> bool {
    if layer.carried_regions.is_empty() {
        return false;
    }
    let Some(point) = parse_motion(line).and_then(|m| m.point()) else {
        return false;
    };
    let previous = last_point.unwrap_or_else(|| Point::new(point.x() - 0.01, point.y() - 0.01));
    *last_point = Some(point);
    let segment = Line::new(previous.0, point.0);
    layer.carried_regions.iter().any(|poly| {
        segment.euclidean_distance(poly) < settings.cooling_setting_detection_distance
    })
}

///Rebuild one modified layer: inject the substitution blocks at the first
///`;TYPE:` marker, suppress the replaced feature blocks, and apply the
///cooling overrides near carried-forward regions. The head position before
///an injection is cached while walking so it can be reinstated afterwards.
pub fn splice_layer(
    layer: &Layer,
    arc_gcode: &[String],
    hilbert_gcode: &[String],
    delete_ranges: &[(usize, usize)],
    settings: &Settings,
) -> Vec<String> {
    let mut out: Vec<String> = vec![];
    let mut arcs_injected = arc_gcode.is_empty();
    let mut hilbert_injected = hilbert_gcode.is_empty();
    let mut current_speed_line = String::from("G1 F600\n");
    let mut messed_with_speed = false;
    let mut messed_with_fan = false;
    let mut cached_position: Option<String> = None;
    let mut last_point: Option<Point<f64>> = None;

    for (index, line) in layer.lines.iter().enumerate() {
        if line.contains(";TYPE") && !arcs_injected {
            out.push(";TYPE:Arc infill\n".to_string());
            out.push(format!("M106 S{}\n", settings.arc_fan_speed));
            out.extend(arc_gcode.iter().cloned());
            arcs_injected = true;
            if let Some(position) = &cached_position {
                out.push(position.clone());
            }
        }
        if line.contains(";TYPE") && !hilbert_injected {
            out.push(";TYPE:Solid infill\n".to_string());
            out.push(format!("M106 S{}\n", settings.above_arcs_fan_speed));
            out.extend(hilbert_gcode.iter().cloned());
            hilbert_injected = true;
            if let Some(position) = &cached_position {
                out.push(position.clone());
            }
        }

        if line.split(';').next().unwrap_or("").contains("G1 F") {
            current_speed_line = line.clone();
        }

        if line_exported(delete_ranges, index) {
            if is_close_to_carried(layer, line, &mut last_point, settings) {
                if !messed_with_fan {
                    out.push(format!("M106 S{}\n", settings.above_arcs_fan_speed));
                    messed_with_fan = true;
                }
                out.push(format!(
                    "{} F{}\n",
                    line.trim_end(),
                    settings.above_arcs_perimeter_print_speed
                ));
                messed_with_speed = true;
            } else {
                if messed_with_fan && !settings.apply_above_fan_speed_to_whole_layer {
                    out.push(format!("M106 S{:.0}\n", layer.fan_setting));
                    messed_with_fan = false;
                }
                if messed_with_speed {
                    out.push(current_speed_line.clone());
                    messed_with_speed = false;
                }
                out.push(line.clone());
            }
        }

        if parse_motion(line).map(|m| m.x.is_some()).unwrap_or(false) {
            cached_position = Some(line.clone());
        }
    }

    if messed_with_fan {
        out.push(format!("M106 S{:.0}\n", layer.fan_setting));
    }
    out
}
