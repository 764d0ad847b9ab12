//! Post-processing engine that replaces bridge infill in sliced g-code with
//! concentric arc families anchored on the previous layer, substitutes the
//! solid infill directly above with a Hilbert curve fill, and injects the
//! cooling directives both need. The binary crate drives [`process`] with
//! settings extracted from the file itself.

mod error;
mod settings;
mod warning;

pub mod gcode;
pub mod layer;
pub mod plotter;

pub use error::PostError;
pub use settings::{Settings, SlicerSettings, TuningOverrides};
pub use warning::PostWarning;

use geo::Polygon;
use rand::{rngs::StdRng, SeedableRng};

use gcode::emit;
use layer::Layer;
use plotter::arcs;

///Run the whole substitution over one file. Returns the rewritten stream,
///or `None` when no overhang qualified and the input must stay untouched.
pub fn process(gcode: &str, settings: &Settings) -> Result<Option<String>, PostError> {
    let mut blocks = layer::split_into_layers(gcode);
    let startup = blocks.remove(0);
    log::info!("layers: {}", blocks.len());

    let mut layers: Vec<Layer> = blocks
        .into_iter()
        .enumerate()
        .map(|(index, lines)| Layer::new(lines, index))
        .collect();

    let mut last_fan_setting = 0.0;
    for layer in layers.iter_mut() {
        layer.detect_z();
        layer.detect_height(settings);
        last_fan_setting = layer.detect_fan(last_fan_setting);
    }

    let mut modified = false;
    // the first printed layer can never bridge onto anything
    for idl in 1..layers.len() {
        layers[idl].extract_features();
        let regions = layers[idl].bridge_regions(settings);
        let valid_regions = layers[idl].validate_regions(&regions, settings);

        let mut rng = StdRng::seed_from_u64(settings.seed.wrapping_add(idl as u64));

        let mut arc_gcode: Vec<String> = vec![];
        let mut packed_regions: Vec<Polygon<f64>> = vec![];
        if !valid_regions.is_empty() {
            log::info!(
                "overhang found layer {}: {} regions, Z: {:.2}",
                idl,
                valid_regions.len(),
                layers[idl].z.unwrap_or(0.0)
            );

            layers[idl - 1].extract_features();
            let prev_perimeters = layers[idl - 1].external_perimeter_polys();

            for region in &valid_regions {
                let packed = plotter::derive_start_line(region, &prev_perimeters, idl).and_then(
                    |(start_line, boundary_line)| {
                        arcs::pack_region(
                            region,
                            &start_line,
                            &boundary_line,
                            settings,
                            idl,
                            &mut rng,
                        )
                    },
                );
                match packed {
                    Ok(packing) => {
                        if let Some(dir) = &settings.svg_output_dir {
                            if let Err(err) = plotter::svg::dump_packing(
                                dir,
                                idl,
                                packed_regions.len(),
                                region,
                                &packing,
                            ) {
                                log::warn!("could not write packing svg: {err}");
                            }
                        }
                        arc_gcode.extend(emit::region_to_gcode(&packing, settings));
                        packed_regions.push(region.clone());
                    }
                    Err(err) if err.is_region_failure() => {
                        log::warn!("skipping overhang region: {err}");
                    }
                    Err(err) => return Err(err),
                }
            }

            // regions that actually got arcs steer cooling and the Hilbert
            // substitution on the layers above them
            if !packed_regions.is_empty() {
                let max_z = layers[idl].z.unwrap_or(0.0) + settings.special_cooling_z_dist;
                let mut current_z = layers[idl].z.unwrap_or(0.0);
                let mut offset = 1;
                while current_z <= max_z && idl + offset < layers.len() {
                    current_z = layers[idl + offset].z.unwrap_or(current_z);
                    layers[idl + offset]
                        .carried_regions
                        .extend(packed_regions.iter().cloned());
                    offset += 1;
                }
            }
        }

        let mut hilbert_gcode: Vec<String> = vec![];
        if !layers[idl].carried_regions.is_empty() {
            let solid_regions = layers[idl].solid_regions_above_arcs(settings);
            let mut chains = vec![];
            for region in &solid_regions {
                chains.extend(plotter::hilbert::hilbert_chains_in_polygon(
                    region, idl, settings, &mut rng,
                ));
            }
            hilbert_gcode = emit::hilbert_to_gcode(&chains, settings, layers[idl].height);
        }

        if !packed_regions.is_empty() || !layers[idl].carried_regions.is_empty() {
            log::info!("modifying layer {idl}");
            let mut delete_ranges = layers[idl].deletion_ranges("Bridge", &packed_regions);
            if !layers[idl].carried_regions.is_empty() {
                let carried = layers[idl].carried_regions.clone();
                delete_ranges.extend(layers[idl].deletion_ranges(":Solid", &carried));
            }

            let spliced = emit::splice_layer(
                &layers[idl],
                &arc_gcode,
                &hilbert_gcode,
                &delete_ranges,
                settings,
            );
            layers[idl].lines = spliced;
            // the next layer reads its support perimeters from the new lines
            layers[idl].extract_features();
            modified = true;
        }
    }

    if !modified {
        log::info!(
            "analysed {} layers, but no matching overhangs found, nothing to modify; \
             check MinArea and MinBridgeLength if this is unexpected",
            layers.len()
        );
        return Ok(None);
    }

    let mut output = String::with_capacity(gcode.len());
    for line in &startup {
        output.push_str(line);
    }
    for layer in &layers {
        for line in &layer.lines {
            output.push_str(line);
        }
    }
    Ok(Some(output))
}
