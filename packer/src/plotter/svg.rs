use std::path::Path;

use geo_svg::{Color, ToSvg};

use super::arcs::RegionPacking;
use geo::Polygon;

///Write one SVG per packed region: the region outline, every arc rim and the
///space the packing could not reach. Purely diagnostic; enabled through
///`svg_output_dir`.
pub fn dump_packing(
    dir: &str,
    layer: usize,
    region_index: usize,
    region: &Polygon<f64>,
    packing: &RegionPacking,
) -> std::io::Result<()> {
    let mut svg = region
        .to_svg()
        .with_stroke_color(Color::Named("black"))
        .with_stroke_width(0.2)
        .with_fill_opacity(0.0);

    for line in &packing.emit_lines {
        svg = svg.and(
            line.to_svg()
                .with_stroke_color(Color::Named("blue"))
                .with_stroke_width(0.1),
        );
    }
    svg = svg.and(
        packing
            .remaining
            .to_svg()
            .with_fill_color(Color::Named("red"))
            .with_fill_opacity(0.6),
    );

    let path = Path::new(dir).join(format!("layer{layer}_region{region_index}.svg"));
    std::fs::create_dir_all(dir)?;
    std::fs::write(path, svg.to_string())
}
