use geo::{
    Area, Contains, EuclideanDistance, EuclideanLength, LineString, MultiPolygon, Point, Polygon,
};

use crate::gcode::{parse_fan_speed, parse_height, parse_motion};
use crate::plotter::polygon_operations::{buffer_polyline, PolygonOperations};
use crate::settings::Settings;
use crate::warning::{self, PostWarning};

///One `;TYPE:` block inside a layer. `start` is the marker line itself,
///`end` is exclusive.
#[derive(Debug, Clone)]
struct Feature {
    name: String,
    start: usize,
    end: usize,
}

///One `;LAYER_CHANGE` block of the input stream, with everything the
///substitution stage needs to know about it. Lines keep their original
///endings so an unmodified file reassembles byte for byte.
#[derive(Debug)]
pub struct Layer {
    pub lines: Vec<String>,
    pub index: usize,

    ///Z of the first vertical move in the layer
    pub z: Option<f64>,

    ///Extrusion height from the `;HEIGHT:` marker, layer_height otherwise
    pub height: f64,

    ///Fan speed entering this layer (an `M106` here, or carried forward)
    pub fan_setting: f64,

    ///Arc regions of layers below whose cooling rules still reach this one
    pub carried_regions: Vec<Polygon<f64>>,

    features: Vec<Feature>,
}

///Cut the stream at every `;LAYER_CHANGE`. The first block is the startup
///preamble and stays untouched.
pub fn split_into_layers(gcode: &str) -> Vec<Vec<String>> {
    let mut blocks: Vec<Vec<String>> = vec![vec![]];
    for line in gcode.split_inclusive('\n') {
        if line.contains(";LAYER_CHANGE") {
            blocks.push(vec![line.to_string()]);
        } else {
            blocks
                .last_mut()
                .expect("blocks start non-empty")
                .push(line.to_string());
        }
    }
    blocks
}

///Union overlapping regions into disjoint polygons.
pub fn merge_regions(polys: &[Polygon<f64>]) -> Vec<Polygon<f64>> {
    let mut merged = MultiPolygon(vec![]);
    for poly in polys {
        merged = merged.union_with(&MultiPolygon(vec![poly.clone()]));
    }
    merged.0
}

impl Layer {
    pub fn new(lines: Vec<String>, index: usize) -> Self {
        Layer {
            lines,
            index,
            z: None,
            height: 0.0,
            fan_setting: 0.0,
            carried_regions: vec![],
            features: vec![],
        }
    }

    ///Z from the first motion line that carries one.
    pub fn detect_z(&mut self) {
        self.z = self
            .lines
            .iter()
            .filter_map(|line| parse_motion(line).and_then(|m| m.z))
            .next();
    }

    pub fn detect_height(&mut self, settings: &Settings) {
        match self.lines.iter().find_map(|line| parse_height(line)) {
            Some(height) => self.height = height,
            None => {
                warning::emit(&PostWarning::NoHeightMarker { layer: self.index });
                self.height = settings.slicer.layer_height;
            }
        }
    }

    ///Fan speed at this layer; layers without an `M106` inherit the last one.
    pub fn detect_fan(&mut self, last_fan_setting: f64) -> f64 {
        self.fan_setting = self
            .lines
            .iter()
            .find_map(|line| parse_fan_speed(line))
            .unwrap_or(last_fan_setting);
        self.fan_setting
    }

    ///Group the layer's lines into feature blocks at `;TYPE:` markers.
    pub fn extract_features(&mut self) {
        let mut starts: Vec<(usize, String)> = vec![];
        for (idx, line) in self.lines.iter().enumerate() {
            if line.contains(";TYPE:") {
                starts.push((idx, line.trim_end().to_string()));
            }
        }
        self.features = starts
            .iter()
            .enumerate()
            .map(|(i, (start, name))| Feature {
                name: name.clone(),
                start: *start,
                end: starts
                    .get(i + 1)
                    .map(|(next, _)| *next)
                    .unwrap_or(self.lines.len()),
            })
            .collect();
    }

    fn feature_lines(&self, feature: &Feature) -> &[String] {
        &self.lines[feature.start..feature.end]
    }

    ///Where the head actually sits when a feature starts: the last motion of
    ///the immediately preceding feature block. A previous block without any
    ///motion line yields nothing.
    fn real_feature_start_point(&self, feature_index: usize) -> Option<Point<f64>> {
        if feature_index == 0 {
            return None;
        }
        let previous = self.features.get(feature_index - 1)?;
        self.feature_lines(previous)
            .iter()
            .rev()
            .find_map(|line| parse_motion(line).and_then(|m| m.point()))
    }

    ///Extrusion polylines of all features matching `name`. Wipe moves are
    ///ignored; travel moves split a stroke when requested.
    pub fn feature_strokes(
        &self,
        name: &str,
        split_at_travel: bool,
        include_start_point: bool,
        settings: &Settings,
    ) -> Vec<Vec<Point<f64>>> {
        let mut parts: Vec<Vec<Point<f64>>> = vec![];
        for (idf, feature) in self.features.iter().enumerate() {
            if !feature.name.contains(name) {
                continue;
            }
            let mut pts: Vec<Point<f64>> = vec![];
            if include_start_point && idf > 0 {
                if let Some(p) = self.real_feature_start_point(idf) {
                    pts.push(p);
                }
            }
            let mut in_wipe = false;
            for line in self.feature_lines(feature) {
                if !in_wipe {
                    if let Some(motion) = parse_motion(line) {
                        if split_at_travel
                            && motion.is_travel(settings.slicer.travel_speed)
                        {
                            if pts.len() >= 2 {
                                parts.push(std::mem::take(&mut pts));
                            }
                        } else if motion.e.is_some() {
                            if let Some(p) = motion.point() {
                                pts.push(p);
                            }
                        }
                    }
                }
                if line.contains("WIPE_START") {
                    in_wipe = true;
                }
                if line.contains("WIPE_END") {
                    in_wipe = false;
                }
            }
            if pts.len() > 1 {
                parts.push(pts);
            }
        }
        parts
    }

    ///Bridge-infill strokes widened into the surrounding perimeter; these are
    ///the overhang regions the packer works on.
    pub fn bridge_regions(&self, settings: &Settings) -> Vec<Polygon<f64>> {
        let polys: Vec<Polygon<f64>> = self
            .feature_strokes("Bridge infill", true, false, settings)
            .into_iter()
            .flat_map(|pts| {
                let stroke = LineString::from(pts);
                buffer_polyline(&stroke, settings.extend_into_perimeter)
            })
            .collect();
        merge_regions(&polys)
    }

    ///Solid-infill regions that sit above previously packed arcs; these get
    ///the Hilbert treatment.
    pub fn solid_regions_above_arcs(&self, settings: &Settings) -> Vec<Polygon<f64>> {
        let polys: Vec<Polygon<f64>> = self
            .feature_strokes("Solid infill", true, false, settings)
            .into_iter()
            .filter(|pts| {
                pts.iter()
                    .any(|p| self.carried_regions.iter().any(|poly| poly.contains(p)))
            })
            .flat_map(|pts| {
                let stroke = LineString::from(pts);
                buffer_polyline(&stroke, settings.extend_into_perimeter)
            })
            .collect();
        merge_regions(&polys)
    }

    ///External-perimeter outlines of this layer, following overhang-perimeter
    ///continuations the way the slicer interleaves them.
    pub fn external_perimeter_polys(&self) -> Vec<Polygon<f64>> {
        let mut polys = vec![];
        let mut started = false;
        let mut start_point: Option<Point<f64>> = None;
        let mut collected: Vec<&str> = vec![];

        for (idf, feature) in self.features.iter().enumerate() {
            let matches = feature.name.contains("External")
                || (feature.name.contains("Overhang") && started);
            if matches {
                if !started {
                    start_point = if idf > 1 {
                        self.real_feature_start_point(idf)
                    } else {
                        None
                    };
                    started = true;
                }
                collected.extend(self.feature_lines(feature).iter().map(|l| l.as_str()));
            }

            let at_end = idf == self.features.len() - 1;
            if started && (at_end || !matches) {
                if let Some(poly) = polygon_from_lines(start_point, &collected) {
                    polys.push(poly);
                }
                started = false;
                start_point = None;
                collected.clear();
            }
        }
        polys
    }

    ///Overhang-perimeter polylines, used to qualify bridge regions.
    pub fn overhang_perimeters(&self, settings: &Settings) -> Vec<LineString<f64>> {
        self.feature_strokes("Overhang perimeter", false, true, settings)
            .into_iter()
            .map(LineString::from)
            .collect()
    }

    ///Keep only regions worth substituting: big enough, near a sufficiently
    ///long overhang perimeter, and inside the allowed space when enforced.
    pub fn validate_regions(
        &self,
        regions: &[Polygon<f64>],
        settings: &Settings,
    ) -> Vec<Polygon<f64>> {
        const MIN_DIST_FOR_VALIDATION: f64 = 0.5;

        let overhangs = self.overhang_perimeters(settings);
        if overhangs.is_empty() {
            return vec![];
        }
        regions
            .iter()
            .filter(|poly| {
                if poly.unsigned_area() <= 0.0 {
                    return false;
                }
                if settings.check_for_allowed_space
                    && !settings.allowed_space_for_arcs.contains(*poly)
                {
                    return false;
                }
                if poly.unsigned_area() < settings.min_area {
                    return false;
                }
                overhangs.iter().any(|perimeter| {
                    perimeter.euclidean_distance(*poly) < MIN_DIST_FOR_VALIDATION
                        && perimeter.euclidean_length() > settings.min_bridge_length
                })
            })
            .cloned()
            .collect()
    }

    ///Inclusive line ranges of the feature blocks whose extrusion runs
    ///through one of the given regions. These lines get replaced.
    pub fn deletion_ranges(&self, name: &str, polys: &[Polygon<f64>]) -> Vec<(usize, usize)> {
        let mut ranges = vec![];
        for feature in &self.features {
            if !feature.name.contains(name) {
                continue;
            }
            let hit = self.feature_lines(feature).iter().any(|line| {
                parse_motion(line)
                    .and_then(|m| m.point())
                    .map(|p| polys.iter().any(|poly| poly.contains(&p)))
                    .unwrap_or(false)
            });
            if hit {
                ranges.push((feature.start, feature.end - 1));
            }
        }
        ranges
    }
}

///Closed outline from the motion lines of a perimeter block. Stops at the
///first wipe, like the head does.
fn polygon_from_lines(start_point: Option<Point<f64>>, lines: &[&str]) -> Option<Polygon<f64>> {
    let mut pts: Vec<Point<f64>> = start_point.into_iter().collect();
    for line in lines {
        if line.contains(";WIPE") {
            break;
        }
        if let Some(p) = parse_motion(line).and_then(|m| m.point()) {
            pts.push(p);
        }
    }
    if pts.len() > 2 {
        Some(Polygon::new(LineString::from(pts), vec![]))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_settings;
    use geo::Coord;

    fn lines(text: &str) -> Vec<String> {
        text.split_inclusive('\n').map(|l| l.to_string()).collect()
    }

    #[test]
    fn splits_at_layer_changes() {
        let gcode = "G28\nG1 Z0.2\n;LAYER_CHANGE\nG1 X1 Y1 E1\n;LAYER_CHANGE\nG1 X2 Y2 E1\n";
        let blocks = split_into_layers(gcode);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0], lines("G28\nG1 Z0.2\n"));
        assert_eq!(blocks[1][0], ";LAYER_CHANGE\n");
        assert_eq!(blocks[2][1], "G1 X2 Y2 E1\n");
    }

    #[test]
    fn annotates_z_height_and_fan() {
        let mut layer = Layer::new(
            lines(";LAYER_CHANGE\nG1 Z0.6 F9000\n;HEIGHT:0.25\nM106 S128\nG1 X1 Y1 E0.1\n"),
            2,
        );
        layer.detect_z();
        layer.detect_height(&test_settings());
        let fan = layer.detect_fan(40.0);
        assert_eq!(layer.z, Some(0.6));
        assert_eq!(layer.height, 0.25);
        assert_eq!(fan, 128.0);

        let mut silent = Layer::new(lines(";LAYER_CHANGE\nG1 X1 Y1 E0.1\n"), 3);
        silent.detect_z();
        silent.detect_height(&test_settings());
        assert_eq!(silent.z, None);
        assert_eq!(silent.height, 0.2);
        assert_eq!(silent.detect_fan(40.0), 40.0);
    }

    #[test]
    fn strokes_split_at_travel_and_skip_wipes() {
        let settings = test_settings();
        let mut layer = Layer::new(
            lines(
                ";TYPE:Bridge infill\n\
                 G1 X0 Y0 E0.1\nG1 X5 Y0 E0.5\n\
                 G1 X20 Y20 F7800\n\
                 G1 X20 Y21 E0.1\nG1 X20 Y25 E0.4\n\
                 ;WIPE_START\nG1 X0 Y0 E-0.5\n;WIPE_END\n",
            ),
            1,
        );
        layer.extract_features();
        let strokes = layer.feature_strokes("Bridge infill", true, false, &settings);
        assert_eq!(strokes.len(), 2);
        assert_eq!(strokes[0].len(), 2);
        assert_eq!(strokes[1], vec![Point::new(20.0, 21.0), Point::new(20.0, 25.0)]);
    }

    #[test]
    fn bridge_regions_cover_the_stroke() {
        let settings = test_settings();
        let mut layer = Layer::new(
            lines(";TYPE:Bridge infill\nG1 X0 Y0 E0.1\nG1 X10 Y0 E1.0\n"),
            1,
        );
        layer.extract_features();
        let regions = layer.bridge_regions(&settings);
        assert_eq!(regions.len(), 1);
        assert!(regions[0].contains(&Point::new(5.0, 0.0)));
        assert!(regions[0].contains(&Point::new(5.0, settings.extend_into_perimeter * 0.9)));
        assert!(!regions[0].contains(&Point::new(5.0, settings.extend_into_perimeter * 2.0)));
    }

    #[test]
    fn external_perimeter_polys_follow_overhang_blocks() {
        let mut layer = Layer::new(
            lines(
                ";TYPE:Skirt\nG1 X-1 Y-1 E0.2\n\
                 ;TYPE:Perimeter\nG1 X0 Y0 E0.3\n\
                 ;TYPE:External perimeter\n\
                 G1 X10 Y0 E0.5\nG1 X10 Y10 E0.5\n\
                 ;TYPE:Overhang perimeter\n\
                 G1 X0 Y10 E0.5\nG1 X0 Y0 E0.5\n\
                 ;TYPE:Solid infill\nG1 X5 Y5 E0.1\n",
            ),
            1,
        );
        layer.extract_features();
        let polys = layer.external_perimeter_polys();
        assert_eq!(polys.len(), 1);
        // the outline opens at the inner perimeter's last position (0, 0)
        assert_eq!(polys[0].exterior().0[0], Coord { x: 0.0, y: 0.0 });
        assert!(polys[0].contains(&Point::new(5.0, 5.0)));
        assert!((polys[0].unsigned_area() - 100.0).abs() < 1.0);
    }

    #[test]
    fn perimeter_opening_the_layer_gets_no_recovered_start() {
        // the external perimeter is the first feature; the travel move in the
        // layer preamble must not leak into the outline
        let mut layer = Layer::new(
            lines(
                "G1 X50 Y50 F7800\n\
                 ;TYPE:External perimeter\n\
                 G1 X10 Y0 E0.5\nG1 X10 Y10 E0.5\nG1 X0 Y10 E0.5\nG1 X0 Y0 E0.5\n",
            ),
            1,
        );
        layer.extract_features();
        let polys = layer.external_perimeter_polys();
        assert_eq!(polys.len(), 1);
        assert!(!polys[0]
            .exterior()
            .coords()
            .any(|c| *c == Coord { x: 50.0, y: 50.0 }));
    }

    #[test]
    fn start_point_recovery_is_bounded_to_the_previous_block() {
        let settings = test_settings();
        // the block right before the overhang has no motion line, so nothing
        // is recovered, and the preamble move must not be reached instead
        let mut layer = Layer::new(
            lines(
                "G1 X9 Y9 E0.1\n\
                 ;TYPE:Custom\nM107\n\
                 ;TYPE:Overhang perimeter\nG1 X0 Y0 E0.1\nG1 X6 Y0 E0.5\n",
            ),
            1,
        );
        layer.extract_features();
        let strokes = layer.feature_strokes("Overhang perimeter", false, true, &settings);
        assert_eq!(strokes.len(), 1);
        assert_eq!(strokes[0], vec![Point::new(0.0, 0.0), Point::new(6.0, 0.0)]);
    }

    #[test]
    fn validator_applies_area_and_overhang_rules() {
        let settings = test_settings();
        let mut layer = Layer::new(
            lines(
                ";TYPE:Overhang perimeter\n\
                 G1 X0 Y0 E0.1\nG1 X10 Y0 E0.5\nG1 X10 Y1 E0.1\n",
            ),
            1,
        );
        layer.extract_features();

        let big = Polygon::new(
            LineString::from(vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)]),
            vec![],
        );
        let small = Polygon::new(
            LineString::from(vec![(0.0, 0.0), (3.0, 0.0), (3.0, 2.0), (0.0, 2.0)]),
            vec![],
        );
        let far = Polygon::new(
            LineString::from(vec![
                (100.0, 100.0),
                (110.0, 100.0),
                (110.0, 110.0),
                (100.0, 110.0),
            ]),
            vec![],
        );

        let valid = layer.validate_regions(&[big.clone(), small, far], &settings);
        assert_eq!(valid.len(), 1);
        assert!((valid[0].unsigned_area() - big.unsigned_area()).abs() < 1e-9);
    }

    #[test]
    fn deletion_ranges_only_cover_matching_features() {
        let mut layer = Layer::new(
            lines(
                ";TYPE:External perimeter\nG1 X5 Y5 E0.5\n\
                 ;TYPE:Bridge infill\nG1 X5 Y5 E0.5\nG1 X6 Y5 E0.5\n\
                 ;TYPE:Bridge infill\nG1 X50 Y50 E0.5\n",
            ),
            1,
        );
        layer.extract_features();
        let region = Polygon::new(
            LineString::from(vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)]),
            vec![],
        );
        let ranges = layer.deletion_ranges("Bridge", &[region]);
        assert_eq!(ranges, vec![(2, 4)]);
    }
}
