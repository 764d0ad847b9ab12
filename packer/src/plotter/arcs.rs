use geo::{
    Area, Coord, EuclideanDistance, Intersects, LineString, MultiLineString, MultiPolygon, Point,
    Polygon,
};
use rand::rngs::StdRng;

use crate::error::PostError;
use crate::settings::Settings;
use crate::warning::{self, PostWarning};

use super::polygon_operations::PolygonOperations;
use super::{
    boundary_lines, farthest_point, move_toward_point, random_point_on_line,
    redistribute_vertices, start_point_on_line, GEOMETRY_EPSILON,
};

///One pass of a concentric family. The swept region is the circle clipped to
///the empty space at generation time, so it is rarely a full disk; the
///boundary lines are the parts of its rim that lie on the circle, which is
///where the nozzle actually travels.
#[derive(Debug, Clone)]
pub struct Arc {
    pub center: Point<f64>,
    pub radius: f64,
    pub poly: MultiPolygon<f64>,
}

///Polygonal circle approximation, clockwise from the top like the rest of
///the toolchain draws them.
pub fn circle_polygon(center: Point<f64>, radius: f64, points: usize) -> Polygon<f64> {
    let coords: Vec<Coord<f64>> = (0..points)
        .map(|i| {
            let theta = 2.0 * std::f64::consts::PI * i as f64 / points as f64;
            Coord {
                x: center.x() + radius * theta.sin(),
                y: center.y() + radius * theta.cos(),
            }
        })
        .collect();
    Polygon::new(LineString::new(coords), vec![])
}

impl Arc {
    fn generate(
        center: Point<f64>,
        radius: f64,
        remaining: &MultiPolygon<f64>,
        points_per_circle: usize,
    ) -> Self {
        let circle = circle_polygon(center, radius, points_per_circle);
        Arc {
            center,
            radius,
            poly: circle.intersection_with(remaining),
        }
    }

    ///The rim pieces of the swept region that lie on the circle itself.
    ///Contiguous pieces merge into one polyline; disjoint pieces come back
    ///as separate lines and are emitted as separate passes.
    pub fn boundary_lines(&self, points_per_circle: usize) -> Vec<LineString<f64>> {
        let ring: LineString<f64> = circle_polygon(self.center, self.radius, points_per_circle)
            .exterior()
            .clone();

        let mut lines = vec![];
        for component in &self.poly {
            for rim in std::iter::once(component.exterior())
                .chain(component.interiors().iter())
            {
                let mut runs: Vec<Vec<Coord<f64>>> = vec![];
                let mut run: Vec<Coord<f64>> = vec![];
                for segment in rim.lines() {
                    let mid = Point::new(
                        (segment.start.x + segment.end.x) / 2.0,
                        (segment.start.y + segment.end.y) / 2.0,
                    );
                    let on_circle = Point::from(segment.start).euclidean_distance(&ring)
                        <= GEOMETRY_EPSILON
                        && Point::from(segment.end).euclidean_distance(&ring) <= GEOMETRY_EPSILON
                        && mid.euclidean_distance(&ring) <= GEOMETRY_EPSILON;
                    if on_circle {
                        if run.is_empty() {
                            run.push(segment.start);
                        }
                        run.push(segment.end);
                    } else if run.len() >= 2 {
                        runs.push(std::mem::take(&mut run));
                    } else {
                        run.clear();
                    }
                }
                if run.len() >= 2 {
                    runs.push(run);
                }

                // a run ending at the rim's closing point continues in the first run
                if runs.len() > 1 {
                    let first_start = runs[0][0];
                    let last_end = *runs.last().and_then(|r| r.last()).expect("runs not empty");
                    if first_start == last_end {
                        let mut tail = runs.pop().expect("runs not empty");
                        tail.extend_from_slice(&runs[0][1..]);
                        runs[0] = tail;
                    }
                }

                lines.extend(runs.into_iter().map(LineString::new));
            }
        }
        lines
    }
}

///Grow one family of concentric arcs from `center`. Every radius is clipped
///against the same empty space; subtraction happens when the family is
///absorbed into the packing state. An arc family stops at the region
///boundary unless `UseLeastAmountOfCenterPoints` keeps it growing to r_max.
pub fn concentric_family(
    center: Point<f64>,
    r_min: f64,
    r_max: f64,
    boundary: &MultiLineString<f64>,
    remaining: &MultiPolygon<f64>,
    settings: &Settings,
) -> Vec<Arc> {
    let mut arcs = vec![];
    let mut radius = r_min;
    while radius <= r_max {
        let arc = Arc::generate(center, radius, remaining, settings.points_per_circle);
        if arc.poly.intersects(boundary) && !settings.use_least_amount_of_center_points {
            break;
        }
        arcs.push(arc);
        radius += settings.arc_width;
    }
    arcs
}

///Everything one region's packing produced, in emission order.
#[derive(Debug)]
pub struct RegionPacking {
    ///All arcs in generation order, innermost of each family first.
    pub arcs: Vec<Arc>,

    ///Arc rim polylines in the order the emitter must print them.
    pub emit_lines: Vec<LineString<f64>>,

    ///Space the arcs could not reach.
    pub remaining: MultiPolygon<f64>,

    ///Covered share of the region, in percent.
    pub filled_percent: f64,

    pub warnings: Vec<PostWarning>,
}

///Subtract a family from the empty space and queue its rims for emission.
///Returns the frontier entry for the family's outermost arc.
fn absorb_family(
    family: Vec<Arc>,
    settings: &Settings,
    remaining: &mut MultiPolygon<f64>,
    arcs: &mut Vec<Arc>,
    emit_lines: &mut Vec<LineString<f64>>,
) -> usize {
    for arc in family {
        *remaining = remaining.difference_with(&arc.poly.offset_from(GEOMETRY_EPSILON));
        emit_lines.extend(arc.boundary_lines(settings.points_per_circle));
        arcs.push(arc);
    }
    arcs.len() - 1
}

///Seed the packing: a scored start point first, then a densified start line,
///then up to ten random points on each. Counts whole families, not arcs.
fn seed_family(
    start_line: &MultiLineString<f64>,
    boundary_line: &MultiLineString<f64>,
    remaining: &MultiPolygon<f64>,
    settings: &Settings,
    layer: usize,
    rng: &mut StdRng,
) -> Result<Vec<Arc>, PostError> {
    let r_min_start = settings.slicer.nozzle_diameter;
    let family_at = |pt: Option<Point<f64>>| -> Vec<Arc> {
        pt.map(|pt| {
            concentric_family(
                pt,
                r_min_start,
                settings.r_max,
                boundary_line,
                remaining,
                settings,
            )
        })
        .unwrap_or_default()
    };

    let mut family = family_at(start_point_on_line(start_line, settings));
    if family.len() >= settings.min_start_arcs {
        return Ok(family);
    }

    let densified = redistribute_vertices(
        start_line,
        settings.distance_between_points_on_start_line,
    );
    family = family_at(start_point_on_line(&densified, settings));
    if family.len() >= settings.min_start_arcs {
        return Ok(family);
    }

    log::info!("layer {layer}: scored start points failed, trying random ones");
    for _ in 0..10 {
        family = family_at(random_point_on_line(start_line, rng));
        if family.len() >= settings.min_start_arcs {
            return Ok(family);
        }
    }
    for _ in 0..10 {
        family = family_at(random_point_on_line(&densified, rng));
        if family.len() >= settings.min_start_arcs {
            return Ok(family);
        }
    }

    Err(PostError::NoSeedFamily { layer })
}

///Pack one overhang region with arc families: seed on the start line, then
///repeatedly expand from the frontier point farthest from the boundary
///until nothing worth reaching is left.
pub fn pack_region(
    region: &Polygon<f64>,
    start_line: &MultiLineString<f64>,
    boundary_line: &MultiLineString<f64>,
    settings: &Settings,
    layer: usize,
    rng: &mut StdRng,
) -> Result<RegionPacking, PostError> {
    let region_boundary = boundary_lines(region);
    let region_area = region.unsigned_area();
    let mut remaining = MultiPolygon(vec![region.clone()]);
    let mut arcs: Vec<Arc> = vec![];
    let mut emit_lines: Vec<LineString<f64>> = vec![];
    let mut frontier: Vec<usize> = vec![];
    let mut warnings = vec![];

    let seeds = seed_family(start_line, boundary_line, &remaining, settings, layer, rng)?;
    frontier.push(absorb_family(
        seeds,
        settings,
        &mut remaining,
        &mut arcs,
        &mut emit_lines,
    ));

    // the documented local mutation: the tight-spot retry resets these two
    let mut center_offset = settings.arc_center_offset;
    let mut r_min = settings.arc_center_offset + settings.arc_width / 1.5;
    let mut tried_fixing = false;

    let mut idx = 0;
    let mut safety = 0usize;
    while idx < frontier.len() {
        let step = {
            let current = &arcs[frontier[idx]];
            current
                .poly
                .0
                .first()
                .and_then(|component| farthest_point(component, &region_boundary, &remaining))
                .map(|(pt, distance)| (pt, distance, current.center))
        };
        let Some((far_pt, distance, parent_center)) = step else {
            idx += 1;
            continue;
        };
        if distance < settings.max_distance_from_perimeter {
            idx += 1;
            continue;
        }

        let start = move_toward_point(&far_pt, &parent_center, center_offset);
        let family = concentric_family(
            start,
            r_min,
            settings.r_max,
            &region_boundary,
            &remaining,
            settings,
        );
        if family.is_empty() {
            idx += 1;
        } else {
            // the same parent may spawn more children, so idx stays put
            frontier.push(absorb_family(
                family,
                settings,
                &mut remaining,
                &mut arcs,
                &mut emit_lines,
            ));
        }

        safety += 1;
        if safety > settings.safety_break_max_arc_number {
            let w = PostWarning::SafetyBreak {
                layer,
                limit: settings.safety_break_max_arc_number,
            };
            warning::emit(&w);
            warnings.push(w);
            break;
        }

        if frontier.len() == 1
            && idx == 1
            && remaining.unsigned_area() / region_area > 0.5
            && !tried_fixing
        {
            center_offset = 0.0;
            r_min = settings.arc_width / 1.5;
            idx = 0;
            tried_fixing = true;
            let w = PostWarning::StartupStuckRecovered { layer };
            warning::emit(&w);
            warnings.push(w);
        } else if tried_fixing && frontier.len() == 1 && idx == 1 {
            let w = PostWarning::StartupStuckAbandoned { layer };
            warning::emit(&w);
            warnings.push(w);
        }
    }

    let remaining_percent = remaining.unsigned_area() / region_area * 100.0;
    let filled_percent = 100.0 - remaining_percent;
    if remaining_percent > 100.0 - settings.warn_below_this_filling_percentage {
        let w = PostWarning::LowFill {
            layer,
            filled: filled_percent,
        };
        warning::emit(&w);
        warnings.push(w);
    }

    Ok(RegionPacking {
        arcs,
        emit_lines,
        remaining,
        filled_percent,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plotter::derive_start_line;
    use crate::test_util::test_settings;
    use geo::EuclideanLength;
    use rand::SeedableRng;

    fn square(size: f64) -> Polygon<f64> {
        Polygon::new(
            LineString::from(vec![(0.0, 0.0), (size, 0.0), (size, size), (0.0, size)]),
            vec![],
        )
    }

    fn bottom_strip(width: f64) -> Polygon<f64> {
        Polygon::new(
            LineString::from(vec![
                (0.0, -2.0),
                (width, -2.0),
                (width, 0.0),
                (0.0, 0.0),
            ]),
            vec![],
        )
    }

    #[test]
    fn circle_polygon_stays_on_radius() {
        let circle = circle_polygon(Point::new(3.0, 4.0), 2.0, 80);
        assert_eq!(circle.exterior().0.len(), 81);
        for c in circle.exterior().coords() {
            let r = ((c.x - 3.0).powi(2) + (c.y - 4.0).powi(2)).sqrt();
            assert!((r - 2.0).abs() < 1e-9);
        }
    }

    #[test]
    fn family_radii_step_by_arc_width() {
        let settings = test_settings();
        let region = square(20.0);
        let remaining = MultiPolygon(vec![region.clone()]);
        let boundary = boundary_lines(&region);
        let family = concentric_family(
            Point::new(10.0, 0.0),
            settings.slicer.nozzle_diameter,
            settings.r_max,
            &boundary,
            &remaining,
            &settings,
        );

        assert!(!family.is_empty());
        let expected =
            ((settings.r_max - settings.slicer.nozzle_diameter) / settings.arc_width) as usize + 1;
        assert_eq!(family.len(), expected);
        for pair in family.windows(2) {
            assert!((pair[1].radius - pair[0].radius - settings.arc_width).abs() < 1e-9);
        }
    }

    #[test]
    fn swept_regions_stay_inside_the_clip() {
        let settings = test_settings();
        let region = square(20.0);
        let remaining = MultiPolygon(vec![region.clone()]);
        let boundary = boundary_lines(&region);
        let family = concentric_family(
            Point::new(10.0, 0.0),
            0.4,
            30.0,
            &boundary,
            &remaining,
            &settings,
        );
        for arc in &family {
            let outside = arc.poly.difference_with(&remaining);
            assert!(outside.unsigned_area() < 1e-3);
        }
    }

    #[test]
    fn rim_extraction_returns_the_circular_part() {
        let settings = test_settings();
        let region = square(20.0);
        let remaining = MultiPolygon(vec![region.clone()]);
        let arc = Arc::generate(Point::new(10.0, 0.0), 4.0, &remaining, 80);

        let rims = arc.boundary_lines(settings.points_per_circle);
        assert_eq!(rims.len(), 1);
        let length = rims[0].euclidean_length();
        // half the circumference, give or take the polygonal approximation
        assert!((length - std::f64::consts::PI * 4.0).abs() < 0.1);
        for c in rims[0].coords() {
            let r = ((c.x - 10.0).powi(2) + c.y.powi(2)).sqrt();
            assert!((r - 4.0).abs() < 2e-2);
        }
    }

    #[test]
    fn fully_covered_arcs_have_no_rim() {
        let remaining = MultiPolygon(vec![square(20.0)]);
        // the circle swallows the whole square, so no rim piece lies on it
        let arc = Arc::generate(Point::new(10.0, 10.0), 50.0, &remaining, 80);
        assert!(arc.boundary_lines(80).is_empty());
    }

    #[test]
    fn square_bridge_is_packed_by_one_family() {
        let settings = test_settings();
        let region = square(20.0);
        let (start, boundary) = derive_start_line(&region, &[bottom_strip(20.0)], 1).unwrap();
        let mut rng = StdRng::seed_from_u64(1);

        let packing =
            pack_region(&region, &start, &boundary, &settings, 1, &mut rng).unwrap();

        assert!(packing.filled_percent >= 95.0, "filled {}", packing.filled_percent);
        assert!(!packing.emit_lines.is_empty());
        let last = packing.arcs.last().unwrap();
        assert!(last.radius > 10.0 * std::f64::consts::SQRT_2);
        assert!(last.radius <= settings.r_max);
        assert!(packing
            .warnings
            .iter()
            .all(|w| !matches!(w, PostWarning::LowFill { .. })));
    }

    #[test]
    fn concave_notch_needs_an_expansion() {
        // families stop at the boundary here, so the notch interior can only
        // be reached by farthest-point expansion
        let mut settings = test_settings();
        settings.use_least_amount_of_center_points = false;

        // 40x40 square with a 10x30 notch cut into the right edge
        let region = Polygon::new(
            LineString::from(vec![
                (0.0, 0.0),
                (40.0, 0.0),
                (40.0, 5.0),
                (30.0, 5.0),
                (30.0, 35.0),
                (40.0, 35.0),
                (40.0, 40.0),
                (0.0, 40.0),
            ]),
            vec![],
        );
        let (start, boundary) = derive_start_line(&region, &[bottom_strip(40.0)], 2).unwrap();
        let mut rng = StdRng::seed_from_u64(2);

        let packing =
            pack_region(&region, &start, &boundary, &settings, 2, &mut rng).unwrap();

        let mut centers: Vec<(i64, i64)> = packing
            .arcs
            .iter()
            .map(|arc| ((arc.center.x() * 1e6) as i64, (arc.center.y() * 1e6) as i64))
            .collect();
        centers.dedup();
        assert!(centers.len() >= 2, "expected several families");
        assert!(packing.filled_percent >= 90.0, "filled {}", packing.filled_percent);
    }

    #[test]
    fn remaining_space_matches_subtracted_arcs() {
        let settings = test_settings();
        let region = square(20.0);
        let (start, boundary) = derive_start_line(&region, &[bottom_strip(20.0)], 1).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let packing =
            pack_region(&region, &start, &boundary, &settings, 1, &mut rng).unwrap();

        // region minus all swept regions equals the reported leftover space
        let mut expect = MultiPolygon(vec![region]);
        for arc in &packing.arcs {
            expect = expect.difference_with(&arc.poly.offset_from(GEOMETRY_EPSILON));
        }
        let mismatch = expect
            .difference_with(&packing.remaining)
            .unsigned_area()
            + packing.remaining.difference_with(&expect).unsigned_area();
        assert!(mismatch < 1e-3);
    }
}
