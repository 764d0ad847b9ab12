pub mod arcs;
pub mod hilbert;
pub mod polygon_operations;
pub mod svg;

use geo::{
    Contains, Coord, EuclideanDistance, EuclideanLength, Intersects, LineInterpolatePoint,
    LineString, MultiLineString, MultiPolygon, Point, Polygon,
};
use itertools::Itertools;
use ordered_float::OrderedFloat;
use rand::{rngs::StdRng, seq::SliceRandom};

use crate::error::PostError;
use crate::settings::Settings;
use polygon_operations::PolygonOperations;

///Tolerance band used to stabilize intersections against floating point
///noise. Baked into the packing invariants.
pub const GEOMETRY_EPSILON: f64 = 1e-2;

///Step used when a boundary is chopped up for shared-segment classification.
const CLASSIFY_STEP: f64 = 0.1;

///Exterior and interior rings of a polygon as one multi-line.
pub fn boundary_lines(poly: &Polygon<f64>) -> MultiLineString<f64> {
    let rings = std::iter::once(poly.exterior().clone())
        .chain(poly.interiors().iter().cloned())
        .collect();
    MultiLineString(rings)
}

///All rings of a multi-polygon as one multi-line.
pub fn multi_boundary_lines(polys: &MultiPolygon<f64>) -> MultiLineString<f64> {
    let rings = polys
        .iter()
        .flat_map(|poly| {
            std::iter::once(poly.exterior().clone()).chain(poly.interiors().iter().cloned())
        })
        .collect();
    MultiLineString(rings)
}

///Split `source` into the parts lying within (or beyond) an epsilon band
///around `reference`. Segments are subdivided first so partial overlaps
///resolve at sub-segment granularity.
fn shared_segments(
    source: &MultiLineString<f64>,
    reference: &MultiLineString<f64>,
    keep_within: bool,
    epsilon: f64,
) -> MultiLineString<f64> {
    let mut parts: Vec<LineString<f64>> = vec![];

    for line in source {
        let mut run: Vec<Coord<f64>> = vec![];
        for segment in line.lines() {
            let length = segment.start_point().euclidean_distance(&segment.end_point());
            let pieces = ((length / CLASSIFY_STEP).ceil() as usize).max(1);
            for piece in 0..pieces {
                let t0 = piece as f64 / pieces as f64;
                let t1 = (piece + 1) as f64 / pieces as f64;
                let a = Coord {
                    x: segment.start.x + (segment.end.x - segment.start.x) * t0,
                    y: segment.start.y + (segment.end.y - segment.start.y) * t0,
                };
                let b = Coord {
                    x: segment.start.x + (segment.end.x - segment.start.x) * t1,
                    y: segment.start.y + (segment.end.y - segment.start.y) * t1,
                };
                let mid = Point::new((a.x + b.x) / 2.0, (a.y + b.y) / 2.0);
                let within = Point::from(a).euclidean_distance(reference) <= epsilon
                    && Point::from(b).euclidean_distance(reference) <= epsilon
                    && mid.euclidean_distance(reference) <= epsilon;

                if within == keep_within {
                    if run.is_empty() {
                        run.push(a);
                    }
                    run.push(b);
                } else if run.len() >= 2 {
                    parts.push(LineString::new(std::mem::take(&mut run)));
                } else {
                    run.clear();
                }
            }
        }
        if run.len() >= 2 {
            parts.push(LineString::new(run));
        }
    }

    MultiLineString(parts)
}

///Derive where seeding is allowed. The start line is the piece of the
///region's rim backed by material of the previous layer; the boundary line
///is the rest of the rim, which arcs must not escape.
pub fn derive_start_line(
    region: &Polygon<f64>,
    prev_perimeters: &[Polygon<f64>],
    layer: usize,
) -> Result<(MultiLineString<f64>, MultiLineString<f64>), PostError> {
    let region_boundary = boundary_lines(region);
    let region_multi = MultiPolygon(vec![region.clone()]);

    for perimeter in prev_perimeters {
        let buffered = perimeter.offset_from(GEOMETRY_EPSILON);
        if !buffered.intersects(region) {
            continue;
        }
        let start_area = buffered.intersection_with(&region_multi);
        if start_area.0.is_empty() {
            continue;
        }
        let area_boundary = multi_boundary_lines(&start_area);
        let band = GEOMETRY_EPSILON + 1e-3;

        let start_line = shared_segments(&area_boundary, &region_boundary, true, band);
        if start_line.0.is_empty() {
            // pathological: the supported area floats inside the region
            if region.contains(&start_area) && !area_boundary.0.is_empty() {
                return Ok((area_boundary, region_boundary));
            }
            return Err(PostError::GeometryDegenerate {
                layer,
                context: "deriving the start line from the previous layer".to_string(),
            });
        }

        let boundary_line = shared_segments(&region_boundary, &area_boundary, false, band);
        return Ok((start_line, boundary_line));
    }

    Err(PostError::NoPrevLayerSupport { layer })
}

///Pick the longest component of a multi-line.
fn longest_component(line: &MultiLineString<f64>) -> Option<&LineString<f64>> {
    line.iter()
        .max_by_key(|ls| OrderedFloat(ls.euclidean_length()))
}

///Score-based start point: favors the middle of the line, with a bonus for
///corners weighted by `CornerImportanceMultiplier`. Endpoints never win.
pub fn start_point_on_line(
    line: &MultiLineString<f64>,
    settings: &Settings,
) -> Option<Point<f64>> {
    let component = longest_component(line)?;
    let pts: Vec<Point<f64>> = component.points().collect();
    if pts.len() < 2 {
        return None;
    }
    if pts.len() == 2 {
        return Some(Point::new(
            (pts[0].x() + pts[1].x()) / 2.0,
            (pts[0].y() + pts[1].y()) / 2.0,
        ));
    }

    let total_length = component.euclidean_length();
    let mut current_length = 0.0;
    let mut scores = vec![0.0; pts.len()];
    for idx in 1..pts.len() - 1 {
        current_length += pts[idx].euclidean_distance(&pts[idx - 1]);
        let relative = current_length / total_length;
        let length_score = 1.0 - (relative - 0.5).abs();

        let v1 = (pts[idx].x() - pts[idx - 1].x(), pts[idx].y() - pts[idx - 1].y());
        let v2 = (pts[idx + 1].x() - pts[idx].x(), pts[idx + 1].y() - pts[idx].y());
        let n1 = (v1.0 * v1.0 + v1.1 * v1.1).sqrt();
        let n2 = (v2.0 * v2.0 + v2.1 * v2.1).sqrt();
        scores[idx] = if n1 > 0.0 && n2 > 0.0 {
            // |sin| of the exterior angle, via the cross product of unit vectors
            let angle_score = ((v1.0 * v2.1 - v1.1 * v2.0) / (n1 * n2)).abs();
            length_score + angle_score * settings.corner_importance_multiplier
        } else {
            length_score
        };
    }

    scores
        .iter()
        .position_max_by_key(|score| OrderedFloat(**score))
        .map(|idx| pts[idx])
}

///Fallback used when scoring repeatedly fails to seed: any vertex goes.
pub fn random_point_on_line(
    line: &MultiLineString<f64>,
    rng: &mut StdRng,
) -> Option<Point<f64>> {
    let component = longest_component(line)?;
    let pts: Vec<Point<f64>> = component.points().collect();
    pts.choose(rng).copied()
}

///Resample a line to roughly even vertex spacing.
pub fn redistribute_vertices(
    lines: &MultiLineString<f64>,
    distance: f64,
) -> MultiLineString<f64> {
    let parts = lines
        .iter()
        .filter_map(|line| {
            let length = line.euclidean_length();
            if line.0.len() < 2 || length <= 0.0 {
                return None;
            }
            let count = ((length / distance).round() as usize).max(1);
            let coords: Vec<Coord<f64>> = (0..=count)
                .filter_map(|n| {
                    line.line_interpolate_point(n as f64 / count as f64)
                        .map(|p| p.0)
                })
                .collect();
            (coords.len() >= 2).then(|| LineString::new(coords))
        })
        .collect();
    MultiLineString(parts)
}

pub fn move_toward_point(start: &Point<f64>, target: &Point<f64>, distance: f64) -> Point<f64> {
    let dx = target.x() - start.x();
    let dy = target.y() - start.y();
    let magnitude = (dx * dx + dy * dy).sqrt();
    if magnitude == 0.0 {
        return *start;
    }
    Point::new(
        start.x() + dx / magnitude * distance,
        start.y() + dy / magnitude * distance,
    )
}

///Among the rim vertices of an arc that still touch uncovered space, the one
///farthest from the region boundary; this is where the next family grows.
pub fn farthest_point(
    arc_poly: &Polygon<f64>,
    region_boundary: &MultiLineString<f64>,
    remaining: &MultiPolygon<f64>,
) -> Option<(Point<f64>, f64)> {
    if remaining.0.is_empty() {
        return None;
    }
    let mut best: Option<(Point<f64>, f64)> = None;
    for coord in arc_poly.exterior().coords() {
        let p = Point::from(*coord);
        if p.euclidean_distance(remaining) > GEOMETRY_EPSILON {
            continue;
        }
        let distance = p.euclidean_distance(region_boundary);
        if best.map(|(_, d)| distance > d).unwrap_or(true) {
            best = Some((p, distance));
        }
    }
    best
}
