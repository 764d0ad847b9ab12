use geo::{LineString, MultiLineString, MultiPolygon, Polygon};
use geo_clipper::{Clipper, ClipperOpen, EndType, JoinType};

///Fixed-point scale used for every clipper call. 1e4 keeps a tenth of a
///micron of resolution, comfortably below the 1e-2 mm tolerance band the
///packing math works with.
const CLIPPER_FACTOR: f64 = 1e4;

///Arc tolerance of round joins, in mm.
const ROUND_TOLERANCE: f64 = 0.01;

///Every boolean and offset in the crate funnels through this trait so the
///clipper scale factor is set in exactly one place.
pub trait PolygonOperations {
    fn union_with(&self, other: &MultiPolygon<f64>) -> MultiPolygon<f64>;
    fn intersection_with(&self, other: &MultiPolygon<f64>) -> MultiPolygon<f64>;
    fn difference_with(&self, other: &MultiPolygon<f64>) -> MultiPolygon<f64>;
    ///Positive values grow the shape, negative values shrink it.
    fn offset_from(&self, delta: f64) -> MultiPolygon<f64>;
}

impl PolygonOperations for Polygon<f64> {
    fn union_with(&self, other: &MultiPolygon<f64>) -> MultiPolygon<f64> {
        self.union(other, CLIPPER_FACTOR)
    }

    fn intersection_with(&self, other: &MultiPolygon<f64>) -> MultiPolygon<f64> {
        self.intersection(other, CLIPPER_FACTOR)
    }

    fn difference_with(&self, other: &MultiPolygon<f64>) -> MultiPolygon<f64> {
        self.difference(other, CLIPPER_FACTOR)
    }

    fn offset_from(&self, delta: f64) -> MultiPolygon<f64> {
        self.offset(
            delta,
            JoinType::Round(ROUND_TOLERANCE),
            EndType::ClosedPolygon,
            CLIPPER_FACTOR,
        )
    }
}

impl PolygonOperations for MultiPolygon<f64> {
    fn union_with(&self, other: &MultiPolygon<f64>) -> MultiPolygon<f64> {
        self.union(other, CLIPPER_FACTOR)
    }

    fn intersection_with(&self, other: &MultiPolygon<f64>) -> MultiPolygon<f64> {
        self.intersection(other, CLIPPER_FACTOR)
    }

    fn difference_with(&self, other: &MultiPolygon<f64>) -> MultiPolygon<f64> {
        self.difference(other, CLIPPER_FACTOR)
    }

    fn offset_from(&self, delta: f64) -> MultiPolygon<f64> {
        self.offset(
            delta,
            JoinType::Round(ROUND_TOLERANCE),
            EndType::ClosedPolygon,
            CLIPPER_FACTOR,
        )
    }
}

///Buffer an open stroke into the area it covers on the bed. Used to lift
///infill polylines into regions.
pub fn buffer_polyline(line: &LineString<f64>, distance: f64) -> MultiPolygon<f64> {
    MultiLineString::new(vec![line.clone()]).offset(
        distance,
        JoinType::Round(ROUND_TOLERANCE),
        EndType::OpenRound(ROUND_TOLERANCE),
        CLIPPER_FACTOR,
    )
}

///Same as [`buffer_polyline`] for multi-part strokes.
pub fn buffer_polylines(lines: &MultiLineString<f64>, distance: f64) -> MultiPolygon<f64> {
    lines.offset(
        distance,
        JoinType::Round(ROUND_TOLERANCE),
        EndType::OpenRound(ROUND_TOLERANCE),
        CLIPPER_FACTOR,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Area, Coord, LineString};

    fn square(size: f64) -> Polygon<f64> {
        Polygon::new(
            LineString::from(vec![
                (0.0, 0.0),
                (size, 0.0),
                (size, size),
                (0.0, size),
            ]),
            vec![],
        )
    }

    #[test]
    fn difference_removes_overlap() {
        let outer = square(10.0);
        let inner = MultiPolygon(vec![square(5.0)]);
        let result = outer.difference_with(&inner);
        assert!((result.unsigned_area() - 75.0).abs() < 0.1);
    }

    #[test]
    fn intersection_keeps_overlap() {
        let a = square(10.0);
        let mut b = square(10.0);
        b.exterior_mut(|ring| {
            for c in ring.coords_mut() {
                *c = *c + Coord { x: 5.0, y: 5.0 };
            }
        });
        let result = a.intersection_with(&MultiPolygon(vec![b]));
        assert!((result.unsigned_area() - 25.0).abs() < 0.1);
    }

    #[test]
    fn buffered_stroke_covers_its_width() {
        let stroke = LineString::from(vec![(0.0, 0.0), (10.0, 0.0)]);
        let region = buffer_polyline(&stroke, 1.0);
        // 10x2 core plus two rounded caps
        let area = region.unsigned_area();
        assert!(area > 20.0 && area < 20.0 + std::f64::consts::PI + 0.5);
    }
}

#[cfg(test)]
mod debug_tmp {
    use super::*;
    use geo::{Area, LineString};
    #[test]
    fn debug_area() {
        let poly = Polygon::new(
            LineString::from(vec![(0.0, 0.0), (5.0, 0.0), (5.0, 5.0), (0.0, 5.0), (0.0, 0.0)]),
            vec![],
        );
        let offp = poly.offset_from(1.0);
        eprintln!("closed offset area={}", offp.unsigned_area());
        let stroke = LineString::from(vec![(0.0, 0.0), (10.0, 0.0)]);
        let mls = MultiLineString::new(vec![stroke.clone()]);
        let r1: MultiPolygon<f64> = mls.offset(1.0, JoinType::Round(ROUND_TOLERANCE), EndType::OpenRound(ROUND_TOLERANCE), CLIPPER_FACTOR);
        eprintln!("r1 area={}", r1.unsigned_area());
        let r2: MultiPolygon<f64> = mls.offset(1.0, JoinType::Round(ROUND_TOLERANCE), EndType::OpenSquare, CLIPPER_FACTOR);
        eprintln!("r2 area={}", r2.unsigned_area());
        let r3: MultiPolygon<f64> = mls.offset(1.0, JoinType::Round(ROUND_TOLERANCE), EndType::OpenButt, CLIPPER_FACTOR);
        eprintln!("r3 area={}", r3.unsigned_area());
    }
}
