use geo::{BoundingRect, Contains, Point, Polygon};
use rand::{rngs::StdRng, seq::SliceRandom};

use crate::settings::Settings;

///Lattice coordinates of index `d` on a Hilbert curve of the given order.
///Classic d2xy bit walk; consecutive indices are always lattice neighbors.
fn hilbert_decode(order: u32, d: u64) -> (u64, u64) {
    let side = 1u64 << order;
    let (mut x, mut y) = (0u64, 0u64);
    let mut t = d;
    let mut s = 1u64;
    while s < side {
        let rx = 1 & (t / 2);
        let ry = 1 & (t ^ rx);
        if ry == 0 {
            if rx == 1 {
                x = s - 1 - x;
                y = s - 1 - y;
            }
            std::mem::swap(&mut x, &mut y);
        }
        x += s * rx;
        y += s * ry;
        t /= 4;
        s *= 2;
    }
    (x, y)
}

///Curve order for a region of extent `l`, so the lattice pitch lands at the
///extrusion width over the fill fraction.
pub fn iteration_count(l: f64, width: f64, fill_fraction: f64) -> u32 {
    ((fill_fraction * l + width) / width).log2().ceil() as u32
}

///Fill a solid region above arcs with ordered sub-chains of a Hilbert curve.
///
///Points outside the polygon split the walk; splits shorter than six points
///are dropped, long ones are chunked so each sub-chain stays printable within
///the travel budget. The chain order is shuffled to spread travel moves over
///the region; the caller provides the layer's seeded random source.
pub fn hilbert_chains_in_polygon(
    poly: &Polygon<f64>,
    layer_number: usize,
    settings: &Settings,
    rng: &mut StdRng,
) -> Vec<Vec<Point<f64>>> {
    let Some(bounds) = poly.bounding_rect() else {
        return vec![];
    };

    let width = settings.slicer.solid_infill_extrusion_width;
    let fill_fraction = settings.hilbert_filling_percentage / 100.0;
    let mm_between_travels =
        settings.above_arcs_infill_print_speed / 60.0 * settings.hilbert_travel_every_n_seconds;

    let l = bounds.width().max(bounds.height());
    let order = iteration_count(l, width, fill_fraction);
    let scale = width / fill_fraction;
    let max_index = (1u64 << (2 * order)) - 1;

    // alternate the lattice by one pitch per layer to avoid column artifacts
    let shift = (layer_number % 2) as f64 * scale;

    let chain_points = (mm_between_travels / scale).ceil() as usize;
    let mut chains: Vec<Vec<Point<f64>>> = vec![];
    let mut buffer: Vec<Point<f64>> = vec![];
    let seal = |buffer: &mut Vec<Point<f64>>, chains: &mut Vec<Vec<Point<f64>>>| {
        if buffer.len() > 5 {
            if buffer.len() as f64 > chain_points as f64 * 1.7 {
                chains.extend(buffer.chunks(chain_points).map(|chunk| chunk.to_vec()));
            } else {
                chains.push(std::mem::take(buffer));
            }
        }
        buffer.clear();
    };

    for index in 0..max_index {
        let (ix, iy) = hilbert_decode(order, index);
        let point = Point::new(
            ix as f64 * scale + bounds.min().x - shift,
            iy as f64 * scale + bounds.min().y - shift,
        );
        if poly.contains(&point) {
            buffer.push(point);
        } else {
            seal(&mut buffer, &mut chains);
        }
    }
    seal(&mut buffer, &mut chains);

    chains.shuffle(rng);
    chains
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_settings;
    use geo::{EuclideanDistance, LineString};
    use rand::SeedableRng;

    #[test]
    fn decode_visits_every_cell_once() {
        let order = 3;
        let mut seen = vec![false; 64];
        for d in 0..64u64 {
            let (x, y) = hilbert_decode(order, d);
            let cell = (y * 8 + x) as usize;
            assert!(!seen[cell]);
            seen[cell] = true;
        }
        assert!(seen.iter().all(|&v| v));
    }

    #[test]
    fn consecutive_indices_are_lattice_neighbors() {
        let order = 5;
        for d in 0..(1u64 << (2 * order)) - 1 {
            let (x0, y0) = hilbert_decode(order, d);
            let (x1, y1) = hilbert_decode(order, d + 1);
            let step = x0.abs_diff(x1) + y0.abs_diff(y1);
            assert_eq!(step, 1, "jump between {d} and {}", d + 1);
        }
    }

    #[test]
    fn order_matches_region_extent() {
        // 30 mm square at 0.45 mm width and full density
        assert_eq!(iteration_count(30.0, 0.45, 1.0), 7);
    }

    #[test]
    fn chains_fill_a_square_within_budget() {
        let settings = test_settings();
        let poly = Polygon::new(
            LineString::from(vec![(0.0, 0.0), (30.0, 0.0), (30.0, 30.0), (0.0, 30.0)]),
            vec![],
        );
        let mut rng = StdRng::seed_from_u64(42);
        let chains = hilbert_chains_in_polygon(&poly, 3, &settings, &mut rng);

        assert!(!chains.is_empty());

        // no_el = ceil((600/60 * 6) / 0.45)
        let chain_points = 134;
        let scale = 0.45;
        let mut saw_full_chain = false;
        for chain in &chains {
            // unchunked chains may run up to 1.7x the budget
            assert!(chain.len() as f64 <= chain_points as f64 * 1.7 + 1.0);
            if chain.len() == chain_points {
                saw_full_chain = true;
            }
            for p in chain {
                assert!(poly.contains(p), "point outside region: {:?}", p);
            }
            for pair in chain.windows(2) {
                let step = pair[0].euclidean_distance(&pair[1]);
                assert!(step <= scale * std::f64::consts::SQRT_2 + 1e-6);
            }
        }
        assert!(saw_full_chain);
    }

    #[test]
    fn shuffle_is_a_permutation_of_the_walk() {
        let settings = test_settings();
        let poly = Polygon::new(
            LineString::from(vec![(0.0, 0.0), (12.0, 0.0), (12.0, 12.0), (0.0, 12.0)]),
            vec![],
        );
        let mut rng_a = StdRng::seed_from_u64(9);
        let mut rng_b = StdRng::seed_from_u64(10);
        let a = hilbert_chains_in_polygon(&poly, 2, &settings, &mut rng_a);
        let b = hilbert_chains_in_polygon(&poly, 2, &settings, &mut rng_b);

        let mut flat_a: Vec<(i64, i64)> = a
            .iter()
            .flatten()
            .map(|p| ((p.x() * 1e6) as i64, (p.y() * 1e6) as i64))
            .collect();
        let mut flat_b: Vec<(i64, i64)> = b
            .iter()
            .flatten()
            .map(|p| ((p.x() * 1e6) as i64, (p.y() * 1e6) as i64))
            .collect();
        flat_a.sort_unstable();
        flat_b.sort_unstable();
        assert_eq!(flat_a, flat_b);
    }

}
