pub mod emit;

use geo::Point;
use nom::{
    character::complete::{multispace0, one_of},
    multi::many0,
    number::complete::double,
    sequence::{pair, preceded},
    IResult,
};

use crate::settings::Settings;

///Decoded fields of a `G1` motion line. Fields keep their source order
///independence; anything the line does not mention stays `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Motion {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub e: Option<f64>,
    pub f: Option<f64>,
}

impl Motion {
    ///The planar target of this move, if both coordinates are present.
    pub fn point(&self) -> Option<Point<f64>> {
        match (self.x, self.y) {
            (Some(x), Some(y)) => Some(Point::new(x, y)),
            _ => None,
        }
    }

    ///A travel move positions without extruding, at the slicer's travel feed rate.
    pub fn is_travel(&self, travel_speed: f64) -> bool {
        self.e.is_none()
            && self
                .f
                .map(|f| (f - travel_speed * 60.0).abs() < 0.5)
                .unwrap_or(false)
    }
}

fn motion_word(input: &str) -> IResult<&str, (char, f64)> {
    pair(preceded(multispace0, one_of("XYZEF")), double)(input)
}

///Parse the motion fields of a `G1` line; comments and unknown words are
///ignored. Returns `None` for anything that is not a `G1` command.
pub fn parse_motion(line: &str) -> Option<Motion> {
    let code = line.split(';').next().unwrap_or("");
    let rest = code.trim_start().strip_prefix("G1")?;
    // require a word boundary so e.g. `G10` is not misread
    if rest.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return None;
    }

    let (_, words) = many0(motion_word)(rest).ok()?;
    let mut motion = Motion::default();
    for (letter, value) in words {
        match letter {
            'X' => motion.x = Some(value),
            'Y' => motion.y = Some(value),
            'Z' => motion.z = Some(value),
            'E' => motion.e = Some(value),
            'F' => motion.f = Some(value),
            _ => unreachable!(),
        }
    }
    Some(motion)
}

///Fan speed of an `M106` line (the raw S value), if this is one.
pub fn parse_fan_speed(line: &str) -> Option<f64> {
    let code = line.split(';').next().unwrap_or("");
    let rest = code.trim_start().strip_prefix("M106")?;
    rest.split_whitespace()
        .find_map(|word| word.strip_prefix('S'))
        .and_then(|value| value.parse::<f64>().ok())
}

///Height of a `;HEIGHT:<float>` marker line.
pub fn parse_height(line: &str) -> Option<f64> {
    if !line.contains(";HEIGHT") {
        return None;
    }
    line.rsplit(':').next()?.trim().parse::<f64>().ok()
}

///One extrusion or positioning move. `e` of zero writes a literal `E0`,
///matching the slicer's own travel lines.
pub fn point_line(point: &Point<f64>, e: f64, feed_rate: Option<f64>) -> String {
    let mut line = format!("G1 X{:.5} Y{:.5} ", point.x(), point.y());
    if e == 0.0 {
        line.push_str("E0");
    } else {
        line.push_str(&format!("E{:.5}", e));
    }
    if let Some(f) = feed_rate {
        line.push_str(&format!(" F{}", f));
    }
    line.push('\n');
    line
}

pub fn retract_line(retract: bool, settings: &Settings) -> String {
    let e = if retract {
        -settings.slicer.retract_length
    } else {
        settings.slicer.retract_length
    };
    format!("G1 E{} F{}\n", e, settings.slicer.retract_speed * 60.0)
}

pub fn feed_rate_line(feed_rate: f64) -> String {
    format!("G1 F{}\n", feed_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fields_in_any_order() {
        let motion = parse_motion("G1 F7800 Y2.5 X-1.25 E0.0412").unwrap();
        assert_eq!(motion.x, Some(-1.25));
        assert_eq!(motion.y, Some(2.5));
        assert_eq!(motion.e, Some(0.0412));
        assert_eq!(motion.f, Some(7800.0));
        assert_eq!(motion.z, None);
        assert_eq!(motion.point(), Some(Point::new(-1.25, 2.5)));
    }

    #[test]
    fn ignores_comments_and_other_commands() {
        let motion = parse_motion("G1 X10 Y20 ; perimeter").unwrap();
        assert_eq!(motion.point(), Some(Point::new(10.0, 20.0)));

        assert_eq!(parse_motion("M106 S255"), None);
        assert_eq!(parse_motion("G10 X1"), None);
        assert_eq!(parse_motion(";TYPE:Bridge infill"), None);
    }

    #[test]
    fn z_only_moves_have_no_point() {
        let motion = parse_motion("G1 Z0.45 F9000").unwrap();
        assert_eq!(motion.z, Some(0.45));
        assert_eq!(motion.point(), None);
    }

    #[test]
    fn travel_detection_matches_travel_feed_rate() {
        let motion = parse_motion("G1 X5 Y5 F7800").unwrap();
        assert!(motion.is_travel(130.0));
        assert!(!motion.is_travel(120.0));

        let extruding = parse_motion("G1 X5 Y5 E0.1 F7800").unwrap();
        assert!(!extruding.is_travel(130.0));
    }

    #[test]
    fn fan_and_height_markers() {
        assert_eq!(parse_fan_speed("M106 S153"), Some(153.0));
        assert_eq!(parse_fan_speed("M107"), None);
        assert_eq!(parse_height(";HEIGHT:0.25"), Some(0.25));
        assert_eq!(parse_height("G1 X1 Y1"), None);
    }

    #[test]
    fn point_line_formats_like_the_slicer() {
        let p = Point::new(1.0, 2.0);
        assert_eq!(point_line(&p, 0.0, None), "G1 X1.00000 Y2.00000 E0\n");
        assert_eq!(
            point_line(&p, 0.0123, Some(1800.0)),
            "G1 X1.00000 Y2.00000 E0.01230 F1800\n"
        );
    }
}
