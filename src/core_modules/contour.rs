// THEORY:
// A `Contour` is the closed polygonal boundary of one bright region of a
// binary frame. It stores nothing but its boundary points; every shape
// attribute the engine cares about is derived on demand:
//
// 1.  **Extent**: signed and absolute polygon area, circumference.
// 2.  **Pose**: the minimum-area enclosing rotated rectangle (center, two axis
//     lengths, angle) found with rotating calipers over the convex hull.
//     `length` and `width` are the longer and shorter rectangle axes.
// 3.  **Position**: the centroid from first-order polygon moments. A contour
//     with zero area has no centroid (`None`) instead of a division fault.
// 4.  **Bending**: a quadratic least-squares fit of the boundary points in the
//     frame of the rectangle's long axis; the magnitude of its leading
//     coefficient is the curvature proxy.
//
// Contours are immutable values. Joining several of them produces a new
// contour (the convex hull of all their points).

use imageproc::geometry::{arc_length, convex_hull};
use imageproc::point::Point;
use nalgebra::{DMatrix, DVector};

const DEGENERATE_AREA: f64 = 1e-9;
const FIT_EPSILON: f64 = 1e-9;

/// A sub-pixel position in image coordinates (x right, y down).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// A rectangle of minimum area enclosing a contour.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RotatedRect {
    pub center: Position,
    /// Extent along the rectangle's first edge direction, then along its normal.
    pub axes: (f64, f64),
    /// Direction of the first axis, in degrees from the image x axis, in `[0, 180)`.
    pub angle: f64,
}

/// First-order moments of a polygon.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Moments {
    pub m00: f64,
    pub m10: f64,
    pub m01: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contour {
    pub points: Vec<Point<i32>>,
}

impl Contour {
    pub fn new(points: Vec<Point<i32>>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Shoelace area; positive for counter-clockwise boundaries in image
    /// coordinates as seen with the y axis pointing up.
    pub fn signed_area(&self) -> f64 {
        self.moments().m00
    }

    pub fn area(&self) -> f64 {
        self.signed_area().abs()
    }

    pub fn circumference(&self) -> f64 {
        arc_length(&self.points, true)
    }

    pub fn moments(&self) -> Moments {
        let n = self.points.len();
        if n < 3 {
            return Moments::default();
        }
        let mut moments = Moments::default();
        for i in 0..n {
            let (x0, y0) = as_f64(self.points[i]);
            let (x1, y1) = as_f64(self.points[(i + 1) % n]);
            let cross = x0 * y1 - x1 * y0;
            moments.m00 += cross;
            moments.m10 += (x0 + x1) * cross;
            moments.m01 += (y0 + y1) * cross;
        }
        moments.m00 /= 2.0;
        moments.m10 /= 6.0;
        moments.m01 /= 6.0;
        moments
    }

    /// Center of mass of the enclosed region, `None` for degenerate contours.
    pub fn centroid(&self) -> Option<Position> {
        let m = self.moments();
        if m.m00.abs() < DEGENERATE_AREA {
            return None;
        }
        Some(Position::new(m.m10 / m.m00, m.m01 / m.m00))
    }

    /// Convex hull without collinear vertices, starting at the topmost point.
    pub fn convex_hull(&self) -> Contour {
        // Traced boundaries of one-pixel-wide regions visit points twice; the
        // Graham scan needs them unique.
        let mut points = self.points.clone();
        points.sort_by_key(|p| (p.y, p.x));
        points.dedup();
        Contour::new(convex_hull(points))
    }

    pub fn is_convex(&self) -> bool {
        let n = self.points.len();
        if n < 3 {
            return false;
        }
        let mut sign = 0i64;
        for i in 0..n {
            let turn = cross(self.points[i], self.points[(i + 1) % n], self.points[(i + 2) % n]);
            if turn != 0 {
                if sign != 0 && turn.signum() != sign {
                    return false;
                }
                sign = turn.signum();
            }
        }
        sign != 0
    }

    /// Minimum-area enclosing rectangle by rotating calipers over the hull.
    pub fn min_area_rect(&self) -> RotatedRect {
        let hull: Vec<(f64, f64)> = self.convex_hull().points.into_iter().map(as_f64).collect();
        match hull.len() {
            0 => return RotatedRect::default(),
            1 => {
                return RotatedRect {
                    center: Position::new(hull[0].0, hull[0].1),
                    ..RotatedRect::default()
                };
            }
            _ => {}
        }

        let mut best: Option<(f64, RotatedRect)> = None;
        for i in 0..hull.len() {
            let origin = hull[i];
            let next = hull[(i + 1) % hull.len()];
            let (dx, dy) = (next.0 - origin.0, next.1 - origin.1);
            let norm = (dx * dx + dy * dy).sqrt();
            if norm == 0.0 {
                continue;
            }
            let u = (dx / norm, dy / norm);
            let v = (-u.1, u.0);

            let (mut s_min, mut s_max, mut t_min, mut t_max) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
            for &(x, y) in &hull {
                let (px, py) = (x - origin.0, y - origin.1);
                let s = px * u.0 + py * u.1;
                let t = px * v.0 + py * v.1;
                s_min = s_min.min(s);
                s_max = s_max.max(s);
                t_min = t_min.min(t);
                t_max = t_max.max(t);
            }

            let area = (s_max - s_min) * (t_max - t_min);
            if best.as_ref().is_some_and(|(best_area, _)| area >= *best_area) {
                continue;
            }
            let s_mid = (s_min + s_max) / 2.0;
            let t_mid = (t_min + t_max) / 2.0;
            let rect = RotatedRect {
                center: Position::new(
                    origin.0 + u.0 * s_mid + v.0 * t_mid,
                    origin.1 + u.1 * s_mid + v.1 * t_mid,
                ),
                axes: (s_max - s_min, t_max - t_min),
                angle: normalize_degrees(u.1.atan2(u.0).to_degrees()),
            };
            best = Some((area, rect));
        }
        best.map(|(_, rect)| rect).unwrap_or_default()
    }

    pub fn center(&self) -> Position {
        self.min_area_rect().center
    }

    pub fn axes(&self) -> (f64, f64) {
        self.min_area_rect().axes
    }

    /// The longer rectangle axis.
    pub fn length(&self) -> f64 {
        let (a, b) = self.axes();
        a.max(b)
    }

    /// The shorter rectangle axis.
    pub fn width(&self) -> f64 {
        let (a, b) = self.axes();
        a.min(b)
    }

    /// `length / width`; infinite for a straight line of pixels, zero for a point.
    pub fn aspect_ratio(&self) -> f64 {
        let (length, width) = (self.length(), self.width());
        if width > 0.0 {
            length / width
        } else if length > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    }

    /// Whether any pair of sampled boundary points (every `stride`-th point of
    /// each contour) lies closer than `distance`.
    pub fn is_close_to(&self, other: &Contour, distance: f64, stride: usize) -> bool {
        let stride = stride.max(1);
        let limit = distance * distance;
        self.points.iter().step_by(stride).any(|a| {
            other.points.iter().step_by(stride).any(|b| {
                let (dx, dy) = (f64::from(a.x - b.x), f64::from(a.y - b.y));
                dx * dx + dy * dy < limit
            })
        })
    }

    /// Magnitude of the leading coefficient of a quadratic fitted through the
    /// boundary points, expressed along the long axis of the enclosing rectangle.
    pub fn curvature(&self) -> f64 {
        if self.points.len() < 3 {
            return 0.0;
        }
        let rect = self.min_area_rect();
        let long_angle = if rect.axes.0 >= rect.axes.1 {
            rect.angle
        } else {
            rect.angle + 90.0
        }
        .to_radians();
        let u = (long_angle.cos(), long_angle.sin());
        let v = (-u.1, u.0);

        let local: Vec<(f64, f64)> = self
            .points
            .iter()
            .map(|&p| {
                let (x, y) = as_f64(p);
                let (dx, dy) = (x - rect.center.x, y - rect.center.y);
                (dx * u.0 + dy * u.1, dx * v.0 + dy * v.1)
            })
            .collect();

        let design = DMatrix::from_fn(local.len(), 3, |row, col| {
            let x = local[row].0;
            match col {
                0 => x * x,
                1 => x,
                _ => 1.0,
            }
        });
        let targets = DVector::from_iterator(local.len(), local.iter().map(|&(_, y)| y));
        design
            .svd(true, true)
            .solve(&targets, FIT_EPSILON)
            .map(|coefficients| coefficients[0].abs())
            .unwrap_or(0.0)
    }
}

/// Merges contours into the convex hull of all their points.
pub fn join_contours<'a>(contours: impl IntoIterator<Item = &'a Contour>) -> Contour {
    let points = contours
        .into_iter()
        .flat_map(|contour| contour.points.iter().copied())
        .collect();
    Contour::new(points).convex_hull()
}

fn as_f64(p: Point<i32>) -> (f64, f64) {
    (f64::from(p.x), f64::from(p.y))
}

/// Z component of `(b - a) x (c - b)`.
fn cross(a: Point<i32>, b: Point<i32>, c: Point<i32>) -> i64 {
    let (abx, aby) = (i64::from(b.x - a.x), i64::from(b.y - a.y));
    let (bcx, bcy) = (i64::from(c.x - b.x), i64::from(c.y - b.y));
    abx * bcy - aby * bcx
}

fn normalize_degrees(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(180.0);
    if wrapped >= 180.0 - 1e-9 { 0.0 } else { wrapped }
}
