//! Bird's-eye-view geometry for oriented boxes.
//!
//! Association scores box overlap on the ground plane: generate the
//! four planar corners of each oriented rectangle, intersect the two
//! convex polygons with Sutherland-Hodgman clipping, and take the
//! shoelace-area ratio. Also provides the normalised heading cost.

use std::f64::consts::PI;

use nalgebra::Vector2;

use crate::imm::StateVector;
use crate::math::angle_diff;

/// Polygon areas below this are treated as empty.
const AREA_EPS: f64 = 1e-9;

/// Planar corners of an oriented rectangle.
///
/// Corner order is `(+l/2, +w/2), (+l/2, -w/2), (-l/2, -w/2),
/// (-l/2, +w/2)` rotated by `yaw` and translated to `(x, y)`. The
/// order is part of the contract: clipping assumes a consistent
/// winding.
pub fn box_corners_xy(x: f64, y: f64, yaw: f64, l: f64, w: f64) -> [Vector2<f64>; 4] {
    let (s, c) = yaw.sin_cos();
    let dx = l / 2.0;
    let dy = w / 2.0;
    [(dx, dy), (dx, -dy), (-dx, -dy), (-dx, dy)]
        .map(|(lx, ly)| Vector2::new(x + c * lx - s * ly, y + s * lx + c * ly))
}

/// True when `p` lies on the inner half-plane of the directed edge
/// `e1 -> e2` (boundary inclusive).
fn inside(p: Vector2<f64>, e1: Vector2<f64>, e2: Vector2<f64>) -> bool {
    (e2.x - e1.x) * (p.y - e1.y) - (e2.y - e1.y) * (p.x - e1.x) >= 0.0
}

/// Intersection of segment `s -> e` with the infinite line through
/// `cp1 -> cp2`. A near-parallel pair falls back to `e` instead of
/// dividing by a vanishing denominator.
fn edge_intersection(
    s: Vector2<f64>,
    e: Vector2<f64>,
    cp1: Vector2<f64>,
    cp2: Vector2<f64>,
) -> Vector2<f64> {
    let dc = cp1 - cp2;
    let dp = s - e;
    let n1 = cp1.x * cp2.y - cp1.y * cp2.x;
    let n2 = s.x * e.y - s.y * e.x;
    let denom = dc.x * dp.y - dc.y * dp.x;
    if denom.abs() < 1e-9 {
        return e;
    }
    Vector2::new((n1 * dp.x - n2 * dc.x) / denom, (n1 * dp.y - n2 * dc.y) / denom)
}

/// Sutherland-Hodgman clipping of `subject` against a convex `clip`
/// polygon traversed in the order given.
pub fn polygon_clip(subject: &[Vector2<f64>], clip: &[Vector2<f64>]) -> Vec<Vector2<f64>> {
    let mut output: Vec<Vector2<f64>> = subject.to_vec();
    if clip.is_empty() {
        return output;
    }

    let mut cp1 = clip[clip.len() - 1];
    for &cp2 in clip {
        let input = output;
        if input.is_empty() {
            return Vec::new();
        }
        let mut clipped = Vec::with_capacity(input.len() + 1);
        let mut s = input[input.len() - 1];
        for &e in &input {
            if inside(e, cp1, cp2) {
                if !inside(s, cp1, cp2) {
                    clipped.push(edge_intersection(s, e, cp1, cp2));
                }
                clipped.push(e);
            } else if inside(s, cp1, cp2) {
                clipped.push(edge_intersection(s, e, cp1, cp2));
            }
            s = e;
        }
        output = clipped;
        cp1 = cp2;
    }
    output
}

/// Shoelace area; 0 for fewer than three vertices.
pub fn polygon_area(poly: &[Vector2<f64>]) -> f64 {
    if poly.len() < 3 {
        return 0.0;
    }
    let mut acc = 0.0;
    for i in 0..poly.len() {
        let j = (i + 1) % poly.len();
        acc += poly[i].x * poly[j].y - poly[j].x * poly[i].y;
    }
    0.5 * acc.abs()
}

/// Intersection-over-union of two 9-state boxes projected onto the
/// ground plane. Only `(x, y, yaw, l, w)` of each state participates.
pub fn bev_iou(a: &StateVector, b: &StateVector) -> f64 {
    let pa = box_corners_xy(a[0], a[1], a[4], a[6], a[7]);
    let pb = box_corners_xy(b[0], b[1], b[4], b[6], b[7]);
    let intersection = polygon_area(&polygon_clip(&pa, &pb));
    if intersection <= 0.0 {
        return 0.0;
    }
    let union = polygon_area(&pa) + polygon_area(&pb) - intersection;
    if union <= AREA_EPS {
        return 0.0;
    }
    intersection / union
}

/// Heading disagreement normalised to [0, 1]: half a turn costs 1.
pub fn yaw_cost(a: f64, b: f64) -> f64 {
    (angle_diff(a, b).abs() / PI).min(1.0)
}
