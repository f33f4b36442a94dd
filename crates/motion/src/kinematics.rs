//! Coordinate maps: translating Cartesian space to mechanical step counts.
//!
//! Two machine geometries are supported. A Cartesian machine's motors map
//! one-to-one onto the x/y/z axes. A linear-delta machine has three carriages
//! riding vertical towers spaced 120 degrees apart on a circle of radius `r`,
//! each linked to the effector by a rod of length `L`; the effector position
//! is the intersection of the three spheres rooted at the carriages.
//!
//! Tower `w` sits at `(r sin θw, r cos θw)` for `θw ∈ {90°, 210°, 330°}`, so
//! carriage height `D` obeys
//!
//! ```text
//! (D - z)² + (x - r sin θw)² + (y - r cos θw)² = L²
//! ```

use tracing::trace;

use crate::{MechPosition, Xyze, AXIS_COUNT, EXTRUDER_AXIS};

/// Unit x/y tower offsets for `θ ∈ {90°, 210°, 330°}` as `(sin θ, cos θ)`.
pub const TOWER_OFFSETS: [(f64, f64); 3] = [
    (1.0, 0.0),
    (-0.5, -0.866_025_403_784_438_6),
    (-0.5, 0.866_025_403_784_438_6),
];

/// A static 3×3 bed-leveling transform, applied to `(x, y, z)` on the way
/// from logical Cartesian space to physical space. Row-major.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Matrix3(pub [[f64; 3]; 3]);

impl Matrix3 {
    pub const IDENTITY: Matrix3 = Matrix3([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);

    pub fn apply(&self, x: f64, y: f64, z: f64) -> (f64, f64, f64) {
        let m = &self.0;
        (
            m[0][0] * x + m[0][1] * y + m[0][2] * z,
            m[1][0] * x + m[1][1] * y + m[1][2] * z,
            m[2][0] * x + m[2][1] * y + m[2][2] * z,
        )
    }
}

impl Default for Matrix3 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Geometry of a Cartesian machine.
#[derive(Debug, Clone)]
pub struct CartesianParams {
    /// Steps per millimeter for each of x, y, z, e.
    pub steps_per_mm: [f64; AXIS_COUNT],
}

/// Geometry of a linear-delta machine. Lengths in millimeters.
#[derive(Debug, Clone)]
pub struct DeltaParams {
    /// Distance from the build-plate center to each tower.
    pub radius: f64,
    /// Length of the rods linking carriages to the effector.
    pub rod_length: f64,
    /// Effector height when all carriages sit at their endstops.
    pub home_height: f64,
    /// Radius of the usable build plate.
    pub build_radius: f64,
    /// Steps per millimeter of carriage travel (same for all three towers).
    pub steps_per_mm: f64,
    /// Steps per millimeter of filament for the extruder.
    pub steps_per_mm_e: f64,
    /// Lowest reachable z. Slightly negative is useful while tuning.
    pub min_z: f64,
}

impl DeltaParams {
    /// Vertical distance from a carriage to the effector when the effector is
    /// centered: `sqrt(L² - r²)`.
    fn center_drop(&self) -> f64 {
        (self.rod_length * self.rod_length - self.radius * self.radius).sqrt()
    }

    /// Carriage height with the effector homed: `h + sqrt(L² - r²)`.
    pub fn home_carriage_height(&self) -> f64 {
        self.home_height + self.center_drop()
    }
}

/// Maps between Cartesian `(x, y, z, e)` and mechanical step counts.
#[derive(Debug, Clone)]
pub enum CoordMap {
    Cartesian {
        params: CartesianParams,
        leveling: Matrix3,
    },
    LinearDelta {
        params: DeltaParams,
        leveling: Matrix3,
    },
}

impl CoordMap {
    pub fn cartesian(params: CartesianParams) -> Self {
        CoordMap::Cartesian {
            params,
            leveling: Matrix3::IDENTITY,
        }
    }

    pub fn linear_delta(params: DeltaParams) -> Self {
        CoordMap::LinearDelta {
            params,
            leveling: Matrix3::IDENTITY,
        }
    }

    pub fn with_leveling(mut self, matrix: Matrix3) -> Self {
        match &mut self {
            CoordMap::Cartesian { leveling, .. } | CoordMap::LinearDelta { leveling, .. } => {
                *leveling = matrix
            }
        }
        self
    }

    /// Steps per millimeter along a mechanical axis.
    pub fn steps_per_mm(&self, axis: usize) -> f64 {
        match self {
            CoordMap::Cartesian { params, .. } => params.steps_per_mm[axis],
            CoordMap::LinearDelta { params, .. } => {
                if axis == EXTRUDER_AXIS {
                    params.steps_per_mm_e
                } else {
                    params.steps_per_mm
                }
            }
        }
    }

    /// The mechanical position corresponding to the home pose. The extruder
    /// count is preserved: homing does not zero filament position.
    pub fn home_position(&self, current: &MechPosition) -> MechPosition {
        match self {
            CoordMap::Cartesian { .. } => [0, 0, 0, current[EXTRUDER_AXIS]],
            CoordMap::LinearDelta { params, .. } => {
                let carriage = (params.home_carriage_height() * params.steps_per_mm).ceil() as i32;
                [carriage, carriage, carriage, current[EXTRUDER_AXIS]]
            }
        }
    }

    /// Apply the static leveling transform to the Cartesian part of `pos`.
    pub fn apply_leveling(&self, pos: Xyze) -> Xyze {
        let leveling = match self {
            CoordMap::Cartesian { leveling, .. } | CoordMap::LinearDelta { leveling, .. } => {
                leveling
            }
        };
        let (x, y, z) = leveling.apply(pos.x, pos.y, pos.z);
        Xyze::new(x, y, z, pos.e)
    }

    /// Clamp a requested position into the machine's reachable workspace.
    ///
    /// Idempotent: `bound(bound(p)) == bound(p)`.
    pub fn bound(&self, pos: Xyze) -> Xyze {
        match self {
            CoordMap::Cartesian { .. } => pos,
            CoordMap::LinearDelta { params, .. } => {
                let z = pos.z.clamp(params.min_z, params.home_carriage_height());
                let mut x = pos.x;
                let mut y = pos.y;
                let r2 = x * x + y * y;
                let build2 = params.build_radius * params.build_radius;
                if r2 > build2 {
                    // Pull (x, y) radially onto the build-plate boundary.
                    let ratio = (build2 / r2).sqrt();
                    x *= ratio;
                    y *= ratio;
                }
                Xyze::new(x, y, z, pos.e)
            }
        }
    }

    /// Forward kinematics: mechanical step counts to Cartesian position.
    pub fn xyze_from_mechanical(&self, mech: &MechPosition) -> Xyze {
        match self {
            CoordMap::Cartesian { params, .. } => Xyze::new(
                mech[0] as f64 / params.steps_per_mm[0],
                mech[1] as f64 / params.steps_per_mm[1],
                mech[2] as f64 / params.steps_per_mm[2],
                mech[3] as f64 / params.steps_per_mm[3],
            ),
            CoordMap::LinearDelta { params, .. } => {
                let e = mech[EXTRUDER_AXIS] as f64 / params.steps_per_mm_e;
                let a = mech[0] as f64 / params.steps_per_mm;
                let b = mech[1] as f64 / params.steps_per_mm;
                let c = mech[2] as f64 / params.steps_per_mm;
                let (x, y, z) = delta_forward(params, a, b, c);
                Xyze::new(x, y, z, e)
            }
        }
    }

    /// Inverse kinematics: Cartesian position to mechanical step counts.
    ///
    /// The caller is responsible for bounding `pos` first; outside the
    /// reachable envelope the sphere equation has no real solution and the
    /// carriage heights come out NaN.
    pub fn mechanical_from_xyze(&self, pos: &Xyze) -> MechPosition {
        match self {
            CoordMap::Cartesian { params, .. } => [
                (pos.x * params.steps_per_mm[0]).round() as i32,
                (pos.y * params.steps_per_mm[1]).round() as i32,
                (pos.z * params.steps_per_mm[2]).round() as i32,
                (pos.e * params.steps_per_mm[3]).round() as i32,
            ],
            CoordMap::LinearDelta { params, .. } => {
                let mut mech = [0i32; AXIS_COUNT];
                for (axis, (sin_w, cos_w)) in TOWER_OFFSETS.iter().enumerate() {
                    let dx = pos.x - params.radius * sin_w;
                    let dy = pos.y - params.radius * cos_w;
                    let height =
                        pos.z + (params.rod_length * params.rod_length - dx * dx - dy * dy).sqrt();
                    mech[axis] = (height * params.steps_per_mm).round() as i32;
                }
                mech[EXTRUDER_AXIS] = (pos.e * params.steps_per_mm_e).round() as i32;
                mech
            }
        }
    }
}

/// Solve the three-sphere intersection for carriage heights `(a, b, c)` in mm.
///
/// The closed form divides by `b - c` and by `a - b`, so the two degenerate
/// poses need their own branches: all carriages level (effector centered) and
/// `b == c` (effector on the x axis, the plane of symmetry between towers B
/// and C).
fn delta_forward(params: &DeltaParams, a: f64, b: f64, c: f64) -> (f64, f64, f64) {
    let r = params.radius;
    let l = params.rod_length;
    if a == b && b == c {
        trace!(a, "delta forward: centered pose");
        return (0.0, 0.0, a - params.center_drop());
    }
    if b == c {
        trace!(a, b, "delta forward: b == c pose");
        let d = a - b;
        let ydiv = 2.0 * (4.0 * a * a - 8.0 * a * b + 4.0 * b * b + 9.0 * r * r);
        let ya = 2.0 * d * d * r;
        let yb = 4.0
            * (d * d
                * (-d.powi(4) + 4.0 * d * d * l * l
                    + 3.0 * (3.0 * l * l - 2.0 * d * d) * r * r
                    - 9.0 * r.powi(4)))
                .sqrt();
        let com1 = (yb / (d * ydiv)).abs();
        let com2 = ya / ydiv;
        let z = 0.5 * (a + b - 3.0 * r * (com2 / d + com1));
        let x = com2 + d * com1;
        return (x, 0.0, z);
    }
    // General pose. The z solution is the smaller root of the quadratic the
    // sphere system reduces to; x and y then follow linearly from z.
    let s = a * a + b * b - b * c + c * c - a * (b + c);
    let za = (b - c)
        * r
        * (2.0 * a.powi(3) - a * a * (b + c) - a * (b * b + c * c - 3.0 * r * r)
            + (b + c) * (2.0 * b * b - 3.0 * b * c + 2.0 * c * c + 3.0 * r * r));
    let zb = 3.0f64.sqrt()
        * (-((b - c)
            * (b - c)
            * r
            * r
            * ((a - b) * (a - b) * (a - c) * (a - c) * (b - c) * (b - c)
                + 3.0 * s * (s - 4.0 * l * l) * r * r
                + 9.0 * (2.0 * s - 3.0 * l * l) * r.powi(4)
                + 27.0 * r.powi(6))))
            .sqrt();
    let zdiv = (b - c) * r * (4.0 * s + 9.0 * r * r);
    let z = za / zdiv - (zb / zdiv).abs();
    let x = (2.0 * a * a - b * b - c * c - 4.0 * a * z + 2.0 * b * z + 2.0 * c * z) / (6.0 * r);
    let y = (c - b) * (b + c - 2.0 * z) / (2.0 * 3.0f64.sqrt() * r);
    (x, y, z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    fn delta() -> CoordMap {
        CoordMap::linear_delta(DeltaParams {
            radius: 100.0,
            rod_length: 200.0,
            home_height: 250.0,
            build_radius: 85.0,
            steps_per_mm: 100.0,
            steps_per_mm_e: 500.0,
            min_z: -2.0,
        })
    }

    #[test]
    fn cartesian_round_trip_is_exact() {
        let map = CoordMap::cartesian(CartesianParams {
            steps_per_mm: [80.0, 80.0, 400.0, 500.0],
        });
        let pos = Xyze::new(10.0, -5.5, 0.2, 3.0);
        let mech = map.mechanical_from_xyze(&pos);
        let back = map.xyze_from_mechanical(&mech);
        assert_approx_eq!(f64, back.x, pos.x, epsilon = 1e-9);
        assert_approx_eq!(f64, back.y, pos.y, epsilon = 1e-9);
        assert_approx_eq!(f64, back.z, pos.z, epsilon = 1e-9);
        assert_approx_eq!(f64, back.e, pos.e, epsilon = 1e-9);
    }

    #[test]
    fn delta_round_trip_within_step_quantum() {
        let map = delta();
        let quantum = 1.0 / 100.0;
        for &(x, y, z) in &[
            (0.0, 0.0, 10.0),
            (40.0, 0.0, 5.0),
            (0.0, 40.0, 5.0),
            (-33.0, 21.0, 80.0),
            (12.5, -64.0, 0.5),
        ] {
            let pos = Xyze::new(x, y, z, 0.0);
            let back = map.xyze_from_mechanical(&map.mechanical_from_xyze(&pos));
            assert!(
                (back.x - x).abs() < quantum
                    && (back.y - y).abs() < quantum
                    && (back.z - z).abs() < quantum,
                "({x}, {y}, {z}) round-tripped to ({}, {}, {})",
                back.x,
                back.y,
                back.z
            );
        }
    }

    #[test]
    fn delta_centered_pose_does_not_divide_by_zero() {
        let map = delta();
        let pos = map.xyze_from_mechanical(&[20_000, 20_000, 20_000, 0]);
        assert!(pos.x == 0.0 && pos.y == 0.0);
        assert!(pos.z.is_finite());
        // Carriages at 200mm, center drop is sqrt(200² - 100²).
        assert_approx_eq!(f64, pos.z, 200.0 - (30_000.0f64).sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn delta_b_equals_c_pose_lands_on_x_axis() {
        let map = delta();
        let pos = Xyze::new(25.0, 0.0, 30.0, 0.0);
        let mech = map.mechanical_from_xyze(&pos);
        assert_eq!(mech[1], mech[2]);
        let back = map.xyze_from_mechanical(&mech);
        assert!((back.x - 25.0).abs() < 0.01);
        assert!(back.y.abs() < 0.01);
        assert!((back.z - 30.0).abs() < 0.01);
    }

    #[test]
    fn delta_home_position_preserves_extruder() {
        let map = delta();
        let home = map.home_position(&[1, 2, 3, 777]);
        // ceil((250 + sqrt(200² - 100²)) * 100)
        let expect = ((250.0 + (30_000.0f64).sqrt()) * 100.0).ceil() as i32;
        assert_eq!(home, [expect, expect, expect, 777]);
    }

    #[test]
    fn bound_clamps_radially_and_is_idempotent() {
        let map = delta();
        let outside = Xyze::new(120.0, 90.0, 400.0, 1.0);
        let bounded = map.bound(outside);
        let radius = (bounded.x * bounded.x + bounded.y * bounded.y).sqrt();
        assert_approx_eq!(f64, radius, 85.0, epsilon = 1e-9);
        // Direction is preserved.
        assert_approx_eq!(f64, bounded.y / bounded.x, 90.0 / 120.0, epsilon = 1e-9);
        assert!(bounded.z <= 250.0 + (30_000.0f64).sqrt());
        let again = map.bound(bounded);
        assert_eq!(again, bounded);
    }

    #[test]
    fn bound_is_identity_for_cartesian() {
        let map = CoordMap::cartesian(CartesianParams {
            steps_per_mm: [100.0; 4],
        });
        let pos = Xyze::new(1e6, -1e6, 3.0, 9.0);
        assert_eq!(map.bound(pos), pos);
    }

    #[test]
    fn leveling_matrix_tilts_z() {
        let map = CoordMap::cartesian(CartesianParams {
            steps_per_mm: [100.0; 4],
        })
        .with_leveling(Matrix3([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.01, 0.0, 1.0]]));
        let leveled = map.apply_leveling(Xyze::new(10.0, 0.0, 1.0, 0.0));
        assert_approx_eq!(f64, leveled.z, 1.1, epsilon = 1e-12);
        assert_approx_eq!(f64, leveled.x, 10.0, epsilon = 1e-12);
    }
}
