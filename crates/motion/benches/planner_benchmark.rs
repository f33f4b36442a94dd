//! Benchmarks for the planner hot loop: per-step merge cost on both
//! geometries, with and without acceleration shaping.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use motion::kinematics::{CartesianParams, CoordMap, DeltaParams};
use motion::planner::{AxisPinMap, MotionPlanner};
use motion::profile::AccelProfile;
use motion::stepper::Endstop;
use motion::Xyze;
use sched::{EventTime, PinId};

struct Never;

impl Endstop for Never {
    fn is_triggered(&self) -> bool {
        false
    }
}

fn pins() -> [AxisPinMap; 4] {
    [
        AxisPinMap::new(PinId(2)),
        AxisPinMap::new(PinId(3)),
        AxisPinMap::new(PinId(4)),
        AxisPinMap::new(PinId(17)),
    ]
}

fn bench_cartesian(c: &mut Criterion) {
    c.bench_function("cartesian_10mm_diagonal", |b| {
        b.iter(|| {
            let map = CoordMap::cartesian(CartesianParams {
                steps_per_mm: [80.0, 80.0, 400.0, 500.0],
            });
            let mut planner: MotionPlanner<Never> =
                MotionPlanner::new(map, pins(), [None, None, None, None], AccelProfile::constant(1500.0));
            planner
                .move_to(
                    EventTime::from_micros(0),
                    Xyze::new(10.0, 10.0, 0.0, 0.5),
                    100.0,
                    0.1,
                    50.0,
                )
                .unwrap();
            let mut count = 0u32;
            while let Some(event) = planner.next_step() {
                black_box(event);
                count += 1;
            }
            count
        })
    });
}

fn bench_delta(c: &mut Criterion) {
    c.bench_function("delta_10mm_diagonal", |b| {
        b.iter(|| {
            let map = CoordMap::linear_delta(DeltaParams {
                radius: 100.0,
                rod_length: 200.0,
                home_height: 250.0,
                build_radius: 85.0,
                steps_per_mm: 100.0,
                steps_per_mm_e: 500.0,
                min_z: -2.0,
            });
            let mut planner: MotionPlanner<Never> =
                MotionPlanner::new(map, pins(), [None, None, None, None], AccelProfile::None);
            planner.set_position(Xyze::new(0.0, 0.0, 20.0, 0.0)).unwrap();
            planner
                .move_to(
                    EventTime::from_micros(0),
                    Xyze::new(10.0, -7.0, 21.0, 0.5),
                    100.0,
                    0.1,
                    50.0,
                )
                .unwrap();
            let mut count = 0u32;
            while let Some(event) = planner.next_step() {
                black_box(event);
                count += 1;
            }
            count
        })
    });
}

criterion_group!(benches, bench_cartesian, bench_delta);
criterion_main!(benches);
