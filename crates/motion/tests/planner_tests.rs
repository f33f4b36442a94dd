//! Planner scenario tests: golden event counts, timing and state transitions
//! for representative moves on both machine geometries.

use std::cell::Cell;

use motion::kinematics::{CartesianParams, CoordMap, DeltaParams};
use motion::planner::{AxisPinMap, MotionPlanner};
use motion::profile::AccelProfile;
use motion::stepper::Endstop;
use motion::Xyze;
use sched::{EventTime, Level, OutputEvent, PinId};

/// Endstop stub that reads untriggered for its first `trigger_at` polls.
struct TriggerAfter {
    reads: Cell<u32>,
    trigger_at: u32,
}

impl TriggerAfter {
    fn new(trigger_at: u32) -> Self {
        Self {
            reads: Cell::new(0),
            trigger_at,
        }
    }
}

impl Endstop for TriggerAfter {
    fn is_triggered(&self) -> bool {
        let n = self.reads.get();
        self.reads.set(n + 1);
        n >= self.trigger_at
    }
}

/// An endstop that never triggers (placeholder for axes we don't home in a
/// given test).
struct Never;

impl Endstop for Never {
    fn is_triggered(&self) -> bool {
        false
    }
}

const X_PIN: PinId = PinId(2);
const Y_PIN: PinId = PinId(3);
const Z_PIN: PinId = PinId(4);
const E_PIN: PinId = PinId(17);

fn pins() -> [AxisPinMap; 4] {
    [
        AxisPinMap::new(X_PIN),
        AxisPinMap::new(Y_PIN),
        AxisPinMap::new(Z_PIN),
        AxisPinMap::new(E_PIN),
    ]
}

fn cartesian_planner<E: Endstop>(
    endstops: [Option<E>; 4],
    accel: AccelProfile,
) -> MotionPlanner<E> {
    let map = CoordMap::cartesian(CartesianParams {
        steps_per_mm: [100.0; 4],
    });
    MotionPlanner::new(map, pins(), endstops, accel)
}

fn delta_planner<E: Endstop>(endstops: [Option<E>; 4], accel: AccelProfile) -> MotionPlanner<E> {
    let map = CoordMap::linear_delta(DeltaParams {
        radius: 100.0,
        rod_length: 200.0,
        home_height: 250.0,
        build_radius: 85.0,
        steps_per_mm: 100.0,
        steps_per_mm_e: 100.0,
        min_z: -2.0,
    });
    MotionPlanner::new(map, pins(), endstops, accel)
}

fn drain<E: Endstop>(planner: &mut MotionPlanner<E>) -> Vec<OutputEvent> {
    let mut events = Vec::new();
    while let Some(event) = planner.next_step() {
        events.push(event);
        assert!(events.len() < 2_000_000, "runaway event stream");
    }
    events
}

fn events_for(events: &[OutputEvent], pin: PinId) -> Vec<OutputEvent> {
    events.iter().copied().filter(|e| e.pin == pin).collect()
}

#[test]
fn cartesian_unit_move_produces_exact_step_train() {
    let mut planner = cartesian_planner::<Never>([None, None, None, None], AccelProfile::None);
    planner
        .move_to(
            EventTime::from_micros(0),
            Xyze::new(1.0, 0.0, 0.0, 0.0),
            10.0,
            0.1,
            50.0,
        )
        .unwrap();
    assert!(!planner.ready_for_next_move());

    let events = drain(&mut planner);
    assert_eq!(events.len(), 100);
    assert!(events.iter().all(|e| e.pin == X_PIN));
    assert!(events.iter().all(|e| e.level == Level::High));
    // 1000 steps/s: one event per millisecond, inclusive of the endpoint.
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.time.as_micros(), (i as u64 + 1) * 1_000);
    }
    assert!(planner.ready_for_next_move());
    assert_eq!(planner.mechanical_position(), [100, 0, 0, 0]);
}

#[test]
fn event_times_are_non_decreasing() {
    let mut planner = cartesian_planner::<Never>([None, None, None, None], AccelProfile::None);
    planner
        .move_to(
            EventTime::from_micros(500),
            Xyze::new(2.0, 1.0, 0.3, 0.1),
            20.0,
            0.1,
            50.0,
        )
        .unwrap();
    let events = drain(&mut planner);
    assert!(!events.is_empty());
    for pair in events.windows(2) {
        assert!(pair[1].time >= pair[0].time);
    }
    // Per-axis totals match the mechanical displacement.
    assert_eq!(events_for(&events, X_PIN).len(), 200);
    assert_eq!(events_for(&events, Y_PIN).len(), 100);
    assert_eq!(events_for(&events, Z_PIN).len(), 30);
    assert_eq!(events_for(&events, E_PIN).len(), 10);
    assert_eq!(planner.mechanical_position(), [200, 100, 30, 10]);
}

#[test]
fn constant_acceleration_ramp_is_symmetric() {
    // 1 mm at vmax 10 mm/s with a = 100 mm/s²: a pure triangle profile.
    let mut planner =
        cartesian_planner::<Never>([None, None, None, None], AccelProfile::constant(100.0));
    planner
        .move_to(
            EventTime::from_micros(0),
            Xyze::new(1.0, 0.0, 0.0, 0.0),
            10.0,
            0.1,
            50.0,
        )
        .unwrap();
    let events = drain(&mut planner);
    assert_eq!(events.len(), 100);
    for pair in events.windows(2) {
        assert!(pair[1].time > pair[0].time);
    }
    // The apex sits at sqrt(2 * d/2 / a) scaled: source midpoint 0.05 s maps
    // to 0.1 s.
    let times: Vec<u64> = events.iter().map(|e| e.time.as_micros()).collect();
    assert!((times[49] as i64 - 100_000).abs() <= 2);
    // Ramps mirror each other about the apex.
    for k in 0..events.len() - 1 {
        let mirrored = times[k] as i64 + times[events.len() - 2 - k] as i64;
        assert!(
            (mirrored - 200_000).abs() <= 2,
            "pair {k} sums to {mirrored}"
        );
    }
    // First interval is the slowest, cruise-free.
    assert!(times[0] > times[50] - times[49]);
}

#[test]
fn delta_vertical_lift_moves_all_carriages_uniformly() {
    let mut planner = delta_planner::<Never>([None, None, None, None], AccelProfile::None);
    planner.set_position(Xyze::new(0.0, 0.0, 0.0, 0.0)).unwrap();
    let start = planner.mechanical_position();
    planner
        .move_to(
            EventTime::from_micros(0),
            Xyze::new(0.0, 0.0, 1.0, 0.0),
            5.0,
            0.1,
            50.0,
        )
        .unwrap();
    let events = drain(&mut planner);

    let a = events_for(&events, X_PIN);
    let b = events_for(&events, Y_PIN);
    let c = events_for(&events, Z_PIN);
    // All three carriages ride the same constraint for a centered lift, so
    // they step forward the same number of times. The starting carriage
    // height sits on the step grid while the 1 mm target need not, hence the
    // one-step tolerance on the count.
    assert_eq!(a.len(), b.len());
    assert_eq!(b.len(), c.len());
    assert!((99..=100).contains(&a.len()), "count = {}", a.len());
    assert!(events_for(&events, E_PIN).is_empty());
    assert!(events.iter().all(|e| e.level == Level::High));
    // Lock-step: the i-th steps coincide to within a microsecond.
    for i in 0..a.len() {
        let t = [
            a[i].time.as_micros() as i64,
            b[i].time.as_micros() as i64,
            c[i].time.as_micros() as i64,
        ];
        assert!(t.iter().max().unwrap() - t.iter().min().unwrap() <= 1);
    }
    let end = planner.mechanical_position();
    for axis in 0..3 {
        assert_eq!(end[axis] - start[axis], a.len() as i32);
    }
    // The effector landed within a step quantum of the 1 mm target.
    assert!((planner.position().z - 1.0).abs() < 0.011);
}

#[test]
fn extruder_only_move_on_delta_leaves_carriages_alone() {
    let mut planner = delta_planner::<Never>([None, None, None, None], AccelProfile::None);
    planner.set_position(Xyze::new(0.0, 0.0, 10.0, 0.0)).unwrap();
    let start = planner.mechanical_position();
    planner
        .move_to(
            EventTime::from_micros(0),
            Xyze::new(0.0, 0.0, 10.0, 1.0),
            5.0,
            0.1,
            2.0,
        )
        .unwrap();
    let events = drain(&mut planner);
    assert!(events.iter().all(|e| e.pin == E_PIN));
    assert_eq!(events.len(), 100);
    let end = planner.mechanical_position();
    assert_eq!(&end[..3], &start[..3]);
    assert_eq!(end[3] - start[3], 100);
    // Clamped to max_vel_e = 2 mm/s: 200 steps/s over 0.5 s.
    assert_eq!(events.last().unwrap().time.as_micros(), 500_000);
}

#[test]
fn homing_stops_at_endstop_and_adopts_home_position() {
    let endstops = [Some(TriggerAfter::new(37)), None, None, None];
    let mut planner = cartesian_planner(endstops, AccelProfile::None);
    let before = planner.mechanical_position();
    planner
        .home_endstops(EventTime::from_micros(0), 1.0)
        .unwrap();
    let events = drain(&mut planner);
    assert_eq!(events.len(), 37);
    assert!(events.iter().all(|e| e.pin == X_PIN));
    // 1 mm/s * 100 steps/mm: 10 ms per step.
    assert_eq!(events[0].time.as_micros(), 10_000);
    assert_eq!(events[36].time.as_micros(), 370_000);
    assert!(planner.ready_for_next_move());
    // The mechanical position is overwritten with the home pose.
    let map = CoordMap::cartesian(CartesianParams {
        steps_per_mm: [100.0; 4],
    });
    assert_eq!(planner.mechanical_position(), map.home_position(&before));
}

#[test]
fn homing_delta_sets_carriages_to_home_height() {
    let endstops = [
        Some(TriggerAfter::new(5)),
        Some(TriggerAfter::new(9)),
        Some(TriggerAfter::new(7)),
        None,
    ];
    let mut planner = delta_planner(endstops, AccelProfile::None);
    planner.set_position(Xyze::new(0.0, 0.0, 5.0, 2.0)).unwrap();
    let before = planner.mechanical_position();
    planner
        .home_endstops(EventTime::from_micros(0), 2.0)
        .unwrap();
    let events = drain(&mut planner);
    assert_eq!(events.len(), 5 + 9 + 7);
    let expect_carriage = ((250.0 + (200.0f64 * 200.0 - 100.0 * 100.0).sqrt()) * 100.0).ceil();
    let end = planner.mechanical_position();
    assert_eq!(end[0], expect_carriage as i32);
    assert_eq!(end[1], expect_carriage as i32);
    assert_eq!(end[2], expect_carriage as i32);
    // Homing does not touch the extruder count.
    assert_eq!(end[3], before[3]);
}

#[test]
fn move_while_busy_is_rejected() {
    let mut planner = cartesian_planner::<Never>([None, None, None, None], AccelProfile::None);
    planner
        .move_to(
            EventTime::from_micros(0),
            Xyze::new(1.0, 0.0, 0.0, 0.0),
            10.0,
            0.1,
            50.0,
        )
        .unwrap();
    let err = planner
        .move_to(
            EventTime::from_micros(0),
            Xyze::new(2.0, 0.0, 0.0, 0.0),
            10.0,
            0.1,
            50.0,
        )
        .unwrap_err();
    assert_eq!(err, motion::PlannerError::Busy);
    drain(&mut planner);
    assert!(planner.ready_for_next_move());
    planner
        .move_to(
            EventTime::from_micros(0),
            Xyze::new(2.0, 0.0, 0.0, 0.0),
            10.0,
            0.1,
            50.0,
        )
        .unwrap();
}

#[test]
fn delta_round_trip_lands_within_a_step_quantum() {
    let mut planner = delta_planner::<Never>([None, None, None, None], AccelProfile::None);
    planner.set_position(Xyze::new(0.0, 0.0, 20.0, 0.0)).unwrap();
    let target = Xyze::new(31.0, -14.0, 27.5, 0.0);
    planner
        .move_to(EventTime::from_micros(0), target, 40.0, 0.1, 50.0)
        .unwrap();
    drain(&mut planner);
    let reached = planner.position();
    // Quantum of the coarsest carriage: 1/100 mm, with the three-axis
    // coupling allowing a small multiple of it.
    assert!((reached.x - target.x).abs() < 0.05, "x = {}", reached.x);
    assert!((reached.y - target.y).abs() < 0.05, "y = {}", reached.y);
    assert!((reached.z - target.z).abs() < 0.05, "z = {}", reached.z);
}

#[test]
fn zero_length_move_is_a_no_op() {
    let mut planner = cartesian_planner::<Never>([None, None, None, None], AccelProfile::None);
    planner
        .move_to(
            EventTime::from_micros(0),
            Xyze::new(0.0, 0.0, 0.0, 0.0),
            10.0,
            0.1,
            50.0,
        )
        .unwrap();
    assert!(planner.ready_for_next_move());
    assert!(planner.next_step().is_none());
}
