//! Ramp solver benchmarks. The meet-velocity iteration is the most
//! expensive call on the forward-planning path; keep an eye on it.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use motion::buffer::{Block, BlockKind};
use motion::zoid::{calculate_ramps, RuntimeBlock};
use motion::JERK_MULTIPLIER;

fn make_block(length: f32, jerk_m: f32) -> Block {
    let jerk = jerk_m * JERK_MULTIPLIER;
    let q: f32 = 2.402_811_4;
    Block {
        kind: BlockKind::Aline,
        length,
        jerk,
        recip_jerk: 1.0 / jerk,
        sqrt_j: jerk.sqrt(),
        q_recip_2_sqrt_j: q / (2.0 * jerk.sqrt()),
        cruise_vmax: 4000.0,
        cruise_velocity: 4000.0,
        exit_vmax: 800.0,
        exit_velocity: 800.0,
        ..Default::default()
    }
}

fn bench_ramps(c: &mut Criterion) {
    c.bench_function("ramps/asymmetric_bump_with_body", |b| {
        b.iter(|| {
            let mut bf = make_block(black_box(80.0), 50.0);
            let mut block = RuntimeBlock::default();
            let mut entry_changed = false;
            calculate_ramps(&mut block, &mut bf, black_box(200.0), &mut entry_changed);
            black_box(block.cruise_velocity)
        })
    });

    c.bench_function("ramps/meet_velocity_short_move", |b| {
        b.iter(|| {
            let mut bf = make_block(black_box(0.8), 50.0);
            let mut block = RuntimeBlock::default();
            let mut entry_changed = false;
            calculate_ramps(&mut block, &mut bf, black_box(350.0), &mut entry_changed);
            black_box(block.cruise_velocity)
        })
    });
}

criterion_group!(benches, bench_ramps);
criterion_main!(benches);
