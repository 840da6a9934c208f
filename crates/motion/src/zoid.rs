//! Ramp ("zoid") solver: turns entry/cruise/exit velocity constraints into
//! head/body/tail section lengths and times for one block.
//!
//! The name survives from trapezoid planning; the actual velocity curves are
//! quintic Bezier polynomials that the executor plays out by forward
//! differencing. The solver cares about length accuracy first and velocity
//! accuracy second, as long as jerk is never exceeded.
//!
//! Case order matters: perfect-fit cases that back-planning already proved
//! are taken on faith unless the entry velocity changed; everything else
//! falls through to the meet-velocity iteration.

use tracing::trace;

use crate::buffer::{Block, BlockKind, Hint};
use crate::{fp_eq, fp_zero, EPSILON};

/// A solved ramp: the runtime's view of one block. Two of these exist, the
/// run block and the planning block, swapped at move boundaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeBlock {
    pub head_length: f32,
    pub body_length: f32,
    pub tail_length: f32,
    pub head_time: f32,
    pub body_time: f32,
    pub tail_time: f32,
    pub cruise_velocity: f32,
    pub exit_velocity: f32,
}

impl RuntimeBlock {
    pub fn clear(&mut self) {
        *self = RuntimeBlock::default();
    }

    pub fn total_length(&self) -> f32 {
        self.head_length + self.body_length + self.tail_length
    }

    pub fn total_time(&self) -> f32 {
        self.head_time + self.body_time + self.tail_time
    }
}

/// Jerk-limited distance needed to move between `v_0` and `v_1`.
///
/// L = q/(2 sqrt(j)) * sqrt(|v_1 - v_0|) * (v_1 + v_0), with the constant
/// folded into the block at ingest.
#[inline]
pub fn target_length(v_0: f32, v_1: f32, bf: &Block) -> f32 {
    bf.q_recip_2_sqrt_j * (v_1 - v_0).abs().sqrt() * (v_1 + v_0)
}

/// Velocity reached *accelerating* from `v_0` over length `l` at the block's
/// jerk. Closed-form (monotonic) solution of the length formula.
pub fn target_velocity(v_0: f32, l: f32, bf: &Block) -> f32 {
    if fp_zero(l) {
        return 0.0;
    }
    let j = bf.jerk;

    const A80: f32 = 7.698_003_6; // 80 * a, a = 1/(10*27)
    const A_2: f32 = 0.009_259_259; // a^2

    let v_0_2 = v_0 * v_0;
    let v_0_3 = v_0_2 * v_0;
    let l_2 = l * l;

    let b_part1 = 9.0 * j * l_2;
    let b_part2 = A80 * v_0_3;

    // b^3 = a^2 (3 L sqrt(j (2 b_part2 + b_part1)) + b_part2 + b_part1)
    let b_cubed = A_2 * (3.0 * l * (j * (2.0 * b_part2 + b_part1)).sqrt() + b_part2 + b_part1);
    let b = b_cubed.cbrt();

    const CONST1A: f32 = 0.829_242_3; // 4 * 10^(1/3) * a
    const CONST2A: f32 = 4.823_680_6; // 1 / (10^(1/3) * a)
    const THIRD: f32 = 1.0 / 3.0;

    let v_1 = THIRD * ((CONST1A * v_0_2) / b + b * CONST2A - v_0);
    v_1.abs()
}

/// Velocity reached *decelerating* from `v_0` over length `l`.
///
/// This side needs root finding: the cubic has three solutions, one of which
/// is the acceleration case. The search seeds at zero; if the first pass
/// overshoots it restarts from just below `v_0`. Returns a negative value if
/// no deceleration solution exists in the length.
pub fn decel_velocity(v_0: f32, l: f32, bf: &Block) -> f32 {
    let q_recip_2_sqrt_j = bf.q_recip_2_sqrt_j;

    let mut v_1: f32 = 0.0;
    let mut first_pass = true;

    let mut i = 0;
    while i < 10 {
        i += 1;
        let sqrt_delta = (v_0 - v_1).max(0.0).sqrt();
        let l_t = q_recip_2_sqrt_j * (sqrt_delta * (v_1 + v_0)) - l;

        if l_t.abs() < 0.00001 {
            break;
        }
        // Testing velocity 0 first: if that already produces too much
        // length, the root lives near v_0 instead.
        if first_pass && l_t > 0.0 {
            first_pass = false;
            v_1 = v_0 - 0.001;
            continue;
        }
        first_pass = false;

        let v_1x3 = 3.0 * v_1;
        let recip_l_t = (2.0 * sqrt_delta) / ((v_0 - v_1x3) * q_recip_2_sqrt_j);
        v_1 -= l_t * recip_l_t;
    }
    v_1
}

/// Find the meet velocity: the peak at which accelerating from `v_0` and
/// decelerating to `v_2` exactly consumes length `l`. Also writes the
/// head/tail/body lengths it discovered into `block`.
fn meet_velocity(v_0: f32, v_2: f32, l: f32, bf: &Block, block: &mut RuntimeBlock) -> f32 {
    let q_recip_2_sqrt_j = bf.q_recip_2_sqrt_j;

    // v_1 can never be below either endpoint.
    let min_v_1 = v_0.max(v_2);

    // Seed with the velocity reachable over half the length from the
    // higher endpoint.
    let mut v_1 = target_velocity(min_v_1, l / 2.0, bf);

    if fp_eq(v_0, v_2) {
        // Symmetric case: head roughly equals tail, no body. Returned
        // without iterating.
        block.head_length = l / 2.0;
        block.body_length = 0.0;
        block.tail_length = l - block.head_length;
        return v_1;
    }

    let mut i = 0;
    while i < 30 {
        i += 1;
        if v_1 < min_v_1 {
            // No meet exists: an inversion in the velocities of a very
            // short move. Compute the head OR tail, and the rest cruises.
            v_1 = min_v_1;

            if v_0 < v_2 {
                // acceleration: head/body
                block.head_length = target_length(v_0, v_2, bf);
                if block.head_length > l {
                    block.head_length = l;
                    block.body_length = 0.0;
                    v_1 = target_velocity(v_0, l, bf);
                } else {
                    block.body_length = l - block.head_length;
                }
                block.tail_length = 0.0;
            } else {
                // deceleration: tail/body
                block.tail_length = target_length(v_2, v_0, bf);
                if block.tail_length > l {
                    block.tail_length = l;
                    block.body_length = 0.0;
                    v_1 = target_velocity(v_2, l, bf);
                } else {
                    block.body_length = l - block.tail_length;
                }
                block.head_length = 0.0;
            }
            break;
        }

        // Keep the two length terms separate so the head/tail lengths can
        // be stored as-is, at the cost of one multiply per iteration.
        let sqrt_delta_v_0 = (v_1 - v_0).abs().sqrt();
        let sqrt_delta_v_2 = (v_1 - v_2).abs().sqrt();

        let l_h = q_recip_2_sqrt_j * (sqrt_delta_v_0 * (v_1 + v_0));
        let l_t = q_recip_2_sqrt_j * (sqrt_delta_v_2 * (v_1 + v_2));
        let l_c = (l_h + l_t) - l;

        block.head_length = l_h;
        block.tail_length = l_t;
        block.body_length = 0.0;

        // Allow 0.00001 of overlap, or up to a 1mm gap made up by a body /
        // an extended tail. The lengths must never add up to *more* than
        // the block.
        if l_c < 0.00001 && l_c > -1.0 {
            if l_c < 0.0 {
                block.body_length = -l_c;
            } else {
                block.tail_length = l - block.head_length;
            }
            break;
        }

        let v_1x3 = 3.0 * v_1;
        let recip_l_d = (2.0 * sqrt_delta_v_0 * sqrt_delta_v_2)
            / ((sqrt_delta_v_0 * (v_1x3 - v_2) - (v_0 - v_1x3) * sqrt_delta_v_2)
                * q_recip_2_sqrt_j);

        v_1 -= l_c * recip_l_d;
    }
    trace!(iterations = i, v_1, "meet velocity");
    v_1
}

/// Compute the ramp for `bf` given the actual entry velocity.
///
/// Writes the solved sections into `block` (the planning runtime block) and
/// may rewrite `bf.hint` and `bf.block_time`. `entry_changed` carries the
/// "this block's entry is lower than its hint assumed" flag between
/// adjacent blocks during forward planning.
pub fn calculate_ramps(
    block: &mut RuntimeBlock,
    bf: &mut Block,
    entry_velocity: f32,
    entry_changed: &mut bool,
) {
    if !bf.kind.is_move() {
        bf.hint = Hint::CommandBlock;
        return;
    }

    block.head_time = 0.0;
    block.body_time = 0.0;
    block.tail_time = 0.0;
    block.head_length = 0.0;
    block.body_length = 0.0;
    block.tail_length = 0.0;

    block.cruise_velocity = bf.cruise_velocity.min(bf.cruise_vmax);
    block.exit_velocity = bf.exit_velocity.min(bf.exit_vmax);

    // *** Perfect-fit cases: curve fitting already done by back-planning ***

    // PERFECT_CRUISE was hinted without knowledge of the previous exit;
    // verify it still holds moving forward. If so the ramp is flat.
    if bf.hint == Hint::PerfectCruise {
        if !*entry_changed && fp_eq(entry_velocity, bf.cruise_vmax) {
            // Pin both ends to the entry so EQ tolerances wash out.
            block.exit_velocity = entry_velocity;
            block.cruise_velocity = entry_velocity;

            block.body_length = bf.length;
            block.body_time = block.body_length / block.cruise_velocity;
            bf.block_time = block.body_time;
            return;
        }
        bf.hint = Hint::MixedAcceleration;
    }

    if entry_velocity > block.exit_velocity {
        // We're in a deceleration.
        if *entry_changed {
            // The entry is lower than the hints assumed. A deceleration
            // never becomes an acceleration post-hinting, but it will
            // likely grow a head section now.
            bf.hint = Hint::AsymmetricBump;
        } else if bf.hint == Hint::MixedDeceleration {
            // 2-section body+tail deceleration; only valid if the entry is
            // exactly what back-planning saw.
            block.tail_length = target_length(block.exit_velocity, block.cruise_velocity, bf);
            block.body_length = bf.length - block.tail_length;
            block.head_length = 0.0;

            block.body_time = block.body_length / block.cruise_velocity;
            block.tail_time =
                block.tail_length * 2.0 / (block.exit_velocity + block.cruise_velocity);
            bf.block_time = block.body_time + block.tail_time;
            return;
        } else if bf.hint == Hint::PerfectDeceleration {
            // Single full-length tail.
            block.tail_length = bf.length;
            block.cruise_velocity = entry_velocity;
            block.tail_time =
                block.tail_length * 2.0 / (block.exit_velocity + block.cruise_velocity);
            bf.block_time = block.tail_time;
            return;
        }
        // Decelerations don't change the next block's entry.
        *entry_changed = false;
    } else {
        // Back-planning hints only predict decel and cruise; ignore them
        // here and test what acceleration actually achieves.
        let accel_velocity = target_velocity(entry_velocity, bf.length, bf);

        if accel_velocity < block.exit_velocity {
            // Still accelerating at the end: full-length head, and the next
            // block's entry just dropped.
            *entry_changed = true;

            bf.hint = Hint::PerfectAcceleration;
            block.exit_velocity = accel_velocity;
            block.cruise_velocity = accel_velocity;
            block.head_length = bf.length;
            block.head_time =
                block.head_length * 2.0 / (entry_velocity + block.cruise_velocity);
            bf.block_time = block.head_time;
            return;
        }

        // Hit the cusp.
        *entry_changed = false;
        block.cruise_velocity = bf.cruise_vmax;

        if block.cruise_velocity <= block.exit_velocity {
            // Exit is at or above cruise_vmax: clamp exit, head+body.
            block.exit_velocity = bf.cruise_vmax;
            bf.hint = Hint::MixedAcceleration;

            block.head_length = target_length(entry_velocity, block.cruise_velocity, bf);
            block.body_length = bf.length - block.head_length;
            block.tail_length = 0.0;
            block.head_time =
                block.head_length * 2.0 / (entry_velocity + block.cruise_velocity);
            block.body_time = block.body_length / block.cruise_velocity;
            bf.block_time = block.head_time + block.body_time;
            return;
        }
        // Otherwise we'll have a head section: fall through as a bump.
        bf.hint = Hint::AsymmetricBump;
    }

    // *** Requested-fit case: is there room for a body at cruise_vmax? ***
    block.head_length = target_length(entry_velocity, block.cruise_velocity, bf);
    block.tail_length = target_length(block.exit_velocity, block.cruise_velocity, bf);

    if (bf.length - 0.0001) > (block.head_length + block.tail_length) {
        // 3-section move; body guaranteed positive.
        block.body_length = bf.length - (block.head_length + block.tail_length);

        block.head_time = block.head_length * 2.0 / (entry_velocity + block.cruise_velocity);
        block.body_time = block.body_length / block.cruise_velocity;
        block.tail_time =
            block.tail_length * 2.0 / (block.exit_velocity + block.cruise_velocity);
        bf.block_time = block.head_time + block.body_time + block.tail_time;
        bf.hint = Hint::AsymmetricBump;
        return;
    }

    // *** Rate-limited case: solve for the meet velocity ***
    block.cruise_velocity = meet_velocity(entry_velocity, block.exit_velocity, bf.length, bf, block);
    bf.hint = Hint::AsymmetricBump;

    if !fp_zero(block.head_length) {
        block.head_time = block.head_length * 2.0 / (entry_velocity + block.cruise_velocity);
    }
    if !fp_zero(block.body_length) {
        block.body_time = block.body_length / block.cruise_velocity;
    }
    if !fp_zero(block.tail_length) {
        block.tail_time =
            block.tail_length * 2.0 / (block.exit_velocity + block.cruise_velocity);
    }
    bf.block_time = block.head_time + block.body_time + block.tail_time;

    debug_assert!(
        block.cruise_velocity > EPSILON,
        "zero cruise velocity out of meet-velocity solve"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JERK_MULTIPLIER;

    /// A block with the jerk derivatives filled in, the way aline does it.
    fn test_block(length: f32, jerk_m: f32) -> Block {
        let jerk = jerk_m * JERK_MULTIPLIER;
        let q: f32 = 2.402_811_4; // sqrt(10)/3^(1/4)
        Block {
            kind: BlockKind::Aline,
            length,
            jerk,
            recip_jerk: 1.0 / jerk,
            sqrt_j: jerk.sqrt(),
            q_recip_2_sqrt_j: q / (2.0 * jerk.sqrt()),
            ..Default::default()
        }
    }

    fn closure_error(block: &RuntimeBlock, length: f32) -> f32 {
        (block.total_length() - length).abs()
    }

    #[test]
    fn target_velocity_inverts_target_length() {
        let bf = test_block(10.0, 50.0);
        let v_1 = 3000.0;
        let l = target_length(0.0, v_1, &bf);
        let v_back = target_velocity(0.0, l, &bf);
        assert!((v_back - v_1).abs() / v_1 < 1e-3, "v_back = {v_back}");
    }

    #[test]
    fn decel_velocity_inverts_target_length() {
        let bf = test_block(10.0, 50.0);
        let v_0 = 2400.0;
        let v_1 = 800.0;
        let l = target_length(v_1, v_0, &bf);
        let v_found = decel_velocity(v_0, l, &bf);
        assert!((v_found - v_1).abs() < 1.0, "v_found = {v_found}");
    }

    #[test]
    fn perfect_cruise_is_body_only() {
        let mut bf = test_block(20.0, 50.0);
        bf.hint = Hint::PerfectCruise;
        bf.cruise_vmax = 1800.0;
        bf.cruise_velocity = 1800.0;
        bf.exit_velocity = 1800.0;
        bf.exit_vmax = 1800.0;
        let mut block = RuntimeBlock::default();
        let mut entry_changed = false;
        calculate_ramps(&mut block, &mut bf, 1800.0, &mut entry_changed);
        assert!(fp_zero(block.head_length));
        assert!(fp_zero(block.tail_length));
        assert!((block.body_length - 20.0).abs() < 1e-4);
        assert_eq!(bf.hint, Hint::PerfectCruise);
    }

    #[test]
    fn degraded_cruise_keeps_length_closure() {
        // entry changed under a PERFECT_CRUISE hint: must degrade and still
        // close the length
        let mut bf = test_block(20.0, 50.0);
        bf.hint = Hint::PerfectCruise;
        bf.cruise_vmax = 1800.0;
        bf.cruise_velocity = 1800.0;
        bf.exit_velocity = 1800.0;
        bf.exit_vmax = 1800.0;
        let mut block = RuntimeBlock::default();
        let mut entry_changed = true;
        calculate_ramps(&mut block, &mut bf, 900.0, &mut entry_changed);
        assert!(closure_error(&block, 20.0) < 1e-4);
        assert_ne!(bf.hint, Hint::PerfectCruise);
    }

    #[test]
    fn asymmetric_bump_with_body() {
        let mut bf = test_block(100.0, 50.0);
        bf.cruise_vmax = 3000.0;
        bf.cruise_velocity = 3000.0;
        bf.exit_velocity = 500.0;
        bf.exit_vmax = 500.0;
        let mut block = RuntimeBlock::default();
        let mut entry_changed = false;
        calculate_ramps(&mut block, &mut bf, 200.0, &mut entry_changed);
        assert!(block.head_length > 0.0);
        assert!(block.body_length > 0.0);
        assert!(block.tail_length > 0.0);
        assert!(closure_error(&block, 100.0) < 1e-4);
        assert!(block.cruise_velocity <= bf.cruise_vmax + 1e-2);
    }

    #[test]
    fn short_move_meets_below_cruise() {
        let mut bf = test_block(1.0, 50.0);
        bf.cruise_vmax = 6000.0;
        bf.cruise_velocity = 6000.0;
        bf.exit_velocity = 0.0;
        bf.exit_vmax = 0.0;
        let mut block = RuntimeBlock::default();
        let mut entry_changed = false;
        calculate_ramps(&mut block, &mut bf, 0.0, &mut entry_changed);
        assert!(block.cruise_velocity < 6000.0);
        assert!(closure_error(&block, 1.0) < 1e-4);
        // symmetric: no body worth speaking of
        assert!(block.body_length < 0.01);
    }

    #[test]
    fn pure_acceleration_lowers_next_entry() {
        let mut bf = test_block(2.0, 50.0);
        bf.cruise_vmax = 6000.0;
        bf.cruise_velocity = 6000.0;
        bf.exit_velocity = 6000.0;
        bf.exit_vmax = 6000.0;
        let mut block = RuntimeBlock::default();
        let mut entry_changed = false;
        calculate_ramps(&mut block, &mut bf, 0.0, &mut entry_changed);
        assert_eq!(bf.hint, Hint::PerfectAcceleration);
        assert!(entry_changed);
        assert!(block.exit_velocity < 6000.0);
        assert!((block.head_length - 2.0).abs() < 1e-4);
    }

    #[test]
    fn random_cases_close_length() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        for _ in 0..500 {
            let length = rng.gen_range(0.01_f32..200.0);
            let mut bf = test_block(length, rng.gen_range(10.0_f32..200.0));
            let cruise = rng.gen_range(100.0_f32..8000.0);
            bf.cruise_vmax = cruise;
            bf.cruise_velocity = cruise;
            let exit = rng.gen_range(0.0_f32..cruise);
            bf.exit_velocity = exit;
            bf.exit_vmax = exit;
            let entry = rng.gen_range(0.0_f32..cruise);
            let mut block = RuntimeBlock::default();
            let mut entry_changed = false;
            calculate_ramps(&mut block, &mut bf, entry, &mut entry_changed);
            assert!(
                closure_error(&block, length) < 1e-3,
                "length {length} entry {entry} exit {exit} cruise {cruise}: \
                 h {} b {} t {}",
                block.head_length,
                block.body_length,
                block.tail_length,
            );
        }
    }
}
