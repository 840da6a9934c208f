//! The planner queue: a fixed ring of move blocks.
//!
//! Blocks live in an arena indexed with modular arithmetic; "pointers" are
//! plain indices. The write cursor only advances on commit, the run cursor
//! only advances on free. Ownership of a block follows its state: the writer
//! (parser path) owns it until commit, the planner until it reaches
//! `Running`, the segment executor until it is freed.

use tracing::debug;

use crate::state::MoveState;
use crate::{Axes, AXES, PLANNER_BUFFER_POOL_SIZE};

/// Buffer life cycle. Strictly monotonic per block, modulo the cyclic reset
/// back to `Empty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum BufferState {
    #[default]
    Empty,
    /// Checked out by the writer, not yet in the queue.
    Initializing,
    /// Committed, vmaxes set, not yet back-planned.
    NotPlanned,
    /// Braking velocities propagated; ramp not yet computed.
    BackPlanned,
    /// Ramp computed; ready for the runtime.
    FullyPlanned,
    /// Owned by the segment executor. Only the feedhold reshape (at exec
    /// priority) may mutate length and exit-side velocities.
    Running,
}

/// What the block does when it reaches the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum BlockKind {
    #[default]
    Aline,
    Dwell {
        seconds: f32,
    },
    /// A synchronous command. The token indexes the host's command ring.
    Command {
        token: u32,
    },
}

impl BlockKind {
    pub fn is_move(&self) -> bool {
        matches!(self, BlockKind::Aline)
    }
}

/// Per-block runtime progress, owned by the segment executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunBlockState {
    #[default]
    Inactive,
    /// Ready to run (or reset for re-use after a hold).
    InitialAction,
    Active,
}

/// The planner's classification of a block's motion profile. Advisory:
/// forward planning may demote a hint when the entry velocity changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Hint {
    #[default]
    None,
    /// entry == exit == cruise_vmax; body only.
    PerfectCruise,
    /// Full-length head, deltaV equals what the length allows.
    PerfectAcceleration,
    /// Full-length tail from cruise to exit.
    PerfectDeceleration,
    /// head + body, entry below cruise_vmax.
    MixedAcceleration,
    /// body + tail, entry at cruise_vmax.
    MixedDeceleration,
    /// head + body + tail with differing entry/exit.
    AsymmetricBump,
    CommandBlock,
}

/// One planner queue element.
#[derive(Debug, Clone, Default)]
pub struct Block {
    /// Monotonic id assigned at commit; diagnostics only.
    pub id: u32,
    pub kind: BlockKind,
    pub state: BufferState,
    pub run_state: RunBlockState,
    pub hint: Hint,
    /// False once the block can no longer be improved by back-planning or
    /// has been forward planned.
    pub plannable: bool,

    pub gm: MoveState,
    pub unit: Axes,
    pub axis_flags: [bool; AXES],
    /// Move length in mm. Guaranteed > MIN_LENGTH_MOVE for alines.
    pub length: f32,
    /// Estimated block execution time, minutes.
    pub block_time: f32,

    // Jerk terms, computed once at ingest.
    pub jerk: f32,
    pub recip_jerk: f32,
    pub sqrt_j: f32,
    /// q / (2 sqrt(jerk)) where q = sqrt(10)/3^(1/4); the constant of the
    /// jerk-limited length formula.
    pub q_recip_2_sqrt_j: f32,

    // Velocity caps (mm/min).
    pub cruise_vset: f32,
    pub cruise_vmax: f32,
    pub absolute_vmax: f32,
    pub exit_vmax: f32,
    pub junction_vmax: f32,

    // Working velocities set by back-planning.
    pub cruise_velocity: f32,
    pub exit_velocity: f32,

    /// Unit vector retained from >= 0.5mm back, for junction analysis of
    /// strings of very short nearly-collinear moves.
    pub junction_unit: Axes,
    pub junction_length_since: f32,
}

impl Block {
    /// Reset everything but identity for reuse.
    fn clear(&mut self) {
        *self = Block::default();
    }
}

/// The ring of blocks plus its cursors and queue-report counters.
#[derive(Debug)]
pub struct PlannerQueue {
    blocks: Vec<Block>,
    /// Write cursor: next block to hand to a writer.
    w: usize,
    /// Run cursor: block currently owned by (or next for) the runtime.
    r: usize,
    available: usize,
    next_id: u32,

    // Queue report bookkeeping, drained by the reporter.
    pub report_requested: bool,
    pub buffers_added: u32,
    pub buffers_removed: u32,
}

impl Default for PlannerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PlannerQueue {
    pub fn new() -> Self {
        Self {
            blocks: vec![Block::default(); PLANNER_BUFFER_POOL_SIZE],
            w: 0,
            r: 0,
            available: PLANNER_BUFFER_POOL_SIZE,
            next_id: 1,
            report_requested: false,
            buffers_added: 0,
            buffers_removed: 0,
        }
    }

    /// Empty the queue. Position bookkeeping is the planner's job.
    pub fn flush(&mut self) {
        for b in &mut self.blocks {
            b.clear();
        }
        self.w = 0;
        self.r = 0;
        self.available = PLANNER_BUFFER_POOL_SIZE;
        // discarded blocks count as removed, keeping added - removed equal
        // to the (now zero) depth
        self.buffers_removed = self.buffers_added;
        self.report_requested = true;
    }

    #[inline]
    pub fn next(&self, index: usize) -> usize {
        (index + 1) % PLANNER_BUFFER_POOL_SIZE
    }

    #[inline]
    pub fn prev(&self, index: usize) -> usize {
        (index + PLANNER_BUFFER_POOL_SIZE - 1) % PLANNER_BUFFER_POOL_SIZE
    }

    #[inline]
    pub fn block(&self, index: usize) -> &Block {
        &self.blocks[index]
    }

    #[inline]
    pub fn block_mut(&mut self, index: usize) -> &mut Block {
        &mut self.blocks[index]
    }

    pub fn available(&self) -> usize {
        self.available
    }

    pub fn run_cursor(&self) -> usize {
        self.r
    }

    pub fn write_cursor(&self) -> usize {
        self.w
    }

    /// Check out the write block. Returns its index, or None if the ring is
    /// full (the dispatcher gate is supposed to prevent that).
    pub fn get_write(&mut self) -> Option<usize> {
        if self.blocks[self.w].state != BufferState::Empty {
            return None;
        }
        let idx = self.w;
        self.blocks[idx].clear();
        self.blocks[idx].state = BufferState::Initializing;
        self.available -= 1;
        Some(idx)
    }

    /// Return an uncommitted write block to the pool.
    pub fn unget_write(&mut self) {
        if self.blocks[self.w].state != BufferState::Empty {
            self.blocks[self.w].state = BufferState::Empty;
            self.available += 1;
        }
    }

    /// Commit the write block to the queue and advance the write cursor.
    ///
    /// The caller must NOT touch the block after committing: higher
    /// priority contexts may process and free it before this returns on a
    /// real machine.
    pub fn commit_write(&mut self, kind: BlockKind) {
        let idx = self.w;
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let block = &mut self.blocks[idx];
        block.kind = kind;
        block.id = id;
        block.run_state = RunBlockState::InitialAction;
        block.plannable = true;
        self.w = self.next(self.w);
        self.buffers_added += 1;
        self.report_requested = true;
        debug!(id, ?kind, index = idx, "block committed");
    }

    /// The run block, if anything is queued.
    pub fn run_index(&self) -> Option<usize> {
        if self.blocks[self.r].state == BufferState::Empty {
            None
        } else {
            Some(self.r)
        }
    }

    /// Free the run block and advance. Returns true if the queue emptied.
    /// Called only from exec-or-higher context.
    pub fn free_run(&mut self) -> bool {
        let r = self.r;
        self.r = self.next(self.r);
        self.blocks[r].clear();
        self.available += 1;
        self.buffers_removed += 1;
        self.report_requested = true;
        self.w == self.r
    }

    /// True if the next runnable buffer exists, i.e. motion has not stopped.
    pub fn has_runnable(&self) -> bool {
        self.blocks[self.r].state > BufferState::Empty
    }

    /// Structural audit of the ring: the non-empty region must be
    /// contiguous from r to w and the free count must match. Violations
    /// escalate to panic at the machine layer.
    pub fn audit(&self) -> Result<(), &'static str> {
        let mut idx = self.r;
        let mut used = 0;
        while self.blocks[idx].state != BufferState::Empty {
            used += 1;
            if used == PLANNER_BUFFER_POOL_SIZE {
                // completely full is legal; available must agree
                if self.available != 0 {
                    return Err("planner queue free count mismatch");
                }
                return Ok(());
            }
            idx = self.next(idx);
        }
        // everything from here to r must be empty
        let mut free = 0;
        while idx != self.r || free == 0 {
            if self.blocks[idx].state != BufferState::Empty {
                return Err("planner queue non-contiguous");
            }
            free += 1;
            if used + free == PLANNER_BUFFER_POOL_SIZE {
                break;
            }
            idx = self.next(idx);
        }
        if used + free != PLANNER_BUFFER_POOL_SIZE || free != self.available {
            return Err("planner queue free count mismatch");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_commit_run_free_round_trip() {
        let mut q = PlannerQueue::new();
        let idx = q.get_write().unwrap();
        q.block_mut(idx).length = 5.0;
        q.commit_write(BlockKind::Aline);
        assert_eq!(q.available(), PLANNER_BUFFER_POOL_SIZE - 1);

        let run = q.run_index().unwrap();
        assert_eq!(run, idx);
        assert!(q.free_run()); // queue emptied
        assert_eq!(q.available(), PLANNER_BUFFER_POOL_SIZE);
        assert!(q.audit().is_ok());
    }

    #[test]
    fn queue_fills_and_refuses() {
        let mut q = PlannerQueue::new();
        for _ in 0..PLANNER_BUFFER_POOL_SIZE {
            let idx = q.get_write().unwrap();
            let _ = idx;
            q.commit_write(BlockKind::Aline);
        }
        assert_eq!(q.available(), 0);
        assert!(q.get_write().is_none());
    }

    #[test]
    fn counter_law_added_minus_removed_is_depth() {
        let mut q = PlannerQueue::new();
        for _ in 0..10 {
            q.get_write().unwrap();
            q.commit_write(BlockKind::Aline);
        }
        for _ in 0..4 {
            q.free_run();
        }
        let depth = PLANNER_BUFFER_POOL_SIZE - q.available();
        assert_eq!((q.buffers_added - q.buffers_removed) as usize, depth);
        assert!(q.audit().is_ok());
    }
}
