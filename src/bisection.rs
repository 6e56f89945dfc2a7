//! Bisection responder.
//!
//! Given the local state vector and the segment posted in a `Bisected`
//! event, decides the next protocol move: bisect the half that contains the
//! disagreement, or collapse to a one-step proof when the segment is down to
//! one or two transitions.
//!
//! The midpoint conventions (`mid_offset` rounds up, `half_length` rounds
//! down) mirror the on-chain Challenge contract and must not drift from it.

use alloy_primitives::B256;
use thiserror::Error;

use crate::contracts::challenge::BisectedEvent;
use crate::proof::ExecutionState;

/// Errors of the responder decision.
#[derive(Debug, Error)]
pub enum BisectionError {
    /// The event's segment does not fit the local state vector.
    #[error(
        "challenged segment [{segment_start}, +{segment_length}] outside state vector of length {states}"
    )]
    OutOfRange {
        /// Segment start from the event.
        segment_start: u64,
        /// Segment length from the event.
        segment_length: u64,
        /// Local state vector length.
        states: usize,
    },

    /// Local states agree with every posted state; nothing to respond to.
    #[error("no difference between local states and challenged segment")]
    NoDifference,

    /// The event carries a degenerate segment length.
    #[error("illegal challenged segment length {0}")]
    IllegalSegment(u64),
}

/// The responder's chosen move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BisectionMove {
    /// Post a narrowed segment.
    Bisect {
        /// `[segment start, local midpoint of the new segment, segment end]`.
        bisection: [B256; 3],
        /// 1 when the left half is challenged, 2 for the right half.
        challenge_index: u64,
        /// Start of the new segment in state-vector coordinates.
        new_start: u64,
        /// Length of the new segment.
        new_length: u64,
    },
    /// Submit a one-step proof.
    OneStep {
        /// Index into the state vector of the transition's start state.
        state_index: usize,
        /// Which posted state differed: 0 start, 1 mid, 2 end.
        step_index: u64,
    },
}

/// Half length of a challenged segment, rounded down.
pub fn half_length(segment_length: u64) -> u64 {
    segment_length / 2
}

/// Offset of a segment's midpoint from its start, rounded up.
pub fn mid_offset(segment_length: u64) -> u64 {
    segment_length / 2 + segment_length % 2
}

fn mid_state(states: &[ExecutionState], segment_start: u64, segment_length: u64) -> B256 {
    states[(segment_start + mid_offset(segment_length)) as usize].hash()
}

/// Decides the response to a `Bisected` event.
pub fn respond(
    states: &[ExecutionState],
    ev: &BisectedEvent,
) -> Result<BisectionMove, BisectionError> {
    let segment_start = ev.segment_start;
    let segment_length = ev.segment_length;

    if segment_start + segment_length >= states.len() as u64 {
        return Err(BisectionError::OutOfRange {
            segment_start,
            segment_length,
            states: states.len(),
        });
    }
    if segment_length == 0 {
        return Err(BisectionError::IllegalSegment(segment_length));
    }

    let start_state = states[segment_start as usize].hash();
    let local_mid = mid_state(states, segment_start, segment_length);
    let end_state = states[(segment_start + segment_length) as usize].hash();

    if segment_length >= 3 {
        let new_length = half_length(segment_length);
        if local_mid != ev.mid_state {
            // Disagreement in the left half.
            let new_start = segment_start;
            Ok(BisectionMove::Bisect {
                bisection: [
                    start_state,
                    mid_state(states, new_start, new_length),
                    local_mid,
                ],
                challenge_index: 1,
                new_start,
                new_length,
            })
        } else {
            // Midpoint agrees, so the fault is in the right half.
            let new_start = segment_start + mid_offset(segment_length);
            Ok(BisectionMove::Bisect {
                bisection: [
                    local_mid,
                    mid_state(states, new_start, new_length),
                    end_state,
                ],
                challenge_index: 2,
                new_start,
                new_length,
            })
        }
    } else {
        // One or two transitions left: locate the differing state and go to
        // a single step.
        if start_state != ev.start_state {
            Ok(BisectionMove::OneStep {
                state_index: segment_start as usize,
                step_index: 0,
            })
        } else if local_mid != ev.mid_state {
            Ok(BisectionMove::OneStep {
                state_index: (segment_start + mid_offset(segment_length)) as usize,
                step_index: 1,
            })
        } else if end_state != ev.end_state {
            Ok(BisectionMove::OneStep {
                state_index: (segment_start + segment_length) as usize,
                step_index: 2,
            })
        } else {
            Err(BisectionError::NoDifference)
        }
    }
}
