//! The fraud-proof core: state materialization, step tracing, and one-step
//! proof generation.

pub mod error;
pub mod osp;
pub mod state;
pub mod states;
pub mod tracer;

pub use error::ProofError;
pub use osp::{generate_proof, OneStepProof, VerificationContext, VerifierType};
pub use state::{BlockHashTree, BlockState, InterState, IntraState, StateType};
pub use states::{generate_states, ExecutionState, ProverConfig};
pub use tracer::{IntraStateGenerator, OneStepProver, StepRecord, StepTracer, StepWitness, VmStep};
