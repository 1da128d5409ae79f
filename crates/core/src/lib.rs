//! Domain layer for custom-domain ownership verification.
//!
//! Everything in this crate is free of I/O: the challenge state machine, the
//! retry policy, proof target derivation and the collaborator traits that the
//! storage and probe crates implement.

pub mod policy;
pub mod ports;
pub mod target;
pub mod types;

pub use policy::RetryPolicy;
pub use target::{Evidence, Instructions, ProbeFailure, ProofTarget};
pub use types::{
    Alert, AlertEvent, AlertPayload, Challenge, ChallengeStatus, DomainMapping, ParseEnumError,
    PropagationState, ProofEnvelope, ProviderEvent, Severity, Transition, TransitionRejected,
    VerificationMethod,
};
