//! # Classroom-Core
//!
//! Session layer for one-to-one live lessons between a teacher and a student.
//!
//! This crate provides:
//! - An access guard that admits only the scheduled participants
//! - A peer link orchestrator exchanging offers, answers and candidates over a relay
//! - Connection quality sampling with tiered classification
//! - Bounded automatic recovery plus manual retry
//! - Camera/microphone device management with remembered preferences
//! - Screen sharing that converges whether stopped here or from the platform UI
//!
//! ## Architecture
//!
//! [`ClassroomSession`] owns one participant's components. The orchestrator is
//! a single actor task; everything it, the quality monitor, the recovery
//! controller and the screen-share controller report flows through one
//! [`EventEmitter`](events::EventEmitter). The relay, peer transport, media
//! source and authorization service are traits with in-process implementations
//! for tests and simulation.

pub mod access;
pub mod classroom;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod media;
pub mod orchestrator;
pub mod peer;
pub mod quality;
pub mod recovery;
pub mod relay;
pub mod session;

pub use access::{AccessGuard, AccessOutcome, InMemoryClassroomBackend};
pub use classroom::{ClassroomDeps, ClassroomSession, JoinRequest};
pub use config::ClassroomConfig;
pub use error::{ClassroomError, ClassroomResult, ErrorKind};
pub use events::{ClassroomEvent, EventEmitter};
pub use orchestrator::{OrchestratorHandle, SessionOrchestrator};
pub use peer::{ConnectionState, LoopbackNetwork};
pub use quality::{QualitySample, QualityTier};
pub use recovery::{RecoveryState, RecoveryStatus};
pub use relay::InMemoryRelay;
pub use session::{ParticipantId, Role, Session, SessionId};
