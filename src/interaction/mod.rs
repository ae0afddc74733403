//! The goal/subtask orchestration core.
//!
//! An inbound message flows orchestrator → (pending clarifications) →
//! classifier → refiner → achiever → subtask handlers, and every step hands
//! back a new immutable `GoalContext` that the orchestrator persists.

pub mod achiever;
pub mod classifier;
pub mod context;
pub mod crud;
pub mod intent;
pub mod orchestrator;
pub mod refiner;
pub mod registry;
pub mod subtask;
