//! Domain adaptation components
//!
//! - [`consistency`]: entropy-gated temporal consistency (target domain)
//! - [`discriminator`]: fully-convolutional domain classifier
//! - [`aligner`]: temporal/spatial adversarial alignment and orthogonality

pub mod aligner;
pub mod consistency;
pub mod discriminator;

pub use aligner::{
    AdversarialLosses, AlignmentPairs, AlignmentStep, Axis, DiscriminatorId, DiscriminatorTerm,
    DomainAligner, DomainLabel, Level, OrthogonalityLosses, orthogonality_loss,
};
pub use consistency::{ConsistencyLosses, ConsistencyRegularizer, LevelConsistency, trust_mask};
pub use discriminator::Discriminator;
