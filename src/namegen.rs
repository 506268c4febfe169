//! Unique-name generation for namespaces and chaos resources
//!
//! Kept behind a trait so tests can substitute a deterministic generator
//! instead of asserting on random suffixes.

use uuid::Uuid;

/// Generates unique resource names from a type prefix.
pub trait NameGenerator: Send + Sync {
    /// Produce a name of the form `<prefix>-<unique suffix>`.
    fn generate(&self, prefix: &str) -> String;
}

/// Default generator using a random UUID suffix.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomNameGenerator;

impl NameGenerator for RandomNameGenerator {
    fn generate(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, Uuid::new_v4())
    }
}
