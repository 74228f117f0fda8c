//! Ports - Trait definitions for everything outside the domain.

pub mod clock;
pub mod media;
pub mod provider;
pub mod repository;
