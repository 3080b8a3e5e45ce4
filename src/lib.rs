//! Build, verify, publish and attest container images.
//!
//! A single platform verification build is loaded into the local engine and
//! scanned for leaked workload identity credentials. Only a clean image is
//! rebuilt for all target platforms and pushed. The pushed digest then gets
//! a provenance attestation and an SBOM attestation, both bound to the
//! digest rather than to any tag.

pub mod attest;
pub mod cache;
pub mod config;
pub mod docker;
pub mod oci;
pub mod orchestrator;
pub mod outputs;
pub mod pipeline;
pub mod provenance;
pub mod report;
pub mod request;
pub mod scan;
pub mod tags;
