//! Interface to the host (root) hypervisor this core runs on top of.
//!
//! Reference: Microsoft Hypervisor Top Level Functional Specification (TLFS), chapters
//! "Hypercall Interface" and "Feature Discovery".

pub mod cpuid;
pub mod hypercall;
pub mod relay;
