//! VM-exit handling core for a nested Intel VT-x hypervisor running on Hyper-V.
//!
//! The crate does not launch VMs. It is handed the current VMCS, the logical processor, an EPT
//! store and a way to reach the host hypervisor, and services the exits a guest generates,
//! including the siren paravirtual hypercalls.

#![cfg_attr(not(test), no_std)]

extern crate static_assertions;

pub mod config;
pub mod error;
pub mod hyperv;
pub mod intel;
pub mod logger;
pub mod processor;
pub mod siren;
pub mod sync;
