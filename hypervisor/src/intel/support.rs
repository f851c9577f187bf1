//! Instruction wrappers for the logical processor the hypervisor runs on.

use {
    crate::{
        hyperv::{
            hypercall::{HypercallInput, HypercallResult},
            relay::{FastBlock, HypercallTransport},
        },
        intel::platform::Platform,
    },
    core::arch::asm,
    x86::cpuid::CpuIdResult,
};

/// INVEPT type 1.
const INVEPT_SINGLE_CONTEXT: u64 = 1;
/// INVVPID type 0.
const INVVPID_INDIVIDUAL_ADDRESS: u64 = 0;
/// INVVPID type 3.
const INVVPID_SINGLE_CONTEXT_RETAINING_GLOBALS: u64 = 3;

/// The real processor.
pub struct Hardware;

impl Platform for Hardware {
    fn rdmsr(&self, msr: u32) -> u64 {
        unsafe { x86::msr::rdmsr(msr) }
    }

    fn wrmsr(&self, msr: u32, value: u64) {
        unsafe { x86::msr::wrmsr(msr, value) };
    }

    fn cpuid(&self, leaf: u32, sub_leaf: u32) -> CpuIdResult {
        x86::cpuid::cpuid!(leaf, sub_leaf)
    }

    fn wbinvd(&self) {
        unsafe { asm!("wbinvd", options(nostack, preserves_flags)) };
    }

    fn invept_single_context(&self, eptp: u64) {
        let descriptor: [u64; 2] = [eptp, 0];
        let flags: u64;

        unsafe {
            asm!("invept {}, [{}]", "pushfq", "pop {}", in(reg) INVEPT_SINGLE_CONTEXT, in(reg) &descriptor, lateout(reg) flags);
        }

        check_vm_succeed("INVEPT", flags);
    }

    fn invvpid_individual_address(&self, vpid: u16, address: u64) {
        let descriptor: [u64; 2] = [vpid as u64, address];
        let flags: u64;

        unsafe {
            asm!("invvpid {}, [{}]", "pushfq", "pop {}", in(reg) INVVPID_INDIVIDUAL_ADDRESS, in(reg) &descriptor, lateout(reg) flags);
        }

        check_vm_succeed("INVVPID", flags);
    }

    fn invvpid_single_context(&self, vpid: u16) {
        let descriptor: [u64; 2] = [vpid as u64, 0];
        let flags: u64;

        unsafe {
            asm!("invvpid {}, [{}]", "pushfq", "pop {}", in(reg) INVVPID_SINGLE_CONTEXT_RETAINING_GLOBALS, in(reg) &descriptor, lateout(reg) flags);
        }

        check_vm_succeed("INVVPID", flags);
    }
}

/// CF = VMfailInvalid, ZF = VMfailValid.
fn check_vm_succeed(instruction: &str, flags: u64) {
    if flags & 0x41 != 0 {
        log::error!("{} failed: rflags={:#x}", instruction, flags);
    }
}

/// Issues hypercalls with VMCALL, as the host's hypercall page does on Intel processors.
pub struct VmcallTransport;

impl HypercallTransport for VmcallTransport {
    fn call_memory(&self, input: HypercallInput, input_pa: u64, output_pa: u64) -> HypercallResult {
        let result: u64;

        unsafe {
            asm!(
                "vmcall",
                in("rcx") u64::from(input),
                in("rdx") input_pa,
                in("r8") output_pa,
                lateout("rax") result,
            );
        }

        HypercallResult::from(result)
    }

    fn call_fast(&self, input: HypercallInput, block: &mut FastBlock) -> HypercallResult {
        let result: u64;
        let (rdx, r8) = (block[0], block[1]);
        let xmm = block[2..].as_mut_ptr();

        unsafe {
            asm!(
                "movdqu xmm0, [{xmm}]",
                "movdqu xmm1, [{xmm} + 0x10]",
                "movdqu xmm2, [{xmm} + 0x20]",
                "movdqu xmm3, [{xmm} + 0x30]",
                "movdqu xmm4, [{xmm} + 0x40]",
                "movdqu xmm5, [{xmm} + 0x50]",
                "vmcall",
                "movdqu [{xmm}], xmm0",
                "movdqu [{xmm} + 0x10], xmm1",
                "movdqu [{xmm} + 0x20], xmm2",
                "movdqu [{xmm} + 0x30], xmm3",
                "movdqu [{xmm} + 0x40], xmm4",
                "movdqu [{xmm} + 0x50], xmm5",
                xmm = in(reg) xmm,
                in("rcx") u64::from(input),
                inout("rdx") rdx => block[0],
                inout("r8") r8 => block[1],
                out("rax") result,
                out("xmm0") _,
                out("xmm1") _,
                out("xmm2") _,
                out("xmm3") _,
                out("xmm4") _,
                out("xmm5") _,
            );
        }

        HypercallResult::from(result)
    }
}
