//! Guest register snapshot taken at VM-exit.

use {crate::error::HypervisorError, static_assertions::const_assert_eq};

/// General-purpose registers, RFLAGS, RIP and the XMM registers used by the fast hypercall
/// convention, as captured by the VM-exit stub.
///
/// The general-purpose registers are laid out in the order of their instruction encoding
/// (RAX=0 ... R15=15), which is also how exit qualifications name them.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rflags: u64,
    pub rip: u64,

    /// XMM0-XMM5 as (low, high) quadword pairs.
    pub xmm: [[u64; 2]; 6],
}

const_assert_eq!(core::mem::size_of::<GuestRegisters>(), 18 * 8 + 6 * 16);

impl GuestRegisters {
    /// Reads a general-purpose register by its encoding.
    pub fn gpr(&self, index: u64) -> Result<u64, HypervisorError> {
        Ok(match index {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            _ => return Err(HypervisorError::InvalidGprIndex(index)),
        })
    }

    /// Writes a general-purpose register by its encoding.
    pub fn set_gpr(&mut self, index: u64, value: u64) -> Result<(), HypervisorError> {
        let slot = match index {
            0 => &mut self.rax,
            1 => &mut self.rcx,
            2 => &mut self.rdx,
            3 => &mut self.rbx,
            4 => &mut self.rsp,
            5 => &mut self.rbp,
            6 => &mut self.rsi,
            7 => &mut self.rdi,
            8 => &mut self.r8,
            9 => &mut self.r9,
            10 => &mut self.r10,
            11 => &mut self.r11,
            12 => &mut self.r12,
            13 => &mut self.r13,
            14 => &mut self.r14,
            15 => &mut self.r15,
            _ => return Err(HypervisorError::InvalidGprIndex(index)),
        };

        *slot = value;
        Ok(())
    }

    /// EDX:EAX as one 64-bit value (RDMSR/WRMSR operand).
    pub fn edx_eax(&self) -> u64 {
        (self.rdx << 32) | (self.rax & 0xFFFF_FFFF)
    }

    /// Splits `value` into EDX:EAX, clearing the upper halves of RAX and RDX.
    pub fn set_edx_eax(&mut self, value: u64) {
        self.rax = value & 0xFFFF_FFFF;
        self.rdx = value >> 32;
    }
}
