//! Handles VM exits caused by VMCALL.
//!
//! A VMCALL whose RCX carries the siren signature in its upper half is a paravirtual call
//! serviced by this core. Every other VMCALL is a Hyper-V hypercall issued by the guest and is
//! forwarded to the host unchanged, with guest-physical parameter blocks translated through the EPT.

use {
    crate::{
        config::SIREN_SIGNATURE,
        error::HypervisorError,
        hyperv::{
            hypercall::{HvStatus, HypercallInput, HypercallResult},
            relay::{FastBlock, HypercallParameters},
        },
        intel::{capture::GuestRegisters, vcpu::Vcpu, vmexit::ExitType},
        siren,
    },
    bit_field::BitField,
    log::*,
};

/// Handles a VMCALL VM exit.
pub fn handle_vmcall(vcpu: &mut Vcpu<'_>, registers: &mut GuestRegisters) -> Result<ExitType, HypervisorError> {
    trace!("VMCALL RCX={:#x} RDX={:#x} R8={:#x}", registers.rcx, registers.rdx, registers.r8);

    if is_siren_call(registers.rcx) {
        let code = registers.rcx.get_bits(0..16) as u16;
        return siren::handle_siren_call(vcpu, registers, code);
    }

    forward_to_host(vcpu, registers)
}

/// Whether `rcx` tags a VMCALL as a siren call.
pub fn is_siren_call(rcx: u64) -> bool {
    rcx.get_bits(32..64) == SIREN_SIGNATURE as u64
}

fn forward_to_host(vcpu: &mut Vcpu<'_>, registers: &mut GuestRegisters) -> Result<ExitType, HypervisorError> {
    let input = HypercallInput::from(registers.rcx);

    if !vcpu.host_is_hyperv() {
        debug!("Hypercall {:#x} issued without a Hyper-V host", input.call_code());
        registers.rax = HypercallResult::new(HvStatus::INVALID_HYPERCALL_CODE, 0).into();
        return Ok(ExitType::IncrementRip);
    }

    let result = if input.fast() {
        let mut block = fast_block(registers);
        let result = vcpu.relay.forward(input, HypercallParameters::Fast(&mut block));
        write_back_fast_block(registers, &block);
        result
    } else {
        match (translate_parameter(vcpu, registers.rdx), translate_parameter(vcpu, registers.r8)) {
            (Ok(input_pa), Ok(output_pa)) => vcpu.relay.forward(input, HypercallParameters::Memory { input_pa, output_pa }),
            (Err(status), _) | (_, Err(status)) => {
                warn!("Hypercall {:#x} rejected: parameter block not mapped ({:?})", input.call_code(), status);
                HypercallResult::new(status, 0)
            }
        }
    };

    trace!("Hypercall {:#x} -> {:?}", input.call_code(), result);
    registers.rax = result.into();

    Ok(ExitType::IncrementRip)
}

/// Builds the fast-convention register image: RDX, R8, then XMM0-XMM5 low/high quadwords.
pub fn fast_block(registers: &GuestRegisters) -> FastBlock {
    let mut block: FastBlock = Default::default();
    block[0] = registers.rdx;
    block[1] = registers.r8;

    for (i, [low, high]) in registers.xmm.iter().enumerate() {
        block[2 + i * 2] = *low;
        block[3 + i * 2] = *high;
    }

    block
}

/// Copies the output registers of a fast hypercall back to the guest.
pub fn write_back_fast_block(registers: &mut GuestRegisters, block: &FastBlock) {
    registers.rdx = block[0];
    registers.r8 = block[1];

    for (i, xmm) in registers.xmm.iter_mut().enumerate() {
        *xmm = [block[2 + i * 2], block[3 + i * 2]];
    }
}

/// Translates a memory-block parameter. A zero GPA means "no block" and is passed through.
fn translate_parameter(vcpu: &Vcpu<'_>, guest_pa: u64) -> Result<u64, HvStatus> {
    if guest_pa == 0 {
        return Ok(0);
    }

    // Parameter blocks are 8-byte aligned.
    if guest_pa & 0x7 != 0 {
        return Err(HvStatus::INVALID_ALIGNMENT);
    }

    vcpu.ept.translate(guest_pa).ok_or(HvStatus::INVALID_PARAMETER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_lives_in_the_upper_half_of_rcx() {
        assert!(is_siren_call(0x5349_5245_0000_0010));
        assert!(is_siren_call(0x5349_5245_FFFF_0000));
        assert!(!is_siren_call(0x0000_0000_5349_5245));
        assert!(!is_siren_call(0x0002_0004_8001_00AF));
    }

    #[test]
    fn fast_block_orders_rdx_r8_then_xmm() {
        let mut registers = GuestRegisters { rdx: 1, r8: 2, ..Default::default() };
        registers.xmm[0] = [3, 4];
        registers.xmm[5] = [13, 14];

        let mut block = fast_block(&registers);
        assert_eq!(&block[..4], &[1, 2, 3, 4]);
        assert_eq!(&block[12..], &[13, 14]);

        block[1] = 0x22;
        block[13] = 0x44;
        write_back_fast_block(&mut registers, &block);
        assert_eq!(registers.r8, 0x22);
        assert_eq!(registers.xmm[5], [13, 0x44]);
    }
}
