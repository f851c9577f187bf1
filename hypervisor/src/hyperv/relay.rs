//! Issues hypercalls to the host hypervisor.
//!
//! The relay only encodes the input value and moves parameters in and out of the calling
//! convention; interpreting the status is up to the caller. Transports are abstracted behind
//! [`HypercallTransport`] so the relay can run against a fake host in tests.

use {
    super::hypercall::{HvStatus, HypercallCode, HypercallInput, HypercallResult},
    crate::config::FAST_BLOCK_WORDS,
    log::*,
};

/// Register image for the fast convention: `[RDX, R8, XMM0.lo, XMM0.hi, ..., XMM5.hi]`.
pub type FastBlock = [u64; FAST_BLOCK_WORDS];

/// A way of executing the host's hypercall instruction.
pub trait HypercallTransport {
    /// Memory-block convention: RCX = input value, RDX = input GPA, R8 = output GPA.
    fn call_memory(&self, input: HypercallInput, input_pa: u64, output_pa: u64) -> HypercallResult;

    /// Fast convention: parameters in RDX, R8 and XMM0-XMM5. Output registers are written back into `block`.
    fn call_fast(&self, input: HypercallInput, block: &mut FastBlock) -> HypercallResult;
}

impl<T: HypercallTransport + ?Sized> HypercallTransport for &T {
    fn call_memory(&self, input: HypercallInput, input_pa: u64, output_pa: u64) -> HypercallResult {
        (**self).call_memory(input, input_pa, output_pa)
    }

    fn call_fast(&self, input: HypercallInput, block: &mut FastBlock) -> HypercallResult {
        (**self).call_fast(input, block)
    }
}

/// Where a hypercall's parameters live.
#[derive(Debug)]
pub enum HypercallParameters<'a> {
    /// Passed in registers.
    Fast(&'a mut FastBlock),
    /// Passed by guest-physical address of page-resident input and output blocks.
    Memory { input_pa: u64, output_pa: u64 },
}

pub struct HypercallRelay<T> {
    transport: T,
    nested: bool,
}

impl<T: HypercallTransport> HypercallRelay<T> {
    pub fn new(transport: T, nested: bool) -> Self {
        Self { transport, nested }
    }

    /// Encodes the input value for `code` with this relay's nested setting.
    pub fn input_value(&self, code: u16, fast: bool, rep_count: u16, rep_start_index: u16) -> HypercallInput {
        HypercallInput::new(code)
            .with_fast(fast)
            .with_nested(self.nested)
            .with_reps(rep_count, rep_start_index)
    }

    /// Issues a simple (non-rep) hypercall.
    pub fn call(&self, code: u16, parameters: HypercallParameters<'_>) -> HypercallResult {
        let fast = matches!(parameters, HypercallParameters::Fast(_));
        self.issue(self.input_value(code, fast, 0, 0), parameters)
    }

    /// Issues an already-encoded input value unchanged, e.g. one supplied by the guest.
    pub fn forward(&self, input: HypercallInput, parameters: HypercallParameters<'_>) -> HypercallResult {
        self.issue(input, parameters)
    }

    /// Issues a rep hypercall over `rep_count` elements of a page-resident input list.
    ///
    /// When the host reports fewer completed repetitions than requested, the call is reissued
    /// for the remaining elements with the start index advanced past the completed ones.
    /// Returns the total number of completed repetitions, or the first failing status.
    pub fn call_rep(&self, code: u16, rep_count: u16, input_pa: u64, output_pa: u64) -> Result<u16, HvStatus> {
        let mut completed = 0u16;

        while completed < rep_count {
            let remaining = rep_count - completed;
            let input = self.input_value(code, false, remaining, completed);

            let result = self.transport.call_memory(input, input_pa, output_pa);
            let done = result.reps_completed().min(remaining);
            completed += done;

            if !result.status().is_success() {
                warn!("Rep hypercall {:#x} failed with {:?} after {} of {} reps", code, result.status(), completed, rep_count);
                return Err(result.status());
            }

            if done == 0 {
                warn!("Rep hypercall {:#x} made no progress at index {}", code, completed);
                return Err(HvStatus::TIMEOUT);
            }

            if done < remaining {
                trace!("Rep hypercall {:#x} partially completed ({} of {}), resuming", code, completed, rep_count);
            }
        }

        Ok(completed)
    }

    /// `HvCallFlushVirtualAddressSpace` through the fast (XMM) convention.
    pub fn flush_virtual_address_space(&self, space_id: u64, flags: u64, processor_mask: u64) -> HypercallResult {
        let mut block: FastBlock = [0; FAST_BLOCK_WORDS];
        block[0] = space_id;
        block[1] = flags;
        block[2] = processor_mask;

        trace!("Relaying FlushVirtualAddressSpace: space={:#x} flags={:#x} mask={:#x}", space_id, flags, processor_mask);
        self.call(HypercallCode::FLUSH_VIRTUAL_ADDRESS_SPACE, HypercallParameters::Fast(&mut block))
    }

    /// `HvCallFlushGuestPhysicalAddressSpace` through the fast convention.
    pub fn flush_guest_physical_address_space(&self, space_id: u64) -> HypercallResult {
        let mut block: FastBlock = [0; FAST_BLOCK_WORDS];
        block[0] = space_id;

        trace!("Relaying FlushGuestPhysicalAddressSpace: space={:#x}", space_id);
        self.call(HypercallCode::FLUSH_GUEST_PHYSICAL_ADDRESS_SPACE, HypercallParameters::Fast(&mut block))
    }

    fn issue(&self, input: HypercallInput, parameters: HypercallParameters<'_>) -> HypercallResult {
        match parameters {
            HypercallParameters::Fast(block) => self.transport.call_fast(input.with_fast(true), block),
            HypercallParameters::Memory { input_pa, output_pa } => {
                self.transport.call_memory(input.with_fast(false), input_pa, output_pa)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::hyperv::hypercall::flush_flags,
        std::{cell::RefCell, collections::VecDeque, vec::Vec},
    };

    #[derive(Default)]
    struct ScriptedHost {
        replies: RefCell<VecDeque<HypercallResult>>,
        issued: RefCell<Vec<HypercallInput>>,
        fast_blocks: RefCell<Vec<FastBlock>>,
    }

    impl ScriptedHost {
        fn reply(self, status: HvStatus, reps: u16) -> Self {
            self.replies.borrow_mut().push_back(HypercallResult::new(status, reps));
            self
        }

        fn next(&self, input: HypercallInput) -> HypercallResult {
            self.issued.borrow_mut().push(input);
            self.replies.borrow_mut().pop_front().unwrap_or(HypercallResult::new(HvStatus::SUCCESS, 0))
        }
    }

    impl HypercallTransport for ScriptedHost {
        fn call_memory(&self, input: HypercallInput, _input_pa: u64, _output_pa: u64) -> HypercallResult {
            self.next(input)
        }

        fn call_fast(&self, input: HypercallInput, block: &mut FastBlock) -> HypercallResult {
            self.fast_blocks.borrow_mut().push(*block);
            self.next(input)
        }
    }

    #[test]
    fn partial_rep_completion_resumes_at_next_index() {
        let host = ScriptedHost::default().reply(HvStatus::SUCCESS, 2).reply(HvStatus::SUCCESS, 2);
        let relay = HypercallRelay::new(&host, false);

        assert_eq!(relay.call_rep(0x0003, 4, 0x1000, 0x2000), Ok(4));

        let issued = host.issued.borrow();
        assert_eq!(issued.len(), 2);
        assert_eq!((issued[0].rep_count(), issued[0].rep_start_index()), (4, 0));
        assert_eq!((issued[1].rep_count(), issued[1].rep_start_index()), (2, 2));
        assert!(issued.iter().all(|i| !i.fast()));
    }

    #[test]
    fn rep_failure_stops_the_loop() {
        let host = ScriptedHost::default()
            .reply(HvStatus::SUCCESS, 1)
            .reply(HvStatus::INSUFFICIENT_MEMORY, 0);
        let relay = HypercallRelay::new(&host, false);

        assert_eq!(relay.call_rep(0x0003, 3, 0, 0), Err(HvStatus::INSUFFICIENT_MEMORY));
        assert_eq!(host.issued.borrow().len(), 2);
    }

    #[test]
    fn rep_without_progress_does_not_spin() {
        let host = ScriptedHost::default().reply(HvStatus::SUCCESS, 0);
        let relay = HypercallRelay::new(&host, false);

        assert_eq!(relay.call_rep(0x0003, 2, 0, 0), Err(HvStatus::TIMEOUT));
        assert_eq!(host.issued.borrow().len(), 1);
    }

    #[test]
    fn flushes_use_fast_convention_with_expected_words() {
        let host = ScriptedHost::default();
        let relay = HypercallRelay::new(&host, true);

        relay.flush_virtual_address_space(0xABC000, flush_flags::ALL_PROCESSORS, 0b1011);
        relay.flush_guest_physical_address_space(0x5000_001E);

        let issued = host.issued.borrow();
        assert_eq!(issued[0].call_code(), HypercallCode::FLUSH_VIRTUAL_ADDRESS_SPACE);
        assert_eq!(issued[1].call_code(), HypercallCode::FLUSH_GUEST_PHYSICAL_ADDRESS_SPACE);
        assert!(issued.iter().all(|i| i.fast() && i.nested() && !i.is_rep()));

        let blocks = host.fast_blocks.borrow();
        assert_eq!(&blocks[0][..3], &[0xABC000, flush_flags::ALL_PROCESSORS, 0b1011]);
        assert_eq!(&blocks[1][..2], &[0x5000_001E, 0]);
    }

    #[test]
    fn forward_keeps_the_callers_input_value() {
        let host = ScriptedHost::default().reply(HvStatus::ACCESS_DENIED, 0);
        let relay = HypercallRelay::new(&host, false);
        let input = HypercallInput::new(0x0099).with_reps(3, 1);

        let result = relay.forward(input, HypercallParameters::Memory { input_pa: 0x1000, output_pa: 0 });

        assert_eq!(result.status(), HvStatus::ACCESS_DENIED);
        assert_eq!(host.issued.borrow()[0], input);
    }
}
