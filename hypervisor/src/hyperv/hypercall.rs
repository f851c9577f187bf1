//! Bit-exact hypercall control and result words.
//!
//! Reference: TLFS 3.7 "Hypercall Inputs" and 3.8 "Hypercall Return Values".

use {bitfield::bitfield, static_assertions::assert_eq_size};

bitfield! {
    /// The 64-bit hypercall input value passed in RCX.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct HypercallInput(u64);
    impl Debug;

    pub u16, call_code, set_call_code: 15, 0;
    pub fast, set_fast: 16;
    /// Size of the variable header, in 8-byte units.
    pub u16, variable_header_size, set_variable_header_size: 26, 17;
    pub nested, set_nested: 31;
    pub u16, rep_count, set_rep_count: 43, 32;
    pub u16, rep_start_index, set_rep_start_index: 59, 48;
}

bitfield! {
    /// The 64-bit hypercall result value returned in RAX.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct HypercallResult(u64);
    impl Debug;

    pub u16, status_code, _: 15, 0;
    pub u16, reserved, _: 31, 16;
    pub u16, reps_completed, _: 43, 32;
}

assert_eq_size!(HypercallInput, u64);
assert_eq_size!(HypercallResult, u64);

/// Largest value representable in the 12-bit rep count and rep start index fields.
pub const MAX_REP_COUNT: u16 = 0xFFF;

impl From<u64> for HypercallInput {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<HypercallInput> for u64 {
    fn from(input: HypercallInput) -> Self {
        input.0
    }
}

impl From<u64> for HypercallResult {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<HypercallResult> for u64 {
    fn from(result: HypercallResult) -> Self {
        result.0
    }
}

impl HypercallInput {
    pub fn new(code: u16) -> Self {
        let mut input = Self(0);
        input.set_call_code(code);
        input
    }

    pub fn with_fast(mut self, fast: bool) -> Self {
        self.set_fast(fast);
        self
    }

    pub fn with_nested(mut self, nested: bool) -> Self {
        self.set_nested(nested);
        self
    }

    pub fn with_reps(mut self, count: u16, start_index: u16) -> Self {
        self.set_rep_count(count & MAX_REP_COUNT);
        self.set_rep_start_index(start_index & MAX_REP_COUNT);
        self
    }

    pub fn is_rep(&self) -> bool {
        self.rep_count() != 0
    }
}

impl HypercallResult {
    pub fn new(status: HvStatus, reps_completed: u16) -> Self {
        Self(status.0 as u64 | ((reps_completed as u64 & MAX_REP_COUNT as u64) << 32))
    }

    pub fn status(&self) -> HvStatus {
        HvStatus(self.status_code())
    }

    /// Returns the number of completed repetitions, or the failing status.
    pub fn into_result(self) -> Result<u16, HvStatus> {
        match self.status() {
            HvStatus::SUCCESS => Ok(self.reps_completed()),
            status => Err(status),
        }
    }
}

/// A hypercall status code (TLFS Appendix "Hypercall Status Codes").
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HvStatus(pub u16);

impl HvStatus {
    pub const SUCCESS: Self = Self(0x0000);
    pub const INVALID_HYPERCALL_CODE: Self = Self(0x0002);
    pub const INVALID_HYPERCALL_INPUT: Self = Self(0x0003);
    pub const INVALID_ALIGNMENT: Self = Self(0x0004);
    pub const INVALID_PARAMETER: Self = Self(0x0005);
    pub const ACCESS_DENIED: Self = Self(0x0006);
    pub const OPERATION_DENIED: Self = Self(0x0008);
    pub const INSUFFICIENT_MEMORY: Self = Self(0x000B);
    pub const TIMEOUT: Self = Self(0x0078);

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

/// Hypercall call codes used by this core.
pub struct HypercallCode;

impl HypercallCode {
    pub const FLUSH_VIRTUAL_ADDRESS_SPACE: u16 = 0x0002;
    pub const FLUSH_GUEST_PHYSICAL_ADDRESS_SPACE: u16 = 0x00AF;
}

/// Flags for `HvCallFlushVirtualAddressSpace`.
pub mod flush_flags {
    pub const ALL_PROCESSORS: u64 = 1 << 0;
    pub const ALL_VIRTUAL_ADDRESS_SPACES: u64 = 1 << 1;
    pub const NON_GLOBAL_MAPPINGS_ONLY: u64 = 1 << 2;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_fields_land_on_documented_bits() {
        let input = HypercallInput::new(0x00AF).with_fast(true).with_nested(true).with_reps(4, 2);

        assert_eq!(input.0 & 0xFFFF, 0x00AF);
        assert_eq!((input.0 >> 16) & 1, 1);
        assert_eq!((input.0 >> 31) & 1, 1);
        assert_eq!((input.0 >> 32) & 0xFFF, 4);
        assert_eq!((input.0 >> 48) & 0xFFF, 2);
        assert_eq!(input.0, 0x0002_0004_8001_00AF);
    }

    #[test]
    fn variable_header_size_occupies_bits_26_to_17() {
        let mut input = HypercallInput::new(0);
        input.set_variable_header_size(0x3FF);
        assert_eq!(input.0, 0x3FF << 17);
        assert!(!input.fast());
    }

    #[test]
    fn result_splits_status_reserved_and_reps() {
        let result = HypercallResult(0x0000_0ABC_1234_0078);

        assert_eq!(result.status(), HvStatus::TIMEOUT);
        assert_eq!(result.reserved(), 0x1234);
        assert_eq!(result.reps_completed(), 0xABC);
        assert_eq!(result.into_result(), Err(HvStatus::TIMEOUT));
    }

    #[test]
    fn rep_fields_are_truncated_to_twelve_bits() {
        let input = HypercallInput::new(1).with_reps(0xFFFF, 0x1001);
        assert_eq!(input.rep_count(), 0xFFF);
        assert_eq!(input.rep_start_index(), 0x001);
        assert_eq!(HypercallResult::new(HvStatus::SUCCESS, 7).into_result(), Ok(7));
    }
}
