//! VM-exit reasons, exit-qualification layouts and exception vectors.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Appendix C VMX Basic Exit Reasons
//! and 28.2.1 Basic VM-Exit Information.

use {bitfield::bitfield, bit_field::BitField};

macro_rules! exit_reasons {
    ($($name:ident = $value:literal,)*) => {
        /// Represents the basic VM exit reasons (bits 15:0 of the exit-reason field).
        ///
        /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table C-1. Basic Exit Reasons
        #[repr(u16)]
        #[derive(Debug, Copy, Clone, PartialEq, Eq)]
        pub enum VmxBasicExitReason {
            $($name = $value,)*
        }

        impl VmxBasicExitReason {
            /// Every defined exit reason, in numeric order.
            pub const ALL: &'static [VmxBasicExitReason] = &[$(VmxBasicExitReason::$name,)*];

            pub fn from_u16(value: u16) -> Option<Self> {
                match value {
                    $($value => Some(Self::$name),)*
                    _ => None,
                }
            }
        }
    };
}

exit_reasons! {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InitSignal = 3,
    StartupIpi = 4,
    IoSystemManagementInterrupt = 5,
    OtherSmi = 6,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    Cpuid = 10,
    Getsec = 11,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdpmc = 15,
    Rdtsc = 16,
    Rsm = 17,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmxoff = 26,
    Vmxon = 27,
    ControlRegisterAccesses = 28,
    MovDr = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    VmEntryFailureInvalidGuestState = 33,
    VmEntryFailureMsrLoading = 34,
    Mwait = 36,
    MonitorTrapFlag = 37,
    Monitor = 39,
    Pause = 40,
    VmEntryFailureMachineCheckEvent = 41,
    TprBelowThreshold = 43,
    ApicAccess = 44,
    VirtualizedEoi = 45,
    AccessToGdtrOrIdtr = 46,
    AccessToLdtrOrTr = 47,
    EptViolation = 48,
    EptMisconfiguration = 49,
    Invept = 50,
    Rdtscp = 51,
    VmxPreemptionTimerExpired = 52,
    Invvpid = 53,
    WbinvdOrWbnoinvd = 54,
    Xsetbv = 55,
    ApicWrite = 56,
    Rdrand = 57,
    Invpcid = 58,
    Vmfunc = 59,
    Encls = 60,
    Rdseed = 61,
    PageModificationLogFull = 62,
    Xsaves = 63,
    Xrstors = 64,
    Pconfig = 65,
    SppRelatedEvent = 66,
    Umwait = 67,
    Tpause = 68,
    Loadiwkey = 69,
    Enclv = 70,
    Enqcmd = 71,
    Enqcmds = 72,
    BusLock = 73,
    InstructionTimeout = 74,
    Seamcall = 75,
    Tdcall = 76,
}

impl VmxBasicExitReason {
    /// Decodes the full 32-bit exit-reason field. Bit 31 set means VM-entry failed.
    pub fn from_exit_reason(exit_reason: u64) -> Option<Self> {
        Self::from_u16(exit_reason.get_bits(0..16) as u16)
    }
}

bitfield! {
    /// Exit qualification for control-register accesses.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-3. Exit Qualification for Control-Register Accesses
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct ControlRegAccessExitQualification(u64);
    impl Debug;

    pub u8, control_register, _: 3, 0;
    pub u8, access_type_raw, _: 5, 4;
    /// LMSW operand type: 0 = register, 1 = memory.
    pub lmsw_memory_operand, _: 6;
    pub u8, gpr, _: 11, 8;
    pub u16, lmsw_source_data, _: 31, 16;
}

/// The kind of control-register access that caused the exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrAccessType {
    MovToCr,
    MovFromCr,
    Clts,
    Lmsw,
}

impl From<u64> for ControlRegAccessExitQualification {
    fn from(qualification: u64) -> Self {
        Self(qualification)
    }
}

impl ControlRegAccessExitQualification {
    pub fn access_type(&self) -> CrAccessType {
        match self.access_type_raw() {
            0 => CrAccessType::MovToCr,
            1 => CrAccessType::MovFromCr,
            2 => CrAccessType::Clts,
            _ => CrAccessType::Lmsw,
        }
    }
}

/// Exception vectors that may be injected into the guest.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionInterrupt {
    DivideError = 0,
    Debug = 1,
    NonMaskableInterrupt = 2,
    Breakpoint = 3,
    Overflow = 4,
    BoundRangeExceeded = 5,
    InvalidOpcode = 6,
    DeviceNotAvailable = 7,
    DoubleFault = 8,
    InvalidTss = 10,
    SegmentNotPresent = 11,
    StackSegmentFault = 12,
    GeneralProtectionFault = 13,
    PageFault = 14,
    X87FloatingPoint = 16,
    AlignmentCheck = 17,
    MachineCheck = 18,
    SimdFloatingPoint = 19,
    Virtualization = 20,
    ControlProtection = 21,
}

/// Interruption types of the VM-entry interruption-information field.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionType {
    ExternalInterrupt = 0,
    NonMaskableInterrupt = 2,
    HardwareException = 3,
    SoftwareInterrupt = 4,
    PrivilegedSoftwareException = 5,
    SoftwareException = 6,
    OtherEvent = 7,
}
