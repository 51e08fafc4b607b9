//! Request kinds, priorities, flags and the stage table.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

use crate::common::exception::PoolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ZioType {
    Null,
    Read,
    Write,
    Free,
    Claim,
    Ioctl,
    Trim,
}

impl ZioType {
    pub const ALL: [ZioType; 7] = [
        ZioType::Null,
        ZioType::Read,
        ZioType::Write,
        ZioType::Free,
        ZioType::Claim,
        ZioType::Ioctl,
        ZioType::Trim,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    SyncRead,
    SyncWrite,
    AsyncRead,
    AsyncWrite,
    Scrub,
    Trim,
    /// Non-queued, highest urgency. Runs on the high-priority taskq tier.
    Now,
}

/// Which of a parent's four child slots a request occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChildType {
    Vdev = 0,
    Gang = 1,
    Ddt = 2,
    Logical = 3,
}

impl ChildType {
    pub const ALL: [ChildType; 4] = [
        ChildType::Vdev,
        ChildType::Gang,
        ChildType::Ddt,
        ChildType::Logical,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn bit(self) -> ChildMask {
        ChildMask(1 << self as u8)
    }
}

/// A set of child types to wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildMask(u8);

impl ChildMask {
    pub const NONE: ChildMask = ChildMask(0);
    pub const VDEV: ChildMask = ChildMask(1 << 0);
    pub const GANG: ChildMask = ChildMask(1 << 1);
    pub const DDT: ChildMask = ChildMask(1 << 2);
    pub const LOGICAL: ChildMask = ChildMask(1 << 3);
    pub const ALL: ChildMask = ChildMask(0xF);

    pub fn contains(self, ct: ChildType) -> bool {
        self.0 & ct.bit().0 != 0
    }

    pub fn iter(self) -> impl Iterator<Item = ChildType> {
        ChildType::ALL.into_iter().filter(move |ct| self.contains(*ct))
    }
}

impl BitOr for ChildMask {
    type Output = ChildMask;
    fn bitor(self, rhs: ChildMask) -> ChildMask {
        ChildMask(self.0 | rhs.0)
    }
}

/// The two completion barriers every request passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitType {
    Ready = 0,
    Done = 1,
}

impl WaitType {
    pub const ALL: [WaitType; 2] = [WaitType::Ready, WaitType::Done];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Request option flags.
///
/// The bit order matters: child requests inherit every flag below a cut-off
/// bit (see [`ZioFlags::gang_child`] and [`ZioFlags::vdev_child`]).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ZioFlags(u64);

impl ZioFlags {
    pub const NONE: ZioFlags = ZioFlags(0);
    pub const DONT_AGGREGATE: ZioFlags = ZioFlags(1 << 0);
    pub const IO_REPAIR: ZioFlags = ZioFlags(1 << 1);
    pub const SELF_HEAL: ZioFlags = ZioFlags(1 << 2);
    pub const RESILVER: ZioFlags = ZioFlags(1 << 3);
    pub const SCRUB: ZioFlags = ZioFlags(1 << 4);
    pub const SCAN_THREAD: ZioFlags = ZioFlags(1 << 5);
    pub const PHYSICAL: ZioFlags = ZioFlags(1 << 6);
    pub const CANFAIL: ZioFlags = ZioFlags(1 << 7);
    pub const SPECULATIVE: ZioFlags = ZioFlags(1 << 8);
    pub const CONFIG_WRITER: ZioFlags = ZioFlags(1 << 9);
    pub const DONT_RETRY: ZioFlags = ZioFlags(1 << 10);
    pub const DONT_CACHE: ZioFlags = ZioFlags(1 << 11);
    pub const NODATA: ZioFlags = ZioFlags(1 << 12);
    pub const INDUCE_DAMAGE: ZioFlags = ZioFlags(1 << 13);
    pub const IO_ALLOCATING: ZioFlags = ZioFlags(1 << 14);
    pub const IO_RETRY: ZioFlags = ZioFlags(1 << 15);
    pub const PROBE: ZioFlags = ZioFlags(1 << 16);
    pub const TRYHARD: ZioFlags = ZioFlags(1 << 17);
    pub const OPTIONAL: ZioFlags = ZioFlags(1 << 18);
    pub const DONT_QUEUE: ZioFlags = ZioFlags(1 << 19);
    pub const DONT_PROPAGATE: ZioFlags = ZioFlags(1 << 20);
    pub const IO_BYPASS: ZioFlags = ZioFlags(1 << 21);
    pub const IO_REWRITE: ZioFlags = ZioFlags(1 << 22);
    pub const RAW: ZioFlags = ZioFlags(1 << 23);
    pub const GANG_CHILD: ZioFlags = ZioFlags(1 << 24);
    pub const DDT_CHILD: ZioFlags = ZioFlags(1 << 25);
    pub const GODFATHER: ZioFlags = ZioFlags(1 << 26);
    pub const NOPWRITE: ZioFlags = ZioFlags(1 << 27);
    pub const REEXECUTED: ZioFlags = ZioFlags(1 << 28);
    pub const DELEGATED: ZioFlags = ZioFlags(1 << 29);

    const NAMES: [&'static str; 30] = [
        "DONT_AGGREGATE",
        "IO_REPAIR",
        "SELF_HEAL",
        "RESILVER",
        "SCRUB",
        "SCAN_THREAD",
        "PHYSICAL",
        "CANFAIL",
        "SPECULATIVE",
        "CONFIG_WRITER",
        "DONT_RETRY",
        "DONT_CACHE",
        "NODATA",
        "INDUCE_DAMAGE",
        "IO_ALLOCATING",
        "IO_RETRY",
        "PROBE",
        "TRYHARD",
        "OPTIONAL",
        "DONT_QUEUE",
        "DONT_PROPAGATE",
        "IO_BYPASS",
        "IO_REWRITE",
        "RAW",
        "GANG_CHILD",
        "DDT_CHILD",
        "GODFATHER",
        "NOPWRITE",
        "REEXECUTED",
        "DELEGATED",
    ];

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn contains(self, other: ZioFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: ZioFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: ZioFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: ZioFlags) {
        self.0 &= !other.0;
    }

    /// Every flag strictly below `bit`.
    fn below(self, bit: ZioFlags) -> ZioFlags {
        ZioFlags(self.0 & (bit.0 - 1))
    }

    /// Flags for a gang member or gang header child of a request with `self`.
    pub fn gang_child(self) -> ZioFlags {
        self.below(ZioFlags::IO_RETRY) | ZioFlags::GANG_CHILD | ZioFlags::CANFAIL
    }

    pub fn ddt_child(self) -> ZioFlags {
        self.below(ZioFlags::IO_RETRY) | ZioFlags::DDT_CHILD | ZioFlags::CANFAIL
    }

    pub fn vdev_child(self) -> ZioFlags {
        self.below(ZioFlags::DONT_QUEUE) | ZioFlags::DONT_PROPAGATE | ZioFlags::CANFAIL
    }
}

impl BitOr for ZioFlags {
    type Output = ZioFlags;
    fn bitor(self, rhs: ZioFlags) -> ZioFlags {
        ZioFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ZioFlags {
    fn bitor_assign(&mut self, rhs: ZioFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ZioFlags {
    type Output = ZioFlags;
    fn bitand(self, rhs: ZioFlags) -> ZioFlags {
        ZioFlags(self.0 & rhs.0)
    }
}

impl Not for ZioFlags {
    type Output = ZioFlags;
    fn not(self) -> ZioFlags {
        ZioFlags(!self.0)
    }
}

impl fmt::Debug for ZioFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .enumerate()
            .filter(|(i, _)| self.0 & (1 << i) != 0)
            .map(|(_, n)| *n)
            .collect();
        write!(f, "ZioFlags({})", names.join("|"))
    }
}

/// One pipeline stage. Each is a distinct bit; execution order is bit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum Stage {
    Open = 1 << 0,
    ReadBpInit = 1 << 1,
    WriteBpInit = 1 << 2,
    FreeBpInit = 1 << 3,
    IssueAsync = 1 << 4,
    WriteCompress = 1 << 5,
    Encrypt = 1 << 6,
    ChecksumGenerate = 1 << 7,
    NopWrite = 1 << 8,
    DdtReadStart = 1 << 9,
    DdtReadDone = 1 << 10,
    DdtWrite = 1 << 11,
    DdtFree = 1 << 12,
    GangAssemble = 1 << 13,
    GangIssue = 1 << 14,
    DvaThrottle = 1 << 15,
    DvaAllocate = 1 << 16,
    DvaFree = 1 << 17,
    DvaClaim = 1 << 18,
    Ready = 1 << 19,
    VdevIoStart = 1 << 20,
    VdevIoDone = 1 << 21,
    VdevIoAssess = 1 << 22,
    ChecksumVerify = 1 << 23,
    Done = 1 << 24,
}

impl Stage {
    pub const ALL: [Stage; 25] = [
        Stage::Open,
        Stage::ReadBpInit,
        Stage::WriteBpInit,
        Stage::FreeBpInit,
        Stage::IssueAsync,
        Stage::WriteCompress,
        Stage::Encrypt,
        Stage::ChecksumGenerate,
        Stage::NopWrite,
        Stage::DdtReadStart,
        Stage::DdtReadDone,
        Stage::DdtWrite,
        Stage::DdtFree,
        Stage::GangAssemble,
        Stage::GangIssue,
        Stage::DvaThrottle,
        Stage::DvaAllocate,
        Stage::DvaFree,
        Stage::DvaClaim,
        Stage::Ready,
        Stage::VdevIoStart,
        Stage::VdevIoDone,
        Stage::VdevIoAssess,
        Stage::ChecksumVerify,
        Stage::Done,
    ];

    pub fn bit(self) -> u32 {
        self as u32
    }

    pub fn from_bit(bit: u32) -> Option<Stage> {
        if !bit.is_power_of_two() {
            return None;
        }
        Self::ALL.get(bit.trailing_zeros() as usize).copied()
    }

    /// Stages that may block on a lock held across I/O, or on I/O that needs
    /// an interrupt thread to complete.
    pub fn is_blocking(self) -> bool {
        BLOCKING_STAGES.contains(self)
    }
}

/// A set of stages: the pipeline a request will run.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StageMask(u32);

impl StageMask {
    pub const EMPTY: StageMask = StageMask(0);

    pub const fn of(stages: &[Stage]) -> StageMask {
        let mut bits = 0;
        let mut i = 0;
        while i < stages.len() {
            bits |= stages[i] as u32;
            i += 1;
        }
        StageMask(bits)
    }

    pub const fn union(self, other: StageMask) -> StageMask {
        StageMask(self.0 | other.0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, stage: Stage) -> bool {
        self.0 & stage.bit() != 0
    }

    pub fn insert(&mut self, stage: Stage) {
        self.0 |= stage.bit();
    }

    pub fn remove(&mut self, stage: Stage) {
        self.0 &= !stage.bit();
    }

    pub fn without(self, other: StageMask) -> StageMask {
        StageMask(self.0 & !other.0)
    }

    pub fn intersect(self, other: StageMask) -> StageMask {
        StageMask(self.0 & other.0)
    }

    /// First member after `stage`, in execution order.
    pub fn next_after(self, stage: Stage) -> Option<Stage> {
        let above = self.0 & !((stage.bit() << 1) - 1);
        if above == 0 {
            None
        } else {
            Stage::from_bit(1 << above.trailing_zeros())
        }
    }

    /// Last member before `stage`.
    pub fn prev_before(self, stage: Stage) -> Option<Stage> {
        let below = self.0 & (stage.bit() - 1);
        if below == 0 {
            None
        } else {
            Stage::from_bit(1 << (31 - below.leading_zeros()))
        }
    }

    pub fn stages(self) -> impl Iterator<Item = Stage> {
        Stage::ALL.into_iter().filter(move |s| self.contains(*s))
    }
}

impl BitOr for StageMask {
    type Output = StageMask;
    fn bitor(self, rhs: StageMask) -> StageMask {
        StageMask(self.0 | rhs.0)
    }
}

impl fmt::Debug for StageMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.stages()).finish()
    }
}

use Stage::*;

pub const INTERLOCK_STAGES: StageMask = StageMask::of(&[Open, Ready, Done]);
pub const INTERLOCK_PIPELINE: StageMask = INTERLOCK_STAGES;
pub const VDEV_IO_STAGES: StageMask = StageMask::of(&[VdevIoStart, VdevIoDone, VdevIoAssess]);
/// Device children start just past READY, so READY is their first member.
pub const VDEV_CHILD_PIPELINE: StageMask = VDEV_IO_STAGES.union(StageMask::of(&[Ready, Done]));

pub const READ_COMMON_STAGES: StageMask =
    INTERLOCK_STAGES.union(VDEV_IO_STAGES).union(StageMask::of(&[ChecksumVerify]));
pub const READ_PHYS_PIPELINE: StageMask = READ_COMMON_STAGES;
pub const READ_PIPELINE: StageMask = READ_COMMON_STAGES.union(StageMask::of(&[ReadBpInit]));
pub const DDT_CHILD_READ_PIPELINE: StageMask = READ_COMMON_STAGES;
pub const DDT_READ_PIPELINE: StageMask =
    INTERLOCK_STAGES.union(StageMask::of(&[ReadBpInit, DdtReadStart, DdtReadDone]));

pub const WRITE_COMMON_STAGES: StageMask = INTERLOCK_STAGES
    .union(VDEV_IO_STAGES)
    .union(StageMask::of(&[IssueAsync, ChecksumGenerate]));
pub const WRITE_PHYS_PIPELINE: StageMask = WRITE_COMMON_STAGES;
pub const REWRITE_PIPELINE: StageMask =
    WRITE_COMMON_STAGES.union(StageMask::of(&[WriteBpInit, WriteCompress, Encrypt]));
pub const WRITE_PIPELINE: StageMask = WRITE_COMMON_STAGES.union(StageMask::of(&[
    WriteBpInit,
    WriteCompress,
    Encrypt,
    DvaThrottle,
    DvaAllocate,
]));
pub const DDT_CHILD_WRITE_PIPELINE: StageMask = INTERLOCK_STAGES
    .union(VDEV_IO_STAGES)
    .union(StageMask::of(&[DvaThrottle, DvaAllocate]));
pub const DDT_WRITE_PIPELINE: StageMask = INTERLOCK_STAGES.union(StageMask::of(&[
    WriteBpInit,
    IssueAsync,
    WriteCompress,
    Encrypt,
    ChecksumGenerate,
    DdtWrite,
]));

pub const GANG_STAGES: StageMask = StageMask::of(&[GangAssemble, GangIssue]);

pub const FREE_PIPELINE: StageMask = INTERLOCK_STAGES.union(StageMask::of(&[FreeBpInit, DvaFree]));
pub const DDT_FREE_PIPELINE: StageMask =
    INTERLOCK_STAGES.union(StageMask::of(&[FreeBpInit, IssueAsync, DdtFree]));
pub const CLAIM_PIPELINE: StageMask = INTERLOCK_STAGES.union(StageMask::of(&[DvaClaim]));
pub const IOCTL_PIPELINE: StageMask = INTERLOCK_STAGES.union(VDEV_IO_STAGES);
pub const TRIM_PIPELINE: StageMask = INTERLOCK_STAGES.union(VDEV_IO_STAGES);

pub const BLOCKING_STAGES: StageMask = StageMask::of(&[DvaAllocate, DvaClaim, VdevIoStart]);

/// Device control operations carried by ioctl requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlCmd {
    FlushCache,
}

/// Per-request lifecycle, exposed for observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    Created,
    Running,
    Ready,
    DoneSuccess,
    DoneFailedRetryable,
    Reexecuting,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Submit,
    ReachReady,
    Complete,
    Fail,
    RequestReexecute,
    Suspend,
    Reexecute,
}

impl RequestState {
    /// Transition table. `None` means the event is not legal in this state.
    pub fn on(self, event: LifecycleEvent) -> Option<RequestState> {
        use LifecycleEvent as E;
        use RequestState as S;
        match (self, event) {
            (S::Created, E::Submit) => Some(S::Running),
            (S::Running, E::ReachReady) => Some(S::Ready),
            // Requests without a ready barrier (or failing before it) may
            // finish from either state.
            (S::Running | S::Ready, E::Complete) => Some(S::DoneSuccess),
            (S::Running | S::Ready, E::Fail | E::RequestReexecute) => Some(S::DoneFailedRetryable),
            (S::DoneFailedRetryable, E::Suspend) => Some(S::Suspended),
            (S::DoneFailedRetryable | S::Suspended | S::DoneSuccess, E::Reexecute) => Some(S::Reexecuting),
            (S::Reexecuting, E::Submit) => Some(S::Running),
            (S::Reexecuting, E::ReachReady) => Some(S::Ready),
            _ => None,
        }
    }

    pub fn transition(self, event: LifecycleEvent) -> Result<RequestState, PoolError> {
        self.on(event).ok_or(PoolError::IllegalTransition {
            from: self.name(),
            event: event.name(),
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            RequestState::Created => "created",
            RequestState::Running => "running",
            RequestState::Ready => "ready",
            RequestState::DoneSuccess => "done-success",
            RequestState::DoneFailedRetryable => "done-failed-retryable",
            RequestState::Reexecuting => "reexecuting",
            RequestState::Suspended => "suspended",
        }
    }
}

impl LifecycleEvent {
    pub fn name(self) -> &'static str {
        match self {
            LifecycleEvent::Submit => "submit",
            LifecycleEvent::ReachReady => "reach-ready",
            LifecycleEvent::Complete => "complete",
            LifecycleEvent::Fail => "fail",
            LifecycleEvent::RequestReexecute => "request-reexecute",
            LifecycleEvent::Suspend => "suspend",
            LifecycleEvent::Reexecute => "reexecute",
        }
    }
}
