//! Runtime flags: the per-fiber behavior bitset.
//!
//! Flags gate how the interpreter treats a fiber at each step:
//!
//! - `INTERRUPTION`: interrupt signals may be delivered.
//! - `COOPERATIVE_YIELDING`: the fiber yields after its operation budget.
//! - `OP_SUPERVISION`: supervisor hooks fire for this fiber's forks.
//! - `WIND_DOWN`: the fiber is running interruption cleanup; no further
//!   interrupt is delivered until it completes.
//!
//! Uninterruptible regions are expressed as a [`FlagsPatch`] applied on
//! region entry and reverted on exit, so nesting composes without explicit
//! mask counting.

/// Per-fiber runtime behavior bitset.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuntimeFlags(u32);

impl RuntimeFlags {
    /// Interrupt signals may be delivered.
    pub const INTERRUPTION: u32 = 1 << 0;
    /// Yield cooperatively once the operation budget is spent.
    pub const COOPERATIVE_YIELDING: u32 = 1 << 1;
    /// Fire supervisor hooks on fork and completion.
    pub const OP_SUPERVISION: u32 = 1 << 2;
    /// Interruption cleanup in progress; defer further interrupts.
    pub const WIND_DOWN: u32 = 1 << 3;

    /// The default flag set: interruptible, cooperatively yielding,
    /// supervised.
    #[must_use]
    pub const fn default_set() -> Self {
        Self(Self::INTERRUPTION | Self::COOPERATIVE_YIELDING | Self::OP_SUPERVISION)
    }

    /// An empty flag set.
    #[must_use]
    pub const fn none() -> Self {
        Self(0)
    }

    #[must_use]
    const fn is_set(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    /// Whether interruption delivery is enabled at all.
    #[must_use]
    pub const fn interruption(self) -> bool {
        self.is_set(Self::INTERRUPTION)
    }

    /// Whether the fiber yields after its operation budget.
    #[must_use]
    pub const fn cooperative_yielding(self) -> bool {
        self.is_set(Self::COOPERATIVE_YIELDING)
    }

    /// Whether supervisor hooks fire.
    #[must_use]
    pub const fn op_supervision(self) -> bool {
        self.is_set(Self::OP_SUPERVISION)
    }

    /// Whether interruption cleanup is in progress.
    #[must_use]
    pub const fn wind_down(self) -> bool {
        self.is_set(Self::WIND_DOWN)
    }

    /// Whether an interrupt signal would be honored right now.
    #[must_use]
    pub const fn interruptible(self) -> bool {
        self.interruption() && !self.wind_down()
    }

    /// Returns the flags with `flag` set.
    #[must_use]
    pub const fn enable(self, flag: u32) -> Self {
        Self(self.0 | flag)
    }

    /// Returns the flags with `flag` cleared.
    #[must_use]
    pub const fn disable(self, flag: u32) -> Self {
        Self(self.0 & !flag)
    }

    /// Applies a patch.
    #[must_use]
    pub const fn patch(self, patch: FlagsPatch) -> Self {
        Self((self.0 & !patch.active) | (patch.enabled & patch.active))
    }

    /// The patch turning `self` into `that`.
    #[must_use]
    pub const fn diff(self, that: Self) -> FlagsPatch {
        FlagsPatch {
            active: self.0 ^ that.0,
            enabled: that.0,
        }
    }
}

impl std::fmt::Debug for RuntimeFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut set = f.debug_set();
        if self.interruption() {
            set.entry(&"interruption");
        }
        if self.cooperative_yielding() {
            set.entry(&"cooperative-yielding");
        }
        if self.op_supervision() {
            set.entry(&"op-supervision");
        }
        if self.wind_down() {
            set.entry(&"wind-down");
        }
        set.finish()
    }
}

/// A reversible change to a [`RuntimeFlags`] set.
///
/// `active` selects which bits the patch controls; `enabled` gives their new
/// values. Bits outside `active` are untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlagsPatch {
    active: u32,
    enabled: u32,
}

impl FlagsPatch {
    /// The patch that changes nothing.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            active: 0,
            enabled: 0,
        }
    }

    /// A patch setting `flag`.
    #[must_use]
    pub const fn enable(flag: u32) -> Self {
        Self {
            active: flag,
            enabled: flag,
        }
    }

    /// A patch clearing `flag`.
    #[must_use]
    pub const fn disable(flag: u32) -> Self {
        Self {
            active: flag,
            enabled: 0,
        }
    }

    /// Whether the patch changes nothing.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.active == 0
    }

    /// Sequential composition: apply `self`, then `that`.
    #[must_use]
    pub const fn and_then(self, that: Self) -> Self {
        Self {
            active: self.active | that.active,
            enabled: (self.enabled & !that.active) | (that.enabled & that.active),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uninterruptible_patch_round_trips() {
        let flags = RuntimeFlags::default_set();
        let masked = flags.patch(FlagsPatch::disable(RuntimeFlags::INTERRUPTION));
        assert!(!masked.interruptible());
        assert!(masked.cooperative_yielding());
        let restored = masked.patch(masked.diff(flags));
        assert_eq!(restored, flags);
    }

    #[test]
    fn wind_down_blocks_interruption() {
        let flags = RuntimeFlags::default_set().enable(RuntimeFlags::WIND_DOWN);
        assert!(flags.interruption());
        assert!(!flags.interruptible());
    }

    #[test]
    fn diff_then_patch_is_identity() {
        let a = RuntimeFlags::default_set();
        let b = RuntimeFlags::none().enable(RuntimeFlags::WIND_DOWN);
        assert_eq!(a.patch(a.diff(b)), b);
    }

    #[test]
    fn and_then_later_patch_wins() {
        let p = FlagsPatch::enable(RuntimeFlags::INTERRUPTION)
            .and_then(FlagsPatch::disable(RuntimeFlags::INTERRUPTION));
        let flags = RuntimeFlags::default_set().patch(p);
        assert!(!flags.interruption());
    }
}
