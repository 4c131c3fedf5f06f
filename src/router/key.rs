use std::fmt;
use std::ops::BitOr;

use super::RouterObjectBase;

/// Identity of a router object: the manager it belongs to, the zone and the object id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RouterKey {
    pub type_id: u32,
    pub zone_id: u32,
    pub object_id: u64,
}

impl RouterKey {
    pub const fn new(
        type_id: u32,
        zone_id: u32,
        object_id: u64,
    ) -> Self {
        Self {
            type_id,
            zone_id,
            object_id,
        }
    }
}

impl fmt::Display for RouterKey {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}:{}:{}", self.type_id, self.zone_id, self.object_id)
    }
}

/// One or more bits of the router object flag word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RouterObjectFlag(u32);

impl RouterObjectFlag {
    /// The next mutable_object must pull again
    pub const FORCE_PULL_OBJECT: Self = Self(0x0001);
    /// Writable entity present
    pub const IS_OBJECT: Self = Self(0x0002);
    /// The next timer round must save
    pub const FORCE_SAVE_OBJECT: Self = Self(0x0004);
    /// Detached from the manager map, may still live in running tasks
    pub const CACHE_REMOVED: Self = Self(0x0008);
    pub const SAVING: Self = Self(0x0010);
    pub const TRANSFERING: Self = Self(0x0020);
    pub const PULLING_CACHE: Self = Self(0x0040);
    pub const PULLING_OBJECT: Self = Self(0x0080);
    /// A queued downgrade is still valid
    pub const SCHED_REMOVE_OBJECT: Self = Self(0x0100);
    /// A queued cache removal is still valid
    pub const SCHED_REMOVE_CACHE: Self = Self(0x0200);
    /// A queued save is still valid
    pub const SCHED_SAVE_OBJECT: Self = Self(0x0400);
    /// The next timer round must downgrade
    pub const FORCE_REMOVE_OBJECT: Self = Self(0x0800);
    pub const REMOVING_CACHE: Self = Self(0x1000);
    pub const REMOVING_OBJECT: Self = Self(0x2000);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(
        self,
        other: Self,
    ) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for RouterObjectFlag {
    type Output = Self;

    fn bitor(
        self,
        rhs: Self,
    ) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for RouterObjectFlag {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "RouterObjectFlag({:#06x})", self.0)
    }
}

/// Sets `flag` for the lifetime of the guard and clears it on drop.
///
/// The flag is cleared on drop even when it was already set on entry.
pub struct FlagGuard<'a> {
    base: &'a RouterObjectBase,
    flag: RouterObjectFlag,
}

impl<'a> FlagGuard<'a> {
    pub fn new(
        base: &'a RouterObjectBase,
        flag: RouterObjectFlag,
    ) -> Self {
        if !base.check_flag(flag) {
            base.set_flag(flag);
        }
        Self { base, flag }
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.base.unset_flag(self.flag);
    }
}
