//! Page lifecycle states.
//!
//! ```text
//!  NOT_READY ──► LOADING ──► USABLE ──► ABOUT_TO_UNMAP ──► PRE_TOMBSTONE ──► TOMBSTONE
//!      │            │                                            ▲               ▲
//!      │            └────────────── load failed ─────────────────┼───────────────┘
//!      └──────────────────── entomb young (storage close) ───────┘
//! ```
//!
//! States only ever move forward. The state and the usage count share one
//! `u32` (state in the high byte, usage in the low 24 bits) so one CAS
//! moves both.

use std::fmt;

use pagecache_common::constants::MAX_PAGE_USAGE_COUNT;

const STATE_SHIFT: u32 = 24;

/// Lifecycle state of a cached page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PageState {
    /// Created, content not loaded yet.
    NotReady = 0,
    /// One thread is loading the content.
    Loading = 1,
    /// Content present; the page can be acquired.
    Usable = 2,
    /// Chosen for eviction; existing users may finish, no new ones enter.
    AboutToUnmap = 3,
    /// Unused and committed to eviction; content is being flushed and freed.
    PreTombstone = 4,
    /// Dead. The table slot may be reused.
    Tombstone = 5,
}

impl PageState {
    /// Decodes a state byte.
    ///
    /// # Panics
    ///
    /// Panics on an unknown state value, which means the state word is corrupted.
    #[inline]
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotReady,
            1 => Self::Loading,
            2 => Self::Usable,
            3 => Self::AboutToUnmap,
            4 => Self::PreTombstone,
            5 => Self::Tombstone,
            other => panic!("unknown page state {other}"),
        }
    }

    /// Returns true if a page in this state may hold a content buffer.
    #[inline]
    pub fn may_have_content(self) -> bool {
        matches!(self, Self::Usable | Self::AboutToUnmap | Self::PreTombstone)
    }

    /// Returns true if the page can still be handed out to users.
    #[inline]
    pub fn is_alive(self) -> bool {
        self < Self::AboutToUnmap
    }
}

impl fmt::Display for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotReady => "NOT_READY",
            Self::Loading => "LOADING",
            Self::Usable => "USABLE",
            Self::AboutToUnmap => "ABOUT_TO_UNMAP",
            Self::PreTombstone => "PRE_TOMBSTONE",
            Self::Tombstone => "TOMBSTONE",
        };
        f.write_str(name)
    }
}

/// State and usage count packed into one word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct PackedState(u32);

impl PackedState {
    #[inline]
    pub(crate) const fn new(state: PageState, usage_count: u32) -> Self {
        Self(((state as u32) << STATE_SHIFT) | (usage_count & MAX_PAGE_USAGE_COUNT))
    }

    #[inline]
    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub(crate) const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub(crate) fn state(self) -> PageState {
        PageState::from_u8((self.0 >> STATE_SHIFT) as u8)
    }

    #[inline]
    pub(crate) const fn usage_count(self) -> u32 {
        self.0 & MAX_PAGE_USAGE_COUNT
    }

    #[inline]
    pub(crate) fn with_state(self, state: PageState) -> Self {
        Self::new(state, self.usage_count())
    }

    #[inline]
    pub(crate) fn with_usage(self, usage_count: u32) -> Self {
        Self::new(self.state(), usage_count)
    }
}

impl fmt::Debug for PackedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[usage={}]", self.state(), self.usage_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let packed = PackedState::new(PageState::AboutToUnmap, 17);
        assert_eq!(packed.state(), PageState::AboutToUnmap);
        assert_eq!(packed.usage_count(), 17);

        let moved = packed.with_state(PageState::PreTombstone);
        assert_eq!(moved.usage_count(), 17);
        assert_eq!(moved.with_usage(0).usage_count(), 0);
    }

    #[test]
    fn test_usage_does_not_leak_into_state() {
        let packed = PackedState::new(PageState::Usable, MAX_PAGE_USAGE_COUNT);
        assert_eq!(packed.state(), PageState::Usable);
        assert_eq!(packed.usage_count(), MAX_PAGE_USAGE_COUNT);
    }

    #[test]
    fn test_state_order() {
        assert!(PageState::NotReady < PageState::Loading);
        assert!(PageState::PreTombstone < PageState::Tombstone);
        assert!(PageState::Usable.is_alive());
        assert!(!PageState::AboutToUnmap.is_alive());
        assert!(!PageState::Loading.may_have_content());
        assert_eq!(PageState::from_u8(5), PageState::Tombstone);
        assert_eq!(PageState::PreTombstone.to_string(), "PRE_TOMBSTONE");
    }

    #[test]
    #[should_panic(expected = "unknown page state")]
    fn test_corrupted_state() {
        let _ = PageState::from_u8(9);
    }
}
