//! Fixed-capacity `CA -> (CL, hash)` page: the unit of caching and
//! persistence for the `MetaDataStore`.

use crate::types::{ClusterAddress, ClusterLocation, ContentHash, PageId};
use std::collections::HashMap;

/// Entries per page. `CA / PAGE_SIZE` gives the owning `PageId`.
pub const PAGE_SIZE: u32 = 256;

pub fn page_of(ca: ClusterAddress) -> PageId {
    ca / PAGE_SIZE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Clean,
    Dirty,
    Flushed,
    Evictable,
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    pub entries: HashMap<ClusterAddress, (ClusterLocation, ContentHash)>,
}

impl Page {
    pub fn get(&self, ca: ClusterAddress) -> Option<(ClusterLocation, ContentHash)> {
        self.entries.get(&ca).copied()
    }

    pub fn set(&mut self, ca: ClusterAddress, cl: ClusterLocation, hash: ContentHash) {
        self.entries.insert(ca, (cl, hash));
    }
}
