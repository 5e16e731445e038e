//! Per-descriptor accounting slots indexed by descriptor number.

/// What a live slot refers to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DescriptorKind {
    #[default]
    None,
    File,
    Socket,
}

/// Accounting for one open descriptor.
///
/// `path` holds the file path for files and the peer address for sockets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorEntry {
    pub kind: DescriptorKind,
    pub path: String,
    pub port: u16,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub read_ops: u64,
    pub write_ops: u64,
    pub bytes_sought: u64,
    pub seek_ops: u64,
}

impl DescriptorEntry {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            kind: DescriptorKind::File,
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn socket(address: impl Into<String>, port: u16) -> Self {
        Self {
            kind: DescriptorKind::Socket,
            path: address.into(),
            port,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kind == DescriptorKind::None
    }

    /// Same target with all counters zeroed.
    pub fn fresh_copy(&self) -> Self {
        Self {
            kind: self.kind,
            path: self.path.clone(),
            port: self.port,
            ..Default::default()
        }
    }
}

const INITIAL_CAPACITY: usize = 256;

/// Slots indexed by descriptor number. Grows by doubling, never shrinks.
#[derive(Debug, Clone)]
pub struct DescriptorTable {
    slots: Vec<DescriptorEntry>,
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![DescriptorEntry::default(); capacity.max(1)],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Grows the table until `fd` is a valid index. Negative descriptors
    /// are never valid.
    pub fn ensure_capacity(&mut self, fd: i32) -> bool {
        let Ok(idx) = usize::try_from(fd) else {
            return false;
        };
        if idx >= self.slots.len() {
            let mut len = self.slots.len();
            while len <= idx {
                len *= 2;
            }
            self.slots.resize(len, DescriptorEntry::default());
        }
        true
    }

    /// Slot for `fd`, growing the table first. `None` for negative descriptors.
    pub fn slot_mut(&mut self, fd: i32) -> Option<&mut DescriptorEntry> {
        if !self.ensure_capacity(fd) {
            return None;
        }
        self.slots.get_mut(fd as usize)
    }

    /// Live entry for `fd`, if any. Never grows the table.
    pub fn live_mut(&mut self, fd: i32) -> Option<&mut DescriptorEntry> {
        let idx = usize::try_from(fd).ok()?;
        self.slots.get_mut(idx).filter(|e| !e.is_empty())
    }

    pub fn get(&self, fd: i32) -> Option<&DescriptorEntry> {
        let idx = usize::try_from(fd).ok()?;
        self.slots.get(idx).filter(|e| !e.is_empty())
    }

    /// Resets the slot and returns what it held, if it was live.
    pub fn take(&mut self, fd: i32) -> Option<DescriptorEntry> {
        let slot = self.live_mut(fd)?;
        Some(std::mem::take(slot))
    }

    /// Descriptor numbers of every live slot, ascending.
    pub fn live_descriptors(&self) -> Vec<i32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_empty())
            .map(|(idx, _)| idx as i32)
            .collect()
    }
}
