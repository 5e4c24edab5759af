use std::cell::{RefCell, RefMut};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// A descriptor the tracee obtained through a translated path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdEntry {
    /// Host path the kernel opened.
    pub path: PathBuf,
    /// Closed by the kernel on a successful execve.
    pub cloexec: bool,
}

impl FdEntry {
    pub fn new(path: impl Into<PathBuf>, cloexec: bool) -> Self {
        Self {
            path: path.into(),
            cloexec,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

struct FdTableInner {
    entries: HashMap<i32, FdEntry>,
}

/// Per-process record of which descriptors were opened from which host path.
///
/// The kernel picks descriptor numbers; this table only mirrors its choices
/// so the fd audit can compare them with `/proc/<pid>/fd`. Descriptors the
/// tracee got any other way (pipes, sockets, inherited stdio) are absent.
///
/// Cloning a handle shares the table, as `clone(CLONE_FILES)` does;
/// `deep_clone()` gives a forked child its own copy.
#[derive(Clone)]
pub struct FdTable {
    inner: Rc<RefCell<FdTableInner>>,
}

impl FdTable {
    fn table(&self) -> RefMut<'_, FdTableInner> {
        self.inner.borrow_mut()
    }

    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(FdTableInner {
                entries: HashMap::new(),
            })),
        }
    }

    /// Independent copy for a forked child.
    pub fn deep_clone(&self) -> Self {
        let inner = self.table();

        Self {
            inner: Rc::new(RefCell::new(FdTableInner {
                entries: inner.entries.clone(),
            })),
        }
    }

    /// Whether both handles refer to the same underlying table.
    pub fn is_shared_with(&self, other: &FdTable) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Record the descriptor the kernel returned for an open.
    ///
    /// Returns the entry previously recorded at `fd`, which the kernel must
    /// have closed behind our back.
    pub fn insert(&self, fd: i32, entry: FdEntry) -> Option<FdEntry> {
        let mut inner = self.table();
        inner.entries.insert(fd, entry)
    }

    pub fn get(&self, fd: i32) -> Option<FdEntry> {
        let inner = self.table();
        inner.entries.get(&fd).cloned()
    }

    pub fn remove(&self, fd: i32) -> Option<FdEntry> {
        let mut inner = self.table();
        inner.entries.remove(&fd)
    }

    /// Forget every descriptor in `first..=last` (close_range).
    pub fn remove_range(&self, first: i32, last: i32) {
        let mut inner = self.table();
        inner.entries.retain(|&fd, _| fd < first || fd > last);
    }

    /// Mirror dup/dup2/dup3/F_DUPFD: `new_fd` now refers to whatever `old_fd` does.
    ///
    /// The duplicate never inherits close-on-exec; `cloexec` sets it explicitly.
    /// Returns the entry previously recorded at `new_fd`.
    pub fn duplicate_at(&self, old_fd: i32, new_fd: i32, cloexec: bool) -> Option<FdEntry> {
        let mut inner = self.table();
        if old_fd == new_fd {
            return None;
        }
        match inner.entries.get(&old_fd).cloned() {
            Some(entry) => inner.entries.insert(new_fd, FdEntry { cloexec, ..entry }),
            // Untracked source: whatever was recorded at new_fd is gone.
            None => inner.entries.remove(&new_fd),
        }
    }

    pub fn set_cloexec(&self, fd: i32, cloexec: bool) {
        let mut inner = self.table();
        if let Some(entry) = inner.entries.get_mut(&fd) {
            entry.cloexec = cloexec;
        }
    }

    /// close_range(CLOSE_RANGE_CLOEXEC): flag every descriptor in `first..=last`.
    pub fn set_cloexec_range(&self, first: i32, last: i32) {
        let mut inner = self.table();
        for (_, entry) in inner
            .entries
            .iter_mut()
            .filter(|(&fd, _)| fd >= first && fd <= last)
        {
            entry.cloexec = true;
        }
    }

    /// Drop close-on-exec descriptors after a successful execve.
    pub fn close_on_exec(&self) {
        let mut inner = self.table();
        inner.entries.retain(|_, entry| !entry.cloexec);
    }

    pub fn len(&self) -> usize {
        let inner = self.table();
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FdTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.table();
        f.debug_struct("FdTable")
            .field("entry_count", &inner.entries.len())
            .finish()
    }
}
