//! Knote: one registered interest inside a kqueue.
//!
//! A knote is the durable record a filter keeps for each `(filter, ident)`
//! registration, together with the OS resource backing it. The store is
//! the sole owner; transient `Arc` clones taken during copyout keep a
//! knote alive across the brief window in which another thread deletes it.

use crate::event::{EventFlags, KEvent};

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

#[cfg(unix)]
use std::os::fd::OwnedFd;

/// The OS resource backing a knote.
///
/// Allocated when the knote is added, released when it is deleted; the
/// drop of the owned descriptor is the release.
pub(crate) enum Backing {
    /// No resource (user filter, or a not-yet-armed registration).
    None,

    /// A dedicated descriptor: a dup of the user's fd, a timerfd, an
    /// eventfd, or a pidfd, depending on the filter.
    #[cfg(unix)]
    Fd(OwnedFd),

    /// An inotify watch descriptor owned by the filter's shared instance.
    #[cfg(unix)]
    Watch(i32),

    /// Membership in the shared signalfd mask.
    #[cfg(unix)]
    Signal,
}

impl Backing {
    #[cfg(unix)]
    pub(crate) fn fd(&self) -> Option<&OwnedFd> {
        match self {
            Backing::Fd(fd) => Some(fd),
            _ => None,
        }
    }
}

/// Mutable knote state, guarded by the per-knote lock.
pub(crate) struct KnoteState {
    /// Behavior bits recorded at registration (ONESHOT, CLEAR, DISPATCH).
    pub(crate) flags: EventFlags,

    /// Filter-specific flags as last submitted.
    pub(crate) fflags: u32,

    /// Opaque user value echoed in every delivery.
    pub(crate) udata: usize,

    /// Disabled knotes keep their resources but are never delivered.
    pub(crate) enabled: bool,

    /// The backing OS resource.
    pub(crate) backing: Backing,

    /// Aggregator token while registered with the outer primitive.
    pub(crate) token: Option<usize>,

    /// Set once a oneshot delivery happened; later wakes are discarded.
    pub(crate) delivered: bool,

    /// Filter-specific scratch: signal delivery count.
    pub(crate) counter: u64,

    /// Filter-specific scratch: pending note mask, or a trigger bit.
    pub(crate) pending: u32,
}

/// One registration record, owned by its filter's store.
pub(crate) struct Knote {
    pub(crate) ident: u64,
    pub(crate) filter: i16,
    state: Mutex<KnoteState>,
}

impl Knote {
    /// Creates a knote from the change event that registered it.
    pub(crate) fn new(filter: i16, change: &KEvent, backing: Backing) -> Arc<Self> {
        let flags = change.event_flags();
        Arc::new(Self {
            ident: change.ident as u64,
            filter,
            state: Mutex::new(KnoteState {
                flags: flags.behavior(),
                fflags: change.fflags,
                udata: change.udata,
                enabled: !flags.contains(EventFlags::DISABLE),
                backing,
                token: None,
                delivered: false,
                counter: 0,
                pending: 0,
            }),
        })
    }

    /// Locks the knote state. Always the innermost lock.
    pub(crate) fn lock(&self) -> MutexGuard<'_, KnoteState> {
        self.state.lock().unwrap()
    }

    /// Starts a delivery event carrying this knote's identity.
    ///
    /// The caller fills in `data`, `fflags` and any extra flag bits.
    pub(crate) fn delivery(&self, state: &KnoteState) -> KEvent {
        KEvent {
            ident: self.ident as usize,
            filter: self.filter,
            flags: state.flags.bits(),
            fflags: 0,
            data: 0,
            udata: state.udata,
        }
    }
}

/// Per-filter index of knotes by ident.
pub(crate) struct KnoteStore {
    notes: HashMap<u64, Arc<Knote>>,
}

impl KnoteStore {
    pub(crate) fn new() -> Self {
        Self {
            notes: HashMap::new(),
        }
    }

    /// Inserts a fresh knote; a second registration of the same ident
    /// fails with `EEXIST`.
    pub(crate) fn insert(&mut self, knote: Arc<Knote>) -> io::Result<()> {
        match self.notes.entry(knote.ident) {
            std::collections::hash_map::Entry::Occupied(_) => {
                Err(crate::sys::errno(libc::EEXIST))
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(knote);
                Ok(())
            }
        }
    }

    /// Borrows a knote; the clone is the transient reference that keeps
    /// it alive across delivery/deletion races.
    pub(crate) fn get(&self, ident: u64) -> Option<Arc<Knote>> {
        self.notes.get(&ident).cloned()
    }

    /// Detaches a knote from the index.
    pub(crate) fn remove(&mut self, ident: u64) -> Option<Arc<Knote>> {
        self.notes.remove(&ident)
    }

    /// Drains every knote, for teardown under the filter lock.
    pub(crate) fn drain(&mut self) -> Vec<Arc<Knote>> {
        self.notes.drain().map(|(_, kn)| kn).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }
}
