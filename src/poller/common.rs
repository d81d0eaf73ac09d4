/// Readiness interests for one inner registration.
#[derive(Clone, Copy)]
pub(crate) struct Interest {
    pub(crate) read: bool,
    pub(crate) write: bool,

    /// Edge-triggered: report each transition once instead of reporting
    /// for as long as the condition holds.
    pub(crate) edge: bool,
}

impl Interest {
    pub(crate) fn read(edge: bool) -> Self {
        Self {
            read: true,
            write: false,
            edge,
        }
    }

    pub(crate) fn write(edge: bool) -> Self {
        Self {
            read: false,
            write: true,
            edge,
        }
    }
}

/// What a readiness token resolves to.
///
/// This is a weak relation: the knote store remains the sole owner of the
/// knote, and a token surviving past its registration resolves to a source
/// whose lookup fails, which the dispatcher suppresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Source {
    /// An inner descriptor dedicated to one knote.
    Knote { filter: i16, ident: u64 },

    /// An inner descriptor shared by a whole filter (signalfd, inotify).
    /// The filter finds the affected knotes by draining the descriptor.
    Filter { filter: i16 },
}

impl Source {
    pub(crate) fn filter(&self) -> i16 {
        match *self {
            Source::Knote { filter, .. } => filter,
            Source::Filter { filter } => filter,
        }
    }
}

/// One wake-up reported by the aggregator.
pub(crate) struct Wake {
    pub(crate) source: Source,
    pub(crate) readable: bool,
    pub(crate) writable: bool,

    /// Peer hang-up reported by the primitive. Where this bit is
    /// unreliable the read/write filter falls back to the zero-byte peek.
    pub(crate) hup: bool,

    /// Error condition on the inner descriptor.
    pub(crate) error: bool,
}
