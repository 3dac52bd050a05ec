//! Reader state machine (component D, reader half).
//!
//! This selects the "reset on inactivity" variant of the two reader state
//! machines the original driver sources carry across revisions (§9 open
//! question): a reader that observes an inactive channel drops back to
//! `Unsynced` rather than trusting a stale `epoch == 0`, because that is
//! strictly safer against a writer that reactivates with a colliding epoch.
use crate::channel::{Channel, NULL_EPOCH, SHMSTREAM20};

/// Outcome of one [`Reader::read`] call — the full taxonomy named in §4.D.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadResult {
    Inactive,
    IncompatibleInterface,
    EpochChanged,
    NoData,
    OverrunDetected,
    Success,
}

#[derive(Debug, Clone, Copy)]
enum ReaderState {
    Unsynced,
    Synced {
        epoch: u64,
        element_size: u64,
        elements: u64,
        rc: u64,
    },
}

/// Per-consumer reader state (§3). Exclusively owned by its consumer; it
/// never leaves its thread/CPU.
#[derive(Debug, Clone, Copy)]
pub struct Reader {
    protocol: u64,
    state: ReaderState,
}

impl Reader {
    pub fn init(protocol: u64) -> Self {
        Self {
            protocol,
            state: ReaderState::Unsynced,
        }
    }

    /// The epoch this reader last synchronised to, or `0` if unsynced.
    pub fn epoch(&self) -> u64 {
        match self.state {
            ReaderState::Unsynced => NULL_EPOCH,
            ReaderState::Synced { epoch, .. } => epoch,
        }
    }

    /// Element size negotiated at the last synchronisation; `None` before
    /// the first `EPOCH_CHANGED`.
    pub fn element_size(&self) -> Option<u64> {
        match self.state {
            ReaderState::Unsynced => None,
            ReaderState::Synced { element_size, .. } => Some(element_size),
        }
    }

    pub fn read_count(&self) -> u64 {
        match self.state {
            ReaderState::Unsynced => 0,
            ReaderState::Synced { rc, .. } => rc,
        }
    }

    pub fn is_synced(&self) -> bool {
        matches!(self.state, ReaderState::Synced { .. })
    }

    fn synchronise(&mut self, channel: &Channel) -> ReadResult {
        if channel.transport() == SHMSTREAM20 && channel.protocol() == self.protocol {
            self.state = ReaderState::Synced {
                epoch: channel.epoch(),
                element_size: channel.element_size(),
                elements: channel.elements(),
                rc: 0,
            };
            ReadResult::EpochChanged
        } else {
            ReadResult::IncompatibleInterface
        }
    }

    /// Reads one element into `out`, which must be at least
    /// [`Reader::element_size`] bytes once synced.
    ///
    /// Mirrors §4.D's pseudocode precisely, including the mandatory epoch
    /// re-check after the payload copy: without it a writer reset mid-copy
    /// could deliver torn data labelled `SUCCESS`.
    pub fn read(&mut self, channel: &Channel, out: &mut [u8]) -> ReadResult {
        if !channel.is_active() {
            self.state = ReaderState::Unsynced;
            return ReadResult::Inactive;
        }

        let channel_epoch = channel.epoch();
        let stale = match self.state {
            ReaderState::Unsynced => true,
            ReaderState::Synced { epoch, .. } => epoch != channel_epoch,
        };
        if stale {
            return self.synchronise(channel);
        }

        let ReaderState::Synced {
            epoch,
            element_size,
            elements,
            mut rc,
        } = self.state
        else {
            unreachable!("checked not stale above")
        };

        let wc = channel.wc();
        if rc >= wc {
            return ReadResult::NoData;
        }

        let slot = rc % elements;
        assert!(
            out.len() as u64 >= element_size,
            "read buffer of {} bytes too small for {element_size}-byte element",
            out.len()
        );
        channel.copy_out(slot, element_size, out);

        let mut result = if channel.wsc() > rc + elements {
            rc = wc;
            ReadResult::OverrunDetected
        } else {
            rc += 1;
            ReadResult::Success
        };

        self.state = ReaderState::Synced {
            epoch,
            element_size,
            elements,
            rc,
        };

        if channel.epoch() != epoch {
            result = ReadResult::EpochChanged;
        }
        result
    }

    /// Discards any backlog by fast-forwarding to the writer's current count.
    pub fn drain(&mut self, channel: &Channel) {
        if let ReaderState::Synced { rc, .. } = &mut self.state {
            *rc = channel.wc();
        }
    }
}
