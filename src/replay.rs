//! Replays io_buffer allocation events and tracks who owns what.

use ahash::AHashMap;
use thiserror::Error;

use crate::event::{Address, Event};
use crate::report::{LiveAllocation, Report};

/// Ownership state of a single buffer address.
///
/// While `live`, `last_caller` is where the buffer was allocated. Once freed it is
/// where the buffer was last freed and `size` is 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub last_caller: Address,
    pub size: u64,
    pub live: bool,
}

/// Invalid transitions seen during replay. None of them stop the replay.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Anomaly {
    #[error("{index}: freed unknown address {buffer} from {caller}")]
    UnknownAddressFree {
        index: usize,
        caller: Address,
        buffer: Address,
    },
    #[error("{index}: double freed {buffer} from {caller} (first freed on {first_freed_by})")]
    DoubleFree {
        index: usize,
        caller: Address,
        buffer: Address,
        first_freed_by: Address,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub allocations: usize,
    pub frees: usize,
    pub anomalies: usize,
}

#[derive(Debug, Default)]
pub struct Replayer {
    status: AHashMap<Address, Ownership>,
    // outstanding allocations per call site
    callers: AHashMap<Address, i64>,
    anomalies: Vec<Anomaly>,
    stats: ReplayStats,
}

impl Replayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a (re)allocation of `buffer`. A still live record is overwritten
    /// without complaint.
    pub fn process_allocate(&mut self, index: usize, caller: Address, buffer: Address, size: u64) {
        tracing::trace!("{index}: alloc {buffer} ({size} bytes) from {caller}");
        self.stats.allocations += 1;
        self.status.insert(
            buffer,
            Ownership {
                last_caller: caller,
                size,
                live: true,
            },
        );
        *self.callers.entry(caller).or_insert(0) += 1;
    }

    /// Records a free of `buffer`. Returns the anomaly if the free was invalid, in
    /// which case no state changed.
    pub fn process_free(&mut self, index: usize, caller: Address, buffer: Address) -> Option<&Anomaly> {
        tracing::trace!("{index}: free {buffer} from {caller}");
        self.stats.frees += 1;

        let anomaly = match self.status.get_mut(&buffer) {
            None => Anomaly::UnknownAddressFree {
                index,
                caller,
                buffer,
            },
            Some(ownership) if !ownership.live => Anomaly::DoubleFree {
                index,
                caller,
                buffer,
                first_freed_by: ownership.last_caller,
            },
            Some(ownership) => {
                let allocated_by = ownership.last_caller;
                *ownership = Ownership {
                    last_caller: caller,
                    size: 0,
                    live: false,
                };
                *self.callers.entry(allocated_by).or_insert(0) -= 1;
                return None;
            }
        };

        tracing::debug!("{anomaly}");
        self.stats.anomalies += 1;
        self.anomalies.push(anomaly);
        self.anomalies.last()
    }

    pub fn apply(&mut self, index: usize, event: &Event) {
        match *event {
            Event::Allocate {
                caller,
                buffer,
                size,
            } => self.process_allocate(index, caller, buffer, size),
            Event::Free { caller, buffer } => {
                self.process_free(index, caller, buffer);
            }
        }
    }

    /// Applies `events` in order, stopping at the first one whose line index reaches
    /// `limit`. Indices are raw line numbers, so skipped lines count toward the limit.
    pub fn replay<I>(&mut self, events: I, limit: Option<usize>)
    where
        I: IntoIterator<Item = (usize, Event)>,
    {
        for (index, event) in events {
            if limit.map_or(false, |limit| index >= limit) {
                tracing::debug!("stopping at line {index}, limit reached");
                break;
            }
            self.apply(index, &event);
        }
    }

    pub fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }

    pub fn stats(&self) -> ReplayStats {
        self.stats
    }

    /// Live allocations and call sites with a nonzero outstanding count.
    pub fn snapshot(&self) -> Report {
        let status = self
            .status
            .iter()
            .filter(|(_, ownership)| ownership.live)
            .map(|(&addr, ownership)| {
                (
                    addr,
                    LiveAllocation {
                        caller: ownership.last_caller,
                        size: ownership.size,
                    },
                )
            })
            .collect();

        let callers = self
            .callers
            .iter()
            .filter(|&(_, &count)| count != 0)
            .map(|(&addr, &count)| (addr, count))
            .collect();

        Report { status, callers }
    }
}
