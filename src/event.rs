//! # Driver events
//!
//! State transitions detected by the poll loop are surfaced as [`Event`]
//! values. Delivery is two-fold: an optional synchronous hook invoked while
//! the driver lock is held (keep handlers short, never block), and a bounded
//! queue drained with [`Emtr::next_event`](crate::Emtr::next_event). A
//! handler that wants to issue its own EMTR command should do so from its
//! task through the public API; the driver mutex serializes it behind the
//! in-flight transaction.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

/// Depth of the event queue. When it overflows the oldest event is dropped
/// to make room; readers are expected to keep up.
pub const EVT_QUEUE_SZ: usize = 16;

/// Synchronous event hook, called with the driver lock held
pub type EventFn = fn(Event);

/// Driver event, data carried by value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// EMTR communication restored
    CommUp,
    /// EMTR communication lost, cached state is stale from here on
    CommDown,
    /// A hard reset was issued to the EMTR
    Reset,
    /// Debounced relay state change
    RelayState { sock_num: u8, active: bool },
    /// Debounced plug insert/remove
    PlugState { sock_num: u8, present: bool },
    /// Debounced load presence change
    LoadState { sock_num: u8, active: bool },
    /// Debounced overload state change
    Overload { sock_num: u8, active: bool },
    /// The EMTR requested a factory reset; polling has stopped
    FactoryReset,
}

/// Where poll-loop and command-engine internals report events
pub(crate) struct EventSink<'a> {
    pub hook: Option<EventFn>,
    pub queue: &'a Channel<CriticalSectionRawMutex, Event, EVT_QUEUE_SZ>,
}

impl EventSink<'_> {
    pub fn notify(&self, event: Event) {
        if let Some(hook) = self.hook {
            hook(event);
        }
        // A full queue drops the oldest event to make room for the newest
        if self.queue.try_send(event).is_err() {
            let _ = self.queue.try_receive();
            let _ = self.queue.try_send(event);
        }
    }
}
