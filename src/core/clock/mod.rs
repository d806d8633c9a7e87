use std::collections::BinaryHeap;
use std::cmp::Ordering;
use std::hash::Hash;

/// A due event handed back by the queue. `over_cycles` tells the callback
/// how far past its due time it is being dispatched, so periodic timers can
/// re-arm without drift.
#[derive(Debug, Clone)]
pub struct Event<E> {
    pub event_type: E,
    pub over_cycles: u64,
}

#[derive(Debug, Clone)]
struct ClockEvent<E> {
    event_type: E,
    timestamp: u64,
}

impl<E> PartialEq for ClockEvent<E> {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp
    }
}

impl<E> Eq for ClockEvent<E> {}

impl<E> PartialOrd for ClockEvent<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for ClockEvent<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        // for min-heap
        other.timestamp.cmp(&self.timestamp)
    }
}

/// Simulation clock shared by every device model of one machine. Time is
/// counted in executed instruction cycles; devices schedule callbacks at a
/// relative distance and the main loop drains everything that has come due.
///
/// A cancelled event is removed from the heap immediately, so it will not
/// fire even if its due time has already been reached within the current
/// drain.
pub struct Clock<E> {
    events: BinaryHeap<ClockEvent<E>>,
    current_time: u64,
}

impl<E: Clone + PartialEq + Eq + Hash> Clock<E> {
    pub fn new() -> Self {
        Self {
            events: BinaryHeap::new(),
            current_time: 0,
        }
    }

    pub fn advance_time(&mut self, cycles: u64) {
        self.current_time += cycles;
    }

    pub fn schedule(&mut self, event_type: E, cycles_ahead: u64) -> u64 {
        let target = self.current_time + cycles_ahead;
        self.events.push(ClockEvent {
            event_type,
            timestamp: target,
        });
        target
    }

    pub fn schedule_absolute(&mut self, event_type: E, timestamp: u64) {
        self.events.push(ClockEvent {
            event_type,
            timestamp,
        });
    }

    pub fn cancel(&mut self, event_type: E) {
        self.events.retain(|e| e.event_type != event_type);
    }

    pub fn is_scheduled(&self, event_type: E) -> bool {
        self.events.iter().any(|e| e.event_type == event_type)
    }

    pub fn next_events(&mut self) -> Vec<Event<E>> {
        let mut events = Vec::new();
        while let Some(event) = self.events.peek()
            && event.timestamp <= self.current_time
        {
            let event = self.events.pop().unwrap();
            events.push(Event {
                event_type: event.event_type,
                over_cycles: self.current_time - event.timestamp,
            });
        }
        events
    }

    pub fn has_ready_event(&self) -> bool {
        self.events.peek().map_or(false, |e| self.current_time >= e.timestamp)
    }

    pub fn next_event_time(&self) -> Option<u64> {
        self.events.peek().map(|e| e.timestamp)
    }

    pub fn current_time(&self) -> u64 {
        self.current_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TestEvent {
        Tick,
        Tock,
    }

    #[test]
    fn dispatches_in_due_order() {
        let mut clock = Clock::new();
        clock.schedule(TestEvent::Tock, 20);
        clock.schedule(TestEvent::Tick, 10);

        clock.advance_time(9);
        assert!(!clock.has_ready_event());
        clock.advance_time(1);
        assert!(clock.has_ready_event());

        let events = clock.next_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, TestEvent::Tick);
        assert_eq!(events[0].over_cycles, 0);

        clock.advance_time(15);
        let events = clock.next_events();
        assert_eq!(events[0].event_type, TestEvent::Tock);
        assert_eq!(events[0].over_cycles, 5);
    }

    #[test]
    fn cancel_removes_due_event() {
        let mut clock = Clock::new();
        clock.schedule(TestEvent::Tick, 5);
        clock.advance_time(10);
        // Due but not yet dispatched: cancellation still wins.
        clock.cancel(TestEvent::Tick);
        assert!(clock.next_events().is_empty());
    }

    #[test]
    fn callback_rearm_keeps_period() {
        let mut clock = Clock::new();
        clock.schedule(TestEvent::Tick, 100);
        clock.advance_time(105);
        let ev = clock.next_events().pop().unwrap();
        clock.schedule(TestEvent::Tick, 100 - ev.over_cycles);
        assert_eq!(clock.next_event_time(), Some(200));
    }
}
