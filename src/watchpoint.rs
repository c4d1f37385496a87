//! Per-node subscriber registry with a derived union mask.
//!
//! A `Watchpoint` maps subscriber channels to the event sets they asked for
//! and keeps the union of all entries in an explicit `total` field, used as a
//! cheap pre-filter before iterating subscribers on the dispatch hot path.
//! The [`EventDiff`] returned by `add`/`del` is the unit of "which native
//! syscall, if any, must run" — callers never re-derive it.

use crossbeam_channel::Sender;

use crate::event::{Event, EventInfo};

/// A `(before, after)` pair of union event masks describing how a mutation
/// changed a watchpoint, with the internal control bits stripped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct EventDiff {
    pub(crate) old: Event,
    pub(crate) new: Event,
}

impl EventDiff {
    /// Bits present after the mutation but not before.
    #[cfg(test)]
    pub(crate) fn added(&self) -> Event {
        self.new - self.old
    }
}

/// Reports whether `event` is delivered for a registration mask `set`.
///
/// The `OMIT` control bit must agree on both sides, so internal
/// registrations never see user events and vice versa; beyond that every bit
/// of the event must be covered by the set. Recursive-tagged dispatches only
/// reach sets carrying the `RECURSIVE` bit.
pub(crate) fn matches(set: Event, event: Event) -> bool {
    ((set ^ event) & Event::OMIT).is_empty() && set.contains(event)
}

#[derive(Default)]
pub(crate) struct Watchpoint {
    entries: Vec<(Sender<EventInfo>, Event)>,
    /// Union of all entry masks, `OMIT` stripped. Kept in sync by
    /// `add`/`del` only.
    total: Event,
}

impl Watchpoint {
    /// ORs `events` into the entry for `tx`, creating it if needed.
    ///
    /// Returns the stripped diff of the union mask, or `None` when the
    /// request added nothing that was not already covered.
    pub(crate) fn add(&mut self, tx: &Sender<EventInfo>, events: Event) -> Option<EventDiff> {
        match self.entries.iter_mut().find(|(s, _)| s.same_channel(tx)) {
            Some((_, mask)) => *mask |= events,
            None => self.entries.push((tx.clone(), events)),
        }
        self.recompute_total()
    }

    /// Clears `events` from the entry for `tx`, dropping the entry when it
    /// becomes empty.
    ///
    /// Returns the stripped diff of the union mask, or `None` when nothing
    /// changed.
    pub(crate) fn del(&mut self, tx: &Sender<EventInfo>, events: Event) -> Option<EventDiff> {
        let pos = self.entries.iter().position(|(s, _)| s.same_channel(tx))?;
        self.entries[pos].1 -= events;
        if self.entries[pos].1.is_empty() {
            self.entries.remove(pos);
        }
        self.recompute_total()
    }

    fn recompute_total(&mut self) -> Option<EventDiff> {
        let old = self.total;
        let mut new = Event::empty();
        for (_, mask) in &self.entries {
            new |= *mask;
        }
        new -= Event::OMIT;
        self.total = new;

        let diff = EventDiff {
            old: old.strip_internal(),
            new: new.strip_internal(),
        };
        if diff.old == diff.new {
            None
        } else {
            Some(diff)
        }
    }

    /// Sends `ei` to every subscriber whose mask matches
    /// `ei.event() | extra`.
    ///
    /// Delivery is non-blocking: a full or disconnected subscriber channel
    /// drops the event for that subscriber only.
    pub(crate) fn dispatch(&self, ei: &EventInfo, extra: Event) {
        let event = ei.event() | extra;
        if !matches(self.total, event) {
            return;
        }
        for (tx, mask) in &self.entries {
            if matches(*mask, event) && tx.try_send(ei.clone()).is_err() {
                log::warn!("dropping event for slow or gone subscriber: {ei}");
            }
        }
    }

    /// Union of all entry masks with `OMIT` stripped.
    pub(crate) fn total(&self) -> Event {
        self.total
    }

    /// Whether any registration asked for subtree coverage.
    pub(crate) fn is_recursive(&self) -> bool {
        self.total.contains(Event::RECURSIVE)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The mask registered for `tx`, if any.
    pub(crate) fn get(&self, tx: &Sender<EventInfo>) -> Option<Event> {
        self.entries
            .iter()
            .find(|(s, _)| s.same_channel(tx))
            .map(|(_, mask)| *mask)
    }

    /// Whether the only remaining registration belongs to `tx`.
    pub(crate) fn only_channel(&self, tx: &Sender<EventInfo>) -> bool {
        !self.entries.is_empty() && self.entries.iter().all(|(s, _)| s.same_channel(tx))
    }

    /// Whether a registration other than `tx` asked for subtree coverage.
    pub(crate) fn has_other_recursive(&self, tx: &Sender<EventInfo>) -> bool {
        self.entries
            .iter()
            .any(|(s, mask)| !s.same_channel(tx) && mask.contains(Event::RECURSIVE))
    }

    /// Moves every entry of `other` into `self`, merging masks per channel.
    pub(crate) fn absorb(&mut self, other: Watchpoint) {
        for (tx, mask) in other.entries {
            self.add(&tx, mask);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{bounded, unbounded};
    use pretty_assertions::assert_eq;

    fn info(event: Event) -> EventInfo {
        EventInfo::new("/tmp/watched/file", event)
    }

    #[test]
    fn add_returns_none_when_covered() {
        let (tx, _rx) = unbounded();
        let mut wp = Watchpoint::default();

        let diff = wp.add(&tx, Event::CREATE).expect("first add changes total");
        assert_eq!(diff.old, Event::empty());
        assert_eq!(diff.new, Event::CREATE);

        // Identical re-subscription is a no-op.
        assert_eq!(wp.add(&tx, Event::CREATE), None);

        // A second channel inside the existing union is a no-op too.
        let (tx2, _rx2) = unbounded();
        assert_eq!(wp.add(&tx2, Event::CREATE), None);

        // Widening reports exactly the added bits.
        let diff = wp.add(&tx2, Event::WRITE).expect("widen");
        assert_eq!(diff.added(), Event::WRITE);
        assert_eq!(wp.total(), Event::CREATE | Event::WRITE);
    }

    #[test]
    fn total_is_always_the_union_of_entries() {
        let (a, _ra) = unbounded();
        let (b, _rb) = unbounded();
        let (c, _rc) = unbounded();
        let mut wp = Watchpoint::default();

        wp.add(&a, Event::CREATE);
        wp.add(&b, Event::WRITE | Event::REMOVE);
        wp.add(&c, Event::RENAME);
        wp.del(&b, Event::REMOVE);
        wp.add(&a, Event::WRITE);
        wp.del(&c, Event::RENAME);

        let mut union = Event::empty();
        for tx in [&a, &b, &c] {
            union |= wp.get(tx).unwrap_or_else(Event::empty);
        }
        assert_eq!(wp.total(), union);
        assert_eq!(wp.total(), Event::CREATE | Event::WRITE);
    }

    #[test]
    fn del_removes_empty_entries_and_unknown_channels_are_noops() {
        let (tx, _rx) = unbounded();
        let (other, _ro) = unbounded();
        let mut wp = Watchpoint::default();
        wp.add(&tx, Event::CREATE);

        assert_eq!(wp.del(&other, Event::CREATE), None);

        let diff = wp.del(&tx, Event::CREATE).expect("del");
        assert_eq!(diff.new, Event::empty());
        assert!(wp.is_empty());
    }

    #[test]
    fn dispatch_filters_by_mask() {
        let (a, ra) = unbounded();
        let (b, rb) = unbounded();
        let mut wp = Watchpoint::default();
        wp.add(&a, Event::CREATE);
        wp.add(&b, Event::WRITE);

        wp.dispatch(&info(Event::WRITE), Event::empty());

        assert!(ra.try_recv().is_err(), "create-only subscriber got a write");
        assert_eq!(rb.try_recv().expect("write subscriber").event(), Event::WRITE);
    }

    #[test]
    fn recursive_extra_bit_only_reaches_recursive_subscribers() {
        let (plain, plain_rx) = unbounded();
        let (rec, rec_rx) = unbounded();
        let mut wp = Watchpoint::default();
        wp.add(&plain, Event::CREATE);
        wp.add(&rec, Event::CREATE | Event::RECURSIVE);

        wp.dispatch(&info(Event::CREATE), Event::RECURSIVE);
        assert!(plain_rx.try_recv().is_err());
        assert!(rec_rx.try_recv().is_ok());

        // Without the extra bit both match.
        wp.dispatch(&info(Event::CREATE), Event::empty());
        assert!(plain_rx.try_recv().is_ok());
        assert!(rec_rx.try_recv().is_ok());
    }

    #[test]
    fn omit_registrations_never_see_user_events() {
        let (internal, internal_rx) = unbounded();
        let mut wp = Watchpoint::default();
        wp.add(&internal, Event::CREATE | Event::RECURSIVE | Event::OMIT);

        // The internal registration keeps the native mask alive...
        assert_eq!(wp.total(), Event::CREATE | Event::RECURSIVE);
        assert!(wp.is_recursive());

        // ...but is never delivered to.
        wp.dispatch(&info(Event::CREATE), Event::empty());
        wp.dispatch(&info(Event::CREATE), Event::RECURSIVE);
        assert!(internal_rx.try_recv().is_err());
    }

    #[test]
    fn full_channels_drop_instead_of_blocking() {
        let (tx, rx) = bounded(1);
        let mut wp = Watchpoint::default();
        wp.add(&tx, Event::WRITE);

        wp.dispatch(&info(Event::WRITE), Event::empty());
        wp.dispatch(&info(Event::WRITE), Event::empty());

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err(), "second event should have been dropped");
    }

    #[test]
    fn absorb_merges_masks_per_channel() {
        let (a, _ra) = unbounded();
        let mut wp = Watchpoint::default();
        wp.add(&a, Event::CREATE);

        let mut other = Watchpoint::default();
        other.add(&a, Event::WRITE);
        wp.absorb(other);

        assert_eq!(wp.get(&a), Some(Event::CREATE | Event::WRITE));
    }
}
