//! Watch coordinators: the trees that multiplex subscriptions over native
//! watches.

use crossbeam_channel::Sender;
use std::path::Path;

use crate::error::Result;
use crate::event::{Event, EventInfo};
use crate::node::Node;

pub(crate) mod nonrecursive;
pub(crate) mod recursive;

pub(crate) use nonrecursive::NonRecursiveTree;
pub(crate) use recursive::RecursiveTree;

/// What an [`crate::Engine`] needs from a coordinator.
pub(crate) trait Tree: Send + Sync {
    fn watch(&self, path: &Path, tx: Sender<EventInfo>, events: Event) -> Result<()>;
    fn stop(&self, tx: &Sender<EventInfo>) -> Result<()>;
    fn close(&self) -> Result<()>;
}

/// Resolves one decoded event against the tree and fans it out.
///
/// Strict ancestors of the event's parent directory are dispatched with the
/// `RECURSIVE` extra bit so only subtree subscribers match; the parent
/// directory node and the exact leaf node (when one exists) are dispatched
/// untagged so directory subscribers see their direct children and per-path
/// subscribers see their own events.
///
/// Returns whether any visited node is recursively watched, which the
/// non-recursive coordinator uses to drive watch extension.
pub(crate) fn dispatch_event(root: &Node, ei: &EventInfo) -> bool {
    let path = ei.path();
    let dir = path.parent().unwrap_or(path);

    let mut isrec = false;
    let mut parent: Option<&Node> = None;
    root.walk_path(dir, &mut |nd, is_base| {
        if is_base {
            parent = Some(nd);
        } else {
            isrec = isrec || nd.is_recursive();
            nd.dispatch(ei, Event::RECURSIVE);
        }
    });

    if let Some(nd) = parent {
        isrec = isrec || nd.is_recursive();
        nd.dispatch(ei, Event::empty());
        if let Some(leaf) = path.file_name().and_then(|name| nd.child(name)) {
            isrec = isrec || leaf.is_recursive();
            leaf.dispatch(ei, Event::empty());
        }
    }
    isrec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::path::Path;

    #[test]
    fn ancestors_only_reach_recursive_subscribers() {
        let (rec, rec_rx) = unbounded();
        let (plain, plain_rx) = unbounded();
        let mut root = Node::root();
        root.add(Path::new("/tmp/a"))
            .watch_mut()
            .add(&rec, Event::CREATE | Event::RECURSIVE);
        root.add(Path::new("/tmp/a"))
            .watch_mut()
            .add(&plain, Event::CREATE);
        root.add(Path::new("/tmp/a/b"));

        // Two levels below the subscription point.
        let ei = EventInfo::new("/tmp/a/b/new", Event::CREATE);
        dispatch_event(&root, &ei);

        assert!(rec_rx.try_recv().is_ok(), "recursive subscriber missed a deep event");
        assert!(plain_rx.try_recv().is_err(), "plain subscriber saw a deep event");

        // A direct child reaches both.
        let ei = EventInfo::new("/tmp/a/direct", Event::CREATE);
        dispatch_event(&root, &ei);
        assert!(rec_rx.try_recv().is_ok());
        assert!(plain_rx.try_recv().is_ok());
    }

    #[test]
    fn leaf_subscribers_get_events_for_their_own_path() {
        let (tx, rx) = unbounded();
        let mut root = Node::root();
        root.add(Path::new("/tmp/file")).watch_mut().add(&tx, Event::REMOVE);

        let ei = EventInfo::new("/tmp/file", Event::REMOVE);
        dispatch_event(&root, &ei);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn reports_recursive_scope() {
        let (tx, _rx) = unbounded();
        let mut root = Node::root();
        root.add(Path::new("/tmp/a"))
            .watch_mut()
            .add(&tx, Event::CREATE | Event::RECURSIVE);

        let below = EventInfo::new("/tmp/a/b", Event::CREATE);
        assert!(dispatch_event(&root, &below));

        let elsewhere = EventInfo::new("/tmp/other/b", Event::CREATE);
        assert!(!dispatch_event(&root, &elsewhere));
    }
}
