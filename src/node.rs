//! The path-segment tree underlying both watch coordinators.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use crate::error::Result;
use crate::event::{Event, EventInfo};
use crate::watchpoint::Watchpoint;

/// Continuation decision for [`Node::walk`] callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Walk {
    /// Keep walking into this node's children.
    Continue,
    /// Prune this branch; siblings are still visited.
    Skip,
}

/// One node of the watch tree.
///
/// A node owns the watchpoint for its path and its child nodes. `watch` holds
/// subscriptions whose native watch is installed at this node; `shadow` holds
/// subscriptions covered by an ancestor's recursive region and only
/// contributes to native-mask accounting and delivery, never to a native
/// install of its own.
pub(crate) struct Node {
    name: PathBuf,
    watch: Watchpoint,
    shadow: Option<Watchpoint>,
    children: HashMap<OsString, Node>,
}

fn normal(comp: Component<'_>) -> Option<&std::ffi::OsStr> {
    match comp {
        Component::Normal(name) => Some(name),
        _ => None,
    }
}

impl Node {
    pub(crate) fn new(name: PathBuf) -> Self {
        Self {
            name,
            watch: Watchpoint::default(),
            shadow: None,
            children: HashMap::new(),
        }
    }

    /// A root node addressing the filesystem root.
    pub(crate) fn root() -> Self {
        Self::new(PathBuf::from(std::path::MAIN_SEPARATOR.to_string()))
    }

    pub(crate) fn name(&self) -> &Path {
        &self.name
    }

    pub(crate) fn watch(&self) -> &Watchpoint {
        &self.watch
    }

    pub(crate) fn watch_mut(&mut self) -> &mut Watchpoint {
        &mut self.watch
    }

    pub(crate) fn shadow(&self) -> Option<&Watchpoint> {
        self.shadow.as_ref()
    }

    pub(crate) fn shadow_mut(&mut self) -> &mut Watchpoint {
        self.shadow.get_or_insert_with(Watchpoint::default)
    }

    /// Union of the node's own registrations, active and shadow.
    pub(crate) fn own_total(&self) -> Event {
        self.watch.total() | self.shadow.as_ref().map_or(Event::empty(), |s| s.total())
    }

    /// Union of registrations in the whole subtree rooted here.
    pub(crate) fn subtree_total(&self) -> Event {
        let mut total = self.own_total();
        for child in self.children.values() {
            total |= child.subtree_total();
        }
        total
    }

    pub(crate) fn is_recursive(&self) -> bool {
        self.watch.is_recursive() || self.shadow.as_ref().is_some_and(|s| s.is_recursive())
    }

    /// Whether the node carries no registrations at all.
    pub(crate) fn is_idle(&self) -> bool {
        self.watch.is_empty() && self.shadow.as_ref().map_or(true, |s| s.is_empty())
    }

    /// Moves every shadow registration into the active watchpoint.
    pub(crate) fn promote_shadow(&mut self) {
        if let Some(shadow) = self.shadow.take() {
            self.watch.absorb(shadow);
        }
    }

    /// Moves every active registration into the shadow watchpoint.
    pub(crate) fn demote_watch(&mut self) {
        if self.watch.is_empty() {
            return;
        }
        let watch = std::mem::take(&mut self.watch);
        self.shadow_mut().absorb(watch);
    }

    /// Walks or creates the chain of nodes addressing `path` and returns the
    /// final one. Idempotent; `path` must lie under this node.
    pub(crate) fn add(&mut self, path: &Path) -> &mut Node {
        let rel = path.strip_prefix(&self.name).map(Path::to_path_buf).unwrap_or_else(|_| path.to_path_buf());
        let mut nd = self;
        let mut full = nd.name.clone();
        for comp in rel.components() {
            if let Some(name) = normal(comp) {
                full.push(name);
                let key = name.to_os_string();
                let next = full.clone();
                nd = nd
                    .children
                    .entry(key)
                    .or_insert_with(|| Node::new(next));
            }
        }
        nd
    }

    /// The node addressing `path`, if it exists.
    #[cfg(test)]
    pub(crate) fn get(&self, path: &Path) -> Option<&Node> {
        let rel = path.strip_prefix(&self.name).ok()?;
        let mut nd = self;
        for comp in rel.components() {
            if let Some(name) = normal(comp) {
                nd = nd.children.get(name)?;
            }
        }
        Some(nd)
    }

    pub(crate) fn child(&self, name: &std::ffi::OsStr) -> Option<&Node> {
        self.children.get(name)
    }

    #[cfg(test)]
    pub(crate) fn children(&self) -> impl Iterator<Item = &Node> {
        self.children.values()
    }

    pub(crate) fn children_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.children.values_mut()
    }

    /// Depth-first walk over this node and everything below it.
    ///
    /// `Walk::Skip` prunes the current branch; an error aborts the whole walk
    /// and is propagated.
    pub(crate) fn walk(&self, f: &mut dyn FnMut(&Node) -> Result<Walk>) -> Result<()> {
        if f(self)? == Walk::Skip {
            return Ok(());
        }
        for child in self.children.values() {
            child.walk(f)?;
        }
        Ok(())
    }

    /// Mutable variant of [`Node::walk`].
    pub(crate) fn walk_mut(&mut self, f: &mut dyn FnMut(&mut Node) -> Result<Walk>) -> Result<()> {
        if f(self)? == Walk::Skip {
            return Ok(());
        }
        for child in self.children.values_mut() {
            child.walk_mut(f)?;
        }
        Ok(())
    }

    /// Visits the existing nodes addressing each component of `path`, from
    /// the outermost down. The callback receives `true` for the node of the
    /// final component. Stops early, without error, at the first component
    /// that has no node yet.
    ///
    /// This node itself is only visited when it addresses `path` exactly.
    pub(crate) fn walk_path<'a>(&'a self, path: &Path, f: &mut dyn FnMut(&'a Node, bool)) {
        let rel = match path.strip_prefix(&self.name) {
            Ok(rel) => rel,
            Err(_) => return,
        };
        let comps: Vec<_> = rel.components().filter_map(normal).collect();
        if comps.is_empty() {
            f(self, true);
            return;
        }
        let mut nd = self;
        for (i, name) in comps.iter().enumerate() {
            match nd.children.get(*name) {
                Some(child) => {
                    nd = child;
                    f(nd, i == comps.len() - 1);
                }
                None => return,
            }
        }
    }

    /// Sends `ei` to the node's matching subscribers, active and shadow.
    pub(crate) fn dispatch(&self, ei: &EventInfo, extra: Event) {
        self.watch.dispatch(ei, extra);
        if let Some(shadow) = &self.shadow {
            shadow.dispatch(ei, extra);
        }
    }

    /// Removes child chains that carry no registrations anywhere below.
    pub(crate) fn prune(&mut self) {
        fn keep(nd: &mut Node) -> bool {
            nd.children.retain(|_, child| keep(child));
            !nd.children.is_empty() || !nd.is_idle()
        }
        self.children.retain(|_, child| keep(child));
    }

    /// Drops every registration and child in the tree.
    pub(crate) fn clear(&mut self) {
        self.watch = Watchpoint::default();
        self.shadow = None;
        self.children.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crossbeam_channel::unbounded;
    use pretty_assertions::assert_eq;

    #[test]
    fn add_is_idempotent_and_names_nodes_by_full_path() {
        let mut root = Node::root();
        let path = Path::new("/tmp/a/b");
        assert_eq!(root.add(path).name(), path);
        root.add(path);

        assert_eq!(root.children().count(), 1);
        let tmp = root.get(Path::new("/tmp")).expect("intermediate node");
        assert_eq!(tmp.children().count(), 1);
        assert_eq!(tmp.name(), Path::new("/tmp"));
    }

    #[test]
    fn walk_path_visits_components_in_order() {
        let mut root = Node::root();
        root.add(Path::new("/tmp/a/b"));

        let mut seen = Vec::new();
        root.walk_path(Path::new("/tmp/a/b"), &mut |nd, is_base| {
            seen.push((nd.name().to_path_buf(), is_base));
        });
        assert_eq!(
            seen,
            vec![
                (PathBuf::from("/tmp"), false),
                (PathBuf::from("/tmp/a"), false),
                (PathBuf::from("/tmp/a/b"), true),
            ]
        );
    }

    #[test]
    fn walk_path_stops_at_missing_components() {
        let mut root = Node::root();
        root.add(Path::new("/tmp/a"));

        let mut seen = Vec::new();
        root.walk_path(Path::new("/tmp/a/b/c"), &mut |nd, is_base| {
            seen.push((nd.name().to_path_buf(), is_base));
        });
        // Only the existing prefix is visited, and never as the base.
        assert_eq!(
            seen,
            vec![(PathBuf::from("/tmp"), false), (PathBuf::from("/tmp/a"), false)]
        );
    }

    #[test]
    fn walk_prunes_on_skip_and_propagates_errors() {
        let mut root = Node::root();
        root.add(Path::new("/a/b"));
        root.add(Path::new("/c"));

        let mut seen = Vec::new();
        root.walk(&mut |nd| {
            seen.push(nd.name().to_path_buf());
            if nd.name() == Path::new("/a") {
                Ok(Walk::Skip)
            } else {
                Ok(Walk::Continue)
            }
        })
        .expect("walk");
        assert!(!seen.contains(&PathBuf::from("/a/b")), "skipped branch was visited");

        let err = root.walk(&mut |_| Err(Error::generic("stop")));
        assert!(err.is_err());
    }

    #[test]
    fn prune_removes_idle_chains_only() {
        let (tx, _rx) = unbounded();
        let mut root = Node::root();
        root.add(Path::new("/a/b/c"));
        root.add(Path::new("/a/d")).watch_mut().add(&tx, Event::CREATE);

        root.prune();

        assert!(root.get(Path::new("/a/b")).is_none());
        assert!(root.get(Path::new("/a/d")).is_some());
    }

    #[test]
    fn promote_and_demote_move_registrations() {
        let (tx, _rx) = unbounded();
        let mut nd = Node::new(PathBuf::from("/x"));
        nd.shadow_mut().add(&tx, Event::CREATE);
        assert!(nd.watch().is_empty());

        nd.promote_shadow();
        assert_eq!(nd.watch().total(), Event::CREATE);
        assert!(nd.shadow().is_none());

        nd.demote_watch();
        assert!(nd.watch().is_empty());
        assert_eq!(nd.own_total(), Event::CREATE);
    }
}
