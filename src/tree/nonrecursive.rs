//! Coordinator for backends that can only watch single directories.
//!
//! Recursive subscriptions are emulated: every existing subdirectory gets its
//! own native watch, registered under an internal channel so the union masks
//! stay covered, and an internal loop extends the set whenever a directory is
//! created inside a recursively watched scope.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{Event, EventInfo};
use crate::node::{Node, Walk};
use crate::paths::cleanpath;
use crate::tree::{dispatch_event, Tree};
use crate::Watcher;

pub(crate) struct NonRecursiveTree<W> {
    inner: RwLock<Inner<W>>,
    /// Sender side of the internal channel. Doubles as the registration key
    /// for emulation watches inside watchpoints; taken on close so the
    /// internal loop terminates.
    rec_tx: Mutex<Option<Sender<EventInfo>>>,
    closed: AtomicBool,
}

struct Inner<W> {
    root: Node,
    watcher: W,
    follow_symlinks: bool,
}

/// Every directory at or below `path`, the path itself first.
fn subdirs(path: &Path, follow_symlinks: bool) -> Vec<PathBuf> {
    WalkDir::new(path)
        .follow_links(follow_symlinks)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .collect()
}

/// Registers `mask` for `tx` at the node of `path` and performs whichever
/// native transition the watchpoint diff calls for. A backend failure rolls
/// the registration back, leaving the tree as it was.
fn install<W: Watcher>(
    root: &mut Node,
    watcher: &mut W,
    tx: &Sender<EventInfo>,
    path: &Path,
    mask: Event,
) -> Result<()> {
    let nd = root.add(path);
    let diff = match nd.watch_mut().add(tx, mask) {
        None => return Ok(()),
        Some(diff) => diff,
    };
    let res = if diff.old.is_empty() {
        log::trace!("installing native watch {} for {:?}", diff.new, path);
        watcher.watch(path, diff.new)
    } else {
        log::trace!("widening native watch {} -> {} for {:?}", diff.old, diff.new, path);
        watcher.rewatch(path, diff.old, diff.new)
    };
    if let Err(err) = res {
        nd.watch_mut().del(tx, mask);
        return Err(err);
    }
    Ok(())
}

/// Releases emulation watches that no surviving recursive subscriber above
/// (or at) their node covers anymore.
fn release_orphans<W: Watcher>(
    nd: &mut Node,
    watcher: &mut W,
    rec_tx: &Sender<EventInfo>,
    covered: bool,
    errors: &mut Vec<Error>,
) {
    let covered = covered || nd.watch().has_other_recursive(rec_tx);
    for child in nd.children_mut() {
        release_orphans(child, watcher, rec_tx, covered, errors);
    }
    if !covered && nd.watch().only_channel(rec_tx) {
        let name = nd.name().to_path_buf();
        if let Some(diff) = nd.watch_mut().del(rec_tx, Event::from_bits_truncate(u32::MAX)) {
            log::trace!("releasing orphaned emulation watch for {name:?}");
            let res = if diff.new.is_empty() {
                watcher.unwatch(&name)
            } else {
                watcher.rewatch(&name, diff.old, diff.new)
            };
            if let Err(err) = res {
                errors.push(err);
            }
        }
    }
}

impl<W: Watcher + Send + Sync + 'static> NonRecursiveTree<W> {
    /// Builds the coordinator and starts its dispatch and internal loops.
    pub(crate) fn spawn(
        watcher: W,
        events: Receiver<Result<EventInfo>>,
        config: &Config,
    ) -> Result<Arc<Self>> {
        let (rec_tx, rec_rx) = unbounded();
        let tree = Arc::new(Self {
            inner: RwLock::new(Inner {
                root: Node::root(),
                watcher,
                follow_symlinks: config.follow_symlinks(),
            }),
            rec_tx: Mutex::new(Some(rec_tx)),
            closed: AtomicBool::new(false),
        });

        let dispatcher = tree.clone();
        thread::Builder::new()
            .name("watchtree dispatch".into())
            .spawn(move || dispatcher.dispatch_loop(events))
            .map_err(Error::io)?;

        let internal = tree.clone();
        thread::Builder::new()
            .name("watchtree internal".into())
            .spawn(move || internal.internal_loop(rec_rx))
            .map_err(Error::io)?;

        Ok(tree)
    }

    fn rec_tx(&self) -> Option<Sender<EventInfo>> {
        self.rec_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn dispatch_loop(self: Arc<Self>, events: Receiver<Result<EventInfo>>) {
        for res in events.iter() {
            let ei = match res {
                Ok(ei) => ei,
                Err(err) => {
                    log::error!("backend stream failed, dispatch stopping: {err}");
                    break;
                }
            };
            log::trace!("dispatching {ei}");
            let isrec = {
                let inner = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
                dispatch_event(&inner.root, &ei)
            };
            // A directory born inside a recursively watched scope needs
            // watches of its own; hand it to the internal loop.
            if isrec && ei.event().intersects(Event::CREATE) && ei.is_dir().unwrap_or(false) {
                if let Some(tx) = self.rec_tx() {
                    let _ = tx.send(ei);
                }
            }
        }
    }

    fn internal_loop(self: Arc<Self>, rec_rx: Receiver<EventInfo>) {
        for ei in rec_rx.iter() {
            if let Err(err) = self.extend(&ei) {
                log::warn!("failed to extend recursive watch to {:?}: {err}", ei.path());
            }
        }
    }

    /// Installs emulation watches for a directory that appeared inside a
    /// recursively watched scope, and for everything already inside it.
    fn extend(&self, ei: &EventInfo) -> Result<()> {
        let rec_tx = match self.rec_tx() {
            Some(tx) => tx,
            None => return Ok(()),
        };
        let mut guard = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let inner = &mut *guard;

        // The deepest ancestor carrying an emulation registration tells us
        // the mask this scope was recursively watched with.
        let mut eset = Event::empty();
        inner.root.walk_path(ei.path(), &mut |nd, _| {
            if let Some(mask) = nd.watch().get(&rec_tx) {
                eset = mask;
            }
        });
        if eset.is_empty() {
            return Ok(());
        }

        let Inner {
            root,
            watcher,
            follow_symlinks,
        } = inner;
        let mut errors = Vec::new();
        for dir in subdirs(ei.path(), *follow_symlinks) {
            if let Err(err) = install(root, watcher, &rec_tx, &dir, eset) {
                errors.push(err);
            }
        }
        Error::teardown(errors)
    }
}

impl<W: Watcher + Send + Sync + 'static> Tree for NonRecursiveTree<W> {
    fn watch(&self, path: &Path, tx: Sender<EventInfo>, events: Event) -> Result<()> {
        let (path, recursive) = cleanpath(path)?;
        let mut guard = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let inner = &mut *guard;
        let Inner {
            root,
            watcher,
            follow_symlinks,
        } = inner;

        if recursive {
            let rec_tx = self
                .rec_tx()
                .ok_or_else(|| Error::generic("engine is closed"))?;
            let dirs = subdirs(&path, *follow_symlinks);
            if dirs.is_empty() {
                // Not a directory; recursion degrades to a plain watch.
                return install(root, watcher, &tx, &path, events);
            }
            let rec_mask = events | Event::CREATE | Event::WRITE | Event::RECURSIVE | Event::OMIT;
            for dir in dirs {
                install(root, watcher, &rec_tx, &dir, rec_mask)?;
            }
            // The subscriber itself rides on the emulation watches; no
            // further native transition is needed.
            let _ = root
                .add(&path)
                .watch_mut()
                .add(&tx, events | Event::RECURSIVE);
            Ok(())
        } else {
            install(root, watcher, &tx, &path, events)
        }
    }

    fn stop(&self, tx: &Sender<EventInfo>) -> Result<()> {
        let mut guard = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let inner = &mut *guard;
        let Inner { root, watcher, .. } = inner;

        let mut errors = Vec::new();
        let everything = Event::from_bits_truncate(u32::MAX);
        let _ = root.walk_mut(&mut |nd| {
            if let Some(diff) = nd.watch_mut().del(tx, everything) {
                let res = if diff.new.is_empty() {
                    log::trace!("removing native watch for {:?}", nd.name());
                    watcher.unwatch(nd.name())
                } else {
                    watcher.rewatch(nd.name(), diff.old, diff.new)
                };
                if let Err(err) = res {
                    errors.push(err);
                }
            }
            Ok(Walk::Continue)
        });

        if let Some(rec_tx) = self.rec_tx() {
            release_orphans(root, watcher, &rec_tx, false, &mut errors);
        }
        root.prune();
        Error::teardown(errors)
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self
            .rec_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        let mut guard = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.root.clear();
        guard.watcher.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{testdir, wait_until, Call, FakeWatcher};
    use crossbeam_channel::bounded;
    use std::fs;
    use std::time::Duration;

    fn tree() -> (
        Arc<NonRecursiveTree<FakeWatcher>>,
        FakeWatcher,
        Sender<Result<EventInfo>>,
    ) {
        let fake = FakeWatcher::default();
        let (out_tx, out_rx) = bounded(128);
        let tree = NonRecursiveTree::spawn(fake.clone(), out_rx, &Config::default()).expect("spawn");
        (tree, fake, out_tx)
    }

    #[test]
    fn resubscription_is_idempotent() {
        let dir = testdir();
        let (tree, fake, _out) = tree();
        let (tx, _rx) = unbounded();

        tree.watch(dir.path(), tx.clone(), Event::CREATE).expect("watch");
        tree.watch(dir.path(), tx, Event::CREATE).expect("watch again");

        assert_eq!(
            fake.calls(),
            vec![Call::Watch(dir.path().to_path_buf(), Event::CREATE)],
            "second identical subscription must not reach the backend"
        );
    }

    #[test]
    fn widening_uses_rewatch_never_unwatch() {
        let dir = testdir();
        let (tree, fake, _out) = tree();
        let (a, _ra) = unbounded();
        let (b, _rb) = unbounded();

        tree.watch(dir.path(), a, Event::CREATE).expect("watch");
        tree.watch(dir.path(), b, Event::CREATE | Event::WRITE).expect("widen");

        assert_eq!(
            fake.calls(),
            vec![
                Call::Watch(dir.path().to_path_buf(), Event::CREATE),
                Call::Rewatch(
                    dir.path().to_path_buf(),
                    Event::CREATE,
                    Event::CREATE | Event::WRITE
                ),
            ]
        );
    }

    #[test]
    fn no_cross_talk_between_subscribers() {
        let dir = testdir();
        let (tree, _fake, out) = tree();
        let (a, ra) = unbounded();
        let (b, rb) = unbounded();

        tree.watch(dir.path(), a, Event::CREATE).expect("watch a");
        tree.watch(dir.path(), b, Event::WRITE).expect("watch b");

        let file = dir.path().join("file");
        out.send(Ok(EventInfo::new(&file, Event::WRITE).with_dir_hint(false)))
            .expect("inject");

        let ei = rb.recv_timeout(Duration::from_secs(5)).expect("write event");
        assert_eq!(ei.path(), file);
        assert_eq!(ei.event(), Event::WRITE);
        assert!(
            ra.recv_timeout(Duration::from_millis(100)).is_err(),
            "create-only subscriber received a write event"
        );
    }

    #[test]
    fn recursive_watch_covers_existing_subdirectories() {
        let dir = testdir();
        fs::create_dir_all(dir.path().join("a/b")).expect("mkdir");
        let (tree, fake, _out) = tree();
        let (tx, _rx) = unbounded();

        tree.watch(&dir.path().join("..."), tx, Event::CREATE).expect("watch");

        let watched: Vec<_> = fake
            .calls()
            .into_iter()
            .map(|call| match call {
                Call::Watch(path, mask) => {
                    assert_eq!(mask, Event::CREATE | Event::WRITE);
                    path
                }
                other => panic!("unexpected backend call: {other:?}"),
            })
            .collect();
        assert_eq!(watched.len(), 3);
        for sub in [dir.path().to_path_buf(), dir.path().join("a"), dir.path().join("a/b")] {
            assert!(watched.contains(&sub), "missing watch for {sub:?}");
        }
    }

    #[test]
    fn new_directories_are_watched_without_further_calls() {
        let dir = testdir();
        let (tree, fake, out) = tree();
        let (tx, rx) = unbounded();

        tree.watch(&dir.path().join("..."), tx, Event::CREATE).expect("watch");
        fake.clear_calls();

        // A directory appears inside the scope, with a nested one already in it.
        let sub = dir.path().join("sub");
        let nested = sub.join("nested");
        fs::create_dir_all(&nested).expect("mkdir");
        out.send(Ok(EventInfo::new(&sub, Event::CREATE).with_dir_hint(true)))
            .expect("inject");

        // The subscriber sees the create...
        let ei = rx.recv_timeout(Duration::from_secs(5)).expect("create event");
        assert_eq!(ei.path(), sub);

        // ...and the internal loop extends the emulation to both directories.
        assert!(
            wait_until(
                || {
                    let calls = fake.calls();
                    [&sub, &nested].iter().all(|dir| {
                        calls.iter().any(|call| {
                            matches!(call, Call::Watch(path, _) if path == *dir)
                        })
                    })
                },
                Duration::from_secs(5)
            ),
            "emulation watches were not extended: {:?}",
            fake.calls()
        );

        // Events from the new depth now reach the recursive subscriber.
        let deep = nested.join("file");
        out.send(Ok(EventInfo::new(&deep, Event::CREATE).with_dir_hint(false)))
            .expect("inject deep");
        let ei = rx.recv_timeout(Duration::from_secs(5)).expect("deep create");
        assert_eq!(ei.path(), deep);
    }

    #[test]
    fn stop_releases_everything() {
        let dir = testdir();
        fs::create_dir(dir.path().join("a")).expect("mkdir");
        let (tree, fake, out) = tree();
        let (tx, rx) = unbounded();

        tree.watch(&dir.path().join("..."), tx.clone(), Event::CREATE).expect("watch");
        fake.clear_calls();

        tree.stop(&tx).expect("stop");

        // Both emulation watches are gone...
        let mut unwatched: Vec<_> = fake
            .calls()
            .into_iter()
            .map(|call| match call {
                Call::Unwatch(path) => path,
                other => panic!("unexpected backend call: {other:?}"),
            })
            .collect();
        unwatched.sort();
        let mut expected = vec![dir.path().to_path_buf(), dir.path().join("a")];
        expected.sort();
        assert_eq!(unwatched, expected);

        // ...no tree state refers to the channel anymore...
        assert!(!tree
            .inner
            .read()
            .unwrap()
            .root
            .children()
            .any(|_| true), "tree still has nodes after stop");

        // ...and injected events no longer reach it.
        out.send(Ok(EventInfo::new(dir.path().join("x"), Event::CREATE).with_dir_hint(true)))
            .expect("inject");
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn stop_narrows_shared_watches() {
        let dir = testdir();
        let (tree, fake, _out) = tree();
        let (a, _ra) = unbounded();
        let (b, _rb) = unbounded();

        tree.watch(dir.path(), a, Event::CREATE | Event::WRITE).expect("watch a");
        tree.watch(dir.path(), b.clone(), Event::CREATE | Event::REMOVE).expect("watch b");
        fake.clear_calls();

        tree.stop(&b).expect("stop");

        assert_eq!(
            fake.calls(),
            vec![Call::Rewatch(
                dir.path().to_path_buf(),
                Event::CREATE | Event::WRITE | Event::REMOVE,
                Event::CREATE | Event::WRITE,
            )]
        );
    }

    #[test]
    fn backend_failure_rolls_the_subscription_back() {
        let dir = testdir();
        let (tree, fake, _out) = tree();
        let (tx, _rx) = unbounded();

        fake.fail_next();
        tree.watch(dir.path(), tx.clone(), Event::CREATE)
            .expect_err("backend failure must propagate");

        // The rolled-back tree issues a fresh Watch on retry, proving the
        // first attempt left no residue.
        tree.watch(dir.path(), tx, Event::CREATE).expect("retry");
        assert_eq!(
            fake.calls().last(),
            Some(&Call::Watch(dir.path().to_path_buf(), Event::CREATE))
        );
    }

    #[test]
    fn close_is_idempotent_and_shuts_the_backend() {
        let dir = testdir();
        let (tree, fake, _out) = tree();
        let (tx, _rx) = unbounded();
        tree.watch(dir.path(), tx, Event::CREATE).expect("watch");

        tree.close().expect("close");
        tree.close().expect("second close");

        let closes = fake
            .calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Close))
            .count();
        assert_eq!(closes, 1);
    }
}
