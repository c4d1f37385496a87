//! Coordinator for backends with OS-native recursive watching.
//!
//! Subscriptions live at the node of the path they were requested for. A
//! node whose native watch is rooted at it keeps them in its active
//! watchpoint; one covered by an ancestor's recursive region keeps them in
//! its shadow watchpoint. Every mutation reconciles the installed regions
//! against the subscription tree, merging regions under a common root and
//! splitting or re-rooting them as subscriptions depart.

use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{Event, EventInfo};
use crate::node::{Node, Walk};
use crate::paths::cleanpath;
use crate::tree::{dispatch_event, Tree};
use crate::RecursiveWatcher;

/// One native watch the backend currently has installed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Install {
    mask: Event,
    recursive: bool,
}

pub(crate) struct RecursiveTree<W> {
    inner: RwLock<RecInner<W>>,
    closed: AtomicBool,
}

struct RecInner<W> {
    root: Node,
    watcher: W,
    installed: HashMap<PathBuf, Install>,
}

/// The regions the subscription tree calls for: the topmost nodes carrying
/// registrations, each either recursive (mask aggregated over its subtree,
/// which it then covers entirely) or single-directory.
fn desired(root: &Node) -> HashMap<PathBuf, Install> {
    let mut out = HashMap::new();
    let _ = root.walk(&mut |nd| {
        let own = nd.own_total();
        if !own.is_empty() {
            let agg = nd.subtree_total();
            if agg.contains(Event::RECURSIVE) {
                out.insert(
                    nd.name().to_path_buf(),
                    Install {
                        mask: agg.strip_internal(),
                        recursive: true,
                    },
                );
                // The region covers everything below it.
                return Ok(Walk::Skip);
            }
            out.insert(
                nd.name().to_path_buf(),
                Install {
                    mask: own.strip_internal(),
                    recursive: false,
                },
            );
        }
        Ok(Walk::Continue)
    });
    out
}

/// Drives the backend from the installed state to the desired one with the
/// minimal transitions: in-place rewatches for mask changes, a single
/// `recursive_rewatch` when a region merely moves its root, one fresh
/// install plus unwatches when several regions collapse into a new root.
/// Installs happen before removals so coverage never lapses. Failures are
/// collected; successful transitions are recorded even when others fail.
fn reconcile<W: RecursiveWatcher>(
    root: &Node,
    watcher: &mut W,
    installed: &mut HashMap<PathBuf, Install>,
) -> Vec<Error> {
    let want = desired(root);
    let mut errors = Vec::new();

    for (path, target) in &want {
        if let Some(cur) = installed.get(path).copied() {
            if cur != *target {
                log::trace!(
                    "remasking native watch {} -> {} for {path:?}",
                    cur.mask,
                    target.mask
                );
                let res = if cur.recursive || target.recursive {
                    watcher.recursive_rewatch(path, path, cur.mask, target.mask)
                } else {
                    watcher.rewatch(path, cur.mask, target.mask)
                };
                match res {
                    Ok(()) => {
                        installed.insert(path.clone(), *target);
                    }
                    Err(err) => errors.push(err),
                }
            }
        }
    }

    let added: Vec<PathBuf> = want
        .keys()
        .filter(|path| !installed.contains_key(*path))
        .cloned()
        .collect();
    let mut removed: Vec<PathBuf> = installed
        .keys()
        .filter(|path| !want.contains_key(*path))
        .cloned()
        .collect();

    for path in added {
        let target = want[&path];
        let related: Vec<usize> = removed
            .iter()
            .enumerate()
            .filter(|(_, old)| old.starts_with(&path) || path.starts_with(old.as_path()))
            .map(|(i, _)| i)
            .collect();
        if related.len() == 1 {
            // The region kept its subscribers but its root moved; relocate
            // and re-mask in one call.
            let old_path = removed.remove(related[0]);
            let cur = installed[&old_path];
            log::trace!("re-rooting native watch {old_path:?} -> {path:?}");
            match watcher.recursive_rewatch(&old_path, &path, cur.mask, target.mask) {
                Ok(()) => {
                    installed.remove(&old_path);
                    installed.insert(path, target);
                }
                Err(err) => errors.push(err),
            }
        } else {
            log::trace!("installing native watch {} for {path:?}", target.mask);
            let res = if target.recursive {
                watcher.recursive_watch(&path, target.mask)
            } else {
                watcher.watch(&path, target.mask)
            };
            match res {
                Ok(()) => {
                    installed.insert(path, target);
                }
                Err(err) => errors.push(err),
            }
        }
    }

    for path in removed {
        let cur = installed[&path];
        log::trace!("removing native watch for {path:?}");
        let res = if cur.recursive {
            watcher.recursive_unwatch(&path)
        } else {
            watcher.unwatch(&path)
        };
        match res {
            Ok(()) => {
                installed.remove(&path);
            }
            Err(err) => errors.push(err),
        }
    }

    errors
}

/// Settles every node's registrations into the right watchpoint: active at
/// region roots, shadow everywhere under a recursive region.
fn normalize(nd: &mut Node, installed: &HashMap<PathBuf, Install>) {
    if installed.contains_key(nd.name()) {
        nd.promote_shadow();
    } else {
        nd.demote_watch();
    }
    for child in nd.children_mut() {
        normalize(child, installed);
    }
}

impl<W: RecursiveWatcher + Send + Sync + 'static> RecursiveTree<W> {
    /// Builds the coordinator and starts its dispatch loop.
    pub(crate) fn spawn(
        watcher: W,
        events: Receiver<Result<EventInfo>>,
        _config: &Config,
    ) -> Result<Arc<Self>> {
        let tree = Arc::new(Self {
            inner: RwLock::new(RecInner {
                root: Node::root(),
                watcher,
                installed: HashMap::new(),
            }),
            closed: AtomicBool::new(false),
        });

        let dispatcher = tree.clone();
        thread::Builder::new()
            .name("watchtree dispatch".into())
            .spawn(move || dispatcher.dispatch_loop(events))
            .map_err(Error::io)?;

        Ok(tree)
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
            let inner = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            dispatch_event(&inner.root, &ei);
        }
    }
}

impl<W: RecursiveWatcher + Send + Sync + 'static> Tree for RecursiveTree<W> {
    fn watch(&self, path: &Path, tx: Sender<EventInfo>, events: Event) -> Result<()> {
        let (path, recursive) = cleanpath(path)?;
        let eset = if recursive {
            events | Event::RECURSIVE
        } else {
            events
        };

        let mut guard = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let RecInner {
            root,
            watcher,
            installed,
        } = &mut *guard;

        let _ = root.add(&path).watch_mut().add(&tx, eset);
        let mut errors = reconcile(root, watcher, installed);
        if !errors.is_empty() {
            let primary = errors.remove(0);
            for err in errors {
                log::warn!("additional native watch error: {err}");
            }
            // Roll the registration back and restore the native state.
            let _ = root.add(&path).watch_mut().del(&tx, eset);
            for err in reconcile(root, watcher, installed) {
                log::warn!("failed to restore native watches after error: {err}");
            }
            root.prune();
            return Err(primary);
        }
        normalize(root, installed);
        Ok(())
    }

    fn stop(&self, tx: &Sender<EventInfo>) -> Result<()> {
        let mut guard = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let RecInner {
            root,
            watcher,
            installed,
        } = &mut *guard;

        let everything = Event::from_bits_truncate(u32::MAX);
        let _ = root.walk_mut(&mut |nd| {
            nd.watch_mut().del(tx, everything);
            if nd.shadow().is_some() {
                nd.shadow_mut().del(tx, everything);
            }
            Ok(Walk::Continue)
        });

        let errors = reconcile(root, watcher, installed);
        normalize(root, installed);
        root.prune();
        Error::teardown(errors)
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut guard = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.root.clear();
        guard.installed.clear();
        guard.watcher.close()
    }
}
