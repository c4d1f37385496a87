//! Stat-polling watcher backend, available on every platform.
//!
//! Each watched path keeps a metadata snapshot (and, for directories, one per
//! entry); a scan thread re-stats everything on an interval and reports the
//! differences. Renames cannot be told apart from a remove/create pair, so
//! `RENAME` is never produced by this backend.

use crossbeam_channel::{bounded, Receiver, Sender};
use filetime::FileTime;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{Event, EventInfo};
use crate::Watcher;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Meta {
    mtime: FileTime,
    len: u64,
    is_dir: bool,
}

#[derive(Clone, Debug)]
enum Snapshot {
    Missing,
    File(Meta),
    Dir(HashMap<OsString, Meta>),
}

#[derive(Debug)]
struct PollState {
    mask: Event,
    snapshot: Snapshot,
}

type Watches = Arc<Mutex<HashMap<PathBuf, PollState>>>;

fn meta_of(md: &fs::Metadata) -> Meta {
    Meta {
        mtime: FileTime::from_last_modification_time(md),
        len: md.len(),
        is_dir: md.is_dir(),
    }
}

fn take_snapshot(path: &Path) -> io::Result<Snapshot> {
    let md = match fs::metadata(path) {
        Ok(md) => md,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Snapshot::Missing),
        Err(e) => return Err(e),
    };
    if !md.is_dir() {
        return Ok(Snapshot::File(meta_of(&md)));
    }
    let mut entries = HashMap::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        // Entries may vanish between the listing and the stat.
        if let Ok(md) = entry.metadata() {
            entries.insert(entry.file_name(), meta_of(&md));
        }
    }
    Ok(Snapshot::Dir(entries))
}

fn push(out: &mut Vec<EventInfo>, mask: Event, path: PathBuf, event: Event, is_dir: bool) {
    if mask.intersects(event) {
        out.push(EventInfo::new(path, event).with_dir_hint(is_dir));
    }
}

/// Appends the events implied by the change from `old` to `new`, filtered by
/// the installed mask.
fn diff(path: &Path, old: &Snapshot, new: &Snapshot, mask: Event, out: &mut Vec<EventInfo>) {
    match (old, new) {
        (Snapshot::Missing, Snapshot::Missing) => {}
        (Snapshot::Missing, Snapshot::File(_)) => {
            push(out, mask, path.to_path_buf(), Event::CREATE, false);
        }
        (Snapshot::Missing, Snapshot::Dir(_)) => {
            push(out, mask, path.to_path_buf(), Event::CREATE, true);
        }
        (Snapshot::File(_), Snapshot::Missing) => {
            push(out, mask, path.to_path_buf(), Event::REMOVE, false);
        }
        (Snapshot::Dir(_), Snapshot::Missing) => {
            push(out, mask, path.to_path_buf(), Event::REMOVE, true);
        }
        (Snapshot::File(a), Snapshot::File(b)) => {
            if a != b {
                push(out, mask, path.to_path_buf(), Event::WRITE, false);
            }
        }
        (Snapshot::Dir(old_entries), Snapshot::Dir(new_entries)) => {
            for (name, meta) in new_entries {
                match old_entries.get(name) {
                    None => push(out, mask, path.join(name), Event::CREATE, meta.is_dir),
                    Some(prev) if prev != meta && !meta.is_dir => {
                        push(out, mask, path.join(name), Event::WRITE, false);
                    }
                    Some(_) => {}
                }
            }
            for (name, meta) in old_entries {
                if !new_entries.contains_key(name) {
                    push(out, mask, path.join(name), Event::REMOVE, meta.is_dir);
                }
            }
        }
        (Snapshot::File(_), Snapshot::Dir(_)) => {
            push(out, mask, path.to_path_buf(), Event::REMOVE, false);
            push(out, mask, path.to_path_buf(), Event::CREATE, true);
        }
        (Snapshot::Dir(_), Snapshot::File(_)) => {
            push(out, mask, path.to_path_buf(), Event::REMOVE, true);
            push(out, mask, path.to_path_buf(), Event::CREATE, false);
        }
    }
}

fn scan_thread(
    watches: Watches,
    out: Sender<Result<EventInfo>>,
    running: Arc<AtomicBool>,
    interval: Duration,
) {
    while running.load(Ordering::SeqCst) {
        let mut pending = Vec::new();
        {
            let mut map = watches.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            for (path, state) in map.iter_mut() {
                match take_snapshot(path) {
                    Ok(snapshot) => {
                        diff(path, &state.snapshot, &snapshot, state.mask, &mut pending);
                        state.snapshot = snapshot;
                    }
                    Err(err) => {
                        log::debug!("poll scan of {path:?} failed: {err}");
                    }
                }
            }
        }
        for ei in pending {
            if out.try_send(Ok(ei)).is_err() {
                log::warn!("event buffer full, dropping poll event");
            }
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }
        thread::park_timeout(interval);
    }
}

/// Watcher backend based on periodic directory scans and `stat` calls.
#[derive(Debug)]
pub struct PollWatcher {
    watches: Watches,
    running: Arc<AtomicBool>,
    scanner: thread::Thread,
    closed: bool,
}

impl PollWatcher {
    /// Creates the backend and its bounded event stream.
    pub fn new(config: &Config) -> Result<(Self, Receiver<Result<EventInfo>>)> {
        let watches: Watches = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));
        let (out_tx, out_rx) = bounded(config.buffer_capacity());

        let handle = thread::Builder::new()
            .name("watchtree poll loop".into())
            .spawn({
                let watches = watches.clone();
                let running = running.clone();
                let interval = config.poll_interval();
                move || scan_thread(watches, out_tx, running, interval)
            })
            .map_err(Error::io)?;

        Ok((
            PollWatcher {
                watches,
                running,
                scanner: handle.thread().clone(),
                closed: false,
            },
            out_rx,
        ))
    }
}

impl Watcher for PollWatcher {
    fn watch(&mut self, path: &Path, events: Event) -> Result<()> {
        if events.strip_internal().is_empty() {
            return Err(Error::invalid_event_set().add_path(path.to_path_buf()));
        }
        let mut map = self.watches.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if map.contains_key(path) {
            return Err(Error::already_watched().add_path(path.to_path_buf()));
        }
        let snapshot = take_snapshot(path).map_err(|e| Error::io(e).add_path(path.to_path_buf()))?;
        if matches!(snapshot, Snapshot::Missing) {
            return Err(Error::path_not_found().add_path(path.to_path_buf()));
        }
        log::trace!("adding poll watch: {}", path.display());
        map.insert(
            path.to_path_buf(),
            PollState {
                mask: events,
                snapshot,
            },
        );
        Ok(())
    }

    fn rewatch(&mut self, path: &Path, old: Event, new: Event) -> Result<()> {
        if new.strip_internal().is_empty() {
            return Err(Error::invalid_event_set().add_path(path.to_path_buf()));
        }
        let mut map = self.watches.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match map.get_mut(path) {
            None => Err(Error::watch_not_found().add_path(path.to_path_buf())),
            Some(state) if state.mask != old => {
                Err(Error::invalid_event_set().add_path(path.to_path_buf()))
            }
            Some(state) => {
                state.mask = new;
                Ok(())
            }
        }
    }

    fn unwatch(&mut self, path: &Path) -> Result<()> {
        log::trace!("removing poll watch: {}", path.display());
        self.watches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::watch_not_found().add_path(path.to_path_buf()))
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.running.store(false, Ordering::SeqCst);
        self.scanner.unpark();
        self.watches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        Ok(())
    }
}

impl Drop for PollWatcher {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
