//! Watcher backend for the inotify Linux API.
//!
//! inotify watches single directories (or files) only; recursion is supplied
//! by the tree layer. Because the portable event bits alias the inotify mask
//! bits on this platform, masks pass to and from the kernel without a
//! translation table.

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::event::{Event, EventInfo};
use crate::Watcher;

const INOTIFY: mio::Token = mio::Token(0);
const MESSAGE: mio::Token = mio::Token(1);

/// The native record behind [`EventInfo::sys`] for this backend.
#[derive(Debug, Clone, Copy)]
pub struct InotifySysEvent {
    /// Raw `inotify_event` mask bits.
    pub mask: u32,
    /// Cookie correlating the two halves of a rename.
    pub cookie: u32,
}

enum Message {
    Watch(PathBuf, Event, Sender<Result<()>>),
    Rewatch(PathBuf, Event, Event, Sender<Result<()>>),
    Unwatch(PathBuf, Sender<Result<()>>),
    Close(Sender<Result<()>>),
}

struct Watched {
    wd: WatchDescriptor,
    mask: Event,
}

// The event loop waits on a mio::Poll for two things: messages telling it
// which watches to mutate, and readability of the inotify descriptor.
struct EventLoop {
    running: bool,
    poll: mio::Poll,
    msg_rx: Receiver<Message>,
    inotify: Option<Inotify>,
    out_tx: Sender<Result<EventInfo>>,
    watches: HashMap<PathBuf, Watched>,
    paths: HashMap<WatchDescriptor, PathBuf>,
}

/// Watcher backend based on inotify.
#[derive(Debug)]
pub struct InotifyWatcher {
    msg_tx: Sender<Message>,
    waker: Arc<mio::Waker>,
    closed: bool,
}

fn map_os_error(err: io::Error) -> Error {
    if err.raw_os_error() == Some(libc::ENOSPC) {
        // inotify reports its watch limit as "no space left on device".
        Error::new(ErrorKind::MaxFilesWatch)
    } else if err.kind() == io::ErrorKind::NotFound {
        Error::new(ErrorKind::PathNotFound)
    } else {
        Error::io(err)
    }
}

impl EventLoop {
    fn run(mut self) {
        let mut events = mio::Events::with_capacity(16);
        loop {
            match self.poll.poll(&mut events, None) {
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    let _ = self.out_tx.try_send(Err(Error::io(e)));
                    break;
                }
                Ok(()) => {}
            }

            for event in &events {
                match event.token() {
                    MESSAGE => self.handle_messages(),
                    INOTIFY => self.handle_inotify(),
                    _ => {}
                }
            }

            if !self.running {
                break;
            }
        }
    }

    fn handle_messages(&mut self) {
        while let Ok(msg) = self.msg_rx.try_recv() {
            match msg {
                Message::Watch(path, mask, reply) => {
                    let _ = reply.send(self.add_watch(path, mask));
                }
                Message::Rewatch(path, old, new, reply) => {
                    let _ = reply.send(self.update_watch(path, old, new));
                }
                Message::Unwatch(path, reply) => {
                    let _ = reply.send(self.remove_watch(path));
                }
                Message::Close(reply) => {
                    let _ = reply.send(self.remove_all());
                    self.running = false;
                    break;
                }
            }
        }
    }

    fn add_watch(&mut self, path: PathBuf, mask: Event) -> Result<()> {
        if self.watches.contains_key(&path) {
            return Err(Error::already_watched().add_path(path));
        }
        let watchmask = WatchMask::from_bits_truncate(mask.bits());
        if watchmask.is_empty() {
            return Err(Error::invalid_event_set().add_path(path));
        }
        let inotify = match self.inotify.as_mut() {
            Some(inotify) => inotify,
            None => return Err(Error::generic("inotify instance is closed").add_path(path)),
        };

        log::trace!("adding inotify watch: {}", path.display());
        match inotify.watches().add(&path, watchmask) {
            Err(e) => Err(map_os_error(e).add_path(path)),
            Ok(wd) => {
                self.watches.insert(path.clone(), Watched { wd: wd.clone(), mask });
                self.paths.insert(wd, path);
                Ok(())
            }
        }
    }

    fn update_watch(&mut self, path: PathBuf, old: Event, new: Event) -> Result<()> {
        match self.watches.get(&path) {
            None => return Err(Error::watch_not_found().add_path(path)),
            // Guards against racing callers re-deriving stale diffs.
            Some(watched) if watched.mask != old => {
                return Err(Error::invalid_event_set().add_path(path));
            }
            Some(_) => {}
        }
        let watchmask = WatchMask::from_bits_truncate(new.bits());
        if watchmask.is_empty() {
            return Err(Error::invalid_event_set().add_path(path));
        }
        let inotify = match self.inotify.as_mut() {
            Some(inotify) => inotify,
            None => return Err(Error::generic("inotify instance is closed").add_path(path)),
        };

        log::trace!("swapping inotify watch mask: {} -> {} for {}", old, new, path.display());
        // Without MASK_ADD, adding an existing path atomically replaces the
        // active mask and returns the same descriptor.
        match inotify.watches().add(&path, watchmask) {
            Err(e) => Err(map_os_error(e).add_path(path)),
            Ok(wd) => {
                self.paths.insert(wd.clone(), path.clone());
                self.watches.insert(path, Watched { wd, mask: new });
                Ok(())
            }
        }
    }

    fn remove_watch(&mut self, path: PathBuf) -> Result<()> {
        match self.watches.remove(&path) {
            None => Err(Error::watch_not_found().add_path(path)),
            Some(watched) => {
                self.paths.remove(&watched.wd);
                let inotify = match self.inotify.as_mut() {
                    Some(inotify) => inotify,
                    None => return Ok(()),
                };
                log::trace!("removing inotify watch: {}", path.display());
                inotify
                    .watches()
                    .remove(watched.wd)
                    .map_err(|e| Error::io(e).add_path(path))
            }
        }
    }

    fn remove_all(&mut self) -> Result<()> {
        let mut errors = Vec::new();
        if let Some(mut inotify) = self.inotify.take() {
            {
                let mut watches = inotify.watches();
                for (path, watched) in self.watches.drain() {
                    if let Err(e) = watches.remove(watched.wd) {
                        errors.push(Error::io(e).add_path(path));
                    }
                }
            }
            self.paths.clear();
            if let Err(e) = inotify.close() {
                errors.push(Error::io(e));
            }
        }
        Error::teardown(errors)
    }

    fn handle_inotify(&mut self) {
        let mut gone: Vec<(WatchDescriptor, PathBuf)> = Vec::new();
        loop {
            let inotify = match self.inotify.as_mut() {
                Some(inotify) => inotify,
                None => return,
            };
            let mut buffer = [0; 1024];
            match inotify.read_events(&mut buffer) {
                Ok(events) => {
                    let mut num_events = 0;
                    for event in events {
                        num_events += 1;
                        log::trace!("inotify event: {event:?}");

                        if event.mask.contains(EventMask::Q_OVERFLOW) {
                            log::warn!("inotify event queue overflowed, events were lost");
                        }

                        let path = match event.name {
                            Some(name) => self.paths.get(&event.wd).map(|root| root.join(name)),
                            None => self.paths.get(&event.wd).cloned(),
                        };
                        let path = match path {
                            Some(path) => path,
                            None => {
                                log::debug!("inotify event with unknown descriptor: {event:?}");
                                continue;
                            }
                        };

                        if event.mask.contains(EventMask::IGNORED) {
                            // The kernel dropped the watch, e.g. because the
                            // path disappeared; forget our record of it.
                            gone.push((event.wd.clone(), path.clone()));
                        }

                        let raw = event.mask.bits()
                            & !(EventMask::ISDIR
                                | EventMask::IGNORED
                                | EventMask::Q_OVERFLOW
                                | EventMask::UNMOUNT)
                                .bits();
                        let decoded = Event::from_bits_truncate(raw);
                        if decoded.is_empty() {
                            continue;
                        }

                        let ei = EventInfo::new(path, decoded)
                            .with_dir_hint(event.mask.contains(EventMask::ISDIR))
                            .with_sys(Arc::new(InotifySysEvent {
                                mask: event.mask.bits(),
                                cookie: event.cookie,
                            }));
                        if self.out_tx.try_send(Ok(ei)).is_err() {
                            log::warn!("event buffer full, dropping inotify event");
                        }
                    }

                    if num_events == 0 {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // A failed read leaves the stream unusable: surface one
                    // terminal error and close the channel.
                    let _ = self.out_tx.try_send(Err(Error::io(e)));
                    self.running = false;
                    return;
                }
            }
        }

        for (wd, path) in gone {
            self.watches.remove(&path);
            self.paths.remove(&wd);
        }
    }
}

impl InotifyWatcher {
    /// Creates the backend and its bounded event stream.
    pub fn new(config: &Config) -> Result<(Self, Receiver<Result<EventInfo>>)> {
        let inotify = Inotify::init().map_err(Error::io)?;
        let poll = mio::Poll::new().map_err(Error::io)?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), MESSAGE).map_err(Error::io)?);

        let fd = inotify.as_raw_fd();
        let mut source = mio::unix::SourceFd(&fd);
        poll.registry()
            .register(&mut source, INOTIFY, mio::Interest::READABLE)
            .map_err(Error::io)?;

        let (msg_tx, msg_rx) = unbounded();
        let (out_tx, out_rx) = bounded(config.buffer_capacity());

        let event_loop = EventLoop {
            running: true,
            poll,
            msg_rx,
            inotify: Some(inotify),
            out_tx,
            watches: HashMap::new(),
            paths: HashMap::new(),
        };
        thread::Builder::new()
            .name("watchtree inotify loop".into())
            .spawn(move || event_loop.run())
            .map_err(Error::io)?;

        Ok((
            InotifyWatcher {
                msg_tx,
                waker,
                closed: false,
            },
            out_rx,
        ))
    }

    fn request(&self, msg: Message, reply_rx: Receiver<Result<()>>) -> Result<()> {
        self.msg_tx
            .send(msg)
            .map_err(|_| Error::generic("inotify event loop terminated"))?;
        self.waker.wake().map_err(Error::io)?;
        reply_rx
            .recv()
            .map_err(|_| Error::generic("inotify event loop terminated"))?
    }
}

impl Watcher for InotifyWatcher {
    fn watch(&mut self, path: &Path, events: Event) -> Result<()> {
        let (reply_tx, reply_rx) = unbounded();
        self.request(Message::Watch(path.to_path_buf(), events, reply_tx), reply_rx)
    }

    fn rewatch(&mut self, path: &Path, old: Event, new: Event) -> Result<()> {
        let (reply_tx, reply_rx) = unbounded();
        self.request(
            Message::Rewatch(path.to_path_buf(), old, new, reply_tx),
            reply_rx,
        )
    }

    fn unwatch(&mut self, path: &Path) -> Result<()> {
        let (reply_tx, reply_rx) = unbounded();
        self.request(Message::Unwatch(path.to_path_buf(), reply_tx), reply_rx)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let (reply_tx, reply_rx) = unbounded();
        self.request(Message::Close(reply_tx), reply_rx)
    }
}

impl Drop for InotifyWatcher {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}
