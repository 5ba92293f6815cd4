//! Deferred program teardown.
//!
//! Freeing a program returns JIT chunks to the pack allocator and removes its symbol,
//! both of which lock. That work never runs on the invoking thread: programs forward
//! their parts to a dedicated worker when they are dropped.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, debug_span, warn};

use crate::prog_aux::ProgramAux;
use crate::program::{Entry, InsnImage, Program};
use crate::{Result, RuntimeError};

/// Parts of a dropped program still holding resources.
///
/// Field order is drop order: the symbol goes before the code it names.
pub(crate) struct Retired {
    pub(crate) id: u32,
    pub(crate) aux: Option<Box<ProgramAux>>,
    pub(crate) entry: Entry,
    pub(crate) image: InsnImage,
}

pub(crate) enum Message {
    Retire(Retired),
    Release(Arc<Program>),
    Barrier(Sender<()>),
    Shutdown,
}

pub struct ReleaseQueue {
    sender: Sender<Message>,
    worker: Option<JoinHandle<()>>,
}

impl ReleaseQueue {
    pub fn spawn(thread_name: &str) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let worker = std::thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || Self::run(&receiver))
            .map_err(|err| RuntimeError::OutOfMemory(format!("release worker: {err}")))?;
        Ok(Self {
            sender,
            worker: Some(worker),
        })
    }

    fn run(receiver: &Receiver<Message>) {
        while let Ok(message) = receiver.recv() {
            match message {
                Message::Retire(retired) => {
                    let _span = debug_span!("prog", id = retired.id).entered();
                    drop(retired);
                    debug!("program released");
                }
                Message::Release(prog) => {
                    // The last reference is torn down here so a later barrier sees it gone.
                    if let Ok(mut prog) = Arc::try_unwrap(prog) {
                        prog.detach_release();
                        debug!(id = prog.id(), "program released");
                    }
                }
                Message::Barrier(done) => {
                    let _ = done.send(());
                }
                Message::Shutdown => break,
            }
        }
        // Anything queued behind the shutdown request is torn down before exiting.
        for message in receiver.try_iter() {
            if let Message::Barrier(done) = message {
                let _ = done.send(());
            }
        }
    }

    pub(crate) fn sender(&self) -> Sender<Message> {
        self.sender.clone()
    }

    /// Drops `prog` on the worker thread.
    pub fn release(&self, prog: Arc<Program>) {
        if let Err(err) = self.sender.send(Message::Release(prog)) {
            warn!("release worker gone, dropping program inline");
            drop(err.into_inner());
        }
    }

    /// Waits until everything queued so far has been torn down.
    pub fn flush(&self) {
        let (done, wait) = crossbeam_channel::bounded(1);
        if self.sender.send(Message::Barrier(done)).is_ok() {
            let _ = wait.recv();
        }
    }
}

impl Drop for ReleaseQueue {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("release worker panicked");
            }
        }
    }
}
