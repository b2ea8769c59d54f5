// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The DRM thread: a dedicated OS thread owning every device, buffer and display controller.
//!
//! Other threads talk to it by posting tasks, which run in FIFO order. The thread waits on an
//! epoll set holding a task eventfd and the fd of every DRM device, so page flip completions are
//! dispatched as soon as the kernel reports them, interleaved with queued tasks.

use std::collections::VecDeque;
use std::os::fd::AsFd;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;

use nix::errno::Errno;
use nix::sys::epoll::Epoll;
use nix::sys::epoll::EpollCreateFlags;
use nix::sys::epoll::EpollEvent;
use nix::sys::epoll::EpollFlags;
use nix::sys::epoll::EpollTimeout;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;
use thiserror::Error;

use crate::device_manager::DrmDeviceGenerator;

pub mod context;
pub mod proxy;

pub use context::DrmThreadContext;
pub use proxy::DrmThreadProxy;

const TASK_EVENT_TOKEN: u64 = 0;
const MAX_EVENTS: usize = 8;

#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("failed to create EventFd for awaiting task event: {0}")]
    AwaitingTaskEventFd(Errno),
    #[error("failed to create Epoll: {0}")]
    Epoll(Errno),
    #[error("failed to add poll FDs to Epoll: {0}")]
    EpollAdd(Errno),
    #[error("the DRM thread was already started")]
    AlreadyStarted,
    #[error("the DRM thread is not running")]
    NotRunning,
    #[error("the DRM thread dropped the task before replying")]
    Disconnected,
    #[error("a synchronous task cannot be posted from the DRM thread itself")]
    Reentrant,
}

pub type Result<T> = std::result::Result<T, ThreadError>;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum DrmThreadState {
    Created,
    Running,
    Stopping,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct DrmThreadOptions {
    /// Use atomic modesetting on devices that support it.
    pub use_atomic: bool,
    pub thread_name: String,
}

impl Default for DrmThreadOptions {
    fn default() -> Self {
        Self { use_atomic: true, thread_name: "DrmThread".into() }
    }
}

pub type Task = Box<dyn FnOnce(&mut DrmThreadContext) + Send + 'static>;

pub struct DrmThread {
    options: DrmThreadOptions,
    generator: Option<Box<dyn DrmDeviceGenerator>>,
    awaiting_task_event: Arc<EventFd>,
    task_queue: Arc<Mutex<VecDeque<Task>>>,
    state: Arc<Mutex<DrmThreadState>>,
    worker_thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for DrmThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmThread")
            .field("options", &self.options)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DrmThread {
    pub fn new(
        generator: Box<dyn DrmDeviceGenerator>,
        options: DrmThreadOptions,
    ) -> Result<Self> {
        let awaiting_task_event =
            EventFd::from_flags(EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
                .map_err(ThreadError::AwaitingTaskEventFd)?;
        Ok(Self {
            options,
            generator: Some(generator),
            awaiting_task_event: Arc::new(awaiting_task_event),
            task_queue: Arc::new(Mutex::new(VecDeque::new())),
            state: Arc::new(Mutex::new(DrmThreadState::Created)),
            worker_thread: None,
        })
    }

    pub fn state(&self) -> DrmThreadState {
        *self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.state() == DrmThreadState::Running
    }

    /// Spawns the OS thread. Failing to spawn it is fatal.
    pub fn start(&mut self) -> Result<()> {
        let Some(generator) = self.generator.take() else {
            return Err(ThreadError::AlreadyStarted);
        };
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(ThreadError::Epoll)?;
        *self.state.lock().unwrap() = DrmThreadState::Running;

        let use_atomic = self.options.use_atomic;
        let awaiting_task_event = self.awaiting_task_event.clone();
        let task_queue = self.task_queue.clone();
        let state = self.state.clone();
        let spawned = thread::Builder::new().name(self.options.thread_name.clone()).spawn(
            move || {
                let mut worker = DrmThreadWorker {
                    context: DrmThreadContext::new(generator, use_atomic),
                    epoll,
                    watched_generation: None,
                    awaiting_task_event,
                    task_queue,
                    state,
                };
                worker.process_loop();
            },
        );
        match spawned {
            Ok(handle) => {
                self.worker_thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to start {}: {e}", self.options.thread_name);
                panic!("failed to start {}: {e}", self.options.thread_name);
            }
        }
    }

    /// Stops the thread. Tasks already queued still run before it exits.
    pub fn stop(&mut self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == DrmThreadState::Running {
                *state = DrmThreadState::Stopping;
            }
        }
        let _ = self.awaiting_task_event.write(1);
        if let Some(worker_thread) = self.worker_thread.take() {
            if worker_thread.join().is_err() {
                log::error!("{} panicked", self.options.thread_name);
            }
        }
        let dropped = self.drop_pending_tasks();
        if dropped > 0 {
            log::warn!("{} exited with {dropped} tasks still queued", self.options.thread_name);
        }
        *self.state.lock().unwrap() = DrmThreadState::Stopped;
    }

    /// Empties the task queue without running anything, returning how many tasks were dropped.
    /// Only non-empty if the worker left its loop on an error.
    fn drop_pending_tasks(&self) -> usize {
        let mut queue = self.task_queue.lock().unwrap();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    /// Queues `task` to run on the DRM thread. Fails once [`DrmThread::stop`] has begun.
    pub fn post_task(&self, task: Task) -> Result<()> {
        // The state lock is held across the push so the worker's final drain sees every
        // accepted task.
        let state = self.state.lock().unwrap();
        if *state != DrmThreadState::Running {
            return Err(ThreadError::NotRunning);
        }
        self.task_queue.lock().unwrap().push_back(task);
        drop(state);
        self.awaiting_task_event.write(1).map_err(|_| ThreadError::NotRunning)?;
        Ok(())
    }

    /// Runs `task` on the DRM thread and blocks until it returns its result.
    pub fn post_sync_task<R, F>(&self, task: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut DrmThreadContext) -> R + Send + 'static,
    {
        let on_drm_thread = self
            .worker_thread
            .as_ref()
            .map_or(false, |handle| handle.thread().id() == thread::current().id());
        if on_drm_thread {
            return Err(ThreadError::Reentrant);
        }

        let (sender, receiver) = mpsc::sync_channel(1);
        self.post_task(Box::new(move |context| {
            let _ = sender.send(task(context));
        }))?;
        receiver.recv().map_err(|_| ThreadError::Disconnected)
    }
}

impl Drop for DrmThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Lives on the DRM thread.
struct DrmThreadWorker {
    context: DrmThreadContext,
    epoll: Epoll,
    watched_generation: Option<u64>,
    awaiting_task_event: Arc<EventFd>,
    task_queue: Arc<Mutex<VecDeque<Task>>>,
    state: Arc<Mutex<DrmThreadState>>,
}

impl DrmThreadWorker {
    /// Rebuilds the epoll set when devices came or went. Token 0 is the task event, device `i`
    /// uses token `i + 1`.
    fn update_watches(&mut self) -> Result<()> {
        let generation = self.context.device_generation();
        if self.watched_generation == Some(generation) {
            return Ok(());
        }

        self.epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(ThreadError::Epoll)?;
        self.epoll
            .add(
                self.awaiting_task_event.as_fd(),
                EpollEvent::new(EpollFlags::EPOLLIN, TASK_EVENT_TOKEN),
            )
            .map_err(ThreadError::EpollAdd)?;
        for (index, fd) in self.context.device_fds().into_iter().enumerate() {
            self.epoll
                .add(fd, EpollEvent::new(EpollFlags::EPOLLIN, index as u64 + 1))
                .map_err(ThreadError::EpollAdd)?;
        }
        self.watched_generation = Some(generation);
        Ok(())
    }

    fn run_tasks(&mut self) {
        loop {
            let task = self.task_queue.lock().unwrap().pop_front();
            match task {
                Some(task) => task(&mut self.context),
                None => break,
            }
        }
    }

    fn process_loop(&mut self) {
        log::debug!("DRM thread started");
        while *self.state.lock().unwrap() == DrmThreadState::Running {
            if let Err(e) = self.update_watches() {
                log::error!("Failed to watch DRM device events: {e}");
                break;
            }

            let mut events = [EpollEvent::empty(); MAX_EVENTS];
            let nb_fds = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(nb_fds) => nb_fds,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    log::error!("Failed to wait for DRM thread events: {e}");
                    break;
                }
            };

            for event in &events[..nb_fds] {
                match event.data() {
                    TASK_EVENT_TOKEN => {
                        let _ = self.awaiting_task_event.read();
                    }
                    token => self.context.process_device_events(token as usize - 1),
                }
            }
            self.run_tasks();
        }
        self.run_tasks();
        log::debug!("DRM thread exiting");
    }
}
