// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Entry point of other threads into the DRM thread.
//!
//! Every call is posted to the DRM thread. Replies are posted back to the [`TaskRunner`] the proxy
//! was created with, so callbacks always run on the thread that owns that runner, whichever thread
//! did the work. Only buffer creation blocks the caller.

use std::fs::File;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use crate::device_manager::DrmDeviceGenerator;
use crate::display::ColorCorrection;
use crate::display::DisplayMode;
use crate::display::DisplaySnapshot;
use crate::display::HdcpState;
use crate::gbm::BufferFormat;
use crate::gbm::BufferUsage;
use crate::gbm::GbmBuffer;
use crate::gbm::NativePixmapHandle;
use crate::overlay::OverlayStatusCallback;
use crate::overlay::OverlaySurfaceCandidate;
use crate::overlay::OverlayValidator;
use crate::screen::CursorBitmap;
use crate::screen::OverlayPlane;
use crate::screen::SwapResult;
use crate::thread::DrmThread;
use crate::thread::DrmThreadContext;
use crate::thread::DrmThreadOptions;
use crate::thread::Result;
use crate::thread::Task;
use crate::thread::ThreadError;
use crate::Point;
use crate::Rect;
use crate::Size;
use crate::Widget;

pub type Closure = Box<dyn FnOnce() + Send + 'static>;

/// Runs closures on the thread it belongs to.
pub trait TaskRunner: Send + Sync {
    fn post_task(&self, task: Closure);
}

/// Runs tasks right away on the posting thread, for replies that have no thread affinity.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineTaskRunner;

impl TaskRunner for InlineTaskRunner {
    fn post_task(&self, task: Closure) {
        task()
    }
}

/// A [`TaskRunner`] whose tasks run when its owner calls [`TaskQueue::run_pending`].
#[derive(Debug)]
pub struct TaskQueue {
    sender: mpsc::Sender<Closure>,
    receiver: mpsc::Receiver<Closure>,
}

#[derive(Clone, Debug)]
pub struct TaskQueueRunner {
    sender: mpsc::Sender<Closure>,
}

impl TaskRunner for TaskQueueRunner {
    fn post_task(&self, task: Closure) {
        if self.sender.send(task).is_err() {
            log::warn!("Dropping a task posted to a destroyed queue");
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self { sender, receiver }
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn runner(&self) -> Arc<dyn TaskRunner> {
        Arc::new(TaskQueueRunner { sender: self.sender.clone() })
    }

    /// Runs every task already posted. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        while let Ok(task) = self.receiver.try_recv() {
            task();
            count += 1;
        }
        count
    }

    /// Waits up to `timeout` for a task and runs it. Returns whether one ran.
    pub fn run_one(&self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Ok(task) => {
                task();
                true
            }
            Err(_) => false,
        }
    }
}

/// Wraps `callback` so that calling it, from any thread, posts the call to `runner`.
pub fn create_safe_callback<A, F>(
    runner: Arc<dyn TaskRunner>,
    callback: F,
) -> impl FnOnce(A) + Send + 'static
where
    A: Send + 'static,
    F: FnOnce(A) + Send + 'static,
{
    move |arg| runner.post_task(Box::new(move || callback(arg)))
}

/// Cheap to clone handle on a [`DrmThread`].
#[derive(Clone)]
pub struct DrmThreadProxy {
    thread: Arc<Mutex<Option<DrmThread>>>,
    reply_runner: Arc<dyn TaskRunner>,
}

impl std::fmt::Debug for DrmThreadProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmThreadProxy").field("thread", &self.thread).finish_non_exhaustive()
    }
}

impl DrmThreadProxy {
    /// Creates a proxy whose replies are delivered through `reply_runner`.
    pub fn new(reply_runner: Arc<dyn TaskRunner>) -> Self {
        Self { thread: Arc::new(Mutex::new(None)), reply_runner }
    }

    /// Starts the DRM thread. Replaces a previously started thread.
    pub fn start(
        &self,
        generator: Box<dyn DrmDeviceGenerator>,
        options: DrmThreadOptions,
    ) -> Result<()> {
        let mut thread = DrmThread::new(generator, options)?;
        thread.start()?;
        let previous = self.thread.lock().unwrap().replace(thread);
        drop(previous);
        Ok(())
    }

    pub fn stop(&self) {
        // Join outside of the lock so that tasks still draining can post back through the proxy.
        let thread = self.thread.lock().unwrap().take();
        drop(thread);
    }

    fn post(&self, task: Task) -> Result<()> {
        match self.thread.lock().unwrap().as_ref() {
            Some(thread) => thread.post_task(task),
            None => Err(ThreadError::NotRunning),
        }
    }

    fn post_logged(&self, what: &str, task: Task) {
        if let Err(e) = self.post(task) {
            log::error!("Failed to post {what}: {e}");
        }
    }

    fn post_sync<R, F>(&self, task: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut DrmThreadContext) -> R + Send + 'static,
    {
        // Only hold the lock while posting, the reply is awaited without it.
        let (sender, receiver) = mpsc::sync_channel(1);
        self.post(Box::new(move |context| {
            let _ = sender.send(task(context));
        }))?;
        receiver.recv().map_err(|_| ThreadError::Disconnected)
    }

    fn safe_callback<A, F>(&self, callback: F) -> impl FnOnce(A) + Send + 'static
    where
        A: Send + 'static,
        F: FnOnce(A) + Send + 'static,
    {
        create_safe_callback(self.reply_runner.clone(), callback)
    }

    pub fn add_graphics_device(&self, path: PathBuf, file: File) {
        self.post_logged(
            "add_graphics_device",
            Box::new(move |context| {
                context.add_graphics_device(&path, file);
            }),
        );
    }

    pub fn remove_graphics_device(&self, path: PathBuf) {
        self.post_logged(
            "remove_graphics_device",
            Box::new(move |context| context.remove_graphics_device(&path)),
        );
    }

    /// Allocates a buffer, blocking until the DRM thread is done. `None` means no buffer.
    pub fn create_buffer(
        &self,
        widget: Widget,
        size: Size,
        format: BufferFormat,
        usage: BufferUsage,
    ) -> Option<Arc<GbmBuffer>> {
        self.post_sync(move |context| context.create_buffer(widget, size, format, usage))
            .map_err(|e| log::error!("Failed to create buffer: {e}"))
            .ok()
            .flatten()
    }

    pub fn create_buffer_from_handle(
        &self,
        widget: Widget,
        size: Size,
        format: BufferFormat,
        handle: NativePixmapHandle,
    ) -> Option<Arc<GbmBuffer>> {
        self.post_sync(move |context| {
            context.create_buffer_from_handle(widget, size, format, handle)
        })
        .map_err(|e| log::error!("Failed to import buffer: {e}"))
        .ok()
        .flatten()
    }

    pub fn create_window(&self, widget: Widget, bounds: Rect) {
        self.post_logged(
            "create_window",
            Box::new(move |context| context.create_window(widget, bounds)),
        );
    }

    pub fn destroy_window(&self, widget: Widget) {
        self.post_logged("destroy_window", Box::new(move |context| context.destroy_window(widget)));
    }

    pub fn set_window_bounds(&self, widget: Widget, bounds: Rect) {
        self.post_logged(
            "set_window_bounds",
            Box::new(move |context| context.set_window_bounds(widget, bounds)),
        );
    }

    /// Presents `planes` in `widget`. `callback` always runs, with [`SwapResult::Failed`] if the
    /// DRM thread is gone.
    pub fn schedule_page_flip<F>(&self, widget: Widget, planes: Vec<OverlayPlane>, callback: F)
    where
        F: FnOnce(SwapResult) + Send + 'static,
    {
        let callback = Arc::new(Mutex::new(Some(self.safe_callback(callback))));
        let on_thread = callback.clone();
        let result = self.post(Box::new(move |context| {
            if let Some(callback) = on_thread.lock().unwrap().take() {
                context.schedule_page_flip(widget, planes, Box::new(callback));
            }
        }));
        if let Err(e) = result {
            log::error!("Failed to schedule page flip: {e}");
            if let Some(callback) = callback.lock().unwrap().take() {
                callback(SwapResult::Failed);
            }
        }
    }

    pub fn set_cursor(&self, widget: Widget, bitmap: Option<CursorBitmap>, location: Point) {
        self.post_logged(
            "set_cursor",
            Box::new(move |context| context.set_cursor(widget, bitmap, location)),
        );
    }

    pub fn move_cursor(&self, widget: Widget, location: Point) {
        self.post_logged(
            "move_cursor",
            Box::new(move |context| context.move_cursor(widget, location)),
        );
    }

    pub fn refresh_native_displays<F>(&self, callback: F)
    where
        F: FnOnce(Vec<DisplaySnapshot>) + Send + 'static,
    {
        let callback = self.safe_callback(callback);
        self.post_logged(
            "refresh_native_displays",
            Box::new(move |context| callback(context.refresh_native_displays())),
        );
    }

    pub fn configure_native_display<F>(
        &self,
        display_id: i64,
        mode: DisplayMode,
        origin: Point,
        callback: F,
    ) where
        F: FnOnce((i64, bool)) + Send + 'static,
    {
        let callback = self.safe_callback(callback);
        self.post_logged(
            "configure_native_display",
            Box::new(move |context| {
                let success = context.configure_native_display(display_id, &mode, origin);
                callback((display_id, success));
            }),
        );
    }

    pub fn disable_native_display<F>(&self, display_id: i64, callback: F)
    where
        F: FnOnce((i64, bool)) + Send + 'static,
    {
        let callback = self.safe_callback(callback);
        self.post_logged(
            "disable_native_display",
            Box::new(move |context| {
                let success = context.disable_native_display(display_id);
                callback((display_id, success));
            }),
        );
    }

    pub fn take_display_control<F>(&self, callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let callback = self.safe_callback(callback);
        self.post_logged(
            "take_display_control",
            Box::new(move |context| callback(context.take_display_control())),
        );
    }

    pub fn relinquish_display_control<F>(&self, callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let callback = self.safe_callback(callback);
        self.post_logged(
            "relinquish_display_control",
            Box::new(move |context| callback(context.relinquish_display_control())),
        );
    }

    pub fn get_hdcp_state<F>(&self, display_id: i64, callback: F)
    where
        F: FnOnce((i64, Option<HdcpState>)) + Send + 'static,
    {
        let callback = self.safe_callback(callback);
        self.post_logged(
            "get_hdcp_state",
            Box::new(move |context| callback((display_id, context.get_hdcp_state(display_id)))),
        );
    }

    pub fn set_hdcp_state<F>(&self, display_id: i64, state: HdcpState, callback: F)
    where
        F: FnOnce((i64, bool)) + Send + 'static,
    {
        let callback = self.safe_callback(callback);
        self.post_logged(
            "set_hdcp_state",
            Box::new(move |context| {
                callback((display_id, context.set_hdcp_state(display_id, state)))
            }),
        );
    }

    pub fn set_color_correction(&self, display_id: i64, correction: ColorCorrection) {
        self.post_logged(
            "set_color_correction",
            Box::new(move |context| context.set_color_correction(display_id, &correction)),
        );
    }
}

impl OverlayValidator for DrmThreadProxy {
    fn request_validation(
        &self,
        widget: Widget,
        candidates: Vec<OverlaySurfaceCandidate>,
        callback: OverlayStatusCallback,
    ) {
        let callback = self.safe_callback(callback);
        self.post_logged(
            "check_overlay_capabilities",
            Box::new(move |context| {
                callback(context.check_overlay_capabilities(widget, &candidates))
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_manager::tests::dev_null;
    use crate::device_manager::tests::FakeGenerator;
    use crate::drm::fake::FakeBackend;
    use crate::drm::plane_manager::CropRect;
    use crate::overlay::DrmOverlayManager;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Fixture {
        fake: FakeBackend,
        queue: TaskQueue,
        proxy: DrmThreadProxy,
    }

    impl Fixture {
        fn new() -> Self {
            let _ = env_logger::try_init();
            let fake = FakeBackend::with_displays(1);
            let generator = FakeGenerator::default();
            generator.add("/dev/dri/card0", fake.clone());
            let queue = TaskQueue::new();
            let proxy = DrmThreadProxy::new(queue.runner());
            proxy.start(Box::new(generator), Default::default()).unwrap();
            proxy.add_graphics_device(PathBuf::from("/dev/dri/card0"), dev_null());
            Self { fake, queue, proxy }
        }

        /// Runs reply tasks until `result` holds a value.
        fn wait_for<T>(&self, result: &Arc<Mutex<Option<T>>>) -> T {
            loop {
                if let Some(value) = result.lock().unwrap().take() {
                    return value;
                }
                assert!(self.queue.run_one(TIMEOUT), "timed out waiting for a reply");
            }
        }

        fn configure_display(&self) -> DisplaySnapshot {
            let snapshots = Arc::new(Mutex::new(None));
            let slot = snapshots.clone();
            self.proxy.refresh_native_displays(move |s| *slot.lock().unwrap() = Some(s));
            let snapshot = self.wait_for(&snapshots).remove(0);

            let configured = Arc::new(Mutex::new(None));
            let slot = configured.clone();
            self.proxy.configure_native_display(
                snapshot.display_id,
                snapshot.native_mode.clone().unwrap(),
                Point::default(),
                move |r| *slot.lock().unwrap() = Some(r),
            );
            assert_eq!(self.wait_for(&configured), (snapshot.display_id, true));
            snapshot
        }
    }

    #[test]
    fn safe_callback_runs_on_the_runner() {
        let queue = TaskQueue::new();
        let result = Arc::new(Mutex::new(None));
        let slot = result.clone();
        let callback = create_safe_callback(queue.runner(), move |value: u32| {
            *slot.lock().unwrap() = Some(std::thread::current().id());
            assert_eq!(value, 42);
        });
        std::thread::spawn(move || callback(42)).join().unwrap();
        assert!(result.lock().unwrap().is_none());
        assert_eq!(queue.run_pending(), 1);
        assert_eq!(result.lock().unwrap().unwrap(), std::thread::current().id());
    }

    #[test]
    fn buffers_are_created_synchronously() {
        let fixture = Fixture::new();
        let buffer = fixture
            .proxy
            .create_buffer(1, Size::new(1920, 1080), BufferFormat::Bgrx8888, BufferUsage::Scanout)
            .unwrap();
        assert_ne!(buffer.framebuffer_id(), 0);
        assert!(fixture.fake.state().framebuffers.contains_key(&buffer.framebuffer_id()));

        let empty = fixture.proxy.create_buffer(
            1,
            Size::new(0, 0),
            BufferFormat::Bgrx8888,
            BufferUsage::Scanout,
        );
        assert!(empty.is_none());
    }

    #[test]
    fn page_flip_is_acked_after_the_kernel_event() {
        let fixture = Fixture::new();
        let snapshot = fixture.configure_display();
        let size = snapshot.native_mode.unwrap().size;
        fixture.proxy.create_window(1, Rect::new(0, 0, size.width, size.height));

        let buffer = fixture
            .proxy
            .create_buffer(1, size, BufferFormat::Bgrx8888, BufferUsage::Scanout)
            .unwrap();
        let plane = OverlayPlane::new(
            buffer,
            0,
            Rect::new(0, 0, size.width, size.height),
            CropRect::from_size(size),
        );

        let result = Arc::new(Mutex::new(None));
        let slot = result.clone();
        fixture.proxy.schedule_page_flip(1, vec![plane], move |r| {
            *slot.lock().unwrap() = Some(r);
        });

        // Wait for the commit to reach the kernel before completing it.
        for _ in 0..500 {
            if fixture.fake.pending_flip_count() > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(result.lock().unwrap().is_none());
        assert_eq!(fixture.fake.complete_flips(), 1);
        assert_eq!(fixture.wait_for(&result), SwapResult::Ack);
    }

    #[test]
    fn page_flip_fails_once_stopped() {
        let fixture = Fixture::new();
        fixture.proxy.stop();
        let result = Arc::new(Mutex::new(None));
        let slot = result.clone();
        fixture.proxy.schedule_page_flip(1, vec![], move |r| *slot.lock().unwrap() = Some(r));
        assert_eq!(fixture.wait_for(&result), SwapResult::Failed);
        assert!(fixture
            .proxy
            .create_buffer(1, Size::new(64, 64), BufferFormat::Bgrx8888, BufferUsage::Scanout)
            .is_none());
    }

    #[test]
    fn removing_the_device_fails_the_pending_flip() {
        let fixture = Fixture::new();
        let snapshot = fixture.configure_display();
        let size = snapshot.native_mode.unwrap().size;
        fixture.proxy.create_window(1, Rect::new(0, 0, size.width, size.height));
        let buffer = fixture
            .proxy
            .create_buffer(1, size, BufferFormat::Bgrx8888, BufferUsage::Scanout)
            .unwrap();
        let plane = OverlayPlane::new(
            buffer,
            0,
            Rect::new(0, 0, size.width, size.height),
            CropRect::from_size(size),
        );

        let result = Arc::new(Mutex::new(None));
        let slot = result.clone();
        fixture.proxy.schedule_page_flip(1, vec![plane], move |r| {
            *slot.lock().unwrap() = Some(r);
        });
        fixture.proxy.remove_graphics_device(PathBuf::from("/dev/dri/card0"));
        assert_eq!(fixture.wait_for(&result), SwapResult::Failed);

        let devices = Arc::new(Mutex::new(None));
        let slot = devices.clone();
        fixture.proxy.refresh_native_displays(move |s| *slot.lock().unwrap() = Some(s));
        assert!(fixture.wait_for(&devices).is_empty());
    }

    #[test]
    fn hdcp_and_display_control() {
        let fixture = Fixture::new();
        let snapshot = fixture.configure_display();
        let id = snapshot.display_id;

        let set = Arc::new(Mutex::new(None));
        let slot = set.clone();
        fixture.proxy.set_hdcp_state(id, HdcpState::Desired, move |r| {
            *slot.lock().unwrap() = Some(r);
        });
        assert_eq!(fixture.wait_for(&set), (id, true));

        let get = Arc::new(Mutex::new(None));
        let slot = get.clone();
        fixture.proxy.get_hdcp_state(id, move |r| *slot.lock().unwrap() = Some(r));
        assert_eq!(fixture.wait_for(&get), (id, Some(HdcpState::Desired)));

        let taken = Arc::new(Mutex::new(None));
        let slot = taken.clone();
        fixture.proxy.take_display_control(move |r| *slot.lock().unwrap() = Some(r));
        assert!(fixture.wait_for(&taken));
        assert!(fixture.fake.state().master);
    }

    #[test]
    fn overlay_manager_validates_through_the_thread() {
        let fixture = Fixture::new();
        let snapshot = fixture.configure_display();
        let size = snapshot.native_mode.unwrap().size;
        fixture.proxy.create_window(5, Rect::new(0, 0, size.width, size.height));

        let manager = DrmOverlayManager::new(Box::new(fixture.proxy.clone()));
        let mut candidates = vec![OverlaySurfaceCandidate {
            buffer_size: size,
            format: BufferFormat::Bgrx8888,
            display_rect: Rect::new(0, 0, size.width, size.height),
            crop_rect: CropRect::from_size(size),
            plane_z_order: 0,
            overlay_handled: false,
        }];
        for _ in 0..3 {
            manager.check_overlay_support(&mut candidates, 5);
            assert!(!candidates[0].overlay_handled);
        }
        assert!(fixture.queue.run_one(TIMEOUT));
        manager.check_overlay_support(&mut candidates, 5);
        assert!(candidates[0].overlay_handled);
    }
}
