//! Cursor-bounded paging over ordered collections.
//!
//! A [`PagingController`] loads one page of `page_size` children with
//! `start`, then extends the window one page at a time with `next` and
//! `previous`. Each step queries from the current boundary key of the
//! window, drops the boundary itself from the result and hands the rest
//! to its [`PagingDelegate`] as a multi-child `Child(Added)` snapshot of
//! the collection location.

use crate::error::{CollectionError, CollectionResult};
use parking_lot::Mutex;
use realtree_core::{
    CancelListener, ChildChange, CoreError, DataEvent, DataListener, Node, PageQuery,
    RealtimeDatabase, Snapshot, Subscription,
};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Callback invoked once the first page was delivered.
pub type StartCompletion = Box<dyn FnOnce() + Send>;

/// Receiver of paged data, usually the view displaying the window.
pub trait PagingDelegate: Send + Sync {
    /// Key of the first element of the window.
    fn first_key(&self) -> Option<String>;

    /// Key of the last element of the window.
    fn last_key(&self) -> Option<String>;

    /// Receives a page or a live update.
    fn did_receive(&self, snapshot: Snapshot, event: DataEvent);

    /// Receives a query failure.
    fn did_cancel(&self, error: CoreError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => write!(f, "next"),
            Direction::Backward => write!(f, "previous"),
        }
    }
}

#[derive(Default)]
struct PagingState {
    started: bool,
    generation: u64,
    page_size: usize,
    observed_new: bool,
    start_page: Option<Subscription>,
    pages: Vec<Subscription>,
    first_key: Option<String>,
    last_key: Option<String>,
    forward_end: bool,
    backward_end: bool,
}

/// Sliding window over the children of a location, ordered by key.
pub struct PagingController {
    database: Arc<dyn RealtimeDatabase>,
    node: Node,
    ascending: bool,
    delegate: Weak<dyn PagingDelegate>,
    me: Weak<PagingController>,
    state: Mutex<PagingState>,
}

impl PagingController {
    /// Creates a stopped controller.
    pub fn new(
        database: Arc<dyn RealtimeDatabase>,
        node: Node,
        page_size: usize,
        ascending: bool,
        delegate: Weak<dyn PagingDelegate>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            database,
            node,
            ascending,
            delegate,
            me: me.clone(),
            state: Mutex::new(PagingState {
                page_size,
                ..PagingState::default()
            }),
        })
    }

    /// Location of the collection.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// True if the window is ordered by ascending keys.
    pub fn is_ascending(&self) -> bool {
        self.ascending
    }

    /// Number of children fetched per page.
    pub fn page_size(&self) -> usize {
        self.state.lock().page_size
    }

    /// Changes the page size for subsequent pages.
    pub fn set_page_size(&self, page_size: usize) {
        self.state.lock().page_size = page_size;
    }

    /// True between `start` and `stop`.
    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    /// True if the first page keeps receiving added children.
    pub fn is_observing_new(&self) -> bool {
        self.state.lock().observed_new
    }

    /// Boundary used by the last `previous` step.
    pub fn first_key(&self) -> Option<String> {
        self.state.lock().first_key.clone()
    }

    /// Boundary used by the last `next` step.
    pub fn last_key(&self) -> Option<String> {
        self.state.lock().last_key.clone()
    }

    /// Loads the first page.
    ///
    /// With `observe_new` the first page keeps delivering added children.
    pub fn start(
        &self,
        observe_new: bool,
        completion: Option<StartCompletion>,
    ) -> CollectionResult<()> {
        let (generation, page_size) = {
            let mut state = self.state.lock();
            if state.started {
                return Err(CollectionError::AlreadyStarted);
            }
            state.started = true;
            state.generation += 1;
            state.observed_new = observe_new;
            state.first_key = None;
            state.last_key = None;
            state.forward_end = false;
            state.backward_end = false;
            (state.generation, state.page_size)
        };
        debug!(node = %self.node, page_size, observe_new, "starting paging");

        let mut query = PageQuery::new(self.node.clone(), page_size).ascending(self.ascending);
        if observe_new {
            query = query.observe(ChildChange::Added);
        }

        let completion = Mutex::new(completion);
        let controller = self.me.clone();
        let on_update: DataListener = Arc::new(move |snapshot: Snapshot, event| {
            let Some(controller) = controller.upgrade() else {
                return;
            };
            if !controller.is_current(generation) {
                return;
            }
            if event == DataEvent::Value {
                let partial = snapshot.children_count() < page_size;
                controller.state.lock().forward_end = partial;
                controller.deliver(snapshot, event);
                let completion = completion.lock().take();
                if let Some(completion) = completion {
                    completion();
                }
            } else {
                controller.deliver(snapshot, event);
            }
        });

        let subscription =
            self.database
                .observe_page(query, on_update, Some(self.cancel_listener(generation)));
        let mut state = self.state.lock();
        if state.started && state.generation == generation {
            state.start_page = Some(subscription);
        } else {
            drop(state);
            subscription.dispose();
        }
        Ok(())
    }

    /// Stops every query and forgets the window boundaries.
    pub fn stop(&self) {
        let (start_page, pages) = {
            let mut state = self.state.lock();
            if !state.started {
                return;
            }
            state.started = false;
            state.generation += 1;
            state.first_key = None;
            state.last_key = None;
            state.forward_end = false;
            state.backward_end = false;
            (state.start_page.take(), std::mem::take(&mut state.pages))
        };
        debug!(node = %self.node, "stopping paging");
        if let Some(subscription) = start_page {
            subscription.dispose();
        }
        for subscription in pages {
            subscription.dispose();
        }
    }

    /// Extends the window past its last element.
    ///
    /// Returns `false` if there is nothing new to page into.
    pub fn next(&self) -> CollectionResult<bool> {
        self.step(Direction::Forward)
    }

    /// Extends the window before its first element.
    ///
    /// Returns `false` if there is nothing new to page into.
    pub fn previous(&self) -> CollectionResult<bool> {
        self.step(Direction::Backward)
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.state.lock();
        state.started && state.generation == generation
    }

    fn deliver(&self, snapshot: Snapshot, event: DataEvent) {
        if let Some(delegate) = self.delegate.upgrade() {
            delegate.did_receive(snapshot, event);
        }
    }

    fn cancel_listener(&self, generation: u64) -> CancelListener {
        let controller = self.me.clone();
        Arc::new(move |error: CoreError| {
            let Some(controller) = controller.upgrade() else {
                return;
            };
            if !controller.is_current(generation) {
                return;
            }
            warn!(node = %controller.node, %error, "paged query cancelled");
            if let Some(delegate) = controller.delegate.upgrade() {
                delegate.did_cancel(error);
            }
        })
    }

    /// True if live updates extend the window in `direction`.
    fn is_live_tail(&self, observed_new: bool, direction: Direction) -> bool {
        observed_new && ((direction == Direction::Forward) == self.ascending)
    }

    fn step(&self, direction: Direction) -> CollectionResult<bool> {
        let Some(delegate) = self.delegate.upgrade() else {
            return Ok(false);
        };
        let boundary = match direction {
            Direction::Forward => delegate.last_key(),
            Direction::Backward => delegate.first_key(),
        };

        let (generation, page_size, boundary) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if !state.started {
                return Err(CollectionError::NotStarted);
            }
            let Some(boundary) = boundary else {
                debug!(node = %self.node, %direction, "no more data");
                return Ok(false);
            };
            let live_tail = self.is_live_tail(state.observed_new, direction);
            let (tracked, at_edge) = match direction {
                Direction::Forward => (&mut state.last_key, state.forward_end),
                Direction::Backward => (&mut state.first_key, state.backward_end),
            };
            let advanced = tracked.as_deref() != Some(boundary.as_str());
            if !live_tail && (!advanced || at_edge) {
                debug!(node = %self.node, %direction, "no more data");
                return Ok(false);
            }
            *tracked = Some(boundary.clone());
            (state.generation, state.page_size, boundary)
        };

        let towards_larger = (direction == Direction::Forward) == self.ascending;
        let query = PageQuery::new(self.node.clone(), page_size).ascending(towards_larger);
        let query = if towards_larger {
            query.after(Some(boundary.clone()))
        } else {
            query.before(Some(boundary.clone()))
        };
        debug!(node = %self.node, %direction, boundary = %boundary, "loading page");

        let controller = self.me.clone();
        let on_update: DataListener = Arc::new(move |snapshot: Snapshot, event| {
            let Some(controller) = controller.upgrade() else {
                return;
            };
            if !controller.is_current(generation) {
                return;
            }
            match event {
                DataEvent::Value => {
                    let page = snapshot.excluding([boundary.as_str()]);
                    let partial = page.children_count() < page_size;
                    {
                        let mut state = controller.state.lock();
                        match direction {
                            Direction::Forward => state.forward_end = partial,
                            Direction::Backward => state.backward_end = partial,
                        }
                    }
                    if page.has_children() {
                        controller.deliver(page, DataEvent::Child(ChildChange::Added));
                    }
                }
                DataEvent::Child(ChildChange::Added) if snapshot.key() != boundary => {
                    controller.deliver(snapshot, event);
                }
                _ => {}
            }
        });

        let subscription =
            self.database
                .observe_page(query, on_update, Some(self.cancel_listener(generation)));
        let mut state = self.state.lock();
        if state.started && state.generation == generation {
            state.pages.push(subscription);
        } else {
            drop(state);
            subscription.dispose();
        }
        Ok(true)
    }
}

impl fmt::Debug for PagingController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PagingController")
            .field("node", &self.node)
            .field("ascending", &self.ascending)
            .field("page_size", &state.page_size)
            .field("started", &state.started)
            .field("first_key", &state.first_key)
            .field("last_key", &state.last_key)
            .finish()
    }
}

/// User-facing handle driving the controller of a paged view.
///
/// The handle does not keep the controller alive; it becomes detached when
/// the view switches mode or is dropped.
#[derive(Default)]
pub struct PagingControl {
    controller: Mutex<Weak<PagingController>>,
}

impl PagingControl {
    /// Creates a detached handle.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn attach(&self, controller: &Arc<PagingController>) {
        *self.controller.lock() = Arc::downgrade(controller);
    }

    pub(crate) fn detach(&self) {
        *self.controller.lock() = Weak::new();
    }

    fn controller(&self) -> Option<Arc<PagingController>> {
        self.controller.lock().upgrade()
    }

    /// True if a controller is attached.
    pub fn is_attached(&self) -> bool {
        self.controller().is_some()
    }

    /// True if `next` and `previous` can run.
    pub fn can_make_step(&self) -> bool {
        self.controller().is_some_and(|c| c.is_started())
    }

    /// Starts the attached controller.
    pub fn start(
        &self,
        observe_new: bool,
        completion: Option<StartCompletion>,
    ) -> CollectionResult<()> {
        self.controller()
            .ok_or(CollectionError::Detached)?
            .start(observe_new, completion)
    }

    /// Stops the attached controller.
    pub fn stop(&self) {
        if let Some(controller) = self.controller() {
            controller.stop();
        }
    }

    /// Loads the next page. Returns `false` if nothing was requested.
    pub fn next(&self) -> bool {
        self.make_step(Direction::Forward)
    }

    /// Loads the previous page. Returns `false` if nothing was requested.
    pub fn previous(&self) -> bool {
        self.make_step(Direction::Backward)
    }

    fn make_step(&self, direction: Direction) -> bool {
        let Some(controller) = self.controller() else {
            return false;
        };
        match controller.step(direction) {
            Ok(requested) => requested,
            Err(error) => {
                warn!(node = %controller.node, %direction, %error, "paging step refused");
                false
            }
        }
    }
}

impl fmt::Debug for PagingControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagingControl")
            .field("attached", &self.is_attached())
            .finish()
    }
}
