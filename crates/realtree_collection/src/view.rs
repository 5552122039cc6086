//! Sorted local mirror of a remote collection.

use crate::collection::OrderedRemoteCollection;
use crate::element::CollectionElement;
use crate::error::{CollectionError, CollectionResult};
use crate::event::{ChangeFeed, CollectionChange, CollectionEvent};
use crate::paging::{PagingControl, PagingController, PagingDelegate};
use crate::sorted::SortedArray;
use parking_lot::Mutex;
use realtree_core::{
    load_with_timeout, ChildChange, CoreError, CoreResult, DataEvent, DataListener, Node,
    ObserverToken, RealtimeConfig, RealtimeDatabase, RealtimeValueEvents, Reversion, Snapshot,
    Transaction, WritableValue,
};
use std::fmt;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, warn};

/// How a view keeps its elements in sync.
#[derive(Debug, Clone)]
pub enum Explorer {
    /// Mirror the whole collection.
    View {
        /// Sort direction.
        ascending: bool,
    },
    /// Mirror a window of pages driven by `control`.
    Page {
        /// Handle attached to the view's paging controller.
        control: Arc<PagingControl>,
        /// Number of children per page.
        page_size: usize,
        /// Sort direction.
        ascending: bool,
    },
}

impl Explorer {
    /// Whole collection mode.
    pub fn view(ascending: bool) -> Self {
        Explorer::View { ascending }
    }

    /// Paged mode.
    pub fn page(control: Arc<PagingControl>, page_size: usize, ascending: bool) -> Self {
        Explorer::Page {
            control,
            page_size,
            ascending,
        }
    }

    /// Sort direction.
    pub fn is_ascending(&self) -> bool {
        match self {
            Explorer::View { ascending } | Explorer::Page { ascending, .. } => *ascending,
        }
    }

    /// True for paged mode.
    pub fn is_paged(&self) -> bool {
        matches!(self, Explorer::Page { .. })
    }
}

impl Default for Explorer {
    fn default() -> Self {
        Explorer::view(true)
    }
}

enum Transition {
    Resort { changed: bool },
    Resize,
    Restart,
}

struct ViewState<E> {
    node: Option<Node>,
    elements: SortedArray<E>,
    explorer: Explorer,
    is_synced: bool,
    is_observed: bool,
    keep_synced: bool,
    observers: Vec<ObserverToken>,
    controller: Option<Arc<PagingController>>,
}

impl<E> ViewState<E> {
    fn is_rooted(&self) -> bool {
        self.node.as_ref().is_some_and(Node::is_rooted)
    }

    fn position(&self, key: &str) -> Option<usize>
    where
        E: CollectionElement,
    {
        self.elements.position(|e| e.key() == key)
    }
}

/// Sorted mirror of the children of a database location.
///
/// The view applies remote change events to a [`SortedArray`] and reports
/// every change as index based [`CollectionEvent`]s to its subscribers.
/// Views that are not bound to a rooted location hold local elements that
/// are written out with [`Transaction::set`].
pub struct SortedCollectionView<E: CollectionElement> {
    database: Arc<dyn RealtimeDatabase>,
    config: Arc<RealtimeConfig>,
    me: Weak<SortedCollectionView<E>>,
    state: Mutex<ViewState<E>>,
    feed: ChangeFeed,
}

impl<E: CollectionElement> SortedCollectionView<E> {
    /// Creates a view of the children of `node`.
    pub fn new(database: Arc<dyn RealtimeDatabase>, node: Node, explorer: Explorer) -> Arc<Self> {
        Self::with_config(database, Some(node), explorer, RealtimeConfig::default())
    }

    /// Creates a view holding local elements only.
    pub fn detached(database: Arc<dyn RealtimeDatabase>, explorer: Explorer) -> Arc<Self> {
        Self::with_config(database, None, explorer, RealtimeConfig::default())
    }

    /// Creates a view using `config` for loads.
    pub fn with_config(
        database: Arc<dyn RealtimeDatabase>,
        node: Option<Node>,
        explorer: Explorer,
        config: RealtimeConfig,
    ) -> Arc<Self> {
        let view = Arc::new_cyclic(|me| Self {
            database,
            config: Arc::new(config),
            me: me.clone(),
            state: Mutex::new(ViewState {
                node,
                elements: SortedArray::new(explorer.is_ascending()),
                explorer,
                is_synced: false,
                is_observed: false,
                keep_synced: false,
                observers: Vec::new(),
                controller: None,
            }),
            feed: ChangeFeed::default(),
        });
        view.install_controller();
        view
    }

    /// Location of the collection.
    pub fn node(&self) -> Option<Node> {
        self.state.lock().node.clone()
    }

    /// Current sync mode.
    pub fn explorer(&self) -> Explorer {
        self.state.lock().explorer.clone()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.state.lock().elements.len()
    }

    /// True if there are no elements.
    pub fn is_empty(&self) -> bool {
        self.state.lock().elements.is_empty()
    }

    /// Element at `index`.
    pub fn element(&self, index: usize) -> Option<E> {
        self.state.lock().elements.get(index).cloned()
    }

    /// Copy of the elements in sort order.
    pub fn elements(&self) -> Vec<E> {
        self.state.lock().elements.as_slice().to_vec()
    }

    /// Keys of the elements in sort order.
    pub fn keys(&self) -> Vec<String> {
        self.state
            .lock()
            .elements
            .iter()
            .map(|e| e.key().to_string())
            .collect()
    }

    /// Index of the element with `key`.
    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.state.lock().position(key)
    }

    /// True once the elements reflect a full load.
    pub fn is_synced(&self) -> bool {
        self.state.lock().is_synced
    }

    /// True while remote changes are observed.
    pub fn is_observed(&self) -> bool {
        self.state.lock().is_observed
    }

    /// Paging controller of a paged view bound to a location.
    pub fn paging_controller(&self) -> Option<Arc<PagingController>> {
        self.state.lock().controller.clone()
    }

    /// Receives every change applied from now on.
    pub fn subscribe(&self) -> Receiver<CollectionChange> {
        self.feed.subscribe()
    }

    /// Applies a remote change and reports it to subscribers.
    ///
    /// A `Value` event rebuilds the elements. A `Child(Added)` snapshot of
    /// the collection location itself carries several new children.
    pub fn apply(&self, snapshot: Snapshot, event: DataEvent) -> CollectionResult<CollectionEvent> {
        let result = self.apply_change(&snapshot, event);
        match &result {
            Ok(change) => trace!(node = %snapshot.node, %event, ?change, "collection change applied"),
            Err(err) => error!(node = %snapshot.node, %event, error = %err, "collection change rejected"),
        }
        self.feed.emit(result.clone());
        result
    }

    fn apply_change(&self, snapshot: &Snapshot, event: DataEvent) -> CollectionResult<CollectionEvent> {
        let mut state = self.state.lock();
        let is_collection = state.node.as_ref() == Some(&snapshot.node);
        match event {
            DataEvent::Value => {
                let items = decode_children::<E>(snapshot)?;
                state.elements.reset(items);
                state.is_synced = true;
                Ok(CollectionEvent::Initial)
            }
            DataEvent::Child(ChildChange::Added) if is_collection => {
                let items = decode_children::<E>(snapshot)?;
                let mut deleted: Vec<usize> = items
                    .iter()
                    .filter_map(|item| state.position(item.key()))
                    .collect();
                deleted.sort_unstable();
                for index in deleted.iter().rev() {
                    state.elements.remove_at(*index);
                }
                let keys: Vec<String> = items.iter().map(|i| i.key().to_string()).collect();
                for item in items {
                    state.elements.insert(item);
                }
                let mut inserted: Vec<usize> =
                    keys.iter().filter_map(|key| state.position(key)).collect();
                inserted.sort_unstable();
                Ok(CollectionEvent::Updated {
                    deleted,
                    inserted,
                    modified: Vec::new(),
                    moved: Vec::new(),
                })
            }
            DataEvent::Child(ChildChange::Added) => {
                let item = E::decode(snapshot)?;
                match state.position(item.key()) {
                    Some(from) => Ok(reposition(&mut state.elements, from, item)),
                    None => Ok(CollectionEvent::inserted(vec![state.elements.insert(item)])),
                }
            }
            DataEvent::Child(ChildChange::Removed) if is_collection => {
                let deleted: Vec<usize> = (0..state.elements.len()).collect();
                state.elements.clear();
                Ok(CollectionEvent::deleted(deleted))
            }
            DataEvent::Child(ChildChange::Removed) => match state.position(snapshot.key()) {
                Some(index) => {
                    state.elements.remove_at(index);
                    Ok(CollectionEvent::deleted(vec![index]))
                }
                None => Err(CollectionError::consistency(
                    snapshot.node.absolute_path(),
                    format!("removed 0 items, remote reported 1 ({})", snapshot.key()),
                )),
            },
            DataEvent::Child(ChildChange::Changed | ChildChange::Moved) => {
                let item = E::decode(snapshot)?;
                let from = state
                    .position(item.key())
                    .ok_or_else(|| CollectionError::item_not_found(item.key()))?;
                Ok(reposition(&mut state.elements, from, item))
            }
        }
    }

    /// Starts mirroring remote changes.
    ///
    /// In whole collection mode this observes added, removed and changed
    /// children and loads the collection unless already synced. In paged
    /// mode it starts the paging controller. Views without a rooted
    /// location are marked synced.
    pub fn run_observing(&self) -> CollectionResult<()> {
        let mut state = self.state.lock();
        let Some(node) = state.node.clone().filter(Node::is_rooted) else {
            state.is_synced = true;
            return Ok(());
        };
        if state.is_observed {
            return Ok(());
        }
        state.is_observed = true;
        let paged = state.explorer.is_paged();
        let needs_load = !state.is_synced;
        drop(state);
        debug!(node = %node, paged, "observing collection");

        if paged {
            self.install_controller();
            let controller = self.state.lock().controller.clone();
            return match controller {
                Some(controller) if !controller.is_started() => controller.start(false, None),
                _ => Ok(()),
            };
        }

        let tokens: Vec<ObserverToken> = [ChildChange::Added, ChildChange::Removed, ChildChange::Changed]
            .into_iter()
            .map(|change| {
                self.database
                    .observe(DataEvent::Child(change), &node, self.listener(), None)
            })
            .collect();
        self.state.lock().observers.extend(tokens);
        if needs_load {
            self.load_all(&node);
        }
        Ok(())
    }

    /// Stops mirroring remote changes unless the view keeps synced.
    pub fn stop_observing(&self) {
        if self.state.lock().keep_synced {
            debug!("collection keeps synced, observation continues");
            return;
        }
        self.halt_observing();
    }

    /// Keeps the view observing even when `stop_observing` is called.
    pub fn keep_synced(&self, keep: bool) -> CollectionResult<()> {
        self.state.lock().keep_synced = keep;
        if keep {
            self.run_observing()
        } else {
            self.stop_observing();
            Ok(())
        }
    }

    /// Changes how the view syncs.
    ///
    /// A direction change within whole collection mode re-sorts the
    /// elements in place. Changing only the page size keeps the window.
    /// Any other change tears down the current mechanism and starts the
    /// new one if the view was observing.
    pub fn set_explorer(&self, explorer: Explorer) -> CollectionResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let transition = match (&state.explorer, &explorer) {
            (Explorer::View { ascending: old }, Explorer::View { ascending: new }) => {
                Transition::Resort {
                    changed: old != new,
                }
            }
            (Explorer::Page { ascending: old, .. }, Explorer::Page { ascending: new, .. })
                if old == new =>
            {
                Transition::Resize
            }
            _ => Transition::Restart,
        };

        match transition {
            Transition::Resort { changed } => {
                state.elements.set_ascending(explorer.is_ascending());
                state.explorer = explorer;
                drop(guard);
                if changed {
                    self.feed.emit(Ok(CollectionEvent::Initial));
                }
                Ok(())
            }
            Transition::Resize => {
                if let (
                    Explorer::Page { control: old, .. },
                    Explorer::Page {
                        control, page_size, ..
                    },
                ) = (&state.explorer, &explorer)
                {
                    if !Arc::ptr_eq(old, control) {
                        old.detach();
                    }
                    if let Some(controller) = &state.controller {
                        controller.set_page_size(*page_size);
                        control.attach(controller);
                    }
                }
                state.explorer = explorer;
                Ok(())
            }
            Transition::Restart => {
                let observing = state.is_observed;
                drop(guard);
                self.halt_observing();
                let (previous, controller) = {
                    let mut state = self.state.lock();
                    state.elements.set_ascending(explorer.is_ascending());
                    let previous = std::mem::replace(&mut state.explorer, explorer);
                    (previous, state.controller.take())
                };
                if let Some(controller) = controller {
                    controller.stop();
                }
                if let Explorer::Page { control, .. } = previous {
                    control.detach();
                }
                self.install_controller();
                if observing {
                    self.run_observing()?;
                }
                Ok(())
            }
        }
    }

    /// Inserts a local element into a detached view.
    pub fn insert(&self, element: E) -> CollectionResult<usize> {
        let index = {
            let mut state = self.state.lock();
            ensure_detached(&state)?;
            if state.position(element.key()).is_some() {
                return Err(CollectionError::invalid_operation(format!(
                    "element {} already exists",
                    element.key()
                )));
            }
            state.elements.insert(element)
        };
        self.feed.emit(Ok(CollectionEvent::inserted(vec![index])));
        Ok(index)
    }

    /// Removes a local element from a detached view.
    pub fn remove(&self, key: &str) -> CollectionResult<Option<E>> {
        let removed = {
            let mut state = self.state.lock();
            ensure_detached(&state)?;
            state
                .position(key)
                .map(|index| (index, state.elements.remove_at(index)))
        };
        Ok(removed.map(|(index, element)| {
            self.feed.emit(Ok(CollectionEvent::deleted(vec![index])));
            element
        }))
    }

    /// Removes every local element from a detached view.
    pub fn remove_all(&self) -> CollectionResult<()> {
        let count = {
            let mut state = self.state.lock();
            ensure_detached(&state)?;
            let count = state.elements.len();
            state.elements.clear();
            count
        };
        if count > 0 {
            self.feed
                .emit(Ok(CollectionEvent::deleted((0..count).collect())));
        }
        Ok(())
    }

    /// Checks whether an element with `key` exists.
    ///
    /// Bound views ask the database, detached views answer from their
    /// local elements.
    pub fn contains_key(
        &self,
        key: &str,
        completion: impl FnOnce(CollectionResult<bool>) + Send + 'static,
    ) {
        let local = {
            let state = self.state.lock();
            (!state.is_rooted()).then(|| state.position(key).is_some())
        };
        match local {
            Some(found) => completion(Ok(found)),
            None => self.load_element(key, move |result| {
                completion(result.map(|snapshot| snapshot.exists()))
            }),
        }
    }

    /// Loads the element with `key`.
    ///
    /// Bound views ask the database, detached views answer from their
    /// local elements.
    pub fn item(
        &self,
        key: &str,
        completion: impl FnOnce(CollectionResult<Option<E>>) + Send + 'static,
    ) {
        let local = {
            let state = self.state.lock();
            (!state.is_rooted())
                .then(|| state.position(key).and_then(|i| state.elements.get(i).cloned()))
        };
        match local {
            Some(found) => completion(Ok(found)),
            None => self.load_element(key, move |result| {
                completion(result.and_then(|snapshot| {
                    if snapshot.exists() {
                        E::decode(&snapshot).map(Some)
                    } else {
                        Ok(None)
                    }
                }))
            }),
        }
    }

    fn load_element(
        &self,
        key: &str,
        completion: impl FnOnce(CollectionResult<Snapshot>) + Send + 'static,
    ) {
        let Some(node) = self.node().filter(Node::is_rooted) else {
            completion(Err(CollectionError::Detached));
            return;
        };
        let completion = Arc::new(Mutex::new(Some(completion)));
        let on_cancel = Arc::clone(&completion);
        load_with_timeout(
            &self.database,
            &node.child(key),
            self.config.load_timeout,
            Box::new(move |snapshot: Snapshot| {
                if let Some(completion) = completion.lock().take() {
                    completion(Ok(snapshot));
                }
            }),
            Some(Box::new(move |error: CoreError| {
                if let Some(completion) = on_cancel.lock().take() {
                    completion(Err(error.into()));
                }
            })),
        );
    }

    fn listener(&self) -> DataListener {
        let view = self.me.clone();
        Arc::new(move |snapshot: Snapshot, event| {
            if let Some(view) = view.upgrade() {
                let _ = view.apply(snapshot, event);
            }
        })
    }

    fn load_all(&self, node: &Node) {
        let view = self.me.clone();
        let on_cancel = self.me.clone();
        let location = node.clone();
        self.database.load(
            node,
            self.config.load_timeout,
            Box::new(move |snapshot: Snapshot| {
                if let Some(view) = view.upgrade() {
                    let _ = view.apply(snapshot, DataEvent::Value);
                }
            }),
            Some(Box::new(move |error: CoreError| {
                warn!(node = %location, %error, "collection load cancelled");
                if let Some(view) = on_cancel.upgrade() {
                    view.feed.emit(Err(error.into()));
                }
            })),
        );
    }

    fn halt_observing(&self) {
        let (node, tokens, controller) = {
            let mut state = self.state.lock();
            if !state.is_observed {
                return;
            }
            state.is_observed = false;
            state.is_synced = false;
            (
                state.node.clone(),
                std::mem::take(&mut state.observers),
                state.controller.clone(),
            )
        };
        if let Some(node) = &node {
            debug!(node = %node, "stopped observing collection");
            for token in tokens {
                self.database.remove_observer(node, token);
            }
        }
        if let Some(controller) = controller {
            controller.stop();
        }
    }

    /// Creates the paging controller of a bound paged view.
    fn install_controller(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.controller.is_some() {
            return;
        }
        let Explorer::Page {
            control,
            page_size,
            ascending,
        } = &state.explorer
        else {
            return;
        };
        let Some(node) = state.node.clone().filter(Node::is_rooted) else {
            return;
        };
        let delegate: Weak<dyn PagingDelegate> = self.me.clone();
        let controller = PagingController::new(
            Arc::clone(&self.database),
            node,
            *page_size,
            *ascending,
            delegate,
        );
        control.attach(&controller);
        state.controller = Some(controller);
    }

    fn bind(&self, node: Option<Node>) {
        self.halt_observing();
        let controller = {
            let mut state = self.state.lock();
            state.node = node;
            state.controller.take()
        };
        if let Some(controller) = controller {
            controller.stop();
        }
        self.install_controller();
    }

    fn restore(&self, elements: Vec<E>) -> Reversion {
        let view = self.me.clone();
        Arc::new(move || {
            if let Some(view) = view.upgrade() {
                view.state.lock().elements.reset(elements.iter().cloned());
                view.feed.emit(Ok(CollectionEvent::Initial));
            }
        })
    }
}

fn decode_children<E: CollectionElement>(snapshot: &Snapshot) -> CollectionResult<Vec<E>> {
    snapshot.children().iter().map(E::decode).collect()
}

fn reposition<E: CollectionElement>(
    elements: &mut SortedArray<E>,
    from: usize,
    item: E,
) -> CollectionEvent {
    let to = elements.reposition(from, item);
    if from == to {
        CollectionEvent::modified(vec![to])
    } else {
        CollectionEvent::moved(vec![(from, to)])
    }
}

fn ensure_detached<E>(state: &ViewState<E>) -> CollectionResult<()> {
    if state.is_rooted() {
        return Err(CollectionError::invalid_operation(
            "elements of a bound collection change through transactions",
        ));
    }
    Ok(())
}

impl<E: CollectionElement> PagingDelegate for SortedCollectionView<E> {
    fn first_key(&self) -> Option<String> {
        self.state.lock().elements.first().map(|e| e.key().to_string())
    }

    fn last_key(&self) -> Option<String> {
        self.state.lock().elements.last().map(|e| e.key().to_string())
    }

    fn did_receive(&self, snapshot: Snapshot, event: DataEvent) {
        let _ = self.apply(snapshot, event);
    }

    fn did_cancel(&self, error: CoreError) {
        self.feed.emit(Err(error.into()));
    }
}

impl<E: CollectionElement> RealtimeValueEvents for SortedCollectionView<E> {
    fn did_save(&self, node: &Node) {
        self.bind(Some(node.clone()));
    }

    fn did_remove(&self) {
        self.bind(None);
    }
}

impl<E: CollectionElement> WritableValue for SortedCollectionView<E> {
    fn node(&self) -> Option<Node> {
        SortedCollectionView::node(self)
    }

    /// Stages every local element under `node` and empties the view.
    ///
    /// The registered reversion puts the elements back.
    fn write(&self, transaction: &Transaction, node: &Node) -> CoreResult<()> {
        let elements = self.elements();
        for element in &elements {
            let key = match element.key() {
                "" => self.database.generate_auto_id(),
                key => key.to_string(),
            };
            transaction.add_value(&node.child(&key), element.encode())?;
        }
        let count = elements.len();
        transaction.add_reversion({
            let restore = self.restore(elements);
            move || restore()
        })?;
        self.state.lock().elements.clear();
        if count > 0 {
            self.feed
                .emit(Ok(CollectionEvent::deleted((0..count).collect())));
        }
        Ok(())
    }

    fn current_reversion(&self) -> Reversion {
        self.restore(self.elements())
    }
}

impl<E: CollectionElement> OrderedRemoteCollection for SortedCollectionView<E> {
    type Element = E;

    fn node(&self) -> Option<Node> {
        SortedCollectionView::node(self)
    }

    fn len(&self) -> usize {
        SortedCollectionView::len(self)
    }

    fn element(&self, index: usize) -> Option<E> {
        SortedCollectionView::element(self, index)
    }

    fn elements(&self) -> Vec<E> {
        SortedCollectionView::elements(self)
    }

    fn is_synced(&self) -> bool {
        SortedCollectionView::is_synced(self)
    }

    fn is_observed(&self) -> bool {
        SortedCollectionView::is_observed(self)
    }

    fn subscribe(&self) -> Receiver<CollectionChange> {
        SortedCollectionView::subscribe(self)
    }

    fn run_observing(&self) -> CollectionResult<()> {
        SortedCollectionView::run_observing(self)
    }

    fn stop_observing(&self) {
        SortedCollectionView::stop_observing(self)
    }
}

impl<E: CollectionElement> Drop for SortedCollectionView<E> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(node) = &state.node {
            for token in state.observers.drain(..) {
                self.database.remove_observer(node, token);
            }
        }
        if let Some(controller) = state.controller.take() {
            controller.stop();
        }
        if let Explorer::Page { control, .. } = &state.explorer {
            control.detach();
        }
    }
}

impl<E: CollectionElement + fmt::Debug> fmt::Debug for SortedCollectionView<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SortedCollectionView")
            .field("node", &state.node)
            .field("explorer", &state.explorer)
            .field("elements", &state.elements.as_slice())
            .field("is_synced", &state.is_synced)
            .field("is_observed", &state.is_observed)
            .finish()
    }
}
