//! A data item whose value and attributes are derived by a stage chain.

use std::fmt;
use std::sync::{Arc, Weak};

use datahive_core::{Attributes, IoDirection, IoDirections, Variant};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tracing::{debug, warn};

use super::item::{ChainItem, WriteAttributeResult, WriteAttributeResults};
use super::items::{InjectChainItem, SumErrorChainItem, INJECT_TAG, SUM_ERROR_TAG};
use super::registry::ChainItemRegistry;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from reconfiguring a chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("unknown chain item type: {0}")]
    UnknownType(String),
    #[error("failed to construct chain item {type_name}: {reason}")]
    Construction { type_name: String, reason: String },
    #[error("no {type_name} chain item bound to exactly [{direction}]")]
    NotFound {
        direction: IoDirection,
        type_name: String,
    },
    #[error("chain item {0} is built in and cannot be removed")]
    BuiltIn(String),
}

/// Errors from writing an item's value.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("item {0} is not writable")]
    NotWritable(String),
    #[error("write handler failed: {0:#}")]
    Handler(anyhow::Error),
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// A stage together with the directions it runs in.
#[derive(Clone)]
pub struct ChainProcessEntry {
    pub stage: Arc<dyn ChainItem>,
    pub directions: IoDirections,
}

impl fmt::Debug for ChainProcessEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.stage.type_name(), self.directions)
    }
}

/// Observer of an item's published state.
pub trait ItemListener: Send + Sync {
    /// `value` is `Some` only if it changed. `attributes` holds the changed
    /// keys; removed keys map to [`Variant::Null`].
    fn data_changed(&self, item_id: &str, value: Option<&Variant>, attributes: &Attributes);
}

/// Receives values that passed the output chain.
pub trait WriteHandler: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the value could not be written downstream.
    fn handle_write(&self, value: &Variant) -> anyhow::Result<()>;
}

enum WriteMode {
    ReadOnly,
    Handler(Arc<dyn WriteHandler>),
    /// Written values become the item's input.
    Memory,
}

#[derive(Default)]
struct ItemState {
    input: Variant,
    primary_attributes: Attributes,
    value: Variant,
    attributes: Attributes,
    /// Generation handed to the most recently started input pass.
    started: u64,
    /// Generation of the pass whose result is currently published.
    published: u64,
}

// ---------------------------------------------------------------------------
// ChainedItem
// ---------------------------------------------------------------------------

/// One data item with an ordered chain of processing stages.
///
/// The input pass runs whenever the upstream value, the primary attributes,
/// or the chain itself change. Stages run on a snapshot of the chain, so they
/// and their binders may reconfigure the item while a pass is in progress.
pub struct ChainedItem {
    id: String,
    registry: Arc<ChainItemRegistry>,
    write_mode: WriteMode,
    chain: RwLock<Vec<ChainProcessEntry>>,
    state: Mutex<ItemState>,
    /// Orders publish + notification; reentrant so listeners may update the item.
    publish_lock: ReentrantMutex<()>,
    listeners: RwLock<Vec<Arc<dyn ItemListener>>>,
}

impl ChainedItem {
    /// Creates an item whose writes go to `write_handler`, or a read-only
    /// item if there is none.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        registry: Arc<ChainItemRegistry>,
        write_handler: Option<Arc<dyn WriteHandler>>,
    ) -> Arc<Self> {
        let mode = match write_handler {
            Some(handler) => WriteMode::Handler(handler),
            None => WriteMode::ReadOnly,
        };
        Self::build(id.into(), registry, mode, Vec::new())
    }

    /// Creates a memory item: writes loop back into the input, unknown
    /// attribute writes are stored, and a `sum-error` stage follows the
    /// built-in one.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Construction`] if the `sum-error` stage cannot
    /// be built.
    pub fn memory(
        id: impl Into<String>,
        registry: Arc<ChainItemRegistry>,
    ) -> Result<Arc<Self>, ChainError> {
        let sum_error = SumErrorChainItem::new().map_err(|err| ChainError::Construction {
            type_name: SUM_ERROR_TAG.to_string(),
            reason: format!("{err:#}"),
        })?;
        let extra = vec![ChainProcessEntry {
            stage: Arc::new(sum_error),
            directions: IoDirection::Input.into(),
        }];
        Ok(Self::build(id.into(), registry, WriteMode::Memory, extra))
    }

    fn build(
        id: String,
        registry: Arc<ChainItemRegistry>,
        write_mode: WriteMode,
        extra: Vec<ChainProcessEntry>,
    ) -> Arc<Self> {
        let item = Arc::new_cyclic(|weak: &Weak<Self>| {
            let mut chain = vec![ChainProcessEntry {
                stage: Arc::new(InjectChainItem::new(weak)),
                directions: IoDirection::Input.into(),
            }];
            chain.extend(extra);
            Self {
                id,
                registry,
                write_mode,
                chain: RwLock::new(chain),
                state: Mutex::new(ItemState::default()),
                publish_lock: ReentrantMutex::new(()),
                listeners: RwLock::new(Vec::new()),
            }
        });
        item.run_input_pass();
        item
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        !matches!(self.write_mode, WriteMode::ReadOnly)
    }

    // -- chain composition --------------------------------------------------

    /// Appends `stage` for `directions` and re-runs the input pass.
    pub fn add_chain_element(&self, directions: IoDirections, stage: Arc<dyn ChainItem>) {
        debug!(item = %self.id, stage = stage.type_name(), %directions, "adding chain element");
        self.chain.write().push(ChainProcessEntry { stage, directions });
        self.run_input_pass();
    }

    /// Builds the stage registered under `type_name` and appends it.
    ///
    /// # Errors
    ///
    /// - [`ChainError::UnknownType`] if the tag is not registered.
    /// - [`ChainError::Construction`] if the factory fails.
    pub fn add_chain_element_by_type(
        &self,
        directions: IoDirections,
        type_name: &str,
    ) -> Result<(), ChainError> {
        let stage = self.registry.create(type_name)?;
        self.add_chain_element(directions, stage);
        Ok(())
    }

    /// Removes the first `type_name` stage bound to exactly `{direction}`.
    ///
    /// A stage bound to both directions is not removable through a single
    /// direction.
    ///
    /// # Errors
    ///
    /// - [`ChainError::BuiltIn`] for the built-in inject stage.
    /// - [`ChainError::NotFound`] if no entry matches.
    pub fn remove_chain_element(&self, direction: IoDirection, type_name: &str) -> Result<(), ChainError> {
        if type_name == INJECT_TAG {
            return Err(ChainError::BuiltIn(type_name.to_string()));
        }
        {
            let mut chain = self.chain.write();
            let wanted = IoDirections::only(direction);
            let position = chain
                .iter()
                .position(|entry| entry.stage.type_name() == type_name && entry.directions == wanted)
                .ok_or_else(|| ChainError::NotFound {
                    direction,
                    type_name: type_name.to_string(),
                })?;
            chain.remove(position);
        }
        debug!(item = %self.id, stage = type_name, %direction, "removed chain element");
        self.run_input_pass();
        Ok(())
    }

    /// Snapshot of the chain in order.
    #[must_use]
    pub fn chain_copy(&self) -> Vec<ChainProcessEntry> {
        self.chain.read().clone()
    }

    fn entries_for(&self, direction: IoDirection) -> Vec<ChainProcessEntry> {
        self.chain
            .read()
            .iter()
            .filter(|entry| entry.directions.contains(direction))
            .cloned()
            .collect()
    }

    // -- upstream state -------------------------------------------------------

    /// Sets the upstream value and re-runs the input pass.
    pub fn update_input(&self, value: Variant) {
        self.state.lock().input = value;
        self.run_input_pass();
    }

    /// Merges `changes` into the upstream attributes (a `Null` value removes
    /// the key) and re-runs the input pass.
    pub fn update_primary_attributes(&self, changes: Attributes) {
        {
            let mut state = self.state.lock();
            merge(&mut state.primary_attributes, changes);
        }
        self.run_input_pass();
    }

    // -- writes ---------------------------------------------------------------

    /// Runs `value` through the output chain and hands the result on.
    ///
    /// # Errors
    ///
    /// - [`WriteError::NotWritable`] for read-only items.
    /// - [`WriteError::Handler`] if the write handler fails.
    pub fn write_value(&self, value: Variant) -> Result<(), WriteError> {
        if !self.is_writable() {
            return Err(WriteError::NotWritable(self.id.clone()));
        }
        let (value, _) = self.run_pass(IoDirection::Output, value, Attributes::new());
        match &self.write_mode {
            WriteMode::Handler(handler) => handler.handle_write(&value).map_err(WriteError::Handler),
            WriteMode::Memory => {
                self.update_input(value);
                Ok(())
            }
            WriteMode::ReadOnly => Err(WriteError::NotWritable(self.id.clone())),
        }
    }

    /// Offers an attribute write to every stage, then re-runs the input pass.
    ///
    /// Keys no stage accepts are stored by memory items and reported
    /// [`WriteAttributeResult::NotHandled`] otherwise.
    pub fn set_attributes(&self, attributes: &Attributes) -> WriteAttributeResults {
        let mut results = WriteAttributeResults::new();
        for entry in self.chain_copy() {
            for (key, result) in entry.stage.set_attributes(attributes) {
                if !matches!(results.get(&key), Some(WriteAttributeResult::Ok)) {
                    results.insert(key, result);
                }
            }
        }

        let mut stored = Attributes::new();
        for (key, value) in attributes {
            if results.contains_key(key) {
                continue;
            }
            if matches!(self.write_mode, WriteMode::Memory) {
                stored.insert(key.clone(), value.clone());
                results.insert(key.clone(), WriteAttributeResult::Ok);
            } else {
                results.insert(key.clone(), WriteAttributeResult::NotHandled);
            }
        }
        if !stored.is_empty() {
            merge(&mut self.state.lock().primary_attributes, stored);
        }

        self.run_input_pass();
        results
    }

    // -- published state ------------------------------------------------------

    #[must_use]
    pub fn value(&self) -> Variant {
        self.state.lock().value.clone()
    }

    #[must_use]
    pub fn attributes(&self) -> Attributes {
        self.state.lock().attributes.clone()
    }

    /// Registers `listener` and immediately sends it the current state.
    pub fn add_listener(&self, listener: Arc<dyn ItemListener>) {
        let _order = self.publish_lock.lock();
        self.listeners.write().push(Arc::clone(&listener));
        let (value, attributes) = {
            let state = self.state.lock();
            (state.value.clone(), state.attributes.clone())
        };
        listener.data_changed(&self.id, Some(&value), &attributes);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ItemListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    // -- passes ---------------------------------------------------------------

    fn run_pass(
        &self,
        direction: IoDirection,
        mut value: Variant,
        mut attributes: Attributes,
    ) -> (Variant, Attributes) {
        for entry in self.entries_for(direction) {
            let tag = entry.stage.type_name();
            match entry.stage.process(&value, &mut attributes) {
                Ok(Some(next)) => value = next,
                Ok(None) => {}
                Err(err) => {
                    warn!(item = %self.id, stage = tag, %direction, error = %format!("{err:#}"), "chain stage failed");
                    attributes.insert(format!("{tag}.error"), Variant::Bool(true));
                    attributes.insert(format!("{tag}.error.message"), Variant::String(format!("{err:#}")));
                }
            }
        }
        (value, attributes)
    }

    fn run_input_pass(&self) {
        let (generation, input, primary) = {
            let mut state = self.state.lock();
            state.started += 1;
            (state.started, state.input.clone(), state.primary_attributes.clone())
        };
        let (value, attributes) = self.run_pass(IoDirection::Input, input, primary);
        self.publish(generation, value, attributes);
    }

    /// Publishes the result of pass `generation` unless a newer pass already
    /// published.
    fn publish(&self, generation: u64, value: Variant, attributes: Attributes) {
        let _order = self.publish_lock.lock();
        let (value_changed, diff) = {
            let mut state = self.state.lock();
            if generation < state.published {
                debug!(item = %self.id, generation, published = state.published, "dropping stale pass result");
                return;
            }
            state.published = generation;
            let value_changed = state.value != value;
            let diff = attribute_diff(&state.attributes, &attributes);
            state.value = value.clone();
            state.attributes = attributes;
            (value_changed, diff)
        };
        if !value_changed && diff.is_empty() {
            return;
        }

        let listeners = self.listeners.read().clone();
        let changed_value = value_changed.then_some(&value);
        for listener in &listeners {
            listener.data_changed(&self.id, changed_value, &diff);
        }
    }
}

impl fmt::Debug for ChainedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainedItem")
            .field("id", &self.id)
            .field("chain", &*self.chain.read())
            .finish_non_exhaustive()
    }
}

fn merge(target: &mut Attributes, changes: Attributes) {
    for (key, value) in changes {
        if value.is_null() {
            target.remove(&key);
        } else {
            target.insert(key, value);
        }
    }
}

/// Keys whose value changed from `old` to `new`; removed keys map to `Null`.
fn attribute_diff(old: &Attributes, new: &Attributes) -> Attributes {
    let mut diff: Attributes = new
        .iter()
        .filter(|(key, value)| old.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    for key in old.keys() {
        if !new.contains_key(key) {
            diff.insert(key.clone(), Variant::Null);
        }
    }
    diff
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
