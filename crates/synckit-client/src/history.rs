//! Per-document undo/redo history.
//!
//! Collaborative undo cannot rewind shared state, so every undo and redo
//! issues a fresh local operation that inverts the recorded mutation at
//! the current state. Inverses are captured as intents (field/value,
//! index/text, delta, element) from the view observed just before the
//! original mutation, which keeps them applicable after remote changes;
//! under heavy concurrent editing the positional intents are best-effort,
//! the same trade every index-addressed undo stack makes.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use synckit_crdt::{DocumentView, Operation};

use crate::document::Document;
use crate::error::Result;

/// One invertible intent, applied through the document facade.
#[derive(Debug, Clone, PartialEq)]
pub enum UndoStep {
    /// Restore a map field (`None` restores absence).
    SetField {
        /// Target field.
        field: String,
        /// Value to restore; `None` deletes.
        value: Option<Value>,
    },
    /// Re-insert text at a visible index.
    InsertText {
        /// Insertion index.
        index: usize,
        /// Characters to restore.
        text: String,
    },
    /// Remove text at a visible index.
    DeleteText {
        /// Start index.
        start: usize,
        /// Character count.
        length: usize,
    },
    /// Apply a counter delta.
    CounterAdd {
        /// Signed delta.
        delta: i64,
    },
    /// Restore an element to a set document.
    AddElement {
        /// Element to restore.
        element: Value,
    },
    /// Remove an element from a set document.
    RemoveElement {
        /// Element to remove.
        element: Value,
    },
}

impl UndoStep {
    /// Compact description used for cross-tab stack digests.
    pub fn shape(&self) -> Value {
        match self {
            UndoStep::SetField { field, value } => {
                json!({ "step": "set-field", "field": field, "restores": value.is_some() })
            }
            UndoStep::InsertText { index, text } => {
                json!({ "step": "insert-text", "index": index, "len": text.chars().count() })
            }
            UndoStep::DeleteText { start, length } => {
                json!({ "step": "delete-text", "start": start, "len": length })
            }
            UndoStep::CounterAdd { delta } => json!({ "step": "counter-add", "delta": delta }),
            UndoStep::AddElement { .. } => json!({ "step": "add-element" }),
            UndoStep::RemoveElement { .. } => json!({ "step": "remove-element" }),
        }
    }
}

/// A recorded mutation: the steps that invert it.
#[derive(Debug, Clone, PartialEq)]
pub struct UndoEntry {
    steps: Vec<UndoStep>,
}

/// Undo/redo stacks over one document facade.
///
/// Route mutations through this manager instead of the facade to record
/// them; mutations applied directly to the facade (or arriving from
/// other replicas) are simply not undoable here.
pub struct UndoManager {
    document: Arc<Document>,
    undo: Mutex<VecDeque<UndoEntry>>,
    redo: Mutex<VecDeque<UndoEntry>>,
    limit: usize,
}

impl std::fmt::Debug for UndoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoManager")
            .field("document", &self.document.id())
            .field("undo_depth", &self.undo_depth())
            .field("redo_depth", &self.redo_depth())
            .finish()
    }
}

const DEFAULT_LIMIT: usize = 100;

impl UndoManager {
    /// Create an undo manager over a document with the default depth
    /// limit.
    pub fn new(document: Arc<Document>) -> Self {
        Self::with_limit(document, DEFAULT_LIMIT)
    }

    /// Create an undo manager with an explicit depth limit; the oldest
    /// entry falls off when the limit is exceeded.
    pub fn with_limit(document: Arc<Document>, limit: usize) -> Self {
        Self {
            document,
            undo: Mutex::new(VecDeque::new()),
            redo: Mutex::new(VecDeque::new()),
            limit: limit.max(1),
        }
    }

    /// The wrapped document.
    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    /// Entries available to undo.
    pub fn undo_depth(&self) -> usize {
        self.undo.lock().len()
    }

    /// Entries available to redo.
    pub fn redo_depth(&self) -> usize {
        self.redo.lock().len()
    }

    /// Stack shapes for divergence digests: one summary value per entry,
    /// oldest first.
    pub fn stack_shapes(&self) -> (Vec<Value>, Vec<Value>) {
        let shape = |stack: &VecDeque<UndoEntry>| {
            stack
                .iter()
                .map(|entry| Value::Array(entry.steps.iter().map(UndoStep::shape).collect()))
                .collect()
        };
        (shape(&self.undo.lock()), shape(&self.redo.lock()))
    }

    /// Drop both stacks.
    pub fn clear(&self) {
        self.undo.lock().clear();
        self.redo.lock().clear();
    }

    // ---- recorded mutations ----

    /// Write a map field, recording the previous value.
    pub async fn set(&self, field: impl Into<String>, value: Value) -> Result<Operation> {
        let field = field.into();
        let inverse = self.field_restore(&field);
        let op = self.document.set(field, value).await?;
        self.record(vec![inverse]);
        Ok(op)
    }

    /// Tombstone a map field, recording the previous value.
    pub async fn delete(&self, field: impl Into<String>) -> Result<Operation> {
        let field = field.into();
        let inverse = self.field_restore(&field);
        let op = self.document.delete(field).await?;
        self.record(vec![inverse]);
        Ok(op)
    }

    /// Insert a character, recording its removal.
    pub async fn insert(&self, index: usize, character: char) -> Result<Operation> {
        let op = self.document.insert(index, character).await?;
        self.record(vec![UndoStep::DeleteText {
            start: index,
            length: 1,
        }]);
        Ok(op)
    }

    /// Delete a text range, recording the removed characters.
    pub async fn delete_range(&self, start: usize, length: usize) -> Result<Operation> {
        let removed: String = match self.document.get() {
            DocumentView::Text(text) => text.chars().skip(start).take(length).collect(),
            _ => String::new(),
        };
        let op = self.document.delete_range(start, length).await?;
        self.record(vec![UndoStep::InsertText {
            index: start,
            text: removed,
        }]);
        Ok(op)
    }

    /// Increment a counter, recording the opposite delta.
    pub async fn increment(&self, delta: u64) -> Result<Operation> {
        let op = self.document.increment(delta).await?;
        self.record(vec![UndoStep::CounterAdd {
            delta: -(delta as i64),
        }]);
        Ok(op)
    }

    /// Decrement a counter, recording the opposite delta.
    pub async fn decrement(&self, delta: u64) -> Result<Operation> {
        let op = self.document.decrement(delta).await?;
        self.record(vec![UndoStep::CounterAdd {
            delta: delta as i64,
        }]);
        Ok(op)
    }

    /// Add a set element, recording its removal. Undoing the add removes
    /// every live tag for the element, so re-adding an element that was
    /// already present undoes to absent.
    pub async fn add(&self, element: Value) -> Result<Operation> {
        let op = self.document.add(element.clone()).await?;
        self.record(vec![UndoStep::RemoveElement { element }]);
        Ok(op)
    }

    /// Remove a set element, recording its restoration.
    pub async fn remove(&self, element: Value) -> Result<Operation> {
        let op = self.document.remove(element.clone()).await?;
        self.record(vec![UndoStep::AddElement { element }]);
        Ok(op)
    }

    // ---- undo / redo ----

    /// Invert the most recent recorded mutation as a fresh local
    /// operation; the undone entry becomes redoable.
    pub async fn undo(&self) -> Result<Vec<Operation>> {
        let Some(entry) = self.undo.lock().pop_back() else {
            return Ok(Vec::new());
        };
        let (ops, redo_entry) = self.apply_steps(&entry.steps).await?;
        self.redo.lock().push_back(redo_entry);
        Ok(ops)
    }

    /// Re-apply the most recently undone mutation.
    pub async fn redo(&self) -> Result<Vec<Operation>> {
        let Some(entry) = self.redo.lock().pop_back() else {
            return Ok(Vec::new());
        };
        let (ops, undo_entry) = self.apply_steps(&entry.steps).await?;
        let mut undo = self.undo.lock();
        undo.push_back(undo_entry);
        if undo.len() > self.limit {
            undo.pop_front();
        }
        Ok(ops)
    }

    fn record(&self, steps: Vec<UndoStep>) {
        let mut undo = self.undo.lock();
        undo.push_back(UndoEntry { steps });
        if undo.len() > self.limit {
            undo.pop_front();
        }
        // a new mutation orphans the redo branch
        self.redo.lock().clear();
    }

    fn field_restore(&self, field: &str) -> UndoStep {
        let previous = match self.document.get() {
            DocumentView::Map(map) => map.get(field).cloned(),
            _ => None,
        };
        UndoStep::SetField {
            field: field.to_string(),
            value: previous,
        }
    }

    /// Apply inversion steps, capturing their own inverses against the
    /// state observed just before each step.
    async fn apply_steps(&self, steps: &[UndoStep]) -> Result<(Vec<Operation>, UndoEntry)> {
        let mut ops = Vec::with_capacity(steps.len());
        let mut inverses = Vec::with_capacity(steps.len());

        for step in steps {
            match step {
                UndoStep::SetField { field, value } => {
                    inverses.push(self.field_restore(field));
                    let op = match value {
                        Some(value) => self.document.set(field.clone(), value.clone()).await?,
                        None => self.document.delete(field.clone()).await?,
                    };
                    ops.push(op);
                }
                UndoStep::InsertText { index, text } => {
                    inverses.push(UndoStep::DeleteText {
                        start: *index,
                        length: text.chars().count(),
                    });
                    for (offset, character) in text.chars().enumerate() {
                        ops.push(self.document.insert(index + offset, character).await?);
                    }
                }
                UndoStep::DeleteText { start, length } => {
                    let removed: String = match self.document.get() {
                        DocumentView::Text(text) => {
                            text.chars().skip(*start).take(*length).collect()
                        }
                        _ => String::new(),
                    };
                    inverses.push(UndoStep::InsertText {
                        index: *start,
                        text: removed,
                    });
                    ops.push(self.document.delete_range(*start, *length).await?);
                }
                UndoStep::CounterAdd { delta } => {
                    inverses.push(UndoStep::CounterAdd { delta: -delta });
                    let magnitude = delta.unsigned_abs();
                    let op = if *delta >= 0 {
                        self.document.increment(magnitude).await?
                    } else {
                        self.document.decrement(magnitude).await?
                    };
                    ops.push(op);
                }
                UndoStep::AddElement { element } => {
                    inverses.push(UndoStep::RemoveElement {
                        element: element.clone(),
                    });
                    ops.push(self.document.add(element.clone()).await?);
                }
                UndoStep::RemoveElement { element } => {
                    inverses.push(UndoStep::AddElement {
                        element: element.clone(),
                    });
                    ops.push(self.document.remove(element.clone()).await?);
                }
            }
        }

        Ok((ops, UndoEntry { steps: inverses }))
    }
}
