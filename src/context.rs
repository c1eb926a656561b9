//! A linear chat history plus the toolset it should be generated against,
//! with optional JSONL-backed persistence.

use crate::model::{Message, Tool};
use crate::step;
use crate::tooling::Toolset;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// A history of messages kept entirely in memory. [`LinearContext::history`]
/// reads a full in-memory copy, never touching disk.
pub trait LinearStorage: Send + Sync {
    fn list_messages(&self) -> Vec<Message>;
    fn append_message(&self, message: Message);
}

#[derive(Default)]
pub struct MemoryLinearStorage {
    messages: Mutex<Vec<Message>>,
}

impl MemoryLinearStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LinearStorage for MemoryLinearStorage {
    fn list_messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    fn append_message(&self, message: Message) {
        self.messages.lock().unwrap().push(message);
    }
}

/// Error restoring or appending to a [`JsonlLinearStorage`].
#[derive(Debug, thiserror::Error)]
pub enum JsonlStorageError {
    #[error("storage already has {0} message(s); restore must run before any append")]
    AlreadyModified(usize),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed JSONL at line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// A linear storage backed by a JSONL file: one `Message` object per line,
/// appended as messages arrive. Restoring into a non-empty storage is
/// rejected, mirroring the "already modified" guard on the Python original.
pub struct JsonlLinearStorage {
    path: PathBuf,
    messages: Mutex<Vec<Message>>,
    file: Mutex<Option<std::fs::File>>,
}

impl JsonlLinearStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            messages: Mutex::new(Vec::new()),
            file: Mutex::new(None),
        }
    }

    /// Load every message already on disk. Must be called, if at all, before
    /// any message has been appended.
    pub fn restore(&self) -> Result<(), JsonlStorageError> {
        {
            let messages = self.messages.lock().unwrap();
            if !messages.is_empty() {
                return Err(JsonlStorageError::AlreadyModified(messages.len()));
            }
        }
        if !self.path.exists() {
            return Ok(());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        let mut restored = Vec::new();
        for (i, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let message: Message = serde_json::from_str(line)
                .map_err(|source| JsonlStorageError::Parse { line: i + 1, source })?;
            restored.push(message);
        }
        *self.messages.lock().unwrap() = restored;
        Ok(())
    }

    fn open_file(&self) -> std::io::Result<()> {
        let mut guard = self.file.lock().unwrap();
        if guard.is_none() {
            *guard = Some(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?,
            );
        }
        Ok(())
    }
}

impl LinearStorage for JsonlLinearStorage {
    fn list_messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    fn append_message(&self, message: Message) {
        self.messages.lock().unwrap().push(message.clone());
        if self.open_file().is_err() {
            return;
        }
        let mut guard = self.file.lock().unwrap();
        if let Some(file) = guard.as_mut() {
            if let Ok(line) = serde_json::to_string(&message) {
                let _ = writeln!(file, "{}", line);
            }
        }
    }
}

/// The system prompt, toolset, and message history of an ongoing chat, ready
/// to drive [`crate::step::step`].
pub struct LinearContext<S: LinearStorage> {
    system_prompt: String,
    toolset: Arc<dyn Toolset>,
    storage: S,
}

impl<S: LinearStorage> LinearContext<S> {
    pub fn new(system_prompt: impl Into<String>, toolset: Arc<dyn Toolset>, storage: S) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            toolset,
            storage,
        }
    }

    pub fn toolset(&self) -> &Arc<dyn Toolset> {
        &self.toolset
    }

    pub fn add_message(&self, message: Message) {
        self.storage.append_message(message);
    }
}

impl<S: LinearStorage> step::Context for LinearContext<S> {
    fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    fn tools(&self) -> Vec<Tool> {
        self.toolset.tools()
    }

    fn history(&self) -> Vec<Message> {
        self.storage.list_messages()
    }
}
