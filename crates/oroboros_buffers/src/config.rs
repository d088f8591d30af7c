//! # Buffer Manager Configuration
//!
//! Loaded once at startup, usually from a TOML file:
//!
//! ```toml
//! label_prefix = "oroboros"
//! reserve_index_groups = true
//!
//! [[reserved_vertex_groups]]
//! layout = "position_normal_uv"
//! dynamic = false
//!
//! [[reserved_vertex_groups]]
//! layout = "skinned"
//! dynamic = true
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BufferError, BufferResult};
use crate::layout::VertexLayout;

/// A vertex group created empty at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservedVertexGroup {
    /// Vertex layout.
    pub layout: VertexLayout,
    /// Writable buffer.
    #[serde(default)]
    pub dynamic: bool,
}

/// Configuration of a [`BufferManager`](crate::BufferManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferManagerConfig {
    /// Prefix of every buffer label handed to the backend.
    pub label_prefix: String,
    /// Vertex groups reserved in slot order before any add.
    pub reserved_vertex_groups: Vec<ReservedVertexGroup>,
    /// Reserve index slot 0 (static) and slot 1 (dynamic).
    pub reserve_index_groups: bool,
}

impl Default for BufferManagerConfig {
    fn default() -> Self {
        Self {
            label_prefix: "oroboros".to_owned(),
            reserved_vertex_groups: Vec::new(),
            reserve_index_groups: true,
        }
    }
}

impl BufferManagerConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::InvalidConfig`] on parse or validation failure.
    pub fn from_toml_str(source: &str) -> BufferResult<Self> {
        let config: Self = toml::from_str(source).map_err(|e| BufferError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::Io`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> BufferResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| BufferError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// Rejects an empty label prefix and duplicate reserved groups.
    pub fn validate(&self) -> BufferResult<()> {
        if self.label_prefix.is_empty() {
            return Err(BufferError::InvalidConfig("label_prefix must not be empty".into()));
        }
        for (i, group) in self.reserved_vertex_groups.iter().enumerate() {
            if self.reserved_vertex_groups[..i].contains(group) {
                return Err(BufferError::InvalidConfig(format!(
                    "vertex group ({}, dynamic={}) reserved twice",
                    group.layout, group.dynamic
                )));
            }
        }
        Ok(())
    }
}
