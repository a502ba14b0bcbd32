// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Error types for the module loader

use std::sync::Arc;
use thiserror::Error;

/// Result type for loader operations
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Errors that can occur while loading or bundling modules
///
/// Errors are cheap to clone: a failed record keeps its error and hands a
/// copy to every importer waiting on it.
#[derive(Debug, Clone, Error)]
pub enum LoaderError {
    /// Specifier could not be mapped to an address
    #[error("Cannot resolve '{specifier}' from {base}: {reason}")]
    Resolution {
        /// Requested specifier
        specifier: String,
        /// Referring address
        base: String,
        /// Reason for failure
        reason: String,
    },

    /// Source could not be retrieved
    #[error("Failed to fetch {address}: {reason}")]
    Fetch {
        /// Requested address
        address: String,
        /// HTTP status, if there was a response
        status: Option<u16>,
        /// Reason for failure
        reason: String,
    },

    /// A format plugin failed during analyze or translate
    #[error("Error translating {address} ({format}): {message}")]
    Translation {
        /// Record address
        address: String,
        /// Format being processed
        format: String,
        /// Plugin message
        message: String,
    },

    /// The module factory failed
    #[error("Error instantiating {address}: {message}")]
    Instantiation {
        /// Record address
        address: String,
        /// Factory message
        message: String,
    },

    /// Format kept changing during analyze
    #[error("Format of {address} changed {count} times during analyze (last: {format})")]
    FormatRedirectLoop {
        /// Record address
        address: String,
        /// Number of redirects seen
        count: usize,
        /// Format at the time the loop was cut
        format: String,
    },

    /// Context wrapper added at each import hop
    #[error("{source}\n    importing '{specifier}' from {importer}")]
    Import {
        /// Specifier being imported
        specifier: String,
        /// Address of the importing record
        importer: String,
        /// Underlying failure
        source: Arc<LoaderError>,
    },

    /// Unknown plugin name
    #[error("Unknown plugin '{0}'")]
    Plugin(String),

    /// Malformed or unsupported bundle
    #[error("Bundle error: {0}")]
    Bundle(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Worker pool failure
    #[error("Worker error: {0}")]
    Worker(String),

    /// File system error
    #[error("File system error: {0}")]
    Io(Arc<std::io::Error>),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),
}

impl LoaderError {
    /// Create a resolution error
    pub fn resolution(
        specifier: impl Into<String>,
        base: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Resolution {
            specifier: specifier.into(),
            base: base.into(),
            reason: reason.into(),
        }
    }

    /// Create a fetch error without a response
    pub fn fetch(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fetch {
            address: address.into(),
            status: None,
            reason: reason.into(),
        }
    }

    /// Create a translation error
    pub fn translation(
        address: impl Into<String>,
        format: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Translation {
            address: address.into(),
            format: format.into(),
            message: message.into(),
        }
    }

    /// Create an instantiation error
    pub fn instantiation(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Instantiation {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Wrap this error with "importing `specifier` from `importer`"
    pub fn importing(self, specifier: impl Into<String>, importer: impl Into<String>) -> Self {
        Self::Import {
            specifier: specifier.into(),
            importer: importer.into(),
            source: Arc::new(self),
        }
    }

    /// The innermost error, with all import context removed
    pub fn root_cause(&self) -> &LoaderError {
        let mut current = self;
        while let Self::Import { source, .. } = current {
            current = source;
        }
        current
    }

    /// Iterate over this error and its causes, outermost first
    pub fn chain(&self) -> impl Iterator<Item = &LoaderError> {
        let mut next = Some(self);
        std::iter::from_fn(move || {
            let current = next?;
            next = match current {
                Self::Import { source, .. } => Some(source.as_ref()),
                _ => None,
            };
            Some(current)
        })
    }

    /// Import hops recorded on this error, innermost first
    pub fn import_path(&self) -> Vec<(&str, &str)> {
        let mut hops: Vec<(&str, &str)> = self
            .chain()
            .filter_map(|err| match err {
                Self::Import {
                    specifier,
                    importer,
                    ..
                } => Some((specifier.as_str(), importer.as_str())),
                _ => None,
            })
            .collect();
        hops.reverse();
        hops
    }
}

impl From<std::io::Error> for LoaderError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for LoaderError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}

impl From<url::ParseError> for LoaderError {
    fn from(err: url::ParseError) -> Self {
        Self::Config(format!("invalid address: {}", err))
    }
}
