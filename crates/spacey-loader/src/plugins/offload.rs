// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Translation on the worker pool

use tracing::trace;

use crate::error::{LoaderError, Result};
use crate::loader::Loader;
use crate::plugins::ts;
use crate::worker::{WorkerRequest, WorkerResponse, WorkerTask};

/// Worker task translating the formats that have a pure translator
#[derive(Debug, Default)]
pub struct TranslateTask;

impl WorkerTask for TranslateTask {
    fn handle(&self, request: WorkerRequest) -> WorkerResponse {
        match request {
            WorkerRequest::Translate {
                address,
                format,
                source,
            } => match translate_pure(&format, &source) {
                Some((source, format)) => WorkerResponse::Translated { source, format },
                None => WorkerResponse::Failed {
                    message: format!("no worker translator for '{}' ({})", format, address),
                },
            },
        }
    }
}

/// Stateless translators, keyed by format plugin name
pub fn translate_pure(format: &str, source: &str) -> Option<(String, String)> {
    match format {
        "ts" => Some(ts::translate_source(source)),
        _ => None,
    }
}

/// Translate on the loader's pool when it has one, inline otherwise
pub async fn translate(
    loader: &Loader,
    address: &str,
    format: &str,
    source: String,
) -> Result<(String, String)> {
    let Some(pool) = loader.workers() else {
        return translate_pure(format, &source).ok_or_else(|| {
            LoaderError::translation(address, format, "no translator for this format")
        });
    };

    trace!("offloading translation of {}", address);
    let response = pool
        .call(WorkerRequest::Translate {
            address: address.to_string(),
            format: format.to_string(),
            source,
        })
        .await?;

    match response {
        WorkerResponse::Translated { source, format } => Ok((source, format)),
        WorkerResponse::Failed { message } => {
            Err(LoaderError::translation(address, format, message))
        }
    }
}
