// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::io::{self, Read};
use std::process::ExitCode;
use std::{env, fs};

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use xray_tracer::{Segment, SendReport, Tracer, TracerConfig};

/// Reads segment documents from a file, or stdin when `path` is `None` or
/// `-`. Accepts a single document or an array of documents.
fn read_documents(path: Option<&str>) -> Result<Vec<Segment>, String> {
    let raw = match path {
        Some(path) if path != "-" => {
            fs::read_to_string(path).map_err(|e| format!("Unable to read {path}: {e}"))?
        }
        _ => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| format!("Unable to read stdin: {e}"))?;
            buf
        }
    };
    parse_documents(&raw)
}

fn parse_documents(raw: &str) -> Result<Vec<Segment>, String> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| format!("Invalid segment JSON: {e}"))?;
    let documents = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };
    documents
        .into_iter()
        .map(|doc| serde_json::from_value(doc).map_err(|e| format!("Invalid segment: {e}")))
        .collect()
}

fn send_documents(tracer: &Tracer, documents: Vec<Segment>) -> SendReport {
    let mut report = SendReport::default();
    for document in documents {
        let trace_id = document.trace_id.clone();
        report.merge(tracer.send(document, &trace_id));
    }
    report
}

pub fn main() -> ExitCode {
    let config = match TracerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading X-Ray configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .with_writer(io::stderr)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let path = env::args().nth(1);
    let documents = match read_documents(path.as_deref()) {
        Ok(documents) => documents,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let endpoint = config.daemon_endpoint();
    let tracer = match Tracer::new(config) {
        Ok(tracer) => tracer,
        Err(e) => {
            error!("Error creating tracer: {e}");
            return ExitCode::FAILURE;
        }
    };

    let count = documents.len();
    let report = send_documents(&tracer, documents);
    info!(
        "Sent {} datagrams ({} bytes) for {} documents to {}, {} failed",
        report.sent, report.bytes, count, endpoint, report.failed
    );

    if report.failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
