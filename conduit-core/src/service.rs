// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Single-instance relay service.
//!
//! This is what every worker runs. It drives one relay engine and prints the
//! liveness and `[STATS]` lines the multi-instance parent scrapes.

use std::time::Instant;

use chrono::Local;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::engine::{EngineBundle, RelayEngine};
use crate::error::ConduitResult;
use crate::notice::{liveness_line, Notice, NoticeAction, NoticeHandler, RelayStats};
use crate::persist::StatsWriter;

const NOTICE_QUEUE_DEPTH: usize = 256;

pub struct RelayService {
    config: Config,
}

impl RelayService {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the engine until it exits or `cancel` fires.
    ///
    /// Returns the final counters.
    pub async fn run<E>(self, engine: &E, cancel: CancellationToken) -> ConduitResult<RelayStats>
    where
        E: RelayEngine + ?Sized,
    {
        println!(
            "Starting Psiphon Conduit (Max Clients: {}, Bandwidth: {})",
            self.config.max_clients, self.config.bandwidth
        );

        let bundle = EngineBundle::build(&self.config);
        let writer = self.config.stats_file.clone().map(StatsWriter::spawn);
        let started = Instant::now();
        let mut handler = NoticeHandler::new(self.config.verbosity);
        let (tx, mut rx) = mpsc::channel(NOTICE_QUEUE_DEPTH);

        let engine_run = engine.run(bundle, tx, cancel);
        let relay = async {
            while let Some(line) = rx.recv().await {
                let Some(notice) = Notice::parse(&line) else {
                    if self.config.verbosity >= 2 {
                        println!("[DEBUG] {}", line);
                    }
                    continue;
                };
                match handler.handle(&notice) {
                    NoticeAction::CountsChanged => {
                        let now = Local::now();
                        let stats = handler.stats();
                        println!("{}", stats.stats_line(now, started.elapsed()));
                        if let Some(writer) = &writer {
                            writer.submit(&stats.document(now, started.elapsed()));
                        }
                    }
                    NoticeAction::BecameLive => println!("{}", liveness_line()),
                    NoticeAction::Print(text) => println!("{}", text),
                    NoticeAction::None => {}
                }
            }
        };

        let (result, ()) = tokio::join!(engine_run, relay);
        if let Some(writer) = writer {
            writer.finish().await;
        }
        result?;

        Ok(handler.stats().clone())
    }
}
