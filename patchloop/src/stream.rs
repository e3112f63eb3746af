//! Event stream consumption.
//!
//! A run executes on a worker thread and hands events over a bounded channel.
//! Callers either forward them live ([`write_ndjson`]) or drain them into a
//! [`RunSummary`] ([`collect_run`]). Dropping the stream disconnects the
//! worker, which stops at its next emit.

use std::any::Any;
use std::io::Write;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, warn};

use crate::core::events::{ConsumerGone, ErrorInfo, ErrorKind, EventSink, RunEvent};
use crate::core::summary::RunSummary;
use crate::core::types::RunRequest;
use crate::io::broker::TextGenerator;
use crate::run::Pipeline;

/// Events buffered between the worker and the consumer.
const CHANNEL_CAPACITY: usize = 16;

struct ChannelSink {
    tx: SyncSender<RunEvent>,
}

impl EventSink for ChannelSink {
    fn emit(&mut self, event: RunEvent) -> Result<()> {
        self.tx.send(event).map_err(|_| anyhow!(ConsumerGone))
    }
}

/// Lazy, finite, non-restartable sequence of run events.
///
/// Always ends with a terminal event: if the worker dies without sending one,
/// an `error` event is synthesized.
pub struct EventStream {
    rx: Receiver<RunEvent>,
    worker: Option<JoinHandle<()>>,
    finished: bool,
}

impl EventStream {
    fn join_worker(&mut self) -> Option<String> {
        let worker = self.worker.take()?;
        match worker.join() {
            Ok(()) => None,
            Err(payload) => Some(panic_message(payload.as_ref())),
        }
    }
}

impl Iterator for EventStream {
    type Item = RunEvent;

    fn next(&mut self) -> Option<RunEvent> {
        if self.finished {
            return None;
        }
        match self.rx.recv() {
            Ok(event) => {
                if event.is_terminal() {
                    self.finished = true;
                    self.join_worker();
                }
                Some(event)
            }
            Err(_) => {
                self.finished = true;
                let message = match self.join_worker() {
                    Some(panic) => format!("run worker panicked: {panic}"),
                    None => "run ended without a terminal event".to_string(),
                };
                error!(message = %message, "event stream cut short");
                Some(RunEvent::Error(ErrorInfo {
                    kind: ErrorKind::Environment,
                    message,
                }))
            }
        }
    }
}

/// Start `request` on a worker thread and return its event stream.
pub fn start_run<G>(pipeline: Pipeline<G>, request: RunRequest) -> Result<EventStream>
where
    G: TextGenerator + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(CHANNEL_CAPACITY);
    let worker = thread::Builder::new()
        .name("patchloop-run".to_string())
        .spawn(move || {
            let mut sink = ChannelSink { tx };
            if let Err(err) = pipeline.run(&request, &mut sink) {
                warn!(err = %format!("{err:#}"), "run ended with sink failure");
            }
        })
        .context("spawn run worker")?;
    debug!("run worker started");
    Ok(EventStream {
        rx,
        worker: Some(worker),
        finished: false,
    })
}

/// Drain every event and summarize the run.
pub fn collect_run(events: impl IntoIterator<Item = RunEvent>) -> RunSummary {
    RunSummary::from_events(events.into_iter().collect())
}

/// Write each event as one JSON line, flushing per line.
///
/// Returns the terminal event, if the stream produced one.
pub fn write_ndjson<W: Write>(
    events: impl IntoIterator<Item = RunEvent>,
    out: &mut W,
) -> Result<Option<RunEvent>> {
    let mut last = None;
    for event in events {
        serde_json::to_writer(&mut *out, &event).context("serialize event")?;
        out.write_all(b"\n").context("write event")?;
        out.flush().context("flush event stream")?;
        if event.is_terminal() {
            last = Some(event);
        }
    }
    Ok(last)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::io::broker::{GenerateRequest, TokenStream};
    use crate::io::config::Limits;
    use crate::io::prompt::Prompts;
    use crate::test_support::{ScriptedBroker, TestRepo, plan, replace_line_diff};

    struct PanickingBroker;

    impl TextGenerator for PanickingBroker {
        fn generate(&self, _request: &GenerateRequest) -> Result<String> {
            panic!("model backend exploded");
        }

        fn generate_stream(&self, _request: &GenerateRequest) -> Result<TokenStream<'_>> {
            panic!("model backend exploded");
        }
    }

    fn pipeline<G: TextGenerator>(generator: G) -> Pipeline<G> {
        Pipeline::new(generator, Prompts::builtin().expect("prompts"), Limits::default())
    }

    #[test]
    fn ndjson_lines_end_with_done() {
        let repo = TestRepo::new().expect("repo");
        let broker = Arc::new(ScriptedBroker::new());
        broker.push(plan().impacted("src/app.ts", &["answer"]).build());
        broker.push(replace_line_diff(
            "src/app.ts",
            TestRepo::SEED_LINE,
            "export const answer = 42;",
        ));

        let stream = start_run(pipeline(Arc::clone(&broker)), repo.request("bump")).expect("start");
        let mut out = Vec::new();
        let last = write_ndjson(stream, &mut out).expect("write");

        let text = String::from_utf8(out).expect("utf8");
        let names: Vec<String> = text
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).expect("json line");
                value["event"].as_str().expect("event name").to_string()
            })
            .collect();
        assert_eq!(names.first().map(String::as_str), Some("repo_map"));
        assert_eq!(names.last().map(String::as_str), Some("done"));
        assert!(matches!(last, Some(RunEvent::Done { ok: true, .. })));
        broker.assert_drained();
    }

    #[test]
    fn worker_panic_becomes_error_event() {
        let repo = TestRepo::new().expect("repo");
        let stream = start_run(pipeline(PanickingBroker), repo.request("boom")).expect("start");
        let events: Vec<RunEvent> = stream.collect();

        let Some(RunEvent::Error(info)) = events.last() else {
            panic!("expected trailing error, got {events:?}");
        };
        assert_eq!(info.kind, ErrorKind::Environment);
        assert!(info.message.contains("model backend exploded"));
    }

    #[test]
    fn collected_summary_reports_touched_files() {
        let repo = TestRepo::new().expect("repo");
        let broker = ScriptedBroker::new();
        broker.push(
            plan()
                .impacted("src/app.ts", &[])
                .command("check", "true")
                .build(),
        );
        broker.push(replace_line_diff(
            "src/app.ts",
            TestRepo::SEED_LINE,
            "export const answer = 42;",
        ));

        let summary = collect_run(start_run(pipeline(broker), repo.request("bump")).expect("start"));
        assert!(summary.ok);
        assert_eq!(summary.touched, vec!["src/app.ts".to_string()]);
        assert_eq!(summary.commands.len(), 1);
        assert_eq!(summary.critic_cycles, 0);
        assert!(summary.last_error.is_none());
    }
}
