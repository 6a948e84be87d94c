//! Line-delimited JSON transport over a pair of byte streams.
//!
//! Events arrive one JSON object per line; calls leave the same way. The
//! binary wires this to stdin and stdout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use lattice_id::{AgentId, ExecutorId, OfferId, TaskId};
use lattice_protocol::{AckToken, Call, Event, TaskInfo};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{dispatch_event, EventHandler, SchedulerClient, TransportError};

type Reader = Box<dyn AsyncBufRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Scheduler client speaking newline-delimited JSON.
pub struct StdioSchedulerClient {
    reader: Mutex<Option<Reader>>,
    writer: Mutex<Writer>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl StdioSchedulerClient {
    /// Client reading events from stdin and writing calls to stdout.
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }

    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncBufRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Mutex::new(Some(Box::new(reader))),
            writer: Mutex::new(Box::new(writer)),
            reader_task: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn send(&self, call: Call) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            bail!("client is closed");
        }
        let mut line = call.encode()?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .context("failed to write call")?;
        writer.flush().await.context("failed to flush call")?;
        Ok(())
    }
}

#[async_trait]
impl SchedulerClient for StdioSchedulerClient {
    async fn subscribe(&self, url: &str, handler: Arc<dyn EventHandler>) -> Result<()> {
        let Some(reader) = self.reader.lock().await.take() else {
            bail!("already subscribed");
        };

        if let Err(e) = self.send(Call::Subscribe { url: url.to_string() }).await {
            handler
                .on_connect_exception(TransportError::Connect(format!("{e:#}")))
                .await;
            return Err(e);
        }

        info!(
            url,
            event_buffer_size = handler.event_buffer_size(),
            "Subscription opened"
        );
        let task = tokio::spawn(read_events(reader, handler, self.closed.clone()));
        *self.reader_task.lock().await = Some(task);
        Ok(())
    }

    async fn decline(&self, offer_ids: Vec<OfferId>) -> Result<()> {
        self.send(Call::Decline { offer_ids }).await
    }

    async fn accept(&self, offer_ids: Vec<OfferId>, tasks: Vec<TaskInfo>) -> Result<()> {
        self.send(Call::Accept { offer_ids, tasks }).await
    }

    async fn kill(&self, task_id: &TaskId) -> Result<()> {
        self.send(Call::Kill {
            task_id: task_id.clone(),
        })
        .await
    }

    async fn acknowledge(&self, agent_id: &AgentId, task_id: &str, uuid: AckToken) -> Result<()> {
        self.send(Call::Acknowledge {
            agent_id: agent_id.clone(),
            task_id: task_id.to_string(),
            uuid,
        })
        .await
    }

    async fn framework_message(
        &self,
        executor_id: &ExecutorId,
        agent_id: &AgentId,
        data: Vec<u8>,
    ) -> Result<()> {
        self.send(Call::Message {
            agent_id: agent_id.clone(),
            executor_id: executor_id.clone(),
            data,
        })
        .await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        info!("Scheduler client closed");
    }
}

async fn read_events(reader: Reader, handler: Arc<dyn EventHandler>, closed: Arc<AtomicBool>) {
    let mut lines = reader.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                if !closed.load(Ordering::Acquire) {
                    handler
                        .on_uncaught_exception(TransportError::ConnectionClosed)
                        .await;
                }
                return;
            }
            Err(e) => {
                handler
                    .on_uncaught_exception(TransportError::Other(e.to_string()))
                    .await;
                return;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match Event::decode(line) {
            Ok(event) => {
                debug!(event = event.kind(), "Received event");
                dispatch_event(handler.as_ref(), event).await;
            }
            Err(e) => {
                warn!(error = %e, "Dropping undecodable event stream");
                handler
                    .on_uncaught_exception(TransportError::Decode(e.to_string()))
                    .await;
                return;
            }
        }
    }
}
