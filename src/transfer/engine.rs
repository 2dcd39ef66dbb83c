//! TransferEngine: executes a batch of signed transfer items on a fixed pool
//! of worker tasks.
//!
//! Each batch owns its queue, watcher and workers; nothing is shared between
//! batches. Workers check the cancellation flag only between items and
//! between retry attempts, never in the middle of writing an item.
//!
//! Downloads are written to a temp file beside the destination and renamed
//! into place on success, so a failed or cancelled item never leaves partial
//! output at the destination path.

use crate::{
    models::grant::{AccessGrant, RequestRecord, SignedGrant},
    transfer::{
        error::{BatchError, ItemError},
        event::{CompletedItem, EventSink, ItemRef, LifecycleEvent},
        item::{Endpoint, TransferItem, UploadSource},
        pipeline::{self, KeyMaterial},
        progress::{BatchState, ItemStatus, ProgressWatcher},
        transport::{ByteStream, SignedRequestExecutor},
    },
};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, future, stream};
use std::{
    collections::VecDeque,
    future::Future,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    task::JoinSet,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bounded per-item retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// An item fails for good once this many attempts failed transiently.
    pub ceiling: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            ceiling: 3,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt that follows the `failures`-th failure.
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max)
    }
}

/// How a batch ended.
#[derive(Debug, Clone)]
pub enum BatchOutcome {
    Completed,
    Cancelled,
    Failed(Arc<BatchError>),
}

/// Terminal status of one item alongside the grant it ran under.
#[derive(Debug, Clone)]
pub struct ItemResult {
    pub index: usize,
    pub grant: SignedGrant,
    pub status: ItemStatus,
}

/// What `execute` hands back once every item is terminal.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub outcome: BatchOutcome,
    pub state: BatchState,
    pub items: Vec<ItemResult>,
}

impl BatchResult {
    fn with_status<'a>(
        &'a self,
        pred: impl Fn(&ItemStatus) -> bool + 'a,
    ) -> impl Iterator<Item = &'a ItemResult> + 'a {
        self.items.iter().filter(move |item| pred(&item.status))
    }

    pub fn succeeded(&self) -> Vec<&ItemResult> {
        self.with_status(|s| *s == ItemStatus::Succeeded).collect()
    }

    pub fn failed(&self) -> Vec<&ItemResult> {
        self.with_status(|s| matches!(s, ItemStatus::Failed(_)))
            .collect()
    }

    pub fn cancelled(&self) -> Vec<&ItemResult> {
        self.with_status(|s| *s == ItemStatus::Cancelled).collect()
    }

    /// Grants worth resubmitting: everything that did not succeed.
    pub fn unfinished_grants(&self) -> Vec<SignedGrant> {
        self.with_status(|s| *s != ItemStatus::Succeeded)
            .map(|item| item.grant.clone())
            .collect()
    }

    /// Audit records for the executed grants followed by the declined ones.
    pub fn audit_records(&self, declined: &[AccessGrant]) -> Vec<RequestRecord> {
        self.items
            .iter()
            .map(|item| RequestRecord::from(&AccessGrant::from(item.grant.clone())))
            .chain(declined.iter().map(RequestRecord::from))
            .collect()
    }
}

/// Handle for observing and cancelling a running batch from any task or
/// thread.
#[derive(Debug, Clone)]
pub struct BatchHandle {
    watcher: Arc<ProgressWatcher>,
}

impl BatchHandle {
    /// Request cooperative cancellation. Items already being transferred
    /// finish their current attempt; nothing new is started.
    pub fn cancel(&self) {
        self.watcher.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.watcher.is_cancelled()
    }

    pub fn state(&self) -> BatchState {
        self.watcher.state()
    }
}

/// Runs batches of signed transfers against one executor.
#[derive(Clone)]
pub struct TransferEngine {
    executor: Arc<dyn SignedRequestExecutor>,
    retry: RetryPolicy,
}

struct WorkQueue(Mutex<VecDeque<(usize, TransferItem)>>);

impl WorkQueue {
    fn next(&self) -> Option<(usize, TransferItem)> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

struct BatchContext {
    executor: Arc<dyn SignedRequestExecutor>,
    retry: RetryPolicy,
    watcher: Arc<ProgressWatcher>,
    queue: WorkQueue,
    sink: Arc<dyn EventSink>,
    refs: Vec<ItemRef>,
}

impl TransferEngine {
    pub fn new(executor: Arc<dyn SignedRequestExecutor>, retry: RetryPolicy) -> Self {
        Self { executor, retry }
    }

    /// Run `items` on `concurrency` workers and wait for the final event.
    pub async fn execute(
        &self,
        items: Vec<TransferItem>,
        concurrency: usize,
        sink: Arc<dyn EventSink>,
    ) -> BatchResult {
        let (_handle, batch) = self.start(items, concurrency, sink);
        batch.await
    }

    /// Prepare a batch. The returned future drives it to completion; the
    /// handle can cancel it or read progress meanwhile.
    pub fn start(
        &self,
        items: Vec<TransferItem>,
        concurrency: usize,
        sink: Arc<dyn EventSink>,
    ) -> (BatchHandle, impl Future<Output = BatchResult> + Send + 'static) {
        let total_bytes = known_total_bytes(&items);
        let watcher = Arc::new(ProgressWatcher::new(items.len(), total_bytes));
        let handle = BatchHandle {
            watcher: Arc::clone(&watcher),
        };

        let grants: Vec<SignedGrant> = items.iter().map(|item| item.grant().clone()).collect();
        let refs = grants
            .iter()
            .enumerate()
            .map(|(index, grant)| ItemRef {
                index,
                transaction_id: grant.transaction_id().to_string(),
                object: grant.granted().clone(),
            })
            .collect();

        let ctx = Arc::new(BatchContext {
            executor: Arc::clone(&self.executor),
            retry: self.retry.clone(),
            watcher,
            queue: WorkQueue(Mutex::new(items.into_iter().enumerate().collect())),
            sink,
            refs,
        });

        (handle, run_batch(ctx, grants, concurrency))
    }
}

/// Sum of every item's expected size; `None` if any is unknown or the sum
/// does not fit in a `u64`.
fn known_total_bytes(items: &[TransferItem]) -> Option<u64> {
    items
        .iter()
        .try_fold(0u64, |total, item| total.checked_add(item.expected_size()?))
}

async fn run_batch(
    ctx: Arc<BatchContext>,
    grants: Vec<SignedGrant>,
    concurrency: usize,
) -> BatchResult {
    let total = ctx.refs.len();
    let mut fatal = None;

    if concurrency == 0 {
        fatal = Some(BatchError::NoWorkers);
    } else {
        info!("starting batch of {} items on {} workers", total, concurrency);
        ctx.sink.on_event(LifecycleEvent::Started {
            state: ctx.watcher.state(),
        });

        let mut workers = JoinSet::new();
        for worker in 0..concurrency {
            let ctx = Arc::clone(&ctx);
            workers.spawn(run_worker(worker, ctx));
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!("transfer worker died: {}", err);
                if fatal.is_none() {
                    fatal = Some(BatchError::WorkerFailed(err.to_string()));
                }
                // Stop the surviving workers at their next item boundary.
                ctx.watcher.cancel();
            }
        }
    }

    let cancelled = ctx.watcher.cancel_pending();
    if !cancelled.is_empty() {
        debug!("{} items never ran to completion", cancelled.len());
    }
    let state = ctx.watcher.state();

    let (outcome, event) = match fatal {
        Some(err) => {
            let err = Arc::new(err);
            error!("batch aborted: {}", err);
            (
                BatchOutcome::Failed(Arc::clone(&err)),
                LifecycleEvent::Error {
                    state: state.clone(),
                    error: err,
                },
            )
        }
        None if state.cancelled => {
            let cancelled = state
                .statuses
                .iter()
                .enumerate()
                .filter(|(_, status)| **status == ItemStatus::Cancelled)
                .map(|(idx, _)| ctx.refs[idx].clone())
                .collect();
            (
                BatchOutcome::Cancelled,
                LifecycleEvent::Cancelled {
                    state: state.clone(),
                    cancelled,
                },
            )
        }
        None => (
            BatchOutcome::Completed,
            LifecycleEvent::Completed {
                state: state.clone(),
            },
        ),
    };

    info!(
        "batch {}: {} of {} succeeded, {} failed, {} cancelled",
        event.name(),
        state.completed_items,
        total,
        state.failed_items,
        state.cancelled_items
    );
    ctx.sink.on_event(event);

    let items = grants
        .into_iter()
        .zip(state.statuses.iter().cloned())
        .enumerate()
        .map(|(index, (grant, status))| ItemResult {
            index,
            grant,
            status,
        })
        .collect();

    BatchResult {
        outcome,
        state,
        items,
    }
}

async fn run_worker(worker: usize, ctx: Arc<BatchContext>) {
    loop {
        if ctx.watcher.is_cancelled() {
            debug!(worker, "cancellation observed, worker stopping");
            break;
        }
        let Some((index, item)) = ctx.queue.next() else {
            break;
        };
        run_item(&ctx, index, item).await;
    }
}

async fn run_item(ctx: &BatchContext, index: usize, item: TransferItem) {
    let item_ref = &ctx.refs[index];
    let mut failures = 0u32;

    loop {
        match transfer_once(ctx.executor.as_ref(), &item).await {
            Ok(bytes) => {
                debug!(
                    transaction_id = %item_ref.transaction_id,
                    "transferred {} ({} bytes)", item_ref.object, bytes
                );
                if let Some(state) = ctx.watcher.record_completion(index, bytes) {
                    ctx.sink.on_event(LifecycleEvent::InProgress {
                        state,
                        completed: vec![CompletedItem {
                            item: item_ref.clone(),
                            bytes,
                        }],
                    });
                }
                return;
            }
            Err(err) => {
                failures += 1;
                if !err.is_retryable() || failures >= ctx.retry.ceiling {
                    warn!(
                        transaction_id = %item_ref.transaction_id,
                        "giving up on {} after {} attempt(s): {}", item_ref.object, failures, err
                    );
                    ctx.watcher.record_failure(index, err.to_string());
                    return;
                }

                let delay = ctx.retry.delay(failures);
                warn!(
                    transaction_id = %item_ref.transaction_id,
                    "attempt {} for {} failed, retrying in {:?}: {}",
                    failures, item_ref.object, delay, err
                );
                let cancel = ctx.watcher.cancellation();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {}
                }
                if ctx.watcher.is_cancelled() {
                    debug!(transaction_id = %item_ref.transaction_id, "abandoning {}", item_ref.object);
                    ctx.watcher.record_cancelled(index);
                    return;
                }
            }
        }
    }
}

/// One attempt at moving an item's bytes. Returns the payload size as seen
/// by the local side.
async fn transfer_once(
    executor: &dyn SignedRequestExecutor,
    item: &TransferItem,
) -> Result<u64, ItemError> {
    let url = item.grant().signed_url();
    let object = item.object();

    match item.endpoint() {
        Endpoint::Download {
            destination,
            decompress,
            decrypt,
        } => {
            let raw = executor.get(url, object).await?;
            let opened = pipeline::wrap(raw, *decompress, decrypt.clone());
            write_destination(destination, opened).await
        }
        Endpoint::Upload {
            source,
            compress,
            encrypt,
            ..
        } => {
            let sent = Arc::new(AtomicU64::new(0));
            let body = open_source(source, *compress, encrypt.clone(), Arc::clone(&sent)).await?;
            executor.put(url, object, body).await?;
            Ok(sent.load(Ordering::Relaxed))
        }
    }
}

async fn open_source(
    source: &UploadSource,
    compress: bool,
    encrypt: Option<KeyMaterial>,
    sent: Arc<AtomicU64>,
) -> Result<ByteStream, ItemError> {
    let plain = match source {
        UploadSource::Memory(content) => stream::once(future::ready(Ok(content.clone()))).boxed(),
        UploadSource::File(path) => {
            let file = File::open(path).await.map_err(ItemError::Local)?;
            ReaderStream::new(file).boxed()
        }
    };
    let counted = plain
        .inspect_ok(move |chunk: &Bytes| {
            sent.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        })
        .boxed();
    Ok(pipeline::seal(counted, compress, encrypt))
}

/// Stream `opened` into a temp file beside `destination`, then rename it
/// into place. The temp file is removed on any error.
async fn write_destination(
    destination: &Path,
    mut opened: pipeline::OpenedStream,
) -> Result<u64, ItemError> {
    let parent = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await.map_err(ItemError::Local)?;

    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(".{}.part-{}", name, Uuid::new_v4()));
    let mut file = File::create(&tmp_path).await.map_err(ItemError::Local)?;

    let mut written: u64 = 0;
    let streamed: Result<(), ItemError> = async {
        while let Some(chunk) = opened.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await.map_err(ItemError::Local)?;
        }
        file.flush().await.map_err(ItemError::Local)?;
        file.sync_all().await.map_err(ItemError::Local)?;
        Ok(())
    }
    .await;
    drop(file);

    if let Err(err) = streamed {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(err);
    }

    if let Err(err) = fs::rename(&tmp_path, destination).await {
        if err.kind() == ErrorKind::AlreadyExists {
            fs::remove_file(destination).await.map_err(ItemError::Local)?;
            fs::rename(&tmp_path, destination)
                .await
                .map_err(ItemError::Local)?;
        } else {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ItemError::Local(io::Error::new(
                err.kind(),
                format!("moving download into {}: {}", destination.display(), err),
            )));
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::object::ObjectRef,
        transfer::{event::NullSink, transport::TransportError},
    };

    fn upload(key: &str, size: Option<u64>) -> TransferItem {
        let object = ObjectRef::new("bucket", key);
        let grant = AccessGrant::signed(
            format!("tx-{key}"),
            "put",
            object.clone(),
            object,
            format!("http://storage.local/bucket/{key}"),
        )
        .into_signed()
        .unwrap();
        TransferItem::upload_file(grant, format!("/tmp/{key}"), size)
    }

    #[test]
    fn total_bytes_needs_every_size() {
        assert_eq!(
            known_total_bytes(&[upload("a", Some(10)), upload("b", Some(32))]),
            Some(42)
        );
        assert_eq!(known_total_bytes(&[upload("a", Some(10)), upload("b", None)]), None);
        assert_eq!(known_total_bytes(&[]), Some(0));
    }

    #[tokio::test]
    async fn overflowing_sizes_leave_the_total_unknown() {
        struct Unreachable;

        #[async_trait::async_trait]
        impl SignedRequestExecutor for Unreachable {
            async fn get(&self, _: &str, _: &ObjectRef) -> Result<ByteStream, TransportError> {
                Err(TransportError::Transient("unreachable".into()))
            }

            async fn put(&self, _: &str, _: &ObjectRef, _: ByteStream) -> Result<u64, TransportError> {
                Err(TransportError::Transient("unreachable".into()))
            }
        }

        let engine = TransferEngine::new(Arc::new(Unreachable), RetryPolicy::default());
        let items = vec![upload("a", Some(u64::MAX)), upload("b", Some(u64::MAX))];
        let (handle, _batch) = engine.start(items, 1, Arc::new(NullSink));
        assert_eq!(handle.state().total_bytes, None);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            ceiling: 5,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(350),
        };
        assert_eq!(retry.delay(1), Duration::from_millis(100));
        assert_eq!(retry.delay(2), Duration::from_millis(200));
        assert_eq!(retry.delay(3), Duration::from_millis(350));
        assert_eq!(retry.delay(40), Duration::from_millis(350));
    }
}
