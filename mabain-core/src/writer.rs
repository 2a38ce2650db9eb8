//! The async writer thread (spec §4.7, §6 `add_async`): polls the wake-up pipe, drains the shared
//! command queue in FIFO order, and dispatches each command against the one shared [`Dict`] behind
//! a mutex so it never races a foreground `Db::add`/`Db::remove` call in the same process.
use crate::db::{self, BlockLayout};
use crate::dict::Dict;
use crate::header::HeaderPage;
use crate::queue::{CommandQueue, CommandType, QueueFile};
use crate::rc::RcThresholds;
use mabain_fd::NamedPipe;
use mabain_mem::AnyAllocator;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

const POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// The one `Dict` instance a process's writer role mutates; shared between foreground calls and
/// this background thread so both serialize through the same lock (spec §5: the writer_lock only
/// has to serialize calls made by the same process, not across processes).
pub type SharedDict = Arc<Mutex<Dict<AnyAllocator, AnyAllocator>>>;

/// Everything the draining thread needs that outlives a single command.
pub struct WriterContext {
    pub dict: SharedDict,
    pub header: &'static HeaderPage,
    pub dir: PathBuf,
    pub layout: BlockLayout,
    pub rc_thresholds: RcThresholds,
}

pub struct AsyncWriter {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AsyncWriter {
    /// Spawn the dedicated thread. `queue`/`pipe` are this writer's own handles, already opened by
    /// [`crate::db::Db::open`].
    pub fn spawn(ctx: WriterContext, queue: Arc<QueueFile>, mut pipe: NamedPipe) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = shutdown.clone();

        let handle = std::thread::spawn(move || {
            let command_queue = queue.queue(&ctx.header.queue_index, &ctx.header.writer_index);
            while !thread_shutdown.load(Ordering::Relaxed) {
                if !pipe.poll(POLL_TIMEOUT) {
                    continue;
                }
                drain_once(&ctx, &command_queue);
            }
            // One last drain so a command submitted right before shutdown is not lost.
            drain_once(&ctx, &command_queue);
        });

        AsyncWriter { shutdown, handle: Some(handle) }
    }

    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AsyncWriter {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn drain_once(ctx: &WriterContext, queue: &CommandQueue<'_>) {
    queue.drain(|cmd| {
        let result = match cmd.kind {
            CommandType::None => Ok(()),
            CommandType::Add | CommandType::Append => {
                let mut dict = ctx.dict.lock().unwrap();
                dict.add(ctx.header, &cmd.key, &cmd.data, cmd.overwrite)
            }
            CommandType::Remove => {
                let mut dict = ctx.dict.lock().unwrap();
                dict.remove(ctx.header, &cmd.key)
            }
            CommandType::RemoveAll => {
                let mut dict = ctx.dict.lock().unwrap();
                dict.remove_all(ctx.header)
            }
            CommandType::Rc => db::perform_collect(&ctx.dict, ctx.header, &ctx.dir, &ctx.layout, &ctx.rc_thresholds),
            CommandType::Backup => {
                let target = PathBuf::from(String::from_utf8_lossy(&cmd.data).into_owned());
                db::copy_db_files(&ctx.dir, &target)
            }
            CommandType::Freeze => {
                let target = PathBuf::from(String::from_utf8_lossy(&cmd.data).into_owned());
                // FREEZE backs up then clears the live database; kept exactly as documented
                // (spec §9 open question: preserve, don't "fix", this fall-through).
                db::copy_db_files(&ctx.dir, &target).and_then(|()| {
                    let mut dict = ctx.dict.lock().unwrap();
                    dict.remove_all(ctx.header)
                })
            }
        };
        #[cfg(feature = "tracing")]
        if let Err(e) = result {
            tracing::warn!(command = ?cmd.kind, error = %e, "queued command failed");
        }
        #[cfg(not(feature = "tracing"))]
        let _ = result;
    });
}
