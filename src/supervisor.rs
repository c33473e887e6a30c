use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::flags::Flag;
use crate::peer::PeerHandler;
use crate::slot::Slot;
use crate::statistics::Counters;

/// Owns every slot's handler and worker set. Drains the reset channel,
/// restarting whichever slot declared its tunnel dead, and tears the whole
/// instance down on a termination signal.
pub struct Supervisor {
    slots: Arc<Vec<Arc<Slot>>>,
    handlers: Vec<Arc<PeerHandler>>,
    worker_handles: Vec<Vec<JoinHandle<()>>>,
    admission_handle: Option<JoinHandle<()>>,
    admission_shutdown: Option<Arc<Flag>>,
    counters: Arc<Counters>,
    reset_rx: mpsc::Receiver<usize>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        slots: Arc<Vec<Arc<Slot>>>,
        handlers: Vec<Arc<PeerHandler>>,
        worker_handles: Vec<Vec<JoinHandle<()>>>,
        admission_handle: Option<JoinHandle<()>>,
        admission_shutdown: Option<Arc<Flag>>,
        counters: Arc<Counters>,
        reset_rx: mpsc::Receiver<usize>,
    ) -> Self {
        Self {
            slots,
            handlers,
            worker_handles,
            admission_handle,
            admission_shutdown,
            counters,
            reset_rx,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        #[cfg(unix)]
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        loop {
            #[cfg(unix)]
            let on_terminate = terminate.recv();
            #[cfg(not(unix))]
            let on_terminate = std::future::pending::<Option<()>>();

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!("received interrupt, shutting down");
                    break;
                }
                _ = on_terminate => {
                    log::info!("received termination signal, shutting down");
                    break;
                }
                Some(index) = self.reset_rx.recv() => {
                    self.restart_slot(index).await;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn restart_slot(&mut self, index: usize) {
        log::info!("slot {index}: resetting");
        for handle in self.worker_handles[index].drain(..) {
            let _ = handle.await;
        }
        self.worker_handles[index] = self.handlers[index].start();
    }

    async fn shutdown(mut self) {
        for slot in self.slots.iter() {
            slot.exit.set();
        }
        if let Some(flag) = &self.admission_shutdown {
            flag.set();
        }

        for handles in self.worker_handles.drain(..) {
            for handle in handles {
                let _ = handle.await;
            }
        }
        if let Some(handle) = self.admission_handle.take() {
            let _ = handle.await;
        }

        self.counters.log_summary();
    }
}
