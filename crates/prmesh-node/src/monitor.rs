use anyhow::Result;
use prmesh_routing::RoutingManager;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, info};

/// Periodic routing table dumps on the tokio clock
pub struct TablePrinter {
    manager: Weak<RoutingManager>,
    interval: Duration,
    print_task: Option<JoinHandle<()>>,
}

impl TablePrinter {
    pub fn new(manager: &Arc<RoutingManager>, interval: Duration) -> Self {
        Self {
            manager: Arc::downgrade(manager),
            interval,
            print_task: None,
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Starting routing table printer...");

        let manager = self.manager.clone();
        let period = self.interval;
        self.print_task = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match manager.upgrade() {
                    Some(manager) => Self::print_tables(&manager),
                    None => break,
                }
            }
        }));
        debug!("Table printer started (interval: {:?})", period);

        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        info!("Stopping routing table printer...");

        if let Some(task) = self.print_task.take() {
            task.abort();
        }

        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.print_task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Log every node's table, one line per event
    pub fn print_tables(manager: &RoutingManager) {
        for line in manager.dump_all().lines() {
            info!("{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prmesh_routing::{InMemoryStack, TokioScheduler};

    #[tokio::test(start_paused = true)]
    async fn test_printer_start_stop() {
        let stack = Arc::new(InMemoryStack::new());
        let scheduler = Arc::new(TokioScheduler::new());
        let manager = Arc::new(RoutingManager::new(stack, scheduler));

        let mut printer = TablePrinter::new(&manager, Duration::from_secs(5));
        assert!(!printer.is_running());

        printer.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(printer.is_running());

        printer.stop().await.unwrap();
        assert!(!printer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_printer_exits_with_manager() {
        let stack = Arc::new(InMemoryStack::new());
        let scheduler = Arc::new(TokioScheduler::new());
        let manager = Arc::new(RoutingManager::new(stack, scheduler));

        let mut printer = TablePrinter::new(&manager, Duration::from_secs(1));
        printer.start().await.unwrap();
        drop(manager);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!printer.is_running());
    }
}
