//! Wires the scheduler to a directory-backed target and follows submitted
//! work until it settles.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;

use ferry_file_ops::DirSessionFactory;
use ferry_protocol::{SessionFactory, Task, TaskId, TaskStatus};
use ferry_scheduler::{
    BatchTicket, Engines, PresetAdvisor, PresetTuner, Scheduler, SchedulerEvent,
    advisor::ADVISOR_FILE,
};
use ferry_transfer::{CheckpointStore, ProtocolEngine};

use crate::config::FerryConfig;

pub struct App {
    scheduler: Scheduler,
    /// Direct engine for read-only commands that bypass the task queue.
    browser: ProtocolEngine,
    events: mpsc::UnboundedReceiver<SchedulerEvent>,
    quiet: bool,
}

impl App {
    pub fn start(config: &FerryConfig, quiet: bool) -> anyhow::Result<Self> {
        let mount = config.target_mount();
        std::fs::create_dir_all(&mount)?;
        let checkpoints = config.checkpoint_dir();
        std::fs::create_dir_all(&checkpoints)?;

        let factory: Arc<dyn SessionFactory> =
            Arc::new(DirSessionFactory::new(&mount, config.boundary()?));
        let store = Arc::new(CheckpointStore::new(&checkpoints));

        let advisor = config
            .adaptive_preset
            .then(|| PresetAdvisor::load(checkpoints.join(ADVISOR_FILE)));
        let preset = advisor
            .as_ref()
            .map(|a| a.current())
            .unwrap_or(config.preset);

        let (engines, chunked) = Engines::standard(
            Arc::clone(&factory),
            store,
            config.protocol_workers,
            config.chunked_config(preset),
        );
        let browser = ProtocolEngine::new(Arc::clone(&factory), 1);
        let scheduler = match advisor {
            Some(advisor) => Scheduler::with_tuner(
                factory,
                engines,
                config.scheduler_config(),
                PresetTuner {
                    advisor,
                    engine: chunked,
                },
            ),
            None => Scheduler::new(factory, engines, config.scheduler_config()),
        };
        let events = scheduler
            .take_events()
            .ok_or_else(|| anyhow::anyhow!("scheduler events already taken"))?;

        tracing::info!(
            mount = %mount.display(),
            preset = %preset,
            adaptive = config.adaptive_preset,
            "target ready"
        );
        Ok(Self {
            scheduler,
            browser,
            events,
            quiet,
        })
    }

    pub async fn upload(mut self, local: &str, remote: &str) -> anyhow::Result<()> {
        if Path::new(local).is_dir() {
            let ticket = self.scheduler.submit_upload_dir(local, remote).await?;
            self.follow_batch(ticket).await
        } else {
            let id = self.scheduler.submit_upload(local, remote).await?;
            self.follow([id].into()).await
        }
    }

    pub async fn download(mut self, remote: &str, local: &str) -> anyhow::Result<()> {
        let entry = self.browser.stat(remote).await?;
        if entry.is_some_and(|e| e.is_dir()) {
            let ticket = self.scheduler.submit_download_dir(remote, local).await?;
            self.follow_batch(ticket).await
        } else {
            let id = self.scheduler.submit_download(remote, local).await?;
            self.follow([id].into()).await
        }
    }

    pub async fn mkdir(mut self, remote: &str) -> anyhow::Result<()> {
        let id = self.scheduler.submit_mkdir(remote).await?;
        self.follow([id].into()).await
    }

    pub async fn delete(mut self, remote: &str) -> anyhow::Result<()> {
        let id = self.scheduler.submit_delete(remote).await?;
        self.follow([id].into()).await
    }

    pub async fn rename(mut self, from: &str, to: &str) -> anyhow::Result<()> {
        let id = self.scheduler.submit_rename(from, to).await?;
        self.follow([id].into()).await
    }

    pub async fn list(self, remote: &str) -> anyhow::Result<()> {
        let mut entries = self.browser.list(remote).await?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        for entry in entries {
            let marker = if entry.is_dir() { "/" } else { "" };
            println!("{:>12}  {}{}", entry.size, entry.name, marker);
        }
        Ok(())
    }

    pub async fn probe(self, remote: &str) -> anyhow::Result<()> {
        let writable = self.browser.probe_writable(remote).await?;
        println!("{remote}: {}", if writable { "writable" } else { "read-only" });
        Ok(())
    }

    async fn follow_batch(&mut self, ticket: BatchTicket) -> anyhow::Result<()> {
        for path in &ticket.rejected {
            eprintln!("skipped unsupported entry {path}");
        }
        if ticket.tasks.is_empty() {
            println!("nothing to transfer");
            return Ok(());
        }
        println!(
            "batch {}: {} tasks, {} bytes",
            ticket.batch,
            ticket.tasks.len(),
            ticket.total_bytes
        );
        self.follow(ticket.tasks.into_iter().collect()).await
    }

    /// Prints events until every task in `watch` is terminal. Ctrl-C cancels
    /// whatever is still open.
    async fn follow(&mut self, mut watch: HashSet<TaskId>) -> anyhow::Result<()> {
        let mut failed = 0usize;
        let mut interrupted = false;
        while !watch.is_empty() {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else {
                        anyhow::bail!("scheduler stopped");
                    };
                    if let Some(task) = self.report(event)
                        && watch.contains(&task.id)
                        && task.status.is_terminal()
                    {
                        watch.remove(&task.id);
                        if task.status == TaskStatus::Failed {
                            failed += 1;
                        }
                    }
                }
                _ = tokio::signal::ctrl_c(), if !interrupted => {
                    interrupted = true;
                    eprintln!("interrupted, canceling {} task(s)", watch.len());
                    for id in &watch {
                        if let Err(e) = self.scheduler.cancel(id).await {
                            tracing::debug!(task = %id, error = %e, "cancel skipped");
                        }
                    }
                }
            }
        }
        anyhow::ensure!(failed == 0, "{failed} task(s) failed");
        Ok(())
    }

    /// Prints one event; returns the task snapshot it carried, if any.
    fn report(&self, event: SchedulerEvent) -> Option<Task> {
        match event {
            SchedulerEvent::TaskChanged(task) => {
                if !self.quiet || task.status.is_terminal() {
                    println!("{}", describe(&task));
                }
                Some(task)
            }
            SchedulerEvent::Progress(task) => {
                if !self.quiet {
                    println!(
                        "  {} {:>5.1}% {:.0} B/s",
                        label(&task),
                        task.percentage(),
                        task.speed_bps
                    );
                }
                None
            }
            SchedulerEvent::BatchFinished(summary) => {
                println!(
                    "batch {}: {} done, {} skipped, {} failed, {} canceled",
                    summary.batch, summary.done, summary.skipped, summary.failed, summary.canceled
                );
                None
            }
        }
    }
}

fn label(task: &Task) -> String {
    if task.src.is_empty() {
        format!("{} {}", task.kind, task.dst)
    } else if task.dst.is_empty() {
        format!("{} {}", task.kind, task.src)
    } else {
        format!("{} {} -> {}", task.kind, task.src, task.dst)
    }
}

fn describe(task: &Task) -> String {
    let mut line = format!("[{}] {}", task.status, label(task));
    if let (Some(kind), Some(message)) = (&task.error_kind, &task.error_message) {
        line.push_str(&format!(" ({kind}: {message})"));
    }
    line
}
