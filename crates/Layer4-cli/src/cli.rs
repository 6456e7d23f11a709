//! Command implementations

use crate::Stage;
use athena_foundation::AthenaConfig;
use athena_task::{
    FileLogArchive, LocalBackend, LogArchive, NewTask, Page, SchedulerConfig,
    SqliteTaskRepository, TaskId, TaskLogManager, TaskRecord, TaskRepository, TaskScheduler,
};
use std::sync::Arc;
use tracing::info;

/// Scheduler over the SQLite repository, the local backend and the file archive
fn build_scheduler(config: &AthenaConfig) -> anyhow::Result<TaskScheduler> {
    let repository = Arc::new(SqliteTaskRepository::open(&config.data_dir())?);
    let backend = Arc::new(LocalBackend::new());
    let archive = Arc::new(FileLogArchive::new(config.log_dir(), backend.log_manager()));
    Ok(TaskScheduler::new(
        SchedulerConfig::from(config),
        repository,
        backend,
        archive,
    ))
}

/// Run until Ctrl-C, then stop
pub async fn serve(config: &AthenaConfig) -> anyhow::Result<()> {
    let scheduler = build_scheduler(config)?;
    scheduler.start().await?;

    let counts = scheduler.counts()?;
    info!(
        "Serving from {} ({} waiting, {} running, {} finished)",
        config.data_dir().display(),
        counts.waiting,
        counts.running,
        counts.finished
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    scheduler.stop().await?;
    Ok(())
}

pub fn submit(
    config: &AthenaConfig,
    task_type: &str,
    command: &str,
    max_tries: Option<u32>,
) -> anyhow::Result<()> {
    let scheduler = build_scheduler(config)?;
    let task = scheduler.submit(NewTask::new(task_type, command, max_tries.unwrap_or(0)))?;
    println!(
        "Submitted task {} (max tries {})",
        task.task_id(),
        task.info.max_tries
    );
    Ok(())
}

pub fn list(config: &AthenaConfig, stage: Option<Stage>, limit: usize) -> anyhow::Result<()> {
    let repository = SqliteTaskRepository::open(&config.data_dir())?;
    let page = Page::oldest_first(limit);

    if stage.map_or(true, |s| s == Stage::Waiting) {
        let waiting = repository.get_waiting_tasks(&page)?;
        println!("Waiting ({}):", waiting.total);
        for task in waiting.into_elements() {
            print_record(&TaskRecord::Waiting(task));
        }
    }
    if stage.map_or(true, |s| s == Stage::Running) {
        let running = repository.get_all_running_tasks()?;
        println!("Running ({}):", running.len());
        for task in running.into_iter().take(limit) {
            print_record(&TaskRecord::Running(task));
        }
    }
    if stage.map_or(true, |s| s == Stage::Finished) {
        let finished = repository.get_finished_tasks(&page)?;
        println!("Finished ({}):", finished.total);
        for task in finished.into_elements() {
            print_record(&TaskRecord::Finished(task));
        }
    }
    Ok(())
}

fn print_record(record: &TaskRecord) {
    let info = record.info();
    let status = match record {
        TaskRecord::Waiting(_) => "-".to_string(),
        TaskRecord::Running(task) => format!("pid {}", task.pid),
        TaskRecord::Finished(task) => task.state.to_string(),
    };
    println!(
        "  {:>6}  try {}/{}  {:<10} {}  {}",
        info.task_id,
        record.try_number(),
        info.max_tries,
        status,
        info.submit_time.format("%Y-%m-%d %H:%M:%S"),
        truncate(&info.command, 60)
    );
}

pub async fn logs(config: &AthenaConfig, task_id: i64, line: usize, rows: usize) -> anyhow::Result<()> {
    let task_id = TaskId(task_id);
    let repository = SqliteTaskRepository::open(&config.data_dir())?;
    match repository.find(task_id)? {
        None => anyhow::bail!("task {} not found", task_id),
        Some(TaskRecord::Finished(_)) => {}
        Some(record) => {
            eprintln!("Task {} is {}; showing archived lines only", task_id, record.stage());
        }
    }

    let archive = FileLogArchive::new(config.log_dir(), Arc::new(TaskLogManager::new()));
    for text in archive.get_log_lines(task_id, line, rows).await? {
        println!("{}", text);
    }
    Ok(())
}

/// Truncate a string for display
fn truncate(s: &str, max_len: usize) -> String {
    let s = s.replace('\n', " ");
    if s.chars().count() <= max_len {
        s
    } else {
        format!("{}...", s.chars().take(max_len).collect::<String>())
    }
}
