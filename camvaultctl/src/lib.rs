use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use camvault_core::{
    load_camvault_config, AcquisitionConfig, AppContext, CameraDirectory, CamvaultConfig,
    CommandSegmentFetcher, FfmpegToolkit, MergeConfig, MergeEngine, NewPlan, PlanRunner,
    PlanSupervisor, Routine, RoutineSelection, SegmentAcquisition, SqlitePlanStore, StorageLayout,
    SupervisorOptions, TaskRunOptions, TaskRunner, TaskStore,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] camvault_core::ConfigError),
    #[error("plan error: {0}")]
    Plan(#[from] camvault_core::PlanError),
    #[error("task error: {0}")]
    Task(#[from] camvault_core::TaskError),
    #[error("camera directory error: {0}")]
    Directory(#[from] camvault_core::DirectoryError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Camvault batch acquisition control interface", long_about = None)]
pub struct Cli {
    /// Caminho do camvault.toml principal
    #[arg(long, default_value = "configs/camvault.toml")]
    pub config: PathBuf,
    /// Caminho alternativo para plans.sqlite
    #[arg(long)]
    pub plans_db: Option<PathBuf>,
    /// Caminho alternativo para o diretório de câmeras (JSON)
    #[arg(long)]
    pub directory_file: Option<PathBuf>,
    /// Caminho alternativo para a pasta de task records
    #[arg(long)]
    pub tasks_dir: Option<PathBuf>,
    /// Diretório override para segmentos baixados
    #[arg(long)]
    pub downloaded_dir: Option<PathBuf>,
    /// Diretório override para vídeos mesclados
    #[arg(long)]
    pub merged_dir: Option<PathBuf>,
    /// Diretório override para downloads temporários
    #[arg(long)]
    pub tmp_download_dir: Option<PathBuf>,
    /// Diretório override para merges temporários
    #[arg(long)]
    pub tmp_merge_dir: Option<PathBuf>,
    /// Data de gravação (YYYY-MM-DD), sobrescreve o config
    #[arg(long)]
    pub capture_date: Option<chrono::NaiveDate>,
    /// Nível de log (trace, debug, info, warn, error)
    #[arg(long, short = 'l', default_value = "info")]
    pub loglevel: String,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Gerencia planos em lote
    #[command(subcommand)]
    Plan(PlanCommands),
    /// Processa task records individuais
    #[command(subcommand)]
    Task(TaskCommands),
    /// Gera shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum PlanCommands {
    /// Adiciona um plano
    Add(PlanAddArgs),
    /// Lista os planos registrados
    List,
    /// Remove um plano
    Rm { id: i64 },
    /// Marca "finished" = false para reprocessamento
    Restart { id: i64 },
    /// Processa todos os planos não finalizados
    Run(PlanRunArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RoutineArg {
    Download,
    Merge,
    Export,
}

impl From<RoutineArg> for Routine {
    fn from(value: RoutineArg) -> Self {
        match value {
            RoutineArg::Download => Routine::Download,
            RoutineArg::Merge => Routine::Merge,
            RoutineArg::Export => Routine::Export,
        }
    }
}

#[derive(Args, Debug)]
pub struct PlanAddArgs {
    #[arg(long, value_enum, default_value_t = RoutineArg::Download)]
    pub routine: RoutineArg,
    #[arg(long)]
    pub region: u32,
    #[arg(long)]
    pub first_unit: u32,
    #[arg(long)]
    pub last_unit: u32,
    #[arg(long, default_value_t = 7)]
    pub hour_start: u8,
    #[arg(long, default_value_t = 8)]
    pub hour_end: u8,
}

#[derive(Args, Debug)]
pub struct PlanRunArgs {
    /// Processa planos de download (padrão quando nenhuma rotina é passada)
    #[arg(long)]
    pub download: bool,
    /// Processa planos de merge
    #[arg(long)]
    pub merge: bool,
    /// Processa planos de export
    #[arg(long)]
    pub export: bool,
    #[arg(long)]
    pub num_download_workers: Option<usize>,
    #[arg(long)]
    pub num_merge_workers: Option<usize>,
    /// Limite de tentativas por segmento
    #[arg(long)]
    pub max_retries: Option<u32>,
    /// Segundos ausentes tolerados dentro da janela comercial
    #[arg(long)]
    pub gap_tolerance: Option<f64>,
    /// Permite merge de segmentos incompletos com tentativas restantes
    #[arg(long)]
    pub tolerate_incomplete: bool,
    /// Zera o contador de tentativas dos downloads
    #[arg(long, short = 'f')]
    pub force_download: bool,
    /// Sobrescreve arquivos já mesclados
    #[arg(long)]
    pub force_merge: bool,
}

#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Processa download tasks da pasta de tasks
    Download(TaskRunArgs),
    /// Processa merge tasks da pasta de tasks
    Merge(TaskRunArgs),
    /// Processa export tasks da pasta de tasks
    Export(TaskRunArgs),
    /// Marca todas as tasks "running" como "failed"
    FailRunning,
}

#[derive(Args, Debug)]
pub struct TaskRunArgs {
    /// Limite de workers (padrão: valor da rotina no config)
    #[arg(long)]
    pub num_workers: Option<usize>,
    /// Zera contadores de tentativas / sobrescreve saídas
    #[arg(long, short = 'f')]
    pub force: bool,
    /// Reprocessa tasks já finalizadas
    #[arg(long)]
    pub restart_finished: bool,
    /// Reprocessa tasks que falharam
    #[arg(long)]
    pub restart_failed: bool,
}

pub async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(*shell, &mut command, "camvaultctl", &mut std::io::stdout());
            Ok(())
        }
        Commands::Plan(plan_command) => run_plan(&cli, plan_command).await,
        Commands::Task(task_command) => run_task(&cli, task_command).await,
    }
}

async fn run_plan(cli: &Cli, command: &PlanCommands) -> Result<()> {
    let config = load_config(cli)?;

    match command {
        PlanCommands::Add(args) => {
            let store = open_store(&config)?;
            let record = store.insert(&NewPlan {
                routine: args.routine.into(),
                region: args.region,
                first_unit: args.first_unit,
                last_unit: args.last_unit,
                hour_start: args.hour_start,
                hour_end: args.hour_end,
            })?;
            render(&record)
        }
        PlanCommands::List => {
            let store = open_store(&config)?;
            render(&store.list()?)
        }
        PlanCommands::Rm { id } => {
            let store = open_store(&config)?;
            store.delete(*id)?;
            println!("Plan {id} removed");
            Ok(())
        }
        PlanCommands::Restart { id } => {
            let store = open_store(&config)?;
            store.set_finished(*id, false)?;
            println!("Plan {id} successfully changed \"finished\" to \"false\"");
            Ok(())
        }
        PlanCommands::Run(args) => {
            let mut config = config;
            if let Some(workers) = args.num_download_workers {
                config.workers.download = workers;
            }
            if let Some(workers) = args.num_merge_workers {
                config.workers.merge = workers;
            }
            if let Some(retries) = args.max_retries {
                config.download.max_retries = retries;
            }
            if let Some(tolerance) = args.gap_tolerance {
                config.merge.gap_tolerance_s = tolerance;
            }
            if args.tolerate_incomplete {
                config.merge.tolerate_incomplete = true;
            }
            config.validate()?;

            let select = if args.download || args.merge || args.export {
                RoutineSelection {
                    download: args.download,
                    merge: args.merge,
                    export: args.export,
                }
            } else {
                RoutineSelection::default()
            };

            let context = AppContext::new(config);
            install_interrupt_handler(&context);
            let (supervisor, store) =
                build_supervisor(&context, args.force_download, args.force_merge)?;
            let runner = PlanRunner::new(context, supervisor, store);
            let summary = runner.run_unfinished(select).await?;
            render(&summary)
        }
    }
}

async fn run_task(cli: &Cli, command: &TaskCommands) -> Result<()> {
    let config = load_config(cli)?;
    let tasks_dir = config.resolve_path(&config.paths.tasks_dir);
    if !tasks_dir.is_dir() {
        return Err(AppError::MissingResource(format!(
            "tasks directory {} does not exist",
            tasks_dir.display()
        )));
    }
    let store = TaskStore::new(&tasks_dir);

    if let TaskCommands::FailRunning = command {
        let invalidated = store.fail_running().await?;
        println!("{invalidated} running tasks marked as failed");
        return Ok(());
    }

    let (kind, args) = match command {
        TaskCommands::Download(args) => (Routine::Download, args),
        TaskCommands::Merge(args) => (Routine::Merge, args),
        TaskCommands::Export(args) => (Routine::Export, args),
        TaskCommands::FailRunning => unreachable!("handled above"),
    };

    let workers = args.num_workers.unwrap_or(match kind {
        Routine::Download => config.workers.download,
        Routine::Merge => config.workers.merge,
        Routine::Export => config.workers.export,
    });
    let options = TaskRunOptions {
        restart_finished: args.restart_finished,
        restart_failed: args.restart_failed,
        force: args.force,
        workers,
    };

    let context = AppContext::new(config);
    install_interrupt_handler(&context);
    let runner = build_task_runner(&context, store)?;
    let summary = runner.process(kind, options).await?;
    render(&summary)
}

fn load_config(cli: &Cli) -> Result<CamvaultConfig> {
    let mut config = load_camvault_config(&cli.config)?;
    if let Some(path) = &cli.plans_db {
        config.paths.plans_db = path.display().to_string();
    }
    if let Some(path) = &cli.directory_file {
        config.paths.directory_file = path.display().to_string();
    }
    if let Some(path) = &cli.tasks_dir {
        config.paths.tasks_dir = path.display().to_string();
    }
    if let Some(path) = &cli.downloaded_dir {
        config.paths.downloaded_dir = path.display().to_string();
    }
    if let Some(path) = &cli.merged_dir {
        config.paths.merged_dir = path.display().to_string();
    }
    if let Some(path) = &cli.tmp_download_dir {
        config.paths.tmp_download_dir = path.display().to_string();
    }
    if let Some(path) = &cli.tmp_merge_dir {
        config.paths.tmp_merge_dir = path.display().to_string();
    }
    if let Some(date) = cli.capture_date {
        config.capture.date = date;
    }
    Ok(config)
}

fn open_store(config: &CamvaultConfig) -> Result<SqlitePlanStore> {
    let store = SqlitePlanStore::new(config.resolve_path(&config.paths.plans_db))?;
    store.initialize()?;
    Ok(store)
}

fn build_engines(
    context: &AppContext,
) -> (Arc<SegmentAcquisition>, Arc<MergeEngine>, StorageLayout) {
    let config = &context.config;
    let toolkit = Arc::new(FfmpegToolkit::new(
        &config.media.ffmpeg,
        &config.media.ffprobe,
    ));
    let fetcher = Arc::new(CommandSegmentFetcher::new(&config.download.fetch_command));
    let acquisition = Arc::new(SegmentAcquisition::new(
        fetcher,
        toolkit.clone(),
        AcquisitionConfig {
            max_retries: config.download.max_retries,
            nominal_duration: config.download.segment_duration_s,
            pts_tolerance: config.download.pts_tolerance_s,
            backoff_base: Duration::from_secs(config.download.backoff_base_s),
            backoff_factor: config.download.backoff_factor,
        },
    ));
    let merge = Arc::new(MergeEngine::new(
        toolkit.clone(),
        toolkit,
        MergeConfig {
            window_start_hour: config.merge.window_start_hour,
            window_end_hour: config.merge.window_end_hour,
            gap_tolerance: config.merge.gap_tolerance_s,
            tolerate_incomplete: config.merge.tolerate_incomplete,
            max_retries: config.download.max_retries,
            nominal_duration: config.download.segment_duration_s,
            segment_ext: config.media.segment_ext.clone(),
        },
    ));
    (acquisition, merge, StorageLayout::from_config(config))
}

fn build_supervisor(
    context: &AppContext,
    force_download: bool,
    force_merge: bool,
) -> Result<(Arc<PlanSupervisor>, SqlitePlanStore)> {
    let config = &context.config;
    let store = open_store(config)?;
    let directory = Arc::new(CameraDirectory::load(
        config.resolve_path(&config.paths.directory_file),
    )?);
    let (acquisition, merge, layout) = build_engines(context);
    let supervisor = Arc::new(PlanSupervisor::new(
        store.clone(),
        directory,
        layout,
        acquisition,
        merge,
        SupervisorOptions {
            capture_date: config.capture.date,
            force_download: force_download || config.download.force,
            force_merge: force_merge || config.merge.force,
        },
    ));
    Ok((supervisor, store))
}

fn build_task_runner(context: &AppContext, store: TaskStore) -> Result<TaskRunner> {
    let (acquisition, merge, layout) = build_engines(context);
    Ok(TaskRunner::new(
        context.clone(),
        store,
        layout,
        acquisition,
        merge,
    ))
}

fn install_interrupt_handler(context: &AppContext) {
    let shutdown = context.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, refusing further admission");
            shutdown.cancel();
        }
    });
}

fn render<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_plan_add() {
        let cli = Cli::parse_from([
            "camvaultctl",
            "plan",
            "add",
            "--region",
            "66",
            "--first-unit",
            "1",
            "--last-unit",
            "40",
            "--hour-start",
            "8",
            "--hour-end",
            "20",
        ]);
        match cli.command {
            Commands::Plan(PlanCommands::Add(args)) => {
                assert_eq!(args.region, 66);
                assert_eq!(args.hour_end, 20);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_parses_task_flags() {
        let cli = Cli::parse_from([
            "camvaultctl",
            "--tasks-dir",
            "/tmp/tasks",
            "task",
            "download",
            "--restart-failed",
            "--num-workers",
            "16",
        ]);
        assert_eq!(cli.tasks_dir, Some(PathBuf::from("/tmp/tasks")));
        match cli.command {
            Commands::Task(TaskCommands::Download(args)) => {
                assert!(args.restart_failed);
                assert!(!args.restart_finished);
                assert_eq!(args.num_workers, Some(16));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_debug_assert() {
        Cli::command().debug_assert();
    }
}
