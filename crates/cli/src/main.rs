use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{LevelFilter, Log, Metadata, Record};
use novelgate_adapters::{create_llm_adapter, AdapterError, FileBlobStore};
use novelgate_core::{
    finished_result, request_pause, take_finished_result, BatchScorer, BlobCheckpointStore,
    Chapter, ConfigError, ConfigStore, ErrorReason, FacadeLogSink, GenerationRequestPayload,
    HeuristicScorer, InvokeOptions, LanguageModelError, OrchestratorError, ProgressEvent,
    PromptError, PromptRegistry, RequestError, RunOutcome, StoreError, TaskCheckpointStore,
    TaskController, TaskError, TaskRun,
};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    install_logger(cli.log_level.into());

    if let Err(err) = run(cli).await {
        eprintln!("Error: {err}");
        std::process::exit(err.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Generate(args) => run_generate(&cli.config, &cli.state_dir, args).await,
        Command::Resume(args) => run_resume(&cli.config, &cli.state_dir, args).await,
        Command::Tasks(command) => handle_tasks(&cli.state_dir, command).await,
        Command::Score(args) => run_score(&cli.config, args),
        Command::Config(command) => match command {
            ConfigCommand::TestLlm(args) => run_test_llm(&cli.config, args).await,
        },
    }
}

async fn run_generate(
    config_path: &Path,
    state_dir: &Path,
    args: GenerateArgs,
) -> Result<(), CliError> {
    let raw = read_file(&args.request)?;
    let payload = checked_payload(&raw, &mut io::stdout().lock())?;

    let controller = open_controller(config_path, state_dir, args.llm_interface)?;
    let run = controller.submit(payload).await?;
    log::info!("任务 {} 已启动", run.task_id);
    drive(run).await
}

async fn run_resume(
    config_path: &Path,
    state_dir: &Path,
    args: ResumeArgs,
) -> Result<(), CliError> {
    let controller = open_controller(config_path, state_dir, args.llm_interface)?;
    let run = controller.resume(&args.task).await?;
    log::info!("任务 {} 从检查点继续", run.task_id);
    drive(run).await
}

/// A rejected request still ends the event stream with one `error` line, so
/// consumers see the same shape as for a failed run.
fn checked_payload(
    raw: &str,
    out: &mut impl Write,
) -> Result<GenerationRequestPayload, CliError> {
    let checked = GenerationRequestPayload::from_json_str(raw)
        .and_then(|payload| payload.clone().validate().map(|_| payload));
    match checked {
        Ok(payload) => Ok(payload),
        Err(err) => {
            let event = ProgressEvent::error(ErrorReason::Validation, err.to_string());
            write_event(out, &event)?;
            Err(err.into())
        }
    }
}

fn write_event(out: &mut impl Write, event: &ProgressEvent) -> Result<(), CliError> {
    let line = serde_json::to_string(event)?;
    writeln!(out, "{line}").map_err(|source| CliError::Io {
        path: PathBuf::from("<stdout>"),
        source,
    })
}

/// Streams every progress event as one JSON line, then maps the outcome.
async fn drive(mut run: TaskRun) -> Result<(), CliError> {
    let stdout = io::stdout();
    while let Some(event) = run.events.recv().await {
        write_event(&mut stdout.lock(), &event)?;
    }

    match run.handle.await?? {
        RunOutcome::Completed { summary, .. } => {
            log::info!(
                "任务 {} 完成：{} 章，共 {} 字，平均分 {:.1}",
                run.task_id,
                summary.chapter_count,
                summary.total_words,
                summary.average_score
            );
            Ok(())
        }
        RunOutcome::Paused { completed } => {
            log::info!(
                "任务 {} 已暂停（已完成 {} 章），可使用 `resume --task {}` 继续",
                run.task_id,
                completed,
                run.task_id
            );
            Ok(())
        }
        RunOutcome::QualityFailed { report, .. } => Err(CliError::QualityFailed {
            task_id: run.task_id,
            average_score: report.average_score,
        }),
    }
}

async fn handle_tasks(state_dir: &Path, command: TasksCommand) -> Result<(), CliError> {
    let store = open_store(state_dir);
    match command {
        TasksCommand::List => {
            for state in store.list().await? {
                let line = serde_json::json!({
                    "taskId": state.task_id,
                    "phase": state.phase,
                    "progress": state.progress,
                    "paused": state.paused,
                    "createdAt": state.created_at,
                });
                println!("{line}");
            }
        }
        TasksCommand::Show(args) => {
            let state = store.get(&args.task).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        TasksCommand::Pause(args) => {
            request_pause(store.as_ref(), &args.task).await?;
            log::info!("任务 {} 将在下一章开始前暂停", args.task);
        }
        TasksCommand::Delete(args) => {
            if store.delete(&args.task).await? {
                log::info!("任务 {} 已删除", args.task);
            } else {
                log::warn!("任务 {} 不存在", args.task);
            }
        }
        TasksCommand::Result(args) => {
            let result = if args.take {
                take_finished_result(store.as_ref(), &args.task.task).await?
            } else {
                finished_result(store.as_ref(), &args.task.task).await?
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}

fn run_score(config_path: &Path, args: ScoreArgs) -> Result<(), CliError> {
    let store = ConfigStore::open(config_path.to_path_buf())?;
    let pipeline = &store.config().pipeline;
    let scorer =
        HeuristicScorer::from_config(pipeline).with_fast_mode(args.fast || pipeline.fast_scoring);
    let gate = scorer.gate();
    log::debug!(
        "质量门：平均分不低于 {:.1}，平均扣分不高于 {:.1}",
        gate.min_average_score,
        gate.max_average_penalty
    );

    let mut chapters = Vec::with_capacity(args.files.len());
    for (index, path) in args.files.iter().enumerate() {
        let title = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("第{}章", index + 1));
        let mut chapter = Chapter::new(index as u32 + 1, title, "");
        chapter.set_content(read_file(path)?);
        chapters.push(chapter);
    }

    let report = scorer.score(&chapters);
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.passes_threshold {
        Ok(())
    } else {
        Err(CliError::BelowThreshold(report.average_score))
    }
}

async fn run_test_llm(config_path: &Path, args: TestLlmArgs) -> Result<(), CliError> {
    let mut store = ConfigStore::open(config_path.to_path_buf())?;
    store.ensure_recent_defaults();

    let selected = select_llm_interface(&store, args.interface)?;
    let profile = store
        .config()
        .get_llm_profile(&selected)
        .ok_or_else(|| CliError::UnknownInterface(selected.clone()))?;

    log::info!("开始测试 LLM 配置：{selected}");
    log::debug!(
        "模型: {} | 接口模式: {} | Base URL: {}",
        profile.model_name,
        profile.interface_format,
        profile.base_url
    );

    let adapter = create_llm_adapter(store.config(), &selected)?;
    let response = adapter
        .invoke("Please reply 'OK'", &InvokeOptions::default())
        .await?;
    if response.trim().is_empty() {
        return Err(CliError::TestFailed(
            "LLM配置测试失败：未获取到响应".to_string(),
        ));
    }
    log::info!("LLM配置测试成功");
    log::debug!("测试回复: {response}");

    store.touch_llm_interface(selected);
    store.save()?;
    Ok(())
}

fn open_store(state_dir: &Path) -> Arc<BlobCheckpointStore<FileBlobStore>> {
    Arc::new(BlobCheckpointStore::new(FileBlobStore::new(state_dir)))
}

fn open_controller(
    config_path: &Path,
    state_dir: &Path,
    preferred: Option<String>,
) -> Result<TaskController, CliError> {
    let mut store = ConfigStore::open(config_path.to_path_buf())?;
    store.ensure_recent_defaults();

    let selected = select_llm_interface(&store, preferred)?;
    let model = create_llm_adapter(store.config(), &selected)?;
    let prompts = PromptRegistry::from_prompt_config(&store.config().prompts)?;
    log::info!("使用 LLM 接口：{selected}");

    let controller = TaskController::new(
        model,
        open_store(state_dir),
        Arc::new(prompts),
        Arc::new(FacadeLogSink::with_target("novelgate")),
        store.config().pipeline.clone(),
    );

    store.touch_llm_interface(selected);
    store.save()?;
    Ok(controller)
}

fn select_llm_interface(
    store: &ConfigStore,
    preferred: Option<String>,
) -> Result<String, CliError> {
    let preferred = preferred
        .map(|raw| raw.trim().to_string())
        .filter(|name| !name.is_empty());
    if let Some(name) = preferred {
        return if store.config().llm_profiles.contains_key(&name) {
            Ok(name)
        } else {
            Err(CliError::UnknownInterface(name))
        };
    }

    store
        .last_llm_interface()
        .map(str::to_string)
        .or_else(|| store.config().llm_profiles.keys().next().cloned())
        .ok_or(CliError::MissingLlmProfile)
}

fn read_file(path: &Path) -> Result<String, CliError> {
    fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes `LEVEL target: message` lines to stderr; stdout carries only
/// progress events and results.
struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("{:<5} {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

fn install_logger(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("配置文件错误: {0}")]
    Config(#[from] ConfigError),
    #[error("缺少可用的 LLM 配置，请先在配置文件中添加 llm_profiles。")]
    MissingLlmProfile,
    #[error("未找到名为 `{0}` 的接口配置")]
    UnknownInterface(String),
    #[error("读取文件 `{path}` 失败: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("请求无效: {0}")]
    Request(#[from] RequestError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("任务存储失败: {0}")]
    Store(#[from] StoreError),
    #[error("适配器调用失败: {0}")]
    Adapter(#[from] AdapterError),
    #[error("LLM 调用失败: {0}")]
    Model(#[from] LanguageModelError),
    #[error("提示词加载失败: {0}")]
    Prompt(#[from] PromptError),
    #[error("生成任务失败: {0}")]
    Run(#[from] OrchestratorError),
    #[error("后台任务异常退出: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("输出序列化失败: {0}")]
    Json(#[from] serde_json::Error),
    #[error("任务 {task_id} 未通过质量审核（平均分 {average_score:.1}）")]
    QualityFailed { task_id: String, average_score: f64 },
    #[error("平均分 {0:.1} 未达到质量阈值")]
    BelowThreshold(f64),
    #[error("{0}")]
    TestFailed(String),
}

impl CliError {
    /// 2 means the content was rejected, 1 means the run itself failed.
    fn exit_code(&self) -> i32 {
        match self {
            CliError::QualityFailed { .. } | CliError::BelowThreshold(_) => 2,
            _ => 1,
        }
    }
}

#[derive(Parser)]
#[command(
    name = "novelgate",
    version,
    about = "质量门控、可断点续跑的长篇章节批量生成工具"
)]
struct Cli {
    /// 指定配置文件路径
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    /// 任务检查点目录
    #[arg(long, global = true, default_value = ".novelgate")]
    state_dir: PathBuf,

    /// 输出到 stderr 的日志级别
    #[arg(long, global = true, value_enum, default_value_t = LogLevelArg::Info)]
    log_level: LogLevelArg,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevelArg {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LevelFilter {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Off => LevelFilter::Off,
            LogLevelArg::Error => LevelFilter::Error,
            LogLevelArg::Warn => LevelFilter::Warn,
            LogLevelArg::Info => LevelFilter::Info,
            LogLevelArg::Debug => LevelFilter::Debug,
            LogLevelArg::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// 提交生成请求并输出 JSON 行格式的进度事件
    Generate(GenerateArgs),
    /// 从检查点继续一个已暂停或中断的任务
    Resume(ResumeArgs),
    /// 任务管理
    #[command(subcommand)]
    Tasks(TasksCommand),
    /// 对本地章节文件进行质量评分
    Score(ScoreArgs),
    /// 配置相关操作
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum TasksCommand {
    /// 列出全部任务
    List,
    /// 查看任务完整状态
    Show(TaskArgs),
    /// 请求暂停任务
    Pause(TaskArgs),
    /// 删除任务及其检查点
    Delete(TaskArgs),
    /// 获取已结束任务的结果
    Result(ResultArgs),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// 测试当前 LLM 接口配置
    TestLlm(TestLlmArgs),
}

#[derive(Args)]
struct GenerateArgs {
    /// JSON 格式的生成请求文件
    #[arg(long, value_name = "FILE")]
    request: PathBuf,
    /// 指定用于生成的 LLM 接口名称，默认为最近使用的接口
    #[arg(long)]
    llm_interface: Option<String>,
}

#[derive(Args)]
struct ResumeArgs {
    /// 任务 ID
    #[arg(long, value_name = "ID")]
    task: String,
    /// 指定用于生成的 LLM 接口名称，默认为最近使用的接口
    #[arg(long)]
    llm_interface: Option<String>,
}

#[derive(Args)]
struct TaskArgs {
    /// 任务 ID
    #[arg(long, value_name = "ID")]
    task: String,
}

#[derive(Args)]
struct ResultArgs {
    #[command(flatten)]
    task: TaskArgs,
    /// 取回结果后删除任务
    #[arg(long)]
    take: bool,
}

#[derive(Args)]
struct ScoreArgs {
    /// 章节文本文件，按给定顺序视为第 1..N 章
    #[arg(required = true, value_name = "FILE")]
    files: Vec<PathBuf>,
    /// 跳过低权重规则
    #[arg(long)]
    fast: bool,
}

#[derive(Args)]
struct TestLlmArgs {
    /// 指定要测试的接口名称，默认为最近使用的接口
    #[arg(long)]
    interface: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_line_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_generate_with_globals() {
        let cli = Cli::try_parse_from([
            "novelgate",
            "--log-level",
            "debug",
            "generate",
            "--request",
            "req.json",
            "--state-dir",
            "/tmp/state",
        ])
        .unwrap();
        assert_eq!(cli.state_dir, PathBuf::from("/tmp/state"));
        assert!(matches!(cli.log_level, LogLevelArg::Debug));
        match cli.command {
            Command::Generate(args) => {
                assert_eq!(args.request, PathBuf::from("req.json"));
                assert!(args.llm_interface.is_none());
            }
            _ => panic!("expected generate"),
        }
    }

    #[test]
    fn score_requires_files() {
        assert!(Cli::try_parse_from(["novelgate", "score"]).is_err());
        let cli = Cli::try_parse_from(["novelgate", "score", "a.txt", "b.txt", "--fast"]).unwrap();
        match cli.command {
            Command::Score(args) => {
                assert_eq!(args.files.len(), 2);
                assert!(args.fast);
            }
            _ => panic!("expected score"),
        }
    }

    #[test]
    fn rejected_request_ends_with_a_validation_event() {
        let mut out = Vec::new();
        let raw = r#"{"chapterCount":0,"targetWordCount":100,"outline":"x"}"#;
        let err = checked_payload(raw, &mut out).unwrap_err();
        assert!(matches!(err, CliError::Request(RequestError::ChapterCountOutOfRange(0))));

        let text = String::from_utf8(out).unwrap();
        let last = text.lines().last().unwrap();
        let event: serde_json::Value = serde_json::from_str(last).unwrap();
        assert_eq!(event["step"], "error");
        assert_eq!(event["status"], "error");
        assert_eq!(event["reason"], "validation");
    }

    #[test]
    fn malformed_request_is_reported_as_validation() {
        let mut out = Vec::new();
        assert!(checked_payload("{not json", &mut out).is_err());
        let event: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(event["reason"], "validation");
    }

    #[test]
    fn valid_request_writes_nothing() {
        let mut out = Vec::new();
        let raw = r#"{"chapterCount":2,"targetWordCount":500,"outline":"第1章\n第2章"}"#;
        let payload = checked_payload(raw, &mut out).unwrap();
        assert_eq!(payload.chapter_count, 2);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn taking_an_unfinished_result_keeps_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let request = GenerationRequestPayload {
            chapter_count: 1,
            target_word_count: 500,
            outline: "第1章 出发".into(),
            ..GenerationRequestPayload::default()
        }
        .validate()
        .unwrap();
        let task_id = open_store(dir.path()).create(request, 3).await.unwrap();

        let take = TasksCommand::Result(ResultArgs {
            task: TaskArgs {
                task: task_id.clone(),
            },
            take: true,
        });
        let err = handle_tasks(dir.path(), take).await.unwrap_err();
        assert!(matches!(err, CliError::Task(TaskError::NotFinished { .. })));
        assert!(open_store(dir.path()).get(&task_id).await.is_ok());

        let pause = TasksCommand::Pause(TaskArgs {
            task: task_id.clone(),
        });
        handle_tasks(dir.path(), pause).await.unwrap();
        assert!(open_store(dir.path()).get(&task_id).await.unwrap().paused);
    }

    #[test]
    fn explicit_interface_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("config.json")).unwrap();
        assert!(matches!(
            select_llm_interface(&store, None),
            Err(CliError::MissingLlmProfile)
        ));
        assert!(matches!(
            select_llm_interface(&store, Some("ghost".into())),
            Err(CliError::UnknownInterface(name)) if name == "ghost"
        ));
    }
}
