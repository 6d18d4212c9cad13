use cogloop::EngineConfig;
use cogloop::cli::{
    Args, ConfigDiscovery, ExecutionMode, RunConfig, Simulation, SubmissionLoader, ValidateConfig,
    describe_event, validate_submissions,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    let config = ConfigDiscovery::load(mode.config_override())?;

    // RUST_LOG wins over the configured filter
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if mode.verbose() {
            EnvFilter::new("cogloop=debug")
        } else {
            EnvFilter::new(&config.log_filter)
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting cogloop");

    match mode {
        ExecutionMode::Run(run) => run_mode(config, run).await,
        ExecutionMode::Validate(validate) => validate_mode(config, validate),
        ExecutionMode::ShowConfig { defaults } => {
            if defaults {
                print!("{}", EngineConfig::default().to_toml_string()?);
            } else {
                ConfigDiscovery::show_discovery_info();
            }
            Ok(())
        }
    }
}

async fn run_mode(config: EngineConfig, run: RunConfig) -> anyhow::Result<()> {
    let submissions = SubmissionLoader::load(&run.submissions)?;
    info!("Loaded {} submissions from {:?}", submissions.len(), run.submissions);

    let json = run.json;
    let report = Simulation::from_run_config(config, &run)
        .run(submissions, |event| {
            if json {
                match serde_json::to_string(event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => eprintln!("Could not encode event: {}", e),
                }
            } else {
                println!("{}", describe_event(event));
            }
        })
        .await?;

    if json {
        return Ok(());
    }

    println!();
    for rejected in &report.rejected {
        println!("Rejected submission #{}: {}", rejected.index, rejected.error);
    }
    for task in &report.tasks {
        match &task.status_reason {
            Some(reason) => println!("  task {:>4}  {:<10} {}", task.id, task.status, reason),
            None => println!("  task {:>4}  {}", task.id, task.status),
        }
    }

    let stats = &report.statistics;
    println!();
    println!(
        "{} tasks: {} completed, {} failed, {} pending, {} deferred",
        stats.total_tasks,
        stats.completed_tasks,
        stats.failed_tasks,
        stats.pending_tasks,
        stats.deferred_tasks
    );
    if report.timed_out {
        println!("Simulation timed out before the dispatcher went idle");
    }
    Ok(())
}

fn validate_mode(config: EngineConfig, validate: ValidateConfig) -> anyhow::Result<()> {
    let submissions = SubmissionLoader::load(&validate.submissions)?;
    let report = validate_submissions(&config, submissions);

    for accepted in &report.accepted {
        println!(
            "✓ submission #{} -> task {} ({})",
            accepted.index, accepted.task_id, accepted.status
        );
    }
    for rejected in &report.rejected {
        println!("✗ submission #{}: {}", rejected.index, rejected.error);
    }

    if !report.is_valid() {
        anyhow::bail!("{} submissions rejected", report.rejected.len());
    }
    Ok(())
}
