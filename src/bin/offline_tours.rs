use std::path::Path;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use miette::IntoDiagnostic;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use offline_tours::app::{HttpApp, load_tour_file};
use offline_tours::config::ConfigLoader;
use offline_tours::domain::{CompletionRecord, ImageKey, Reachability, StopId, TourId, UserId};
use offline_tours::error::TourError;
use offline_tours::output::{JsonOutput, OutputMode, StderrProgress};
use offline_tours::reconciler::MarkOutcome;
use offline_tours::resolve::{AssetLocation, AssetRef};

#[derive(Parser)]
#[command(name = "offline-tours")]
#[command(about = "Offline cache and progress sync for guided audio tours")]
#[command(version, author)]
struct Cli {
    /// Path to a tours.json config file.
    #[arg(long, global = true)]
    config: Option<String>,

    /// Never contact the remote backend.
    #[arg(long, global = true)]
    offline: bool,

    /// Print results as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Manage offline tour content")]
    Tour(TourArgs),
    #[command(about = "Record and sync stop completions")]
    Progress(ProgressArgs),
}

#[derive(Args)]
struct TourArgs {
    #[command(subcommand)]
    command: TourCommand,
}

#[derive(Subcommand)]
enum TourCommand {
    #[command(about = "Download a tour from a definition file or by id")]
    Download { source: String },
    #[command(about = "Show whether a tour is available offline")]
    Status { tour: String },
    #[command(about = "Delete the offline copy of a tour")]
    Remove { tour: String },
    #[command(about = "List tours available offline")]
    List,
    #[command(about = "Total bytes used by offline tours")]
    Usage,
    #[command(about = "Resolve where an asset can be played from")]
    Locate(LocateArgs),
}

#[derive(Args)]
struct LocateArgs {
    /// Tour id, or a tour definition file.
    tour: String,
    #[arg(value_enum)]
    kind: AssetArg,
    /// Stop id, or for images `cover`.
    key: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum AssetArg {
    Audio,
    Image,
}

#[derive(Args)]
struct ProgressArgs {
    #[command(subcommand)]
    command: ProgressCommand,
}

#[derive(Subcommand)]
enum ProgressCommand {
    #[command(about = "Mark a stop as completed")]
    Mark {
        user: String,
        stop: String,
        #[arg(long)]
        tour: Option<String>,
    },
    #[command(about = "List completed stops")]
    List {
        user: String,
        #[arg(long)]
        tour: Option<String>,
    },
    #[command(about = "Check whether a stop is completed")]
    Check { user: String, stop: String },
    #[command(about = "Count completed stops")]
    Count { user: String },
    #[command(about = "Push queued completions to the remote")]
    Sync { user: String },
    #[command(about = "Erase all progress for a user")]
    Clear { user: String },
}

#[derive(Serialize)]
struct MarkResult {
    user_id: UserId,
    stop_id: StopId,
    outcome: MarkOutcome,
}

#[derive(Serialize)]
struct CompletionList {
    user_id: UserId,
    completions: Vec<CompletionRecord>,
}

#[derive(Serialize)]
struct CountResult {
    user_id: UserId,
    completed: u64,
    pending: usize,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<TourError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &TourError) -> u8 {
    match error {
        TourError::TourNotFound(_)
        | TourError::InvalidTourId(_)
        | TourError::InvalidStopId(_)
        | TourError::InvalidUserId(_)
        | TourError::InvalidImageKey(_) => 2,
        TourError::RemoteHttp(_)
        | TourError::RemoteStatus { .. }
        | TourError::RemoteNotConfigured
        | TourError::Transfer(_) => 3,
        TourError::AlreadyDownloading(_) => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };
    let reachability = if cli.offline {
        Reachability::Offline
    } else {
        Reachability::Unknown
    };

    let resolved = ConfigLoader::resolve(cli.config.as_deref())?;
    let app = HttpApp::from_config(&resolved)?;

    match cli.command {
        Commands::Tour(args) => run_tour(args.command, &app, reachability, output_mode),
        Commands::Progress(args) => run_progress(args.command, &app, reachability, output_mode),
    }
}

fn run_tour(
    command: TourCommand,
    app: &HttpApp,
    reachability: Reachability,
    output_mode: OutputMode,
) -> miette::Result<()> {
    match command {
        TourCommand::Download { source } => {
            let result = match output_mode {
                OutputMode::Json => app.download(&source, reachability, &JsonOutput)?,
                OutputMode::Human => app.download(&source, reachability, &StderrProgress)?,
            };
            match output_mode {
                OutputMode::Json => JsonOutput::print_download(&result).into_diagnostic()?,
                OutputMode::Human if result.cached => println!(
                    "{}: {} files, {} bytes",
                    result.tour_id,
                    result.status.files.unwrap_or(0),
                    result.status.size.unwrap_or(0)
                ),
                OutputMode::Human => {
                    return Err(miette::Report::msg(format!(
                        "tour {} was not cached",
                        result.tour_id
                    )));
                }
            }
            Ok(())
        }
        TourCommand::Status { tour } => {
            let tour: TourId = tour.parse()?;
            let status = app.tour_status(&tour);
            match output_mode {
                OutputMode::Json => JsonOutput::print_status(&status).into_diagnostic()?,
                OutputMode::Human if status.available_offline => println!(
                    "{tour}: offline ({} files, {} bytes)",
                    status.files.unwrap_or(0),
                    status.size.unwrap_or(0)
                ),
                OutputMode::Human => println!("{tour}: not cached"),
            }
            Ok(())
        }
        TourCommand::Remove { tour } => {
            let tour: TourId = tour.parse()?;
            app.cache().remove_content(&tour)?;
            if output_mode == OutputMode::Human {
                println!("{tour}: removed");
            }
            Ok(())
        }
        TourCommand::List => {
            let result = app.list();
            match output_mode {
                OutputMode::Json => JsonOutput::print_list(&result).into_diagnostic()?,
                OutputMode::Human => {
                    for entry in &result.tours {
                        println!(
                            "{}\t{}\t{} stops\t{} bytes",
                            entry.tour_id, entry.title, entry.stops, entry.size
                        );
                    }
                }
            }
            Ok(())
        }
        TourCommand::Usage => {
            let result = app.usage();
            match output_mode {
                OutputMode::Json => JsonOutput::print_usage(&result).into_diagnostic()?,
                OutputMode::Human => {
                    println!("{} tours, {} bytes", result.tours, result.bytes)
                }
            }
            Ok(())
        }
        TourCommand::Locate(args) => {
            let asset = match args.kind {
                AssetArg::Audio => AssetRef::Audio(args.key.parse::<StopId>()?),
                AssetArg::Image if args.key == "cover" => AssetRef::Image(ImageKey::Cover),
                AssetArg::Image => AssetRef::Image(ImageKey::Stop(args.key.parse::<StopId>()?)),
            };
            let location = if Path::new(&args.tour).is_file() {
                let definition = load_tour_file(Path::new(&args.tour))?;
                app.cache()
                    .resolve_definition_asset(&definition, &asset, reachability)
            } else {
                let tour: TourId = args.tour.parse()?;
                app.cache().resolve_asset(&tour, &asset, reachability)
            };
            match (output_mode, location) {
                (OutputMode::Json, location) => {
                    JsonOutput::print_json(&location).into_diagnostic()?
                }
                (OutputMode::Human, Some(AssetLocation::File(path))) => println!("{path}"),
                (OutputMode::Human, Some(AssetLocation::Url(url))) => println!("{url}"),
                (OutputMode::Human, None) => {
                    return Err(miette::Report::msg("asset not available"));
                }
            }
            Ok(())
        }
    }
}

fn run_progress(
    command: ProgressCommand,
    app: &HttpApp,
    reachability: Reachability,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let reconciler = app.progress();
    match command {
        ProgressCommand::Mark { user, stop, tour } => {
            let user: UserId = user.parse()?;
            let stop: StopId = stop.parse()?;
            let tour = tour.map(|tour| tour.parse::<TourId>()).transpose()?;
            let outcome = reconciler.mark_completed(&user, &stop, tour, reachability)?;
            let result = MarkResult {
                user_id: user,
                stop_id: stop,
                outcome,
            };
            match output_mode {
                OutputMode::Json => JsonOutput::print_json(&result).into_diagnostic()?,
                OutputMode::Human => {
                    println!("{} {}: {:?}", result.user_id, result.stop_id, result.outcome)
                }
            }
            Ok(())
        }
        ProgressCommand::List { user, tour } => {
            let user: UserId = user.parse()?;
            let completions = match tour {
                Some(tour) => reconciler.get_completed_for_tour(&user, &tour.parse::<TourId>()?)?,
                None => reconciler.get_completed_stops(&user, reachability)?,
            };
            match output_mode {
                OutputMode::Json => JsonOutput::print_json(&CompletionList {
                    user_id: user,
                    completions,
                })
                .into_diagnostic()?,
                OutputMode::Human => {
                    for record in &completions {
                        let tour = record.tour_id.as_ref().map(TourId::as_str).unwrap_or("-");
                        println!(
                            "{}\t{tour}\t{}\t{:?}",
                            record.stop_id,
                            record.completed_at.to_rfc3339(),
                            record.sync_state
                        );
                    }
                }
            }
            Ok(())
        }
        ProgressCommand::Check { user, stop } => {
            let user: UserId = user.parse()?;
            let stop: StopId = stop.parse()?;
            let completed = reconciler.is_completed(&user, &stop, reachability);
            match output_mode {
                OutputMode::Json => JsonOutput::print_json(&completed).into_diagnostic()?,
                OutputMode::Human => println!("{completed}"),
            }
            Ok(())
        }
        ProgressCommand::Count { user } => {
            let user: UserId = user.parse()?;
            let result = CountResult {
                completed: reconciler.get_total_completed_count(&user, reachability)?,
                pending: reconciler.progress().pending_count(&user)?,
                user_id: user,
            };
            match output_mode {
                OutputMode::Json => JsonOutput::print_json(&result).into_diagnostic()?,
                OutputMode::Human => {
                    println!("{} completed, {} pending", result.completed, result.pending)
                }
            }
            Ok(())
        }
        ProgressCommand::Sync { user } => {
            let user: UserId = user.parse()?;
            let report = reconciler.sync_pending(&user, reachability)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_json(&report).into_diagnostic()?,
                OutputMode::Human => {
                    println!("{} synced, {} pending", report.applied, report.remaining)
                }
            }
            Ok(())
        }
        ProgressCommand::Clear { user } => {
            let user: UserId = user.parse()?;
            let report = reconciler.clear_all_progress(&user, reachability)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_json(&report).into_diagnostic()?,
                OutputMode::Human if report.remote_cleared => println!("{user}: cleared"),
                OutputMode::Human => println!("{user}: cleared locally"),
            }
            Ok(())
        }
    }
}
