use std::fmt;

use progress_core::model::{LessonId, LessonRef, ModuleId};
use storage::sqlite::SqliteRepository;

#[derive(Debug, Clone)]
struct Args {
    db_url: String,
    module_id: ModuleId,
    lessons: u32,
    steps_per_lesson: u32,
    legacy_ids: bool,
}

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    UnknownArg(String),
    InvalidModuleId { raw: String },
    InvalidLessons { raw: String },
    InvalidSteps { raw: String },
    InvalidDbUrl { raw: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidModuleId { raw } => write!(f, "invalid --module-id value: {raw}"),
            ArgsError::InvalidLessons { raw } => write!(f, "invalid --lessons value: {raw}"),
            ArgsError::InvalidSteps { raw } => write!(f, "invalid --steps value: {raw}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
        }
    }
}

impl std::error::Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

impl Args {
    fn parse() -> Result<Self, ArgsError> {
        let mut db_url =
            std::env::var("PROGRESS_DB_URL").unwrap_or_else(|_| "sqlite:dev.sqlite3".into());
        let mut module_id = std::env::var("PROGRESS_MODULE_ID")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .map_or_else(|| ModuleId::new(1), ModuleId::new);
        let mut lessons = std::env::var("PROGRESS_LESSONS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(3);
        let mut steps_per_lesson = std::env::var("PROGRESS_STEPS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(5);
        let mut legacy_ids = false;

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(&mut args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = value;
                }
                "--module-id" => {
                    let value = require_value(&mut args, "--module-id")?;
                    let parsed: u64 = value
                        .parse()
                        .map_err(|_| ArgsError::InvalidModuleId { raw: value.clone() })?;
                    module_id = ModuleId::new(parsed);
                }
                "--lessons" => {
                    let value = require_value(&mut args, "--lessons")?;
                    lessons = value
                        .parse::<u32>()
                        .map_err(|_| ArgsError::InvalidLessons { raw: value.clone() })?;
                }
                "--steps" => {
                    let value = require_value(&mut args, "--steps")?;
                    let parsed = value
                        .parse::<u32>()
                        .map_err(|_| ArgsError::InvalidSteps { raw: value.clone() })?;
                    if parsed == 0 {
                        return Err(ArgsError::InvalidSteps { raw: value });
                    }
                    steps_per_lesson = parsed;
                }
                "--legacy-ids" => {
                    legacy_ids = true;
                }
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        Ok(Self {
            db_url,
            module_id,
            lessons,
            steps_per_lesson,
            legacy_ids,
        })
    }
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p storage --bin seed -- [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --db <sqlite_url>         SQLite URL (default: sqlite:dev.sqlite3)");
    eprintln!("  --module-id <id>          Module id to upsert (default: 1)");
    eprintln!("  --lessons <n>             Number of lessons to upsert (default: 3)");
    eprintln!("  --steps <n>               Steps per lesson, at least 1 (default: 5)");
    eprintln!("  --legacy-ids              Also map a legacy id for each lesson");
    eprintln!("  -h, --help                Show this help");
    eprintln!();
    eprintln!("Environment (same as flags):");
    eprintln!("  PROGRESS_DB_URL, PROGRESS_MODULE_ID, PROGRESS_LESSONS, PROGRESS_STEPS");
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse().map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    let repo = SqliteRepository::connect(&args.db_url).await?;
    repo.migrate().await?;

    repo.upsert_module(args.module_id, true).await?;

    // Lesson ids are derived from the module id so repeated runs against
    // different modules never collide.
    let base = args.module_id.value() * 1_000;
    for i in 0..args.lessons {
        let lesson_id = LessonId::new(base + u64::from(i) + 1);
        let lesson = LessonRef::new(lesson_id, i, args.steps_per_lesson);
        repo.upsert_lesson(args.module_id, &lesson, true).await?;

        if args.legacy_ids {
            let legacy = LessonId::new(base + 900 + u64::from(i) + 1);
            repo.map_legacy_id(legacy, args.module_id, lesson_id).await?;
        }
    }

    println!(
        "seeded module {} with {} lessons ({} steps each){}",
        args.module_id,
        args.lessons,
        args.steps_per_lesson,
        if args.legacy_ids { ", legacy ids mapped" } else { "" }
    );
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if run().await.is_err() {
        std::process::exit(1);
    }
}
