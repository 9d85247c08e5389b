use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use galleri_core::gateway::{AnonymousIdentity, JsonlMetadata, LocalStorage};
use galleri_core::{
    CollisionPolicy, CommandDecoder, GalleryViewModel, IntakePipeline, LoadOutcome, MediaFile, Options, Session,
};
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Parser)]
#[command(name = "galleri", version, about = "Upload photos into a dated gallery and page through it")]
struct Cli {
    /// Gallery directory (objects/ and metadata.jsonl live here)
    #[arg(short, long, global = true, default_value = "gallery")]
    root: PathBuf,

    /// Options file (JSON); flags below override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Date, rename, convert and store image files
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// What to do when a name is already taken
        #[arg(long, value_enum)]
        collision: Option<Collision>,

        /// Give up on a decode/store/register call after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// HEIC converter invoked as `<program> <input> <output>`
        #[arg(long)]
        decoder: Option<String>,
    },
    /// Print the gallery, newest first
    List {
        /// Number of pages to fetch (default: all)
        #[arg(long)]
        pages: Option<usize>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Collision {
    Fail,
    Rename,
}

impl From<Collision> for CollisionPolicy {
    fn from(value: Collision) -> Self {
        match value {
            Collision::Fail => CollisionPolicy::Fail,
            Collision::Rename => CollisionPolicy::Rename,
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn open_session(root: &Path) -> anyhow::Result<Arc<Session>> {
    let storage = LocalStorage::open(root.join("objects")).await?;
    let metadata = JsonlMetadata::new(root.join("metadata.jsonl"));
    let session = Arc::new(Session::new(
        Arc::new(storage),
        Arc::new(metadata),
        Arc::new(AnonymousIdentity),
    ));
    session.sign_in().await?;
    Ok(session)
}

/// Fetch up to `pages` pages (all when `None`).
async fn load_pages(gallery: &GalleryViewModel, pages: Option<usize>) -> anyhow::Result<()> {
    let mut fetched = 0;
    while pages.map_or(true, |limit| fetched < limit) {
        match gallery.load_next_page().await? {
            LoadOutcome::Loaded { .. } => fetched += 1,
            LoadOutcome::Discarded => continue,
            LoadOutcome::Exhausted | LoadOutcome::InFlight => break,
        }
    }
    Ok(())
}

fn print_gallery(gallery: &GalleryViewModel) {
    for entry in gallery.current_entries() {
        println!("{}\t{}", entry.name, entry.url);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    init_logging();
    let cli = Cli::parse();

    let mut options = match &cli.config {
        Some(path) => Options::load(path)?,
        None => Options::default(),
    };
    let session = open_session(&cli.root).await?;

    match cli.command {
        Command::Upload {
            files,
            collision,
            timeout_secs,
            decoder,
        } => {
            if let Some(collision) = collision {
                options.collision = collision.into();
            }
            if timeout_secs.is_some() {
                options.step_timeout_secs = timeout_secs;
            }
            if let Some(decoder) = decoder {
                options.decoder_program = decoder;
            }

            let t_total = std::time::Instant::now();
            let mut media = Vec::with_capacity(files.len());
            for path in &files {
                media.push(MediaFile::read(path).await.with_context(|| format!("reading {}", path.display()))?);
            }

            let decoder = Arc::new(CommandDecoder::new(&options.decoder_program));
            let pipeline = IntakePipeline::new(session.clone(), decoder).with_options(options.clone());
            let pb = ProgressBar::new(media.len() as u64);
            pb.set_style(ProgressStyle::default_bar().template("[{bar:40}] {pos}/{len} {msg}")?);
            let report = pipeline
                .ingest_with_progress(media, &|stage, current, _total, message| {
                    if stage == "done" {
                        pb.finish_and_clear();
                    } else {
                        pb.set_position(current + 1);
                        pb.set_message(message.to_string());
                    }
                })
                .await?;

            for err in report.failed() {
                eprintln!("failed: {}", err);
            }
            let gallery = GalleryViewModel::new(session, &options);
            gallery.merge_uploaded(report.gallery_entries());
            print_gallery(&gallery);

            let stored = report.succeeded().count();
            eprintln!(
                "Done! {} stored, {} failed ({:.2}s)",
                stored,
                report.len() - stored,
                t_total.elapsed().as_secs_f64()
            );
            if stored < report.len() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::List { pages } => {
            let gallery = GalleryViewModel::new(session, &options);
            load_pages(&gallery, pages).await?;
            print_gallery(&gallery);
        }
    }

    Ok(ExitCode::SUCCESS)
}
