//! Admin CLI for labeled volumes stored in a local fjall data directory.

use std::fs::{self, File};
use std::io::{BufReader, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use holo_labels::config::parse_block_size;
use holo_labels::{
    Checksum, Compression, FjallKv, LabelEngine, MergeOp, OrderedKv, SyncConfig, VersionId,
    VolumeConfig,
};
use holo_rle::{read_sparsevol, BlockRles, BlockSize, Label};
use serde::Serialize;
use tracing::info;

#[derive(Parser)]
#[command(name = "holo-labels")]
#[command(about = "Merge, split and inspect labels of a labeled volume", long_about = None)]
struct Args {
    /// Directory holding the fjall keyspace.
    #[arg(long, env = "HOLO_LABELS_DATA_DIR")]
    data_dir: PathBuf,

    /// Data instance name.
    #[arg(long, env = "HOLO_LABELS_INSTANCE", default_value = "segmentation")]
    instance: String,

    #[arg(long, env = "HOLO_LABELS_VERSION", default_value_t = 1)]
    version: VersionId,

    /// Block size as `N` or `XxYxZ`.
    #[arg(long, env = "HOLO_LABELS_BLOCK_SIZE", default_value = "32", value_parser = parse_block_size)]
    block_size: BlockSize,

    #[arg(long, env = "HOLO_LABELS_COMPRESSION", default_value = "zstd")]
    compression: Compression,

    #[arg(long, env = "HOLO_LABELS_CHECKSUM", default_value = "crc32")]
    checksum: Checksum,

    /// Number of dense-block sync workers. `0` keeps `SyncConfig::from_env`.
    #[arg(long, env = "HOLO_LABELS_SYNC_WORKERS", default_value_t = 0)]
    sync_workers: usize,

    /// How long to wait for dense-block propagation before giving up.
    #[arg(long, env = "HOLO_LABELS_QUIESCE_TIMEOUT_SECS", default_value_t = 60)]
    quiesce_timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store a sparse volume as `label` in both sparse and dense form.
    Put {
        #[arg(long)]
        label: Label,
        /// Sparse volume file.
        #[arg(long)]
        file: PathBuf,
    },
    /// Merge labels into a target label.
    Merge {
        #[arg(long)]
        target: Label,
        /// Comma-separated labels to fold into the target.
        #[arg(long, required = true, value_delimiter = ',')]
        merged: Vec<Label>,
    },
    /// Move the voxels of a sparse volume out of `label` into a new label.
    Split {
        #[arg(long)]
        label: Label,
        #[arg(long)]
        file: PathBuf,
    },
    /// Print the voxel count of a label.
    Size {
        #[arg(long)]
        label: Label,
    },
    /// Write a label's sparse volume to a file, or stdout.
    Sparsevol {
        #[arg(long)]
        label: Label,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct LabelReport {
    instance: String,
    version: VersionId,
    label: Label,
    voxels: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    split_from: Option<Label>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fjall=warn,lsm_tree=warn".into()),
        )
        .init();

    let args = Args::parse();
    run(args).await
}

async fn run(args: Args) -> anyhow::Result<()> {
    fs::create_dir_all(&args.data_dir).context("create data dir")?;
    let keyspace = Arc::new(
        fjall::Config::new(&args.data_dir)
            .open()
            .context("open fjall keyspace")?,
    );
    let kv: Arc<dyn OrderedKv> = Arc::new(FjallKv::open(keyspace.clone(), "labels")?);
    let volume = VolumeConfig {
        block_size: args.block_size,
        compression: args.compression,
        checksum: args.checksum,
    };
    let sync = SyncConfig::from_env().with_workers(args.sync_workers);
    let engine = LabelEngine::open(&args.instance, kv, volume, sync)?;
    let iv = engine.labels.ctx(args.version);
    let timeout = Duration::from_secs(args.quiesce_timeout_secs);

    let report = |label: Label, split_from: Option<Label>| -> anyhow::Result<()> {
        let voxels = engine.labels.label_size(&iv, label)?;
        let report = LabelReport {
            instance: args.instance.clone(),
            version: args.version,
            label,
            voxels,
            split_from,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    };

    match &args.command {
        Command::Put { label, file } => {
            let reader = BufReader::new(
                File::open(file).with_context(|| format!("open {}", file.display()))?,
            );
            let rles = read_sparsevol(reader)?;
            let blocks = BlockRles::partition(&rles, volume.block_size)?;
            engine.labels.write_label_vol(&iv, *label, &blocks)?;
            engine.blocks.paint(&iv, &blocks, *label)?;
            info!(%iv, label, blocks = blocks.len(), "stored label");
            report(*label, None)?;
        }
        Command::Merge { target, merged } => {
            engine.start()?;
            let op = MergeOp::new(*target, merged.iter().copied())?;
            engine.labels.merge_labels(args.version, op).await?;
            engine.quiesce(timeout).await?;
            engine.shutdown().await?;
            report(*target, None)?;
        }
        Command::Split { label, file } => {
            engine.start()?;
            let reader = BufReader::new(
                File::open(file).with_context(|| format!("open {}", file.display()))?,
            );
            let new_label = engine
                .labels
                .split_labels(args.version, *label, reader)
                .await?;
            engine.quiesce(timeout).await?;
            engine.shutdown().await?;
            report(new_label, Some(*label))?;
        }
        Command::Size { label } => report(*label, None)?,
        Command::Sparsevol { label, out } => {
            let Some(bytes) = engine.labels.get_sparsevol(&iv, *label)? else {
                anyhow::bail!("label {label} has no voxels in {iv}");
            };
            match out {
                Some(path) => {
                    fs::write(path, &bytes).with_context(|| format!("write {}", path.display()))?
                }
                None => std::io::stdout()
                    .lock()
                    .write_all(&bytes)
                    .context("write sparse volume to stdout")?,
            }
        }
    }

    keyspace
        .persist(fjall::PersistMode::SyncAll)
        .context("persist fjall keyspace")?;
    Ok(())
}
