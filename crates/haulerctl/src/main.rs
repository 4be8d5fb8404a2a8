//! Command-line producer for hauler content stores.
//!
//! `haulerctl` adds images, charts, files and collections to a store, packs
//! the store into an archive for the trip across an air gap, loads it on the
//! other side and serves or copies it from there.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hauler::config::{DEFAULT_STORE_DIR, STORE_DIR_ENV, TEMP_DIR_ENV};
use hauler::{DirectoryTarget, Kind, RemoveOutcome, Store, StoreConfig, Target};
use hauler_content::signature;
use hauler_content::{
    BuildContext, ChartSource, Collection, CosignCli, Distribution, FileSource, ImageSource,
    PlatformSelector, Source,
};
use hauler_registry::{
    ClientConfig, DockerConfig, RegistryClient, RegistryTarget, RetryPolicy, ServeConfig,
};

/// haulerctl
#[derive(Debug, Parser)]
#[clap(name = "haulerctl", version)]
pub struct App {
    /// Operate on the store at this path
    #[clap(long, env = STORE_DIR_ENV, default_value = DEFAULT_STORE_DIR)]
    store: PathBuf,

    /// Stage adds, loads and downloads under this directory
    #[clap(long, env = TEMP_DIR_ENV)]
    tmp_dir: Option<PathBuf>,

    /// Reach this registry over plain HTTP (loopback hosts always are)
    #[clap(long = "plain-http", value_name = "HOST")]
    plain_http: Vec<String>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum AddCommand {
    /// Pull an image or image index from a registry
    Image {
        /// Image reference, e.g. rancher/k3s:v1.30.0-k3s1
        name: String,
        /// Pick one platform (os/arch[/variant]) out of an index
        #[clap(long)]
        platform: Option<String>,
        /// Also pull published cosign signatures, attestations and SBOMs
        #[clap(long)]
        signatures: bool,
    },
    /// Fetch a Helm chart
    Chart {
        /// Chart name, or a packaged chart when --repo is not given
        name: String,
        /// https:// chart repository or oci:// registry path
        #[clap(long)]
        repo: Option<String>,
        /// Chart version; the highest stable version by default
        #[clap(long)]
        version: Option<String>,
        /// Render the chart with helm and add the images it uses
        #[clap(long)]
        add_images: bool,
    },
    /// Store a local or remote file
    File {
        /// Path or http(s):// URL
        path: String,
        /// Store the file under this name
        #[clap(long)]
        name: Option<String>,
        /// Tag instead of latest
        #[clap(long)]
        tag: Option<String>,
    },
    /// Add a bundle of artifacts
    #[clap(subcommand)]
    Collection(CollectionCommand),
}

#[derive(Debug, Args)]
struct DistributionArgs {
    /// Release, e.g. v1.30.0+k3s1
    version: String,
    /// amd64, arm64 or arm
    #[clap(long, default_value = "amd64")]
    arch: String,
    /// Fetch release assets from a mirror instead of upstream
    #[clap(long)]
    base_url: Option<String>,
}

impl From<DistributionArgs> for Distribution {
    fn from(args: DistributionArgs) -> Self {
        Distribution {
            version: args.version,
            arch: args.arch,
            base_url: args.base_url,
        }
    }
}

#[derive(Debug, Subcommand)]
enum CollectionCommand {
    /// k3s binary, install script and images
    K3s(DistributionArgs),
    /// rke2 install script and images
    Rke2(DistributionArgs),
    /// Every image listed in a text file, one per line
    ImagesTxt {
        /// Path or http(s):// URL of the list
        url: String,
    },
}

#[derive(Debug, Args)]
struct KeyArgs {
    /// Cosign key file
    #[clap(long)]
    key: PathBuf,
    /// Password of the private key
    #[clap(long, env = "COSIGN_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    /// Path to the cosign binary
    #[clap(long, default_value = "cosign")]
    cosign: PathBuf,
}

impl KeyArgs {
    fn cosign(self) -> CosignCli {
        let mut cli = CosignCli::new(self.key);
        cli.binary = self.cosign;
        cli.password = self.password;
        cli
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Add content to the store
    #[clap(subcommand)]
    Add(AddCommand),
    /// List the store's index
    Info,
    /// Drop index entries whose reference contains MATCH
    Remove {
        #[clap(name = "MATCH")]
        matcher: String,
        /// Remove every match, even when there are several
        #[clap(long, short)]
        force: bool,
    },
    /// Delete blobs no index entry reaches
    #[clap(name = "gc")]
    GC,
    /// Verify every blob against its digest
    Fsck,
    /// Pack the store into an archive
    Save {
        /// Archive to write
        #[clap(default_value = "haul.tar.zst")]
        archive: PathBuf,
    },
    /// Merge an archive into the store
    Load {
        /// Archives to read
        #[clap(required = true)]
        archives: Vec<PathBuf>,
    },
    /// Serve the store as a read-only or read-write registry
    Serve {
        /// Listen address
        #[clap(long, default_value = "0.0.0.0:5000")]
        addr: SocketAddr,
        /// Reject pushes
        #[clap(long)]
        read_only: bool,
        /// Upload sessions older than this many hours are removed at startup
        #[clap(long, default_value_t = 24)]
        upload_ttl_hours: u64,
    },
    /// Push the store to registry://HOST or dir://PATH
    Copy {
        target: String,
    },
    /// Write the titled layers of one artifact into a directory
    Extract {
        reference: String,
        /// Output directory
        #[clap(long, short, default_value = ".")]
        output: PathBuf,
    },
    /// Sign an artifact in the store with cosign
    Sign {
        reference: String,
        #[clap(flatten)]
        key: KeyArgs,
    },
    /// Verify the cosign signatures of an artifact in the store
    Verify {
        reference: String,
        #[clap(flatten)]
        key: KeyArgs,
    },
}

/// Cancelled on the first Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, stopping");
                token.cancel();
            }
        }
    });
    token
}

fn registry_client(plain_http: &[String]) -> Result<RegistryClient> {
    let config = plain_http
        .iter()
        .fold(ClientConfig::default(), |config, host| config.with_plain_http(host));
    let credentials = DockerConfig::load_default()?;
    Ok(RegistryClient::new(config)?.with_credentials(Arc::new(credentials)))
}

fn source(cmd: AddCommand) -> Result<Source> {
    Ok(match cmd {
        AddCommand::Image {
            name,
            platform,
            signatures,
        } => {
            if let Some(platform) = &platform {
                platform.parse::<PlatformSelector>()?;
            }
            Source::Image(ImageSource {
                name,
                platform,
                signatures,
            })
        }
        AddCommand::Chart {
            name,
            repo,
            version,
            add_images,
        } => Source::Chart(ChartSource {
            name,
            repo,
            version,
            add_images,
        }),
        AddCommand::File { path, name, tag } => Source::File(FileSource { path, name, tag }),
        AddCommand::Collection(CollectionCommand::K3s(args)) => {
            Source::Collection(Collection::K3s(args.into()))
        }
        AddCommand::Collection(CollectionCommand::Rke2(args)) => {
            Source::Collection(Collection::Rke2(args.into()))
        }
        AddCommand::Collection(CollectionCommand::ImagesTxt { url }) => {
            Source::Collection(Collection::ImageTxt { url })
        }
    })
}

fn copy_target(target: &str, client: RegistryClient) -> Result<Box<dyn Target>> {
    if let Some(host) = target.strip_prefix("registry://") {
        return Ok(Box::new(RegistryTarget::new(client, host)));
    }
    if let Some(dir) = target.strip_prefix("dir://") {
        return Ok(Box::new(DirectoryTarget::new(dir)));
    }
    bail!("copy target must start with registry:// or dir://, got {target}")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = App::parse();
    let mut config = StoreConfig::new(&args.store);
    if let Some(dir) = &args.tmp_dir {
        config = config.with_tmp_dir(dir);
    }
    let store = Store::open(&config)
        .await
        .with_context(|| format!("Opening store at {}", args.store.display()))?;
    run(store, &config, args).await
}

async fn run(store: Store, config: &StoreConfig, args: App) -> Result<()> {
    match args.cmd {
        Command::Add(cmd) => {
            let ctx = BuildContext::new(registry_client(&args.plain_http)?, &config.tmp_dir())?
                .with_retry(RetryPolicy::default());
            let source = source(cmd)?;
            let added = hauler_content::add(&store, &ctx, &source, &interrupt_token()).await?;
            for descriptor in added {
                println!("{}", descriptor.digest);
            }
        }
        Command::Info => {
            for descriptor in store.list().await {
                let kind = descriptor
                    .kind_annotation()
                    .and_then(|k| k.parse::<Kind>().ok())
                    .map(|k| k.short_name())
                    .unwrap_or("unknown");
                println!(
                    "{}\t{kind}\t{}\t{}",
                    descriptor.ref_name().unwrap_or("-"),
                    descriptor.digest,
                    descriptor.size
                );
            }
        }
        Command::Remove { matcher, force } => match store.remove(&matcher, force).await? {
            RemoveOutcome::Removed(removed) => {
                for descriptor in removed {
                    println!("removed {}", descriptor.ref_name().unwrap_or("-"));
                }
            }
            RemoveOutcome::NeedsConfirmation(matches) => {
                for descriptor in &matches {
                    println!("{}", descriptor.ref_name().unwrap_or("-"));
                }
                bail!("{} entries match {matcher:?}; pass --force to remove them all", matches.len());
            }
        },
        Command::GC => {
            let result = store.gc().await?;
            println!(
                "removed {} blobs ({} bytes)",
                result.blobs_removed, result.bytes_removed
            );
        }
        Command::Fsck => {
            let report = store.fsck().await?;
            for digest in &report.corrupt {
                println!("corrupt {digest}");
            }
            for digest in &report.missing {
                println!("missing {digest}");
            }
            for digest in &report.size_mismatch {
                println!("size mismatch {digest}");
            }
            if !report.is_ok() {
                bail!("store at {} is damaged", store.root().display());
            }
            println!("checked {} blobs", report.checked);
        }
        Command::Save { archive } => {
            store.save(&archive).await?;
            info!("saved {} to {}", store.root().display(), archive.display());
        }
        Command::Load { archives } => {
            let cancel = interrupt_token();
            for archive in archives {
                let loaded = store.load(&archive, &cancel).await?;
                info!("loaded {loaded} entries from {}", archive.display());
            }
        }
        Command::Serve {
            addr,
            read_only,
            upload_ttl_hours,
        } => {
            let config = ServeConfig {
                addr,
                read_only,
                upload_ttl: Duration::from_secs(upload_ttl_hours * 3600),
                ..Default::default()
            };
            // The server listens for SIGINT and SIGTERM itself.
            hauler_registry::serve(Arc::new(store), &config, CancellationToken::new()).await?;
        }
        Command::Copy { target } => {
            let target = copy_target(&target, registry_client(&args.plain_http)?)?;
            let report = store.copy_with_cancel(target.as_ref(), &interrupt_token()).await?;
            println!(
                "copied {} manifests, {} blobs ({} already present)",
                report.manifests, report.blobs_copied, report.blobs_skipped
            );
        }
        Command::Extract { reference, output } => {
            for path in store.extract(&reference, &output).await? {
                println!("{}", path.display());
            }
        }
        Command::Sign { reference, key } => {
            let descriptor = signature::sign(&store, &reference, &key.cosign()).await?;
            println!("{}", descriptor.digest);
        }
        Command::Verify { reference, key } => {
            let verified = signature::verify(&store, &reference, &key.cosign()).await?;
            println!("verified {verified} signatures");
        }
    }
    Ok(())
}
