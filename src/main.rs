use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info, LevelFilter};

use nbc::cli::{parse_bootloader, parse_filesystem, CacheCommands, Cli, Commands};
use nbc::engine::install::{EncryptionRequest, InstallOptions};
use nbc::engine::update::UpdateOptions;
use nbc::engine::CancelToken;
use nbc::report::{JsonLinesReporter, Reporter, TextReporter};
use nbc_api::error::{IoFailedError, NbcError, NbcResult, ReportError};
use osutils::adapter::HostAdapter;

fn main() -> ExitCode {
    let args = Cli::parse();

    let level = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.as_str()))
        .init();

    let reporter: Box<dyn Reporter> = if args.json {
        Box::new(JsonLinesReporter::stdout())
    } else {
        Box::new(TextReporter)
    };

    match run(args, reporter.as_ref()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            reporter.error(&e, "Operation failed");
            error!("{e:?}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(args: Cli, reporter: &dyn Reporter) -> NbcResult<()> {
    let adapter = HostAdapter;
    let token = CancelToken::new();

    match args.command {
        Commands::Install {
            image,
            device,
            filesystem,
            bootloader,
            kernel_args,
            passphrase_file,
            tpm2,
            staged,
        } => {
            let mut options = InstallOptions::new(image, device);
            options.filesystem = parse_filesystem(filesystem.as_deref())?;
            options.bootloader = parse_bootloader(bootloader.as_deref())?;
            options.kernel_args = kernel_args;
            options.use_staged = staged;
            if let Some(path) = passphrase_file {
                let passphrase = osutils::files::read_trimmed(&path)
                    .structured(IoFailedError::Read { path })?;
                options.encryption = Some(EncryptionRequest { passphrase, tpm2 });
            }
            nbc::engine::install::install(&adapter, reporter, token, &options)
        }

        Commands::Update { image, staged } => {
            let options = UpdateOptions {
                image_ref: image,
                use_staged: staged,
                ..Default::default()
            };
            nbc::engine::update::update(&adapter, reporter, token, &options).map(|_| ())
        }

        Commands::Status => status(),

        Commands::Rollback => nbc::engine::rollback::rollback(&adapter, Path::new("/")),

        Commands::BootConfirm => nbc::engine::rollback::boot_confirm(&adapter, Path::new("/")),

        Commands::Cache(command) => {
            let cache = nbc::cache::ImageCache::system();
            match command {
                CacheCommands::Download { image } => {
                    let cached = cache.download(&image)?;
                    info!(
                        "Cached {} as {} ({} bytes)",
                        cached.image_ref,
                        cached.image_digest.short(),
                        cached.size_bytes
                    );
                    Ok(())
                }
                CacheCommands::List => {
                    for image in cache.list()? {
                        println!(
                            "{}  {}  {}  {}",
                            image.image_digest.short(),
                            image.download_date.format("%Y-%m-%d"),
                            image.os_release_pretty_name.as_deref().unwrap_or("-"),
                            image.image_ref,
                        );
                    }
                    Ok(())
                }
                CacheCommands::Remove { key } => cache.remove(&key),
                CacheCommands::Clear => cache.clear(),
            }
        }
    }
}

fn status() -> NbcResult<()> {
    let config = nbc::datastore::ConfigStore::system().load()?;
    let pending = nbc::engine::update::read_reboot_marker(Path::new("/"))?;

    let rendered = serde_json::json!({
        "config": config,
        "reboot_pending": pending,
        "booted_marker": Path::new(nbc_api::constants::BOOTED_MARKER_PATH).exists(),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&rendered).map_err(|e| NbcError::with_source(
            IoFailedError::Read {
                path: nbc_api::constants::CONFIG_PATH.into()
            },
            e.into()
        ))?
    );
    Ok(())
}
