//! chunkload command line driver

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use chunkload_core::UploadConfig;

mod commands;

use commands::UploadOptions;

fn cli() -> Command {
    Command::new("chunkload")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Resumable chunked uploads into a local media store")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .help("JSON configuration file")
                .global(true),
        )
        .arg(
            Arg::new("root")
                .long("root")
                .value_name("PATH")
                .help("Storage root, overrides the configuration file")
                .global(true),
        )
        .arg(
            Arg::new("max-file-size")
                .long("max-file-size")
                .value_name("BYTES")
                .value_parser(value_parser!(u64))
                .global(true),
        )
        .arg(
            Arg::new("merge-workers")
                .long("merge-workers")
                .value_name("N")
                .value_parser(value_parser!(usize))
                .global(true),
        )
        .arg(
            Arg::new("base-url")
                .long("base-url")
                .value_name("URL")
                .help("Prefix for published file URLs")
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_parser(["text", "json"])
                .default_value("text")
                .global(true),
        )
        .subcommand(
            Command::new("upload")
                .about("Upload a file in chunks and wait for it to be published")
                .arg(Arg::new("file").required(true).value_name("FILE"))
                .arg(Arg::new("folder").long("folder").value_name("ID"))
                .arg(
                    Arg::new("chunk-size")
                        .long("chunk-size")
                        .value_name("BYTES")
                        .value_parser(value_parser!(u64)),
                )
                .arg(
                    Arg::new("concurrency")
                        .long("concurrency")
                        .value_name("N")
                        .value_parser(value_parser!(usize))
                        .default_value("4"),
                )
                .arg(
                    Arg::new("digest")
                        .long("digest")
                        .help("Send the BLAKE3 digest so the merge is verified")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("shuffle")
                        .long("shuffle")
                        .help("Send chunks in random order")
                        .action(ArgAction::SetTrue),
                )
                .arg(Arg::new("uploader").long("uploader").value_name("ID")),
        )
        .subcommand(
            Command::new("check")
                .about("Look up a published file by name and size")
                .arg(Arg::new("name").required(true))
                .arg(Arg::new("size").required(true).value_parser(value_parser!(u64)))
                .arg(Arg::new("folder").long("folder").value_name("ID")),
        )
        .subcommand(
            Command::new("folder")
                .about("Create a folder")
                .arg(Arg::new("id").required(true))
                .arg(Arg::new("name").required(true)),
        )
        .subcommand(Command::new("files").about("List published files"))
}

fn init_logging(format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Configuration file (or defaults) with command line overrides applied
fn load_config(matches: &ArgMatches) -> Result<UploadConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => UploadConfig::from_json_file(path)
            .with_context(|| format!("failed to load configuration from {}", path))?,
        None => UploadConfig::default(),
    };

    if let Some(root) = matches.get_one::<String>("root") {
        config.root = PathBuf::from(root);
    }
    if let Some(max) = matches.get_one::<u64>("max-file-size") {
        config.max_file_size = *max;
    }
    if let Some(workers) = matches.get_one::<usize>("merge-workers") {
        config.merge_workers = *workers;
    }
    if let Some(base_url) = matches.get_one::<String>("base-url") {
        config.base_url = base_url.clone();
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let log_format = matches
        .get_one::<String>("log-format")
        .map(String::as_str)
        .unwrap_or("text");
    init_logging(log_format);

    let config = load_config(&matches)?;
    info!("Storage root: {}", config.root.display());
    let catalog = commands::open_catalog(&config)?;

    let output = match matches.subcommand() {
        Some(("upload", sub)) => {
            let options = UploadOptions {
                path: PathBuf::from(sub.get_one::<String>("file").context("missing FILE")?),
                folder_id: sub.get_one::<String>("folder").cloned(),
                chunk_size: sub.get_one::<u64>("chunk-size").copied(),
                concurrency: sub.get_one::<usize>("concurrency").copied().unwrap_or(4),
                send_digest: sub.get_flag("digest"),
                shuffle: sub.get_flag("shuffle"),
                uploader_id: sub.get_one::<String>("uploader").cloned(),
            };
            commands::upload(config, catalog, options).await?
        }
        Some(("check", sub)) => {
            let name = sub.get_one::<String>("name").context("missing NAME")?;
            let size = *sub.get_one::<u64>("size").context("missing SIZE")?;
            let folder = sub.get_one::<String>("folder").map(String::as_str);
            commands::check(config, catalog, name, size, folder).await?
        }
        Some(("folder", sub)) => {
            let id = sub.get_one::<String>("id").context("missing ID")?;
            let name = sub.get_one::<String>("name").context("missing NAME")?;
            commands::create_folder(&catalog, id, name)?
        }
        Some(("files", _)) => commands::list_files(&catalog)?,
        _ => bail!("no subcommand given"),
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        cli().debug_assert();
    }

    #[test]
    fn test_overrides_apply_on_top_of_defaults() {
        let matches = cli()
            .try_get_matches_from([
                "chunkload",
                "--root",
                "/tmp/media",
                "--merge-workers",
                "3",
                "files",
            ])
            .unwrap();
        let config = load_config(&matches).unwrap();

        assert_eq!(config.root, PathBuf::from("/tmp/media"));
        assert_eq!(config.merge_workers, 3);
        assert_eq!(config.chunk_size, UploadConfig::default().chunk_size);
    }

    #[test]
    fn test_config_file_is_loaded() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("chunkload.json");
        std::fs::write(&path, r#"{"chunk_size": 1048576, "base_url": "https://cdn.test"}"#).unwrap();

        let matches = cli()
            .try_get_matches_from(["chunkload", "--config", path.to_str().unwrap(), "files"])
            .unwrap();
        let config = load_config(&matches).unwrap();

        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.base_url, "https://cdn.test");
        assert_eq!(config.upload_dir, "uploads");
    }

    #[test]
    fn test_invalid_overrides_are_rejected() {
        let matches = cli()
            .try_get_matches_from(["chunkload", "--merge-workers", "0", "files"])
            .unwrap();
        assert!(load_config(&matches).is_err());
    }
}
