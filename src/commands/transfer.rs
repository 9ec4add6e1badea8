//! Implementation of the download and upload commands.

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;

use crate::config::Config;

/// Arguments for the `download` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct DownloadArgs {
    /// The remote file to download.
    #[arg(value_name = "REMOTE")]
    pub remote: String,

    /// The local path to write to.
    #[arg(value_name = "LOCAL")]
    pub local: PathBuf,

    /// The system the file is on.
    ///
    /// Defaults to the `MACHINE` environment variable.
    #[arg(long, value_name = "NAME")]
    pub system: Option<String>,

    /// Leaves the object storage link valid and prints it.
    #[arg(long)]
    pub keep_link: bool,
}

/// Arguments for the `upload` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct UploadArgs {
    /// The local file to upload.
    #[arg(value_name = "LOCAL")]
    pub local: PathBuf,

    /// The remote destination.
    ///
    /// The target file for staged uploads and the target directory for
    /// direct uploads.
    #[arg(value_name = "REMOTE")]
    pub remote: String,

    /// The system to upload to.
    ///
    /// Defaults to the `MACHINE` environment variable.
    #[arg(long, value_name = "NAME")]
    pub system: Option<String>,

    /// Uploads directly instead of through the staging area.
    ///
    /// This is only suitable for small files.
    #[arg(long)]
    pub direct: bool,
}

/// Runs the `download` command.
pub async fn download(args: DownloadArgs, config: Config) -> Result<()> {
    let system = config.system(args.system)?;
    let client = config.client()?;

    let mut download = client.external_download(&system, &args.remote).await?;
    download
        .finish_download(&args.local)
        .await
        .with_context(|| format!("failed to download `{remote}`", remote = args.remote))?;

    if args.keep_link {
        println!("{}", download.object_storage_link().await?);
    } else {
        download.invalidate().await?;
    }

    Ok(())
}

/// Runs the `upload` command.
pub async fn upload(args: UploadArgs, config: Config) -> Result<()> {
    let system = config.system(args.system)?;
    let client = config.client()?;

    if args.direct {
        client.upload(&system, &args.local, &args.remote).await?;
        return Ok(());
    }

    let interval = config.firecrest.polling.task_interval();
    let upload = client
        .external_upload(&system, &args.local, &args.remote)
        .await?;
    upload.upload(interval).await?;
    upload
        .wait_finished(interval)
        .await
        .with_context(|| format!("failed to upload `{local}`", local = args.local.display()))
}
