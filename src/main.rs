use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use imgkit::config::Settings;
use imgkit::image::Image;
use imgkit::local::{DockerCli, LocalImage};
use imgkit::oci::registry::HttpRegistry;
use imgkit::remote::{AnonymousKeychain, DockerConfigKeychain, Keychain, RemoteImage};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "imgkit")]
#[command(about = "Edit container images in a local daemon or a registry")]
struct Cli {
    /// Operate on registry images instead of the local daemon
    #[arg(long, global = true)]
    remote: bool,

    /// Docker binary for the local backend
    #[arg(long, global = true, env = "IMGKIT_DOCKER")]
    docker: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print config and layers as JSON
    Inspect { image: String },

    /// Read a label, or set it and save
    Label {
        image: String,
        key: String,
        value: Option<String>,
    },

    /// Read an env var, or set it and save
    Env {
        image: String,
        key: String,
        value: Option<String>,
    },

    /// Put the image's application layers on top of a new base
    Rebase {
        image: String,
        /// Topmost layer of the current base
        #[arg(long)]
        base_top_layer: String,
        #[arg(long)]
        new_base: String,
        /// Save under this name instead
        #[arg(long)]
        tag: Option<String>,
    },

    /// Append uncompressed layer tarballs and save
    AddLayer {
        image: String,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

async fn open_image(name: &str, remote: bool, settings: &Settings) -> Result<Box<dyn Image>> {
    if remote {
        let registry = Arc::new(HttpRegistry::new(settings.insecure_registries.clone()));
        let keychain: Arc<dyn Keychain> = match &settings.docker_config_dir {
            Some(dir) => Arc::new(DockerConfigKeychain::new(dir)),
            None => Arc::new(AnonymousKeychain),
        };
        let image = RemoteImage::new(name, registry, keychain)
            .await
            .with_context(|| format!("resolve {}", name))?;
        Ok(Box::new(image))
    } else {
        let daemon = Arc::new(DockerCli::new(settings.docker_bin.clone()));
        let mut image = LocalImage::new(name, daemon)
            .await
            .with_context(|| format!("inspect {}", name))?;
        if let Some(dir) = &settings.temp_dir {
            image = image.with_temp_dir(dir);
        }
        Ok(Box::new(image))
    }
}

async fn save(image: &mut dyn Image) -> Result<()> {
    let id = image
        .save()
        .await
        .with_context(|| format!("save {}", image.name()))?;
    println!("{} {} {}", "✅".green(), image.name().bold(), id);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::from_env();
    if let Some(docker) = cli.docker.clone() {
        settings.docker_bin = docker;
    }
    settings.log_json |= cli.json_logs;
    if let Err(e) = imgkit::logging::init_logging(settings.log_json) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    match cli.command {
        Command::Inspect { image } => {
            let image = open_image(&image, cli.remote, &settings).await?;
            if !image.found() {
                anyhow::bail!("image '{}' does not exist", image.name());
            }
            let report = serde_json::json!({
                "name": image.name(),
                "backend": image.backend().to_string(),
                "config": image.config(),
                "layers": image.diff_ids(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Label { image, key, value } => {
            let mut image = open_image(&image, cli.remote, &settings).await?;
            match value {
                Some(value) => {
                    image.set_label(&key, &value)?;
                    save(image.as_mut()).await?;
                }
                None => println!("{}", image.label(&key)?),
            }
        }
        Command::Env { image, key, value } => {
            let mut image = open_image(&image, cli.remote, &settings).await?;
            match value {
                Some(value) => {
                    image.set_env(&key, &value)?;
                    save(image.as_mut()).await?;
                }
                None => println!("{}", image.env(&key)?),
            }
        }
        Command::Rebase {
            image,
            base_top_layer,
            new_base,
            tag,
        } => {
            let mut image = open_image(&image, cli.remote, &settings).await?;
            let new_base = open_image(&new_base, cli.remote, &settings).await?;
            println!(
                "{} Rebasing {} onto {}...",
                "🔄".cyan(),
                image.name(),
                new_base.name()
            );
            image
                .rebase(&base_top_layer, new_base.as_ref())
                .await
                .context("rebase")?;
            if let Some(tag) = tag {
                image.rename(&tag).await;
            }
            save(image.as_mut()).await?;
        }
        Command::AddLayer { image, paths } => {
            let mut image = open_image(&image, cli.remote, &settings).await?;
            for path in &paths {
                image
                    .add_layer(path)
                    .await
                    .with_context(|| format!("add layer {}", path.display()))?;
            }
            save(image.as_mut()).await?;
        }
    }

    Ok(())
}
