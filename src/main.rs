use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use url_kitchen::build::{build, write_build_files};
use url_kitchen::cli::{Cli, Commands};
use url_kitchen::export::{cook_graph, export_graph};

fn init_tracing(verbose: bool) -> Result<()> {
    let default = if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env()?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    match cli.command {
        Commands::Build {
            project,
            out,
            base,
            no_versioning,
            versioning_method,
            sourcemaps,
            json,
        } => {
            let mut config = project.config();
            if let Some(out) = out {
                config.build_directory = out;
            }
            if let Some(base) = base {
                config.base = base;
            }
            if no_versioning {
                config.versioning = false;
            }
            if let Some(method) = versioning_method {
                config.versioning_method = method;
            }
            if sourcemaps.is_some() {
                config.sourcemaps = sourcemaps;
            }
            let options = config.build_options(&project.path)?;
            let build_directory = options
                .build_directory_url
                .to_file_path()
                .map_err(|()| anyhow::anyhow!("build directory is not a local path"))?;
            let info = build(options).await?;
            let written = write_build_files(&build_directory, &info)
                .with_context(|| format!("cannot write {}", build_directory.display()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info.build_manifest)?);
            } else {
                info!(files = written, directory = %build_directory.display(), "build written");
                for path in info.build_file_contents.keys() {
                    println!("{path}");
                }
            }
        }
        Commands::Graph { project, format } => {
            let config = project.config();
            let options = config.build_options(&project.path)?;
            let kitchen = cook_graph(options.source_directory_url, &config.entry_points).await?;
            let result = export_graph(&kitchen.graph(), format)?;
            print!("{}", result.content);
            info!(urls = result.node_count, references = result.edge_count, "graph cooked");
        }
        #[cfg(feature = "web")]
        Commands::Dev { project, port } => {
            let config = project.config();
            let server = url_kitchen::dev::DevServer::new(config.dev_options(&project.path)?)?;
            let _watcher = url_kitchen::dev::watcher::watch_kitchen(server.kitchen())?;
            url_kitchen::dev::web::serve_on(server, port.unwrap_or(config.http_port)).await?;
        }
    }

    Ok(())
}

