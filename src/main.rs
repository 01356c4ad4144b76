mod cli;
mod commands;
mod config;
mod engine;
mod manifest;
mod state;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use config::AppConfig;
use engine::{Engine, ExecuteOptions};
use std::io;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
    };

    if let Command::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "converge", &mut io::stdout());
        return Ok(());
    }

    let app_config = AppConfig::load(cli.config.as_deref())?;
    let engine = Engine::open(&app_config, cli.state.as_deref(), cli.remote.as_deref())?;

    match cli.command {
        Command::Plan(args) => commands::apply::plan(&ctx, &engine, &args.manifest),
        Command::Apply(args) => commands::apply::apply(
            &ctx,
            &engine,
            &args.manifest,
            &ExecuteOptions {
                dry_run: args.dry_run,
                jobs: args.jobs,
                yes: args.yes,
            },
        ),
        Command::Show(args) => commands::resource::show(&ctx, &engine, &args.identity()),
        Command::Refresh(args) => commands::resource::refresh(&ctx, &engine, &args.identity()),
        Command::Import(args) => commands::resource::import(&ctx, &engine, &args.identity()),
        Command::Delete(args) => {
            commands::resource::delete(&ctx, &engine, &args.resource.identity(), args.yes)
        }
        Command::Drift(args) => commands::resource::drift(&ctx, &engine, &args.identity()),
        Command::List => commands::resource::list(&ctx, &engine),
        Command::Schema { resource_type } => {
            commands::schema::run(&ctx, &engine, resource_type.as_deref())
        }
        Command::Completions { .. } => Ok(()),
    }
}
