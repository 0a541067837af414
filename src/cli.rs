use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::commands;

#[derive(Debug, Parser)]
#[command(name = "chat-relay")]
#[command(about = "Track delegated chats and notify OpenClaw sessions when they finish")]
#[command(version)]
pub struct Cli {
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the monitor in the foreground
    Daemon,
    /// Register a listener for a chat and make sure the daemon is running
    Track(TrackArgs),
    Status,
    Stop,
    /// Restart tracking after a fatal error
    Resume,
}

#[derive(Debug, Args)]
pub struct TrackArgs {
    #[arg(long)]
    pub chat_id: String,
    #[arg(long)]
    pub session_key: String,
    #[arg(long)]
    pub gateway_url: String,
    /// `env:VAR`, `config:dotted.path` or `literal:token`
    #[arg(long, default_value = "env:OPENCLAW_GATEWAY_TOKEN")]
    pub auth_source: String,
    #[arg(long, default_value = "Task")]
    pub label: String,
    #[arg(long)]
    pub no_spawn: bool,
}

fn print_report(report: &commands::CommandReport, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("command: {}", report.command);
    println!("ok: {}", report.ok);
    if !report.details.is_empty() {
        println!("details:");
        for detail in &report.details {
            println!("- {detail}");
        }
    }
    if !report.issues.is_empty() {
        println!("issues:");
        for issue in &report.issues {
            println!("- {issue}");
        }
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let report = match &cli.command {
        Command::Daemon => commands::relay_daemon::run()?,
        Command::Track(args) => commands::relay_track::run(&commands::relay_track::TrackOptions {
            chat_id: args.chat_id.clone(),
            session_key: args.session_key.clone(),
            gateway_url: args.gateway_url.clone(),
            auth_source: args.auth_source.clone(),
            label: args.label.clone(),
            no_spawn: args.no_spawn,
        })?,
        Command::Status => commands::relay_status::run()?,
        Command::Stop => commands::relay_stop::run()?,
        Command::Resume => commands::relay_resume::run()?,
    };

    print_report(&report, cli.json)?;

    if report.ok {
        Ok(())
    } else {
        std::process::exit(2);
    }
}
