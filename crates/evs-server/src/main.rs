// crates/evs-server/src/main.rs
// evs - EverSession CLI

mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands, HookAction};
use evs::compact::AutoCompactOptions;
use evs::compact::plan::Amount;
use evs::config::EvsConfig;
use evs::context::Context;
use evs::fix::RemovalMode;
use evs::summarize::{HttpSummarizer, ModelTier, StubSummarizer, Summarizer};
use evs_types::AmountMode;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env from ~/.evs/.env only (never from CWD -- a malicious repo
    // could override API keys).
    if let Some(home) = dirs::home_dir()
        && let Err(e) = dotenvy::from_path(home.join(".evs/.env"))
    {
        tracing::debug!("Failed to load global .env file: {}", e);
    }

    let cli = Cli::parse();

    // Set up logging based on command
    match &cli.command {
        Commands::Hook { .. } => {
            // Hooks: configurable via EVS_HOOK_LOG_LEVEL (default: warn).
            // No timestamps or module targets -- hooks are ephemeral
            // processes whose stdout belongs to the agent.
            let hook_level =
                std::env::var("EVS_HOOK_LOG_LEVEL").unwrap_or_else(|_| "warn".to_string());
            let level = match hook_level.to_lowercase().as_str() {
                "off" => None,
                "error" => Some(Level::ERROR),
                "warn" => Some(Level::WARN),
                "info" => Some(Level::INFO),
                "debug" | "trace" => Some(Level::DEBUG),
                other => {
                    eprintln!("[evs] Unknown EVS_HOOK_LOG_LEVEL={other:?}, using warn");
                    Some(Level::WARN)
                }
            };
            if let Some(level) = level {
                let subscriber = FmtSubscriber::builder()
                    .with_max_level(level)
                    .with_writer(std::io::stderr)
                    .with_ansi(false)
                    .without_time()
                    .with_target(false)
                    .finish();
                let _ = tracing::subscriber::set_global_default(subscriber);
            }
        }
        command => {
            let log_level = match command {
                Commands::Supervise { .. } => Level::INFO,
                Commands::Status { .. } => Level::ERROR, // quiet for status bars
                _ => Level::WARN,
            };
            let subscriber = FmtSubscriber::builder()
                .with_max_level(log_level)
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
    }

    let ctx = Context::from_env();
    let config = EvsConfig::load(&ctx);

    let code = match cli.command {
        Commands::Compact {
            path,
            session,
            cwd,
            agent,
            amount,
            tokens,
            keep_last,
            tombstone,
            model,
            force,
            threshold,
        } => {
            cli::run_compact(
                &ctx,
                &config,
                cli::compact::CompactArgs {
                    path,
                    session,
                    cwd,
                    agent,
                    amount,
                    tokens,
                    keep_last,
                    tombstone,
                    model,
                    force,
                    threshold,
                },
            )
            .await?
        }
        Commands::Apply {
            path,
            session,
            agent,
        } => {
            cli::run_apply(
                &ctx,
                &config,
                cli::compact::ApplyArgs {
                    path,
                    session,
                    agent,
                },
            )
            .await?
        }
        Commands::Supervise {
            agent,
            reload,
            command,
        } => cli::run_supervise(&ctx, config, agent, reload, command).await?,
        Commands::Hook { action } => {
            // Hooks must NEVER exit with a non-zero code -- the agent
            // treats any non-zero exit as a hook error. Catch all errors
            // AND panics, log them to stderr, and emit `{}` on stdout so
            // the hook is silently ignored rather than flagged as broken.
            use std::io::Write;
            let hook_name = action.to_string();
            let result = tokio::task::spawn(run_hook(ctx, config, action)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    eprintln!("[evs] Hook error (non-fatal): {e:#}");
                    let _ = writeln!(std::io::stdout(), "{{}}");
                }
                Err(join_err) => {
                    eprintln!("[evs] Hook panic in {hook_name} (non-fatal): {join_err}");
                    let _ = writeln!(std::io::stdout(), "{{}}");
                }
            }
            0
        }
        Commands::Check { path, agent } => cli::run_check(path, agent)?,
        Commands::Fix {
            path,
            agent,
            write,
            insert_aborted_outputs,
            tombstone,
        } => {
            cli::run_fix(
                &ctx,
                &config,
                cli::inspect::FixArgs {
                    path,
                    agent,
                    write,
                    insert_aborted_outputs,
                    tombstone,
                },
            )
            .await?
        }
        Commands::Sessions {
            cwd,
            session,
            match_text,
            lookback,
        } => cli::run_sessions(&ctx, cwd, session, match_text, lookback)?,
        Commands::Status { cwd, session } => cli::run_status(&ctx, cwd, session)?,
        Commands::Fork { path, agent } => cli::run_fork(&ctx, path, agent)?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn run_hook(ctx: Context, config: EvsConfig, action: HookAction) -> Result<()> {
    use std::io::Write;
    let input = evs::hooks::read_hook_input()?;
    match action {
        HookAction::SessionStart => {
            evs::hooks::run_session_start(&ctx, &input).await?;
        }
        HookAction::Notify => {
            let amount = Amount::parse(&config.compact.amount, AmountMode::Messages)
                .unwrap_or(Amount::Messages(
                    evs::compact::plan::CountOrPercent::Percent(0.5),
                ));
            let model =
                ModelTier::from_str(&config.compact.model).unwrap_or(ModelTier::Haiku);
            let options = AutoCompactOptions {
                agent: None,
                transcript: None,
                session_id: None,
                cwd: std::env::current_dir()
                    .ok()
                    .map(|p| p.display().to_string()),
                amount,
                keep_last: false,
                removal_mode: RemovalMode::Delete,
                model,
                force: false,
                threshold_tokens: None,
            };
            // Without an API key the compact attempt fails and is
            // swallowed; the handshake side effects still happen.
            let summarizer: Box<dyn Summarizer> = match HttpSummarizer::from_env(ctx.env()) {
                Some(s) => Box::new(s),
                None => Box::new(StubSummarizer {
                    reply: String::new(),
                    fail_tiers: vec![],
                }),
            };
            evs::hooks::run_notify(&ctx, &config, summarizer.as_ref(), &input, &options).await?;
        }
    }
    let _ = writeln!(std::io::stdout(), "{{}}");
    Ok(())
}
