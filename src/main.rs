//! Briefly CLI - resilient page and PDF summarisation
//!
//! The application logic is contained in lib.rs, and this file is responsible
//! for parsing arguments and handling top-level errors.

use briefly::config::mask_secret;
use briefly::quota::Entitlement;
use briefly::{pdf, scraper, Config, DetailLevel, Language, SettingsPatch, Summarizer, SummaryResponse};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use colored::Colorize;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "briefly")]
#[command(author, version, about = "Summarise web pages and PDFs with hosted LLMs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarise a webpage by URL
    Summarise {
        /// URL to summarise
        url: String,
        /// Show raw extracted text instead of summary
        #[arg(long)]
        raw: bool,
    },
    /// Summarise a local PDF file
    Pdf {
        /// Path to the PDF
        file: PathBuf,
    },
    /// Show or clear recent summaries
    History {
        #[arg(long)]
        clear: bool,
    },
    /// Show or change settings
    Settings {
        #[command(subcommand)]
        action: Option<SettingsAction>,
    },
    /// Activate a premium key
    Activate { key: String },
    /// Fetch the premium key bought with an e-mail address and activate it
    Claim { email: String },
    /// Show plan and daily usage
    Status,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print current settings
    Show,
    /// Change one or more settings
    Set {
        /// Turn summaries on or off
        #[arg(long)]
        active: Option<bool>,
        #[arg(long)]
        auto_summary: Option<bool>,
        /// pt or en
        #[arg(long)]
        language: Option<Language>,
        /// short, medium, long or deep
        #[arg(long)]
        detail: Option<DetailLevel>,
        /// Tone of voice; an empty string clears it
        #[arg(long)]
        persona: Option<String>,
        /// Personal OpenRouter key; an empty string clears it
        #[arg(long)]
        openrouter_key: Option<String>,
        /// Personal Gemini key; an empty string clears it
        #[arg(long)]
        gemini_key: Option<String>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("briefly=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "briefly", &mut io::stdout());
        return Ok(());
    }

    init_logging();
    let config = Config::load()?;
    let app = Summarizer::open(config)?;
    let language = app.settings().language;

    match cli.command {
        Commands::Summarise { url, raw } => {
            println!("{} {}", "Fetching:".dimmed(), url);
            let content = scraper::fetch_content(&url).await?;
            if raw {
                let title = content.title.as_deref().unwrap_or("No title");
                println!("\n=== {} ===\n", title.bold());
                println!("{}", content.text);
                println!("\n--- Extracted {} characters ---", content.text.chars().count());
            } else {
                print_response(app.handle(content.into_request()).await);
            }
        }
        Commands::Pdf { file } => {
            let request = pdf::load_request(&file).await?;
            print_response(app.handle(request).await);
        }
        Commands::History { clear } => {
            if clear {
                app.clear_history()?;
                println!("{}", "History cleared.".green());
            } else {
                let items = app.history()?;
                if items.is_empty() {
                    println!("No summaries yet.");
                }
                for item in items {
                    println!(
                        "📄 {} ({}, {})",
                        item.title.bold(),
                        item.timestamp.format("%Y-%m-%d %H:%M"),
                        item.model.dimmed()
                    );
                    println!("   {}", item.url);
                    println!("   {} words\n", item.word_count);
                }
            }
        }
        Commands::Settings { action } => match action {
            None | Some(SettingsAction::Show) => print_settings(&app).await,
            Some(SettingsAction::Set {
                active,
                auto_summary,
                language,
                detail,
                persona,
                openrouter_key,
                gemini_key,
            }) => {
                app.update_settings(SettingsPatch {
                    extension_active: active,
                    auto_summary,
                    language,
                    detail_level: detail,
                    persona,
                    openrouter_key,
                    gemini_key,
                })?;
                println!("{}", "Settings saved.".green());
                print_settings(&app).await;
            }
        },
        Commands::Activate { key } => match app.apply_entitlement_key(&key).await {
            Ok(grant) => print_grant(&grant),
            Err(e) => eprintln!("{}", e.user_message(language).red()),
        },
        Commands::Claim { email } => match app.claim_entitlement(&email).await {
            Ok(grant) => print_grant(&grant),
            Err(e) => eprintln!("{}", e.user_message(language).red()),
        },
        Commands::Status => {
            let status = app.quota_status().await?;
            println!("Plan:   {}", status.plan.bold());
            println!("Usage:  {}/{}", status.used, status.limit);
            if let Some(until) = status.active_until {
                println!("Until:  {}", until.format("%Y-%m-%d"));
            }
            if let Some(key) = status.masked_key {
                println!("Key:    {}", key);
            }
            println!("Device: {}", status.device_id.dimmed());
            if let Some(model) = app.last_model_used()? {
                println!("Last model: {}", model);
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn print_grant(grant: &Entitlement) {
    let plan = grant.plan.as_deref().unwrap_or("premium");
    let key = grant.masked_key.as_deref().unwrap_or("-");
    println!("{} {} ({})", "Premium activated:".green(), plan.bold(), key);
    match grant.active_until {
        Some(until) if !grant.unlimited => println!("Valid until {}", until.format("%Y-%m-%d")),
        _ => println!("No expiry"),
    }
}

fn print_response(response: SummaryResponse) {
    match response {
        SummaryResponse::Success {
            summary,
            title,
            model_used,
        } => {
            println!("\n=== {} ===\n", title.bold());
            println!("{}", summary);
            println!("\n{} {}", "Model:".dimmed(), model_used.dimmed());
        }
        SummaryResponse::Failure { error } => eprintln!("{}", error.red()),
    }
}

async fn print_settings(app: &Summarizer) {
    let s = app.read_settings().await;
    let key = |k: &Option<String>| k.as_deref().map(mask_secret).unwrap_or_else(|| "(default)".into());
    println!("Active:         {}", s.extension_active);
    println!("Auto summary:   {}", s.auto_summary);
    println!("Language:       {}", s.language.as_str());
    println!("Detail level:   {}", s.detail_level.as_str());
    println!("Persona:        {}", s.persona.as_deref().unwrap_or("-"));
    println!("OpenRouter key: {}", key(&s.openrouter_key));
    println!("Gemini key:     {}", key(&s.gemini_key));
}
