use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand};
use colored::Colorize;
use planttexts::catalog::{self, CatalogError};
use planttexts::chat::ChatService;
use planttexts::config::Config;
use planttexts::llm::{self, Completer};
use planttexts::reminders::{Dispatcher, ReminderWorker, RetryPolicy};
use planttexts::serve::{self, AppState};
use planttexts::sms::{self, InboundProcessor, SmsSender};
use planttexts::{care, onboarding, personality, CareTask, Database, UserSignup};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(name = "planttexts")]
#[command(author, version, about = "Houseplant care reminders over two-way SMS, in each plant's own voice")]
struct Cli {
    /// Config file (default: nearest planttexts.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP API and SMS webhook
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Also run the reminder worker in this process
        #[arg(long)]
        with_worker: bool,
    },

    /// Run the reminder worker
    Worker {
        /// Run a single scan and exit
        #[arg(long)]
        once: bool,
    },

    /// Import the species catalog (bundled dataset unless --file is given)
    Seed {
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Browse the species catalog
    Catalog {
        #[arg(short, long)]
        search: Option<String>,

        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// List the seven plant personalities
    Personalities,

    /// Manage users
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Manage a user's plants
    Plant {
        #[command(subcommand)]
        action: PlantAction,
    },

    /// Record care
    Care {
        #[command(subcommand)]
        action: CareAction,
    },

    /// Send a chat message to a plant
    Chat { plant_id: i32, message: String },

    /// Generate a care reminder for a plant
    Remind {
        plant_id: i32,

        /// watering, fertilizing, misting, repotting or pruning
        #[arg(short, long, default_value = "watering")]
        task: String,

        /// Deliver it through the configured SMS provider
        #[arg(long)]
        send: bool,
    },

    /// Simulate an inbound SMS
    Sms {
        /// Sender phone number
        #[arg(long)]
        from: String,

        message: String,
    },

    /// Show recent SMS traffic
    SmsLog {
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Generate shell completions
    Completion {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand, Debug)]
enum UserAction {
    /// Register a phone number
    Add {
        phone: String,

        #[arg(long)]
        email: Option<String>,

        #[arg(long, default_value = "UTC")]
        timezone: String,

        #[arg(long)]
        location: Option<String>,
    },
    /// Show a user by id or phone number
    Show { user: String },
    /// Soft-delete a user and their plants
    Delete { id: i32 },
}

#[derive(Subcommand, Debug)]
enum PlantAction {
    /// Add a catalog species to a user's plants
    Add {
        user_id: i32,
        catalog_id: i32,
        nickname: String,
    },
    /// List a user's plants and schedules
    List { user_id: i32 },
    /// Remove a plant
    Remove { plant_id: i32 },
}

#[derive(Subcommand, Debug)]
enum CareAction {
    /// Log completed care
    Log {
        plant_id: i32,
        task: String,

        #[arg(long)]
        notes: Option<String>,

        /// Completion time (RFC 3339), default now
        #[arg(long)]
        at: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    if let Command::Completion { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "planttexts", &mut std::io::stdout());
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(Config::load_from(path)?),
        None => Ok(Config::load()),
    }
}

/// Open the store; personalities are always upserted and the bundled
/// catalog is imported on first use
fn open_database(config: &Config) -> Result<Database, CatalogError> {
    let db = Database::open_with(
        &config.database.path,
        config.database.pool_size,
        config.database.busy_timeout_ms,
    )?;
    personality::seed_personalities(&db)?;
    if db.catalog_count()? == 0 {
        catalog::seed_catalog(&db, catalog::BUNDLED_SOURCE, catalog::bundled_seed())?;
    }
    Ok(db)
}

fn completer(config: &Config) -> Arc<dyn Completer> {
    Arc::from(llm::completer_from_config(config))
}

fn chat_service(db: &Database, config: &Config) -> ChatService {
    ChatService::new(db.clone(), completer(config), config.llm.max_tokens, config.llm.temperature)
}

fn reminder_worker(db: &Database, config: &Config) -> ReminderWorker {
    let sender: Arc<dyn SmsSender> = Arc::from(sms::sender_from_config(config, db));
    let dispatcher = Dispatcher::new(
        db.clone(),
        chat_service(db, config),
        sender,
        RetryPolicy::from_config(&config.reminders),
    );
    ReminderWorker::new(db.clone(), dispatcher, config.reminders.clone())
}

fn parse_task(raw: &str) -> Result<CareTask, String> {
    CareTask::parse(raw).ok_or_else(|| {
        let names: Vec<&str> = CareTask::ALL.iter().map(|t| t.as_str()).collect();
        format!("Unknown care task '{}'. Use one of: {}", raw, names.join(", "))
    })
}

fn run(cli: Cli) -> CliResult {
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Serve { port, with_worker } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            for warning in config.validate() {
                warn!("{}", warning);
            }
            let db = open_database(&config)?;

            if with_worker {
                let worker = reminder_worker(&db, &config);
                std::thread::spawn(move || worker.run_forever(Arc::new(AtomicBool::new(false))));
            }

            println!("\n{}", "planttexts".green().bold());
            println!("   API: http://{}{}", config.bind_addr(), config.server.api_prefix);
            println!("   SMS webhook: http://{}/api/sms/webhook", config.bind_addr());
            if !config.llm_enabled() {
                println!("   {} no OpenAI key, using canned messages", "Demo mode:".yellow());
            }
            println!("   Press Ctrl+C to stop\n");

            let state = AppState::new(db, config.clone(), completer(&config));
            serve::start_server(Arc::new(state))?;
        }

        Command::Worker { once } => {
            let db = open_database(&config)?;
            let worker = reminder_worker(&db, &config);
            if once {
                let report = worker.run_once(Utc::now())?;
                println!(
                    "{} scanned {}, sent {}, failed {}",
                    "Reminder tick:".cyan().bold(),
                    report.scanned,
                    report.sent.to_string().green(),
                    if report.failed > 0 { report.failed.to_string().red() } else { "0".normal() }
                );
            } else {
                worker.run_forever(Arc::new(AtomicBool::new(false)));
            }
        }

        Command::Seed { file } => {
            let db = Database::open_with(
                &config.database.path,
                config.database.pool_size,
                config.database.busy_timeout_ms,
            )?;
            let personalities = personality::seed_personalities(&db)?;
            let report = match file {
                Some(path) => {
                    let (contents, plants) = catalog::parse_seed_file(&path)?;
                    println!("   {} {} ({} records)", "Reading".green(), path.display(), plants.len());
                    catalog::seed_catalog(&db, &path.display().to_string(), &contents)?
                }
                None => catalog::seed_catalog(&db, catalog::BUNDLED_SOURCE, catalog::bundled_seed())?,
            };
            println!("   {} {} personalities", "Upserted".green(), personalities);
            if report.skipped {
                println!("   {} {} (already imported)", "Skipping".yellow(), report.source);
            } else {
                println!(
                    "   {} {} new species, {} already present",
                    "Imported".green(),
                    report.inserted,
                    report.existing
                );
            }
            println!("Catalog now has {} species", db.catalog_count()?);
        }

        Command::Catalog { search, limit } => {
            let db = open_database(&config)?;
            let entries = db.list_catalog(search.as_deref(), limit)?;
            if entries.is_empty() {
                println!("No species match.");
            }
            for entry in entries {
                let req = entry.requirements();
                println!(
                    "{:>4}  {:<26} {:<28} {:<8} water every {}d",
                    entry.id.to_string().cyan(),
                    entry.name.bold(),
                    entry.species.dimmed(),
                    entry.difficulty_level,
                    req.watering_frequency_days
                );
            }
        }

        Command::Personalities => {
            for profile in personality::all_profiles() {
                println!("{} - {}", profile.name.green().bold(), profile.description);
                println!("    traits: {}", profile.traits.join(", ").dimmed());
            }
        }

        Command::User { action } => {
            let db = open_database(&config)?;
            user_command(&db, &config, action)?;
        }

        Command::Plant { action } => {
            let db = open_database(&config)?;
            plant_command(&db, &config, action)?;
        }

        Command::Care { action } => {
            let db = open_database(&config)?;
            let CareAction::Log { plant_id, task, notes, at } = action;
            let task = parse_task(&task)?;
            let completed_at = match at {
                Some(raw) => Some(care::parse_timestamp(&raw).ok_or_else(|| format!("Invalid timestamp '{}'", raw))?),
                None => None,
            };
            let event = db.log_care_event(plant_id, task, "manual", notes.as_deref(), completed_at)?;
            println!("{} {} for plant {} at {}", "Logged".green(), task, plant_id, event.completed_at);
            if let Some(next) = db
                .list_schedules_for_plant(plant_id)?
                .into_iter()
                .find(|s| s.task() == Some(task))
            {
                println!("   next {} due {}", task, next.next_due.cyan());
            }
        }

        Command::Chat { plant_id, message } => {
            let db = open_database(&config)?;
            let reply = chat_service(&db, &config).respond(plant_id, &message)?;
            println!("{}", reply.text);
            println!("{}", format!("({:?})", reply.source).to_lowercase().dimmed());
        }

        Command::Remind { plant_id, task, send } => {
            let db = open_database(&config)?;
            let task = parse_task(&task)?;
            let chat = chat_service(&db, &config);
            let message = chat.generate_care_reminder(plant_id, task)?;
            println!("{}", message.text);
            if send {
                let plant = db.get_user_plant(plant_id)?;
                let user = db.get_user(plant.user_id)?;
                let sender = sms::sender_from_config(&config, &db);
                let receipt = sender.send(&user.phone, &message.text)?;
                sms::record_outbound(&db, &user.phone, &message.text, &receipt)?;
                chat.record_reminder(plant_id, &message.text)?;
                println!("{} via {} ({})", "Sent".green(), receipt.provider, receipt.message_id);
            }
        }

        Command::Sms { from, message } => {
            let db = open_database(&config)?;
            let processor = InboundProcessor::new(db.clone(), chat_service(&db, &config), &config.sms);
            let report = processor.process(&from, &message)?;
            println!("{} {}", "intent:".dimmed(), report.intent.kind());
            println!("{} {}", "outcome:".dimmed(), serde_json::to_string(&report.outcome)?);
            println!("{}", report.reply);
        }

        Command::SmsLog { limit } => {
            let db = open_database(&config)?;
            for row in db.recent_sms(limit)? {
                let arrow = if row.direction == "inbound" { "<-".cyan() } else { "->".green() };
                let status = if row.status == "failed" { row.status.red() } else { row.status.normal() };
                println!("{} {} {} [{}] {}", row.created_at.dimmed(), arrow, row.phone, status, row.body);
                if let Some(error) = row.error {
                    println!("      {}", error.red());
                }
            }
        }

        Command::Completion { .. } => {}
    }
    Ok(())
}

fn user_command(db: &Database, config: &Config, action: UserAction) -> CliResult {
    match action {
        UserAction::Add { phone, email, timezone, location } => {
            let signup = UserSignup {
                phone: sms::normalize_phone(&phone, &config.sms.default_country_code)?,
                email,
                timezone,
                location,
                ..UserSignup::with_phone(&phone)
            };
            let user = db.create_user(&signup)?;
            println!("{} user {} ({})", "Created".green(), user.id.to_string().cyan(), user.phone);
        }
        UserAction::Show { user } => {
            let looks_like_phone = user.starts_with('+') || user.chars().filter(char::is_ascii_digit).count() >= 7;
            let found = match user.parse::<i32>() {
                Ok(id) if !looks_like_phone => Some(db.get_user(id)?),
                _ => db.find_user_by_phone(&user, &config.sms.default_country_code)?,
            };
            let user = found.ok_or_else(|| format!("No user for '{}'", user))?;
            let status = if user.is_active { "active".green() } else { "opted out".yellow() };
            let verified = if user.phone_verified { "verified".green() } else { "unverified".yellow() };
            println!("{} {}  {}  [{}, {}]", "User".bold(), user.id.to_string().cyan(), user.phone, status, verified);
            println!("   timezone {}  tier {}", user.timezone, user.subscription_tier);
            for plant in db.list_plant_details(user.id)? {
                println!(
                    "   {:>4}  {} the {} ({})",
                    plant.plant.id.to_string().cyan(),
                    plant.plant.nickname.bold(),
                    plant.catalog.name,
                    plant.personality.name.dimmed()
                );
            }
        }
        UserAction::Delete { id } => {
            db.deactivate_user(id)?;
            println!("{} user {}", "Deleted".yellow(), id);
        }
    }
    Ok(())
}

fn plant_command(db: &Database, config: &Config, action: PlantAction) -> CliResult {
    match action {
        PlantAction::Add { user_id, catalog_id, nickname } => {
            let (plant, created) = db.add_user_plant(user_id, catalog_id, &nickname)?;
            let details = db.plant_details(plant.id)?;
            let verb = if created { "Added".green() } else { "Exists".yellow() };
            println!(
                "{} plant {} {} the {}, personality {}",
                verb,
                plant.id.to_string().cyan(),
                details.plant.nickname.bold(),
                details.catalog.name,
                details.personality.name.magenta()
            );
            if created {
                let sender = sms::sender_from_config(config, db);
                match onboarding::send_welcome(db, sender.as_ref(), user_id) {
                    Ok(outcome) if outcome.is_sent() => println!("{} welcome text to confirm the phone", "Sent".green()),
                    Ok(_) => {}
                    Err(e) => warn!(user_id, "welcome text failed: {}", e),
                }
            }
        }
        PlantAction::List { user_id } => {
            let plants = db.list_plant_details(user_id)?;
            if plants.is_empty() {
                println!("No plants yet.");
            }
            for plant in plants {
                println!(
                    "{:>4}  {} the {} ({})",
                    plant.plant.id.to_string().cyan(),
                    plant.plant.nickname.bold(),
                    plant.catalog.name,
                    plant.personality.name.dimmed()
                );
                for schedule in db.list_schedules_for_plant(plant.plant.id)? {
                    println!(
                        "        {:<12} every {:>3}d  next {}",
                        schedule.task_type,
                        schedule.frequency_days,
                        schedule.next_due
                    );
                }
            }
        }
        PlantAction::Remove { plant_id } => {
            db.remove_user_plant(plant_id)?;
            println!("{} plant {}", "Removed".yellow(), plant_id);
        }
    }
    Ok(())
}
